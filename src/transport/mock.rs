//! Scripted transport for tests and dry runs.
//!
//! Replies are produced by a behaviour function that sees the command and a
//! call counter shared by every transport the factory opened, so "fail on
//! the third query" still holds across reconnects.

use super::{Transport, TransportFactory, TransportParams};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the simulated instrument does with one query.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// Answer with this line.
    Respond(String),
    /// Stay silent for the whole response timeout.
    Timeout,
    /// Stay silent for this long regardless of the timeout.
    Hang(Duration),
    /// Answer with this line after a delay.
    Slow(Duration, String),
    /// Fail with a non-timeout transport fault.
    Fail(String),
}

type Behavior = dyn Fn(&str, usize) -> MockReply + Send + Sync;

/// Counters shared between a factory and the transports it opened.
#[derive(Debug, Default)]
pub struct MockStats {
    opens: AtomicUsize,
    closes: AtomicUsize,
    queries: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

impl MockStats {
    /// Transports handed out by the factory.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Transports closed.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Queries issued across all transports.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Highest number of queries that were ever awaiting a reply at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

struct InFlight<'a>(&'a MockStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a MockStats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport whose replies come from a behaviour function.
pub struct MockTransport {
    behavior: Arc<Behavior>,
    stats: Arc<MockStats>,
    closed: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn query(&mut self, command: &str, timeout: Duration) -> AppResult<String> {
        if self.closed {
            return Err(DaqError::Transport("mock transport is closed".to_string()));
        }
        let _guard = InFlight::enter(&self.stats);
        let call = self.stats.queries.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut commands) = self.stats.commands.lock() {
            commands.push(command.to_string());
        }

        match (self.behavior)(command, call) {
            MockReply::Respond(line) => Ok(line),
            MockReply::Timeout => {
                tokio::time::sleep(timeout).await;
                Err(DaqError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
            MockReply::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Err(DaqError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
            MockReply::Slow(delay, line) => {
                tokio::time::sleep(delay).await;
                Ok(line)
            }
            MockReply::Fail(reason) => Err(DaqError::Transport(reason)),
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        if !self.closed {
            self.closed = true;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Opens [`MockTransport`]s that share one behaviour and one set of counters.
#[derive(Clone)]
pub struct MockTransportFactory {
    behavior: Arc<Behavior>,
    stats: Arc<MockStats>,
    failing_opens: Arc<AtomicUsize>,
}

impl MockTransportFactory {
    /// Replies computed from `(command, call_index)`; the index counts every
    /// query across all transports opened by this factory, starting at 0.
    pub fn new<F>(behavior: F) -> Self
    where
        F: Fn(&str, usize) -> MockReply + Send + Sync + 'static,
    {
        Self {
            behavior: Arc::new(behavior),
            stats: Arc::new(MockStats::default()),
            failing_opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replies taken in order from `replies`; once exhausted the instrument
    /// goes silent.
    pub fn scripted(replies: Vec<MockReply>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::new(move |_cmd, _n| {
            queue
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front())
                .unwrap_or(MockReply::Timeout)
        })
    }

    /// Always answer `line`.
    pub fn constant(line: impl Into<String>) -> Self {
        let line = line.into();
        Self::new(move |_cmd, _n| MockReply::Respond(line.clone()))
    }

    /// Make the next `count` calls to `open` fail.
    #[must_use]
    pub fn failing_opens(self, count: usize) -> Self {
        self.failing_opens.store(count, Ordering::SeqCst);
        self
    }

    /// Counters shared by every transport this factory opened.
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(&self, resource: &str, _params: &TransportParams) -> AppResult<Box<dyn Transport>> {
        let refused = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(DaqError::Connection {
                resource: resource.to_string(),
                reason: "simulated open failure".to_string(),
            });
        }
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransport {
            behavior: Arc::clone(&self.behavior),
            stats: Arc::clone(&self.stats),
            closed: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_then_silence() {
        let factory = MockTransportFactory::scripted(vec![
            MockReply::Respond("1".into()),
            MockReply::Fail("boom".into()),
        ]);
        let mut transport = factory.open("sim", &TransportParams::default()).await.unwrap();
        let timeout = Duration::from_millis(5);

        assert_eq!(transport.query("A", timeout).await.unwrap(), "1");
        assert!(matches!(
            transport.query("B", timeout).await,
            Err(DaqError::Transport(_))
        ));
        assert!(matches!(
            transport.query("C", timeout).await,
            Err(DaqError::Timeout { .. })
        ));
        assert_eq!(factory.stats().commands(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_call_index_spans_reopens() {
        let factory = MockTransportFactory::new(|_cmd, n| MockReply::Respond(n.to_string()));
        let params = TransportParams::default();
        let mut first = factory.open("sim", &params).await.unwrap();
        assert_eq!(first.query("X", params.timeout).await.unwrap(), "0");
        first.close().await.unwrap();

        let mut second = factory.open("sim", &params).await.unwrap();
        assert_eq!(second.query("X", params.timeout).await.unwrap(), "1");
        assert_eq!(factory.stats().opens(), 2);
        assert_eq!(factory.stats().closes(), 1);
    }

    #[tokio::test]
    async fn test_failing_opens_recover() {
        let factory = MockTransportFactory::constant("ok").failing_opens(1);
        let params = TransportParams::default();
        assert!(factory.open("sim", &params).await.is_err());
        assert!(factory.open("sim", &params).await.is_ok());
    }
}
