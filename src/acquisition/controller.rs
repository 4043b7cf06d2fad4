//! Background polling controller.
//!
//! Runs a fixed-interval sampling loop next to the worker and hands back an
//! ordered [`TimeSeries`] when told to stop.
//!
//! ```text
//!            start()                    stop() ok / abort()
//!   Idle ──────────────▶ Running ───────────────────────────▶ Idle
//!                           │                                  ▲
//!                           │ stop() timed out                 │ abort()
//!                           ▼                                  │
//!                      StopRequested ──────────────────────────┘
//! ```
//!
//! The stop handshake is one [`CancellationToken`] and one `oneshot` result
//! channel. The sampler (and the transport session inside it) travels into
//! the task at `start` and comes back in the [`Harvest`], so the caller never
//! holds it while the loop does.

use super::clock::{Clock, TokioClock};
use super::sampler::Sampler;
use crate::error::{AppResult, DaqError};
use crate::measurement::TimeSeries;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument as _};

/// How long [`PollingAcquisitionController::abort`] waits for the loop to
/// hand its sampler back before killing the task.
pub const DEFAULT_ABORT_GRACE: Duration = Duration::from_secs(1);

/// Observable controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No sampling task exists.
    Idle,
    /// The sampling task owns the sampler and is polling.
    Running,
    /// A stop timed out; only [`PollingAcquisitionController::abort`] leaves this state.
    StopRequested,
}

/// What a successful stop returns: the sampler, ready for foreground use
/// again, and everything it collected.
#[derive(Debug)]
pub struct Harvest<S> {
    /// The sampler handed back by the loop, session still open.
    pub sampler: S,
    /// Samples in acquisition order, timed from the cycle start.
    pub series: TimeSeries,
}

struct SamplingOutcome<S> {
    sampler: S,
    series: TimeSeries,
    fault: Option<DaqError>,
}

struct ActiveLoop<S> {
    cancel: CancellationToken,
    result_rx: oneshot::Receiver<SamplingOutcome<S>>,
    handle: JoinHandle<()>,
}

enum Phase<S> {
    Idle,
    Running(ActiveLoop<S>),
    StopRequested(ActiveLoop<S>),
}

/// Owns at most one sampling task at a time.
pub struct PollingAcquisitionController<S: Sampler, C: Clock = TokioClock> {
    name: String,
    clock: Arc<C>,
    abort_grace: Duration,
    phase: Phase<S>,
    reclaimed: Option<S>,
}

impl<S: Sampler> PollingAcquisitionController<S, TokioClock> {
    /// Idle controller for device `name` on the Tokio clock.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Arc::new(TokioClock))
    }
}

impl<S: Sampler, C: Clock> PollingAcquisitionController<S, C> {
    /// Idle controller that timestamps and sleeps through `clock`.
    pub fn with_clock(name: impl Into<String>, clock: Arc<C>) -> Self {
        Self {
            name: name.into(),
            clock,
            abort_grace: DEFAULT_ABORT_GRACE,
            phase: Phase::Idle,
            reclaimed: None,
        }
    }

    /// Replace [`DEFAULT_ABORT_GRACE`].
    #[must_use]
    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    /// Current state, derived from whether a task is held.
    pub fn state(&self) -> AcquisitionState {
        match self.phase {
            Phase::Idle => AcquisitionState::Idle,
            Phase::Running(_) => AcquisitionState::Running,
            Phase::StopRequested(_) => AcquisitionState::StopRequested,
        }
    }

    /// Clock shared with the sampling task.
    pub fn clock(&self) -> &Arc<C> {
        &self.clock
    }

    /// Spawn the sampling loop. Timestamps are measured from `start_time`.
    ///
    /// A sampler that cannot be started is kept for [`reclaim`](Self::reclaim)
    /// rather than dropped, so its transport can still be closed.
    ///
    /// # Errors
    /// - [`DaqError::AlreadyRunning`] unless the controller is Idle
    /// - [`DaqError::Configuration`] for a zero poll interval
    pub fn start(&mut self, sampler: S, poll_interval: Duration, start_time: Instant) -> AppResult<()> {
        if !matches!(self.phase, Phase::Idle) {
            warn!(device = %self.name, state = ?self.state(), "Refusing to start a second sampling loop");
            self.stash(sampler);
            return Err(DaqError::AlreadyRunning);
        }
        if poll_interval.is_zero() {
            self.stash(sampler);
            return Err(DaqError::Configuration("poll interval must be > 0".to_string()));
        }

        let cancel = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel();
        let span = info_span!("sampling", device = %self.name);
        let handle = tokio::spawn(
            sampling_loop(
                sampler,
                Arc::clone(&self.clock),
                poll_interval,
                start_time,
                cancel.clone(),
                result_tx,
            )
            .instrument(span),
        );

        debug!(device = %self.name, ?poll_interval, "Sampling loop started");
        self.phase = Phase::Running(ActiveLoop {
            cancel,
            result_rx,
            handle,
        });
        Ok(())
    }

    /// Signal the loop to finish and wait up to `timeout` for its result.
    ///
    /// Returns `Ok(None)` straight away when nothing is running.
    ///
    /// # Errors
    /// - [`DaqError::StopTimeout`] if the loop did not report in time; the
    ///   controller stays in `StopRequested` until [`abort`](Self::abort)
    /// - [`DaqError::SamplingFailed`] if the loop ended on a fatal read error;
    ///   the sampler is kept for [`reclaim`](Self::reclaim)
    pub async fn stop(&mut self, timeout: Duration) -> AppResult<Option<Harvest<S>>> {
        let mut active = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => return Ok(None),
            Phase::Running(active) | Phase::StopRequested(active) => active,
        };

        active.cancel.cancel();
        match tokio::time::timeout(timeout, &mut active.result_rx).await {
            Ok(Ok(outcome)) => match outcome.fault {
                None => {
                    debug!(device = %self.name, samples = outcome.series.len(), "Sampling loop stopped");
                    Ok(Some(Harvest {
                        sampler: outcome.sampler,
                        series: outcome.series,
                    }))
                }
                Some(fault) => {
                    self.stash(outcome.sampler);
                    Err(DaqError::SamplingFailed(Box::new(fault)))
                }
            },
            Ok(Err(_closed)) => Err(DaqError::SamplingFailed(Box::new(DaqError::Transport(
                "sampling task ended without reporting a result".to_string(),
            )))),
            Err(_elapsed) => {
                warn!(device = %self.name, ?timeout, "Sampling loop did not acknowledge stop");
                self.phase = Phase::StopRequested(active);
                Err(DaqError::StopTimeout(timeout))
            }
        }
    }

    /// Tear down whatever is running and discard its data. Never fails.
    ///
    /// Waits at most the abort grace for the loop to return its sampler, then
    /// kills the task. Returns the sampler if one could be recovered.
    pub async fn abort(&mut self) -> Option<S> {
        let active = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => return self.reclaimed.take(),
            Phase::Running(active) | Phase::StopRequested(active) => active,
        };

        let ActiveLoop {
            cancel,
            mut result_rx,
            handle,
        } = active;
        cancel.cancel();

        match tokio::time::timeout(self.abort_grace, &mut result_rx).await {
            Ok(Ok(outcome)) => {
                info!(
                    device = %self.name,
                    discarded = outcome.series.len(),
                    "Acquisition aborted"
                );
                if self.reclaimed.is_some() {
                    warn!(device = %self.name, "Dropping a stale reclaimed sampler");
                }
                self.reclaimed = None;
                Some(outcome.sampler)
            }
            _ => {
                warn!(device = %self.name, grace = ?self.abort_grace, "Sampling task unresponsive, killing it");
                handle.abort();
                self.reclaimed.take()
            }
        }
    }

    /// Take back a sampler that a failed start or a faulted loop left behind.
    pub fn reclaim(&mut self) -> Option<S> {
        self.reclaimed.take()
    }

    fn stash(&mut self, sampler: S) {
        if self.reclaimed.replace(sampler).is_some() {
            warn!(device = %self.name, "Dropping a stale reclaimed sampler");
        }
    }
}

impl<S: Sampler, C: Clock> Drop for PollingAcquisitionController<S, C> {
    fn drop(&mut self) {
        if let Phase::Running(active) | Phase::StopRequested(active) = &self.phase {
            active.cancel.cancel();
            active.handle.abort();
        }
    }
}

async fn sampling_loop<S: Sampler, C: Clock>(
    mut sampler: S,
    clock: Arc<C>,
    poll_interval: Duration,
    start_time: Instant,
    cancel: CancellationToken,
    result_tx: oneshot::Sender<SamplingOutcome<S>>,
) {
    let mut series = TimeSeries::new();
    let mut fault = None;
    let mut skipped = 0usize;

    while !cancel.is_cancelled() {
        match sampler.read().await {
            Ok(value) => {
                let elapsed = clock.now().saturating_duration_since(start_time).as_secs_f64();
                if !series.push(elapsed, value) {
                    warn!(elapsed, "Dropping sample that does not advance the time base");
                }
            }
            Err(e) if e.is_recoverable() => {
                skipped += 1;
                debug!(error = %e, "No response, skipping sample");
            }
            Err(e) => {
                warn!(error = %e, samples = series.len(), "Fatal read error, ending sampling loop");
                fault = Some(e);
                break;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = clock.sleep(poll_interval) => {}
        }
    }

    info!(samples = series.len(), skipped, "Sampling loop finished");
    if result_tx
        .send(SamplingOutcome {
            sampler,
            series,
            fault,
        })
        .is_err()
    {
        debug!("Controller went away before collecting the result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Reading;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and answers with the call number.
    #[derive(Debug)]
    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Sampler for Counting {
        async fn read(&mut self) -> AppResult<Reading> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Reading::Scalar(n as f64))
        }
    }

    /// Never returns from `read`.
    #[derive(Debug)]
    struct Stuck;

    #[async_trait]
    impl Sampler for Stuck {
        async fn read(&mut self) -> AppResult<Reading> {
            futures::future::pending::<()>().await;
            Ok(Reading::Scalar(0.0))
        }
    }

    fn counting() -> (Counting, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Counting {
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_immediate() {
        let mut controller: PollingAcquisitionController<Counting> = PollingAcquisitionController::new("idle");
        let harvest = controller.stop(Duration::from_secs(1)).await.unwrap();
        assert!(harvest.is_none());
        assert_eq!(controller.state(), AcquisitionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_is_rejected() {
        let mut controller = PollingAcquisitionController::new("double");
        let (first, _) = counting();
        let (second, _) = counting();
        controller.start(first, Duration::from_millis(100), Instant::now()).unwrap();

        let err = controller
            .start(second, Duration::from_millis(100), Instant::now())
            .unwrap_err();
        assert!(matches!(err, DaqError::AlreadyRunning));
        assert_eq!(controller.state(), AcquisitionState::Running);
        assert!(controller.reclaim().is_some());

        let harvest = controller.stop(Duration::from_secs(1)).await.unwrap();
        assert!(harvest.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_rejected() {
        let mut controller = PollingAcquisitionController::new("zero");
        let (sampler, _) = counting();
        assert!(matches!(
            controller.start(sampler, Duration::ZERO, Instant::now()),
            Err(DaqError::Configuration(_))
        ));
        assert_eq!(controller.state(), AcquisitionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_sampler_times_out_then_aborts() {
        let mut controller =
            PollingAcquisitionController::new("stuck").with_abort_grace(Duration::from_millis(50));
        controller.start(Stuck, Duration::from_millis(100), Instant::now()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = controller.stop(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, DaqError::StopTimeout(_)));
        assert_eq!(controller.state(), AcquisitionState::StopRequested);

        assert!(matches!(
            controller.start(Stuck, Duration::from_millis(100), Instant::now()),
            Err(DaqError::AlreadyRunning)
        ));

        // The running sampler never comes back; abort returns the stashed one.
        let recovered = controller.abort().await;
        assert!(recovered.is_some());
        assert_eq!(controller.state(), AcquisitionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_returns_sampler_and_discards_data() {
        let mut controller = PollingAcquisitionController::new("abort");
        let (sampler, calls) = counting();
        controller.start(sampler, Duration::from_millis(100), Instant::now()).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        let recovered = controller.abort().await;
        assert!(recovered.is_some());
        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert!(controller.stop(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_are_ordered_from_start_time() {
        let mut controller = PollingAcquisitionController::new("ordered");
        let (sampler, _) = counting();
        let start = Instant::now();
        controller.start(sampler, Duration::from_millis(100), start).unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        let harvest = controller.stop(Duration::from_secs(1)).await.unwrap().unwrap();
        let times = harvest.series.times();
        assert!((10..=12).contains(&times.len()), "got {} samples", times.len());
        assert!(times[0] >= 0.0);
        assert!(times.windows(2).all(|w| w[1] > w[0]));
    }
}
