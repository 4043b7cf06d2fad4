//! Time source for the sampling loop.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic clock plus sleep, injected so timing can be controlled in tests.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Tokio's clock. Honours `tokio::time::pause`, so tests using
/// `#[tokio::test(start_paused = true)]` run the loop in virtual time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
