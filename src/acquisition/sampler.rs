//! The read capability handed to the sampling loop.

use crate::error::AppResult;
use crate::instrument::Instrument;
use crate::measurement::Reading;
use crate::transport::TransportSession;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Produces one reading per call.
///
/// Errors follow the transport rules: [`DaqError::Timeout`] is skipped by the
/// loop, anything else ends it.
///
/// [`DaqError::Timeout`]: crate::error::DaqError::Timeout
#[async_trait]
pub trait Sampler: Send + 'static {
    /// Take one reading.
    async fn read(&mut self) -> AppResult<Reading>;
}

/// Reads an instrument through a session it owns.
///
/// Owning the session is what keeps the foreground from querying while the
/// loop runs: the worker only gets it back from the controller's harvest.
#[derive(Debug)]
pub struct InstrumentReader {
    session: TransportSession,
    instrument: Arc<dyn Instrument>,
}

impl InstrumentReader {
    /// Reader that queries `instrument` over `session`.
    pub fn new(session: TransportSession, instrument: Arc<dyn Instrument>) -> Self {
        Self {
            session,
            instrument,
        }
    }

    /// Session for foreground queries between cycles.
    pub fn session_mut(&mut self) -> &mut TransportSession {
        &mut self.session
    }

    /// Instrument descriptor.
    pub fn instrument(&self) -> &Arc<dyn Instrument> {
        &self.instrument
    }

    /// Give the session back to the worker.
    pub fn into_session(self) -> TransportSession {
        self.session
    }
}

#[async_trait]
impl Sampler for InstrumentReader {
    async fn read(&mut self) -> AppResult<Reading> {
        let response = self.session.query(self.instrument.read_command()).await?;
        let reading = self.instrument.parse_reading(&response)?;
        debug!(resource = %self.session.resource(), %reading, "Sampled");
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;
    use crate::instrument::Gp370;
    use crate::transport::{MockReply, MockTransportFactory, TransportParams};

    #[tokio::test]
    async fn test_reader_parses_through_instrument() {
        let factory = MockTransportFactory::scripted(vec![
            MockReply::Respond("4.5E-08".into()),
            MockReply::Respond("not a number".into()),
        ]);
        let session = TransportSession::open(&factory, "sim", &TransportParams::default())
            .await
            .unwrap();
        let mut reader = InstrumentReader::new(session, Arc::new(Gp370));

        let first = reader.read().await.unwrap();
        assert!(matches!(first, Reading::Scalar(p) if (p - 4.5e-8).abs() < 1e-12));
        assert!(matches!(reader.read().await, Err(DaqError::Parse { .. })));
        assert_eq!(factory.stats().commands(), vec!["DS IG", "DS IG"]);
    }
}
