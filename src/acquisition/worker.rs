//! Device worker: one instrument driven through the host lifecycle.
//!
//! Manual mode talks to the instrument directly. Buffered mode takes an
//! initial reading, hands the session to the polling controller, and when the
//! experiment ends takes it back, reads a final value and stores the cycle.

use super::clock::{Clock, TokioClock};
use super::controller::PollingAcquisitionController;
use super::sampler::InstrumentReader;
use crate::config::DeviceConfig;
use crate::data::storage::DatasetSink;
use crate::error::{AppResult, DaqError};
use crate::instrument::Instrument;
use crate::measurement::{CycleRecord, Reading, TimeSeries};
use crate::transport::{TransportFactory, TransportParams, TransportSession};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Front panel values exchanged with the host. This crate's devices have no
/// outputs, so every map it returns is empty.
pub type FrontPanelValues = HashMap<String, f64>;

/// Lifecycle calls a control host makes on each device worker.
#[async_trait]
pub trait HostWorker: Send {
    /// Connect to the device.
    async fn init(&mut self) -> AppResult<()>;

    /// Apply front panel values. These devices have none, so nothing changes.
    async fn program_manual(&mut self, values: &FrontPanelValues) -> AppResult<FrontPanelValues>;

    /// Enter buffered mode for the shot at `shot_file`.
    async fn transition_to_buffered(
        &mut self,
        device_name: &str,
        shot_file: &Path,
        initial_values: &FrontPanelValues,
        fresh: bool,
    ) -> AppResult<FrontPanelValues>;

    /// Leave buffered mode and store the cycle.
    async fn transition_to_manual(&mut self) -> AppResult<bool>;

    /// Drop the running cycle without storing it.
    async fn abort_buffered(&mut self) -> AppResult<bool>;

    /// Undo a failed entry into buffered mode.
    async fn abort_transition_to_buffered(&mut self) -> AppResult<bool>;

    /// Abort anything running and release the device.
    async fn shutdown(&mut self) -> AppResult<()>;
}

/// Outcome of a manual connectivity check.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionCheck {
    /// Reading taken during the check.
    pub reading: Reading,
    /// Status label shown to the operator.
    pub status: String,
}

#[derive(Debug)]
struct ActiveCycle {
    device_name: String,
    shot_file: PathBuf,
    started_at: Instant,
    initial: Reading,
}

/// Generic worker for any [`Instrument`].
pub struct DeviceWorker<C: Clock = TokioClock> {
    config: DeviceConfig,
    instrument: Arc<dyn Instrument>,
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn DatasetSink>,
    session: Option<TransportSession>,
    controller: PollingAcquisitionController<InstrumentReader, C>,
    cycle: Option<ActiveCycle>,
}

impl DeviceWorker<TokioClock> {
    /// Worker on the Tokio clock.
    pub fn new(
        config: DeviceConfig,
        instrument: Arc<dyn Instrument>,
        factory: Arc<dyn TransportFactory>,
        sink: Arc<dyn DatasetSink>,
    ) -> Self {
        Self::with_clock(config, instrument, factory, sink, Arc::new(TokioClock))
    }
}

impl<C: Clock> DeviceWorker<C> {
    /// Worker whose cycles are timed by `clock`.
    pub fn with_clock(
        config: DeviceConfig,
        instrument: Arc<dyn Instrument>,
        factory: Arc<dyn TransportFactory>,
        sink: Arc<dyn DatasetSink>,
        clock: Arc<C>,
    ) -> Self {
        let controller =
            PollingAcquisitionController::with_clock(config.name.clone(), clock).with_abort_grace(config.abort_grace);
        Self {
            config,
            instrument,
            factory,
            sink,
            session: None,
            controller,
            cycle: None,
        }
    }

    /// Configured device name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Instrument descriptor.
    pub fn instrument(&self) -> &Arc<dyn Instrument> {
        &self.instrument
    }

    /// Device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Whether a buffered cycle is in progress.
    pub fn is_buffered(&self) -> bool {
        self.cycle.is_some()
    }

    /// Whether the worker currently holds an open session.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn params(&self) -> TransportParams {
        TransportParams {
            kind: self.config.transport,
            serial: self
                .config
                .serial
                .clone()
                .unwrap_or_else(|| self.instrument.default_serial()),
            timeout: self.config.response_timeout,
        }
    }

    async fn ensure_session(&mut self) -> AppResult<&mut TransportSession> {
        if self.session.is_none() {
            let session =
                TransportSession::open(self.factory.as_ref(), &self.config.resource, &self.params()).await?;
            info!(device = %self.config.name, resource = %self.config.resource, "Session opened");
            self.session = Some(session);
        }
        self.session.as_mut().ok_or(DaqError::NotConnected)
    }

    /// Close and forget the session; the next manual call reopens it.
    async fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!(device = %self.config.name, error = %e, "Ignoring close failure on a faulted session");
            }
        }
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        if let Some(cycle) = &self.cycle {
            return Err(DaqError::CycleActive(cycle.device_name.clone()));
        }
        let result = self.ensure_session().await?.query(command).await;
        if let Err(e) = &result {
            if !e.is_recoverable() {
                warn!(device = %self.config.name, command, error = %e, "Transport fault, dropping session");
                self.release_session().await;
            }
        }
        result
    }

    /// One reading in manual mode.
    ///
    /// # Errors
    /// [`DaqError::CycleActive`] while buffered, otherwise any transport or
    /// parse error.
    pub async fn read(&mut self) -> AppResult<Reading> {
        let command = self.instrument.read_command().to_string();
        let response = self.query(&command).await?;
        self.instrument.parse_reading(&response)
    }

    /// Ask the instrument to identify itself.
    pub async fn identify(&mut self) -> AppResult<String> {
        let command = self
            .instrument
            .identify_command()
            .ok_or_else(|| {
                DaqError::Configuration(format!("{} has no identification query", self.instrument.model()))
            })?
            .to_string();
        let response = self.query(&command).await?;
        Ok(response.trim().to_string())
    }

    /// Read once and report whether the device answered.
    pub async fn check_connection(&mut self) -> AppResult<ConnectionCheck> {
        let reading = self.read().await?;
        info!(device = %self.config.name, %reading, "Connection check passed");
        Ok(ConnectionCheck {
            reading,
            status: "Working!".to_string(),
        })
    }

    /// A manual read where a timeout yields the NaN sentinel.
    async fn read_or_sentinel(&mut self, point: &str) -> AppResult<Reading> {
        match self.read().await {
            Ok(reading) => Ok(reading),
            Err(e) if e.is_recoverable() => {
                warn!(device = %self.config.name, point, error = %e, "No response, recording NaN");
                Ok(Reading::missing(self.instrument.channels()))
            }
            Err(e) => Err(e),
        }
    }

    /// Tear down the running cycle and make sure a session is available again.
    async fn abort_cycle(&mut self) {
        let recovered = self.controller.abort().await;
        if let Some(cycle) = self.cycle.take() {
            info!(device = %cycle.device_name, shot = %cycle.shot_file.display(), "Cycle aborted");
        }
        match recovered {
            Some(reader) => self.session = Some(reader.into_session()),
            None if self.session.is_none() => {
                warn!(device = %self.config.name, "Session lost with the sampling task, reopening");
                if let Err(e) = self.ensure_session().await {
                    warn!(device = %self.config.name, error = %e, "Reopen failed, will retry on next use");
                }
            }
            None => {}
        }
    }
}

#[async_trait]
impl<C: Clock> HostWorker for DeviceWorker<C> {
    async fn init(&mut self) -> AppResult<()> {
        self.ensure_session().await?;
        Ok(())
    }

    async fn program_manual(&mut self, _values: &FrontPanelValues) -> AppResult<FrontPanelValues> {
        Ok(FrontPanelValues::new())
    }

    async fn transition_to_buffered(
        &mut self,
        device_name: &str,
        shot_file: &Path,
        _initial_values: &FrontPanelValues,
        fresh: bool,
    ) -> AppResult<FrontPanelValues> {
        if let Some(cycle) = &self.cycle {
            return Err(DaqError::CycleActive(cycle.device_name.clone()));
        }

        let initial = self.read_or_sentinel("initial").await?;
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                self.ensure_session().await?;
                self.session.take().ok_or(DaqError::NotConnected)?
            }
        };

        let started_at = self.controller.clock().now();
        let reader = InstrumentReader::new(session, Arc::clone(&self.instrument));
        if let Err(e) = self
            .controller
            .start(reader, self.config.poll_interval, started_at)
        {
            self.session = self.controller.reclaim().map(InstrumentReader::into_session);
            return Err(e);
        }

        info!(
            device = %device_name,
            shot = %shot_file.display(),
            %initial,
            fresh,
            poll_interval = ?self.config.poll_interval,
            "Buffered acquisition started"
        );
        self.cycle = Some(ActiveCycle {
            device_name: device_name.to_string(),
            shot_file: shot_file.to_path_buf(),
            started_at,
            initial,
        });
        Ok(FrontPanelValues::new())
    }

    async fn transition_to_manual(&mut self) -> AppResult<bool> {
        if self.cycle.is_none() {
            return Err(DaqError::NoActiveCycle);
        }

        let series = match self.controller.stop(self.config.stop_timeout).await {
            Ok(Some(harvest)) => {
                self.session = Some(harvest.sampler.into_session());
                harvest.series
            }
            Ok(None) => TimeSeries::new(),
            Err(e) => {
                warn!(device = %self.config.name, error = %e, "Stopping the sampling loop failed, aborting cycle");
                self.abort_cycle().await;
                if matches!(e, DaqError::SamplingFailed(_)) {
                    self.release_session().await;
                }
                return Err(e);
            }
        };

        let Some(cycle) = self.cycle.take() else {
            return Err(DaqError::NoActiveCycle);
        };
        let final_value = self.read_or_sentinel("final").await?;

        let record = CycleRecord {
            device_name: cycle.device_name,
            summary_label: self.instrument.summary_label().to_string(),
            trace_label: self.instrument.trace_label().to_string(),
            initial: cycle.initial,
            final_value,
            series,
        };
        let elapsed = self
            .controller
            .clock()
            .now()
            .saturating_duration_since(cycle.started_at);
        info!(
            device = %record.device_name,
            samples = record.series.len(),
            ?elapsed,
            "Buffered acquisition finished"
        );
        self.sink.store(&cycle.shot_file, &record).await?;
        Ok(true)
    }

    async fn abort_buffered(&mut self) -> AppResult<bool> {
        self.abort_cycle().await;
        Ok(true)
    }

    async fn abort_transition_to_buffered(&mut self) -> AppResult<bool> {
        self.abort_cycle().await;
        Ok(true)
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        if let Some(reader) = self.controller.abort().await {
            self.session = Some(reader.into_session());
        }
        self.cycle = None;
        if let Some(session) = self.session.take() {
            session.close().await?;
        }
        info!(device = %self.config.name, "Worker shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::data::storage::MemorySink;
    use crate::instrument::{Gp370, InstrumentKind, Lakeshore};
    use crate::transport::{MockReply, MockTransportFactory, TransportKind};
    use std::time::Duration;

    fn device(name: &str, kind: InstrumentKind) -> DeviceConfig {
        let mut config = DeviceConfig::new(name, kind, "sim");
        config.transport = TransportKind::Mock;
        config.poll_interval = Duration::from_millis(100);
        config
    }

    fn worker(
        factory: &MockTransportFactory,
        sink: &Arc<MemorySink>,
    ) -> DeviceWorker {
        DeviceWorker::new(
            device("gauge", InstrumentKind::Gp370),
            Arc::new(Gp370),
            Arc::new(factory.clone()),
            Arc::clone(sink) as Arc<dyn DatasetSink>,
        )
    }

    #[tokio::test]
    async fn test_program_manual_returns_empty() {
        let factory = MockTransportFactory::constant("1.0E-07");
        let sink = Arc::new(MemorySink::new());
        let mut worker = worker(&factory, &sink);
        worker.init().await.unwrap();
        let mut values = FrontPanelValues::new();
        values.insert("setpoint".to_string(), 1.0);
        assert!(worker.program_manual(&values).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_read_reopens_after_fault() {
        let factory = MockTransportFactory::scripted(vec![
            MockReply::Fail("cable pulled".into()),
            MockReply::Respond("2.0E-07".into()),
        ]);
        let sink = Arc::new(MemorySink::new());
        let mut worker = worker(&factory, &sink);
        worker.init().await.unwrap();

        assert!(matches!(worker.read().await, Err(DaqError::Transport(_))));
        assert!(!worker.is_connected());
        assert!(worker.read().await.is_ok());
        assert_eq!(factory.stats().opens(), 2);
    }

    #[tokio::test]
    async fn test_identify_needs_support() {
        let factory = MockTransportFactory::constant("1.0E-07");
        let sink = Arc::new(MemorySink::new());
        let mut worker = worker(&factory, &sink);
        assert!(matches!(worker.identify().await, Err(DaqError::Configuration(_))));

        let lakeshore = Arc::new(Lakeshore::default());
        let mut worker = DeviceWorker::new(
            device("cryostat", InstrumentKind::Lakeshore),
            lakeshore.clone(),
            Arc::new(crate::instrument::simulator(lakeshore)),
            sink,
        );
        assert!(worker.identify().await.unwrap().starts_with("LSCI"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_cycle_stores_record() {
        let factory = MockTransportFactory::constant("3.0E-07");
        let sink = Arc::new(MemorySink::new());
        let mut worker = worker(&factory, &sink);
        worker.init().await.unwrap();

        let shot = Path::new("shot_1.mem");
        worker
            .transition_to_buffered("gauge", shot, &FrontPanelValues::new(), true)
            .await
            .unwrap();
        assert!(worker.is_buffered());
        assert!(matches!(worker.read().await, Err(DaqError::CycleActive(_))));

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(worker.transition_to_manual().await.unwrap());
        assert!(!worker.is_buffered());

        let records = sink.records();
        assert_eq!(records.len(), 1);
        let (path, record) = &records[0];
        assert_eq!(path, shot);
        assert_eq!(record.summary_label, "Pressure");
        assert_eq!(record.trace_label, "Pressures");
        assert!(!record.series.is_empty());
        assert!(!record.final_value.is_missing());
    }

    #[tokio::test]
    async fn test_transition_to_manual_without_cycle() {
        let factory = MockTransportFactory::constant("3.0E-07");
        let sink = Arc::new(MemorySink::new());
        let mut worker = worker(&factory, &sink);
        assert!(matches!(
            worker.transition_to_manual().await,
            Err(DaqError::NoActiveCycle)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_once() {
        let factory = MockTransportFactory::constant("3.0E-07");
        let sink = Arc::new(MemorySink::new());
        let mut worker = worker(&factory, &sink);
        worker.init().await.unwrap();
        worker
            .transition_to_buffered("gauge", Path::new("s.mem"), &FrontPanelValues::new(), true)
            .await
            .unwrap();

        worker.shutdown().await.unwrap();
        worker.shutdown().await.unwrap();
        assert_eq!(factory.stats().closes(), 1);
        assert!(sink.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_initial_timeout_logged_and_recorded_as_nan() {
        let factory = MockTransportFactory::scripted(vec![MockReply::Timeout]);
        let sink = Arc::new(MemorySink::new());
        let mut worker = worker(&factory, &sink);

        worker
            .transition_to_buffered("gauge", Path::new("s.mem"), &FrontPanelValues::new(), false)
            .await
            .unwrap();
        assert!(logs_contain("No response, recording NaN"));

        worker.transition_to_manual().await.unwrap();
        let (_, record) = &sink.records()[0];
        assert!(record.initial.is_missing());
        assert!(record.series.is_empty());
    }
}
