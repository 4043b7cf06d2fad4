//! VISA transport for GPIB/USB/Ethernet instruments
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "ASRL3::INSTR" (serial through the VISA layer)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
//!
//! VISA calls block, so each exchange runs on Tokio's blocking pool. The
//! native VISA timeout is set to the session's response timeout, so a read
//! abandoned by [`TransportSession`](super::TransportSession) returns and
//! releases the handle at about the same time. An exchange that only gets the
//! handle after its deadline is dropped without writing to the instrument.

use super::Transport;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::{Duration, Instant};

#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::attribute::AttrTmoValue;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

#[cfg(feature = "instrument_visa")]
struct VisaHandle {
    // Sessions are closed when their resource manager goes away, so both
    // live and die together.
    instrument: Instrument,
    _rm: DefaultRM,
}

/// VISA adapter for instrument communication
pub struct VisaTransport {
    resource: String,
    line_terminator: String,
    #[cfg(feature = "instrument_visa")]
    handle: Option<Arc<Mutex<VisaHandle>>>,
}

impl VisaTransport {
    /// Open a VISA session for `resource`.
    ///
    /// # Errors
    /// [`DaqError::Connection`] if the resource manager or the session cannot
    /// be opened, [`DaqError::FeatureNotEnabled`] without `instrument_visa`.
    #[cfg(feature = "instrument_visa")]
    pub fn open(resource: &str, line_terminator: &str, timeout: Duration) -> AppResult<Self> {
        use std::ffi::CString;

        let connection_error = |reason: String| DaqError::Connection {
            resource: resource.to_string(),
            reason,
        };

        let rm = DefaultRM::new().map_err(|e| connection_error(format!("VISA resource manager: {e}")))?;
        let c_string = CString::new(resource).map_err(|e| connection_error(e.to_string()))?;
        let visa_string = visa_rs::VisaString::from(c_string);
        let instrument = rm
            .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
            .map_err(|e| connection_error(e.to_string()))?;

        let timeout_ms = native_timeout_ms(timeout);
        let attr = AttrTmoValue::new_checked(timeout_ms)
            .ok_or_else(|| connection_error(format!("invalid VISA timeout {timeout_ms}ms")))?;
        instrument
            .set_attr(attr)
            .map_err(|e| connection_error(format!("Failed to set VISA timeout to {timeout_ms}ms: {e}")))?;

        debug!(resource, timeout_ms, "VISA session opened");

        Ok(Self {
            resource: resource.to_string(),
            line_terminator: line_terminator.to_string(),
            handle: Some(Arc::new(Mutex::new(VisaHandle {
                instrument,
                _rm: rm,
            }))),
        })
    }

    /// Always fails: built without `instrument_visa`.
    #[cfg(not(feature = "instrument_visa"))]
    pub fn open(_resource: &str, _line_terminator: &str, _timeout: Duration) -> AppResult<Self> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    /// The VISA resource string this transport was opened on.
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

/// VISA timeout attribute value for a response timeout, at least 1 ms.
#[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
fn native_timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX).max(1)
}

/// Whether an exchange queued for `deadline` should still go out at `now`.
#[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
fn still_wanted(deadline: Instant, now: Instant) -> bool {
    now < deadline
}

/// VISA reports a timeout as `VI_ERROR_TMO`; everything else is fatal.
#[cfg(feature = "instrument_visa")]
fn classify_io_error(err: &std::io::Error, command: &str, timeout: Duration) -> DaqError {
    let text = format!("{err:?}");
    if err.kind() == std::io::ErrorKind::TimedOut || text.contains("ErrorTmo") || text.contains("TMO") {
        DaqError::Timeout {
            command: command.to_string(),
            timeout,
        }
    } else {
        DaqError::Transport(format!("VISA I/O failed for '{command}': {err}"))
    }
}

#[async_trait]
impl Transport for VisaTransport {
    async fn query(&mut self, command: &str, timeout: Duration) -> AppResult<String> {
        #[cfg(feature = "instrument_visa")]
        {
            let handle = self.handle.as_ref().ok_or(DaqError::NotConnected)?.clone();
            let command_str = format!("{}{}", command, self.line_terminator);
            let command_for_log = command.to_string();
            let deadline = Instant::now() + timeout;

            tokio::task::spawn_blocking(move || -> AppResult<String> {
                use std::io::{BufRead, BufReader, Write};

                let guard = handle.blocking_lock();
                if !still_wanted(deadline, Instant::now()) {
                    debug!(command = %command_for_log, "Dropping VISA exchange queued past its deadline");
                    return Err(DaqError::Timeout {
                        command: command_for_log,
                        timeout,
                    });
                }
                (&guard.instrument)
                    .write_all(command_str.as_bytes())
                    .map_err(|e| classify_io_error(&e, &command_for_log, timeout))?;

                let mut reader = BufReader::new(&guard.instrument);
                let mut response = String::new();
                reader
                    .read_line(&mut response)
                    .map_err(|e| classify_io_error(&e, &command_for_log, timeout))?;

                let response = response.trim().to_string();
                debug!("VISA query '{}' -> '{}'", command_for_log.trim(), response);
                Ok(response)
            })
            .await
            .map_err(|e| DaqError::Transport(format!("VISA I/O task panicked: {e}")))?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = (command, timeout);
            Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.handle.take().is_some() {
                debug!(resource = %self.resource, "VISA session closed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "instrument_visa"))]
    #[test]
    fn test_disabled_feature_reports_itself() {
        let result = VisaTransport::open("GPIB0::12::INSTR", "\n", Duration::from_millis(800));
        assert!(matches!(result, Err(DaqError::FeatureNotEnabled(f)) if f == "instrument_visa"));
    }

    #[test]
    fn test_native_timeout_follows_response_timeout() {
        assert_eq!(native_timeout_ms(Duration::from_millis(800)), 800);
        assert_eq!(native_timeout_ms(Duration::from_secs(10)), 10_000);
        assert_eq!(native_timeout_ms(Duration::from_micros(10)), 1);
        assert_eq!(native_timeout_ms(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[test]
    fn test_exchange_past_deadline_is_not_sent() {
        let queued = Instant::now();
        let deadline = queued + Duration::from_millis(800);
        assert!(still_wanted(deadline, queued));
        assert!(!still_wanted(deadline, deadline));
        assert!(!still_wanted(deadline, deadline + Duration::from_millis(500)));
    }
}
