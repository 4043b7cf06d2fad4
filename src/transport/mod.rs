//! Query/response transports.
//!
//! Every instrument read funnels through [`TransportSession::query`]. The
//! session owns one boxed [`Transport`] (serial port, VISA session or the
//! scripted mock) and enforces the response timeout, so the polling loop can
//! tell "the instrument said nothing" apart from "the link is broken".
//!
//! Backends are created through a [`TransportFactory`] so the worker can
//! reopen a session after a fatal fault without knowing which backend is in
//! use.

pub mod mock;
pub mod serial_adapter;
pub mod session;
pub mod visa_adapter;

pub use mock::{MockReply, MockTransport, MockTransportFactory};
pub use serial_adapter::SerialTransport;
pub use session::TransportSession;
pub use visa_adapter::VisaTransport;

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Low-level query primitive implemented by each backend.
///
/// Implementations report a missing response as [`DaqError::Timeout`] and
/// anything else as [`DaqError::Transport`]. The session applies its own
/// deadline on top, so a backend that cannot bound its reads is still safe.
#[async_trait]
pub trait Transport: Send {
    /// Write `command` plus the line terminator and read one response line.
    async fn query(&mut self, command: &str, timeout: Duration) -> AppResult<String>;

    /// Release the underlying resource.
    async fn close(&mut self) -> AppResult<()>;
}

/// Opens transports for a resource string.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open `resource` with `params`.
    async fn open(&self, resource: &str, params: &TransportParams) -> AppResult<Box<dyn Transport>>;
}

/// Which backend a device talks through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local serial port through `serialport`.
    #[default]
    Serial,
    /// VISA resource string through `visa-rs`.
    Visa,
    /// Scripted replies for tests and `--simulate`.
    Mock,
}

/// Parity modes for serial communication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Serial framing and line discipline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5 to 8)
    pub data_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Appended to every command.
    pub line_terminator: String,
    /// Last byte of a response.
    pub response_delimiter: char,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
            line_terminator: "\r\n".to_string(),
            response_delimiter: '\n',
        }
    }
}

impl SerialSettings {
    /// Check the framing is one a serial port can use.
    pub fn validate(&self) -> Result<(), String> {
        if self.baud_rate == 0 {
            return Err("baud_rate must be > 0".to_string());
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(format!("data_bits must be 5-8, got {}", self.data_bits));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(format!("stop_bits must be 1 or 2, got {}", self.stop_bits));
        }
        Ok(())
    }
}

/// Everything a factory needs besides the resource string.
#[derive(Debug, Clone)]
pub struct TransportParams {
    /// Backend to open.
    pub kind: TransportKind,
    /// Framing for serial backends; VISA uses only the terminator.
    pub serial: SerialSettings,
    /// Response timeout for every query.
    pub timeout: Duration,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            kind: TransportKind::Serial,
            serial: SerialSettings::default(),
            timeout: Duration::from_millis(800),
        }
    }
}

/// Opens serial ports and VISA sessions, whichever the params ask for.
///
/// Mock transports need a script and come from [`MockTransportFactory`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareTransportFactory;

#[async_trait]
impl TransportFactory for HardwareTransportFactory {
    async fn open(&self, resource: &str, params: &TransportParams) -> AppResult<Box<dyn Transport>> {
        match params.kind {
            TransportKind::Serial => {
                let transport = SerialTransport::open(resource, &params.serial)?;
                Ok(Box::new(transport))
            }
            TransportKind::Visa => {
                let transport = VisaTransport::open(resource, &params.serial.line_terminator, params.timeout)?;
                Ok(Box::new(transport))
            }
            TransportKind::Mock => Err(DaqError::Connection {
                resource: resource.to_string(),
                reason: "mock transports are created by MockTransportFactory".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_settings_validation() {
        assert!(SerialSettings::default().validate().is_ok());
        let seven_odd = SerialSettings {
            data_bits: 7,
            parity: SerialParity::Odd,
            ..Default::default()
        };
        assert!(seven_odd.validate().is_ok());
        let bad = SerialSettings {
            data_bits: 9,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_hardware_factory_refuses_mock_kind() {
        let params = TransportParams {
            kind: TransportKind::Mock,
            ..Default::default()
        };
        let result = HardwareTransportFactory.open("sim", &params).await;
        assert!(matches!(result, Err(DaqError::Connection { .. })));
    }
}
