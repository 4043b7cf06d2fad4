//! Serial transport for RS-232 / USB-serial instruments.
//!
//! Wraps the `serialport` crate. Serial I/O is blocking, so every exchange
//! runs on Tokio's blocking pool and the port lives behind an
//! `Arc<Mutex<..>>` only so it can cross into that thread.

use super::{SerialSettings, Transport};
#[cfg(feature = "instrument_serial")]
use super::SerialParity;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Poll granularity of the OS-level read; the overall deadline is enforced
/// in the read loop.
#[cfg(feature = "instrument_serial")]
const PORT_READ_SLICE: Duration = Duration::from_millis(50);

/// Serial adapter for RS-232 communication
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Line terminator for commands (e.g., "\r\n")
    line_terminator: String,

    /// Response line ending character (e.g., '\n')
    response_delimiter: char,

    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Open `port_name` with the given framing.
    ///
    /// # Errors
    /// [`DaqError::Connection`] if the OS refuses the port, or
    /// [`DaqError::FeatureNotEnabled`] without `instrument_serial`.
    #[cfg(feature = "instrument_serial")]
    pub fn open(port_name: &str, settings: &SerialSettings) -> AppResult<Self> {
        let port = serialport::new(port_name, settings.baud_rate)
            .data_bits(data_bits(settings.data_bits))
            .parity(parity(settings.parity))
            .stop_bits(stop_bits(settings.stop_bits))
            .timeout(PORT_READ_SLICE)
            .open()
            .map_err(|e| DaqError::Connection {
                resource: port_name.to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            port = port_name,
            baud = settings.baud_rate,
            data_bits = settings.data_bits,
            parity = ?settings.parity,
            "Serial port opened"
        );

        Ok(Self {
            port_name: port_name.to_string(),
            line_terminator: settings.line_terminator.clone(),
            response_delimiter: settings.response_delimiter,
            port: Some(Arc::new(Mutex::new(port))),
        })
    }

    /// Always fails: built without `instrument_serial`.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(_port_name: &str, _settings: &SerialSettings) -> AppResult<Self> {
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }

    /// Serial port path.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[cfg(feature = "instrument_serial")]
fn data_bits(bits: u8) -> serialport::DataBits {
    match bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    }
}

#[cfg(feature = "instrument_serial")]
fn parity(parity: SerialParity) -> serialport::Parity {
    match parity {
        SerialParity::None => serialport::Parity::None,
        SerialParity::Even => serialport::Parity::Even,
        SerialParity::Odd => serialport::Parity::Odd,
    }
}

#[cfg(feature = "instrument_serial")]
fn stop_bits(bits: u8) -> serialport::StopBits {
    if bits == 2 {
        serialport::StopBits::Two
    } else {
        serialport::StopBits::One
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn query(&mut self, command: &str, timeout: Duration) -> AppResult<String> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port.as_ref().ok_or(DaqError::NotConnected)?.clone();

            let command_str = format!("{}{}", command, self.line_terminator);
            let command_for_log = command.to_string();
            let delimiter = self.response_delimiter;

            // Execute blocking serial I/O on dedicated thread
            tokio::task::spawn_blocking(move || -> AppResult<String> {
                use std::io::{Read, Write};

                let mut port_guard = port.blocking_lock();

                // A reply that arrived after an earlier timeout must not be
                // mistaken for the answer to this command.
                port_guard
                    .clear(serialport::ClearBuffer::Input)
                    .map_err(|e| DaqError::Transport(format!("Failed to clear input: {e}")))?;

                port_guard
                    .write_all(command_str.as_bytes())
                    .and_then(|()| port_guard.flush())
                    .map_err(|e| DaqError::Transport(format!("Failed to write to serial port: {e}")))?;

                debug!("Sent serial command: {}", command_for_log.trim());

                let mut response = String::new();
                let mut buffer = [0u8; 1];
                let start = std::time::Instant::now();

                loop {
                    if start.elapsed() > timeout {
                        return Err(DaqError::Timeout {
                            command: command_for_log,
                            timeout,
                        });
                    }

                    match port_guard.read(&mut buffer) {
                        Ok(1) => {
                            let ch = buffer[0] as char;
                            response.push(ch);

                            if ch == delimiter {
                                break;
                            }
                        }
                        Ok(0) => {
                            return Err(DaqError::Transport("Unexpected EOF from serial port".to_string()));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                            // Port timeout is shorter than our overall timeout
                            continue;
                        }
                        Err(e) => {
                            return Err(DaqError::Transport(format!("Serial read error: {e}")));
                        }
                        Ok(_) => {
                            return Err(DaqError::Transport(
                                "Read into single-byte buffer returned more than one byte".to_string(),
                            ));
                        }
                    }
                }

                let response = response.trim().to_string();
                debug!("Received serial response: {}", response);
                Ok(response)
            })
            .await
            .map_err(|e| DaqError::Transport(format!("Serial I/O task panicked: {e}")))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (command, timeout);
            Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
        Ok(())
    }
}
