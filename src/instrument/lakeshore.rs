//! Lakeshore multi-channel temperature monitor (218 series).
//!
//! `KRDG? 0` returns the kelvin reading of every input as a comma separated
//! list. The serial interface is fixed at 9600 baud, 7 data bits, odd
//! parity.

use super::{parse_float, Instrument};
use crate::error::{AppResult, DaqError};
use crate::measurement::Reading;
use crate::transport::{MockReply, SerialParity, SerialSettings};

const READ_TEMPERATURES: &str = "KRDG? 0";
const IDENTIFY: &str = "*IDN?";

/// Lakeshore temperature monitor: one temperature per input, all read at once.
#[derive(Debug, Clone, Copy)]
pub struct Lakeshore {
    inputs: usize,
}

impl Default for Lakeshore {
    fn default() -> Self {
        Self { inputs: 8 }
    }
}

impl Lakeshore {
    /// Monitor with `inputs` channels (at least one).
    pub fn with_inputs(inputs: usize) -> Self {
        Self { inputs: inputs.max(1) }
    }
}

impl Instrument for Lakeshore {
    fn model(&self) -> &str {
        "Lakeshore 218"
    }

    fn read_command(&self) -> &str {
        READ_TEMPERATURES
    }

    fn parse_reading(&self, response: &str) -> AppResult<Reading> {
        let values = response
            .trim()
            .split(',')
            .map(|field| parse_float(field, response))
            .collect::<AppResult<Vec<f64>>>()?;

        if values.len() != self.inputs {
            return Err(DaqError::Parse {
                response: response.to_string(),
                reason: format!("expected {} inputs, got {}", self.inputs, values.len()),
            });
        }
        Ok(Reading::Vector(
            values.into_iter().map(|v| f64::from(v as f32)).collect(),
        ))
    }

    fn channels(&self) -> usize {
        self.inputs
    }

    fn summary_label(&self) -> &str {
        "Temperatures"
    }

    fn trace_label(&self) -> &str {
        "Temperatures"
    }

    fn identify_command(&self) -> Option<&str> {
        Some(IDENTIFY)
    }

    fn default_serial(&self) -> SerialSettings {
        SerialSettings {
            baud_rate: 9600,
            data_bits: 7,
            parity: SerialParity::Odd,
            stop_bits: 1,
            ..SerialSettings::default()
        }
    }

    fn simulate(&self, command: &str, call: usize) -> MockReply {
        match command {
            READ_TEMPERATURES => {
                let fields: Vec<String> = (0..self.inputs)
                    .map(|input| {
                        let kelvin = 4.2 + 10.0 * input as f64 + ((call + input) as f64 * 0.2).sin() * 0.01;
                        format!("{kelvin:+08.3}")
                    })
                    .collect();
                MockReply::Respond(fields.join(","))
            }
            IDENTIFY => MockReply::Respond("LSCI,MODEL218S,SIMULATED,1.0".to_string()),
            other => MockReply::Fail(format!("Lakeshore does not understand '{other}'")),
        }
    }
}
