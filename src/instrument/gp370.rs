//! Granville-Phillips 370 Stabil-Ion gauge controller.
//!
//! `DS IG` asks for the ion gauge pressure; the controller answers with one
//! number in scientific notation, e.g. `1.23E-07`. Values are stored as
//! single precision like the rest of the traces.

use super::{parse_float, Instrument};
use crate::error::{AppResult, DaqError};
use crate::measurement::Reading;
use crate::transport::MockReply;

const READ_PRESSURE: &str = "DS IG";

/// Granville-Phillips 370 ion gauge: one pressure per read.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gp370;

impl Instrument for Gp370 {
    fn model(&self) -> &str {
        "Granville-Phillips 370"
    }

    fn read_command(&self) -> &str {
        READ_PRESSURE
    }

    fn parse_reading(&self, response: &str) -> AppResult<Reading> {
        let trimmed = response.trim();
        if trimmed.is_empty() {
            return Err(DaqError::Parse {
                response: response.to_string(),
                reason: "empty response".to_string(),
            });
        }
        let pressure = parse_float(trimmed, response)? as f32;
        Ok(Reading::Scalar(f64::from(pressure)))
    }

    fn summary_label(&self) -> &str {
        "Pressure"
    }

    fn trace_label(&self) -> &str {
        "Pressures"
    }

    fn simulate(&self, command: &str, call: usize) -> MockReply {
        if command != READ_PRESSURE {
            return MockReply::Fail(format!("GP370 does not understand '{command}'"));
        }
        let drift = (call as f64 * 0.3).sin() * 0.05;
        MockReply::Respond(format!("{:.2E}", 2.0e-7 * (1.0 + drift)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_scientific_notation() {
        let reading = Gp370.parse_reading("1.23E-07\r\n").unwrap();
        match reading {
            Reading::Scalar(p) => assert!((p - 1.23e-7).abs() < 1e-12),
            other => panic!("expected scalar, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            Gp370.parse_reading("IG OFF"),
            Err(DaqError::Parse { .. })
        ));
        assert!(Gp370.parse_reading("   ").is_err());
    }

    #[test]
    fn test_simulated_answer_parses() {
        let MockReply::Respond(line) = Gp370.simulate(READ_PRESSURE, 3) else {
            panic!("simulator should answer the pressure query");
        };
        assert!(Gp370.parse_reading(&line).is_ok());
        assert!(matches!(Gp370.simulate("*IDN?", 0), MockReply::Fail(_)));
    }
}
