//! Instrument descriptors.
//!
//! An [`Instrument`] knows how to ask a device for its current value and how
//! to decode the answer. It carries no connection state: the worker owns the
//! transport and hands the descriptor to the sampling loop, so adding a new
//! device type means adding one small descriptor, not another worker.

pub mod gp370;
pub mod lakeshore;

pub use gp370::Gp370;
pub use lakeshore::Lakeshore;

use crate::error::{AppResult, DaqError};
use crate::measurement::Reading;
use crate::transport::{MockReply, MockTransportFactory, SerialSettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Command syntax and response decoding for one instrument model.
pub trait Instrument: Send + Sync + fmt::Debug {
    /// Human readable model name.
    fn model(&self) -> &str;

    /// Query whose answer is the instrument's current value.
    fn read_command(&self) -> &str;

    /// Decode the answer to [`read_command`](Self::read_command).
    fn parse_reading(&self, response: &str) -> AppResult<Reading>;

    /// Number of values in one reading.
    fn channels(&self) -> usize {
        1
    }

    /// Dataset name of the `[initial, final]` summary.
    fn summary_label(&self) -> &str;

    /// Dataset name of the time series under the shared traces group.
    fn trace_label(&self) -> &str;

    /// Identification query, if the instrument answers one.
    fn identify_command(&self) -> Option<&str> {
        None
    }

    /// Factory framing used when a device config gives none.
    fn default_serial(&self) -> SerialSettings {
        SerialSettings::default()
    }

    /// Plausible answer for dry runs without hardware.
    fn simulate(&self, command: &str, call: usize) -> MockReply;
}

/// Instrument models this crate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    /// Granville-Phillips 370 Stabil-Ion vacuum gauge controller.
    Gp370,
    /// Lakeshore multi-channel temperature monitor.
    Lakeshore,
}

impl InstrumentKind {
    /// Descriptor for this model with factory defaults.
    pub fn build(self) -> Arc<dyn Instrument> {
        match self {
            InstrumentKind::Gp370 => Arc::new(Gp370),
            InstrumentKind::Lakeshore => Arc::new(Lakeshore::default()),
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentKind::Gp370 => write!(f, "gp370"),
            InstrumentKind::Lakeshore => write!(f, "lakeshore"),
        }
    }
}

/// A mock transport factory that answers like `instrument` would.
pub fn simulator(instrument: Arc<dyn Instrument>) -> MockTransportFactory {
    MockTransportFactory::new(move |command, call| instrument.simulate(command, call))
}

/// Parse one float field of an instrument response.
pub(crate) fn parse_float(field: &str, response: &str) -> AppResult<f64> {
    field.trim().parse::<f64>().map_err(|e| DaqError::Parse {
        response: response.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_builds_matching_model() {
        assert_eq!(InstrumentKind::Gp370.build().read_command(), "DS IG");
        assert_eq!(InstrumentKind::Lakeshore.build().read_command(), "KRDG? 0");
    }

    #[test]
    fn test_kind_round_trips_through_serde() {
        let kind: InstrumentKind = serde_json::from_str("\"lakeshore\"").unwrap();
        assert_eq!(kind, InstrumentKind::Lakeshore);
        assert_eq!(kind.to_string(), "lakeshore");
    }

    #[test]
    fn test_parse_float_reports_response() {
        let err = parse_float("abc", "abc\r\n").unwrap_err();
        assert!(matches!(err, DaqError::Parse { response, .. } if response == "abc\r\n"));
    }
}
