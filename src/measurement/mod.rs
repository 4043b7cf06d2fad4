//! Measurement data model.
//!
//! A [`Reading`] is one value returned by an instrument, a [`Sample`] pins a
//! reading to the time it was taken, and a [`TimeSeries`] is the ordered run
//! of samples collected during one buffered acquisition cycle.

pub mod reading;
pub mod series;

pub use reading::Reading;
pub use series::{CycleRecord, Sample, TimeSeries};
