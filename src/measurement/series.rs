use super::Reading;
use serde::{Deserialize, Serialize};

/// One observation taken by the sampling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the acquisition cycle started.
    pub elapsed: f64,
    /// What the instrument answered.
    pub value: Reading,
}

/// Samples of one acquisition cycle, in acquisition order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    samples: Vec<Sample>,
}

impl TimeSeries {
    /// Empty series.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample taken after every sample already in the series.
    ///
    /// Returns `false` and drops the sample if its timestamp is negative or
    /// does not advance past the last one.
    pub fn push(&mut self, elapsed: f64, value: Reading) -> bool {
        let advances = match self.samples.last() {
            Some(last) => elapsed > last.elapsed,
            None => elapsed >= 0.0,
        };
        if advances {
            self.samples.push(Sample { elapsed, value });
        }
        advances
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether nothing was sampled.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples in acquisition order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Iterate in acquisition order.
    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    /// Timestamps column.
    pub fn times(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.elapsed).collect()
    }

    /// Widest reading in the series, used to size table columns.
    pub fn width(&self) -> usize {
        self.samples
            .iter()
            .map(|s| s.value.width())
            .max()
            .unwrap_or(1)
    }
}

impl<'a> IntoIterator for &'a TimeSeries {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

/// Everything a storage sink needs to persist one finished cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Device that produced the record.
    pub device_name: String,
    /// Dataset name for the `[initial, final]` summary, e.g. `Pressure`.
    pub summary_label: String,
    /// Dataset name for the time series under the shared traces group.
    pub trace_label: String,
    /// Reading taken when the cycle started.
    pub initial: Reading,
    /// Reading taken after the loop stopped.
    #[serde(rename = "final")]
    pub final_value: Reading,
    /// Everything the loop sampled in between.
    pub series: TimeSeries,
}

impl CycleRecord {
    /// The two-element summary `[initial, final]`, one row per channel value.
    pub fn summary(&self) -> [&Reading; 2] {
        [&self.initial, &self.final_value]
    }
}
