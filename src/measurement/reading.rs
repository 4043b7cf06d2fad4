use serde::{Deserialize, Serialize};
use std::fmt;

/// One value returned by an instrument.
///
/// Pressure gauges answer with a single number, multi-channel temperature
/// monitors answer with a comma separated list. The width of a vector is
/// fixed per instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    /// Single-channel value.
    Scalar(f64),
    /// One value per channel.
    Vector(Vec<f64>),
}

impl Reading {
    /// The "missing value" marker for an instrument with `channels` outputs.
    ///
    /// Single-channel instruments get a scalar NaN so the stored summary keeps
    /// the same shape as a successful reading.
    pub fn missing(channels: usize) -> Self {
        if channels <= 1 {
            Reading::Scalar(f64::NAN)
        } else {
            Reading::Vector(vec![f64::NAN; channels])
        }
    }

    /// True when every channel is NaN.
    pub fn is_missing(&self) -> bool {
        match self {
            Reading::Scalar(v) => v.is_nan(),
            Reading::Vector(values) => values.iter().all(|v| v.is_nan()),
        }
    }

    /// Number of channels in this reading.
    pub fn width(&self) -> usize {
        match self {
            Reading::Scalar(_) => 1,
            Reading::Vector(values) => values.len(),
        }
    }

    /// Channel values as a slice, scalar readings yield one element.
    pub fn values(&self) -> &[f64] {
        match self {
            Reading::Scalar(v) => std::slice::from_ref(v),
            Reading::Vector(values) => values,
        }
    }

    /// Value of one channel, `None` if out of range.
    pub fn channel(&self, index: usize) -> Option<f64> {
        self.values().get(index).copied()
    }
}

impl From<f64> for Reading {
    fn from(value: f64) -> Self {
        Reading::Scalar(value)
    }
}

impl From<Vec<f64>> for Reading {
    fn from(values: Vec<f64>) -> Self {
        Reading::Vector(values)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Scalar(v) => write!(f, "{v:.2E}"),
            Reading::Vector(values) => {
                let parts: Vec<String> = values.iter().map(|v| format!("{v}")).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_matches_channel_count() {
        assert!(matches!(Reading::missing(1), Reading::Scalar(v) if v.is_nan()));
        let vector = Reading::missing(8);
        assert_eq!(vector.width(), 8);
        assert!(vector.is_missing());
    }

    #[test]
    fn test_partial_vector_is_not_missing() {
        let reading = Reading::Vector(vec![f64::NAN, 4.2]);
        assert!(!reading.is_missing());
        assert_eq!(reading.channel(1), Some(4.2));
        assert_eq!(reading.channel(2), None);
    }

    #[test]
    fn test_display_uses_scientific_notation_for_scalars() {
        assert_eq!(Reading::Scalar(1.5e-7).to_string(), "1.50E-7");
        assert_eq!(Reading::Vector(vec![1.0, 2.5]).to_string(), "[1, 2.5]");
    }
}
