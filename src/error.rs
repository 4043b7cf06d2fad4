//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the
//! transports, the polling controller, the device workers and the storage
//! sinks. Using the `thiserror` crate, it provides one place where the
//! recoverable/fatal split of the acquisition protocol is encoded.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the instrument resource could not be opened.
//! - **`Timeout`**: the instrument did not answer within the response timeout.
//!   This is the only recoverable transport condition: the polling loop skips
//!   the sample and one-shot reads substitute the NaN sentinel.
//! - **`Transport`** / **`Parse`**: any other fault on the wire, including a
//!   response that cannot be decoded. Fatal for the running cycle.
//! - **`AlreadyRunning`**, **`StopTimeout`**, **`SamplingFailed`**: state
//!   machine violations and failures of the background sampling task.
//! - **`Config`** / **`Configuration`**: figment load errors and semantic
//!   validation errors respectively.
//! - **`FeatureNotEnabled`**: a storage backend or transport was requested that
//!   was not compiled in.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! keeping `?` usable throughout the crate.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The resource could not be opened.
    #[error("Failed to open instrument resource '{resource}': {reason}")]
    Connection {
        /// Port path or VISA resource string.
        resource: String,
        /// What the backend reported.
        reason: String,
    },

    /// No reply within the response timeout. The only recoverable error.
    #[error("No response to '{command}' within {timeout:?}")]
    Timeout {
        /// Command that went unanswered.
        command: String,
        /// How long it waited.
        timeout: Duration,
    },

    /// I/O fault on an open session.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The reply did not have the expected shape.
    #[error("Failed to parse instrument response {response:?}: {reason}")]
    Parse {
        /// Raw reply.
        response: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Query on a closed session.
    #[error("Transport session is not open")]
    NotConnected,

    /// Start while a sampling loop exists.
    #[error("Acquisition is already running")]
    AlreadyRunning,

    /// The sampling loop did not hand back its result in time.
    #[error("Sampling task did not stop within {0:?}")]
    StopTimeout(Duration),

    /// The sampling loop ended on a fatal read error.
    #[error("Sampling loop terminated early: {0}")]
    SamplingFailed(#[source] Box<DaqError>),

    /// Cycle operation without a cycle.
    #[error("No acquisition cycle is active")]
    NoActiveCycle,

    /// Foreground use of a device while its cycle runs.
    #[error("Acquisition cycle already active for device '{0}'")]
    CycleActive(String),

    /// Writing a cycle to the shot failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend was compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Whether the polling loop may carry on after this error.
    ///
    /// Only a missing response is recoverable; the instrument may simply be
    /// busy. Everything else means the exchange is out of step and the cycle
    /// has to be torn down.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DaqError::Timeout { .. })
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
