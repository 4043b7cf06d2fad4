//! Configuration system using Figment.
//!
//! Configuration is layered from:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`config/daq_poll.toml` unless another path is given)
//! 3. Environment variables prefixed with `DAQPOLL_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! DAQPOLL_APPLICATION__LOG_LEVEL=debug
//! DAQPOLL_STORAGE__OUTPUT_DIR=/data/shots
//! DAQPOLL_STORAGE__BACKEND=hdf5
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "Lab 2 slow monitors"
//! log_level = "info"
//!
//! [storage]
//! backend = "csv"
//! output_dir = "./data"
//!
//! [[devices]]
//! name = "ion_gauge"
//! kind = "gp370"
//! resource = "/dev/ttyUSB0"
//! response_timeout = "800ms"
//! poll_interval = "500ms"
//!
//! [[devices]]
//! name = "cryostat"
//! kind = "lakeshore"
//! resource = "/dev/ttyUSB1"
//! serial = { baud_rate = 9600, data_bits = 7, parity = "odd" }
//! ```

use crate::data::storage::StorageBackend;
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentKind;
use crate::transport::{SerialSettings, TransportKind};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_poll.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DAQPOLL_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Logging and naming.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where cycles are stored.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Polled instruments, in start order.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error), or a full filter
    /// directive such as `daq_poll=debug,info`.
    pub log_level: String,
    /// Emit JSON log lines instead of human readable ones.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq_poll".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sink used for new shots
    #[serde(default)]
    pub backend: StorageBackend,
    /// Directory shot files are created in when the caller does not supply one.
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            output_dir: PathBuf::from("./data"),
        }
    }
}

/// One polled instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device name, also the dataset group name.
    pub name: String,
    /// Instrument model.
    pub kind: InstrumentKind,
    /// Serial port path or VISA resource string.
    #[serde(default)]
    pub resource: String,
    /// Backend the resource is opened through.
    #[serde(default)]
    pub transport: TransportKind,
    /// Serial framing. Falls back to the instrument's factory framing.
    #[serde(default)]
    pub serial: Option<SerialSettings>,
    /// How long one query may wait for its reply.
    #[serde(default = "default_response_timeout", with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Pause between reads while a cycle runs.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bounded wait for the sampling task at the end of a cycle.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
    /// How long an abort waits for the sampling task before killing it.
    #[serde(default = "default_abort_grace", with = "humantime_serde")]
    pub abort_grace: Duration,
}

fn default_response_timeout() -> Duration {
    Duration::from_millis(800)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_abort_grace() -> Duration {
    Duration::from_secs(1)
}

impl DeviceConfig {
    /// Device with default timing, mostly useful in tests and for `--simulate`.
    pub fn new(name: impl Into<String>, kind: InstrumentKind, resource: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            resource: resource.into(),
            transport: TransportKind::default(),
            serial: None,
            response_timeout: default_response_timeout(),
            poll_interval: default_poll_interval(),
            stop_timeout: default_stop_timeout(),
            abort_grace: default_abort_grace(),
        }
    }

    /// Reject settings the device cannot run with.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] naming the first offending field.
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(DaqError::Configuration(
                "device name must not be empty".to_string(),
            ));
        }
        if self.resource.trim().is_empty() && self.transport != TransportKind::Mock {
            return Err(DaqError::Configuration(format!(
                "device '{}' has no resource",
                self.name
            )));
        }
        for (field, value) in [
            ("response_timeout", self.response_timeout),
            ("poll_interval", self.poll_interval),
            ("stop_timeout", self.stop_timeout),
            ("abort_grace", self.abort_grace),
        ] {
            if value.is_zero() {
                return Err(DaqError::Configuration(format!(
                    "device '{}': {field} must be > 0",
                    self.name
                )));
            }
        }
        // The sampling task may be inside one read when asked to stop, so it
        // needs longer than a full response timeout to hand its data back.
        for (field, value) in [
            ("stop_timeout", self.stop_timeout),
            ("abort_grace", self.abort_grace),
        ] {
            if value <= self.response_timeout {
                return Err(DaqError::Configuration(format!(
                    "device '{}': {field} ({value:?}) must exceed response_timeout ({:?})",
                    self.name, self.response_timeout
                )));
            }
        }
        if let Some(serial) = &self.serial {
            serial
                .validate()
                .map_err(|e| DaqError::Configuration(format!("device '{}': {e}", self.name)))?;
        }
        Ok(())
    }
}

impl Settings {
    /// Load from the given TOML file (or [`DEFAULT_CONFIG_PATH`]) plus
    /// `DAQPOLL_` environment overrides, then validate.
    ///
    /// A missing file is not an error; defaults and the environment still
    /// apply.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let settings: Settings = Self::figment(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The provider stack, exposed so callers can add their own layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate every device and reject duplicate names.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] for the first problem found.
    pub fn validate(&self) -> AppResult<()> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !seen.insert(device.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a device by name.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] if no device has that name.
    pub fn device(&self, name: &str) -> AppResult<&DeviceConfig> {
        self.devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| DaqError::Configuration(format!("no device named '{name}'")))
    }
}
