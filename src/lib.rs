//! Polled instrument acquisition for slow laboratory monitors.
//!
//! Each device is driven by a [`DeviceWorker`](acquisition::DeviceWorker):
//! manual reads between experiments, and a background polling loop while an
//! experiment runs, with the initial, final and sampled values written to the
//! shot's dataset sink.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod transport;

pub use error::{AppResult, DaqError};
