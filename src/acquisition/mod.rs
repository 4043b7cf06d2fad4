//! Buffered acquisition: the polling controller and the device worker that
//! drives it through the host lifecycle.

pub mod clock;
pub mod controller;
pub mod sampler;
pub mod worker;

pub use clock::{Clock, TokioClock};
pub use controller::{AcquisitionState, Harvest, PollingAcquisitionController, DEFAULT_ABORT_GRACE};
pub use sampler::{InstrumentReader, Sampler};
pub use worker::{ConnectionCheck, DeviceWorker, FrontPanelValues, HostWorker};
