//! Persistence of finished acquisition cycles.

pub mod storage;
