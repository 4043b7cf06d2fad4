//! Dataset sinks with clean feature flag handling.
//!
//! Every backend persists a finished [`CycleRecord`] in the same shape:
//!
//! ```text
//! data/<device_name>/<summary_label>   [initial, final]        (2 x channels, f32)
//! data/traces/<trace_label>            rows of (t, values...)  (f32)
//! ```
//!
//! The traces group is shared by every device writing into the same shot. If
//! a trace label is already taken, the device name is prefixed to it.
use crate::config::StorageConfig;
use crate::error::{AppResult, DaqError};
use crate::measurement::CycleRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Name of the shared group holding every device's time series.
pub const TRACES_GROUP: &str = "traces";

/// Receives finished acquisition cycles.
#[async_trait]
pub trait DatasetSink: Send + Sync {
    /// Persist `record` into the shot at `shot_file`.
    async fn store(&self, shot_file: &Path, record: &CycleRecord) -> AppResult<()>;
}

/// Which sink the configuration asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Directory of CSV tables per shot.
    #[default]
    Csv,
    /// One HDF5 file per shot.
    Hdf5,
    /// Records kept in memory, nothing written.
    Memory,
}

impl StorageBackend {
    /// File extension of a shot written by this backend.
    pub fn shot_extension(self) -> &'static str {
        match self {
            StorageBackend::Csv => "d",
            StorageBackend::Hdf5 => "h5",
            StorageBackend::Memory => "mem",
        }
    }
}

/// Build the sink selected in `config`.
///
/// # Errors
/// [`DaqError::FeatureNotEnabled`] when the backend was not compiled in.
pub fn open_sink(config: &StorageConfig) -> AppResult<Arc<dyn DatasetSink>> {
    match config.backend {
        StorageBackend::Csv => Ok(Arc::new(CsvSink::new()?)),
        StorageBackend::Hdf5 => Ok(Arc::new(Hdf5Sink::new()?)),
        StorageBackend::Memory => Ok(Arc::new(MemorySink::new())),
    }
}

/// Shot path for a run started now, inside `output_dir`.
pub fn new_shot_path(output_dir: &Path, backend: StorageBackend) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    output_dir.join(format!("shot_{stamp}.{}", backend.shot_extension()))
}

/// Trace label to use, given whether `label` is already taken in the shot.
fn trace_name(record: &CycleRecord, taken: bool) -> String {
    if taken {
        format!("{}_{}", record.device_name, record.trace_label)
    } else {
        record.trace_label.clone()
    }
}

/// Summary as rows of f32, `[initial, final]`.
fn summary_rows(record: &CycleRecord) -> [Vec<f32>; 2] {
    record.summary().map(|r| r.values().iter().map(|v| *v as f32).collect())
}

fn storage_error(context: &str, err: impl std::fmt::Display) -> DaqError {
    DaqError::Storage(format!("{context}: {err}"))
}

// ============================================================================
// CSV Sink
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs;

    /// Writes a shot as a directory tree of CSV files.
    ///
    /// `shot_file` is treated as the root directory of the shot.
    #[derive(Debug, Default)]
    pub struct CsvSink {
        // Serialises label allocation when several workers share a shot.
        lock: Mutex<()>,
    }

    impl CsvSink {
        /// Sink that writes CSV shots.
        pub fn new() -> AppResult<Self> {
            Ok(Self::default())
        }

        fn header(prefix: &str, first: &str, width: usize) -> Vec<String> {
            let mut header = vec![first.to_string()];
            if width <= 1 {
                header.push(prefix.to_string());
            } else {
                header.extend((0..width).map(|i| format!("{prefix}_{i}")));
            }
            header
        }

        /// Open `path` for writing, refusing to replace an existing dataset.
        fn create_new(path: &Path) -> AppResult<csv::Writer<fs::File>> {
            let file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        DaqError::Storage(format!("Dataset {} already exists in this shot", path.display()))
                    } else {
                        storage_error(&format!("Failed to create {}", path.display()), e)
                    }
                })?;
            Ok(csv::Writer::from_writer(file))
        }

        fn create_dir(dir: &Path) -> AppResult<()> {
            fs::create_dir_all(dir)
                .map_err(|e| storage_error(&format!("Failed to create {}", dir.display()), e))
        }

        fn write_summary(path: &Path, record: &CycleRecord) -> AppResult<()> {
            let mut writer = Self::create_new(path)?;

            let width = record.initial.width().max(record.final_value.width());
            writer
                .write_record(Self::header("value", "point", width))
                .map_err(|e| storage_error("Failed to write CSV header", e))?;
            for (point, row) in ["initial", "final"].iter().zip(summary_rows(record)) {
                let mut fields = vec![point.to_string()];
                fields.extend(row.iter().map(ToString::to_string));
                writer
                    .write_record(&fields)
                    .map_err(|e| storage_error("Failed to write summary row", e))?;
            }
            writer
                .flush()
                .map_err(|e| storage_error("Failed to flush summary file", e))
        }

        fn write_trace(path: &Path, record: &CycleRecord) -> AppResult<()> {
            let mut writer = Self::create_new(path)?;

            writer
                .write_record(Self::header("values", "t", record.series.width()))
                .map_err(|e| storage_error("Failed to write CSV header", e))?;
            for sample in &record.series {
                let mut fields = vec![(sample.elapsed as f32).to_string()];
                fields.extend(sample.value.values().iter().map(|v| (*v as f32).to_string()));
                writer
                    .write_record(&fields)
                    .map_err(|e| storage_error("Failed to write trace row", e))?;
            }
            writer
                .flush()
                .map_err(|e| storage_error("Failed to flush trace file", e))
        }
    }

    #[async_trait]
    impl DatasetSink for CsvSink {
        async fn store(&self, shot_file: &Path, record: &CycleRecord) -> AppResult<()> {
            let _guard = self
                .lock
                .lock()
                .map_err(|_| DaqError::Storage("CSV sink lock poisoned".to_string()))?;
            let data = shot_file.join("data");
            let device_dir = data.join(&record.device_name);
            let traces_dir = data.join(TRACES_GROUP);
            let summary = device_dir.join(format!("{}.csv", record.summary_label));
            let taken = traces_dir.join(format!("{}.csv", record.trace_label)).exists();
            let trace = traces_dir.join(format!("{}.csv", trace_name(record, taken)));

            // Both names are checked up front so a clash leaves no half-written cycle.
            for path in [&summary, &trace] {
                if path.exists() {
                    return Err(DaqError::Storage(format!(
                        "Dataset {} already exists in this shot",
                        path.display()
                    )));
                }
            }

            Self::create_dir(&device_dir)?;
            Self::create_dir(&traces_dir)?;
            Self::write_summary(&summary, record)?;
            Self::write_trace(&trace, record)?;
            tracing::info!(
                device = %record.device_name,
                summary = %summary.display(),
                trace = %trace.display(),
                samples = record.series.len(),
                "Cycle written to CSV"
            );
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// Placeholder for the CSV sink when `storage_csv` is off.
    pub struct CsvSink;

    impl CsvSink {
        /// Always fails: built without `storage_csv`.
        pub fn new() -> AppResult<Self> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }

    #[async_trait]
    impl DatasetSink for CsvSink {
        async fn store(&self, _shot_file: &Path, _record: &CycleRecord) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvSink;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvSink;

// ============================================================================
// HDF5 Sink
// ============================================================================

#[cfg(feature = "storage_hdf5")]
mod hdf5_enabled {
    use super::*;
    use hdf5::types::VarLenArray;
    use hdf5::{File, Group, H5Type};

    #[derive(H5Type, Clone, Copy, Debug)]
    #[repr(C)]
    struct ScalarRow {
        t: f32,
        values: f32,
    }

    #[derive(H5Type, Clone, Debug)]
    #[repr(C)]
    struct VectorRow {
        t: f32,
        values: VarLenArray<f32>,
    }

    /// Writes into an HDF5 shot file, creating it if needed.
    #[derive(Debug, Default)]
    pub struct Hdf5Sink {
        // HDF5 files must not be opened twice for writing.
        lock: Mutex<()>,
    }

    impl Hdf5Sink {
        /// Sink that writes HDF5 shots.
        pub fn new() -> AppResult<Self> {
            Ok(Self::default())
        }

        fn group(parent: &Group, name: &str) -> AppResult<Group> {
            if parent.link_exists(name) {
                parent
                    .group(name)
                    .map_err(|e| storage_error(&format!("Failed to open group {name}"), e))
            } else {
                parent
                    .create_group(name)
                    .map_err(|e| storage_error(&format!("Failed to create group {name}"), e))
            }
        }

        fn write(shot_file: &Path, record: &CycleRecord) -> AppResult<String> {
            let file = File::append(shot_file)
                .map_err(|e| storage_error(&format!("Failed to open {}", shot_file.display()), e))?;
            let data = Self::group(&file, "data")?;

            let device = Self::group(&data, &record.device_name)?;
            let [initial, final_value] = summary_rows(record);
            let width = initial.len().max(final_value.len());
            let mut flat = Vec::with_capacity(2 * width);
            for row in [&initial, &final_value] {
                flat.extend(row.iter().copied());
                flat.extend(std::iter::repeat(f32::NAN).take(width - row.len()));
            }
            let summary = if width == 1 {
                device.new_dataset::<f32>().shape(2).create(record.summary_label.as_str())
            } else {
                device
                    .new_dataset::<f32>()
                    .shape((2, width))
                    .create(record.summary_label.as_str())
            }
            .map_err(|e| storage_error("Failed to create summary dataset", e))?;
            summary
                .write_raw(&flat)
                .map_err(|e| storage_error("Failed to write summary dataset", e))?;

            let traces = Self::group(&data, TRACES_GROUP)?;
            let name = trace_name(record, traces.link_exists(&record.trace_label));
            let n = record.series.len();
            if record.series.width() <= 1 {
                let rows: Vec<ScalarRow> = record
                    .series
                    .iter()
                    .map(|s| ScalarRow {
                        t: s.elapsed as f32,
                        values: s.value.channel(0).unwrap_or(f64::NAN) as f32,
                    })
                    .collect();
                traces
                    .new_dataset::<ScalarRow>()
                    .shape(n)
                    .create(name.as_str())
                    .and_then(|ds| ds.write_raw(&rows))
                    .map_err(|e| storage_error("Failed to write trace dataset", e))?;
            } else {
                let rows: Vec<VectorRow> = record
                    .series
                    .iter()
                    .map(|s| {
                        let values: Vec<f32> = s.value.values().iter().map(|v| *v as f32).collect();
                        VectorRow {
                            t: s.elapsed as f32,
                            values: VarLenArray::from_slice(&values),
                        }
                    })
                    .collect();
                traces
                    .new_dataset::<VectorRow>()
                    .shape(n)
                    .create(name.as_str())
                    .and_then(|ds| ds.write_raw(&rows))
                    .map_err(|e| storage_error("Failed to write trace dataset", e))?;
            }

            file.flush()
                .map_err(|e| storage_error("Failed to flush HDF5 file", e))?;
            Ok(name)
        }
    }

    #[async_trait]
    impl DatasetSink for Hdf5Sink {
        async fn store(&self, shot_file: &Path, record: &CycleRecord) -> AppResult<()> {
            let _guard = self
                .lock
                .lock()
                .map_err(|_| DaqError::Storage("HDF5 sink lock poisoned".to_string()))?;
            let trace = Self::write(shot_file, record)?;
            tracing::info!(
                device = %record.device_name,
                file = %shot_file.display(),
                trace = %trace,
                samples = record.series.len(),
                "Cycle written to HDF5"
            );
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_hdf5"))]
mod hdf5_disabled {
    use super::*;

    /// Placeholder for the HDF5 sink when `storage_hdf5` is off.
    pub struct Hdf5Sink;

    impl Hdf5Sink {
        /// Always fails: built without `storage_hdf5`.
        pub fn new() -> AppResult<Self> {
            Err(DaqError::FeatureNotEnabled("storage_hdf5".to_string()))
        }
    }

    #[async_trait]
    impl DatasetSink for Hdf5Sink {
        async fn store(&self, _shot_file: &Path, _record: &CycleRecord) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_hdf5".to_string()))
        }
    }
}

#[cfg(feature = "storage_hdf5")]
pub use hdf5_enabled::Hdf5Sink;

#[cfg(not(feature = "storage_hdf5"))]
pub use hdf5_disabled::Hdf5Sink;

// ============================================================================
// Memory Sink
// ============================================================================

/// Keeps records in memory. Used by tests and `--simulate` dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(PathBuf, CycleRecord)>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record stored so far, in arrival order.
    pub fn records(&self) -> Vec<(PathBuf, CycleRecord)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Trace names as they would appear in the shared traces group.
    pub fn trace_names(&self, shot_file: &Path) -> Vec<String> {
        let records = self.records();
        let mut names: Vec<String> = Vec::new();
        for (_, record) in records.iter().filter(|(p, _)| p == shot_file) {
            let taken = names.contains(&record.trace_label);
            names.push(trace_name(record, taken));
        }
        names
    }
}

#[async_trait]
impl DatasetSink for MemorySink {
    async fn store(&self, shot_file: &Path, record: &CycleRecord) -> AppResult<()> {
        self.records
            .lock()
            .map_err(|_| DaqError::Storage("memory sink lock poisoned".to_string()))?
            .push((shot_file.to_path_buf(), record.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Reading, TimeSeries};

    fn record(device: &str, label: &str, initial: Reading, final_value: Reading) -> CycleRecord {
        let mut series = TimeSeries::new();
        series.push(0.5, initial.clone());
        series.push(1.0, final_value.clone());
        CycleRecord {
            device_name: device.to_string(),
            summary_label: "Pressure".to_string(),
            trace_label: label.to_string(),
            initial,
            final_value,
            series,
        }
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_order_and_prefixes_clashes() {
        let sink = MemorySink::new();
        let shot = Path::new("shot_1.mem");
        sink.store(shot, &record("gauge_a", "Pressures", 1.0.into(), 2.0.into()))
            .await
            .unwrap();
        sink.store(shot, &record("gauge_b", "Pressures", 3.0.into(), 4.0.into()))
            .await
            .unwrap();

        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.trace_names(shot), vec!["Pressures", "gauge_b_Pressures"]);
    }

    #[test]
    fn test_summary_rows_are_f32() {
        let rec = record("g", "Pressures", 1.5e-7.into(), Reading::missing(1));
        let [initial, final_value] = summary_rows(&rec);
        assert_eq!(initial, vec![1.5e-7_f32]);
        assert!(final_value[0].is_nan());
    }

    #[test]
    fn test_shot_path_uses_backend_extension() {
        let path = new_shot_path(Path::new("/tmp/shots"), StorageBackend::Hdf5);
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("h5"));
        assert!(path.starts_with("/tmp/shots"));
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn test_csv_sink_layout() {
        let dir = tempfile::tempdir().unwrap();
        let shot = dir.path().join("shot_1.d");
        let sink = CsvSink::new().unwrap();

        let vector = record(
            "cryostat",
            "Temperatures",
            Reading::Vector(vec![4.2, 77.0]),
            Reading::Vector(vec![4.3, 77.5]),
        );
        sink.store(&shot, &vector).await.unwrap();
        sink.store(&shot, &record("gauge", "Temperatures", 1.0.into(), 2.0.into()))
            .await
            .unwrap();

        let summary = std::fs::read_to_string(shot.join("data/cryostat/Pressure.csv")).unwrap();
        let mut lines = summary.lines();
        assert_eq!(lines.next(), Some("point,value_0,value_1"));
        assert_eq!(lines.next(), Some("initial,4.2,77"));

        let trace = std::fs::read_to_string(shot.join("data/traces/Temperatures.csv")).unwrap();
        assert_eq!(trace.lines().next(), Some("t,values_0,values_1"));
        assert_eq!(trace.lines().count(), 3);

        // Second device with the same label is prefixed.
        let clash = std::fs::read_to_string(shot.join("data/traces/gauge_Temperatures.csv")).unwrap();
        assert_eq!(clash.lines().next(), Some("t,values"));
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn test_csv_sink_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let shot = dir.path().join("shot_2.d");
        let sink = CsvSink::new().unwrap();

        sink.store(&shot, &record("gauge", "Pressures", 1.0.into(), 1.0.into()))
            .await
            .unwrap();
        let err = sink
            .store(&shot, &record("gauge", "Pressures", 2.0.into(), 2.0.into()))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Storage(msg) if msg.contains("already exists")));

        // First cycle is intact and the rejected one left no prefixed trace behind.
        let summary = std::fs::read_to_string(shot.join("data/gauge/Pressure.csv")).unwrap();
        assert!(summary.contains("initial,1"));
        assert!(!shot.join("data/traces/gauge_Pressures.csv").exists());

        // Another device with the same trace label still gets its prefixed name.
        sink.store(&shot, &record("other", "Pressures", 3.0.into(), 3.0.into()))
            .await
            .unwrap();
        assert!(shot.join("data/traces/other_Pressures.csv").exists());
        let err = sink
            .store(&shot, &record("other", "Pressures", 4.0.into(), 4.0.into()))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Storage(_)));
    }

    #[cfg(feature = "storage_hdf5")]
    #[tokio::test]
    async fn test_hdf5_sink_layout() {
        let dir = tempfile::tempdir().unwrap();
        let shot = dir.path().join("shot_1.h5");
        let sink = Hdf5Sink::new().unwrap();
        sink.store(&shot, &record("gauge_a", "Pressures", 1.0.into(), 2.0.into()))
            .await
            .unwrap();
        sink.store(&shot, &record("gauge_b", "Pressures", 3.0.into(), 4.0.into()))
            .await
            .unwrap();

        let file = hdf5::File::open(&shot).unwrap();
        let summary = file.dataset("data/gauge_a/Pressure").unwrap();
        assert_eq!(summary.shape(), vec![2]);
        assert_eq!(summary.read_raw::<f32>().unwrap(), vec![1.0, 2.0]);
        let traces = file.group("data/traces").unwrap();
        assert!(traces.link_exists("Pressures"));
        assert!(traces.link_exists("gauge_b_Pressures"));
    }
}
