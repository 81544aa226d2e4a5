//! Append-only CSV logging, one file per instrument.
//!
//! A session opens `<label>_<instrument>.csv` for every instrument in a directory. Files are
//! opened in append mode so repeated sessions with the same label extend the same files;
//! [`DataLogger::open`] reports which files already existed so callers write the header row
//! only once.
//!
//! With periodic flushing enabled every open file is flushed and `fsync`ed at most once per
//! interval, however fast rows arrive. [`DataLogger::close`] always flushes and syncs.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use daq_core::DaqError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Periodic flush settings (`[flush]` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Sync files periodically while writing.
    pub periodic: bool,
    /// Minimum seconds between syncs.
    pub interval_s: f64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            periodic: true,
            interval_s: 10.0,
        }
    }
}

impl FlushConfig {
    /// Interval as a [`Duration`]. Non-positive or non-finite values are rejected.
    pub fn interval(&self) -> Result<Duration, DaqError> {
        Duration::try_from_secs_f64(self.interval_s)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                DaqError::Configuration(format!(
                    "flush interval must be positive, got {}",
                    self.interval_s
                ))
            })
    }
}

struct LogFile {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl LogFile {
    fn sync(&mut self) -> Result<(), DaqError> {
        self.writer
            .flush()
            .map_err(|e| DaqError::Storage(format!("flush {}: {e}", self.path.display())))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| DaqError::Storage(format!("sync {}: {e}", self.path.display())))
    }
}

/// Per-instrument CSV files for one logging session.
pub struct DataLogger {
    periodic: Option<Duration>,
    files: HashMap<String, LogFile>,
    last_sync: Instant,
    sync_count: u64,
}

impl DataLogger {
    /// Logger with the given flush policy. No files are open until [`open`](Self::open).
    pub fn new(flush: &FlushConfig) -> Result<Self, DaqError> {
        let periodic = if flush.periodic {
            Some(flush.interval()?)
        } else {
            None
        };
        Ok(Self {
            periodic,
            files: HashMap::new(),
            last_sync: Instant::now(),
            sync_count: 0,
        })
    }

    /// Logger that only syncs on [`close`](Self::close).
    pub fn without_periodic_flush() -> Self {
        Self {
            periodic: None,
            files: HashMap::new(),
            last_sync: Instant::now(),
            sync_count: 0,
        }
    }

    /// File path for an instrument in a session.
    pub fn file_path(directory: &Path, label: &str, name: &str) -> PathBuf {
        directory.join(format!("{label}_{name}.csv"))
    }

    /// Open one append file per name, creating `directory` if needed.
    ///
    /// Returns, per name, whether the file existed before this call. Any files from a
    /// previous session are closed first.
    pub fn open<S: AsRef<str>>(
        &mut self,
        names: &[S],
        directory: &Path,
        label: &str,
    ) -> Result<HashMap<String, bool>, DaqError> {
        if !self.files.is_empty() {
            warn!("logger reopened without close; closing previous session");
            self.close()?;
        }
        std::fs::create_dir_all(directory).map_err(|e| {
            DaqError::Storage(format!("create {}: {e}", directory.display()))
        })?;

        let mut existed = HashMap::with_capacity(names.len());
        let mut files = HashMap::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let path = Self::file_path(directory, label, name);
            let pre_existing = path.exists();
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| DaqError::Storage(format!("open {}: {e}", path.display())))?;
            let writer = csv::WriterBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_writer(file);
            debug!(instrument = name, path = %path.display(), pre_existing, "log file open");
            existed.insert(name.to_string(), pre_existing);
            files.insert(name.to_string(), LogFile { path, writer });
        }

        self.files = files;
        self.last_sync = Instant::now();
        info!(label, directory = %directory.display(), files = self.files.len(), "logging session open");
        Ok(existed)
    }

    /// Whether a session is open.
    pub fn is_open(&self) -> bool {
        !self.files.is_empty()
    }

    /// Append one row to `name`'s file.
    pub fn write<S: AsRef<str>>(&mut self, name: &str, fields: &[S]) -> Result<(), DaqError> {
        if self.files.is_empty() {
            return Err(DaqError::Storage(format!(
                "write to '{name}' after logger was closed"
            )));
        }
        let file = self
            .files
            .get_mut(name)
            .ok_or_else(|| DaqError::Storage(format!("no log file for '{name}'")))?;
        file.writer
            .write_record(fields.iter().map(|f| f.as_ref()))
            .map_err(|e| DaqError::Storage(format!("write {}: {e}", file.path.display())))?;

        if let Some(interval) = self.periodic {
            if self.last_sync.elapsed() >= interval {
                self.sync_all()?;
            }
        }
        Ok(())
    }

    /// Flush and `fsync` every open file now.
    pub fn sync_all(&mut self) -> Result<(), DaqError> {
        for file in self.files.values_mut() {
            file.sync()?;
        }
        self.last_sync = Instant::now();
        self.sync_count += 1;
        Ok(())
    }

    /// Number of completed syncs.
    pub fn sync_count(&self) -> u64 {
        self.sync_count
    }

    /// Flush, sync and close every file. Later writes fail until the next `open`.
    pub fn close(&mut self) -> Result<(), DaqError> {
        if self.files.is_empty() {
            return Ok(());
        }
        let result = self.sync_all();
        let closed = self.files.len();
        self.files.clear();
        info!(files = closed, "logging session closed");
        result
    }
}

impl Drop for DataLogger {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close log files");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn open_reports_pre_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("nested/data");
        let mut logger = DataLogger::without_periodic_flush();

        let first = logger.open(&["vna", "psu"], &data, "run1").unwrap();
        assert_eq!(first.get("vna"), Some(&false));
        assert_eq!(first.get("psu"), Some(&false));
        logger.write("vna", &["Timestamp", "Time (s)"]).unwrap();
        logger.close().unwrap();

        let second = logger.open(&["vna", "psu"], &data, "run1").unwrap();
        assert_eq!(second.get("vna"), Some(&true));
        logger.write("vna", &["2024-01-01T00:00:00Z", "0.5"]).unwrap();
        logger.close().unwrap();

        let text = read(&DataLogger::file_path(&data, "run1", "vna"));
        assert_eq!(text, "Timestamp,Time (s)\n2024-01-01T00:00:00Z,0.5\n");
    }

    #[test]
    fn writes_after_close_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::without_periodic_flush();
        logger.open(&["vna"], dir.path(), "s").unwrap();
        logger.close().unwrap();

        let err = logger.write("vna", &["x"]).unwrap_err();
        assert!(matches!(err, DaqError::Storage(_)));
        assert!(!logger.is_open());
    }

    #[test]
    fn unknown_instrument_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::without_periodic_flush();
        logger.open(&["vna"], dir.path(), "s").unwrap();
        assert!(logger.write("psu", &["x"]).is_err());
    }

    #[test]
    fn periodic_sync_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let flush = FlushConfig {
            periodic: true,
            interval_s: 3600.0,
        };
        let mut logger = DataLogger::new(&flush).unwrap();
        logger.open(&["vna"], dir.path(), "s").unwrap();
        for i in 0..100 {
            logger.write("vna", &[i.to_string()]).unwrap();
        }
        assert_eq!(logger.sync_count(), 0);
        logger.close().unwrap();
        assert_eq!(logger.sync_count(), 1);
    }

    #[test]
    fn periodic_sync_runs_once_interval_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let flush = FlushConfig {
            periodic: true,
            interval_s: 0.02,
        };
        let mut logger = DataLogger::new(&flush).unwrap();
        logger.open(&["vna", "psu"], dir.path(), "s").unwrap();
        logger.write("vna", &["a"]).unwrap();
        logger.write("psu", &["b"]).unwrap();
        assert_eq!(logger.sync_count(), 0);

        std::thread::sleep(Duration::from_millis(30));
        logger.write("vna", &["c"]).unwrap();
        logger.write("vna", &["d"]).unwrap();
        assert_eq!(logger.sync_count(), 1);

        // The psu row written before the sync is already on disk.
        let psu = read(&DataLogger::file_path(dir.path(), "s", "psu"));
        assert_eq!(psu, "b\n");
    }

    #[test]
    fn flush_interval_must_be_positive() {
        let bad = FlushConfig {
            periodic: true,
            interval_s: 0.0,
        };
        assert!(DataLogger::new(&bad).is_err());
        assert!(bad.interval().is_err());
        assert!(FlushConfig {
            periodic: false,
            interval_s: 0.0
        }
        .interval()
        .is_err());
        assert_eq!(FlushConfig::default().interval().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn empty_fields_are_written_as_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::without_periodic_flush();
        logger.open(&["vna"], dir.path(), "s").unwrap();
        logger.write("vna", &["t", "1.0", "", "3"]).unwrap();
        logger.close().unwrap();
        assert_eq!(read(&DataLogger::file_path(dir.path(), "s", "vna")), "t,1.0,,3\n");
    }
}
