use crate::accounting::errors::{AccountingError, AccountingResult};
use crate::accounting::snapshot::{Snapshot, SnapshotStore};
use fs2::FileExt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Snapshot store keeping a single JSON file on disk, guarded by an
/// exclusive file lock against concurrent writers.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(operation: &str, err: impl std::fmt::Display) -> AccountingError {
        AccountingError::Snapshot {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> AccountingResult<()> {
        if let Some(parent) = self.path.parent() {
            create_dir_all(parent).map_err(|e| Self::io_error("save", e))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| Self::io_error("save", e))?;
        file.lock_exclusive().map_err(|e| Self::io_error("save", e))?;
        let result = serde_json::to_writer_pretty(BufWriter::new(&file), snapshot)
            .map_err(|e| Self::io_error("save", e));
        let _ = file.unlock();
        result
    }

    fn load(&self) -> AccountingResult<Snapshot> {
        let file = File::open(&self.path).map_err(|e| Self::io_error("load", e))?;
        file.lock_shared().map_err(|e| Self::io_error("load", e))?;
        let result = serde_json::from_reader(BufReader::new(&file))
            .map_err(|e| Self::io_error("load", e));
        let _ = file.unlock();
        result
    }
}
