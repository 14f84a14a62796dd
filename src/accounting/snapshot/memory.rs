use crate::accounting::errors::{AccountingError, AccountingResult};
use crate::accounting::snapshot::{Snapshot, SnapshotStore};
use std::sync::Mutex;

/// An in-memory snapshot store. Suitable for testing and demos.
#[derive(Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> AccountingResult<()> {
        let mut slot = self.slot.lock().map_err(|e| AccountingError::Snapshot {
            operation: "save".to_string(),
            details: e.to_string(),
        })?;
        *slot = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> AccountingResult<Snapshot> {
        let slot = self.slot.lock().map_err(|e| AccountingError::Snapshot {
            operation: "load".to_string(),
            details: e.to_string(),
        })?;
        slot.clone().ok_or_else(|| AccountingError::Snapshot {
            operation: "load".to_string(),
            details: "no snapshot has been saved".to_string(),
        })
    }
}
