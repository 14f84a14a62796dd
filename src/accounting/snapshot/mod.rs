//! Snapshot persistence
//!
//! The engine's durable state (accounts, media, the node tree, chunks with
//! their requisitions, transaction deltas, pending uploads, and the dirty
//! queue) serializes into a `Snapshot`. Where snapshots live is behind the
//! `SnapshotStore` trait; the engine itself never touches storage.

pub mod file;
pub mod memory;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;

use crate::accounting::account::AccountRegistry;
use crate::accounting::chunk::{ChunkId, ChunkStore};
use crate::accounting::engine::Upload;
use crate::accounting::errors::AccountingResult;
use crate::accounting::media::MediumRegistry;
use crate::accounting::transaction::TransactionStore;
use crate::accounting::tree::{NodeStore, UploadId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything an engine needs to resume after a process restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub accounts: AccountRegistry,
    pub media: MediumRegistry,
    pub nodes: NodeStore,
    pub chunks: ChunkStore,
    pub transactions: TransactionStore,
    pub uploads: HashMap<UploadId, Upload>,
    pub dirty_chunks: Vec<ChunkId>,
}

/// Backend holding engine snapshots.
pub trait SnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> AccountingResult<()>;
    fn load(&self) -> AccountingResult<Snapshot>;
}
