pub mod accounting;
pub mod config;

// Use specific imports rather than assuming re-exports for clarity
pub use crate::accounting::engine::{
    AccountingEngine, ChunkRequisition, CopyNodeOptions, CreateNodeOptions, MoveNodeOptions,
    WriteOptions,
};
pub use crate::accounting::errors::{AccountingError, AccountingResult};
pub use crate::accounting::replicator::Replicator;
pub use crate::accounting::resources::{ResourceVector, UNLIMITED};
pub use crate::accounting::snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use crate::config::EngineConfig;
