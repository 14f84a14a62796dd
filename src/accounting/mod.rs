pub mod account;
pub mod chunk;
pub mod engine;
pub mod errors;
pub mod events;
pub mod media;
pub mod replicator;
pub mod requisition;
pub mod resources;
pub mod snapshot;
pub mod transaction;
pub mod tree;
pub mod utils;

pub use account::{
    default_account_limits, Account, AccountId, AccountRegistry, LifeStage, ViolatedResourceLimits,
    BUILTIN_ACCOUNTS,
};
pub use chunk::{Chunk, ChunkId, ChunkStore, ErasureCodec, OwnerRef};
pub use engine::{
    AccountingEngine, ChunkRequisition, CopyNodeOptions, CreateNodeOptions, MoveNodeOptions,
    Upload, WriteOptions,
};
pub use errors::{AccountingError, AccountingResult};
pub use events::{AccountingEvent, EventLog};
pub use media::{MediumRegistry, ReplicationPolicy, DEFAULT_MEDIUM, DEFAULT_REPLICATION_FACTOR};
pub use replicator::Replicator;
pub use requisition::{compute_requisition, OwnerSnapshot, RequisitionEntry};
pub use resources::{ResourceVector, UNLIMITED};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore};
pub use transaction::{Transaction, TransactionId, TransactionState, TransactionStore};
pub use tree::{NodeStore, NodeType, TreeNode, UpdateMode, UploadId};
pub use utils::{now, Timestamp};
