//! Chunks and their disk-space contribution
//!
//! A chunk is an immutable block of stored data and the unit of disk-space
//! accounting. The contribution of a chunk to an (account, medium) pair
//! depends on the replication policy the owner requested and on whether the
//! chunk is erasure-coded:
//!
//! - replicated chunk: `data_size * replication_factor`;
//! - erasure chunk, data-parts-only medium: the data-parts share of the
//!   encoded size, times the replication factor;
//! - erasure chunk, full medium: the encoded size once, regardless of the
//!   replication factor (parity parts already provide the redundancy).

use crate::accounting::media::ReplicationPolicy;
use crate::accounting::requisition::RequisitionEntry;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type ChunkId = Uuid;
pub type NodeId = Uuid;
pub type BranchId = Uuid;

/// Erasure coding scheme applied to a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErasureCodec {
    /// 6 data parts + 3 parity parts
    ReedSolomon63,
    /// 12 data parts + 2 + 2 parity parts
    Lrc1222,
}

impl ErasureCodec {
    pub fn data_parts(&self) -> i64 {
        match self {
            ErasureCodec::ReedSolomon63 => 6,
            ErasureCodec::Lrc1222 => 12,
        }
    }

    pub fn total_parts(&self) -> i64 {
        match self {
            ErasureCodec::ReedSolomon63 => 9,
            ErasureCodec::Lrc1222 => 16,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErasureCodec::ReedSolomon63 => "reed_solomon_6_3",
            ErasureCodec::Lrc1222 => "lrc_12_2_2",
        }
    }
}

/// An immutable stored chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    /// Size of one replica of the plain (non-encoded) chunk, in bytes.
    pub data_size: i64,
    pub erasure_codec: Option<ErasureCodec>,
}

impl Chunk {
    pub fn new(data_size: i64, erasure_codec: Option<ErasureCodec>) -> Self {
        Self {
            id: Uuid::new_v4(),
            data_size,
            erasure_codec,
        }
    }

    /// Full erasure-encoded size (data + parity parts). Equals `data_size`
    /// for replicated chunks.
    pub fn erasure_size(&self) -> i64 {
        match self.erasure_codec {
            Some(codec) => self.data_size * codec.total_parts() / codec.data_parts(),
            None => self.data_size,
        }
    }

    /// Disk-space contribution on one medium under the given policy.
    pub fn disk_space(&self, policy: &ReplicationPolicy) -> i64 {
        match self.erasure_codec {
            None => self.data_size * policy.replication_factor,
            Some(codec) => {
                if policy.data_parts_only {
                    let data_share = self.erasure_size() * codec.data_parts() / codec.total_parts();
                    data_share * policy.replication_factor
                } else {
                    self.erasure_size()
                }
            }
        }
    }
}

/// Reference from a chunk back to one of its owners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerRef {
    /// A trunk tree node referencing the chunk.
    Trunk(NodeId),
    /// A transaction branch referencing the chunk.
    Branch(BranchId),
}

/// All chunks of one cluster, with owner back-references and the last
/// reconciled requisition per chunk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkStore {
    chunks: HashMap<ChunkId, Chunk>,
    owners: HashMap<ChunkId, HashSet<OwnerRef>>,
    requisitions: HashMap<ChunkId, Vec<RequisitionEntry>>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chunk: Chunk) -> ChunkId {
        let id = chunk.id;
        self.chunks.insert(id, chunk);
        id
    }

    pub fn get(&self, id: &ChunkId) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    pub fn add_owner(&mut self, chunk: ChunkId, owner: OwnerRef) {
        self.owners.entry(chunk).or_default().insert(owner);
    }

    pub fn remove_owner(&mut self, chunk: ChunkId, owner: &OwnerRef) {
        if let Some(refs) = self.owners.get_mut(&chunk) {
            refs.remove(owner);
            if refs.is_empty() {
                self.owners.remove(&chunk);
            }
        }
    }

    /// Replace one owner reference with another, keeping the owner set intact.
    pub fn reassign_owner(&mut self, chunk: ChunkId, from: &OwnerRef, to: OwnerRef) {
        if let Some(refs) = self.owners.get_mut(&chunk) {
            refs.remove(from);
            refs.insert(to);
        }
    }

    pub fn owners(&self, chunk: &ChunkId) -> Vec<OwnerRef> {
        self.owners
            .get(chunk)
            .map(|refs| refs.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_owners(&self, chunk: &ChunkId) -> bool {
        self.owners.contains_key(chunk)
    }

    pub fn requisition(&self, chunk: &ChunkId) -> &[RequisitionEntry] {
        self.requisitions
            .get(chunk)
            .map(|entries| entries.as_slice())
            .unwrap_or(&[])
    }

    /// Store the reconciled requisition; an empty set with no remaining
    /// owners destroys the chunk record entirely.
    pub fn store_requisition(&mut self, chunk: ChunkId, entries: Vec<RequisitionEntry>) {
        if entries.is_empty() {
            self.requisitions.remove(&chunk);
            if !self.has_owners(&chunk) {
                self.chunks.remove(&chunk);
            }
        } else {
            self.requisitions.insert(chunk, entries);
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
