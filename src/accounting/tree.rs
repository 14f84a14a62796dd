//! The node tree
//!
//! A minimal Cypress-style tree: nodes addressed by `/`-separated paths,
//! map nodes as interior vertices, chunk owners (tables, files) as leaves.
//! Mutations under a transaction go through branch records; the trunk is
//! only touched on commit.

use crate::accounting::account::AccountId;
use crate::accounting::chunk::{BranchId, ChunkId, ErasureCodec, NodeId};
use crate::accounting::errors::{AccountingError, AccountingResult};
use crate::accounting::media::{ReplicationPolicy, DEFAULT_MEDIUM};
use crate::accounting::transaction::TransactionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type UploadId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    MapNode,
    Table,
    File,
    Document,
}

impl NodeType {
    /// Whether nodes of this type may carry chunks.
    pub fn is_chunk_owner(&self) -> bool {
        matches!(self, NodeType::Table | NodeType::File)
    }
}

/// The default media policy of a fresh chunk owner.
pub fn default_media() -> HashMap<String, ReplicationPolicy> {
    let mut media = HashMap::new();
    media.insert(DEFAULT_MEDIUM.to_string(), ReplicationPolicy::default());
    media
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: NodeId,
    pub path: String,
    pub node_type: NodeType,
    pub account: AccountId,
    pub media: HashMap<String, ReplicationPolicy>,
    pub erasure_codec: Option<ErasureCodec>,
    pub chunks: Vec<ChunkId>,
    /// Pending uploads holding a lock on this node.
    pub locks: Vec<UploadId>,
    /// Transaction that created this node, while it is still active.
    pub created_by: Option<TransactionId>,
}

/// How a branch's chunk delta combines with the state underneath it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMode {
    Append,
    Overwrite,
}

/// Uncommitted state of a node under one transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub origin: NodeId,
    pub transaction: TransactionId,
    /// None until the transaction writes through this branch.
    pub mode: Option<UpdateMode>,
    /// Chunks attached under the transaction, not yet in the trunk.
    pub delta_chunks: Vec<ChunkId>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeStore {
    nodes: HashMap<NodeId, TreeNode>,
    by_path: HashMap<String, NodeId>,
    branches: HashMap<BranchId, Branch>,
}

/// Extract the parent path; `/` is its own parent.
pub fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => "/".to_string(),
    }
}

pub fn validate_path(path: &str) -> AccountingResult<()> {
    if !path.starts_with('/') || (path != "/" && path.ends_with('/')) || path.contains("//") {
        return Err(AccountingError::validation(
            "path",
            format!("'{}' is not a valid tree path", path),
        ));
    }
    Ok(())
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: TreeNode) -> NodeId {
        let id = node.id;
        self.by_path.insert(node.path.clone(), id);
        self.nodes.insert(id, node);
        id
    }

    pub fn resolve(&self, path: &str) -> AccountingResult<NodeId> {
        self.by_path
            .get(path)
            .copied()
            .ok_or_else(|| AccountingError::not_found("Node", path))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn get(&self, id: &NodeId) -> AccountingResult<&TreeNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| AccountingError::not_found("Node", id.to_string()))
    }

    pub fn get_mut(&mut self, id: &NodeId) -> AccountingResult<&mut TreeNode> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| AccountingError::not_found("Node", id.to_string()))
    }

    pub fn get_by_path(&self, path: &str) -> AccountingResult<&TreeNode> {
        let id = self.resolve(path)?;
        self.get(&id)
    }

    pub fn get_by_path_mut(&mut self, path: &str) -> AccountingResult<&mut TreeNode> {
        let id = self.resolve(path)?;
        self.get_mut(&id)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<TreeNode> {
        let node = self.nodes.remove(id)?;
        self.by_path.remove(&node.path);
        Some(node)
    }

    /// Move a node to a new path, keeping its identity.
    pub fn rename_path(&mut self, id: &NodeId, new_path: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            self.by_path.remove(&node.path);
            node.path = new_path.to_string();
            self.by_path.insert(new_path.to_string(), *id);
        }
    }

    /// The node at `path` and every node below it, shallowest first.
    pub fn subtree(&self, path: &str) -> AccountingResult<Vec<NodeId>> {
        let root = self.resolve(path)?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut members: Vec<(&String, NodeId)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() == path || p.starts_with(&prefix))
            .map(|(p, id)| (p, *id))
            .collect();
        members.sort_by_key(|(p, _)| p.matches('/').count());
        let mut ids: Vec<NodeId> = members.into_iter().map(|(_, id)| id).collect();
        // The root is shallowest already, but keep it explicit for "/".
        if ids.first() != Some(&root) {
            ids.retain(|id| id != &root);
            ids.insert(0, root);
        }
        Ok(ids)
    }

    pub fn insert_branch(&mut self, branch: Branch) -> BranchId {
        let id = branch.id;
        self.branches.insert(id, branch);
        id
    }

    pub fn branch(&self, id: &BranchId) -> AccountingResult<&Branch> {
        self.branches
            .get(id)
            .ok_or_else(|| AccountingError::not_found("Branch", id.to_string()))
    }

    pub fn branch_mut(&mut self, id: &BranchId) -> AccountingResult<&mut Branch> {
        self.branches
            .get_mut(id)
            .ok_or_else(|| AccountingError::not_found("Branch", id.to_string()))
    }

    pub fn remove_branch(&mut self, id: &BranchId) -> Option<Branch> {
        self.branches.remove(id)
    }

    /// Find the branch of `origin` held by `transaction`, if any.
    pub fn find_branch(&self, origin: &NodeId, transaction: &TransactionId) -> Option<BranchId> {
        self.branches
            .values()
            .find(|b| &b.origin == origin && &b.transaction == transaction)
            .map(|b| b.id)
    }

    /// Whether any branch of this node exists.
    pub fn is_branched(&self, origin: &NodeId) -> bool {
        self.branches.values().any(|b| &b.origin == origin)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
