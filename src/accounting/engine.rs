//! The accounting engine
//!
//! Orchestrates every mutation of the account/quota model: account and
//! medium management, the node tree, uploads, transactions, and the
//! requisition reconciliation sweep. Node and chunk counts are enforced
//! synchronously against committed usage before any state changes; disk
//! space is reconciled by the sweep, so violations become observable only
//! after it has caught up.
//!
//! The engine is a plain mutable value; embedding it behind a single
//! serialization point (see `replicator.rs`) is what makes the synchronous
//! check-then-increment discipline atomic per account.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::accounting::account::{
    default_account_limits, validate_limits, AccountId, AccountRegistry, LifeStage,
    ViolatedResourceLimits,
};
use crate::accounting::chunk::{
    BranchId, Chunk, ChunkId, ChunkStore, ErasureCodec, NodeId, OwnerRef,
};
use crate::accounting::errors::{AccountingError, AccountingResult};
use crate::accounting::events::{AccountingEvent, EventLog};
use crate::accounting::media::{MediumRegistry, ReplicationPolicy};
use crate::accounting::requisition::{
    aggregate_policies, compute_requisition, OwnerSnapshot, RequisitionEntry,
};
use crate::accounting::resources::ResourceVector;
use crate::accounting::snapshot::Snapshot;
use crate::accounting::transaction::{TransactionId, TransactionState, TransactionStore};
use crate::accounting::tree::{
    default_media, parent_path, validate_path, Branch, NodeStore, NodeType, TreeNode, UpdateMode,
    UploadId,
};
use crate::config::EngineConfig;

/// A pending upload holding a lock on its target node. Staged chunk sizes are
/// not billed until the upload finishes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Upload {
    pub id: UploadId,
    pub node: NodeId,
    pub account: AccountId,
    pub transaction: Option<TransactionId>,
    pub erasure_codec: Option<ErasureCodec>,
    pub mode: UpdateMode,
    pub staged: Vec<i64>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CreateNodeOptions<'a> {
    /// Explicit account; inherited from the parent node when absent.
    pub account: Option<&'a str>,
    pub transaction: Option<TransactionId>,
}

#[derive(Clone, Copy, Debug)]
pub struct CopyNodeOptions {
    pub transaction: Option<TransactionId>,
    /// Keep the source nodes' accounts instead of inheriting the destination
    /// parent's.
    pub preserve_account: bool,
    /// Validate chunk count and disk space of the destination account before
    /// admitting the copy.
    pub pessimistic_quota_check: bool,
}

impl Default for CopyNodeOptions {
    fn default() -> Self {
        Self {
            transaction: None,
            preserve_account: false,
            pessimistic_quota_check: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MoveNodeOptions {
    pub preserve_account: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    pub transaction: Option<TransactionId>,
    /// Append to the current chunk list instead of replacing it.
    pub append: bool,
}

/// Public view of one requisition record, keyed by account name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRequisition {
    pub account: String,
    pub medium: String,
    pub replication_policy: ReplicationPolicy,
    pub committed: bool,
}

pub struct AccountingEngine {
    config: EngineConfig,
    accounts: AccountRegistry,
    media: MediumRegistry,
    nodes: NodeStore,
    chunks: ChunkStore,
    transactions: TransactionStore,
    uploads: HashMap<UploadId, Upload>,
    dirty_chunks: VecDeque<ChunkId>,
    events: EventLog,
}

impl AccountingEngine {
    pub fn new(config: EngineConfig) -> Self {
        let mut engine = Self {
            events: EventLog::new(config.event_log_capacity),
            config,
            accounts: AccountRegistry::new(),
            media: MediumRegistry::new(),
            nodes: NodeStore::new(),
            chunks: ChunkStore::new(),
            transactions: TransactionStore::new(),
            uploads: HashMap::new(),
            dirty_chunks: VecDeque::new(),
        };
        let sys = engine.accounts.resolve("sys").expect("builtin account");
        let tmp = engine.accounts.resolve("tmp").expect("builtin account");
        engine.insert_trunk_node(NodeType::MapNode, "/", sys, None);
        engine.insert_trunk_node(NodeType::MapNode, "/tmp", tmp, None);
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Accounts

    pub fn create_account(&mut self, name: &str) -> AccountingResult<()> {
        self.create_account_with_limits(name, default_account_limits())
    }

    pub fn create_account_with_limits(
        &mut self,
        name: &str,
        limits: ResourceVector,
    ) -> AccountingResult<()> {
        self.accounts.create(name, limits)?;
        self.events.emit("account_created", name, name, String::new());
        info!("created account '{}'", name);
        Ok(())
    }

    /// Remove an account. Destroys it immediately when nothing references it,
    /// otherwise parks it in the `RemovalStarted` life stage until the
    /// references drain and the sweep finishes the removal.
    pub fn remove_account(&mut self, name: &str) -> AccountingResult<()> {
        let account = self.accounts.get_by_name(name)?;
        if account.builtin {
            return Err(AccountingError::validation(
                "account",
                format!("cannot remove builtin account '{}'", name),
            ));
        }
        let id = account.id;
        if account.ref_counter <= 1 {
            self.accounts.destroy(&id);
            self.events.emit("account_removed", name, name, String::new());
            info!("removed account '{}'", name);
        } else {
            let account = self.accounts.get_mut(&id).expect("account exists");
            account.life_stage = LifeStage::RemovalStarted;
            account.touch();
            self.events
                .emit("account_removal_started", name, name, String::new());
            info!("removal of account '{}' deferred until references drain", name);
        }
        Ok(())
    }

    pub fn rename_account(&mut self, old_name: &str, new_name: &str) -> AccountingResult<()> {
        self.accounts.rename(old_name, new_name)?;
        self.events.emit(
            "account_renamed",
            new_name,
            new_name,
            format!("renamed from '{}'", old_name),
        );
        Ok(())
    }

    pub fn account_exists(&self, name: &str) -> bool {
        self.accounts.exists(name)
    }

    pub fn list_accounts(&self) -> Vec<String> {
        self.accounts.names()
    }

    pub fn set_resource_limits(&mut self, name: &str, limits: ResourceVector) -> AccountingResult<()> {
        validate_limits(&limits)?;
        let account = self.accounts.get_by_name_mut(name)?;
        account.resource_limits = limits;
        account.touch();
        Ok(())
    }

    pub fn set_node_count_limit(&mut self, name: &str, value: i64) -> AccountingResult<()> {
        if value < 0 {
            return Err(AccountingError::validation(
                "resource limits",
                format!("node_count limit cannot be negative, got {}", value),
            ));
        }
        let account = self.accounts.get_by_name_mut(name)?;
        account.resource_limits.node_count = value;
        account.touch();
        Ok(())
    }

    pub fn set_chunk_count_limit(&mut self, name: &str, value: i64) -> AccountingResult<()> {
        if value < 0 {
            return Err(AccountingError::validation(
                "resource limits",
                format!("chunk_count limit cannot be negative, got {}", value),
            ));
        }
        let account = self.accounts.get_by_name_mut(name)?;
        account.resource_limits.chunk_count = value;
        account.touch();
        Ok(())
    }

    pub fn set_disk_space_limit(
        &mut self,
        name: &str,
        medium: &str,
        value: i64,
    ) -> AccountingResult<()> {
        if value < 0 {
            return Err(AccountingError::validation(
                "resource limits",
                format!("disk space limit cannot be negative, got {}", value),
            ));
        }
        if !self.media.exists(medium) {
            return Err(AccountingError::not_found("Medium", medium));
        }
        let account = self.accounts.get_by_name_mut(name)?;
        account.resource_limits.set_medium_disk_space(medium, value);
        account.touch();
        Ok(())
    }

    /// Restrict the `use` permission to the given users; `None` reopens the
    /// account to everyone.
    pub fn set_account_allowed_users(
        &mut self,
        name: &str,
        users: Option<HashSet<String>>,
    ) -> AccountingResult<()> {
        let account = self.accounts.get_by_name_mut(name)?;
        account.allowed_users = users;
        account.touch();
        Ok(())
    }

    pub fn resource_usage(&self, name: &str) -> AccountingResult<ResourceVector> {
        Ok(self.accounts.get_by_name(name)?.resource_usage.clone())
    }

    pub fn committed_resource_usage(&self, name: &str) -> AccountingResult<ResourceVector> {
        Ok(self
            .accounts
            .get_by_name(name)?
            .committed_resource_usage
            .clone())
    }

    pub fn resource_limits(&self, name: &str) -> AccountingResult<ResourceVector> {
        Ok(self.accounts.get_by_name(name)?.resource_limits.clone())
    }

    pub fn violated_resource_limits(&self, name: &str) -> AccountingResult<ViolatedResourceLimits> {
        Ok(self.accounts.get_by_name(name)?.violated_resource_limits())
    }

    pub fn account_ref_counter(&self, name: &str) -> AccountingResult<i64> {
        Ok(self.accounts.get_by_name(name)?.ref_counter)
    }

    pub fn account_life_stage(&self, name: &str) -> AccountingResult<LifeStage> {
        Ok(self.accounts.get_by_name(name)?.life_stage)
    }

    pub fn total_resource_usage(&self) -> ResourceVector {
        let mut total = ResourceVector::new();
        for account in self.accounts.iter() {
            total.add_assign(&account.resource_usage);
        }
        total
    }

    pub fn total_committed_resource_usage(&self) -> ResourceVector {
        let mut total = ResourceVector::new();
        for account in self.accounts.iter() {
            total.add_assign(&account.committed_resource_usage);
        }
        total
    }

    pub fn total_resource_limits(&self) -> ResourceVector {
        let mut total = ResourceVector::new();
        for account in self.accounts.iter() {
            total.add_assign(&account.resource_limits);
        }
        total
    }

    // ------------------------------------------------------------------
    // Media

    pub fn create_medium(&mut self, name: &str) -> AccountingResult<()> {
        self.media.create(name)?;
        self.accounts.grant_builtin_medium(name);
        self.events.emit("medium_created", "", name, String::new());
        Ok(())
    }

    pub fn list_media(&self) -> Vec<String> {
        self.media.names()
    }

    // ------------------------------------------------------------------
    // Node tree

    pub fn create_node(
        &mut self,
        node_type: NodeType,
        path: &str,
        options: CreateNodeOptions<'_>,
    ) -> AccountingResult<NodeId> {
        validate_path(path)?;
        if self.nodes.exists(path) {
            return Err(AccountingError::AlreadyExists {
                kind: "Node".to_string(),
                name: path.to_string(),
            });
        }
        let parent = self.nodes.get_by_path(&parent_path(path))?;
        if parent.node_type != NodeType::MapNode {
            return Err(AccountingError::validation(
                "path",
                format!("parent of '{}' is not a map node", path),
            ));
        }
        let parent_id = parent.id;
        let parent_account = parent.account;
        let account_id = match options.account {
            Some(name) => self.resolve_active_account(name)?,
            None => parent_account,
        };
        if let Some(tx) = options.transaction {
            self.transactions.get_active_mut(&tx)?;
        }
        self.check_node_count(&account_id, 1)?;

        let node_id = self.insert_trunk_node(node_type, path, account_id, options.transaction);
        if let Some(tx) = options.transaction {
            self.transactions.get_mut(&tx)?.created_nodes.push(node_id);
            self.ensure_branch(node_id, tx)?;
            self.ensure_branch(parent_id, tx)?;
        }
        Ok(node_id)
    }

    pub fn copy_node(
        &mut self,
        src_path: &str,
        dst_path: &str,
        options: CopyNodeOptions,
    ) -> AccountingResult<NodeId> {
        validate_path(dst_path)?;
        if self.nodes.exists(dst_path) {
            return Err(AccountingError::AlreadyExists {
                kind: "Node".to_string(),
                name: dst_path.to_string(),
            });
        }
        let subtree = self.nodes.subtree(src_path)?;
        let dst_parent = self.nodes.get_by_path(&parent_path(dst_path))?;
        if dst_parent.node_type != NodeType::MapNode {
            return Err(AccountingError::validation(
                "path",
                format!("parent of '{}' is not a map node", dst_path),
            ));
        }
        let dst_parent_id = dst_parent.id;
        let dst_parent_account = dst_parent.account;
        if let Some(tx) = options.transaction {
            self.transactions.get_active_mut(&tx)?;
        }

        struct ClonePlan {
            path: String,
            node_type: NodeType,
            account: AccountId,
            media: HashMap<String, ReplicationPolicy>,
            erasure_codec: Option<ErasureCodec>,
            chunks: Vec<ChunkId>,
        }

        let mut plans = Vec::new();
        for node_id in &subtree {
            let chunks = self.effective_chunks(node_id, options.transaction)?;
            let node = self.nodes.get(node_id)?;
            let account = if options.preserve_account {
                node.account
            } else {
                dst_parent_account
            };
            let suffix = node.path.strip_prefix(src_path).unwrap_or("");
            plans.push(ClonePlan {
                path: format!("{}{}", dst_path, suffix),
                node_type: node.node_type,
                account,
                media: node.media.clone(),
                erasure_codec: node.erasure_codec,
                chunks,
            });
        }

        for plan in &plans {
            let account = self
                .accounts
                .get(&plan.account)
                .ok_or_else(|| AccountingError::not_found("Account", plan.account.to_string()))?;
            if account.life_stage != LifeStage::Active {
                return Err(AccountingError::validation(
                    "account",
                    format!("account '{}' is being removed", account.name),
                ));
            }
        }

        let mut node_increments: HashMap<AccountId, i64> = HashMap::new();
        for plan in &plans {
            *node_increments.entry(plan.account).or_insert(0) += 1;
        }
        for (account, increment) in &node_increments {
            self.check_node_count(account, *increment)?;
        }

        if options.pessimistic_quota_check {
            let mut new_chunks: HashMap<AccountId, i64> = HashMap::new();
            let mut disk_increments: HashMap<(AccountId, String), i64> = HashMap::new();
            let mut seen: HashSet<(AccountId, ChunkId)> = HashSet::new();
            for plan in &plans {
                for chunk_id in &plan.chunks {
                    if !seen.insert((plan.account, *chunk_id)) {
                        continue;
                    }
                    if self.chunk_owned_by_account(chunk_id, &plan.account) {
                        continue;
                    }
                    *new_chunks.entry(plan.account).or_insert(0) += 1;
                    if let Some(chunk) = self.chunks.get(chunk_id) {
                        for (medium, policy) in &plan.media {
                            *disk_increments
                                .entry((plan.account, medium.clone()))
                                .or_insert(0) += chunk.disk_space(policy);
                        }
                    }
                }
            }
            for (account, increment) in &new_chunks {
                self.check_chunk_count(account, *increment)?;
            }
            for ((account, medium), increment) in &disk_increments {
                self.check_disk_space(account, medium, *increment)?;
            }
        }

        let mut clones = Vec::new();
        for plan in &plans {
            let node_id =
                self.insert_trunk_node(plan.node_type, &plan.path, plan.account, options.transaction);
            {
                let node = self.nodes.get_mut(&node_id)?;
                node.media = plan.media.clone();
                node.erasure_codec = plan.erasure_codec;
                node.chunks = plan.chunks.clone();
            }
            for chunk in &plan.chunks {
                self.chunks.add_owner(*chunk, OwnerRef::Trunk(node_id));
                self.mark_dirty(*chunk);
            }
            clones.push(node_id);
        }
        if let Some(tx) = options.transaction {
            for node_id in &clones {
                self.transactions.get_mut(&tx)?.created_nodes.push(*node_id);
                self.ensure_branch(*node_id, tx)?;
            }
            self.ensure_branch(dst_parent_id, tx)?;
        }
        Ok(clones[0])
    }

    pub fn move_node(
        &mut self,
        src_path: &str,
        dst_path: &str,
        options: MoveNodeOptions,
    ) -> AccountingResult<()> {
        validate_path(dst_path)?;
        if dst_path == src_path || dst_path.starts_with(&format!("{}/", src_path)) {
            return Err(AccountingError::validation(
                "path",
                format!("cannot move '{}' into itself", src_path),
            ));
        }
        if self.nodes.exists(dst_path) {
            return Err(AccountingError::AlreadyExists {
                kind: "Node".to_string(),
                name: dst_path.to_string(),
            });
        }
        let subtree = self.nodes.subtree(src_path)?;
        let dst_parent = self.nodes.get_by_path(&parent_path(dst_path))?;
        if dst_parent.node_type != NodeType::MapNode {
            return Err(AccountingError::validation(
                "path",
                format!("parent of '{}' is not a map node", dst_path),
            ));
        }
        let dst_parent_account = dst_parent.account;

        let mut reassigned = Vec::new();
        if !options.preserve_account {
            for node_id in &subtree {
                let node = self.nodes.get(node_id)?;
                if node.account != dst_parent_account {
                    if self.nodes.is_branched(node_id) {
                        return Err(AccountingError::validation(
                            "account",
                            format!("node '{}' is locked by a transaction", node.path),
                        ));
                    }
                    reassigned.push(*node_id);
                }
            }
            if !reassigned.is_empty() {
                self.check_node_count(&dst_parent_account, reassigned.len() as i64)?;
            }
        }

        let renames: Vec<(NodeId, String)> = subtree
            .iter()
            .map(|id| {
                let path = &self.nodes.get(id).expect("subtree node exists").path;
                let suffix = path.strip_prefix(src_path).unwrap_or("");
                (*id, format!("{}{}", dst_path, suffix))
            })
            .collect();
        for (id, new_path) in renames {
            self.nodes.rename_path(&id, &new_path);
        }
        for node_id in reassigned {
            self.reassign_node_account(node_id, dst_parent_account)?;
        }
        Ok(())
    }

    pub fn remove_node(&mut self, path: &str) -> AccountingResult<()> {
        if path == "/" || path == "/tmp" {
            return Err(AccountingError::validation(
                "path",
                format!("cannot remove '{}'", path),
            ));
        }
        let subtree = self.nodes.subtree(path)?;
        for node_id in &subtree {
            if self.nodes.is_branched(node_id) {
                let node_path = self.nodes.get(node_id)?.path.clone();
                return Err(AccountingError::validation(
                    "path",
                    format!("node '{}' is in use by a transaction", node_path),
                ));
            }
        }
        let pending: Vec<UploadId> = self
            .uploads
            .values()
            .filter(|u| subtree.contains(&u.node))
            .map(|u| u.id)
            .collect();
        for upload in pending {
            self.abort_upload_internal(&upload, "node removed");
        }
        for node_id in subtree.iter().rev() {
            self.destroy_trunk_node(node_id);
        }
        Ok(())
    }

    /// Change the account a node is billed against. Rejected under a
    /// transaction and for nodes currently branched by one.
    pub fn set_node_account(
        &mut self,
        path: &str,
        account_name: &str,
        user: Option<&str>,
        transaction: Option<TransactionId>,
    ) -> AccountingResult<()> {
        if transaction.is_some() {
            return Err(AccountingError::validation(
                "account",
                "cannot change the account of a node under a transaction",
            ));
        }
        let node_id = self.nodes.resolve(path)?;
        if self.nodes.is_branched(&node_id) {
            return Err(AccountingError::validation(
                "account",
                format!("node '{}' is locked by a transaction", path),
            ));
        }
        let new_account = self.resolve_active_account(account_name)?;
        if let Some(user) = user {
            self.accounts
                .get(&new_account)
                .expect("resolved account exists")
                .check_use(user)?;
        }
        let old_account = self.nodes.get(&node_id)?.account;
        if old_account == new_account {
            return Ok(());
        }
        self.check_node_count(&new_account, 1)?;
        let old_name = self.account_name(&old_account);
        self.reassign_node_account(node_id, new_account)?;
        self.events.emit(
            "node_account_changed",
            account_name,
            path,
            format!("moved from account '{}'", old_name),
        );
        Ok(())
    }

    pub fn set_media(
        &mut self,
        path: &str,
        media: HashMap<String, ReplicationPolicy>,
    ) -> AccountingResult<()> {
        self.media.check_media(&media)?;
        for policy in media.values() {
            if policy.replication_factor < 0 {
                return Err(AccountingError::validation(
                    "media",
                    "replication factor cannot be negative",
                ));
            }
        }
        let node_id = self.nodes.resolve(path)?;
        let node = self.nodes.get_mut(&node_id)?;
        if !node.node_type.is_chunk_owner() {
            return Err(AccountingError::validation(
                "media",
                format!("node '{}' does not own chunks", path),
            ));
        }
        node.media = media;
        let chunks = node.chunks.clone();
        for chunk in chunks {
            self.mark_dirty(chunk);
        }
        Ok(())
    }

    pub fn set_replication_factor(
        &mut self,
        path: &str,
        medium: &str,
        factor: i64,
    ) -> AccountingResult<()> {
        if factor <= 0 {
            return Err(AccountingError::validation(
                "media",
                format!("replication factor must be positive, got {}", factor),
            ));
        }
        if !self.media.exists(medium) {
            return Err(AccountingError::not_found("Medium", medium));
        }
        let node_id = self.nodes.resolve(path)?;
        let node = self.nodes.get_mut(&node_id)?;
        node.media
            .entry(medium.to_string())
            .or_insert_with(|| ReplicationPolicy::new(factor, false))
            .replication_factor = factor;
        let chunks = node.chunks.clone();
        for chunk in chunks {
            self.mark_dirty(chunk);
        }
        Ok(())
    }

    /// Applies to chunks written after the call; existing chunks keep the
    /// codec they were sealed with.
    pub fn set_erasure_codec(&mut self, path: &str, codec: ErasureCodec) -> AccountingResult<()> {
        let node_id = self.nodes.resolve(path)?;
        let node = self.nodes.get_mut(&node_id)?;
        if !node.node_type.is_chunk_owner() {
            return Err(AccountingError::validation(
                "erasure codec",
                format!("node '{}' does not own chunks", path),
            ));
        }
        node.erasure_codec = Some(codec);
        Ok(())
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.nodes.exists(path)
    }

    pub fn node_account(&self, path: &str) -> AccountingResult<String> {
        let node = self.nodes.get_by_path(path)?;
        Ok(self.account_name(&node.account))
    }

    pub fn node_media(&self, path: &str) -> AccountingResult<HashMap<String, ReplicationPolicy>> {
        Ok(self.nodes.get_by_path(path)?.media.clone())
    }

    pub fn node_chunks(
        &self,
        path: &str,
        transaction: Option<TransactionId>,
    ) -> AccountingResult<Vec<ChunkId>> {
        let node_id = self.nodes.resolve(path)?;
        self.effective_chunks(&node_id, transaction)
    }

    pub fn node_locks(&self, path: &str) -> AccountingResult<Vec<UploadId>> {
        Ok(self.nodes.get_by_path(path)?.locks.clone())
    }

    /// Disk space this node is charged for under its own media policies,
    /// summed across media. With a transaction, branch deltas are applied on
    /// top of the trunk view.
    pub fn node_disk_space(
        &self,
        path: &str,
        transaction: Option<TransactionId>,
    ) -> AccountingResult<i64> {
        let node_id = self.nodes.resolve(path)?;
        let node = self.nodes.get(&node_id)?;
        let chunks = self.effective_chunks(&node_id, transaction)?;
        let mut total = 0;
        for chunk_id in chunks {
            if let Some(chunk) = self.chunks.get(&chunk_id) {
                for policy in node.media.values() {
                    total += chunk.disk_space(policy);
                }
            }
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Uploads

    pub fn begin_upload(&mut self, path: &str, options: WriteOptions) -> AccountingResult<UploadId> {
        let node_id = self.nodes.resolve(path)?;
        let node = self.nodes.get(&node_id)?;
        if !node.node_type.is_chunk_owner() {
            return Err(AccountingError::validation(
                "upload",
                format!("node '{}' does not own chunks", path),
            ));
        }
        let account_id = node.account;
        let erasure_codec = node.erasure_codec;
        if let Some(tx) = options.transaction {
            self.transactions.get_active_mut(&tx)?;
        }
        let account = self
            .accounts
            .get(&account_id)
            .expect("node account exists");
        if account.is_disk_space_limit_violated() {
            return Err(AccountingError::StaleStateViolation {
                account: account.name.clone(),
            });
        }
        let upload = Upload {
            id: Uuid::new_v4(),
            node: node_id,
            account: account_id,
            transaction: options.transaction,
            erasure_codec,
            mode: if options.append {
                UpdateMode::Append
            } else {
                UpdateMode::Overwrite
            },
            staged: Vec::new(),
        };
        let id = upload.id;
        self.nodes.get_mut(&node_id)?.locks.push(id);
        self.uploads.insert(id, upload);
        Ok(id)
    }

    pub fn upload_write(&mut self, upload_id: &UploadId, data_size: i64) -> AccountingResult<()> {
        if data_size < 0 {
            return Err(AccountingError::validation(
                "upload",
                format!("chunk size cannot be negative, got {}", data_size),
            ));
        }
        let (account_id, staged) = {
            let upload = self
                .uploads
                .get(upload_id)
                .ok_or_else(|| AccountingError::not_found("Upload", upload_id.to_string()))?;
            (upload.account, upload.staged.len() as i64)
        };
        self.check_chunk_count(&account_id, staged + 1)?;
        self.uploads
            .get_mut(upload_id)
            .expect("upload exists")
            .staged
            .push(data_size);
        Ok(())
    }

    pub fn finish_upload(&mut self, upload_id: &UploadId) -> AccountingResult<()> {
        let upload = self
            .uploads
            .remove(upload_id)
            .ok_or_else(|| AccountingError::not_found("Upload", upload_id.to_string()))?;
        if let Ok(node) = self.nodes.get_mut(&upload.node) {
            node.locks.retain(|lock| lock != upload_id);
        }
        let mut new_chunks = Vec::new();
        for size in &upload.staged {
            new_chunks.push(self.chunks.insert(Chunk::new(*size, upload.erasure_codec)));
        }
        match upload.transaction {
            Some(tx) => {
                let branch_id = self.ensure_branch(upload.node, tx)?;
                match upload.mode {
                    UpdateMode::Overwrite => {
                        let old_delta = {
                            let branch = self.nodes.branch_mut(&branch_id)?;
                            branch.mode = Some(UpdateMode::Overwrite);
                            std::mem::replace(&mut branch.delta_chunks, new_chunks.clone())
                        };
                        for chunk in old_delta {
                            self.chunks.remove_owner(chunk, &OwnerRef::Branch(branch_id));
                            self.mark_dirty(chunk);
                        }
                    }
                    UpdateMode::Append => {
                        let branch = self.nodes.branch_mut(&branch_id)?;
                        branch.delta_chunks.extend(new_chunks.iter().copied());
                        if branch.mode.is_none() {
                            branch.mode = Some(UpdateMode::Append);
                        }
                    }
                }
                for chunk in &new_chunks {
                    self.chunks.add_owner(*chunk, OwnerRef::Branch(branch_id));
                    self.mark_dirty(*chunk);
                }
            }
            None => {
                match upload.mode {
                    UpdateMode::Overwrite => {
                        let old = {
                            let node = self.nodes.get_mut(&upload.node)?;
                            std::mem::replace(&mut node.chunks, new_chunks.clone())
                        };
                        for chunk in old {
                            self.chunks.remove_owner(chunk, &OwnerRef::Trunk(upload.node));
                            self.mark_dirty(chunk);
                        }
                    }
                    UpdateMode::Append => {
                        self.nodes
                            .get_mut(&upload.node)?
                            .chunks
                            .extend(new_chunks.iter().copied());
                    }
                }
                for chunk in &new_chunks {
                    self.chunks.add_owner(*chunk, OwnerRef::Trunk(upload.node));
                    self.mark_dirty(*chunk);
                }
            }
        }
        Ok(())
    }

    pub fn abort_upload(&mut self, upload_id: &UploadId) -> AccountingResult<()> {
        if self.abort_upload_internal(upload_id, "aborted by caller") {
            Ok(())
        } else {
            Err(AccountingError::not_found("Upload", upload_id.to_string()))
        }
    }

    /// Write chunks of the given sizes in one shot: begin, stage, finish.
    pub fn write(&mut self, path: &str, sizes: &[i64], options: WriteOptions) -> AccountingResult<()> {
        let upload = self.begin_upload(path, options)?;
        for size in sizes {
            if let Err(err) = self.upload_write(&upload, *size) {
                self.abort_upload_internal(&upload, "staging failed");
                return Err(err);
            }
        }
        self.finish_upload(&upload)
    }

    // ------------------------------------------------------------------
    // Transactions

    pub fn start_transaction(
        &mut self,
        parent: Option<TransactionId>,
    ) -> AccountingResult<TransactionId> {
        self.transactions.start(parent)
    }

    /// Commit a transaction: branches merge one level up (into the parent's
    /// branches, or into the trunk at the root), releasing their node-count
    /// charges; chunk and disk components follow through the sweep.
    pub fn commit_transaction(&mut self, tx_id: TransactionId) -> AccountingResult<()> {
        {
            let tx = self.transactions.get(&tx_id)?;
            if tx.state != TransactionState::Active {
                return Err(AccountingError::TransactionFinalized(tx_id));
            }
        }
        // Children left active at commit time are abandoned.
        for child in self.transactions.active_children(&tx_id) {
            self.abort_transaction(child)?;
        }
        // Uploads still pending under this transaction cannot land anymore.
        let pending: Vec<UploadId> = self
            .uploads
            .values()
            .filter(|u| u.transaction == Some(tx_id))
            .map(|u| u.id)
            .collect();
        for upload in pending {
            self.abort_upload_internal(&upload, "transaction committed before upload finished");
        }
        let (parent, branches, created_nodes, usage) = {
            let tx = self.transactions.get_mut(&tx_id)?;
            (
                tx.parent,
                std::mem::take(&mut tx.branches),
                std::mem::take(&mut tx.created_nodes),
                std::mem::take(&mut tx.usage),
            )
        };
        match parent.filter(|p| self.transactions.is_active(p)) {
            Some(parent_id) => self.merge_into_parent(parent_id, branches, created_nodes, usage)?,
            None => self.commit_to_trunk(branches, created_nodes)?,
        }
        self.transactions.get_mut(&tx_id)?.state = TransactionState::Committed;
        self.events
            .emit("transaction_committed", "", &tx_id.to_string(), String::new());
        debug!("committed transaction {}", tx_id);
        Ok(())
    }

    /// Abort a transaction, discarding its deltas. Aborting an already
    /// aborted transaction is a no-op; aborting a committed one fails.
    pub fn abort_transaction(&mut self, tx_id: TransactionId) -> AccountingResult<()> {
        match self.transactions.get(&tx_id)?.state {
            TransactionState::Aborted => return Ok(()),
            TransactionState::Committed => {
                return Err(AccountingError::TransactionFinalized(tx_id))
            }
            TransactionState::Active => {}
        }
        for child in self.transactions.active_children(&tx_id) {
            self.abort_transaction(child)?;
        }
        let pending: Vec<UploadId> = self
            .uploads
            .values()
            .filter(|u| u.transaction == Some(tx_id))
            .map(|u| u.id)
            .collect();
        for upload in pending {
            self.abort_upload_internal(&upload, "transaction aborted");
        }
        let (branches, created_nodes) = {
            let tx = self.transactions.get_mut(&tx_id)?;
            (
                std::mem::take(&mut tx.branches),
                std::mem::take(&mut tx.created_nodes),
            )
        };
        for branch_id in branches {
            let Some(branch) = self.nodes.remove_branch(&branch_id) else {
                continue;
            };
            for chunk in &branch.delta_chunks {
                self.chunks.remove_owner(*chunk, &OwnerRef::Branch(branch_id));
                self.mark_dirty(*chunk);
            }
            if let Ok(origin) = self.nodes.get(&branch.origin) {
                let account = origin.account;
                self.accounts.unref_account(&account);
                self.add_node_usage(&account, -1, 0);
            }
        }
        for node_id in created_nodes.iter().rev() {
            let pending: Vec<UploadId> = self
                .uploads
                .values()
                .filter(|u| &u.node == node_id)
                .map(|u| u.id)
                .collect();
            for upload in pending {
                self.abort_upload_internal(&upload, "transaction aborted");
            }
            self.destroy_trunk_node(node_id);
        }
        let tx = self.transactions.get_mut(&tx_id)?;
        tx.state = TransactionState::Aborted;
        tx.usage.clear();
        self.events
            .emit("transaction_aborted", "", &tx_id.to_string(), String::new());
        debug!("aborted transaction {}", tx_id);
        Ok(())
    }

    /// The transaction's own uncommitted delta for one account.
    pub fn transaction_usage(
        &self,
        tx_id: &TransactionId,
        account_name: &str,
    ) -> AccountingResult<ResourceVector> {
        let account = self.accounts.resolve(account_name)?;
        Ok(self.transactions.get(tx_id)?.usage_for(&account))
    }

    // ------------------------------------------------------------------
    // Requisitions and the sweep

    /// The reconciled requisition of a chunk, deduplicated per
    /// (account, medium, committed) and keyed by account name.
    pub fn chunk_requisition(&self, chunk_id: &ChunkId) -> Vec<ChunkRequisition> {
        let mut merged: HashMap<(AccountId, String, bool), ReplicationPolicy> = HashMap::new();
        for entry in self.chunks.requisition(chunk_id) {
            merged
                .entry((entry.account, entry.medium.clone(), entry.committed))
                .and_modify(|aggregate| {
                    aggregate.replication_factor = aggregate
                        .replication_factor
                        .max(entry.replication_policy.replication_factor);
                    aggregate.data_parts_only &= entry.replication_policy.data_parts_only;
                })
                .or_insert(entry.replication_policy);
        }
        let mut view: Vec<ChunkRequisition> = merged
            .into_iter()
            .map(|((account, medium, committed), replication_policy)| ChunkRequisition {
                account: self.account_name(&account),
                medium,
                replication_policy,
                committed,
            })
            .collect();
        view.sort_by(|a, b| {
            (&a.account, &a.medium, a.committed).cmp(&(&b.account, &b.medium, b.committed))
        });
        view
    }

    pub fn pending_dirty_chunks(&self) -> usize {
        self.dirty_chunks.len()
    }

    /// Drain the dirty-chunk queue, reconcile requisitions and usage, abort
    /// uploads of disk-violated accounts, and finish delayed account
    /// removals. Returns the number of chunk updates processed.
    pub fn run_sweep(&mut self) -> usize {
        let mut processed = 0;
        while let Some(chunk_id) = self.dirty_chunks.pop_front() {
            self.reconcile_chunk(chunk_id);
            processed += 1;
        }
        self.abort_violating_uploads();
        self.finish_account_removals();
        if processed > 0 {
            debug!("replicator sweep reconciled {} chunk update(s)", processed);
        }
        processed
    }

    pub fn events(
        &self,
        account: Option<&str>,
        event_type: Option<&str>,
        limit: usize,
    ) -> Vec<AccountingEvent> {
        self.events.query(account, event_type, limit)
    }

    // ------------------------------------------------------------------
    // Persistence

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            accounts: self.accounts.clone(),
            media: self.media.clone(),
            nodes: self.nodes.clone(),
            chunks: self.chunks.clone(),
            transactions: self.transactions.clone(),
            uploads: self.uploads.clone(),
            dirty_chunks: self.dirty_chunks.iter().copied().collect(),
        }
    }

    pub fn restore(config: EngineConfig, snapshot: Snapshot) -> Self {
        Self {
            events: EventLog::new(config.event_log_capacity),
            config,
            accounts: snapshot.accounts,
            media: snapshot.media,
            nodes: snapshot.nodes,
            chunks: snapshot.chunks,
            transactions: snapshot.transactions,
            uploads: snapshot.uploads,
            dirty_chunks: snapshot.dirty_chunks.into_iter().collect(),
        }
    }

    // ------------------------------------------------------------------
    // Internals

    fn resolve_active_account(&self, name: &str) -> AccountingResult<AccountId> {
        let account = self.accounts.get_by_name(name)?;
        if account.life_stage != LifeStage::Active {
            return Err(AccountingError::validation(
                "account",
                format!("account '{}' is being removed", name),
            ));
        }
        Ok(account.id)
    }

    fn account_name(&self, id: &AccountId) -> String {
        self.accounts
            .get(id)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn check_node_count(&self, account_id: &AccountId, increment: i64) -> AccountingResult<()> {
        let account = self
            .accounts
            .get(account_id)
            .ok_or_else(|| AccountingError::not_found("Account", account_id.to_string()))?;
        let limit = account.resource_limits.node_count;
        // Branched (uncommitted) nodes are deliberately not counted here.
        let usage = account.committed_resource_usage.node_count;
        if usage.saturating_add(increment) > limit {
            return Err(AccountingError::QuotaExceeded {
                account: account.name.clone(),
                resource: "node_count".to_string(),
                limit,
                usage,
            });
        }
        Ok(())
    }

    fn check_chunk_count(&self, account_id: &AccountId, increment: i64) -> AccountingResult<()> {
        let account = self
            .accounts
            .get(account_id)
            .ok_or_else(|| AccountingError::not_found("Account", account_id.to_string()))?;
        let limit = account.resource_limits.chunk_count;
        let usage = account.committed_resource_usage.chunk_count;
        if usage.saturating_add(increment) > limit {
            return Err(AccountingError::QuotaExceeded {
                account: account.name.clone(),
                resource: "chunk_count".to_string(),
                limit,
                usage,
            });
        }
        Ok(())
    }

    fn check_disk_space(
        &self,
        account_id: &AccountId,
        medium: &str,
        increment: i64,
    ) -> AccountingResult<()> {
        let account = self
            .accounts
            .get(account_id)
            .ok_or_else(|| AccountingError::not_found("Account", account_id.to_string()))?;
        let limit = account.resource_limits.medium_disk_space(medium);
        let usage = account.committed_resource_usage.medium_disk_space(medium);
        if usage.saturating_add(increment) > limit {
            return Err(AccountingError::QuotaExceeded {
                account: account.name.clone(),
                resource: format!("disk_space:{}", medium),
                limit,
                usage,
            });
        }
        Ok(())
    }

    fn add_node_usage(&mut self, account_id: &AccountId, usage_delta: i64, committed_delta: i64) {
        if let Some(account) = self.accounts.get_mut(account_id) {
            account.resource_usage.node_count += usage_delta;
            account.committed_resource_usage.node_count += committed_delta;
            account.touch();
        }
    }

    fn insert_trunk_node(
        &mut self,
        node_type: NodeType,
        path: &str,
        account: AccountId,
        created_by: Option<TransactionId>,
    ) -> NodeId {
        let node = TreeNode {
            id: Uuid::new_v4(),
            path: path.to_string(),
            node_type,
            account,
            media: default_media(),
            erasure_codec: None,
            chunks: Vec::new(),
            locks: Vec::new(),
            created_by,
        };
        let id = self.nodes.insert(node);
        self.accounts.ref_account(&account);
        self.add_node_usage(&account, 1, 1);
        id
    }

    fn destroy_trunk_node(&mut self, id: &NodeId) {
        if let Some(node) = self.nodes.remove(id) {
            for chunk in &node.chunks {
                self.chunks.remove_owner(*chunk, &OwnerRef::Trunk(node.id));
                self.mark_dirty(*chunk);
            }
            self.add_node_usage(&node.account, -1, -1);
            self.accounts.unref_account(&node.account);
        }
    }

    fn reassign_node_account(
        &mut self,
        node_id: NodeId,
        new_account: AccountId,
    ) -> AccountingResult<()> {
        let (old_account, chunks) = {
            let node = self.nodes.get(&node_id)?;
            (node.account, node.chunks.clone())
        };
        if old_account == new_account {
            return Ok(());
        }
        self.nodes.get_mut(&node_id)?.account = new_account;
        self.add_node_usage(&old_account, -1, -1);
        self.accounts.unref_account(&old_account);
        self.add_node_usage(&new_account, 1, 1);
        self.accounts.ref_account(&new_account);
        for chunk in chunks {
            self.mark_dirty(chunk);
        }
        Ok(())
    }

    /// Find or create the branch of `origin` held by `tx`, charging one
    /// uncommitted node to the owning account on creation.
    fn ensure_branch(&mut self, origin: NodeId, tx: TransactionId) -> AccountingResult<BranchId> {
        if let Some(existing) = self.nodes.find_branch(&origin, &tx) {
            return Ok(existing);
        }
        let account = self.nodes.get(&origin)?.account;
        let branch_id = self.nodes.insert_branch(Branch {
            id: Uuid::new_v4(),
            origin,
            transaction: tx,
            mode: None,
            delta_chunks: Vec::new(),
        });
        let tx_record = self.transactions.get_mut(&tx)?;
        tx_record.branches.push(branch_id);
        tx_record.usage_mut(account).node_count += 1;
        self.accounts.ref_account(&account);
        self.add_node_usage(&account, 1, 0);
        Ok(branch_id)
    }

    /// Chunk list of a node as seen through a transaction chain: trunk state
    /// with branch deltas applied outermost-first.
    fn effective_chunks(
        &self,
        node_id: &NodeId,
        transaction: Option<TransactionId>,
    ) -> AccountingResult<Vec<ChunkId>> {
        let node = self.nodes.get(node_id)?;
        let mut chunks = node.chunks.clone();
        if let Some(tx) = transaction {
            let chain = self.transactions.chain(&tx);
            for tx_id in chain.iter().rev() {
                if let Some(branch_id) = self.nodes.find_branch(node_id, tx_id) {
                    let branch = self.nodes.branch(&branch_id)?;
                    match branch.mode {
                        Some(UpdateMode::Overwrite) => chunks = branch.delta_chunks.clone(),
                        Some(UpdateMode::Append) => {
                            chunks.extend(branch.delta_chunks.iter().copied())
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(chunks)
    }

    fn chunk_owned_by_account(&self, chunk: &ChunkId, account: &AccountId) -> bool {
        self.chunks.owners(chunk).iter().any(|owner| {
            let node = match owner {
                OwnerRef::Trunk(node_id) => self.nodes.get(node_id).ok(),
                OwnerRef::Branch(branch_id) => self
                    .nodes
                    .branch(branch_id)
                    .ok()
                    .and_then(|branch| self.nodes.get(&branch.origin).ok()),
            };
            node.map(|n| &n.account == account).unwrap_or(false)
        })
    }

    fn mark_dirty(&mut self, chunk: ChunkId) {
        self.dirty_chunks.push_back(chunk);
    }

    fn merge_into_parent(
        &mut self,
        parent_id: TransactionId,
        branches: Vec<BranchId>,
        created_nodes: Vec<NodeId>,
        usage: HashMap<AccountId, ResourceVector>,
    ) -> AccountingResult<()> {
        // Only the synchronously maintained node counts move with the usage
        // vector; chunk and disk components are re-derived by the sweep from
        // the reassigned requisition entries.
        let mut merged_node_counts: HashMap<AccountId, i64> = HashMap::new();
        for (account, vector) in &usage {
            merged_node_counts.insert(*account, vector.node_count);
        }

        for branch_id in branches {
            let (origin, mode, delta) = {
                let branch = self.nodes.branch(&branch_id)?;
                (branch.origin, branch.mode, branch.delta_chunks.clone())
            };
            let account = self.nodes.get(&origin)?.account;
            if let Some(parent_branch) = self.nodes.find_branch(&origin, &parent_id) {
                match mode {
                    Some(UpdateMode::Overwrite) => {
                        let superseded = {
                            let pb = self.nodes.branch_mut(&parent_branch)?;
                            pb.mode = Some(UpdateMode::Overwrite);
                            std::mem::replace(&mut pb.delta_chunks, delta.clone())
                        };
                        for chunk in superseded {
                            self.chunks
                                .remove_owner(chunk, &OwnerRef::Branch(parent_branch));
                            self.mark_dirty(chunk);
                        }
                    }
                    Some(UpdateMode::Append) => {
                        let pb = self.nodes.branch_mut(&parent_branch)?;
                        pb.delta_chunks.extend(delta.iter().copied());
                        if pb.mode.is_none() {
                            pb.mode = Some(UpdateMode::Append);
                        }
                    }
                    None => {}
                }
                for chunk in &delta {
                    self.chunks.reassign_owner(
                        *chunk,
                        &OwnerRef::Branch(branch_id),
                        OwnerRef::Branch(parent_branch),
                    );
                    self.mark_dirty(*chunk);
                }
                self.nodes.remove_branch(&branch_id);
                self.accounts.unref_account(&account);
                self.add_node_usage(&account, -1, 0);
                *merged_node_counts.entry(account).or_insert(0) -= 1;
            } else {
                self.nodes.branch_mut(&branch_id)?.transaction = parent_id;
                self.transactions.get_mut(&parent_id)?.branches.push(branch_id);
                for chunk in &delta {
                    self.mark_dirty(*chunk);
                }
            }
        }
        for node_id in created_nodes {
            if let Ok(node) = self.nodes.get_mut(&node_id) {
                node.created_by = Some(parent_id);
            }
            self.transactions
                .get_mut(&parent_id)?
                .created_nodes
                .push(node_id);
            let chunks = self
                .nodes
                .get(&node_id)
                .map(|n| n.chunks.clone())
                .unwrap_or_default();
            for chunk in chunks {
                self.mark_dirty(chunk);
            }
        }
        let parent = self.transactions.get_mut(&parent_id)?;
        for (account, count) in merged_node_counts {
            if count != 0 {
                parent.usage_mut(account).node_count += count;
            }
        }
        Ok(())
    }

    fn commit_to_trunk(
        &mut self,
        branches: Vec<BranchId>,
        created_nodes: Vec<NodeId>,
    ) -> AccountingResult<()> {
        for branch_id in branches {
            let Some(branch) = self.nodes.remove_branch(&branch_id) else {
                continue;
            };
            let origin = branch.origin;
            let account = self.nodes.get(&origin)?.account;
            match branch.mode {
                Some(UpdateMode::Overwrite) => {
                    let superseded = {
                        let node = self.nodes.get_mut(&origin)?;
                        std::mem::replace(&mut node.chunks, branch.delta_chunks.clone())
                    };
                    for chunk in superseded {
                        self.chunks.remove_owner(chunk, &OwnerRef::Trunk(origin));
                        self.mark_dirty(chunk);
                    }
                }
                Some(UpdateMode::Append) => {
                    self.nodes
                        .get_mut(&origin)?
                        .chunks
                        .extend(branch.delta_chunks.iter().copied());
                }
                None => {}
            }
            for chunk in &branch.delta_chunks {
                self.chunks
                    .reassign_owner(*chunk, &OwnerRef::Branch(branch_id), OwnerRef::Trunk(origin));
                self.mark_dirty(*chunk);
            }
            self.accounts.unref_account(&account);
            self.add_node_usage(&account, -1, 0);
        }
        for node_id in created_nodes {
            if let Ok(node) = self.nodes.get_mut(&node_id) {
                node.created_by = None;
            }
            let chunks = self
                .nodes
                .get(&node_id)
                .map(|n| n.chunks.clone())
                .unwrap_or_default();
            for chunk in chunks {
                self.mark_dirty(chunk);
            }
        }
        Ok(())
    }

    fn collect_owner_snapshots(&self, chunk_id: &ChunkId) -> Vec<OwnerSnapshot> {
        let mut snapshots = Vec::new();
        for owner in self.chunks.owners(chunk_id) {
            match owner {
                OwnerRef::Trunk(node_id) => {
                    let Ok(node) = self.nodes.get(&node_id) else {
                        continue;
                    };
                    let pending = node
                        .created_by
                        .filter(|tx| self.transactions.is_active(tx));
                    snapshots.push(OwnerSnapshot {
                        account: node.account,
                        media: node.media.clone(),
                        committed: pending.is_none(),
                        transaction: pending,
                    });
                }
                OwnerRef::Branch(branch_id) => {
                    let Ok(branch) = self.nodes.branch(&branch_id) else {
                        continue;
                    };
                    let Ok(origin) = self.nodes.get(&branch.origin) else {
                        continue;
                    };
                    snapshots.push(OwnerSnapshot {
                        account: origin.account,
                        media: origin.media.clone(),
                        committed: false,
                        transaction: Some(branch.transaction),
                    });
                }
            }
        }
        snapshots
    }

    fn reconcile_chunk(&mut self, chunk_id: ChunkId) {
        let Some(chunk) = self.chunks.get(&chunk_id).cloned() else {
            return;
        };
        let owners = self.collect_owner_snapshots(&chunk_id);
        let new_entries = compute_requisition(&owners);
        let old_entries = self.chunks.requisition(&chunk_id).to_vec();
        if old_entries != new_entries {
            self.apply_requisition_delta(&chunk, &old_entries, &new_entries);
        }
        self.chunks.store_requisition(chunk_id, new_entries);
    }

    fn apply_requisition_delta(
        &mut self,
        chunk: &Chunk,
        old: &[RequisitionEntry],
        new: &[RequisitionEntry],
    ) {
        // Account-level disk space, deduplicated per (account, medium) across
        // committed and uncommitted entries alike: sharing a chunk within one
        // account is billed once, at the highest requested factor.
        for ((account, medium), delta) in disk_deltas(chunk, old.iter(), new.iter()) {
            if let Some(record) = self.accounts.get_mut(&account) {
                record.resource_usage.add_medium_disk_space(&medium, delta);
                record.touch();
            }
        }
        for ((account, medium), delta) in disk_deltas(
            chunk,
            old.iter().filter(|e| e.committed),
            new.iter().filter(|e| e.committed),
        ) {
            if let Some(record) = self.accounts.get_mut(&account) {
                record
                    .committed_resource_usage
                    .add_medium_disk_space(&medium, delta);
            }
        }

        // Chunk counts: one per account per chunk, however many media or
        // owners are involved.
        for (account, delta) in presence_deltas(old.iter(), new.iter()) {
            if let Some(record) = self.accounts.get_mut(&account) {
                record.resource_usage.chunk_count += delta;
            }
        }
        for (account, delta) in presence_deltas(
            old.iter().filter(|e| e.committed),
            new.iter().filter(|e| e.committed),
        ) {
            if let Some(record) = self.accounts.get_mut(&account) {
                record.committed_resource_usage.chunk_count += delta;
            }
        }

        // Per-transaction deltas, for transactions still active. Entries of
        // finalized transactions simply disappear with their vector.
        let transactions: HashSet<TransactionId> = old
            .iter()
            .chain(new.iter())
            .filter_map(|e| e.transaction)
            .collect();
        for tx_id in transactions {
            if !self.transactions.is_active(&tx_id) {
                continue;
            }
            let tx_old = old.iter().filter(|e| e.transaction == Some(tx_id));
            let tx_new = new.iter().filter(|e| e.transaction == Some(tx_id));
            let disk = disk_deltas(chunk, tx_old.clone(), tx_new.clone());
            let presence = presence_deltas(tx_old, tx_new);
            if let Ok(tx) = self.transactions.get_mut(&tx_id) {
                for ((account, medium), delta) in disk {
                    tx.usage_mut(account).add_medium_disk_space(&medium, delta);
                }
                for (account, delta) in presence {
                    tx.usage_mut(account).chunk_count += delta;
                }
            }
        }
    }

    fn abort_violating_uploads(&mut self) {
        let to_abort: Vec<UploadId> = self
            .uploads
            .values()
            .filter(|upload| {
                self.accounts
                    .get(&upload.account)
                    .map(|a| a.is_disk_space_limit_violated())
                    .unwrap_or(true)
            })
            .map(|upload| upload.id)
            .collect();
        for upload in to_abort {
            self.abort_upload_internal(&upload, "disk space limit violated");
        }
    }

    fn finish_account_removals(&mut self) {
        for id in self.accounts.drained_removals() {
            let name = self.account_name(&id);
            self.accounts.destroy(&id);
            self.events.emit("account_removed", &name, &name, String::new());
            info!("destroyed account '{}' after references drained", name);
        }
    }

    fn abort_upload_internal(&mut self, upload_id: &UploadId, reason: &str) -> bool {
        let Some(upload) = self.uploads.remove(upload_id) else {
            return false;
        };
        if let Ok(node) = self.nodes.get_mut(&upload.node) {
            node.locks.retain(|lock| lock != upload_id);
        }
        let account = self.account_name(&upload.account);
        let path = self
            .nodes
            .get(&upload.node)
            .map(|n| n.path.clone())
            .unwrap_or_default();
        self.events
            .emit("upload_aborted", &account, &path, reason.to_string());
        warn!(
            "aborted pending upload on '{}' for account '{}': {}",
            path, account, reason
        );
        true
    }
}

/// Per-(account, medium) disk-space difference between two aggregated entry
/// sets for one chunk.
fn disk_deltas<'a>(
    chunk: &Chunk,
    old: impl IntoIterator<Item = &'a RequisitionEntry>,
    new: impl IntoIterator<Item = &'a RequisitionEntry>,
) -> Vec<((AccountId, String), i64)> {
    let old_agg = aggregate_policies(old);
    let new_agg = aggregate_policies(new);
    let keys: HashSet<(AccountId, String)> = old_agg.keys().chain(new_agg.keys()).cloned().collect();
    keys.into_iter()
        .filter_map(|key| {
            let before = old_agg.get(&key).map(|p| chunk.disk_space(p)).unwrap_or(0);
            let after = new_agg.get(&key).map(|p| chunk.disk_space(p)).unwrap_or(0);
            (before != after).then_some((key, after - before))
        })
        .collect()
}

/// Per-account chunk-count difference (whether the account is billed for the
/// chunk at all) between two entry sets.
fn presence_deltas<'a>(
    old: impl IntoIterator<Item = &'a RequisitionEntry>,
    new: impl IntoIterator<Item = &'a RequisitionEntry>,
) -> Vec<(AccountId, i64)> {
    let old_accounts: HashSet<AccountId> = old.into_iter().map(|e| e.account).collect();
    let new_accounts: HashSet<AccountId> = new.into_iter().map(|e| e.account).collect();
    old_accounts
        .union(&new_accounts)
        .filter_map(|account| {
            let delta = new_accounts.contains(account) as i64 - old_accounts.contains(account) as i64;
            (delta != 0).then_some((*account, delta))
        })
        .collect()
}
