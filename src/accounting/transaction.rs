//! Transactions
//!
//! Transactions form a tree through the parent relation. Each one carries a
//! per-account delta vector describing its own uncommitted contribution:
//! node counts are maintained synchronously from branch bookkeeping, chunk
//! and disk components by the replicator sweep. A child's delta surfaces in
//! its parent only when the child commits, one level per commit.

use crate::accounting::account::AccountId;
use crate::accounting::chunk::{BranchId, NodeId};
use crate::accounting::errors::{AccountingError, AccountingResult};
use crate::accounting::resources::ResourceVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type TransactionId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub parent: Option<TransactionId>,
    pub state: TransactionState,
    /// Uncommitted per-account deltas from this transaction's own branches.
    pub usage: HashMap<AccountId, ResourceVector>,
    /// Branches held by this transaction.
    pub branches: Vec<BranchId>,
    /// Trunk nodes created under this transaction; destroyed on abort.
    pub created_nodes: Vec<NodeId>,
    pub children: Vec<TransactionId>,
}

impl Transaction {
    pub fn usage_for(&self, account: &AccountId) -> ResourceVector {
        self.usage.get(account).cloned().unwrap_or_default()
    }

    pub fn usage_mut(&mut self, account: AccountId) -> &mut ResourceVector {
        self.usage.entry(account).or_default()
    }
}

/// All transactions of one cluster. Finalized transactions are kept until
/// their whole subtree is finalized, then pruned by the engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransactionStore {
    transactions: HashMap<TransactionId, Transaction>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, parent: Option<TransactionId>) -> AccountingResult<TransactionId> {
        if let Some(parent_id) = parent {
            let parent_tx = self.get_active_mut(&parent_id)?;
            let id = Uuid::new_v4();
            parent_tx.children.push(id);
            self.transactions.insert(
                id,
                Transaction {
                    id,
                    parent: Some(parent_id),
                    state: TransactionState::Active,
                    usage: HashMap::new(),
                    branches: Vec::new(),
                    created_nodes: Vec::new(),
                    children: Vec::new(),
                },
            );
            Ok(id)
        } else {
            let id = Uuid::new_v4();
            self.transactions.insert(
                id,
                Transaction {
                    id,
                    parent: None,
                    state: TransactionState::Active,
                    usage: HashMap::new(),
                    branches: Vec::new(),
                    created_nodes: Vec::new(),
                    children: Vec::new(),
                },
            );
            Ok(id)
        }
    }

    pub fn get(&self, id: &TransactionId) -> AccountingResult<&Transaction> {
        self.transactions
            .get(id)
            .ok_or_else(|| AccountingError::not_found("Transaction", id.to_string()))
    }

    pub fn get_mut(&mut self, id: &TransactionId) -> AccountingResult<&mut Transaction> {
        self.transactions
            .get_mut(id)
            .ok_or_else(|| AccountingError::not_found("Transaction", id.to_string()))
    }

    pub fn get_active_mut(&mut self, id: &TransactionId) -> AccountingResult<&mut Transaction> {
        let tx = self.get_mut(id)?;
        if tx.state != TransactionState::Active {
            return Err(AccountingError::TransactionFinalized(*id));
        }
        Ok(tx)
    }

    pub fn is_active(&self, id: &TransactionId) -> bool {
        self.transactions
            .get(id)
            .map(|tx| tx.state == TransactionState::Active)
            .unwrap_or(false)
    }

    /// Ancestors of a transaction, nearest first, including itself.
    pub fn chain(&self, id: &TransactionId) -> Vec<TransactionId> {
        let mut chain = Vec::new();
        let mut current = Some(*id);
        while let Some(tx_id) = current {
            chain.push(tx_id);
            current = self.transactions.get(&tx_id).and_then(|tx| tx.parent);
        }
        chain
    }

    /// Active children of a transaction, for recursive finalization.
    pub fn active_children(&self, id: &TransactionId) -> Vec<TransactionId> {
        self.transactions
            .get(id)
            .map(|tx| {
                tx.children
                    .iter()
                    .filter(|child| self.is_active(child))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove(&mut self, id: &TransactionId) {
        self.transactions.remove(id);
    }

    pub fn active_ids(&self) -> Vec<TransactionId> {
        self.transactions
            .values()
            .filter(|tx| tx.state == TransactionState::Active)
            .map(|tx| tx.id)
            .collect()
    }
}
