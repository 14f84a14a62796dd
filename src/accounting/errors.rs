//! Error types for accounting operations
//!
//! Synchronous checks (node and chunk counts, pessimistic copy validation)
//! reject a request before any state changes. Disk space is reconciled by the
//! replicator sweep, so a write can only fail on disk space once the sweep has
//! already marked the account as violated.

use thiserror::Error;
use uuid::Uuid;

/// Error variants surfaced by the accounting engine
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AccountingError {
    /// Invalid input to a mutating call; rejected before any state change
    #[error("Invalid {subject}: {details}")]
    Validation { subject: String, details: String },

    /// A synchronously checked limit (node_count, chunk_count) would be exceeded
    #[error("{resource} quota exceeded for account '{account}': limit {limit}, usage {usage}")]
    QuotaExceeded {
        account: String,
        resource: String,
        limit: i64,
        usage: i64,
    },

    /// The account's `use` ACL does not cover the requesting user
    #[error("Permission denied: user '{user}' cannot use account '{account}'")]
    PermissionDenied { user: String, account: String },

    /// An asynchronously tracked limit (disk space) is already violated
    #[error("Disk space limit of account '{account}' is violated; new writes are rejected")]
    StaleStateViolation { account: String },

    /// Referenced entity does not exist
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    /// Entity with the same name already exists
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: String, name: String },

    /// Commit or abort raced with an earlier finalization of the same transaction
    #[error("Transaction {0} is already finalized")]
    TransactionFinalized(Uuid),

    /// Error loading or saving a snapshot
    #[error("Snapshot {operation} failed: {details}")]
    Snapshot { operation: String, details: String },
}

impl AccountingError {
    pub fn validation(subject: &str, details: impl Into<String>) -> Self {
        AccountingError::Validation {
            subject: subject.to_string(),
            details: details.into(),
        }
    }

    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        AccountingError::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }
}

/// Standard Result type for accounting operations
pub type AccountingResult<T> = Result<T, AccountingError>;
