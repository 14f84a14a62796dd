//! Storage media
//!
//! A medium is a named storage tier (e.g. "default", "hdd2"). Chunk owners
//! request placement per medium through a `ReplicationPolicy`.

use crate::accounting::errors::{AccountingError, AccountingResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The medium every cluster starts with.
pub const DEFAULT_MEDIUM: &str = "default";

/// Replication factor applied to a medium when none is given explicitly.
pub const DEFAULT_REPLICATION_FACTOR: i64 = 3;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("valid medium name regex"));

/// Per-medium placement request carried by a chunk owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    pub replication_factor: i64,
    /// When true, only the data parts of an erasure-coded chunk are placed
    /// on this medium.
    pub data_parts_only: bool,
}

impl ReplicationPolicy {
    pub fn new(replication_factor: i64, data_parts_only: bool) -> Self {
        Self {
            replication_factor,
            data_parts_only,
        }
    }
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self {
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            data_parts_only: false,
        }
    }
}

/// Registry of known media for one cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediumRegistry {
    media: HashMap<String, Medium>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Medium {
    pub name: String,
}

impl MediumRegistry {
    /// Create a registry seeded with the default medium.
    pub fn new() -> Self {
        let mut media = HashMap::new();
        media.insert(
            DEFAULT_MEDIUM.to_string(),
            Medium {
                name: DEFAULT_MEDIUM.to_string(),
            },
        );
        Self { media }
    }

    pub fn create(&mut self, name: &str) -> AccountingResult<()> {
        if !NAME_RE.is_match(name) {
            return Err(AccountingError::validation(
                "medium name",
                format!("'{}' is not a valid medium name", name),
            ));
        }
        if self.media.contains_key(name) {
            return Err(AccountingError::AlreadyExists {
                kind: "Medium".to_string(),
                name: name.to_string(),
            });
        }
        self.media.insert(
            name.to_string(),
            Medium {
                name: name.to_string(),
            },
        );
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.media.contains_key(name)
    }

    /// Validate that every medium referenced by a policy map is known.
    pub fn check_media(&self, media: &HashMap<String, ReplicationPolicy>) -> AccountingResult<()> {
        for name in media.keys() {
            if !self.exists(name) {
                return Err(AccountingError::not_found("Medium", name.clone()));
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.media.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MediumRegistry {
    fn default() -> Self {
        Self::new()
    }
}
