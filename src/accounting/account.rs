//! Accounts and the account registry
//!
//! An account is the quota-and-usage entity every tree node and chunk is
//! billed against. Identity is the internal id; the name is a renameable
//! label. Usage is mutated only by the accounting engine. Removal is
//! deferred while structural references (nodes, branches) are alive.

use crate::accounting::errors::{AccountingError, AccountingResult};
use crate::accounting::media::DEFAULT_MEDIUM;
use crate::accounting::resources::{ResourceVector, UNLIMITED};
use crate::accounting::utils::{now, Timestamp};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type AccountId = Uuid;

/// Accounts every cluster starts with. These cannot be removed or shadowed.
pub static BUILTIN_ACCOUNTS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["sys", "tmp", "intermediate"].into_iter().collect());

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("valid account name regex"));

/// Default limits granted to a freshly created account: room on the default
/// medium only, moderate node and chunk allowances, no tablets.
pub fn default_account_limits() -> ResourceVector {
    let mut limits = ResourceVector::new();
    limits.node_count = 1000;
    limits.chunk_count = 1_000_000;
    limits.set_medium_disk_space(DEFAULT_MEDIUM, 1 << 30);
    limits
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifeStage {
    Active,
    /// Removal was requested but references are still draining.
    RemovalStarted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub resource_limits: ResourceVector,
    /// Current usage, including uncommitted branched contributions.
    pub resource_usage: ResourceVector,
    /// Usage reflecting committed state only.
    pub committed_resource_usage: ResourceVector,
    /// 1 for existence, plus one per node reference and per branch reference.
    pub ref_counter: i64,
    pub life_stage: LifeStage,
    pub builtin: bool,
    /// Users granted the `use` permission; `None` allows everyone.
    pub allowed_users: Option<HashSet<String>>,
    pub last_updated: Timestamp,
}

/// Snapshot of which limits an account currently violates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ViolatedResourceLimits {
    pub disk_space: bool,
    pub disk_space_per_medium: HashMap<String, bool>,
    pub node_count: bool,
    pub chunk_count: bool,
    pub tablet_count: bool,
    pub tablet_static_memory: bool,
}

impl Account {
    fn new(name: &str, limits: ResourceVector, builtin: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            resource_limits: limits,
            resource_usage: ResourceVector::new(),
            committed_resource_usage: ResourceVector::new(),
            ref_counter: 1,
            life_stage: LifeStage::Active,
            builtin,
            allowed_users: None,
            last_updated: now(),
        }
    }

    pub fn is_node_count_limit_violated(&self) -> bool {
        self.resource_usage.node_count > self.resource_limits.node_count
    }

    pub fn is_chunk_count_limit_violated(&self) -> bool {
        self.resource_usage.chunk_count > self.resource_limits.chunk_count
    }

    pub fn is_tablet_count_limit_violated(&self) -> bool {
        self.resource_usage.tablet_count > self.resource_limits.tablet_count
    }

    pub fn is_tablet_static_memory_limit_violated(&self) -> bool {
        self.resource_usage.tablet_static_memory > self.resource_limits.tablet_static_memory
    }

    pub fn is_medium_disk_space_limit_violated(&self, medium: &str) -> bool {
        self.resource_usage.medium_disk_space(medium)
            > self.resource_limits.medium_disk_space(medium)
    }

    /// Disk space is violated as soon as any single medium is over limit.
    pub fn is_disk_space_limit_violated(&self) -> bool {
        self.resource_usage
            .disk_space_per_medium
            .iter()
            .any(|(medium, usage)| *usage > self.resource_limits.medium_disk_space(medium))
    }

    pub fn violated_resource_limits(&self) -> ViolatedResourceLimits {
        let mut per_medium = HashMap::new();
        for medium in self.resource_usage.disk_space_per_medium.keys() {
            per_medium.insert(medium.clone(), self.is_medium_disk_space_limit_violated(medium));
        }
        ViolatedResourceLimits {
            disk_space: self.is_disk_space_limit_violated(),
            disk_space_per_medium: per_medium,
            node_count: self.is_node_count_limit_violated(),
            chunk_count: self.is_chunk_count_limit_violated(),
            tablet_count: self.is_tablet_count_limit_violated(),
            tablet_static_memory: self.is_tablet_static_memory_limit_violated(),
        }
    }

    /// Check the `use` permission for a user.
    pub fn check_use(&self, user: &str) -> AccountingResult<()> {
        match &self.allowed_users {
            Some(users) if !users.contains(user) => Err(AccountingError::PermissionDenied {
                user: user.to_string(),
                account: self.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = now();
    }
}

/// Validate a limits vector: zero is legal ("at capacity"), negative values
/// are rejected; `UNLIMITED` is the only unrestricted sentinel.
pub fn validate_limits(limits: &ResourceVector) -> AccountingResult<()> {
    let check = |field: &str, value: i64| -> AccountingResult<()> {
        if value < 0 {
            return Err(AccountingError::validation(
                "resource limits",
                format!("{} limit cannot be negative, got {}", field, value),
            ));
        }
        Ok(())
    };
    check("node_count", limits.node_count)?;
    check("chunk_count", limits.chunk_count)?;
    check("tablet_count", limits.tablet_count)?;
    check("tablet_static_memory", limits.tablet_static_memory)?;
    for (medium, space) in &limits.disk_space_per_medium {
        if *space < 0 {
            return Err(AccountingError::validation(
                "resource limits",
                format!("disk space limit on '{}' cannot be negative, got {}", medium, space),
            ));
        }
    }
    Ok(())
}

/// Registry of all accounts of one cluster, indexed by id and by name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountRegistry {
    accounts: HashMap<AccountId, Account>,
    by_name: HashMap<String, AccountId>,
}

impl AccountRegistry {
    /// Create a registry seeded with the builtin accounts, which carry
    /// unrestricted limits.
    pub fn new() -> Self {
        let mut registry = Self {
            accounts: HashMap::new(),
            by_name: HashMap::new(),
        };
        for name in BUILTIN_ACCOUNTS.iter() {
            let account = Account::new(name, ResourceVector::unlimited(), true);
            registry.by_name.insert(name.to_string(), account.id);
            registry.accounts.insert(account.id, account);
        }
        registry
    }

    pub fn create(&mut self, name: &str, limits: ResourceVector) -> AccountingResult<AccountId> {
        if !NAME_RE.is_match(name) {
            return Err(AccountingError::validation(
                "account name",
                format!("'{}' is not a valid account name", name),
            ));
        }
        if self.by_name.contains_key(name) {
            return Err(AccountingError::AlreadyExists {
                kind: "Account".to_string(),
                name: name.to_string(),
            });
        }
        validate_limits(&limits)?;
        let account = Account::new(name, limits, false);
        let id = account.id;
        self.by_name.insert(name.to_string(), id);
        self.accounts.insert(id, account);
        Ok(id)
    }

    pub fn rename(&mut self, old_name: &str, new_name: &str) -> AccountingResult<()> {
        if !NAME_RE.is_match(new_name) {
            return Err(AccountingError::validation(
                "account name",
                format!("'{}' is not a valid account name", new_name),
            ));
        }
        if self.by_name.contains_key(new_name) {
            return Err(AccountingError::AlreadyExists {
                kind: "Account".to_string(),
                name: new_name.to_string(),
            });
        }
        let id = self.resolve(old_name)?;
        self.by_name.remove(old_name);
        self.by_name.insert(new_name.to_string(), id);
        let account = self.accounts.get_mut(&id).expect("renamed account exists");
        account.name = new_name.to_string();
        account.touch();
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> AccountingResult<AccountId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| AccountingError::not_found("Account", name))
    }

    pub fn get(&self, id: &AccountId) -> Option<&Account> {
        self.accounts.get(id)
    }

    pub fn get_mut(&mut self, id: &AccountId) -> Option<&mut Account> {
        self.accounts.get_mut(id)
    }

    pub fn get_by_name(&self, name: &str) -> AccountingResult<&Account> {
        let id = self.resolve(name)?;
        Ok(self.accounts.get(&id).expect("resolved account exists"))
    }

    pub fn get_by_name_mut(&mut self, name: &str) -> AccountingResult<&mut Account> {
        let id = self.resolve(name)?;
        Ok(self.accounts.get_mut(&id).expect("resolved account exists"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Take a structural reference keeping the account alive.
    pub fn ref_account(&mut self, id: &AccountId) {
        if let Some(account) = self.accounts.get_mut(id) {
            account.ref_counter += 1;
        }
    }

    pub fn unref_account(&mut self, id: &AccountId) {
        if let Some(account) = self.accounts.get_mut(id) {
            account.ref_counter -= 1;
        }
    }

    /// Destroy the account record. The engine calls this only once references
    /// have drained to the base count.
    pub fn destroy(&mut self, id: &AccountId) {
        if let Some(account) = self.accounts.remove(id) {
            self.by_name.remove(&account.name);
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Grant builtin accounts an unrestricted limit on a newly created
    /// medium; other accounts start at zero there.
    pub fn grant_builtin_medium(&mut self, medium: &str) {
        for account in self.accounts.values_mut() {
            if account.builtin {
                account
                    .resource_limits
                    .set_medium_disk_space(medium, UNLIMITED);
            }
        }
    }

    /// Accounts in removal whose references have drained.
    pub fn drained_removals(&self) -> Vec<AccountId> {
        self.accounts
            .values()
            .filter(|a| a.life_stage == LifeStage::RemovalStarted && a.ref_counter <= 1)
            .map(|a| a.id)
            .collect()
    }
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::new()
    }
}
