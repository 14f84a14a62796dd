//! Chunk requisitions
//!
//! A requisition records which accounts are billed for a chunk, per medium
//! and at which replication policy. It is recomputed from the chunk's owner
//! set whenever the topology changes. Owners of the same account sharing a
//! chunk collapse into one entry per medium at the highest factor any of
//! them requested; owners under different accounts keep independent entries,
//! so the chunk is physically shipped at the maximum factor while each
//! account is billed only for what it asked for.

use crate::accounting::account::AccountId;
use crate::accounting::media::ReplicationPolicy;
use crate::accounting::transaction::TransactionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One billing record of a chunk's requisition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequisitionEntry {
    pub account: AccountId,
    pub medium: String,
    pub replication_policy: ReplicationPolicy,
    /// True when the entry stems from committed ownership.
    pub committed: bool,
    /// The transaction holding the uncommitted ownership, if any.
    pub transaction: Option<TransactionId>,
}

/// The effective attributes of one chunk owner at recomputation time.
#[derive(Clone, Debug)]
pub struct OwnerSnapshot {
    pub account: AccountId,
    pub media: HashMap<String, ReplicationPolicy>,
    pub committed: bool,
    pub transaction: Option<TransactionId>,
}

/// Compute the canonical, deduplicated requisition for one owner set.
///
/// Entries are grouped by (account, medium, committed, transaction); the
/// replication factor within a group is the maximum requested, data_parts_only
/// holds only if every owner in the group asked for it. Groups with a zero
/// factor are dropped.
pub fn compute_requisition(owners: &[OwnerSnapshot]) -> Vec<RequisitionEntry> {
    let mut groups: HashMap<(AccountId, String, bool, Option<TransactionId>), ReplicationPolicy> =
        HashMap::new();

    for owner in owners {
        for (medium, policy) in &owner.media {
            if policy.replication_factor <= 0 {
                continue;
            }
            let key = (
                owner.account,
                medium.clone(),
                owner.committed,
                owner.transaction,
            );
            groups
                .entry(key)
                .and_modify(|aggregate| {
                    aggregate.replication_factor =
                        aggregate.replication_factor.max(policy.replication_factor);
                    aggregate.data_parts_only &= policy.data_parts_only;
                })
                .or_insert(*policy);
        }
    }

    let mut entries: Vec<RequisitionEntry> = groups
        .into_iter()
        .map(
            |((account, medium, committed, transaction), replication_policy)| RequisitionEntry {
                account,
                medium,
                replication_policy,
                committed,
                transaction,
            },
        )
        .collect();
    entries.sort_by(|a, b| {
        (a.account, &a.medium, a.committed).cmp(&(b.account, &b.medium, b.committed))
    });
    entries
}

/// Aggregate a filtered entry set into one effective policy per
/// (account, medium) pair, for billing. Factor is the maximum, data_parts_only
/// the conjunction.
pub fn aggregate_policies<'a, I>(entries: I) -> HashMap<(AccountId, String), ReplicationPolicy>
where
    I: IntoIterator<Item = &'a RequisitionEntry>,
{
    let mut aggregated: HashMap<(AccountId, String), ReplicationPolicy> = HashMap::new();
    for entry in entries {
        aggregated
            .entry((entry.account, entry.medium.clone()))
            .and_modify(|aggregate| {
                aggregate.replication_factor = aggregate
                    .replication_factor
                    .max(entry.replication_policy.replication_factor);
                aggregate.data_parts_only &= entry.replication_policy.data_parts_only;
            })
            .or_insert(entry.replication_policy);
    }
    aggregated
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn media(entries: &[(&str, i64, bool)]) -> HashMap<String, ReplicationPolicy> {
        entries
            .iter()
            .map(|(name, rf, dpo)| (name.to_string(), ReplicationPolicy::new(*rf, *dpo)))
            .collect()
    }

    #[test]
    fn test_same_account_owners_collapse_at_max_factor() {
        let account = Uuid::new_v4();
        let owners = vec![
            OwnerSnapshot {
                account,
                media: media(&[("default", 2, false), ("hdd2", 2, true)]),
                committed: true,
                transaction: None,
            },
            OwnerSnapshot {
                account,
                media: media(&[("hdd2", 3, true), ("hdd3", 4, false)]),
                committed: true,
                transaction: None,
            },
        ];

        let requisition = compute_requisition(&owners);
        assert_eq!(requisition.len(), 3);
        let hdd2 = requisition.iter().find(|e| e.medium == "hdd2").unwrap();
        assert_eq!(hdd2.replication_policy.replication_factor, 3);
        assert!(hdd2.replication_policy.data_parts_only);
    }

    #[test]
    fn test_accounts_keep_independent_entries() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let owners = vec![
            OwnerSnapshot {
                account: a,
                media: media(&[("default", 4, false)]),
                committed: true,
                transaction: None,
            },
            OwnerSnapshot {
                account: b,
                media: media(&[("default", 3, false)]),
                committed: true,
                transaction: None,
            },
        ];

        let requisition = compute_requisition(&owners);
        assert_eq!(requisition.len(), 2);
        let factors: Vec<i64> = requisition
            .iter()
            .map(|e| e.replication_policy.replication_factor)
            .collect();
        assert!(factors.contains(&4) && factors.contains(&3));
    }

    #[test]
    fn test_zero_factor_entries_dropped() {
        let account = Uuid::new_v4();
        let owners = vec![OwnerSnapshot {
            account,
            media: media(&[("default", 0, false)]),
            committed: true,
            transaction: None,
        }];
        assert!(compute_requisition(&owners).is_empty());
    }
}
