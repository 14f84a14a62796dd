//! Resource vectors
//!
//! A `ResourceVector` is the unit of all usage and limit bookkeeping: counted
//! resources as named fields plus a medium-keyed disk space map. A medium
//! absent from the map contributes zero, so vectors over different medium
//! sets compare and combine naturally.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;

/// Sentinel for an unrestricted resource limit.
pub const UNLIMITED: i64 = i64::MAX;

/// Immutable-style value type holding every resource tracked per account.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    pub node_count: i64,
    pub chunk_count: i64,
    pub tablet_count: i64,
    pub tablet_static_memory: i64,
    /// Medium name -> bytes. Absent keys are zero.
    pub disk_space_per_medium: HashMap<String, i64>,
}

impl ResourceVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A vector with every component unrestricted, for builtin accounts.
    /// Only the default medium is present; unrestricted entries for other
    /// media are granted as the media are created.
    pub fn unlimited() -> Self {
        let mut disk_space_per_medium = HashMap::new();
        disk_space_per_medium.insert(crate::accounting::media::DEFAULT_MEDIUM.to_string(), UNLIMITED);
        Self {
            node_count: UNLIMITED,
            chunk_count: UNLIMITED,
            tablet_count: UNLIMITED,
            tablet_static_memory: UNLIMITED,
            disk_space_per_medium,
        }
    }

    /// Total disk space across all media.
    pub fn disk_space(&self) -> i64 {
        self.disk_space_per_medium.values().sum()
    }

    /// Disk space on a single medium; absent means zero.
    pub fn medium_disk_space(&self, medium: &str) -> i64 {
        self.disk_space_per_medium.get(medium).copied().unwrap_or(0)
    }

    pub fn set_medium_disk_space(&mut self, medium: &str, value: i64) {
        self.disk_space_per_medium.insert(medium.to_string(), value);
    }

    pub fn add_medium_disk_space(&mut self, medium: &str, delta: i64) {
        *self
            .disk_space_per_medium
            .entry(medium.to_string())
            .or_insert(0) += delta;
    }

    /// Component-wise sum. Medium maps are summed key-wise.
    pub fn add(&self, other: &ResourceVector) -> ResourceVector {
        let mut result = self.clone();
        result.add_assign(other);
        result
    }

    /// Saturating, so summing unrestricted limit vectors stays at the
    /// sentinel instead of wrapping.
    pub fn add_assign(&mut self, other: &ResourceVector) {
        self.node_count = self.node_count.saturating_add(other.node_count);
        self.chunk_count = self.chunk_count.saturating_add(other.chunk_count);
        self.tablet_count = self.tablet_count.saturating_add(other.tablet_count);
        self.tablet_static_memory = self
            .tablet_static_memory
            .saturating_add(other.tablet_static_memory);
        for (medium, space) in &other.disk_space_per_medium {
            let entry = self.disk_space_per_medium.entry(medium.clone()).or_insert(0);
            *entry = entry.saturating_add(*space);
        }
    }

    pub fn subtract_assign(&mut self, other: &ResourceVector) {
        self.node_count = self.node_count.saturating_sub(other.node_count);
        self.chunk_count = self.chunk_count.saturating_sub(other.chunk_count);
        self.tablet_count = self.tablet_count.saturating_sub(other.tablet_count);
        self.tablet_static_memory = self
            .tablet_static_memory
            .saturating_sub(other.tablet_static_memory);
        for (medium, space) in &other.disk_space_per_medium {
            let entry = self.disk_space_per_medium.entry(medium.clone()).or_insert(0);
            *entry = entry.saturating_sub(*space);
        }
    }

    /// Scale the disk space of one medium in place.
    pub fn scale_medium(&mut self, medium: &str, factor: i64) {
        if let Some(space) = self.disk_space_per_medium.get_mut(medium) {
            *space *= factor;
        }
    }

    /// True when every component, including every medium entry, is zero.
    pub fn is_zero(&self) -> bool {
        self.node_count == 0
            && self.chunk_count == 0
            && self.tablet_count == 0
            && self.tablet_static_memory == 0
            && self.disk_space_per_medium.values().all(|v| *v == 0)
    }

    /// Component-wise `self >= other`, absent media treated as zero.
    pub fn covers(&self, other: &ResourceVector) -> bool {
        if self.node_count < other.node_count
            || self.chunk_count < other.chunk_count
            || self.tablet_count < other.tablet_count
            || self.tablet_static_memory < other.tablet_static_memory
        {
            return false;
        }
        all_media(self, other)
            .into_iter()
            .all(|m| self.medium_disk_space(&m) >= other.medium_disk_space(&m))
    }
}

/// Vectors are equal when every component matches with absent media read as zero.
impl PartialEq for ResourceVector {
    fn eq(&self, other: &Self) -> bool {
        self.node_count == other.node_count
            && self.chunk_count == other.chunk_count
            && self.tablet_count == other.tablet_count
            && self.tablet_static_memory == other.tablet_static_memory
            && all_media(self, other)
                .into_iter()
                .all(|m| self.medium_disk_space(&m) == other.medium_disk_space(&m))
    }
}

impl Eq for ResourceVector {}

fn all_media(a: &ResourceVector, b: &ResourceVector) -> HashSet<String> {
    a.disk_space_per_medium
        .keys()
        .chain(b.disk_space_per_medium.keys())
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_merges_media() {
        let mut a = ResourceVector::new();
        a.node_count = 2;
        a.set_medium_disk_space("default", 100);

        let mut b = ResourceVector::new();
        b.chunk_count = 1;
        b.set_medium_disk_space("default", 50);
        b.set_medium_disk_space("hdd2", 30);

        let sum = a.add(&b);
        assert_eq!(sum.node_count, 2);
        assert_eq!(sum.chunk_count, 1);
        assert_eq!(sum.medium_disk_space("default"), 150);
        assert_eq!(sum.medium_disk_space("hdd2"), 30);
    }

    #[test]
    fn test_equality_ignores_zero_media() {
        let mut a = ResourceVector::new();
        a.set_medium_disk_space("hdd2", 0);
        let b = ResourceVector::new();
        assert_eq!(a, b);

        a.set_medium_disk_space("hdd2", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_subtract_roundtrip() {
        let mut a = ResourceVector::new();
        a.node_count = 3;
        a.set_medium_disk_space("default", 300);

        let mut b = ResourceVector::new();
        b.node_count = 1;
        b.set_medium_disk_space("default", 100);

        let mut c = a.clone();
        c.add_assign(&b);
        c.subtract_assign(&b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_covers() {
        let mut limits = ResourceVector::new();
        limits.node_count = 5;
        limits.set_medium_disk_space("default", 1000);

        let mut usage = ResourceVector::new();
        usage.node_count = 5;
        assert!(limits.covers(&usage));

        usage.set_medium_disk_space("hdd2", 1);
        assert!(!limits.covers(&usage));
    }
}
