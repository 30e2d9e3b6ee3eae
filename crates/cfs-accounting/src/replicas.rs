//! Superblock replica registry.
//!
//! The registry of replica configurations in use lives in the superblock
//! and is owned elsewhere; the accounting subsystem only consults it
//! (is this configuration marked?) and amends it (mark a configuration a
//! committed update requires). This type is that consumed surface.

use crate::key::ReplicasEntry;
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// In-use replica configurations, as recorded in the superblock.
#[derive(Debug, Default)]
pub struct ReplicasRegistry {
    entries: RwLock<BTreeSet<ReplicasEntry>>,
}

impl ReplicasRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `entry` is marked. The entry is compared in normalized form.
    #[must_use]
    pub fn is_marked(&self, entry: &ReplicasEntry) -> bool {
        let mut normalized = entry.clone();
        normalized.normalize();
        self.entries.read().contains(&normalized)
    }

    /// Mark `entry` as in use. Idempotent.
    pub fn mark(&self, entry: &ReplicasEntry) {
        let mut normalized = entry.clone();
        normalized.normalize();
        let inserted = self.entries.write().insert(normalized.clone());
        if inserted {
            tracing::debug!(
                target: "cfs::accounting",
                entry = %normalized,
                "replicas_marked"
            );
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all marked configurations.
    #[must_use]
    pub fn marked(&self) -> Vec<ReplicasEntry> {
        self.entries.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_types::{DataType, DeviceIndex};

    fn entry(devs: &[u8]) -> ReplicasEntry {
        ReplicasEntry {
            data_type: DataType::User,
            nr_required: 1,
            devs: devs.iter().map(|d| DeviceIndex(*d)).collect(),
        }
    }

    #[test]
    fn mark_then_query() {
        let reg = ReplicasRegistry::new();
        assert!(!reg.is_marked(&entry(&[0, 1])));
        reg.mark(&entry(&[0, 1]));
        assert!(reg.is_marked(&entry(&[0, 1])));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn mark_is_idempotent() {
        let reg = ReplicasRegistry::new();
        reg.mark(&entry(&[2]));
        reg.mark(&entry(&[2]));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn lookup_normalizes_device_order() {
        let reg = ReplicasRegistry::new();
        reg.mark(&entry(&[3, 1, 2]));
        assert!(reg.is_marked(&entry(&[1, 2, 3])));
        assert!(reg.is_marked(&entry(&[2, 3, 1])));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn distinct_configurations_are_distinct() {
        let reg = ReplicasRegistry::new();
        reg.mark(&entry(&[0]));
        reg.mark(&entry(&[1]));
        let mut two_required = entry(&[0, 1, 2]);
        two_required.nr_required = 2;
        reg.mark(&two_required);
        assert_eq!(reg.len(), 3);
        assert!(!reg.is_marked(&entry(&[0, 1])));
    }
}
