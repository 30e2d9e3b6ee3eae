//! Cached usage summaries.
//!
//! Aggregate counters derived from the accounting table so that global
//! queries (`df`-style reporting, allocation watermarks) never walk the
//! table. Seeded from the fully-replayed table at mount and kept current
//! by folding every committed delta; GC repair folds its corrective
//! deltas the same way.

use crate::key::AccountingKey;
use cfs_types::{Counters, DataType, DeviceIndex, NR_DATA_TYPES};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Filesystem-wide usage base counters.
#[derive(Debug, Default)]
pub struct FsUsage {
    hidden: AtomicI64,
    btree: AtomicI64,
    data: AtomicI64,
    cached: AtomicI64,
    reserved: AtomicI64,
    nr_inodes: AtomicI64,
}

/// Point-in-time copy of [`FsUsage`], for reporting and verification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsageSnapshot {
    pub hidden: i64,
    pub btree: i64,
    pub data: i64,
    pub cached: i64,
    pub reserved: i64,
    pub nr_inodes: i64,
}

impl FsUsageSnapshot {
    /// Fold one key's counter delta into this snapshot.
    ///
    /// The mapping from key category to base field:
    /// `persistent_reserved` scales by its replication factor; replicas
    /// entries land in hidden (sb/journal), btree, data (user, parity,
    /// stripe) or cached; `nr_inodes` is its own field. Other categories
    /// do not contribute to the base.
    pub fn accumulate_key(&mut self, key: &AccountingKey, deltas: &Counters) {
        match key {
            AccountingKey::PersistentReserved { nr_replicas } => {
                self.reserved = self
                    .reserved
                    .wrapping_add(deltas.get(0).wrapping_mul(i64::from(*nr_replicas)));
            }
            AccountingKey::Replicas(e) => {
                let d = deltas.get(0);
                match e.data_type {
                    DataType::Sb | DataType::Journal => {
                        self.hidden = self.hidden.wrapping_add(d);
                    }
                    DataType::Btree => self.btree = self.btree.wrapping_add(d),
                    DataType::User | DataType::Parity | DataType::Stripe => {
                        self.data = self.data.wrapping_add(d);
                    }
                    DataType::Cached => self.cached = self.cached.wrapping_add(d),
                    DataType::Free => {}
                }
            }
            AccountingKey::NrInodes => {
                self.nr_inodes = self.nr_inodes.wrapping_add(deltas.get(0));
            }
            _ => {}
        }
    }
}

impl FsUsage {
    /// Fold one committed delta into the cached base.
    pub fn fold(&self, key: &AccountingKey, deltas: &Counters) {
        let mut partial = FsUsageSnapshot::default();
        partial.accumulate_key(key, deltas);
        self.hidden.fetch_add(partial.hidden, Ordering::Relaxed);
        self.btree.fetch_add(partial.btree, Ordering::Relaxed);
        self.data.fetch_add(partial.data, Ordering::Relaxed);
        self.cached.fetch_add(partial.cached, Ordering::Relaxed);
        self.reserved.fetch_add(partial.reserved, Ordering::Relaxed);
        self.nr_inodes
            .fetch_add(partial.nr_inodes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> FsUsageSnapshot {
        FsUsageSnapshot {
            hidden: self.hidden.load(Ordering::Relaxed),
            btree: self.btree.load(Ordering::Relaxed),
            data: self.data.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            reserved: self.reserved.load(Ordering::Relaxed),
            nr_inodes: self.nr_inodes.load(Ordering::Relaxed),
        }
    }
}

// ── Per-device usage ────────────────────────────────────────────────────────

/// Per-device, per-data-type counters: {buckets, sectors, fragmented}.
#[derive(Debug, Default)]
struct DevUsage {
    d: [[AtomicI64; 3]; NR_DATA_TYPES],
}

/// One data type's usage on one device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevTypeUsage {
    pub buckets: i64,
    pub sectors: i64,
    pub fragmented: i64,
}

/// Point-in-time copy of one device's usage, indexed by [`DataType`] tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevUsageSnapshot {
    pub d: Vec<DevTypeUsage>,
}

impl DevUsageSnapshot {
    #[must_use]
    pub fn get(&self, data_type: DataType) -> DevTypeUsage {
        self.d
            .get(data_type.as_u8() as usize)
            .copied()
            .unwrap_or_default()
    }
}

/// Cached per-device usage for every known device.
#[derive(Debug, Default)]
pub struct DevUsageTable {
    devs: RwLock<BTreeMap<DeviceIndex, Arc<DevUsage>>>,
}

impl DevUsageTable {
    /// Fold a `dev_data_type` delta for one device.
    pub fn fold(&self, dev: DeviceIndex, data_type: DataType, deltas: &Counters) {
        let usage = {
            let devs = self.devs.read();
            devs.get(&dev).cloned()
        };
        let usage = usage.unwrap_or_else(|| {
            let mut devs = self.devs.write();
            Arc::clone(devs.entry(dev).or_default())
        });

        let row = &usage.d[data_type.as_u8() as usize];
        for (i, slot) in row.iter().enumerate() {
            slot.fetch_add(deltas.get(i), Ordering::Relaxed);
        }
    }

    /// Snapshot one device's usage, if the device is known.
    #[must_use]
    pub fn snapshot(&self, dev: DeviceIndex) -> Option<DevUsageSnapshot> {
        let devs = self.devs.read();
        let usage = devs.get(&dev)?;
        Some(DevUsageSnapshot {
            d: usage
                .d
                .iter()
                .map(|row| DevTypeUsage {
                    buckets: row[0].load(Ordering::Relaxed),
                    sectors: row[1].load(Ordering::Relaxed),
                    fragmented: row[2].load(Ordering::Relaxed),
                })
                .collect(),
        })
    }

    /// Forget a device entirely (device removal).
    pub fn remove(&self, dev: DeviceIndex) {
        self.devs.write().remove(&dev);
    }

    #[must_use]
    pub fn known_devices(&self) -> Vec<DeviceIndex> {
        self.devs.read().keys().copied().collect()
    }
}
