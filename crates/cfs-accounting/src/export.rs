//! Usage export surfaces for administrative tooling.
//!
//! Three views over the same live table: a typed dump filtered by
//! category mask, a narrower replicas-only dump kept for legacy
//! quota/usage reporting, and a plain-text rendering for debug logs.

use crate::key::{AccountingKey, ReplicasEntry, TypeFilter};
use crate::Accounting;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// One nonzero accounting entry: normalized key plus current counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub key: AccountingKey,
    pub counters: Vec<i64>,
}

/// One replica configuration and its current sector count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicasUsage {
    pub entry: ReplicasEntry,
    pub sectors: u64,
}

impl Accounting {
    /// Dump all nonzero entries whose category is in `filter`.
    #[must_use]
    pub fn usage_export(&self, filter: TypeFilter) -> Vec<UsageEntry> {
        let mem = self.mem.read();
        mem.entries()
            .iter()
            .filter_map(|en| {
                let key = AccountingKey::decode(en.pos).ok()?;
                if !filter.contains(key.accounting_type()) {
                    return None;
                }
                let counters = en.live().read();
                (!counters.is_zero()).then(|| UsageEntry {
                    key,
                    counters: counters.as_slice().to_vec(),
                })
            })
            .collect()
    }

    /// Replicas-only view: {configuration, sector count} records.
    #[must_use]
    pub fn replicas_usage(&self) -> Vec<ReplicasUsage> {
        let mem = self.mem.read();
        mem.entries()
            .iter()
            .filter_map(|en| match AccountingKey::decode(en.pos) {
                Ok(AccountingKey::Replicas(entry)) => {
                    let sectors = en.live().read().get(0);
                    Some(ReplicasUsage {
                        entry,
                        sectors: u64::try_from(sectors.max(0)).unwrap_or(0),
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Render every live entry as one `<key>: <counters>` line.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mem = self.mem.read();
        let mut out = String::new();
        for en in mem.entries() {
            let Ok(key) = AccountingKey::decode(en.pos) else {
                continue;
            };
            let counters = en.live().read();
            let _ = writeln!(out, "{key}: {counters}");
        }
        out
    }

    /// The cached filesystem usage base.
    #[must_use]
    pub fn fs_usage(&self) -> crate::usage::FsUsageSnapshot {
        self.usage.snapshot()
    }

    /// The cached usage for one device, if known.
    #[must_use]
    pub fn dev_usage(
        &self,
        dev: cfs_types::DeviceIndex,
    ) -> Option<crate::usage::DevUsageSnapshot> {
        self.dev_usage.snapshot(dev)
    }
}
