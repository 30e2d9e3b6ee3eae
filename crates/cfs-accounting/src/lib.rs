#![forbid(unsafe_code)]
//! Disk accounting for the cinderfs storage engine.
//!
//! Two parallel sets of counters, kept in sync:
//!
//! - **Persistent accounting**, stored in the ledger and updated through
//!   write-buffer updates whose keys carry *deltas* to apply to the
//!   existing sums. Reading back through the write buffer is expensive,
//!   so there is also
//! - **In-memory accounting**: an array of per-shard counters indexed by
//!   a sorted array of encoded accounting positions. Cheap to read, not
//!   persistent.
//!
//! Updates are produced by transactional triggers as keys enter and leave
//! the btrees; the trigger output is a delta per counter category. To make
//! one: build an [`AccountingKey`], an array of 1–3 signed deltas, and
//! call [`Accounting::acct_mod`]. That queues the update on the
//! transaction; nothing is visible until [`Accounting::commit`].
//!
//! The commit path stamps every update with a [`Bversion`] derived from
//! its journal position, propagates it into the in-memory table, folds it
//! into the cached usage summaries, and makes sure replicas-class keys
//! are marked in the superblock registry. Journal replay uses the stamp
//! to decide which updates were already applied, which is what makes
//! replay idempotent.
//!
//! The in-memory table is guarded by the **mark lock**: shared for delta
//! application and reads (per-shard atomics carry the mutation), exclusive
//! for inserts, compaction, and GC transitions. The lock is not
//! reentrant; paths that need the exclusive side mid-operation drop the
//! shared side first and retake it after.

pub mod key;
mod mem;
pub mod replicas;
pub mod usage;

mod export;
mod gc;
mod replay;

pub use export::{ReplicasUsage, UsageEntry};
pub use gc::{GcMismatch, GcReport};
pub use key::{AccountingKey, AccountingType, ReplicasEntry, TypeFilter};
pub use mem::TableConfig;
pub use replay::ReplayReport;
pub use replicas::ReplicasRegistry;
pub use usage::{DevTypeUsage, DevUsageSnapshot, FsUsageSnapshot};

use cfs_error::{CfsError, Result};
use cfs_ledger::{Ledger, Transaction};
use cfs_types::{Bversion, Counters, DataType, DeviceIndex, MAX_COUNTERS, Pos};
use mem::{AccountingMem, MemEntry};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One reported consistency finding: the stable code plus rendered detail.
#[derive(Debug, Clone, Serialize)]
pub struct InconsistencyReport {
    pub code: cfs_error::Inconsistency,
    pub detail: String,
}

/// How an update reaches the in-memory table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyMode {
    /// Transaction commit path.
    Normal,
    /// Mount-time replay of trusted persisted state; skips the
    /// needs-mark gate (the registry is repaired afterwards).
    Read,
    /// GC reconciliation scan; lands in the shadow counters.
    Gc,
}

/// The filesystem-wide accounting subsystem.
///
/// One instance per mounted filesystem, created at mount and dropped at
/// unmount. Never a process-wide singleton: concurrently mounted
/// instances share nothing.
#[derive(Debug)]
pub struct Accounting {
    /// The mark lock and the table it guards.
    mem: RwLock<AccountingMem>,
    usage: usage::FsUsage,
    dev_usage: usage::DevUsageTable,
    write_enabled: AtomicBool,
}

impl Accounting {
    #[must_use]
    pub fn new(config: TableConfig) -> Self {
        Self {
            mem: RwLock::new(AccountingMem::new(config)),
            usage: usage::FsUsage::default(),
            dev_usage: usage::DevUsageTable::default(),
            write_enabled: AtomicBool::new(false),
        }
    }

    /// Queue an accounting delta, or apply it to the GC shadow.
    ///
    /// Normalizes `key` in place, then either queues a buffered update on
    /// `txn` (normal path) or, with `gc` set, applies straight into the
    /// shadow counters (the reconciliation scan's path, which bypasses
    /// the transactional buffer entirely).
    ///
    /// # Errors
    ///
    /// [`CfsError::InvalidKey`] if the key fails validation after
    /// normalization; GC-path errors from the table itself.
    ///
    /// # Panics
    ///
    /// Panics if `deltas` is empty or longer than [`MAX_COUNTERS`].
    pub fn acct_mod(
        &self,
        txn: &mut Transaction,
        key: &mut AccountingKey,
        deltas: &[i64],
        registry: &ReplicasRegistry,
        gc: bool,
    ) -> Result<()> {
        assert!(!deltas.is_empty() && deltas.len() <= MAX_COUNTERS);

        key.normalize();
        key.validate().map_err(CfsError::InvalidKey)?;

        let counters = Counters::from_slice(deltas);
        let pos = key.encode();

        if gc {
            self.mem_apply(registry, pos, Bversion::ZERO, &counters, ApplyMode::Gc)
        } else {
            txn.update_buffered(pos, counters);
            Ok(())
        }
    }

    /// Adjust one device's cached-sector count by a signed amount.
    pub fn mod_dev_cached_sectors(
        &self,
        txn: &mut Transaction,
        dev: DeviceIndex,
        sectors: i64,
        registry: &ReplicasRegistry,
        gc: bool,
    ) -> Result<()> {
        let mut key = AccountingKey::Replicas(ReplicasEntry::cached(dev));
        self.acct_mod(txn, &mut key, &[sectors], registry, gc)
    }

    /// Commit a transaction's buffered accounting updates.
    ///
    /// Replicas configurations named by the updates are marked in the
    /// superblock registry first, so the normal path never trips the
    /// needs-mark gate. Each stamped entry is then applied to the
    /// in-memory table and folded into the cached summaries.
    pub fn commit(
        &self,
        txn: Transaction,
        ledger: &Ledger,
        registry: &ReplicasRegistry,
    ) -> Result<()> {
        for u in txn.updates() {
            if let Ok(AccountingKey::Replicas(e)) = AccountingKey::decode(u.pos) {
                if !registry.is_marked(&e) {
                    registry.mark(&e);
                }
            }
        }

        let entries = ledger.commit(txn);
        for e in &entries {
            self.mem_apply(registry, e.pos, e.bversion, &e.counters, ApplyMode::Normal)?;
            if let Ok(key) = AccountingKey::decode(e.pos) {
                self.usage.fold(&key, &e.counters);
                if let AccountingKey::DevDataType { dev, data_type } = key {
                    self.dev_usage.fold(dev, data_type, &e.counters);
                }
            }
        }
        Ok(())
    }

    /// Current live aggregate for one key. Unknown keys read as zero.
    #[must_use]
    pub fn read_key(&self, key: &AccountingKey) -> Counters {
        let mut key = key.clone();
        key.normalize();
        self.mem.read().read(key.encode(), false)
    }

    /// Current GC-shadow aggregate for one key, zero outside a GC pass.
    #[must_use]
    pub fn read_key_gc(&self, key: &AccountingKey) -> Counters {
        let mut key = key.clone();
        key.normalize();
        self.mem.read().read(key.encode(), true)
    }

    /// Remove all-zero entries from the table.
    pub fn compact(&self) {
        self.mem.write().compact();
    }

    /// Number of live table entries.
    #[must_use]
    pub fn nr_entries(&self) -> usize {
        self.mem.read().entries().len()
    }

    /// Flip the subsystem into (or out of) write-enabled operation.
    pub fn set_write_enabled(&self, enabled: bool) {
        self.write_enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn is_write_enabled(&self) -> bool {
        self.write_enabled.load(Ordering::Acquire)
    }

    // ── Device lifecycle ────────────────────────────────────────────────

    /// Seed accounting for a newly added device: all buckets free.
    pub fn dev_usage_init(
        &self,
        ledger: &Ledger,
        registry: &ReplicasRegistry,
        dev: DeviceIndex,
        nr_buckets: u64,
    ) -> Result<()> {
        let mut txn = Transaction::new();
        let mut key = AccountingKey::DevDataType {
            dev,
            data_type: DataType::Free,
        };
        let v = [i64::try_from(nr_buckets).unwrap_or(i64::MAX), 0, 0];
        self.acct_mod(&mut txn, &mut key, &v, registry, false)?;
        self.commit(txn, ledger, registry)
    }

    /// Retire a device: zero out its `dev_data_type` entries everywhere.
    ///
    /// Flushes the write buffer so the persisted sums are current, commits
    /// one corrective delta per entry, flushes again so the zero sums drop
    /// out of the ledger, and compacts the table.
    pub fn dev_usage_remove(
        &self,
        ledger: &Ledger,
        registry: &ReplicasRegistry,
        dev: DeviceIndex,
    ) -> Result<()> {
        ledger.flush();

        let mut txn = Transaction::new();
        for e in ledger.iter_persisted() {
            if let Ok(AccountingKey::DevDataType { dev: d, data_type }) =
                AccountingKey::decode(e.pos)
            {
                if d == dev {
                    let neg: Vec<i64> =
                        e.counters.as_slice().iter().map(|v| v.wrapping_neg()).collect();
                    let mut key = AccountingKey::DevDataType { dev: d, data_type };
                    self.acct_mod(&mut txn, &mut key, &neg, registry, false)?;
                }
            }
        }
        if !txn.is_empty() {
            self.commit(txn, ledger, registry)?;
        }

        ledger.flush();
        ledger.journal_reclaim();
        self.compact();
        self.dev_usage.remove(dev);

        tracing::debug!(target: "cfs::accounting", dev = dev.0, "dev_usage_removed");
        Ok(())
    }

    // ── Table application ───────────────────────────────────────────────

    /// Apply one stamped delta to the in-memory table.
    ///
    /// Fast path runs under the shared mark lock. When the entry is
    /// missing, the shared lock is dropped, the needs-mark gate is
    /// checked, and the insert happens under the exclusive lock; the loop
    /// then retakes the shared side and applies. Losing an insert race is
    /// fine, `insert_or_get` finds the winner's entry.
    pub(crate) fn mem_apply(
        &self,
        registry: &ReplicasRegistry,
        pos: Pos,
        bversion: Bversion,
        deltas: &Counters,
        mode: ApplyMode,
    ) -> Result<()> {
        loop {
            {
                let mem = self.mem.read();
                if let Some(entry) = mem.find(pos) {
                    Self::entry_apply(entry, mem.gc_running(), mem.nr_shards(), bversion, deltas, mode);
                    return Ok(());
                }
            }

            if mode != ApplyMode::Read {
                if let Ok(AccountingKey::Replicas(e)) = AccountingKey::decode(pos) {
                    if !registry.is_marked(&e) {
                        return Err(CfsError::NeedsReplicasMark);
                    }
                }
            }

            let mut mem = self.mem.write();
            mem.insert_or_get(pos, deltas.nr())?;
        }
    }

    fn entry_apply(
        entry: &MemEntry,
        gc_running: bool,
        nr_shards: usize,
        bversion: Bversion,
        deltas: &Counters,
        mode: ApplyMode,
    ) {
        // Idempotent replay: a stamp at or below the last applied one has
        // already been accounted for.
        if mode != ApplyMode::Gc && !bversion.is_zero() && bversion <= entry.bversion() {
            tracing::trace!(
                target: "cfs::accounting",
                pos = ?entry.pos,
                bversion = bversion.0,
                applied = entry.bversion().0,
                "accounting_apply_skip"
            );
            return;
        }

        let shard = current_shard(nr_shards);
        let target = if mode == ApplyMode::Gc && gc_running {
            entry.shadow().unwrap_or_else(|| entry.live())
        } else {
            entry.live()
        };
        target.add(shard, deltas);

        if mode != ApplyMode::Gc {
            entry.advance_bversion(bversion);
        }
    }
}

/// Shard index of the calling execution context.
///
/// Threads are assigned round-robin on first use; the assignment is
/// cached in a thread-local so the hot path is a single modulo.
fn current_shard(nr_shards: usize) -> usize {
    use std::cell::Cell;

    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static SHARD: Cell<usize> = const { Cell::new(usize::MAX) };
    }

    SHARD.with(|s| {
        let mut v = s.get();
        if v == usize::MAX {
            v = NEXT.fetch_add(1, Ordering::Relaxed);
            s.set(v);
        }
        v % nr_shards.max(1)
    })
}

/// Counter-wise equality, padding the shorter value with zeros.
pub(crate) fn counters_eq(a: &Counters, b: &Counters) -> bool {
    (0..MAX_COUNTERS).all(|i| a.get(i) == b.get(i))
}
