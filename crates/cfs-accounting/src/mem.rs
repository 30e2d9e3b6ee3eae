//! In-memory accounting table.
//!
//! A sorted array of entries, one per accounting key, binary-searched by
//! encoded position. Each entry owns per-shard counter storage (one slot
//! group per concurrent execution context) so that delta application under
//! the shared side of the mark lock never contends on a cache line; reads
//! sum across shards.
//!
//! During a GC reconciliation pass every entry additionally carries a
//! shadow counter group; gc-mode updates land there, and the live/shadow
//! comparison happens in [`crate::Accounting::gc_done`].
//!
//! Structural changes (insert, compaction, GC transitions) require the
//! exclusive side of the mark lock and are handled by the owning
//! [`crate::Accounting`]; this module is the storage itself.

use cfs_error::CfsError;
use cfs_types::{Bversion, Counters, MAX_COUNTERS, Pos};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Table sizing knobs.
#[derive(Debug, Clone, Copy)]
pub struct TableConfig {
    /// Counter shards per entry. One per worker context is ideal; more
    /// just wastes memory.
    pub nr_shards: usize,
    /// Entry-count cap. Exceeding it fails the triggering update with an
    /// out-of-memory condition and leaves no partial entry behind.
    pub max_entries: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            nr_shards: std::thread::available_parallelism().map_or(4, |n| n.get().min(16)),
            max_entries: 1 << 20,
        }
    }
}

/// Per-shard counter storage: `nr_shards * nr_counters` atomic slots.
#[derive(Debug)]
pub(crate) struct ShardedCounters {
    nr_counters: usize,
    slots: Box<[AtomicI64]>,
}

impl ShardedCounters {
    fn new(nr_shards: usize, nr_counters: usize) -> Self {
        debug_assert!(nr_counters >= 1 && nr_counters <= MAX_COUNTERS);
        let slots = (0..nr_shards * nr_counters)
            .map(|_| AtomicI64::new(0))
            .collect();
        Self { nr_counters, slots }
    }

    pub(crate) fn add(&self, shard: usize, deltas: &Counters) {
        let base = shard * self.nr_counters;
        for i in 0..self.nr_counters.min(deltas.nr()) {
            self.slots[base + i].fetch_add(deltas.get(i), Ordering::Relaxed);
        }
    }

    /// Sum all shards into a flat value.
    ///
    /// Relaxed loads: a reader racing a concurrent delta may see a value
    /// from before or after that delta, which the advisory-read contract
    /// allows. Exact reads (GC compare, compaction) run under the
    /// exclusive mark lock where no writer can race.
    pub(crate) fn read(&self) -> Counters {
        let mut acc = [0_i64; MAX_COUNTERS];
        for (slot_idx, slot) in self.slots.iter().enumerate() {
            let c = slot_idx % self.nr_counters;
            acc[c] = acc[c].wrapping_add(slot.load(Ordering::Relaxed));
        }
        Counters::from_slice(&acc[..self.nr_counters])
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.read().is_zero()
    }
}

/// One key's in-memory state.
#[derive(Debug)]
pub(crate) struct MemEntry {
    pub(crate) pos: Pos,
    /// Last-applied version stamp; advances monotonically via `fetch_max`.
    bversion: AtomicU64,
    nr_counters: usize,
    live: ShardedCounters,
    shadow: Option<ShardedCounters>,
}

impl MemEntry {
    pub(crate) fn bversion(&self) -> Bversion {
        Bversion(self.bversion.load(Ordering::Acquire))
    }

    pub(crate) fn advance_bversion(&self, v: Bversion) {
        self.bversion.fetch_max(v.0, Ordering::AcqRel);
    }

    pub(crate) fn nr_counters(&self) -> usize {
        self.nr_counters
    }

    pub(crate) fn live(&self) -> &ShardedCounters {
        &self.live
    }

    pub(crate) fn shadow(&self) -> Option<&ShardedCounters> {
        self.shadow.as_ref()
    }

    fn is_zero(&self) -> bool {
        self.live.is_zero() && self.shadow.as_ref().is_none_or(ShardedCounters::is_zero)
    }
}

/// The table proper. Guarded by the mark lock in [`crate::Accounting`].
#[derive(Debug)]
pub(crate) struct AccountingMem {
    /// Sorted by `pos`.
    entries: Vec<MemEntry>,
    nr_shards: usize,
    max_entries: usize,
    gc_running: bool,
}

impl AccountingMem {
    pub(crate) fn new(config: TableConfig) -> Self {
        Self {
            entries: Vec::new(),
            nr_shards: config.nr_shards.max(1),
            max_entries: config.max_entries,
            gc_running: false,
        }
    }

    pub(crate) fn nr_shards(&self) -> usize {
        self.nr_shards
    }

    pub(crate) fn gc_running(&self) -> bool {
        self.gc_running
    }

    pub(crate) fn entries(&self) -> &[MemEntry] {
        &self.entries
    }

    pub(crate) fn find(&self, pos: Pos) -> Option<&MemEntry> {
        self.entries
            .binary_search_by(|e| e.pos.cmp(&pos))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// First entry at or after `pos`, for cursor-style scans.
    pub(crate) fn find_ge(&self, pos: Pos) -> Option<&MemEntry> {
        let idx = match self.entries.binary_search_by(|e| e.pos.cmp(&pos)) {
            Ok(idx) | Err(idx) => idx,
        };
        self.entries.get(idx)
    }

    /// Insert an entry for `pos` if none exists.
    ///
    /// Idempotent: losing an insert race (the caller re-checks under the
    /// exclusive lock) just finds the winner's entry. A full table is an
    /// out-of-memory condition; nothing is left behind.
    pub(crate) fn insert_or_get(
        &mut self,
        pos: Pos,
        nr_counters: usize,
    ) -> Result<&MemEntry, CfsError> {
        let idx = match self.entries.binary_search_by(|e| e.pos.cmp(&pos)) {
            Ok(idx) => return Ok(&self.entries[idx]),
            Err(idx) => idx,
        };

        if self.entries.len() >= self.max_entries {
            return Err(CfsError::NoMem {
                what: "accounting table entry",
            });
        }

        let entry = MemEntry {
            pos,
            bversion: AtomicU64::new(0),
            nr_counters,
            live: ShardedCounters::new(self.nr_shards, nr_counters),
            shadow: self
                .gc_running
                .then(|| ShardedCounters::new(self.nr_shards, nr_counters)),
        };
        self.entries.insert(idx, entry);

        tracing::debug!(
            target: "cfs::accounting",
            pos = ?pos,
            nr_counters,
            nr_entries = self.entries.len(),
            "accounting_mem_insert"
        );

        Ok(&self.entries[idx])
    }

    /// Read one key's counters, summed across shards.
    ///
    /// An absent key reads as all-zero; there is no not-found error.
    pub(crate) fn read(&self, pos: Pos, want_shadow: bool) -> Counters {
        match self.find(pos) {
            Some(e) if want_shadow => e
                .shadow()
                .map_or_else(|| Counters::zeroed(e.nr_counters), ShardedCounters::read),
            Some(e) => e.live.read(),
            None => Counters::zeroed(MAX_COUNTERS),
        }
    }

    /// Remove all-zero entries. Order is preserved, so the sorted-array
    /// invariant survives without a re-sort.
    pub(crate) fn compact(&mut self) {
        let before = self.entries.len();
        self.entries.retain(|e| !e.is_zero());
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(
                target: "cfs::accounting",
                removed,
                remaining = self.entries.len(),
                "accounting_mem_compact"
            );
        }
    }

    /// Allocate shadow storage for every entry and mark GC active.
    pub(crate) fn gc_start(&mut self) {
        for e in &mut self.entries {
            e.shadow = Some(ShardedCounters::new(self.nr_shards, e.nr_counters));
        }
        self.gc_running = true;
    }

    /// Free all shadow storage and clear GC active.
    pub(crate) fn gc_free(&mut self) {
        for e in &mut self.entries {
            e.shadow = None;
        }
        self.gc_running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(tag: u8) -> Pos {
        let mut b = [0_u8; cfs_types::ACCOUNTING_POS_BYTES];
        b[0] = tag;
        Pos(b)
    }

    fn table() -> AccountingMem {
        AccountingMem::new(TableConfig {
            nr_shards: 4,
            max_entries: 8,
        })
    }

    #[test]
    fn insert_keeps_entries_sorted() {
        let mut mem = table();
        for tag in [5_u8, 1, 3] {
            mem.insert_or_get(pos(tag), 1).expect("insert");
        }
        let tags: Vec<u8> = mem.entries().iter().map(|e| e.pos.0[0]).collect();
        assert_eq!(tags, vec![1, 3, 5]);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut mem = table();
        mem.insert_or_get(pos(1), 2).expect("insert");
        mem.find(pos(1))
            .expect("entry")
            .live()
            .add(0, &Counters::from_slice(&[7, 8]));

        // Second insert finds the existing entry, counters intact.
        mem.insert_or_get(pos(1), 2).expect("insert");
        assert_eq!(mem.entries().len(), 1);
        assert_eq!(mem.read(pos(1), false).as_slice(), &[7, 8]);
    }

    #[test]
    fn full_table_reports_nomem_and_leaves_nothing() {
        let mut mem = AccountingMem::new(TableConfig {
            nr_shards: 1,
            max_entries: 1,
        });
        mem.insert_or_get(pos(1), 1).expect("first insert");
        let err = mem.insert_or_get(pos(2), 1).expect_err("table full");
        assert!(matches!(err, CfsError::NoMem { .. }));
        assert_eq!(mem.entries().len(), 1);
        assert!(mem.find(pos(2)).is_none());
    }

    #[test]
    fn shard_sums_combine_on_read() {
        let mut mem = table();
        mem.insert_or_get(pos(1), 3).expect("insert");
        let e = mem.find(pos(1)).expect("entry");
        e.live().add(0, &Counters::from_slice(&[1, 10, 100]));
        e.live().add(1, &Counters::from_slice(&[2, 20, 200]));
        e.live().add(3, &Counters::from_slice(&[3, 30, 300]));
        assert_eq!(mem.read(pos(1), false).as_slice(), &[6, 60, 600]);
    }

    #[test]
    fn absent_key_reads_zero() {
        let mem = table();
        assert!(mem.read(pos(9), false).is_zero());
        assert!(mem.read(pos(9), true).is_zero());
    }

    #[test]
    fn compact_removes_zero_entries_only() {
        let mut mem = table();
        mem.insert_or_get(pos(1), 1).expect("insert");
        mem.insert_or_get(pos(2), 1).expect("insert");
        mem.insert_or_get(pos(3), 1).expect("insert");
        mem.find(pos(2))
            .expect("entry")
            .live()
            .add(0, &Counters::from_slice(&[5]));

        mem.compact();
        let tags: Vec<u8> = mem.entries().iter().map(|e| e.pos.0[0]).collect();
        assert_eq!(tags, vec![2]);
        assert_eq!(mem.read(pos(2), false).as_slice(), &[5]);
    }

    #[test]
    fn compact_keeps_entries_with_nonzero_shadow() {
        let mut mem = table();
        mem.insert_or_get(pos(1), 1).expect("insert");
        mem.gc_start();
        mem.find(pos(1))
            .expect("entry")
            .shadow()
            .expect("shadow")
            .add(0, &Counters::from_slice(&[3]));

        mem.compact();
        assert_eq!(mem.entries().len(), 1);
    }

    #[test]
    fn gc_start_allocates_shadow_for_existing_and_new() {
        let mut mem = table();
        mem.insert_or_get(pos(1), 1).expect("insert");
        assert!(mem.find(pos(1)).expect("entry").shadow().is_none());

        mem.gc_start();
        assert!(mem.find(pos(1)).expect("entry").shadow().is_some());

        // Entries inserted while GC runs get a shadow too.
        mem.insert_or_get(pos(2), 1).expect("insert");
        assert!(mem.find(pos(2)).expect("entry").shadow().is_some());

        mem.gc_free();
        assert!(mem.find(pos(1)).expect("entry").shadow().is_none());
        assert!(mem.find(pos(2)).expect("entry").shadow().is_none());
        assert!(!mem.gc_running());
    }

    #[test]
    fn bversion_advances_monotonically() {
        let mut mem = table();
        mem.insert_or_get(pos(1), 1).expect("insert");
        let e = mem.find(pos(1)).expect("entry");
        e.advance_bversion(Bversion(10));
        e.advance_bversion(Bversion(5));
        assert_eq!(e.bversion(), Bversion(10));
        e.advance_bversion(Bversion(11));
        assert_eq!(e.bversion(), Bversion(11));
    }

    #[test]
    fn find_ge_walks_in_order() {
        let mut mem = table();
        for tag in [2_u8, 4, 6] {
            mem.insert_or_get(pos(tag), 1).expect("insert");
        }
        assert_eq!(mem.find_ge(Pos::MIN).expect("first").pos, pos(2));
        assert_eq!(mem.find_ge(pos(3)).expect("mid").pos, pos(4));
        assert_eq!(mem.find_ge(pos(6)).expect("exact").pos, pos(6));
        assert!(mem.find_ge(pos(7)).is_none());
    }
}
