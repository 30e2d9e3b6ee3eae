#![forbid(unsafe_code)]
//! Transactional ledger plumbing for accounting updates.
//!
//! This crate models the three primitives the transactional engine exposes
//! to the accounting subsystem:
//!
//! - a **buffered transactional update**: [`Transaction::update_buffered`]
//!   queues a (position, delta) pair; nothing is visible until commit;
//! - **commit ordering**: [`Ledger::commit`] stamps every buffered update
//!   with a [`Bversion`] derived from (journal sequence, offset within the
//!   journal buffer) and appends it to both the write buffer and the
//!   journal replay stream;
//! - **ordered key iteration**: [`Ledger::iter_persisted`] walks the
//!   flushed store in byte-comparable key order.
//!
//! The write buffer is asynchronous with respect to commit: committed
//! entries sit in `pending` until [`Ledger::flush`] folds them into the
//! persisted store with *delta* semantics: counters are added to whatever
//! sum already exists at that position, never overwritten. Entries whose
//! persisted sum reaches all-zero are dropped.
//!
//! A commit is all-or-nothing: a transaction dropped before commit leaves
//! no trace anywhere.

use cfs_types::{Bversion, Counters, JournalSeq, Pos};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// One queued accounting update inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedUpdate {
    pub pos: Pos,
    pub deltas: Counters,
}

/// A committed ledger record: (position, version stamp, delta counters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentEntry {
    pub pos: Pos,
    pub bversion: Bversion,
    pub counters: Counters,
}

/// A transaction's buffered accounting updates.
///
/// Deltas queued here become externally visible only at
/// [`Ledger::commit`]; dropping the transaction discards them, so a
/// restarted transaction can re-queue from scratch any number of times.
#[derive(Debug, Default)]
pub struct Transaction {
    updates: Vec<BufferedUpdate>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a buffered update against the ledger.
    pub fn update_buffered(&mut self, pos: Pos, deltas: Counters) {
        self.updates.push(BufferedUpdate { pos, deltas });
    }

    #[must_use]
    pub fn updates(&self) -> &[BufferedUpdate] {
        &self.updates
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Write buffer thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBufferConfig {
    /// Pending-entry count above which [`Ledger::should_flush`] reports true.
    pub max_pending: usize,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self { max_pending: 1024 }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    /// Committed, not yet flushed.
    pending: Vec<PersistentEntry>,
    /// Flushed sums, in key order.
    persisted: BTreeMap<Pos, PersistentEntry>,
    /// Journal replay stream: committed entries in commit order, retained
    /// until reclaimed.
    journal: Vec<PersistentEntry>,
}

/// The persistent, delta-accumulating accounting store plus its write
/// buffer and journal stream.
#[derive(Debug)]
pub struct Ledger {
    journal_seq: AtomicU64,
    state: RwLock<LedgerState>,
    config: WriteBufferConfig,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(WriteBufferConfig::default())
    }
}

impl Ledger {
    #[must_use]
    pub fn new(config: WriteBufferConfig) -> Self {
        Self {
            journal_seq: AtomicU64::new(1),
            state: RwLock::new(LedgerState::default()),
            config,
        }
    }

    /// Commit a transaction's buffered updates.
    ///
    /// Each update is stamped with a [`Bversion`] from (journal sequence,
    /// offset within the buffer) and appended to the write buffer and the
    /// journal stream. Returns the stamped entries so the caller can
    /// propagate them to the in-memory table.
    pub fn commit(&self, txn: Transaction) -> Vec<PersistentEntry> {
        if txn.is_empty() {
            return Vec::new();
        }

        let seq = JournalSeq(self.journal_seq.fetch_add(1, Ordering::SeqCst));
        let entries: Vec<PersistentEntry> = txn
            .updates
            .into_iter()
            .enumerate()
            .map(|(offset, u)| PersistentEntry {
                pos: u.pos,
                bversion: Bversion::from_parts(
                    seq,
                    u32::try_from(offset).unwrap_or(u32::MAX),
                ),
                counters: u.deltas,
            })
            .collect();

        let mut state = self.state.write();
        state.pending.extend(entries.iter().copied());
        state.journal.extend(entries.iter().copied());

        tracing::trace!(
            target: "cfs::ledger",
            journal_seq = seq.0,
            nr_updates = entries.len(),
            pending = state.pending.len(),
            "ledger_commit"
        );

        entries
    }

    /// Whether the write buffer has grown past its flush threshold.
    #[must_use]
    pub fn should_flush(&self) -> bool {
        self.state.read().pending.len() > self.config.max_pending
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.read().pending.len()
    }

    /// Flush the write buffer into the persisted store.
    ///
    /// Deltas are accumulated into the existing sum at each position; the
    /// recorded bversion advances to the maximum seen. Positions whose sum
    /// reaches all-zero are removed.
    pub fn flush(&self) {
        let mut state = self.state.write();
        let drained = std::mem::take(&mut state.pending);
        let nr = drained.len();

        for e in drained {
            let slot = state.persisted.entry(e.pos).or_insert(PersistentEntry {
                pos: e.pos,
                bversion: Bversion::ZERO,
                counters: Counters::zeroed(e.counters.nr()),
            });
            slot.counters.accumulate(&e.counters);
            slot.bversion = slot.bversion.max(e.bversion);
        }

        state.persisted.retain(|_, e| !e.counters.is_zero());

        tracing::debug!(
            target: "cfs::ledger",
            flushed = nr,
            persisted = state.persisted.len(),
            "ledger_flush"
        );
    }

    /// Drop journal entries already reflected in the persisted store.
    pub fn journal_reclaim(&self) {
        let mut state = self.state.write();
        let persisted_version = |pos: &Pos| {
            state
                .persisted
                .get(pos)
                .map_or(Bversion::ZERO, |e| e.bversion)
        };
        let keep: Vec<PersistentEntry> = state
            .journal
            .iter()
            .filter(|e| e.bversion > persisted_version(&e.pos))
            .copied()
            .collect();
        let dropped = state.journal.len() - keep.len();
        state.journal = keep;

        tracing::debug!(
            target: "cfs::ledger",
            dropped,
            retained = state.journal.len(),
            "journal_reclaim"
        );
    }

    /// Snapshot of the persisted store in key order.
    #[must_use]
    pub fn iter_persisted(&self) -> Vec<PersistentEntry> {
        self.state.read().persisted.values().copied().collect()
    }

    /// The persisted sum at one position, if any.
    #[must_use]
    pub fn persisted_get(&self, pos: Pos) -> Option<PersistentEntry> {
        self.state.read().persisted.get(&pos).copied()
    }

    /// The journal replay stream, sorted by (position, bversion).
    ///
    /// Consecutive same-position runs are what mount-time replay coalesces.
    #[must_use]
    pub fn replay_stream(&self) -> Vec<PersistentEntry> {
        let mut stream = self.state.read().journal.clone();
        stream.sort_by(|a, b| (a.pos, a.bversion).cmp(&(b.pos, b.bversion)));
        stream
    }
}
