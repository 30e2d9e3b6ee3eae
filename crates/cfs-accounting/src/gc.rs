//! GC reconciliation: recompute accounting ground truth and repair drift.
//!
//! A GC pass walks all filesystem metadata and re-derives every counter
//! from scratch. Contributions land in per-entry shadow counters (via
//! [`crate::Accounting::acct_mod`] with the gc flag), never touching the
//! live ones. When the walk finishes, [`crate::Accounting::gc_done`]
//! compares shadow against live per entry and, in repair mode, commits a
//! corrective delta that brings live forward to the recomputed truth.
//!
//! The comparison loop holds the exclusive mark lock only per entry,
//! re-finding its cursor position each iteration, because committing a
//! corrective delta re-enters the table through the normal (shared-lock)
//! path.

use crate::key::AccountingKey;
use crate::{Accounting, InconsistencyReport, ReplicasRegistry, counters_eq};
use cfs_error::{Inconsistency, Result};
use cfs_ledger::{Ledger, Transaction};
use cfs_types::Pos;
use serde::Serialize;

/// One live/recomputed divergence found by [`Accounting::gc_done`].
#[derive(Debug, Clone, Serialize)]
pub struct GcMismatch {
    pub key: AccountingKey,
    pub live: Vec<i64>,
    pub expected: Vec<i64>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct GcReport {
    pub mismatches: Vec<GcMismatch>,
    pub repaired: usize,
}

impl Accounting {
    /// Begin a reconciliation pass: allocate shadow counters for every
    /// entry and mark the table GC-active.
    ///
    /// # Errors
    ///
    /// On allocation failure every already-allocated shadow is freed and
    /// the table is left not GC-active.
    pub fn gc_start(&self) -> Result<()> {
        let mut mem = self.mem.write();
        mem.gc_start();
        tracing::debug!(
            target: "cfs::accounting",
            nr_entries = mem.entries().len(),
            "accounting_gc_start"
        );
        Ok(())
    }

    /// Finish a reconciliation pass: compare, optionally repair, free
    /// shadows.
    ///
    /// With `repair` set, each mismatch is fixed forward by committing
    /// `shadow − live` as a normal ledger update, which also folds the
    /// correction into the cached usage summaries. Without it, mismatches
    /// are only reported.
    pub fn gc_done(
        &self,
        ledger: &Ledger,
        registry: &ReplicasRegistry,
        repair: bool,
    ) -> Result<GcReport> {
        let mut report = GcReport::default();
        let mut cursor = Pos::MIN;

        loop {
            // One entry per exclusive-lock hold; the cursor survives
            // compaction or concurrent inserts between holds.
            let snapshot = {
                let mem = self.mem.write();
                mem.find_ge(cursor).map(|en| {
                    (en.pos, en.live().read(), en.shadow().map(super::mem::ShardedCounters::read))
                })
            };
            let Some((pos, live, shadow)) = snapshot else {
                break;
            };
            cursor = pos.successor();

            let Some(expected) = shadow else { continue };
            let Ok(key) = AccountingKey::decode(pos) else {
                continue;
            };

            if counters_eq(&live, &expected) {
                continue;
            }

            tracing::warn!(
                target: "cfs::accounting",
                code = %Inconsistency::AccountingMismatch,
                key = %key,
                got = %live,
                should_be = %expected,
                "accounting_gc_mismatch"
            );
            report.mismatches.push(GcMismatch {
                key: key.clone(),
                live: live.as_slice().to_vec(),
                expected: expected.as_slice().to_vec(),
            });

            if repair {
                let nr = live.nr().max(expected.nr());
                let delta: Vec<i64> = (0..nr)
                    .map(|i| expected.get(i).wrapping_sub(live.get(i)))
                    .collect();

                let mut txn = Transaction::new();
                let mut k = key;
                self.acct_mod(&mut txn, &mut k, &delta, registry, false)?;
                self.commit(txn, ledger, registry)?;
                report.repaired += 1;
            }
        }

        self.mem.write().gc_free();

        tracing::debug!(
            target: "cfs::accounting",
            mismatches = report.mismatches.len(),
            repaired = report.repaired,
            "accounting_gc_done"
        );
        Ok(report)
    }

    /// Cross-check the persisted ledger and the cached summaries against
    /// the in-memory table.
    ///
    /// Flushes the write buffer first so persisted sums are current. Used
    /// by consistency checks and unmount verification; findings are
    /// reported, never raised.
    #[must_use]
    pub fn verify_clean(&self, ledger: &Ledger) -> Vec<InconsistencyReport> {
        ledger.flush();
        let mut findings = Vec::new();

        for e in ledger.iter_persisted() {
            let Ok(key) = AccountingKey::decode(e.pos) else {
                continue;
            };
            let in_mem = self.mem.read().read(e.pos, false);
            if !counters_eq(&e.counters, &in_mem) {
                let detail = format!("{key}: {} != {in_mem}", e.counters);
                tracing::warn!(
                    target: "cfs::accounting",
                    code = %Inconsistency::AccountingMismatch,
                    detail = %detail,
                    "accounting_verify_mismatch"
                );
                findings.push(InconsistencyReport {
                    code: Inconsistency::AccountingMismatch,
                    detail,
                });
            }
        }

        let mut derived = crate::usage::FsUsageSnapshot::default();
        {
            let mem = self.mem.read();
            for en in mem.entries() {
                let Ok(key) = AccountingKey::decode(en.pos) else {
                    continue;
                };
                derived.accumulate_key(&key, &en.live().read());
            }
        }
        let cached = self.usage.snapshot();
        if derived != cached {
            let detail = format!("fs_usage_base mismatch: cached {cached:?}, derived {derived:?}");
            tracing::warn!(
                target: "cfs::accounting",
                code = %Inconsistency::AccountingMismatch,
                detail = %detail,
                "accounting_verify_mismatch"
            );
            findings.push(InconsistencyReport {
                code: Inconsistency::AccountingMismatch,
                detail,
            });
        }

        findings
    }
}
