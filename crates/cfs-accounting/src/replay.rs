//! Mount-time accounting replay.
//!
//! Runs single-threaded, before the filesystem accepts writes:
//!
//! 1. the persisted ledger is scanned in key order and applied as trusted
//!    `Read`-mode updates;
//! 2. the journal replay stream is scanned in position order: entries
//!    already reflected in the ledger (stamp at or below the recorded one)
//!    are skipped, and consecutive entries for the same key are coalesced
//!    into a single apply;
//! 3. every nonzero replicas-class entry is cross-checked against the
//!    superblock registry, and unmarked configurations are repaired in
//!    place;
//! 4. the cached usage summaries are derived from the fully-replayed
//!    table.
//!
//! Malformed persisted keys are reported and skipped; a corrupt counter
//! never aborts the mount.

use crate::key::AccountingKey;
use crate::{Accounting, ApplyMode, InconsistencyReport, ReplicasRegistry};
use cfs_error::{Inconsistency, Result};
use cfs_ledger::Ledger;
use serde::Serialize;

/// What replay did, for logging and tests.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReplayReport {
    /// Entries applied from the persisted ledger.
    pub ledger_entries: usize,
    /// Journal entries applied (after coalescing).
    pub journal_entries: usize,
    /// Journal entries skipped as already reflected in the ledger.
    pub journal_skipped: usize,
    /// Journal entries folded into a predecessor for the same key.
    pub journal_coalesced: usize,
    /// Replicas configurations marked into the registry as repair.
    pub repaired_replicas: usize,
    /// Findings reported along the way.
    pub inconsistencies: Vec<InconsistencyReport>,
}

impl ReplayReport {
    fn report(&mut self, code: Inconsistency, detail: String) {
        tracing::warn!(target: "cfs::accounting", %code, detail = %detail, "accounting_inconsistency");
        self.inconsistencies.push(InconsistencyReport { code, detail });
    }
}

impl Accounting {
    /// Initialize the in-memory accounting from the ledger and journal.
    ///
    /// # Errors
    ///
    /// Only table-level failures ([`cfs_error::CfsError::NoMem`]) abort the
    /// read; malformed keys are reported in the returned
    /// [`ReplayReport`] and skipped.
    pub fn accounting_read(
        &self,
        ledger: &Ledger,
        registry: &ReplicasRegistry,
    ) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();

        for e in ledger.iter_persisted() {
            match AccountingKey::validate_pos(e.pos, e.bversion) {
                Ok(_) => {
                    self.mem_apply(registry, e.pos, e.bversion, &e.counters, ApplyMode::Read)?;
                    report.ledger_entries += 1;
                }
                Err(code) => report.report(code, format!("{:?}", e.pos)),
            }
        }

        let stream = ledger.replay_stream();
        let mut i = 0;
        while i < stream.len() {
            let mut e = stream[i];
            i += 1;

            let recorded = {
                let mem = self.mem.read();
                mem.find(e.pos).map(crate::mem::MemEntry::bversion)
            };
            if recorded.is_some_and(|v| v >= e.bversion) {
                report.journal_skipped += 1;
                continue;
            }

            // The stream may hold several not-yet-flushed deltas for one
            // key; sum them and apply once under the latest stamp.
            while i < stream.len() && stream[i].pos == e.pos {
                e.counters.accumulate(&stream[i].counters);
                e.bversion = e.bversion.max(stream[i].bversion);
                report.journal_coalesced += 1;
                i += 1;
            }

            match AccountingKey::validate_pos(e.pos, e.bversion) {
                Ok(_) => {
                    self.mem_apply(registry, e.pos, e.bversion, &e.counters, ApplyMode::Read)?;
                    report.journal_entries += 1;
                }
                Err(code) => report.report(code, format!("{:?}", e.pos)),
            }
        }

        self.check_replicas_marked(registry, &mut report);
        self.seed_usage_summaries();

        tracing::debug!(
            target: "cfs::accounting",
            ledger_entries = report.ledger_entries,
            journal_entries = report.journal_entries,
            journal_skipped = report.journal_skipped,
            journal_coalesced = report.journal_coalesced,
            repaired_replicas = report.repaired_replicas,
            "accounting_read_done"
        );
        Ok(report)
    }

    /// Repair the superblock registry for replicas entries replay found.
    ///
    /// Still single-threaded and not yet write-enabled here, so dropping
    /// the shared lock before amending the registry is safe.
    fn check_replicas_marked(&self, registry: &ReplicasRegistry, report: &mut ReplayReport) {
        let unmarked: Vec<_> = {
            let mem = self.mem.read();
            mem.entries()
                .iter()
                .filter_map(|en| {
                    if en.live().read().is_zero() {
                        return None;
                    }
                    match AccountingKey::decode(en.pos) {
                        Ok(AccountingKey::Replicas(r)) if r.validate().is_ok() => {
                            (!registry.is_marked(&r)).then_some(r)
                        }
                        _ => None,
                    }
                })
                .collect()
        };

        for r in unmarked {
            report.report(
                Inconsistency::AccountingReplicasNotMarked,
                r.to_string(),
            );
            registry.mark(&r);
            report.repaired_replicas += 1;
        }
    }

    /// Derive the cached filesystem and per-device summaries from the
    /// replayed table.
    fn seed_usage_summaries(&self) {
        let mem = self.mem.read();
        for en in mem.entries() {
            let Ok(key) = AccountingKey::decode(en.pos) else {
                continue;
            };
            let counters = en.live().read();
            self.usage.fold(&key, &counters);
            if let AccountingKey::DevDataType { dev, data_type } = key {
                self.dev_usage.fold(dev, data_type, &counters);
            }
        }
    }
}
