//! End-to-end accounting flows: mutation, crash/remount replay, GC
//! reconciliation, and the dual-representation consistency laws.

use cfs_accounting::{
    Accounting, AccountingKey, AccountingType, ReplicasEntry, ReplicasRegistry, TableConfig,
    TypeFilter,
};
use cfs_ledger::{Ledger, Transaction};
use cfs_types::{DataType, DeviceIndex, SnapshotId};

fn new_table() -> Accounting {
    Accounting::new(TableConfig {
        nr_shards: 4,
        max_entries: 256,
    })
}

fn commit_delta(
    acct: &Accounting,
    ledger: &Ledger,
    registry: &ReplicasRegistry,
    key: &AccountingKey,
    deltas: &[i64],
) {
    let mut txn = Transaction::new();
    let mut k = key.clone();
    acct.acct_mod(&mut txn, &mut k, deltas, registry, false)
        .expect("acct_mod");
    acct.commit(txn, ledger, registry).expect("commit");
}

#[test]
fn remount_restores_exact_state() {
    let ledger = Ledger::default();
    let registry = ReplicasRegistry::new();

    let user_replicas = AccountingKey::Replicas(ReplicasEntry {
        data_type: DataType::User,
        nr_required: 1,
        devs: vec![DeviceIndex(0), DeviceIndex(1)],
    });
    let dev_free = AccountingKey::DevDataType {
        dev: DeviceIndex(0),
        data_type: DataType::Free,
    };

    {
        let acct = new_table();
        commit_delta(&acct, &ledger, &registry, &AccountingKey::NrInodes, &[100]);
        commit_delta(&acct, &ledger, &registry, &user_replicas, &[4096]);
        commit_delta(&acct, &ledger, &registry, &dev_free, &[512, 0, 0]);
        // Partial flush: only some commits reach the persisted ledger
        // before the "crash".
        ledger.flush();
        commit_delta(&acct, &ledger, &registry, &AccountingKey::NrInodes, &[-3]);
        commit_delta(&acct, &ledger, &registry, &user_replicas, &[1024]);
        // acct dropped here without another flush.
    }

    let acct = new_table();
    let report = acct
        .accounting_read(&ledger, &registry)
        .expect("replay at mount");
    assert_eq!(report.journal_entries, 2);

    assert_eq!(acct.read_key(&AccountingKey::NrInodes).as_slice(), &[97]);
    assert_eq!(acct.read_key(&user_replicas).as_slice(), &[5120]);
    assert_eq!(acct.read_key(&dev_free).as_slice(), &[512, 0, 0]);

    let usage = acct.fs_usage();
    assert_eq!(usage.nr_inodes, 97);
    assert_eq!(usage.data, 5120);
}

#[test]
fn sum_law_holds_across_flush_points() {
    let ledger = Ledger::default();
    let registry = ReplicasRegistry::new();
    let acct = new_table();

    let keys = [
        AccountingKey::NrInodes,
        AccountingKey::Snapshot { id: SnapshotId(1) },
        AccountingKey::Snapshot { id: SnapshotId(2) },
        AccountingKey::RebalanceWork,
    ];
    let mut expected = [0_i64; 4];

    for step in 0_i64..40 {
        let which = usize::try_from(step).expect("fits") % keys.len();
        let delta = (step % 7) - 3;
        commit_delta(&acct, &ledger, &registry, &keys[which], &[delta]);
        expected[which] += delta;
        if step % 11 == 0 {
            ledger.flush();
        }
    }

    for (key, want) in keys.iter().zip(expected) {
        assert_eq!(acct.read_key(key).as_slice(), &[want], "live {key}");
    }

    // The persisted side agrees after a final flush, and a remount
    // rebuilds the same aggregates from ledger + journal.
    ledger.flush();
    let remounted = new_table();
    remounted
        .accounting_read(&ledger, &registry)
        .expect("remount");
    for (key, want) in keys.iter().zip(expected) {
        assert_eq!(remounted.read_key(key).as_slice(), &[want], "remount {key}");
    }
}

#[test]
fn replaying_twice_changes_nothing() {
    let ledger = Ledger::default();
    let registry = ReplicasRegistry::new();

    {
        let acct = new_table();
        commit_delta(&acct, &ledger, &registry, &AccountingKey::NrInodes, &[9]);
        commit_delta(
            &acct,
            &ledger,
            &registry,
            &AccountingKey::Snapshot { id: SnapshotId(3) },
            &[77],
        );
        ledger.flush();
    }

    let acct = new_table();
    acct.accounting_read(&ledger, &registry).expect("first");
    let after_first = acct.read_key(&AccountingKey::NrInodes);

    // A second replay pass sees every stamp already applied.
    let report = acct.accounting_read(&ledger, &registry).expect("second");
    assert_eq!(report.journal_entries, 0);
    assert_eq!(acct.read_key(&AccountingKey::NrInodes), after_first);
    assert_eq!(
        acct.read_key(&AccountingKey::Snapshot { id: SnapshotId(3) })
            .as_slice(),
        &[77]
    );
}

#[test]
fn gc_cycle_reconciles_a_drifted_counter() {
    let ledger = Ledger::default();
    let registry = ReplicasRegistry::new();
    let acct = new_table();

    let dev_user = AccountingKey::DevDataType {
        dev: DeviceIndex(2),
        data_type: DataType::User,
    };
    let snapshot = AccountingKey::Snapshot { id: SnapshotId(9) };
    commit_delta(&acct, &ledger, &registry, &dev_user, &[10, 480, 3]);
    commit_delta(&acct, &ledger, &registry, &snapshot, &[200]);

    acct.gc_start().expect("gc start");

    // The metadata walk recomputes both keys; one of them drifted.
    let mut txn = Transaction::new();
    let mut k = dev_user.clone();
    acct.acct_mod(&mut txn, &mut k, &[10, 500, 3], &registry, true)
        .expect("gc contribution");
    let mut k = snapshot.clone();
    acct.acct_mod(&mut txn, &mut k, &[200], &registry, true)
        .expect("gc contribution");

    let report = acct.gc_done(&ledger, &registry, true).expect("gc done");
    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(report.mismatches[0].live, vec![10, 480, 3]);
    assert_eq!(report.mismatches[0].expected, vec![10, 500, 3]);

    assert_eq!(acct.read_key(&dev_user).as_slice(), &[10, 500, 3]);
    assert_eq!(acct.read_key(&snapshot).as_slice(), &[200]);

    // Post-repair state survives a remount.
    ledger.flush();
    let remounted = new_table();
    remounted
        .accounting_read(&ledger, &registry)
        .expect("remount");
    assert_eq!(remounted.read_key(&dev_user).as_slice(), &[10, 500, 3]);
    assert!(remounted.verify_clean(&ledger).is_empty());
}

#[test]
fn cached_sectors_wrapper_round_trip() {
    let ledger = Ledger::default();
    let registry = ReplicasRegistry::new();
    let acct = new_table();

    let mut txn = Transaction::new();
    acct.mod_dev_cached_sectors(&mut txn, DeviceIndex(1), 128, &registry, false)
        .expect("add");
    acct.mod_dev_cached_sectors(&mut txn, DeviceIndex(1), -28, &registry, false)
        .expect("sub");
    acct.commit(txn, &ledger, &registry).expect("commit");

    let usage = acct.replicas_usage();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].entry, ReplicasEntry::cached(DeviceIndex(1)));
    assert_eq!(usage[0].sectors, 100);
    assert_eq!(acct.fs_usage().cached, 100);
}

#[test]
fn export_views_agree_with_each_other() {
    let ledger = Ledger::default();
    let registry = ReplicasRegistry::new();
    let acct = new_table();

    let replicas = AccountingKey::Replicas(ReplicasEntry {
        data_type: DataType::Btree,
        nr_required: 1,
        devs: vec![DeviceIndex(0)],
    });
    commit_delta(&acct, &ledger, &registry, &replicas, &[256]);
    commit_delta(&acct, &ledger, &registry, &AccountingKey::NrInodes, &[5]);

    let typed = acct.usage_export(TypeFilter::only(&[AccountingType::Replicas]));
    let narrow = acct.replicas_usage();
    assert_eq!(typed.len(), 1);
    assert_eq!(narrow.len(), 1);
    assert_eq!(typed[0].counters[0], 256);
    assert_eq!(narrow[0].sectors, 256);

    let text = acct.to_text();
    assert!(text.contains("replicas btree: 1/1 [0]: 256"), "{text}");
    assert!(text.contains("nr_inodes: 5"), "{text}");
}

#[test]
fn transaction_dropped_before_commit_leaves_no_trace() {
    let ledger = Ledger::default();
    let registry = ReplicasRegistry::new();
    let acct = new_table();

    {
        let mut txn = Transaction::new();
        let mut key = AccountingKey::NrInodes;
        acct.acct_mod(&mut txn, &mut key, &[1000], &registry, false)
            .expect("mod");
        // txn dropped: the surrounding transaction aborted/restarted.
    }

    assert!(acct.read_key(&AccountingKey::NrInodes).is_zero());
    assert_eq!(ledger.pending_len(), 0);
    ledger.flush();
    assert!(ledger.iter_persisted().is_empty());

    let remounted = new_table();
    let report = remounted
        .accounting_read(&ledger, &registry)
        .expect("replay");
    assert_eq!(report.ledger_entries + report.journal_entries, 0);
}
