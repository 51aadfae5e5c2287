//! WAL invariants and crash-recovery behavior across reopen cycles.

use meteor_common::types::{
    Gsn, LogRecord, Operation, RecordPayload, TxnId, TxnState, Value, VersionedKey,
};
use meteor_storage::recovery;
use meteor_storage::table::VersionedTable;
use meteor_storage::wal::{WalManager, SEQUENCE_BATCH_SIZE};

fn put_row(txn: u32, key: &str, gsn: u32, value: &str, state: TxnState) -> LogRecord {
    LogRecord::new(
        TxnId(txn),
        Operation::Put,
        state,
        RecordPayload {
            key: VersionedKey::new(key, Gsn(gsn)),
            old_value: Value::null(),
            new_value: Value::string(value),
        },
    )
}

fn commit_row(txn: u32, gsn: u32) -> LogRecord {
    LogRecord::new(
        TxnId(txn),
        Operation::Commit,
        TxnState::Commit,
        RecordPayload::control(Gsn(gsn)),
    )
}

#[test]
fn test_lso_strictly_increases_across_rows() {
    let dir = tempfile::tempdir().unwrap();
    let wal = WalManager::open(dir.path(), true).unwrap();

    for i in 0..50u32 {
        wal.append(&put_row(i, &format!("k{i}"), i + 1, "v", TxnState::Commit))
            .unwrap();
    }

    wal.rewind();
    let mut last_lso = -1i64;
    while let Some(row) = wal.read_next().unwrap() {
        assert!(
            row.lso > last_lso,
            "lso {} is not > previous {}",
            row.lso,
            last_lso
        );
        last_lso = row.lso;
    }
}

#[test]
fn test_replay_converges_across_reopens() {
    let dir = tempfile::tempdir().unwrap();
    {
        let wal = WalManager::open(dir.path(), true).unwrap();
        wal.append(&put_row(1, "a", 1, "first", TxnState::Queued))
            .unwrap();
        wal.append(&put_row(2, "a", 2, "second", TxnState::Commit))
            .unwrap();
        wal.append(&commit_row(1, 3)).unwrap();
        wal.flush().unwrap();
    }

    let mut snapshots = Vec::new();
    for _ in 0..3 {
        let wal = WalManager::open(dir.path(), true).unwrap();
        let table = VersionedTable::new();
        recovery::replay(&wal, &table).unwrap();
        snapshots.push((
            table.get("a"),
            table.latest_gsn("a").unwrap(),
            table.version_at_or_before("a", Gsn(1)),
        ));
    }
    assert_eq!(snapshots[0], snapshots[1]);
    assert_eq!(snapshots[1], snapshots[2]);
    // Both committed versions present; latest wins.
    assert_eq!(snapshots[0].0.as_ref().unwrap().as_text(), "second");
    assert_eq!(snapshots[0].1, Gsn(2));
    assert_eq!(snapshots[0].2.as_ref().unwrap().as_text(), "first");
}

#[test]
fn test_appends_after_recovery_do_not_clobber_history() {
    let dir = tempfile::tempdir().unwrap();
    {
        let wal = WalManager::open(dir.path(), true).unwrap();
        wal.append(&put_row(1, "a", 1, "old", TxnState::Commit))
            .unwrap();
        wal.flush().unwrap();
    }

    // Second process lifetime: recover, then append more.
    {
        let wal = WalManager::open(dir.path(), true).unwrap();
        let table = VersionedTable::new();
        recovery::replay(&wal, &table).unwrap();
        wal.append(&put_row(2, "b", 2, "new", TxnState::Commit))
            .unwrap();
        wal.flush().unwrap();
    }

    // Third lifetime sees both.
    let wal = WalManager::open(dir.path(), true).unwrap();
    let table = VersionedTable::new();
    recovery::replay(&wal, &table).unwrap();
    assert_eq!(table.get("a").unwrap().as_text(), "old");
    assert_eq!(table.get("b").unwrap().as_text(), "new");
}

#[test]
fn test_watermarks_stay_ahead_of_issued_sequences() {
    let dir = tempfile::tempdir().unwrap();
    {
        let wal = std::sync::Arc::new(WalManager::open(dir.path(), true).unwrap());
        let gsns = meteor_storage::SequenceAllocator::new(
            meteor_storage::SequenceKind::Gsn,
            wal.clone(),
        )
        .unwrap();
        let mut max_issued = 0;
        for _ in 0..(SEQUENCE_BATCH_SIZE + 10) {
            max_issued = gsns.next().unwrap();
        }
        assert!(wal.header().next_gsn > max_issued);
    }

    // After a crash, the persisted watermark still exceeds everything that
    // was handed out; new values never collide with old ones.
    let wal = WalManager::open(dir.path(), true).unwrap();
    assert!(wal.header().next_gsn >= SEQUENCE_BATCH_SIZE + 10);
}

#[test]
fn test_uncommitted_tail_discarded_then_superseded() {
    let dir = tempfile::tempdir().unwrap();
    {
        let wal = WalManager::open(dir.path(), true).unwrap();
        // Committed base, then an uncommitted transaction at crash time.
        wal.append(&put_row(1, "k", 1, "base", TxnState::Commit))
            .unwrap();
        wal.append(&put_row(2, "k", 2, "lost", TxnState::Queued))
            .unwrap();
        wal.flush().unwrap();
    }

    {
        let wal = WalManager::open(dir.path(), true).unwrap();
        let table = VersionedTable::new();
        recovery::replay(&wal, &table).unwrap();
        assert_eq!(table.get("k").unwrap().as_text(), "base");

        // The same logical update retried after recovery commits fine.
        wal.append(&put_row(3, "k", 3, "retried", TxnState::Queued))
            .unwrap();
        wal.append(&commit_row(3, 4)).unwrap();
        wal.flush().unwrap();
    }

    let wal = WalManager::open(dir.path(), true).unwrap();
    let table = VersionedTable::new();
    recovery::replay(&wal, &table).unwrap();
    assert_eq!(table.get("k").unwrap().as_text(), "retried");
    // The uncommitted gsn 2 never materialized.
    assert!(table.version_at_or_before("k", Gsn(2)).is_some());
    assert_eq!(
        table.version_at_or_before("k", Gsn(2)).unwrap().as_text(),
        "base"
    );
}
