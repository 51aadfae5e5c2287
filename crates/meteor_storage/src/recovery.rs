//! Crash recovery: rebuild the versioned table by replaying committed
//! transactions from the WAL.
//!
//! Two passes over the row region. The first collects every transaction id
//! that has a row in state `Commit` (dedicated COMMIT rows and auto-commit
//! writes alike). The second applies PUT/DELETE rows belonging to that set.
//! Uncommitted writes are silently discarded; no undo records are needed.

use std::collections::HashSet;

use meteor_common::error::StorageError;
use meteor_common::types::{Operation, TxnId, TxnState};

use crate::table::VersionedTable;
use crate::wal::WalManager;

/// Replay the WAL into `table`. Returns the number of versions applied.
/// Leaves the WAL cursor at EOF, positioned for subsequent appends.
pub fn replay(wal: &WalManager, table: &VersionedTable) -> Result<usize, StorageError> {
    let mut committed: HashSet<TxnId> = HashSet::new();

    wal.rewind();
    while let Some(record) = wal.read_next()? {
        if record.state == TxnState::Commit {
            committed.insert(record.txn_id);
        }
    }

    wal.rewind();
    let mut applied = 0;
    while let Some(record) = wal.read_next()? {
        if !committed.contains(&record.txn_id) {
            continue;
        }

        // Impossible by protocol; defensive.
        if record.state == TxnState::Rollback {
            tracing::warn!(
                txn_id = %record.txn_id,
                "committed transaction also has a rollback row, dropping it"
            );
            committed.remove(&record.txn_id);
            continue;
        }

        if matches!(record.operation, Operation::Put | Operation::Delete) {
            table.put(record.payload.key, record.payload.new_value);
            applied += 1;
        }
    }

    tracing::info!(
        committed = committed.len(),
        versions = applied,
        "WAL recovery complete"
    );
    Ok(applied)
}
