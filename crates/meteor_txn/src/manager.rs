//! Transaction manager: per-transaction staging stores, isolation-level
//! policy, read/write paths, validation, and the commit/rollback
//! protocols.
//!
//! A transaction is Active from BEGIN until COMMIT or ROLLBACK; every
//! terminal transition (including conflict, lock timeout, and deadlock
//! aborts) goes through `clear`, which releases locks and drops staging.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use meteor_common::error::{StorageError, TxnError};
use meteor_common::types::{
    ConnId, Gsn, IsolationLevel, LogRecord, Operation, RecordPayload, TxnId, TxnState, Value,
    VersionedKey, NULL_KEY,
};
use meteor_storage::gsn::{SequenceAllocator, SequenceKind};
use meteor_storage::table::VersionedTable;
use meteor_storage::wal::WalManager;

use crate::lock::{LockManager, LockMode, LockScope, DEFAULT_LOCK_TIMEOUT};

/// One staged version: the value plus the operation that produced it.
/// Reads staged for repeatability carry `Operation::Get` and are skipped
/// at commit.
#[derive(Debug, Clone)]
pub struct StagedVersion {
    pub value: Value,
    pub op: Operation,
}

/// Private versioned store collecting a transaction's writes (and staged
/// reads) until commit. Same shape as the main table; no internal locking
/// because each store lives inside the manager's map.
#[derive(Debug, Default)]
pub struct StagingStore {
    entries: HashMap<String, BTreeMap<Gsn, StagedVersion>>,
}

impl StagingStore {
    pub fn put(&mut self, key: VersionedKey, value: Value, op: Operation) {
        self.entries
            .entry(key.key)
            .or_default()
            .insert(key.gsn, StagedVersion { value, op });
    }

    /// Latest staged version of `key`.
    pub fn get(&self, key: &str) -> Option<&StagedVersion> {
        self.entries
            .get(key)
            .and_then(|chain| chain.values().next_back())
    }

    pub fn latest(&self, key: &str) -> Option<(Gsn, &StagedVersion)> {
        self.entries
            .get(key)
            .and_then(|chain| chain.iter().next_back())
            .map(|(g, v)| (*g, v))
    }

    /// User keys with at least one staged version (control rows excluded).
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter(|k| k.as_str() != NULL_KEY)
            .cloned()
            .collect()
    }

    pub fn scan_range(&self, start: &str, end: &str) -> HashMap<String, Value> {
        self.scan_filtered(|key, _| key >= start && key <= end)
    }

    pub fn scan_prefix(&self, prefix: &str) -> HashMap<String, Value> {
        self.scan_filtered(|key, _| key.starts_with(prefix))
    }

    pub fn scan_filtered(&self, filter: impl Fn(&str, &Value) -> bool) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for (key, chain) in &self.entries {
            if key == NULL_KEY {
                continue;
            }
            if let Some(entry) = chain.values().next_back() {
                if filter(key, &entry.value) {
                    out.insert(key.clone(), entry.value.clone());
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Owns the lock manager and all per-transaction state.
pub struct TxnManager {
    locks: LockManager,
    ids: SequenceAllocator,
    staging: DashMap<TxnId, StagingStore>,
    isolation: DashMap<TxnId, IsolationLevel>,
    start_gsn: DashMap<TxnId, Gsn>,
    /// Connection that opened each transaction. Only it may operate on the
    /// transaction for its whole lifetime.
    owner: DashMap<TxnId, ConnId>,
    lock_timeout: Duration,
}

impl TxnManager {
    pub fn new(wal: Arc<WalManager>) -> Result<Self, StorageError> {
        Ok(Self {
            locks: LockManager::new(),
            ids: SequenceAllocator::new(SequenceKind::TxnId, wal)?,
            staging: DashMap::new(),
            isolation: DashMap::new(),
            start_gsn: DashMap::new(),
            owner: DashMap::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Override the lock timeout (tests use short deadlines).
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub fn new_txn_id(&self) -> Result<TxnId, StorageError> {
        self.ids.next_txn_id()
    }

    /// True while the transaction has a staging store (Active state).
    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.staging.contains_key(&txn_id)
    }

    /// True if the id was ever handed out by this process.
    pub fn was_issued(&self, txn_id: TxnId) -> bool {
        self.ids.was_issued(txn_id.0)
    }

    fn check_owner(&self, txn_id: TxnId, conn: ConnId) -> Result<(), TxnError> {
        match self.owner.get(&txn_id) {
            None => Ok(()),
            Some(owner) if *owner == conn => Ok(()),
            Some(_) => Err(TxnError::Permission(txn_id)),
        }
    }

    /// Record one row in the transaction's staging store, registering the
    /// connection as owner on first contact.
    pub fn stage(
        &self,
        txn_id: TxnId,
        conn: ConnId,
        key: VersionedKey,
        value: Value,
        op: Operation,
    ) -> Result<(), TxnError> {
        self.check_owner(txn_id, conn)?;
        self.owner.entry(txn_id).or_insert(conn);
        self.staging.entry(txn_id).or_default().put(key, value, op);
        Ok(())
    }

    /// First call wins; a later disagreeing level is an error.
    pub fn ensure_isolation(&self, txn_id: TxnId, level: IsolationLevel) -> Result<(), TxnError> {
        use dashmap::mapref::entry::Entry;
        match self.isolation.entry(txn_id) {
            Entry::Occupied(held) => {
                let held_level = *held.get();
                if held_level != level {
                    return Err(TxnError::IsolationMismatch {
                        txn: txn_id,
                        held: held_level.as_str(),
                        requested: level.as_str(),
                    });
                }
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(level);
                Ok(())
            }
        }
    }

    /// Isolation level of the transaction, registering the READ_COMMITTED
    /// default on first use.
    pub fn isolation_of(&self, txn_id: TxnId) -> IsolationLevel {
        *self
            .isolation
            .entry(txn_id)
            .or_insert(IsolationLevel::ReadCommitted)
    }

    /// Record the snapshot point. Snapshot-isolation only, during BEGIN.
    pub fn set_start_gsn(&self, txn_id: TxnId, gsn: Gsn) {
        self.start_gsn.insert(txn_id, gsn);
    }

    pub fn start_gsn_of(&self, txn_id: TxnId) -> Option<Gsn> {
        self.start_gsn.get(&txn_id).map(|g| *g)
    }

    /// Terminal cleanup: release all locks, drop staging and per-txn maps.
    /// Idempotent.
    pub fn clear(&self, txn_id: TxnId) {
        self.locks.release_all(txn_id);
        self.staging.remove(&txn_id);
        self.isolation.remove(&txn_id);
        self.start_gsn.remove(&txn_id);
        self.owner.remove(&txn_id);
        tracing::debug!(txn = %txn_id, "transaction cleared");
    }

    pub fn active_count(&self) -> usize {
        self.staging.len()
    }

    // ── Lock acquisition policy ──────────────────────────────────────────

    /// Point read lock per the isolation matrix: snapshot isolation reads
    /// without locks, everything else takes a shared lock.
    pub async fn acquire_read_lock(
        &self,
        txn_id: TxnId,
        key: &str,
        level: IsolationLevel,
    ) -> Result<(), TxnError> {
        match level {
            IsolationLevel::SnapshotIsolation => Ok(()),
            _ => {
                self.locks
                    .acquire(
                        txn_id,
                        LockScope::point(key),
                        LockMode::Shared,
                        self.lock_timeout,
                    )
                    .await
            }
        }
    }

    /// Point write lock; required at every isolation level.
    pub async fn acquire_write_lock(&self, txn_id: TxnId, key: &str) -> Result<(), TxnError> {
        self.locks
            .acquire(
                txn_id,
                LockScope::point(key),
                LockMode::Exclusive,
                self.lock_timeout,
            )
            .await
    }

    /// READ_COMMITTED releases its point read lock right after the value
    /// is read; the other levels hold until commit/rollback (or never took
    /// one).
    pub fn release_read_lock(&self, txn_id: TxnId, key: &str, level: IsolationLevel) {
        if level == IsolationLevel::ReadCommitted {
            self.locks
                .release(txn_id, &LockScope::point(key), LockMode::Shared);
        }
    }

    /// Range lock for phantom protection; serializable only.
    pub async fn acquire_range_lock(
        &self,
        txn_id: TxnId,
        start: &str,
        end: &str,
        level: IsolationLevel,
    ) -> Result<(), TxnError> {
        if level != IsolationLevel::Serializable {
            return Ok(());
        }
        self.locks
            .acquire(
                txn_id,
                LockScope::range(start, end),
                LockMode::Exclusive,
                self.lock_timeout,
            )
            .await
    }

    /// Predicate lock for phantom protection; serializable only.
    pub async fn acquire_predicate_lock(
        &self,
        txn_id: TxnId,
        predicate: &str,
        level: IsolationLevel,
    ) -> Result<(), TxnError> {
        if level != IsolationLevel::Serializable {
            return Ok(());
        }
        self.locks
            .acquire(
                txn_id,
                LockScope::predicate(predicate),
                LockMode::Exclusive,
                self.lock_timeout,
            )
            .await
    }

    // ── Read paths ───────────────────────────────────────────────────────

    /// Read one key: the transaction's own staged version wins; otherwise
    /// snapshot isolation reads at its start GSN and every other level
    /// reads the latest committed version.
    pub fn read_value(
        &self,
        txn_id: TxnId,
        conn: ConnId,
        key: &str,
        table: &VersionedTable,
    ) -> Result<Option<Value>, TxnError> {
        self.check_owner(txn_id, conn)?;

        if let Some(staged) = self.staging.get(&txn_id) {
            if let Some(entry) = staged.get(key) {
                return Ok(Some(entry.value.clone()));
            }
        }

        match self.isolation_of(txn_id) {
            IsolationLevel::SnapshotIsolation => {
                let gsn = self
                    .start_gsn_of(txn_id)
                    .ok_or(TxnError::MissingSnapshot(txn_id))?;
                Ok(table.version_at_or_before(key, gsn))
            }
            _ => Ok(table.get(key)),
        }
    }

    /// Range read `[start, end]`: staged entries first, then the table
    /// side per isolation level; the staging store wins for overlaps.
    pub fn read_range(
        &self,
        txn_id: TxnId,
        conn: ConnId,
        start: &str,
        end: &str,
        table: &VersionedTable,
    ) -> Result<HashMap<String, Value>, TxnError> {
        self.merged_read(
            txn_id,
            conn,
            table,
            |staged| staged.scan_range(start, end),
            |key: &str, _v: &Value| key >= start && key <= end,
        )
    }

    /// Prefix read: same merge contract as `read_range`.
    pub fn read_prefix(
        &self,
        txn_id: TxnId,
        conn: ConnId,
        prefix: &str,
        table: &VersionedTable,
    ) -> Result<HashMap<String, Value>, TxnError> {
        self.merged_read(
            txn_id,
            conn,
            table,
            |staged| staged.scan_prefix(prefix),
            |key: &str, _v: &Value| key.starts_with(prefix),
        )
    }

    /// Filter read: the predicate sees the version the isolation level
    /// exposes (snapshot values under snapshot isolation).
    pub fn read_filtered<F>(
        &self,
        txn_id: TxnId,
        conn: ConnId,
        filter: F,
        table: &VersionedTable,
    ) -> Result<HashMap<String, Value>, TxnError>
    where
        F: Fn(&str, &Value) -> bool,
    {
        self.merged_read(txn_id, conn, table, |staged| staged.scan_filtered(&filter), &filter)
    }

    fn merged_read(
        &self,
        txn_id: TxnId,
        conn: ConnId,
        table: &VersionedTable,
        staged_scan: impl FnOnce(&StagingStore) -> HashMap<String, Value>,
        filter: impl Fn(&str, &Value) -> bool,
    ) -> Result<HashMap<String, Value>, TxnError> {
        self.check_owner(txn_id, conn)?;

        let mut result = self
            .staging
            .get(&txn_id)
            .map(|staged| staged_scan(&staged))
            .unwrap_or_default();

        let base = match self.isolation_of(txn_id) {
            IsolationLevel::SnapshotIsolation => {
                let gsn = self
                    .start_gsn_of(txn_id)
                    .ok_or(TxnError::MissingSnapshot(txn_id))?;
                let mut out = HashMap::new();
                for key in table.keys() {
                    if let Some(snapshot) = table.version_at_or_before(&key, gsn) {
                        if filter(&key, &snapshot) {
                            out.insert(key, snapshot);
                        }
                    }
                }
                out
            }
            _ => table.scan_filtered(&filter),
        };

        for (key, value) in base {
            result.entry(key).or_insert(value);
        }
        Ok(result)
    }

    /// Stage an observed read so later reads in the same transaction
    /// repeat it. Repeatable-read and serializable tag the row with the
    /// key's committed GSN; snapshot isolation uses its start GSN.
    /// Returns the GSN used, or `None` when the level stages nothing.
    pub fn stage_read(
        &self,
        txn_id: TxnId,
        conn: ConnId,
        key: &str,
        value: &Value,
        level: IsolationLevel,
        table: &VersionedTable,
    ) -> Result<Option<Gsn>, TxnError> {
        let gsn = match level {
            IsolationLevel::ReadCommitted => return Ok(None),
            IsolationLevel::SnapshotIsolation => self.start_gsn_of(txn_id).unwrap_or(Gsn(0)),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                table.latest_gsn(key).unwrap_or(Gsn(0))
            }
        };
        self.stage(
            txn_id,
            conn,
            VersionedKey::new(key.to_string(), gsn),
            value.clone(),
            Operation::Get,
        )?;
        Ok(Some(gsn))
    }

    /// Stage a whole read set (range/filter results), taking a point read
    /// lock per key under repeatable read.
    pub async fn stage_read_set(
        &self,
        txn_id: TxnId,
        conn: ConnId,
        results: &HashMap<String, Value>,
        level: IsolationLevel,
        table: &VersionedTable,
    ) -> Result<(), TxnError> {
        if level == IsolationLevel::ReadCommitted {
            return Ok(());
        }
        for (key, value) in results {
            if level == IsolationLevel::RepeatableRead {
                self.acquire_read_lock(txn_id, key, level).await?;
            }
            self.stage_read(txn_id, conn, key, value, level, table)?;
        }
        Ok(())
    }

    // ── Write validation ─────────────────────────────────────────────────

    /// For read-committed, repeatable-read, and serializable the write
    /// lock is sufficient. Snapshot isolation applies first-committer-wins
    /// against the start GSN.
    pub fn validate_write(
        &self,
        txn_id: TxnId,
        key: &str,
        table: &VersionedTable,
    ) -> Result<(), TxnError> {
        match self.isolation_of(txn_id) {
            IsolationLevel::SnapshotIsolation => {
                let start = self
                    .start_gsn_of(txn_id)
                    .ok_or(TxnError::MissingSnapshot(txn_id))?;
                match table.latest_gsn(key) {
                    Err(_) => Ok(()),
                    Ok(latest) if latest > start => Err(TxnError::WriteConflict {
                        key: key.to_string(),
                    }),
                    Ok(_) => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    // ── Commit / rollback ────────────────────────────────────────────────

    /// Run the commit protocol. Any failure before the table is touched
    /// aborts the transaction (locks released, staging dropped). The one
    /// exception is a permission failure, which must not let a foreign
    /// connection kill the transaction.
    pub fn commit(
        &self,
        txn_id: TxnId,
        conn: ConnId,
        table: &VersionedTable,
        wal: &WalManager,
        gsns: &SequenceAllocator,
    ) -> Result<(), TxnError> {
        let result = self.commit_inner(txn_id, conn, table, wal, gsns);
        if let Err(ref e) = result {
            if !matches!(e, TxnError::Permission(_)) {
                self.clear(txn_id);
            }
        }
        result
    }

    fn commit_inner(
        &self,
        txn_id: TxnId,
        conn: ConnId,
        table: &VersionedTable,
        wal: &WalManager,
        gsns: &SequenceAllocator,
    ) -> Result<(), TxnError> {
        self.check_owner(txn_id, conn)?;

        let mut to_apply: Vec<(VersionedKey, Value)> = Vec::new();
        {
            let staged = self
                .staging
                .get(&txn_id)
                .ok_or(TxnError::NotFound(txn_id))?;

            for key in staged.keys() {
                let Some((staged_gsn, entry)) = staged.latest(&key) else {
                    continue;
                };
                // Staged reads are echoes, not writes.
                if !matches!(entry.op, Operation::Put | Operation::Delete) {
                    continue;
                }
                // Defensive: a staged value byte-identical to the current
                // table value is treated as a read echo and skipped.
                if let Some(current) = table.get(&key) {
                    if current == entry.value {
                        continue;
                    }
                }
                // A newer committed version appeared since this write was
                // staged.
                if let Ok(committed_gsn) = table.latest_gsn(&key) {
                    if committed_gsn > staged_gsn {
                        tracing::warn!(
                            txn = %txn_id,
                            key = %key,
                            staged = %staged_gsn,
                            committed = %committed_gsn,
                            "commit conflict: newer committed version"
                        );
                        return Err(TxnError::WriteConflict { key });
                    }
                }
                self.validate_write(txn_id, &key, table)?;
                to_apply.push((
                    VersionedKey::new(key.clone(), staged_gsn),
                    entry.value.clone(),
                ));
            }
        }

        let commit_gsn = gsns.next_gsn()?;
        let record = LogRecord::new(
            txn_id,
            Operation::Commit,
            TxnState::Commit,
            RecordPayload::control(commit_gsn),
        );
        wal.append(&record)?;
        wal.flush()?;

        for (key, value) in to_apply {
            table.put(key, value);
        }

        tracing::debug!(txn = %txn_id, commit_gsn = %commit_gsn, "transaction committed");
        self.clear(txn_id);
        Ok(())
    }

    /// Run the rollback protocol. Rolling back a transaction that was
    /// already aborted (e.g. by a conflict) is a no-op; an id that was
    /// never issued is an error.
    pub fn rollback(
        &self,
        txn_id: TxnId,
        conn: ConnId,
        wal: &WalManager,
        gsns: &SequenceAllocator,
    ) -> Result<(), TxnError> {
        if !self.is_active(txn_id) {
            if self.was_issued(txn_id) {
                tracing::debug!(txn = %txn_id, "rollback of closed transaction, no-op");
                return Ok(());
            }
            return Err(TxnError::NotFound(txn_id));
        }
        self.check_owner(txn_id, conn)?;

        let result = (|| {
            let gsn = gsns.next_gsn()?;
            let record = LogRecord::new(
                txn_id,
                Operation::Rollback,
                TxnState::Rollback,
                RecordPayload::control(gsn),
            );
            wal.append(&record)?;
            Ok::<(), StorageError>(())
        })();

        self.clear(txn_id);
        tracing::debug!(txn = %txn_id, "transaction rolled back");
        result.map_err(TxnError::from)
    }
}
