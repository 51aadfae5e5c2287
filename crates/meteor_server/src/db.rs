//! The database facade: wires the versioned table, WAL, GSN allocator, and
//! transaction manager together and dispatches parsed commands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use meteor_common::error::{bad_request, MeteorError, MeteorResult, ProtocolError};
use meteor_common::types::ConnId;
use meteor_query::split_command;
use meteor_storage::gsn::{SequenceAllocator, SequenceKind};
use meteor_storage::recovery;
use meteor_storage::table::VersionedTable;
use meteor_storage::wal::WalManager;
use meteor_txn::TxnManager;

use crate::commands;

/// Top-level database object. One per process; shared across connection
/// tasks behind an `Arc`. Transactions borrow the collaborators for the
/// duration of a handler call.
pub struct Database {
    pub(crate) table: VersionedTable,
    pub(crate) wal: Arc<WalManager>,
    pub(crate) gsns: SequenceAllocator,
    pub(crate) txns: TxnManager,
}

impl Database {
    /// Open the WAL under `dir`, replay committed transactions into a
    /// fresh table, and stand up the allocators and transaction manager.
    pub fn open(dir: &Path, use_wal: bool) -> MeteorResult<Self> {
        let wal = Arc::new(WalManager::open(dir, use_wal)?);
        let table = VersionedTable::new();
        recovery::replay(&wal, &table)?;
        let gsns = SequenceAllocator::new(SequenceKind::Gsn, wal.clone())?;
        let txns = TxnManager::new(wal.clone())?;
        Ok(Self {
            table,
            wal,
            gsns,
            txns,
        })
    }

    /// Shorten the lock timeout (tests exercise timeout paths).
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.txns = self.txns.with_lock_timeout(timeout);
        self
    }

    /// Parse and execute one command line, producing the newline-terminated
    /// response bytes. Failures render as `error: <message>`.
    pub async fn dispatch(&self, line: &str, conn: ConnId) -> Vec<u8> {
        match self.execute(line, conn).await {
            Ok(mut response) => {
                response.push(b'\n');
                response
            }
            Err(e) => {
                if e.is_internal() {
                    tracing::error!(%conn, error = %e, "internal error");
                } else {
                    tracing::debug!(%conn, error = %e, "command failed");
                }
                format!("error: {}\n", e.user_message()).into_bytes()
            }
        }
    }

    /// Execute one command line, returning the raw response payload.
    pub async fn execute(&self, line: &str, conn: ConnId) -> MeteorResult<Vec<u8>> {
        let tokens = split_command(line);
        let Some((op, args)) = tokens.split_first() else {
            return Err(bad_request("empty command"));
        };

        let op = op.to_uppercase();
        tracing::debug!(%conn, command = %op, args = args.len(), "executing");

        match op.as_str() {
            "BEGIN" => commands::begin(self, args, conn).await,
            "COMMIT" => commands::commit(self, args, conn).await,
            "ROLLBACK" => commands::rollback(self, args, conn).await,
            "PUT" => commands::put(self, args, conn).await,
            "GET" => commands::get(self, args, conn).await,
            "DELETE" => commands::delete(self, args, conn).await,
            "RGET" => commands::rget(self, args, conn).await,
            "SCAN" => commands::scan(self, args, conn).await,
            "COUNT" => commands::count(self, args, conn).await,
            "CGET" => commands::cget(self, args, conn).await,
            other => Err(MeteorError::Protocol(ProtocolError::UnknownCommand(
                other.to_string(),
            ))),
        }
    }

    pub fn table(&self) -> &VersionedTable {
        &self.table
    }

    pub fn txns(&self) -> &TxnManager {
        &self.txns
    }
}
