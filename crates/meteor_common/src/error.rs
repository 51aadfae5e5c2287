//! Layered error types. Each subsystem has its own enum; everything
//! converts into `MeteorError` at the command boundary, where it is
//! rendered to the client as `error: <message>`.

use thiserror::Error;

use crate::codec::CodecError;
use crate::types::TxnId;

/// Convenience alias for `Result<T, MeteorError>`.
pub type MeteorResult<T> = Result<T, MeteorError>;

/// Storage layer errors (versioned table, WAL, allocators).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("WAL I/O error: {0}")]
    WalIo(#[from] std::io::Error),

    #[error("WAL corruption: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("{0} sequence exhausted")]
    SequenceExhausted(&'static str),
}

/// Transaction layer errors (lifecycle, locks, validation).
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("transaction {0} not found")]
    NotFound(TxnId),

    #[error("transaction {0} not allowed for this connection")]
    Permission(TxnId),

    #[error("transaction {txn} isolation level mismatch: {held} != {requested}")]
    IsolationMismatch {
        txn: TxnId,
        held: &'static str,
        requested: &'static str,
    },

    #[error("lock acquisition timeout for transaction {txn} on {scope}")]
    LockTimeout { txn: TxnId, scope: String },

    #[error("deadlock detected for transaction {0}")]
    Deadlock(TxnId),

    #[error("write-write conflict on key {key}: another transaction committed first")]
    WriteConflict { key: String },

    #[error("transaction {0} has no snapshot start point")]
    MissingSnapshot(TxnId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Condition parser errors.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("unexpected token {found:?} at position {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("expected {what} at position {pos}")]
    Expected { what: &'static str, pos: usize },

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("comparison requires at least one field reference")]
    MissingField,
}

/// Wire protocol / argument validation errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unknown operation {0:?}")]
    UnknownCommand(String),
}

/// Top-level error all subsystem errors convert into.
#[derive(Error, Debug)]
pub enum MeteorError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error("invalid condition: {0}")]
    Query(#[from] QueryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MeteorError {
    /// Text shown to the client after the `error: ` prefix.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// True for errors that indicate a broken invariant rather than a bad
    /// request or a recoverable conflict. These are logged at error level
    /// and should be treated as fatal by the caller.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            MeteorError::Internal(_)
                | MeteorError::Storage(StorageError::Corrupt(_))
                | MeteorError::Storage(StorageError::SequenceExhausted(_))
        )
    }
}

/// Shorthand for `ProtocolError::BadRequest`.
pub fn bad_request(msg: impl Into<String>) -> MeteorError {
    MeteorError::Protocol(ProtocolError::BadRequest(msg.into()))
}
