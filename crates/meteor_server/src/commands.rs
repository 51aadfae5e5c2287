//! Command handlers. Each handler validates its arguments into a typed
//! struct, then executes against the database, returning raw response
//! bytes. The `error: ` prefix is added by the dispatcher.

use std::collections::{BTreeMap, HashMap};

use meteor_common::error::{bad_request, MeteorError, MeteorResult, TxnError};
use meteor_common::types::{
    ConnId, IsolationLevel, LogRecord, Operation, RecordPayload, TxnId, TxnState, Value,
    VersionedKey,
};
use meteor_query::Predicate;

use crate::db::Database;

const OK: &[u8] = b"OK";
const QUEUED: &[u8] = b"QUEUED";
const NOT_FOUND: &[u8] = b"-1";
const DELETED: &[u8] = b"-2";

/// Abort the transaction (release locks, drop staging) and pass the error
/// through. Permission failures are exempt: a foreign connection must not
/// be able to kill someone else's transaction.
fn abort(db: &Database, txn: TxnId, e: impl Into<MeteorError>) -> MeteorError {
    let e = e.into();
    if !matches!(e, MeteorError::Txn(TxnError::Permission(_))) {
        db.txns.clear(txn);
    }
    e
}

/// Parse a client-supplied transaction id. Ids the server never handed out
/// or that are no longer active are rejected; clients cannot forge ids.
fn parse_txn_arg(db: &Database, raw: &str) -> MeteorResult<TxnId> {
    let id: u32 = raw
        .parse()
        .map_err(|_| bad_request("invalid transaction id"))?;
    let txn = TxnId(id);
    if !db.txns.is_active(txn) {
        return Err(bad_request("transaction id not allowed"));
    }
    Ok(txn)
}

/// Resolve the optional trailing `[txn]` argument: a supplied id was
/// already validated by the ensure phase; absence allocates a fresh
/// auto-commit id.
fn resolve_txn(db: &Database, txn: Option<TxnId>) -> MeteorResult<(TxnId, bool)> {
    match txn {
        Some(txn) => Ok((txn, false)),
        None => Ok((db.txns.new_txn_id().map_err(MeteorError::from)?, true)),
    }
}

/// Render a read-set as a JSON object `{key: value_as_utf8, …}`, omitting
/// tombstones. Keys are emitted in sorted order.
fn json_response(results: &HashMap<String, Value>) -> MeteorResult<Vec<u8>> {
    let visible: BTreeMap<&str, String> = results
        .iter()
        .filter(|(_, v)| !v.is_tombstone())
        .map(|(k, v)| (k.as_str(), v.as_text()))
        .collect();
    serde_json::to_vec(&visible).map_err(|e| MeteorError::Internal(e.to_string()))
}

// ── BEGIN ────────────────────────────────────────────────────────────────

struct BeginArgs {
    level: IsolationLevel,
}

fn ensure_begin(args: &[String]) -> MeteorResult<BeginArgs> {
    match args {
        [] => Ok(BeginArgs {
            level: IsolationLevel::ReadCommitted,
        }),
        [level] => IsolationLevel::parse(level)
            .map(|level| BeginArgs { level })
            .ok_or_else(|| bad_request("invalid transaction isolation level")),
        _ => Err(bad_request(
            "command must have no arguments or one argument - transactionIsolation",
        )),
    }
}

pub async fn begin(db: &Database, args: &[String], conn: ConnId) -> MeteorResult<Vec<u8>> {
    let args = ensure_begin(args)?;

    let txn = db.txns.new_txn_id().map_err(MeteorError::from)?;
    db.txns
        .ensure_isolation(txn, args.level)
        .map_err(MeteorError::from)?;

    if args.level == IsolationLevel::SnapshotIsolation {
        let snapshot = db.gsns.next_gsn().map_err(|e| abort(db, txn, e))?;
        db.txns.set_start_gsn(txn, snapshot);
    }

    let gsn = db.gsns.next_gsn().map_err(|e| abort(db, txn, e))?;
    db.txns
        .stage(
            txn,
            conn,
            VersionedKey::control(gsn),
            Value::null(),
            Operation::Begin,
        )
        .map_err(|e| abort(db, txn, e))?;

    let record = LogRecord::new(
        txn,
        Operation::Begin,
        TxnState::Queued,
        RecordPayload::control(gsn),
    );
    db.wal.append(&record).map_err(|e| abort(db, txn, e))?;

    tracing::debug!(%txn, level = %args.level, "transaction begun");
    Ok(txn.to_string().into_bytes())
}

// ── COMMIT / ROLLBACK ────────────────────────────────────────────────────

fn ensure_single_txn_arg(args: &[String]) -> MeteorResult<TxnId> {
    let [raw] = args else {
        return Err(bad_request("command must have one argument - transactionId"));
    };
    let id: u32 = raw
        .parse()
        .map_err(|_| bad_request("invalid transaction id"))?;
    Ok(TxnId(id))
}

pub async fn commit(db: &Database, args: &[String], conn: ConnId) -> MeteorResult<Vec<u8>> {
    let txn = ensure_single_txn_arg(args)?;
    db.txns
        .commit(txn, conn, &db.table, &db.wal, &db.gsns)
        .map_err(MeteorError::from)?;
    Ok(OK.to_vec())
}

pub async fn rollback(db: &Database, args: &[String], conn: ConnId) -> MeteorResult<Vec<u8>> {
    let txn = ensure_single_txn_arg(args)?;
    db.txns
        .rollback(txn, conn, &db.wal, &db.gsns)
        .map_err(MeteorError::from)?;
    Ok(OK.to_vec())
}

// ── PUT / DELETE ─────────────────────────────────────────────────────────

struct WriteArgs {
    key: String,
    value: Value,
    txn: Option<TxnId>,
}

fn ensure_put(db: &Database, args: &[String]) -> MeteorResult<WriteArgs> {
    match args {
        [key, value] => Ok(WriteArgs {
            key: key.clone(),
            value: Value::string(value.as_bytes().to_vec()),
            txn: None,
        }),
        [key, value, txn] => Ok(WriteArgs {
            key: key.clone(),
            value: Value::string(value.as_bytes().to_vec()),
            txn: Some(parse_txn_arg(db, txn)?),
        }),
        _ => Err(bad_request(
            "command must have 2 or 3 arguments - key, value, transactionId",
        )),
    }
}

fn ensure_delete(db: &Database, args: &[String]) -> MeteorResult<WriteArgs> {
    match args {
        [key] => Ok(WriteArgs {
            key: key.clone(),
            value: Value::tombstone(),
            txn: None,
        }),
        [key, txn] => Ok(WriteArgs {
            key: key.clone(),
            value: Value::tombstone(),
            txn: Some(parse_txn_arg(db, txn)?),
        }),
        _ => Err(bad_request(
            "command must have 1 or 2 arguments - key, transactionId",
        )),
    }
}

/// Shared write path for PUT and DELETE: write lock, isolation-aware old
/// value, validation, staging, WAL row; auto-commit applies immediately.
async fn execute_write(
    db: &Database,
    args: WriteArgs,
    op: Operation,
    conn: ConnId,
) -> MeteorResult<Vec<u8>> {
    let (txn, auto_commit) = resolve_txn(db, args.txn)?;
    let _ = db.txns.isolation_of(txn);

    db.txns
        .acquire_write_lock(txn, &args.key)
        .await
        .map_err(|e| abort(db, txn, e))?;

    let gsn = db.gsns.next_gsn().map_err(|e| abort(db, txn, e))?;

    let old_value = db
        .txns
        .read_value(txn, conn, &args.key, &db.table)
        .map_err(|e| abort(db, txn, e))?
        .unwrap_or_else(Value::null);

    db.txns
        .validate_write(txn, &args.key, &db.table)
        .map_err(|e| abort(db, txn, e))?;

    let state = if auto_commit {
        TxnState::Commit
    } else {
        TxnState::Queued
    };
    let key = VersionedKey::new(args.key.clone(), gsn);

    db.txns
        .stage(txn, conn, key.clone(), args.value.clone(), op)
        .map_err(|e| abort(db, txn, e))?;

    let record = LogRecord::new(
        txn,
        op,
        state,
        RecordPayload {
            key: key.clone(),
            old_value,
            new_value: args.value.clone(),
        },
    );
    db.wal.append(&record).map_err(|e| abort(db, txn, e))?;

    if auto_commit {
        db.wal.flush().map_err(|e| abort(db, txn, e))?;
        db.table.put(key, args.value);
        db.txns.clear(txn);
        return Ok(OK.to_vec());
    }
    Ok(QUEUED.to_vec())
}

pub async fn put(db: &Database, args: &[String], conn: ConnId) -> MeteorResult<Vec<u8>> {
    let args = ensure_put(db, args)?;
    execute_write(db, args, Operation::Put, conn).await
}

pub async fn delete(db: &Database, args: &[String], conn: ConnId) -> MeteorResult<Vec<u8>> {
    let args = ensure_delete(db, args)?;
    execute_write(db, args, Operation::Delete, conn).await
}

// ── GET ──────────────────────────────────────────────────────────────────

struct GetArgs {
    key: String,
    txn: Option<TxnId>,
}

fn ensure_get(db: &Database, args: &[String]) -> MeteorResult<GetArgs> {
    match args {
        [key] => Ok(GetArgs {
            key: key.clone(),
            txn: None,
        }),
        [key, txn] => Ok(GetArgs {
            key: key.clone(),
            txn: Some(parse_txn_arg(db, txn)?),
        }),
        _ => Err(bad_request(
            "command must have 1 or 2 arguments - key, transactionId",
        )),
    }
}

pub async fn get(db: &Database, args: &[String], conn: ConnId) -> MeteorResult<Vec<u8>> {
    let args = ensure_get(db, args)?;
    let (txn, auto_commit) = resolve_txn(db, args.txn)?;
    let level = db.txns.isolation_of(txn);

    let value = db
        .txns
        .read_value(txn, conn, &args.key, &db.table)
        .map_err(|e| abort(db, txn, e))?;

    // Stage the observed value inside a transaction so later reads repeat
    // it (repeatable-read, serializable, snapshot isolation).
    if !auto_commit {
        if let Some(ref v) = value {
            let staged = db
                .txns
                .stage_read(txn, conn, &args.key, v, level, &db.table)
                .map_err(|e| abort(db, txn, e))?;
            if let Some(gsn) = staged {
                let record = LogRecord::new(
                    txn,
                    Operation::Get,
                    TxnState::Queued,
                    RecordPayload {
                        key: VersionedKey::new(args.key.clone(), gsn),
                        old_value: Value::null(),
                        new_value: v.clone(),
                    },
                );
                // The read echo in the log is informational only.
                let _ = db.wal.append(&record);
            }
        }
    } else {
        db.txns.clear(txn);
    }

    Ok(match value {
        None => NOT_FOUND.to_vec(),
        Some(v) if v.is_tombstone() => DELETED.to_vec(),
        Some(v) => v.payload,
    })
}

// ── RGET ─────────────────────────────────────────────────────────────────

struct RgetArgs {
    start: String,
    end: String,
    txn: Option<TxnId>,
}

fn ensure_rget(db: &Database, args: &[String]) -> MeteorResult<RgetArgs> {
    let (start, end, txn) = match args {
        [start, end] => (start.clone(), end.clone(), None),
        [start, end, txn] => (start.clone(), end.clone(), Some(parse_txn_arg(db, txn)?)),
        _ => {
            return Err(bad_request(
                "command must have 2 or 3 arguments - startKey, endKey, transactionId",
            ))
        }
    };
    if start > end {
        return Err(bad_request(
            "startKey must be lexicographically less than or equal to endKey",
        ));
    }
    Ok(RgetArgs { start, end, txn })
}

pub async fn rget(db: &Database, args: &[String], conn: ConnId) -> MeteorResult<Vec<u8>> {
    let args = ensure_rget(db, args)?;
    let (txn, auto_commit) = resolve_txn(db, args.txn)?;
    let level = db.txns.isolation_of(txn);

    db.txns
        .acquire_range_lock(txn, &args.start, &args.end, level)
        .await
        .map_err(|e| abort(db, txn, e))?;

    let results = db
        .txns
        .read_range(txn, conn, &args.start, &args.end, &db.table)
        .map_err(|e| abort(db, txn, e))?;

    if auto_commit {
        db.txns.clear(txn);
    } else {
        db.txns
            .stage_read_set(txn, conn, &results, level, &db.table)
            .await
            .map_err(|e| abort(db, txn, e))?;
    }

    json_response(&results)
}

// ── SCAN / COUNT ─────────────────────────────────────────────────────────

struct ConditionArgs {
    condition: String,
    txn: Option<TxnId>,
}

fn ensure_condition(db: &Database, args: &[String]) -> MeteorResult<ConditionArgs> {
    match args {
        [condition] => Ok(ConditionArgs {
            condition: condition.clone(),
            txn: None,
        }),
        [condition, txn] => Ok(ConditionArgs {
            condition: condition.clone(),
            txn: Some(parse_txn_arg(db, txn)?),
        }),
        _ => Err(bad_request(
            "command must have 1 or 2 arguments - condition, transactionId",
        )),
    }
}

/// `*` is a sentinel, not grammar: match every non-tombstone record.
fn build_filter(
    condition: &str,
) -> MeteorResult<Box<dyn Fn(&str, &Value) -> bool + Send + Sync>> {
    if condition == "*" {
        return Ok(Box::new(|_, v| !v.is_tombstone()));
    }
    let predicate = Predicate::parse(condition)?;
    Ok(Box::new(move |key, value| predicate.matches(key, value)))
}

async fn filtered_read(
    db: &Database,
    args: &ConditionArgs,
    lock_sentinel: &str,
    conn: ConnId,
) -> MeteorResult<HashMap<String, Value>> {
    let (txn, auto_commit) = resolve_txn(db, args.txn)?;
    let level = db.txns.isolation_of(txn);

    let lock_predicate = if args.condition == "*" {
        lock_sentinel.to_string()
    } else {
        args.condition.clone()
    };
    db.txns
        .acquire_predicate_lock(txn, &lock_predicate, level)
        .await
        .map_err(|e| abort(db, txn, e))?;

    let filter = build_filter(&args.condition).map_err(|e| abort(db, txn, e))?;
    let results = db
        .txns
        .read_filtered(txn, conn, &*filter, &db.table)
        .map_err(|e| abort(db, txn, e))?;

    if auto_commit {
        db.txns.clear(txn);
    } else {
        db.txns
            .stage_read_set(txn, conn, &results, level, &db.table)
            .await
            .map_err(|e| abort(db, txn, e))?;
    }

    Ok(results)
}

pub async fn scan(db: &Database, args: &[String], conn: ConnId) -> MeteorResult<Vec<u8>> {
    let args = ensure_condition(db, args)?;
    let results = filtered_read(db, &args, "SCAN(*)", conn).await?;
    json_response(&results)
}

pub async fn count(db: &Database, args: &[String], conn: ConnId) -> MeteorResult<Vec<u8>> {
    let args = ensure_condition(db, args)?;
    let results = filtered_read(db, &args, "COUNT(*)", conn).await?;
    let visible = results.values().filter(|v| !v.is_tombstone()).count();
    Ok(visible.to_string().into_bytes())
}

// ── CGET ─────────────────────────────────────────────────────────────────

/// CGET accepts a restricted `WHERE` condition over key fields only:
/// `key`/`key_name` with the comparison operators, or `key_prefix` with
/// equality.
fn build_cget_filter(
    condition: &str,
) -> MeteorResult<Box<dyn Fn(&str, &Value) -> bool + Send + Sync>> {
    let expression = condition.trim_start_matches("WHERE ").trim();
    let mut parts = expression.splitn(3, char::is_whitespace);
    let (Some(field), Some(operator), Some(operand)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(bad_request("invalid condition expression format"));
    };

    let operand = operand.trim();
    let operand = operand
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(operand)
        .to_string();
    let operator = operator.to_string();

    match field {
        "key" | "key_name" => Ok(Box::new(move |key: &str, value: &Value| {
            if value.is_tombstone() {
                return false;
            }
            match operator.as_str() {
                "=" | "==" => key == operand,
                "!=" => key != operand,
                ">" => key > operand.as_str(),
                "<" => key < operand.as_str(),
                ">=" => key >= operand.as_str(),
                "<=" => key <= operand.as_str(),
                "LIKE" => key_like(key, &operand),
                _ => false,
            }
        })),
        "key_prefix" => {
            if operator != "=" && operator != "==" {
                return Err(bad_request("key_prefix only supports = operator"));
            }
            Ok(Box::new(move |key: &str, value: &Value| {
                !value.is_tombstone() && key.starts_with(&operand)
            }))
        }
        other => Err(bad_request(format!(
            "unsupported field in condition: {other}"
        ))),
    }
}

fn key_like(key: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('%') {
        if !prefix.contains('%') {
            return key.starts_with(prefix);
        }
    }
    if let Some(suffix) = pattern.strip_prefix('%') {
        if !suffix.contains('%') {
            return key.ends_with(suffix);
        }
    }
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 2 {
        return key.starts_with(parts[0]) && key.ends_with(parts[1]);
    }
    key.contains(pattern)
}

pub async fn cget(db: &Database, args: &[String], conn: ConnId) -> MeteorResult<Vec<u8>> {
    let args = ensure_condition(db, args)?;
    if !args.condition.starts_with("WHERE ") {
        return Err(bad_request("condition must start with 'WHERE '"));
    }

    let (txn, auto_commit) = resolve_txn(db, args.txn)?;
    let level = db.txns.isolation_of(txn);

    db.txns
        .acquire_predicate_lock(txn, &args.condition, level)
        .await
        .map_err(|e| abort(db, txn, e))?;

    let filter = build_cget_filter(&args.condition).map_err(|e| abort(db, txn, e))?;
    let results = db
        .txns
        .read_filtered(txn, conn, &*filter, &db.table)
        .map_err(|e| abort(db, txn, e))?;

    if auto_commit {
        db.txns.clear(txn);
    } else {
        db.txns
            .stage_read_set(txn, conn, &results, level, &db.table)
            .await
            .map_err(|e| abort(db, txn, e))?;
    }

    json_response(&results)
}
