//! End-to-end command scenarios driven through `Database::dispatch`,
//! exactly as bytes would arrive off a connection.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use meteor_common::types::ConnId;
use meteor_server::Database;

const CONN: ConnId = ConnId(1);

fn open(dir: &Path) -> Database {
    Database::open(dir, true).unwrap()
}

async fn send(db: &Database, line: &str) -> String {
    send_as(db, CONN, line).await
}

async fn send_as(db: &Database, conn: ConnId, line: &str) -> String {
    let response = db.dispatch(line, conn).await;
    String::from_utf8(response)
        .unwrap()
        .trim_end()
        .to_string()
}

#[tokio::test]
async fn test_scenario_put_get_delete_get() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, "PUT a 1").await, "OK");
    assert_eq!(send(&db, "GET a").await, "1");
    assert_eq!(send(&db, "DELETE a").await, "OK");
    assert_eq!(send(&db, "GET a").await, "-2");
}

#[tokio::test]
async fn test_scenario_interactive_txn_commit() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    let t1 = send(&db, "BEGIN").await;
    t1.parse::<u32>().expect("BEGIN returns a decimal txn id");

    assert_eq!(send(&db, &format!("PUT k 1 {t1}")).await, "QUEUED");
    // Outside the transaction the key does not exist yet.
    assert_eq!(send(&db, "GET k").await, "-1");
    assert_eq!(send(&db, &format!("COMMIT {t1}")).await, "OK");
    assert_eq!(send(&db, "GET k").await, "1");
}

#[tokio::test]
async fn test_scenario_snapshot_isolation_conflict() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, "PUT k 1").await, "OK");
    let t2 = send(&db, "BEGIN SNAPSHOT_ISOLATION").await;
    t2.parse::<u32>().unwrap();

    // A concurrent auto-commit moves the key past the snapshot.
    assert_eq!(send(&db, "PUT k 2").await, "OK");
    // The snapshot transaction still sees the old value.
    assert_eq!(send(&db, &format!("GET k {t2}")).await, "1");
    // First-committer-wins rejects its write.
    let err = send(&db, &format!("PUT k 3 {t2}")).await;
    assert!(
        err.starts_with("error: write-write conflict"),
        "got: {err}"
    );
    // Rolling back the aborted transaction still answers OK.
    assert_eq!(send(&db, &format!("ROLLBACK {t2}")).await, "OK");
    assert_eq!(send(&db, "GET k").await, "2");
}

#[tokio::test]
async fn test_scenario_repeatable_read() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, "PUT k 1").await, "OK");
    let t3 = send(&db, "BEGIN REPEATABLE_READ").await;
    t3.parse::<u32>().unwrap();

    assert_eq!(send(&db, &format!("GET k {t3}")).await, "1");
    // A foreign auto-commit overwrites the key mid-transaction.
    assert_eq!(send(&db, "PUT k 9").await, "OK");
    // The transaction keeps seeing its first read.
    assert_eq!(send(&db, &format!("GET k {t3}")).await, "1");
    assert_eq!(send(&db, &format!("COMMIT {t3}")).await, "OK");
    assert_eq!(send(&db, "GET k").await, "9");
}

#[tokio::test]
async fn test_scenario_scan_like() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, "PUT user_a x").await, "OK");
    assert_eq!(send(&db, "PUT user_b y").await, "OK");
    assert_eq!(send(&db, "PUT admin z").await, "OK");

    let result = send(&db, r#"SCAN "$key LIKE 'user_%'""#).await;
    assert_eq!(result, r#"{"user_a":"x","user_b":"y"}"#);
}

#[tokio::test]
async fn test_scenario_count_numeric() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, "PUT n1 10").await, "OK");
    assert_eq!(send(&db, "PUT n2 200").await, "OK");
    assert_eq!(send(&db, r#"COUNT "$value > 50""#).await, "1");
}

#[tokio::test]
async fn test_rget_range_and_single_key() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, "PUT a 1").await, "OK");
    assert_eq!(send(&db, "PUT b 2").await, "OK");
    assert_eq!(send(&db, "PUT c 3").await, "OK");

    assert_eq!(send(&db, "RGET a b").await, r#"{"a":"1","b":"2"}"#);
    // startKey == endKey returns the single matching entry.
    assert_eq!(send(&db, "RGET b b").await, r#"{"b":"2"}"#);
    // Reversed bounds are rejected.
    let err = send(&db, "RGET c a").await;
    assert!(err.starts_with("error:"), "got: {err}");
}

#[tokio::test]
async fn test_scan_star_and_count_star() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, "PUT a 1").await, "OK");
    assert_eq!(send(&db, "PUT b 2").await, "OK");
    assert_eq!(send(&db, "DELETE b").await, "OK");

    // `*` matches every non-tombstone record.
    assert_eq!(send(&db, "SCAN *").await, r#"{"a":"1"}"#);
    assert_eq!(send(&db, "COUNT *").await, "1");
}

#[tokio::test]
async fn test_nested_not_and_like_percent() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, "PUT a 1").await, "OK");
    assert_eq!(send(&db, "PUT b 2").await, "OK");

    assert_eq!(
        send(&db, r#"SCAN "NOT NOT $key = 'a'""#).await,
        r#"{"a":"1"}"#
    );
    assert_eq!(send(&db, r#"COUNT "$value LIKE '%'""#).await, "2");
}

#[tokio::test]
async fn test_cget_key_conditions() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, "PUT user_a x").await, "OK");
    assert_eq!(send(&db, "PUT admin z").await, "OK");

    assert_eq!(
        send(&db, r#"CGET "WHERE key_prefix = user""#).await,
        r#"{"user_a":"x"}"#
    );
    assert_eq!(
        send(&db, r#"CGET "WHERE key = admin""#).await,
        r#"{"admin":"z"}"#
    );
    assert_eq!(
        send(&db, r#"CGET "WHERE key LIKE user_%""#).await,
        r#"{"user_a":"x"}"#
    );

    let err = send(&db, r#"CGET "key = admin""#).await;
    assert!(err.starts_with("error: condition must start with"), "got: {err}");

    let err = send(&db, r#"CGET "WHERE age > 25""#).await;
    assert!(err.starts_with("error: unsupported field"), "got: {err}");
}

#[tokio::test]
async fn test_unknown_command_and_bad_args() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    let err = send(&db, "FROB x").await;
    assert!(err.starts_with("error: unknown operation"), "got: {err}");

    let err = send(&db, "PUT onlykey").await;
    assert!(err.starts_with("error:"), "got: {err}");

    let err = send(&db, "BEGIN BOGUS_LEVEL").await;
    assert!(
        err.starts_with("error: invalid transaction isolation level"),
        "got: {err}"
    );
}

#[tokio::test]
async fn test_forged_txn_id_rejected() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    let err = send(&db, "PUT k v 4711").await;
    assert_eq!(err, "error: transaction id not allowed");

    let err = send(&db, "COMMIT 4711").await;
    assert!(err.starts_with("error: transaction 4711 not found"), "got: {err}");
}

#[tokio::test]
async fn test_txn_belongs_to_its_connection() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    let txn = send(&db, "BEGIN").await;
    assert_eq!(send(&db, &format!("PUT k v {txn}")).await, "QUEUED");

    // Another connection may not touch the transaction.
    let err = send_as(&db, ConnId(2), &format!("COMMIT {txn}")).await;
    assert!(err.starts_with("error:"), "got: {err}");
    let err = send_as(&db, ConnId(2), &format!("GET k {txn}")).await;
    assert!(err.starts_with("error:"), "got: {err}");

    // The owner is unaffected.
    assert_eq!(send(&db, &format!("COMMIT {txn}")).await, "OK");
    assert_eq!(send(&db, "GET k").await, "v");
}

#[tokio::test]
async fn test_quoted_values_preserve_whitespace() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, r#"PUT greeting "hello world""#).await, "OK");
    assert_eq!(send(&db, "GET greeting").await, "hello world");

    assert_eq!(send(&db, r#"PUT note 'it"s quoted'"#).await, "OK");
    assert_eq!(send(&db, "GET note").await, "it\"s quoted");
}

#[tokio::test]
async fn test_transactional_scan_sees_own_writes() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, "PUT user_a x").await, "OK");
    let txn = send(&db, "BEGIN").await;
    assert_eq!(send(&db, &format!("PUT user_b y {txn}")).await, "QUEUED");

    // The transaction sees its staged write merged over the table.
    assert_eq!(
        send(&db, &format!(r#"SCAN "$key LIKE 'user_%'" {txn}"#)).await,
        r#"{"user_a":"x","user_b":"y"}"#
    );
    // Outside it, only the committed key shows.
    assert_eq!(
        send(&db, r#"SCAN "$key LIKE 'user_%'""#).await,
        r#"{"user_a":"x"}"#
    );

    assert_eq!(send(&db, &format!("ROLLBACK {txn}")).await, "OK");
    assert_eq!(
        send(&db, r#"SCAN "$key LIKE 'user_%'""#).await,
        r#"{"user_a":"x"}"#
    );
}

#[tokio::test]
async fn test_delete_inside_txn_hides_key_on_commit() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path());

    assert_eq!(send(&db, "PUT k v").await, "OK");
    let txn = send(&db, "BEGIN").await;
    assert_eq!(send(&db, &format!("DELETE k {txn}")).await, "QUEUED");
    // Still visible outside until commit.
    assert_eq!(send(&db, "GET k").await, "v");
    assert_eq!(send(&db, &format!("COMMIT {txn}")).await, "OK");
    assert_eq!(send(&db, "GET k").await, "-2");
}

#[tokio::test]
async fn test_restart_recovers_committed_state() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(dir.path());
        assert_eq!(send(&db, "PUT a 1").await, "OK");
        assert_eq!(send(&db, "PUT b 2").await, "OK");
        assert_eq!(send(&db, "DELETE b").await, "OK");

        let txn = send(&db, "BEGIN").await;
        assert_eq!(send(&db, &format!("PUT c 3 {txn}")).await, "QUEUED");
        assert_eq!(send(&db, &format!("COMMIT {txn}")).await, "OK");

        let uncommitted = send(&db, "BEGIN").await;
        assert_eq!(
            send(&db, &format!("PUT d 4 {uncommitted}")).await,
            "QUEUED"
        );
        // No commit for d.
    }

    let db = open(dir.path());
    assert_eq!(send(&db, "GET a").await, "1");
    assert_eq!(send(&db, "GET b").await, "-2");
    assert_eq!(send(&db, "GET c").await, "3");
    assert_eq!(send(&db, "GET d").await, "-1");

    // Restarting twice over the same WAL yields the same state.
    drop(db);
    let db = open(dir.path());
    assert_eq!(send(&db, "GET a").await, "1");
    assert_eq!(send(&db, "GET c").await, "3");
    assert_eq!(send(&db, "GET d").await, "-1");
}

#[tokio::test]
async fn test_concurrent_connections_auto_commit() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(open(dir.path()));

    let mut handles = Vec::new();
    for i in 0..8u64 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let conn = ConnId(100 + i);
            for j in 0..20 {
                let line = format!("PUT key_{i}_{j} v{j}");
                assert_eq!(send_as(&db, conn, &line).await, "OK");
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(send(&db, "COUNT *").await, "160");
}
