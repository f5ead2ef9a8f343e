// Distributed commit atomicity across heterogeneous storage engines.

use mantisdb::common::Value;
use mantisdb::storage::StorageType;
use mantisdb::{Config, MantisDb};

fn engine() -> (tempfile::TempDir, MantisDb, u64) {
    let dir = tempfile::tempdir().unwrap();
    let db = MantisDb::open(Config::at(dir.path())).unwrap();
    let session = db.create_session("test", "main");
    db.execute(session, "CREATE TABLE kvt (id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    db.execute(
        session,
        "CREATE TABLE colt (id INTEGER PRIMARY KEY, w TEXT) ENGINE = columnar",
    )
    .unwrap();
    (dir, db, session)
}

#[test]
fn test_cross_engine_commit_applies_both() {
    let (_dir, db, session) = engine();
    db.execute(session, "BEGIN").unwrap();
    db.execute(session, "INSERT INTO kvt VALUES (1, 'k')").unwrap();
    db.execute(session, "INSERT INTO colt VALUES (1, 'c')").unwrap();
    db.execute(session, "COMMIT").unwrap();

    let kv = db.execute(session, "SELECT v FROM kvt").unwrap();
    let col = db.execute(session, "SELECT w FROM colt").unwrap();
    assert_eq!(kv.rows, vec![vec![Value::Text("k".into())]]);
    assert_eq!(col.rows, vec![vec![Value::Text("c".into())]]);
}

#[test]
fn test_prepare_failure_aborts_both_participants() {
    let (_dir, db, session) = engine();
    db.execute(session, "BEGIN").unwrap();
    db.execute(session, "INSERT INTO kvt VALUES (1, 'k')").unwrap();
    db.execute(session, "INSERT INTO colt VALUES (1, 'c')").unwrap();

    // The columnar participant votes no at prepare time.
    db.participant(StorageType::Columnar)
        .unwrap()
        .inject_prepare_failure();
    let err = db.execute(session, "COMMIT").unwrap_err();
    assert!(err.to_string().contains("abort"));

    // Neither engine has visible rows from the statement.
    let kv = db.execute(session, "SELECT v FROM kvt").unwrap();
    let col = db.execute(session, "SELECT w FROM colt").unwrap();
    assert!(kv.rows.is_empty());
    assert!(col.rows.is_empty());
}

#[test]
fn test_aborted_distributed_txn_stays_aborted_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = MantisDb::open(Config::at(dir.path())).unwrap();
        let session = db.create_session("test", "main");
        db.execute(session, "CREATE TABLE kvt (id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        db.execute(
            session,
            "CREATE TABLE colt (id INTEGER PRIMARY KEY, w TEXT) ENGINE = columnar",
        )
        .unwrap();

        db.execute(session, "BEGIN").unwrap();
        db.execute(session, "INSERT INTO kvt VALUES (1, 'k')").unwrap();
        db.execute(session, "INSERT INTO colt VALUES (1, 'c')").unwrap();
        db.participant(StorageType::Columnar)
            .unwrap()
            .inject_prepare_failure();
        let _ = db.execute(session, "COMMIT");
        // Crash without shutdown.
    }

    let db = MantisDb::open(Config::at(dir.path())).unwrap();
    let session = db.create_session("test", "main");
    assert!(db.execute(session, "SELECT v FROM kvt").unwrap().rows.is_empty());
    assert!(db.execute(session, "SELECT w FROM colt").unwrap().rows.is_empty());
}

#[test]
fn test_committed_distributed_txn_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = MantisDb::open(Config::at(dir.path())).unwrap();
        let session = db.create_session("test", "main");
        db.execute(session, "CREATE TABLE kvt (id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        db.execute(
            session,
            "CREATE TABLE colt (id INTEGER PRIMARY KEY, w TEXT) ENGINE = columnar",
        )
        .unwrap();
        db.execute(
            session,
            "BEGIN; INSERT INTO kvt VALUES (1, 'k'); INSERT INTO colt VALUES (1, 'c'); COMMIT",
        )
        .unwrap();
    }

    let db = MantisDb::open(Config::at(dir.path())).unwrap();
    let session = db.create_session("test", "main");
    assert_eq!(
        db.execute(session, "SELECT v FROM kvt").unwrap().rows,
        vec![vec![Value::Text("k".into())]]
    );
    assert_eq!(
        db.execute(session, "SELECT w FROM colt").unwrap().rows,
        vec![vec![Value::Text("c".into())]]
    );
}
