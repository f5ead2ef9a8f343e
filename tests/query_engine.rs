// Query engine scenarios: hash-join multiset correctness, optimizer plans
// versus the naive serial plan, aggregation, windows, CTEs, and outer
// joins through the full pipeline.

use mantisdb::common::Value;
use mantisdb::execution::QueryResult;
use mantisdb::{Config, MantisDb};

fn engine() -> (tempfile::TempDir, MantisDb, u64) {
    let dir = tempfile::tempdir().unwrap();
    let db = MantisDb::open(Config::at(dir.path())).unwrap();
    let session = db.create_session("test", "main");
    (dir, db, session)
}

/// Order-insensitive rendering of a result set.
fn multiset(result: &QueryResult) -> Vec<String> {
    let mut rows: Vec<String> = result
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("|")
        })
        .collect();
    rows.sort();
    rows
}

fn seed_join_tables(db: &MantisDb, session: u64) {
    db.execute(session, "CREATE TABLE l (id INTEGER PRIMARY KEY, lv TEXT)")
        .unwrap();
    db.execute(session, "CREATE TABLE r (rid INTEGER PRIMARY KEY, id INTEGER, rv TEXT)")
        .unwrap();
    db.execute(session, "INSERT INTO l VALUES (1, 'a'), (2, 'b'), (3, 'c')")
        .unwrap();
    db.execute(
        session,
        "INSERT INTO r VALUES (1, 1, 'x'), (2, 1, 'y'), (3, 3, 'z')",
    )
    .unwrap();
}

#[test]
fn test_join_yields_expected_multiset() {
    let (_dir, db, session) = engine();
    seed_join_tables(&db, session);

    let result = db
        .execute(
            session,
            "SELECT l.id, l.lv, r.rv FROM l JOIN r ON l.id = r.id",
        )
        .unwrap();
    assert_eq!(
        multiset(&result),
        vec!["1|'a'|'x'", "1|'a'|'y'", "3|'c'|'z'"]
    );
}

#[test]
fn test_optimized_plan_matches_naive_plan() {
    // The cost-based plan and the all-features-disabled plan must produce
    // the same multiset of rows.
    let queries = [
        "SELECT l.id, r.rv FROM l JOIN r ON l.id = r.id",
        "SELECT l.id, count(*) FROM l JOIN r ON l.id = r.id GROUP BY l.id",
        "SELECT l.lv FROM l WHERE l.id BETWEEN 1 AND 2",
        "SELECT l.id, r.rv FROM l LEFT JOIN r ON l.id = r.id",
    ];

    let dir_a = tempfile::tempdir().unwrap();
    let clever = MantisDb::open(Config::at(dir_a.path())).unwrap();
    let sa = clever.create_session("a", "main");
    seed_join_tables(&clever, sa);

    let dir_b = tempfile::tempdir().unwrap();
    let mut naive_config = Config::at(dir_b.path());
    naive_config.enable_hash_join = false;
    naive_config.enable_merge_join = false;
    naive_config.enable_index_scan = false;
    naive_config.enable_parallel_scan = false;
    let naive = MantisDb::open(naive_config).unwrap();
    let sb = naive.create_session("b", "main");
    seed_join_tables(&naive, sb);

    for sql in queries {
        let fast = clever.execute(sa, sql).unwrap();
        let slow = naive.execute(sb, sql).unwrap();
        assert_eq!(multiset(&fast), multiset(&slow), "divergence for {}", sql);
    }
}

#[test]
fn test_left_right_and_cross_joins() {
    let (_dir, db, session) = engine();
    seed_join_tables(&db, session);

    let left = db
        .execute(session, "SELECT l.id, r.rv FROM l LEFT JOIN r ON l.id = r.id")
        .unwrap();
    // 3 matches plus l.id = 2 padded with NULL.
    assert_eq!(left.rows.len(), 4);
    assert!(multiset(&left).contains(&"2|NULL".to_string()));

    let right = db
        .execute(session, "SELECT r.rid, l.lv FROM l RIGHT JOIN r ON l.id = r.id")
        .unwrap();
    assert_eq!(right.rows.len(), 3);

    let cross = db
        .execute(session, "SELECT l.id FROM l CROSS JOIN r")
        .unwrap();
    assert_eq!(cross.rows.len(), 9);
}

#[test]
fn test_aggregation_and_having() {
    let (_dir, db, session) = engine();
    db.execute(
        session,
        "CREATE TABLE m (id INTEGER PRIMARY KEY, g TEXT, v INTEGER)",
    )
    .unwrap();
    db.execute(
        session,
        "INSERT INTO m VALUES (1, 'a', 2), (2, 'a', 4), (3, 'b', 10), (4, 'b', 20), (5, 'c', 1)",
    )
    .unwrap();

    let result = db
        .execute(
            session,
            "SELECT g, count(*), avg(v), min(v), max(v) FROM m \
             GROUP BY g HAVING count(*) > 1 ORDER BY g ASC",
        )
        .unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0][0], Value::Text("a".into()));
    assert_eq!(result.rows[0][2], Value::Float(3.0));
    assert_eq!(result.rows[1][4], Value::Integer(20));
}

#[test]
fn test_stddev_variance() {
    let (_dir, db, session) = engine();
    db.execute(session, "CREATE TABLE v (id INTEGER PRIMARY KEY, x FLOAT)")
        .unwrap();
    db.execute(
        session,
        "INSERT INTO v VALUES (1, 2.0), (2, 4.0), (3, 4.0), (4, 4.0), (5, 5.0), (6, 5.0), (7, 7.0), (8, 9.0)",
    )
    .unwrap();
    let result = db
        .execute(session, "SELECT variance(x) FROM v")
        .unwrap();
    let Value::Float(var) = result.rows[0][0] else {
        panic!("expected float variance");
    };
    assert!((var - 4.571428571428571).abs() < 1e-9);
}

#[test]
fn test_window_functions() {
    let (_dir, db, session) = engine();
    db.execute(
        session,
        "CREATE TABLE w (id INTEGER PRIMARY KEY, g TEXT, v INTEGER)",
    )
    .unwrap();
    db.execute(
        session,
        "INSERT INTO w VALUES (1, 'a', 10), (2, 'a', 20), (3, 'b', 5), (4, 'b', 15)",
    )
    .unwrap();

    let result = db
        .execute(
            session,
            "SELECT id, row_number() OVER (PARTITION BY g ORDER BY v DESC) FROM w ORDER BY id ASC",
        )
        .unwrap();
    // Within each partition the larger v ranks first.
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Integer(1), Value::Integer(2)],
            vec![Value::Integer(2), Value::Integer(1)],
            vec![Value::Integer(3), Value::Integer(2)],
            vec![Value::Integer(4), Value::Integer(1)],
        ]
    );

    let result = db
        .execute(
            session,
            "SELECT id, sum(v) OVER (PARTITION BY g ORDER BY id ASC) FROM w ORDER BY id ASC",
        )
        .unwrap();
    // Running sums per partition.
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Integer(1), Value::Integer(10)],
            vec![Value::Integer(2), Value::Integer(30)],
            vec![Value::Integer(3), Value::Integer(5)],
            vec![Value::Integer(4), Value::Integer(20)],
        ]
    );
}

#[test]
fn test_cte_and_subquery_sources() {
    let (_dir, db, session) = engine();
    db.execute(session, "CREATE TABLE base (id INTEGER PRIMARY KEY, v INTEGER)")
        .unwrap();
    db.execute(
        session,
        "INSERT INTO base VALUES (1, 100), (2, 200), (3, 300)",
    )
    .unwrap();

    let result = db
        .execute(
            session,
            "WITH big (id) AS (SELECT id FROM base WHERE v > 150) \
             SELECT count(*) FROM big",
        )
        .unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(2)]]);

    let result = db
        .execute(
            session,
            "SELECT s.v FROM (SELECT id, v FROM base WHERE id < 3) AS s ORDER BY s.v DESC",
        )
        .unwrap();
    assert_eq!(
        result.rows,
        vec![vec![Value::Integer(200)], vec![Value::Integer(100)]]
    );
}

#[test]
fn test_case_cast_distinct_limit() {
    let (_dir, db, session) = engine();
    db.execute(session, "CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)")
        .unwrap();
    db.execute(
        session,
        "INSERT INTO t VALUES (1, 1), (2, 1), (3, 2), (4, 3)",
    )
    .unwrap();

    let result = db
        .execute(session, "SELECT DISTINCT v FROM t ORDER BY v ASC LIMIT 2")
        .unwrap();
    assert_eq!(
        result.rows,
        vec![vec![Value::Integer(1)], vec![Value::Integer(2)]]
    );

    let result = db
        .execute(
            session,
            "SELECT CASE WHEN v = 1 THEN 'one' ELSE CAST(v AS TEXT) END FROM t ORDER BY id ASC",
        )
        .unwrap();
    assert_eq!(result.rows[0], vec![Value::Text("one".into())]);
    assert_eq!(result.rows[3], vec![Value::Text("3".into())]);
}

#[test]
fn test_natural_and_using_joins() {
    let (_dir, db, session) = engine();
    db.execute(session, "CREATE TABLE a (id INTEGER PRIMARY KEY, av TEXT)")
        .unwrap();
    db.execute(session, "CREATE TABLE b (id INTEGER PRIMARY KEY, bv TEXT)")
        .unwrap();
    db.execute(session, "INSERT INTO a VALUES (1, 'a1'), (2, 'a2')")
        .unwrap();
    db.execute(session, "INSERT INTO b VALUES (2, 'b2'), (3, 'b3')")
        .unwrap();

    let with_using = db
        .execute(session, "SELECT a.av, b.bv FROM a JOIN b USING (id)")
        .unwrap();
    assert_eq!(with_using.rows, vec![vec![
        Value::Text("a2".into()),
        Value::Text("b2".into())
    ]]);

    let natural = db
        .execute(session, "SELECT a.av, b.bv FROM a NATURAL JOIN b")
        .unwrap();
    assert_eq!(multiset(&natural), multiset(&with_using));
}

#[test]
fn test_large_scan_with_parallel_settings() {
    let (_dir, db, session) = engine();
    db.execute(session, "CREATE TABLE big (id INTEGER PRIMARY KEY, v INTEGER)")
        .unwrap();
    // Batched inserts keep statement sizes reasonable.
    for chunk in 0..20 {
        let rows: Vec<String> = (0..100)
            .map(|i| {
                let id = chunk * 100 + i;
                format!("({}, {})", id, id % 7)
            })
            .collect();
        db.execute(
            session,
            &format!("INSERT INTO big VALUES {}", rows.join(", ")),
        )
        .unwrap();
    }
    db.refresh_statistics();

    let result = db
        .execute(session, "SELECT count(*) FROM big WHERE v = 3")
        .unwrap();
    let Value::Integer(n) = result.rows[0][0] else {
        panic!("expected integer count");
    };
    let expected = (0..2000).filter(|i| i % 7 == 3).count() as i64;
    assert_eq!(n, expected);
}
