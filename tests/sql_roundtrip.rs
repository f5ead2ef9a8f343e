// Stringify/reparse property: for every statement that validates, parsing
// its rendered form yields a statement that renders identically and
// validates the same way.

use mantisdb::catalog::{Catalog, Column, DataType, TableSchema};
use mantisdb::parser::{Parser, Validator};
use mantisdb::storage::StorageType;

fn catalog() -> Catalog {
    let catalog = Catalog::new();
    let mut users = TableSchema::new(
        "users",
        vec![
            Column::new("id", DataType::Integer).not_null(),
            Column::new("name", DataType::Text),
            Column::new("age", DataType::Integer),
            Column::new("joined", DataType::Timestamp),
        ],
        StorageType::Kv,
    );
    users.primary_key = vec!["id".to_string()];
    catalog.create_table(users).unwrap();

    let mut orders = TableSchema::new(
        "orders",
        vec![
            Column::new("oid", DataType::Integer).not_null(),
            Column::new("user_id", DataType::Integer),
            Column::new("total", DataType::Float),
        ],
        StorageType::Columnar,
    );
    orders.primary_key = vec!["oid".to_string()];
    catalog.create_table(orders).unwrap();
    catalog
}

const CORPUS: &[&str] = &[
    "SELECT id, name FROM users",
    "SELECT DISTINCT name FROM users WHERE age > 21 ORDER BY name ASC LIMIT 10 OFFSET 5",
    "SELECT u.name, o.total FROM users u INNER JOIN orders o ON u.id = o.user_id",
    "SELECT u.name FROM users u LEFT JOIN orders o ON u.id = o.user_id WHERE o.oid IS NULL",
    "SELECT * FROM users CROSS JOIN orders",
    "SELECT name FROM users WHERE age BETWEEN 20 AND 30",
    "SELECT name FROM users WHERE age NOT BETWEEN 20 AND 30",
    "SELECT name FROM users WHERE name LIKE 'A%' OR name ILIKE '%b_'",
    "SELECT name FROM users WHERE id IN (1, 2, 3)",
    "SELECT name FROM users WHERE id IN (SELECT user_id FROM orders)",
    "SELECT name FROM users u WHERE EXISTS (SELECT 1 FROM orders o WHERE o.user_id = u.id)",
    "SELECT CASE WHEN age >= 18 THEN 'adult' ELSE 'minor' END FROM users",
    "SELECT CAST(age AS TEXT), EXTRACT(YEAR FROM joined) FROM users",
    "SELECT count(*), sum(age), avg(age), min(age), max(age) FROM users",
    "SELECT name, count(*) FROM users GROUP BY name HAVING count(*) > 1",
    "SELECT count(*) FILTER (WHERE age > 30) FROM users",
    "SELECT row_number() OVER (PARTITION BY age ORDER BY id ASC) FROM users",
    "SELECT sum(total) OVER (ORDER BY oid ASC ROWS BETWEEN 2 PRECEDING AND CURRENT ROW) FROM orders",
    "WITH adults AS (SELECT id FROM users WHERE age >= 18) SELECT count(*) FROM adults",
    "SELECT (age + 1) * 2 - -3 FROM users",
    "SELECT name || '!' FROM users",
    "INSERT INTO users (id, name) VALUES (1, 'ann'), (2, 'bob')",
    "INSERT INTO users (id, name) VALUES (1, 'ann') ON CONFLICT (id) DO NOTHING",
    "INSERT INTO users (id, name) VALUES (1, 'ann') ON CONFLICT (id) DO UPDATE SET name = 'ann' WHERE age > 0",
    "UPDATE users SET age = age + 1 WHERE id = 1",
    "DELETE FROM users WHERE age IS NULL",
    "CREATE TABLE events (id INTEGER PRIMARY KEY, body TEXT NOT NULL, at TIMESTAMP, CHECK (id > 0)) ENGINE = columnar",
    "CREATE UNIQUE INDEX users_name_key ON users (name)",
    "DROP TABLE IF EXISTS ghosts",
    "BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY",
    "BEGIN ISOLATION LEVEL REPEATABLE READ",
    "COMMIT AND CHAIN",
    "ROLLBACK TO SAVEPOINT sp1",
    "SAVEPOINT sp1",
    "RELEASE SAVEPOINT sp1",
    "EXPLAIN SELECT id FROM users",
];

#[test]
fn test_stringify_reparse_fixed_point() {
    for sql in CORPUS {
        let first = Parser::parse_one(sql).unwrap_or_else(|e| panic!("parse '{}': {}", sql, e));
        let rendered = first.to_string();
        let second = Parser::parse_one(&rendered)
            .unwrap_or_else(|e| panic!("reparse '{}': {}", rendered, e));
        assert_eq!(
            second.to_string(),
            rendered,
            "render not a fixed point for '{}'",
            sql
        );
    }
}

#[test]
fn test_reparsed_statements_validate_identically() {
    let catalog = catalog();
    for sql in CORPUS {
        let first = Parser::parse_one(sql).unwrap();
        let first_outcome = Validator::new(&catalog).validate(&first);
        let second = Parser::parse_one(&first.to_string()).unwrap();
        let second_outcome = Validator::new(&catalog).validate(&second);
        match (first_outcome, second_outcome) {
            (Ok(a), Ok(b)) => assert_eq!(
                a.warnings, b.warnings,
                "warning divergence for '{}'",
                sql
            ),
            (Err(a), Err(b)) => assert_eq!(a.to_string(), b.to_string()),
            (a, b) => panic!(
                "validation divergence for '{}': {:?} vs {:?}",
                sql,
                a.map(|o| o.warnings),
                b.map(|o| o.warnings)
            ),
        }
    }
}

#[test]
fn test_syntax_errors_carry_position() {
    let cases = [
        ("SELEC 1", 1, 1),
        ("SELECT * FRM users", 1, 10),
        ("SELECT 1 +", 1, 11),
    ];
    for (sql, _line, _col) in cases {
        let err = Parser::parse(sql).unwrap_err();
        let text = err.to_string();
        assert!(
            text.contains("line") && text.contains("column"),
            "no position in '{}'",
            text
        );
    }
}

#[test]
fn test_keyword_suggestions_near_misses() {
    let err = Parser::parse("SELEC 1").unwrap_err();
    assert!(err.to_string().contains("SELECT"));

    let err = Parser::parse("SELECT 1 FRM users").unwrap_err();
    assert!(err.to_string().contains("FROM"));
}
