// Plan cache.
//
// Keyed by a canonical structural fingerprint of the validated statement: a
// pre-order walk feeding operator codes and canonically rendered literals
// into an FNV-1a hash. Pointer identity is useless as a key across
// statements; two textually different but structurally identical statements
// must hit the same slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::execution::planner::Plan;
use crate::monitoring::metrics::{metrics, names};
use crate::parser::ast::{walk_select_exprs, Expr, SelectItem, Statement, TableRef};

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

struct Fnv(u64);

impl Fnv {
    fn new() -> Self {
        Fnv(FNV_OFFSET)
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn code(&mut self, code: u8) {
        self.write(&[code]);
    }
}

/// Canonical structural hash of a statement.
pub fn fingerprint(stmt: &Statement) -> u64 {
    let mut hasher = Fnv::new();
    hash_statement(stmt, &mut hasher);
    hasher.0
}

fn hash_statement(stmt: &Statement, h: &mut Fnv) {
    match stmt {
        Statement::Select(select) => {
            h.code(1);
            h.write(&[select.distinct as u8]);
            for item in &select.projection {
                match item {
                    SelectItem::Wildcard => h.code(2),
                    SelectItem::QualifiedWildcard(q) => {
                        h.code(3);
                        h.write(q.to_lowercase().as_bytes());
                    }
                    SelectItem::Expr { expr, alias } => {
                        h.code(4);
                        hash_expr(expr, h);
                        if let Some(a) = alias {
                            h.write(a.to_lowercase().as_bytes());
                        }
                    }
                }
            }
            if let Some(from) = &select.from {
                hash_table_ref(from, h);
            }
            h.code(5);
            walk_select_exprs(select, &mut |e| hash_expr_shallow(e, h));
            if let Some(limit) = select.limit {
                h.code(6);
                h.write(&limit.to_le_bytes());
            }
            if let Some(offset) = select.offset {
                h.code(7);
                h.write(&offset.to_le_bytes());
            }
        }
        // DML and DDL plans are not cached; hashing the rendered text keeps
        // the fingerprint total anyway.
        other => {
            h.code(9);
            h.write(other.to_string().as_bytes());
        }
    }
}

fn hash_table_ref(table_ref: &TableRef, h: &mut Fnv) {
    match table_ref {
        TableRef::Table { name, alias } => {
            h.code(10);
            h.write(name.to_lowercase().as_bytes());
            if let Some(a) = alias {
                h.write(a.to_lowercase().as_bytes());
            }
        }
        TableRef::Subquery { query, alias } => {
            h.code(11);
            h.write(alias.to_lowercase().as_bytes());
            hash_statement(&Statement::Select(query.clone()), h);
        }
        TableRef::Join {
            left,
            right,
            join_type,
            constraint,
        } => {
            h.code(12);
            h.write(&[*join_type as u8]);
            hash_table_ref(left, h);
            hash_table_ref(right, h);
            h.write(format!("{:?}", constraint).as_bytes());
        }
    }
}

/// Shallow pre-order contribution for one expression node: operator code
/// plus canonically rendered literal, no recursion (the walk recurses).
fn hash_expr_shallow(expr: &Expr, h: &mut Fnv) {
    match expr {
        Expr::Literal(v) => {
            h.code(20);
            h.write(v.to_string().as_bytes());
        }
        Expr::Column { table, name } => {
            h.code(21);
            if let Some(t) = table {
                h.write(t.to_lowercase().as_bytes());
                h.code(b'.');
            }
            h.write(name.to_lowercase().as_bytes());
        }
        Expr::Wildcard => h.code(22),
        Expr::Binary { op, .. } => {
            h.code(23);
            h.write(&[*op as u8]);
        }
        Expr::Unary { op, .. } => {
            h.code(24);
            h.write(&[*op as u8]);
        }
        Expr::Function(call) => {
            h.code(25);
            h.write(call.name.as_bytes());
            h.write(&[call.distinct as u8, call.over.is_some() as u8]);
        }
        Expr::Case { .. } => h.code(26),
        Expr::Cast { data_type, .. } => {
            h.code(27);
            h.write(data_type.to_string().as_bytes());
        }
        Expr::Extract { field, .. } => {
            h.code(28);
            h.write(field.as_bytes());
        }
        Expr::InList { negated, .. } => {
            h.code(29);
            h.write(&[*negated as u8]);
        }
        Expr::InSubquery { negated, .. } => {
            h.code(30);
            h.write(&[*negated as u8]);
        }
        Expr::Exists { negated, .. } => {
            h.code(31);
            h.write(&[*negated as u8]);
        }
        Expr::Subquery(_) => h.code(32),
    }
}

fn hash_expr(expr: &Expr, h: &mut Fnv) {
    crate::parser::ast::walk_expr(expr, &mut |e| hash_expr_shallow(e, h));
}

struct Slot {
    plan: Arc<Plan>,
    last_used: u64,
}

/// Count-bounded LRU from fingerprint to plan.
pub struct PlanCache {
    capacity: usize,
    slots: Mutex<HashMap<u64, Slot>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: u64) -> Option<Arc<Plan>> {
        let mut slots = self.slots.lock();
        match slots.get_mut(&key) {
            Some(slot) => {
                slot.last_used = self.clock.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics().incr(names::PLAN_CACHE_HITS);
                Some(Arc::clone(&slot.plan))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics().incr(names::PLAN_CACHE_MISSES);
                None
            }
        }
    }

    pub fn put(&self, key: u64, plan: Arc<Plan>) {
        let mut slots = self.slots.lock();
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        slots.insert(
            key,
            Slot {
                plan,
                last_used: stamp,
            },
        );
        while slots.len() > self.capacity {
            if let Some((&victim, _)) = slots.iter().min_by_key(|(_, s)| s.last_used) {
                slots.remove(&victim);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::planner::{OutputColumn, PlanEst, PlanNode};
    use crate::parser::Parser;

    fn plan() -> Arc<Plan> {
        Arc::new(Plan {
            root: PlanNode::Values {
                columns: vec!["x".to_string()],
                rows: Vec::new(),
                est: PlanEst::default(),
            },
            output: vec![OutputColumn::Star { qualifier: None }],
            distinct: false,
        })
    }

    #[test]
    fn test_fingerprint_stable_across_whitespace_and_case() {
        let a = Parser::parse_one("SELECT a FROM t WHERE a = 1").unwrap();
        let b = Parser::parse_one("select  A from T\nwhere A = 1").unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_distinguishes_literals() {
        let a = Parser::parse_one("SELECT a FROM t WHERE a = 1").unwrap();
        let b = Parser::parse_one("SELECT a FROM t WHERE a = 2").unwrap();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_distinguishes_structure() {
        let a = Parser::parse_one("SELECT a FROM t").unwrap();
        let b = Parser::parse_one("SELECT a FROM t ORDER BY a ASC").unwrap();
        let c = Parser::parse_one("SELECT DISTINCT a FROM t").unwrap();
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_lru_eviction_by_recency() {
        let cache = PlanCache::new(2);
        cache.put(1, plan());
        cache.put(2, plan());
        assert!(cache.get(1).is_some()); // refresh 1
        cache.put(3, plan()); // evicts 2
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_hit_ratio() {
        let cache = PlanCache::new(4);
        cache.put(1, plan());
        cache.get(1);
        cache.get(1);
        cache.get(2);
        let ratio = cache.hit_ratio();
        assert!((ratio - 2.0 / 3.0).abs() < 1e-9);
    }
}
