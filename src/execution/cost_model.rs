// Cost model and statistics.
//
// Per-table row/page counts and per-column NDV, null fraction, and optional
// histogram buckets feed the selectivity estimates; the cost constants are
// the usual sequential/random page and per-tuple CPU weights. Statistics
// are read under a shared lock and replaced wholesale.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::parser::ast::{BinaryOp, Expr};

/// Floor applied to every selectivity so estimates never reach zero rows.
pub const MIN_SELECTIVITY: f64 = 1e-4;

/// Default selectivity for predicates the model cannot classify.
pub const DEFAULT_SELECTIVITY: f64 = 0.1;

/// Default selectivity for range predicates in joins.
pub const RANGE_JOIN_SELECTIVITY: f64 = 0.05;

/// Correlation damping for multi-clause join predicates.
pub const CLAUSE_CORRELATION: f64 = 0.8;

#[derive(Debug, Clone, Copy)]
pub struct CostModel {
    pub seq_page_cost: f64,
    pub random_page_cost: f64,
    pub cpu_tuple_cost: f64,
    pub cpu_index_tuple_cost: f64,
    pub cpu_operator_cost: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            seq_page_cost: 1.0,
            random_page_cost: 4.0,
            cpu_tuple_cost: 0.01,
            cpu_index_tuple_cost: 0.005,
            cpu_operator_cost: 0.0025,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistogramBucket {
    pub low: String,
    pub high: String,
    pub fraction: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ColumnStats {
    /// Number of distinct values.
    pub ndv: u64,
    pub null_frac: f64,
    pub histogram: Option<Vec<HistogramBucket>>,
}

#[derive(Debug, Clone)]
pub struct TableStats {
    pub row_count: f64,
    pub page_count: f64,
    pub avg_width: usize,
    pub columns: HashMap<String, ColumnStats>,
}

impl TableStats {
    pub fn new(row_count: f64, avg_width: usize) -> Self {
        // Page estimate assumes 8 KiB pages.
        let bytes = row_count * avg_width.max(1) as f64;
        Self {
            row_count,
            page_count: (bytes / 8192.0).ceil().max(1.0),
            avg_width,
            columns: HashMap::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnStats> {
        self.columns.get(&name.to_lowercase())
    }

    pub fn set_column(&mut self, name: &str, stats: ColumnStats) {
        self.columns.insert(name.to_lowercase(), stats);
    }
}

impl Default for TableStats {
    fn default() -> Self {
        Self::new(1000.0, 32)
    }
}

/// Statistics for every known table, replaced atomically on refresh.
#[derive(Default)]
pub struct StatisticsCatalog {
    tables: RwLock<HashMap<String, TableStats>>,
}

impl StatisticsCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> TableStats {
        self.tables
            .read()
            .get(&name.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_table(&self, name: &str, stats: TableStats) {
        self.tables.write().insert(name.to_lowercase(), stats);
    }

    pub fn remove_table(&self, name: &str) {
        self.tables.write().remove(&name.to_lowercase());
    }

    /// Replace the whole statistics map in one step.
    pub fn replace(&self, fresh: HashMap<String, TableStats>) {
        *self.tables.write() = fresh;
    }
}

impl CostModel {
    // ------------------------------------------------------------------
    // Restriction selectivity
    // ------------------------------------------------------------------

    /// Selectivity of one scan qualifier against a table.
    pub fn qual_selectivity(&self, stats: &TableStats, qual: &Expr) -> f64 {
        let sel = match qual {
            Expr::Binary { left, op, right } => {
                let column = column_name(left).or_else(|| column_name(right));
                match op {
                    BinaryOp::Eq => column
                        .and_then(|c| stats.column(&c))
                        .filter(|c| c.ndv > 0)
                        .map(|c| 1.0 / c.ndv as f64)
                        .unwrap_or(0.01),
                    BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => 1.0 / 3.0,
                    BinaryOp::NotEq => 0.9,
                    BinaryOp::Like | BinaryOp::ILike => 0.1,
                    BinaryOp::And => {
                        self.qual_selectivity(stats, left) * self.qual_selectivity(stats, right)
                    }
                    BinaryOp::Or => {
                        let a = self.qual_selectivity(stats, left);
                        let b = self.qual_selectivity(stats, right);
                        (a + b - a * b).min(1.0)
                    }
                    BinaryOp::Is | BinaryOp::IsNot => column
                        .and_then(|c| stats.column(&c))
                        .map(|c| {
                            if *op == BinaryOp::Is {
                                c.null_frac.max(MIN_SELECTIVITY)
                            } else {
                                1.0 - c.null_frac
                            }
                        })
                        .unwrap_or(DEFAULT_SELECTIVITY),
                    _ => DEFAULT_SELECTIVITY,
                }
            }
            Expr::InList { list, .. } => (list.len() as f64 * 0.01).min(0.5),
            _ => DEFAULT_SELECTIVITY,
        };
        sel.clamp(MIN_SELECTIVITY, 1.0)
    }

    pub fn quals_selectivity(&self, stats: &TableStats, quals: &[Expr]) -> f64 {
        quals
            .iter()
            .map(|q| self.qual_selectivity(stats, q))
            .product::<f64>()
            .clamp(MIN_SELECTIVITY, 1.0)
    }

    // ------------------------------------------------------------------
    // Join selectivity
    // ------------------------------------------------------------------

    /// Selectivity of a set of join clauses between two inputs. Equality
    /// takes `1/max(ndv)`, ranges a fixed default, everything else the
    /// unknown default; multiple clauses multiply with a correlation
    /// factor.
    pub fn join_selectivity(
        &self,
        clauses: &[JoinClauseKind],
    ) -> f64 {
        if clauses.is_empty() {
            return 1.0;
        }
        let product: f64 = clauses
            .iter()
            .map(|clause| match clause {
                JoinClauseKind::Equality { left_ndv, right_ndv } => {
                    let ndv = left_ndv.max(right_ndv).max(&1);
                    1.0 / *ndv as f64
                }
                JoinClauseKind::Range => RANGE_JOIN_SELECTIVITY,
                JoinClauseKind::Other => DEFAULT_SELECTIVITY,
            })
            .product();
        let correlation = CLAUSE_CORRELATION.powi(clauses.len() as i32 - 1);
        (product * correlation).clamp(MIN_SELECTIVITY, 1.0)
    }

    // ------------------------------------------------------------------
    // Operator costs
    // ------------------------------------------------------------------

    pub fn seq_scan_cost(&self, stats: &TableStats, qual_count: usize) -> f64 {
        self.seq_page_cost * stats.page_count
            + self.cpu_tuple_cost * stats.row_count
            + self.cpu_operator_cost * stats.row_count * qual_count as f64
    }

    pub fn index_scan_cost(&self, stats: &TableStats, selectivity: f64) -> f64 {
        let index_pages = (stats.page_count / 10.0).ceil().max(1.0);
        let tuples_per_page = (stats.row_count / stats.page_count).max(1.0);
        self.random_page_cost * index_pages
            + self.cpu_index_tuple_cost * stats.row_count
            + self.random_page_cost * (stats.row_count * selectivity) / tuples_per_page
            + self.cpu_tuple_cost * stats.row_count * selectivity
    }

    pub fn parallel_seq_scan_cost(
        &self,
        stats: &TableStats,
        qual_count: usize,
        workers: usize,
    ) -> f64 {
        let base = self.seq_scan_cost(stats, qual_count);
        base / workers.max(1) as f64 + self.parallel_setup_cost()
    }

    pub fn parallel_setup_cost(&self) -> f64 {
        1000.0 * self.cpu_operator_cost
    }

    pub fn nest_loop_cost(
        &self,
        outer_total: f64,
        outer_rows: f64,
        inner_total: f64,
        inner_rows: f64,
    ) -> f64 {
        outer_total
            + outer_rows * inner_total
            + self.cpu_operator_cost * outer_rows * inner_rows
    }

    pub fn hash_join_cost(
        &self,
        build_total: f64,
        build_rows: f64,
        probe_total: f64,
        probe_rows: f64,
        build_width: usize,
        work_mem: usize,
    ) -> f64 {
        let hash_bytes = build_rows * build_width.max(1) as f64;
        let spill = if hash_bytes <= work_mem as f64 {
            0.0
        } else {
            (hash_bytes / work_mem.max(1) as f64)
                * self.seq_page_cost
                * (build_rows + probe_rows)
        };
        build_total
            + self.cpu_operator_cost * build_rows
            + probe_total
            + self.cpu_operator_cost * probe_rows
            + spill
    }

    pub fn merge_cost(&self, left_rows: f64, right_rows: f64) -> f64 {
        self.cpu_operator_cost * (left_rows + right_rows)
    }

    pub fn sort_cost(&self, input_total: f64, rows: f64) -> f64 {
        let n = rows.max(2.0);
        input_total + self.cpu_operator_cost * n * n.log2()
    }
}

/// Classified join clause, as the selectivity model sees it.
#[derive(Debug, Clone)]
pub enum JoinClauseKind {
    Equality { left_ndv: u64, right_ndv: u64 },
    Range,
    Other,
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Column { name, .. } => Some(name.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;

    fn eq(col: &str, v: i64) -> Expr {
        Expr::Binary {
            left: Box::new(Expr::Column {
                table: None,
                name: col.to_string(),
            }),
            op: BinaryOp::Eq,
            right: Box::new(Expr::Literal(Value::Integer(v))),
        }
    }

    #[test]
    fn test_equality_selectivity_uses_ndv() {
        let model = CostModel::default();
        let mut stats = TableStats::new(10_000.0, 16);
        stats.set_column(
            "k",
            ColumnStats {
                ndv: 200,
                null_frac: 0.0,
                histogram: None,
            },
        );
        let sel = model.qual_selectivity(&stats, &eq("k", 5));
        assert!((sel - 0.005).abs() < 1e-9);
    }

    #[test]
    fn test_selectivity_floor() {
        let model = CostModel::default();
        let mut stats = TableStats::new(10.0, 16);
        stats.set_column(
            "k",
            ColumnStats {
                ndv: 1_000_000_000,
                null_frac: 0.0,
                histogram: None,
            },
        );
        let sel = model.qual_selectivity(&stats, &eq("k", 1));
        assert!(sel >= MIN_SELECTIVITY);
    }

    #[test]
    fn test_join_selectivity_equality() {
        let model = CostModel::default();
        let sel = model.join_selectivity(&[JoinClauseKind::Equality {
            left_ndv: 100,
            right_ndv: 40,
        }]);
        assert!((sel - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_join_selectivity_correlation_factor() {
        let model = CostModel::default();
        let clauses = vec![
            JoinClauseKind::Equality {
                left_ndv: 10,
                right_ndv: 10,
            },
            JoinClauseKind::Equality {
                left_ndv: 10,
                right_ndv: 10,
            },
        ];
        let sel = model.join_selectivity(&clauses);
        assert!((sel - 0.1 * 0.1 * 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_hash_join_spill_cost_kicks_in() {
        let model = CostModel::default();
        let fits = model.hash_join_cost(10.0, 100.0, 10.0, 100.0, 16, 1 << 20);
        let spills = model.hash_join_cost(10.0, 100.0, 10.0, 100.0, 16, 64);
        assert!(spills > fits);
    }

    #[test]
    fn test_parallel_scan_cheaper_for_big_tables() {
        let model = CostModel::default();
        let stats = TableStats::new(1_000_000.0, 32);
        let serial = model.seq_scan_cost(&stats, 1);
        let parallel = model.parallel_seq_scan_cost(&stats, 1, 8);
        assert!(parallel < serial);
    }

    #[test]
    fn test_statistics_catalog_replace() {
        let catalog = StatisticsCatalog::new();
        catalog.set_table("t", TableStats::new(5.0, 8));
        assert_eq!(catalog.table("T").row_count, 5.0);
        catalog.replace(HashMap::new());
        // Missing tables fall back to defaults.
        assert_eq!(catalog.table("t").row_count, 1000.0);
    }
}
