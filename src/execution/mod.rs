// Query planning and execution.
//
// | Module | Responsibility |
// |--------|----------------|
// | [`planner`] | Physical plan tree and per-node estimates |
// | [`cost_model`] | Statistics, cost constants, selectivity |
// | [`optimizer`] | Scan selection and join ordering (DP / greedy) |
// | [`rewrite`] | Fixed-point statement rewrites |
// | [`plan_cache`] | Fingerprint → plan LRU |
// | [`expressions`] | Row-context expression evaluation |
// | [`executor`] | Volcano-style open/next_batch/close operators |
// | [`hash_join`] | In-memory and spilling hash join |
// | [`aggregate`] | Hash aggregation, accumulators, window pass |
// | [`parallel`] | Worker partitioning and gather channels |

pub mod aggregate;
pub mod cost_model;
pub mod executor;
pub mod expressions;
pub mod hash_join;
pub mod optimizer;
pub mod parallel;
pub mod plan_cache;
pub mod planner;
pub mod rewrite;

pub use cost_model::{ColumnStats, CostModel, StatisticsCatalog, TableStats};
pub use executor::{ExecContext, ExecNode, Executor, TableSource};
pub use expressions::{Evaluator, SubqueryRunner};
pub use optimizer::{Optimizer, PlannerConfig};
pub use plan_cache::{fingerprint, PlanCache};
pub use planner::{OutputColumn, Plan, PlanEst, PlanNode};
pub use rewrite::rewrite_statement;

use serde::{Deserialize, Serialize};

use crate::common::Value;

/// Default rows per executor batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Result of one statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: usize,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: 0,
        }
    }

    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: 0,
        }
    }

    pub fn affected(rows_affected: usize) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected,
        }
    }
}
