// Physical plan tree.
//
// Plans are finite DAGs built bottom-up; the root node produces the row
// stream the output stage projects from. Every node carries the
// optimizer's estimates (rows, startup/total cost, width).

use serde::{Deserialize, Serialize};

use crate::parser::ast::{Expr, FunctionCall, JoinType};
use crate::storage::ScanQual;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanEst {
    pub rows: f64,
    pub startup_cost: f64,
    pub total_cost: f64,
    pub width: usize,
}

impl PlanEst {
    pub fn new(rows: f64, startup_cost: f64, total_cost: f64, width: usize) -> Self {
        Self {
            rows: rows.max(0.0),
            startup_cost,
            total_cost,
            width,
        }
    }
}

/// One column of the final projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutputColumn {
    Expr { expr: Expr, name: String },
    /// `*` or `alias.*`; expanded against the root schema at run time.
    Star { qualifier: Option<String> },
}

/// A complete plan: root node plus the output projection evaluated over the
/// root's row stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub root: PlanNode,
    pub output: Vec<OutputColumn>,
    pub distinct: bool,
}

impl Plan {
    pub fn est(&self) -> &PlanEst {
        self.root.est()
    }

    /// Indented cost-annotated tree, for EXPLAIN.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.root.explain_into(&mut out, 0);
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlanNode {
    SeqScan {
        table: String,
        alias: String,
        /// Qualified output column names (`alias.column`).
        columns: Vec<String>,
        /// Residual qualifiers evaluated by the executor.
        quals: Vec<Expr>,
        /// Simple qualifiers pushed down to the adapter.
        pushdown: Vec<ScanQual>,
        est: PlanEst,
    },
    IndexScan {
        table: String,
        alias: String,
        index: String,
        columns: Vec<String>,
        quals: Vec<Expr>,
        pushdown: Vec<ScanQual>,
        est: PlanEst,
    },
    ParallelSeqScan {
        table: String,
        alias: String,
        columns: Vec<String>,
        quals: Vec<Expr>,
        pushdown: Vec<ScanQual>,
        workers: usize,
        est: PlanEst,
    },
    Values {
        columns: Vec<String>,
        rows: Vec<Vec<Expr>>,
        est: PlanEst,
    },
    SubqueryScan {
        /// A complete inner plan; its projected output feeds the outer
        /// query under the alias.
        plan: Box<Plan>,
        alias: String,
        est: PlanEst,
    },
    NestLoop {
        join_type: JoinType,
        outer: Box<PlanNode>,
        inner: Box<PlanNode>,
        quals: Vec<Expr>,
        est: PlanEst,
    },
    HashJoin {
        join_type: JoinType,
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        residual: Vec<Expr>,
        /// Build side choice; the smaller estimated input builds.
        build_right: bool,
        est: PlanEst,
    },
    MergeJoin {
        join_type: JoinType,
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        residual: Vec<Expr>,
        est: PlanEst,
    },
    Sort {
        input: Box<PlanNode>,
        keys: Vec<(Expr, bool)>,
        est: PlanEst,
    },
    Aggregate {
        input: Box<PlanNode>,
        group_by: Vec<Expr>,
        aggregates: Vec<FunctionCall>,
        having: Option<Expr>,
        est: PlanEst,
    },
    Limit {
        input: Box<PlanNode>,
        limit: Option<u64>,
        offset: Option<u64>,
        est: PlanEst,
    },
    Gather {
        input: Box<PlanNode>,
        workers: usize,
        /// Whether upstream order must be preserved.
        ordered: bool,
        est: PlanEst,
    },
    Material {
        input: Box<PlanNode>,
        est: PlanEst,
    },
}

impl PlanNode {
    pub fn est(&self) -> &PlanEst {
        match self {
            PlanNode::SeqScan { est, .. }
            | PlanNode::IndexScan { est, .. }
            | PlanNode::ParallelSeqScan { est, .. }
            | PlanNode::Values { est, .. }
            | PlanNode::SubqueryScan { est, .. }
            | PlanNode::NestLoop { est, .. }
            | PlanNode::HashJoin { est, .. }
            | PlanNode::MergeJoin { est, .. }
            | PlanNode::Sort { est, .. }
            | PlanNode::Aggregate { est, .. }
            | PlanNode::Limit { est, .. }
            | PlanNode::Gather { est, .. }
            | PlanNode::Material { est, .. } => est,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PlanNode::SeqScan { .. } => "SeqScan",
            PlanNode::IndexScan { .. } => "IndexScan",
            PlanNode::ParallelSeqScan { .. } => "ParallelSeqScan",
            PlanNode::Values { .. } => "Values",
            PlanNode::SubqueryScan { .. } => "SubqueryScan",
            PlanNode::NestLoop { .. } => "NestLoop",
            PlanNode::HashJoin { .. } => "HashJoin",
            PlanNode::MergeJoin { .. } => "MergeJoin",
            PlanNode::Sort { .. } => "Sort",
            PlanNode::Aggregate { .. } => "Aggregate",
            PlanNode::Limit { .. } => "Limit",
            PlanNode::Gather { .. } => "Gather",
            PlanNode::Material { .. } => "Material",
        }
    }

    /// Plan-tree depth; the tie-break after cost and cardinality.
    pub fn depth(&self) -> usize {
        1 + self
            .children()
            .iter()
            .map(|c| c.depth())
            .max()
            .unwrap_or(0)
    }

    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::SeqScan { .. }
            | PlanNode::IndexScan { .. }
            | PlanNode::ParallelSeqScan { .. }
            | PlanNode::Values { .. } => Vec::new(),
            PlanNode::SubqueryScan { plan, .. } => vec![&plan.root],
            PlanNode::Sort { input, .. }
            | PlanNode::Aggregate { input, .. }
            | PlanNode::Limit { input, .. }
            | PlanNode::Gather { input, .. }
            | PlanNode::Material { input, .. } => vec![input],
            PlanNode::NestLoop { outer, inner, .. } => vec![outer, inner],
            PlanNode::HashJoin { left, right, .. }
            | PlanNode::MergeJoin { left, right, .. } => vec![left, right],
        }
    }

    fn explain_into(&self, out: &mut String, indent: usize) {
        let est = self.est();
        let pad = "  ".repeat(indent);
        let detail = match self {
            PlanNode::SeqScan { table, alias, .. }
            | PlanNode::IndexScan { table, alias, .. }
            | PlanNode::ParallelSeqScan { table, alias, .. } => {
                if table.eq_ignore_ascii_case(alias) {
                    format!(" on {}", table)
                } else {
                    format!(" on {} {}", table, alias)
                }
            }
            PlanNode::SubqueryScan { alias, .. } => format!(" {}", alias),
            PlanNode::Gather { workers, .. } => format!(" workers={}", workers),
            _ => String::new(),
        };
        out.push_str(&format!(
            "{}{}{}  (cost={:.2}..{:.2} rows={:.0} width={})\n",
            pad,
            self.name(),
            detail,
            est.startup_cost,
            est.total_cost,
            est.rows,
            est.width
        ));
        for child in self.children() {
            child.explain_into(out, indent + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(table: &str, rows: f64) -> PlanNode {
        PlanNode::SeqScan {
            table: table.to_string(),
            alias: table.to_string(),
            columns: Vec::new(),
            quals: Vec::new(),
            pushdown: Vec::new(),
            est: PlanEst::new(rows, 0.0, rows, 8),
        }
    }

    #[test]
    fn test_depth() {
        let join = PlanNode::NestLoop {
            join_type: JoinType::Inner,
            outer: Box::new(scan("a", 10.0)),
            inner: Box::new(scan("b", 10.0)),
            quals: Vec::new(),
            est: PlanEst::default(),
        };
        assert_eq!(join.depth(), 2);
        assert_eq!(scan("a", 1.0).depth(), 1);
    }

    #[test]
    fn test_explain_renders_tree() {
        let plan = Plan {
            root: PlanNode::Sort {
                input: Box::new(scan("t", 100.0)),
                keys: Vec::new(),
                est: PlanEst::new(100.0, 10.0, 20.0, 8),
            },
            output: vec![OutputColumn::Star { qualifier: None }],
            distinct: false,
        };
        let text = plan.explain();
        assert!(text.starts_with("Sort"));
        assert!(text.contains("  SeqScan on t"));
        assert!(text.contains("rows=100"));
    }
}
