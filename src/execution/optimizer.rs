// Cost-based planning.
//
// A validated, rewritten SELECT becomes a physical plan: per-relation scan
// selection (seq / index / parallel seq), join ordering by dynamic
// programming over relation subsets up to `geqo_threshold` and greedily
// above it, then aggregation, sort, and limit on top. Ties break by lower
// estimated cardinality, then by shallower plan tree.

use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::error::{DbError, Result};
use crate::execution::cost_model::{CostModel, JoinClauseKind, StatisticsCatalog, TableStats};
use crate::execution::planner::{OutputColumn, Plan, PlanEst, PlanNode};
use crate::parser::ast::*;
use crate::parser::validator::{contains_plain_aggregate, is_aggregate_function};
use crate::storage::{QualOp, ScanQual};

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub enable_hash_join: bool,
    pub enable_merge_join: bool,
    pub enable_index_scan: bool,
    pub enable_parallel_scan: bool,
    pub work_mem: usize,
    pub max_workers: usize,
    /// DP join search bound; more relations fall back to greedy pairing.
    pub geqo_threshold: usize,
    /// Estimated row count above which a parallel scan is considered.
    pub parallel_row_threshold: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            enable_hash_join: true,
            enable_merge_join: true,
            enable_index_scan: true,
            enable_parallel_scan: true,
            work_mem: 64 * 1024 * 1024,
            max_workers: 8,
            geqo_threshold: 12,
            parallel_row_threshold: 10_000.0,
        }
    }
}

pub struct Optimizer {
    catalog: Arc<Catalog>,
    stats: Arc<StatisticsCatalog>,
    cost: CostModel,
    config: PlannerConfig,
}

/// One base relation in the FROM list.
struct Relation {
    alias: String,
    /// Known output columns (bare names); empty when unknown.
    columns: Vec<String>,
    node: PlanNode,
}

/// A join predicate with the relations it touches.
struct JoinPred {
    expr: Expr,
    mask: u64,
    /// Equi-join decomposition: (left expr, left mask, right expr, right mask).
    equi: Option<(Expr, u64, Expr, u64)>,
}

impl Optimizer {
    pub fn new(
        catalog: Arc<Catalog>,
        stats: Arc<StatisticsCatalog>,
        cost: CostModel,
        config: PlannerConfig,
    ) -> Self {
        Self {
            catalog,
            stats,
            cost,
            config,
        }
    }

    pub fn plan_select(&self, stmt: &SelectStmt) -> Result<Plan> {
        // CTE plans become subquery sources wherever the name is referenced.
        let mut cte_plans: HashMap<String, Plan> = HashMap::new();
        for cte in &stmt.with {
            if cte.recursive {
                return Err(DbError::ValidationError(
                    "recursive common table expressions are not supported".to_string(),
                ));
            }
            let mut plan = self.plan_select(&cte.query)?;
            if !cte.columns.is_empty() {
                rename_outputs(&mut plan, &cte.columns);
            }
            cte_plans.insert(cte.name.to_lowercase(), plan);
        }

        let grouped = !stmt.group_by.is_empty()
            || stmt
                .projection
                .iter()
                .any(|item| matches!(item, SelectItem::Expr { expr, .. } if contains_plain_aggregate(expr)))
            || stmt
                .having
                .as_ref()
                .map(|h| contains_plain_aggregate(h))
                .unwrap_or(false);

        // FROM-less SELECT evaluates the projection over one empty row.
        let Some(from) = &stmt.from else {
            let root = PlanNode::Values {
                columns: Vec::new(),
                rows: vec![Vec::new()],
                est: PlanEst::new(1.0, 0.0, self.cost.cpu_tuple_cost, 0),
            };
            return Ok(self.finish_plan(stmt, root, None, grouped));
        };

        let mut relations: Vec<Relation> = Vec::new();
        let mut join_preds_raw: Vec<Expr> = Vec::new();
        let all_inner = self.flatten_from(from, &cte_plans, &mut relations, &mut join_preds_raw)?;

        // Qualify every predicate column with its relation alias so masks
        // are derivable; unresolvable conjuncts become the plan filter.
        let where_conjuncts = stmt
            .selection
            .as_ref()
            .map(|s| conjuncts(s))
            .unwrap_or_default();

        let mut scan_quals: Vec<Vec<Expr>> = vec![Vec::new(); relations.len()];
        let mut multi_preds: Vec<Expr> = Vec::new();
        let mut residual_filter: Vec<Expr> = Vec::new();

        // With outer joins, ON predicates stay attached to their join node
        // (build_join_tree reads them from the AST); only the WHERE clause
        // is classified here.
        let classified: Vec<Expr> = if all_inner {
            where_conjuncts
                .into_iter()
                .chain(join_preds_raw.into_iter())
                .collect()
        } else {
            where_conjuncts
        };
        for conjunct in classified {
            let qualified = self.qualify(&conjunct, &relations);
            match self.relation_mask(&qualified, &relations) {
                Some(mask) if mask.count_ones() == 1 && all_inner => {
                    let idx = mask.trailing_zeros() as usize;
                    scan_quals[idx].push(qualified);
                }
                Some(mask) if mask.count_ones() >= 2 && all_inner => {
                    multi_preds.push(qualified);
                }
                _ if !all_inner => residual_filter.push(qualified),
                _ => residual_filter.push(qualified),
            }
        }

        let root = if all_inner {
            let scans: Vec<PlanNode> = relations
                .iter()
                .enumerate()
                .map(|(i, rel)| self.choose_scan(rel, std::mem::take(&mut scan_quals[i])))
                .collect::<Result<Vec<_>>>()?;
            let preds = self.classify_join_preds(multi_preds, &relations);
            self.order_joins(scans, preds, &mut residual_filter)?
        } else {
            // Outer joins keep the syntactic shape; the WHERE clause stays
            // above the join as the plan filter so padded rows are
            // filtered, not suppressed from padding.
            self.build_join_tree(from, &cte_plans, &relations)?
        };

        let filter = conjoin(residual_filter);
        Ok(self.finish_plan(stmt, root, filter, grouped))
    }

    // ------------------------------------------------------------------
    // FROM flattening
    // ------------------------------------------------------------------

    /// Collect base relations and (for inner joins) their ON predicates.
    /// Returns false when any non-inner join prevents reordering.
    fn flatten_from(
        &self,
        table_ref: &TableRef,
        cte_plans: &HashMap<String, Plan>,
        relations: &mut Vec<Relation>,
        join_preds: &mut Vec<Expr>,
    ) -> Result<bool> {
        match table_ref {
            TableRef::Table { name, alias } => {
                let alias = alias.clone().unwrap_or_else(|| name.clone());
                let relation = match cte_plans.get(&name.to_lowercase()) {
                    Some(plan) => self.subquery_relation(plan.clone(), alias)?,
                    None => self.table_relation(name, alias),
                };
                relations.push(relation);
                Ok(true)
            }
            TableRef::Subquery { query, alias } => {
                let plan = self.plan_select(query)?;
                relations.push(self.subquery_relation(plan, alias.clone())?);
                Ok(true)
            }
            TableRef::Join {
                left,
                right,
                join_type,
                constraint,
            } => {
                let left_start = relations.len();
                let left_inner = self.flatten_from(left, cte_plans, relations, join_preds)?;
                let right_start = relations.len();
                let right_inner = self.flatten_from(right, cte_plans, relations, join_preds)?;

                match constraint {
                    JoinConstraint::On(expr) => join_preds.extend(conjuncts(expr)),
                    JoinConstraint::Using(columns) => {
                        for column in columns {
                            if let Some(pred) = self.equi_pred_for_column(
                                column,
                                &relations[left_start..right_start],
                                &relations[right_start..],
                            ) {
                                join_preds.push(pred);
                            }
                        }
                    }
                    JoinConstraint::Natural => {
                        for column in
                            self.common_columns(&relations[left_start..right_start], &relations[right_start..])
                        {
                            if let Some(pred) = self.equi_pred_for_column(
                                &column,
                                &relations[left_start..right_start],
                                &relations[right_start..],
                            ) {
                                join_preds.push(pred);
                            }
                        }
                    }
                    JoinConstraint::None => {}
                }

                Ok(left_inner
                    && right_inner
                    && matches!(join_type, JoinType::Inner | JoinType::Cross))
            }
        }
    }

    fn table_relation(&self, name: &str, alias: String) -> Relation {
        let columns = self
            .catalog
            .get_table(name)
            .map(|s| s.column_names())
            .unwrap_or_default();
        let stats = self.stats.table(name);
        let est = PlanEst::new(
            stats.row_count,
            0.0,
            self.cost.seq_scan_cost(&stats, 0),
            stats.avg_width,
        );
        let node = PlanNode::SeqScan {
            table: name.to_string(),
            alias: alias.clone(),
            columns: columns.iter().map(|c| format!("{}.{}", alias, c)).collect(),
            quals: Vec::new(),
            pushdown: Vec::new(),
            est,
        };
        Relation {
            alias,
            columns,
            node,
        }
    }

    fn subquery_relation(&self, plan: Plan, alias: String) -> Result<Relation> {
        let columns = output_names(&plan);
        let est = plan.est().clone();
        let node = PlanNode::SubqueryScan {
            plan: Box::new(plan),
            alias: alias.clone(),
            est,
        };
        Ok(Relation {
            alias,
            columns,
            node,
        })
    }

    fn equi_pred_for_column(
        &self,
        column: &str,
        left: &[Relation],
        right: &[Relation],
    ) -> Option<Expr> {
        let owner = |rels: &[Relation]| {
            rels.iter()
                .find(|r| r.columns.iter().any(|c| c.eq_ignore_ascii_case(column)))
                .map(|r| r.alias.clone())
        };
        let (l, r) = (owner(left)?, owner(right)?);
        Some(Expr::Binary {
            left: Box::new(Expr::Column {
                table: Some(l),
                name: column.to_string(),
            }),
            op: BinaryOp::Eq,
            right: Box::new(Expr::Column {
                table: Some(r),
                name: column.to_string(),
            }),
        })
    }

    fn common_columns(&self, left: &[Relation], right: &[Relation]) -> Vec<String> {
        let mut out = Vec::new();
        for rel in left {
            for column in &rel.columns {
                let in_right = right
                    .iter()
                    .any(|r| r.columns.iter().any(|c| c.eq_ignore_ascii_case(column)));
                if in_right && !out.iter().any(|c: &String| c.eq_ignore_ascii_case(column)) {
                    out.push(column.clone());
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Predicate classification
    // ------------------------------------------------------------------

    /// Qualify unqualified columns with the owning relation's alias.
    fn qualify(&self, expr: &Expr, relations: &[Relation]) -> Expr {
        let (out, _) = map_expr_simple(expr.clone(), &mut |e| {
            if let Expr::Column { table: None, name } = &e {
                for rel in relations {
                    if rel.columns.iter().any(|c| c.eq_ignore_ascii_case(name)) {
                        return (
                            Expr::Column {
                                table: Some(rel.alias.clone()),
                                name: name.clone(),
                            },
                            true,
                        );
                    }
                }
            }
            (e, false)
        });
        out
    }

    /// Bitmask of relations referenced by an expression; None when a column
    /// resolves to no known relation (or the expression has a subquery).
    fn relation_mask(&self, expr: &Expr, relations: &[Relation]) -> Option<u64> {
        let mut mask = 0u64;
        let mut unresolved = false;
        walk_expr(expr, &mut |e| match e {
            Expr::Column { table, .. } => match table {
                Some(t) => {
                    match relations
                        .iter()
                        .position(|r| r.alias.eq_ignore_ascii_case(t))
                    {
                        Some(idx) => mask |= 1 << idx,
                        None => unresolved = true,
                    }
                }
                None => unresolved = true,
            },
            Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists { .. } => {
                unresolved = true;
            }
            _ => {}
        });
        if unresolved {
            None
        } else {
            Some(mask)
        }
    }

    fn classify_join_preds(&self, preds: Vec<Expr>, relations: &[Relation]) -> Vec<JoinPred> {
        preds
            .into_iter()
            .filter_map(|expr| {
                let mask = self.relation_mask(&expr, relations)?;
                let equi = match &expr {
                    Expr::Binary {
                        left,
                        op: BinaryOp::Eq,
                        right,
                    } => {
                        let lm = self.relation_mask(left, relations)?;
                        let rm = self.relation_mask(right, relations)?;
                        if lm != 0 && rm != 0 && lm & rm == 0 {
                            Some(((**left).clone(), lm, (**right).clone(), rm))
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                Some(JoinPred { expr, mask, equi })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Scan selection
    // ------------------------------------------------------------------

    /// Enumerate scan methods for one relation and keep the cheapest.
    fn choose_scan(&self, relation: &Relation, quals: Vec<Expr>) -> Result<PlanNode> {
        let PlanNode::SeqScan {
            table,
            alias,
            columns,
            ..
        } = &relation.node
        else {
            // Subquery sources have no alternative access paths, but the
            // single-relation quals still apply on top of them.
            if quals.is_empty() {
                return Ok(relation.node.clone());
            }
            return Ok(self.filter_wrap(relation.node.clone(), conjoin(quals).unwrap()));
        };

        let stats = self.stats.table(table);
        let selectivity = self.cost.quals_selectivity(&stats, &quals);
        let out_rows = (stats.row_count * selectivity).max(1.0);
        let pushdown = extract_pushdown(&quals, alias);

        let mut best: Option<PlanNode> = None;
        let mut consider = |candidate: PlanNode| {
            let better = match &best {
                None => true,
                Some(current) => {
                    let (a, b) = (candidate.est(), current.est());
                    (a.total_cost, a.rows, candidate.depth())
                        < (b.total_cost, b.rows, current.depth())
                }
            };
            if better {
                best = Some(candidate);
            }
        };

        consider(PlanNode::SeqScan {
            table: table.clone(),
            alias: alias.clone(),
            columns: columns.clone(),
            quals: quals.clone(),
            pushdown: pushdown.clone(),
            est: PlanEst::new(
                out_rows,
                0.0,
                self.cost.seq_scan_cost(&stats, quals.len()),
                stats.avg_width,
            ),
        });

        if self.config.enable_index_scan {
            if let Some(schema) = self.catalog.get_table(table) {
                for index in &schema.indexes {
                    let leading = index.columns.first();
                    let sargable = leading.is_some_and(|lead| {
                        pushdown
                            .iter()
                            .any(|q| q.column.eq_ignore_ascii_case(lead))
                    });
                    if sargable {
                        consider(PlanNode::IndexScan {
                            table: table.clone(),
                            alias: alias.clone(),
                            index: index.name.clone(),
                            columns: columns.clone(),
                            quals: quals.clone(),
                            pushdown: pushdown.clone(),
                            est: PlanEst::new(
                                out_rows,
                                0.0,
                                self.cost.index_scan_cost(&stats, selectivity),
                                stats.avg_width,
                            ),
                        });
                    }
                }
            }
        }

        if self.config.enable_parallel_scan && out_rows > self.config.parallel_row_threshold {
            let workers = self.config.max_workers.max(1);
            let cost = self
                .cost
                .parallel_seq_scan_cost(&stats, quals.len(), workers);
            let inner = PlanNode::ParallelSeqScan {
                table: table.clone(),
                alias: alias.clone(),
                columns: columns.clone(),
                quals: quals.clone(),
                pushdown,
                workers,
                est: PlanEst::new(out_rows, 0.0, cost, stats.avg_width),
            };
            consider(PlanNode::Gather {
                est: PlanEst::new(
                    out_rows,
                    self.cost.parallel_setup_cost(),
                    cost,
                    stats.avg_width,
                ),
                input: Box::new(inner),
                workers,
                ordered: false,
            });
        }

        Ok(best.expect("at least the sequential scan is always considered"))
    }

    // ------------------------------------------------------------------
    // Join ordering
    // ------------------------------------------------------------------

    fn order_joins(
        &self,
        scans: Vec<PlanNode>,
        preds: Vec<JoinPred>,
        residual_filter: &mut Vec<Expr>,
    ) -> Result<PlanNode> {
        match scans.len() {
            0 => Ok(PlanNode::Values {
                columns: Vec::new(),
                rows: vec![Vec::new()],
                est: PlanEst::new(1.0, 0.0, 0.0, 0),
            }),
            1 => {
                let mut iter = scans.into_iter();
                Ok(iter.next().unwrap())
            }
            n if n <= self.config.geqo_threshold => self.dp_join(scans, preds),
            _ => self.greedy_join(scans, preds, residual_filter),
        }
    }

    /// Dynamic programming over relation subsets: `dp[S]` is the cheapest
    /// plan joining exactly the relations in S.
    fn dp_join(&self, scans: Vec<PlanNode>, preds: Vec<JoinPred>) -> Result<PlanNode> {
        let n = scans.len();
        let full: u64 = (1 << n) - 1;
        let mut dp: HashMap<u64, PlanNode> = HashMap::new();
        for (i, scan) in scans.into_iter().enumerate() {
            dp.insert(1 << i, scan);
        }

        for subset in 1..=full {
            if subset.count_ones() < 2 || dp.contains_key(&subset) {
                continue;
            }
            let mut best: Option<PlanNode> = None;
            // Enumerate proper bipartitions of the subset.
            let mut s1 = (subset - 1) & subset;
            while s1 > 0 {
                let s2 = subset & !s1;
                if let (Some(left), Some(right)) = (dp.get(&s1), dp.get(&s2)) {
                    for candidate in self.join_candidates(left, right, s1, s2, &preds) {
                        let better = match &best {
                            None => true,
                            Some(current) => {
                                let (a, b) = (candidate.est(), current.est());
                                (a.total_cost, a.rows, candidate.depth())
                                    < (b.total_cost, b.rows, current.depth())
                            }
                        };
                        if better {
                            best = Some(candidate);
                        }
                    }
                }
                s1 = (s1 - 1) & subset;
            }
            if let Some(best) = best {
                dp.insert(subset, best);
            }
        }

        dp.remove(&full)
            .ok_or_else(|| DbError::Internal("join search produced no plan".to_string()))
    }

    /// Greedy fallback above the DP threshold: repeatedly join the pair
    /// with the cheapest resulting subplan.
    fn greedy_join(
        &self,
        scans: Vec<PlanNode>,
        preds: Vec<JoinPred>,
        _residual_filter: &mut [Expr],
    ) -> Result<PlanNode> {
        let mut frontier: Vec<(u64, PlanNode)> = scans
            .into_iter()
            .enumerate()
            .map(|(i, s)| (1u64 << i, s))
            .collect();

        while frontier.len() > 1 {
            let mut best: Option<(usize, usize, PlanNode)> = None;
            for i in 0..frontier.len() {
                for j in 0..frontier.len() {
                    if i == j {
                        continue;
                    }
                    let (mi, left) = &frontier[i];
                    let (mj, right) = &frontier[j];
                    for candidate in self.join_candidates(left, right, *mi, *mj, &preds) {
                        let better = match &best {
                            None => true,
                            Some((_, _, current)) => {
                                let (a, b) = (candidate.est(), current.est());
                                (a.total_cost, a.rows, candidate.depth())
                                    < (b.total_cost, b.rows, current.depth())
                            }
                        };
                        if better {
                            best = Some((i, j, candidate));
                        }
                    }
                }
            }
            let (i, j, joined) =
                best.ok_or_else(|| DbError::Internal("greedy join found no pair".to_string()))?;
            let mask = frontier[i].0 | frontier[j].0;
            let (hi, lo) = if i > j { (i, j) } else { (j, i) };
            frontier.remove(hi);
            frontier.remove(lo);
            frontier.push((mask, joined));
        }
        Ok(frontier.pop().expect("one plan remains").1)
    }

    /// Enumerate physical join operators for one bipartition.
    fn join_candidates(
        &self,
        left: &PlanNode,
        right: &PlanNode,
        left_mask: u64,
        right_mask: u64,
        preds: &[JoinPred],
    ) -> Vec<PlanNode> {
        let combined = left_mask | right_mask;
        let applicable: Vec<&JoinPred> = preds
            .iter()
            .filter(|p| {
                p.mask & combined == p.mask
                    && p.mask & left_mask != 0
                    && p.mask & right_mask != 0
            })
            .collect();

        let mut left_keys = Vec::new();
        let mut right_keys = Vec::new();
        let mut residual = Vec::new();
        let mut clause_kinds = Vec::new();
        for pred in &applicable {
            match &pred.equi {
                Some((l, lm, r, _)) if *lm & left_mask == *lm => {
                    clause_kinds.push(self.equi_clause_kind(l, r));
                    left_keys.push(l.clone());
                    right_keys.push(r.clone());
                }
                Some((l, lm, r, _)) if *lm & right_mask == *lm => {
                    clause_kinds.push(self.equi_clause_kind(r, l));
                    left_keys.push(r.clone());
                    right_keys.push(l.clone());
                }
                _ => {
                    clause_kinds.push(classify_non_equi(&pred.expr));
                    residual.push(pred.expr.clone());
                }
            }
        }

        let selectivity = self.cost.join_selectivity(&clause_kinds);
        let (le, re) = (left.est().clone(), right.est().clone());
        let out_rows = (le.rows * re.rows * selectivity).max(1.0);
        let width = le.width + re.width;
        let all_quals: Vec<Expr> = applicable.iter().map(|p| p.expr.clone()).collect();

        let mut candidates = Vec::new();

        candidates.push(PlanNode::NestLoop {
            join_type: JoinType::Inner,
            outer: Box::new(left.clone()),
            inner: Box::new(right.clone()),
            quals: all_quals,
            est: PlanEst::new(
                out_rows,
                le.startup_cost,
                self.cost
                    .nest_loop_cost(le.total_cost, le.rows, re.total_cost, re.rows),
                width,
            ),
        });

        if !left_keys.is_empty() && self.config.enable_hash_join {
            let build_right = re.rows <= le.rows;
            let (build, probe) = if build_right { (&re, &le) } else { (&le, &re) };
            let cost = self.cost.hash_join_cost(
                build.total_cost,
                build.rows,
                probe.total_cost,
                probe.rows,
                build.width,
                self.config.work_mem,
            );
            candidates.push(PlanNode::HashJoin {
                join_type: JoinType::Inner,
                left: Box::new(left.clone()),
                right: Box::new(right.clone()),
                left_keys: left_keys.clone(),
                right_keys: right_keys.clone(),
                residual: residual.clone(),
                build_right,
                est: PlanEst::new(out_rows, build.total_cost, cost, width),
            });
        }

        if !left_keys.is_empty() && self.config.enable_merge_join {
            let sort_left = self.sorted(left.clone(), &left_keys);
            let sort_right = self.sorted(right.clone(), &right_keys);
            let total = sort_left.est().total_cost
                + sort_right.est().total_cost
                + self.cost.merge_cost(le.rows, re.rows);
            candidates.push(PlanNode::MergeJoin {
                join_type: JoinType::Inner,
                est: PlanEst::new(out_rows, sort_left.est().total_cost, total, width),
                left: Box::new(sort_left),
                right: Box::new(sort_right),
                left_keys: left_keys.clone(),
                right_keys,
                residual,
            });
        }

        candidates
    }

    fn equi_clause_kind(&self, left: &Expr, right: &Expr) -> JoinClauseKind {
        let ndv = |e: &Expr| -> u64 {
            if let Expr::Column { table, name } = e {
                if let Some(alias) = table {
                    // Alias and table name coincide unless renamed; the
                    // default NDV stands in when they do not.
                    let stats = self.stats.table(alias);
                    if let Some(cs) = stats.column(name) {
                        if cs.ndv > 0 {
                            return cs.ndv;
                        }
                    }
                }
            }
            100
        };
        JoinClauseKind::Equality {
            left_ndv: ndv(left),
            right_ndv: ndv(right),
        }
    }

    fn sorted(&self, input: PlanNode, keys: &[Expr]) -> PlanNode {
        let est = input.est().clone();
        PlanNode::Sort {
            est: PlanEst::new(
                est.rows,
                self.cost.sort_cost(est.total_cost, est.rows),
                self.cost.sort_cost(est.total_cost, est.rows),
                est.width,
            ),
            keys: keys.iter().map(|k| (k.clone(), true)).collect(),
            input: Box::new(input),
        }
    }

    /// Build the join tree syntactically (outer joins present).
    fn build_join_tree(
        &self,
        table_ref: &TableRef,
        cte_plans: &HashMap<String, Plan>,
        relations: &[Relation],
    ) -> Result<PlanNode> {
        match table_ref {
            TableRef::Table { name, alias } => {
                let alias = alias.clone().unwrap_or_else(|| name.clone());
                let relation = match cte_plans.get(&name.to_lowercase()) {
                    Some(plan) => self.subquery_relation(plan.clone(), alias)?,
                    None => self.table_relation(name, alias),
                };
                Ok(relation.node)
            }
            TableRef::Subquery { query, alias } => {
                let plan = self.plan_select(query)?;
                Ok(self.subquery_relation(plan, alias.clone())?.node)
            }
            TableRef::Join {
                left,
                right,
                join_type,
                constraint,
            } => {
                let left_node = self.build_join_tree(left, cte_plans, relations)?;
                let right_node = self.build_join_tree(right, cte_plans, relations)?;
                let quals: Vec<Expr> = match constraint {
                    JoinConstraint::On(expr) => conjuncts(expr)
                        .into_iter()
                        .map(|c| self.qualify(&c, relations))
                        .collect(),
                    JoinConstraint::Using(columns) => columns
                        .iter()
                        .filter_map(|c| self.using_pred(c, &left_node, &right_node))
                        .collect(),
                    JoinConstraint::Natural => {
                        let left_cols = node_bare_columns(&left_node);
                        let right_cols = node_bare_columns(&right_node);
                        left_cols
                            .iter()
                            .filter(|c| {
                                right_cols.iter().any(|rc| rc.eq_ignore_ascii_case(c))
                            })
                            .filter_map(|c| self.using_pred(c, &left_node, &right_node))
                            .collect()
                    }
                    JoinConstraint::None => Vec::new(),
                };

                let (le, re) = (left_node.est().clone(), right_node.est().clone());
                let out_rows = match join_type {
                    JoinType::Cross => le.rows * re.rows,
                    _ => (le.rows * re.rows * 0.1).max(le.rows.max(re.rows)),
                };
                // Equi-join outer pairs still use the hash operator.
                let equi = extract_equi_pair(&quals, &left_node, &right_node);
                if let (Some((lk, rk)), true) = (equi, self.config.enable_hash_join) {
                    let residual: Vec<Expr> = quals
                        .iter()
                        .filter(|q| !is_equi_between(q, &left_node, &right_node))
                        .cloned()
                        .collect();
                    let build_right = re.rows <= le.rows;
                    let cost = self.cost.hash_join_cost(
                        re.total_cost,
                        re.rows,
                        le.total_cost,
                        le.rows,
                        re.width,
                        self.config.work_mem,
                    );
                    return Ok(PlanNode::HashJoin {
                        join_type: *join_type,
                        left: Box::new(left_node),
                        right: Box::new(right_node),
                        left_keys: lk,
                        right_keys: rk,
                        residual,
                        build_right,
                        est: PlanEst::new(out_rows, 0.0, cost, le.width + re.width),
                    });
                }

                Ok(PlanNode::NestLoop {
                    join_type: *join_type,
                    est: PlanEst::new(
                        out_rows,
                        le.startup_cost,
                        self.cost
                            .nest_loop_cost(le.total_cost, le.rows, re.total_cost, re.rows),
                        le.width + re.width,
                    ),
                    outer: Box::new(left_node),
                    inner: Box::new(right_node),
                    quals,
                })
            }
        }
    }

    fn using_pred(&self, column: &str, left: &PlanNode, right: &PlanNode) -> Option<Expr> {
        let find = |node: &PlanNode| -> Option<String> {
            node_schema(node).iter().find_map(|c| {
                let (alias, bare) = c.split_once('.')?;
                bare.eq_ignore_ascii_case(column)
                    .then(|| alias.to_string())
            })
        };
        let (l, r) = (find(left)?, find(right)?);
        Some(Expr::Binary {
            left: Box::new(Expr::Column {
                table: Some(l),
                name: column.to_string(),
            }),
            op: BinaryOp::Eq,
            right: Box::new(Expr::Column {
                table: Some(r),
                name: column.to_string(),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Plan top: filter, aggregate, sort, limit, projection
    // ------------------------------------------------------------------

    /// A nested loop against a one-row Values inner is the node-algebra
    /// form of a pure row filter; padded outer-join rows and unresolvable
    /// conjuncts are filtered here, above the join but below aggregation.
    fn filter_wrap(&self, root: PlanNode, filter: Expr) -> PlanNode {
        let est = root.est().clone();
        PlanNode::NestLoop {
            join_type: JoinType::Inner,
            inner: Box::new(PlanNode::Values {
                columns: Vec::new(),
                rows: vec![Vec::new()],
                est: PlanEst::new(1.0, 0.0, 0.0, 0),
            }),
            quals: conjuncts(&filter),
            est: PlanEst::new(
                (est.rows * 0.5).max(1.0),
                est.startup_cost,
                est.total_cost + self.cost.cpu_operator_cost * est.rows,
                est.width,
            ),
            outer: Box::new(root),
        }
    }

    fn finish_plan(
        &self,
        stmt: &SelectStmt,
        mut root: PlanNode,
        filter: Option<Expr>,
        grouped: bool,
    ) -> Plan {
        if let Some(f) = filter {
            root = self.filter_wrap(root, f);
        }
        if grouped {
            let mut aggregates: Vec<FunctionCall> = Vec::new();
            let mut collect = |expr: &Expr| {
                walk_expr(expr, &mut |e| {
                    if let Expr::Function(call) = e {
                        if call.over.is_none()
                            && is_aggregate_function(&call.name)
                            && !aggregates.iter().any(|a| a.to_string() == call.to_string())
                        {
                            aggregates.push(call.clone());
                        }
                    }
                });
            };
            for item in &stmt.projection {
                if let SelectItem::Expr { expr, .. } = item {
                    collect(expr);
                }
            }
            if let Some(having) = &stmt.having {
                collect(having);
            }
            for order in &stmt.order_by {
                collect(&order.expr);
            }

            let input_est = root.est().clone();
            let group_rows = if stmt.group_by.is_empty() {
                1.0
            } else {
                (input_est.rows * 0.1).max(1.0)
            };
            let agg_cost = input_est.total_cost
                + self.cost.cpu_operator_cost
                    * input_est.rows
                    * (stmt.group_by.len() + aggregates.len()).max(1) as f64;
            root = PlanNode::Aggregate {
                input: Box::new(root),
                group_by: stmt.group_by.clone(),
                aggregates,
                having: stmt.having.clone(),
                est: PlanEst::new(group_rows, agg_cost, agg_cost, input_est.width),
            };
        }

        if !stmt.order_by.is_empty() {
            let keys: Vec<(Expr, bool)> = stmt
                .order_by
                .iter()
                .map(|o| (self.substitute_alias(&o.expr, stmt), o.asc))
                .collect();
            let est = root.est().clone();
            let cost = self.cost.sort_cost(est.total_cost, est.rows);
            root = PlanNode::Sort {
                input: Box::new(root),
                keys,
                est: PlanEst::new(est.rows, cost, cost, est.width),
            };
        }

        if stmt.limit.is_some() || stmt.offset.is_some() {
            let est = root.est().clone();
            let rows = stmt
                .limit
                .map(|l| (l as f64).min(est.rows))
                .unwrap_or(est.rows);
            root = PlanNode::Limit {
                input: Box::new(root),
                limit: stmt.limit,
                offset: stmt.offset,
                est: PlanEst::new(rows, est.startup_cost, est.total_cost, est.width),
            };
        }

        let output = stmt
            .projection
            .iter()
            .map(|item| match item {
                SelectItem::Wildcard => OutputColumn::Star { qualifier: None },
                SelectItem::QualifiedWildcard(q) => OutputColumn::Star {
                    qualifier: Some(q.clone()),
                },
                SelectItem::Expr { expr, alias } => OutputColumn::Expr {
                    name: alias.clone().unwrap_or_else(|| match expr {
                        Expr::Column { name, .. } => name.clone(),
                        other => other.to_string(),
                    }),
                    expr: expr.clone(),
                },
            })
            .collect();

        Plan {
            root,
            output,
            distinct: stmt.distinct,
        }
    }

    /// ORDER BY may name a projection alias; substitute the aliased
    /// expression so the sort key resolves against the pre-projection
    /// schema.
    fn substitute_alias(&self, expr: &Expr, stmt: &SelectStmt) -> Expr {
        if let Expr::Column { table: None, name } = expr {
            for item in &stmt.projection {
                if let SelectItem::Expr {
                    expr: aliased,
                    alias: Some(alias),
                } = item
                {
                    if alias.eq_ignore_ascii_case(name) {
                        return aliased.clone();
                    }
                }
            }
        }
        expr.clone()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Bottom-up expression map without change tracking subtleties.
fn map_expr_simple(expr: Expr, f: &mut impl FnMut(Expr) -> (Expr, bool)) -> (Expr, bool) {
    crate::execution::rewrite::map_expr(expr, f)
}

fn extract_pushdown(quals: &[Expr], alias: &str) -> Vec<ScanQual> {
    let mut out = Vec::new();
    for qual in quals {
        if let Expr::Binary { left, op, right } = qual {
            let (column, literal, flip) = match (left.as_ref(), right.as_ref()) {
                (Expr::Column { table, name }, Expr::Literal(v))
                    if table.as_deref().map(|t| t.eq_ignore_ascii_case(alias)) != Some(false) =>
                {
                    (name.clone(), v.clone(), false)
                }
                (Expr::Literal(v), Expr::Column { table, name })
                    if table.as_deref().map(|t| t.eq_ignore_ascii_case(alias)) != Some(false) =>
                {
                    (name.clone(), v.clone(), true)
                }
                _ => continue,
            };
            let op = match (op, flip) {
                (BinaryOp::Eq, _) => QualOp::Eq,
                (BinaryOp::Lt, false) | (BinaryOp::Gt, true) => QualOp::Lt,
                (BinaryOp::LtEq, false) | (BinaryOp::GtEq, true) => QualOp::LtEq,
                (BinaryOp::Gt, false) | (BinaryOp::Lt, true) => QualOp::Gt,
                (BinaryOp::GtEq, false) | (BinaryOp::LtEq, true) => QualOp::GtEq,
                _ => continue,
            };
            out.push(ScanQual {
                column,
                op,
                value: literal,
            });
        }
    }
    out
}

fn classify_non_equi(expr: &Expr) -> JoinClauseKind {
    match expr {
        Expr::Binary { op, .. }
            if matches!(
                op,
                BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
            ) =>
        {
            JoinClauseKind::Range
        }
        _ => JoinClauseKind::Other,
    }
}

/// Output column names of a finished plan.
pub fn output_names(plan: &Plan) -> Vec<String> {
    plan.output
        .iter()
        .flat_map(|item| match item {
            OutputColumn::Expr { name, .. } => vec![name.clone()],
            // Star columns resolve at run time; fall back to the root
            // schema's bare names.
            OutputColumn::Star { qualifier } => node_schema(&plan.root)
                .iter()
                .filter(|c| match qualifier {
                    None => true,
                    Some(q) => c
                        .split('.')
                        .next()
                        .is_some_and(|p| p.eq_ignore_ascii_case(q)),
                })
                .map(|c| c.rsplit('.').next().unwrap_or(c).to_string())
                .collect(),
        })
        .collect()
}

fn rename_outputs(plan: &mut Plan, names: &[String]) {
    let mut idx = 0;
    for item in &mut plan.output {
        if let OutputColumn::Expr { name, .. } = item {
            if let Some(new_name) = names.get(idx) {
                *name = new_name.clone();
            }
            idx += 1;
        }
    }
}

/// Statically known qualified schema of a plan node.
pub fn node_schema(node: &PlanNode) -> Vec<String> {
    match node {
        PlanNode::SeqScan { columns, .. }
        | PlanNode::IndexScan { columns, .. }
        | PlanNode::ParallelSeqScan { columns, .. }
        | PlanNode::Values { columns, .. } => columns.clone(),
        PlanNode::SubqueryScan { plan, alias, .. } => output_names(plan)
            .iter()
            .map(|c| format!("{}.{}", alias, c))
            .collect(),
        PlanNode::NestLoop { outer, inner, .. } => {
            let mut cols = node_schema(outer);
            cols.extend(node_schema(inner));
            cols
        }
        PlanNode::HashJoin { left, right, .. } | PlanNode::MergeJoin { left, right, .. } => {
            let mut cols = node_schema(left);
            cols.extend(node_schema(right));
            cols
        }
        PlanNode::Sort { input, .. }
        | PlanNode::Limit { input, .. }
        | PlanNode::Gather { input, .. }
        | PlanNode::Material { input, .. } => node_schema(input),
        PlanNode::Aggregate {
            group_by,
            aggregates,
            ..
        } => group_by
            .iter()
            .map(|g| g.to_string())
            .chain(aggregates.iter().map(|a| a.to_string()))
            .collect(),
    }
}

fn node_bare_columns(node: &PlanNode) -> Vec<String> {
    node_schema(node)
        .iter()
        .map(|c| c.rsplit('.').next().unwrap_or(c).to_string())
        .collect()
}

fn is_equi_between(expr: &Expr, left: &PlanNode, right: &PlanNode) -> bool {
    let left_schema = node_schema(left);
    let right_schema = node_schema(right);
    let belongs = |e: &Expr, schema: &[String]| -> bool {
        let mut all = true;
        walk_expr(e, &mut |node| {
            if let Expr::Column { table, name } = node {
                let key = match table {
                    Some(t) => format!("{}.{}", t, name),
                    None => name.clone(),
                };
                if crate::execution::expressions::lookup_column(schema, &key).is_none() {
                    all = false;
                }
            }
        });
        all
    };
    matches!(expr, Expr::Binary { left: l, op: BinaryOp::Eq, right: r }
        if (belongs(l, &left_schema) && belongs(r, &right_schema))
            || (belongs(l, &right_schema) && belongs(r, &left_schema)))
}

fn extract_equi_pair(
    quals: &[Expr],
    left: &PlanNode,
    right: &PlanNode,
) -> Option<(Vec<Expr>, Vec<Expr>)> {
    let left_schema = node_schema(left);
    let right_schema = node_schema(right);
    let belongs = |e: &Expr, schema: &[String]| -> bool {
        let mut all = true;
        let mut any = false;
        walk_expr(e, &mut |node| {
            if let Expr::Column { table, name } = node {
                any = true;
                let key = match table {
                    Some(t) => format!("{}.{}", t, name),
                    None => name.clone(),
                };
                if crate::execution::expressions::lookup_column(schema, &key).is_none() {
                    all = false;
                }
            }
        });
        any && all
    };

    let mut left_keys = Vec::new();
    let mut right_keys = Vec::new();
    for qual in quals {
        if let Expr::Binary {
            left: l,
            op: BinaryOp::Eq,
            right: r,
        } = qual
        {
            if belongs(l, &left_schema) && belongs(r, &right_schema) {
                left_keys.push((**l).clone());
                right_keys.push((**r).clone());
            } else if belongs(l, &right_schema) && belongs(r, &left_schema) {
                left_keys.push((**r).clone());
                right_keys.push((**l).clone());
            }
        }
    }
    if left_keys.is_empty() {
        None
    } else {
        Some((left_keys, right_keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, DataType, IndexDef, TableSchema};
    use crate::execution::cost_model::ColumnStats;
    use crate::parser::Parser;
    use crate::storage::StorageType;

    fn setup() -> Optimizer {
        let catalog = Arc::new(Catalog::new());
        let stats = Arc::new(StatisticsCatalog::new());
        for (table, rows) in [("small", 100.0), ("big", 100_000.0), ("mid", 5_000.0)] {
            let mut schema = TableSchema::new(
                table,
                vec![
                    Column::new("id", DataType::Integer).not_null(),
                    Column::new("v", DataType::Text),
                ],
                StorageType::Kv,
            );
            schema.primary_key = vec!["id".to_string()];
            if table == "big" {
                schema.indexes.push(IndexDef {
                    name: "big_id_idx".to_string(),
                    table: "big".to_string(),
                    columns: vec!["id".to_string()],
                    unique: true,
                });
            }
            catalog.create_table(schema).unwrap();

            let mut table_stats = TableStats::new(rows, 24);
            table_stats.set_column(
                "id",
                ColumnStats {
                    ndv: rows as u64,
                    null_frac: 0.0,
                    histogram: None,
                },
            );
            stats.set_table(table, table_stats);
        }
        Optimizer::new(catalog, stats, CostModel::default(), PlannerConfig::default())
    }

    fn plan(opt: &Optimizer, sql: &str) -> Plan {
        let Statement::Select(select) = Parser::parse_one(sql).unwrap() else {
            panic!("expected select");
        };
        opt.plan_select(&select).unwrap()
    }

    #[test]
    fn test_single_table_seq_scan() {
        let opt = setup();
        let p = plan(&opt, "SELECT id FROM small WHERE id = 5");
        assert!(matches!(p.root, PlanNode::SeqScan { .. }));
    }

    #[test]
    fn test_index_scan_chosen_for_selective_predicate() {
        let opt = setup();
        let p = plan(&opt, "SELECT id FROM big WHERE id = 5");
        assert!(
            matches!(p.root, PlanNode::IndexScan { .. }),
            "expected IndexScan, got {}",
            p.explain()
        );
    }

    #[test]
    fn test_parallel_scan_for_big_unfiltered_table() {
        let opt = setup();
        let p = plan(&opt, "SELECT id FROM big");
        assert!(
            matches!(p.root, PlanNode::Gather { .. }),
            "expected Gather over ParallelSeqScan, got {}",
            p.explain()
        );
    }

    #[test]
    fn test_hash_join_builds_smaller_side() {
        let opt = setup();
        let p = plan(
            &opt,
            "SELECT * FROM big JOIN small ON big.id = small.id",
        );
        fn find_hash(node: &PlanNode) -> Option<(&PlanNode, &PlanNode, bool)> {
            match node {
                PlanNode::HashJoin {
                    left,
                    right,
                    build_right,
                    ..
                } => Some((left, right, *build_right)),
                _ => node.children().into_iter().find_map(find_hash),
            }
        }
        let (left, right, build_right) = find_hash(&p.root).expect("hash join in plan");
        let build = if build_right { right } else { left };
        assert!(build.est().rows <= 100.0 + 1.0);
    }

    #[test]
    fn test_join_order_three_tables() {
        let opt = setup();
        let p = plan(
            &opt,
            "SELECT * FROM big b JOIN mid m ON b.id = m.id JOIN small s ON m.id = s.id",
        );
        // All three relations appear exactly once.
        fn scan_count(node: &PlanNode) -> usize {
            let own = matches!(
                node,
                PlanNode::SeqScan { .. }
                    | PlanNode::IndexScan { .. }
                    | PlanNode::ParallelSeqScan { .. }
            ) as usize;
            own + node.children().iter().map(|c| scan_count(c)).sum::<usize>()
        }
        assert_eq!(scan_count(&p.root), 3);
    }

    #[test]
    fn test_outer_join_keeps_shape_and_filter() {
        let opt = setup();
        let p = plan(
            &opt,
            "SELECT * FROM small s LEFT JOIN mid m ON s.id = m.id WHERE s.id > 3",
        );
        // The WHERE clause becomes a filter wrap above the outer join.
        let PlanNode::NestLoop { quals, inner, .. } = &p.root else {
            panic!("expected filter wrap at root, got {}", p.explain());
        };
        assert!(!quals.is_empty());
        assert!(matches!(inner.as_ref(), PlanNode::Values { .. }));
        fn has_outer(node: &PlanNode) -> bool {
            match node {
                PlanNode::HashJoin { join_type, .. } | PlanNode::NestLoop { join_type, .. }
                    if *join_type == JoinType::Left =>
                {
                    true
                }
                _ => node.children().into_iter().any(has_outer),
            }
        }
        assert!(has_outer(&p.root));
    }

    #[test]
    fn test_aggregate_sort_limit_stack() {
        let opt = setup();
        let p = plan(
            &opt,
            "SELECT v, count(*) AS n FROM small GROUP BY v ORDER BY v ASC LIMIT 10",
        );
        let PlanNode::Limit { input, .. } = &p.root else {
            panic!("expected Limit at root");
        };
        let PlanNode::Sort { input, .. } = input.as_ref() else {
            panic!("expected Sort under Limit");
        };
        assert!(matches!(input.as_ref(), PlanNode::Aggregate { .. }));
    }

    #[test]
    fn test_order_by_alias_substitution() {
        let opt = setup();
        let p = plan(&opt, "SELECT id + 1 AS next FROM small ORDER BY next ASC");
        let PlanNode::Sort { keys, .. } = &p.root else {
            panic!("expected Sort at root");
        };
        assert_eq!(keys[0].0.to_string(), "(id + 1)");
    }

    #[test]
    fn test_pushdown_extraction() {
        let quals = vec![Parser::parse_one("SELECT 1 FROM t WHERE t.id <= 5")
            .map(|s| match s {
                Statement::Select(sel) => sel.selection.unwrap(),
                _ => unreachable!(),
            })
            .unwrap()];
        let pd = extract_pushdown(&quals, "t");
        assert_eq!(pd.len(), 1);
        assert_eq!(pd[0].column, "id");
        assert_eq!(pd[0].op, QualOp::LtEq);
    }

    #[test]
    fn test_disable_hash_join_falls_back() {
        let catalog = Arc::new(Catalog::new());
        catalog
            .create_table(TableSchema::new(
                "a",
                vec![Column::new("id", DataType::Integer)],
                StorageType::Kv,
            ))
            .unwrap();
        catalog
            .create_table(TableSchema::new(
                "b",
                vec![Column::new("id", DataType::Integer)],
                StorageType::Kv,
            ))
            .unwrap();
        let config = PlannerConfig {
            enable_hash_join: false,
            enable_merge_join: false,
            ..Default::default()
        };
        let opt = Optimizer::new(
            catalog,
            Arc::new(StatisticsCatalog::new()),
            CostModel::default(),
            config,
        );
        let p = plan(&opt, "SELECT * FROM a JOIN b ON a.id = b.id");
        fn only_nest_loops(node: &PlanNode) -> bool {
            !matches!(node, PlanNode::HashJoin { .. } | PlanNode::MergeJoin { .. })
                && node.children().into_iter().all(only_nest_loops)
        }
        assert!(only_nest_loops(&p.root));
    }

    #[test]
    fn test_recursive_cte_rejected() {
        let opt = setup();
        let Statement::Select(select) = Parser::parse_one(
            "WITH RECURSIVE r (n) AS (SELECT 1) SELECT * FROM r",
        )
        .unwrap() else {
            panic!();
        };
        assert!(opt.plan_select(&select).is_err());
    }

    #[test]
    fn test_cte_becomes_subquery_scan() {
        let opt = setup();
        let p = plan(
            &opt,
            "WITH tiny AS (SELECT id FROM small WHERE id < 5) SELECT * FROM tiny",
        );
        assert!(matches!(p.root, PlanNode::SubqueryScan { .. }));
    }
}
