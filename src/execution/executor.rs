// Plan execution.
//
// Operators follow the volcano discipline: `open` prepares (blocking
// operators materialise their children there), `next_batch` yields up to
// `batch_size` rows, `close` releases children. Every batch boundary checks
// the cancellation token, and a cancelled executor closes its children
// before returning.

use std::collections::HashSet;
use std::sync::Arc;

use crate::common::{CancelToken, Row, Value};
use crate::error::{DbError, Result};
use crate::execution::aggregate::{self, AggregateExec};
use crate::execution::expressions::Evaluator;
use crate::execution::hash_join::HashJoinExec;
use crate::execution::parallel::GatherScanExec;
use crate::execution::planner::{OutputColumn, Plan, PlanNode};
use crate::execution::QueryResult;
use crate::parser::ast::{walk_expr, Expr, FunctionCall, JoinType};
use crate::storage::ScanQual;

/// Row provider the executor scans through. The engine's implementation
/// routes to the right adapter, overlays the transaction's pending writes,
/// and takes read locks per the isolation discipline.
pub trait TableSource: Send + Sync {
    fn scan(&self, table: &str, pushdown: &[ScanQual]) -> Result<Vec<Row>>;
}

#[derive(Clone)]
pub struct ExecContext {
    pub source: Arc<dyn TableSource>,
    pub evaluator: Evaluator,
    pub cancel: CancelToken,
    pub batch_size: usize,
    pub work_mem: usize,
    pub max_workers: usize,
}

impl ExecContext {
    /// Evaluate a predicate against one row; NULL is not true.
    pub fn qual_true(&self, quals: &[Expr], columns: &[String], values: &[Value]) -> Result<bool> {
        for qual in quals {
            if !self.evaluator.eval(qual, columns, values)?.is_true() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub trait ExecNode: Send {
    fn schema(&self) -> &[String];
    fn open(&mut self) -> Result<()>;
    fn next_batch(&mut self) -> Result<Option<Vec<Row>>>;
    fn close(&mut self);
}

/// Drain a node into a vector, closing it afterwards.
pub fn drain(node: &mut dyn ExecNode) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    let result = loop {
        match node.next_batch() {
            Ok(Some(batch)) => rows.extend(batch),
            Ok(None) => break Ok(rows),
            Err(e) => break Err(e),
        }
    };
    node.close();
    result
}

pub fn combine_rows(left: &Row, right: &Row) -> Row {
    let mut values = left.values.clone();
    values.extend(right.values.iter().cloned());
    Row {
        values,
        row_id: left.row_id,
        key: String::new(),
        source_table: String::new(),
        version: left.version.max(right.version),
    }
}

pub fn null_row(width: usize) -> Row {
    Row {
        values: vec![Value::Null; width],
        row_id: 0,
        key: String::new(),
        source_table: String::new(),
        version: 0,
    }
}

// ============================================================================
// Scans
// ============================================================================

/// Sequential scan over one table. Index scans execute identically against
/// the reference adapters; the plan-level distinction is a costing choice,
/// and the sargable predicate travels in `pushdown` either way.
pub struct SeqScanExec {
    table: String,
    columns: Vec<String>,
    quals: Vec<Expr>,
    pushdown: Vec<ScanQual>,
    ctx: ExecContext,
    buffer: Vec<Row>,
    pos: usize,
    opened: bool,
}

impl SeqScanExec {
    pub fn new(
        table: String,
        columns: Vec<String>,
        quals: Vec<Expr>,
        pushdown: Vec<ScanQual>,
        ctx: ExecContext,
    ) -> Self {
        Self {
            table,
            columns,
            quals,
            pushdown,
            ctx,
            buffer: Vec::new(),
            pos: 0,
            opened: false,
        }
    }
}

impl ExecNode for SeqScanExec {
    fn schema(&self) -> &[String] {
        &self.columns
    }

    fn open(&mut self) -> Result<()> {
        self.ctx.cancel.check()?;
        let rows = self.ctx.source.scan(&self.table, &self.pushdown)?;
        // Column count can exceed the catalog schema for unknown tables;
        // synthesise positional names so expressions still resolve.
        if self.columns.is_empty() {
            if let Some(first) = rows.first() {
                self.columns = (0..first.values.len()).map(|i| format!("c{}", i)).collect();
            }
        }
        self.buffer = rows;
        self.opened = true;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        self.ctx.cancel.check()?;
        let mut batch = Vec::with_capacity(self.ctx.batch_size);
        while self.pos < self.buffer.len() && batch.len() < self.ctx.batch_size {
            let row = &self.buffer[self.pos];
            self.pos += 1;
            if self
                .ctx
                .qual_true(&self.quals, &self.columns, &row.values)?
            {
                batch.push(row.clone());
            }
        }
        if batch.is_empty() && self.pos >= self.buffer.len() {
            return Ok(None);
        }
        Ok(Some(batch))
    }

    fn close(&mut self) {
        self.buffer.clear();
    }
}

// ============================================================================
// Values / SubqueryScan
// ============================================================================

pub struct ValuesExec {
    columns: Vec<String>,
    rows: Vec<Vec<Expr>>,
    ctx: ExecContext,
    pos: usize,
}

impl ExecNode for ValuesExec {
    fn schema(&self) -> &[String] {
        &self.columns
    }

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        self.ctx.cancel.check()?;
        if self.pos >= self.rows.len() {
            return Ok(None);
        }
        let mut batch = Vec::new();
        while self.pos < self.rows.len() && batch.len() < self.ctx.batch_size {
            let exprs = &self.rows[self.pos];
            self.pos += 1;
            let values = exprs
                .iter()
                .map(|e| self.ctx.evaluator.eval(e, &[], &[]))
                .collect::<Result<Vec<_>>>()?;
            batch.push(Row::new("", "", values));
        }
        Ok(Some(batch))
    }

    fn close(&mut self) {}
}

/// Runs a complete inner plan (projection included) and exposes its output
/// under the alias.
pub struct SubqueryScanExec {
    plan: Plan,
    columns: Vec<String>,
    alias: String,
    ctx: ExecContext,
    rows: Vec<Row>,
    pos: usize,
}

impl SubqueryScanExec {
    pub fn new(plan: Plan, alias: String, ctx: ExecContext) -> Self {
        Self {
            plan,
            columns: Vec::new(),
            alias,
            ctx,
            rows: Vec::new(),
            pos: 0,
        }
    }
}

impl ExecNode for SubqueryScanExec {
    fn schema(&self) -> &[String] {
        &self.columns
    }

    fn open(&mut self) -> Result<()> {
        let result = Executor::new(self.ctx.clone()).execute(&self.plan)?;
        self.columns = result
            .columns
            .iter()
            .map(|c| format!("{}.{}", self.alias, c))
            .collect();
        self.rows = result
            .rows
            .into_iter()
            .map(|values| Row::new("", "", values))
            .collect();
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        self.ctx.cancel.check()?;
        if self.pos >= self.rows.len() {
            return Ok(None);
        }
        let end = (self.pos + self.ctx.batch_size).min(self.rows.len());
        let batch = self.rows[self.pos..end].to_vec();
        self.pos = end;
        Ok(Some(batch))
    }

    fn close(&mut self) {
        self.rows.clear();
    }
}

// ============================================================================
// Nested-loop join
// ============================================================================

pub struct NestLoopExec {
    join_type: JoinType,
    outer: Box<dyn ExecNode>,
    inner: Box<dyn ExecNode>,
    quals: Vec<Expr>,
    ctx: ExecContext,
    columns: Vec<String>,
    inner_rows: Vec<Row>,
    inner_matched: Vec<bool>,
    outer_batch: Vec<Row>,
    outer_pos: usize,
    emitting_inner_tail: bool,
    tail_pos: usize,
    done: bool,
}

impl NestLoopExec {
    pub fn new(
        join_type: JoinType,
        outer: Box<dyn ExecNode>,
        inner: Box<dyn ExecNode>,
        quals: Vec<Expr>,
        ctx: ExecContext,
    ) -> Self {
        Self {
            join_type,
            outer,
            inner,
            quals,
            ctx,
            columns: Vec::new(),
            inner_rows: Vec::new(),
            inner_matched: Vec::new(),
            outer_batch: Vec::new(),
            outer_pos: 0,
            emitting_inner_tail: false,
            tail_pos: 0,
            done: false,
        }
    }

    fn outer_width(&self) -> usize {
        self.columns.len() - self.inner.schema().len()
    }
}

impl ExecNode for NestLoopExec {
    fn schema(&self) -> &[String] {
        &self.columns
    }

    fn open(&mut self) -> Result<()> {
        self.outer.open()?;
        self.inner.open()?;
        self.columns = self
            .outer
            .schema()
            .iter()
            .chain(self.inner.schema().iter())
            .cloned()
            .collect();
        self.inner_rows = drain_keep_open(self.inner.as_mut())?;
        self.inner_matched = vec![false; self.inner_rows.len()];
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        self.ctx.cancel.check()?;
        let mut batch = Vec::new();

        while batch.len() < self.ctx.batch_size {
            if self.emitting_inner_tail {
                // Right/full outer tail: inner rows that never matched.
                while self.tail_pos < self.inner_rows.len() && batch.len() < self.ctx.batch_size {
                    let idx = self.tail_pos;
                    self.tail_pos += 1;
                    if !self.inner_matched[idx] {
                        batch.push(combine_rows(
                            &null_row(self.outer_width()),
                            &self.inner_rows[idx],
                        ));
                    }
                }
                if self.tail_pos >= self.inner_rows.len() {
                    self.done = true;
                }
                break;
            }

            if self.outer_pos >= self.outer_batch.len() {
                match self.outer.next_batch()? {
                    Some(rows) => {
                        self.outer_batch = rows;
                        self.outer_pos = 0;
                        continue;
                    }
                    None => {
                        if matches!(self.join_type, JoinType::Right | JoinType::Full) {
                            self.emitting_inner_tail = true;
                            continue;
                        }
                        self.done = true;
                        break;
                    }
                }
            }

            let outer_row = self.outer_batch[self.outer_pos].clone();
            self.outer_pos += 1;

            let mut matched = false;
            for (idx, inner_row) in self.inner_rows.iter().enumerate() {
                let candidate = combine_rows(&outer_row, inner_row);
                let passes = self.join_type == JoinType::Cross
                    || self
                        .ctx
                        .qual_true(&self.quals, &self.columns, &candidate.values)?;
                if passes {
                    matched = true;
                    self.inner_matched[idx] = true;
                    batch.push(candidate);
                }
            }
            if !matched && matches!(self.join_type, JoinType::Left | JoinType::Full) {
                batch.push(combine_rows(
                    &outer_row,
                    &null_row(self.inner.schema().len()),
                ));
            }
        }

        if batch.is_empty() && self.done {
            return Ok(None);
        }
        Ok(Some(batch))
    }

    fn close(&mut self) {
        self.outer.close();
        self.inner.close();
        self.inner_rows.clear();
    }
}

/// Drain a node without closing it (the parent will).
fn drain_keep_open(node: &mut dyn ExecNode) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    while let Some(batch) = node.next_batch()? {
        rows.extend(batch);
    }
    Ok(rows)
}

// ============================================================================
// Merge join
// ============================================================================

/// Inner merge join over inputs the optimizer has already sorted on the
/// join keys.
pub struct MergeJoinExec {
    left: Box<dyn ExecNode>,
    right: Box<dyn ExecNode>,
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    residual: Vec<Expr>,
    ctx: ExecContext,
    columns: Vec<String>,
    output: Vec<Row>,
    pos: usize,
}

impl MergeJoinExec {
    pub fn new(
        left: Box<dyn ExecNode>,
        right: Box<dyn ExecNode>,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        residual: Vec<Expr>,
        ctx: ExecContext,
    ) -> Self {
        Self {
            left,
            right,
            left_keys,
            right_keys,
            residual,
            ctx,
            columns: Vec::new(),
            output: Vec::new(),
            pos: 0,
        }
    }

    fn key_of(&self, keys: &[Expr], columns: &[String], row: &Row) -> Result<Vec<Value>> {
        keys.iter()
            .map(|k| self.ctx.evaluator.eval(k, columns, &row.values))
            .collect()
    }
}

impl ExecNode for MergeJoinExec {
    fn schema(&self) -> &[String] {
        &self.columns
    }

    fn open(&mut self) -> Result<()> {
        self.left.open()?;
        self.right.open()?;
        self.columns = self
            .left
            .schema()
            .iter()
            .chain(self.right.schema().iter())
            .cloned()
            .collect();

        let left_schema = self.left.schema().to_vec();
        let right_schema = self.right.schema().to_vec();
        let left_rows = drain_keep_open(self.left.as_mut())?;
        let right_rows = drain_keep_open(self.right.as_mut())?;

        let mut li = 0;
        let mut ri = 0;
        while li < left_rows.len() && ri < right_rows.len() {
            self.ctx.cancel.check()?;
            let lk = self.key_of(&self.left_keys, &left_schema, &left_rows[li])?;
            let rk = self.key_of(&self.right_keys, &right_schema, &right_rows[ri])?;
            // NULL keys never join.
            if lk.iter().any(|v| v.is_null()) {
                li += 1;
                continue;
            }
            if rk.iter().any(|v| v.is_null()) {
                ri += 1;
                continue;
            }
            match compare_keys(&lk, &rk) {
                std::cmp::Ordering::Less => li += 1,
                std::cmp::Ordering::Greater => ri += 1,
                std::cmp::Ordering::Equal => {
                    // Cartesian product of the two equal-key groups.
                    let mut lj = li;
                    while lj < left_rows.len()
                        && compare_keys(
                            &self.key_of(&self.left_keys, &left_schema, &left_rows[lj])?,
                            &rk,
                        ) == std::cmp::Ordering::Equal
                    {
                        lj += 1;
                    }
                    let mut rj = ri;
                    while rj < right_rows.len()
                        && compare_keys(
                            &self.key_of(&self.right_keys, &right_schema, &right_rows[rj])?,
                            &lk,
                        ) == std::cmp::Ordering::Equal
                    {
                        rj += 1;
                    }
                    for l in &left_rows[li..lj] {
                        for r in &right_rows[ri..rj] {
                            let candidate = combine_rows(l, r);
                            if self.ctx.qual_true(
                                &self.residual,
                                &self.columns,
                                &candidate.values,
                            )? {
                                self.output.push(candidate);
                            }
                        }
                    }
                    li = lj;
                    ri = rj;
                }
            }
        }
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        self.ctx.cancel.check()?;
        if self.pos >= self.output.len() {
            return Ok(None);
        }
        let end = (self.pos + self.ctx.batch_size).min(self.output.len());
        let batch = self.output[self.pos..end].to_vec();
        self.pos = end;
        Ok(Some(batch))
    }

    fn close(&mut self) {
        self.left.close();
        self.right.close();
        self.output.clear();
    }
}

fn compare_keys(a: &[Value], b: &[Value]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.total_cmp(y);
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

// ============================================================================
// Sort / Limit / Material
// ============================================================================

pub struct SortExec {
    input: Box<dyn ExecNode>,
    keys: Vec<(Expr, bool)>,
    ctx: ExecContext,
    columns: Vec<String>,
    sorted: Vec<Row>,
    pos: usize,
}

impl SortExec {
    pub fn new(input: Box<dyn ExecNode>, keys: Vec<(Expr, bool)>, ctx: ExecContext) -> Self {
        Self {
            input,
            keys,
            ctx,
            columns: Vec::new(),
            sorted: Vec::new(),
            pos: 0,
        }
    }
}

impl ExecNode for SortExec {
    fn schema(&self) -> &[String] {
        &self.columns
    }

    fn open(&mut self) -> Result<()> {
        self.input.open()?;
        self.columns = self.input.schema().to_vec();
        let rows = drain_keep_open(self.input.as_mut())?;

        let mut keyed: Vec<(Vec<Value>, Row)> = Vec::with_capacity(rows.len());
        for row in rows {
            self.ctx.cancel.check()?;
            let key = self
                .keys
                .iter()
                .map(|(e, _)| self.ctx.evaluator.eval(e, &self.columns, &row.values))
                .collect::<Result<Vec<_>>>()?;
            keyed.push((key, row));
        }
        let directions: Vec<bool> = self.keys.iter().map(|(_, asc)| *asc).collect();
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, asc) in directions.iter().enumerate() {
                let ord = a[i].total_cmp(&b[i]);
                let ord = if *asc { ord } else { ord.reverse() };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        self.sorted = keyed.into_iter().map(|(_, row)| row).collect();
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        self.ctx.cancel.check()?;
        if self.pos >= self.sorted.len() {
            return Ok(None);
        }
        let end = (self.pos + self.ctx.batch_size).min(self.sorted.len());
        let batch = self.sorted[self.pos..end].to_vec();
        self.pos = end;
        Ok(Some(batch))
    }

    fn close(&mut self) {
        self.input.close();
        self.sorted.clear();
    }
}

pub struct LimitExec {
    input: Box<dyn ExecNode>,
    remaining_offset: u64,
    remaining: Option<u64>,
}

impl LimitExec {
    pub fn new(input: Box<dyn ExecNode>, limit: Option<u64>, offset: Option<u64>) -> Self {
        Self {
            input,
            remaining_offset: offset.unwrap_or(0),
            remaining: limit,
        }
    }
}

impl ExecNode for LimitExec {
    fn schema(&self) -> &[String] {
        self.input.schema()
    }

    fn open(&mut self) -> Result<()> {
        self.input.open()
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        while let Some(mut batch) = self.input.next_batch()? {
            if self.remaining_offset > 0 {
                let skip = (self.remaining_offset as usize).min(batch.len());
                batch.drain(..skip);
                self.remaining_offset -= skip as u64;
            }
            if batch.is_empty() {
                continue;
            }
            if let Some(remaining) = self.remaining.as_mut() {
                if (batch.len() as u64) > *remaining {
                    batch.truncate(*remaining as usize);
                }
                *remaining -= batch.len() as u64;
            }
            return Ok(Some(batch));
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.input.close();
    }
}

pub struct MaterialExec {
    input: Box<dyn ExecNode>,
}

impl MaterialExec {
    pub fn new(input: Box<dyn ExecNode>) -> Self {
        Self { input }
    }
}

impl ExecNode for MaterialExec {
    fn schema(&self) -> &[String] {
        self.input.schema()
    }
    fn open(&mut self) -> Result<()> {
        self.input.open()
    }
    fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        self.input.next_batch()
    }
    fn close(&mut self) {
        self.input.close();
    }
}

// ============================================================================
// Builder and top-level execution
// ============================================================================

pub struct Executor {
    ctx: ExecContext,
}

impl Executor {
    pub fn new(ctx: ExecContext) -> Self {
        Self { ctx }
    }

    pub fn build(&self, node: &PlanNode) -> Result<Box<dyn ExecNode>> {
        let ctx = self.ctx.clone();
        let built: Box<dyn ExecNode> = match node {
            PlanNode::SeqScan {
                table,
                columns,
                quals,
                pushdown,
                ..
            }
            | PlanNode::IndexScan {
                table,
                columns,
                quals,
                pushdown,
                ..
            } => Box::new(SeqScanExec::new(
                table.clone(),
                columns.clone(),
                quals.clone(),
                pushdown.clone(),
                ctx,
            )),
            PlanNode::ParallelSeqScan {
                table,
                columns,
                quals,
                pushdown,
                workers,
                ..
            } => Box::new(GatherScanExec::new(
                table.clone(),
                columns.clone(),
                quals.clone(),
                pushdown.clone(),
                *workers,
                ctx,
            )),
            PlanNode::Gather { input, .. } => match input.as_ref() {
                PlanNode::ParallelSeqScan {
                    table,
                    columns,
                    quals,
                    pushdown,
                    workers,
                    ..
                } => Box::new(GatherScanExec::new(
                    table.clone(),
                    columns.clone(),
                    quals.clone(),
                    pushdown.clone(),
                    *workers,
                    ctx,
                )),
                other => self.build(other)?,
            },
            PlanNode::Values { columns, rows, .. } => Box::new(ValuesExec {
                columns: columns.clone(),
                rows: rows.clone(),
                ctx,
                pos: 0,
            }),
            PlanNode::SubqueryScan { plan, alias, .. } => Box::new(SubqueryScanExec::new(
                (**plan).clone(),
                alias.clone(),
                ctx,
            )),
            PlanNode::NestLoop {
                join_type,
                outer,
                inner,
                quals,
                ..
            } => Box::new(NestLoopExec::new(
                *join_type,
                self.build(outer)?,
                self.build(inner)?,
                quals.clone(),
                ctx,
            )),
            PlanNode::HashJoin {
                join_type,
                left,
                right,
                left_keys,
                right_keys,
                residual,
                build_right,
                ..
            } => Box::new(HashJoinExec::new(
                *join_type,
                self.build(left)?,
                self.build(right)?,
                left_keys.clone(),
                right_keys.clone(),
                residual.clone(),
                *build_right,
                ctx,
            )),
            PlanNode::MergeJoin {
                left,
                right,
                left_keys,
                right_keys,
                residual,
                ..
            } => Box::new(MergeJoinExec::new(
                self.build(left)?,
                self.build(right)?,
                left_keys.clone(),
                right_keys.clone(),
                residual.clone(),
                ctx,
            )),
            PlanNode::Sort { input, keys, .. } => {
                Box::new(SortExec::new(self.build(input)?, keys.clone(), ctx))
            }
            PlanNode::Aggregate {
                input,
                group_by,
                aggregates,
                having,
                ..
            } => Box::new(AggregateExec::new(
                self.build(input)?,
                group_by.clone(),
                aggregates.clone(),
                having.clone(),
                ctx,
            )),
            PlanNode::Limit {
                input,
                limit,
                offset,
                ..
            } => Box::new(LimitExec::new(self.build(input)?, *limit, *offset)),
            PlanNode::Material { input, .. } => Box::new(MaterialExec::new(self.build(input)?)),
        };
        Ok(built)
    }

    /// Run a full plan: root row stream, window pass, projection, DISTINCT.
    pub fn execute(&self, plan: &Plan) -> Result<QueryResult> {
        let mut node = self.build(&plan.root)?;
        node.open()?;
        let mut schema = node.schema().to_vec();
        let rows = drain(node.as_mut())?;
        let base_width = schema.len();
        let mut rows: Vec<Vec<Value>> = rows.into_iter().map(|r| r.values).collect();

        // Window pass: each distinct windowed call becomes an appended
        // column named by its rendered form.
        let window_calls = collect_window_calls(&plan.output);
        if !window_calls.is_empty() {
            aggregate::apply_windows(&mut schema, &mut rows, &window_calls, &self.ctx)?;
        }

        // Projection.
        let mut out_columns: Vec<String> = Vec::new();
        let mut out_exprs: Vec<Option<Expr>> = Vec::new(); // None = passthrough index
        let mut passthrough: Vec<usize> = Vec::new();
        for item in &plan.output {
            match item {
                OutputColumn::Star { qualifier } => {
                    for (idx, column) in schema.iter().enumerate().take(base_width) {
                        let keep = match qualifier {
                            None => true,
                            Some(q) => column
                                .split('.')
                                .next()
                                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(q)),
                        };
                        if keep {
                            out_columns
                                .push(column.rsplit('.').next().unwrap_or(column).to_string());
                            out_exprs.push(None);
                            passthrough.push(idx);
                        }
                    }
                }
                OutputColumn::Expr { expr, name } => {
                    out_columns.push(name.clone());
                    out_exprs.push(Some(expr.clone()));
                    passthrough.push(usize::MAX);
                }
            }
        }

        let mut out_rows: Vec<Vec<Value>> = Vec::with_capacity(rows.len());
        for (i, values) in rows.iter().enumerate() {
            if i % self.ctx.batch_size == 0 {
                self.ctx.cancel.check()?;
            }
            let mut out = Vec::with_capacity(out_exprs.len());
            for (j, expr) in out_exprs.iter().enumerate() {
                match expr {
                    None => out.push(values[passthrough[j]].clone()),
                    Some(expr) => out.push(self.ctx.evaluator.eval(expr, &schema, values)?),
                }
            }
            out_rows.push(out);
        }

        if plan.distinct {
            let mut seen = HashSet::new();
            out_rows.retain(|row| seen.insert(row.clone()));
        }

        Ok(QueryResult::new(out_columns, out_rows))
    }
}

/// Distinct windowed calls reachable from the output columns.
fn collect_window_calls(output: &[OutputColumn]) -> Vec<FunctionCall> {
    let mut calls: Vec<FunctionCall> = Vec::new();
    for item in output {
        if let OutputColumn::Expr { expr, .. } = item {
            walk_expr(expr, &mut |e| {
                if let Expr::Function(call) = e {
                    if call.over.is_some()
                        && !calls.iter().any(|c| c.to_string() == call.to_string())
                    {
                        calls.push(call.clone());
                    }
                }
            });
        }
    }
    calls
}
