// Aggregation.
//
// Hash aggregation by group key with one accumulator per aggregate call.
// AVG carries {sum, count}; STDDEV/VARIANCE use Welford's running moments,
// so partial accumulators from parallel workers merge exactly. The window
// pass evaluates windowed calls over per-partition ordered buffers
// respecting the frame.

use std::collections::HashMap;
use std::collections::HashSet;

use crate::common::{Row, Value};
use crate::error::{DbError, Result};
use crate::execution::executor::{ExecContext, ExecNode};
use crate::execution::expressions::Evaluator;
use crate::parser::ast::{Expr, FrameBound, FrameUnits, FunctionCall, WindowSpec};

// ============================================================================
// Accumulators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Count,
    CountStar,
    Sum,
    Avg,
    Min,
    Max,
    StdDev,
    Variance,
}

impl AggKind {
    pub fn of(call: &FunctionCall) -> Result<AggKind> {
        let kind = match call.name.as_str() {
            "count" if matches!(call.args.first(), Some(Expr::Wildcard)) => AggKind::CountStar,
            "count" => AggKind::Count,
            "sum" => AggKind::Sum,
            "avg" => AggKind::Avg,
            "min" => AggKind::Min,
            "max" => AggKind::Max,
            "stddev" => AggKind::StdDev,
            "variance" => AggKind::Variance,
            other => {
                return Err(DbError::Execution(format!(
                    "'{}' is not an aggregate function",
                    other
                )))
            }
        };
        Ok(kind)
    }
}

/// Mergeable accumulator state.
#[derive(Debug, Clone)]
pub struct Accumulator {
    kind: AggKind,
    distinct: bool,
    seen: HashSet<Value>,
    count: u64,
    sum: f64,
    int_sum: i64,
    int_only: bool,
    min: Option<Value>,
    max: Option<Value>,
    /// Welford running moments.
    mean: f64,
    m2: f64,
}

impl Accumulator {
    pub fn new(kind: AggKind, distinct: bool) -> Self {
        Self {
            kind,
            distinct,
            seen: HashSet::new(),
            count: 0,
            sum: 0.0,
            int_sum: 0,
            int_only: true,
            min: None,
            max: None,
            mean: 0.0,
            m2: 0.0,
        }
    }

    pub fn update(&mut self, value: &Value) -> Result<()> {
        if self.kind != AggKind::CountStar && value.is_null() {
            return Ok(());
        }
        if self.distinct && !self.seen.insert(value.clone()) {
            return Ok(());
        }

        match self.kind {
            AggKind::Count | AggKind::CountStar => self.count += 1,
            AggKind::Sum | AggKind::Avg => {
                let f = value
                    .as_f64()
                    .ok_or_else(|| DbError::Execution(format!("cannot sum {}", value)))?;
                if let Value::Integer(i) = value {
                    self.int_sum = self.int_sum.wrapping_add(*i);
                } else {
                    self.int_only = false;
                }
                self.sum += f;
                self.count += 1;
            }
            AggKind::Min => {
                if self.min.as_ref().map(|m| value < m).unwrap_or(true) {
                    self.min = Some(value.clone());
                }
            }
            AggKind::Max => {
                if self.max.as_ref().map(|m| value > m).unwrap_or(true) {
                    self.max = Some(value.clone());
                }
            }
            AggKind::StdDev | AggKind::Variance => {
                let x = value
                    .as_f64()
                    .ok_or_else(|| DbError::Execution(format!("cannot aggregate {}", value)))?;
                self.count += 1;
                let delta = x - self.mean;
                self.mean += delta / self.count as f64;
                self.m2 += delta * (x - self.mean);
            }
        }
        Ok(())
    }

    /// Merge a partial accumulator from another worker. Distinct
    /// aggregates merge their seen-sets and recount.
    pub fn merge(&mut self, other: &Accumulator) {
        if self.distinct {
            for v in &other.seen {
                if self.seen.insert(v.clone()) {
                    self.absorb_raw(v);
                }
            }
            return;
        }
        match self.kind {
            AggKind::Count | AggKind::CountStar => self.count += other.count,
            AggKind::Sum | AggKind::Avg => {
                self.count += other.count;
                self.sum += other.sum;
                self.int_sum = self.int_sum.wrapping_add(other.int_sum);
                self.int_only &= other.int_only;
            }
            AggKind::Min => {
                if let Some(v) = &other.min {
                    if self.min.as_ref().map(|m| v < m).unwrap_or(true) {
                        self.min = Some(v.clone());
                    }
                }
            }
            AggKind::Max => {
                if let Some(v) = &other.max {
                    if self.max.as_ref().map(|m| v > m).unwrap_or(true) {
                        self.max = Some(v.clone());
                    }
                }
            }
            AggKind::StdDev | AggKind::Variance => {
                // Chan et al. parallel moments merge.
                if other.count == 0 {
                    return;
                }
                if self.count == 0 {
                    *self = other.clone();
                    return;
                }
                let n1 = self.count as f64;
                let n2 = other.count as f64;
                let delta = other.mean - self.mean;
                let total = n1 + n2;
                self.mean += delta * n2 / total;
                self.m2 += other.m2 + delta * delta * n1 * n2 / total;
                self.count += other.count;
            }
        }
    }

    fn absorb_raw(&mut self, value: &Value) {
        // Distinct merge path re-applies the value to the base state.
        let distinct = std::mem::replace(&mut self.distinct, false);
        let _ = self.update(value);
        self.distinct = distinct;
    }

    pub fn finish(&self) -> Value {
        match self.kind {
            AggKind::Count | AggKind::CountStar => Value::Integer(self.count as i64),
            AggKind::Sum => {
                if self.count == 0 {
                    Value::Null
                } else if self.int_only {
                    Value::Integer(self.int_sum)
                } else {
                    Value::Float(self.sum)
                }
            }
            AggKind::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    Value::Float(self.sum / self.count as f64)
                }
            }
            AggKind::Min => self.min.clone().unwrap_or(Value::Null),
            AggKind::Max => self.max.clone().unwrap_or(Value::Null),
            AggKind::Variance => {
                if self.count < 2 {
                    Value::Null
                } else {
                    Value::Float(self.m2 / (self.count - 1) as f64)
                }
            }
            AggKind::StdDev => {
                if self.count < 2 {
                    Value::Null
                } else {
                    Value::Float((self.m2 / (self.count - 1) as f64).sqrt())
                }
            }
        }
    }
}

/// Feed one row into a group's accumulators, honouring per-call FILTER
/// clauses. Shared by the serial operator and the parallel partial path.
pub(crate) fn accumulate_row(
    aggregates: &[FunctionCall],
    accumulators: &mut [Accumulator],
    evaluator: &Evaluator,
    schema: &[String],
    values: &[Value],
) -> Result<()> {
    for (acc, call) in accumulators.iter_mut().zip(aggregates.iter()) {
        if let Some(filter) = &call.filter {
            if !evaluator.eval(filter, schema, values)?.is_true() {
                continue;
            }
        }
        let arg_value = match call.args.first() {
            None | Some(Expr::Wildcard) => Value::Integer(1),
            Some(arg) => evaluator.eval(arg, schema, values)?,
        };
        acc.update(&arg_value)?;
    }
    Ok(())
}

// ============================================================================
// Aggregate operator
// ============================================================================

pub struct AggregateExec {
    input: Box<dyn ExecNode>,
    group_by: Vec<Expr>,
    aggregates: Vec<FunctionCall>,
    having: Option<Expr>,
    ctx: ExecContext,
    columns: Vec<String>,
    output: Vec<Row>,
    pos: usize,
}

impl AggregateExec {
    pub fn new(
        input: Box<dyn ExecNode>,
        group_by: Vec<Expr>,
        aggregates: Vec<FunctionCall>,
        having: Option<Expr>,
        ctx: ExecContext,
    ) -> Self {
        let columns = group_by
            .iter()
            .map(|g| g.to_string())
            .chain(aggregates.iter().map(|a| a.to_string()))
            .collect();
        Self {
            input,
            group_by,
            aggregates,
            having,
            ctx,
            columns,
            output: Vec::new(),
            pos: 0,
        }
    }

}

impl ExecNode for AggregateExec {
    fn schema(&self) -> &[String] {
        &self.columns
    }

    fn open(&mut self) -> Result<()> {
        self.input.open()?;
        let input_schema = self.input.schema().to_vec();

        let template: Vec<Accumulator> = self
            .aggregates
            .iter()
            .map(|call| Ok(Accumulator::new(AggKind::of(call)?, call.distinct)))
            .collect::<Result<_>>()?;

        let mut all_rows: Vec<Row> = Vec::new();
        while let Some(batch) = self.input.next_batch()? {
            self.ctx.cancel.check()?;
            all_rows.extend(batch);
        }
        self.input.close();

        let (mut keys, mut states);
        if self.ctx.max_workers > 1
            && all_rows.len() >= crate::execution::parallel::PARALLEL_THRESHOLD
        {
            // Partial aggregation across workers, merged in the reducer.
            let (k, s) = crate::execution::parallel::parallel_aggregate(
                &all_rows,
                &input_schema,
                &self.group_by,
                &self.aggregates,
                &self.ctx.evaluator,
                self.ctx.max_workers,
                &self.ctx.cancel,
            )?;
            keys = k;
            states = s;
        } else {
            // Group hash table; insertion order preserved for stable
            // output.
            let mut groups: HashMap<Vec<Value>, usize> = HashMap::new();
            keys = Vec::new();
            states = Vec::new();
            for row in &all_rows {
                let key = self
                    .group_by
                    .iter()
                    .map(|g| self.ctx.evaluator.eval(g, &input_schema, &row.values))
                    .collect::<Result<Vec<_>>>()?;
                let idx = match groups.get(&key) {
                    Some(&idx) => idx,
                    None => {
                        groups.insert(key.clone(), keys.len());
                        keys.push(key);
                        states.push(template.clone());
                        keys.len() - 1
                    }
                };
                accumulate_row(
                    &self.aggregates,
                    &mut states[idx],
                    &self.ctx.evaluator,
                    &input_schema,
                    &row.values,
                )?;
            }
        }
        drop(all_rows);

        // An ungrouped aggregate query yields exactly one row.
        if keys.is_empty() && self.group_by.is_empty() {
            keys.push(Vec::new());
            states.push(template);
        }

        let mut output = Vec::with_capacity(keys.len());
        for (key, accs) in keys.into_iter().zip(states.into_iter()) {
            let mut values = key;
            values.extend(accs.iter().map(|a| a.finish()));
            if let Some(having) = &self.having {
                if !self
                    .ctx
                    .evaluator
                    .eval(having, &self.columns, &values)?
                    .is_true()
                {
                    continue;
                }
            }
            output.push(Row::new("", "", values));
        }
        self.output = output;
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
        self.output.clear();
    }
}

// ============================================================================
// Window pass
// ============================================================================

/// Evaluate each windowed call over the row set and append its result as a
/// new column named by the call's rendered form.
pub fn apply_windows(
    schema: &mut Vec<String>,
    rows: &mut [Vec<Value>],
    calls: &[FunctionCall],
    ctx: &ExecContext,
) -> Result<()> {
    for call in calls {
        let spec = call
            .over
            .as_ref()
            .ok_or_else(|| DbError::Execution("window call without OVER".to_string()))?;
        let computed = eval_window_call(call, spec, schema, rows, &ctx.evaluator)?;
        schema.push(call.to_string());
        for (row, value) in rows.iter_mut().zip(computed.into_iter()) {
            row.push(value);
        }
    }
    Ok(())
}

fn eval_window_call(
    call: &FunctionCall,
    spec: &WindowSpec,
    schema: &[String],
    rows: &[Vec<Value>],
    evaluator: &Evaluator,
) -> Result<Vec<Value>> {
    // Partition rows, remembering original positions.
    let mut partitions: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        let key = spec
            .partition_by
            .iter()
            .map(|e| evaluator.eval(e, schema, row))
            .collect::<Result<Vec<_>>>()?;
        partitions.entry(key).or_default().push(idx);
    }

    let mut result = vec![Value::Null; rows.len()];
    for indices in partitions.values() {
        let mut ordered = indices.clone();
        if !spec.order_by.is_empty() {
            let mut sort_keys: HashMap<usize, Vec<Value>> = HashMap::new();
            for &idx in indices {
                let key = spec
                    .order_by
                    .iter()
                    .map(|o| evaluator.eval(&o.expr, schema, &rows[idx]))
                    .collect::<Result<Vec<_>>>()?;
                sort_keys.insert(idx, key);
            }
            ordered.sort_by(|a, b| {
                let (ka, kb) = (&sort_keys[a], &sort_keys[b]);
                for (i, o) in spec.order_by.iter().enumerate() {
                    let ord = ka[i].total_cmp(&kb[i]);
                    let ord = if o.asc { ord } else { ord.reverse() };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        match call.name.as_str() {
            "row_number" => {
                for (rank, &idx) in ordered.iter().enumerate() {
                    result[idx] = Value::Integer(rank as i64 + 1);
                }
            }
            "rank" | "dense_rank" => {
                let dense = call.name == "dense_rank";
                let mut prev_key: Option<Vec<Value>> = None;
                let mut rank = 0i64;
                let mut dense_rank = 0i64;
                for (pos, &idx) in ordered.iter().enumerate() {
                    let key = spec
                        .order_by
                        .iter()
                        .map(|o| evaluator.eval(&o.expr, schema, &rows[idx]))
                        .collect::<Result<Vec<_>>>()?;
                    if prev_key.as_ref() != Some(&key) {
                        rank = pos as i64 + 1;
                        dense_rank += 1;
                        prev_key = Some(key);
                    }
                    result[idx] = Value::Integer(if dense { dense_rank } else { rank });
                }
            }
            _ => {
                // Framed aggregate. Default frame: start of partition
                // through the current row.
                let kind = AggKind::of(call)?;
                for (pos, &idx) in ordered.iter().enumerate() {
                    let (lo, hi) = frame_bounds(spec, pos, ordered.len());
                    let mut acc = Accumulator::new(kind, call.distinct);
                    for &frame_idx in &ordered[lo..hi] {
                        let value = match call.args.first() {
                            None | Some(Expr::Wildcard) => Value::Integer(1),
                            Some(arg) => evaluator.eval(arg, schema, &rows[frame_idx])?,
                        };
                        acc.update(&value)?;
                    }
                    result[idx] = acc.finish();
                }
            }
        }
    }
    Ok(result)
}

/// Row-index frame [lo, hi) for the row at `pos` in a partition of `len`.
/// RANGE frames degrade to ROWS semantics over the ordered buffer.
fn frame_bounds(spec: &WindowSpec, pos: usize, len: usize) -> (usize, usize) {
    let frame = match &spec.frame {
        Some(f) => f,
        None => {
            return (0, pos + 1);
        }
    };
    debug_assert!(matches!(frame.units, FrameUnits::Rows | FrameUnits::Range));
    let lo = match frame.start {
        FrameBound::UnboundedPreceding => 0,
        FrameBound::Preceding(n) => pos.saturating_sub(n as usize),
        FrameBound::CurrentRow => pos,
        FrameBound::Following(n) => (pos + n as usize).min(len),
        FrameBound::UnboundedFollowing => len,
    };
    let hi = match frame.end {
        FrameBound::UnboundedPreceding => 0,
        FrameBound::Preceding(n) => pos.saturating_sub(n as usize).saturating_add(1).min(len),
        FrameBound::CurrentRow => (pos + 1).min(len),
        FrameBound::Following(n) => (pos + n as usize + 1).min(len),
        FrameBound::UnboundedFollowing => len,
    };
    (lo.min(hi), hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acc(kind: AggKind) -> Accumulator {
        Accumulator::new(kind, false)
    }

    #[test]
    fn test_count_ignores_nulls_count_star_does_not() {
        let mut count = acc(AggKind::Count);
        let mut star = acc(AggKind::CountStar);
        for v in [Value::Integer(1), Value::Null, Value::Integer(2)] {
            count.update(&v).unwrap();
            star.update(&v).unwrap();
        }
        assert_eq!(count.finish(), Value::Integer(2));
        assert_eq!(star.finish(), Value::Integer(3));
    }

    #[test]
    fn test_sum_stays_integral_until_float() {
        let mut sum = acc(AggKind::Sum);
        sum.update(&Value::Integer(2)).unwrap();
        sum.update(&Value::Integer(3)).unwrap();
        assert_eq!(sum.finish(), Value::Integer(5));
        sum.update(&Value::Float(0.5)).unwrap();
        assert_eq!(sum.finish(), Value::Float(5.5));
    }

    #[test]
    fn test_avg_and_empty_sum_null() {
        let mut avg = acc(AggKind::Avg);
        avg.update(&Value::Integer(2)).unwrap();
        avg.update(&Value::Integer(4)).unwrap();
        assert_eq!(avg.finish(), Value::Float(3.0));
        assert_eq!(acc(AggKind::Sum).finish(), Value::Null);
    }

    #[test]
    fn test_min_max() {
        let mut min = acc(AggKind::Min);
        let mut max = acc(AggKind::Max);
        for v in [Value::Integer(3), Value::Integer(1), Value::Integer(2)] {
            min.update(&v).unwrap();
            max.update(&v).unwrap();
        }
        assert_eq!(min.finish(), Value::Integer(1));
        assert_eq!(max.finish(), Value::Integer(3));
    }

    #[test]
    fn test_variance_welford() {
        let mut var = acc(AggKind::Variance);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            var.update(&Value::Float(v)).unwrap();
        }
        let Value::Float(v) = var.finish() else {
            panic!("expected float");
        };
        assert!((v - 4.571428571428571).abs() < 1e-9);
    }

    #[test]
    fn test_moments_merge_matches_sequential() {
        let data: Vec<f64> = (0..100).map(|i| (i * 7 % 13) as f64).collect();
        let mut whole = acc(AggKind::StdDev);
        for v in &data {
            whole.update(&Value::Float(*v)).unwrap();
        }
        let mut left = acc(AggKind::StdDev);
        let mut right = acc(AggKind::StdDev);
        for v in &data[..37] {
            left.update(&Value::Float(*v)).unwrap();
        }
        for v in &data[37..] {
            right.update(&Value::Float(*v)).unwrap();
        }
        left.merge(&right);
        let (Value::Float(a), Value::Float(b)) = (whole.finish(), left.finish()) else {
            panic!("expected floats");
        };
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn test_distinct_count() {
        let mut c = Accumulator::new(AggKind::Count, true);
        for v in [Value::Integer(1), Value::Integer(1), Value::Integer(2)] {
            c.update(&v).unwrap();
        }
        assert_eq!(c.finish(), Value::Integer(2));
    }

    #[test]
    fn test_frame_bounds_default() {
        let spec = WindowSpec {
            partition_by: vec![],
            order_by: vec![],
            frame: None,
        };
        assert_eq!(frame_bounds(&spec, 0, 5), (0, 1));
        assert_eq!(frame_bounds(&spec, 3, 5), (0, 4));
    }

    #[test]
    fn test_frame_bounds_rows_preceding() {
        use crate::parser::ast::WindowFrame;
        let spec = WindowSpec {
            partition_by: vec![],
            order_by: vec![],
            frame: Some(WindowFrame {
                units: FrameUnits::Rows,
                start: FrameBound::Preceding(1),
                end: FrameBound::CurrentRow,
            }),
        };
        assert_eq!(frame_bounds(&spec, 0, 5), (0, 1));
        assert_eq!(frame_bounds(&spec, 2, 5), (1, 3));
    }
}
