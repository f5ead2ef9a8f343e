// Parallel execution.
//
// Workers are plain threads fed by contiguous partitions (scans partition
// the key-ordered row set by worker index; joins and aggregates partition
// by key hash) and hand results back over bounded crossbeam channels into
// the gathering operator. Work never migrates across plans; the pool is
// per node.

use std::collections::HashMap;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver};

use crate::common::{CancelToken, Row, Value};
use crate::error::{DbError, Result};
use crate::execution::aggregate::{accumulate_row, AggKind, Accumulator};
use crate::execution::executor::{ExecContext, ExecNode};
use crate::execution::expressions::Evaluator;
use crate::parser::ast::{Expr, FunctionCall};
use crate::storage::ScanQual;

/// Row-count threshold above which joins and aggregates go parallel.
pub const PARALLEL_THRESHOLD: usize = 8192;

// ============================================================================
// Parallel scan + gather
// ============================================================================

/// Gather over a parallel sequential scan: the table's key-ordered row set
/// is split into per-worker ranges, each worker applies the qualifiers,
/// and batches arrive over a bounded channel in whatever order the workers
/// produce them.
pub struct GatherScanExec {
    table: String,
    columns: Vec<String>,
    quals: Vec<Expr>,
    pushdown: Vec<ScanQual>,
    workers: usize,
    ctx: ExecContext,
    receiver: Option<Receiver<Result<Vec<Row>>>>,
    handles: Vec<JoinHandle<()>>,
}

impl GatherScanExec {
    pub fn new(
        table: String,
        columns: Vec<String>,
        quals: Vec<Expr>,
        pushdown: Vec<ScanQual>,
        workers: usize,
        ctx: ExecContext,
    ) -> Self {
        Self {
            table,
            columns,
            quals,
            pushdown,
            workers: workers.max(1),
            ctx,
            receiver: None,
            handles: Vec::new(),
        }
    }
}

impl ExecNode for GatherScanExec {
    fn schema(&self) -> &[String] {
        &self.columns
    }

    fn open(&mut self) -> Result<()> {
        self.ctx.cancel.check()?;
        let rows = self.ctx.source.scan(&self.table, &self.pushdown)?;
        if self.columns.is_empty() {
            if let Some(first) = rows.first() {
                self.columns = (0..first.values.len()).map(|i| format!("c{}", i)).collect();
            }
        }

        let workers = self.workers.min(rows.len().max(1));
        let chunk_size = rows.len().div_ceil(workers);
        let (tx, rx) = bounded::<Result<Vec<Row>>>(workers * 2);

        let mut remaining = rows;
        for _ in 0..workers {
            let take = chunk_size.min(remaining.len());
            let chunk: Vec<Row> = remaining.drain(..take).collect();
            let tx = tx.clone();
            let quals = self.quals.clone();
            let columns = self.columns.clone();
            let evaluator = self.ctx.evaluator.clone();
            let cancel = self.ctx.cancel.clone();
            let batch_size = self.ctx.batch_size;

            self.handles.push(std::thread::spawn(move || {
                let mut batch = Vec::with_capacity(batch_size);
                for row in chunk {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let keep = quals.iter().try_fold(true, |acc, q| {
                        Ok::<bool, DbError>(
                            acc && evaluator.eval(q, &columns, &row.values)?.is_true(),
                        )
                    });
                    match keep {
                        Ok(true) => {
                            batch.push(row);
                            if batch.len() >= batch_size
                                && tx.send(Ok(std::mem::take(&mut batch))).is_err()
                            {
                                return;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                }
                if !batch.is_empty() {
                    let _ = tx.send(Ok(batch));
                }
            }));
        }
        drop(tx);
        self.receiver = Some(rx);
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        self.ctx.cancel.check()?;
        let Some(rx) = &self.receiver else {
            return Ok(None);
        };
        match rx.recv() {
            Ok(Ok(batch)) => Ok(Some(batch)),
            Ok(Err(e)) => Err(e),
            // All workers finished and dropped their senders.
            Err(_) => Ok(None),
        }
    }

    fn close(&mut self) {
        self.receiver = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Parallel hash join
// ============================================================================

fn key_hash(key: &[Value]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for v in key {
        v.hash(&mut hasher);
    }
    hasher.finish()
}

/// Hash-matched (build, probe) index pairs, computed by `workers` threads
/// that each own one hash partition of both sides. The same hash is used
/// on both sides, so a matching pair always lands in the same partition.
pub fn parallel_join_pairs(
    build_keys: &[Option<Vec<Value>>],
    probe_keys: &[Option<Vec<Value>>],
    workers: usize,
    cancel: &CancelToken,
) -> Result<Vec<(usize, usize)>> {
    let workers = workers.max(1);
    let (tx, rx) = bounded::<Result<Vec<(usize, usize)>>>(workers);

    std::thread::scope(|scope| {
        for w in 0..workers {
            let tx = tx.clone();
            let cancel = cancel.clone();
            scope.spawn(move || {
                if cancel.is_cancelled() {
                    return;
                }
                let mut table: HashMap<&[Value], Vec<usize>> = HashMap::new();
                for (idx, key) in build_keys.iter().enumerate() {
                    if let Some(key) = key {
                        if key_hash(key) % workers as u64 == w as u64 {
                            table.entry(key.as_slice()).or_default().push(idx);
                        }
                    }
                }
                let mut pairs = Vec::new();
                for (pidx, key) in probe_keys.iter().enumerate() {
                    if let Some(key) = key {
                        if key_hash(key) % workers as u64 == w as u64 {
                            if let Some(indices) = table.get(key.as_slice()) {
                                for &bidx in indices {
                                    pairs.push((bidx, pidx));
                                }
                            }
                        }
                    }
                }
                let _ = tx.send(Ok(pairs));
            });
        }
        drop(tx);

        let mut all = Vec::new();
        while let Ok(result) = rx.recv() {
            all.extend(result?);
        }
        cancel.check()?;
        Ok(all)
    })
}

// ============================================================================
// Parallel aggregation
// ============================================================================

/// Partial aggregation across workers: each worker accumulates its row
/// range locally; the reducer merges partials per group key.
#[allow(clippy::type_complexity)]
pub fn parallel_aggregate(
    rows: &[Row],
    schema: &[String],
    group_by: &[Expr],
    aggregates: &[FunctionCall],
    evaluator: &Evaluator,
    workers: usize,
    cancel: &CancelToken,
) -> Result<(Vec<Vec<Value>>, Vec<Vec<Accumulator>>)> {
    let workers = workers.max(1).min(rows.len().max(1));
    let template: Vec<Accumulator> = aggregates
        .iter()
        .map(|call| Ok(Accumulator::new(AggKind::of(call)?, call.distinct)))
        .collect::<Result<_>>()?;

    type Partial = Vec<(Vec<Value>, Vec<Accumulator>)>;
    let chunk_size = rows.len().div_ceil(workers);
    let (tx, rx) = bounded::<Result<Partial>>(workers);

    std::thread::scope(|scope| {
        for chunk in rows.chunks(chunk_size.max(1)) {
            let tx = tx.clone();
            let template = template.clone();
            let cancel = cancel.clone();
            scope.spawn(move || {
                let mut groups: HashMap<Vec<Value>, Vec<Accumulator>> = HashMap::new();
                let mut order: Vec<Vec<Value>> = Vec::new();
                for row in chunk {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let result = (|| -> Result<()> {
                        let key = group_by
                            .iter()
                            .map(|g| evaluator.eval(g, schema, &row.values))
                            .collect::<Result<Vec<_>>>()?;
                        if !groups.contains_key(&key) {
                            order.push(key.clone());
                            groups.insert(key.clone(), template.clone());
                        }
                        let accs = groups.get_mut(&key).expect("group just inserted");
                        accumulate_row(aggregates, accs, evaluator, schema, &row.values)
                    })();
                    if let Err(e) = result {
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
                let partial: Partial = order
                    .into_iter()
                    .map(|key| {
                        let accs = groups.remove(&key).unwrap_or_else(|| template.clone());
                        (key, accs)
                    })
                    .collect();
                let _ = tx.send(Ok(partial));
            });
        }
        drop(tx);

        // Final reducer: merge partials by group key.
        let mut merged: HashMap<Vec<Value>, usize> = HashMap::new();
        let mut keys: Vec<Vec<Value>> = Vec::new();
        let mut states: Vec<Vec<Accumulator>> = Vec::new();
        while let Ok(partial) = rx.recv() {
            for (key, accs) in partial? {
                match merged.get(&key) {
                    Some(&idx) => {
                        for (into, from) in states[idx].iter_mut().zip(accs.iter()) {
                            into.merge(from);
                        }
                    }
                    None => {
                        merged.insert(key.clone(), keys.len());
                        keys.push(key);
                        states.push(accs);
                    }
                }
            }
        }
        cancel.check()?;
        Ok((keys, states))
    })
}
