// Hash join.
//
// Builds an in-memory table from the designated build side and streams the
// other side through it. When the build side exceeds the work-memory
// budget, both inputs are partitioned to temporary spill files with a
// stable hash and each partition pair is joined separately; a row lands in
// the same partition on both sides, so partition-local joins compose to
// the full result.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use crate::common::{Row, Value};
use crate::error::{DbError, Result};
use crate::execution::executor::{combine_rows, drain, null_row, ExecContext, ExecNode};
use crate::parser::ast::{Expr, JoinType};

const SPILL_PARTITIONS: usize = 8;

/// Stable partition hash: must agree for equal keys regardless of which
/// side they came from.
fn partition_of(key: &[Value], partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    for v in key {
        v.hash(&mut hasher);
    }
    (hasher.finish() % partitions as u64) as usize
}

pub struct HashJoinExec {
    join_type: JoinType,
    left: Box<dyn ExecNode>,
    right: Box<dyn ExecNode>,
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    residual: Vec<Expr>,
    build_right: bool,
    ctx: ExecContext,
    columns: Vec<String>,
    output: Vec<Row>,
    pos: usize,
}

impl HashJoinExec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        join_type: JoinType,
        left: Box<dyn ExecNode>,
        right: Box<dyn ExecNode>,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        residual: Vec<Expr>,
        build_right: bool,
        ctx: ExecContext,
    ) -> Self {
        Self {
            join_type,
            left,
            right,
            left_keys,
            right_keys,
            residual,
            build_right,
            ctx,
            columns: Vec::new(),
            output: Vec::new(),
            pos: 0,
        }
    }

    fn eval_key(&self, keys: &[Expr], columns: &[String], row: &Row) -> Result<Option<Vec<Value>>> {
        let mut key = Vec::with_capacity(keys.len());
        for expr in keys {
            let v = self.ctx.evaluator.eval(expr, columns, &row.values)?;
            if v.is_null() {
                // NULL join keys never match.
                return Ok(None);
            }
            key.push(v);
        }
        Ok(Some(key))
    }

    /// Join one build/probe pair fully in memory, appending to `output`.
    #[allow(clippy::too_many_arguments)]
    fn join_partition(
        &self,
        build_rows: &[Row],
        probe_rows: &[Row],
        build_schema: &[String],
        probe_schema: &[String],
        build_keys: &[Expr],
        probe_keys: &[Expr],
        probe_is_left: bool,
        output: &mut Vec<Row>,
        unmatched_build: &mut Vec<Row>,
    ) -> Result<()> {
        let mut table: HashMap<Vec<Value>, Vec<usize>> = HashMap::with_capacity(build_rows.len());
        for (idx, row) in build_rows.iter().enumerate() {
            if let Some(key) = self.eval_key(build_keys, build_schema, row)? {
                table.entry(key).or_default().push(idx);
            }
        }
        let mut matched = vec![false; build_rows.len()];

        for probe_row in probe_rows {
            self.ctx.cancel.check()?;
            let key = self.eval_key(probe_keys, probe_schema, probe_row)?;
            let mut probe_matched = false;
            if let Some(key) = key {
                if let Some(indices) = table.get(&key) {
                    for &idx in indices {
                        let candidate = if probe_is_left {
                            combine_rows(probe_row, &build_rows[idx])
                        } else {
                            combine_rows(&build_rows[idx], probe_row)
                        };
                        if self.ctx.qual_true(
                            &self.residual,
                            &self.columns,
                            &candidate.values,
                        )? {
                            probe_matched = true;
                            matched[idx] = true;
                            output.push(candidate);
                        }
                    }
                }
            }

            // Probe-side outer padding.
            let probe_outer = match (self.join_type, probe_is_left) {
                (JoinType::Left, true) | (JoinType::Right, false) | (JoinType::Full, _) => true,
                _ => false,
            };
            if !probe_matched && probe_outer {
                let candidate = if probe_is_left {
                    combine_rows(probe_row, &null_row(build_schema.len()))
                } else {
                    combine_rows(&null_row(build_schema.len()), probe_row)
                };
                output.push(candidate);
            }
        }

        // Build-side outer padding happens after all probes of the
        // partition are done.
        let build_outer = match (self.join_type, probe_is_left) {
            (JoinType::Right, true) | (JoinType::Left, false) | (JoinType::Full, _) => true,
            _ => false,
        };
        if build_outer {
            for (idx, row) in build_rows.iter().enumerate() {
                if !matched[idx] {
                    unmatched_build.push(row.clone());
                }
            }
        }
        Ok(())
    }

    /// Partitioned parallel match: workers share nothing but the hash, and
    /// the residual, padding, and ordering duties stay here.
    #[allow(clippy::too_many_arguments)]
    fn join_parallel(
        &self,
        build_rows: &[Row],
        probe_rows: &[Row],
        build_schema: &[String],
        probe_schema: &[String],
        build_keys: &[Expr],
        probe_keys: &[Expr],
        probe_is_left: bool,
        output: &mut Vec<Row>,
        unmatched_build: &mut Vec<Row>,
    ) -> Result<()> {
        let build_key_values = build_rows
            .iter()
            .map(|r| self.eval_key(build_keys, build_schema, r))
            .collect::<Result<Vec<_>>>()?;
        let probe_key_values = probe_rows
            .iter()
            .map(|r| self.eval_key(probe_keys, probe_schema, r))
            .collect::<Result<Vec<_>>>()?;

        let pairs = crate::execution::parallel::parallel_join_pairs(
            &build_key_values,
            &probe_key_values,
            self.ctx.max_workers,
            &self.ctx.cancel,
        )?;

        let mut build_matched = vec![false; build_rows.len()];
        let mut probe_matched = vec![false; probe_rows.len()];
        for (bidx, pidx) in pairs {
            let candidate = if probe_is_left {
                combine_rows(&probe_rows[pidx], &build_rows[bidx])
            } else {
                combine_rows(&build_rows[bidx], &probe_rows[pidx])
            };
            if self
                .ctx
                .qual_true(&self.residual, &self.columns, &candidate.values)?
            {
                build_matched[bidx] = true;
                probe_matched[pidx] = true;
                output.push(candidate);
            }
        }

        let probe_outer = matches!(
            (self.join_type, probe_is_left),
            (JoinType::Left, true) | (JoinType::Right, false) | (JoinType::Full, _)
        );
        if probe_outer {
            for (idx, row) in probe_rows.iter().enumerate() {
                if !probe_matched[idx] {
                    let candidate = if probe_is_left {
                        combine_rows(row, &null_row(build_schema.len()))
                    } else {
                        combine_rows(&null_row(build_schema.len()), row)
                    };
                    output.push(candidate);
                }
            }
        }
        let build_outer = matches!(
            (self.join_type, probe_is_left),
            (JoinType::Right, true) | (JoinType::Left, false) | (JoinType::Full, _)
        );
        if build_outer {
            for (idx, row) in build_rows.iter().enumerate() {
                if !build_matched[idx] {
                    unmatched_build.push(row.clone());
                }
            }
        }
        Ok(())
    }

    fn estimated_bytes(rows: &[Row]) -> usize {
        rows.iter()
            .take(32)
            .map(|r| bincode::serialized_size(r).unwrap_or(64) as usize)
            .sum::<usize>()
            / rows.len().clamp(1, 32)
            * rows.len()
    }
}

impl ExecNode for HashJoinExec {
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
        let left_rows = drain(self.left.as_mut())?;
        let right_rows = drain(self.right.as_mut())?;

        let (build_rows, probe_rows, build_schema, probe_schema, build_keys, probe_keys, probe_is_left) =
            if self.build_right {
                (
                    right_rows,
                    left_rows,
                    right_schema,
                    left_schema,
                    self.right_keys.clone(),
                    self.left_keys.clone(),
                    true,
                )
            } else {
                (
                    left_rows,
                    right_rows,
                    left_schema,
                    right_schema,
                    self.left_keys.clone(),
                    self.right_keys.clone(),
                    false,
                )
            };

        let mut output = Vec::new();
        let mut unmatched_build = Vec::new();

        if Self::estimated_bytes(&build_rows) <= self.ctx.work_mem {
            let parallel = self.ctx.max_workers > 1
                && build_rows.len() + probe_rows.len()
                    >= crate::execution::parallel::PARALLEL_THRESHOLD;
            if parallel {
                self.join_parallel(
                    &build_rows,
                    &probe_rows,
                    &build_schema,
                    &probe_schema,
                    &build_keys,
                    &probe_keys,
                    probe_is_left,
                    &mut output,
                    &mut unmatched_build,
                )?;
            } else {
                self.join_partition(
                    &build_rows,
                    &probe_rows,
                    &build_schema,
                    &probe_schema,
                    &build_keys,
                    &probe_keys,
                    probe_is_left,
                    &mut output,
                    &mut unmatched_build,
                )?;
            }
        } else {
            // Grace path: spill both sides into partition files, join each
            // partition pair independently.
            let mut build_spill = SpillSet::create(SPILL_PARTITIONS)?;
            let mut probe_spill = SpillSet::create(SPILL_PARTITIONS)?;
            let build_outer = matches!(
                (self.join_type, probe_is_left),
                (JoinType::Right, true) | (JoinType::Left, false) | (JoinType::Full, _)
            );
            for row in &build_rows {
                match self.eval_key(&build_keys, &build_schema, row)? {
                    Some(key) => build_spill.write(partition_of(&key, SPILL_PARTITIONS), row)?,
                    // NULL-keyed build rows can never match; they only
                    // matter as outer padding.
                    None => {
                        if build_outer {
                            unmatched_build.push(row.clone());
                        }
                    }
                }
            }
            drop(build_rows);
            for row in &probe_rows {
                match self.eval_key(&probe_keys, &probe_schema, row)? {
                    Some(key) => probe_spill.write(partition_of(&key, SPILL_PARTITIONS), row)?,
                    None => {
                        // NULL-keyed probe rows still pad in outer joins.
                        let probe_outer = matches!(
                            (self.join_type, probe_is_left),
                            (JoinType::Left, true)
                                | (JoinType::Right, false)
                                | (JoinType::Full, _)
                        );
                        if probe_outer {
                            let candidate = if probe_is_left {
                                combine_rows(row, &null_row(build_schema.len()))
                            } else {
                                combine_rows(&null_row(build_schema.len()), row)
                            };
                            output.push(candidate);
                        }
                    }
                }
            }
            drop(probe_rows);

            for partition in 0..SPILL_PARTITIONS {
                self.ctx.cancel.check()?;
                let build_part = build_spill.read(partition)?;
                let probe_part = probe_spill.read(partition)?;
                self.join_partition(
                    &build_part,
                    &probe_part,
                    &build_schema,
                    &probe_schema,
                    &build_keys,
                    &probe_keys,
                    probe_is_left,
                    &mut output,
                    &mut unmatched_build,
                )?;
            }
        }

        for row in unmatched_build {
            let candidate = if probe_is_left {
                combine_rows(&null_row(probe_schema.len()), &row)
            } else {
                combine_rows(&row, &null_row(probe_schema.len()))
            };
            output.push(candidate);
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

/// Length-prefixed rows in anonymous temp files, one per partition.
struct SpillSet {
    files: Vec<File>,
}

impl SpillSet {
    fn create(partitions: usize) -> Result<Self> {
        let mut files = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            files.push(tempfile::tempfile()?);
        }
        Ok(Self { files })
    }

    fn write(&mut self, partition: usize, row: &Row) -> Result<()> {
        let raw = bincode::serialize(row)?;
        let mut writer = BufWriter::new(&mut self.files[partition]);
        writer.write_all(&(raw.len() as u32).to_le_bytes())?;
        writer.write_all(&raw)?;
        writer
            .flush()
            .map_err(|e| DbError::Execution(format!("spill write failed: {}", e)))?;
        Ok(())
    }

    fn read(&mut self, partition: usize) -> Result<Vec<Row>> {
        let file = &mut self.files[partition];
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);
        let mut rows = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut raw = vec![0u8; len];
            reader.read_exact(&mut raw)?;
            rows.push(bincode::deserialize(&raw)?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CancelToken;
    use crate::execution::executor::TableSource;
    use crate::execution::expressions::Evaluator;
    use crate::execution::planner::{OutputColumn, Plan, PlanNode};
    use crate::execution::Executor;
    use crate::parser::ast::BinaryOp;
    use crate::storage::ScanQual;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Fixture {
        tables: HashMap<String, Vec<Row>>,
    }

    impl TableSource for Fixture {
        fn scan(&self, table: &str, _: &[ScanQual]) -> Result<Vec<Row>> {
            Ok(self.tables.get(table).cloned().unwrap_or_default())
        }
    }

    fn join_fixture() -> HashMap<String, Vec<Row>> {
        let mut tables = HashMap::new();
        tables.insert(
            "l".to_string(),
            vec![
                Row::new("l", "1", vec![Value::Integer(1), Value::Text("a".into())]),
                Row::new("l", "2", vec![Value::Integer(2), Value::Text("b".into())]),
                Row::new("l", "3", vec![Value::Integer(3), Value::Text("c".into())]),
            ],
        );
        tables.insert(
            "r".to_string(),
            vec![
                Row::new("r", "1", vec![Value::Integer(1), Value::Text("x".into())]),
                Row::new("r", "2", vec![Value::Integer(1), Value::Text("y".into())]),
                Row::new("r", "3", vec![Value::Integer(3), Value::Text("z".into())]),
            ],
        );
        tables
    }

    fn ctx(tables: HashMap<String, Vec<Row>>, work_mem: usize) -> ExecContext {
        ExecContext {
            source: Arc::new(Fixture { tables }),
            evaluator: Evaluator::new(),
            cancel: CancelToken::new(),
            batch_size: 16,
            work_mem,
            max_workers: 2,
        }
    }

    fn col(table: &str, name: &str) -> Expr {
        Expr::Column {
            table: Some(table.to_string()),
            name: name.to_string(),
        }
    }

    fn scan(table: &str, cols: &[&str]) -> PlanNode {
        PlanNode::SeqScan {
            table: table.to_string(),
            alias: table.to_string(),
            columns: cols.iter().map(|c| format!("{}.{}", table, c)).collect(),
            quals: Vec::new(),
            pushdown: Vec::new(),
            est: Default::default(),
        }
    }

    fn hash_join_plan(build_right: bool) -> Plan {
        Plan {
            root: PlanNode::HashJoin {
                join_type: JoinType::Inner,
                left: Box::new(scan("l", &["id", "lv"])),
                right: Box::new(scan("r", &["id", "rv"])),
                left_keys: vec![col("l", "id")],
                right_keys: vec![col("r", "id")],
                residual: Vec::new(),
                build_right,
                est: Default::default(),
            },
            output: vec![OutputColumn::Star { qualifier: None }],
            distinct: false,
        }
    }

    fn multiset(result: &crate::execution::QueryResult) -> Vec<String> {
        let mut rows: Vec<String> = result
            .rows
            .iter()
            .map(|r| {
                r.iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("|")
            })
            .collect();
        rows.sort();
        rows
    }

    #[test]
    fn test_hash_join_correct_multiset_either_build_side() {
        let a = Executor::new(ctx(join_fixture(), 64 * 1024 * 1024))
            .execute(&hash_join_plan(true))
            .unwrap();
        let b = Executor::new(ctx(join_fixture(), 64 * 1024 * 1024))
            .execute(&hash_join_plan(false))
            .unwrap();
        assert_eq!(a.rows.len(), 3);
        assert_eq!(multiset(&a), multiset(&b));
        // (1,a,x), (1,a,y), (3,c,z)
        assert!(multiset(&a).iter().any(|r| r.contains("'a'|1|'x'")));
    }

    #[test]
    fn test_hash_join_spills_with_tiny_work_mem() {
        // Forcing the grace path must not change the result.
        let spilled = Executor::new(ctx(join_fixture(), 1))
            .execute(&hash_join_plan(true))
            .unwrap();
        let in_memory = Executor::new(ctx(join_fixture(), 64 * 1024 * 1024))
            .execute(&hash_join_plan(true))
            .unwrap();
        assert_eq!(multiset(&spilled), multiset(&in_memory));
    }

    #[test]
    fn test_hash_left_join_pads() {
        let mut plan = hash_join_plan(true);
        if let PlanNode::HashJoin { join_type, .. } = &mut plan.root {
            *join_type = JoinType::Left;
        }
        let result = Executor::new(ctx(join_fixture(), 64 * 1024 * 1024))
            .execute(&plan)
            .unwrap();
        // 3 matches plus l.id=2 padded.
        assert_eq!(result.rows.len(), 4);
        assert!(result
            .rows
            .iter()
            .any(|r| r[0] == Value::Integer(2) && r[2] == Value::Null));
    }

    #[test]
    fn test_hash_full_join() {
        let mut tables = join_fixture();
        tables.get_mut("r").unwrap().push(Row::new(
            "r",
            "4",
            vec![Value::Integer(9), Value::Text("w".into())],
        ));
        let mut plan = hash_join_plan(true);
        if let PlanNode::HashJoin { join_type, .. } = &mut plan.root {
            *join_type = JoinType::Full;
        }
        let result = Executor::new(ctx(tables, 64 * 1024 * 1024))
            .execute(&plan)
            .unwrap();
        // 3 matches + unmatched l.2 + unmatched r.9
        assert_eq!(result.rows.len(), 5);
    }

    #[test]
    fn test_null_keys_never_match() {
        let mut tables = join_fixture();
        tables
            .get_mut("l")
            .unwrap()
            .push(Row::new("l", "4", vec![Value::Null, Value::Text("n".into())]));
        tables
            .get_mut("r")
            .unwrap()
            .push(Row::new("r", "5", vec![Value::Null, Value::Text("m".into())]));
        let result = Executor::new(ctx(tables, 64 * 1024 * 1024))
            .execute(&hash_join_plan(true))
            .unwrap();
        assert_eq!(result.rows.len(), 3);
    }

    #[test]
    fn test_residual_qual() {
        let mut plan = hash_join_plan(true);
        if let PlanNode::HashJoin { residual, .. } = &mut plan.root {
            residual.push(Expr::Binary {
                left: Box::new(col("r", "rv")),
                op: BinaryOp::NotEq,
                right: Box::new(Expr::Literal(Value::Text("y".into()))),
            });
        }
        let result = Executor::new(ctx(join_fixture(), 64 * 1024 * 1024))
            .execute(&plan)
            .unwrap();
        assert_eq!(result.rows.len(), 2);
    }
}
