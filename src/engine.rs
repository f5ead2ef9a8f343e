// Engine facade.
//
// Wires the statement pipeline (parse → validate → rewrite → plan →
// execute) to the transaction manager, WAL, and storage adapters. On open,
// crash recovery rebuilds committed state from the log before any work is
// accepted; a DurabilityFailure or Corruption fences all further writes
// until the process restarts and recovery runs again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::catalog::{Catalog, Column, ForeignKey, IndexDef, TableSchema};
use crate::common::{CancelToken, Row, TransactionId, Value};
use crate::config::Config;
use crate::error::{DbError, Result};
use crate::execution::cost_model::{ColumnStats, CostModel, StatisticsCatalog, TableStats};
use crate::execution::expressions::{lookup_column, raw_text, Evaluator, SubqueryRunner};
use crate::execution::{
    fingerprint, rewrite_statement, ExecContext, Executor, Optimizer, Plan, PlanCache,
    PlannerConfig, QueryResult, TableSource,
};
use crate::monitoring::metrics::{metrics, names};
use crate::monitoring::record_error;
use crate::parser::ast::*;
use crate::parser::{Parser, Validator};
use crate::session::{SessionId, SessionManager};
use crate::storage::{
    AdapterRegistry, ScanQual, StorageType, WriteKind, WriteOp,
};
use crate::transaction::recovery::RecoveryManager;
use crate::transaction::wal::{SyncMode, WalConfig, WalManager};
use crate::transaction::{
    AdapterParticipant, CoordinatorConfig, DistributedCoordinator, IsolationLevel, LockManager,
    Outcome, Participant, TransactionManager,
};

pub struct MantisDb {
    config: Config,
    catalog: Arc<Catalog>,
    adapters: Arc<AdapterRegistry>,
    wal: Arc<WalManager>,
    txn_manager: Arc<TransactionManager>,
    coordinator: DistributedCoordinator,
    participants: HashMap<StorageType, Arc<AdapterParticipant>>,
    stats: Arc<StatisticsCatalog>,
    plan_cache: PlanCache,
    sessions: Arc<SessionManager>,
    runtime: Arc<tokio::runtime::Runtime>,
    /// Set on DurabilityFailure/Corruption; writes refuse until restart.
    write_fence: AtomicBool,
}

impl MantisDb {
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let catalog = Arc::new(Catalog::open(&config.data_dir)?);
        let adapters = Arc::new(AdapterRegistry::new(Arc::clone(&catalog)));

        // Recovery runs before the engine accepts any work.
        let recovery = RecoveryManager::new(&config.wal_dir);
        let catalog_for_recovery = Arc::clone(&catalog);
        let plan = recovery.recover(&adapters, move |table| {
            catalog_for_recovery
                .storage_type(table)
                .unwrap_or(StorageType::Kv)
        })?;

        let wal = Arc::new(WalManager::open(WalConfig {
            dir: config.wal_dir.clone(),
            segment_size: config.wal_segment_size,
            sync_mode: if config.sync_writes {
                SyncMode::SyncPerWrite
            } else {
                SyncMode::GroupSync
            },
            sync_interval: std::time::Duration::from_millis(10),
        })?);

        let lock_manager = Arc::new(LockManager::new(config.lock_timeout));
        let txn_manager = Arc::new(TransactionManager::new(
            Arc::clone(&wal),
            lock_manager,
            Arc::clone(&adapters),
            Arc::clone(&catalog),
            config.lock_timeout,
            config.transaction_timeout,
            config.default_isolation,
        ));
        txn_manager.seed_txn_ids(plan.max_txn_id);

        let coordinator =
            DistributedCoordinator::new(Arc::clone(&wal), CoordinatorConfig::default());
        let mut participants = HashMap::new();
        for (storage, _) in adapters.all() {
            participants.insert(
                storage,
                Arc::new(AdapterParticipant::from_registry(&adapters, storage)),
            );
        }

        // In-doubt distributed transactions resolve to the durable
        // decision; analysis only reports those without one, so: abort.
        coordinator.resolve_in_doubt(&plan.in_doubt, |id| {
            StorageType::parse(id)
                .and_then(|s| participants.get(&s))
                .map(|p| Arc::clone(p) as Arc<dyn Participant>)
        });

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(config.worker_count().max(1))
                .thread_name("mantisdb-worker")
                .enable_all()
                .build()
                .map_err(|e| DbError::Internal(format!("runtime start failed: {}", e)))?,
        );
        wal.spawn_sync_ticker(runtime.handle());

        let sessions = Arc::new(SessionManager::new(config.idle_transaction_timeout));
        sessions.spawn_reaper(
            Arc::clone(&txn_manager),
            runtime.handle(),
            config.idle_transaction_timeout.max(std::time::Duration::from_millis(100)),
        );

        let engine = Self {
            plan_cache: PlanCache::new(config.plan_cache_size),
            stats: Arc::new(StatisticsCatalog::new()),
            config,
            catalog,
            adapters,
            wal,
            txn_manager,
            coordinator,
            participants,
            sessions,
            runtime,
            write_fence: AtomicBool::new(false),
        };
        engine.register_adapter_schemas();
        engine.refresh_statistics();
        Ok(engine)
    }

    /// Clean close: sync and seal the WAL. Open transactions are aborted.
    pub fn shutdown(&self) -> Result<()> {
        for txn in self.txn_manager.active_transaction_ids() {
            let _ = self.txn_manager.abort(txn);
        }
        self.wal.shutdown()
    }

    pub fn create_session(&self, user: &str, database: &str) -> SessionId {
        self.sessions.create(user, database)
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    pub fn plan_cache(&self) -> &PlanCache {
        &self.plan_cache
    }

    /// Commit participant for one storage engine; exposes the
    /// fault-injection hooks used by distributed-commit tests.
    pub fn participant(&self, storage: StorageType) -> Option<&Arc<AdapterParticipant>> {
        self.participants.get(&storage)
    }

    /// Log a checkpoint record carrying the live transaction set.
    pub fn checkpoint(&self) -> Result<()> {
        self.wal
            .checkpoint(self.txn_manager.active_transaction_ids())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statement entry point
    // ------------------------------------------------------------------

    /// Execute a script of one or more statements on a session; the result
    /// of the last statement is returned.
    pub fn execute(&self, session_id: SessionId, sql: &str) -> Result<QueryResult> {
        self.sessions.touch(session_id);
        let statements = Parser::parse(sql).map_err(|e| self.surface(session_id, e))?;
        let mut last = QueryResult::empty();
        for stmt in statements {
            metrics().incr(names::STATEMENTS_EXECUTED);
            last = self
                .execute_statement(session_id, stmt)
                .map_err(|e| self.surface(session_id, e))?;
        }
        Ok(last)
    }

    /// Error bookkeeping: typed counter, write fence, transaction state.
    fn surface(&self, session_id: SessionId, err: DbError) -> DbError {
        record_error(&err);
        if err.halts_writes() {
            self.write_fence.store(true, Ordering::SeqCst);
        }
        // If the owning transaction died with the error, the session must
        // not keep pointing at it.
        if let Ok(session) = self.sessions.get(session_id) {
            if let Some(txn) = session.current_txn {
                let abort_owner = matches!(
                    err,
                    DbError::LockTimeout
                        | DbError::IsolationViolation(_)
                        | DbError::Cancelled(_)
                        | DbError::DurabilityFailure(_)
                        | DbError::Corruption(_)
                );
                if abort_owner {
                    if self.txn_manager.is_active(txn) {
                        let _ = self.txn_manager.abort(txn);
                    }
                    self.sessions.set_txn(session_id, None, false);
                }
            }
        }
        err
    }

    fn execute_statement(&self, session_id: SessionId, stmt: Statement) -> Result<QueryResult> {
        match stmt {
            Statement::Begin {
                isolation,
                read_only,
            } => self.exec_begin(session_id, isolation, read_only),
            Statement::Commit { chain } => self.exec_commit(session_id, chain),
            Statement::Rollback { savepoint, chain } => {
                self.exec_rollback(session_id, savepoint, chain)
            }
            Statement::Savepoint { name } => {
                let txn = self.require_txn(session_id)?;
                self.txn_manager.create_savepoint(txn, &name)?;
                Ok(QueryResult::empty())
            }
            Statement::ReleaseSavepoint { name } => {
                let txn = self.require_txn(session_id)?;
                self.txn_manager.release_savepoint(txn, &name)?;
                Ok(QueryResult::empty())
            }
            Statement::Explain(inner) => self.exec_explain(*inner),
            other => self.exec_data_statement(session_id, other),
        }
    }

    fn require_txn(&self, session_id: SessionId) -> Result<TransactionId> {
        self.sessions
            .get(session_id)?
            .current_txn
            .ok_or_else(|| DbError::InvalidState("no active transaction".to_string()))
    }

    fn check_writes_allowed(&self) -> Result<()> {
        if self.write_fence.load(Ordering::SeqCst) {
            return Err(DbError::DurabilityFailure(
                "engine refuses writes until a successful recovery cycle".to_string(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transaction control
    // ------------------------------------------------------------------

    fn exec_begin(
        &self,
        session_id: SessionId,
        isolation: Option<IsolationLevel>,
        read_only: Option<bool>,
    ) -> Result<QueryResult> {
        let session = self.sessions.get(session_id)?;
        if session.current_txn.is_some() {
            return Err(DbError::InvalidState(
                "a transaction is already in progress".to_string(),
            ));
        }
        self.check_writes_allowed()?;
        let isolation = isolation.or(session.isolation_default);
        let read_only = read_only.unwrap_or(session.read_only_default);
        let txn = self.txn_manager.begin(isolation, read_only)?;
        self.sessions.set_txn(session_id, Some(txn), false);
        Ok(QueryResult::empty())
    }

    fn exec_commit(&self, session_id: SessionId, chain: bool) -> Result<QueryResult> {
        let session = self.sessions.get(session_id)?;
        let txn = session
            .current_txn
            .ok_or_else(|| DbError::InvalidState("no active transaction".to_string()))?;
        let isolation = self.txn_manager.isolation(txn);
        let read_only = self.txn_manager.is_read_only(txn);

        let touched_tables = self.tables_touched(txn);
        let result = self.commit_txn(txn);
        self.sessions.set_txn(session_id, None, false);
        result?;
        for table in touched_tables {
            self.refresh_table_stats(&table);
        }

        if chain {
            let next = self.txn_manager.begin(isolation, read_only)?;
            self.sessions.set_txn(session_id, Some(next), false);
        }
        Ok(QueryResult::empty())
    }

    /// Single-engine transactions use the local commit protocol; crossing
    /// storage types upgrades to two-phase commit.
    fn commit_txn(&self, txn: TransactionId) -> Result<()> {
        let storages = self.txn_manager.touched_storage(txn);
        if storages.len() <= 1 {
            self.txn_manager.commit(txn)?;
            return Ok(());
        }

        // Stage each participant's slice of the operation log.
        let mut involved: Vec<Arc<dyn Participant>> = Vec::new();
        for storage in &storages {
            let participant = self
                .participants
                .get(storage)
                .ok_or_else(|| DbError::Internal(format!("no participant for {}", storage)))?;
            let ops: Vec<WriteOp> = self
                .catalog
                .table_names()
                .iter()
                .filter(|t| self.txn_manager.storage_of(t) == *storage)
                .flat_map(|t| self.txn_manager.pending_ops(txn, t))
                .collect();
            participant.stage(txn, ops);
            involved.push(Arc::clone(participant) as Arc<dyn Participant>);
        }

        let outcome = self.coordinator.execute(txn, &involved)?;
        self.txn_manager
            .finish_distributed(txn, outcome == Outcome::Committed)?;
        match outcome {
            Outcome::Committed => Ok(()),
            Outcome::Aborted => Err(DbError::Execution(
                "distributed transaction aborted during prepare".to_string(),
            )),
        }
    }

    fn exec_rollback(
        &self,
        session_id: SessionId,
        savepoint: Option<String>,
        chain: bool,
    ) -> Result<QueryResult> {
        let txn = self.require_txn(session_id)?;
        match savepoint {
            Some(name) => {
                self.txn_manager.rollback_to_savepoint(txn, &name)?;
                Ok(QueryResult::empty())
            }
            None => {
                let isolation = self.txn_manager.isolation(txn);
                let read_only = self.txn_manager.is_read_only(txn);
                self.txn_manager.abort(txn)?;
                self.sessions.set_txn(session_id, None, false);
                if chain {
                    let next = self.txn_manager.begin(isolation, read_only)?;
                    self.sessions.set_txn(session_id, Some(next), false);
                }
                Ok(QueryResult::empty())
            }
        }
    }

    fn tables_touched(&self, txn: TransactionId) -> Vec<String> {
        let mut tables = Vec::new();
        for table in self.catalog.table_names() {
            if !self.txn_manager.pending_ops(txn, &table).is_empty() {
                tables.push(table);
            }
        }
        tables
    }

    // ------------------------------------------------------------------
    // Data statements (implicit transaction wrapping)
    // ------------------------------------------------------------------

    fn exec_data_statement(&self, session_id: SessionId, stmt: Statement) -> Result<QueryResult> {
        let is_read = matches!(stmt, Statement::Select(_));
        if !is_read {
            self.check_writes_allowed()?;
        }

        // Validate with warnings surfaced as log events.
        let outcome = Validator::new(&self.catalog).validate(&stmt)?;
        for warning in &outcome.warnings {
            tracing::warn!(%warning, "validation warning");
        }

        let session = self.sessions.get(session_id)?;
        let (txn, implicit) = match session.current_txn {
            Some(txn) => (txn, false),
            None => {
                // Auto-commit wraps the statement in BEGIN … COMMIT.
                let txn = self
                    .txn_manager
                    .begin(session.isolation_default, is_read)?;
                (txn, true)
            }
        };

        let cancel = CancelToken::with_deadline(Instant::now() + self.config.statement_timeout);
        let result = self.exec_in_txn(txn, &stmt, &cancel);
        self.txn_manager.end_statement(txn);

        match result {
            Ok(result) => {
                if implicit {
                    let touched = self.tables_touched(txn);
                    self.commit_txn(txn)?;
                    for table in touched {
                        self.refresh_table_stats(&table);
                    }
                }
                Ok(result)
            }
            Err(e) => {
                if implicit && self.txn_manager.is_active(txn) {
                    let _ = self.txn_manager.abort(txn);
                }
                Err(e)
            }
        }
    }

    fn exec_in_txn(
        &self,
        txn: TransactionId,
        stmt: &Statement,
        cancel: &CancelToken,
    ) -> Result<QueryResult> {
        match stmt {
            Statement::Select(select) => self.exec_select(txn, select, cancel),
            Statement::Insert(insert) => self.exec_insert(txn, insert, cancel),
            Statement::Update(update) => self.exec_update(txn, update, cancel),
            Statement::Delete(delete) => self.exec_delete(txn, delete, cancel),
            Statement::CreateTable(ct) => self.exec_create_table(ct),
            Statement::DropTable { name, if_exists } => {
                match self.catalog.drop_table(name) {
                    Ok(()) => {
                        self.stats.remove_table(name);
                        self.plan_cache.clear();
                        Ok(QueryResult::empty())
                    }
                    Err(DbError::NotFound(_)) if *if_exists => Ok(QueryResult::empty()),
                    Err(e) => Err(e),
                }
            }
            Statement::CreateIndex(ci) => {
                self.catalog.create_index(IndexDef {
                    name: ci.name.clone(),
                    table: ci.table.clone(),
                    columns: ci.columns.clone(),
                    unique: ci.unique,
                })?;
                self.plan_cache.clear();
                Ok(QueryResult::empty())
            }
            Statement::DropIndex { name } => {
                self.catalog.drop_index(name)?;
                self.plan_cache.clear();
                Ok(QueryResult::empty())
            }
            other => Err(DbError::Internal(format!(
                "statement reached the executor out of band: {}",
                other
            ))),
        }
    }

    // ------------------------------------------------------------------
    // SELECT
    // ------------------------------------------------------------------

    fn exec_select(
        &self,
        txn: TransactionId,
        select: &SelectStmt,
        cancel: &CancelToken,
    ) -> Result<QueryResult> {
        let rewritten = rewrite_statement(Statement::Select(Box::new(select.clone())));
        let Statement::Select(select) = rewritten else {
            unreachable!("rewrite preserves statement kind");
        };
        let stmt_for_key = Statement::Select(select.clone());
        let key = fingerprint(&stmt_for_key);

        let plan: Arc<Plan> = match self.plan_cache.get(key) {
            Some(plan) => plan,
            None => {
                let plan = Arc::new(self.optimizer().plan_select(&select)?);
                self.plan_cache.put(key, Arc::clone(&plan));
                plan
            }
        };

        let ctx = self.exec_context(Some(txn), cancel.clone());
        Executor::new(ctx).execute(&plan)
    }

    fn exec_explain(&self, stmt: Statement) -> Result<QueryResult> {
        let rewritten = rewrite_statement(stmt);
        let Statement::Select(select) = rewritten else {
            return Err(DbError::ValidationError(
                "EXPLAIN supports SELECT statements".to_string(),
            ));
        };
        Validator::new(&self.catalog).validate(&Statement::Select(select.clone()))?;
        let plan = self.optimizer().plan_select(&select)?;
        let rows = plan
            .explain()
            .lines()
            .map(|line| vec![Value::Text(line.to_string())])
            .collect();
        Ok(QueryResult::new(vec!["QUERY PLAN".to_string()], rows))
    }

    fn optimizer(&self) -> Optimizer {
        Optimizer::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.stats),
            CostModel::default(),
            PlannerConfig {
                enable_hash_join: self.config.enable_hash_join,
                enable_merge_join: self.config.enable_merge_join,
                enable_index_scan: self.config.enable_index_scan,
                enable_parallel_scan: self.config.enable_parallel_scan,
                work_mem: self.config.work_mem,
                max_workers: self.config.worker_count(),
                ..Default::default()
            },
        )
    }

    fn exec_context(&self, txn: Option<TransactionId>, cancel: CancelToken) -> ExecContext {
        self.exec_context_with_intent(txn, cancel, false)
    }

    /// Write-intent contexts (UPDATE/DELETE scans) take exclusive row
    /// locks up front; a shared-then-upgrade discipline deadlocks when two
    /// writers scan the same rows.
    fn exec_context_with_intent(
        &self,
        txn: Option<TransactionId>,
        cancel: CancelToken,
        write_intent: bool,
    ) -> ExecContext {
        let source: Arc<dyn TableSource> = Arc::new(TxnTableSource {
            adapters: Arc::clone(&self.adapters),
            catalog: Arc::clone(&self.catalog),
            txn_manager: Arc::clone(&self.txn_manager),
            txn,
            write_intent,
        });
        let runner = EngineSubqueryRunner {
            catalog: Arc::clone(&self.catalog),
            stats: Arc::clone(&self.stats),
            source: Arc::clone(&source),
            config: self.config.clone(),
            cancel: cancel.clone(),
        };
        let evaluator = Evaluator::with_subqueries(Arc::new(runner));
        // Vectorization is a batching hint: wider batches, identical row
        // semantics.
        let batch_size = if self.config.enable_vectorization {
            self.config.batch_size.max(1) * 4
        } else {
            self.config.batch_size.max(1)
        };
        ExecContext {
            source,
            evaluator,
            cancel,
            batch_size,
            work_mem: self.config.work_mem,
            max_workers: self.config.worker_count(),
        }
    }

    // ------------------------------------------------------------------
    // DML
    // ------------------------------------------------------------------

    fn schema_of(&self, table: &str) -> Result<TableSchema> {
        self.catalog
            .get_table(table)
            .ok_or_else(|| DbError::NotFound(format!("table '{}' does not exist", table)))
    }

    fn exec_insert(
        &self,
        txn: TransactionId,
        insert: &InsertStmt,
        cancel: &CancelToken,
    ) -> Result<QueryResult> {
        let schema = self.schema_of(&insert.table)?;
        let ctx = self.exec_context(Some(txn), cancel.clone());

        let source_rows: Vec<Vec<Value>> = match &insert.source {
            InsertSource::Values(rows) => {
                let mut out = Vec::with_capacity(rows.len());
                for exprs in rows {
                    cancel.check()?;
                    let values = exprs
                        .iter()
                        .map(|e| ctx.evaluator.eval(e, &[], &[]))
                        .collect::<Result<Vec<_>>>()?;
                    out.push(values);
                }
                out
            }
            InsertSource::Query(query) => self.exec_select(txn, query, cancel)?.rows,
        };

        let mut affected = 0usize;
        for incoming in source_rows {
            let values = self.shape_row(&schema, &insert.columns, incoming, &ctx)?;
            self.enforce_constraints(&schema, &values, &ctx)?;
            let key = self.row_key(&schema, &values);

            // ON CONFLICT resolves against the transaction-visible row.
            let existing = self.visible_row(txn, &insert.table, &key)?;
            if let Some(existing) = existing {
                match &insert.on_conflict {
                    None => {
                        return Err(DbError::AlreadyExists(format!(
                            "duplicate key '{}' in table '{}'",
                            key, insert.table
                        )));
                    }
                    Some(OnConflict {
                        action: ConflictAction::DoNothing,
                        ..
                    }) => continue,
                    Some(OnConflict {
                        action:
                            ConflictAction::DoUpdate {
                                assignments,
                                selection,
                            },
                        ..
                    }) => {
                        let columns = schema.column_names();
                        if let Some(selection) = selection {
                            if !ctx
                                .evaluator
                                .eval(selection, &columns, &existing.values)?
                                .is_true()
                            {
                                continue;
                            }
                        }
                        let mut updated = existing.values.clone();
                        for assignment in assignments {
                            let idx = schema.column_index(&assignment.column).ok_or_else(|| {
                                DbError::ValidationError(format!(
                                    "column '{}' not in table '{}'",
                                    assignment.column, insert.table
                                ))
                            })?;
                            updated[idx] =
                                ctx.evaluator
                                    .eval(&assignment.value, &columns, &existing.values)?;
                        }
                        self.enforce_constraints(&schema, &updated, &ctx)?;
                        self.txn_manager.add_operation(
                            txn,
                            WriteOp::update(&insert.table, &key, updated, existing.values),
                        )?;
                        affected += 1;
                        continue;
                    }
                }
            }

            self.txn_manager
                .add_operation(txn, WriteOp::insert(&insert.table, &key, values))?;
            affected += 1;
        }
        Ok(QueryResult::affected(affected))
    }

    /// Reorder/extend an insert row onto the full schema, applying column
    /// defaults for anything unlisted.
    fn shape_row(
        &self,
        schema: &TableSchema,
        columns: &[String],
        incoming: Vec<Value>,
        ctx: &ExecContext,
    ) -> Result<Vec<Value>> {
        if columns.is_empty() {
            if incoming.len() != schema.columns.len() {
                return Err(DbError::ValidationError(format!(
                    "row has {} values but table '{}' has {} columns",
                    incoming.len(),
                    schema.name,
                    schema.columns.len()
                )));
            }
            return Ok(incoming);
        }
        let mut values = vec![Value::Null; schema.columns.len()];
        let mut provided = vec![false; schema.columns.len()];
        for (column, value) in columns.iter().zip(incoming.into_iter()) {
            let idx = schema.column_index(column).ok_or_else(|| {
                DbError::ValidationError(format!(
                    "column '{}' not in table '{}'",
                    column, schema.name
                ))
            })?;
            values[idx] = value;
            provided[idx] = true;
        }
        for (idx, column) in schema.columns.iter().enumerate() {
            if !provided[idx] {
                if let Some(default) = &column.default {
                    values[idx] = ctx.evaluator.eval(default, &[], &[])?;
                }
            }
        }
        Ok(values)
    }

    fn enforce_constraints(
        &self,
        schema: &TableSchema,
        values: &[Value],
        ctx: &ExecContext,
    ) -> Result<()> {
        for (column, value) in schema.columns.iter().zip(values.iter()) {
            if !column.nullable && value.is_null() {
                return Err(DbError::ValidationError(format!(
                    "null value in column '{}' violates NOT NULL",
                    column.name
                )));
            }
        }
        let columns = schema.column_names();
        for check in &schema.checks {
            let passed = ctx.evaluator.eval(check, &columns, values)?;
            if matches!(passed, Value::Boolean(false)) {
                return Err(DbError::ValidationError(format!(
                    "CHECK constraint on table '{}' violated",
                    schema.name
                )));
            }
        }
        Ok(())
    }

    fn row_key(&self, schema: &TableSchema, values: &[Value]) -> String {
        if schema.primary_key.is_empty() {
            let adapter = self.adapters.adapter(schema.storage);
            return format!("r{}", adapter.next_row_key(&schema.name));
        }
        schema
            .primary_key
            .iter()
            .map(|pk| {
                schema
                    .column_index(pk)
                    .and_then(|idx| values.get(idx))
                    .map(raw_text)
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Point lookup with the transaction's pending writes overlaid.
    fn visible_row(
        &self,
        txn: TransactionId,
        table: &str,
        key: &str,
    ) -> Result<Option<Row>> {
        let mut base = self
            .adapters
            .adapter(self.txn_manager.storage_of(table))
            .point_get(table, key)?;
        for op in self.txn_manager.pending_ops(txn, table) {
            if op.key != key {
                continue;
            }
            base = match op.kind {
                WriteKind::Delete => None,
                WriteKind::Insert | WriteKind::Update => Some(Row {
                    values: op.values.clone().unwrap_or_default(),
                    row_id: 0,
                    key: key.to_string(),
                    source_table: table.to_string(),
                    version: op.version,
                }),
            };
        }
        Ok(base)
    }

    fn exec_update(
        &self,
        txn: TransactionId,
        update: &UpdateStmt,
        cancel: &CancelToken,
    ) -> Result<QueryResult> {
        let schema = self.schema_of(&update.table)?;
        let ctx = self.exec_context_with_intent(Some(txn), cancel.clone(), true);
        let columns = schema.column_names();
        let matching = self.matching_rows(txn, &update.table, &update.selection, &ctx)?;

        let mut affected = 0usize;
        for row in matching {
            cancel.check()?;
            // Take the exclusive lock first, then re-read and re-evaluate
            // under it; assignments computed from a pre-lock snapshot
            // would lose concurrent updates.
            self.txn_manager
                .lock_for_write(txn, &update.table, &row.key)?;
            let Some(current) = self.visible_row(txn, &update.table, &row.key)? else {
                continue;
            };
            if let Some(selection) = &update.selection {
                if !ctx
                    .evaluator
                    .eval(selection, &columns, &current.values)?
                    .is_true()
                {
                    continue;
                }
            }

            let mut updated = current.values.clone();
            for assignment in &update.assignments {
                let idx = schema.column_index(&assignment.column).ok_or_else(|| {
                    DbError::ValidationError(format!(
                        "column '{}' not in table '{}'",
                        assignment.column, update.table
                    ))
                })?;
                updated[idx] = ctx
                    .evaluator
                    .eval(&assignment.value, &columns, &current.values)?;
            }
            self.enforce_constraints(&schema, &updated, &ctx)?;

            let new_key = self.row_key(&schema, &updated);
            if new_key != current.key && !schema.primary_key.is_empty() {
                // Primary-key change relocates the row.
                self.txn_manager.add_operation(
                    txn,
                    WriteOp::delete(&update.table, &current.key, current.values.clone()),
                )?;
                self.txn_manager
                    .add_operation(txn, WriteOp::insert(&update.table, &new_key, updated))?;
            } else {
                self.txn_manager.add_operation(
                    txn,
                    WriteOp::update(&update.table, &current.key, updated, current.values),
                )?;
            }
            affected += 1;
        }
        Ok(QueryResult::affected(affected))
    }

    fn exec_delete(
        &self,
        txn: TransactionId,
        delete: &DeleteStmt,
        cancel: &CancelToken,
    ) -> Result<QueryResult> {
        let schema = self.schema_of(&delete.table)?;
        let columns = schema.column_names();
        let ctx = self.exec_context_with_intent(Some(txn), cancel.clone(), true);
        let matching = self.matching_rows(txn, &delete.table, &delete.selection, &ctx)?;

        let mut affected = 0usize;
        for row in matching {
            cancel.check()?;
            self.txn_manager
                .lock_for_write(txn, &delete.table, &row.key)?;
            let Some(current) = self.visible_row(txn, &delete.table, &row.key)? else {
                continue;
            };
            if let Some(selection) = &delete.selection {
                if !ctx
                    .evaluator
                    .eval(selection, &columns, &current.values)?
                    .is_true()
                {
                    continue;
                }
            }
            self.txn_manager.add_operation(
                txn,
                WriteOp::delete(&delete.table, &current.key, current.values),
            )?;
            affected += 1;
        }
        Ok(QueryResult::affected(affected))
    }

    /// Transaction-visible rows of a table matching an optional predicate.
    fn matching_rows(
        &self,
        _txn: TransactionId,
        table: &str,
        selection: &Option<Expr>,
        ctx: &ExecContext,
    ) -> Result<Vec<Row>> {
        let schema = self.schema_of(table)?;
        let columns = schema.column_names();
        let rows = ctx.source.scan(table, &[])?;
        let mut matching = Vec::new();
        for row in rows {
            let keep = match selection {
                None => true,
                Some(predicate) => ctx
                    .evaluator
                    .eval(predicate, &columns, &row.values)?
                    .is_true(),
            };
            if keep {
                matching.push(row);
            }
        }
        Ok(matching)
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    fn exec_create_table(&self, ct: &CreateTableStmt) -> Result<QueryResult> {
        let storage = ct.engine.unwrap_or(StorageType::Kv);
        let mut columns = Vec::with_capacity(ct.columns.len());
        let mut primary_key = Vec::new();
        for def in &ct.columns {
            if def.primary_key {
                primary_key.push(def.name.clone());
            }
            columns.push(Column {
                name: def.name.clone(),
                data_type: def.data_type,
                nullable: def.nullable,
                default: def.default.clone(),
            });
        }

        let mut schema = TableSchema::new(&ct.name, columns, storage);
        for def in &ct.columns {
            if let Some(check) = &def.check {
                schema.checks.push(check.clone());
            }
            if let Some((table, column)) = &def.references {
                schema.foreign_keys.push(ForeignKey {
                    columns: vec![def.name.clone()],
                    ref_table: table.clone(),
                    ref_columns: vec![column.clone().unwrap_or_else(|| def.name.clone())],
                });
            }
        }
        for constraint in &ct.constraints {
            match constraint {
                TableConstraint::PrimaryKey(cols) => primary_key = cols.clone(),
                TableConstraint::Unique(cols) => schema.indexes.push(IndexDef {
                    name: format!("{}_{}_key", ct.name, cols.join("_")),
                    table: ct.name.clone(),
                    columns: cols.clone(),
                    unique: true,
                }),
                TableConstraint::Check(expr) => schema.checks.push(expr.clone()),
                TableConstraint::ForeignKey {
                    columns,
                    ref_table,
                    ref_columns,
                } => schema.foreign_keys.push(ForeignKey {
                    columns: columns.clone(),
                    ref_table: ref_table.clone(),
                    ref_columns: ref_columns.clone(),
                }),
            }
        }
        schema.primary_key = primary_key;

        match self.catalog.create_table(schema) {
            Ok(()) => {}
            Err(DbError::AlreadyExists(_)) if ct.if_not_exists => {
                return Ok(QueryResult::empty())
            }
            Err(e) => return Err(e),
        }
        self.register_adapter_schemas();
        self.stats.set_table(&ct.name, TableStats::new(0.0, 32));
        // Cached plans may reference the old schema shape.
        self.plan_cache.clear();
        Ok(QueryResult::empty())
    }

    /// The KV adapter keeps a column map so pushed-down quals resolve
    /// without a catalog round trip.
    fn register_adapter_schemas(&self) {
        for name in self.catalog.table_names() {
            if let Some(schema) = self.catalog.get_table(&name) {
                if schema.storage == StorageType::Kv {
                    self.adapters
                        .kv()
                        .register_columns(&name, schema.column_names());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Recompute row counts and NDVs for every known table.
    pub fn refresh_statistics(&self) {
        for table in self.catalog.table_names() {
            self.refresh_table_stats(&table);
        }
    }

    fn refresh_table_stats(&self, table: &str) {
        let Some(schema) = self.catalog.get_table(table) else {
            return;
        };
        let adapter = self.adapters.adapter(schema.storage);
        let Ok(rows) = adapter.scan(table, &[]) else {
            return;
        };
        let width: usize = schema.columns.len() * 16;
        let mut stats = TableStats::new(rows.len() as f64, width.max(16));
        for (idx, column) in schema.columns.iter().enumerate() {
            let mut distinct = std::collections::HashSet::new();
            let mut nulls = 0usize;
            for row in &rows {
                match row.values.get(idx) {
                    Some(Value::Null) | None => nulls += 1,
                    Some(v) => {
                        distinct.insert(v.clone());
                    }
                }
            }
            stats.set_column(
                &column.name,
                ColumnStats {
                    ndv: distinct.len() as u64,
                    null_frac: if rows.is_empty() {
                        0.0
                    } else {
                        nulls as f64 / rows.len() as f64
                    },
                    histogram: None,
                },
            );
        }
        self.stats.set_table(table, stats);
    }
}

// ============================================================================
// Table source with transaction semantics
// ============================================================================

/// Routes scans to the right adapter, overlays the transaction's pending
/// writes (read-your-writes), and takes read and predicate locks per the
/// isolation discipline.
struct TxnTableSource {
    adapters: Arc<AdapterRegistry>,
    catalog: Arc<Catalog>,
    txn_manager: Arc<TransactionManager>,
    txn: Option<TransactionId>,
    /// UPDATE/DELETE scans lock rows exclusively instead of shared.
    write_intent: bool,
}

impl TableSource for TxnTableSource {
    fn scan(&self, table: &str, pushdown: &[ScanQual]) -> Result<Vec<Row>> {
        let storage = self
            .catalog
            .storage_type(table)
            .unwrap_or(StorageType::Kv);
        if let Some(txn) = self.txn {
            // Serializable range lock on the scan predicate.
            self.txn_manager.lock_for_scan(txn, table, pushdown)?;
        }

        let mut rows = self.adapters.adapter(storage).scan(table, pushdown)?;

        if let Some(txn) = self.txn {
            let pending = self.txn_manager.pending_ops(txn, table);
            if !pending.is_empty() {
                let schema = self.catalog.get_table(table);
                for op in pending {
                    rows.retain(|r| r.key != op.key);
                    match op.kind {
                        WriteKind::Delete => {}
                        WriteKind::Insert | WriteKind::Update => {
                            let values = op.values.clone().unwrap_or_default();
                            let visible = match &schema {
                                Some(schema) => pushdown.iter().all(|q| {
                                    schema
                                        .column_index(&q.column)
                                        .and_then(|idx| values.get(idx))
                                        .map(|v| q.op.matches(v, &q.value))
                                        .unwrap_or(true)
                                }),
                                None => true,
                            };
                            if visible {
                                rows.push(Row {
                                    values,
                                    row_id: 0,
                                    key: op.key.clone(),
                                    source_table: table.to_string(),
                                    version: op.version,
                                });
                            }
                        }
                    }
                }
                rows.sort_by(|a, b| a.key.cmp(&b.key));
            }

            // Row-level locks per the isolation discipline; write-intent
            // scans go exclusive immediately.
            for row in &rows {
                if self.write_intent {
                    self.txn_manager.lock_for_write(txn, table, &row.key)?;
                } else {
                    self.txn_manager.lock_for_read(txn, table, &row.key)?;
                }
            }
        }
        Ok(rows)
    }
}

// ============================================================================
// Subquery execution
// ============================================================================

#[derive(Clone)]
struct EngineSubqueryRunner {
    catalog: Arc<Catalog>,
    stats: Arc<StatisticsCatalog>,
    source: Arc<dyn TableSource>,
    config: Config,
    cancel: CancelToken,
}

impl SubqueryRunner for EngineSubqueryRunner {
    fn run(
        &self,
        query: &SelectStmt,
        outer_columns: &[String],
        outer_values: &[Value],
    ) -> Result<Vec<Vec<Value>>> {
        self.cancel.check()?;
        let optimizer = Optimizer::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.stats),
            CostModel::default(),
            PlannerConfig {
                enable_hash_join: self.config.enable_hash_join,
                enable_merge_join: self.config.enable_merge_join,
                enable_index_scan: self.config.enable_index_scan,
                // Nested queries stay serial.
                enable_parallel_scan: false,
                work_mem: self.config.work_mem,
                max_workers: 1,
                ..Default::default()
            },
        );
        let plan = optimizer.plan_select(query)?;

        let mut evaluator = Evaluator::with_subqueries(Arc::new(self.clone()));
        if !outer_columns.is_empty() {
            evaluator.outer = Some((outer_columns.to_vec(), outer_values.to_vec()));
        }
        let ctx = ExecContext {
            source: Arc::clone(&self.source),
            evaluator,
            cancel: self.cancel.clone(),
            batch_size: self.config.batch_size.max(1),
            work_mem: self.config.work_mem,
            max_workers: 1,
        };
        Ok(Executor::new(ctx).execute(&plan)?.rows)
    }
}

/// Convenience used by tests: find a named column in a result.
pub fn result_column(result: &QueryResult, name: &str) -> Option<usize> {
    lookup_column(&result.columns, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> (TempDir, MantisDb, SessionId) {
        let dir = TempDir::new().unwrap();
        let db = MantisDb::open(Config::at(dir.path())).unwrap();
        let session = db.create_session("test", "main");
        (dir, db, session)
    }

    #[test]
    fn test_create_insert_select() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        let result = db
            .execute(session, "INSERT INTO users VALUES (1, 'ann'), (2, 'bob')")
            .unwrap();
        assert_eq!(result.rows_affected, 2);

        let result = db
            .execute(session, "SELECT name FROM users WHERE id = 2")
            .unwrap();
        assert_eq!(result.rows, vec![vec![Value::Text("bob".into())]]);
    }

    #[test]
    fn test_explicit_transaction_commit_and_rollback() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();

        db.execute(session, "BEGIN; INSERT INTO t VALUES (1); COMMIT")
            .unwrap();
        db.execute(session, "BEGIN; INSERT INTO t VALUES (2); ROLLBACK")
            .unwrap();

        let result = db.execute(session, "SELECT id FROM t").unwrap();
        assert_eq!(result.rows, vec![vec![Value::Integer(1)]]);
    }

    #[test]
    fn test_read_your_writes_inside_transaction() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        db.execute(session, "BEGIN").unwrap();
        db.execute(session, "INSERT INTO t VALUES (1, 'x')").unwrap();
        let result = db.execute(session, "SELECT v FROM t WHERE id = 1").unwrap();
        assert_eq!(result.rows.len(), 1);

        // Another session must not see the uncommitted row.
        let other = db.create_session("other", "main");
        let result = db.execute(other, "SELECT v FROM t").unwrap();
        assert!(result.rows.is_empty());

        db.execute(session, "COMMIT").unwrap();
        let result = db.execute(other, "SELECT v FROM t").unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn test_update_and_delete() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)")
            .unwrap();
        db.execute(session, "INSERT INTO t VALUES (1, 10), (2, 20), (3, 30)")
            .unwrap();

        let result = db
            .execute(session, "UPDATE t SET v = v + 1 WHERE id > 1")
            .unwrap();
        assert_eq!(result.rows_affected, 2);

        let result = db.execute(session, "DELETE FROM t WHERE v = 21").unwrap();
        assert_eq!(result.rows_affected, 1);

        let result = db
            .execute(session, "SELECT id, v FROM t ORDER BY id ASC")
            .unwrap();
        assert_eq!(
            result.rows,
            vec![
                vec![Value::Integer(1), Value::Integer(10)],
                vec![Value::Integer(3), Value::Integer(31)],
            ]
        );
    }

    #[test]
    fn test_on_conflict_do_nothing_and_update() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        db.execute(session, "INSERT INTO t VALUES (1, 'a')").unwrap();

        let result = db
            .execute(
                session,
                "INSERT INTO t VALUES (1, 'b') ON CONFLICT (id) DO NOTHING",
            )
            .unwrap();
        assert_eq!(result.rows_affected, 0);

        db.execute(
            session,
            "INSERT INTO t VALUES (1, 'c') ON CONFLICT (id) DO UPDATE SET v = 'c'",
        )
        .unwrap();
        let result = db.execute(session, "SELECT v FROM t WHERE id = 1").unwrap();
        assert_eq!(result.rows, vec![vec![Value::Text("c".into())]]);

        // Plain duplicate insert errors.
        assert!(db.execute(session, "INSERT INTO t VALUES (1, 'd')").is_err());
    }

    #[test]
    fn test_aggregates_and_group_by() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE s (id INTEGER PRIMARY KEY, g TEXT, v INTEGER)")
            .unwrap();
        db.execute(
            session,
            "INSERT INTO s VALUES (1, 'a', 10), (2, 'a', 20), (3, 'b', 5)",
        )
        .unwrap();

        let result = db
            .execute(
                session,
                "SELECT g, count(*), sum(v) FROM s GROUP BY g ORDER BY g ASC",
            )
            .unwrap();
        assert_eq!(
            result.rows,
            vec![
                vec![
                    Value::Text("a".into()),
                    Value::Integer(2),
                    Value::Integer(30)
                ],
                vec![
                    Value::Text("b".into()),
                    Value::Integer(1),
                    Value::Integer(5)
                ],
            ]
        );
    }

    #[test]
    fn test_join_across_storage_engines() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE kvt (id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        db.execute(
            session,
            "CREATE TABLE colt (id INTEGER PRIMARY KEY, w TEXT) ENGINE = columnar",
        )
        .unwrap();
        db.execute(session, "INSERT INTO kvt VALUES (1, 'k1'), (2, 'k2')")
            .unwrap();
        db.execute(session, "INSERT INTO colt VALUES (1, 'c1'), (3, 'c3')")
            .unwrap();

        let result = db
            .execute(
                session,
                "SELECT kvt.v, colt.w FROM kvt JOIN colt ON kvt.id = colt.id",
            )
            .unwrap();
        assert_eq!(
            result.rows,
            vec![vec![Value::Text("k1".into()), Value::Text("c1".into())]]
        );
    }

    #[test]
    fn test_explain_returns_plan_text() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();
        let result = db.execute(session, "EXPLAIN SELECT * FROM t").unwrap();
        assert_eq!(result.columns, vec!["QUERY PLAN"]);
        let text = result
            .rows
            .iter()
            .map(|r| raw_text(&r[0]))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(text.contains("SeqScan"));
    }

    #[test]
    fn test_constraint_violation_rejected() {
        let (_dir, db, session) = engine();
        db.execute(
            session,
            "CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER NOT NULL CHECK (v > 0))",
        )
        .unwrap();
        assert!(db
            .execute(session, "INSERT INTO t VALUES (1, NULL)")
            .is_err());
        assert!(db.execute(session, "INSERT INTO t VALUES (1, -5)").is_err());
        db.execute(session, "INSERT INTO t VALUES (1, 5)").unwrap();
    }

    #[test]
    fn test_subqueries() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE a (id INTEGER PRIMARY KEY)")
            .unwrap();
        db.execute(session, "CREATE TABLE b (id INTEGER PRIMARY KEY)")
            .unwrap();
        db.execute(session, "INSERT INTO a VALUES (1), (2), (3)").unwrap();
        db.execute(session, "INSERT INTO b VALUES (2), (3), (4)").unwrap();

        let result = db
            .execute(
                session,
                "SELECT id FROM a WHERE id IN (SELECT id FROM b) ORDER BY id ASC",
            )
            .unwrap();
        assert_eq!(
            result.rows,
            vec![vec![Value::Integer(2)], vec![Value::Integer(3)]]
        );

        let result = db
            .execute(
                session,
                "SELECT id FROM a WHERE EXISTS (SELECT 1 FROM b WHERE b.id = a.id) ORDER BY id ASC",
            )
            .unwrap();
        assert_eq!(result.rows.len(), 2);
    }

    #[test]
    fn test_plan_cache_hits_on_repeat() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();
        db.execute(session, "SELECT * FROM t WHERE id = 1").unwrap();
        let misses_before = db.plan_cache().len();
        db.execute(session, "select * from T where ID = 1").unwrap();
        assert_eq!(db.plan_cache().len(), misses_before);
        assert!(db.plan_cache().hit_ratio() > 0.0);
    }

    #[test]
    fn test_savepoint_statements() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();
        db.execute(session, "BEGIN").unwrap();
        db.execute(session, "INSERT INTO t VALUES (1)").unwrap();
        db.execute(session, "SAVEPOINT s1").unwrap();
        db.execute(session, "INSERT INTO t VALUES (2)").unwrap();
        db.execute(session, "ROLLBACK TO SAVEPOINT s1").unwrap();
        db.execute(session, "COMMIT").unwrap();

        let result = db.execute(session, "SELECT id FROM t").unwrap();
        assert_eq!(result.rows, vec![vec![Value::Integer(1)]]);
    }

    #[test]
    fn test_commit_without_txn_is_invalid_state() {
        let (_dir, db, session) = engine();
        assert!(matches!(
            db.execute(session, "COMMIT"),
            Err(DbError::InvalidState(_))
        ));
    }

    #[test]
    fn test_read_only_transaction_rejects_writes() {
        let (_dir, db, session) = engine();
        db.execute(session, "CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();
        db.execute(session, "BEGIN READ ONLY").unwrap();
        let err = db
            .execute(session, "INSERT INTO t VALUES (1)")
            .unwrap_err();
        assert!(matches!(err, DbError::IsolationViolation(_)));
        // The violating transaction was aborted; the session is clean.
        db.execute(session, "BEGIN").unwrap();
        db.execute(session, "COMMIT").unwrap();
    }
}
