// Semantic validation.
//
// Walks the AST with a scope of known tables (CTEs included), aliases, and
// the builtin function table. Structural violations are hard
// `ValidationError`s; unresolvable identifiers are surfaced as warnings and
// validation continues, since adapters may hold tables the catalog has not
// seen yet.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

use crate::catalog::Catalog;
use crate::error::{DbError, Result};
use crate::parser::ast::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
    /// Valid only with an OVER clause.
    Window,
}

pub struct FunctionSig {
    pub min_args: usize,
    pub max_args: Option<usize>,
    pub kind: FunctionKind,
}

static BUILTIN_FUNCTIONS: Lazy<HashMap<&'static str, FunctionSig>> = Lazy::new(|| {
    let mut m = HashMap::new();
    let mut f = |name, min, max, kind| {
        m.insert(
            name,
            FunctionSig {
                min_args: min,
                max_args: max,
                kind,
            },
        );
    };
    use FunctionKind::*;
    f("count", 1, Some(1), Aggregate);
    f("sum", 1, Some(1), Aggregate);
    f("avg", 1, Some(1), Aggregate);
    f("min", 1, Some(1), Aggregate);
    f("max", 1, Some(1), Aggregate);
    f("stddev", 1, Some(1), Aggregate);
    f("variance", 1, Some(1), Aggregate);
    f("row_number", 0, Some(0), Window);
    f("rank", 0, Some(0), Window);
    f("dense_rank", 0, Some(0), Window);
    f("abs", 1, Some(1), Scalar);
    f("upper", 1, Some(1), Scalar);
    f("lower", 1, Some(1), Scalar);
    f("length", 1, Some(1), Scalar);
    f("coalesce", 1, None, Scalar);
    f("nullif", 2, Some(2), Scalar);
    f("round", 1, Some(2), Scalar);
    f("substr", 2, Some(3), Scalar);
    f("trim", 1, Some(1), Scalar);
    f("replace", 3, Some(3), Scalar);
    f("now", 0, Some(0), Scalar);
    m
});

pub fn is_aggregate_function(name: &str) -> bool {
    BUILTIN_FUNCTIONS
        .get(name.to_ascii_lowercase().as_str())
        .map(|sig| sig.kind == FunctionKind::Aggregate)
        .unwrap_or(false)
}

/// True when the expression contains an aggregate call outside any OVER
/// clause (a windowed aggregate does not make a query grouped).
pub fn contains_plain_aggregate(expr: &Expr) -> bool {
    let mut found = false;
    walk_expr(expr, &mut |e| {
        if let Expr::Function(call) = e {
            if call.over.is_none() && is_aggregate_function(&call.name) {
                found = true;
            }
        }
    });
    found
}

#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub warnings: Vec<String>,
}

#[derive(Clone)]
struct ScopeTable {
    alias: String,
    /// None when the table could not be resolved; columns stay unchecked.
    columns: Option<Vec<String>>,
    primary_key: Vec<String>,
}

#[derive(Clone, Default)]
struct Scope {
    tables: Vec<ScopeTable>,
}

pub struct Validator<'a> {
    catalog: &'a Catalog,
    scopes: Vec<Scope>,
    /// CTE name → output columns, one frame per WITH nesting level.
    ctes: Vec<HashMap<String, Option<Vec<String>>>>,
    warnings: Vec<String>,
}

impl<'a> Validator<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            scopes: Vec::new(),
            ctes: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn validate(mut self, stmt: &Statement) -> Result<ValidationOutcome> {
        self.validate_statement(stmt)?;
        Ok(ValidationOutcome {
            warnings: self.warnings,
        })
    }

    fn warn(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn validate_statement(&mut self, stmt: &Statement) -> Result<()> {
        match stmt {
            Statement::Select(select) => self.validate_select(select),
            Statement::Insert(insert) => self.validate_insert(insert),
            Statement::Update(update) => self.validate_update(update),
            Statement::Delete(delete) => self.validate_delete(delete),
            Statement::CreateTable(ct) => self.validate_create_table(ct),
            Statement::CreateIndex(ci) => {
                if let Some(schema) = self.catalog.get_table(&ci.table) {
                    for column in &ci.columns {
                        if schema.column_index(column).is_none() {
                            return Err(DbError::ValidationError(format!(
                                "index column '{}' not in table '{}'",
                                column, ci.table
                            )));
                        }
                    }
                } else {
                    self.warn(format!("unknown table '{}'", ci.table));
                }
                Ok(())
            }
            Statement::Explain(inner) => self.validate_statement(inner),
            // Transaction control and drops have no expression structure.
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // SELECT
    // ------------------------------------------------------------------

    fn validate_select(&mut self, stmt: &SelectStmt) -> Result<()> {
        let mut cte_frame = HashMap::new();
        for cte in &stmt.with {
            // Recursive CTEs may reference themselves inside their body.
            if cte.recursive {
                self.ctes.push(HashMap::from([(
                    cte.name.to_lowercase(),
                    if cte.columns.is_empty() {
                        None
                    } else {
                        Some(cte.columns.clone())
                    },
                )]));
                let result = self.validate_select(&cte.query);
                self.ctes.pop();
                result?;
            } else {
                self.validate_select(&cte.query)?;
            }
            let columns = if cte.columns.is_empty() {
                projection_names(&cte.query)
            } else {
                Some(cte.columns.clone())
            };
            if cte_frame
                .insert(cte.name.to_lowercase(), columns)
                .is_some()
            {
                return Err(DbError::ValidationError(format!(
                    "duplicate CTE name '{}'",
                    cte.name
                )));
            }
        }
        self.ctes.push(cte_frame);

        let mut scope = Scope::default();
        if let Some(from) = &stmt.from {
            self.collect_scope(from, &mut scope)?;
        }

        // Alias uniqueness is a hard failure.
        let mut seen = HashSet::new();
        for table in &scope.tables {
            if !seen.insert(table.alias.to_lowercase()) {
                self.ctes.pop();
                return Err(DbError::ValidationError(format!(
                    "duplicate table alias '{}'",
                    table.alias
                )));
            }
        }

        self.scopes.push(scope);
        let result = self.validate_select_clauses(stmt);
        self.scopes.pop();
        self.ctes.pop();
        result
    }

    fn validate_select_clauses(&mut self, stmt: &SelectStmt) -> Result<()> {
        // Join conditions first; aggregates are not allowed there.
        if let Some(from) = &stmt.from {
            self.validate_join_conditions(from)?;
        }

        if let Some(selection) = &stmt.selection {
            if contains_plain_aggregate(selection) {
                return Err(DbError::ValidationError(
                    "aggregate functions are not allowed in WHERE".to_string(),
                ));
            }
            self.validate_expr(selection, false)?;
        }

        for group in &stmt.group_by {
            if contains_plain_aggregate(group) {
                return Err(DbError::ValidationError(
                    "aggregate functions are not allowed in GROUP BY".to_string(),
                ));
            }
            self.validate_expr(group, false)?;
        }

        let grouped = !stmt.group_by.is_empty()
            || stmt.projection.iter().any(|item| match item {
                SelectItem::Expr { expr, .. } => contains_plain_aggregate(expr),
                _ => false,
            })
            || stmt
                .having
                .as_ref()
                .map(|h| contains_plain_aggregate(h))
                .unwrap_or(false);

        for item in &stmt.projection {
            if let SelectItem::Expr { expr, .. } = item {
                self.validate_expr(expr, grouped)?;
            }
        }

        if grouped {
            self.check_group_consistency(stmt)?;
        }

        if let Some(having) = &stmt.having {
            if !grouped {
                return Err(DbError::ValidationError(
                    "HAVING requires a grouped query".to_string(),
                ));
            }
            self.validate_expr(having, true)?;
        }

        for order in &stmt.order_by {
            self.validate_expr(&order.expr, grouped)?;
        }

        Ok(())
    }

    fn validate_join_conditions(&mut self, table_ref: &TableRef) -> Result<()> {
        if let TableRef::Join {
            left,
            right,
            constraint,
            ..
        } = table_ref
        {
            self.validate_join_conditions(left)?;
            self.validate_join_conditions(right)?;
            if let JoinConstraint::On(expr) = constraint {
                if contains_plain_aggregate(expr) {
                    return Err(DbError::ValidationError(
                        "aggregate functions are not allowed in JOIN conditions".to_string(),
                    ));
                }
                self.validate_expr(expr, false)?;
            }
        }
        Ok(())
    }

    fn collect_scope(&mut self, table_ref: &TableRef, scope: &mut Scope) -> Result<()> {
        match table_ref {
            TableRef::Table { name, alias } => {
                let lowered = name.to_lowercase();
                let from_cte = self
                    .ctes
                    .iter()
                    .rev()
                    .find_map(|frame| frame.get(&lowered))
                    .cloned();
                let (columns, primary_key) = match from_cte {
                    Some(columns) => (columns, Vec::new()),
                    None => match self.catalog.get_table(name) {
                        Some(schema) => {
                            (Some(schema.column_names()), schema.primary_key.clone())
                        }
                        None => {
                            self.warn(format!("unknown table '{}'", name));
                            (None, Vec::new())
                        }
                    },
                };
                scope.tables.push(ScopeTable {
                    alias: alias.clone().unwrap_or_else(|| name.clone()),
                    columns,
                    primary_key,
                });
            }
            TableRef::Subquery { query, alias } => {
                self.validate_select(query)?;
                scope.tables.push(ScopeTable {
                    alias: alias.clone(),
                    columns: projection_names(query),
                    primary_key: Vec::new(),
                });
            }
            TableRef::Join { left, right, .. } => {
                self.collect_scope(left, scope)?;
                self.collect_scope(right, scope)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn validate_expr(&mut self, expr: &Expr, aggregates_allowed: bool) -> Result<()> {
        match expr {
            Expr::Literal(_) | Expr::Wildcard => Ok(()),
            Expr::Column { table, name } => {
                self.resolve_column(table.as_deref(), name);
                Ok(())
            }
            Expr::Binary { left, right, .. } => {
                self.validate_expr(left, aggregates_allowed)?;
                self.validate_expr(right, aggregates_allowed)
            }
            Expr::Unary { expr, .. } => self.validate_expr(expr, aggregates_allowed),
            Expr::Cast { expr, .. } => self.validate_expr(expr, aggregates_allowed),
            Expr::Extract { field, expr } => {
                const FIELDS: &[&str] =
                    &["YEAR", "MONTH", "DAY", "HOUR", "MINUTE", "SECOND", "DOW", "EPOCH"];
                if !FIELDS.contains(&field.as_str()) {
                    return Err(DbError::ValidationError(format!(
                        "unknown EXTRACT field '{}'",
                        field
                    )));
                }
                self.validate_expr(expr, aggregates_allowed)
            }
            Expr::Case {
                operand,
                branches,
                else_expr,
            } => {
                if let Some(op) = operand {
                    self.validate_expr(op, aggregates_allowed)?;
                }
                for (when, then) in branches {
                    self.validate_expr(when, aggregates_allowed)?;
                    self.validate_expr(then, aggregates_allowed)?;
                }
                if let Some(e) = else_expr {
                    self.validate_expr(e, aggregates_allowed)?;
                }
                Ok(())
            }
            Expr::InList { expr, list, .. } => {
                self.validate_expr(expr, aggregates_allowed)?;
                for item in list {
                    self.validate_expr(item, aggregates_allowed)?;
                }
                Ok(())
            }
            Expr::InSubquery { expr, query, .. } => {
                self.validate_expr(expr, aggregates_allowed)?;
                self.validate_select(query)
            }
            Expr::Exists { query, .. } => self.validate_select(query),
            Expr::Subquery(query) => self.validate_select(query),
            Expr::Function(call) => self.validate_function(call, aggregates_allowed),
        }
    }

    fn validate_function(&mut self, call: &FunctionCall, aggregates_allowed: bool) -> Result<()> {
        let sig = BUILTIN_FUNCTIONS.get(call.name.as_str());
        match sig {
            None => self.warn(format!("unknown function '{}'", call.name)),
            Some(sig) => {
                let arity = call.args.len();
                if arity < sig.min_args || sig.max_args.map(|m| arity > m).unwrap_or(false) {
                    return Err(DbError::ValidationError(format!(
                        "function '{}' called with {} arguments",
                        call.name, arity
                    )));
                }
                match sig.kind {
                    FunctionKind::Window if call.over.is_none() => {
                        return Err(DbError::ValidationError(format!(
                            "window function '{}' requires an OVER clause",
                            call.name
                        )));
                    }
                    FunctionKind::Aggregate if call.over.is_none() && !aggregates_allowed => {
                        return Err(DbError::ValidationError(format!(
                            "aggregate function '{}' is not allowed here",
                            call.name
                        )));
                    }
                    FunctionKind::Scalar => {
                        if call.filter.is_some() {
                            return Err(DbError::ValidationError(
                                "FILTER is only allowed with aggregate functions".to_string(),
                            ));
                        }
                        if call.over.is_some() {
                            return Err(DbError::ValidationError(format!(
                                "function '{}' cannot take an OVER clause",
                                call.name
                            )));
                        }
                    }
                    _ => {}
                }
                if sig.kind == FunctionKind::Aggregate && call.over.is_none() {
                    // Nested aggregates are structural errors.
                    for arg in &call.args {
                        if contains_plain_aggregate(arg) {
                            return Err(DbError::ValidationError(
                                "aggregate calls cannot be nested".to_string(),
                            ));
                        }
                    }
                }
            }
        }

        // Aggregate arguments may not nest further aggregates; scalar
        // wrappers like abs(sum(x)) keep the outer context.
        let args_allowed = match sig {
            Some(sig) if sig.kind == FunctionKind::Aggregate && call.over.is_none() => false,
            _ => aggregates_allowed,
        };
        for arg in &call.args {
            if !matches!(arg, Expr::Wildcard) {
                self.validate_expr(arg, args_allowed)?;
            }
        }
        if let Some(filter) = &call.filter {
            if contains_plain_aggregate(filter) {
                return Err(DbError::ValidationError(
                    "aggregates are not allowed inside FILTER".to_string(),
                ));
            }
            self.validate_expr(filter, false)?;
        }
        if let Some(over) = &call.over {
            for p in &over.partition_by {
                self.validate_expr(p, false)?;
            }
            for o in &over.order_by {
                self.validate_expr(&o.expr, false)?;
            }
            if let Some(frame) = &over.frame {
                if frame.start.rank() > frame.end.rank() {
                    return Err(DbError::ValidationError(
                        "window frame start must not follow its end".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Resolve innermost scope outward, so correlated subquery references
    /// find the enclosing query's tables.
    fn resolve_column(&mut self, table: Option<&str>, name: &str) {
        if self.scopes.is_empty() {
            self.warn(format!("unresolved column '{}'", name));
            return;
        }
        match table {
            Some(qualifier) => {
                let owner = self.scopes.iter().rev().find_map(|scope| {
                    scope
                        .tables
                        .iter()
                        .find(|t| t.alias.eq_ignore_ascii_case(qualifier))
                });
                match owner {
                    None => self.warn(format!("unknown table alias '{}'", qualifier)),
                    Some(t) => {
                        if let Some(columns) = &t.columns {
                            if !columns.iter().any(|c| c.eq_ignore_ascii_case(name)) {
                                self.warn(format!("unknown column '{}.{}'", qualifier, name));
                            }
                        }
                    }
                }
            }
            None => {
                let mut known_anywhere = false;
                let mut any_unknown_table = false;
                for scope in self.scopes.iter().rev() {
                    for t in &scope.tables {
                        match &t.columns {
                            Some(columns) => {
                                if columns.iter().any(|c| c.eq_ignore_ascii_case(name)) {
                                    known_anywhere = true;
                                }
                            }
                            None => any_unknown_table = true,
                        }
                    }
                }
                if !known_anywhere && !any_unknown_table {
                    self.warn(format!("unknown column '{}'", name));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // GROUP BY consistency
    // ------------------------------------------------------------------

    fn check_group_consistency(&mut self, stmt: &SelectStmt) -> Result<()> {
        let group_keys: HashSet<String> =
            stmt.group_by.iter().map(|g| g.to_string()).collect();

        // Functional determination: grouping by a table's full primary key
        // determines every column of that table.
        let determined_tables: Vec<String> = self
            .scopes
            .last()
            .map(|scope| {
                scope
                    .tables
                    .iter()
                    .filter(|t| {
                        !t.primary_key.is_empty()
                            && t.primary_key.iter().all(|pk| {
                                group_keys.contains(pk)
                                    || group_keys.contains(&format!("{}.{}", t.alias, pk))
                            })
                    })
                    .map(|t| t.alias.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        for item in &stmt.projection {
            let expr = match item {
                SelectItem::Expr { expr, .. } => expr,
                SelectItem::Wildcard | SelectItem::QualifiedWildcard(_) => {
                    return Err(DbError::ValidationError(
                        "wildcard projection is not allowed in a grouped query".to_string(),
                    ));
                }
            };
            if contains_plain_aggregate(expr) || group_keys.contains(&expr.to_string()) {
                continue;
            }
            // Every bare column must be grouped or functionally determined.
            let mut offending = None;
            walk_expr(expr, &mut |e| {
                if offending.is_some() {
                    return;
                }
                if let Expr::Column { table, name } = e {
                    let rendered = e.to_string();
                    if group_keys.contains(&rendered) || group_keys.contains(name) {
                        return;
                    }
                    let determined = table
                        .as_ref()
                        .map(|t| determined_tables.contains(&t.to_lowercase()))
                        .unwrap_or(false);
                    if !determined {
                        offending = Some(rendered);
                    }
                }
            });
            if let Some(column) = offending {
                return Err(DbError::ValidationError(format!(
                    "column '{}' must appear in GROUP BY or inside an aggregate",
                    column
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // DML / DDL
    // ------------------------------------------------------------------

    fn validate_insert(&mut self, insert: &InsertStmt) -> Result<()> {
        let schema = self.catalog.get_table(&insert.table);
        if schema.is_none() {
            self.warn(format!("unknown table '{}'", insert.table));
        }

        if let Some(schema) = &schema {
            for column in &insert.columns {
                if schema.column_index(column).is_none() {
                    return Err(DbError::ValidationError(format!(
                        "column '{}' not in table '{}'",
                        column, insert.table
                    )));
                }
            }
            if let Some(oc) = &insert.on_conflict {
                for column in &oc.target {
                    if schema.column_index(column).is_none() {
                        return Err(DbError::ValidationError(format!(
                            "conflict target '{}' not in table '{}'",
                            column, insert.table
                        )));
                    }
                }
            }
        }

        let expected_width = if insert.columns.is_empty() {
            schema.as_ref().map(|s| s.columns.len())
        } else {
            Some(insert.columns.len())
        };

        match &insert.source {
            InsertSource::Values(rows) => {
                for row in rows {
                    if let Some(width) = expected_width {
                        if row.len() != width {
                            return Err(DbError::ValidationError(format!(
                                "INSERT has {} values but expects {}",
                                row.len(),
                                width
                            )));
                        }
                    }
                    for expr in row {
                        if contains_plain_aggregate(expr) {
                            return Err(DbError::ValidationError(
                                "aggregates are not allowed in VALUES".to_string(),
                            ));
                        }
                        self.validate_expr(expr, false)?;
                    }
                }
            }
            InsertSource::Query(query) => self.validate_select(query)?,
        }

        if let Some(OnConflict {
            action:
                ConflictAction::DoUpdate {
                    assignments,
                    selection,
                },
            ..
        }) = &insert.on_conflict
        {
            self.push_table_scope(&insert.table);
            for assignment in assignments {
                self.validate_expr(&assignment.value, false)?;
            }
            if let Some(sel) = selection {
                self.validate_expr(sel, false)?;
            }
            self.scopes.pop();
        }
        Ok(())
    }

    fn validate_update(&mut self, update: &UpdateStmt) -> Result<()> {
        let schema = self.catalog.get_table(&update.table);
        if schema.is_none() {
            self.warn(format!("unknown table '{}'", update.table));
        }
        if let Some(schema) = &schema {
            for assignment in &update.assignments {
                if schema.column_index(&assignment.column).is_none() {
                    return Err(DbError::ValidationError(format!(
                        "column '{}' not in table '{}'",
                        assignment.column, update.table
                    )));
                }
            }
        }
        self.push_table_scope(&update.table);
        for assignment in &update.assignments {
            if contains_plain_aggregate(&assignment.value) {
                self.scopes.pop();
                return Err(DbError::ValidationError(
                    "aggregates are not allowed in UPDATE assignments".to_string(),
                ));
            }
            self.validate_expr(&assignment.value, false)?;
        }
        if let Some(selection) = &update.selection {
            if contains_plain_aggregate(selection) {
                self.scopes.pop();
                return Err(DbError::ValidationError(
                    "aggregate functions are not allowed in WHERE".to_string(),
                ));
            }
            self.validate_expr(selection, false)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn validate_delete(&mut self, delete: &DeleteStmt) -> Result<()> {
        if !self.catalog.table_exists(&delete.table) {
            self.warn(format!("unknown table '{}'", delete.table));
        }
        self.push_table_scope(&delete.table);
        let result = match &delete.selection {
            Some(selection) if contains_plain_aggregate(selection) => Err(
                DbError::ValidationError(
                    "aggregate functions are not allowed in WHERE".to_string(),
                ),
            ),
            Some(selection) => self.validate_expr(selection, false),
            None => Ok(()),
        };
        self.scopes.pop();
        result
    }

    fn validate_create_table(&mut self, ct: &CreateTableStmt) -> Result<()> {
        let mut names = HashSet::new();
        for column in &ct.columns {
            if !names.insert(column.name.to_lowercase()) {
                return Err(DbError::ValidationError(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
        }

        // CHECK and DEFAULT expressions must be well-formed; CHECK sees the
        // table's own columns, DEFAULT sees none.
        let own_columns: Vec<String> = ct.columns.iter().map(|c| c.name.clone()).collect();
        self.scopes.push(Scope {
            tables: vec![ScopeTable {
                alias: ct.name.clone(),
                columns: Some(own_columns),
                primary_key: Vec::new(),
            }],
        });
        for column in &ct.columns {
            if let Some(check) = &column.check {
                if contains_plain_aggregate(check) {
                    self.scopes.pop();
                    return Err(DbError::ValidationError(
                        "aggregates are not allowed in CHECK".to_string(),
                    ));
                }
                self.validate_expr(check, false)?;
            }
            if let Some(default) = &column.default {
                if contains_plain_aggregate(default) {
                    self.scopes.pop();
                    return Err(DbError::ValidationError(
                        "aggregates are not allowed in DEFAULT".to_string(),
                    ));
                }
                self.validate_expr(default, false)?;
            }
        }
        for constraint in &ct.constraints {
            match constraint {
                TableConstraint::Check(expr) => self.validate_expr(expr, false)?,
                TableConstraint::PrimaryKey(cols) | TableConstraint::Unique(cols) => {
                    for col in cols {
                        if !ct.columns.iter().any(|c| c.name.eq_ignore_ascii_case(col)) {
                            self.scopes.pop();
                            return Err(DbError::ValidationError(format!(
                                "constraint references unknown column '{}'",
                                col
                            )));
                        }
                    }
                }
                TableConstraint::ForeignKey {
                    columns,
                    ref_columns,
                    ..
                } => {
                    if columns.is_empty() || ref_columns.is_empty() {
                        self.scopes.pop();
                        return Err(DbError::ValidationError(
                            "foreign key column lists must be non-empty".to_string(),
                        ));
                    }
                }
            }
        }
        self.scopes.pop();
        Ok(())
    }

    fn push_table_scope(&mut self, table: &str) {
        let (columns, primary_key) = match self.catalog.get_table(table) {
            Some(schema) => (Some(schema.column_names()), schema.primary_key.clone()),
            None => (None, Vec::new()),
        };
        self.scopes.push(Scope {
            tables: vec![ScopeTable {
                alias: table.to_string(),
                columns,
                primary_key,
            }],
        });
    }
}

/// Output column names of a SELECT, when statically known.
fn projection_names(stmt: &SelectStmt) -> Option<Vec<String>> {
    let mut names = Vec::new();
    for item in &stmt.projection {
        match item {
            SelectItem::Expr { expr, alias } => match alias {
                Some(alias) => names.push(alias.clone()),
                None => match expr {
                    Expr::Column { name, .. } => names.push(name.clone()),
                    other => names.push(other.to_string()),
                },
            },
            _ => return None,
        }
    }
    Some(names)
}
