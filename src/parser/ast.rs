// Abstract syntax tree.
//
// A closed set of statement and expression variants with exhaustive
// matching everywhere; adding a kind is a compile-time additive change.
// Every node can stringify (`Display`) such that re-parsing the rendered
// text yields a semantically equivalent tree, and `walk_expr`/`walk_select`
// provide the traversal the validator and rewriter build on.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::DataType;
use crate::common::Value;
use crate::storage::StorageType;
use crate::transaction::types::IsolationLevel;

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(Box<SelectStmt>),
    Insert(InsertStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    CreateTable(CreateTableStmt),
    DropTable { name: String, if_exists: bool },
    CreateIndex(CreateIndexStmt),
    DropIndex { name: String },
    Begin {
        isolation: Option<IsolationLevel>,
        read_only: Option<bool>,
    },
    Commit { chain: bool },
    Rollback {
        savepoint: Option<String>,
        chain: bool,
    },
    Savepoint { name: String },
    ReleaseSavepoint { name: String },
    Explain(Box<Statement>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectStmt {
    pub with: Vec<Cte>,
    pub distinct: bool,
    pub projection: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectStmt {
    pub fn empty() -> Self {
        Self {
            with: Vec::new(),
            distinct: false,
            projection: Vec::new(),
            from: None,
            selection: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cte {
    pub name: String,
    pub columns: Vec<String>,
    pub query: Box<SelectStmt>,
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectItem {
    Wildcard,
    QualifiedWildcard(String),
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableRef {
    Table {
        name: String,
        alias: Option<String>,
    },
    Subquery {
        query: Box<SelectStmt>,
        alias: String,
    },
    Join {
        left: Box<TableRef>,
        right: Box<TableRef>,
        join_type: JoinType,
        constraint: JoinConstraint,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER JOIN"),
            JoinType::Left => write!(f, "LEFT JOIN"),
            JoinType::Right => write!(f, "RIGHT JOIN"),
            JoinType::Full => write!(f, "FULL JOIN"),
            JoinType::Cross => write!(f, "CROSS JOIN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JoinConstraint {
    On(Expr),
    Using(Vec<String>),
    Natural,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStmt {
    pub table: String,
    pub columns: Vec<String>,
    pub source: InsertSource,
    pub on_conflict: Option<OnConflict>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InsertSource {
    Values(Vec<Vec<Expr>>),
    Query(Box<SelectStmt>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnConflict {
    pub target: Vec<String>,
    pub action: ConflictAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConflictAction {
    DoNothing,
    DoUpdate {
        assignments: Vec<Assignment>,
        selection: Option<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStmt {
    pub table: String,
    pub assignments: Vec<Assignment>,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStmt {
    pub table: String,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTableStmt {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<TableConstraint>,
    pub engine: Option<StorageType>,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub default: Option<Expr>,
    pub check: Option<Expr>,
    pub references: Option<(String, Option<String>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableConstraint {
    PrimaryKey(Vec<String>),
    Unique(Vec<String>),
    Check(Expr),
    ForeignKey {
        columns: Vec<String>,
        ref_table: String,
        ref_columns: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateIndexStmt {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    Column {
        table: Option<String>,
        name: String,
    },
    /// Only valid as a lone function argument (COUNT(*)).
    Wildcard,
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Function(FunctionCall),
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    Cast {
        expr: Box<Expr>,
        data_type: DataType,
    },
    Extract {
        field: String,
        expr: Box<Expr>,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        query: Box<SelectStmt>,
        negated: bool,
    },
    Exists {
        query: Box<SelectStmt>,
        negated: bool,
    },
    /// Scalar subquery.
    Subquery(Box<SelectStmt>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<Expr>,
    pub distinct: bool,
    pub filter: Option<Box<Expr>>,
    pub over: Option<WindowSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    ILike,
    Is,
    IsNot,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Concat,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
                | BinaryOp::Like
                | BinaryOp::ILike
                | BinaryOp::Is
                | BinaryOp::IsNot
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Or => "OR",
            BinaryOp::And => "AND",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Like => "LIKE",
            BinaryOp::ILike => "ILIKE",
            BinaryOp::Is => "IS",
            BinaryOp::IsNot => "IS NOT",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Concat => "||",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Minus,
    Plus,
    BitwiseNot,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Not => write!(f, "NOT "),
            UnaryOp::Minus => write!(f, "-"),
            UnaryOp::Plus => write!(f, "+"),
            UnaryOp::BitwiseNot => write!(f, "~"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByExpr {
    pub expr: Expr,
    pub asc: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub frame: Option<WindowFrame>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowFrame {
    pub units: FrameUnits,
    pub start: FrameBound,
    pub end: FrameBound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameUnits {
    Rows,
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBound {
    UnboundedPreceding,
    Preceding(u64),
    CurrentRow,
    Following(u64),
    UnboundedFollowing,
}

impl FrameBound {
    /// Ordering rank used by the validator: start must not follow end.
    pub fn rank(&self) -> i64 {
        match self {
            FrameBound::UnboundedPreceding => i64::MIN,
            FrameBound::Preceding(n) => -(*n as i64),
            FrameBound::CurrentRow => 0,
            FrameBound::Following(n) => *n as i64,
            FrameBound::UnboundedFollowing => i64::MAX,
        }
    }
}

// ============================================================================
// Visitor walks
// ============================================================================

/// Pre-order walk over an expression tree, including subquery bodies.
pub fn walk_expr(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    match expr {
        Expr::Literal(_) | Expr::Column { .. } | Expr::Wildcard => {}
        Expr::Binary { left, right, .. } => {
            walk_expr(left, f);
            walk_expr(right, f);
        }
        Expr::Unary { expr, .. } => walk_expr(expr, f),
        Expr::Function(call) => {
            for arg in &call.args {
                walk_expr(arg, f);
            }
            if let Some(filter) = &call.filter {
                walk_expr(filter, f);
            }
            if let Some(over) = &call.over {
                for p in &over.partition_by {
                    walk_expr(p, f);
                }
                for o in &over.order_by {
                    walk_expr(&o.expr, f);
                }
            }
        }
        Expr::Case {
            operand,
            branches,
            else_expr,
        } => {
            if let Some(op) = operand {
                walk_expr(op, f);
            }
            for (when, then) in branches {
                walk_expr(when, f);
                walk_expr(then, f);
            }
            if let Some(e) = else_expr {
                walk_expr(e, f);
            }
        }
        Expr::Cast { expr, .. } => walk_expr(expr, f),
        Expr::Extract { expr, .. } => walk_expr(expr, f),
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, f);
            for item in list {
                walk_expr(item, f);
            }
        }
        Expr::InSubquery { expr, query, .. } => {
            walk_expr(expr, f);
            walk_select_exprs(query, f);
        }
        Expr::Exists { query, .. } => walk_select_exprs(query, f),
        Expr::Subquery(query) => walk_select_exprs(query, f),
    }
}

/// Walk every expression reachable from a SELECT, subqueries included.
pub fn walk_select_exprs(stmt: &SelectStmt, f: &mut impl FnMut(&Expr)) {
    for cte in &stmt.with {
        walk_select_exprs(&cte.query, f);
    }
    for item in &stmt.projection {
        if let SelectItem::Expr { expr, .. } = item {
            walk_expr(expr, f);
        }
    }
    if let Some(from) = &stmt.from {
        walk_table_ref_exprs(from, f);
    }
    if let Some(sel) = &stmt.selection {
        walk_expr(sel, f);
    }
    for g in &stmt.group_by {
        walk_expr(g, f);
    }
    if let Some(h) = &stmt.having {
        walk_expr(h, f);
    }
    for o in &stmt.order_by {
        walk_expr(&o.expr, f);
    }
}

fn walk_table_ref_exprs(table_ref: &TableRef, f: &mut impl FnMut(&Expr)) {
    match table_ref {
        TableRef::Table { .. } => {}
        TableRef::Subquery { query, .. } => walk_select_exprs(query, f),
        TableRef::Join {
            left,
            right,
            constraint,
            ..
        } => {
            walk_table_ref_exprs(left, f);
            walk_table_ref_exprs(right, f);
            if let JoinConstraint::On(expr) = constraint {
                walk_expr(expr, f);
            }
        }
    }
}

/// Split a predicate into its top-level AND conjuncts.
pub fn conjuncts(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => {
            let mut out = conjuncts(left);
            out.extend(conjuncts(right));
            out
        }
        other => vec![other.clone()],
    }
}

/// Rebuild a conjunction from parts; `None` when empty.
pub fn conjoin(parts: Vec<Expr>) -> Option<Expr> {
    parts.into_iter().reduce(|acc, next| Expr::Binary {
        left: Box::new(acc),
        op: BinaryOp::And,
        right: Box::new(next),
    })
}

// ============================================================================
// Stringify
// ============================================================================

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Column { table, name } => match table {
                Some(t) => write!(f, "{}.{}", t, name),
                None => write!(f, "{}", name),
            },
            Expr::Wildcard => write!(f, "*"),
            // Binary and unary nodes always parenthesise so the rendered
            // text re-parses to the identical tree.
            Expr::Binary { left, op, right } => write!(f, "({} {} {})", left, op, right),
            Expr::Unary { op, expr } => write!(f, "({}{})", op, expr),
            Expr::Function(call) => write!(f, "{}", call),
            Expr::Case {
                operand,
                branches,
                else_expr,
            } => {
                write!(f, "CASE")?;
                if let Some(op) = operand {
                    write!(f, " {}", op)?;
                }
                for (when, then) in branches {
                    write!(f, " WHEN {} THEN {}", when, then)?;
                }
                if let Some(e) = else_expr {
                    write!(f, " ELSE {}", e)?;
                }
                write!(f, " END")
            }
            Expr::Cast { expr, data_type } => write!(f, "CAST({} AS {})", expr, data_type),
            Expr::Extract { field, expr } => write!(f, "EXTRACT({} FROM {})", field, expr),
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                write!(
                    f,
                    "({} {}IN ({}))",
                    expr,
                    if *negated { "NOT " } else { "" },
                    join_display(list, ", ")
                )
            }
            Expr::InSubquery {
                expr,
                query,
                negated,
            } => write!(
                f,
                "({} {}IN ({}))",
                expr,
                if *negated { "NOT " } else { "" },
                query
            ),
            Expr::Exists { query, negated } => {
                write!(
                    f,
                    "({}EXISTS ({}))",
                    if *negated { "NOT " } else { "" },
                    query
                )
            }
            Expr::Subquery(query) => write!(f, "({})", query),
        }
    }
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        if self.distinct {
            write!(f, "DISTINCT ")?;
        }
        write!(f, "{})", join_display(&self.args, ", "))?;
        if let Some(filter) = &self.filter {
            write!(f, " FILTER (WHERE {})", filter)?;
        }
        if let Some(over) = &self.over {
            write!(f, " OVER ({})", over)?;
        }
        Ok(())
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        if !self.partition_by.is_empty() {
            write!(f, "PARTITION BY {}", join_display(&self.partition_by, ", "))?;
            wrote = true;
        }
        if !self.order_by.is_empty() {
            if wrote {
                write!(f, " ")?;
            }
            write!(f, "ORDER BY {}", join_display(&self.order_by, ", "))?;
            wrote = true;
        }
        if let Some(frame) = &self.frame {
            if wrote {
                write!(f, " ")?;
            }
            write!(f, "{}", frame)?;
        }
        Ok(())
    }
}

impl fmt::Display for WindowFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = match self.units {
            FrameUnits::Rows => "ROWS",
            FrameUnits::Range => "RANGE",
        };
        write!(f, "{} BETWEEN {} AND {}", units, self.start, self.end)
    }
}

impl fmt::Display for FrameBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameBound::UnboundedPreceding => write!(f, "UNBOUNDED PRECEDING"),
            FrameBound::Preceding(n) => write!(f, "{} PRECEDING", n),
            FrameBound::CurrentRow => write!(f, "CURRENT ROW"),
            FrameBound::Following(n) => write!(f, "{} FOLLOWING", n),
            FrameBound::UnboundedFollowing => write!(f, "UNBOUNDED FOLLOWING"),
        }
    }
}

impl fmt::Display for OrderByExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.expr, if self.asc { "ASC" } else { "DESC" })
    }
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectItem::Wildcard => write!(f, "*"),
            SelectItem::QualifiedWildcard(t) => write!(f, "{}.*", t),
            SelectItem::Expr { expr, alias } => match alias {
                Some(a) => write!(f, "{} AS {}", expr, a),
                None => write!(f, "{}", expr),
            },
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableRef::Table { name, alias } => match alias {
                Some(a) => write!(f, "{} AS {}", name, a),
                None => write!(f, "{}", name),
            },
            TableRef::Subquery { query, alias } => write!(f, "({}) AS {}", query, alias),
            TableRef::Join {
                left,
                right,
                join_type,
                constraint,
            } => {
                write!(f, "{}", left)?;
                match constraint {
                    JoinConstraint::Natural => write!(f, " NATURAL {} {}", join_type, right),
                    JoinConstraint::On(expr) => {
                        write!(f, " {} {} ON {}", join_type, right, expr)
                    }
                    JoinConstraint::Using(cols) => {
                        write!(f, " {} {} USING ({})", join_type, right, cols.join(", "))
                    }
                    JoinConstraint::None => write!(f, " {} {}", join_type, right),
                }
            }
        }
    }
}

impl fmt::Display for SelectStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.with.is_empty() {
            write!(f, "WITH ")?;
            if self.with.iter().any(|c| c.recursive) {
                write!(f, "RECURSIVE ")?;
            }
            for (i, cte) in self.with.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", cte.name)?;
                if !cte.columns.is_empty() {
                    write!(f, " ({})", cte.columns.join(", "))?;
                }
                write!(f, " AS ({})", cte.query)?;
            }
            write!(f, " ")?;
        }
        write!(f, "SELECT ")?;
        if self.distinct {
            write!(f, "DISTINCT ")?;
        }
        write!(f, "{}", join_display(&self.projection, ", "))?;
        if let Some(from) = &self.from {
            write!(f, " FROM {}", from)?;
        }
        if let Some(sel) = &self.selection {
            write!(f, " WHERE {}", sel)?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", join_display(&self.group_by, ", "))?;
        }
        if let Some(having) = &self.having {
            write!(f, " HAVING {}", having)?;
        }
        if !self.order_by.is_empty() {
            write!(f, " ORDER BY {}", join_display(&self.order_by, ", "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {}", offset)?;
        }
        Ok(())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(s) => write!(f, "{}", s),
            Statement::Insert(s) => {
                write!(f, "INSERT INTO {}", s.table)?;
                if !s.columns.is_empty() {
                    write!(f, " ({})", s.columns.join(", "))?;
                }
                match &s.source {
                    InsertSource::Values(rows) => {
                        write!(f, " VALUES ")?;
                        for (i, row) in rows.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "({})", join_display(row, ", "))?;
                        }
                    }
                    InsertSource::Query(q) => write!(f, " {}", q)?,
                }
                if let Some(oc) = &s.on_conflict {
                    write!(f, " ON CONFLICT")?;
                    if !oc.target.is_empty() {
                        write!(f, " ({})", oc.target.join(", "))?;
                    }
                    match &oc.action {
                        ConflictAction::DoNothing => write!(f, " DO NOTHING")?,
                        ConflictAction::DoUpdate {
                            assignments,
                            selection,
                        } => {
                            write!(f, " DO UPDATE SET {}", join_display(assignments, ", "))?;
                            if let Some(sel) = selection {
                                write!(f, " WHERE {}", sel)?;
                            }
                        }
                    }
                }
                Ok(())
            }
            Statement::Update(s) => {
                write!(
                    f,
                    "UPDATE {} SET {}",
                    s.table,
                    join_display(&s.assignments, ", ")
                )?;
                if let Some(sel) = &s.selection {
                    write!(f, " WHERE {}", sel)?;
                }
                Ok(())
            }
            Statement::Delete(s) => {
                write!(f, "DELETE FROM {}", s.table)?;
                if let Some(sel) = &s.selection {
                    write!(f, " WHERE {}", sel)?;
                }
                Ok(())
            }
            Statement::CreateTable(s) => {
                write!(f, "CREATE TABLE ")?;
                if s.if_not_exists {
                    write!(f, "IF NOT EXISTS ")?;
                }
                write!(f, "{} (", s.name)?;
                for (i, col) in s.columns.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} {}", col.name, col.data_type)?;
                    if col.primary_key {
                        write!(f, " PRIMARY KEY")?;
                    }
                    if !col.nullable {
                        write!(f, " NOT NULL")?;
                    }
                    if col.unique {
                        write!(f, " UNIQUE")?;
                    }
                    if let Some(d) = &col.default {
                        write!(f, " DEFAULT {}", d)?;
                    }
                    if let Some(c) = &col.check {
                        write!(f, " CHECK ({})", c)?;
                    }
                    if let Some((t, c)) = &col.references {
                        write!(f, " REFERENCES {}", t)?;
                        if let Some(c) = c {
                            write!(f, " ({})", c)?;
                        }
                    }
                }
                for constraint in &s.constraints {
                    write!(f, ", ")?;
                    match constraint {
                        TableConstraint::PrimaryKey(cols) => {
                            write!(f, "PRIMARY KEY ({})", cols.join(", "))?
                        }
                        TableConstraint::Unique(cols) => {
                            write!(f, "UNIQUE ({})", cols.join(", "))?
                        }
                        TableConstraint::Check(expr) => write!(f, "CHECK ({})", expr)?,
                        TableConstraint::ForeignKey {
                            columns,
                            ref_table,
                            ref_columns,
                        } => write!(
                            f,
                            "FOREIGN KEY ({}) REFERENCES {} ({})",
                            columns.join(", "),
                            ref_table,
                            ref_columns.join(", ")
                        )?,
                    }
                }
                write!(f, ")")?;
                if let Some(engine) = s.engine {
                    write!(f, " ENGINE = {}", engine)?;
                }
                Ok(())
            }
            Statement::DropTable { name, if_exists } => {
                write!(f, "DROP TABLE ")?;
                if *if_exists {
                    write!(f, "IF EXISTS ")?;
                }
                write!(f, "{}", name)
            }
            Statement::CreateIndex(s) => {
                write!(f, "CREATE ")?;
                if s.unique {
                    write!(f, "UNIQUE ")?;
                }
                write!(
                    f,
                    "INDEX {} ON {} ({})",
                    s.name,
                    s.table,
                    s.columns.join(", ")
                )
            }
            Statement::DropIndex { name } => write!(f, "DROP INDEX {}", name),
            Statement::Begin {
                isolation,
                read_only,
            } => {
                write!(f, "BEGIN")?;
                if let Some(level) = isolation {
                    write!(f, " ISOLATION LEVEL {}", level)?;
                }
                match read_only {
                    Some(true) => write!(f, " READ ONLY")?,
                    Some(false) => write!(f, " READ WRITE")?,
                    None => {}
                }
                Ok(())
            }
            Statement::Commit { chain } => {
                write!(f, "COMMIT")?;
                if *chain {
                    write!(f, " AND CHAIN")?;
                }
                Ok(())
            }
            Statement::Rollback { savepoint, chain } => {
                write!(f, "ROLLBACK")?;
                if let Some(name) = savepoint {
                    write!(f, " TO SAVEPOINT {}", name)?;
                }
                if *chain {
                    write!(f, " AND CHAIN")?;
                }
                Ok(())
            }
            Statement::Savepoint { name } => write!(f, "SAVEPOINT {}", name),
            Statement::ReleaseSavepoint { name } => write!(f, "RELEASE SAVEPOINT {}", name),
            Statement::Explain(inner) => write!(f, "EXPLAIN {}", inner),
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.column, self.value)
    }
}

fn join_display<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str) -> Expr {
        Expr::Column {
            table: None,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_expr_display_parenthesises() {
        let expr = Expr::Binary {
            left: Box::new(col("a")),
            op: BinaryOp::Plus,
            right: Box::new(Expr::Literal(Value::Integer(1))),
        };
        assert_eq!(expr.to_string(), "(a + 1)");
    }

    #[test]
    fn test_conjuncts_flatten() {
        let expr = Expr::Binary {
            left: Box::new(Expr::Binary {
                left: Box::new(col("a")),
                op: BinaryOp::And,
                right: Box::new(col("b")),
            }),
            op: BinaryOp::And,
            right: Box::new(col("c")),
        };
        let parts = conjuncts(&expr);
        assert_eq!(parts.len(), 3);
        let rebuilt = conjoin(parts).unwrap();
        assert_eq!(conjuncts(&rebuilt).len(), 3);
    }

    #[test]
    fn test_walk_expr_visits_all() {
        let expr = Expr::Binary {
            left: Box::new(col("a")),
            op: BinaryOp::Eq,
            right: Box::new(Expr::Function(FunctionCall {
                name: "abs".to_string(),
                args: vec![col("b")],
                distinct: false,
                filter: None,
                over: None,
            })),
        };
        let mut count = 0;
        walk_expr(&expr, &mut |_| count += 1);
        assert_eq!(count, 4);
    }

    #[test]
    fn test_frame_bound_rank_ordering() {
        assert!(FrameBound::UnboundedPreceding.rank() < FrameBound::Preceding(5).rank());
        assert!(FrameBound::Preceding(5).rank() < FrameBound::CurrentRow.rank());
        assert!(FrameBound::CurrentRow.rank() < FrameBound::Following(1).rank());
        assert!(FrameBound::Following(1).rank() < FrameBound::UnboundedFollowing.rank());
    }
}
