// Statement rewriting.
//
// A fixed-point loop over rules, each returning the possibly-rewritten
// statement and whether it changed anything:
//
//   - constant folding: literal-only subexpressions collapse to literals
//   - predicate pushdown: single-source conjuncts sink into FROM subqueries
//   - scalar-subquery folding: table-free scalar subqueries collapse
//
// Join order and access path choices live in the optimizer proper, steered
// by the enable_* settings.

use crate::execution::expressions::Evaluator;
use crate::parser::ast::*;

const MAX_PASSES: usize = 5;

pub fn rewrite_statement(stmt: Statement) -> Statement {
    let mut stmt = stmt;
    for _ in 0..MAX_PASSES {
        let mut changed = false;
        for rule in [fold_constants_rule, pushdown_rule, fold_scalar_subqueries_rule] {
            let (next, rule_changed) = rule(stmt);
            stmt = next;
            changed |= rule_changed;
        }
        if !changed {
            break;
        }
    }
    stmt
}

// ============================================================================
// Expression transformation plumbing
// ============================================================================

/// Bottom-up expression rewrite; `f` sees each node after its children.
/// Also used by the optimizer to qualify predicate columns.
pub(crate) fn map_expr(expr: Expr, f: &mut impl FnMut(Expr) -> (Expr, bool)) -> (Expr, bool) {
    let mut changed = false;
    let rebuilt = match expr {
        Expr::Binary { left, op, right } => {
            let (l, cl) = map_expr(*left, f);
            let (r, cr) = map_expr(*right, f);
            changed |= cl | cr;
            Expr::Binary {
                left: Box::new(l),
                op,
                right: Box::new(r),
            }
        }
        Expr::Unary { op, expr } => {
            let (e, c) = map_expr(*expr, f);
            changed |= c;
            Expr::Unary {
                op,
                expr: Box::new(e),
            }
        }
        Expr::Function(mut call) => {
            let mut args = Vec::with_capacity(call.args.len());
            for arg in call.args {
                let (a, c) = map_expr(arg, f);
                changed |= c;
                args.push(a);
            }
            call.args = args;
            if let Some(filter) = call.filter {
                let (e, c) = map_expr(*filter, f);
                changed |= c;
                call.filter = Some(Box::new(e));
            }
            Expr::Function(call)
        }
        Expr::Case {
            operand,
            branches,
            else_expr,
        } => {
            let operand = operand.map(|o| {
                let (e, c) = map_expr(*o, f);
                changed |= c;
                Box::new(e)
            });
            let branches = branches
                .into_iter()
                .map(|(w, t)| {
                    let (w, cw) = map_expr(w, f);
                    let (t, ct) = map_expr(t, f);
                    changed |= cw | ct;
                    (w, t)
                })
                .collect();
            let else_expr = else_expr.map(|e| {
                let (e, c) = map_expr(*e, f);
                changed |= c;
                Box::new(e)
            });
            Expr::Case {
                operand,
                branches,
                else_expr,
            }
        }
        Expr::Cast { expr, data_type } => {
            let (e, c) = map_expr(*expr, f);
            changed |= c;
            Expr::Cast {
                expr: Box::new(e),
                data_type,
            }
        }
        Expr::Extract { field, expr } => {
            let (e, c) = map_expr(*expr, f);
            changed |= c;
            Expr::Extract {
                field,
                expr: Box::new(e),
            }
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let (e, c) = map_expr(*expr, f);
            changed |= c;
            let list = list
                .into_iter()
                .map(|item| {
                    let (i, c) = map_expr(item, f);
                    changed |= c;
                    i
                })
                .collect();
            Expr::InList {
                expr: Box::new(e),
                list,
                negated,
            }
        }
        leaf => leaf,
    };
    let (out, c) = f(rebuilt);
    (out, changed | c)
}

fn map_select_exprs(
    stmt: &mut SelectStmt,
    f: &mut impl FnMut(Expr) -> (Expr, bool),
) -> bool {
    let mut changed = false;
    for cte in &mut stmt.with {
        changed |= map_select_exprs(&mut cte.query, f);
    }
    for item in &mut stmt.projection {
        if let SelectItem::Expr { expr, .. } = item {
            let (e, c) = map_expr(std::mem::replace(expr, Expr::Wildcard), f);
            *expr = e;
            changed |= c;
        }
    }
    if let Some(from) = &mut stmt.from {
        changed |= map_table_ref_exprs(from, f);
    }
    if let Some(selection) = stmt.selection.take() {
        let (e, c) = map_expr(selection, f);
        stmt.selection = Some(e);
        changed |= c;
    }
    for g in &mut stmt.group_by {
        let (e, c) = map_expr(std::mem::replace(g, Expr::Wildcard), f);
        *g = e;
        changed |= c;
    }
    if let Some(having) = stmt.having.take() {
        let (e, c) = map_expr(having, f);
        stmt.having = Some(e);
        changed |= c;
    }
    for o in &mut stmt.order_by {
        let (e, c) = map_expr(std::mem::replace(&mut o.expr, Expr::Wildcard), f);
        o.expr = e;
        changed |= c;
    }
    changed
}

fn map_table_ref_exprs(
    table_ref: &mut TableRef,
    f: &mut impl FnMut(Expr) -> (Expr, bool),
) -> bool {
    match table_ref {
        TableRef::Table { .. } => false,
        TableRef::Subquery { query, .. } => map_select_exprs(query, f),
        TableRef::Join {
            left,
            right,
            constraint,
            ..
        } => {
            let mut changed = map_table_ref_exprs(left, f);
            changed |= map_table_ref_exprs(right, f);
            if let JoinConstraint::On(expr) = constraint {
                let (e, c) = map_expr(std::mem::replace(expr, Expr::Wildcard), f);
                *expr = e;
                changed |= c;
            }
            changed
        }
    }
}

// ============================================================================
// Rules
// ============================================================================

fn fold_constants_rule(stmt: Statement) -> (Statement, bool) {
    let mut fold = |expr: Expr| -> (Expr, bool) {
        match &expr {
            Expr::Binary { left, right, .. } => {
                if matches!(**left, Expr::Literal(_)) && matches!(**right, Expr::Literal(_)) {
                    if let Ok(v) = Evaluator::eval_const(&expr) {
                        return (Expr::Literal(v), true);
                    }
                }
                (expr, false)
            }
            Expr::Unary { expr: inner, .. } => {
                if matches!(**inner, Expr::Literal(_)) {
                    if let Ok(v) = Evaluator::eval_const(&expr) {
                        return (Expr::Literal(v), true);
                    }
                }
                (expr, false)
            }
            Expr::Cast { expr: inner, .. } => {
                if matches!(**inner, Expr::Literal(_)) {
                    if let Ok(v) = Evaluator::eval_const(&expr) {
                        return (Expr::Literal(v), true);
                    }
                }
                (expr, false)
            }
            _ => (expr, false),
        }
    };

    map_statement(stmt, &mut fold)
}

/// Fold `(SELECT <literal>)` with no FROM into the literal itself.
fn fold_scalar_subqueries_rule(stmt: Statement) -> (Statement, bool) {
    let mut fold = |expr: Expr| -> (Expr, bool) {
        if let Expr::Subquery(query) = &expr {
            if query.from.is_none()
                && query.with.is_empty()
                && query.selection.is_none()
                && query.group_by.is_empty()
                && query.projection.len() == 1
            {
                if let SelectItem::Expr {
                    expr: Expr::Literal(v),
                    ..
                } = &query.projection[0]
                {
                    return (Expr::Literal(v.clone()), true);
                }
            }
        }
        (expr, false)
    };
    map_statement(stmt, &mut fold)
}

fn map_statement(stmt: Statement, f: &mut impl FnMut(Expr) -> (Expr, bool)) -> (Statement, bool) {
    match stmt {
        Statement::Select(mut select) => {
            let changed = map_select_exprs(&mut select, f);
            (Statement::Select(select), changed)
        }
        Statement::Insert(mut insert) => {
            let mut changed = false;
            match &mut insert.source {
                InsertSource::Values(rows) => {
                    for row in rows {
                        for expr in row {
                            let (e, c) = map_expr(std::mem::replace(expr, Expr::Wildcard), f);
                            *expr = e;
                            changed |= c;
                        }
                    }
                }
                InsertSource::Query(query) => changed |= map_select_exprs(query, f),
            }
            (Statement::Insert(insert), changed)
        }
        Statement::Update(mut update) => {
            let mut changed = false;
            for assignment in &mut update.assignments {
                let (e, c) = map_expr(
                    std::mem::replace(&mut assignment.value, Expr::Wildcard),
                    f,
                );
                assignment.value = e;
                changed |= c;
            }
            if let Some(selection) = update.selection.take() {
                let (e, c) = map_expr(selection, f);
                update.selection = Some(e);
                changed |= c;
            }
            (Statement::Update(update), changed)
        }
        Statement::Delete(mut delete) => {
            let mut changed = false;
            if let Some(selection) = delete.selection.take() {
                let (e, c) = map_expr(selection, f);
                delete.selection = Some(e);
                changed |= c;
            }
            (Statement::Delete(delete), changed)
        }
        other => (other, false),
    }
}

/// Push single-source conjuncts of the outer WHERE into subquery FROM
/// items, when the subquery is plain enough that filtering inside cannot
/// change results (no grouping, limit, or distinct) and the referenced
/// projection items are simple columns.
fn pushdown_rule(stmt: Statement) -> (Statement, bool) {
    match stmt {
        Statement::Select(mut select) => {
            let changed = pushdown_into_select(&mut select);
            (Statement::Select(select), changed)
        }
        other => (other, false),
    }
}

fn pushdown_into_select(select: &mut SelectStmt) -> bool {
    let mut changed = false;
    for cte in &mut select.with {
        changed |= pushdown_into_select(&mut cte.query);
    }
    if let Some(from) = &mut select.from {
        changed |= pushdown_into_table_ref(from);
    }

    let Some(selection) = select.selection.take() else {
        return changed;
    };
    let Some(from) = &mut select.from else {
        select.selection = Some(selection);
        return changed;
    };

    let mut keep: Vec<Expr> = Vec::new();
    for conjunct in conjuncts(&selection) {
        if push_conjunct(from, &conjunct) {
            changed = true;
        } else {
            keep.push(conjunct);
        }
    }
    select.selection = conjoin(keep);
    changed
}

fn pushdown_into_table_ref(table_ref: &mut TableRef) -> bool {
    match table_ref {
        TableRef::Table { .. } => false,
        TableRef::Subquery { query, .. } => pushdown_into_select(query),
        TableRef::Join { left, right, .. } => {
            let mut changed = pushdown_into_table_ref(left);
            changed |= pushdown_into_table_ref(right);
            changed
        }
    }
}

/// Try to sink one conjunct into a matching subquery source. Returns true
/// when absorbed (the caller drops it).
fn push_conjunct(table_ref: &mut TableRef, conjunct: &Expr) -> bool {
    match table_ref {
        TableRef::Table { .. } => false,
        TableRef::Join { left, right, .. } => {
            push_conjunct(left, conjunct) || push_conjunct(right, conjunct)
        }
        TableRef::Subquery { query, alias } => {
            if !query.group_by.is_empty()
                || query.having.is_some()
                || query.distinct
                || query.limit.is_some()
                || query.offset.is_some()
            {
                return false;
            }
            // Every column in the conjunct must be qualified by this alias
            // and project a plain column we can substitute.
            let mut ok = true;
            walk_expr(conjunct, &mut |e| {
                if let Expr::Column { table, name } = e {
                    let qualified_here =
                        table.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(alias));
                    if !qualified_here || resolve_projection(query, name).is_none() {
                        ok = false;
                    }
                }
            });
            if !ok {
                return false;
            }

            let (rewritten, _) = map_expr(conjunct.clone(), &mut |e| match &e {
                Expr::Column { table, name }
                    if table.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(alias)) =>
                {
                    (
                        resolve_projection(query, name).expect("checked above"),
                        true,
                    )
                }
                _ => (e, false),
            });

            query.selection = conjoin(
                query
                    .selection
                    .take()
                    .into_iter()
                    .chain(std::iter::once(rewritten))
                    .collect(),
            );
            true
        }
    }
}

/// The underlying expression a subquery projects under `name`, when it is a
/// simple column or aliased expression.
fn resolve_projection(query: &SelectStmt, name: &str) -> Option<Expr> {
    for item in &query.projection {
        if let SelectItem::Expr { expr, alias } = item {
            let matches = match alias {
                Some(a) => a.eq_ignore_ascii_case(name),
                None => matches!(expr, Expr::Column { name: n, .. } if n.eq_ignore_ascii_case(name)),
            };
            if matches {
                return Some(expr.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn rewrite(sql: &str) -> String {
        rewrite_statement(Parser::parse_one(sql).unwrap()).to_string()
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(
            rewrite("SELECT a FROM t WHERE a > 1 + 2"),
            "SELECT a FROM t WHERE (a > 3)"
        );
        assert_eq!(rewrite("SELECT 2 * 3 + 1"), "SELECT 7");
        assert_eq!(rewrite("SELECT -(2)"), "SELECT -2");
    }

    #[test]
    fn test_folding_reaches_fixed_point() {
        // Nested folds need multiple bottom-up passes within one walk.
        assert_eq!(rewrite("SELECT (1 + 2) * (3 + 4)"), "SELECT 21");
    }

    #[test]
    fn test_fold_preserves_columns() {
        assert_eq!(
            rewrite("SELECT a + 1 FROM t"),
            "SELECT (a + 1) FROM t"
        );
    }

    #[test]
    fn test_scalar_subquery_fold() {
        assert_eq!(rewrite("SELECT a FROM t WHERE a = (SELECT 5)"), "SELECT a FROM t WHERE (a = 5)");
    }

    #[test]
    fn test_predicate_pushdown_into_subquery() {
        let out = rewrite("SELECT * FROM (SELECT id, v FROM raw) AS s WHERE s.id > 10");
        assert_eq!(
            out,
            "SELECT * FROM (SELECT id, v FROM raw WHERE (id > 10)) AS s"
        );
    }

    #[test]
    fn test_pushdown_respects_grouping_fence() {
        let sql =
            "SELECT * FROM (SELECT id, count(*) AS n FROM raw GROUP BY id) AS s WHERE s.id > 10";
        let out = rewrite(sql);
        // The filter must stay outside the grouped subquery.
        assert!(out.contains("AS s WHERE"));
    }

    #[test]
    fn test_pushdown_through_alias() {
        let out = rewrite(
            "SELECT * FROM (SELECT id AS key FROM raw) AS s WHERE s.key = 3",
        );
        assert_eq!(out, "SELECT * FROM (SELECT id AS key FROM raw WHERE (id = 3)) AS s");
    }

    #[test]
    fn test_mixed_conjuncts_split() {
        let out = rewrite(
            "SELECT * FROM (SELECT id FROM raw) AS s WHERE s.id > 1 AND other = 2",
        );
        assert!(out.contains("WHERE (id > 1)"));
        assert!(out.contains("AS s WHERE (other = 2)"));
    }
}
