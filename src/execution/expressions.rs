// Expression evaluation over row contexts.
//
// Evaluation is SQL three-valued: comparisons against NULL yield NULL, and
// NULL is not true as a predicate. Aggregate results reach the evaluator as
// columns named by the aggregate's rendered form ("count(*)"), so any
// expression that appears verbatim in the input schema short-circuits to
// that column.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::catalog::DataType;
use crate::common::Value;
use crate::error::{DbError, Result};
use crate::parser::ast::{BinaryOp, Expr, FunctionCall, SelectStmt, UnaryOp};

/// Executes a nested SELECT for subquery expressions. The outer row is
/// passed so correlated references resolve.
pub trait SubqueryRunner: Send + Sync {
    fn run(
        &self,
        query: &SelectStmt,
        outer_columns: &[String],
        outer_values: &[Value],
    ) -> Result<Vec<Vec<Value>>>;
}

#[derive(Clone, Default)]
pub struct Evaluator {
    pub subqueries: Option<Arc<dyn SubqueryRunner>>,
    /// Fallback scope for correlated subqueries: the outer row.
    pub outer: Option<(Vec<String>, Vec<Value>)>,
}

/// Resolve a name against a schema of possibly-qualified column names.
pub fn lookup_column(columns: &[String], key: &str) -> Option<usize> {
    if let Some(idx) = columns.iter().position(|c| c.eq_ignore_ascii_case(key)) {
        return Some(idx);
    }
    if !key.contains('.') {
        // Unqualified request against qualified schema.
        return columns
            .iter()
            .position(|c| c.rsplit('.').next().is_some_and(|last| last.eq_ignore_ascii_case(key)));
    }
    // Qualified request against an unqualified schema.
    let suffix = key.rsplit('.').next().unwrap_or(key);
    columns
        .iter()
        .position(|c| !c.contains('.') && c.eq_ignore_ascii_case(suffix))
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subqueries(runner: Arc<dyn SubqueryRunner>) -> Self {
        Self {
            subqueries: Some(runner),
            outer: None,
        }
    }

    /// Evaluate with no row context; fails on any column reference. Used by
    /// the constant-folding rewrite.
    pub fn eval_const(expr: &Expr) -> Result<Value> {
        Evaluator::default().eval(expr, &[], &[])
    }

    pub fn eval(&self, expr: &Expr, columns: &[String], values: &[Value]) -> Result<Value> {
        // Expression-as-column: aggregate and window results are injected
        // into the schema under their rendered names.
        if !matches!(expr, Expr::Literal(_) | Expr::Column { .. } | Expr::Wildcard) {
            if let Some(idx) = lookup_column(columns, &expr.to_string()) {
                return Ok(values[idx].clone());
            }
        }

        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Column { table, name } => {
                let key = match table {
                    Some(t) => format!("{}.{}", t, name),
                    None => name.clone(),
                };
                if let Some(idx) = lookup_column(columns, &key) {
                    return Ok(values[idx].clone());
                }
                if let Some((outer_cols, outer_vals)) = &self.outer {
                    if let Some(idx) = lookup_column(outer_cols, &key) {
                        return Ok(outer_vals[idx].clone());
                    }
                }
                Err(DbError::Execution(format!("column '{}' not found", key)))
            }
            Expr::Wildcard => Err(DbError::Execution(
                "'*' is only valid as an aggregate argument".to_string(),
            )),
            Expr::Binary { left, op, right } => self.eval_binary(left, *op, right, columns, values),
            Expr::Unary { op, expr } => {
                let v = self.eval(expr, columns, values)?;
                self.eval_unary(*op, v)
            }
            Expr::Case {
                operand,
                branches,
                else_expr,
            } => {
                let operand_value = operand
                    .as_ref()
                    .map(|e| self.eval(e, columns, values))
                    .transpose()?;
                for (when, then) in branches {
                    let matched = match &operand_value {
                        Some(op_value) => {
                            let when_value = self.eval(when, columns, values)?;
                            op_value.compare(&when_value) == Some(Ordering::Equal)
                        }
                        None => self.eval(when, columns, values)?.is_true(),
                    };
                    if matched {
                        return self.eval(then, columns, values);
                    }
                }
                match else_expr {
                    Some(e) => self.eval(e, columns, values),
                    None => Ok(Value::Null),
                }
            }
            Expr::Cast { expr, data_type } => {
                let v = self.eval(expr, columns, values)?;
                cast_value(v, *data_type)
            }
            Expr::Extract { field, expr } => {
                let v = self.eval(expr, columns, values)?;
                extract_field(field, v)
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let needle = self.eval(expr, columns, values)?;
                if needle.is_null() {
                    return Ok(Value::Null);
                }
                let mut saw_null = false;
                for item in list {
                    let candidate = self.eval(item, columns, values)?;
                    if candidate.is_null() {
                        saw_null = true;
                    } else if needle.compare(&candidate) == Some(Ordering::Equal) {
                        return Ok(Value::Boolean(!negated));
                    }
                }
                if saw_null {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Boolean(*negated))
                }
            }
            Expr::InSubquery {
                expr,
                query,
                negated,
            } => {
                let needle = self.eval(expr, columns, values)?;
                if needle.is_null() {
                    return Ok(Value::Null);
                }
                let rows = self.run_subquery(query, columns, values)?;
                let mut saw_null = false;
                for row in &rows {
                    match row.first() {
                        Some(Value::Null) => saw_null = true,
                        Some(v) if needle.compare(v) == Some(Ordering::Equal) => {
                            return Ok(Value::Boolean(!negated));
                        }
                        _ => {}
                    }
                }
                if saw_null {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Boolean(*negated))
                }
            }
            Expr::Exists { query, negated } => {
                let rows = self.run_subquery(query, columns, values)?;
                Ok(Value::Boolean(rows.is_empty() == *negated))
            }
            Expr::Subquery(query) => {
                let rows = self.run_subquery(query, columns, values)?;
                match rows.len() {
                    0 => Ok(Value::Null),
                    1 => Ok(rows[0].first().cloned().unwrap_or(Value::Null)),
                    n => Err(DbError::Execution(format!(
                        "scalar subquery returned {} rows",
                        n
                    ))),
                }
            }
            Expr::Function(call) => self.eval_scalar_function(call, columns, values),
        }
    }

    fn run_subquery(
        &self,
        query: &SelectStmt,
        columns: &[String],
        values: &[Value],
    ) -> Result<Vec<Vec<Value>>> {
        let Some(runner) = &self.subqueries else {
            return Err(DbError::Execution(
                "subqueries are not available in this context".to_string(),
            ));
        };
        runner.run(query, columns, values)
    }

    fn eval_binary(
        &self,
        left: &Expr,
        op: BinaryOp,
        right: &Expr,
        columns: &[String],
        values: &[Value],
    ) -> Result<Value> {
        // AND/OR need lazy three-valued handling.
        match op {
            BinaryOp::And => {
                let l = self.eval(left, columns, values)?;
                if matches!(l, Value::Boolean(false)) {
                    return Ok(Value::Boolean(false));
                }
                let r = self.eval(right, columns, values)?;
                return Ok(match (l, r) {
                    (_, Value::Boolean(false)) => Value::Boolean(false),
                    (Value::Boolean(true), Value::Boolean(true)) => Value::Boolean(true),
                    _ => Value::Null,
                });
            }
            BinaryOp::Or => {
                let l = self.eval(left, columns, values)?;
                if matches!(l, Value::Boolean(true)) {
                    return Ok(Value::Boolean(true));
                }
                let r = self.eval(right, columns, values)?;
                return Ok(match (l, r) {
                    (_, Value::Boolean(true)) => Value::Boolean(true),
                    (Value::Boolean(false), Value::Boolean(false)) => Value::Boolean(false),
                    _ => Value::Null,
                });
            }
            _ => {}
        }

        let l = self.eval(left, columns, values)?;
        let r = self.eval(right, columns, values)?;

        match op {
            BinaryOp::Is => Ok(Value::Boolean(null_aware_eq(&l, &r))),
            BinaryOp::IsNot => Ok(Value::Boolean(!null_aware_eq(&l, &r))),
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::LtEq
            | BinaryOp::Gt
            | BinaryOp::GtEq =>

Ok(match l.compare(&r) {
                None => Value::Null,
                Some(ord) => Value::Boolean(match op {
                    BinaryOp::Eq => ord == Ordering::Equal,
                    BinaryOp::NotEq => ord != Ordering::Equal,
                    BinaryOp::Lt => ord == Ordering::Less,
                    BinaryOp::LtEq => ord != Ordering::Greater,
                    BinaryOp::Gt => ord == Ordering::Greater,
                    BinaryOp::GtEq => ord != Ordering::Less,
                    _ => unreachable!(),
                }),
            }),
            BinaryOp::Like => like_match(&l, &r, false),
            BinaryOp::ILike => like_match(&l, &r, true),
            BinaryOp::Concat => {
                if l.is_null() || r.is_null() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Text(format!("{}{}", raw_text(&l), raw_text(&r))))
                }
            }
            BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide
            | BinaryOp::Modulo => arithmetic(op, l, r),
            BinaryOp::And | BinaryOp::Or => unreachable!(),
        }
    }

    fn eval_unary(&self, op: UnaryOp, v: Value) -> Result<Value> {
        match op {
            UnaryOp::Not => Ok(match v {
                Value::Null => Value::Null,
                Value::Boolean(b) => Value::Boolean(!b),
                other => {
                    return Err(DbError::Execution(format!(
                        "NOT applied to non-boolean {}",
                        other
                    )))
                }
            }),
            UnaryOp::Minus => match v {
                Value::Null => Ok(Value::Null),
                Value::Integer(i) => Ok(Value::Integer(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(DbError::Execution(format!("cannot negate {}", other))),
            },
            UnaryOp::Plus => Ok(v),
            UnaryOp::BitwiseNot => match v {
                Value::Null => Ok(Value::Null),
                Value::Integer(i) => Ok(Value::Integer(!i)),
                other => Err(DbError::Execution(format!("cannot invert {}", other))),
            },
        }
    }

    fn eval_scalar_function(
        &self,
        call: &FunctionCall,
        columns: &[String],
        values: &[Value],
    ) -> Result<Value> {
        let arg = |i: usize| -> Result<Value> {
            call.args
                .get(i)
                .map(|e| self.eval(e, columns, values))
                .transpose()
                .map(|v| v.unwrap_or(Value::Null))
        };

        match call.name.as_str() {
            "abs" => match arg(0)? {
                Value::Null => Ok(Value::Null),
                Value::Integer(i) => Ok(Value::Integer(i.abs())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(DbError::Execution(format!("abs({}) is not numeric", other))),
            },
            "upper" => text_fn(arg(0)?, |s| s.to_uppercase()),
            "lower" => text_fn(arg(0)?, |s| s.to_lowercase()),
            "trim" => text_fn(arg(0)?, |s| s.trim().to_string()),
            "length" => match arg(0)? {
                Value::Null => Ok(Value::Null),
                v => Ok(Value::Integer(raw_text(&v).chars().count() as i64)),
            },
            "coalesce" => {
                for e in &call.args {
                    let v = self.eval(e, columns, values)?;
                    if !v.is_null() {
                        return Ok(v);
                    }
                }
                Ok(Value::Null)
            }
            "nullif" => {
                let a = arg(0)?;
                let b = arg(1)?;
                if a.compare(&b) == Some(Ordering::Equal) {
                    Ok(Value::Null)
                } else {
                    Ok(a)
                }
            }
            "round" => {
                let v = arg(0)?;
                let digits = if call.args.len() > 1 {
                    arg(1)?.as_i64().unwrap_or(0)
                } else {
                    0
                };
                match v {
                    Value::Null => Ok(Value::Null),
                    Value::Integer(i) => Ok(Value::Integer(i)),
                    Value::Float(f) => {
                        let factor = 10f64.powi(digits as i32);
                        Ok(Value::Float((f * factor).round() / factor))
                    }
                    other => Err(DbError::Execution(format!("round({}) is not numeric", other))),
                }
            }
            "substr" => {
                let v = arg(0)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                let s = raw_text(&v);
                let start = arg(1)?.as_i64().unwrap_or(1).max(1) as usize;
                let chars: Vec<char> = s.chars().collect();
                let from = start.saturating_sub(1).min(chars.len());
                let taken: String = match call.args.len() {
                    3 => {
                        let len = arg(2)?.as_i64().unwrap_or(0).max(0) as usize;
                        chars[from..].iter().take(len).collect()
                    }
                    _ => chars[from..].iter().collect(),
                };
                Ok(Value::Text(taken))
            }
            "replace" => {
                let v = arg(0)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                let from = raw_text(&arg(1)?);
                let to = raw_text(&arg(2)?);
                Ok(Value::Text(raw_text(&v).replace(&from, &to)))
            }
            "now" => Ok(Value::Timestamp(Utc::now())),
            other => Err(DbError::Execution(format!(
                "function '{}' cannot be evaluated in a scalar context",
                other
            ))),
        }
    }
}

fn text_fn(v: Value, f: impl Fn(&str) -> String) -> Result<Value> {
    match v {
        Value::Null => Ok(Value::Null),
        other => Ok(Value::Text(f(&raw_text(&other)))),
    }
}

/// Unquoted textual rendering used by Concat and the text functions.
pub fn raw_text(v: &Value) -> String {
    match v {
        Value::Text(s) => s.clone(),
        Value::Null => String::new(),
        Value::Boolean(b) => if *b { "true" } else { "false" }.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Timestamp(t) => t.to_rfc3339(),
    }
}

/// NULL-aware equality for IS / IS NOT: two NULLs are the same.
fn null_aware_eq(l: &Value, r: &Value) -> bool {
    match (l.is_null(), r.is_null()) {
        (true, true) => true,
        (true, false) | (false, true) => false,
        (false, false) => l.compare(r) == Some(Ordering::Equal),
    }
}

fn like_match(value: &Value, pattern: &Value, case_insensitive: bool) -> Result<Value> {
    if value.is_null() || pattern.is_null() {
        return Ok(Value::Null);
    }
    let text = raw_text(value);
    let pattern = raw_text(pattern);

    let mut regex = String::with_capacity(pattern.len() + 8);
    if case_insensitive {
        regex.push_str("(?i)");
    }
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');

    let compiled = regex::Regex::new(&regex)
        .map_err(|e| DbError::Execution(format!("bad LIKE pattern: {}", e)))?;
    Ok(Value::Boolean(compiled.is_match(&text)))
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    // Integer arithmetic stays integral; any float operand promotes.
    if let (Value::Integer(a), Value::Integer(b)) = (&l, &r) {
        let (a, b) = (*a, *b);
        let result = match op {
            BinaryOp::Plus => a.checked_add(b),
            BinaryOp::Minus => a.checked_sub(b),
            BinaryOp::Multiply => a.checked_mul(b),
            BinaryOp::Divide => {
                if b == 0 {
                    return Err(DbError::Execution("division by zero".to_string()));
                }
                a.checked_div(b)
            }
            BinaryOp::Modulo => {
                if b == 0 {
                    return Err(DbError::Execution("division by zero".to_string()));
                }
                a.checked_rem(b)
            }
            _ => unreachable!(),
        };
        if let Some(v) = result {
            return Ok(Value::Integer(v));
        }
        // Overflow falls through to floats.
    }

    let a = l
        .as_f64()
        .ok_or_else(|| DbError::Execution(format!("{} is not numeric", l)))?;
    let b = r
        .as_f64()
        .ok_or_else(|| DbError::Execution(format!("{} is not numeric", r)))?;
    let v = match op {
        BinaryOp::Plus => a + b,
        BinaryOp::Minus => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide => {
            if b == 0.0 {
                return Err(DbError::Execution("division by zero".to_string()));
            }
            a / b
        }
        BinaryOp::Modulo => {
            if b == 0.0 {
                return Err(DbError::Execution("division by zero".to_string()));
            }
            a % b
        }
        _ => unreachable!(),
    };
    Ok(Value::Float(v))
}

fn cast_value(v: Value, target: DataType) -> Result<Value> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let failed = |v: &Value| {
        Err(DbError::Execution(format!(
            "cannot cast {} to {}",
            v, target
        )))
    };
    match target {
        DataType::Integer => match &v {
            Value::Integer(_) => Ok(v),
            Value::Float(f) => Ok(Value::Integer(*f as i64)),
            Value::Boolean(b) => Ok(Value::Integer(*b as i64)),
            Value::Text(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .or_else(|_| failed(&v)),
            _ => failed(&v),
        },
        DataType::Float => match &v {
            Value::Float(_) => Ok(v),
            Value::Integer(i) => Ok(Value::Float(*i as f64)),
            Value::Text(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .or_else(|_| failed(&v)),
            _ => failed(&v),
        },
        DataType::Text | DataType::Json => Ok(Value::Text(raw_text(&v))),
        DataType::Boolean => match &v {
            Value::Boolean(_) => Ok(v),
            Value::Integer(i) => Ok(Value::Boolean(*i != 0)),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Value::Boolean(true)),
                "false" | "f" | "0" => Ok(Value::Boolean(false)),
                _ => failed(&v),
            },
            _ => failed(&v),
        },
        DataType::Timestamp => match &v {
            Value::Timestamp(_) => Ok(v),
            Value::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
                .or_else(|_| failed(&v)),
            Value::Integer(micros) => Ok(Value::timestamp_from_micros(*micros)),
            _ => failed(&v),
        },
    }
}

fn extract_field(field: &str, v: Value) -> Result<Value> {
    let Value::Timestamp(t) = v else {
        if v.is_null() {
            return Ok(Value::Null);
        }
        return Err(DbError::Execution(format!(
            "EXTRACT source {} is not a timestamp",
            v
        )));
    };
    let out = match field {
        "YEAR" => t.year() as i64,
        "MONTH" => t.month() as i64,
        "DAY" => t.day() as i64,
        "HOUR" => t.hour() as i64,
        "MINUTE" => t.minute() as i64,
        "SECOND" => t.second() as i64,
        "DOW" => t.weekday().num_days_from_sunday() as i64,
        "EPOCH" => t.timestamp(),
        other => {
            return Err(DbError::Execution(format!(
                "unknown EXTRACT field '{}'",
                other
            )))
        }
    };
    Ok(Value::Integer(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::parser::ast::{SelectItem, Statement};

    fn expr(sql: &str) -> Expr {
        let Statement::Select(select) = Parser::parse_one(&format!("SELECT {}", sql)).unwrap()
        else {
            panic!("expected select");
        };
        let SelectItem::Expr { expr, .. } = select.projection.into_iter().next().unwrap() else {
            panic!("expected expr item");
        };
        expr
    }

    fn eval(sql: &str) -> Value {
        Evaluator::eval_const(&expr(sql)).unwrap()
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3"), Value::Integer(7));
        assert_eq!(eval("(1 + 2) * 3"), Value::Integer(9));
        assert_eq!(eval("7 / 2"), Value::Integer(3));
        assert_eq!(eval("7.0 / 2"), Value::Float(3.5));
        assert_eq!(eval("7 % 3"), Value::Integer(1));
    }

    #[test]
    fn test_division_by_zero_errors() {
        assert!(Evaluator::eval_const(&expr("1 / 0")).is_err());
    }

    #[test]
    fn test_three_valued_logic() {
        assert_eq!(eval("NULL AND TRUE"), Value::Null);
        assert_eq!(eval("NULL AND FALSE"), Value::Boolean(false));
        assert_eq!(eval("NULL OR TRUE"), Value::Boolean(true));
        assert_eq!(eval("NULL OR FALSE"), Value::Null);
        assert_eq!(eval("NOT NULL"), Value::Null);
    }

    #[test]
    fn test_null_comparisons_yield_null() {
        assert_eq!(eval("1 = NULL"), Value::Null);
        assert_eq!(eval("NULL <> NULL"), Value::Null);
    }

    #[test]
    fn test_is_null_rewrite_evaluates() {
        assert_eq!(eval("NULL IS NULL"), Value::Boolean(true));
        assert_eq!(eval("1 IS NULL"), Value::Boolean(false));
        assert_eq!(eval("1 IS NOT NULL"), Value::Boolean(true));
    }

    #[test]
    fn test_like_and_ilike() {
        assert_eq!(eval("'hello' LIKE 'he%'"), Value::Boolean(true));
        assert_eq!(eval("'hello' LIKE 'h_llo'"), Value::Boolean(true));
        assert_eq!(eval("'hello' LIKE 'HE%'"), Value::Boolean(false));
        assert_eq!(eval("'hello' ILIKE 'HE%'"), Value::Boolean(true));
        assert_eq!(eval("'50%' LIKE '50\\%'"), Value::Boolean(false));
    }

    #[test]
    fn test_between_expansion_evaluates() {
        assert_eq!(eval("5 BETWEEN 1 AND 10"), Value::Boolean(true));
        assert_eq!(eval("5 NOT BETWEEN 1 AND 10"), Value::Boolean(false));
        assert_eq!(eval("0 BETWEEN 1 AND 10"), Value::Boolean(false));
    }

    #[test]
    fn test_case_expressions() {
        assert_eq!(
            eval("CASE WHEN 1 > 2 THEN 'a' ELSE 'b' END"),
            Value::Text("b".into())
        );
        assert_eq!(
            eval("CASE 2 WHEN 1 THEN 'one' WHEN 2 THEN 'two' END"),
            Value::Text("two".into())
        );
        assert_eq!(eval("CASE WHEN FALSE THEN 1 END"), Value::Null);
    }

    #[test]
    fn test_cast() {
        assert_eq!(eval("CAST('42' AS INTEGER)"), Value::Integer(42));
        assert_eq!(eval("CAST(1 AS BOOLEAN)"), Value::Boolean(true));
        assert_eq!(eval("CAST(3.9 AS INTEGER)"), Value::Integer(3));
        assert_eq!(eval("CAST(NULL AS INTEGER)"), Value::Null);
        assert!(Evaluator::eval_const(&expr("CAST('x' AS INTEGER)")).is_err());
    }

    #[test]
    fn test_extract() {
        assert_eq!(
            eval("EXTRACT(year FROM CAST('2024-03-05T10:20:30Z' AS TIMESTAMP))"),
            Value::Integer(2024)
        );
        assert_eq!(
            eval("EXTRACT(minute FROM CAST('2024-03-05T10:20:30Z' AS TIMESTAMP))"),
            Value::Integer(20)
        );
    }

    #[test]
    fn test_in_list_three_valued() {
        assert_eq!(eval("2 IN (1, 2, 3)"), Value::Boolean(true));
        assert_eq!(eval("5 IN (1, 2, 3)"), Value::Boolean(false));
        assert_eq!(eval("5 IN (1, NULL)"), Value::Null);
        assert_eq!(eval("5 NOT IN (1, 2)"), Value::Boolean(true));
    }

    #[test]
    fn test_concat_and_functions() {
        assert_eq!(eval("'a' || 'b' || 1"), Value::Text("ab1".into()));
        assert_eq!(eval("'a' || NULL"), Value::Null);
        assert_eq!(eval("upper('abc')"), Value::Text("ABC".into()));
        assert_eq!(eval("length('abc')"), Value::Integer(3));
        assert_eq!(eval("coalesce(NULL, NULL, 3)"), Value::Integer(3));
        assert_eq!(eval("nullif(1, 1)"), Value::Null);
        assert_eq!(eval("substr('hello', 2, 3)"), Value::Text("ell".into()));
        assert_eq!(eval("round(2.456, 2)"), Value::Float(2.46));
    }

    #[test]
    fn test_column_lookup_qualified_and_bare() {
        let ev = Evaluator::new();
        let columns = vec!["t.id".to_string(), "t.name".to_string()];
        let values = vec![Value::Integer(1), Value::Text("x".into())];
        assert_eq!(
            ev.eval(&expr("id"), &columns, &values).unwrap(),
            Value::Integer(1)
        );
        assert_eq!(
            ev.eval(&expr("t.name"), &columns, &values).unwrap(),
            Value::Text("x".into())
        );
        assert!(ev.eval(&expr("missing"), &columns, &values).is_err());
    }

    #[test]
    fn test_expression_as_column_shortcut() {
        let ev = Evaluator::new();
        let columns = vec!["g".to_string(), "count(*)".to_string()];
        let values = vec![Value::Text("a".into()), Value::Integer(4)];
        assert_eq!(
            ev.eval(&expr("count(*)"), &columns, &values).unwrap(),
            Value::Integer(4)
        );
        assert_eq!(
            ev.eval(&expr("count(*) + 1"), &columns, &values).unwrap(),
            Value::Integer(5)
        );
    }

    #[test]
    fn test_outer_scope_fallback() {
        let mut ev = Evaluator::new();
        ev.outer = Some((vec!["o.x".to_string()], vec![Value::Integer(9)]));
        assert_eq!(
            ev.eval(&expr("o.x"), &[], &[]).unwrap(),
            Value::Integer(9)
        );
    }
}
