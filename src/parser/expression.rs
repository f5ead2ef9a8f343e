// Expression parsing.
//
// Precedence ladder, low to high: OR, AND, NOT, comparisons (including
// LIKE/ILIKE/IN/BETWEEN/IS), additive (+ - ||), multiplicative (* / %),
// unary (+ - ~), primary. `BETWEEN a AND b` expands during parsing to
// `(x >= a AND x <= b)` and `NOT BETWEEN` to its disjunctive dual, so the
// rest of the stack never sees a BETWEEN node. `IS [NOT] NULL` becomes a
// comparison against a typed NULL literal.

use crate::common::Value;
use crate::error::Result;
use crate::parser::ast::*;
use crate::parser::token::{Keyword, TokenKind};
use crate::parser::Parser;

impl Parser {
    pub(crate) fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_kw(Keyword::Or) {
            let right = self.parse_and()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_kw(Keyword::And) {
            let right = self.parse_not()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat_kw(Keyword::Not) {
            let expr = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_additive()?;

        // Negated comparison forms: x NOT BETWEEN / NOT IN / NOT LIKE.
        if self.peek_kw(Keyword::Not) {
            let negates_comparison = matches!(
                self.peek_ahead(1),
                TokenKind::Keyword(Keyword::Between)
                    | TokenKind::Keyword(Keyword::In)
                    | TokenKind::Keyword(Keyword::Like)
                    | TokenKind::Keyword(Keyword::ILike)
            );
            if negates_comparison {
                self.advance();
                if self.eat_kw(Keyword::Between) {
                    return self.parse_between(left, true);
                }
                if self.eat_kw(Keyword::In) {
                    return self.parse_in(left, true);
                }
                let op = if self.eat_kw(Keyword::ILike) {
                    BinaryOp::ILike
                } else {
                    self.expect_kw(Keyword::Like)?;
                    BinaryOp::Like
                };
                let right = self.parse_additive()?;
                return Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(Expr::Binary {
                        left: Box::new(left),
                        op,
                        right: Box::new(right),
                    }),
                });
            }
        }

        if self.eat_kw(Keyword::Between) {
            return self.parse_between(left, false);
        }
        if self.eat_kw(Keyword::In) {
            return self.parse_in(left, false);
        }
        if self.eat_kw(Keyword::Is) {
            let negated = self.eat_kw(Keyword::Not);
            let literal = if self.eat_kw(Keyword::Null) {
                Value::Null
            } else if self.eat_kw(Keyword::True) {
                Value::Boolean(true)
            } else if self.eat_kw(Keyword::False) {
                Value::Boolean(false)
            } else {
                return Err(self.unexpected("NULL, TRUE or FALSE"));
            };
            return Ok(Expr::Binary {
                left: Box::new(left),
                op: if negated { BinaryOp::IsNot } else { BinaryOp::Is },
                right: Box::new(Expr::Literal(literal)),
            });
        }

        let op = match self.peek_kind() {
            TokenKind::Eq => Some(BinaryOp::Eq),
            TokenKind::NotEq => Some(BinaryOp::NotEq),
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::LtEq => Some(BinaryOp::LtEq),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::GtEq => Some(BinaryOp::GtEq),
            TokenKind::Keyword(Keyword::Like) => Some(BinaryOp::Like),
            TokenKind::Keyword(Keyword::ILike) => Some(BinaryOp::ILike),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_additive()?;
            return Ok(Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            });
        }

        Ok(left)
    }

    /// `x BETWEEN a AND b` → `(x >= a AND x <= b)`; the negated form is the
    /// disjunctive dual `(x < a OR x > b)`.
    fn parse_between(&mut self, operand: Expr, negated: bool) -> Result<Expr> {
        let low = self.parse_additive()?;
        self.expect_kw(Keyword::And)?;
        let high = self.parse_additive()?;

        let (low_op, high_op, connective) = if negated {
            (BinaryOp::Lt, BinaryOp::Gt, BinaryOp::Or)
        } else {
            (BinaryOp::GtEq, BinaryOp::LtEq, BinaryOp::And)
        };

        Ok(Expr::Binary {
            left: Box::new(Expr::Binary {
                left: Box::new(operand.clone()),
                op: low_op,
                right: Box::new(low),
            }),
            op: connective,
            right: Box::new(Expr::Binary {
                left: Box::new(operand),
                op: high_op,
                right: Box::new(high),
            }),
        })
    }

    fn parse_in(&mut self, operand: Expr, negated: bool) -> Result<Expr> {
        self.expect(&TokenKind::LParen)?;
        if matches!(
            self.peek_kind(),
            TokenKind::Keyword(Keyword::Select) | TokenKind::Keyword(Keyword::With)
        ) {
            let query = Box::new(self.parse_select()?);
            self.expect(&TokenKind::RParen)?;
            return Ok(Expr::InSubquery {
                expr: Box::new(operand),
                query,
                negated,
            });
        }
        let mut list = Vec::new();
        loop {
            list.push(self.parse_expr()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(Expr::InList {
            expr: Box::new(operand),
            list,
            negated,
        })
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Plus,
                TokenKind::Minus => BinaryOp::Minus,
                TokenKind::Concat => BinaryOp::Concat,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Multiply,
                TokenKind::Slash => BinaryOp::Divide,
                TokenKind::Percent => BinaryOp::Modulo,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Minus => Some(UnaryOp::Minus),
            TokenKind::Plus => Some(UnaryOp::Plus),
            TokenKind::Tilde => Some(UnaryOp::BitwiseNot),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.peek_kind().clone() {
            TokenKind::Number(n) => {
                self.advance();
                let value = if n.contains('.') {
                    Value::Float(n.parse().map_err(|_| self.unexpected("number"))?)
                } else {
                    match n.parse::<i64>() {
                        Ok(i) => Value::Integer(i),
                        Err(_) => Value::Float(n.parse().map_err(|_| self.unexpected("number"))?),
                    }
                };
                Ok(Expr::Literal(value))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Value::Text(s)))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::Literal(Value::Boolean(true)))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::Literal(Value::Boolean(false)))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            TokenKind::Keyword(Keyword::Case) => self.parse_case(),
            TokenKind::Keyword(Keyword::Cast) => {
                self.advance();
                self.expect(&TokenKind::LParen)?;
                let expr = self.parse_expr()?;
                self.expect_kw(Keyword::As)?;
                let data_type = self.parse_data_type()?;
                self.expect(&TokenKind::RParen)?;
                Ok(Expr::Cast {
                    expr: Box::new(expr),
                    data_type,
                })
            }
            TokenKind::Keyword(Keyword::Extract) => {
                self.advance();
                self.expect(&TokenKind::LParen)?;
                let field = self.parse_ident()?;
                self.expect_kw(Keyword::From)?;
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(Expr::Extract {
                    field: field.to_ascii_uppercase(),
                    expr: Box::new(expr),
                })
            }
            TokenKind::Keyword(Keyword::Exists) => {
                self.advance();
                self.expect(&TokenKind::LParen)?;
                let query = Box::new(self.parse_select()?);
                self.expect(&TokenKind::RParen)?;
                Ok(Expr::Exists {
                    query,
                    negated: false,
                })
            }
            TokenKind::LParen => {
                self.advance();
                if matches!(
                    self.peek_kind(),
                    TokenKind::Keyword(Keyword::Select) | TokenKind::Keyword(Keyword::With)
                ) {
                    let query = Box::new(self.parse_select()?);
                    self.expect(&TokenKind::RParen)?;
                    return Ok(Expr::Subquery(query));
                }
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.peek_kind() == &TokenKind::LParen {
                    return self.parse_function_call(name);
                }
                if self.eat(&TokenKind::Dot) {
                    let column = self.parse_ident()?;
                    return Ok(Expr::Column {
                        table: Some(name),
                        name: column,
                    });
                }
                Ok(Expr::Column { table: None, name })
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_case(&mut self) -> Result<Expr> {
        self.expect_kw(Keyword::Case)?;
        let operand = if self.peek_kw(Keyword::When) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };

        let mut branches = Vec::new();
        while self.eat_kw(Keyword::When) {
            let when = self.parse_expr()?;
            self.expect_kw(Keyword::Then)?;
            let then = self.parse_expr()?;
            branches.push((when, then));
        }
        if branches.is_empty() {
            return Err(self.unexpected("WHEN"));
        }

        let else_expr = if self.eat_kw(Keyword::Else) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        self.expect_kw(Keyword::End)?;

        Ok(Expr::Case {
            operand,
            branches,
            else_expr,
        })
    }

    fn parse_function_call(&mut self, name: String) -> Result<Expr> {
        self.expect(&TokenKind::LParen)?;
        let mut distinct = false;
        let mut args = Vec::new();

        if self.eat(&TokenKind::Star) {
            args.push(Expr::Wildcard);
        } else if !self.eat(&TokenKind::RParen) {
            distinct = self.eat_kw(Keyword::Distinct);
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen)?;
            return self.finish_function_call(name, args, distinct);
        } else {
            // Empty argument list; RParen already consumed.
            return self.finish_function_call(name, args, distinct);
        }
        self.expect(&TokenKind::RParen)?;
        self.finish_function_call(name, args, distinct)
    }

    fn finish_function_call(
        &mut self,
        name: String,
        args: Vec<Expr>,
        distinct: bool,
    ) -> Result<Expr> {
        let filter = if self.eat_kw(Keyword::Filter) {
            self.expect(&TokenKind::LParen)?;
            self.expect_kw(Keyword::Where)?;
            let expr = self.parse_expr()?;
            self.expect(&TokenKind::RParen)?;
            Some(Box::new(expr))
        } else {
            None
        };

        let over = if self.eat_kw(Keyword::Over) {
            self.expect(&TokenKind::LParen)?;
            let spec = self.parse_window_spec()?;
            self.expect(&TokenKind::RParen)?;
            Some(spec)
        } else {
            None
        };

        Ok(Expr::Function(FunctionCall {
            name: name.to_ascii_lowercase(),
            args,
            distinct,
            filter,
            over,
        }))
    }

    fn parse_window_spec(&mut self) -> Result<WindowSpec> {
        let mut partition_by = Vec::new();
        if self.eat_kw(Keyword::Partition) {
            self.expect_kw(Keyword::By)?;
            loop {
                partition_by.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let mut order_by = Vec::new();
        if self.eat_kw(Keyword::Order) {
            self.expect_kw(Keyword::By)?;
            loop {
                order_by.push(self.parse_order_item()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let frame = if self.peek_kw(Keyword::Rows) || self.peek_kw(Keyword::Range) {
            let units = if self.eat_kw(Keyword::Rows) {
                FrameUnits::Rows
            } else {
                self.expect_kw(Keyword::Range)?;
                FrameUnits::Range
            };
            if self.eat_kw(Keyword::Between) {
                let start = self.parse_frame_bound()?;
                self.expect_kw(Keyword::And)?;
                let end = self.parse_frame_bound()?;
                Some(WindowFrame { units, start, end })
            } else {
                let start = self.parse_frame_bound()?;
                Some(WindowFrame {
                    units,
                    start,
                    end: FrameBound::CurrentRow,
                })
            }
        } else {
            None
        };

        Ok(WindowSpec {
            partition_by,
            order_by,
            frame,
        })
    }

    fn parse_frame_bound(&mut self) -> Result<FrameBound> {
        if self.eat_kw(Keyword::Unbounded) {
            if self.eat_kw(Keyword::Preceding) {
                return Ok(FrameBound::UnboundedPreceding);
            }
            self.expect_kw(Keyword::Following)?;
            return Ok(FrameBound::UnboundedFollowing);
        }
        if self.eat_kw(Keyword::Current) {
            self.expect_kw(Keyword::Row)?;
            return Ok(FrameBound::CurrentRow);
        }
        let n = match self.peek_kind().clone() {
            TokenKind::Number(n) if !n.contains('.') => {
                self.advance();
                n.parse::<u64>().map_err(|_| self.unexpected("row count"))?
            }
            _ => return Err(self.unexpected("frame bound")),
        };
        if self.eat_kw(Keyword::Preceding) {
            Ok(FrameBound::Preceding(n))
        } else {
            self.expect_kw(Keyword::Following)?;
            Ok(FrameBound::Following(n))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(sql: &str) -> Expr {
        let stmt = Parser::parse_one(&format!("SELECT {}", sql)).unwrap();
        let Statement::Select(select) = stmt else {
            panic!("expected select");
        };
        let SelectItem::Expr { expr, .. } = select.projection.into_iter().next().unwrap() else {
            panic!("expected expression item");
        };
        expr
    }

    #[test]
    fn test_precedence_or_lowest() {
        // a OR b AND c parses as a OR (b AND c)
        let e = expr("a OR b AND c");
        let Expr::Binary { op, right, .. } = e else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Or);
        assert!(matches!(
            *right,
            Expr::Binary {
                op: BinaryOp::And,
                ..
            }
        ));
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let e = expr("1 + 2 * 3");
        let Expr::Binary { op, right, .. } = e else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Plus);
        assert!(matches!(
            *right,
            Expr::Binary {
                op: BinaryOp::Multiply,
                ..
            }
        ));
    }

    #[test]
    fn test_between_expansion() {
        let e = expr("x BETWEEN 1 AND 10");
        assert_eq!(e.to_string(), "((x >= 1) AND (x <= 10))");
    }

    #[test]
    fn test_not_between_disjunctive_dual() {
        let e = expr("x NOT BETWEEN 1 AND 10");
        assert_eq!(e.to_string(), "((x < 1) OR (x > 10))");
    }

    #[test]
    fn test_is_null_typed_literal() {
        let e = expr("x IS NULL");
        assert_eq!(
            e,
            Expr::Binary {
                left: Box::new(Expr::Column {
                    table: None,
                    name: "x".into()
                }),
                op: BinaryOp::Is,
                right: Box::new(Expr::Literal(Value::Null)),
            }
        );
        let e = expr("x IS NOT NULL");
        assert!(matches!(
            e,
            Expr::Binary {
                op: BinaryOp::IsNot,
                ..
            }
        ));
    }

    #[test]
    fn test_in_list_and_subquery() {
        assert!(matches!(
            expr("x IN (1, 2, 3)"),
            Expr::InList { negated: false, .. }
        ));
        assert!(matches!(
            expr("x NOT IN (SELECT id FROM t)"),
            Expr::InSubquery { negated: true, .. }
        ));
    }

    #[test]
    fn test_case_forms() {
        let searched = expr("CASE WHEN a > 1 THEN 'big' ELSE 'small' END");
        assert!(matches!(searched, Expr::Case { operand: None, .. }));
        let simple = expr("CASE a WHEN 1 THEN 'one' END");
        assert!(matches!(simple, Expr::Case { operand: Some(_), .. }));
    }

    #[test]
    fn test_window_function() {
        let e = expr("sum(x) OVER (PARTITION BY g ORDER BY t ASC ROWS BETWEEN 1 PRECEDING AND CURRENT ROW)");
        let Expr::Function(call) = e else {
            panic!("expected function");
        };
        let over = call.over.unwrap();
        assert_eq!(over.partition_by.len(), 1);
        assert_eq!(over.order_by.len(), 1);
        let frame = over.frame.unwrap();
        assert_eq!(frame.start, FrameBound::Preceding(1));
        assert_eq!(frame.end, FrameBound::CurrentRow);
    }

    #[test]
    fn test_count_star_and_filter() {
        let e = expr("count(*) FILTER (WHERE x > 0)");
        let Expr::Function(call) = e else {
            panic!("expected function");
        };
        assert_eq!(call.args, vec![Expr::Wildcard]);
        assert!(call.filter.is_some());
    }

    #[test]
    fn test_cast_and_extract() {
        assert!(matches!(expr("CAST(x AS INTEGER)"), Expr::Cast { .. }));
        let Expr::Extract { field, .. } = expr("EXTRACT(year FROM ts)") else {
            panic!("expected extract");
        };
        assert_eq!(field, "YEAR");
    }

    #[test]
    fn test_unary_chain() {
        let e = expr("- - 1");
        assert!(matches!(e, Expr::Unary { op: UnaryOp::Minus, .. }));
    }

    #[test]
    fn test_concat_operator() {
        let e = expr("a || b || c");
        // Left-associative.
        let Expr::Binary { op, left, .. } = e else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Concat);
        assert!(matches!(
            *left,
            Expr::Binary {
                op: BinaryOp::Concat,
                ..
            }
        ));
    }
}
