// SQL front end: lexer, recursive-descent parser, validator.
//
// The parser consumes the token stream produced by [`lexer::Lexer`] and
// builds the AST in [`ast`]. Statement-level productions live here;
// expression parsing (the precedence ladder) is in [`expression`].

pub mod ast;
pub mod expression;
pub mod lexer;
pub mod suggest;
pub mod token;
pub mod validator;

pub use ast::{Expr, SelectStmt, Statement};
pub use validator::{ValidationOutcome, Validator};

use crate::catalog::DataType;
use crate::error::{DbError, Result};
use crate::storage::StorageType;
use crate::transaction::types::IsolationLevel;

use ast::*;
use token::{Keyword, Token, TokenKind};

pub struct Parser {
    pub(crate) tokens: Vec<Token>,
    pub(crate) pos: usize,
}

impl Parser {
    /// Parse a semicolon-separated script into statements.
    pub fn parse(sql: &str) -> Result<Vec<Statement>> {
        let tokens = lexer::Lexer::new(sql).tokenize()?;
        let mut parser = Parser { tokens, pos: 0 };
        let mut statements = Vec::new();
        loop {
            while parser.eat(&TokenKind::Semicolon) {}
            if parser.peek_kind() == &TokenKind::Eof {
                break;
            }
            statements.push(parser.parse_statement()?);
            if !matches!(parser.peek_kind(), TokenKind::Semicolon | TokenKind::Eof) {
                return Err(parser.unexpected("';'"));
            }
        }
        Ok(statements)
    }

    /// Parse exactly one statement.
    pub fn parse_one(sql: &str) -> Result<Statement> {
        let mut statements = Self::parse(sql)?;
        match statements.len() {
            1 => Ok(statements.remove(0)),
            0 => Err(DbError::syntax(1, 1, "<empty>")),
            _ => Err(DbError::ValidationError(
                "expected a single statement".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    pub(crate) fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    pub(crate) fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    pub(crate) fn peek_ahead(&self, n: usize) -> &TokenKind {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].kind
    }

    pub(crate) fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    pub(crate) fn peek_kw(&self, kw: Keyword) -> bool {
        self.peek_kind() == &TokenKind::Keyword(kw)
    }

    pub(crate) fn eat_kw(&mut self, kw: Keyword) -> bool {
        if self.peek_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_kw(&mut self, kw: Keyword) -> Result<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.unexpected(kw.as_str()))
        }
    }

    pub(crate) fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, kind: &TokenKind) -> Result<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.unexpected(&kind.to_string()))
        }
    }

    /// Error at the current token. If the token is a bare word close to a
    /// keyword, the error suggests the correction.
    pub(crate) fn unexpected(&self, _expected: &str) -> DbError {
        let token = self.peek();
        let near = token.kind.to_string();
        let suggestion = match &token.kind {
            TokenKind::Ident(word) => {
                suggest::keyword_suggestion(word).map(|s| s.to_string())
            }
            _ => None,
        };
        DbError::SyntaxError {
            line: token.line,
            column: token.column,
            near,
            suggestion,
        }
    }

    pub(crate) fn parse_ident(&mut self) -> Result<String> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.peek_kind() {
            TokenKind::Keyword(Keyword::Select) | TokenKind::Keyword(Keyword::With) => {
                Ok(Statement::Select(Box::new(self.parse_select()?)))
            }
            TokenKind::Keyword(Keyword::Insert) => self.parse_insert(),
            TokenKind::Keyword(Keyword::Update) => self.parse_update(),
            TokenKind::Keyword(Keyword::Delete) => self.parse_delete(),
            TokenKind::Keyword(Keyword::Create) => self.parse_create(),
            TokenKind::Keyword(Keyword::Drop) => self.parse_drop(),
            TokenKind::Keyword(Keyword::Begin) | TokenKind::Keyword(Keyword::Start) => {
                self.parse_begin()
            }
            TokenKind::Keyword(Keyword::Commit) => {
                self.advance();
                let chain = self.eat_kw(Keyword::And) && {
                    self.expect_kw(Keyword::Chain)?;
                    true
                };
                Ok(Statement::Commit { chain })
            }
            TokenKind::Keyword(Keyword::Rollback) => {
                self.advance();
                let savepoint = if self.eat_kw(Keyword::To) {
                    self.expect_kw(Keyword::Savepoint)?;
                    Some(self.parse_ident()?)
                } else {
                    None
                };
                let chain = self.eat_kw(Keyword::And) && {
                    self.expect_kw(Keyword::Chain)?;
                    true
                };
                Ok(Statement::Rollback { savepoint, chain })
            }
            TokenKind::Keyword(Keyword::Savepoint) => {
                self.advance();
                Ok(Statement::Savepoint {
                    name: self.parse_ident()?,
                })
            }
            TokenKind::Keyword(Keyword::Release) => {
                self.advance();
                self.expect_kw(Keyword::Savepoint)?;
                Ok(Statement::ReleaseSavepoint {
                    name: self.parse_ident()?,
                })
            }
            TokenKind::Keyword(Keyword::Explain) => {
                self.advance();
                Ok(Statement::Explain(Box::new(self.parse_statement()?)))
            }
            _ => Err(self.unexpected("statement")),
        }
    }

    pub(crate) fn parse_select(&mut self) -> Result<SelectStmt> {
        let mut with = Vec::new();
        if self.eat_kw(Keyword::With) {
            let recursive = self.eat_kw(Keyword::Recursive);
            loop {
                let name = self.parse_ident()?;
                let mut columns = Vec::new();
                if self.eat(&TokenKind::LParen) {
                    loop {
                        columns.push(self.parse_ident()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RParen)?;
                }
                self.expect_kw(Keyword::As)?;
                self.expect(&TokenKind::LParen)?;
                let query = Box::new(self.parse_select()?);
                self.expect(&TokenKind::RParen)?;
                with.push(Cte {
                    name,
                    columns,
                    query,
                    recursive,
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        self.expect_kw(Keyword::Select)?;
        let distinct = self.eat_kw(Keyword::Distinct);

        let mut projection = Vec::new();
        loop {
            projection.push(self.parse_select_item()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }

        let from = if self.eat_kw(Keyword::From) {
            Some(self.parse_table_ref()?)
        } else {
            None
        };

        let selection = if self.eat_kw(Keyword::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat_kw(Keyword::Group) {
            self.expect_kw(Keyword::By)?;
            loop {
                group_by.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let having = if self.eat_kw(Keyword::Having) {
            Some(self.parse_expr()?)
        } else {
            None
        };

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

        let limit = if self.eat_kw(Keyword::Limit) {
            Some(self.parse_unsigned()?)
        } else {
            None
        };
        let offset = if self.eat_kw(Keyword::Offset) {
            Some(self.parse_unsigned()?)
        } else {
            None
        };

        Ok(SelectStmt {
            with,
            distinct,
            projection,
            from,
            selection,
            group_by,
            having,
            order_by,
            limit,
            offset,
        })
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        if self.eat(&TokenKind::Star) {
            return Ok(SelectItem::Wildcard);
        }
        // table.* needs two tokens of lookahead before falling back to an
        // ordinary expression.
        if let TokenKind::Ident(name) = self.peek_kind().clone() {
            if self.peek_ahead(1) == &TokenKind::Dot && self.peek_ahead(2) == &TokenKind::Star {
                self.advance();
                self.advance();
                self.advance();
                return Ok(SelectItem::QualifiedWildcard(name));
            }
        }
        let expr = self.parse_expr()?;
        let alias = if self.eat_kw(Keyword::As) {
            Some(self.parse_ident()?)
        } else if let TokenKind::Ident(name) = self.peek_kind().clone() {
            self.advance();
            Some(name)
        } else {
            None
        };
        Ok(SelectItem::Expr { expr, alias })
    }

    pub(crate) fn parse_order_item(&mut self) -> Result<OrderByExpr> {
        let expr = self.parse_expr()?;
        let asc = if self.eat_kw(Keyword::Desc) {
            false
        } else {
            self.eat_kw(Keyword::Asc);
            true
        };
        Ok(OrderByExpr { expr, asc })
    }

    fn parse_unsigned(&mut self) -> Result<u64> {
        match self.peek_kind().clone() {
            TokenKind::Number(n) if !n.contains('.') => {
                self.advance();
                n.parse()
                    .map_err(|_| DbError::ValidationError(format!("invalid count '{}'", n)))
            }
            _ => Err(self.unexpected("unsigned integer")),
        }
    }

    // ------------------------------------------------------------------
    // FROM clause
    // ------------------------------------------------------------------

    fn parse_table_ref(&mut self) -> Result<TableRef> {
        let mut left = self.parse_table_primary()?;
        loop {
            // Join keywords are reserved, so a bare identifier here is
            // always an alias and a join keyword always starts a join.
            let natural = self.eat_kw(Keyword::Natural);
            let join_type = if self.eat_kw(Keyword::Cross) {
                self.expect_kw(Keyword::Join)?;
                Some(JoinType::Cross)
            } else if self.eat_kw(Keyword::Inner) {
                self.expect_kw(Keyword::Join)?;
                Some(JoinType::Inner)
            } else if self.eat_kw(Keyword::Left) {
                self.eat_kw(Keyword::Outer);
                self.expect_kw(Keyword::Join)?;
                Some(JoinType::Left)
            } else if self.eat_kw(Keyword::Right) {
                self.eat_kw(Keyword::Outer);
                self.expect_kw(Keyword::Join)?;
                Some(JoinType::Right)
            } else if self.eat_kw(Keyword::Full) {
                self.eat_kw(Keyword::Outer);
                self.expect_kw(Keyword::Join)?;
                Some(JoinType::Full)
            } else if self.eat_kw(Keyword::Join) {
                Some(JoinType::Inner)
            } else {
                None
            };

            let Some(join_type) = join_type else {
                if natural {
                    return Err(self.unexpected("JOIN"));
                }
                return Ok(left);
            };

            let right = self.parse_table_primary()?;
            let constraint = if natural {
                JoinConstraint::Natural
            } else if join_type == JoinType::Cross {
                JoinConstraint::None
            } else if self.eat_kw(Keyword::On) {
                JoinConstraint::On(self.parse_expr()?)
            } else if self.eat_kw(Keyword::Using) {
                self.expect(&TokenKind::LParen)?;
                let mut cols = Vec::new();
                loop {
                    cols.push(self.parse_ident()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen)?;
                JoinConstraint::Using(cols)
            } else {
                return Err(self.unexpected("ON or USING"));
            };

            left = TableRef::Join {
                left: Box::new(left),
                right: Box::new(right),
                join_type,
                constraint,
            };
        }
    }

    fn parse_table_primary(&mut self) -> Result<TableRef> {
        if self.eat(&TokenKind::LParen) {
            if matches!(
                self.peek_kind(),
                TokenKind::Keyword(Keyword::Select) | TokenKind::Keyword(Keyword::With)
            ) {
                let query = Box::new(self.parse_select()?);
                self.expect(&TokenKind::RParen)?;
                self.eat_kw(Keyword::As);
                let alias = self.parse_ident()?;
                return Ok(TableRef::Subquery { query, alias });
            }
            let inner = self.parse_table_ref()?;
            self.expect(&TokenKind::RParen)?;
            return Ok(inner);
        }

        let name = self.parse_ident()?;
        let alias = if self.eat_kw(Keyword::As) {
            Some(self.parse_ident()?)
        } else if let TokenKind::Ident(alias) = self.peek_kind().clone() {
            self.advance();
            Some(alias)
        } else {
            None
        };
        Ok(TableRef::Table { name, alias })
    }

    // ------------------------------------------------------------------
    // DML
    // ------------------------------------------------------------------

    fn parse_insert(&mut self) -> Result<Statement> {
        self.expect_kw(Keyword::Insert)?;
        self.expect_kw(Keyword::Into)?;
        let table = self.parse_ident()?;

        let mut columns = Vec::new();
        if self.eat(&TokenKind::LParen) {
            loop {
                columns.push(self.parse_ident()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen)?;
        }

        let source = if self.eat_kw(Keyword::Values) {
            let mut rows = Vec::new();
            loop {
                self.expect(&TokenKind::LParen)?;
                let mut row = Vec::new();
                loop {
                    row.push(self.parse_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen)?;
                rows.push(row);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            InsertSource::Values(rows)
        } else if matches!(
            self.peek_kind(),
            TokenKind::Keyword(Keyword::Select) | TokenKind::Keyword(Keyword::With)
        ) {
            InsertSource::Query(Box::new(self.parse_select()?))
        } else {
            return Err(self.unexpected("VALUES or SELECT"));
        };

        let on_conflict = if self.eat_kw(Keyword::On) {
            self.expect_kw(Keyword::Conflict)?;
            let mut target = Vec::new();
            if self.eat(&TokenKind::LParen) {
                loop {
                    target.push(self.parse_ident()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen)?;
            }
            self.expect_kw(Keyword::Do)?;
            let action = if self.eat_kw(Keyword::Nothing) {
                ConflictAction::DoNothing
            } else {
                self.expect_kw(Keyword::Update)?;
                self.expect_kw(Keyword::Set)?;
                let assignments = self.parse_assignments()?;
                let selection = if self.eat_kw(Keyword::Where) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                ConflictAction::DoUpdate {
                    assignments,
                    selection,
                }
            };
            Some(OnConflict { target, action })
        } else {
            None
        };

        Ok(Statement::Insert(InsertStmt {
            table,
            columns,
            source,
            on_conflict,
        }))
    }

    fn parse_assignments(&mut self) -> Result<Vec<Assignment>> {
        let mut assignments = Vec::new();
        loop {
            let column = self.parse_ident()?;
            self.expect(&TokenKind::Eq)?;
            let value = self.parse_expr()?;
            assignments.push(Assignment { column, value });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(assignments)
    }

    fn parse_update(&mut self) -> Result<Statement> {
        self.expect_kw(Keyword::Update)?;
        let table = self.parse_ident()?;
        self.expect_kw(Keyword::Set)?;
        let assignments = self.parse_assignments()?;
        let selection = if self.eat_kw(Keyword::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Statement::Update(UpdateStmt {
            table,
            assignments,
            selection,
        }))
    }

    fn parse_delete(&mut self) -> Result<Statement> {
        self.expect_kw(Keyword::Delete)?;
        self.expect_kw(Keyword::From)?;
        let table = self.parse_ident()?;
        let selection = if self.eat_kw(Keyword::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Statement::Delete(DeleteStmt { table, selection }))
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    fn parse_create(&mut self) -> Result<Statement> {
        self.expect_kw(Keyword::Create)?;
        if self.eat_kw(Keyword::Unique) {
            self.expect_kw(Keyword::Index)?;
            return self.parse_create_index(true);
        }
        if self.eat_kw(Keyword::Index) {
            return self.parse_create_index(false);
        }
        self.expect_kw(Keyword::Table)?;

        let if_not_exists = if self.eat_kw(Keyword::If) {
            self.expect_kw(Keyword::Not)?;
            self.expect_kw(Keyword::Exists)?;
            true
        } else {
            false
        };
        let name = self.parse_ident()?;
        self.expect(&TokenKind::LParen)?;

        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::Keyword(Keyword::Primary) => {
                    self.advance();
                    self.expect_kw(Keyword::Key)?;
                    constraints.push(TableConstraint::PrimaryKey(self.parse_paren_idents()?));
                }
                TokenKind::Keyword(Keyword::Unique) => {
                    self.advance();
                    constraints.push(TableConstraint::Unique(self.parse_paren_idents()?));
                }
                TokenKind::Keyword(Keyword::Check) => {
                    self.advance();
                    self.expect(&TokenKind::LParen)?;
                    let expr = self.parse_expr()?;
                    self.expect(&TokenKind::RParen)?;
                    constraints.push(TableConstraint::Check(expr));
                }
                TokenKind::Keyword(Keyword::Foreign) => {
                    self.advance();
                    self.expect_kw(Keyword::Key)?;
                    let cols = self.parse_paren_idents()?;
                    self.expect_kw(Keyword::References)?;
                    let ref_table = self.parse_ident()?;
                    let ref_columns = self.parse_paren_idents()?;
                    constraints.push(TableConstraint::ForeignKey {
                        columns: cols,
                        ref_table,
                        ref_columns,
                    });
                }
                _ => columns.push(self.parse_column_def()?),
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;

        let engine = if self.eat_kw(Keyword::Engine) {
            self.expect(&TokenKind::Eq)?;
            let word = self.parse_ident()?;
            Some(StorageType::parse(&word).ok_or_else(|| {
                DbError::ValidationError(format!("unknown storage engine '{}'", word))
            })?)
        } else {
            None
        };

        Ok(Statement::CreateTable(CreateTableStmt {
            name,
            columns,
            constraints,
            engine,
            if_not_exists,
        }))
    }

    fn parse_paren_idents(&mut self) -> Result<Vec<String>> {
        self.expect(&TokenKind::LParen)?;
        let mut idents = Vec::new();
        loop {
            idents.push(self.parse_ident()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(idents)
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.parse_ident()?;
        let data_type = self.parse_data_type()?;

        let mut def = ColumnDef {
            name,
            data_type,
            nullable: true,
            primary_key: false,
            unique: false,
            default: None,
            check: None,
            references: None,
        };

        loop {
            if self.eat_kw(Keyword::Primary) {
                self.expect_kw(Keyword::Key)?;
                def.primary_key = true;
                def.nullable = false;
            } else if self.eat_kw(Keyword::Not) {
                self.expect_kw(Keyword::Null)?;
                def.nullable = false;
            } else if self.eat_kw(Keyword::Null) {
                def.nullable = true;
            } else if self.eat_kw(Keyword::Unique) {
                def.unique = true;
            } else if self.eat_kw(Keyword::Default) {
                def.default = Some(self.parse_expr()?);
            } else if self.eat_kw(Keyword::Check) {
                self.expect(&TokenKind::LParen)?;
                def.check = Some(self.parse_expr()?);
                self.expect(&TokenKind::RParen)?;
            } else if self.eat_kw(Keyword::References) {
                let table = self.parse_ident()?;
                let column = if self.eat(&TokenKind::LParen) {
                    let c = self.parse_ident()?;
                    self.expect(&TokenKind::RParen)?;
                    Some(c)
                } else {
                    None
                };
                def.references = Some((table, column));
            } else {
                break;
            }
        }
        Ok(def)
    }

    pub(crate) fn parse_data_type(&mut self) -> Result<DataType> {
        let data_type = match self.peek_kind() {
            TokenKind::Keyword(Keyword::Int)
            | TokenKind::Keyword(Keyword::Integer)
            | TokenKind::Keyword(Keyword::Bigint) => DataType::Integer,
            TokenKind::Keyword(Keyword::Float)
            | TokenKind::Keyword(Keyword::Double)
            | TokenKind::Keyword(Keyword::Real) => DataType::Float,
            TokenKind::Keyword(Keyword::Text) => DataType::Text,
            TokenKind::Keyword(Keyword::Varchar) => DataType::Text,
            TokenKind::Keyword(Keyword::Boolean) | TokenKind::Keyword(Keyword::Bool) => {
                DataType::Boolean
            }
            TokenKind::Keyword(Keyword::Timestamp) => DataType::Timestamp,
            TokenKind::Keyword(Keyword::Json) => DataType::Json,
            _ => return Err(self.unexpected("data type")),
        };
        let is_varchar = self.peek_kw(Keyword::Varchar);
        self.advance();
        // VARCHAR(n): length is parsed and ignored; all text is unbounded.
        if is_varchar && self.eat(&TokenKind::LParen) {
            self.parse_unsigned()?;
            self.expect(&TokenKind::RParen)?;
        }
        Ok(data_type)
    }

    fn parse_create_index(&mut self, unique: bool) -> Result<Statement> {
        let name = self.parse_ident()?;
        self.expect_kw(Keyword::On)?;
        let table = self.parse_ident()?;
        let columns = self.parse_paren_idents()?;
        Ok(Statement::CreateIndex(CreateIndexStmt {
            name,
            table,
            columns,
            unique,
        }))
    }

    fn parse_drop(&mut self) -> Result<Statement> {
        self.expect_kw(Keyword::Drop)?;
        if self.eat_kw(Keyword::Index) {
            return Ok(Statement::DropIndex {
                name: self.parse_ident()?,
            });
        }
        self.expect_kw(Keyword::Table)?;
        let if_exists = if self.eat_kw(Keyword::If) {
            self.expect_kw(Keyword::Exists)?;
            true
        } else {
            false
        };
        Ok(Statement::DropTable {
            name: self.parse_ident()?,
            if_exists,
        })
    }

    // ------------------------------------------------------------------
    // Transaction control
    // ------------------------------------------------------------------

    fn parse_begin(&mut self) -> Result<Statement> {
        if self.eat_kw(Keyword::Start) {
            self.expect_kw(Keyword::Transaction)?;
        } else {
            self.expect_kw(Keyword::Begin)?;
            self.eat_kw(Keyword::Transaction);
        }

        let mut isolation = None;
        let mut read_only = None;
        loop {
            if self.eat_kw(Keyword::Isolation) {
                self.expect_kw(Keyword::Level)?;
                isolation = Some(self.parse_isolation_level()?);
            } else if self.eat_kw(Keyword::Read) {
                if self.eat_kw(Keyword::Only) {
                    read_only = Some(true);
                } else {
                    self.expect_kw(Keyword::Write)?;
                    read_only = Some(false);
                }
            } else {
                break;
            }
            self.eat(&TokenKind::Comma);
        }

        Ok(Statement::Begin {
            isolation,
            read_only,
        })
    }

    fn parse_isolation_level(&mut self) -> Result<IsolationLevel> {
        if self.eat_kw(Keyword::Serializable) {
            return Ok(IsolationLevel::Serializable);
        }
        if self.eat_kw(Keyword::Repeatable) {
            self.expect_kw(Keyword::Read)?;
            return Ok(IsolationLevel::RepeatableRead);
        }
        self.expect_kw(Keyword::Read)?;
        if self.eat_kw(Keyword::Uncommitted) {
            Ok(IsolationLevel::ReadUncommitted)
        } else {
            self.expect_kw(Keyword::Committed)?;
            Ok(IsolationLevel::ReadCommitted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;

    #[test]
    fn test_parse_simple_select() {
        let stmt = Parser::parse_one("SELECT id, name FROM users WHERE id = 1").unwrap();
        let Statement::Select(select) = stmt else {
            panic!("expected select");
        };
        assert_eq!(select.projection.len(), 2);
        assert!(select.selection.is_some());
    }

    #[test]
    fn test_parse_join_with_alias_tiebreak() {
        // "u" binds as an alias; LEFT starts a join, not an alias.
        let stmt =
            Parser::parse_one("SELECT * FROM users u LEFT JOIN orders o ON u.id = o.user_id")
                .unwrap();
        let Statement::Select(select) = stmt else {
            panic!("expected select");
        };
        let Some(TableRef::Join {
            join_type,
            constraint,
            ..
        }) = select.from
        else {
            panic!("expected join");
        };
        assert_eq!(join_type, JoinType::Left);
        assert!(matches!(constraint, JoinConstraint::On(_)));
    }

    #[test]
    fn test_parse_insert_on_conflict() {
        let stmt = Parser::parse_one(
            "INSERT INTO t (a, b) VALUES (1, 'x'), (2, 'y') \
             ON CONFLICT (a) DO UPDATE SET b = 'z' WHERE a > 1",
        )
        .unwrap();
        let Statement::Insert(insert) = stmt else {
            panic!("expected insert");
        };
        let InsertSource::Values(rows) = &insert.source else {
            panic!("expected values");
        };
        assert_eq!(rows.len(), 2);
        let conflict = insert.on_conflict.unwrap();
        assert_eq!(conflict.target, vec!["a"]);
        assert!(matches!(conflict.action, ConflictAction::DoUpdate { .. }));
    }

    #[test]
    fn test_parse_create_table_with_engine() {
        let stmt = Parser::parse_one(
            "CREATE TABLE events (id INTEGER PRIMARY KEY, body TEXT NOT NULL, \
             at TIMESTAMP, CHECK (id > 0)) ENGINE = columnar",
        )
        .unwrap();
        let Statement::CreateTable(ct) = stmt else {
            panic!("expected create table");
        };
        assert_eq!(ct.columns.len(), 3);
        assert!(ct.columns[0].primary_key);
        assert!(!ct.columns[1].nullable);
        assert_eq!(ct.engine, Some(StorageType::Columnar));
        assert_eq!(ct.constraints.len(), 1);
    }

    #[test]
    fn test_parse_begin_variants() {
        let stmt =
            Parser::parse_one("BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY").unwrap();
        assert_eq!(
            stmt,
            Statement::Begin {
                isolation: Some(IsolationLevel::Serializable),
                read_only: Some(true),
            }
        );
        let stmt = Parser::parse_one("START TRANSACTION").unwrap();
        assert_eq!(
            stmt,
            Statement::Begin {
                isolation: None,
                read_only: None
            }
        );
    }

    #[test]
    fn test_parse_rollback_to_savepoint() {
        let stmt = Parser::parse_one("ROLLBACK TO SAVEPOINT sp1 AND CHAIN").unwrap();
        assert_eq!(
            stmt,
            Statement::Rollback {
                savepoint: Some("sp1".to_string()),
                chain: true,
            }
        );
    }

    #[test]
    fn test_parse_cte() {
        let stmt = Parser::parse_one(
            "WITH recent (id) AS (SELECT id FROM orders WHERE ts > 5) \
             SELECT * FROM recent",
        )
        .unwrap();
        let Statement::Select(select) = stmt else {
            panic!("expected select");
        };
        assert_eq!(select.with.len(), 1);
        assert_eq!(select.with[0].name, "recent");
        assert_eq!(select.with[0].columns, vec!["id"]);
    }

    #[test]
    fn test_syntax_error_has_position_and_suggestion() {
        let err = Parser::parse("SELEC 1").unwrap_err();
        let DbError::SyntaxError {
            line,
            column,
            near,
            suggestion,
        } = err
        else {
            panic!("expected syntax error");
        };
        assert_eq!((line, column), (1, 1));
        assert_eq!(near, "SELEC");
        assert_eq!(suggestion.as_deref(), Some("SELECT"));
    }

    #[test]
    fn test_stringify_reparse_roundtrip() {
        let sources = [
            "SELECT DISTINCT a, b AS total FROM t WHERE (a > 1) ORDER BY a ASC LIMIT 5",
            "SELECT * FROM l INNER JOIN r ON (l.id = r.id)",
            "INSERT INTO t (a) VALUES (1) ON CONFLICT (a) DO NOTHING",
            "UPDATE t SET a = (a + 1) WHERE (a < 10)",
            "DELETE FROM t WHERE (a = 1)",
        ];
        for sql in sources {
            let first = Parser::parse_one(sql).unwrap();
            let rendered = first.to_string();
            let second = Parser::parse_one(&rendered).unwrap();
            assert_eq!(second.to_string(), rendered, "unstable render for {}", sql);
        }
    }

    #[test]
    fn test_multiple_statements() {
        let stmts = Parser::parse("BEGIN; INSERT INTO t VALUES (1); COMMIT;").unwrap();
        assert_eq!(stmts.len(), 3);
    }

    #[test]
    fn test_values_literal_types() {
        let stmt = Parser::parse_one("INSERT INTO t VALUES (1, 1.5, 'x', TRUE, NULL)").unwrap();
        let Statement::Insert(insert) = stmt else {
            panic!("expected insert");
        };
        let InsertSource::Values(rows) = &insert.source else {
            panic!("expected values");
        };
        assert_eq!(
            rows[0],
            vec![
                Expr::Literal(Value::Integer(1)),
                Expr::Literal(Value::Float(1.5)),
                Expr::Literal(Value::Text("x".into())),
                Expr::Literal(Value::Boolean(true)),
                Expr::Literal(Value::Null),
            ]
        );
    }
}
