// Lexer.
//
// Character-level tokenizer with line/column tracking. Whitespace and both
// comment forms (`--` to end of line, `/* */` blocks) are discarded.

use crate::error::{DbError, Result};
use crate::parser::token::{Keyword, Token, TokenKind};

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if eof {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_ahead(&self, n: usize) -> Option<char> {
        self.input.get(self.pos + n).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('-') if self.peek_ahead(1) == Some('-') => {
                    while let Some(c) = self.advance() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.peek_ahead(1) == Some('*') => {
                    let (line, column) = (self.line, self.column);
                    self.advance();
                    self.advance();
                    let mut closed = false;
                    while let Some(c) = self.advance() {
                        if c == '*' && self.peek() == Some('/') {
                            self.advance();
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(DbError::syntax(line, column, "/*"));
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_trivia()?;

        let (line, column) = (self.line, self.column);
        let token = |kind| Token::new(kind, line, column);

        let Some(c) = self.peek() else {
            return Ok(token(TokenKind::Eof));
        };

        let single = match c {
            ',' => Some(TokenKind::Comma),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            ';' => Some(TokenKind::Semicolon),
            '.' => Some(TokenKind::Dot),
            '*' => Some(TokenKind::Star),
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '/' => Some(TokenKind::Slash),
            '%' => Some(TokenKind::Percent),
            '=' => Some(TokenKind::Eq),
            '~' => Some(TokenKind::Tilde),
            _ => None,
        };
        if let Some(kind) = single {
            self.advance();
            return Ok(token(kind));
        }

        match c {
            '|' => {
                self.advance();
                if self.peek() == Some('|') {
                    self.advance();
                    Ok(token(TokenKind::Concat))
                } else {
                    Err(DbError::syntax(line, column, "|"))
                }
            }
            '!' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    Ok(token(TokenKind::NotEq))
                } else {
                    Err(DbError::syntax(line, column, "!"))
                }
            }
            '<' => {
                self.advance();
                match self.peek() {
                    Some('=') => {
                        self.advance();
                        Ok(token(TokenKind::LtEq))
                    }
                    Some('>') => {
                        self.advance();
                        Ok(token(TokenKind::NotEq))
                    }
                    _ => Ok(token(TokenKind::Lt)),
                }
            }
            '>' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    Ok(token(TokenKind::GtEq))
                } else {
                    Ok(token(TokenKind::Gt))
                }
            }
            '\'' => {
                let s = self.read_string(line, column)?;
                Ok(token(TokenKind::Str(s)))
            }
            '"' => {
                let ident = self.read_quoted_ident(line, column)?;
                Ok(token(TokenKind::Ident(ident)))
            }
            c if c.is_ascii_digit() => {
                let n = self.read_number();
                Ok(token(TokenKind::Number(n)))
            }
            c if c.is_alphabetic() || c == '_' => {
                let word = self.read_word();
                match Keyword::lookup(&word) {
                    Some(kw) => Ok(token(TokenKind::Keyword(kw))),
                    None => Ok(token(TokenKind::Ident(word))),
                }
            }
            other => Err(DbError::syntax(line, column, other.to_string())),
        }
    }

    fn read_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }
        word
    }

    fn read_number(&mut self) -> String {
        let mut number = String::new();
        let mut has_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                number.push(c);
                self.advance();
            } else if c == '.' && !has_dot && self.peek_ahead(1).is_some_and(|n| n.is_ascii_digit())
            {
                has_dot = true;
                number.push(c);
                self.advance();
            } else {
                break;
            }
        }
        number
    }

    /// Single-quoted string; `''` escapes a quote.
    fn read_string(&mut self, line: u32, column: u32) -> Result<String> {
        self.advance();
        let mut s = String::new();
        while let Some(c) = self.advance() {
            if c == '\'' {
                if self.peek() == Some('\'') {
                    s.push('\'');
                    self.advance();
                } else {
                    return Ok(s);
                }
            } else {
                s.push(c);
            }
        }
        Err(DbError::syntax(line, column, "'"))
    }

    /// Double-quoted identifier; `""` escapes a quote.
    fn read_quoted_ident(&mut self, line: u32, column: u32) -> Result<String> {
        self.advance();
        let mut ident = String::new();
        while let Some(c) = self.advance() {
            if c == '"' {
                if self.peek() == Some('"') {
                    ident.push('"');
                    self.advance();
                } else {
                    return Ok(ident);
                }
            } else {
                ident.push(c);
            }
        }
        Err(DbError::syntax(line, column, "\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        Lexer::new(sql)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_basic_select() {
        let tokens = kinds("SELECT * FROM users WHERE id = 1;");
        assert_eq!(tokens[0], TokenKind::Keyword(Keyword::Select));
        assert_eq!(tokens[1], TokenKind::Star);
        assert_eq!(tokens[3], TokenKind::Ident("users".into()));
        assert_eq!(tokens[6], TokenKind::Eq);
        assert_eq!(tokens[7], TokenKind::Number("1".into()));
        assert_eq!(*tokens.last().unwrap(), TokenKind::Eof);
    }

    #[test]
    fn test_comments_discarded() {
        let tokens = kinds("SELECT 1 -- trailing\n/* block\ncomment */ , 2");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Keyword(Keyword::Select),
                TokenKind::Number("1".into()),
                TokenKind::Comma,
                TokenKind::Number("2".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_line_column_tracking() {
        let tokens = Lexer::new("SELECT\n  name").tokenize().unwrap();
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = kinds("'O''Reilly'");
        assert_eq!(tokens[0], TokenKind::Str("O'Reilly".into()));
    }

    #[test]
    fn test_operators() {
        let tokens = kinds("<> != <= >= || ~ %");
        assert_eq!(
            tokens,
            vec![
                TokenKind::NotEq,
                TokenKind::NotEq,
                TokenKind::LtEq,
                TokenKind::GtEq,
                TokenKind::Concat,
                TokenKind::Tilde,
                TokenKind::Percent,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_number_vs_qualified_name() {
        assert_eq!(
            kinds("1.5"),
            vec![TokenKind::Number("1.5".into()), TokenKind::Eof]
        );
        assert_eq!(
            kinds("a.b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Dot,
                TokenKind::Ident("b".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string_errors() {
        let err = Lexer::new("'oops").tokenize().unwrap_err();
        assert!(matches!(err, DbError::SyntaxError { line: 1, .. }));
    }

    #[test]
    fn test_unterminated_block_comment_errors() {
        assert!(Lexer::new("SELECT /* nope").tokenize().is_err());
    }
}
