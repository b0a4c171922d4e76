//! Formula tokenizer and parser.
//!
//! Parses formula text into an untyped [`RawScript`]; name resolution and
//! instruction allocation happen afterwards in [`transpile`](super::transpile).
//! Statements are separated by `;` or newlines (newlines inside brackets are
//! ignored); the final statement must be the output expression.

use crate::error::SeriesError;
use smol_str::SmolStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Ident(SmolStr),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Semi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed expression before name resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum RawExpr {
    Number(f64),
    Ident(SmolStr),
    /// `lhs.rhs`, e.g. `options.length` or `BINANCE.vbuy`.
    Member(SmolStr, SmolStr),
    /// `name[k]` offset access.
    Index(SmolStr, Box<RawExpr>),
    Call(SmolStr, Vec<RawExpr>),
    Unary(UnaryOp, Box<RawExpr>),
    Binary(BinaryOp, Box<RawExpr>, Box<RawExpr>),
    /// `{ key: expr, ... }` custom-point object.
    Object(Vec<(SmolStr, RawExpr)>),
}

/// One `name = expr` / `name[window] = expr` assignment, or a bare
/// expression when `target` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStatement {
    pub target: Option<AssignTarget>,
    pub expr: RawExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignTarget {
    pub name: SmolStr,
    /// Window length for `name[window] = ...` declarations; 1 otherwise.
    pub window: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawScript {
    pub statements: Vec<RawStatement>,
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, SeriesError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut depth = 0usize;

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '\n' => {
                chars.next();
                if depth == 0 {
                    tokens.push(Token::Semi);
                }
            }
            '0'..='9' | '.' if c != '.' || matches!(chars.clone().nth(1), Some('0'..='9')) => {
                let mut literal = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| SeriesError::Parse(format!("invalid number '{literal}'")))?;
                tokens.push(Token::Number(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(SmolStr::new(ident)));
            }
            _ => {
                chars.next();
                let token = match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    ',' => Token::Comma,
                    '.' => Token::Dot,
                    ':' => Token::Colon,
                    ';' => Token::Semi,
                    '(' => {
                        depth += 1;
                        Token::LParen
                    }
                    '[' => {
                        depth += 1;
                        Token::LBracket
                    }
                    '{' => {
                        depth += 1;
                        Token::LBrace
                    }
                    ')' => {
                        depth = depth.saturating_sub(1);
                        Token::RParen
                    }
                    ']' => {
                        depth = depth.saturating_sub(1);
                        Token::RBracket
                    }
                    '}' => {
                        depth = depth.saturating_sub(1);
                        Token::RBrace
                    }
                    '=' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::EqEq
                        } else {
                            Token::Assign
                        }
                    }
                    '!' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::NotEq
                        } else {
                            Token::Bang
                        }
                    }
                    '<' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::Le
                        } else {
                            Token::Lt
                        }
                    }
                    '>' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::Ge
                        } else {
                            Token::Gt
                        }
                    }
                    other => {
                        return Err(SeriesError::Parse(format!("unexpected character '{other}'")));
                    }
                };
                tokens.push(token);
            }
        }
    }

    Ok(tokens)
}

/// Parse formula text into statements.
pub fn parse_script(input: &str) -> Result<RawScript, SeriesError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut statements = Vec::new();

    loop {
        parser.skip_semis();
        if parser.at_end() {
            break;
        }
        statements.push(parser.statement()?);
        if !parser.at_end() {
            parser.expect(Token::Semi)?;
        }
    }

    match statements.last() {
        Some(last) if last.target.is_none() => Ok(RawScript { statements }),
        _ => Err(SeriesError::Parse(
            "formula must end with an output expression".to_string(),
        )),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), SeriesError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(SeriesError::Parse(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn skip_semis(&mut self) {
        while self.peek() == Some(&Token::Semi) {
            self.pos += 1;
        }
    }

    fn statement(&mut self) -> Result<RawStatement, SeriesError> {
        if let Some(Token::Ident(name)) = self.peek() {
            let name = name.clone();
            // `name = expr`
            if self.peek_at(1) == Some(&Token::Assign) {
                self.pos += 2;
                let expr = self.expression()?;
                return Ok(RawStatement {
                    target: Some(AssignTarget { name, window: 1 }),
                    expr,
                });
            }
            // `name[window] = expr`
            if self.peek_at(1) == Some(&Token::LBracket)
                && matches!(self.peek_at(2), Some(Token::Number(_)))
                && self.peek_at(3) == Some(&Token::RBracket)
                && self.peek_at(4) == Some(&Token::Assign)
            {
                let Some(Token::Number(window)) = self.peek_at(2).cloned() else {
                    unreachable!()
                };
                if window < 1.0 || window.fract() != 0.0 {
                    return Err(SeriesError::Parse(format!(
                        "variable window must be a positive integer, got {window}"
                    )));
                }
                self.pos += 5;
                let expr = self.expression()?;
                return Ok(RawStatement {
                    target: Some(AssignTarget {
                        name,
                        window: window as usize,
                    }),
                    expr,
                });
            }
        }

        let expr = self.expression()?;
        Ok(RawStatement { target: None, expr })
    }

    fn expression(&mut self) -> Result<RawExpr, SeriesError> {
        self.comparison()
    }

    fn comparison(&mut self) -> Result<RawExpr, SeriesError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = RawExpr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<RawExpr, SeriesError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = RawExpr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<RawExpr, SeriesError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = RawExpr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<RawExpr, SeriesError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(RawExpr::Unary(UnaryOp::Neg, Box::new(self.unary()?)))
            }
            Some(Token::Bang) => {
                self.pos += 1;
                Ok(RawExpr::Unary(UnaryOp::Not, Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<RawExpr, SeriesError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(RawExpr::Number(value)),
            Some(Token::LParen) => {
                let expr = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::LBrace) => self.object(),
            Some(Token::Ident(name)) => match self.peek() {
                Some(Token::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.pos += 1;
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(RawExpr::Call(name, args))
                }
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(member)) => Ok(RawExpr::Member(name, member)),
                        other => Err(SeriesError::Parse(format!(
                            "expected member name after '{name}.', found {other:?}"
                        ))),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expression()?;
                    self.expect(Token::RBracket)?;
                    Ok(RawExpr::Index(name, Box::new(index)))
                }
                _ => Ok(RawExpr::Ident(name)),
            },
            other => Err(SeriesError::Parse(format!(
                "unexpected token {other:?} in expression"
            ))),
        }
    }

    fn object(&mut self) -> Result<RawExpr, SeriesError> {
        let mut fields = Vec::new();
        if self.peek() != Some(&Token::RBrace) {
            loop {
                let key = match self.next() {
                    Some(Token::Ident(key)) => key,
                    other => {
                        return Err(SeriesError::Parse(format!(
                            "expected object key, found {other:?}"
                        )));
                    }
                };
                self.expect(Token::Colon)?;
                let value = self.expression()?;
                fields.push((key, value));
                match self.peek() {
                    Some(Token::Comma) => {
                        self.pos += 1;
                    }
                    _ => break,
                }
            }
        }
        self.expect(Token::RBrace)?;
        Ok(RawExpr::Object(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(script: &RawScript) -> &RawExpr {
        &script.statements.last().unwrap().expr
    }

    #[test]
    fn test_precedence() {
        let script = parse_script("1 + 2 * 3").unwrap();
        assert_eq!(
            *output(&script),
            RawExpr::Binary(
                BinaryOp::Add,
                Box::new(RawExpr::Number(1.0)),
                Box::new(RawExpr::Binary(
                    BinaryOp::Mul,
                    Box::new(RawExpr::Number(2.0)),
                    Box::new(RawExpr::Number(3.0)),
                )),
            )
        );
    }

    #[test]
    fn test_comparison_binds_loosest() {
        let script = parse_script("vbuy - vsell > 0").unwrap();
        match output(&script) {
            RawExpr::Binary(BinaryOp::Gt, lhs, rhs) => {
                assert!(matches!(**lhs, RawExpr::Binary(BinaryOp::Sub, _, _)));
                assert_eq!(**rhs, RawExpr::Number(0.0));
            }
            other => panic!("expected comparison at root, got {other:?}"),
        }
    }

    #[test]
    fn test_call_member_and_index() {
        let script = parse_script("avg(BINANCE.vbuy, options.length)").unwrap();
        match output(&script) {
            RawExpr::Call(name, args) => {
                assert_eq!(name, "avg");
                assert_eq!(args[0], RawExpr::Member("BINANCE".into(), "vbuy".into()));
                assert_eq!(args[1], RawExpr::Member("options".into(), "length".into()));
            }
            other => panic!("expected call, got {other:?}"),
        }

        let script = parse_script("delta = vbuy - vsell; delta[2]").unwrap();
        assert_eq!(script.statements.len(), 2);
        match output(&script) {
            RawExpr::Index(name, index) => {
                assert_eq!(name, "delta");
                assert_eq!(**index, RawExpr::Number(2.0));
            }
            other => panic!("expected index, got {other:?}"),
        }
    }

    #[test]
    fn test_assignment_statements() {
        let script = parse_script("delta = vbuy - vsell\nsmoothed[8] = delta\nsmoothed").unwrap();
        assert_eq!(script.statements.len(), 3);
        assert_eq!(
            script.statements[0].target,
            Some(AssignTarget {
                name: "delta".into(),
                window: 1
            })
        );
        assert_eq!(
            script.statements[1].target,
            Some(AssignTarget {
                name: "smoothed".into(),
                window: 8
            })
        );
        assert_eq!(script.statements[2].target, None);
    }

    #[test]
    fn test_newlines_inside_brackets_continue_expression() {
        let script = parse_script("avg(\n    vbuy + vsell,\n    14\n)").unwrap();
        assert_eq!(script.statements.len(), 1);
    }

    #[test]
    fn test_object_literal() {
        let script = parse_script("{ delta: vbuy - vsell, total: vbuy + vsell }").unwrap();
        match output(&script) {
            RawExpr::Object(fields) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].0, "delta");
                assert_eq!(fields[1].0, "total");
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_failures() {
        struct TestCase {
            input: &'static str,
        }

        let tests = vec![
            // TC0: trailing operator
            TestCase { input: "vbuy +" },
            // TC1: unbalanced paren
            TestCase { input: "avg(vbuy, 14" },
            // TC2: assignment as final statement
            TestCase { input: "delta = vbuy" },
            // TC3: empty formula
            TestCase { input: "" },
            // TC4: fractional variable window
            TestCase { input: "x[1.5] = vbuy; x" },
            // TC5: stray character
            TestCase { input: "vbuy @ vsell" },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = parse_script(test.input);
            assert!(
                matches!(actual, Err(SeriesError::Parse(_))),
                "TC{} expected parse failure, got {:?}",
                index,
                actual
            );
        }
    }
}
