//! Recursive-descent parser with Pratt-style binding powers for the
//! arithmetic operators.

use tether::error::ScriptError;

use crate::ast::{BinOp, Expr, Stmt, StmtKind};
use crate::lexer::{Spanned, Token, syntax, tokenize};

pub fn parse(source: &str, script_name: &str) -> Result<Vec<Stmt>, ScriptError> {
    let tokens = tokenize(source, script_name)?;
    Parser {
        tokens,
        pos: 0,
        script_name,
    }
    .program()
}

struct Parser<'a> {
    tokens: Vec<Spanned>,
    pos: usize,
    script_name: &'a str,
}

impl Parser<'_> {
    fn program(mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = Vec::new();
        loop {
            while matches!(self.peek(), Some(Token::Newline)) {
                self.pos += 1;
            }
            let Some(spanned) = self.tokens.get(self.pos) else {
                return Ok(stmts);
            };
            let line = spanned.line;

            let kind = if let (Some(Token::Name(target)), Some(Token::Assign)) =
                (self.peek(), self.peek_at(1))
            {
                let target = target.clone();
                self.pos += 2;
                StmtKind::Assign {
                    target,
                    value: self.expr(0)?,
                }
            } else {
                StmtKind::Expr(self.expr(0)?)
            };
            stmts.push(Stmt { kind, line });

            match self.next() {
                None | Some((Token::Newline, ..)) => {}
                Some((token, line, column)) => {
                    return Err(syntax(
                        &format!("unexpected token {token:?} after statement"),
                        self.script_name,
                        line,
                        column,
                    ));
                }
            }
        }
    }

    fn expr(&mut self, min_bp: u8) -> Result<Expr, ScriptError> {
        let mut left = self.primary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            let bp = match op {
                BinOp::Add | BinOp::Sub => 1,
                BinOp::Mul | BinOp::Div => 2,
            };
            if bp < min_bp {
                break;
            }
            self.pos += 1;
            let right = self.expr(bp + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        let Some((token, line, column)) = self.next() else {
            return Err(self.eof());
        };
        let mut expr = match token {
            Token::Int(n) => Expr::Int(n),
            Token::Float(f) => Expr::Float(f),
            Token::Str(s) => Expr::Str(s),
            Token::Minus => Expr::Neg(Box::new(self.primary()?)),
            Token::LParen => {
                let inner = self.expr(0)?;
                self.expect_rparen()?;
                inner
            }
            Token::Name(name) => self.name_or_call(name, line, column)?,
            other => {
                return Err(syntax(
                    &format!("unexpected token {other:?}"),
                    self.script_name,
                    line,
                    column,
                ));
            }
        };

        // Postfix subscripts bind tightest.
        while matches!(self.peek(), Some(Token::LBracket)) {
            self.pos += 1;
            let index = self.expr(0)?;
            match self.next() {
                Some((Token::RBracket, ..)) => {}
                Some((token, line, column)) => {
                    return Err(syntax(
                        &format!("expected `]`, found {token:?}"),
                        self.script_name,
                        line,
                        column,
                    ));
                }
                None => return Err(self.eof()),
            }
            expr = Expr::Subscript {
                target: Box::new(expr),
                index: Box::new(index),
            };
        }
        Ok(expr)
    }

    /// A bare name, a keyword literal, or a (possibly dotted) call.
    fn name_or_call(&mut self, name: String, line: u32, column: u32) -> Result<Expr, ScriptError> {
        let mut path = name;
        while matches!(self.peek(), Some(Token::Dot)) {
            match self.peek_at(1) {
                Some(Token::Name(part)) => {
                    path.push('.');
                    path.push_str(part);
                    self.pos += 2;
                }
                _ => {
                    return Err(syntax(
                        "expected a name after `.`",
                        self.script_name,
                        line,
                        column,
                    ));
                }
            }
        }

        if matches!(self.peek(), Some(Token::LParen)) {
            self.pos += 1;
            let (args, kwargs) = self.arguments()?;
            return Ok(Expr::Call {
                method_call: path.contains('.'),
                function: path,
                args,
                kwargs,
            });
        }
        if path.contains('.') {
            return Err(syntax(
                "attribute access is only valid in a call",
                self.script_name,
                line,
                column,
            ));
        }
        Ok(match path.as_str() {
            "None" => Expr::None,
            "True" => Expr::Bool(true),
            "False" => Expr::Bool(false),
            _ => Expr::Name(path),
        })
    }

    fn arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ScriptError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.pos += 1;
            return Ok((args, kwargs));
        }
        loop {
            if let (Some(Token::Name(key)), Some(Token::Assign)) = (self.peek(), self.peek_at(1)) {
                let key = key.clone();
                self.pos += 2;
                kwargs.push((key, self.expr(0)?));
            } else {
                if !kwargs.is_empty() {
                    let (line, column) = self.position();
                    return Err(syntax(
                        "positional argument follows keyword argument",
                        self.script_name,
                        line,
                        column,
                    ));
                }
                args.push(self.expr(0)?);
            }
            match self.next() {
                Some((Token::Comma, ..)) => {}
                Some((Token::RParen, ..)) => return Ok((args, kwargs)),
                Some((token, line, column)) => {
                    return Err(syntax(
                        &format!("expected `,` or `)`, found {token:?}"),
                        self.script_name,
                        line,
                        column,
                    ));
                }
                None => return Err(self.eof()),
            }
        }
    }

    fn expect_rparen(&mut self) -> Result<(), ScriptError> {
        match self.next() {
            Some((Token::RParen, ..)) => Ok(()),
            Some((token, line, column)) => Err(syntax(
                &format!("expected `)`, found {token:?}"),
                self.script_name,
                line,
                column,
            )),
            None => Err(self.eof()),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|s| &s.token)
    }

    fn next(&mut self) -> Option<(Token, u32, u32)> {
        let spanned = self.tokens.get(self.pos)?.clone();
        self.pos += 1;
        Some((spanned.token, spanned.line, spanned.column))
    }

    fn position(&self) -> (u32, u32) {
        self.tokens
            .get(self.pos)
            .map_or((0, 0), |s| (s.line, s.column))
    }

    fn eof(&self) -> ScriptError {
        let (line, column) = self
            .tokens
            .last()
            .map_or((1, 1), |s| (s.line, s.column));
        syntax("unexpected end of input", self.script_name, line, column)
    }
}
