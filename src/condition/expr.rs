//! Restricted expression language for CONDITIONAL edges.
//!
//! Supported: literals (null, booleans, numbers, strings), dotted key
//! lookup into shared memory, unary `!`/`-`, and the binary operators
//! `== != < <= > >= && || + - * / %`. No function calls and no user code
//! execution. Expressions are parsed once at graph validation; evaluation
//! errors at run time fail closed (the edge does not fire).

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::memory::{lookup_path, MemorySnapshot};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    /// Dotted lookup into shared memory, e.g. `user.profile.age`.
    Path(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(EngineError::validation(format!(
                                "unterminated string literal in expression: {input}"
                            )))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = s.parse::<f64>().map_err(|_| {
                    EngineError::validation(format!("invalid number literal: {s}"))
                })?;
                tokens.push(Token::Number(n));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                chars.next();
                let two = chars.peek().copied();
                let op = match (c, two) {
                    ('=', Some('=')) => {
                        chars.next();
                        "=="
                    }
                    ('!', Some('=')) => {
                        chars.next();
                        "!="
                    }
                    ('<', Some('=')) => {
                        chars.next();
                        "<="
                    }
                    ('>', Some('=')) => {
                        chars.next();
                        ">="
                    }
                    ('&', Some('&')) => {
                        chars.next();
                        "&&"
                    }
                    ('|', Some('|')) => {
                        chars.next();
                        "||"
                    }
                    ('!', _) => "!",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    _ => {
                        return Err(EngineError::validation(format!(
                            "unexpected character '{c}' in expression: {input}"
                        )))
                    }
                };
                tokens.push(Token::Op(op));
            }
            '+' | '-' | '*' | '/' | '%' => {
                chars.next();
                let op = match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    _ => "%",
                };
                tokens.push(Token::Op(op));
            }
            _ => {
                return Err(EngineError::validation(format!(
                    "unexpected character '{c}' in expression: {input}"
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_op("||") {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_equality()?;
        while self.eat_op("&&") {
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = if self.eat_op("==") {
                BinOp::Eq
            } else if self.eat_op("!=") {
                BinOp::Ne
            } else {
                break;
            };
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = if self.eat_op("<=") {
                BinOp::Le
            } else if self.eat_op(">=") {
                BinOp::Ge
            } else if self.eat_op("<") {
                BinOp::Lt
            } else if self.eat_op(">") {
                BinOp::Gt
            } else {
                break;
            };
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("/") {
                BinOp::Div
            } else if self.eat_op("%") {
                BinOp::Rem
            } else {
                break;
            };
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat_op("!") {
            return Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)));
        }
        if self.eat_op("-") {
            return Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Bool(true),
                "false" => Expr::Bool(false),
                "null" => Expr::Null,
                _ => Expr::Path(name),
            }),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(EngineError::validation("expected ')' in expression")),
                }
            }
            other => Err(EngineError::validation(format!(
                "unexpected token in expression: {other:?}"
            ))),
        }
    }
}

impl Expr {
    /// Parses an expression source. Called once at graph validation;
    /// a parse failure is a ValidationError, never a run-time one.
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(EngineError::validation("empty condition expression"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(EngineError::validation(format!(
                "trailing tokens in expression: {input}"
            )));
        }
        Ok(expr)
    }

    /// Evaluates against a memory snapshot. Errors (missing keys, type
    /// mismatches) propagate so the caller can fail closed.
    pub fn eval(&self, memory: &MemorySnapshot) -> Result<Value> {
        match self {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(number(*n)),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Path(path) => lookup_path(memory, path)
                .cloned()
                .ok_or_else(|| EngineError::internal(format!("key not found: {path}"))),
            Expr::Unary(op, inner) => {
                let v = inner.eval(memory)?;
                match op {
                    UnOp::Not => Ok(Value::Bool(!truthy(&v))),
                    UnOp::Neg => as_number(&v).map(|n| number(-n)),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                // Short-circuit the boolean operators.
                match op {
                    BinOp::And => {
                        if !truthy(&lhs.eval(memory)?) {
                            return Ok(Value::Bool(false));
                        }
                        return Ok(Value::Bool(truthy(&rhs.eval(memory)?)));
                    }
                    BinOp::Or => {
                        if truthy(&lhs.eval(memory)?) {
                            return Ok(Value::Bool(true));
                        }
                        return Ok(Value::Bool(truthy(&rhs.eval(memory)?)));
                    }
                    _ => {}
                }

                let l = lhs.eval(memory)?;
                let r = rhs.eval(memory)?;
                match op {
                    BinOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
                    BinOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
                    BinOp::Lt => compare(&l, &r).map(|o| Value::Bool(o.is_lt())),
                    BinOp::Le => compare(&l, &r).map(|o| Value::Bool(o.is_le())),
                    BinOp::Gt => compare(&l, &r).map(|o| Value::Bool(o.is_gt())),
                    BinOp::Ge => compare(&l, &r).map(|o| Value::Bool(o.is_ge())),
                    BinOp::Add => match (&l, &r) {
                        (Value::String(a), Value::String(b)) => {
                            Ok(Value::String(format!("{a}{b}")))
                        }
                        _ => Ok(number(as_number(&l)? + as_number(&r)?)),
                    },
                    BinOp::Sub => Ok(number(as_number(&l)? - as_number(&r)?)),
                    BinOp::Mul => Ok(number(as_number(&l)? * as_number(&r)?)),
                    BinOp::Div => {
                        let d = as_number(&r)?;
                        if d == 0.0 {
                            return Err(EngineError::internal("division by zero"));
                        }
                        Ok(number(as_number(&l)? / d))
                    }
                    BinOp::Rem => {
                        let d = as_number(&r)?;
                        if d == 0.0 {
                            return Err(EngineError::internal("remainder by zero"));
                        }
                        Ok(number(as_number(&l)? % d))
                    }
                    BinOp::And | BinOp::Or => unreachable!(),
                }
            }
        }
    }

    /// Evaluates to a boolean, failing closed: any evaluation error is
    /// treated as `false`.
    pub fn eval_bool(&self, memory: &MemorySnapshot) -> bool {
        match self.eval(memory) {
            Ok(v) => truthy(&v),
            Err(e) => {
                tracing::warn!("condition evaluation failed closed: {e}");
                false
            }
        }
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(v: &Value) -> Result<f64> {
    v.as_f64()
        .ok_or_else(|| EngineError::internal(format!("expected number, got {v}")))
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering> {
    match (l, r) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => {
            let a = as_number(l)?;
            let b = as_number(r)?;
            a.partial_cmp(&b)
                .ok_or_else(|| EngineError::internal("incomparable numbers"))
        }
    }
}
