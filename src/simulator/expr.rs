//! Arithmetic expressions used by derived and linked properties
//!
//! Supports numbers, identifiers, `+ - * /`, parentheses, unary minus and the
//! functions `min`, `max`, `abs`, `floor` and `ceil`. Identifiers are resolved
//! at evaluation time through a caller-supplied lookup.

use crate::error::{DeError, Result};

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Symbol(String),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Every identifier referenced by the expression
    pub fn symbols(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Symbol(s) => {
                if !out.contains(&s.as_str()) {
                    out.push(s);
                }
            }
            Expr::Neg(e) => e.collect_symbols(out),
            Expr::Binary(l, _, r) => {
                l.collect_symbols(out);
                r.collect_symbols(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_symbols(out)),
        }
    }

    /// Evaluate with `lookup` resolving identifiers
    pub fn eval<F>(&self, lookup: &mut F) -> std::result::Result<f64, String>
    where
        F: FnMut(&str) -> Option<f64>,
    {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Symbol(s) => lookup(s).ok_or_else(|| format!("unknown symbol `{}`", s)),
            Expr::Neg(e) => Ok(-e.eval(lookup)?),
            Expr::Binary(l, op, r) => {
                let l = l.eval(lookup)?;
                let r = r.eval(lookup)?;
                match op {
                    BinOp::Add => Ok(l + r),
                    BinOp::Sub => Ok(l - r),
                    BinOp::Mul => Ok(l * r),
                    BinOp::Div if r == 0.0 => Err("division by zero".to_string()),
                    BinOp::Div => Ok(l / r),
                }
            }
            Expr::Call(name, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(lookup))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                call(name, &values)
            }
        }
    }
}

fn call(name: &str, args: &[f64]) -> std::result::Result<f64, String> {
    let unary = |f: fn(f64) -> f64| match args {
        [x] => Ok(f(*x)),
        _ => Err(format!("`{}` takes exactly one argument", name)),
    };
    match name {
        "min" | "max" if args.is_empty() => Err(format!("`{}` needs at least one argument", name)),
        "min" => Ok(args.iter().copied().fold(f64::INFINITY, f64::min)),
        "max" => Ok(args.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        "abs" => unary(f64::abs),
        "floor" => unary(f64::floor),
        "ceil" => unary(f64::ceil),
        other => Err(format!("unknown function `{}`", other)),
    }
}

/// Parse and evaluate in one step
///
/// # Errors
///
/// - [`DeError::Expression`] - Syntax error, unknown symbol or function, or division by zero
///
/// # Examples
///
/// ```
/// use deapi::simulator::expr::evaluate;
///
/// let v = evaluate("min(value, 1024 - offset)", |s| match s {
///     "value" => Some(2048.0),
///     "offset" => Some(512.0),
///     _ => None,
/// })?;
/// assert_eq!(v, 512.0);
/// # Ok::<(), deapi::DeError>(())
/// ```
pub fn evaluate<F>(source: &str, mut lookup: F) -> Result<f64>
where
    F: FnMut(&str) -> Option<f64>,
{
    let expr = Expr::parse(source)?;
    expr.eval(&mut lookup).map_err(|reason| DeError::Expression {
        expr: source.to_string(),
        reason,
    })
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // exponent, e.g. 1e-3
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '-' || chars[j] == '+') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse().map_err(|_| DeError::Expression {
                    expr: source.to_string(),
                    reason: format!("invalid number `{}`", text),
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            other => {
                return Err(DeError::Expression {
                    expr: source.to_string(),
                    reason: format!("unexpected character `{}`", other),
                })
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> DeError {
        DeError::Expression {
            expr: self.source.to_string(),
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            let op = if c == '+' { BinOp::Add } else { BinOp::Sub };
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(c @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            let op = if c == '*' { BinOp::Mul } else { BinOp::Div };
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expr()?);
                            match self.next() {
                                Some(Token::Comma) => continue,
                                Some(Token::RParen) => break,
                                _ => return Err(self.error("expected `,` or `)`")),
                            }
                        }
                    } else {
                        self.pos += 1;
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Symbol(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected `)`")),
                }
            }
            _ => Err(self.error("unexpected end of expression")),
        }
    }
}
