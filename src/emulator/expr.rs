//! Restricted expression evaluator for emulated sensor values (spec.md §4.8, §9).
//!
//! The source evaluates arbitrary Python strings with `eval`. Per the §9
//! redesign note this is replaced with a small recursive-descent parser
//! over a fixed grammar and a whitelist of identifiers: `sin`, `cos`,
//! `sqrt`, `min`, `max`, the tick counter `x`, and the constants `pi`/`e`.
//! There is no way to reach a file, a socket, or anything reflective from
//! this evaluator — unknown identifiers are a parse error.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    UnexpectedToken(String),
    UnexpectedEnd,
    UnknownIdentifier(String),
    WrongArity { name: String, expected: usize, got: usize },
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::UnexpectedToken(t) => write!(f, "unexpected token `{t}`"),
            ExprError::UnexpectedEnd => write!(f, "unexpected end of expression"),
            ExprError::UnknownIdentifier(name) => write!(f, "unknown identifier `{name}`"),
            ExprError::WrongArity { name, expected, got } => {
                write!(f, "`{name}` expects {expected} argument(s), got {got}")
            }
        }
    }
}

impl std::error::Error for ExprError {}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Tick,
    Constant(f64),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// A parsed expression, ready to be evaluated repeatedly against
/// successive tick values without re-parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr(Expr);

impl CompiledExpr {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::UnexpectedToken(
                parser.tokens[parser.pos].clone(),
            ));
        }
        Ok(CompiledExpr(expr))
    }

    /// Evaluate with `x` bound to the current tick counter.
    #[must_use]
    pub fn eval(&self, x: f64) -> f64 {
        eval_expr(&self.0, x)
    }
}

fn eval_expr(expr: &Expr, x: f64) -> f64 {
    match expr {
        Expr::Number(n) => *n,
        Expr::Tick => x,
        Expr::Constant(c) => *c,
        Expr::Neg(e) => -eval_expr(e, x),
        Expr::Add(a, b) => eval_expr(a, x) + eval_expr(b, x),
        Expr::Sub(a, b) => eval_expr(a, x) - eval_expr(b, x),
        Expr::Mul(a, b) => eval_expr(a, x) * eval_expr(b, x),
        Expr::Div(a, b) => eval_expr(a, x) / eval_expr(b, x),
        Expr::Call(name, args) => {
            let values: Vec<f64> = args.iter().map(|a| eval_expr(a, x)).collect();
            match name.as_str() {
                "sin" => values[0].sin(),
                "cos" => values[0].cos(),
                "sqrt" => values[0].sqrt(),
                "min" => values[0].min(values[1]),
                "max" => values[0].max(values[1]),
                // Unreachable: `parse_call` rejects any other name before
                // this point ever runs.
                other => unreachable!("unwhitelisted call `{other}` survived parsing"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

fn tokenize(source: &str) -> Result<Vec<String>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect());
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect());
        } else if "+-*/(),".contains(c) {
            tokens.push(c.to_string());
            i += 1;
        } else {
            return Err(ExprError::UnexpectedToken(c.to_string()));
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Recursive-descent parser: expr := term (('+'|'-') term)*
//                            term := unary (('*'|'/') unary)*
//                            unary := '-' unary | primary
//                            primary := number | ident | ident '(' args ')' | '(' expr ')'
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn advance(&mut self) -> Result<String, ExprError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, expected: &str) -> Result<(), ExprError> {
        let tok = self.advance()?;
        if tok != expected {
            return Err(ExprError::UnexpectedToken(tok));
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        let mut node = self.parse_term()?;
        while let Some(op) = self.peek() {
            match op {
                "+" => {
                    self.advance()?;
                    node = Expr::Add(Box::new(node), Box::new(self.parse_term()?));
                }
                "-" => {
                    self.advance()?;
                    node = Expr::Sub(Box::new(node), Box::new(self.parse_term()?));
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_term(&mut self) -> Result<Expr, ExprError> {
        let mut node = self.parse_unary()?;
        while let Some(op) = self.peek() {
            match op {
                "*" => {
                    self.advance()?;
                    node = Expr::Mul(Box::new(node), Box::new(self.parse_unary()?));
                }
                "/" => {
                    self.advance()?;
                    node = Expr::Div(Box::new(node), Box::new(self.parse_unary()?));
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some("-") {
            self.advance()?;
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let tok = self.advance()?;
        if tok == "(" {
            let inner = self.parse_expr()?;
            self.expect(")")?;
            return Ok(inner);
        }
        if let Ok(n) = tok.parse::<f64>() {
            return Ok(Expr::Number(n));
        }
        if tok.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_') {
            return self.parse_identifier(tok);
        }
        Err(ExprError::UnexpectedToken(tok))
    }

    fn parse_identifier(&mut self, name: String) -> Result<Expr, ExprError> {
        if self.peek() == Some("(") {
            self.advance()?;
            let mut args = Vec::new();
            if self.peek() != Some(")") {
                args.push(self.parse_expr()?);
                while self.peek() == Some(",") {
                    self.advance()?;
                    args.push(self.parse_expr()?);
                }
            }
            self.expect(")")?;
            let expected = match name.as_str() {
                "sin" | "cos" | "sqrt" => 1,
                "min" | "max" => 2,
                other => return Err(ExprError::UnknownIdentifier(other.to_owned())),
            };
            if args.len() != expected {
                return Err(ExprError::WrongArity {
                    name,
                    expected,
                    got: args.len(),
                });
            }
            return Ok(Expr::Call(name, args));
        }

        match name.as_str() {
            "x" => Ok(Expr::Tick),
            "pi" => Ok(Expr::Constant(std::f64::consts::PI)),
            "e" => Ok(Expr::Constant(std::f64::consts::E)),
            other => Err(ExprError::UnknownIdentifier(other.to_owned())),
        }
    }
}
