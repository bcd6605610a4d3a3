//! Resource Expressions
//!
//! Rules declare resources either as plain integers or as small arithmetic
//! expressions evaluated once per job:
//!
//! ```text
//! mem_mb: "max(1000, input_size_mb * 3)"
//! disk_mb: "input_size_mb + 500"
//! runtime: "chunks * 10"          # `chunks` is a numeric wildcard
//! ```
//!
//! Supported: numeric literals, `+ - * /`, unary minus, parentheses,
//! `min(a, b, ...)`, `max(a, b, ...)` and the identifiers `input_size`
//! (bytes), `input_size_mb`, `threads` and any wildcard of the rule
//! (`sample` or `wildcards.sample`) whose value is numeric.

use std::fmt;

use super::model::ResourceValue;
use super::wildcards::Wildcards;

/// Values an expression may refer to.
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    pub wildcards: &'a Wildcards,
    /// Total size of existing inputs in bytes.
    pub input_size: u64,
    pub threads: u64,
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

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceExpr {
    Number(f64),
    Var(String),
    Neg(Box<ResourceExpr>),
    Binary(Box<ResourceExpr>, char, Box<ResourceExpr>),
    Call(String, Vec<ResourceExpr>),
}

impl ResourceExpr {
    /// Parses an expression.
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!("unexpected token {:?}", parser.tokens[parser.pos]));
        }
        Ok(expr)
    }

    /// Evaluates the expression.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<f64, String> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Var(name) => lookup(name, ctx),
            Self::Neg(inner) => Ok(-inner.evaluate(ctx)?),
            Self::Binary(lhs, op, rhs) => {
                let a = lhs.evaluate(ctx)?;
                let b = rhs.evaluate(ctx)?;
                match op {
                    '+' => Ok(a + b),
                    '-' => Ok(a - b),
                    '*' => Ok(a * b),
                    '/' if b == 0.0 => Err("division by zero".to_string()),
                    '/' => Ok(a / b),
                    other => Err(format!("unknown operator '{}'", other)),
                }
            }
            Self::Call(func, args) => {
                if args.is_empty() {
                    return Err(format!("{}() needs at least one argument", func));
                }
                let values = args
                    .iter()
                    .map(|a| a.evaluate(ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                match func.as_str() {
                    "min" => Ok(values.into_iter().fold(f64::INFINITY, f64::min)),
                    "max" => Ok(values.into_iter().fold(f64::NEG_INFINITY, f64::max)),
                    other => Err(format!("unknown function '{}'", other)),
                }
            }
        }
    }

    /// Identifiers referenced by the expression.
    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut Vec<String>) {
        match self {
            Self::Number(_) => {}
            Self::Var(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Self::Neg(inner) => inner.collect_variables(out),
            Self::Binary(lhs, _, rhs) => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
            Self::Call(_, args) => args.iter().for_each(|a| a.collect_variables(out)),
        }
    }
}

/// A rule resource after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Fixed(u64),
    Expr { source: String, expr: ResourceExpr },
}

impl ResourceSpec {
    pub fn from_value(value: &ResourceValue) -> Result<Self, String> {
        match value {
            ResourceValue::Amount(n) => Ok(Self::Fixed(*n)),
            ResourceValue::Expression(source) => {
                let trimmed = source.trim();
                if let Ok(n) = trimmed.parse::<u64>() {
                    return Ok(Self::Fixed(n));
                }
                Ok(Self::Expr {
                    source: trimmed.to_string(),
                    expr: ResourceExpr::parse(trimmed)?,
                })
            }
        }
    }

    /// Resolves to a whole amount, rounding up.
    pub fn resolve(&self, ctx: &EvalContext<'_>) -> Result<u64, String> {
        match self {
            Self::Fixed(n) => Ok(*n),
            Self::Expr { expr, .. } => {
                let value = expr.evaluate(ctx)?;
                if !value.is_finite() {
                    return Err(format!("result is not finite ({})", value));
                }
                if value < 0.0 {
                    return Err(format!("result is negative ({})", value));
                }
                Ok(value.ceil() as u64)
            }
        }
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "{}", n),
            Self::Expr { source, .. } => write!(f, "{}", source),
        }
    }
}

fn lookup(name: &str, ctx: &EvalContext<'_>) -> Result<f64, String> {
    match name {
        "input_size" => Ok(ctx.input_size as f64),
        "input_size_mb" => Ok(ctx.input_size as f64 / (1024.0 * 1024.0)),
        "threads" => Ok(ctx.threads as f64),
        _ => {
            let key = name.strip_prefix("wildcards.").unwrap_or(name);
            let value = ctx
                .wildcards
                .get(key)
                .ok_or_else(|| format!("unknown identifier '{}'", name))?;
            value
                .parse::<f64>()
                .map_err(|_| format!("wildcard '{}' = '{}' is not numeric", key, value))
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
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
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    Ok(tokens)
}

/// Recursive descent: expression := term (('+'|'-') term)*
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expression(&mut self) -> Result<ResourceExpr, String> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op)) = self.peek().cloned() {
            if op != '+' && op != '-' {
                break;
            }
            self.pos += 1;
            let rhs = self.term()?;
            lhs = ResourceExpr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<ResourceExpr, String> {
        let mut lhs = self.factor()?;
        while let Some(Token::Op(op)) = self.peek().cloned() {
            if op != '*' && op != '/' {
                break;
            }
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = ResourceExpr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<ResourceExpr, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(ResourceExpr::Number(n)),
            Some(Token::Op('-')) => Ok(ResourceExpr::Neg(Box::new(self.factor()?))),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(ResourceExpr::Var(name));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() == Some(&Token::RParen) {
                    self.pos += 1;
                    return Ok(ResourceExpr::Call(name, args));
                }
                loop {
                    args.push(self.expression()?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RParen) => break,
                        _ => return Err(format!("expected ',' or ')' in call to {}", name)),
                    }
                }
                Ok(ResourceExpr::Call(name, args))
            }
            Some(token) => Err(format!("unexpected token {:?}", token)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str, wildcards: &Wildcards, input_size: u64) -> Result<u64, String> {
        let spec = ResourceSpec::from_value(&ResourceValue::Expression(source.to_string()))?;
        spec.resolve(&EvalContext {
            wildcards,
            input_size,
            threads: 4,
        })
    }

    #[test]
    fn test_fixed_amount() {
        let spec = ResourceSpec::from_value(&ResourceValue::Amount(42)).unwrap();
        assert_eq!(spec, ResourceSpec::Fixed(42));
    }

    #[test]
    fn test_numeric_string_is_fixed() {
        let spec = ResourceSpec::from_value(&ResourceValue::Expression(" 100 ".into())).unwrap();
        assert_eq!(spec, ResourceSpec::Fixed(100));
    }

    #[test]
    fn test_precedence() {
        let w = Wildcards::new();
        assert_eq!(eval("2 + 3 * 4", &w, 0).unwrap(), 14);
        assert_eq!(eval("(2 + 3) * 4", &w, 0).unwrap(), 20);
        assert_eq!(eval("10 - -2", &w, 0).unwrap(), 12);
    }

    #[test]
    fn test_input_size_and_functions() {
        let w = Wildcards::new();
        let two_mb = 2 * 1024 * 1024;
        assert_eq!(eval("max(1000, input_size_mb * 3)", &w, two_mb).unwrap(), 1000);
        assert_eq!(eval("min(input_size_mb, 1)", &w, two_mb).unwrap(), 1);
        assert_eq!(eval("threads * 512", &w, 0).unwrap(), 2048);
    }

    #[test]
    fn test_rounds_up() {
        let w = Wildcards::new();
        assert_eq!(eval("7 / 2", &w, 0).unwrap(), 4);
    }

    #[test]
    fn test_numeric_wildcard() {
        let mut w = Wildcards::new();
        w.insert("chunks".into(), "8".into());
        assert_eq!(eval("chunks * 10", &w, 0).unwrap(), 80);
        assert_eq!(eval("wildcards.chunks + 1", &w, 0).unwrap(), 9);
    }

    #[test]
    fn test_errors() {
        let mut w = Wildcards::new();
        w.insert("sample".into(), "abc".into());
        assert!(eval("sample * 2", &w, 0).unwrap_err().contains("not numeric"));
        assert!(eval("unknown + 1", &w, 0).unwrap_err().contains("unknown identifier"));
        assert!(eval("1 / 0", &w, 0).unwrap_err().contains("division"));
        assert!(eval("0 - 5", &w, 0).unwrap_err().contains("negative"));
        assert!(ResourceExpr::parse("1 +").is_err());
        assert!(ResourceExpr::parse("max(1, 2").is_err());
        assert!(ResourceExpr::parse("3 $ 4").is_err());
    }

    #[test]
    fn test_variables() {
        let expr = ResourceExpr::parse("max(a, input_size_mb * b) + a").unwrap();
        assert_eq!(expr.variables(), vec!["a", "input_size_mb", "b"]);
    }
}
