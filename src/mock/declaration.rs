// src/mock/declaration.rs
//! Parser for mock declarations
//!
//! ```text
//! # comment
//! three_str(a, b, c) = "Hello World"
//! echo(x) = $0
//! slow(x) ~ 50 = {"done": true}
//! broken() ! "it broke"
//! ```

use super::value::MockValue;
use super::MockError;
use ahash::HashSet;
use std::time::Duration;

/// Result expression of a declaration
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(MockValue),
    /// The argument at this position
    Arg(usize),
}

impl Expr {
    pub fn evaluate(&self, args: &[MockValue]) -> MockValue {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Arg(index) => args.get(*index).cloned().unwrap_or(MockValue::Undefined),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Return(Expr),
    Throw(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub params: Vec<String>,
    /// Settle through the event loop after this long
    pub delay: Option<Duration>,
    pub outcome: Outcome,
}

pub fn parse_declarations(source: &str) -> Result<Vec<Declaration>, MockError> {
    let mut declarations = Vec::new();
    let mut names = HashSet::default();

    for (index, raw) in source.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let number = index + 1;
        let declaration = parse_line(line).map_err(|message| MockError::Declaration {
            line: number,
            message,
        })?;

        if !names.insert(declaration.name.clone()) {
            return Err(MockError::Declaration {
                line: number,
                message: format!("'{}' is declared more than once", declaration.name),
            });
        }
        declarations.push(declaration);
    }

    Ok(declarations)
}

fn parse_line(line: &str) -> Result<Declaration, String> {
    let open = line.find('(').ok_or("expected '(' after the function name")?;
    let name = line[..open].trim();
    if !is_identifier(name) {
        return Err(format!("invalid function name '{}'", name));
    }

    let close = line[open..]
        .find(')')
        .map(|i| open + i)
        .ok_or("expected ')' after the parameters")?;

    let params: Vec<String> = line[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();
    if let Some(bad) = params.iter().find(|p| !is_identifier(p)) {
        return Err(format!("invalid parameter name '{}'", bad));
    }

    let mut rest = line[close + 1..].trim_start();

    let mut delay = None;
    if let Some(after) = rest.strip_prefix('~') {
        let after = after.trim_start();
        let end = after
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after.len());
        let millis: u64 = after[..end]
            .parse()
            .map_err(|_| "expected a delay in milliseconds after '~'".to_string())?;
        delay = Some(Duration::from_millis(millis));
        rest = after[end..].trim_start();
    }

    let (throws, expr) = if let Some(expr) = rest.strip_prefix('=') {
        (false, expr)
    } else if let Some(expr) = rest.strip_prefix('!') {
        (true, expr)
    } else {
        return Err("expected '=' or '!' before the result".to_string());
    };

    let expr = parse_expr(expr.trim(), params.len())?;
    let outcome = if throws {
        Outcome::Throw(expr)
    } else {
        Outcome::Return(expr)
    };

    Ok(Declaration {
        name: name.to_string(),
        params,
        delay,
        outcome,
    })
}

fn parse_expr(text: &str, arity: usize) -> Result<Expr, String> {
    if let Some(index) = text.strip_prefix('$') {
        let index: usize = index
            .parse()
            .map_err(|_| format!("invalid argument reference '{}'", text))?;
        if index >= arity {
            return Err(format!(
                "argument reference '{}' is out of range for {} parameters",
                text, arity
            ));
        }
        return Ok(Expr::Arg(index));
    }

    let json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("invalid result literal: {}", e))?;
    Ok(Expr::Literal(MockValue::from_json(&json)))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}
