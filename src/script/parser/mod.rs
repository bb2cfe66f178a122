// src/script/parser/mod.rs
//! Parser for the script language
//!
//! Converts source code into an Abstract Syntax Tree (AST)

pub mod ast;
pub mod lexer;
pub mod parser;

use super::ScriptError;
pub use ast::Program;

/// Parse source code into an AST
pub fn parse(source: &str) -> Result<Program, ScriptError> {
    let mut parser =
        parser::Parser::new(source).map_err(|e| ScriptError::Parse(e.to_string()))?;

    parser.parse().map_err(|e| ScriptError::Parse(e.to_string()))
}
