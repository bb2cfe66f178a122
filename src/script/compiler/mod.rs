// src/script/compiler/mod.rs
//! Compiler that converts AST to bytecode

pub mod bytecode;
pub mod compiler;

use super::parser::Program;
use super::ScriptError;
use ahash::HashSet;
use bytecode::Instruction;
use serde::{Deserialize, Serialize};

/// A compiled function ready for execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub name: String,
    pub params: Vec<String>,
    pub is_async: bool,
    pub bytecode: Vec<Instruction>,
}

/// Compile a parsed program into bytecode, keeping declaration order
pub fn compile(program: Program) -> Result<Vec<CompiledFunction>, ScriptError> {
    let mut globals = HashSet::default();
    for func in &program.functions {
        if !globals.insert(func.name.clone()) {
            return Err(ScriptError::Compile(format!(
                "function '{}' is defined more than once",
                func.name
            )));
        }
    }

    program
        .functions
        .iter()
        .map(|func| compiler::Compiler::compile_function(func, &globals))
        .collect()
}
