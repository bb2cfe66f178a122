// src/script/compiler/bytecode.rs
//! Bytecode instructions for the script VM

use serde::{Deserialize, Serialize};

/// Literal operand of a `Push`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Bytecode instructions executed by the VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    // Stack operations
    Push(Constant),
    Pop,

    // Variable access
    LoadLocal(String),
    StoreLocal(String),
    /// Function value by name
    LoadFunction(String),

    // Arithmetic operations
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,

    // Comparison operations
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,

    // Logical operations
    And,
    Or,
    Not,

    // Control flow
    Jump(usize),
    JumpIfFalse(usize),
    Return,
    Throw,
    /// Suspend the running async function until the value on top settles
    Await,

    // Calls
    CallGlobal(String, usize), // function name, arg count
    CallValue(usize),          // arg count, callee below the arguments
    MethodCall(String, usize), // method name, arg count

    // Array/Object operations
    MakeArray(usize),
    MakeObject(usize), // entry count, key/value pairs on the stack
    GetIndex,
    SetIndex,
    GetField(String),
    SetField(String),
}

impl Instruction {
    /// Returns true if this instruction is a jump
    pub fn is_jump(&self) -> bool {
        matches!(self, Instruction::Jump(_) | Instruction::JumpIfFalse(_))
    }
}
