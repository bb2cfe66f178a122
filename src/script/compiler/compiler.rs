// src/script/compiler/compiler.rs
//! Compiler that converts AST to bytecode

use super::bytecode::{Constant, Instruction};
use super::CompiledFunction;
use crate::script::parser::ast::*;
use crate::script::runtime::Builtin;
use crate::script::ScriptError;
use ahash::HashSet;

pub struct Compiler<'a> {
    instructions: Vec<Instruction>,
    label_counter: usize,
    labels: Vec<(usize, usize)>, // (label_id, instruction_index)
    function: &'a str,
    is_async: bool,
    locals: HashSet<String>,
    /// Every function defined by the program
    globals: &'a HashSet<String>,
}

impl<'a> Compiler<'a> {
    fn new(func: &'a FunctionNode, globals: &'a HashSet<String>) -> Self {
        Self {
            instructions: Vec::new(),
            label_counter: 0,
            labels: Vec::new(),
            function: &func.name,
            is_async: func.is_async,
            locals: func.params.iter().cloned().collect(),
            globals,
        }
    }

    pub fn compile_function(
        func: &FunctionNode,
        globals: &HashSet<String>,
    ) -> Result<CompiledFunction, ScriptError> {
        let mut compiler = Compiler::new(func, globals);

        for stmt in &func.body {
            compiler.compile_statement(stmt)?;
        }

        // Falling off the end returns null
        compiler.emit(Instruction::Push(Constant::Null));
        compiler.emit(Instruction::Return);

        let bytecode = compiler.resolve_labels();

        Ok(CompiledFunction {
            name: func.name.clone(),
            params: func.params.clone(),
            is_async: func.is_async,
            bytecode,
        })
    }

    fn compile_block(&mut self, block: &[Statement]) -> Result<(), ScriptError> {
        for stmt in block {
            self.compile_statement(stmt)?;
        }
        Ok(())
    }

    fn compile_statement(&mut self, stmt: &Statement) -> Result<(), ScriptError> {
        match stmt {
            Statement::Let { name, value } => {
                self.compile_expression(value)?;
                self.locals.insert(name.clone());
                self.emit(Instruction::StoreLocal(name.clone()));
            }

            Statement::Assign { target, value } => {
                if !self.locals.contains(target) {
                    return Err(self.error(format!("assignment to undeclared variable '{}'", target)));
                }
                self.compile_expression(value)?;
                self.emit(Instruction::StoreLocal(target.clone()));
            }

            Statement::SetField {
                object,
                field,
                value,
            } => {
                self.compile_expression(object)?;
                self.compile_expression(value)?;
                self.emit(Instruction::SetField(field.clone()));
            }

            Statement::SetIndex {
                object,
                index,
                value,
            } => {
                self.compile_expression(object)?;
                self.compile_expression(index)?;
                self.compile_expression(value)?;
                self.emit(Instruction::SetIndex);
            }

            Statement::If {
                condition,
                then_block,
                else_block,
            } => {
                self.compile_expression(condition)?;

                let else_label = self.new_label();
                let end_label = self.new_label();

                self.emit(Instruction::JumpIfFalse(else_label));
                self.compile_block(then_block)?;
                self.emit(Instruction::Jump(end_label));

                self.place_label(else_label);
                if let Some(else_stmts) = else_block {
                    self.compile_block(else_stmts)?;
                }

                self.place_label(end_label);
            }

            Statement::While { condition, body } => {
                let start_label = self.new_label();
                let end_label = self.new_label();

                self.place_label(start_label);
                self.compile_expression(condition)?;
                self.emit(Instruction::JumpIfFalse(end_label));
                self.compile_block(body)?;
                self.emit(Instruction::Jump(start_label));
                self.place_label(end_label);
            }

            Statement::Return(value) => {
                match value {
                    Some(expr) => self.compile_expression(expr)?,
                    None => self.emit(Instruction::Push(Constant::Null)),
                }
                self.emit(Instruction::Return);
            }

            Statement::Throw(value) => {
                self.compile_expression(value)?;
                self.emit(Instruction::Throw);
            }

            Statement::Expression(expr) => {
                self.compile_expression(expr)?;
                self.emit(Instruction::Pop); // Discard result
            }
        }

        Ok(())
    }

    fn compile_expression(&mut self, expr: &Expression) -> Result<(), ScriptError> {
        match expr {
            Expression::Binary { left, op, right } => {
                self.compile_expression(left)?;
                self.compile_expression(right)?;

                let instruction = match op {
                    BinaryOp::Add => Instruction::Add,
                    BinaryOp::Sub => Instruction::Sub,
                    BinaryOp::Mul => Instruction::Mul,
                    BinaryOp::Div => Instruction::Div,
                    BinaryOp::Mod => Instruction::Mod,
                    BinaryOp::Eq => Instruction::Eq,
                    BinaryOp::Ne => Instruction::Ne,
                    BinaryOp::Gt => Instruction::Gt,
                    BinaryOp::Gte => Instruction::Gte,
                    BinaryOp::Lt => Instruction::Lt,
                    BinaryOp::Lte => Instruction::Lte,
                    BinaryOp::And => Instruction::And,
                    BinaryOp::Or => Instruction::Or,
                };

                self.emit(instruction);
            }

            Expression::Unary { op, operand } => {
                self.compile_expression(operand)?;

                match op {
                    UnaryOp::Not => self.emit(Instruction::Not),
                    UnaryOp::Neg => self.emit(Instruction::Neg),
                }
            }

            Expression::Field { object, field } => {
                self.compile_expression(object)?;
                self.emit(Instruction::GetField(field.clone()));
            }

            Expression::Index { object, index } => {
                self.compile_expression(object)?;
                self.compile_expression(index)?;
                self.emit(Instruction::GetIndex);
            }

            Expression::FunctionCall { name, args } => {
                if self.locals.contains(name) {
                    self.emit(Instruction::LoadLocal(name.clone()));
                    self.compile_arguments(args)?;
                    self.emit(Instruction::CallValue(args.len()));
                } else {
                    self.compile_arguments(args)?;
                    self.emit(Instruction::CallGlobal(name.clone(), args.len()));
                }
            }

            Expression::Call { callee, args } => {
                self.compile_expression(callee)?;
                self.compile_arguments(args)?;
                self.emit(Instruction::CallValue(args.len()));
            }

            Expression::MethodCall {
                object,
                method,
                args,
            } => {
                self.compile_expression(object)?;
                self.compile_arguments(args)?;
                self.emit(Instruction::MethodCall(method.clone(), args.len()));
            }

            Expression::Array(items) => {
                self.compile_arguments(items)?;
                self.emit(Instruction::MakeArray(items.len()));
            }

            Expression::Object(entries) => {
                for (key, value) in entries {
                    let key = match key {
                        ObjectKey::String(s) => Constant::Str(s.clone()),
                        ObjectKey::Int(n) => Constant::Int(*n),
                    };
                    self.emit(Instruction::Push(key));
                    self.compile_expression(value)?;
                }
                self.emit(Instruction::MakeObject(entries.len()));
            }

            Expression::Await(operand) => {
                if !self.is_async {
                    return Err(self.error("'await' is only valid inside async functions".to_string()));
                }
                self.compile_expression(operand)?;
                self.emit(Instruction::Await);
            }

            Expression::Literal(lit) => {
                let constant = match lit {
                    Literal::Null => Constant::Null,
                    Literal::Bool(b) => Constant::Bool(*b),
                    Literal::Int(n) => Constant::Int(*n),
                    Literal::Float(f) => Constant::Float(*f),
                    Literal::String(s) => Constant::Str(s.clone()),
                };
                self.emit(Instruction::Push(constant));
            }

            Expression::Variable(name) => {
                if self.locals.contains(name) {
                    self.emit(Instruction::LoadLocal(name.clone()));
                } else if self.globals.contains(name) || Builtin::lookup(name).is_some() {
                    self.emit(Instruction::LoadFunction(name.clone()));
                } else {
                    return Err(self.error(format!("undefined variable '{}'", name)));
                }
            }
        }

        Ok(())
    }

    fn compile_arguments(&mut self, args: &[Expression]) -> Result<(), ScriptError> {
        for arg in args {
            self.compile_expression(arg)?;
        }
        Ok(())
    }

    fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    fn new_label(&mut self) -> usize {
        let label = self.label_counter;
        self.label_counter += 1;
        label
    }

    fn place_label(&mut self, label: usize) {
        let position = self.instructions.len();
        self.labels.push((label, position));
    }

    fn resolve_labels(mut self) -> Vec<Instruction> {
        // Replace label IDs with actual instruction indices
        for instruction in &mut self.instructions {
            match instruction {
                Instruction::Jump(label) | Instruction::JumpIfFalse(label) => {
                    if let Some((_, pos)) = self.labels.iter().find(|(l, _)| l == label) {
                        *label = *pos;
                    }
                }
                _ => {}
            }
        }

        self.instructions
    }

    fn error(&self, message: String) -> ScriptError {
        ScriptError::Compile(format!("in function '{}': {}", self.function, message))
    }
}
