// src/script/parser/ast.rs
//! Abstract Syntax Tree definitions for the script language

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub functions: Vec<FunctionNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionNode {
    pub name: String,
    pub params: Vec<String>,
    pub is_async: bool,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// let name = value;
    Let { name: String, value: Expression },

    /// name = value;
    Assign { target: String, value: Expression },

    /// object.field = value;
    SetField {
        object: Expression,
        field: String,
        value: Expression,
    },

    /// object[index] = value;
    SetIndex {
        object: Expression,
        index: Expression,
        value: Expression,
    },

    /// if (condition) { ... } else { ... }
    If {
        condition: Expression,
        then_block: Vec<Statement>,
        else_block: Option<Vec<Statement>>,
    },

    /// while (condition) { ... }
    While {
        condition: Expression,
        body: Vec<Statement>,
    },

    Return(Option<Expression>),

    Throw(Expression),

    Expression(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Binary {
        left: Box<Expression>,
        op: BinaryOp,
        right: Box<Expression>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },

    /// object.field
    Field {
        object: Box<Expression>,
        field: String,
    },

    /// object[index]
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },

    /// name(args), resolved against locals first, then functions
    FunctionCall { name: String, args: Vec<Expression> },

    /// callee(args) where the callee is any expression
    Call {
        callee: Box<Expression>,
        args: Vec<Expression>,
    },

    /// object.method(args)
    MethodCall {
        object: Box<Expression>,
        method: String,
        args: Vec<Expression>,
    },

    Array(Vec<Expression>),

    Object(Vec<(ObjectKey, Expression)>),

    Await(Box<Expression>),

    Literal(Literal),

    Variable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKey {
    String(String),
    Int(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    // Comparison
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,

    // Logical
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}
