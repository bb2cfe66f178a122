// src/script/parser/parser.rs
//! Parser that converts tokens into an Abstract Syntax Tree

use super::ast::*;
use super::lexer::{LexError, Lexer, Token};
use std::fmt;

#[derive(Debug)]
pub struct ParseError {
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        ParseError {
            message: err.to_string(),
        }
    }
}

pub struct Parser {
    lexer: Lexer,
    current_token: Token,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(input);
        let current_token = lexer.next_token()?;

        Ok(Self {
            lexer,
            current_token,
        })
    }

    pub fn parse(&mut self) -> Result<Program, ParseError> {
        let mut functions = Vec::new();

        while self.current_token != Token::Eof {
            match &self.current_token {
                Token::Function | Token::Async => {
                    functions.push(self.parse_function()?);
                }
                _ => {
                    return Err(self.error(format!(
                        "Expected 'function' or 'async function', got {}",
                        self.current_token
                    )));
                }
            }
        }

        Ok(Program { functions })
    }

    fn parse_function(&mut self) -> Result<FunctionNode, ParseError> {
        let is_async = if self.current_token == Token::Async {
            self.advance()?;
            true
        } else {
            false
        };

        self.expect(Token::Function)?;

        let name = self.expect_identifier()?;

        self.expect(Token::LeftParen)?;

        let mut params = Vec::new();
        if self.current_token != Token::RightParen {
            loop {
                params.push(self.expect_identifier()?);

                if self.current_token == Token::Comma {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }

        self.expect(Token::RightParen)?;

        let body = self.parse_braced_block()?;

        Ok(FunctionNode {
            name,
            params,
            is_async,
            body,
        })
    }

    fn parse_braced_block(&mut self) -> Result<Vec<Statement>, ParseError> {
        self.expect(Token::LeftBrace)?;

        let mut statements = Vec::new();
        while self.current_token != Token::RightBrace && self.current_token != Token::Eof {
            statements.push(self.parse_statement()?);
        }

        self.expect(Token::RightBrace)?;
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        let statement = match &self.current_token {
            Token::If => return self.parse_if_statement(),
            Token::While => {
                self.advance()?;
                self.expect(Token::LeftParen)?;
                let condition = self.parse_expression()?;
                self.expect(Token::RightParen)?;
                let body = self.parse_braced_block()?;
                return Ok(Statement::While { condition, body });
            }
            Token::Let => {
                self.advance()?;
                let name = self.expect_identifier()?;
                self.expect(Token::Assign)?;
                let value = self.parse_expression()?;
                Statement::Let { name, value }
            }
            Token::Return => {
                self.advance()?;
                if matches!(self.current_token, Token::Semicolon | Token::RightBrace) {
                    Statement::Return(None)
                } else {
                    Statement::Return(Some(self.parse_expression()?))
                }
            }
            Token::Throw => {
                self.advance()?;
                Statement::Throw(self.parse_expression()?)
            }
            _ => {
                let expr = self.parse_expression()?;

                if self.current_token == Token::Assign {
                    self.advance()?;
                    let value = self.parse_expression()?;

                    match expr {
                        Expression::Variable(target) => Statement::Assign { target, value },
                        Expression::Field { object, field } => Statement::SetField {
                            object: *object,
                            field,
                            value,
                        },
                        Expression::Index { object, index } => Statement::SetIndex {
                            object: *object,
                            index: *index,
                            value,
                        },
                        _ => return Err(self.error("Invalid assignment target".to_string())),
                    }
                } else {
                    Statement::Expression(expr)
                }
            }
        };

        if self.current_token == Token::Semicolon {
            self.advance()?;
        }

        Ok(statement)
    }

    fn parse_if_statement(&mut self) -> Result<Statement, ParseError> {
        self.expect(Token::If)?;
        self.expect(Token::LeftParen)?;

        let condition = self.parse_expression()?;

        self.expect(Token::RightParen)?;

        let then_block = self.parse_braced_block()?;

        let else_block = if self.current_token == Token::Else {
            self.advance()?;

            if self.current_token == Token::If {
                Some(vec![self.parse_if_statement()?])
            } else {
                Some(self.parse_braced_block()?)
            }
        } else {
            None
        };

        Ok(Statement::If {
            condition,
            then_block,
            else_block,
        })
    }

    fn parse_expression(&mut self) -> Result<Expression, ParseError> {
        self.parse_logical_or()
    }

    fn parse_logical_or(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_logical_and()?;

        while self.current_token == Token::OrOr {
            self.advance()?;
            let right = self.parse_logical_and()?;
            left = Expression::Binary {
                left: Box::new(left),
                op: BinaryOp::Or,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_logical_and(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_equality()?;

        while self.current_token == Token::AndAnd {
            self.advance()?;
            let right = self.parse_equality()?;
            left = Expression::Binary {
                left: Box::new(left),
                op: BinaryOp::And,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_comparison()?;

        loop {
            let op = match self.current_token {
                Token::EqEq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::Ne,
                _ => break,
            };

            self.advance()?;
            let right = self.parse_comparison()?;

            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_addition()?;

        loop {
            let op = match self.current_token {
                Token::Gt => BinaryOp::Gt,
                Token::Gte => BinaryOp::Gte,
                Token::Lt => BinaryOp::Lt,
                Token::Lte => BinaryOp::Lte,
                _ => break,
            };

            self.advance()?;
            let right = self.parse_addition()?;

            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_addition(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_multiplication()?;

        loop {
            let op = match self.current_token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };

            self.advance()?;
            let right = self.parse_multiplication()?;

            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_multiplication(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.current_token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };

            self.advance()?;
            let right = self.parse_unary()?;

            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ParseError> {
        match self.current_token {
            Token::Not => {
                self.advance()?;
                let operand = self.parse_unary()?;
                Ok(Expression::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                })
            }
            Token::Minus => {
                self.advance()?;
                let operand = self.parse_unary()?;
                Ok(Expression::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                })
            }
            Token::Await => {
                self.advance()?;
                let operand = self.parse_unary()?;
                Ok(Expression::Await(Box::new(operand)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.current_token {
                Token::Dot => {
                    self.advance()?;
                    let field = self.expect_identifier()?;

                    if self.current_token == Token::LeftParen {
                        self.advance()?;
                        let args = self.parse_argument_list()?;
                        self.expect(Token::RightParen)?;

                        expr = Expression::MethodCall {
                            object: Box::new(expr),
                            method: field,
                            args,
                        };
                    } else {
                        expr = Expression::Field {
                            object: Box::new(expr),
                            field,
                        };
                    }
                }
                Token::LeftBracket => {
                    self.advance()?;
                    let index = self.parse_expression()?;
                    self.expect(Token::RightBracket)?;

                    expr = Expression::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Token::LeftParen => {
                    self.advance()?;
                    let args = self.parse_argument_list()?;
                    self.expect(Token::RightParen)?;

                    expr = Expression::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expression, ParseError> {
        match &self.current_token {
            Token::True => {
                self.advance()?;
                Ok(Expression::Literal(Literal::Bool(true)))
            }
            Token::False => {
                self.advance()?;
                Ok(Expression::Literal(Literal::Bool(false)))
            }
            Token::Null => {
                self.advance()?;
                Ok(Expression::Literal(Literal::Null))
            }
            Token::Integer(n) => {
                let val = *n;
                self.advance()?;
                Ok(Expression::Literal(Literal::Int(val)))
            }
            Token::Number(n) => {
                let val = *n;
                self.advance()?;
                Ok(Expression::Literal(Literal::Float(val)))
            }
            Token::String(s) => {
                let val = s.clone();
                self.advance()?;
                Ok(Expression::Literal(Literal::String(val)))
            }
            Token::Identifier(name) => {
                let name = name.clone();
                self.advance()?;

                if self.current_token == Token::LeftParen {
                    self.advance()?;
                    let args = self.parse_argument_list()?;
                    self.expect(Token::RightParen)?;

                    Ok(Expression::FunctionCall { name, args })
                } else {
                    Ok(Expression::Variable(name))
                }
            }
            Token::LeftParen => {
                self.advance()?;
                let expr = self.parse_expression()?;
                self.expect(Token::RightParen)?;
                Ok(expr)
            }
            Token::LeftBracket => {
                self.advance()?;
                let mut items = Vec::new();
                while self.current_token != Token::RightBracket {
                    items.push(self.parse_expression()?);
                    if self.current_token == Token::Comma {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
                self.expect(Token::RightBracket)?;
                Ok(Expression::Array(items))
            }
            Token::LeftBrace => self.parse_object_literal(),
            _ => Err(self.error(format!(
                "Unexpected token in expression: {}",
                self.current_token
            ))),
        }
    }

    fn parse_object_literal(&mut self) -> Result<Expression, ParseError> {
        self.expect(Token::LeftBrace)?;

        let mut entries = Vec::new();
        while self.current_token != Token::RightBrace {
            let key = match &self.current_token {
                Token::Identifier(name) => ObjectKey::String(name.clone()),
                Token::String(s) => ObjectKey::String(s.clone()),
                Token::Integer(n) => ObjectKey::Int(*n),
                other => {
                    return Err(self.error(format!("Invalid object key: {}", other)));
                }
            };
            self.advance()?;
            self.expect(Token::Colon)?;
            entries.push((key, self.parse_expression()?));

            if self.current_token == Token::Comma {
                self.advance()?;
            } else {
                break;
            }
        }

        self.expect(Token::RightBrace)?;
        Ok(Expression::Object(entries))
    }

    fn parse_argument_list(&mut self) -> Result<Vec<Expression>, ParseError> {
        let mut args = Vec::new();

        if self.current_token != Token::RightParen {
            loop {
                args.push(self.parse_expression()?);

                if self.current_token == Token::Comma {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }

        Ok(args)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        if std::mem::discriminant(&self.current_token) == std::mem::discriminant(&expected) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.error(format!(
                "Expected {:?}, got {}",
                expected, self.current_token
            )))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        match &self.current_token {
            Token::Identifier(name) => {
                let result = name.clone();
                self.advance()?;
                Ok(result)
            }
            _ => Err(self.error(format!(
                "Expected identifier, got {}",
                self.current_token
            ))),
        }
    }

    fn advance(&mut self) -> Result<(), ParseError> {
        self.current_token = self.lexer.next_token()?;
        Ok(())
    }

    fn error(&self, message: String) -> ParseError {
        let (line, column) = self.lexer.location();
        ParseError {
            message: format!("{}:{}: {}", line, column, message),
        }
    }
}
