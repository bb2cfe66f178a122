// src/script/parser/lexer.rs
//! Lexical analyzer (tokenizer) for the script language

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Function,
    Async,
    Await,
    Let,
    If,
    Else,
    While,
    Return,
    Throw,
    True,
    False,
    Null,

    // Identifiers and literals
    Identifier(String),
    Number(f64),
    Integer(i64),
    String(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    EqEq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,

    AndAnd,
    OrOr,
    Not,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,

    Comma,
    Semicolon,
    Colon,
    Dot,
    Assign,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Identifier(s) => write!(f, "identifier '{}'", s),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Integer(n) => write!(f, "integer {}", n),
            Token::String(s) => write!(f, "string \"{}\"", s),
            Token::Eof => write!(f, "end of input"),
            _ => write!(f, "{:?}", self),
        }
    }
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    line: usize,
    column: usize,
}

#[derive(Debug)]
pub struct LexError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for LexError {}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
            line: 1,
            column: 1,
        }
    }

    /// Current (line, column), used to position parse errors
    pub fn location(&self) -> (usize, usize) {
        (self.line, self.column)
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace_and_comments();

        if self.is_at_end() {
            return Ok(Token::Eof);
        }

        let ch = self.current_char();

        let single = match ch {
            '(' => Some(Token::LeftParen),
            ')' => Some(Token::RightParen),
            '{' => Some(Token::LeftBrace),
            '}' => Some(Token::RightBrace),
            '[' => Some(Token::LeftBracket),
            ']' => Some(Token::RightBracket),
            ',' => Some(Token::Comma),
            ';' => Some(Token::Semicolon),
            ':' => Some(Token::Colon),
            '.' => Some(Token::Dot),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(token);
        }

        match ch {
            '=' => return Ok(self.one_or_two('=', Token::EqEq, Token::Assign)),
            '!' => return Ok(self.one_or_two('=', Token::NotEq, Token::Not)),
            '>' => return Ok(self.one_or_two('=', Token::Gte, Token::Gt)),
            '<' => return Ok(self.one_or_two('=', Token::Lte, Token::Lt)),
            '&' => {
                self.advance();
                if !self.is_at_end() && self.current_char() == '&' {
                    self.advance();
                    return Ok(Token::AndAnd);
                }
                return Err(self.error("Expected '&&'"));
            }
            '|' => {
                self.advance();
                if !self.is_at_end() && self.current_char() == '|' {
                    self.advance();
                    return Ok(Token::OrOr);
                }
                return Err(self.error("Expected '||'"));
            }
            '"' | '\'' => return self.read_string(ch),
            _ => {}
        }

        if ch.is_ascii_digit() {
            return self.read_number();
        }

        if ch.is_ascii_alphabetic() || ch == '_' || ch == '$' {
            return Ok(self.read_identifier());
        }

        Err(self.error(&format!("Unexpected character: '{}'", ch)))
    }

    /// Consume `ch` and, if `next` follows, that too
    fn one_or_two(&mut self, next: char, double: Token, single: Token) -> Token {
        self.advance();
        if !self.is_at_end() && self.current_char() == next {
            self.advance();
            double
        } else {
            single
        }
    }

    fn read_identifier(&mut self) -> Token {
        let start = self.position;

        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_alphanumeric() || ch == '_' || ch == '$' {
                self.advance();
            } else {
                break;
            }
        }

        let identifier: String = self.input[start..self.position].iter().collect();

        match identifier.as_str() {
            "function" => Token::Function,
            "async" => Token::Async,
            "await" => Token::Await,
            "let" | "const" | "var" => Token::Let,
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "return" => Token::Return,
            "throw" => Token::Throw,
            "true" => Token::True,
            "false" => Token::False,
            "null" | "undefined" => Token::Null,
            _ => Token::Identifier(identifier),
        }
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        let mut has_dot = false;

        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_ascii_digit() {
                self.advance();
            } else if ch == '.'
                && !has_dot
                && self.peek().map_or(false, |next| next.is_ascii_digit())
            {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }

        let num_str: String = self.input[start..self.position].iter().collect();

        if has_dot {
            let num = num_str
                .parse::<f64>()
                .map_err(|_| self.error(&format!("Invalid float: {}", num_str)))?;
            Ok(Token::Number(num))
        } else {
            let num = num_str
                .parse::<i64>()
                .map_err(|_| self.error(&format!("Invalid integer: {}", num_str)))?;
            Ok(Token::Integer(num))
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        self.advance(); // opening quote

        let mut result = String::new();

        while !self.is_at_end() && self.current_char() != quote {
            let ch = self.current_char();

            if ch == '\\' {
                self.advance();
                if self.is_at_end() {
                    return Err(self.error("Unterminated string"));
                }

                let escaped = match self.current_char() {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    c => c,
                };

                result.push(escaped);
                self.advance();
            } else {
                result.push(ch);
                self.advance();
            }
        }

        if self.is_at_end() {
            return Err(self.error("Unterminated string"));
        }

        self.advance(); // closing quote

        Ok(Token::String(result))
    }

    fn skip_whitespace_and_comments(&mut self) {
        while !self.is_at_end() {
            let ch = self.current_char();

            if ch.is_whitespace() {
                self.advance();
            } else if ch == '/' && self.peek() == Some('/') {
                while !self.is_at_end() && self.current_char() != '\n' {
                    self.advance();
                }
            } else if ch == '/' && self.peek() == Some('*') {
                self.advance();
                self.advance();

                while !self.is_at_end() {
                    if self.current_char() == '*' && self.peek() == Some('/') {
                        self.advance();
                        self.advance();
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn current_char(&self) -> char {
        self.input[self.position]
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position + 1).copied()
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            if self.current_char() == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
            self.position += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }

    fn error(&self, message: &str) -> LexError {
        LexError {
            message: message.to_string(),
            line: self.line,
            column: self.column,
        }
    }
}
