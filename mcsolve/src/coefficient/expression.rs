//! A small compiler for time coefficients written as strings, such as
//! `"A * exp(-t / tau) * sin(w * t)"`.
//!
//! Named arguments are substituted when the expression is compiled and
//! constant sub-expressions are folded, so evaluation only walks the parts
//! of the tree that depend on `t`.

use std::{collections::HashMap, f64::consts::PI};

use num_complex::Complex;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unexpected character '{character}' at position {position}")]
    UnexpectedCharacter { position: usize, character: char },

    #[error("Invalid number '{text}' at position {position}")]
    InvalidNumber { position: usize, text: String },

    #[error("Expected {expected} at position {position}, found {found}")]
    UnexpectedToken {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Function '{function}' takes {expected} argument(s), got {actual}")]
    WrongArity {
        function: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Complex<f64>),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Comma,
    LeftParen,
    RightParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {n}"),
            Token::Identifier(name) => format!("identifier '{name}'"),
            Token::Plus => "'+'".to_owned(),
            Token::Minus => "'-'".to_owned(),
            Token::Star => "'*'".to_owned(),
            Token::Slash => "'/'".to_owned(),
            Token::Caret => "'^'".to_owned(),
            Token::Comma => "','".to_owned(),
            Token::LeftParen => "'('".to_owned(),
            Token::RightParen => "')'".to_owned(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars = source.char_indices().collect::<Vec<_>>();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (position, c) = chars[i];
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                // Exponent, only if followed by a digit (optionally signed)
                if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && matches!(chars[j].1, '+' | '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].1.is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].1.is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text = chars[start..i].iter().map(|(_, c)| c).collect::<String>();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::InvalidNumber { position, text })?;
                // Python style imaginary literal, ie 2.5j
                if i < chars.len() && matches!(chars[i].1, 'j' | 'J') {
                    i += 1;
                    tokens.push((position, Token::Number(Complex { re: 0f64, im: value })));
                } else {
                    tokens.push((position, Token::Number(Complex { re: value, im: 0f64 })));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let name = chars[start..i].iter().map(|(_, c)| c).collect::<String>();
                tokens.push((position, Token::Identifier(name)));
            }
            '*' if i + 1 < chars.len() && chars[i + 1].1 == '*' => {
                i += 2;
                tokens.push((position, Token::Caret));
            }
            _ => {
                let token = match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '^' => Token::Caret,
                    ',' => Token::Comma,
                    '(' => Token::LeftParen,
                    ')' => Token::RightParen,
                    character => {
                        return Err(ExpressionError::UnexpectedCharacter {
                            position,
                            character,
                        })
                    }
                };
                i += 1;
                tokens.push((position, token));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Log10,
    Sqrt,
    Abs,
    Conj,
    Real,
    Imag,
    Arg,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" | "arcsin" => Function::Asin,
            "acos" | "arccos" => Function::Acos,
            "atan" | "arctan" => Function::Atan,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "exp" => Function::Exp,
            "log" | "ln" => Function::Log,
            "log10" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "conj" => Function::Conj,
            "real" => Function::Real,
            "imag" => Function::Imag,
            "arg" | "angle" => Function::Arg,
            _ => return None,
        })
    }

    fn apply(self, z: Complex<f64>) -> Complex<f64> {
        match self {
            Function::Sin => z.sin(),
            Function::Cos => z.cos(),
            Function::Tan => z.tan(),
            Function::Asin => z.asin(),
            Function::Acos => z.acos(),
            Function::Atan => z.atan(),
            Function::Sinh => z.sinh(),
            Function::Cosh => z.cosh(),
            Function::Tanh => z.tanh(),
            Function::Exp => z.exp(),
            Function::Log => z.ln(),
            Function::Log10 => z.ln() / std::f64::consts::LN_10,
            Function::Sqrt => z.sqrt(),
            Function::Abs => Complex {
                re: z.norm(),
                im: 0f64,
            },
            Function::Conj => z.conj(),
            Function::Real => Complex { re: z.re, im: 0f64 },
            Function::Imag => Complex { re: z.im, im: 0f64 },
            Function::Arg => Complex {
                re: z.arg(),
                im: 0f64,
            },
        }
    }
}

fn power(base: Complex<f64>, exponent: Complex<f64>) -> Complex<f64> {
    if exponent.im != 0f64 {
        return base.powc(exponent);
    }
    #[allow(clippy::cast_possible_truncation)]
    if exponent.re.fract() == 0f64 && exponent.re.abs() < f64::from(i32::MAX) {
        return base.powi(exponent.re as i32);
    }
    base.powf(exponent.re)
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
enum Node {
    Constant(Complex<f64>),
    Time,
    Negate(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(Function, Box<Node>),
}

impl Node {
    fn binary(op: BinaryOp, lhs: Node, rhs: Node) -> Node {
        if let (Node::Constant(a), Node::Constant(b)) = (&lhs, &rhs) {
            return Node::Constant(Self::apply_binary(op, *a, *b));
        }
        Node::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    fn negate(inner: Node) -> Node {
        match inner {
            Node::Constant(a) => Node::Constant(-a),
            inner => Node::Negate(Box::new(inner)),
        }
    }

    fn call(function: Function, argument: Node) -> Node {
        match argument {
            Node::Constant(a) => Node::Constant(function.apply(a)),
            argument => Node::Call(function, Box::new(argument)),
        }
    }

    #[inline]
    fn apply_binary(op: BinaryOp, a: Complex<f64>, b: Complex<f64>) -> Complex<f64> {
        match op {
            BinaryOp::Add => a + b,
            BinaryOp::Subtract => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => a / b,
            BinaryOp::Power => power(a, b),
        }
    }

    fn evaluate(&self, t: f64) -> Complex<f64> {
        match self {
            Node::Constant(a) => *a,
            Node::Time => Complex { re: t, im: 0f64 },
            Node::Negate(inner) => -inner.evaluate(t),
            Node::Binary(op, lhs, rhs) => Self::apply_binary(*op, lhs.evaluate(t), rhs.evaluate(t)),
            Node::Call(function, argument) => function.apply(argument.evaluate(t)),
        }
    }
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    position: usize,
    args: &'a HashMap<String, Complex<f64>>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, t)| t)
    }

    fn next(&mut self) -> Result<(usize, Token), ExpressionError> {
        let token = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or(ExpressionError::UnexpectedEnd)?;
        self.position += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExpressionError> {
        let (position, token) = self.next()?;
        if &token == expected {
            return Ok(());
        }
        Err(ExpressionError::UnexpectedToken {
            position,
            expected: expected.describe(),
            found: token.describe(),
        })
    }

    /// expression := term (('+' | '-') term)*
    fn parse_expression(&mut self) -> Result<Node, ExpressionError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Subtract,
                _ => return Ok(lhs),
            };
            self.position += 1;
            let rhs = self.parse_term()?;
            lhs = Node::binary(op, lhs, rhs);
        }
    }

    /// term := unary (('*' | '/') unary)*
    fn parse_term(&mut self) -> Result<Node, ExpressionError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Multiply,
                Some(Token::Slash) => BinaryOp::Divide,
                _ => return Ok(lhs),
            };
            self.position += 1;
            let rhs = self.parse_unary()?;
            lhs = Node::binary(op, lhs, rhs);
        }
    }

    /// unary := ('-' | '+') unary | power
    fn parse_unary(&mut self) -> Result<Node, ExpressionError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.position += 1;
                Ok(Node::negate(self.parse_unary()?))
            }
            Some(Token::Plus) => {
                self.position += 1;
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    /// power := atom ('^' unary)?, right associative so that 2^-t and a^b^c behave
    fn parse_power(&mut self) -> Result<Node, ExpressionError> {
        let base = self.parse_atom()?;
        if let Some(Token::Caret) = self.peek() {
            self.position += 1;
            let exponent = self.parse_unary()?;
            return Ok(Node::binary(BinaryOp::Power, base, exponent));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Node, ExpressionError> {
        let (position, token) = self.next()?;
        match token {
            Token::Number(value) => Ok(Node::Constant(value)),
            Token::LeftParen => {
                let inner = self.parse_expression()?;
                self.expect(&Token::RightParen)?;
                Ok(inner)
            }
            Token::Identifier(name) => {
                if let Some(Token::LeftParen) = self.peek() {
                    self.position += 1;
                    return self.parse_call(name);
                }
                self.resolve_identifier(name)
            }
            token => Err(ExpressionError::UnexpectedToken {
                position,
                expected: "a value".to_owned(),
                found: token.describe(),
            }),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Node, ExpressionError> {
        let mut arguments = Vec::new();
        if let Some(Token::RightParen) = self.peek() {
            self.position += 1;
        } else {
            loop {
                arguments.push(self.parse_expression()?);
                let (position, token) = self.next()?;
                match token {
                    Token::Comma => {}
                    Token::RightParen => break,
                    token => {
                        return Err(ExpressionError::UnexpectedToken {
                            position,
                            expected: "',' or ')'".to_owned(),
                            found: token.describe(),
                        })
                    }
                }
            }
        }

        if name == "pow" {
            if arguments.len() != 2 {
                return Err(ExpressionError::WrongArity {
                    function: name,
                    expected: 2,
                    actual: arguments.len(),
                });
            }
            let exponent = arguments.pop().ok_or(ExpressionError::UnexpectedEnd)?;
            let base = arguments.pop().ok_or(ExpressionError::UnexpectedEnd)?;
            return Ok(Node::binary(BinaryOp::Power, base, exponent));
        }

        let function = Function::from_name(&name).ok_or(ExpressionError::UnknownFunction(name.clone()))?;
        if arguments.len() != 1 {
            return Err(ExpressionError::WrongArity {
                function: name,
                expected: 1,
                actual: arguments.len(),
            });
        }
        let argument = arguments.pop().ok_or(ExpressionError::UnexpectedEnd)?;
        Ok(Node::call(function, argument))
    }

    fn resolve_identifier(&self, name: String) -> Result<Node, ExpressionError> {
        if name == "t" {
            return Ok(Node::Time);
        }
        if let Some(value) = self.args.get(&name) {
            return Ok(Node::Constant(*value));
        }
        match name.as_str() {
            "pi" => Ok(Node::Constant(Complex { re: PI, im: 0f64 })),
            "e" => Ok(Node::Constant(Complex {
                re: std::f64::consts::E,
                im: 0f64,
            })),
            _ => Err(ExpressionError::UnknownIdentifier(name)),
        }
    }
}

/// A time coefficient compiled from a string, with its arguments bound.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CompiledExpression {
    source: String,
    root: Node,
}

impl CompiledExpression {
    /// Compile `source`, substituting every named argument in `args`.
    ///
    /// The time variable is `t`. `pi` and `e` are available unless shadowed by an argument.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression cannot be parsed, or refers to
    /// an unknown identifier or function.
    pub fn compile(
        source: &str,
        args: &HashMap<String, Complex<f64>>,
    ) -> Result<Self, ExpressionError> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            position: 0,
            args,
        };
        let root = parser.parse_expression()?;
        if let Some((position, token)) = parser.tokens.get(parser.position) {
            return Err(ExpressionError::UnexpectedToken {
                position: *position,
                expected: "end of expression".to_owned(),
                found: token.describe(),
            });
        }
        Ok(Self {
            source: source.to_owned(),
            root,
        })
    }

    #[inline]
    #[must_use]
    pub fn evaluate(&self, t: f64) -> Complex<f64> {
        self.root.evaluate(t)
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True if the expression does not depend on `t`.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        matches!(self.root, Node::Constant(_))
    }
}
