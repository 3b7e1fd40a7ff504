//! Dependency expressions
//!
//! Trigger conditions are boolean formulas over dependency names:
//!
//! ```text
//! expr  := or
//! or    := and ( "||" and )*
//! and   := unary ( "&&" unary )*
//! unary := "!" unary | "(" or ")" | NAME
//! NAME  := [A-Za-z_][A-Za-z0-9_.\-]*     ("\-" is accepted for "-")
//! ```
//!
//! [`minifier`] reduces an expression to a canonical sum of products and
//! [`evaluator`] evaluates an expression against a dependency → bool map.

pub mod evaluator;
pub mod minifier;

pub use evaluator::DependencyExpression;
pub use minifier::{minify, BoolMinifier};

use std::fmt;
use thiserror::Error;

/// Errors raised while parsing or evaluating an expression
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpressionError {
    /// Blank expression where one is required
    #[error("dependency expression is empty")]
    Empty,

    /// Character sequence that is not part of the grammar
    #[error("unsupported symbol '{symbol}' at position {position}")]
    UnsupportedSymbol { symbol: String, position: usize },

    /// `(` without `)` or the other way round
    #[error("unbalanced parentheses")]
    UnbalancedParentheses,

    /// Token in a position the grammar does not allow
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    /// Expression ends where an operand is required
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    /// Variable missing from the parameter map
    #[error("no parameter '{0}' found")]
    UndefinedVariable(String),
}

/// Lexical token of a dependency expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Variable(String),
    And,
    Or,
    Not,
    LeftParen,
    RightParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Variable(name) => write!(f, "{}", name),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::LeftParen => write!(f, "("),
            Token::RightParen => write!(f, ")"),
        }
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Split an expression into tokens
///
/// # Errors
///
/// Returns `ExpressionError::UnsupportedSymbol` for anything outside the
/// grammar (single `&` or `|`, comparison operators, literals, ...).
pub fn tokenize(expression: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let unsupported = |start: usize, end: usize| ExpressionError::UnsupportedSymbol {
        symbol: chars[start..end.min(chars.len())].iter().collect(),
        position: start,
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LeftParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(unsupported(i, i + 2));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    return Err(unsupported(i, i + 2));
                }
                tokens.push(Token::Not);
                i += 1;
            }
            c if is_name_start(c) => {
                let mut name = String::new();
                while i < chars.len() {
                    let c = chars[i];
                    if is_name_char(c) {
                        name.push(c);
                        i += 1;
                    } else if c == '\\' && chars.get(i + 1) == Some(&'-') {
                        name.push('-');
                        i += 2;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Variable(name));
            }
            _ => return Err(unsupported(i, i + 1)),
        }
    }

    Ok(tokens)
}

/// Distinct variable names of a token stream, in order of first appearance
pub fn variables(tokens: &[Token]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for token in tokens {
        if let Token::Variable(name) = token {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
    }
    names
}
