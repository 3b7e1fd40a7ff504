//! Dependency expression evaluator
//!
//! Parsed once per trigger from the trigger's (unminified) condition and
//! evaluated on every correlation step against the current dependency map.

use super::{tokenize, ExpressionError, Token};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Var(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

/// A parsed dependency expression
#[derive(Debug, Clone)]
pub struct DependencyExpression {
    source: String,
    root: Node,
    variables: Vec<String>,
    has_and: bool,
}

impl DependencyExpression {
    /// Parse an expression
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError::Empty` for a blank expression and a parse
    /// error for anything outside the grammar.
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(expression)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }

        let mut parser = Parser { tokens: &tokens, pos: 0 };
        let root = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(match token {
                Token::RightParen => ExpressionError::UnbalancedParentheses,
                other => ExpressionError::UnexpectedToken(other.to_string()),
            });
        }

        Ok(Self {
            source: expression.to_string(),
            root,
            variables: super::variables(&tokens),
            has_and: tokens.contains(&Token::And),
        })
    }

    /// The expression as written
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Distinct dependency names, in order of first appearance
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// True when any single dependency satisfies the expression on its own,
    /// i.e. the expression has no `&&`
    ///
    /// Such triggers fire on every event and keep no pending state.
    pub fn one_and_done(&self) -> bool {
        !self.has_and
    }

    /// Evaluate against a dependency → satisfied map
    ///
    /// Every variable is looked up, so a missing name is reported even when
    /// the result would not depend on it.
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError::UndefinedVariable` for a name missing from
    /// `parameters`.
    pub fn evaluate(&self, parameters: &HashMap<String, bool>) -> Result<bool, ExpressionError> {
        eval(&self.root, parameters)
    }
}

fn eval(node: &Node, parameters: &HashMap<String, bool>) -> Result<bool, ExpressionError> {
    match node {
        Node::Var(name) => parameters
            .get(name)
            .copied()
            .ok_or_else(|| ExpressionError::UndefinedVariable(name.clone())),
        Node::Not(inner) => Ok(!eval(inner, parameters)?),
        Node::And(left, right) => {
            let left = eval(left, parameters)?;
            let right = eval(right, parameters)?;
            Ok(left && right)
        }
        Node::Or(left, right) => {
            let left = eval(left, parameters)?;
            let right = eval(right, parameters)?;
            Ok(left || right)
        }
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, ExpressionError> {
        match self.next() {
            Some(Token::Not) => Ok(Node::Not(Box::new(self.parse_unary()?))),
            Some(Token::LeftParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RightParen) => Ok(inner),
                    _ => Err(ExpressionError::UnbalancedParentheses),
                }
            }
            Some(Token::Variable(name)) => Ok(Node::Var(name.clone())),
            Some(other) => Err(ExpressionError::UnexpectedToken(other.to_string())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, bool)]) -> HashMap<String, bool> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_evaluate_and() {
        let expr = DependencyExpression::parse("a && b").unwrap();
        assert!(!expr.evaluate(&params(&[("a", true), ("b", false)])).unwrap());
        assert!(expr.evaluate(&params(&[("a", true), ("b", true)])).unwrap());
        assert!(!expr.one_and_done());
    }

    #[test]
    fn test_evaluate_precedence() {
        // && binds tighter than ||
        let expr = DependencyExpression::parse("a || b && c").unwrap();
        assert!(expr
            .evaluate(&params(&[("a", true), ("b", false), ("c", false)]))
            .unwrap());
        assert!(!expr
            .evaluate(&params(&[("a", false), ("b", true), ("c", false)]))
            .unwrap());
    }

    #[test]
    fn test_evaluate_not() {
        let expr = DependencyExpression::parse("a && !(b || c)").unwrap();
        assert!(expr
            .evaluate(&params(&[("a", true), ("b", false), ("c", false)]))
            .unwrap());
        assert!(!expr
            .evaluate(&params(&[("a", true), ("b", false), ("c", true)]))
            .unwrap());
    }

    #[test]
    fn test_undefined_variable() {
        let expr = DependencyExpression::parse("a || b").unwrap();
        assert_eq!(
            expr.evaluate(&params(&[("a", true)])).unwrap_err(),
            ExpressionError::UndefinedVariable("b".to_string())
        );
    }

    #[test]
    fn test_one_and_done() {
        assert!(DependencyExpression::parse("a || b").unwrap().one_and_done());
        assert!(DependencyExpression::parse("a").unwrap().one_and_done());
        assert!(!DependencyExpression::parse("(a || b) && c")
            .unwrap()
            .one_and_done());
    }

    #[test]
    fn test_variables_and_source() {
        let expr = DependencyExpression::parse("dep-b && (dep-a || dep-b)").unwrap();
        assert_eq!(expr.variables(), ["dep-b", "dep-a"]);
        assert_eq!(expr.source(), "dep-b && (dep-a || dep-b)");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            DependencyExpression::parse("").unwrap_err(),
            ExpressionError::Empty
        );
        assert_eq!(
            DependencyExpression::parse("(a && b").unwrap_err(),
            ExpressionError::UnbalancedParentheses
        );
        assert_eq!(
            DependencyExpression::parse("a && b)").unwrap_err(),
            ExpressionError::UnbalancedParentheses
        );
        assert_eq!(
            DependencyExpression::parse("a ||").unwrap_err(),
            ExpressionError::UnexpectedEnd
        );
        assert!(DependencyExpression::parse("a b").is_err());
    }
}
