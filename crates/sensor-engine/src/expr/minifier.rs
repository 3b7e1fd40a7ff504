//! Boolean expression minifier
//!
//! Reduces an AND/OR dependency expression to a sum of products using the
//! Quine–McCluskey combining step. The output only depends on the truth
//! table and the sorted variable set, so two equivalent expressions over the
//! same variables minify to the same string.
//!
//! ```text
//! "(a || b) && c"               -> "(b && c) || (a && c)"
//! "((a && b) || (c && d)) && c" -> "(c && d) || (a && b && c)"
//! ```

use super::{tokenize, ExpressionError, Token};

/// One implicant: `1`/`0` per variable, `-1` for "don't care"
type Term = Vec<i8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostfixItem {
    Var(usize),
    And,
    Or,
}

/// Parsed expression ready for minification
#[derive(Debug, Clone)]
pub struct BoolMinifier {
    variables: Vec<String>,
    postfix: Vec<PostfixItem>,
}

impl BoolMinifier {
    /// Parse an expression
    ///
    /// # Errors
    ///
    /// Returns an `ExpressionError` for symbols outside `&&`, `||`, `(`, `)`
    /// and names (NOT is rejected), for unbalanced parentheses and for
    /// operators missing an operand.
    pub fn new(expression: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(expression)?;

        let mut variables: Vec<String> = super::variables(&tokens);
        variables.sort();

        let postfix = to_postfix(&tokens, &variables)?;
        check_arity(&postfix)?;

        Ok(Self { variables, postfix })
    }

    /// Sorted distinct variable names
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Minimal sum-of-products form, or `""` when the expression has no
    /// variables or is never true
    pub fn minify(&self) -> String {
        let n = self.variables.len();
        if n == 0 {
            return String::new();
        }

        let mut minterms: Vec<Term> = (0..1u64 << n)
            .map(|row| row_term(row, n))
            .filter(|term| self.eval(term))
            .collect();
        if minterms.is_empty() {
            return String::new();
        }

        for _ in 0..n {
            if minterms.len() <= 1 {
                break;
            }
            let (next, combined_any) = combine_pass(&minterms);
            minterms = next;
            if !combined_any {
                break;
            }
        }

        self.render(&minterms)
    }

    fn eval(&self, term: &[i8]) -> bool {
        let mut stack: Vec<i64> = Vec::with_capacity(self.postfix.len());
        for item in &self.postfix {
            match *item {
                PostfixItem::Var(idx) => stack.push(i64::from(term[idx])),
                PostfixItem::And | PostfixItem::Or => {
                    // arity was verified in `new`
                    let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                        return false;
                    };
                    stack.push(if *item == PostfixItem::And {
                        a * b
                    } else {
                        a + b - a * b
                    });
                }
            }
        }
        stack.pop().is_some_and(|v| v > 0)
    }

    fn render(&self, terms: &[Term]) -> String {
        let groups: Vec<String> = terms
            .iter()
            .filter_map(|term| {
                let names: Vec<&str> = term
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| **v != -1)
                    .map(|(i, _)| self.variables[i].as_str())
                    .collect();
                match names.len() {
                    0 => None,
                    1 => Some(names[0].to_string()),
                    _ => Some(format!("({})", names.join(" && "))),
                }
            })
            .collect();

        let rendered = groups.join(" || ");
        if groups.len() == 1 && rendered.starts_with('(') && rendered.ends_with(')') {
            rendered[1..rendered.len() - 1].to_string()
        } else {
            rendered
        }
    }
}

/// Minify an expression in one call
pub fn minify(expression: &str) -> Result<String, ExpressionError> {
    Ok(BoolMinifier::new(expression)?.minify())
}

fn precedence(token: &Token) -> u8 {
    match token {
        Token::Or => 1,
        Token::And => 2,
        _ => 0,
    }
}

fn operator_item(token: &Token) -> Option<PostfixItem> {
    match token {
        Token::And => Some(PostfixItem::And),
        Token::Or => Some(PostfixItem::Or),
        _ => None,
    }
}

fn to_postfix(tokens: &[Token], variables: &[String]) -> Result<Vec<PostfixItem>, ExpressionError> {
    let mut output = Vec::with_capacity(tokens.len());
    let mut operators: Vec<&Token> = Vec::new();

    for token in tokens {
        match token {
            Token::Variable(name) => {
                let idx = variables
                    .iter()
                    .position(|v| v == name)
                    .ok_or_else(|| ExpressionError::UndefinedVariable(name.clone()))?;
                output.push(PostfixItem::Var(idx));
            }
            Token::LeftParen => operators.push(token),
            Token::RightParen => loop {
                match operators.pop() {
                    Some(Token::LeftParen) => break,
                    Some(op) => output.extend(operator_item(op)),
                    None => return Err(ExpressionError::UnbalancedParentheses),
                }
            },
            Token::And | Token::Or => {
                while let Some(top) = operators.last() {
                    if **top == Token::LeftParen || precedence(top) < precedence(token) {
                        break;
                    }
                    output.extend(operator_item(top));
                    operators.pop();
                }
                operators.push(token);
            }
            Token::Not => return Err(ExpressionError::UnexpectedToken(token.to_string())),
        }
    }

    while let Some(op) = operators.pop() {
        if *op == Token::LeftParen {
            return Err(ExpressionError::UnbalancedParentheses);
        }
        output.extend(operator_item(op));
    }

    Ok(output)
}

fn check_arity(postfix: &[PostfixItem]) -> Result<(), ExpressionError> {
    if postfix.is_empty() {
        return Ok(());
    }
    let mut depth = 0usize;
    for item in postfix {
        match item {
            PostfixItem::Var(_) => depth += 1,
            PostfixItem::And | PostfixItem::Or => {
                if depth < 2 {
                    return Err(ExpressionError::UnexpectedEnd);
                }
                depth -= 1;
            }
        }
    }
    if depth == 1 {
        Ok(())
    } else {
        Err(ExpressionError::UnexpectedToken(
            "missing operator between operands".to_string(),
        ))
    }
}

/// Row `row` of the truth table; the first variable is the most significant bit
fn row_term(row: u64, n: usize) -> Term {
    (0..n).map(|i| ((row >> (n - 1 - i)) & 1) as i8).collect()
}

/// One Quine–McCluskey pass
///
/// Combined terms come first in pair discovery order, followed by the terms
/// that took part in no combination, then duplicates are dropped keeping the
/// first occurrence.
fn combine_pass(terms: &[Term]) -> (Vec<Term>, bool) {
    let mut next: Vec<Term> = Vec::new();
    let mut compared = vec![false; terms.len()];

    for j in 0..terms.len() {
        for k in (j + 1)..terms.len() {
            let mut differing = terms[j]
                .iter()
                .zip(&terms[k])
                .enumerate()
                .filter(|(_, (a, b))| a != b)
                .map(|(i, _)| i);
            if let (Some(pos), None) = (differing.next(), differing.next()) {
                let mut combined = terms[j].clone();
                combined[pos] = -1;
                next.push(combined);
                compared[j] = true;
                compared[k] = true;
            }
        }
    }

    let combined_any = !next.is_empty();
    next.extend(
        terms
            .iter()
            .zip(&compared)
            .filter(|(_, used)| !**used)
            .map(|(term, _)| term.clone()),
    );

    let mut unique: Vec<Term> = Vec::with_capacity(next.len());
    for term in next {
        if !unique.contains(&term) {
            unique.push(term);
        }
    }
    (unique, combined_any)
}
