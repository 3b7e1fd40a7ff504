//! Property tests for the dependency expression minifier
//!
//! Random AND/OR expressions over up to five variables are generated from a
//! fixed seed. Every minified form must evaluate like its input for every
//! assignment, and minifying it again must not change it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sensor_engine::{minify, BoolMinifier, DependencyExpression};
use std::collections::HashMap;

const VARIABLES: [&str; 5] = ["a", "b", "c", "d", "e"];

fn random_expression(rng: &mut StdRng, variables: usize, depth: u32) -> String {
    if depth == 0 || rng.gen_ratio(1, 3) {
        return VARIABLES[rng.gen_range(0..variables)].to_string();
    }
    let left = random_expression(rng, variables, depth - 1);
    let right = random_expression(rng, variables, depth - 1);
    let op = if rng.gen_bool(0.5) { "&&" } else { "||" };
    format!("({} {} {})", left, op, right)
}

fn assignments(variables: usize) -> impl Iterator<Item = HashMap<String, bool>> {
    (0..1u32 << variables).map(move |mask| {
        VARIABLES
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i < variables && mask & (1 << i) != 0))
            .collect()
    })
}

fn assert_equivalent(original: &str, minified: &str, variables: usize) {
    let original_expr = DependencyExpression::parse(original).unwrap();
    let minified_expr = DependencyExpression::parse(minified).unwrap();
    for parameters in assignments(variables) {
        assert_eq!(
            original_expr.evaluate(&parameters).unwrap(),
            minified_expr.evaluate(&parameters).unwrap(),
            "{} and {} differ for {:?}",
            original,
            minified,
            parameters
        );
    }
}

#[test]
fn test_minify_preserves_truth_table() {
    let mut rng = StdRng::seed_from_u64(0x9e37_79b9_7f4a_7c15);
    for variables in 1..=VARIABLES.len() {
        for _ in 0..200 {
            let expression = random_expression(&mut rng, variables, 4);
            let minified = minify(&expression).unwrap();
            assert!(!minified.is_empty(), "{} minified to nothing", expression);
            assert_equivalent(&expression, &minified, variables);
        }
    }
}

#[test]
fn test_minify_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(0x2545_f491_4f6c_dd1d);
    for variables in 1..=VARIABLES.len() {
        for _ in 0..200 {
            let expression = random_expression(&mut rng, variables, 4);
            let minified = minify(&expression).unwrap();
            let again = minify(&minified).unwrap();

            let before = BoolMinifier::new(&expression).unwrap();
            let after = BoolMinifier::new(&minified).unwrap();
            if before.variables() == after.variables() {
                assert_eq!(again, minified, "minifying {} is not stable", expression);
            } else {
                // Absorbed variables change the truth table width, not its meaning
                assert_equivalent(&minified, &again, variables);
            }
            assert_eq!(minify(&again).unwrap(), again);
        }
    }
}

#[test]
fn test_minify_known_forms() {
    assert_eq!(minify("a || b").unwrap(), "b || a");
    assert_eq!(minify("(a || b) && c").unwrap(), "(b && c) || (a && c)");
    assert_eq!(
        minify("((a && b) || (c && d)) && c").unwrap(),
        "(c && d) || (a && b && c)"
    );
}

#[test]
fn test_minified_expression_keeps_one_and_done() {
    let minified = minify("(dep-a || dep-b) || (dep-a && dep-b)").unwrap();
    let parsed = DependencyExpression::parse(&minified).unwrap();
    assert!(parsed.one_and_done());

    let minified = minify("(dep-a || dep-b) && dep-b").unwrap();
    assert_eq!(minified, "dep-b");
}
