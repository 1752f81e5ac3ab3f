//! Mock expression generation for testing

use rand::Rng;

use crate::ast::Expr;
use crate::task::Operator;

/// Configuration for mock expression generation
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Maximum depth of the generated tree (0 = a single literal)
    pub max_depth: usize,
    /// Probability (0.0-1.0) that a subtree stops early as a literal
    pub leaf_probability: f64,
    /// Literals are drawn from `0..=max_literal`
    pub max_literal: u32,
    /// Probability (0.0-1.0) that an operator is a division
    pub division_probability: f64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            max_depth: 4,
            leaf_probability: 0.25,
            max_literal: 9,
            division_probability: 0.2,
        }
    }
}

/// Generates a random expression tree.
///
/// Small integer literals keep every intermediate value exact, and zero
/// divisors occur naturally (literal `0` or a subtree such as `3 - 3`).
pub fn generate_expression(config: &MockConfig) -> Expr {
    let mut rng = rand::thread_rng();
    generate(&mut rng, config, config.max_depth)
}

fn generate<R: Rng>(rng: &mut R, config: &MockConfig, depth: usize) -> Expr {
    if depth == 0 || rng.gen_bool(config.leaf_probability) {
        return Expr::Number(rng.gen_range(0..=config.max_literal) as f64);
    }

    let op = if rng.gen_bool(config.division_probability) {
        Operator::Div
    } else {
        match rng.gen_range(0..3) {
            0 => Operator::Add,
            1 => Operator::Sub,
            _ => Operator::Mul,
        }
    };
    let lhs = generate(rng, config, depth - 1);
    let rhs = generate(rng, config, depth - 1);
    Expr::binary(op, lhs, rhs)
}

/// Renders an expression as fully parenthesized text accepted by the parser.
pub fn render(expr: &Expr) -> String {
    match expr {
        Expr::Number(v) => format!("{}", v),
        Expr::Binary { op, lhs, rhs } => format!("({} {} {})", render(lhs), op, render(rhs)),
    }
}

/// Evaluates an expression directly. `None` if any division has a zero divisor.
pub fn reference_value(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Number(v) => Some(*v),
        Expr::Binary { op, lhs, rhs } => {
            let a = reference_value(lhs);
            let b = reference_value(rhs);
            let (a, b) = (a?, b?);
            match op {
                Operator::Add => Some(a + b),
                Operator::Sub => Some(a - b),
                Operator::Mul => Some(a * b),
                Operator::Div if b == 0.0 => None,
                Operator::Div => Some(a / b),
            }
        }
    }
}
