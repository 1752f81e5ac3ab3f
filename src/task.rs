//! Units of work exchanged with workers

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of an operation node within one evaluation.
pub type NodeId = u32;

/// Identity of one evaluation. Tasks and results carry it so several
/// evaluations can share the broker without their node ids colliding.
pub type EvaluationId = u64;

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
}

impl Operator {
    pub fn symbol(self) -> char {
        match self {
            Operator::Add => '+',
            Operator::Sub => '-',
            Operator::Mul => '*',
            Operator::Div => '/',
        }
    }

    /// Plain `f64` arithmetic. Division by zero yields a non-finite value;
    /// callers check the divisor first.
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Operator::Add => a + b,
            Operator::Sub => a - b,
            Operator::Mul => a * b,
            Operator::Div => a / b,
        }
    }

    pub fn from_symbol(ch: char) -> Option<Self> {
        match ch {
            '+' => Some(Operator::Add),
            '-' => Some(Operator::Sub),
            '*' => Some(Operator::Mul),
            '/' => Some(Operator::Div),
            _ => None,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// A runnable operation handed to a worker. Both operands are already
/// resolved numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub evaluation_id: EvaluationId,
    pub id: NodeId,
    pub arg1: f64,
    pub arg2: f64,
    pub operation: Operator,
    /// Simulated cost of the operation, in milliseconds.
    pub operation_time: u64,
    /// 1 for the first dispatch, incremented on every retry.
    pub attempt: u32,
}

/// Arithmetic failures a worker may report instead of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticError {
    DivisionByZero,
}

/// A worker's reply to exactly one [`Task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub evaluation_id: EvaluationId,
    pub id: NodeId,
    #[serde(default)]
    pub result: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ArithmeticError>,
}

impl TaskResult {
    pub fn value(task: &Task, result: f64) -> Self {
        Self {
            evaluation_id: task.evaluation_id,
            id: task.id,
            result,
            error: None,
        }
    }

    pub fn failure(task: &Task, error: ArithmeticError) -> Self {
        Self {
            evaluation_id: task.evaluation_id,
            id: task.id,
            result: 0.0,
            error: Some(error),
        }
    }
}
