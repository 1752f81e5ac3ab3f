//! Error types for every stage of an evaluation.

use thiserror::Error;

use crate::task::{EvaluationId, NodeId};

/// Failure to turn expression text into an [`Expr`](crate::ast::Expr).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unexpected token at position {pos}")]
    UnexpectedToken { pos: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unbalanced parentheses")]
    UnbalancedParens,

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("expression nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Structural problems found while flattening a tree into a graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("operator node is missing an operand")]
    MissingOperand,

    #[error("literal {0} is not a finite number")]
    NonFiniteLiteral(f64),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("node {0} is already resolved")]
    AlreadyResolved(NodeId),

    #[error("node {0} is not ready")]
    NotReady(NodeId),

    #[error("graph has no ready nodes")]
    NoReadyNodes,
}

/// Why an evaluation failed. `DivisionByZero` is the only arithmetic failure;
/// everything else is an internal error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("division by zero at node {node}")]
    DivisionByZero { node: NodeId },

    #[error("result of node {node} overflows f64")]
    Overflow { node: NodeId },

    #[error("task for node {node} lost after {attempts} attempts")]
    LostTask { node: NodeId, attempts: u32 },

    #[error("malformed expression graph: {0}")]
    Graph(#[from] GraphError),

    #[error("result channel closed")]
    ChannelClosed,

    #[error("evaluation controller exited without reporting")]
    ControllerGone,
}

impl EvalError {
    pub fn is_arithmetic(&self) -> bool {
        matches!(self, EvalError::DivisionByZero { .. })
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown evaluation {0}")]
    UnknownEvaluation(EvaluationId),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("expression {0} not found")]
    NotFound(u64),

    #[error("expression {0} already has a terminal status")]
    AlreadyFinal(u64),
}

/// Errors returned synchronously to whoever submits an expression.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
