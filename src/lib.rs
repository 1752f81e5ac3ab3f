//! # Calc Orchestrator
//!
//! Evaluates arithmetic expressions by splitting them into a dependency graph
//! of binary operations and handing those operations, one task at a time, to
//! stateless workers that poll for work.
//!
//! ## Pieces
//!
//! - **Parsing**: expression text becomes an [`Expr`] tree ([`ast`])
//! - **Dependency map**: the tree is flattened into operation nodes with a
//!   ready set ([`graph`])
//! - **Lanes**: each evaluation gets its own bounded task queue and result
//!   channel, multiplexed by evaluation id ([`queue`])
//! - **Controller**: feeds ready nodes to the queue and folds results back in
//!   until the root resolves or an operation divides by zero ([`controller`])
//! - **Orchestrator**: accepts expressions, gates concurrency, and writes the
//!   terminal outcome to the store exactly once ([`orchestrator`])
//!
//! All arithmetic is `f64`. Division by zero is reported as a failure, never
//! as an infinite or NaN value.

pub mod ast;
pub mod config;
pub mod controller;
pub mod error;
pub mod graph;
pub mod http;
pub mod mock;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod task;
pub mod worker;

pub use ast::{parse, Expr};
pub use config::OrchestratorConfig;
pub use controller::{EvaluationOutcome, EvaluationReport, EvaluationState};
pub use error::{BrokerError, EvalError, GraphError, OrchestratorError, ParseError, StoreError};
pub use graph::{ExpressionGraph, NodeState, Operand, OperationNode};
pub use http::build_router;
pub use orchestrator::{EvaluationHandle, Orchestrator};
pub use queue::TaskBroker;
pub use store::{ExpressionId, ExpressionRecord, ExpressionStatus, ExpressionStore, MemoryStore};
pub use task::{ArithmeticError, EvaluationId, NodeId, Operator, Task, TaskResult};
pub use worker::{compute, LocalWorkerPool};
