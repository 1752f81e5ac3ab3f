//! Dependency map of one expression.
//!
//! The tree produced by the parser is flattened into operation nodes keyed
//! by [`NodeId`]. Each operand is either a literal or a reference to another
//! node; when a node resolves, its value is substituted into every node that
//! references it, and those nodes become ready once both operands are
//! literals.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::ast::Expr;
use crate::error::GraphError;
use crate::task::{NodeId, Operator};

/// One side of an operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Literal(f64),
    Node(NodeId),
}

impl Operand {
    pub fn literal(self) -> Option<f64> {
        match self {
            Operand::Literal(v) => Some(v),
            Operand::Node(_) => None,
        }
    }
}

/// Lifecycle of a node inside the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// At least one operand still references an unresolved node.
    Waiting,
    /// Both operands are literals; not handed out yet (or handed back for retry).
    Ready,
    /// Offered to the task queue.
    Dispatched,
    /// Value known; never changes again.
    Resolved,
}

/// A single arithmetic operation in the graph
#[derive(Debug, Clone)]
pub struct OperationNode {
    pub id: NodeId,
    pub operator: Operator,
    pub left: Operand,
    pub right: Operand,
    state: NodeState,
    value: Option<f64>,
}

impl OperationNode {
    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Both operand values, if both are resolved.
    pub fn operands(&self) -> Option<(f64, f64)> {
        Some((self.left.literal()?, self.right.literal()?))
    }

    /// True when this node is a division whose resolved divisor is zero.
    pub fn divides_by_zero(&self) -> bool {
        self.operator == Operator::Div && self.right.literal() == Some(0.0)
    }

    /// True when the exact result for the resolved operands is not a finite
    /// `f64`. Division by zero is reported by [`Self::divides_by_zero`].
    pub fn overflows(&self) -> bool {
        !self.divides_by_zero()
            && self
                .operands()
                .is_some_and(|(a, b)| !self.operator.apply(a, b).is_finite())
    }
}

/// The flattened form of one expression
#[derive(Debug)]
pub struct ExpressionGraph {
    nodes: IndexMap<NodeId, OperationNode>,
    dependents: HashMap<NodeId, Vec<NodeId>>,
    root: Operand,
    resolved: usize,
}

enum Visit<'a> {
    Enter(&'a Expr),
    Exit(Operator),
}

impl ExpressionGraph {
    /// Flattens `expr` into operation nodes.
    ///
    /// Nodes are numbered in post-order, so ready-set order follows the
    /// left-to-right tree walk. The walk uses an explicit stack; long operator
    /// chains produce deep left spines.
    pub fn build(expr: &Expr) -> Result<Self, GraphError> {
        let mut nodes: IndexMap<NodeId, OperationNode> = IndexMap::new();
        let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut operands: Vec<Operand> = Vec::new();
        let mut stack = vec![Visit::Enter(expr)];
        let mut next_id: NodeId = 0;

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(Expr::Number(value)) => {
                    if !value.is_finite() {
                        return Err(GraphError::NonFiniteLiteral(*value));
                    }
                    operands.push(Operand::Literal(*value));
                }
                Visit::Enter(Expr::Binary { op, lhs, rhs }) => {
                    stack.push(Visit::Exit(*op));
                    stack.push(Visit::Enter(rhs));
                    stack.push(Visit::Enter(lhs));
                }
                Visit::Exit(operator) => {
                    let right = operands.pop().ok_or(GraphError::MissingOperand)?;
                    let left = operands.pop().ok_or(GraphError::MissingOperand)?;
                    let id = next_id;
                    next_id += 1;

                    for operand in [left, right] {
                        if let Operand::Node(child) = operand {
                            dependents.entry(child).or_default().push(id);
                        }
                    }

                    let state = if left.literal().is_some() && right.literal().is_some() {
                        NodeState::Ready
                    } else {
                        NodeState::Waiting
                    };
                    nodes.insert(
                        id,
                        OperationNode {
                            id,
                            operator,
                            left,
                            right,
                            state,
                            value: None,
                        },
                    );
                    operands.push(Operand::Node(id));
                }
            }
        }

        let root = operands.pop().ok_or(GraphError::MissingOperand)?;
        if !operands.is_empty() {
            return Err(GraphError::MissingOperand);
        }

        Ok(Self {
            nodes,
            dependents,
            root,
            resolved: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved
    }

    pub fn root(&self) -> Operand {
        self.root
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        self.root == Operand::Node(id)
    }

    /// The final value, once the root is a literal or has resolved.
    pub fn root_value(&self) -> Option<f64> {
        match self.root {
            Operand::Literal(v) => Some(v),
            Operand::Node(id) => self.nodes.get(&id).and_then(|n| n.value),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&OperationNode> {
        self.nodes.get(&id)
    }

    /// IDs of nodes ready to be dispatched, in tree-walk order.
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.state == NodeState::Ready)
            .map(|n| n.id)
            .collect()
    }

    pub fn mark_dispatched(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        match node.state {
            NodeState::Ready => {
                node.state = NodeState::Dispatched;
                Ok(())
            }
            NodeState::Dispatched => Ok(()),
            NodeState::Waiting => Err(GraphError::NotReady(id)),
            NodeState::Resolved => Err(GraphError::AlreadyResolved(id)),
        }
    }

    /// Returns a dispatched node to the ready set so it is offered again.
    pub fn mark_for_retry(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        match node.state {
            NodeState::Dispatched | NodeState::Ready => {
                node.state = NodeState::Ready;
                Ok(())
            }
            NodeState::Waiting => Err(GraphError::NotReady(id)),
            NodeState::Resolved => Err(GraphError::AlreadyResolved(id)),
        }
    }

    /// Records the value of `id` and returns the nodes it unblocked.
    pub fn resolve(&mut self, id: NodeId, value: f64) -> Result<Vec<NodeId>, GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        match node.state {
            NodeState::Resolved => return Err(GraphError::AlreadyResolved(id)),
            NodeState::Waiting => return Err(GraphError::NotReady(id)),
            NodeState::Ready | NodeState::Dispatched => {}
        }
        node.state = NodeState::Resolved;
        node.value = Some(value);
        self.resolved += 1;

        let mut newly_ready = Vec::new();
        let Some(deps) = self.dependents.get(&id) else {
            return Ok(newly_ready);
        };
        for dep_id in deps {
            let Some(dep) = self.nodes.get_mut(dep_id) else {
                continue;
            };
            for operand in [&mut dep.left, &mut dep.right] {
                if *operand == Operand::Node(id) {
                    *operand = Operand::Literal(value);
                }
            }
            if dep.state == NodeState::Waiting && dep.operands().is_some() {
                dep.state = NodeState::Ready;
                newly_ready.push(dep.id);
            }
        }
        Ok(newly_ready)
    }
}
