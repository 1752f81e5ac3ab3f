//! Evaluation controller.
//!
//! Drives one [`ExpressionGraph`] to completion: offers ready nodes to the
//! lane's task queue, absorbs results in arrival order, feeds newly ready
//! nodes back into the queue, and stops at the root value or the first
//! fatal condition. It is the only writer of node state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{EvalError, GraphError};
use crate::graph::{ExpressionGraph, NodeState};
use crate::queue::{LaneHandle, TaskBroker};
use crate::task::{EvaluationId, NodeId, Task, TaskResult};

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationState {
    Building,
    Running,
    Done,
    Failed,
    Aborted,
}

/// Terminal value of an evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    Value(f64),
    Failed(EvalError),
    /// The caller abandoned the evaluation.
    Aborted,
}

impl EvaluationOutcome {
    pub fn value(&self) -> Option<f64> {
        match self {
            EvaluationOutcome::Value(v) => Some(*v),
            _ => None,
        }
    }
}

/// What the final result slot delivers
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub evaluation_id: EvaluationId,
    pub outcome: EvaluationOutcome,
    /// Tasks put on the queue, retries included.
    pub tasks_issued: usize,
    /// Results that changed node state (or failed the evaluation).
    pub results_accepted: usize,
    pub retries: usize,
}

enum Wake {
    Cancelled,
    Result(TaskResult),
    Closed,
    Tick,
}

pub(crate) struct Controller {
    graph: ExpressionGraph,
    lane: LaneHandle,
    broker: Arc<TaskBroker>,
    config: Arc<OrchestratorConfig>,
    state: EvaluationState,
    pending: VecDeque<NodeId>,
    attempts: HashMap<NodeId, u32>,
    tasks_issued: usize,
    results_accepted: usize,
    retries: usize,
}

impl Controller {
    pub(crate) fn new(
        graph: ExpressionGraph,
        lane: LaneHandle,
        broker: Arc<TaskBroker>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let pending = graph.ready_nodes().into_iter().collect();
        Self {
            graph,
            lane,
            broker,
            config,
            state: EvaluationState::Building,
            pending,
            attempts: HashMap::new(),
            tasks_issued: 0,
            results_accepted: 0,
            retries: 0,
        }
    }

    fn evaluation_id(&self) -> EvaluationId {
        self.lane.evaluation_id()
    }

    /// Runs until a terminal state, tears the lane down, and reports.
    ///
    /// Resolving or dropping the sender behind `cancel` aborts the evaluation.
    pub(crate) async fn run(mut self, mut cancel: oneshot::Receiver<()>) -> EvaluationReport {
        let outcome = self.drive(&mut cancel).await;
        self.teardown().await;

        EvaluationReport {
            evaluation_id: self.evaluation_id(),
            outcome,
            tasks_issued: self.tasks_issued,
            results_accepted: self.results_accepted,
            retries: self.retries,
        }
    }

    fn transition(&mut self, next: EvaluationState) {
        debug!(
            evaluation = self.evaluation_id(),
            from = ?self.state,
            to = ?next,
            "state transition"
        );
        self.state = next;
    }

    fn fail(&mut self, err: EvalError) -> EvaluationOutcome {
        warn!(evaluation = self.evaluation_id(), error = %err, "evaluation failed");
        self.transition(EvaluationState::Failed);
        EvaluationOutcome::Failed(err)
    }

    async fn drive(&mut self, cancel: &mut oneshot::Receiver<()>) -> EvaluationOutcome {
        if let Some(value) = self.graph.root_value() {
            self.transition(EvaluationState::Done);
            return EvaluationOutcome::Value(value);
        }
        if self.pending.is_empty() {
            return self.fail(GraphError::NoReadyNodes.into());
        }

        self.transition(EvaluationState::Running);
        info!(
            evaluation = self.evaluation_id(),
            nodes = self.graph.len(),
            ready = self.pending.len(),
            "evaluation running"
        );

        let tick = self.config.controller_tick();
        loop {
            self.offer_pending();

            let wake = tokio::select! {
                biased;
                _ = &mut *cancel => Wake::Cancelled,
                received = tokio::time::timeout(tick, self.lane.recv()) => match received {
                    Ok(Some(result)) => Wake::Result(result),
                    Ok(None) => Wake::Closed,
                    Err(_) => Wake::Tick,
                },
            };

            match wake {
                Wake::Cancelled => {
                    info!(evaluation = self.evaluation_id(), "evaluation aborted by caller");
                    self.transition(EvaluationState::Aborted);
                    return EvaluationOutcome::Aborted;
                }
                Wake::Closed => return self.fail(EvalError::ChannelClosed),
                Wake::Result(result) => match self.absorb(result) {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => {}
                    Err(err) => return self.fail(err),
                },
                Wake::Tick => {}
            }

            if let Err(err) = self.reclaim_lost().await {
                return self.fail(err);
            }
        }
    }

    /// Offers pending nodes in order until the queue refuses one.
    fn offer_pending(&mut self) {
        while let Some(&id) = self.pending.front() {
            let operands = match self.graph.get(id) {
                Some(node) if node.state() == NodeState::Ready => {
                    node.operands().map(|(a, b)| (node.operator, a, b))
                }
                _ => None,
            };
            // Resolved by a late result while waiting for a retry slot.
            let Some((operation, arg1, arg2)) = operands else {
                self.pending.pop_front();
                continue;
            };

            let attempt = self.attempts.get(&id).copied().unwrap_or(0) + 1;
            let task = Task {
                evaluation_id: self.evaluation_id(),
                id,
                arg1,
                arg2,
                operation,
                operation_time: self.config.operation_time(operation),
                attempt,
            };

            if self.lane.try_offer(task).is_err() {
                break;
            }
            self.pending.pop_front();
            if let Err(err) = self.graph.mark_dispatched(id) {
                warn!(
                    evaluation = self.evaluation_id(),
                    node = id,
                    error = %err,
                    "dispatch bookkeeping failed"
                );
            }
            self.attempts.insert(id, attempt);
            self.tasks_issued += 1;
            debug!(
                evaluation = self.evaluation_id(),
                node = id,
                attempt,
                "task issued: {} {} {}",
                arg1,
                operation,
                arg2
            );
        }
    }

    /// Applies one result. Returns the outcome once the evaluation is over.
    fn absorb(&mut self, result: TaskResult) -> Result<Option<EvaluationOutcome>, EvalError> {
        let id = result.id;
        let Some(node) = self.graph.get(id) else {
            warn!(evaluation = self.evaluation_id(), node = id, "result for unknown node ignored");
            return Ok(None);
        };

        match node.state() {
            NodeState::Resolved => {
                debug!(evaluation = self.evaluation_id(), node = id, "duplicate result ignored");
                return Ok(None);
            }
            NodeState::Waiting => {
                warn!(
                    evaluation = self.evaluation_id(),
                    node = id,
                    "result for blocked node ignored"
                );
                return Ok(None);
            }
            NodeState::Ready | NodeState::Dispatched => {}
        }
        if !self.attempts.contains_key(&id) {
            warn!(
                evaluation = self.evaluation_id(),
                node = id,
                "result for undispatched node ignored"
            );
            return Ok(None);
        }

        // The operands are authoritative: whatever the worker answered, a
        // division by a resolved zero fails the evaluation.
        if node.divides_by_zero() {
            self.results_accepted += 1;
            return Ok(Some(self.fail(EvalError::DivisionByZero { node: id })));
        }
        // Every correct worker would report the same infinity.
        if node.overflows() {
            self.results_accepted += 1;
            return Ok(Some(self.fail(EvalError::Overflow { node: id })));
        }
        if result.error.is_some() || !result.result.is_finite() {
            warn!(
                evaluation = self.evaluation_id(),
                node = id,
                error = ?result.error,
                value = result.result,
                "malformed result, retrying task"
            );
            self.retry(id)?;
            return Ok(None);
        }

        let newly_ready = self.graph.resolve(id, result.result)?;
        self.results_accepted += 1;
        debug!(
            evaluation = self.evaluation_id(),
            node = id,
            value = result.result,
            unblocked = newly_ready.len(),
            "node resolved"
        );

        if self.graph.is_root(id) {
            info!(
                evaluation = self.evaluation_id(),
                value = result.result,
                "evaluation done"
            );
            self.transition(EvaluationState::Done);
            return Ok(Some(EvaluationOutcome::Value(result.result)));
        }

        self.pending.extend(newly_ready);
        Ok(None)
    }

    /// Puts a dispatched node back in line, or fails once its attempts run out.
    fn retry(&mut self, id: NodeId) -> Result<(), EvalError> {
        let attempts = self.attempts.get(&id).copied().unwrap_or(0);
        if attempts >= self.config.max_task_attempts {
            return Err(EvalError::LostTask { node: id, attempts });
        }
        self.graph.mark_for_retry(id)?;
        if !self.pending.contains(&id) {
            self.pending.push_back(id);
        }
        self.retries += 1;
        Ok(())
    }

    async fn reclaim_lost(&mut self) -> Result<(), EvalError> {
        let expired = self.lane.expired_leases(self.config.task_timeout()).await;
        for id in expired {
            let dispatched = self
                .graph
                .get(id)
                .is_some_and(|n| n.state() == NodeState::Dispatched);
            if !dispatched {
                continue;
            }
            warn!(evaluation = self.evaluation_id(), node = id, "task lost, retrying");
            self.retry(id)?;
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        let drained = self.lane.drain().await;
        self.broker.close_lane(self.evaluation_id()).await;
        debug!(
            evaluation = self.evaluation_id(),
            state = ?self.state,
            stale_tasks = drained.tasks,
            stale_results = drained.results,
            "lane drained"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse;
    use crate::task::ArithmeticError;
    use crate::worker::compute;
    use std::time::Duration;
    use tokio::time::sleep;

    fn config() -> Arc<OrchestratorConfig> {
        Arc::new(OrchestratorConfig {
            task_timeout_ms: 40,
            max_task_attempts: 3,
            ..Default::default()
        })
    }

    async fn start(
        text: &str,
        config: Arc<OrchestratorConfig>,
    ) -> (
        Arc<TaskBroker>,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<EvaluationReport>,
    ) {
        let broker = Arc::new(TaskBroker::new(
            config.task_queue_capacity,
            config.result_channel_capacity,
        ));
        let graph = ExpressionGraph::build(&parse(text).unwrap()).unwrap();
        let lane = broker.open_lane().await;
        let controller = Controller::new(graph, lane, broker.clone(), config);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let join = tokio::spawn(controller.run(cancel_rx));
        (broker, cancel_tx, join)
    }

    async fn poll(broker: &TaskBroker) -> Task {
        loop {
            if let Some(task) = broker.next_task().await {
                return task;
            }
            sleep(Duration::from_millis(2)).await;
        }
    }

    /// Answers tasks one by one until the controller finishes.
    async fn work(
        broker: Arc<TaskBroker>,
        join: tokio::task::JoinHandle<EvaluationReport>,
    ) -> EvaluationReport {
        let worker = {
            let broker = broker.clone();
            tokio::spawn(async move {
                loop {
                    let task = poll(&broker).await;
                    let _ = broker.submit_result(compute(&task)).await;
                }
            })
        };
        let report = join.await.unwrap();
        worker.abort();
        report
    }

    #[tokio::test]
    async fn test_sum_then_product() {
        let (broker, _cancel, join) = start("(2 + 3) * 4", config()).await;
        let report = work(broker.clone(), join).await;

        assert_eq!(report.outcome, EvaluationOutcome::Value(20.0));
        assert_eq!(report.tasks_issued, 2);
        assert_eq!(report.results_accepted, 2);
        assert_eq!(report.retries, 0);
        assert_eq!(broker.active_evaluations().await, 0);
    }

    #[tokio::test]
    async fn test_literal_completes_without_tasks() {
        let (broker, _cancel, join) = start("42", config()).await;
        let report = join.await.unwrap();

        assert_eq!(report.outcome, EvaluationOutcome::Value(42.0));
        assert_eq!(report.tasks_issued, 0);
        assert!(broker.next_task().await.is_none());
    }

    #[tokio::test]
    async fn test_one_task_per_node() {
        let text = "((1 + 2) * (3 + 4) - 5) / (6 - 4)";
        let nodes = parse(text).unwrap().operation_count();
        let (broker, _cancel, join) = start(text, config()).await;
        let report = work(broker, join).await;

        assert_eq!(report.outcome, EvaluationOutcome::Value(8.0));
        assert_eq!(report.tasks_issued, nodes);
        assert_eq!(report.results_accepted, nodes);
    }

    #[tokio::test]
    async fn test_division_by_zero() {
        let (broker, _cancel, join) = start("10 / 0", config()).await;
        let report = work(broker.clone(), join).await;

        assert_eq!(
            report.outcome,
            EvaluationOutcome::Failed(EvalError::DivisionByZero { node: 0 })
        );
        assert_eq!(report.outcome.value(), None);
        assert_eq!(broker.active_evaluations().await, 0);
    }

    #[tokio::test]
    async fn test_nested_division_by_zero_fails_whole_evaluation() {
        let (broker, _cancel, join) = start("1 + 2 * (3 / (4 - 4)) + (5 + 6)", config()).await;
        let report = work(broker.clone(), join).await;

        assert!(matches!(
            report.outcome,
            EvaluationOutcome::Failed(EvalError::DivisionByZero { .. })
        ));
        assert!(broker.next_task().await.is_none());
    }

    #[tokio::test]
    async fn test_results_accepted_out_of_order() {
        let (broker, _cancel, join) = start("(1 + 2) * (3 + 4)", config()).await;

        let first = poll(&broker).await;
        let second = poll(&broker).await;
        broker.submit_result(compute(&second)).await.unwrap();
        broker.submit_result(compute(&first)).await.unwrap();

        let product = poll(&broker).await;
        assert_eq!(product.operation, crate::task::Operator::Mul);
        assert_eq!((product.arg1, product.arg2), (3.0, 7.0));
        broker.submit_result(compute(&product)).await.unwrap();

        let report = join.await.unwrap();
        assert_eq!(report.outcome, EvaluationOutcome::Value(21.0));
    }

    #[tokio::test]
    async fn test_lost_task_is_retried() {
        let (broker, _cancel, join) = start("6 * 7", config()).await;

        let lost = poll(&broker).await;
        assert_eq!(lost.attempt, 1);

        let retried = poll(&broker).await;
        assert_eq!(retried.id, lost.id);
        assert_eq!(retried.attempt, 2);
        broker.submit_result(compute(&retried)).await.unwrap();

        let report = join.await.unwrap();
        assert_eq!(report.outcome, EvaluationOutcome::Value(42.0));
        assert_eq!(report.retries, 1);
        assert_eq!(report.tasks_issued, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_internal_error() {
        let config = Arc::new(OrchestratorConfig {
            task_timeout_ms: 20,
            max_task_attempts: 2,
            ..Default::default()
        });
        let (broker, _cancel, join) = start("1 + 1", config).await;

        poll(&broker).await;
        poll(&broker).await;

        let report = join.await.unwrap();
        match report.outcome {
            EvaluationOutcome::Failed(err) => {
                assert_eq!(err, EvalError::LostTask { node: 0, attempts: 2 });
                assert!(!err.is_arithmetic());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(broker.active_evaluations().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_results_are_retried() {
        let (broker, _cancel, join) = start("9 - 4", config()).await;

        let task = poll(&broker).await;
        let mut bogus = compute(&task);
        bogus.result = f64::NAN;
        broker.submit_result(bogus).await.unwrap();

        // A division-by-zero claim on a subtraction is not believed either.
        let task = poll(&broker).await;
        broker
            .submit_result(TaskResult::failure(&task, ArithmeticError::DivisionByZero))
            .await
            .unwrap();

        let task = poll(&broker).await;
        assert_eq!(task.attempt, 3);
        broker.submit_result(compute(&task)).await.unwrap();

        let report = join.await.unwrap();
        assert_eq!(report.outcome, EvaluationOutcome::Value(5.0));
        assert_eq!(report.retries, 2);
    }

    #[tokio::test]
    async fn test_overflow_fails_without_retry() {
        let huge = "9".repeat(300);
        let (broker, _cancel, join) = start(&format!("{} * {} + 1", huge, huge), config()).await;
        let report = work(broker.clone(), join).await;

        assert_eq!(
            report.outcome,
            EvaluationOutcome::Failed(EvalError::Overflow { node: 0 })
        );
        assert_eq!(report.tasks_issued, 1);
        assert_eq!(report.retries, 0);
        assert_eq!(broker.active_evaluations().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_results_ignored() {
        let (broker, _cancel, join) = start("(1 + 1) * 3", config()).await;

        let task = poll(&broker).await;
        let eval = task.evaluation_id;
        let stray = TaskResult {
            evaluation_id: eval,
            id: 77,
            result: 1.0,
            error: None,
        };
        broker.submit_result(stray).await.unwrap();
        broker.submit_result(compute(&task)).await.unwrap();
        broker.submit_result(compute(&task)).await.unwrap();

        let task = poll(&broker).await;
        broker.submit_result(compute(&task)).await.unwrap();

        let report = join.await.unwrap();
        assert_eq!(report.outcome, EvaluationOutcome::Value(6.0));
        assert_eq!(report.results_accepted, 2);
    }

    #[tokio::test]
    async fn test_cancel_aborts_and_cleans_up() {
        let (broker, cancel, join) = start("(1 + 2) * (3 + 4)", config()).await;
        poll(&broker).await;

        cancel.send(()).unwrap();
        let report = join.await.unwrap();
        assert_eq!(report.outcome, EvaluationOutcome::Aborted);
        assert_eq!(broker.active_evaluations().await, 0);
        assert!(broker.next_task().await.is_none());
    }

    #[tokio::test]
    async fn test_small_queue_still_completes() {
        let config = Arc::new(OrchestratorConfig {
            task_queue_capacity: 1,
            result_channel_capacity: 1,
            task_timeout_ms: 1_000,
            ..Default::default()
        });
        let (broker, _cancel, join) = start("(1 + 2) + (3 + 4) + (5 + 6)", config).await;
        let report = work(broker, join).await;

        assert_eq!(report.outcome, EvaluationOutcome::Value(21.0));
        assert_eq!(report.retries, 0);
    }
}
