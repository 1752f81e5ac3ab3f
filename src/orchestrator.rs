//! Public entry point.
//!
//! [`Orchestrator`] ties the pieces together: it parses and flattens
//! submitted expressions, runs one controller per evaluation behind a
//! concurrency gate, and writes each terminal outcome to the store exactly
//! once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tracing::{error, info};

use crate::ast::{self, Expr};
use crate::config::OrchestratorConfig;
use crate::controller::{Controller, EvaluationOutcome, EvaluationReport};
use crate::error::{EvalError, GraphError, OrchestratorError};
use crate::graph::ExpressionGraph;
use crate::queue::TaskBroker;
use crate::store::{ExpressionId, ExpressionStatus, ExpressionStore};
use crate::task::EvaluationId;
use crate::worker::LocalWorkerPool;

/// Caller side of one evaluation: a single-value slot for the report plus
/// the means to abandon it.
///
/// Dropping the handle before the report arrives aborts the evaluation.
pub struct EvaluationHandle {
    evaluation_id: EvaluationId,
    report: oneshot::Receiver<EvaluationReport>,
    cancel: Option<oneshot::Sender<()>>,
}

impl EvaluationHandle {
    fn completed(report: EvaluationReport) -> Self {
        let (tx, rx) = oneshot::channel();
        let evaluation_id = report.evaluation_id;
        let _ = tx.send(report);
        Self {
            evaluation_id,
            report: rx,
            cancel: None,
        }
    }

    pub fn evaluation_id(&self) -> EvaluationId {
        self.evaluation_id
    }

    /// Asks the controller to stop. The report then carries `Aborted`
    /// unless the evaluation had already finished.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Waits for the terminal report.
    pub async fn wait(self) -> EvaluationReport {
        let EvaluationHandle {
            evaluation_id,
            report,
            cancel,
        } = self;
        let report = report.await;
        drop(cancel);

        report.unwrap_or_else(|_| EvaluationReport {
            evaluation_id,
            outcome: EvaluationOutcome::Failed(EvalError::ControllerGone),
            tasks_issued: 0,
            results_accepted: 0,
            retries: 0,
        })
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    broker: Arc<TaskBroker>,
    store: Arc<dyn ExpressionStore>,
    config: Arc<OrchestratorConfig>,
    gate: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, store: Arc<dyn ExpressionStore>) -> Self {
        let config = config.normalized();
        let broker = Arc::new(TaskBroker::new(
            config.task_queue_capacity,
            config.result_channel_capacity,
        ));
        let gate = Arc::new(Semaphore::new(config.max_concurrent_evaluations));
        Self {
            broker,
            store,
            config: Arc::new(config),
            gate,
        }
    }

    pub fn broker(&self) -> Arc<TaskBroker> {
        self.broker.clone()
    }

    pub fn store(&self) -> Arc<dyn ExpressionStore> {
        self.store.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Starts `computing_power` in-process workers.
    pub fn spawn_local_workers(&self) -> LocalWorkerPool {
        LocalWorkerPool::spawn(
            self.broker.clone(),
            self.config.computing_power,
            self.config.poll_interval(),
        )
    }

    /// Evaluates a parsed expression without touching the store.
    ///
    /// Waits for a free slot if `max_concurrent_evaluations` are running.
    pub async fn evaluate(&self, expr: &Expr) -> Result<EvaluationHandle, GraphError> {
        let graph = ExpressionGraph::build(expr)?;
        Ok(self.start(graph).await)
    }

    async fn start(&self, graph: ExpressionGraph) -> EvaluationHandle {
        if let (true, Some(value)) = (graph.is_empty(), graph.root_value()) {
            return EvaluationHandle::completed(EvaluationReport {
                evaluation_id: self.broker.next_evaluation_id(),
                outcome: EvaluationOutcome::Value(value),
                tasks_issued: 0,
                results_accepted: 0,
                retries: 0,
            });
        }

        // The semaphore lives as long as the orchestrator and is never closed.
        let permit = self.gate.clone().acquire_owned().await.ok();
        let lane = self.broker.open_lane().await;
        let evaluation_id = lane.evaluation_id();
        let controller = Controller::new(graph, lane, self.broker.clone(), self.config.clone());

        let (report_tx, report_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(async move {
            let report = controller.run(cancel_rx).await;
            drop(permit);
            let _ = report_tx.send(report);
        });

        EvaluationHandle {
            evaluation_id,
            report: report_rx,
            cancel: Some(cancel_tx),
        }
    }

    /// Accepts expression text and returns its store id immediately.
    ///
    /// Parse and structural errors are returned here and nothing is stored.
    /// A bare literal is stored as `done` before this returns; anything else
    /// is evaluated in the background and stored when it terminates.
    pub async fn submit(&self, text: &str) -> Result<ExpressionId, OrchestratorError> {
        let expr = ast::parse(text)?;
        let graph = ExpressionGraph::build(&expr)?;
        let id = self.store.insert(text).await;

        if graph.is_empty() {
            let value = graph.root_value();
            self.store.update(id, value, ExpressionStatus::Done).await?;
            info!(expression = id, "literal expression stored");
            return Ok(id);
        }

        info!(expression = id, nodes = graph.len(), "expression accepted");
        let this = self.clone();
        tokio::spawn(async move {
            let handle = this.start(graph).await;
            let report = handle.wait().await;
            this.finish(id, report).await;
        });
        Ok(id)
    }

    async fn finish(&self, id: ExpressionId, report: EvaluationReport) {
        let (status, value) = ExpressionStatus::from_outcome(&report.outcome);
        match self.store.update(id, value, status).await {
            Ok(()) => info!(
                expression = id,
                evaluation = report.evaluation_id,
                %status,
                tasks = report.tasks_issued,
                retries = report.retries,
                "expression finished"
            ),
            Err(err) => error!(expression = id, error = %err, "failed to store outcome"),
        }
    }

    /// Polls the store until `id` is terminal or `timeout` elapses.
    pub async fn wait_for(&self, id: ExpressionId, timeout: Duration) -> Option<ExpressionStatus> {
        let poll = async {
            loop {
                if let Some(record) = self.store.get(id).await {
                    if record.status.is_terminal() {
                        return record.status;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseError;
    use crate::mock::{generate_expression, reference_value, MockConfig};
    use crate::store::MemoryStore;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            time_addition_ms: 0,
            time_subtraction_ms: 0,
            time_multiplication_ms: 0,
            time_division_ms: 0,
            computing_power: 3,
            poll_interval_ms: 2,
            task_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    fn orchestrator(config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(config, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_submit_sum_then_product() {
        let orch = orchestrator(test_config());
        let workers = orch.spawn_local_workers();

        let id = orch.submit("(2 + 3) * 4").await.unwrap();
        assert_eq!(orch.wait_for(id, WAIT).await, Some(ExpressionStatus::Done));

        let record = orch.store().get(id).await.unwrap();
        assert_eq!(record.result, Some(20.0));
        assert_eq!(record.expression, "(2 + 3) * 4");

        // Repeated status queries are identical.
        assert_eq!(orch.store().get(id).await.unwrap(), record);
        workers.shutdown();
    }

    #[tokio::test]
    async fn test_submit_division_by_zero() {
        let orch = orchestrator(test_config());
        let workers = orch.spawn_local_workers();

        let id = orch.submit("10 / 0").await.unwrap();
        assert_eq!(
            orch.wait_for(id, WAIT).await,
            Some(ExpressionStatus::ZeroDivisionError)
        );
        assert_eq!(orch.store().get(id).await.unwrap().result, None);
        assert_eq!(orch.broker().active_evaluations().await, 0);
        workers.shutdown();
    }

    #[tokio::test]
    async fn test_submit_overflow_is_error() {
        let orch = orchestrator(test_config());
        let workers = orch.spawn_local_workers();

        let huge = "9".repeat(300);
        let id = orch.submit(&format!("{} * {}", huge, huge)).await.unwrap();
        assert_eq!(orch.wait_for(id, WAIT).await, Some(ExpressionStatus::Error));
        assert_eq!(orch.store().get(id).await.unwrap().result, None);
        workers.shutdown();
    }

    #[tokio::test]
    async fn test_literal_is_done_synchronously() {
        // No workers at all: a literal never needs one.
        let orch = orchestrator(test_config());
        let id = orch.submit("7").await.unwrap();

        let record = orch.store().get(id).await.unwrap();
        assert_eq!(record.status, ExpressionStatus::Done);
        assert_eq!(record.result, Some(7.0));
    }

    #[tokio::test]
    async fn test_parse_error_stores_nothing() {
        let orch = orchestrator(test_config());
        let err = orch.submit("2 +").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Parse(ParseError::UnexpectedEnd)
        ));
        assert!(orch.store().list().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_evaluations_do_not_interfere() {
        let orch = orchestrator(test_config());
        let workers = orch.spawn_local_workers();

        let cases = [
            ("1 + 2", 3.0),
            ("(1 + 2) * 3", 9.0),
            ("(4 - 1) * (2 + 2)", 12.0),
            ("100 / 4 / 5", 5.0),
            ("2 * (3 + (4 * (5 - 1)))", 38.0),
            ("-(3 - 10) + 1", 8.0),
        ];
        let mut ids = Vec::new();
        for (text, _) in &cases {
            ids.push(orch.submit(text).await.unwrap());
        }

        for (id, (text, expected)) in ids.into_iter().zip(cases) {
            assert_eq!(
                orch.wait_for(id, WAIT).await,
                Some(ExpressionStatus::Done),
                "{}",
                text
            );
            assert_eq!(orch.store().get(id).await.unwrap().result, Some(expected), "{}", text);
        }
        workers.shutdown();
    }

    #[tokio::test]
    async fn test_gate_serializes_evaluations() {
        let orch = orchestrator(OrchestratorConfig {
            max_concurrent_evaluations: 1,
            ..test_config()
        });
        let workers = orch.spawn_local_workers();

        let a = orch.submit("(1 + 1) * (2 + 2)").await.unwrap();
        let b = orch.submit("(3 + 3) * (4 + 4)").await.unwrap();
        assert_eq!(orch.wait_for(a, WAIT).await, Some(ExpressionStatus::Done));
        assert_eq!(orch.wait_for(b, WAIT).await, Some(ExpressionStatus::Done));
        assert_eq!(orch.store().get(b).await.unwrap().result, Some(48.0));
        workers.shutdown();
    }

    #[tokio::test]
    async fn test_random_expressions_match_reference() {
        let orch = orchestrator(test_config());
        let workers = orch.spawn_local_workers();
        let config = MockConfig::default();

        for _ in 0..20 {
            let expr = generate_expression(&config);
            let report = orch.evaluate(&expr).await.unwrap().wait().await;
            match reference_value(&expr) {
                Some(expected) => {
                    assert_eq!(report.outcome, EvaluationOutcome::Value(expected));
                    assert_eq!(report.tasks_issued, expr.operation_count());
                }
                None => assert!(matches!(
                    report.outcome,
                    EvaluationOutcome::Failed(EvalError::DivisionByZero { .. })
                )),
            }
        }
        assert_eq!(orch.broker().active_evaluations().await, 0);
        workers.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_through_handle() {
        // No workers, so the evaluation can only end by cancellation.
        let orch = orchestrator(test_config());
        let expr = ast::parse("(1 + 2) * 3").unwrap();

        let mut handle = orch.evaluate(&expr).await.unwrap();
        handle.cancel();
        let report = handle.wait().await;
        assert_eq!(report.outcome, EvaluationOutcome::Aborted);
        assert_eq!(orch.broker().active_evaluations().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_aborts() {
        let orch = orchestrator(test_config());
        let expr = ast::parse("5 - 1").unwrap();
        drop(orch.evaluate(&expr).await.unwrap());

        let broker = orch.broker();
        let cleared = tokio::time::timeout(WAIT, async {
            while broker.active_evaluations().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(cleared.is_ok());
    }
}
