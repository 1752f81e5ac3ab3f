//! Reference worker.
//!
//! [`compute`] is the arithmetic every worker performs. [`LocalWorkerPool`]
//! runs a number of pollers inside the orchestrator process, pulling from the
//! broker exactly like remote agents do over HTTP.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::queue::TaskBroker;
use crate::task::{ArithmeticError, Operator, Task, TaskResult};

/// Performs one task. Division by zero is reported, never computed.
pub fn compute(task: &Task) -> TaskResult {
    if task.operation == Operator::Div && task.arg2 == 0.0 {
        return TaskResult::failure(task, ArithmeticError::DivisionByZero);
    }
    TaskResult::value(task, task.operation.apply(task.arg1, task.arg2))
}

/// Pollers running against an in-process broker
pub struct LocalWorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl LocalWorkerPool {
    /// Spawns `count` pollers. Idle pollers sleep `poll_interval` plus up to
    /// 50% random jitter so they do not hit the broker in lockstep.
    pub fn spawn(broker: Arc<TaskBroker>, count: usize, poll_interval: Duration) -> Self {
        let handles = (0..count)
            .map(|worker| {
                let broker = broker.clone();
                tokio::spawn(async move { poll_loop(worker, broker, poll_interval).await })
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn jittered(interval: Duration) -> Duration {
    let max_jitter = (interval.as_millis() as u64) / 2;
    let jitter = if max_jitter == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max_jitter)
    };
    interval + Duration::from_millis(jitter)
}

async fn poll_loop(worker: usize, broker: Arc<TaskBroker>, poll_interval: Duration) {
    loop {
        let Some(task) = broker.next_task().await else {
            sleep(jittered(poll_interval)).await;
            continue;
        };

        debug!(
            worker,
            evaluation = task.evaluation_id,
            node = task.id,
            "computing {} {} {}",
            task.arg1,
            task.operation,
            task.arg2
        );
        sleep(Duration::from_millis(task.operation_time)).await;

        if let Err(err) = broker.submit_result(compute(&task)).await {
            warn!(worker, node = task.id, error = %err, "result rejected");
        }
    }
}
