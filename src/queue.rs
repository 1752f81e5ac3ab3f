//! Task queue and result channel.
//!
//! Every evaluation owns a lane: a bounded task queue that workers pull
//! from and a bounded result channel that only its controller reads. The
//! broker keeps lanes by evaluation id, so tasks from different evaluations
//! never share a queue and a finished evaluation leaves nothing behind once
//! its lane is closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::task::{EvaluationId, NodeId, Task, TaskResult};

/// Worker-facing half of one evaluation's channel pair
struct Lane {
    tasks_rx: Mutex<mpsc::Receiver<Task>>,
    results_tx: mpsc::Sender<TaskResult>,
    /// Tasks handed to a worker and not yet answered, with the hand-off time.
    leases: Mutex<HashMap<NodeId, Instant>>,
}

/// Controller-facing half of one evaluation's channel pair
pub struct LaneHandle {
    evaluation_id: EvaluationId,
    tasks_tx: mpsc::Sender<Task>,
    results_rx: mpsc::Receiver<TaskResult>,
    lane: Arc<Lane>,
}

/// Entries discarded while tearing a lane down
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Drained {
    pub tasks: usize,
    pub results: usize,
}

impl LaneHandle {
    pub fn evaluation_id(&self) -> EvaluationId {
        self.evaluation_id
    }

    /// Non-blocking enqueue. Hands the task back if the queue is full.
    pub fn try_offer(&self, task: Task) -> Result<(), Task> {
        match self.tasks_tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) | Err(TrySendError::Closed(task)) => Err(task),
        }
    }

    /// Waits for the next result. `None` only if the lane was torn down.
    pub async fn recv(&mut self) -> Option<TaskResult> {
        self.results_rx.recv().await
    }

    /// Removes and returns leases held longer than `timeout`.
    pub async fn expired_leases(&self, timeout: Duration) -> Vec<NodeId> {
        let mut leases = self.lane.leases.lock().await;
        let expired: Vec<NodeId> = leases
            .iter()
            .filter(|(_, taken)| taken.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            leases.remove(id);
        }
        expired
    }

    /// Closes both channels and discards whatever is still buffered.
    pub async fn drain(&mut self) -> Drained {
        let mut drained = Drained::default();

        {
            let mut tasks = self.lane.tasks_rx.lock().await;
            tasks.close();
            while tasks.try_recv().is_ok() {
                drained.tasks += 1;
            }
        }

        self.results_rx.close();
        while self.results_rx.try_recv().is_ok() {
            drained.results += 1;
        }

        self.lane.leases.lock().await.clear();
        drained
    }
}

/// Hand-off point between controllers and workers
pub struct TaskBroker {
    lanes: RwLock<IndexMap<EvaluationId, Arc<Lane>>>,
    next_evaluation: AtomicU64,
    cursor: AtomicUsize,
    task_capacity: usize,
    result_capacity: usize,
}

impl TaskBroker {
    pub fn new(task_capacity: usize, result_capacity: usize) -> Self {
        Self {
            lanes: RwLock::new(IndexMap::new()),
            next_evaluation: AtomicU64::new(1),
            cursor: AtomicUsize::new(0),
            task_capacity: task_capacity.max(1),
            result_capacity: result_capacity.max(1),
        }
    }

    /// Allocates an evaluation id without opening a lane.
    pub fn next_evaluation_id(&self) -> EvaluationId {
        self.next_evaluation.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a fresh lane under a new evaluation id.
    pub async fn open_lane(&self) -> LaneHandle {
        let evaluation_id = self.next_evaluation_id();
        let (tasks_tx, tasks_rx) = mpsc::channel(self.task_capacity);
        let (results_tx, results_rx) = mpsc::channel(self.result_capacity);
        let lane = Arc::new(Lane {
            tasks_rx: Mutex::new(tasks_rx),
            results_tx,
            leases: Mutex::new(HashMap::new()),
        });

        self.lanes.write().await.insert(evaluation_id, lane.clone());
        debug!(evaluation = evaluation_id, "lane opened");

        LaneHandle {
            evaluation_id,
            tasks_tx,
            results_rx,
            lane,
        }
    }

    /// Unregisters a lane. Late results for it are rejected from now on.
    pub async fn close_lane(&self, evaluation_id: EvaluationId) -> bool {
        let removed = self.lanes.write().await.shift_remove(&evaluation_id).is_some();
        if removed {
            debug!(evaluation = evaluation_id, "lane closed");
        }
        removed
    }

    pub async fn active_evaluations(&self) -> usize {
        self.lanes.read().await.len()
    }

    /// Hands one task to a polling worker, or `None` when every lane is empty.
    ///
    /// Lanes are visited round-robin so one large evaluation does not starve
    /// the others.
    pub async fn next_task(&self) -> Option<Task> {
        let lanes: Vec<Arc<Lane>> = self.lanes.read().await.values().cloned().collect();
        if lanes.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..lanes.len() {
            let lane = &lanes[(start + offset) % lanes.len()];
            let task = lane.tasks_rx.lock().await.try_recv().ok();
            if let Some(task) = task {
                lane.leases.lock().await.insert(task.id, Instant::now());
                return Some(task);
            }
        }
        None
    }

    /// Routes a worker's result to the evaluation that issued the task.
    pub async fn submit_result(&self, result: TaskResult) -> Result<(), BrokerError> {
        let evaluation_id = result.evaluation_id;
        let lane = self.lanes.read().await.get(&evaluation_id).cloned();
        let Some(lane) = lane else {
            warn!(
                evaluation = evaluation_id,
                node = result.id,
                "result for unknown evaluation dropped"
            );
            return Err(BrokerError::UnknownEvaluation(evaluation_id));
        };

        lane.leases.lock().await.remove(&result.id);
        lane.results_tx
            .send(result)
            .await
            .map_err(|_| BrokerError::UnknownEvaluation(evaluation_id))
    }
}
