//! Orchestrator settings.
//!
//! Defaults come from serde, overrides from the environment (a `.env` file
//! is loaded first when present).

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::Operator;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Capacity of each evaluation's task queue.
    #[serde(default = "default_capacity")]
    pub task_queue_capacity: usize,
    /// Capacity of each evaluation's result channel.
    #[serde(default = "default_capacity")]
    pub result_channel_capacity: usize,
    /// A dequeued task with no result after this long is considered lost.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_ms: u64,
    /// Dispatches allowed per node before the evaluation fails.
    #[serde(default = "default_max_attempts")]
    pub max_task_attempts: u32,
    /// Evaluations allowed in `Running` at once; the rest wait.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_evaluations: usize,
    #[serde(default = "default_operation_time")]
    pub time_addition_ms: u64,
    #[serde(default = "default_operation_time")]
    pub time_subtraction_ms: u64,
    #[serde(default = "default_operation_time")]
    pub time_multiplication_ms: u64,
    #[serde(default = "default_operation_time")]
    pub time_division_ms: u64,
    /// Number of in-process workers. 0 = rely on remote workers only.
    #[serde(default = "default_computing_power")]
    pub computing_power: usize,
    /// Idle poll interval of in-process workers.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_http_addr() -> String { "127.0.0.1:8080".to_string() }
fn default_capacity() -> usize { 64 }
fn default_task_timeout() -> u64 { 10_000 }
fn default_max_attempts() -> u32 { 3 }
fn default_max_concurrent() -> usize { 16 }
fn default_operation_time() -> u64 { 100 }
fn default_computing_power() -> usize { 4 }
fn default_poll_interval() -> u64 { 50 }

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            task_queue_capacity: default_capacity(),
            result_channel_capacity: default_capacity(),
            task_timeout_ms: default_task_timeout(),
            max_task_attempts: default_max_attempts(),
            max_concurrent_evaluations: default_max_concurrent(),
            time_addition_ms: default_operation_time(),
            time_subtraction_ms: default_operation_time(),
            time_multiplication_ms: default_operation_time(),
            time_division_ms: default_operation_time(),
            computing_power: default_computing_power(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl OrchestratorConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    ///
    /// Operation times and worker count use the names remote agents read
    /// (`TIME_ADDITION_MS`, `COMPUTING_POWER`, ...); the rest are `CALC_*`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            http_addr: env_opt("CALC_HTTP_ADDR").unwrap_or(d.http_addr),
            task_queue_capacity: env_parse("CALC_TASK_QUEUE_CAPACITY", d.task_queue_capacity),
            result_channel_capacity: env_parse(
                "CALC_RESULT_CHANNEL_CAPACITY",
                d.result_channel_capacity,
            ),
            task_timeout_ms: env_parse("CALC_TASK_TIMEOUT_MS", d.task_timeout_ms),
            max_task_attempts: env_parse("CALC_MAX_TASK_ATTEMPTS", d.max_task_attempts),
            max_concurrent_evaluations: env_parse(
                "CALC_MAX_CONCURRENT_EVALUATIONS",
                d.max_concurrent_evaluations,
            ),
            time_addition_ms: env_parse("TIME_ADDITION_MS", d.time_addition_ms),
            time_subtraction_ms: env_parse("TIME_SUBTRACTION_MS", d.time_subtraction_ms),
            time_multiplication_ms: env_parse("TIME_MULTIPLICATIONS_MS", d.time_multiplication_ms),
            time_division_ms: env_parse("TIME_DIVISIONS_MS", d.time_division_ms),
            computing_power: env_parse("COMPUTING_POWER", d.computing_power),
            poll_interval_ms: env_parse("CALC_POLL_INTERVAL_MS", d.poll_interval_ms),
        }
    }

    pub fn operation_time(&self, op: Operator) -> u64 {
        match op {
            Operator::Add => self.time_addition_ms,
            Operator::Sub => self.time_subtraction_ms,
            Operator::Mul => self.time_multiplication_ms,
            Operator::Div => self.time_division_ms,
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// How often the controller wakes without results to check leases and
    /// re-offer pending tasks.
    pub fn controller_tick(&self) -> Duration {
        self.task_timeout().min(Duration::from_millis(100))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Zero capacities would make every offer fail; clamp them.
    pub fn normalized(mut self) -> Self {
        self.task_queue_capacity = self.task_queue_capacity.max(1);
        self.result_channel_capacity = self.result_channel_capacity.max(1);
        self.max_task_attempts = self.max_task_attempts.max(1);
        self.max_concurrent_evaluations = self.max_concurrent_evaluations.max(1);
        self
    }
}
