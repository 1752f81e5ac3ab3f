//! Expression store.
//!
//! Persists one record per submitted expression. A record starts `pending`
//! and receives exactly one terminal update.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::controller::EvaluationOutcome;
use crate::error::StoreError;

pub type ExpressionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpressionStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "zero division error")]
    ZeroDivisionError,
    #[serde(rename = "error")]
    Error,
}

impl ExpressionStatus {
    pub fn is_terminal(self) -> bool {
        self != ExpressionStatus::Pending
    }

    /// Status and persisted value for a finished evaluation.
    pub fn from_outcome(outcome: &EvaluationOutcome) -> (Self, Option<f64>) {
        match outcome {
            EvaluationOutcome::Value(v) => (ExpressionStatus::Done, Some(*v)),
            EvaluationOutcome::Failed(err) if err.is_arithmetic() => {
                (ExpressionStatus::ZeroDivisionError, None)
            }
            EvaluationOutcome::Failed(_) | EvaluationOutcome::Aborted => {
                (ExpressionStatus::Error, None)
            }
        }
    }
}

impl fmt::Display for ExpressionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExpressionStatus::Pending => "pending",
            ExpressionStatus::Done => "done",
            ExpressionStatus::ZeroDivisionError => "zero division error",
            ExpressionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionRecord {
    pub id: ExpressionId,
    pub expression: String,
    pub status: ExpressionStatus,
    /// Present only when `status` is `done`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<f64>,
}

/// Storage backend for expression records.
#[async_trait]
pub trait ExpressionStore: Send + Sync {
    /// Creates a `pending` record and returns its id.
    async fn insert(&self, expression: &str) -> ExpressionId;

    /// Writes the terminal status. Fails if the record is already terminal.
    async fn update(
        &self,
        id: ExpressionId,
        value: Option<f64>,
        status: ExpressionStatus,
    ) -> Result<(), StoreError>;

    async fn get(&self, id: ExpressionId) -> Option<ExpressionRecord>;

    /// All records ordered by id.
    async fn list(&self) -> Vec<ExpressionRecord>;
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<ExpressionId, ExpressionRecord>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExpressionStore for MemoryStore {
    async fn insert(&self, expression: &str) -> ExpressionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = ExpressionRecord {
            id,
            expression: expression.to_string(),
            status: ExpressionStatus::Pending,
            result: None,
        };
        self.records.write().await.insert(id, record);
        id
    }

    async fn update(
        &self,
        id: ExpressionId,
        value: Option<f64>,
        status: ExpressionStatus,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.status.is_terminal() {
            return Err(StoreError::AlreadyFinal(id));
        }
        record.status = status;
        record.result = if status == ExpressionStatus::Done {
            value
        } else {
            None
        };
        Ok(())
    }

    async fn get(&self, id: ExpressionId) -> Option<ExpressionRecord> {
        self.records.read().await.get(&id).cloned()
    }

    async fn list(&self) -> Vec<ExpressionRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvalError;

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let store = MemoryStore::new();
        assert_eq!(store.insert("1+1").await, 1);
        assert_eq!(store.insert("2+2").await, 2);

        let record = store.get(1).await.unwrap();
        assert_eq!(record.status, ExpressionStatus::Pending);
        assert_eq!(record.result, None);
        assert_eq!(store.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_update_happens_once() {
        let store = MemoryStore::new();
        let id = store.insert("2*2").await;

        store.update(id, Some(4.0), ExpressionStatus::Done).await.unwrap();
        let err = store
            .update(id, None, ExpressionStatus::Error)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyFinal(_)));

        // Repeated reads are stable.
        let first = store.get(id).await.unwrap();
        let second = store.get(id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.result, Some(4.0));
    }

    #[tokio::test]
    async fn test_value_dropped_for_error_statuses() {
        let store = MemoryStore::new();
        let id = store.insert("1/0").await;
        store
            .update(id, Some(0.0), ExpressionStatus::ZeroDivisionError)
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().result, None);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = MemoryStore::new();
        let err = store
            .update(5, Some(1.0), ExpressionStatus::Done)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(5)));
    }

    #[test]
    fn test_status_from_outcome() {
        assert_eq!(
            ExpressionStatus::from_outcome(&EvaluationOutcome::Value(3.0)),
            (ExpressionStatus::Done, Some(3.0))
        );
        assert_eq!(
            ExpressionStatus::from_outcome(&EvaluationOutcome::Failed(
                EvalError::DivisionByZero { node: 0 }
            )),
            (ExpressionStatus::ZeroDivisionError, None)
        );
        assert_eq!(
            ExpressionStatus::from_outcome(&EvaluationOutcome::Failed(EvalError::ChannelClosed)),
            (ExpressionStatus::Error, None)
        );
        assert_eq!(
            ExpressionStatus::from_outcome(&EvaluationOutcome::Aborted),
            (ExpressionStatus::Error, None)
        );
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&ExpressionStatus::ZeroDivisionError).unwrap();
        assert_eq!(json, "\"zero division error\"");
        assert_eq!(ExpressionStatus::Done.to_string(), "done");
    }
}
