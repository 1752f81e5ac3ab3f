//! HTTP surface: the client API and the worker-facing task endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::orchestrator::Orchestrator;
use crate::store::{ExpressionId, ExpressionRecord};
use crate::task::{Task, TaskResult};

#[derive(Debug, Deserialize)]
pub struct CalculateRequest {
    pub expression: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CalculateResponse {
    pub id: ExpressionId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpressionList {
    pub expressions: Vec<ExpressionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpressionEnvelope {
    pub expression: ExpressionRecord,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: Task,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Build the router with all routes and request tracing.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/calculate", post(calculate))
        .route("/api/v1/expressions", get(list_expressions))
        .route("/api/v1/expressions/{id}", get(get_expression))
        .route("/internal/task", get(next_task).post(submit_result))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn calculate(
    State(orchestrator): State<Orchestrator>,
    body: Result<Json<CalculateRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(rejection.status(), rejection.body_text()),
    };

    match orchestrator.submit(&request.expression).await {
        Ok(id) => (StatusCode::CREATED, Json(CalculateResponse { id })).into_response(),
        Err(err) => {
            warn!(expression = %request.expression, error = %err, "expression rejected");
            error_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
    }
}

async fn list_expressions(State(orchestrator): State<Orchestrator>) -> Json<ExpressionList> {
    Json(ExpressionList {
        expressions: orchestrator.store().list().await,
    })
}

async fn get_expression(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<ExpressionId>,
) -> Response {
    match orchestrator.store().get(id).await {
        Some(expression) => Json(ExpressionEnvelope { expression }).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("expression {} not found", id)),
    }
}

async fn next_task(State(orchestrator): State<Orchestrator>) -> Response {
    match orchestrator.broker().next_task().await {
        Some(task) => Json(TaskEnvelope { task }).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Malformed bodies are rejected without reaching the controller; the task's
/// lease then expires and it is retried.
async fn submit_result(
    State(orchestrator): State<Orchestrator>,
    body: Result<Json<TaskResult>, JsonRejection>,
) -> Response {
    let Json(result) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "malformed task result");
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text());
        }
    };

    match orchestrator.broker().submit_result(result).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err.to_string()),
    }
}
