//! Workflow execution API handlers.
//!
//! Start, inspect, pause, resume and stop workflow executions.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};

use super::exec_context;
use crate::db::models::{TaskExecution, WorkflowExecution};
use crate::engine::states::State as ExecState;
use crate::engine::StartWorkflowRequest;
use crate::error::AppResult;
use crate::state::AppState;

/// Request for stopping an execution.
#[derive(Debug, Clone, Deserialize)]
pub struct StopRequest {
    /// Terminal state: SUCCESS, ERROR or CANCELLED
    #[serde(default = "default_stop_state")]
    pub state: ExecState,

    #[serde(default)]
    pub message: Option<String>,
}

fn default_stop_state() -> ExecState {
    ExecState::Cancelled
}

/// Compact task view for `GET /api/executions/{id}/tasks`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub state: ExecState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_info: Option<String>,
    pub published: serde_json::Value,
    pub processed: bool,
    pub error_handled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<TaskExecution> for TaskSummary {
    fn from(ex: TaskExecution) -> Self {
        Self {
            id: ex.id,
            name: ex.name,
            state: ex.state,
            state_info: ex.state_info,
            published: ex.published,
            processed: ex.processed,
            error_handled: ex.error_handled,
            created_at: ex.created_at,
            finished_at: ex.finished_at,
        }
    }
}

/// Start a workflow.
///
/// `POST /api/executions`
///
/// ```json
/// { "name": "hello", "input": {"who": "world"} }
/// ```
pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartWorkflowRequest>,
) -> AppResult<(StatusCode, Json<WorkflowExecution>)> {
    let ctx = exec_context(&headers);
    let wf_ex = state.engine.start_workflow(&ctx, request).await?;
    Ok((StatusCode::CREATED, Json(wf_ex)))
}

/// Get an execution.
///
/// `GET /api/executions/{id}`
pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<WorkflowExecution>> {
    let ctx = exec_context(&headers);
    Ok(Json(state.engine.get_workflow_execution(&ctx, &id).await?))
}

/// List the task executions of an execution.
///
/// `GET /api/executions/{id}/tasks`
pub async fn tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<TaskSummary>>> {
    let ctx = exec_context(&headers);
    let tasks = state.engine.list_task_executions(&ctx, &id).await?;
    Ok(Json(tasks.into_iter().map(TaskSummary::from).collect()))
}

/// `POST /api/executions/{id}/pause`
pub async fn pause(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<WorkflowExecution>> {
    let ctx = exec_context(&headers);
    state.engine.get_workflow_execution(&ctx, &id).await?;
    Ok(Json(state.engine.pause_workflow(&ctx, &id).await?))
}

/// `POST /api/executions/{id}/resume`
pub async fn resume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<WorkflowExecution>> {
    let ctx = exec_context(&headers);
    state.engine.get_workflow_execution(&ctx, &id).await?;
    Ok(Json(state.engine.resume_workflow(&ctx, &id).await?))
}

/// Stop an execution in a terminal state. Cancelling cascades to running
/// sub-workflows.
///
/// `POST /api/executions/{id}/stop`
///
/// ```json
/// { "state": "CANCELLED", "message": "stopped by operator" }
/// ```
pub async fn stop(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<StopRequest>,
) -> AppResult<Json<WorkflowExecution>> {
    let ctx = exec_context(&headers);
    state.engine.get_workflow_execution(&ctx, &id).await?;
    state
        .engine
        .stop_workflow(ctx.clone(), id.clone(), request.state, request.message)
        .await?;
    Ok(Json(state.engine.get_workflow_execution(&ctx, &id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, EngineConfig};
    use crate::engine::Engine;
    use crate::executor::LocalExecutor;
    use crate::expression::JinjaEvaluator;
    use crate::handlers::{routes, PROJECT_HEADER};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let config = EngineConfig {
            completion_delay_ms: 5,
            ..EngineConfig::default()
        };
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(JinjaEvaluator::new()),
            Arc::new(LocalExecutor::new(tx)),
            config,
        );
        tokio::spawn(engine.clone().run_completion_loop(rx));
        routes(AppState::new(engine, AppConfig::default(), None))
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(PROJECT_HEADER, "p1")
            .body(body.into())
            .unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(PROJECT_HEADER, "p1")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_as(uri: &str, project: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(PROJECT_HEADER, project)
            .body(Body::empty())
            .unwrap()
    }

    const HELLO: &str = r#"
name: hello
input:
  - who
tasks:
  say:
    action: std.echo
    input:
      output: "hello {{ who }}"
    publish:
      greeting: "{{ result }}"
"#;

    #[tokio::test]
    async fn test_register_start_and_inspect() {
        let app = app();

        let (status, def) = call(&app, post("/api/workflows", HELLO)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(def["name"], "hello");

        let (status, wf_ex) = call(
            &app,
            post_json("/api/executions", json!({"name": "hello", "input": {"who": "world"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = wf_ex["id"].as_str().unwrap().to_string();

        let mut wf_ex = Value::Null;
        for _ in 0..200 {
            let (_, body) = call(&app, get_as(&format!("/api/executions/{}", id), "p1")).await;
            if body["state"] == "SUCCESS" {
                wf_ex = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(wf_ex["output"]["greeting"], "hello world");

        let (status, tasks) = call(&app, get_as(&format!("/api/executions/{}/tasks", id), "p1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tasks[0]["name"], "say");
        assert_eq!(tasks[0]["state"], "SUCCESS");

        let (status, _) = call(&app, get_as(&format!("/api/executions/{}", id), "p2")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_with_missing_input_is_unprocessable() {
        let app = app();
        call(&app, post("/api/workflows", HELLO)).await;

        let (status, body) = call(&app, post_json("/api/executions", json!({"name": "hello"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.to_string().contains("missing=[who]"));
    }

    #[tokio::test]
    async fn test_stop_cancels_execution() {
        let app = app();
        call(
            &app,
            post(
                "/api/workflows",
                "name: slow\ntasks:\n  nap:\n    action: std.sleep\n    input:\n      seconds: 5\n",
            ),
        )
        .await;
        let (_, wf_ex) = call(&app, post_json("/api/executions", json!({"name": "slow"}))).await;
        let id = wf_ex["id"].as_str().unwrap();

        let (status, body) = call(
            &app,
            post_json(
                &format!("/api/executions/{}/stop", id),
                json!({"message": "stopped by test"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "CANCELLED");
        assert_eq!(body["output"]["result"], "stopped by test");

        let (status, _) = call(&app, post(&format!("/api/executions/{}/pause", id), "")).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_complete_unknown_action_is_not_found() {
        let app = app();
        let (status, _) = call(
            &app,
            post_json("/api/actions/missing/complete", json!({"data": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_definition_body_is_rejected() {
        let app = app();
        let (status, _) = call(&app, post("/api/workflows", "  ")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
