//! HTTP handlers for the NoETL Workflow Engine API.
//!
//! Handlers are thin: they build an [`ExecContext`] from the request headers
//! and call into the engine.

pub mod actions;
pub mod definitions;
pub mod executions;
pub mod health;

pub use health::{api_health, health_check};

use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;

use crate::context::ExecContext;
use crate::state::AppState;

pub const PROJECT_HEADER: &str = "x-project-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const USER_HEADER: &str = "x-user";
pub const ADMIN_HEADER: &str = "x-admin";

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Execution context of an HTTP request.
pub fn exec_context(headers: &HeaderMap) -> ExecContext {
    ExecContext {
        project_id: header(headers, PROJECT_HEADER),
        is_admin: header(headers, ADMIN_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("true")),
        request_id: header(headers, REQUEST_ID_HEADER)
            .or_else(|| Some(uuid::Uuid::new_v4().to_string())),
        user: header(headers, USER_HEADER),
    }
}

/// All API routes, without middleware layers.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/health", get(api_health))
        .route("/api/workflows", post(definitions::register_workflow))
        .route("/api/actions", post(definitions::register_action))
        .route("/api/actions/{id}/complete", post(actions::complete))
        .route("/api/executions", post(executions::start))
        .route("/api/executions/{id}", get(executions::get))
        .route("/api/executions/{id}/tasks", get(executions::tasks))
        .route("/api/executions/{id}/pause", post(executions::pause))
        .route("/api/executions/{id}/resume", post(executions::resume))
        .route("/api/executions/{id}/stop", post(executions::stop))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_exec_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(PROJECT_HEADER, HeaderValue::from_static("p1"));
        headers.insert(ADMIN_HEADER, HeaderValue::from_static("TRUE"));
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-1"));

        let ctx = exec_context(&headers);
        assert_eq!(ctx.project_id.as_deref(), Some("p1"));
        assert!(ctx.is_admin);
        assert_eq!(ctx.request_id.as_deref(), Some("req-1"));
        assert_eq!(ctx.user, None);
    }

    #[test]
    fn test_exec_context_generates_request_id() {
        let ctx = exec_context(&HeaderMap::new());
        assert_eq!(ctx.project_id, None);
        assert!(!ctx.is_admin);
        assert!(ctx.request_id.is_some());
    }
}
