//! Definition registration handlers.
//!
//! Bodies are YAML or JSON; JSON is accepted by the YAML parser as is.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;

use super::exec_context;
use crate::db::models::{ActionDefinition, WorkflowDefinition};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterWorkflowQuery {
    #[serde(default)]
    pub namespace: String,
}

fn non_empty(body: String) -> AppResult<String> {
    if body.trim().is_empty() {
        return Err(AppError::BadRequest("request body must not be empty".to_string()));
    }
    Ok(body)
}

/// Register or replace a workflow definition.
///
/// `POST /api/workflows?namespace=<ns>`
///
/// ```yaml
/// name: hello
/// tasks:
///   say:
///     action: std.echo output="hi"
/// ```
pub async fn register_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RegisterWorkflowQuery>,
    body: String,
) -> AppResult<(StatusCode, Json<WorkflowDefinition>)> {
    let ctx = exec_context(&headers);
    let source = non_empty(body)?;
    let def = state
        .engine
        .register_workflow(&ctx, &source, &query.namespace)
        .await?;
    Ok((StatusCode::CREATED, Json(def)))
}

/// Register or replace an ad-hoc action definition.
///
/// `POST /api/actions`
pub async fn register_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> AppResult<(StatusCode, Json<ActionDefinition>)> {
    let ctx = exec_context(&headers);
    let source = non_empty(body)?;
    let def = state.engine.register_action(&ctx, &source).await?;
    Ok((StatusCode::CREATED, Json(def)))
}
