//! Action completion endpoint used by remote workers.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};

use super::exec_context;
use crate::error::{AppError, AppResult};
use crate::executor::{ActionCompletion, ActionResult};
use crate::state::AppState;

/// Body of `POST /api/actions/{id}/complete`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteActionRequest {
    #[serde(flatten)]
    pub result: ActionResult,

    #[serde(default)]
    pub is_workflow_action: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompleteActionResponse {
    pub action_execution_id: String,
    pub accepted: bool,
}

/// Report the result of an action execution.
///
/// `POST /api/actions/{id}/complete`
///
/// ```json
/// { "data": {"rows": 3}, "error": null, "cancel": false }
/// ```
///
/// The completion is handled asynchronously; `202 Accepted` only means the
/// action execution exists.
pub async fn complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<CompleteActionRequest>,
) -> AppResult<(StatusCode, Json<CompleteActionResponse>)> {
    let ctx = exec_context(&headers);

    if !request.is_workflow_action
        && state.engine.store().get_action_execution(&id).await?.is_none()
    {
        return Err(AppError::NotFound(format!("action execution {}", id)));
    }

    let completion = ActionCompletion {
        action_execution_id: id.clone(),
        result: request.result,
        is_workflow_action: request.is_workflow_action,
    };
    state.engine.submit_completion(ctx, completion);

    Ok((
        StatusCode::ACCEPTED,
        Json(CompleteActionResponse {
            action_execution_id: id,
            accepted: true,
        }),
    ))
}
