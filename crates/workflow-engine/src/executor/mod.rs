//! Action executors.
//!
//! The engine hands every scheduled action to an [`ActionExecutor`] and
//! forgets about it. The outcome comes back later as an [`ActionCompletion`],
//! either on the engine's completion channel or through the HTTP API.

mod local;
mod nats;

pub use local::{LocalExecutor, Plugin};
pub use nats::NatsExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::states::State;
use crate::error::AppResult;

/// Work handed to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_execution_id: String,
    /// Executable plugin name.
    pub action_name: String,
    pub input: Value,
    /// Attributes of the stored action definition.
    #[serde(default)]
    pub attributes: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// Outcome of an action run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cancel: bool,
}

impl ActionResult {
    pub fn success(data: Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancel: true,
            ..Self::default()
        }
    }

    pub fn is_cancel(&self) -> bool {
        self.cancel
    }

    pub fn is_error(&self) -> bool {
        !self.cancel && self.error.is_some()
    }

    pub fn is_success(&self) -> bool {
        !self.cancel && self.error.is_none()
    }

    /// Execution state this result moves an action to.
    pub fn state(&self) -> State {
        if self.is_cancel() {
            State::Cancelled
        } else if self.is_error() {
            State::Error
        } else {
            State::Success
        }
    }
}

/// Completion notification routed back into the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCompletion {
    pub action_execution_id: String,
    pub result: ActionResult,
    /// Set when the "action" was a sub-workflow reporting to its parent task.
    #[serde(default)]
    pub is_workflow_action: bool,
}

impl ActionCompletion {
    pub fn new(action_execution_id: impl Into<String>, result: ActionResult) -> Self {
        Self {
            action_execution_id: action_execution_id.into(),
            result,
            is_workflow_action: false,
        }
    }
}

/// Runs actions asynchronously.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Start the action; must not wait for it to finish.
    async fn run_action(&self, request: ActionRequest) -> AppResult<()>;

    /// Whether this executor can run `action_name` without a stored definition.
    fn supports(&self, action_name: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_state() {
        assert_eq!(ActionResult::success(json!(1)).state(), State::Success);
        assert_eq!(ActionResult::failure("boom").state(), State::Error);
        assert_eq!(ActionResult::cancelled().state(), State::Cancelled);
    }

    #[test]
    fn test_cancel_wins_over_error() {
        let result = ActionResult {
            data: Value::Null,
            error: Some("boom".to_string()),
            cancel: true,
        };
        assert!(result.is_cancel());
        assert!(!result.is_error());
        assert_eq!(result.state(), State::Cancelled);
    }

    #[test]
    fn test_completion_deserializes_with_defaults() {
        let completion: ActionCompletion = serde_json::from_value(json!({
            "action_execution_id": "a-1",
            "result": {"data": {"rows": 3}}
        }))
        .unwrap();
        assert!(!completion.is_workflow_action);
        assert!(completion.result.is_success());
        assert_eq!(completion.result.data["rows"], 3);
    }
}
