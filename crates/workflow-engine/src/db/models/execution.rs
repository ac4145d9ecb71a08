//! Execution records: workflow, task and action executions.
//!
//! JSON columns are kept as `serde_json::Value` objects; the engine reads and
//! writes individual keys through the accessors below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

use crate::engine::states::{State, TransitionEvent, TriggeredBy};
use crate::error::AppError;

/// Runtime-context key holding parked dispatch requests of a paused workflow.
pub const BACKLOG_COMMANDS: &str = "backlog_commands";

/// Kind of work a task execution performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Action,
    Workflow,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Action => write!(f, "ACTION"),
            Self::Workflow => write!(f, "WORKFLOW"),
        }
    }
}

impl TryFrom<String> for TaskType {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "ACTION" => Ok(Self::Action),
            "WORKFLOW" => Ok(Self::Workflow),
            other => Err(AppError::Parse(format!("unknown task type '{}'", other))),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Read a key of a JSON object column.
pub(crate) fn json_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.as_object().and_then(|m| m.get(key))
}

/// Write a key of a JSON object column, turning non-objects into objects.
pub(crate) fn json_set(value: &mut Value, key: &str, item: Value) {
    if !value.is_object() {
        *value = empty_object();
    }
    if let Value::Object(map) = value {
        map.insert(key.to_string(), item);
    }
}

/// A single run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowExecution {
    pub id: String,
    pub name: String,
    pub workflow_id: Option<String>,
    pub namespace: String,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub state: State,
    pub state_info: Option<String>,
    pub input: Value,
    pub output: Value,
    pub params: Value,
    pub runtime_context: Value,
    pub context: Value,
    pub spec: Value,
    pub tags: Vec<String>,
    /// Parent task execution when this is a sub-workflow.
    pub task_execution_id: Option<String>,
    pub root_execution_id: Option<String>,
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            workflow_id: None,
            namespace: namespace.into(),
            description: None,
            state: State::Idle,
            state_info: None,
            input: empty_object(),
            output: empty_object(),
            params: empty_object(),
            runtime_context: empty_object(),
            context: empty_object(),
            spec,
            tags: Vec::new(),
            task_execution_id: None,
            root_execution_id: None,
            project_id: None,
            created_at: Utc::now(),
            updated_at: None,
            finished_at: None,
        }
    }

    /// `params.env`, exposed to expressions as `__env`.
    pub fn env(&self) -> Value {
        json_get(&self.params, "env").cloned().unwrap_or_else(empty_object)
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        json_get(&self.params, key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    pub fn backlog(&self) -> Vec<Value> {
        json_get(&self.runtime_context, BACKLOG_COMMANDS)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

/// A single run of a task within a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskExecution {
    pub id: String,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub task_type: TaskType,
    pub workflow_execution_id: String,
    pub workflow_name: String,
    pub workflow_id: Option<String>,
    pub project_id: Option<String>,
    pub spec: Value,
    #[sqlx(try_from = "String")]
    pub state: State,
    pub state_info: Option<String>,
    pub published: Value,
    pub processed: bool,
    /// Ordered `[task name, event]` pairs recorded at completion.
    #[sqlx(json)]
    pub next_tasks: Vec<(String, TransitionEvent)>,
    pub has_next_tasks: bool,
    pub error_handled: bool,
    pub unique_key: Option<String>,
    pub runtime_context: Value,
    pub in_context: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskExecution {
    pub fn new(wf_ex: &WorkflowExecution, name: impl Into<String>, task_type: TaskType, spec: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            task_type,
            workflow_execution_id: wf_ex.id.clone(),
            workflow_name: wf_ex.name.clone(),
            workflow_id: wf_ex.workflow_id.clone(),
            project_id: wf_ex.project_id.clone(),
            spec,
            state: State::Idle,
            state_info: None,
            published: empty_object(),
            processed: false,
            next_tasks: Vec::new(),
            has_next_tasks: false,
            error_handled: false,
            unique_key: None,
            runtime_context: empty_object(),
            in_context: empty_object(),
            created_at: Utc::now(),
            started_at: None,
            updated_at: None,
            finished_at: None,
        }
    }

    pub fn triggered_by(&self) -> Vec<TriggeredBy> {
        json_get(&self.runtime_context, "triggered_by")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_triggered_by(&mut self, triggered_by: &[TriggeredBy]) {
        let value = serde_json::to_value(triggered_by).unwrap_or(Value::Null);
        json_set(&mut self.runtime_context, "triggered_by", value);
    }

    /// `true` when this completed execution fired a transition to `name`.
    pub fn has_next_task(&self, name: &str) -> bool {
        self.next_tasks.iter().any(|(n, _)| n == name)
    }

    pub fn next_task_event(&self, name: &str) -> Option<TransitionEvent> {
        self.next_tasks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, event)| *event)
    }
}

/// A single run of an action on behalf of a task execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActionExecution {
    pub id: String,
    pub name: String,
    pub spec: Value,
    pub task_execution_id: Option<String>,
    pub workflow_execution_id: Option<String>,
    pub workflow_name: Option<String>,
    pub project_id: Option<String>,
    pub inputs: Value,
    pub outputs: Value,
    #[sqlx(try_from = "String")]
    pub state: State,
    pub state_info: Option<String>,
    pub runtime_context: Value,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ActionExecution {
    pub fn new(name: impl Into<String>, task_ex: &TaskExecution, inputs: Value, index: usize) -> Self {
        let mut runtime_context = empty_object();
        json_set(&mut runtime_context, "index", Value::from(index));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            spec: empty_object(),
            task_execution_id: Some(task_ex.id.clone()),
            workflow_execution_id: Some(task_ex.workflow_execution_id.clone()),
            workflow_name: Some(task_ex.workflow_name.clone()),
            project_id: task_ex.project_id.clone(),
            inputs,
            outputs: empty_object(),
            state: State::Running,
            state_info: None,
            runtime_context,
            last_heartbeat: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: None,
            finished_at: None,
        }
    }

    /// Position of this action within a with-items task.
    pub fn index(&self) -> usize {
        json_get(&self.runtime_context, "index")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize
    }

    /// Name of the ad-hoc definition this action was built from, if any.
    pub fn ad_hoc_action_name(&self) -> Option<&str> {
        json_get(&self.runtime_context, "adhoc_action_name").and_then(Value::as_str)
    }

    pub fn result(&self) -> Value {
        json_get(&self.outputs, "result").cloned().unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triggered_by_round_trip() {
        let wf_ex = WorkflowExecution::new("wf", "", serde_json::json!({}));
        let mut task_ex = TaskExecution::new(&wf_ex, "b", TaskType::Action, serde_json::json!({}));
        task_ex.set_triggered_by(&[TriggeredBy {
            task_id: "t1".to_string(),
            event: TransitionEvent::OnSuccess,
        }]);
        let triggered = task_ex.triggered_by();
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].event, TransitionEvent::OnSuccess);
    }

    #[test]
    fn test_workflow_env_defaults_to_empty() {
        let mut wf_ex = WorkflowExecution::new("wf", "", serde_json::json!({}));
        assert_eq!(wf_ex.env(), serde_json::json!({}));
        json_set(&mut wf_ex.params, "env", serde_json::json!({"stage": "dev"}));
        assert_eq!(wf_ex.env()["stage"], "dev");
    }

    #[test]
    fn test_action_index() {
        let wf_ex = WorkflowExecution::new("wf", "", serde_json::json!({}));
        let task_ex = TaskExecution::new(&wf_ex, "a", TaskType::Action, serde_json::json!({}));
        let action_ex = ActionExecution::new("std.echo", &task_ex, serde_json::json!({}), 3);
        assert_eq!(action_ex.index(), 3);
        assert_eq!(action_ex.state, State::Running);
    }
}
