//! State store abstraction.
//!
//! The store is the single source of truth for definitions, executions and
//! named locks. Every engine step re-reads what it needs; state changes go
//! through conditional updates so a stale writer loses instead of clobbering.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::db::models::{
    ActionDefinition, ActionExecution, TaskExecution, WorkflowDefinition, WorkflowExecution,
};
use crate::engine::states::State;
use crate::error::AppResult;

/// Selection of task executions; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskExecutionFilter {
    pub workflow_execution_id: Option<String>,
    pub names: Option<Vec<String>>,
    pub unique_key: Option<String>,
    pub states: Option<Vec<State>>,
    pub processed: Option<bool>,
    pub has_next_tasks: Option<bool>,
    pub error_handled: Option<bool>,
    pub project_id: Option<String>,
}

impl TaskExecutionFilter {
    pub fn for_workflow(workflow_execution_id: impl Into<String>) -> Self {
        Self {
            workflow_execution_id: Some(workflow_execution_id.into()),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.names = Some(vec![name.into()]);
        self
    }

    pub fn names(mut self, names: Vec<String>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    pub fn states(mut self, states: &[State]) -> Self {
        self.states = Some(states.to_vec());
        self
    }

    pub fn processed(mut self, processed: bool) -> Self {
        self.processed = Some(processed);
        self
    }

    pub fn has_next_tasks(mut self, has_next_tasks: bool) -> Self {
        self.has_next_tasks = Some(has_next_tasks);
        self
    }

    pub fn error_handled(mut self, error_handled: bool) -> Self {
        self.error_handled = Some(error_handled);
        self
    }

    pub fn matches(&self, ex: &TaskExecution) -> bool {
        fn check<T: PartialEq>(expected: &Option<T>, actual: &T) -> bool {
            expected.as_ref().map(|e| e == actual).unwrap_or(true)
        }

        check(&self.workflow_execution_id, &ex.workflow_execution_id)
            && self
                .names
                .as_ref()
                .map(|names| names.contains(&ex.name))
                .unwrap_or(true)
            && self
                .unique_key
                .as_ref()
                .map(|key| ex.unique_key.as_ref() == Some(key))
                .unwrap_or(true)
            && self
                .states
                .as_ref()
                .map(|states| states.contains(&ex.state))
                .unwrap_or(true)
            && check(&self.processed, &ex.processed)
            && check(&self.has_next_tasks, &ex.has_next_tasks)
            && check(&self.error_handled, &ex.error_handled)
            && self
                .project_id
                .as_ref()
                .map(|p| ex.project_id.as_ref() == Some(p))
                .unwrap_or(true)
    }
}

/// Partial update of a workflow execution's JSON columns.
#[derive(Debug, Clone, Default)]
pub struct WorkflowExecutionPatch {
    pub output: Option<Value>,
    pub runtime_context: Option<Value>,
    pub context: Option<Value>,
}

/// Persistent storage used by the engine.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- definitions -------------------------------------------------------

    /// Insert or replace the definition with the same name and namespace.
    async fn save_workflow_definition(&self, def: &WorkflowDefinition) -> AppResult<()>;

    async fn find_workflow_definition(
        &self,
        name: &str,
        namespace: &str,
    ) -> AppResult<Option<WorkflowDefinition>>;

    /// Insert or replace the definition with the same name.
    async fn save_action_definition(&self, def: &ActionDefinition) -> AppResult<()>;

    async fn find_action_definition(&self, name: &str) -> AppResult<Option<ActionDefinition>>;

    // ---- workflow executions ----------------------------------------------

    async fn insert_workflow_execution(&self, ex: &WorkflowExecution) -> AppResult<()>;

    async fn get_workflow_execution(&self, id: &str) -> AppResult<Option<WorkflowExecution>>;

    async fn update_workflow_execution(&self, id: &str, patch: WorkflowExecutionPatch) -> AppResult<()>;

    /// Move a workflow from `expected` to `state`; `false` when the
    /// persisted state was not `expected`.
    async fn transition_workflow_state(
        &self,
        id: &str,
        expected: State,
        state: State,
        state_info: Option<&str>,
    ) -> AppResult<bool>;

    /// Sub-workflow executions started by a task execution.
    async fn find_workflow_executions_by_task(
        &self,
        task_execution_id: &str,
    ) -> AppResult<Vec<WorkflowExecution>>;

    // ---- task executions --------------------------------------------------

    /// Insert a task execution; `false` when its unique key is already taken.
    async fn insert_task_execution(&self, ex: &TaskExecution) -> AppResult<bool>;

    async fn get_task_execution(&self, id: &str) -> AppResult<Option<TaskExecution>>;

    /// Matching executions ordered by creation time.
    async fn find_task_executions(&self, filter: &TaskExecutionFilter) -> AppResult<Vec<TaskExecution>>;

    /// Write every mutable column except `state`, `state_info` and `processed`.
    async fn update_task_execution(&self, ex: &TaskExecution) -> AppResult<()>;

    /// Conditional state change; stamps `finished_at` on completion and
    /// `started_at` on the first move to RUNNING.
    async fn transition_task_state(
        &self,
        id: &str,
        expected: State,
        state: State,
        state_info: Option<&str>,
        processed: Option<bool>,
    ) -> AppResult<bool>;

    /// Move a task from `expected` into `ex.state` and write its
    /// `published`, `next_tasks`, `has_next_tasks`, `error_handled` and
    /// `runtime_context` in the same conditional update.
    async fn complete_task_execution(&self, ex: &TaskExecution, expected: State) -> AppResult<bool>;

    // ---- action executions ------------------------------------------------

    async fn insert_action_execution(&self, ex: &ActionExecution) -> AppResult<()>;

    async fn get_action_execution(&self, id: &str) -> AppResult<Option<ActionExecution>>;

    async fn update_action_execution(&self, ex: &ActionExecution) -> AppResult<()>;

    async fn find_action_executions_by_task(
        &self,
        task_execution_id: &str,
    ) -> AppResult<Vec<ActionExecution>>;

    // ---- named locks ------------------------------------------------------

    /// Insert-or-fail; an expired lock is taken over.
    async fn acquire_named_lock(&self, name: &str, ttl: Duration) -> AppResult<bool>;

    async fn release_named_lock(&self, name: &str) -> AppResult<()>;
}

pub(crate) fn lock_expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TaskType;

    #[test]
    fn test_filter_matches() {
        let wf_ex = WorkflowExecution::new("wf", "", serde_json::json!({}));
        let mut task_ex = TaskExecution::new(&wf_ex, "a", TaskType::Action, serde_json::json!({}));
        task_ex.state = State::Error;

        assert!(TaskExecutionFilter::for_workflow(&wf_ex.id).matches(&task_ex));
        assert!(TaskExecutionFilter::for_workflow(&wf_ex.id)
            .states(&State::COMPLETED)
            .error_handled(false)
            .matches(&task_ex));
        assert!(!TaskExecutionFilter::for_workflow(&wf_ex.id)
            .name("b")
            .matches(&task_ex));
        assert!(!TaskExecutionFilter::for_workflow(&wf_ex.id)
            .unique_key("join-task")
            .matches(&task_ex));
        assert!(!TaskExecutionFilter::for_workflow("other").matches(&task_ex));
    }
}
