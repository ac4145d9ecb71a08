//! In-process store for development and tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::db::models::{
    ActionDefinition, ActionExecution, NamedLock, TaskExecution, WorkflowDefinition, WorkflowExecution,
};
use crate::engine::states::State;
use crate::error::{AppError, AppResult};
use crate::store::{lock_expiry, Store, TaskExecutionFilter, WorkflowExecutionPatch};

#[derive(Default)]
struct Inner {
    workflow_definitions: HashMap<(String, String), WorkflowDefinition>,
    action_definitions: HashMap<String, ActionDefinition>,
    workflow_executions: HashMap<String, WorkflowExecution>,
    task_executions: HashMap<String, TaskExecution>,
    /// Insertion order of task executions.
    task_order: Vec<String>,
    action_executions: HashMap<String, ActionExecution>,
    action_order: Vec<String>,
    locks: HashMap<String, NamedLock>,
}

/// Store keeping everything in memory behind a single `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_workflow_definition(&self, def: &WorkflowDefinition) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .workflow_definitions
            .insert((def.name.clone(), def.namespace.clone()), def.clone());
        Ok(())
    }

    async fn find_workflow_definition(
        &self,
        name: &str,
        namespace: &str,
    ) -> AppResult<Option<WorkflowDefinition>> {
        let inner = self.inner.read().await;
        Ok(inner
            .workflow_definitions
            .get(&(name.to_string(), namespace.to_string()))
            .cloned())
    }

    async fn save_action_definition(&self, def: &ActionDefinition) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.action_definitions.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn find_action_definition(&self, name: &str) -> AppResult<Option<ActionDefinition>> {
        let inner = self.inner.read().await;
        Ok(inner.action_definitions.get(name).cloned())
    }

    async fn insert_workflow_execution(&self, ex: &WorkflowExecution) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        if inner.workflow_executions.contains_key(&ex.id) {
            return Err(AppError::Conflict(format!("workflow execution {} exists", ex.id)));
        }
        inner.workflow_executions.insert(ex.id.clone(), ex.clone());
        Ok(())
    }

    async fn get_workflow_execution(&self, id: &str) -> AppResult<Option<WorkflowExecution>> {
        let inner = self.inner.read().await;
        Ok(inner.workflow_executions.get(id).cloned())
    }

    async fn update_workflow_execution(&self, id: &str, patch: WorkflowExecutionPatch) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let ex = inner
            .workflow_executions
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("workflow execution {}", id)))?;
        if let Some(output) = patch.output {
            ex.output = output;
        }
        if let Some(runtime_context) = patch.runtime_context {
            ex.runtime_context = runtime_context;
        }
        if let Some(context) = patch.context {
            ex.context = context;
        }
        ex.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn transition_workflow_state(
        &self,
        id: &str,
        expected: State,
        state: State,
        state_info: Option<&str>,
    ) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        let ex = inner
            .workflow_executions
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("workflow execution {}", id)))?;
        if ex.state != expected {
            return Ok(false);
        }
        ex.state = state;
        ex.state_info = state_info.map(str::to_string);
        ex.updated_at = Some(Utc::now());
        if state.is_completed() {
            ex.finished_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn find_workflow_executions_by_task(
        &self,
        task_execution_id: &str,
    ) -> AppResult<Vec<WorkflowExecution>> {
        let inner = self.inner.read().await;
        let mut found: Vec<WorkflowExecution> = inner
            .workflow_executions
            .values()
            .filter(|ex| ex.task_execution_id.as_deref() == Some(task_execution_id))
            .cloned()
            .collect();
        found.sort_by_key(|ex| ex.created_at);
        Ok(found)
    }

    async fn insert_task_execution(&self, ex: &TaskExecution) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        if let Some(key) = &ex.unique_key {
            let taken = inner.task_executions.values().any(|other| {
                other.workflow_execution_id == ex.workflow_execution_id
                    && other.unique_key.as_ref() == Some(key)
            });
            if taken {
                return Ok(false);
            }
        }
        inner.task_order.push(ex.id.clone());
        inner.task_executions.insert(ex.id.clone(), ex.clone());
        Ok(true)
    }

    async fn get_task_execution(&self, id: &str) -> AppResult<Option<TaskExecution>> {
        let inner = self.inner.read().await;
        Ok(inner.task_executions.get(id).cloned())
    }

    async fn find_task_executions(&self, filter: &TaskExecutionFilter) -> AppResult<Vec<TaskExecution>> {
        let inner = self.inner.read().await;
        Ok(inner
            .task_order
            .iter()
            .filter_map(|id| inner.task_executions.get(id))
            .filter(|ex| filter.matches(ex))
            .cloned()
            .collect())
    }

    async fn update_task_execution(&self, ex: &TaskExecution) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .task_executions
            .get_mut(&ex.id)
            .ok_or_else(|| AppError::NotFound(format!("task execution {}", ex.id)))?;
        stored.published = ex.published.clone();
        stored.next_tasks = ex.next_tasks.clone();
        stored.has_next_tasks = ex.has_next_tasks;
        stored.error_handled = ex.error_handled;
        stored.runtime_context = ex.runtime_context.clone();
        stored.in_context = ex.in_context.clone();
        stored.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn transition_task_state(
        &self,
        id: &str,
        expected: State,
        state: State,
        state_info: Option<&str>,
        processed: Option<bool>,
    ) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        let ex = inner
            .task_executions
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("task execution {}", id)))?;
        if ex.state != expected {
            return Ok(false);
        }
        let now = Utc::now();
        ex.state = state;
        ex.state_info = state_info.map(str::to_string);
        if let Some(processed) = processed {
            ex.processed = processed;
        }
        if state == State::Running && ex.started_at.is_none() {
            ex.started_at = Some(now);
        }
        if state.is_completed() {
            ex.finished_at = Some(now);
        }
        ex.updated_at = Some(now);
        Ok(true)
    }

    async fn complete_task_execution(&self, ex: &TaskExecution, expected: State) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .task_executions
            .get_mut(&ex.id)
            .ok_or_else(|| AppError::NotFound(format!("task execution {}", ex.id)))?;
        if stored.state != expected {
            return Ok(false);
        }
        let now = Utc::now();
        stored.state = ex.state;
        stored.state_info = ex.state_info.clone();
        stored.published = ex.published.clone();
        stored.next_tasks = ex.next_tasks.clone();
        stored.has_next_tasks = ex.has_next_tasks;
        stored.error_handled = ex.error_handled;
        stored.runtime_context = ex.runtime_context.clone();
        stored.finished_at = Some(now);
        stored.updated_at = Some(now);
        Ok(true)
    }

    async fn insert_action_execution(&self, ex: &ActionExecution) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.action_order.push(ex.id.clone());
        inner.action_executions.insert(ex.id.clone(), ex.clone());
        Ok(())
    }

    async fn get_action_execution(&self, id: &str) -> AppResult<Option<ActionExecution>> {
        let inner = self.inner.read().await;
        Ok(inner.action_executions.get(id).cloned())
    }

    async fn update_action_execution(&self, ex: &ActionExecution) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .action_executions
            .get_mut(&ex.id)
            .ok_or_else(|| AppError::NotFound(format!("action execution {}", ex.id)))?;
        *stored = ex.clone();
        stored.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn find_action_executions_by_task(
        &self,
        task_execution_id: &str,
    ) -> AppResult<Vec<ActionExecution>> {
        let inner = self.inner.read().await;
        Ok(inner
            .action_order
            .iter()
            .filter_map(|id| inner.action_executions.get(id))
            .filter(|ex| ex.task_execution_id.as_deref() == Some(task_execution_id))
            .cloned()
            .collect())
    }

    async fn acquire_named_lock(&self, name: &str, ttl: Duration) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        match inner.locks.get(name) {
            Some(lock) if !lock.is_expired(now) => Ok(false),
            _ => {
                let lock = NamedLock {
                    name: name.to_string(),
                    expires_at: lock_expiry(ttl),
                    created_at: now,
                };
                inner.locks.insert(name.to_string(), lock);
                Ok(true)
            }
        }
    }

    async fn release_named_lock(&self, name: &str) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.locks.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TaskType;
    use crate::engine::states::TransitionEvent;
    use serde_json::json;

    #[tokio::test]
    async fn test_unique_key_conflict() {
        let store = MemoryStore::new();
        let wf_ex = WorkflowExecution::new("wf", "", json!({}));
        store.insert_workflow_execution(&wf_ex).await.unwrap();

        let mut first = TaskExecution::new(&wf_ex, "join", TaskType::Action, json!({}));
        first.unique_key = Some("join-task-x".to_string());
        let mut second = first.clone();
        second.id = "other".to_string();

        assert!(store.insert_task_execution(&first).await.unwrap());
        assert!(!store.insert_task_execution(&second).await.unwrap());
    }

    #[tokio::test]
    async fn test_conditional_task_transition() {
        let store = MemoryStore::new();
        let wf_ex = WorkflowExecution::new("wf", "", json!({}));
        let task_ex = TaskExecution::new(&wf_ex, "a", TaskType::Action, json!({}));
        store.insert_task_execution(&task_ex).await.unwrap();

        assert!(store
            .transition_task_state(&task_ex.id, State::Idle, State::Running, None, None)
            .await
            .unwrap());
        assert!(!store
            .transition_task_state(&task_ex.id, State::Idle, State::Error, Some("late"), None)
            .await
            .unwrap());
        assert!(store
            .transition_task_state(&task_ex.id, State::Running, State::Success, None, Some(true))
            .await
            .unwrap());

        let stored = store.get_task_execution(&task_ex.id).await.unwrap().unwrap();
        assert_eq!(stored.state, State::Success);
        assert!(stored.processed);
        assert!(stored.started_at.is_some());
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_completion_writes_state_and_next_tasks_together() {
        let store = MemoryStore::new();
        let wf_ex = WorkflowExecution::new("wf", "", json!({}));
        let mut task_ex = TaskExecution::new(&wf_ex, "a", TaskType::Action, json!({}));
        task_ex.state = State::Running;
        store.insert_task_execution(&task_ex).await.unwrap();

        let mut completed = task_ex.clone();
        completed.state = State::Success;
        completed.published = json!({"x": 1});
        completed.next_tasks = vec![("b".to_string(), TransitionEvent::OnSuccess)];
        completed.has_next_tasks = true;

        assert!(store.complete_task_execution(&completed, State::Running).await.unwrap());
        assert!(!store.complete_task_execution(&completed, State::Running).await.unwrap());

        let stored = store.get_task_execution(&task_ex.id).await.unwrap().unwrap();
        assert_eq!(stored.state, State::Success);
        assert_eq!(stored.published, json!({"x": 1}));
        assert_eq!(stored.next_tasks, completed.next_tasks);
        assert!(stored.has_next_tasks);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_named_lock_exclusive_and_expiring() {
        let store = MemoryStore::new();
        assert!(store.acquire_named_lock("l", Duration::from_secs(60)).await.unwrap());
        assert!(!store.acquire_named_lock("l", Duration::from_secs(60)).await.unwrap());
        store.release_named_lock("l").await.unwrap();
        assert!(store.acquire_named_lock("l", Duration::from_secs(0)).await.unwrap());
        // zero ttl expires immediately and can be taken over
        assert!(store.acquire_named_lock("l", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_preserves_insertion_order() {
        let store = MemoryStore::new();
        let wf_ex = WorkflowExecution::new("wf", "", json!({}));
        for name in ["c", "a", "b"] {
            let ex = TaskExecution::new(&wf_ex, name, TaskType::Action, json!({}));
            store.insert_task_execution(&ex).await.unwrap();
        }
        let names: Vec<_> = store
            .find_task_executions(&TaskExecutionFilter::for_workflow(&wf_ex.id))
            .await
            .unwrap()
            .into_iter()
            .map(|ex| ex.name)
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }
}
