//! PostgreSQL-backed store.

use async_trait::async_trait;
use std::time::Duration;

use super::{lock_expiry, Store, TaskExecutionFilter, WorkflowExecutionPatch};
use crate::db::models::{
    ActionDefinition, ActionExecution, TaskExecution, WorkflowDefinition, WorkflowExecution,
};
use crate::db::queries::{action_execution, definition, lock, task_execution, workflow_execution};
use crate::db::DbPool;
use crate::engine::states::State;
use crate::error::AppResult;

/// [`Store`] over the `noetl` schema.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn save_workflow_definition(&self, def: &WorkflowDefinition) -> AppResult<()> {
        definition::upsert_workflow_definition(&self.pool, def).await
    }

    async fn find_workflow_definition(
        &self,
        name: &str,
        namespace: &str,
    ) -> AppResult<Option<WorkflowDefinition>> {
        definition::get_workflow_definition(&self.pool, name, namespace).await
    }

    async fn save_action_definition(&self, def: &ActionDefinition) -> AppResult<()> {
        definition::upsert_action_definition(&self.pool, def).await
    }

    async fn find_action_definition(&self, name: &str) -> AppResult<Option<ActionDefinition>> {
        definition::get_action_definition(&self.pool, name).await
    }

    async fn insert_workflow_execution(&self, ex: &WorkflowExecution) -> AppResult<()> {
        workflow_execution::insert_workflow_execution(&self.pool, ex).await
    }

    async fn get_workflow_execution(&self, id: &str) -> AppResult<Option<WorkflowExecution>> {
        workflow_execution::get_workflow_execution(&self.pool, id).await
    }

    async fn update_workflow_execution(&self, id: &str, patch: WorkflowExecutionPatch) -> AppResult<()> {
        workflow_execution::update_workflow_execution(
            &self.pool,
            id,
            patch.output.as_ref(),
            patch.runtime_context.as_ref(),
            patch.context.as_ref(),
        )
        .await
    }

    async fn transition_workflow_state(
        &self,
        id: &str,
        expected: State,
        state: State,
        state_info: Option<&str>,
    ) -> AppResult<bool> {
        workflow_execution::transition_workflow_state(&self.pool, id, expected, state, state_info).await
    }

    async fn find_workflow_executions_by_task(
        &self,
        task_execution_id: &str,
    ) -> AppResult<Vec<WorkflowExecution>> {
        workflow_execution::get_workflow_executions_by_task(&self.pool, task_execution_id).await
    }

    async fn insert_task_execution(&self, ex: &TaskExecution) -> AppResult<bool> {
        task_execution::insert_task_execution(&self.pool, ex).await
    }

    async fn get_task_execution(&self, id: &str) -> AppResult<Option<TaskExecution>> {
        task_execution::get_task_execution(&self.pool, id).await
    }

    async fn find_task_executions(&self, filter: &TaskExecutionFilter) -> AppResult<Vec<TaskExecution>> {
        task_execution::find_task_executions(&self.pool, filter).await
    }

    async fn update_task_execution(&self, ex: &TaskExecution) -> AppResult<()> {
        task_execution::update_task_execution(&self.pool, ex).await
    }

    async fn transition_task_state(
        &self,
        id: &str,
        expected: State,
        state: State,
        state_info: Option<&str>,
        processed: Option<bool>,
    ) -> AppResult<bool> {
        task_execution::transition_task_state(&self.pool, id, expected, state, state_info, processed).await
    }

    async fn complete_task_execution(&self, ex: &TaskExecution, expected: State) -> AppResult<bool> {
        task_execution::complete_task_execution(&self.pool, ex, expected).await
    }

    async fn insert_action_execution(&self, ex: &ActionExecution) -> AppResult<()> {
        action_execution::insert_action_execution(&self.pool, ex).await
    }

    async fn get_action_execution(&self, id: &str) -> AppResult<Option<ActionExecution>> {
        action_execution::get_action_execution(&self.pool, id).await
    }

    async fn update_action_execution(&self, ex: &ActionExecution) -> AppResult<()> {
        action_execution::update_action_execution(&self.pool, ex).await
    }

    async fn find_action_executions_by_task(
        &self,
        task_execution_id: &str,
    ) -> AppResult<Vec<ActionExecution>> {
        action_execution::get_action_executions_by_task(&self.pool, task_execution_id).await
    }

    async fn acquire_named_lock(&self, name: &str, ttl: Duration) -> AppResult<bool> {
        lock::acquire_named_lock(&self.pool, name, lock_expiry(ttl)).await
    }

    async fn release_named_lock(&self, name: &str) -> AppResult<()> {
        lock::release_named_lock(&self.pool, name).await
    }
}
