//! Execution state events.
//!
//! Delivery is best-effort: the engine logs notifier failures and moves on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{TaskExecution, WorkflowExecution};
use crate::engine::states::State;
use crate::error::AppResult;
use crate::nats::NatsPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Workflow,
    Task,
}

/// A state change of a workflow or task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub entity: EntityKind,
    pub id: String,
    pub name: String,
    pub workflow_execution_id: String,
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn workflow(wf_ex: &WorkflowExecution, state: State, state_info: Option<&str>) -> Self {
        Self {
            entity: EntityKind::Workflow,
            id: wf_ex.id.clone(),
            name: wf_ex.name.clone(),
            workflow_execution_id: wf_ex.id.clone(),
            state,
            state_info: state_info.map(str::to_string),
            project_id: wf_ex.project_id.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn task(task_ex: &TaskExecution, state: State, state_info: Option<&str>) -> Self {
        Self {
            entity: EntityKind::Task,
            id: task_ex.id.clone(),
            name: task_ex.name.clone(),
            workflow_execution_id: task_ex.workflow_execution_id.clone(),
            state,
            state_info: state_info.map(str::to_string),
            project_id: task_ex.project_id.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Sink for execution events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &ExecutionEvent) -> AppResult<()>;
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &ExecutionEvent) -> AppResult<()> {
        tracing::info!(
            entity = ?event.entity,
            id = %event.id,
            name = %event.name,
            workflow_execution_id = %event.workflow_execution_id,
            state = %event.state,
            state_info = ?event.state_info,
            "Execution state changed"
        );
        Ok(())
    }
}

/// Publishes events to the JetStream events subject.
pub struct NatsNotifier {
    publisher: NatsPublisher,
}

impl NatsNotifier {
    pub fn new(publisher: NatsPublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Notifier for NatsNotifier {
    async fn notify(&self, event: &ExecutionEvent) -> AppResult<()> {
        self.publisher.publish(event).await?;
        Ok(())
    }
}
