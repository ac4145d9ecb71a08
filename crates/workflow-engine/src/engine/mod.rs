//! Workflow execution engine.
//!
//! The engine is completion driven. Starting a workflow runs its start
//! tasks until their actions are handed to the executor; every action
//! result then re-enters through [`Engine::on_action_complete`], completes
//! its task and dispatches the successors. Nothing is kept in memory between
//! steps: each handler reloads the executions it touches from the [`Store`].
//!
//! - **Flow**: next tasks, join preconditions, workflow completability
//! - **Task**: regular and with-items task state machines
//! - **Action**: command, ad-hoc and sub-workflow actions
//! - **Workflow**: start, pause, resume, stop, check-and-complete
//! - **Dispatcher**: routes completions and refreshes waiting joins

mod action;
mod commands;
mod data_flow;
mod dispatcher;
mod flow;
mod lock;
pub mod states;
mod task;
mod with_items;
mod workflow;

pub use flow::{FlowController, TaskRequest};
pub use workflow::StartWorkflowRequest;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::EngineConfig;
use crate::context::ExecContext;
use crate::db::models::{ActionDefinition, WorkflowDefinition};
use crate::error::{AppError, AppResult};
use crate::executor::{ActionCompletion, ActionExecutor};
use crate::expression::Evaluator;
use crate::notify::{LogNotifier, Notifier};
use crate::spec::{parse_input_declaration, ActionSpec, WorkflowSpec};
use crate::store::Store;

/// Runtime handle shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    evaluator: Arc<dyn Evaluator>,
    executor: Arc<dyn ActionExecutor>,
    notifier: Arc<dyn Notifier>,
    config: Arc<EngineConfig>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        evaluator: Arc<dyn Evaluator>,
        executor: Arc<dyn ActionExecutor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            evaluator,
            executor,
            notifier: Arc::new(LogNotifier),
            config: Arc::new(config),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register (or replace) a workflow definition from YAML or JSON.
    pub async fn register_workflow(
        &self,
        ctx: &ExecContext,
        source: &str,
        namespace: &str,
    ) -> AppResult<WorkflowDefinition> {
        let spec = WorkflowSpec::from_yaml(source)?;
        if spec.name.is_empty() {
            return Err(AppError::Validation("workflow name must not be empty".to_string()));
        }

        let mut def = WorkflowDefinition::new(&spec.name, namespace, spec.to_value()?, ctx.project_id.clone());
        if let Some(existing) = self.store.find_workflow_definition(&spec.name, namespace).await? {
            def.id = existing.id;
            def.created_at = existing.created_at;
            def.updated_at = Some(Utc::now());
        }
        self.store.save_workflow_definition(&def).await?;

        tracing::info!(
            workflow = %def.name,
            namespace = %def.namespace,
            tasks = spec.tasks.len(),
            "Registered workflow definition"
        );
        Ok(def)
    }

    /// Register (or replace) an ad-hoc action definition from YAML or JSON.
    pub async fn register_action(&self, ctx: &ExecContext, source: &str) -> AppResult<ActionDefinition> {
        let spec = ActionSpec::from_yaml(source)?;
        let mut def = ActionDefinition::ad_hoc(&spec.name, spec.to_value()?, ctx.project_id.clone());
        def.description = spec.description.clone();
        def.input = spec.input_names().join(", ");
        if let Some(existing) = self.store.find_action_definition(&spec.name).await? {
            def.id = existing.id;
            def.created_at = existing.created_at;
            def.updated_at = Some(Utc::now());
        }
        self.store.save_action_definition(&def).await?;

        tracing::info!(action = %def.name, base = %spec.base, "Registered ad-hoc action");
        Ok(def)
    }

    /// Register an action backed by an executor plugin.
    pub async fn register_plugin_action(
        &self,
        name: &str,
        action_class: &str,
        input: &str,
    ) -> AppResult<ActionDefinition> {
        parse_input_declaration(input)?;
        let def = ActionDefinition::plugin(name, action_class, input);
        self.store.save_action_definition(&def).await?;
        tracing::info!(action = %name, class = %action_class, "Registered plugin action");
        Ok(def)
    }

    /// Accept an action result from outside; it is handled after the
    /// completion delay.
    pub fn submit_completion(&self, ctx: ExecContext, completion: ActionCompletion) {
        tracing::debug!(
            action_execution_id = %completion.action_execution_id,
            is_workflow_action = completion.is_workflow_action,
            "Received action completion"
        );
        let fut = self.on_action_complete(ctx, completion);
        self.spawn_after("action complete", self.config.completion_delay(), fut);
    }

    /// Feed completions from an executor channel into the engine until the
    /// channel closes.
    pub async fn run_completion_loop(self, mut completions: UnboundedReceiver<ActionCompletion>) {
        while let Some(completion) = completions.recv().await {
            self.submit_completion(ExecContext::default().child(), completion);
        }
        tracing::info!("Completion channel closed");
    }

    /// Run `fut` on the runtime after `delay`. Errors and panics are logged
    /// and go no further.
    pub(crate) fn spawn_after(
        &self,
        handler: &'static str,
        delay: Duration,
        fut: BoxFuture<'static, AppResult<()>>,
    ) {
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(handler, error = %e, "Scheduled handler failed"),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(handler, panic = %message, "Scheduled handler panicked");
                }
            }
        });
    }
}
