//! Glue between completions, tasks and workflows.
//!
//! Every entry point here reloads what it touches from the store and
//! returns a boxed future, since tasks, workflows and sub-workflows call
//! back into each other.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use super::action::{Action, WorkflowAction};
use super::data_flow::{merge_into, task_context};
use super::flow::{FlowController, TaskRequest};
use super::states::State;
use super::task::Task;
use super::Engine;
use crate::context::ExecContext;
use crate::db::models::{TaskExecution, WorkflowExecution};
use crate::error::{AppError, AppResult};
use crate::executor::ActionCompletion;
use crate::result_ext::{OptionResultExt, ResultExt};
use crate::spec::WorkflowSpec;

impl Engine {
    async fn load_task_execution(&self, id: &str) -> AppResult<TaskExecution> {
        self.store
            .get_task_execution(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task execution {}", id)))
    }

    fn parse_spec(wf_ex: &WorkflowExecution) -> AppResult<Arc<WorkflowSpec>> {
        WorkflowSpec::from_value(wf_ex.spec.clone()).map(Arc::new)
    }

    /// Run task requests of a workflow, or park them while it is paused.
    pub(crate) fn dispatch_workflow_tasks(
        &self,
        ctx: ExecContext,
        wf_ex_id: String,
        requests: Vec<TaskRequest>,
    ) -> BoxFuture<'static, AppResult<()>> {
        let engine = self.clone();
        async move {
            if requests.is_empty() {
                return Ok(());
            }
            let spec = Self::parse_spec(&engine.load_workflow_execution(&wf_ex_id).await?)?;

            for (i, request) in requests.iter().enumerate() {
                let wf_ex = engine.load_workflow_execution(&wf_ex_id).await?;
                if wf_ex.state.is_completed() {
                    tracing::debug!(
                        workflow_execution_id = %wf_ex_id,
                        state = %wf_ex.state,
                        "Workflow completed, dropping task requests"
                    );
                    break;
                }
                if wf_ex.state.is_paused() {
                    engine.push_backlog(&wf_ex_id, &requests[i..]).await?;
                    tracing::info!(
                        workflow_execution_id = %wf_ex_id,
                        commands = requests.len() - i,
                        "Workflow paused, task requests moved to backlog"
                    );
                    break;
                }

                let task_name = request.task_name.clone();
                let mut task = match Task::from_request(&engine, &ctx, wf_ex, spec.clone(), request.clone()).await {
                    Ok(task) => task,
                    Err(e) => {
                        tracing::error!(
                            "Failed to build task [error={}, wf={}, task={}]",
                            e,
                            wf_ex_id,
                            task_name
                        );
                        engine
                            .force_fail_workflow(ctx.clone(), wf_ex_id.clone(), e.to_string())
                            .await?;
                        break;
                    }
                };

                if let Err(e) = task.run().await {
                    let message = format!(
                        "Failed to run task [error={}, wf={}, task={}]",
                        e, wf_ex_id, task_name
                    );
                    tracing::error!("{}", message);
                    engine.force_fail_task(&ctx, &mut task, &message).await?;
                    continue;
                }

                if let Some(task_ex) = task.execution().filter(|ex| ex.state == State::Waiting) {
                    engine.schedule_refresh_task_state(ctx.clone(), task_ex.id.clone());
                }
                engine.check_affected_tasks(&ctx, &wf_ex_id, &task_name).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Schedule a refresh of every join waiting downstream of `task_name`.
    async fn check_affected_tasks(&self, ctx: &ExecContext, wf_ex_id: &str, task_name: &str) -> AppResult<()> {
        let wf_ex = self.load_workflow_execution(wf_ex_id).await?;
        if wf_ex.state.is_completed() {
            return Ok(());
        }
        let spec = Self::parse_spec(&wf_ex)?;
        let affected = FlowController::new(self.store.as_ref(), self.evaluator.as_ref(), &wf_ex, &spec)
            .find_indirectly_affected_task_executions(task_name)
            .await?;

        for task_ex in affected {
            if task_ex.state.is_completed() || task_ex.state.is_running() {
                continue;
            }
            self.schedule_refresh_task_state(ctx.clone(), task_ex.id);
        }
        Ok(())
    }

    fn schedule_refresh_task_state(&self, ctx: ExecContext, task_ex_id: String) {
        let fut = self.refresh_task_state(ctx, task_ex_id);
        self.spawn_after("refresh task state", self.config.completion_delay(), fut);
    }

    /// Re-evaluate a waiting join and run or fail it when its inbound
    /// tasks have decided.
    fn refresh_task_state(&self, ctx: ExecContext, task_ex_id: String) -> BoxFuture<'static, AppResult<()>> {
        let engine = self.clone();
        async move {
            let Some(task_ex) = engine.store.get_task_execution(&task_ex_id).await? else {
                return Ok(());
            };
            if task_ex.state.is_completed() || task_ex.state.is_running() {
                return Ok(());
            }
            let wf_ex = engine.load_workflow_execution(&task_ex.workflow_execution_id).await?;
            if wf_ex.state.is_completed() {
                return Ok(());
            }

            let task = engine
                .with_named_lock(&task_ex_id, engine.refresh_locked(&ctx, wf_ex, &task_ex_id))
                .await?;
            let Some((mut task, state, info)) = task else {
                return Ok(());
            };

            match state {
                State::Running => {
                    if let Err(e) = task.run().await {
                        let message = format!(
                            "Failed to continue task [error={}, wf={}, task={}]",
                            e,
                            task_ex.workflow_execution_id,
                            task.name()
                        );
                        tracing::error!("{}", message);
                        return engine.force_fail_task(&ctx, &mut task, &message).await;
                    }
                    let name = task.name().to_string();
                    engine
                        .check_affected_tasks(&ctx, &task_ex.workflow_execution_id, &name)
                        .await
                }
                _ => {
                    if let Err(e) = task.complete(State::Error, info).await {
                        let message = format!(
                            "Failed to complete task [error={}, wf={}, task={}]",
                            e,
                            task_ex.workflow_execution_id,
                            task.name()
                        );
                        tracing::error!("{}", message);
                        return engine.force_fail_task(&ctx, &mut task, &message).await;
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }

    /// Decide the state of a join under its lock. Returns the task, its
    /// logical state and message when work is left to do outside the lock.
    async fn refresh_locked(
        &self,
        ctx: &ExecContext,
        wf_ex: WorkflowExecution,
        task_ex_id: &str,
    ) -> AppResult<Option<(Task, State, Option<String>)>> {
        let mut task_ex = self.load_task_execution(task_ex_id).await?;
        if task_ex.state.is_completed() || task_ex.state.is_running() {
            return Ok(None);
        }

        let spec = Self::parse_spec(&wf_ex)?;
        let logic = FlowController::new(self.store.as_ref(), self.evaluator.as_ref(), &wf_ex, &spec)
            .logic_task_state(&task_ex)
            .await?;
        task_ex.set_triggered_by(&logic.triggered_by);

        match logic.state {
            State::Running => {
                let mut in_context = Map::new();
                for trigger in &logic.triggered_by {
                    if let Some(inbound) = self.store.get_task_execution(&trigger.task_id).await? {
                        merge_into(&mut in_context, &task_context(&inbound));
                    }
                }
                task_ex.in_context = Value::Object(in_context);
                self.store.update_task_execution(&task_ex).await?;

                let mut task = Task::from_execution(self, ctx, wf_ex, spec, task_ex)?;
                if !task.core_mut().set_state(State::Running, None, None).await? {
                    return Ok(None);
                }
                Ok(Some((task, State::Running, None)))
            }
            State::Error => {
                self.store.update_task_execution(&task_ex).await?;
                let task = Task::from_execution(self, ctx, wf_ex, spec, task_ex)?;
                Ok(Some((task, State::Error, logic.state_info)))
            }
            State::Waiting => {
                self.store.update_task_execution(&task_ex).await?;
                tracing::debug!(
                    task = %task_ex.name,
                    task_execution_id = %task_ex.id,
                    cardinality = logic.cardinality,
                    "Join is still waiting"
                );
                Ok(None)
            }
            other => {
                tracing::error!(
                    task = %task_ex.name,
                    task_execution_id = %task_ex.id,
                    state = %other,
                    "Unexpected logical task state"
                );
                Ok(None)
            }
        }
    }

    /// Route an action (or sub-workflow) result to its task.
    pub fn on_action_complete(
        &self,
        ctx: ExecContext,
        completion: ActionCompletion,
    ) -> BoxFuture<'static, AppResult<()>> {
        let engine = self.clone();
        async move {
            let action_ex_id = completion.action_execution_id.clone();
            let task_ex_id = if completion.is_workflow_action {
                engine
                    .store
                    .get_workflow_execution(&action_ex_id)
                    .await?
                    .and_then(|wf| wf.task_execution_id)
            } else {
                engine
                    .store
                    .get_action_execution(&action_ex_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("action execution {}", action_ex_id)))?
                    .task_execution_id
            };
            let Some(task_ex_id) = task_ex_id.log_none(format!("task of completion {}", action_ex_id)) else {
                return Ok(());
            };

            let task_ex = engine.load_task_execution(&task_ex_id).await?;
            let wf_ex = engine.load_workflow_execution(&task_ex.workflow_execution_id).await?;
            let mut ctx = ctx;
            ctx.project_id = wf_ex.project_id.clone();
            let spec = Self::parse_spec(&wf_ex)?;
            let wf_ex_id = wf_ex.id.clone();
            let mut task = Task::from_execution(&engine, &ctx, wf_ex.clone(), spec, task_ex)?;

            let recorded = match engine.complete_action(&wf_ex, &task, &completion).await {
                Ok(recorded) => recorded,
                Err(e) => {
                    let message = format!(
                        "Failed to complete action [error={}, action={}, task={}]",
                        e,
                        action_ex_id,
                        task.name()
                    );
                    tracing::error!("{}", message);
                    if let Ok(action) = engine.completion_action(&wf_ex, &task, &completion).await {
                        let _ = action
                            .fail(&engine, &action_ex_id, &message)
                            .await
                            .log("fail action");
                    }
                    return engine.force_fail_task(&ctx, &mut task, &message).await;
                }
            };
            if !recorded {
                return Ok(());
            }

            if matches!(task, Task::WithItems(_)) {
                let fut = engine.task_action_complete(ctx, wf_ex_id, task_ex_id, action_ex_id);
                engine.spawn_after("with-items action complete", engine.config.completion_delay(), fut);
                Ok(())
            } else {
                engine
                    .task_action_complete(ctx, wf_ex_id, task_ex_id, action_ex_id)
                    .await
            }
        }
        .boxed()
    }

    async fn completion_action(
        &self,
        wf_ex: &WorkflowExecution,
        task: &Task,
        completion: &ActionCompletion,
    ) -> AppResult<Action> {
        if completion.is_workflow_action {
            let name = task.core().spec.workflow.clone().unwrap_or_default();
            return Ok(Action::Workflow(WorkflowAction::new(name)));
        }
        let action_ex = self
            .store
            .get_action_execution(&completion.action_execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("action execution {}", completion.action_execution_id)))?;
        self.action_for_execution(wf_ex, &action_ex).await
    }

    async fn complete_action(
        &self,
        wf_ex: &WorkflowExecution,
        task: &Task,
        completion: &ActionCompletion,
    ) -> AppResult<bool> {
        let action = self.completion_action(wf_ex, task, completion).await?;
        action
            .complete(self, &completion.action_execution_id, &completion.result)
            .await
    }

    /// Hand a recorded action result to its task.
    fn task_action_complete(
        &self,
        ctx: ExecContext,
        wf_ex_id: String,
        task_ex_id: String,
        action_ex_id: String,
    ) -> BoxFuture<'static, AppResult<()>> {
        let engine = self.clone();
        async move {
            let wf_ex = engine.load_workflow_execution(&wf_ex_id).await?;
            let task_ex = engine.load_task_execution(&task_ex_id).await?;
            let spec = Self::parse_spec(&wf_ex)?;
            let mut task = Task::from_execution(&engine, &ctx, wf_ex, spec, task_ex)?;

            if let Err(e) = task.on_action_complete(&action_ex_id).await {
                let message = format!(
                    "Failed to handle action completion [error={}, wf={}, task={}, action={}]",
                    e,
                    wf_ex_id,
                    task.name(),
                    action_ex_id
                );
                tracing::error!("{}", message);
                return engine.force_fail_task(&ctx, &mut task, &message).await;
            }

            let name = task.name().to_string();
            engine.check_affected_tasks(&ctx, &wf_ex_id, &name).await
        }
        .boxed()
    }

    /// Fail the task, then its workflow.
    async fn force_fail_task(&self, ctx: &ExecContext, task: &mut Task, message: &str) -> AppResult<()> {
        let _ = task.force_fail(message).await.log("force fail task");
        let wf_ex_id = task.core().wf_ex.id.clone();
        self.force_fail_workflow(ctx.clone(), wf_ex_id, message.to_string())
            .await
    }

    pub(crate) fn schedule_task_retry(&self, ctx: ExecContext, task_ex_id: String, delay: Duration) {
        let fut = self.retry_task(ctx, task_ex_id);
        self.spawn_after("retry task", delay, fut);
    }

    /// Run a DELAYED task again.
    fn retry_task(&self, ctx: ExecContext, task_ex_id: String) -> BoxFuture<'static, AppResult<()>> {
        let engine = self.clone();
        async move {
            let Some(task_ex) = engine.store.get_task_execution(&task_ex_id).await? else {
                return Ok(());
            };
            if task_ex.state != State::Delayed {
                return Ok(());
            }
            let wf_ex = engine.load_workflow_execution(&task_ex.workflow_execution_id).await?;
            if wf_ex.state.is_completed() {
                return Ok(());
            }

            let spec = Self::parse_spec(&wf_ex)?;
            let mut task = Task::from_execution(&engine, &ctx, wf_ex, spec, task_ex)?;
            if !task.core_mut().set_state(State::Running, None, None).await? {
                return Ok(());
            }
            if let Err(e) = task.schedule().await {
                let message = format!(
                    "Failed to retry task [error={}, task={}]",
                    e,
                    task.name()
                );
                tracing::error!("{}", message);
                return engine.force_fail_task(&ctx, &mut task, &message).await;
            }
            Ok(())
        }
        .boxed()
    }
}
