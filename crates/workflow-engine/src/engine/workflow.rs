//! Workflow executions: start, pause, resume, stop and completion.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::data_flow::workflow_data_context;
use super::flow::{FlowController, TaskRequest};
use super::states::State;
use super::Engine;
use crate::context::ExecContext;
use crate::db::models::{
    json_get, json_set, TaskExecution, TaskType, WorkflowDefinition, WorkflowExecution, BACKLOG_COMMANDS, SCOPE_PUBLIC,
};
use crate::error::{AppError, AppResult};
use crate::executor::{ActionCompletion, ActionResult};
use crate::notify::ExecutionEvent;
use crate::result_ext::ResultExt;
use crate::spec::WorkflowSpec;
use crate::store::{TaskExecutionFilter, WorkflowExecutionPatch};

/// Parameters of a workflow start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartWorkflowRequest {
    /// Id of an execution already started; the start is then a lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

fn backlog_lock(wf_ex_id: &str) -> String {
    format!("backlog-{}", wf_ex_id)
}

fn visible_to(def: &WorkflowDefinition, ctx: &ExecContext) -> bool {
    ctx.is_admin
        || def.scope == SCOPE_PUBLIC
        || def.project_id.is_none()
        || def.project_id == ctx.project_id
}

fn task_names(executions: &[TaskExecution]) -> String {
    executions
        .iter()
        .map(|ex| ex.name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

impl Engine {
    pub(crate) async fn load_workflow_execution(&self, id: &str) -> AppResult<WorkflowExecution> {
        self.store
            .get_workflow_execution(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("workflow execution {}", id)))
    }

    /// Workflow execution as seen by `ctx`; executions of other projects
    /// are reported as missing.
    pub async fn get_workflow_execution(&self, ctx: &ExecContext, id: &str) -> AppResult<WorkflowExecution> {
        let wf_ex = self.load_workflow_execution(id).await?;
        if ctx.is_admin || wf_ex.project_id.is_none() || wf_ex.project_id == ctx.project_id {
            Ok(wf_ex)
        } else {
            Err(AppError::NotFound(format!("workflow execution {}", id)))
        }
    }

    /// Task executions of a workflow execution in creation order.
    pub async fn list_task_executions(&self, ctx: &ExecContext, id: &str) -> AppResult<Vec<TaskExecution>> {
        let wf_ex = self.get_workflow_execution(ctx, id).await?;
        self.store
            .find_task_executions(&TaskExecutionFilter::for_workflow(&wf_ex.id))
            .await
    }

    async fn notify_workflow(&self, wf_ex: &WorkflowExecution, state: State, info: Option<&str>) {
        let _ = self
            .notifier
            .notify(&ExecutionEvent::workflow(wf_ex, state, info))
            .await
            .log("notify workflow state");
    }

    /// Conditional workflow state change. `false` when it lost a race.
    async fn set_workflow_state(
        &self,
        wf_ex: &mut WorkflowExecution,
        state: State,
        state_info: Option<&str>,
    ) -> AppResult<bool> {
        let old = wf_ex.state;
        if !self
            .store
            .transition_workflow_state(&wf_ex.id, old, state, state_info)
            .await?
        {
            tracing::debug!(
                workflow_execution_id = %wf_ex.id,
                expected = %old,
                target = %state,
                "Workflow state changed concurrently"
            );
            return Ok(false);
        }

        tracing::info!(
            "Workflow '{}' ({}) [{} -> {}, msg={}]",
            wf_ex.name,
            wf_ex.id,
            old,
            state,
            state_info.unwrap_or_default()
        );
        wf_ex.state = state;
        wf_ex.state_info = state_info.map(str::to_string);
        self.notify_workflow(wf_ex, state, state_info).await;
        Ok(true)
    }

    /// Create and start a workflow execution, then dispatch its start tasks.
    pub async fn start_workflow(
        &self,
        ctx: &ExecContext,
        request: StartWorkflowRequest,
    ) -> AppResult<WorkflowExecution> {
        if let Some(id) = &request.execution_id {
            if let Some(existing) = self.store.get_workflow_execution(id).await? {
                return Ok(existing);
            }
        }

        let def = self
            .store
            .find_workflow_definition(&request.name, &request.namespace)
            .await?
            .filter(|def| visible_to(def, ctx))
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "workflow definition [name={}, namespace={}]",
                    request.name, request.namespace
                ))
            })?;

        let spec = WorkflowSpec::from_value(def.spec.clone())?;
        let input = spec.prepare_input(&request.input)?;

        let mut params = request.params;
        params.insert("namespace".to_string(), json!(request.namespace));

        let mut wf_ex = WorkflowExecution::new(&def.name, &def.namespace, def.spec.clone());
        if let Some(id) = request.execution_id {
            wf_ex.id = id;
        }
        wf_ex.workflow_id = Some(def.id.clone());
        wf_ex.description = request.description;
        wf_ex.tags = if request.tags.is_empty() { spec.tags.clone() } else { request.tags };
        wf_ex.input = Value::Object(input);
        wf_ex.task_execution_id = params
            .get("task_execution_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        wf_ex.root_execution_id = params
            .get("root_execution_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        wf_ex.params = Value::Object(params);
        wf_ex.project_id = ctx.project_id.clone().or_else(|| def.project_id.clone());

        self.store.insert_workflow_execution(&wf_ex).await?;
        if !self.set_workflow_state(&mut wf_ex, State::Running, None).await? {
            return self.load_workflow_execution(&wf_ex.id).await;
        }

        let requests = FlowController::new(self.store.as_ref(), self.evaluator.as_ref(), &wf_ex, &spec)
            .next_tasks(None)
            .await?;
        self.dispatch_workflow_tasks(ctx.clone(), wf_ex.id.clone(), requests)
            .await?;

        self.load_workflow_execution(&wf_ex.id).await
    }

    pub async fn pause_workflow(&self, ctx: &ExecContext, id: &str) -> AppResult<WorkflowExecution> {
        let mut wf_ex = self.load_workflow_execution(id).await?;
        if wf_ex.state.is_paused() {
            return Ok(wf_ex);
        }
        if !wf_ex.state.workflow_transition_allowed(State::Paused) {
            return Err(AppError::InvalidState(format!(
                "Can't change workflow state [execution_id={}, state={} -> {}]",
                wf_ex.id,
                wf_ex.state,
                State::Paused
            )));
        }

        tracing::debug!(request_id = ?ctx.request_id, workflow_execution_id = %id, "Pausing workflow");
        self.set_workflow_state(&mut wf_ex, State::Paused, None).await?;
        Ok(wf_ex)
    }

    /// Move a paused workflow back to RUNNING and drain its backlog.
    pub async fn resume_workflow(&self, ctx: &ExecContext, id: &str) -> AppResult<WorkflowExecution> {
        let mut wf_ex = self.load_workflow_execution(id).await?;
        if wf_ex.state.is_running() {
            return Ok(wf_ex);
        }
        if !wf_ex.state.is_paused() {
            return Err(AppError::InvalidState(format!(
                "Can't change workflow state [execution_id={}, state={} -> {}]",
                wf_ex.id,
                wf_ex.state,
                State::Running
            )));
        }
        if !self.set_workflow_state(&mut wf_ex, State::Running, None).await? {
            return self.load_workflow_execution(id).await;
        }

        let backlog = self.take_backlog(id).await?;
        tracing::info!(
            workflow_execution_id = %id,
            commands = backlog.len(),
            "Resuming workflow"
        );
        self.dispatch_workflow_tasks(ctx.clone(), id.to_string(), backlog)
            .await?;
        self.schedule_check_and_complete(ctx.clone(), id.to_string());

        self.load_workflow_execution(id).await
    }

    /// Park task requests while the workflow is paused.
    pub(crate) async fn push_backlog(&self, wf_ex_id: &str, requests: &[TaskRequest]) -> AppResult<()> {
        self.with_named_lock(&backlog_lock(wf_ex_id), async {
            let wf_ex = self.load_workflow_execution(wf_ex_id).await?;
            let mut backlog = wf_ex.backlog();
            for request in requests {
                backlog.push(serde_json::to_value(request)?);
            }
            let mut runtime_context = wf_ex.runtime_context.clone();
            json_set(&mut runtime_context, BACKLOG_COMMANDS, Value::Array(backlog));
            self.store
                .update_workflow_execution(
                    wf_ex_id,
                    WorkflowExecutionPatch {
                        runtime_context: Some(runtime_context),
                        ..Default::default()
                    },
                )
                .await
        })
        .await
    }

    /// Remove and return the parked task requests.
    async fn take_backlog(&self, wf_ex_id: &str) -> AppResult<Vec<TaskRequest>> {
        self.with_named_lock(&backlog_lock(wf_ex_id), async {
            let wf_ex = self.load_workflow_execution(wf_ex_id).await?;
            let requests = wf_ex
                .backlog()
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<TaskRequest>, _>>()?;

            let mut runtime_context = wf_ex.runtime_context.clone();
            if let Value::Object(map) = &mut runtime_context {
                map.remove(BACKLOG_COMMANDS);
            }
            self.store
                .update_workflow_execution(
                    wf_ex_id,
                    WorkflowExecutionPatch {
                        runtime_context: Some(runtime_context),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(requests)
        })
        .await
    }

    /// Finish a workflow with SUCCESS, ERROR or CANCELLED.
    pub fn stop_workflow(
        &self,
        ctx: ExecContext,
        id: String,
        state: State,
        message: Option<String>,
    ) -> BoxFuture<'static, AppResult<()>> {
        let engine = self.clone();
        async move {
            let mut wf_ex = engine.load_workflow_execution(&id).await?;
            if wf_ex.state.is_completed() {
                tracing::debug!(workflow_execution_id = %id, state = %wf_ex.state, "Workflow already completed");
                return Ok(());
            }

            let output = match state {
                State::Success => engine.final_output(&ctx, &wf_ex).await?,
                State::Error => {
                    let mut output = engine.final_output(&ctx, &wf_ex).await?;
                    json_set(&mut output, "result", json!(message.clone().unwrap_or_default()));
                    output
                }
                State::Cancelled => {
                    engine.cancel_sub_workflows(&ctx, &wf_ex, message.as_deref()).await?;
                    let mut output = wf_ex.output.clone();
                    json_set(&mut output, "result", json!(message.clone().unwrap_or_default()));
                    output
                }
                other => return Err(AppError::InvalidState(format!("invalid state: {}", other))),
            };

            if !engine
                .set_workflow_state(&mut wf_ex, state, message.as_deref())
                .await?
            {
                return Ok(());
            }
            engine
                .store
                .update_workflow_execution(
                    &id,
                    WorkflowExecutionPatch {
                        output: Some(output.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            wf_ex.output = output;

            if wf_ex.task_execution_id.is_some() {
                engine.send_result_to_parent(ctx, &wf_ex);
            }
            Ok(())
        }
        .boxed()
    }

    pub(crate) fn force_fail_workflow(
        &self,
        ctx: ExecContext,
        id: String,
        message: String,
    ) -> BoxFuture<'static, AppResult<()>> {
        self.stop_workflow(ctx, id, State::Error, Some(message))
    }

    /// Output of a finishing workflow: the spec `output` evaluated against the
    /// final context, or the final context itself.
    async fn final_output(&self, ctx: &ExecContext, wf_ex: &WorkflowExecution) -> AppResult<Value> {
        let spec = WorkflowSpec::from_value(wf_ex.spec.clone())?;
        let final_ctx = FlowController::new(self.store.as_ref(), self.evaluator.as_ref(), wf_ex, &spec)
            .evaluate_workflow_final_context()
            .await?;

        let output = match &spec.output {
            Some(expression) => {
                let data_ctx = workflow_data_context(wf_ex, &final_ctx);
                self.evaluator.evaluate_recursively(expression, &data_ctx)?
            }
            None => final_ctx,
        };

        let empty = match &output {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        };
        if empty {
            return Ok(Value::Object(ctx.to_map()));
        }
        Ok(output)
    }

    async fn cancel_sub_workflows(
        &self,
        ctx: &ExecContext,
        wf_ex: &WorkflowExecution,
        message: Option<&str>,
    ) -> AppResult<()> {
        let task_executions = self
            .store
            .find_task_executions(&TaskExecutionFilter::for_workflow(&wf_ex.id))
            .await?;
        for task_ex in task_executions
            .iter()
            .filter(|ex| ex.task_type == TaskType::Workflow)
        {
            for sub in self.store.find_workflow_executions_by_task(&task_ex.id).await? {
                if sub.state.is_completed() {
                    continue;
                }
                tracing::info!(
                    workflow_execution_id = %sub.id,
                    parent = %wf_ex.id,
                    "Cancelling sub-workflow"
                );
                self.stop_workflow(
                    ctx.clone(),
                    sub.id.clone(),
                    State::Cancelled,
                    message.map(str::to_string),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Report a finished sub-workflow to the task that started it.
    fn send_result_to_parent(&self, ctx: ExecContext, wf_ex: &WorkflowExecution) {
        let result = match wf_ex.state {
            State::Success => ActionResult::success(wf_ex.output.clone()),
            State::Cancelled => ActionResult {
                error: Some(subworkflow_message(wf_ex)),
                ..ActionResult::cancelled()
            },
            _ => ActionResult::failure(subworkflow_message(wf_ex)),
        };
        let mut completion = ActionCompletion::new(wf_ex.id.clone(), result);
        completion.is_workflow_action = true;

        let engine = self.clone();
        let fut = async move { engine.on_action_complete(ctx, completion).await }.boxed();
        self.spawn_after("send result to parent", self.config.completion_delay(), fut);
    }

    pub(crate) fn schedule_check_and_complete(&self, ctx: ExecContext, wf_ex_id: String) {
        let fut = self.check_and_complete_workflow(ctx, wf_ex_id);
        self.spawn_after("check and complete", self.config.completion_delay(), fut);
    }

    /// Finish the workflow when no task is left to run.
    pub(crate) fn check_and_complete_workflow(
        &self,
        ctx: ExecContext,
        wf_ex_id: String,
    ) -> BoxFuture<'static, AppResult<()>> {
        let engine = self.clone();
        async move {
            let Some(wf_ex) = engine.store.get_workflow_execution(&wf_ex_id).await? else {
                return Ok(());
            };
            if let Err(e) = engine.check_and_complete(&ctx, &wf_ex).await {
                tracing::error!(
                    workflow_execution_id = %wf_ex.id,
                    error = %e,
                    "Failed to check and complete workflow"
                );
                let message = format!(
                    "Failed to check and complete [wf_ex_id={}, wf_name={}]",
                    wf_ex.id, wf_ex.name
                );
                engine.force_fail_workflow(ctx, wf_ex_id, message).await?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn check_and_complete(&self, ctx: &ExecContext, wf_ex: &WorkflowExecution) -> AppResult<()> {
        if wf_ex.state.is_paused() || wf_ex.state.is_completed() {
            return Ok(());
        }

        let filter = TaskExecutionFilter::for_workflow(&wf_ex.id);
        let incomplete = self
            .store
            .find_task_executions(&filter.clone().states(&State::INCOMPLETE))
            .await?;
        let unprocessed = self
            .store
            .find_task_executions(&filter.clone().processed(false))
            .await?;
        if !incomplete.is_empty() || !unprocessed.is_empty() {
            tracing::debug!(
                workflow_execution_id = %wf_ex.id,
                incomplete = incomplete.len(),
                unprocessed = unprocessed.len(),
                "Workflow is not ready to complete"
            );
            return Ok(());
        }

        let spec = WorkflowSpec::from_value(wf_ex.spec.clone())?;
        let flow = FlowController::new(self.store.as_ref(), self.evaluator.as_ref(), wf_ex, &spec);

        if flow.any_cancels().await? {
            let cancelled = self
                .store
                .find_task_executions(&filter.clone().states(&[State::Cancelled]))
                .await?;
            let message = format!("Cancelled tasks: {}", task_names(&cancelled));
            return self
                .stop_workflow(ctx.clone(), wf_ex.id.clone(), State::Cancelled, Some(message))
                .await;
        }

        if flow.all_error_handled().await? {
            return self
                .stop_workflow(ctx.clone(), wf_ex.id.clone(), State::Success, None)
                .await;
        }

        let failed = self
            .store
            .find_task_executions(&filter.states(&[State::Error]).error_handled(false))
            .await?;
        let message = format!("Failure caused by error in tasks: {}", task_names(&failed));
        self.stop_workflow(ctx.clone(), wf_ex.id.clone(), State::Error, Some(message))
            .await
    }
}

/// Message a finished, unsuccessful sub-workflow reports to its parent task.
pub(crate) fn subworkflow_message(wf_ex: &WorkflowExecution) -> String {
    let explicit = wf_ex
        .state_info
        .as_deref()
        .filter(|message| !message.is_empty())
        .or_else(|| json_get(&wf_ex.output, "result").and_then(Value::as_str))
        .filter(|message| !message.is_empty());
    explicit.map(str::to_string).unwrap_or_else(|| match wf_ex.state {
        State::Cancelled => format!("Cancelled subworkflow [execution_id={}]", wf_ex.id),
        _ => format!("Failed subworkflow [execution_id={}]", wf_ex.id),
    })
}
