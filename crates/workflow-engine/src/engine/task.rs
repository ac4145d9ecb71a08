//! Tasks: one node of the workflow graph and its execution record.
//!
//! A [`Task`] is rebuilt from the store whenever something happens to it.
//! Every state change is a conditional update against the state the task
//! was loaded in, so a task that lost a race simply stops.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use super::action::{value_text, Action, ScheduleRequest, WorkflowAction};
use super::data_flow::{publish_variables, task_input_context};
use super::flow::{next_task_pairs, FlowController, TaskRequest};
use super::states::{State, TriggeredBy};
use super::with_items::{evaluate_items, final_state, WithItemsState};
use super::workflow::subworkflow_message;
use super::Engine;
use crate::context::ExecContext;
use crate::db::models::{json_get, json_set, TaskExecution, TaskType, WorkflowExecution};
use crate::error::{AppError, AppResult};
use crate::expression::DataContext;
use crate::notify::ExecutionEvent;
use crate::result_ext::ResultExt;
use crate::spec::{parse_with_items, EngineCommand, TaskSpec, WorkflowSpec};
use crate::store::TaskExecutionFilter;

const PARENT_RESULT_KEY: &str = "parent_result";
const RETRY_NO_KEY: &str = "retry_no";
const DEFAULT_ACTION: &str = "std.noop";
const ACTION_DEFAULTS_PARAM: &str = "__actions";

fn with_items_lock(task_ex_id: &str) -> String {
    format!("with-items-{}", task_ex_id)
}

fn task_spec(wf_spec: &WorkflowSpec, name: &str) -> AppResult<TaskSpec> {
    if let Some(spec) = wf_spec.task(name) {
        return Ok(spec.clone());
    }
    EngineCommand::from_name(name)
        .map(TaskSpec::for_engine_command)
        .ok_or_else(|| AppError::Graph(format!("task '{}' missing", name)))
}

/// Action, input and target ready to be scheduled.
struct PreparedAction {
    action: Action,
    input: Map<String, Value>,
    data_ctx: DataContext,
    target: Option<String>,
}

pub(crate) struct TaskCore {
    pub(super) engine: Engine,
    pub(super) ctx: ExecContext,
    pub(super) wf_ex: WorkflowExecution,
    wf_spec: Arc<WorkflowSpec>,
    pub(super) spec: TaskSpec,
    pub(super) task_ex: Option<TaskExecution>,
    waiting: bool,
    unique_key: Option<String>,
    pub(super) triggered_by: Vec<TriggeredBy>,
    in_context: Value,
    parent_result: Option<String>,
}

pub(crate) enum Task {
    Regular(TaskCore),
    WithItems(TaskCore),
}

impl Task {
    fn new(core: TaskCore) -> Self {
        if core.spec.has_with_items() {
            Task::WithItems(core)
        } else {
            Task::Regular(core)
        }
    }

    pub(crate) async fn from_request(
        engine: &Engine,
        ctx: &ExecContext,
        wf_ex: WorkflowExecution,
        wf_spec: Arc<WorkflowSpec>,
        request: TaskRequest,
    ) -> AppResult<Self> {
        if let Some(id) = &request.task_execution_id {
            let task_ex = engine
                .store
                .get_task_execution(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("task execution {}", id)))?;
            return Self::from_execution(engine, ctx, wf_ex, wf_spec, task_ex);
        }

        let spec = task_spec(&wf_spec, &request.task_name)?;
        Ok(Self::new(TaskCore {
            engine: engine.clone(),
            ctx: ctx.clone(),
            wf_ex,
            wf_spec,
            spec,
            task_ex: None,
            waiting: request.waiting,
            unique_key: request.unique_key,
            triggered_by: request.triggered_by,
            in_context: request.in_context,
            parent_result: request.parent_result,
        }))
    }

    pub(crate) fn from_execution(
        engine: &Engine,
        ctx: &ExecContext,
        wf_ex: WorkflowExecution,
        wf_spec: Arc<WorkflowSpec>,
        task_ex: TaskExecution,
    ) -> AppResult<Self> {
        let spec = task_spec(&wf_spec, &task_ex.name)?;
        let parent_result = json_get(&task_ex.runtime_context, PARENT_RESULT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self::new(TaskCore {
            engine: engine.clone(),
            ctx: ctx.clone(),
            wf_ex,
            wf_spec,
            spec,
            waiting: false,
            unique_key: task_ex.unique_key.clone(),
            triggered_by: task_ex.triggered_by(),
            in_context: task_ex.in_context.clone(),
            parent_result,
            task_ex: Some(task_ex),
        }))
    }

    pub(crate) fn core(&self) -> &TaskCore {
        match self {
            Task::Regular(core) | Task::WithItems(core) => core,
        }
    }

    pub(crate) fn core_mut(&mut self) -> &mut TaskCore {
        match self {
            Task::Regular(core) | Task::WithItems(core) => core,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.core().spec.name
    }

    pub(crate) fn execution(&self) -> Option<&TaskExecution> {
        self.core().task_ex.as_ref()
    }

    pub(crate) async fn run(&mut self) -> AppResult<()> {
        if let Some(command) = self.core().spec.command {
            return self.core_mut().run_engine_command(command).await;
        }
        match self.execution().map(|ex| ex.state) {
            None => self.run_new().await,
            Some(state) => self.run_existing(state).await,
        }
    }

    async fn run_new(&mut self) -> AppResult<()> {
        let core = self.core_mut();
        if core.waiting {
            return core.defer().await;
        }
        if !core.create_execution(State::Idle, None).await? {
            return Ok(());
        }
        self.start().await
    }

    async fn run_existing(&mut self, state: State) -> AppResult<()> {
        match state {
            State::Idle => self.start().await,
            State::Running => self.schedule().await,
            other => {
                tracing::debug!(task = %self.name(), state = %other, "Task is not runnable");
                Ok(())
            }
        }
    }

    /// Claim an IDLE execution and schedule its work.
    async fn start(&mut self) -> AppResult<()> {
        match self {
            Task::Regular(core) => {
                let prepared = core.prepare_action().await?;
                if !core.set_state(State::Running, None, None).await? {
                    return Ok(());
                }
                core.schedule_prepared(prepared).await
            }
            Task::WithItems(core) => {
                if !core.set_state(State::Running, None, None).await? {
                    return Ok(());
                }
                core.start_with_items().await
            }
        }
    }

    /// Schedule the work of a RUNNING task.
    pub(crate) async fn schedule(&mut self) -> AppResult<()> {
        match self {
            Task::Regular(core) => {
                let prepared = core.prepare_action().await?;
                core.schedule_prepared(prepared).await
            }
            Task::WithItems(core) => core.start_with_items().await,
        }
    }

    pub(crate) async fn complete(&mut self, state: State, state_info: Option<String>) -> AppResult<()> {
        self.core_mut().complete(state, state_info).await
    }

    pub(crate) async fn on_action_complete(&mut self, action_ex_id: &str) -> AppResult<()> {
        match self {
            Task::Regular(core) => core.on_action_complete(action_ex_id).await,
            Task::WithItems(core) => core.on_item_complete().await,
        }
    }

    pub(crate) async fn force_fail(&mut self, message: &str) -> AppResult<()> {
        self.core_mut().force_fail(message).await
    }
}

impl TaskCore {
    pub(super) fn execution(&self) -> AppResult<&TaskExecution> {
        self.task_ex
            .as_ref()
            .ok_or_else(|| AppError::Internal(format!("task '{}' has no execution", self.spec.name)))
    }

    fn execution_mut(&mut self) -> AppResult<&mut TaskExecution> {
        let name = &self.spec.name;
        self.task_ex
            .as_mut()
            .ok_or_else(|| AppError::Internal(format!("task '{}' has no execution", name)))
    }

    async fn reload(&mut self) -> AppResult<()> {
        let id = self.execution()?.id.clone();
        let task_ex = self
            .engine
            .store
            .get_task_execution(&id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task execution {}", id)))?;
        self.task_ex = Some(task_ex);
        Ok(())
    }

    async fn notify(&self, task_ex: &TaskExecution, state: State, state_info: Option<&str>) {
        let _ = self
            .engine
            .notifier
            .notify(&ExecutionEvent::task(task_ex, state, state_info))
            .await
            .log("notify task state");
    }

    /// Insert the execution record. `false` when the unique key is taken.
    pub(super) async fn create_execution(&mut self, state: State, state_info: Option<&str>) -> AppResult<bool> {
        let mut task_ex = TaskExecution::new(
            &self.wf_ex,
            &self.spec.name,
            self.spec.task_type(),
            serde_json::to_value(&self.spec)?,
        );
        task_ex.state = state;
        task_ex.state_info = state_info.map(str::to_string);
        task_ex.unique_key = self.unique_key.clone();
        task_ex.in_context = self.in_context.clone();
        task_ex.set_triggered_by(&self.triggered_by);
        if let Some(parent_result) = &self.parent_result {
            json_set(&mut task_ex.runtime_context, PARENT_RESULT_KEY, json!(parent_result));
        }
        if state == State::Running {
            task_ex.started_at = Some(task_ex.created_at);
        }

        if !self.engine.store.insert_task_execution(&task_ex).await? {
            tracing::debug!(
                task = %self.spec.name,
                unique_key = ?self.unique_key,
                "Task execution already exists"
            );
            return Ok(false);
        }

        tracing::info!(
            "Task '{}' ({}) created [state={}, wf={}]",
            task_ex.name,
            task_ex.id,
            state,
            self.wf_ex.name
        );
        self.notify(&task_ex, state, state_info).await;
        self.task_ex = Some(task_ex);
        Ok(true)
    }

    /// Create the join execution WAITING unless another request did.
    pub(super) async fn defer(&mut self) -> AppResult<()> {
        let key = self.unique_key.clone().ok_or_else(|| {
            AppError::Internal(format!("waiting task '{}' has no unique key", self.spec.name))
        })?;
        let engine = self.engine.clone();

        engine
            .with_named_lock(&key, async {
                let filter = TaskExecutionFilter::for_workflow(&self.wf_ex.id).unique_key(key.as_str());
                if !self.engine.store.find_task_executions(&filter).await?.is_empty() {
                    tracing::debug!(task = %self.spec.name, unique_key = %key, "Task is already waiting");
                    return Ok(());
                }
                self.create_execution(State::Waiting, Some("Task is waiting"))
                    .await
                    .map(|_| ())
            })
            .await
    }

    /// Conditional state change. `false` when the persisted state moved on.
    pub(super) async fn set_state(
        &mut self,
        state: State,
        state_info: Option<&str>,
        processed: Option<bool>,
    ) -> AppResult<bool> {
        let task_ex = self.execution()?;
        let old = task_ex.state;
        let id = task_ex.id.clone();

        if !self
            .engine
            .store
            .transition_task_state(&id, old, state, state_info, processed)
            .await?
        {
            tracing::debug!(
                task = %self.spec.name,
                task_execution_id = %id,
                expected = %old,
                target = %state,
                "Task state changed concurrently"
            );
            return Ok(false);
        }

        tracing::info!(
            "Task '{}' ({}) [{} -> {}, msg={}]",
            self.spec.name,
            id,
            old,
            state,
            state_info.unwrap_or_default()
        );

        let task_ex = self.execution_mut()?;
        task_ex.state = state;
        task_ex.state_info = state_info.map(str::to_string);
        if let Some(processed) = processed {
            task_ex.processed = processed;
        }
        let snapshot = task_ex.clone();
        self.notify(&snapshot, state, state_info).await;
        Ok(true)
    }

    /// Flag a completed execution whose successors have been dispatched.
    async fn mark_processed(&mut self) -> AppResult<()> {
        let task_ex = self.execution()?;
        let (id, state) = (task_ex.id.clone(), task_ex.state);
        let info = task_ex.state_info.clone();
        if self
            .engine
            .store
            .transition_task_state(&id, state, state, info.as_deref(), Some(true))
            .await?
        {
            self.execution_mut()?.processed = true;
        }
        Ok(())
    }

    pub(super) async fn force_fail(&mut self, message: &str) -> AppResult<()> {
        if self.task_ex.is_none() {
            return Ok(());
        }
        self.set_state(State::Error, Some(message), Some(true)).await.map(|_| ())
    }

    /// Context for input, targets and items of this task.
    fn data_context(&self, task_ex: &TaskExecution) -> DataContext {
        let mut ctx = task_input_context(&self.wf_ex, task_ex);
        if self.spec.get_parent {
            ctx.insert(
                PARENT_RESULT_KEY.to_string(),
                self.parent_result.clone().map(Value::String).unwrap_or(Value::Null),
            );
        }
        ctx
    }

    /// Per-task input defaults from `params.__actions.<task name>`.
    fn action_defaults(&self) -> Map<String, Value> {
        self.wf_ex
            .param(ACTION_DEFAULTS_PARAM)
            .and_then(|actions| json_get(actions, &self.spec.name))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// Evaluated task input laid over the task's action defaults.
    fn evaluate_input(&self, ctx: &DataContext) -> AppResult<Map<String, Value>> {
        let evaluated = match self
            .engine
            .evaluator
            .evaluate_recursively(&Value::Object(self.spec.input.clone()), ctx)?
        {
            Value::Object(map) => map,
            other => {
                return Err(AppError::Validation(format!(
                    "task '{}' input must evaluate to an object, got {}",
                    self.spec.name, other
                )))
            }
        };
        let mut input = self.action_defaults();
        input.extend(evaluated);
        Ok(input)
    }

    fn evaluate_target(&self, ctx: &DataContext) -> AppResult<Option<String>> {
        let Some(target) = &self.spec.target else {
            return Ok(None);
        };
        match self.engine.evaluator.evaluate(target, ctx)? {
            Value::Null => Ok(None),
            value => Ok(Some(value_text(&value))),
        }
    }

    async fn resolve_action(&self, ctx: &DataContext) -> AppResult<Action> {
        if let Some(workflow) = &self.spec.workflow {
            let name = value_text(&self.engine.evaluator.evaluate(workflow, ctx)?);
            return Ok(Action::Workflow(WorkflowAction::new(name)));
        }
        let name = match &self.spec.action {
            Some(action) => value_text(&self.engine.evaluator.evaluate(action, ctx)?),
            None => DEFAULT_ACTION.to_string(),
        };
        self.engine.resolve_action(&self.wf_ex, &name).await
    }

    async fn prepare_action(&self) -> AppResult<PreparedAction> {
        let data_ctx = self.data_context(self.execution()?);
        let action = self.resolve_action(&data_ctx).await?;
        let input = self.evaluate_input(&data_ctx)?;
        action.validate_input(&input)?;
        let target = self.evaluate_target(&data_ctx)?;
        Ok(PreparedAction {
            action,
            input,
            data_ctx,
            target,
        })
    }

    async fn schedule_prepared(&self, prepared: PreparedAction) -> AppResult<()> {
        let request = ScheduleRequest {
            ctx: &self.ctx,
            wf_ex: &self.wf_ex,
            task_ex: self.execution()?,
            data_ctx: &prepared.data_ctx,
            target: prepared.target,
            timeout: self.spec.timeout,
            index: 0,
        };
        prepared.action.schedule(&self.engine, request, prepared.input).await
    }

    /// Task result exposed to `publish`: the action result, the sub-workflow
    /// output, or the list of item results ordered by index.
    async fn result(&self) -> AppResult<Value> {
        let task_ex = self.execution()?;
        let store = &self.engine.store;

        let mut results: Vec<(usize, Value)> = match self.spec.task_type() {
            TaskType::Workflow => store
                .find_workflow_executions_by_task(&task_ex.id)
                .await?
                .into_iter()
                .map(|wf| {
                    let index = wf.param("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                    (index, wf.output)
                })
                .collect(),
            TaskType::Action => store
                .find_action_executions_by_task(&task_ex.id)
                .await?
                .into_iter()
                .map(|ex| (ex.index(), ex.result()))
                .collect(),
        };

        if self.spec.has_with_items() {
            results.sort_by_key(|(index, _)| *index);
            Ok(Value::Array(results.into_iter().map(|(_, v)| v).collect()))
        } else {
            Ok(results.pop().map(|(_, v)| v).unwrap_or(Value::Null))
        }
    }

    /// Finish the task and dispatch what comes next.
    ///
    /// The completed state, published variables and routing columns are
    /// committed in one conditional update, so a concurrent join refresh
    /// never sees a completed inbound task without its next tasks.
    pub(super) async fn complete(&mut self, state: State, state_info: Option<String>) -> AppResult<()> {
        let current = self.execution()?;
        if current.state.is_completed() {
            tracing::debug!(task = %self.spec.name, "Task already completed");
            return Ok(());
        }
        let old = current.state;
        let mut completed = current.clone();
        completed.state = state;
        completed.state_info = state_info;

        let result = self.result().await?;
        completed.published = publish_variables(
            self.engine.evaluator.as_ref(),
            &self.wf_ex,
            &completed,
            &self.spec,
            state,
            &result,
        )?;

        let next = FlowController::new(
            self.engine.store.as_ref(),
            self.engine.evaluator.as_ref(),
            &self.wf_ex,
            &self.wf_spec,
        )
        .next_tasks_for_task(&completed)?;
        completed.next_tasks = next_task_pairs(&next);
        completed.has_next_tasks = !next.is_empty();
        if state == State::Error && completed.has_next_tasks {
            completed.error_handled = true;
        }

        if !self.engine.store.complete_task_execution(&completed, old).await? {
            tracing::debug!(
                task = %self.spec.name,
                task_execution_id = %completed.id,
                expected = %old,
                target = %state,
                "Task state changed concurrently"
            );
            return Ok(());
        }
        tracing::info!(
            "Task '{}' ({}) [{} -> {}, msg={}]",
            self.spec.name,
            completed.id,
            old,
            state,
            completed.state_info.as_deref().unwrap_or_default()
        );
        self.notify(&completed, state, completed.state_info.as_deref()).await;
        self.task_ex = Some(completed);

        self.engine
            .dispatch_workflow_tasks(self.ctx.clone(), self.wf_ex.id.clone(), next)
            .await?;

        self.mark_processed().await?;

        let may_complete = FlowController::new(
            self.engine.store.as_ref(),
            self.engine.evaluator.as_ref(),
            &self.wf_ex,
            &self.wf_spec,
        )
        .may_complete_workflow(self.execution()?);
        if may_complete {
            self.engine
                .schedule_check_and_complete(self.ctx.clone(), self.wf_ex.id.clone());
        }
        Ok(())
    }

    /// State and message carried by a finished action or sub-workflow.
    async fn action_outcome(&self, action_ex_id: &str) -> AppResult<(State, Option<String>)> {
        let store = &self.engine.store;
        if self.spec.task_type() == TaskType::Workflow {
            let wf_ex = store
                .get_workflow_execution(action_ex_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("workflow execution {}", action_ex_id)))?;
            let info = (!wf_ex.state.is_success()).then(|| subworkflow_message(&wf_ex));
            return Ok((wf_ex.state, info));
        }

        let action_ex = store
            .get_action_execution(action_ex_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("action execution {}", action_ex_id)))?;
        let info = (!action_ex.state.is_success()).then(|| value_text(&action_ex.result()));
        Ok((action_ex.state, info))
    }

    async fn on_action_complete(&mut self, action_ex_id: &str) -> AppResult<()> {
        self.reload().await?;
        if self.execution()?.state.is_completed() {
            return Ok(());
        }

        let (state, state_info) = self.action_outcome(action_ex_id).await?;
        if state == State::Error && self.retry().await? {
            return Ok(());
        }
        self.complete(state, state_info).await
    }

    /// Move to DELAYED and schedule another attempt when the retry policy
    /// allows it.
    async fn retry(&mut self) -> AppResult<bool> {
        let Some(policy) = self.spec.retry.clone() else {
            return Ok(false);
        };
        let task_ex = self.execution()?;
        let retry_no = json_get(&task_ex.runtime_context, RETRY_NO_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        if retry_no >= policy.count {
            return Ok(false);
        }

        if let Some(break_on) = policy.break_on.as_deref() {
            let mut ctx = self.data_context(task_ex);
            ctx.insert("result".to_string(), self.result().await?);
            if self.engine.evaluator.evaluate_guard(Some(break_on), &ctx)? {
                tracing::info!(task = %self.spec.name, break_on = %break_on, "Retry stopped by break-on");
                return Ok(false);
            }
        }

        let retry_no = retry_no + 1;
        let task_ex = self.execution_mut()?;
        json_set(&mut task_ex.runtime_context, RETRY_NO_KEY, json!(retry_no));
        self.engine.store.update_task_execution(self.execution()?).await?;

        let message = format!("Retrying ({}/{})", retry_no, policy.count);
        if self.set_state(State::Delayed, Some(&message), None).await? {
            let id = self.execution()?.id.clone();
            self.engine
                .schedule_task_retry(self.ctx.clone(), id, Duration::from_secs(policy.delay));
        }
        Ok(true)
    }

    // ---- with-items -------------------------------------------------------

    async fn start_with_items(&mut self) -> AppResult<()> {
        let lock = with_items_lock(&self.execution()?.id);
        let engine = self.engine.clone();
        let empty = engine.with_named_lock(&lock, self.schedule_initial_items()).await?;
        if empty {
            self.complete(State::Success, None).await?;
        }
        Ok(())
    }

    /// Schedule the first batch. Returns `true` when there are no items.
    async fn schedule_initial_items(&mut self) -> AppResult<bool> {
        self.reload().await?;
        if WithItemsState::load(self.execution()?).is_some() {
            return Ok(false);
        }

        let data_ctx = self.data_context(self.execution()?);
        let items = evaluate_items(
            self.engine.evaluator.as_ref(),
            &parse_with_items(&self.spec.with_items)?,
            &data_ctx,
        )?;
        if items.is_empty() {
            return Ok(true);
        }

        let concurrency = self.spec.concurrency.unwrap_or(0) as usize;
        let mut state = WithItemsState::new(items.len(), concurrency);
        let action = self.resolve_action(&data_ctx).await?;
        let scheduled = self.schedule_items(&action, &items, &data_ctx, &mut state).await;

        state.save(self.execution_mut()?)?;
        self.engine.store.update_task_execution(self.execution()?).await?;
        scheduled.map(|_| false)
    }

    async fn schedule_items(
        &self,
        action: &Action,
        items: &[Map<String, Value>],
        data_ctx: &DataContext,
        state: &mut WithItemsState,
    ) -> AppResult<()> {
        while state.can_schedule() {
            let index = state.next_index;
            let item = items.get(index).ok_or_else(|| {
                AppError::Graph(format!(
                    "with-items task '{}' has {} items, item {} was expected",
                    self.spec.name,
                    items.len(),
                    index
                ))
            })?;

            let mut item_ctx = data_ctx.clone();
            item_ctx.extend(item.clone());
            let mut input = self.evaluate_input(&item_ctx)?;
            input.extend(item.clone());
            action.validate_input(&input)?;

            let request = ScheduleRequest {
                ctx: &self.ctx,
                wf_ex: &self.wf_ex,
                task_ex: self.execution()?,
                data_ctx: &item_ctx,
                target: self.evaluate_target(&item_ctx)?,
                timeout: self.spec.timeout,
                index,
            };
            action.schedule(&self.engine, request, input).await?;
            state.take_slot();
        }
        Ok(())
    }

    /// States of the item runs scheduled so far.
    async fn item_states(&self) -> AppResult<Vec<State>> {
        let id = &self.execution()?.id;
        let store = &self.engine.store;
        Ok(match self.spec.task_type() {
            TaskType::Workflow => store
                .find_workflow_executions_by_task(id)
                .await?
                .into_iter()
                .map(|wf| wf.state)
                .collect(),
            TaskType::Action => store
                .find_action_executions_by_task(id)
                .await?
                .into_iter()
                .map(|ex| ex.state)
                .collect(),
        })
    }

    async fn on_item_complete(&mut self) -> AppResult<()> {
        let lock = with_items_lock(&self.execution()?.id);
        let engine = self.engine.clone();
        let outcome = engine.with_named_lock(&lock, self.handle_item_completion()).await?;
        if let Some((state, state_info)) = outcome {
            self.complete(state, state_info).await?;
        }
        Ok(())
    }

    async fn handle_item_completion(&mut self) -> AppResult<Option<(State, Option<String>)>> {
        self.reload().await?;
        let task_ex = self.execution()?;
        if task_ex.state.is_completed() {
            return Ok(None);
        }
        let Some(mut state) = WithItemsState::load(task_ex) else {
            return Err(AppError::Internal(format!(
                "with-items task '{}' has no item state",
                self.spec.name
            )));
        };
        state.release_slot();

        let states = self.item_states().await?;
        let finished = states.iter().filter(|s| s.is_completed()).count();
        let cancelled = states.iter().any(|s| s.is_cancelled());

        let outcome = if cancelled || (state.all_scheduled() && finished >= state.count) {
            Some(final_state(&states))
        } else {
            if state.can_schedule() {
                let data_ctx = self.data_context(task_ex);
                let items = evaluate_items(
                    self.engine.evaluator.as_ref(),
                    &parse_with_items(&self.spec.with_items)?,
                    &data_ctx,
                )?;
                let action = self.resolve_action(&data_ctx).await?;
                self.schedule_items(&action, &items, &data_ctx, &mut state).await?;
            }
            None
        };

        state.save(self.execution_mut()?)?;
        self.engine.store.update_task_execution(self.execution()?).await?;
        Ok(outcome)
    }
}
