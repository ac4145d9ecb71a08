//! Flow control: which tasks run next, join resolution and workflow
//! completability.
//!
//! A [`FlowController`] is built per evaluation from a workflow execution
//! snapshot and its parsed spec. It reads task executions from the store but
//! never writes; callers persist its decisions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

use crate::db::models::{TaskExecution, WorkflowExecution};
use crate::error::{AppError, AppResult};
use crate::expression::Evaluator;
use crate::spec::{is_engine_command, TaskSpec, WorkflowSpec};
use crate::store::{Store, TaskExecutionFilter};

use super::data_flow::{merge_into, task_context, task_data_context};
use super::states::{Join, LogicState, State, TransitionEvent, TriggeredBy};

/// A task to be run, as produced by the flow controller.
///
/// Also the persisted form of a dispatch parked in a paused workflow's
/// backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_name: String,
    /// Set when the task execution already exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_execution_id: Option<String>,
    #[serde(default)]
    pub triggered_by: Vec<TriggeredBy>,
    #[serde(default)]
    pub in_context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    /// Join tasks are created WAITING and started by a state refresh.
    #[serde(default)]
    pub waiting: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_result: Option<String>,
}

impl TaskRequest {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            task_execution_id: None,
            triggered_by: Vec::new(),
            in_context: Value::Object(Map::new()),
            unique_key: None,
            waiting: false,
            parent_result: None,
        }
    }

    /// Request re-running an execution that was created but never scheduled.
    pub fn existing(task_ex: &TaskExecution) -> Self {
        Self {
            task_name: task_ex.name.clone(),
            task_execution_id: Some(task_ex.id.clone()),
            triggered_by: task_ex.triggered_by(),
            in_context: task_ex.in_context.clone(),
            unique_key: task_ex.unique_key.clone(),
            waiting: false,
            parent_result: None,
        }
    }

    /// Event of the transition that produced this request.
    pub fn event(&self) -> Option<TransitionEvent> {
        self.triggered_by.first().map(|t| t.event)
    }
}

/// Unique key shared by every request for the same join task.
pub(crate) fn join_unique_key(wf_ex_id: &str, task_name: &str) -> String {
    format!("join-task-{}-{}", wf_ex_id, task_name)
}

/// `[name, event]` pairs recorded on the completed task.
pub(crate) fn next_task_pairs(requests: &[TaskRequest]) -> Vec<(String, TransitionEvent)> {
    requests
        .iter()
        .filter_map(|r| r.event().map(|event| (r.task_name.clone(), event)))
        .collect()
}

/// Outcome of a single inbound edge of a join.
#[derive(Debug, Clone, PartialEq)]
struct InducedState {
    state: State,
    triggered_by: Option<TriggeredBy>,
}

impl InducedState {
    fn of(state: State) -> Self {
        Self {
            state,
            triggered_by: None,
        }
    }
}

pub struct FlowController<'a> {
    store: &'a dyn Store,
    evaluator: &'a dyn Evaluator,
    wf_ex: &'a WorkflowExecution,
    spec: &'a WorkflowSpec,
}

impl<'a> FlowController<'a> {
    pub fn new(
        store: &'a dyn Store,
        evaluator: &'a dyn Evaluator,
        wf_ex: &'a WorkflowExecution,
        spec: &'a WorkflowSpec,
    ) -> Self {
        Self {
            store,
            evaluator,
            wf_ex,
            spec,
        }
    }

    fn filter(&self) -> TaskExecutionFilter {
        TaskExecutionFilter::for_workflow(&self.wf_ex.id)
    }

    /// One request per task spec without inbound transitions.
    pub fn start_tasks(&self) -> Vec<TaskRequest> {
        self.spec
            .start_task_specs()
            .into_iter()
            .map(|spec| TaskRequest::new(&spec.name))
            .collect()
    }

    /// Tasks to run next. `None` means "from the current workflow state".
    pub async fn next_tasks(&self, task_ex: Option<&TaskExecution>) -> AppResult<Vec<TaskRequest>> {
        if self.wf_ex.state.is_completed() {
            return Ok(Vec::new());
        }

        let idle = self
            .store
            .find_task_executions(&self.filter().states(&[State::Idle]))
            .await?;
        let mut requests: Vec<TaskRequest> = idle.iter().map(TaskRequest::existing).collect();

        match task_ex {
            Some(task_ex) => requests.extend(self.next_tasks_for_task(task_ex)?),
            None => {
                let executions = self.store.find_task_executions(&self.filter()).await?;
                if executions.is_empty() {
                    requests.extend(self.start_tasks());
                } else {
                    for ex in executions
                        .iter()
                        .filter(|ex| ex.state.is_completed() && !ex.processed)
                    {
                        requests.extend(self.next_tasks_for_task(ex)?);
                    }
                }
            }
        }
        Ok(requests)
    }

    /// Successors of a completed task, with guards evaluated.
    pub fn next_tasks_for_task(&self, task_ex: &TaskExecution) -> AppResult<Vec<TaskRequest>> {
        let Some(task_spec) = self.spec.task(&task_ex.name) else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        match task_ex.state {
            State::Error => events.push(TransitionEvent::OnError),
            State::Success => events.push(TransitionEvent::OnSuccess),
            _ => {}
        }
        if task_ex.state.is_completed() && !task_ex.state.is_cancelled() {
            events.push(TransitionEvent::OnComplete);
        }

        let ctx = task_data_context(self.wf_ex, task_ex);
        let outbound_ctx = task_context(task_ex);
        let mut requests = Vec::new();

        for event in events {
            for transition in self.spec.transitions(task_spec, event) {
                if !self.evaluator.evaluate_guard(transition.guard.as_deref(), &ctx)? {
                    continue;
                }
                let target = self.target_spec(&transition.name)?;

                let mut request = TaskRequest::new(&transition.name);
                request.triggered_by = vec![TriggeredBy {
                    task_id: task_ex.id.clone(),
                    event,
                }];
                request.in_context = outbound_ctx.clone();
                if target.map(TaskSpec::has_join).unwrap_or(false) {
                    request.unique_key = Some(join_unique_key(&self.wf_ex.id, &transition.name));
                    request.waiting = true;
                }
                if target.map(|t| t.get_parent).unwrap_or(false) {
                    request.parent_result = task_ex.state_info.clone();
                }
                requests.push(request);
            }
        }
        Ok(requests)
    }

    /// Spec of a transition target; `None` for engine pseudo-tasks.
    fn target_spec(&self, name: &str) -> AppResult<Option<&'a TaskSpec>> {
        match self.spec.task(name) {
            Some(spec) => Ok(Some(spec)),
            None if is_engine_command(name) => Ok(None),
            None => Err(AppError::Graph(format!("task '{}' missing", name))),
        }
    }

    /// Logical state of a (join) task derived from its inbound tasks.
    pub async fn logic_task_state(&self, task_ex: &TaskExecution) -> AppResult<LogicState> {
        let Some(task_spec) = self.spec.task(&task_ex.name) else {
            return Ok(LogicState::new(task_ex.state));
        };
        let Some(join) = task_spec.join else {
            return Ok(LogicState::new(task_ex.state));
        };

        let inbound = self.spec.inbound_task_specs(&task_spec.name);
        if inbound.is_empty() {
            return Ok(LogicState::new(State::Running));
        }

        let executions = self.prepare_task_executions(task_spec).await?;
        let induced: Vec<(&str, InducedState)> = inbound
            .iter()
            .map(|spec| {
                (
                    spec.name.as_str(),
                    self.induced_state(spec, &task_spec.name, &executions),
                )
            })
            .collect();

        Ok(aggregate_join(join, &induced))
    }

    fn induced_state(
        &self,
        inbound: &TaskSpec,
        join_name: &str,
        executions: &HashMap<String, Option<TaskExecution>>,
    ) -> InducedState {
        match executions.get(&inbound.name).and_then(Option::as_ref) {
            None => {
                let mut visited = BTreeSet::new();
                if self.possible_route(inbound, executions, &mut visited) {
                    InducedState::of(State::Waiting)
                } else {
                    InducedState::of(State::Error)
                }
            }
            Some(ex) if ex.state.is_incomplete() => InducedState::of(State::Waiting),
            Some(ex) => match ex.next_task_event(join_name) {
                None => InducedState::of(State::Error),
                Some(event) => InducedState {
                    state: State::Running,
                    triggered_by: Some(TriggeredBy {
                        task_id: ex.id.clone(),
                        event,
                    }),
                },
            },
        }
    }

    /// Whether execution can still reach `spec`.
    pub fn possible_route(
        &self,
        spec: &TaskSpec,
        executions: &HashMap<String, Option<TaskExecution>>,
        visited: &mut BTreeSet<String>,
    ) -> bool {
        if !visited.insert(spec.name.clone()) {
            return false;
        }

        let inbound = self.spec.inbound_task_specs(&spec.name);
        if inbound.is_empty() {
            return true;
        }

        for parent in inbound {
            match executions.get(&parent.name).and_then(Option::as_ref) {
                None => {
                    if self.possible_route(parent, executions, visited) {
                        return true;
                    }
                }
                Some(ex) if ex.state.is_incomplete() => return true,
                Some(ex) if ex.has_next_task(&spec.name) => return true,
                Some(_) => {}
            }
        }
        false
    }

    /// Latest execution of every ancestor of `spec`, keyed by task name.
    pub async fn prepare_task_executions(
        &self,
        spec: &TaskSpec,
    ) -> AppResult<HashMap<String, Option<TaskExecution>>> {
        let ancestors: Vec<String> = self.spec.ancestor_names(&spec.name).into_iter().collect();
        let mut executions: HashMap<String, Option<TaskExecution>> =
            ancestors.iter().map(|name| (name.clone(), None)).collect();
        if ancestors.is_empty() {
            return Ok(executions);
        }

        let found = self
            .store
            .find_task_executions(&self.filter().names(ancestors))
            .await?;
        for ex in found {
            executions.insert(ex.name.clone(), Some(ex));
        }
        Ok(executions)
    }

    pub fn may_complete_workflow(&self, task_ex: &TaskExecution) -> bool {
        task_ex.state.is_completed() && !task_ex.has_next_tasks
    }

    /// Merged outbound context of every leaf task execution.
    pub async fn evaluate_workflow_final_context(&self) -> AppResult<Value> {
        let leaves = self
            .store
            .find_task_executions(
                &self
                    .filter()
                    .states(&State::COMPLETED)
                    .has_next_tasks(false),
            )
            .await?;

        let mut ctx = Map::new();
        for ex in &leaves {
            merge_into(&mut ctx, &ex.in_context);
            merge_into(&mut ctx, &ex.published);
        }
        Ok(Value::Object(ctx))
    }

    pub async fn any_cancels(&self) -> AppResult<bool> {
        Ok(!self
            .store
            .find_task_executions(&self.filter().states(&[State::Cancelled]))
            .await?
            .is_empty())
    }

    pub async fn all_error_handled(&self) -> AppResult<bool> {
        Ok(self
            .store
            .find_task_executions(&self.filter().states(&[State::Error]).error_handled(false))
            .await?
            .is_empty())
    }

    pub fn is_error_handled(&self, task_ex: &TaskExecution) -> bool {
        self.spec.has_on_error_clause(&task_ex.name)
    }

    /// Existing join executions downstream of `task_name` whose state may
    /// have changed.
    pub async fn find_indirectly_affected_task_executions(
        &self,
        task_name: &str,
    ) -> AppResult<Vec<TaskExecution>> {
        let joins = self.spec.join_task_names();
        let mut visited: BTreeSet<String> = BTreeSet::from([task_name.to_string()]);
        let mut stack = self.spec.outbound_names(task_name);
        let mut affected = Vec::new();

        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) || is_engine_command(&name) {
                continue;
            }
            if joins.contains(&name) {
                let key = join_unique_key(&self.wf_ex.id, &name);
                let found = self
                    .store
                    .find_task_executions(&self.filter().unique_key(key))
                    .await?;
                if let Some(ex) = found.into_iter().last() {
                    affected.push(ex);
                    continue;
                }
            }
            stack.extend(self.spec.outbound_names(&name));
        }
        Ok(affected)
    }
}

fn aggregate_join(join: Join, induced: &[(&str, InducedState)]) -> LogicState {
    let names_in = |state: State| -> Vec<&str> {
        induced
            .iter()
            .filter(|(_, s)| s.state == state)
            .map(|(name, _)| *name)
            .collect()
    };
    let running_triggers: Vec<TriggeredBy> = induced
        .iter()
        .filter(|(_, s)| s.state == State::Running)
        .filter_map(|(_, s)| s.triggered_by.clone())
        .collect();

    let total = induced.len() as i64;
    let running = names_in(State::Running).len() as i64;
    let errors = names_in(State::Error);

    let (required, fail_now) = match join {
        Join::All => (total, !errors.is_empty()),
        Join::Count(n) => {
            let n = n as i64;
            (n, errors.len() as i64 > total - n)
        }
    };

    if running >= required {
        let mut state = LogicState::new(State::Running);
        state.triggered_by = running_triggers;
        return state;
    }
    if fail_now {
        return LogicState::new(State::Error).with_info(format!("Failed by tasks: {}", errors.join(",")));
    }

    let mut state = LogicState::new(State::Waiting)
        .with_info(format!("Blocked by tasks: {}", names_in(State::Waiting).join(",")));
    state.cardinality = (required - running).max(0) as u32;
    state.triggered_by = running_triggers;
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TaskType;
    use crate::expression::JinjaEvaluator;
    use crate::store::MemoryStore;
    use serde_json::json;

    const GRAPH: &str = r#"
name: graph
tasks:
  a:
    action: std.noop
    publish:
      from_a: yes
    on-success:
      - b
      - c: "{{ go_c }}"
    on-error:
      - handle
    on-complete:
      - audit
  b:
    action: std.noop
    on-success: [join_all, join_two]
  c:
    action: std.noop
    on-success: [join_all, join_two]
  d:
    action: std.noop
    on-success: [join_two]
  handle:
    action: std.noop
  audit:
    action: std.noop
  join_all:
    join: all
    on-success: [after_all]
  join_two:
    join: 2
  after_all:
    action: std.noop
    on-success: [join_all_again]
  join_all_again:
    join: all
"#;

    struct Fixture {
        store: MemoryStore,
        evaluator: JinjaEvaluator,
        wf_ex: WorkflowExecution,
        spec: WorkflowSpec,
    }

    impl Fixture {
        fn new() -> Self {
            let spec = WorkflowSpec::from_yaml(GRAPH).unwrap();
            let mut wf_ex = WorkflowExecution::new("graph", "", spec.to_value().unwrap());
            wf_ex.state = State::Running;
            wf_ex.input = json!({"go_c": true});
            Self {
                store: MemoryStore::new(),
                evaluator: JinjaEvaluator::new(),
                wf_ex,
                spec,
            }
        }

        fn controller(&self) -> FlowController<'_> {
            FlowController::new(&self.store, &self.evaluator, &self.wf_ex, &self.spec)
        }

        async fn add(&self, name: &str, state: State, next: &[(&str, TransitionEvent)]) -> TaskExecution {
            let mut ex = TaskExecution::new(&self.wf_ex, name, TaskType::Action, json!({}));
            ex.state = state;
            ex.next_tasks = next.iter().map(|(n, e)| (n.to_string(), *e)).collect();
            ex.has_next_tasks = !ex.next_tasks.is_empty();
            ex.processed = state.is_completed();
            if self.spec.task(name).map(TaskSpec::has_join).unwrap_or(false) {
                ex.unique_key = Some(join_unique_key(&self.wf_ex.id, name));
            }
            assert!(self.store.insert_task_execution(&ex).await.unwrap());
            ex
        }
    }

    fn names(requests: &[TaskRequest]) -> Vec<&str> {
        requests.iter().map(|r| r.task_name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_start_tasks() {
        let f = Fixture::new();
        let requests = f.controller().next_tasks(None).await.unwrap();
        assert_eq!(names(&requests), vec!["a", "d"]);
        assert!(requests.iter().all(|r| r.triggered_by.is_empty()));
    }

    #[tokio::test]
    async fn test_success_fires_success_and_complete() {
        let f = Fixture::new();
        let mut a = f.add("a", State::Success, &[]).await;
        a.published = json!({"from_a": true});

        let requests = f.controller().next_tasks_for_task(&a).unwrap();
        assert_eq!(names(&requests), vec!["b", "c", "audit"]);
        assert_eq!(requests[0].event(), Some(TransitionEvent::OnSuccess));
        assert_eq!(requests[2].event(), Some(TransitionEvent::OnComplete));
        assert_eq!(requests[0].in_context["from_a"], json!(true));
        assert_eq!(requests[0].triggered_by[0].task_id, a.id);
    }

    #[tokio::test]
    async fn test_false_guard_does_not_fire() {
        let mut f = Fixture::new();
        f.wf_ex.input = json!({"go_c": false});
        let a = f.add("a", State::Success, &[]).await;
        let requests = f.controller().next_tasks_for_task(&a).unwrap();
        assert_eq!(names(&requests), vec!["b", "audit"]);
    }

    #[tokio::test]
    async fn test_error_fires_error_and_complete() {
        let f = Fixture::new();
        let a = f.add("a", State::Error, &[]).await;
        let requests = f.controller().next_tasks_for_task(&a).unwrap();
        assert_eq!(names(&requests), vec!["handle", "audit"]);
        assert_eq!(
            next_task_pairs(&requests),
            vec![
                ("handle".to_string(), TransitionEvent::OnError),
                ("audit".to_string(), TransitionEvent::OnComplete)
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_fires_nothing() {
        let f = Fixture::new();
        let a = f.add("a", State::Cancelled, &[]).await;
        assert!(f.controller().next_tasks_for_task(&a).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_targets_wait_with_unique_key() {
        let f = Fixture::new();
        let b = f.add("b", State::Success, &[]).await;
        let requests = f.controller().next_tasks_for_task(&b).unwrap();
        assert_eq!(names(&requests), vec!["join_all", "join_two"]);
        assert!(requests.iter().all(|r| r.waiting));
        assert_eq!(
            requests[0].unique_key.as_deref(),
            Some(join_unique_key(&f.wf_ex.id, "join_all").as_str())
        );
    }

    #[tokio::test]
    async fn test_next_tasks_includes_idle_executions() {
        let f = Fixture::new();
        let a = f.add("a", State::Success, &[("b", TransitionEvent::OnSuccess)]).await;
        let idle = f.add("b", State::Idle, &[]).await;

        let requests = f.controller().next_tasks(Some(&a)).await.unwrap();
        assert_eq!(requests[0].task_execution_id.as_deref(), Some(idle.id.as_str()));
    }

    #[tokio::test]
    async fn test_next_tasks_of_unprocessed_completions() {
        let f = Fixture::new();
        let mut ex = TaskExecution::new(&f.wf_ex, "b", TaskType::Action, json!({}));
        ex.state = State::Success;
        f.store.insert_task_execution(&ex).await.unwrap();
        f.add("c", State::Success, &[("join_all", TransitionEvent::OnSuccess)]).await;

        let requests = f.controller().next_tasks(None).await.unwrap();
        assert_eq!(names(&requests), vec!["join_all", "join_two"]);
    }

    #[tokio::test]
    async fn test_join_all_waits_then_runs() {
        let f = Fixture::new();
        f.add("b", State::Success, &[("join_all", TransitionEvent::OnSuccess)]).await;
        let c = f.add("c", State::Running, &[]).await;
        let join = f.add("join_all", State::Waiting, &[]).await;

        let state = f.controller().logic_task_state(&join).await.unwrap();
        assert_eq!(state.state, State::Waiting);
        assert_eq!(state.cardinality, 1);
        assert_eq!(state.state_info.as_deref(), Some("Blocked by tasks: c"));

        let mut c = c;
        c.state = State::Success;
        c.next_tasks = vec![("join_all".to_string(), TransitionEvent::OnSuccess)];
        c.has_next_tasks = true;
        f.store.update_task_execution(&c).await.unwrap();
        f.store
            .transition_task_state(&c.id, State::Running, State::Success, None, Some(true))
            .await
            .unwrap();

        let state = f.controller().logic_task_state(&join).await.unwrap();
        assert_eq!(state.state, State::Running);
        assert_eq!(state.triggered_by.len(), 2);
    }

    #[tokio::test]
    async fn test_join_all_fails_when_inbound_not_triggered() {
        let f = Fixture::new();
        f.add("b", State::Success, &[("join_all", TransitionEvent::OnSuccess)]).await;
        f.add("c", State::Error, &[]).await;
        let join = f.add("join_all", State::Waiting, &[]).await;

        let state = f.controller().logic_task_state(&join).await.unwrap();
        assert_eq!(state.state, State::Error);
        assert_eq!(state.state_info.as_deref(), Some("Failed by tasks: c"));
    }

    #[tokio::test]
    async fn test_join_two_of_three() {
        let f = Fixture::new();
        f.add("b", State::Success, &[("join_two", TransitionEvent::OnSuccess)]).await;
        f.add("d", State::Running, &[]).await;
        let join = f.add("join_two", State::Waiting, &[]).await;

        let state = f.controller().logic_task_state(&join).await.unwrap();
        assert_eq!(state.state, State::Waiting);
        assert_eq!(state.cardinality, 1);

        f.add("c", State::Success, &[("join_two", TransitionEvent::OnSuccess)]).await;
        let state = f.controller().logic_task_state(&join).await.unwrap();
        assert_eq!(state.state, State::Running);
        assert_eq!(state.triggered_by.len(), 2);
    }

    #[tokio::test]
    async fn test_join_two_fails_when_two_inbound_failed() {
        let f = Fixture::new();
        f.add("b", State::Error, &[]).await;
        f.add("c", State::Error, &[]).await;
        f.add("d", State::Success, &[("join_two", TransitionEvent::OnSuccess)]).await;
        let join = f.add("join_two", State::Waiting, &[]).await;

        let state = f.controller().logic_task_state(&join).await.unwrap();
        assert_eq!(state.state, State::Error);
    }

    #[tokio::test]
    async fn test_impossible_route() {
        let f = Fixture::new();
        f.add("a", State::Success, &[("c", TransitionEvent::OnSuccess)]).await;
        f.add("c", State::Success, &[("join_all", TransitionEvent::OnSuccess)]).await;
        let join = f.add("join_all", State::Waiting, &[]).await;

        let state = f.controller().logic_task_state(&join).await.unwrap();
        assert_eq!(state.state, State::Error);
        assert_eq!(state.state_info.as_deref(), Some("Failed by tasks: b"));
    }

    #[tokio::test]
    async fn test_non_join_keeps_persisted_state() {
        let f = Fixture::new();
        let b = f.add("b", State::Running, &[]).await;
        let state = f.controller().logic_task_state(&b).await.unwrap();
        assert_eq!(state.state, State::Running);
    }

    #[tokio::test]
    async fn test_final_context_merges_leaves() {
        let f = Fixture::new();
        let mut leaf = TaskExecution::new(&f.wf_ex, "handle", TaskType::Action, json!({}));
        leaf.state = State::Success;
        leaf.in_context = json!({"x": 1, "y": 1});
        leaf.published = json!({"y": 2});
        f.store.insert_task_execution(&leaf).await.unwrap();
        f.add("a", State::Success, &[("b", TransitionEvent::OnSuccess)]).await;

        let ctx = f.controller().evaluate_workflow_final_context().await.unwrap();
        assert_eq!(ctx, json!({"x": 1, "y": 2}));
    }

    #[tokio::test]
    async fn test_error_handling_checks() {
        let f = Fixture::new();
        assert!(f.controller().all_error_handled().await.unwrap());
        let b = f.add("b", State::Error, &[]).await;
        assert!(!f.controller().all_error_handled().await.unwrap());
        assert!(!f.controller().is_error_handled(&b));
        let a = f.add("a", State::Error, &[]).await;
        assert!(f.controller().is_error_handled(&a));
        assert!(!f.controller().any_cancels().await.unwrap());
    }

    #[tokio::test]
    async fn test_indirectly_affected_joins() {
        let f = Fixture::new();
        assert!(f
            .controller()
            .find_indirectly_affected_task_executions("a")
            .await
            .unwrap()
            .is_empty());

        let join = f.add("join_all", State::Waiting, &[]).await;
        let affected = f
            .controller()
            .find_indirectly_affected_task_executions("a")
            .await
            .unwrap();
        assert_eq!(affected.len(), 1);
        assert_eq!(affected[0].id, join.id);
    }

    #[tokio::test]
    async fn test_missing_target_is_graph_error() {
        let f = Fixture::new();
        let err = f.controller().target_spec("nope").unwrap_err();
        assert!(matches!(err, AppError::Graph(msg) if msg == "task 'nope' missing"));
        assert!(f.controller().target_spec("noop").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completed_workflow_has_no_next_tasks() {
        let mut f = Fixture::new();
        f.wf_ex.state = State::Success;
        assert!(f.controller().next_tasks(None).await.unwrap().is_empty());
    }

    #[test]
    fn test_task_request_backlog_round_trip() {
        let mut request = TaskRequest::new("b");
        request.waiting = true;
        request.unique_key = Some("join-task-1-b".to_string());
        let value = serde_json::to_value(&request).unwrap();
        let restored: TaskRequest = serde_json::from_value(value).unwrap();
        assert_eq!(restored, request);
    }
}
