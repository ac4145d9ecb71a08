//! Actions: the unit of work a task hands to an executor.
//!
//! A task resolves its action name to one of three kinds. A command action
//! runs a plugin directly. An ad-hoc action wraps a chain of stored specs
//! around a command action. A workflow action starts a sub-workflow.

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

use super::workflow::StartWorkflowRequest;
use super::Engine;
use crate::context::ExecContext;
use crate::db::models::{json_set, ActionDefinition, ActionExecution, TaskExecution, WorkflowExecution};
use crate::error::{AppError, AppResult};
use crate::executor::{ActionCompletion, ActionRequest, ActionResult};
use crate::expression::{merge_contexts, DataContext, Evaluator};
use crate::spec::{parse_input_declaration, ActionSpec, WorkflowSpec};

use super::states::State;

/// Runtime-context key naming the ad-hoc definition of an action execution.
const AD_HOC_ACTION_NAME: &str = "adhoc_action_name";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    Command(CommandAction),
    AdHoc(AdHocAction),
    Workflow(WorkflowAction),
}

/// An action the executor runs as-is.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CommandAction {
    name: String,
    /// Plugin the executor dispatches on.
    plugin: String,
    defaults: Map<String, Value>,
    required: Vec<String>,
    attributes: Value,
}

impl CommandAction {
    /// Plugin known to the executor without a stored definition.
    pub(crate) fn plugin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            plugin: name.to_string(),
            defaults: Map::new(),
            required: Vec::new(),
            attributes: json!({}),
        }
    }

    fn from_definition(def: &ActionDefinition) -> AppResult<Self> {
        let declaration = parse_input_declaration(&def.input)?;
        let plugin = if def.action_class.is_empty() {
            def.name.clone()
        } else {
            def.action_class.clone()
        };
        Ok(Self {
            name: def.name.clone(),
            plugin,
            required: declaration.required().cloned().collect(),
            defaults: declaration.defaults,
            attributes: def.attributes.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AdHocAction {
    name: String,
    /// Ad-hoc specs, outermost first.
    layers: Vec<ActionSpec>,
    command: CommandAction,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WorkflowAction {
    name: String,
}

impl WorkflowAction {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Where and for whom an action is scheduled.
pub(crate) struct ScheduleRequest<'a> {
    pub ctx: &'a ExecContext,
    pub wf_ex: &'a WorkflowExecution,
    pub task_ex: &'a TaskExecution,
    /// Context the input was evaluated against.
    pub data_ctx: &'a DataContext,
    pub target: Option<String>,
    pub timeout: Option<u64>,
    pub index: usize,
}

/// Candidate definition names for `name` referenced from workflow `wf_name`.
///
/// A workflow named `book.flow` lives in workbook `book`; its references are
/// looked up as `book.<name>` first.
pub(crate) fn qualified_names(wf_name: &str, name: &str) -> Vec<String> {
    match wf_name.rsplit_once('.') {
        Some((book, _)) if !name.starts_with(&format!("{}.", book)) => {
            vec![format!("{}.{}", book, name), name.to_string()]
        }
        _ => vec![name.to_string()],
    }
}

/// Text form of a result value; strings lose their quotes.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn error_output(result: &ActionResult) -> Value {
    let error = result.error.clone().unwrap_or_default();
    match &result.data {
        Value::Null => Value::String(error),
        data => Value::String(format!("{}:[{}]", error, value_text(data))),
    }
}

impl Action {
    pub(crate) fn name(&self) -> &str {
        match self {
            Action::Command(c) => &c.name,
            Action::AdHoc(a) => &a.name,
            Action::Workflow(w) => &w.name,
        }
    }

    /// Check that every required input is present.
    pub(crate) fn validate_input(&self, input: &Map<String, Value>) -> AppResult<()> {
        let missing: Vec<String> = match self {
            Action::Command(c) => c
                .required
                .iter()
                .filter(|name| !input.contains_key(*name))
                .cloned()
                .collect(),
            Action::AdHoc(a) => a
                .layers
                .first()
                .map(ActionSpec::required_inputs)
                .unwrap_or_default()
                .into_iter()
                .filter(|name| !input.contains_key(name))
                .collect(),
            Action::Workflow(_) => Vec::new(),
        };

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(format!(
                "Invalid input [action={}, missing=[{}]]",
                self.name(),
                missing.join(", ")
            )))
        }
    }

    /// Input handed to the executor: defaults merged, ad-hoc layers applied.
    pub(crate) fn prepare_input(
        &self,
        evaluator: &dyn Evaluator,
        input: &Map<String, Value>,
        data_ctx: &DataContext,
    ) -> AppResult<Map<String, Value>> {
        let (command, mut current) = match self {
            Action::Command(c) => (c, input.clone()),
            Action::AdHoc(a) => {
                let mut current = input.clone();
                for layer in &a.layers {
                    let mut layer_input = layer.input_defaults();
                    layer_input.extend(current);

                    let mut ctx = data_ctx.clone();
                    ctx.extend(layer_input.into_iter());
                    current = match evaluator
                        .evaluate_recursively(&Value::Object(layer.base_input.clone()), &ctx)?
                    {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    };
                }
                (&a.command, current)
            }
            Action::Workflow(_) => return Ok(input.clone()),
        };

        let mut prepared = command.defaults.clone();
        prepared.append(&mut current);
        Ok(prepared)
    }

    /// Record the action execution and hand it to the executor.
    pub(crate) async fn schedule(
        &self,
        engine: &Engine,
        req: ScheduleRequest<'_>,
        input: Map<String, Value>,
    ) -> AppResult<()> {
        let command = match self {
            Action::Command(c) => c,
            Action::AdHoc(a) => &a.command,
            Action::Workflow(w) => return engine.start_sub_workflow(w, req, input).await,
        };

        let prepared = self.prepare_input(engine.evaluator.as_ref(), &input, req.data_ctx)?;
        let mut action_ex = ActionExecution::new(
            &command.name,
            req.task_ex,
            Value::Object(prepared.clone()),
            req.index,
        );
        if let Action::AdHoc(a) = self {
            json_set(&mut action_ex.runtime_context, AD_HOC_ACTION_NAME, json!(a.name));
        }
        engine.store.insert_action_execution(&action_ex).await?;

        tracing::debug!(
            action = %self.name(),
            plugin = %command.plugin,
            action_execution_id = %action_ex.id,
            task = %req.task_ex.name,
            index = req.index,
            "Scheduled action"
        );

        let request = ActionRequest {
            action_execution_id: action_ex.id.clone(),
            action_name: command.plugin.clone(),
            input: Value::Object(prepared),
            attributes: command.attributes.clone(),
            target: req.target,
            timeout_secs: engine.config.action_timeout(req.timeout).as_secs(),
            workflow_execution_id: Some(req.wf_ex.id.clone()),
            task_execution_id: Some(req.task_ex.id.clone()),
            project_id: req.task_ex.project_id.clone(),
        };
        engine.spawn_run_action(req.ctx.child(), request);
        Ok(())
    }

    /// Record the result. Returns `false` when it had already been recorded.
    pub(crate) async fn complete(
        &self,
        engine: &Engine,
        action_ex_id: &str,
        result: &ActionResult,
    ) -> AppResult<bool> {
        if let Action::Workflow(_) = self {
            return Ok(true);
        }

        let mut action_ex = engine
            .store
            .get_action_execution(action_ex_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("action execution {}", action_ex_id)))?;
        if action_ex.state.is_completed() {
            tracing::debug!(
                action_execution_id = %action_ex_id,
                state = %action_ex.state,
                "Action execution already completed"
            );
            return Ok(false);
        }

        let output = if result.is_success() {
            self.transform_output(engine.evaluator.as_ref(), result.data.clone())?
        } else if result.is_cancel() {
            result.data.clone()
        } else {
            error_output(result)
        };

        action_ex.state = result.state();
        action_ex.state_info = result.error.clone();
        action_ex.outputs = json!({ "result": output });
        action_ex.finished_at = Some(Utc::now());
        engine.store.update_action_execution(&action_ex).await?;
        Ok(true)
    }

    /// Apply ad-hoc `output` transforms, innermost definition first.
    fn transform_output(&self, evaluator: &dyn Evaluator, data: Value) -> AppResult<Value> {
        let Action::AdHoc(a) = self else {
            return Ok(data);
        };

        let mut data = data;
        for layer in a.layers.iter().rev() {
            if let Some(output) = &layer.output {
                let mut ctx = merge_contexts([&data]);
                ctx.insert("result".to_string(), data.clone());
                data = evaluator.evaluate_recursively(output, &ctx)?;
            }
        }
        Ok(data)
    }

    /// Force the action (or sub-workflow) into ERROR.
    pub(crate) async fn fail(&self, engine: &Engine, action_ex_id: &str, message: &str) -> AppResult<()> {
        if let Action::Workflow(_) = self {
            let Some(wf_ex) = engine.store.get_workflow_execution(action_ex_id).await? else {
                return Ok(());
            };
            if wf_ex.state.is_completed() {
                return Ok(());
            }
            if engine
                .store
                .transition_workflow_state(&wf_ex.id, wf_ex.state, State::Error, Some(message))
                .await?
            {
                engine
                    .store
                    .update_workflow_execution(
                        &wf_ex.id,
                        crate::store::WorkflowExecutionPatch {
                            output: Some(json!({ "result": message })),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            return Ok(());
        }

        let Some(mut action_ex) = engine.store.get_action_execution(action_ex_id).await? else {
            return Ok(());
        };
        if action_ex.state.is_completed() {
            return Ok(());
        }
        action_ex.state = State::Error;
        action_ex.state_info = Some(message.to_string());
        action_ex.outputs = json!({ "result": message });
        action_ex.finished_at = Some(Utc::now());
        engine.store.update_action_execution(&action_ex).await
    }
}

impl Engine {
    async fn find_action_definition(
        &self,
        wf_ex: &WorkflowExecution,
        name: &str,
    ) -> AppResult<Option<ActionDefinition>> {
        for candidate in qualified_names(&wf_ex.name, name) {
            if let Some(def) = self.store.find_action_definition(&candidate).await? {
                return Ok(Some(def));
            }
        }
        Ok(None)
    }

    /// Resolve an action name referenced by a task of `wf_ex`.
    pub(crate) async fn resolve_action(&self, wf_ex: &WorkflowExecution, name: &str) -> AppResult<Action> {
        match self.find_action_definition(wf_ex, name).await? {
            Some(def) if def.is_ad_hoc() => self.resolve_ad_hoc(wf_ex, def).await.map(Action::AdHoc),
            Some(def) => CommandAction::from_definition(&def).map(Action::Command),
            None if self.executor.supports(name) => Ok(Action::Command(CommandAction::plugin(name))),
            None => Err(AppError::NotFound(format!(
                "failed to find action [action_name={}]",
                name
            ))),
        }
    }

    async fn resolve_ad_hoc(&self, wf_ex: &WorkflowExecution, def: ActionDefinition) -> AppResult<AdHocAction> {
        let name = def.name.clone();
        let mut visited = BTreeSet::from([def.name.clone()]);
        let mut layers = Vec::new();
        let mut current = def;

        loop {
            let spec = ActionSpec::from_value(current.spec.clone().unwrap_or(Value::Null))?;
            let base = spec.base.clone();
            layers.push(spec);

            if !visited.insert(base.clone()) {
                return Err(AppError::Validation(format!(
                    "ad-hoc action cycle [action_name={}, base={}]",
                    name, base
                )));
            }

            let command = match self.find_action_definition(wf_ex, &base).await? {
                Some(next) if next.is_ad_hoc() => {
                    current = next;
                    continue;
                }
                Some(next) => CommandAction::from_definition(&next)?,
                None if self.executor.supports(&base) => CommandAction::plugin(&base),
                None => {
                    return Err(AppError::NotFound(format!(
                        "failed to find action [action_name={}]",
                        base
                    )))
                }
            };
            return Ok(AdHocAction {
                name,
                layers,
                command,
            });
        }
    }

    /// Rebuild the action behind a stored action execution.
    pub(crate) async fn action_for_execution(
        &self,
        wf_ex: &WorkflowExecution,
        action_ex: &ActionExecution,
    ) -> AppResult<Action> {
        match action_ex.ad_hoc_action_name() {
            Some(name) => self.resolve_action(wf_ex, name).await,
            None => Ok(Action::Command(CommandAction::plugin(&action_ex.name))),
        }
    }

    /// Hand a request to the executor after the completion delay; an
    /// executor error is fed back as a failed completion.
    fn spawn_run_action(&self, ctx: ExecContext, request: ActionRequest) {
        let engine = self.clone();
        let fut = async move {
            let action_ex_id = request.action_execution_id.clone();
            if let Err(e) = engine.executor.run_action(request).await {
                tracing::warn!(
                    action_execution_id = %action_ex_id,
                    error = %e,
                    "Executor rejected action"
                );
                let completion = ActionCompletion::new(action_ex_id, ActionResult::failure(e.to_string()));
                engine.on_action_complete(ctx, completion).await?;
            }
            Ok(())
        }
        .boxed();
        self.spawn_after("run action", self.config.completion_delay(), fut);
    }

    async fn start_sub_workflow(
        &self,
        action: &WorkflowAction,
        req: ScheduleRequest<'_>,
        input: Map<String, Value>,
    ) -> AppResult<()> {
        let namespace = req
            .wf_ex
            .param_str("namespace")
            .unwrap_or(&req.wf_ex.namespace)
            .to_string();

        let mut def = None;
        for candidate in qualified_names(&req.wf_ex.name, &action.name) {
            def = self.store.find_workflow_definition(&candidate, &namespace).await?;
            if def.is_some() {
                break;
            }
        }
        let def = def.ok_or_else(|| {
            AppError::NotFound(format!(
                "failed to find workflow [name={}, namespace={}]",
                action.name, namespace
            ))
        })?;

        let spec = WorkflowSpec::from_value(def.spec.clone())?;
        let declared = spec.input_names();
        let (wf_input, mut params): (Map<String, Value>, Map<String, Value>) =
            input.into_iter().partition(|(k, _)| declared.contains(k));

        let root = req
            .wf_ex
            .root_execution_id
            .clone()
            .unwrap_or_else(|| req.wf_ex.id.clone());
        params.insert("root_execution_id".to_string(), json!(root));
        params.insert("task_execution_id".to_string(), json!(req.task_ex.id));
        params.insert("index".to_string(), json!(req.index));
        params.insert("namespace".to_string(), json!(namespace));
        params.insert("env".to_string(), req.wf_ex.env());

        let request = StartWorkflowRequest {
            name: def.name,
            namespace,
            description: Some("sub-workflow execution".to_string()),
            input: wf_input,
            params,
            ..StartWorkflowRequest::default()
        };
        let sub_wf_ex = self.start_workflow(&req.ctx.child(), request).await?;

        tracing::info!(
            workflow = %sub_wf_ex.name,
            execution_id = %sub_wf_ex.id,
            parent_task = %req.task_ex.name,
            "Started sub-workflow"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::JinjaEvaluator;

    fn ad_hoc(layers: Vec<ActionSpec>) -> Action {
        Action::AdHoc(AdHocAction {
            name: layers[0].name.clone(),
            layers,
            command: CommandAction::plugin("std.echo"),
        })
    }

    fn greet() -> ActionSpec {
        ActionSpec::from_yaml(
            r#"
name: greet
base: std.echo
base-input:
  output: "Hello, {{ who }}{{ punctuation }}"
input:
  - who
  - punctuation: "!"
output:
  greeting: "{{ result }}"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_qualified_names() {
        assert_eq!(qualified_names("book.flow", "act"), vec!["book.act", "act"]);
        assert_eq!(qualified_names("book.flow", "book.act"), vec!["book.act"]);
        assert_eq!(qualified_names("flow", "act"), vec!["act"]);
        assert_eq!(qualified_names("a.b.flow", "act"), vec!["a.b.act", "act"]);
    }

    #[test]
    fn test_error_output() {
        assert_eq!(error_output(&ActionResult::failure("boom")), json!("boom"));
        let result = ActionResult {
            data: json!({"code": 2}),
            error: Some("boom".to_string()),
            cancel: false,
        };
        assert_eq!(error_output(&result), json!("boom:[{\"code\":2}]"));
    }

    #[test]
    fn test_command_validation() {
        let def = ActionDefinition::plugin("http", "std.http", "url, method=\"GET\"");
        let action = Action::Command(CommandAction::from_definition(&def).unwrap());

        let err = action.validate_input(&Map::new()).unwrap_err();
        assert!(matches!(err, AppError::Validation(msg) if msg.contains("missing=[url]")));

        let mut input = Map::new();
        input.insert("url".to_string(), json!("http://x"));
        action.validate_input(&input).unwrap();

        let prepared = action
            .prepare_input(&JinjaEvaluator::new(), &input, &DataContext::new())
            .unwrap();
        assert_eq!(prepared["method"], json!("GET"));
        assert_eq!(prepared["url"], json!("http://x"));
    }

    #[test]
    fn test_ad_hoc_input_and_output() {
        let action = ad_hoc(vec![greet()]);
        assert!(action.validate_input(&Map::new()).is_err());

        let mut input = Map::new();
        input.insert("who".to_string(), json!("Bob"));
        action.validate_input(&input).unwrap();

        let evaluator = JinjaEvaluator::new();
        let prepared = action.prepare_input(&evaluator, &input, &DataContext::new()).unwrap();
        assert_eq!(prepared["output"], json!("Hello, Bob!"));

        let output = action.transform_output(&evaluator, json!("Hello, Bob!")).unwrap();
        assert_eq!(output, json!({"greeting": "Hello, Bob!"}));
    }

    #[test]
    fn test_nested_ad_hoc_layers() {
        let outer = ActionSpec::from_yaml(
            r#"
name: shout
base: greet
base-input:
  who: "{{ name | upper }}"
input: [name]
output: "{{ greeting }}"
"#,
        )
        .unwrap();
        let action = ad_hoc(vec![outer, greet()]);
        let evaluator = JinjaEvaluator::new();

        let mut input = Map::new();
        input.insert("name".to_string(), json!("bob"));
        let prepared = action.prepare_input(&evaluator, &input, &DataContext::new()).unwrap();
        assert_eq!(prepared["output"], json!("Hello, BOB!"));

        let output = action.transform_output(&evaluator, json!("Hello, BOB!")).unwrap();
        assert_eq!(output, json!("Hello, BOB!"));
    }

    #[test]
    fn test_workflow_action_input_untouched() {
        let action = Action::Workflow(WorkflowAction::new("child"));
        let mut input = Map::new();
        input.insert("x".to_string(), json!(1));
        action.validate_input(&input).unwrap();
        let prepared = action
            .prepare_input(&JinjaEvaluator::new(), &input, &DataContext::new())
            .unwrap();
        assert_eq!(prepared, input);
    }
}
