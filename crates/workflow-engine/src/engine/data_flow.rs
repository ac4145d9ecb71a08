//! Data contexts for expressions, and variable publishing.

use serde_json::{json, Map, Value};

use crate::db::models::{TaskExecution, WorkflowExecution};
use crate::expression::{merge_contexts, DataContext, Evaluator};
use crate::error::AppResult;
use crate::spec::TaskSpec;

use super::states::State;

/// Context key exposing `{id, name}` of the current task execution.
pub(crate) const TASK_EXECUTION_KEY: &str = "__task_execution";
/// Context key exposing `params.env` of the workflow execution.
pub(crate) const ENV_KEY: &str = "__env";

pub(crate) fn task_execution_ref(task_ex: &TaskExecution) -> Value {
    json!({"id": task_ex.id, "name": task_ex.name})
}

/// Outbound context of a task: `in_context` overlaid with `published`.
pub(crate) fn task_context(task_ex: &TaskExecution) -> Value {
    let mut ctx = Map::new();
    merge_into(&mut ctx, &task_ex.in_context);
    merge_into(&mut ctx, &task_ex.published);
    Value::Object(ctx)
}

pub(crate) fn merge_into(target: &mut Map<String, Value>, layer: &Value) {
    if let Value::Object(map) = layer {
        for (k, v) in map {
            target.insert(k.clone(), v.clone());
        }
    }
}

/// Workflow-level context: `in_context`, `__env`, workflow context, input.
///
/// Later layers win, so workflow input shadows everything else.
pub(crate) fn workflow_data_context(wf_ex: &WorkflowExecution, in_context: &Value) -> DataContext {
    let env = json!({ ENV_KEY: wf_ex.env() });
    merge_contexts([in_context, &env, &wf_ex.context, &wf_ex.input])
}

/// Context for evaluating the input, targets and items of a task.
///
/// The task's inbound context is the top layer, so values published
/// upstream shadow workflow input of the same name.
pub(crate) fn task_input_context(wf_ex: &WorkflowExecution, task_ex: &TaskExecution) -> DataContext {
    let task_ref = json!({ TASK_EXECUTION_KEY: task_execution_ref(task_ex) });
    let env = json!({ ENV_KEY: wf_ex.env() });
    merge_contexts([&task_ref, &env, &wf_ex.context, &wf_ex.input, &task_ex.in_context])
}

/// Context for transition guards of a finished task.
pub(crate) fn task_data_context(wf_ex: &WorkflowExecution, task_ex: &TaskExecution) -> DataContext {
    let task_ref = json!({ TASK_EXECUTION_KEY: task_execution_ref(task_ex) });
    let env = json!({ ENV_KEY: wf_ex.env() });
    merge_contexts([
        &task_ref,
        &task_context(task_ex),
        &env,
        &wf_ex.context,
        &wf_ex.input,
    ])
}

/// Evaluate `publish` (SUCCESS) or `publish-on-error` (ERROR) of a task.
///
/// `result` is the task result and is visible to expressions as `result`.
pub(crate) fn publish_variables(
    evaluator: &dyn Evaluator,
    wf_ex: &WorkflowExecution,
    task_ex: &TaskExecution,
    spec: &TaskSpec,
    state: State,
    result: &Value,
) -> AppResult<Value> {
    let task_ref = json!({ TASK_EXECUTION_KEY: task_execution_ref(task_ex) });
    let env = json!({ ENV_KEY: wf_ex.env() });
    let mut ctx = merge_contexts([&task_ref, &task_ex.in_context, &env, &wf_ex.context, &wf_ex.input]);

    if ctx.contains_key(&task_ex.name) {
        tracing::warn!(
            task = %task_ex.name,
            "Shadowing context variable with task name while publishing"
        );
    }
    ctx.insert("result".to_string(), result.clone());

    let clause = match state {
        State::Success => spec.publish.as_ref(),
        State::Error => spec.publish_on_error.as_ref(),
        _ => None,
    };
    match clause {
        Some(clause) => evaluator.evaluate_recursively(clause, &ctx),
        None => Ok(Value::Object(Map::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TaskType;
    use crate::expression::JinjaEvaluator;

    fn executions() -> (WorkflowExecution, TaskExecution) {
        let mut wf_ex = WorkflowExecution::new("wf", "", json!({}));
        wf_ex.input = json!({"who": "input"});
        wf_ex.context = json!({"region": "eu"});
        wf_ex.params = json!({"env": {"stage": "dev"}});
        let mut task_ex = TaskExecution::new(&wf_ex, "a", TaskType::Action, json!({}));
        task_ex.in_context = json!({"who": "upstream", "x": 1});
        task_ex.published = json!({"x": 2});
        (wf_ex, task_ex)
    }

    #[test]
    fn test_task_data_context_layers() {
        let (wf_ex, task_ex) = executions();
        let ctx = task_data_context(&wf_ex, &task_ex);
        assert_eq!(ctx["x"], json!(2));
        assert_eq!(ctx["who"], json!("input"));
        assert_eq!(ctx["region"], json!("eu"));
        assert_eq!(ctx[ENV_KEY]["stage"], json!("dev"));
        assert_eq!(ctx[TASK_EXECUTION_KEY]["name"], json!("a"));
    }

    #[test]
    fn test_task_input_context_prefers_inbound_values() {
        let (wf_ex, task_ex) = executions();
        let ctx = task_input_context(&wf_ex, &task_ex);
        assert_eq!(ctx["who"], json!("upstream"));
        assert_eq!(ctx["x"], json!(1));
        assert_eq!(ctx["region"], json!("eu"));
        assert_eq!(ctx[ENV_KEY]["stage"], json!("dev"));
        assert_eq!(ctx[TASK_EXECUTION_KEY]["name"], json!("a"));
    }

    #[test]
    fn test_publish_on_success_and_error() {
        let (wf_ex, task_ex) = executions();
        let spec = TaskSpec {
            name: "a".to_string(),
            publish: Some(json!({"greeting": "{{ result }}"})),
            publish_on_error: Some(json!({"failed": true})),
            ..TaskSpec::default()
        };
        let evaluator = JinjaEvaluator::new();

        let published =
            publish_variables(&evaluator, &wf_ex, &task_ex, &spec, State::Success, &json!("Hi")).unwrap();
        assert_eq!(published, json!({"greeting": "Hi"}));

        let published =
            publish_variables(&evaluator, &wf_ex, &task_ex, &spec, State::Error, &Value::Null).unwrap();
        assert_eq!(published, json!({"failed": true}));

        let published =
            publish_variables(&evaluator, &wf_ex, &task_ex, &spec, State::Cancelled, &Value::Null).unwrap();
        assert_eq!(published, json!({}));
    }
}
