//! In-process executor with a registry of built-in plugins.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use super::{ActionCompletion, ActionExecutor, ActionRequest, ActionResult};
use crate::error::{AppError, AppResult};

/// An action implementation runnable in-process.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, input: &Value) -> ActionResult;
}

/// Runs plugins on the Tokio runtime and reports completions on a channel.
pub struct LocalExecutor {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    completions: UnboundedSender<ActionCompletion>,
}

impl LocalExecutor {
    /// Executor with no plugins.
    pub fn empty(completions: UnboundedSender<ActionCompletion>) -> Self {
        Self {
            plugins: HashMap::new(),
            completions,
        }
    }

    /// Executor with the `std.*` plugins.
    pub fn new(completions: UnboundedSender<ActionCompletion>) -> Self {
        let mut executor = Self::empty(completions);
        executor.register(NoopPlugin);
        executor.register(EchoPlugin);
        executor.register(FailPlugin);
        executor.register(SleepPlugin);
        executor
    }

    pub fn register<P: Plugin + 'static>(&mut self, plugin: P) {
        self.plugins.insert(plugin.name().to_string(), Arc::new(plugin));
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("plugins", &self.list())
            .finish()
    }
}

#[async_trait]
impl ActionExecutor for LocalExecutor {
    async fn run_action(&self, request: ActionRequest) -> AppResult<()> {
        let plugin = self
            .plugins
            .get(&request.action_name)
            .cloned()
            .ok_or_else(|| AppError::Executor(format!("unknown action '{}'", request.action_name)))?;
        let completions = self.completions.clone();

        tracing::debug!(
            action = %request.action_name,
            action_execution_id = %request.action_execution_id,
            "Running local action"
        );

        tokio::spawn(async move {
            let timeout = Duration::from_secs(request.timeout_secs.max(1));
            let result = match tokio::time::timeout(timeout, plugin.run(&request.input)).await {
                Ok(result) => result,
                Err(_) => ActionResult::failure(format!(
                    "Action '{}' timed out after {}s",
                    request.action_name, request.timeout_secs
                )),
            };

            let completion = ActionCompletion::new(request.action_execution_id, result);
            if completions.send(completion).is_err() {
                tracing::warn!("Completion channel closed, dropping action result");
            }
        });

        Ok(())
    }

    fn supports(&self, action_name: &str) -> bool {
        self.plugins.contains_key(action_name)
    }
}

/// `std.noop`: succeeds with no data.
struct NoopPlugin;

#[async_trait]
impl Plugin for NoopPlugin {
    fn name(&self) -> &'static str {
        "std.noop"
    }

    async fn run(&self, _input: &Value) -> ActionResult {
        ActionResult::success(Value::Null)
    }
}

/// `std.echo output=<value>`: returns `output`.
struct EchoPlugin;

#[async_trait]
impl Plugin for EchoPlugin {
    fn name(&self) -> &'static str {
        "std.echo"
    }

    async fn run(&self, input: &Value) -> ActionResult {
        ActionResult::success(input.get("output").cloned().unwrap_or(Value::Null))
    }
}

/// `std.fail [error_data=<value>]`: always fails.
struct FailPlugin;

#[async_trait]
impl Plugin for FailPlugin {
    fn name(&self) -> &'static str {
        "std.fail"
    }

    async fn run(&self, input: &Value) -> ActionResult {
        match input.get("error_data") {
            Some(Value::String(s)) => ActionResult::failure(s.clone()),
            Some(Value::Null) | None => ActionResult::failure("Fail action expected exception."),
            Some(other) => ActionResult::failure(other.to_string()),
        }
    }
}

/// `std.sleep seconds=<n>`: waits, then succeeds.
struct SleepPlugin;

#[async_trait]
impl Plugin for SleepPlugin {
    fn name(&self) -> &'static str {
        "std.sleep"
    }

    async fn run(&self, input: &Value) -> ActionResult {
        let seconds = input.get("seconds").and_then(Value::as_f64).unwrap_or(0.0).max(0.0);
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        ActionResult::success(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn request(name: &str, input: Value) -> ActionRequest {
        ActionRequest {
            action_execution_id: "a-1".to_string(),
            action_name: name.to_string(),
            input,
            attributes: json!({}),
            target: None,
            timeout_secs: 5,
            workflow_execution_id: None,
            task_execution_id: None,
            project_id: None,
        }
    }

    #[test]
    fn test_builtin_plugins() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let executor = LocalExecutor::new(tx);
        assert_eq!(executor.list(), vec!["std.echo", "std.fail", "std.noop", "std.sleep"]);
        assert!(executor.supports("std.echo"));
        assert!(!executor.supports("std.http"));
    }

    #[tokio::test]
    async fn test_echo_completes_on_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = LocalExecutor::new(tx);
        executor
            .run_action(request("std.echo", json!({"output": "Hi"})))
            .await
            .unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.action_execution_id, "a-1");
        assert_eq!(completion.result, ActionResult::success(json!("Hi")));
    }

    #[tokio::test]
    async fn test_fail_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = LocalExecutor::new(tx);
        executor
            .run_action(request("std.fail", json!({"error_data": "bad"})))
            .await
            .unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.result.error.as_deref(), Some("bad"));
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let executor = LocalExecutor::new(tx);
        let err = executor.run_action(request("std.http", json!({}))).await.unwrap_err();
        assert!(matches!(err, AppError::Executor(_)));
    }

    #[tokio::test]
    async fn test_timeout_becomes_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = LocalExecutor::new(tx);
        let mut req = request("std.sleep", json!({"seconds": 3}));
        req.timeout_secs = 1;
        executor.run_action(req).await.unwrap();

        let completion = rx.recv().await.unwrap();
        assert!(completion.result.error.unwrap().contains("timed out"));
    }
}
