//! Workflow specification: the task graph.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::engine::states::TransitionEvent;
use crate::error::{AppError, AppResult};
use crate::spec::task::{is_engine_command, Transition, TaskSpec};

pub const WORKFLOW_TYPE_DIRECT: &str = "direct";

const EVENTS: [TransitionEvent; 3] = [
    TransitionEvent::OnError,
    TransitionEvent::OnSuccess,
    TransitionEvent::OnComplete,
];

/// A declared input: a bare (required) name or `{name: default}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputParam {
    Name(String),
    WithDefault(BTreeMap<String, Value>),
}

impl InputParam {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::WithDefault(map) => map.keys().next().map(String::as_str).unwrap_or_default(),
        }
    }

    pub fn default_value(&self) -> Option<&Value> {
        match self {
            Self::Name(_) => None,
            Self::WithDefault(map) => map.values().next(),
        }
    }
}

/// Transition fallbacks applied to tasks that leave a clause empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskDefaults {
    #[serde(default, with = "crate::spec::task::transitions", skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<Transition>,

    #[serde(default, with = "crate::spec::task::transitions", skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<Transition>,

    #[serde(default, with = "crate::spec::task::transitions", skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<Transition>,
}

impl TaskDefaults {
    fn is_empty(&self) -> bool {
        self.on_success.is_empty() && self.on_error.is_empty() && self.on_complete.is_empty()
    }

    fn clause(&self, event: TransitionEvent) -> &[Transition] {
        match event {
            TransitionEvent::OnSuccess => &self.on_success,
            TransitionEvent::OnError => &self.on_error,
            TransitionEvent::OnComplete => &self.on_complete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkflowSpec {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(rename = "type", default = "default_workflow_type")]
    pub workflow_type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<InputParam>,

    /// Expression tree evaluated against the final context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default)]
    pub tasks: BTreeMap<String, TaskSpec>,

    #[serde(default, skip_serializing_if = "TaskDefaults::is_empty")]
    pub task_defaults: TaskDefaults,
}

fn default_workflow_type() -> String {
    WORKFLOW_TYPE_DIRECT.to_string()
}

impl WorkflowSpec {
    /// Parse, normalize and validate a spec from its JSON form.
    pub fn from_value(value: Value) -> AppResult<Self> {
        let mut spec: WorkflowSpec = serde_json::from_value(value)
            .map_err(|e| AppError::Parse(format!("invalid workflow spec: {}", e)))?;
        spec.initialize()?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_yaml(source: &str) -> AppResult<Self> {
        let value: Value = serde_yaml::from_str(source)?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> AppResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn initialize(&mut self) -> AppResult<()> {
        for (key, task) in self.tasks.iter_mut() {
            task.name = key.clone();
            task.initialize()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.name.is_empty() {
            return Err(AppError::Validation("workflow name must not be empty".to_string()));
        }
        if self.workflow_type != WORKFLOW_TYPE_DIRECT {
            return Err(AppError::Validation(format!(
                "invalid workflow type '{}'",
                self.workflow_type
            )));
        }
        if self.tasks.is_empty() {
            return Err(AppError::Validation(format!(
                "workflow '{}' has no tasks",
                self.name
            )));
        }

        for task in self.tasks.values() {
            task.validate()?;
            for target in self.outbound_names(&task.name) {
                if !self.tasks.contains_key(&target) && !is_engine_command(&target) {
                    return Err(AppError::Validation(format!(
                        "task '{}' transitions to unknown task '{}'",
                        task.name, target
                    )));
                }
            }
        }
        if self.start_task_specs().is_empty() {
            return Err(AppError::Validation(format!(
                "workflow '{}' has no start task, every task is a transition target",
                self.name
            )));
        }
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.get(name)
    }

    /// Clause of `task` for `event`, falling back to task-defaults when empty.
    pub fn transitions<'a>(&'a self, task: &'a TaskSpec, event: TransitionEvent) -> &'a [Transition] {
        let own = task.clause(event);
        if own.is_empty() {
            self.task_defaults.clause(event)
        } else {
            own
        }
    }

    /// Every transition target of `name`, without duplicates, in clause order.
    pub fn outbound_names(&self, name: &str) -> Vec<String> {
        let Some(task) = self.tasks.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<String> = Vec::new();
        for event in EVENTS {
            for transition in self.transitions(task, event) {
                if transition.name != name && !names.contains(&transition.name) {
                    names.push(transition.name.clone());
                }
            }
        }
        names
    }

    /// Task specs with a transition into `name`.
    pub fn inbound_task_specs(&self, name: &str) -> Vec<&TaskSpec> {
        self.tasks
            .values()
            .filter(|task| task.name != name)
            .filter(|task| self.outbound_names(&task.name).iter().any(|n| n == name))
            .collect()
    }

    pub fn start_task_specs(&self) -> Vec<&TaskSpec> {
        self.tasks
            .values()
            .filter(|task| self.inbound_task_specs(&task.name).is_empty())
            .collect()
    }

    /// Names of every task upstream of `name`.
    pub fn ancestor_names(&self, name: &str) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            for parent in self.inbound_task_specs(&current) {
                if parent.name != name && visited.insert(parent.name.clone()) {
                    stack.push(parent.name.clone());
                }
            }
        }
        visited
    }

    pub fn has_on_error_clause(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .map(|task| !self.transitions(task, TransitionEvent::OnError).is_empty())
            .unwrap_or(false)
    }

    pub fn join_task_names(&self) -> BTreeSet<String> {
        self.tasks
            .values()
            .filter(|task| task.has_join())
            .map(|task| task.name.clone())
            .collect()
    }

    pub fn input_names(&self) -> Vec<String> {
        self.input.iter().map(|p| p.name().to_string()).collect()
    }

    /// Check workflow input against the declaration and fill defaults.
    pub fn prepare_input(&self, input: &Map<String, Value>) -> AppResult<Map<String, Value>> {
        let names = self.input_names();
        if let Some(unknown) = input.keys().find(|k| !names.contains(k)) {
            return Err(AppError::Validation(format!(
                "Invalid input [name={}, unexpected_inputs=[{}]]",
                self.name, unknown
            )));
        }

        let mut prepared = Map::new();
        let mut missing = Vec::new();
        for param in &self.input {
            match (input.get(param.name()), param.default_value()) {
                (Some(value), _) => {
                    prepared.insert(param.name().to_string(), value.clone());
                }
                (None, Some(default)) => {
                    prepared.insert(param.name().to_string(), default.clone());
                }
                (None, None) => missing.push(param.name().to_string()),
            }
        }

        if !missing.is_empty() {
            return Err(AppError::Validation(format!(
                "Invalid input [name={}, missing=[{}]]",
                self.name,
                missing.join(", ")
            )));
        }
        Ok(prepared)
    }
}
