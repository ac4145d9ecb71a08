//! Task specification: what a task runs and where control flows next.

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::db::models::TaskType;
use crate::engine::states::{Join, TransitionEvent};
use crate::error::{AppError, AppResult};
use crate::spec::command::{parse_command, parse_literal};

/// Engine pseudo-tasks usable as transition targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Noop,
    Fail,
    Succeed,
    Pause,
}

impl EngineCommand {
    pub const RESERVED: [&'static str; 4] = ["noop", "fail", "succeed", "pause"];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "noop" => Some(Self::Noop),
            "fail" => Some(Self::Fail),
            "succeed" => Some(Self::Succeed),
            "pause" => Some(Self::Pause),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Fail => "fail",
            Self::Succeed => "succeed",
            Self::Pause => "pause",
        }
    }
}

pub fn is_engine_command(name: &str) -> bool {
    EngineCommand::from_name(name).is_some()
}

/// One outbound edge, optionally guarded by an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub name: String,
    pub guard: Option<String>,
}

impl Transition {
    pub fn to(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guard: None,
        }
    }

    pub fn guarded(name: impl Into<String>, guard: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guard: Some(guard.into()),
        }
    }
}

/// Retry policy for a regular task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrySpec {
    #[serde(default)]
    pub count: u32,
    /// Seconds between attempts.
    #[serde(default)]
    pub delay: u64,
    /// Guard that stops retrying when truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_on: Option<String>,
}

/// A single `var in <source>` clause of `with-items`.
#[derive(Debug, Clone, PartialEq)]
pub struct WithItemsClause {
    pub var: String,
    pub source: ItemsSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemsSource {
    List(Vec<Value>),
    Expression(String),
}

/// Parse the `with-items` clauses of a task.
pub fn parse_with_items(clauses: &[String]) -> AppResult<Vec<WithItemsClause>> {
    clauses
        .iter()
        .map(|clause| {
            let (var, source) = clause
                .split_once(" in ")
                .map(|(v, s)| (v.trim(), s.trim()))
                .filter(|(v, s)| !v.is_empty() && !s.is_empty())
                .ok_or_else(|| {
                    AppError::Validation(format!("invalid with-items clause '{}'", clause))
                })?;

            if !var.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
                return Err(AppError::Validation(format!(
                    "invalid with-items variable '{}'",
                    var
                )));
            }

            let source = match serde_json::from_str::<Value>(source) {
                Ok(Value::Array(items)) if source.starts_with('[') => ItemsSource::List(items),
                _ => ItemsSource::Expression(source.to_string()),
            };

            Ok(WithItemsClause {
                var: var.to_string(),
                source,
            })
        })
        .collect()
}

/// Declarative description of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskSpec {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Action command string (`std.echo output="x"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Sub-workflow command string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,

    #[serde(
        default,
        alias = "params",
        alias = "parameters",
        deserialize_with = "deserialize_input",
        skip_serializing_if = "Map::is_empty"
    )]
    pub input: Map<String, Value>,

    #[serde(default, with = "transitions", skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<Transition>,

    #[serde(default, with = "transitions", skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<Transition>,

    #[serde(default, with = "transitions", skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<Transition>,

    #[serde(default, with = "join_format", skip_serializing_if = "Option::is_none")]
    pub join: Option<Join>,

    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub with_items: Vec<String>,

    /// Maximum concurrently running items of a with-items task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_on_error: Option<Value>,

    /// Executor routing hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Action timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Receive the triggering task's state info as `parent_result`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub get_parent: bool,

    #[serde(skip)]
    pub command: Option<EngineCommand>,
}

impl TaskSpec {
    /// Spec for a pseudo-task reached through a transition.
    pub fn for_engine_command(command: EngineCommand) -> Self {
        Self {
            name: command.name().to_string(),
            command: Some(command),
            ..Self::default()
        }
    }

    pub fn task_type(&self) -> TaskType {
        if self.workflow.is_some() {
            TaskType::Workflow
        } else {
            TaskType::Action
        }
    }

    pub fn has_join(&self) -> bool {
        self.join.is_some()
    }

    pub fn has_with_items(&self) -> bool {
        !self.with_items.is_empty()
    }

    /// Split inline command parameters out of `action` / `workflow`.
    ///
    /// Explicit `input` entries win over inline parameters.
    pub fn initialize(&mut self) -> AppResult<()> {
        for command in [&mut self.action, &mut self.workflow].into_iter().flatten() {
            let parsed = parse_command(command)?;
            for (key, value) in parsed.params {
                self.input.entry(key).or_insert(value);
            }
            *command = parsed.name;
        }
        Ok(())
    }

    /// Own clause for `event` (without task-defaults).
    pub fn clause(&self, event: TransitionEvent) -> &[Transition] {
        match event {
            TransitionEvent::OnSuccess => &self.on_success,
            TransitionEvent::OnError => &self.on_error,
            TransitionEvent::OnComplete => &self.on_complete,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.name.is_empty() {
            return Err(AppError::Validation("task name must not be empty".to_string()));
        }
        if self.action.is_some() && self.workflow.is_some() {
            return Err(AppError::Validation(format!(
                "task '{}' cannot define both action and workflow",
                self.name
            )));
        }
        if let Some(Join::Count(0)) = self.join {
            return Err(AppError::Validation(format!(
                "task '{}' join count must be positive",
                self.name
            )));
        }
        if self.has_join() && self.has_with_items() {
            return Err(AppError::Validation(format!(
                "task '{}' cannot combine join and with-items",
                self.name
            )));
        }
        parse_with_items(&self.with_items)?;
        Ok(())
    }
}

fn deserialize_input<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        Value::Array(items) => {
            let mut map = Map::new();
            for item in items {
                match item {
                    Value::Object(entry) => map.extend(entry),
                    Value::String(entry) => match entry.split_once('=') {
                        Some((k, v)) => {
                            map.insert(k.trim().to_string(), parse_literal(v));
                        }
                        None => {
                            map.insert(entry.trim().to_string(), Value::Null);
                        }
                    },
                    other => {
                        return Err(de::Error::custom(format!("invalid input entry {}", other)))
                    }
                }
            }
            Ok(map)
        }
        other => Err(de::Error::custom(format!("invalid input {}", other))),
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

/// Transition clauses: `b`, `[b, {c: "<guard>"}]` or `{b: "<guard>"}`.
pub(crate) mod transitions {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawClause {
        One(String),
        Many(Vec<RawTransition>),
        Guarded(BTreeMap<String, Option<Value>>),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTransition {
        Name(String),
        Guarded(BTreeMap<String, Option<Value>>),
    }

    fn guard_text(value: Option<Value>) -> Option<String> {
        match value {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        }
    }

    fn from_map(map: BTreeMap<String, Option<Value>>) -> impl Iterator<Item = Transition> {
        map.into_iter().map(|(name, guard)| Transition {
            name,
            guard: guard_text(guard),
        })
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Transition>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<RawClause>::deserialize(deserializer)? {
            None => Vec::new(),
            Some(RawClause::One(name)) => vec![Transition::to(name)],
            Some(RawClause::Guarded(map)) => from_map(map).collect(),
            Some(RawClause::Many(items)) => items
                .into_iter()
                .flat_map(|item| -> Vec<Transition> {
                    match item {
                        RawTransition::Name(name) => vec![Transition::to(name)],
                        RawTransition::Guarded(map) => from_map(map).collect(),
                    }
                })
                .collect(),
        })
    }

    pub fn serialize<S>(value: &[Transition], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct Entry<'a>(&'a Transition);

        impl Serialize for Entry<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                match &self.0.guard {
                    None => serializer.serialize_str(&self.0.name),
                    Some(guard) => {
                        let mut map = serializer.serialize_map(Some(1))?;
                        map.serialize_entry(&self.0.name, guard)?;
                        map.end()
                    }
                }
            }
        }

        let mut seq = serializer.serialize_seq(Some(value.len()))?;
        for transition in value {
            seq.serialize_element(&Entry(transition))?;
        }
        seq.end()
    }
}

/// `join: all | one | <n>`.
pub(crate) mod join_format {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawJoin {
        Count(u32),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Join>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<RawJoin>::deserialize(deserializer)? {
            None => Ok(None),
            Some(RawJoin::Count(n)) => Ok(Some(Join::Count(n))),
            Some(RawJoin::Text(text)) => match text.trim() {
                "all" => Ok(Some(Join::All)),
                "one" => Ok(Some(Join::Count(1))),
                other => other
                    .parse::<u32>()
                    .map(|n| Some(Join::Count(n)))
                    .map_err(|_| de::Error::custom(format!("invalid join value '{}'", other))),
            },
        }
    }

    pub fn serialize<S>(value: &Option<Join>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            None => serializer.serialize_none(),
            Some(Join::All) => serializer.serialize_str("all"),
            Some(Join::Count(n)) => serializer.serialize_u32(*n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transition_forms() {
        let spec: TaskSpec = serde_json::from_value(json!({
            "action": "std.noop",
            "on-success": ["b", {"c": "{{ x > 1 }}"}, {"d": null}],
            "on-error": "handle",
            "on-complete": {"e": true}
        }))
        .unwrap();

        assert_eq!(
            spec.on_success,
            vec![
                Transition::to("b"),
                Transition::guarded("c", "{{ x > 1 }}"),
                Transition::to("d"),
            ]
        );
        assert_eq!(spec.on_error, vec![Transition::to("handle")]);
        assert_eq!(spec.on_complete, vec![Transition::guarded("e", "true")]);
    }

    #[test]
    fn test_join_values() {
        let all: TaskSpec = serde_json::from_value(json!({"join": "all"})).unwrap();
        assert_eq!(all.join, Some(Join::All));
        let one: TaskSpec = serde_json::from_value(json!({"join": "one"})).unwrap();
        assert_eq!(one.join, Some(Join::Count(1)));
        let two: TaskSpec = serde_json::from_value(json!({"join": 2})).unwrap();
        assert_eq!(two.join, Some(Join::Count(2)));
        assert!(serde_json::from_value::<TaskSpec>(json!({"join": "some"})).is_err());
    }

    #[test]
    fn test_initialize_splits_inline_params() {
        let mut spec: TaskSpec = serde_json::from_value(json!({
            "name": "a",
            "action": "std.echo output=\"inline\" count=1",
            "input": {"count": 2}
        }))
        .unwrap();
        spec.initialize().unwrap();
        assert_eq!(spec.action.as_deref(), Some("std.echo"));
        assert_eq!(spec.input["output"], json!("inline"));
        assert_eq!(spec.input["count"], json!(2));
    }

    #[test]
    fn test_params_list_form() {
        let spec: TaskSpec = serde_json::from_value(json!({
            "params": [{"a": 1}, "b=\"two\""]
        }))
        .unwrap();
        assert_eq!(spec.input["a"], json!(1));
        assert_eq!(spec.input["b"], json!("two"));
    }

    #[test]
    fn test_join_with_items_rejected() {
        let spec: TaskSpec = serde_json::from_value(json!({
            "name": "a",
            "join": "all",
            "with-items": "x in [1, 2]"
        }))
        .unwrap();
        assert!(matches!(spec.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_parse_with_items() {
        let clauses = parse_with_items(&[
            "x in [1, 2, 3]".to_string(),
            "name in {{ names }}".to_string(),
        ])
        .unwrap();
        assert_eq!(clauses[0].var, "x");
        assert_eq!(clauses[0].source, ItemsSource::List(vec![json!(1), json!(2), json!(3)]));
        assert_eq!(
            clauses[1].source,
            ItemsSource::Expression("{{ names }}".to_string())
        );
        assert!(parse_with_items(&["nothing".to_string()]).is_err());
    }

    #[test]
    fn test_serialize_round_trip_keeps_guards() {
        let spec: TaskSpec = serde_json::from_value(json!({
            "name": "a",
            "action": "std.noop",
            "on-success": ["b", {"c": "{{ ok }}"}],
            "join": 2
        }))
        .unwrap();
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["on-success"], json!(["b", {"c": "{{ ok }}"}]));
        assert_eq!(value["join"], json!(2));
        let back: TaskSpec = serde_json::from_value(value).unwrap();
        assert_eq!(back, spec);
    }
}
