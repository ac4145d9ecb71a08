//! Ad-hoc action specification.
//!
//! An ad-hoc action wraps a base action: it declares its own input, maps it
//! onto the base action's input through `base-input` and may reshape the
//! result with `output`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};
use crate::spec::command::parse_command;
use crate::spec::workflow::InputParam;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ActionSpec {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Base action command string; inline params merge into `base-input`.
    pub base: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub base_input: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<InputParam>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl ActionSpec {
    pub fn from_value(value: Value) -> AppResult<Self> {
        let mut spec: ActionSpec = serde_json::from_value(value)
            .map_err(|e| AppError::Parse(format!("invalid action spec: {}", e)))?;
        spec.initialize()?;
        Ok(spec)
    }

    pub fn from_yaml(source: &str) -> AppResult<Self> {
        let value: Value = serde_yaml::from_str(source)?;
        Self::from_value(value)
    }

    fn initialize(&mut self) -> AppResult<()> {
        if self.name.is_empty() {
            return Err(AppError::Validation("action name must not be empty".to_string()));
        }
        let parsed = parse_command(&self.base)?;
        for (key, value) in parsed.params {
            self.base_input.entry(key).or_insert(value);
        }
        self.base = parsed.name;
        Ok(())
    }

    pub fn input_names(&self) -> Vec<String> {
        self.input.iter().map(|p| p.name().to_string()).collect()
    }

    /// Declared inputs without defaults.
    pub fn required_inputs(&self) -> Vec<String> {
        self.input
            .iter()
            .filter(|p| p.default_value().is_none())
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn input_defaults(&self) -> Map<String, Value> {
        self.input
            .iter()
            .filter_map(|p| p.default_value().map(|v| (p.name().to_string(), v.clone())))
            .collect()
    }

    pub fn to_value(&self) -> AppResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
