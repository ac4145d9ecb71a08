//! Workflow and action definition models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Visibility of a stored definition.
pub const SCOPE_PRIVATE: &str = "private";
pub const SCOPE_PUBLIC: &str = "public";

/// A registered workflow (the parsed spec is stored as JSON).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub spec: serde_json::Value,
    pub scope: String,
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowDefinition {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        spec: serde_json::Value,
        project_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            namespace: namespace.into(),
            spec,
            scope: SCOPE_PRIVATE.to_string(),
            project_id,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

/// A registered action.
///
/// Definitions without a `spec` are executable by the executor plugin named
/// in `action_class`; definitions with a `spec` are ad-hoc wrappers around a
/// base action.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActionDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub action_class: String,
    pub attributes: serde_json::Value,
    /// Input declaration such as `a, b=1, c="x"`.
    pub input: String,
    pub spec: Option<serde_json::Value>,
    pub scope: String,
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ActionDefinition {
    /// A plugin-backed action definition.
    pub fn plugin(name: impl Into<String>, action_class: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            action_class: action_class.into(),
            attributes: serde_json::json!({}),
            input: input.into(),
            spec: None,
            scope: SCOPE_PUBLIC.to_string(),
            project_id: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// An ad-hoc action definition wrapping a base action.
    pub fn ad_hoc(name: impl Into<String>, spec: serde_json::Value, project_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            action_class: String::new(),
            attributes: serde_json::json!({}),
            input: String::new(),
            spec: Some(spec),
            scope: SCOPE_PRIVATE.to_string(),
            project_id,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn is_ad_hoc(&self) -> bool {
        self.spec.is_some()
    }
}
