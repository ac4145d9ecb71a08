//! Request-scoped execution context.
//!
//! Every entry point receives an `ExecContext`; it is cloned into each
//! spawned handler so tenant scoping survives async hops.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tenant and request metadata carried through every engine operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecContext {
    /// Project (tenant) that owns the records created by this request.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Admin requests may see records of every project.
    #[serde(default)]
    pub is_admin: bool,

    /// Correlation id for log lines.
    #[serde(default)]
    pub request_id: Option<String>,

    /// Caller identity, when known.
    #[serde(default)]
    pub user: Option<String>,
}

impl ExecContext {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }

    /// Same context with a fresh request id, used when a handler is spawned.
    pub fn child(&self) -> Self {
        Self {
            request_id: Some(uuid::Uuid::new_v4().to_string()),
            ..self.clone()
        }
    }

    /// Flat map used as the fallback workflow output.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect(),
            _ => Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_map_skips_nulls() {
        let ctx = ExecContext::for_project("p1");
        let map = ctx.to_map();
        assert_eq!(map.get("project_id"), Some(&Value::from("p1")));
        assert_eq!(map.get("is_admin"), Some(&Value::from(false)));
        assert!(!map.contains_key("user"));
    }

    #[test]
    fn test_child_keeps_project() {
        let ctx = ExecContext::for_project("p1");
        let child = ctx.child();
        assert_eq!(child.project_id.as_deref(), Some("p1"));
        assert!(child.request_id.is_some());
    }
}
