//! Expression evaluation against a data context.
//!
//! The engine never depends on a concrete expression language: it talks to
//! an [`Evaluator`]. [`JinjaEvaluator`] is the minijinja-backed default.

mod jinja;

pub use jinja::JinjaEvaluator;

use serde_json::Value;
use std::collections::HashMap;

use crate::error::AppResult;

/// Variables visible to an expression.
pub type DataContext = HashMap<String, Value>;

/// Evaluates strings and data structures against a [`DataContext`].
pub trait Evaluator: Send + Sync {
    /// Evaluate a template string.
    ///
    /// A string that is exactly a context key yields that value; a string
    /// holding a single `{{ expr }}` yields the typed value of `expr`; other
    /// templates render to text. Anything else is returned unchanged.
    fn evaluate(&self, expression: &str, ctx: &DataContext) -> AppResult<Value>;

    /// Evaluate a bare expression (`x > 1`, `items`), as used by guards and
    /// `with-items` sources. Template strings are accepted as well.
    fn evaluate_expression(&self, expression: &str, ctx: &DataContext) -> AppResult<Value>;

    /// Evaluate every string inside `data`, keys included.
    fn evaluate_recursively(&self, data: &Value, ctx: &DataContext) -> AppResult<Value> {
        match data {
            Value::String(s) => self.evaluate(s, ctx),
            Value::Object(map) => {
                let mut result = serde_json::Map::new();
                for (k, v) in map {
                    let key = match self.evaluate(k, ctx)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    result.insert(key, self.evaluate_recursively(v, ctx)?);
                }
                Ok(Value::Object(result))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.evaluate_recursively(v, ctx))
                .collect::<AppResult<Vec<_>>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    /// Evaluate a guard; an empty guard always fires.
    fn evaluate_guard(&self, guard: Option<&str>, ctx: &DataContext) -> AppResult<bool> {
        match guard.map(str::trim) {
            None | Some("") => Ok(true),
            Some(expression) => Ok(is_truthy(&self.evaluate_expression(expression, ctx)?)),
        }
    }
}

/// Truthiness of an evaluated value.
///
/// `null`, `false`, `0`, `""`, `"false"`, `[]` and `{}` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Build a context from layers; later layers override earlier ones.
pub fn merge_contexts<'a, I>(layers: I) -> DataContext
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut ctx = DataContext::new();
    for layer in layers {
        if let Value::Object(map) = layer {
            for (k, v) in map {
                ctx.insert(k.clone(), v.clone());
            }
        }
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!("False")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!(2.5)));
        assert!(is_truthy(&json!({"a": 1})));
    }

    #[test]
    fn test_merge_contexts_later_wins() {
        let ctx = merge_contexts([&json!({"a": 1, "b": 1}), &json!({"b": 2}), &json!(null)]);
        assert_eq!(ctx["a"], json!(1));
        assert_eq!(ctx["b"], json!(2));
    }
}
