//! Jinja2-style expression evaluation using minijinja.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{value::ValueKind, Environment, Error, ErrorKind, Value};
use std::collections::HashMap;

use crate::error::{AppError, AppResult};
use crate::expression::{DataContext, Evaluator};

/// Evaluator backed by a minijinja environment with a few extra filters.
pub struct JinjaEvaluator {
    env: Environment<'static>,
}

impl Default for JinjaEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl JinjaEvaluator {
    pub fn new() -> Self {
        let mut env = Environment::new();

        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);

        Self { env }
    }

    /// Render a template string to text.
    pub fn render(&self, template: &str, ctx: &DataContext) -> AppResult<String> {
        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| AppError::Template(format!("Template parse error: {}", e)))?;

        tmpl.render(context_value(ctx))
            .map_err(|e| AppError::Template(format!("Template render error: {}", e)))
    }

    fn eval_expression(&self, expression: &str, ctx: &DataContext) -> AppResult<serde_json::Value> {
        let compiled = self.env.compile_expression(expression).map_err(|e| {
            AppError::Template(format!("Expression parse error in '{}': {}", expression, e))
        })?;

        let value = compiled.eval(context_value(ctx)).map_err(|e| {
            AppError::Template(format!("Expression error in '{}': {}", expression, e))
        })?;

        Ok(minijinja_to_json(&value))
    }
}

impl Evaluator for JinjaEvaluator {
    fn evaluate(&self, expression: &str, ctx: &DataContext) -> AppResult<serde_json::Value> {
        if let Some(value) = ctx.get(expression) {
            return Ok(value.clone());
        }
        if !contains_template_syntax(expression) {
            return Ok(serde_json::Value::String(expression.to_string()));
        }
        match single_expression(expression) {
            Some(inner) => self.eval_expression(inner, ctx),
            None => self.render(expression, ctx).map(serde_json::Value::String),
        }
    }

    fn evaluate_expression(&self, expression: &str, ctx: &DataContext) -> AppResult<serde_json::Value> {
        if contains_template_syntax(expression) {
            return self.evaluate(expression, ctx);
        }
        self.eval_expression(expression.trim(), ctx)
    }
}

/// Check if a string contains Jinja2 template syntax.
fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// `{{ expr }}` and nothing else: returns `expr`.
fn single_expression(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    Some(inner.trim())
}

fn context_value(ctx: &DataContext) -> Value {
    let converted: HashMap<String, Value> = ctx
        .iter()
        .map(|(k, v)| (k.clone(), json_value_to_minijinja(v)))
        .collect();
    Value::from_object(converted)
}

/// Convert a serde_json::Value to a minijinja Value.
fn json_value_to_minijinja(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::from(()),
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                Value::from(f)
            } else {
                Value::UNDEFINED
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(arr) => {
            let items: Vec<Value> = arr.iter().map(json_value_to_minijinja).collect();
            Value::from(items)
        }
        serde_json::Value::Object(map) => {
            let items: HashMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_value_to_minijinja(v)))
                .collect();
            Value::from_object(items)
        }
    }
}

/// Convert minijinja Value back to serde_json::Value.
fn minijinja_to_json(value: &Value) -> serde_json::Value {
    if value.is_undefined() || value.is_none() {
        return serde_json::Value::Null;
    }
    match value.kind() {
        ValueKind::Bool => serde_json::Value::Bool(value.is_true()),
        ValueKind::Number => {
            if let Some(i) = value.as_i64() {
                return serde_json::Value::Number(i.into());
            }
            f64::try_from(value.clone())
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null)
        }
        ValueKind::String => serde_json::Value::String(value.as_str().unwrap_or_default().to_string()),
        ValueKind::Seq | ValueKind::Iterable => match value.try_iter() {
            Ok(iter) => serde_json::Value::Array(iter.map(|v| minijinja_to_json(&v)).collect()),
            Err(_) => serde_json::Value::Array(Vec::new()),
        },
        ValueKind::Map => {
            let mut map = serde_json::Map::new();
            if let Ok(iter) = value.try_iter() {
                for key in iter {
                    if let Ok(val) = value.get_item(&key) {
                        map.insert(key.to_string(), minijinja_to_json(&val));
                    }
                }
            }
            serde_json::Value::Object(map)
        }
        _ => serde_json::Value::String(value.to_string()),
    }
}

// ============================================================================
// Custom Filters
// ============================================================================

fn filter_b64encode(value: &Value) -> Result<String, Error> {
    let s = value.to_string();
    Ok(BASE64.encode(s.as_bytes()))
}

fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let s = value.to_string();
    let decoded = BASE64.decode(s.as_bytes()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("b64decode error: {}", e),
        )
    })?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8 error: {}", e)))
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    let json_val = minijinja_to_json(value);
    serde_json::to_string(&json_val)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let s = value.to_string();
    let json_val: serde_json::Value = serde_json::from_str(&s).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("fromjson error: {}", e),
        )
    })?;
    Ok(json_value_to_minijinja(&json_val))
}
