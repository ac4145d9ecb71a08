//! Parsing of inline command strings and input declarations.
//!
//! `std.echo output="Hello" count=3` names an action (or workflow) and
//! carries inline parameters. Declarations like `a, b=1, c="x"` list input
//! names with optional defaults.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::error::{AppError, AppResult};

const COMMAND_NAME_PATTERN: &str = r#"^[\w\.]+[^=\(\s"]*"#;
const COMMAND_PARAM_PATTERN: &str = r#"([-_\w]+)=("[^"]*"\s*|'[^']*'\s*|\{[^}]*\}\s*|\[[^\]]*\]\s*|true|false|null|-?\d+(?:\.\d+)?)"#;

struct CommandPatterns {
    name: Regex,
    param: Regex,
}

fn patterns() -> AppResult<&'static CommandPatterns> {
    static PATTERNS: OnceLock<Result<CommandPatterns, regex::Error>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Ok(CommandPatterns {
                name: Regex::new(COMMAND_NAME_PATTERN)?,
                param: Regex::new(COMMAND_PARAM_PATTERN)?,
            })
        })
        .as_ref()
        .map_err(|e| AppError::Internal(format!("invalid command pattern: {}", e)))
}

/// A command string split into its name and inline parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub name: String,
    pub params: Map<String, Value>,
}

/// Parse `name k=v k2="v 2"` into a name and a parameter map.
pub fn parse_command(command: &str) -> AppResult<ParsedCommand> {
    let command = command.trim();
    let patterns = patterns()?;

    let name = patterns
        .name
        .find(command)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| AppError::Parse(format!("invalid command '{}'", command)))?;

    let rest = &command[name.len()..];
    let mut params = Map::new();
    for captures in patterns.param.captures_iter(rest) {
        let (Some(key), Some(raw)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        params.insert(key.as_str().to_string(), parse_literal(raw.as_str()));
    }

    Ok(ParsedCommand { name, params })
}

/// Turn a literal into a JSON value: quoted text loses its quotes,
/// everything else is tried as JSON and kept as text when that fails.
pub fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')))
    {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Input names and defaults declared by an action definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputDeclaration {
    /// Every declared name, in declaration order.
    pub names: Vec<String>,
    /// Names that carry a default value.
    pub defaults: Map<String, Value>,
}

impl InputDeclaration {
    /// Names without a default.
    pub fn required(&self) -> impl Iterator<Item = &String> {
        self.names.iter().filter(|n| !self.defaults.contains_key(*n))
    }
}

/// Parse `a, b=1, c="x, y"`; commas inside quotes and brackets are kept.
pub fn parse_input_declaration(declaration: &str) -> AppResult<InputDeclaration> {
    let mut result = InputDeclaration::default();

    for part in split_top_level(declaration) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((name, value)) => {
                let name = validate_name(name.trim())?;
                result.defaults.insert(name.clone(), parse_literal(value));
                result.names.push(name);
            }
            None => result.names.push(validate_name(part)?),
        }
    }

    Ok(result)
}

fn validate_name(name: &str) -> AppResult<String> {
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(AppError::Parse(format!("invalid input name '{}'", name)));
    }
    Ok(name.to_string())
}

fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[' | '{' | '(') => depth += 1,
            (None, ']' | '}' | ')') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plain_command() {
        let parsed = parse_command("std.noop").unwrap();
        assert_eq!(parsed.name, "std.noop");
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn test_parse_command_with_params() {
        let parsed =
            parse_command(r#"std.echo output="Hello world" count=3 flag=true items=[1, 2] extra='x'"#)
                .unwrap();
        assert_eq!(parsed.name, "std.echo");
        assert_eq!(parsed.params["output"], json!("Hello world"));
        assert_eq!(parsed.params["count"], json!(3));
        assert_eq!(parsed.params["flag"], json!(true));
        assert_eq!(parsed.params["items"], json!([1, 2]));
        assert_eq!(parsed.params["extra"], json!("x"));
    }

    #[test]
    fn test_parse_command_with_object_param() {
        let parsed = parse_command(r#"wb.sub_flow data={"k": 1}"#).unwrap();
        assert_eq!(parsed.name, "wb.sub_flow");
        assert_eq!(parsed.params["data"], json!({"k": 1}));
    }

    #[test]
    fn test_parse_input_declaration() {
        let decl = parse_input_declaration(r#"a, b=1, c="x, y", d=[1, 2]"#).unwrap();
        assert_eq!(decl.names, vec!["a", "b", "c", "d"]);
        assert_eq!(decl.defaults["b"], json!(1));
        assert_eq!(decl.defaults["c"], json!("x, y"));
        assert_eq!(decl.defaults["d"], json!([1, 2]));
        assert_eq!(decl.required().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_parse_empty_declaration() {
        let decl = parse_input_declaration("").unwrap();
        assert!(decl.names.is_empty());
    }

    #[test]
    fn test_invalid_input_name() {
        assert!(parse_input_declaration("a b").is_err());
    }
}
