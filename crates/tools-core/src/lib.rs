//! Core primitives for the A3S Code tool system
//!
//! Shared by every built-in tool:
//! - [`validate_args`]: checks call arguments against a tool's JSON schema
//! - [`resolve_path`] / [`resolve_path_for_write`]: keep file access inside the workspace
//! - [`truncate_output`]: caps tool output before it is sent back to the model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};

/// Tool description as advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Argument validation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("missing required parameter '{0}'")]
    MissingRequired(String),

    #[error("parameter '{name}' must be of type {expected}, got {actual}")]
    WrongType {
        name: String,
        expected: String,
        actual: &'static str,
    },

    #[error("parameter '{name}' must be one of [{allowed}], got {actual}")]
    NotInEnum {
        name: String,
        allowed: String,
        actual: String,
    },

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
}

/// Path resolution failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Failed to resolve path {path}: {reason}")]
    Unresolvable { path: String, reason: String },

    #[error("Path escapes workspace: {0}")]
    EscapesWorkspace(String),
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Validate call arguments against a JSON schema.
///
/// Supports the subset of JSON Schema used by tool definitions: a top-level
/// `object` with `properties`, `required`, per-property `type` (a string or a
/// list of strings), `enum`, nested `items` types for arrays and
/// `additionalProperties: false`.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ValidationError> {
    let obj = match args {
        Value::Object(obj) => obj,
        other => return Err(ValidationError::NotAnObject(type_name(other))),
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if obj.get(name).map_or(true, Value::is_null) {
                return Err(ValidationError::MissingRequired(name.to_string()));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (name, value) in obj {
        let Some(prop) = properties.and_then(|p| p.get(name)) else {
            if closed {
                return Err(ValidationError::UnknownParameter(name.clone()));
            }
            continue;
        };
        // Optional parameters may be sent as explicit nulls
        if value.is_null() {
            continue;
        }
        validate_value(name, prop, value)?;
    }

    Ok(())
}

fn validate_value(name: &str, prop: &Value, value: &Value) -> Result<(), ValidationError> {
    let types: Vec<&str> = match prop.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    if !types.is_empty() && !types.iter().any(|t| matches_type(t, value)) {
        return Err(ValidationError::WrongType {
            name: name.to_string(),
            expected: types.join("|"),
            actual: type_name(value),
        });
    }

    if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let allowed = allowed
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ValidationError::NotInEnum {
                name: name.to_string(),
                allowed,
                actual: value.to_string(),
            });
        }
    }

    if let (Some(items), Value::Array(elements)) = (prop.get("items"), value) {
        for (i, element) in elements.iter().enumerate() {
            validate_value(&format!("{}[{}]", name, i), items, element)?;
        }
    }

    if let (Some("object"), Value::Object(_)) = (prop.get("type").and_then(Value::as_str), value) {
        if prop.get("properties").is_some() {
            validate_args(prop, value).map_err(|e| match e {
                ValidationError::MissingRequired(inner) => {
                    ValidationError::MissingRequired(format!("{}.{}", name, inner))
                }
                other => other,
            })?;
        }
    }

    Ok(())
}

/// Resolve an existing path relative to the workspace, ensuring it stays inside.
///
/// `workspace` must already be canonical.
pub fn resolve_path(workspace: &Path, path: &str) -> Result<PathBuf, PathError> {
    let resolved = workspace.join(path);

    // Canonicalize to resolve .. and symlinks
    let canonical = resolved
        .canonicalize()
        .map_err(|e| PathError::Unresolvable {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

    if !canonical.starts_with(workspace) {
        return Err(PathError::EscapesWorkspace(path.to_string()));
    }

    Ok(canonical)
}

/// Resolve a path for writing. The file and any missing parent directories
/// may not exist yet, but the nearest existing ancestor must be inside the
/// workspace and the missing tail may not contain `..`.
pub fn resolve_path_for_write(workspace: &Path, path: &str) -> Result<PathBuf, PathError> {
    let resolved = workspace.join(path);

    let mut existing = resolved.as_path();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => {
                return Err(PathError::Unresolvable {
                    path: path.to_string(),
                    reason: "no existing ancestor".to_string(),
                })
            }
        }
    }

    // `file_name` skips `..` components, so check the tail explicitly
    let missing = resolved.strip_prefix(existing).unwrap_or(Path::new(""));
    if missing
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(PathError::EscapesWorkspace(path.to_string()));
    }

    let canonical = existing
        .canonicalize()
        .map_err(|e| PathError::Unresolvable {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    if !canonical.starts_with(workspace) {
        return Err(PathError::EscapesWorkspace(path.to_string()));
    }

    Ok(tail.into_iter().rev().fold(canonical, |acc, part| acc.join(part)))
}

/// Truncate `output` to at most `max_bytes`, cutting on a char boundary and
/// appending a marker with the number of bytes dropped.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut cut = max_bytes;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n\n[output truncated: {} more bytes]",
        &output[..cut],
        output.len() - cut
    )
}
