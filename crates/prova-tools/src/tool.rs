// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use prova_model::{Content, ToolInfo, ToolParams};
use serde_json::Value;

use crate::error::{ToolError, ToolErrorKind};

/// Trait every tool implements.
///
/// Tools are constructed per sample; anything they need beyond the model's
/// arguments (the sample's sandbox, a store handle) is injected at
/// construction time, which keeps this trait free of engine state.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// Declared parameter schema; arguments are validated against it before
    /// `execute` is called.
    fn parameters(&self) -> ToolParams;
    /// Whether several calls to this tool may run concurrently.
    fn parallel(&self) -> bool {
        true
    }
    /// Execute with already-validated arguments.  Expected failures are
    /// returned as [`ToolError`]s; panics and `Unexpected` errors fail the
    /// sample.
    async fn execute(&self, arguments: &Value) -> Result<Content, ToolError>;
}

/// The schema advertised to the model for one tool.
pub fn tool_info(tool: &dyn Tool) -> ToolInfo {
    ToolInfo {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters(),
    }
}

/// Validate a call's arguments against the declared schema.
///
/// Checks: the arguments form an object, every required parameter is
/// present, no undeclared parameter is passed, and declared primitive types
/// match.  Any violation is a `Parsing` error, which the dispatcher sends
/// back to the model rather than failing the sample.
pub fn validate_arguments(params: &ToolParams, arguments: &Value) -> Result<(), ToolError> {
    let object = match arguments {
        Value::Object(map) => map,
        Value::Null => {
            return if params.required.is_empty() {
                Ok(())
            } else {
                Err(ToolError::parsing(format!(
                    "missing required parameter(s): {}",
                    params.required.join(", ")
                )))
            }
        }
        other => {
            return Err(ToolError::parsing(format!(
                "arguments must be a JSON object, got: {other}"
            )))
        }
    };

    for required in &params.required {
        if !object.contains_key(required) {
            return Err(ToolError::parsing(format!(
                "missing required parameter: {required}"
            )));
        }
    }
    for (name, value) in object {
        let Some(decl) = params.properties.get(name) else {
            return Err(ToolError::parsing(format!("unknown parameter: {name}")));
        };
        if !type_matches(&decl.kind, value) {
            return Err(ToolError::parsing(format!(
                "parameter {name} expects {kind}, got: {value}",
                kind = decl.kind
            )));
        }
    }
    Ok(())
}

fn type_matches(kind: &str, value: &Value) -> bool {
    match kind {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Unknown or compound declarations are not enforced here.
        _ => true,
    }
}

/// Truncate tool output so one verbose command cannot blow out the
/// conversation.  Keeps head and tail with an omission marker; errors and
/// summaries at the end of output are never lost.
pub fn truncate_output(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let half = limit / 2;
    let head_end = (0..=half).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0);
    let tail_start = (s.len() - half..s.len())
        .find(|i| s.is_char_boundary(*i))
        .unwrap_or(s.len());
    let omitted = tail_start - head_end;
    format!(
        "{}\n...[{omitted} bytes omitted]...\n{}",
        &s[..head_end],
        &s[tail_start..]
    )
}

/// Hard ceiling applied by the dispatcher to any tool's text output.
pub const TOOL_OUTPUT_LIMIT: usize = 100_000;

impl ToolError {
    /// Convenience for tools reporting an output-limit breach themselves.
    pub fn output_limit(limit: usize) -> Self {
        Self::new(
            ToolErrorKind::OutputLimit,
            format!("tool output exceeded the {limit} byte limit"),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
