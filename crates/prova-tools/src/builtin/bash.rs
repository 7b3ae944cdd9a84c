// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prova_model::{Content, ToolParams};
use prova_sandbox::{exec_with_retry, ExecParams, SandboxEnvironment};
use serde_json::Value;
use tracing::debug;

use crate::{
    error::ToolError,
    tool::{truncate_output, Tool, TOOL_OUTPUT_LIMIT},
};

/// Built-in tool that runs a shell command inside the sample's sandbox.
pub struct BashTool {
    sandbox: Arc<dyn SandboxEnvironment>,
    pub timeout_secs: u64,
}

impl BashTool {
    pub fn new(sandbox: Arc<dyn SandboxEnvironment>) -> Self {
        Self { sandbox, timeout_secs: 30 }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a bash command in the sandbox and return stdout + stderr.\n\
         Commands run non-interactively; avoid anything that requires a TTY.\n\
         The default timeout is 30 seconds; pass timeout_secs for slow commands.\n\
         Non-zero exit codes are reported as errors together with the output."
    }

    fn parameters(&self) -> ToolParams {
        ToolParams::new()
            .param("cmd", "string", "The bash command to execute", true)
            .param(
                "timeout_secs",
                "integer",
                "Execution timeout in seconds (optional)",
                false,
            )
    }

    async fn execute(&self, arguments: &Value) -> Result<Content, ToolError> {
        let cmd = arguments
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::parsing("missing 'cmd' argument"))?;
        let timeout = arguments
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.timeout_secs);

        debug!(cmd, "bash tool");
        let params = ExecParams::command(["bash", "-c", cmd])
            .with_timeout(Duration::from_secs(timeout));
        let result = exec_with_retry(self.sandbox.as_ref(), params).await?;

        let mut content = String::new();
        if !result.stdout.is_empty() {
            content.push_str(&result.stdout);
        }
        if !result.stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("[stderr]\n");
            content.push_str(&result.stderr);
        }
        let content = truncate_output(&content, TOOL_OUTPUT_LIMIT);

        if result.success {
            Ok(Content::Text(content))
        } else {
            Err(ToolError::tool(format!("[exit {}]\n{content}", result.exit_code)))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
