// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use prova_model::{ToolCallError, ToolCallErrorKind};
use prova_sandbox::SandboxError;

/// Failure of one tool call.
///
/// *Expected* kinds become tool-role error messages the model can react to;
/// [`ToolErrorKind::Unexpected`] fails the sample instead.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    Timeout,
    Permission,
    UnicodeDecode,
    OutputLimit,
    /// Generic in-tool failure the model should see.
    Tool,
    /// Arguments did not match the tool's schema.
    Parsing,
    /// The approval policy rejected the call.
    Approval,
    /// A bug or an environment failure; not surfaced to the model.
    Unexpected,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Parsing, message)
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Tool, message)
    }

    pub fn approval(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Approval, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Unexpected, message)
    }

    pub fn is_expected(&self) -> bool {
        self.kind != ToolErrorKind::Unexpected
    }

    /// Wire form placed on the tool-role message, when this error is one the
    /// model is allowed to see.
    pub fn to_call_error(&self) -> Option<ToolCallError> {
        let kind = match self.kind {
            ToolErrorKind::Timeout => ToolCallErrorKind::Timeout,
            ToolErrorKind::Permission => ToolCallErrorKind::Permission,
            ToolErrorKind::UnicodeDecode => ToolCallErrorKind::UnicodeDecode,
            ToolErrorKind::OutputLimit => ToolCallErrorKind::OutputLimit,
            ToolErrorKind::Tool => ToolCallErrorKind::Tool,
            ToolErrorKind::Parsing => ToolCallErrorKind::Parsing,
            ToolErrorKind::Approval => ToolCallErrorKind::Approval,
            ToolErrorKind::Unexpected => return None,
        };
        Some(ToolCallError { kind, message: self.message.clone() })
    }
}

impl From<SandboxError> for ToolError {
    fn from(e: SandboxError) -> Self {
        let kind = match &e {
            SandboxError::Timeout(_) => ToolErrorKind::Timeout,
            SandboxError::Permission(_) => ToolErrorKind::Permission,
            SandboxError::UnicodeDecode(_) => ToolErrorKind::UnicodeDecode,
            SandboxError::OutputLimit { .. } => ToolErrorKind::OutputLimit,
            _ => ToolErrorKind::Unexpected,
        };
        Self::new(kind, e.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
