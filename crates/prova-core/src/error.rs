// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use prova_model::ModelError;
use prova_sandbox::SandboxError;
use prova_tools::ToolError;

use crate::limits::LimitExceeded;

/// Errors that terminate a sample.
///
/// `Limit` is the benign variant: the sample is marked limit-complete and
/// still scored.  Everything else makes the sample an error subject to the
/// eval's `fail_on_error` policy, except `Cancelled`, which unwinds without
/// being reportable to the model or catchable by solvers.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Limit(#[from] LimitExceeded),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// An unexpected tool failure (expected tool errors go back to the model
    /// as messages and never surface here).
    #[error("tool error: {0}")]
    Tool(ToolError),

    #[error("scorer {scorer} failed: {message}")]
    Scorer { scorer: String, message: String },

    #[error("sample cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EvalError {
    /// Limit exits are not *errors* for `fail_on_error` accounting.
    pub fn is_limit(&self) -> bool {
        matches!(self, Self::Limit(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_errors_are_not_failures() {
        let e: EvalError = LimitExceeded::context().into();
        assert!(e.is_limit());
        assert!(!e.is_cancelled());
    }

    #[test]
    fn model_errors_convert() {
        let e: EvalError = ModelError::InvalidRequest("bad".into()).into();
        assert!(!e.is_limit());
        assert!(e.to_string().contains("invalid request"));
    }
}
