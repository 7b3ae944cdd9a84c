// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

/// Failures raised by sandbox providers and environments.
///
/// The *expected* kinds (timeout, permission, decode, output limit) are
/// surfaced back to the model as tool errors; everything else fails the
/// sample.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("output is not valid UTF-8: {0}")]
    UnicodeDecode(String),

    #[error("{stream} exceeded the {limit} byte limit")]
    OutputLimit { stream: &'static str, limit: u64 },

    /// The sample's setup script failed (non-zero exit or spawn failure).
    #[error("sandbox setup failed: {0}")]
    Setup(String),

    #[error("unknown sandbox provider: {0}")]
    UnknownProvider(String),

    #[error("no such process: {0}")]
    NoSuchProcess(u32),

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox error: {0}")]
    Other(String),
}

impl SandboxError {
    /// Whether a model can sensibly react to this error (it becomes a
    /// tool-role error message instead of failing the sample).
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Permission(_)
                | Self::UnicodeDecode(_)
                | Self::OutputLimit { .. }
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_kinds_are_reportable_to_the_model() {
        assert!(SandboxError::Timeout(Duration::from_secs(1)).is_expected());
        assert!(SandboxError::Permission("denied".into()).is_expected());
        assert!(SandboxError::UnicodeDecode("bad byte".into()).is_expected());
        assert!(SandboxError::OutputLimit { stream: "stdout", limit: 1 }.is_expected());
    }

    #[test]
    fn unexpected_kinds_fail_the_sample() {
        assert!(!SandboxError::Setup("exit 1".into()).is_expected());
        assert!(!SandboxError::UnknownProvider("k8s".into()).is_expected());
        assert!(!SandboxError::Other("boom".into()).is_expected());
    }
}
