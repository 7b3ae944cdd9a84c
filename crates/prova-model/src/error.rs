// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

/// Errors surfaced by a model provider or the gateway wrapping it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    /// A transient condition (connect failure, 408/409/429/5xx, overloaded).
    /// The gateway retries these within its backoff budget.
    #[error("transient provider error{}: {message}", status_suffix(.status))]
    Transient { message: String, status: Option<u16> },

    /// The request itself is malformed (HTTP 400 class).  Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication / authorization failure.  Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The per-call timeout elapsed (retries included).
    #[error("generate call timed out after {0:?}")]
    Timeout(Duration),

    /// The call was cancelled cooperatively (sample cancellation).
    #[error("generate call cancelled")]
    Cancelled,

    /// Any other provider-reported failure.
    #[error("provider error: {0}")]
    Provider(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl ModelError {
    pub fn transient(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Transient { message: message.into(), status }
    }

    /// HTTP status codes the gateway treats as transient regardless of the
    /// provider's own classification.
    pub fn status_is_transient(status: u16) -> bool {
        matches!(status, 408 | 409 | 429) || (500..600).contains(&status)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
