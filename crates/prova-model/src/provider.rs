// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use crate::{
    error::ModelError,
    types::{ChatMessage, GenerateConfig, ModelOutput, ToolChoice, ToolInfo},
};

/// Contract between the engine and a model provider.
///
/// The engine never speaks a provider wire format itself; everything it needs
/// is a single `generate` call returning a [`ModelOutput`].  Concrete HTTP
/// providers live outside this workspace and register through the
/// [`crate::ModelRegistry`] by scheme prefix (`openai/`, `anthropic/`, …).
#[async_trait]
pub trait ModelApi: Send + Sync + std::fmt::Debug {
    /// Provider scheme this model was resolved from (e.g. `"mock"`).
    fn scheme(&self) -> &str;

    /// Model identifier as reported in outputs and logs.
    fn model_name(&self) -> &str;

    /// Run one generation over the full message sequence.
    async fn generate(
        &self,
        input: &[ChatMessage],
        tools: &[ToolInfo],
        tool_choice: &ToolChoice,
        config: &GenerateConfig,
    ) -> Result<ModelOutput, ModelError>;

    /// Default maximum output tokens for this model, when known.
    fn max_tokens(&self) -> Option<u32> {
        None
    }

    /// Default concurrent-connection limit for this provider/account.
    fn max_connections(&self) -> usize {
        10
    }

    /// Whether the gateway should retry this error.  The gateway additionally
    /// retries the HTTP status classes listed in
    /// [`ModelError::status_is_transient`].
    fn is_retryable(&self, error: &ModelError) -> bool {
        matches!(error, ModelError::Transient { .. })
    }

    /// Key that scopes the shared connection pool.  Providers serving several
    /// accounts can override this to give each account its own pool.
    fn connection_key(&self) -> String {
        format!("{}/{}", self.scheme(), self.model_name())
    }
}

/// Fully qualified model name (`scheme/model`).
pub fn qualified_name(api: &dyn ModelApi) -> String {
    format!("{}/{}", api.scheme(), api.model_name())
}
