// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;

use crate::{mock::MockModel, provider::ModelApi};

/// Factory that turns a model name (the part after `scheme/`) into a provider.
pub type ModelFactory =
    Arc<dyn Fn(&str) -> anyhow::Result<Arc<dyn ModelApi>> + Send + Sync>;

/// Provider discovery by scheme prefix.
///
/// A model is named `"<scheme>/<model>"`; the scheme selects the factory and
/// the remainder is forwarded verbatim (it may itself contain slashes, e.g.
/// `openai/ft:gpt-4o/org/id`).  The registry is an explicit object handed to
/// the orchestrator at configuration time — there is no process-global
/// provider table.
pub struct ModelRegistry {
    factories: HashMap<String, ModelFactory>,
}

impl ModelRegistry {
    /// Empty registry with no providers.
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    /// Registry pre-loaded with the built-in test providers (`mock/`).
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register("mock", |model| {
            Ok(Arc::new(MockModel::new(model)) as Arc<dyn ModelApi>)
        });
        reg
    }

    pub fn register<F>(&mut self, scheme: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> anyhow::Result<Arc<dyn ModelApi>> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.into(), Arc::new(factory));
    }

    /// Register an already-constructed provider under a fixed full name.
    ///
    /// Useful for tests and embedders that build the provider themselves:
    /// resolving `"<scheme>/<model>"` returns the given instance when both
    /// parts match.
    pub fn register_instance(&mut self, api: Arc<dyn ModelApi>) {
        let expect = api.model_name().to_string();
        self.register(api.scheme().to_string(), move |model| {
            if model == expect {
                Ok(Arc::clone(&api))
            } else {
                bail!("model {model:?} not registered under this scheme")
            }
        });
    }

    /// Resolve `"<scheme>/<model>"` to a provider instance.
    pub fn resolve(&self, name: &str) -> anyhow::Result<Arc<dyn ModelApi>> {
        let (scheme, model) = match name.split_once('/') {
            Some(parts) => parts,
            None => bail!(
                "model name {name:?} is missing a provider scheme; \
                 expected \"<scheme>/<model>\" (e.g. \"mock/model\")"
            ),
        };
        match self.factories.get(scheme) {
            Some(factory) => factory(model),
            None => {
                let mut known: Vec<&str> =
                    self.factories.keys().map(String::as_str).collect();
                known.sort_unstable();
                bail!(
                    "unknown model provider scheme: {scheme:?}\n\
                     Known schemes: {}",
                    known.join(", ")
                )
            }
        }
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut s: Vec<String> = self.factories.keys().cloned().collect();
        s.sort_unstable();
        s
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
