// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::bail;
use prova_model::ModelRegistry;
use prova_sandbox::SandboxRegistry;

use crate::task::Task;

pub type TaskFactory = Arc<dyn Fn() -> Task + Send + Sync>;

/// Every pluggable component an eval can reach, bound at configuration time.
///
/// Passed explicitly from the orchestrator down — there is no process-global
/// registry of models, sandboxes or tasks.
pub struct ComponentRegistry {
    pub models: ModelRegistry,
    pub sandboxes: Arc<SandboxRegistry>,
    tasks: BTreeMap<String, TaskFactory>,
}

impl ComponentRegistry {
    pub fn new(models: ModelRegistry, sandboxes: SandboxRegistry) -> Self {
        Self { models, sandboxes: Arc::new(sandboxes), tasks: BTreeMap::new() }
    }

    /// Registry with the built-in providers (`mock/` models, `local` and
    /// `docker` sandboxes).
    pub fn with_builtins() -> Self {
        Self::new(ModelRegistry::with_builtins(), SandboxRegistry::with_builtins())
    }

    /// Register a task under its name so retries can rebuild it from the
    /// identifier recorded in a prior log.
    pub fn register_task<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Task + Send + Sync + 'static,
    {
        self.tasks.insert(name.into(), Arc::new(factory));
    }

    pub fn task(&self, name: &str) -> anyhow::Result<Task> {
        match self.tasks.get(name) {
            Some(factory) => Ok(factory()),
            None => {
                let known: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
                bail!(
                    "unknown task: {name:?}\nRegistered tasks: {}",
                    if known.is_empty() { "(none)".to_string() } else { known.join(", ") }
                )
            }
        }
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use prova_core::Sample;

    use super::*;

    #[test]
    fn builtins_include_mock_model_and_local_sandbox() {
        let reg = ComponentRegistry::with_builtins();
        assert!(reg.models.resolve("mock/m").is_ok());
        assert!(reg.sandboxes.get("local").is_ok());
    }

    #[test]
    fn task_factories_rebuild_by_name() {
        let mut reg = ComponentRegistry::with_builtins();
        reg.register_task("math", || {
            Task::new("math", vec![Sample::text(1, "1+1?", "2")])
        });
        let task = reg.task("math").unwrap();
        assert_eq!(task.name, "math");
        assert_eq!(task.dataset.len(), 1);
    }

    #[test]
    fn unknown_task_lists_registered_names() {
        let mut reg = ComponentRegistry::with_builtins();
        reg.register_task("alpha", || Task::new("alpha", vec![Sample::text(1, "q", "a")]));
        let err = reg.task("beta").unwrap_err().to_string();
        assert!(err.contains("unknown task"));
        assert!(err.contains("alpha"));
    }
}
