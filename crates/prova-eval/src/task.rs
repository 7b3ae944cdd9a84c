// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::bail;
use prova_config::{FailOnError, LimitsConfig};
use prova_core::{default_solvers, metrics::Reducer, Sample, Scorer, Solver, TaskState};
use prova_sandbox::SandboxSpec;
use prova_tools::{ApprovalChain, Tool};

/// Builds the per-sample tool set once the sample's sandbox (if any) is
/// live.  Tools needing the sandbox or store capture them from the state.
pub type ToolSetup = Arc<dyn Fn(&TaskState) -> Vec<Arc<dyn Tool>> + Send + Sync>;

/// A resolved task: dataset + solver pipeline + scorers + config.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub dataset: Vec<Sample>,
    pub solvers: Vec<Arc<dyn Solver>>,
    pub scorers: Vec<Arc<dyn Scorer>>,
    pub tool_setup: Option<ToolSetup>,
    /// Approval policy consulted before every tool call.
    pub approval: Arc<ApprovalChain>,
    pub config: TaskConfig,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dataset_len", &self.dataset.len())
            .field("solvers", &self.solvers.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("scorers", &self.scorers.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone)]
pub struct TaskConfig {
    /// Times each sample runs.  `None` inherits the eval default.
    pub epochs: Option<usize>,
    /// How per-sample scores reduce across epochs.
    pub epoch_reducer: Reducer,
    /// Per-sample limits; unset fields inherit the eval defaults.
    pub limits: LimitsConfig,
    /// Sandboxes the task declares; samples pick by name or get the default
    /// selection (named `default` > flagged > first).
    pub sandboxes: Vec<SandboxSpec>,
    /// Whether the dataset order was shuffled at load time.  Recorded in
    /// the log header; a shuffled log disables sample reuse on retry.
    pub shuffled: bool,
    /// Task-level override of the eval's error tolerance.
    pub fail_on_error: Option<FailOnError>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            epochs: None,
            epoch_reducer: Reducer::Mean,
            limits: LimitsConfig::default(),
            sandboxes: Vec::new(),
            shuffled: false,
            fail_on_error: None,
        }
    }
}

impl Task {
    pub fn new(name: impl Into<String>, dataset: Vec<Sample>) -> Self {
        Self {
            name: name.into(),
            dataset,
            solvers: default_solvers(),
            scorers: Vec::new(),
            tool_setup: None,
            approval: Arc::new(ApprovalChain::auto()),
            config: TaskConfig::default(),
        }
    }

    pub fn with_approval(mut self, approval: ApprovalChain) -> Self {
        self.approval = Arc::new(approval);
        self
    }

    pub fn with_solvers(mut self, solvers: Vec<Arc<dyn Solver>>) -> Self {
        self.solvers = solvers;
        self
    }

    pub fn with_scorer(mut self, scorer: impl Scorer + 'static) -> Self {
        self.scorers.push(Arc::new(scorer));
        self
    }

    pub fn with_tool_setup(mut self, setup: ToolSetup) -> Self {
        self.tool_setup = Some(setup);
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.config.epochs = Some(epochs);
        self
    }

    pub fn with_epoch_reducer(mut self, reducer: Reducer) -> Self {
        self.config.epoch_reducer = reducer;
        self
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn with_sandbox(mut self, spec: SandboxSpec) -> Self {
        self.config.sandboxes.push(spec);
        self
    }

    pub fn with_fail_on_error(mut self, policy: FailOnError) -> Self {
        self.config.fail_on_error = Some(policy);
        self
    }

    /// A task is runnable when its dataset is non-empty with unique ids.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dataset.is_empty() {
            bail!("task {} has an empty dataset", self.name);
        }
        let mut seen = HashSet::new();
        for sample in &self.dataset {
            if !seen.insert(sample.id.to_string()) {
                bail!(
                    "task {}: duplicate sample id {:?} (stable unique ids are required)",
                    self.name,
                    sample.id.to_string()
                );
            }
        }
        if self.config.epochs == Some(0) {
            bail!("task {}: epochs must be at least 1", self.name);
        }
        Ok(())
    }
}

/// Expand the dataset across epochs, interleaved: every sample at epoch 1,
/// then epoch 2, and so on.  Keeps early epochs finishing early so partial
/// results are balanced rather than clustered on the first samples.
pub fn expand_dataset(dataset: &[Sample], epochs: usize) -> Vec<(Sample, usize)> {
    let mut runs = Vec::with_capacity(dataset.len() * epochs.max(1));
    for epoch in 1..=epochs.max(1) {
        for sample in dataset {
            runs.push((sample.clone(), epoch));
        }
    }
    runs
}

/// Merge per-field: the task's limit wins where set, the default otherwise.
pub fn merge_limits(task: &LimitsConfig, default: &LimitsConfig) -> LimitsConfig {
    LimitsConfig {
        message_limit: task.message_limit.or(default.message_limit),
        token_limit: task.token_limit.or(default.token_limit),
        time_limit: task.time_limit.clone().or_else(|| default.time_limit.clone()),
        working_limit: task
            .working_limit
            .clone()
            .or_else(|| default.working_limit.clone()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
