// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retry controller: resume an interrupted or failed eval from its log.
//!
//! The task is rebuilt from the identifier recorded in the prior log, the
//! dataset is filtered to samples without a successful record, and the new
//! run inherits the prior `task_id` while writing a fresh artifact that
//! merges the reused records.

use std::path::Path;

use anyhow::{bail, Context};
use prova_config::FailOnError;
use prova_log::{read_log, EvalStatus};
use tracing::{info, warn};

use crate::runner::{eval, EvalOptions, EvalReport};

/// Option overrides applied on top of the prior run's configuration.
#[derive(Debug, Default, Clone)]
pub struct RetryOverrides {
    pub max_connections: Option<usize>,
    pub max_samples: Option<usize>,
    pub fail_on_error: Option<FailOnError>,
}

pub async fn eval_retry(
    log_path: &Path,
    mut options: EvalOptions,
    overrides: RetryOverrides,
) -> anyhow::Result<EvalReport> {
    let prior = read_log(log_path)
        .with_context(|| format!("reading prior log {}", log_path.display()))?;
    if prior.status == EvalStatus::Success {
        bail!(
            "log {} already completed successfully; nothing to retry",
            log_path.display()
        );
    }

    let task = options
        .registry
        .task(&prior.eval.task)
        .with_context(|| format!("rebuilding task {:?} for retry", prior.eval.task))?;

    // Sample reuse needs stable ids that still mean the same rows.  A
    // shuffled prior dataset breaks that mapping, so everything re-runs.
    let reuse = !prior.eval.dataset.shuffled;
    if !reuse {
        warn!(
            log = %log_path.display(),
            "prior dataset was shuffled; completed samples will not be reused"
        );
    }

    let completed_keys = if reuse {
        prior.successful_keys()
    } else {
        Default::default()
    };
    let prior_samples = if reuse {
        prior
            .samples
            .iter()
            .filter(|s| s.is_success())
            .cloned()
            .collect()
    } else {
        Vec::new()
    };
    info!(
        task = %prior.eval.task,
        reused = completed_keys.len(),
        "retrying eval from prior log"
    );

    if let Some(v) = overrides.max_connections {
        options.config.model.max_connections = Some(v);
    }
    if let Some(v) = overrides.max_samples {
        options.config.eval.max_samples = Some(v);
    }
    if let Some(v) = overrides.fail_on_error {
        options.config.eval.fail_on_error = v;
    }
    options.task_id = Some(prior.eval.task_id.clone());
    options.completed_keys = completed_keys;
    options.prior_samples = prior_samples;

    eval(&task, options).await
}
