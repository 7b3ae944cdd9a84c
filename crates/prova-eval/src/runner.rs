// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Eval orchestrator: binds model, sandbox pool, scheduler, scorers and the
//! log recorder into one run.
//!
//! The log is written progressively — header before the first sample runs,
//! every completed sample synced as it lands, footer on completion — so an
//! interruption at any point leaves a resumable artifact.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prova_config::Config;
use prova_core::{metrics, CancelToken};
use prova_log::{
    summarize_dataset, EvalErrorInfo, EvalLog, EvalPlan, EvalResults, EvalSample, EvalSpec,
    EvalStats, EvalStatus, GitInfo, LogRecorder, SampleReduction, LOG_VERSION,
};
use prova_model::{cache_from_config, GatewayOptions, GenerateConfig, ModelGateway};
use prova_sandbox::SandboxPool;
use tracing::{info, warn};

use crate::{
    registry::ComponentRegistry,
    schedule::{run_schedule, EvalShared, ScheduleOptions},
    task::{expand_dataset, merge_limits, Task},
};

#[derive(Clone)]
pub struct EvalOptions {
    pub config: Config,
    pub registry: Arc<ComponentRegistry>,
    /// Inherited from a prior log on retry; fresh runs generate one.
    pub task_id: Option<String>,
    /// Successfully completed records from a prior log, merged into the
    /// result set and re-recorded into the new artifact.
    pub prior_samples: Vec<EvalSample>,
    /// `(sample id, epoch)` pairs that are not re-run.
    pub completed_keys: HashSet<(String, usize)>,
    /// Operator-side cancellation (signal handler).
    pub external_cancel: Option<CancelToken>,
    /// Override the gateway's first retry delay (tests shrink it).
    pub retry_base: Option<Duration>,
    /// Override the configured log directory.
    pub log_dir: Option<PathBuf>,
}

impl EvalOptions {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(ComponentRegistry::with_builtins()),
            task_id: None,
            prior_samples: Vec::new(),
            completed_keys: HashSet::new(),
            external_cancel: None,
            retry_base: None,
            log_dir: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

#[derive(Debug)]
pub struct EvalReport {
    pub log: EvalLog,
    pub path: PathBuf,
}

impl EvalReport {
    pub fn status(&self) -> EvalStatus {
        self.log.status
    }
}

/// Run one task end to end and return the assembled log.
pub async fn eval(task: &Task, options: EvalOptions) -> anyhow::Result<EvalReport> {
    task.validate()?;
    let cfg = &options.config;

    // ── Model gateway ────────────────────────────────────────────────────────
    let api = options.registry.models.resolve(&cfg.model.name)?;
    let mut gateway_options = GatewayOptions {
        max_connections: cfg.model.max_connections,
        timeout: cfg.model.timeout(),
        cache: cache_from_config(&cfg.cache).map(Arc::new),
        ..GatewayOptions::default()
    };
    if let Some(base) = options.retry_base {
        gateway_options.retry_base = base;
    }
    let gateway = Arc::new(ModelGateway::new(Arc::clone(&api), gateway_options));
    let model_name = gateway.qualified_name();

    // ── Effective run parameters ─────────────────────────────────────────────
    let epochs = task.config.epochs.unwrap_or(cfg.eval.epochs).max(1);
    let fail_on_error = task.config.fail_on_error.unwrap_or(cfg.eval.fail_on_error);
    let limits = merge_limits(&task.config.limits, &cfg.eval.limits);
    let generate_config = GenerateConfig::from_model_config(&cfg.model);

    let runs: Vec<_> = expand_dataset(&task.dataset, epochs)
        .into_iter()
        .filter(|(sample, epoch)| {
            !options.completed_keys.contains(&(sample.id.to_string(), *epoch))
        })
        .collect();

    // ── Log header ───────────────────────────────────────────────────────────
    let created = Utc::now();
    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let task_id = options
        .task_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let eval_spec = EvalSpec {
        task: task.name.clone(),
        task_id,
        run_id,
        created,
        dataset: summarize_dataset(None, &task.dataset, epochs, task.config.shuffled),
        model: model_name.clone(),
        config: serde_json::json!({
            "epochs": epochs,
            "fail_on_error": fail_on_error,
            "max_samples": cfg.eval.max_samples,
            "max_sandboxes": cfg.eval.max_sandboxes,
            "sandboxless_share_slots": cfg.eval.sandboxless_share_slots,
            "limits": &limits,
        }),
        packages: BTreeMap::from([(
            "prova".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        )]),
        git: collect_git_info(),
    };
    let plan = EvalPlan {
        steps: task.solvers.iter().map(|s| s.name().to_string()).collect(),
        config: serde_json::to_value(&generate_config)?,
    };
    let log_dir = options
        .log_dir
        .clone()
        .unwrap_or_else(|| cfg.log.resolved_dir());
    let recorder =
        LogRecorder::create(&log_dir, eval_spec.clone(), plan.clone(), cfg.log.buffer_sync)?;
    info!(task = %task.name, model = %model_name, samples = runs.len(),
        log = %recorder.path().display(), "eval started");

    // ── Schedule ─────────────────────────────────────────────────────────────
    let shared = Arc::new(EvalShared {
        model_name,
        gateway: Arc::clone(&gateway),
        approval: Arc::clone(&task.approval),
        solvers: task.solvers.clone(),
        scorers: task.scorers.clone(),
        tool_setup: task.tool_setup.clone(),
        limits,
        generate_config,
        sandboxes: task.config.sandboxes.clone(),
        pool: SandboxPool::new(
            Arc::clone(&options.registry.sandboxes),
            cfg.eval.max_sandboxes,
            cfg.sandbox.preserve,
        ),
        buffer: recorder.buffer().clone(),
        transcript_level: transcript_level(cfg),
    });
    let schedule_options = ScheduleOptions {
        max_samples: cfg.eval.max_samples.unwrap_or_else(|| api.max_connections()),
        max_sandboxes: cfg.eval.max_sandboxes,
        sandboxless_share_slots: cfg.eval.sandboxless_share_slots,
        fail_on_error,
    };
    let outcome = run_schedule(
        shared,
        runs,
        &schedule_options,
        &recorder,
        options.external_cancel.clone(),
    )
    .await?;

    // ── Merge prior (retry) samples into the new artifact ────────────────────
    for prior in &options.prior_samples {
        recorder.record_sample(prior)?;
    }
    let mut samples = outcome.records;
    samples.extend(options.prior_samples.iter().cloned());
    samples.sort_by_key(|s| (s.id.clone(), s.epoch));

    // ── Close out ────────────────────────────────────────────────────────────
    let results = aggregate_results(task, &samples);
    let status = if outcome.failure.is_some() {
        EvalStatus::Error
    } else if outcome.cancelled {
        EvalStatus::Cancelled
    } else {
        EvalStatus::Success
    };
    let error = outcome.failure.map(|message| EvalErrorInfo {
        message,
        traceback: None,
        traceback_ansi: None,
    });
    let stats = EvalStats {
        started_at: created,
        completed_at: Utc::now(),
        model_usage: gateway.usage(),
    };
    recorder.finalize(status, Some(results.clone()), Some(stats.clone()), error.clone())?;
    info!(task = %task.name, ?status, samples = samples.len(), "eval finished");

    Ok(EvalReport {
        log: EvalLog {
            version: LOG_VERSION,
            status,
            eval: eval_spec,
            plan,
            results: Some(results),
            stats: Some(stats),
            error,
            samples,
        },
        path: recorder.path().to_path_buf(),
    })
}

/// Run several tasks with at most `max_tasks` in parallel.
///
/// Each task writes its own artifact and a failing task does not stop the
/// others; results come back in task order, per-task errors included.
pub async fn eval_set(
    tasks: Vec<Task>,
    options: EvalOptions,
) -> Vec<anyhow::Result<EvalReport>> {
    let max_tasks = options.config.eval.max_tasks.max(1);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(max_tasks));

    let mut join = tokio::task::JoinSet::new();
    let total = tasks.len();
    for (index, task) in tasks.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let options = options.clone();
        join.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            (index, eval(&task, options).await)
        });
    }

    let mut results: Vec<Option<anyhow::Result<EvalReport>>> =
        (0..total).map(|_| None).collect();
    while let Some(joined) = join.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => warn!(error = %e, "task driver panicked"),
        }
    }
    results
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| Err(anyhow::anyhow!("task driver panicked")))
        })
        .collect()
}

/// Reduce per-sample scores to the headline metrics section.
fn aggregate_results(task: &Task, samples: &[EvalSample]) -> EvalResults {
    let completed_samples = samples.iter().filter(|s| s.is_success()).count();
    let mut scores = Vec::new();
    let mut sample_reductions = Vec::new();

    for scorer in &task.scorers {
        let name = scorer.name();
        let mut values_by_sample: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for sample in samples {
            if let Some(value) =
                sample.scores.get(name).and_then(|score| score.value.as_f64())
            {
                values_by_sample
                    .entry(sample.id.to_string())
                    .or_default()
                    .push(value);
            }
        }
        let summary = metrics::aggregate(name, &task.config.epoch_reducer, &values_by_sample);
        sample_reductions.push(SampleReduction {
            scorer: name.to_string(),
            reducer: summary.reducer.clone(),
            samples: values_by_sample
                .iter()
                .map(|(id, values)| (id.clone(), task.config.epoch_reducer.reduce(values)))
                .collect(),
        });
        scores.push(summary);
    }

    EvalResults {
        scores,
        total_samples: samples.len(),
        completed_samples,
        sample_reductions,
    }
}

fn transcript_level(cfg: &Config) -> tracing::Level {
    match cfg.log.transcript_level.as_deref() {
        None => tracing::Level::INFO,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(value = raw, "invalid transcript log level; using info");
            tracing::Level::INFO
        }),
    }
}

/// Best-effort git context for the log header.
fn collect_git_info() -> Option<GitInfo> {
    let commit = git_output(&["rev-parse", "HEAD"])?;
    let branch = git_output(&["rev-parse", "--abbrev-ref", "HEAD"]);
    Some(GitInfo { commit, branch })
}

fn git_output(args: &[&str]) -> Option<String> {
    let output = std::process::Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        warn!("git reported an empty value for {args:?}");
        return None;
    }
    Some(text)
}
