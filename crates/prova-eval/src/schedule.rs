// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sample scheduler: drives N × epochs samples through the pipeline under
//! bounded concurrency.
//!
//! A counting semaphore gates concurrent samples (FIFO admission); the
//! sandbox pool gates environments independently so sandboxless samples do
//! not queue behind container provisioning.  Unexpected sample errors are
//! counted against the `fail_on_error` tolerance; crossing it broadcasts
//! cooperative cancellation to every in-flight sample.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use prova_core::{
    cancel_pair, run_scorers, run_solvers, CancelToken, EvalError, LimitTracker, SolveContext,
    Sample, TaskState, Transcript,
};
use prova_log::{EvalSample, LogRecorder, SampleBuffer};
use prova_model::{GenerateConfig, ModelGateway, ModelUsage};
use prova_sandbox::{select_default, SandboxPool, SandboxSpec};
use prova_tools::{ApprovalChain, ToolRegistry};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::task::ToolSetup;

/// Everything shared by every sample driver of one task run.
pub(crate) struct EvalShared {
    pub model_name: String,
    pub gateway: Arc<ModelGateway>,
    pub approval: Arc<ApprovalChain>,
    pub solvers: Vec<Arc<dyn prova_core::Solver>>,
    pub scorers: Vec<Arc<dyn prova_core::Scorer>>,
    pub tool_setup: Option<ToolSetup>,
    pub limits: prova_config::LimitsConfig,
    pub generate_config: GenerateConfig,
    pub sandboxes: Vec<SandboxSpec>,
    pub pool: SandboxPool,
    pub buffer: SampleBuffer,
    /// Minimum level for `Logger` events in sample transcripts.
    pub transcript_level: tracing::Level,
}

pub(crate) enum DriveOutcome {
    Done(Box<EvalSample>),
    /// Cancellation unwound the sample; nothing is recorded for it.
    Cancelled,
}

/// Run one (sample, epoch) through sandbox acquisition, the solver chain and
/// scoring.  Every failure mode except cancellation produces a record.
pub(crate) async fn drive_sample(
    shared: Arc<EvalShared>,
    sample: Sample,
    epoch: usize,
    cancel: CancelToken,
) -> DriveOutcome {
    let key = sample.id.to_string();
    let transcript = Transcript::with_sink(Some(shared.buffer.sink_for(&key, epoch)));
    transcript.set_logger_level(shared.transcript_level);
    let limits = Arc::new(LimitTracker::from_config(&shared.limits));
    let mut state = TaskState::new(
        &sample,
        epoch,
        &shared.model_name,
        Arc::clone(&limits),
        transcript.clone(),
    );

    // Sandbox slot is acquired after the sample slot (the fixed acquisition
    // order: sample → sandbox → model connection).
    let spec = sample
        .sandbox
        .clone()
        .or_else(|| select_default(&shared.sandboxes).cloned());
    let mut lease = None;
    let mut setup_error: Option<String> = None;
    match &spec {
        Some(spec) => {
            if cancel.is_cancelled() {
                return DriveOutcome::Cancelled;
            }
            let label = format!("{key}-e{epoch}");
            match shared
                .pool
                .acquire(spec, &label, &sample.files, sample.setup.as_deref())
                .await
            {
                Ok((acquired, waited)) => {
                    limits.record_waiting(waited);
                    state.sandbox = Some(Arc::clone(&acquired.env));
                    lease = Some(acquired);
                }
                Err(e) => setup_error = Some(format!("sandbox setup failed: {e}")),
            }
        }
        None => {
            if !sample.files.is_empty() || sample.setup.is_some() {
                setup_error =
                    Some("sample declares files or setup but no sandbox is configured".into());
            }
        }
    }

    // The tool set may capture the live sandbox or the store, so it is
    // built only now.
    if setup_error.is_none() {
        if let Some(setup) = &shared.tool_setup {
            state.tools = Arc::new(ToolRegistry::from_tools(setup(&state)));
        }
    }

    let result = match &setup_error {
        Some(message) => Err(EvalError::Internal(message.clone())),
        None => {
            let ctx = SolveContext {
                gateway: Arc::clone(&shared.gateway),
                approval: Arc::clone(&shared.approval),
                generate_config: shared.generate_config.clone(),
                cancel: cancel.clone(),
            };
            run_solvers(&shared.solvers, &mut state, &ctx).await
        }
    };

    // Environments release on every path so slots and containers never leak.
    state.sandbox = None;
    if let Some(lease) = lease {
        lease.release().await;
    }

    if matches!(result, Err(ref e) if e.is_cancelled()) {
        return DriveOutcome::Cancelled;
    }
    let error = result.as_ref().err().map(ToString::to_string);
    if let Some(message) = &error {
        transcript.error(message);
        warn!(sample = %key, epoch, error = %message, "sample errored");
    }

    // Scorers run on every terminal state: normal, limit, or error.
    let scores = run_scorers(&shared.scorers, &state, &sample.target).await;

    let snapshot = limits.snapshot();
    let events = transcript.events();
    let model_usage = sum_model_usage(&events);
    DriveOutcome::Done(Box::new(EvalSample {
        id: sample.id,
        epoch,
        input: sample.input,
        choices: sample.choices,
        target: sample.target,
        metadata: sample.metadata,
        messages: state.messages().to_vec(),
        output: state.output.clone(),
        scores,
        events,
        model_usage,
        total_time: snapshot.total_time,
        working_time: snapshot.working_time,
        error,
        limit: state.limit().map(|l| l.kind.to_string()),
        store: state.store.snapshot(),
        uuid: state.uuid.clone(),
        completed: result.is_ok(),
    }))
}

fn sum_model_usage(events: &[prova_core::Event]) -> ModelUsage {
    let mut usage = ModelUsage::default();
    for event in events {
        if let prova_core::EventBody::Model { output, .. } = &event.body {
            usage.add(&output.usage);
        }
    }
    usage
}

#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// Samples in flight at once.
    pub max_samples: usize,
    /// When set, clamps the effective sample bound (see
    /// `sandboxless_share_slots`).
    pub max_sandboxes: Option<usize>,
    /// Whether sandboxless samples count against the sandbox-derived clamp.
    pub sandboxless_share_slots: bool,
    pub fail_on_error: prova_config::FailOnError,
}

impl ScheduleOptions {
    pub fn effective_max_samples(&self) -> usize {
        let base = self.max_samples.max(1);
        match (self.max_sandboxes, self.sandboxless_share_slots) {
            (Some(sandboxes), true) => base.min(sandboxes.max(1)),
            _ => base,
        }
    }
}

pub(crate) struct ScheduleResult {
    pub records: Vec<EvalSample>,
    /// Set when the error tolerance tripped; carries the reason.
    pub failure: Option<String>,
    /// Set when an external cancellation stopped the run.
    pub cancelled: bool,
}

/// Fan the expanded runs out under the sample semaphore, recording each
/// completed sample as it lands.
pub(crate) async fn run_schedule(
    shared: Arc<EvalShared>,
    runs: Vec<(Sample, usize)>,
    options: &ScheduleOptions,
    recorder: &LogRecorder,
    external_cancel: Option<CancelToken>,
) -> anyhow::Result<ScheduleResult> {
    let total = runs.len();
    let tolerance = options.fail_on_error.tolerance(total);
    let semaphore = Arc::new(Semaphore::new(options.effective_max_samples()));
    let (cancel_handle, _root_token) = cancel_pair();
    let cancel_handle = Arc::new(cancel_handle);
    let externally_cancelled = Arc::new(AtomicBool::new(false));

    // Relay an external cancel (signal handler, operator) into the
    // scheduler's own broadcast.  An already-cancelled token is handled
    // synchronously so nothing is admitted at all.
    if matches!(&external_cancel, Some(token) if token.is_cancelled()) {
        externally_cancelled.store(true, Ordering::SeqCst);
        cancel_handle.cancel();
    }
    let relay = external_cancel.map(|token| {
        let flag = Arc::clone(&externally_cancelled);
        let handle = Arc::clone(&cancel_handle);
        let handle_token = cancel_handle.token();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    flag.store(true, Ordering::SeqCst);
                    handle.cancel();
                }
                () = handle_token.cancelled() => {}
            }
        })
    });

    let mut join = JoinSet::new();
    for (sample, epoch) in runs {
        let semaphore = Arc::clone(&semaphore);
        let shared = Arc::clone(&shared);
        let token = cancel_handle.token();
        join.spawn(async move {
            // Admission: FIFO on the semaphore.  A sample cancelled while
            // queued never starts.
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return DriveOutcome::Cancelled,
            };
            if token.is_cancelled() {
                return DriveOutcome::Cancelled;
            }
            drive_sample(shared, sample, epoch, token).await
        });
    }

    let mut records = Vec::new();
    let mut errored = 0usize;
    let mut failure: Option<String> = None;
    while let Some(next) = join.join_next().await {
        match next {
            Err(join_error) => {
                // A panicking sample driver is an engine bug: fail the eval.
                if failure.is_none() {
                    failure = Some(format!("sample driver panicked: {join_error}"));
                    cancel_handle.cancel();
                }
            }
            Ok(DriveOutcome::Cancelled) => {}
            Ok(DriveOutcome::Done(record)) => {
                let record = *record;
                recorder.record_sample(&record)?;
                if record.error.is_some() {
                    errored += 1;
                    if let Some(tolerance) = tolerance {
                        if errored > tolerance && failure.is_none() {
                            failure = Some(format!(
                                "{errored} samples errored, exceeding the tolerance of \
                                 {tolerance} (last: {})",
                                record.error.as_deref().unwrap_or_default()
                            ));
                            cancel_handle.cancel();
                        }
                    }
                }
                records.push(record);
            }
        }
    }
    if let Some(relay) = relay {
        relay.abort();
    }

    let cancelled = externally_cancelled.load(Ordering::SeqCst);
    debug!(
        total,
        completed = records.len(),
        errored,
        cancelled,
        "schedule finished"
    );
    Ok(ScheduleResult { records, failure, cancelled })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_bound_clamps_to_sandboxes_when_shared() {
        let opts = ScheduleOptions {
            max_samples: 8,
            max_sandboxes: Some(2),
            sandboxless_share_slots: true,
            fail_on_error: prova_config::FailOnError::Flag(false),
        };
        assert_eq!(opts.effective_max_samples(), 2);
    }

    #[test]
    fn effective_bound_ignores_sandboxes_when_not_shared() {
        let opts = ScheduleOptions {
            max_samples: 8,
            max_sandboxes: Some(2),
            sandboxless_share_slots: false,
            fail_on_error: prova_config::FailOnError::Flag(false),
        };
        assert_eq!(opts.effective_max_samples(), 8);
    }

    #[test]
    fn effective_bound_is_at_least_one() {
        let opts = ScheduleOptions {
            max_samples: 0,
            max_sandboxes: None,
            sandboxless_share_slots: true,
            fail_on_error: prova_config::FailOnError::Flag(true),
        };
        assert_eq!(opts.effective_max_samples(), 1);
    }
}
