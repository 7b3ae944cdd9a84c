// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

fn default_epochs() -> usize {
    1
}

fn default_max_tasks() -> usize {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub eval: EvalDefaults,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sandbox: SandboxDefaults,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Defaults applied to every eval unless the task or call site overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalDefaults {
    /// Number of times each sample is run.  `(id, epoch)` is unique per run.
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Maximum samples in flight at once.  `None` falls back to the model's
    /// connection limit (running more samples than connections only queues).
    pub max_samples: Option<usize>,
    /// Maximum sandbox environments alive at once.  When set, the effective
    /// sample bound is clamped to this value (see `sandboxless_share_slots`).
    pub max_sandboxes: Option<usize>,
    /// Maximum tasks run in parallel when one eval call carries several.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    /// Cap on concurrently running local subprocesses (sandbox exec).
    pub max_subprocesses: Option<usize>,
    /// Error tolerance policy for unexpected sample failures.
    #[serde(default)]
    pub fail_on_error: FailOnError,
    /// Whether samples that declare no sandbox still count against the
    /// sandbox-derived effective sample bound.  The conservative reading of
    /// `max_sandboxes` clamps everything; set to `false` to let sandboxless
    /// samples bypass the clamp (they always respect `max_samples`).
    #[serde(default = "default_true")]
    pub sandboxless_share_slots: bool,
    /// Default per-sample limits; a task may tighten or replace these.
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for EvalDefaults {
    fn default() -> Self {
        Self {
            epochs: 1,
            max_samples: None,
            max_sandboxes: None,
            max_tasks: 1,
            max_subprocesses: None,
            fail_on_error: FailOnError::default(),
            sandboxless_share_slots: true,
            limits: LimitsConfig::default(),
        }
    }
}

/// How many unexpected sample errors an eval tolerates before aborting.
///
/// - `true`  — abort on the first error
/// - `false` — never abort; errored samples are logged and skipped
/// - value < 1.0 — tolerate up to `⌊value · N⌋` errored samples
/// - value ≥ 1.0 — tolerate up to `value` (as a count) errored samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailOnError {
    Flag(bool),
    Threshold(f64),
}

impl Default for FailOnError {
    fn default() -> Self {
        Self::Flag(true)
    }
}

impl FailOnError {
    /// Maximum number of errored samples tolerated for a dataset of `total`
    /// samples.  `None` means unlimited (never abort).
    pub fn tolerance(&self, total: usize) -> Option<usize> {
        match *self {
            Self::Flag(true) => Some(0),
            Self::Flag(false) => None,
            Self::Threshold(v) if v < 1.0 => Some((v * total as f64).floor() as usize),
            Self::Threshold(v) => Some(v as usize),
        }
    }
}

/// Per-sample limit ceilings.  All limits are inclusive upper bounds; a
/// breach terminates the sample, which is then scored against whatever state
/// exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum messages in the conversation (checked on mutation and before
    /// each generate call).
    pub message_limit: Option<usize>,
    /// Maximum total tokens across completed generations.
    pub token_limit: Option<u64>,
    /// Wall-clock ceiling, e.g. `"5m"` or `"90s"` (humantime syntax).
    pub time_limit: Option<String>,
    /// Working-time ceiling — wall clock minus retry and queue waits.
    pub working_limit: Option<String>,
}

impl LimitsConfig {
    pub fn time_limit(&self) -> Option<Duration> {
        parse_duration_opt(self.time_limit.as_deref())
    }

    pub fn working_limit(&self) -> Option<Duration> {
        parse_duration_opt(self.working_limit.as_deref())
    }
}

fn parse_duration_opt(s: Option<&str>) -> Option<Duration> {
    let s = s?;
    match humantime::parse_duration(s) {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!(value = %s, error = %e, "invalid duration in config; ignoring");
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Scheme-prefixed model identifier, e.g. `"mock/echo"`.  The part before
    /// the first `/` selects the provider; the rest is forwarded verbatim.
    pub name: String,
    /// Per-model connection limit.  `None` uses the provider's own default.
    pub max_connections: Option<usize>,
    /// Total per-call timeout (retries included), humantime syntax.
    pub timeout: Option<String>,
    /// Maximum tokens to request in a single generation.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Nucleus sampling cutoff.
    pub top_p: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "mock/model".into(),
            max_connections: None,
            timeout: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Option<Duration> {
        parse_duration_opt(self.timeout.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxDefaults {
    /// Provider used when a sample declares a sandbox without naming one.
    pub provider: String,
    /// Provider-specific config file (compose file, image spec, …).
    pub config: Option<String>,
    /// Keep environments alive after their sample completes (debugging).
    #[serde(default)]
    pub preserve: bool,
}

impl Default for SandboxDefaults {
    fn default() -> Self {
        Self {
            provider: "local".into(),
            config: None,
            preserve: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory eval logs are written to.  Default: `./logs`.
    pub dir: Option<String>,
    /// Tracing level for engine diagnostics (`error`..`trace`).
    pub level: Option<String>,
    /// Minimum level for `Logger` events recorded into sample transcripts.
    pub transcript_level: Option<String>,
    /// Fsync every sample-buffer append before returning to the caller.
    /// Disabling trades crash-safety of in-flight samples for throughput.
    #[serde(default = "default_true")]
    pub buffer_sync: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            level: None,
            transcript_level: None,
            buffer_sync: true,
        }
    }
}

impl LogConfig {
    /// Resolved log directory with `~` and `$VAR` expansion.
    pub fn resolved_dir(&self) -> PathBuf {
        let raw = self.dir.as_deref().unwrap_or("./logs");
        PathBuf::from(shellexpand::full(raw).map(|c| c.into_owned()).unwrap_or_else(|_| raw.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory for the model generate cache.  Default: the platform cache
    /// dir under `prova/generate`.
    pub dir: Option<String>,
    /// Default cache entry lifetime, humantime syntax, or `"never"` for no
    /// expiry.  `None` disables caching unless a call site opts in.
    pub expiry: Option<String>,
}

impl CacheConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        if let Some(raw) = self.dir.as_deref() {
            return PathBuf::from(
                shellexpand::full(raw)
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| raw.to_string()),
            );
        }
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("prova")
            .join("generate")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── FailOnError tolerance table ───────────────────────────────────────────

    #[test]
    fn fail_on_error_true_tolerates_nothing() {
        assert_eq!(FailOnError::Flag(true).tolerance(100), Some(0));
    }

    #[test]
    fn fail_on_error_false_is_unlimited() {
        assert_eq!(FailOnError::Flag(false).tolerance(100), None);
    }

    #[test]
    fn fail_on_error_fraction_floors() {
        assert_eq!(FailOnError::Threshold(0.1).tolerance(100), Some(10));
        assert_eq!(FailOnError::Threshold(0.05).tolerance(100), Some(5));
        assert_eq!(FailOnError::Threshold(0.1).tolerance(15), Some(1));
    }

    #[test]
    fn fail_on_error_count_passes_through() {
        assert_eq!(FailOnError::Threshold(8.0).tolerance(100), Some(8));
        assert_eq!(FailOnError::Threshold(1.0).tolerance(100), Some(1));
    }

    #[test]
    fn fail_on_error_deserialises_bool_and_number() {
        let f: FailOnError = serde_yaml::from_str("true").unwrap();
        assert_eq!(f, FailOnError::Flag(true));
        let f: FailOnError = serde_yaml::from_str("0.25").unwrap();
        assert_eq!(f, FailOnError::Threshold(0.25));
        let f: FailOnError = serde_yaml::from_str("3").unwrap();
        assert_eq!(f, FailOnError::Threshold(3.0));
    }

    // ── Durations ─────────────────────────────────────────────────────────────

    #[test]
    fn limits_parse_humantime_values() {
        let l = LimitsConfig {
            time_limit: Some("5m".into()),
            working_limit: Some("90s".into()),
            ..LimitsConfig::default()
        };
        assert_eq!(l.time_limit(), Some(Duration::from_secs(300)));
        assert_eq!(l.working_limit(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn invalid_duration_is_ignored_not_fatal() {
        let l = LimitsConfig {
            time_limit: Some("not-a-duration".into()),
            ..LimitsConfig::default()
        };
        assert_eq!(l.time_limit(), None);
    }

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn default_eval_runs_one_epoch_and_fails_fast() {
        let d = EvalDefaults::default();
        assert_eq!(d.epochs, 1);
        assert_eq!(d.fail_on_error, FailOnError::Flag(true));
        assert!(d.sandboxless_share_slots);
    }

    #[test]
    fn default_model_is_the_mock_provider() {
        assert_eq!(ModelConfig::default().name, "mock/model");
    }

    #[test]
    fn log_dir_defaults_to_local_logs() {
        assert_eq!(LogConfig::default().resolved_dir(), PathBuf::from("./logs"));
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let cfg = Config::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.eval.epochs, cfg.eval.epochs);
        assert_eq!(back.model.name, cfg.model.name);
    }
}
