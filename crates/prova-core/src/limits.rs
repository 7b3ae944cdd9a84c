// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-sample limit tracking.
//!
//! All limits are inclusive upper bounds; crossing one raises a
//! [`LimitExceeded`] carrying enough context for the scorer to still score
//! the terminal state.  Checks are idempotent reads.
//!
//! Working time is wall time minus the waits the engine itself performs
//! (gateway retries, connection queues, sandbox slots).  A provider that
//! retries internally without surfacing events cannot be deducted, so
//! working time is an upper bound on true model-facing time.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use prova_config::LimitsConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Message,
    Token,
    Time,
    Working,
    Operator,
    Context,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Message => "message",
            Self::Token => "token",
            Self::Time => "time",
            Self::Working => "working",
            Self::Operator => "operator",
            Self::Context => "context",
        };
        f.write_str(s)
    }
}

/// A limit was crossed.  The sample is terminated but still scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitExceeded {
    pub kind: LimitKind,
    /// Observed value at the time of the check (seconds for time kinds).
    pub value: f64,
    /// The configured ceiling (0 for operator/context, which have none).
    pub limit: f64,
    pub message: String,
}

impl std::error::Error for LimitExceeded {}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl LimitExceeded {
    fn new(kind: LimitKind, value: f64, limit: f64) -> Self {
        let message = match kind {
            LimitKind::Operator => "operator terminated the sample".to_string(),
            LimitKind::Context => "model context window exceeded".to_string(),
            _ => format!("{kind} limit exceeded: {value} > {limit}"),
        };
        Self { kind, value, limit, message }
    }

    pub fn operator(reason: impl Into<String>) -> Self {
        let mut e = Self::new(LimitKind::Operator, 0.0, 0.0);
        let reason = reason.into();
        if !reason.is_empty() {
            e.message = format!("operator terminated the sample: {reason}");
        }
        e
    }

    pub fn context() -> Self {
        Self::new(LimitKind::Context, 0.0, 0.0)
    }
}

/// Usage numbers for the sample record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsSnapshot {
    pub messages: usize,
    pub tokens: u64,
    pub total_time: f64,
    pub working_time: f64,
}

pub struct LimitTracker {
    message_limit: Option<usize>,
    token_limit: Option<u64>,
    time_limit: Option<Duration>,
    working_limit: Option<Duration>,
    started: Instant,
    messages: AtomicUsize,
    tokens: AtomicU64,
    waiting_micros: AtomicU64,
    operator_stop: AtomicBool,
    operator_reason: Mutex<String>,
}

impl LimitTracker {
    pub fn new(
        message_limit: Option<usize>,
        token_limit: Option<u64>,
        time_limit: Option<Duration>,
        working_limit: Option<Duration>,
    ) -> Self {
        Self {
            message_limit,
            token_limit,
            time_limit,
            working_limit,
            started: Instant::now(),
            messages: AtomicUsize::new(0),
            tokens: AtomicU64::new(0),
            waiting_micros: AtomicU64::new(0),
            operator_stop: AtomicBool::new(false),
            operator_reason: Mutex::new(String::new()),
        }
    }

    pub fn from_config(cfg: &LimitsConfig) -> Self {
        Self::new(
            cfg.message_limit,
            cfg.token_limit,
            cfg.time_limit(),
            cfg.working_limit(),
        )
    }

    pub fn unlimited() -> Self {
        Self::new(None, None, None, None)
    }

    // ── accounting ────────────────────────────────────────────────────────────

    pub fn set_messages(&self, count: usize) {
        self.messages.store(count, Ordering::SeqCst);
    }

    pub fn add_tokens(&self, tokens: u64) {
        self.tokens.fetch_add(tokens, Ordering::SeqCst);
    }

    /// Record time spent waiting on shared resources (retry sleeps,
    /// connection queues, sandbox slots).  Deducted from working time.
    pub fn record_waiting(&self, wait: Duration) {
        self.waiting_micros
            .fetch_add(wait.as_micros() as u64, Ordering::SeqCst);
    }

    /// Explicit "stop this sample" signal from a scorer, tool or human.
    pub fn trigger_operator(&self, reason: impl Into<String>) {
        *self.operator_reason.lock().unwrap() = reason.into();
        self.operator_stop.store(true, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn working(&self) -> Duration {
        let waited = Duration::from_micros(self.waiting_micros.load(Ordering::SeqCst));
        self.elapsed().saturating_sub(waited)
    }

    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> usize {
        self.messages.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> LimitsSnapshot {
        LimitsSnapshot {
            messages: self.messages(),
            tokens: self.tokens(),
            total_time: self.elapsed().as_secs_f64(),
            working_time: self.working().as_secs_f64(),
        }
    }

    // ── checks ────────────────────────────────────────────────────────────────

    /// Raise when appending one more message would cross the ceiling.
    /// Called before each generate and on every message mutation so the
    /// terminal state never holds more than `message_limit` messages.
    pub fn check_message_headroom(&self) -> Result<(), LimitExceeded> {
        if let Some(limit) = self.message_limit {
            let count = self.messages();
            if count >= limit {
                return Err(LimitExceeded::new(
                    LimitKind::Message,
                    (count + 1) as f64,
                    limit as f64,
                ));
            }
        }
        Ok(())
    }

    pub fn check_tokens(&self) -> Result<(), LimitExceeded> {
        if let Some(limit) = self.token_limit {
            let used = self.tokens();
            if used > limit {
                return Err(LimitExceeded::new(LimitKind::Token, used as f64, limit as f64));
            }
        }
        Ok(())
    }

    pub fn check_time(&self) -> Result<(), LimitExceeded> {
        if let Some(limit) = self.time_limit {
            let elapsed = self.elapsed();
            if elapsed > limit {
                return Err(LimitExceeded::new(
                    LimitKind::Time,
                    elapsed.as_secs_f64(),
                    limit.as_secs_f64(),
                ));
            }
        }
        if let Some(limit) = self.working_limit {
            let working = self.working();
            if working > limit {
                return Err(LimitExceeded::new(
                    LimitKind::Working,
                    working.as_secs_f64(),
                    limit.as_secs_f64(),
                ));
            }
        }
        Ok(())
    }

    pub fn check_operator(&self) -> Result<(), LimitExceeded> {
        if self.operator_stop.load(Ordering::SeqCst) {
            return Err(LimitExceeded::operator(
                self.operator_reason.lock().unwrap().clone(),
            ));
        }
        Ok(())
    }

    /// All checks except message headroom (which is mutation-scoped).
    pub fn check(&self) -> Result<(), LimitExceeded> {
        self.check_operator()?;
        self.check_tokens()?;
        self.check_time()?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_tracker_never_trips() {
        let t = LimitTracker::unlimited();
        t.set_messages(10_000);
        t.add_tokens(1_000_000);
        assert!(t.check().is_ok());
        assert!(t.check_message_headroom().is_ok());
    }

    #[test]
    fn message_headroom_trips_at_the_ceiling() {
        let t = LimitTracker::new(Some(6), None, None, None);
        t.set_messages(5);
        assert!(t.check_message_headroom().is_ok());
        t.set_messages(6);
        let e = t.check_message_headroom().unwrap_err();
        assert_eq!(e.kind, LimitKind::Message);
        assert_eq!(e.limit, 6.0);
    }

    #[test]
    fn token_limit_is_inclusive() {
        let t = LimitTracker::new(None, Some(100), None, None);
        t.add_tokens(100);
        assert!(t.check_tokens().is_ok(), "inclusive bound: 100 <= 100");
        t.add_tokens(1);
        let e = t.check_tokens().unwrap_err();
        assert_eq!(e.kind, LimitKind::Token);
        assert_eq!(e.value, 101.0);
    }

    #[test]
    fn checks_are_idempotent() {
        let t = LimitTracker::new(None, Some(10), None, None);
        t.add_tokens(11);
        assert!(t.check_tokens().is_err());
        assert!(t.check_tokens().is_err());
        assert_eq!(t.tokens(), 11, "checking must not mutate");
    }

    #[test]
    fn operator_trigger_trips_check() {
        let t = LimitTracker::unlimited();
        assert!(t.check_operator().is_ok());
        t.trigger_operator("scorer said stop");
        let e = t.check().unwrap_err();
        assert_eq!(e.kind, LimitKind::Operator);
        assert!(e.message.contains("scorer said stop"));
    }

    #[test]
    fn working_time_excludes_recorded_waits() {
        let t = LimitTracker::unlimited();
        std::thread::sleep(Duration::from_millis(30));
        t.record_waiting(Duration::from_millis(20));
        let snap = t.snapshot();
        assert!(snap.total_time > snap.working_time);
        assert!(snap.working_time >= 0.0);
    }

    #[test]
    fn working_limit_ignores_waited_time() {
        let t = LimitTracker::new(None, None, None, Some(Duration::from_millis(50)));
        std::thread::sleep(Duration::from_millis(60));
        // All of the elapsed time was waiting, so working time is ~0.
        t.record_waiting(Duration::from_millis(60));
        assert!(t.check_time().is_ok());
    }

    #[test]
    fn time_limit_trips_after_elapse() {
        let t = LimitTracker::new(None, None, Some(Duration::from_millis(10)), None);
        std::thread::sleep(Duration::from_millis(25));
        let e = t.check_time().unwrap_err();
        assert_eq!(e.kind, LimitKind::Time);
    }

    #[test]
    fn limit_exceeded_messages_read_well() {
        let t = LimitTracker::new(Some(6), None, None, None);
        t.set_messages(6);
        let e = t.check_message_headroom().unwrap_err();
        assert_eq!(e.to_string(), "message limit exceeded: 7 > 6");
        assert_eq!(LimitExceeded::context().to_string(), "model context window exceeded");
    }
}
