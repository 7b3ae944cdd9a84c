// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-sample transcript: an ordered, append-only event stream.
//!
//! Events are immutable once appended and carry a timestamp, their own
//! monotonic span id and the id of the enclosing span.  Spans strictly nest
//! within a sample.  A transcript may tee every appended event into a sink
//! (the log recorder's sample buffer) so external viewers can tail live
//! samples.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use prova_model::ModelOutput;
use serde::{Deserialize, Serialize};

use crate::store::StoreChange;

/// Sink for teeing events as they are appended.
pub type EventSink = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    /// Monotonic within the sample; doubles as the span identity for
    /// `span_begin` events.
    pub span_id: u64,
    /// The enclosing span, when one is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u64>,
    #[serde(flatten)]
    pub body: EventBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventBody {
    SampleInit {
        sample_id: String,
        epoch: usize,
    },
    SampleLimit {
        kind: String,
        message: String,
    },
    /// Store mutations since the previous state event.
    State {
        changes: Vec<StoreChange>,
    },
    Model {
        model: String,
        /// Number of input messages sent (the full sequences live on the
        /// sample record; repeating them per call would dwarf the log).
        input_messages: usize,
        output: ModelOutput,
        cache_hit: bool,
    },
    Tool {
        id: String,
        function: String,
        arguments: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Approval {
        function: String,
        decision: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
    },
    /// Human-facing log line routed into the transcript.
    Logger {
        level: String,
        message: String,
    },
    Error {
        message: String,
    },
    Info {
        source: String,
        data: serde_json::Value,
    },
    SpanBegin {
        kind: String,
        name: String,
    },
    SpanEnd {},
    StepBegin {
        name: String,
    },
    StepEnd {
        name: String,
    },
    Subtask {
        name: String,
        input: serde_json::Value,
        result: serde_json::Value,
    },
}

struct TranscriptInner {
    events: Mutex<Vec<Event>>,
    next_id: AtomicU64,
    span_stack: Mutex<Vec<u64>>,
    sink: Option<EventSink>,
    /// Minimum level for `Logger` events (`PROVA_LOG_LEVEL_TRANSCRIPT`).
    logger_level: Mutex<tracing::Level>,
}

#[derive(Clone)]
pub struct Transcript {
    inner: Arc<TranscriptInner>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        Self::with_sink(None)
    }

    pub fn with_sink(sink: Option<EventSink>) -> Self {
        Self {
            inner: Arc::new(TranscriptInner {
                events: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                span_stack: Mutex::new(Vec::new()),
                sink,
                logger_level: Mutex::new(tracing::Level::INFO),
            }),
        }
    }

    /// Set the minimum level recorded by [`Transcript::logger`].
    pub fn set_logger_level(&self, level: tracing::Level) {
        *self.inner.logger_level.lock().unwrap() = level;
    }

    /// Append one event; assigns the timestamp and span ids.
    pub fn record(&self, body: EventBody) -> u64 {
        let span_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let parent_id = self.inner.span_stack.lock().unwrap().last().copied();
        let event = Event { timestamp: Utc::now(), span_id, parent_id, body };
        if let Some(sink) = &self.inner.sink {
            sink(&event);
        }
        self.inner.events.lock().unwrap().push(event);
        span_id
    }

    /// Open a span; subsequent events nest under it until [`end_span`].
    ///
    /// [`end_span`]: Transcript::end_span
    pub fn begin_span(&self, kind: impl Into<String>, name: impl Into<String>) -> u64 {
        let id = self.record(EventBody::SpanBegin { kind: kind.into(), name: name.into() });
        self.inner.span_stack.lock().unwrap().push(id);
        id
    }

    pub fn end_span(&self) {
        // Record before popping so the end event nests inside the span it
        // closes.
        self.record(EventBody::SpanEnd {});
        self.inner.span_stack.lock().unwrap().pop();
    }

    pub fn logger(&self, level: tracing::Level, message: impl Into<String>) {
        // tracing orders levels ERROR < ... < TRACE, so "more verbose than
        // the gate" compares greater.
        if level > *self.inner.logger_level.lock().unwrap() {
            return;
        }
        self.record(EventBody::Logger {
            level: level.to_string().to_lowercase(),
            message: message.into(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(EventBody::Error { message: message.into() });
    }

    /// Snapshot of all events appended so far.
    pub fn events(&self) -> Vec<Event> {
        self.inner.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_appended_in_order_with_monotonic_ids() {
        let t = Transcript::new();
        t.record(EventBody::Info { source: "a".into(), data: serde_json::json!(1) });
        t.record(EventBody::Info { source: "b".into(), data: serde_json::json!(2) });
        let events = t.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].span_id < events[1].span_id);
        assert!(events[0].timestamp <= events[1].timestamp);
    }

    #[test]
    fn span_nesting_sets_parent_ids() {
        let t = Transcript::new();
        let outer = t.begin_span("solver", "generate");
        let inner = t.begin_span("agent", "loop");
        t.record(EventBody::Info { source: "x".into(), data: serde_json::json!({}) });
        t.end_span();
        t.end_span();

        let events = t.events();
        // begin(outer), begin(inner), info, end(inner), end(outer)
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].parent_id, None);
        assert_eq!(events[1].parent_id, Some(outer));
        assert_eq!(events[2].parent_id, Some(inner));
        assert_eq!(events[3].parent_id, Some(inner));
        assert_eq!(events[4].parent_id, Some(outer));
    }

    #[test]
    fn span_begin_and_end_are_balanced() {
        let t = Transcript::new();
        t.begin_span("scorer", "exact");
        t.end_span();
        let begins = t.events().iter().filter(|e| matches!(e.body, EventBody::SpanBegin { .. })).count();
        let ends = t.events().iter().filter(|e| matches!(e.body, EventBody::SpanEnd {})).count();
        assert_eq!(begins, ends);
    }

    #[test]
    fn sink_sees_every_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_sink = Arc::clone(&seen);
        let sink: EventSink = Arc::new(move |e: &Event| {
            seen_in_sink.lock().unwrap().push(e.span_id);
        });
        let t = Transcript::with_sink(Some(sink));
        t.record(EventBody::Error { message: "one".into() });
        t.record(EventBody::Error { message: "two".into() });
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn event_wire_form_is_tagged() {
        let t = Transcript::new();
        t.record(EventBody::SampleLimit { kind: "message".into(), message: "m".into() });
        let json = serde_json::to_value(&t.events()[0]).unwrap();
        assert_eq!(json["event"], "sample_limit");
        assert_eq!(json["kind"], "message");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn logger_levels_render_lowercase() {
        let t = Transcript::new();
        t.logger(tracing::Level::WARN, "heads up");
        match &t.events()[0].body {
            EventBody::Logger { level, message } => {
                assert_eq!(level, "warn");
                assert_eq!(message, "heads up");
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn logger_respects_the_transcript_level_gate() {
        let t = Transcript::new();
        t.logger(tracing::Level::DEBUG, "too quiet by default");
        assert!(t.is_empty());
        t.set_logger_level(tracing::Level::DEBUG);
        t.logger(tracing::Level::DEBUG, "now recorded");
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn step_and_subtask_events_serialise_with_tags() {
        let t = Transcript::new();
        t.record(EventBody::StepBegin { name: "setup".into() });
        t.record(EventBody::Subtask {
            name: "lookup".into(),
            input: serde_json::json!({"q": 1}),
            result: serde_json::json!("found"),
        });
        t.record(EventBody::StepEnd { name: "setup".into() });
        let json = serde_json::to_value(t.events()).unwrap();
        assert_eq!(json[0]["event"], "step_begin");
        assert_eq!(json[1]["event"], "subtask");
        assert_eq!(json[2]["event"], "step_end");
    }
}
