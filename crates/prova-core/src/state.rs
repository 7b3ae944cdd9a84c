// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use prova_model::{ChatMessage, ModelOutput, ToolChoice};
use prova_sandbox::{FileSource, SandboxEnvironment, SandboxSpec};
use prova_tools::ToolRegistry;
use serde::{Deserialize, Serialize};

use crate::{
    limits::{LimitExceeded, LimitTracker},
    store::StoreHandle,
    transcript::{EventBody, Transcript},
};

/// Stable sample identifier: user datasets use strings or integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleId {
    Int(i64),
    Text(String),
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for SampleId {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for SampleId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SampleId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Sample input: a bare prompt or a pre-built message sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleInput {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl SampleInput {
    /// Seed messages for a fresh task state.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        match self {
            Self::Text(t) => vec![ChatMessage::user(t.clone())],
            Self::Messages(msgs) => msgs.clone(),
        }
    }

    /// The prompt text (first user message for message-form inputs).
    pub fn text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Messages(msgs) => msgs
                .iter()
                .find(|m| m.role() == prova_model::Role::User)
                .map(|m| m.text())
                .unwrap_or_default(),
        }
    }
}

/// Reference answers: accepts a single string or a list in serialised form.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Targets(pub Vec<String>);

impl Targets {
    pub fn one(target: impl Into<String>) -> Self {
        Self(vec![target.into()])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for Targets {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(s) => Targets(vec![s]),
            OneOrMany::Many(v) => Targets(v),
        })
    }
}

/// One dataset row — immutable input to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: SampleId,
    pub input: SampleInput,
    #[serde(default)]
    pub target: Targets,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Files staged into the sandbox before any solver runs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileSource>,
    /// Script run in the sandbox after files are staged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<String>,
    /// Per-sample sandbox override; the task default applies otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSpec>,
}

impl Sample {
    pub fn text(
        id: impl Into<SampleId>,
        input: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            input: SampleInput::Text(input.into()),
            target: Targets::one(target),
            choices: Vec::new(),
            metadata: serde_json::Map::new(),
            files: BTreeMap::new(),
            setup: None,
            sandbox: None,
        }
    }
}

/// Mutable per-(sample, epoch) state owned by the engine for the lifetime of
/// one sample.  Exclusively mutated by that sample's solver chain; observers
/// read consistent snapshots through the transcript and store handles.
pub struct TaskState {
    pub sample_id: SampleId,
    pub epoch: usize,
    pub model: String,
    messages: Vec<ChatMessage>,
    /// Ordered answer labels for multiple-choice samples.
    pub choices: Vec<String>,
    pub output: ModelOutput,
    pub tools: Arc<ToolRegistry>,
    pub tool_choice: ToolChoice,
    pub store: StoreHandle,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub completed: bool,
    pub limits: Arc<LimitTracker>,
    pub transcript: Transcript,
    pub sandbox: Option<Arc<dyn SandboxEnvironment>>,
    limit_error: Option<LimitExceeded>,
    /// Unique id of this (sample, epoch) execution in the log.
    pub uuid: String,
}

impl TaskState {
    pub fn new(
        sample: &Sample,
        epoch: usize,
        model: impl Into<String>,
        limits: Arc<LimitTracker>,
        transcript: Transcript,
    ) -> Self {
        let store = StoreHandle::new(Some(transcript.clone()));
        let messages = sample.input.to_messages();
        limits.set_messages(messages.len());
        transcript.record(EventBody::SampleInit {
            sample_id: sample.id.to_string(),
            epoch,
        });
        Self {
            sample_id: sample.id.clone(),
            epoch,
            model: model.into(),
            messages,
            choices: sample.choices.clone(),
            output: ModelOutput::default(),
            tools: Arc::new(ToolRegistry::new()),
            tool_choice: ToolChoice::Auto,
            store,
            metadata: sample.metadata.clone(),
            completed: false,
            limits,
            transcript,
            sandbox: None,
            limit_error: None,
            uuid: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Append a message, enforcing the message limit.  On breach the message
    /// is *not* appended, so the terminal state never exceeds the ceiling.
    pub fn push_message(&mut self, message: ChatMessage) -> Result<(), LimitExceeded> {
        self.limits.check_message_headroom()?;
        self.messages.push(message);
        self.limits.set_messages(self.messages.len());
        Ok(())
    }

    /// Insert a system message after any existing system messages.
    pub fn insert_system_message(&mut self, message: ChatMessage) -> Result<(), LimitExceeded> {
        self.limits.check_message_headroom()?;
        let at = self
            .messages
            .iter()
            .position(|m| m.role() != prova_model::Role::System)
            .unwrap_or(self.messages.len());
        self.messages.insert(at, message);
        self.limits.set_messages(self.messages.len());
        Ok(())
    }

    /// Replace the message list wholesale (history-editing solvers).
    pub fn set_messages(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
        self.limits.set_messages(self.messages.len());
    }

    /// Rewrite the first user message (prompt templating).
    pub fn rewrite_user_prompt(&mut self, f: impl FnOnce(&str) -> String) {
        if let Some(pos) = self
            .messages
            .iter()
            .position(|m| m.role() == prova_model::Role::User)
        {
            let text = self.messages[pos].text();
            self.messages[pos] = ChatMessage::user(f(&text));
        }
    }

    /// The assistant's final text answer, if any.
    pub fn completion(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role() == prova_model::Role::Assistant)
            .map(|m| m.text())
            .unwrap_or_default()
    }

    /// Mark the sample limit-complete and record the event.  The sample is
    /// scored against this terminal state.
    pub fn record_limit(&mut self, limit: LimitExceeded) {
        self.transcript.record(EventBody::SampleLimit {
            kind: limit.kind.to_string(),
            message: limit.message.clone(),
        });
        self.limit_error = Some(limit);
        self.completed = true;
    }

    pub fn limit(&self) -> Option<&LimitExceeded> {
        self.limit_error.as_ref()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn state(sample: &Sample, message_limit: Option<usize>) -> TaskState {
        TaskState::new(
            sample,
            1,
            "mock/model",
            Arc::new(LimitTracker::new(message_limit, None, None, None)),
            Transcript::new(),
        )
    }

    #[test]
    fn text_input_seeds_a_user_message() {
        let sample = Sample::text(1, "What is 1 + 1?", "2");
        let st = state(&sample, None);
        assert_eq!(st.messages().len(), 1);
        assert_eq!(st.messages()[0].text(), "What is 1 + 1?");
    }

    #[test]
    fn sample_init_event_is_recorded() {
        let sample = Sample::text("s-1", "q", "a");
        let st = state(&sample, None);
        let events = st.transcript.events();
        assert!(matches!(
            &events[0].body,
            EventBody::SampleInit { sample_id, epoch: 1 } if sample_id == "s-1"
        ));
    }

    #[test]
    fn push_message_updates_limit_count() {
        let sample = Sample::text(1, "q", "a");
        let mut st = state(&sample, None);
        st.push_message(ChatMessage::assistant("r")).unwrap();
        assert_eq!(st.limits.messages(), 2);
    }

    #[test]
    fn push_beyond_message_limit_keeps_state_at_the_ceiling() {
        let sample = Sample::text(1, "q", "a");
        let mut st = state(&sample, Some(2));
        st.push_message(ChatMessage::assistant("one")).unwrap();
        let err = st.push_message(ChatMessage::assistant("two")).unwrap_err();
        assert_eq!(err.kind, crate::limits::LimitKind::Message);
        assert_eq!(st.messages().len(), 2, "breaching push must not append");
    }

    #[test]
    fn insert_system_message_goes_before_user_content() {
        let sample = Sample::text(1, "q", "a");
        let mut st = state(&sample, None);
        st.insert_system_message(ChatMessage::system("be brief")).unwrap();
        assert_eq!(st.messages()[0].role(), prova_model::Role::System);
        assert_eq!(st.messages()[1].role(), prova_model::Role::User);
    }

    #[test]
    fn completion_is_last_assistant_text() {
        let sample = Sample::text(1, "q", "a");
        let mut st = state(&sample, None);
        st.push_message(ChatMessage::assistant("first")).unwrap();
        st.push_message(ChatMessage::user("again")).unwrap();
        st.push_message(ChatMessage::assistant("final")).unwrap();
        assert_eq!(st.completion(), "final");
    }

    #[test]
    fn record_limit_completes_the_sample() {
        let sample = Sample::text(1, "q", "a");
        let mut st = state(&sample, None);
        st.record_limit(crate::limits::LimitExceeded::context());
        assert!(st.completed);
        assert!(st.limit().is_some());
        assert!(st
            .transcript
            .events()
            .iter()
            .any(|e| matches!(&e.body, EventBody::SampleLimit { kind, .. } if kind == "context")));
    }

    #[test]
    fn sample_id_accepts_strings_and_ints() {
        let a: SampleId = serde_json::from_str("3").unwrap();
        assert_eq!(a, SampleId::Int(3));
        let b: SampleId = serde_json::from_str("\"row-7\"").unwrap();
        assert_eq!(b.to_string(), "row-7");
    }

    #[test]
    fn targets_accept_string_or_list() {
        let one: Targets = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(one.0, vec!["42"]);
        let many: Targets = serde_json::from_str("[\"a\", \"b\"]").unwrap();
        assert_eq!(many.0, vec!["a", "b"]);
    }

    #[test]
    fn sample_round_trips_through_json() {
        let sample = Sample::text("id-1", "prompt", "answer");
        let json = serde_json::to_string(&sample).unwrap();
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample);
    }
}
