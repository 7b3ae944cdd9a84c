// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    error::ModelError,
    provider::ModelApi,
    types::{
        ChatMessage, GenerateConfig, ModelOutput, ModelUsage, Role, StopReason, ToolCall,
        ToolChoice, ToolInfo,
    },
};

/// Deterministic mock provider.  Echoes the last user message back as the
/// assistant response.
#[derive(Debug)]
pub struct MockModel {
    model: String,
}

impl MockModel {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into() }
    }
}

#[async_trait]
impl ModelApi for MockModel {
    fn scheme(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        input: &[ChatMessage],
        _tools: &[ToolInfo],
        _tool_choice: &ToolChoice,
        _config: &GenerateConfig,
    ) -> Result<ModelOutput, ModelError> {
        let reply = input
            .iter()
            .rev()
            .find(|m| m.role() == Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());
        let mut out = ModelOutput::from_content(&self.model, format!("MOCK: {reply}"));
        out.usage = ModelUsage::new(10, 10);
        Ok(out)
    }
}

/// One scripted turn: either a full [`ModelOutput`] or an error to raise.
pub type ScriptedReply = Result<ModelOutput, ModelError>;

/// The request a [`ScriptedModel`] saw, captured for assertions.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub input: Vec<ChatMessage>,
    pub tools: Vec<ToolInfo>,
    pub tool_choice: ToolChoice,
    pub config: GenerateConfig,
}

/// A pre-scripted provider.  Each `generate` call pops the next reply from
/// the front of the queue, so tests can specify exact output sequences —
/// including tool calls and transient failures — without network access.
#[derive(Debug)]
pub struct ScriptedModel {
    model: String,
    scripts: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<RecordedRequest>>,
    /// Reply used when the script queue is exhausted.
    fallback: Option<String>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<ScriptedReply>) -> Self {
        Self {
            model: "scripted-model".into(),
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            fallback: None,
        }
    }

    /// Provider that always returns the same text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let mut s = Self::new(vec![]);
        s.set_fallback_text(reply);
        s
    }

    /// Provider that returns the given texts in order, then the fallback.
    pub fn text_sequence<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            texts
                .into_iter()
                .map(|t| Ok(usage_text_output("scripted-model", t.into())))
                .collect(),
        )
    }

    /// Round 1 emits a single tool call; round 2 answers with text.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        function: impl Into<String>,
        arguments: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Ok(tool_call_output(
                "scripted-model",
                vec![ToolCall::new(tool_id, function, arguments)],
            )),
            Ok(usage_text_output("scripted-model", final_text.into())),
        ])
    }

    /// Fails `failures` times with a retryable HTTP 429, then replies with
    /// text.  Exercises the gateway's backoff path.
    pub fn transient_then_text(failures: usize, final_text: impl Into<String>) -> Self {
        let mut scripts: Vec<ScriptedReply> = (0..failures)
            .map(|_| Err(ModelError::transient("rate limited", Some(429))))
            .collect();
        scripts.push(Ok(usage_text_output("scripted-model", final_text.into())));
        Self::new(scripts)
    }

    /// Append a scripted reply to the back of the queue.
    pub fn push(&self, reply: ScriptedReply) {
        self.scripts.lock().unwrap().push_back(reply);
    }

    /// Number of `generate` calls observed so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The most recent request, if any call was made.
    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn set_fallback_text(&mut self, text: impl Into<String>) {
        self.fallback = Some(text.into());
    }
}

fn usage_text_output(model: &str, text: String) -> ModelOutput {
    let mut out = ModelOutput::from_content(model, text);
    out.usage = ModelUsage::new(5, 5);
    out
}

/// Output whose single choice carries tool calls and `stop_reason=tool_calls`.
pub fn tool_call_output(model: &str, calls: Vec<ToolCall>) -> ModelOutput {
    let msg = ChatMessage::assistant_with_calls("", calls);
    let mut out = ModelOutput::from_message(model, msg, StopReason::ToolCalls);
    out.usage = ModelUsage::new(5, 5);
    out
}

#[async_trait]
impl ModelApi for ScriptedModel {
    fn scheme(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        input: &[ChatMessage],
        tools: &[ToolInfo],
        tool_choice: &ToolChoice,
        config: &GenerateConfig,
    ) -> Result<ModelOutput, ModelError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            input: input.to_vec(),
            tools: tools.to_vec(),
            tool_choice: tool_choice.clone(),
            config: config.clone(),
        });
        let next = self.scripts.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => {
                // Fallback when all scripts are consumed — deterministic text
                // so agent loops terminate instead of erroring.
                let text = self
                    .fallback
                    .clone()
                    .unwrap_or_else(|| "[no more scripts]".into());
                Ok(usage_text_output(&self.model, text))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::user(text)]
    }

    async fn gen(api: &dyn ModelApi, input: &[ChatMessage]) -> ModelOutput {
        api.generate(input, &[], &ToolChoice::Auto, &GenerateConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let m = MockModel::new("echo");
        let out = gen(&m, &user("hi")).await;
        assert_eq!(out.completion(), "MOCK: hi");
        assert_eq!(out.usage.total_tokens, 20);
    }

    #[tokio::test]
    async fn scripted_replies_in_order_then_falls_back() {
        let m = ScriptedModel::text_sequence(["one", "two"]);
        assert_eq!(gen(&m, &user("a")).await.completion(), "one");
        assert_eq!(gen(&m, &user("b")).await.completion(), "two");
        assert_eq!(gen(&m, &user("c")).await.completion(), "[no more scripts]");
    }

    #[tokio::test]
    async fn tool_then_text_emits_tool_call_round() {
        let m = ScriptedModel::tool_then_text(
            "c1",
            "add",
            serde_json::json!({"x": 1, "y": 1}),
            "the answer is 2",
        );
        let first = gen(&m, &user("add 1 1")).await;
        assert_eq!(first.stop_reason(), StopReason::ToolCalls);
        assert_eq!(first.tool_calls()[0].function, "add");
        let second = gen(&m, &user("add 1 1")).await;
        assert_eq!(second.completion(), "the answer is 2");
    }

    #[tokio::test]
    async fn transient_then_text_raises_then_succeeds() {
        let m = ScriptedModel::transient_then_text(2, "done");
        let e1 = m
            .generate(&user("x"), &[], &ToolChoice::Auto, &GenerateConfig::default())
            .await;
        assert!(matches!(e1, Err(ModelError::Transient { status: Some(429), .. })));
        let e2 = m
            .generate(&user("x"), &[], &ToolChoice::Auto, &GenerateConfig::default())
            .await;
        assert!(e2.is_err());
        assert_eq!(gen(&m, &user("x")).await.completion(), "done");
    }

    #[tokio::test]
    async fn requests_are_recorded_for_inspection() {
        let m = ScriptedModel::always_text("ok");
        let _ = gen(&m, &user("inspect me")).await;
        assert_eq!(m.request_count(), 1);
        let req = m.last_request().unwrap();
        assert_eq!(req.input[0].text(), "inspect me");
    }
}
