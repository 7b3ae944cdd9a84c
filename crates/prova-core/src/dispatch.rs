// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-call dispatch: validate, approve, execute, and wrap results.
//!
//! Calls are resolved and validated in order, reviewed by the approval
//! chain, then executed — concurrently for parallel-safe tools, serially per
//! tool otherwise.  Results are appended in *call order* regardless of
//! completion order, so conversations stay deterministic.  Expected tool
//! failures become tool-role error messages; unexpected failures abort the
//! sample.

use std::collections::HashMap;
use std::sync::Arc;

use prova_model::{ChatMessage, Content, ToolCall};
use prova_tools::{
    validate_arguments, ApprovalChain, ApprovalDecision, Tool, ToolError, ToolRegistry,
    truncate_output, TOOL_OUTPUT_LIMIT,
};
use tokio::task::JoinSet;
use tracing::debug;

use crate::{
    cancel::CancelToken,
    error::EvalError,
    transcript::{EventBody, Transcript},
};

pub async fn dispatch_tools(
    calls: &[ToolCall],
    registry: &Arc<ToolRegistry>,
    approval: &ApprovalChain,
    transcript: &Transcript,
    cancel: &CancelToken,
) -> Result<Vec<ChatMessage>, EvalError> {
    let mut outcomes: Vec<Option<Result<Content, ToolError>>> =
        calls.iter().map(|_| None).collect();
    let mut ready: Vec<(usize, Arc<dyn Tool>, serde_json::Value)> = Vec::new();

    // Phase 1: resolve, validate, approve — strictly in call order.
    for (index, call) in calls.iter().enumerate() {
        if let Some(parse_error) = &call.parse_error {
            outcomes[index] = Some(Err(ToolError::parsing(format!(
                "tool call arguments did not parse: {parse_error}"
            ))));
            continue;
        }
        let Some(tool) = registry.get(&call.function) else {
            outcomes[index] =
                Some(Err(ToolError::parsing(format!("unknown tool: {}", call.function))));
            continue;
        };
        if let Err(e) = validate_arguments(&tool.parameters(), &call.arguments) {
            outcomes[index] = Some(Err(e));
            continue;
        }
        let decision = approval.review(call).await;
        record_approval(transcript, call, &decision);
        match decision {
            ApprovalDecision::Approve => {
                ready.push((index, tool, call.arguments.clone()));
            }
            ApprovalDecision::Modify(arguments) => {
                ready.push((index, tool, arguments));
            }
            ApprovalDecision::Reject { reason } => {
                outcomes[index] = Some(Err(ToolError::approval(reason)));
            }
            // The chain settles escalations itself; one leaking through
            // means nobody took the decision — fail closed.
            ApprovalDecision::Escalate => {
                outcomes[index] = Some(Err(ToolError::approval(format!(
                    "approval for {} was never settled",
                    call.function
                ))));
            }
        }
    }

    // Phase 2: group into execution units.  Parallel-safe tools run one
    // task per call; calls to a non-parallel tool share one sequential task.
    let mut units: Vec<Vec<(usize, Arc<dyn Tool>, serde_json::Value)>> = Vec::new();
    let mut serial_units: HashMap<String, usize> = HashMap::new();
    for (index, tool, args) in ready {
        if tool.parallel() {
            units.push(vec![(index, tool, args)]);
        } else {
            match serial_units.get(tool.name()) {
                Some(&unit) => units[unit].push((index, tool, args)),
                None => {
                    serial_units.insert(tool.name().to_string(), units.len());
                    units.push(vec![(index, tool, args)]);
                }
            }
        }
    }

    let mut join = JoinSet::new();
    for unit in units {
        join.spawn(async move {
            let mut results = Vec::with_capacity(unit.len());
            for (index, tool, args) in unit {
                debug!(tool = tool.name(), index, "executing tool call");
                results.push((index, tool.execute(&args).await));
            }
            results
        });
    }
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                // Abort in-flight tools; dropped exec futures signal their
                // process groups so nothing keeps running.
                join.abort_all();
                while join.join_next().await.is_some() {}
                return Err(EvalError::Cancelled);
            }
            joined = join.join_next() => {
                let Some(joined) = joined else { break };
                let results = joined
                    .map_err(|e| EvalError::Internal(format!("tool task panicked: {e}")))?;
                for (index, result) in results {
                    outcomes[index] = Some(result);
                }
            }
        }
    }

    // Phase 3: wrap results in call order.
    let mut messages = Vec::with_capacity(calls.len());
    for (index, call) in calls.iter().enumerate() {
        let outcome = outcomes[index].take().expect("every call has an outcome");
        match outcome {
            Ok(content) => {
                let content = cap_content(content);
                record_tool(transcript, call, Some(content.text()), None);
                messages.push(ChatMessage::tool_result(&call.id, &call.function, content));
            }
            Err(error) if error.is_expected() => {
                record_tool(transcript, call, None, Some(error.message.clone()));
                let wire = error
                    .to_call_error()
                    .expect("expected errors have a wire form");
                messages.push(ChatMessage::tool_error(&call.id, &call.function, wire));
            }
            Err(error) => {
                record_tool(transcript, call, None, Some(error.message.clone()));
                return Err(EvalError::Tool(error));
            }
        }
    }
    Ok(messages)
}

fn cap_content(content: Content) -> Content {
    match content {
        Content::Text(t) if t.len() > TOOL_OUTPUT_LIMIT => {
            Content::Text(truncate_output(&t, TOOL_OUTPUT_LIMIT))
        }
        other => other,
    }
}

fn record_approval(transcript: &Transcript, call: &ToolCall, decision: &ApprovalDecision) {
    let (name, explanation) = match decision {
        ApprovalDecision::Approve => ("approve", None),
        ApprovalDecision::Reject { reason } => ("reject", Some(reason.clone())),
        ApprovalDecision::Escalate => ("escalate", None),
        ApprovalDecision::Modify(_) => ("modify", None),
    };
    transcript.record(EventBody::Approval {
        function: call.function.clone(),
        decision: name.to_string(),
        explanation,
    });
}

fn record_tool(
    transcript: &Transcript,
    call: &ToolCall,
    result: Option<String>,
    error: Option<String>,
) {
    transcript.record(EventBody::Tool {
        id: call.id.clone(),
        function: call.function.clone(),
        arguments: call.arguments.clone(),
        result,
        error,
    });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use prova_model::{Role, ToolParams};
    use serde_json::json;

    use super::*;

    /// Adds two integers after an optional delay, so ordering under
    /// concurrency can be exercised.
    struct AddTool {
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for AddTool {
        fn name(&self) -> &str {
            "add"
        }
        fn description(&self) -> &str {
            "add two integers"
        }
        fn parameters(&self) -> ToolParams {
            ToolParams::new()
                .param("x", "integer", "", true)
                .param("y", "integer", "", true)
        }
        async fn execute(&self, args: &serde_json::Value) -> Result<Content, ToolError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let x = args["x"].as_i64().unwrap_or(0);
            let y = args["y"].as_i64().unwrap_or(0);
            Ok(Content::Text((x + y).to_string()))
        }
    }

    struct FailTool {
        expected: bool,
    }

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters(&self) -> ToolParams {
            ToolParams::new()
        }
        async fn execute(&self, _args: &serde_json::Value) -> Result<Content, ToolError> {
            if self.expected {
                Err(ToolError::tool("it broke"))
            } else {
                Err(ToolError::unexpected("engine bug"))
            }
        }
    }

    fn registry_of(tool: impl Tool + 'static) -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(tool);
        Arc::new(reg)
    }

    fn call(id: &str, function: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::new(id, function, args)
    }

    #[tokio::test]
    async fn single_call_produces_one_tool_message() {
        let reg = registry_of(AddTool { delay_ms: 0 });
        let msgs = dispatch_tools(
            &[call("c1", "add", json!({"x": 1, "y": 1}))],
            &reg,
            &ApprovalChain::auto(),
            &Transcript::new(),
            &CancelToken::default(),
        )
        .await
        .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role(), Role::Tool);
        assert_eq!(msgs[0].text(), "2");
    }

    /// Like [`AddTool`] but under a different name, so two distinct
    /// parallel-safe tools can race.
    struct SlowAddTool;

    #[async_trait]
    impl Tool for SlowAddTool {
        fn name(&self) -> &str {
            "slow_add"
        }
        fn description(&self) -> &str {
            "add two integers, slowly"
        }
        fn parameters(&self) -> ToolParams {
            ToolParams::new()
                .param("x", "integer", "", true)
                .param("y", "integer", "", true)
        }
        async fn execute(&self, args: &serde_json::Value) -> Result<Content, ToolError> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let x = args["x"].as_i64().unwrap_or(0);
            let y = args["y"].as_i64().unwrap_or(0);
            Ok(Content::Text((x + y).to_string()))
        }
    }

    #[tokio::test]
    async fn parallel_results_are_appended_in_call_order() {
        // First call is slow, second fast: completion order is reversed,
        // message order must not be.
        let mut reg = ToolRegistry::new();
        reg.register(SlowAddTool);
        reg.register(AddTool { delay_ms: 0 });
        let reg = Arc::new(reg);
        let calls = vec![
            call("slow", "slow_add", json!({"x": 1, "y": 1})),
            call("fast", "add", json!({"x": 2, "y": 2})),
        ];
        let msgs = dispatch_tools(&calls, &reg, &ApprovalChain::auto(), &Transcript::new(), &CancelToken::default())
            .await
            .unwrap();
        let ids: Vec<String> = msgs
            .iter()
            .map(|m| match m {
                ChatMessage::Tool { tool_call_id, .. } => tool_call_id.clone(),
                other => panic!("expected tool message, got {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["slow", "fast"]);
        assert_eq!(msgs[0].text(), "2");
        assert_eq!(msgs[1].text(), "4");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_parsing_error_message() {
        let reg = Arc::new(ToolRegistry::new());
        let msgs = dispatch_tools(
            &[call("c1", "nope", json!({}))],
            &reg,
            &ApprovalChain::auto(),
            &Transcript::new(),
            &CancelToken::default(),
        )
        .await
        .unwrap();
        match &msgs[0] {
            ChatMessage::Tool { error: Some(e), .. } => {
                assert_eq!(e.kind, prova_model::ToolCallErrorKind::Parsing);
                assert!(e.message.contains("unknown tool"));
            }
            other => panic!("expected tool error message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_arguments_are_reported_not_fatal() {
        let reg = registry_of(AddTool { delay_ms: 0 });
        let msgs = dispatch_tools(
            &[call("c1", "add", json!({"x": "one"}))],
            &reg,
            &ApprovalChain::auto(),
            &Transcript::new(),
            &CancelToken::default(),
        )
        .await
        .unwrap();
        match &msgs[0] {
            ChatMessage::Tool { error: Some(e), .. } => {
                assert_eq!(e.kind, prova_model::ToolCallErrorKind::Parsing);
            }
            other => panic!("expected tool error message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn model_parse_error_short_circuits_execution() {
        let reg = registry_of(AddTool { delay_ms: 0 });
        let mut bad = call("c1", "add", json!({}));
        bad.parse_error = Some("unterminated string".into());
        let msgs = dispatch_tools(&[bad], &reg, &ApprovalChain::auto(), &Transcript::new(), &CancelToken::default())
            .await
            .unwrap();
        match &msgs[0] {
            ChatMessage::Tool { error: Some(e), .. } => {
                assert!(e.message.contains("unterminated string"));
            }
            other => panic!("expected tool error message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expected_failure_goes_back_to_the_model() {
        let reg = registry_of(FailTool { expected: true });
        let msgs = dispatch_tools(
            &[call("c1", "fail", json!({}))],
            &reg,
            &ApprovalChain::auto(),
            &Transcript::new(),
            &CancelToken::default(),
        )
        .await
        .unwrap();
        match &msgs[0] {
            ChatMessage::Tool { error: Some(e), content, .. } => {
                assert_eq!(e.kind, prova_model::ToolCallErrorKind::Tool);
                assert_eq!(content.text(), "it broke");
            }
            other => panic!("expected tool error message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unexpected_failure_fails_the_sample() {
        let reg = registry_of(FailTool { expected: false });
        let err = dispatch_tools(
            &[call("c1", "fail", json!({}))],
            &reg,
            &ApprovalChain::auto(),
            &Transcript::new(),
            &CancelToken::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EvalError::Tool(_)));
    }

    #[tokio::test]
    async fn rejected_call_becomes_an_approval_error() {
        let reg = registry_of(AddTool { delay_ms: 0 });
        let chain = ApprovalChain::new(vec![Box::new(prova_tools::PatternApprover::new(
            &[],
            &["add"],
        ))]);
        let transcript = Transcript::new();
        let msgs = dispatch_tools(
            &[call("c1", "add", json!({"x": 1, "y": 1}))],
            &reg,
            &chain,
            &transcript,
            &CancelToken::default(),
        )
        .await
        .unwrap();
        match &msgs[0] {
            ChatMessage::Tool { error: Some(e), .. } => {
                assert_eq!(e.kind, prova_model::ToolCallErrorKind::Approval);
            }
            other => panic!("expected approval error, got {other:?}"),
        }
        assert!(transcript.events().iter().any(|e| matches!(
            &e.body,
            EventBody::Approval { decision, .. } if decision == "reject"
        )));
    }

    #[tokio::test]
    async fn tool_events_are_recorded_in_call_order() {
        let reg = registry_of(AddTool { delay_ms: 10 });
        let transcript = Transcript::new();
        let calls = vec![
            call("a", "add", json!({"x": 1, "y": 0})),
            call("b", "add", json!({"x": 2, "y": 0})),
        ];
        dispatch_tools(&calls, &reg, &ApprovalChain::auto(), &transcript, &CancelToken::default())
            .await
            .unwrap();
        let ids: Vec<String> = transcript
            .events()
            .iter()
            .filter_map(|e| match &e.body {
                EventBody::Tool { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    /// Runs a shell command in a local sandbox, leaving the leader pid in a
    /// file so the test can check the whole group died.
    struct SandboxShellTool {
        env: Arc<dyn prova_sandbox::SandboxEnvironment>,
    }

    #[async_trait]
    impl Tool for SandboxShellTool {
        fn name(&self) -> &str {
            "shell"
        }
        fn description(&self) -> &str {
            "run a shell command"
        }
        fn parameters(&self) -> ToolParams {
            ToolParams::new().param("cmd", "string", "", true)
        }
        async fn execute(&self, args: &serde_json::Value) -> Result<Content, ToolError> {
            let cmd = args["cmd"].as_str().unwrap_or_default().to_string();
            let result = self
                .env
                .exec(prova_sandbox::ExecParams::shell(cmd))
                .await
                .map_err(ToolError::from)?;
            Ok(Content::Text(result.stdout))
        }
    }

    #[tokio::test]
    async fn cancellation_kills_the_tool_process_group() {
        use prova_sandbox::{LocalSandboxProvider, SandboxProvider, SandboxSpec};

        let env = LocalSandboxProvider::new()
            .provision(&SandboxSpec::new("local"), "cancel-test")
            .await
            .unwrap();
        let mut reg = ToolRegistry::new();
        reg.register(SandboxShellTool { env: Arc::clone(&env) });
        let reg = Arc::new(reg);

        // The leader records its pid, backgrounds a grandchild, then hangs.
        let calls = vec![call(
            "c1",
            "shell",
            json!({"cmd": "echo $$ > pid.txt; sleep 9999 & sleep 9999"}),
        )];
        let (handle, token) = crate::cancel::cancel_pair();
        let transcript = Transcript::new();
        let approval = ApprovalChain::auto();
        let dispatch = dispatch_tools(&calls, &reg, &approval, &transcript, &token);
        tokio::pin!(dispatch);

        // Let the command start, then cancel mid-flight.
        let raced = tokio::time::timeout(Duration::from_millis(200), &mut dispatch).await;
        assert!(raced.is_err(), "dispatch should still be running");
        handle.cancel();
        let err = tokio::time::timeout(Duration::from_secs(2), dispatch)
            .await
            .expect("cancellation must unwind promptly")
            .unwrap_err();
        assert!(matches!(err, EvalError::Cancelled));

        // The group leader (and its backgrounded grandchild) must be gone
        // shortly after SIGTERM lands.
        let pid: u32 = String::from_utf8(env.read_file("pid.txt").await.unwrap())
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut alive = true;
        for _ in 0..50 {
            alive = prova_sandbox::process_group_alive(pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "process group {pid} survived cancellation");
        env.teardown().await.unwrap();
    }
}
