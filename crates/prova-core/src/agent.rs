// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The model ↔ tool loop.
//!
//! Each round: check cancellation and limits, generate, append the assistant
//! message, then either stop (terminal stop reason, no tool calls, tool
//! choice `none`, completed flag) or execute the requested tools and append
//! their results in call order before the next turn.

use std::sync::Arc;

use prova_model::{ChatMessage, StopReason, ToolChoice};
use tracing::debug;

use crate::{
    dispatch::dispatch_tools,
    error::EvalError,
    limits::LimitExceeded,
    solver::SolveContext,
    state::TaskState,
    transcript::EventBody,
};

pub async fn run_agent_loop(
    state: &mut TaskState,
    ctx: &SolveContext,
) -> Result<(), EvalError> {
    loop {
        if state.completed {
            return Ok(());
        }
        ctx.cancel.check()?;
        state.limits.check()?;
        state.limits.check_message_headroom()?;

        let tools = state.tools.infos();
        let reply = ctx
            .gateway
            .generate(
                state.messages(),
                &tools,
                &state.tool_choice,
                &ctx.generate_config,
                Some(state.epoch),
            )
            .await?;

        // Queue and retry waits are shared-resource time, not working time.
        state.limits.record_waiting(reply.waited);
        state.limits.add_tokens(reply.output.usage.total_tokens);
        state.transcript.record(EventBody::Model {
            model: reply.output.model.clone(),
            input_messages: state.messages().len(),
            output: reply.output.clone(),
            cache_hit: reply.cache_hit,
        });

        let message = reply
            .output
            .message()
            .cloned()
            .unwrap_or_else(|| ChatMessage::assistant(""));
        let stop_reason = reply.output.stop_reason();
        state.output = reply.output;
        state.push_message(message.clone())?;
        state.limits.check()?;

        if stop_reason == StopReason::ModelLength {
            // The provider reports context overflow as a stop reason; it
            // terminates the sample as the `context` limit.
            return Err(LimitExceeded::context().into());
        }
        if stop_reason.is_terminal() {
            debug!(?stop_reason, "agent loop finished");
            return Ok(());
        }
        if state.tool_choice == ToolChoice::None {
            return Ok(());
        }
        let calls = message.tool_calls().to_vec();
        if calls.is_empty() {
            return Ok(());
        }

        let registry = Arc::clone(&state.tools);
        let results =
            dispatch_tools(&calls, &registry, &ctx.approval, &state.transcript, &ctx.cancel)
                .await?;
        for result in results {
            state.push_message(result)?;
        }

        // A forced tool choice is satisfied once; resetting to auto lets the
        // model answer in text instead of looping on the same tool forever.
        if matches!(state.tool_choice, ToolChoice::Any | ToolChoice::Function(_)) {
            state.tool_choice = ToolChoice::Auto;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
