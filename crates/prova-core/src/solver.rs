// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Solvers: ordered state transformers making up a sample's pipeline.
//!
//! Between solvers the engine checks the completed flag and the limit
//! tracker; a tripped limit skips the rest of the chain and hands the
//! terminal state to the scorers.

use std::sync::Arc;

use async_trait::async_trait;
use prova_model::{ChatMessage, GenerateConfig, ModelGateway, ToolChoice};
use prova_tools::{ApprovalChain, Tool, ToolRegistry};
use tracing::debug;

use crate::{
    agent::run_agent_loop,
    cancel::CancelToken,
    error::EvalError,
    state::TaskState,
};

/// Everything a solver may reach beyond the task state itself.
#[derive(Clone)]
pub struct SolveContext {
    pub gateway: Arc<ModelGateway>,
    pub approval: Arc<ApprovalChain>,
    pub generate_config: GenerateConfig,
    pub cancel: CancelToken,
}

impl SolveContext {
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Self {
            gateway,
            approval: Arc::new(ApprovalChain::auto()),
            generate_config: GenerateConfig::default(),
            cancel: CancelToken::default(),
        }
    }
}

#[async_trait]
pub trait Solver: Send + Sync {
    fn name(&self) -> &str;
    async fn solve(&self, state: &mut TaskState, ctx: &SolveContext) -> Result<(), EvalError>;
}

/// Run a chain in order with the completed/limit gate between solvers.
///
/// A `Limit` error from a solver marks the sample limit-complete and returns
/// `Ok` — the sample proceeds to scoring.  Any other error propagates.
pub async fn run_solvers(
    solvers: &[Arc<dyn Solver>],
    state: &mut TaskState,
    ctx: &SolveContext,
) -> Result<(), EvalError> {
    for solver in solvers {
        if state.completed {
            break;
        }
        ctx.cancel.check()?;
        if let Err(limit) = state.limits.check() {
            state.record_limit(limit);
            break;
        }

        state.transcript.begin_span("solver", solver.name());
        let result = solver.solve(state, ctx).await;
        state.transcript.end_span();

        match result {
            Ok(()) => {}
            Err(EvalError::Limit(limit)) => {
                state.record_limit(limit);
                break;
            }
            Err(other) => return Err(other),
        }
    }
    Ok(())
}

// ─── Built-in solvers ─────────────────────────────────────────────────────────

/// Inserts a system message ahead of the conversation.
pub struct SystemMessage(pub String);

#[async_trait]
impl Solver for SystemMessage {
    fn name(&self) -> &str {
        "system_message"
    }

    async fn solve(&self, state: &mut TaskState, _ctx: &SolveContext) -> Result<(), EvalError> {
        state.insert_system_message(ChatMessage::system(self.0.clone()))?;
        Ok(())
    }
}

/// Appends a user message.
pub struct UserMessage(pub String);

#[async_trait]
impl Solver for UserMessage {
    fn name(&self) -> &str {
        "user_message"
    }

    async fn solve(&self, state: &mut TaskState, _ctx: &SolveContext) -> Result<(), EvalError> {
        state.push_message(ChatMessage::user(self.0.clone()))?;
        Ok(())
    }
}

/// Rewrites the first user message through a `{prompt}` template.
pub struct PromptTemplate(pub String);

#[async_trait]
impl Solver for PromptTemplate {
    fn name(&self) -> &str {
        "prompt_template"
    }

    async fn solve(&self, state: &mut TaskState, _ctx: &SolveContext) -> Result<(), EvalError> {
        let template = self.0.clone();
        state.rewrite_user_prompt(|prompt| template.replace("{prompt}", prompt));
        Ok(())
    }
}

/// Installs a tool set (and optionally a tool choice) on the state.
pub struct UseTools {
    tools: Vec<Arc<dyn Tool>>,
    choice: Option<ToolChoice>,
}

impl UseTools {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools, choice: None }
    }

    pub fn with_choice(mut self, choice: ToolChoice) -> Self {
        self.choice = Some(choice);
        self
    }
}

#[async_trait]
impl Solver for UseTools {
    fn name(&self) -> &str {
        "use_tools"
    }

    async fn solve(&self, state: &mut TaskState, _ctx: &SolveContext) -> Result<(), EvalError> {
        state.tools = Arc::new(ToolRegistry::from_tools(self.tools.iter().cloned()));
        if let Some(choice) = &self.choice {
            state.tool_choice = choice.clone();
        }
        debug!(tools = ?state.tools.names(), "tool set installed");
        Ok(())
    }
}

/// Formats a sample's choices into the prompt and asks for a lettered
/// answer, for use with the `choice` scorer.
pub struct MultipleChoice;

pub(crate) fn choice_letter(index: usize) -> char {
    (b'A' + (index as u8).min(25)) as char
}

#[async_trait]
impl Solver for MultipleChoice {
    fn name(&self) -> &str {
        "multiple_choice"
    }

    async fn solve(&self, state: &mut TaskState, _ctx: &SolveContext) -> Result<(), EvalError> {
        if state.choices.is_empty() {
            debug!("multiple_choice solver on a sample without choices; skipping");
            return Ok(());
        }
        let block: String = state
            .choices
            .iter()
            .enumerate()
            .map(|(i, choice)| format!("{}) {choice}\n", choice_letter(i)))
            .collect();
        state.rewrite_user_prompt(|question| {
            format!(
                "Answer the following multiple choice question. The last line of \
                 your reply must be of the form 'ANSWER: $LETTER' where $LETTER is \
                 one of the listed letters.\n\n{question}\n\n{block}"
            )
        });
        Ok(())
    }
}

/// Nested ordered composition of solvers.
pub struct Chain(pub Vec<Arc<dyn Solver>>);

#[async_trait]
impl Solver for Chain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn solve(&self, state: &mut TaskState, ctx: &SolveContext) -> Result<(), EvalError> {
        run_solvers(&self.0, state, ctx).await
    }
}

/// The distinguished solver: runs the model/tool loop to completion.
pub struct Generate;

#[async_trait]
impl Solver for Generate {
    fn name(&self) -> &str {
        "generate"
    }

    async fn solve(&self, state: &mut TaskState, ctx: &SolveContext) -> Result<(), EvalError> {
        run_agent_loop(state, ctx).await
    }
}

/// The default pipeline when a task names no solvers.
pub fn default_solvers() -> Vec<Arc<dyn Solver>> {
    vec![Arc::new(Generate)]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
