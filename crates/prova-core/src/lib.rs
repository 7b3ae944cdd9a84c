// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod agent;
pub mod dispatch;
pub mod metrics;
mod cancel;
mod error;
mod limits;
mod scorer;
mod solver;
mod state;
mod store;
mod transcript;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use error::EvalError;
pub use limits::{LimitExceeded, LimitKind, LimitTracker, LimitsSnapshot};
pub use scorer::{
    run_scorers, ChoiceScorer, ExactMatch, Includes, MatchNumber, ModelGradedScorer, Score,
    ScoreValue, Scorer, CORRECT, INCORRECT, PARTIAL,
};
pub use solver::{
    default_solvers, run_solvers, Chain, Generate, MultipleChoice, PromptTemplate,
    SolveContext, Solver, SystemMessage, UserMessage, UseTools,
};
pub use state::{Sample, SampleId, SampleInput, Targets, TaskState};
pub use store::{Store, StoreChange, StoreHandle, StoreOp, Value};
pub use transcript::{Event, EventBody, EventSink, Transcript};
