// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod buffer;
mod recorder;
mod types;

pub use buffer::SampleBuffer;
pub use recorder::{
    list_logs, read_log, read_log_summary, LogRecorder, LogSummary, LOG_EXTENSION,
    LOG_VERSION,
};
pub use types::{
    summarize_dataset, DatasetSummary, EvalErrorInfo, EvalLog, EvalPlan, EvalResults,
    EvalSample, EvalSpec, EvalStats, EvalStatus, GitInfo, SampleReduction,
};
