// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// prova — a task-based LLM evaluation engine.
///
/// The binary is a thin utility shell around the engine crates: inspect log
/// artifacts, tail in-flight samples, list registered providers.  Evals
/// themselves are declared and launched from Rust (see the `prova-eval`
/// crate), so there is no task authoring surface here.
#[derive(Parser, Debug)]
#[command(name = "prova", version, about)]
pub struct Cli {
    /// Path to an explicit config file (otherwise the standard search paths).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase stderr logging (-v debug, -vv trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect an eval log artifact.
    Log {
        #[command(subcommand)]
        action: LogCommands,
    },

    /// Follow the in-flight samples of a running eval (Ctrl-C to stop).
    Tail {
        /// Path to the eval log whose sample buffer to follow.
        log: PathBuf,
        /// Poll interval in seconds.
        #[arg(long, default_value = "2")]
        interval_secs: u64,
    },

    /// List the model provider schemes available to this binary.
    ListProviders,

    /// List the sandbox providers available to this binary.
    ListSandboxes,

    /// Print the resolved configuration (files + environment) and exit.
    ShowConfig,
}

#[derive(Subcommand, Debug)]
pub enum LogCommands {
    /// Print the full log as JSON.
    Dump {
        file: PathBuf,
        /// Omit per-sample records (header, results and stats only).
        #[arg(long)]
        no_samples: bool,
    },
    /// Print a one-screen status summary.
    Status { file: PathBuf },
    /// List log artifacts in a directory, most recent first.
    List {
        /// Directory to scan (defaults to the configured log dir).
        dir: Option<PathBuf>,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
