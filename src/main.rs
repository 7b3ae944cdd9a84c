// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, LogCommands};
use prova_eval::ComponentRegistry;
use prova_log::{read_log, EvalStatus, SampleBuffer};

// ── Exit codes ────────────────────────────────────────────────────────────────

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_INTERRUPT: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Config load failures are a distinct exit class so CI can tell a bad
    // setup from a failed inspection.
    let config = match prova_config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("prova: config error: {e:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let result = match cli.command {
        Commands::ShowConfig => {
            match serde_yaml::to_string(&config) {
                Ok(yaml) => {
                    println!("{yaml}");
                    Ok(())
                }
                Err(e) => Err(anyhow::anyhow!("serialising config: {e}")),
            }
        }
        Commands::Log { action } => run_log_command(action, || config.log.resolved_dir()),
        Commands::Tail { log, interval_secs } => {
            return run_tail(&log, interval_secs, config.log.buffer_sync).await;
        }
        Commands::ListProviders => {
            let registry = ComponentRegistry::with_builtins();
            for scheme in registry.models.schemes() {
                println!("{scheme}/");
            }
            Ok(())
        }
        Commands::ListSandboxes => {
            let registry = ComponentRegistry::with_builtins();
            for name in registry.sandboxes.names() {
                println!("{name}");
            }
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("prova: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run_log_command(
    action: LogCommands,
    default_dir: impl FnOnce() -> std::path::PathBuf,
) -> anyhow::Result<()> {
    match action {
        LogCommands::List { dir } => {
            let dir = dir.unwrap_or_else(default_dir);
            for summary in prova_log::list_logs(&dir) {
                println!(
                    "{}  {:9}  {:4} samples  {}  {}",
                    summary.created.format("%Y-%m-%d %H:%M:%S"),
                    status_str_short(summary.status),
                    summary.samples,
                    summary.task,
                    summary.path.display(),
                );
            }
            Ok(())
        }
        LogCommands::Dump { file, no_samples } => {
            let mut log = read_log(&file)?;
            if no_samples {
                log.samples.clear();
            }
            println!("{}", serde_json::to_string_pretty(&log)?);
            Ok(())
        }
        LogCommands::Status { file } => {
            let log = read_log(&file)?;
            println!("task:      {} ({})", log.eval.task, log.eval.task_id);
            println!("model:     {}", log.eval.model);
            println!("status:    {}", status_str(log.status));
            println!(
                "samples:   {} recorded / {} x {} epochs",
                log.samples.len(),
                log.eval.dataset.samples,
                log.eval.dataset.epochs
            );
            let errored = log.samples.iter().filter(|s| s.error.is_some()).count();
            let limited = log.samples.iter().filter(|s| s.limit.is_some()).count();
            if errored > 0 {
                println!("errored:   {errored}");
            }
            if limited > 0 {
                println!("limited:   {limited}");
            }
            if let Some(results) = &log.results {
                for score in &results.scores {
                    let metrics: Vec<String> = score
                        .metrics
                        .iter()
                        .map(|(k, v)| format!("{k}={v:.4}"))
                        .collect();
                    println!("score:     {} [{}]", score.name, metrics.join(", "));
                }
            }
            if let Some(error) = &log.error {
                println!("error:     {}", error.message);
            }
            Ok(())
        }
    }
}

fn status_str_short(status: EvalStatus) -> &'static str {
    match status {
        EvalStatus::Started => "started",
        EvalStatus::Success => "success",
        EvalStatus::Cancelled => "cancelled",
        EvalStatus::Error => "error",
    }
}

fn status_str(status: EvalStatus) -> &'static str {
    match status {
        EvalStatus::Started => "started (interrupted or still running)",
        EvalStatus::Success => "success",
        EvalStatus::Cancelled => "cancelled",
        EvalStatus::Error => "error",
    }
}

/// Poll the sample buffer next to `log`, printing newly arrived events per
/// in-flight sample until interrupted.
async fn run_tail(log: &Path, interval_secs: u64, buffer_sync: bool) -> ExitCode {
    let buffer = SampleBuffer::for_log(log, buffer_sync);
    let mut printed: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let interval = std::time::Duration::from_secs(interval_secs.max(1));

    loop {
        let tick = async {
            for key in buffer.pending() {
                // Keys are "<id>_epoch<n>"; split back for the read call.
                let Some((id, epoch)) = key.rsplit_once("_epoch") else {
                    continue;
                };
                let Ok(epoch) = epoch.parse::<usize>() else {
                    continue;
                };
                let events = buffer.read_events(id, epoch);
                let seen = printed.entry(key.clone()).or_insert(0);
                for event in &events[*seen..] {
                    match serde_json::to_string(event) {
                        Ok(line) => println!("[{key}] {line}"),
                        Err(e) => eprintln!("prova: unprintable event: {e}"),
                    }
                }
                *seen = events.len();
            }
            tokio::time::sleep(interval).await;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                return ExitCode::from(EXIT_INTERRUPT);
            }
            () = tick => {}
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("PROVA_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
