// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming log recorder.
//!
//! One artifact per run, written as JSON lines in three phases: a `header`
//! record, one `sample` record per completed sample (synced before the
//! append returns), and a `footer` on completion.  A reader reassembles the
//! layered [`EvalLog`]; a missing footer means the run was interrupted and
//! the log reads back with `status = started`, with every durable sample
//! intact — which is exactly what the retry controller needs.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    buffer::SampleBuffer,
    types::{
        EvalErrorInfo, EvalLog, EvalPlan, EvalResults, EvalSample, EvalSpec, EvalStats,
        EvalStatus,
    },
};

pub const LOG_VERSION: i32 = 2;
pub const LOG_EXTENSION: &str = "eval.jsonl";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum LogRecord {
    Header {
        version: i32,
        eval: EvalSpec,
        plan: EvalPlan,
    },
    Sample {
        sample: EvalSample,
    },
    Footer {
        status: EvalStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        results: Option<EvalResults>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<EvalStats>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<EvalErrorInfo>,
    },
}

pub struct LogRecorder {
    path: PathBuf,
    file: Mutex<File>,
    buffer: SampleBuffer,
}

impl LogRecorder {
    /// Create the artifact, take the writer lock, and write the header.
    pub fn create(
        dir: &Path,
        eval: EvalSpec,
        plan: EvalPlan,
        buffer_sync: bool,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        let stamp = eval.created.format("%Y-%m-%dT%H-%M-%S");
        let name = format!("{stamp}_{}_{}.{LOG_EXTENSION}", safe_name(&eval.task), eval.run_id);
        let path = dir.join(name);
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("creating log file {}", path.display()))?;
        if !file.try_lock_exclusive()? {
            bail!("log file {} is locked by another process", path.display());
        }

        let header = LogRecord::Header { version: LOG_VERSION, eval, plan };
        write_record(&mut file, &header)?;
        file.sync_data()?;
        debug!(path = %path.display(), "eval log created");

        let buffer = SampleBuffer::for_log(&path, buffer_sync);
        Ok(Self { path, file: Mutex::new(file), buffer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Append one completed sample.  Durable before returning; the sample's
    /// live buffer stream is removed afterwards.
    pub fn record_sample(&self, sample: &EvalSample) -> anyhow::Result<()> {
        {
            let mut file = self.file.lock().unwrap();
            write_record(&mut file, &LogRecord::Sample { sample: sample.clone() })?;
            file.sync_data()?;
        }
        self.buffer.remove(&sample.id.to_string(), sample.epoch);
        Ok(())
    }

    /// Write the closing section.  Never written before every recorded
    /// sample is durable (each append syncs).
    pub fn finalize(
        &self,
        status: EvalStatus,
        results: Option<EvalResults>,
        stats: Option<EvalStats>,
        error: Option<EvalErrorInfo>,
    ) -> anyhow::Result<()> {
        let mut file = self.file.lock().unwrap();
        write_record(&mut file, &LogRecord::Footer { status, results, stats, error })?;
        file.sync_all()?;
        drop(file);
        self.buffer.cleanup();
        Ok(())
    }
}

fn write_record(file: &mut File, record: &LogRecord) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(record).context("serialising log record")?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Read an artifact back into the layered view.
///
/// Tolerates a torn trailing line (crash mid-append): parsing stops there
/// with a warning and everything before it is returned.  A missing footer
/// reports `status = started`.
pub fn read_log(path: &Path) -> anyhow::Result<EvalLog> {
    let file =
        File::open(path).with_context(|| format!("opening log {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut header: Option<(i32, EvalSpec, EvalPlan)> = None;
    let mut samples = Vec::new();
    let mut footer: Option<(EvalStatus, Option<EvalResults>, Option<EvalStats>, Option<EvalErrorInfo>)> =
        None;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "torn or corrupt log record; ignoring the rest of the file"
                );
                break;
            }
        };
        match record {
            LogRecord::Header { version, eval, plan } => {
                header = Some((version, eval, plan));
            }
            LogRecord::Sample { sample } => samples.push(sample),
            LogRecord::Footer { status, results, stats, error } => {
                footer = Some((status, results, stats, error));
            }
        }
    }

    let (version, eval, plan) =
        header.with_context(|| format!("{} has no header record", path.display()))?;
    let (status, results, stats, error) = footer.unwrap_or((EvalStatus::Started, None, None, None));
    Ok(EvalLog { version, status, eval, plan, results, stats, error, samples })
}

/// Lightweight view of one artifact for directory listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSummary {
    pub path: PathBuf,
    pub task: String,
    pub task_id: String,
    pub model: String,
    pub created: chrono::DateTime<chrono::Utc>,
    pub status: EvalStatus,
    pub samples: usize,
}

/// Summarise one artifact without materialising its sample records.
pub fn read_log_summary(path: &Path) -> anyhow::Result<LogSummary> {
    let file =
        File::open(path).with_context(|| format!("opening log {}", path.display()))?;
    let reader = BufReader::new(file);

    #[derive(Deserialize)]
    struct RecordKind {
        #[serde(rename = "type")]
        kind: String,
    }

    let mut header: Option<EvalSpec> = None;
    let mut samples = 0usize;
    let mut status = EvalStatus::Started;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(kind) = serde_json::from_str::<RecordKind>(&line) else {
            break; // torn tail
        };
        match kind.kind.as_str() {
            "header" => {
                if let Ok(LogRecord::Header { eval, .. }) = serde_json::from_str(&line) {
                    header = Some(eval);
                }
            }
            "sample" => samples += 1,
            "footer" => {
                if let Ok(LogRecord::Footer { status: s, .. }) = serde_json::from_str(&line)
                {
                    status = s;
                }
            }
            _ => {}
        }
    }
    let eval = header.with_context(|| format!("{} has no header record", path.display()))?;
    Ok(LogSummary {
        path: path.to_path_buf(),
        task: eval.task,
        task_id: eval.task_id,
        model: eval.model,
        created: eval.created,
        status,
        samples,
    })
}

/// Summaries of every artifact in a directory, most recent first.
/// Unreadable files are skipped with a warning.
pub fn list_logs(dir: &Path) -> Vec<LogSummary> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut summaries: Vec<LogSummary> = entries
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.ends_with(&format!(".{LOG_EXTENSION}")))
        })
        .filter_map(|e| match read_log_summary(&e.path()) {
            Ok(summary) => Some(summary),
            Err(error) => {
                warn!(path = %e.path().display(), %error, "skipping unreadable log");
                None
            }
        })
        .collect();
    summaries.sort_by(|a, b| b.created.cmp(&a.created));
    summaries
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
