// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sample buffer: a sidecar directory of per-(sample, epoch) JSONL event
//! files for samples still in flight.
//!
//! Each append is durable before the write returns, so an external viewer
//! can tail live samples and a crash leaves the in-progress event streams on
//! disk for inspection.  When a sample is finalised into the main log its
//! buffer file is removed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use prova_core::{Event, EventSink};
use tracing::warn;

struct BufferInner {
    dir: PathBuf,
    sync: bool,
}

#[derive(Clone)]
pub struct SampleBuffer {
    inner: Arc<BufferInner>,
}

impl SampleBuffer {
    /// Buffer sidecar for a log at `log_path` (directory `<log>.buffer/`).
    pub fn for_log(log_path: &Path, sync: bool) -> Self {
        let mut name = log_path.file_name().unwrap_or_default().to_os_string();
        name.push(".buffer");
        let dir = log_path.with_file_name(name);
        Self { inner: Arc::new(BufferInner { dir, sync }) }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn file_for(&self, sample_id: &str, epoch: usize) -> PathBuf {
        let sanitized: String = sample_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.inner.dir.join(format!("{sanitized}_epoch{epoch}.jsonl"))
    }

    /// Durably append one event to the sample's stream.
    pub fn append(&self, sample_id: &str, epoch: usize, event: &Event) {
        if let Err(e) = self.try_append(sample_id, epoch, event) {
            // The buffer is an observability aid: losing an append must not
            // fail the sample that produced the event.
            warn!(sample_id, epoch, error = %e, "sample buffer append failed");
        }
    }

    fn try_append(&self, sample_id: &str, epoch: usize, event: &Event) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.inner.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(sample_id, epoch))?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;
        if self.inner.sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Transcript sink bound to one sample.
    pub fn sink_for(&self, sample_id: &str, epoch: usize) -> EventSink {
        let buffer = self.clone();
        let sample_id = sample_id.to_string();
        Arc::new(move |event: &Event| buffer.append(&sample_id, epoch, event))
    }

    /// Events buffered so far for one in-flight sample.
    pub fn read_events(&self, sample_id: &str, epoch: usize) -> Vec<Event> {
        let Ok(text) = std::fs::read_to_string(self.file_for(sample_id, epoch)) else {
            return Vec::new();
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Remove a sample's stream once it is durably in the main log.
    pub fn remove(&self, sample_id: &str, epoch: usize) {
        let _ = std::fs::remove_file(self.file_for(sample_id, epoch));
    }

    /// Drop the directory when nothing is left in flight.  Files from a
    /// crashed run are deliberately kept.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_dir(&self.inner.dir);
    }

    /// Keys of samples currently buffered (in-flight or crashed).
    pub fn pending(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.inner.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(".jsonl").map(str::to_string))
            })
            .collect();
        names.sort();
        names
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
