// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use prova_core::{metrics::ScoreSummary, Event, Sample, SampleId, SampleInput, Score, Store, Targets};
use prova_model::{ChatMessage, ModelOutput, ModelUsage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    Started,
    Success,
    Cancelled,
    Error,
}

/// Header: what ran, against what, configured how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSpec {
    pub task: String,
    /// Stable across retries of the same logical eval.
    pub task_id: String,
    /// Unique per execution.
    pub run_id: String,
    pub created: DateTime<Utc>,
    pub dataset: DatasetSummary,
    pub model: String,
    /// Serialised engine configuration for the run.
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub samples: usize,
    pub epochs: usize,
    /// Whether sample order was shuffled at load time.  A retried eval
    /// refuses to reuse samples from a shuffled prior log.
    #[serde(default)]
    pub shuffled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitInfo {
    pub commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// The solver pipeline as configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalPlan {
    pub steps: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResults {
    pub scores: Vec<ScoreSummary>,
    pub total_samples: usize,
    pub completed_samples: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_reductions: Vec<SampleReduction>,
}

/// Per-sample reduced values for one scorer (across epochs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReduction {
    pub scorer: String,
    pub reducer: String,
    pub samples: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalStats {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_usage: BTreeMap<String, ModelUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback_ansi: Option<String>,
}

/// One completed (sample, epoch) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSample {
    pub id: SampleId,
    pub epoch: usize,
    pub input: SampleInput,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default)]
    pub target: Targets,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub output: ModelOutput,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, Score>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
    #[serde(default)]
    pub model_usage: ModelUsage,
    pub total_time: f64,
    pub working_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Limit kind that terminated the sample, when one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
    #[serde(default, skip_serializing_if = "store_is_empty")]
    pub store: Store,
    pub uuid: String,
    pub completed: bool,
}

fn store_is_empty(s: &Store) -> bool {
    s.is_empty()
}

impl EvalSample {
    /// Key identifying this record within a run.
    pub fn key(&self) -> (String, usize) {
        (self.id.to_string(), self.epoch)
    }

    /// Completed without error or limit — eligible for reuse on retry.
    pub fn is_success(&self) -> bool {
        self.completed && self.error.is_none()
    }
}

/// The assembled view of one log artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalLog {
    pub version: i32,
    pub status: EvalStatus,
    pub eval: EvalSpec,
    pub plan: EvalPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<EvalResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<EvalStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EvalErrorInfo>,
    #[serde(default)]
    pub samples: Vec<EvalSample>,
}

impl EvalLog {
    /// Keys of samples that completed successfully (retry reuses these).
    pub fn successful_keys(&self) -> HashSet<(String, usize)> {
        self.samples
            .iter()
            .filter(|s| s.is_success())
            .map(|s| s.key())
            .collect()
    }
}

/// Build the dataset summary recorded in the header.
pub fn summarize_dataset(
    name: Option<&str>,
    samples: &[Sample],
    epochs: usize,
    shuffled: bool,
) -> DatasetSummary {
    DatasetSummary {
        name: name.map(str::to_string),
        samples: samples.len(),
        epochs,
        shuffled,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn minimal_sample(id: i64, epoch: usize) -> EvalSample {
        EvalSample {
            id: SampleId::Int(id),
            epoch,
            input: SampleInput::Text("q".into()),
            choices: Vec::new(),
            target: Targets::one("a"),
            metadata: serde_json::Map::new(),
            messages: vec![ChatMessage::user("q")],
            output: ModelOutput::default(),
            scores: BTreeMap::new(),
            events: Vec::new(),
            model_usage: ModelUsage::default(),
            total_time: 0.1,
            working_time: 0.1,
            error: None,
            limit: None,
            store: Store::new(),
            uuid: format!("uuid-{id}-{epoch}"),
            completed: true,
        }
    }

    #[test]
    fn sample_key_combines_id_and_epoch() {
        let s = minimal_sample(3, 2);
        assert_eq!(s.key(), ("3".to_string(), 2));
    }

    #[test]
    fn errored_samples_are_not_successes() {
        let mut s = minimal_sample(1, 1);
        assert!(s.is_success());
        s.error = Some("boom".into());
        assert!(!s.is_success());
    }

    #[test]
    fn limit_samples_still_count_as_successes() {
        // Limit-complete samples are scored and reusable on retry.
        let mut s = minimal_sample(1, 1);
        s.limit = Some("message".into());
        assert!(s.is_success());
    }

    #[test]
    fn successful_keys_filters_errors() {
        let spec = EvalSpec {
            task: "t".into(),
            task_id: "tid".into(),
            run_id: "rid".into(),
            created: Utc::now(),
            dataset: DatasetSummary { name: None, samples: 2, epochs: 1, shuffled: false },
            model: "mock/model".into(),
            config: serde_json::json!({}),
            packages: BTreeMap::new(),
            git: None,
        };
        let mut errored = minimal_sample(2, 1);
        errored.error = Some("x".into());
        let log = EvalLog {
            version: 2,
            status: EvalStatus::Error,
            eval: spec,
            plan: EvalPlan::default(),
            results: None,
            stats: None,
            error: None,
            samples: vec![minimal_sample(1, 1), errored],
        };
        let keys = log.successful_keys();
        assert!(keys.contains(&("1".to_string(), 1)));
        assert!(!keys.contains(&("2".to_string(), 1)));
    }

    #[test]
    fn eval_sample_round_trips_through_json() {
        let s = minimal_sample(5, 1);
        let json = serde_json::to_string(&s).unwrap();
        let back: EvalSample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
