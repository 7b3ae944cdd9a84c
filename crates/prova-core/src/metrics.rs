// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Metric reducers and the epoch → sample aggregation pipeline.
//!
//! Scores reduce in two stages: per-sample across epochs (the *epoch
//! reducer*, e.g. `pass_at_k`), then across samples into headline metrics
//! (mean, accuracy, standard error).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Pure reduction over a sequence of numeric score values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    Mean,
    /// Fraction of values counting as fully correct.
    Accuracy,
    /// Probability that at least one of `k` drawn epochs is correct.
    PassAtK(usize),
}

impl Reducer {
    pub fn name(&self) -> String {
        match self {
            Self::Mean => "mean".into(),
            Self::Accuracy => "accuracy".into(),
            Self::PassAtK(k) => format!("pass_at_{k}"),
        }
    }

    pub fn reduce(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Self::Mean => mean(values),
            Self::Accuracy => {
                let correct = values.iter().filter(|v| **v >= 0.999).count();
                correct as f64 / values.len() as f64
            }
            Self::PassAtK(k) => pass_at_k(values, *k),
        }
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard error of the mean.
pub fn stderr(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    (var / n as f64).sqrt()
}

/// Unbiased pass@k over `n` epoch attempts with `c` correct:
/// `1 - C(n-c, k) / C(n, k)`.
pub fn pass_at_k(values: &[f64], k: usize) -> f64 {
    let n = values.len();
    let c = values.iter().filter(|v| **v >= 0.999).count();
    if n == 0 || k == 0 {
        return 0.0;
    }
    let k = k.min(n);
    if c == 0 {
        return 0.0;
    }
    if n - c < k {
        return 1.0;
    }
    // Product form of 1 - C(n-c, k)/C(n, k), numerically stable for the
    // small n used in epoch counts.
    let mut ratio = 1.0;
    for i in 0..k {
        ratio *= (n - c - i) as f64 / (n - i) as f64;
    }
    1.0 - ratio
}

/// Headline metrics for one scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    /// Display name (scorer, or `scorer/reducer` when reduced non-trivially).
    pub name: String,
    pub scorer: String,
    pub reducer: String,
    pub metrics: BTreeMap<String, f64>,
}

/// Reduce one scorer's values: `values_by_sample` maps each sample id to its
/// per-epoch numeric values.
pub fn aggregate(
    scorer: &str,
    epoch_reducer: &Reducer,
    values_by_sample: &BTreeMap<String, Vec<f64>>,
) -> ScoreSummary {
    let reduced: Vec<f64> = values_by_sample
        .values()
        .map(|epochs| epoch_reducer.reduce(epochs))
        .collect();

    let mut metrics = BTreeMap::new();
    metrics.insert("mean".to_string(), mean(&reduced));
    metrics.insert("accuracy".to_string(), Reducer::Accuracy.reduce(&reduced));
    metrics.insert("stderr".to_string(), stderr(&reduced));

    let name = match epoch_reducer {
        Reducer::Mean => scorer.to_string(),
        other => format!("{scorer}/{}", other.name()),
    };
    ScoreSummary {
        name,
        scorer: scorer.to_string(),
        reducer: epoch_reducer.name(),
        metrics,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
