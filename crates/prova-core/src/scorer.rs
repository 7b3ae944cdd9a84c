// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scoring: each registered scorer maps a finished task state to a
//! [`Score`].  Scorer failures are recorded on the sample but never fail
//! the run.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    state::{TaskState, Targets},
    transcript::EventBody,
};

/// Conventional letter grades used by the text-valued scorers.
pub const CORRECT: &str = "C";
pub const INCORRECT: &str = "I";
pub const PARTIAL: &str = "P";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Object(serde_json::Map<String, serde_json::Value>),
}

impl ScoreValue {
    /// Numeric view used by reducers: booleans are 1/0, letter grades map
    /// C → 1, P → 0.5, I → 0, numeric strings parse, anything else is None.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Number(n) => Some(*n),
            Self::Text(s) => match s.as_str() {
                CORRECT => Some(1.0),
                PARTIAL => Some(0.5),
                INCORRECT => Some(0.0),
                other => other.trim().parse().ok(),
            },
            Self::Object(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub value: ScoreValue,
    /// The answer the scorer extracted from the state, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Score {
    pub fn correct(answer: impl Into<String>) -> Self {
        Self {
            value: ScoreValue::Text(CORRECT.into()),
            answer: Some(answer.into()),
            explanation: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn incorrect(answer: impl Into<String>) -> Self {
        Self {
            value: ScoreValue::Text(INCORRECT.into()),
            answer: Some(answer.into()),
            explanation: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }
}

#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;
    async fn score(&self, state: &TaskState, target: &Targets) -> anyhow::Result<Score>;
}

/// Apply every scorer to a finished sample.  Failed scorers are recorded as
/// error events and skipped; the run continues.
pub async fn run_scorers(
    scorers: &[std::sync::Arc<dyn Scorer>],
    state: &TaskState,
    target: &Targets,
) -> BTreeMap<String, Score> {
    let mut scores = BTreeMap::new();
    for scorer in scorers {
        state.transcript.begin_span("scorer", scorer.name());
        match scorer.score(state, target).await {
            Ok(score) => {
                scores.insert(scorer.name().to_string(), score);
            }
            Err(e) => {
                warn!(scorer = scorer.name(), error = %e, "scorer failed");
                state
                    .transcript
                    .record(EventBody::Error { message: format!("scorer {} failed: {e}", scorer.name()) });
            }
        }
        state.transcript.end_span();
    }
    scores
}

// ─── Built-in scorers ─────────────────────────────────────────────────────────

/// Exact match of the completion against any target (after trimming).
pub struct ExactMatch;

#[async_trait]
impl Scorer for ExactMatch {
    fn name(&self) -> &str {
        "exact"
    }

    async fn score(&self, state: &TaskState, target: &Targets) -> anyhow::Result<Score> {
        let answer = state.completion().trim().to_string();
        let hit = target.iter().any(|t| t.trim() == answer);
        Ok(if hit { Score::correct(answer) } else { Score::incorrect(answer) })
    }
}

/// Any target appears as a substring of the completion.
pub struct Includes;

#[async_trait]
impl Scorer for Includes {
    fn name(&self) -> &str {
        "includes"
    }

    async fn score(&self, state: &TaskState, target: &Targets) -> anyhow::Result<Score> {
        let answer = state.completion();
        let hit = target.iter().any(|t| !t.is_empty() && answer.contains(t.as_str()));
        Ok(if hit { Score::correct(answer) } else { Score::incorrect(answer) })
    }
}

/// Numeric match: the last number in the completion equals the target.
pub struct MatchNumber;

#[async_trait]
impl Scorer for MatchNumber {
    fn name(&self) -> &str {
        "match_number"
    }

    async fn score(&self, state: &TaskState, target: &Targets) -> anyhow::Result<Score> {
        let completion = state.completion();
        let answer = last_number(&completion);
        let hit = match (answer, target.iter().next().and_then(|t| t.trim().parse::<f64>().ok()))
        {
            (Some(a), Some(t)) => (a - t).abs() < 1e-9,
            _ => false,
        };
        let shown = answer.map(fmt_number).unwrap_or_default();
        Ok(if hit { Score::correct(shown) } else { Score::incorrect(shown) })
    }
}

/// Grades the submission with a model instead of string matching.
///
/// The grader gets its own gateway (often a different, cheaper model than
/// the one being evaluated) and must end its verdict with `GRADE: C`,
/// `GRADE: P` or `GRADE: I`.  An unparseable verdict is a scorer failure,
/// which is recorded on the sample without failing the run.
pub struct ModelGradedScorer {
    gateway: std::sync::Arc<prova_model::ModelGateway>,
    template: String,
}

const GRADER_TEMPLATE: &str = "\
You are assessing a submitted answer on a given task based on a criterion.

[BEGIN DATA]
[Task]: {question}
[Submission]: {answer}
[Criterion]: {criterion}
[END DATA]

Does the submission meet the criterion?  After your reasoning, finish with \
exactly one line of the form 'GRADE: C' (fully meets it), 'GRADE: P' \
(partially meets it) or 'GRADE: I' (does not meet it).";

impl ModelGradedScorer {
    pub fn new(gateway: std::sync::Arc<prova_model::ModelGateway>) -> Self {
        Self { gateway, template: GRADER_TEMPLATE.to_string() }
    }

    /// Custom grading template with `{question}`, `{answer}` and
    /// `{criterion}` placeholders.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }
}

#[async_trait]
impl Scorer for ModelGradedScorer {
    fn name(&self) -> &str {
        "model_graded"
    }

    async fn score(&self, state: &TaskState, target: &Targets) -> anyhow::Result<Score> {
        let question = state
            .messages()
            .iter()
            .find(|m| m.role() == prova_model::Role::User)
            .map(|m| m.text())
            .unwrap_or_default();
        let answer = state.completion();
        let criterion = target.iter().cloned().collect::<Vec<_>>().join("\n");
        let prompt = self
            .template
            .replace("{question}", &question)
            .replace("{answer}", &answer)
            .replace("{criterion}", &criterion);

        let reply = self
            .gateway
            .generate(
                &[prova_model::ChatMessage::user(prompt)],
                &[],
                &prova_model::ToolChoice::None,
                &prova_model::GenerateConfig::default(),
                None,
            )
            .await?;
        let verdict = reply.output.completion();
        let grade = parse_grade(&verdict).ok_or_else(|| {
            anyhow::anyhow!("grader reply contains no GRADE line: {verdict:?}")
        })?;
        Ok(Score {
            value: ScoreValue::Text(grade.to_string()),
            answer: Some(answer),
            explanation: Some(verdict),
            metadata: serde_json::Map::new(),
        })
    }
}

fn parse_grade(verdict: &str) -> Option<char> {
    let tail = &verdict[verdict.rfind("GRADE:")? + "GRADE:".len()..];
    tail.trim_start()
        .chars()
        .next()
        .filter(|c| matches!(c, 'C' | 'P' | 'I'))
}

/// Grades a multiple-choice reply: the letter after the final `ANSWER:`
/// marker must name the target choice (by letter or by choice text).
pub struct ChoiceScorer;

#[async_trait]
impl Scorer for ChoiceScorer {
    fn name(&self) -> &str {
        "choice"
    }

    async fn score(&self, state: &TaskState, target: &Targets) -> anyhow::Result<Score> {
        let completion = state.completion();
        let Some(letter) = parse_answer_letter(&completion) else {
            return Ok(Score::incorrect("")
                .with_explanation("no ANSWER line found in the completion"));
        };
        let answer = letter.to_string();
        let index = (letter as u8).wrapping_sub(b'A') as usize;
        let chosen_text = state.choices.get(index).map(String::as_str);
        let hit = target.iter().any(|t| {
            let t = t.trim();
            t.eq_ignore_ascii_case(&answer) || Some(t) == chosen_text
        });
        Ok(if hit { Score::correct(answer) } else { Score::incorrect(answer) })
    }
}

fn parse_answer_letter(completion: &str) -> Option<char> {
    let tail = &completion[completion.rfind("ANSWER:")? + "ANSWER:".len()..];
    tail.trim_start()
        .chars()
        .next()
        .filter(char::is_ascii_uppercase)
}

fn fmt_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// The last decimal number in a string, if any.
fn last_number(s: &str) -> Option<f64> {
    let mut result = None;
    let mut current = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' || (c == '-' && current.is_empty()) {
            current.push(c);
        } else {
            if let Ok(n) = current.parse::<f64>() {
                result = Some(n);
            }
            current.clear();
        }
    }
    if let Ok(n) = current.parse::<f64>() {
        result = Some(n);
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use prova_model::ChatMessage;

    use super::*;
    use crate::limits::LimitTracker;
    use crate::state::Sample;
    use crate::transcript::Transcript;

    fn state_with_completion(text: &str) -> TaskState {
        let mut st = TaskState::new(
            &Sample::text(1, "q", "unused"),
            1,
            "mock/model",
            Arc::new(LimitTracker::unlimited()),
            Transcript::new(),
        );
        st.push_message(ChatMessage::assistant(text)).unwrap();
        st
    }

    // ── ScoreValue numeric view ───────────────────────────────────────────────

    #[test]
    fn grades_map_to_numbers() {
        assert_eq!(ScoreValue::Text("C".into()).as_f64(), Some(1.0));
        assert_eq!(ScoreValue::Text("P".into()).as_f64(), Some(0.5));
        assert_eq!(ScoreValue::Text("I".into()).as_f64(), Some(0.0));
        assert_eq!(ScoreValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(ScoreValue::Number(0.25).as_f64(), Some(0.25));
        assert_eq!(ScoreValue::Text("nope".into()).as_f64(), None);
    }

    // ── Built-in scorers ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn exact_match_trims_whitespace() {
        let st = state_with_completion("  2 \n");
        let score = ExactMatch.score(&st, &Targets::one("2")).await.unwrap();
        assert_eq!(score.value, ScoreValue::Text("C".into()));
        assert_eq!(score.answer.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn exact_match_any_target_counts() {
        let st = state_with_completion("four");
        let t = Targets(vec!["4".into(), "four".into()]);
        let score = ExactMatch.score(&st, &t).await.unwrap();
        assert_eq!(score.value, ScoreValue::Text("C".into()));
    }

    #[tokio::test]
    async fn includes_finds_substring() {
        let st = state_with_completion("The answer is 2.");
        let score = Includes.score(&st, &Targets::one("2")).await.unwrap();
        assert_eq!(score.value, ScoreValue::Text("C".into()));
    }

    #[tokio::test]
    async fn match_number_reads_the_last_number() {
        let st = state_with_completion("1 + 1 equals 2");
        let score = MatchNumber.score(&st, &Targets::one("2")).await.unwrap();
        assert_eq!(score.value, ScoreValue::Text("C".into()));
        assert_eq!(score.answer.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn match_number_incorrect_when_numbers_differ() {
        let st = state_with_completion("I think it is 3");
        let score = MatchNumber.score(&st, &Targets::one("2")).await.unwrap();
        assert_eq!(score.value, ScoreValue::Text("I".into()));
    }

    #[test]
    fn last_number_handles_decimals_and_negatives() {
        assert_eq!(last_number("answer: -1.5 then 3"), Some(3.0));
        assert_eq!(last_number("only -1.5"), Some(-1.5));
        assert_eq!(last_number("none here"), None);
    }

    // ── ModelGradedScorer ─────────────────────────────────────────────────────

    use prova_model::{GatewayOptions, ModelGateway, ScriptedModel};

    fn grader(reply: &str) -> ModelGradedScorer {
        ModelGradedScorer::new(Arc::new(ModelGateway::new(
            Arc::new(ScriptedModel::always_text(reply)),
            GatewayOptions::default(),
        )))
    }

    #[tokio::test]
    async fn model_graded_parses_the_grade_line() {
        let st = state_with_completion("Paris");
        let scorer = grader("The capital matches the criterion.\nGRADE: C");
        let score = scorer.score(&st, &Targets::one("Paris")).await.unwrap();
        assert_eq!(score.value, ScoreValue::Text("C".into()));
        assert_eq!(score.answer.as_deref(), Some("Paris"));
        assert!(score.explanation.unwrap().contains("criterion"));
    }

    #[tokio::test]
    async fn model_graded_partial_credit() {
        let st = state_with_completion("roughly right");
        let scorer = grader("Close but incomplete. GRADE: P");
        let score = scorer.score(&st, &Targets::one("exact")).await.unwrap();
        assert_eq!(score.value.as_f64(), Some(0.5));
    }

    #[tokio::test]
    async fn model_graded_without_grade_line_is_a_scorer_error() {
        let st = state_with_completion("whatever");
        let scorer = grader("I refuse to grade this.");
        let err = scorer.score(&st, &Targets::one("x")).await.unwrap_err();
        assert!(err.to_string().contains("GRADE"));
    }

    #[test]
    fn grade_parser_takes_the_last_marker_and_rejects_noise() {
        assert_eq!(parse_grade("GRADE: I ... GRADE: C"), Some('C'));
        assert_eq!(parse_grade("GRADE: X"), None);
        assert_eq!(parse_grade("no marker"), None);
    }

    // ── ChoiceScorer ──────────────────────────────────────────────────────────

    fn mc_state(completion: &str, choices: &[&str]) -> TaskState {
        let mut sample = Sample::text(1, "pick one", "unused");
        sample.choices = choices.iter().map(|s| s.to_string()).collect();
        let mut st = TaskState::new(
            &sample,
            1,
            "mock/model",
            Arc::new(LimitTracker::unlimited()),
            Transcript::new(),
        );
        st.push_message(ChatMessage::assistant(completion)).unwrap();
        st
    }

    #[tokio::test]
    async fn choice_scorer_matches_the_answer_letter() {
        let st = mc_state("Thinking...\nANSWER: B", &["red", "green", "blue"]);
        let score = ChoiceScorer.score(&st, &Targets::one("B")).await.unwrap();
        assert_eq!(score.value, ScoreValue::Text("C".into()));
        assert_eq!(score.answer.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn choice_scorer_accepts_the_choice_text_as_target() {
        let st = mc_state("ANSWER: C", &["red", "green", "blue"]);
        let score = ChoiceScorer.score(&st, &Targets::one("blue")).await.unwrap();
        assert_eq!(score.value, ScoreValue::Text("C".into()));
    }

    #[tokio::test]
    async fn choice_scorer_without_answer_line_is_incorrect() {
        let st = mc_state("I pick green", &["red", "green"]);
        let score = ChoiceScorer.score(&st, &Targets::one("B")).await.unwrap();
        assert_eq!(score.value, ScoreValue::Text("I".into()));
        assert!(score.explanation.unwrap().contains("ANSWER"));
    }

    #[test]
    fn answer_letter_takes_the_last_marker() {
        assert_eq!(parse_answer_letter("ANSWER: A\nANSWER: D"), Some('D'));
        assert_eq!(parse_answer_letter("answer: a"), None);
    }

    // ── run_scorers ───────────────────────────────────────────────────────────

    struct Boom;

    #[async_trait]
    impl Scorer for Boom {
        fn name(&self) -> &str {
            "boom"
        }
        async fn score(&self, _s: &TaskState, _t: &Targets) -> anyhow::Result<Score> {
            anyhow::bail!("scorer exploded")
        }
    }

    #[tokio::test]
    async fn failed_scorer_is_skipped_and_recorded() {
        let st = state_with_completion("2");
        let scorers: Vec<Arc<dyn Scorer>> = vec![Arc::new(Boom), Arc::new(ExactMatch)];
        let scores = run_scorers(&scorers, &st, &Targets::one("2")).await;
        assert!(!scores.contains_key("boom"));
        assert!(scores.contains_key("exact"));
        assert!(st.transcript.events().iter().any(|e| matches!(
            &e.body,
            EventBody::Error { message } if message.contains("boom")
        )));
    }

    #[tokio::test]
    async fn scores_are_keyed_by_scorer_name() {
        let st = state_with_completion("The answer is 2");
        let scorers: Vec<Arc<dyn Scorer>> =
            vec![Arc::new(Includes), Arc::new(MatchNumber)];
        let scores = run_scorers(&scorers, &st, &Targets::one("2")).await;
        assert_eq!(scores.len(), 2);
        assert!(scores.contains_key("includes"));
        assert!(scores.contains_key("match_number"));
    }
}
