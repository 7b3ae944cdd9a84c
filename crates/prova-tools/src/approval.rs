// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use prova_model::ToolCall;
use regex::Regex;

/// Verdict of one approver for one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Approve,
    /// Rejection is reported to the model as an approval error; the loop
    /// continues.
    Reject { reason: String },
    /// Defer to the next approver in the chain.
    Escalate,
    /// Approve with substituted arguments.
    Modify(serde_json::Value),
}

/// Reviews tool calls before they run.
#[async_trait]
pub trait Approver: Send + Sync {
    fn name(&self) -> &str;
    async fn review(&self, call: &ToolCall) -> ApprovalDecision;
}

/// Approves everything.  The default when a task declares no policy.
pub struct AutoApprover;

#[async_trait]
impl Approver for AutoApprover {
    fn name(&self) -> &str {
        "auto"
    }

    async fn review(&self, _call: &ToolCall) -> ApprovalDecision {
        ApprovalDecision::Approve
    }
}

/// Glob-pattern approver over function names.
///
/// Reject patterns win over approve patterns; a call matching neither
/// escalates to the next approver in the chain.
pub struct PatternApprover {
    approve: Vec<Regex>,
    reject: Vec<Regex>,
}

impl PatternApprover {
    pub fn new(approve: &[&str], reject: &[&str]) -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self { approve: compile(approve), reject: compile(reject) }
    }
}

#[async_trait]
impl Approver for PatternApprover {
    fn name(&self) -> &str {
        "pattern"
    }

    async fn review(&self, call: &ToolCall) -> ApprovalDecision {
        for re in &self.reject {
            if re.is_match(&call.function) {
                return ApprovalDecision::Reject {
                    reason: format!("tool {} is denied by policy", call.function),
                };
            }
        }
        for re in &self.approve {
            if re.is_match(&call.function) {
                return ApprovalDecision::Approve;
            }
        }
        ApprovalDecision::Escalate
    }
}

/// Ordered chain of approvers; the policy a task actually runs with.
///
/// Each approver either settles the call (approve/reject/modify) or
/// escalates to the next.  A call that escalates past the last approver is
/// rejected — escalation with nobody left to decide must fail closed.
pub struct ApprovalChain {
    approvers: Vec<Box<dyn Approver>>,
}

impl ApprovalChain {
    pub fn new(approvers: Vec<Box<dyn Approver>>) -> Self {
        Self { approvers }
    }

    /// The permissive default: a single [`AutoApprover`].
    pub fn auto() -> Self {
        Self::new(vec![Box::new(AutoApprover)])
    }

    pub async fn review(&self, call: &ToolCall) -> ApprovalDecision {
        for approver in &self.approvers {
            match approver.review(call).await {
                ApprovalDecision::Escalate => continue,
                settled => {
                    tracing::debug!(
                        approver = approver.name(),
                        function = %call.function,
                        "approval settled"
                    );
                    return settled;
                }
            }
        }
        ApprovalDecision::Reject {
            reason: format!("no approver approved the call to {}", call.function),
        }
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(function: &str) -> ToolCall {
        ToolCall::new("c1", function, json!({}))
    }

    #[tokio::test]
    async fn auto_approver_approves_everything() {
        assert_eq!(AutoApprover.review(&call("rm_rf")).await, ApprovalDecision::Approve);
    }

    // ── PatternApprover ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn reject_beats_approve_for_same_pattern() {
        let p = PatternApprover::new(&["bash"], &["bash"]);
        assert!(matches!(p.review(&call("bash")).await, ApprovalDecision::Reject { .. }));
    }

    #[tokio::test]
    async fn wildcard_prefix_approves() {
        let p = PatternApprover::new(&["read_*"], &[]);
        assert_eq!(p.review(&call("read_file")).await, ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn unmatched_call_escalates() {
        let p = PatternApprover::new(&["read_*"], &["write_*"]);
        assert_eq!(p.review(&call("bash")).await, ApprovalDecision::Escalate);
    }

    #[tokio::test]
    async fn question_mark_matches_one_char() {
        let p = PatternApprover::new(&["tool?"], &[]);
        assert_eq!(p.review(&call("tool1")).await, ApprovalDecision::Approve);
        assert_eq!(p.review(&call("tool12")).await, ApprovalDecision::Escalate);
    }

    // ── ApprovalChain ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn chain_falls_through_escalations() {
        let chain = ApprovalChain::new(vec![
            Box::new(PatternApprover::new(&["read_*"], &[])),
            Box::new(AutoApprover),
        ]);
        // Not matched by the pattern approver, settled by auto.
        assert_eq!(chain.review(&call("bash")).await, ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn chain_rejects_when_everyone_escalates() {
        let chain =
            ApprovalChain::new(vec![Box::new(PatternApprover::new(&["read_*"], &[]))]);
        assert!(matches!(
            chain.review(&call("bash")).await,
            ApprovalDecision::Reject { .. }
        ));
    }

    #[tokio::test]
    async fn chain_first_settlement_wins() {
        let chain = ApprovalChain::new(vec![
            Box::new(PatternApprover::new(&[], &["bash"])),
            Box::new(AutoApprover),
        ]);
        assert!(matches!(
            chain.review(&call("bash")).await,
            ApprovalDecision::Reject { .. }
        ));
    }
}
