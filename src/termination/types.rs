//! Termination check and decision types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a termination check looked at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Stalled,
    LowVelocity,
    BudgetExceeded,
    BudgetWarning,
    IterationLimit,
    CatastrophicError,
    IncreasingErrors,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckKind::Stalled => "stalled",
            CheckKind::LowVelocity => "low_velocity",
            CheckKind::BudgetExceeded => "budget_exceeded",
            CheckKind::BudgetWarning => "budget_warning",
            CheckKind::IterationLimit => "iteration_limit",
            CheckKind::CatastrophicError => "catastrophic_error",
            CheckKind::IncreasingErrors => "increasing_errors",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One signal produced by a check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationCheck {
    pub kind: CheckKind,
    pub severity: Severity,
    pub description: String,
    pub evidence: Vec<String>,
}

impl TerminationCheck {
    pub fn new(kind: CheckKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
            evidence: Vec::new(),
        }
    }

    /// Append a line of evidence
    pub fn with_evidence(mut self, line: impl Into<String>) -> Self {
        self.evidence.push(line.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    None,
    CriticalFailure,
    PersistentStall,
    BudgetExceeded,
    UserRequested,
}

/// Verdict for one evaluated iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationDecision {
    pub task_id: String,
    pub iteration: u32,
    pub should_terminate: bool,
    pub reason: TerminationReason,
    pub explanation: String,
    /// In [0, 1]
    pub confidence: f64,
    pub recommended_action: Option<String>,
    pub checks: Vec<TerminationCheck>,
    pub timestamp: DateTime<Utc>,
}

impl TerminationDecision {
    /// Keep running
    pub fn proceed(task_id: &str, iteration: u32, explanation: impl Into<String>, confidence: f64) -> Self {
        Self {
            task_id: task_id.to_string(),
            iteration,
            should_terminate: false,
            reason: TerminationReason::None,
            explanation: explanation.into(),
            confidence,
            recommended_action: None,
            checks: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Stop the task
    pub fn terminate(
        task_id: &str,
        iteration: u32,
        reason: TerminationReason,
        explanation: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            should_terminate: true,
            reason,
            ..Self::proceed(task_id, iteration, explanation, confidence)
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.recommended_action = Some(action.into());
        self
    }

    pub fn with_checks(mut self, checks: Vec<TerminationCheck>) -> Self {
        self.checks = checks;
        self
    }

    /// Checks at the given severity
    pub fn checks_at(&self, severity: Severity) -> impl Iterator<Item = &TerminationCheck> {
        self.checks.iter().filter(move |c| c.severity == severity)
    }

    pub fn has_check(&self, kind: CheckKind) -> bool {
        self.checks.iter().any(|c| c.kind == kind)
    }
}

/// Snapshot of engine-wide counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminationStatistics {
    pub active_tasks: usize,
    /// Tasks whose consecutive-stall counter is nonzero
    pub stalled_tasks: usize,
    /// Tasks above the budget warning ratio of their last supplied budget
    pub tasks_near_budget: usize,
    pub total_tokens: u64,
    pub total_estimated_cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_terminate_builder() {
        let d = TerminationDecision::terminate("t1", 4, TerminationReason::PersistentStall, "stuck", 0.85)
            .with_action("stop")
            .with_checks(vec![TerminationCheck::new(CheckKind::Stalled, Severity::Warning, "x")]);
        assert!(d.should_terminate);
        assert_eq!(d.reason, TerminationReason::PersistentStall);
        assert_eq!(d.recommended_action.as_deref(), Some("stop"));
        assert!(d.has_check(CheckKind::Stalled));
        assert_eq!(d.checks_at(Severity::Warning).count(), 1);
    }

    #[test]
    fn test_decision_serializes_reason_snake_case() {
        let d = TerminationDecision::terminate("t1", 1, TerminationReason::CriticalFailure, "x", 0.95);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["reason"], "critical_failure");
    }

    #[test]
    fn test_check_kind_display() {
        assert_eq!(CheckKind::IncreasingErrors.to_string(), "increasing_errors");
    }
}
