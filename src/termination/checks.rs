//! The individual termination checks.
//!
//! Each check is a pure function of its inputs and yields at most one
//! [`TerminationCheck`]. The engine gathers their outputs and applies the
//! decision policy.

use std::collections::VecDeque;

use super::types::{CheckKind, Severity, TerminationCheck};
use crate::budget::BudgetLimit;
use crate::telemetry::{StallAnalysis, VelocityAnalysis, VelocityTrend};

/// Stalled when telemetry says so; Critical at or above `critical_confidence`.
pub fn stall_check(analysis: &StallAnalysis, critical_confidence: f64) -> Option<TerminationCheck> {
    if !analysis.is_stalled {
        return None;
    }
    let severity = if analysis.confidence_score >= critical_confidence {
        Severity::Critical
    } else {
        Severity::Warning
    };
    let mut check = TerminationCheck::new(
        CheckKind::Stalled,
        severity,
        format!("Task appears stalled (confidence {:.2})", analysis.confidence_score),
    );
    for condition in &analysis.conditions {
        check = check.with_evidence(format!("{} ({:.2})", condition.description, condition.confidence));
    }
    if let Some(rec) = &analysis.recommendation {
        check = check.with_evidence(format!("Recommendation: {}", rec));
    }
    Some(check)
}

/// Low average velocity; Critical when also decelerating.
pub fn velocity_check(velocity: &VelocityAnalysis, threshold: f64) -> Option<TerminationCheck> {
    if !velocity.has_sufficient_data || velocity.average_velocity >= threshold {
        return None;
    }
    let severity = if velocity.velocity_trend == VelocityTrend::Decelerating {
        Severity::Critical
    } else {
        Severity::Warning
    };
    let mut check = TerminationCheck::new(
        CheckKind::LowVelocity,
        severity,
        format!(
            "Progress velocity {:.1}%/iteration is below {:.1}%",
            velocity.average_velocity, threshold
        ),
    )
    .with_evidence(format!("Trend: {}", velocity.velocity_trend));
    if let Some(remaining) = velocity.estimated_iterations_remaining {
        check = check.with_evidence(format!("Estimated iterations remaining: {}", remaining));
    }
    Some(check)
}

/// Budget usage check.
///
/// Above `exceeded_ratio` is Critical. Between `warning_ratio` and the full
/// budget is a Warning. Usage past the budget but within the exceeded ratio
/// is a grace band and yields nothing.
pub fn budget_check(
    total_tokens: u64,
    limit: &BudgetLimit,
    warning_ratio: f64,
    exceeded_ratio: f64,
) -> Option<TerminationCheck> {
    let used = limit.ratio(total_tokens);
    let evidence = format!("{} of {} tokens ({:.0}%)", total_tokens, limit.max_tokens, used * 100.0);
    if used > exceeded_ratio {
        Some(
            TerminationCheck::new(CheckKind::BudgetExceeded, Severity::Critical, "Token budget exceeded")
                .with_evidence(evidence),
        )
    } else if used > warning_ratio && used <= 1.0 {
        Some(
            TerminationCheck::new(
                CheckKind::BudgetWarning,
                Severity::Warning,
                "Token budget approaching limit",
            )
            .with_evidence(evidence),
        )
    } else {
        None
    }
}

/// Informational note once the iteration cap is reached; zero means no cap.
pub fn iteration_limit_check(current: u32, max: u32) -> Option<TerminationCheck> {
    if max == 0 || current < max {
        return None;
    }
    Some(
        TerminationCheck::new(CheckKind::IterationLimit, Severity::Info, "Iteration limit reached")
            .with_evidence(format!("Iteration {} of {}", current, max)),
    )
}

/// First catastrophic phrase found in the output (case-insensitive).
pub fn catastrophic_error_check(output: &str, patterns: &[String]) -> Option<TerminationCheck> {
    let lower = output.to_lowercase();
    let pattern = patterns.iter().find(|p| lower.contains(&p.to_lowercase()))?;
    let needle = pattern.to_lowercase();
    let line = output
        .lines()
        .find(|l| l.to_lowercase().contains(&needle))
        .unwrap_or_default()
        .trim();
    let excerpt: String = line.chars().take(200).collect();
    Some(
        TerminationCheck::new(
            CheckKind::CatastrophicError,
            Severity::Critical,
            format!("Catastrophic error detected: {}", pattern),
        )
        .with_evidence(excerpt),
    )
}

/// Push `count` into the bounded history; warn if the last three counts rise strictly.
pub fn error_trend_check(history: &mut VecDeque<u32>, count: u32, max_len: usize) -> Option<TerminationCheck> {
    history.push_back(count);
    while history.len() > max_len.max(3) {
        history.pop_front();
    }
    if history.len() < 3 {
        return None;
    }
    let n = history.len();
    let (a, b, c) = (history[n - 3], history[n - 2], history[n - 1]);
    if a < b && b < c {
        Some(
            TerminationCheck::new(CheckKind::IncreasingErrors, Severity::Warning, "Error rate increasing")
                .with_evidence(format!("Recent error counts: {}, {}, {}", a, b, c)),
        )
    } else {
        None
    }
}
