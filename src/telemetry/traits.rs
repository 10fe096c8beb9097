//! Progress telemetry interface consumed by the termination engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metrics extracted from one iteration's raw agent output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationMetrics {
    pub task_id: String,
    pub iteration: u32,
    /// Last "NN%" progress marker seen in the output, if any
    pub progress_percent: Option<f64>,
    /// Lines that report a file being created, modified or deleted
    pub files_changed: u32,
    /// Occurrences of "error", "exception" and "failed"
    pub error_count: u32,
    /// SHA-256 of the whitespace-normalized output
    pub output_fingerprint: String,
    pub output_len: usize,
    /// Cumulative tokens, filled in by the caller before recording
    pub token_usage: u64,
    /// Cumulative estimated cost in USD, filled in by the caller before recording
    pub estimated_cost: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Kind of evidence that a task is not moving forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallConditionType {
    NoProgress,
    RepeatedOutput,
    NoFileChanges,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallCondition {
    pub condition_type: StallConditionType,
    pub description: String,
    pub confidence: f64,
}

/// Result of a stall analysis over a task's recent history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StallAnalysis {
    pub is_stalled: bool,
    /// In [0, 1]
    pub confidence_score: f64,
    pub recommendation: Option<String>,
    pub conditions: Vec<StallCondition>,
}

impl StallAnalysis {
    /// No stall detected
    pub fn none() -> Self {
        Self::default()
    }

    /// A stall with the given confidence and no recorded conditions
    pub fn stalled(confidence_score: f64) -> Self {
        Self {
            is_stalled: true,
            confidence_score,
            recommendation: None,
            conditions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VelocityTrend {
    Accelerating,
    #[default]
    Stable,
    Decelerating,
}

impl std::fmt::Display for VelocityTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VelocityTrend::Accelerating => "accelerating",
            VelocityTrend::Stable => "stable",
            VelocityTrend::Decelerating => "decelerating",
        };
        write!(f, "{}", s)
    }
}

/// Progress rate over a task's recorded history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VelocityAnalysis {
    pub has_sufficient_data: bool,
    /// Percent progress per iteration
    pub average_velocity: f64,
    pub velocity_trend: VelocityTrend,
    pub estimated_iterations_remaining: Option<u32>,
}

impl VelocityAnalysis {
    /// Not enough samples to say anything
    pub fn insufficient() -> Self {
        Self::default()
    }

    pub fn measured(average_velocity: f64, velocity_trend: VelocityTrend) -> Self {
        Self {
            has_sufficient_data: true,
            average_velocity,
            velocity_trend,
            estimated_iterations_remaining: None,
        }
    }
}

/// Extracts and retains per-task progress history.
///
/// Implementations are shared across tasks, so every method takes `&self`
/// and must be safe to call from several threads.
pub trait ProgressTelemetry: Send + Sync {
    /// Parse one iteration's raw output
    fn extract_metrics(&self, task_id: &str, raw_output: &str, iteration: u32) -> IterationMetrics;

    /// Append metrics to the task's history
    fn record_progress(&self, task_id: &str, metrics: IterationMetrics);

    /// Analyze recent history for lack of progress
    fn detect_stall(&self, task_id: &str) -> StallAnalysis;

    /// Average progress per iteration and its trend
    fn calculate_velocity(&self, task_id: &str) -> VelocityAnalysis;

    /// Forget everything recorded for the task
    fn clear_history(&self, task_id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_analysis_none() {
        let analysis = StallAnalysis::none();
        assert!(!analysis.is_stalled);
        assert_eq!(analysis.confidence_score, 0.0);
        assert!(analysis.conditions.is_empty());
    }

    #[test]
    fn test_velocity_insufficient_defaults() {
        let v = VelocityAnalysis::insufficient();
        assert!(!v.has_sufficient_data);
        assert_eq!(v.velocity_trend, VelocityTrend::Stable);
    }

    #[test]
    fn test_trend_display() {
        assert_eq!(VelocityTrend::Decelerating.to_string(), "decelerating");
    }
}
