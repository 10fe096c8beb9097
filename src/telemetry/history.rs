//! History-backed telemetry.
//!
//! Keeps the last few iterations per task in memory and derives stall and
//! velocity signals from them. Extraction is deliberately shallow: a progress
//! marker, file-change lines, error tokens and an output fingerprint.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use sha2::{Digest, Sha256};

use super::traits::{
    IterationMetrics, ProgressTelemetry, StallAnalysis, StallCondition, StallConditionType, VelocityAnalysis,
    VelocityTrend,
};
use crate::util::lock;

/// Tokens counted as error signals in agent output.
pub const ERROR_TOKENS: [&str; 3] = ["error", "exception", "failed"];

/// Line prefixes that report a file being touched.
const FILE_CHANGE_MARKERS: [&str; 6] = ["modified:", "created:", "deleted:", "wrote ", "edited ", "updated file"];

/// Iterations inspected by stall detection.
const STALL_WINDOW: usize = 3;

/// Minimum combined confidence for a stall.
const STALL_THRESHOLD: f64 = 0.6;

/// Trend band (percent per iteration) treated as stable.
const TREND_BAND: f64 = 1.0;

/// Count case-insensitive occurrences of the error tokens.
pub fn count_error_tokens(output: &str) -> u32 {
    let lower = output.to_lowercase();
    ERROR_TOKENS.iter().map(|t| lower.matches(t).count() as u32).sum()
}

/// Find the last `NN%` / `NN.N%` marker in the output, clamped to [0, 100].
pub fn parse_progress_percent(output: &str) -> Option<f64> {
    let bytes = output.as_bytes();
    let mut found = None;
    for (idx, b) in bytes.iter().enumerate() {
        if *b != b'%' {
            continue;
        }
        let mut start = idx;
        while start > 0 && (bytes[start - 1].is_ascii_digit() || bytes[start - 1] == b'.') {
            start -= 1;
        }
        if start == idx {
            continue;
        }
        if let Ok(value) = output[start..idx].trim_start_matches('.').parse::<f64>() {
            found = Some(value.clamp(0.0, 100.0));
        }
    }
    found
}

/// Count lines that report a file change.
pub fn count_file_changes(output: &str) -> u32 {
    output
        .lines()
        .map(|l| l.trim_start().to_lowercase())
        .filter(|l| FILE_CHANGE_MARKERS.iter().any(|m| l.starts_with(m)))
        .count() as u32
}

/// Hex SHA-256 of the output with whitespace runs collapsed.
pub fn fingerprint(output: &str) -> String {
    let normalized = output.split_whitespace().collect::<Vec<_>>().join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Run every extractor over one iteration's output.
pub fn extract_iteration_metrics(task_id: &str, raw_output: &str, iteration: u32) -> IterationMetrics {
    IterationMetrics {
        task_id: task_id.to_string(),
        iteration,
        progress_percent: parse_progress_percent(raw_output),
        files_changed: count_file_changes(raw_output),
        error_count: count_error_tokens(raw_output),
        output_fingerprint: fingerprint(raw_output),
        output_len: raw_output.len(),
        token_usage: 0,
        estimated_cost: 0.0,
        recorded_at: Utc::now(),
    }
}

/// In-memory telemetry that keeps a bounded history per task
pub struct HistoryTelemetry {
    histories: Mutex<HashMap<String, Vec<IterationMetrics>>>,
    max_history: usize,
}

impl Default for HistoryTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryTelemetry {
    pub fn new() -> Self {
        Self::with_max_history(20)
    }

    /// Keep at most `max_history` iterations per task (minimum one stall window)
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            histories: Mutex::new(HashMap::new()),
            max_history: max_history.max(STALL_WINDOW),
        }
    }

    /// Copy of the recorded history for a task, oldest first
    pub fn history(&self, task_id: &str) -> Vec<IterationMetrics> {
        lock(&self.histories).get(task_id).cloned().unwrap_or_default()
    }

    pub fn tracked_tasks(&self) -> usize {
        lock(&self.histories).len()
    }
}

/// Progress series with unknown values carried forward from the last known one.
///
/// Leading iterations without any marker are dropped.
fn carried_progress(history: &[IterationMetrics]) -> Vec<f64> {
    let mut series = Vec::with_capacity(history.len());
    let mut last = None;
    for m in history {
        if let Some(p) = m.progress_percent {
            last = Some(p);
        }
        if let Some(p) = last {
            series.push(p);
        }
    }
    series
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub(crate) fn analyze_stall(history: &[IterationMetrics]) -> StallAnalysis {
    if history.len() < STALL_WINDOW {
        return StallAnalysis::none();
    }
    let window = &history[history.len() - STALL_WINDOW..];
    let mut conditions = Vec::new();

    // Carry over the whole history so a marker before the window still counts
    let carried = carried_progress(history);
    if carried.len() >= STALL_WINDOW {
        let progress = &carried[carried.len() - STALL_WINDOW..];
        let min = progress.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = progress.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max - min < 0.5 {
            conditions.push(StallCondition {
                condition_type: StallConditionType::NoProgress,
                description: format!("Progress stuck at {:.0}% for {} iterations", max, STALL_WINDOW),
                confidence: 0.6,
            });
        }
    }

    let first = &window[0].output_fingerprint;
    if window.iter().all(|m| &m.output_fingerprint == first) {
        conditions.push(StallCondition {
            condition_type: StallConditionType::RepeatedOutput,
            description: format!("Identical output for {} iterations", STALL_WINDOW),
            confidence: 0.9,
        });
    }

    if window.iter().all(|m| m.files_changed == 0) {
        conditions.push(StallCondition {
            condition_type: StallConditionType::NoFileChanges,
            description: format!("No file changes in {} iterations", STALL_WINDOW),
            confidence: 0.5,
        });
    }

    if conditions.is_empty() {
        return StallAnalysis::none();
    }

    let strongest = conditions.iter().map(|c| c.confidence).fold(0.0, f64::max);
    let confidence = (strongest + 0.1 * (conditions.len() - 1) as f64).min(1.0);
    let is_stalled = confidence >= STALL_THRESHOLD;

    let recommendation = if !is_stalled {
        None
    } else if conditions
        .iter()
        .any(|c| c.condition_type == StallConditionType::RepeatedOutput)
    {
        Some("Agent is repeating itself; change the prompt or stop the task".to_string())
    } else {
        Some("Agent is not advancing; review the task scope".to_string())
    };

    StallAnalysis {
        is_stalled,
        confidence_score: confidence,
        recommendation,
        conditions,
    }
}

pub(crate) fn analyze_velocity(history: &[IterationMetrics]) -> VelocityAnalysis {
    let progress = carried_progress(history);
    if progress.len() < 3 {
        return VelocityAnalysis::insufficient();
    }

    let deltas: Vec<f64> = progress.windows(2).map(|w| w[1] - w[0]).collect();
    let average = mean(&deltas);

    let half = deltas.len() / 2;
    let early = mean(&deltas[..half]);
    let late = mean(&deltas[deltas.len() - half..]);
    let trend = if late - early > TREND_BAND {
        VelocityTrend::Accelerating
    } else if early - late > TREND_BAND {
        VelocityTrend::Decelerating
    } else {
        VelocityTrend::Stable
    };

    let last = progress.last().copied().unwrap_or(0.0);
    let estimated_iterations_remaining = if average > 0.0 {
        Some(((100.0 - last).max(0.0) / average).ceil() as u32)
    } else {
        None
    };

    VelocityAnalysis {
        has_sufficient_data: true,
        average_velocity: average,
        velocity_trend: trend,
        estimated_iterations_remaining,
    }
}

impl ProgressTelemetry for HistoryTelemetry {
    fn extract_metrics(&self, task_id: &str, raw_output: &str, iteration: u32) -> IterationMetrics {
        extract_iteration_metrics(task_id, raw_output, iteration)
    }

    fn record_progress(&self, task_id: &str, metrics: IterationMetrics) {
        let mut histories = lock(&self.histories);
        let history = histories.entry(task_id.to_string()).or_default();
        history.push(metrics);
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(..excess);
        }
    }

    fn detect_stall(&self, task_id: &str) -> StallAnalysis {
        let histories = lock(&self.histories);
        histories.get(task_id).map(|h| analyze_stall(h)).unwrap_or_default()
    }

    fn calculate_velocity(&self, task_id: &str) -> VelocityAnalysis {
        let histories = lock(&self.histories);
        histories.get(task_id).map(|h| analyze_velocity(h)).unwrap_or_default()
    }

    fn clear_history(&self, task_id: &str) {
        lock(&self.histories).remove(task_id);
    }
}
