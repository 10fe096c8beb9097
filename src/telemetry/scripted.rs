//! Telemetry with caller-controlled stall and velocity answers.
//!
//! Useful for hosts that compute progress elsewhere and for tests that need
//! to pin the signals the termination engine sees.

use std::collections::HashMap;
use std::sync::Mutex;

use super::history::extract_iteration_metrics;
use super::traits::{IterationMetrics, ProgressTelemetry, StallAnalysis, VelocityAnalysis};
use crate::util::lock;

#[derive(Default)]
struct ScriptState {
    stall: HashMap<String, StallAnalysis>,
    velocity: HashMap<String, VelocityAnalysis>,
    recorded: HashMap<String, Vec<IterationMetrics>>,
}

/// Telemetry whose analyses are set explicitly per task
#[derive(Default)]
pub struct ScriptedTelemetry {
    state: Mutex<ScriptState>,
}

impl ScriptedTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `detect_stall` for this task with `analysis`
    pub fn set_stall(&self, task_id: &str, analysis: StallAnalysis) {
        lock(&self.state).stall.insert(task_id.to_string(), analysis);
    }

    /// Answer `calculate_velocity` for this task with `analysis`
    pub fn set_velocity(&self, task_id: &str, analysis: VelocityAnalysis) {
        lock(&self.state).velocity.insert(task_id.to_string(), analysis);
    }

    /// Metrics recorded so far for a task
    pub fn recorded(&self, task_id: &str) -> Vec<IterationMetrics> {
        lock(&self.state).recorded.get(task_id).cloned().unwrap_or_default()
    }
}

impl ProgressTelemetry for ScriptedTelemetry {
    fn extract_metrics(&self, task_id: &str, raw_output: &str, iteration: u32) -> IterationMetrics {
        extract_iteration_metrics(task_id, raw_output, iteration)
    }

    fn record_progress(&self, task_id: &str, metrics: IterationMetrics) {
        lock(&self.state)
            .recorded
            .entry(task_id.to_string())
            .or_default()
            .push(metrics);
    }

    fn detect_stall(&self, task_id: &str) -> StallAnalysis {
        lock(&self.state).stall.get(task_id).cloned().unwrap_or_default()
    }

    fn calculate_velocity(&self, task_id: &str) -> VelocityAnalysis {
        lock(&self.state).velocity.get(task_id).cloned().unwrap_or_default()
    }

    fn clear_history(&self, task_id: &str) {
        let mut state = lock(&self.state);
        state.recorded.remove(task_id);
        state.stall.remove(task_id);
        state.velocity.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::VelocityTrend;

    #[test]
    fn test_scripted_answers() {
        let telemetry = ScriptedTelemetry::new();
        telemetry.set_stall("t1", StallAnalysis::stalled(0.7));
        telemetry.set_velocity("t1", VelocityAnalysis::measured(3.0, VelocityTrend::Decelerating));

        assert!(telemetry.detect_stall("t1").is_stalled);
        assert_eq!(telemetry.calculate_velocity("t1").average_velocity, 3.0);
        assert!(!telemetry.detect_stall("t2").is_stalled);
    }

    #[test]
    fn test_clear_history_drops_script() {
        let telemetry = ScriptedTelemetry::new();
        telemetry.set_stall("t1", StallAnalysis::stalled(0.9));
        let m = telemetry.extract_metrics("t1", "50%", 1);
        telemetry.record_progress("t1", m);
        assert_eq!(telemetry.recorded("t1").len(), 1);

        telemetry.clear_history("t1");
        assert!(telemetry.recorded("t1").is_empty());
        assert!(!telemetry.detect_stall("t1").is_stalled);
    }
}
