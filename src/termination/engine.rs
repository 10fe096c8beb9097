//! Per-iteration termination decisions.
//!
//! The runner calls [`TerminationEngine::evaluate`] once per agent iteration.
//! The engine records telemetry, runs every check, then applies the policy:
//! 1. Any Critical check terminates (critical failure)
//! 2. Two or more Warnings terminate only once the stall counter reaches
//!    the persistent-stall threshold; otherwise continue with a review hint
//! 3. Anything else continues

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::debug;

use super::checks::{
    budget_check, catastrophic_error_check, error_trend_check, iteration_limit_check, stall_check, velocity_check,
};
use super::types::{
    CheckKind, Severity, TerminationCheck, TerminationDecision, TerminationReason, TerminationStatistics,
};
use crate::budget::{BudgetLimit, BudgetTracker};
use crate::config::TerminationConfig;
use crate::domain::TaskSnapshot;
use crate::durable::DurableWriter;
use crate::id::sanitize_component;
use crate::telemetry::{ProgressTelemetry, count_error_tokens};
use crate::util::lock;

const CRITICAL_CONFIDENCE: f64 = 0.95;
const PERSISTENT_STALL_CONFIDENCE: f64 = 0.85;
const WARNING_CONFIDENCE: f64 = 0.6;
const HEALTHY_CONFIDENCE: f64 = 0.9;

/// Per-task bookkeeping, created on first evaluation
#[derive(Debug, Clone, Default)]
struct TerminationState {
    consecutive_stalls: u32,
    error_history: VecDeque<u32>,
    last_evaluated: Option<DateTime<Utc>>,
    last_limit: Option<BudgetLimit>,
    total_tokens: u64,
    estimated_cost: f64,
}

/// Decides, iteration by iteration, whether a task should be stopped
pub struct TerminationEngine {
    config: TerminationConfig,
    telemetry: Arc<dyn ProgressTelemetry>,
    budget: Arc<BudgetTracker>,
    writer: Option<DurableWriter>,
    states: Mutex<HashMap<String, TerminationState>>,
}

impl TerminationEngine {
    pub fn new(config: TerminationConfig, telemetry: Arc<dyn ProgressTelemetry>, budget: Arc<BudgetTracker>) -> Self {
        Self {
            config,
            telemetry,
            budget,
            writer: None,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Persist terminating decisions under `config.report_dir` with this writer
    pub fn with_writer(mut self, writer: DurableWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        &self.budget
    }

    /// Estimated cost for the given cumulative input/output tokens
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 / 1000.0 * self.config.input_cost_per_1k
            + output_tokens as f64 / 1000.0 * self.config.output_cost_per_1k
    }

    /// Evaluate one iteration of `task` and decide whether to stop it.
    pub fn evaluate(&self, task: &TaskSnapshot, iteration_output: &str, budget: Option<BudgetLimit>) -> TerminationDecision {
        let mut states = lock(&self.states);
        let state = states.entry(task.id.clone()).or_default();

        let mut metrics = self
            .telemetry
            .extract_metrics(&task.id, iteration_output, task.current_iteration);
        metrics.token_usage = task.total_tokens;
        metrics.estimated_cost = self.estimate_cost(task.input_tokens, task.output_tokens);
        state.total_tokens = task.total_tokens;
        state.estimated_cost = metrics.estimated_cost;
        self.telemetry.record_progress(&task.id, metrics);

        if let Some(limit) = budget {
            self.budget.update_usage(&task.id, task.total_tokens);
            state.last_limit = Some(limit);
        }

        let mut checks: Vec<TerminationCheck> = Vec::new();

        let stall = self.telemetry.detect_stall(&task.id);
        checks.extend(stall_check(&stall, self.config.stall_critical_confidence));

        let velocity = self.telemetry.calculate_velocity(&task.id);
        checks.extend(velocity_check(&velocity, self.config.low_velocity_threshold));

        if let Some(limit) = &budget {
            checks.extend(budget_check(
                task.total_tokens,
                limit,
                self.config.budget_warning_ratio,
                self.config.budget_exceeded_ratio,
            ));
        }

        checks.extend(iteration_limit_check(task.current_iteration, task.max_iterations));

        checks.extend(catastrophic_error_check(iteration_output, &self.config.catastrophic_patterns));
        checks.extend(error_trend_check(
            &mut state.error_history,
            count_error_tokens(iteration_output),
            self.config.error_history_len,
        ));

        let stalled = checks.iter().any(|c| c.kind == CheckKind::Stalled);
        if stalled {
            state.consecutive_stalls += 1;
        }

        let decision = self.apply_policy(task, state, checks);

        if decision.should_terminate || !stalled {
            state.consecutive_stalls = 0;
        }
        state.last_evaluated = Some(decision.timestamp);
        drop(states);

        if decision.should_terminate {
            tracing::info!(
                task_id = %task.id,
                iteration = task.current_iteration,
                reason = ?decision.reason,
                "Terminating task"
            );
            self.persist(&decision);
        } else {
            debug!(
                "Task {} iteration {}: continue ({} checks)",
                task.id,
                task.current_iteration,
                decision.checks.len()
            );
        }

        decision
    }

    fn apply_policy(
        &self,
        task: &TaskSnapshot,
        state: &TerminationState,
        checks: Vec<TerminationCheck>,
    ) -> TerminationDecision {
        let critical: Vec<String> = checks
            .iter()
            .filter(|c| c.severity == Severity::Critical)
            .map(|c| c.kind.to_string())
            .collect();
        let warnings = checks.iter().filter(|c| c.severity == Severity::Warning).count();

        if !critical.is_empty() {
            return TerminationDecision::terminate(
                &task.id,
                task.current_iteration,
                TerminationReason::CriticalFailure,
                format!("Critical checks failed: {}", critical.join(", ")),
                CRITICAL_CONFIDENCE,
            )
            .with_action("Stop the task and inspect its latest output")
            .with_checks(checks);
        }

        if warnings >= 2 {
            if state.consecutive_stalls >= self.config.persistent_stall_count {
                return TerminationDecision::terminate(
                    &task.id,
                    task.current_iteration,
                    TerminationReason::PersistentStall,
                    format!(
                        "Stalled for {} consecutive evaluations with {} warnings",
                        state.consecutive_stalls, warnings
                    ),
                    PERSISTENT_STALL_CONFIDENCE,
                )
                .with_action("Stop the task and restart it with a narrower scope")
                .with_checks(checks);
            }
            return TerminationDecision::proceed(
                &task.id,
                task.current_iteration,
                format!("{} warnings raised; continuing", warnings),
                WARNING_CONFIDENCE,
            )
            .with_action("Review the task manually")
            .with_checks(checks);
        }

        TerminationDecision::proceed(
            &task.id,
            task.current_iteration,
            "No blocking issues detected",
            HEALTHY_CONFIDENCE,
        )
        .with_checks(checks)
    }

    /// Stop a task on the user's behalf.
    pub fn request_termination(&self, task: &TaskSnapshot, note: &str) -> TerminationDecision {
        {
            let mut states = lock(&self.states);
            let state = states.entry(task.id.clone()).or_default();
            state.consecutive_stalls = 0;
            state.last_evaluated = Some(Utc::now());
        }
        let explanation = if note.is_empty() {
            "Termination requested by user".to_string()
        } else {
            format!("Termination requested by user: {}", note)
        };
        let decision = TerminationDecision::terminate(
            &task.id,
            task.current_iteration,
            TerminationReason::UserRequested,
            explanation,
            1.0,
        );
        tracing::info!(task_id = %task.id, "User requested termination");
        self.persist(&decision);
        decision
    }

    /// Forget everything known about a task (removal, not pause).
    pub fn clear_task_state(&self, task_id: &str) {
        lock(&self.states).remove(task_id);
        self.telemetry.clear_history(task_id);
        self.budget.clear_usage(task_id);
        debug!("Cleared termination state for {}", task_id);
    }

    /// Current stall counter for a task (0 if unknown)
    pub fn consecutive_stalls(&self, task_id: &str) -> u32 {
        lock(&self.states).get(task_id).map(|s| s.consecutive_stalls).unwrap_or(0)
    }

    pub fn get_statistics(&self) -> TerminationStatistics {
        let states = lock(&self.states);
        let tasks_near_budget = states
            .iter()
            .filter(|(id, s)| match &s.last_limit {
                Some(limit) => self.budget.is_over(id, limit, self.config.budget_warning_ratio),
                None => false,
            })
            .count();
        TerminationStatistics {
            active_tasks: states.len(),
            stalled_tasks: states.values().filter(|s| s.consecutive_stalls > 0).count(),
            tasks_near_budget,
            total_tokens: states.values().map(|s| s.total_tokens).sum(),
            total_estimated_cost: states.values().map(|s| s.estimated_cost).sum(),
        }
    }

    fn report_path(&self, task_id: &str) -> Option<PathBuf> {
        self.config
            .report_dir
            .as_ref()
            .map(|dir| dir.join(sanitize_component(task_id)).join("termination.json"))
    }

    fn persist(&self, decision: &TerminationDecision) {
        if let (Some(writer), Some(path)) = (&self.writer, self.report_path(&decision.task_id)) {
            writer.write_json_in_background(path, decision, "termination");
        }
    }
}
