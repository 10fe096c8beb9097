//! Token budget tracking.
//!
//! Accumulates token usage per task and prices it at a flat rate. The flat
//! rate is for budgeting only; per-kind pricing lives with the termination
//! engine's cost estimate.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BudgetConfig;
use crate::util::lock;

/// Token ceiling supplied per evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimit {
    pub max_tokens: u64,
}

impl BudgetLimit {
    pub fn new(max_tokens: u64) -> Self {
        Self { max_tokens }
    }

    /// Fraction of the budget used; zero-token budgets count as fully used
    /// once any token is spent.
    pub fn ratio(&self, tokens: u64) -> f64 {
        if self.max_tokens == 0 {
            if tokens == 0 { 0.0 } else { f64::INFINITY }
        } else {
            tokens as f64 / self.max_tokens as f64
        }
    }
}

/// Usage record for one task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total_tokens: u64,
    pub estimated_cost: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Ok,
    Warning,
    Exceeded,
}

/// Per-task token accounting
#[derive(Debug)]
pub struct BudgetTracker {
    config: BudgetConfig,
    usage: Mutex<HashMap<String, TokenUsage>>,
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Flat-rate cost of `tokens`
    pub fn cost_of(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.config.cost_per_1k_tokens
    }

    /// Record the task's cumulative token count, replacing any previous value.
    pub fn update_usage(&self, task_id: &str, total_tokens: u64) -> TokenUsage {
        let record = TokenUsage {
            total_tokens,
            estimated_cost: self.cost_of(total_tokens),
            last_updated: Some(Utc::now()),
        };
        lock(&self.usage).insert(task_id.to_string(), record.clone());
        record
    }

    /// Usage for a task; unknown tasks get a zeroed record.
    pub fn get_usage(&self, task_id: &str) -> TokenUsage {
        lock(&self.usage).get(task_id).cloned().unwrap_or_default()
    }

    pub fn get_total_tokens_used(&self) -> u64 {
        lock(&self.usage).values().map(|u| u.total_tokens).sum()
    }

    pub fn get_total_estimated_cost(&self) -> f64 {
        lock(&self.usage).values().map(|u| u.estimated_cost).sum()
    }

    pub fn clear_usage(&self, task_id: &str) {
        lock(&self.usage).remove(task_id);
    }

    pub fn tracked_tasks(&self) -> usize {
        lock(&self.usage).len()
    }

    /// Fraction of `limit` the task has used
    pub fn usage_ratio(&self, task_id: &str, limit: &BudgetLimit) -> f64 {
        limit.ratio(self.get_usage(task_id).total_tokens)
    }

    /// Classify the task's usage against `limit`
    pub fn status(&self, task_id: &str, limit: &BudgetLimit) -> BudgetStatus {
        let ratio = self.usage_ratio(task_id, limit);
        if ratio > 1.0 {
            BudgetStatus::Exceeded
        } else if ratio > self.config.warning_ratio {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        }
    }

    /// Whether the task has used more than `ratio` of `limit`
    pub fn is_over(&self, task_id: &str, limit: &BudgetLimit, ratio: f64) -> bool {
        self.usage_ratio(task_id, limit) > ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_task_is_zeroed() {
        let tracker = BudgetTracker::default();
        let usage = tracker.get_usage("missing");
        assert_eq!(usage, TokenUsage::default());
        assert_eq!(usage.total_tokens, 0);
        assert!(usage.last_updated.is_none());
    }

    #[test]
    fn test_update_usage_prices_at_flat_rate() {
        let tracker = BudgetTracker::default();
        let usage = tracker.update_usage("t1", 5000);
        assert_eq!(usage.total_tokens, 5000);
        assert!((usage.estimated_cost - 0.05).abs() < 1e-9);
        assert!(usage.last_updated.is_some());
    }

    #[test]
    fn test_update_replaces_not_accumulates() {
        let tracker = BudgetTracker::default();
        tracker.update_usage("t1", 1000);
        tracker.update_usage("t1", 1500);
        assert_eq!(tracker.get_usage("t1").total_tokens, 1500);
    }

    #[test]
    fn test_totals_across_tasks() {
        let tracker = BudgetTracker::default();
        tracker.update_usage("t1", 1000);
        tracker.update_usage("t2", 3000);
        assert_eq!(tracker.get_total_tokens_used(), 4000);
        assert!((tracker.get_total_estimated_cost() - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_clear_usage() {
        let tracker = BudgetTracker::default();
        tracker.update_usage("t1", 1000);
        tracker.clear_usage("t1");
        assert_eq!(tracker.tracked_tasks(), 0);
        assert_eq!(tracker.get_total_tokens_used(), 0);
    }

    #[test]
    fn test_status_thresholds() {
        let tracker = BudgetTracker::default();
        let limit = BudgetLimit::new(1000);

        tracker.update_usage("t1", 500);
        assert_eq!(tracker.status("t1", &limit), BudgetStatus::Ok);

        tracker.update_usage("t1", 850);
        assert_eq!(tracker.status("t1", &limit), BudgetStatus::Warning);

        tracker.update_usage("t1", 1200);
        assert_eq!(tracker.status("t1", &limit), BudgetStatus::Exceeded);
    }

    #[test]
    fn test_zero_budget_ratio() {
        let limit = BudgetLimit::new(0);
        assert_eq!(limit.ratio(0), 0.0);
        assert!(limit.ratio(1).is_infinite());
    }

    #[test]
    fn test_is_over() {
        let tracker = BudgetTracker::default();
        let limit = BudgetLimit::new(1000);
        tracker.update_usage("t1", 810);
        assert!(tracker.is_over("t1", &limit, 0.8));
        assert!(!tracker.is_over("t1", &limit, 0.9));
    }
}
