//! Progress telemetry
//!
//! This module provides:
//! - ProgressTelemetry trait and the metric/analysis types it exchanges
//! - HistoryTelemetry, the default in-memory implementation
//! - ScriptedTelemetry, with answers set by the caller

pub mod history;
pub mod scripted;
pub mod traits;

pub use history::{
    ERROR_TOKENS, HistoryTelemetry, count_error_tokens, count_file_changes, extract_iteration_metrics, fingerprint,
    parse_progress_percent,
};
pub use scripted::ScriptedTelemetry;
pub use traits::{
    IterationMetrics, ProgressTelemetry, StallAnalysis, StallCondition, StallConditionType, VelocityAnalysis,
    VelocityTrend,
};
