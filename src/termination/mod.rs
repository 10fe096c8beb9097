//! Termination decisions for running tasks
//!
//! This module provides:
//! - Check and decision types
//! - The individual checks (stall, velocity, budget, iteration limit, error patterns)
//! - TerminationEngine, which runs the checks and applies the decision policy

pub mod checks;
pub mod engine;
pub mod types;

pub use engine::TerminationEngine;
pub use types::{
    CheckKind, Severity, TerminationCheck, TerminationDecision, TerminationReason, TerminationStatistics,
};
