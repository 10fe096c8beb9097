//! Herdr - coordination core for fleets of agent tasks
//!
//! Herdr decides when a running agent task should stop, tracks token spend,
//! lets sibling tasks in one project talk through a file-based message bus,
//! and reports when a group of tasks has finished. Every derived artifact is
//! persisted through [`durable::DurableWriter`].

pub mod budget;
pub mod bus;
pub mod config;
pub mod domain;
pub mod durable;
pub mod error;
pub mod group;
pub mod id;
pub mod logging;
pub mod telemetry;
pub mod termination;

mod util;

pub use error::{HerdrError, Result};
