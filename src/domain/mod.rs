//! Domain types shared by the coordination engines
//!
//! - TaskSnapshot: read-only view of a task handed in by the runner
//! - TaskStatus: runner lifecycle status

pub mod task;

pub use task::{TaskSnapshot, TaskStatus};
