//! Crash-safe persistence for derived artifacts (scratchpads, reports).

pub mod writer;

pub use writer::{DurableWriter, ErrorCallback, write_atomic};
