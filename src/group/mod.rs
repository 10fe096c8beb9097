//! Task groups tracked to joint completion

pub mod aggregator;
pub mod state;

pub use aggregator::{GroupAggregator, GroupEvent, format_duration, generate_aggregate_summary};
pub use state::{TaskGroupEntry, TaskGroupState};
