//! File-based message bus shared by sibling tasks in one project
//!
//! This module provides:
//! - Message records (inbox files, ingested messages, subtask results)
//! - MessageBus, which owns one bus per project directory
//! - The markdown scratchpad rendered from each bus
//! - Git exclude handling for the bus directory

pub mod exclude;
pub mod manager;
pub mod message;
pub mod scratchpad;

pub use exclude::ensure_git_exclude;
pub use manager::MessageBus;
pub use message::{
    BusEvent, BusMessage, BusParticipant, CLAIM_TYPE, FileChange, MessageFile, OutgoingMessage, SUBTASK_RESULT_TYPE,
    SubtaskResult, UNKNOWN_SENDER,
};
pub use scratchpad::{SCRATCHPAD_FILE, render_scratchpad};
