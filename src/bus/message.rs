//! Bus message records.
//!
//! Producers drop one JSON object per file into `<project>/.agent-bus/inbox/`.
//! Only `from` and `type` are required; `topic`, `body` and `mentions`
//! default to empty. Unknown fields are ignored, so richer records such as
//! [`SubtaskResult`] are read as ordinary messages.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::TaskSnapshot;

/// Message type whose entries are grouped by sender in the scratchpad.
pub const CLAIM_TYPE: &str = "claim";

/// Message type used for injected child-task results.
pub const SUBTASK_RESULT_TYPE: &str = "subtask_result";

/// Summary shown for senders that are not registered on the bus.
pub const UNKNOWN_SENDER: &str = "Unknown";

/// On-disk form of a bus message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFile {
    pub from: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub mentions: Vec<String>,
}

impl MessageFile {
    pub fn parse(content: &str) -> serde_json::Result<Self> {
        serde_json::from_str(content)
    }
}

/// A message after ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub from: String,
    /// Sender's summary at ingestion time
    pub from_summary: String,
    pub kind: String,
    pub topic: String,
    pub body: String,
    pub mentions: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Inbox filename; unique within a bus
    pub source_file: String,
}

impl BusMessage {
    pub fn from_file(
        file: MessageFile,
        from_summary: impl Into<String>,
        timestamp: DateTime<Utc>,
        source_file: impl Into<String>,
    ) -> Self {
        Self {
            from: file.from,
            from_summary: from_summary.into(),
            kind: file.kind,
            topic: file.topic,
            body: file.body,
            mentions: file.mentions,
            timestamp,
            source_file: source_file.into(),
        }
    }

    pub fn is_claim(&self) -> bool {
        self.kind.eq_ignore_ascii_case(CLAIM_TYPE)
    }

    pub fn mentions_task(&self, task_id: &str) -> bool {
        self.mentions.iter().any(|m| m == task_id)
    }
}

/// A message this process publishes on a sender's behalf
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub kind: String,
    pub topic: String,
    pub body: String,
    pub mentions: Vec<String>,
}

impl OutgoingMessage {
    pub fn new(kind: impl Into<String>, topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            topic: topic.into(),
            body: body.into(),
            mentions: Vec::new(),
        }
    }

    /// Announce ownership of a piece of work
    pub fn claim(topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(CLAIM_TYPE, topic, body)
    }

    pub fn mentioning(mut self, task_id: impl Into<String>) -> Self {
        self.mentions.push(task_id.into());
        self
    }

    pub fn into_file(self, from: &str) -> MessageFile {
        MessageFile {
            from: from.to_string(),
            kind: self.kind,
            topic: self.topic,
            body: self.body,
            mentions: self.mentions,
        }
    }
}

/// Lines added/removed in one file by a child task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub file: String,
    pub added: u32,
    pub removed: u32,
}

/// Result record a finished child task posts for its parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub from: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: String,
    pub parent_task_id: String,
    pub child_task_id: String,
    pub child_task_number: u32,
    pub child_description: String,
    pub status: String,
    pub summary: String,
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_changes: Option<Vec<FileChange>>,
    pub body: String,
}

impl SubtaskResult {
    /// Build the result record for a finished child task
    pub fn new(parent_task_id: impl Into<String>, child: &TaskSnapshot, file_changes: Option<Vec<FileChange>>) -> Self {
        let summary = child.summary.clone().unwrap_or_default();
        let mut body = format!(
            "Subtask #{} ({}) finished with status {}.",
            child.task_number, child.description, child.status
        );
        if !summary.is_empty() {
            body.push_str("\n\n");
            body.push_str(&summary);
        }
        if let Some(changes) = &file_changes {
            body.push_str(&format!("\n\nFiles changed: {}", changes.len()));
        }
        Self {
            from: child.id.clone(),
            kind: SUBTASK_RESULT_TYPE.to_string(),
            topic: format!("Subtask #{} result", child.task_number),
            parent_task_id: parent_task_id.into(),
            child_task_id: child.id.clone(),
            child_task_number: child.task_number,
            child_description: child.description.clone(),
            status: child.status.to_string(),
            summary,
            recommendations: child.recommendations.clone(),
            file_changes,
            body,
        }
    }
}

/// A participant registered on a bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusParticipant {
    pub task_id: String,
    pub summary: String,
}

/// Delivered to subscribers after a message is ingested
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub project_path: PathBuf,
    pub message: BusMessage,
}
