//! Read-only view of a task owned by the surrounding task runner.
//!
//! The runner hands a fresh [`TaskSnapshot`] to every coordination call.
//! Nothing in this crate mutates the runner's task; engines copy the fields
//! they need.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task as reported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to start
    Pending,
    /// Executing iterations
    Running,
    /// Suspended by the user (resumable)
    Paused,
    /// Finished successfully
    Completed,
    /// Finished with an error or was terminated
    Failed,
    /// Abandoned by the user
    Cancelled,
}

impl TaskStatus {
    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Check if a terminal status counts as success for group accounting
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time copy of a task's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    /// Iteration currently being evaluated (1-based)
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub description: String,
    /// Sequence number within the runner (used as "Task N" in reports)
    pub task_number: u32,
    /// Final summary, supplied when the task finishes
    pub summary: Option<String>,
    /// Follow-up recommendations, supplied when the task finishes
    pub recommendations: Vec<String>,
}

impl TaskSnapshot {
    /// Create a running snapshot with no group and zeroed counters
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            current_iteration: 0,
            max_iterations: 0,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            group_id: None,
            group_name: None,
            status: TaskStatus::Running,
            started_at: Some(Utc::now()),
            ended_at: None,
            description: description.into(),
            task_number: 0,
            summary: None,
            recommendations: Vec::new(),
        }
    }

    /// Place the task in a group
    pub fn in_group(mut self, group_id: impl Into<String>, group_name: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self.group_name = Some(group_name.into());
        self
    }

    /// Set the iteration counters
    pub fn at_iteration(mut self, current: u32, max: u32) -> Self {
        self.current_iteration = current;
        self.max_iterations = max;
        self
    }

    /// Set cumulative token counts; total is input + output
    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self.total_tokens = input + output;
        self
    }

    /// Set the runner sequence number
    pub fn numbered(mut self, task_number: u32) -> Self {
        self.task_number = task_number;
        self
    }

    /// Mark the task finished with a summary
    pub fn finished(mut self, status: TaskStatus, summary: impl Into<String>) -> Self {
        self.status = status;
        self.summary = Some(summary.into());
        self.ended_at = Some(Utc::now());
        self
    }

    /// Attach recommendations
    pub fn with_recommendations(mut self, recommendations: Vec<String>) -> Self {
        self.recommendations = recommendations;
        self
    }
}
