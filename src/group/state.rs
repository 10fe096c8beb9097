//! Task group bookkeeping types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{TaskSnapshot, TaskStatus};

/// One task's record within a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroupEntry {
    pub task_id: String,
    pub task_number: u32,
    pub description: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub recommendations: Vec<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Set once the completion has been counted
    #[serde(default)]
    pub finished: bool,
}

impl TaskGroupEntry {
    /// Entry as captured at registration
    pub fn from_snapshot(task: &TaskSnapshot) -> Self {
        Self {
            task_id: task.id.clone(),
            task_number: task.task_number,
            description: task.description.clone(),
            status: task.status,
            started_at: task.started_at,
            ended_at: task.ended_at,
            summary: task.summary.clone(),
            recommendations: task.recommendations.clone(),
            input_tokens: task.input_tokens,
            output_tokens: task.output_tokens,
            total_tokens: task.total_tokens,
            finished: false,
        }
    }

    /// Patch the terminal fields from the final snapshot
    pub fn apply_final(&mut self, task: &TaskSnapshot) {
        self.status = task.status;
        self.ended_at = task.ended_at.or_else(|| Some(Utc::now()));
        if task.started_at.is_some() {
            self.started_at = task.started_at;
        }
        self.summary = task.summary.clone();
        self.recommendations = task.recommendations.clone();
        self.input_tokens = task.input_tokens;
        self.output_tokens = task.output_tokens;
        self.total_tokens = task.total_tokens;
        self.finished = true;
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

/// A batch of tasks tracked to joint completion.
///
/// `completed_count + failed_count <= total_count`; equality marks completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroupState {
    pub group_id: String,
    pub group_name: String,
    pub started_at: DateTime<Utc>,
    pub total_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    /// In registration order
    pub entries: Vec<TaskGroupEntry>,
    /// The completion notification has been sent
    #[serde(default)]
    pub completion_fired: bool,
}

impl TaskGroupState {
    pub fn new(group_id: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            group_name: group_name.into(),
            started_at: Utc::now(),
            total_count: 0,
            completed_count: 0,
            failed_count: 0,
            entries: Vec::new(),
            completion_fired: false,
        }
    }

    pub fn finished_count(&self) -> u32 {
        self.completed_count + self.failed_count
    }

    pub fn is_complete(&self) -> bool {
        self.total_count > 0 && self.finished_count() == self.total_count
    }

    pub fn entry(&self, task_id: &str) -> Option<&TaskGroupEntry> {
        self.entries.iter().find(|e| e.task_id == task_id)
    }

    pub fn entry_mut(&mut self, task_id: &str) -> Option<&mut TaskGroupEntry> {
        self.entries.iter_mut().find(|e| e.task_id == task_id)
    }

    /// Latest task end time minus group start
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let last_end = self.entries.iter().filter_map(|e| e.ended_at).max()?;
        Some(last_end - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_apply_final() {
        let task = TaskSnapshot::new("t1", "desc").numbered(1);
        let mut entry = TaskGroupEntry::from_snapshot(&task);
        assert!(!entry.finished);

        let done = task.with_tokens(100, 50).finished(TaskStatus::Completed, "ok");
        entry.apply_final(&done);
        assert!(entry.finished);
        assert_eq!(entry.status, TaskStatus::Completed);
        assert_eq!(entry.total_tokens, 150);
        assert_eq!(entry.summary.as_deref(), Some("ok"));
        assert!(entry.duration().is_some());
    }

    #[test]
    fn test_state_completion() {
        let mut state = TaskGroupState::new("g", "Group");
        assert!(!state.is_complete());
        state.total_count = 2;
        state.completed_count = 1;
        assert!(!state.is_complete());
        state.failed_count = 1;
        assert!(state.is_complete());
    }

    #[test]
    fn test_elapsed_needs_a_finished_task() {
        let mut state = TaskGroupState::new("g", "Group");
        state.entries.push(TaskGroupEntry::from_snapshot(&TaskSnapshot::new("t1", "d")));
        assert!(state.elapsed().is_none());
    }
}
