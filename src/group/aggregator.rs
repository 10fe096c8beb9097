//! Group aggregator
//!
//! Tracks tasks that share a group id and fires one notification, with an
//! aggregate report, when every registered task has finished. The group map
//! sits behind a coarse lock; each group's state has its own lock so the
//! completion count and the fire-once check change together.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::sync::broadcast;

use super::state::{TaskGroupEntry, TaskGroupState};
use crate::config::GroupConfig;
use crate::domain::TaskSnapshot;
use crate::durable::DurableWriter;
use crate::error::{HerdrError, Result};
use crate::id::sanitize_component;
use crate::util::lock;

/// Notification sent by [`GroupAggregator`]
#[derive(Debug, Clone)]
pub enum GroupEvent {
    /// Every task in the group has finished
    Completed { state: TaskGroupState, summary: String },
}

pub struct GroupAggregator {
    config: GroupConfig,
    writer: Option<DurableWriter>,
    groups: Mutex<HashMap<String, Arc<Mutex<TaskGroupState>>>>,
    events: broadcast::Sender<GroupEvent>,
}

impl std::fmt::Debug for GroupAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupAggregator")
            .field("groups", &lock(&self.groups).len())
            .finish_non_exhaustive()
    }
}

impl GroupAggregator {
    /// Reports are written only when both a writer and `report_dir` are set.
    pub fn new(config: GroupConfig, writer: Option<DurableWriter>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            writer,
            groups: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }

    /// Add a task to its group. No-op without a group id; idempotent per task id.
    pub fn register(&self, task: &TaskSnapshot) {
        let Some(group_id) = task.group_id.as_deref() else {
            return;
        };

        let group = {
            let mut groups = lock(&self.groups);
            groups
                .entry(group_id.to_string())
                .or_insert_with(|| {
                    let name = task.group_name.clone().unwrap_or_else(|| group_id.to_string());
                    debug!("Created group {} ({})", group_id, name);
                    Arc::new(Mutex::new(TaskGroupState::new(group_id, name)))
                })
                .clone()
        };

        let mut state = lock(&group);
        if state.entry(&task.id).is_some() {
            return;
        }
        state.entries.push(TaskGroupEntry::from_snapshot(task));
        state.total_count += 1;
        debug!(
            "Registered task {} in group {} ({} tasks)",
            task.id, group_id, state.total_count
        );
    }

    /// Record a finished task.
    ///
    /// Returns true if this call completed the group. Unknown groups and
    /// tasks, non-terminal statuses and repeat completions are ignored.
    pub fn on_completed(&self, task: &TaskSnapshot) -> bool {
        let Some(group_id) = task.group_id.as_deref() else {
            return false;
        };
        if !task.status.is_terminal() {
            debug!("Ignoring completion of {} with status {}", task.id, task.status);
            return false;
        }
        let Some(group) = lock(&self.groups).get(group_id).cloned() else {
            debug!("Completion for unknown group {}", group_id);
            return false;
        };

        let snapshot = {
            let mut state = lock(&group);
            let Some(entry) = state.entry_mut(&task.id) else {
                debug!("Task {} is not registered in group {}", task.id, group_id);
                return false;
            };
            if entry.finished {
                return false;
            }
            entry.apply_final(task);

            if task.status.is_success() {
                state.completed_count += 1;
            } else {
                state.failed_count += 1;
            }

            if state.completion_fired || !state.is_complete() {
                return false;
            }
            state.completion_fired = true;
            state.clone()
        };

        let summary = generate_aggregate_summary(&snapshot);
        info!(
            "Group {} complete: {} succeeded, {} failed of {}",
            snapshot.group_id, snapshot.completed_count, snapshot.failed_count, snapshot.total_count
        );
        self.persist_report(&snapshot.group_id, &summary);
        // No receivers is fine
        let _ = self.events.send(GroupEvent::Completed {
            state: snapshot,
            summary,
        });
        true
    }

    /// Copy of a group's current state
    pub fn group(&self, group_id: &str) -> Option<TaskGroupState> {
        let group = lock(&self.groups).get(group_id).cloned()?;
        let state = lock(&group).clone();
        Some(state)
    }

    /// Aggregate report for a group in its current state, finished or not
    pub fn summary(&self, group_id: &str) -> Result<String> {
        let state = self
            .group(group_id)
            .ok_or_else(|| HerdrError::Group(format!("unknown group {}", group_id)))?;
        Ok(generate_aggregate_summary(&state))
    }

    /// Forget a group, returning its last state
    pub fn remove_group(&self, group_id: &str) -> Option<TaskGroupState> {
        let group = lock(&self.groups).remove(group_id)?;
        let state = lock(&group).clone();
        Some(state)
    }

    pub fn group_count(&self) -> usize {
        lock(&self.groups).len()
    }

    /// Where the report for `group_id` is written, if reports are enabled
    pub fn report_path(&self, group_id: &str) -> Option<PathBuf> {
        self.writer.as_ref()?;
        let dir = self.config.report_dir.as_ref()?;
        Some(dir.join(format!("{}.md", sanitize_component(group_id))))
    }

    fn persist_report(&self, group_id: &str, summary: &str) {
        if let (Some(writer), Some(path)) = (&self.writer, self.report_path(group_id)) {
            writer.write_in_background(path, summary.as_bytes().to_vec(), "group.report");
        }
    }
}

/// Deterministic markdown report for a group
pub fn generate_aggregate_summary(state: &TaskGroupState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Task Group: {}\n", state.group_name);
    let _ = writeln!(out, "- **Group ID:** `{}`", state.group_id);
    let _ = writeln!(
        out,
        "- **Tasks:** {} total, {} completed, {} failed",
        state.total_count, state.completed_count, state.failed_count
    );
    let _ = writeln!(out, "- **Started:** {}", state.started_at.to_rfc3339());
    let elapsed = state
        .elapsed()
        .map(format_duration)
        .unwrap_or_else(|| "n/a".to_string());
    let _ = writeln!(out, "- **Elapsed:** {}\n", elapsed);

    for entry in &state.entries {
        let _ = writeln!(out, "## Task {}: {}\n", entry.task_number, entry.description);
        let _ = writeln!(out, "- **Status:** {}", entry.status);
        let duration = entry.duration().map(format_duration).unwrap_or_else(|| "n/a".to_string());
        let _ = writeln!(out, "- **Duration:** {}", duration);
        let _ = writeln!(
            out,
            "- **Tokens:** {} in / {} out / {} total\n",
            entry.input_tokens, entry.output_tokens, entry.total_tokens
        );
        if let Some(summary) = entry.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            let _ = writeln!(out, "{}\n", summary.trim_end());
        }
        if !entry.recommendations.is_empty() {
            let _ = writeln!(out, "**Recommendations:**\n");
            for rec in &entry.recommendations {
                let _ = writeln!(out, "- {}", rec);
            }
            out.push('\n');
        }
    }

    let combined: Vec<(u32, &String)> = state
        .entries
        .iter()
        .flat_map(|e| e.recommendations.iter().map(move |r| (e.task_number, r)))
        .collect();
    if !combined.is_empty() {
        let _ = writeln!(out, "## Combined Recommendations\n");
        for (number, rec) in combined {
            let _ = writeln!(out, "- [Task {}] {}", number, rec);
        }
    }

    out
}

/// "1h 2m 3s", "2m 5s" or "45s"; negative spans clamp to zero
pub fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
