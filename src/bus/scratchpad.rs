//! Markdown scratchpad rendered from a bus's state.
//!
//! The scratchpad is a derived artifact: it is regenerated in full from the
//! participant map and message log whenever either changes, and never read
//! back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::message::{BusMessage, BusParticipant};

/// File name of the scratchpad inside the bus directory
pub const SCRATCHPAD_FILE: &str = "_scratchpad.md";

/// Render the scratchpad.
///
/// Messages are shown newest first, at most `max_messages` of them. Claims
/// are collected from the whole log and grouped by sender.
pub fn render_scratchpad(
    participants: &[BusParticipant],
    messages: &[BusMessage],
    max_messages: usize,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    out.push_str("# Agent Bus Scratchpad\n\n");
    out.push_str(&format!("_Last updated: {}_\n\n", now.to_rfc3339()));

    out.push_str("## Active Sibling Tasks\n\n");
    if participants.is_empty() {
        out.push_str("_No active tasks._\n\n");
    } else {
        out.push_str("| Task | Summary |\n");
        out.push_str("|------|---------|\n");
        for p in participants {
            out.push_str(&format!("| `{}` | {} |\n", p.task_id, table_cell(&p.summary)));
        }
        out.push('\n');
    }

    let sorted = newest_first(messages);

    out.push_str("## Recent Messages\n\n");
    if sorted.is_empty() {
        out.push_str("_No messages yet._\n\n");
    }
    for msg in sorted.iter().take(max_messages) {
        let topic = if msg.topic.is_empty() { "(no topic)" } else { msg.topic.as_str() };
        out.push_str(&format!("### [{}] {}\n\n", msg.kind, topic));
        out.push_str(&format!("- **From:** `{}` ({})\n", msg.from, msg.from_summary));
        out.push_str(&format!("- **At:** {}\n", msg.timestamp.to_rfc3339()));
        if !msg.mentions.is_empty() {
            let mentions: Vec<String> = msg.mentions.iter().map(|m| format!("`{}`", m)).collect();
            out.push_str(&format!("- **Mentions:** {}\n", mentions.join(", ")));
        }
        if !msg.body.is_empty() {
            out.push('\n');
            out.push_str(msg.body.trim_end());
            out.push('\n');
        }
        out.push('\n');
    }

    let mut claims: BTreeMap<&str, Vec<&BusMessage>> = BTreeMap::new();
    for msg in sorted.iter().filter(|m| m.is_claim()) {
        claims.entry(msg.from.as_str()).or_default().push(msg);
    }

    out.push_str("## Claims\n\n");
    if claims.is_empty() {
        out.push_str("_No claims._\n");
    }
    for (sender, entries) in &claims {
        let summary = entries.first().map(|m| m.from_summary.as_str()).unwrap_or_default();
        out.push_str(&format!("### `{}` ({})\n\n", sender, summary));
        for claim in entries {
            let what = if claim.topic.is_empty() { &claim.body } else { &claim.topic };
            out.push_str(&format!("- {}\n", single_line(what)));
        }
        out.push('\n');
    }

    out
}

/// Messages ordered newest first; ties broken by filename, descending
pub fn newest_first(messages: &[BusMessage]) -> Vec<&BusMessage> {
    let mut sorted: Vec<&BusMessage> = messages.iter().collect();
    sorted.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.source_file.cmp(&a.source_file))
    });
    sorted
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn table_cell(text: &str) -> String {
    single_line(text).replace('|', "\\|")
}
