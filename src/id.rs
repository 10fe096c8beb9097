//! ID and filename generation utilities for Herdr
//!
//! Bus inbox files are named `{unix_ms}_{task_id}_{kind}.json`. The name is
//! opaque to consumers; it only has to be unique per producer.

use std::sync::atomic::{AtomicU64, Ordering};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Make a task id safe to embed in a filename
///
/// Anything outside `[A-Za-z0-9._-]` becomes `-`.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() { "unknown".to_string() } else { cleaned }
}

static LAST_FILENAME_MS: AtomicU64 = AtomicU64::new(0);

/// Millisecond timestamp that never repeats within this process
fn unique_ms() -> u64 {
    let now = now_ms();
    let prev = LAST_FILENAME_MS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
        .unwrap_or(now);
    now.max(prev + 1)
}

/// Generate an inbox filename for a message produced by this process
///
/// Format: `{timestamp_ms}_{task_id}_{kind}.json`
/// Example: `1738300800123_task-7_subtask_result.json`
pub fn generate_message_filename(task_id: &str, kind: &str) -> String {
    message_filename_at(unique_ms(), task_id, kind)
}

/// Leading millisecond timestamp of an inbox filename, if it has one
pub fn filename_timestamp_ms(filename: &str) -> Option<u64> {
    filename.split('_').next()?.parse().ok()
}

/// Same as [`generate_message_filename`] with an explicit timestamp
pub fn message_filename_at(timestamp_ms: u64, task_id: &str, kind: &str) -> String {
    format!(
        "{}_{}_{}.json",
        timestamp_ms,
        sanitize_component(task_id),
        sanitize_component(kind)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_returns_reasonable_timestamp() {
        let ts = now_ms();
        assert!(ts > 1577836800000); // 2020-01-01
        assert!(ts < 4102444800000); // 2100-01-01
    }

    #[test]
    fn test_message_filename_format() {
        let name = message_filename_at(1738300800123, "task-7", "subtask_result");
        assert_eq!(name, "1738300800123_task-7_subtask_result.json");
    }

    #[test]
    fn test_generate_message_filename_has_timestamp_prefix() {
        let name = generate_message_filename("abc", "status");
        let prefix = name.split('_').next().unwrap();
        assert!(prefix.chars().all(|c| c.is_ascii_digit()));
        assert!(name.ends_with("_abc_status.json"));
    }

    #[test]
    fn test_generated_filenames_are_unique() {
        let names: std::collections::HashSet<String> =
            (0..200).map(|_| generate_message_filename("t1", "status")).collect();
        assert_eq!(names.len(), 200);
    }

    #[test]
    fn test_filename_timestamp() {
        assert_eq!(filename_timestamp_ms("1738300800123_t_status.json"), Some(1738300800123));
        assert_eq!(filename_timestamp_ms("notes.json"), None);
    }

    #[test]
    fn test_sanitize_strips_path_separators() {
        assert_eq!(sanitize_component("../evil/id"), "..-evil-id");
        assert_eq!(sanitize_component("a b:c"), "a-b-c");
    }

    #[test]
    fn test_sanitize_empty() {
        assert_eq!(sanitize_component(""), "unknown");
    }
}
