//! Per-project message bus.
//!
//! One bus exists per project directory while at least one task is joined.
//! Its inbox is watched with `notify` and also rescanned on a fixed
//! interval, so a missed filesystem event only delays delivery. Each bus has
//! a single dispatch task; every ingestion for that bus runs on it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::exclude::ensure_git_exclude;
use super::message::{
    BusEvent, BusMessage, BusParticipant, MessageFile, OutgoingMessage, SUBTASK_RESULT_TYPE, SubtaskResult,
    UNKNOWN_SENDER,
};
use super::scratchpad::{SCRATCHPAD_FILE, newest_first, render_scratchpad};
use crate::config::BusConfig;
use crate::durable::DurableWriter;
use crate::error::{HerdrError, Result};
use crate::id::{filename_timestamp_ms, generate_message_filename};
use crate::util::lock;

const INBOX_DIR: &str = "inbox";

/// Upper bound on waiting for queued scratchpad writes before deleting a bus.
const TEARDOWN_FLUSH: Duration = Duration::from_secs(2);

#[derive(Default)]
struct BusState {
    /// task id -> summary
    participants: BTreeMap<String, String>,
    messages: Vec<BusMessage>,
    /// Inbox filenames already handled, parsed or not
    processed: HashSet<String>,
}

impl BusState {
    fn participant_list(&self) -> Vec<BusParticipant> {
        self.participants
            .iter()
            .map(|(task_id, summary)| BusParticipant {
                task_id: task_id.clone(),
                summary: summary.clone(),
            })
            .collect()
    }
}

struct BusShared {
    project_path: PathBuf,
    bus_dir: PathBuf,
    inbox_dir: PathBuf,
    state: Mutex<BusState>,
}

impl BusShared {
    /// Queue a fresh scratchpad. Called with the state lock held so the last
    /// queued write reflects the latest state.
    fn write_scratchpad(&self, state: &BusState, writer: &DurableWriter, max_messages: usize) {
        let content = render_scratchpad(&state.participant_list(), &state.messages, max_messages, Utc::now());
        writer.write_in_background(self.bus_dir.join(SCRATCHPAD_FILE), content, "bus.scratchpad");
    }
}

enum Dispatch {
    /// Paths reported by the watcher
    Changed(Vec<PathBuf>),
    /// Rescan the inbox; replies with the number of newly ingested messages
    Scan(oneshot::Sender<usize>),
    Shutdown,
}

struct BusHandle {
    shared: Arc<BusShared>,
    watcher: Option<RecommendedWatcher>,
    commands: mpsc::UnboundedSender<Dispatch>,
    task: JoinHandle<()>,
}

/// Registry of per-project buses.
pub struct MessageBus {
    config: BusConfig,
    writer: DurableWriter,
    buses: Mutex<HashMap<PathBuf, BusHandle>>,
    /// Serializes join/leave/shutdown so a bus is never created while the
    /// same directory is being torn down.
    lifecycle: tokio::sync::Mutex<()>,
    events: broadcast::Sender<BusEvent>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("dir_name", &self.config.dir_name)
            .field("active_buses", &lock(&self.buses).len())
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    pub fn new(config: BusConfig, writer: DurableWriter) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            writer,
            buses: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Register `task_id` on the project's bus, creating the bus if needed.
    ///
    /// Creating a bus makes `<project>/<dir_name>/inbox/`, adds the bus
    /// directory to the git exclude file, starts the watcher (falling back to
    /// polling if it cannot be set up) and starts the dispatch task. Joining
    /// again with the same id updates the summary.
    pub async fn join(&self, project_path: &Path, task_id: &str, summary: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let key = bus_key(project_path);

        let existing = lock(&self.buses).get(&key).map(|h| h.shared.clone());
        let shared = match existing {
            Some(shared) => shared,
            None => self.create_bus(&key).await?,
        };

        {
            let mut state = lock(&shared.state);
            state.participants.insert(task_id.to_string(), summary.to_string());
            shared.write_scratchpad(&state, &self.writer, self.config.scratchpad_messages);
        }
        info!("Task {} joined bus at {}", task_id, shared.bus_dir.display());
        Ok(())
    }

    /// Remove `task_id` from the project's bus.
    ///
    /// When the last participant leaves, the watcher and dispatch task are
    /// stopped before the bus directory is deleted. Deletion failures are
    /// logged; the bus is unregistered regardless.
    pub async fn leave(&self, project_path: &Path, task_id: &str) {
        let _guard = self.lifecycle.lock().await;
        let key = bus_key(project_path);

        let handle = {
            let mut buses = lock(&self.buses);
            let Some(handle) = buses.get(&key) else {
                debug!("Leave for {} ignored: no bus at {}", task_id, key.display());
                return;
            };
            let mut state = lock(&handle.shared.state);
            state.participants.remove(task_id);
            if !state.participants.is_empty() {
                handle
                    .shared
                    .write_scratchpad(&state, &self.writer, self.config.scratchpad_messages);
                debug!("Task {} left bus at {}", task_id, key.display());
                return;
            }
            drop(state);
            buses.remove(&key)
        };

        if let Some(handle) = handle {
            info!("Last participant {} left; closing bus at {}", task_id, key.display());
            self.teardown(handle).await;
        }
    }

    /// Up to `max` messages, newest first. Empty for a project with no bus.
    pub fn get_recent_messages(&self, project_path: &Path, max: usize) -> Vec<BusMessage> {
        self.with_state(project_path, |state| {
            newest_first(&state.messages).into_iter().take(max).cloned().collect()
        })
        .unwrap_or_default()
    }

    /// Up to `max` messages that mention `task_id`, newest first
    pub fn messages_mentioning(&self, project_path: &Path, task_id: &str, max: usize) -> Vec<BusMessage> {
        self.with_state(project_path, |state| {
            newest_first(&state.messages)
                .into_iter()
                .filter(|m| m.mentions_task(task_id))
                .take(max)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn participants(&self, project_path: &Path) -> Vec<BusParticipant> {
        self.with_state(project_path, BusState::participant_list)
            .unwrap_or_default()
    }

    pub fn is_active(&self, project_path: &Path) -> bool {
        let key = bus_key(project_path);
        lock(&self.buses).contains_key(&key)
    }

    pub fn active_bus_count(&self) -> usize {
        lock(&self.buses).len()
    }

    /// Receive every ingested message from every bus
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Directory holding the project's bus, whether or not it is active
    pub fn bus_dir(&self, project_path: &Path) -> PathBuf {
        bus_key(project_path).join(&self.config.dir_name)
    }

    /// Rescan the inbox now instead of waiting for the next poll.
    ///
    /// Returns the number of messages ingested by this scan (0 for a project
    /// with no bus).
    pub async fn scan_now(&self, project_path: &Path) -> usize {
        let key = bus_key(project_path);
        let commands = lock(&self.buses).get(&key).map(|h| h.commands.clone());
        let Some(commands) = commands else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if commands.send(Dispatch::Scan(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Drop a message from `from` into the project's inbox.
    ///
    /// The file is written through the durable writer; it is ingested like
    /// any other producer's file. Returns the inbox path.
    pub fn publish(&self, project_path: &Path, from: &str, message: OutgoingMessage) -> Result<PathBuf> {
        let kind = message.kind.clone();
        let path = self.inbox_path(project_path, from, &kind)?;
        self.writer
            .write_json_in_background(&path, &message.into_file(from), "bus.publish");
        Ok(path)
    }

    /// Post a child task's result into the parent's project inbox
    pub fn inject_subtask_result(&self, project_path: &Path, result: &SubtaskResult) -> Result<PathBuf> {
        let path = self.inbox_path(project_path, &result.child_task_id, SUBTASK_RESULT_TYPE)?;
        self.writer.write_json_in_background(&path, result, "bus.subtask_result");
        debug!(
            "Injected subtask #{} result for parent {}",
            result.child_task_number, result.parent_task_id
        );
        Ok(path)
    }

    /// Tear down every bus and delete its directory
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let handles: Vec<BusHandle> = lock(&self.buses).drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.teardown(handle).await;
        }
    }

    fn inbox_path(&self, project_path: &Path, from: &str, kind: &str) -> Result<PathBuf> {
        let key = bus_key(project_path);
        let buses = lock(&self.buses);
        let handle = buses
            .get(&key)
            .ok_or_else(|| HerdrError::Bus(format!("No active bus for {}", key.display())))?;
        Ok(handle.shared.inbox_dir.join(generate_message_filename(from, kind)))
    }

    fn with_state<T>(&self, project_path: &Path, f: impl FnOnce(&BusState) -> T) -> Option<T> {
        let key = bus_key(project_path);
        let shared = lock(&self.buses).get(&key).map(|h| h.shared.clone())?;
        let state = lock(&shared.state);
        Some(f(&state))
    }

    async fn create_bus(&self, key: &Path) -> Result<Arc<BusShared>> {
        let bus_dir = key.join(&self.config.dir_name);
        let inbox_dir = bus_dir.join(INBOX_DIR);
        tokio::fs::create_dir_all(&inbox_dir).await?;

        let project = key.to_path_buf();
        let dir_name = self.config.dir_name.clone();
        match tokio::task::spawn_blocking(move || ensure_git_exclude(&project, &dir_name)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Could not update git exclude for {}: {}", key.display(), e),
            Err(e) => warn!("Git exclude task failed for {}: {}", key.display(), e),
        }

        let shared = Arc::new(BusShared {
            project_path: key.to_path_buf(),
            bus_dir,
            inbox_dir,
            state: Mutex::new(BusState::default()),
        });

        let (commands, rx) = mpsc::unbounded_channel();
        let watcher = if self.config.use_watcher {
            match start_watcher(&shared.inbox_dir, commands.clone()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(
                        "Could not watch {}, falling back to polling: {}",
                        shared.inbox_dir.display(),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let ingestor = Ingestor {
            shared: shared.clone(),
            writer: self.writer.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        };
        let task = tokio::spawn(run_dispatch(ingestor, rx));

        lock(&self.buses).insert(
            key.to_path_buf(),
            BusHandle {
                shared: shared.clone(),
                watcher,
                commands,
                task,
            },
        );
        info!("Created bus at {}", shared.bus_dir.display());
        Ok(shared)
    }

    async fn teardown(&self, handle: BusHandle) {
        let BusHandle {
            shared,
            watcher,
            commands,
            task,
        } = handle;

        drop(watcher);
        let _ = commands.send(Dispatch::Shutdown);
        drop(commands);
        if let Err(e) = task.await {
            warn!("Bus dispatch task for {} ended abnormally: {}", shared.bus_dir.display(), e);
        }

        // A queued scratchpad write landing after the delete would recreate the directory.
        if !self.writer.flush(TEARDOWN_FLUSH).await {
            debug!("Writes still pending while closing {}", shared.bus_dir.display());
        }

        match tokio::fs::remove_dir_all(&shared.bus_dir).await {
            Ok(()) => info!("Removed bus directory {}", shared.bus_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove bus directory {}: {}", shared.bus_dir.display(), e),
        }
    }
}

/// Everything the dispatch task needs to ingest files for one bus
struct Ingestor {
    shared: Arc<BusShared>,
    writer: DurableWriter,
    events: broadcast::Sender<BusEvent>,
    config: BusConfig,
}

impl Ingestor {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    async fn scan(&self) -> usize {
        let dir = self.shared.inbox_dir.to_string_lossy();
        let pattern = format!("{}/*.json", glob::Pattern::escape(&dir));
        let mut paths: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(entries) => entries.filter_map(|e| e.ok()).collect(),
            Err(e) => {
                warn!("Invalid inbox pattern {}: {}", pattern, e);
                return 0;
            }
        };
        paths.sort();

        let mut ingested = 0;
        for path in paths {
            if self.ingest(&path).await {
                ingested += 1;
            }
        }
        ingested
    }

    /// Ingest one inbox file. Returns true if a new message was added.
    async fn ingest(&self, path: &Path) -> bool {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return false;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            return false;
        };
        if lock(&self.shared.state).processed.contains(&file_name) {
            return false;
        }

        let source = self.shared.inbox_dir.join(&file_name);
        let parsed = self.read_message(&source).await;
        let timestamp = message_timestamp(&file_name, &source);

        let message = {
            let mut state = lock(&self.shared.state);
            if !state.processed.insert(file_name.clone()) {
                return false;
            }
            let Some(file) = parsed else {
                debug!("Dropping unreadable bus message {}", source.display());
                return false;
            };
            let summary = state
                .participants
                .get(&file.from)
                .cloned()
                .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
            let message = BusMessage::from_file(file, summary, timestamp, file_name);
            state.messages.push(message.clone());
            self.shared
                .write_scratchpad(&state, &self.writer, self.config.scratchpad_messages);
            message
        };

        debug!(
            "Ingested {} message from {} on {}",
            message.kind,
            message.from,
            self.shared.project_path.display()
        );
        // No receivers is fine
        let _ = self.events.send(BusEvent {
            project_path: self.shared.project_path.clone(),
            message,
        });
        true
    }

    /// Read and parse, retrying while the producer may still be writing.
    async fn read_message(&self, path: &Path) -> Option<MessageFile> {
        let attempts = self.config.read_attempts.max(1);
        let delay = Duration::from_millis(self.config.read_retry_delay_ms);
        for attempt in 1..=attempts {
            match tokio::fs::read_to_string(path).await {
                Ok(content) if content.trim().is_empty() => {
                    debug!("{} is empty (attempt {}/{})", path.display(), attempt, attempts);
                }
                Ok(content) => match MessageFile::parse(&content) {
                    Ok(file) => return Some(file),
                    Err(e) => debug!("{} is not a bus message (attempt {}/{}): {}", path.display(), attempt, attempts, e),
                },
                Err(e) => debug!("Failed to read {} (attempt {}/{}): {}", path.display(), attempt, attempts, e),
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        None
    }
}

async fn run_dispatch(ingestor: Ingestor, mut commands: mpsc::UnboundedReceiver<Dispatch>) {
    let mut poll = tokio::time::interval(ingestor.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Dispatch::Changed(paths)) => {
                    for path in paths {
                        ingestor.ingest(&path).await;
                    }
                }
                Some(Dispatch::Scan(reply)) => {
                    let ingested = ingestor.scan().await;
                    let _ = reply.send(ingested);
                }
                Some(Dispatch::Shutdown) | None => break,
            },
            _ = poll.tick() => {
                ingestor.scan().await;
            }
        }
    }
    debug!("Bus dispatch for {} stopped", ingestor.shared.bus_dir.display());
}

fn start_watcher(inbox_dir: &Path, commands: mpsc::UnboundedSender<Dispatch>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| match res {
        Ok(event) if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) => {
            let _ = commands.send(Dispatch::Changed(event.paths));
        }
        Ok(_) => {}
        Err(e) => warn!("Bus watcher error: {}", e),
    })?;
    watcher.watch(inbox_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Buses are keyed by canonical project path so aliases share one bus.
fn bus_key(project_path: &Path) -> PathBuf {
    std::fs::canonicalize(project_path).unwrap_or_else(|_| project_path.to_path_buf())
}

/// Timestamp from the filename prefix, else the file's mtime, else now
fn message_timestamp(file_name: &str, path: &Path) -> DateTime<Utc> {
    if let Some(ts) = filename_timestamp_ms(file_name)
        .and_then(|ms| i64::try_from(ms).ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
    {
        return ts;
    }
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskSnapshot, TaskStatus};
    use crate::durable::write_atomic;
    use tempfile::TempDir;

    const FLUSH: Duration = Duration::from_secs(5);

    fn test_config() -> BusConfig {
        BusConfig {
            poll_interval_ms: 60_000,
            read_retry_delay_ms: 10,
            ..Default::default()
        }
    }

    fn new_bus(config: BusConfig) -> (MessageBus, DurableWriter) {
        let writer = DurableWriter::from_current().unwrap();
        (MessageBus::new(config, writer.clone()), writer)
    }

    fn drop_in_inbox(bus: &MessageBus, project: &Path, name: &str, content: &str) {
        let path = bus.bus_dir(project).join(INBOX_DIR).join(name);
        write_atomic(&path, content.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_join_creates_bus_directory() {
        let temp = TempDir::new().unwrap();
        let (bus, writer) = new_bus(test_config());

        bus.join(temp.path(), "t1", "Refactor parser").await.unwrap();
        writer.flush(FLUSH).await;

        let bus_dir = temp.path().join(".agent-bus");
        assert!(bus_dir.join("inbox").is_dir());
        assert!(bus_dir.join(SCRATCHPAD_FILE).is_file());
        assert!(bus.is_active(temp.path()));
        assert_eq!(bus.participants(temp.path()).len(), 1);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_last_leave_deletes_directory() {
        let temp = TempDir::new().unwrap();
        let (bus, _writer) = new_bus(test_config());

        bus.join(temp.path(), "t1", "one").await.unwrap();
        bus.join(temp.path(), "t2", "two").await.unwrap();

        bus.leave(temp.path(), "t1").await;
        assert!(bus.is_active(temp.path()));
        let remaining = bus.participants(temp.path());
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task_id, "t2");

        bus.leave(temp.path(), "t2").await;
        assert!(!bus.is_active(temp.path()));
        assert!(!temp.path().join(".agent-bus").exists());
        assert!(bus.get_recent_messages(temp.path(), 10).is_empty());
    }

    #[tokio::test]
    async fn test_leave_unknown_project_is_noop() {
        let temp = TempDir::new().unwrap();
        let (bus, _writer) = new_bus(test_config());
        bus.leave(temp.path(), "ghost").await;
        assert_eq!(bus.active_bus_count(), 0);
    }

    #[tokio::test]
    async fn test_message_resolves_sender_summary_and_notifies() {
        let temp = TempDir::new().unwrap();
        let (bus, _writer) = new_bus(test_config());
        let mut events = bus.subscribe();

        bus.join(temp.path(), "t1", "Refactor parser").await.unwrap();
        drop_in_inbox(
            &bus,
            temp.path(),
            "1000_t1_status.json",
            r#"{"from": "t1", "type": "status", "topic": "progress", "body": "halfway"}"#,
        );
        bus.scan_now(temp.path()).await;

        let event = tokio::time::timeout(FLUSH, events.recv()).await.unwrap().unwrap();
        assert_eq!(event.message.from_summary, "Refactor parser");
        assert_eq!(event.message.topic, "progress");
        assert_eq!(event.message.source_file, "1000_t1_status.json");

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_sender_is_unknown() {
        let temp = TempDir::new().unwrap();
        let (bus, _writer) = new_bus(test_config());

        bus.join(temp.path(), "t1", "one").await.unwrap();
        drop_in_inbox(&bus, temp.path(), "1000_ghost_status.json", r#"{"from": "ghost", "type": "status"}"#);
        bus.scan_now(temp.path()).await;

        let messages = bus.get_recent_messages(temp.path(), 10);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from_summary, UNKNOWN_SENDER);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_file_is_ingested_once() {
        let temp = TempDir::new().unwrap();
        let (bus, _writer) = new_bus(test_config());

        bus.join(temp.path(), "t1", "one").await.unwrap();
        drop_in_inbox(&bus, temp.path(), "1000_t1_note.json", r#"{"from": "t1", "type": "note"}"#);

        bus.scan_now(temp.path()).await;
        bus.scan_now(temp.path()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.scan_now(temp.path()).await;

        assert_eq!(bus.get_recent_messages(temp.path(), 10).len(), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_and_poll_delivery_ingest_once() {
        let temp = TempDir::new().unwrap();
        let (bus, _writer) = new_bus(test_config());

        bus.join(temp.path(), "t1", "one").await.unwrap();
        drop_in_inbox(&bus, temp.path(), "1000_t1_note.json", r#"{"from": "t1", "type": "note"}"#);
        let path = bus.bus_dir(temp.path()).join(INBOX_DIR).join("1000_t1_note.json");
        let commands = lock(&bus.buses)
            .get(&bus_key(temp.path()))
            .map(|h| h.commands.clone())
            .unwrap();

        // Same file reported by a watcher event, then a scan, then again
        commands.send(Dispatch::Changed(vec![path.clone()])).unwrap();
        bus.scan_now(temp.path()).await;
        commands.send(Dispatch::Changed(vec![path])).unwrap();
        assert_eq!(bus.scan_now(temp.path()).await, 0);

        assert_eq!(bus.get_recent_messages(temp.path(), 10).len(), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_file_is_dropped_and_not_retried() {
        let temp = TempDir::new().unwrap();
        let (bus, _writer) = new_bus(test_config());

        bus.join(temp.path(), "t1", "one").await.unwrap();
        drop_in_inbox(&bus, temp.path(), "1000_t1_bad.json", "{ not json");
        drop_in_inbox(&bus, temp.path(), "1001_t1_empty.json", "");

        bus.scan_now(temp.path()).await;
        assert!(bus.get_recent_messages(temp.path(), 10).is_empty());
        assert_eq!(bus.scan_now(temp.path()).await, 0);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_recent_messages_newest_first() {
        let temp = TempDir::new().unwrap();
        let (bus, _writer) = new_bus(test_config());

        bus.join(temp.path(), "t1", "one").await.unwrap();
        for (i, ts) in [3000u64, 1000, 2000].iter().enumerate() {
            drop_in_inbox(
                &bus,
                temp.path(),
                &format!("{}_t1_status.json", ts),
                &format!(r#"{{"from": "t1", "type": "status", "topic": "m{}"}}"#, i),
            );
        }
        bus.scan_now(temp.path()).await;

        let topics: Vec<String> = bus
            .get_recent_messages(temp.path(), 2)
            .into_iter()
            .map(|m| m.topic)
            .collect();
        assert_eq!(topics, vec!["m0".to_string(), "m2".to_string()]);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_claim_updates_scratchpad() {
        let temp = TempDir::new().unwrap();
        let (bus, writer) = new_bus(test_config());

        bus.join(temp.path(), "t1", "Refactor parser").await.unwrap();
        bus.join(temp.path(), "t2", "Write docs").await.unwrap();
        bus.publish(
            temp.path(),
            "t1",
            OutgoingMessage::claim("src/parser.rs", "Taking the parser").mentioning("t2"),
        )
        .unwrap();
        writer.flush(FLUSH).await;
        bus.scan_now(temp.path()).await;
        writer.flush(FLUSH).await;

        let mentioning = bus.messages_mentioning(temp.path(), "t2", 10);
        assert_eq!(mentioning.len(), 1);
        assert!(mentioning[0].is_claim());

        let scratchpad = std::fs::read_to_string(temp.path().join(".agent-bus").join(SCRATCHPAD_FILE)).unwrap();
        assert!(scratchpad.contains("| `t1` | Refactor parser |"));
        assert!(scratchpad.contains("| `t2` | Write docs |"));
        assert!(scratchpad.contains("### `t1` (Refactor parser)"));
        assert!(scratchpad.contains("- src/parser.rs"));

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_without_bus_fails() {
        let temp = TempDir::new().unwrap();
        let (bus, _writer) = new_bus(test_config());
        let result = bus.publish(temp.path(), "t1", OutgoingMessage::new("status", "x", "y"));
        assert!(matches!(result, Err(HerdrError::Bus(_))));
    }

    #[tokio::test]
    async fn test_inject_subtask_result() {
        let temp = TempDir::new().unwrap();
        let (bus, writer) = new_bus(test_config());

        bus.join(temp.path(), "parent", "Coordinate").await.unwrap();
        let child = TaskSnapshot::new("child-2", "Port module")
            .numbered(2)
            .finished(TaskStatus::Completed, "Module ported");
        let path = bus
            .inject_subtask_result(temp.path(), &SubtaskResult::new("parent", &child, None))
            .unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with("_child-2_subtask_result.json"));

        writer.flush(FLUSH).await;
        bus.scan_now(temp.path()).await;

        let messages = bus.get_recent_messages(temp.path(), 10);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, SUBTASK_RESULT_TYPE);
        assert_eq!(messages[0].from_summary, UNKNOWN_SENDER);
        assert!(messages[0].body.contains("Module ported"));

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_poll_only_delivery() {
        let temp = TempDir::new().unwrap();
        let config = BusConfig {
            use_watcher: false,
            poll_interval_ms: 50,
            ..test_config()
        };
        let (bus, _writer) = new_bus(config);

        bus.join(temp.path(), "t1", "one").await.unwrap();
        drop_in_inbox(&bus, temp.path(), "1000_t1_status.json", r#"{"from": "t1", "type": "status"}"#);

        let deadline = tokio::time::Instant::now() + FLUSH;
        while bus.get_recent_messages(temp.path(), 10).is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "poll never delivered the message");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_adds_git_exclude_entry() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".git")).unwrap();
        let (bus, _writer) = new_bus(test_config());

        bus.join(temp.path(), "t1", "one").await.unwrap();

        let exclude = std::fs::read_to_string(temp.path().join(".git/info/exclude")).unwrap();
        assert!(exclude.contains(".agent-bus/"));

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_removes_all_buses() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let (bus, _writer) = new_bus(test_config());

        bus.join(a.path(), "t1", "one").await.unwrap();
        bus.join(b.path(), "t2", "two").await.unwrap();
        assert_eq!(bus.active_bus_count(), 2);

        bus.shutdown().await;
        assert_eq!(bus.active_bus_count(), 0);
        assert!(!a.path().join(".agent-bus").exists());
        assert!(!b.path().join(".agent-bus").exists());
    }
}
