//! Background atomic file writes.
//!
//! Each destination path gets its own serial queue drained by one tokio task,
//! so writes to the same path land in the order they were issued while
//! distinct paths never wait on each other. Content goes to a temp file in
//! the destination directory and is renamed over the target, so readers see
//! either the old or the new file, never a torn one.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::error::{HerdrError, Result};
use crate::util::lock;

/// Invoked with the destination path and the error when a write fails.
pub type ErrorCallback = Arc<dyn Fn(&Path, &HerdrError) + Send + Sync>;

struct PendingWrite {
    content: Vec<u8>,
    caller: String,
}

struct WriterInner {
    runtime: Handle,
    /// One live queue per path with queued or in-flight writes.
    queues: Mutex<HashMap<PathBuf, mpsc::UnboundedSender<PendingWrite>>>,
    pending: Mutex<usize>,
    drained: Condvar,
    on_error: Option<ErrorCallback>,
}

/// Crash-safe writer shared by every component that persists artifacts.
///
/// Cloning is cheap; clones share queues and the pending counter.
#[derive(Clone)]
pub struct DurableWriter {
    inner: Arc<WriterInner>,
}

impl std::fmt::Debug for DurableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableWriter")
            .field("pending", &self.pending_writes())
            .finish_non_exhaustive()
    }
}

impl DurableWriter {
    /// Create a writer that runs its queues on the given runtime.
    pub fn new(runtime: Handle) -> Self {
        Self::build(runtime, None)
    }

    /// Create a writer on the runtime of the calling context.
    pub fn from_current() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| HerdrError::Config(format!("No tokio runtime: {}", e)))?;
        Ok(Self::new(runtime))
    }

    /// Create a writer that reports failures to `callback` as well as the log.
    pub fn with_error_callback(runtime: Handle, callback: ErrorCallback) -> Self {
        Self::build(runtime, Some(callback))
    }

    fn build(runtime: Handle, on_error: Option<ErrorCallback>) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                runtime,
                queues: Mutex::new(HashMap::new()),
                pending: Mutex::new(0),
                drained: Condvar::new(),
                on_error,
            }),
        }
    }

    /// Queue `content` to replace the file at `path`.
    ///
    /// Returns immediately. Failures are logged (and passed to the error
    /// callback) but never returned.
    pub fn write_in_background(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>, caller: &str) {
        let path = path.into();
        let write = PendingWrite {
            content: content.into(),
            caller: caller.to_string(),
        };

        *lock(&self.inner.pending) += 1;

        let mut queues = lock(&self.inner.queues);
        let write = match queues.get(&path) {
            Some(tx) => match tx.send(write) {
                Ok(()) => return,
                Err(mpsc::error::SendError(write)) => write,
            },
            None => write,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive until the drain task exits, and it only exits
        // after removing this entry under the same lock.
        let _ = tx.send(write);
        queues.insert(path.clone(), tx);
        drop(queues);

        let inner = self.inner.clone();
        self.inner.runtime.spawn(drain_queue(inner, path, rx));
    }

    /// Serialize `value` as pretty JSON and queue it for `path`.
    pub fn write_json_in_background<T: Serialize>(&self, path: impl Into<PathBuf>, value: &T, caller: &str) {
        let path = path.into();
        match serde_json::to_vec_pretty(value) {
            Ok(bytes) => self.write_in_background(path, bytes, caller),
            Err(e) => {
                let err = HerdrError::Json(e);
                warn!("[{}] Failed to serialize content for {}: {}", caller, path.display(), err);
                if let Some(cb) = &self.inner.on_error {
                    cb(&path, &err);
                }
            }
        }
    }

    /// Block until every queued write has finished or `timeout` elapses.
    ///
    /// Returns true when nothing is pending. Call from outside the runtime's
    /// worker threads (or via [`DurableWriter::flush`]).
    pub fn flush_all(&self, timeout: Duration) -> bool {
        let pending = lock(&self.inner.pending);
        let (pending, _) = self
            .inner
            .drained
            .wait_timeout_while(pending, timeout, |count| *count > 0)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *pending == 0
    }

    /// Async form of [`DurableWriter::flush_all`] that waits on a blocking thread.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let writer = self.clone();
        tokio::task::spawn_blocking(move || writer.flush_all(timeout))
            .await
            .unwrap_or(false)
    }

    /// Number of writes issued but not yet finished.
    pub fn pending_writes(&self) -> usize {
        *lock(&self.inner.pending)
    }

    /// Number of paths that currently have a live queue.
    pub fn queued_paths(&self) -> usize {
        lock(&self.inner.queues).len()
    }
}

impl WriterInner {
    fn finish_one(&self) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    fn report(&self, path: &Path, caller: &str, err: &HerdrError) {
        warn!("[{}] Durable write to {} failed: {}", caller, path.display(), err);
        if let Some(cb) = &self.on_error {
            cb(path, err);
        }
    }
}

async fn drain_queue(inner: Arc<WriterInner>, path: PathBuf, mut rx: mpsc::UnboundedReceiver<PendingWrite>) {
    while let Some(write) = rx.recv().await {
        let target = path.clone();
        let PendingWrite { content, caller } = write;
        let result = tokio::task::spawn_blocking(move || write_atomic(&target, &content)).await;

        match result {
            Ok(Ok(())) => debug!("[{}] Wrote {}", caller, path.display()),
            Ok(Err(e)) => inner.report(&path, &caller, &e),
            Err(e) => inner.report(&path, &caller, &HerdrError::Io(std::io::Error::other(e))),
        }

        let last = {
            let mut queues = lock(&inner.queues);
            if rx.is_empty() {
                queues.remove(&path);
                true
            } else {
                false
            }
        };

        inner.finish_one();
        if last {
            break;
        }
    }
}

/// Replace `path` with `content` through a temp sibling and an atomic rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_write_atomic_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a").join("b").join("out.txt");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.txt");
        write_atomic(&path, b"old content that is longer").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn test_same_path_last_issued_write_wins() {
        let rt = runtime();
        let temp = TempDir::new().unwrap();
        let writer = DurableWriter::new(rt.handle().clone());
        let path = temp.path().join("scratch.md");

        for i in 0..100 {
            writer.write_in_background(&path, format!("write-{}", i), "test");
        }

        assert!(writer.flush_all(Duration::from_secs(10)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "write-99");
        assert_eq!(writer.pending_writes(), 0);
        assert_eq!(writer.queued_paths(), 0);
    }

    #[test]
    fn test_distinct_paths_all_complete() {
        let rt = runtime();
        let temp = TempDir::new().unwrap();
        let writer = DurableWriter::new(rt.handle().clone());

        for i in 0..100 {
            let path = temp.path().join(format!("file-{}.txt", i));
            writer.write_in_background(path, format!("content-{}-complete", i), "test");
        }

        assert!(writer.flush_all(Duration::from_secs(10)));
        for i in 0..100 {
            let path = temp.path().join(format!("file-{}.txt", i));
            assert_eq!(
                std::fs::read_to_string(&path).unwrap(),
                format!("content-{}-complete", i)
            );
        }
        assert_eq!(writer.queued_paths(), 0);
    }

    #[test]
    fn test_concurrent_writers_leave_complete_content() {
        let rt = runtime();
        let temp = TempDir::new().unwrap();
        let writer = DurableWriter::new(rt.handle().clone());
        let path = temp.path().join("shared.txt");

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let writer = writer.clone();
                let path = path.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        writer.write_in_background(&path, format!("thread-{}-write-{}", t, i).repeat(50), "test");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(writer.flush_all(Duration::from_secs(10)));
        let content = std::fs::read_to_string(&path).unwrap();
        let unit_len = content.len() / 50;
        assert_eq!(content, content[..unit_len].repeat(50));
    }

    #[test]
    fn test_failure_invokes_callback_and_still_drains() {
        let rt = runtime();
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let writer = DurableWriter::with_error_callback(
            rt.handle().clone(),
            Arc::new(move |_path, _err| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        writer.write_in_background(blocker.join("child.txt"), "x", "test");
        assert!(writer.flush_all(Duration::from_secs(5)));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flush_with_nothing_pending_returns_immediately() {
        let rt = runtime();
        let writer = DurableWriter::new(rt.handle().clone());
        assert!(writer.flush_all(Duration::from_millis(1)));
    }

    #[test]
    fn test_write_json_in_background() {
        let rt = runtime();
        let temp = TempDir::new().unwrap();
        let writer = DurableWriter::new(rt.handle().clone());
        let path = temp.path().join("report.json");

        writer.write_json_in_background(&path, &serde_json::json!({"ok": true}), "test");
        assert!(writer.flush_all(Duration::from_secs(5)));

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_flush() {
        let temp = TempDir::new().unwrap();
        let writer = DurableWriter::from_current().unwrap();
        let path = temp.path().join("async.txt");
        writer.write_in_background(&path, "async", "test");
        assert!(writer.flush(Duration::from_secs(5)).await);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "async");
    }

    #[test]
    fn test_from_current_without_runtime_fails() {
        assert!(DurableWriter::from_current().is_err());
    }
}
