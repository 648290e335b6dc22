//! One document: its tree, its file, and the task that flushes it.
//!
//! Writers mutate the tree under a short `RwLock` and call `schedule()`.
//! A single flusher task per document sleeps out the debounce window after
//! each wake-up and then serializes whatever the tree holds at that moment.
//! `Notify` keeps at most one pending permit, so a burst of writes costs one
//! or two flushes, never one per write.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::runtime::RuntimeFlavor;
use tokio::sync::Notify;

use crate::error::{RelayError, RelayResult};
use crate::logging::{log, log_flush, log_replication, obj, v_str, Domain, Level};
use crate::replicate::{ReplicationReport, Replicator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Written { bytes: usize },
    /// Content identical to the last successful flush.
    Unchanged,
}

#[derive(Debug, Default)]
struct WriteQueue {
    last_digest: Option<String>,
}

pub struct DocumentHandle {
    name: String,
    path: PathBuf,
    tree: RwLock<Value>,
    wake: Notify,
    queue: tokio::sync::Mutex<WriteQueue>,
    persist_error: Mutex<Option<String>>,
    last_replication: Mutex<Option<ReplicationReport>>,
    replicator: Option<Arc<dyn Replicator>>,
}

fn digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Run blocking file work off the scheduler when the runtime allows it.
/// A current-thread runtime cannot hand the worker off, so it runs inline.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(rt) if rt.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}

/// Raw file contents, `None` when there is no file yet.
fn read_file(path: &Path, name: &str) -> RelayResult<Option<String>> {
    match blocking(|| std::fs::read_to_string(path)) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => {
            let detail = format!("reading {}: {}", path.display(), err);
            log(
                Level::Error,
                Domain::Doc,
                "load_failed",
                obj(&[("doc", v_str(name)), ("error", v_str(&detail))]),
            );
            Err(RelayError::Internal(detail))
        }
    }
}

/// Tree of a document that is not loaded, read straight from disk.
///
/// Nothing is registered, spawned or moved. A missing, corrupt or
/// non-object file reads as `None`.
pub fn peek(dir: &Path, name: &str) -> RelayResult<Option<Value>> {
    let Some(raw) = read_file(&file_path(dir, name), name)? else {
        return Ok(None);
    };
    Ok(serde_json::from_str::<Value>(&raw).ok().filter(Value::is_object))
}

impl DocumentHandle {
    /// Load `<dir>/<name>.json`, or start empty if there is no file.
    ///
    /// A file that does not parse is moved aside to `<name>.json.corrupt-<ms>`
    /// so the first flush cannot overwrite it.
    pub fn load(
        dir: &Path,
        name: &str,
        replicator: Option<Arc<dyn Replicator>>,
    ) -> RelayResult<Self> {
        let path = file_path(dir, name);
        let tree = match read_file(&path, name)? {
            None => Value::Object(Map::new()),
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(v @ Value::Object(_)) => v,
                Ok(_) => {
                    log(
                        Level::Warn,
                        Domain::Doc,
                        "non_object_root",
                        obj(&[
                            ("doc", v_str(name)),
                            ("msg", v_str("root replaced by empty object")),
                        ]),
                    );
                    Value::Object(Map::new())
                }
                Err(err) => {
                    let stamp = chrono::Utc::now().timestamp_millis();
                    let aside = path.with_extension(format!("json.corrupt-{}", stamp));
                    let moved = blocking(|| std::fs::rename(&path, &aside)).is_ok();
                    log(
                        Level::Error,
                        Domain::Doc,
                        "corrupt_file",
                        obj(&[
                            ("doc", v_str(name)),
                            ("error", v_str(&err.to_string())),
                            (
                                "moved_to",
                                if moved { v_str(&aside.to_string_lossy()) } else { Value::Null },
                            ),
                        ]),
                    );
                    if !moved {
                        return Err(RelayError::Internal(format!("unreadable document {}", name)));
                    }
                    Value::Object(Map::new())
                }
            },
        };

        let last_digest = serde_json::to_string_pretty(&tree).ok().map(|s| digest(&s));
        log(Level::Info, Domain::Doc, "loaded", obj(&[("doc", v_str(name))]));

        Ok(Self {
            name: name.to_string(),
            path,
            tree: RwLock::new(tree),
            wake: Notify::new(),
            queue: tokio::sync::Mutex::new(WriteQueue { last_digest }),
            persist_error: Mutex::new(None),
            last_replication: Mutex::new(None),
            replicator,
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Value> {
        match self.tree.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Value> {
        match self.tree.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Wake the flusher.
    pub fn schedule(&self) {
        self.wake.notify_one();
    }

    pub fn persist_error(&self) -> Option<String> {
        lock(&self.persist_error).clone()
    }

    pub fn last_replication(&self) -> Option<ReplicationReport> {
        lock(&self.last_replication).clone()
    }

    /// Write the current tree to disk, then push it remotely if configured.
    ///
    /// The tree lock is held only while serializing. The write queue is held
    /// through the remote push so pushes for one document stay in order.
    pub async fn flush(&self) -> RelayResult<FlushOutcome> {
        let mut queue = self.queue.lock().await;
        let content = {
            let tree = self.read();
            serde_json::to_string_pretty(&*tree).map_err(|e| RelayError::Internal(e.to_string()))?
        };
        let sum = digest(&content);
        if queue.last_digest.as_deref() == Some(sum.as_str()) {
            return Ok(FlushOutcome::Unchanged);
        }

        let started = Instant::now();
        if let Err(err) = write_atomic(&self.path, &content).await {
            let detail = format!("{}: {}", self.path.display(), err);
            log(
                Level::Error,
                Domain::Persist,
                "flush_failed",
                obj(&[("doc", v_str(&self.name)), ("error", v_str(&detail))]),
            );
            *lock(&self.persist_error) = Some(detail.clone());
            return Err(RelayError::Persist(detail));
        }
        queue.last_digest = Some(sum.clone());
        *lock(&self.persist_error) = None;
        log_flush(&self.name, content.len(), &sum, started.elapsed().as_secs_f64() * 1000.0);

        if let Some(replicator) = &self.replicator {
            let result = replicator.push(&self.name, &content).await;
            let report = ReplicationReport::from_result(&result);
            log_replication(&self.name, report.ok, report.status, report.error.as_deref());
            *lock(&self.last_replication) = Some(report);
        }

        Ok(FlushOutcome::Written { bytes: content.len() })
    }
}

async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Debounced flush loop for one document. Runs for the life of the process.
pub async fn run_flusher(handle: Arc<DocumentHandle>, debounce: Duration) {
    loop {
        handle.wake.notified().await;
        tokio::time::sleep(debounce).await;
        // failures are logged and recorded on the handle by flush()
        let _ = handle.flush().await;
    }
}
