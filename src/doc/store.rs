use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::doc::path::{as_number, get_at, number_value, parse_path, set_at};
use crate::doc::persist::{peek, run_flusher, DocumentHandle, FlushOutcome};
use crate::error::{RelayError, RelayResult};
use crate::replicate::{ReplicationReport, Replicator};

pub const DEFAULT_DOC: &str = "default";

pub fn valid_doc_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Named JSON documents, each with its own lock and flush task.
///
/// The registry lock only guards lookup and insertion; reads and writes of
/// one document never block another.
pub struct DocumentStore {
    data_dir: PathBuf,
    debounce: Duration,
    replicator: Option<Arc<dyn Replicator>>,
    docs: Mutex<HashMap<String, Arc<DocumentHandle>>>,
}

impl DocumentStore {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        debounce: Duration,
        replicator: Option<Arc<dyn Replicator>>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            debounce,
            replicator,
            docs: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<DocumentHandle>>> {
        match self.docs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Handle for `name`, loading it on first use.
    ///
    /// The flusher is only spawned when a tokio runtime is current; without
    /// one the document is persisted by explicit `flush` calls only.
    pub fn handle(&self, name: &str) -> RelayResult<Arc<DocumentHandle>> {
        if !valid_doc_name(name) {
            return Err(RelayError::InvalidDoc);
        }
        if let Some(h) = self.registry().get(name) {
            return Ok(h.clone());
        }

        // load outside the registry lock; a racing loader may win the insert
        let loaded = Arc::new(DocumentHandle::load(&self.data_dir, name, self.replicator.clone())?);
        let mut docs = self.registry();
        if let Some(h) = docs.get(name) {
            return Ok(h.clone());
        }
        docs.insert(name.to_string(), loaded.clone());
        drop(docs);

        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(run_flusher(loaded.clone(), self.debounce));
        }
        Ok(loaded)
    }

    /// Value at `path`, or the whole tree for an empty path.
    ///
    /// A document that is not loaded is read from disk without being
    /// registered; only writes bring a document into the registry.
    pub fn get(&self, doc: &str, path: &str) -> RelayResult<Option<Value>> {
        if !valid_doc_name(doc) {
            return Err(RelayError::InvalidDoc);
        }
        let segments = parse_path(path);
        let loaded = self.registry().get(doc).cloned();
        match loaded {
            Some(handle) => {
                let tree = handle.read();
                Ok(get_at(&tree, &segments).cloned())
            }
            None => {
                let tree = peek(&self.data_dir, doc)?.unwrap_or_else(|| Value::Object(Map::new()));
                Ok(get_at(&tree, &segments).cloned())
            }
        }
    }

    /// Run `f` against the tree under its write lock, then schedule a flush.
    /// Nothing is scheduled if `f` fails.
    pub fn update<T>(
        &self,
        doc: &str,
        f: impl FnOnce(&mut Value) -> RelayResult<T>,
    ) -> RelayResult<T> {
        let handle = self.handle(doc)?;
        let out = {
            let mut tree = handle.write();
            f(&mut *tree)?
        };
        handle.schedule();
        Ok(out)
    }

    pub fn set(&self, doc: &str, path: &str, value: Value) -> RelayResult<Value> {
        let segments = parse_path(path);
        if segments.is_empty() {
            return Err(RelayError::PathRequired);
        }
        self.update(doc, |tree| {
            set_at(tree, &segments, value.clone())?;
            Ok(value)
        })
    }

    /// Add `delta` to the number at `path` (absent or non-numeric counts as 0).
    pub fn increment(&self, doc: &str, path: &str, delta: f64) -> RelayResult<Value> {
        if !delta.is_finite() {
            return Err(RelayError::InvalidDelta);
        }
        let segments = parse_path(path);
        if segments.is_empty() {
            return Err(RelayError::PathRequired);
        }
        self.update(doc, |tree| {
            let next = as_number(get_at(tree, &segments)) + delta;
            if !next.is_finite() {
                return Err(RelayError::InvalidDelta);
            }
            let value = number_value(next);
            set_at(tree, &segments, value.clone())?;
            Ok(value)
        })
    }

    pub async fn flush(&self, doc: &str) -> RelayResult<FlushOutcome> {
        self.handle(doc)?.flush().await
    }

    /// Flush every loaded document; the first error is returned after all
    /// documents have been tried.
    pub async fn flush_all(&self) -> RelayResult<usize> {
        let handles: Vec<Arc<DocumentHandle>> = self.registry().values().cloned().collect();
        let mut written = 0;
        let mut first_err = None;
        for h in handles {
            match h.flush().await {
                Ok(FlushOutcome::Written { .. }) => written += 1,
                Ok(FlushOutcome::Unchanged) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    pub fn persist_error(&self, doc: &str) -> Option<String> {
        self.registry().get(doc).and_then(|h| h.persist_error())
    }

    /// Latest push report, if this store replicates and has pushed `doc`.
    pub fn last_replication(&self, doc: &str) -> Option<ReplicationReport> {
        self.registry().get(doc).and_then(|h| h.last_replication())
    }

    pub fn replicates(&self) -> bool {
        self.replicator.is_some()
    }

    pub fn documents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry().keys().cloned().collect();
        names.sort();
        names
    }
}
