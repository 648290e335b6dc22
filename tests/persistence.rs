//! Debounced flushing, reload, failure surfacing and replication annexes.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use worldrelay::doc::{DocumentStore, FlushOutcome, DEFAULT_DOC};
use worldrelay::replicate::{PushError, Replicator};
use worldrelay::service::{DocGetRequest, DocWriteRequest};
use worldrelay::{Config, Relay, RelayError};

#[derive(Default)]
struct RecordingReplicator {
    pushes: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Replicator for RecordingReplicator {
    async fn push(&self, doc: &str, content: &str) -> Result<Option<String>, PushError> {
        let mut pushes = self.pushes.lock().unwrap();
        pushes.push((doc.to_string(), content.to_string()));
        Ok(Some(format!("commit-{}", pushes.len())))
    }
}

struct ConflictingReplicator;

#[async_trait]
impl Replicator for ConflictingReplicator {
    async fn push(&self, _doc: &str, _content: &str) -> Result<Option<String>, PushError> {
        Err(PushError {
            status: Some(409),
            detail: "revision conflict".to_string(),
        })
    }
}

fn config(dir: &TempDir, debounce_ms: u64) -> Config {
    let mut cfg = Config::default();
    cfg.data_dir = dir.path().to_path_buf();
    cfg.cooldown_ms = 0;
    cfg.flush_debounce_ms = debounce_ms;
    cfg
}

fn write(path: &str, value: &str) -> DocWriteRequest {
    DocWriteRequest {
        path: Some(path.to_string()),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn on_disk(dir: &TempDir, doc: &str) -> Value {
    let raw = std::fs::read_to_string(dir.path().join(format!("{}.json", doc))).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test]
async fn burst_collapses_into_latest_state() {
    let dir = TempDir::new().unwrap();
    let replicator = Arc::new(RecordingReplicator::default());
    let relay = Relay::with_replicator(config(&dir, 30), Some(replicator.clone()));

    for i in 1..=20 {
        relay.doc_set("c", &write("counter", &i.to_string()), 0).unwrap();
    }
    assert!(!dir.path().join("default.json").exists());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(on_disk(&dir, DEFAULT_DOC), json!({"counter": 20}));

    let pushes = replicator.pushes.lock().unwrap();
    assert!(!pushes.is_empty() && pushes.len() <= 2, "pushes: {}", pushes.len());
    let (doc, content) = pushes.last().unwrap();
    assert_eq!(doc, DEFAULT_DOC);
    assert_eq!(serde_json::from_str::<Value>(content).unwrap(), json!({"counter": 20}));
}

#[tokio::test]
async fn replication_report_is_annexed() {
    let dir = TempDir::new().unwrap();
    let relay = Relay::with_replicator(config(&dir, 10_000), Some(Arc::new(RecordingReplicator::default())));

    let first = relay.doc_set("c", &write("a", "1"), 0).unwrap();
    assert_eq!(first["replication"]["pending"], true);

    relay.documents().flush(DEFAULT_DOC).await.unwrap();
    let second = relay.doc_set("c", &write("a", "2"), 0).unwrap();
    assert_eq!(second["replication"]["ok"], true);
    assert_eq!(second["replication"]["commit"], "commit-1");
}

#[tokio::test]
async fn failed_replication_never_fails_the_write() {
    let dir = TempDir::new().unwrap();
    let relay = Relay::with_replicator(config(&dir, 10_000), Some(Arc::new(ConflictingReplicator)));

    relay.doc_set("c", &write("a", "1"), 0).unwrap();
    let outcome = relay.documents().flush(DEFAULT_DOC).await.unwrap();
    assert!(matches!(outcome, FlushOutcome::Written { .. }));
    assert_eq!(on_disk(&dir, DEFAULT_DOC), json!({"a": 1}));

    let body = relay.doc_set("c", &write("a", "2"), 0).unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["replication"]["ok"], false);
    assert_eq!(body["replication"]["status"], 409);
    assert_eq!(body["replication"]["error"], "revision conflict");
}

#[tokio::test]
async fn disk_failure_surfaces_but_mutation_stands() {
    let dir = TempDir::new().unwrap();
    let relay = Relay::with_replicator(config(&dir, 10_000), None);

    relay.doc_set("c", &write("a", "1"), 0).unwrap();
    // a directory squatting on the target makes the rename fail
    std::fs::create_dir(dir.path().join("default.json")).unwrap();
    let err = relay.documents().flush(DEFAULT_DOC).await.unwrap_err();
    assert_eq!(err.code(), "persist-failed");

    let again = relay.doc_set("c", &write("a", "2"), 0);
    assert!(matches!(again, Err(RelayError::Persist(_))));
    let value = relay
        .doc_get(&DocGetRequest { doc: None, path: Some("a".to_string()) })
        .unwrap();
    assert_eq!(value["value"], 2);

    std::fs::remove_dir(dir.path().join("default.json")).unwrap();
    relay.documents().flush(DEFAULT_DOC).await.unwrap();
    assert!(relay.doc_set("c", &write("a", "3"), 0).is_ok());
}

#[tokio::test]
async fn restart_reloads_flushed_documents() {
    let dir = TempDir::new().unwrap();
    {
        let relay = Relay::with_replicator(config(&dir, 10_000), None);
        relay.doc_set("c", &write("world.day", "7"), 0).unwrap();
        let mut other = write("seed", "abc");
        other.doc = Some("world-2".to_string());
        relay.doc_set("c", &other, 0).unwrap();
        assert_eq!(relay.documents().flush_all().await.unwrap(), 2);
    }

    let relay = Relay::with_replicator(config(&dir, 10_000), None);
    let day = relay
        .doc_get(&DocGetRequest { doc: None, path: Some("world.day".to_string()) })
        .unwrap();
    assert_eq!(day["value"], 7);
    let seed = relay
        .doc_get(&DocGetRequest { doc: Some("world-2".to_string()), path: Some("seed".to_string()) })
        .unwrap();
    assert_eq!(seed["value"], "abc");
}

#[test]
fn concurrent_increments_do_not_lose_updates() {
    let dir = TempDir::new().unwrap();
    let store = DocumentStore::new(dir.path(), Duration::from_millis(10), None);
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..100 {
                    store.increment(DEFAULT_DOC, "stats.kills", 1.0).unwrap();
                }
            });
        }
    });
    assert_eq!(store.get(DEFAULT_DOC, "stats.kills").unwrap(), Some(json!(800)));
}
