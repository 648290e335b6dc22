//! End-to-end over a loopback socket.

use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use worldrelay::http::serve;
use worldrelay::{Config, Relay};

struct Server {
    base: String,
    stop: Option<oneshot::Sender<()>>,
    _dir: TempDir,
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start(cooldown_ms: u64) -> Server {
    let dir = TempDir::new().unwrap();
    let mut cfg = Config::default();
    cfg.data_dir = dir.path().to_path_buf();
    cfg.cooldown_ms = cooldown_ms;
    let relay = Arc::new(Relay::with_replicator(cfg, None));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(serve(listener, relay, async {
        let _ = rx.await;
    }));
    Server {
        base: format!("http://{}", addr),
        stop: Some(tx),
        _dir: dir,
    }
}

async fn get(url: &str) -> (u16, Option<String>, Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    let cache = resp
        .headers()
        .get("cache-control")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    (status, cache, resp.json().await.unwrap())
}

#[tokio::test]
async fn chat_over_http() {
    let srv = start(0).await;
    for text in ["hello", "there", "friend"] {
        let (status, _, body) = get(&format!("{}/send?worldId=worldA&username=alex&text={}", srv.base, text)).await;
        assert_eq!(status, 200);
        assert_eq!(body["ok"], true);
    }

    let (status, cache, body) = get(&format!("{}/messages?worldId=worldA&since=0&limit=2", srv.base)).await;
    assert_eq!(status, 200);
    assert_eq!(cache.as_deref(), Some("no-store"));
    assert_eq!(body["cursor"], "2");
    assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    assert_eq!(body["messages"][0]["username"], "alex");

    let (_, _, body) = get(&format!("{}/api/messages?worldId=worldA&since=2", srv.base)).await;
    assert_eq!(body["cursor"], "3");
    assert_eq!(body["messages"][0]["text"], "friend");
}

#[tokio::test]
async fn documents_over_http_with_json_body() {
    let srv = start(0).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/doc-set", srv.base))
        .json(&serde_json::json!({"path": "world.state", "value": {"day": 2}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = client
        .post(format!("{}/doc-increment", srv.base))
        .form(&[("path", "world.state.day"), ("delta", "3")])
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["value"], 5);

    let (status, _, body) = get(&format!("{}/doc-get?path=world.state", srv.base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["value"]["day"], 5);
}

#[tokio::test]
async fn errors_are_structured() {
    let srv = start(60_000).await;

    let (status, _, body) = get(&format!("{}/send?text=hi", srv.base)).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "worldId-required");

    let (status, _, body) = get(&format!("{}/doc-set?path=", srv.base)).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "path-required");

    let (status, _, _) = get(&format!("{}/send?worldId=w&text=one", srv.base)).await;
    assert_eq!(status, 200);
    let (status, _, body) = get(&format!("{}/send?worldId=w&text=two", srv.base)).await;
    assert_eq!(status, 429);
    assert_eq!(body["error"], "rate-limit");

    let (status, _, body) = get(&format!("{}/no/such/thing", srv.base)).await;
    assert_eq!(status, 404);
    assert_eq!(body, serde_json::json!({"ok": false, "error": "not-found"}));
}
