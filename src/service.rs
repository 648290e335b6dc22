//! Request-level operations over the relay's owned state.
//!
//! Write paths run in a fixed order: authorize, validate, rate-limit, then
//! mutate. A rejected request never consumes the caller's cooldown and never
//! changes state.

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::chat::{MessageLog, SnapshotEntry};
use crate::config::Config;
use crate::doc::{coerce_value, parse_path, DocumentStore, DEFAULT_DOC};
use crate::error::{RelayError, RelayResult};
use crate::limiter::RateLimiter;
use crate::logging::{log, log_rejection, obj, ts_now, v_str, Domain, Level};
use crate::replicate::{GithubReplicator, Replicator};

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendRequest {
    pub world_id: String,
    pub channel: String,
    pub username: String,
    pub text: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagesRequest {
    pub world_id: Option<String>,
    pub channel: Option<String>,
    pub since: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocGetRequest {
    pub doc: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocWriteRequest {
    pub doc: Option<String>,
    pub path: Option<String>,
    pub value: Option<String>,
    pub value_json: Option<String>,
    pub delta: Option<String>,
    pub token: Option<String>,
    pub world_id: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterRequest {
    pub world_id: String,
    pub username: String,
    pub token: Option<String>,
}

/// Treats blank optional params as absent.
fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Equal-length inputs are compared in full regardless of where they differ.
fn token_matches(given: &str, expected: &str) -> bool {
    given.len() == expected.len()
        && given
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

pub struct Relay {
    cfg: Config,
    limiter: RateLimiter,
    log: MessageLog,
    docs: DocumentStore,
}

impl Relay {
    /// Build from config, wiring GitHub backup when it is enabled.
    pub fn new(cfg: Config) -> Result<Self> {
        let replicator = GithubReplicator::from_config(&cfg.github)?
            .map(|r| Arc::new(r) as Arc<dyn Replicator>);
        if cfg.github.enabled && replicator.is_none() {
            log(
                Level::Warn,
                Domain::System,
                "replication_disabled",
                obj(&[("msg", v_str("GITHUB_BACKUP set but token or repo missing"))]),
            );
        }
        Ok(Self::with_replicator(cfg, replicator))
    }

    pub fn with_replicator(cfg: Config, replicator: Option<Arc<dyn Replicator>>) -> Self {
        let docs = DocumentStore::new(
            cfg.data_dir.clone(),
            Duration::from_millis(cfg.flush_debounce_ms),
            replicator,
        );
        Self {
            limiter: RateLimiter::new(cfg.cooldown_ms),
            log: MessageLog::new(&cfg),
            docs,
            cfg,
        }
    }

    pub fn messages_log(&self) -> &MessageLog {
        &self.log
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.docs
    }

    fn reject(&self, op: &str, identity: &str, err: RelayError) -> RelayError {
        log_rejection(Domain::Http, op, err.code(), identity);
        err
    }

    fn authorize(&self, token: Option<&str>) -> RelayResult<()> {
        match &self.cfg.write_token {
            Some(expected) if !token.map_or(false, |t| token_matches(t, expected)) => {
                Err(RelayError::Unauthorized)
            }
            _ => Ok(()),
        }
    }

    fn check_world(&self, world_id: Option<&str>) -> RelayResult<()> {
        match world_id {
            Some(w) if !self.cfg.world_allowed(w) => Err(RelayError::WorldIdForbidden),
            _ => Ok(()),
        }
    }

    fn admit(&self, identity: &str, now_ms: u64) -> RelayResult<()> {
        if self.limiter.admit(identity, now_ms) {
            Ok(())
        } else {
            Err(RelayError::RateLimited)
        }
    }

    /// Write-response annex and persistence check shared by document writes.
    fn finish_doc_write(&self, doc: &str, mut body: Map<String, Value>) -> RelayResult<Value> {
        if let Some(detail) = self.docs.persist_error(doc) {
            // the mutation stands; the caller learns durability is degraded
            return Err(RelayError::Persist(detail));
        }
        if self.docs.replicates() {
            let annex = self
                .docs
                .last_replication(doc)
                .and_then(|r| serde_json::to_value(r).ok())
                .unwrap_or_else(|| json!({"ok": true, "pending": true}));
            body.insert("replication".to_string(), annex);
        }
        Ok(Value::Object(body))
    }

    pub fn send(&self, identity: &str, req: &SendRequest, now_ms: u64) -> RelayResult<Value> {
        let draft = self
            .log
            .prepare(&req.world_id, &req.channel, &req.username, &req.text)
            .map_err(|e| self.reject("send", identity, e))?;
        self.admit(identity, now_ms)
            .map_err(|e| self.reject("send", identity, e))?;
        let message = self.log.commit(draft);
        Ok(json!({
            "ok": true,
            "id": message.id,
            "timestamp": message.timestamp,
        }))
    }

    pub fn messages(&self, req: &MessagesRequest) -> Value {
        let since = non_blank(&req.since).and_then(|s| s.parse().ok()).unwrap_or(0);
        let limit = non_blank(&req.limit)
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.cfg.default_limit);
        let (cursor, messages) = self.log.query(
            non_blank(&req.world_id),
            non_blank(&req.channel),
            since,
            limit,
        );
        json!({
            "ok": true,
            "cursor": cursor.to_string(),
            "messages": messages,
        })
    }

    pub fn snapshot(&self, req: &MessagesRequest) -> Value {
        let limit = non_blank(&req.limit)
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.cfg.default_limit);
        let messages = self
            .log
            .snapshot(non_blank(&req.world_id), non_blank(&req.channel), limit);
        let entries: Vec<SnapshotEntry<'_>> = messages.iter().map(SnapshotEntry::from).collect();
        json!({
            "ok": true,
            "messages": entries,
        })
    }

    pub fn doc_get(&self, req: &DocGetRequest) -> RelayResult<Value> {
        let doc = non_blank(&req.doc).unwrap_or(DEFAULT_DOC);
        let path = non_blank(&req.path).unwrap_or("");
        let value = self.docs.get(doc, path)?;
        Ok(json!({
            "ok": true,
            "doc": doc,
            "path": path,
            "value": value.unwrap_or(Value::Null),
        }))
    }

    fn doc_write_preamble<'a>(
        &self,
        op: &str,
        identity: &str,
        req: &'a DocWriteRequest,
    ) -> RelayResult<(&'a str, &'a str)> {
        self.authorize(req.token.as_deref())
            .and_then(|_| self.check_world(non_blank(&req.world_id)))
            .map_err(|e| self.reject(op, identity, e))?;
        let doc = non_blank(&req.doc).unwrap_or(DEFAULT_DOC);
        let path = non_blank(&req.path).unwrap_or("");
        if parse_path(path).is_empty() {
            return Err(self.reject(op, identity, RelayError::PathRequired));
        }
        if !crate::doc::valid_doc_name(doc) {
            return Err(self.reject(op, identity, RelayError::InvalidDoc));
        }
        Ok((doc, path))
    }

    pub fn doc_set(
        &self,
        identity: &str,
        req: &DocWriteRequest,
        now_ms: u64,
    ) -> RelayResult<Value> {
        let (doc, path) = self.doc_write_preamble("doc-set", identity, req)?;
        let value = coerce_value(req.value.as_deref(), non_blank(&req.value_json))
            .map_err(|e| self.reject("doc-set", identity, e))?;
        self.admit(identity, now_ms)
            .map_err(|e| self.reject("doc-set", identity, e))?;

        let stored = self.docs.set(doc, path, value)?;
        let body = obj(&[
            ("ok", json!(true)),
            ("doc", v_str(doc)),
            ("path", v_str(path)),
            ("value", stored),
            ("timestamp", v_str(&ts_now())),
        ]);
        self.finish_doc_write(doc, body)
    }

    pub fn doc_increment(
        &self,
        identity: &str,
        req: &DocWriteRequest,
        now_ms: u64,
    ) -> RelayResult<Value> {
        let (doc, path) = self.doc_write_preamble("doc-increment", identity, req)?;
        let delta = match non_blank(&req.delta) {
            None => 1.0,
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite())
                .ok_or_else(|| self.reject("doc-increment", identity, RelayError::InvalidDelta))?,
        };
        self.admit(identity, now_ms)
            .map_err(|e| self.reject("doc-increment", identity, e))?;

        let value = self.docs.increment(doc, path, delta)?;
        let body = obj(&[
            ("ok", json!(true)),
            ("doc", v_str(doc)),
            ("path", v_str(path)),
            ("value", value),
        ]);
        self.finish_doc_write(doc, body)
    }

    /// Record a player under `players.<username>` in the default document.
    /// Re-registering only refreshes `lastSeen`.
    pub fn register(
        &self,
        identity: &str,
        req: &RegisterRequest,
        now_ms: u64,
    ) -> RelayResult<Value> {
        let world_id = req.world_id.trim();
        let check = self
            .authorize(req.token.as_deref())
            .and_then(|_| {
                if world_id.is_empty() {
                    Err(RelayError::WorldIdRequired)
                } else {
                    Ok(())
                }
            })
            .and_then(|_| self.check_world(Some(world_id)));
        check.map_err(|e| self.reject("register", identity, e))?;

        // dots would split the name into nested path segments
        let username: String = req
            .username
            .trim()
            .chars()
            .take(crate::config::MAX_USERNAME_CHARS)
            .map(|c| if c == '.' { '_' } else { c })
            .collect();
        if username.is_empty() {
            return Err(self.reject("register", identity, RelayError::UsernameRequired));
        }
        self.admit(identity, now_ms)
            .map_err(|e| self.reject("register", identity, e))?;

        let now = ts_now();
        let (registered_at, existing) = self.docs.update(DEFAULT_DOC, |tree| {
            let segments = ["players", username.as_str()];
            let existing = crate::doc::path::get_at(tree, &segments)
                .and_then(|p| p.get("registeredAt"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            match existing {
                Some(at) => {
                    let last_seen = ["players", username.as_str(), "lastSeen"];
                    crate::doc::path::set_at(tree, &last_seen, json!(now))?;
                    Ok((at, true))
                }
                None => {
                    let entry = json!({"worldId": world_id, "registeredAt": now, "lastSeen": now});
                    crate::doc::path::set_at(tree, &segments, entry)?;
                    Ok((now.clone(), false))
                }
            }
        })?;

        let body = obj(&[
            ("ok", json!(true)),
            ("username", v_str(&username)),
            ("worldId", v_str(world_id)),
            ("registeredAt", v_str(&registered_at)),
            ("existing", json!(existing)),
        ]);
        self.finish_doc_write(DEFAULT_DOC, body)
    }

    pub fn health(&self) -> Value {
        json!({
            "ok": true,
            "messages": self.log.len(),
            "lastId": self.log.last_id(),
            "documents": self.docs.documents(),
            "limiterEntries": self.limiter.len(),
            "cooldownMs": self.limiter.cooldown_ms(),
        })
    }

    /// Periodic ledger eviction: entries idle for ten cooldown windows.
    pub fn sweep_limiter(&self, now_ms: u64) -> usize {
        let max_age = self.cfg.cooldown_ms.saturating_mul(10).max(1000);
        let removed = self.limiter.sweep(now_ms, max_age);
        if removed > 0 {
            log(
                Level::Debug,
                Domain::Limit,
                "swept",
                obj(&[("removed", json!(removed)), ("remaining", json!(self.limiter.len()))]),
            );
        }
        removed
    }
}
