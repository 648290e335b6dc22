//! Structured logging for the relay.
//!
//! Every record is one JSON line on stdout carrying a run id, a sequence
//! number, level, component and event name. When `LOG_DIR` is set the same
//! lines are appended to `<LOG_DIR>/<run_id>/events.jsonl`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Http,      // Connections, routing, responses
    Chat,      // Message log appends and trimming
    Doc,       // Document loads and mutations
    Persist,   // Local flushes
    Replicate, // Remote backup pushes
    Limit,     // Rate limiter decisions and sweeps
    System,    // Startup, shutdown
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Http => "http",
            Domain::Chat => "chat",
            Domain::Doc => "doc",
            Domain::Persist => "persist",
            Domain::Replicate => "replicate",
            Domain::Limit => "limit",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let events = std::env::var("LOG_DIR").ok().and_then(|base| {
            let mut run_dir = PathBuf::from(base);
            run_dir.push(&run_id);
            if let Err(err) = create_dir_all(&run_dir) {
                eprintln!("[log] failed to create run dir: {}", err);
                return None;
            }
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(run_dir.join("events.jsonl"))
            {
                Ok(file) => Some(Mutex::new(BufWriter::new(file))),
                Err(err) => {
                    eprintln!("[log] failed to open events log: {}", err);
                    None
                }
            }
        });

        RunContext { run_id, events }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["token", "authorization", "Authorization", "github_token"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["doc", "world_id", "identity", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if let Some(events) = &ctx.events {
        write_line(events, &line);
    }
    println!("{}", line);
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_request(method: &str, path: &str, status: u16, identity: &str, elapsed_ms: f64) {
    let level = if status >= 500 { Level::Warn } else { Level::Debug };
    log(
        level,
        Domain::Http,
        "request",
        obj(&[
            ("method", v_str(method)),
            ("path", v_str(path)),
            ("status", json!(status)),
            ("identity", v_str(identity)),
            ("elapsed_ms", v_num(elapsed_ms)),
        ]),
    );
}

pub fn log_rejection(domain: Domain, operation: &str, code: &str, identity: &str) {
    log(
        Level::Info,
        domain,
        "rejected",
        obj(&[
            ("operation", v_str(operation)),
            ("code", v_str(code)),
            ("identity", v_str(identity)),
        ]),
    );
}

pub fn log_flush(doc: &str, bytes: usize, digest: &str, elapsed_ms: f64) {
    log(
        Level::Debug,
        Domain::Persist,
        "flushed",
        obj(&[
            ("doc", v_str(doc)),
            ("bytes", json!(bytes)),
            ("digest", v_str(digest)),
            ("elapsed_ms", v_num(elapsed_ms)),
        ]),
    );
}

pub fn log_replication(doc: &str, ok: bool, status: Option<u16>, detail: Option<&str>) {
    let level = if ok { Level::Info } else { Level::Warn };
    log(
        level,
        Domain::Replicate,
        if ok { "pushed" } else { "push_failed" },
        obj(&[
            ("doc", v_str(doc)),
            ("status", status.map(|s| json!(s)).unwrap_or(Value::Null)),
            ("detail", detail.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_sanitize_redacts_token() {
        let m = sanitize_fields(obj(&[("token", v_str("hunter2")), ("path", v_str("a.b"))]));
        assert_eq!(m.get("token").unwrap(), "[REDACTED]");
        assert_eq!(m.get("path").unwrap(), "a.b");
    }

    #[test]
    fn test_split_lifts_correlation_keys() {
        let (top, data) = split_fields(obj(&[("doc", v_str("default")), ("bytes", json!(12))]));
        assert!(top.contains_key("doc"));
        assert!(!data.contains_key("doc"));
        assert!(data.contains_key("bytes"));
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
