//! Minimal HTTP/1.1 front end: one request per connection, JSON out.
//!
//! Endpoints (also under `/api`):
//!   GET|POST /send               - append a chat message
//!   GET|POST /messages           - poll with a cursor
//!   GET|POST /messages-snapshot  - newest window, no cursor
//!   GET|POST /doc-get            - read a document path
//!   GET|POST /doc-set            - write a document path
//!   GET|POST /doc-increment      - add to a numeric path
//!   GET|POST /register           - record a player
//!   GET      /health             - counters

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{RelayError, RelayResult};
use crate::logging::{log, log_request, obj, ts_epoch_ms, v_str, Domain, Level};
use crate::service::{
    DocGetRequest, DocWriteRequest, MessagesRequest, RegisterRequest, Relay, SendRequest,
};

const MAX_LINE: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const MAX_BODY: usize = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
    /// Query string merged with the body; body keys win.
    pub params: Map<String, Value>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    /// Deserialize the params into one of the service request types.
    pub fn parse<T: DeserializeOwned>(&self) -> RelayResult<T> {
        serde_json::from_value(Value::Object(self.params.clone()))
            .map_err(|_| RelayError::BadRequest)
    }

    /// First `X-Forwarded-For` hop, else the socket peer.
    pub fn identity(&self, peer: Option<SocketAddr>) -> String {
        self.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .or_else(|| peer.map(|p| p.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Option<Value>,
    pub no_store: bool,
    /// The error behind a failed response, kept for the server log.
    pub failure: Option<RelayError>,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body: Some(body), no_store: false, failure: None }
    }

    pub fn read(body: Value) -> Self {
        Self { status: 200, body: Some(body), no_store: true, failure: None }
    }

    pub fn error(err: &RelayError) -> Self {
        Self {
            status: err.status(),
            body: Some(json!({"ok": false, "error": err.code()})),
            no_store: true,
            failure: Some(err.clone()),
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            204 => "No Content",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            429 => "Too Many Requests",
            _ => "Internal Server Error",
        }
    }

    pub fn render(&self) -> String {
        let body = self.body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
             Access-Control-Allow-Headers: Content-Type\r\n\
             Connection: close\r\n",
            self.status,
            self.reason()
        );
        if self.no_store {
            head.push_str("Cache-Control: no-store\r\n");
        }
        if self.body.is_some() {
            head.push_str("Content-Type: application/json\r\n");
        }
        format!("{}Content-Length: {}\r\n\r\n{}", head, body.len(), body)
    }
}

fn merge_urlencoded(params: &mut Map<String, Value>, raw: &[u8]) {
    for (k, v) in url::form_urlencoded::parse(raw) {
        params.insert(k.into_owned(), Value::String(v.into_owned()));
    }
}

/// JSON bodies may carry structured `value`s; those become `valueJson`.
fn merge_json(params: &mut Map<String, Value>, raw: &[u8]) -> RelayResult<()> {
    let parsed = serde_json::from_slice::<Value>(raw).map_err(|_| RelayError::BadRequest)?;
    let Value::Object(fields) = parsed else {
        return Err(RelayError::BadRequest);
    };
    for (k, v) in fields {
        match v {
            Value::String(s) => {
                params.insert(k, Value::String(s));
            }
            Value::Null => {}
            other if k == "value" => {
                params.remove("value");
                params.insert("valueJson".to_string(), Value::String(other.to_string()));
            }
            other => {
                params.insert(k, Value::String(other.to_string()));
            }
        }
    }
    Ok(())
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> RelayResult<String> {
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await
        .map_err(|_| RelayError::BadRequest)?;
    if n == 0 || n > MAX_LINE {
        return Err(RelayError::BadRequest);
    }
    let line = String::from_utf8(buf).map_err(|_| RelayError::BadRequest)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Read one request: request line, headers, optional body.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> RelayResult<Request> {
    let line = read_line(reader).await?;
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(RelayError::BadRequest);
    };
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    let mut req = Request {
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        ..Default::default()
    };
    merge_urlencoded(&mut req.params, query.as_bytes());

    loop {
        let header = read_line(reader).await?;
        if header.is_empty() {
            break;
        }
        if req.headers.len() >= MAX_HEADERS {
            return Err(RelayError::BadRequest);
        }
        if let Some((name, value)) = header.split_once(':') {
            req.headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let length = match req.header("content-length") {
        Some(v) => v.parse::<usize>().map_err(|_| RelayError::BadRequest)?,
        None => 0,
    };
    if length > MAX_BODY {
        return Err(RelayError::BadRequest);
    }
    if length > 0 {
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await.map_err(|_| RelayError::BadRequest)?;
        let is_json = req
            .header("content-type")
            .map_or(false, |ct| ct.contains("json"));
        if is_json {
            merge_json(&mut req.params, &body)?;
        } else {
            merge_urlencoded(&mut req.params, &body);
        }
    }
    Ok(req)
}

fn respond(result: RelayResult<Value>) -> Response {
    match result {
        Ok(body) => Response::ok(body),
        Err(err) => Response::error(&err),
    }
}

/// Dispatch one parsed request against the relay.
pub fn route(relay: &Relay, req: &Request, identity: &str) -> Response {
    if req.method == "OPTIONS" {
        return Response { status: 204, body: None, no_store: false, failure: None };
    }
    if req.method != "GET" && req.method != "POST" {
        return Response::error(&RelayError::NotFound);
    }
    let path = req.path.trim_end_matches('/');
    let path = path.strip_prefix("/api").unwrap_or(path);
    let now = ts_epoch_ms();

    match path {
        "/send" => respond(req.parse::<SendRequest>().and_then(|r| relay.send(identity, &r, now))),
        "/messages" => match req.parse::<MessagesRequest>() {
            Ok(r) => Response::read(relay.messages(&r)),
            Err(e) => Response::error(&e),
        },
        "/messages-snapshot" => match req.parse::<MessagesRequest>() {
            Ok(r) => Response::read(relay.snapshot(&r)),
            Err(e) => Response::error(&e),
        },
        "/doc-get" => match req.parse::<DocGetRequest>().and_then(|r| relay.doc_get(&r)) {
            Ok(body) => Response::read(body),
            Err(e) => Response::error(&e),
        },
        "/doc-set" => respond(
            req.parse::<DocWriteRequest>()
                .and_then(|r| relay.doc_set(identity, &r, now)),
        ),
        "/doc-increment" => respond(
            req.parse::<DocWriteRequest>()
                .and_then(|r| relay.doc_increment(identity, &r, now)),
        ),
        "/register" => respond(
            req.parse::<RegisterRequest>()
                .and_then(|r| relay.register(identity, &r, now)),
        ),
        "/health" | "" => Response::read(relay.health()),
        _ => Response::error(&RelayError::NotFound),
    }
}

async fn handle_connection(stream: TcpStream, peer: Option<SocketAddr>, relay: Arc<Relay>) {
    let started = Instant::now();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (response, method, path, identity) =
        match tokio::time::timeout(READ_TIMEOUT, read_request(&mut reader)).await {
            Ok(Ok(req)) => {
                let identity = req.identity(peer);
                let response = route(&relay, &req, &identity);
                if let Some(err) = &response.failure {
                    if err.is_server_side() {
                        log(
                            Level::Error,
                            Domain::Http,
                            "server_error",
                            obj(&[("path", v_str(&req.path)), ("error", v_str(&err.to_string()))]),
                        );
                    }
                }
                (response, req.method, req.path, identity)
            }
            Ok(Err(err)) => (Response::error(&err), String::new(), String::new(), String::new()),
            Err(_) => return,
        };

    let identity = if identity.is_empty() {
        peer.map(|p| p.ip().to_string()).unwrap_or_default()
    } else {
        identity
    };
    if let Err(err) = write_half.write_all(response.render().as_bytes()).await {
        log(
            Level::Debug,
            Domain::Http,
            "write_failed",
            obj(&[("identity", v_str(&identity)), ("error", v_str(&err.to_string()))]),
        );
    }
    let _ = write_half.shutdown().await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    log_request(&method, &path, response.status, &identity, elapsed_ms);
}

/// Accept connections until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, relay: Arc<Relay>, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, Some(peer), relay.clone()));
                }
                Err(err) => {
                    log(
                        Level::Warn,
                        Domain::Http,
                        "accept_failed",
                        obj(&[("error", v_str(&err.to_string()))]),
                    );
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(raw: &str) -> RelayResult<Request> {
        let mut reader = BufReader::new(raw.as_bytes());
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn test_query_params() {
        let req = parse("GET /messages?worldId=a%20b&since=4 HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/messages");
        assert_eq!(req.params["worldId"], "a b");
        assert_eq!(req.params["since"], "4");
    }

    #[tokio::test]
    async fn test_form_body_overrides_query() {
        let body = "text=hi+there&worldId=w2";
        let raw = format!(
            "POST /send?worldId=w1 HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let req = parse(&raw).await.unwrap();
        assert_eq!(req.params["worldId"], "w2");
        assert_eq!(req.params["text"], "hi there");
    }

    #[tokio::test]
    async fn test_json_body_structured_value() {
        let body = r#"{"path":"a.b","value":{"x":1},"delta":5}"#;
        let raw = format!(
            "POST /doc-set HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let req = parse(&raw).await.unwrap();
        assert_eq!(req.params["valueJson"], r#"{"x":1}"#);
        assert_eq!(req.params["delta"], "5");
        assert!(req.params.get("value").is_none());
    }

    #[tokio::test]
    async fn test_malformed_request_line() {
        assert_eq!(parse("\r\n").await.unwrap_err(), RelayError::BadRequest);
        assert_eq!(
            parse("POST /x HTTP/1.1\r\nContent-Length: nope\r\n\r\n").await.unwrap_err(),
            RelayError::BadRequest
        );
    }

    #[test]
    fn test_identity_prefers_forwarded() {
        let mut req = Request::default();
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(req.identity(Some(peer)), "10.0.0.1");
        req.headers.insert("x-forwarded-for".into(), "203.0.113.9, 10.0.0.1".into());
        assert_eq!(req.identity(Some(peer)), "203.0.113.9");
    }

    #[test]
    fn test_server_failure_keeps_detail() {
        let resp = Response::error(&RelayError::Persist("data/default.json: disk full".into()));
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body, Some(json!({"ok": false, "error": "persist-failed"})));
        let failure = resp.failure.unwrap();
        assert!(failure.is_server_side());
        assert!(failure.to_string().contains("disk full"));
        assert!(Response::ok(json!({})).failure.is_none());
    }

    #[test]
    fn test_render_error_is_json() {
        let text = Response::error(&RelayError::RateLimited).render();
        assert!(text.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(text.contains("Cache-Control: no-store"));
        assert!(text.ends_with(r#"{"error":"rate-limit","ok":false}"#));
    }
}
