//! A small CouchDB stand-in served by axum on an ephemeral port.

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// `admin:pw`
pub const BASIC_ADMIN: &str = "Basic YWRtaW46cHc=";
pub const DOC_ETAG: &str = "\"1-abc\"";

#[derive(Clone, Default)]
pub struct ServerState {
    pub flaky_hits: Arc<AtomicUsize>,
    pub feeds: Arc<Mutex<Vec<(String, String)>>>,
    pub conditional_hits: Arc<AtomicUsize>,
}

impl ServerState {
    pub fn flaky_hits(&self) -> usize {
        self.flaky_hits.load(Ordering::SeqCst)
    }

    /// `(feed, since)` of every `_changes` request so far.
    pub fn feeds(&self) -> Vec<(String, String)> {
        self.feeds.lock().clone()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: ServerState,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }
}

pub fn feed_entries() -> Vec<Value> {
    vec![
        json!({"seq": 1, "id": "doc1", "changes": [{"rev": "1-abc"}]}),
        json!({"seq": 2, "id": "doc2", "changes": [{"rev": "1-def"}]}),
        json!({"seq": 3, "id": "doc1", "changes": [{"rev": "2-ghi"}], "deleted": true}),
    ]
}

fn entries_after(since: u64) -> Vec<Value> {
    feed_entries()
        .into_iter()
        .filter(|e| e["seq"].as_u64().unwrap_or(0) > since)
        .collect()
}

fn json_response(status: StatusCode, body: Value) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Splits `text` into pieces of at most `size` bytes, sent as separate chunks.
fn chunked(text: String, size: usize) -> Body {
    let bytes = Bytes::from(text);
    let pieces: Vec<Result<Bytes, std::io::Error>> = (0..bytes.len())
        .step_by(size)
        .map(|i| Ok(bytes.slice(i..(i + size).min(bytes.len()))))
        .collect();
    Body::from_stream(futures::stream::iter(pieces))
}

async fn changes(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let feed = query.get("feed").cloned().unwrap_or_else(|| "normal".into());
    let since_param = query.get("since").cloned().unwrap_or_else(|| "0".into());
    state.feeds.lock().push((feed.clone(), since_param.clone()));
    let since: u64 = since_param.parse().unwrap_or(0);
    let results = entries_after(since);
    let last_seq = results
        .last()
        .and_then(|e| e["seq"].as_u64())
        .unwrap_or(since);

    match feed.as_str() {
        "continuous" => {
            let mut pieces: Vec<Result<Bytes, std::io::Error>> = Vec::new();
            for entry in results {
                let line = format!("{}\n", entry);
                let (head, tail) = line.split_at(line.len() / 2);
                pieces.push(Ok(Bytes::from(head.to_string())));
                pieces.push(Ok(Bytes::from(tail.to_string())));
                pieces.push(Ok(Bytes::from_static(b"\n")));
            }
            let stream = futures::stream::iter(pieces).chain(futures::stream::pending());
            Response::builder()
                .header("content-type", "application/json")
                .body(Body::from_stream(stream))
                .unwrap()
        }
        "longpoll" if results.is_empty() => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            json_response(StatusCode::OK, json!({"results": [], "last_seq": since}))
        }
        _ => {
            let body = json!({"results": results, "last_seq": last_seq}).to_string();
            Response::builder()
                .header("content-type", "application/json")
                .body(chunked(body, 7))
                .unwrap()
        }
    }
}

async fn flaky_changes(State(state): State<ServerState>) -> Response {
    state.flaky_hits.fetch_add(1, Ordering::SeqCst);
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": "unknown_error", "reason": "flaky"}),
    )
}

async fn doc(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    if headers.get("if-none-match").and_then(|v| v.to_str().ok()) == Some(DOC_ETAG) {
        state.conditional_hits.fetch_add(1, Ordering::SeqCst);
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header("etag", DOC_ETAG)
            .body(Body::empty())
            .unwrap();
    }
    Response::builder()
        .header("content-type", "application/json")
        .header("etag", DOC_ETAG)
        .body(Body::from(r#"{"_id":"doc1","_rev":"1-abc","name":"pancakes"}"#))
        .unwrap()
}

async fn missing() -> Response {
    json_response(
        StatusCode::NOT_FOUND,
        json!({"error": "not_found", "reason": "missing"}),
    )
}

async fn secure(headers: HeaderMap) -> Response {
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(BASIC_ADMIN) => json_response(StatusCode::OK, json!({"ok": true})),
        _ => Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header("www-authenticate", "Basic realm=\"administrator\"")
            .body(Body::from(r#"{"error":"unauthorized"}"#))
            .unwrap(),
    }
}

async fn create(body: String) -> Response {
    let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    if !parsed.is_object() {
        return json_response(StatusCode::BAD_REQUEST, json!({"error": "bad_request"}));
    }
    Response::builder()
        .status(StatusCode::CREATED)
        .header("content-type", "application/json")
        .header("location", "/db/newid")
        .body(Body::from(r#"{"ok":true,"id":"newid","rev":"1-a"}"#))
        .unwrap()
}

pub async fn spawn_server() -> TestServer {
    let state = ServerState::default();
    let app = Router::new()
        .route("/db", post(create))
        .route("/db/_changes", get(changes))
        .route("/db/doc1", get(doc))
        .route("/db/missing", get(missing))
        .route("/secure/doc", get(secure))
        .route("/flaky/_changes", get(flaky_changes))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, state }
}
