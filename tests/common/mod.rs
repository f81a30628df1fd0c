#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use serde_json::{json, Value as JsonValue};

#[derive(Clone)]
pub struct MockResponse {
    pub status: StatusCode,
    pub body: JsonValue,
    pub delay: Duration,
    pub set_cookie: Option<&'static str>,
    /// Sent verbatim instead of `body`.
    pub raw: Option<&'static str>,
}

impl MockResponse {
    pub fn json(status: StatusCode, body: JsonValue) -> Self {
        Self {
            status,
            body,
            delay: Duration::from_millis(0),
            set_cookie: None,
            raw: None,
        }
    }

    pub fn raw(status: StatusCode, body: &'static str) -> Self {
        Self {
            raw: Some(body),
            ..Self::json(status, JsonValue::Null)
        }
    }

    pub fn ok(body: JsonValue) -> Self {
        Self::json(StatusCode::OK, body)
    }

    pub fn status(status: StatusCode) -> Self {
        Self::json(status, json!({"error": status.as_u16()}))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_cookie(mut self, cookie: &'static str) -> Self {
        self.set_cookie = Some(cookie);
        self
    }
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: String,
    pub at: Instant,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    pub fn json(&self) -> JsonValue {
        serde_json::from_str(&self.body).expect("recorded body must be JSON")
    }
}

/// Canned responses per path; once a queue runs dry the fallback answers.
#[derive(Clone)]
struct MockState {
    routes: Arc<Mutex<HashMap<String, VecDeque<MockResponse>>>>,
    fallbacks: Arc<Mutex<HashMap<String, MockResponse>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

async fn handler(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_owned();
    state
        .requests
        .lock()
        .expect("request log mutex must not be poisoned")
        .push(RecordedRequest {
            method,
            path: path.clone(),
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
            at: Instant::now(),
        });

    let queued = state
        .routes
        .lock()
        .expect("route mutex must not be poisoned")
        .get_mut(&path)
        .and_then(VecDeque::pop_front);
    let response = queued
        .or_else(|| {
            state
                .fallbacks
                .lock()
                .expect("fallback mutex must not be poisoned")
                .get(&path)
                .cloned()
        })
        .unwrap_or_else(|| {
            MockResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "no mock response available"}),
            )
        });

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    let mut reply = match response.raw {
        Some(raw) => (response.status, raw).into_response(),
        None => (response.status, axum::Json(response.body)).into_response(),
    };
    if let Some(cookie) = response.set_cookie {
        reply
            .headers_mut()
            .insert(header::SET_COOKIE, HeaderValue::from_static(cookie));
    }
    reply
}

pub struct TestServer {
    pub base_url: String,
    state: MockState,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    /// Queues responses for `path`, served in order.
    pub fn route(&self, path: &str, responses: Vec<MockResponse>) {
        self.state
            .routes
            .lock()
            .expect("route mutex must not be poisoned")
            .entry(path.to_owned())
            .or_default()
            .extend(responses);
    }

    /// Answer for `path` whenever its queue is empty.
    pub fn fallback(&self, path: &str, response: MockResponse) {
        self.state
            .fallbacks
            .lock()
            .expect("fallback mutex must not be poisoned")
            .insert(path.to_owned(), response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .expect("request log mutex must not be poisoned")
            .clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

pub async fn spawn_server() -> TestServer {
    let state = MockState {
        routes: Arc::new(Mutex::new(HashMap::new())),
        fallbacks: Arc::new(Mutex::new(HashMap::new())),
        requests: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new().fallback(handler).with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        state,
        task,
    }
}
