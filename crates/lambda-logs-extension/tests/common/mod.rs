//! Shared test utilities for lambda-logs-extension integration tests.
//!
//! Provides an in-process stand-in for the Lambda runtime API (Extensions API
//! and Logs API) and a sink that records what it is given.

#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
};
use lambda_logs_extension::{EventSink, NormalizedEvent};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const EXTENSION_ID: &str = "test-identifier";

/// Sink that keeps every submitted event and counts flushes.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<NormalizedEvent>>>,
    flushes: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<NormalizedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl EventSink for RecordingSink {
    fn submit(&self, event: NormalizedEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockState {
    events: Mutex<VecDeque<Value>>,
    log_batch: Mutex<Option<Value>>,
    registered_names: Mutex<Vec<String>>,
    subscriptions: Mutex<Vec<Value>>,
    polls: AtomicUsize,
    poll_ids: Mutex<Vec<String>>,
    reject_subscriptions: AtomicBool,
}

/// Mock runtime API serving registration, the event long-poll and log
/// subscriptions.
///
/// Events are served in order; once the queue is empty the long-poll hangs
/// like a frozen environment. When a log batch is configured it is pushed to
/// the subscriber's destination before the subscription is acknowledged.
pub struct MockRuntimeApi {
    state: Arc<MockState>,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl MockRuntimeApi {
    pub async fn start(events: Vec<Value>) -> Self {
        Self::start_with_logs(events, None).await
    }

    pub async fn start_with_logs(events: Vec<Value>, log_batch: Option<Value>) -> Self {
        let state = Arc::new(MockState {
            events: Mutex::new(events.into()),
            log_batch: Mutex::new(log_batch),
            ..Default::default()
        });

        let app = Router::new()
            .route("/2020-01-01/extension/register", post(handle_register))
            .route("/2020-01-01/extension/event/next", get(handle_next_event))
            .route("/2020-08-15/logs", put(handle_subscribe))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
        });

        Self {
            state,
            addr,
            cancel,
        }
    }

    /// Makes every later subscription attempt fail with a 500.
    pub fn reject_subscriptions(&self) {
        self.state
            .reject_subscriptions
            .store(true, Ordering::SeqCst);
    }

    /// Address in the `host:port` form of `AWS_LAMBDA_RUNTIME_API`.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.state.registered_names.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<Value> {
        self.state.subscriptions.lock().unwrap().clone()
    }

    pub fn polls(&self) -> usize {
        self.state.polls.load(Ordering::SeqCst)
    }

    pub fn poll_ids(&self) -> Vec<String> {
        self.state.poll_ids.lock().unwrap().clone()
    }
}

impl Drop for MockRuntimeApi {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn invoke_event(request_id: &str, arn: &str) -> Value {
    json!({
        "eventType": "INVOKE",
        "deadlineMs": 1_700_000_000_000_i64,
        "requestId": request_id,
        "invokedFunctionArn": arn,
        "tracing": {
            "type": "X-Amzn-Trace-Id",
            "value": "Root=1-5f35ae12-0c0fec141ab77a00bc047aa2"
        }
    })
}

pub fn shutdown_event(reason: &str) -> Value {
    json!({
        "eventType": "SHUTDOWN",
        "deadlineMs": 1_700_000_002_000_i64,
        "shutdownReason": reason
    })
}

async fn handle_register(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let name = headers
        .get("Lambda-Extension-Name")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.registered_names.lock().unwrap().push(name);

    (
        [("Lambda-Extension-Identifier", EXTENSION_ID)],
        Json(json!({
            "functionName": "ThisIsAFunction",
            "functionVersion": "$LATEST",
            "handler": "main"
        })),
    )
}

async fn handle_next_event(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.polls.fetch_add(1, Ordering::SeqCst);
    if let Some(id) = headers
        .get("Lambda-Extension-Identifier")
        .and_then(|v| v.to_str().ok())
    {
        state.poll_ids.lock().unwrap().push(id.to_string());
    }

    let next = state.events.lock().unwrap().pop_front();
    match next {
        Some(event) => Json(event),
        None => std::future::pending().await,
    }
}

async fn handle_subscribe(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.subscriptions.lock().unwrap().push(body.clone());
    if state.reject_subscriptions.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "subscription rejected");
    }

    let batch = state.log_batch.lock().unwrap().take();
    if let (Some(batch), Some(uri)) = (batch, body["destination"]["URI"].as_str()) {
        let pushed = reqwest::Client::new().post(uri).json(&batch).send().await;
        if pushed.is_err() {
            return (StatusCode::INTERNAL_SERVER_ERROR, "log push failed");
        }
    }

    (StatusCode::OK, "OK")
}
