//! HTTP listener for log batches pushed by the Logs API.
//!
//! Each batch is a JSON array of raw records. Records are normalized in
//! order and handed to the event sink without waiting on delivery, so a slow
//! sink never stalls the platform's push.

use crate::config::ReceiverConfig;
use crate::normalize::{RawLogRecord, normalize};
use crate::sink::EventSink;
use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SANDBOX_HOSTNAME: &str = "sandbox.localdomain";
const LOCAL_HOSTNAME: &str = "127.0.0.1";

/// Handle for a running log receiver.
#[derive(Clone)]
pub struct ReceiverHandle {
    stats: Arc<ReceiverStats>,
    local_addr: SocketAddr,
    destination_host: String,
}

impl ReceiverHandle {
    /// Returns the actual bound address of the receiver.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the port the receiver is listening on.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the URI the Logs API should push batches to.
    pub fn listener_uri(&self) -> String {
        format!("http://{}:{}", self.destination_host, self.port())
    }

    /// Returns the number of records accepted so far.
    pub fn records_received(&self) -> u64 {
        self.stats.records_received.load(Ordering::Relaxed)
    }

    /// Returns the number of batches that could not be decoded.
    pub fn batches_dropped(&self) -> u64 {
        self.stats.batches_dropped.load(Ordering::Relaxed)
    }
}

/// HTTP receiver that turns pushed log batches into events.
pub struct LogReceiver<S> {
    config: ReceiverConfig,
    sink: S,
    cancel_token: CancellationToken,
}

impl<S: EventSink> LogReceiver<S> {
    /// Creates a new log receiver.
    ///
    /// # Arguments
    ///
    /// * `config` - Receiver configuration
    /// * `sink` - Where normalized events are submitted
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(config: ReceiverConfig, sink: S, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            sink,
            cancel_token,
        }
    }

    /// Binds the listener and returns a handle plus the server future.
    ///
    /// The future should be spawned; it completes once the cancellation token
    /// fires and in-flight requests have finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to the address.
    pub async fn start(
        self,
    ) -> Result<(ReceiverHandle, Pin<Box<dyn Future<Output = ()> + Send>>), std::io::Error> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let stats = Arc::new(ReceiverStats::default());
        let handle = ReceiverHandle {
            stats: Arc::clone(&stats),
            local_addr,
            destination_host: self
                .config
                .destination_host
                .clone()
                .unwrap_or_else(default_destination_host),
        };

        let state = Arc::new(ReceiverState {
            sink: self.sink,
            stats,
        });
        // Batch size is bounded by the subscription's buffering config, and
        // an oversized batch must still be accepted.
        let app = Router::new()
            .route("/", post(handle_batch::<S>))
            .layer(DefaultBodyLimit::disable())
            .with_state(state);

        tracing::info!(port = local_addr.port(), "Log receiver started");

        let cancel_token = self.cancel_token;
        let future = Box::pin(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(cancel_token.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "Log receiver failed");
            }
        });

        Ok((handle, future))
    }
}

/// Inside the platform sandbox the Logs API reaches us by hostname; anywhere
/// else only loopback is routable.
fn default_destination_host() -> String {
    if std::env::var("AWS_LAMBDA_FUNCTION_NAME").is_ok() {
        SANDBOX_HOSTNAME.to_string()
    } else {
        LOCAL_HOSTNAME.to_string()
    }
}

#[derive(Default)]
struct ReceiverStats {
    records_received: AtomicU64,
    batches_dropped: AtomicU64,
}

struct ReceiverState<S> {
    sink: S,
    stats: Arc<ReceiverStats>,
}

async fn handle_batch<S: EventSink>(
    State(state): State<Arc<ReceiverState<S>>>,
    body: Bytes,
) -> impl IntoResponse {
    let records: Vec<RawLogRecord> = match serde_json::from_slice(&body) {
        Ok(records) => records,
        Err(e) => {
            state.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, bytes = body.len(), "Dropping malformed log batch");
            return StatusCode::OK;
        }
    };

    tracing::debug!(count = records.len(), "Received log batch");

    let count = records.len() as u64;
    for record in records {
        state.sink.submit(normalize(record));
    }
    state
        .stats
        .records_received
        .fetch_add(count, Ordering::Relaxed);

    StatusCode::OK
}
