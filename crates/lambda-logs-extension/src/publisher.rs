//! Batching event publisher with retry.
//!
//! The publisher is the transmission worker behind [`SinkHandle`]. It batches
//! normalized events, posts them to the events API and reports one
//! [`DeliveryResponse`] per event on a bounded channel.

use crate::config::{Compression, PublisherConfig};
use crate::event::NormalizedEvent;
use crate::sink::{DeliveryResponse, SinkCommand, SinkHandle};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MIN_BATCH_TIMEOUT: Duration = Duration::from_millis(1);
const TEAM_HEADER: &str = "X-Honeycomb-Team";

/// Error during publishing.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// HTTP request failed.
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// Server returned an error status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code returned by server.
        status: u16,
        /// Response body from server.
        body: String,
    },

    /// Encoding the batch failed.
    #[error("failed to encode batch")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The configured API host is not a usable base URL.
    #[error("invalid API host: {0}")]
    InvalidApiHost(String),
}

impl PublishError {
    fn encode<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Encode(Box::new(error))
    }

    fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }
}

/// Starts the publisher worker.
///
/// Returns the sink handle events are submitted through, the delivery
/// response stream and the worker task. The worker drains and exits once
/// every clone of the handle has been dropped.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built or the API host is
/// not a valid URL.
pub fn spawn(
    config: PublisherConfig,
) -> Result<(SinkHandle, mpsc::Receiver<DeliveryResponse>, JoinHandle<()>), PublishError> {
    let publisher = Publisher::new(config)?;
    let (sink, commands) = SinkHandle::channel();
    let (responses_tx, responses_rx) =
        mpsc::channel(publisher.config.response_queue_size.max(1));

    let worker = tokio::spawn(publisher.run(commands, responses_tx));
    Ok((sink, responses_rx, worker))
}

/// Batch poster for the events API.
pub struct Publisher {
    config: PublisherConfig,
    client: Client,
    batch_url: Option<Url>,
}

impl Publisher {
    /// Creates a publisher with the given configuration.
    ///
    /// A publisher without API key or dataset is created disabled: it accepts
    /// events and discards them.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created or the API host
    /// is invalid.
    pub fn new(config: PublisherConfig) -> Result<Self, PublishError> {
        let client = Client::builder()
            .timeout(config.batch_send_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(user_agent())
            .build()?;

        let batch_url = match config.dataset.as_deref() {
            Some(dataset) if config.is_enabled() => Some(batch_url(&config.api_host, dataset)?),
            _ => {
                tracing::warn!("API key or dataset not configured, events will be discarded");
                None
            }
        };

        Ok(Self {
            config,
            client,
            batch_url,
        })
    }

    /// Returns true if events are actually sent.
    pub fn is_enabled(&self) -> bool {
        self.batch_url.is_some()
    }

    async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<SinkCommand>,
        responses: mpsc::Sender<DeliveryResponse>,
    ) {
        let max_batch_size = self.config.max_batch_size.max(1);
        let mut pending: Vec<NormalizedEvent> = Vec::with_capacity(max_batch_size);
        let mut ticker = tokio::time::interval(self.config.batch_timeout.max(MIN_BATCH_TIMEOUT));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SinkCommand::Event(event)) => {
                        pending.push(event);
                        if pending.len() >= max_batch_size {
                            self.send_pending(&mut pending, &responses).await;
                        }
                    }
                    Some(SinkCommand::Flush(ack)) => {
                        self.send_pending(&mut pending, &responses).await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.send_pending(&mut pending, &responses).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        self.send_pending(&mut pending, &responses).await;
                    }
                }
            }
        }

        tracing::debug!("Publisher stopped");
    }

    async fn send_pending(
        &self,
        pending: &mut Vec<NormalizedEvent>,
        responses: &mpsc::Sender<DeliveryResponse>,
    ) {
        if pending.is_empty() {
            return;
        }

        let batch = std::mem::take(pending);
        let Some(url) = &self.batch_url else {
            tracing::debug!(
                count = batch.len(),
                "Publishing disabled, discarding events"
            );
            return;
        };

        let started = Instant::now();
        let outcome = self.send_with_retry(url, &batch).await;
        let duration = started.elapsed();

        for (index, event) in batch.iter().enumerate() {
            let (status_code, error) = match &outcome {
                Ok(statuses) => {
                    let status = statuses.get(index).cloned().unwrap_or_default();
                    (Some(status.status), status.error)
                }
                Err(PublishError::Status { status, body }) => (Some(*status), Some(body.clone())),
                Err(e) => (None, Some(e.to_string())),
            };

            let response = DeliveryResponse {
                status_code,
                duration,
                error,
                metadata: event.dedup_key().map(str::to_owned),
            };

            if responses.try_send(response).is_err() {
                tracing::trace!("Delivery response queue full, dropping response");
            }
        }
    }

    async fn send_with_retry(
        &self,
        url: &Url,
        batch: &[NormalizedEvent],
    ) -> Result<Vec<EventStatus>, PublishError> {
        let body = self.encode_batch(batch)?;
        let mut last_error = None;
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 0..MAX_RETRIES {
            match self.try_send(url, body.clone(), batch.len()).await {
                Ok(statuses) => return Ok(statuses),
                Err(PublishError::Status { status, ref body }) if !is_retryable(status) => {
                    if status == 401 {
                        tracing::error!("Events API rejected the API key");
                    } else {
                        tracing::error!(status, "Received non-retryable status code, not retrying");
                    }
                    return Err(PublishError::status(status, body.clone()));
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Publish attempt failed"
                    );
                    last_error = Some(e);

                    if attempt + 1 < MAX_RETRIES {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PublishError::status(0, "no attempts made")))
    }

    async fn try_send(
        &self,
        url: &Url,
        body: Vec<u8>,
        count: usize,
    ) -> Result<Vec<EventStatus>, PublishError> {
        let mut request = self
            .client
            .post(url.clone())
            .header("Content-Type", "application/json")
            .header(
                TEAM_HEADER,
                self.config.api_key.as_deref().unwrap_or_default(),
            )
            .body(body);

        if self.config.compression == Compression::Gzip {
            request = request.header("Content-Encoding", "gzip");
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(PublishError::status(status.as_u16(), text));
        }

        // Per-event statuses when the server reports them; otherwise every
        // event shares the batch status.
        match serde_json::from_str::<Vec<EventStatus>>(&text) {
            Ok(statuses) if statuses.len() == count => Ok(statuses),
            _ => Ok(vec![
                EventStatus {
                    status: status.as_u16(),
                    error: None,
                };
                count
            ]),
        }
    }

    fn encode_batch(&self, batch: &[NormalizedEvent]) -> Result<Vec<u8>, PublishError> {
        let wire: Vec<WireEvent<'_>> = batch.iter().map(WireEvent::from).collect();
        let json = serde_json::to_vec(&wire).map_err(PublishError::encode)?;

        match self.config.compression {
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&json).map_err(PublishError::encode)?;
                encoder.finish().map_err(PublishError::encode)
            }
            Compression::None => Ok(json),
        }
    }
}

/// Determines if a status code is worth retrying.
///
/// Retryable: 408 (Request Timeout), 429 (Too Many Requests), 5xx (Server Errors)
fn is_retryable(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

fn user_agent() -> String {
    format!(
        "lambda-logs-extension/{} ({})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH
    )
}

fn batch_url(api_host: &str, dataset: &str) -> Result<Url, PublishError> {
    let mut url =
        Url::parse(api_host).map_err(|_| PublishError::InvalidApiHost(api_host.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| PublishError::InvalidApiHost(api_host.to_string()))?
        .pop_if_empty()
        .extend(["1", "batch", dataset]);
    Ok(url)
}

#[derive(Serialize)]
struct WireEvent<'a> {
    time: DateTime<Utc>,
    samplerate: u64,
    data: &'a Map<String, Value>,
}

impl<'a> From<&'a NormalizedEvent> for WireEvent<'a> {
    fn from(event: &'a NormalizedEvent) -> Self {
        Self {
            time: event.timestamp(),
            samplerate: event.sample_weight().get(),
            data: event.fields(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EventStatus {
    status: u16,
    #[serde(default)]
    error: Option<String>,
}
