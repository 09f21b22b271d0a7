//! Event sink interface.
//!
//! The sink is the hand-off point between this extension's core and the
//! transmission layer. Submissions never block; `flush` waits until every
//! submission ordered before it has been handed to the transport.

use crate::event::NormalizedEvent;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Destination for normalized events.
pub trait EventSink: Clone + Send + Sync + 'static {
    /// Queues an event for delivery without waiting.
    fn submit(&self, event: NormalizedEvent);

    /// Waits until all previously submitted events have been handed off.
    fn flush(&self) -> impl Future<Output = ()> + Send;
}

/// Commands carried from sink handles to the transmission worker.
#[derive(Debug)]
pub enum SinkCommand {
    /// Queue an event.
    Event(NormalizedEvent),
    /// Send everything queued so far, then acknowledge.
    Flush(oneshot::Sender<()>),
}

/// Outcome of delivering a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// HTTP status reported for the event, if a response was received.
    pub status_code: Option<u16>,
    /// Time spent sending the batch containing the event.
    pub duration: Duration,
    /// Error description when delivery failed.
    pub error: Option<String>,
    /// The event's dedup key, carried back for correlation.
    pub metadata: Option<String>,
}

impl DeliveryResponse {
    /// Returns true when the event was accepted.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status_code.is_some_and(|c| (200..300).contains(&c))
    }
}

/// Cloneable handle that queues events for the transmission worker.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    tx: mpsc::UnboundedSender<SinkCommand>,
}

impl SinkHandle {
    /// Creates a handle and the receiving end the worker consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns true once the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventSink for SinkHandle {
    fn submit(&self, event: NormalizedEvent) {
        if self.tx.send(SinkCommand::Event(event)).is_err() {
            tracing::warn!("Event sink closed, dropping event");
        }
    }

    async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(SinkCommand::Flush(ack_tx)).is_err() {
            tracing::warn!("Event sink closed, nothing to flush");
            return;
        }
        if ack_rx.await.is_err() {
            tracing::warn!("Event sink stopped before acknowledging flush");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_flush_is_ordered_after_submissions() {
        let (sink, mut rx) = SinkHandle::channel();

        sink.submit(NormalizedEvent::builder(Utc::now()).field("n", 1).build());
        sink.submit(NormalizedEvent::builder(Utc::now()).field("n", 2).build());

        let worker = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(command) = rx.recv().await {
                match command {
                    SinkCommand::Event(event) => seen.push(event),
                    SinkCommand::Flush(ack) => {
                        let _ = ack.send(());
                        return seen.len();
                    }
                }
            }
            seen.len()
        });

        sink.flush().await;
        assert_eq!(worker.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_flush_on_closed_sink_returns() {
        let (sink, rx) = SinkHandle::channel();
        drop(rx);

        assert!(sink.is_closed());
        sink.flush().await;
        sink.submit(NormalizedEvent::builder(Utc::now()).build());
    }

    #[test]
    fn test_delivery_response_success() {
        let ok = DeliveryResponse {
            status_code: Some(202),
            duration: Duration::from_millis(5),
            error: None,
            metadata: None,
        };
        assert!(ok.is_success());

        let rejected = DeliveryResponse {
            status_code: Some(401),
            ..ok.clone()
        };
        assert!(!rejected.is_success());

        let failed = DeliveryResponse {
            status_code: None,
            error: Some("connection refused".to_string()),
            ..ok
        };
        assert!(!failed.is_success());
    }
}
