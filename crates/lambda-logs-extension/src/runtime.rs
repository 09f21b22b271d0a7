//! Extension runtime orchestrator.
//!
//! This module wires the components together:
//! - the publisher behind the event sink
//! - the log receiver the Logs API pushes to
//! - the Extensions API registration and the lifecycle coordinator
//! - termination signal handling

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::extension::{ExtensionClient, PollError, RegistrationError};
use crate::logs_api::{LogsClient, SubscriptionRequest};
use crate::publisher::{self, PublishError};
use crate::receiver::{LogReceiver, ReceiverHandle};
use crate::sink::{DeliveryResponse, EventSink, SinkHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Errors from the extension runtime.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// No runtime API address is configured.
    #[error("AWS_LAMBDA_RUNTIME_API is not set; use local mode to run outside Lambda")]
    MissingRuntimeApi,

    /// Registration with the Extensions API failed.
    #[error("failed to register extension")]
    Registration(#[source] RegistrationError),

    /// Failed to start the log receiver.
    #[error("failed to start log receiver")]
    ReceiverStart(#[source] std::io::Error),

    /// Failed to start the publisher.
    #[error("failed to start publisher")]
    Publisher(#[source] PublishError),

    /// The poll loop could not run.
    #[error("event loop error")]
    EventLoop(#[source] PollError),
}

/// Extension runtime that orchestrates all components.
pub struct ExtensionRuntime {
    config: Config,
    cancel_token: CancellationToken,
}

impl ExtensionRuntime {
    /// Creates a new extension runtime with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Returns a handle to the cancellation token.
    ///
    /// Cancelling it stops the poll loop and the receiver.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Runs the extension until shutdown.
    ///
    /// Registration failure is fatal. A failed Logs API subscription is logged
    /// and the lifecycle loop keeps running without log forwarding.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::Runtime`](crate::ExtensionError::Runtime) if
    /// a component fails to start or registration fails.
    pub async fn run(self) -> crate::Result<()> {
        let signals = tokio::spawn(watch_termination_signals(self.cancel_token.clone()));

        let (sink, responses, publisher_task) =
            publisher::spawn(self.config.publisher.clone()).map_err(RuntimeError::Publisher)?;
        if self.config.debug {
            tokio::spawn(drain_responses(responses));
        }

        let outcome = if self.config.local_mode {
            self.run_local(&sink).await
        } else {
            self.run_extension(&sink).await
        };

        let receiver_task = match outcome {
            Ok(task) => task,
            Err(e) => {
                self.cancel_token.cancel();
                signals.abort();
                return Err(e.into());
            }
        };

        sink.flush().await;
        self.cancel_token.cancel();
        let stopped = tokio::time::timeout(SHUTDOWN_GRACE, receiver_task).await;
        if stopped.is_err() {
            tracing::warn!("Log receiver did not stop in time");
        }

        drop(sink);
        let stopped = tokio::time::timeout(SHUTDOWN_GRACE, publisher_task).await;
        if stopped.is_err() {
            tracing::warn!("Publisher did not stop in time");
        }
        signals.abort();

        tracing::debug!("Extension finished");
        Ok(())
    }

    async fn run_local(&self, sink: &SinkHandle) -> Result<JoinHandle<()>, RuntimeError> {
        let (handle, task) = self.start_receiver(sink).await?;
        tracing::info!(
            listener = %handle.listener_uri(),
            "Running in local mode, skipping registration"
        );

        self.cancel_token.cancelled().await;
        Ok(task)
    }

    async fn run_extension(&self, sink: &SinkHandle) -> Result<JoinHandle<()>, RuntimeError> {
        let runtime_api = self
            .config
            .runtime_api
            .as_deref()
            .filter(|api| !api.is_empty())
            .ok_or(RuntimeError::MissingRuntimeApi)?;

        let client = ExtensionClient::new(runtime_api, self.config.extension_name());
        let mut coordinator = Coordinator::new(client, sink.clone(), self.cancel_token.clone());
        let registration = coordinator
            .register()
            .await
            .map_err(RuntimeError::Registration)?;

        let (handle, task) = self.start_receiver(sink).await?;

        let request =
            SubscriptionRequest::from_config(handle.listener_uri(), &self.config.logs_api);
        match LogsClient::new(runtime_api)
            .subscribe(&registration.extension_id, &request)
            .await
        {
            Ok(ack) => {
                tracing::debug!(
                    message = %ack.message,
                    "Logs API subscription acknowledged"
                );
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to subscribe to Logs API, logs will not be forwarded"
                );
            }
        }

        coordinator.run().await.map_err(RuntimeError::EventLoop)?;
        Ok(task)
    }

    async fn start_receiver(
        &self,
        sink: &SinkHandle,
    ) -> Result<(ReceiverHandle, JoinHandle<()>), RuntimeError> {
        let receiver = LogReceiver::new(
            self.config.receiver.clone(),
            sink.clone(),
            self.cancel_token.clone(),
        );
        let (handle, future) = receiver.start().await.map_err(RuntimeError::ReceiverStart)?;
        Ok((handle, tokio::spawn(future)))
    }
}

/// Cancels `cancel` on SIGTERM or SIGINT.
///
/// Returns early without cancelling if the token is cancelled elsewhere.
pub async fn watch_termination_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut terminate), Ok(mut interrupt)) => {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = terminate.recv() => tracing::info!("Received SIGTERM, shutting down"),
                    _ = interrupt.recv() => tracing::info!("Received SIGINT, shutting down"),
                }
                cancel.cancel();
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(
                    error = %e,
                    "Failed to install signal handlers, falling back to Ctrl+C"
                );
            }
        }
    }

    tokio::select! {
        () = cancel.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => tracing::info!("Received Ctrl+C, shutting down"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C"),
            }
            cancel.cancel();
        }
    }
}

/// Logs every delivery response until the publisher stops.
pub async fn drain_responses(mut responses: mpsc::Receiver<DeliveryResponse>) {
    while let Some(response) = responses.recv().await {
        match response.status_code {
            _ if response.is_success() => tracing::debug!(
                status = ?response.status_code,
                duration_ms = response.duration.as_millis() as u64,
                "Event delivered"
            ),
            Some(401) => tracing::debug!("Event rejected: API key invalid"),
            status => tracing::debug!(
                status = ?status,
                error = response.error.as_deref().unwrap_or_default(),
                metadata = response.metadata.as_deref().unwrap_or_default(),
                "Event delivery failed"
            ),
        }
    }
}
