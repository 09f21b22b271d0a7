//! Lifecycle coordinator.
//!
//! Owns the poll loop against the Extensions API. Every iteration ends with
//! exactly one sink flush, because the platform may freeze the process as
//! soon as the next poll is issued.

use crate::event::{
    FIELD_EXTENSION_TYPE, FIELD_INVOKED_FUNCTION_ARN, FIELD_REQUEST_ID, NormalizedEvent,
};
use crate::extension::{
    ExtensionApi, LifecycleEvent, PollError, Registration, RegistrationError, ShutdownReason,
};
use crate::sink::EventSink;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

/// Where the coordinator is in the extension lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not yet registered.
    Registering,
    /// Waiting on the next lifecycle event.
    Polling,
    /// Processing an event.
    Handling,
    /// Done; no further polls will be made.
    Terminated,
}

/// Per-process session state, updated on every invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSession {
    /// Identifier assigned on registration.
    pub extension_id: String,
    /// Request ID of the most recent invoke.
    pub last_request_id: Option<String>,
    /// Function ARN of the most recent invoke.
    pub last_function_arn: Option<String>,
}

/// Drives registration, polling and flush-before-freeze.
pub struct Coordinator<A, S> {
    api: A,
    sink: S,
    cancel: CancellationToken,
    state: LifecycleState,
    session: Option<ExtensionSession>,
}

impl<A: ExtensionApi, S: EventSink> Coordinator<A, S> {
    /// Creates a coordinator in the `Registering` state.
    pub fn new(api: A, sink: S, cancel: CancellationToken) -> Self {
        Self {
            api,
            sink,
            cancel,
            state: LifecycleState::Registering,
            session: None,
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Returns the session, once registered.
    pub fn session(&self) -> Option<&ExtensionSession> {
        self.session.as_ref()
    }

    /// Registers with the Extensions API and moves to `Polling`.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or no identifier is assigned.
    pub async fn register(&mut self) -> Result<Registration, RegistrationError> {
        let registration = self.api.register().await?;
        if registration.extension_id.is_empty() {
            return Err(RegistrationError::MissingIdentifier);
        }

        tracing::info!(
            function_name = %registration.function_name,
            function_version = %registration.function_version,
            "Extension registered"
        );

        self.session = Some(ExtensionSession {
            extension_id: registration.extension_id.clone(),
            last_request_id: None,
            last_function_arn: None,
        });
        self.state = LifecycleState::Polling;
        Ok(registration)
    }

    /// Runs the poll loop until shutdown or cancellation.
    ///
    /// Poll failures other than cancellation are logged and retried
    /// immediately, with no retry limit.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::NotRegistered`] if called before [`register`](Self::register).
    pub async fn run(&mut self) -> Result<(), PollError> {
        match self.state {
            LifecycleState::Registering => return Err(PollError::NotRegistered),
            LifecycleState::Terminated => return Ok(()),
            LifecycleState::Polling | LifecycleState::Handling => {}
        }

        loop {
            if self.cancel.is_cancelled() {
                tracing::debug!("Cancellation requested, stopping poll loop");
                self.state = LifecycleState::Terminated;
                return Ok(());
            }

            self.state = LifecycleState::Polling;
            match self.api.next_event(&self.cancel).await {
                Ok(event) => {
                    self.state = LifecycleState::Handling;
                    let shutdown = self.handle(event);
                    self.sink.flush().await;

                    if shutdown {
                        self.cancel.cancel();
                        self.state = LifecycleState::Terminated;
                        return Ok(());
                    }
                }
                Err(e) if e.is_cancelled() => {
                    tracing::debug!("Poll cancelled");
                    self.state = LifecycleState::Terminated;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Error polling for next event");
                    self.sink.flush().await;
                }
            }
        }
    }

    /// Applies an event to the session. Returns true on shutdown.
    fn handle(&mut self, event: LifecycleEvent) -> bool {
        match event {
            LifecycleEvent::Invoke {
                request_id,
                function_arn,
                ..
            } => {
                tracing::debug!(request_id = %request_id, "Received INVOKE event");
                if let Some(session) = self.session.as_mut() {
                    session.last_request_id = Some(request_id);
                    session.last_function_arn = Some(function_arn);
                }
                false
            }
            LifecycleEvent::Shutdown { reason } => {
                tracing::debug!(reason = %reason, "Received SHUTDOWN event");
                if reason != ShutdownReason::Spindown {
                    self.report_shutdown(&reason);
                }
                true
            }
            LifecycleEvent::Unknown(event_type) => {
                tracing::debug!(event_type = %event_type, "Received unknown event");
                false
            }
        }
    }

    fn report_shutdown(&self, reason: &ShutdownReason) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(request_id) = &session.last_request_id else {
            tracing::debug!(reason = %reason, "Shutdown before any invoke, nothing to report");
            return;
        };

        let event = NormalizedEvent::builder(Utc::now())
            .field(FIELD_EXTENSION_TYPE, format!("platform.{reason}"))
            .field(FIELD_REQUEST_ID, request_id.as_str())
            .field(
                FIELD_INVOKED_FUNCTION_ARN,
                session.last_function_arn.clone().unwrap_or_default(),
            )
            .build();

        tracing::debug!(reason = %reason, request_id = %request_id, "Sending shutdown reason");
        self.sink.submit(event);
    }
}
