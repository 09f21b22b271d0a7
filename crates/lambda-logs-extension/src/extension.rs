//! Extensions API client.
//!
//! Registers the process as an external extension and long-polls for
//! lifecycle events. The long-poll has no client-side timeout; the platform
//! may legitimately hold it open for as long as the environment is frozen, so
//! the only way out of a pending poll is the cancellation token.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

const API_VERSION_PATH: &str = "/2020-01-01/extension";
const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
/// Header carrying the extension identifier on every call after registration.
pub const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// Errors from the registration call.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// HTTP request failed.
    #[error("register request failed")]
    Transport(#[from] reqwest::Error),

    /// The Extensions API answered with a non-success status.
    #[error("register request failed with status {status}")]
    Status {
        /// HTTP status code returned by the API.
        status: u16,
    },

    /// The response body was not valid registration metadata.
    #[error("failed to decode register response")]
    Decode(#[source] serde_json::Error),

    /// The call succeeded but no extension identifier was returned.
    #[error("no extension identifier returned on registration")]
    MissingIdentifier,
}

/// Errors from polling the next lifecycle event.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// The poll was abandoned because the process is shutting down.
    #[error("poll cancelled")]
    Cancelled,

    /// HTTP request failed.
    #[error("next event request failed")]
    Transport(#[from] reqwest::Error),

    /// The Extensions API answered with a non-success status.
    #[error("next event request failed with status {status}")]
    Status {
        /// HTTP status code returned by the API.
        status: u16,
    },

    /// The response body was not a lifecycle event.
    #[error("failed to decode next event response")]
    Decode(#[source] serde_json::Error),

    /// Polling was attempted before a successful registration.
    #[error("extension is not registered")]
    NotRegistered,
}

impl PollError {
    /// Returns true if this outcome is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PollError::Cancelled)
    }
}

/// Function metadata returned on registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Identifier to present on all subsequent calls.
    pub extension_id: String,
    /// Name of the function this environment runs.
    pub function_name: String,
    /// Version of the function.
    pub function_version: String,
    /// Handler of the function.
    pub handler: String,
}

/// Why the execution environment is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Normal teardown.
    Spindown,
    /// The function timed out.
    Timeout,
    /// The function or runtime failed.
    Failure,
    /// A reason this client does not know, lower-cased.
    Other(String),
}

impl ShutdownReason {
    /// Parses a reason case-insensitively.
    pub fn parse(reason: &str) -> Self {
        match reason.to_ascii_lowercase().as_str() {
            "spindown" => Self::Spindown,
            "timeout" => Self::Timeout,
            "failure" => Self::Failure,
            "" => Self::Other("unknown".to_string()),
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the lower-case name of the reason.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Spindown => "spindown",
            Self::Timeout => "timeout",
            Self::Failure => "failure",
            Self::Other(reason) => reason,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event delivered by the long-poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A function invocation is starting.
    Invoke {
        /// Request ID of the invocation.
        request_id: String,
        /// ARN the function was invoked with.
        function_arn: String,
        /// Invocation deadline in milliseconds since the epoch.
        deadline_ms: i64,
    },
    /// The environment is being torn down.
    Shutdown {
        /// Why the environment is shutting down.
        reason: ShutdownReason,
    },
    /// An event type this client does not handle.
    Unknown(String),
}

/// The operations the lifecycle coordinator needs from the Extensions API.
pub trait ExtensionApi: Send {
    /// Registers for `INVOKE` and `SHUTDOWN` events.
    fn register(&mut self) -> impl Future<Output = Result<Registration, RegistrationError>> + Send;

    /// Blocks until the next lifecycle event or until `cancel` fires.
    fn next_event(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<LifecycleEvent, PollError>> + Send;
}

/// HTTP client for the Extensions API.
#[derive(Debug, Clone)]
pub struct ExtensionClient {
    base_url: String,
    extension_name: String,
    http: Client,
    extension_id: Option<String>,
}

impl ExtensionClient {
    /// Creates a client for the given runtime API address.
    ///
    /// `runtime_api` is usually a bare `host:port`; `http://` is assumed when
    /// no scheme is present.
    pub fn new(runtime_api: &str, extension_name: impl Into<String>) -> Self {
        Self {
            base_url: format!("{}{}", with_scheme(runtime_api), API_VERSION_PATH),
            extension_name: extension_name.into(),
            http: Client::new(),
            extension_id: None,
        }
    }

    /// Returns the identifier assigned on registration.
    pub fn extension_id(&self) -> Option<&str> {
        self.extension_id.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn poll(&self, extension_id: &str) -> Result<LifecycleEvent, PollError> {
        let response = self
            .http
            .get(self.url("/event/next"))
            .header(EXTENSION_ID_HEADER, extension_id)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let next: NextEventResponse = serde_json::from_slice(&body).map_err(PollError::Decode)?;
        Ok(next.into())
    }
}

impl ExtensionApi for ExtensionClient {
    async fn register(&mut self) -> Result<Registration, RegistrationError> {
        let response = self
            .http
            .post(self.url("/register"))
            .header(EXTENSION_NAME_HEADER, &self.extension_name)
            .json(&json!({ "events": ["INVOKE", "SHUTDOWN"] }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistrationError::Status {
                status: status.as_u16(),
            });
        }

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = response.bytes().await?;
        let metadata: RegisterResponse =
            serde_json::from_slice(&body).map_err(RegistrationError::Decode)?;

        if extension_id.is_empty() {
            return Err(RegistrationError::MissingIdentifier);
        }

        tracing::debug!(
            function_name = %metadata.function_name,
            function_version = %metadata.function_version,
            handler = %metadata.handler,
            "Registered with Extensions API"
        );

        self.extension_id = Some(extension_id.clone());
        Ok(Registration {
            extension_id,
            function_name: metadata.function_name,
            function_version: metadata.function_version,
            handler: metadata.handler,
        })
    }

    async fn next_event(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<LifecycleEvent, PollError> {
        let extension_id = self
            .extension_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(PollError::NotRegistered)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PollError::Cancelled),
            result = self.poll(extension_id) => result,
        }
    }
}

pub(crate) fn with_scheme(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", address.trim_end_matches('/'))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RegisterResponse {
    function_name: String,
    function_version: String,
    handler: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NextEventResponse {
    event_type: String,
    deadline_ms: i64,
    request_id: String,
    invoked_function_arn: String,
    shutdown_reason: String,
}

impl From<NextEventResponse> for LifecycleEvent {
    fn from(response: NextEventResponse) -> Self {
        match response.event_type.as_str() {
            "INVOKE" => LifecycleEvent::Invoke {
                request_id: response.request_id,
                function_arn: response.invoked_function_arn,
                deadline_ms: response.deadline_ms,
            },
            "SHUTDOWN" => LifecycleEvent::Shutdown {
                reason: ShutdownReason::parse(&response.shutdown_reason),
            },
            _ => LifecycleEvent::Unknown(response.event_type),
        }
    }
}
