//! Logs API subscription client.
//!
//! Asks the platform to push log batches to the local receiver. The
//! subscription is made once at startup and has no further lifecycle.

use crate::config::LogsApiConfig;
use crate::extension::{EXTENSION_ID_HEADER, with_scheme};
use reqwest::Client;
use serde::{Deserialize, Serialize};

const API_VERSION_PATH: &str = "/2020-08-15";

/// Kinds of log records the Logs API can push.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Platform records (start, end, report, ...).
    Platform,
    /// Function output from stdout/stderr.
    Function,
}

/// Buffering configuration forwarded to the Logs API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferingConfig {
    /// Maximum time in milliseconds to buffer before sending.
    pub timeout_ms: u32,
    /// Maximum size in bytes to buffer before sending.
    pub max_bytes: u64,
    /// Maximum number of records to buffer before sending.
    pub max_items: u64,
}

impl From<&LogsApiConfig> for BufferingConfig {
    fn from(config: &LogsApiConfig) -> Self {
        Self {
            timeout_ms: config.timeout_ms,
            max_bytes: config.max_bytes,
            max_items: config.max_items,
        }
    }
}

/// Where the Logs API pushes batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Protocol to use (HTTP only supported).
    pub protocol: String,
    /// URI to send batches to.
    #[serde(rename = "URI")]
    pub uri: String,
}

/// Subscription request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
    /// Destination for batches.
    pub destination: DestinationConfig,
    /// Record kinds to subscribe to.
    pub types: Vec<RecordKind>,
    /// Buffering configuration.
    pub buffering: BufferingConfig,
}

impl SubscriptionRequest {
    /// Creates a subscription request for the given listener.
    pub fn new(
        listener_uri: impl Into<String>,
        types: Vec<RecordKind>,
        buffering: BufferingConfig,
    ) -> Self {
        Self {
            destination: DestinationConfig {
                protocol: "HTTP".to_string(),
                uri: listener_uri.into(),
            },
            types,
            buffering,
        }
    }

    /// Builds the request described by the logs API configuration.
    pub fn from_config(listener_uri: impl Into<String>, config: &LogsApiConfig) -> Self {
        let types = if config.disable_platform_messages {
            vec![RecordKind::Function]
        } else {
            vec![RecordKind::Platform, RecordKind::Function]
        };
        Self::new(listener_uri, types, BufferingConfig::from(config))
    }
}

/// Acknowledgement returned by a successful subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    /// Response body, usually a short confirmation message.
    pub message: String,
}

/// Errors from the subscription call.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// HTTP request failed.
    #[error("logs subscription request failed")]
    Transport(#[from] reqwest::Error),

    /// The Logs API answered with an error status.
    #[error("logs subscription failed with status {status}: {body}")]
    Status {
        /// HTTP status code returned by the API.
        status: u16,
        /// Response body.
        body: String,
    },

    /// No extension identifier was supplied.
    #[error("an extension identifier is required to subscribe")]
    MissingIdentifier,
}

/// HTTP client for the Logs API.
#[derive(Debug, Clone)]
pub struct LogsClient {
    base_url: String,
    http: Client,
}

impl LogsClient {
    /// Creates a client for the given runtime API address.
    pub fn new(runtime_api: &str) -> Self {
        Self {
            base_url: format!("{}{}", with_scheme(runtime_api), API_VERSION_PATH),
            http: Client::new(),
        }
    }

    /// Subscribes the listener described by `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty, the request fails, or the
    /// API answers with a status of 400 or above.
    pub async fn subscribe(
        &self,
        extension_id: &str,
        request: &SubscriptionRequest,
    ) -> Result<SubscribeAck, SubscriptionError> {
        if extension_id.is_empty() {
            return Err(SubscriptionError::MissingIdentifier);
        }

        let response = self
            .http
            .put(format!("{}/logs", self.base_url))
            .header(EXTENSION_ID_HEADER, extension_id)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let message = response.text().await?;

        if status.as_u16() >= 400 {
            return Err(SubscriptionError::Status {
                status: status.as_u16(),
                body: message,
            });
        }

        tracing::debug!(
            destination = %request.destination.uri,
            types = ?request.types,
            "Subscribed to Logs API"
        );
        Ok(SubscribeAck { message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[test]
    fn test_subscription_request_serialization() {
        let request = SubscriptionRequest::from_config(
            "http://sandbox.localdomain:3000",
            &LogsApiConfig::default(),
        );

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "destination": { "protocol": "HTTP", "URI": "http://sandbox.localdomain:3000" },
                "types": ["platform", "function"],
                "buffering": { "timeoutMs": 1000, "maxBytes": 262144, "maxItems": 1000 }
            })
        );
    }

    #[test]
    fn test_disable_platform_messages() {
        let config = LogsApiConfig {
            disable_platform_messages: true,
            ..Default::default()
        };
        let request = SubscriptionRequest::from_config("http://127.0.0.1:3000", &config);
        assert_eq!(request.types, vec![RecordKind::Function]);
    }

    #[tokio::test]
    async fn test_subscribe() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/2020-08-15/logs")
            .match_header(EXTENSION_ID_HEADER, "test-identifier")
            .match_body(Matcher::PartialJson(json!({
                "destination": { "protocol": "HTTP", "URI": "http://127.0.0.1:3000" },
                "buffering": { "maxItems": 1000 }
            })))
            .with_status(200)
            .with_body("OK")
            .expect(1)
            .create_async()
            .await;

        let client = LogsClient::new(&server.host_with_port());
        let request =
            SubscriptionRequest::from_config("http://127.0.0.1:3000", &LogsApiConfig::default());
        let ack = client.subscribe("test-identifier", &request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(ack.message, "OK");
    }

    #[tokio::test]
    async fn test_subscribe_error_status() {
        let mut server = Server::new_async().await;
        server
            .mock("PUT", "/2020-08-15/logs")
            .with_status(400)
            .with_body("bad request")
            .create_async()
            .await;

        let client = LogsClient::new(&server.url());
        let request =
            SubscriptionRequest::from_config("http://127.0.0.1:3000", &LogsApiConfig::default());
        let result = client.subscribe("test-identifier", &request).await;

        match result {
            Err(SubscriptionError::Status { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad request");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_requires_identifier() {
        let client = LogsClient::new("127.0.0.1:1");
        let request =
            SubscriptionRequest::from_config("http://127.0.0.1:3000", &LogsApiConfig::default());
        let result = client.subscribe("", &request).await;
        assert!(matches!(result, Err(SubscriptionError::MissingIdentifier)));
    }
}
