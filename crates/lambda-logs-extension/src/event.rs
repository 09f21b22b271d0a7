//! Normalized telemetry events handed to the event sink.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::num::NonZeroU64;

/// Field carrying the originating record kind (`platform.start`, `function`, ...).
pub const FIELD_TYPE: &str = "type";
/// Field carrying the raw envelope time when it could not be parsed.
pub const FIELD_ENVELOPE_TIME: &str = "extension.time";
/// Field carrying the kind of a diagnostic event synthesized by the extension.
pub const FIELD_EXTENSION_TYPE: &str = "extension.type";
/// Field carrying the last request ID in a shutdown diagnostic event.
pub const FIELD_REQUEST_ID: &str = "requestId";
/// Field carrying the last invoked function ARN in a shutdown diagnostic event.
pub const FIELD_INVOKED_FUNCTION_ARN: &str = "invokedFunctionArn";
/// Field holding a plain-text log line.
pub const FIELD_RECORD: &str = "record";

/// A uniform, timestamped event ready for delivery.
///
/// Events are immutable once built; ownership moves to the sink on submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    fields: Map<String, Value>,
    timestamp: DateTime<Utc>,
    sample_weight: NonZeroU64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dedup_key: Option<String>,
}

impl NormalizedEvent {
    /// Starts building an event with the given timestamp.
    pub fn builder(timestamp: DateTime<Utc>) -> EventBuilder {
        EventBuilder {
            fields: Map::new(),
            timestamp,
            sample_weight: NonZeroU64::MIN,
            dedup_key: None,
        }
    }

    /// Returns the event fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns a single field value.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns how many real occurrences this event represents.
    pub fn sample_weight(&self) -> NonZeroU64 {
        self.sample_weight
    }

    /// Returns the opaque key carried for the sink, if any.
    pub fn dedup_key(&self) -> Option<&str> {
        self.dedup_key.as_deref()
    }
}

/// Builder for [`NormalizedEvent`].
#[must_use = "builders do nothing unless .build() is called"]
#[derive(Debug, Clone)]
pub struct EventBuilder {
    fields: Map<String, Value>,
    timestamp: DateTime<Utc>,
    sample_weight: NonZeroU64,
    dedup_key: Option<String>,
}

impl EventBuilder {
    /// Sets a single field, replacing any previous value.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Merges all top-level entries of a JSON object into the fields.
    pub fn fields(mut self, entries: Map<String, Value>) -> Self {
        self.fields.extend(entries);
        self
    }

    /// Sets the sample weight.
    pub fn sample_weight(mut self, weight: NonZeroU64) -> Self {
        self.sample_weight = weight;
        self
    }

    /// Sets the opaque dedup key.
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Finishes the event.
    pub fn build(self) -> NormalizedEvent {
        NormalizedEvent {
            fields: self.fields,
            timestamp: self.timestamp,
            sample_weight: self.sample_weight,
            dedup_key: self.dedup_key,
        }
    }
}
