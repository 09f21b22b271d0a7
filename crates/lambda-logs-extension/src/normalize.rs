//! Log normalization.
//!
//! Converts one raw log record pushed by the Logs API into exactly one
//! [`NormalizedEvent`]. Records arrive in several shapes, each with its own
//! timestamp and sample-weight inference:
//!
//! - plain text written by the function to stdout/stderr;
//! - a JSON object written by the function, optionally wrapping its real
//!   fields under `data` (the envelope produced by telemetry clients);
//! - a structured map produced by the platform (`platform.start`,
//!   `platform.report`, ...).
//!
//! Nothing in here fails: every unparseable input degrades to a fallback
//! value (current time, weight of 1, or the raw string).

use crate::event::{FIELD_ENVELOPE_TIME, FIELD_RECORD, FIELD_TYPE, NormalizedEvent};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::num::NonZeroU64;

/// A single record as delivered by the Logs API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLogRecord {
    /// Record kind, e.g. `function` or `platform.report`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Provider-supplied RFC 3339 time of the record.
    #[serde(rename = "time", default)]
    pub occurred_at: String,
    /// Record payload: a string or a structured map.
    #[serde(rename = "record", default)]
    pub payload: Value,
}

impl RawLogRecord {
    /// Creates a record from its parts.
    pub fn new(kind: impl Into<String>, occurred_at: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            occurred_at: occurred_at.into(),
            payload,
        }
    }
}

/// The payload shape, resolved once at normalization entry.
#[derive(Debug)]
enum Payload {
    /// A string that is not a JSON object.
    Text(String),
    /// A string that decoded to a JSON object.
    Json(Map<String, Value>),
    /// A map produced by the platform.
    Structured(Map<String, Value>),
    /// Any other JSON value.
    Other(Value),
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::String(line) => match serde_json::from_str::<Map<String, Value>>(&line) {
                Ok(obj) => Payload::Json(obj),
                Err(_) => Payload::Text(line),
            },
            Value::Object(map) => Payload::Structured(map),
            other => Payload::Other(other),
        }
    }
}

/// Normalizes a record using the current wall-clock time for fallbacks.
pub fn normalize(record: RawLogRecord) -> NormalizedEvent {
    normalize_at(record, Utc::now())
}

/// Normalizes a record, using `now` wherever a timestamp cannot be inferred.
pub fn normalize_at(record: RawLogRecord, now: DateTime<Utc>) -> NormalizedEvent {
    let RawLogRecord {
        kind,
        occurred_at,
        payload,
    } = record;

    let mut fields = Map::new();

    let builder = match Payload::from(payload) {
        Payload::Text(line) => {
            let timestamp = resolve_envelope_timestamp(&occurred_at, &mut fields, now);
            fields.insert(FIELD_RECORD.to_string(), Value::String(line));
            NormalizedEvent::builder(timestamp)
        }
        Payload::Json(mut obj) => {
            let timestamp = resolve_function_timestamp(&occurred_at, &obj, now);
            let weight = resolve_sample_weight(&obj);
            let dedup_key = obj.get("name").and_then(dedup_key);

            let entries = match obj.remove("data") {
                Some(Value::Object(data)) => data,
                Some(other) => {
                    obj.insert("data".to_string(), other);
                    obj
                }
                None => obj,
            };
            fields.extend(entries);

            let builder = NormalizedEvent::builder(timestamp).sample_weight(weight);
            match dedup_key {
                Some(key) => builder.dedup_key(key),
                None => builder,
            }
        }
        Payload::Structured(map) => {
            let timestamp = resolve_envelope_timestamp(&occurred_at, &mut fields, now);
            fields.extend(map);
            NormalizedEvent::builder(timestamp)
        }
        Payload::Other(value) => {
            let timestamp = resolve_envelope_timestamp(&occurred_at, &mut fields, now);
            fields.insert(FIELD_RECORD.to_string(), value);
            NormalizedEvent::builder(timestamp)
        }
    };

    builder.fields(fields).field(FIELD_TYPE, kind).build()
}

/// Parses the envelope time of a record.
///
/// On failure the raw value is recorded under `extension.time` in `fields`
/// and `now` is returned.
pub fn resolve_envelope_timestamp(
    occurred_at: &str,
    fields: &mut Map<String, Value>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match parse_rfc3339(occurred_at) {
        Some(timestamp) => timestamp,
        None => {
            fields.insert(
                FIELD_ENVELOPE_TIME.to_string(),
                Value::String(occurred_at.to_string()),
            );
            now
        }
    }
}

/// Infers the timestamp of a structured function log.
///
/// First match wins: `time`, then `timestamp` (both RFC 3339 strings), then
/// the envelope time (or `now`, silently) minus `duration_ms` when present,
/// then the envelope time alone.
pub fn resolve_function_timestamp(
    occurred_at: &str,
    obj: &Map<String, Value>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    for key in ["time", "timestamp"] {
        if let Some(timestamp) = obj.get(key).and_then(Value::as_str).and_then(parse_rfc3339) {
            return timestamp;
        }
    }

    let base = parse_rfc3339(occurred_at).unwrap_or(now);

    obj.get("duration_ms")
        .and_then(as_float)
        .and_then(|ms| {
            let nanos = ms * 1_000_000.0;
            if nanos.abs() >= i64::MAX as f64 {
                return None;
            }
            base.checked_sub_signed(TimeDelta::nanoseconds(nanos as i64))
        })
        .unwrap_or(base)
}

/// Reads `samplerate` as a positive integer, defaulting to 1.
pub fn resolve_sample_weight(obj: &Map<String, Value>) -> NonZeroU64 {
    obj.get("samplerate")
        .and_then(as_integer)
        .and_then(|rate| u64::try_from(rate).ok())
        .and_then(NonZeroU64::new)
        .unwrap_or(NonZeroU64::MIN)
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

fn as_float(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|n| n as i64)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>().ok().or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
                    .map(|n| n as i64)
            })
        }
        _ => None,
    }
}

fn dedup_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(name) => Some(name.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ENVELOPE_TIME: &str = "2020-11-03T21:10:25.150Z";

    fn ts(value: &str) -> DateTime<Utc> {
        parse_rfc3339(value).unwrap()
    }

    fn fixed_now() -> DateTime<Utc> {
        ts("2024-01-01T00:00:00Z")
    }

    fn function_record(payload: &str) -> RawLogRecord {
        RawLogRecord::new("function", ENVELOPE_TIME, json!(payload))
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_plain_text_keeps_line_and_envelope_time() {
        let event = normalize_at(function_record("A basic message to STDOUT"), fixed_now());

        assert_eq!(
            event.field("record"),
            Some(&json!("A basic message to STDOUT"))
        );
        assert_eq!(event.field("type"), Some(&json!("function")));
        assert_eq!(event.timestamp(), ts(ENVELOPE_TIME));
        assert_eq!(event.sample_weight().get(), 1);
        assert!(event.field(FIELD_ENVELOPE_TIME).is_none());
    }

    #[test]
    fn test_plain_text_with_bad_envelope_time_records_diagnostic() {
        let record = RawLogRecord::new("function", "yesterday", json!("hello"));
        let event = normalize_at(record, fixed_now());

        assert_eq!(event.timestamp(), fixed_now());
        assert_eq!(event.field(FIELD_ENVELOPE_TIME), Some(&json!("yesterday")));
    }

    #[test]
    fn test_json_array_string_is_plain_text() {
        let event = normalize_at(function_record("[1, 2, 3]"), fixed_now());

        assert_eq!(event.field("record"), Some(&json!("[1, 2, 3]")));
        assert_eq!(event.fields().len(), 2);
    }

    #[test]
    fn test_structured_function_log_fields() {
        let event = normalize_at(
            function_record(r#"{"foo": "bar", "count": 3, "type": "ignored"}"#),
            fixed_now(),
        );

        assert_eq!(event.field("foo"), Some(&json!("bar")));
        assert_eq!(event.field("count"), Some(&json!(3)));
        assert_eq!(event.field("type"), Some(&json!("function")));
        assert_eq!(event.timestamp(), ts(ENVELOPE_TIME));
    }

    #[test]
    fn test_duration_is_subtracted_from_envelope_time() {
        let event = normalize_at(
            function_record(r#"{"foo": "bar", "duration_ms": 54}"#),
            fixed_now(),
        );

        assert_eq!(
            event.timestamp(),
            ts(ENVELOPE_TIME) - TimeDelta::milliseconds(54)
        );
    }

    #[test]
    fn test_duration_accepts_float_and_numeric_string() {
        let float = normalize_at(function_record(r#"{"duration_ms": 12.5}"#), fixed_now());
        assert_eq!(
            float.timestamp(),
            ts(ENVELOPE_TIME) - TimeDelta::microseconds(12_500)
        );

        let string = normalize_at(function_record(r#"{"duration_ms": "54"}"#), fixed_now());
        assert_eq!(
            string.timestamp(),
            ts(ENVELOPE_TIME) - TimeDelta::milliseconds(54)
        );
    }

    #[test]
    fn test_unparseable_duration_is_ignored() {
        let event = normalize_at(
            function_record(r#"{"foo": "bar", "duration_ms": "54ms"}"#),
            fixed_now(),
        );

        assert_eq!(event.timestamp(), ts(ENVELOPE_TIME));
        assert_eq!(event.field("duration_ms"), Some(&json!("54ms")));
    }

    #[test]
    fn test_timestamp_takes_precedence_over_duration() {
        let event = normalize_at(
            function_record(
                r#"{"duration_ms": 54, "timestamp": "2020-11-03T21:10:25.090Z"}"#,
            ),
            fixed_now(),
        );

        assert_eq!(event.timestamp(), ts("2020-11-03T21:10:25.090Z"));
    }

    #[test]
    fn test_nested_time_takes_precedence_over_everything() {
        let event = normalize_at(
            function_record(
                r#"{"time": "2020-11-03T21:10:24.000Z", "timestamp": "2020-11-03T21:10:25.090Z", "duration_ms": 54}"#,
            ),
            fixed_now(),
        );

        assert_eq!(event.timestamp(), ts("2020-11-03T21:10:24.000Z"));
    }

    #[test]
    fn test_unparseable_time_falls_through_to_timestamp() {
        let obj = object(json!({"time": "soon", "timestamp": "2020-11-03T21:10:25.090Z"}));
        assert_eq!(
            resolve_function_timestamp(ENVELOPE_TIME, &obj, fixed_now()),
            ts("2020-11-03T21:10:25.090Z")
        );
    }

    #[test]
    fn test_function_timestamp_bad_envelope_falls_back_silently() {
        let record = RawLogRecord::new("function", "not-a-time", json!(r#"{"duration_ms": 1000}"#));
        let event = normalize_at(record, fixed_now());

        assert_eq!(event.timestamp(), fixed_now() - TimeDelta::seconds(1));
        assert!(event.field(FIELD_ENVELOPE_TIME).is_none());
    }

    #[test]
    fn test_data_envelope_only_keeps_data_fields() {
        let payload = json!({
            "time": "2020-11-03T21:10:24.000Z",
            "samplerate": 10,
            "dataset": "ignored",
            "name": "span-name",
            "data": {"trace.trace_id": "abc", "duration_ms": 12}
        })
        .to_string();
        let event = normalize_at(function_record(&payload), fixed_now());

        assert_eq!(event.field("trace.trace_id"), Some(&json!("abc")));
        assert_eq!(event.field("duration_ms"), Some(&json!(12)));
        assert_eq!(event.field("type"), Some(&json!("function")));
        assert!(event.field("dataset").is_none());
        assert!(event.field("samplerate").is_none());
        assert_eq!(event.fields().len(), 3);
        assert_eq!(event.timestamp(), ts("2020-11-03T21:10:24.000Z"));
        assert_eq!(event.sample_weight().get(), 10);
        assert_eq!(event.dedup_key(), Some("span-name"));
    }

    #[test]
    fn test_non_object_data_is_kept_as_field() {
        let event = normalize_at(function_record(r#"{"data": "payload"}"#), fixed_now());
        assert_eq!(event.field("data"), Some(&json!("payload")));
    }

    #[test]
    fn test_sample_weight_fallbacks() {
        let fallbacks = [
            json!(null),
            json!(0),
            json!(-3),
            json!("not-a-number"),
            json!(0.5),
        ];
        for samplerate in fallbacks {
            let obj = object(json!({ "samplerate": samplerate }));
            assert_eq!(
                resolve_sample_weight(&obj).get(),
                1,
                "samplerate {samplerate}"
            );
        }
        assert_eq!(resolve_sample_weight(&Map::new()).get(), 1);
    }

    #[test]
    fn test_sample_weight_parses_numbers_and_strings() {
        let cases = [
            (json!(5), 5),
            (json!(7.9), 7),
            (json!("20"), 20),
            (json!("3.0"), 3),
        ];
        for (samplerate, expected) in cases {
            let obj = object(json!({ "samplerate": samplerate }));
            assert_eq!(resolve_sample_weight(&obj).get(), expected);
        }
    }

    #[test]
    fn test_platform_record_uses_envelope_time() {
        let record = RawLogRecord::new(
            "platform.start",
            "2020-11-03T21:10:25.133Z",
            json!({
                "requestId": "6d67e385-053d-4622-a56f-b25bcef23083",
                "version": "$LATEST",
                "timestamp": "2020-11-03T21:10:25.150Z"
            }),
        );
        let event = normalize_at(record, fixed_now());

        assert_eq!(event.timestamp(), ts("2020-11-03T21:10:25.133Z"));
        assert_eq!(event.field("version"), Some(&json!("$LATEST")));
        assert_eq!(event.field("type"), Some(&json!("platform.start")));
    }

    #[test]
    fn test_platform_record_bad_time_records_diagnostic() {
        let record = RawLogRecord::new("platform.report", "", json!({"requestId": "1"}));
        let event = normalize_at(record, fixed_now());

        assert_eq!(event.timestamp(), fixed_now());
        assert_eq!(event.field(FIELD_ENVELOPE_TIME), Some(&json!("")));
        assert_eq!(event.field("requestId"), Some(&json!("1")));
    }

    #[test]
    fn test_non_string_non_object_payload() {
        let record = RawLogRecord::new("extension", ENVELOPE_TIME, json!([1, 2]));
        let event = normalize_at(record, fixed_now());

        assert_eq!(event.field("record"), Some(&json!([1, 2])));
        assert_eq!(event.timestamp(), ts(ENVELOPE_TIME));
    }

    #[test]
    fn test_non_string_name_is_stringified() {
        let event = normalize_at(function_record(r#"{"name": 42}"#), fixed_now());
        assert_eq!(event.dedup_key(), Some("42"));
    }

    #[test]
    fn test_deserialize_batch_preserves_order() {
        let body = r#"[
            {"type": "platform.start", "time": "2020-11-03T21:10:25.133Z", "record": {"requestId": "1"}},
            {"type": "function", "time": "2020-11-03T21:10:25.150Z", "record": "plain text"}
        ]"#;

        let records: Vec<RawLogRecord> = serde_json::from_str(body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, "platform.start");
        assert_eq!(records[1].payload, json!("plain text"));
    }
}
