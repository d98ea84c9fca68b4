//! Event validation - raw JSON to `Event`
//!
//! Pure: the caller supplies "now", nothing is read from the clock here.

use super::types::{Event, EventType};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

const MAX_IDENTIFIER_LEN: usize = 128;

/// Wire form of an event. Kept as untyped JSON so missing and mistyped
/// fields are reported by `validate`, not by serde.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawEvent(pub Value);

impl RawEvent {
    /// Best-effort event id for status reporting, even when validation fails
    pub fn event_id_hint(&self) -> Option<String> {
        self.0
            .get("event_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

impl From<Value> for RawEvent {
    fn from(value: Value) -> Self {
        RawEvent(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid `{field}`: {reason}")]
    InvalidType { field: &'static str, reason: String },

    #[error("timestamp {timestamp} outside accepted range [{earliest}, {latest}]")]
    TimestampOutOfRange {
        timestamp: DateTime<Utc>,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
}

impl ValidationError {
    /// Stable label used in responses and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::InvalidType { .. } => "invalid_type",
            ValidationError::TimestampOutOfRange { .. } => "timestamp_out_of_range",
        }
    }

    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidType {
            field,
            reason: reason.into(),
        }
    }
}

/// Acceptance window and shape limits
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    /// Tolerated clock skew into the future (inclusive)
    pub max_skew: Duration,
    /// Oldest accepted event age (inclusive)
    pub max_past: Duration,
    pub max_metadata_entries: usize,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_skew: Duration::seconds(5),
            max_past: Duration::days(7),
            max_metadata_entries: 32,
        }
    }
}

/// Validate and normalize a raw event against `policy` at instant `now`
pub fn validate(
    raw: &RawEvent,
    policy: &ValidationPolicy,
    now: DateTime<Utc>,
) -> Result<Event, ValidationError> {
    let object = raw
        .0
        .as_object()
        .ok_or_else(|| ValidationError::invalid("event", "expected a JSON object"))?;

    let event_id = identifier(object.get("event_id"), "event_id")?;
    let campaign_id = identifier(object.get("campaign_id"), "campaign_id")?;

    let event_type = match present(object.get("event_type"), "event_type")? {
        Value::String(s) => EventType::parse(s).ok_or_else(|| {
            ValidationError::invalid("event_type", format!("unknown event type '{}'", s))
        })?,
        other => {
            return Err(ValidationError::invalid(
                "event_type",
                format!("expected string, got {}", type_name(other)),
            ))
        }
    };

    let timestamp = parse_timestamp(present(object.get("timestamp"), "timestamp")?)?;

    let earliest = now - policy.max_past;
    let latest = now + policy.max_skew;
    if timestamp < earliest || timestamp > latest {
        return Err(ValidationError::TimestampOutOfRange {
            timestamp,
            earliest,
            latest,
        });
    }

    let metadata = parse_metadata(object.get("metadata"), policy.max_metadata_entries)?;

    Ok(Event {
        event_id,
        campaign_id,
        event_type,
        timestamp,
        metadata,
    })
}

/// Null and empty strings count as absent
fn present<'a>(value: Option<&'a Value>, field: &'static str) -> Result<&'a Value, ValidationError> {
    match value {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) if s.is_empty() => Err(ValidationError::MissingField(field)),
        Some(v) => Ok(v),
    }
}

fn identifier(value: Option<&Value>, field: &'static str) -> Result<String, ValidationError> {
    let s = match present(value, field)? {
        Value::String(s) => s,
        other => {
            return Err(ValidationError::invalid(
                field,
                format!("expected string, got {}", type_name(other)),
            ))
        }
    };

    if s.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::invalid(
            field,
            format!("longer than {} bytes", MAX_IDENTIFIER_LEN),
        ));
    }

    if !s
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':'))
    {
        return Err(ValidationError::invalid(
            field,
            "only [A-Za-z0-9_.:-] allowed",
        ));
    }

    Ok(s.clone())
}

/// RFC 3339 string or integer Unix milliseconds
fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, ValidationError> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ValidationError::invalid("timestamp", format!("not RFC 3339: {}", e))),
        Value::Number(n) => {
            let millis = n.as_i64().ok_or_else(|| {
                ValidationError::invalid("timestamp", "expected integer milliseconds")
            })?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| ValidationError::invalid("timestamp", "milliseconds out of range"))
        }
        other => Err(ValidationError::invalid(
            "timestamp",
            format!("expected string or integer, got {}", type_name(other)),
        )),
    }
}

fn parse_metadata(
    value: Option<&Value>,
    max_entries: usize,
) -> Result<BTreeMap<String, String>, ValidationError> {
    let object = match value {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(ValidationError::invalid(
                "metadata",
                format!("expected object, got {}", type_name(other)),
            ))
        }
    };

    if object.len() > max_entries {
        return Err(ValidationError::invalid(
            "metadata",
            format!("more than {} entries", max_entries),
        ));
    }

    object
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(ValidationError::invalid(
                        "metadata",
                        format!("value of '{}' must be scalar, got {}", key, type_name(other)),
                    ))
                }
            };
            Ok((key.clone(), rendered))
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SecondsFormat;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn raw_at(timestamp: DateTime<Utc>) -> RawEvent {
        RawEvent(json!({
            "event_id": "evt-1",
            "campaign_id": "C1",
            "event_type": "impression",
            "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        }))
    }

    #[test]
    fn test_valid_event_normalized() {
        let raw = RawEvent(json!({
            "event_id": "evt-1",
            "campaign_id": "C1",
            "event_type": "Click",
            "timestamp": "2024-06-01T11:59:00Z",
            "metadata": {"placement": "sidebar", "slot": 3, "viewable": true},
        }));

        let event = validate(&raw, &ValidationPolicy::default(), now()).unwrap();

        assert_eq!(event.event_id, "evt-1");
        assert_eq!(event.event_type, EventType::Click);
        assert_eq!(event.metadata.get("slot").map(String::as_str), Some("3"));
        assert_eq!(event.metadata.get("viewable").map(String::as_str), Some("true"));
    }

    fn raw_with_metadata(entries: usize) -> RawEvent {
        let metadata: serde_json::Map<String, Value> = (0..entries)
            .map(|i| (format!("key{:02}", i), json!(i)))
            .collect();
        RawEvent(json!({
            "event_id": "evt-meta",
            "campaign_id": "C1",
            "event_type": "impression",
            "timestamp": "2024-06-01T11:59:00Z",
            "metadata": metadata,
        }))
    }

    #[test]
    fn test_metadata_entry_limit() {
        let policy = ValidationPolicy::default();

        let at_limit = validate(&raw_with_metadata(32), &policy, now()).unwrap();
        assert_eq!(at_limit.metadata.len(), 32);
        assert_eq!(at_limit.metadata.get("key31").map(String::as_str), Some("31"));

        let err = validate(&raw_with_metadata(33), &policy, now()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidType { field: "metadata", .. }));
        assert_eq!(err.kind(), "invalid_type");
    }

    #[test]
    fn test_skew_boundary_is_inclusive() {
        let policy = ValidationPolicy::default();
        let edge = now() + policy.max_skew;

        assert!(validate(&raw_at(edge), &policy, now()).is_ok());

        let beyond = edge + Duration::microseconds(1);
        let err = validate(&raw_at(beyond), &policy, now()).unwrap_err();
        assert!(matches!(err, ValidationError::TimestampOutOfRange { .. }));
        assert_eq!(err.kind(), "timestamp_out_of_range");
    }

    #[test]
    fn test_past_boundary_is_inclusive() {
        let policy = ValidationPolicy::default();
        let edge = now() - policy.max_past;

        assert!(validate(&raw_at(edge), &policy, now()).is_ok());

        let before = edge - Duration::microseconds(1);
        assert!(matches!(
            validate(&raw_at(before), &policy, now()),
            Err(ValidationError::TimestampOutOfRange { .. })
        ));
    }

    #[test]
    fn test_missing_fields() {
        let policy = ValidationPolicy::default();

        let raw = RawEvent(json!({"campaign_id": "C1", "event_type": "click", "timestamp": 1}));
        assert_eq!(
            validate(&raw, &policy, now()),
            Err(ValidationError::MissingField("event_id"))
        );

        let raw = RawEvent(json!({"event_id": "", "campaign_id": "C1"}));
        assert_eq!(
            validate(&raw, &policy, now()),
            Err(ValidationError::MissingField("event_id"))
        );

        let raw = RawEvent(json!({"event_id": "e", "campaign_id": "C1", "event_type": "click"}));
        assert_eq!(
            validate(&raw, &policy, now()),
            Err(ValidationError::MissingField("timestamp"))
        );
    }

    #[test]
    fn test_invalid_types() {
        let policy = ValidationPolicy::default();
        let ts = now().timestamp_millis();

        let cases = vec![
            json!("not an object"),
            json!({"event_id": 42, "campaign_id": "C1", "event_type": "click", "timestamp": ts}),
            json!({"event_id": "has space", "campaign_id": "C1", "event_type": "click", "timestamp": ts}),
            json!({"event_id": "e", "campaign_id": "C1", "event_type": "conversion", "timestamp": ts}),
            json!({"event_id": "e", "campaign_id": "C1", "event_type": "click", "timestamp": 1.5}),
            json!({"event_id": "e", "campaign_id": "C1", "event_type": "click", "timestamp": "yesterday"}),
            json!({"event_id": "e", "campaign_id": "C1", "event_type": "click", "timestamp": ts, "metadata": [1]}),
            json!({"event_id": "e", "campaign_id": "C1", "event_type": "click", "timestamp": ts, "metadata": {"k": {"nested": 1}}}),
        ];

        for case in cases {
            let err = validate(&RawEvent(case.clone()), &policy, now()).unwrap_err();
            assert_eq!(err.kind(), "invalid_type", "case: {}", case);
        }
    }

    #[test]
    fn test_integer_millis_timestamp() {
        let raw = RawEvent(json!({
            "event_id": "evt-ms",
            "campaign_id": "C1",
            "event_type": "impression",
            "timestamp": now().timestamp_millis(),
        }));

        let event = validate(&raw, &ValidationPolicy::default(), now()).unwrap();
        assert_eq!(event.timestamp, now());
    }

    #[test]
    fn test_identifier_length_limit() {
        let raw = RawEvent(json!({
            "event_id": "x".repeat(MAX_IDENTIFIER_LEN + 1),
            "campaign_id": "C1",
            "event_type": "impression",
            "timestamp": now().timestamp_millis(),
        }));

        let err = validate(&raw, &ValidationPolicy::default(), now()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidType { field: "event_id", .. }));
    }

    #[test]
    fn test_event_id_hint() {
        let raw = RawEvent(json!({"event_id": "evt-9"}));
        assert_eq!(raw.event_id_hint().as_deref(), Some("evt-9"));
        assert_eq!(RawEvent(json!([1, 2])).event_id_hint(), None);
    }
}
