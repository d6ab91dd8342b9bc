//! The canonical notification shape and timestamp normalization.

// Rust guideline compliant 2026-02

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A single user notification.
///
/// Identity is the server-assigned `id`. Everything except `read` and
/// `created_at` is opaque to the engine and passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Server-assigned identifier, unique within the cache.
    pub id: String,
    /// Semantic category tag (e.g. "order_update").
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload. The server calls this field `data`.
    #[serde(rename = "data", default)]
    pub payload: serde_json::Value,
    /// Whether the user has seen it.
    #[serde(default)]
    pub read: bool,
    /// Creation instant, normalized to UTC.
    pub created_at: DateTime<Utc>,
    /// Server-defined status tag.
    #[serde(default)]
    pub status: String,
}

/// Naive formats the backend emits without an offset. Interpreted as UTC.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse a timestamp string into a comparable instant.
///
/// Accepts RFC 3339 (`2024-05-01T10:00:00Z`, `...+07:00`) and the offset-less
/// ISO form .NET serializers produce (`2024-05-01T10:00:00.1234567`).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse a JSON timestamp: a string, or a number of epoch milliseconds.
pub fn timestamp_from_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => parse_timestamp(s),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rfc3339_utc() {
        let ts = parse_timestamp("2024-05-01T10:00:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_parse_rfc3339_with_offset_normalizes() {
        let ts = parse_timestamp("2024-05-01T17:00:00+07:00").unwrap();
        assert_eq!(ts, parse_timestamp("2024-05-01T10:00:00Z").unwrap());
    }

    #[test]
    fn test_parse_dotnet_naive_as_utc() {
        let ts = parse_timestamp("2024-05-01T10:00:00.1234567").unwrap();
        assert_eq!(ts.timestamp(), parse_timestamp("2024-05-01T10:00:00Z").unwrap().timestamp());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_timestamp_from_epoch_millis() {
        let ts = timestamp_from_value(&serde_json::json!(1_714_557_600_000_i64)).unwrap();
        assert_eq!(ts, parse_timestamp("2024-05-01T10:00:00Z").unwrap());
        assert!(timestamp_from_value(&serde_json::json!(true)).is_none());
    }

    #[test]
    fn test_serializes_with_server_field_names() {
        let n = Notification {
            id: "n1".into(),
            kind: "order".into(),
            payload: serde_json::json!("hello"),
            read: false,
            created_at: parse_timestamp("2024-05-01T10:00:00Z").unwrap(),
            status: "sent".into(),
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "order");
        assert_eq!(json["data"], "hello");
        assert!(json.get("createdAt").is_some());
    }
}
