//! Field-level access to untyped telemetry documents.
//!
//! Documents come from several schema revisions, so every accessor here
//! probes a fixed list of aliases and coerces loosely typed values.

use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

/// One document as returned by a key-document store or mapped from a relational row.
pub type RawDocument = Map<String, Value>;

/// Timestamp candidates, probed in this order. The first non-null field wins.
pub const TIMESTAMP_FIELDS: [&str; 8] =
    ["timestamp", "updated_at", "updatedAt", "created_at", "createdAt", "ts", "time", "date"];

/// Fields naming a subject.
pub const NAME_FIELDS: [&str; 3] = ["name", "username", "display_name"];

/// Fields carrying the numeric points measure.
pub const MEASURE_FIELDS: [&str; 3] = ["points", "total_points", "score"];

/// Explicit per-user key fields.
pub const USER_KEY_FIELDS: [&str; 3] = ["user_id", "userId", "uid"];

/// Store-assigned document identifiers, never treated as entities or attributes.
pub const RESERVED_ID_FIELDS: [&str; 2] = ["_id", "id"];

pub const NAME_ATTRIBUTE: &str = "name";
pub const POINTS_ATTRIBUTE: &str = "points";

// Epoch values above this are milliseconds (1e11 seconds is roughly year 5138).
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

#[must_use]
pub fn is_reserved_field(field: &str) -> bool {
    RESERVED_ID_FIELDS.contains(&field) || TIMESTAMP_FIELDS.contains(&field)
}

/// First non-null value among `fields`, in the given order.
#[must_use]
pub fn first_present<'a>(document: &'a RawDocument, fields: &[&str]) -> Option<&'a Value> {
    fields.iter().find_map(|field| document.get(*field).filter(|value| !value.is_null()))
}

/// Render an identifier-like value as a key string.
///
/// Accepts non-empty strings, numbers and `{"$oid": ...}` wrappers.
#[must_use]
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Object(object) => object.get("$oid").and_then(key_string),
        _ => None,
    }
}

/// First non-empty string among `fields`.
#[must_use]
pub fn first_string(document: &RawDocument, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match document.get(*field) {
        Some(Value::String(raw)) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        _ => None,
    })
}

/// Coerce a JSON value to a finite number. Numeric strings are accepted.
#[must_use]
pub fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(raw) => raw.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

/// First field among `fields` whose value coerces to a number.
#[must_use]
pub fn first_number(document: &RawDocument, fields: &[&str]) -> Option<f64> {
    fields.iter().find_map(|field| document.get(*field).and_then(coerce_number))
}

#[must_use]
pub fn has_numeric_field(document: &RawDocument, fields: &[&str]) -> bool {
    fields.iter().any(|field| matches!(document.get(*field), Some(Value::Number(_))))
}

#[must_use]
pub fn has_any_field(document: &RawDocument, fields: &[&str]) -> bool {
    fields.iter().any(|field| document.get(*field).is_some_and(|value| !value.is_null()))
}

/// Resolve a document timestamp by probing [`TIMESTAMP_FIELDS`].
///
/// The first non-null candidate is authoritative: when it cannot be parsed the
/// document is treated as untimestamped rather than falling through to a later
/// candidate.
#[must_use]
pub fn probe_timestamp(document: &RawDocument) -> Option<OffsetDateTime> {
    first_present(document, &TIMESTAMP_FIELDS).and_then(parse_timestamp_value)
}

/// Parse one timestamp value in any of the accepted encodings.
#[must_use]
pub fn parse_timestamp_value(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(raw) => parse_timestamp_str(raw),
        Value::Number(number) => number.as_f64().and_then(from_epoch),
        Value::Object(object) => {
            object.get("$date").or_else(|| object.get("$numberLong")).and_then(parse_timestamp_value)
        }
        _ => None,
    }
}

/// Parse ISO-8601 text, a calendar date, or a numeric epoch string.
#[must_use]
pub fn parse_timestamp_str(raw: &str) -> Option<OffsetDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = match trimmed.strip_suffix('Z').or_else(|| trimmed.strip_suffix('z')) {
        Some(stem) => format!("{stem}+00:00"),
        None => trimmed.to_string(),
    };
    if let Ok(parsed) = OffsetDateTime::parse(&normalized, &Rfc3339) {
        return Some(parsed);
    }

    let naive_formats = [
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]"),
    ];
    for format in naive_formats {
        if let Ok(parsed) = PrimitiveDateTime::parse(trimmed, format) {
            return Some(parsed.assume_utc());
        }
    }

    if let Some(date) = parse_calendar_day(trimmed) {
        return Some(date.midnight().assume_utc());
    }

    trimmed.parse::<f64>().ok().and_then(from_epoch)
}

/// Parse a `YYYY-MM-DD` day string.
#[must_use]
pub fn parse_calendar_day(raw: &str) -> Option<Date> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]")).ok()
}

fn from_epoch(value: f64) -> Option<OffsetDateTime> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let seconds = if value > EPOCH_MILLIS_THRESHOLD { value / 1000.0 } else { value };
    #[allow(clippy::cast_possible_truncation)]
    let nanos = (seconds * 1_000_000_000.0).round() as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn doc(value: Value) -> RawDocument {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture must be an object: {other}"),
        }
    }

    // Test IDs: TDOC-001
    #[test]
    fn probe_respects_candidate_order() {
        let document = doc(json!({
            "date": "2024-01-05",
            "created_at": "2024-01-03T00:00:00Z",
            "updated_at": "2024-01-04T00:00:00Z"
        }));
        assert_eq!(probe_timestamp(&document), Some(datetime!(2024-01-04 0:00 UTC)));
    }

    // Test IDs: TDOC-002
    #[test]
    fn probe_skips_null_candidates() {
        let document = doc(json!({"timestamp": null, "ts": 1_704_067_200}));
        assert_eq!(probe_timestamp(&document), Some(datetime!(2024-01-01 0:00 UTC)));
    }

    // Test IDs: TDOC-003
    #[test]
    fn unparseable_first_candidate_leaves_document_untimestamped() {
        let document = doc(json!({"timestamp": "yesterday", "date": "2024-01-01"}));
        assert_eq!(probe_timestamp(&document), None);
    }

    // Test IDs: TDOC-004
    #[test]
    fn accepted_timestamp_encodings() {
        let cases = [
            (json!("2024-03-01T10:15:30Z"), datetime!(2024-03-01 10:15:30 UTC)),
            (json!("2024-03-01T17:15:30+07:00"), datetime!(2024-03-01 10:15:30 UTC)),
            (json!("2024-03-01T10:15:30.250"), datetime!(2024-03-01 10:15:30.25 UTC)),
            (json!("2024-03-01 10:15:30"), datetime!(2024-03-01 10:15:30 UTC)),
            (json!("2024-03-01"), datetime!(2024-03-01 0:00 UTC)),
            (json!(1_709_288_130), datetime!(2024-03-01 10:15:30 UTC)),
            (json!(1_709_288_130_000_i64), datetime!(2024-03-01 10:15:30 UTC)),
            (json!("1709288130"), datetime!(2024-03-01 10:15:30 UTC)),
            (json!({"$date": "2024-03-01T10:15:30Z"}), datetime!(2024-03-01 10:15:30 UTC)),
        ];
        for (value, expected) in cases {
            assert_eq!(parse_timestamp_value(&value), Some(expected), "value {value}");
        }
    }

    // Test IDs: TDOC-005
    #[test]
    fn coerce_number_accepts_numeric_strings_only() {
        assert_eq!(coerce_number(&json!(12)), Some(12.0));
        assert_eq!(coerce_number(&json!(" 7.5 ")), Some(7.5));
        assert_eq!(coerce_number(&json!("seven")), None);
        assert_eq!(coerce_number(&json!(true)), None);
        assert_eq!(coerce_number(&json!(null)), None);
    }

    // Test IDs: TDOC-006
    #[test]
    fn key_string_handles_object_ids_and_numbers() {
        assert_eq!(key_string(&json!({"$oid": "65f0c0ffee"})), Some("65f0c0ffee".to_string()));
        assert_eq!(key_string(&json!(42)), Some("42".to_string()));
        assert_eq!(key_string(&json!("  ")), None);
    }
}
