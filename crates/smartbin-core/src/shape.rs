use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{
    has_any_field, has_numeric_field, is_reserved_field, parse_calendar_day, RawDocument,
    MEASURE_FIELDS, NAME_FIELDS, USER_KEY_FIELDS,
};
use crate::KernelError;

/// Fields that hold the per-entity container in nested documents, probed in order.
pub const CONTAINER_FIELDS: [&str; 4] = ["data", "users", "daily", "days"];

/// Structural layout of a document batch, resolved once from its first document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "shape", content = "kind", rename_all = "snake_case")]
pub enum Shape {
    /// One document is one entity.
    Flat,
    /// One document is a container of entities keyed by sub-id.
    Nested(NestedKind),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NestedKind {
    /// Sub-keys are user ids and sub-entries are user records.
    PerUser,
    /// Sub-keys are `YYYY-MM-DD` days and sub-entries are category totals.
    PerDay,
}

impl Shape {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Nested(NestedKind::PerUser) => "nested_per_user",
            Self::Nested(NestedKind::PerDay) => "nested_per_day",
        }
    }

    /// Classify one document by its field set.
    #[must_use]
    pub fn of(sample: &RawDocument) -> Self {
        let named_with_points =
            has_any_field(sample, &NAME_FIELDS) && has_numeric_field(sample, &MEASURE_FIELDS);
        if named_with_points || has_any_field(sample, &USER_KEY_FIELDS) {
            return Self::Flat;
        }

        let container = container_entries(sample);
        let mut keys = container.iter().map(|(key, _)| *key).peekable();
        if keys.peek().is_some() && keys.all(|key| parse_calendar_day(key).is_some()) {
            Self::Nested(NestedKind::PerDay)
        } else {
            Self::Nested(NestedKind::PerUser)
        }
    }
}

/// Detect the shape of a batch from its first document.
///
/// # Errors
/// Returns [`KernelError::EmptyBatch`] when `batch` is empty; callers that can see
/// empty input should go through [`crate::normalize_batch`] instead.
pub fn detect(batch: &[RawDocument]) -> Result<Shape, KernelError> {
    batch.first().map(Shape::of).ok_or(KernelError::EmptyBatch)
}

/// Entries of the per-entity container of a nested document.
///
/// The container is the first object-valued [`CONTAINER_FIELDS`] entry, or else the
/// document itself minus identifier and timestamp fields.
#[must_use]
pub fn container_entries(document: &RawDocument) -> Vec<(&str, &Value)> {
    let explicit = CONTAINER_FIELDS.iter().find_map(|field| match document.get(*field) {
        Some(Value::Object(container)) => Some(container),
        _ => None,
    });

    match explicit {
        Some(container) => container
            .iter()
            .filter(|(key, _)| !is_reserved_field(key))
            .map(|(key, value)| (key.as_str(), value))
            .collect(),
        None => document
            .iter()
            .filter(|(key, _)| !is_reserved_field(key))
            .map(|(key, value)| (key.as_str(), value))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> RawDocument {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture must be an object: {other}"),
        }
    }

    // Test IDs: TSHP-001
    #[test]
    fn named_document_with_numeric_points_is_flat() {
        let sample = doc(json!({"_id": "a", "name": "Ann", "points": 10}));
        assert_eq!(Shape::of(&sample), Shape::Flat);
    }

    // Test IDs: TSHP-002
    #[test]
    fn explicit_user_key_is_flat_even_without_points() {
        let sample = doc(json!({"user_id": "u1", "waste_type": "can"}));
        assert_eq!(Shape::of(&sample), Shape::Flat);
    }

    // Test IDs: TSHP-003
    #[test]
    fn name_with_string_points_is_not_flat() {
        let sample = doc(json!({"_id": "snap", "name": "snapshot", "points": "n/a",
            "users": {"u1": {"name": "Ann", "points": 3}}}));
        assert_eq!(Shape::of(&sample), Shape::Nested(NestedKind::PerUser));
    }

    // Test IDs: TSHP-004
    #[test]
    fn container_keyed_by_days_is_per_day() {
        let sample = doc(json!({
            "_id": "week-9",
            "updated_at": "2024-03-02T00:00:00Z",
            "daily": {"2024-03-01": {"can": 2}, "2024-03-02": {"can": 1}}
        }));
        assert_eq!(Shape::of(&sample), Shape::Nested(NestedKind::PerDay));
    }

    // Test IDs: TSHP-005
    #[test]
    fn bare_container_document_is_nested() {
        let sample = doc(json!({
            "_id": "snapshot",
            "timestamp": "2024-03-02T00:00:00Z",
            "u1": {"name": "Ann", "points": 3},
            "u2": {"name": "Bo", "points": 4}
        }));
        assert_eq!(Shape::of(&sample), Shape::Nested(NestedKind::PerUser));
        let keys = container_entries(&sample).into_iter().map(|(key, _)| key).collect::<Vec<_>>();
        assert_eq!(keys, vec!["u1", "u2"]);
    }

    // Test IDs: TSHP-006
    #[test]
    fn detect_rejects_empty_batch() {
        assert_eq!(detect(&[]), Err(KernelError::EmptyBatch));
    }

    // Test IDs: TSHP-007
    #[test]
    fn empty_container_defaults_to_per_user() {
        let sample = doc(json!({"_id": "empty", "data": {}}));
        assert_eq!(Shape::of(&sample), Shape::Nested(NestedKind::PerUser));
    }
}
