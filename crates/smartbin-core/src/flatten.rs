use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::document::{
    coerce_number, first_number, first_present, first_string, has_any_field, is_reserved_field,
    key_string, probe_timestamp, RawDocument, MEASURE_FIELDS, NAME_ATTRIBUTE, NAME_FIELDS,
    POINTS_ATTRIBUTE, RESERVED_ID_FIELDS, USER_KEY_FIELDS,
};
use crate::shape::{container_entries, NestedKind, Shape};

/// Category totals carried by every daily-aggregate row.
pub const DAILY_CATEGORY_FIELDS: [&str; 5] = ["plastic_bottle", "can", "glass", "paper", "other"];
pub const DAILY_TOTAL_FIELD: &str = "total";

/// One entity observation produced from any document shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlatRecord {
    pub entity_key: String,
    pub attributes: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
}

/// Flatten a batch into entity observations, in document then container order.
///
/// Documents or sub-entries that cannot yield an entity are skipped.
#[must_use]
pub fn flatten(batch: &[RawDocument], shape: Shape) -> Vec<FlatRecord> {
    match shape {
        Shape::Flat => batch.iter().filter_map(flatten_flat).collect(),
        Shape::Nested(NestedKind::PerUser) => batch.iter().flat_map(flatten_per_user).collect(),
        Shape::Nested(NestedKind::PerDay) => batch.iter().flat_map(flatten_per_day).collect(),
    }
}

fn flatten_flat(document: &RawDocument) -> Option<FlatRecord> {
    let entity_key = first_present(document, &USER_KEY_FIELDS)
        .and_then(key_string)
        .or_else(|| first_present(document, &RESERVED_ID_FIELDS).and_then(key_string))?;

    let mut attributes = entity_attributes(document);
    attributes.remove("user_id");
    attributes.remove("userId");
    attributes.remove("uid");
    attributes.entry(POINTS_ATTRIBUTE.to_string()).or_insert_with(|| Value::from(0.0));

    Some(FlatRecord { entity_key, attributes, timestamp: probe_timestamp(document) })
}

fn flatten_per_user(document: &RawDocument) -> Vec<FlatRecord> {
    let parent_timestamp = probe_timestamp(document);

    container_entries(document)
        .into_iter()
        .filter_map(|(sub_id, entry)| {
            let Value::Object(entry) = entry else {
                return None;
            };
            if !has_any_field(entry, &NAME_FIELDS) && !has_any_field(entry, &MEASURE_FIELDS) {
                return None;
            }
            Some(FlatRecord {
                entity_key: sub_id.to_string(),
                attributes: entity_attributes(entry),
                timestamp: probe_timestamp(entry).or(parent_timestamp),
            })
        })
        .collect()
}

fn flatten_per_day(document: &RawDocument) -> Vec<FlatRecord> {
    let parent_timestamp = probe_timestamp(document);

    container_entries(document)
        .into_iter()
        .filter_map(|(day, entry)| {
            let Value::Object(entry) = entry else {
                return None;
            };
            Some(FlatRecord {
                entity_key: day.to_string(),
                attributes: daily_attributes(entry),
                timestamp: parent_timestamp,
            })
        })
        .collect()
}

/// Copy non-reserved fields and add canonical `name` and `points` attributes.
fn entity_attributes(source: &RawDocument) -> Map<String, Value> {
    let mut attributes = source
        .iter()
        .filter(|(field, _)| !is_reserved_field(field))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect::<Map<String, Value>>();

    if let Some(name) = first_string(source, &NAME_FIELDS) {
        attributes.insert(NAME_ATTRIBUTE.to_string(), Value::String(name));
    }
    match first_number(source, &MEASURE_FIELDS) {
        Some(points) => {
            attributes.insert(POINTS_ATTRIBUTE.to_string(), Value::from(points));
        }
        None if has_any_field(source, &MEASURE_FIELDS) => {
            attributes.insert(POINTS_ATTRIBUTE.to_string(), Value::from(0.0));
        }
        None => {}
    }
    attributes
}

fn daily_attributes(entry: &RawDocument) -> Map<String, Value> {
    let mut attributes = Map::new();
    let mut sum = 0.0;
    for category in DAILY_CATEGORY_FIELDS {
        let amount = entry.get(category).and_then(coerce_number).unwrap_or(0.0);
        sum += amount;
        attributes.insert(category.to_string(), Value::from(amount));
    }
    let total = entry.get(DAILY_TOTAL_FIELD).and_then(coerce_number).unwrap_or(sum);
    attributes.insert(DAILY_TOTAL_FIELD.to_string(), Value::from(total));
    attributes
}
