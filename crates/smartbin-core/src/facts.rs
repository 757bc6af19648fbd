//! Append-only waste fact ingestion from externally produced JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::document::{
    first_number, first_present, first_string, key_string, probe_timestamp, RawDocument,
};
use crate::identity::{resolve, FactRecord, IdentityRef, IdentityStore, NewFact};
use crate::report::{CATEGORY_FIELDS, EARNED_FIELDS};
use crate::{BatchOutcome, EntryFailure, KernelError};

/// Fields holding an external natural key such as an RFID tag code.
pub const NATURAL_KEY_FIELDS: [&str; 4] = ["rfid", "rfid_code", "natural_key", "tag"];
pub const INTERNAL_ID_FIELDS: [&str; 2] = ["internal_id", "user_id"];
pub const FALLBACK_NAME_FIELDS: [&str; 2] = ["name", "user_name"];
/// Fields holding the quantity of one fact, probed in order.
pub const QUANTITY_FIELDS: [&str; 4] = ["quantity", "count", "weight", "amount"];

/// One fact entry as read from the facts file, labelled for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEntry {
    pub label: String,
    pub value: Value,
}

/// Split a facts file into entries: a list yields `#0, #1, ...`, a map yields its keys.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the top level is neither a list nor a map.
pub fn fact_entries(value: &Value) -> Result<Vec<RawEntry>, KernelError> {
    match value {
        Value::Array(items) => Ok(items
            .iter()
            .enumerate()
            .map(|(index, item)| RawEntry { label: format!("#{index}"), value: item.clone() })
            .collect()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(key, item)| RawEntry { label: key.clone(), value: item.clone() })
            .collect()),
        _ => Err(KernelError::Validation(
            "fact entries MUST be a JSON list or a JSON object".to_string(),
        )),
    }
}

/// A fact entry with every field it needs for insertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactEntry {
    pub reference: IdentityRef,
    pub fallback_name: Option<String>,
    pub category: String,
    pub quantity: f64,
    pub points: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
}

impl FactEntry {
    /// Derive a fact from one raw entry.
    ///
    /// A missing or unparseable timestamp is not an error; the store stamps the fact.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for a non-object entry or a missing category,
    /// quantity or points, and [`KernelError::MissingKey`] when no user reference exists.
    pub fn parse(value: &Value) -> Result<Self, KernelError> {
        let Value::Object(entry) = value else {
            return Err(KernelError::Validation("fact entry is not a JSON object".to_string()));
        };
        let category = first_string(entry, &CATEGORY_FIELDS)
            .ok_or_else(|| KernelError::Validation("missing waste category".to_string()))?;
        let quantity = first_number(entry, &QUANTITY_FIELDS)
            .ok_or_else(|| KernelError::Validation("missing numeric quantity".to_string()))?;
        let points = first_number(entry, &EARNED_FIELDS)
            .ok_or_else(|| KernelError::Validation("missing numeric points".to_string()))?;

        let reference = identity_ref(entry);
        if reference.internal_id.is_none() && reference.natural_key.is_none() {
            return Err(KernelError::MissingKey("fact entry has no user reference".to_string()));
        }

        Ok(Self {
            reference,
            fallback_name: first_string(entry, &FALLBACK_NAME_FIELDS),
            category,
            quantity,
            points,
            timestamp: probe_timestamp(entry),
        })
    }
}

fn identity_ref(entry: &RawDocument) -> IdentityRef {
    let internal_id = INTERNAL_ID_FIELDS.iter().find_map(|field| match entry.get(*field) {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(raw)) => raw.trim().parse::<i64>().ok(),
        _ => None,
    });
    let natural_key = first_present(entry, &NATURAL_KEY_FIELDS)
        .and_then(key_string)
        .or_else(|| match entry.get("user_id") {
            Some(Value::String(raw)) if raw.trim().parse::<i64>().is_err() => Some(raw.clone()),
            _ => None,
        })
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty());
    IdentityRef { internal_id, natural_key }
}

/// Resolve and insert every entry, collecting per-entry failures.
///
/// # Errors
/// Propagates [`KernelError::Store`] failures, which abort the remaining entries.
pub fn sync_facts<S>(
    store: &mut S,
    entries: &[RawEntry],
) -> Result<BatchOutcome<FactRecord>, KernelError>
where
    S: IdentityStore + ?Sized,
{
    let mut outcome = BatchOutcome::default();
    for entry in entries {
        let reference = entry.value.as_object().map(identity_ref);
        match apply_fact(store, &entry.value) {
            Ok(record) => outcome.applied.push(record),
            Err(err) if err.is_entry_local() => outcome.failures.push(EntryFailure {
                entry: entry.label.clone(),
                reference: reference.map(|reference| reference.describe()),
                reason: err.to_string(),
            }),
            Err(err) => return Err(err),
        }
    }
    Ok(outcome)
}

fn apply_fact<S>(store: &mut S, value: &Value) -> Result<FactRecord, KernelError>
where
    S: IdentityStore + ?Sized,
{
    let fact = FactEntry::parse(value)?;
    let resolution = resolve(store, &fact.reference, fact.fallback_name.as_deref())?;
    store.insert_fact(&NewFact {
        identity_ref: resolution.internal_id,
        category: fact.category,
        quantity: fact.quantity,
        points: fact.points,
        timestamp: fact.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::identity::InMemoryStore;

    fn entries(value: &Value) -> Vec<RawEntry> {
        match fact_entries(value) {
            Ok(entries) => entries,
            Err(err) => panic!("fixture must be a list or map: {err}"),
        }
    }

    // Test IDs: TFCT-001
    #[test]
    fn unknown_natural_key_creates_identity_then_fact() -> Result<(), KernelError> {
        let mut store = InMemoryStore::new();
        let batch = entries(&json!([{
            "rfid": "RFID99",
            "waste_type": "plastic_bottle",
            "quantity": 3,
            "points": 6,
            "timestamp": "2024-05-01T10:00:00Z"
        }]));

        let outcome = sync_facts(&mut store, &batch)?;

        assert_eq!(outcome.affected(), 1);
        assert!(outcome.failures.is_empty());
        let identities = store.identities();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].natural_key, "RFID99");
        let fact = &store.facts()[0];
        assert_eq!(fact.identity_ref, identities[0].internal_id);
        assert_eq!(fact.category, "plastic_bottle");
        assert!((fact.quantity - 3.0).abs() < f64::EPSILON);
        assert_eq!(fact.timestamp, datetime!(2024-05-01 10:00 UTC));
        Ok(())
    }

    // Test IDs: TFCT-002
    #[test]
    fn malformed_entry_is_skipped_without_aborting_batch() -> Result<(), KernelError> {
        let mut store = InMemoryStore::new();
        let mut items = (0..9)
            .map(|index| json!({"rfid": format!("RFID{index}"), "category": "can", "count": 1, "points": 2}))
            .collect::<Vec<_>>();
        items.insert(4, json!({"rfid": "RFID-bad", "category": "can", "points": 2}));
        let batch = entries(&Value::Array(items));

        let outcome = sync_facts(&mut store, &batch)?;

        assert_eq!(outcome.applied.len(), 9);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].entry, "#4");
        assert_eq!(outcome.failures[0].reference.as_deref(), Some("natural_key=RFID-bad"));
        assert_eq!(store.facts().len(), 9);
        Ok(())
    }

    // Test IDs: TFCT-003
    #[test]
    fn unparseable_timestamp_falls_back_to_store_clock() -> Result<(), KernelError> {
        let mut store = InMemoryStore::new();
        let before = OffsetDateTime::now_utc();
        let batch = entries(&json!({
            "r1": {"tag": "RFID1", "waste_type": "glass", "weight": 1.5, "points_earned": 3,
                   "timestamp": "yesterday-ish"}
        }));

        let outcome = sync_facts(&mut store, &batch)?;

        assert_eq!(outcome.affected(), 1);
        assert!(store.facts()[0].timestamp >= before);
        Ok(())
    }

    // Test IDs: TFCT-004
    #[test]
    fn internal_id_reference_must_exist() -> Result<(), KernelError> {
        let mut store = InMemoryStore::new();
        let batch = entries(&json!([
            {"user_id": 41, "waste_type": "can", "quantity": 1, "points": 1}
        ]));

        let outcome = sync_facts(&mut store, &batch)?;

        assert!(outcome.applied.is_empty());
        assert_eq!(outcome.failures[0].reference.as_deref(), Some("internal_id=41"));
        assert!(store.identities().is_empty());
        Ok(())
    }

    // Test IDs: TFCT-005
    #[test]
    fn string_user_id_is_a_natural_key_unless_numeric() {
        let by_key = FactEntry::parse(&json!({"user_id": "ann", "type": "paper", "amount": 2, "points": 1}));
        let by_id = FactEntry::parse(&json!({"user_id": "12", "type": "paper", "amount": 2, "points": 1}));

        match (by_key, by_id) {
            (Ok(by_key), Ok(by_id)) => {
                assert_eq!(by_key.reference, IdentityRef::by_key("ann"));
                assert_eq!(by_id.reference, IdentityRef::by_id(12));
            }
            other => panic!("both entries should parse: {other:?}"),
        }
    }

    // Test IDs: TFCT-006
    #[test]
    fn entry_without_reference_is_missing_key() {
        let parsed = FactEntry::parse(&json!({"waste_type": "can", "quantity": 1, "points": 1}));
        assert!(matches!(parsed, Err(KernelError::MissingKey(_))));
        assert!(fact_entries(&json!("not entries")).is_err());
    }

    // Test IDs: TFCT-007
    #[test]
    fn repeated_cycles_reuse_the_created_identity() -> Result<(), KernelError> {
        let mut store = InMemoryStore::new();
        let batch = entries(&json!([
            {"rfid": "RFID5", "name": "Eve", "waste_type": "can", "quantity": 1, "points": 2}
        ]));

        sync_facts(&mut store, &batch)?;
        sync_facts(&mut store, &batch)?;

        assert_eq!(store.identities().len(), 1);
        assert_eq!(store.identities()[0].display_name, "Eve");
        assert_eq!(store.facts().len(), 2);
        Ok(())
    }

    // Test IDs: TFCT-008
    #[test]
    fn quantity_is_preferred_over_weight() -> Result<(), KernelError> {
        let both = FactEntry::parse(&json!({
            "rfid": "R1", "waste_type": "can", "quantity": 3, "weight": 0.5, "points": 1
        }))?;
        assert!((both.quantity - 3.0).abs() < f64::EPSILON);

        let weight_only = FactEntry::parse(&json!({
            "rfid": "R1", "waste_type": "can", "weight": 0.5, "amount": 9, "points": 1
        }))?;
        assert!((weight_only.quantity - 0.5).abs() < f64::EPSILON);

        let count_over_weight = FactEntry::parse(&json!({
            "rfid": "R1", "waste_type": "can", "count": 4, "weight": 0.5, "points": 1
        }))?;
        assert!((count_over_weight.quantity - 4.0).abs() < f64::EPSILON);
        Ok(())
    }
}
