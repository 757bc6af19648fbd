use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Date, OffsetDateTime};

use crate::document::{
    coerce_number, parse_calendar_day, RawDocument, NAME_ATTRIBUTE, POINTS_ATTRIBUTE,
};
use crate::flatten::{flatten, FlatRecord, DAILY_TOTAL_FIELD};
use crate::shape::{detect, NestedKind, Shape};
use crate::KernelError;

/// The surviving record for one entity key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalRow {
    pub entity_key: String,
    pub attributes: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
}

impl CanonicalRow {
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.attributes.get(NAME_ATTRIBUTE).and_then(Value::as_str)
    }

    #[must_use]
    pub fn number(&self, attribute: &str) -> Option<f64> {
        self.attributes.get(attribute).and_then(coerce_number)
    }

    /// Calendar day of the row: the key itself for daily rows, else the timestamp's date.
    #[must_use]
    pub fn day(&self) -> Option<Date> {
        parse_calendar_day(&self.entity_key).or_else(|| self.timestamp.map(OffsetDateTime::date))
    }
}

impl From<FlatRecord> for CanonicalRow {
    fn from(record: FlatRecord) -> Self {
        Self {
            entity_key: record.entity_key,
            attributes: record.attributes,
            timestamp: record.timestamp,
        }
    }
}

/// Winner selection for a partition in which no record carries a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "policy", content = "attribute", rename_all = "snake_case")]
pub enum Fallback {
    /// Largest numeric value of the attribute; ties and missing values keep first-seen.
    MaxMeasure(String),
    FirstSeen,
    /// The most recently read record, by store read order.
    LastSeen,
}

impl Fallback {
    /// Fallback each shape uses when its records carry no timestamps.
    #[must_use]
    pub fn for_shape(shape: Shape) -> Self {
        match shape {
            Shape::Flat | Shape::Nested(NestedKind::PerUser) => {
                Self::MaxMeasure(POINTS_ATTRIBUTE.to_string())
            }
            Shape::Nested(NestedKind::PerDay) => Self::LastSeen,
        }
    }
}

/// Reduce observations to one canonical row per entity key.
///
/// Rows come out in first-seen key order. Within a key, the record with the
/// greatest timestamp wins (earliest input position on ties); records without a
/// timestamp only compete when no record of that key has one, and then `fallback`
/// decides.
#[must_use]
pub fn reduce(records: Vec<FlatRecord>, fallback: &Fallback) -> Vec<CanonicalRow> {
    let mut partition_of: HashMap<String, usize> = HashMap::new();
    let mut partitions: Vec<Vec<FlatRecord>> = Vec::new();

    for record in records {
        match partition_of.get(&record.entity_key) {
            Some(&index) => partitions[index].push(record),
            None => {
                partition_of.insert(record.entity_key.clone(), partitions.len());
                partitions.push(vec![record]);
            }
        }
    }

    partitions
        .into_iter()
        .filter_map(|partition| select_winner(partition, fallback))
        .map(CanonicalRow::from)
        .collect()
}

fn select_winner(partition: Vec<FlatRecord>, fallback: &Fallback) -> Option<FlatRecord> {
    let mut winner: Option<usize> = None;

    if partition.iter().any(|record| record.timestamp.is_some()) {
        for (index, record) in partition.iter().enumerate() {
            let Some(timestamp) = record.timestamp else {
                continue;
            };
            let replace = match winner.and_then(|current| partition[current].timestamp) {
                Some(best) => timestamp > best,
                None => true,
            };
            if replace {
                winner = Some(index);
            }
        }
    } else {
        winner = match fallback {
            Fallback::FirstSeen => Some(0),
            Fallback::LastSeen => partition.len().checked_sub(1),
            Fallback::MaxMeasure(attribute) => {
                let mut best: Option<(usize, f64)> = None;
                for (index, record) in partition.iter().enumerate() {
                    let Some(value) = record.attributes.get(attribute).and_then(coerce_number)
                    else {
                        continue;
                    };
                    let replace = match best {
                        Some((_, current)) => value.total_cmp(&current) == Ordering::Greater,
                        None => true,
                    };
                    if replace {
                        best = Some((index, value));
                    }
                }
                Some(best.map_or(0, |(index, _)| index))
            }
        };
    }

    let index = winner?;
    partition.into_iter().nth(index)
}

/// Scoping applied to canonical rows after reduction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilter {
    /// Inclusive first day; rows without a day are dropped when any bound is set.
    pub from_day: Option<Date>,
    /// Inclusive last day.
    pub to_day: Option<Date>,
    /// Names excluded case-insensitively, e.g. maintenance or test accounts.
    pub exclude_names: Vec<String>,
    pub exclude_keys: Vec<String>,
}

impl RowFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.from_day.is_none()
            && self.to_day.is_none()
            && self.exclude_names.is_empty()
            && self.exclude_keys.is_empty()
    }

    #[must_use]
    pub fn accepts(&self, row: &CanonicalRow) -> bool {
        if self.exclude_keys.iter().any(|key| key == &row.entity_key) {
            return false;
        }
        if let Some(name) = row.name() {
            if self.exclude_names.iter().any(|excluded| excluded.eq_ignore_ascii_case(name)) {
                return false;
            }
        }
        if self.from_day.is_none() && self.to_day.is_none() {
            return true;
        }
        let Some(day) = row.day() else {
            return false;
        };
        self.from_day.map_or(true, |from| day >= from) && self.to_day.map_or(true, |to| day <= to)
    }

    /// Keep the rows this filter accepts. Must only be applied to reduced rows.
    #[must_use]
    pub fn apply(&self, rows: Vec<CanonicalRow>) -> Vec<CanonicalRow> {
        if self.is_empty() {
            return rows;
        }
        rows.into_iter().filter(|row| self.accepts(row)).collect()
    }
}

/// Result of normalizing one document batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedTable {
    /// `None` for an empty batch, whose shape cannot be observed.
    pub shape: Option<Shape>,
    pub source_documents: usize,
    pub observations: usize,
    pub rows: Vec<CanonicalRow>,
}

impl NormalizedTable {
    #[must_use]
    pub fn empty() -> Self {
        Self { shape: None, source_documents: 0, observations: 0, rows: Vec::new() }
    }
}

/// Detect, flatten, reduce, then filter one batch.
///
/// An empty batch yields [`NormalizedTable::empty`].
#[must_use]
pub fn normalize_batch(batch: &[RawDocument], filter: &RowFilter) -> NormalizedTable {
    let Ok(shape) = detect(batch) else {
        return NormalizedTable::empty();
    };
    let records = flatten(batch, shape);
    let observations = records.len();
    let rows = filter.apply(reduce(records, &Fallback::for_shape(shape)));
    NormalizedTable { shape: Some(shape), source_documents: batch.len(), observations, rows }
}

/// Like [`normalize_batch`] but requires the batch to have a particular shape.
///
/// # Errors
/// Returns [`KernelError::Validation`] when a non-empty batch has another shape.
pub fn normalize_expecting(
    batch: &[RawDocument],
    expected: Shape,
    filter: &RowFilter,
) -> Result<NormalizedTable, KernelError> {
    let table = normalize_batch(batch, filter);
    match table.shape {
        Some(shape) if shape != expected => Err(KernelError::Validation(format!(
            "expected {} documents, found {}",
            expected.as_str(),
            shape.as_str()
        ))),
        _ => Ok(table),
    }
}

/// Daily rows sorted by day, skipping rows whose key is not a calendar day.
#[must_use]
pub fn daily_rows(table: &NormalizedTable) -> Vec<CanonicalRow> {
    let mut rows = table
        .rows
        .iter()
        .filter(|row| parse_calendar_day(&row.entity_key).is_some())
        .cloned()
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
    rows
}

/// Sum of the `total` attribute across daily rows.
#[must_use]
pub fn daily_grand_total(rows: &[CanonicalRow]) -> f64 {
    rows.iter().filter_map(|row| row.number(DAILY_TOTAL_FIELD)).sum()
}
