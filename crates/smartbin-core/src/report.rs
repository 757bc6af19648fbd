//! Derived dashboard tables computed from canonical rows and waste facts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::document::{
    first_number, first_present, first_string, key_string, probe_timestamp, RawDocument,
    RESERVED_ID_FIELDS, USER_KEY_FIELDS,
};
use crate::reduce::CanonicalRow;

pub const UNKNOWN_USER_NAME: &str = "(unknown)";

/// Waste category fields, probed in order.
pub const CATEGORY_FIELDS: [&str; 3] = ["waste_type", "category", "type"];
/// Fields holding an amount of waste.
pub const AMOUNT_FIELDS: [&str; 4] = ["weight", "quantity", "count", "amount"];
/// Fields holding points earned by one deposit.
pub const EARNED_FIELDS: [&str; 2] = ["points_earned", "points"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Medal {
    Gold,
    Silver,
    Bronze,
}

impl Medal {
    #[must_use]
    pub fn for_rank(rank: usize) -> Option<Self> {
        match rank {
            1 => Some(Self::Gold),
            2 => Some(Self::Silver),
            3 => Some(Self::Bronze),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub entity_key: String,
    pub name: String,
    pub points: f64,
    pub medal: Option<Medal>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPointsTotal {
    pub user_id: String,
    pub name: String,
    pub total_points: f64,
    pub deposits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WasteShare {
    pub waste: String,
    pub total_amount: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WasteLogEntry {
    pub record_id: Option<String>,
    pub user_id: Option<String>,
    pub waste_type: Option<String>,
    pub amount: Option<f64>,
    pub points_earned: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
}

/// Rank canonical user rows by points, highest first; ties order by entity key.
///
/// Rows without a name are shown under their entity key.
#[must_use]
pub fn leaderboard(rows: &[CanonicalRow]) -> Vec<LeaderboardEntry> {
    let mut ordered = rows
        .iter()
        .map(|row| (row, row.number("points").unwrap_or(0.0)))
        .collect::<Vec<_>>();
    ordered.sort_by(|(a, a_points), (b, b_points)| {
        b_points.total_cmp(a_points).then_with(|| a.entity_key.cmp(&b.entity_key))
    });

    ordered
        .into_iter()
        .enumerate()
        .map(|(index, (row, points))| {
            let rank = index + 1;
            LeaderboardEntry {
                rank,
                entity_key: row.entity_key.clone(),
                name: row.name().unwrap_or(&row.entity_key).to_string(),
                points,
                medal: Medal::for_rank(rank),
                updated_at: row.timestamp,
            }
        })
        .collect()
}

/// Sum `points_earned` per user over waste facts and attach user names.
///
/// Users absent from `users` are named [`UNKNOWN_USER_NAME`]; facts without a
/// user reference are ignored.
#[must_use]
pub fn points_by_user(waste: &[RawDocument], users: &[CanonicalRow]) -> Vec<UserPointsTotal> {
    let names = users
        .iter()
        .filter_map(|row| row.name().map(|name| (row.entity_key.as_str(), name)))
        .collect::<HashMap<_, _>>();

    let mut order: Vec<String> = Vec::new();
    let mut totals: HashMap<String, (f64, usize)> = HashMap::new();
    for document in waste {
        let Some(user_id) = first_present(document, &USER_KEY_FIELDS).and_then(key_string) else {
            continue;
        };
        let earned = first_number(document, &EARNED_FIELDS).unwrap_or(0.0);
        let entry = totals.entry(user_id.clone()).or_insert_with(|| {
            order.push(user_id);
            (0.0, 0)
        });
        entry.0 += earned;
        entry.1 += 1;
    }

    let mut summary = order
        .into_iter()
        .map(|user_id| {
            let (total_points, deposits) = totals.get(&user_id).copied().unwrap_or((0.0, 0));
            let name =
                names.get(user_id.as_str()).copied().unwrap_or(UNKNOWN_USER_NAME).to_string();
            UserPointsTotal { user_id, name, total_points, deposits }
        })
        .collect::<Vec<_>>();
    summary.sort_by(|a, b| {
        b.total_points.total_cmp(&a.total_points).then_with(|| a.user_id.cmp(&b.user_id))
    });
    summary
}

/// Share of each waste category by summed amount, in first-seen category order.
///
/// Percentages are rounded to one decimal and are all zero when nothing was collected.
#[must_use]
pub fn waste_distribution(waste: &[RawDocument]) -> Vec<WasteShare> {
    let mut shares: Vec<WasteShare> = Vec::new();
    for document in waste {
        let Some(category) = first_string(document, &CATEGORY_FIELDS) else {
            continue;
        };
        let amount = first_number(document, &AMOUNT_FIELDS).unwrap_or(0.0);
        match shares.iter_mut().find(|share| share.waste == category) {
            Some(share) => share.total_amount += amount,
            None => shares.push(WasteShare { waste: category, total_amount: amount, percent: 0.0 }),
        }
    }

    let grand_total: f64 = shares.iter().map(|share| share.total_amount).sum();
    if grand_total > 0.0 {
        for share in &mut shares {
            share.percent = (share.total_amount / grand_total * 1000.0).round() / 10.0;
        }
    }
    shares
}

/// Waste facts, newest first. Untimestamped facts follow in input order.
#[must_use]
pub fn waste_log(waste: &[RawDocument]) -> Vec<WasteLogEntry> {
    let mut entries = waste
        .iter()
        .map(|document| WasteLogEntry {
            record_id: document
                .get("record_id")
                .and_then(key_string)
                .or_else(|| first_present(document, &RESERVED_ID_FIELDS).and_then(key_string)),
            user_id: first_present(document, &USER_KEY_FIELDS).and_then(key_string),
            waste_type: first_string(document, &CATEGORY_FIELDS),
            amount: first_number(document, &AMOUNT_FIELDS),
            points_earned: first_number(document, &EARNED_FIELDS),
            timestamp: probe_timestamp(document),
        })
        .collect::<Vec<_>>();
    // Stable sort keeps input order among equal or missing timestamps.
    entries.sort_by(|a, b| match (a.timestamp, b.timestamp) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    entries
}

/// Convenience for building waste documents from typed values.
#[must_use]
pub fn waste_document(
    record_id: &str,
    user_id: &str,
    waste_type: &str,
    amount: f64,
    points_earned: f64,
    timestamp: Option<&str>,
) -> RawDocument {
    let mut document = RawDocument::new();
    document.insert("record_id".to_string(), Value::String(record_id.to_string()));
    document.insert("user_id".to_string(), Value::String(user_id.to_string()));
    document.insert("waste_type".to_string(), Value::String(waste_type.to_string()));
    document.insert("weight".to_string(), Value::from(amount));
    document.insert("points_earned".to_string(), Value::from(points_earned));
    if let Some(timestamp) = timestamp {
        document.insert("timestamp".to_string(), Value::String(timestamp.to_string()));
    }
    document
}
