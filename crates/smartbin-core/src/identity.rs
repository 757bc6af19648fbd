use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::document::{first_number, first_string, NAME_FIELDS};
use crate::{BatchOutcome, EntryFailure, KernelError};

/// Fields accepted as the running-total measure of an identity update.
const UPDATE_MEASURE_FIELDS: [&str; 3] = ["points", "total_points", "score"];

/// A registered user as persisted by the relational store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    pub internal_id: i64,
    pub natural_key: String,
    pub display_name: String,
    pub running_total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewIdentity {
    pub natural_key: String,
    pub display_name: String,
    pub running_total: f64,
}

/// One append-only waste deposit awaiting insertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewFact {
    pub identity_ref: i64,
    pub category: String,
    pub quantity: f64,
    pub points: f64,
    /// `None` lets the store stamp the row with its own clock at insert time.
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
}

/// A persisted waste deposit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactRecord {
    pub fact_id: i64,
    pub identity_ref: i64,
    pub category: String,
    pub quantity: f64,
    pub points: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Row-level operations the write path needs from a relational store.
///
/// Implementations report per-row constraint failures as [`KernelError::Rejected`]
/// and connectivity or storage failures as [`KernelError::Store`].
pub trait IdentityStore {
    /// # Errors
    /// Returns [`KernelError::Store`] when the lookup cannot be performed.
    fn find_identity(&self, natural_key: &str) -> Result<Option<Identity>, KernelError>;

    /// # Errors
    /// Returns [`KernelError::Rejected`] or [`KernelError::Store`] when the insert fails.
    fn insert_identity(&mut self, identity: &NewIdentity) -> Result<Identity, KernelError>;

    /// # Errors
    /// Returns [`KernelError::Rejected`] or [`KernelError::Store`] when the update fails.
    fn update_identity(
        &mut self,
        internal_id: i64,
        display_name: &str,
        running_total: f64,
    ) -> Result<(), KernelError>;

    /// # Errors
    /// Returns [`KernelError::Rejected`] when the referenced identity does not exist,
    /// or [`KernelError::Store`] when the insert fails.
    fn insert_fact(&mut self, fact: &NewFact) -> Result<FactRecord, KernelError>;
}

/// How a caller identifies the user behind a fact.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRef {
    pub internal_id: Option<i64>,
    pub natural_key: Option<String>,
}

impl IdentityRef {
    #[must_use]
    pub fn by_key(natural_key: &str) -> Self {
        Self { internal_id: None, natural_key: Some(natural_key.to_string()) }
    }

    #[must_use]
    pub fn by_id(internal_id: i64) -> Self {
        Self { internal_id: Some(internal_id), natural_key: None }
    }

    /// Human-readable reference for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match (&self.natural_key, self.internal_id) {
            (Some(key), _) => format!("natural_key={key}"),
            (None, Some(id)) => format!("internal_id={id}"),
            (None, None) => "no user reference".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub internal_id: i64,
    pub created: bool,
}

/// Display name given to identities created before their owner registered.
#[must_use]
pub fn placeholder_display_name(natural_key: &str) -> String {
    format!("User {natural_key}")
}

/// Map a user reference to an internal id, creating the identity when unknown.
///
/// An explicit internal id is trusted as-is. A natural key is looked up first and
/// only inserted when absent, so repeated calls for one key in the same store
/// state return the same id.
///
/// # Errors
/// Returns [`KernelError::MissingKey`] when the reference carries neither an id nor
/// a non-empty natural key, and propagates store failures.
pub fn resolve<S>(
    store: &mut S,
    reference: &IdentityRef,
    fallback_display_name: Option<&str>,
) -> Result<Resolution, KernelError>
where
    S: IdentityStore + ?Sized,
{
    if let Some(internal_id) = reference.internal_id {
        return Ok(Resolution { internal_id, created: false });
    }

    let natural_key = reference
        .natural_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| {
            KernelError::MissingKey("neither internal id nor natural key supplied".to_string())
        })?;

    if let Some(existing) = store.find_identity(natural_key)? {
        return Ok(Resolution { internal_id: existing.internal_id, created: false });
    }

    let display_name = fallback_display_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map_or_else(|| placeholder_display_name(natural_key), str::to_string);
    let created = store.insert_identity(&NewIdentity {
        natural_key: natural_key.to_string(),
        display_name,
        running_total: 0.0,
    })?;
    Ok(Resolution { internal_id: created.internal_id, created: true })
}

/// One entry of the externally maintained points file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityUpdate {
    pub natural_key: String,
    pub display_name: String,
    pub measure: f64,
}

/// Parse a points file shaped `{natural_key: {name, points}}`.
///
/// Entries lacking a name or a numeric measure become failures.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the top level is not a JSON object.
pub fn parse_identity_updates(value: &Value) -> Result<BatchOutcome<IdentityUpdate>, KernelError> {
    let Value::Object(entries) = value else {
        return Err(KernelError::Validation(
            "identity updates MUST be a JSON object keyed by natural key".to_string(),
        ));
    };

    let mut outcome = BatchOutcome::default();
    for (natural_key, entry) in entries {
        let natural_key = natural_key.trim();
        let failure = |reason: &str| EntryFailure {
            entry: natural_key.to_string(),
            reference: Some(format!("natural_key={natural_key}")),
            reason: reason.to_string(),
        };
        if natural_key.is_empty() {
            outcome.failures.push(failure("natural key is empty"));
            continue;
        }
        let Value::Object(entry) = entry else {
            outcome.failures.push(failure("entry is not a JSON object"));
            continue;
        };
        let Some(display_name) = first_string(entry, &NAME_FIELDS) else {
            outcome.failures.push(failure("missing name"));
            continue;
        };
        let Some(measure) = first_number(entry, &UPDATE_MEASURE_FIELDS) else {
            outcome.failures.push(failure("missing numeric points"));
            continue;
        };
        outcome.applied.push(IdentityUpdate {
            natural_key: natural_key.to_string(),
            display_name,
            measure,
        });
    }
    Ok(outcome)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityChange {
    pub internal_id: i64,
    pub natural_key: String,
    pub action: ChangeAction,
}

/// Upsert identities by natural key.
///
/// Existing identities get their display name and running total overwritten with
/// the incoming values (last write wins, nothing is accumulated); unknown keys are
/// inserted. Row rejections are collected as failures.
///
/// # Errors
/// Propagates [`KernelError::Store`] failures, which abort the batch.
pub fn sync_identities<S>(
    store: &mut S,
    updates: &[IdentityUpdate],
) -> Result<BatchOutcome<IdentityChange>, KernelError>
where
    S: IdentityStore + ?Sized,
{
    let mut outcome = BatchOutcome::default();
    for update in updates {
        match upsert_identity(store, update) {
            Ok(change) => outcome.applied.push(change),
            Err(err) if err.is_entry_local() => outcome.failures.push(EntryFailure {
                entry: update.natural_key.clone(),
                reference: Some(format!("natural_key={}", update.natural_key)),
                reason: err.to_string(),
            }),
            Err(err) => return Err(err),
        }
    }
    Ok(outcome)
}

fn upsert_identity<S>(store: &mut S, update: &IdentityUpdate) -> Result<IdentityChange, KernelError>
where
    S: IdentityStore + ?Sized,
{
    if let Some(existing) = store.find_identity(&update.natural_key)? {
        store.update_identity(existing.internal_id, &update.display_name, update.measure)?;
        return Ok(IdentityChange {
            internal_id: existing.internal_id,
            natural_key: update.natural_key.clone(),
            action: ChangeAction::Updated,
        });
    }

    let created = store.insert_identity(&NewIdentity {
        natural_key: update.natural_key.clone(),
        display_name: update.display_name.clone(),
        running_total: update.measure,
    })?;
    Ok(IdentityChange {
        internal_id: created.internal_id,
        natural_key: update.natural_key.clone(),
        action: ChangeAction::Inserted,
    })
}

/// Process-local [`IdentityStore`] for fixtures and dry runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    identities: BTreeMap<i64, Identity>,
    facts: Vec<FactRecord>,
    next_identity_id: i64,
    next_fact_id: i64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn identities(&self) -> Vec<Identity> {
        self.identities.values().cloned().collect()
    }

    #[must_use]
    pub fn facts(&self) -> &[FactRecord] {
        &self.facts
    }
}

impl IdentityStore for InMemoryStore {
    fn find_identity(&self, natural_key: &str) -> Result<Option<Identity>, KernelError> {
        Ok(self.identities.values().find(|identity| identity.natural_key == natural_key).cloned())
    }

    fn insert_identity(&mut self, identity: &NewIdentity) -> Result<Identity, KernelError> {
        if self.find_identity(&identity.natural_key)?.is_some() {
            return Err(KernelError::Rejected(format!(
                "natural key {} is already registered",
                identity.natural_key
            )));
        }
        self.next_identity_id += 1;
        let stored = Identity {
            internal_id: self.next_identity_id,
            natural_key: identity.natural_key.clone(),
            display_name: identity.display_name.clone(),
            running_total: identity.running_total,
        };
        self.identities.insert(stored.internal_id, stored.clone());
        Ok(stored)
    }

    fn update_identity(
        &mut self,
        internal_id: i64,
        display_name: &str,
        running_total: f64,
    ) -> Result<(), KernelError> {
        let identity = self.identities.get_mut(&internal_id).ok_or_else(|| {
            KernelError::Rejected(format!("identity {internal_id} does not exist"))
        })?;
        identity.display_name = display_name.to_string();
        identity.running_total = running_total;
        Ok(())
    }

    fn insert_fact(&mut self, fact: &NewFact) -> Result<FactRecord, KernelError> {
        if !self.identities.contains_key(&fact.identity_ref) {
            return Err(KernelError::Rejected(format!(
                "identity {} does not exist",
                fact.identity_ref
            )));
        }
        self.next_fact_id += 1;
        let stored = FactRecord {
            fact_id: self.next_fact_id,
            identity_ref: fact.identity_ref,
            category: fact.category.clone(),
            quantity: fact.quantity,
            points: fact.points,
            timestamp: fact.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
        };
        self.facts.push(stored.clone());
        Ok(stored)
    }
}
