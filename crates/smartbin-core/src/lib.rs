//! Smart-bin telemetry reconciliation: shape detection, flattening, latest-state
//! reduction, dashboard reports, identity resolution and the upsert executor.

use serde::{Deserialize, Serialize};

pub mod document;
pub mod facts;
pub mod flatten;
pub mod identity;
pub mod reduce;
pub mod report;
pub mod shape;

pub use document::{parse_calendar_day, parse_timestamp_str, probe_timestamp, RawDocument};
pub use facts::{fact_entries, sync_facts, FactEntry, RawEntry};
pub use flatten::{flatten, FlatRecord, DAILY_CATEGORY_FIELDS};
pub use identity::{
    parse_identity_updates, placeholder_display_name, resolve, sync_identities, ChangeAction,
    FactRecord, Identity, IdentityChange, IdentityRef, IdentityStore, IdentityUpdate,
    InMemoryStore, NewFact, NewIdentity, Resolution,
};
pub use reduce::{
    daily_grand_total, daily_rows, normalize_batch, normalize_expecting, reduce, CanonicalRow,
    Fallback, NormalizedTable, RowFilter,
};
pub use report::{
    leaderboard, points_by_user, waste_distribution, waste_log, LeaderboardEntry, Medal,
    UserPointsTotal, WasteLogEntry, WasteShare, UNKNOWN_USER_NAME,
};
pub use shape::{detect, NestedKind, Shape};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("empty batch: shape detection needs at least one document")]
    EmptyBatch,
    #[error("missing key: {0}")]
    MissingKey(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("rejected by store: {0}")]
    Rejected(String),
    #[error("store error: {0}")]
    Store(String),
}

impl KernelError {
    /// Whether the error concerns a single batch entry and the batch may continue.
    #[must_use]
    pub fn is_entry_local(&self) -> bool {
        matches!(self, Self::MissingKey(_) | Self::Validation(_) | Self::Rejected(_))
    }
}

/// Why one entry of a best-effort batch was skipped.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntryFailure {
    /// Position or key of the entry in its source file.
    pub entry: String,
    pub reference: Option<String>,
    pub reason: String,
}

/// Result of a partial-failure-tolerant batch apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchOutcome<T> {
    pub applied: Vec<T>,
    pub failures: Vec<EntryFailure>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self { applied: Vec::new(), failures: Vec::new() }
    }
}

impl<T> BatchOutcome<T> {
    #[must_use]
    pub fn affected(&self) -> usize {
        self.applied.len()
    }
}
