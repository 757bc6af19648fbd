use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smartbin_core::{FactRecord, Identity, IdentityRef, RawDocument, Resolution};
use smartbin_store_sqlite::{CollectionSummary, IntegrityReport, SchemaStatus, SqliteStore};

pub mod config;
pub mod dashboard;
pub mod sync;

pub use config::{DashboardConfig, DataSource, SmartbinConfig, SyncConfig, DEFAULT_DB_PATH};
pub use dashboard::{DailyTable, DashboardApi};
pub use sync::{PhaseSummary, SyncPhase, SyncReport, SyncRunner};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResult {
    pub collection: String,
    pub inserted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClearResult {
    pub collection: String,
    pub removed: usize,
}

/// Store administration: schema, document collections and identities.
#[derive(Debug, Clone)]
pub struct SmartbinApi {
    db_path: PathBuf,
}

impl SmartbinApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// Append a JSON array (or single object) of documents to a collection.
    ///
    /// # Errors
    /// Returns an error when the payload holds anything but objects or the insert fails.
    pub fn import_documents(&self, collection: &str, payload: Value) -> Result<ImportResult> {
        let documents = documents_from_payload(payload)?;
        let mut store = self.open_migrated()?;
        let inserted = store.insert_documents(collection, &documents)?;
        Ok(ImportResult { collection: collection.to_string(), inserted })
    }

    /// # Errors
    /// Returns an error when the collection cannot be read.
    pub fn list_documents(&self, collection: &str) -> Result<Vec<RawDocument>> {
        self.open_migrated()?.find(collection)
    }

    /// # Errors
    /// Returns an error when collections cannot be listed.
    pub fn list_collections(&self) -> Result<Vec<CollectionSummary>> {
        self.open_migrated()?.list_collections()
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear_collection(&self, collection: &str) -> Result<ClearResult> {
        let removed = self.open_migrated()?.clear_collection(collection)?;
        Ok(ClearResult { collection: collection.to_string(), removed })
    }

    /// # Errors
    /// Returns an error when identities cannot be read.
    pub fn list_identities(&self) -> Result<Vec<Identity>> {
        self.open_migrated()?.list_identities()
    }

    /// # Errors
    /// Returns an error when facts cannot be read.
    pub fn list_facts(&self) -> Result<Vec<FactRecord>> {
        self.open_migrated()?.list_facts()
    }

    /// Resolve a natural key to an internal id, registering it when unknown.
    ///
    /// # Errors
    /// Returns an error when the key is blank or the store fails.
    pub fn resolve_identity(&self, natural_key: &str, name: Option<&str>) -> Result<Resolution> {
        self.open_migrated()?.resolve_identity(&IdentityRef::by_key(natural_key), name)
    }
}

fn documents_from_payload(payload: Value) -> Result<Vec<RawDocument>> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(document) => return Ok(vec![document]),
        _ => return Err(anyhow!("documents payload must be a JSON object or array")),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(document) => Ok(document),
            _ => Err(anyhow!("document #{index} is not a JSON object")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("smartbin-api-{}.sqlite3", ulid::Ulid::new()))
    }

    // Test IDs: TAPI-001
    #[test]
    fn migrate_dry_run_reports_plan_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = SmartbinApi::new(db_path.clone());

        let plan = api.migrate(true)?;
        assert_eq!(plan.would_apply_versions, vec![1, 2]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn import_list_and_clear_documents() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = SmartbinApi::new(db_path.clone());

        let imported = api.import_documents(
            "users",
            json!([{"user_id": "u1", "name": "Ann"}, {"user_id": "u2", "name": "Bo"}]),
        )?;
        assert_eq!(imported.inserted, 2);
        assert_eq!(api.import_documents("users", json!({"user_id": "u3"}))?.inserted, 1);
        assert!(api.import_documents("users", json!([1, 2])).is_err());

        assert_eq!(api.list_documents("users")?.len(), 3);
        assert_eq!(api.list_collections()?.len(), 1);
        assert_eq!(api.clear_collection("users")?.removed, 3);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn resolve_identity_is_stable_across_calls() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = SmartbinApi::new(db_path.clone());

        let first = api.resolve_identity("RFID42", None)?;
        let second = api.resolve_identity("RFID42", Some("Later Name"))?;

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.internal_id, second.internal_id);
        assert_eq!(api.list_identities()?[0].display_name, "User RFID42");
        assert!(api.resolve_identity("   ", None).is_err());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
