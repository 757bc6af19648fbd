use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smartbin_core::{
    parse_calendar_day, BatchOutcome, FactRecord, Identity, IdentityChange, IdentityRef,
    IdentityStore, IdentityUpdate, KernelError, NewFact, NewIdentity, RawDocument, RawEntry,
    Resolution, DAILY_CATEGORY_FIELDS,
};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 2;

/// Collection name under which relational facts are rendered as a daily container.
pub const RELATIONAL_DAILY_ID: &str = "waste_records";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  rfid_code TEXT NOT NULL UNIQUE,
  total_points REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS waste_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  waste_type TEXT NOT NULL CHECK (length(waste_type) > 0),
  quantity REAL NOT NULL,
  points_earned REAL NOT NULL,
  timestamp TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_waste_records_user ON waste_records(user_id);
CREATE INDEX IF NOT EXISTS idx_waste_records_timestamp ON waste_records(timestamp);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS documents (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  collection TEXT NOT NULL CHECK (length(collection) > 0),
  body_json TEXT NOT NULL,
  inserted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionSummary {
    pub collection: String,
    pub documents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed telemetry store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "users")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "users", "rfid_code")? {
            // Users table written by an earlier dashboard deployment without
            // migration records; fill in anything it lacks and adopt it as v1.
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to complete legacy v1 schema")?;
            record_schema_version(&self.conn, 1)?;
            tracing::info!("adopted legacy users table as schema version 1");
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: users table has no rfid_code column"))
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to create documents table")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Upsert identities by natural key inside one transaction.
    ///
    /// Rejected rows are skipped and reported; storage failures roll the batch back.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be opened or committed, or a
    /// storage failure aborts the batch.
    pub fn sync_identities(
        &mut self,
        updates: &[IdentityUpdate],
    ) -> Result<BatchOutcome<IdentityChange>> {
        let tx = self.conn.transaction().context("failed to start identity sync transaction")?;
        let outcome = smartbin_core::sync_identities(&mut ConnectionStore { conn: &tx }, updates)
            .context("identity sync aborted")?;
        tx.commit().context("failed to commit identity sync transaction")?;

        for failure in &outcome.failures {
            tracing::warn!(entry = %failure.entry, reason = %failure.reason, "skipped identity update");
        }
        tracing::info!(
            affected = outcome.affected(),
            skipped = outcome.failures.len(),
            "identity sync applied"
        );
        Ok(outcome)
    }

    /// Resolve and insert fact entries inside one transaction.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be opened or committed, or a
    /// storage failure aborts the batch.
    pub fn sync_facts(&mut self, entries: &[RawEntry]) -> Result<BatchOutcome<FactRecord>> {
        let tx = self.conn.transaction().context("failed to start fact sync transaction")?;
        let outcome = smartbin_core::sync_facts(&mut ConnectionStore { conn: &tx }, entries)
            .context("fact sync aborted")?;
        tx.commit().context("failed to commit fact sync transaction")?;

        for failure in &outcome.failures {
            tracing::warn!(
                entry = %failure.entry,
                reference = failure.reference.as_deref().unwrap_or("-"),
                reason = %failure.reason,
                "skipped fact entry"
            );
        }
        tracing::info!(
            inserted = outcome.affected(),
            skipped = outcome.failures.len(),
            "fact sync applied"
        );
        Ok(outcome)
    }

    /// Resolve one user reference, creating the identity when unknown.
    ///
    /// # Errors
    /// Returns an error when the reference carries no key or the store fails.
    pub fn resolve_identity(
        &mut self,
        reference: &IdentityRef,
        fallback_display_name: Option<&str>,
    ) -> Result<Resolution> {
        let tx = self.conn.transaction().context("failed to start resolve transaction")?;
        let resolution =
            smartbin_core::resolve(&mut ConnectionStore { conn: &tx }, reference, fallback_display_name)
                .with_context(|| format!("failed to resolve {}", reference.describe()))?;
        tx.commit().context("failed to commit resolve transaction")?;
        if resolution.created {
            tracing::info!(internal_id = resolution.internal_id, "created placeholder identity");
        }
        Ok(resolution)
    }

    /// Look up one identity by natural key.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_identity(&self, natural_key: &str) -> Result<Option<Identity>> {
        ConnectionStore { conn: &self.conn }
            .find_identity(natural_key)
            .with_context(|| format!("failed to look up identity {natural_key}"))
    }

    /// Load all identities ordered by internal id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_identities(&self) -> Result<Vec<Identity>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, rfid_code, name, total_points FROM users ORDER BY id ASC")?;
        let rows = stmt.query_map([], identity_from_row)?;

        let mut identities = Vec::new();
        for row in rows {
            identities.push(row.context("failed to decode users row")?);
        }
        Ok(identities)
    }

    /// Load all facts ordered by insertion.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or a stored timestamp is invalid.
    pub fn list_facts(&self) -> Result<Vec<FactRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, waste_type, quantity, points_earned, timestamp
             FROM waste_records
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], StoredFact::from_row)?;

        let mut facts = Vec::new();
        for row in rows {
            let stored = row.context("failed to decode waste_records row")?;
            facts.push(stored.into_record()?);
        }
        Ok(facts)
    }

    /// Append documents to a named collection, preserving their order.
    ///
    /// # Errors
    /// Returns an error when the collection name is empty or any insert fails.
    pub fn insert_documents(&mut self, collection: &str, documents: &[RawDocument]) -> Result<usize> {
        let collection = validated_collection(collection)?;
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start document insert transaction")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO documents(collection, body_json, inserted_at) VALUES (?1, ?2, ?3)",
            )?;
            for document in documents {
                let body =
                    serde_json::to_string(document).context("failed to serialize document")?;
                stmt.execute(params![collection, body, now])
                    .with_context(|| format!("failed to insert document into {collection}"))?;
            }
        }
        tx.commit().context("failed to commit document insert transaction")?;
        tracing::debug!(collection, inserted = documents.len(), "documents inserted");
        Ok(documents.len())
    }

    /// Read every document of a collection in store read order (insertion order).
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or a body is not a JSON object.
    pub fn find(&self, collection: &str) -> Result<Vec<RawDocument>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body_json FROM documents WHERE collection = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![collection], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, body) = row?;
            let value: Value = serde_json::from_str(&body)
                .with_context(|| format!("invalid JSON in document {id} of {collection}"))?;
            let Value::Object(document) = value else {
                return Err(anyhow!("document {id} of {collection} is not a JSON object"));
            };
            documents.push(document);
        }
        Ok(documents)
    }

    /// Delete every document of a collection.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear_collection(&mut self, collection: &str) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM documents WHERE collection = ?1", params![collection])
            .with_context(|| format!("failed to clear collection {collection}"))?;
        tracing::info!(collection, removed, "collection cleared");
        Ok(removed)
    }

    /// Collections with their document counts, by name.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_collections(&self) -> Result<Vec<CollectionSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT collection, COUNT(*) FROM documents GROUP BY collection ORDER BY collection ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut collections = Vec::new();
        for row in rows {
            let (collection, count) = row?;
            collections.push(CollectionSummary {
                collection,
                documents: usize::try_from(count).context("negative document count")?,
            });
        }
        Ok(collections)
    }

    /// Identities rendered as flat user documents keyed by internal id.
    ///
    /// # Errors
    /// Returns an error when identities cannot be read.
    pub fn identity_documents(&self) -> Result<Vec<RawDocument>> {
        Ok(self
            .list_identities()?
            .into_iter()
            .map(|identity| {
                let mut document = Map::new();
                document.insert("_id".to_string(), Value::from(identity.internal_id));
                document.insert("user_id".to_string(), Value::String(identity.internal_id.to_string()));
                document.insert("rfid_code".to_string(), Value::String(identity.natural_key));
                document.insert("name".to_string(), Value::String(identity.display_name));
                document.insert("points".to_string(), Value::from(identity.running_total));
                document
            })
            .collect())
    }

    /// Facts rendered as waste documents.
    ///
    /// # Errors
    /// Returns an error when facts cannot be read.
    pub fn fact_documents(&self) -> Result<Vec<RawDocument>> {
        self.list_facts()?
            .into_iter()
            .map(|fact| -> Result<RawDocument> {
                let mut document = Map::new();
                document.insert("record_id".to_string(), Value::String(fact.fact_id.to_string()));
                document.insert("user_id".to_string(), Value::String(fact.identity_ref.to_string()));
                document.insert("waste_type".to_string(), Value::String(fact.category));
                document.insert("quantity".to_string(), Value::from(fact.quantity));
                document.insert("points_earned".to_string(), Value::from(fact.points));
                document.insert("timestamp".to_string(), Value::String(rfc3339(fact.timestamp)?));
                Ok(document)
            })
            .collect()
    }

    /// Facts summed per UTC day and category as one daily container document.
    ///
    /// Categories outside the fixed daily set count as `other`. Returns no documents
    /// when there are no facts.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn daily_documents(&self) -> Result<Vec<RawDocument>> {
        let mut stmt = self.conn.prepare(
            "SELECT substr(timestamp, 1, 10) AS day, waste_type, SUM(quantity)
             FROM waste_records
             GROUP BY day, waste_type
             ORDER BY day ASC, waste_type ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
        })?;

        let mut days: BTreeMap<String, BTreeMap<&'static str, f64>> = BTreeMap::new();
        for row in rows {
            let (day, waste_type, quantity) = row?;
            if parse_calendar_day(&day).is_none() {
                tracing::warn!(day = %day, "skipping waste records with malformed timestamp");
                continue;
            }
            let category = DAILY_CATEGORY_FIELDS
                .iter()
                .copied()
                .find(|category| *category == waste_type)
                .unwrap_or("other");
            *days.entry(day).or_default().entry(category).or_insert(0.0) += quantity;
        }
        if days.is_empty() {
            return Ok(Vec::new());
        }

        let daily = days
            .into_iter()
            .map(|(day, categories)| {
                let total: f64 = categories.values().sum();
                let mut entry = categories
                    .into_iter()
                    .map(|(category, quantity)| (category.to_string(), Value::from(quantity)))
                    .collect::<Map<String, Value>>();
                entry.insert("total".to_string(), Value::from(total));
                (day, Value::Object(entry))
            })
            .collect::<Map<String, Value>>();

        let mut document = Map::new();
        document.insert("_id".to_string(), Value::String(RELATIONAL_DAILY_ID.to_string()));
        document.insert("daily".to_string(), Value::Object(daily));
        Ok(vec![document])
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

/// [`IdentityStore`] over a borrowed connection or open transaction.
struct ConnectionStore<'c> {
    conn: &'c Connection,
}

impl IdentityStore for ConnectionStore<'_> {
    fn find_identity(&self, natural_key: &str) -> Result<Option<Identity>, KernelError> {
        self.conn
            .query_row(
                "SELECT id, rfid_code, name, total_points FROM users WHERE rfid_code = ?1",
                params![natural_key],
                identity_from_row,
            )
            .optional()
            .map_err(|err| kernel_error(&err, "failed to look up identity"))
    }

    fn insert_identity(&mut self, identity: &NewIdentity) -> Result<Identity, KernelError> {
        self.conn
            .execute(
                "INSERT INTO users(name, rfid_code, total_points) VALUES (?1, ?2, ?3)",
                params![identity.display_name, identity.natural_key, identity.running_total],
            )
            .map_err(|err| kernel_error(&err, "failed to insert identity"))?;

        Ok(Identity {
            internal_id: self.conn.last_insert_rowid(),
            natural_key: identity.natural_key.clone(),
            display_name: identity.display_name.clone(),
            running_total: identity.running_total,
        })
    }

    fn update_identity(
        &mut self,
        internal_id: i64,
        display_name: &str,
        running_total: f64,
    ) -> Result<(), KernelError> {
        let changed = self
            .conn
            .execute(
                "UPDATE users SET name = ?1, total_points = ?2 WHERE id = ?3",
                params![display_name, running_total, internal_id],
            )
            .map_err(|err| kernel_error(&err, "failed to update identity"))?;
        if changed == 0 {
            return Err(KernelError::Rejected(format!("identity {internal_id} does not exist")));
        }
        Ok(())
    }

    fn insert_fact(&mut self, fact: &NewFact) -> Result<FactRecord, KernelError> {
        let timestamp = match fact.timestamp {
            Some(timestamp) => Some(
                rfc3339(timestamp).map_err(|err| KernelError::Validation(err.to_string()))?,
            ),
            None => None,
        };
        self.conn
            .execute(
                "INSERT INTO waste_records(user_id, waste_type, quantity, points_earned, timestamp)
                 VALUES (?1, ?2, ?3, ?4, COALESCE(?5, strftime('%Y-%m-%dT%H:%M:%SZ', 'now')))",
                params![fact.identity_ref, fact.category, fact.quantity, fact.points, timestamp],
            )
            .map_err(|err| kernel_error(&err, "failed to insert fact"))?;

        let fact_id = self.conn.last_insert_rowid();
        let stored = self
            .conn
            .query_row(
                "SELECT id, user_id, waste_type, quantity, points_earned, timestamp
                 FROM waste_records WHERE id = ?1",
                params![fact_id],
                StoredFact::from_row,
            )
            .map_err(|err| kernel_error(&err, "failed to read inserted fact"))?;
        stored.into_record().map_err(|err| KernelError::Store(format!("{err:#}")))
    }
}

struct StoredFact {
    fact_id: i64,
    identity_ref: i64,
    category: String,
    quantity: f64,
    points: f64,
    timestamp: String,
}

impl StoredFact {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            fact_id: row.get(0)?,
            identity_ref: row.get(1)?,
            category: row.get(2)?,
            quantity: row.get(3)?,
            points: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<FactRecord> {
        Ok(FactRecord {
            fact_id: self.fact_id,
            identity_ref: self.identity_ref,
            category: self.category,
            quantity: self.quantity,
            points: self.points,
            timestamp: parse_rfc3339(&self.timestamp)?,
        })
    }
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        internal_id: row.get(0)?,
        natural_key: row.get(1)?,
        display_name: row.get(2)?,
        running_total: row.get(3)?,
    })
}

fn kernel_error(err: &rusqlite::Error, action: &str) -> KernelError {
    if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        KernelError::Rejected(format!("{action}: {err}"))
    } else {
        KernelError::Store(format!("{action}: {err}"))
    }
}

fn validated_collection(collection: &str) -> Result<&str> {
    let trimmed = collection.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("collection name must not be empty"));
    }
    Ok(trimmed)
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "users")? {
        return Ok((0, false));
    }

    if !table_has_column(conn, "users", "rfid_code")? {
        return Err(anyhow!("database schema is invalid: users table has no rfid_code column"));
    }

    if table_exists(conn, "documents")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

/// Stored timestamps are always UTC so day prefixes group by UTC day.
fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
