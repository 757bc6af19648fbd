use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use smartbin_core::{
    daily_grand_total, daily_rows, leaderboard, normalize_batch, normalize_expecting,
    points_by_user, waste_distribution, waste_log, CanonicalRow, LeaderboardEntry, NestedKind,
    NormalizedTable, RawDocument, RowFilter, Shape, UserPointsTotal, WasteLogEntry, WasteShare,
};
use smartbin_store_sqlite::SqliteStore;
use time::Date;

use crate::config::{DashboardConfig, DataSource};

/// Logical batches the dashboard reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Batch {
    Users,
    Waste,
    Daily,
}

impl Batch {
    fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Waste => "waste",
            Self::Daily => "daily",
        }
    }
}

struct CachedBatch {
    documents: Arc<Vec<RawDocument>>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyTable {
    pub rows: Vec<CanonicalRow>,
    pub grand_total: f64,
}

/// Read facade computing dashboard tables from the configured source.
///
/// Raw batch reads are cached per batch for `cache_ttl_secs`. Expiry is the only
/// invalidation, so writes made meanwhile show up once the entry expires.
#[derive(Clone)]
pub struct DashboardApi {
    db_path: PathBuf,
    config: DashboardConfig,
    cache: Arc<Mutex<HashMap<Batch, CachedBatch>>>,
}

impl DashboardApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: DashboardConfig) -> Self {
        Self { db_path, config, cache: Arc::new(Mutex::new(HashMap::new())) }
    }

    #[must_use]
    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    /// Latest user rows ranked by points, excluding configured names.
    ///
    /// # Errors
    /// Returns an error when the users batch cannot be read or holds daily documents.
    pub fn leaderboard(&self) -> Result<Vec<LeaderboardEntry>> {
        Ok(leaderboard(&self.user_rows()?))
    }

    /// Latest user table before ranking.
    ///
    /// # Errors
    /// Returns an error when the users batch cannot be read or holds daily documents.
    pub fn users_table(&self) -> Result<NormalizedTable> {
        let filter = RowFilter {
            exclude_names: self.config.exclude_names.clone(),
            ..RowFilter::default()
        };
        let documents = self.load(Batch::Users)?;
        let table = normalize_batch(&documents, &filter);
        if table.shape == Some(Shape::Nested(NestedKind::PerDay)) {
            return Err(anyhow!(
                "users batch holds daily aggregate documents; check dashboard.users_collection"
            ));
        }
        Ok(table)
    }

    /// Daily category totals, latest per day, within an optional inclusive day range.
    ///
    /// # Errors
    /// Returns an error when the daily batch cannot be read or is not daily-shaped.
    pub fn daily(&self, from_day: Option<Date>, to_day: Option<Date>) -> Result<DailyTable> {
        if let (Some(from), Some(to)) = (from_day, to_day) {
            if from > to {
                return Err(anyhow!("day range is empty: {from} is after {to}"));
            }
        }
        let filter = RowFilter { from_day, to_day, ..RowFilter::default() };
        let documents = self.load(Batch::Daily)?;
        let table = normalize_expecting(&documents, Shape::Nested(NestedKind::PerDay), &filter)
            .context("daily batch has the wrong shape")?;
        let rows = daily_rows(&table);
        let grand_total = daily_grand_total(&rows);
        Ok(DailyTable { rows, grand_total })
    }

    /// Points earned per user from waste facts, joined to user names.
    ///
    /// # Errors
    /// Returns an error when the waste or users batch cannot be read.
    pub fn points_by_user(&self) -> Result<Vec<UserPointsTotal>> {
        let waste = self.load(Batch::Waste)?;
        let users = self.users_table()?;
        Ok(points_by_user(&waste, &users.rows))
    }

    /// # Errors
    /// Returns an error when the waste batch cannot be read.
    pub fn waste_distribution(&self) -> Result<Vec<WasteShare>> {
        Ok(waste_distribution(&self.load(Batch::Waste)?))
    }

    /// Waste facts newest first, truncated to `limit` when given.
    ///
    /// # Errors
    /// Returns an error when the waste batch cannot be read.
    pub fn waste_log(&self, limit: Option<usize>) -> Result<Vec<WasteLogEntry>> {
        let mut entries = waste_log(&self.load(Batch::Waste)?);
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    fn user_rows(&self) -> Result<Vec<CanonicalRow>> {
        Ok(self.users_table()?.rows)
    }

    fn load(&self, batch: Batch) -> Result<Arc<Vec<RawDocument>>> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        if !ttl.is_zero() {
            let cache = self.cache.lock().map_err(|_| anyhow!("dashboard cache lock poisoned"))?;
            if let Some(cached) = cache.get(&batch) {
                if Instant::now() < cached.expires_at {
                    return Ok(Arc::clone(&cached.documents));
                }
            }
        }

        let documents = Arc::new(self.read_batch(batch)?);
        tracing::debug!(
            batch = batch.as_str(),
            source = self.config.source.as_str(),
            documents = documents.len(),
            "dashboard batch read"
        );

        if !ttl.is_zero() {
            let mut cache =
                self.cache.lock().map_err(|_| anyhow!("dashboard cache lock poisoned"))?;
            cache.insert(
                batch,
                CachedBatch { documents: Arc::clone(&documents), expires_at: Instant::now() + ttl },
            );
        }
        Ok(documents)
    }

    fn read_batch(&self, batch: Batch) -> Result<Vec<RawDocument>> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        match (self.config.source, batch) {
            (DataSource::Documents, Batch::Users) => store.find(&self.config.users_collection),
            (DataSource::Documents, Batch::Waste) => store.find(&self.config.waste_collection),
            (DataSource::Documents, Batch::Daily) => store.find(&self.config.daily_collection),
            (DataSource::Relational, Batch::Users) => store.identity_documents(),
            (DataSource::Relational, Batch::Waste) => store.fact_documents(),
            (DataSource::Relational, Batch::Daily) => store.daily_documents(),
        }
        .with_context(|| format!("failed to read {} batch", batch.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::{json, Value};
    use smartbin_core::{fact_entries, IdentityUpdate, Medal};
    use time::macros::date;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("smartbin-dashboard-{}.sqlite3", ulid::Ulid::new()))
    }

    fn docs(value: Value) -> Vec<RawDocument> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => map,
                    other => panic!("fixture entries must be objects: {other}"),
                })
                .collect(),
            other => panic!("fixture must be an array: {other}"),
        }
    }

    fn seeded_store(db_path: &Path) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn config(source: DataSource, cache_ttl_secs: u64) -> DashboardConfig {
        DashboardConfig { source, cache_ttl_secs, ..DashboardConfig::default() }
    }

    // Test IDs: TDSH-001
    #[test]
    fn leaderboard_reduces_user_documents_and_excludes_names() -> Result<()> {
        let db_path = unique_temp_db_path();
        let mut store = seeded_store(&db_path)?;
        store.insert_documents(
            "users",
            &docs(json!([
                {"user_id": "u1", "name": "Ann", "points": 10, "timestamp": "2024-01-01"},
                {"user_id": "u1", "name": "Ann", "points": 15, "timestamp": "2024-01-02"},
                {"user_id": "u2", "name": "Bo", "points": 30},
                {"user_id": "u3", "name": "Admin", "points": 99}
            ])),
        )?;
        let api = DashboardApi::new(
            db_path.clone(),
            DashboardConfig { exclude_names: vec!["admin".to_string()], ..config(DataSource::Documents, 0) },
        );

        let board = api.leaderboard()?;

        assert_eq!(board.len(), 2);
        assert_eq!(board[0].entity_key, "u2");
        assert_eq!(board[0].medal, Some(Medal::Gold));
        assert!((board[1].points - 15.0).abs() < f64::EPSILON);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDSH-002
    #[test]
    fn cached_batches_serve_stale_reads_until_expiry() -> Result<()> {
        let db_path = unique_temp_db_path();
        let mut store = seeded_store(&db_path)?;
        store.insert_documents("users", &docs(json!([{"user_id": "u1", "name": "Ann", "points": 1}])))?;

        let cached = DashboardApi::new(db_path.clone(), config(DataSource::Documents, 3600));
        let uncached = DashboardApi::new(db_path.clone(), config(DataSource::Documents, 0));
        assert_eq!(cached.leaderboard()?.len(), 1);

        store.insert_documents("users", &docs(json!([{"user_id": "u2", "name": "Bo", "points": 2}])))?;

        assert_eq!(cached.leaderboard()?.len(), 1);
        assert_eq!(uncached.leaderboard()?.len(), 2);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDSH-003
    #[test]
    fn daily_table_keeps_latest_container_per_day_within_range() -> Result<()> {
        let db_path = unique_temp_db_path();
        let mut store = seeded_store(&db_path)?;
        store.insert_documents(
            "daily",
            &docs(json!([
                {"_id": "w1", "updated_at": "2024-03-01T00:00:00Z",
                 "daily": {"2024-03-01": {"can": 5}, "2024-02-28": {"can": 1}}},
                {"_id": "w2", "updated_at": "2024-03-02T00:00:00Z",
                 "daily": {"2024-03-01": {"can": 9}, "2024-03-02": {"paper": 2}}}
            ])),
        )?;
        let api = DashboardApi::new(db_path.clone(), config(DataSource::Documents, 0));

        let table = api.daily(Some(date!(2024 - 03 - 01)), None)?;

        let days = table.rows.iter().map(|row| row.entity_key.as_str()).collect::<Vec<_>>();
        assert_eq!(days, vec!["2024-03-01", "2024-03-02"]);
        assert_eq!(table.rows[0].number("total"), Some(9.0));
        assert!((table.grand_total - 11.0).abs() < f64::EPSILON);
        assert!(api.daily(Some(date!(2024 - 03 - 02)), Some(date!(2024 - 03 - 01))).is_err());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDSH-004
    #[test]
    fn relational_source_feeds_every_report() -> Result<()> {
        let db_path = unique_temp_db_path();
        let mut store = seeded_store(&db_path)?;
        store.sync_identities(&[IdentityUpdate {
            natural_key: "RFID1".to_string(),
            display_name: "Ann".to_string(),
            measure: 12.0,
        }])?;
        store.sync_facts(&fact_entries(&json!([
            {"rfid": "RFID1", "waste_type": "can", "quantity": 3, "points": 6,
             "timestamp": "2024-03-01T08:00:00Z"},
            {"rfid": "RFID2", "waste_type": "glass", "quantity": 1, "points": 2,
             "timestamp": "2024-03-02T08:00:00Z"}
        ]))?)?;
        let api = DashboardApi::new(db_path.clone(), config(DataSource::Relational, 60));

        let board = api.leaderboard()?;
        assert_eq!(board[0].name, "Ann");
        assert_eq!(board.len(), 2);

        let totals = api.points_by_user()?;
        assert_eq!(totals[0].name, "Ann");
        assert!((totals[0].total_points - 6.0).abs() < f64::EPSILON);

        let shares = api.waste_distribution()?;
        assert!((shares[0].percent - 75.0).abs() < 1e-9);

        let log = api.waste_log(Some(1))?;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].waste_type.as_deref(), Some("glass"));

        assert_eq!(api.daily(None, None)?.rows.len(), 2);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDSH-005
    #[test]
    fn fresh_database_gives_empty_tables() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DashboardApi::new(db_path.clone(), config(DataSource::Documents, 0));

        assert!(api.leaderboard()?.is_empty());
        assert!(api.daily(None, None)?.rows.is_empty());
        assert!(api.waste_distribution()?.is_empty());
        let relational = DashboardApi::new(db_path.clone(), config(DataSource::Relational, 0));
        assert!(relational.leaderboard()?.is_empty());
        assert!(relational.daily(None, None)?.rows.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
