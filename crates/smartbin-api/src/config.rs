use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DB_PATH: &str = "./smartbin.sqlite3";

/// Deployment settings, read from YAML. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SmartbinConfig {
    pub database: PathBuf,
    pub sync: SyncConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Identity updates keyed by natural key.
    pub points_file: PathBuf,
    /// Optional list or map of waste fact entries.
    pub facts_file: Option<PathBuf>,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Document collections stored in the `documents` table.
    Documents,
    /// `users` and `waste_records` rows rendered as documents.
    Relational,
}

impl DataSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::Relational => "relational",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "documents" => Some(Self::Documents),
            "relational" => Some(Self::Relational),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DashboardConfig {
    pub source: DataSource,
    /// Zero disables caching.
    pub cache_ttl_secs: u64,
    pub users_collection: String,
    pub waste_collection: String,
    pub daily_collection: String,
    /// Display names hidden from user tables, compared case-insensitively.
    pub exclude_names: Vec<String>,
}

impl Default for SmartbinConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DB_PATH),
            sync: SyncConfig::default(),
            dashboard: DashboardConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { points_file: PathBuf::from("point.json"), facts_file: None, interval_secs: 10 }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            source: DataSource::Documents,
            cache_ttl_secs: 60,
            users_collection: "users".to_string(),
            waste_collection: "waste".to_string(),
            daily_collection: "daily".to_string(),
            exclude_names: Vec::new(),
        }
    }
}

impl SmartbinConfig {
    /// Parse and validate a YAML configuration document.
    ///
    /// # Errors
    /// Returns an error for malformed YAML, unknown keys, or invalid values.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("invalid smartbin config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration file at `path`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("in config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when a value is out of range or a collection name is empty.
    pub fn validate(&self) -> Result<()> {
        if self.sync.interval_secs == 0 {
            return Err(anyhow!("sync.interval_secs must be at least 1"));
        }
        for (field, value) in [
            ("dashboard.users_collection", &self.dashboard.users_collection),
            ("dashboard.waste_collection", &self.dashboard.waste_collection),
            ("dashboard.daily_collection", &self.dashboard.daily_collection),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{field} must not be empty"));
            }
        }
        Ok(())
    }
}
