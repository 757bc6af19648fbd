use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smartbin_core::{
    fact_entries, parse_identity_updates, EntryFailure, IdentityUpdate, RawEntry,
};
use smartbin_store_sqlite::SqliteStore;
use time::OffsetDateTime;

use crate::config::SyncConfig;

/// Stage of one sync cycle. A cycle always ends back in `Idle`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    ReadingJson,
    SyncingIdentities,
    SyncingFacts,
}

impl SyncPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ReadingJson => "reading_json",
            Self::SyncingIdentities => "syncing_identities",
            Self::SyncingFacts => "syncing_facts",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseSummary {
    pub affected: usize,
    /// Entries skipped while parsing or applying.
    pub failures: Vec<EntryFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub cycle: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub identities: Option<PhaseSummary>,
    pub facts: Option<PhaseSummary>,
    /// Phase in which the cycle was abandoned, if it was.
    pub aborted_in: Option<SyncPhase>,
    pub error: Option<String>,
}

impl SyncReport {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.aborted_in.is_none()
    }
}

struct CycleInput {
    updates: Vec<IdentityUpdate>,
    update_failures: Vec<EntryFailure>,
    facts: Option<Vec<RawEntry>>,
}

/// Periodically merges the JSON telemetry files into the relational store.
#[derive(Debug, Clone)]
pub struct SyncRunner {
    db_path: PathBuf,
    config: SyncConfig,
}

impl SyncRunner {
    #[must_use]
    pub fn new(db_path: PathBuf, config: SyncConfig) -> Self {
        Self { db_path, config }
    }

    /// Run one `ReadingJson -> SyncingIdentities -> SyncingFacts` cycle.
    ///
    /// Failures never escape: a read, parse or store failure ends the cycle early
    /// and is recorded in the report.
    #[must_use]
    pub fn run_cycle(&self, cycle: u64) -> SyncReport {
        let mut report = SyncReport {
            cycle,
            started_at: OffsetDateTime::now_utc(),
            identities: None,
            facts: None,
            aborted_in: None,
            error: None,
        };

        let mut phase = SyncPhase::ReadingJson;
        if let Err(err) = self.advance(&mut phase, &mut report) {
            tracing::error!(
                cycle,
                phase = phase.as_str(),
                error = %format!("{err:#}"),
                "sync cycle aborted"
            );
            report.aborted_in = Some(phase);
            report.error = Some(format!("{err:#}"));
        }
        tracing::debug!(cycle, phase = SyncPhase::Idle.as_str(), "sync cycle finished");
        report
    }

    fn advance(&self, phase: &mut SyncPhase, report: &mut SyncReport) -> Result<()> {
        tracing::debug!(cycle = report.cycle, phase = phase.as_str(), "sync phase");
        let input = self.read_input()?;

        *phase = SyncPhase::SyncingIdentities;
        tracing::debug!(cycle = report.cycle, phase = phase.as_str(), "sync phase");
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        let outcome = store.sync_identities(&input.updates)?;
        for failure in &input.update_failures {
            tracing::warn!(
                entry = %failure.entry,
                reason = %failure.reason,
                "skipped malformed identity update"
            );
        }
        let mut failures = input.update_failures;
        failures.extend(outcome.failures);
        report.identities = Some(PhaseSummary { affected: outcome.applied.len(), failures });

        let Some(entries) = input.facts else {
            return Ok(());
        };
        *phase = SyncPhase::SyncingFacts;
        tracing::debug!(cycle = report.cycle, phase = phase.as_str(), "sync phase");
        let outcome = store.sync_facts(&entries)?;
        report.facts =
            Some(PhaseSummary { affected: outcome.applied.len(), failures: outcome.failures });
        Ok(())
    }

    fn read_input(&self) -> Result<CycleInput> {
        let points = read_json(&self.config.points_file)?;
        let parsed = parse_identity_updates(&points).with_context(|| {
            format!("unexpected layout in {}", self.config.points_file.display())
        })?;

        let facts = match &self.config.facts_file {
            Some(path) if path.exists() => Some(
                fact_entries(&read_json(path)?)
                    .with_context(|| format!("unexpected layout in {}", path.display()))?,
            ),
            Some(path) => {
                tracing::debug!(path = %path.display(), "facts file not present yet");
                None
            }
            None => None,
        };

        Ok(CycleInput { updates: parsed.applied, update_failures: parsed.failures, facts })
    }

    /// Run cycles every `interval_secs`, forever or until `max_cycles` have run.
    ///
    /// Each finished report is handed to `on_cycle`; a failed cycle does not stop
    /// the loop.
    pub fn run_loop<F>(&self, max_cycles: Option<u64>, mut on_cycle: F)
    where
        F: FnMut(&SyncReport),
    {
        let interval = Duration::from_secs(self.config.interval_secs);
        let mut cycle = 0_u64;
        loop {
            cycle += 1;
            let report = self.run_cycle(cycle);
            if report.succeeded() {
                tracing::info!(
                    cycle,
                    identities = report.identities.as_ref().map_or(0, |s| s.affected),
                    facts = report.facts.as_ref().map_or(0, |s| s.affected),
                    "sync cycle done"
                );
            }
            on_cycle(&report);

            if max_cycles.is_some_and(|max| cycle >= max) {
                return;
            }
            tracing::debug!(seconds = interval.as_secs(), "waiting for next sync cycle");
            thread::sleep(interval);
        }
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    struct Fixture {
        dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let dir = std::env::temp_dir().join(format!("smartbin-sync-{}", ulid::Ulid::new()));
            fs::create_dir_all(&dir)?;
            Ok(Self { dir })
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.join(name)
        }

        fn write(&self, name: &str, contents: &str) -> Result<PathBuf> {
            let path = self.path(name);
            fs::write(&path, contents)?;
            Ok(path)
        }

        fn runner(&self, facts_file: Option<PathBuf>) -> SyncRunner {
            SyncRunner::new(
                self.path("smartbin.sqlite3"),
                SyncConfig { points_file: self.path("point.json"), facts_file, interval_secs: 1 },
            )
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    // Test IDs: TSYN-001
    #[test]
    fn cycle_upserts_identities_then_inserts_facts() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.write("point.json", r#"{"RFID1": {"name": "Ann", "points": 10}, "RFID2": {"name": "Bo"}}"#)?;
        let facts = fixture.write(
            "waste.json",
            r#"[{"rfid": "RFID1", "waste_type": "can", "quantity": 1, "points": 2},
                {"rfid": "RFID9", "waste_type": "glass", "quantity": 2, "points": 4}]"#,
        )?;

        let report = fixture.runner(Some(facts)).run_cycle(1);

        assert!(report.succeeded(), "cycle failed: {:?}", report.error);
        let identities = report.identities.unwrap_or_else(|| panic!("identity phase missing"));
        assert_eq!(identities.affected, 1);
        assert_eq!(identities.failures.len(), 1);
        let facts = report.facts.unwrap_or_else(|| panic!("fact phase missing"));
        assert_eq!(facts.affected, 2);

        let store = SqliteStore::open(&fixture.path("smartbin.sqlite3"))?;
        assert_eq!(store.list_identities()?.len(), 2);
        Ok(())
    }

    // Test IDs: TSYN-002
    #[test]
    fn unreadable_points_file_aborts_only_that_cycle() -> Result<()> {
        let fixture = Fixture::new()?;
        let runner = fixture.runner(None);

        let missing = runner.run_cycle(1);
        assert_eq!(missing.aborted_in, Some(SyncPhase::ReadingJson));
        assert!(missing.identities.is_none());

        fixture.write("point.json", "{ not json")?;
        assert_eq!(runner.run_cycle(2).aborted_in, Some(SyncPhase::ReadingJson));

        fixture.write("point.json", r#"{"RFID1": {"name": "Ann", "points": 3}}"#)?;
        let recovered = runner.run_cycle(3);
        assert!(recovered.succeeded());
        assert!(recovered.facts.is_none());
        Ok(())
    }

    // Test IDs: TSYN-003
    #[test]
    fn loop_stops_after_max_cycles_without_duplicating_identities() -> Result<()> {
        let fixture = Fixture::new()?;
        let runner = fixture.runner(None);
        let mut cycles = Vec::new();

        fixture.write("point.json", r#"{"RFID1": {"name": "Ann", "points": 10}}"#)?;
        runner.run_loop(Some(2), |report| cycles.push(report.cycle));

        let store = SqliteStore::open(&fixture.path("smartbin.sqlite3"))?;
        let identities = store.list_identities()?;
        assert_eq!(cycles, vec![1, 2]);
        assert_eq!(identities.len(), 1);
        assert!((identities[0].running_total - 10.0).abs() < f64::EPSILON);
        Ok(())
    }
}
