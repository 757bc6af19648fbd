use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use smartbin_api::{DashboardApi, DataSource, SmartbinApi, SmartbinConfig, SyncRunner};
use smartbin_core::parse_calendar_day;
use time::Date;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "smartbin")]
#[command(about = "Smart-bin telemetry sync and dashboard tooling")]
struct Cli {
    /// `SQLite` database path. Overrides `database` from the config file.
    #[arg(long)]
    db: Option<PathBuf>,
    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Docs {
        #[command(subcommand)]
        command: Box<DocsCommand>,
    },
    Identity {
        #[command(subcommand)]
        command: Box<IdentityCommand>,
    },
    Sync {
        #[command(subcommand)]
        command: Box<SyncCommand>,
    },
    Dashboard {
        /// Read from `documents` or `relational` tables instead of the configured source.
        #[arg(long)]
        source: Option<String>,
        #[command(subcommand)]
        command: Box<DashboardCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum DocsCommand {
    /// Append the JSON array (or object) in `--file` to a collection.
    Import(DocsImportArgs),
    List(CollectionArgs),
    Collections,
    Clear(CollectionArgs),
}

#[derive(Debug, Args)]
struct DocsImportArgs {
    #[arg(long)]
    collection: String,
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct CollectionArgs {
    #[arg(long)]
    collection: String,
}

#[derive(Debug, Subcommand)]
enum IdentityCommand {
    List,
    Facts,
    Resolve(IdentityResolveArgs),
}

#[derive(Debug, Args)]
struct IdentityResolveArgs {
    #[arg(long)]
    key: String,
    /// Display name used only when the key is not registered yet.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    Run(SyncRunArgs),
}

#[derive(Debug, Args)]
struct SyncRunArgs {
    /// Run a single cycle and exit.
    #[arg(long, conflicts_with = "cycles")]
    once: bool,
    /// Stop after this many cycles.
    #[arg(long)]
    cycles: Option<u64>,
    #[arg(long)]
    points_file: Option<PathBuf>,
    #[arg(long)]
    facts_file: Option<PathBuf>,
    #[arg(long)]
    interval_secs: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum DashboardCommand {
    Leaderboard,
    Users,
    Daily(DailyArgs),
    PointsByUser,
    WasteDistribution,
    WasteLog(WasteLogArgs),
}

#[derive(Debug, Args)]
struct DailyArgs {
    /// First day to include, `YYYY-MM-DD`.
    #[arg(long)]
    from: Option<String>,
    /// Last day to include, `YYYY-MM-DD`.
    #[arg(long)]
    to: Option<String>,
}

#[derive(Debug, Args)]
struct WasteLogArgs {
    #[arg(long)]
    limit: Option<usize>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> Result<SmartbinConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => SmartbinConfig::load(path)?,
        None => SmartbinConfig::default(),
    };
    if let Some(db) = cli.db.as_ref() {
        config.database.clone_from(db);
    }
    Ok(config)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    tracing::debug!(database = %config.database.display(), "configuration loaded");

    match cli.command {
        Command::Db { command } => run_db(*command, &SmartbinApi::new(config.database)),
        Command::Docs { command } => run_docs(*command, &SmartbinApi::new(config.database)),
        Command::Identity { command } => {
            run_identity(*command, &SmartbinApi::new(config.database))
        }
        Command::Sync { command } => run_sync(*command, config),
        Command::Dashboard { source, command } => {
            run_dashboard(*command, source.as_deref(), config)
        }
    }
}

fn run_db(command: DbCommand, api: &SmartbinApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, api),
        DbCommand::IntegrityCheck => emit_json(serde_json::to_value(api.integrity_check()?)?),
    }
}

fn run_db_migrate(args: &DbMigrateArgs, api: &SmartbinApi) -> Result<()> {
    let result = api.migrate(args.dry_run)?;
    if result.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": result.current_version,
            "target_version": result.target_version,
            "would_apply_versions": result.would_apply_versions,
            "inferred_from_legacy": result.inferred_from_legacy
        }));
    }

    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": result.current_version,
        "applied_versions": result.would_apply_versions,
        "after_version": result.after_version,
        "target_version": result.target_version,
        "up_to_date": result.up_to_date
    }))
}

fn run_docs(command: DocsCommand, api: &SmartbinApi) -> Result<()> {
    match command {
        DocsCommand::Import(args) => {
            let payload = read_json_file(&args.file)?;
            let result = api.import_documents(&args.collection, payload)?;
            tracing::info!(
                collection = %result.collection,
                inserted = result.inserted,
                "documents imported"
            );
            emit_json(serde_json::to_value(result)?)
        }
        DocsCommand::List(args) => {
            let documents = api.list_documents(&args.collection)?;
            emit_json(serde_json::json!({
                "collection": args.collection,
                "documents": documents
            }))
        }
        DocsCommand::Collections => {
            emit_json(serde_json::json!({ "collections": api.list_collections()? }))
        }
        DocsCommand::Clear(args) => {
            emit_json(serde_json::to_value(api.clear_collection(&args.collection)?)?)
        }
    }
}

fn run_identity(command: IdentityCommand, api: &SmartbinApi) -> Result<()> {
    match command {
        IdentityCommand::List => {
            emit_json(serde_json::json!({ "identities": api.list_identities()? }))
        }
        IdentityCommand::Facts => emit_json(serde_json::json!({ "facts": api.list_facts()? })),
        IdentityCommand::Resolve(args) => {
            let resolution = api.resolve_identity(&args.key, args.name.as_deref())?;
            emit_json(serde_json::json!({
                "natural_key": args.key.trim(),
                "internal_id": resolution.internal_id,
                "created": resolution.created
            }))
        }
    }
}

fn run_sync(command: SyncCommand, config: SmartbinConfig) -> Result<()> {
    match command {
        SyncCommand::Run(args) => {
            let mut sync = config.sync;
            if let Some(path) = args.points_file {
                sync.points_file = path;
            }
            if args.facts_file.is_some() {
                sync.facts_file = args.facts_file;
            }
            if let Some(seconds) = args.interval_secs {
                if seconds == 0 {
                    return Err(anyhow!("--interval-secs must be at least 1"));
                }
                sync.interval_secs = seconds;
            }

            let max_cycles = if args.once { Some(1) } else { args.cycles };
            let runner = SyncRunner::new(config.database, sync);
            let mut emitted = Ok(());
            runner.run_loop(max_cycles, |report| {
                if emitted.is_ok() {
                    emitted = serde_json::to_value(report)
                        .map_err(anyhow::Error::from)
                        .and_then(emit_json);
                }
            });
            emitted
        }
    }
}

fn run_dashboard(
    command: DashboardCommand,
    source: Option<&str>,
    config: SmartbinConfig,
) -> Result<()> {
    let mut dashboard_config = config.dashboard;
    if let Some(raw) = source {
        dashboard_config.source = DataSource::parse(raw)
            .ok_or_else(|| anyhow!("unknown source {raw:?}, expected documents or relational"))?;
    }
    let source = dashboard_config.source;
    let dashboard = DashboardApi::new(config.database, dashboard_config);

    let (table, data) = match command {
        DashboardCommand::Leaderboard => {
            ("leaderboard", serde_json::to_value(dashboard.leaderboard()?)?)
        }
        DashboardCommand::Users => ("users", serde_json::to_value(dashboard.users_table()?)?),
        DashboardCommand::Daily(args) => {
            let from = parse_day_arg("--from", args.from.as_deref())?;
            let to = parse_day_arg("--to", args.to.as_deref())?;
            ("daily", serde_json::to_value(dashboard.daily(from, to)?)?)
        }
        DashboardCommand::PointsByUser => {
            ("points_by_user", serde_json::to_value(dashboard.points_by_user()?)?)
        }
        DashboardCommand::WasteDistribution => {
            ("waste_distribution", serde_json::to_value(dashboard.waste_distribution()?)?)
        }
        DashboardCommand::WasteLog(args) => {
            ("waste_log", serde_json::to_value(dashboard.waste_log(args.limit)?)?)
        }
    };

    emit_json(serde_json::json!({
        "table": table,
        "source": source.as_str(),
        "data": data
    }))
}

fn parse_day_arg(flag: &str, value: Option<&str>) -> Result<Option<Date>> {
    value
        .map(|raw| {
            parse_calendar_day(raw).ok_or_else(|| anyhow!("{flag} expects YYYY-MM-DD, got {raw:?}"))
        })
        .transpose()
}

fn read_json_file(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read JSON file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}
