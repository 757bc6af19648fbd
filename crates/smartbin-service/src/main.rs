use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use smartbin_api::{
    DailyTable, DashboardApi, ImportResult, SmartbinApi, SmartbinConfig, SyncReport, SyncRunner,
    API_CONTRACT_VERSION,
};
use smartbin_core::{
    parse_calendar_day, LeaderboardEntry, NormalizedTable, UserPointsTotal, WasteLogEntry,
    WasteShare,
};
use time::Date;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: SmartbinApi,
    dashboard: DashboardApi,
    sync: SyncRunner,
    sync_cycles: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ResolveRequest {
    natural_key: String,
    display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ResolveResponse {
    natural_key: String,
    internal_id: i64,
    created: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DailyQuery {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WasteLogQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    source: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "smartbin-service")]
#[command(about = "Local HTTP service serving smart-bin dashboard tables")]
struct Args {
    /// `SQLite` database path. Overrides `database` from the config file.
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// Also run the sync loop on a background thread.
    #[arg(long)]
    sync: bool,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn from_config(config: SmartbinConfig) -> Self {
        Self {
            api: SmartbinApi::new(config.database.clone()),
            dashboard: DashboardApi::new(config.database.clone(), config.dashboard),
            sync: SyncRunner::new(config.database, config.sync),
            sync_cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn service_error(err: &anyhow::Error) -> ServiceError {
    tracing::warn!(error = %format!("{err:#}"), "request failed");
    ServiceState::error(format!("{err:#}"))
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/docs/:collection", get(docs_list).post(docs_import))
        .route("/v1/identity/resolve", post(identity_resolve))
        .route("/v1/sync/run", post(sync_run))
        .route("/v1/dashboard/leaderboard", get(dashboard_leaderboard))
        .route("/v1/dashboard/users", get(dashboard_users))
        .route("/v1/dashboard/daily", get(dashboard_daily))
        .route("/v1/dashboard/points-by-user", get(dashboard_points_by_user))
        .route("/v1/dashboard/waste-distribution", get(dashboard_waste_distribution))
        .route("/v1/dashboard/waste-log", get(dashboard_waste_log))
        .with_state(state)
}

fn load_config(args: &Args) -> Result<SmartbinConfig> {
    let mut config = match args.config.as_deref() {
        Some(path) => SmartbinConfig::load(path)?,
        None => SmartbinConfig::default(),
    };
    if let Some(db) = args.db.as_ref() {
        config.database.clone_from(db);
    }
    Ok(config)
}

fn spawn_sync_loop(runner: SyncRunner) -> Result<()> {
    std::thread::Builder::new()
        .name("smartbin-sync".to_string())
        .spawn(move || runner.run_loop(None, |_| {}))
        .map_err(|err| anyhow!("failed to start sync thread: {err}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let state = ServiceState::from_config(config);
    if args.sync {
        spawn_sync_loop(state.sync.clone())?;
    }

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, sync = args.sync, "smartbin service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse {
        status: "ok",
        source: state.dashboard.config().source.as_str(),
    }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<smartbin_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<smartbin_api::MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn docs_list(
    State(state): State<ServiceState>,
    Path(collection): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<smartbin_core::RawDocument>>>, ServiceError> {
    let documents = state.api.list_documents(&collection).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(documents)))
}

async fn docs_import(
    State(state): State<ServiceState>,
    Path(collection): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<ServiceEnvelope<ImportResult>>, ServiceError> {
    let result =
        state.api.import_documents(&collection, payload).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn identity_resolve(
    State(state): State<ServiceState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ServiceEnvelope<ResolveResponse>>, ServiceError> {
    let resolution = state
        .api
        .resolve_identity(&request.natural_key, request.display_name.as_deref())
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(ResolveResponse {
        natural_key: request.natural_key.trim().to_string(),
        internal_id: resolution.internal_id,
        created: resolution.created,
    })))
}

async fn sync_run(State(state): State<ServiceState>) -> Json<ServiceEnvelope<SyncReport>> {
    let cycle = state.sync_cycles.fetch_add(1, Ordering::Relaxed) + 1;
    Json(envelope(state.sync.run_cycle(cycle)))
}

async fn dashboard_leaderboard(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<LeaderboardEntry>>>, ServiceError> {
    let entries = state.dashboard.leaderboard().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(entries)))
}

async fn dashboard_users(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<NormalizedTable>>, ServiceError> {
    let table = state.dashboard.users_table().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(table)))
}

async fn dashboard_daily(
    State(state): State<ServiceState>,
    Query(query): Query<DailyQuery>,
) -> Result<Json<ServiceEnvelope<DailyTable>>, ServiceError> {
    let from = parse_day_param("from", query.from.as_deref())?;
    let to = parse_day_param("to", query.to.as_deref())?;
    let table = state.dashboard.daily(from, to).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(table)))
}

async fn dashboard_points_by_user(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<UserPointsTotal>>>, ServiceError> {
    let totals = state.dashboard.points_by_user().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(totals)))
}

async fn dashboard_waste_distribution(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<WasteShare>>>, ServiceError> {
    let shares = state.dashboard.waste_distribution().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(shares)))
}

async fn dashboard_waste_log(
    State(state): State<ServiceState>,
    Query(query): Query<WasteLogQuery>,
) -> Result<Json<ServiceEnvelope<Vec<WasteLogEntry>>>, ServiceError> {
    let entries = state.dashboard.waste_log(query.limit).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(entries)))
}

fn parse_day_param(name: &str, value: Option<&str>) -> Result<Option<Date>, ServiceError> {
    value
        .map(|raw| {
            parse_calendar_day(raw).ok_or_else(|| {
                ServiceState::error(format!("query parameter `{name}` expects YYYY-MM-DD"))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use smartbin_api::{DashboardConfig, DataSource, SyncConfig};
    use tower::ServiceExt;

    fn unique_temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("smartbin-service-{}", ulid::Ulid::new()));
        std::fs::create_dir_all(&dir)
            .unwrap_or_else(|err| panic!("failed to create {}: {err}", dir.display()));
        dir
    }

    fn test_state(dir: &std::path::Path) -> ServiceState {
        ServiceState::from_config(SmartbinConfig {
            database: dir.join("smartbin.sqlite3"),
            sync: SyncConfig {
                points_file: dir.join("point.json"),
                facts_file: Some(dir.join("waste.json")),
                interval_secs: 1,
            },
            dashboard: DashboardConfig { cache_ttl_secs: 0, ..DashboardConfig::default() },
        })
    }

    async fn send(router: Router, request: Request<axum::body::Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn get_request(uri: &str) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn post_json(uri: &str, body: &serde_json::Value) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn response_text(response: Response) -> String {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response_text(response).await;
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn str_at<'a>(value: &'a serde_json::Value, pointer: &str) -> Option<&'a str> {
        value.pointer(pointer).and_then(serde_json::Value::as_str)
    }

    fn f64_at(value: &serde_json::Value, pointer: &str) -> Option<f64> {
        value.pointer(pointer).and_then(serde_json::Value::as_f64)
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let dir = unique_temp_dir();
        let response = send(app(test_state(&dir)), get_request("/v1/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(str_at(&value, "/data/source"), Some("documents"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let dir = unique_temp_dir();
        let response = send(app(test_state(&dir)), get_request("/v1/openapi")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_text(response).await;
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/dashboard/leaderboard"));
        assert!(body.contains("/v1/sync/run"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn imported_documents_flow_into_dashboard_tables() {
        let dir = unique_temp_dir();
        let state = test_state(&dir);

        let users = serde_json::json!([
            {"user_id": "u1", "name": "Ann", "points": 4, "timestamp": "2024-02-01T08:00:00Z"},
            {"user_id": "u1", "name": "Ann", "points": 7, "timestamp": "2024-02-03T08:00:00Z"},
            {"user_id": "u2", "name": "Bo", "points": 5, "timestamp": "2024-02-02T08:00:00Z"}
        ]);
        let waste = serde_json::json!([
            {"record_id": "w1", "user_id": "u1", "waste_type": "can", "weight": 3,
             "points_earned": 2, "timestamp": "2024-02-01T09:00:00Z"},
            {"record_id": "w2", "user_id": "u2", "waste_type": "paper", "weight": 1,
             "points_earned": 1, "timestamp": "2024-02-02T09:00:00Z"}
        ]);
        for (collection, payload) in [("users", &users), ("waste", &waste)] {
            let request = post_json(&format!("/v1/docs/{collection}"), payload);
            let response = send(app(state.clone()), request).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let board =
            response_json(send(app(state.clone()), get_request("/v1/dashboard/leaderboard")).await)
                .await;
        assert_eq!(str_at(&board, "/data/0/entity_key"), Some("u1"));
        assert_eq!(f64_at(&board, "/data/0/points"), Some(7.0));
        assert_eq!(str_at(&board, "/data/1/medal"), Some("silver"));

        let shares = response_json(
            send(app(state.clone()), get_request("/v1/dashboard/waste-distribution")).await,
        )
        .await;
        assert_eq!(str_at(&shares, "/data/0/waste"), Some("can"));
        assert_eq!(f64_at(&shares, "/data/0/percent"), Some(75.0));

        let log = response_json(
            send(app(state.clone()), get_request("/v1/dashboard/waste-log?limit=1")).await,
        )
        .await;
        let entries = log.pointer("/data").and_then(serde_json::Value::as_array);
        assert_eq!(entries.map(Vec::len), Some(1));
        assert_eq!(str_at(&log, "/data/0/record_id"), Some("w2"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn sync_run_feeds_relational_source() {
        let dir = unique_temp_dir();
        std::fs::write(dir.join("point.json"), r#"{"RFID1": {"name": "Ann", "points": 8}}"#)
            .unwrap_or_else(|err| panic!("failed to write points file: {err}"));
        let mut state = test_state(&dir);
        state.dashboard = DashboardApi::new(
            dir.join("smartbin.sqlite3"),
            DashboardConfig {
                source: DataSource::Relational,
                cache_ttl_secs: 0,
                ..DashboardConfig::default()
            },
        );

        let report = response_json(
            send(app(state.clone()), post_json("/v1/sync/run", &serde_json::json!({}))).await,
        )
        .await;
        assert_eq!(report.pointer("/data/cycle").and_then(serde_json::Value::as_u64), Some(1));
        assert_eq!(report.pointer("/data/aborted_in"), Some(&serde_json::Value::Null));
        assert_eq!(report.pointer("/data/facts"), Some(&serde_json::Value::Null));

        let board =
            response_json(send(app(state.clone()), get_request("/v1/dashboard/leaderboard")).await)
                .await;
        assert_eq!(str_at(&board, "/data/0/name"), Some("Ann"));

        let daily =
            response_json(send(app(state), get_request("/v1/dashboard/daily")).await).await;
        assert_eq!(
            f64_at(&daily, "/data/grand_total"),
            Some(0.0)
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn malformed_requests_return_bad_request_envelopes() {
        let dir = unique_temp_dir();
        let state = test_state(&dir);

        let bad_day =
            send(app(state.clone()), get_request("/v1/dashboard/daily?from=2024-13-01")).await;
        assert_eq!(bad_day.status(), StatusCode::BAD_REQUEST);
        let value = response_json(bad_day).await;
        assert!(value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|error| error.contains("YYYY-MM-DD")));

        let blank_key = send(
            app(state.clone()),
            post_json("/v1/identity/resolve", &serde_json::json!({"natural_key": " "})),
        )
        .await;
        assert_eq!(blank_key.status(), StatusCode::BAD_REQUEST);

        let scalar_docs =
            send(app(state), post_json("/v1/docs/users", &serde_json::json!("nope"))).await;
        assert_eq!(scalar_docs.status(), StatusCode::BAD_REQUEST);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
