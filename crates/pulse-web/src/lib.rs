//! Axum JSON API over the survey store, plus the "run pipeline now" trigger.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pulse_core::{EnrichmentState, NaturalKey, SurveyPeriod};
use pulse_storage::{StoreError, SurveyStore, ViewQuery};
use pulse_sync::SyncPipeline;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "pulse-web";

const DEFAULT_PER_PAGE: usize = 50;
const MAX_PER_PAGE: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SurveyStore>,
    /// Absent when the server only reads; the trigger endpoint then answers 503.
    pub pipeline: Option<Arc<SyncPipeline>>,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(store: Arc<dyn SurveyStore>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            pipeline: None,
            workspace_root: workspace_root.into(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<SyncPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct RecordsQuery {
    state: Option<String>,
    department: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RunReportRow {
    pub run_id: String,
    pub inserted: u64,
    pub updated: u64,
    pub rejected: u64,
    pub enriched: u64,
    pub failed: u64,
    pub aborted: bool,
    pub has_parquet_manifest: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/records", get(records_handler))
        .route("/api/v1/records/{employee_id}/{period}", get(record_detail_handler))
        .route("/api/v1/enrichment/summary", get(enrichment_summary_handler))
        .route("/api/v1/enrichment/failed", get(enrichment_failed_handler))
        .route("/api/v1/reports", get(reports_handler))
        .route("/api/v1/pipeline/run", post(pipeline_run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "serving pulse api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn records_handler(State(state): State<Arc<AppState>>, Query(query): Query<RecordsQuery>) -> Response {
    let filter = match query.state.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<EnrichmentState>() {
            Ok(parsed) => Some(parsed),
            Err(reason) => return bad_request(reason),
        },
        None => None,
    };
    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let page = query.page.unwrap_or(1).max(1);
    let Some(offset) = (page - 1).checked_mul(per_page) else {
        return bad_request(format!("page {page} is out of range"));
    };
    let view_query = ViewQuery {
        state: filter,
        department: query.department.filter(|d| !d.is_empty()),
        limit: per_page,
        offset,
    };
    match state.store.list_views(&view_query).await {
        Ok(views) => Json(json!({
            "items": views.items,
            "total": views.total,
            "page": page,
            "per_page": per_page,
            "total_pages": views.total.max(1).div_ceil(per_page),
        }))
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn record_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((employee_id, period)): AxumPath<(String, String)>,
) -> Response {
    let period = match period.parse::<SurveyPeriod>() {
        Ok(period) => period,
        Err(reason) => return bad_request(reason),
    };
    let key = NaturalKey::new(employee_id, period);
    match state.store.record_view(&key).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no record for {key}") })),
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

async fn enrichment_summary_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.state_counts().await {
        Ok(counts) => {
            let total: u64 = counts.values().sum();
            let by_state = EnrichmentState::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), json!(counts.get(s).copied().unwrap_or(0))))
                .collect::<serde_json::Map<_, _>>();
            Json(json!({ "total": total, "states": by_state })).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn enrichment_failed_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    match state.store.failed_tasks(limit).await {
        Ok(markers) => Json(json!({ "items": markers })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn reports_handler(State(state): State<Arc<AppState>>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_PER_PAGE);
    match load_runs(&state.workspace_root, limit) {
        Ok(runs) => Json(json!({ "runs": runs })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn pipeline_run_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(pipeline) = state.pipeline.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "pipeline trigger is not configured" })),
        )
            .into_response();
    };
    tokio::spawn(async move {
        match pipeline.run_once().await {
            Ok(summary) => info!(run_id = %summary.run_id, "triggered run finished"),
            Err(err) => error!(error = %format!("{err:#}"), "triggered run failed"),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response()
}

fn bad_request(reason: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    let status = match &err {
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Integrity(_) | StoreError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!(error = %err, "store error while serving request");
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

fn load_runs(workspace_root: &Path, limit: usize) -> anyhow::Result<Vec<RunReportRow>> {
    let reports_root = workspace_root.join("reports");
    if !reports_root.exists() {
        return Ok(vec![]);
    }
    let mut entries = std::fs::read_dir(&reports_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    entries.reverse();

    let mut runs = Vec::new();
    for e in entries.into_iter().take(limit) {
        let summary_path = e.path().join("run_summary.json");
        if !summary_path.exists() {
            continue;
        }
        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&summary_path)?)?;
        let count = |field: &str| v.get(field).and_then(|n| n.as_u64()).unwrap_or(0);
        let enrichment = |field: &str| {
            v.get("enrichment")
                .and_then(|n| n.get(field))
                .and_then(|n| n.as_u64())
                .unwrap_or(0)
        };
        runs.push(RunReportRow {
            run_id: e.file_name().to_string_lossy().to_string(),
            inserted: count("inserted"),
            updated: count("updated"),
            rejected: count("rejected"),
            enriched: enrichment("enriched"),
            failed: enrichment("failed"),
            aborted: v.get("fatal_error").is_some_and(|f| !f.is_null()),
            has_parquet_manifest: e.path().join("snapshots/manifest.json").exists(),
        });
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use pulse_core::{RecordFingerprint, SurveyRecord};
    use pulse_storage::MemoryStore;
    use tower::ServiceExt;

    use super::*;

    fn record(employee: &str, comment: Option<&str>, department: &str) -> SurveyRecord {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        SurveyRecord {
            key: NaturalKey::new(employee, SurveyPeriod::from_date(date).unwrap()),
            name: None,
            corporate_email: None,
            department: Some(department.to_string()),
            role: None,
            function: None,
            location: None,
            tenure: None,
            tenure_rank: 0,
            phone: None,
            gender: None,
            generation: None,
            org_levels: BTreeMap::new(),
            response_date: date,
            score: 7,
            dimensions: BTreeMap::new(),
            dimension_comments: BTreeMap::new(),
            comment: comment.map(str::to_string),
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for r in [
            record("e1@corp.example", Some("great team"), "Engineering"),
            record("e2@corp.example", None, "Sales"),
        ] {
            store.upsert_record(&r, &RecordFingerprint::compute(&r)).await.unwrap();
        }
        store
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(Arc::new(MemoryStore::new()), dir.path()));
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn records_filter_by_state_and_department() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(seeded_store().await, dir.path()));

        let (status, body) = get_json(app.clone(), "/api/v1/records").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);

        let (_, pending) = get_json(app.clone(), "/api/v1/records?state=pending_enrichment").await;
        assert_eq!(pending["total"], 1);
        assert_eq!(pending["items"][0]["record"]["key"]["employee_id"], "e1@corp.example");

        let (_, sales) = get_json(app.clone(), "/api/v1/records?department=Sales&per_page=1").await;
        assert_eq!(sales["total"], 1);
        assert_eq!(sales["items"][0]["state"], "no_text");

        let (status, _) = get_json(app, "/api/v1/records?state=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn records_pagination_pages_and_rejects_unreachable_pages() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(seeded_store().await, dir.path()));

        let (status, second) = get_json(app.clone(), "/api/v1/records?page=2&per_page=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["total_pages"], 2);
        assert_eq!(second["items"][0]["record"]["key"]["employee_id"], "e2@corp.example");

        let (status, body) = get_json(app.clone(), &format!("/api/v1/records?page={}", usize::MAX)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("out of range"));

        let (status, _) = get_json(app, "/api/v1/records?page=99").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn record_detail_found_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(seeded_store().await, dir.path()));

        let (status, body) = get_json(app.clone(), "/api/v1/records/E1@corp.example/2026-03").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "pending_enrichment");

        let (status, _) = get_json(app.clone(), "/api/v1/records/nobody@corp.example/2026-03").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(app, "/api/v1/records/e1@corp.example/March").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn enrichment_summary_and_failed_list() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(seeded_store().await, dir.path()));

        let (_, summary) = get_json(app.clone(), "/api/v1/enrichment/summary").await;
        assert_eq!(summary["total"], 2);
        assert_eq!(summary["states"]["pending_enrichment"], 1);
        assert_eq!(summary["states"]["no_text"], 1);
        assert_eq!(summary["states"]["enrichment_failed"], 0);

        let (status, failed) = get_json(app, "/api/v1/enrichment/failed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(failed["items"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn offline_store_maps_to_service_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let (status, body) = get_json(app(AppState::new(store, dir.path())), "/api/v1/enrichment/summary").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn trigger_without_pipeline_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(Arc::new(MemoryStore::new()), dir.path()));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/pipeline/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn trigger_accepts_and_runs_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let batch = dir.path().join("batch.csv");
        std::fs::write(&batch, "email;Data da Resposta;eNPS;area\ne9@corp.example;02/03/2026;9;Ops\n").unwrap();
        let store = Arc::new(MemoryStore::new());
        let scorer = pulse_enrich::HttpScorer::new(pulse_enrich::HttpScorerConfig {
            url: "http://127.0.0.1:9/score".to_string(),
            model_version: "unused".to_string(),
            timeout: Duration::from_millis(200),
            rate_limit: None,
        })
        .unwrap();
        let config = pulse_sync::PipelineConfig {
            archive_dir: dir.path().join("archive"),
            workspace_root: dir.path().to_path_buf(),
            ..pulse_sync::PipelineConfig::default()
        };
        let pipeline = SyncPipeline::new(
            config,
            store.clone(),
            Arc::new(scorer),
            Arc::new(pulse_adapters::LocalFileSource::new("survey", batch)),
        );
        let state = AppState::new(store.clone(), dir.path()).with_pipeline(Arc::new(pipeline));

        let resp = app(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/pipeline/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let finished = || {
            std::fs::read_dir(dir.path().join("reports"))
                .map(|entries| entries.filter_map(|e| e.ok()).any(|e| e.path().join("run_brief.md").exists()))
                .unwrap_or(false)
        };
        for _ in 0..100 {
            if finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let runs = load_runs(dir.path(), 5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].inserted, 1);

        let (_, reports) = get_json(app(state), "/api/v1/reports").await;
        assert_eq!(reports["runs"][0]["has_parquet_manifest"], true);
    }
}
