use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Local, NaiveDate, Utc};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::daemon::downtime::{DowntimeDaySummary, DowntimeTracker};
use crate::daemon::records::{
    shift_relative_availability, CycleRecord, DailySummary, DowntimeEpisode, DowntimeReason,
    RunState,
};
use crate::daemon::server::report::{build_report, ReportRequest};
use crate::daemon::snapshot::SnapshotBus;
use crate::storage::{MachineStore, StoreError, StoreResult};
use crate::util::logging::info;
use crate::util::threading::{ThreadHandle, ThreadRegistry};

const DEFAULT_HISTORY_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct ApiState {
    pub bus: Arc<SnapshotBus>,
    pub store: Arc<dyn MachineStore>,
    pub tracker: DowntimeTracker,
    pub shift_seconds: i64,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::Validation(_) => StatusCode::BAD_REQUEST,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Database(_) | StoreError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

/// Store calls block on SQLite; handlers push them onto the blocking pool so
/// the single-threaded server runtime stays responsive.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => Err(ApiError::internal(format!("worker task failed: {e}"))),
    }
}

fn parse_date_param(s: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("invalid date {s:?}, expected YYYY-MM-DD")))
}

fn resolve_date(param: Option<&str>) -> Result<NaiveDate, ApiError> {
    match param {
        Some(s) => parse_date_param(s),
        None => Ok(Local::now().date_naive()),
    }
}

#[derive(Deserialize)]
struct DateQuery {
    date: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct ExportQuery {
    report_type: Option<String>,
    year: Option<i32>,
    month: Option<u32>,
    day: Option<u32>,
}

#[derive(Deserialize)]
struct DowntimeStartBody {
    reason: String,
}

#[derive(Serialize)]
struct StateResponse {
    state: RunState,
    is_running: bool,
    current_cycle: i64,
    today_runtime_sec: i64,
    last_updated: DateTime<Utc>,
}

#[derive(Serialize)]
struct ActiveResponse {
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    episode: Option<DowntimeEpisode>,
}

async fn state_handler(State(state): State<ApiState>) -> Json<StateResponse> {
    let snap = state.bus.snapshot();
    Json(StateResponse {
        state: snap.state,
        is_running: snap.state == RunState::Run,
        current_cycle: snap.current_cycle,
        today_runtime_sec: snap.today_runtime_sec,
        last_updated: snap.published_at,
    })
}

async fn stream_handler(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    use tokio_stream::wrappers::WatchStream;
    use tokio_stream::StreamExt;
    let rx = state.bus.watch_snapshot();
    let stream = WatchStream::new(rx).map(|snap| {
        let data = serde_json::to_string(&*snap).unwrap_or_else(|_| "{}".into());
        Ok(Event::default().data(data))
    });
    Sse::new(stream)
}

async fn cycles_handler(
    State(state): State<ApiState>,
    Query(query): Query<DateQuery>,
) -> Result<Json<Vec<CycleRecord>>, ApiError> {
    let date = resolve_date(query.date.as_deref())?;
    let store = Arc::clone(&state.store);
    let cycles = blocking(move || store.cycles_for(date)).await?;
    Ok(Json(cycles))
}

async fn summary_today_handler(
    State(state): State<ApiState>,
) -> Result<Json<DailySummary>, ApiError> {
    let today = Local::now().date_naive();
    let store = Arc::clone(&state.store);
    let stored = blocking(move || store.summary_for(today)).await?;
    let mut summary = stored.unwrap_or_else(|| DailySummary::empty(today));

    // The ledger only counts closed cycles; fold the in-progress run in on
    // the fly so the dashboard advances while the machine runs.
    let snap = state.bus.snapshot();
    if let Some(started_at) = snap.run_started_at {
        if started_at.with_timezone(&Local).date_naive() == today {
            let elapsed = Utc::now()
                .signed_duration_since(started_at)
                .num_seconds()
                .max(0);
            summary.total_runtime_sec += elapsed;
        }
    }
    summary.availability_pct =
        shift_relative_availability(summary.total_runtime_sec, state.shift_seconds);
    Ok(Json(summary))
}

async fn summary_handler(
    State(state): State<ApiState>,
    Query(query): Query<DateQuery>,
) -> Result<Json<DailySummary>, ApiError> {
    let date = resolve_date(query.date.as_deref())?;
    let store = Arc::clone(&state.store);
    match blocking(move || store.summary_for(date)).await? {
        Some(summary) => Ok(Json(summary)),
        None => Err(ApiError::not_found(format!("no summary for {date}"))),
    }
}

async fn downtime_start_handler(
    State(state): State<ApiState>,
    Json(body): Json<DowntimeStartBody>,
) -> Result<(StatusCode, Json<DowntimeEpisode>), ApiError> {
    let reason = DowntimeReason::from_code(&body.reason).ok_or_else(|| {
        ApiError::bad_request(format!("unknown downtime reason {:?}", body.reason))
    })?;
    let tracker = state.tracker.clone();
    let now = Utc::now();
    let today = Local::now().date_naive();
    let episode = blocking(move || tracker.start(reason, now, today)).await?;
    Ok((StatusCode::CREATED, Json(episode)))
}

async fn downtime_stop_handler(
    State(state): State<ApiState>,
) -> Result<Json<DowntimeEpisode>, ApiError> {
    let tracker = state.tracker.clone();
    let now = Utc::now();
    let episode = blocking(move || tracker.stop(now)).await?;
    Ok(Json(episode))
}

async fn downtime_active_handler(
    State(state): State<ApiState>,
) -> Result<Json<ActiveResponse>, ApiError> {
    let tracker = state.tracker.clone();
    let episode = blocking(move || tracker.active()).await?;
    Ok(Json(ActiveResponse {
        active: episode.is_some(),
        episode,
    }))
}

async fn downtime_summary_today_handler(
    State(state): State<ApiState>,
) -> Result<Json<DowntimeDaySummary>, ApiError> {
    let tracker = state.tracker.clone();
    let today = Local::now().date_naive();
    Ok(Json(blocking(move || tracker.summary_for(today)).await?))
}

async fn downtime_history_handler(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<DowntimeEpisode>>, ApiError> {
    let start = query
        .start_date
        .as_deref()
        .map(parse_date_param)
        .transpose()?;
    let end = query.end_date.as_deref().map(parse_date_param).transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 1000);
    let tracker = state.tracker.clone();
    Ok(Json(
        blocking(move || tracker.history(start, end, limit)).await?,
    ))
}

async fn downtime_top_handler(
    State(state): State<ApiState>,
) -> Result<Json<Vec<DowntimeEpisode>>, ApiError> {
    let tracker = state.tracker.clone();
    let today = Local::now().date_naive();
    Ok(Json(blocking(move || tracker.top_for(today)).await?))
}

async fn export_handler(
    State(state): State<ApiState>,
    Query(query): Query<ExportQuery>,
) -> Result<([(HeaderName, String); 2], Vec<u8>), ApiError> {
    let request = ReportRequest::from_params(
        query.report_type.as_deref(),
        query.year,
        query.month,
        query.day,
    )
    .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let store = Arc::clone(&state.store);
    let (filename, bytes) =
        tokio::task::spawn_blocking(move || build_report(store.as_ref(), request))
            .await
            .map_err(|e| ApiError::internal(format!("worker task failed: {e}")))?
            .map_err(|e| ApiError::internal(format!("report build failed: {e:#}")))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    ))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/state", get(state_handler))
        .route("/api/stream", get(stream_handler))
        .route("/api/cycles", get(cycles_handler))
        .route("/api/summary/today", get(summary_today_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/downtime/start", post(downtime_start_handler))
        .route("/api/downtime/stop", post(downtime_stop_handler))
        .route("/api/downtime/active", get(downtime_active_handler))
        .route(
            "/api/downtime/summary/today",
            get(downtime_summary_today_handler),
        )
        .route("/api/downtime/history", get(downtime_history_handler))
        .route("/api/downtime/top-today", get(downtime_top_handler))
        .route("/api/downtime/export", get(export_handler))
        .with_state(state)
}

pub fn spawn_http_server(
    listen: String,
    state: ApiState,
    threads: &ThreadRegistry,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<ThreadHandle> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let handle = threads
        .spawn("http-server", move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("build runtime");
            rt.block_on(async move {
                let app = router(state);
                let listener = tokio::net::TcpListener::bind(&listen)
                    .await
                    .expect("bind http listener");
                tx.send(()).ok();
                info!("http api listening on {listen}");

                let mut shutdown = shutdown_rx;
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.wait_for(|stop| *stop).await;
                    })
                    .await
                    .expect("serve http");
            });
            info!("http server thread exiting");
        })
        .context("spawn HTTP server thread")?;

    match rx.recv_timeout(Duration::from_millis(500)) {
        Ok(()) => Ok(handle),
        Err(_) => {
            let panic_msg = match handle.join() {
                Ok(_) => None,
                Err(payload) => match payload.downcast::<String>() {
                    Ok(msg) => Some(*msg),
                    Err(payload) => match payload.downcast::<&'static str>() {
                        Ok(msg) => Some((*msg).to_string()),
                        Err(_) => None,
                    },
                },
            };
            let detail = panic_msg.map(|msg| format!(": {msg}")).unwrap_or_default();
            Err(anyhow::anyhow!(
                "HTTP server failed to signal readiness within 500ms{detail}"
            ))
        }
    }
}
