use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use spacesaver_core::db::Catalog;
use spacesaver_core::worker::WorkerStatus;
use spacesaver_core::{EntryState, Error, MediaEntry, Result};

pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub status: Arc<WorkerStatus>,
}

/// Serve the HTTP adapter until the shutdown future resolves. All
/// catalog access hops onto the blocking pool; the handlers themselves
/// only shape JSON.
pub async fn serve<F>(port: u16, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = Router::new()
        .route("/version", get(version_handler))
        .route("/status", get(status_handler))
        .route("/list", get(list_handler))
        .route("/list/:id", get(get_handler))
        .route("/request/enqueue/best", post(enqueue_best_handler))
        .route("/request/enqueue/:id", post(enqueue_handler))
        .with_state(state);

    let addr = ([0, 0, 0, 0], port).into();
    tracing::info!(%addr, "http listener bound");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| Error::InvalidArgument(format!("server error: {err}")))?;

    Ok(())
}

#[derive(Serialize)]
struct VersionDto {
    version: &'static str,
}

#[derive(Serialize)]
struct EntrySummaryDto {
    id: String,
    path: String,
    category: &'static str,
    state: &'static str,
    size_bytes: u64,
    codec: String,
    attempts: u32,
}

#[derive(Serialize)]
struct EntryDto {
    id: String,
    path: String,
    content_hash: String,
    size_bytes: u64,
    codec: String,
    width: u32,
    height: u32,
    bitrate_bps: u64,
    duration_s: f64,
    category: &'static str,
    state: &'static str,
    attempts: u32,
    last_error: String,
    workdir_path: Option<String>,
    updated_at: i64,
}

impl From<&MediaEntry> for EntrySummaryDto {
    fn from(e: &MediaEntry) -> Self {
        Self {
            id: e.id.to_string(),
            path: e.path.display().to_string(),
            category: e.category.as_str(),
            state: e.state.as_str(),
            size_bytes: e.size_bytes,
            codec: e.codec.clone(),
            attempts: e.attempts,
        }
    }
}

impl From<&MediaEntry> for EntryDto {
    fn from(e: &MediaEntry) -> Self {
        Self {
            id: e.id.to_string(),
            path: e.path.display().to_string(),
            content_hash: e.content_hash.clone(),
            size_bytes: e.size_bytes,
            codec: e.codec.clone(),
            width: e.width,
            height: e.height,
            bitrate_bps: e.bitrate_bps,
            duration_s: e.duration_s,
            category: e.category.as_str(),
            state: e.state.as_str(),
            attempts: e.attempts,
            last_error: e.last_error.clone(),
            workdir_path: e.workdir_path.as_ref().map(|p| p.display().to_string()),
            updated_at: e.updated_at,
        }
    }
}

#[derive(Serialize)]
struct CurrentJobDto {
    id: String,
    path: String,
    progress_pct: f64,
    frames_done: u64,
    frames_total: u64,
    elapsed_seconds: u64,
}

#[derive(Serialize)]
struct StatusDto {
    total: u64,
    new: u64,
    skip: u64,
    pending: u64,
    queued: u64,
    in_progress: u64,
    done: u64,
    failed: u64,
    gone: u64,
    current: Option<CurrentJobDto>,
    eta_seconds: Option<u64>,
    last_error: Option<String>,
}

async fn version_handler() -> Json<VersionDto> {
    Json(VersionDto {
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status_handler(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let current = state.status.current().map(|job| {
        let elapsed = job.started.elapsed().as_secs();
        CurrentJobDto {
            id: job.id.to_string(),
            path: job.path.display().to_string(),
            progress_pct: (job.progress_pct * 10.0).round() / 10.0,
            frames_done: job.frames_done,
            frames_total: job.frames_total,
            elapsed_seconds: elapsed,
        }
    });

    // Crude linear estimate from progress so far.
    let eta_seconds = current.as_ref().and_then(|job| {
        if job.progress_pct > 1.0 && job.elapsed_seconds > 0 {
            let rate = job.progress_pct / job.elapsed_seconds as f64;
            Some(((100.0 - job.progress_pct) / rate.max(0.01)) as u64)
        } else {
            None
        }
    });

    let catalog = Arc::clone(&state.catalog);
    let result = tokio::task::spawn_blocking(move || {
        let counts = catalog.state_counts()?;
        let last_error = catalog
            .list(Some(EntryState::Failed))?
            .into_iter()
            .max_by_key(|e| e.updated_at)
            .map(|e| e.last_error);
        Ok::<_, Error>((counts, last_error))
    })
    .await;

    match result {
        Ok(Ok((counts, last_error))) => Json(StatusDto {
            total: counts.total(),
            new: counts.new,
            skip: counts.skip,
            pending: counts.pending,
            queued: counts.queued,
            in_progress: counts.in_progress,
            done: counts.done,
            failed: counts.failed,
            gone: counts.gone,
            current,
            eta_seconds,
            last_error,
        })
        .into_response(),
        Ok(Err(err)) => internal_error(err),
        Err(_) => blocking_failed(),
    }
}

async fn list_handler(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let catalog = Arc::clone(&state.catalog);
    let result = tokio::task::spawn_blocking(move || catalog.list(None)).await;

    match result {
        Ok(Ok(entries)) => {
            let summaries: Vec<EntrySummaryDto> =
                entries.iter().map(EntrySummaryDto::from).collect();
            Json(summaries).into_response()
        }
        Ok(Err(err)) => internal_error(err),
        Err(_) => blocking_failed(),
    }
}

async fn get_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid id");
    };

    let catalog = Arc::clone(&state.catalog);
    let result = tokio::task::spawn_blocking(move || catalog.get(id)).await;

    match result {
        Ok(Ok(Some(entry))) => Json(EntryDto::from(&entry)).into_response(),
        Ok(Ok(None)) => error_response(StatusCode::NOT_FOUND, "not found"),
        Ok(Err(err)) => internal_error(err),
        Err(_) => blocking_failed(),
    }
}

async fn enqueue_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid id");
    };

    let catalog = Arc::clone(&state.catalog);
    let result = tokio::task::spawn_blocking(move || catalog.enqueue(id)).await;

    match result {
        Ok(Ok(())) => Json(json!({ "ok": true, "id": id.to_string() })).into_response(),
        Ok(Err(Error::NotFound(_))) => error_response(StatusCode::NOT_FOUND, "not found"),
        Ok(Err(Error::Conflict(msg))) => error_response(StatusCode::CONFLICT, &msg),
        Ok(Err(err)) => internal_error(err),
        Err(_) => blocking_failed(),
    }
}

async fn enqueue_best_handler(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let catalog = Arc::clone(&state.catalog);
    let result = tokio::task::spawn_blocking(move || catalog.enqueue_best()).await;

    match result {
        Ok(Ok(Some(id))) => Json(json!({ "ok": true, "id": id.to_string() })).into_response(),
        Ok(Ok(None)) => error_response(StatusCode::NOT_FOUND, "no candidate"),
        Ok(Err(err)) => internal_error(err),
        Err(_) => blocking_failed(),
    }
}

fn error_response(code: StatusCode, message: &str) -> axum::response::Response {
    (code, Json(json!({ "error": message }))).into_response()
}

fn internal_error(err: Error) -> axum::response::Response {
    tracing::error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}

fn blocking_failed() -> axum::response::Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "background task failed")
}
