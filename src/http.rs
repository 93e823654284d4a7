use crate::error::{ApiError, ApiResult};
use crate::gateway::{BatchOutcome, Gateway};
use crate::reading::{BatchSummary, Reading};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const RECENT_READINGS_LIMIT: usize = 10;

#[derive(Clone)]
pub struct HttpState {
    pub gateway: Arc<Gateway>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    agent: &'static str,
    version: &'static str,
    buffer_size: usize,
    offline_queue_size: usize,
}

#[derive(Debug, Serialize)]
struct ReportResponse {
    status: &'static str,
    node_id: String,
    buffer_size: usize,
}

#[derive(Debug, Serialize)]
struct BufferResponse {
    buffer_size: usize,
    max_size: usize,
    batch_threshold: usize,
    offline_queue_size: usize,
    should_upload: bool,
    dropped_readings: u64,
    dropped_batches: u64,
    recent_readings: Vec<Reading>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    status: &'static str,
    batch_size: usize,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct OfflineQueueResponse {
    queue_size: usize,
    batches: Vec<BatchSummary>,
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    status: &'static str,
    uploaded: usize,
    failed: usize,
}

async fn healthz(State(state): State<HttpState>) -> Json<HealthResponse> {
    let status = state.gateway.status();
    Json(HealthResponse {
        status: "ok",
        agent: "nanoclaw",
        version: env!("CARGO_PKG_VERSION"),
        buffer_size: status.ingest_count,
        offline_queue_size: status.offline_count,
    })
}

async fn post_report(
    State(state): State<HttpState>,
    Json(reading): Json<Reading>,
) -> (StatusCode, Json<ReportResponse>) {
    let node_id = reading.node_id.clone();
    state.gateway.submit(reading);
    (
        StatusCode::CREATED,
        Json(ReportResponse {
            status: "accepted",
            node_id,
            buffer_size: state.gateway.buffer().len(),
        }),
    )
}

async fn get_buffer(State(state): State<HttpState>) -> Json<BufferResponse> {
    let status = state.gateway.status();
    let recent_readings = state
        .gateway
        .buffer()
        .get_readings(Some(RECENT_READINGS_LIMIT));
    Json(BufferResponse {
        buffer_size: status.ingest_count,
        max_size: status.max_size,
        batch_threshold: status.batch_threshold,
        offline_queue_size: status.offline_count,
        should_upload: status.should_upload,
        dropped_readings: status.dropped_readings,
        dropped_batches: status.dropped_batches,
        recent_readings,
    })
}

async fn post_batch(State(state): State<HttpState>) -> ApiResult<Json<BatchResponse>> {
    match state.gateway.force_batch().await? {
        BatchOutcome::Uploaded {
            size,
            batch_timestamp,
        } => Ok(Json(BatchResponse {
            status: "uploaded",
            batch_size: size,
            timestamp: batch_timestamp,
        })),
        BatchOutcome::Queued { reason, .. } => Err(ApiError::unavailable(format!(
            "L3 unreachable, queued for retry: {reason}"
        ))),
    }
}

async fn get_offline_queue(State(state): State<HttpState>) -> Json<OfflineQueueResponse> {
    let batches = state.gateway.list_offline();
    Json(OfflineQueueResponse {
        queue_size: batches.len(),
        batches,
    })
}

async fn post_offline_retry(State(state): State<HttpState>) -> Json<RetryResponse> {
    let report = state.gateway.retry_offline().await;
    let status = if report.uploaded == 0 && report.failed == 0 {
        "no_batches"
    } else {
        "completed"
    };
    Json(RetryResponse {
        status,
        uploaded: report.uploaded,
        failed: report.failed,
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/report", post(post_report))
        .route("/buffer", get(get_buffer))
        .route("/batch", post(post_batch))
        .route("/offline-queue", get(get_offline_queue))
        .route("/offline-queue/retry", post(post_offline_retry))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
