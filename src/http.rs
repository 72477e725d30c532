use crate::aggregator::Aggregator;
use crate::metrics::Metrics;
use crate::report::{
    coarse_duration, one_decimal, percent, round2, DiskUsage, GcRunRecord, NodeStatsReport,
    RepositorySnapshot, SizeUnit, SystemSnapshot, GIB, TIB,
};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header::AUTHORIZATION, header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use chrono::{Local, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const GC_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub aggregator: Arc<Aggregator>,
    pub secret_key: Arc<str>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub timestamp: String,
    pub data: ApiNodeStats,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ApiNodeStats {
    pub system: ApiSystem,
    pub ipfs: BTreeMap<String, ApiRepository>,
    pub gc: ApiGc,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSystem {
    pub hostname: String,
    pub uptime: u64,
    pub uptime_human: String,
    pub memory: ApiMemory,
    pub disk: ApiDisk,
    pub load_average: [f64; 3],
}

#[derive(Debug, Serialize)]
pub struct ApiMemory {
    #[serde(rename = "totalGB")]
    pub total_gb: u64,
    #[serde(rename = "usedGB")]
    pub used_gb: u64,
    #[serde(rename = "freeGB")]
    pub free_gb: u64,
    #[serde(rename = "percentUsed")]
    pub percent_used: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct ApiDisk {
    pub path: String,
    #[serde(rename = "totalTB", skip_serializing_if = "Option::is_none")]
    pub total_tb: Option<String>,
    #[serde(rename = "usedGB", skip_serializing_if = "Option::is_none")]
    pub used_gb: Option<String>,
    #[serde(rename = "usedTB", skip_serializing_if = "Option::is_none")]
    pub used_tb: Option<String>,
    #[serde(rename = "freeTB", skip_serializing_if = "Option::is_none")]
    pub free_tb: Option<String>,
    #[serde(rename = "percentUsed", skip_serializing_if = "Option::is_none")]
    pub percent_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRepository {
    pub path: String,
    #[serde(rename = "sizeGB", skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<String>,
    #[serde(rename = "sizeTB", skip_serializing_if = "Option::is_none")]
    pub size_tb: Option<String>,
    pub block_count: Option<u64>,
    pub pin_count: Option<u64>,
    pub daemon_running: bool,
    pub daemon_version: Option<String>,
    pub peer_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGc {
    pub last_run_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_human: Option<String>,
    pub blocks_removed: Option<u64>,
    pub duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_human: Option<String>,
    /// True when the duration is derived from the block count, not measured.
    pub duration_estimated: bool,
    pub next_scheduled_timestamp: Option<String>,
    pub status: &'static str,
    pub source_log_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiNodeStats {
    pub fn from_report(report: &NodeStatsReport, now: NaiveDateTime) -> Self {
        Self {
            system: ApiSystem::from(&report.system),
            ipfs: report
                .repositories
                .iter()
                .map(|(role, snap)| (format!("{role}Repo"), ApiRepository::from(snap)))
                .collect(),
            gc: ApiGc::new(&report.gc, now),
        }
    }
}

impl From<&SystemSnapshot> for ApiSystem {
    fn from(value: &SystemSnapshot) -> Self {
        Self {
            hostname: value.hostname.clone(),
            uptime: value.uptime_seconds,
            uptime_human: coarse_duration(value.uptime_seconds),
            memory: ApiMemory {
                total_gb: whole_gib(value.memory_total_bytes),
                used_gb: whole_gib(value.memory_used_bytes),
                free_gb: whole_gib(value.memory_free_bytes),
                percent_used: percent(value.memory_used_bytes, value.memory_total_bytes),
            },
            disk: ApiDisk::from(&value.disk),
            load_average: value.load_average.map(round2),
        }
    }
}

impl From<&DiskUsage> for ApiDisk {
    fn from(value: &DiskUsage) -> Self {
        match value {
            DiskUsage::Measured {
                path,
                total_bytes,
                used_bytes,
                available_bytes,
            } => {
                let (used_gb, used_tb) = match SizeUnit::from_bytes(*used_bytes) {
                    SizeUnit::Gigabytes(v) => (Some(one_decimal(v)), None),
                    SizeUnit::Terabytes(v) => (None, Some(one_decimal(v))),
                };
                Self {
                    path: path.clone(),
                    total_tb: Some(one_decimal(*total_bytes as f64 / TIB as f64)),
                    used_gb,
                    used_tb,
                    free_tb: Some(one_decimal(*available_bytes as f64 / TIB as f64)),
                    percent_used: Some(percent(*used_bytes, *total_bytes)),
                    error: None,
                }
            }
            DiskUsage::Failed { path, error } => Self {
                path: path.clone(),
                error: Some(error.clone()),
                ..Self::default()
            },
        }
    }
}

impl From<&RepositorySnapshot> for ApiRepository {
    fn from(value: &RepositorySnapshot) -> Self {
        let (size_gb, size_tb) = match value.size_bytes.map(SizeUnit::from_bytes) {
            Some(SizeUnit::Gigabytes(v)) => (Some(one_decimal(v)), None),
            Some(SizeUnit::Terabytes(v)) => (None, Some(one_decimal(v))),
            None => (None, None),
        };
        Self {
            path: value.path.display().to_string(),
            size_gb,
            size_tb,
            block_count: value.block_count,
            pin_count: value.pin_count,
            daemon_running: value.daemon_running,
            daemon_version: value.daemon_version.clone(),
            peer_count: value.peer_count,
            error_message: value.error_message.clone(),
        }
    }
}

impl ApiGc {
    pub fn new(record: &GcRunRecord, now: NaiveDateTime) -> Self {
        Self {
            last_run_timestamp: record
                .last_run
                .map(|t| t.format(GC_TIMESTAMP_FORMAT).to_string()),
            last_run_human: record.last_run.map(|t| {
                let ago = (now - t).num_seconds().max(0) as u64;
                format!("{} ago", coarse_duration(ago))
            }),
            blocks_removed: record.blocks_removed,
            duration_seconds: record.duration_seconds,
            duration_human: record
                .duration_seconds
                .map(|s| humantime::format_duration(Duration::from_secs(s)).to_string()),
            duration_estimated: record.duration_estimated,
            next_scheduled_timestamp: record
                .next_scheduled
                .map(|t| t.format(GC_TIMESTAMP_FORMAT).to_string()),
            status: record.status.phrase(),
            source_log_path: record.log_path.display().to_string(),
            error: record.error.clone(),
        }
    }
}

fn whole_gib(bytes: u64) -> u64 {
    (bytes as f64 / GIB as f64).round() as u64
}

fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn build_router(
    metrics: Arc<Metrics>,
    aggregator: Arc<Aggregator>,
    secret_key: impl Into<Arc<str>>,
) -> Router {
    let state = HttpAppState {
        metrics,
        aggregator,
        secret_key: secret_key.into(),
    };

    let protected = Router::new()
        .route("/api/node-stats", get(node_stats_handler))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .fallback(not_found)
        .with_state(state)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

async fn require_auth(
    State(state): State<HttpAppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let Some(header) = header.filter(|v| v.starts_with("Bearer ")) else {
        return unauthorized("Unauthorized - Missing authorization header");
    };

    let token = &header["Bearer ".len()..];
    if !constant_time_eq(token, &state.secret_key) {
        warn!(path = %request.uri().path(), "failed authentication attempt");
        return unauthorized("Unauthorized - Invalid authorization token");
    }

    next.run(request).await
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError {
            success: false,
            error: message.to_string(),
        }),
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": iso_now(),
        "service": "nodestatd",
    }))
}

async fn node_stats_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_request();
    info!("node stats requested");
    let started = Instant::now();

    match state.aggregator.collect().await {
        Ok(report) => {
            state.metrics.update_from_report(&report, started.elapsed());
            let data = ApiNodeStats::from_report(&report, Local::now().naive_local());
            Json(ApiResponse {
                success: true,
                timestamp: report
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                data,
            })
            .into_response()
        }
        Err(err) => {
            error!(error = %err, "failed to collect node stats");
            state.metrics.inc_collect_failure();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError {
                    success: false,
                    error: "Failed to collect node stats".to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError {
            success: false,
            error: "Not found".to_string(),
        }),
    )
        .into_response()
}
