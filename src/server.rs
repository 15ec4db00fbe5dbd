use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    benchmark::{compare_hybrid_vs_single, BenchmarkSuite},
    ports,
    scanner::{PortScanner, SharedProgress},
    types::{ProbeResult, ScanMetrics, Technique},
};

/// Injected, explicitly-owned scan state for the HTTP layer. Cleared at the
/// start of each new target scan; one scan runs at a time per server.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>,
}

#[derive(Debug, Default)]
struct ServerState {
    state: ScanState,
    total: u64,
    results: Option<ScanOutput>,
    progress: Option<SharedProgress>,
    cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    Running,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutput {
    pub host: String,
    pub results: Vec<ProbeResult>,
    pub metrics: ScanMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub total: u64,
    pub scanned: u64,
    pub open: u64,
    pub in_flight: u64,
    pub state: ScanState,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub host: String,
    #[serde(default = "default_start_port")]
    pub start_port: u16,
    #[serde(default = "default_end_port")]
    pub end_port: u16,
    #[serde(default = "default_true")]
    pub use_common_ports: bool,
    #[serde(default = "default_technique")]
    pub technique: Technique,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TargetRequest {
    pub host: String,
}

fn default_start_port() -> u16 {
    1
}

fn default_end_port() -> u16 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_technique() -> Technique {
    Technique::TcpConnect
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/results", get(get_results))
        .route("/benchmark", post(post_benchmark))
        .route("/compare", post(post_compare))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str) -> Result<()> {
    let state = AppState {
        inner: Arc::new(RwLock::new(ServerState::default())),
    };
    let app = router(state);

    info!(bind, "scan API listening");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let (scanned, open, in_flight) = match s.progress.as_ref() {
        Some(p) => (
            p.scanned_done.load(std::sync::atomic::Ordering::Relaxed),
            p.open_count.load(std::sync::atomic::Ordering::Relaxed),
            p.in_flight.load(std::sync::atomic::Ordering::Relaxed),
        ),
        None => {
            let done = s
                .results
                .as_ref()
                .map(|r| {
                    (
                        r.metrics.ports_scanned as u64,
                        r.metrics.open_count as u64,
                    )
                })
                .unwrap_or((0, 0));
            (done.0, done.1, 0)
        }
    };
    (
        StatusCode::OK,
        Json(Status {
            total: s.total,
            scanned,
            open,
            in_flight,
            state: s.state,
        }),
    )
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    match s.results.as_ref() {
        Some(out) => (StatusCode::OK, Json(out.clone())).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> impl IntoResponse {
    if req.start_port > req.end_port {
        return (
            StatusCode::BAD_REQUEST,
            format!("invalid range {}-{}", req.start_port, req.end_port),
        )
            .into_response();
    }

    let worklist = ports::build_worklist(req.start_port, req.end_port, req.use_common_ports);
    let total = worklist.len() as u64;
    let timeout = Duration::from_millis(req.timeout_ms.unwrap_or(3_000));
    let mut scanner = PortScanner::new(timeout, req.concurrency.unwrap_or(100));
    if let Some(deadline_ms) = req.deadline_ms {
        scanner = scanner.with_deadline(Duration::from_millis(deadline_ms));
    }

    let progress = SharedProgress::new();
    let cancel = CancellationToken::new();

    // New scan takes over the store: cancel anything running, clear results.
    {
        let mut s = app.inner.write().await;
        if let Some(c) = s.cancel.take() {
            c.cancel();
        }
        s.state = ScanState::Running;
        s.total = total;
        s.results = None;
        s.progress = Some(progress.clone());
        s.cancel = Some(cancel.clone());
    }

    let app2 = app.clone();
    let host = req.host.clone();
    let technique = req.technique;
    tokio::spawn(async move {
        let outcome = scanner
            .scan_ports(&host, &worklist, technique, cancel, progress)
            .await;

        let mut s = app2.inner.write().await;
        s.progress = None;
        s.cancel = None;
        match outcome {
            Ok((results, metrics)) => {
                s.state = ScanState::Done;
                s.results = Some(ScanOutput {
                    host,
                    results,
                    metrics,
                });
            }
            Err(e) => {
                s.state = ScanState::Idle;
                error!(host, error = %e, "scan failed");
            }
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(Status {
            total,
            scanned: 0,
            open: 0,
            in_flight: 0,
            state: ScanState::Running,
        }),
    )
        .into_response()
}

async fn post_benchmark(Json(req): Json<TargetRequest>) -> impl IntoResponse {
    match BenchmarkSuite::new(&req.host).run_comprehensive_benchmark().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

async fn post_compare(Json(req): Json<TargetRequest>) -> impl IntoResponse {
    match compare_hybrid_vs_single(&req.host).await {
        Ok(finding) => (StatusCode::OK, Json(finding)).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}
