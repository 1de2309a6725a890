//! HTTP/JSON surface for a running telemetry engine.
//!
//! The server is one more broadcast consumer: it subscribes a holder for the
//! latest sample and serves it, plus the slow readings and the privilege
//! workflow, as JSON. Anything that runs OS tools or blocks on the workflow is
//! moved off the async runtime.

use std::sync::{Arc, Mutex};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

use livestat_core::{
    BootstrapError, PrivilegeState, Readings, Sample, SampleConsumer, SubscriptionHandle,
    TelemetryEngine,
};

/// Keeps the most recent sample the hub delivered.
#[derive(Default)]
struct LatestSample {
    slot: Mutex<Option<Sample>>,
}

impl LatestSample {
    fn get(&self) -> Option<Sample> {
        self.slot.lock().unwrap().clone()
    }
}

impl SampleConsumer for LatestSample {
    fn on_sample(&self, sample: &Sample) {
        *self.slot.lock().unwrap() = Some(sample.clone());
    }
}

/// Shared server state.
struct AppState {
    engine: Arc<TelemetryEngine>,
    latest: Arc<LatestSample>,
    subscription: SubscriptionHandle,
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.engine.unsubscribe(self.subscription);
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: error.into(),
        }),
    )
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sampling: bool,
    interval_ms: u64,
    ticks: u64,
    last_sample_ms: Option<u64>,
    privileges: PrivilegeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    gpu_error: Option<String>,
}

#[derive(Serialize)]
struct PrivilegesResponse {
    state: PrivilegeState,
    in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<BootstrapError>,
}

#[derive(Serialize)]
struct BootstrapResponse {
    run_id: String,
    success: bool,
    state: PrivilegeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<BootstrapError>,
}

#[derive(Deserialize)]
struct IntervalRequest {
    interval_ms: u64,
}

#[derive(Serialize)]
struct IntervalResponse {
    requested_ms: u64,
    interval_ms: u64,
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let config = state.engine.config();
    let metrics: Vec<String> = config.enabled_metrics.iter().map(|m| m.to_string()).collect();

    Json(serde_json::json!({
        "name": "livestat",
        "version": livestat_core::VERSION,
        "interval_ms": state.engine.interval_ms(),
        "metrics": metrics,
        "endpoints": {
            "/": "This API index",
            "/health": "Sampling and privilege status",
            "/api/v1/sample": "Latest published sample",
            "/api/v1/readings": "Slow readings: disk, battery, thermal, fan, power, processes",
            "/api/v1/privileges": "Privileged access state",
            "/api/v1/privileges/bootstrap": {
                "method": "POST",
                "description": "Enable privileged access and wait for the result",
            },
            "/api/v1/interval": {
                "method": "PUT",
                "body": { "interval_ms": "Sampling interval, clamped to 200-5000" },
            },
        },
    }))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let engine = &state.engine;
    let sampling = engine.is_active();
    Json(HealthResponse {
        status: if sampling { "sampling" } else { "idle" },
        sampling,
        interval_ms: engine.interval_ms(),
        ticks: engine.ticks(),
        last_sample_ms: state.latest.get().map(|s| s.timestamp_ms),
        privileges: engine.privilege_state(),
        gpu_error: engine.gpu_state().and_then(|g| g.last_error),
    })
}

async fn handle_sample(State(state): State<Arc<AppState>>) -> Result<Json<Sample>, ApiError> {
    state
        .latest
        .get()
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "no sample published yet"))
}

async fn handle_readings(State(state): State<Arc<AppState>>) -> Result<Json<Readings>, ApiError> {
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || engine.readings())
        .await
        .map(Json)
        .map_err(|e| {
            log::error!("readings task failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("readings failed: {e}"))
        })
}

async fn handle_privileges(State(state): State<Arc<AppState>>) -> Json<PrivilegesResponse> {
    let privileges = state.engine.privileges();
    let (last_message, last_error) = match privileges.last_outcome() {
        Some(Ok(msg)) => (Some(msg), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    Json(PrivilegesResponse {
        state: privileges.state(),
        in_flight: privileges.in_flight(),
        last_message,
        last_error,
    })
}

async fn handle_bootstrap(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BootstrapResponse>, ApiError> {
    let engine = state.engine.clone();
    let (run_id, outcome, privileges) = tokio::task::spawn_blocking(move || {
        let ticket = engine.trigger_privilege_bootstrap();
        let run_id = ticket.run_id.clone();
        let outcome = ticket.wait();
        (run_id, outcome, engine.privilege_state())
    })
    .await
    .map_err(|e| {
        log::error!("bootstrap task failed: {e}");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("bootstrap failed: {e}"))
    })?;

    let (success, message, error) = match outcome {
        Ok(msg) => (true, Some(msg), None),
        Err(e) => (false, None, Some(e)),
    };
    Ok(Json(BootstrapResponse {
        run_id,
        success,
        state: privileges,
        message,
        error,
    }))
}

async fn handle_interval(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IntervalRequest>,
) -> Json<IntervalResponse> {
    let applied = state.engine.set_interval(req.interval_ms);
    if applied != req.interval_ms {
        log::debug!("interval {}ms clamped to {applied}ms", req.interval_ms);
    }
    Json(IntervalResponse {
        requested_ms: req.interval_ms,
        interval_ms: applied,
    })
}

fn app_state(engine: Arc<TelemetryEngine>) -> Arc<AppState> {
    let latest = Arc::new(LatestSample::default());
    if let Some(sample) = engine.latest() {
        latest.on_sample(&sample);
    }
    let subscription = engine.subscribe(&latest);
    Arc::new(AppState {
        engine,
        latest,
        subscription,
    })
}

/// Build the axum router.
fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/api/v1/sample", get(handle_sample))
        .route("/api/v1/readings", get(handle_readings))
        .route("/api/v1/privileges", get(handle_privileges))
        .route("/api/v1/privileges/bootstrap", post(handle_bootstrap))
        .route("/api/v1/interval", put(handle_interval))
        .with_state(state)
}

/// Serve `engine` until the listener fails. The caller starts and stops the
/// engine.
pub async fn run_server(engine: Arc<TelemetryEngine>, host: &str, port: u16) -> std::io::Result<()> {
    let app = build_router(app_state(engine));
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, app).await
}
