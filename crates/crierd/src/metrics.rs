use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// # Errors
///
/// Returns an error if binding the metrics HTTP server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 if ready, 503 if not.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("crier_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("crier_connections_active").decrement(1.0);
    }

    /// Set the authenticated sessions gauge.
    pub fn set_sessions_authenticated(count: usize) {
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("crier_sessions_authenticated").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a login attempt with the given outcome label.
    pub fn logins_total(outcome: &'static str) {
        metrics::counter!("crier_logins_total", "outcome" => outcome).increment(1);
    }

    /// Increment the dispatched-broadcasts counter.
    pub fn broadcasts_total() {
        metrics::counter!("crier_broadcasts_total").increment(1);
    }

    /// Record broadcast envelopes delivered to receivers.
    pub fn messages_delivered_total(count: u64) {
        metrics::counter!("crier_messages_delivered_total").increment(count);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("crier_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Increment the rejected-logins counter.
    pub fn auth_failures_total() {
        metrics::counter!("crier_auth_failures_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a broadcast fan-out duration in seconds.
    pub fn broadcast_fanout_seconds(value: f64) {
        metrics::histogram!("crier_broadcast_fanout_seconds").record(value);
    }
}
