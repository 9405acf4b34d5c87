//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (are the caches synced and workers running?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::telemetry::Telemetry;

/// Address the health server binds to
pub const HEALTH_ADDR: &str = "0.0.0.0:8080";

/// Labels for webhook metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct WebhookLabels {
    pub driver: String,
    pub operation: String,
}

impl prometheus_client::encoding::EncodeLabelSet for WebhookLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("driver", self.driver.as_str()).encode(encoder.encode_label())?;
        ("operation", self.operation.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub kind: String,
    pub result: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ReconcileLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        ("result", self.result.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Webhook calls attempted
    pub webhook_calls_total: Family<WebhookLabels, Counter>,
    /// Webhook calls that failed at the transport level
    pub webhook_errors_total: Family<WebhookLabels, Counter>,
    /// Webhook calls the driver answered with Fail
    pub webhook_fails_total: Family<WebhookLabels, Counter>,
    /// Webhook latency histogram
    pub webhook_latency_seconds: Family<WebhookLabels, Histogram>,

    /// Reconciles by kind and result
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    /// Reconcile duration histogram
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let webhook_calls_total = Family::<WebhookLabels, Counter>::default();
        registry.register(
            "lbcf_operator_webhook_calls",
            "Total number of driver webhook calls",
            webhook_calls_total.clone(),
        );

        let webhook_errors_total = Family::<WebhookLabels, Counter>::default();
        registry.register(
            "lbcf_operator_webhook_errors",
            "Total number of webhook calls without a well-formed answer",
            webhook_errors_total.clone(),
        );

        let webhook_fails_total = Family::<WebhookLabels, Counter>::default();
        registry.register(
            "lbcf_operator_webhook_fails",
            "Total number of webhook calls answered with Fail",
            webhook_fails_total.clone(),
        );

        let webhook_latency_seconds =
            Family::<WebhookLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            });
        registry.register(
            "lbcf_operator_webhook_latency_seconds",
            "Latency of driver webhook calls in seconds",
            webhook_latency_seconds.clone(),
        );

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "lbcf_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "lbcf_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        Self {
            webhook_calls_total,
            webhook_errors_total,
            webhook_fails_total,
            webhook_latency_seconds,
            reconciliations_total,
            reconcile_duration_seconds,
            registry,
        }
    }

    fn webhook_labels(driver: &str, operation: &str) -> WebhookLabels {
        WebhookLabels {
            driver: driver.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

impl Telemetry for Metrics {
    fn webhook_called(&self, driver: &str, operation: &str) {
        self.webhook_calls_total
            .get_or_create(&Self::webhook_labels(driver, operation))
            .inc();
    }

    fn webhook_error(&self, driver: &str, operation: &str) {
        self.webhook_errors_total
            .get_or_create(&Self::webhook_labels(driver, operation))
            .inc();
    }

    fn webhook_failed(&self, driver: &str, operation: &str) {
        self.webhook_fails_total
            .get_or_create(&Self::webhook_labels(driver, operation))
            .inc();
    }

    fn webhook_latency(&self, driver: &str, operation: &str, seconds: f64) {
        self.webhook_latency_seconds
            .get_or_create(&Self::webhook_labels(driver, operation))
            .observe(seconds);
    }

    fn reconciled(&self, kind: &str, result: &str, seconds: f64) {
        let labels = ReconcileLabels {
            kind: kind.to_string(),
            result: result.to_string(),
        };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(seconds);
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether caches are synced and workers are running
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Arc<Metrics>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Metrics as a telemetry sink
    pub fn telemetry(&self) -> Arc<dyn Telemetry> {
        self.metrics.clone()
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the operator holds the lease and
/// its caches are synced.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server on an already bound listener
pub async fn serve_health(state: Arc<HealthState>, listener: TcpListener) -> std::io::Result<()> {
    axum::serve(listener, create_router(state)).await
}

/// Run the health server on [`HEALTH_ADDR`]
pub async fn run_health_server(state: Arc<HealthState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(HEALTH_ADDR).await?;
    let addr: SocketAddr = listener.local_addr()?;
    tracing::info!(%addr, "Health server listening");
    serve_health(state, listener).await
}
