use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for pipeline health and observability.
///
/// All metrics use the "reductoor" namespace. Counters are mirrored
/// from the pipeline's internal stats by the status reporter rather
/// than incremented on the hot path.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Total telemetry reports decoded from node streams.
    pub reports_received: Counter,
    /// Total metric records decoded from node streams.
    pub records_received: Counter,
    /// Total records dropped before the store, by reason.
    pub records_dropped: CounterVec,
    /// Total report decode failures.
    pub decode_errors: Counter,
    /// Total stream reconnect attempts across all listeners.
    pub stream_reconnects: Counter,
    /// Number of nodes the pipeline is configured to listen to.
    pub nodes_configured: Gauge,
    /// Listeners currently streaming.
    pub listeners_streaming: Gauge,
    /// Listeners currently waiting in backoff.
    pub listeners_backoff: Gauge,

    // === Persistence ===
    /// Total rows committed to the store.
    pub records_written: Counter,
    /// Total flush transactions committed.
    pub flushes: Counter,
    /// Total flush transactions that failed.
    pub write_errors: Counter,
    /// Time to write one batch to the store (1ms-1s buckets).
    pub flush_duration: Histogram,
    /// Rows per flush (10-10000 buckets).
    pub flush_batch_size: Histogram,
    /// Whether the store connection is established (1=yes, 0=no).
    pub store_up: Gauge,

    // === Channels ===
    /// Current number of items queued per pipeline channel.
    pub channel_length: GaugeVec,
    /// Capacity of each pipeline channel.
    pub channel_capacity: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let reports_received = Counter::with_opts(
            Opts::new(
                "reports_received_total",
                "Total telemetry reports decoded from node streams.",
            )
            .namespace("reductoor"),
        )?;
        let records_received = Counter::with_opts(
            Opts::new(
                "records_received_total",
                "Total metric records decoded from node streams.",
            )
            .namespace("reductoor"),
        )?;
        let records_dropped = CounterVec::new(
            Opts::new(
                "records_dropped_total",
                "Total records dropped before the store, by reason.",
            )
            .namespace("reductoor"),
            &["reason"],
        )?;
        let decode_errors = Counter::with_opts(
            Opts::new("decode_errors_total", "Total report decode failures.")
                .namespace("reductoor"),
        )?;
        let stream_reconnects = Counter::with_opts(
            Opts::new(
                "stream_reconnects_total",
                "Total stream reconnect attempts across all listeners.",
            )
            .namespace("reductoor"),
        )?;
        let nodes_configured = Gauge::with_opts(
            Opts::new(
                "nodes_configured",
                "Number of nodes the pipeline is configured to listen to.",
            )
            .namespace("reductoor"),
        )?;
        let listeners_streaming = Gauge::with_opts(
            Opts::new("listeners_streaming", "Listeners currently streaming.")
                .namespace("reductoor"),
        )?;
        let listeners_backoff = Gauge::with_opts(
            Opts::new(
                "listeners_backoff",
                "Listeners currently waiting in backoff.",
            )
            .namespace("reductoor"),
        )?;

        let records_written = Counter::with_opts(
            Opts::new("records_written_total", "Total rows committed to the store.")
                .namespace("reductoor"),
        )?;
        let flushes = Counter::with_opts(
            Opts::new("flushes_total", "Total flush transactions committed.")
                .namespace("reductoor"),
        )?;
        let write_errors = Counter::with_opts(
            Opts::new("write_errors_total", "Total flush transactions that failed.")
                .namespace("reductoor"),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to write one batch to the store.",
            )
            .namespace("reductoor")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let flush_batch_size = Histogram::with_opts(
            HistogramOpts::new("flush_batch_size", "Number of rows per flush.")
                .namespace("reductoor")
                .buckets(vec![10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0]),
        )?;
        let store_up = Gauge::with_opts(
            Opts::new(
                "store_up",
                "Whether the store connection is established (1=yes, 0=no).",
            )
            .namespace("reductoor"),
        )?;

        let channel_length = GaugeVec::new(
            Opts::new(
                "channel_length",
                "Current number of items queued per pipeline channel.",
            )
            .namespace("reductoor"),
            &["channel"],
        )?;
        let channel_capacity = GaugeVec::new(
            Opts::new("channel_capacity", "Capacity of each pipeline channel.")
                .namespace("reductoor"),
            &["channel"],
        )?;

        registry.register(Box::new(reports_received.clone()))?;
        registry.register(Box::new(records_received.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(stream_reconnects.clone()))?;
        registry.register(Box::new(nodes_configured.clone()))?;
        registry.register(Box::new(listeners_streaming.clone()))?;
        registry.register(Box::new(listeners_backoff.clone()))?;
        registry.register(Box::new(records_written.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(write_errors.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(flush_batch_size.clone()))?;
        registry.register(Box::new(store_up.clone()))?;
        registry.register(Box::new(channel_length.clone()))?;
        registry.register(Box::new(channel_capacity.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            reports_received,
            records_received,
            records_dropped,
            decode_errors,
            stream_reconnects,
            nodes_configured,
            listeners_streaming,
            listeners_backoff,
            records_written,
            flushes,
            write_errors,
            flush_duration,
            flush_batch_size,
            store_up,
            channel_length,
            channel_capacity,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
