use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "rollupd";

/// Prometheus metrics for rollup health and observability.
///
/// All metrics use the "rollupd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total source events handed to the engine.
    pub events_received: Counter,
    /// Events skipped for a series because their timestamp was unusable.
    pub events_skipped: Counter,
    /// Successful upserts by resolution.
    pub upserts: CounterVec,
    /// Failed upserts by resolution.
    pub upsert_errors: CounterVec,
    /// Upsert latency by store (100us-1s buckets).
    pub upsert_duration: HistogramVec,
    /// Total read queries served.
    pub queries: Counter,
    /// Number of registered series.
    pub series_registered: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total source events handed to the rollup engine.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_skipped = Counter::with_opts(
            Opts::new(
                "events_skipped_total",
                "Total series/event pairs skipped because the timestamp was missing or invalid.",
            )
            .namespace(NAMESPACE),
        )?;
        let upserts = CounterVec::new(
            Opts::new("upserts_total", "Total successful upserts by resolution.")
                .namespace(NAMESPACE),
            &["resolution"],
        )?;
        let upsert_errors = CounterVec::new(
            Opts::new("upsert_errors_total", "Total failed upserts by resolution.")
                .namespace(NAMESPACE),
            &["resolution"],
        )?;
        let upsert_duration = HistogramVec::new(
            HistogramOpts::new(
                "upsert_duration_seconds",
                "Time to apply one upsert by store.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["store"],
        )?;
        let queries = Counter::with_opts(
            Opts::new("queries_total", "Total rollup read queries served.").namespace(NAMESPACE),
        )?;
        let series_registered = Gauge::with_opts(
            Opts::new("series_registered", "Number of registered rollup series.")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_skipped.clone()))?;
        registry.register(Box::new(upserts.clone()))?;
        registry.register(Box::new(upsert_errors.clone()))?;
        registry.register(Box::new(upsert_duration.clone()))?;
        registry.register(Box::new(queries.clone()))?;
        registry.register(Box::new(series_registered.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_skipped,
            upserts,
            upsert_errors,
            upsert_duration,
            queries,
            series_registered,
        })
    }

    /// Encodes every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 is requested.
    pub async fn start(&self) -> Result<SocketAddr> {
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

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

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

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
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

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        response
    }

    #[test]
    fn test_render_includes_namespace() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.events_received.inc();
        health.upserts.with_label_values(&["hour"]).inc();

        let text = health.render().expect("render");
        assert!(text.contains("rollupd_events_received_total 1"));
        assert!(text.contains("rollupd_upserts_total{resolution=\"hour\"} 1"));
    }

    #[tokio::test]
    async fn test_server_serves_health_and_metrics() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.queries.inc();
        let addr = health.start().await.expect("start");

        let healthz = get(addr, "/healthz").await;
        assert!(healthz.starts_with("HTTP/1.1 200"));
        assert!(healthz.ends_with("ok"));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.contains("rollupd_queries_total 1"));

        health.stop().await.expect("stop");
    }
}
