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
use tokio_util::sync::CancellationToken;

use super::Sample;
use crate::chain::MetricsCallback;
use crate::config::bind_addr;
use crate::server::{healthz_handler, serve};

/// Default pull endpoint address.
pub const DEFAULT_ADDR: &str = ":9090";

const TPS_NAMESPACE: &str = "Quorum";
const TPS_SUBSYSTEM: &str = "TransactionProcessing";
const SELF_NAMESPACE: &str = "tpsmon";

/// Pull-based sink: TPS gauges plus the monitor's own health metrics,
/// exposed on GET /metrics.
pub struct PrometheusSink {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Throughput of the latest sample.
    pub tps: Gauge,
    /// Cumulative transactions of the latest sample.
    pub total_transactions: Gauge,
    /// Cumulative blocks of the latest sample.
    pub total_blocks: Gauge,

    /// JSON-RPC requests by method and status.
    pub rpc_requests_total: CounterVec,
    /// JSON-RPC request duration by method.
    pub rpc_request_duration: HistogramVec,
    /// Failed sink pushes by sink.
    pub sink_push_errors: CounterVec,
    /// Total records emitted by the aggregator.
    pub records_emitted: Counter,
}

impl PrometheusSink {
    /// Creates the sink with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let tps = Gauge::with_opts(
            Opts::new("TPS", "Transactions processed per second.")
                .namespace(TPS_NAMESPACE)
                .subsystem(TPS_SUBSYSTEM),
        )?;
        let total_transactions = Gauge::with_opts(
            Opts::new("total_transactions", "Total transactions processed.")
                .namespace(TPS_NAMESPACE)
                .subsystem(TPS_SUBSYSTEM),
        )?;
        let total_blocks = Gauge::with_opts(
            Opts::new("total_blocks", "Total blocks processed.")
                .namespace(TPS_NAMESPACE)
                .subsystem(TPS_SUBSYSTEM),
        )?;

        let rpc_requests_total = CounterVec::new(
            Opts::new(
                "rpc_requests_total",
                "Total JSON-RPC requests by method and status.",
            )
            .namespace(SELF_NAMESPACE),
            &["method", "status"],
        )?;
        let rpc_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "rpc_request_duration_seconds",
                "JSON-RPC request duration by method.",
            )
            .namespace(SELF_NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["method"],
        )?;
        let sink_push_errors = CounterVec::new(
            Opts::new("sink_push_errors_total", "Total failed sink pushes by sink.")
                .namespace(SELF_NAMESPACE),
            &["sink"],
        )?;
        let records_emitted = Counter::with_opts(
            Opts::new("records_emitted_total", "Total TPS records emitted.")
                .namespace(SELF_NAMESPACE),
        )?;

        registry.register(Box::new(tps.clone()))?;
        registry.register(Box::new(total_transactions.clone()))?;
        registry.register(Box::new(total_blocks.clone()))?;
        registry.register(Box::new(rpc_requests_total.clone()))?;
        registry.register(Box::new(rpc_request_duration.clone()))?;
        registry.register(Box::new(sink_push_errors.clone()))?;
        registry.register(Box::new(records_emitted.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            tps,
            total_transactions,
            total_blocks,
            rpc_requests_total,
            rpc_request_duration,
            sink_push_errors,
            records_emitted,
        })
    }

    /// Returns the sink name for logging.
    pub fn name(&self) -> &str {
        "prometheus"
    }

    /// Updates the gauges from a sample.
    pub fn push(&self, sample: &Sample) {
        self.tps.set(f64::from(sample.tps));
        self.total_transactions.set(sample.transactions as f64);
        self.total_blocks.set(sample.blocks as f64);
    }

    /// Builds a chain client callback that records into the RPC metrics.
    pub fn rpc_metrics_callback(&self) -> MetricsCallback {
        let requests = self.rpc_requests_total.clone();
        let duration = self.rpc_request_duration.clone();

        Box::new(move |method, status, elapsed| {
            requests.with_label_values(&[method, status]).inc();
            duration
                .with_label_values(&[method])
                .observe(elapsed.as_secs_f64());
        })
    }

    /// Renders the registry in the text exposition format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::new(self.registry.clone()));

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        serve(app, &bind_addr(&self.addr, DEFAULT_ADDR), "prometheus server", cancel).await
    }

    /// Gracefully shuts down the metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    match encode_registry(&registry) {
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

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    fn sample() -> Sample {
        Sample {
            timestamp: UNIX_EPOCH,
            tps: 10_000,
            transactions: 190_000,
            blocks: 19,
        }
    }

    #[test]
    fn test_push_sets_gauges() {
        let sink = PrometheusSink::new("127.0.0.1:0").expect("new sink");
        sink.push(&sample());

        assert_eq!(sink.tps.get(), 10_000.0);
        assert_eq!(sink.total_transactions.get(), 190_000.0);
        assert_eq!(sink.total_blocks.get(), 19.0);

        let text = sink.encode().expect("encode");
        assert!(text.contains("Quorum_TransactionProcessing_TPS 10000"));
        assert!(text.contains("Quorum_TransactionProcessing_total_transactions 190000"));
        assert!(text.contains("Quorum_TransactionProcessing_total_blocks 19"));
    }

    #[test]
    fn test_rpc_metrics_callback() {
        let sink = PrometheusSink::new("127.0.0.1:0").expect("new sink");
        let cb = sink.rpc_metrics_callback();

        cb("eth_blockNumber", "success", Duration::from_millis(20));
        cb("eth_blockNumber", "success", Duration::from_millis(30));
        cb("eth_getBlockByNumber", "error", Duration::from_millis(5));

        assert_eq!(
            sink.rpc_requests_total
                .with_label_values(&["eth_blockNumber", "success"])
                .get(),
            2.0
        );
        assert_eq!(
            sink.rpc_requests_total
                .with_label_values(&["eth_getBlockByNumber", "error"])
                .get(),
            1.0
        );
        assert_eq!(
            sink.rpc_request_duration
                .with_label_values(&["eth_blockNumber"])
                .get_sample_count(),
            2
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let sink = PrometheusSink::new("127.0.0.1:0").expect("new sink");
        let addr = sink.start().await.expect("start");
        sink.push(&sample());
        sink.records_emitted.inc();

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .expect("get")
            .text()
            .await
            .expect("body");

        assert!(body.contains("Quorum_TransactionProcessing_TPS 10000"));
        assert!(body.contains("tpsmon_records_emitted_total 1"));

        sink.stop();
    }
}
