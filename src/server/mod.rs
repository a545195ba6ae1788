use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::aggregator::store::RecordStore;
use crate::config::bind_addr;

/// Default query endpoint address.
pub const DEFAULT_ADDR: &str = ":7575";

/// Serves the emitted TPS records over HTTP.
pub struct QueryServer {
    store: RecordStore,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl QueryServer {
    pub fn new(addr: &str, store: RecordStore) -> Self {
        Self {
            store,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Starts serving GET /tpsdata and GET /healthz.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 is requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let app = Router::new()
            .route("/tpsdata", get(tpsdata_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(self.store.clone());

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        serve(app, &bind_addr(&self.addr, DEFAULT_ADDR), "tps query server", cancel).await
    }

    /// Gracefully shuts down the server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Binds `addr` and serves `app` on a spawned task until `cancel` fires.
pub(crate) async fn serve(
    app: Router,
    addr: &str,
    name: &'static str,
    cancel: CancellationToken,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("listening on {addr}"))?;

    let local_addr = listener.local_addr().context("getting local address")?;

    tokio::spawn(async move {
        tracing::info!(addr = %local_addr, "{name} started");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "{name} error");
        }
    });

    Ok(local_addr)
}

/// GET /tpsdata - all records as CSV.
async fn tpsdata_handler(State(store): State<RecordStore>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        store.to_csv(),
    )
}

/// GET /healthz - Simple health check.
pub(crate) async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::aggregator::record::TpsRecord;

    fn record(n: u64) -> TpsRecord {
        TpsRecord {
            local_time: format!("01 Jan 2024 00:00:{n:02}"),
            ref_time: format!("00:00:00:{n:02}"),
            tps: 10,
            transactions: n * 10,
            blocks: n,
            timestamp: UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_tpsdata_returns_header_and_rows_in_order() {
        let store = RecordStore::new();
        let server = QueryServer::new("127.0.0.1:0", store.clone());
        let addr = server.start().await.expect("start server");

        let url = format!("http://{addr}/tpsdata");

        let body = reqwest::get(&url).await.expect("get").text().await.expect("body");
        assert_eq!(body, "localTime,refTime,TPS,TxnCount,BlockCount\n");

        store.push(record(1));
        store.push(record(2));

        let response = reqwest::get(&url).await.expect("get");
        assert!(response.status().is_success());
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/plain"));

        let body = response.text().await.expect("body");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "01 Jan 2024 00:00:01,00:00:00:01,10,10,1");
        assert_eq!(lines[2], "01 Jan 2024 00:00:02,00:00:00:02,10,20,2");

        server.stop();
    }

    #[tokio::test]
    async fn test_healthz() {
        let server = QueryServer::new("127.0.0.1:0", RecordStore::new());
        let addr = server.start().await.expect("start server");

        let body = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .expect("get")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "ok");

        server.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let first = QueryServer::new("127.0.0.1:0", RecordStore::new());
        let addr = first.start().await.expect("start server");

        let second = QueryServer::new(&addr.to_string(), RecordStore::new());
        assert!(second.start().await.is_err());

        first.stop();
    }
}
