//! HTTP control surface.
//!
//! Serves the three per-table endpoints (signals, status, table document)
//! alongside `/metrics` and `/healthz`. Writing a name array to a table's
//! signals endpoint replaces its column set; the accepted list is echoed
//! back by subsequent reads.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::health::HealthMetrics;
use super::{MemoryStatusSink, MemoryTableSink};
use crate::coordinator::Coordinator;

/// Endpoint handles for one table.
pub struct TableHandles {
    pub coordinator: Arc<Coordinator>,
    pub table: Arc<MemoryTableSink>,
    pub status: Arc<MemoryStatusSink>,
}

struct AppState {
    metrics: Arc<HealthMetrics>,
    tables: HashMap<String, TableHandles>,
}

/// The service's HTTP server.
pub struct ApiServer {
    addr: String,
    state: Arc<AppState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ApiServer {
    pub fn new(addr: &str, metrics: Arc<HealthMetrics>, tables: Vec<TableHandles>) -> Self {
        let tables = tables
            .into_iter()
            .map(|t| (t.coordinator.prefix().to_string(), t))
            .collect();

        Self {
            addr: addr.to_string(),
            state: Arc::new(AppState { metrics, tables }),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Start serving. Returns once the listener is bound.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = normalize_addr(&self.addr);

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/tables", get(list_tables_handler))
            .route("/tables/:prefix/signals", get(get_signals_handler))
            .route("/tables/:prefix/signals", put(put_signals_handler))
            .route("/tables/:prefix/status", get(get_status_handler))
            .route("/tables/:prefix/table", get(get_table_handler))
            .with_state(Arc::clone(&self.state));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "api server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "api server error");
            }
        });

        Ok(())
    }

    /// Gracefully shut the server down.
    pub async fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Expand the ":port" shorthand to a bindable address.
fn normalize_addr(addr: &str) -> String {
    let addr = if addr.is_empty() { ":8432" } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry().gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
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

/// GET /tables - Configured table prefixes.
async fn list_tables_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut prefixes: Vec<&String> = state.tables.keys().collect();
    prefixes.sort();
    Json(prefixes.into_iter().cloned().collect::<Vec<_>>())
}

/// GET /tables/{prefix}/signals - Current column set.
async fn get_signals_handler(
    State(state): State<Arc<AppState>>,
    Path(prefix): Path<String>,
) -> impl IntoResponse {
    match state.tables.get(&prefix) {
        Some(handles) => Json(handles.coordinator.signals()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// PUT /tables/{prefix}/signals - Replace the column set.
async fn put_signals_handler(
    State(state): State<Arc<AppState>>,
    Path(prefix): Path<String>,
    Json(signals): Json<Vec<String>>,
) -> impl IntoResponse {
    let Some(handles) = state.tables.get(&prefix) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match handles.coordinator.set_signals(signals) {
        Ok(()) => {
            // Echo the accepted list.
            Json(handles.coordinator.signals()).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// GET /tables/{prefix}/status - Latest per-signal counters snapshot.
async fn get_status_handler(
    State(state): State<Arc<AppState>>,
    Path(prefix): Path<String>,
) -> impl IntoResponse {
    match state.tables.get(&prefix).and_then(|h| h.status.latest()) {
        Some(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /tables/{prefix}/table - Latest published table document.
async fn get_table_handler(
    State(state): State<Arc<AppState>>,
    Path(prefix): Path<String>,
) -> impl IntoResponse {
    match state.tables.get(&prefix).and_then(|h| h.table.latest()) {
        Some(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
