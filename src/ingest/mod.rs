pub mod auth;

use crate::appconfig::AppConfig;
use crate::collect::Collector;
use crate::error::{AppError, AppResult};
use crate::metrics::AppMetrics;
use crate::parse;
use crate::upstream::Sender;

use axum::{
    Router,
    body::Body,
    extract::{RawQuery, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<Collector>,
    pub sender: Arc<Sender>,
    pub metrics: Arc<AppMetrics>,
    pub debug: bool,
    pub log_queries: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(write_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/tables-clean", get(tables_clean_handler))
        .with_state(state)
}

/// Main ingress: inserts are acked as soon as a batcher accepts the rows;
/// everything else is proxied through to an upstream server.
async fn write_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query_string = query.unwrap_or_default();
    let body = String::from_utf8_lossy(&body).into_owned();

    if state.log_queries || state.debug {
        debug!(query = %query_string, body = %body, "incoming query");
    }

    let creds = auth::resolve_credentials(&headers, &query_string);
    let query_string = auth::fold_credentials(&query_string, &creds);
    let (params, content, insert) = parse::parse_query(&query_string, &body);

    if insert {
        if content.is_empty() {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}\n", AppError::EmptyInsert),
            )
                .into_response();
        }
        // fire-and-forget so a full send queue never blocks the client ack
        let collector = state.collector.clone();
        tokio::spawn(async move {
            collector.push(&params, &content).await;
        });
        return (StatusCode::OK, "").into_response();
    }

    match state
        .sender
        .pass_thru(&params, Bytes::from(content.into_bytes()), &headers)
        .await
    {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut builder = http::Response::builder().status(status);
            if let Some(h) = builder.headers_mut() {
                h.extend(resp.headers);
            }
            builder
                .body(Body::from(resp.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            let status = StatusCode::from_u16(e.send_status()).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, format!("{e}\n")).into_response()
        }
    }
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    send_queue: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tables: Option<HashMap<String, usize>>,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusBody> {
    if state.debug {
        Json(StatusBody {
            status: "ok",
            send_queue: Some(state.sender.queue_len()),
            tables: Some(state.collector.snapshot().await.into_iter().collect()),
        })
    } else {
        Json(StatusBody {
            status: "ok",
            send_queue: None,
            tables: None,
        })
    }
}

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
            text,
        )
            .into_response(),
        Err(e) => {
            let status = StatusCode::from_u16(e.send_status()).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, format!("{e}\n")).into_response()
        }
    }
}

async fn tables_clean_handler(State(state): State<AppState>) -> Response {
    state.collector.clean_tables().await;
    (StatusCode::OK, "Ok.\n").into_response()
}

/// Serve the ingress until `shutdown` fires, then give open connections a
/// short grace period. Bind failure is the only fatal startup error.
pub async fn run_server(
    cnf: &AppConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let addr = listen_addr(&cnf.listen)?;
    let app = router(state);

    tracing::info!(listen = %addr, tls = cnf.use_tls, "http ingress starting");

    if cnf.use_tls {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &cnf.tls_cert_file,
            &cnf.tls_key_file,
        )
        .await
        .map_err(|e| AppError::InvalidConfig(format!("TLS setup failed: {e}")))?;

        let handle = axum_server::Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            async move {
                shutdown.cancelled().await;
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            }
        });

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .map_err(|e| AppError::Internal(format!("server error: {e}")))
    } else {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::Internal(format!("failed to bind {addr}: {e}")))?;

        let graceful = {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        };
        let serve = async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
        };

        tokio::select! {
            res = serve => res.map_err(|e| AppError::Internal(format!("server error: {e}"))),
            _ = async {
                shutdown.cancelled().await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => Ok(()),
        }
    }
}

/// `":8124"` means every interface, the ClickHouse way.
fn listen_addr(listen: &str) -> AppResult<SocketAddr> {
    let full = if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    };
    full.parse()
        .map_err(|e| AppError::InvalidConfig(format!("invalid listen address '{listen}': {e}")))
}
