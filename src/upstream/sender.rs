use crate::dump::{DUMP_PREFIX_REJECT, DUMP_PREFIX_SERVER, DumpStore};
use crate::error::{AppError, AppResult};
use crate::metrics::AppMetrics;
use crate::upstream::pool::{PickedServer, ServerPool};
use crate::upstream::{BatchRequest, BatchSink, QuerySender, split_credentials};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Bounded batch queue; a full queue blocks producers (back-pressure all the
/// way up to `Collector::push`).
pub const SEND_QUEUE_CAPACITY: usize = 1000;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(10);

const X_CLICKHOUSE_USER: &str = "x-clickhouse-user";
const X_CLICKHOUSE_KEY: &str = "x-clickhouse-key";

/// Upstream response proxied back verbatim on the pass-through path.
#[derive(Debug)]
pub struct PassThruResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Server pool plus the bounded work queue and its single worker task.
///
/// The outstanding-work counter covers both queued batches and the one the
/// worker currently holds, so `wait_flush` really means "everything either
/// delivered or spooled".
pub struct Sender {
    tx: mpsc::Sender<BatchRequest>,
    pool: Arc<ServerPool>,
    dumper: Arc<DumpStore>,
    pending: AtomicI64,
    metrics: Arc<AppMetrics>,
}

impl Sender {
    pub fn start(
        pool: Arc<ServerPool>,
        dumper: Arc<DumpStore>,
        metrics: Arc<AppMetrics>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let sender = Arc::new(Self {
            tx,
            pool,
            dumper,
            pending: AtomicI64::new(0),
            metrics,
        });
        tokio::spawn(Self::run(sender.clone(), rx));
        sender
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<BatchRequest>) {
        loop {
            match tokio::time::timeout(POLL_INTERVAL, rx.recv()).await {
                Ok(Some(req)) => {
                    self.process(req).await;
                    let left = self.pending.fetch_sub(1, Ordering::SeqCst) - 1;
                    self.metrics.set_send_queue_depth(left);
                }
                // all senders dropped; process is shutting down
                Ok(None) => return,
                Err(_) => self.refresh_server_gauges(),
            }
        }
    }

    async fn process(&self, req: BatchRequest) {
        match Sender::send_query(self, &req).await {
            Ok((status, _body)) => {
                self.metrics.inc_sent();
                debug!(rows = req.count, status, "batch delivered");
            }
            Err(err) => {
                let status = err.send_status();
                let response = match &err {
                    AppError::ServerReject { body, .. } => body.clone(),
                    other => other.to_string(),
                };
                let prefix = if (400..502).contains(&status) {
                    DUMP_PREFIX_REJECT
                } else {
                    DUMP_PREFIX_SERVER
                };
                error!(status, rows = req.count, error = %err, "terminal send failure, spooling batch");
                if let Err(e) = self
                    .dumper
                    .dump(&req.params, &req.content, &response, prefix, status)
                    .await
                {
                    error!(error = %e, "dump failed, batch lost");
                }
            }
        }
        self.refresh_server_gauges();
    }

    fn refresh_server_gauges(&self) {
        let (good, bad) = self.pool.counts();
        self.metrics.set_server_states(good, bad);
    }

    pub fn queue_len(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Server-cycle retry loop. Transport errors and statuses >= 502 mark
    /// the server bad and move on to the next one; 4xx below 502 comes back
    /// as a non-retryable `ServerReject`.
    pub async fn send_query(&self, req: &BatchRequest) -> AppResult<(u16, String)> {
        let (query_string, creds) = split_credentials(&req.params);
        loop {
            let Some(srv) = self.pool.pick() else {
                return Err(AppError::NoServers);
            };

            let url = request_url(&srv, &query_string);
            let mut request = srv
                .client
                .post(&url)
                .header(header::CONTENT_TYPE, "text/plain")
                .body(req.content.clone());
            if let Some(c) = &creds {
                request = request
                    .header(X_CLICKHOUSE_USER, c.user.as_str())
                    .header(X_CLICKHOUSE_KEY, c.pass.as_str());
            }

            info!(rows = req.count, server = %srv.url, "sending batch");
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    // drain the body on every path before the next attempt
                    let body = resp.text().await.unwrap_or_default();
                    if status >= 502 {
                        self.pool.mark_bad(srv.index);
                        warn!(server = %srv.url, status, "upstream unhealthy, trying next server");
                        continue;
                    }
                    if status >= 400 {
                        return Err(AppError::ServerReject { status, body });
                    }
                    return Ok((status, body));
                }
                Err(e) => {
                    self.pool.mark_bad(srv.index);
                    warn!(server = %srv.url, error = %e, "transport error, trying next server");
                }
            }
        }
    }

    /// Forward a non-insert request to a chosen server and hand the response
    /// back verbatim. A failed transport (including a broken response body)
    /// marks the server bad and retries the next one.
    pub async fn pass_thru(
        &self,
        params: &str,
        body: Bytes,
        request_headers: &HeaderMap,
    ) -> AppResult<PassThruResponse> {
        let (query_string, creds) = split_credentials(params);
        loop {
            let Some(srv) = self.pool.pick() else {
                return Err(AppError::NoServers);
            };

            let url = request_url(&srv, &query_string);
            let mut request = srv.client.post(&url).body(body.clone());
            for (name, value) in request_headers {
                if skip_forward_header(name) {
                    continue;
                }
                request = request.header(name, value);
            }
            if let Some(c) = &creds {
                request = request
                    .header(X_CLICKHOUSE_USER, c.user.as_str())
                    .header(X_CLICKHOUSE_KEY, c.pass.as_str());
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let mut headers = HeaderMap::new();
                    for (name, value) in resp.headers() {
                        if skip_forward_header(name) {
                            continue;
                        }
                        headers.insert(name.clone(), value.clone());
                    }
                    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));

                    match resp.bytes().await {
                        Ok(bytes) => {
                            return Ok(PassThruResponse {
                                status,
                                headers,
                                body: bytes,
                            });
                        }
                        Err(e) => {
                            self.pool.mark_bad(srv.index);
                            warn!(server = %srv.url, error = %e, "response body error, trying next server");
                        }
                    }
                }
                Err(e) => {
                    self.pool.mark_bad(srv.index);
                    warn!(server = %srv.url, error = %e, "transport error, trying next server");
                }
            }
        }
    }
}

#[async_trait]
impl BatchSink for Sender {
    async fn enqueue(&self, req: BatchRequest) {
        let depth = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.set_send_queue_depth(depth);
        if self.tx.send(req).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn wait_flush(&self) {
        while self.pending.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

#[async_trait]
impl QuerySender for Sender {
    async fn send_query(&self, req: &BatchRequest) -> AppResult<(u16, String)> {
        Sender::send_query(self, req).await
    }
}

fn request_url(srv: &PickedServer, query_string: &str) -> String {
    if query_string.is_empty() {
        srv.url.clone()
    } else {
        format!("{}?{}", srv.url, query_string)
    }
}

/// Hop-by-hop headers plus anything auth-related: credentials already ride
/// as X-ClickHouse headers derived from the resolved pair.
fn skip_forward_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "content-length"
            | "connection"
            | "keep-alive"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "authorization"
            | X_CLICKHOUSE_USER
            | X_CLICKHOUSE_KEY
    )
}
