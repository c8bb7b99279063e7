pub mod batcher;

pub use batcher::*;

use crate::metrics::AppMetrics;
use crate::parse;
use crate::upstream::BatchSink;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Registry and router: one `TableBatcher` per canonical key.
///
/// `push` takes the read lock on the hot path and only promotes to the write
/// lock (with a re-check) when the key is new. The optional cleanup ticker
/// evicts batchers idle for longer than `clean_interval_ms`.
pub struct Collector {
    tables: RwLock<HashMap<String, Arc<TableBatcher>>>,
    flush_count: usize,
    flush_interval_ms: u64,
    clean_interval_ms: u64,
    remove_query_id: bool,
    sink: Arc<dyn BatchSink>,
    metrics: Arc<AppMetrics>,
    stop: CancellationToken,
    cleaner: StdMutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn start(
        sink: Arc<dyn BatchSink>,
        flush_count: usize,
        flush_interval_ms: u64,
        clean_interval_ms: u64,
        remove_query_id: bool,
        metrics: Arc<AppMetrics>,
    ) -> Arc<Self> {
        let collector = Arc::new(Self {
            tables: RwLock::new(HashMap::new()),
            flush_count,
            flush_interval_ms,
            clean_interval_ms,
            remove_query_id,
            sink,
            metrics,
            stop: CancellationToken::new(),
            cleaner: StdMutex::new(None),
        });

        if clean_interval_ms > 0 {
            let handle = tokio::spawn(Self::clean_loop(collector.clone()));
            *collector.cleaner.lock().expect("cleaner handle lock") = Some(handle);
        }
        collector
    }

    async fn clean_loop(self: Arc<Self>) {
        let period = Duration::from_millis(self.clean_interval_ms);
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = ticker.tick() => {
                    self.clean_tables().await;
                }
            }
        }
    }

    /// The batcher key: the params string, with `query_id` stripped when
    /// configured (retried client inserts must land in the same batcher).
    pub fn canonical_key(&self, params: &str) -> String {
        if self.remove_query_id {
            parse::strip_param(params, "query_id")
        } else {
            params.to_string()
        }
    }

    /// Route one insert payload to its batcher, creating it on first touch.
    pub async fn push(&self, params: &str, content: &str) {
        let key = self.canonical_key(params);

        {
            let tables = self.tables.read().await;
            if let Some(table) = tables.get(&key) {
                table.add(content).await;
                self.metrics.inc_received();
                return;
            }
        }

        let mut tables = self.tables.write().await;
        // re-check: another task may have created the batcher while we were
        // waiting on the write lock
        let table = match tables.get(&key) {
            Some(table) => table.clone(),
            None => {
                let table = TableBatcher::spawn(
                    &key,
                    self.sink.clone(),
                    self.flush_count,
                    self.flush_interval_ms,
                );
                tables.insert(key, table.clone());
                table
            }
        };
        table.add(content).await;
        self.metrics.inc_received();
    }

    /// Evict batchers idle past `clean_interval_ms`. Each ticker is stopped
    /// synchronously, then any remaining rows are flushed before removal.
    pub async fn clean_tables(&self) {
        let mut tables = self.tables.write().await;
        let idle_after = Duration::from_millis(self.clean_interval_ms);

        let mut stale = Vec::new();
        for (key, table) in tables.iter() {
            if table.idle_for().await > idle_after {
                stale.push(key.clone());
            }
        }

        for key in stale {
            if let Some(table) = tables.remove(&key) {
                table.shutdown().await;
                table.check_flush().await;
                info!(table = %key, "evicted idle batcher");
            }
        }
    }

    /// Flush every non-empty batcher; returns how many flushed. Used at
    /// shutdown.
    pub async fn flush_all(&self) -> usize {
        let tables = self.tables.write().await;
        let mut flushed = 0;
        for table in tables.values() {
            if table.check_flush().await {
                flushed += 1;
            }
        }
        flushed
    }

    pub async fn empty(&self) -> bool {
        let tables = self.tables.read().await;
        for table in tables.values() {
            if !table.is_empty().await {
                return false;
            }
        }
        true
    }

    /// Per-table pending row counts, for the status page.
    pub async fn snapshot(&self) -> Vec<(String, usize)> {
        let tables = self.tables.read().await;
        let mut out = Vec::with_capacity(tables.len());
        for (key, table) in tables.iter() {
            out.push((key.clone(), table.row_count().await));
        }
        out
    }

    pub async fn table_count(&self, params: &str) -> Option<usize> {
        let key = self.canonical_key(params);
        let tables = self.tables.read().await;
        match tables.get(&key) {
            Some(table) => Some(table.row_count().await),
            None => None,
        }
    }

    /// Delegates to the sender's drain.
    pub async fn wait_flush(&self) {
        self.sink.wait_flush().await;
    }

    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.cleaner.lock().expect("cleaner handle lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
