use crate::parse::{self, FORMAT_ROW_BINARY, FORMAT_TAB_SEPARATED};
use crate::upstream::{BatchRequest, BatchSink};

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Coalescing buffer for one logical destination (one canonical key).
///
/// Rows accumulate under the batcher's own mutex; a flush publishes a
/// self-contained `BatchRequest` snapshot and swaps in a fresh buffer. The
/// ticker drives interval flushes until `shutdown` stops it.
pub struct TableBatcher {
    query: String,
    params: String,
    format: String,
    flush_count: usize,
    sink: Arc<dyn BatchSink>,
    state: Mutex<BatchState>,
    stop: CancellationToken,
    ticker: StdMutex<Option<JoinHandle<()>>>,
}

struct BatchState {
    rows: Vec<String>,
    last_update: Instant,
}

impl TableBatcher {
    /// Create a batcher for `key` and start its flush ticker.
    pub fn spawn(
        key: &str,
        sink: Arc<dyn BatchSink>,
        flush_count: usize,
        flush_interval_ms: u64,
    ) -> Arc<Self> {
        let (query, params) = parse::separate_query(key);
        let format = parse::extract_format(&query);

        let batcher = Arc::new(Self {
            query,
            params,
            format,
            flush_count,
            sink,
            state: Mutex::new(BatchState {
                rows: Vec::with_capacity(flush_count),
                last_update: Instant::now(),
            }),
            stop: CancellationToken::new(),
            ticker: StdMutex::new(None),
        });

        let handle = tokio::spawn(Self::ticker_loop(batcher.clone(), flush_interval_ms));
        *batcher.ticker.lock().expect("ticker handle lock") = Some(handle);
        batcher
    }

    async fn ticker_loop(self: Arc<Self>, flush_interval_ms: u64) {
        let period = Duration::from_millis(flush_interval_ms.max(1));
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = ticker.tick() => {
                    self.check_flush().await;
                }
            }
        }
    }

    /// Append one insert payload. `TabSeparated` payloads are split into
    /// individual lines so the row count stays accurate. Triggers a flush
    /// while still holding the lock once `flush_count` is reached.
    pub async fn add(&self, content: &str) {
        let mut state = self.state.lock().await;
        if self.format == FORMAT_TAB_SEPARATED {
            state.rows.extend(content.split('\n').map(str::to_string));
        } else {
            state.rows.push(content.to_string());
        }
        state.last_update = Instant::now();
        if state.rows.len() >= self.flush_count {
            self.flush_locked(&mut state).await;
        }
    }

    /// Flush pending rows if any; returns whether a flush happened.
    pub async fn check_flush(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.rows.is_empty() {
            return false;
        }
        self.flush_locked(&mut state).await;
        true
    }

    async fn flush_locked(&self, state: &mut BatchState) {
        let rows = std::mem::replace(&mut state.rows, Vec::with_capacity(self.flush_count));
        let sep = if self.format == FORMAT_ROW_BINARY { "" } else { "\n" };
        let req = BatchRequest {
            params: self.params.clone(),
            query: self.query.clone(),
            content: format!("{}\n{}", self.query, rows.join(sep)),
            count: rows.len(),
            is_insert: true,
        };
        self.sink.enqueue(req).await;
    }

    pub async fn row_count(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.row_count().await == 0
    }

    pub async fn idle_for(&self) -> Duration {
        self.state.lock().await.last_update.elapsed()
    }

    /// Stop the ticker and wait for any in-flight tick to finish, so the
    /// collector can evict this batcher without racing a pending flush.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handle = self.ticker.lock().expect("ticker handle lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn params(&self) -> &str {
        &self.params
    }

    pub fn format(&self) -> &str {
        &self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::query_escape;
    use crate::tests::support::RecordingSink;

    const TAB_KEY_QUERY: &str = "INSERT INTO table3 (c1, c2, c3) FORMAT TabSeparated";

    fn tab_key() -> String {
        format!("user=u&query={}", query_escape(TAB_KEY_QUERY))
    }

    #[tokio::test]
    async fn derives_query_params_and_format_from_key() {
        let sink = Arc::new(RecordingSink::default());
        let b = TableBatcher::spawn(&tab_key(), sink, 1000, 60_000);
        assert_eq!(b.query(), TAB_KEY_QUERY);
        assert_eq!(b.params(), "user=u");
        assert_eq!(b.format(), "TabSeparated");
        b.shutdown().await;
    }

    #[tokio::test]
    async fn tab_separated_add_splits_lines() {
        let sink = Arc::new(RecordingSink::default());
        let b = TableBatcher::spawn(&tab_key(), sink, 1000, 60_000);
        b.add("v11\tv12\nv21\tv22").await;
        assert_eq!(b.row_count().await, 2);
        b.shutdown().await;
    }

    #[tokio::test]
    async fn flush_publishes_snapshot_and_resets() {
        let sink = Arc::new(RecordingSink::default());
        let b = TableBatcher::spawn(
            &format!("query={}", query_escape("INSERT INTO t (a) VALUES")),
            sink.clone(),
            1000,
            60_000,
        );
        b.add("(1)").await;
        b.add("(2)").await;
        assert!(b.check_flush().await);
        assert!(b.is_empty().await);
        assert!(!b.check_flush().await);

        let reqs = sink.requests().await;
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].count, 2);
        assert_eq!(reqs[0].content, "INSERT INTO t (a) VALUES\n(1)\n(2)");
        assert!(reqs[0].is_insert);
        b.shutdown().await;
    }

    #[tokio::test]
    async fn row_binary_rows_join_without_separator() {
        let sink = Arc::new(RecordingSink::default());
        let key = format!("query={}", query_escape("INSERT INTO t FORMAT RowBinary"));
        let b = TableBatcher::spawn(&key, sink.clone(), 1000, 60_000);
        b.add("ab").await;
        b.add("cd").await;
        b.check_flush().await;

        let reqs = sink.requests().await;
        assert_eq!(reqs[0].content, "INSERT INTO t FORMAT RowBinary\nabcd");
        b.shutdown().await;
    }

    #[tokio::test]
    async fn count_threshold_flushes_under_lock() {
        let sink = Arc::new(RecordingSink::default());
        let key = format!("query={}", query_escape("INSERT INTO t (a) VALUES"));
        let b = TableBatcher::spawn(&key, sink.clone(), 3, 60_000);
        for i in 0..7 {
            b.add(&format!("({i})")).await;
        }
        assert_eq!(b.row_count().await, 1);
        let reqs = sink.requests().await;
        assert_eq!(reqs.len(), 2);
        assert!(reqs.iter().all(|r| r.count == 3));
        b.shutdown().await;
    }

    #[tokio::test]
    async fn ticker_flushes_on_interval() {
        let sink = Arc::new(RecordingSink::default());
        let key = format!("query={}", query_escape("INSERT INTO t (a) VALUES"));
        let b = TableBatcher::spawn(&key, sink.clone(), 1000, 20);
        b.add("(1)").await;

        let mut waited = 0;
        while !b.is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
            assert!(waited < 200, "ticker never flushed");
        }
        assert_eq!(sink.requests().await.len(), 1);
        b.shutdown().await;
    }
}
