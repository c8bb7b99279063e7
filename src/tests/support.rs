use crate::upstream::{BatchRequest, BatchSink};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Sink that records every enqueued batch instead of sending it.
#[derive(Default)]
pub struct RecordingSink {
    requests: Mutex<Vec<BatchRequest>>,
}

impl RecordingSink {
    pub async fn requests(&self) -> Vec<BatchRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl BatchSink for RecordingSink {
    async fn enqueue(&self, req: BatchRequest) {
        self.requests.lock().await.push(req);
    }

    async fn wait_flush(&self) {}
}
