use crate::dump::store::DumpStore;
use crate::error::AppError;
use crate::upstream::QuerySender;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_CHECK_INTERVAL_S: u64 = 30;

impl DumpStore {
    /// Spawn the background replayer. Each tick drains the spool until
    /// `NoDumps` or the first error (a failing upstream keeps files on disk
    /// for the next tick). A negative interval disables replay entirely.
    pub fn listen(
        self: &Arc<Self>,
        sender: Arc<dyn QuerySender>,
        interval_s: i64,
        shutdown: CancellationToken,
    ) {
        if interval_s < 0 {
            info!("dump replay disabled");
            return;
        }
        let period = Duration::from_secs(if interval_s == 0 {
            DEFAULT_CHECK_INTERVAL_S
        } else {
            interval_s as u64
        });

        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => store.drain_once(sender.as_ref()).await,
                }
            }
        });
    }

    async fn drain_once(&self, sender: &dyn QuerySender) {
        loop {
            match self.process_next_dump(sender).await {
                Ok(()) => continue,
                Err(AppError::NoDumps) => return,
                Err(e) => {
                    warn!(error = %e, "dump replay stopped for this tick");
                    return;
                }
            }
        }
    }
}
