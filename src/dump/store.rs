use crate::error::{AppError, AppResult};
use crate::metrics::AppMetrics;
use crate::parse::has_prefix_fold;
use crate::upstream::{BatchRequest, QuerySender};

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::info;

/// Retryable failure class: transport error, >= 502, or no servers left.
pub const DUMP_PREFIX_SERVER: &str = "1";
/// Upstream rejected the query (4xx below 502).
pub const DUMP_PREFIX_REJECT: &str = "2";

pub const DUMP_EXTENSION: &str = ".dmp";

const RESPONSE_MARKER: &str = "\n### RESPONSE ###\n";

/// Durable overflow for batches that could not be delivered.
///
/// Files are named `dump<run stamp><prefix>-<seq>-<status>.dmp` so a plain
/// lexicographic sort replays older runs first. The run stamp is captured
/// once per process. A file whose delete failed is quarantined in memory for
/// the rest of the process lifetime so the replayer cannot spin on it.
pub struct DumpStore {
    dir: PathBuf,
    run_stamp: String,
    seq: AtomicU64,
    // one guard across dump/list/replay; doubles as the quarantine set
    locked: Mutex<HashSet<String>>,
    metrics: Arc<AppMetrics>,
}

impl DumpStore {
    pub fn new(dir: impl Into<PathBuf>, metrics: Arc<AppMetrics>) -> Self {
        Self {
            dir: dir.into(),
            run_stamp: chrono::Local::now().format("%Y%m%d%H%M%S").to_string(),
            seq: AtomicU64::new(0),
            locked: Mutex::new(HashSet::new()),
            metrics,
        }
    }

    /// Spool one undeliverable batch to disk.
    pub async fn dump(
        &self,
        params: &str,
        content: &str,
        response: &str,
        prefix: &str,
        status: u16,
    ) -> AppResult<()> {
        let _guard = self.locked.lock().await;
        self.ensure_dir()?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!(
            "dump{}{}-{}-{}{}",
            self.run_stamp, prefix, seq, status, DUMP_EXTENSION
        );

        let mut data = format!("{params}\n{content}");
        if !response.is_empty() {
            data.push_str(RESPONSE_MARKER);
            data.push_str(response);
        }

        let path = self.dir.join(&name);
        fs::write(&path, data).map_err(AppError::DumpWrite)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644))
                .map_err(AppError::DumpWrite)?;
        }

        self.metrics.inc_dumped();
        self.metrics.set_queued_dumps(self.list_dumps()?.len() as i64);
        info!(file = %name, status, "batch spooled to disk");
        Ok(())
    }

    /// Replay the oldest unlocked dump through `sender`. The file is deleted
    /// only when the send succeeds; a failed delete quarantines it.
    pub async fn process_next_dump(&self, sender: &dyn QuerySender) -> AppResult<()> {
        let mut locked = self.locked.lock().await;

        let names = self.list_dumps()?;
        self.metrics.set_queued_dumps(names.len() as i64);
        let Some(name) = names.into_iter().find(|n| !locked.contains(n)) else {
            return Err(AppError::NoDumps);
        };

        let path = self.dir.join(&name);
        let data = fs::read_to_string(&path).map_err(AppError::DumpRead)?;
        let payload = match data.find(RESPONSE_MARKER) {
            Some(i) => &data[..i],
            None => &data[..],
        };
        let req = rebuild_request(payload);

        info!(file = %name, "replaying dump");
        sender.send_query(&req).await?;

        fs::remove_file(&path).map_err(|e| {
            locked.insert(name.clone());
            AppError::DumpDelete(e)
        })?;
        info!(file = %name, "dump replayed and removed");
        Ok(())
    }

    fn ensure_dir(&self) -> AppResult<()> {
        if self.dir.exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(AppError::DumpWrite)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o777))
                .map_err(AppError::DumpWrite)?;
        }
        Ok(())
    }

    /// All `.dmp` names, lexicographically sorted (oldest run stamp first).
    fn list_dumps(&self) -> AppResult<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::DumpRead(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(AppError::DumpRead)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(DUMP_EXTENSION) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Reconstruct a request from the spooled payload. Files written by this
/// process start with the params line; a bare statement (hand-dropped file)
/// is taken as the whole body.
fn rebuild_request(payload: &str) -> BatchRequest {
    let mut split = payload.splitn(2, '\n');
    let first = split.next().unwrap_or("");

    if has_prefix_fold(first, "insert") {
        return BatchRequest {
            params: String::new(),
            query: String::new(),
            content: payload.to_string(),
            count: 0,
            is_insert: true,
        };
    }

    let rest = split.next().unwrap_or("");
    let query = rest.lines().next().unwrap_or("").to_string();
    let is_insert = has_prefix_fold(&query, "insert");
    BatchRequest {
        params: first.to_string(),
        query,
        content: rest.to_string(),
        count: 0,
        is_insert,
    }
}
