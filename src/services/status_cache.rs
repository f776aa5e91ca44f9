use crate::errors::HostError;
use crate::services::logger::Logger;
use crate::utils::fs_atomic::{atomic_replace, backup_path};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

const STATUS_FILE_MODE: u32 = 0o600;

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl StatusEntry {
    pub fn reachable(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            success: true,
            latency_ms: Some(latency_ms),
            message: message.into(),
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn unreachable(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            latency_ms: None,
            message: "Connection failed".to_string(),
            error: Some(error),
            updated_at: Utc::now(),
        }
    }
}

type StatusMap = BTreeMap<String, StatusEntry>;

enum WriteRequest {
    Write(StatusMap),
    Flush(oneshot::Sender<()>),
}

struct StatusCacheInner {
    path: PathBuf,
    entries: RwLock<StatusMap>,
    queue: mpsc::UnboundedSender<WriteRequest>,
    write_failures: Arc<AtomicU64>,
    last_failure: Arc<Mutex<Option<HostError>>>,
}

/// Durable per-host reachability record.
///
/// The in-memory map is authoritative. Every `update` enqueues a full
/// snapshot for a single writer thread, which replaces the file atomically;
/// writes never overlap and the last one always carries the latest update.
/// Persistence failures are logged and counted, never returned.
#[derive(Clone)]
pub struct StatusCache {
    inner: Arc<StatusCacheInner>,
    logger: Logger,
}

impl StatusCache {
    pub fn open(path: impl Into<PathBuf>, logger: Logger) -> Self {
        let path = path.into();
        let logger = logger.child("status");
        let entries = load_entries(&path, &logger);
        let (queue, requests) = mpsc::unbounded_channel();
        let write_failures = Arc::new(AtomicU64::new(0));
        let last_failure = Arc::new(Mutex::new(None));
        spawn_writer(
            path.clone(),
            requests,
            write_failures.clone(),
            last_failure.clone(),
            logger.clone(),
        );
        Self {
            inner: Arc::new(StatusCacheInner {
                path,
                entries: RwLock::new(entries),
                queue,
                write_failures,
                last_failure,
            }),
            logger,
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Replaces the entry for `host_id` (stamped now) and schedules a write.
    pub fn update(&self, host_id: &str, mut entry: StatusEntry) {
        entry.updated_at = Utc::now();
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(|err| err.into_inner());
        entries.insert(host_id.to_string(), entry);
        // Enqueued under the lock so queue order matches update order.
        if self
            .inner
            .queue
            .send(WriteRequest::Write(entries.clone()))
            .is_err()
        {
            self.logger.warn(
                "Status writer is gone, update kept in memory only",
                Some(&serde_json::json!({ "host": host_id })),
            );
        }
    }

    pub fn get(&self, host_id: &str) -> Option<StatusEntry> {
        self.read_entries().get(host_id).cloned()
    }

    pub fn all(&self) -> StatusMap {
        self.read_entries().clone()
    }

    pub fn write_failures(&self) -> u64 {
        self.inner.write_failures.load(Ordering::SeqCst)
    }

    /// The most recent write error, kept for diagnostics.
    pub fn last_failure(&self) -> Option<HostError> {
        self.inner
            .last_failure
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Resolves once every write enqueued before this call has finished.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.inner.queue.send(WriteRequest::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, StatusMap> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|err| err.into_inner())
    }
}

fn spawn_writer(
    path: PathBuf,
    mut requests: mpsc::UnboundedReceiver<WriteRequest>,
    failures: Arc<AtomicU64>,
    last_failure: Arc<Mutex<Option<HostError>>>,
    logger: Logger,
) {
    std::thread::spawn(move || {
        while let Some(request) = requests.blocking_recv() {
            let mut pending = match request {
                WriteRequest::Write(snapshot) => Some(snapshot),
                WriteRequest::Flush(ack) => {
                    let _ = ack.send(());
                    continue;
                }
            };
            let mut acks = Vec::new();
            // Only the newest queued snapshot needs to reach disk.
            while let Ok(next) = requests.try_recv() {
                match next {
                    WriteRequest::Write(snapshot) => pending = Some(snapshot),
                    WriteRequest::Flush(ack) => acks.push(ack),
                }
            }
            if let Some(snapshot) = pending.take() {
                if let Err(err) = write_snapshot(&path, &snapshot) {
                    failures.fetch_add(1, Ordering::SeqCst);
                    logger.warn(
                        "Failed to persist status cache",
                        Some(&serde_json::json!({
                            "code": err.code,
                            "error": err.message,
                        })),
                    );
                    *last_failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err);
                }
            }
            for ack in acks {
                let _ = ack.send(());
            }
        }
    });
}

fn write_snapshot(path: &Path, snapshot: &StatusMap) -> Result<(), HostError> {
    let mut body =
        serde_json::to_vec_pretty(snapshot).map_err(|err| persistence_error(path, err))?;
    body.push(b'\n');
    atomic_replace(path, &body, STATUS_FILE_MODE).map_err(|err| persistence_error(path, err))?;
    Ok(())
}

fn persistence_error(path: &Path, err: impl std::fmt::Display) -> HostError {
    HostError::persistence(format!(
        "Failed to write status cache {}: {}",
        path.display(),
        err
    ))
}

enum Parsed {
    Entries(StatusMap),
    Unusable,
}

fn parse_document(raw: &str) -> Parsed {
    if raw.trim().is_empty() {
        return Parsed::Unusable;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Parsed::Entries(
            map.into_iter()
                .filter_map(|(host, value)| {
                    serde_json::from_value::<StatusEntry>(value)
                        .ok()
                        .map(|entry| (host, entry))
                })
                .collect(),
        ),
        // Valid JSON that is not an object reads as an empty cache.
        Ok(_) => Parsed::Entries(StatusMap::new()),
        Err(_) => Parsed::Unusable,
    }
}

fn load_entries(path: &Path, logger: &Logger) -> StatusMap {
    if let Ok(raw) = std::fs::read_to_string(path) {
        if let Parsed::Entries(entries) = parse_document(&raw) {
            return entries;
        }
    }
    let backup = backup_path(path);
    match std::fs::read_to_string(&backup).map(|raw| parse_document(&raw)) {
        Ok(Parsed::Entries(entries)) => {
            logger.warn(
                "Status cache recovered from backup",
                Some(&serde_json::json!({
                    "path": path.display().to_string(),
                    "backup": backup.display().to_string(),
                    "hosts": entries.len(),
                })),
            );
            entries
        }
        _ => StatusMap::new(),
    }
}
