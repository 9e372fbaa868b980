//! Aggregate sink: partitioned, non-overwriting object writes.
//!
//! Every closed window becomes one JSON object at
//! `output/<yyyy>/<mm>/<dd>/<hh>/<location>/<object>`. Backends implement
//! [`BlobSink`]; [`SinkWriter`] adds timeout, retry with backoff, collision
//! suffixing and dead-lettering on top.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;

use crate::aggregator::AggregateReceiver;
use crate::config::Config;
use crate::error::SinkError;
use crate::models::AggregateRecord;
use crate::stats::{FailedWrite, PipelineStats};

// ---

/// Object store collaborator.
///
/// Implementations must be `Send + Sync + 'static` so they can be shared
/// across sink worker tasks.
#[async_trait]
pub trait BlobSink: Send + Sync + 'static {
    /// Create a new object. Must fail with [`SinkError::AlreadyExists`]
    /// rather than replace an existing object at `path`.
    async fn put_new(&self, path: &str, body: Vec<u8>) -> Result<(), SinkError>;

    /// Read an object back, `None` if absent.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, SinkError>;
}

/// Replace characters that would break out of a single path segment.
fn sanitize_segment(raw: &str) -> String {
    // ---
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Deterministic object path for a record, derived from its EventTime and
/// location only.
pub fn partition_path(record: &AggregateRecord) -> String {
    // ---
    let t = record.event_time;
    format!(
        "output/{}/{}/{}_{}.json",
        t.format("%Y/%m/%d/%H"),
        sanitize_segment(&record.location),
        sanitize_segment(&record.source_id),
        t.format("%Y%m%dT%H%M%SZ"),
    )
}

/// `a/b/name.json` -> `a/b/name-<uuid>.json`
fn unique_variant(path: &str) -> String {
    // ---
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    match path.strip_suffix(".json") {
        Some(stem) => format!("{stem}-{suffix}.json"),
        None => format!("{path}-{suffix}"),
    }
}

// ---

/// Staging area under the sink root, outside every `output/` partition.
const STAGING_DIR: &str = ".staging";

/// A staging file that is removed when dropped, so an early return or a
/// cancelled put never leaves it behind.
struct StagingFile(PathBuf);

impl Drop for StagingFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Local filesystem backend rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileSystemSink {
    root: PathBuf,
}

impl FileSystemSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobSink for FileSystemSink {
    async fn put_new(&self, path: &str, body: Vec<u8>) -> Result<(), SinkError> {
        // ---
        let target = self.root.join(path);
        let parent = target
            .parent()
            .ok_or_else(|| SinkError::Backend(format!("object path has no parent: {path}")))?;
        tokio::fs::create_dir_all(parent).await?;
        let staging_dir = self.root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging_dir).await?;

        // Write aside, then hard-link into place: readers never see a partial
        // object and linking fails if the target exists.
        let staging = StagingFile(staging_dir.join(format!(
            "{}.tmp",
            uuid::Uuid::new_v4().simple()
        )));
        tokio::fs::write(&staging.0, &body).await?;
        let linked = tokio::fs::hard_link(&staging.0, &target).await;
        drop(staging);

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(SinkError::AlreadyExists(path.to_string()))
            }
            Err(e) => Err(SinkError::Io(e)),
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, SinkError> {
        match tokio::fs::read(self.root.join(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SinkError::Io(e)),
        }
    }
}

/// In-process backend, used for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<AggregateRecord> {
        self.objects
            .lock()
            .map(|g| {
                g.values()
                    .filter_map(|body| serde_json::from_slice(body).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobSink for MemorySink {
    async fn put_new(&self, path: &str, body: Vec<u8>) -> Result<(), SinkError> {
        let mut guard = self
            .objects
            .lock()
            .map_err(|_| SinkError::Backend("memory sink poisoned".into()))?;
        if guard.contains_key(path) {
            return Err(SinkError::AlreadyExists(path.to_string()));
        }
        guard.insert(path.to_string(), body);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, SinkError> {
        let guard = self
            .objects
            .lock()
            .map_err(|_| SinkError::Backend("memory sink poisoned".into()))?;
        Ok(guard.get(path).cloned())
    }
}

// ---

/// Result of writing one record, after all retries.
#[derive(Debug)]
pub enum WriteOutcome {
    Written { path: String, attempts: u32 },
    Failed { path: String, error: SinkError },
}

/// Distinct paths tried before giving up on collisions for one record.
const MAX_COLLISION_SUFFIXES: u32 = 8;

/// Aggregate queue shared by the sink workers, kept by the pipeline so it
/// can recover whatever is still queued when the workers are aborted.
pub type SharedAggregateReceiver = Arc<tokio::sync::Mutex<AggregateReceiver>>;

fn abandoned_write(record: AggregateRecord) -> FailedWrite {
    FailedWrite {
        path: partition_path(&record),
        error: "abandoned at drain timeout".to_string(),
        failed_at: Utc::now(),
        record,
    }
}

/// Dead-letters its record if dropped before the write finished, which is
/// what happens to a worker aborted at the drain timeout.
struct InFlight<'a> {
    stats: &'a PipelineStats,
    record: Option<AggregateRecord>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            tracing::warn!(source_id = %record.source_id, "in-flight aggregate write abandoned");
            self.stats.dead_letter(abandoned_write(record));
        }
    }
}

pub struct SinkWriter<S: BlobSink> {
    sink: Arc<S>,
    retry_count: u32,
    timeout: Duration,
    backoff: Duration,
    stats: Arc<PipelineStats>,
}

impl<S: BlobSink> SinkWriter<S> {
    pub fn new(
        sink: Arc<S>,
        retry_count: u32,
        timeout: Duration,
        backoff: Duration,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            sink,
            retry_count,
            timeout,
            backoff,
            stats,
        }
    }

    pub fn from_config(sink: Arc<S>, config: &Config, stats: Arc<PipelineStats>) -> Self {
        Self::new(
            sink,
            config.sink_retry_count,
            config.sink_write_timeout(),
            config.sink_backoff(),
            stats,
        )
    }

    async fn put_with_timeout(&self, path: &str, body: &[u8]) -> Result<(), SinkError> {
        match tokio::time::timeout(self.timeout, self.sink.put_new(path, body.to_vec())).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout {
                path: path.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    /// True when `path` already holds exactly `body`, i.e. an earlier
    /// timed-out attempt of this same write landed after all.
    async fn already_landed(&self, path: &str, body: &[u8]) -> bool {
        match tokio::time::timeout(self.timeout, self.sink.get(path)).await {
            Ok(Ok(Some(existing))) => existing == body,
            _ => false,
        }
    }

    /// Write one record. Transient failures are retried up to `retry_count`
    /// times with doubling backoff; a path collision moves to a suffixed path
    /// without consuming an attempt.
    pub async fn write(&self, record: &AggregateRecord) -> WriteOutcome {
        // ---
        let base = partition_path(record);
        let body = match serde_json::to_vec(record) {
            Ok(body) => body,
            Err(e) => {
                return WriteOutcome::Failed {
                    path: base,
                    error: SinkError::Serialize(e),
                }
            }
        };

        let mut path = base.clone();
        let mut attempts = 0u32;
        let mut collisions = 0u32;
        let mut last_timed_out = false;

        loop {
            attempts += 1;
            let error = match self.put_with_timeout(&path, &body).await {
                Ok(()) => return WriteOutcome::Written { path, attempts },
                Err(SinkError::AlreadyExists(_)) => {
                    if last_timed_out && self.already_landed(&path, &body).await {
                        tracing::debug!(%path, "earlier timed-out attempt had landed");
                        return WriteOutcome::Written { path, attempts };
                    }
                    collisions += 1;
                    if collisions > MAX_COLLISION_SUFFIXES {
                        return WriteOutcome::Failed {
                            error: SinkError::AlreadyExists(path.clone()),
                            path,
                        };
                    }
                    let next = unique_variant(&base);
                    tracing::warn!(%path, %next, "object path taken, writing under unique name");
                    path = next;
                    attempts -= 1;
                    last_timed_out = false;
                    continue;
                }
                Err(e) => e,
            };

            last_timed_out = matches!(error, SinkError::Timeout { .. });
            if attempts > self.retry_count {
                return WriteOutcome::Failed { path, error };
            }

            PipelineStats::incr(&self.stats.writes_retried);
            let delay = self.backoff.saturating_mul(1u32 << (attempts - 1).min(10));
            tracing::warn!(
                %path,
                attempt = attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "sink write failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Write and account for the outcome in stats; failures are dead-lettered.
    pub async fn write_and_record(&self, record: AggregateRecord) {
        // ---
        let mut in_flight = InFlight {
            stats: &self.stats,
            record: Some(record.clone()),
        };
        let outcome = self.write(&record).await;
        in_flight.record = None;

        match outcome {
            WriteOutcome::Written { path, attempts } => {
                PipelineStats::incr(&self.stats.writes_succeeded);
                tracing::debug!(%path, attempts, source_id = %record.source_id, "aggregate persisted");
            }
            WriteOutcome::Failed { path, error } => {
                tracing::error!(
                    %path,
                    error = %error,
                    record = %serde_json::to_string(&record).unwrap_or_default(),
                    "aggregate write failed after retries, queued for recovery"
                );
                self.stats.record_failed_write(FailedWrite {
                    path,
                    error: error.to_string(),
                    failed_at: Utc::now(),
                    record,
                });
            }
        }
        PipelineStats::decr(&self.stats.sink_queue_depth);
    }
}

/// Spawn `workers` tasks sharing one aggregate queue. Each exits once the
/// queue is closed and empty.
pub fn spawn_sink_workers<S: BlobSink>(
    workers: usize,
    rx: SharedAggregateReceiver,
    writer: Arc<SinkWriter<S>>,
) -> Vec<JoinHandle<()>> {
    // ---
    (0..workers.max(1))
        .map(|worker| {
            let rx = rx.clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    match next {
                        Some(record) => writer.write_and_record(record).await,
                        None => break,
                    }
                }
                tracing::debug!(worker, "sink worker finished");
            })
        })
        .collect()
}

/// Move every record still queued into the dead-letter list. Call only once
/// the workers are gone. Returns how many were moved.
pub async fn dead_letter_queued(rx: &SharedAggregateReceiver, stats: &PipelineStats) -> usize {
    // ---
    let mut rx = rx.lock().await;
    let mut moved = 0;
    while let Ok(record) = rx.try_recv() {
        stats.dead_letter(abandoned_write(record));
        moved += 1;
    }
    moved
}
