//! Recording upload and the persistent retry queue.
//!
//! Finalized recordings POST to `{base_url}/recordings`. A failed
//! upload is not lost: the document lands in an on-disk queue (one JSON
//! file per item, named so lexicographic order is age order) and a
//! periodic sweep retries it until the per-item attempt budget runs
//! out. The queue is size-capped with oldest-first eviction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use flexrig_types::Recording;

use crate::config::SinkConfig;
use crate::error::{Error, Result};
use crate::transport::unix_ms;

/// Destination for finalized recordings.
#[async_trait]
pub trait RecordingSink: Send + Sync {
    /// Deliver one recording. An error means the caller should queue it.
    async fn upload(&self, recording: &Recording) -> Result<()>;
}

/// HTTP sink posting JSON recordings.
pub struct HttpRecordingSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRecordingSink {
    /// Create a sink for the given service base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RecordingSink for HttpRecordingSink {
    async fn upload(&self, recording: &Recording) -> Result<()> {
        let url = format!("{}/recordings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(recording)
            .send()
            .await
            .map_err(|e| Error::Persistence(format!("POST {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Persistence(format!(
                "POST {url}: status {}",
                response.status()
            )));
        }
        debug!(recording_id = %recording.recording_id, "recording uploaded");
        Ok(())
    }
}

/// One queued upload on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRecording {
    /// The recording document.
    pub data: Recording,
    /// Unix ms when the item first entered the queue.
    pub first_enqueued_at: u64,
    /// Upload attempts made from the queue.
    pub retry_count: u32,
}

/// On-disk retry queue for failed uploads.
pub struct PersistentQueue {
    dir: PathBuf,
    max_retries: u32,
    max_queue_size: usize,
}

impl PersistentQueue {
    /// Open (and create if needed) a queue directory.
    pub fn open(dir: impl Into<PathBuf>, max_retries: u32, max_queue_size: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_retries,
            max_queue_size,
        })
    }

    /// Add a recording to the queue, evicting the oldest items when the
    /// size cap is exceeded.
    pub fn enqueue(&self, recording: &Recording) -> Result<()> {
        let item = QueuedRecording {
            data: recording.clone(),
            first_enqueued_at: unix_ms(),
            retry_count: 0,
        };
        let path = self.item_path(item.first_enqueued_at, recording);
        self.write_item(&path, &item)?;
        info!(recording_id = %recording.recording_id, path = %path.display(), "recording queued");

        let mut paths = self.item_paths()?;
        while paths.len() > self.max_queue_size {
            let oldest = paths.remove(0);
            warn!(path = %oldest.display(), "evicting oldest queued recording");
            let _ = std::fs::remove_file(oldest);
        }
        Ok(())
    }

    /// Number of items currently queued.
    pub fn len(&self) -> Result<usize> {
        Ok(self.item_paths()?.len())
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Retry every queued item against the sink, oldest first.
    ///
    /// Returns `(uploaded, remaining)`. Items that exceed the attempt
    /// budget are dropped with a warning; unreadable files are removed
    /// rather than wedging the queue forever.
    pub async fn retry_sweep(&self, sink: &dyn RecordingSink) -> Result<(usize, usize)> {
        let mut uploaded = 0;
        for path in self.item_paths()? {
            let mut item = match self.read_item(&path) {
                Ok(item) => item,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "dropping unreadable queue item");
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
            };

            match sink.upload(&item.data).await {
                Ok(()) => {
                    uploaded += 1;
                    let _ = std::fs::remove_file(&path);
                }
                Err(e) => {
                    item.retry_count += 1;
                    if item.retry_count >= self.max_retries {
                        warn!(
                            recording_id = %item.data.recording_id,
                            retries = item.retry_count,
                            "retry budget exhausted, dropping recording"
                        );
                        let _ = std::fs::remove_file(&path);
                    } else {
                        debug!(
                            recording_id = %item.data.recording_id,
                            retries = item.retry_count,
                            error = %e,
                            "upload retry failed"
                        );
                        self.write_item(&path, &item)?;
                    }
                }
            }
        }
        Ok((uploaded, self.len()?))
    }

    fn item_path(&self, enqueued_at: u64, recording: &Recording) -> PathBuf {
        // Zero-padded timestamp prefix keeps lexicographic order equal
        // to age order.
        self.dir
            .join(format!("{enqueued_at:020}-{}.json", recording.recording_id))
    }

    fn item_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn read_item(&self, path: &Path) -> Result<QueuedRecording> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| Error::Persistence(e.to_string()))
    }

    fn write_item(&self, path: &Path, item: &QueuedRecording) -> Result<()> {
        let content =
            serde_json::to_string(item).map_err(|e| Error::Persistence(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Upload path with queue fallback and a periodic retry task.
pub struct UploadPipeline {
    sink: Arc<dyn RecordingSink>,
    queue: Arc<PersistentQueue>,
    retry_interval: Duration,
    retry_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl UploadPipeline {
    /// Build the pipeline from sink configuration.
    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(HttpRecordingSink::new(config.base_url.clone())),
            Arc::new(PersistentQueue::open(
                &config.queue_dir,
                config.max_retries,
                config.max_queue_size,
            )?),
            Duration::from_secs(config.retry_interval_secs),
        ))
    }

    /// Build a pipeline over an arbitrary sink (tests inject mocks).
    pub fn new(
        sink: Arc<dyn RecordingSink>,
        queue: Arc<PersistentQueue>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            sink,
            queue,
            retry_interval,
            retry_task: std::sync::Mutex::new(None),
        }
    }

    /// The underlying queue.
    pub fn queue(&self) -> &Arc<PersistentQueue> {
        &self.queue
    }

    /// Deliver a recording, falling back to the queue on failure.
    pub async fn submit(&self, recording: Recording) -> Result<()> {
        match self.sink.upload(&recording).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    recording_id = %recording.recording_id,
                    error = %e,
                    "upload failed, queuing for retry"
                );
                self.queue.enqueue(&recording)
            }
        }
    }

    /// Start the periodic retry sweep. Replaces a previous task.
    pub fn start_retry_task(&self) {
        self.stop_retry_task();
        let sink = Arc::clone(&self.sink);
        let queue = Arc::clone(&self.queue);
        let interval = self.retry_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would re-upload alongside the
            // submit path; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.retry_sweep(sink.as_ref()).await {
                    Ok((0, 0)) => {}
                    Ok((uploaded, remaining)) => {
                        info!(uploaded, remaining, "retry sweep finished");
                    }
                    Err(e) => warn!(error = %e, "retry sweep failed"),
                }
            }
        });
        *self
            .retry_task
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Stop the periodic retry sweep.
    pub fn stop_retry_task(&self) {
        if let Some(handle) = self
            .retry_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for UploadPipeline {
    fn drop(&mut self) {
        self.stop_retry_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Sink that fails the first `failures` uploads.
    struct FlakySink {
        failures: AtomicU32,
        uploads: AtomicU32,
    }

    impl FlakySink {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                uploads: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RecordingSink for FlakySink {
        async fn upload(&self, _recording: &Recording) -> Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Persistence("simulated failure".into()));
            }
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn recording(n: u32) -> Recording {
        Recording {
            recording_id: Uuid::new_v4(),
            session_id: format!("session-{n}"),
            exercise_id: "squat".into(),
            set_number: n,
            start_time: 1_000,
            duration_ms: 500,
            joints: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_submit_uploads_directly_when_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlakySink::new(0);
        let queue = Arc::new(PersistentQueue::open(dir.path(), 5, 10).unwrap());
        let pipeline = UploadPipeline::new(
            Arc::clone(&sink) as Arc<dyn RecordingSink>,
            queue,
            Duration::from_secs(60),
        );

        pipeline.submit(recording(1)).await.unwrap();
        assert_eq!(sink.uploads.load(Ordering::SeqCst), 1);
        assert!(pipeline.queue().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_failed_upload_lands_in_queue() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlakySink::new(1);
        let queue = Arc::new(PersistentQueue::open(dir.path(), 5, 10).unwrap());
        let pipeline = UploadPipeline::new(
            Arc::clone(&sink) as Arc<dyn RecordingSink>,
            queue,
            Duration::from_secs(60),
        );

        pipeline.submit(recording(1)).await.unwrap();
        assert_eq!(pipeline.queue().len().unwrap(), 1);

        // The next sweep drains it.
        let (uploaded, remaining) = pipeline
            .queue()
            .retry_sweep(sink.as_ref())
            .await
            .unwrap();
        assert_eq!(uploaded, 1);
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_retry_budget_drops_item() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlakySink::new(u32::MAX);
        let queue = PersistentQueue::open(dir.path(), 3, 10).unwrap();
        queue.enqueue(&recording(1)).unwrap();

        for _ in 0..2 {
            let (uploaded, remaining) = queue.retry_sweep(sink.as_ref()).await.unwrap();
            assert_eq!(uploaded, 0);
            assert_eq!(remaining, 1);
        }
        // Third failed attempt exhausts the budget.
        let (_, remaining) = queue.retry_sweep(sink.as_ref()).await.unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_queue_evicts_oldest_beyond_cap() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PersistentQueue::open(dir.path(), 5, 3).unwrap();
        for n in 0..5 {
            queue.enqueue(&recording(n)).unwrap();
        }
        assert_eq!(queue.len().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_queue_items_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = PersistentQueue::open(dir.path(), 5, 10).unwrap();
            queue.enqueue(&recording(7)).unwrap();
        }
        let queue = PersistentQueue::open(dir.path(), 5, 10).unwrap();
        assert_eq!(queue.len().unwrap(), 1);

        let sink = FlakySink::new(0);
        let (uploaded, _) = queue.retry_sweep(sink.as_ref()).await.unwrap();
        assert_eq!(uploaded, 1);
    }

    #[tokio::test]
    async fn test_corrupt_queue_file_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PersistentQueue::open(dir.path(), 5, 10).unwrap();
        std::fs::write(dir.path().join("00000000000000000001-bad.json"), "not json").unwrap();

        let sink = FlakySink::new(0);
        let (uploaded, remaining) = queue.retry_sweep(sink.as_ref()).await.unwrap();
        assert_eq!(uploaded, 0);
        assert_eq!(remaining, 0);
    }
}
