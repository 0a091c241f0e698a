use crate::api::ApiClient;
use crate::logging::MetricsCollector;
use crate::recorder::AudioChunk;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub timeout: Duration,
    /// Attempts per chunk (first try + retries).
    pub max_attempts: u32,
    /// Base for exponential backoff between attempts.
    pub backoff_base: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Shared upload counters observable by the orchestrator.
#[derive(Debug, Default)]
pub struct UploadCounters {
    uploaded: AtomicU32,
    total_seen: AtomicU32,
}

impl UploadCounters {
    pub fn uploaded(&self) -> u32 {
        self.uploaded.load(Ordering::SeqCst)
    }

    pub fn total_seen(&self) -> u32 {
        self.total_seen.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.uploaded.store(0, Ordering::SeqCst);
        self.total_seen.store(0, Ordering::SeqCst);
    }

    fn note_seen(&self, index: u32) {
        self.total_seen.fetch_max(index + 1, Ordering::SeqCst);
    }
}

/// Terminal outcome of one chunk's upload.
#[derive(Debug)]
pub enum UploadOutcome {
    Uploaded { index: u32 },
    Failed { index: u32, error: String },
}

/// Consumes recorder chunks and uploads each with bounded retries. Uploads
/// are dispatched in emission order but run concurrently, so completions may
/// interleave; the server reassembles by index. A chunk that exhausts its
/// retries is reported and skipped: the session keeps going.
pub struct ChunkUploader;

impl ChunkUploader {
    pub fn spawn(
        client: ApiClient,
        session_id: String,
        mut chunk_rx: mpsc::Receiver<AudioChunk>,
        config: UploaderConfig,
        counters: Arc<UploadCounters>,
        outcome_tx: mpsc::UnboundedSender<UploadOutcome>,
        metrics: MetricsCollector,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut in_flight = tokio::task::JoinSet::new();

            while let Some(chunk) = chunk_rx.recv().await {
                counters.note_seen(chunk.index);

                let client = client.clone();
                let session_id = session_id.clone();
                let config = config.clone();
                let counters = counters.clone();
                let outcome_tx = outcome_tx.clone();
                let metrics = metrics.clone();

                in_flight.spawn(async move {
                    let index = chunk.index;
                    match upload_with_retry(&client, &session_id, chunk, &config, &metrics).await
                    {
                        Ok(()) => {
                            counters.uploaded.fetch_add(1, Ordering::SeqCst);
                            let _ = outcome_tx.send(UploadOutcome::Uploaded { index });
                        }
                        Err(error) => {
                            let _ = outcome_tx.send(UploadOutcome::Failed { index, error });
                        }
                    }
                });
            }

            // Chunk channel closed: drain the stragglers before exiting
            while in_flight.join_next().await.is_some() {}
            tracing::debug!("Uploader drained; exiting");
        })
    }
}

async fn upload_with_retry(
    client: &ApiClient,
    session_id: &str,
    chunk: AudioChunk,
    config: &UploaderConfig,
    metrics: &MetricsCollector,
) -> Result<(), String> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match client
            .upload_chunk(
                session_id,
                chunk.index,
                chunk.data.clone(),
                &chunk.mime_type,
                config.timeout,
            )
            .await
        {
            Ok(()) => {
                tracing::debug!(index = chunk.index, attempt, "Chunk uploaded");
                return Ok(());
            }
            Err(e) if attempt < config.max_attempts => {
                let delay = config.backoff_base * 2u32.pow(attempt - 1);
                metrics.upload_retried();
                tracing::warn!(
                    index = chunk.index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Chunk upload failed; retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                metrics.upload_failed();
                tracing::error!(
                    index = chunk.index,
                    attempts = attempt,
                    "Chunk upload exhausted retries: {}",
                    e
                );
                return Err(e.to_string());
            }
        }
    }
}
