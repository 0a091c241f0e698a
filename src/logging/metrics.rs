use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pipeline-wide metrics collector
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    // Recording metrics
    recording_sessions_started: AtomicUsize,
    recording_sessions_completed: AtomicUsize,
    recording_sessions_failed: AtomicUsize,
    total_recording_duration_ms: AtomicU64,
    chunks_emitted: AtomicUsize,

    // Upload metrics
    chunks_uploaded: AtomicUsize,
    upload_retries: AtomicUsize,
    upload_failures: AtomicUsize,

    // Push stream metrics
    push_events_received: AtomicUsize,
    push_reconnects: AtomicUsize,
    stale_connections_detected: AtomicUsize,

    // LLM metrics
    llm_jobs_dispatched: AtomicUsize,
    llm_jobs_completed: AtomicUsize,
    llm_jobs_failed: AtomicUsize,
    llm_polls_issued: AtomicUsize,

    // Playback metrics
    tts_chunks_played: AtomicUsize,
    tts_chunk_errors: AtomicUsize,
}

/// Snapshot of current metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub recording_sessions_started: usize,
    pub recording_sessions_completed: usize,
    pub recording_sessions_failed: usize,
    pub avg_recording_duration_ms: f64,
    pub chunks_emitted: usize,

    pub chunks_uploaded: usize,
    pub upload_retries: usize,
    pub upload_failures: usize,

    pub push_events_received: usize,
    pub push_reconnects: usize,
    pub stale_connections_detected: usize,

    pub llm_jobs_dispatched: usize,
    pub llm_jobs_completed: usize,
    pub llm_jobs_failed: usize,
    pub llm_polls_issued: usize,

    pub tts_chunks_played: usize,
    pub tts_chunk_errors: usize,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn recording_session_started(&self) {
        self.inner
            .recording_sessions_started
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Recording session started");
    }

    pub fn recording_session_completed(&self, duration: Duration) {
        self.inner
            .recording_sessions_completed
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .total_recording_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        tracing::info!(
            duration_ms = duration.as_millis(),
            "Recording session completed"
        );
    }

    pub fn recording_session_failed(&self) {
        self.inner
            .recording_sessions_failed
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Recording session failed");
    }

    pub fn chunk_emitted(&self) {
        self.inner.chunks_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_uploaded(&self) {
        self.inner.chunks_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_retried(&self) {
        self.inner.upload_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_failed(&self) {
        self.inner.upload_failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Chunk upload exhausted retries");
    }

    pub fn push_event_received(&self) {
        self.inner
            .push_events_received
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_reconnected(&self) {
        self.inner.push_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_connection_detected(&self) {
        self.inner
            .stale_connections_detected
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Stale push connection detected");
    }

    pub fn llm_job_dispatched(&self) {
        self.inner
            .llm_jobs_dispatched
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn llm_job_completed(&self) {
        self.inner
            .llm_jobs_completed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn llm_job_failed(&self) {
        self.inner.llm_jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn llm_poll_issued(&self) {
        self.inner.llm_polls_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tts_chunk_played(&self) {
        self.inner.tts_chunks_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tts_chunk_error(&self) {
        self.inner.tts_chunk_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let sessions_completed = self
            .inner
            .recording_sessions_completed
            .load(Ordering::Relaxed);
        let total_duration_ms = self
            .inner
            .total_recording_duration_ms
            .load(Ordering::Relaxed);
        let avg_duration = if sessions_completed > 0 {
            total_duration_ms as f64 / sessions_completed as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            recording_sessions_started: self
                .inner
                .recording_sessions_started
                .load(Ordering::Relaxed),
            recording_sessions_completed: sessions_completed,
            recording_sessions_failed: self
                .inner
                .recording_sessions_failed
                .load(Ordering::Relaxed),
            avg_recording_duration_ms: avg_duration,
            chunks_emitted: self.inner.chunks_emitted.load(Ordering::Relaxed),
            chunks_uploaded: self.inner.chunks_uploaded.load(Ordering::Relaxed),
            upload_retries: self.inner.upload_retries.load(Ordering::Relaxed),
            upload_failures: self.inner.upload_failures.load(Ordering::Relaxed),
            push_events_received: self.inner.push_events_received.load(Ordering::Relaxed),
            push_reconnects: self.inner.push_reconnects.load(Ordering::Relaxed),
            stale_connections_detected: self
                .inner
                .stale_connections_detected
                .load(Ordering::Relaxed),
            llm_jobs_dispatched: self.inner.llm_jobs_dispatched.load(Ordering::Relaxed),
            llm_jobs_completed: self.inner.llm_jobs_completed.load(Ordering::Relaxed),
            llm_jobs_failed: self.inner.llm_jobs_failed.load(Ordering::Relaxed),
            llm_polls_issued: self.inner.llm_polls_issued.load(Ordering::Relaxed),
            tts_chunks_played: self.inner.tts_chunks_played.load(Ordering::Relaxed),
            tts_chunk_errors: self.inner.tts_chunk_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper for timing operations
pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for TimedOperation {
    fn default() -> Self {
        Self::new()
    }
}
