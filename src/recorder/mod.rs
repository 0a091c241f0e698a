//! Chunked media recording.
//!
//! Slices a continuous encoded capture stream into self-decodable chunks at
//! a fixed timeslice without stopping the underlying capture. Chunk 0
//! carries the container's initialization segment; every later chunk is
//! emitted with that header prepended so any consumer can decode it alone.

pub mod source;
pub mod webm;

pub use source::{list_input_devices, AudioDevice, CpalMicSource, MediaSource};

use crate::error::{VellumError, VellumResult};
use crate::logging::MetricsCollector;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A time-bounded slice of the recording, independently decodable.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub index: u32,
    pub data: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Idle,
    Recording,
    Paused,
    Recorded,
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Wall time between chunk emissions while unpaused.
    pub chunk_interval: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            chunk_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct Timing {
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    paused_at: Option<Instant>,
    total_paused: Duration,
}

struct Shared {
    chunk_count: AtomicU32,
    init_segment: Mutex<Option<Vec<u8>>>,
    full_recording: Mutex<Vec<u8>>,
    timing: Mutex<Timing>,
    metrics: MetricsCollector,
}

enum DriverCommand {
    /// Emit buffered bytes as a chunk right now (pre-pause flush).
    Flush { ack: oneshot::Sender<()> },
}

/// Chunked recorder over any [`MediaSource`].
///
/// State machine: `idle → recording` on start, `recording ↔ paused`,
/// `recording|paused → recorded` on stop, any state → `idle` on reset.
pub struct ChunkedRecorder {
    config: RecorderConfig,
    source: Box<dyn MediaSource>,
    chunk_tx: mpsc::Sender<AudioChunk>,
    state: Arc<Mutex<RecorderState>>,
    shared: Arc<Shared>,
    command_tx: Option<mpsc::UnboundedSender<DriverCommand>>,
    driver_handle: Option<JoinHandle<()>>,
}

impl ChunkedRecorder {
    pub fn new(
        source: Box<dyn MediaSource>,
        config: RecorderConfig,
        chunk_tx: mpsc::Sender<AudioChunk>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            config,
            source,
            chunk_tx,
            state: Arc::new(Mutex::new(RecorderState::Idle)),
            shared: Arc::new(Shared {
                chunk_count: AtomicU32::new(0),
                init_segment: Mutex::new(None),
                full_recording: Mutex::new(Vec::new()),
                timing: Mutex::new(Timing::default()),
                metrics,
            }),
            command_tx: None,
            driver_handle: None,
        }
    }

    pub fn state(&self) -> RecorderState {
        *self.state.lock().expect("recorder state mutex poisoned")
    }

    pub fn total_chunks(&self) -> u32 {
        self.shared.chunk_count.load(Ordering::SeqCst)
    }

    /// All bytes recorded so far, headed by the initialization segment.
    pub fn partial_blob(&self) -> Vec<u8> {
        self.shared
            .full_recording
            .lock()
            .expect("recording buffer mutex poisoned")
            .clone()
    }

    /// Recorded duration, excluding paused intervals.
    pub fn duration(&self) -> Duration {
        let timing = self.shared.timing.lock().expect("timing mutex poisoned");
        let Some(started_at) = timing.started_at else {
            return Duration::ZERO;
        };
        let end = timing.stopped_at.unwrap_or_else(Instant::now);
        let mut paused = timing.total_paused;
        if let Some(paused_at) = timing.paused_at {
            paused += end.saturating_duration_since(paused_at);
        }
        end.saturating_duration_since(started_at)
            .saturating_sub(paused)
    }

    /// Acquire the capture device and begin emitting chunks every
    /// `chunk_interval` of unpaused wall time.
    pub async fn start(&mut self) -> VellumResult<()> {
        if self.state() != RecorderState::Idle {
            return Err(VellumError::Recorder(
                "Recorder already started; reset first".to_string(),
            ));
        }

        let bytes_rx = self.source.start().await?;
        let mime_type = self.source.mime_type().to_string();

        self.shared.chunk_count.store(0, Ordering::SeqCst);
        *self.shared.init_segment.lock().expect("init segment mutex") = None;
        self.shared
            .full_recording
            .lock()
            .expect("recording buffer mutex")
            .clear();
        *self.shared.timing.lock().expect("timing mutex") = Timing {
            started_at: Some(Instant::now()),
            ..Timing::default()
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let driver = drive(
            bytes_rx,
            command_rx,
            self.chunk_tx.clone(),
            self.state.clone(),
            self.shared.clone(),
            self.config.chunk_interval,
            mime_type,
        );
        self.command_tx = Some(command_tx);
        self.driver_handle = Some(tokio::spawn(driver));

        *self.state.lock().expect("recorder state mutex") = RecorderState::Recording;
        self.shared.metrics.recording_session_started();
        tracing::info!(
            chunk_interval_ms = self.config.chunk_interval.as_millis() as u64,
            "Recording started"
        );
        Ok(())
    }

    /// Flush buffered audio as a chunk, then pause capture. The flush runs
    /// first so the buffered tail is uploadable even if the process dies
    /// during a long pause.
    pub async fn pause(&mut self) -> VellumResult<()> {
        if self.state() != RecorderState::Recording {
            return Err(VellumError::Recorder("Not recording".to_string()));
        }

        if let Some(command_tx) = &self.command_tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            if command_tx
                .send(DriverCommand::Flush { ack: ack_tx })
                .is_ok()
            {
                let _ = ack_rx.await;
            }
        }

        self.source.pause();
        let mut timing = self.shared.timing.lock().expect("timing mutex");
        timing.paused_at = Some(Instant::now());
        drop(timing);
        *self.state.lock().expect("recorder state mutex") = RecorderState::Paused;
        tracing::info!("Recording paused");
        Ok(())
    }

    pub async fn resume(&mut self) -> VellumResult<()> {
        if self.state() != RecorderState::Paused {
            return Err(VellumError::Recorder("Not paused".to_string()));
        }

        self.source.resume();
        let mut timing = self.shared.timing.lock().expect("timing mutex");
        if let Some(paused_at) = timing.paused_at.take() {
            timing.total_paused += paused_at.elapsed();
        }
        drop(timing);
        *self.state.lock().expect("recorder state mutex") = RecorderState::Recording;
        tracing::info!("Recording resumed");
        Ok(())
    }

    /// Stop capture. Resolves only after the terminal chunk has been handed
    /// to the consumer channel, so callers can rely on "all chunks
    /// dispatched". No explicit flush is issued here: the source's terminal
    /// byte delivery is authoritative, and a racing flush can drop it.
    pub async fn stop(&mut self) -> VellumResult<()> {
        let state = self.state();
        if state != RecorderState::Recording && state != RecorderState::Paused {
            return Err(VellumError::Recorder("Not recording".to_string()));
        }

        self.source.stop().await;
        if let Some(handle) = self.driver_handle.take() {
            let _ = handle.await;
        }
        self.command_tx = None;

        let mut timing = self.shared.timing.lock().expect("timing mutex");
        if let Some(paused_at) = timing.paused_at.take() {
            timing.total_paused += paused_at.elapsed();
        }
        timing.stopped_at = Some(Instant::now());
        drop(timing);

        *self.state.lock().expect("recorder state mutex") = RecorderState::Recorded;
        self.shared.metrics.recording_session_completed(self.duration());
        tracing::info!(
            chunks = self.total_chunks(),
            duration_ms = self.duration().as_millis() as u64,
            "Recording stopped"
        );
        Ok(())
    }

    /// Abandon the session from any state and release the device. Buffered
    /// bytes are discarded without a terminal emission. Idempotent.
    pub async fn reset(&mut self) {
        if let Some(handle) = self.driver_handle.take() {
            handle.abort();
        }
        self.command_tx = None;
        self.source.stop().await;

        self.shared.chunk_count.store(0, Ordering::SeqCst);
        *self.shared.init_segment.lock().expect("init segment mutex") = None;
        self.shared
            .full_recording
            .lock()
            .expect("recording buffer mutex")
            .clear();
        *self.shared.timing.lock().expect("timing mutex") = Timing::default();
        *self.state.lock().expect("recorder state mutex") = RecorderState::Idle;
        tracing::info!("Recorder reset");
    }
}

async fn drive(
    mut bytes_rx: mpsc::Receiver<Vec<u8>>,
    mut command_rx: mpsc::UnboundedReceiver<DriverCommand>,
    chunk_tx: mpsc::Sender<AudioChunk>,
    state: Arc<Mutex<RecorderState>>,
    shared: Arc<Shared>,
    chunk_interval: Duration,
    mime_type: String,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut commands_open = true;
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + chunk_interval, chunk_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe_bytes = bytes_rx.recv() => match maybe_bytes {
                Some(bytes) => {
                    shared
                        .full_recording
                        .lock()
                        .expect("recording buffer mutex poisoned")
                        .extend_from_slice(&bytes);
                    pending.extend_from_slice(&bytes);
                }
                // Source closed the byte channel: terminal delivery done
                None => break,
            },
            _ = ticker.tick() => {
                let recording =
                    *state.lock().expect("recorder state mutex poisoned") == RecorderState::Recording;
                if recording && !pending.is_empty() {
                    emit_chunk(&chunk_tx, &shared, &mut pending, &mime_type).await;
                }
            }
            command = command_rx.recv(), if commands_open => match command {
                Some(DriverCommand::Flush { ack }) => {
                    if !pending.is_empty() {
                        emit_chunk(&chunk_tx, &shared, &mut pending, &mime_type).await;
                    }
                    let _ = ack.send(());
                }
                None => commands_open = false,
            }
        }
    }

    // Terminal emission from the source's final delivery
    if !pending.is_empty() {
        emit_chunk(&chunk_tx, &shared, &mut pending, &mime_type).await;
    }
}

async fn emit_chunk(
    chunk_tx: &mpsc::Sender<AudioChunk>,
    shared: &Shared,
    pending: &mut Vec<u8>,
    mime_type: &str,
) {
    let raw = std::mem::take(pending);
    let index = shared.chunk_count.fetch_add(1, Ordering::SeqCst);

    let data = if index == 0 {
        let header = match webm::find_cluster_boundary(&raw) {
            Some(pos) => raw[..pos].to_vec(),
            None => {
                tracing::warn!(
                    chunk_len = raw.len(),
                    "No cluster boundary in first chunk; caching first 4KiB as header"
                );
                raw[..raw.len().min(webm::HEADER_FALLBACK_BYTES)].to_vec()
            }
        };
        *shared.init_segment.lock().expect("init segment mutex poisoned") = Some(header);
        raw
    } else {
        let header = shared
            .init_segment
            .lock()
            .expect("init segment mutex poisoned")
            .clone()
            .unwrap_or_default();
        let mut data = Vec::with_capacity(header.len() + raw.len());
        data.extend_from_slice(&header);
        data.extend_from_slice(&raw);
        data
    };

    shared.metrics.chunk_emitted();
    tracing::debug!(index, bytes = data.len(), "Chunk emitted");

    if chunk_tx
        .send(AudioChunk {
            index,
            data,
            mime_type: mime_type.to_string(),
        })
        .await
        .is_err()
    {
        tracing::warn!(index, "Chunk receiver dropped; chunk not delivered");
    }
}
