//! Streaming transcription orchestration.
//!
//! Sequences draft init → chunked upload with retry → finalize, and
//! reconciles locally emitted chunks with the push stream that delivers
//! transcribed text. The server's `content_update` payload is the
//! authoritative transcript; the local index-ordered assembly is a fallback
//! and the source of the reconnect resume hint.

pub mod transcript;
pub mod uploader;

pub use transcript::TranscriptAssembly;
pub use uploader::{ChunkUploader, UploadCounters, UploadOutcome, UploaderConfig};

use crate::api::{
    ApiClient, ContentUpdatePayload, InitStreamingRequest, InitStreamingResponse, NodeRecord,
    TranscriptChunkPayload, TranscriptionCompletePayload,
};
use crate::config::PipelineConfig;
use crate::error::{VellumError, VellumResult};
use crate::logging::MetricsCollector;
use crate::push::{EventStream, EventStreamConfig};
use crate::recorder::{ChunkedRecorder, MediaSource, RecorderConfig};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const EVENT_CHUNK_COMPLETE: &str = "chunk_complete";
pub const EVENT_CHUNK_ERROR: &str = "chunk_error";
pub const EVENT_CONTENT_UPDATE: &str = "content_update";
pub const EVENT_ALL_COMPLETE: &str = "all_complete";
pub const EVENT_STREAM_ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Initializing,
    Recording,
    Finalizing,
    Complete,
    Error,
}

/// Consumer-facing notifications. Strictly one-directional: the orchestrator
/// emits, the session controller consumes.
#[derive(Debug, Clone)]
pub enum TranscriptionEvent {
    StateChanged(SessionState),
    TranscriptUpdated { transcript: String },
    ChunkTranscribed { index: u64 },
    ChunkUploadFailed { index: u32, error: String },
    Completed {
        draft_id: i64,
        session_id: String,
        content: String,
    },
    Error { message: String },
}

/// Parameters for draft init.
#[derive(Debug, Clone, Default)]
pub struct TranscriberOptions {
    pub parent_id: Option<i64>,
    pub privacy_level: crate::api::PrivacyLevel,
    pub ai_usage: crate::api::AiUsage,
}

/// Factory producing a fresh capture source per recording session.
pub type SourceFactory = Box<dyn Fn() -> Box<dyn MediaSource> + Send + Sync>;

/// The streaming transcription orchestrator.
pub struct StreamingTranscriber {
    client: ApiClient,
    config: PipelineConfig,
    metrics: MetricsCollector,
    source_factory: SourceFactory,
    event_tx: mpsc::UnboundedSender<TranscriptionEvent>,
    state_tx: Arc<watch::Sender<SessionState>>,
    ids: Arc<Mutex<Option<InitStreamingResponse>>>,
    assembly: Arc<Mutex<TranscriptAssembly>>,
    counters: Arc<UploadCounters>,
    error_message: Arc<Mutex<Option<String>>>,
    last_duration: Arc<Mutex<Duration>>,
    recorder: Option<ChunkedRecorder>,
    stream: Option<EventStream>,
    uploader_handle: Option<JoinHandle<()>>,
    outcome_task: Option<JoinHandle<()>>,
}

impl StreamingTranscriber {
    pub fn new(
        client: ApiClient,
        config: PipelineConfig,
        source_factory: SourceFactory,
        metrics: MetricsCollector,
    ) -> (Self, mpsc::UnboundedReceiver<TranscriptionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Idle);

        let transcriber = Self {
            client,
            config,
            metrics,
            source_factory,
            event_tx,
            state_tx: Arc::new(state_tx),
            ids: Arc::new(Mutex::new(None)),
            assembly: Arc::new(Mutex::new(TranscriptAssembly::new())),
            counters: Arc::new(UploadCounters::default()),
            error_message: Arc::new(Mutex::new(None)),
            last_duration: Arc::new(Mutex::new(Duration::ZERO)),
            recorder: None,
            stream: None,
            uploader_handle: None,
            outcome_task: None,
        };
        (transcriber, event_rx)
    }

    // Observable state

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn transcript(&self) -> String {
        self.assembly.lock().expect("assembly mutex").current()
    }

    pub fn draft_id(&self) -> Option<i64> {
        self.ids.lock().expect("ids mutex").as_ref().map(|ids| ids.draft_id)
    }

    pub fn session_id(&self) -> Option<String> {
        self.ids
            .lock()
            .expect("ids mutex")
            .as_ref()
            .map(|ids| ids.session_id.clone())
    }

    pub fn uploaded_chunks(&self) -> u32 {
        self.counters.uploaded()
    }

    pub fn total_chunks_seen(&self) -> u32 {
        self.counters.total_seen()
    }

    pub fn transcribed_chunks(&self) -> usize {
        self.assembly.lock().expect("assembly mutex").transcribed_chunks()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message.lock().expect("error mutex").clone()
    }

    /// Recording duration, paused time excluded. Survives the end of the
    /// session until the next start.
    pub fn duration(&self) -> Duration {
        match &self.recorder {
            Some(recorder) => recorder.duration(),
            None => *self.last_duration.lock().expect("duration mutex"),
        }
    }

    fn set_state(&self, state: SessionState) {
        set_state(&self.state_tx, &self.event_tx, state);
    }

    fn fail(&self, message: String) {
        tracing::error!(%message, "Streaming session failed");
        *self.error_message.lock().expect("error mutex") = Some(message.clone());
        self.metrics.recording_session_failed();
        self.set_state(SessionState::Error);
        let _ = self.event_tx.send(TranscriptionEvent::Error { message });
    }

    /// Init the draft session, open the push stream, and start recording.
    pub async fn start_streaming(&mut self, options: TranscriberOptions) -> VellumResult<()> {
        if self.state() != SessionState::Idle {
            return Err(VellumError::Generic(
                "Streaming session already active".to_string(),
            ));
        }

        let correlation_id = Uuid::new_v4();
        tracing::info!(%correlation_id, "Initializing streaming session");

        self.set_state(SessionState::Initializing);
        *self.error_message.lock().expect("error mutex") = None;
        self.assembly.lock().expect("assembly mutex").clear();
        self.counters.reset();

        let init = match self
            .client
            .init_streaming(&InitStreamingRequest {
                parent_id: options.parent_id,
                privacy_level: options.privacy_level,
                ai_usage: options.ai_usage,
            })
            .await
        {
            Ok(init) => init,
            Err(e) => {
                self.fail(format!("Draft init failed: {}", e));
                return Err(e);
            }
        };
        tracing::info!(draft_id = init.draft_id, session_id = %init.session_id, "Draft session initialized");
        *self.ids.lock().expect("ids mutex") = Some(init.clone());

        // Push stream first, then the recorder: no transcript event can beat
        // its subscription. The URL resolver re-reads the highest received
        // chunk index at every reconnect, so resumed connections replay only
        // what was missed.
        let assembly_for_url = self.assembly.clone();
        let client_for_url = self.client.clone();
        let session_for_url = init.session_id.clone();
        let mut stream = EventStream::new(
            self.client.clone(),
            move || {
                let last_chunk = assembly_for_url
                    .lock()
                    .expect("assembly mutex poisoned")
                    .last_index();
                client_for_url.transcription_stream_url(&session_for_url, last_chunk)
            },
            EventStreamConfig {
                reconnect_delay: self.config.reconnect_delay,
                heartbeat_interval: self.config.heartbeat_interval,
                ..EventStreamConfig::default()
            },
            self.metrics.clone(),
        );
        self.register_stream_handlers(&stream, &init);
        stream.connect();
        self.stream = Some(stream);

        // Upload pipeline
        let (chunk_tx, chunk_rx) = mpsc::channel(32);
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        self.uploader_handle = Some(ChunkUploader::spawn(
            self.client.clone(),
            init.session_id.clone(),
            chunk_rx,
            UploaderConfig {
                timeout: self.config.upload_timeout,
                max_attempts: self.config.upload_max_attempts,
                backoff_base: self.config.upload_backoff_base,
            },
            self.counters.clone(),
            outcome_tx,
            self.metrics.clone(),
        ));

        let event_tx = self.event_tx.clone();
        self.outcome_task = Some(tokio::spawn(async move {
            while let Some(outcome) = outcome_rx.recv().await {
                if let UploadOutcome::Failed { index, error } = outcome {
                    // Surfaced, but the session keeps recording and uploading
                    let _ = event_tx.send(TranscriptionEvent::ChunkUploadFailed { index, error });
                }
            }
        }));

        // Recorder last: chunks start flowing into the queue immediately
        let mut recorder = ChunkedRecorder::new(
            (self.source_factory)(),
            RecorderConfig {
                chunk_interval: self.config.chunk_interval,
            },
            chunk_tx,
            self.metrics.clone(),
        );
        if let Err(e) = recorder.start().await {
            self.fail(format!("Recorder start failed: {}", e));
            self.teardown().await;
            return Err(e);
        }
        self.recorder = Some(recorder);

        self.set_state(SessionState::Recording);
        Ok(())
    }

    fn register_stream_handlers(&self, stream: &EventStream, init: &InitStreamingResponse) {
        let assembly = self.assembly.clone();
        let state_tx = self.state_tx.clone();
        let event_tx = self.event_tx.clone();
        let error_message = self.error_message.clone();

        {
            let assembly = assembly.clone();
            let event_tx = event_tx.clone();
            stream.on(EVENT_CHUNK_COMPLETE, move |value| {
                let payload: TranscriptChunkPayload = match serde_json::from_value(value) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Bad chunk_complete payload: {}", e);
                        return;
                    }
                };
                let mut assembly = assembly.lock().expect("assembly mutex poisoned");
                assembly.apply_chunk(payload.chunk_index, payload.text);
                let transcript = assembly.current();
                drop(assembly);
                let _ = event_tx.send(TranscriptionEvent::ChunkTranscribed {
                    index: payload.chunk_index,
                });
                let _ = event_tx.send(TranscriptionEvent::TranscriptUpdated { transcript });
            });
        }

        {
            let assembly = assembly.clone();
            let event_tx = event_tx.clone();
            stream.on(EVENT_CONTENT_UPDATE, move |value| {
                let payload: ContentUpdatePayload = match serde_json::from_value(value) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Bad content_update payload: {}", e);
                        return;
                    }
                };
                let mut assembly = assembly.lock().expect("assembly mutex poisoned");
                assembly.apply_content_update(payload.content);
                let transcript = assembly.current();
                drop(assembly);
                let _ = event_tx.send(TranscriptionEvent::TranscriptUpdated { transcript });
            });
        }

        {
            let assembly = assembly.clone();
            let state_tx = state_tx.clone();
            let event_tx = event_tx.clone();
            let draft_id = init.draft_id;
            let session_id = init.session_id.clone();
            stream.on(EVENT_ALL_COMPLETE, move |value| {
                let payload: TranscriptionCompletePayload = match serde_json::from_value(value) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Bad all_complete payload: {}", e);
                        return;
                    }
                };
                assembly
                    .lock()
                    .expect("assembly mutex poisoned")
                    .apply_complete(payload.content.clone());
                set_state(&state_tx, &event_tx, SessionState::Complete);
                let _ = event_tx.send(TranscriptionEvent::Completed {
                    draft_id,
                    session_id: session_id.clone(),
                    content: payload.content,
                });
            });
        }

        stream.on(EVENT_CHUNK_ERROR, |value| {
            tracing::warn!(payload = %value, "Server reported a chunk transcription error");
        });

        {
            let event_tx = event_tx.clone();
            stream.on(EVENT_STREAM_ERROR, move |value| {
                let message = value["error"]
                    .as_str()
                    .unwrap_or("transcription stream error")
                    .to_string();
                *error_message.lock().expect("error mutex poisoned") = Some(message.clone());
                set_state(&state_tx, &event_tx, SessionState::Error);
                let _ = event_tx.send(TranscriptionEvent::Error { message });
            });
        }
    }

    /// Pause capture. The recorder flushes buffered audio as a chunk first,
    /// so the tail is uploaded even if the session dies while paused.
    pub async fn pause_recording(&mut self) -> VellumResult<()> {
        match self.recorder.as_mut() {
            Some(recorder) => recorder.pause().await,
            None => Err(VellumError::Generic("No active recorder".to_string())),
        }
    }

    pub async fn resume_recording(&mut self) -> VellumResult<()> {
        match self.recorder.as_mut() {
            Some(recorder) => recorder.resume().await,
            None => Err(VellumError::Generic("No active recorder".to_string())),
        }
    }

    /// Stop recording, finalize the draft, and wait for the server's final
    /// transcript. Resolves once the session is complete.
    pub async fn stop_streaming(&mut self) -> VellumResult<()> {
        if self.state() != SessionState::Recording {
            return Err(VellumError::Generic("Not recording".to_string()));
        }

        let total_chunks = {
            let Some(recorder) = self.recorder.as_mut() else {
                return Err(VellumError::Generic("No active recorder".to_string()));
            };
            // After this await every chunk is in the upload queue
            recorder.stop().await?;
            let duration = recorder.duration();
            *self.last_duration.lock().expect("duration mutex") = duration;
            recorder.total_chunks()
        };
        self.set_state(SessionState::Finalizing);

        // Let the trailing upload clear the wire before finalize
        tokio::time::sleep(self.config.settle_delay).await;

        let session_id = self
            .session_id()
            .ok_or_else(|| VellumError::Generic("No session id".to_string()))?;
        if let Err(e) = self
            .client
            .finalize_streaming(&session_id, total_chunks)
            .await
        {
            self.fail(format!("Finalize failed: {}", e));
            return Err(e);
        }
        tracing::info!(total_chunks, "Finalize sent; awaiting final transcript");

        // Remain in finalizing until the push stream delivers all_complete
        let mut state_rx = self.state_tx.subscribe();
        loop {
            match *state_rx.borrow_and_update() {
                SessionState::Complete => break,
                SessionState::Error => {
                    return Err(VellumError::Generic(
                        self.error_message()
                            .unwrap_or_else(|| "transcription failed".to_string()),
                    ));
                }
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Abandon the session: drop the push stream, reset the recorder, and
    /// return to idle. Uploads already on the wire are left to finish
    /// server-side. Idempotent.
    pub async fn cancel_streaming(&mut self) {
        tracing::info!("Cancelling streaming session");
        if let Some(mut recorder) = self.recorder.take() {
            recorder.reset().await;
        }
        self.teardown().await;
        self.assembly.lock().expect("assembly mutex").clear();
        self.counters.reset();
        *self.ids.lock().expect("ids mutex") = None;
        *self.error_message.lock().expect("error mutex") = None;
        *self.last_duration.lock().expect("duration mutex") = Duration::ZERO;
        self.set_state(SessionState::Idle);
    }

    /// Promote the completed draft to a permanent node, with the user's
    /// edits if any.
    pub async fn save_as_node(&self, edited_content: Option<String>) -> VellumResult<NodeRecord> {
        if self.state() != SessionState::Complete {
            return Err(VellumError::Generic(
                "No completed draft to save".to_string(),
            ));
        }
        let session_id = self
            .session_id()
            .ok_or_else(|| VellumError::Generic("No session id".to_string()))?;
        let content = edited_content.unwrap_or_else(|| self.transcript());

        let node = self.client.save_as_node(&session_id, &content).await?;
        tracing::info!(node_id = node.id, "Draft saved as node");
        Ok(node)
    }

    async fn teardown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.disconnect();
        }
        // Dropping the recorder closes the chunk channel; the uploader
        // drains whatever is in flight and exits on its own
        self.recorder = None;
        if let Some(task) = self.outcome_task.take() {
            // Leave it to finish with the uploader; abort only if detached
            task.abort();
        }
        self.uploader_handle = None;
    }
}

fn set_state(
    state_tx: &watch::Sender<SessionState>,
    event_tx: &mpsc::UnboundedSender<TranscriptionEvent>,
    state: SessionState,
) {
    let changed = state_tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    });
    if changed {
        tracing::debug!(?state, "Session state changed");
        let _ = event_tx.send(TranscriptionEvent::StateChanged(state));
    }
}
