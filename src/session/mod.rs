//! Voice conversation session control.
//!
//! Composes the recorder-backed transcription orchestrator, the LLM
//! dispatcher, the streaming TTS player, and the media-session bridge into
//! the four-phase conversational loop: ready → recording → processing →
//! playback, then back to ready or straight into the next recording.
//!
//! Message flow is one-directional: the components emit events, the
//! controller consumes them and issues commands. Nothing downstream calls
//! back into the controller.

use crate::api::{ApiClient, Workflow};
use crate::config::PipelineConfig;
use crate::logging::MetricsCollector;
use crate::media::{MediaSessionBridge, TransportCommand};
use crate::transcription::{
    SourceFactory, StreamingTranscriber, TranscriberOptions, TranscriptionEvent,
};
use crate::tts::{AudioSink, PlayerEvent, StreamingTtsPlayer};
use crate::workflow::{LlmDispatcher, LlmEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Ready,
    Recording,
    Processing,
    Playback,
    Error,
}

/// Node ids threading consecutive turns into a conversation DAG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationThread {
    /// Parent for the next user turn (the previous LLM reply).
    pub current_parent_node_id: Option<i64>,
    /// The most recent user node; the fallback parent after a cancel.
    pub last_user_node_id: Option<i64>,
}

/// Notifications for the embedding UI.
#[derive(Debug, Clone)]
pub enum VoiceSessionEvent {
    PhaseChanged(SessionPhase),
    TranscriptUpdated { transcript: String },
    LlmCompleted { node_id: i64, content: String },
    ErrorFlag { message: String },
    ErrorCleared,
}

#[derive(Debug, Clone)]
pub struct VoiceSessionOptions {
    pub workflow: Workflow,
    pub privacy_level: crate::api::PrivacyLevel,
    pub ai_usage: crate::api::AiUsage,
    /// Rejoin an in-flight LLM job after a refresh: skip recording, poll the
    /// node, continue to playback.
    pub initial_llm_node_id: Option<i64>,
    pub initial_parent_id: Option<i64>,
}

impl Default for VoiceSessionOptions {
    fn default() -> Self {
        Self {
            workflow: Workflow::Reflect,
            privacy_level: crate::api::PrivacyLevel::Private,
            ai_usage: crate::api::AiUsage::Chat,
            initial_llm_node_id: None,
            initial_parent_id: None,
        }
    }
}

enum Command {
    Start,
    Pause,
    Resume,
    Finish,
    Cancel,
    Continue,
    Shutdown,
}

enum Internal {
    ForcePlayback,
    ClearError,
}

/// Handle to the voice session loop. Commands are fire-and-forget; outcomes
/// arrive as [`VoiceSessionEvent`]s and phase updates.
pub struct VoiceSessionController {
    command_tx: mpsc::UnboundedSender<Command>,
    phase_rx: watch::Receiver<SessionPhase>,
    thread: Arc<Mutex<ConversationThread>>,
    has_error: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl VoiceSessionController {
    pub fn spawn(
        client: ApiClient,
        config: PipelineConfig,
        source_factory: SourceFactory,
        sink: Box<dyn AudioSink>,
        options: VoiceSessionOptions,
        metrics: MetricsCollector,
    ) -> (Self, mpsc::UnboundedReceiver<VoiceSessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Ready);
        let thread = Arc::new(Mutex::new(ConversationThread {
            current_parent_node_id: options.initial_parent_id,
            last_user_node_id: None,
        }));
        let has_error = Arc::new(AtomicBool::new(false));

        let (transcriber, transcription_rx) = StreamingTranscriber::new(
            client.clone(),
            config.clone(),
            source_factory,
            metrics.clone(),
        );
        let (dispatcher, llm_rx) = LlmDispatcher::new(client.clone(), &config, metrics.clone());
        let (player, player_rx) = StreamingTtsPlayer::new(
            client.clone(),
            config.clone(),
            sink,
            true,
            metrics.clone(),
        );
        let (bridge, transport_rx) = MediaSessionBridge::new(config.platform);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let driver = Controller {
            client,
            config,
            options,
            transcriber,
            dispatcher,
            player,
            bridge,
            phase_tx,
            event_tx,
            thread: thread.clone(),
            has_error: has_error.clone(),
            conversation_id: None,
            active_llm_node: None,
            cancelled_llm_node: None,
            internal_tx,
            first_chunk_timer: None,
            error_timer: None,
        };

        let handle = tokio::spawn(driver.run(
            command_rx,
            transcription_rx,
            llm_rx,
            player_rx,
            transport_rx,
            internal_rx,
        ));

        (
            Self {
                command_tx,
                phase_rx,
                thread,
                has_error,
                driver: Some(handle),
            },
            event_rx,
        )
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase_rx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_rx.clone()
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    pub fn thread(&self) -> ConversationThread {
        *self.thread.lock().expect("thread mutex")
    }

    /// Start a recording turn (the user-gesture entry point).
    pub fn start_recording(&self) {
        let _ = self.command_tx.send(Command::Start);
    }

    pub fn pause_recording(&self) {
        let _ = self.command_tx.send(Command::Pause);
    }

    pub fn resume_recording(&self) {
        let _ = self.command_tx.send(Command::Resume);
    }

    /// Finish the take and move into processing.
    pub fn finish_recording(&self) {
        let _ = self.command_tx.send(Command::Finish);
    }

    /// Abort the in-flight turn.
    pub fn cancel(&self) {
        let _ = self.command_tx.send(Command::Cancel);
    }

    /// Leave playback and immediately start the next recording turn,
    /// keeping the conversation thread.
    pub fn continue_conversation(&self) {
        let _ = self.command_tx.send(Command::Continue);
    }

    pub fn shutdown(&mut self) {
        let _ = self.command_tx.send(Command::Shutdown);
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl Drop for VoiceSessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Controller {
    client: ApiClient,
    config: PipelineConfig,
    options: VoiceSessionOptions,
    transcriber: StreamingTranscriber,
    dispatcher: LlmDispatcher,
    player: StreamingTtsPlayer,
    bridge: MediaSessionBridge,
    phase_tx: watch::Sender<SessionPhase>,
    event_tx: mpsc::UnboundedSender<VoiceSessionEvent>,
    thread: Arc<Mutex<ConversationThread>>,
    has_error: Arc<AtomicBool>,
    conversation_id: Option<i64>,
    active_llm_node: Option<i64>,
    /// Jobs the user walked away from; their late completion must not
    /// change anything visible.
    cancelled_llm_node: Option<i64>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    first_chunk_timer: Option<JoinHandle<()>>,
    error_timer: Option<JoinHandle<()>>,
}

impl Controller {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut transcription_rx: mpsc::UnboundedReceiver<TranscriptionEvent>,
        mut llm_rx: mpsc::UnboundedReceiver<LlmEvent>,
        mut player_rx: mpsc::UnboundedReceiver<PlayerEvent>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportCommand>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        // Page-refresh resumption: rejoin the in-flight job, no recording
        if let Some(node_id) = self.options.initial_llm_node_id {
            tracing::info!(node_id, "Resuming in-flight LLM job");
            self.set_phase(SessionPhase::Processing);
            self.active_llm_node = Some(node_id);
            self.dispatcher.attach(node_id);
        }

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = transcription_rx.recv() => self.handle_transcription_event(event).await,
                Some(event) = llm_rx.recv() => self.handle_llm_event(event).await,
                Some(event) = player_rx.recv() => self.handle_player_event(event),
                Some(command) = transport_rx.recv() => self.handle_transport(command).await,
                Some(message) = internal_rx.recv() => self.handle_internal(message),
            }
        }

        // Session loop is over: release everything
        self.dispatcher.cancel();
        self.player.stop_session();
        self.transcriber.cancel_streaming().await;
        self.bridge.deactivate();
        tracing::info!("Voice session loop shut down");
    }

    fn phase(&self) -> SessionPhase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&self, phase: SessionPhase) {
        let changed = self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
        if changed {
            tracing::info!(?phase, "Session phase changed");
            let _ = self.event_tx.send(VoiceSessionEvent::PhaseChanged(phase));
        }
    }

    fn flag_error(&mut self, message: String) {
        tracing::warn!(%message, "Session error flagged");
        self.has_error.store(true, Ordering::Release);
        let _ = self.event_tx.send(VoiceSessionEvent::ErrorFlag { message });

        if let Some(timer) = self.error_timer.take() {
            timer.abort();
        }
        let internal_tx = self.internal_tx.clone();
        let clear_after = self.config.error_flag_duration;
        self.error_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(clear_after).await;
            let _ = internal_tx.send(Internal::ClearError);
        }));
    }

    /// Returns true when the loop should exit.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start => self.start_turn(false).await,
            Command::Pause => {
                if self.phase() == SessionPhase::Recording {
                    if let Err(e) = self.transcriber.pause_recording().await {
                        tracing::warn!("Pause failed: {}", e);
                    }
                }
            }
            Command::Resume => {
                if self.phase() == SessionPhase::Recording {
                    if let Err(e) = self.transcriber.resume_recording().await {
                        tracing::warn!("Resume failed: {}", e);
                    }
                }
            }
            Command::Finish => self.finish_turn().await,
            Command::Cancel => self.cancel_turn().await,
            Command::Continue => {
                if self.phase() == SessionPhase::Playback {
                    self.player.stop_session();
                    self.start_turn(true).await;
                }
            }
            Command::Shutdown => return true,
        }
        false
    }

    async fn start_turn(&mut self, continuing: bool) {
        let phase = self.phase();
        if phase == SessionPhase::Recording || phase == SessionPhase::Processing {
            return;
        }

        // A finished or errored previous turn leaves the orchestrator
        // non-idle; clear it before the next take
        self.transcriber.cancel_streaming().await;

        if continuing {
            if self.config.platform.avoid_concurrent_playback_during_capture {
                // Playing anything while the capture stream opens can crash
                // the Bluetooth stack; kill the keepalive first
                self.bridge.stop_keepalive();
            }
            if !self.config.platform.profile_switch_delay.is_zero() {
                // Let A2DP/HFP settle before the mic grabs the profile
                tokio::time::sleep(self.config.platform.profile_switch_delay).await;
            }
        } else {
            self.bridge.recording_started();
        }

        let parent_id = self
            .thread
            .lock()
            .expect("thread mutex poisoned")
            .current_parent_node_id;
        let result = self
            .transcriber
            .start_streaming(TranscriberOptions {
                parent_id,
                privacy_level: self.options.privacy_level,
                ai_usage: self.options.ai_usage,
            })
            .await;

        match result {
            Ok(()) => {
                if continuing {
                    // Mic is live; now it is safe to front the media session
                    self.bridge.recording_started();
                }
                self.set_phase(SessionPhase::Recording);
            }
            Err(e) => {
                self.bridge.deactivate();
                self.flag_error(format!("Could not start recording: {}", e));
                self.set_phase(SessionPhase::Error);
            }
        }
    }

    async fn finish_turn(&mut self) {
        if self.phase() != SessionPhase::Recording {
            return;
        }
        self.bridge.processing_started();

        if let Err(e) = self.transcriber.stop_streaming().await {
            self.flag_error(format!("Could not finish recording: {}", e));
            self.transcriber.cancel_streaming().await;
            self.bridge.deactivate();
            self.set_phase(SessionPhase::Ready);
            return;
        }

        let transcript = self.transcriber.transcript();
        if transcript.trim().is_empty() {
            // Nothing was said; no turn to process
            tracing::info!("Empty transcript; returning to ready");
            self.bridge.deactivate();
            self.set_phase(SessionPhase::Ready);
            return;
        }

        self.set_phase(SessionPhase::Processing);
        let session_id = self.transcriber.session_id();
        let parent_id = self
            .thread
            .lock()
            .expect("thread mutex poisoned")
            .current_parent_node_id;
        let workflow = self.effective_workflow();

        match self
            .dispatcher
            .dispatch(&workflow, &transcript, parent_id, session_id)
            .await
        {
            Ok(response) => {
                let mut thread = self.thread.lock().expect("thread mutex poisoned");
                thread.last_user_node_id = Some(response.user_node_id);
                drop(thread);
                if let Some(conversation_id) = response.conversation_id {
                    self.conversation_id = Some(conversation_id);
                }
                self.active_llm_node = Some(response.llm_node_id);
            }
            Err(e) => {
                self.flag_error(format!("Turn dispatch failed: {}", e));
                self.bridge.deactivate();
                self.set_phase(SessionPhase::Ready);
            }
        }
    }

    async fn cancel_turn(&mut self) {
        match self.phase() {
            SessionPhase::Processing => {
                // Stop tracking the job; it completes server-side as an
                // orphan sibling. Reparent the next turn onto the last user
                // message instead of the abandoned reply.
                self.dispatcher.cancel();
                self.cancelled_llm_node = self.active_llm_node.take();

                let mut thread = self.thread.lock().expect("thread mutex poisoned");
                thread.current_parent_node_id = thread.last_user_node_id;
                drop(thread);

                self.player.stop_session();
                self.bridge.deactivate();
                self.set_phase(SessionPhase::Ready);
            }
            SessionPhase::Recording => {
                self.transcriber.cancel_streaming().await;
                self.bridge.deactivate();
                self.set_phase(SessionPhase::Ready);
            }
            SessionPhase::Playback => {
                self.player.stop_session();
                self.bridge.deactivate();
                self.set_phase(SessionPhase::Ready);
            }
            _ => {}
        }
    }

    fn effective_workflow(&self) -> Workflow {
        match (&self.options.workflow, self.conversation_id) {
            (Workflow::ConverseStart, Some(conversation_id)) => {
                Workflow::ConverseContinue(conversation_id)
            }
            (workflow, _) => workflow.clone(),
        }
    }

    async fn handle_transcription_event(&mut self, event: TranscriptionEvent) {
        match event {
            TranscriptionEvent::TranscriptUpdated { transcript } => {
                let _ = self
                    .event_tx
                    .send(VoiceSessionEvent::TranscriptUpdated { transcript });
            }
            TranscriptionEvent::ChunkUploadFailed { index, error } => {
                // Recording goes on; the user just sees the warning
                self.flag_error(format!("Chunk {} failed to upload: {}", index, error));
            }
            TranscriptionEvent::Error { message } => {
                if self.phase() == SessionPhase::Recording {
                    self.flag_error(message);
                    self.transcriber.cancel_streaming().await;
                    self.bridge.deactivate();
                    self.set_phase(SessionPhase::Ready);
                }
            }
            // Completion is consumed inline by finish_turn
            _ => {}
        }
    }

    async fn handle_llm_event(&mut self, event: LlmEvent) {
        match event {
            LlmEvent::Completed { node_id, content } => {
                if Some(node_id) == self.cancelled_llm_node {
                    tracing::debug!(node_id, "Ignoring completion of cancelled job");
                    return;
                }
                if self.phase() != SessionPhase::Processing {
                    return;
                }

                // This reply is the parent of the next turn
                self.thread
                    .lock()
                    .expect("thread mutex poisoned")
                    .current_parent_node_id = Some(node_id);
                let _ = self.event_tx.send(VoiceSessionEvent::LlmCompleted {
                    node_id,
                    content,
                });

                if let Err(e) = self.client.trigger_tts(node_id).await {
                    self.flag_error(format!("TTS trigger failed: {}", e));
                    self.bridge.deactivate();
                    self.set_phase(SessionPhase::Ready);
                    return;
                }
                self.player.start_session(node_id);

                // If no audio chunk shows up, unblock the UI anyway
                if let Some(timer) = self.first_chunk_timer.take() {
                    timer.abort();
                }
                let internal_tx = self.internal_tx.clone();
                let timeout = self.config.first_chunk_timeout;
                self.first_chunk_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = internal_tx.send(Internal::ForcePlayback);
                }));
            }
            LlmEvent::Failed { node_id, error } => {
                if Some(node_id) == self.cancelled_llm_node {
                    return;
                }
                self.flag_error(error);
                self.bridge.deactivate();
                self.set_phase(SessionPhase::Ready);
            }
            LlmEvent::Progress { .. } => {}
        }
    }

    fn handle_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::PlaybackStarted => {
                if let Some(timer) = self.first_chunk_timer.take() {
                    timer.abort();
                }
                if self.phase() == SessionPhase::Processing {
                    self.bridge.playback_started();
                    self.set_phase(SessionPhase::Playback);
                }
            }
            PlayerEvent::Error { message } => {
                self.flag_error(message);
            }
            _ => {}
        }
    }

    async fn handle_transport(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Resume => {
                if self.phase() == SessionPhase::Recording {
                    let _ = self.transcriber.resume_recording().await;
                }
            }
            TransportCommand::Pause => {
                if self.phase() == SessionPhase::Recording {
                    let _ = self.transcriber.pause_recording().await;
                }
            }
            TransportCommand::Stop => self.finish_turn().await,
            TransportCommand::Cancel => self.cancel_turn().await,
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::ForcePlayback => {
                if self.phase() == SessionPhase::Processing {
                    tracing::warn!("No TTS chunk within the safety window; forcing playback phase");
                    self.bridge.playback_started();
                    self.set_phase(SessionPhase::Playback);
                }
            }
            Internal::ClearError => {
                self.has_error.store(false, Ordering::Release);
                let _ = self.event_tx.send(VoiceSessionEvent::ErrorCleared);
            }
        }
    }
}
