//! Lock-screen media-session bridge.
//!
//! Some platforms only surface OS transport controls while something is
//! audibly playing. There, recording runs a silent keepalive source and maps
//! the OS transport events back onto session commands. Platforms without
//! that gate get a no-op bridge; the real playback element surfaces its own
//! controls.

use crate::config::PlatformCaps;
use rodio::source::Zero;
use rodio::{OutputStream, Sink};
use souvlaki::{MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, PlatformConfig};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Session commands produced by OS transport events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Resume,
    Pause,
    Stop,
    Cancel,
}

/// What the bridge is currently fronting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    Inactive,
    Recording,
    Processing,
    Playback,
}

/// Map an OS transport event onto a session command for the current phase.
///
/// Recording: play/pause drive the recorder, next finishes the take.
/// Processing: only next (cancel) is meaningful. Playback and inactive
/// phases route nothing; the audio element owns its own controls.
pub fn route_transport_event(
    phase: BridgePhase,
    event: &MediaControlEvent,
) -> Option<TransportCommand> {
    match phase {
        BridgePhase::Recording => match event {
            MediaControlEvent::Play => Some(TransportCommand::Resume),
            MediaControlEvent::Pause => Some(TransportCommand::Pause),
            MediaControlEvent::Next | MediaControlEvent::Stop => Some(TransportCommand::Stop),
            _ => None,
        },
        BridgePhase::Processing => match event {
            MediaControlEvent::Next => Some(TransportCommand::Cancel),
            _ => None,
        },
        BridgePhase::Playback | BridgePhase::Inactive => None,
    }
}

/// Lock-screen "now playing" title with elapsed recording time.
pub fn now_playing_title(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    format!("Recording {}:{:02}", total_secs / 60, total_secs % 60)
}

/// Inaudible playback that keeps the OS media session alive.
struct SilentKeepalive {
    stop_tx: std_mpsc::Sender<()>,
}

impl SilentKeepalive {
    fn start() -> Result<Self, String> {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();

        thread::spawn(move || {
            let (_stream, handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("No audio output: {}", e)));
                    return;
                }
            };
            let sink = match Sink::try_new(&handle) {
                Ok(sink) => sink,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            sink.append(Zero::<f32>::new(1, 44_100));
            let _ = ready_tx.send(Ok(()));

            // Parked until stop; dropping the stream releases the device
            let _ = stop_rx.recv();
            sink.stop();
            tracing::debug!("Silent keepalive stopped");
        });

        ready_rx
            .recv()
            .map_err(|_| "Keepalive thread died during init".to_string())??;
        Ok(Self { stop_tx })
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// Bridge between the voice session and the OS media session.
pub struct MediaSessionBridge {
    caps: PlatformCaps,
    phase: Arc<Mutex<BridgePhase>>,
    command_tx: mpsc::UnboundedSender<TransportCommand>,
    controls: Arc<Mutex<Option<MediaControls>>>,
    keepalive: Option<SilentKeepalive>,
    recording_started: Option<Instant>,
    title_task: Option<JoinHandle<()>>,
}

impl MediaSessionBridge {
    pub fn new(caps: PlatformCaps) -> (Self, mpsc::UnboundedReceiver<TransportCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (
            Self {
                caps,
                phase: Arc::new(Mutex::new(BridgePhase::Inactive)),
                command_tx,
                controls: Arc::new(Mutex::new(None)),
                keepalive: None,
                recording_started: None,
                title_task: None,
            },
            command_rx,
        )
    }

    pub fn is_active(&self) -> bool {
        self.keepalive.is_some()
    }

    fn ensure_controls(&mut self) {
        let mut controls = self.controls.lock().expect("controls mutex");
        if controls.is_some() {
            return;
        }

        let platform_config = PlatformConfig {
            dbus_name: "vellum",
            display_name: "Vellum",
            hwnd: None,
        };
        match MediaControls::new(platform_config) {
            Ok(mut created) => {
                let phase = self.phase.clone();
                let command_tx = self.command_tx.clone();
                let attach = created.attach(move |event: MediaControlEvent| {
                    let current = *phase.lock().expect("bridge phase mutex");
                    if let Some(command) = route_transport_event(current, &event) {
                        tracing::debug!(?command, "Transport event routed");
                        let _ = command_tx.send(command);
                    }
                });
                if let Err(e) = attach {
                    tracing::warn!("Media controls attach failed: {:?}", e);
                    return;
                }
                *controls = Some(created);
            }
            Err(e) => {
                // Degrade gracefully: recording works without lock-screen controls
                tracing::warn!("Media controls unavailable: {:?}", e);
            }
        }
    }

    /// Recording began: start the silent keepalive and register the
    /// recording transport set. No-op on platforms that do not gate media
    /// sessions behind playback.
    pub fn recording_started(&mut self) {
        *self.phase.lock().expect("bridge phase mutex") = BridgePhase::Recording;
        if !self.caps.needs_silent_audio_for_media_session {
            return;
        }

        if self.keepalive.is_none() {
            match SilentKeepalive::start() {
                Ok(keepalive) => self.keepalive = Some(keepalive),
                Err(e) => tracing::warn!("Silent keepalive unavailable: {}", e),
            }
        }
        self.ensure_controls();
        self.recording_started = Some(Instant::now());

        // Tick the lock-screen title with elapsed time
        if let Some(task) = self.title_task.take() {
            task.abort();
        }
        let controls = self.controls.clone();
        let started = Instant::now();
        self.title_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let title = now_playing_title(started.elapsed());
                let mut controls = controls.lock().expect("controls mutex poisoned");
                if let Some(controls) = controls.as_mut() {
                    let _ = controls.set_metadata(MediaMetadata {
                        title: Some(&title),
                        ..MediaMetadata::default()
                    });
                    let _ = controls.set_playback(MediaPlayback::Playing { progress: None });
                }
            }
        }));
    }

    /// Processing began: only "next = cancel" remains routable.
    pub fn processing_started(&mut self) {
        *self.phase.lock().expect("bridge phase mutex") = BridgePhase::Processing;
        if let Some(task) = self.title_task.take() {
            task.abort();
        }
    }

    /// Playback began: clear handlers so the real audio output owns the OS
    /// controls, and drop the keepalive.
    pub fn playback_started(&mut self) {
        *self.phase.lock().expect("bridge phase mutex") = BridgePhase::Playback;
        self.stop_keepalive();
        if let Some(task) = self.title_task.take() {
            task.abort();
        }
    }

    /// Stop the silent source. Must run before the microphone is
    /// re-acquired on platforms where concurrent playback and capture crash
    /// the Bluetooth stack.
    pub fn stop_keepalive(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
    }

    /// Tear everything down. Idempotent.
    pub fn deactivate(&mut self) {
        *self.phase.lock().expect("bridge phase mutex") = BridgePhase::Inactive;
        self.stop_keepalive();
        if let Some(task) = self.title_task.take() {
            task.abort();
        }
        if let Some(mut controls) = self.controls.lock().expect("controls mutex").take() {
            let _ = controls.detach();
        }
        self.recording_started = None;
    }
}

impl Drop for MediaSessionBridge {
    fn drop(&mut self) {
        self.deactivate();
    }
}
