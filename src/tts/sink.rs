use rodio::{Decoder, OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Playback seam for the streaming player. One source per segment; the
/// inter-segment gap rides along as a leading delay so queue length equals
/// segment count.
pub trait AudioSink: Send {
    /// Queue a WAV for gapless playback, skipping `skip` into it and
    /// delaying `gap` before it starts.
    fn append(&mut self, wav: Vec<u8>, skip: Duration, gap: Duration);

    fn pause(&mut self);

    fn resume(&mut self);

    /// Drop everything queued, including the playing segment.
    fn clear(&mut self);

    /// Segments still queued, the playing one included.
    fn queued(&self) -> usize;
}

/// True when the bytes decode as playable audio. Undecodable segments are
/// skipped by the player rather than handed to the output thread.
pub fn probe_playable(wav: &[u8]) -> bool {
    Decoder::new(Cursor::new(wav.to_vec())).is_ok()
}

enum SinkCommand {
    Append {
        wav: Vec<u8>,
        skip: Duration,
        gap: Duration,
    },
    Pause,
    Resume,
    Clear,
    Shutdown,
}

/// Real audio output on a dedicated thread; rodio's `OutputStream` is not
/// `Send`, so the thread owns it for the life of the sink (the
/// process-wide-player lifecycle).
pub struct RodioSink {
    command_tx: std_mpsc::Sender<SinkCommand>,
    queued: Arc<AtomicUsize>,
}

impl RodioSink {
    pub fn new() -> Result<Self, String> {
        let (command_tx, command_rx) = std_mpsc::channel::<SinkCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
        let queued = Arc::new(AtomicUsize::new(0));
        let queued_for_thread = queued.clone();

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
                    let _ = ready_tx.send(Err(format!("Failed to create sink: {}", e)));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            loop {
                match command_rx.recv_timeout(Duration::from_millis(25)) {
                    Ok(SinkCommand::Append { wav, skip, gap }) => {
                        match Decoder::new(Cursor::new(wav)) {
                            Ok(source) => {
                                sink.append(source.skip_duration(skip).delay(gap));
                            }
                            Err(e) => {
                                tracing::warn!("Undecodable segment reached the sink: {}", e);
                            }
                        }
                    }
                    Ok(SinkCommand::Pause) => sink.pause(),
                    Ok(SinkCommand::Resume) => sink.play(),
                    Ok(SinkCommand::Clear) => sink.stop(),
                    Ok(SinkCommand::Shutdown) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                        sink.stop();
                        break;
                    }
                    Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                }
                queued_for_thread.store(sink.len(), Ordering::Release);
            }
            tracing::debug!("Audio output thread shut down");
        });

        ready_rx
            .recv()
            .map_err(|_| "Audio output thread died during init".to_string())??;

        Ok(Self { command_tx, queued })
    }
}

impl AudioSink for RodioSink {
    fn append(&mut self, wav: Vec<u8>, skip: Duration, gap: Duration) {
        let _ = self.command_tx.send(SinkCommand::Append { wav, skip, gap });
        // Count it immediately; the thread refreshes from the real queue
        self.queued.fetch_add(1, Ordering::AcqRel);
    }

    fn pause(&mut self) {
        let _ = self.command_tx.send(SinkCommand::Pause);
    }

    fn resume(&mut self) {
        let _ = self.command_tx.send(SinkCommand::Resume);
    }

    fn clear(&mut self) {
        let _ = self.command_tx.send(SinkCommand::Clear);
        self.queued.store(0, Ordering::Release);
    }

    fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        let _ = self.command_tx.send(SinkCommand::Shutdown);
    }
}

/// Records appends and plays nothing; every segment finishes instantly.
/// Stands in for real output on machines without an audio device.
#[derive(Default, Clone)]
pub struct NullSink {
    appends: Arc<Mutex<Vec<(usize, Duration, Duration)>>>,
    paused: Arc<AtomicUsize>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(wav length, skip, gap)` per append, in order.
    pub fn appended(&self) -> Vec<(usize, Duration, Duration)> {
        self.appends.lock().expect("null sink mutex").clone()
    }
}

impl AudioSink for NullSink {
    fn append(&mut self, wav: Vec<u8>, skip: Duration, gap: Duration) {
        self.appends
            .lock()
            .expect("null sink mutex")
            .push((wav.len(), skip, gap));
    }

    fn pause(&mut self) {
        self.paused.store(1, Ordering::Release);
    }

    fn resume(&mut self) {
        self.paused.store(0, Ordering::Release);
    }

    fn clear(&mut self) {
        self.appends.lock().expect("null sink mutex").clear();
    }

    fn queued(&self) -> usize {
        0
    }
}
