//! Streaming TTS playback.
//!
//! Consumes `chunk_ready` announcements from the push stream, fetches each
//! synthesized segment, and feeds an index-ordered gapless queue. Playback
//! starts on the first chunk; out-of-order arrivals are buffered until their
//! turn. Segments form a virtual continuous timeline that supports seeking
//! and replay-from-start after the queue has drained.
//!
//! The player is built once at app start and reused across turns; stopping a
//! session clears the queue but keeps the audio output alive.

pub mod sink;
pub mod timeline;

pub use sink::{AudioSink, NullSink, RodioSink};
pub use timeline::{AudioSegment, VirtualTimeline};

use crate::api::{ApiClient, TtsChunkReadyPayload, TtsCompletePayload};
use crate::config::PipelineConfig;
use crate::logging::MetricsCollector;
use crate::push::{EventStream, EventStreamConfig};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const EVENT_TTS_CHUNK_READY: &str = "chunk_ready";
pub const EVENT_TTS_ALL_COMPLETE: &str = "all_complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Idle,
    Generating,
    Playing,
    Paused,
    Complete,
    Error,
}

#[derive(Debug, Clone)]
pub enum PlayerEvent {
    StateChanged(PlayerState),
    SegmentEnqueued { index: u64 },
    PlaybackStarted,
    PlaybackFinished,
    Error { message: String },
}

struct PlayerShared {
    sink: Mutex<Box<dyn AudioSink>>,
    timeline: Mutex<VirtualTimeline>,
    segment_bytes: Mutex<BTreeMap<u64, Vec<u8>>>,
    next_to_enqueue: Mutex<u64>,
    current_index: Mutex<u64>,
    generation_complete: AtomicBool,
    started: AtomicBool,
    play_requested: AtomicBool,
    autoplay: bool,
    gap: Duration,
    state_tx: watch::Sender<PlayerState>,
    event_tx: mpsc::UnboundedSender<PlayerEvent>,
    metrics: MetricsCollector,
}

impl PlayerShared {
    fn set_state(&self, state: PlayerState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            let _ = self.event_tx.send(PlayerEvent::StateChanged(state));
        }
    }

    fn state(&self) -> PlayerState {
        *self.state_tx.borrow()
    }
}

/// Gapless, seekable player for server-synthesized audio chunks.
pub struct StreamingTtsPlayer {
    client: ApiClient,
    config: PipelineConfig,
    shared: Arc<PlayerShared>,
    stream: Option<EventStream>,
    fetch_task: Option<JoinHandle<()>>,
    drive_task: Option<JoinHandle<()>>,
}

impl StreamingTtsPlayer {
    pub fn new(
        client: ApiClient,
        config: PipelineConfig,
        sink: Box<dyn AudioSink>,
        autoplay: bool,
        metrics: MetricsCollector,
    ) -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(PlayerState::Idle);
        let gap = config.inter_segment_gap;

        let player = Self {
            client,
            config,
            shared: Arc::new(PlayerShared {
                sink: Mutex::new(sink),
                timeline: Mutex::new(VirtualTimeline::new()),
                segment_bytes: Mutex::new(BTreeMap::new()),
                next_to_enqueue: Mutex::new(0),
                current_index: Mutex::new(0),
                generation_complete: AtomicBool::new(false),
                started: AtomicBool::new(false),
                play_requested: AtomicBool::new(false),
                autoplay,
                gap,
                state_tx,
                event_tx,
                metrics,
            }),
            stream: None,
            fetch_task: None,
            drive_task: None,
        };
        (player, event_rx)
    }

    pub fn state(&self) -> PlayerState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.shared.state_tx.subscribe()
    }

    pub fn current_chunk_index(&self) -> u64 {
        *self.shared.current_index.lock().expect("current index mutex")
    }

    pub fn total_chunks(&self) -> usize {
        self.shared.timeline.lock().expect("timeline mutex").len()
    }

    pub fn total_duration(&self) -> Duration {
        self.shared
            .timeline
            .lock()
            .expect("timeline mutex")
            .total_duration()
    }

    /// Cumulative position on the virtual timeline, at segment granularity.
    pub fn position(&self) -> Duration {
        let current = self.current_chunk_index();
        self.shared
            .timeline
            .lock()
            .expect("timeline mutex")
            .prefix_duration(current)
    }

    /// Subscribe to a node's TTS stream and start buffering (and, with
    /// autoplay, playing) chunks as they are announced.
    pub fn start_session(&mut self, node_id: i64) {
        self.stop_session();
        self.shared.set_state(PlayerState::Generating);

        let (ready_tx, ready_rx) = mpsc::unbounded_channel::<TtsChunkReadyPayload>();

        let url = self.client.tts_stream_url(node_id);
        let mut stream = EventStream::new(
            self.client.clone(),
            move || url.clone(),
            EventStreamConfig {
                reconnect_delay: self.config.reconnect_delay,
                heartbeat_interval: self.config.heartbeat_interval,
                ..EventStreamConfig::default()
            },
            self.shared.metrics.clone(),
        );

        let ready_for_handler = ready_tx.clone();
        stream.on(EVENT_TTS_CHUNK_READY, move |value| {
            match serde_json::from_value::<TtsChunkReadyPayload>(value) {
                Ok(payload) => {
                    let _ = ready_for_handler.send(payload);
                }
                Err(e) => tracing::warn!("Bad chunk_ready payload: {}", e),
            }
        });

        let shared_for_complete = self.shared.clone();
        stream.on(EVENT_TTS_ALL_COMPLETE, move |value| {
            let tts_url = serde_json::from_value::<TtsCompletePayload>(value)
                .ok()
                .and_then(|payload| payload.tts_url);
            tracing::info!(?tts_url, "TTS generation complete");
            shared_for_complete
                .generation_complete
                .store(true, Ordering::Release);
        });

        let shared_for_error = self.shared.clone();
        stream.on("error", move |value| {
            let message = value["error"].as_str().unwrap_or("tts stream error").to_string();
            tracing::error!(%message, "TTS stream error");
            shared_for_error.set_state(PlayerState::Error);
            let _ = shared_for_error
                .event_tx
                .send(PlayerEvent::Error { message });
        });

        stream.connect();
        self.stream = Some(stream);

        self.fetch_task = Some(tokio::spawn(fetch_segments(
            self.client.clone(),
            self.shared.clone(),
            ready_rx,
        )));
        self.drive_task = Some(tokio::spawn(drive_playback(self.shared.clone())));
    }

    /// Start or resume playback. At the end of a finished queue this replays
    /// from the first segment with the cumulative position reset to zero.
    pub fn play(&mut self) {
        match self.state() {
            PlayerState::Paused => {
                self.shared.sink.lock().expect("sink mutex").resume();
                self.shared.set_state(PlayerState::Playing);
            }
            PlayerState::Complete => {
                // Replay from the top
                {
                    let mut sink = self.shared.sink.lock().expect("sink mutex");
                    sink.clear();
                }
                *self.shared.next_to_enqueue.lock().expect("next mutex") = 0;
                *self.shared.current_index.lock().expect("current index mutex") = 0;
                self.shared.started.store(false, Ordering::Release);
                self.shared.play_requested.store(true, Ordering::Release);
                self.shared.set_state(PlayerState::Playing);
            }
            _ => {
                self.shared.play_requested.store(true, Ordering::Release);
            }
        }
    }

    /// Pause playback, preserving the queue.
    pub fn pause(&mut self) {
        if self.state() == PlayerState::Playing {
            self.shared.sink.lock().expect("sink mutex").pause();
            self.shared.set_state(PlayerState::Paused);
        }
    }

    /// Seek to a cumulative time on the virtual timeline. Times past the end
    /// clamp to the end.
    pub fn seek(&mut self, target: Duration) {
        let located = self
            .shared
            .timeline
            .lock()
            .expect("timeline mutex")
            .locate(target);
        let Some((index, offset)) = located else {
            return;
        };

        let bytes = self.shared.segment_bytes.lock().expect("segment bytes mutex");
        let mut sink = self.shared.sink.lock().expect("sink mutex");
        sink.clear();

        let mut appended = 0u64;
        let mut cursor = index;
        while let Some(wav) = bytes.get(&cursor) {
            if sink::probe_playable(wav) {
                let skip = if cursor == index { offset } else { Duration::ZERO };
                let gap = if appended == 0 {
                    Duration::ZERO
                } else {
                    self.shared.gap
                };
                sink.append(wav.clone(), skip, gap);
                appended += 1;
            }
            cursor += 1;
        }
        drop(sink);
        drop(bytes);

        *self.shared.current_index.lock().expect("current index mutex") = index;
        *self.shared.next_to_enqueue.lock().expect("next mutex") = cursor;
        tracing::debug!(
            target_ms = target.as_millis() as u64,
            segment = index,
            offset_ms = offset.as_millis() as u64,
            "Seeked"
        );
    }

    /// Tear down the session: disconnect the push stream, clear the queue,
    /// and forget every buffered segment. The audio output itself stays
    /// alive for the next session. Idempotent.
    pub fn stop_session(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.disconnect();
        }
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        if let Some(task) = self.drive_task.take() {
            task.abort();
        }

        self.shared.sink.lock().expect("sink mutex").clear();
        self.shared.timeline.lock().expect("timeline mutex").clear();
        self.shared
            .segment_bytes
            .lock()
            .expect("segment bytes mutex")
            .clear();
        *self.shared.next_to_enqueue.lock().expect("next mutex") = 0;
        *self.shared.current_index.lock().expect("current index mutex") = 0;
        self.shared.generation_complete.store(false, Ordering::Release);
        self.shared.started.store(false, Ordering::Release);
        self.shared.play_requested.store(false, Ordering::Release);
        self.shared.set_state(PlayerState::Idle);
    }
}

impl Drop for StreamingTtsPlayer {
    fn drop(&mut self) {
        self.stop_session();
    }
}

/// Downloads announced segments. Fetch failures buffer an empty payload so
/// ordering advances past the bad segment instead of stalling on it.
async fn fetch_segments(
    client: ApiClient,
    shared: Arc<PlayerShared>,
    mut ready_rx: mpsc::UnboundedReceiver<TtsChunkReadyPayload>,
) {
    while let Some(payload) = ready_rx.recv().await {
        let duration = payload.duration.map(Duration::from_secs_f64);
        let bytes = match client.fetch_audio(&payload.audio_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    index = payload.chunk_index,
                    url = %payload.audio_url,
                    "Failed to fetch TTS segment: {}",
                    e
                );
                Vec::new()
            }
        };

        shared
            .timeline
            .lock()
            .expect("timeline mutex poisoned")
            .insert(AudioSegment {
                index: payload.chunk_index,
                url: payload.audio_url,
                duration,
            });
        shared
            .segment_bytes
            .lock()
            .expect("segment bytes mutex poisoned")
            .insert(payload.chunk_index, bytes);
        tracing::debug!(index = payload.chunk_index, "TTS segment buffered");
    }
}

/// Feeds buffered segments to the sink in index order and tracks playback
/// progress by watching the queue drain.
async fn drive_playback(shared: Arc<PlayerShared>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_queued = 0usize;

    loop {
        ticker.tick().await;

        // Enqueue every contiguous segment that has arrived
        loop {
            let next = *shared.next_to_enqueue.lock().expect("next mutex poisoned");
            let wav = shared
                .segment_bytes
                .lock()
                .expect("segment bytes mutex poisoned")
                .get(&next)
                .cloned();
            let Some(wav) = wav else { break };

            if sink::probe_playable(&wav) {
                let gap = if shared.started.load(Ordering::Acquire) {
                    shared.gap
                } else {
                    Duration::ZERO
                };
                shared
                    .sink
                    .lock()
                    .expect("sink mutex poisoned")
                    .append(wav, Duration::ZERO, gap);
                shared.metrics.tts_chunk_played();
                let _ = shared
                    .event_tx
                    .send(PlayerEvent::SegmentEnqueued { index: next });

                let may_start = shared.autoplay || shared.play_requested.load(Ordering::Acquire);
                if may_start && !shared.started.swap(true, Ordering::AcqRel) {
                    shared.set_state(PlayerState::Playing);
                    let _ = shared.event_tx.send(PlayerEvent::PlaybackStarted);
                }
            } else {
                // A broken segment advances to the next; it never ends the turn
                shared.metrics.tts_chunk_error();
                tracing::warn!(index = next, "Skipping undecodable TTS segment");
            }
            *shared.next_to_enqueue.lock().expect("next mutex poisoned") = next + 1;
        }

        // Progress accounting: the queue draining means segments finished
        let queued = shared.sink.lock().expect("sink mutex poisoned").queued();
        if queued < last_queued {
            let finished = (last_queued - queued) as u64;
            let mut current = shared.current_index.lock().expect("current index mutex");
            *current += finished;
        }
        last_queued = queued;

        // All announced, all fetched, all played
        if shared.generation_complete.load(Ordering::Acquire)
            && queued == 0
            && shared.started.load(Ordering::Acquire)
            && shared.state() == PlayerState::Playing
        {
            let announced = shared
                .timeline
                .lock()
                .expect("timeline mutex poisoned")
                .last_index();
            let next = *shared.next_to_enqueue.lock().expect("next mutex poisoned");
            if announced.map_or(true, |last| next > last) {
                shared.set_state(PlayerState::Complete);
                let _ = shared.event_tx.send(PlayerEvent::PlaybackFinished);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn wav_fixture(millis: u64) -> Vec<u8> {
        let mut wav = Vec::new();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(std::io::Cursor::new(&mut wav), spec).unwrap();
        for _ in 0..(8 * millis) {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
        wav
    }

    fn test_player(server_url: &str, autoplay: bool) -> (StreamingTtsPlayer, NullSink) {
        let config = PipelineConfig::default().with_base_url(server_url);
        let client = ApiClient::new(&config, MetricsCollector::new()).unwrap();
        let null_sink = NullSink::new();
        let (player, _events) = StreamingTtsPlayer::new(
            client,
            config,
            Box::new(null_sink.clone()),
            autoplay,
            MetricsCollector::new(),
        );
        (player, null_sink)
    }

    async fn mount_audio(server: &MockServer, name: &str, wav: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(format!("/audio/{}", name)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(wav))
            .mount(server)
            .await;
    }

    fn inject(player: &StreamingTtsPlayer, index: u64, duration: f64, wav: Vec<u8>) {
        player
            .shared
            .timeline
            .lock()
            .unwrap()
            .insert(AudioSegment {
                index,
                url: format!("/audio/{}.wav", index),
                duration: Some(Duration::from_secs_f64(duration)),
            });
        player
            .shared
            .segment_bytes
            .lock()
            .unwrap()
            .insert(index, wav);
    }

    #[tokio::test]
    async fn test_autoplay_starts_on_first_contiguous_segment() {
        let server = MockServer::start().await;
        let (mut player, sink) = test_player(&server.uri(), true);
        player.shared.set_state(PlayerState::Generating);
        player.drive_task = Some(tokio::spawn(drive_playback(player.shared.clone())));

        // Segment 1 arrives before segment 0: nothing plays yet
        inject(&player, 1, 1.5, wav_fixture(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(sink.appended().is_empty());
        assert_eq!(player.state(), PlayerState::Generating);

        // Segment 0 unblocks both, in order
        inject(&player, 0, 2.1, wav_fixture(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        let appends = sink.appended();
        assert_eq!(appends.len(), 2);
        // First segment has no leading gap; the second does
        assert_eq!(appends[0].2, Duration::ZERO);
        assert_eq!(appends[1].2, Duration::from_millis(50));
        assert_eq!(player.state(), PlayerState::Playing);
        assert_eq!(player.total_duration(), Duration::from_secs_f64(3.6));
    }

    #[tokio::test]
    async fn test_completion_after_generation_and_drain() {
        let server = MockServer::start().await;
        let (mut player, _sink) = test_player(&server.uri(), true);
        player.shared.set_state(PlayerState::Generating);
        player.drive_task = Some(tokio::spawn(drive_playback(player.shared.clone())));

        inject(&player, 0, 1.0, wav_fixture(10));
        player
            .shared
            .generation_complete
            .store(true, Ordering::Release);

        // NullSink drains instantly, so Playing then Complete
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(player.state(), PlayerState::Complete);
    }

    #[tokio::test]
    async fn test_undecodable_segment_is_skipped() {
        let server = MockServer::start().await;
        let (mut player, sink) = test_player(&server.uri(), true);
        player.shared.set_state(PlayerState::Generating);
        player.drive_task = Some(tokio::spawn(drive_playback(player.shared.clone())));

        inject(&player, 0, 1.0, vec![0xFF; 32]); // garbage
        inject(&player, 1, 1.0, wav_fixture(10));
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Only the decodable segment reached the sink
        assert_eq!(sink.appended().len(), 1);
        assert_eq!(
            *player.shared.next_to_enqueue.lock().unwrap(),
            2,
            "ordering advanced past the bad segment"
        );
    }

    #[tokio::test]
    async fn test_pause_preserves_queue_and_play_resumes() {
        let server = MockServer::start().await;
        let (mut player, sink) = test_player(&server.uri(), true);
        player.shared.set_state(PlayerState::Generating);
        player.drive_task = Some(tokio::spawn(drive_playback(player.shared.clone())));

        inject(&player, 0, 1.0, wav_fixture(10));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(player.state(), PlayerState::Playing);

        player.pause();
        assert_eq!(player.state(), PlayerState::Paused);
        assert_eq!(sink.appended().len(), 1, "queue preserved on pause");

        player.play();
        assert_eq!(player.state(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn test_seek_rebuilds_queue_from_target_segment() {
        let server = MockServer::start().await;
        let (mut player, sink) = test_player(&server.uri(), false);

        inject(&player, 0, 2.0, wav_fixture(20));
        inject(&player, 1, 1.5, wav_fixture(15));
        inject(&player, 2, 1.0, wav_fixture(10));
        *player.shared.next_to_enqueue.lock().unwrap() = 3;

        player.seek(Duration::from_millis(2500));

        let appends = sink.appended();
        // Seek landed 500ms into segment 1, then segment 2
        assert_eq!(appends.len(), 2);
        assert_eq!(appends[0].1, Duration::from_millis(500));
        assert_eq!(appends[1].1, Duration::ZERO);
        assert_eq!(player.current_chunk_index(), 1);
        assert_eq!(player.position(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_seek_past_end_clamps() {
        let server = MockServer::start().await;
        let (mut player, _sink) = test_player(&server.uri(), false);
        inject(&player, 0, 2.0, wav_fixture(20));
        *player.shared.next_to_enqueue.lock().unwrap() = 1;

        player.seek(Duration::from_secs(100));
        assert_eq!(player.current_chunk_index(), 0);
    }

    #[tokio::test]
    async fn test_stop_session_clears_everything() {
        let server = MockServer::start().await;
        let (mut player, sink) = test_player(&server.uri(), true);
        inject(&player, 0, 1.0, wav_fixture(10));

        player.stop_session();
        assert_eq!(player.state(), PlayerState::Idle);
        assert_eq!(player.total_chunks(), 0);
        assert!(sink.appended().is_empty());

        // Idempotent
        player.stop_session();
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[tokio::test]
    async fn test_fetch_task_buffers_segments_from_announcements() {
        let server = MockServer::start().await;
        mount_audio(&server, "a1.wav", wav_fixture(10)).await;

        let (player, _sink) = test_player(&server.uri(), true);
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let config = PipelineConfig::default().with_base_url(&server.uri());
        let client = ApiClient::new(&config, MetricsCollector::new()).unwrap();
        let fetch = tokio::spawn(fetch_segments(client, player.shared.clone(), ready_rx));

        ready_tx
            .send(TtsChunkReadyPayload {
                chunk_index: 0,
                audio_url: "/audio/a1.wav".to_string(),
                duration: Some(2.1),
            })
            .unwrap();
        drop(ready_tx);
        fetch.await.unwrap();

        assert_eq!(player.total_chunks(), 1);
        assert!(sink::probe_playable(
            player.shared.segment_bytes.lock().unwrap().get(&0).unwrap()
        ));
        assert_eq!(player.total_duration(), Duration::from_secs_f64(2.1));
    }
}
