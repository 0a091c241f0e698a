//! End-to-end pipeline scenarios against a mock backend.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use vellum::api::ApiClient;
use vellum::config::PipelineConfig;
use vellum::logging::MetricsCollector;
use vellum::push::{EventStream, EventStreamConfig};
use vellum::recorder::webm::WebmWriter;
use vellum::recorder::MediaSource;
use vellum::session::{
    SessionPhase, VoiceSessionController, VoiceSessionEvent, VoiceSessionOptions,
};
use vellum::tts::NullSink;
use vellum::VellumResult;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Media source that emits a short WebM take and idles until stopped.
struct FixedTake {
    clusters: usize,
    sender: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
}

impl FixedTake {
    fn new(clusters: usize) -> Self {
        Self {
            clusters,
            sender: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl MediaSource for FixedTake {
    async fn start(&mut self) -> VellumResult<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(64);
        let mut writer = WebmWriter::new(48_000, 1);
        tx.send(writer.init_segment()).await.ok();
        for i in 0..self.clusters {
            tx.send(writer.cluster(&[(i as i16 + 1) * 50; 480])).await.ok();
        }
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    async fn stop(&mut self) {
        self.sender.lock().unwrap().take();
    }

    fn mime_type(&self) -> &str {
        "audio/webm"
    }
}

fn sse(events: &[(&str, &str)]) -> String {
    events
        .iter()
        .map(|(name, data)| format!("event: {}\ndata: {}\n\n", name, data))
        .collect()
}

fn wav_fixture() -> Vec<u8> {
    let mut wav = Vec::new();
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::new(std::io::Cursor::new(&mut wav), spec).unwrap();
    for _ in 0..80 {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();
    wav
}

fn fast_config(server_url: &str) -> PipelineConfig {
    PipelineConfig {
        chunk_interval: Duration::from_millis(40),
        settle_delay: Duration::from_millis(20),
        poll_interval: Duration::from_millis(20),
        upload_backoff_base: Duration::from_millis(10),
        reconnect_delay: Duration::from_millis(100),
        first_chunk_timeout: Duration::from_millis(500),
        error_flag_duration: Duration::from_millis(100),
        ..PipelineConfig::default()
    }
    .with_base_url(server_url)
}

async fn mount_happy_turn(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/drafts/streaming/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "draft_id": 7,
            "session_id": "sess-abc"
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drafts/streaming/sess-abc/audio-chunk"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drafts/streaming/sess-abc/finalize"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sse/drafts/sess-abc/transcription-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(&[
                    ("chunk_complete", r#"{"chunk_index":0,"text":"hello world"}"#),
                    ("content_update", r#"{"content":"hello world"}"#),
                    ("all_complete", r#"{"content":"hello world."}"#),
                ]))
                // Past the stop flow: completion lands while finalizing
                .set_delay(Duration::from_millis(400)),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reflect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "user_node_id": 41,
            "llm_node_id": 42
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/nodes/42/llm-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "completed",
            "progress": 100,
            "content": "You said: hello world."
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/nodes/42/tts"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sse/nodes/42/tts-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(&[
                    (
                        "chunk_ready",
                        r#"{"chunk_index":0,"audio_url":"/audio/a1.wav","duration":2.1}"#,
                    ),
                    (
                        "chunk_ready",
                        r#"{"chunk_index":1,"audio_url":"/audio/a2.wav","duration":1.5}"#,
                    ),
                    ("all_complete", r#"{"tts_url":"/audio/full.wav"}"#),
                ]))
                .set_delay(Duration::from_millis(40)),
        )
        .mount(server)
        .await;
    for name in ["a1.wav", "a2.wav"] {
        Mock::given(method("GET"))
            .and(path(format!("/audio/{}", name)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(wav_fixture()))
            .mount(server)
            .await;
    }
}

/// Happy path: record, transcribe, reflect, synthesize, play. The phase
/// trace is exactly ready → recording → processing → playback.
#[tokio::test]
async fn happy_path_phase_trace() {
    let server = MockServer::start().await;
    mount_happy_turn(&server).await;

    let config = fast_config(&server.uri());
    let client = ApiClient::new(&config, MetricsCollector::new()).unwrap();
    let (controller, mut events) = VoiceSessionController::spawn(
        client,
        config,
        Box::new(|| Box::new(FixedTake::new(2))),
        Box::new(NullSink::new()),
        VoiceSessionOptions::default(),
        MetricsCollector::new(),
    );

    assert_eq!(controller.phase(), SessionPhase::Ready);
    let mut phase_rx = controller.subscribe_phase();
    controller.start_recording();

    let mut trace = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut finished = false;
    while !finished {
        tokio::select! {
            changed = phase_rx.changed() => {
                changed.expect("phase channel closed");
                let phase = *phase_rx.borrow_and_update();
                trace.push(phase);
                match phase {
                    SessionPhase::Recording if !finished => {
                        // Give the recorder a couple of timeslices
                        tokio::time::sleep(Duration::from_millis(120)).await;
                        controller.finish_recording();
                    }
                    SessionPhase::Playback => finished = true,
                    _ => {}
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                panic!("never reached playback; trace so far: {:?}", trace);
            }
        }
    }

    assert_eq!(
        trace,
        vec![
            SessionPhase::Recording,
            SessionPhase::Processing,
            SessionPhase::Playback
        ]
    );

    let mut transcript = None;
    let mut llm_reply = None;
    while let Ok(event) = events.try_recv() {
        match event {
            VoiceSessionEvent::TranscriptUpdated { transcript: t } => transcript = Some(t),
            VoiceSessionEvent::LlmCompleted { content, .. } => llm_reply = Some(content),
            VoiceSessionEvent::ErrorFlag { message } => panic!("unexpected error: {}", message),
            _ => {}
        }
    }
    assert_eq!(transcript.as_deref(), Some("hello world."));
    assert_eq!(llm_reply.as_deref(), Some("You said: hello world."));

    let thread = controller.thread();
    assert_eq!(thread.current_parent_node_id, Some(42));
    assert_eq!(thread.last_user_node_id, Some(41));
}

/// Push disconnect mid-stream: the reopened subscription carries
/// `?last_chunk=<highest seen>` and the handler set sees the union of both
/// connections without duplicates.
#[tokio::test]
async fn reconnect_resumes_with_last_chunk_hint() {
    let server = MockServer::start().await;

    // Replay connection, matched first: serves chunk 3 onward
    Mock::given(method("GET"))
        .and(path("/api/sse/drafts/sess-1/transcription-stream"))
        .and(query_param("last_chunk", "2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(&[(
                    "chunk_complete",
                    r#"{"chunk_index":3,"text":"four"}"#,
                )])),
        )
        .mount(&server)
        .await;
    // First connection: chunks 0..=2, then the stream dies
    Mock::given(method("GET"))
        .and(path("/api/sse/drafts/sess-1/transcription-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(&[
                    ("chunk_complete", r#"{"chunk_index":0,"text":"one"}"#),
                    ("chunk_complete", r#"{"chunk_index":1,"text":"two"}"#),
                    ("chunk_complete", r#"{"chunk_index":2,"text":"three"}"#),
                ])),
        )
        .mount(&server)
        .await;

    let config = fast_config(&server.uri());
    let client = ApiClient::new(&config, MetricsCollector::new()).unwrap();

    // Index-deduplicated assembly fed by the handler, exactly as the
    // orchestrator wires it
    let seen: Arc<Mutex<std::collections::BTreeMap<u64, String>>> =
        Arc::new(Mutex::new(std::collections::BTreeMap::new()));
    let last_index: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));

    let url_client = client.clone();
    let last_for_url = last_index.clone();
    let mut stream = EventStream::new(
        client,
        move || {
            let last = *last_for_url.lock().unwrap();
            url_client.transcription_stream_url("sess-1", last)
        },
        EventStreamConfig {
            reconnect_delay: Duration::from_millis(100),
            ..EventStreamConfig::default()
        },
        MetricsCollector::new(),
    );

    let seen_for_handler = seen.clone();
    let last_for_handler = last_index.clone();
    stream.on("chunk_complete", move |value| {
        let index = value["chunk_index"].as_u64().unwrap();
        let text = value["text"].as_str().unwrap().to_string();
        seen_for_handler.lock().unwrap().insert(index, text);
        let mut last = last_for_handler.lock().unwrap();
        *last = Some(last.map_or(index, |l| l.max(index)));
    });
    stream.connect();

    // First body, reconnect delay, replay body
    tokio::time::sleep(Duration::from_millis(600)).await;
    stream.disconnect();

    let chunks = seen.lock().unwrap().clone();
    assert_eq!(
        chunks.keys().copied().collect::<Vec<_>>(),
        vec![0, 1, 2, 3],
        "union of both connections, no gaps"
    );
    assert_eq!(chunks[&3], "four");

    // The replay request actually carried the resume hint
    let requests = server.received_requests().await.unwrap();
    assert!(requests
        .iter()
        .any(|r| r.url.query().unwrap_or("").contains("last_chunk=2")));
}

/// Silent connection death: no events at all within 3x the heartbeat
/// interval forces a watchdog reconnect.
#[tokio::test]
async fn stale_connection_watchdog_forces_reconnect() {
    let server = MockServer::start().await;
    // The server accepts the connection but never sends anything
    Mock::given(method("GET"))
        .and(path("/api/sse/drafts/sess-2/transcription-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let config = fast_config(&server.uri());
    let client = ApiClient::new(&config, MetricsCollector::new()).unwrap();
    let url_client = client.clone();
    let metrics = MetricsCollector::new();
    let mut stream = EventStream::new(
        client,
        move || url_client.transcription_stream_url("sess-2", None),
        EventStreamConfig {
            reconnect_delay: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(100),
            watchdog_interval: Duration::from_millis(50),
        },
        metrics.clone(),
    );
    stream.connect();

    // Stale threshold is 300ms here; give the watchdog a few rounds
    tokio::time::sleep(Duration::from_millis(1500)).await;
    stream.disconnect();

    let requests = server.received_requests().await.unwrap();
    assert!(
        requests.len() >= 2,
        "watchdog should have torn down and reopened the channel, saw {} requests",
        requests.len()
    );
}
