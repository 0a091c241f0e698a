//! Test doubles and payload factories shared across unit tests.

pub mod payloads;

use crate::error::VellumResult;
use crate::recorder::webm::WebmWriter;
use crate::recorder::MediaSource;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Render events as an SSE response body.
pub fn sse_body(events: &[(&str, String)]) -> String {
    events
        .iter()
        .map(|(name, data)| format!("event: {}\ndata: {}\n\n", name, data))
        .collect()
}

/// What a [`ScriptedSource`] emits once started.
#[derive(Clone)]
pub struct SourceScript {
    clusters: usize,
}

impl SourceScript {
    /// A WebM stream: init segment followed by `clusters` PCM clusters,
    /// all delivered immediately on start.
    pub fn webm(clusters: usize) -> Self {
        Self { clusters }
    }
}

/// Media source that plays a fixed script and then idles until stopped.
pub struct ScriptedSource {
    script: SourceScript,
    sender: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    paused: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(script: SourceScript) -> Self {
        Self {
            script,
            sender: Arc::new(Mutex::new(None)),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl MediaSource for ScriptedSource {
    async fn start(&mut self) -> VellumResult<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(64);

        let mut writer = WebmWriter::new(48_000, 1);
        tx.send(writer.init_segment()).await.ok();
        for i in 0..self.script.clusters {
            let sample = (i as i16 + 1) * 100;
            tx.send(writer.cluster(&[sample; 480])).await.ok();
        }

        // Keep the channel open until stop: the recorder treats the close
        // as the terminal delivery
        *self.sender.lock().expect("scripted source mutex") = Some(tx);
        Ok(rx)
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    async fn stop(&mut self) {
        self.sender.lock().expect("scripted source mutex").take();
    }

    fn mime_type(&self) -> &str {
        "audio/webm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_body_framing() {
        let body = sse_body(&[
            ("heartbeat", "{}".to_string()),
            ("content_update", r#"{"content":"hi"}"#.to_string()),
        ]);
        assert_eq!(
            body,
            "event: heartbeat\ndata: {}\n\nevent: content_update\ndata: {\"content\":\"hi\"}\n\n"
        );
    }

    #[tokio::test]
    async fn test_scripted_source_emits_header_then_clusters() {
        let mut source = ScriptedSource::new(SourceScript::webm(2));
        let mut rx = source.start().await.unwrap();

        let header = rx.recv().await.unwrap();
        assert!(header.starts_with(&crate::recorder::webm::EBML_MAGIC));
        let cluster = rx.recv().await.unwrap();
        assert!(cluster.starts_with(&crate::recorder::webm::CLUSTER_ID));

        source.stop().await;
        // Remaining cluster, then closed
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
