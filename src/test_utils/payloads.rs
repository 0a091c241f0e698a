//! Mock backend payload factories.

use serde_json::json;

/// Transcription push stream payloads.
pub mod transcription {
    use super::*;

    pub fn chunk_complete(chunk_index: u64, text: &str) -> String {
        json!({ "chunk_index": chunk_index, "text": text }).to_string()
    }

    pub fn content_update(content: &str) -> String {
        json!({ "content": content }).to_string()
    }

    pub fn all_complete(content: &str) -> String {
        json!({ "content": content }).to_string()
    }

    pub fn chunk_error(chunk_index: u64, error: &str) -> String {
        json!({ "chunk_index": chunk_index, "error": error }).to_string()
    }
}

/// TTS push stream payloads.
pub mod tts {
    use super::*;

    pub fn chunk_ready(chunk_index: u64, audio_url: &str, duration: f64) -> String {
        json!({
            "chunk_index": chunk_index,
            "audio_url": audio_url,
            "duration": duration
        })
        .to_string()
    }

    pub fn all_complete(tts_url: &str) -> String {
        json!({ "tts_url": tts_url }).to_string()
    }
}

/// LLM status endpoint bodies.
pub mod llm {
    use super::*;

    pub fn status(status: &str, progress: u8) -> serde_json::Value {
        json!({ "status": status, "progress": progress })
    }

    pub fn completed(content: &str) -> serde_json::Value {
        json!({ "status": "completed", "progress": 100, "content": content })
    }

    pub fn failed(error: &str) -> serde_json::Value {
        json!({ "status": "failed", "error": error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_complete_payload_parses_back() {
        let raw = transcription::chunk_complete(3, "hello");
        let parsed: crate::api::TranscriptChunkPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.chunk_index, 3);
        assert_eq!(parsed.text, "hello");
    }

    #[test]
    fn test_tts_chunk_ready_payload_parses_back() {
        let raw = tts::chunk_ready(0, "/audio/a1.wav", 2.1);
        let parsed: crate::api::TtsChunkReadyPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.audio_url, "/audio/a1.wav");
    }

    #[test]
    fn test_llm_status_bodies_parse_back() {
        let completed: crate::api::LlmStatusResponse =
            serde_json::from_value(llm::completed("done")).unwrap();
        assert_eq!(completed.content.as_deref(), Some("done"));

        let failed: crate::api::LlmStatusResponse =
            serde_json::from_value(llm::failed("model exploded")).unwrap();
        assert_eq!(failed.error.as_deref(), Some("model exploded"));
    }
}
