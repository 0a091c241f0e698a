use serde::{Deserialize, Serialize};

/// Visibility of a journal entry once saved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    #[default]
    Private,
    Circles,
    Public,
}

/// How the entry may be used by AI features.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AiUsage {
    None,
    #[default]
    Chat,
    Train,
}

/// `POST /drafts/streaming/init`
#[derive(Debug, Clone, Serialize)]
pub struct InitStreamingRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    pub privacy_level: PrivacyLevel,
    pub ai_usage: AiUsage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitStreamingResponse {
    pub draft_id: i64,
    pub session_id: String,
}

/// `POST /drafts/streaming/{session_id}/finalize`
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeRequest {
    pub total_chunks: u32,
}

/// `POST /drafts/streaming/{session_id}/save-as-node`
#[derive(Debug, Clone, Serialize)]
pub struct SaveAsNodeRequest {
    pub content: String,
}

/// A persisted journal node (draft promoted, user turn, or LLM reply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// LLM workflow selection; each maps to a backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workflow {
    Reflect,
    Orient,
    ConverseStart,
    ConverseContinue(i64),
}

impl Workflow {
    pub fn path(&self) -> String {
        match self {
            Workflow::Reflect => "/reflect".to_string(),
            Workflow::Orient => "/orient".to_string(),
            Workflow::ConverseStart => "/converse/start".to_string(),
            Workflow::ConverseContinue(conversation_id) => {
                format!("/converse/{}/message", conversation_id)
            }
        }
    }
}

/// `POST /{workflow}`
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRequest {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowResponse {
    pub user_node_id: i64,
    pub llm_node_id: i64,
    #[serde(default)]
    pub conversation_id: Option<i64>,
}

/// Status of an asynchronous LLM job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl LlmStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LlmStatus::Completed | LlmStatus::Failed)
    }
}

/// `GET /nodes/{id}/llm-status`
#[derive(Debug, Clone, Deserialize)]
pub struct LlmStatusResponse {
    pub status: LlmStatus,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// Push payloads: transcription stream

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptChunkPayload {
    pub chunk_index: u64,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentUpdatePayload {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionCompletePayload {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkErrorPayload {
    #[serde(default)]
    pub chunk_index: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamErrorPayload {
    #[serde(default)]
    pub error: Option<String>,
}

// Push payloads: TTS stream

#[derive(Debug, Clone, Deserialize)]
pub struct TtsChunkReadyPayload {
    pub chunk_index: u64,
    pub audio_url: String,
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtsCompletePayload {
    #[serde(default)]
    pub tts_url: Option<String>,
}
