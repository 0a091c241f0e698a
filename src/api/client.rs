use crate::api::types::*;
use crate::config::PipelineConfig;
use crate::error::{VellumError, VellumResult};
use crate::logging::MetricsCollector;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// HTTP client for the journaling backend. One shared reqwest client; the
/// per-request timeouts of the pipeline are set call-site by call-site.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    metrics: MetricsCollector,
}

impl ApiClient {
    pub fn new(config: &PipelineConfig, metrics: MetricsCollector) -> VellumResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            auth_token: config.auth_token.clone(),
            metrics,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a possibly-relative URL (audio chunk URLs arrive relative).
    pub fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    /// Build an authorized GET used by push subscriptions; the event-source
    /// layer drives the request itself.
    pub fn get_request(&self, url: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(url))
    }

    async fn check_status(response: reqwest::Response) -> VellumResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(VellumError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn post_json<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> VellumResult<T> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(%url, "POST");

        let timer = crate::logging::TimedOperation::new();
        let result = self
            .authorize(self.http.post(&url))
            .json(body)
            .send()
            .await;

        match result {
            Ok(response) => {
                let response = Self::check_status(response).await?;
                let parsed = response.json::<T>().await?;
                tracing::debug!(latency_ms = timer.elapsed().as_millis() as u64, %url, "POST ok");
                Ok(parsed)
            }
            Err(e) => {
                tracing::error!(%url, error = %e, "POST failed");
                Err(e.into())
            }
        }
    }

    async fn post_empty<B: serde::Serialize>(&self, path: &str, body: &B) -> VellumResult<()> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(%url, "POST");
        let response = self
            .authorize(self.http.post(&url))
            .json(body)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    // Draft streaming

    pub async fn init_streaming(
        &self,
        request: &InitStreamingRequest,
    ) -> VellumResult<InitStreamingResponse> {
        self.post_json("/drafts/streaming/init", request).await
    }

    /// Upload one audio chunk. A single attempt; retry policy lives with the
    /// uploader.
    pub async fn upload_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        data: Vec<u8>,
        mime_type: &str,
        timeout: Duration,
    ) -> VellumResult<()> {
        let url = format!(
            "{}/drafts/streaming/{}/audio-chunk",
            self.base_url, session_id
        );

        let part = reqwest::multipart::Part::bytes(data)
            .file_name(format!("chunk-{}.webm", chunk_index))
            .mime_str(mime_type)
            .map_err(|e| VellumError::Generic(format!("Invalid mime type: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .part("chunk", part)
            .text("chunk_index", chunk_index.to_string());

        let response = self
            .authorize(self.http.post(&url))
            .multipart(form)
            .timeout(timeout)
            .send()
            .await?;
        Self::check_status(response).await?;
        self.metrics.chunk_uploaded();
        Ok(())
    }

    pub async fn finalize_streaming(
        &self,
        session_id: &str,
        total_chunks: u32,
    ) -> VellumResult<()> {
        self.post_empty(
            &format!("/drafts/streaming/{}/finalize", session_id),
            &FinalizeRequest { total_chunks },
        )
        .await
    }

    pub async fn save_as_node(&self, session_id: &str, content: &str) -> VellumResult<NodeRecord> {
        self.post_json(
            &format!("/drafts/streaming/{}/save-as-node", session_id),
            &SaveAsNodeRequest {
                content: content.to_string(),
            },
        )
        .await
    }

    // LLM workflows

    pub async fn trigger_workflow(
        &self,
        workflow: &Workflow,
        request: &WorkflowRequest,
    ) -> VellumResult<WorkflowResponse> {
        self.metrics.llm_job_dispatched();
        self.post_json(&workflow.path(), request).await
    }

    pub fn llm_status_url(&self, node_id: i64) -> String {
        format!("{}/nodes/{}/llm-status", self.base_url, node_id)
    }

    /// One status poll against an absolute endpoint URL. `Cache-Control:
    /// no-cache` defeats intermediate caches that would replay a stale
    /// pending status.
    pub async fn poll_status(
        &self,
        endpoint: &str,
        timeout: Duration,
    ) -> VellumResult<LlmStatusResponse> {
        self.metrics.llm_poll_issued();
        let response = self
            .authorize(self.http.get(endpoint))
            .header("Cache-Control", "no-cache")
            .timeout(timeout)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn trigger_tts(&self, node_id: i64) -> VellumResult<()> {
        self.post_empty(&format!("/nodes/{}/tts", node_id), &serde_json::json!({}))
            .await
    }

    /// Fetch a synthesized audio chunk by URL (absolute or backend-relative).
    pub async fn fetch_audio(&self, url: &str) -> VellumResult<Vec<u8>> {
        let url = self.resolve_url(url);
        let response = self.authorize(self.http.get(&url)).send().await?;
        let response = Self::check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // Push stream URLs

    pub fn transcription_stream_url(&self, session_id: &str, last_chunk: Option<u64>) -> String {
        match last_chunk {
            Some(index) => format!(
                "{}/api/sse/drafts/{}/transcription-stream?last_chunk={}",
                self.base_url, session_id, index
            ),
            None => format!(
                "{}/api/sse/drafts/{}/transcription-stream",
                self.base_url, session_id
            ),
        }
    }

    pub fn tts_stream_url(&self, node_id: i64) -> String {
        format!("{}/api/sse/nodes/{}/tts-stream", self.base_url, node_id)
    }
}
