//! Async LLM turn dispatch.
//!
//! Posts a finished transcript to a workflow endpoint, receives the pending
//! LLM node id, and tracks the job through the status poller until it
//! completes or fails.

use crate::api::{ApiClient, LlmStatus, Workflow, WorkflowRequest, WorkflowResponse};
use crate::config::PipelineConfig;
use crate::error::VellumResult;
use crate::logging::MetricsCollector;
use crate::poller::{PollerConfig, StatusPoller};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outcome notifications for a dispatched turn.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Progress { node_id: i64, progress: u8 },
    Completed { node_id: i64, content: String },
    Failed { node_id: i64, error: String },
}

/// Dispatches user turns to LLM workflows and polls the resulting job.
pub struct LlmDispatcher {
    client: ApiClient,
    metrics: MetricsCollector,
    poller: StatusPoller,
    event_tx: mpsc::UnboundedSender<LlmEvent>,
    watch_task: Option<JoinHandle<()>>,
}

impl LlmDispatcher {
    pub fn new(
        client: ApiClient,
        config: &PipelineConfig,
        metrics: MetricsCollector,
    ) -> (Self, mpsc::UnboundedReceiver<LlmEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let poller = StatusPoller::new(
            client.clone(),
            PollerConfig {
                interval: config.poll_interval,
                request_timeout: config.poll_request_timeout,
                max_duration: config.poll_max_duration,
            },
        );
        (
            Self {
                client,
                metrics,
                poller,
                event_tx,
                watch_task: None,
            },
            event_rx,
        )
    }

    /// Post a turn to the workflow endpoint and start polling the returned
    /// LLM node.
    pub async fn dispatch(
        &mut self,
        workflow: &Workflow,
        content: &str,
        parent_id: Option<i64>,
        session_id: Option<String>,
    ) -> VellumResult<WorkflowResponse> {
        let response = self
            .client
            .trigger_workflow(
                workflow,
                &WorkflowRequest {
                    content: content.to_string(),
                    parent_id,
                    session_id,
                },
            )
            .await?;

        tracing::info!(
            user_node_id = response.user_node_id,
            llm_node_id = response.llm_node_id,
            workflow = %workflow.path(),
            "Turn dispatched"
        );
        self.attach(response.llm_node_id);
        Ok(response)
    }

    /// Start polling an existing LLM node. Also the resume path after a
    /// refresh mid-processing: no new dispatch, just rejoin the job.
    pub fn attach(&mut self, llm_node_id: i64) {
        self.cancel();

        self.poller
            .set_endpoint(Some(self.client.llm_status_url(llm_node_id)));
        self.poller.start_polling();

        let mut updates = self.poller.subscribe();
        let event_tx = self.event_tx.clone();
        let metrics = self.metrics.clone();
        self.watch_task = Some(tokio::spawn(async move {
            let mut last_progress: Option<u8> = None;
            loop {
                if updates.changed().await.is_err() {
                    break;
                }
                let snapshot = updates.borrow().clone();

                if let Some(progress) = snapshot.progress {
                    if last_progress != Some(progress) {
                        last_progress = Some(progress);
                        let _ = event_tx.send(LlmEvent::Progress {
                            node_id: llm_node_id,
                            progress,
                        });
                    }
                }

                match snapshot.status {
                    Some(LlmStatus::Completed) => {
                        metrics.llm_job_completed();
                        let content = snapshot
                            .data
                            .and_then(|data| data.content)
                            .unwrap_or_default();
                        let _ = event_tx.send(LlmEvent::Completed {
                            node_id: llm_node_id,
                            content,
                        });
                        break;
                    }
                    Some(LlmStatus::Failed) => {
                        metrics.llm_job_failed();
                        let error = snapshot
                            .error
                            .unwrap_or_else(|| "LLM generation failed".to_string());
                        let _ = event_tx.send(LlmEvent::Failed {
                            node_id: llm_node_id,
                            error,
                        });
                        break;
                    }
                    _ => {
                        // Poll-lifetime exhaustion surfaces as a failure too
                        if !snapshot.is_polling {
                            if let Some(error) = snapshot.error {
                                metrics.llm_job_failed();
                                let _ = event_tx.send(LlmEvent::Failed {
                                    node_id: llm_node_id,
                                    error,
                                });
                                break;
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Stop tracking the current job. The job itself keeps running
    /// server-side; a late completion is discarded by the poller's
    /// stale-endpoint guard. Idempotent.
    pub fn cancel(&mut self) {
        self.poller.set_endpoint(None);
        self.poller.stop_polling();
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_polling()
    }
}

impl Drop for LlmDispatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::payloads::llm;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher_for(server_url: &str) -> (LlmDispatcher, mpsc::UnboundedReceiver<LlmEvent>) {
        let config = PipelineConfig {
            poll_interval: Duration::from_millis(20),
            ..PipelineConfig::default()
        }
        .with_base_url(server_url);
        let client = ApiClient::new(&config, MetricsCollector::new()).unwrap();
        LlmDispatcher::new(client, &config, MetricsCollector::new())
    }

    #[tokio::test]
    async fn test_dispatch_then_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/reflect"))
            .and(body_string_contains("hello world"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "user_node_id": 41,
                "llm_node_id": 42
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nodes/42/llm-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm::status("processing", 40)))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nodes/42/llm-status"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(llm::completed("You said: hello world.")),
            )
            .mount(&server)
            .await;

        let (mut dispatcher, mut events) = dispatcher_for(&server.uri());
        let response = dispatcher
            .dispatch(&Workflow::Reflect, "hello world", None, None)
            .await
            .unwrap();
        assert_eq!(response.user_node_id, 41);
        assert_eq!(response.llm_node_id, 42);

        loop {
            match events.recv().await.unwrap() {
                LlmEvent::Completed { node_id, content } => {
                    assert_eq!(node_id, 42);
                    assert_eq!(content, "You said: hello world.");
                    break;
                }
                LlmEvent::Progress { node_id, .. } => assert_eq!(node_id, 42),
                LlmEvent::Failed { error, .. } => panic!("unexpected failure: {}", error),
            }
        }
        assert!(!dispatcher.is_polling());
    }

    #[tokio::test]
    async fn test_failed_job_surfaces_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orient"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "user_node_id": 1,
                "llm_node_id": 2
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nodes/2/llm-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm::failed("model exploded")))
            .mount(&server)
            .await;

        let (mut dispatcher, mut events) = dispatcher_for(&server.uri());
        dispatcher
            .dispatch(&Workflow::Orient, "content", Some(10), None)
            .await
            .unwrap();

        loop {
            if let LlmEvent::Failed { node_id, error } = events.recv().await.unwrap() {
                assert_eq!(node_id, 2);
                assert_eq!(error, "model exploded");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_attach_resumes_an_existing_job() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/42/llm-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm::completed("resumed")))
            .mount(&server)
            .await;

        let (mut dispatcher, mut events) = dispatcher_for(&server.uri());
        // No dispatch: rejoin node 42 directly
        dispatcher.attach(42);

        loop {
            if let LlmEvent::Completed { node_id, content } = events.recv().await.unwrap() {
                assert_eq!(node_id, 42);
                assert_eq!(content, "resumed");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_tracking() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/5/llm-status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(100))
                    .set_body_json(llm::completed("late")),
            )
            .mount(&server)
            .await;

        let (mut dispatcher, mut events) = dispatcher_for(&server.uri());
        dispatcher.attach(5);
        tokio::time::sleep(Duration::from_millis(30)).await;
        dispatcher.cancel();
        dispatcher.cancel(); // idempotent

        // The late completion must not surface
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(events.try_recv().is_err());
        assert!(!dispatcher.is_polling());
    }
}
