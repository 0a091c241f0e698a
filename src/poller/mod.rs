//! Polling driver for long-running backend jobs.
//!
//! Polls a status endpoint on a fixed cadence until the job reaches a
//! terminal state or the total polling lifetime is exhausted. Responses that
//! arrive after the consumer has switched endpoints are discarded so a
//! previous job's completion can never overwrite a new job's state.

use crate::api::{ApiClient, LlmStatus, LlmStatusResponse};
use crate::error::VellumError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub request_timeout: Duration,
    /// Hard cap on total polling lifetime.
    pub max_duration: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1500),
            request_timeout: Duration::from_secs(10),
            max_duration: Duration::from_secs(30 * 60),
        }
    }
}

/// Observable poller state.
#[derive(Debug, Clone, Default)]
pub struct PollerSnapshot {
    pub status: Option<LlmStatus>,
    pub progress: Option<u8>,
    pub data: Option<LlmStatusResponse>,
    pub error: Option<String>,
    pub is_polling: bool,
}

pub struct StatusPoller {
    client: ApiClient,
    config: PollerConfig,
    endpoint: Arc<Mutex<Option<String>>>,
    snapshot_tx: Arc<watch::Sender<PollerSnapshot>>,
    task: Option<JoinHandle<()>>,
}

impl StatusPoller {
    pub fn new(client: ApiClient, config: PollerConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(PollerSnapshot::default());
        Self {
            client,
            config,
            endpoint: Arc::new(Mutex::new(None)),
            snapshot_tx: Arc::new(snapshot_tx),
            task: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PollerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> PollerSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Point the poller at a status endpoint. `None` while polling stops the
    /// loop and resets state.
    pub fn set_endpoint(&self, endpoint: Option<String>) {
        *self.endpoint.lock().expect("endpoint mutex poisoned") = endpoint;
    }

    pub fn is_polling(&self) -> bool {
        self.snapshot_tx.borrow().is_polling
    }

    pub fn start_polling(&mut self) {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        self.snapshot_tx.send_replace(PollerSnapshot {
            is_polling: true,
            ..PollerSnapshot::default()
        });

        let client = self.client.clone();
        let config = self.config.clone();
        let endpoint = self.endpoint.clone();
        let snapshot_tx = self.snapshot_tx.clone();

        self.task = Some(tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let Some(dispatched) = endpoint
                    .lock()
                    .expect("endpoint mutex poisoned")
                    .clone()
                else {
                    // Endpoint cleared while polling: stop and reset
                    tracing::debug!("Poll endpoint cleared; stopping");
                    snapshot_tx.send_replace(PollerSnapshot::default());
                    return;
                };

                if started.elapsed() > config.max_duration {
                    tracing::warn!(
                        elapsed_secs = started.elapsed().as_secs(),
                        "Polling lifetime exhausted"
                    );
                    snapshot_tx.send_modify(|snapshot| {
                        snapshot.error = Some("task took too long".to_string());
                        snapshot.is_polling = false;
                    });
                    return;
                }

                match client
                    .poll_status(&dispatched, config.request_timeout)
                    .await
                {
                    Ok(response) => {
                        // The consumer may have switched jobs mid-flight;
                        // a response for the old endpoint must not land
                        let current = endpoint.lock().expect("endpoint mutex poisoned").clone();
                        if current.as_deref() != Some(dispatched.as_str()) {
                            tracing::debug!(endpoint = %dispatched, "Discarding stale poll response");
                            continue;
                        }

                        let terminal = response.status.is_terminal();
                        snapshot_tx.send_modify(|snapshot| {
                            snapshot.status = Some(response.status);
                            snapshot.progress = response.progress;
                            snapshot.error = response.error.clone();
                            snapshot.data = Some(response.clone());
                            snapshot.is_polling = !terminal;
                        });

                        if terminal {
                            tracing::info!(status = ?response.status, "Poll reached terminal status");
                            return;
                        }
                    }
                    // Transient failures never stop polling
                    Err(VellumError::Api { status, message }) => {
                        tracing::debug!(status, %message, "Poll request failed; will retry");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Poll request failed; will retry");
                    }
                }
            }
        }));
    }

    /// Stop polling without touching the last snapshot's data. Idempotent.
    pub fn stop_polling(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.is_polling = false;
        });
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::logging::MetricsCollector;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn poller_for(server_url: &str, interval_ms: u64) -> StatusPoller {
        let config = PipelineConfig::default().with_base_url(server_url);
        let client = ApiClient::new(&config, MetricsCollector::new()).unwrap();
        StatusPoller::new(
            client,
            PollerConfig {
                interval: Duration::from_millis(interval_ms),
                request_timeout: Duration::from_secs(2),
                max_duration: Duration::from_secs(10),
            },
        )
    }

    #[tokio::test]
    async fn test_polling_stops_on_terminal_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/1/llm-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "completed",
                "progress": 100,
                "content": "All done."
            })))
            .mount(&server)
            .await;

        let mut poller = poller_for(&server.uri(), 20);
        poller.set_endpoint(Some(format!("{}/nodes/1/llm-status", server.uri())));
        let mut updates = poller.subscribe();
        poller.start_polling();

        // Wait for the terminal update
        loop {
            updates.changed().await.unwrap();
            let snapshot = updates.borrow().clone();
            if snapshot.status == Some(LlmStatus::Completed) {
                assert!(!snapshot.is_polling);
                assert_eq!(
                    snapshot.data.unwrap().content.as_deref(),
                    Some("All done.")
                );
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_transient_errors_do_not_stop_polling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/2/llm-status"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nodes/2/llm-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "completed"
            })))
            .mount(&server)
            .await;

        let mut poller = poller_for(&server.uri(), 20);
        poller.set_endpoint(Some(format!("{}/nodes/2/llm-status", server.uri())));
        let mut updates = poller.subscribe();
        poller.start_polling();

        loop {
            updates.changed().await.unwrap();
            if updates.borrow().status == Some(LlmStatus::Completed) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_stale_response_is_discarded_after_endpoint_swap() {
        let server = MockServer::start().await;
        // Old job completes slowly
        Mock::given(method("GET"))
            .and(path("/nodes/10/llm-status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(150))
                    .set_body_json(serde_json::json!({
                        "status": "completed",
                        "content": "old job"
                    })),
            )
            .mount(&server)
            .await;
        // New job stays pending
        Mock::given(method("GET"))
            .and(path("/nodes/11/llm-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "pending"
            })))
            .mount(&server)
            .await;

        let mut poller = poller_for(&server.uri(), 30);
        poller.set_endpoint(Some(format!("{}/nodes/10/llm-status", server.uri())));
        poller.start_polling();

        // Swap endpoints while the first request is still in flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.set_endpoint(Some(format!("{}/nodes/11/llm-status", server.uri())));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = poller.snapshot();
        // The old job's completion must never land
        assert_ne!(snapshot.status, Some(LlmStatus::Completed));
        if let Some(data) = &snapshot.data {
            assert_ne!(data.content.as_deref(), Some("old job"));
        }
        poller.stop_polling();
    }

    #[tokio::test]
    async fn test_cleared_endpoint_resets_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/3/llm-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "processing",
                "progress": 10
            })))
            .mount(&server)
            .await;

        let mut poller = poller_for(&server.uri(), 20);
        poller.set_endpoint(Some(format!("{}/nodes/3/llm-status", server.uri())));
        poller.start_polling();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(poller.snapshot().status, Some(LlmStatus::Processing));

        poller.set_endpoint(None);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let snapshot = poller.snapshot();
        assert!(snapshot.status.is_none());
        assert!(!snapshot.is_polling);
    }

    #[tokio::test]
    async fn test_lifetime_cap_surfaces_timeout_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/4/llm-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "pending"
            })))
            .mount(&server)
            .await;

        let config = PipelineConfig::default().with_base_url(&server.uri());
        let client = ApiClient::new(&config, MetricsCollector::new()).unwrap();
        let mut poller = StatusPoller::new(
            client,
            PollerConfig {
                interval: Duration::from_millis(20),
                request_timeout: Duration::from_secs(2),
                max_duration: Duration::from_millis(100),
            },
        );
        poller.set_endpoint(Some(format!("{}/nodes/4/llm-status", server.uri())));
        let mut updates = poller.subscribe();
        poller.start_polling();

        loop {
            updates.changed().await.unwrap();
            let snapshot = updates.borrow().clone();
            if let Some(error) = snapshot.error {
                assert_eq!(error, "task took too long");
                assert!(!snapshot.is_polling);
                break;
            }
        }
    }
}
