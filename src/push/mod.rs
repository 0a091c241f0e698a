//! Event-push subscription over server-sent events.
//!
//! Maintains a long-lived push channel, dispatches named JSON events to
//! registered handlers, reconnects automatically, and tears down silently
//! dead connections. The subscription URL is resolved through a closure at
//! every (re)connect so consumers can append a resume hint just before the
//! channel reopens.

use crate::api::ApiClient;
use crate::logging::MetricsCollector;
use futures_util::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Handler for one named event. Invoked on the subscription driver task;
/// keep it non-blocking.
pub type EventHandler = Box<dyn Fn(serde_json::Value) + Send + Sync>;

/// Catch-all handler receiving `(event_name, payload)`.
pub type DefaultHandler = Box<dyn Fn(&str, serde_json::Value) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    /// Delay before reopening a closed channel.
    pub reconnect_delay: Duration,
    /// Server heartbeat cadence; silence past 3x this is a dead connection.
    pub heartbeat_interval: Duration,
    /// Watchdog poll cadence.
    pub watchdog_interval: Duration,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(15),
            watchdog_interval: Duration::from_secs(10),
        }
    }
}

impl EventStreamConfig {
    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

struct Registry {
    by_name: Mutex<HashMap<String, EventHandler>>,
    default: Mutex<Option<DefaultHandler>>,
}

/// One push subscription. Owned by exactly one consumer; never shared.
pub struct EventStream {
    client: ApiClient,
    url_resolver: Arc<dyn Fn() -> String + Send + Sync>,
    config: EventStreamConfig,
    registry: Arc<Registry>,
    enabled: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    last_event_at: Arc<Mutex<Instant>>,
    last_event_name: Arc<Mutex<Option<String>>>,
    last_error: Arc<Mutex<Option<String>>>,
    reconnect_now: Arc<Notify>,
    driver: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    metrics: MetricsCollector,
}

impl EventStream {
    pub fn new(
        client: ApiClient,
        url_resolver: impl Fn() -> String + Send + Sync + 'static,
        config: EventStreamConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            client,
            url_resolver: Arc::new(url_resolver),
            config,
            registry: Arc::new(Registry {
                by_name: Mutex::new(HashMap::new()),
                default: Mutex::new(None),
            }),
            enabled: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            last_event_at: Arc::new(Mutex::new(Instant::now())),
            last_event_name: Arc::new(Mutex::new(None)),
            last_error: Arc::new(Mutex::new(None)),
            reconnect_now: Arc::new(Notify::new()),
            driver: None,
            watchdog: None,
            metrics,
        }
    }

    /// Register (or replace) the handler for a named event. Swapping a
    /// handler never touches the connection: the channel lifecycle depends
    /// only on the URL and the enabled flag.
    pub fn on(&self, event: &str, handler: impl Fn(serde_json::Value) + Send + Sync + 'static) {
        self.registry
            .by_name
            .lock()
            .expect("handler registry mutex poisoned")
            .insert(event.to_string(), Box::new(handler));
    }

    /// Register the catch-all handler for events without a named handler.
    pub fn on_any(&self, handler: impl Fn(&str, serde_json::Value) + Send + Sync + 'static) {
        *self
            .registry
            .default
            .lock()
            .expect("default handler mutex poisoned") = Some(Box::new(handler));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last error mutex").clone()
    }

    pub fn last_event_name(&self) -> Option<String> {
        self.last_event_name
            .lock()
            .expect("last event mutex")
            .clone()
    }

    /// Open the channel and keep it open until [`disconnect`](Self::disconnect).
    pub fn connect(&mut self) {
        if self.enabled.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.last_event_at.lock().expect("last event at mutex") = Instant::now();

        self.driver = Some(tokio::spawn(drive(
            self.client.clone(),
            self.url_resolver.clone(),
            self.config.clone(),
            self.registry.clone(),
            self.enabled.clone(),
            self.connected.clone(),
            self.last_event_at.clone(),
            self.last_event_name.clone(),
            self.last_error.clone(),
            self.reconnect_now.clone(),
            self.metrics.clone(),
        )));
        self.watchdog = Some(tokio::spawn(watch(
            self.config.clone(),
            self.enabled.clone(),
            self.last_event_at.clone(),
            self.reconnect_now.clone(),
            self.metrics.clone(),
        )));
    }

    /// Close the channel. No reconnection happens while disconnected.
    /// Idempotent.
    pub fn disconnect(&mut self) {
        self.enabled.store(false, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    client: ApiClient,
    url_resolver: Arc<dyn Fn() -> String + Send + Sync>,
    config: EventStreamConfig,
    registry: Arc<Registry>,
    enabled: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    last_event_at: Arc<Mutex<Instant>>,
    last_event_name: Arc<Mutex<Option<String>>>,
    last_error: Arc<Mutex<Option<String>>>,
    reconnect_now: Arc<Notify>,
    metrics: MetricsCollector,
) {
    let mut first_connect = true;
    loop {
        if !enabled.load(Ordering::Acquire) {
            break;
        }
        if !first_connect {
            tokio::time::sleep(config.reconnect_delay).await;
            if !enabled.load(Ordering::Acquire) {
                break;
            }
            metrics.push_reconnected();
        }
        first_connect = false;

        // Resolved now, not at subscribe time: resume hints appended by the
        // consumer are picked up here
        let url = (url_resolver)();
        tracing::debug!(%url, "Opening push stream");

        let mut source = match EventSource::new(client.get_request(&url)) {
            Ok(source) => source,
            Err(e) => {
                tracing::error!("Failed to build push request: {}", e);
                *last_error.lock().expect("last error mutex") = Some(e.to_string());
                continue;
            }
        };

        loop {
            let step = tokio::select! {
                _ = reconnect_now.notified() => None,
                next = source.next() => Some(next),
            };

            match step {
                // Watchdog fired: tear the channel down and reopen
                None => {
                    tracing::info!("Forced reconnect (stale connection)");
                    source.close();
                    break;
                }
                Some(Some(Ok(Event::Open))) => {
                    connected.store(true, Ordering::Release);
                    *last_event_at.lock().expect("last event at mutex") = Instant::now();
                    tracing::info!("Push stream connected");
                }
                Some(Some(Ok(Event::Message(message)))) => {
                    connected.store(true, Ordering::Release);
                    *last_event_at.lock().expect("last event at mutex") = Instant::now();
                    *last_event_name.lock().expect("last event mutex") =
                        Some(message.event.clone());
                    metrics.push_event_received();
                    dispatch(&registry, &message.event, &message.data);
                }
                Some(Some(Err(e))) => {
                    tracing::debug!("Push stream closed: {}", e);
                    *last_error.lock().expect("last error mutex") = Some(e.to_string());
                    source.close();
                    break;
                }
                Some(None) => break,
            }
        }

        connected.store(false, Ordering::Release);
    }
}

async fn watch(
    config: EventStreamConfig,
    enabled: Arc<AtomicBool>,
    last_event_at: Arc<Mutex<Instant>>,
    reconnect_now: Arc<Notify>,
    metrics: MetricsCollector,
) {
    let threshold = config.stale_threshold();
    let mut ticker = tokio::time::interval(config.watchdog_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !enabled.load(Ordering::Acquire) {
            break;
        }
        let idle = last_event_at
            .lock()
            .expect("last event at mutex poisoned")
            .elapsed();
        if idle > threshold {
            metrics.stale_connection_detected();
            tracing::warn!(
                idle_secs = idle.as_secs(),
                "No push events within stale threshold; forcing reconnect"
            );
            // Rearm so the next check waits a full threshold again
            *last_event_at.lock().expect("last event at mutex poisoned") = Instant::now();
            reconnect_now.notify_one();
        }
    }
}

fn dispatch(registry: &Registry, event: &str, data: &str) {
    if data.trim().is_empty() {
        tracing::debug!(event, "Skipping event with empty payload");
        return;
    }

    let payload: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(event, error = %e, "Skipping malformed push payload");
            return;
        }
    };

    let handlers = registry
        .by_name
        .lock()
        .expect("handler registry mutex poisoned");
    if let Some(handler) = handlers.get(event) {
        handler(payload);
        return;
    }
    drop(handlers);

    if let Some(default) = registry
        .default
        .lock()
        .expect("default handler mutex poisoned")
        .as_ref()
    {
        default(event, payload);
    } else {
        tracing::trace!(event, "No handler registered for event");
    }
}
