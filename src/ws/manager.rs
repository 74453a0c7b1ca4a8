// =============================================================================
// WsManager — named websocket connections with reconnect and status fan-out
// =============================================================================
//
// Each connection runs in its own task: connect, read until close or error,
// then back off and retry. Back-off starts at the configured initial delay,
// multiplies by 1.5 per failed attempt, caps at the maximum, and resets on a
// successful open. Intentional closes (disconnect / shutdown / replacement by
// a newer connect) never trigger a reconnect.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error_monitor::{ErrorCategory, ErrorMonitor, ErrorSeverity};

/// Aggregate health over every managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnStatus {
    Connecting,
    Connected,
    Reconnecting,
}

/// Callbacks for one connection. All run on the connection task.
#[derive(Clone)]
pub struct WsHandlers {
    pub on_message: Arc<dyn Fn(&str) + Send + Sync>,
    pub on_open: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl WsHandlers {
    pub fn from_message_fn(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            on_message: Arc::new(f),
            on_open: None,
            on_close: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WsManagerConfig {
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for WsManagerConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_millis(1_000),
            max_reconnect_delay: Duration::from_millis(30_000),
            backoff_factor: 1.5,
        }
    }
}

impl WsManagerConfig {
    /// The delay to use after one more failed attempt.
    fn next_delay(&self, current: Duration) -> Duration {
        let scaled = current.as_millis() as f64 * self.backoff_factor;
        Duration::from_millis((scaled as u64).min(self.max_reconnect_delay.as_millis() as u64))
    }
}

struct ConnEntry {
    status: ConnStatus,
    /// Flipped to true to ask the connection task to close cleanly.
    cancel: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    /// Delay the task will wait before its next reconnect attempt, ms.
    current_delay_ms: Arc<AtomicU64>,
}

type StatusListener = Box<dyn Fn(OverallStatus) + Send + Sync>;

pub struct WsManager {
    connections: RwLock<HashMap<String, ConnEntry>>,
    config: WsManagerConfig,
    monitor: Arc<ErrorMonitor>,
    status_listeners: RwLock<Vec<StatusListener>>,
    shut_down: AtomicBool,
}

impl WsManager {
    pub fn new(config: WsManagerConfig, monitor: Arc<ErrorMonitor>) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            config,
            monitor,
            status_listeners: RwLock::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Open (or replace) the connection registered under `key`.
    ///
    /// Any previous connection under the same key is closed cleanly and its
    /// pending reconnect cancelled. No-op after `shutdown`.
    pub fn connect(self: &Arc<Self>, key: impl Into<String>, url: String, handlers: WsHandlers) {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!("connect refused: manager is shut down");
            return;
        }
        let key = key.into();
        self.remove_connection(&key);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let current_delay_ms =
            Arc::new(AtomicU64::new(self.config.initial_reconnect_delay.as_millis() as u64));

        let manager = self.clone();
        let task_key = key.clone();
        let delay_handle = current_delay_ms.clone();
        let task = tokio::spawn(async move {
            manager
                .run_connection(task_key, url, handlers, cancel_rx, delay_handle)
                .await;
        });

        self.connections.write().insert(
            key,
            ConnEntry {
                status: ConnStatus::Connecting,
                cancel: cancel_tx,
                task,
                current_delay_ms,
            },
        );
        self.notify_status();
    }

    /// Close the connection under `key` cleanly and cancel any pending
    /// reconnect.
    pub fn disconnect(&self, key: &str) {
        self.remove_connection(key);
        self.notify_status();
    }

    /// Close everything and refuse further connects.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let keys: Vec<String> = self.connections.read().keys().cloned().collect();
        for key in keys {
            self.remove_connection(&key);
        }
        self.notify_status();
        info!("websocket manager shut down");
    }

    pub fn is_connected(&self, key: &str) -> bool {
        self.connections
            .read()
            .get(key)
            .map(|c| c.status == ConnStatus::Connected)
            .unwrap_or(false)
    }

    pub fn overall_status(&self) -> OverallStatus {
        let connections = self.connections.read();
        if connections.is_empty() {
            return OverallStatus::Disconnected;
        }
        if connections
            .values()
            .any(|c| matches!(c.status, ConnStatus::Reconnecting | ConnStatus::Connecting))
        {
            OverallStatus::Reconnecting
        } else {
            OverallStatus::Connected
        }
    }

    pub fn add_status_listener(&self, f: impl Fn(OverallStatus) + Send + Sync + 'static) {
        self.status_listeners.write().push(Box::new(f));
    }

    /// The delay the connection will wait before its next reconnect attempt.
    /// Exposed for introspection and tests.
    pub fn current_reconnect_delay(&self, key: &str) -> Option<Duration> {
        self.connections
            .read()
            .get(key)
            .map(|c| Duration::from_millis(c.current_delay_ms.load(Ordering::SeqCst)))
    }

    // -------------------------------------------------------------------------
    // Connection task
    // -------------------------------------------------------------------------

    async fn run_connection(
        self: Arc<Self>,
        key: String,
        url: String,
        handlers: WsHandlers,
        mut cancel: watch::Receiver<bool>,
        current_delay_ms: Arc<AtomicU64>,
    ) {
        loop {
            if *cancel.borrow() {
                return;
            }

            debug!(key = %key, url = %url, "websocket connecting");
            let connect_result = tokio::select! {
                result = connect_async(&url) => result,
                _ = cancel.changed() => return,
            };

            match connect_result {
                Ok((stream, _response)) => {
                    info!(key = %key, "websocket connected");
                    self.set_status(&key, ConnStatus::Connected);
                    current_delay_ms.store(
                        self.config.initial_reconnect_delay.as_millis() as u64,
                        Ordering::SeqCst,
                    );
                    if let Some(on_open) = &handlers.on_open {
                        on_open();
                    }

                    let (mut write, mut read) = stream.split();
                    let clean_close = loop {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    self.dispatch_message(&key, &handlers, &text);
                                }
                                // Ping/pong and binary frames are ignored;
                                // tungstenite answers pings automatically.
                                Some(Ok(Message::Close(_))) => break false,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    self.monitor.track_error(
                                        ErrorCategory::Websocket,
                                        ErrorSeverity::Medium,
                                        format!("websocket {key} read error: {e}"),
                                        None,
                                    );
                                    break false;
                                }
                                None => break false,
                            },
                            _ = cancel.changed() => {
                                let _ = write
                                    .send(Message::Close(Some(CloseFrame {
                                        code: CloseCode::Normal,
                                        reason: "".into(),
                                    })))
                                    .await;
                                break true;
                            }
                        }
                    };

                    if let Some(on_close) = &handlers.on_close {
                        on_close();
                    }
                    if clean_close {
                        return;
                    }
                }
                Err(e) => {
                    self.monitor.track_error(
                        ErrorCategory::Websocket,
                        ErrorSeverity::Medium,
                        format!("websocket {key} connect failed: {e}"),
                        None,
                    );
                }
            }

            // Non-clean termination: back off, then retry. A newer connect or
            // a disconnect for this key cancels the wait.
            self.set_status(&key, ConnStatus::Reconnecting);
            let delay = Duration::from_millis(current_delay_ms.load(Ordering::SeqCst));
            let next = self.config.next_delay(delay);
            current_delay_ms.store(next.as_millis() as u64, Ordering::SeqCst);
            debug!(key = %key, delay_ms = delay.as_millis() as u64, "websocket reconnect scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.changed() => return,
            }
        }
    }

    fn dispatch_message(&self, key: &str, handlers: &WsHandlers, text: &str) {
        let result = catch_unwind(AssertUnwindSafe(|| (handlers.on_message)(text)));
        if result.is_err() {
            self.monitor.track_error(
                ErrorCategory::Websocket,
                ErrorSeverity::High,
                format!("websocket {key} message handler panicked"),
                None,
            );
        }
    }

    fn set_status(&self, key: &str, status: ConnStatus) {
        {
            let mut connections = self.connections.write();
            match connections.get_mut(key) {
                Some(entry) => entry.status = status,
                // Entry replaced or removed while the task was running.
                None => return,
            }
        }
        self.notify_status();
    }

    fn remove_connection(&self, key: &str) {
        if let Some(entry) = self.connections.write().remove(key) {
            // Ask the task to close with code 1000; abort only as a fallback
            // for a task stuck before the select loop.
            let _ = entry.cancel.send(true);
            let task = entry.task;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                task.abort();
            });
            debug!(key = %key, "websocket connection removed");
        }
    }

    fn notify_status(&self) {
        let status = self.overall_status();
        for listener in self.status_listeners.read().iter() {
            listener(status);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> WsManagerConfig {
        WsManagerConfig {
            initial_reconnect_delay: Duration::from_millis(1_000),
            max_reconnect_delay: Duration::from_millis(30_000),
            backoff_factor: 1.5,
        }
    }

    #[test]
    fn backoff_sequence_matches_contract() {
        let config = test_config();
        let mut delay = config.initial_reconnect_delay;
        let mut observed = vec![delay.as_millis() as u64];
        for _ in 0..2 {
            delay = config.next_delay(delay);
            observed.push(delay.as_millis() as u64);
        }
        assert_eq!(observed, vec![1000, 1500, 2250]);
    }

    #[test]
    fn backoff_is_nondecreasing_and_capped() {
        let config = test_config();
        let mut delay = config.initial_reconnect_delay;
        let mut prev = delay;
        for _ in 0..20 {
            delay = config.next_delay(delay);
            assert!(delay >= prev);
            assert!(delay <= config.max_reconnect_delay);
            prev = delay;
        }
        assert_eq!(delay, config.max_reconnect_delay);
    }

    #[tokio::test]
    async fn failed_connect_schedules_reconnect() {
        let monitor = Arc::new(ErrorMonitor::default());
        let manager = WsManager::new(
            WsManagerConfig {
                initial_reconnect_delay: Duration::from_millis(20),
                max_reconnect_delay: Duration::from_millis(100),
                backoff_factor: 1.5,
            },
            monitor.clone(),
        );

        // Nothing listens on this port; the connect fails quickly.
        manager.connect(
            "stream",
            "ws://127.0.0.1:9/".to_string(),
            WsHandlers::from_message_fn(|_| {}),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!manager.is_connected("stream"));
        assert_eq!(manager.overall_status(), OverallStatus::Reconnecting);
        // The failure was reported under the websocket category.
        assert!(monitor.stats().by_category.get("WEBSOCKET").copied().unwrap_or(0) >= 1);
        // The delay grew past the initial value.
        assert!(
            manager.current_reconnect_delay("stream").unwrap()
                > Duration::from_millis(20)
        );

        manager.shutdown();
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let manager = WsManager::new(
            WsManagerConfig {
                initial_reconnect_delay: Duration::from_secs(3600),
                max_reconnect_delay: Duration::from_secs(3600),
                backoff_factor: 1.5,
            },
            Arc::new(ErrorMonitor::default()),
        );

        manager.connect(
            "stream",
            "ws://127.0.0.1:9/".to_string(),
            WsHandlers::from_message_fn(|_| {}),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.disconnect("stream");
        assert!(!manager.is_connected("stream"));
        assert_eq!(manager.overall_status(), OverallStatus::Disconnected);
        assert!(manager.current_reconnect_delay("stream").is_none());
    }

    #[tokio::test]
    async fn shutdown_refuses_new_connects() {
        let manager = WsManager::new(test_config(), Arc::new(ErrorMonitor::default()));
        manager.shutdown();
        manager.connect(
            "late",
            "ws://127.0.0.1:9/".to_string(),
            WsHandlers::from_message_fn(|_| {}),
        );
        assert!(manager.connections.read().is_empty());
    }

    #[tokio::test]
    async fn status_listeners_observe_transitions() {
        let manager = WsManager::new(
            WsManagerConfig {
                initial_reconnect_delay: Duration::from_millis(20),
                max_reconnect_delay: Duration::from_millis(100),
                backoff_factor: 1.5,
            },
            Arc::new(ErrorMonitor::default()),
        );

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        manager.add_status_listener(move |status| s.lock().push(status));

        manager.connect(
            "stream",
            "ws://127.0.0.1:9/".to_string(),
            WsHandlers::from_message_fn(|_| {}),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.shutdown();

        let seen = seen.lock();
        assert!(seen.contains(&OverallStatus::Reconnecting));
        assert_eq!(*seen.last().unwrap(), OverallStatus::Disconnected);
    }
}
