// =============================================================================
// UpdateBatcher — per-key last-write-wins coalescing
// =============================================================================
//
// High-frequency ticker updates are collapsed into periodic flushes: the most
// recently added value for a key wins, older values for that key are
// discarded, and the sink receives a map snapshot with no inter-key ordering.
// Klines are never routed through this — the kline store does its own
// tail-replace and must see every update.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct UpdateBatcherConfig {
    pub flush_interval: Duration,
    /// Reaching this many distinct pending keys forces an immediate flush.
    pub max_queued: usize,
}

impl Default for UpdateBatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(150),
            max_queued: 1000,
        }
    }
}

type Sink<K, V> = Arc<dyn Fn(HashMap<K, V>) + Send + Sync>;

pub struct UpdateBatcher<K, V> {
    pending: Mutex<HashMap<K, V>>,
    sink: Sink<K, V>,
    max_queued: usize,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<K, V> UpdateBatcher<K, V>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    /// Create the batcher and start its periodic flush task. Must be called
    /// from within a tokio runtime.
    pub fn new(
        config: UpdateBatcherConfig,
        sink: impl Fn(HashMap<K, V>) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let batcher = Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            sink: Arc::new(sink),
            max_queued: config.max_queued.max(1),
            task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        // The timer holds only a weak reference so dropping every strong
        // handle stops the task on its next tick.
        let weak: Weak<Self> = Arc::downgrade(&batcher);
        let interval = config.flush_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(batcher) => {
                        if batcher.disposed.load(Ordering::SeqCst) {
                            break;
                        }
                        batcher.flush();
                    }
                    None => break,
                }
            }
        });
        *batcher.task.lock() = Some(handle);

        batcher
    }

    /// Store or overwrite the pending value for `key`.
    pub fn add(&self, key: K, value: V) {
        if self.disposed.load(Ordering::SeqCst) {
            debug!("update dropped: batcher disposed");
            return;
        }
        let should_force = {
            let mut pending = self.pending.lock();
            pending.insert(key, value);
            pending.len() >= self.max_queued
        };
        if should_force {
            self.flush();
        }
    }

    /// Number of keys currently waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Deliver the pending snapshot to the sink, if any.
    pub fn flush(&self) {
        let snapshot = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };
        (self.sink)(snapshot);
    }

    /// Flush outstanding values and stop the timer task.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn collecting_sink() -> (
        Arc<PlMutex<Vec<HashMap<&'static str, i32>>>>,
        impl Fn(HashMap<&'static str, i32>) + Send + Sync + 'static,
    ) {
        let flushes = Arc::new(PlMutex::new(Vec::new()));
        let sink_flushes = flushes.clone();
        (flushes, move |map| sink_flushes.lock().push(map))
    }

    #[tokio::test]
    async fn last_value_per_key_wins() {
        let (flushes, sink) = collecting_sink();
        let batcher = UpdateBatcher::new(
            UpdateBatcherConfig {
                flush_interval: Duration::from_secs(3600), // manual flush only
                max_queued: 1000,
            },
            sink,
        );

        batcher.add("BTCUSDT", 1);
        batcher.add("BTCUSDT", 2);
        batcher.add("BTCUSDT", 3);
        batcher.add("ETHUSDT", 7);
        batcher.flush();

        let flushes = flushes.lock();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0]["BTCUSDT"], 3);
        assert_eq!(flushes[0]["ETHUSDT"], 7);
    }

    #[tokio::test]
    async fn reaching_max_queued_forces_flush() {
        let (flushes, sink) = collecting_sink();
        let batcher = UpdateBatcher::new(
            UpdateBatcherConfig {
                flush_interval: Duration::from_secs(3600),
                max_queued: 2,
            },
            sink,
        );

        batcher.add("A", 1);
        assert_eq!(flushes.lock().len(), 0);
        batcher.add("B", 2);
        assert_eq!(flushes.lock().len(), 1);
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn periodic_flush_delivers() {
        let (flushes, sink) = collecting_sink();
        let batcher = UpdateBatcher::new(
            UpdateBatcherConfig {
                flush_interval: Duration::from_millis(20),
                max_queued: 1000,
            },
            sink,
        );

        batcher.add("A", 42);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(flushes.lock().len(), 1);
        assert_eq!(flushes.lock()[0]["A"], 42);
    }

    #[tokio::test]
    async fn empty_ticks_do_not_flush() {
        let (flushes, sink) = collecting_sink();
        let _batcher = UpdateBatcher::new(
            UpdateBatcherConfig {
                flush_interval: Duration::from_millis(10),
                max_queued: 1000,
            },
            sink,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(flushes.lock().is_empty());
    }

    #[tokio::test]
    async fn dispose_flushes_and_ignores_later_adds() {
        let (flushes, sink) = collecting_sink();
        let batcher = UpdateBatcher::new(
            UpdateBatcherConfig {
                flush_interval: Duration::from_secs(3600),
                max_queued: 1000,
            },
            sink,
        );

        batcher.add("A", 1);
        batcher.dispose();
        assert_eq!(flushes.lock().len(), 1);

        batcher.add("B", 2);
        batcher.flush();
        assert_eq!(flushes.lock().len(), 1);
    }
}
