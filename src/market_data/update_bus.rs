// =============================================================================
// UpdateBus — (symbol, interval) keyed change notification fan-out
// =============================================================================
//
// Single-writer-multiple-reader event router. Listeners run synchronously on
// the emitter's thread, specific subscribers before global ones, in emit
// order. A panicking listener is isolated: the panic is caught, reported to
// the error monitor, and delivery continues.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error_monitor::{ErrorCategory, ErrorMonitor, ErrorSeverity};
use crate::types::Interval;

pub type BusListener = Arc<dyn Fn(&str, Interval) + Send + Sync>;

/// Token returned by `subscribe*`; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Registered {
    id: u64,
    listener: BusListener,
}

struct Listeners {
    keyed: HashMap<(String, Interval), Vec<Registered>>,
    global: Vec<Registered>,
}

pub struct UpdateBus {
    listeners: RwLock<Listeners>,
    next_id: AtomicU64,
    monitor: Arc<ErrorMonitor>,
}

impl UpdateBus {
    pub fn new(monitor: Arc<ErrorMonitor>) -> Self {
        Self {
            listeners: RwLock::new(Listeners {
                keyed: HashMap::new(),
                global: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
            monitor,
        }
    }

    /// Listen for changes to one (symbol, interval) key.
    pub fn subscribe(
        &self,
        symbol: impl Into<String>,
        interval: Interval,
        listener: impl Fn(&str, Interval) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .keyed
            .entry((symbol.into(), interval))
            .or_default()
            .push(Registered {
                id,
                listener: Arc::new(listener),
            });
        SubscriptionId(id)
    }

    /// Listen for changes to every key.
    pub fn subscribe_all(
        &self,
        listener: impl Fn(&str, Interval) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().global.push(Registered {
            id,
            listener: Arc::new(listener),
        });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut listeners = self.listeners.write();
        listeners.global.retain(|r| r.id != id.0);
        for regs in listeners.keyed.values_mut() {
            regs.retain(|r| r.id != id.0);
        }
        listeners.keyed.retain(|_, regs| !regs.is_empty());
    }

    /// Deliver a change event. Specific listeners first, then global.
    pub fn emit(&self, symbol: &str, interval: Interval) {
        // Snapshot under the read lock, invoke outside it so listeners may
        // re-enter the bus.
        let snapshot: Vec<BusListener> = {
            let listeners = self.listeners.read();
            let keyed = listeners
                .keyed
                .get(&(symbol.to_string(), interval))
                .into_iter()
                .flatten()
                .map(|r| r.listener.clone());
            let global = listeners.global.iter().map(|r| r.listener.clone());
            keyed.chain(global).collect()
        };

        for listener in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| listener(symbol, interval)));
            if let Err(panic) = result {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".into());
                self.monitor.track_error(
                    ErrorCategory::Unknown,
                    ErrorSeverity::High,
                    format!("update listener panicked for {symbol}@{interval}: {detail}"),
                    None,
                );
            }
        }
    }

    /// Number of registered listeners, for introspection.
    pub fn listener_count(&self) -> usize {
        let listeners = self.listeners.read();
        listeners.global.len() + listeners.keyed.values().map(Vec::len).sum::<usize>()
    }
}
