//! # Event Bus
//!
//! Publish/subscribe primitive shared by the engine, the orchestrator and
//! sessions. Listeners are keyed by [`EventKind`] and dispatched in
//! registration order, outside the registry lock, so a listener may
//! subscribe or unsubscribe from inside its own invocation.
//!
//! A failing listener (returned error or panic) is logged and skipped; the
//! remaining listeners still run and the publisher never sees the failure.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::event::{Event, EventKind};

/// Synchronous listener
pub type Listener = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Asynchronous listener, only driven by [`EventBus::publish_awaiting`]
pub type AsyncListener =
    Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Default number of events retained for diagnostics
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Wrap a closure as a [`Listener`]
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap an async closure as an [`AsyncListener`]
pub fn async_listener<F, Fut>(f: F) -> AsyncListener
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

struct Entry<L> {
    listener: L,
    once: bool,
}

#[derive(Default)]
struct Registry {
    sync: HashMap<EventKind, Vec<Entry<Listener>>>,
    asynchronous: HashMap<EventKind, Vec<Entry<AsyncListener>>>,
}

/// Thread-safe event bus with a bounded history ring
pub struct EventBus {
    registry: Mutex<Registry>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus retaining the last `DEFAULT_HISTORY_CAPACITY` events
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus retaining at most `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Register a synchronous listener. Registering the same `Arc` twice for
    /// the same kind is a no-op.
    pub fn subscribe(&self, kind: EventKind, listener: Listener) -> &Self {
        self.insert_sync(kind, listener, false);
        self
    }

    /// Register an asynchronous listener (idempotent, like `subscribe`)
    pub fn subscribe_async(&self, kind: EventKind, listener: AsyncListener) -> &Self {
        let mut registry = self.registry();
        let entries = registry.asynchronous.entry(kind).or_default();
        if !entries.iter().any(|e| Arc::ptr_eq(&e.listener, &listener)) {
            entries.push(Entry {
                listener,
                once: false,
            });
        }
        self
    }

    /// Register a listener that is removed before its first dispatch
    pub fn once(&self, kind: EventKind, listener: Listener) -> &Self {
        self.insert_sync(kind, listener, true);
        self
    }

    /// Remove one synchronous listener, or every listener (sync and async)
    /// for `kind` when `listener` is `None`.
    pub fn unsubscribe(&self, kind: EventKind, listener: Option<&Listener>) -> &Self {
        let mut registry = self.registry();
        match listener {
            None => {
                registry.sync.remove(&kind);
                registry.asynchronous.remove(&kind);
            }
            Some(target) => {
                if let Some(entries) = registry.sync.get_mut(&kind) {
                    entries.retain(|e| !Arc::ptr_eq(&e.listener, target));
                }
            }
        }
        self
    }

    /// Remove one asynchronous listener
    pub fn unsubscribe_async(&self, kind: EventKind, listener: &AsyncListener) -> &Self {
        if let Some(entries) = self.registry().asynchronous.get_mut(&kind) {
            entries.retain(|e| !Arc::ptr_eq(&e.listener, listener));
        }
        self
    }

    /// Remove every listener
    pub fn clear(&self) -> &Self {
        let mut registry = self.registry();
        registry.sync.clear();
        registry.asynchronous.clear();
        self
    }

    /// Number of listeners for `kind`, or across all kinds
    pub fn listener_count(&self, kind: Option<EventKind>) -> usize {
        let registry = self.registry();
        match kind {
            Some(kind) => {
                registry.sync.get(&kind).map_or(0, Vec::len)
                    + registry.asynchronous.get(&kind).map_or(0, Vec::len)
            }
            None => {
                registry.sync.values().map(Vec::len).sum::<usize>()
                    + registry.asynchronous.values().map(Vec::len).sum::<usize>()
            }
        }
    }

    /// Publish to synchronous listeners only
    pub fn publish(&self, kind: EventKind, data: serde_json::Value, source: &str) -> Event {
        let event = Event::new(kind, data, source);
        self.record(&event);

        let (sync, _) = self.snapshot(kind, false);
        for listener in sync {
            Self::invoke(&listener, &event);
        }

        event
    }

    /// Publish to synchronous listeners, then drive every asynchronous
    /// listener to completion in registration order.
    pub async fn publish_awaiting(
        &self,
        kind: EventKind,
        data: serde_json::Value,
        source: &str,
    ) -> Event {
        let event = Event::new(kind, data, source);
        self.record(&event);

        let (sync, asynchronous) = self.snapshot(kind, true);
        for listener in sync {
            Self::invoke(&listener, &event);
        }

        for listener in asynchronous {
            let future = match catch_unwind(AssertUnwindSafe(|| listener(event.clone()))) {
                Ok(future) => future,
                Err(_) => {
                    tracing::error!(event = %kind, "Async event listener panicked");
                    continue;
                }
            };
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(event = %kind, error = %e, "Async event listener failed")
                }
                Err(_) => tracing::error!(event = %kind, "Async event listener panicked"),
            }
        }

        event
    }

    /// Most recent events (oldest first), optionally filtered by kind
    pub fn history(&self, kind: Option<EventKind>, limit: usize) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let matching: Vec<&Event> = history
            .iter()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    fn insert_sync(&self, kind: EventKind, listener: Listener, once: bool) {
        let mut registry = self.registry();
        let entries = registry.sync.entry(kind).or_default();
        if !entries.iter().any(|e| Arc::ptr_eq(&e.listener, &listener)) {
            entries.push(Entry { listener, once });
        }
    }

    /// Copy the listener lists and drop `once` entries, all under the lock.
    fn snapshot(
        &self,
        kind: EventKind,
        include_async: bool,
    ) -> (Vec<Listener>, Vec<AsyncListener>) {
        let mut registry = self.registry();

        let sync = match registry.sync.get_mut(&kind) {
            Some(entries) => {
                let listeners = entries.iter().map(|e| Arc::clone(&e.listener)).collect();
                entries.retain(|e| !e.once);
                listeners
            }
            None => Vec::new(),
        };

        let asynchronous = if include_async {
            registry
                .asynchronous
                .get(&kind)
                .map(|entries| entries.iter().map(|e| Arc::clone(&e.listener)).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        (sync, asynchronous)
    }

    fn invoke(listener: &Listener, event: &Event) {
        match catch_unwind(AssertUnwindSafe(|| listener(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(event = %event.kind, error = %e, "Event listener failed"),
            Err(_) => tracing::error!(event = %event.kind, "Event listener panicked"),
        }
    }

    fn record(&self, event: &Event) {
        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Listener) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let l = listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, l)
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let bus = EventBus::new();
        let (count, l) = counter();

        bus.subscribe(EventKind::LogMessage, Arc::clone(&l));
        bus.subscribe(EventKind::LogMessage, l);
        bus.publish(EventKind::LogMessage, json!({}), "test");

        assert_eq!(bus.listener_count(Some(EventKind::LogMessage)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe(
                EventKind::StageCompleted,
                listener(move |_| {
                    order.lock().unwrap().push(i);
                    Ok(())
                }),
            );
        }
        bus.publish(EventKind::StageCompleted, json!({}), "test");

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let bus = EventBus::new();
        let (count, second) = counter();

        bus.subscribe(
            EventKind::WorkflowError,
            listener(|_| anyhow::bail!("listener exploded")),
        );
        bus.subscribe(EventKind::WorkflowError, listener(|_| panic!("listener panicked")));
        bus.subscribe(EventKind::WorkflowError, second);

        bus.publish(EventKind::WorkflowError, json!({}), "test");
        bus.publish(EventKind::WorkflowError, json!({}), "test");

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));

        let l = {
            let bus = Arc::clone(&bus);
            let count = Arc::clone(&count);
            let slot = Arc::clone(&slot);
            listener(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = slot.lock().unwrap().as_ref() {
                    bus.unsubscribe(EventKind::LogMessage, Some(me));
                }
                Ok(())
            })
        };
        *slot.lock().unwrap() = Some(Arc::clone(&l));
        bus.subscribe(EventKind::LogMessage, l);

        bus.publish(EventKind::LogMessage, json!({}), "test");
        bus.publish(EventKind::LogMessage, json!({}), "test");

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(None), 0);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let bus = EventBus::new();
        let (count, l) = counter();

        bus.once(EventKind::WorkflowStarted, l);
        bus.publish(EventKind::WorkflowStarted, json!({}), "test");
        bus.publish(EventKind::WorkflowStarted, json!({}), "test");

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_all_for_kind() {
        let bus = EventBus::new();
        let (_, a) = counter();
        let (_, b) = counter();
        bus.subscribe(EventKind::LogMessage, a);
        bus.subscribe(EventKind::ProgressUpdated, b);
        bus.subscribe_async(EventKind::LogMessage, async_listener(|_| async { Ok::<(), anyhow::Error>(()) }));

        bus.unsubscribe(EventKind::LogMessage, None);

        assert_eq!(bus.listener_count(Some(EventKind::LogMessage)), 0);
        assert_eq!(bus.listener_count(None), 1);
    }

    #[test]
    fn test_history_is_a_bounded_ring() {
        let bus = EventBus::with_capacity(3);
        for i in 0..5 {
            bus.publish(EventKind::ProgressUpdated, json!({ "percent": i }), "test");
        }

        let history = bus.history(None, 10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].data["percent"], 2);
        assert_eq!(history[2].data["percent"], 4);
    }

    #[test]
    fn test_history_filter_and_limit() {
        let bus = EventBus::new();
        bus.publish(EventKind::LogMessage, json!({ "message": "a" }), "test");
        bus.publish(EventKind::ProgressUpdated, json!({}), "test");
        bus.publish(EventKind::LogMessage, json!({ "message": "b" }), "test");
        bus.publish(EventKind::LogMessage, json!({ "message": "c" }), "test");

        let logs = bus.history(Some(EventKind::LogMessage), 2);
        let messages: Vec<_> = logs.iter().filter_map(|e| e.str_field("message")).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn test_async_listeners_only_run_when_awaited() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe_async(
            EventKind::WorkflowCompleted,
            async_listener(move |_| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            }),
        );
        bus.subscribe_async(
            EventKind::WorkflowCompleted,
            async_listener(|_| async { Err::<(), _>(anyhow::anyhow!("async failure")) }),
        );

        bus.publish(EventKind::WorkflowCompleted, json!({}), "test");
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio_test::block_on(bus.publish_awaiting(EventKind::WorkflowCompleted, json!({}), "test"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
