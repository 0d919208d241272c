//! Event fan-out with subscriber handles.
//!
//! Used by the breaker, the breaker registry, and the job queue to notify
//! observability collaborators. A subscriber that panics is isolated so
//! the remaining subscribers still observe the event; every such panic is
//! counted on the hub rather than silently discarded.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

/// Handle returned by [`EventHub::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Synchronous publish/subscribe fan-out.
///
/// Handlers run on the emitting task, in subscription order. Keep them
/// cheap; anything slow belongs on a channel of the subscriber's own.
pub struct EventHub<E> {
    handlers: RwLock<Vec<(SubscriptionId, Handler<E>)>>,
    next_id: AtomicU64,
    handler_panics: AtomicU64,
}

impl<E> EventHub<E> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Returns true if the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn emit(&self, event: &E) {
        // Snapshot so a handler may subscribe/unsubscribe reentrantly.
        let snapshot: Vec<Handler<E>> = self.handlers.read().iter().map(|(_, h)| h.clone()).collect();

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                self.handler_panics.fetch_add(1, Ordering::Relaxed);
                warn!("event subscriber panicked, continuing fan-out");
            }
        }
    }

    /// Number of subscriber panics swallowed since creation.
    pub fn handler_panics(&self) -> u64 {
        self.handler_panics.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn emit_reaches_all_subscribers_in_order() {
        let hub = EventHub::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            hub.subscribe(move |event: &u32| {
                seen.lock().push(format!("{tag}:{event}"));
            });
        }

        hub.emit(&7);
        assert_eq!(*seen.lock(), vec!["a:7".to_string(), "b:7".to_string()]);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let hub = EventHub::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let id = hub.subscribe(move |event: &u32| {
            seen_clone.lock().push(*event);
        });

        hub.emit(&1);
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.emit(&2);

        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn panicking_subscriber_is_isolated_and_counted() {
        let hub = EventHub::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        hub.subscribe(|_: &u32| panic!("bad subscriber"));
        let seen_clone = seen.clone();
        hub.subscribe(move |event: &u32| {
            seen_clone.lock().push(*event);
        });

        hub.emit(&42);

        assert_eq!(*seen.lock(), vec![42]);
        assert_eq!(hub.handler_panics(), 1);
    }
}
