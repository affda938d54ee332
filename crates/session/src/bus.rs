//! Typed publish/subscribe for session events
//!
//! Handlers run synchronously, in registration order, on the thread that
//! emits. A panicking handler is isolated and logged so the remaining
//! handlers still run. `clear` drops every handler at once, which is how
//! a manager reset guarantees no stale-session delivery after a restart.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use colloquy_core::{SessionEvent, SessionEventKind};
use parking_lot::Mutex;

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Handle returned by [`EventBus::on`]; pass it back to `off` to
/// unsubscribe exactly the handler it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    kind: SessionEventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> SessionEventKind {
        self.kind
    }
}

#[derive(Default)]
struct BusInner {
    handlers: HashMap<SessionEventKind, Vec<(u64, Handler)>>,
    next_id: u64,
}

/// Synchronous fan-out of [`SessionEvent`]s to registered handlers.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on(
        &self,
        kind: SessionEventKind,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { kind, id }
    }

    /// Remove the handler a subscription was issued for. Unknown or
    /// already-removed subscriptions are ignored.
    pub fn off(&self, subscription: &Subscription) {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.handlers.get_mut(&subscription.kind) {
            list.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Remove every handler registered for one event kind.
    pub fn off_all(&self, kind: SessionEventKind) {
        self.inner.lock().handlers.remove(&kind);
    }

    /// Remove every handler for every kind.
    pub fn clear(&self) {
        self.inner.lock().handlers.clear();
    }

    pub fn handler_count(&self, kind: SessionEventKind) -> usize {
        self.inner
            .lock()
            .handlers
            .get(&kind)
            .map_or(0, |list| list.len())
    }

    /// Deliver an event to every handler registered for its kind.
    ///
    /// The handler list is snapshotted up front, so a handler that
    /// subscribes or unsubscribes during delivery affects the next emit,
    /// not this one.
    pub fn emit(&self, event: &SessionEvent) {
        let handlers: Vec<Handler> = {
            let inner = self.inner.lock();
            match inner.handlers.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(event = %event.kind().as_wire_name(), "Event handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::ConnectionPhase;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state_changed() -> SessionEvent {
        SessionEvent::StateChanged {
            from: ConnectionPhase::Idle,
            to: ConnectionPhase::Connecting,
        }
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on(SessionEventKind::StateChanged, move |_| {
                order.lock().push(tag);
            });
        }

        bus.emit(&state_changed());
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_emit_routes_by_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        bus.on(SessionEventKind::SpeechStarted, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&state_changed());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.emit(&SessionEvent::SpeechStarted {
            response_id: "resp_1".to_string(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_removes_only_that_subscription() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let a = {
            let hits = Arc::clone(&hits);
            bus.on(SessionEventKind::StateChanged, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _b = {
            let hits = Arc::clone(&hits);
            bus.on(SessionEventKind::StateChanged, move |_| {
                hits.fetch_add(10, Ordering::SeqCst);
            })
        };

        bus.off(&a);
        bus.emit(&state_changed());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(bus.handler_count(SessionEventKind::StateChanged), 1);
    }

    #[test]
    fn test_off_all_clears_one_kind() {
        let bus = EventBus::new();
        bus.on(SessionEventKind::StateChanged, |_| {});
        bus.on(SessionEventKind::StateChanged, |_| {});
        bus.on(SessionEventKind::Error, |_| {});

        bus.off_all(SessionEventKind::StateChanged);
        assert_eq!(bus.handler_count(SessionEventKind::StateChanged), 0);
        assert_eq!(bus.handler_count(SessionEventKind::Error), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_block_later_handlers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.on(SessionEventKind::StateChanged, |_| {
            panic!("handler bug");
        });
        let hits_clone = Arc::clone(&hits);
        bus.on(SessionEventKind::StateChanged, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&state_changed());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_drops_everything() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for kind in SessionEventKind::ALL {
            let hits = Arc::clone(&hits);
            bus.on(kind, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.clear();
        bus.emit(&state_changed());
        bus.emit(&SessionEvent::SpeechStarted {
            response_id: "resp_1".to_string(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
