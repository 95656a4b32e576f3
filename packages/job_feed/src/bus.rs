//! Event Multiplexer
//!
//! In-process publish/subscribe registry keyed by [`EventKind`].
//!
//! ## Registration policy
//!
//! Every call to [`EventBus::on`] creates an independent registration, even
//! when the same handler `Arc` is registered twice for the same kind. Each
//! registration is delivered to once per emit. [`EventBus::off`] removes one
//! registration of that handler (the oldest), and [`Subscription::unsubscribe`]
//! removes exactly the registration it was returned for.
//!
//! Delivery is synchronous, in registration order, on the emitting task.
//! Nothing is buffered: an emit with no listeners is dropped.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{trace, warn};

use crate::protocol::{EventKind, ServerEvent};

/// A listener callback. Identity (for [`EventBus::off`]) is the `Arc` allocation.
pub type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&ServerEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
struct Registration {
    id: u64,
    handler: Handler,
    /// Cleared on removal so an in-flight emit skips it.
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<Registration>>>,
}

impl BusInner {
    fn listeners(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Registration>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_where(&self, kind: EventKind, pred: impl Fn(&Registration) -> bool) -> bool {
        let mut listeners = self.listeners();
        let Some(regs) = listeners.get_mut(&kind) else {
            return false;
        };
        let Some(pos) = regs.iter().position(pred) else {
            return false;
        };
        let reg = regs.remove(pos);
        reg.active.store(false, Ordering::Release);
        if regs.is_empty() {
            listeners.remove(&kind);
        }
        true
    }
}

/// Fan-out registry for decoded server events. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Returned by [`EventBus::on`]; removes that one registration.
#[derive(Debug)]
#[must_use = "dropping a Subscription keeps the listener registered; call unsubscribe() to remove it"]
pub struct Subscription {
    bus: Weak<BusInner>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove the registration. A no-op if it is already gone or the bus
    /// has been dropped.
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_where(self.kind, |reg| reg.id == self.id);
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`.
    pub fn on(&self, kind: EventKind, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners()
            .entry(kind)
            .or_default()
            .push(Registration {
                id,
                handler,
                active: Arc::new(AtomicBool::new(true)),
            });
        trace!(kind = %kind, listener = id, "listener registered");
        Subscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Remove one registration of `handler` for `kind`. Silently does
    /// nothing if it was never registered.
    pub fn off(&self, kind: EventKind, handler: &Handler) {
        self.inner
            .remove_where(kind, |reg| Arc::ptr_eq(&reg.handler, handler));
    }

    /// Deliver `event` to every listener registered for its kind. Returns the
    /// number of listeners that ran to completion.
    pub fn emit(&self, event: &ServerEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers may call on/off without deadlocking.
        let snapshot = match self.inner.listeners().get(&kind) {
            Some(regs) => regs.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for reg in snapshot {
            if !reg.active.load(Ordering::Acquire) {
                continue;
            }
            let handler = &reg.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(kind = %kind, listener = reg.id, "event listener panicked");
                }
            }
        }
        delivered
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.listeners().get(&kind).map_or(0, Vec::len)
    }
}
