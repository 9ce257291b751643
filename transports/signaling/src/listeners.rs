//! Typed fan-out of hub events to independently registered callbacks
//!
//! Each registry is keyed by the event's kind (one kind per wire event name).
//! Registering returns a [`ListenerHandle`] whose `dispose` removes exactly
//! that callback. Delivery snapshots the current callbacks, so a callback may
//! register or dispose listeners without deadlocking, and a panicking callback
//! is logged and skipped without affecting the others.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, trace};

/// An event that can be fanned out through a [`ListenerRegistry`]
pub trait Event: Send + Sync + 'static {
    /// Discriminant used as the registration key
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Shared callback type
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E: Event> {
    id: u64,
    listener: Listener<E>,
}

struct Inner<E: Event> {
    next_id: AtomicU64,
    /// `None` holds listeners registered for every kind
    listeners: Mutex<HashMap<Option<E::Kind>, Vec<Entry<E>>>>,
}

/// Registry of callbacks per event kind
pub struct ListenerRegistry<E: Event> {
    inner: Arc<Inner<E>>,
}

impl<E: Event> Clone for ListenerRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Event> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a callback for one event kind
    pub fn on<F>(&self, kind: E::Kind, callback: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(callback))
    }

    /// Register a shared callback for one event kind
    ///
    /// Registering the same `Arc` twice for the same kind keeps a single entry.
    pub fn on_listener(&self, kind: E::Kind, listener: Listener<E>) -> ListenerHandle {
        self.register(Some(kind), listener)
    }

    /// Register a callback that receives every event
    pub fn on_any<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback))
    }

    fn register(&self, key: Option<E::Kind>, listener: Listener<E>) -> ListenerHandle {
        let mut listeners = self.inner.listeners.lock();
        let entries = listeners.entry(key).or_default();

        let id = match entries
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.listener, &listener))
        {
            Some(existing) => existing.id,
            None => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                entries.push(Entry { id, listener });
                id
            }
        };

        let weak: Weak<Inner<E>> = Arc::downgrade(&self.inner);
        ListenerHandle {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut listeners = inner.listeners.lock();
                    if let Some(entries) = listeners.get_mut(&key) {
                        entries.retain(|entry| entry.id != id);
                        if entries.is_empty() {
                            listeners.remove(&key);
                        }
                    }
                }
            })),
        }
    }

    /// Deliver an event to every matching callback
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Listener<E>> = {
            let listeners = self.inner.listeners.lock();
            listeners
                .get(&Some(kind))
                .into_iter()
                .chain(listeners.get(&None))
                .flat_map(|entries| entries.iter().map(|entry| Arc::clone(&entry.listener)))
                .collect()
        };

        trace!("Dispatching {:?} to {} listener(s)", kind, snapshot.len());

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(
                        "Listener for {:?} panicked: {}",
                        kind,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        delivered
    }

    /// Number of callbacks registered for `kind` (excluding catch-all listeners)
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.inner
            .listeners
            .lock()
            .get(&Some(kind))
            .map_or(0, Vec::len)
    }

    /// Drop every registration
    pub fn clear(&self) {
        self.inner.listeners.lock().clear();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Disposer returned from registration
///
/// Dropping the handle leaves the callback registered; call
/// [`ListenerHandle::dispose`] to remove it.
#[must_use = "dropping the handle keeps the listener registered forever"]
pub struct ListenerHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    /// Remove exactly the callback this handle was returned for
    pub fn dispose(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    enum Ping {
        A(u32),
        B,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum PingKind {
        A,
        B,
    }

    impl Event for Ping {
        type Kind = PingKind;

        fn kind(&self) -> PingKind {
            match self {
                Ping::A(_) => PingKind::A,
                Ping::B => PingKind::B,
            }
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Ping) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&count);
        (count, move |_: &Ping| {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_emit_reaches_matching_kind_only() {
        let registry = ListenerRegistry::<Ping>::new();
        let (a_count, a) = counter();
        let (b_count, b) = counter();
        let _a = registry.on(PingKind::A, a);
        let _b = registry.on(PingKind::B, b);

        assert_eq!(registry.emit(&Ping::A(1)), 1);
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dispose_removes_only_own_callback() {
        let registry = ListenerRegistry::<Ping>::new();
        let (first_count, first) = counter();
        let (second_count, second) = counter();
        let first_handle = registry.on(PingKind::A, first);
        let _second_handle = registry.on(PingKind::A, second);

        registry.emit(&Ping::A(1));
        first_handle.dispose();
        registry.emit(&Ping::A(2));

        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 2);
        assert_eq!(registry.listener_count(PingKind::A), 1);
    }

    #[test]
    fn test_same_listener_registered_once() {
        let registry = ListenerRegistry::<Ping>::new();
        let (count, callback) = counter();
        let shared: Listener<Ping> = Arc::new(callback);

        let _h1 = registry.on_listener(PingKind::B, Arc::clone(&shared));
        let _h2 = registry.on_listener(PingKind::B, Arc::clone(&shared));

        registry.emit(&Ping::B);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.listener_count(PingKind::B), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry = ListenerRegistry::<Ping>::new();
        let (count, callback) = counter();
        let _bad = registry.on(PingKind::A, |_| panic!("listener bug"));
        let _good = registry.on(PingKind::A, callback);

        assert_eq!(registry.emit(&Ping::A(7)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_any_receives_every_kind() {
        let registry = ListenerRegistry::<Ping>::new();
        let (count, callback) = counter();
        let handle = registry.on_any(callback);

        registry.emit(&Ping::A(1));
        registry.emit(&Ping::B);
        handle.dispose();
        registry.emit(&Ping::B);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_can_dispose_itself_during_emit() {
        let registry = ListenerRegistry::<Ping>::new();
        let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));
        let slot_clone = Arc::clone(&slot);
        let (count, _) = counter();
        let count_clone = Arc::clone(&count);

        let handle = registry.on(PingKind::A, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = slot_clone.lock().take() {
                handle.dispose();
            }
        });
        *slot.lock() = Some(handle);

        registry.emit(&Ping::A(1));
        registry.emit(&Ping::A(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
