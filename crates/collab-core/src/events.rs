//! Listener infrastructure shared by every component.
//!
//! `EventBus<E>` fans an event out to its listeners in registration order.
//! `subscribe` hands back a [`Subscription`]; dropping the handle removes the
//! listener. A session collects its handles in a [`SubscriptionSet`] so they
//! are all released together on teardown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it (or let it go out of
/// scope) to unsubscribe.
#[must_use = "dropping a Subscription unsubscribes the listener immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unsubscribe now. Equivalent to dropping the handle.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Event bus for publishing events of type `E` to listeners.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    listeners: RwLock<Vec<(usize, Listener<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns a `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));

        let bus: Weak<Self> = Arc::downgrade(self);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    bus.unsubscribe(id);
                }
            })),
        }
    }

    fn unsubscribe(&self, id: usize) {
        // emit releases its read lock before calling listeners, so this
        // only waits out other threads.
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Deliver an event to every listener, in registration order.
    pub fn emit(&self, event: &E) {
        // Snapshot the list so a listener may subscribe without deadlocking.
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Arena of subscriptions released together.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Drop every held subscription. Idempotent.
    pub fn release(&mut self) {
        self.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_listeners_fire_in_registration_order() {
        let bus = Arc::new(EventBus::<u32>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        let _a = bus.subscribe(move |n| first.lock().unwrap().push(("a", *n)));
        let second = Arc::clone(&seen);
        let _b = bus.subscribe(move |n| second.lock().unwrap().push(("b", *n)));

        bus.emit(&7);

        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = Arc::new(EventBus::<()>::new());
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let sub = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&());
        drop(sub);
        bus.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_drop_waits_for_concurrent_reader() {
        let bus = Arc::new(EventBus::<()>::new());
        let sub = bus.subscribe(|_| {});

        let reader = bus.listeners.read().unwrap();
        let dropper = std::thread::spawn(move || drop(sub));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(reader.len(), 1);
        drop(reader);
        dropper.join().unwrap();

        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_listener_can_drop_its_own_subscription() {
        let bus = Arc::new(EventBus::<()>::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let own = Arc::clone(&slot);
        let sub = bus.subscribe(move |_| {
            own.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        bus.emit(&());
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus = Arc::new(EventBus::<()>::new());
        let sub = bus.subscribe(|_| {});
        drop(bus);
        // Dropping after the bus is gone must be a no-op.
        drop(sub);
    }

    #[test]
    fn test_subscription_set_releases_all() {
        let bus = Arc::new(EventBus::<()>::new());
        let mut set = SubscriptionSet::new();
        set.push(bus.subscribe(|_| {}));
        set.push(bus.subscribe(|_| {}));
        assert_eq!(bus.listener_count(), 2);

        set.release();
        set.release();

        assert!(set.is_empty());
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_subscribe_from_inside_listener() {
        let bus = Arc::new(EventBus::<()>::new());
        let inner = Arc::new(Mutex::new(Vec::new()));

        let bus_clone = Arc::clone(&bus);
        let holder = Arc::clone(&inner);
        let _outer = bus.subscribe(move |_| {
            let sub = bus_clone.subscribe(|_| {});
            holder.lock().unwrap().push(sub);
        });

        bus.emit(&());
        assert_eq!(bus.listener_count(), 2);
    }
}
