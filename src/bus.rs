//! Typed publish/subscribe used by the capture, playback, and session
//! components.
//!
//! Subscribers register per event kind and are invoked in registration order.
//! Unsubscription is by the handle returned from `on`.

use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Handle returned by [`EventBus::on`]; pass it to `off` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

type Callback<E> = Box<dyn Fn(&E) + Send>;

/// Per-kind subscriber registry with registration-order delivery.
pub struct EventBus<K, E> {
    subs: Vec<(u64, K, Callback<E>)>,
    next_id: u64,
}

impl<K: Eq + Hash + Copy, E> EventBus<K, E> {
    pub fn new() -> Self {
        Self {
            subs: Vec::new(),
            next_id: 0,
        }
    }

    /// Register a callback for one event kind.
    pub fn on(&mut self, kind: K, callback: Callback<E>) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;
        self.subs.push((id, kind, callback));
        Subscription(id)
    }

    /// Remove a previously registered callback. Unknown handles are ignored.
    pub fn off(&mut self, sub: Subscription) {
        self.subs.retain(|(id, _, _)| *id != sub.0);
    }

    /// Deliver an event to every subscriber of `kind`, in registration order.
    pub fn emit(&self, kind: K, event: &E) {
        for (_, k, callback) in &self.subs {
            if *k == kind {
                callback(event);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

impl<K: Eq + Hash + Copy, E> Default for EventBus<K, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// An [`EventBus`] that can be emitted into from another thread, e.g. the
/// audio capture thread or the session reader task.
pub struct SharedEventBus<K, E> {
    inner: Arc<Mutex<EventBus<K, E>>>,
}

impl<K: Eq + Hash + Copy, E> SharedEventBus<K, E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBus::new())),
        }
    }

    pub fn on(&self, kind: K, callback: Callback<E>) -> Subscription {
        self.inner.lock().expect("event bus poisoned").on(kind, callback)
    }

    pub fn off(&self, sub: Subscription) {
        self.inner.lock().expect("event bus poisoned").off(sub);
    }

    pub fn emit(&self, kind: K, event: &E) {
        self.inner.lock().expect("event bus poisoned").emit(kind, event);
    }
}

impl<K: Eq + Hash + Copy, E> Clone for SharedEventBus<K, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Eq + Hash + Copy, E> Default for SharedEventBus<K, E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        A,
        B,
    }

    #[test]
    fn delivers_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus: EventBus<Kind, u32> = EventBus::new();

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            bus.on(
                Kind::A,
                Box::new(move |v| log.lock().unwrap().push((tag, *v))),
            );
        }

        bus.emit(Kind::A, &7);
        let got = log.lock().unwrap().clone();
        assert_eq!(got, vec![("first", 7), ("second", 7), ("third", 7)]);
    }

    #[test]
    fn only_matching_kind_receives() {
        let a_count = Arc::new(AtomicUsize::new(0));
        let b_count = Arc::new(AtomicUsize::new(0));
        let mut bus: EventBus<Kind, ()> = EventBus::new();

        {
            let a = a_count.clone();
            bus.on(Kind::A, Box::new(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            }));
            let b = b_count.clone();
            bus.on(Kind::B, Box::new(move |_| {
                b.fetch_add(1, Ordering::SeqCst);
            }));
        }

        bus.emit(Kind::A, &());
        bus.emit(Kind::A, &());
        assert_eq!(a_count.load(Ordering::SeqCst), 2);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn off_removes_subscriber() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut bus: EventBus<Kind, ()> = EventBus::new();
        let c = count.clone();
        let sub = bus.on(Kind::A, Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(Kind::A, &());
        bus.off(sub);
        bus.emit(Kind::A, &());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Unsubscribing twice is harmless.
        bus.off(sub);
    }
}
