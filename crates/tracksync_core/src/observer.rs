//! Callback lists for state changes and signals.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback<T>)>>,
}

/// A list of callbacks notified in registration order.
pub(crate) struct Observers<T> {
    inner: Arc<Inner<T>>,
}

impl<T: 'static> Observers<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Unsubscribe {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback<T> = Arc::new(callback);
        self.inner.callbacks.lock().push((id, callback));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Unsubscribe {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.callbacks.lock().retain(|(other, _)| *other != id);
                }
            })),
        }
    }

    /// Calls every callback with `value`. Callbacks may subscribe or
    /// unsubscribe while being notified.
    pub(crate) fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .inner
            .callbacks
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            callback(value);
        }
    }

    pub(crate) fn clear(&self) {
        self.inner.callbacks.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.callbacks.lock().len()
    }
}

/// Removes a callback registered with `on_change` or `on_signal`.
///
/// Dropping an `Unsubscribe` leaves the callback registered; call
/// [`unsubscribe`](Unsubscribe::unsubscribe) to remove it.
#[must_use = "the callback stays registered until `unsubscribe` is called"]
pub struct Unsubscribe {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    /// Removes the callback. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn notifies_in_registration_order() {
        let observers = Observers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        let _a = observers.subscribe(move |v| first.lock().push(("a", *v)));
        let second = Arc::clone(&seen);
        let _b = observers.subscribe(move |v| second.lock().push(("b", *v)));

        observers.notify(&7);
        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn unsubscribe_removes_only_that_callback() {
        let observers = Observers::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let mut first = observers.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&count);
        let _second = observers.subscribe(move |_| {
            c.fetch_add(10, Ordering::SeqCst);
        });

        first.unsubscribe();
        first.unsubscribe();
        observers.notify(&1);

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn dropping_the_token_keeps_the_callback() {
        let observers = Observers::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        drop(observers.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        observers.notify(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_after_list_dropped_is_harmless() {
        let observers = Observers::<u32>::new();
        let mut token = observers.subscribe(|_| {});
        drop(observers);
        token.unsubscribe();
    }
}
