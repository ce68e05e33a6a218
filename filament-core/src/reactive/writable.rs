//! Writable cell.
//!
//! A Writable holds a value set directly by callers. It is always a leaf
//! of the dependency graph: it owns no dependencies, and derived cells
//! that read it register themselves as dependents through the evaluation
//! context.
//!
//! # Write path
//!
//! `set` first asks the equality policy whether the value actually
//! moved; an unchanged write is a complete no-op. A real write assigns,
//! synchronously marks every transitive dependent stale (so reads later
//! in the same batch observe the new value), and then either notifies
//! immediately or hands itself to the open batch for a single deferred
//! notification pass.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::batch::{self, PendingCell};
use super::cell::{Callback, CellCore, CellId, CellOptions, CycleError};
use super::context::{self, Source};
use super::subscriber::{SubscriberId, Subscription};

/// A reactive cell holding a directly settable value.
///
/// # Example
///
/// ```rust,ignore
/// let count = Writable::new(0);
///
/// let sub = count.subscribe(|v| println!("count = {v}"));
///
/// count.set(5);       // subscriber runs with 5
/// count.set(5);       // unchanged, subscriber does not run
/// sub.unsubscribe();
/// ```
pub struct Writable<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<WritableInner<T>>,
}

pub(crate) struct WritableInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    core: CellCore<T>,

    /// Fixed at construction; `reset` restores it.
    initial: T,

    value: RwLock<T>,
}

impl<T> Writable<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Create a writable cell with the default (`PartialEq`) equality
    /// policy.
    pub fn new(value: T) -> Self {
        Self::with_options(value, CellOptions::new())
    }
}

impl<T> Writable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a writable cell with explicit options. `cache_size` is a
    /// derived-cell knob and is ignored here.
    pub fn with_options(value: T, options: CellOptions<T>) -> Self {
        Self {
            inner: Arc::new(WritableInner {
                core: CellCore::new(options.equality, options.name),
                initial: value.clone(),
                value: RwLock::new(value),
            }),
        }
    }

    pub fn id(&self) -> CellId {
        self.inner.core.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.core.name()
    }

    /// Read the current value and, when called from inside a derived
    /// cell's getter, register that cell as a dependent.
    pub fn get(&self) -> T {
        let value = self.inner.value.read().clone();
        self.inner.core.note_seen(&value);
        context::track_read(&self.inner, &value);
        value
    }

    /// Read the current value without registering a dependency.
    pub fn peek(&self) -> T {
        let value = self.inner.value.read().clone();
        self.inner.core.note_seen(&value);
        value
    }

    /// Assign a new value and notify if it differs from the current one
    /// under the equality policy.
    pub fn set(&self, value: T) {
        {
            let current = self.inner.value.read();
            if (self.inner.core.equality())(&current, &value) {
                trace!(cell = %self.inner.core.label(), "set skipped, value unchanged");
                return;
            }
        }
        *self.inner.value.write() = value;
        trace!(cell = %self.inner.core.label(), "value updated");
        self.inner.core.invalidate_dependents();
        self.notify_or_defer();
    }

    /// Derive the next value from the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.inner.value.read());
        self.set(next);
    }

    /// Restore the value the cell was constructed with.
    pub fn reset(&self) {
        self.set(self.inner.initial.clone());
    }

    /// Mutate the value in place and unconditionally request a
    /// notification check.
    ///
    /// The check still compares against the last broadcast value, so a
    /// mutation that leaves the value equal under the equality policy
    /// does not notify.
    pub fn mutate(&self, f: impl FnOnce(&mut T)) {
        {
            let mut value = self.inner.value.write();
            f(&mut value);
        }
        trace!(cell = %self.inner.core.label(), "value mutated in place");
        self.inner.core.invalidate_dependents();
        self.notify_or_defer();
    }

    /// Attach `callback` without invoking it. The next broadcast that
    /// changes the value will be its first call.
    pub fn observe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.inner.core.note_seen(&self.inner.value.read());
        self.add_subscriber(Arc::new(callback))
    }

    /// Attach `callback` and invoke it synchronously with the current
    /// value before returning.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let current = self.inner.value.read().clone();
        self.inner.core.mark_broadcast(&current);
        callback(&current);
        self.add_subscriber(Arc::new(callback))
    }

    /// Idempotent removal by id.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.core.remove_subscriber(id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.core.subscriber_count()
    }

    fn add_subscriber(&self, callback: Callback<T>) -> Subscription {
        let id = self.inner.core.add_subscriber(callback);
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(
            id,
            Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.core.remove_subscriber(id);
                }
            }),
        )
    }

    fn notify_or_defer(&self) {
        let pending: Arc<dyn PendingCell> = self.inner.clone();
        if !batch::defer(pending) {
            self.inner.notify_if_changed();
        }
    }
}

impl<T> Source<T> for WritableInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn core(&self) -> &CellCore<T> {
        &self.core
    }

    fn current(&self) -> Result<T, CycleError> {
        Ok(self.value.read().clone())
    }
}

impl<T> PendingCell for WritableInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> CellId {
        self.core.id()
    }

    fn notify_if_changed(&self) {
        let current = self.value.read().clone();
        if self.core.broadcast_if_changed(&current) {
            self.core.notify_dependents();
        }
    }
}

impl<T> Clone for Writable<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Debug for Writable<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writable")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("value", &self.peek())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn get_and_set() {
        let cell = Writable::new(0);
        assert_eq!(cell.get(), 0);

        cell.set(42);
        assert_eq!(cell.get(), 42);
    }

    #[test]
    fn update_uses_current_value() {
        let cell = Writable::new(10);
        cell.update(|v| v + 5);
        assert_eq!(cell.get(), 15);
    }

    #[test]
    fn reset_restores_initial_value() {
        let cell = Writable::new(1);
        cell.set(99);
        cell.reset();
        assert_eq!(cell.get(), 1);
    }

    #[test]
    fn observe_does_not_fire_immediately() {
        let cell = Writable::new(0);
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        cell.observe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cell.set(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_fires_immediately_then_on_change() {
        let cell = Writable::new(7);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        cell.subscribe(move |v| seen_clone.lock().push(*v));
        assert_eq!(*seen.lock(), vec![7]);

        cell.set(8);
        assert_eq!(*seen.lock(), vec![7, 8]);

        // Unchanged set after the immediate call must not re-fire.
        cell.set(8);
        assert_eq!(*seen.lock(), vec![7, 8]);
    }

    #[test]
    fn unchanged_set_is_a_no_op() {
        let cell = Writable::new(3);
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        cell.observe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        cell.set(3);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn custom_equality_suppresses_notification() {
        // Equal lengths count as equal values.
        let cell = Writable::with_options(
            String::from("aa"),
            CellOptions::with_equality(|a: &String, b: &String| a.len() == b.len()),
        );
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        cell.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cell.set(String::from("bb"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cell.set(String::from("ccc"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mutate_notifies_on_in_place_change() {
        let cell = Writable::new(vec![1, 2]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        cell.observe(move |v: &Vec<i32>| seen_clone.lock().push(v.clone()));

        cell.mutate(|v| v.push(3));
        assert_eq!(*seen.lock(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn unsubscribe_by_id_stops_notifications() {
        let cell = Writable::new(0);
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        let sub = cell.observe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        cell.set(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cell.unsubscribe(sub.id());
        cell.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_handle_unsubscribes() {
        let cell = Writable::new(0);
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        let sub = cell.observe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        cell.set(1);
        sub.unsubscribe();
        sub.unsubscribe();
        cell.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clone_shares_state() {
        let a = Writable::new(0);
        let b = a.clone();

        a.set(42);
        assert_eq!(b.get(), 42);

        b.set(100);
        assert_eq!(a.get(), 100);
    }
}
