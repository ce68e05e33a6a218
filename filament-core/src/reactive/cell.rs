//! Shared cell machinery.
//!
//! Both cell kinds — [`Writable`](super::Writable) and
//! [`Derived`](super::Derived) — are built around a [`CellCore`]: the
//! subscriber list, the dependent set, the equality policy and the
//! last-broadcast bookkeeping that suppresses redundant notifications.
//!
//! # Change suppression
//!
//! A cell never invokes a subscriber with a value equal (under its
//! equality policy) to the last value it broadcast. The comparison is
//! against `last_broadcast`, not against the value at the moment of any
//! individual write, which is what makes batched writes that round-trip
//! back to the original value produce zero notifications.
//!
//! # Dependents
//!
//! Dependents are recorded by [`CellId`] and resolved through the
//! [`registry`](super::registry); a missing registry entry means the
//! derived cell was dropped and the edge is pruned on the next walk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::trace;

use super::registry;
use super::subscriber::SubscriberId;

/// Counter for generating unique cell IDs.
static CELL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a cell.
///
/// Cell ids are the stable identity used for dependent bookkeeping: a
/// cell records *which* derived cells read it, not owning references to
/// them, so a derived cell with no other referrers can be dropped
/// without its inputs keeping it alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(u64);

impl CellId {
    pub(crate) fn next() -> Self {
        Self(CELL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cell{}", self.0)
    }
}

/// Pluggable change predicate: returns `true` when two values are
/// considered equal (no notification needed).
pub type Equality<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Subscriber callback, invoked with a borrow of the new value.
pub(crate) type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A derived cell was read while its own getter was running.
///
/// The dependency graph is acyclic by construction; hitting this means a
/// getter (transitively) read the cell it computes.
#[derive(Debug, Clone, Error)]
#[error("reactive cycle: {cell} was read while computing its own value")]
pub struct CycleError {
    pub(crate) cell: String,
}

/// Configuration recognized by cell constructors.
///
/// - `equality`: change predicate; defaults to `PartialEq`.
/// - `cache_size`: memo history depth for derived cells (default 1,
///   0 disables memoization). Ignored by writable cells.
/// - `name`: debug label, no behavioral effect.
///
/// `CellOptions::new()` requires `T: PartialEq` for the default
/// predicate; `CellOptions::with_equality` lifts that bound for types
/// without a usable `PartialEq`.
pub struct CellOptions<T> {
    pub(crate) equality: Equality<T>,
    pub(crate) cache_size: usize,
    pub(crate) name: Option<String>,
}

impl<T: PartialEq> CellOptions<T> {
    pub fn new() -> Self {
        Self {
            equality: Arc::new(|a: &T, b: &T| a == b),
            cache_size: 1,
            name: None,
        }
    }
}

impl<T: PartialEq> Default for CellOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CellOptions<T> {
    /// Build options around a custom equality predicate.
    pub fn with_equality<F>(equality: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            equality: Arc::new(equality),
            cache_size: 1,
            name: None,
        }
    }

    /// Replace the equality predicate.
    pub fn equality<F>(mut self, equality: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.equality = Arc::new(equality);
        self
    }

    /// Set the memo history depth. 0 disables memoization.
    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Attach a debug label.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Common bookkeeping shared by both cell kinds.
pub(crate) struct CellCore<T> {
    id: CellId,
    name: Option<String>,
    equality: Equality<T>,

    /// Value as of the last time subscribers were actually called.
    /// `None` until a value has been surfaced to anyone.
    last_broadcast: Mutex<Option<T>>,

    /// External observers, in attach order.
    subscribers: RwLock<Vec<(SubscriberId, Callback<T>)>>,

    /// Ids of derived cells that read this cell during their latest
    /// computation. Resolved through the registry, pruned when dead.
    dependents: RwLock<IndexSet<CellId>>,
}

impl<T> CellCore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(equality: Equality<T>, name: Option<String>) -> Self {
        Self {
            id: CellId::next(),
            name,
            equality,
            last_broadcast: Mutex::new(None),
            subscribers: RwLock::new(Vec::new()),
            dependents: RwLock::new(IndexSet::new()),
        }
    }

    pub(crate) fn id(&self) -> CellId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Label used in log lines and error messages.
    pub(crate) fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", self.id, name),
            None => self.id.to_string(),
        }
    }

    pub(crate) fn equality(&self) -> &Equality<T> {
        &self.equality
    }

    /// Establish the change-suppression baseline if none exists yet.
    ///
    /// Called whenever a value is surfaced through `get`/`peek`/`observe`
    /// so the first real notification is measured against something.
    pub(crate) fn note_seen(&self, current: &T) {
        let mut last = self.last_broadcast.lock();
        if last.is_none() {
            *last = Some(current.clone());
        }
    }

    /// Pin the baseline to `current` (used by `subscribe`, which hands
    /// the caller the current value synchronously).
    pub(crate) fn mark_broadcast(&self, current: &T) {
        *self.last_broadcast.lock() = Some(current.clone());
    }

    /// Invoke every subscriber with `current` iff it differs from the
    /// last broadcast value under the equality policy.
    ///
    /// Returns whether a broadcast happened; the caller is responsible
    /// for cascading to dependents on `true`. The subscriber list is
    /// snapshotted before iterating, so callbacks may unsubscribe
    /// themselves or others without skipping anyone.
    pub(crate) fn broadcast_if_changed(&self, current: &T) -> bool {
        {
            let mut last = self.last_broadcast.lock();
            let changed = match &*last {
                Some(prev) => !(self.equality)(prev, current),
                None => true,
            };
            if !changed {
                return false;
            }
            *last = Some(current.clone());
        }

        let callbacks: Vec<Callback<T>> = {
            let subscribers = self.subscribers.read();
            subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        trace!(cell = %self.label(), subscribers = callbacks.len(), "broadcast");
        for callback in callbacks {
            callback(current);
        }
        true
    }

    pub(crate) fn add_subscriber(&self, callback: Callback<T>) -> SubscriberId {
        let id = SubscriberId::new();
        self.subscribers.write().push((id, callback));
        id
    }

    /// Idempotent removal. Returns whether a callback was removed.
    pub(crate) fn remove_subscriber(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.subscribers.read().is_empty()
    }

    pub(crate) fn add_dependent(&self, dependent: CellId) {
        self.dependents.write().insert(dependent);
    }

    pub(crate) fn remove_dependent(&self, dependent: CellId) {
        self.dependents.write().shift_remove(&dependent);
    }

    pub(crate) fn has_dependents(&self) -> bool {
        !self.dependents.read().is_empty()
    }

    /// Mark every live dependent stale, pruning dead ones.
    ///
    /// This is the synchronous invalidation pass that runs on every
    /// write, batched or not: a derived cell read later in the same
    /// batch must know its value can no longer be trusted.
    pub(crate) fn invalidate_dependents(&self) {
        for id in self.dependent_snapshot() {
            match registry::lookup(id) {
                Some(dependent) => dependent.mark_stale(),
                None => {
                    trace!(cell = %self.label(), dependent = %id, "pruning dead dependent");
                    self.remove_dependent(id);
                }
            }
        }
    }

    /// Ask every live dependent to re-check itself, pruning dead ones.
    ///
    /// Runs after a broadcast (immediately, or at the end of the
    /// outermost batch).
    pub(crate) fn notify_dependents(&self) {
        for id in self.dependent_snapshot() {
            match registry::lookup(id) {
                Some(dependent) => dependent.on_dependency_changed(),
                None => {
                    trace!(cell = %self.label(), dependent = %id, "pruning dead dependent");
                    self.remove_dependent(id);
                }
            }
        }
    }

    fn dependent_snapshot(&self) -> Vec<CellId> {
        self.dependents.read().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    fn core() -> CellCore<i32> {
        CellCore::new(Arc::new(|a: &i32, b: &i32| a == b), None)
    }

    #[test]
    fn cell_ids_are_unique() {
        let a = CellId::next();
        let b = CellId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn broadcast_suppresses_unchanged_values() {
        let core = core();
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        core.add_subscriber(Arc::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(core.broadcast_if_changed(&1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Same value again: suppressed.
        assert!(!core.broadcast_if_changed(&1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(core.broadcast_if_changed(&2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn note_seen_sets_baseline_only_once() {
        let core = core();
        core.note_seen(&7);
        // Baseline is 7; broadcasting 7 is a no-op.
        assert!(!core.broadcast_if_changed(&7));
        core.note_seen(&8);
        // Baseline unchanged by the second note_seen.
        assert!(core.broadcast_if_changed(&8));
    }

    #[test]
    fn remove_subscriber_is_idempotent() {
        let core = core();
        let id = core.add_subscriber(Arc::new(|_| {}));
        assert_eq!(core.subscriber_count(), 1);
        assert!(core.remove_subscriber(id));
        assert!(!core.remove_subscriber(id));
        assert_eq!(core.subscriber_count(), 0);
    }

    #[test]
    fn subscriber_may_unsubscribe_during_broadcast() {
        let core = Arc::new(core());
        let calls = Arc::new(AtomicI32::new(0));

        // First subscriber removes itself mid-broadcast; the second must
        // still be visited exactly once.
        let self_id = Arc::new(Mutex::new(None::<SubscriberId>));
        let core_clone = core.clone();
        let self_id_clone = self_id.clone();
        let id = core.add_subscriber(Arc::new(move |_| {
            if let Some(id) = *self_id_clone.lock() {
                core_clone.remove_subscriber(id);
            }
        }));
        *self_id.lock() = Some(id);

        let calls_clone = calls.clone();
        core.add_subscriber(Arc::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(core.broadcast_if_changed(&1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(core.subscriber_count(), 1);
    }
}
