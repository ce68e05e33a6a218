//! Derived cell.
//!
//! A Derived holds a getter and recomputes lazily: a dependency change
//! only marks it stale, and the getter runs again the next time someone
//! actually reads the cell (or when it has subscribers to notify).
//!
//! # State machine
//!
//! - **Fresh**: the last computed value is known valid.
//! - **Stale**: a tracked dependency changed; the value must be
//!   recovered from the memo cache or recomputed before being trusted.
//! - **Computing**: transient while the getter runs. Reading the cell
//!   from its own getter is a cycle and yields [`CycleError`].
//!
//! # Memo cache
//!
//! Each computation records the exact set of `(dependency, value read)`
//! pairs alongside the result. A stale read first scans this history,
//! front to back, for an entry whose every recorded dependency still
//! holds its recorded value; a hit adopts that result, relinks the
//! snapshot's edges as the live dependency set and moves the entry to
//! the front — the getter never runs. Eviction drops the least recently
//! used entry from the back. The history is an ordered list with a
//! linear scan, not a map: snapshots are exact-equality matches over a
//! variable-length dependency set, and the list is single-digit sized.
//!
//! # Edges
//!
//! The dependency set is rebuilt from scratch on every recomputation:
//! old edges are unlinked first, and only cells actually read on the
//! latest pass re-register this cell as a dependent. A cell is therefore
//! never charged to recompute a dependent that no longer reads it. When
//! the last observer detaches (no subscribers and no dependents left),
//! the cell drops all of its edges and goes stale; the next read
//! rediscovers them through a cache hit or a recomputation.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{error, trace, warn};

use super::cell::{Callback, CellCore, CellId, CellOptions, CycleError};
use super::context::{self, DepEdge, EvalScope, Source};
use super::registry::{self, Dependent};
use super::subscriber::{SubscriberId, Subscription};

/// Validity of a derived cell's held value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedState {
    /// The held value is up to date.
    Fresh,

    /// A tracked dependency changed since the last computation.
    Stale,

    /// The getter is currently running.
    Computing,
}

/// One memoized computation: the result plus the dependency snapshot
/// that produced it.
struct CacheEntry<T> {
    value: T,
    snapshot: Vec<Arc<dyn DepEdge>>,
}

/// A reactive cell computed from other cells.
///
/// # Example
///
/// ```rust,ignore
/// let count = Writable::new(1);
/// let doubled = {
///     let count = count.clone();
///     Derived::new(move || count.get() * 2)
/// };
///
/// assert_eq!(doubled.get(), 2);
/// count.set(3);
/// assert_eq!(doubled.get(), 6);
/// ```
pub struct Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<DerivedInner<T>>,
}

pub(crate) struct DerivedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    core: CellCore<T>,
    getter: Box<dyn Fn() -> T + Send + Sync>,
    state: Mutex<DerivedState>,

    /// Set when a dependency is written while the getter is running:
    /// the in-flight result is already out of date when it lands.
    dirtied: AtomicBool,

    /// Last computed value; `None` until the first evaluation.
    value: RwLock<Option<T>>,

    /// Outgoing edges discovered by the latest computation (or adopted
    /// from a cache hit).
    deps: Mutex<Vec<Arc<dyn DepEdge>>>,

    cache: Mutex<SmallVec<[CacheEntry<T>; 2]>>,
    cache_size: usize,
}

impl<T> Derived<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Create a derived cell with the default (`PartialEq`) equality
    /// policy and a single-entry memo cache.
    ///
    /// The getter does not run here; the first read or subscription
    /// triggers it.
    pub fn new<F>(getter: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_options(getter, CellOptions::new())
    }
}

impl<T> Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a derived cell with explicit options.
    pub fn with_options<F>(getter: F, options: CellOptions<T>) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let inner = Arc::new(DerivedInner {
            core: CellCore::new(options.equality, options.name),
            getter: Box::new(getter),
            state: Mutex::new(DerivedState::Stale),
            dirtied: AtomicBool::new(false),
            value: RwLock::new(None),
            deps: Mutex::new(Vec::new()),
            cache: Mutex::new(SmallVec::new()),
            cache_size: options.cache_size,
        });
        let dependent: Arc<dyn Dependent> = inner.clone();
        registry::register(inner.core.id(), Arc::downgrade(&dependent));
        Self { inner }
    }

    pub fn id(&self) -> CellId {
        self.inner.core.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.core.name()
    }

    /// Current validity of the held value.
    pub fn state(&self) -> DerivedState {
        *self.inner.state.lock()
    }

    /// Whether any computation has produced a value yet.
    pub fn has_value(&self) -> bool {
        self.inner.value.read().is_some()
    }

    /// Number of dependencies discovered by the latest computation.
    pub fn dependency_count(&self) -> usize {
        self.inner.deps.lock().len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.core.subscriber_count()
    }

    /// Read the value, evaluating if necessary, and register this cell
    /// as a dependency of the computation in progress, if any.
    ///
    /// # Panics
    ///
    /// Panics if called (transitively) from this cell's own getter; use
    /// [`try_get`](Self::try_get) for a non-panicking probe.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|err| panic!("{err}"))
    }

    /// Fallible form of [`get`](Self::get).
    pub fn try_get(&self) -> Result<T, CycleError> {
        let value = self.inner.current()?;
        self.inner.core.note_seen(&value);
        context::track_read(&self.inner, &value);
        Ok(value)
    }

    /// Read the value, evaluating if necessary, without registering a
    /// dependency edge.
    ///
    /// # Panics
    ///
    /// Panics on a re-entrant read, like [`get`](Self::get).
    pub fn peek(&self) -> T {
        let value = self.inner.current().unwrap_or_else(|err| panic!("{err}"));
        self.inner.core.note_seen(&value);
        value
    }

    /// Attach `callback` without invoking it.
    ///
    /// Forces an evaluation first so a value and its dependency edges
    /// exist by the time the subscriber is attached; afterwards every
    /// dependency change that moves the value calls `callback`.
    pub fn observe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let current = self.inner.current().unwrap_or_else(|err| panic!("{err}"));
        self.inner.core.note_seen(&current);
        self.add_subscriber(Arc::new(callback))
    }

    /// Attach `callback` and invoke it synchronously with the current
    /// value before returning.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let current = self.inner.current().unwrap_or_else(|err| panic!("{err}"));
        self.inner.core.mark_broadcast(&current);
        callback(&current);
        self.add_subscriber(Arc::new(callback))
    }

    /// Idempotent removal by id. When the last observer of any kind
    /// detaches, the cell releases its dependency edges.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.inner.core.remove_subscriber(id) {
            self.inner.release_if_unobserved();
        }
    }

    fn add_subscriber(&self, callback: Callback<T>) -> Subscription {
        let id = self.inner.core.add_subscriber(callback);
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(
            id,
            Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    if inner.core.remove_subscriber(id) {
                        inner.release_if_unobserved();
                    }
                }
            }),
        )
    }
}

/// Restores `Stale` if an evaluation does not run to completion, so a
/// panicking getter leaves the cell recoverable: the next read retries.
struct StateGuard<'a> {
    state: &'a Mutex<DerivedState>,
    dirtied: &'a AtomicBool,
    armed: bool,
}

impl<'a> StateGuard<'a> {
    /// A run dirtied mid-flight lands on `Stale`: the value it produced
    /// was computed from inputs that have since moved.
    fn complete(mut self) {
        let mut state = self.state.lock();
        *state = if self.dirtied.swap(false, Ordering::SeqCst) {
            DerivedState::Stale
        } else {
            DerivedState::Fresh
        };
        self.armed = false;
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.state.lock() = DerivedState::Stale;
            self.dirtied.store(false, Ordering::SeqCst);
        }
    }
}

impl<T> DerivedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Current externally visible value: the held value when fresh,
    /// otherwise a cache recovery or a recomputation.
    fn current(&self) -> Result<T, CycleError> {
        {
            let mut state = self.state.lock();
            match *state {
                DerivedState::Computing => {
                    return Err(CycleError { cell: self.core.label() });
                }
                DerivedState::Fresh => {
                    return Ok(self
                        .value
                        .read()
                        .clone()
                        .expect("fresh derived cell should hold a value"));
                }
                DerivedState::Stale => {
                    *state = DerivedState::Computing;
                }
            }
        }

        let guard = StateGuard { state: &self.state, dirtied: &self.dirtied, armed: true };
        let value = match self.cache_lookup() {
            Some((value, snapshot)) => self.adopt_cached(value, snapshot),
            None => self.recompute(),
        };
        guard.complete();
        Ok(value)
    }

    /// Scan the memo history, front to back, for an entry whose every
    /// recorded dependency still holds its recorded value.
    ///
    /// Validation may itself pull stale dependencies current, so it runs
    /// without holding the cache lock.
    fn cache_lookup(&self) -> Option<(T, Vec<Arc<dyn DepEdge>>)> {
        if self.cache_size == 0 {
            return None;
        }
        let snapshots: Vec<Vec<Arc<dyn DepEdge>>> =
            self.cache.lock().iter().map(|entry| entry.snapshot.clone()).collect();
        let hit = snapshots
            .iter()
            .position(|snapshot| snapshot.iter().all(|edge| edge.is_current()))?;

        let mut cache = self.cache.lock();
        if hit >= cache.len() {
            return None;
        }
        let entry = cache.remove(hit);
        let result = (entry.value.clone(), entry.snapshot.clone());
        cache.insert(0, entry);
        trace!(cell = %self.core.label(), "memo cache hit");
        Some(result)
    }

    /// Take a cache hit: adopt the value and make the snapshot the live
    /// dependency set.
    fn adopt_cached(&self, value: T, snapshot: Vec<Arc<dyn DepEdge>>) -> T {
        self.unlink_all();
        for edge in &snapshot {
            edge.link(self.core.id());
        }
        *self.deps.lock() = snapshot;
        *self.value.write() = Some(value.clone());
        value
    }

    /// Run the getter inside an evaluation frame and rebuild the
    /// dependency set from the reads it performs.
    fn recompute(&self) -> T {
        self.unlink_all();
        let scope = EvalScope::enter(self.core.id());
        let value = (self.getter)();
        let edges = scope.finish();
        trace!(
            cell = %self.core.label(),
            dependencies = edges.len(),
            "recomputed"
        );

        if self.cache_size > 0 {
            let mut cache = self.cache.lock();
            cache.insert(0, CacheEntry { value: value.clone(), snapshot: edges.clone() });
            cache.truncate(self.cache_size);
        }
        *self.deps.lock() = edges;
        *self.value.write() = Some(value.clone());
        value
    }

    fn unlink_all(&self) {
        let old = std::mem::take(&mut *self.deps.lock());
        for edge in &old {
            edge.unlink(self.core.id());
        }
    }

    /// Release edges if nothing observes this cell at all. A dependent
    /// derived cell counts as an observer: its subscribers downstream
    /// rely on this cell's edges for their invalidation path, so the
    /// edges must outlive this cell's own last subscriber.
    fn release_if_unobserved(&self) {
        if self.core.has_subscribers() || self.core.has_dependents() {
            return;
        }
        self.release_edges();
    }

    /// Drop all dependency edges and go stale. Edges are rediscovered on
    /// the next read, usually through a cache hit.
    fn release_edges(&self) {
        trace!(cell = %self.core.label(), "releasing dependency edges");
        self.unlink_all();
        let mut state = self.state.lock();
        if *state == DerivedState::Fresh {
            *state = DerivedState::Stale;
        }
    }
}

impl<T> Source<T> for DerivedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn core(&self) -> &CellCore<T> {
        &self.core
    }

    fn current(&self) -> Result<T, CycleError> {
        DerivedInner::current(self)
    }
}

impl<T> Dependent for DerivedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> CellId {
        self.core.id()
    }

    fn mark_stale(&self) {
        let mut state = self.state.lock();
        match *state {
            DerivedState::Fresh => {
                *state = DerivedState::Stale;
                drop(state);
                trace!(cell = %self.core.label(), "marked stale");
                // Transitive: anything computed from this cell can no
                // longer be trusted either.
                self.core.invalidate_dependents();
            }
            // Dependents were already marked when this cell went stale.
            DerivedState::Stale => {}
            DerivedState::Computing => {
                // The in-flight run read a value that has since moved;
                // its result must land Stale and be recomputed on the
                // next read.
                self.dirtied.store(true, Ordering::SeqCst);
                drop(state);
                warn!(
                    cell = %self.core.label(),
                    "dependency changed while the getter was running"
                );
                self.core.invalidate_dependents();
            }
        }
    }

    fn on_dependency_changed(&self) {
        if !self.core.has_subscribers() {
            // Stay stale and defer the cost to whoever reads this cell
            // next, but pass the re-check downstream: a subscribed cell
            // further down still gets its notification.
            self.core.notify_dependents();
            return;
        }
        match self.current() {
            Ok(current) => {
                if self.core.broadcast_if_changed(&current) {
                    self.core.notify_dependents();
                }
            }
            Err(err) => {
                error!(cell = %self.core.label(), error = %err, "skipping notification");
            }
        }
    }
}

impl<T> Drop for DerivedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        registry::unregister(self.core.id());
        for edge in self.deps.get_mut().iter() {
            edge.unlink(self.core.id());
        }
    }
}

impl<T> Clone for Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Debug for Derived<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("has_value", &self.has_value())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
