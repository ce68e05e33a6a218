//! Watch: side effects driven by a derived cell.
//!
//! [`watch`] wraps an action in a derived cell whose getter runs the
//! action and collects the cells it reads, then subscribes to that cell
//! so every change re-runs the action. The action may hand back a
//! cleanup closure; it runs before the next execution and once more on
//! disposal.
//!
//! The derived cell's value is an execution counter, compared with an
//! always-unequal policy, so every recomputation counts as a change and
//! reaches the subscriber that drives the next run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::cell::{CellId, CellOptions};
use super::context;
use super::derived::Derived;
use super::subscriber::Subscription;

/// Cleanup closure returned by a watch action.
pub type Cleanup = Box<dyn FnOnce() + Send + Sync>;

/// Handle to a running watch. Disposal is explicit or via `Drop`.
pub struct Watch {
    cell: Derived<u64>,
    subscription: Subscription,
    cleanup: Arc<Mutex<Option<Cleanup>>>,
}

/// Run `action` now and again whenever any cell it reads changes.
///
/// Dependencies are re-collected on every run, so an action that reads
/// different cells on different branches only listens to the branch it
/// last took. The returned [`Watch`] keeps the effect alive; dropping it
/// stops the effect and runs the final cleanup.
pub fn watch<F>(action: F) -> Watch
where
    F: Fn() -> Option<Cleanup> + Send + Sync + 'static,
{
    watch_named(action, None::<String>)
}

/// [`watch`] with a debug label for log lines.
pub fn watch_named<F>(action: F, name: Option<impl Into<String>>) -> Watch
where
    F: Fn() -> Option<Cleanup> + Send + Sync + 'static,
{
    let cleanup: Arc<Mutex<Option<Cleanup>>> = Arc::new(Mutex::new(None));
    let runs = AtomicU64::new(0);

    let cleanup_clone = cleanup.clone();
    let getter = move || {
        // The previous run's cleanup executes before the new reads, and
        // untracked: anything it reads belongs to the old run, not the
        // dependency set being collected now.
        if let Some(cleanup) = cleanup_clone.lock().take() {
            context::untracked(cleanup);
        }
        *cleanup_clone.lock() = action();
        runs.fetch_add(1, Ordering::Relaxed)
    };

    // Every run yields a distinct counter value; the always-false
    // equality makes doubly sure no run is ever suppressed.
    let mut options = CellOptions::with_equality(|_: &u64, _: &u64| false).cache_size(0);
    if let Some(name) = name {
        options = options.name(name);
    }
    let cell = Derived::with_options(getter, options);

    // observe (not subscribe) still forces the first run: attaching a
    // subscriber evaluates the cell.
    let subscription = cell.observe(|_| {});
    debug!(cell = %cell.id(), "watch started");

    Watch { cell, subscription, cleanup }
}

impl Watch {
    /// Id of the underlying derived cell.
    pub fn id(&self) -> CellId {
        self.cell.id()
    }

    /// Number of cells the last run read.
    pub fn dependency_count(&self) -> usize {
        self.cell.dependency_count()
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Stop re-running the action and run the pending cleanup.
    /// Idempotent.
    pub fn dispose(&self) {
        if !self.subscription.is_active() {
            return;
        }
        self.subscription.unsubscribe();
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
        debug!(cell = %self.cell.id(), "watch disposed");
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("cell", &self.cell.id())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{batch, Writable};
    use std::sync::atomic::AtomicI32;

    #[test]
    fn runs_immediately_and_on_change() {
        let input = Writable::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let input_clone = input.clone();
        let seen_clone = seen.clone();
        let watch = watch(move || {
            seen_clone.lock().push(input_clone.get());
            None
        });

        assert_eq!(*seen.lock(), vec![1]);
        input.set(2);
        assert_eq!(*seen.lock(), vec![1, 2]);
        drop(watch);
    }

    #[test]
    fn cleanup_runs_before_next_run_and_on_dispose() {
        let input = Writable::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));

        let input_clone = input.clone();
        let log_clone = log.clone();
        let watch = watch(move || {
            let v = input_clone.get();
            log_clone.lock().push(format!("run {v}"));
            let log_inner = log_clone.clone();
            Some(Box::new(move || log_inner.lock().push(format!("cleanup {v}"))) as Cleanup)
        });

        input.set(2);
        watch.dispose();
        watch.dispose(); // idempotent

        assert_eq!(
            *log.lock(),
            vec!["run 1", "cleanup 1", "run 2", "cleanup 2"]
        );
    }

    #[test]
    fn disposed_watch_stops_reacting() {
        let input = Writable::new(1);
        let runs = Arc::new(AtomicI32::new(0));

        let input_clone = input.clone();
        let runs_clone = runs.clone();
        let watch = watch(move || {
            input_clone.get();
            runs_clone.fetch_add(1, Ordering::SeqCst);
            None
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(watch.is_active());

        watch.dispose();
        assert!(!watch.is_active());
        input.set(2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn re_collects_dependencies_each_run() {
        let gate = Writable::new(true);
        let a = Writable::new(0);
        let b = Writable::new(0);
        let runs = Arc::new(AtomicI32::new(0));

        let (gate_c, a_c, b_c, runs_c) = (gate.clone(), a.clone(), b.clone(), runs.clone());
        let watch = watch(move || {
            if gate_c.get() {
                a_c.get();
            } else {
                b_c.get();
            }
            runs_c.fetch_add(1, Ordering::SeqCst);
            None
        });
        assert_eq!(watch.dependency_count(), 2); // gate and a

        gate.set(false);
        let after_switch = runs.load(Ordering::SeqCst);

        // `a` is no longer read.
        a.set(1);
        assert_eq!(runs.load(Ordering::SeqCst), after_switch);

        b.set(1);
        assert_eq!(runs.load(Ordering::SeqCst), after_switch + 1);
        drop(watch);
    }

    #[test]
    fn batched_writes_run_the_action_once() {
        let a = Writable::new(0);
        let b = Writable::new(0);
        let runs = Arc::new(AtomicI32::new(0));

        let (a_c, b_c, runs_c) = (a.clone(), b.clone(), runs.clone());
        let watch = watch(move || {
            a_c.get();
            b_c.get();
            runs_c.fetch_add(1, Ordering::SeqCst);
            None
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        batch(|| {
            a.set(1);
            b.set(1);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        drop(watch);
    }

    #[test]
    fn cleanup_reads_do_not_become_dependencies() {
        let input = Writable::new(0);
        let other = Writable::new(0);
        let runs = Arc::new(AtomicI32::new(0));

        let (input_c, other_c, runs_c) = (input.clone(), other.clone(), runs.clone());
        let watch = watch(move || {
            input_c.get();
            runs_c.fetch_add(1, Ordering::SeqCst);
            let other_inner = other_c.clone();
            Some(Box::new(move || {
                other_inner.get();
            }) as Cleanup)
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(watch.dependency_count(), 1);

        // The second run executes the first cleanup, which reads
        // `other` inside the new evaluation; that read must not be
        // collected as a dependency.
        input.set(1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(watch.dependency_count(), 1);

        other.set(1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        drop(watch);
    }

    #[test]
    fn drop_disposes_and_runs_final_cleanup() {
        let cleaned = Arc::new(AtomicI32::new(0));
        let cleaned_clone = cleaned.clone();
        let watch = watch(move || {
            let cleaned_inner = cleaned_clone.clone();
            Some(Box::new(move || {
                cleaned_inner.fetch_add(1, Ordering::SeqCst);
            }) as Cleanup)
        });

        drop(watch);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }
}
