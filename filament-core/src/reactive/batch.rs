//! Batched writes.
//!
//! [`batch`] opens a transaction scope on the current thread: writable
//! cells written inside the scope defer their subscriber notification
//! and instead register themselves in a deduplicated pending set. When
//! the *outermost* scope exits, each pending cell runs its
//! notify-if-changed pass once.
//!
//! Invalidation is never deferred — a write marks its dependents stale
//! immediately — so a derived cell read later in the same batch observes
//! the new value. Only the externally visible notifications wait.
//!
//! Because the flush compares against each cell's last broadcast value
//! rather than the value at the moment of any individual write, a cell
//! that changes several times inside one batch notifies at most once,
//! and a cell that round-trips back to its last broadcast value notifies
//! not at all.

use std::cell::RefCell;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::trace;

use super::cell::CellId;

/// A cell whose subscribers may need checking at the end of a batch.
pub(crate) trait PendingCell: Send + Sync {
    fn id(&self) -> CellId;

    /// Compare against the last broadcast value and notify subscribers
    /// and dependents if it moved.
    fn notify_if_changed(&self);
}

#[derive(Default)]
struct BatchState {
    depth: usize,
    pending: IndexMap<CellId, Arc<dyn PendingCell>>,
}

thread_local! {
    static BATCH: RefCell<BatchState> = RefCell::new(BatchState::default());
}

/// Run `action` with notifications deferred until the outermost batch
/// scope exits. Nested calls join the enclosing batch. Returns whatever
/// `action` returns.
///
/// If `action` panics, the scope unwinds without flushing; the pending
/// set is discarded and the depth counter is restored, so the thread is
/// immediately usable again.
pub fn batch<R>(action: impl FnOnce() -> R) -> R {
    BATCH.with(|state| state.borrow_mut().depth += 1);
    let _guard = BatchGuard;
    action()
}

struct BatchGuard;

impl Drop for BatchGuard {
    fn drop(&mut self) {
        let flush = BATCH.with(|state| {
            let mut state = state.borrow_mut();
            state.depth -= 1;
            if state.depth == 0 {
                Some(std::mem::take(&mut state.pending))
            } else {
                None
            }
        });
        let Some(pending) = flush else {
            return;
        };
        if std::thread::panicking() {
            return;
        }
        if !pending.is_empty() {
            trace!(cells = pending.len(), "flushing batch");
        }
        for (_, cell) in pending {
            cell.notify_if_changed();
        }
    }
}

/// Register `cell` with the active batch, if any. Returns `false` when
/// no batch is open and the caller should notify immediately.
pub(crate) fn defer(cell: Arc<dyn PendingCell>) -> bool {
    BATCH.with(|state| {
        let mut state = state.borrow_mut();
        if state.depth == 0 {
            return false;
        }
        let id = cell.id();
        state.pending.entry(id).or_insert(cell);
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct Probe {
        id: CellId,
        notified: AtomicI32,
    }

    impl Probe {
        fn new() -> Arc<Self> {
            Arc::new(Self { id: CellId::next(), notified: AtomicI32::new(0) })
        }
    }

    impl PendingCell for Probe {
        fn id(&self) -> CellId {
            self.id
        }

        fn notify_if_changed(&self) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn defer_outside_batch_is_refused() {
        let probe = Probe::new();
        assert!(!defer(probe.clone()));
        assert_eq!(probe.notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pending_cells_flush_once_at_outermost_exit() {
        let probe = Probe::new();
        batch(|| {
            assert!(defer(probe.clone()));
            assert!(defer(probe.clone())); // dedup
            batch(|| {
                assert!(defer(probe.clone()));
                assert_eq!(probe.notified.load(Ordering::SeqCst), 0);
            });
            // Nested exit must not flush.
            assert_eq!(probe.notified.load(Ordering::SeqCst), 0);
        });
        assert_eq!(probe.notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_returns_action_result() {
        assert_eq!(batch(|| 42), 42);
    }

    #[test]
    fn panicking_batch_discards_pending() {
        let probe = Probe::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            batch(|| {
                defer(probe.clone());
                panic!("boom");
            })
        }));
        assert!(result.is_err());
        assert_eq!(probe.notified.load(Ordering::SeqCst), 0);
        // Depth was restored: no batch is open any more.
        assert!(!defer(probe.clone()));
    }
}
