//! Evaluation context and dependency edges.
//!
//! A thread-local stack tracks which derived cell is currently running
//! its getter. Reading a cell through `get` while the stack is non-empty
//! registers the innermost computing cell as a dependent of the cell
//! being read, and records the value seen — that record later doubles as
//! a memo-cache snapshot entry.
//!
//! The stack is strictly push/pop disciplined: [`EvalScope`] pops in its
//! `Drop`, so a getter that panics still leaves the stack attributing
//! reads to the correct cell.
//!
//! # Edges
//!
//! A [`DepEdge`] is one discovered edge of the dependency graph, seen
//! from the dependent side. It holds a `Weak` reference to the
//! dependency plus the value read at capture time — a value snapshot,
//! never a strong reference, so a cache entry cannot keep a cell alive
//! merely because it was once read.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use super::cell::{CellCore, CellId, CycleError};

/// Internal face of a cell as seen by its dependents: shared bookkeeping
/// plus the current value (computing it first if necessary).
pub(crate) trait Source<T>: Send + Sync {
    fn core(&self) -> &CellCore<T>;

    /// Current externally visible value. For a derived dependency this
    /// revalidates (cache probe or recompute); for a writable it is a
    /// plain read.
    fn current(&self) -> Result<T, CycleError>;
}

/// One edge of the dependency graph, held by the dependent.
pub(crate) trait DepEdge: Send + Sync {
    /// Id of the dependency cell this edge points at.
    fn cell(&self) -> CellId;

    /// Add `dependent` to the dependency's dependent set, if the
    /// dependency is still alive.
    fn link(&self, dependent: CellId);

    /// Remove `dependent` from the dependency's dependent set.
    fn unlink(&self, dependent: CellId);

    /// Whether the dependency still holds the value recorded on this
    /// edge, under the dependency's own equality policy. A dead
    /// dependency never matches.
    fn is_current(&self) -> bool;
}

pub(crate) struct Edge<T> {
    cell: CellId,
    source: Weak<dyn Source<T>>,
    seen: T,
}

impl<T> Edge<T> {
    pub(crate) fn new(cell: CellId, source: Weak<dyn Source<T>>, seen: T) -> Self {
        Self { cell, source, seen }
    }
}

impl<T> DepEdge for Edge<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn cell(&self) -> CellId {
        self.cell
    }

    fn link(&self, dependent: CellId) {
        if let Some(source) = self.source.upgrade() {
            source.core().add_dependent(dependent);
        }
    }

    fn unlink(&self, dependent: CellId) {
        if let Some(source) = self.source.upgrade() {
            source.core().remove_dependent(dependent);
        }
    }

    fn is_current(&self) -> bool {
        let Some(source) = self.source.upgrade() else {
            return false;
        };
        match source.current() {
            Ok(current) => (source.core().equality())(&current, &self.seen),
            Err(_) => false,
        }
    }
}

/// An entry in the evaluation stack: the cell being computed and the
/// edges discovered so far, in read order, deduplicated by dependency.
struct Frame {
    dependent: CellId,
    edges: Vec<Arc<dyn DepEdge>>,
}

thread_local! {
    static EVAL_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Guard for one getter run. Pops its frame on drop, so the stack stays
/// consistent across panicking getters.
pub(crate) struct EvalScope {
    dependent: CellId,
}

impl EvalScope {
    /// Push a frame for `dependent` and start collecting its reads.
    pub(crate) fn enter(dependent: CellId) -> Self {
        EVAL_STACK.with(|stack| {
            stack.borrow_mut().push(Frame { dependent, edges: Vec::new() });
        });
        Self { dependent }
    }

    /// The cell whose getter is currently running, if any.
    pub(crate) fn active_dependent() -> Option<CellId> {
        EVAL_STACK.with(|stack| stack.borrow().last().map(|frame| frame.dependent))
    }

    /// Record a discovered edge in the innermost frame. Re-reads of the
    /// same dependency within one computation keep the first record.
    pub(crate) fn record(edge: Arc<dyn DepEdge>) {
        EVAL_STACK.with(|stack| {
            if let Some(frame) = stack.borrow_mut().last_mut() {
                if !frame.edges.iter().any(|e| e.cell() == edge.cell()) {
                    frame.edges.push(edge);
                }
            }
        });
    }

    /// Pop the frame and hand back the edges it collected.
    pub(crate) fn finish(self) -> Vec<Arc<dyn DepEdge>> {
        let edges = EVAL_STACK.with(|stack| {
            let frame = stack
                .borrow_mut()
                .pop()
                .expect("evaluation stack should hold the finishing frame");
            debug_assert_eq!(frame.dependent, self.dependent, "evaluation stack mismatch");
            frame.edges
        });
        std::mem::forget(self);
        edges
    }
}

impl Drop for EvalScope {
    fn drop(&mut self) {
        // Unwind path: the getter did not finish, so the edges it
        // discovered were linked as the reads happened but will never
        // be adopted as the live dependency set. Undo the links before
        // discarding the frame, or the dependencies keep invalidating a
        // cell that no longer reads them.
        let edges = EVAL_STACK.with(|stack| {
            stack.borrow_mut().pop().map(|frame| {
                debug_assert_eq!(frame.dependent, self.dependent, "evaluation stack mismatch");
                frame.edges
            })
        });
        for edge in edges.into_iter().flatten() {
            edge.unlink(self.dependent);
        }
    }
}

thread_local! {
    static MUTED: Cell<usize> = const { Cell::new(0) };
}

/// Run `action` with dependency tracking suspended: reads made inside
/// it are not attributed to the computing cell, if any. Nests.
pub(crate) fn untracked<R>(action: impl FnOnce() -> R) -> R {
    MUTED.with(|muted| muted.set(muted.get() + 1));
    let _guard = MuteGuard;
    action()
}

struct MuteGuard;

impl Drop for MuteGuard {
    fn drop(&mut self) {
        MUTED.with(|muted| muted.set(muted.get() - 1));
    }
}

/// Register the read of `value` from `source` with the innermost
/// computing cell, if there is one. Outside any evaluation this is a
/// no-op, which is what makes an untracked `get` legal.
pub(crate) fn track_read<T, S>(source: &Arc<S>, value: &T)
where
    T: Clone + Send + Sync + 'static,
    S: Source<T> + 'static,
{
    if MUTED.with(|muted| muted.get()) > 0 {
        return;
    }
    let Some(dependent) = EvalScope::active_dependent() else {
        return;
    };
    // A cell does not depend on itself; peek-like reads from a cell's
    // own getter would otherwise self-link.
    if dependent == source.core().id() {
        return;
    }
    source.core().add_dependent(dependent);
    let erased: Arc<dyn Source<T>> = source.clone();
    EvalScope::record(Arc::new(Edge::new(
        source.core().id(),
        Arc::downgrade(&erased),
        value.clone(),
    )));
}
