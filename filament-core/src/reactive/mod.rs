//! Reactive Primitives
//!
//! This module implements the core reactive system: writable cells,
//! derived cells, batched writes, and watches.
//!
//! # Concepts
//!
//! ## Writable cells
//!
//! A [`Writable`] is a container for mutable state. When its value is
//! read inside a derived cell's getter, the cell automatically registers
//! that getter's cell as a dependent. When the value changes, dependents
//! are invalidated and subscribers are notified.
//!
//! ## Derived cells
//!
//! A [`Derived`] computes its value from other cells and memoizes the
//! result. A dependency change only marks it stale; the getter runs
//! again on the next read, and a small per-cell cache of recent
//! dependency snapshots lets the cell skip the getter entirely when its
//! inputs return to recently seen values.
//!
//! ## Batches
//!
//! [`batch`] defers subscriber notification for all writes inside a
//! scope to a single pass at scope exit, deduplicated per cell and
//! suppressed entirely for values that ended up where they started.
//! Reads inside the batch still observe the new values immediately.
//!
//! ## Watches
//!
//! A [`Watch`](watch::Watch) re-runs a side-effecting action whenever
//! any cell the action reads changes, with optional cleanup between
//! runs.
//!
//! # Implementation Notes
//!
//! Dependency discovery is read-time: a thread-local evaluation stack
//! records which derived cell is computing, and every tracked read adds
//! an edge. Edges from dependency to dependent are ids resolved through
//! a weak registry, so a derived cell nobody references any more is
//! dropped and pruned instead of being kept alive by its inputs.
//!
//! This approach ("automatic dependency tracking") is the one used by
//! SolidJS, Vue 3, and Leptos.

mod batch;
mod cell;
mod context;
mod derived;
mod registry;
mod subscriber;
mod watch;
mod writable;

pub use batch::batch;
pub use cell::{CellId, CellOptions, CycleError, Equality};
pub use derived::{Derived, DerivedState};
pub use subscriber::{SubscriberId, Subscription};
pub use watch::{watch, watch_named, Cleanup, Watch};
pub use writable::Writable;
