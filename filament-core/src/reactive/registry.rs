//! Weak dependent registry.
//!
//! Cells record their dependents by [`CellId`]; this registry maps those
//! ids back to the derived cells themselves, through `Weak` references
//! so the registry never keeps a dropped cell alive. A lookup that finds
//! a dead entry removes it, and the caller prunes the corresponding edge
//! from its dependent set.
//!
//! This is the "explicit owning registry indexed by a stable identity"
//! alternative to language-level weak collections: every graph walk
//! treats a missing entry as "prune this edge" rather than an error.

use std::collections::HashMap;
use std::sync::{OnceLock, Weak};

use parking_lot::RwLock;
use tracing::trace;

use super::cell::CellId;

/// A node that can be invalidated and re-checked when a cell it read
/// changes. Implemented by derived cells.
pub(crate) trait Dependent: Send + Sync {
    fn id(&self) -> CellId;

    /// A tracked dependency changed: the cached value can no longer be
    /// trusted. Must not run user code.
    fn mark_stale(&self);

    /// A dependency actually broadcast a change: re-check, and propagate
    /// exactly once if the externally visible value moved.
    fn on_dependency_changed(&self);
}

static REGISTRY: OnceLock<RwLock<HashMap<CellId, Weak<dyn Dependent>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<CellId, Weak<dyn Dependent>>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a dependent under its cell id.
pub(crate) fn register(id: CellId, dependent: Weak<dyn Dependent>) {
    registry().write().insert(id, dependent);
}

/// Remove a dependent. Called from the cell's `Drop`.
pub(crate) fn unregister(id: CellId) {
    registry().write().remove(&id);
}

/// Resolve a dependent id to a live cell, dropping the entry if the cell
/// is gone.
pub(crate) fn lookup(id: CellId) -> Option<std::sync::Arc<dyn Dependent>> {
    let found = registry().read().get(&id).and_then(Weak::upgrade);
    if found.is_none() && registry().write().remove(&id).is_some() {
        trace!(dependent = %id, "removed dead registry entry");
    }
    found
}
