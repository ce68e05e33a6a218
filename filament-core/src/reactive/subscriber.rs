//! Subscriber identity and subscription handles.
//!
//! Every callback attached to a cell gets a [`SubscriberId`] so it can be
//! removed later. `observe` and `subscribe` wrap the id in a
//! [`Subscription`] handle whose `unsubscribe` is idempotent and safe to
//! call from inside a notification callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Unique identifier for a subscriber callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `observe`/`subscribe`.
///
/// Dropping the handle does *not* remove the callback; removal is always
/// explicit, matching the unsubscribe-function contract of the cell API.
/// The callback can also be removed through the cell's `unsubscribe`
/// method using [`Subscription::id`].
pub struct Subscription {
    id: SubscriberId,
    active: AtomicBool,
    cancel: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriberId, cancel: Box<dyn Fn() + Send + Sync>) -> Self {
        Self { id, active: AtomicBool::new(true), cancel }
    }

    /// The id of the callback this handle controls.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remove the callback from its cell.
    ///
    /// Idempotent: the second and later calls are no-ops. Safe to call
    /// from within a notification triggered by the same cell.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            (self.cancel)();
        }
    }

    /// Whether the callback is still attached.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Arc;

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let cancels = Arc::new(AtomicI32::new(0));
        let cancels_clone = cancels.clone();

        let sub = Subscription::new(
            SubscriberId::new(),
            Box::new(move || {
                cancels_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(sub.is_active());

        sub.unsubscribe();
        sub.unsubscribe();
        sub.unsubscribe();

        assert!(!sub.is_active());
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }
}
