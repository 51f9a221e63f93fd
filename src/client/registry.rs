use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::pending::PendingSlot;
use crate::{CorrelationId, Result, RpcError};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The map holds no invariant spanning more than one entry; the worst
/// outcome of a poisoned lock is a dropped or unmatched reply.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Maps in-flight correlation ids to their pending calls.
///
/// Shared by the client (inserts), callers disposing their calls (removals)
/// and the dispatch loop (lookups and removals on fulfilment). A single
/// mutex covers all three, so an entry inserted before the request is
/// published is always visible to the dispatch loop, however fast the reply.
pub(crate) struct CorrelationRegistry {
    // ---
    entries: Mutex<HashMap<CorrelationId, Arc<PendingSlot>>>,
}

impl CorrelationRegistry {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a pending call.
    ///
    /// Fails if the id is already pending; ids come from a monotonic
    /// generator, so this only happens if that generator is broken.
    pub fn register(&self, id: CorrelationId, slot: Arc<PendingSlot>) -> Result<()> {
        // ---
        let mut entries = lock_ignore_poison(&self.entries);
        if entries.contains_key(&id) {
            return Err(RpcError::DuplicateCorrelationId(id.to_string()));
        }
        entries.insert(id, slot);
        Ok(())
    }

    /// Find the pending call for `id` without removing it.
    pub fn lookup(&self, id: &CorrelationId) -> Option<Arc<PendingSlot>> {
        // ---
        lock_ignore_poison(&self.entries).get(id).cloned()
    }

    /// Remove `id`. Removing an absent id is a no-op returning `false`.
    pub fn remove(&self, id: &CorrelationId) -> bool {
        // ---
        lock_ignore_poison(&self.entries).remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.entries).len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        // ---
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::from("7");
        let (slot, _rx) = PendingSlot::new();

        registry.register(id.clone(), Arc::clone(&slot)).unwrap();
        assert_eq!(registry.len(), 1);

        let found = registry.lookup(&id).unwrap();
        assert!(Arc::ptr_eq(&found, &slot));

        // Lookup does not remove.
        assert!(registry.lookup(&id).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_register_rejected() {
        // ---
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::from("1");
        let (first, _rx1) = PendingSlot::new();
        let (second, _rx2) = PendingSlot::new();

        registry.register(id.clone(), Arc::clone(&first)).unwrap();
        let err = registry.register(id.clone(), second).unwrap_err();
        assert!(matches!(err, RpcError::DuplicateCorrelationId(ref s) if s == "1"));

        // The original entry is untouched.
        assert!(Arc::ptr_eq(&registry.lookup(&id).unwrap(), &first));
    }

    #[test]
    fn test_remove_is_idempotent() {
        // ---
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::from("3");
        let (slot, _rx) = PendingSlot::new();

        registry.register(id.clone(), slot).unwrap();
        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert_eq!(registry.len(), 0);
        assert!(registry.lookup(&id).is_none());
    }

    #[test]
    fn test_lookup_unknown_id() {
        // ---
        let registry = CorrelationRegistry::new();
        assert!(registry.lookup(&CorrelationId::from("missing")).is_none());
    }
}
