//! Presence service — last known pointer position per connection.
//!
//! DESIGN
//! ======
//! Pointer moves are relayed to peers whether or not this registry is in
//! use. When a document is created with presence enabled it also records
//! each connection's latest pointer here, so a newly joined client can be
//! shown where everyone already is. Nothing in the registry is persisted.

use std::collections::HashMap;

use uuid::Uuid;

use crate::message::{Pointer, PointerPosition, PresenceSnapshot};

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    pointers: HashMap<Uuid, PointerPosition>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest pointer for a connection, replacing the previous one.
    pub fn record(&mut self, user_unique_id: Uuid, pointer: &Pointer) {
        self.pointers.insert(
            user_unique_id,
            PointerPosition { user_unique_id, brick_id: pointer.brick_id, x: pointer.x, y: pointer.y },
        );
    }

    /// Forget a connection. Returns whether it had a recorded pointer.
    pub fn remove(&mut self, user_unique_id: Uuid) -> bool {
        self.pointers.remove(&user_unique_id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    /// All recorded pointers, ordered by connection id.
    #[must_use]
    pub fn snapshot(&self) -> PresenceSnapshot {
        let mut pointers: Vec<PointerPosition> = self.pointers.values().cloned().collect();
        pointers.sort_by_key(|p| p.user_unique_id);
        PresenceSnapshot { pointers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointer(x: f64, y: f64) -> Pointer {
        Pointer { brick_id: Some(1), x, y }
    }

    #[test]
    fn new_registry_is_empty() {
        let registry = PresenceRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.snapshot().pointers.is_empty());
    }

    #[test]
    fn record_keeps_only_latest_position() {
        let user = Uuid::new_v4();
        let mut registry = PresenceRegistry::new();
        registry.record(user, &pointer(1.0, 1.0));
        registry.record(user, &pointer(5.0, 6.0));

        assert_eq!(registry.len(), 1);
        let snapshot = registry.snapshot();
        assert!((snapshot.pointers[0].x - 5.0).abs() < f64::EPSILON);
        assert!((snapshot.pointers[0].y - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn remove_forgets_connection() {
        let user = Uuid::new_v4();
        let mut registry = PresenceRegistry::new();
        registry.record(user, &pointer(0.0, 0.0));
        assert!(registry.remove(user));
        assert!(!registry.remove(user));
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_sorted_by_connection() {
        let mut registry = PresenceRegistry::new();
        for _ in 0..5 {
            registry.record(Uuid::new_v4(), &pointer(0.0, 0.0));
        }
        let ids: Vec<Uuid> = registry
            .snapshot()
            .pointers
            .iter()
            .map(|p| p.user_unique_id)
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
