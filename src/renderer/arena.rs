//! Retained-node arena - index allocation for the renderer's tree.
//!
//! The renderer-owned mutable record of every mounted element lives in
//! one arena, keyed by [`NodeId`]. Slots are reused through a free pool;
//! each slot carries an epoch stamp that is bumped on release, so a
//! stale id held across an asynchronous step can never alias a slot's
//! next occupant.

// =============================================================================
// Node Ids
// =============================================================================

/// Stable identity of one retained node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    epoch: u32,
}

impl NodeId {
    /// An id that matches no slot. Used for detached test contexts.
    pub(crate) fn dangling() -> Self {
        Self {
            index: u32::MAX,
            epoch: u32::MAX,
        }
    }
}

// =============================================================================
// Arena
// =============================================================================

struct Slot<T> {
    epoch: u32,
    value: Option<T>,
}

/// Generic slot arena with a free pool for O(1) reuse.
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Allocate a slot, reusing a freed index when one is available.
    pub(crate) fn insert(&mut self, value: T) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return NodeId {
                index,
                epoch: slot.epoch,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            epoch: 0,
            value: Some(value),
        });
        NodeId { index, epoch: 0 }
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.epoch != id.epoch {
            return None;
        }

        slot.value.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.epoch != id.epoch {
            return None;
        }

        slot.value.as_mut()
    }

    /// Release a slot back to the pool; stale ids for it stop resolving.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.epoch != id.epoch {
            return None;
        }

        let value = slot.value.take()?;
        slot.epoch = slot.epoch.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(value)
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_remove_invalidates_stale_ids() {
        let mut arena = Arena::new();
        let a = arena.insert(1u32);
        assert_eq!(arena.remove(a), Some(1));
        assert!(arena.is_empty());
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);

        // The slot is reused, but the old id must not resolve to it.
        let b = arena.insert(2u32);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&2));
        assert!(arena.contains(b));
    }

    #[test]
    fn test_free_pool_reuse() {
        let mut arena = Arena::new();
        let a = arena.insert(1u32);
        let _b = arena.insert(2u32);
        arena.remove(a);
        let c = arena.insert(3u32);
        // Same underlying index, different epoch.
        assert_eq!(arena.get(c), Some(&3));
        assert_ne!(a, c);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_dangling_never_resolves() {
        let mut arena: Arena<u8> = Arena::new();
        arena.insert(1);
        assert_eq!(arena.get(NodeId::dangling()), None);
    }
}
