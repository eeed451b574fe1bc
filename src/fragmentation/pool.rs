//! Fixed-capacity slot pool.
//!
//! Both halves of fragmentation keep their per-message state in a pool whose
//! size is fixed at construction. Allocation never grows the pool: when every
//! slot is busy the caller gets `None` and must report exhaustion.

/// A record that can live in a [`SlotPool`].
pub trait PoolSlot {
    /// Whether this slot can be handed out by [`SlotPool::allocate`].
    fn is_free(&self) -> bool;
}

/// Index of a slot inside a [`SlotPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    /// Position of the slot in its pool.
    pub const fn index(&self) -> usize {
        self.0
    }
}

/// Arena of `T` records with first-fit allocation.
#[derive(Debug)]
pub struct SlotPool<T> {
    slots: Box<[T]>,
}

impl<T: PoolSlot> SlotPool<T> {
    /// Create a pool with `capacity` slots built by `init`.
    pub fn new(capacity: usize, init: impl FnMut() -> T) -> Self {
        let slots = std::iter::repeat_with(init).take(capacity).collect();
        Self { slots }
    }

    /// Id of the first free slot, if any.
    pub fn allocate(&self) -> Option<SlotId> {
        self.slots.iter().position(|slot| slot.is_free()).map(SlotId)
    }

    /// Id of the first slot matching `predicate`.
    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<SlotId> {
        self.slots.iter().position(|slot| predicate(slot)).map(SlotId)
    }

    /// Borrow a slot.
    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots.get(id.0)
    }

    /// Mutably borrow a slot.
    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots.get_mut(id.0)
    }

    /// Iterate over all slots with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots.iter().enumerate().map(|(i, slot)| (SlotId(i), slot))
    }

    /// Mutably iterate over all slots.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut()
    }

    /// Number of slots currently in use.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_free()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Cell {
        owner: Option<u8>,
    }

    impl PoolSlot for Cell {
        fn is_free(&self) -> bool {
            self.owner.is_none()
        }
    }

    #[test]
    fn test_allocate_first_free() {
        let mut pool = SlotPool::new(3, Cell::default);

        let a = pool.allocate().unwrap();
        pool.get_mut(a).unwrap().owner = Some(1);
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        pool.get_mut(b).unwrap().owner = Some(2);
        assert_eq!(pool.active_count(), 2);

        // Releasing the first slot makes it the next allocation again
        pool.get_mut(a).unwrap().owner = None;
        assert_eq!(pool.allocate(), Some(a));
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = SlotPool::new(1, Cell::default);
        let id = pool.allocate().unwrap();
        pool.get_mut(id).unwrap().owner = Some(7);
        assert_eq!(pool.allocate(), None);
        assert_eq!(pool.find(|c| c.owner == Some(7)), Some(id));
        assert_eq!(pool.find(|c| c.owner == Some(8)), None);
    }

    #[test]
    fn test_zero_capacity() {
        let pool: SlotPool<Cell> = SlotPool::new(0, Cell::default);
        assert_eq!(pool.allocate(), None);
        assert_eq!(pool.active_count(), 0);
    }
}
