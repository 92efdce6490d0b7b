//! Generational object pool with stable handles.
//!
//! Connections and streams live in per-worker pools and are referenced
//! everywhere else by [`Handle`]. A handle carries the generation of the slot
//! it was issued for, so a handle kept past `release` (a late transport event,
//! a deferred send) resolves to `None` instead of aliasing the slot's next
//! occupant.

/// Reset hook run when an object goes back to its pool.
pub trait Recycle {
    fn recycle(&mut self);
}

/// Stable reference to a pooled object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot<T> {
    value: T,
    generation: u32,
    occupied: bool,
}

/// Bounded pool that reuses released objects in place.
///
/// Slots are allocated lazily up to `capacity`; released slots are reset via
/// [`Recycle`] and handed out again before the pool grows.
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl<T: Recycle + Default> Pool<T> {
    /// Create a pool that holds at most `capacity` live objects.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            live: 0,
        }
    }

    /// Take an object from the pool, or `None` when every slot is in use.
    pub fn acquire(&mut self) -> Option<(Handle, &mut T)> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= self.capacity {
                    return None;
                }
                self.slots.push(Slot {
                    value: T::default(),
                    generation: 0,
                    occupied: false,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        debug_assert!(!slot.occupied, "free list pointed at an occupied slot");
        slot.occupied = true;
        self.live += 1;
        let handle = Handle {
            index,
            generation: slot.generation,
        };
        Some((handle, &mut slot.value))
    }

    #[inline]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index()) {
            Some(slot) if slot.occupied && slot.generation == handle.generation => Some(&slot.value),
            _ => None,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index()) {
            Some(slot) if slot.occupied && slot.generation == handle.generation => Some(&mut slot.value),
            _ => None,
        }
    }

    /// Return an object to the pool. Returns false for a stale handle.
    pub fn release(&mut self, handle: Handle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.index()) else {
            return false;
        };
        if !slot.occupied || slot.generation != handle.generation {
            return false;
        }
        slot.value.recycle();
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        true
    }

    /// Number of live (acquired, not yet released) objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug)]
    struct Item {
        value: u64,
        recycled: u32,
    }

    impl Recycle for Item {
        fn recycle(&mut self) {
            self.value = 0;
            self.recycled += 1;
        }
    }

    #[test]
    fn test_acquire_and_get() {
        let mut pool: Pool<Item> = Pool::with_capacity(4);
        let (handle, item) = pool.acquire().unwrap();
        item.value = 42;
        assert_eq!(pool.get(handle).unwrap().value, 42);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_capacity_limit() {
        let mut pool: Pool<Item> = Pool::with_capacity(2);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_release_resets_and_reuses_slot() {
        let mut pool: Pool<Item> = Pool::with_capacity(1);
        let (first, item) = pool.acquire().unwrap();
        item.value = 7;
        assert!(pool.release(first));
        assert!(pool.is_empty());

        let (second, item) = pool.acquire().unwrap();
        assert_eq!(item.value, 0);
        assert_eq!(item.recycled, 1);
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut pool: Pool<Item> = Pool::with_capacity(1);
        let (stale, _) = pool.acquire().unwrap();
        pool.release(stale);
        let (fresh, item) = pool.acquire().unwrap();
        item.value = 9;

        assert!(pool.get(stale).is_none());
        assert!(pool.get_mut(stale).is_none());
        assert!(!pool.release(stale));
        assert_eq!(pool.get(fresh).unwrap().value, 9);
    }

    #[test]
    fn test_double_release() {
        let mut pool: Pool<Item> = Pool::with_capacity(2);
        let (handle, _) = pool.acquire().unwrap();
        assert!(pool.release(handle));
        assert!(!pool.release(handle));
        assert_eq!(pool.len(), 0);
    }
}
