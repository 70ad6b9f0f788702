use core::fmt;
use managed::ManagedSlice;

use super::Full;

/// A reference to a value stored in a [Slab].
///
/// A handle carries the generation of the slot it was issued for. Once the value is
/// removed, the slot's generation moves on and the handle no longer resolves, even if
/// the slot is reused for another value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u32,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Backing storage for one [Slab] entry.
#[derive(Debug, Clone, Copy)]
pub struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> Slot<T> {
    /// A vacant slot, for building storage arrays.
    pub const EMPTY: Slot<T> = Slot {
        generation: 0,
        value: None,
    };
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A fixed-capacity arena with generation-checked handles.
///
/// The slab never grows; its capacity is the length of the storage it is created with.
#[derive(Debug)]
pub struct Slab<'a, T> {
    slots: ManagedSlice<'a, Slot<T>>,
    len: usize,
}

impl<'a, T> Slab<'a, T> {
    /// Create a slab over the given storage. Any values left in the storage are dropped.
    pub fn new<S>(storage: S) -> Slab<'a, T>
    where
        S: Into<ManagedSlice<'a, Slot<T>>>,
    {
        let mut slab = Slab {
            slots: storage.into(),
            len: 0,
        };
        slab.clear();
        slab
    }

    /// Return the maximum number of values the slab can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Return the number of values currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Store a value in the first vacant slot, or return `Err(Full)`.
    pub fn insert(&mut self, value: T) -> Result<Handle, Full> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.value.is_none())
            .ok_or(Full)?;
        slot.value = Some(value);
        self.len += 1;
        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slot(handle)?.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)?
            .value
            .as_mut()
    }

    /// Remove the value behind `handle`, invalidating every copy of the handle.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self
            .slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        Some(value)
    }

    /// Remove every value, invalidating all outstanding handles.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.len = 0;
    }

    /// Iterate over the stored values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let value = slot.value.as_ref()?;
            Some((
                Handle {
                    index,
                    generation: slot.generation,
                },
                value,
            ))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut storage = [Slot::EMPTY; 2];
        let mut slab = Slab::new(&mut storage[..]);
        assert!(slab.is_empty());

        let a = slab.insert(10u32).unwrap();
        let b = slab.insert(20u32).unwrap();
        assert!(slab.is_full());
        assert_eq!(slab.insert(30), Err(Full));

        assert_eq!(slab.get(a), Some(&10));
        *slab.get_mut(b).unwrap() += 1;
        assert_eq!(slab.remove(b), Some(21));
        assert_eq!(slab.len(), 1);
        assert_eq!(slab.remove(b), None);
    }

    #[test]
    fn test_stale_handle() {
        let mut slab = Slab::new(vec![Slot::EMPTY; 1]);
        let old = slab.insert('a').unwrap();
        assert_eq!(slab.remove(old), Some('a'));

        let new = slab.insert('b').unwrap();
        assert_ne!(old, new);
        assert_eq!(slab.get(old), None);
        assert_eq!(slab.get_mut(old), None);
        assert!(!slab.contains(old));
        assert_eq!(slab.get(new), Some(&'b'));
    }

    #[test]
    fn test_clear_invalidates() {
        let mut slab = Slab::new(vec![Slot::EMPTY; 4]);
        let handles = [
            slab.insert(1).unwrap(),
            slab.insert(2).unwrap(),
            slab.insert(3).unwrap(),
        ];
        slab.clear();
        assert!(slab.is_empty());
        for handle in handles {
            assert_eq!(slab.get(handle), None);
        }
        assert_eq!(slab.iter().count(), 0);
    }

    #[test]
    fn test_new_drops_leftovers() {
        let mut storage = [Slot::EMPTY; 2];
        {
            let mut slab = Slab::new(&mut storage[..]);
            slab.insert(5u8).unwrap();
        }
        let slab = Slab::new(&mut storage[..]);
        assert!(slab.is_empty());
    }

    #[test]
    fn test_iter() {
        let mut slab = Slab::new(vec![Slot::EMPTY; 3]);
        let a = slab.insert(1).unwrap();
        let b = slab.insert(2).unwrap();
        slab.remove(a);
        let items: Vec<_> = slab.iter().collect();
        assert_eq!(items, vec![(b, &2)]);
    }
}
