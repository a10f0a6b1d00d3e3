//! A generational arena for entity storage.
//!
//! This framework is designed for problems that are well suited
//! for large collections of items with wild lifetimes, that have
//! to be referenced from multiple places in a program.
//!
//! There are two parts:
//! * The `Arena` - the instance of this collection of slots. Items
//! are inserted into a free slot and handed back an `Id`.
//! * The entity id, `Id` - a small copyable struct naming a slot
//! plus the generation the slot had when the item was inserted.
//!
//! Ids never dangle: looking up an `Id` whose slot has since been
//! reused returns `None` instead of aliasing the new occupant. This
//! is what lets long-lived cross references (a window's previous
//! transition partner, leader groups) be stored as plain ids and
//! resolved to `Option<&T>` at the use site.
//!
//! Basic usage looks like this:
//! ```
//! use utils::arena::Arena;
//!
//! let mut arena = Arena::new();
//! let id = arena.insert(String::from("Hello arena!"));
//! assert!(arena.get(id).is_some());
//! arena.remove(id);
//! assert!(arena.get(id).is_none());
//! ```
// Austin Shafer - 2024

/// An entity name
///
/// This gives an entity an identity. It is a plain copyable value,
/// holding the slot index and the slot generation at insert time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Id {
    id_index: u32,
    id_gen: u32,
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({}v{})", self.id_index, self.id_gen)
    }
}

impl Id {
    /// Gets the raw index offset for this entity
    pub fn get_raw_id(&self) -> usize {
        self.id_index as usize
    }

    /// A placeholder id that matches no slot, for fields that are
    /// patched right after construction
    pub fn invalid() -> Id {
        Id {
            id_index: u32::MAX,
            id_gen: u32::MAX,
        }
    }
}

#[derive(Debug)]
struct Slot<T> {
    /// bumped every time the slot is vacated
    sl_gen: u32,
    sl_val: Option<T>,
}

/// A collection of data slots addressed by generational `Id`s
///
/// This is essentially a big vector indexed by Id. Lookup time is
/// O(1). Freed slots are kept on a free list and reused, with the
/// generation bumped so stale Ids miss.
#[derive(Debug)]
pub struct Arena<T> {
    ar_slots: Vec<Slot<T>>,
    /// indexes of vacant slots available for reuse
    ar_free: Vec<u32>,
    ar_len: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            ar_slots: Vec::new(),
            ar_free: Vec::new(),
            ar_len: 0,
        }
    }

    /// The number of live entities
    pub fn len(&self) -> usize {
        self.ar_len
    }

    pub fn is_empty(&self) -> bool {
        self.ar_len == 0
    }

    /// Place a value in the arena, returning its new identity
    pub fn insert(&mut self, val: T) -> Id {
        self.ar_len += 1;

        if let Some(index) = self.ar_free.pop() {
            let slot = &mut self.ar_slots[index as usize];
            slot.sl_val = Some(val);
            return Id {
                id_index: index,
                id_gen: slot.sl_gen,
            };
        }

        self.ar_slots.push(Slot {
            sl_gen: 0,
            sl_val: Some(val),
        });
        return Id {
            id_index: (self.ar_slots.len() - 1) as u32,
            id_gen: 0,
        };
    }

    fn slot_matches(&self, id: Id) -> bool {
        match self.ar_slots.get(id.id_index as usize) {
            Some(slot) => slot.sl_gen == id.id_gen && slot.sl_val.is_some(),
            None => false,
        }
    }

    /// Is this id still live
    pub fn contains(&self, id: Id) -> bool {
        self.slot_matches(id)
    }

    /// Get the value corresponding to id
    ///
    /// Returns None if the entity has been removed, even if the slot
    /// has since been reused by a newer entity.
    #[inline]
    pub fn get(&self, id: Id) -> Option<&T> {
        if !self.slot_matches(id) {
            return None;
        }
        self.ar_slots[id.id_index as usize].sl_val.as_ref()
    }

    /// Get a mutable reference to the value corresponding to id
    #[inline]
    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        if !self.slot_matches(id) {
            return None;
        }
        self.ar_slots[id.id_index as usize].sl_val.as_mut()
    }

    /// Remove an entity, returning its value
    ///
    /// The slot is recycled and its generation bumped, so any copies
    /// of this Id still held elsewhere go stale instead of dangling.
    pub fn remove(&mut self, id: Id) -> Option<T> {
        if !self.slot_matches(id) {
            return None;
        }

        let slot = &mut self.ar_slots[id.id_index as usize];
        let val = slot.sl_val.take();
        slot.sl_gen = slot.sl_gen.wrapping_add(1);
        self.ar_free.push(id.id_index);
        self.ar_len -= 1;
        return val;
    }

    /// Iterate over all live (Id, &T) pairs
    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> {
        self.ar_slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.sl_val.as_ref().map(|val| {
                (
                    Id {
                        id_index: i as u32,
                        id_gen: slot.sl_gen,
                    },
                    val,
                )
            })
        })
    }

    /// Collect the Ids of all live entities
    ///
    /// Useful when the caller needs to mutate entries while walking,
    /// which the borrow on `iter` would otherwise forbid.
    pub fn ids(&self) -> Vec<Id> {
        self.iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");

        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn stale_id_misses_reused_slot() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        arena.remove(a);

        // this insert reuses a's slot
        let b = arena.insert(2);
        assert_eq!(a.get_raw_id(), b.get_raw_id());

        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&2));
        assert!(arena.remove(a).is_none());
    }
}
