//! Slot arena holding the allocator's block metadata.
//!
//! Instead of writing list nodes into the managed memory itself, all
//! block records live here, in an ordinary `Vec`, and the lists thread
//! through them by integer handle. Every relink is bounds-checked, and a
//! handle that outlives its block is caught by the generation counter
//! rather than dereferencing freed metadata.
//!
//! ```text
//!      BlockId { index: 2, generation: 5 }
//!                       |
//!                       v
//! +--------+--------+--------+--------+--------+
//! | slot 0 | slot 1 | slot 2 | slot 3 | slot 4 |
//! | gen 1  | gen 3  | gen 5  | gen 0  | gen 2  |
//! | Block  | vacant | Block  | Block  | vacant |
//! +--------+--------+--------+--------+--------+
//!                                ^
//!              vacant slots are recycled, bumping their
//!              generation so stale handles stop resolving
//! ```

/// Handle to an entry in an [`Arena`].
///
/// A handle resolves only while "its" entry is still occupying the slot;
/// once the entry is removed, the slot's generation moves on and every
/// old handle to it goes dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

/// Generation-checked slot storage.
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    vacant: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            len: 0,
        }
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Stores `entry`, reusing a vacant slot when one exists.
    pub(crate) fn insert(&mut self, entry: T) -> BlockId {
        self.len += 1;

        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);

            return BlockId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });

        BlockId {
            index,
            generation: 0,
        }
    }

    /// Removes the entry behind `id`, vacating its slot.
    ///
    /// Returns `None` when the handle is stale or out of range, leaving
    /// the arena untouched.
    pub(crate) fn remove(&mut self, id: BlockId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.entry.is_none() {
            return None;
        }

        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        self.len -= 1;

        entry
    }

    pub(crate) fn get(&self, id: BlockId) -> Option<&T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        slot.entry.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: BlockId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        slot.entry.as_mut()
    }
}
