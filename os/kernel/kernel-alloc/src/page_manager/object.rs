//! Allocation objects and the arena that owns them.
//!
//! Objects are addressed by [`ObjectHandle`]s (slot index + generation), so a
//! stale handle to a freed slot is detected instead of aliasing the slot's
//! next occupant.

use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::Permissions;

/// Lifecycle state of an allocation object.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ObjectState {
    /// Virtual range claimed; no frames, no mapping.
    Standby,
    /// Frames committed and mapped.
    InUse,
}

/// One contiguous range owned by a page manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AllocationObject {
    pub base: VirtualAddress,
    pub pages: u64,
    pub permissions: Permissions,
    pub state: ObjectState,
}

impl AllocationObject {
    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64() + self.pages * PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        address >= self.base.as_u64() && address < self.end()
    }

    /// Cut off everything from `offset` pages on and return it as a new object.
    pub(crate) const fn split_off(&mut self, offset: u64) -> Self {
        let tail = Self {
            base: VirtualAddress::new(self.base.as_u64() + offset * PAGE_SIZE),
            pages: self.pages - offset,
            permissions: self.permissions,
            state: self.state,
        };
        self.pages = offset;
        tail
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) struct ObjectHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    object: Option<AllocationObject>,
}

/// Slot storage for allocation objects.
#[derive(Default)]
pub(crate) struct ObjectArena {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    live: usize,
}

impl ObjectArena {
    pub fn insert(&mut self, object: AllocationObject) -> ObjectHandle {
        self.live += 1;
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.object = Some(object);
            return ObjectHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            object: Some(object),
        });
        ObjectHandle {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&AllocationObject> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.object.as_ref()
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut AllocationObject> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.object.as_mut()
    }

    pub fn remove(&mut self, handle: ObjectHandle) -> Option<AllocationObject> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let object = slot.object.take()?;
        self.vacant.push(handle.index);
        self.live -= 1;
        Some(object)
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.live
    }
}
