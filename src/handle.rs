//! Generation-checked handle table.
//!
//! Handles are `(generation << 32) | (slot + 1)`. Freeing a slot bumps its
//! generation, so a handle kept past its lock's destruction resolves to
//! nothing instead of to whatever lock reuses the slot.

use crate::lock::{Lock, LockRef};
use crate::types::LockHandle;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::{Arc, Weak};

struct Slot {
    generation: u32,
    lock: Option<Weak<Lock>>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Maps handles to live locks.
pub struct HandleTable {
    slots: Mutex<Slots>,
    /// Starting generation for new slots, so tables don't hand out equal cookies.
    salt: u32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            salt: rand::thread_rng().gen_range(1..u32::MAX / 2),
        }
    }

    /// Register a lock and return its handle.
    pub fn insert(&self, lock: Weak<Lock>) -> LockHandle {
        let mut slots = self.slots.lock();
        slots.live += 1;
        let index = match slots.free.pop() {
            Some(index) => {
                slots.entries[index as usize].lock = Some(lock);
                index
            }
            None => {
                let index = slots.entries.len() as u32;
                slots.entries.push(Slot {
                    generation: self.salt,
                    lock: Some(lock),
                });
                index
            }
        };
        let generation = slots.entries[index as usize].generation;
        encode(generation, index)
    }

    /// Resolve a handle to its lock if the lock is still registered.
    pub fn resolve(&self, handle: LockHandle) -> Option<LockRef> {
        let (generation, index) = decode(handle)?;
        let slots = self.slots.lock();
        let slot = slots.entries.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.lock.as_ref()?.upgrade()
    }

    /// Whether `handle` still names exactly `lock`.
    pub fn is_live(&self, handle: LockHandle, lock: &LockRef) -> bool {
        self.resolve(handle)
            .map(|found| Arc::ptr_eq(&found, lock))
            .unwrap_or(false)
    }

    /// Unregister a handle. Returns false if it was already gone.
    pub fn remove(&self, handle: LockHandle) -> bool {
        let Some((generation, index)) = decode(handle) else {
            return false;
        };
        let mut slots = self.slots.lock();
        let Some(slot) = slots.entries.get_mut(index as usize) else {
            return false;
        };
        if slot.generation != generation || slot.lock.is_none() {
            return false;
        }
        slot.lock = None;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slots.free.push(index);
        slots.live -= 1;
        true
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.slots.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(generation: u32, index: u32) -> LockHandle {
    LockHandle(((generation as u64) << 32) | (index as u64 + 1))
}

fn decode(handle: LockHandle) -> Option<(u32, u32)> {
    let low = (handle.0 & 0xffff_ffff) as u32;
    if low == 0 {
        return None;
    }
    Some(((handle.0 >> 32) as u32, low - 1))
}
