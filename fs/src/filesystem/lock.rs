//! Access serialisation.
//!
//! Two independent mechanisms live here. [`VolumeLock`] is the coarse
//! reentrancy lock the embedding system provides; every public operation
//! takes it on entry. [`LockTable`] is the engine's own open-object table
//! enforcing one writer or many readers per on-disk object.

use crate::debug;

/// A volume-scoped mutual exclusion primitive supplied by the embedding
/// system.
///
/// `acquire` may give up after whatever timeout the implementation chooses;
/// the engine reports that as [`crate::Error::Timeout`]. Acquisition is never
/// recursive.
pub trait VolumeLock {
    /// Try to take the lock.
    fn acquire(&self) -> bool;
    /// Give the lock back.
    fn release(&self);
}

/// A lock for single-threaded use. Always succeeds.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone)]
pub struct NoLock;

impl VolumeLock for NoLock {
    fn acquire(&self) -> bool {
        true
    }

    fn release(&self) {}
}

/// Releases a [`VolumeLock`] when dropped.
pub(crate) struct LockGuard<'a, L: VolumeLock>(&'a L);

impl<'a, L: VolumeLock> LockGuard<'a, L> {
    pub(crate) fn acquire(lock: &'a L) -> Option<LockGuard<'a, L>> {
        if lock.acquire() {
            Some(LockGuard(lock))
        } else {
            None
        }
    }
}

impl<'a, L: VolumeLock> Drop for LockGuard<'a, L> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Identifies an on-disk object independent of the path used to reach it:
/// the start cluster of the containing directory plus the entry index.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct LockKey {
    pub dir_cluster: u32,
    pub entry: u32,
}

/// What the caller wants to do with the object.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
    /// Unlink or rename. Needs no slot but conflicts with any open.
    Remove,
}

/// Why the table refused.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum LockConflict {
    Locked,
    Full,
}

const WRITER: u16 = 0x100;

#[derive(Debug, Copy, Clone)]
struct Slot {
    key: LockKey,
    count: u16,
}

/// The open-object table of one mounted volume.
#[derive(Debug)]
pub(crate) struct LockTable<const N: usize> {
    slots: heapless::Vec<Slot, N>,
}

impl<const N: usize> LockTable<N> {
    pub(crate) const fn new() -> LockTable<N> {
        LockTable {
            slots: heapless::Vec::new(),
        }
    }

    /// May `key` be opened with `access` right now?
    pub(crate) fn check(&self, key: LockKey, access: Access) -> Result<(), LockConflict> {
        match self.slots.iter().find(|s| s.key == key) {
            None => {
                if self.slots.is_full() && access != Access::Remove {
                    Err(LockConflict::Full)
                } else {
                    Ok(())
                }
            }
            Some(slot) => {
                if access != Access::Read || slot.count == WRITER {
                    debug!("lock conflict on {:?}", key);
                    Err(LockConflict::Locked)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Is there room for one more object?
    pub(crate) fn has_room(&self) -> bool {
        !self.slots.is_full()
    }

    /// Register one more opener of `key`.
    pub(crate) fn acquire(&mut self, key: LockKey, access: Access) -> Result<(), LockConflict> {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.key == key) {
            if access != Access::Read || slot.count == WRITER {
                debug!("lock conflict on {:?}", key);
                return Err(LockConflict::Locked);
            }
            slot.count += 1;
            return Ok(());
        }
        let count = if access == Access::Read { 1 } else { WRITER };
        self.slots
            .push(Slot { key, count })
            .map_err(|_| LockConflict::Full)
    }

    /// Drop one opener of `key`. Returns `false` if `key` was not held.
    pub(crate) fn release(&mut self, key: LockKey) -> bool {
        match self.slots.iter().position(|s| s.key == key) {
            None => false,
            Some(idx) => {
                let slot = &mut self.slots[idx];
                if slot.count == WRITER || slot.count <= 1 {
                    self.slots.swap_remove(idx);
                } else {
                    slot.count -= 1;
                }
                true
            }
        }
    }

    /// How many objects are open.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

// ****************************************************************************
//
// Unit Tests
//
// ****************************************************************************
