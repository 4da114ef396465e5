//! Picture and motion-vector buffer managers.
//!
//! A manager is a fixed arena of slots. Each slot carries two independent
//! holds: `REF` while the picture may still be used for prediction and `IO`
//! while it still has to be handed back to the caller. A slot becomes free
//! only when both holds are clear.

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::error::{EncodeError, ErrorReason, Result};

bitflags! {
    /// Holds on a managed buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HoldFlags: u8 {
        /// Held as a reference picture.
        const REF = 1 << 0;
        /// Held until returned to the application.
        const IO = 1 << 1;
    }
}

/// Index of a slot in a [`BufferManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

impl BufferId {
    /// Slot index.
    pub fn index(&self) -> usize {
        self.0
    }
}

struct Slot<T> {
    holds: HoldFlags,
    payload: Arc<RwLock<T>>,
}

/// Fixed arena of shareable buffers with hold tracking.
pub struct BufferManager<T> {
    name: &'static str,
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T> BufferManager<T> {
    /// Create an empty manager.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Add `count` buffers built by `factory`. Returns the new total.
    pub fn add_buffers(&self, count: usize, mut factory: impl FnMut(usize) -> T) -> usize {
        let mut slots = self.slots.lock();
        let base = slots.len();
        slots.extend((0..count).map(|i| Slot {
            holds: HoldFlags::empty(),
            payload: Arc::new(RwLock::new(factory(base + i))),
        }));
        tracing::debug!(manager = self.name, added = count, total = slots.len(), "Added buffers");
        slots.len()
    }

    /// Take the first free slot and set `flags` on it.
    pub fn acquire(&self, flags: HoldFlags) -> Option<BufferId> {
        let mut slots = self.slots.lock();
        let index = slots.iter().position(|s| s.holds.is_empty())?;
        slots[index].holds = flags;
        Some(BufferId(index))
    }

    /// Clear `flags` on a slot. Clearing a hold that is not set is fatal.
    pub fn release(&self, id: BufferId, flags: HoldFlags) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(id.0)
            .ok_or(EncodeError::fatal(ErrorReason::InvalidBufferId))?;
        if !slot.holds.contains(flags) {
            tracing::error!(
                manager = self.name,
                slot = id.0,
                held = ?slot.holds,
                released = ?flags,
                "Double release"
            );
            return Err(EncodeError::fatal(ErrorReason::BufferRelease));
        }
        slot.holds.remove(flags);
        Ok(())
    }

    /// Release only the holds in `flags` that are currently set.
    pub fn release_held(&self, id: BufferId, flags: HoldFlags) -> Result<()> {
        let held = self.status(id)? & flags;
        if held.is_empty() {
            return Ok(());
        }
        self.release(id, held)
    }

    /// Current holds of a slot.
    pub fn status(&self, id: BufferId) -> Result<HoldFlags> {
        self.slots
            .lock()
            .get(id.0)
            .map(|s| s.holds)
            .ok_or(EncodeError::fatal(ErrorReason::InvalidBufferId))
    }

    /// Shared handle to a slot's payload.
    pub fn payload(&self, id: BufferId) -> Result<Arc<RwLock<T>>> {
        self.slots
            .lock()
            .get(id.0)
            .map(|s| Arc::clone(&s.payload))
            .ok_or(EncodeError::fatal(ErrorReason::InvalidBufferId))
    }

    /// Total number of slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Check if no slots were added.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Number of slots with no holds.
    pub fn free_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.holds.is_empty()).count()
    }

    /// Drop every slot.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

impl<T> std::fmt::Debug for BufferManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("free", &self.free_count())
            .finish()
    }
}
