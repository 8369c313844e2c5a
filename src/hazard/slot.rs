//! Hazard slots and the `Shield` handle returned by `protect`.

use core::marker::PhantomData;
use core::ptr;

use crate::sync::{AtomicPtr, AtomicUsize, Ordering};

/// One atomic slot inside a `ThreadRecord`'s grow-only hazard list.
///
/// A slot is free when its value is zero. There is no separate
/// occupied/active flag, unlike a globally-shared hazard bag, because each
/// slot belongs to exactly one `ThreadRecord` and only its owning thread
/// ever claims or reuses it.
pub(crate) struct HazardSlot {
    pub(crate) value: AtomicUsize,
    pub(crate) next: AtomicPtr<HazardSlot>,
}

impl HazardSlot {
    pub(crate) fn new() -> Self {
        Self {
            value: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

unsafe impl Send for HazardSlot {}
unsafe impl Sync for HazardSlot {}

/// Ownership of a hazard slot currently publishing some address.
///
/// `Shield` is deliberately `!Send + !Sync`: a shield is only ever valid on
/// the thread whose `ThreadRecord` produced it. Dropping it clears the slot
/// rather than unlinking it, so the slot itself is recycled by the next
/// `protect` call on the same thread.
pub struct Shield<'r> {
    slot: &'r HazardSlot,
    _not_send_sync: PhantomData<*mut ()>,
}

impl<'r> Shield<'r> {
    pub(crate) fn new(slot: &'r HazardSlot) -> Self {
        Self {
            slot,
            _not_send_sync: PhantomData,
        }
    }

    /// The masked (untagged) address currently published by this shield.
    pub(crate) fn protected(&self) -> usize {
        crate::atomic::mask(self.slot.value.load(Ordering::SeqCst))
    }
}

impl Drop for Shield<'_> {
    fn drop(&mut self) {
        // Clearing uses the same SeqCst ordering as publication so a
        // concurrent scan can never observe a stale, still-hazardous value
        // after this store has retired.
        self.slot.value.store(0, Ordering::SeqCst);
    }
}
