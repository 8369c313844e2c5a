//! `ThreadRecord`: the per-thread handle into a `Registry`.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ptr;

use log::debug;

use crate::hazard::registry::Registry;
use crate::hazard::slot::{HazardSlot, Shield};
use crate::sync::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// The part of a thread's bookkeeping that other threads may read: the
/// registry-list link, the active flag, and the grow-only hazard slot list.
///
/// `retired` lives here too, on the shared struct rather than on a private,
/// thread-local companion — only the owning thread ever touches it while
/// the thread is registered; `Registry`'s teardown touches it too, but only
/// under that operation's precondition that no mutator is running.
pub(crate) struct ThreadRecordInner {
    pub(crate) next: AtomicPtr<ThreadRecordInner>,
    pub(crate) active: AtomicBool,
    pub(crate) hazards: AtomicPtr<HazardSlot>,
    pub(crate) retired: UnsafeCell<Vec<(usize, unsafe fn(usize))>>,
}

// SAFETY: `retired` is only ever mutated by the thread that owns this
// record (through `ThreadRecord`, which is itself `!Send + !Sync`), or by
// `Registry::drop`, whose precondition is that no mutator thread is still
// running. Every other field is a plain atomic.
unsafe impl Sync for ThreadRecordInner {}

impl ThreadRecordInner {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(true),
            hazards: AtomicPtr::new(ptr::null_mut()),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

/// A registered mutator thread's handle into a [`Registry`].
///
/// Belongs to exactly one thread — nothing may use another thread's
/// record — enforced here by making `ThreadRecord` `!Send + !Sync`.
pub struct ThreadRecord<'r> {
    pub(crate) registry: &'r Registry,
    pub(crate) inner: &'r ThreadRecordInner,
    _not_send_sync: PhantomData<*mut ()>,
}

impl<'r> ThreadRecord<'r> {
    pub(crate) fn new(registry: &'r Registry, inner: &'r ThreadRecordInner) -> Self {
        Self {
            registry,
            inner,
            _not_send_sync: PhantomData,
        }
    }

    /// Find a free slot among this thread's own hazard slots, or append a
    /// new one. A plain scan is sufficient (rather than a CAS-based claim)
    /// because only the owning thread ever claims its own slots — there is
    /// no other writer to race with.
    fn acquire_slot(&self) -> &'r HazardSlot {
        let mut cur = self.inner.hazards.load(Ordering::Acquire);
        while !cur.is_null() {
            let slot = unsafe { &*cur };
            if slot.value.load(Ordering::Relaxed) == 0 {
                return slot;
            }
            cur = slot.next.load(Ordering::Acquire);
        }

        let new_slot = Box::leak(Box::new(HazardSlot::new()));
        let old_head = self.inner.hazards.load(Ordering::Relaxed);
        new_slot.next.store(old_head, Ordering::Relaxed);
        // Single-writer append (only this thread ever grows its own hazard
        // list), but the publication itself must be Release so a
        // concurrent scan reading through `hazards` sees a fully
        // initialized slot.
        self.inner.hazards.store(new_slot, Ordering::Release);
        new_slot
    }

    /// Publishes `tagged_addr` as hazardous. `tagged_addr` may be zero
    /// (reserving a slot without protecting anything yet).
    pub(crate) fn protect(&self, tagged_addr: usize) -> Shield<'r> {
        let slot = self.acquire_slot();
        // Publication of a hazard-slot pointer is sequentially consistent:
        // this is the one non-negotiable fence in the whole design, pairing
        // with the re-verification load below and with
        // `Registry::all_hazards`'s load during a scan.
        slot.value.store(tagged_addr, Ordering::SeqCst);
        Shield::new(slot)
    }

    /// The reader double-load pattern used by every list traversal step:
    /// publish a hazard for whatever `src` currently holds, then re-verify
    /// `src` is unchanged before trusting the shield. Retries until a
    /// stable value is observed.
    pub(crate) fn protect_read(&self, src: &AtomicUsize) -> (Shield<'r>, usize) {
        loop {
            let tagged = src.load(Ordering::Acquire);
            let shield = self.protect(crate::atomic::mask(tagged));
            if src.load(Ordering::Acquire) != tagged {
                // `shield` drops here, releasing the slot, and we retry.
                continue;
            }
            return (shield, tagged);
        }
    }

    /// Hands `addr` off for reclamation once no hazard still protects it.
    pub(crate) fn retire(&self, addr: usize, dtor: unsafe fn(usize)) {
        // SAFETY: single-writer (this thread) access to `retired`.
        let retired = unsafe { &mut *self.inner.retired.get() };
        retired.push((addr, dtor));
        let len = retired.len();
        let threshold = self.registry.reclaim_threshold();
        if threshold == 0 || len >= threshold {
            self.collect();
        }
    }

    /// Scans the registry's live hazards and reclaims every retired pointer
    /// no hazard protects any more.
    pub(crate) fn collect(&self) {
        fence(Ordering::SeqCst);
        let hazards = self.registry.all_hazards();

        // SAFETY: single-writer (this thread) access to `retired`.
        let retired = unsafe { &mut *self.inner.retired.get() };
        let mut i = 0;
        while i < retired.len() {
            let (addr, dtor) = retired[i];
            if hazards.contains(&addr) {
                i += 1;
            } else {
                retired.swap_remove(i);
                // SAFETY: `addr` was produced by `retire` from a pointer
                // whose type matches `dtor`, and no hazard in any active
                // thread still names it.
                unsafe { dtor(addr) };
                fence(Ordering::Acquire);
            }
        }
    }

}

impl Drop for ThreadRecord<'_> {
    /// Unregisters the thread: atomically mark inactive, but never unlink or
    /// free the record (it stays reachable so `Registry::drop` can free it
    /// at teardown, and so scans safely skip it).
    ///
    /// Does not drain the retired list here: another thread may still hold
    /// a hazard on one of these addresses, and waiting for that to clear
    /// would block an operation that must not block on anything but a CAS.
    /// A final `collect()` here would only reclaim what's already
    /// unprotected anyway — exactly what `Registry::drop`'s defensive drain
    /// already handles for whatever's left at teardown.
    fn drop(&mut self) {
        self.inner.active.store(false, Ordering::SeqCst);
        debug!("unregistering thread record");
    }
}

#[cfg(all(test, not(feature = "check-loom")))]
mod tests {
    use super::*;
    use crate::hazard::registry::Registry;

    #[test]
    fn protect_then_clear_frees_the_slot() {
        let registry = Registry::new();
        let record = registry.register_thread();
        let addr = 0x1000usize;
        {
            let shield = record.protect(addr);
            assert_eq!(shield.protected(), addr);
            assert!(registry.all_hazards().contains(&addr));
        }
        assert!(!registry.all_hazards().contains(&addr));
    }

    #[test]
    fn slots_are_recycled_not_reallocated() {
        let registry = Registry::new();
        let record = registry.register_thread();
        for i in 0..64 {
            let shield = record.protect(i + 2);
            drop(shield);
        }
        let mut count = 0;
        let mut cur = record.inner.hazards.load(Ordering::Relaxed);
        while !cur.is_null() {
            count += 1;
            cur = unsafe { &*cur }.next.load(Ordering::Relaxed);
        }
        assert_eq!(count, 1, "all 64 protects should have reused the single free slot");
    }

    #[test]
    fn retire_at_zero_threshold_drains_immediately_regardless_of_unregister() {
        use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
        static FREED: StdAtomicUsize = StdAtomicUsize::new(0);
        unsafe fn mark_freed(_addr: usize) {
            FREED.fetch_add(1, StdOrdering::SeqCst);
        }

        let registry = Registry::new();
        {
            let record = registry.register_thread();
            record.retire(0x2000, mark_freed);
            record.retire(0x2008, mark_freed);
            // A zero reclaim_threshold scans on every retire, so both are
            // already gone before this thread even unregisters.
            assert_eq!(FREED.load(StdOrdering::SeqCst), 2);
        }
        assert_eq!(FREED.load(StdOrdering::SeqCst), 2);
    }

    #[test]
    fn unregister_does_not_drain_deferred_retires_but_registry_teardown_does() {
        use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
        static FREED: StdAtomicUsize = StdAtomicUsize::new(0);
        unsafe fn mark_freed(_addr: usize) {
            FREED.fetch_add(1, StdOrdering::SeqCst);
        }

        let registry = Registry::with_reclaim_threshold(100);
        {
            let record = registry.register_thread();
            record.retire(0x2000, mark_freed);
            record.retire(0x2008, mark_freed);
            assert_eq!(FREED.load(StdOrdering::SeqCst), 0);
        }
        // Unregistering does not spin to drain them.
        assert_eq!(FREED.load(StdOrdering::SeqCst), 0);

        drop(registry);
        assert_eq!(FREED.load(StdOrdering::SeqCst), 2);
    }
}

