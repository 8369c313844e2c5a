//! `Registry`: a hazard-pointer registry, owned by its caller rather than
//! kept as a process-wide global.

use std::collections::HashSet;
use std::ptr;

use log::{debug, warn};

use crate::hazard::thread_record::{ThreadRecord, ThreadRecordInner};
use crate::sync::{AtomicPtr, Ordering};

/// Owns the thread list and the optional reclaim threshold. A process may
/// hold several registries; callers thread it through their own
/// constructors explicitly rather than reaching for a
/// `lazy_static`/`OnceCell` singleton.
pub struct Registry {
    head: AtomicPtr<ThreadRecordInner>,
    reclaim_threshold: usize,
}

impl Registry {
    /// Creates a registry that scans on every retire.
    pub fn new() -> Self {
        Self::with_reclaim_threshold(0)
    }

    /// `reclaim_threshold == 0` means "scan on every retire"; any positive
    /// value scans once a thread's retired list reaches that length.
    pub fn with_reclaim_threshold(reclaim_threshold: usize) -> Self {
        debug!("creating hazard-pointer registry with reclaim_threshold={reclaim_threshold}");
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            reclaim_threshold,
        }
    }

    pub(crate) fn reclaim_threshold(&self) -> usize {
        self.reclaim_threshold
    }

    /// Registers a new mutator thread: CAS-push a fresh record onto the
    /// thread list, active from the start.
    pub fn register_thread(&self) -> ThreadRecord<'_> {
        let inner = Box::leak(Box::new(ThreadRecordInner::new()));
        loop {
            let head = self.head.load(Ordering::Acquire);
            inner.next.store(head, Ordering::Relaxed);
            if self
                .head
                .compare_exchange(head, inner, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        debug!("registered a new thread record");
        ThreadRecord::new(self, inner)
    }

    /// Build the set of every non-null hazard currently published by an
    /// active thread record.
    pub(crate) fn all_hazards(&self) -> HashSet<usize> {
        let mut hazards = HashSet::new();
        let mut record = self.head.load(Ordering::Acquire);
        while !record.is_null() {
            let inner = unsafe { &*record };
            if inner.active.load(Ordering::SeqCst) {
                let mut slot = inner.hazards.load(Ordering::Acquire);
                while !slot.is_null() {
                    let s = unsafe { &*slot };
                    let value = s.value.load(Ordering::SeqCst);
                    if value != 0 {
                        hazards.insert(value);
                    }
                    slot = s.next.load(Ordering::Acquire);
                }
            }
            record = inner.next.load(Ordering::Acquire);
        }
        hazards
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registry {
    /// Tears down the registry. Precondition: no mutator thread is still
    /// active. Walks the thread list freeing every thread record and its
    /// hazard slots.
    ///
    /// Rather than leaking whatever a thread forgot to drain, this
    /// defensively runs the remaining destructors (see DESIGN.md). In
    /// practice this path is rarely taken: every `ThreadRecord` already
    /// drains itself on drop, so by the time a registry tears down its
    /// thread records normally have empty retired lists; this only fires
    /// for records whose `ThreadRecord` handle was leaked (e.g. via
    /// `mem::forget`).
    fn drop(&mut self) {
        let mut record = self.head.load(Ordering::Relaxed);
        while !record.is_null() {
            let inner = unsafe { &*record };
            let next = inner.next.load(Ordering::Relaxed);

            let retired = std::mem::take(unsafe { &mut *inner.retired.get() });
            if !retired.is_empty() {
                warn!(
                    "registry teardown draining {} un-reclaimed retired pointer(s)",
                    retired.len()
                );
                for (addr, dtor) in retired {
                    unsafe { dtor(addr) };
                }
            }

            let mut slot = inner.hazards.load(Ordering::Relaxed);
            while !slot.is_null() {
                let boxed_slot = unsafe { Box::from_raw(slot) };
                slot = boxed_slot.next.load(Ordering::Relaxed);
            }

            unsafe { drop(Box::from_raw(record)) };
            record = next;
        }
    }
}
