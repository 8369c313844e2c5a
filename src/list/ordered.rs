//! The concurrent sorted list: insert, find, delete, and remove, built on
//! the traversal template in [`super::cursor`].

use core::marker::PhantomData;
use core::ptr;

use log::trace;

use crate::atomic::{compose, decompose, unmarked, with_mark};
use crate::hazard::{Registry, Shield, ThreadRecord};
use crate::list::cursor::{self, Seek};
use crate::list::error::{DeleteResult, InsertResult, RemoveResult};
use crate::list::node::{self, Cleanup, Node, NodeHandle};
use crate::sync::{AtomicUsize, Ordering};

/// A lock-free sorted singly-linked list, keyed by `K`, coordinated by a
/// [`Registry`] it borrows for the lifetime `'r`.
///
/// Ordering and key comparison come from `K: Ord` rather than separate
/// `get_key`/`compare_keys` callbacks: the key *is* the comparison.
pub struct OrderedList<'r, K, V> {
    head: AtomicUsize,
    registry: &'r Registry,
    /// `head` only ever stores a tagged `*mut Node<K, V>` as a `usize`, so
    /// `K`/`V` never appear in a field directly; this ties them to the type
    /// anyway.
    _marker: PhantomData<Node<K, V>>,
}

impl<'r, K: Ord, V> OrderedList<'r, K, V> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            head: AtomicUsize::new(0),
            registry,
            _marker: PhantomData,
        }
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    /// Inserts `key`/`value` at their sorted position.
    ///
    /// The node is allocated once, up front, and reused across CAS
    /// conflicts — only the seek is repeated, not the allocation.
    pub fn insert(
        &self,
        record: &ThreadRecord<'r>,
        key: K,
        value: V,
        cleanup: Option<Cleanup<K, V>>,
    ) -> InsertResult {
        let new_node = Node::alloc(key, value, cleanup);
        loop {
            // SAFETY: `new_node` was just allocated and is not yet
            // published anywhere; nothing else can be racing with this read.
            let key_ref = &unsafe { &*new_node }.key;
            match cursor::seek::<K, V>(&self.head, record, key_ref) {
                Seek::Found(_) => {
                    // Never published, so no hazard can be protecting it;
                    // free it directly without running the cleanup
                    // callback — it never became a live list entry.
                    unsafe { drop(Box::from_raw(new_node)) };
                    return InsertResult::KeyAlreadyExists;
                }
                Seek::Absent(cursor) => {
                    let expected = cursor.curr_tagged();
                    let next_ptr = cursor.curr();
                    // SAFETY: still exclusively ours.
                    unsafe { &*new_node }
                        .next
                        .store(compose(next_ptr, false), Ordering::Release);
                    if cursor
                        .cas_prev_link(expected, compose(new_node, false))
                        .is_ok()
                    {
                        return InsertResult::Ok;
                    }
                    // Lost the race for this position; reseek and retry.
                    trace!("insert: lost the CAS race for an insertion point, retrying");
                }
            }
        }
    }

    /// Removes the live item with key `key`, retiring it for reclamation.
    pub fn delete_by_key(&self, record: &ThreadRecord<'r>, key: &K) -> DeleteResult {
        match self.delete_loop(record, || cursor::seek(&self.head, record, key)) {
            Some(_) => DeleteResult::Ok,
            None => DeleteResult::NotFound,
        }
    }

    /// Removes `target` specifically (by pointer identity, not just a
    /// matching key) if it is still live.
    ///
    /// `target`'s own refcount keeps its memory valid for the duration of
    /// this call, independent of hazard-pointer protection, so re-reading
    /// `target`'s key across retries is always sound.
    pub fn delete_by_node(&self, record: &ThreadRecord<'r>, target: &NodeHandle<'r, K, V>) -> DeleteResult {
        let ptr = target.as_raw();
        match self.delete_loop(record, || cursor::seek_node(&self.head, record, ptr)) {
            Some(_) => DeleteResult::Ok,
            None => DeleteResult::NotFound,
        }
    }

    /// Removes the live item with key `key` and hands the caller an owned
    /// [`NodeHandle`] to it, instead of merely retiring it.
    pub fn remove_by_key(&self, record: &ThreadRecord<'r>, key: &K) -> RemoveResult<'r, K, V> {
        match self.delete_loop(record, || cursor::seek(&self.head, record, key)) {
            Some(curr) => {
                // SAFETY: `curr` was just unlinked by us; it is retired
                // below but that only frees it once every reference
                // (hazard or refcount) is gone, including the one we take
                // here.
                unsafe { &*curr }.inc_ref();
                RemoveResult::Ok(unsafe { NodeHandle::from_raw(curr) })
            }
            None => RemoveResult::NotFound,
        }
    }

    /// Finds the live item with key `key`, bumping its refcount on a match.
    ///
    /// Shares the same traversal as every other operation, so it still
    /// cooperates in physically unlinking any logically-deleted node it
    /// passes through (the list could not otherwise make forward progress
    /// past it) — it just never *initiates* a deletion of its own.
    pub fn find_key(&self, record: &ThreadRecord<'r>, key: &K) -> Option<NodeHandle<'r, K, V>> {
        match cursor::seek::<K, V>(&self.head, record, key) {
            Seek::Found(cursor) => {
                let curr = cursor.curr();
                // SAFETY: `cursor` is still holding a hazard shield on
                // `curr`, so it is live to dereference here.
                unsafe { &*curr }.inc_ref();
                Some(unsafe { NodeHandle::from_raw(curr) })
            }
            Seek::Absent(_) => None,
        }
    }

    /// Snapshots every live key in ascending order.
    ///
    /// Not a stable iterator: it walks with the same hazard-protected,
    /// one-node-at-a-time template as [`seek`](cursor::seek), so a
    /// concurrent insert or delete may or may not be reflected depending on
    /// exactly when this call observes it. Useful for tests and
    /// diagnostics, not for anything that needs a consistent cut.
    pub fn keys(&self, record: &ThreadRecord<'r>) -> Vec<K>
    where
        K: Clone,
    {
        let mut out = Vec::new();
        let mut prev_link: *const AtomicUsize = &self.head as *const AtomicUsize;
        let mut prev_shield: Option<Shield<'r>> = None;

        loop {
            // SAFETY: `prev_link` is either `self.head` or a live node's
            // `next` field kept alive by `prev_shield`.
            let (curr_shield, curr_tagged) = record.protect_read(unsafe { &*prev_link });
            let curr_ptr = unmarked::<Node<K, V>>(curr_tagged);
            if curr_ptr.is_null() {
                break;
            }

            // SAFETY: `curr_ptr` is protected by `curr_shield`.
            let next = unsafe { &*curr_ptr }.next.load(Ordering::Acquire);
            let (_, marked) = decompose::<Node<K, V>>(next);
            if !marked {
                out.push(unsafe { &*curr_ptr }.key.clone());
            }

            prev_shield = Some(curr_shield);
            // SAFETY: `curr_ptr` stays live: its shield was just moved into
            // `prev_shield`.
            prev_link = unsafe { &(*curr_ptr).next as *const AtomicUsize };
        }
        drop(prev_shield);
        out
    }

    /// Phase 1 (mark) + Phase 2 (physical unlink) funnel shared by
    /// `delete_by_key`, `delete_by_node`, and `remove_by_key`. Returns the
    /// unlinked node's pointer (already retired) on success.
    ///
    /// A delete linearizes at its own successful Phase 1 mark CAS, not at
    /// the physical unlink: once that CAS wins, this call is committed to
    /// reporting success. Phase 2 may still lose its CAS race — another
    /// traversal's cooperative unlink in `seek` may splice something in
    /// behind `curr` and finish the physical removal first — but that no
    /// longer changes the outcome, only who completes the bookkeeping.
    fn delete_loop(
        &self,
        record: &ThreadRecord<'r>,
        mut seek_fn: impl FnMut() -> Seek<'r, K, V>,
    ) -> Option<*mut Node<K, V>> {
        loop {
            match seek_fn() {
                Seek::Absent(_) => return None,
                Seek::Found(cursor) => {
                    let curr = cursor.curr();
                    let curr_next = cursor.curr_next();
                    let marked = with_mark(curr_next);

                    // Phase 1: logically delete.
                    // SAFETY: `curr` is hazard-protected by `cursor`.
                    let phase1 = unsafe { &*curr }.next.compare_exchange(
                        curr_next,
                        marked,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    if phase1.is_err() {
                        // Nothing of ours committed yet; safe to restart.
                        trace!("delete: phase-1 mark CAS lost the race, retrying");
                        continue;
                    }

                    // Linearized here. Phase 2 is now best-effort: try the
                    // fast path against the cursor's own observed prev
                    // link, and if that's stale, finish it by walking from
                    // head and matching on `curr`'s identity rather than
                    // its key (the key may no longer resolve to `curr` at
                    // all once it's unlinked).
                    let expected = cursor.curr_tagged();
                    if cursor.cas_prev_link(expected, curr_next).is_err() {
                        trace!(
                            "delete: phase-2 unlink CAS lost the race, completing by identity"
                        );
                        self.complete_unlink(record, curr, curr_next);
                    }
                    record.retire(curr as usize, node::destroy::<K, V>);
                    return Some(curr);
                }
            }
        }
    }

    /// Finishes physically unlinking an already Phase-1-marked `curr` (whose
    /// outgoing edge is `curr_next`) after the caller's own Phase-2 CAS lost
    /// a race. Walks from `head` comparing pointer identity instead of key,
    /// so it isn't confused by `curr` having already been unlinked by a
    /// concurrent traversal cooperating per [`cursor::seek`]'s helper-unlink
    /// step.
    fn complete_unlink(&self, record: &ThreadRecord<'r>, curr: *mut Node<K, V>, curr_next: usize) {
        'restart: loop {
            let mut prev_link: *const AtomicUsize = &self.head as *const AtomicUsize;
            let mut prev_shield: Option<Shield<'r>> = None;

            loop {
                // SAFETY: `prev_link` is either `self.head` or a live
                // node's `next` field kept alive by `prev_shield`.
                let (shield, tagged) = record.protect_read(unsafe { &*prev_link });
                let ptr = unmarked::<Node<K, V>>(tagged);
                if ptr.is_null() {
                    // curr no longer appears anywhere reachable: someone
                    // else already finished the unlink.
                    return;
                }
                if ptr::eq(ptr, curr) {
                    // SAFETY: `prev_link` is still protected as above.
                    if unsafe { &*prev_link }
                        .compare_exchange(tagged, curr_next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                    // Lost the race; rescan from head.
                    continue 'restart;
                }
                prev_shield = Some(shield);
                // SAFETY: `ptr` stays live: its shield was just moved into
                // `prev_shield`.
                prev_link = unsafe { &(*ptr).next as *const AtomicUsize };
            }
        }
    }
}

impl<K, V> Drop for OrderedList<'_, K, V> {
    /// Precondition, like the registry's own teardown: no mutator is
    /// running. Walks whatever remains and releases each node's
    /// list-owned reference (decrementing to zero unless a caller is
    /// still holding a [`NodeHandle`] to it).
    fn drop(&mut self) {
        let mut curr = crate::atomic::unmarked::<Node<K, V>>(self.head.load(Ordering::Acquire));
        while !curr.is_null() {
            // SAFETY: precondition is quiescence; nothing else touches the
            // list concurrently, and every node on it is still allocated.
            let next = crate::atomic::unmarked::<Node<K, V>>(
                unsafe { &*curr }.next.load(Ordering::Acquire),
            );
            Node::release(curr);
            curr = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Regression test for the delete linearization bug: once this call's
    /// own Phase 1 mark CAS wins, a concurrent traversal finishing the
    /// physical unlink first (leaving this call's captured `curr_tagged`
    /// stale) must not turn the result into `NotFound`.
    #[test]
    fn delete_reports_ok_even_when_phase_two_loses_to_a_concurrent_unlink() {
        let registry = Registry::new();
        let record = registry.register_thread();
        let list: OrderedList<'_, i32, &'static str> = OrderedList::new(&registry);

        for key in [1, 2, 3] {
            assert!(matches!(list.insert(&record, key, "", None), InsertResult::Ok));
        }

        let cursor = match cursor::seek::<i32, &'static str>(&list.head, &record, &2) {
            Seek::Found(cursor) => cursor,
            Seek::Absent(_) => panic!("key 2 should be present"),
        };
        let node1 = unmarked::<Node<i32, &'static str>>(list.head.load(Ordering::Acquire));

        // Simulate a concurrent traversal already finishing the physical
        // unlink of node 2 (the same effect `cursor::seek`'s own
        // helper-unlink step would have) before this call gets back to its
        // own Phase 2.
        unsafe { &*node1 }.next.store(cursor.curr_next(), Ordering::Release);

        let mut cursor = Some(cursor);
        let result = list.delete_loop(&record, || {
            Seek::Found(cursor.take().expect("seek_fn should only run once here"))
        });

        assert!(
            result.is_some(),
            "this call's own Phase 1 already won; it must still report success"
        );
        assert_eq!(list.keys(&record), vec![1, 3]);
    }
}
