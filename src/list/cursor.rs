//! The shared `(prev, curr)` traversal template used by insert, delete,
//! find, and remove.

use core::cmp::Ordering as KeyOrdering;
use core::ptr;

use log::trace;

use crate::atomic::{compose, decompose, unmarked};
use crate::hazard::{Shield, ThreadRecord};
use crate::list::node::Node;
use crate::sync::{AtomicUsize, Ordering};

/// A traversal window: `prev_link` is either the list's `head` or the
/// previous live node's `next` field; `curr` is whatever `prev_link`
/// currently points at (possibly null).
///
/// `prev_shield`/`curr_shield` are `None` exactly when there is nothing to
/// protect: `prev_shield` is `None` while `prev_link == head`, and
/// `curr_shield` is `None` when `curr` is null.
pub(crate) struct Cursor<'r, K, V> {
    prev_link: *const AtomicUsize,
    #[allow(dead_code)] // kept alive only to hold its hazard slot
    prev_shield: Option<Shield<'r>>,
    curr: *mut Node<K, V>,
    #[allow(dead_code)]
    curr_shield: Option<Shield<'r>>,
    /// The exact tagged value read from `prev_link` that resolved to
    /// `curr`; the only value a CAS against `prev_link` may use as its
    /// `expected` argument. Valid only when `curr` is non-null.
    curr_tagged: usize,
    /// `curr`'s own observed (unmarked, by construction below) `next`
    /// tagged value, valid only when `curr` is non-null.
    curr_next: usize,
}

/// Outcome of [`seek`]: whether the key was found, carrying the window
/// positioned for the caller to act on.
pub(crate) enum Seek<'r, K, V> {
    Found(Cursor<'r, K, V>),
    Absent(Cursor<'r, K, V>),
}

impl<'r, K, V> Cursor<'r, K, V> {
    pub(crate) fn curr(&self) -> *mut Node<K, V> {
        self.curr
    }

    pub(crate) fn curr_tagged(&self) -> usize {
        self.curr_tagged
    }

    pub(crate) fn curr_next(&self) -> usize {
        self.curr_next
    }

    /// CAS `prev_link` (either `list.head` or `prev.next`) from `expected`
    /// to `new`. Used by both the insertion CAS and the Phase-2 physical
    /// unlink CAS.
    pub(crate) fn cas_prev_link(&self, expected: usize, new: usize) -> Result<usize, usize> {
        // SAFETY: `prev_link` points at either `list.head` (outlives the
        // list) or a live node's `next` field, kept alive by
        // `prev_shield`/the head case needing no shield.
        unsafe { &*self.prev_link }.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

/// Walks from `head` toward `key`, helping unlink any logically-deleted
/// node it passes through and restarting on conflict. Shared by
/// insert/delete/find/remove.
pub(crate) fn seek<'r, K: Ord, V>(
    head: &AtomicUsize,
    record: &ThreadRecord<'r>,
    key: &K,
) -> Seek<'r, K, V> {
    'restart: loop {
        let mut prev_link: *const AtomicUsize = head as *const AtomicUsize;
        let mut prev_shield: Option<Shield<'r>> = None;

        loop {
            // The mandatory publish-then-reverify double load: `protect_read`
            // masks the tag before publishing and compares the *full*
            // tagged value on re-read, retrying until it observes a stable
            // snapshot of `prev_link`.
            let (curr_shield, curr_tagged) = record.protect_read(unsafe { &*prev_link });
            let curr_ptr: *mut Node<K, V> = unmarked(curr_tagged);

            // Ran off the end of the list.
            if curr_ptr.is_null() {
                return Seek::Absent(Cursor {
                    prev_link,
                    prev_shield,
                    curr: ptr::null_mut(),
                    curr_shield: None,
                    curr_tagged,
                    curr_next: 0,
                });
            }

            // Read curr's own outgoing edge.
            // SAFETY: `curr_ptr` is protected by `curr_shield`.
            let curr_next = unsafe { &*curr_ptr }.next.load(Ordering::Acquire);
            let (next_ptr, next_marked) = decompose::<Node<K, V>>(curr_next);
            if next_marked {
                // curr is logically dead; cooperate in physical removal and
                // restart regardless of the CAS outcome — either we or a
                // concurrent op already finished it.
                let expected = compose(curr_ptr, false);
                let _ = unsafe { &*prev_link }.compare_exchange(
                    expected,
                    next_ptr as usize,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                trace!("seek: helped unlink a logically-deleted node, restarting from head");
                continue 'restart;
            }

            // Key comparison.
            // SAFETY: `curr_ptr` is protected by `curr_shield`.
            let curr_key = &unsafe { &*curr_ptr }.key;
            match curr_key.cmp(key) {
                KeyOrdering::Equal => {
                    return Seek::Found(Cursor {
                        prev_link,
                        prev_shield,
                        curr: curr_ptr,
                        curr_shield: Some(curr_shield),
                        curr_tagged,
                        curr_next,
                    });
                }
                KeyOrdering::Less => {
                    prev_shield = Some(curr_shield);
                    // SAFETY: `curr_ptr` stays live: we just moved its
                    // shield into `prev_shield`.
                    prev_link = unsafe { &(*curr_ptr).next as *const AtomicUsize };
                    continue;
                }
                KeyOrdering::Greater => {
                    return Seek::Absent(Cursor {
                        prev_link,
                        prev_shield,
                        curr: curr_ptr,
                        curr_shield: Some(curr_shield),
                        curr_tagged,
                        curr_next,
                    });
                }
            }
        }
    }
}

/// Seek positioned at a specific node's key, then verified by pointer
/// identity — `delete_by_node` needs "this exact node", not just any node
/// with a matching key.
pub(crate) fn seek_node<'r, K: Ord, V>(
    head: &AtomicUsize,
    record: &ThreadRecord<'r>,
    target: *mut Node<K, V>,
) -> Seek<'r, K, V> {
    // SAFETY: the caller holds a reference to `target` (it came from
    // `node_create`/a prior `find_key`/`remove_by_key`), so reading its key
    // is always valid regardless of the node's current list membership.
    let key = unsafe { &(*target).key };
    match seek(head, record, key) {
        Seek::Found(cursor) if ptr::eq(cursor.curr(), target) => Seek::Found(cursor),
        Seek::Found(cursor) => Seek::Absent(cursor),
        Seek::Absent(cursor) => Seek::Absent(cursor),
    }
}
