//! The sorted-list node and the owned handle returned to callers that
//! retrieve one ([`find_key`](super::OrderedList::find_key),
//! [`remove_by_key`](super::OrderedList::remove_by_key)).

use core::marker::PhantomData;
use core::mem;

use crate::sync::{AtomicUsize, Ordering};

/// A single node of an [`super::OrderedList`].
///
/// Key extraction and comparison collapse into the `K: Ord` bound on the
/// list itself rather than separate `get_key`/`compare_keys` function
/// pointers, and the payload is a plain generic field rather than a
/// trailing, offset-addressed allocation.
/// A user callback invoked exactly once, when a node's last reference (list
/// membership plus every outstanding [`NodeHandle`]) goes away.
pub type Cleanup<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

pub(crate) struct Node<K, V> {
    pub(crate) key: K,
    value: V,
    /// Tagged pointer to the next node; low bit set means this node is
    /// logically deleted.
    pub(crate) next: AtomicUsize,
    pub(crate) refcount: AtomicUsize,
    cleanup: Option<Cleanup<K, V>>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn alloc(key: K, value: V, cleanup: Option<Cleanup<K, V>>) -> *mut Self {
        debug_assert!(
            mem::align_of::<Self>() >= 2,
            "Node<K, V> must be at least 2-byte aligned to carry the logical-deletion mark bit"
        );
        Box::into_raw(Box::new(Self {
            key,
            value,
            next: AtomicUsize::new(0),
            refcount: AtomicUsize::new(1),
            cleanup,
        }))
    }

    pub(crate) fn value(&self) -> &V {
        &self.value
    }

    /// Increments the external reference count held by `NodeHandle`s.
    pub(crate) fn inc_ref(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the refcount; on reaching zero, runs the user cleanup
    /// callback and frees the node. This same function, wrapped by
    /// [`destroy`], is the destructor handed to `ThreadRecord::retire`.
    pub(crate) fn release(ptr: *mut Self) {
        // SAFETY: every caller holds either a live refcount (via a
        // `NodeHandle`) or calls this only from `destroy`, which is only
        // ever invoked once a hazard-pointer scan has proven no thread can
        // still be dereferencing `ptr`.
        let node = unsafe { &*ptr };
        if node.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(cleanup) = &node.cleanup {
                cleanup(&node.key, &node.value);
            }
            // SAFETY: refcount just reached zero, so no other reference
            // (hazard-protected or caller-held) to this allocation exists.
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }
}

/// The destructor function pointer handed to `ThreadRecord::retire`.
pub(crate) unsafe fn destroy<K, V>(addr: usize) {
    Node::<K, V>::release(addr as *mut Node<K, V>);
}

/// An owned reference to a node, independent of the list's own lifetime.
///
/// Replaces the explicit `node_inc_ref`/`node_release` pairing of the
/// original C API with ordinary `Clone`/`Drop`: a `NodeHandle` keeps the
/// node's payload alive and readable even after the node has been removed
/// from the list and reclaimed by the hazard-pointer registry, until the
/// handle itself is dropped.
///
/// `NodeHandle` is bound to the registry's lifetime `'r` only incidentally
/// (so it cannot outlive the list that produced it); it does not itself
/// hold a hazard slot.
pub struct NodeHandle<'r, K, V> {
    ptr: *mut Node<K, V>,
    _registry: PhantomData<&'r ()>,
}

// SAFETY: a `NodeHandle` owns a share of the node's reference count, not a
// borrow of thread-local state; the node it points at is `Send + Sync` in
// the same sense `Box<(K, V)>` would be, bounded by `K`/`V` themselves.
unsafe impl<K: Send, V: Send> Send for NodeHandle<'_, K, V> {}
unsafe impl<K: Sync, V: Sync> Sync for NodeHandle<'_, K, V> {}

impl<'r, K, V> NodeHandle<'r, K, V> {
    /// Takes ownership of one reference count on `ptr`, which the caller
    /// must already have incremented (via [`Node::inc_ref`]).
    pub(crate) unsafe fn from_raw(ptr: *mut Node<K, V>) -> Self {
        Self {
            ptr,
            _registry: PhantomData,
        }
    }

    pub(crate) fn as_raw(&self) -> *mut Node<K, V> {
        self.ptr
    }

    pub fn key(&self) -> &K {
        // SAFETY: this handle's own refcount keeps `ptr` allocated.
        &unsafe { &*self.ptr }.key
    }

    pub fn value(&self) -> &V {
        // SAFETY: this handle's own refcount keeps `ptr` allocated.
        unsafe { &*self.ptr }.value()
    }
}

impl<K, V> Clone for NodeHandle<'_, K, V> {
    fn clone(&self) -> Self {
        // SAFETY: this handle's own refcount keeps `ptr` allocated.
        unsafe { &*self.ptr }.inc_ref();
        Self {
            ptr: self.ptr,
            _registry: PhantomData,
        }
    }
}

impl<K, V> Drop for NodeHandle<'_, K, V> {
    fn drop(&mut self) {
        Node::release(self.ptr);
    }
}
