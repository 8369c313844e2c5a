//! Per-operation outcome enums.
//!
//! A missing key, a duplicate key, or a node that was already removed are
//! all expected outcomes of a concurrent collection, not failures, so these
//! plain enums are meant to be matched on directly rather than propagated
//! with `?`.

use crate::list::node::NodeHandle;

/// Outcome of [`super::OrderedList::insert`].
#[derive(Debug)]
pub enum InsertResult {
    /// The item was inserted at its sorted position.
    Ok,
    /// An item with the same key was already present; nothing was changed.
    KeyAlreadyExists,
}

/// Outcome of [`super::OrderedList::delete_by_key`] and
/// [`super::OrderedList::delete_by_node`].
#[derive(Debug)]
pub enum DeleteResult {
    /// The item was found, logically then physically unlinked, and handed
    /// to the registry for reclamation.
    Ok,
    /// No live item matched.
    NotFound,
}

/// Outcome of [`super::OrderedList::remove_by_key`].
pub enum RemoveResult<'r, K, V> {
    /// The item was removed; the caller now owns a handle to it, valid
    /// until the handle is dropped, independent of the list's own
    /// reclamation.
    Ok(NodeHandle<'r, K, V>),
    /// No live item matched.
    NotFound,
}
