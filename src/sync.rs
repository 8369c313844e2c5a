//! Atomic primitives behind a `cfg_if` shim so the whole crate can be
//! exercised under `loom`'s model checker with the `check-loom` feature
//! instead of the real atomics.

cfg_if::cfg_if! {
    if #[cfg(feature = "check-loom")] {
        pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};
    } else {
        pub(crate) use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};
    }
}
