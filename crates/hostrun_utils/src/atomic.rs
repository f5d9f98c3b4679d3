//! Centralized atomic ordering, so that we use a consistent memory model everywhere.

pub use std::sync::atomic::Ordering;

/// The ordering all atomics in the codebase should use.
/// SeqCst is stricter than we need anywhere, but none of our atomics are hot
/// enough for the difference to matter.
pub const ORDERING: Ordering = Ordering::SeqCst;
