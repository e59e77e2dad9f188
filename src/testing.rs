//! Hooks for observing cache behaviour in tests.

use std::cell::Cell;

thread_local! {
    static LAST_WAS_HIT: Cell<bool> = const { Cell::new(false) };
}

/// Whether the last value request on this thread was served without
/// running the compute, either from the cache or by waiting for another
/// thread computing the same value.
pub fn last_was_hit() -> bool {
    LAST_WAS_HIT.with(|cell| cell.get())
}

pub(crate) fn register_hit() {
    LAST_WAS_HIT.with(|cell| cell.set(true))
}

pub(crate) fn register_miss() {
    LAST_WAS_HIT.with(|cell| cell.set(false))
}
