// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The thread-local reentrancy guard. Any allocation the tracker itself
//! makes while recording an event re-enters the hooked allocators; the guard
//! makes those nested entries fast no-ops.

use std::cell::Cell;

thread_local! {
    // Scalar with trivial initialization: constructing the slot itself must
    // not allocate, since the first read can happen inside a hooked malloc.
    static RECURSION_GUARD: Cell<bool> = const { Cell::new(false) };
}

/// True while this thread is inside the tracker (or while tracking is
/// suspended around a fork). Reads on a thread whose storage has already
/// been torn down report the guard as held, so late frees from a dying
/// thread's runtime pass straight through to the real allocator.
pub fn is_active() -> bool {
    RECURSION_GUARD.try_with(Cell::get).unwrap_or(true)
}

/// Sets the guard without a scope. Only the fork handlers and the sampler
/// thread use this; everything else goes through [`RecursionGuard`].
pub(crate) fn set_active(value: bool) {
    let _ = RECURSION_GUARD.try_with(|guard| guard.set(value));
}

/// RAII scope for the guard. Nestable: the previous state is restored on
/// drop, so an outer guard stays held when an inner one is released.
pub struct RecursionGuard {
    was_active: bool,
}

impl RecursionGuard {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let was_active = RECURSION_GUARD
            .try_with(|guard| guard.replace(true))
            .unwrap_or(true);
        Self { was_active }
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        let _ = RECURSION_GUARD.try_with(|guard| guard.set(self.was_active));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_scopes_nest() {
        assert!(!is_active());
        {
            let _outer = RecursionGuard::new();
            assert!(is_active());
            {
                let _inner = RecursionGuard::new();
                assert!(is_active());
            }
            // The inner scope must not release the outer one.
            assert!(is_active());
        }
        assert!(!is_active());
    }

    #[test]
    fn test_guard_is_per_thread() {
        let _guard = RecursionGuard::new();
        assert!(is_active());
        std::thread::spawn(|| assert!(!is_active()))
            .join()
            .unwrap();
    }

    #[test]
    fn test_set_active_round_trip() {
        set_active(true);
        assert!(is_active());
        set_active(false);
        assert!(!is_active());
    }
}
