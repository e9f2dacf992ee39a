// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Native stack capture for allocation events: raw instruction pointers
//! only, bounded, with no symbolication and no heap use after construction.
//! Resolution happens on the reader side, against the recorded module maps.

/// Upper bound on captured frames per event.
pub const MAX_NATIVE_FRAMES: usize = 128;

pub struct NativeTrace {
    ips: [u64; MAX_NATIVE_FRAMES],
    len: usize,
    skip: usize,
}

impl Default for NativeTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeTrace {
    pub fn new() -> Self {
        Self {
            ips: [0; MAX_NATIVE_FRAMES],
            len: 0,
            skip: 0,
        }
    }

    /// Captures the current thread's stack, discarding the innermost `skip`
    /// frames (the tracker's own). Returns false when nothing useful was
    /// captured.
    ///
    /// SAFETY of the unsynchronized walk: each `NativeTrace` is confined to
    /// one thread and the unwinder is only asked for instruction pointers,
    /// never for symbolication.
    pub fn fill(&mut self, skip: usize) -> bool {
        self.len = 0;
        self.skip = skip;
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if self.len == MAX_NATIVE_FRAMES {
                    return false;
                }
                self.ips[self.len] = frame.ip() as usize as u64;
                self.len += 1;
                true
            });
        }
        self.len > skip
    }

    /// Captured frames, outermost first, ready for prefix-trie interning.
    /// The deepest (allocating) frame comes out last and therefore becomes
    /// the trie leaf.
    pub fn frames(&self) -> impl Iterator<Item = u64> + '_ {
        self.ips[self.skip..self.len].iter().rev().copied()
    }

    pub fn len(&self) -> usize {
        self.len.saturating_sub(self.skip)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
