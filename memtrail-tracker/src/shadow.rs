// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread mirror of the interpreter call stack, fed by the embedder's
//! profile callback. Pushes and pops are buffered in memory and only hit the
//! record stream when an allocation needs attributing, so idle interpreter
//! frames cost nothing.
//!
//! Thread-teardown safety: the frame vector lives behind a raw pointer in a
//! thread-local `Cell` with no destructor of its own. The vector is created
//! in exactly one place ([`on_function_call`]); every other path reads the
//! pointer and tolerates null. A second thread-local owns the vector and its
//! drop clears the pointer, so a `free` arriving from the dying thread's own
//! runtime after teardown finds a null pointer instead of re-creating
//! thread storage whose destructor list has already run.

use std::cell::Cell;
use std::ffi::{c_char, c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::guard::RecursionGuard;
use crate::tracker::{tracker_generation, Tracker};

/// Opaque handle to an interpreter frame, used to query the executing line.
pub type FrameHandle = *mut c_void;

/// Reads the line currently executing in an interpreter frame.
pub type LineReaderFn = unsafe extern "C" fn(FrameHandle) -> c_int;

static LINE_READER: AtomicUsize = AtomicUsize::new(0);

/// Registers the embedder's line reader. Without one every frame keeps the
/// line it was pushed with.
pub fn set_line_reader(reader: Option<LineReaderFn>) {
    let value = match reader {
        Some(f) => f as usize,
        None => 0,
    };
    LINE_READER.store(value, Ordering::SeqCst);
}

/// An interpreter source location borrowed from interned interpreter
/// strings. Valid for the lifetime of the interpreter session; the tracker
/// writes the strings out the first time a frame is emitted.
#[derive(Clone, Copy, Debug)]
pub struct RawFrame {
    pub function_name: *const c_char,
    pub filename: *const c_char,
    pub lineno: c_int,
    pub is_entry_frame: bool,
}

struct LazilyEmittedFrame {
    frame: FrameHandle,
    raw: RawFrame,
    emitted: bool,
}

const INITIAL_STACK_CAPACITY: usize = 1024;

thread_local! {
    static STACK: Cell<*mut Vec<LazilyEmittedFrame>> = const { Cell::new(ptr::null_mut()) };
    static PENDING_POPS: Cell<u32> = const { Cell::new(0) };
    static GENERATION: Cell<u32> = const { Cell::new(0) };
    static STACK_OWNER: StackOwner = StackOwner::new();
}

struct StackOwner {
    stack: *mut Vec<LazilyEmittedFrame>,
}

impl StackOwner {
    fn new() -> Self {
        let stack = Box::into_raw(Box::new(Vec::with_capacity(INITIAL_STACK_CAPACITY)));
        STACK.set(stack);
        Self { stack }
    }
}

impl Drop for StackOwner {
    fn drop(&mut self) {
        let _ = STACK.try_with(|cell| cell.set(ptr::null_mut()));
        // SAFETY: the pointer came from Box::into_raw in new() and nothing
        // can reach it anymore now that the cell is null.
        drop(unsafe { Box::from_raw(self.stack) });
    }
}

/// Runs `body` on the live stack vector, doing nothing when this thread has
/// none (never created, or already torn down).
fn with_stack<R>(body: impl FnOnce(&mut Vec<LazilyEmittedFrame>) -> R) -> Option<R> {
    let stack = STACK.try_with(Cell::get).ok()?;
    if stack.is_null() {
        return None;
    }
    // SAFETY: non-null means the owning StackOwner is alive on this thread,
    // and only this thread touches the vector.
    Some(body(unsafe { &mut *stack }))
}

/// Profile-callback entry for a CALL event. Creates this thread's shadow
/// stack on first use.
pub fn on_function_call(frame: FrameHandle, raw: RawFrame) {
    let _guard = RecursionGuard::new();
    if !Tracker::active() {
        return;
    }
    push_frame(frame, raw);
}

/// Profile-callback entry for a RETURN event.
pub fn on_function_return() {
    let _guard = RecursionGuard::new();
    if !Tracker::active() {
        return;
    }
    pop_frame();
}

pub(crate) fn push_frame(frame: FrameHandle, mut raw: RawFrame) {
    // The caller's line may have advanced since it was pushed; record the
    // call site before the callee goes on top.
    let parent_lineno = current_line();
    set_top_frame_line(parent_lineno);
    raw.lineno = 0;
    let _ = STACK_OWNER.try_with(|owner| {
        // SAFETY: owner.stack is alive for as long as the owner is.
        unsafe {
            (*owner.stack).push(LazilyEmittedFrame {
                frame,
                raw,
                emitted: false,
            });
        }
    });
}

pub(crate) fn pop_frame() {
    let emptied = with_stack(|stack| {
        if let Some(top) = stack.pop() {
            if top.emitted {
                let _ = PENDING_POPS.try_with(|pops| pops.set(pops.get() + 1));
            }
        }
        stack.is_empty()
    });
    if emptied == Some(true) {
        // Every pushed frame is popped. Flush now in case the thread is
        // exiting and never allocates again.
        emit_pending_pops();
    }
}

/// Drops all buffered state and optionally re-seeds the stack with the
/// frame currently executing on this thread.
pub fn reset_on_this_thread(current: Option<(FrameHandle, RawFrame)>) {
    let _ = PENDING_POPS.try_with(|pops| pops.set(0));
    let _ = with_stack(|stack| stack.clear());
    if let Some((frame, raw)) = current {
        push_frame(frame, raw);
    }
}

fn current_line() -> c_int {
    let reader = LINE_READER.load(Ordering::Relaxed);
    if reader == 0 {
        return top_frame_line();
    }
    // SAFETY: only ever stored from a LineReaderFn in set_line_reader.
    let reader: LineReaderFn = unsafe { std::mem::transmute::<usize, LineReaderFn>(reader) };
    with_stack(|stack| stack.last().map(|top| unsafe { reader(top.frame) }))
        .flatten()
        .unwrap_or(0)
}

fn top_frame_line() -> c_int {
    with_stack(|stack| stack.last().map(|top| top.raw.lineno))
        .flatten()
        .unwrap_or(0)
}

/// Updates the top frame's line. If that frame was already emitted with an
/// older line, schedule a synthetic pop so the re-push carries the new one.
fn set_top_frame_line(lineno: c_int) {
    let _ = with_stack(|stack| {
        let Some(top) = stack.last_mut() else {
            return;
        };
        if top.raw.lineno == lineno {
            return;
        }
        top.raw.lineno = lineno;
        if top.emitted {
            let _ = PENDING_POPS.try_with(|pops| pops.set(pops.get() + 1));
            top.emitted = false;
        }
    });
}

fn emit_pending_pops() {
    let generation = tracker_generation();
    let stale = GENERATION
        .try_with(|cell| {
            let stale = cell.get() != generation;
            cell.set(generation);
            stale
        })
        .unwrap_or(true);
    if stale {
        // A new tracker replaced the one we emitted into (another thread
        // re-created it, or a fork handler did). Nothing we emitted exists
        // in the new output: forget buffered pops and mark every frame
        // unemitted so it gets re-sent.
        let _ = PENDING_POPS.try_with(|pops| pops.set(0));
        let _ = with_stack(|stack| {
            for frame in stack.iter_mut() {
                frame.emitted = false;
            }
        });
        return;
    }

    let pops = PENDING_POPS.try_with(|pops| pops.replace(0)).unwrap_or(0);
    if pops > 0 {
        if let Some(tracker) = Tracker::instance() {
            tracker.pop_frames(pops);
        }
    }
}

fn emit_pending_pushes(tracker: &Tracker) {
    let _ = with_stack(|stack| {
        let first_unemitted = stack
            .iter()
            .rposition(|frame| frame.emitted)
            .map_or(0, |i| i + 1);
        for frame in &mut stack[first_unemitted..] {
            if !tracker.push_frame(&frame.raw) {
                break;
            }
            frame.emitted = true;
        }
    });
}

/// Brings the record stream up to date with this thread's stack so an
/// allocation record emitted next is attributed to the right location.
/// Called with the recursion guard held.
pub(crate) fn prepare_allocation_stack(tracker: &Tracker) {
    set_top_frame_line(current_line());
    emit_pending_pops();
    emit_pending_pushes(tracker);
}

#[cfg(test)]
pub(crate) fn stack_depth() -> usize {
    with_stack(|stack| stack.len()).unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn pending_pop_count() -> u32 {
    PENDING_POPS.try_with(Cell::get).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    static FAKE_LINE: AtomicI32 = AtomicI32::new(0);

    unsafe extern "C" fn fake_line_reader(_frame: FrameHandle) -> c_int {
        FAKE_LINE.load(Ordering::SeqCst)
    }

    fn raw(name: &'static std::ffi::CStr, file: &'static std::ffi::CStr) -> RawFrame {
        RawFrame {
            function_name: name.as_ptr(),
            filename: file.as_ptr(),
            lineno: 0,
            is_entry_frame: true,
        }
    }

    #[test]
    fn test_push_pop_depth() {
        reset_on_this_thread(None);
        push_frame(ptr::null_mut(), raw(c"outer", c"app.py"));
        push_frame(ptr::null_mut(), raw(c"inner", c"app.py"));
        assert_eq!(stack_depth(), 2);
        pop_frame();
        assert_eq!(stack_depth(), 1);
        pop_frame();
        assert_eq!(stack_depth(), 0);
    }

    #[test]
    fn test_unemitted_pops_are_free() {
        reset_on_this_thread(None);
        push_frame(ptr::null_mut(), raw(c"f", c"app.py"));
        pop_frame();
        // Never emitted, so no pop record needs to be buffered.
        assert_eq!(pending_pop_count(), 0);
    }

    #[test]
    fn test_line_reader_updates_caller_frame() {
        reset_on_this_thread(None);
        set_line_reader(Some(fake_line_reader));
        FAKE_LINE.store(17, Ordering::SeqCst);
        push_frame(ptr::null_mut(), raw(c"outer", c"app.py"));
        // Pushing a callee records line 17 as the caller's call site.
        push_frame(ptr::null_mut(), raw(c"inner", c"app.py"));
        with_stack(|stack| {
            assert_eq!(stack[0].raw.lineno, 17);
            assert_eq!(stack[1].raw.lineno, 0);
        })
        .unwrap();
        set_line_reader(None);
        reset_on_this_thread(None);
    }

    #[test]
    fn test_reset_reseeds_current_frame() {
        reset_on_this_thread(None);
        push_frame(ptr::null_mut(), raw(c"stale", c"app.py"));
        reset_on_this_thread(Some((ptr::null_mut(), raw(c"fresh", c"app.py"))));
        assert_eq!(stack_depth(), 1);
        with_stack(|stack| {
            let name = unsafe { std::ffi::CStr::from_ptr(stack[0].raw.function_name) };
            assert_eq!(name.to_str().unwrap(), "fresh");
        })
        .unwrap();
        reset_on_this_thread(None);
    }
}
