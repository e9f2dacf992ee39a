// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(target_os = "linux")]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! In-process allocation tracking for memtrail.
//!
//! The tracker redirects every dynamically-resolved call to the hooked
//! allocator symbols (`malloc`, `free`, `mmap`, the aligned family,
//! `dlopen`, ...) into thin interceptors by rewriting the relocation tables
//! of every loaded object. Each event is attributed to the interpreter's
//! call stack through a per-thread shadow stack and, optionally, to the
//! native stack, then streamed through a
//! [`RecordWriter`](memtrail_records::RecordWriter) to a file or socket.
//!
//! Lifecycle is explicit: [`Tracker::create`](tracker::Tracker::create)
//! starts a session, [`Tracker::destroy`](tracker::Tracker::destroy) ends
//! it. At most one session exists per process.

pub mod guard;
pub mod hooks;
pub mod maps;
pub mod patcher;
pub mod shadow;
pub mod tracker;
pub mod unwind;
pub mod vm_alloc;

pub use guard::RecursionGuard;
pub use patcher::SymbolPatcher;
pub use shadow::{FrameHandle, RawFrame};
pub use tracker::{
    on_interpreter_lock_acquired, set_profile_installer, Tracker, TrackerConfig, TrackerError,
};
