// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-wide tracker singleton. Construction installs the allocator
//! interceptors, snapshots the module map, starts the resident-set sampler
//! and flips the active flag; destruction reverses all of it and finalizes
//! the capture. At most one tracker exists at a time, reached through an
//! atomic pointer so the interceptors can find it without locks.

use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once, PoisonError};
use std::time::Duration;

use memtrail_records::frame_tree::StackTree;
use memtrail_records::records::{
    AllocationRecord, FrameId, FramePop, FramePush, FrameRegistry, MemoryRecord,
    NativeAllocationRecord, ThreadId, UnresolvedNativeFrame,
};
use memtrail_records::writer::{now_millis, FrameIndexRecord, RecordWriter};
use memtrail_records::AllocatorType;

use crate::guard::{self, RecursionGuard};
use crate::maps;
use crate::patcher::SymbolPatcher;
use crate::shadow::{self, RawFrame};
use crate::unwind::NativeTrace;
use crate::vm_alloc;

static TRACKER_INSTANCE: AtomicPtr<Tracker> = AtomicPtr::new(ptr::null_mut());
static TRACKER_OWNER: AtomicPtr<Tracker> = AtomicPtr::new(ptr::null_mut());
static TRACKER_ACTIVE: AtomicBool = AtomicBool::new(false);
static GENERATION: AtomicU32 = AtomicU32::new(0);
static PROFILE_INSTALLER: AtomicUsize = AtomicUsize::new(0);

/// How many times a tracker has been created in this process. Shadow stacks
/// compare against this to detect that their emitted state belongs to a
/// previous tracker's output.
pub(crate) fn tracker_generation() -> u32 {
    GENERATION.load(Ordering::SeqCst)
}

pub(crate) fn thread_id() -> ThreadId {
    // SAFETY: always callable; the value is only used as an identifier.
    unsafe { libc::pthread_self() as ThreadId }
}

/// Callback the embedder registers to install its profile hooks (the
/// shadow-stack feeders) on interpreter threads. Invoked once at tracker
/// construction and again from [`on_interpreter_lock_acquired`].
pub type ProfileInstallerFn = extern "C" fn();

pub fn set_profile_installer(installer: Option<ProfileInstallerFn>) {
    let value = match installer {
        Some(f) => f as usize,
        None => 0,
    };
    PROFILE_INSTALLER.store(value, Ordering::SeqCst);
}

/// Entry point for the embedder's interpreter-lock interception: a thread
/// that just acquired the interpreter lock may be one we have never seen,
/// so give the embedder a chance to install its profile hooks on it.
pub fn on_interpreter_lock_acquired() {
    let installer = PROFILE_INSTALLER.load(Ordering::SeqCst);
    if installer == 0 || !Tracker::active() {
        return;
    }
    let _guard = RecursionGuard::new();
    // SAFETY: only ever stored from a ProfileInstallerFn.
    let installer: ProfileInstallerFn =
        unsafe { std::mem::transmute::<usize, ProfileInstallerFn>(installer) };
    installer();
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("failed to write output header: {0}")]
    Header(#[source] std::io::Error),
    #[error("could not start memory sampler: {0}")]
    Sampler(#[source] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub native_traces: bool,
    pub memory_interval: Duration,
    pub follow_fork: bool,
    pub trace_interpreter_allocators: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            native_traces: false,
            memory_interval: Duration::from_millis(10),
            follow_fork: false,
            trace_interpreter_allocators: false,
        }
    }
}

/// Hot-path identity of an interned frame: the interpreter hands back the
/// same string pointers for the same code object, so hashing the addresses
/// (not the contents) keeps registration cheap. A duplicated string means a
/// frame registered twice, which is an acceptable trade for the speed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct RawFrameKey {
    function_name: usize,
    filename: usize,
    lineno: i32,
    is_entry_frame: bool,
}

impl From<&RawFrame> for RawFrameKey {
    fn from(raw: &RawFrame) -> Self {
        Self {
            function_name: raw.function_name as usize,
            filename: raw.filename as usize,
            lineno: raw.lineno,
            is_entry_frame: raw.is_entry_frame,
        }
    }
}

/// Everything serialized by the writer's mutex: the writer itself plus the
/// interning structures that are only mutated while emitting.
struct WriterState {
    writer: RecordWriter,
    frames: FrameRegistry<RawFrameKey>,
    native_tree: StackTree<u64>,
}

struct Sampler {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<std::thread::JoinHandle<()>>,
}

fn read_rss() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * page_size::get() as u64)
}

impl Sampler {
    fn start(state: Arc<Mutex<WriterState>>, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("memtrail-rss".to_owned())
            .spawn(move || {
                // This thread's own allocations must never be recorded.
                guard::set_active(true);
                loop {
                    {
                        let (lock, condvar) = &*stop_flag;
                        let stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
                        let (stopped, _timeout) = match condvar
                            .wait_timeout_while(stopped, interval, |stop| !*stop)
                        {
                            Ok(result) => result,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        if *stopped {
                            break;
                        }
                    }
                    let Some(rss) = read_rss() else {
                        log::warn!("failed to read RSS, deactivating tracking");
                        Tracker::deactivate();
                        break;
                    };
                    let record = MemoryRecord {
                        ms_since_epoch: now_millis(),
                        rss,
                    };
                    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    if state.writer.write_memory_record(&record).is_err() {
                        log::error!("failed to write output, deactivating tracking");
                        Tracker::deactivate();
                        break;
                    }
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn stop(mut self) {
        {
            let (lock, condvar) = &*self.stop;
            *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
            condvar.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct Tracker {
    state: Arc<Mutex<WriterState>>,
    patcher: Mutex<SymbolPatcher>,
    sampler: Mutex<Option<Sampler>>,
    native_traces: bool,
    memory_interval: Duration,
    follow_fork: bool,
    trace_interpreter_allocators: bool,
}

impl Tracker {
    /// Builds the singleton and starts tracking. Any previous tracker is
    /// torn down first; the new one is published before any hook can fire.
    pub fn create(writer: RecordWriter, config: &TrackerConfig) -> anyhow::Result<()> {
        Tracker::destroy();
        GENERATION.fetch_add(1, Ordering::SeqCst);

        let state = Arc::new(Mutex::new(WriterState {
            writer,
            frames: FrameRegistry::new(0, 1),
            native_tree: StackTree::new(),
        }));
        let tracker = Box::new(Tracker {
            state: Arc::clone(&state),
            patcher: Mutex::new(SymbolPatcher::new()),
            sampler: Mutex::new(None),
            native_traces: config.native_traces,
            memory_interval: config.memory_interval,
            follow_fork: config.follow_fork,
            trace_interpreter_allocators: config.trace_interpreter_allocators,
        });
        let raw = Box::into_raw(tracker);
        // Publish before installing hooks, so an interceptor that fires on
        // another thread mid-installation can already find us.
        TRACKER_INSTANCE.store(raw, Ordering::SeqCst);

        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            crate::hooks::ensure_all_hooks_are_valid();
            // Registered last so a child cannot inherit an environment
            // where only half of the one-time setup is done.
            // SAFETY: the three handlers are alive for the whole process.
            unsafe {
                libc::pthread_atfork(Some(prepare_fork), Some(parent_fork), Some(child_fork));
            }
        });

        // SAFETY: raw was just created by Box::into_raw and is only dropped
        // through destroy()/cleanup below.
        let tracker = unsafe { &*raw };
        let _guard = RecursionGuard::new();

        let header_result = {
            let mut state = tracker.lock_state();
            state
                .writer
                .set_main_tid_and_skipped_frames(thread_id(), 0);
            state.writer.write_header(false)
        };
        if let Err(e) = header_result {
            TRACKER_INSTANCE.store(ptr::null_mut(), Ordering::SeqCst);
            // SAFETY: raw is the pointer published above; nothing else owns it.
            drop(unsafe { Box::from_raw(raw) });
            return Err(TrackerError::Header(e).into());
        }

        tracker.update_module_cache();
        on_interpreter_lock_acquired();
        if tracker.trace_interpreter_allocators {
            // SAFETY: create() runs under the interpreter's serialization.
            unsafe {
                vm_alloc::install_registered();
            }
        }
        tracker
            .patcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .install();

        match Sampler::start(state, tracker.memory_interval) {
            Ok(sampler) => {
                *tracker
                    .sampler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(sampler);
            }
            Err(e) => log::warn!("{}", TrackerError::Sampler(e)),
        }

        TRACKER_ACTIVE.store(true, Ordering::Release);
        TRACKER_OWNER.store(raw, Ordering::SeqCst);
        Ok(())
    }

    /// Tears the singleton down, finalizing the capture. Idempotent.
    pub fn destroy() {
        let owner = TRACKER_OWNER.swap(ptr::null_mut(), Ordering::SeqCst);
        if !owner.is_null() {
            // SAFETY: the owner pointer is only ever a Box::into_raw result
            // and only this swap can reach it.
            drop(unsafe { Box::from_raw(owner) });
        }
    }

    pub fn active() -> bool {
        TRACKER_ACTIVE.load(Ordering::Relaxed)
    }

    pub(crate) fn deactivate() {
        TRACKER_ACTIVE.store(false, Ordering::Release);
    }

    pub(crate) fn instance() -> Option<&'static Tracker> {
        let raw = TRACKER_INSTANCE.load(Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        // SAFETY: the instance pointer is cleared before the box is freed,
        // and hooks only dereference it between those points while the
        // active flag says tracking is on.
        Some(unsafe { &*raw })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hot-path entry from the allocator interceptors.
    pub fn track_allocation(ptr: *mut c_void, size: usize, allocator: AllocatorType) {
        if guard::is_active() || !Self::active() {
            return;
        }
        let _guard = RecursionGuard::new();
        if let Some(tracker) = Self::instance() {
            tracker.track_allocation_impl(ptr as usize as u64, size as u64, allocator);
        }
    }

    pub fn track_deallocation(ptr: *mut c_void, size: usize, allocator: AllocatorType) {
        if guard::is_active() || !Self::active() {
            return;
        }
        let _guard = RecursionGuard::new();
        if let Some(tracker) = Self::instance() {
            let record = AllocationRecord {
                address: ptr as usize as u64,
                size: size as u64,
                allocator,
            };
            if tracker
                .lock_state()
                .writer
                .write_allocation(thread_id(), &record)
                .is_err()
            {
                log::error!("failed to write output, deactivating tracking");
                Self::deactivate();
            }
        }
    }

    fn track_allocation_impl(&self, address: u64, size: u64, allocator: AllocatorType) {
        shadow::prepare_allocation_stack(self);

        if self.native_traces {
            let mut trace = NativeTrace::new();
            // Skip the interceptor and this function.
            let filled = trace.fill(2);
            let mut state = self.lock_state();
            let WriterState {
                writer,
                native_tree,
                ..
            } = &mut *state;
            let native_index = if filled {
                native_tree.trace_index_with(trace.frames(), &mut |ip, parent_index| {
                    writer
                        .write_unresolved_native_frame(&UnresolvedNativeFrame { ip, parent_index })
                        .is_ok()
                })
            } else {
                0
            };
            let record = NativeAllocationRecord {
                address,
                size,
                allocator,
                native_frame_id: u64::from(native_index),
            };
            if writer.write_native_allocation(thread_id(), &record).is_err() {
                log::error!("failed to write output, deactivating tracking");
                Self::deactivate();
            }
        } else {
            let record = AllocationRecord {
                address,
                size,
                allocator,
            };
            if self
                .lock_state()
                .writer
                .write_allocation(thread_id(), &record)
                .is_err()
            {
                log::error!("failed to write output, deactivating tracking");
                Self::deactivate();
            }
        }
    }

    /// Buffered frame pops from the shadow stack. Returns false when the
    /// write failed and tracking was shut down.
    pub(crate) fn pop_frames(&self, count: u32) -> bool {
        if self
            .lock_state()
            .writer
            .write_frame_pop(thread_id(), FramePop { count })
            .is_err()
        {
            log::error!("failed to write output, deactivating tracking");
            Self::deactivate();
            return false;
        }
        true
    }

    /// Registers (if new) and pushes one shadow-stack frame.
    pub(crate) fn push_frame(&self, raw: &RawFrame) -> bool {
        let tid = thread_id();
        let mut state = self.lock_state();
        let (frame_id, is_new) = state.frames.index_of(RawFrameKey::from(raw));
        if is_new && !write_frame_index(&mut state, frame_id, raw) {
            drop(state);
            Self::deactivate();
            return false;
        }
        if state
            .writer
            .write_frame_push(tid, FramePush { frame_id })
            .is_err()
        {
            drop(state);
            log::error!("failed to write output, deactivating tracking");
            Self::deactivate();
            return false;
        }
        true
    }

    /// Thread-name capture (`prctl(PR_SET_NAME)` or the embedder's API).
    pub fn register_thread_name(name: *const c_char) {
        if name.is_null() || guard::is_active() || !Self::active() {
            return;
        }
        let _guard = RecursionGuard::new();
        if let Some(tracker) = Self::instance() {
            // SAFETY: callers pass a NUL-terminated name.
            let name = unsafe { CStr::from_ptr(name) };
            if tracker
                .lock_state()
                .writer
                .write_thread_record(thread_id(), name)
                .is_err()
            {
                log::error!("failed to write output, deactivating tracking");
                Self::deactivate();
            }
        }
    }

    /// Re-runs symbol patching and emits a fresh memory-map snapshot, so
    /// code from newly (un)loaded libraries is intercepted and its
    /// instruction pointers resolve against the right layout.
    pub fn invalidate_module_cache() {
        if guard::is_active() || !Self::active() {
            return;
        }
        let _guard = RecursionGuard::new();
        if let Some(tracker) = Self::instance() {
            tracker
                .patcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .install();
            tracker.update_module_cache();
        }
    }

    fn update_module_cache(&self) {
        let images = maps::collect_image_segments();
        if self.lock_state().writer.write_mappings(&images).is_err() {
            log::error!("failed to write output, deactivating tracking");
            Self::deactivate();
        }
    }
}

fn write_frame_index(state: &mut WriterState, frame_id: FrameId, raw: &RawFrame) -> bool {
    let function_name = if raw.function_name.is_null() {
        c""
    } else {
        // SAFETY: interned interpreter string, NUL-terminated and immortal
        // for the session.
        unsafe { CStr::from_ptr(raw.function_name) }
    };
    let filename = if raw.filename.is_null() {
        c""
    } else {
        // SAFETY: as above.
        unsafe { CStr::from_ptr(raw.filename) }
    };
    let record = FrameIndexRecord {
        frame_id,
        function_name,
        filename,
        lineno: raw.lineno,
        is_entry_frame: raw.is_entry_frame,
    };
    if state.writer.write_frame_index(&record).is_err() {
        log::error!("failed to write output, deactivating tracking");
        return false;
    }
    true
}

impl Drop for Tracker {
    fn drop(&mut self) {
        let _guard = RecursionGuard::new();
        Self::deactivate();
        if let Some(sampler) = self
            .sampler
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sampler.stop();
        }
        shadow::reset_on_this_thread(None);
        self.patcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .restore();
        if self.trace_interpreter_allocators {
            // SAFETY: teardown runs under the interpreter's serialization.
            unsafe {
                vm_alloc::uninstall_registered();
            }
        }
        {
            let mut state = self.lock_state();
            if let Err(e) = state.writer.write_trailer() {
                log::warn!("failed to write trailer: {e}");
            }
            if let Err(e) = state.writer.write_header(true) {
                log::warn!("failed to finalize header: {e}");
            }
        }
        // Must stay set until after the hooks are restored.
        TRACKER_INSTANCE.store(ptr::null_mut(), Ordering::SeqCst);
    }
}

extern "C" fn prepare_fork() {
    // Don't track anything while the process is mid-fork.
    guard::set_active(true);
}

extern "C" fn parent_fork() {
    guard::set_active(false);
}

extern "C" fn child_fork() {
    // Intentionally leak the inherited tracker. Its destructor cannot run:
    // it would try to unlock mutexes whose owners no longer exist and join
    // a sampler thread that did not survive the fork.
    let _leaked = TRACKER_OWNER.swap(ptr::null_mut(), Ordering::SeqCst);

    let old = TRACKER_INSTANCE.load(Ordering::SeqCst);
    let inherited = if old.is_null() || !Tracker::active() {
        None
    } else {
        // SAFETY: the leaked tracker's memory stays valid forever.
        let old = unsafe { &*old };
        if old.follow_fork {
            old.state
                .try_lock()
                .ok()
                .and_then(|state| state.writer.clone_in_child_process().ok().flatten())
                .map(|writer| (writer, old))
        } else {
            None
        }
    };

    match inherited {
        Some((writer, old)) => {
            let config = TrackerConfig {
                native_traces: old.native_traces,
                memory_interval: old.memory_interval,
                follow_fork: old.follow_fork,
                trace_interpreter_allocators: old.trace_interpreter_allocators,
            };
            TRACKER_ACTIVE.store(false, Ordering::SeqCst);
            if let Err(e) = Tracker::create(writer, &config) {
                log::warn!("could not re-enable tracking in fork child: {e}");
                TRACKER_INSTANCE.store(ptr::null_mut(), Ordering::SeqCst);
            }
        }
        None => {
            // No tracker, a deactivated tracker, or an uncloneable sink.
            // The old hooks may still be installed; they check the active
            // flag before touching the (now null) singleton.
            TRACKER_INSTANCE.store(ptr::null_mut(), Ordering::SeqCst);
            TRACKER_ACTIVE.store(false, Ordering::SeqCst);
        }
    }
    guard::set_active(false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TrackerConfig::default();
        assert!(!config.native_traces);
        assert!(!config.follow_fork);
        assert!(!config.trace_interpreter_allocators);
        assert_eq!(config.memory_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_thread_id_is_stable_within_a_thread() {
        let here = thread_id();
        assert_eq!(here, thread_id());
        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, other);
    }

    #[test]
    fn test_raw_frame_key_identity_is_pointer_based() {
        let name = c"function";
        let file = c"file.py";
        let frame = RawFrame {
            function_name: name.as_ptr(),
            filename: file.as_ptr(),
            lineno: 3,
            is_entry_frame: true,
        };
        assert_eq!(RawFrameKey::from(&frame), RawFrameKey::from(&frame));
        let other_line = RawFrame { lineno: 4, ..frame };
        assert_ne!(RawFrameKey::from(&frame), RawFrameKey::from(&other_line));
    }

    #[test]
    fn test_read_rss_reports_something() {
        let rss = read_rss().unwrap();
        assert!(rss > 0);
    }

    #[test]
    fn test_no_tracker_means_inactive() {
        // Creation/destruction is exercised by the integration tests; here
        // we only pin down the resting state.
        if TRACKER_OWNER.load(Ordering::SeqCst).is_null() {
            assert!(Tracker::instance().is_none() || Tracker::active());
        }
    }
}
