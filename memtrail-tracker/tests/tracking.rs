// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tracking sessions: a real tracker writing into memory or a
//! file, interceptors firing, and the reader plus the aggregators
//! reconstructing what happened.
//!
//! Each test owns the process-wide tracker singleton for its duration, so
//! they serialize on a shared mutex.

use std::ffi::{c_void, CString};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use memtrail_records::reader::RecordReader;
use memtrail_records::records::{Allocation, PythonAllocatorType};
use memtrail_records::sink::{FileSink, MemorySink};
use memtrail_records::source::{BufferSource, FileSource};
use memtrail_records::symbols::BacktraceSymbolizer;
use memtrail_records::writer::RecordWriter;
use memtrail_records::AllocatorType;
use memtrail_snapshot::{SnapshotAllocationAggregator, StreamingAllocationAggregator};
use memtrail_tracker::hooks::intercept;
use memtrail_tracker::{shadow, RecursionGuard, Tracker, TrackerConfig};

fn session_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn memory_writer() -> (RecordWriter, Arc<Mutex<Vec<u8>>>) {
    let (sink, data) = MemorySink::new();
    let writer = RecordWriter::new(
        Box::new(sink),
        "python tracked.py".to_owned(),
        false,
        PythonAllocatorType::Malloc,
    );
    (writer, data)
}

fn read_all(bytes: Vec<u8>) -> RecordReader {
    let mut reader = RecordReader::new(Box::new(BufferSource::new(bytes))).unwrap();
    // A session shared with the rest of the test harness can contain a
    // truncated tail if tracking was deactivated mid-record; everything
    // decoded before that stays valid.
    let _ = reader.read_to_end();
    reader
}

fn events_at<'a>(
    reader: &'a RecordReader,
    addresses: &'a [u64],
) -> impl Iterator<Item = &'a Allocation> + 'a {
    reader
        .allocations()
        .iter()
        .filter(move |allocation| addresses.contains(&allocation.address))
}

#[test]
fn test_malloc_free_round_trip_and_high_water_mark() {
    let _session = session_lock();
    let (writer, data) = memory_writer();
    Tracker::create(writer, &TrackerConfig::default()).unwrap();

    let size = 1 << 20;
    let (first, second);
    unsafe {
        first = intercept::malloc(size);
        assert!(!first.is_null());
        intercept::free(first);
        second = intercept::malloc(size);
        assert!(!second.is_null());
        intercept::free(second);
    }
    Tracker::destroy();

    let reader = read_all(data.lock().unwrap().clone());
    let ours: Vec<Allocation> = events_at(&reader, &[first as u64, second as u64])
        .cloned()
        .collect();

    // Allocation and deallocation records for both pointers, in order.
    let mallocs: Vec<&Allocation> = ours
        .iter()
        .filter(|a| a.allocator == AllocatorType::Malloc && a.size == size as u64)
        .collect();
    assert_eq!(mallocs.len(), 2);
    let frees = ours
        .iter()
        .filter(|a| a.allocator == AllocatorType::Free)
        .count();
    assert_eq!(frees, 2);

    // The peak over just these events is one buffer, and nothing leaks.
    let mut streaming = StreamingAllocationAggregator::new();
    for event in &ours {
        streaming.add_allocation(event);
    }
    assert_eq!(streaming.high_water_mark().peak_memory, size as u64);
    let leaked: u64 = streaming
        .leaked_allocations(true)
        .values()
        .map(|a| a.size)
        .sum();
    assert_eq!(leaked, 0);

    // The capture ended cleanly: final stats made it into the header.
    assert!(reader.header().stats.n_allocations > 0);
    assert_eq!(reader.header().command_line, "python tracked.py");
}

#[test]
fn test_allocations_under_recursion_guard_are_not_recorded() {
    let _session = session_lock();
    let (writer, data) = memory_writer();
    Tracker::create(writer, &TrackerConfig::default()).unwrap();

    let hidden;
    unsafe {
        let _guard = RecursionGuard::new();
        hidden = intercept::malloc(4096);
        assert!(!hidden.is_null());
    }
    let visible = unsafe { intercept::malloc(4096) };
    unsafe {
        intercept::free(visible);
        let _guard = RecursionGuard::new();
        intercept::free(hidden);
    }
    Tracker::destroy();

    let reader = read_all(data.lock().unwrap().clone());
    assert_eq!(events_at(&reader, &[hidden as u64]).count(), 0);
    assert!(events_at(&reader, &[visible as u64]).count() >= 1);
}

#[test]
fn test_partial_munmap_snapshot() {
    let _session = session_lock();
    let (writer, data) = memory_writer();
    Tracker::create(writer, &TrackerConfig::default()).unwrap();

    let page = page_size();
    let mapped = unsafe {
        intercept::mmap(
            std::ptr::null_mut(),
            3 * page,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(mapped, libc::MAP_FAILED);
    let middle = (mapped as usize + page) as *mut c_void;
    assert_eq!(unsafe { intercept::munmap(middle, page) }, 0);
    Tracker::destroy();
    unsafe {
        libc::munmap(mapped, page);
        libc::munmap((mapped as usize + 2 * page) as *mut c_void, page);
    }

    let reader = read_all(data.lock().unwrap().clone());
    let mut aggregator = SnapshotAllocationAggregator::new();
    for event in reader.allocations() {
        let in_range = event.address >= mapped as u64
            && event.address < (mapped as usize + 3 * page) as u64;
        if in_range && matches!(event.allocator, AllocatorType::Mmap | AllocatorType::Munmap) {
            aggregator.add_allocation(event);
        }
    }
    // First and last pages stay mapped; the middle one is gone.
    assert_eq!(aggregator.live_bytes(), 2 * page as u64);
}

#[test]
fn test_shadow_stack_attributes_allocations() {
    let _session = session_lock();
    let (writer, data) = memory_writer();
    Tracker::create(writer, &TrackerConfig::default()).unwrap();

    let function = CString::new("load_config").unwrap();
    let filename = CString::new("settings.py").unwrap();
    shadow::on_function_call(
        std::ptr::null_mut(),
        shadow::RawFrame {
            function_name: function.as_ptr(),
            filename: filename.as_ptr(),
            lineno: 0,
            is_entry_frame: true,
        },
    );
    let ptr = unsafe { intercept::malloc(512) };
    shadow::on_function_return();
    unsafe { intercept::free(ptr) };
    Tracker::destroy();

    let reader = read_all(data.lock().unwrap().clone());
    let allocation = events_at(&reader, &[ptr as u64])
        .find(|a| a.allocator == AllocatorType::Malloc)
        .unwrap()
        .clone();
    let stack = reader.stack_for(allocation.frame_index);
    assert_eq!(stack.len(), 1);
    assert_eq!(stack[0].function_name, "load_config");
    assert_eq!(stack[0].filename, "settings.py");
}

#[test]
fn test_prctl_thread_name_is_captured() {
    let _session = session_lock();
    let (writer, data) = memory_writer();
    Tracker::create(writer, &TrackerConfig::default()).unwrap();

    let name = CString::new("mt-worker").unwrap();
    unsafe {
        intercept::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
    let tid = unsafe { libc::pthread_self() as u64 };
    Tracker::destroy();

    let reader = read_all(data.lock().unwrap().clone());
    assert_eq!(reader.thread_name(tid), Some("mt-worker"));
}

#[inline(never)]
fn alloc_leaf(size: usize) -> *mut c_void {
    let ptr = unsafe { intercept::malloc(size) };
    assert!(!ptr.is_null());
    unsafe { std::ptr::write_bytes(ptr as *mut u8, 0x11, 1) };
    ptr
}

#[inline(never)]
fn alloc_middle(size: usize) -> *mut c_void {
    alloc_leaf(size)
}

#[inline(never)]
fn alloc_outer(size: usize) -> *mut c_void {
    alloc_middle(size)
}

#[test]
fn test_native_traces_resolve_deepest_first() {
    let _session = session_lock();
    let (writer, data) = memory_writer();
    let config = TrackerConfig {
        native_traces: true,
        ..TrackerConfig::default()
    };
    Tracker::create(writer, &config).unwrap();
    let ptr = alloc_outer(8192);
    unsafe { intercept::free(ptr) };
    Tracker::destroy();

    let bytes = data.lock().unwrap().clone();
    let mut reader =
        RecordReader::with_symbolizer(Box::new(BufferSource::new(bytes)), Box::new(BacktraceSymbolizer))
            .unwrap();
    let _ = reader.read_to_end();

    let allocation = reader
        .allocations()
        .iter()
        .find(|a| a.address == ptr as u64 && a.allocator == AllocatorType::Malloc)
        .unwrap()
        .clone();
    assert_ne!(allocation.native_frame_id, 0);

    let frames = reader.native_stack_for(
        allocation.native_frame_id,
        allocation.native_segment_generation,
    );
    assert!(!frames.is_empty());

    let position = |needle: &str| {
        frames
            .iter()
            .position(|frame| frame.function_name.contains(needle))
    };
    let (leaf, middle, outer) = (
        position("alloc_leaf"),
        position("alloc_middle"),
        position("alloc_outer"),
    );
    assert!(leaf.is_some(), "leaf frame missing from {frames:?}");
    assert!(middle.is_some(), "middle frame missing");
    assert!(outer.is_some(), "outer frame missing");
    assert!(leaf < middle, "deepest frame must resolve first");
    assert!(middle < outer);
}

#[test]
fn test_fork_child_without_cloneable_sink_unsets_tracker() {
    let _session = session_lock();
    let (writer, data) = memory_writer();
    // MemorySink cannot be cloned into a child, so even with follow-fork
    // the child must end up without a tracker.
    let config = TrackerConfig {
        follow_fork: true,
        ..TrackerConfig::default()
    };
    Tracker::create(writer, &config).unwrap();

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);
    if pid == 0 {
        let ok = !Tracker::active();
        unsafe { libc::_exit(if ok { 0 } else { 1 }) };
    }
    let mut status = 0;
    unsafe { libc::waitpid(pid, &mut status, 0) };
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 0);

    // The parent keeps tracking across the fork.
    assert!(Tracker::active());
    let ptr = unsafe { intercept::malloc(256) };
    unsafe { intercept::free(ptr) };
    Tracker::destroy();

    let reader = read_all(data.lock().unwrap().clone());
    assert!(events_at(&reader, &[ptr as u64]).count() >= 1);
}

#[test]
fn test_compressed_file_session_round_trips() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.bin");
    let sink = FileSink::new(&path, true, true).unwrap();
    let writer = RecordWriter::new(
        Box::new(sink),
        "python tracked.py".to_owned(),
        false,
        PythonAllocatorType::Malloc,
    );
    Tracker::create(writer, &TrackerConfig::default()).unwrap();
    let ptr = unsafe { intercept::malloc(123_456) };
    unsafe { intercept::free(ptr) };
    Tracker::destroy();

    // The sink recompressed the capture on close.
    let mut magic = [0u8; 4];
    use std::io::Read as _;
    std::fs::File::open(&path)
        .unwrap()
        .read_exact(&mut magic)
        .unwrap();
    assert_eq!(magic, [0x04, 0x22, 0x4D, 0x18]);

    let source = FileSource::new(&path).unwrap();
    let mut reader = RecordReader::new(Box::new(source)).unwrap();
    let _ = reader.read_to_end();
    let recorded = reader
        .allocations()
        .iter()
        .any(|a| a.address == ptr as u64 && a.size == 123_456);
    assert!(recorded);
}

#[test]
fn test_uncompressed_file_session_round_trips() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.bin");
    let sink = FileSink::new(&path, true, false).unwrap();
    let writer = RecordWriter::new(
        Box::new(sink),
        "python tracked.py".to_owned(),
        false,
        PythonAllocatorType::Malloc,
    );
    Tracker::create(writer, &TrackerConfig::default()).unwrap();
    let ptr = unsafe { intercept::malloc(54_321) };
    unsafe { intercept::free(ptr) };
    Tracker::destroy();

    // The fallocate'd zero tail after the trailer must not confuse the
    // reader.
    let source = FileSource::new(&path).unwrap();
    let mut reader = RecordReader::new(Box::new(source)).unwrap();
    reader.read_to_end().unwrap();
    assert!(reader
        .allocations()
        .iter()
        .any(|a| a.address == ptr as u64 && a.size == 54_321));
    assert!(reader.header().stats.end_time >= reader.header().stats.start_time);
}

fn page_size() -> usize {
    // SAFETY: sysconf is always callable.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
