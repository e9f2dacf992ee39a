// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The typed record model shared by the capture writer and reader.

use std::collections::HashMap;
use std::hash::Hash;

/// File magic, including the trailing NUL.
pub const MAGIC: &[u8; 7] = b"memray\0";

/// Version stamped into (and required from) the fixed header.
pub const CURRENT_HEADER_VERSION: i32 = 7;

pub type FrameId = u64;
pub type ThreadId = u64;
pub type Millis = u64;

/// Index of a node in a [`crate::frame_tree::StackTree`].
pub type TreeIndex = u32;

/// Low nibble of every record token.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RecordType {
    Uninitialized = 0,
    Allocation = 1,
    AllocationWithNative = 2,
    FrameIndex = 3,
    FramePush = 4,
    NativeTraceIndex = 5,
    MemoryMapStart = 6,
    SegmentHeader = 7,
    Segment = 8,
    FramePop = 9,
    ThreadRecord = 10,
    MemoryRecord = 11,
    ContextSwitch = 12,
    Other = 13,
}

impl RecordType {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            1 => Some(RecordType::Allocation),
            2 => Some(RecordType::AllocationWithNative),
            3 => Some(RecordType::FrameIndex),
            4 => Some(RecordType::FramePush),
            5 => Some(RecordType::NativeTraceIndex),
            6 => Some(RecordType::MemoryMapStart),
            7 => Some(RecordType::SegmentHeader),
            8 => Some(RecordType::Segment),
            9 => Some(RecordType::FramePop),
            10 => Some(RecordType::ThreadRecord),
            11 => Some(RecordType::MemoryRecord),
            12 => Some(RecordType::ContextSwitch),
            13 => Some(RecordType::Other),
            _ => None,
        }
    }
}

/// Flag value carried by [`RecordType::Other`] tokens. Non-zero so a zeroed
/// file tail can never be mistaken for a trailer.
pub const TRAILER_FLAG: u8 = 1;

/// One byte on the wire: record type in the low nibble, flags in the high.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordToken {
    pub record_type: RecordType,
    pub flags: u8,
}

impl RecordToken {
    #[inline]
    pub fn new(record_type: RecordType, flags: u8) -> Self {
        debug_assert!(flags <= 0x0F);
        Self { record_type, flags }
    }

    #[inline]
    pub fn pack(self) -> u8 {
        (self.record_type as u8) | (self.flags << 4)
    }

    #[inline]
    pub fn unpack(byte: u8) -> Option<Self> {
        let record_type = RecordType::from_nibble(byte & 0x0F)?;
        Some(Self {
            record_type,
            flags: byte >> 4,
        })
    }
}

/// Which hooked entry point produced an allocation record. The discriminant
/// is the flag nibble of allocation tokens, so it must stay within 4 bits.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum AllocatorType {
    Malloc = 1,
    Free = 2,
    Calloc = 3,
    Realloc = 4,
    PosixMemalign = 5,
    AlignedAlloc = 6,
    Memalign = 7,
    Valloc = 8,
    Pvalloc = 9,
    Mmap = 10,
    Munmap = 11,
    PymallocMalloc = 12,
    PymallocCalloc = 13,
    PymallocRealloc = 14,
    PymallocFree = 15,
}

impl AllocatorType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AllocatorType::Malloc),
            2 => Some(AllocatorType::Free),
            3 => Some(AllocatorType::Calloc),
            4 => Some(AllocatorType::Realloc),
            5 => Some(AllocatorType::PosixMemalign),
            6 => Some(AllocatorType::AlignedAlloc),
            7 => Some(AllocatorType::Memalign),
            8 => Some(AllocatorType::Valloc),
            9 => Some(AllocatorType::Pvalloc),
            10 => Some(AllocatorType::Mmap),
            11 => Some(AllocatorType::Munmap),
            12 => Some(AllocatorType::PymallocMalloc),
            13 => Some(AllocatorType::PymallocCalloc),
            14 => Some(AllocatorType::PymallocRealloc),
            15 => Some(AllocatorType::PymallocFree),
            _ => None,
        }
    }

    pub fn kind(self) -> AllocatorKind {
        match self {
            AllocatorType::Malloc
            | AllocatorType::Calloc
            | AllocatorType::Realloc
            | AllocatorType::PosixMemalign
            | AllocatorType::AlignedAlloc
            | AllocatorType::Memalign
            | AllocatorType::Valloc
            | AllocatorType::Pvalloc
            | AllocatorType::PymallocMalloc
            | AllocatorType::PymallocCalloc
            | AllocatorType::PymallocRealloc => AllocatorKind::SimpleAllocator,
            AllocatorType::Free | AllocatorType::PymallocFree => AllocatorKind::SimpleDeallocator,
            AllocatorType::Mmap => AllocatorKind::RangedAllocator,
            AllocatorType::Munmap => AllocatorKind::RangedDeallocator,
        }
    }

    pub fn is_deallocator(self) -> bool {
        matches!(
            self.kind(),
            AllocatorKind::SimpleDeallocator | AllocatorKind::RangedDeallocator
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocatorKind {
    SimpleAllocator,
    SimpleDeallocator,
    RangedAllocator,
    RangedDeallocator,
}

/// Which pluggable allocator the interpreter was configured with when the
/// capture started.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PythonAllocatorType {
    Pymalloc = 1,
    PymallocDebug = 2,
    Malloc = 3,
    Other = 4,
}

impl PythonAllocatorType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PythonAllocatorType::Pymalloc),
            2 => Some(PythonAllocatorType::PymallocDebug),
            3 => Some(PythonAllocatorType::Malloc),
            4 => Some(PythonAllocatorType::Other),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TrackerStats {
    pub n_allocations: u64,
    pub n_frames: u64,
    pub start_time: Millis,
    pub end_time: Millis,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeaderRecord {
    pub version: i32,
    pub native_traces: bool,
    pub stats: TrackerStats,
    pub command_line: String,
    pub pid: i32,
    pub main_tid: ThreadId,
    pub skipped_frames_on_main_tid: u64,
    pub python_allocator: PythonAllocatorType,
}

/// An interpreter source location, owned. Equality and hashing include the
/// line number, so the same function at two lines is two distinct frames.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Frame {
    pub function_name: String,
    pub filename: String,
    pub lineno: i32,
    pub is_entry_frame: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemoryRecord {
    pub ms_since_epoch: Millis,
    pub rss: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AllocationRecord {
    pub address: u64,
    pub size: u64,
    pub allocator: AllocatorType,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NativeAllocationRecord {
    pub address: u64,
    pub size: u64,
    pub allocator: AllocatorType,
    pub native_frame_id: FrameId,
}

/// A fully-attributed allocation event, as reconstructed by the reader.
#[derive(Clone, Debug, PartialEq)]
pub struct Allocation {
    pub tid: ThreadId,
    pub address: u64,
    pub size: u64,
    pub allocator: AllocatorType,
    pub native_frame_id: FrameId,
    pub frame_index: TreeIndex,
    pub native_segment_generation: u64,
    pub n_allocations: u64,
}

impl Allocation {
    pub fn new(tid: ThreadId, address: u64, size: u64, allocator: AllocatorType) -> Self {
        Self {
            tid,
            address,
            size,
            allocator,
            native_frame_id: 0,
            frame_index: 0,
            native_segment_generation: 0,
            n_allocations: 1,
        }
    }
}

/// One loadable segment of an on-disk image, relative to its load address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Segment {
    pub vaddr: u64,
    pub memsz: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageSegments {
    pub filename: String,
    pub addr: u64,
    pub segments: Vec<Segment>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FramePush {
    pub frame_id: FrameId,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FramePop {
    pub count: u32,
}

/// A node of the native frame tree before symbol resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnresolvedNativeFrame {
    pub ip: u64,
    pub parent_index: TreeIndex,
}

/// Interns frames, handing out monotonically increasing ids. `increment`
/// lets two registries share an id space without colliding.
#[derive(Debug)]
pub struct FrameRegistry<F> {
    increment: u64,
    next_id: FrameId,
    map: HashMap<F, FrameId>,
}

impl<F: Eq + Hash> FrameRegistry<F> {
    pub fn new(starting_index: FrameId, increment: u64) -> Self {
        Self {
            increment,
            next_id: starting_index,
            map: HashMap::new(),
        }
    }

    /// Returns the id for `frame` and whether it was newly registered.
    pub fn index_of(&mut self, frame: F) -> (FrameId, bool) {
        match self.map.entry(frame) {
            std::collections::hash_map::Entry::Occupied(entry) => (*entry.get(), false),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let id = self.next_id;
                self.next_id += self.increment;
                entry.insert(id);
                (id, true)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
