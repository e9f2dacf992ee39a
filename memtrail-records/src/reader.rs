// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming parser for capture streams. Records are consumed one at a time;
//! the reader incrementally rebuilds the frame map, the per-thread shadow
//! stacks, the call-stack trie and the memory-map generations, and surfaces
//! allocation and memory events to the caller as they are decoded.

use std::collections::HashMap;
use std::io::{self, Read};

use crate::codec::{read_delta, read_varint, DeltaEncodedFields};
use crate::frame_tree::StackTree;
use crate::records::{
    Allocation, AllocatorKind, AllocatorType, Frame, FrameId, HeaderRecord, ImageSegments,
    MemoryRecord, PythonAllocatorType, RecordToken, RecordType, Segment, ThreadId, TrackerStats,
    TreeIndex, UnresolvedNativeFrame, CURRENT_HEADER_VERSION, MAGIC, TRAILER_FLAG,
};
use crate::source::Source;
use crate::symbols::{NullSymbolizer, ResolvedFrame, SymbolResolver, Symbolizer};

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("I/O error reading stream: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic: not a memtrail capture")]
    BadMagic,
    #[error("unsupported capture version {0}")]
    UnsupportedVersion(i32),
    #[error("unknown record type byte {0:#04x}")]
    UnknownRecordType(u8),
    #[error("unknown allocator value {0}")]
    UnknownAllocator(u8),
    #[error("unknown python allocator value {0}")]
    UnknownPythonAllocator(u8),
    #[error("two frame records with the same id {0}")]
    DuplicateFrameId(FrameId),
    #[error("segment header not followed by a segment record")]
    MissingSegment,
}

/// A record surfaced to the caller. Structural records (frames, maps,
/// context switches) are folded into reader state instead.
#[derive(Clone, Debug, PartialEq)]
pub enum ReaderEvent {
    Allocation(Allocation),
    MemoryRecord(MemoryRecord),
}

struct SourceRead<'a>(&'a mut dyn Source);

impl Read for SourceRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read_exact(buf)?;
        Ok(buf.len())
    }
}

pub struct RecordReader {
    source: Box<dyn Source>,
    header: HeaderRecord,
    frame_map: HashMap<FrameId, Frame>,
    stack_traces: HashMap<ThreadId, Vec<FrameId>>,
    tree: StackTree<FrameId>,
    native_frames: Vec<UnresolvedNativeFrame>,
    resolver: SymbolResolver,
    thread_names: HashMap<ThreadId, String>,
    allocations: Vec<Allocation>,
    memory_records: Vec<MemoryRecord>,
    last: DeltaEncodedFields,
    failed: bool,
}

impl RecordReader {
    pub fn new(source: Box<dyn Source>) -> Result<Self, ReadError> {
        Self::with_symbolizer(source, Box::new(NullSymbolizer))
    }

    pub fn with_symbolizer(
        mut source: Box<dyn Source>,
        symbolizer: Box<dyn Symbolizer>,
    ) -> Result<Self, ReadError> {
        let header = read_header(&mut *source)?;
        Ok(Self {
            source,
            header,
            frame_map: HashMap::new(),
            stack_traces: HashMap::new(),
            tree: StackTree::new(),
            native_frames: Vec::new(),
            resolver: SymbolResolver::new(symbolizer),
            thread_names: HashMap::new(),
            allocations: Vec::new(),
            memory_records: Vec::new(),
            last: DeltaEncodedFields::default(),
            failed: false,
        })
    }

    pub fn header(&self) -> &HeaderRecord {
        &self.header
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    pub fn memory_records(&self) -> &[MemoryRecord] {
        &self.memory_records
    }

    pub fn thread_name(&self, tid: ThreadId) -> Option<&str> {
        self.thread_names.get(&tid).map(String::as_str)
    }

    /// Interpreter stack for an allocation, deepest frame first.
    pub fn stack_for(&self, frame_index: TreeIndex) -> Vec<Frame> {
        self.tree
            .walk(frame_index)
            .filter_map(|frame_id| self.frame_map.get(&frame_id).cloned())
            .collect()
    }

    /// Native stack for an allocation, deepest frame first, resolved against
    /// the module layout that was live when the allocation happened.
    pub fn native_stack_for(
        &mut self,
        native_frame_id: FrameId,
        generation: u64,
    ) -> Vec<ResolvedFrame> {
        let mut resolved = Vec::new();
        let mut index = native_frame_id;
        while index != 0 {
            let Some(frame) = self.native_frames.get(index as usize - 1) else {
                break;
            };
            resolved.extend_from_slice(self.resolver.resolve(frame.ip, generation));
            index = u64::from(frame.parent_index);
        }
        resolved
    }

    /// Drains the stream, retaining every decoded event.
    pub fn read_to_end(&mut self) -> Result<(), ReadError> {
        while self.next_record()?.is_some() {}
        Ok(())
    }

    /// Decodes records until one produces an event, the stream ends, or a
    /// record fails to decode. After a failure the reader stays usable for
    /// queries over everything decoded so far, but yields no more events.
    pub fn next_record(&mut self) -> Result<Option<ReaderEvent>, ReadError> {
        if self.failed {
            return Ok(None);
        }
        match self.next_record_inner() {
            Ok(event) => Ok(event),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    fn next_record_inner(&mut self) -> Result<Option<ReaderEvent>, ReadError> {
        loop {
            let mut token_byte = [0u8; 1];
            match self.source.read_exact(&mut token_byte) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            if token_byte[0] == 0 {
                // Zero-padded tail of a capture that was never finalized.
                return Ok(None);
            }
            let Some(token) = RecordToken::unpack(token_byte[0]) else {
                return Err(ReadError::UnknownRecordType(token_byte[0]));
            };
            match token.record_type {
                RecordType::Uninitialized => {
                    return Err(ReadError::UnknownRecordType(token_byte[0]))
                }
                RecordType::Other => {
                    if token.flags == TRAILER_FLAG {
                        return Ok(None);
                    }
                    return Err(ReadError::UnknownRecordType(token_byte[0]));
                }
                RecordType::ContextSwitch => {
                    let mut input = SourceRead(&mut *self.source);
                    read_delta(&mut input, &mut self.last.thread_id)?;
                }
                RecordType::FrameIndex => self.parse_frame_index(token.flags)?,
                RecordType::FramePush => self.parse_frame_push()?,
                RecordType::FramePop => self.parse_frame_pop(token.flags),
                RecordType::NativeTraceIndex => self.parse_native_frame_index()?,
                RecordType::MemoryMapStart => self.resolver.clear_segments(),
                RecordType::SegmentHeader => self.parse_segment_header()?,
                RecordType::ThreadRecord => self.parse_thread_record()?,
                RecordType::MemoryRecord => {
                    let record = self.parse_memory_record()?;
                    return Ok(Some(ReaderEvent::MemoryRecord(record)));
                }
                RecordType::Allocation => {
                    let record = self.parse_allocation(token.flags, false)?;
                    return Ok(Some(ReaderEvent::Allocation(record)));
                }
                RecordType::AllocationWithNative => {
                    let record = self.parse_allocation(token.flags, true)?;
                    return Ok(Some(ReaderEvent::Allocation(record)));
                }
                RecordType::Segment => return Err(ReadError::MissingSegment),
            }
        }
    }

    fn parse_frame_index(&mut self, flags: u8) -> Result<(), ReadError> {
        let mut input = SourceRead(&mut *self.source);
        let frame_id = read_delta(&mut input, &mut self.last.python_frame_id)?;
        let function_name = self.source.read_cstring()?;
        let filename = self.source.read_cstring()?;
        let mut input = SourceRead(&mut *self.source);
        let lineno = read_delta(&mut input, &mut self.last.python_line_number)? as i64 as i32;
        let frame = Frame {
            function_name,
            filename,
            lineno,
            is_entry_frame: flags == 0,
        };
        if self.frame_map.insert(frame_id, frame).is_some() {
            return Err(ReadError::DuplicateFrameId(frame_id));
        }
        Ok(())
    }

    fn parse_frame_push(&mut self) -> Result<(), ReadError> {
        let mut input = SourceRead(&mut *self.source);
        let frame_id = read_delta(&mut input, &mut self.last.python_frame_id)?;
        let tid = self.last.thread_id;
        self.stack_traces.entry(tid).or_default().push(frame_id);
        Ok(())
    }

    fn parse_frame_pop(&mut self, flags: u8) {
        let mut count = u32::from(flags) + 1;
        if let Some(stack) = self.stack_traces.get_mut(&self.last.thread_id) {
            while count > 0 && stack.pop().is_some() {
                count -= 1;
            }
        }
    }

    fn parse_native_frame_index(&mut self) -> Result<(), ReadError> {
        let mut input = SourceRead(&mut *self.source);
        let ip = read_delta(&mut input, &mut self.last.instruction_pointer)?;
        let parent_index = read_delta(&mut input, &mut self.last.native_frame_id)? as TreeIndex;
        self.native_frames.push(UnresolvedNativeFrame {
            ip,
            parent_index,
        });
        Ok(())
    }

    fn parse_segment_header(&mut self) -> Result<(), ReadError> {
        let filename = self.source.read_cstring()?;
        let mut input = SourceRead(&mut *self.source);
        let num_segments = read_varint(&mut input)?;
        let mut addr_bytes = [0u8; 8];
        self.source.read_exact(&mut addr_bytes)?;
        let addr = u64::from_le_bytes(addr_bytes);

        let mut segments = Vec::with_capacity(num_segments.min(1024) as usize);
        for _ in 0..num_segments {
            let mut token_byte = [0u8; 1];
            self.source.read_exact(&mut token_byte)?;
            match RecordToken::unpack(token_byte[0]) {
                Some(token) if token.record_type == RecordType::Segment => {}
                _ => return Err(ReadError::MissingSegment),
            }
            let mut vaddr_bytes = [0u8; 8];
            self.source.read_exact(&mut vaddr_bytes)?;
            let mut input = SourceRead(&mut *self.source);
            let memsz = read_varint(&mut input)?;
            segments.push(Segment {
                vaddr: u64::from_le_bytes(vaddr_bytes),
                memsz,
            });
        }
        self.resolver.add_segments(&ImageSegments {
            filename,
            addr,
            segments,
        });
        Ok(())
    }

    fn parse_thread_record(&mut self) -> Result<(), ReadError> {
        let name = self.source.read_cstring()?;
        self.thread_names.insert(self.last.thread_id, name);
        Ok(())
    }

    fn parse_memory_record(&mut self) -> Result<MemoryRecord, ReadError> {
        let mut input = SourceRead(&mut *self.source);
        let rss = read_delta(&mut input, &mut self.last.rss)?;
        let ms_since_epoch = read_delta(&mut input, &mut self.last.ms_since_epoch)?;
        let record = MemoryRecord { ms_since_epoch, rss };
        self.memory_records.push(record);
        Ok(record)
    }

    fn parse_allocation(&mut self, flags: u8, with_native: bool) -> Result<Allocation, ReadError> {
        let Some(allocator) = AllocatorType::from_u8(flags) else {
            return Err(ReadError::UnknownAllocator(flags));
        };
        let mut input = SourceRead(&mut *self.source);
        let address = read_delta(&mut input, &mut self.last.data_pointer)?;
        let size = if with_native || allocator.kind() != AllocatorKind::SimpleDeallocator {
            read_varint(&mut input)?
        } else {
            0
        };
        let native_frame_id = if with_native {
            read_delta(&mut input, &mut self.last.native_frame_id)?
        } else {
            0
        };

        let tid = self.last.thread_id;
        let frame_index = match self.stack_traces.get(&tid) {
            Some(stack) => self
                .tree
                .trace_index_with(stack.iter().copied(), &mut |_, _| true),
            None => 0,
        };

        let allocation = Allocation {
            tid,
            address,
            size,
            allocator,
            native_frame_id,
            frame_index,
            native_segment_generation: self.resolver.current_generation(),
            n_allocations: 1,
        };
        self.allocations.push(allocation.clone());
        Ok(allocation)
    }
}

fn read_header(source: &mut dyn Source) -> Result<HeaderRecord, ReadError> {
    let mut magic = [0u8; MAGIC.len()];
    source.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ReadError::BadMagic);
    }
    let mut version_bytes = [0u8; 4];
    source.read_exact(&mut version_bytes)?;
    let version = i32::from_le_bytes(version_bytes);
    if version != CURRENT_HEADER_VERSION {
        return Err(ReadError::UnsupportedVersion(version));
    }
    let mut flag = [0u8; 1];
    source.read_exact(&mut flag)?;
    let native_traces = flag[0] != 0;

    let mut input = SourceRead(source);
    let n_allocations = read_varint(&mut input)?;
    let n_frames = read_varint(&mut input)?;
    let mut millis = [0u8; 8];
    source.read_exact(&mut millis)?;
    let start_time = u64::from_le_bytes(millis);
    source.read_exact(&mut millis)?;
    let end_time = u64::from_le_bytes(millis);

    let command_line = source.read_cstring()?;
    let mut pid_bytes = [0u8; 4];
    source.read_exact(&mut pid_bytes)?;
    let pid = i32::from_le_bytes(pid_bytes);
    let mut tid_bytes = [0u8; 8];
    source.read_exact(&mut tid_bytes)?;
    let main_tid = u64::from_le_bytes(tid_bytes);
    source.read_exact(&mut tid_bytes)?;
    let skipped_frames_on_main_tid = u64::from_le_bytes(tid_bytes);
    source.read_exact(&mut flag)?;
    let Some(python_allocator) = PythonAllocatorType::from_u8(flag[0]) else {
        return Err(ReadError::UnknownPythonAllocator(flag[0]));
    };

    Ok(HeaderRecord {
        version,
        native_traces,
        stats: TrackerStats {
            n_allocations,
            n_frames,
            start_time,
            end_time,
        },
        command_line,
        pid,
        main_tid,
        skipped_frames_on_main_tid,
        python_allocator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{AllocationRecord, FramePop, FramePush, NativeAllocationRecord};
    use crate::sink::MemorySink;
    use crate::source::BufferSource;
    use crate::writer::{FrameIndexRecord, RecordWriter};
    use std::ffi::CString;

    fn writer_pair() -> (RecordWriter, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let (sink, data) = MemorySink::new();
        let writer = RecordWriter::new(
            Box::new(sink),
            "python app.py".to_owned(),
            false,
            PythonAllocatorType::Pymalloc,
        );
        (writer, data)
    }

    fn reader_over(data: &std::sync::Arc<std::sync::Mutex<Vec<u8>>>) -> RecordReader {
        let bytes = data.lock().unwrap().clone();
        RecordReader::new(Box::new(BufferSource::new(bytes))).unwrap()
    }

    fn push_frame(
        writer: &mut RecordWriter,
        tid: u64,
        frame_id: u64,
        name: &str,
        file: &str,
        lineno: i32,
    ) {
        let name = CString::new(name).unwrap();
        let file = CString::new(file).unwrap();
        writer
            .write_frame_index(&FrameIndexRecord {
                frame_id,
                function_name: &name,
                filename: &file,
                lineno,
                is_entry_frame: true,
            })
            .unwrap();
        writer.write_frame_push(tid, FramePush { frame_id }).unwrap();
    }

    #[test]
    fn test_header_round_trip() {
        let (mut writer, data) = writer_pair();
        writer.set_main_tid_and_skipped_frames(42, 3);
        writer.write_header(false).unwrap();
        let reader = reader_over(&data);
        let header = reader.header();
        assert_eq!(header.version, CURRENT_HEADER_VERSION);
        assert_eq!(header.command_line, "python app.py");
        assert_eq!(header.main_tid, 42);
        assert_eq!(header.skipped_frames_on_main_tid, 3);
        assert_eq!(header.python_allocator, PythonAllocatorType::Pymalloc);
        assert!(!header.native_traces);
    }

    #[test]
    fn test_allocation_round_trip_with_stack() {
        let (mut writer, data) = writer_pair();
        writer.write_header(false).unwrap();
        push_frame(&mut writer, 1, 1, "main", "app.py", 1);
        push_frame(&mut writer, 1, 2, "helper", "app.py", 10);
        writer
            .write_allocation(
                1,
                &AllocationRecord {
                    address: 0xdeadbeef,
                    size: 1024,
                    allocator: AllocatorType::Malloc,
                },
            )
            .unwrap();
        writer
            .write_allocation(
                1,
                &AllocationRecord {
                    address: 0xdeadbeef,
                    size: 0,
                    allocator: AllocatorType::Free,
                },
            )
            .unwrap();
        writer.write_trailer().unwrap();

        let mut reader = reader_over(&data);
        let first = match reader.next_record().unwrap().unwrap() {
            ReaderEvent::Allocation(a) => a,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(first.tid, 1);
        assert_eq!(first.address, 0xdeadbeef);
        assert_eq!(first.size, 1024);
        assert_eq!(first.allocator, AllocatorType::Malloc);

        let stack = reader.stack_for(first.frame_index);
        let functions: Vec<&str> = stack.iter().map(|f| f.function_name.as_str()).collect();
        assert_eq!(functions, vec!["helper", "main"]);

        let second = match reader.next_record().unwrap().unwrap() {
            ReaderEvent::Allocation(a) => a,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(second.allocator, AllocatorType::Free);
        assert_eq!(second.address, 0xdeadbeef);

        assert!(reader.next_record().unwrap().is_none());
        assert_eq!(reader.allocations().len(), 2);
    }

    #[test]
    fn test_twenty_pops_leave_stack_empty() {
        let (mut writer, data) = writer_pair();
        writer.write_header(false).unwrap();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            push_frame(&mut writer, 1, i as u64 + 1, name, "app.py", 1);
        }
        writer.write_frame_pop(1, FramePop { count: 20 }).unwrap();
        writer
            .write_allocation(
                1,
                &AllocationRecord {
                    address: 0x1000,
                    size: 1,
                    allocator: AllocatorType::Malloc,
                },
            )
            .unwrap();

        let mut reader = reader_over(&data);
        let allocation = match reader.next_record().unwrap().unwrap() {
            ReaderEvent::Allocation(a) => a,
            other => panic!("unexpected event {other:?}"),
        };
        // The stack was fully popped, so the allocation hangs off the root.
        assert_eq!(allocation.frame_index, 0);
        assert!(reader.stack_traces.get(&1).map_or(true, |s| s.is_empty()));
    }

    #[test]
    fn test_distinct_lines_make_distinct_leaves() {
        let (mut writer, data) = writer_pair();
        writer.write_header(false).unwrap();
        push_frame(&mut writer, 1, 1, "main", "app.py", 1);
        let mut leaves = Vec::new();
        for (frame_id, lineno) in [(3u64, 7), (5, 8), (7, 9)] {
            // The shadow stack emits a pop/push pair with a re-registered
            // frame whenever the top frame's line changes.
            writer.write_frame_pop(1, FramePop { count: 1 }).unwrap();
            push_frame(&mut writer, 1, frame_id, "alloc_site", "app.py", lineno);
            writer
                .write_allocation(
                    1,
                    &AllocationRecord {
                        address: 0x1000 + frame_id,
                        size: 10,
                        allocator: AllocatorType::Malloc,
                    },
                )
                .unwrap();
            leaves.push(frame_id);
        }
        let mut reader = reader_over(&data);
        reader.read_to_end().unwrap();
        let indices: Vec<_> = reader
            .allocations()
            .iter()
            .map(|a| a.frame_index)
            .collect();
        assert_eq!(indices.len(), 3);
        assert!(indices.iter().all(|&i| i != 0));
        assert_eq!(
            indices.iter().collect::<std::collections::HashSet<_>>().len(),
            3
        );
        let lines: Vec<i32> = indices
            .iter()
            .map(|&i| reader.stack_for(i)[0].lineno)
            .collect();
        assert_eq!(lines, vec![7, 8, 9]);
    }

    #[test]
    fn test_memory_records_round_trip() {
        let (mut writer, data) = writer_pair();
        writer.write_header(false).unwrap();
        for (ms, rss) in [(1000, 4096), (1100, 8192), (1200, 4096)] {
            writer
                .write_memory_record(&MemoryRecord {
                    ms_since_epoch: ms,
                    rss,
                })
                .unwrap();
        }
        let mut reader = reader_over(&data);
        reader.read_to_end().unwrap();
        assert_eq!(reader.memory_records().len(), 3);
        assert_eq!(reader.memory_records()[1].rss, 8192);
        assert_eq!(reader.memory_records()[2].ms_since_epoch, 1200);
    }

    #[test]
    fn test_thread_names_round_trip() {
        let (mut writer, data) = writer_pair();
        writer.write_header(false).unwrap();
        let name = CString::new("worker-1").unwrap();
        writer.write_thread_record(5, &name).unwrap();
        let mut reader = reader_over(&data);
        reader.read_to_end().unwrap();
        assert_eq!(reader.thread_name(5), Some("worker-1"));
        assert_eq!(reader.thread_name(6), None);
    }

    #[test]
    fn test_native_allocation_round_trip() {
        let (mut writer, data) = writer_pair();
        writer.write_header(false).unwrap();
        writer
            .write_mappings(&[ImageSegments {
                filename: "/usr/lib/libc.so".to_owned(),
                addr: 0x7f00_0000_0000,
                segments: vec![Segment {
                    vaddr: 0,
                    memsz: 0x10_0000,
                }],
            }])
            .unwrap();
        // f -> g -> h, emitted outermost first as the trie interns them.
        for (ip, parent) in [(0x7f00_0000_1000u64, 0u32), (0x7f00_0000_2000, 1), (0x7f00_0000_3000, 2)] {
            writer
                .write_unresolved_native_frame(&UnresolvedNativeFrame {
                    ip,
                    parent_index: parent,
                })
                .unwrap();
        }
        writer
            .write_native_allocation(
                1,
                &NativeAllocationRecord {
                    address: 0x1234,
                    size: 64,
                    allocator: AllocatorType::Malloc,
                    native_frame_id: 3,
                },
            )
            .unwrap();

        let mut reader = reader_over(&data);
        let allocation = match reader.next_record().unwrap().unwrap() {
            ReaderEvent::Allocation(a) => a,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(allocation.native_frame_id, 3);
        assert_eq!(allocation.native_segment_generation, 0);
        // With the null symbolizer every mapped frame resolves to <unknown>,
        // but the walk order is still deepest (h) first.
        let stack = reader.native_stack_for(3, 0);
        assert_eq!(stack.len(), 3);
    }

    #[test]
    fn test_truncated_stream_stops_cleanly() {
        let (mut writer, data) = writer_pair();
        writer.write_header(false).unwrap();
        push_frame(&mut writer, 1, 1, "main", "app.py", 1);
        writer
            .write_allocation(
                1,
                &AllocationRecord {
                    address: 0x1000,
                    size: 1,
                    allocator: AllocatorType::Malloc,
                },
            )
            .unwrap();
        let mut bytes = data.lock().unwrap().clone();
        // Drop the last byte of the allocation record.
        bytes.pop();
        let mut reader = RecordReader::new(Box::new(BufferSource::new(bytes))).unwrap();
        // The truncated allocation is lost but decoding fails cleanly.
        assert!(matches!(reader.next_record(), Err(ReadError::Io(_))));
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_zero_padding_reads_as_eof() {
        let (mut writer, data) = writer_pair();
        writer.write_header(false).unwrap();
        writer.write_trailer().unwrap();
        let mut bytes = data.lock().unwrap().clone();
        bytes.extend_from_slice(&[0u8; 128]);
        let mut reader = RecordReader::new(Box::new(BufferSource::new(bytes))).unwrap();
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let result = RecordReader::new(Box::new(BufferSource::new(b"notmagic".to_vec())));
        assert!(matches!(result, Err(ReadError::BadMagic)));
    }
}
