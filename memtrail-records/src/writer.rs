// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serializes typed records into a sink, delta-encoding the slowly-changing
//! fields and tagging thread-specific records with context switches.
//!
//! Every method reports failure through `io::Result`; the caller is expected
//! to stop tracking on the first error rather than propagate it into the
//! program being profiled.

use std::ffi::CStr;
use std::io::{self, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::{
    write_delta, write_varint, write_varint_padded, DeltaEncodedFields, MAX_VARINT_LEN,
};
use crate::records::{
    AllocationRecord, AllocatorKind, FrameId, FramePop, FramePush, HeaderRecord, ImageSegments,
    MemoryRecord, NativeAllocationRecord, PythonAllocatorType, RecordToken, RecordType, ThreadId,
    TrackerStats, UnresolvedNativeFrame, CURRENT_HEADER_VERSION, MAGIC, TRAILER_FLAG,
};
use crate::sink::Sink;

/// Frame metadata as registered on the hot path: borrowed, NUL-terminated
/// strings so no allocation happens while the recursion guard is held.
#[derive(Clone, Copy, Debug)]
pub struct FrameIndexRecord<'a> {
    pub frame_id: FrameId,
    pub function_name: &'a CStr,
    pub filename: &'a CStr,
    pub lineno: i32,
    pub is_entry_frame: bool,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct RecordWriter {
    sink: Box<dyn Sink>,
    command_line: String,
    native_traces: bool,
    python_allocator: PythonAllocatorType,
    pid: i32,
    main_tid: ThreadId,
    skipped_frames_on_main_tid: u64,
    stats: TrackerStats,
    last: DeltaEncodedFields,
}

struct SinkWrite<'a>(&'a mut dyn Sink);

impl Write for SinkWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl RecordWriter {
    pub fn new(
        sink: Box<dyn Sink>,
        command_line: String,
        native_traces: bool,
        python_allocator: PythonAllocatorType,
    ) -> Self {
        Self {
            sink,
            command_line,
            native_traces,
            python_allocator,
            pid: std::process::id() as i32,
            main_tid: 0,
            skipped_frames_on_main_tid: 0,
            stats: TrackerStats {
                n_allocations: 0,
                n_frames: 0,
                start_time: now_millis(),
                end_time: 0,
            },
            last: DeltaEncodedFields::default(),
        }
    }

    pub fn set_main_tid_and_skipped_frames(&mut self, main_tid: ThreadId, skipped: u64) {
        self.main_tid = main_tid;
        self.skipped_frames_on_main_tid = skipped;
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    fn write_token(&mut self, token: RecordToken) -> io::Result<()> {
        self.sink.write_all(&[token.pack()])
    }

    fn write_cstring(&mut self, value: &CStr) -> io::Result<()> {
        self.sink.write_all(value.to_bytes_with_nul())
    }

    /// Writes the fixed header. With `seek_to_start` the sink is rewound
    /// first so the placeholder stats written at startup can be replaced by
    /// the real ones; sinks that can't seek simply keep the placeholders.
    pub fn write_header(&mut self, seek_to_start: bool) -> io::Result<()> {
        if seek_to_start {
            match self.sink.seek(SeekFrom::Start(0)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Unsupported => return Ok(()),
                Err(e) => return Err(e),
            }
            self.stats.end_time = now_millis();
        }

        self.sink.write_all(MAGIC)?;
        self.sink.write_all(&CURRENT_HEADER_VERSION.to_le_bytes())?;
        self.sink.write_all(&[self.native_traces as u8])?;
        let mut out = SinkWrite(&mut *self.sink);
        // Stats are rewritten in place at teardown, so both counters use a
        // fixed-width encoding that cannot shift the bytes after them.
        write_varint_padded(&mut out, self.stats.n_allocations, MAX_VARINT_LEN)?;
        write_varint_padded(&mut out, self.stats.n_frames, MAX_VARINT_LEN)?;
        self.sink.write_all(&self.stats.start_time.to_le_bytes())?;
        self.sink.write_all(&self.stats.end_time.to_le_bytes())?;
        self.sink.write_all(self.command_line.as_bytes())?;
        self.sink.write_all(&[0u8])?;
        self.sink.write_all(&self.pid.to_le_bytes())?;
        self.sink.write_all(&self.main_tid.to_le_bytes())?;
        self.sink
            .write_all(&self.skipped_frames_on_main_tid.to_le_bytes())?;
        self.sink.write_all(&[self.python_allocator as u8])
    }

    /// The file source ignores trailing zero bytes, so this non-zero token
    /// marks the boundary between written data and fallocate padding.
    pub fn write_trailer(&mut self) -> io::Result<()> {
        self.write_token(RecordToken::new(RecordType::Other, TRAILER_FLAG))
    }

    pub fn write_memory_record(&mut self, record: &MemoryRecord) -> io::Result<()> {
        self.write_token(RecordToken::new(RecordType::MemoryRecord, 0))?;
        let mut out = SinkWrite(&mut *self.sink);
        write_delta(&mut out, &mut self.last.rss, record.rss)?;
        write_delta(&mut out, &mut self.last.ms_since_epoch, record.ms_since_epoch)?;
        self.sink.flush()
    }

    pub fn write_frame_index(&mut self, record: &FrameIndexRecord<'_>) -> io::Result<()> {
        self.stats.n_frames += 1;
        self.write_token(RecordToken::new(
            RecordType::FrameIndex,
            !record.is_entry_frame as u8,
        ))?;
        let mut out = SinkWrite(&mut *self.sink);
        write_delta(&mut out, &mut self.last.python_frame_id, record.frame_id)?;
        self.write_cstring(record.function_name)?;
        self.write_cstring(record.filename)?;
        let mut out = SinkWrite(&mut *self.sink);
        write_delta(
            &mut out,
            &mut self.last.python_line_number,
            record.lineno as i64 as u64,
        )
    }

    pub fn write_unresolved_native_frame(
        &mut self,
        record: &UnresolvedNativeFrame,
    ) -> io::Result<()> {
        self.write_token(RecordToken::new(RecordType::NativeTraceIndex, 0))?;
        let mut out = SinkWrite(&mut *self.sink);
        write_delta(&mut out, &mut self.last.instruction_pointer, record.ip)?;
        write_delta(
            &mut out,
            &mut self.last.native_frame_id,
            u64::from(record.parent_index),
        )
    }

    pub fn write_mappings(&mut self, mappings: &[ImageSegments]) -> io::Result<()> {
        self.write_token(RecordToken::new(RecordType::MemoryMapStart, 0))?;
        for image in mappings {
            self.write_token(RecordToken::new(RecordType::SegmentHeader, 0))?;
            self.sink.write_all(image.filename.as_bytes())?;
            self.sink.write_all(&[0u8])?;
            let mut out = SinkWrite(&mut *self.sink);
            write_varint(&mut out, image.segments.len() as u64)?;
            self.sink.write_all(&image.addr.to_le_bytes())?;
            for segment in &image.segments {
                self.write_token(RecordToken::new(RecordType::Segment, 0))?;
                self.sink.write_all(&segment.vaddr.to_le_bytes())?;
                let mut out = SinkWrite(&mut *self.sink);
                write_varint(&mut out, segment.memsz)?;
            }
        }
        Ok(())
    }

    fn maybe_write_context_switch(&mut self, tid: ThreadId) -> io::Result<()> {
        if self.last.thread_id == tid {
            return Ok(()); // nothing to do.
        }
        self.write_token(RecordToken::new(RecordType::ContextSwitch, 0))?;
        let mut out = SinkWrite(&mut *self.sink);
        write_delta(&mut out, &mut self.last.thread_id, tid)
    }

    pub fn write_frame_push(&mut self, tid: ThreadId, record: FramePush) -> io::Result<()> {
        self.maybe_write_context_switch(tid)?;
        self.write_token(RecordToken::new(RecordType::FramePush, 0))?;
        let mut out = SinkWrite(&mut *self.sink);
        write_delta(&mut out, &mut self.last.python_frame_id, record.frame_id)
    }

    pub fn write_frame_pop(&mut self, tid: ThreadId, record: FramePop) -> io::Result<()> {
        self.maybe_write_context_switch(tid)?;
        let mut count = record.count;
        while count > 0 {
            let to_pop = count.min(16);
            count -= to_pop;
            // 0 means pop 1 frame, 15 means pop 16 frames.
            self.write_token(RecordToken::new(RecordType::FramePop, (to_pop - 1) as u8))?;
        }
        Ok(())
    }

    pub fn write_allocation(&mut self, tid: ThreadId, record: &AllocationRecord) -> io::Result<()> {
        self.maybe_write_context_switch(tid)?;
        self.stats.n_allocations += 1;
        self.write_token(RecordToken::new(
            RecordType::Allocation,
            record.allocator as u8,
        ))?;
        let mut out = SinkWrite(&mut *self.sink);
        write_delta(&mut out, &mut self.last.data_pointer, record.address)?;
        if record.allocator.kind() != AllocatorKind::SimpleDeallocator {
            let mut out = SinkWrite(&mut *self.sink);
            write_varint(&mut out, record.size)?;
        }
        Ok(())
    }

    pub fn write_native_allocation(
        &mut self,
        tid: ThreadId,
        record: &NativeAllocationRecord,
    ) -> io::Result<()> {
        self.maybe_write_context_switch(tid)?;
        self.stats.n_allocations += 1;
        self.write_token(RecordToken::new(
            RecordType::AllocationWithNative,
            record.allocator as u8,
        ))?;
        let mut out = SinkWrite(&mut *self.sink);
        write_delta(&mut out, &mut self.last.data_pointer, record.address)?;
        write_varint(&mut out, record.size)?;
        write_delta(
            &mut out,
            &mut self.last.native_frame_id,
            record.native_frame_id,
        )
    }

    pub fn write_thread_record(&mut self, tid: ThreadId, name: &CStr) -> io::Result<()> {
        self.maybe_write_context_switch(tid)?;
        self.write_token(RecordToken::new(RecordType::ThreadRecord, 0))?;
        self.write_cstring(name)
    }

    /// Builds a writer for a forked child. Returns `None` when the sink
    /// refuses to be cloned, which disables follow-fork. The child's delta
    /// state and stats start from scratch: its stream must parse on its own.
    pub fn clone_in_child_process(&self) -> io::Result<Option<RecordWriter>> {
        let Some(sink) = self.sink.clone_in_child_process()? else {
            return Ok(None);
        };
        Ok(Some(RecordWriter::new(
            sink,
            self.command_line.clone(),
            self.native_traces,
            self.python_allocator,
        )))
    }

    pub fn header_record(&self) -> HeaderRecord {
        HeaderRecord {
            version: CURRENT_HEADER_VERSION,
            native_traces: self.native_traces,
            stats: self.stats,
            command_line: self.command_line.clone(),
            pid: self.pid,
            main_tid: self.main_tid,
            skipped_frames_on_main_tid: self.skipped_frames_on_main_tid,
            python_allocator: self.python_allocator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::AllocatorType;
    use crate::sink::MemorySink;
    use std::ffi::CString;

    fn test_writer() -> (RecordWriter, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let (sink, data) = MemorySink::new();
        let writer = RecordWriter::new(
            Box::new(sink),
            "python script.py".to_owned(),
            false,
            PythonAllocatorType::Pymalloc,
        );
        (writer, data)
    }

    #[test]
    fn test_frame_pop_packs_sixteen_per_token() {
        let (mut writer, data) = test_writer();
        writer.write_frame_pop(1, FramePop { count: 20 }).unwrap();
        let bytes = data.lock().unwrap().clone();
        // Context switch token + delta tid, then two pop tokens.
        let pops: Vec<u8> = bytes
            .iter()
            .copied()
            .filter_map(|b| {
                let token = RecordToken::unpack(b)?;
                (token.record_type == RecordType::FramePop).then_some(token.flags)
            })
            .collect();
        assert_eq!(pops, vec![15, 3]); // 16 frames, then 4.
    }

    #[test]
    fn test_context_switch_only_on_thread_change() {
        let (mut writer, data) = test_writer();
        writer.write_frame_push(7, FramePush { frame_id: 1 }).unwrap();
        writer.write_frame_push(7, FramePush { frame_id: 2 }).unwrap();
        writer.write_frame_push(8, FramePush { frame_id: 3 }).unwrap();
        let bytes = data.lock().unwrap().clone();
        let switches = bytes
            .iter()
            .filter_map(|&b| RecordToken::unpack(b))
            .filter(|t| t.record_type == RecordType::ContextSwitch)
            .count();
        // Token bytes can collide with payload bytes, so this is an upper
        // bound check on a stream small enough to have no collisions.
        assert_eq!(switches, 2);
    }

    #[test]
    fn test_deallocation_omits_size() {
        let (mut writer, data) = test_writer();
        writer
            .write_allocation(
                1,
                &AllocationRecord {
                    address: 0x1000,
                    size: 0,
                    allocator: AllocatorType::Free,
                },
            )
            .unwrap();
        let with_free = data.lock().unwrap().len();

        let (mut writer, data) = test_writer();
        writer
            .write_allocation(
                1,
                &AllocationRecord {
                    address: 0x1000,
                    size: 0,
                    allocator: AllocatorType::Malloc,
                },
            )
            .unwrap();
        let with_malloc = data.lock().unwrap().len();
        assert_eq!(with_malloc, with_free + 1);
    }

    #[test]
    fn test_header_is_fixed_size_across_stat_updates() {
        let (mut writer, data) = test_writer();
        writer.write_header(false).unwrap();
        let initial = data.lock().unwrap().len();

        let name = CString::new("f").unwrap();
        let file = CString::new("mod.py").unwrap();
        for i in 0..100 {
            writer
                .write_frame_index(&FrameIndexRecord {
                    frame_id: i,
                    function_name: &name,
                    filename: &file,
                    lineno: 1,
                    is_entry_frame: true,
                })
                .unwrap();
        }
        let before_rewrite = data.lock().unwrap().len();
        writer.write_header(true).unwrap();
        let after_rewrite = data.lock().unwrap().len();
        assert_eq!(before_rewrite, after_rewrite);
        let _ = initial;
    }

    #[test]
    fn test_trailer_is_non_zero() {
        let (mut writer, data) = test_writer();
        writer.write_trailer().unwrap();
        let bytes = data.lock().unwrap().clone();
        assert_eq!(bytes.len(), 1);
        assert_ne!(bytes[0], 0);
    }
}
