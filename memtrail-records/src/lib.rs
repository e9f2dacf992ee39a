// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Capture-file model for memtrail: the typed records, their binary
//! encoding, the sinks and sources they travel through, and the writer and
//! reader that put it all together.

pub mod codec;
pub mod frame_tree;
pub mod reader;
pub mod records;
pub mod sink;
pub mod source;
pub mod symbols;
pub mod writer;

pub use reader::{ReadError, ReaderEvent, RecordReader};
pub use records::{
    Allocation, AllocatorKind, AllocatorType, Frame, FrameId, HeaderRecord, MemoryRecord,
    PythonAllocatorType, ThreadId, TreeIndex,
};
pub use writer::RecordWriter;
