// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Aggregation engines over memtrail allocation streams: live-set
//! snapshots, single-pass high-water-mark tracking, and leak reports, with
//! an interval tree handling partially deallocated mmap regions.

pub mod aggregator;
pub mod interval_tree;

pub use aggregator::{
    high_water_mark_index, snapshot_at, HighWaterMark, ReducedSnapshot,
    SnapshotAllocationAggregator, StreamingAllocationAggregator, NO_THREAD_INFO,
};
pub use interval_tree::{Interval, IntervalTree};
