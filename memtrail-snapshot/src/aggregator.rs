// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reduction of allocation event streams.
//!
//! [`SnapshotAllocationAggregator`] folds events into the set of live
//! allocations at the current point of the stream. The streaming
//! [`StreamingAllocationAggregator`] additionally tracks the global
//! high-water mark in a single pass: while the live set *is* the peak it
//! applies events directly, and once something from the peak is freed it
//! accumulates a delta (allocations made since the peak, peak memory freed
//! since the peak) that is folded back in whenever live bytes reach the peak
//! again.

use std::collections::{HashMap, HashSet};

use memtrail_records::records::{Allocation, AllocatorKind, TreeIndex};
use memtrail_records::ThreadId;

use crate::interval_tree::IntervalTree;

/// Thread id used for every key when threads are merged in a reduction.
pub const NO_THREAD_INFO: ThreadId = 0;

/// Reduction key: one entry per distinct (stack, thread) pair.
pub type SnapshotKey = (TreeIndex, ThreadId);

pub type ReducedSnapshot = HashMap<SnapshotKey, Allocation>;

/// Folds a live set into per-(stack, thread) aggregates. Sizes and counts
/// are summed; ranged allocations contribute the range sizes that actually
/// remain after partial deallocations.
fn reduce_snapshot(
    merge_threads: bool,
    ranges: &IntervalTree<Allocation>,
    allocations_by_ptr: &HashMap<u64, Allocation>,
) -> ReducedSnapshot {
    let mut stack_to_allocation = ReducedSnapshot::new();

    for record in allocations_by_ptr.values() {
        let tid = if merge_threads { NO_THREAD_INFO } else { record.tid };
        stack_to_allocation
            .entry((record.frame_index, tid))
            .and_modify(|existing| {
                existing.size += record.size;
                existing.n_allocations += 1;
            })
            .or_insert_with(|| record.clone());
    }

    for (range, allocation) in ranges.iter() {
        let tid = if merge_threads {
            NO_THREAD_INFO
        } else {
            allocation.tid
        };
        stack_to_allocation
            .entry((allocation.frame_index, tid))
            .and_modify(|existing| {
                existing.size += range.size();
                existing.n_allocations += 1;
            })
            .or_insert_with(|| {
                let mut new_alloc = allocation.clone();
                new_alloc.size = range.size();
                new_alloc
            });
    }

    stack_to_allocation
}

/// Live-set reducer: feed it every event, ask for the snapshot at any point.
#[derive(Default)]
pub struct SnapshotAllocationAggregator {
    interval_tree: IntervalTree<Allocation>,
    ptr_to_allocation: HashMap<u64, Allocation>,
}

impl SnapshotAllocationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_allocation(&mut self, allocation: &Allocation) {
        match allocation.allocator.kind() {
            AllocatorKind::SimpleAllocator => {
                self.ptr_to_allocation
                    .insert(allocation.address, allocation.clone());
            }
            AllocatorKind::SimpleDeallocator => {
                self.ptr_to_allocation.remove(&allocation.address);
            }
            AllocatorKind::RangedAllocator => {
                self.interval_tree
                    .add(allocation.address, allocation.size, allocation.clone());
            }
            AllocatorKind::RangedDeallocator => {
                self.interval_tree.remove(allocation.address, allocation.size);
            }
        }
    }

    pub fn snapshot_allocations(&self, merge_threads: bool) -> ReducedSnapshot {
        reduce_snapshot(merge_threads, &self.interval_tree, &self.ptr_to_allocation)
    }

    /// Bytes currently live.
    pub fn live_bytes(&self) -> u64 {
        self.ptr_to_allocation.values().map(|a| a.size).sum::<u64>()
            + self.interval_tree.total_size()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HighWaterMark {
    /// Position in the event stream at which the peak was reached.
    pub index: u64,
    pub peak_memory: u64,
}

/// Single-pass high-water-mark tracker. See the module docs for the
/// at-peak / in-delta state machine.
#[derive(Default)]
pub struct StreamingAllocationAggregator {
    allocations_seen: u64,
    high_water_mark_index: u64,
    high_water_mark_memory: u64,
    high_water_mark_ptrs: HashMap<u64, Allocation>,
    high_water_mark_ranges: IntervalTree<Allocation>,
    delta_allocated_size: u64,
    delta_freed_size: u64,
    delta_allocated_ptrs: HashMap<u64, Allocation>,
    delta_allocated_ranges: IntervalTree<Allocation>,
    delta_freed_ptrs: HashSet<u64>,
    delta_freed_ranges: IntervalTree<()>,
}

impl StreamingAllocationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn at_high_water_mark(&self) -> bool {
        if self.delta_freed_size == 0 && self.delta_allocated_size == 0 {
            debug_assert!(self.delta_freed_ranges.is_empty());
            debug_assert!(self.delta_allocated_ranges.is_empty());
            debug_assert!(self.delta_freed_ptrs.is_empty());
            debug_assert!(self.delta_allocated_ptrs.is_empty());
            return true;
        }
        false
    }

    fn apply_delta_to_snapshot(
        delta_freed_ptrs: &HashSet<u64>,
        delta_freed_ranges: &IntervalTree<()>,
        delta_allocated_ptrs: &HashMap<u64, Allocation>,
        delta_allocated_ranges: &IntervalTree<Allocation>,
        ranges: &mut IntervalTree<Allocation>,
        ptrs: &mut HashMap<u64, Allocation>,
    ) {
        for address in delta_freed_ptrs {
            ptrs.remove(address);
        }
        for (interval, ()) in delta_freed_ranges.iter() {
            ranges.remove(interval.start, interval.size());
        }
        for allocation in delta_allocated_ptrs.values() {
            ptrs.insert(allocation.address, allocation.clone());
        }
        for (_, allocation) in delta_allocated_ranges.iter() {
            ranges.add(allocation.address, allocation.size, allocation.clone());
        }
    }

    fn reset_delta(&mut self) {
        self.delta_allocated_size = 0;
        self.delta_freed_size = 0;
        self.delta_freed_ranges.clear();
        self.delta_freed_ptrs.clear();
        self.delta_allocated_ranges.clear();
        self.delta_allocated_ptrs.clear();
    }

    fn add_allocation_while_at_high_water_mark(&mut self, allocation: &Allocation, index: u64) {
        match allocation.allocator.kind() {
            AllocatorKind::SimpleAllocator => {
                self.high_water_mark_ptrs
                    .insert(allocation.address, allocation.clone());
                self.high_water_mark_index = index;
                self.high_water_mark_memory += allocation.size;
            }
            AllocatorKind::RangedAllocator => {
                self.high_water_mark_ranges.add(
                    allocation.address,
                    allocation.size,
                    allocation.clone(),
                );
                self.high_water_mark_index = index;
                self.high_water_mark_memory += allocation.size;
            }
            AllocatorKind::SimpleDeallocator => {
                // Freeing something that is part of the peak starts a delta.
                let peak_size = match self.high_water_mark_ptrs.get(&allocation.address) {
                    Some(peak_allocation) => peak_allocation.size,
                    None => return,
                };
                if peak_size != 0 {
                    self.delta_freed_ptrs.insert(allocation.address);
                    self.delta_freed_size += peak_size;
                    debug_assert!(!self.at_high_water_mark());
                } else {
                    // Freeing a 0-byte allocation keeps us at the peak.
                    self.high_water_mark_ptrs.remove(&allocation.address);
                    self.high_water_mark_index = index;
                }
            }
            AllocatorKind::RangedDeallocator => {
                let overlap = self
                    .high_water_mark_ranges
                    .find_intersection(allocation.address, allocation.size);
                for interval in overlap {
                    self.delta_freed_ranges.add(interval.start, interval.size(), ());
                    self.delta_freed_size += interval.size();
                }
            }
        }
    }

    fn add_allocation_while_not_at_high_water_mark(
        &mut self,
        allocation: &Allocation,
        index: u64,
    ) {
        match allocation.allocator.kind() {
            AllocatorKind::SimpleAllocator => {
                self.delta_allocated_ptrs
                    .insert(allocation.address, allocation.clone());
                self.delta_allocated_size += allocation.size;
            }
            AllocatorKind::RangedAllocator => {
                self.delta_allocated_ranges.add(
                    allocation.address,
                    allocation.size,
                    allocation.clone(),
                );
                self.delta_allocated_size += allocation.size;
            }
            AllocatorKind::SimpleDeallocator => {
                if let Some(freed) = self.delta_allocated_ptrs.remove(&allocation.address) {
                    // This ptr was allocated after forking the delta.
                    debug_assert!(self.delta_allocated_size >= freed.size);
                    self.delta_allocated_size -= freed.size;
                } else if self.delta_freed_ptrs.contains(&allocation.address) {
                    // Our delta already holds a free for this address. This
                    // can happen if, after being freed, it was reallocated by
                    // a call that we didn't track, then freed by a call that
                    // we did. In particular, the allocation for a thread's
                    // shadow stack happens while the recursion guard is set,
                    // but the deallocation happens as the thread is dying,
                    // after the recursion guard is unset.
                } else if let Some(peak_allocation) =
                    self.high_water_mark_ptrs.get(&allocation.address)
                {
                    // This ptr was part of the high water mark.
                    self.delta_freed_ptrs.insert(allocation.address);
                    self.delta_freed_size += peak_allocation.size;
                } else {
                    // A free of something allocated before tracking started.
                }
            }
            AllocatorKind::RangedDeallocator => {
                // Portions of the range allocated since forking the delta.
                let allocated_since_delta_began = self
                    .delta_allocated_ranges
                    .find_intersection(allocation.address, allocation.size);
                for interval in &allocated_since_delta_began {
                    self.delta_allocated_ranges
                        .remove(interval.start, interval.size());
                    debug_assert!(self.delta_allocated_size >= interval.size());
                    self.delta_allocated_size -= interval.size();
                }

                // Portions of the range included in the high water mark.
                let mut allocated_before_delta_began: IntervalTree<()> = IntervalTree::new();
                allocated_before_delta_began.add(allocation.address, allocation.size, ());
                for interval in &allocated_since_delta_began {
                    allocated_before_delta_began.remove(interval.start, interval.size());
                }

                let freed_bytes_before = self.delta_freed_ranges.total_size();
                let old_intervals: Vec<_> = allocated_before_delta_began
                    .iter()
                    .map(|(interval, ())| *interval)
                    .collect();
                for old_interval in old_intervals {
                    let included_in_high_water_mark = self
                        .high_water_mark_ranges
                        .find_intersection(old_interval.start, old_interval.size());
                    for interval in included_in_high_water_mark {
                        self.delta_freed_ranges.remove(interval.start, interval.size());
                        self.delta_freed_ranges.add(interval.start, interval.size(), ());
                    }
                }
                let freed_bytes_after = self.delta_freed_ranges.total_size();
                self.delta_freed_size += freed_bytes_after - freed_bytes_before;
            }
        }

        if self.delta_allocated_size >= self.delta_freed_size {
            // New high water mark: fold the delta into the snapshot.
            self.high_water_mark_index = index;
            self.high_water_mark_memory += self.delta_allocated_size - self.delta_freed_size;
            Self::apply_delta_to_snapshot(
                &self.delta_freed_ptrs,
                &self.delta_freed_ranges,
                &self.delta_allocated_ptrs,
                &self.delta_allocated_ranges,
                &mut self.high_water_mark_ranges,
                &mut self.high_water_mark_ptrs,
            );
            self.reset_delta();
            debug_assert!(self.at_high_water_mark());
        }
    }

    pub fn add_allocation(&mut self, allocation: &Allocation) {
        let index = self.allocations_seen;
        self.allocations_seen += 1;
        if self.at_high_water_mark() {
            self.add_allocation_while_at_high_water_mark(allocation, index);
        } else {
            self.add_allocation_while_not_at_high_water_mark(allocation, index);
        }
    }

    pub fn high_water_mark(&self) -> HighWaterMark {
        HighWaterMark {
            index: self.high_water_mark_index,
            peak_memory: self.high_water_mark_memory,
        }
    }

    /// The live set as it was at the peak.
    pub fn high_water_mark_allocations(&self, merge_threads: bool) -> ReducedSnapshot {
        reduce_snapshot(
            merge_threads,
            &self.high_water_mark_ranges,
            &self.high_water_mark_ptrs,
        )
    }

    /// The live set at the end of the stream: everything that leaked.
    pub fn leaked_allocations(&self, merge_threads: bool) -> ReducedSnapshot {
        let mut ranges = self.high_water_mark_ranges.clone();
        let mut ptrs = self.high_water_mark_ptrs.clone();
        Self::apply_delta_to_snapshot(
            &self.delta_freed_ptrs,
            &self.delta_freed_ranges,
            &self.delta_allocated_ptrs,
            &self.delta_allocated_ranges,
            &mut ranges,
            &mut ptrs,
        );
        reduce_snapshot(merge_threads, &ranges, &ptrs)
    }
}

/// Two-pass reference: scans the whole slice tracking live bytes and returns
/// the position and size of the peak. Use
/// [`snapshot_at`] afterwards to materialize the live set there.
pub fn high_water_mark_index(records: &[Allocation]) -> HighWaterMark {
    log::debug!("computing high water mark over {} records", records.len());
    let mut current_memory: u64 = 0;
    let mut result = HighWaterMark::default();
    let mut ptr_to_size: HashMap<u64, u64> = HashMap::new();
    let mut ranges: IntervalTree<()> = IntervalTree::new();

    for (index, record) in records.iter().enumerate() {
        match record.allocator.kind() {
            AllocatorKind::SimpleAllocator => {
                current_memory += record.size;
                ptr_to_size.insert(record.address, record.size);
                if current_memory >= result.peak_memory {
                    result.peak_memory = current_memory;
                    result.index = index as u64;
                }
            }
            AllocatorKind::RangedAllocator => {
                current_memory += record.size;
                ranges.add(record.address, record.size, ());
                if current_memory >= result.peak_memory {
                    result.peak_memory = current_memory;
                    result.index = index as u64;
                }
            }
            AllocatorKind::SimpleDeallocator => {
                if let Some(size) = ptr_to_size.remove(&record.address) {
                    if size == 0 && current_memory >= result.peak_memory {
                        // Freeing a 0-byte allocation while at the peak moves
                        // the peak index, mirroring the streaming aggregator.
                        result.index = index as u64;
                    }
                    current_memory -= size;
                }
            }
            AllocatorKind::RangedDeallocator => {
                if let Some(pieces) = ranges.remove(record.address, record.size) {
                    current_memory -= pieces.iter().map(|(r, ())| r.size()).sum::<u64>();
                }
            }
        }
    }
    result
}

/// The aggregated live set after replaying `records[..=index]`.
pub fn snapshot_at(records: &[Allocation], index: u64, merge_threads: bool) -> ReducedSnapshot {
    let mut aggregator = SnapshotAllocationAggregator::new();
    for record in records.iter().take(index as usize + 1) {
        aggregator.add_allocation(record);
    }
    aggregator.snapshot_allocations(merge_threads)
}
