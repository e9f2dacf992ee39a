// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolution of raw instruction pointers to native source locations.
//!
//! The reader feeds this module the memory-map snapshots found in the record
//! stream. Each `MEMORY_MAP_START` begins a new generation, so an
//! instruction pointer recorded before a `dlclose`/`dlopen` pair resolves
//! against the module layout that was live when it was captured.

use std::collections::HashMap;

use crate::records::{ImageSegments, Segment};

pub const UNKNOWN_SYMBOL: &str = "<unknown>";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedFrame {
    pub function_name: String,
    pub filename: String,
    pub lineno: i32,
}

impl ResolvedFrame {
    fn unknown() -> Self {
        Self {
            function_name: UNKNOWN_SYMBOL.to_owned(),
            filename: UNKNOWN_SYMBOL.to_owned(),
            lineno: 0,
        }
    }
}

/// External symbolication collaborator. Implementations may return several
/// frames for one address when inlining is involved, deepest first.
pub trait Symbolizer {
    fn symbolize(&self, ip: u64) -> Option<Vec<ResolvedFrame>>;
}

/// Resolves nothing; every lookup falls back to `<unknown>`.
#[derive(Default)]
pub struct NullSymbolizer;

impl Symbolizer for NullSymbolizer {
    fn symbolize(&self, _ip: u64) -> Option<Vec<ResolvedFrame>> {
        None
    }
}

/// Symbolizes addresses of the *current* process. Valid whenever the capture
/// being read was produced in this same address space, which is the case for
/// in-process analysis and for the test suite.
#[derive(Default)]
pub struct BacktraceSymbolizer;

impl Symbolizer for BacktraceSymbolizer {
    fn symbolize(&self, ip: u64) -> Option<Vec<ResolvedFrame>> {
        let mut frames = Vec::new();
        backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
            frames.push(ResolvedFrame {
                function_name: symbol
                    .name()
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| UNKNOWN_SYMBOL.to_owned()),
                filename: symbol
                    .filename()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| UNKNOWN_SYMBOL.to_owned()),
                lineno: symbol.lineno().map(|line| line as i32).unwrap_or(0),
            });
        });
        (!frames.is_empty()).then_some(frames)
    }
}

#[derive(Clone, Debug)]
struct MappedRange {
    start: u64,
    end: u64,
    filename: String,
}

/// Generation-aware segment index with a per-`(ip, generation)` cache.
pub struct SymbolResolver {
    symbolizer: Box<dyn Symbolizer>,
    generations: Vec<Vec<MappedRange>>,
    cache: HashMap<(u64, u64), Vec<ResolvedFrame>>,
}

impl SymbolResolver {
    pub fn new(symbolizer: Box<dyn Symbolizer>) -> Self {
        Self {
            symbolizer,
            generations: vec![Vec::new()],
            cache: HashMap::new(),
        }
    }

    /// Index of the generation new segments are being registered into.
    pub fn current_generation(&self) -> u64 {
        (self.generations.len() - 1) as u64
    }

    /// Starts a fresh generation; prior generations stay resolvable.
    pub fn clear_segments(&mut self) {
        self.generations.push(Vec::new());
    }

    pub fn add_segments(&mut self, image: &ImageSegments) {
        let Some(current) = self.generations.last_mut() else {
            return;
        };
        for Segment { vaddr, memsz } in &image.segments {
            if *memsz == 0 {
                continue;
            }
            let start = image.addr + vaddr;
            current.push(MappedRange {
                start,
                end: start + memsz,
                filename: image.filename.clone(),
            });
        }
        current.sort_by_key(|range| range.start);
    }

    /// Path of the image `ip` fell inside, for the given generation.
    pub fn image_path(&self, ip: u64, generation: u64) -> Option<&str> {
        self.image_for(ip, generation)
            .map(|range| range.filename.as_str())
    }

    fn image_for(&self, ip: u64, generation: u64) -> Option<&MappedRange> {
        let ranges = self.generations.get(generation as usize)?;
        let position = ranges.partition_point(|range| range.start <= ip);
        let candidate = ranges.get(position.checked_sub(1)?)?;
        (ip < candidate.end).then_some(candidate)
    }

    /// Resolves `ip` against the module layout of `generation`. Unwinders
    /// report return addresses, so the lookup happens at `ip - 1` to land on
    /// the call instruction. Never fails: unresolvable addresses produce a
    /// single `<unknown>` frame.
    pub fn resolve(&mut self, ip: u64, generation: u64) -> &[ResolvedFrame] {
        if !self.cache.contains_key(&(ip, generation)) {
            let resolved = self.resolve_uncached(ip, generation);
            self.cache.insert((ip, generation), resolved);
        }
        self.cache
            .get(&(ip, generation))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn resolve_uncached(&self, ip: u64, generation: u64) -> Vec<ResolvedFrame> {
        if self.image_for(ip, generation).is_none() {
            return vec![ResolvedFrame::unknown()];
        }
        self.symbolizer
            .symbolize(ip.saturating_sub(1))
            .unwrap_or_else(|| vec![ResolvedFrame::unknown()])
    }
}
