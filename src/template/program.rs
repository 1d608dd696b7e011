//! Compiled template program
//!
//! A flat segment array over the normalized text plus a sentinel-terminated
//! condition jump table. Built once per distinct template text and shared
//! read-only between any number of concurrent assemblies.

use crate::cache::BufferPool;
use crate::config::ESTIMATOR_WINDOW;
use crate::template::handler::SegmentHandler;
use crate::template::registry::NameRegistry;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Scratch buffer sizes are rounded up to this granularity
const SIZE_GRANULARITY: usize = 64;

/// Contiguous span of normalized text
#[derive(Clone)]
pub struct Segment {
    pub start: usize,
    pub length: usize,
    /// Trailing trim count (literal segments) or registry index (handler segments)
    pub excess_or_index: usize,
    /// Starts a clause or closes a scope; triggers the trim rewind after a skip
    pub is_section: bool,
    pub handler: Option<Arc<dyn SegmentHandler>>,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    /// Trim count, zero for handler segments
    pub fn excess(&self) -> usize {
        if self.handler.is_some() {
            0
        } else {
            self.excess_or_index
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("excess_or_index", &self.excess_or_index)
            .field("is_section", &self.is_section)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Gate over `length` segments starting at `segment_index`
///
/// `nb_condition_skip >= 1` on real gates: slots to advance when the gate is
/// false. The slot after an OR-group head holds `-members`. The sentinel has
/// `length == -1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condition {
    pub cond_index: usize,
    pub segment_index: usize,
    pub length: i32,
    pub nb_condition_skip: i32,
}

impl Condition {
    pub fn sentinel(segment_count: usize) -> Self {
        Self {
            cond_index: usize::MAX,
            segment_index: segment_count,
            length: -1,
            nb_condition_skip: 0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.length < 0
    }
}

/// Running average of produced lengths; frozen after `ESTIMATOR_WINDOW` samples
///
/// Updates are best effort: concurrent writers may lose a sample, which only
/// mis-sizes the next scratch buffer.
#[derive(Debug, Default)]
pub struct SizeEstimator {
    average: AtomicUsize,
    samples: AtomicU32,
}

impl SizeEstimator {
    pub fn new(initial: usize) -> Self {
        Self {
            average: AtomicUsize::new(initial),
            samples: AtomicU32::new(0),
        }
    }

    pub fn record(&self, produced: usize) {
        let n = self.samples.load(Ordering::Relaxed);
        if n >= ESTIMATOR_WINDOW {
            return;
        }
        let average = self.average.load(Ordering::Relaxed);
        let next = if n == 0 {
            produced
        } else {
            (average * n as usize + produced) / (n as usize + 1)
        };
        self.average.store(next, Ordering::Relaxed);
        self.samples.store(n + 1, Ordering::Relaxed);
    }

    /// Suggested buffer capacity
    pub fn estimate(&self) -> usize {
        let average = self.average.load(Ordering::Relaxed);
        (average + SIZE_GRANULARITY - 1) / SIZE_GRANULARITY * SIZE_GRANULARITY
    }

    pub fn samples(&self) -> u32 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn is_frozen(&self) -> bool {
        self.samples() >= ESTIMATOR_WINDOW
    }
}

/// Output of template compilation
#[derive(Debug)]
pub struct CompiledProgram {
    pub(crate) text: String,
    pub(crate) segments: Vec<Segment>,
    pub(crate) conditions: Vec<Condition>,
    pub(crate) registry: NameRegistry,
    pub(crate) estimator: SizeEstimator,
    pub(crate) pool: BufferPool,
    pub(crate) pooled_threshold: usize,
}

impl CompiledProgram {
    /// Normalized template text (markers removed, whitespace collapsed)
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Conditions including the trailing sentinel
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn registry(&self) -> &NameRegistry {
        &self.registry
    }

    pub fn estimator(&self) -> &SizeEstimator {
        &self.estimator
    }

    pub fn has_conditions(&self) -> bool {
        self.conditions.len() > 1
    }

    pub fn has_handlers(&self) -> bool {
        self.segments.iter().any(|s| s.handler.is_some())
    }

    pub(crate) fn segment_text(&self, segment: &Segment) -> &str {
        &self.text[segment.start..segment.end()]
    }
}
