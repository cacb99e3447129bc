//! Half-open ranges on a sample clock.

#![forbid(unsafe_code)]

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// `[start, end)` in samples.
///
/// Used both for the monotonic reference clock driven by the audio device
/// and for positions on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SampleRange {
    pub start: i64,
    pub end: i64,
}

impl SampleRange {
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub const fn with_length(start: i64, length: i64) -> Self {
        Self {
            start,
            end: start + length,
        }
    }

    pub const fn length(&self) -> i64 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub const fn contains(&self, position: i64) -> bool {
        position >= self.start && position < self.end
    }

    /// Splits at `offset` samples from the start.
    pub fn split_at(&self, offset: i64) -> (Self, Self) {
        let mid = (self.start + offset.clamp(0, self.length().max(0))).min(self.end);
        (Self::new(self.start, mid), Self::new(mid, self.end))
    }
}

impl fmt::Display for SampleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
