//! Play head: maps the monotonic reference clock onto the timeline.
//!
//! The audio device drives a reference sample clock that only ever moves
//! forward. The play head remembers a pair of sync positions (a reference
//! position and the timeline position it corresponds to) and derives every
//! timeline position from them, applying looping, roll-in and scrubbing.
//!
//! Transport changes (play, stop, loop, locate) come from control threads
//! and are serialised by a mutex; the audio thread only publishes the
//! reference range and reads everything else lock-free.

#![forbid(unsafe_code)]

use crate::range::SampleRange;
use crate::seqlock::{SeqLockCell, SharedSeqLockCell};
use bytemuck::{Pod, Zeroable};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Loop ranges this short or shorter never loop.
const MIN_LOOP_LENGTH: i64 = 50;
/// 80ms at 44.1kHz.
const DEFAULT_SCRUB_BLOCK_LENGTH: i64 = 3_528;

#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
struct Transport {
    reference_sync: i64,
    playout_sync: i64,
    loop_range: SampleRange,
    speed: i64,
    looping: u64,
}

pub struct PlayHead {
    transport: SharedSeqLockCell<Transport>,
    reference_range: SeqLockCell<SampleRange>,
    roll_in_to_loop: AtomicBool,
    user_dragging: AtomicBool,
    scrub_block_length: AtomicI64,
    created: Instant,
    last_interaction_ns: AtomicU64,
}

impl Default for PlayHead {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayHead {
    pub fn new() -> Self {
        Self {
            transport: SharedSeqLockCell::new(Transport::default()),
            reference_range: SeqLockCell::new(SampleRange::default()),
            roll_in_to_loop: AtomicBool::new(false),
            user_dragging: AtomicBool::new(false),
            scrub_block_length: AtomicI64::new(DEFAULT_SCRUB_BLOCK_LENGTH),
            created: Instant::now(),
            last_interaction_ns: AtomicU64::new(0),
        }
    }

    // ---- transport (control threads) ----

    /// Moves the play head, recording a user interaction if it changed.
    pub fn set_position(&self, position: i64) {
        if position != self.position() {
            self.user_interaction();
        }
        self.override_position(position);
    }

    /// Moves the play head without counting as a user interaction, for
    /// changes that keep continuity such as a tempo change.
    pub fn override_position(&self, position: i64) {
        let reference = self.reference_range.load().start;
        let roll_in = self.roll_in_to_loop.load(Ordering::Relaxed);
        self.transport.update(|t| {
            let mut position = position;
            if t.looping != 0 && roll_in {
                position = position.min(t.loop_range.end);
            } else if t.looping != 0 {
                position = position.clamp(t.loop_range.start, t.loop_range.end);
            }
            t.reference_sync = reference;
            t.playout_sync = position;
        });
    }

    /// Starts playing `range` from its start, looping it if `looped` and the
    /// range is long enough.
    pub fn play(&self, range: SampleRange, looped: bool) {
        self.transport.update(|t| {
            t.loop_range = range;
            t.looping = u64::from(looped && range.length() > MIN_LOOP_LENGTH);
        });
        self.set_position(range.start);
        self.transport.update(|t| t.speed = 1);
    }

    /// Resumes from the current position.
    pub fn play_from_position(&self) {
        self.set_position(self.position());
        self.transport.update(|t| t.speed = 1);
    }

    /// Plays `range` with the timeline locked to the reference clock.
    /// Used for offline rendering; disables looping.
    pub fn play_synced_to_range(&self, range: SampleRange) {
        self.play(range, false);
        self.transport.update(|t| {
            t.reference_sync = 0;
            t.playout_sync = 0;
        });
    }

    pub fn stop(&self) {
        let position = self.position();
        self.transport.update(|t| t.speed = 0);
        self.set_position(position);
    }

    pub fn set_loop_range(&self, looping: bool, range: SampleRange) {
        let current = self.transport.load();
        if (current.looping != 0) != looping || (looping && range != current.loop_range) {
            let position = self.position();
            self.transport.update(|t| {
                t.looping = u64::from(looping);
                t.loop_range = range;
            });
            self.set_position(position);
        }
    }

    /// Lets playback start before the loop without wrapping, e.g. to count
    /// in to a loop recording. Cleared once the play head reaches the loop.
    pub fn set_roll_in_to_loop(&self, position: i64) {
        self.roll_in_to_loop.store(true, Ordering::Relaxed);
        let reference = self.reference_range.load().start;
        self.transport.update(|t| {
            t.reference_sync = reference;
            t.playout_sync = position.min(t.loop_range.end);
        });
    }

    /// While dragging, playback repeats short blocks from the sync point.
    pub fn set_user_is_dragging(&self, dragging: bool) {
        self.user_interaction();
        self.user_dragging.store(dragging, Ordering::Relaxed);
    }

    pub fn set_scrubbing_block_length(&self, num_samples: i64) {
        self.scrub_block_length.store(num_samples.max(1), Ordering::Relaxed);
    }

    // ---- reference clock (audio thread) ----

    /// Publishes the reference range about to be rendered. Single writer:
    /// the thread driving playback.
    pub fn set_reference_sample_range(&self, range: SampleRange) {
        self.reference_range.store(range);
        if self.roll_in_to_loop.load(Ordering::Relaxed)
            && self.position() >= self.transport.load().loop_range.start
        {
            self.roll_in_to_loop.store(false, Ordering::Relaxed);
        }
    }

    /// Advances the reference range by `num_samples`.
    pub fn increment_reference_sample_count(&self, num_samples: i64) {
        let range = self.reference_range.load();
        self.set_reference_sample_range(SampleRange::new(
            range.start + num_samples,
            range.end + num_samples,
        ));
    }

    pub fn reference_sample_range(&self) -> SampleRange {
        self.reference_range.load()
    }

    // ---- queries (any thread) ----

    pub fn position(&self) -> i64 {
        self.reference_sample_position_to_timeline_position(self.reference_range.load().start)
    }

    pub fn unlooped_position(&self) -> i64 {
        self.reference_sample_position_to_timeline_position_unlooped(
            self.reference_range.load().start,
        )
    }

    pub fn is_playing(&self) -> bool {
        self.transport.load().speed != 0
    }

    pub fn is_stopped(&self) -> bool {
        !self.is_playing()
    }

    pub fn is_looping(&self) -> bool {
        self.transport.load().looping != 0
    }

    pub fn is_rolling_into_loop(&self) -> bool {
        self.roll_in_to_loop.load(Ordering::Relaxed)
    }

    pub fn is_user_dragging(&self) -> bool {
        self.user_dragging.load(Ordering::Relaxed)
    }

    pub fn loop_range(&self) -> SampleRange {
        self.transport.load().loop_range
    }

    pub fn scrubbing_block_length(&self) -> i64 {
        self.scrub_block_length.load(Ordering::Relaxed)
    }

    pub fn playout_sync_position(&self) -> i64 {
        self.transport.load().playout_sync
    }

    /// When `set_position` or `set_user_is_dragging` last changed something.
    pub fn last_user_interaction(&self) -> Instant {
        self.created + Duration::from_nanos(self.last_interaction_ns.load(Ordering::Relaxed))
    }

    pub fn reference_sample_position_to_timeline_position(&self, reference: i64) -> i64 {
        let t = self.transport.load();
        if self.is_user_dragging() {
            let block = self.scrubbing_block_length();
            return t.playout_sync + (reference - t.reference_sync) % block;
        }
        let unlooped = t.playout_sync + (reference - t.reference_sync) * t.speed;
        if t.looping != 0 && !self.is_rolling_into_loop() {
            return linear_position_to_loop_position(unlooped, t.loop_range);
        }
        unlooped
    }

    pub fn reference_sample_position_to_timeline_position_unlooped(&self, reference: i64) -> i64 {
        let t = self.transport.load();
        t.playout_sync + (reference - t.reference_sync) * t.speed
    }

    /// Timeline range for `reference`, ignoring any loop.
    pub fn reference_sample_range_to_source_range_unlooped(
        &self,
        reference: SampleRange,
    ) -> SampleRange {
        let t = self.transport.load();
        SampleRange::new(
            t.playout_sync + (reference.start - t.reference_sync) * t.speed,
            t.playout_sync + (reference.end - t.reference_sync) * t.speed,
        )
    }

    fn user_interaction(&self) {
        let elapsed = self.created.elapsed().as_nanos();
        self.last_interaction_ns
            .store(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for PlayHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayHead")
            .field("position", &self.position())
            .field("playing", &self.is_playing())
            .field("looping", &self.is_looping())
            .field("loop_range", &self.loop_range())
            .finish()
    }
}

/// Wraps `position` into `loop_range`. Positions before the loop start are
/// returned unchanged in distance (remainder semantics).
pub fn linear_position_to_loop_position(position: i64, loop_range: SampleRange) -> i64 {
    let length = loop_range.length();
    if length <= 0 {
        return position;
    }
    loop_range.start + (position - loop_range.start) % length
}

/// One or two timeline ranges covering a reference range; two when it wraps
/// around the end of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitTimelineRange {
    pub timeline_range1: SampleRange,
    pub timeline_range2: SampleRange,
    pub is_split: bool,
}

impl SplitTimelineRange {
    pub fn single(range: SampleRange) -> Self {
        Self {
            timeline_range1: range,
            timeline_range2: SampleRange::default(),
            is_split: false,
        }
    }

    pub fn split(first: SampleRange, second: SampleRange) -> Self {
        Self {
            timeline_range1: first,
            timeline_range2: second,
            is_split: true,
        }
    }
}

fn wrap_into(start: i64, end: i64, loop_range: SampleRange) -> Option<SplitTimelineRange> {
    let s = linear_position_to_loop_position(start, loop_range);
    let e = linear_position_to_loop_position(end, loop_range);
    if s <= e {
        return None;
    }
    Some(if s >= loop_range.end {
        SplitTimelineRange::single(SampleRange::new(loop_range.start, e))
    } else if e <= loop_range.start {
        SplitTimelineRange::single(SampleRange::new(s, loop_range.end))
    } else {
        SplitTimelineRange::split(
            SampleRange::new(s, loop_range.end),
            SampleRange::new(loop_range.start, e),
        )
    })
}

/// Converts a reference range into the timeline range(s) it plays.
pub fn split_timeline_range(play_head: &PlayHead, reference: SampleRange) -> SplitTimelineRange {
    let unlooped = play_head.reference_sample_range_to_source_range_unlooped(reference);
    let (mut s, mut e) = (unlooped.start, unlooped.end);

    if play_head.is_user_dragging() {
        let start = play_head.playout_sync_position();
        let scrub = SampleRange::with_length(start, play_head.scrubbing_block_length());
        if let Some(split) = wrap_into(s, e, scrub) {
            return split;
        }
        s = linear_position_to_loop_position(s, scrub);
        e = linear_position_to_loop_position(e, scrub);
    }

    if play_head.is_looping() && !play_head.is_rolling_into_loop() {
        let loop_range = play_head.loop_range();
        if let Some(split) = wrap_into(s, e, loop_range) {
            return split;
        }
        s = linear_position_to_loop_position(s, loop_range);
        e = linear_position_to_loop_position(e, loop_range);
    }

    SplitTimelineRange::single(SampleRange::new(s, e))
}

/// A piece of an audio block with its own reference range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubBlock {
    pub reference_range: SampleRange,
    pub frame_offset: usize,
    pub num_frames: usize,
}

/// Splits a block at the loop boundary, if it crosses one.
///
/// Frames are divided in proportion to the two timeline ranges, rounding
/// the first part down. At unit speed with `reference.length() ==
/// num_frames` the split lands exactly on the loop end.
pub fn split_block(
    play_head: &PlayHead,
    reference: SampleRange,
    num_frames: usize,
) -> (SubBlock, Option<SubBlock>) {
    let whole = SubBlock {
        reference_range: reference,
        frame_offset: 0,
        num_frames,
    };
    let timeline = split_timeline_range(play_head, reference);
    if !timeline.is_split {
        return (whole, None);
    }

    let first_len = timeline.timeline_range1.length().max(0) as i128;
    let total = first_len + timeline.timeline_range2.length().max(0) as i128;
    if total == 0 {
        return (whole, None);
    }
    let first_frames = (num_frames as i128 * first_len / total) as usize;
    let first_reference = (reference.length() as i128 * first_len / total) as i64;
    if first_frames == 0 || first_frames >= num_frames {
        return (whole, None);
    }

    let (r1, r2) = reference.split_at(first_reference);
    (
        SubBlock {
            reference_range: r1,
            frame_offset: 0,
            num_frames: first_frames,
        },
        Some(SubBlock {
            reference_range: r2,
            frame_offset: first_frames,
            num_frames: num_frames - first_frames,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(s: i64, e: i64) -> SampleRange {
        SampleRange::new(s, e)
    }

    #[test]
    fn looped_range_splits_at_loop_end() {
        let ph = PlayHead::new();
        ph.play(range(0, 1000), true);

        let tr = split_timeline_range(&ph, range(250, 750));
        assert_eq!(tr, SplitTimelineRange::single(range(250, 750)));

        let tr = split_timeline_range(&ph, range(500, 1500));
        assert_eq!(tr, SplitTimelineRange::split(range(500, 1000), range(0, 500)));

        let tr = split_timeline_range(&ph, range(750, 1250));
        assert_eq!(tr, SplitTimelineRange::split(range(750, 1000), range(0, 250)));

        ph.play(range(0, 1500), false);
        let tr = split_timeline_range(&ph, range(500, 1500));
        assert_eq!(tr, SplitTimelineRange::single(range(500, 1500)));
    }

    #[test]
    fn short_loops_do_not_loop() {
        let ph = PlayHead::new();
        ph.play(range(0, 50), true);
        assert!(!ph.is_looping());
        ph.play(range(0, 51), true);
        assert!(ph.is_looping());
    }

    #[test]
    fn stop_and_resume_keep_timeline_position() {
        let ph = PlayHead::new();
        ph.play(range(0, 10_000), false);
        assert_eq!(ph.position(), 0);
        ph.increment_reference_sample_count(500);
        assert_eq!(ph.position(), 500);
        ph.increment_reference_sample_count(1000);
        assert_eq!(ph.position(), 1500);
        assert_eq!(ph.reference_sample_position_to_timeline_position(0), 0);

        ph.stop();
        ph.increment_reference_sample_count(500);
        assert_eq!(ph.position(), 1500);
        assert_eq!(ph.reference_sample_position_to_timeline_position(0), 1500);

        ph.play_from_position();
        assert_eq!(ph.position(), 1500);
        assert_eq!(ph.reference_sample_position_to_timeline_position(0), -500);
        ph.increment_reference_sample_count(500);
        assert_eq!(ph.position(), 2000);
    }

    #[test]
    fn offset_loop_wraps() {
        let ph = PlayHead::new();
        ph.play(range(1_000, 3_000), true);
        assert_eq!(ph.position(), 1_000);
        ph.increment_reference_sample_count(1_000);
        assert_eq!(ph.position(), 2_000);

        let tr = split_timeline_range(&ph, range(1_000, 1_500));
        assert_eq!(tr, SplitTimelineRange::single(range(2_000, 2_500)));

        ph.increment_reference_sample_count(500);
        assert_eq!(ph.position(), 2_500);
        let tr = split_timeline_range(&ph, range(1_500, 2_500));
        assert_eq!(tr, SplitTimelineRange::split(range(2_500, 3_000), range(1_000, 1_500)));
    }

    #[test]
    fn roll_in_clears_at_loop_start() {
        let ph = PlayHead::new();
        ph.play(range(1_000, 3_000), true);
        ph.set_roll_in_to_loop(500);
        assert!(ph.is_playing() && ph.is_looping() && ph.is_rolling_into_loop());
        assert_eq!(ph.position(), 500);
        ph.increment_reference_sample_count(500);
        assert_eq!(ph.position(), 1_000);
        assert!(!ph.is_rolling_into_loop());
    }

    #[test]
    fn looping_clamps_set_position() {
        let ph = PlayHead::new();
        ph.play(range(100, 1_100), true);
        ph.set_position(5_000);
        assert_eq!(ph.position(), 100);
        ph.set_position(40);
        assert_eq!(ph.position(), 100);
    }

    #[test]
    fn dragging_repeats_scrub_block() {
        let ph = PlayHead::new();
        ph.play(range(0, 100_000), false);
        ph.set_scrubbing_block_length(100);
        ph.set_position(1_000);
        ph.set_user_is_dragging(true);
        assert!(ph.is_user_dragging());
        assert_eq!(ph.reference_sample_position_to_timeline_position(150), 1_050);

        let tr = split_timeline_range(&ph, range(50, 150));
        assert_eq!(tr, SplitTimelineRange::split(range(1_050, 1_100), range(1_000, 1_050)));
    }

    #[test]
    fn loop_position_wrapping() {
        assert_eq!(linear_position_to_loop_position(2_500, range(1_000, 2_000)), 1_500);
        assert_eq!(linear_position_to_loop_position(1_999, range(1_000, 2_000)), 1_999);
        assert_eq!(linear_position_to_loop_position(7, range(0, 0)), 7);
    }

    #[test]
    fn split_block_lands_on_loop_end() {
        let ph = PlayHead::new();
        ph.play(range(0, 1000), true);
        let (a, b) = split_block(&ph, range(960, 1024), 64);
        assert_eq!(a.reference_range, range(960, 1000));
        assert_eq!(a.num_frames, 40);
        let b = b.unwrap();
        assert_eq!(b.reference_range, range(1000, 1024));
        assert_eq!((b.frame_offset, b.num_frames), (40, 24));

        let (whole, none) = split_block(&ph, range(0, 64), 64);
        assert!(none.is_none());
        assert_eq!(whole.num_frames, 64);
    }
}
