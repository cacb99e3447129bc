//! Player module: single-threaded block processing.

// Real-time path: no assert_invariant, no logging, no allocation in `process`.

use crate::buffer::{AudioBuffer, MidiBuffer};
use crate::diagnostics::{DiagnosticEvent, DiagnosticRecorder};
use crate::error::GraphError;
use crate::graph::NodeGraph;
use crate::node::NodeStates;
use crate::plan::{prepare_graph_replacing, PreparedGraph};
use crate::play_head::{split_block, PlayHead};
use crate::range::SampleRange;
use crate::stats::{PlayerStats, StatsSnapshot};
use std::sync::Arc;

/// One device callback's worth of work.
///
/// The root node's audio is added into `audio` (matching channels only)
/// and its MIDI merged into `midi`, so callers clear them first if they
/// want only the graph's output.
#[derive(Debug)]
pub struct PlayerContext<'a> {
    pub num_samples: usize,
    /// Reference clock samples this block covers.
    pub reference_range: SampleRange,
    pub audio: &'a mut AudioBuffer,
    pub midi: &'a mut MidiBuffer,
}

impl<'a> PlayerContext<'a> {
    pub fn new(
        num_samples: usize,
        reference_range: SampleRange,
        audio: &'a mut AudioBuffer,
        midi: &'a mut MidiBuffer,
    ) -> Self {
        Self {
            num_samples,
            reference_range,
            audio,
            midi,
        }
    }

    /// Silences the first `num_samples` frames and drops all MIDI.
    pub fn clear(&mut self) {
        self.audio.clear_frames(self.num_samples);
        self.midi.clear();
    }
}

/// What happened to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Processed,
    /// No graph installed; output untouched.
    NoGraph,
    /// The graph handoff was busy; output untouched.
    Contended,
}

/// The part of `range` that frames `[offset, offset + n)` of a
/// `total`-frame block cover.
pub(crate) fn chunk_range(range: SampleRange, total: usize, offset: usize, n: usize) -> SampleRange {
    if total == 0 {
        return SampleRange::new(range.start, range.start);
    }
    let length = range.length() as i128;
    let at = |frames: usize| range.start + (length * frames as i128 / total as i128) as i64;
    SampleRange::new(at(offset), at(offset + n))
}

/// Adds the root output of the block just processed into `ctx`.
pub(crate) fn mix_root_output(
    graph: &PreparedGraph,
    ctx: &mut PlayerContext<'_>,
    num_frames: usize,
    dest_offset: usize,
) {
    if let Some((audio, midi)) = graph.root_output() {
        ctx.audio.add_from(audio, num_frames, dest_offset);
        if !midi.is_empty() {
            ctx.midi.merge_from(midi, dest_offset as u32);
        }
    }
}

/// Runs `ctx` through `graph` in chunks of at most the prepared block size,
/// splitting at loop boundaries when a play head is attached.
///
/// `process_chunk` processes one chunk of `graph` with the given length
/// and reference range; its output is then mixed into `ctx`.
pub(crate) fn process_chunked(
    graph: &PreparedGraph,
    play_head: Option<&PlayHead>,
    mut diagnostics: Option<&mut DiagnosticRecorder>,
    ctx: &mut PlayerContext<'_>,
    mut process_chunk: impl FnMut(&PreparedGraph, usize, SampleRange),
) {
    let total = ctx.num_samples;
    let mut offset = 0;
    while offset < total {
        let n = (total - offset).min(graph.block_size());
        let reference = chunk_range(ctx.reference_range, total, offset, n);
        match play_head {
            Some(play_head) => {
                let (first, second) = split_block(play_head, reference, n);
                if let (Some(diagnostics), Some(_)) = (diagnostics.as_deref_mut(), second) {
                    diagnostics.record(DiagnosticEvent::LoopSplit {
                        first_frames: first.num_frames as u32,
                    });
                }
                for sub in std::iter::once(first).chain(second) {
                    play_head.set_reference_sample_range(sub.reference_range);
                    process_chunk(graph, sub.num_frames, sub.reference_range);
                    mix_root_output(graph, ctx, sub.num_frames, offset + sub.frame_offset);
                }
            }
            None => {
                process_chunk(graph, n, reference);
                mix_root_output(graph, ctx, n, offset);
            }
        }
        offset += n;
    }
}

/// Plays a node graph on the calling thread.
#[derive(Debug, Default)]
pub struct NodePlayer {
    pending: Option<NodeGraph>,
    graph: Option<PreparedGraph>,
    play_head: Option<Arc<PlayHead>>,
    stats: Arc<PlayerStats>,
    settings: Option<(f64, usize)>,
}

impl NodePlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_play_head(play_head: Arc<PlayHead>) -> Self {
        Self {
            play_head: Some(play_head),
            ..Self::default()
        }
    }

    pub fn set_play_head(&mut self, play_head: Option<Arc<PlayHead>>) {
        self.play_head = play_head;
    }

    pub fn play_head(&self) -> Option<&Arc<PlayHead>> {
        self.play_head.as_ref()
    }

    /// Installs `graph`, preparing it right away if `prepare_to_play` has
    /// already been called. Its nodes may take over the state of the nodes
    /// they replace. Not real-time safe.
    pub fn set_node(&mut self, graph: NodeGraph) -> Result<(), GraphError> {
        match self.settings {
            Some((sample_rate, block_size)) => {
                let replaced = self.replaced_states();
                self.graph =
                    Some(prepare_graph_replacing(graph, sample_rate, block_size, &replaced)?);
                self.pending = None;
            }
            None => {
                self.graph = None;
                self.pending = Some(graph);
            }
        }
        Ok(())
    }

    /// Prepares (or re-prepares) the current graph. Not real-time safe.
    pub fn prepare_to_play(&mut self, sample_rate: f64, block_size: usize) -> Result<(), GraphError> {
        if block_size == 0 {
            return Err(GraphError::InvalidBlockSize);
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(GraphError::InvalidSampleRate(sample_rate));
        }
        self.settings = Some((sample_rate, block_size));
        let replaced = self.replaced_states();
        let graph = match (self.graph.take(), self.pending.take()) {
            (_, Some(pending)) => pending,
            (Some(prepared), None) => prepared.into_graph(),
            (None, None) => return Ok(()),
        };
        self.graph = Some(prepare_graph_replacing(graph, sample_rate, block_size, &replaced)?);
        Ok(())
    }

    fn replaced_states(&self) -> NodeStates {
        self.graph
            .as_ref()
            .map(|graph| graph.node_states().clone())
            .unwrap_or_default()
    }

    pub fn clear_node(&mut self) {
        self.graph = None;
        self.pending = None;
    }

    pub fn graph(&self) -> Option<&PreparedGraph> {
        self.graph.as_ref()
    }

    pub fn sample_rate(&self) -> Option<f64> {
        self.settings.map(|(sample_rate, _)| sample_rate)
    }

    pub fn block_size(&self) -> Option<usize> {
        self.settings.map(|(_, block_size)| block_size)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Processes one block. Blocks longer than the prepared block size are
    /// processed in chunks.
    pub fn process(&mut self, ctx: &mut PlayerContext<'_>) -> BlockOutcome {
        let Some(graph) = self.graph.as_ref() else {
            self.stats.record_empty_block();
            return BlockOutcome::NoGraph;
        };
        let stats = &*self.stats;
        process_chunked(graph, self.play_head.as_deref(), None, ctx, |graph, n, range| {
            // SAFETY: `&mut self` keeps every other thread off the graph.
            unsafe { graph.sweep(n, range, stats) };
        });
        stats.record_block();
        BlockOutcome::Processed
    }
}

/// Renders `frames` frames from reference position 0 in blocks of the
/// prepared block size. Not real-time safe.
pub fn render_offline(
    player: &mut NodePlayer,
    frames: usize,
    channels: usize,
) -> (AudioBuffer, MidiBuffer) {
    let block_size = player.block_size().unwrap_or(frames.max(1));
    let blocks = frames.div_ceil(block_size.max(1));
    let mut output = AudioBuffer::new(channels, frames);
    let mut midi = MidiBuffer::with_capacity(MidiBuffer::DEFAULT_CAPACITY * blocks.max(1));
    let mut block_audio = AudioBuffer::new(channels, block_size);
    let mut block_midi = MidiBuffer::with_capacity(MidiBuffer::DEFAULT_CAPACITY);

    let mut offset = 0;
    while offset < frames {
        let n = (frames - offset).min(block_size);
        block_audio.clear();
        block_midi.clear();
        let mut ctx = PlayerContext::new(
            n,
            SampleRange::with_length(offset as i64, n as i64),
            &mut block_audio,
            &mut block_midi,
        );
        player.process(&mut ctx);
        output.copy_from(&block_audio, n, offset);
        midi.merge_from(&block_midi, offset as u32);
        offset += n;
    }
    (output, midi)
}

/// Runs [`NodePlayer::process`] with panic containment. A panicking node
/// silences the block. Returns false if that happened.
pub fn process_block_safe(player: &mut NodePlayer, ctx: &mut PlayerContext<'_>) -> bool {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        player.process(ctx);
    }));
    if result.is_err() {
        // Fail closed: silence output
        ctx.clear();
        return false;
    }
    true
}
