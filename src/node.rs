//! The node abstraction.
//!
//! A [`Node`] is one unit of audio/MIDI processing. Nodes declare the nodes
//! they read from by [`NodeId`]; the graph owns every node and hands each
//! one read-only views of its inputs' output buffers while it processes.

#![forbid(unsafe_code)]

use crate::buffer::{AudioBuffer, MidiBuffer};
use crate::plan::NodeSlot;
use crate::range::SampleRange;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Index of a node inside a [`GraphBuilder`](crate::graph::GraphBuilder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Static description of a node, fixed once it has been prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeProperties {
    pub has_audio: bool,
    pub has_midi: bool,
    pub number_of_channels: usize,
    /// Delay this node introduces, including its inputs' latency.
    pub latency_num_samples: usize,
    /// `Some(n)` if the node can only process blocks of exactly `n` frames.
    pub fixed_block_size: Option<usize>,
    /// Stable identity, typically a hash of the node's parameters.
    pub node_id: u64,
}

impl NodeProperties {
    pub fn audio(number_of_channels: usize) -> Self {
        Self {
            has_audio: true,
            number_of_channels,
            ..Self::default()
        }
    }

    pub fn midi() -> Self {
        Self {
            has_midi: true,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency_num_samples: usize) -> Self {
        self.latency_num_samples = latency_num_samples;
        self
    }

    pub fn with_node_id(mut self, node_id: u64) -> Self {
        self.node_id = node_id;
        self
    }

    /// Union of several properties: audio/MIDI flags ORed, channel count
    /// and latency maxed.
    pub fn combined<'a>(all: impl IntoIterator<Item = &'a NodeProperties>) -> Self {
        all.into_iter().fold(Self::default(), |acc, p| Self {
            has_audio: acc.has_audio || p.has_audio,
            has_midi: acc.has_midi || p.has_midi,
            number_of_channels: acc.number_of_channels.max(p.number_of_channels),
            latency_num_samples: acc.latency_num_samples.max(p.latency_num_samples),
            ..acc
        })
    }
}

/// State a node hands over to the node that replaces it. See
/// [`Node::shared_state`].
pub type SharedNodeState = Arc<dyn Any + Send + Sync>;

/// Shared state of a graph's nodes, keyed by [`NodeProperties::node_id`].
///
/// When a graph replaces another, each new node may look up the state its
/// predecessor with the same `node_id` shared, and keep using it. Only the
/// first node reporting a given `node_id` is recorded.
#[derive(Clone, Default)]
pub struct NodeStates {
    states: HashMap<u64, SharedNodeState>,
}

impl NodeStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// The state shared under `node_id`, if there is one of type `S`.
    pub fn get<S: Any + Send + Sync>(&self, node_id: u64) -> Option<Arc<S>> {
        Arc::clone(self.states.get(&node_id)?).downcast::<S>().ok()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub(crate) fn insert(&mut self, node_id: u64, state: SharedNodeState) {
        self.states.entry(node_id).or_insert(state);
    }

    /// Forgets `node_id` if a node took over exactly this `state`, so no
    /// second node with the same id shares it too.
    pub(crate) fn remove_taken(&mut self, node_id: u64, state: &SharedNodeState) {
        if self
            .states
            .get(&node_id)
            .is_some_and(|held| Arc::ptr_eq(held, state))
        {
            self.states.remove(&node_id);
        }
    }
}

impl fmt::Debug for NodeStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<u64> = self.states.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("NodeStates").field("node_ids", &ids).finish()
    }
}

/// Passed to [`Node::prepare_to_play`].
#[derive(Debug, Clone, Copy)]
pub struct PlaybackInitialisationInfo<'a> {
    pub sample_rate: f64,
    pub block_size: usize,
    /// Properties of the direct inputs, in declaration order. Inputs are
    /// always prepared first.
    pub input_properties: &'a [NodeProperties],
    /// States shared by the graph this one replaces and not yet taken over
    /// by an earlier node. Empty for the first graph.
    pub replaced: &'a NodeStates,
}

/// A processing node.
pub trait Node: Send + 'static {
    /// Nodes whose output this node reads, in the order
    /// [`Inputs::get`] indexes them.
    fn direct_input_nodes(&self) -> Vec<NodeId> {
        Vec::new()
    }

    /// Must be consistent once [`prepare_to_play`](Self::prepare_to_play)
    /// has run.
    fn node_properties(&self) -> NodeProperties;

    /// Called on the non-real-time thread after every input was prepared.
    /// Allocate here, never in `process`.
    ///
    /// A node that keeps state across graph swaps looks up its predecessor's
    /// state in [`info.replaced`](PlaybackInitialisationInfo::replaced).
    fn prepare_to_play(&mut self, _info: &PlaybackInitialisationInfo<'_>) {}

    /// State the node replacing this one may take over, queried right after
    /// `prepare_to_play`. The replaced graph may still be playing while the
    /// new one is prepared, so the state must be safe to share.
    fn shared_state(&self) -> Option<SharedNodeState> {
        None
    }

    /// Whether the node can run now. Defaults to "every input has
    /// processed this block".
    fn is_ready_to_process(&self, inputs: &InputStatus<'_>) -> bool {
        inputs.all_processed()
    }

    /// Called once at the start of every block, before any node processes.
    fn prefetch_block(&mut self, _reference_range: SampleRange) {}

    /// Renders one block into `ctx.audio`/`ctx.midi`, which arrive cleared.
    /// Must not allocate, lock, or block.
    fn process(&mut self, ctx: &mut ProcessContext<'_>);

    /// Heap memory owned by the node itself.
    fn allocated_bytes(&self) -> usize {
        0
    }

    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

/// Everything a node sees while processing.
pub struct ProcessContext<'a> {
    pub num_samples: usize,
    pub reference_range: SampleRange,
    pub inputs: Inputs<'a>,
    pub audio: &'a mut AudioBuffer,
    pub midi: &'a mut MidiBuffer,
}

impl ProcessContext<'_> {
    /// The first `num_samples` frames of output channel `index`.
    pub fn output_channel(&mut self, index: usize) -> &mut [f32] {
        let n = self.num_samples;
        &mut self.audio.channel_mut(index)[..n]
    }
}

/// Processed-state of a node's direct inputs.
#[derive(Clone, Copy)]
pub struct InputStatus<'a> {
    slots: &'a [NodeSlot],
    indices: &'a [usize],
}

impl<'a> InputStatus<'a> {
    pub(crate) fn new(slots: &'a [NodeSlot], indices: &'a [usize]) -> Self {
        Self { slots, indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn has_processed(&self, input: usize) -> bool {
        self.slots[self.indices[input]].has_processed()
    }

    pub fn all_processed(&self) -> bool {
        self.indices.iter().all(|&i| self.slots[i].has_processed())
    }
}

/// Read access to the direct inputs' output buffers.
#[derive(Clone, Copy)]
pub struct Inputs<'a> {
    status: InputStatus<'a>,
    num_samples: usize,
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(slots: &'a [NodeSlot], indices: &'a [usize], num_samples: usize) -> Self {
        Self {
            status: InputStatus::new(slots, indices),
            num_samples,
        }
    }

    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }

    /// Output of input `input`, or `None` if that input has not finished
    /// processing this block.
    pub fn get(&self, input: usize) -> Option<NodeOutput<'a>> {
        let slot = &self.status.slots[*self.status.indices.get(input)?];
        let (audio, midi) = slot.processed_output()?;
        Some(NodeOutput {
            audio,
            midi,
            properties: slot.properties(),
            num_samples: self.num_samples,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeOutput<'a>> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    pub fn status(&self) -> InputStatus<'a> {
        self.status
    }
}

/// One input's output for the current block.
#[derive(Clone, Copy)]
pub struct NodeOutput<'a> {
    audio: &'a AudioBuffer,
    midi: &'a MidiBuffer,
    properties: NodeProperties,
    num_samples: usize,
}

impl<'a> NodeOutput<'a> {
    pub fn num_channels(&self) -> usize {
        self.audio.num_channels()
    }

    /// The block's frames of channel `index`.
    pub fn channel(&self, index: usize) -> &'a [f32] {
        &self.audio.channel(index)[..self.num_samples]
    }

    pub fn audio(&self) -> &'a AudioBuffer {
        self.audio
    }

    pub fn midi(&self) -> &'a MidiBuffer {
        self.midi
    }

    pub fn properties(&self) -> &NodeProperties {
        &self.properties
    }
}
