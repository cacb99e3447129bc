//! Plan module: a node graph compiled for playback.
//!
//! [`prepare_graph`] turns a [`NodeGraph`] into a [`PreparedGraph`]: every
//! node prepared after its inputs, output buffers allocated, consumer lists
//! and dependency counts built, and a ready queue sized for the whole graph.
//! After that the graph is processed block after block without allocating.
//!
//! A prepared graph may be processed by several threads at once. Per block
//! each node is claimed by exactly one thread, either by popping it from the
//! ready queue or by winning its `claimed` flag. The node and its output
//! buffers are only ever touched by that thread until the node is marked
//! processed, after which its buffers are read-only until the next block.

use crate::buffer::{AudioBuffer, MidiBuffer};
use crate::config::SchedulingMode;
use crate::error::GraphError;
use crate::fifo::MpmcFifo;
use crate::graph::NodeGraph;
use crate::node::NodeId;
use crate::invariant_ppt::{
    assert_invariant, PREPARE_DEPENDENCIES, PREPARE_INPUTS_FIRST, PREPARE_LEAVES_FIRST,
};
use crate::node::{
    InputStatus, Inputs, Node, NodeProperties, NodeStates, PlaybackInitialisationInfo,
    ProcessContext,
};
use crate::range::SampleRange;
use crate::stats::PlayerStats;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

struct NodeBuffers {
    audio: AudioBuffer,
    midi: MidiBuffer,
}

/// One node plus its per-block playback state.
pub(crate) struct NodeSlot {
    node: UnsafeCell<Box<dyn Node>>,
    buffers: UnsafeCell<NodeBuffers>,
    processed: AtomicBool,
    claimed: AtomicBool,
    pending_inputs: AtomicUsize,
    inputs: Box<[usize]>,
    outputs: Box<[usize]>,
    properties: NodeProperties,
    id: NodeId,
    name: String,
    memory_bytes: usize,
}

impl NodeSlot {
    pub(crate) fn has_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    /// The node's output, if it has processed this block.
    pub(crate) fn processed_output(&self) -> Option<(&AudioBuffer, &MidiBuffer)> {
        if !self.has_processed() {
            return None;
        }
        // SAFETY: once `processed` is observed (Acquire) the owning thread has
        // finished writing, and nothing writes the buffers again until the next
        // `begin_block`, which cannot overlap any reader.
        let buffers = unsafe { &*self.buffers.get() };
        Some((&buffers.audio, &buffers.midi))
    }

    pub(crate) fn properties(&self) -> NodeProperties {
        self.properties
    }
}

/// Memory attributed to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMemory {
    pub index: usize,
    pub name: String,
    pub bytes: usize,
}

/// A graph ready for real-time processing.
pub struct PreparedGraph {
    slots: Box<[NodeSlot]>,
    root: usize,
    sample_rate: f64,
    block_size: usize,
    ready: MpmcFifo<usize>,
    queued: AtomicUsize,
    processed_count: AtomicUsize,
    block_samples: AtomicUsize,
    block_start: AtomicI64,
    block_end: AtomicI64,
    states: NodeStates,
}

// SAFETY: the `UnsafeCell` contents are accessed under the claim protocol
// described in the module docs. Nodes are `Send`, so moving exclusive access
// between threads is allowed.
unsafe impl Sync for PreparedGraph {}

/// Prepares `graph` for playback at `sample_rate` with blocks of up to
/// `block_size` frames.
pub fn prepare_graph(
    graph: NodeGraph,
    sample_rate: f64,
    block_size: usize,
) -> Result<PreparedGraph, GraphError> {
    prepare_graph_replacing(graph, sample_rate, block_size, &NodeStates::new())
}

/// [`prepare_graph`] for a graph that replaces one sharing `replaced`
/// (see [`PreparedGraph::node_states`]). Each shared state is offered to
/// the new nodes in postorder until one takes it over.
pub fn prepare_graph_replacing(
    graph: NodeGraph,
    sample_rate: f64,
    block_size: usize,
    replaced: &NodeStates,
) -> Result<PreparedGraph, GraphError> {
    if block_size == 0 {
        return Err(GraphError::InvalidBlockSize);
    }
    if !(sample_rate.is_finite() && sample_rate > 0.0) {
        return Err(GraphError::InvalidSampleRate(sample_rate));
    }

    let (nodes, inputs, ids, root) = graph.into_parts();
    let count = nodes.len();

    // Prepare in postorder so each node sees its inputs' final properties.
    let mut properties: Vec<NodeProperties> = Vec::with_capacity(count);
    let mut prepared = Vec::with_capacity(count);
    let mut unclaimed = replaced.clone();
    let mut states = NodeStates::new();
    for (index, (mut node, node_inputs)) in nodes.into_iter().zip(&inputs).enumerate() {
        assert_invariant(
            PREPARE_INPUTS_FIRST,
            node_inputs.iter().all(|&i| i < index),
            "node prepared before one of its inputs",
            Some(node.name()),
        );
        let input_properties: Vec<NodeProperties> =
            node_inputs.iter().map(|&i| properties[i]).collect();
        node.prepare_to_play(&PlaybackInitialisationInfo {
            sample_rate,
            block_size,
            input_properties: &input_properties,
            replaced: &unclaimed,
        });
        let props = node.node_properties();
        if let Some(state) = node.shared_state() {
            unclaimed.remove_taken(props.node_id, &state);
            states.insert(props.node_id, state);
        }
        properties.push(props);
        prepared.push(node);
    }

    // Leaves first, otherwise original order. Stable, so postorder holds.
    let mut order: Vec<usize> = (0..count).collect();
    order.sort_by_key(|&i| !inputs[i].is_empty());
    let mut new_index = vec![0; count];
    for (new, &old) in order.iter().enumerate() {
        new_index[old] = new;
    }

    let remapped_inputs: Vec<Vec<usize>> = order
        .iter()
        .map(|&old| inputs[old].iter().map(|&i| new_index[i]).collect())
        .collect();
    let mut outputs: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (index, node_inputs) in remapped_inputs.iter().enumerate() {
        for &input in node_inputs {
            outputs[input].push(index);
        }
    }

    assert_invariant(
        PREPARE_LEAVES_FIRST,
        remapped_inputs
            .iter()
            .enumerate()
            .all(|(index, ins)| ins.iter().all(|&i| i < index)),
        "leaf reordering broke postorder",
        None,
    );

    let mut taken: Vec<Option<Box<dyn Node>>> = prepared.into_iter().map(Some).collect();
    let mut slots = Vec::with_capacity(count);
    for (new, &old) in order.iter().enumerate() {
        let Some(node) = taken[old].take() else {
            unreachable!("node {old} placed twice");
        };
        let props = properties[old];
        let channels = if props.has_audio {
            props.number_of_channels
        } else {
            0
        };
        let midi_capacity = if props.has_midi {
            MidiBuffer::DEFAULT_CAPACITY
        } else {
            0
        };
        let buffers = NodeBuffers {
            audio: AudioBuffer::new(channels, block_size),
            midi: MidiBuffer::with_capacity(midi_capacity),
        };
        let memory_bytes =
            buffers.audio.allocated_bytes() + buffers.midi.allocated_bytes() + node.allocated_bytes();
        slots.push(NodeSlot {
            name: node.name().to_owned(),
            node: UnsafeCell::new(node),
            buffers: UnsafeCell::new(buffers),
            processed: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            pending_inputs: AtomicUsize::new(remapped_inputs[new].len()),
            inputs: remapped_inputs[new].clone().into_boxed_slice(),
            outputs: std::mem::take(&mut outputs[new]).into_boxed_slice(),
            properties: props,
            id: ids[old],
            memory_bytes,
        });
    }

    let consumer_edges: usize = slots.iter().map(|s| s.outputs.len()).sum();
    let input_edges: usize = slots.iter().map(|s| s.inputs.len()).sum();
    assert_invariant(
        PREPARE_DEPENDENCIES,
        consumer_edges == input_edges,
        "consumer lists disagree with input lists",
        None,
    );

    let graph = PreparedGraph {
        root: new_index[root],
        slots: slots.into_boxed_slice(),
        sample_rate,
        block_size,
        ready: MpmcFifo::with_capacity(count),
        queued: AtomicUsize::new(0),
        processed_count: AtomicUsize::new(0),
        block_samples: AtomicUsize::new(0),
        block_start: AtomicI64::new(0),
        block_end: AtomicI64::new(0),
        states,
    };
    tracing::debug!(
        nodes = count,
        shared_states = graph.states.len(),
        taken_over = replaced.len() - unclaimed.len(),
        sample_rate,
        block_size,
        bytes = graph.total_memory(),
        "prepared graph"
    );
    Ok(graph)
}

impl PreparedGraph {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn root_index(&self) -> usize {
        self.root
    }

    pub fn root_properties(&self) -> NodeProperties {
        self.slots[self.root].properties
    }

    pub fn properties(&self, index: usize) -> NodeProperties {
        self.slots[index].properties
    }

    pub fn node_name(&self, index: usize) -> &str {
        &self.slots[index].name
    }

    /// Direct inputs of node `index`, as indices into this graph.
    pub fn inputs_of(&self, index: usize) -> &[usize] {
        &self.slots[index].inputs
    }

    pub fn has_processed(&self, index: usize) -> bool {
        self.slots[index].has_processed()
    }

    pub fn processed_count(&self) -> usize {
        self.processed_count.load(Ordering::Acquire)
    }

    pub fn is_block_complete(&self) -> bool {
        self.processed_count() == self.slots.len()
    }

    /// Per-node memory: output buffers plus what the node reports.
    pub fn memory_usage(&self) -> Vec<NodeMemory> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| NodeMemory {
                index,
                name: slot.name.clone(),
                bytes: slot.memory_bytes,
            })
            .collect()
    }

    pub fn total_memory(&self) -> usize {
        self.slots.iter().map(|s| s.memory_bytes).sum()
    }

    /// States the nodes shared while being prepared. Pass them to
    /// [`prepare_graph_replacing`] for the graph that replaces this one.
    pub fn node_states(&self) -> &NodeStates {
        &self.states
    }

    /// Resets per-block state and calls every node's `prefetch_block`.
    ///
    /// With [`SchedulingMode::DependencyQueue`] the leaves are queued.
    ///
    /// # Safety
    /// No other thread may be touching this graph.
    pub(crate) unsafe fn begin_block(
        &self,
        num_samples: usize,
        range: SampleRange,
        mode: SchedulingMode,
    ) {
        debug_assert!(num_samples <= self.block_size);
        self.block_samples.store(num_samples, Ordering::Relaxed);
        self.block_start.store(range.start, Ordering::Relaxed);
        self.block_end.store(range.end, Ordering::Relaxed);
        self.processed_count.store(0, Ordering::Relaxed);

        while self.ready.pop().is_some() {}
        self.queued.store(0, Ordering::Relaxed);

        for slot in self.slots.iter() {
            slot.processed.store(false, Ordering::Relaxed);
            slot.claimed.store(false, Ordering::Relaxed);
            slot.pending_inputs.store(slot.inputs.len(), Ordering::Relaxed);
            // SAFETY: exclusive access per this function's contract.
            unsafe { (*slot.node.get()).prefetch_block(range) };
        }

        if mode == SchedulingMode::DependencyQueue {
            for (index, slot) in self.slots.iter().enumerate() {
                if !slot.inputs.is_empty() {
                    // Leaves lead the order.
                    break;
                }
                self.queued.fetch_add(1, Ordering::Relaxed);
                if self.ready.push(index).is_err() {
                    unreachable!("ready queue holds every node");
                }
            }
        }
    }

    fn block_range(&self) -> SampleRange {
        SampleRange::new(
            self.block_start.load(Ordering::Relaxed),
            self.block_end.load(Ordering::Relaxed),
        )
    }

    /// # Safety
    /// The caller must hold the claim on `index` for this block.
    unsafe fn process_node(&self, index: usize, stats: &PlayerStats) {
        let slot = &self.slots[index];
        debug_assert!(!slot.processed.load(Ordering::Relaxed), "node processed twice");
        debug_assert!(
            slot.inputs.iter().all(|&i| self.slots[i].has_processed()),
            "node processed before its inputs"
        );

        let num_samples = self.block_samples.load(Ordering::Relaxed);
        // SAFETY: the claim gives this thread exclusive access to the node
        // and its buffers until `processed` is set below.
        let (node, buffers) = unsafe { (&mut *slot.node.get(), &mut *slot.buffers.get()) };
        buffers.audio.clear_frames(num_samples);
        buffers.midi.clear();

        let mut ctx = ProcessContext {
            num_samples,
            reference_range: self.block_range(),
            inputs: Inputs::new(&self.slots, &slot.inputs, num_samples),
            audio: &mut buffers.audio,
            midi: &mut buffers.midi,
        };
        node.process(&mut ctx);

        slot.processed.store(true, Ordering::Release);
        self.processed_count.fetch_add(1, Ordering::AcqRel);
        stats.record_node_processed();
    }

    /// Decrements the consumers of `index`. Newly ready consumers are
    /// queued, except the last one, which is returned for the caller to
    /// process next.
    ///
    /// # Safety
    /// Same contract as [`process_next_free_node`](Self::process_next_free_node).
    unsafe fn release_outputs(&self, index: usize, stats: &PlayerStats) -> Option<usize> {
        let outputs = &self.slots[index].outputs;
        let mut next = None;
        for (n, &output) in outputs.iter().enumerate() {
            if self.slots[output].pending_inputs.fetch_sub(1, Ordering::AcqRel) != 1 {
                continue;
            }
            if n + 1 == outputs.len() {
                next = Some(output);
            } else {
                self.queued.fetch_add(1, Ordering::AcqRel);
                if let Err(output) = self.ready.push(output) {
                    // Cannot happen: each node is queued at most once a block.
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    // SAFETY: becoming ready hands this thread the claim.
                    unsafe { self.process_chain(output, stats) };
                }
            }
        }
        next
    }

    /// # Safety
    /// The caller must hold the claim on `index`.
    unsafe fn process_chain(&self, index: usize, stats: &PlayerStats) {
        let mut next = Some(index);
        while let Some(current) = next {
            // SAFETY: forwarded claim; see `release_outputs`.
            unsafe {
                debug_assert!(self.is_ready_claimed(current), "queued node is not ready");
                self.process_node(current, stats);
                next = self.release_outputs(current, stats);
            }
        }
    }

    /// Claims and processes one node if one is available.
    ///
    /// Returns false if nothing could be claimed right now.
    ///
    /// # Safety
    /// Must run between a `begin_block` and the end of that block, never
    /// concurrently with `begin_block`.
    pub(crate) unsafe fn process_next_free_node(
        &self,
        mode: SchedulingMode,
        stats: &PlayerStats,
    ) -> bool {
        match mode {
            SchedulingMode::DependencyQueue => {
                if self.queued.load(Ordering::Acquire) == 0 {
                    return false;
                }
                let Some(index) = self.ready.pop() else {
                    stats.record_missed_claim();
                    return false;
                };
                self.queued.fetch_sub(1, Ordering::AcqRel);
                // SAFETY: popping the index from the ready queue is the claim.
                unsafe { self.process_chain(index, stats) };
                true
            }
            SchedulingMode::Scan => {
                for (index, slot) in self.slots.iter().enumerate() {
                    if slot.claimed.load(Ordering::Relaxed) {
                        continue;
                    }
                    if slot.claimed.swap(true, Ordering::AcqRel) {
                        stats.record_missed_claim();
                        continue;
                    }
                    // Readiness is checked under the claim so no thread reads
                    // the node while another processes it.
                    if !self.is_ready(index) {
                        slot.claimed.store(false, Ordering::Release);
                        continue;
                    }
                    // SAFETY: the `claimed` swap above won the claim.
                    unsafe { self.process_node(index, stats) };
                    return true;
                }
                false
            }
        }
    }

    /// # Safety
    /// The caller must hold the claim on `index` (or the whole graph).
    unsafe fn is_ready_claimed(&self, index: usize) -> bool {
        let slot = &self.slots[index];
        // SAFETY: shared access to a node nobody else can be processing.
        let node = unsafe { &*slot.node.get() };
        node.is_ready_to_process(&InputStatus::new(&self.slots, &slot.inputs))
    }

    fn is_ready(&self, index: usize) -> bool {
        // SAFETY: only called while holding the claim on `index`.
        unsafe { self.is_ready_claimed(index) }
    }

    /// Processes every node on the calling thread, in order.
    ///
    /// # Safety
    /// No other thread may be touching this graph.
    pub(crate) unsafe fn process_in_order(
        &self,
        num_samples: usize,
        range: SampleRange,
        stats: &PlayerStats,
    ) {
        // SAFETY: forwarded exclusivity.
        unsafe {
            self.begin_block(num_samples, range, SchedulingMode::Scan);
            for index in 0..self.slots.len() {
                self.slots[index].claimed.store(true, Ordering::Relaxed);
                debug_assert!(self.is_ready_claimed(index), "node is not ready in postorder");
                self.process_node(index, stats);
            }
        }
    }

    /// Single-threaded block: sweeps the node list, processing every node
    /// that is ready, until all have processed. Returns the number of sweeps.
    ///
    /// A node is never processed before it reports ready. If a sweep finds
    /// nothing ready the block stops there: the unprocessed nodes, and the
    /// root if it is among them, produce no output this block, and the
    /// stall is counted in `StatsSnapshot::stalled_blocks`.
    pub fn process_sweep(
        &mut self,
        num_samples: usize,
        range: SampleRange,
        stats: &PlayerStats,
    ) -> usize {
        // SAFETY: `&mut self` is exclusive.
        unsafe { self.sweep(num_samples, range, stats) }
    }

    /// [`process_sweep`](Self::process_sweep) through a shared reference.
    ///
    /// # Safety
    /// No other thread may be touching this graph.
    pub(crate) unsafe fn sweep(
        &self,
        num_samples: usize,
        range: SampleRange,
        stats: &PlayerStats,
    ) -> usize {
        // SAFETY: forwarded exclusivity, here and below.
        unsafe { self.begin_block(num_samples, range, SchedulingMode::Scan) };

        let mut sweeps = 0;
        loop {
            sweeps += 1;
            let mut processed_any = false;
            let mut remaining = false;
            for index in 0..self.slots.len() {
                if self.slots[index].has_processed() {
                    continue;
                }
                if unsafe { self.is_ready_claimed(index) } {
                    unsafe { self.process_node(index, stats) };
                    processed_any = true;
                } else {
                    stats.record_missed_claim();
                    remaining = true;
                }
            }
            if !remaining {
                break;
            }
            if !processed_any {
                // Nothing left can become ready. End the block with the
                // rest unprocessed; their outputs read as missing.
                stats.record_stalled_block();
                break;
            }
        }
        sweeps
    }

    /// Takes the nodes back out, e.g. to prepare them again at another
    /// sample rate. The graph keeps this plan's node order.
    pub fn into_graph(self) -> NodeGraph {
        let root = self.root;
        let mut nodes = Vec::with_capacity(self.slots.len());
        let mut inputs = Vec::with_capacity(self.slots.len());
        let mut ids = Vec::with_capacity(self.slots.len());
        for slot in self.slots.into_vec() {
            nodes.push(slot.node.into_inner());
            inputs.push(slot.inputs.into_vec());
            ids.push(slot.id);
        }
        NodeGraph::from_parts(nodes, inputs, ids, root)
    }

    /// The root node's output for the block just processed.
    pub fn root_output(&self) -> Option<(&AudioBuffer, &MidiBuffer)> {
        self.slots[self.root].processed_output()
    }
}

impl fmt::Debug for PreparedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedGraph")
            .field("nodes", &self.slots.len())
            .field("root", &self.root)
            .field("sample_rate", &self.sample_rate)
            .field("block_size", &self.block_size)
            .finish()
    }
}
