//! Built-in nodes: generators, mixers, and simple processors.

#![forbid(unsafe_code)]

use crate::buffer::MidiMessage;
use crate::node::{
    Node, NodeId, NodeProperties, PlaybackInitialisationInfo, ProcessContext, SharedNodeState,
};
use crate::range::SampleRange;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sine oscillator.
///
/// A sine replacing one of the same frequency continues its phase, so
/// swapping graphs does not click.
#[derive(Debug)]
pub struct SinNode {
    frequency: f64,
    channels: usize,
    phase: Arc<SinPhase>,
    increment: f64,
}

/// Phase in radians, as `f64` bits. Only the playing graph's node writes it.
#[derive(Debug, Default)]
struct SinPhase(AtomicU64);

impl SinNode {
    pub fn new(frequency: f64, channels: usize) -> Self {
        Self {
            frequency,
            channels,
            phase: Arc::default(),
            increment: 0.0,
        }
    }

    /// Phase the next block starts at, in radians.
    pub fn phase(&self) -> f64 {
        f64::from_bits(self.phase.0.load(Ordering::Relaxed))
    }
}

impl Node for SinNode {
    fn node_properties(&self) -> NodeProperties {
        NodeProperties::audio(self.channels).with_node_id(self.frequency.to_bits())
    }

    fn prepare_to_play(&mut self, info: &PlaybackInitialisationInfo<'_>) {
        self.increment = TAU * self.frequency / info.sample_rate;
        if let Some(phase) = info.replaced.get::<SinPhase>(self.node_properties().node_id) {
            self.phase = phase;
        }
    }

    fn shared_state(&self) -> Option<SharedNodeState> {
        Some(Arc::clone(&self.phase) as SharedNodeState)
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let n = ctx.num_samples;
        let start = self.phase();
        for channel in 0..self.channels {
            let mut phase = start;
            for sample in &mut ctx.audio.channel_mut(channel)[..n] {
                *sample = phase.sin() as f32;
                phase += self.increment;
            }
        }
        let end = (start + self.increment * n as f64) % TAU;
        self.phase.0.store(end.to_bits(), Ordering::Relaxed);
    }
}

/// Outputs a fixed value on every channel.
#[derive(Debug, Clone)]
pub struct ConstantNode {
    channels: usize,
    value: f32,
}

impl ConstantNode {
    pub fn new(channels: usize, value: f32) -> Self {
        Self { channels, value }
    }
}

impl Node for ConstantNode {
    fn node_properties(&self) -> NodeProperties {
        NodeProperties::audio(self.channels).with_node_id(u64::from(self.value.to_bits()))
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        for channel in 0..self.channels {
            ctx.output_channel(channel).fill(self.value);
        }
    }
}

/// Outputs silence.
#[derive(Debug, Clone)]
pub struct SilentNode {
    channels: usize,
}

impl SilentNode {
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }
}

impl Node for SilentNode {
    fn node_properties(&self) -> NodeProperties {
        NodeProperties::audio(self.channels)
    }

    // Buffers arrive cleared.
    fn process(&mut self, _ctx: &mut ProcessContext<'_>) {}
}

/// Sums the audio and merges the MIDI of all its inputs.
#[derive(Debug, Clone)]
pub struct SummingNode {
    inputs: Vec<NodeId>,
    properties: NodeProperties,
}

impl SummingNode {
    pub fn new(inputs: Vec<NodeId>) -> Self {
        Self {
            inputs,
            properties: NodeProperties::default(),
        }
    }
}

impl Node for SummingNode {
    fn direct_input_nodes(&self) -> Vec<NodeId> {
        self.inputs.clone()
    }

    fn node_properties(&self) -> NodeProperties {
        self.properties
    }

    fn prepare_to_play(&mut self, info: &PlaybackInitialisationInfo<'_>) {
        self.properties = NodeProperties::combined(info.input_properties);
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let n = ctx.num_samples;
        for input in ctx.inputs.iter() {
            let channels = input.num_channels().min(ctx.audio.num_channels());
            for channel in 0..channels {
                let dst = &mut ctx.audio.channel_mut(channel)[..n];
                for (d, s) in dst.iter_mut().zip(input.channel(channel)) {
                    *d += *s;
                }
            }
            ctx.midi.merge_from(input.midi(), 0);
        }
    }
}

/// Copies its single input through unchanged.
#[derive(Debug, Clone)]
pub struct ForwardingNode {
    input: NodeId,
    properties: NodeProperties,
}

impl ForwardingNode {
    pub fn new(input: NodeId) -> Self {
        Self {
            input,
            properties: NodeProperties::default(),
        }
    }
}

impl Node for ForwardingNode {
    fn direct_input_nodes(&self) -> Vec<NodeId> {
        vec![self.input]
    }

    fn node_properties(&self) -> NodeProperties {
        self.properties
    }

    fn prepare_to_play(&mut self, info: &PlaybackInitialisationInfo<'_>) {
        self.properties = info.input_properties.first().copied().unwrap_or_default();
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let Some(input) = ctx.inputs.get(0) else {
            return;
        };
        let n = ctx.num_samples;
        ctx.audio.copy_from(input.audio(), n, 0);
        ctx.midi.merge_from(input.midi(), 0);
    }
}

/// Applies a per-sample function to its input's audio.
pub struct FunctionNode {
    input: NodeId,
    function: Box<dyn FnMut(f32) -> f32 + Send>,
    properties: NodeProperties,
}

impl FunctionNode {
    pub fn new(input: NodeId, function: impl FnMut(f32) -> f32 + Send + 'static) -> Self {
        Self {
            input,
            function: Box::new(function),
            properties: NodeProperties::default(),
        }
    }
}

impl Node for FunctionNode {
    fn direct_input_nodes(&self) -> Vec<NodeId> {
        vec![self.input]
    }

    fn node_properties(&self) -> NodeProperties {
        self.properties
    }

    fn prepare_to_play(&mut self, info: &PlaybackInitialisationInfo<'_>) {
        self.properties = info.input_properties.first().copied().unwrap_or_default();
        self.properties.has_midi = false;
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let Some(input) = ctx.inputs.get(0) else {
            return;
        };
        let n = ctx.num_samples;
        let channels = input.num_channels().min(ctx.audio.num_channels());
        for channel in 0..channels {
            let dst = &mut ctx.audio.channel_mut(channel)[..n];
            for (d, s) in dst.iter_mut().zip(input.channel(channel)) {
                *d = (self.function)(*s);
            }
        }
    }
}

/// Multiplies its input by a fixed gain.
#[derive(Debug, Clone)]
pub struct GainNode {
    input: NodeId,
    gain: f32,
    properties: NodeProperties,
}

impl GainNode {
    pub fn new(input: NodeId, gain: f32) -> Self {
        Self {
            input,
            gain,
            properties: NodeProperties::default(),
        }
    }
}

impl Node for GainNode {
    fn direct_input_nodes(&self) -> Vec<NodeId> {
        vec![self.input]
    }

    fn node_properties(&self) -> NodeProperties {
        self.properties
    }

    fn prepare_to_play(&mut self, info: &PlaybackInitialisationInfo<'_>) {
        let input = info.input_properties.first().copied().unwrap_or_default();
        self.properties = input.with_node_id(input.node_id ^ u64::from(self.gain.to_bits()));
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let Some(input) = ctx.inputs.get(0) else {
            return;
        };
        let n = ctx.num_samples;
        let channels = input.num_channels().min(ctx.audio.num_channels());
        for channel in 0..channels {
            let dst = &mut ctx.audio.channel_mut(channel)[..n];
            for (d, s) in dst.iter_mut().zip(input.channel(channel)) {
                *d = *s * self.gain;
            }
        }
        ctx.midi.merge_from(input.midi(), 0);
    }
}

/// Delays its input's audio by a fixed number of samples.
#[derive(Debug, Clone)]
pub struct LatencyNode {
    input: NodeId,
    delay: usize,
    lines: Vec<Vec<f32>>,
    position: usize,
    properties: NodeProperties,
}

impl LatencyNode {
    pub fn new(input: NodeId, delay: usize) -> Self {
        Self {
            input,
            delay,
            lines: Vec::new(),
            position: 0,
            properties: NodeProperties::default(),
        }
    }
}

impl Node for LatencyNode {
    fn direct_input_nodes(&self) -> Vec<NodeId> {
        vec![self.input]
    }

    fn node_properties(&self) -> NodeProperties {
        self.properties
    }

    fn prepare_to_play(&mut self, info: &PlaybackInitialisationInfo<'_>) {
        let input = info.input_properties.first().copied().unwrap_or_default();
        self.properties = input.with_latency(input.latency_num_samples + self.delay);
        self.properties.has_midi = false;
        self.lines = vec![vec![0.0; self.delay]; input.number_of_channels];
        self.position = 0;
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let Some(input) = ctx.inputs.get(0) else {
            return;
        };
        let n = ctx.num_samples;
        if self.delay == 0 {
            ctx.audio.copy_from(input.audio(), n, 0);
            return;
        }
        let channels = self.lines.len().min(ctx.audio.num_channels());
        for channel in 0..channels {
            let line = &mut self.lines[channel];
            let mut position = self.position;
            let dst = &mut ctx.audio.channel_mut(channel)[..n];
            for (d, s) in dst.iter_mut().zip(input.channel(channel)) {
                *d = std::mem::replace(&mut line[position], *s);
                position = (position + 1) % self.delay;
            }
        }
        self.position = (self.position + n) % self.delay;
    }

    fn allocated_bytes(&self) -> usize {
        self.lines
            .iter()
            .map(|l| l.capacity() * std::mem::size_of::<f32>())
            .sum()
    }
}

/// Emits MIDI messages scheduled at absolute reference-clock positions.
#[derive(Debug, Clone)]
pub struct MidiNode {
    /// `(position, message bytes)`, sorted by position.
    events: Vec<(i64, [u8; 3])>,
    range: SampleRange,
}

impl MidiNode {
    pub fn new(mut events: Vec<(i64, [u8; 3])>) -> Self {
        events.sort_by_key(|&(position, _)| position);
        Self {
            events,
            range: SampleRange::default(),
        }
    }
}

impl Node for MidiNode {
    fn node_properties(&self) -> NodeProperties {
        NodeProperties::midi()
    }

    fn prefetch_block(&mut self, reference_range: SampleRange) {
        self.range = reference_range;
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let range = ctx.reference_range;
        let first = self.events.partition_point(|&(p, _)| p < range.start);
        for &(position, bytes) in self.events[first..]
            .iter()
            .take_while(|&&(p, _)| p < range.end)
        {
            let frame = (position - range.start) as u32;
            if !ctx.midi.push(MidiMessage::new(frame, bytes)) {
                break;
            }
        }
        debug_assert_eq!(self.range, range);
    }

    fn allocated_bytes(&self) -> usize {
        self.events.capacity() * std::mem::size_of::<(i64, [u8; 3])>()
    }
}
