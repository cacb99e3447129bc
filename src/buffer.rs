//! Audio and MIDI block buffers.
//!
//! Both buffer types are sized once on the non-real-time thread. Every
//! operation used during processing works within the existing allocation.

#![forbid(unsafe_code)]

/// Non-interleaved multi-channel audio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    num_frames: usize,
}

impl AudioBuffer {
    pub fn new(num_channels: usize, num_frames: usize) -> Self {
        Self {
            channels: vec![vec![0.0; num_frames]; num_channels],
            num_frames,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.channels.iter().map(Vec::as_slice)
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        self.channels.iter_mut().map(Vec::as_mut_slice)
    }

    /// Zeroes the first `num_frames` frames of every channel.
    pub fn clear_frames(&mut self, num_frames: usize) {
        let n = num_frames.min(self.num_frames);
        for channel in &mut self.channels {
            channel[..n].fill(0.0);
        }
    }

    pub fn clear(&mut self) {
        self.clear_frames(self.num_frames);
    }

    /// Adds `num_frames` frames of `source` into this buffer starting at
    /// `dest_offset`. Channels missing on either side are skipped.
    pub fn add_from(&mut self, source: &AudioBuffer, num_frames: usize, dest_offset: usize) {
        let n = num_frames
            .min(source.num_frames)
            .min(self.num_frames.saturating_sub(dest_offset));
        if n == 0 {
            return;
        }
        for (dst, src) in self.channels.iter_mut().zip(&source.channels) {
            for (d, s) in dst[dest_offset..dest_offset + n].iter_mut().zip(&src[..n]) {
                *d += *s;
            }
        }
    }

    /// Like [`add_from`](Self::add_from) but overwrites.
    pub fn copy_from(&mut self, source: &AudioBuffer, num_frames: usize, dest_offset: usize) {
        let n = num_frames
            .min(source.num_frames)
            .min(self.num_frames.saturating_sub(dest_offset));
        if n == 0 {
            return;
        }
        for (dst, src) in self.channels.iter_mut().zip(&source.channels) {
            dst[dest_offset..dest_offset + n].copy_from_slice(&src[..n]);
        }
    }

    /// Reshapes the buffer. Allocates; not for real-time threads.
    pub fn resize(&mut self, num_channels: usize, num_frames: usize) {
        self.channels.resize_with(num_channels, Vec::new);
        for channel in &mut self.channels {
            channel.clear();
            channel.resize(num_frames, 0.0);
        }
        self.num_frames = num_frames;
    }

    /// Heap bytes held by the sample storage.
    pub fn allocated_bytes(&self) -> usize {
        self.channels
            .iter()
            .map(|c| c.capacity() * std::mem::size_of::<f32>())
            .sum()
    }
}

/// A short MIDI message stamped with its frame offset inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MidiMessage {
    pub frame: u32,
    pub bytes: [u8; 3],
}

impl MidiMessage {
    pub fn new(frame: u32, bytes: [u8; 3]) -> Self {
        Self { frame, bytes }
    }

    pub fn note_on(frame: u32, channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(frame, [0x90 | (channel & 0x0f), note & 0x7f, velocity & 0x7f])
    }

    pub fn note_off(frame: u32, channel: u8, note: u8) -> Self {
        Self::new(frame, [0x80 | (channel & 0x0f), note & 0x7f, 0])
    }
}

/// Fixed-capacity list of MIDI messages for one block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MidiBuffer {
    messages: Vec<MidiMessage>,
}

impl MidiBuffer {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Vec::with_capacity(capacity),
        }
    }

    /// Appends `message` if there is room. Returns false when full rather
    /// than growing.
    pub fn push(&mut self, message: MidiMessage) -> bool {
        if self.messages.len() == self.messages.capacity() {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.messages.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MidiMessage> {
        self.messages.iter()
    }

    /// Copies in `source`'s messages shifted by `frame_offset`, keeping the
    /// result sorted by frame. Messages that do not fit are dropped; returns
    /// how many were dropped.
    pub fn merge_from(&mut self, source: &MidiBuffer, frame_offset: u32) -> usize {
        let mut dropped = 0;
        for message in &source.messages {
            let shifted = MidiMessage {
                frame: message.frame + frame_offset,
                ..*message
            };
            if self.messages.len() == self.messages.capacity() {
                dropped += 1;
                continue;
            }
            let at = self.messages.partition_point(|m| m.frame <= shifted.frame);
            self.messages.insert(at, shifted);
        }
        dropped
    }

    pub fn allocated_bytes(&self) -> usize {
        self.messages.capacity() * std::mem::size_of::<MidiMessage>()
    }
}
