//! Lock-free, multi-threaded real-time audio node graph player.
//!
//! Build a graph of [`Node`]s with a [`GraphBuilder`], then play it with a
//! [`NodePlayer`] on the calling thread or with a [`player_pair`] that
//! spreads each block over worker threads. A [`PlayHead`] maps the device's
//! reference clock onto a timeline, including loops.
//!
//! ```
//! use nodeplay::{AudioBuffer, GraphBuilder, MidiBuffer, NodePlayer, PlayerContext, SampleRange};
//! use nodeplay::nodes::{ConstantNode, GainNode};
//!
//! let mut builder = GraphBuilder::new();
//! let one = builder.add_node(ConstantNode::new(1, 1.0));
//! let half = builder.add_node(GainNode::new(one, 0.5));
//! let graph = builder.build(half).unwrap();
//!
//! let mut player = NodePlayer::new();
//! player.set_node(graph).unwrap();
//! player.prepare_to_play(48_000.0, 64).unwrap();
//!
//! let mut audio = AudioBuffer::new(1, 64);
//! let mut midi = MidiBuffer::with_capacity(16);
//! player.process(&mut PlayerContext::new(64, SampleRange::new(0, 64), &mut audio, &mut midi));
//! assert!(audio.channel(0).iter().all(|&s| s == 0.5));
//! ```

pub mod async_caller;
pub mod buffer;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fifo;
pub mod graph;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod node;
pub mod nodes;
pub mod parallel;
pub mod plan;
pub mod play_head;
pub mod player;
pub mod pool;
pub mod publish;
pub mod range;
pub mod seqlock;
pub mod spin_lock;
pub mod stats;

pub use buffer::{AudioBuffer, MidiBuffer, MidiMessage};
pub use config::{PlayerConfig, SchedulingMode, WaitStrategy};
pub use error::{GraphError, PlayerError};
pub use graph::{GraphBuilder, NodeGraph, VertexOrdering};
pub use node::{
    Node, NodeId, NodeProperties, NodeStates, PlaybackInitialisationInfo, ProcessContext,
    SharedNodeState,
};
pub use parallel::{player_pair, ParallelPlayer, PlayerController};
pub use plan::{prepare_graph, prepare_graph_replacing, PreparedGraph};
pub use play_head::{split_timeline_range, PlayHead, SplitTimelineRange};
pub use player::{process_block_safe, render_offline, BlockOutcome, NodePlayer, PlayerContext};
pub use range::SampleRange;
pub use stats::StatsSnapshot;
