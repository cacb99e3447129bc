//! Multi-threaded player.
//!
//! [`player_pair`] returns two handles. The [`ParallelPlayer`] lives on the
//! audio thread and only ever does real-time safe work. The
//! [`PlayerController`] lives on a control thread: it prepares graphs,
//! owns the worker threads, and frees whatever the audio thread retires.

// Real-time path (`ParallelPlayer::process`): no assert_invariant, no
// logging, no allocation, no blocking.

use crate::config::{PlayerConfig, WaitStrategy};
use crate::diagnostics::{
    diagnostic_queue, log_events, DiagnosticEvent, DiagnosticReceiver, DiagnosticRecorder,
};
use crate::error::{GraphError, PlayerError};
use crate::graph::NodeGraph;
use crate::node::NodeStates;
use crate::plan::{prepare_graph_replacing, PreparedGraph};
use crate::play_head::PlayHead;
use crate::player::{process_chunked, BlockOutcome, PlayerContext};
use crate::pool::{WorkerPool, WorkerShared};
use crate::publish::{GraphSlot, Handoff, RetireQueue};
use crate::range::SampleRange;
use crate::spin_lock::pause;
use crate::stats::{PlayerStats, StatsSnapshot};
use std::sync::Arc;

/// Creates a connected controller and audio-thread player, starting
/// `config.num_threads` workers.
pub fn player_pair(config: PlayerConfig) -> Result<(PlayerController, ParallelPlayer), PlayerError> {
    let stats = Arc::new(PlayerStats::default());
    let shared = Arc::new(WorkerShared::new(config.scheduling, Arc::clone(&stats)));
    let slot = Arc::new(GraphSlot::new(config.spin_lock));
    let retire = Arc::new(RetireQueue::with_capacity(config.retire_queue_capacity));
    let (recorder, receiver) = diagnostic_queue(config.diagnostics_capacity);

    let mut pool = WorkerPool::new(Arc::clone(&shared), &config);
    pool.set_num_threads(config.num_threads)?;

    let player = ParallelPlayer {
        current: None,
        slot: Arc::clone(&slot),
        retire: Arc::clone(&retire),
        shared,
        diagnostics: recorder,
        play_head: None,
        wake_workers: config.wait_strategy == WaitStrategy::Hybrid,
    };
    let controller = PlayerController {
        slot,
        retire,
        diagnostics: receiver,
        pool,
        stats,
        pending: None,
        live_states: NodeStates::new(),
        settings: None,
        config,
    };
    Ok((controller, player))
}

/// Audio-thread half of a [`player_pair`].
pub struct ParallelPlayer {
    current: Option<Box<PreparedGraph>>,
    slot: Arc<GraphSlot>,
    retire: Arc<RetireQueue>,
    shared: Arc<WorkerShared>,
    diagnostics: DiagnosticRecorder,
    play_head: Option<Arc<PlayHead>>,
    wake_workers: bool,
}

impl ParallelPlayer {
    /// Attach before playback starts; the play head's reference range is
    /// then driven by this player.
    pub fn set_play_head(&mut self, play_head: Option<Arc<PlayHead>>) {
        self.play_head = play_head;
    }

    /// Number of nodes in the graph currently playing.
    pub fn graph_len(&self) -> Option<usize> {
        self.current.as_ref().map(|graph| graph.len())
    }

    /// Processes one block, adding the root output into `ctx`.
    pub fn process(&mut self, ctx: &mut PlayerContext<'_>) -> BlockOutcome {
        let stats = self.shared.stats();
        match self.slot.acquire(&mut self.current, &self.retire, stats) {
            None => {
                stats.record_contended_block();
                self.diagnostics.record(DiagnosticEvent::BlockContended);
                return BlockOutcome::Contended;
            }
            Some(Handoff::Unchanged) => {}
            Some(Handoff::Swapped { nodes }) => {
                stats.record_swap();
                self.diagnostics.record(DiagnosticEvent::GraphSwapped {
                    nodes: nodes as u32,
                });
            }
            Some(Handoff::Cleared) => self.diagnostics.record(DiagnosticEvent::GraphCleared),
            Some(Handoff::Deferred) => {
                stats.record_deferred_swap();
                self.diagnostics.record(DiagnosticEvent::SwapDeferred);
            }
        }

        let Some(graph) = self.current.as_deref() else {
            stats.record_empty_block();
            self.diagnostics.record(DiagnosticEvent::NoGraph);
            return BlockOutcome::NoGraph;
        };

        let shared = &*self.shared;
        let wake = self.wake_workers;
        let parallel = shared.num_workers() > 0 && graph.len() > 1;
        process_chunked(
            graph,
            self.play_head.as_deref(),
            Some(&mut self.diagnostics),
            ctx,
            |graph, n, range| {
                // SAFETY: the graph is owned by this player, and workers can
                // only reach it between `publish` and `retract`.
                unsafe {
                    if parallel {
                        process_with_workers(shared, graph, n, range, wake);
                    } else {
                        graph.process_in_order(n, range, shared.stats());
                    }
                }
            },
        );
        stats.record_block();
        BlockOutcome::Processed
    }
}

/// # Safety
/// No worker may be inside `graph` (the previous block was retracted), and
/// `graph` must outlive this call.
unsafe fn process_with_workers(
    shared: &WorkerShared,
    graph: &PreparedGraph,
    num_samples: usize,
    range: SampleRange,
    wake: bool,
) {
    let mode = shared.scheduling();
    let stats = shared.stats();
    // SAFETY: exclusive until `publish`.
    unsafe {
        graph.begin_block(num_samples, range, mode);
        shared.publish(graph, wake);
    }
    while !graph.is_block_complete() {
        // SAFETY: between `begin_block` and `retract`.
        if !unsafe { graph.process_next_free_node(mode, stats) } {
            pause();
        }
    }
    shared.retract();
}

impl std::fmt::Debug for ParallelPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelPlayer")
            .field("graph", &self.current)
            .field("workers", &self.shared.num_workers())
            .finish()
    }
}

/// Control-thread half of a [`player_pair`].
pub struct PlayerController {
    slot: Arc<GraphSlot>,
    retire: Arc<RetireQueue>,
    diagnostics: DiagnosticReceiver,
    pool: WorkerPool,
    stats: Arc<PlayerStats>,
    /// Set before `prepare_to_play` was ever called.
    pending: Option<NodeGraph>,
    /// Shared by the last graph handed to the audio thread.
    live_states: NodeStates,
    settings: Option<(f64, usize)>,
    config: PlayerConfig,
}

impl PlayerController {
    /// Prepares `graph` with the current settings and queues it for the
    /// audio thread. Before the first `prepare_to_play` the graph is held
    /// until settings are known.
    ///
    /// Nodes may take over the state their predecessors share (see
    /// [`Node::shared_state`](crate::node::Node::shared_state)), so a
    /// swapped-in oscillator carries on from where the playing one is.
    pub fn set_node(&mut self, graph: NodeGraph) -> Result<(), GraphError> {
        let Some((sample_rate, block_size)) = self.settings else {
            self.pending = Some(graph);
            return Ok(());
        };
        let prepared =
            prepare_graph_replacing(graph, sample_rate, block_size, &self.live_states)?;
        self.publish(prepared);
        Ok(())
    }

    /// [`prepare_to_play`](Self::prepare_to_play) then
    /// [`set_node`](Self::set_node).
    pub fn set_node_with(
        &mut self,
        graph: NodeGraph,
        sample_rate: f64,
        block_size: usize,
    ) -> Result<(), GraphError> {
        self.prepare_to_play(sample_rate, block_size)?;
        self.set_node(graph)
    }

    /// Sets the sample rate and block size for graphs installed from now
    /// on. A graph queued but not yet picked up is prepared again; the
    /// graph already playing is not touched.
    pub fn prepare_to_play(&mut self, sample_rate: f64, block_size: usize) -> Result<(), GraphError> {
        if block_size == 0 {
            return Err(GraphError::InvalidBlockSize);
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(GraphError::InvalidSampleRate(sample_rate));
        }
        self.settings = Some((sample_rate, block_size));

        let graph = match self.pending.take() {
            Some(graph) => Some(graph),
            None => self.slot.take_pending().map(|prepared| prepared.into_graph()),
        };
        if let Some(graph) = graph {
            let prepared =
                prepare_graph_replacing(graph, sample_rate, block_size, &self.live_states)?;
            self.publish(prepared);
        }
        Ok(())
    }

    fn publish(&mut self, graph: PreparedGraph) {
        tracing::debug!(nodes = graph.len(), bytes = graph.total_memory(), "publishing graph");
        self.live_states = graph.node_states().clone();
        if let Some(unplayed) = self.slot.publish(Box::new(graph)) {
            tracing::debug!(nodes = unplayed.len(), "replaced graph that never played");
        }
    }

    /// Removes the graph at the next block boundary.
    pub fn clear_node(&mut self) {
        self.pending = None;
        self.live_states = NodeStates::new();
        if let Some(unplayed) = self.slot.publish_clear() {
            tracing::debug!(nodes = unplayed.len(), "dropped queued graph");
        }
    }

    pub fn set_num_threads(&mut self, num_threads: usize) -> Result<(), PlayerError> {
        self.pool.set_num_threads(num_threads)?;
        self.config.num_threads = num_threads;
        Ok(())
    }

    pub fn num_threads(&self) -> usize {
        self.pool.num_threads()
    }

    /// Frees graphs the audio thread retired and logs its diagnostics.
    /// Call regularly, e.g. from a timer. Returns the drained events.
    pub fn collect_garbage(&mut self) -> Vec<DiagnosticEvent> {
        self.retire.process();
        let events = self.diagnostics.drain();
        log_events(&events);
        events
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }
}

impl Drop for PlayerController {
    fn drop(&mut self) {
        self.retire.process();
    }
}

impl std::fmt::Debug for PlayerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerController")
            .field("pool", &self.pool)
            .field("settings", &self.settings)
            .field("retire_pending", &self.retire.pending())
            .finish()
    }
}
