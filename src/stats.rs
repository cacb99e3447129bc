//! Playback counters.
//!
//! Updated with relaxed atomics from any thread, including the real-time
//! ones; read as a [`StatsSnapshot`] from anywhere.

#![forbid(unsafe_code)]

use crossbeam::utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PlayerStats {
    nodes_processed: CachePadded<AtomicU64>,
    missed_claims: CachePadded<AtomicU64>,
    blocks_processed: AtomicU64,
    contended_blocks: AtomicU64,
    empty_blocks: AtomicU64,
    graphs_swapped: AtomicU64,
    graphs_retired: AtomicU64,
    deferred_swaps: AtomicU64,
    stalled_blocks: AtomicU64,
}

/// Point-in-time copy of [`PlayerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub blocks_processed: u64,
    pub nodes_processed: u64,
    /// Failed attempts to claim a node, or sweeps that skipped a node that
    /// was not ready yet.
    pub missed_claims: u64,
    /// Blocks rendered as silence because the graph handoff was contended.
    pub contended_blocks: u64,
    /// Blocks rendered as silence because no graph was installed.
    pub empty_blocks: u64,
    pub graphs_swapped: u64,
    pub graphs_retired: u64,
    /// Swaps postponed because the retire queue was full.
    pub deferred_swaps: u64,
    /// Single-threaded blocks cut short because no remaining node would
    /// report ready.
    pub stalled_blocks: u64,
}

macro_rules! counter {
    ($($method:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl PlayerStats {
    counter! {
        record_node_processed => nodes_processed,
        record_missed_claim => missed_claims,
        record_block => blocks_processed,
        record_contended_block => contended_blocks,
        record_empty_block => empty_blocks,
        record_swap => graphs_swapped,
        record_retired => graphs_retired,
        record_deferred_swap => deferred_swaps,
        record_stalled_block => stalled_blocks,
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            blocks_processed: self.blocks_processed.load(Ordering::Relaxed),
            nodes_processed: self.nodes_processed.load(Ordering::Relaxed),
            missed_claims: self.missed_claims.load(Ordering::Relaxed),
            contended_blocks: self.contended_blocks.load(Ordering::Relaxed),
            empty_blocks: self.empty_blocks.load(Ordering::Relaxed),
            graphs_swapped: self.graphs_swapped.load(Ordering::Relaxed),
            graphs_retired: self.graphs_retired.load(Ordering::Relaxed),
            deferred_swaps: self.deferred_swaps.load(Ordering::Relaxed),
            stalled_blocks: self.stalled_blocks.load(Ordering::Relaxed),
        }
    }
}
