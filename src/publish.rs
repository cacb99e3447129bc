//! Graph handoff between the control thread and the audio thread.
//!
//! The control thread parks a prepared graph (or a clear request) in a
//! [`GraphSlot`]. At the start of each block the audio thread tries the
//! slot's spin lock once; if it gets it, it takes whatever is pending and
//! hands the graph it replaced to the retire queue so it is freed off the
//! audio thread. The lock only ever covers a pointer swap.

// Real-time path: no assert_invariant, no logging, no allocation.

use crate::async_caller::{AsyncCaller, Deferred};
use crate::plan::PreparedGraph;
use crate::spin_lock::{RealTimeSpinLock, SpinConfig};
use crate::stats::PlayerStats;
use std::cell::UnsafeCell;
use std::sync::Arc;

/// A replaced graph on its way to being dropped by the control thread.
pub struct RetireGraph {
    graph: Box<PreparedGraph>,
    stats: Arc<PlayerStats>,
}

impl Deferred for RetireGraph {
    fn invoke(self) {
        tracing::debug!(nodes = self.graph.len(), "retiring graph");
        self.stats.record_retired();
        drop(self.graph);
    }
}

pub type RetireQueue = AsyncCaller<RetireGraph>;

enum Pending {
    Nothing,
    Graph(Box<PreparedGraph>),
    Clear,
}

/// What [`GraphSlot::acquire`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handoff {
    Unchanged,
    Swapped { nodes: usize },
    Cleared,
    /// A change is pending but the retire queue is full.
    Deferred,
}

/// Lock-protected mailbox for the next graph.
pub struct GraphSlot {
    lock: RealTimeSpinLock,
    pending: UnsafeCell<Pending>,
}

// SAFETY: `pending` is only touched while holding `lock`.
unsafe impl Sync for GraphSlot {}

impl GraphSlot {
    pub fn new(config: SpinConfig) -> Self {
        Self {
            lock: RealTimeSpinLock::with_config(config),
            pending: UnsafeCell::new(Pending::Nothing),
        }
    }

    fn replace_pending(&self, next: Pending) -> Option<Box<PreparedGraph>> {
        let _guard = self.lock.guard();
        // SAFETY: guarded by `lock`.
        let previous = std::mem::replace(unsafe { &mut *self.pending.get() }, next);
        match previous {
            Pending::Graph(graph) => Some(graph),
            Pending::Nothing | Pending::Clear => None,
        }
    }

    /// Queues `graph` for the next block. Returns a previously queued graph
    /// the audio thread never picked up. Control thread only.
    pub fn publish(&self, graph: Box<PreparedGraph>) -> Option<Box<PreparedGraph>> {
        self.replace_pending(Pending::Graph(graph))
    }

    /// Queues removal of the current graph. Control thread only.
    pub fn publish_clear(&self) -> Option<Box<PreparedGraph>> {
        self.replace_pending(Pending::Clear)
    }

    /// Takes back a graph the audio thread has not picked up yet.
    pub fn take_pending(&self) -> Option<Box<PreparedGraph>> {
        self.replace_pending(Pending::Nothing)
    }

    pub fn has_pending(&self) -> bool {
        let _guard = self.lock.guard();
        // SAFETY: guarded by `lock`.
        !matches!(unsafe { &*self.pending.get() }, Pending::Nothing)
    }

    /// Applies any pending change to `current`. Audio thread only.
    ///
    /// Returns `None` if the lock was busy. Never blocks, never allocates;
    /// a replaced graph goes to `retire`.
    pub(crate) fn acquire(
        &self,
        current: &mut Option<Box<PreparedGraph>>,
        retire: &RetireQueue,
        stats: &Arc<PlayerStats>,
    ) -> Option<Handoff> {
        let _guard = self.lock.try_guard()?;
        // SAFETY: guarded by `lock`.
        let pending = unsafe { &mut *self.pending.get() };
        let handoff = match std::mem::replace(pending, Pending::Nothing) {
            Pending::Nothing => Handoff::Unchanged,
            Pending::Graph(next) => {
                let nodes = next.len();
                match current.replace(next) {
                    None => Handoff::Swapped { nodes },
                    Some(old) => match retire.call_async(RetireGraph {
                        graph: old,
                        stats: Arc::clone(stats),
                    }) {
                        Ok(()) => Handoff::Swapped { nodes },
                        Err(rejected) => {
                            // Undo: keep playing the old graph.
                            if let Some(next) = current.replace(rejected.graph) {
                                *pending = Pending::Graph(next);
                            }
                            Handoff::Deferred
                        }
                    },
                }
            }
            Pending::Clear => match current.take() {
                None => Handoff::Cleared,
                Some(old) => match retire.call_async(RetireGraph {
                    graph: old,
                    stats: Arc::clone(stats),
                }) {
                    Ok(()) => Handoff::Cleared,
                    Err(rejected) => {
                        *current = Some(rejected.graph);
                        *pending = Pending::Clear;
                        Handoff::Deferred
                    }
                },
            },
        };
        Some(handoff)
    }
}

impl Drop for GraphSlot {
    fn drop(&mut self) {
        if let Pending::Graph(graph) = std::mem::replace(self.pending.get_mut(), Pending::Nothing) {
            tracing::debug!(nodes = graph.len(), "dropping unplayed graph");
        }
    }
}

impl std::fmt::Debug for GraphSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSlot")
            .field("locked", &self.lock.is_locked())
            .finish()
    }
}
