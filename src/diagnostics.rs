//! RT-safe diagnostics for the real-time playback path.
//!
//! Two tiers:
//! - **RT side**: the audio thread records what happened as small `Copy`
//!   events in a lock-free queue.
//! - **Control side**: the controller drains the queue, logs through
//!   `tracing`, and tests check which events were seen.
//!
//! RT code **records facts**. Non-RT code **judges** them.
//!
//! The queue overwrites its oldest entry when full, so a control thread that
//! stops draining never stalls the audio thread; it only loses history.
//!
//! [`diagnostic_queue`] hands out one [`DiagnosticRecorder`] and one
//! [`DiagnosticReceiver`]. Neither is `Sync` or `Clone`, so each side of
//! the queue has exactly one owner.

use crate::fifo::{Consumer, Fifo, OverwriteOldest, Producer, Single};

/// Something the audio thread observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticEvent {
    /// A pending graph was swapped in.
    GraphSwapped { nodes: u32 },
    /// The installed graph was removed.
    GraphCleared,
    /// The retire queue was full, so the swap waits for a later block.
    SwapDeferred,
    /// The graph handoff lock was busy; the block was silent.
    BlockContended,
    /// A block was requested with no graph installed.
    NoGraph,
    /// A block crossed the loop end and was processed in two parts.
    LoopSplit { first_frames: u32 },
}

impl DiagnosticEvent {
    /// Stable identifier, for counting.
    pub const fn kind(&self) -> DiagnosticKind {
        match self {
            Self::GraphSwapped { .. } => DiagnosticKind::GraphSwapped,
            Self::GraphCleared => DiagnosticKind::GraphCleared,
            Self::SwapDeferred => DiagnosticKind::SwapDeferred,
            Self::BlockContended => DiagnosticKind::BlockContended,
            Self::NoGraph => DiagnosticKind::NoGraph,
            Self::LoopSplit { .. } => DiagnosticKind::LoopSplit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DiagnosticKind {
    GraphSwapped = 0,
    GraphCleared = 1,
    SwapDeferred = 2,
    BlockContended = 3,
    NoGraph = 4,
    LoopSplit = 5,
}

impl DiagnosticKind {
    pub const COUNT: usize = 6;

    /// Human-readable name (for diagnostics only).
    pub const fn name(self) -> &'static str {
        match self {
            Self::GraphSwapped => "GRAPH_SWAPPED",
            Self::GraphCleared => "GRAPH_CLEARED",
            Self::SwapDeferred => "SWAP_DEFERRED",
            Self::BlockContended => "BLOCK_CONTENDED",
            Self::NoGraph => "NO_GRAPH",
            Self::LoopSplit => "LOOP_SPLIT",
        }
    }
}

type EventFifo = Fifo<DiagnosticEvent, Single, Single, OverwriteOldest>;

/// Creates a queue holding the latest `capacity` events.
pub fn diagnostic_queue(capacity: usize) -> (DiagnosticRecorder, DiagnosticReceiver) {
    let (producer, consumer) = EventFifo::with_capacity(capacity.max(1)).split();
    (
        DiagnosticRecorder { producer },
        DiagnosticReceiver { consumer },
    )
}

/// Audio-thread end of a [`diagnostic_queue`].
pub struct DiagnosticRecorder {
    producer: Producer<DiagnosticEvent, Single, Single, OverwriteOldest>,
}

impl DiagnosticRecorder {
    /// Records an event from the RT path.
    ///
    /// # RT Safety
    /// - No allocation
    /// - No locking
    /// - No panics
    /// - If the queue is full the oldest event is dropped
    #[inline]
    pub fn record(&mut self, event: DiagnosticEvent) {
        // Overwrite mode never rejects.
        let _ = self.producer.push(event);
    }

    pub fn capacity(&self) -> usize {
        self.producer.capacity()
    }
}

/// Control-thread end of a [`diagnostic_queue`].
pub struct DiagnosticReceiver {
    consumer: Consumer<DiagnosticEvent, Single, Single, OverwriteOldest>,
}

impl DiagnosticReceiver {
    /// Drains all pending events, oldest first.
    pub fn drain(&mut self) -> Vec<DiagnosticEvent> {
        let mut events = Vec::with_capacity(self.consumer.len());
        while let Some(event) = self.consumer.pop() {
            events.push(event);
        }
        events
    }

    pub fn pending(&self) -> usize {
        self.consumer.len()
    }
}

impl std::fmt::Debug for DiagnosticRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticRecorder")
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl std::fmt::Debug for DiagnosticReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticReceiver")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Counts occurrences of each event kind.
pub fn count_events(events: &[DiagnosticEvent]) -> [usize; DiagnosticKind::COUNT] {
    let mut counts = [0usize; DiagnosticKind::COUNT];
    for event in events {
        counts[event.kind() as usize] += 1;
    }
    counts
}

/// Logs drained events. Repeated contention is summarised in one line.
pub fn log_events(events: &[DiagnosticEvent]) {
    let counts = count_events(events);
    for event in events {
        match *event {
            DiagnosticEvent::GraphSwapped { nodes } => {
                tracing::debug!(nodes, "audio thread swapped in new graph")
            }
            DiagnosticEvent::GraphCleared => tracing::debug!("audio thread cleared graph"),
            DiagnosticEvent::SwapDeferred => {
                tracing::warn!("graph swap deferred: retire queue full, call collect_garbage more often")
            }
            DiagnosticEvent::LoopSplit { first_frames } => {
                tracing::trace!(first_frames, "block split at loop end")
            }
            DiagnosticEvent::BlockContended | DiagnosticEvent::NoGraph => {}
        }
    }
    let contended = counts[DiagnosticKind::BlockContended as usize];
    if contended > 0 {
        tracing::warn!(blocks = contended, "blocks silenced by graph handoff contention");
    }
    let empty = counts[DiagnosticKind::NoGraph as usize];
    if empty > 0 {
        tracing::trace!(blocks = empty, "blocks requested with no graph");
    }
}

/// Contract verification: asserts that required event kinds were recorded.
///
/// # Panics
/// Panics if any required kind was not recorded at least once.
#[cfg(any(test, feature = "ppt"))]
pub fn contract_test_rt(contract_name: &str, events: &[DiagnosticEvent], required: &[DiagnosticKind]) {
    let counts = count_events(events);
    let missing: Vec<&str> = required
        .iter()
        .filter(|kind| counts[**kind as usize] == 0)
        .map(|kind| kind.name())
        .collect();

    if !missing.is_empty() {
        let present: Vec<&str> = events.iter().map(|e| e.kind().name()).collect();
        panic!(
            "RT Contract '{}' missing events: {:?}. Present: {:?}",
            contract_name, missing, present
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_roundtrip() {
        let (mut recorder, mut receiver) = diagnostic_queue(8);
        recorder.record(DiagnosticEvent::GraphSwapped { nodes: 3 });
        recorder.record(DiagnosticEvent::BlockContended);
        recorder.record(DiagnosticEvent::GraphSwapped { nodes: 4 });
        assert_eq!(receiver.pending(), 3);

        assert_eq!(
            receiver.drain(),
            vec![
                DiagnosticEvent::GraphSwapped { nodes: 3 },
                DiagnosticEvent::BlockContended,
                DiagnosticEvent::GraphSwapped { nodes: 4 },
            ]
        );
        assert!(receiver.drain().is_empty());
    }

    #[test]
    fn test_count_events() {
        let events = [
            DiagnosticEvent::NoGraph,
            DiagnosticEvent::NoGraph,
            DiagnosticEvent::SwapDeferred,
        ];
        let counts = count_events(&events);
        assert_eq!(counts[DiagnosticKind::NoGraph as usize], 2);
        assert_eq!(counts[DiagnosticKind::SwapDeferred as usize], 1);
        assert_eq!(counts[DiagnosticKind::GraphSwapped as usize], 0);
    }

    #[test]
    fn test_contract_passes_when_events_present() {
        let events = [DiagnosticEvent::GraphSwapped { nodes: 1 }, DiagnosticEvent::GraphCleared];
        contract_test_rt(
            "swap then clear",
            &events,
            &[DiagnosticKind::GraphSwapped, DiagnosticKind::GraphCleared],
        );
    }

    #[test]
    #[should_panic(expected = "missing events")]
    fn test_contract_fails_when_events_missing() {
        let events = [DiagnosticEvent::GraphCleared];
        contract_test_rt("swap", &events, &[DiagnosticKind::GraphSwapped]);
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let (mut recorder, mut receiver) = diagnostic_queue(4);
        for first_frames in 0..10 {
            recorder.record(DiagnosticEvent::LoopSplit { first_frames });
        }
        let events = receiver.drain();
        assert_eq!(events.len(), 4);
        assert_eq!(events[3], DiagnosticEvent::LoopSplit { first_frames: 9 });
    }

    #[test]
    fn test_recorder_moves_to_another_thread() {
        let (mut recorder, mut receiver) = diagnostic_queue(64);
        std::thread::spawn(move || {
            for nodes in 0..32 {
                recorder.record(DiagnosticEvent::GraphSwapped { nodes });
            }
        })
        .join()
        .unwrap();
        let events = receiver.drain();
        assert_eq!(events.len(), 32);
        assert_eq!(events[31], DiagnosticEvent::GraphSwapped { nodes: 31 });
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(DiagnosticKind::SwapDeferred.name(), "SWAP_DEFERRED");
        assert_eq!(DiagnosticEvent::LoopSplit { first_frames: 2 }.kind().name(), "LOOP_SPLIT");
    }
}
