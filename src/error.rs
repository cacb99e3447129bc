//! Error types for graph building and player setup.
//!
//! Only non-real-time operations return these. The real-time path reports
//! through [`BlockOutcome`](crate::player::BlockOutcome) and counters.

use crate::node::NodeId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("node {0:?} does not exist in this builder")]
    InvalidNode(NodeId),

    #[error("cycle detected through node {0:?}")]
    CycleDetected(NodeId),

    #[error("block size must be non-zero")]
    InvalidBlockSize,

    #[error("sample rate must be positive and finite, got {0}")]
    InvalidSampleRate(f64),
}

/// Worker pool failures. Graph problems are reported as [`GraphError`] by
/// the calls that prepare graphs.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}
