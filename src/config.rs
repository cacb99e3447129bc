//! Player configuration.
//!
//! Plain data with serde support so hosts can keep it in their own config
//! files. Every field has a default; a partial TOML table is fine.

#![forbid(unsafe_code)]

use crate::spin_lock::SpinConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How threads find the next node to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Per-node pending-input counters feed a shared ready queue.
    #[default]
    DependencyQueue,
    /// Threads scan the node list and claim ready nodes with an atomic flag.
    Scan,
}

/// What idle worker threads do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Pause, then yield, then sleep in short steps. Lowest wake latency.
    #[default]
    Spin,
    /// Pause, then yield, then block on a condition variable with a
    /// timeout until the audio thread starts a block.
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Worker threads helping the audio thread. 0 processes every node on
    /// the audio thread.
    pub num_threads: usize,
    pub scheduling: SchedulingMode,
    pub wait_strategy: WaitStrategy,
    /// Idle iterations spent issuing CPU pause hints.
    pub spin_count: u32,
    /// Idle iterations (after spinning) spent yielding the thread.
    pub yield_count: u32,
    /// Upper bound on a single idle sleep or condition-variable wait.
    pub wait_timeout_ms: u64,
    /// Graphs awaiting destruction off the audio thread.
    pub retire_queue_capacity: usize,
    /// Diagnostic events buffered between drains.
    pub diagnostics_capacity: usize,
    pub spin_lock: SpinConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            scheduling: SchedulingMode::default(),
            wait_strategy: WaitStrategy::default(),
            spin_count: 50,
            yield_count: 50,
            wait_timeout_ms: 1,
            retire_queue_capacity: 16,
            diagnostics_capacity: 64,
            spin_lock: SpinConfig::default(),
        }
    }
}

impl PlayerConfig {
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_scheduling(mut self, scheduling: SchedulingMode) -> Self {
        self.scheduling = scheduling;
        self
    }

    pub fn with_wait_strategy(mut self, wait_strategy: WaitStrategy) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    /// Thread count that leaves one core for the audio thread.
    pub fn recommended_threads() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(0)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_methods() {
        let config = PlayerConfig::default()
            .with_threads(3)
            .with_scheduling(SchedulingMode::Scan)
            .with_wait_strategy(WaitStrategy::Hybrid);
        assert_eq!(config.num_threads, 3);
        assert_eq!(config.scheduling, SchedulingMode::Scan);
        assert_eq!(config.wait_strategy, WaitStrategy::Hybrid);
        assert_eq!(config.wait_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: PlayerConfig = toml::from_str(
            r#"
            num_threads = 4
            scheduling = "scan"

            [spin_lock]
            fast_retries = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.num_threads, 4);
        assert_eq!(config.scheduling, SchedulingMode::Scan);
        assert_eq!(config.wait_strategy, WaitStrategy::Spin);
        assert_eq!(config.spin_lock.fast_retries, 10);
        assert_eq!(config.spin_lock.pause_count, 2);
        assert_eq!(config.retire_queue_capacity, 16);
    }
}
