//! Worker threads that help the audio thread process a block.
//!
//! Workers never own a graph. The audio thread publishes a pointer to the
//! graph it is processing in [`WorkerShared::active`] and retracts it when
//! the block is done. Workers announce themselves in `in_flight` before
//! reading the pointer, and the audio thread waits for `in_flight` to drop
//! to zero after retracting it. Both sides use `SeqCst` so either the worker
//! sees the retraction or the audio thread sees the worker.

// Worker threads may log and sleep; code called from the audio thread may
// not. The split is marked per function.

use crate::config::{PlayerConfig, SchedulingMode, WaitStrategy};
use crate::error::PlayerError;
use crate::plan::PreparedGraph;
use crate::spin_lock::pause;
use crate::stats::PlayerStats;
use crossbeam::utils::Backoff;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// State shared by the audio thread and the workers.
pub(crate) struct WorkerShared {
    active: AtomicPtr<PreparedGraph>,
    in_flight: AtomicUsize,
    num_workers: AtomicUsize,
    scheduling: SchedulingMode,
    stats: Arc<PlayerStats>,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl WorkerShared {
    pub(crate) fn new(scheduling: SchedulingMode, stats: Arc<PlayerStats>) -> Self {
        Self {
            active: AtomicPtr::new(ptr::null_mut()),
            in_flight: AtomicUsize::new(0),
            num_workers: AtomicUsize::new(0),
            scheduling,
            stats,
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn scheduling(&self) -> SchedulingMode {
        self.scheduling
    }

    pub(crate) fn stats(&self) -> &Arc<PlayerStats> {
        &self.stats
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.num_workers.load(Ordering::Acquire)
    }

    /// Opens `graph` to the workers. Audio thread.
    ///
    /// # Safety
    /// `graph` must stay alive and `begin_block` must have run until
    /// [`retract`](Self::retract) returns.
    pub(crate) unsafe fn publish(&self, graph: &PreparedGraph, wake_sleepers: bool) {
        self.active
            .store(graph as *const PreparedGraph as *mut PreparedGraph, Ordering::SeqCst);
        if wake_sleepers {
            // Never blocks; a waiter that misses this wakes on its timeout.
            self.wake.notify_all();
        }
    }

    /// Closes the graph to workers and waits until none are using it.
    /// Audio thread; the wait is bounded by one node's processing time.
    pub(crate) fn retract(&self) {
        self.active.store(ptr::null_mut(), Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            backoff.spin();
        }
    }

    /// Processes nodes of the active graph until none can be claimed.
    /// Returns `None` if no block is active.
    fn help(&self) -> Option<bool> {
        if self.active.load(Ordering::Relaxed).is_null() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let graph = self.active.load(Ordering::SeqCst);
        let result = if graph.is_null() {
            None
        } else {
            // SAFETY: non-null and counted in `in_flight`, so the audio
            // thread keeps it alive and between `begin_block` and the end of
            // the block until we decrement.
            let graph = unsafe { &*graph };
            let mut processed_any = false;
            while !graph.is_block_complete() {
                // SAFETY: see above.
                if !unsafe { graph.process_next_free_node(self.scheduling, &self.stats) } {
                    break;
                }
                processed_any = true;
            }
            Some(processed_any)
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn is_block_active(&self) -> bool {
        !self.active.load(Ordering::Acquire).is_null()
    }
}

#[derive(Debug, Clone, Copy)]
struct WaitConfig {
    strategy: WaitStrategy,
    spin_count: u32,
    yield_count: u32,
    timeout: Duration,
}

impl WaitConfig {
    fn from_config(config: &PlayerConfig) -> Self {
        Self {
            strategy: config.wait_strategy,
            spin_count: config.spin_count,
            yield_count: config.yield_count,
            timeout: config.wait_timeout(),
        }
    }

    /// One idle step for a worker that has been idle for `idle` steps.
    fn idle(&self, shared: &WorkerShared, idle: u32) {
        if idle < self.spin_count {
            pause();
        } else if idle < self.spin_count.saturating_add(self.yield_count) {
            thread::yield_now();
        } else {
            match self.strategy {
                WaitStrategy::Spin => thread::sleep(self.timeout),
                WaitStrategy::Hybrid => {
                    let Ok(guard) = shared.wake_lock.lock() else {
                        thread::sleep(self.timeout);
                        return;
                    };
                    let _ = shared
                        .wake
                        .wait_timeout_while(guard, self.timeout, |_| !shared.is_block_active());
                }
            }
        }
    }
}

fn worker_loop(shared: Arc<WorkerShared>, exit: Arc<AtomicBool>, wait: WaitConfig) {
    let mut idle = 0u32;
    while !exit.load(Ordering::Acquire) {
        match shared.help() {
            Some(true) => idle = 0,
            // Mid-block: inputs still running elsewhere. Stay hot.
            Some(false) => pause(),
            None => {
                wait.idle(&shared, idle);
                idle = idle.saturating_add(1);
            }
        }
    }
}

/// Threads helping one parallel player. Owned by the control side.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    workers: Vec<JoinHandle<()>>,
    exit: Arc<AtomicBool>,
    wait: WaitConfig,
}

impl WorkerPool {
    pub(crate) fn new(shared: Arc<WorkerShared>, config: &PlayerConfig) -> Self {
        Self {
            shared,
            workers: Vec::new(),
            exit: Arc::new(AtomicBool::new(false)),
            wait: WaitConfig::from_config(config),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Replaces the workers with `num_threads` new ones. 0 stops them all;
    /// the audio thread then processes every node itself.
    pub fn set_num_threads(&mut self, num_threads: usize) -> Result<(), PlayerError> {
        if num_threads == self.workers.len() {
            return Ok(());
        }
        self.stop();

        let exit = Arc::new(AtomicBool::new(false));
        for index in 0..num_threads {
            let shared = Arc::clone(&self.shared);
            let worker_exit = Arc::clone(&exit);
            let wait = self.wait;
            let spawned = thread::Builder::new()
                .name(format!("nodeplay-worker-{index}"))
                .spawn(move || worker_loop(shared, worker_exit, wait));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(err) => {
                    tracing::error!(index, error = %err, "failed to spawn worker");
                    self.exit = exit;
                    self.publish_count();
                    return Err(PlayerError::ThreadSpawn(err));
                }
            }
        }
        self.exit = exit;
        self.publish_count();
        tracing::info!(threads = num_threads, strategy = ?self.wait.strategy, "workers started");
        Ok(())
    }

    fn publish_count(&self) {
        self.shared.num_workers.store(self.workers.len(), Ordering::Release);
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.num_workers.store(0, Ordering::Release);
        self.exit.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        let count = self.workers.len();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker panicked");
            }
        }
        tracing::info!(threads = count, "workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.workers.len())
            .field("strategy", &self.wait.strategy)
            .finish()
    }
}
