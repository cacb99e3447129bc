//! Deferred calls from real-time threads.
//!
//! Real-time code posts work it must not do itself (freeing memory, logging,
//! anything that may block) into an [`AsyncCaller`]. A non-real-time thread
//! later runs everything that was posted by calling
//! [`AsyncCaller::process`].

use crate::fifo::MpmcFifo;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Work that can be posted to an [`AsyncCaller`].
///
/// Every `FnOnce() + Send + 'static` closure is `Deferred`. Implementing it
/// on a named type lets real-time code defer work without boxing a closure.
pub trait Deferred: Send + 'static {
    fn invoke(self);
}

impl<F> Deferred for F
where
    F: FnOnce() + Send + 'static,
{
    fn invoke(self) {
        self()
    }
}

/// Multi-producer, single-runner queue of deferred calls.
///
/// The caller is shared between threads, so the queue claims both ends with
/// a CAS; `running` keeps calls in post order by letting one runner drain
/// at a time.
pub struct AsyncCaller<D: Deferred = Box<dyn FnOnce() + Send>> {
    queue: MpmcFifo<D>,
    running: AtomicBool,
}

impl<D: Deferred> AsyncCaller<D> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: MpmcFifo::with_capacity(capacity),
            running: AtomicBool::new(false),
        }
    }

    /// Posts `call`. Never blocks; a full queue hands the call back.
    pub fn call_async(&self, call: D) -> Result<(), D> {
        self.queue.push(call)
    }

    /// Runs every queued call in order on the current thread.
    ///
    /// Returns true if anything ran. Concurrent `process` calls are not
    /// allowed; a second caller returns false without running anything.
    pub fn process(&self) -> bool {
        if self.running.swap(true, Ordering::Acquire) {
            debug_assert!(false, "AsyncCaller::process called concurrently");
            return false;
        }

        let mut ran = false;
        while let Some(call) = self.queue.pop() {
            call.invoke();
            ran = true;
        }

        self.running.store(false, Ordering::Release);
        ran
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl<D: Deferred> fmt::Debug for AsyncCaller<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCaller")
            .field("pending", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}
