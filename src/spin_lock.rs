//! Real-time spin lock.
//!
//! A minimal test-and-set lock meant for very short critical sections that
//! a real-time thread may contend on. The real-time side only ever calls
//! [`RealTimeSpinLock::try_lock`]; non-real-time callers may use the
//! blocking [`RealTimeSpinLock::lock`], which never sleeps but backs off with
//! CPU pause hints once its fast-retry budget is spent.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Backoff parameters for [`RealTimeSpinLock::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinConfig {
    /// Acquisition attempts made back to back before pausing.
    pub fast_retries: u32,
    /// Pause hints issued between subsequent rounds of attempts.
    pub pause_count: u32,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            fast_retries: 5,
            pause_count: 2,
        }
    }
}

/// Issues a single CPU pause hint.
#[inline]
pub fn pause() {
    std::hint::spin_loop();
}

/// Non-recursive, unfair spin lock.
#[derive(Debug, Default)]
pub struct RealTimeSpinLock {
    locked: AtomicBool,
    config: SpinConfig,
}

impl RealTimeSpinLock {
    pub fn new() -> Self {
        Self::with_config(SpinConfig::default())
    }

    pub fn with_config(config: SpinConfig) -> Self {
        Self {
            locked: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> SpinConfig {
        self.config
    }

    /// Single acquisition attempt. Returns true iff the lock was taken.
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    /// Spins until the lock is held. Not for real-time threads.
    pub fn lock(&self) {
        loop {
            for _ in 0..self.config.fast_retries.max(1) {
                if self.try_lock() {
                    return;
                }
            }
            for _ in 0..self.config.pause_count {
                pause();
            }
        }
    }

    /// Releases the lock. Must only be called by the holder.
    #[inline]
    pub fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of an unlocked RealTimeSpinLock");
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// RAII form of [`try_lock`](Self::try_lock).
    pub fn try_guard(&self) -> Option<SpinGuard<'_>> {
        self.try_lock().then_some(SpinGuard { lock: self })
    }

    /// RAII form of [`lock`](Self::lock).
    pub fn guard(&self) -> SpinGuard<'_> {
        self.lock();
        SpinGuard { lock: self }
    }
}

/// Releases the owning [`RealTimeSpinLock`] on drop.
#[derive(Debug)]
pub struct SpinGuard<'a> {
    lock: &'a RealTimeSpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
