//! Sequence-lock publish cell.
//!
//! [`SeqLockCell`] lets one writer publish a plain-old-data value that any
//! number of readers can snapshot without blocking. Readers never observe a
//! half-written value: a read that overlaps a write is detected through the
//! sequence counter and rejected (or retried by [`SeqLockCell::load`]).
//!
//! The value is held as individual atomic bytes so concurrent reads and
//! writes are data-race free. `T: Pod` guarantees any byte pattern the
//! reader assembles is a valid `T`, even one that is later discarded.

#![forbid(unsafe_code)]

use bytemuck::Pod;
use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct SeqLockCell<T: Pod> {
    seq: AtomicUsize,
    bytes: Box<[AtomicU8]>,
    _marker: PhantomData<T>,
}

impl<T: Pod> SeqLockCell<T> {
    pub fn new(value: T) -> Self {
        let bytes = bytemuck::bytes_of(&value)
            .iter()
            .map(|&b| AtomicU8::new(b))
            .collect();
        Self {
            seq: AtomicUsize::new(0),
            bytes,
            _marker: PhantomData,
        }
    }

    /// Publishes `value`.
    ///
    /// Only one thread may call this at a time; wrap the cell in a
    /// [`SharedSeqLockCell`] when there are several writers.
    pub fn store(&self, value: T) {
        let seq = self.seq.load(Ordering::Relaxed);
        debug_assert!(seq & 1 == 0, "concurrent SeqLockCell writers");
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        for (dst, &src) in self.bytes.iter().zip(bytemuck::bytes_of(&value)) {
            dst.store(src, Ordering::Relaxed);
        }

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Single snapshot attempt.
    ///
    /// Returns `None` if a write was in progress or completed during the
    /// read. Never blocks.
    pub fn try_load(&self) -> Option<T> {
        let before = self.seq.load(Ordering::Acquire);
        if before & 1 != 0 {
            return None;
        }

        let mut value = T::zeroed();
        for (dst, src) in bytemuck::bytes_of_mut(&mut value).iter_mut().zip(self.bytes.iter()) {
            *dst = src.load(Ordering::Relaxed);
        }

        fence(Ordering::Acquire);
        let after = self.seq.load(Ordering::Relaxed);
        (before == after).then_some(value)
    }

    /// Spins on [`try_load`](Self::try_load) until a consistent snapshot is
    /// read. Bounded by the writer's store duration.
    pub fn load(&self) -> T {
        loop {
            if let Some(value) = self.try_load() {
                return value;
            }
            std::hint::spin_loop();
        }
    }

    /// Number of completed stores.
    pub fn version(&self) -> usize {
        self.seq.load(Ordering::Acquire) / 2
    }
}

impl<T: Pod + Default> Default for SeqLockCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Pod + std::fmt::Debug> std::fmt::Debug for SeqLockCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeqLockCell")
            .field("value", &self.try_load())
            .finish()
    }
}

/// [`SeqLockCell`] with writers serialised by a mutex.
///
/// Reads stay lock-free and real-time safe; only writers take the mutex,
/// so writers must be non-real-time threads.
#[derive(Debug)]
pub struct SharedSeqLockCell<T: Pod> {
    cell: SeqLockCell<T>,
    writer: Mutex<()>,
}

impl<T: Pod> SharedSeqLockCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: SeqLockCell::new(value),
            writer: Mutex::new(()),
        }
    }

    pub fn store(&self, value: T) {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        self.cell.store(value);
    }

    /// Read-modify-write under the writer mutex.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> T {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut value = self.cell.load();
        f(&mut value);
        self.cell.store(value);
        value
    }

    pub fn try_load(&self) -> Option<T> {
        self.cell.try_load()
    }

    pub fn load(&self) -> T {
        self.cell.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        sample: i64,
        speed: f64,
    }

    #[test]
    fn store_then_load() {
        let cell = SeqLockCell::new(Position { sample: 0, speed: 1.0 });
        cell.store(Position { sample: 48_000, speed: 0.5 });
        assert_eq!(cell.load(), Position { sample: 48_000, speed: 0.5 });
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn try_load_rejects_odd_sequence() {
        let cell = SeqLockCell::new(7u32);
        cell.seq.store(1, Ordering::Relaxed);
        assert_eq!(cell.try_load(), None);
        cell.seq.store(2, Ordering::Relaxed);
        assert_eq!(cell.try_load(), Some(7));
    }

    #[test]
    fn shared_cell_update_is_serialised() {
        let cell = std::sync::Arc::new(SharedSeqLockCell::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cell = std::sync::Arc::clone(&cell);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        cell.update(|v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cell.load(), 4_000);
    }
}
