//! Bounded lock-free FIFO.
//!
//! A ring of slots, each tagged with a sequence number that tells producers
//! and consumers whose turn it is to touch the slot. Producer and consumer
//! concurrency, plus the behaviour on a full or empty queue, are chosen at
//! compile time through marker types:
//!
//! | Parameter | Options |
//! |---|---|
//! | consumers `C` | [`Single`], [`Multiple`] |
//! | producers `P` | [`Single`], [`Multiple`] |
//! | full `F` | [`RejectWhenFull`], [`OverwriteOldest`] |
//! | empty `E` | [`NoneWhenEmpty`], [`DefaultWhenEmpty`] |
//!
//! Single-sided roles publish their position with a plain store; shared
//! roles claim with a compare-and-swap loop. Capacity is rounded up to a
//! power of two and never grows, so `push` and `pop` never allocate.
//!
//! Only a queue with both sides [`Multiple`] can be pushed and popped
//! through a shared reference. Any other queue is [`split`](Fifo::split)
//! into a [`Producer`] and a [`Consumer`]. A single-sided handle is `Send`
//! but neither `Sync` nor `Clone`, so at most one thread uses that side:
//!
//! ```
//! use nodeplay::fifo::SpscFifo;
//!
//! let (mut producer, mut consumer) = SpscFifo::with_capacity(4).split();
//! let writer = std::thread::spawn(move || producer.push(7u32));
//! writer.join().unwrap().unwrap();
//! assert_eq!(consumer.pop(), Some(7));
//! ```
//!
//! A single-producer queue has no shared `push`:
//!
//! ```compile_fail
//! use nodeplay::fifo::SpscFifo;
//!
//! let fifo = SpscFifo::<u32>::with_capacity(4);
//! fifo.push(1).unwrap();
//! ```
//!
//! and its producer cannot be shared between threads:
//!
//! ```compile_fail
//! use nodeplay::fifo::SpscFifo;
//! use std::sync::Arc;
//!
//! let (producer, _consumer) = SpscFifo::<u32>::with_capacity(4).split();
//! let producer = Arc::new(producer);
//! let other = Arc::clone(&producer);
//! std::thread::spawn(move || other.len());
//! ```

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mod sealed {
    pub trait Sealed {}
}

/// How many threads may use one side of the queue concurrently.
pub trait Concurrency: sealed::Sealed {
    const MULTIPLE: bool;
}

/// Exactly one thread uses this side, through a [`Producer`] or
/// [`Consumer`] handle.
#[derive(Debug)]
pub enum Single {}
/// Any number of threads use this side concurrently.
#[derive(Debug)]
pub enum Multiple {}

impl sealed::Sealed for Single {}
impl sealed::Sealed for Multiple {}
impl Concurrency for Single {
    const MULTIPLE: bool = false;
}
impl Concurrency for Multiple {
    const MULTIPLE: bool = true;
}

/// Producer behaviour when every slot is occupied.
pub trait FullPolicy: sealed::Sealed {
    const OVERWRITE: bool;
}

/// `push` hands the value back.
#[derive(Debug)]
pub enum RejectWhenFull {}
/// `push` evicts and drops the oldest element, then succeeds.
#[derive(Debug)]
pub enum OverwriteOldest {}

impl sealed::Sealed for RejectWhenFull {}
impl sealed::Sealed for OverwriteOldest {}
impl FullPolicy for RejectWhenFull {
    const OVERWRITE: bool = false;
}
impl FullPolicy for OverwriteOldest {
    const OVERWRITE: bool = true;
}

/// Consumer behaviour when there is nothing to pop.
pub trait EmptyPolicy<T> {
    fn on_empty() -> Option<T>;
}

/// `pop` returns `None`.
#[derive(Debug)]
pub enum NoneWhenEmpty {}
/// `pop` returns `Some(T::default())`.
#[derive(Debug)]
pub enum DefaultWhenEmpty {}

impl<T> EmptyPolicy<T> for NoneWhenEmpty {
    #[inline]
    fn on_empty() -> Option<T> {
        None
    }
}

impl<T: Default> EmptyPolicy<T> for DefaultWhenEmpty {
    #[inline]
    fn on_empty() -> Option<T> {
        Some(T::default())
    }
}

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded lock-free queue. See the module docs for the policy parameters.
pub struct Fifo<T, C = Single, P = Single, F = RejectWhenFull, E = NoneWhenEmpty> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    _policy: PhantomData<fn() -> (C, P, F, E)>,
}

pub type SpscFifo<T> = Fifo<T, Single, Single>;
pub type MpscFifo<T> = Fifo<T, Single, Multiple>;
pub type SpmcFifo<T> = Fifo<T, Multiple, Single>;
pub type MpmcFifo<T> = Fifo<T, Multiple, Multiple>;

// SAFETY: with both sides shared every claim is a CAS, so a slot's value is
// only touched by the thread that won it, and the Release store of the
// sequence publishes the write/read to the next owner. Values cross
// threads, so `T: Send`. Single-sided queues are only shared through the
// handles below.
unsafe impl<T: Send, F, E> Sync for Fifo<T, Multiple, Multiple, F, E> {}

impl<T, C, P, F, E> Fifo<T, C, P, F, E>
where
    C: Concurrency,
    P: Concurrency,
    F: FullPolicy,
    E: EmptyPolicy<T>,
{
    /// Eviction pops from the producer side, so overwrite mode always
    /// claims the head with a CAS.
    const SHARED_HEAD: bool = C::MULTIPLE || F::OVERWRITE;

    /// Creates a queue holding at least `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            _policy: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Approximate number of queued elements.
    pub fn len(&self) -> usize {
        self.approximate_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the queue behind a producer and a consumer handle.
    pub fn split(self) -> (Producer<T, C, P, F, E>, Consumer<T, C, P, F, E>) {
        let fifo = Arc::new(self);
        (
            Producer {
                fifo: Arc::clone(&fifo),
            },
            Consumer { fifo },
        )
    }

    /// # Safety
    /// With `P` = [`Single`] no other thread may push concurrently.
    unsafe fn push_unchecked(&self, value: T) -> Result<(), T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                let claimed = if P::MULTIPLE {
                    match self.tail.compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => true,
                        Err(current) => {
                            pos = current;
                            false
                        }
                    }
                } else {
                    self.tail.store(pos.wrapping_add(1), Ordering::Relaxed);
                    true
                };

                if claimed {
                    // SAFETY: the sequence check plus the tail claim make this
                    // thread the slot's only writer until the Release below.
                    unsafe { (*slot.value.get()).write(value) };
                    slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
            } else if diff < 0 {
                if !F::OVERWRITE {
                    return Err(value);
                }
                let head = self.head.load(Ordering::Acquire);
                if pos.wrapping_sub(head) >= self.capacity() {
                    drop(self.take_front());
                } else {
                    // A consumer has claimed the slot and is still reading it.
                    std::hint::spin_loop();
                }
                pos = self.tail.load(Ordering::Relaxed);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// # Safety
    /// With `C` = [`Single`] no other thread may pop concurrently.
    unsafe fn pop_unchecked(&self) -> Option<T> {
        self.take_front().or_else(E::on_empty)
    }

    /// Overwrite mode also calls this from the producer, which is why
    /// `SHARED_HEAD` covers it.
    fn take_front(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                let claimed = if Self::SHARED_HEAD {
                    match self.head.compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => true,
                        Err(current) => {
                            pos = current;
                            false
                        }
                    }
                } else {
                    self.head.store(pos.wrapping_add(1), Ordering::Relaxed);
                    true
                };

                if claimed {
                    // SAFETY: sequence == pos + 1 means a producer finished
                    // writing this slot, and the head claim makes this thread
                    // its only reader.
                    let value = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.sequence
                        .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                    return Some(value);
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T, F, E> Fifo<T, Multiple, Multiple, F, E>
where
    F: FullPolicy,
    E: EmptyPolicy<T>,
{
    /// Appends `value`.
    ///
    /// With [`RejectWhenFull`] a full queue returns `Err(value)`. With
    /// [`OverwriteOldest`] the oldest element is dropped to make room and
    /// this always returns `Ok`.
    pub fn push(&self, value: T) -> Result<(), T> {
        // SAFETY: both sides claim with a CAS.
        unsafe { self.push_unchecked(value) }
    }

    /// Removes the oldest element, or applies the empty policy.
    pub fn pop(&self) -> Option<T> {
        // SAFETY: both sides claim with a CAS.
        unsafe { self.pop_unchecked() }
    }
}

/// Push side of a split [`Fifo`].
///
/// `Sync` and `Clone` only when `P` is [`Multiple`].
pub struct Producer<T, C = Single, P = Single, F = RejectWhenFull, E = NoneWhenEmpty> {
    fifo: Arc<Fifo<T, C, P, F, E>>,
}

/// Pop side of a split [`Fifo`].
///
/// `Sync` and `Clone` only when `C` is [`Multiple`].
pub struct Consumer<T, C = Single, P = Single, F = RejectWhenFull, E = NoneWhenEmpty> {
    fifo: Arc<Fifo<T, C, P, F, E>>,
}

// SAFETY: moving a handle moves the right to use its side; the other side
// only meets it through the slot sequence protocol.
unsafe impl<T: Send, C, P, F, E> Send for Producer<T, C, P, F, E> {}
unsafe impl<T: Send, C, P, F, E> Send for Consumer<T, C, P, F, E> {}
// SAFETY: a shared side claims with a CAS.
unsafe impl<T: Send, C, F, E> Sync for Producer<T, C, Multiple, F, E> {}
unsafe impl<T: Send, P, F, E> Sync for Consumer<T, Multiple, P, F, E> {}

impl<T, C, F, E> Clone for Producer<T, C, Multiple, F, E> {
    fn clone(&self) -> Self {
        Self {
            fifo: Arc::clone(&self.fifo),
        }
    }
}

impl<T, P, F, E> Clone for Consumer<T, Multiple, P, F, E> {
    fn clone(&self) -> Self {
        Self {
            fifo: Arc::clone(&self.fifo),
        }
    }
}

impl<T, C, F, E> Producer<T, C, Single, F, E>
where
    C: Concurrency,
    F: FullPolicy,
    E: EmptyPolicy<T>,
{
    /// Appends `value`. See [`Fifo::push`] for the full-queue behaviour.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        // SAFETY: this handle is the only producer and `&mut` keeps it on
        // one thread for the whole call.
        unsafe { self.fifo.push_unchecked(value) }
    }
}

impl<T, C, F, E> Producer<T, C, Multiple, F, E>
where
    C: Concurrency,
    F: FullPolicy,
    E: EmptyPolicy<T>,
{
    /// Appends `value`. See [`Fifo::push`] for the full-queue behaviour.
    pub fn push(&self, value: T) -> Result<(), T> {
        // SAFETY: producers claim with a CAS.
        unsafe { self.fifo.push_unchecked(value) }
    }
}

impl<T, P, F, E> Consumer<T, Single, P, F, E>
where
    P: Concurrency,
    F: FullPolicy,
    E: EmptyPolicy<T>,
{
    /// Removes the oldest element, or applies the empty policy.
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: this handle is the only consumer. In overwrite mode the
        // producer also takes from the front, but the head is then claimed
        // with a CAS.
        unsafe { self.fifo.pop_unchecked() }
    }
}

impl<T, P, F, E> Consumer<T, Multiple, P, F, E>
where
    P: Concurrency,
    F: FullPolicy,
    E: EmptyPolicy<T>,
{
    /// Removes the oldest element, or applies the empty policy.
    pub fn pop(&self) -> Option<T> {
        // SAFETY: consumers claim with a CAS.
        unsafe { self.fifo.pop_unchecked() }
    }
}

impl<T, C, P, F, E> Producer<T, C, P, F, E> {
    pub fn capacity(&self) -> usize {
        self.fifo.mask + 1
    }

    /// Approximate number of queued elements.
    pub fn len(&self) -> usize {
        self.fifo.approximate_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, C, P, F, E> Consumer<T, C, P, F, E> {
    pub fn capacity(&self) -> usize {
        self.fifo.mask + 1
    }

    /// Approximate number of queued elements.
    pub fn len(&self) -> usize {
        self.fifo.approximate_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, C, P, F, E> fmt::Debug for Producer<T, C, P, F, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Producer").field(&self.fifo).finish()
    }
}

impl<T, C, P, F, E> fmt::Debug for Consumer<T, C, P, F, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Consumer").field(&self.fifo).finish()
    }
}

impl<T, C, P, F, E> Drop for Fifo<T, C, P, F, E> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut pos = head;
        while pos != tail {
            let slot = &mut self.slots[pos & self.mask];
            if *slot.sequence.get_mut() == pos.wrapping_add(1) {
                // SAFETY: exclusive access; the slot holds a published value
                // that no consumer has taken.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
            pos = pos.wrapping_add(1);
        }
    }
}

impl<T, C, P, F, E> Fifo<T, C, P, F, E> {
    fn approximate_len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.mask + 1)
    }
}

impl<T, C, P, F, E> fmt::Debug for Fifo<T, C, P, F, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fifo")
            .field("capacity", &(self.mask + 1))
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_to_power_of_two() {
        assert_eq!(SpscFifo::<u8>::with_capacity(0).capacity(), 1);
        assert_eq!(SpscFifo::<u8>::with_capacity(100).capacity(), 128);
        assert_eq!(SpscFifo::<u8>::with_capacity(256).capacity(), 256);
    }

    #[test]
    fn preserves_order() {
        let (mut producer, mut consumer) = SpscFifo::with_capacity(8).split();
        for i in 0..8 {
            producer.push(i).unwrap();
        }
        assert_eq!(consumer.len(), 8);
        let drained: Vec<_> = std::iter::from_fn(|| consumer.pop()).collect();
        assert_eq!(drained, (0..8).collect::<Vec<_>>());
        assert!(producer.is_empty());
    }

    #[test]
    fn reject_when_full_returns_value() {
        let fifo = MpmcFifo::with_capacity(4);
        for i in 0..4 {
            assert!(fifo.push(i).is_ok());
        }
        assert_eq!(fifo.push(99), Err(99));
        assert_eq!(fifo.pop(), Some(0));
        assert!(fifo.push(4).is_ok());
    }

    #[test]
    fn overwrite_keeps_newest() {
        let fifo: Fifo<u32, Single, Single, OverwriteOldest> = Fifo::with_capacity(4);
        let (mut producer, mut consumer) = fifo.split();
        for i in 0..10 {
            assert!(producer.push(i).is_ok());
        }
        let drained: Vec<_> = std::iter::from_fn(|| consumer.pop()).collect();
        assert_eq!(drained, vec![6, 7, 8, 9]);
    }

    #[test]
    fn default_when_empty() {
        let fifo: Fifo<f32, Single, Single, RejectWhenFull, DefaultWhenEmpty> =
            Fifo::with_capacity(2);
        let (mut producer, mut consumer) = fifo.split();
        assert_eq!(consumer.pop(), Some(0.0));
        producer.push(0.5).unwrap();
        assert_eq!(consumer.pop(), Some(0.5));
        assert_eq!(consumer.pop(), Some(0.0));
    }

    #[test]
    fn wraps_many_times() {
        let (mut producer, mut consumer) = SpscFifo::with_capacity(4).split();
        for i in 0..1_000u32 {
            producer.push(i).unwrap();
            assert_eq!(consumer.pop(), Some(i));
        }
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn shared_producers_clone_single_consumer_does_not() {
        let (producer, mut consumer) = MpscFifo::with_capacity(4).split();
        let other = producer.clone();
        producer.push(1).unwrap();
        other.push(2).unwrap();
        assert_eq!(consumer.pop(), Some(1));
        assert_eq!(consumer.pop(), Some(2));

        fn shared<T: Sync>(_: &T) {}
        shared(&producer);
    }

    #[test]
    fn drop_releases_queued_values() {
        let token = Arc::new(());
        {
            let (producer, mut consumer) = MpscFifo::with_capacity(8).split();
            for _ in 0..5 {
                producer.push(Arc::clone(&token)).unwrap();
            }
            drop(consumer.pop());
            drop(producer);
            assert_eq!(Arc::strong_count(&token), 5);
        }
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn eviction_drops_oldest_value() {
        let token = Arc::new(());
        let fifo: Fifo<Arc<()>, Single, Single, OverwriteOldest> = Fifo::with_capacity(2);
        let (mut producer, _consumer) = fifo.split();
        for _ in 0..6 {
            producer.push(Arc::clone(&token)).unwrap();
        }
        assert_eq!(Arc::strong_count(&token), 3);
    }
}
