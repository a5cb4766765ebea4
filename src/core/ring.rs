//! Fixed-capacity SPMC ring queue. One producer lane, any number of readers.
//!
//! No locking inside the queue: producer and readers are kept apart by group
//! barriers. Slots are atomic words and `head`/`size` share one state word, so a
//! reader always sees a consistent pair.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Cache-line aligned wrapper to prevent false sharing.
#[repr(align(64))]
pub struct CachePadded<T>(pub T);

impl<T> CachePadded<T> {
    pub const fn new(val: T) -> Self {
        Self(val)
    }
}

impl<T> core::ops::Deref for CachePadded<T> {
    type Target = T;
    #[inline(always)]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> core::ops::DerefMut for CachePadded<T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// A value that fits in one queue slot.
pub trait SlotValue: Copy {
    fn into_word(self) -> u64;
    fn from_word(word: u64) -> Self;
}

macro_rules! impl_slot_value {
    ($($t:ty => $via:ty),* $(,)?) => {
        $(
            impl SlotValue for $t {
                #[inline(always)]
                fn into_word(self) -> u64 {
                    self as $via as u64
                }

                #[inline(always)]
                fn from_word(word: u64) -> Self {
                    word as $via as $t
                }
            }
        )*
    };
}

impl_slot_value!(
    u8 => u8,
    u16 => u16,
    u32 => u32,
    u64 => u64,
    usize => usize,
    i32 => u32,
    i64 => u64,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueError {
    /// Queue at capacity. Nothing was written.
    Full = 1,
    /// Asked to pop more than is live. Nothing was removed.
    Underflow = 2,
    /// Another producer handle is alive.
    ProducerTaken = 3,
}

#[inline(always)]
const fn pack(head: usize, size: usize) -> u64 {
    ((head as u64) << 32) | size as u64
}

#[inline(always)]
const fn unpack(state: u64) -> (usize, usize) {
    ((state >> 32) as usize, (state & 0xFFFF_FFFF) as usize)
}

/// Circular buffer of `N` slots. Logical element `i` lives at `(N + head - size + i) % N`.
pub struct RingQueue<T: SlotValue, const N: usize> {
    slots: [AtomicU64; N],
    state: CachePadded<AtomicU64>,
    producer_claimed: AtomicBool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SlotValue, const N: usize> RingQueue<T, N> {
    const _ASSERT_CAPACITY: () = {
        assert!(N > 0 && N <= u32::MAX as usize, "N must be non-zero and fit in 32 bits");
    };

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::_ASSERT_CAPACITY;
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: AtomicU64 = AtomicU64::new(0);
        Self {
            slots: [EMPTY; N],
            state: CachePadded::new(AtomicU64::new(0)),
            producer_claimed: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    fn snapshot(&self) -> (usize, usize) {
        unpack(self.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    const fn slot_of(head: usize, size: usize, i: usize) -> usize {
        (N + head - size + i) % N
    }

    // Single writer of `state`: the producer handle or `&mut self`.
    #[inline]
    fn push_inner(&self, value: T) -> Result<(), QueueError> {
        let (head, size) = self.snapshot();
        if size == N {
            return Err(QueueError::Full);
        }
        self.slots[head].store(value.into_word(), Ordering::Relaxed);
        self.state.store(pack((head + 1) % N, size + 1), Ordering::Release);
        Ok(())
    }

    #[inline]
    fn pop_inner(&self, n: usize) -> Result<(), QueueError> {
        let (head, size) = self.snapshot();
        if n > size {
            return Err(QueueError::Underflow);
        }
        self.state.store(pack(head, size - n), Ordering::Release);
        Ok(())
    }

    /// Append at the write slot. A full queue rejects the value and keeps its contents.
    #[inline]
    pub fn push(&mut self, value: T) -> Result<(), QueueError> {
        self.push_inner(value)
    }

    /// Discard the oldest element.
    #[inline]
    pub fn pop(&mut self) -> Result<(), QueueError> {
        self.pop_inner(1)
    }

    /// Discard the `n` oldest elements, or nothing if fewer are live.
    /// Storage is not cleared, only the bookkeeping moves.
    #[inline]
    pub fn pop_n(&mut self, n: usize) -> Result<(), QueueError> {
        self.pop_inner(n)
    }

    /// The `i`-th oldest live element. `None` past the end.
    #[inline]
    pub fn front(&self, i: usize) -> Option<T> {
        let (head, size) = self.snapshot();
        if i >= size {
            return None;
        }
        let word = self.slots[Self::slot_of(head, size, i)].load(Ordering::Relaxed);
        Some(T::from_word(word))
    }

    /// The most recently pushed live element.
    #[inline]
    pub fn back(&self) -> Option<T> {
        let (head, size) = self.snapshot();
        if size == 0 {
            return None;
        }
        let word = self.slots[(N + head - 1) % N].load(Ordering::Relaxed);
        Some(T::from_word(word))
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.snapshot().1
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Claim the producer role. At most one handle lives at a time.
    pub fn producer(&self) -> Result<Producer<'_, T, N>, QueueError> {
        self.producer_claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| QueueError::ProducerTaken)?;
        Ok(Producer { ring: self })
    }

    /// Read-only view. Any number of lanes may hold one.
    #[inline(always)]
    pub fn consumer(&self) -> Consumer<'_, T, N> {
        Consumer { ring: self }
    }
}

impl<T: SlotValue, const N: usize> Default for RingQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The one lane allowed to mutate the queue.
pub struct Producer<'a, T: SlotValue, const N: usize> {
    ring: &'a RingQueue<T, N>,
}

impl<'a, T: SlotValue, const N: usize> Producer<'a, T, N> {
    #[inline]
    pub fn push(&self, value: T) -> Result<(), QueueError> {
        self.ring.push_inner(value)
    }

    #[inline]
    pub fn pop(&self) -> Result<(), QueueError> {
        self.ring.pop_inner(1)
    }

    #[inline]
    pub fn pop_n(&self, n: usize) -> Result<(), QueueError> {
        self.ring.pop_inner(n)
    }

    /// Pop until empty. Returns how many elements were discarded.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while self.ring.pop_inner(1).is_ok() {
            drained += 1;
        }
        drained
    }

    #[inline(always)]
    pub fn back(&self) -> Option<T> {
        self.ring.back()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }
}

impl<'a, T: SlotValue, const N: usize> Drop for Producer<'a, T, N> {
    fn drop(&mut self) {
        self.ring.producer_claimed.store(false, Ordering::Release);
    }
}

/// Read side. Cheap to copy into every lane.
pub struct Consumer<'a, T: SlotValue, const N: usize> {
    ring: &'a RingQueue<T, N>,
}

impl<'a, T: SlotValue, const N: usize> Clone for Consumer<'a, T, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: SlotValue, const N: usize> Copy for Consumer<'a, T, N> {}

impl<'a, T: SlotValue, const N: usize> Consumer<'a, T, N> {
    #[inline(always)]
    pub fn front(&self, i: usize) -> Option<T> {
        self.ring.front(i)
    }

    #[inline(always)]
    pub fn back(&self) -> Option<T> {
        self.ring.back()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        N
    }
}
