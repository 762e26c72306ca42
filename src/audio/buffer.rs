//! Lock-free ring buffer for audio data

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free single-producer single-consumer byte ring buffer
///
/// The producer only ever moves `head`, the consumer only ever moves `tail`.
/// Each side publishes its index with a release store and observes the other
/// side's index with an acquire load, so bytes written before a published
/// `head` are visible to the consumer that loads it. One slot stays empty to
/// tell full from empty, so at most `CAPACITY - 1` bytes are buffered.
///
/// The two roles are handed out as [`Producer`] and [`Consumer`] handles; at
/// most one of each exists at a time.
pub struct RingBuffer<const CAPACITY: usize> {
    storage: Box<[UnsafeCell<u8>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    producer_claimed: AtomicBool,
    consumer_claimed: AtomicBool,
    dropped: AtomicU64,
}

// SAFETY: storage is only written by the unique Producer in the free region
// and only read by the unique Consumer in the filled region. The index
// handshake (release store / acquire load) orders those accesses.
unsafe impl<const CAPACITY: usize> Sync for RingBuffer<CAPACITY> {}
unsafe impl<const CAPACITY: usize> Send for RingBuffer<CAPACITY> {}

impl<const CAPACITY: usize> RingBuffer<CAPACITY> {
    const MASK: usize = CAPACITY - 1;
    const VALID: () = assert!(
        CAPACITY >= 2 && CAPACITY.is_power_of_two(),
        "ring buffer capacity must be a power of two"
    );

    /// Create an empty ring buffer
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID;

        Self {
            storage: (0..CAPACITY).map(|_| UnsafeCell::new(0)).collect(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            producer_claimed: AtomicBool::new(false),
            consumer_claimed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Total slots, including the reserved one
    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Bytes ready to be read (snapshot)
    pub fn available(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & Self::MASK
    }

    /// Bytes that can be written (snapshot)
    pub fn space(&self) -> usize {
        CAPACITY - 1 - self.available()
    }

    /// Total bytes discarded because the buffer was full
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Claim the producer role
    ///
    /// Returns `None` while another producer handle is alive.
    pub fn producer(self: &Arc<Self>) -> Option<Producer<CAPACITY>> {
        self.producer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Producer { ring: Arc::clone(self) })
    }

    /// Claim the consumer role
    ///
    /// Returns `None` while another consumer handle is alive.
    pub fn consumer(self: &Arc<Self>) -> Option<Consumer<CAPACITY>> {
        self.consumer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Consumer { ring: Arc::clone(self) })
    }

    /// Discard all buffered bytes
    ///
    /// Only allowed while no producer or consumer handle exists, i.e. once the
    /// owning stream is fully stopped. Returns `false` (and leaves the buffer
    /// untouched) otherwise.
    pub fn clear(&self) -> bool {
        if self.producer_claimed.load(Ordering::Acquire)
            || self.consumer_claimed.load(Ordering::Acquire)
        {
            return false;
        }
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        true
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < CAPACITY);
        // UnsafeCell<u8> has the same layout as u8, so the cells form one
        // contiguous byte run.
        unsafe { UnsafeCell::raw_get(self.storage.as_ptr().add(index)) }
    }

    fn push(&self, data: &[u8], count_dropped: bool) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let free = tail.wrapping_sub(head).wrapping_sub(1) & Self::MASK;
        let count = data.len().min(free);

        let first = count.min(CAPACITY - head);
        // SAFETY: [head, head + count) is free space owned by the producer;
        // the consumer will not touch it until head is published below.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.slot_ptr(head), first);
            if count > first {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first),
                    self.slot_ptr(0),
                    count - first,
                );
            }
        }

        self.head.store((head + count) & Self::MASK, Ordering::Release);

        if count_dropped && count < data.len() {
            self.dropped
                .fetch_add((data.len() - count) as u64, Ordering::Relaxed);
        }
        count
    }

    fn pop(&self, buf: &mut [u8]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let filled = head.wrapping_sub(tail) & Self::MASK;
        let count = buf.len().min(filled);

        let first = count.min(CAPACITY - tail);
        // SAFETY: [tail, tail + count) was published by the producer's
        // release store of head, observed by the acquire load above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_ptr(tail), buf.as_mut_ptr(), first);
            if count > first {
                std::ptr::copy_nonoverlapping(
                    self.slot_ptr(0),
                    buf.as_mut_ptr().add(first),
                    count - first,
                );
            }
        }

        self.tail.store((tail + count) & Self::MASK, Ordering::Release);
        count
    }
}

impl<const CAPACITY: usize> Default for RingBuffer<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

/// Write side of a [`RingBuffer`]
pub struct Producer<const CAPACITY: usize> {
    ring: Arc<RingBuffer<CAPACITY>>,
}

impl<const CAPACITY: usize> Producer<CAPACITY> {
    /// Write as many bytes as currently fit
    ///
    /// Never blocks and never allocates. Bytes that do not fit are discarded
    /// and counted in [`RingBuffer::dropped_bytes`].
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.ring.push(data, true)
    }

    /// Like [`write`](Self::write), but the caller keeps the remainder and
    /// retries, so nothing is counted as dropped
    pub fn write_partial(&mut self, data: &[u8]) -> usize {
        self.ring.push(data, false)
    }

    pub fn space(&self) -> usize {
        self.ring.space()
    }

    pub fn ring(&self) -> &Arc<RingBuffer<CAPACITY>> {
        &self.ring
    }
}

impl<const CAPACITY: usize> Drop for Producer<CAPACITY> {
    fn drop(&mut self) {
        self.ring.producer_claimed.store(false, Ordering::Release);
    }
}

/// Read side of a [`RingBuffer`]
pub struct Consumer<const CAPACITY: usize> {
    ring: Arc<RingBuffer<CAPACITY>>,
}

impl<const CAPACITY: usize> Consumer<CAPACITY> {
    /// Read up to `buf.len()` bytes; never blocks
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.ring.pop(buf)
    }

    pub fn available(&self) -> usize {
        self.ring.available()
    }

    pub fn ring(&self) -> &Arc<RingBuffer<CAPACITY>> {
        &self.ring
    }
}

impl<const CAPACITY: usize> Drop for Consumer<CAPACITY> {
    fn drop(&mut self) {
        self.ring.consumer_claimed.store(false, Ordering::Release);
    }
}
