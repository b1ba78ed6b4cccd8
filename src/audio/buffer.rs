//! Lock-free overwrite-oldest ring buffer for PCM data
//!
//! This implements a single-producer single-consumer (SPSC) ring buffer that
//! decouples network arrival timing from audio-device pull timing.
//!
//! Capacity is always a power of two so slot lookup is a bitmask, and the
//! occupancy is the wrapping difference of two monotonically increasing `u32`
//! counters. There is no "full vs empty" flag: `write - read == 0` is empty,
//! `write - read == capacity` is full.
//!
//! Overflow never blocks the producer. When the buffer is full, every pushed
//! item first evicts the oldest unread item by advancing `read_index`.
//! Because both sides may advance `read_index`, the consumer commits a fetch
//! with a compare-exchange and retries if the producer evicted underneath it.
//!
//! # Preconditions
//!
//! At most one thread pushes and at most one (possibly different) thread
//! fetches at any time. A push must not be interleaved with another push.
//! [`Producer`] and [`Consumer`] enforce this through `&mut self`.

use crossbeam::utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicI16, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::RingError;

/// Smallest accepted capacity exponent (capacity 4)
pub const MIN_CAPACITY_EXPONENT: u32 = 2;

/// Largest accepted capacity exponent (capacity 65536)
pub const MAX_CAPACITY_EXPONENT: u32 = 16;

mod sealed {
    pub trait Sealed {}
}

/// Fixed-width item that can be stored in a [`RingBuffer`].
///
/// Each slot is an atomic cell so a slot that is being evicted and rewritten
/// by the producer can be read concurrently by the consumer without a data
/// race; the consumer then discards the read when its commit fails.
pub trait Sample: Copy + Default + Send + Sync + 'static + sealed::Sealed {
    #[doc(hidden)]
    type Slot: Send + Sync;

    #[doc(hidden)]
    fn empty_slot() -> Self::Slot;

    #[doc(hidden)]
    fn store(slot: &Self::Slot, value: Self);

    #[doc(hidden)]
    fn load(slot: &Self::Slot) -> Self;
}

macro_rules! impl_sample {
    ($ty:ty, $atomic:ty) => {
        impl sealed::Sealed for $ty {}

        impl Sample for $ty {
            type Slot = $atomic;

            #[inline]
            fn empty_slot() -> Self::Slot {
                <$atomic>::new(0)
            }

            #[inline]
            fn store(slot: &Self::Slot, value: Self) {
                slot.store(value, Ordering::Release);
            }

            #[inline]
            fn load(slot: &Self::Slot) -> Self {
                slot.load(Ordering::Acquire)
            }
        }
    };
}

impl_sample!(u8, AtomicU8);
impl_sample!(u16, AtomicU16);
impl_sample!(i16, AtomicI16);

/// Fixed-capacity circular store of fixed-width items
pub struct RingBuffer<T: Sample> {
    slots: Box<[T::Slot]>,
    capacity: u32,
    mask: u32,
    /// Next logical index to fetch. Advanced by the consumer and, on overflow, by the producer.
    read_index: CachePadded<AtomicU32>,
    /// Next logical index to write. Advanced by the producer only.
    write_index: CachePadded<AtomicU32>,
    /// Items evicted by overwrite-oldest
    dropped: AtomicU64,
}

impl<T: Sample> RingBuffer<T> {
    /// Create a buffer holding `2^capacity_exponent` items.
    ///
    /// Fails with [`RingError::InvalidCapacity`] unless the exponent is within `2..=16`.
    pub fn create(capacity_exponent: u32) -> Result<Self, RingError> {
        Self::with_start_index(capacity_exponent, 0)
    }

    fn with_start_index(capacity_exponent: u32, start: u32) -> Result<Self, RingError> {
        if !(MIN_CAPACITY_EXPONENT..=MAX_CAPACITY_EXPONENT).contains(&capacity_exponent) {
            return Err(RingError::InvalidCapacity {
                exponent: capacity_exponent,
            });
        }

        let capacity = 1u32 << capacity_exponent;
        let slots = (0..capacity).map(|_| T::empty_slot()).collect();

        Ok(Self {
            slots,
            capacity,
            mask: capacity - 1,
            read_index: CachePadded::new(AtomicU32::new(start)),
            write_index: CachePadded::new(AtomicU32::new(start)),
            dropped: AtomicU64::new(0),
        })
    }

    /// Split into producer and consumer halves sharing this buffer
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        let ring = Arc::new(self);
        (
            Producer { ring: ring.clone() },
            Consumer { ring },
        )
    }

    #[inline]
    fn slot(&self, index: u32) -> &T::Slot {
        &self.slots[(index & self.mask) as usize]
    }

    /// Append all `items`, evicting the oldest unread item for every item
    /// pushed while the buffer is full. Never fails and never blocks.
    ///
    /// Returns the number of items pushed, always `items.len()`.
    /// Must only be called from the single producer thread.
    pub fn push(&self, items: &[T]) -> usize {
        let mut write = self.write_index.load(Ordering::Relaxed);

        for &item in items {
            self.evict_if_full(write);
            T::store(self.slot(write), item);
            write = write.wrapping_add(1);
            self.write_index.store(write, Ordering::Release);
        }

        items.len()
    }

    fn evict_if_full(&self, write: u32) {
        let mut read = self.read_index.load(Ordering::Acquire);

        while write.wrapping_sub(read) >= self.capacity {
            match self.read_index.compare_exchange_weak(
                read,
                read.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(current) => read = current,
            }
        }
    }

    /// Pop up to `out.len()` items in FIFO order into `out`.
    ///
    /// Stops early when fewer items are available; the tail of `out` is left
    /// untouched. Returns the number of items fetched.
    /// Must only be called from the single consumer thread.
    pub fn fetch(&self, out: &mut [T]) -> usize {
        let backoff = Backoff::new();

        loop {
            let read = self.read_index.load(Ordering::Acquire);
            let write = self.write_index.load(Ordering::Acquire);
            let available = write.wrapping_sub(read);

            if available > self.capacity {
                // Producer lapped our snapshot of read_index; reload.
                backoff.spin();
                continue;
            }

            let count = (available as usize).min(out.len());
            if count == 0 {
                return 0;
            }

            for (offset, dst) in out[..count].iter_mut().enumerate() {
                *dst = T::load(self.slot(read.wrapping_add(offset as u32)));
            }

            if self
                .read_index
                .compare_exchange(
                    read,
                    read.wrapping_add(count as u32),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return count;
            }

            // Some of what we copied was evicted and possibly rewritten.
            backoff.spin();
        }
    }

    /// Number of items currently held
    pub fn len(&self) -> usize {
        let read = self.read_index.load(Ordering::Acquire);
        let write = self.write_index.load(Ordering::Acquire);
        write.wrapping_sub(read).min(self.capacity) as usize
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Check if buffer is full
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Check if at least one more item fits without eviction
    pub fn has_free_space(&self) -> bool {
        self.len() < self.capacity()
    }

    /// Items discarded by overwrite-oldest since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }
}

impl<T: Sample> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("read_index", &self.read_index.load(Ordering::Relaxed))
            .field("write_index", &self.write_index.load(Ordering::Relaxed))
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Writing half of a split [`RingBuffer`]
#[derive(Debug)]
pub struct Producer<T: Sample> {
    ring: Arc<RingBuffer<T>>,
}

impl<T: Sample> Producer<T> {
    /// See [`RingBuffer::push`]
    pub fn push(&mut self, items: &[T]) -> usize {
        self.ring.push(items)
    }

    /// Read-only view for progress display
    pub fn monitor(&self) -> RingMonitor<T> {
        RingMonitor {
            ring: self.ring.clone(),
        }
    }
}

/// Reading half of a split [`RingBuffer`]
#[derive(Debug)]
pub struct Consumer<T: Sample> {
    ring: Arc<RingBuffer<T>>,
}

impl<T: Sample> Consumer<T> {
    /// See [`RingBuffer::fetch`]
    pub fn fetch(&mut self, out: &mut [T]) -> usize {
        self.ring.fetch(out)
    }

    /// Read-only view for progress display
    pub fn monitor(&self) -> RingMonitor<T> {
        RingMonitor {
            ring: self.ring.clone(),
        }
    }
}

/// Cloneable read-only handle exposing occupancy of a split buffer
#[derive(Debug)]
pub struct RingMonitor<T: Sample> {
    ring: Arc<RingBuffer<T>>,
}

impl<T: Sample> Clone for RingMonitor<T> {
    fn clone(&self) -> Self {
        Self {
            ring: self.ring.clone(),
        }
    }
}

impl<T: Sample> RingMonitor<T> {
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.ring.dropped()
    }

    pub fn fill_level(&self) -> f32 {
        self.ring.fill_level()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Deterministic xorshift bytes
    fn noise(len: usize, mut state: u32) -> Vec<u8> {
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    #[test]
    fn test_capacity_validity() {
        for exponent in 0..=20 {
            let result = RingBuffer::<u8>::create(exponent);
            if (2..=16).contains(&exponent) {
                assert_eq!(result.unwrap().capacity(), 1 << exponent);
            } else {
                assert_eq!(
                    result.unwrap_err(),
                    RingError::InvalidCapacity { exponent }
                );
            }
        }
    }

    #[test]
    fn test_overwrite_oldest_small() {
        let ring = RingBuffer::<u8>::create(2).unwrap();

        assert_eq!(ring.push(&[0, 1, 2, 3]), 4);
        assert_eq!(ring.len(), 4);
        assert!(ring.is_full());
        assert!(!ring.has_free_space());

        assert_eq!(ring.push(&[4, 5]), 2);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.dropped(), 2);

        let mut out = [0u8; 4];
        assert_eq!(ring.fetch(&mut out), 4);
        assert_eq!(out, [2, 3, 4, 5]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_overwrite_rotation_full_size() {
        let ring = RingBuffer::<u8>::create(16).unwrap();
        let data = noise(65536, 0x9E37_79B9);

        ring.push(&data);
        ring.push(&data[..32768]);

        let mut out = vec![0u8; 65536];
        assert_eq!(ring.fetch(&mut out), 65536);
        assert_eq!(&out[..32768], &data[32768..]);
        assert_eq!(&out[32768..], &data[..32768]);
    }

    #[test]
    fn test_partial_fetch() {
        let ring = RingBuffer::<u8>::create(4).unwrap();
        ring.push(&[7, 8, 9]);

        let mut out = [0xAAu8; 8];
        assert_eq!(ring.fetch(&mut out), 3);
        assert_eq!(&out[..3], &[7, 8, 9]);
        assert_eq!(&out[3..], &[0xAA; 5]);
        assert!(ring.is_empty());
        assert_eq!(ring.fetch(&mut out), 0);
    }

    #[test]
    fn test_counter_wraparound() {
        let ring = RingBuffer::<u8>::with_start_index(3, u32::MAX - 2).unwrap();
        ring.push(&[1, 2, 3, 4, 5]);
        assert_eq!(ring.len(), 5);

        let mut out = [0u8; 2];
        assert_eq!(ring.fetch(&mut out), 2);
        assert_eq!(out, [1, 2]);

        ring.push(&[6, 7, 8, 9, 10, 11]);
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.dropped(), 1);

        let mut out = [0u8; 8];
        assert_eq!(ring.fetch(&mut out), 8);
        assert_eq!(out, [4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_i16_samples() {
        let ring = RingBuffer::<i16>::create(3).unwrap();
        ring.push(&[-32768, -1, 0, 1, 32767]);

        let mut out = [0i16; 5];
        assert_eq!(ring.fetch(&mut out), 5);
        assert_eq!(out, [-32768, -1, 0, 1, 32767]);
    }

    #[test]
    fn test_split_threads_preserve_order() {
        let (mut producer, mut consumer) = RingBuffer::<u16>::create(6).unwrap().split();
        let monitor = producer.monitor();

        let writer = thread::spawn(move || {
            let values: Vec<u16> = (0..50_000).collect();
            for chunk in values.chunks(37) {
                producer.push(chunk);
            }
        });

        let mut received = Vec::new();
        let mut out = [0u16; 50];
        loop {
            let n = consumer.fetch(&mut out);
            received.extend_from_slice(&out[..n]);
            if writer.is_finished() && consumer.monitor().is_empty() {
                break;
            }
        }
        writer.join().unwrap();

        // Drops are allowed, reordering is not.
        assert!(received.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(received.last(), Some(&49_999));
        assert_eq!(received.len() as u64 + monitor.dropped(), 50_000);
    }
}
