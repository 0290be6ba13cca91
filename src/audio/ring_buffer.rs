//! Lock-free single-producer / single-consumer sample buffer.
//!
//! The decode thread owns a [`SampleProducer`], the tick thread owns a
//! [`SampleConsumer`]. Neither handle is `Clone`, so the one-writer /
//! one-reader discipline is enforced by ownership.
//!
//! The producer never looks at the read cursor. When it laps the reader the
//! oldest samples are simply overwritten; the consumer notices on its next
//! read and skips forward. Samples are stored as `AtomicU32` bit patterns so a
//! read racing an overwrite is well defined; the consumer re-checks the
//! producer's claim cursor after copying and throws away anything that may
//! have been clobbered (the same read/validate scheme as a seqlock).

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

struct Shared {
    slots: Box<[AtomicU32]>,
    /// Total samples the producer has started writing.
    claim: AtomicU64,
    /// Total samples the producer has finished writing.
    write: AtomicU64,
    /// Consumer position.
    read: AtomicU64,
    /// Everything below this index was discarded by `clear`.
    floor: AtomicU64,
}

impl Shared {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Largest number of samples held at once (one slot is the sentinel).
    fn max_stored(&self) -> u64 {
        self.capacity() as u64 - 1
    }

    fn available(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self
            .read
            .load(Ordering::Acquire)
            .max(self.floor.load(Ordering::Acquire));
        write.saturating_sub(read).min(self.max_stored()) as usize
    }

    fn clear(&self) {
        let write = self.write.load(Ordering::Acquire);
        self.floor.fetch_max(write, Ordering::AcqRel);
    }
}

/// Write half of the ring buffer. Owned by the decode thread.
pub struct SampleProducer {
    shared: Arc<Shared>,
}

/// Read half of the ring buffer. Owned by the analysis/tick thread.
pub struct SampleConsumer {
    shared: Arc<Shared>,
}

/// Create a ring buffer with `capacity` slots, holding at most
/// `capacity - 1` samples.
pub fn ring_buffer(capacity: usize) -> Result<(SampleProducer, SampleConsumer)> {
    if capacity == 0 {
        return Err(Error::config("ring buffer capacity must be positive"));
    }

    let slots: Box<[AtomicU32]> = (0..capacity).map(|_| AtomicU32::new(0)).collect();
    let shared = Arc::new(Shared {
        slots,
        claim: AtomicU64::new(0),
        write: AtomicU64::new(0),
        read: AtomicU64::new(0),
        floor: AtomicU64::new(0),
    });

    Ok((
        SampleProducer {
            shared: Arc::clone(&shared),
        },
        SampleConsumer { shared },
    ))
}

impl SampleProducer {
    /// Append samples, overwriting the oldest unread data if there is not
    /// enough room. Never blocks and never allocates.
    pub fn write(&mut self, samples: &[f32]) {
        let shared = &*self.shared;
        let max_stored = shared.max_stored() as usize;
        if samples.is_empty() || max_stored == 0 {
            return;
        }

        // Only the newest `capacity - 1` samples of an oversized write survive.
        let skipped = samples.len().saturating_sub(max_stored);
        let samples = &samples[skipped..];

        let start = shared.write.load(Ordering::Relaxed) + skipped as u64;
        let end = start + samples.len() as u64;

        shared.claim.store(end, Ordering::Relaxed);
        fence(Ordering::Release);

        let capacity = shared.capacity();
        let offset = (start % capacity as u64) as usize;
        let first = samples.len().min(capacity - offset);
        let (head, tail) = samples.split_at(first);

        for (slot, &sample) in shared.slots[offset..offset + first].iter().zip(head) {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }
        for (slot, &sample) in shared.slots[..tail.len()].iter().zip(tail) {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }

        shared.write.store(end, Ordering::Release);
    }

    pub fn available(&self) -> usize {
        self.shared.available()
    }

    pub fn clear(&self) {
        self.shared.clear();
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

impl SampleConsumer {
    /// Read up to `dest.len()` of the oldest unread samples. Returns how many
    /// were copied into the front of `dest`.
    pub fn read(&mut self, dest: &mut [f32]) -> usize {
        let shared = &*self.shared;
        if dest.is_empty() {
            return 0;
        }

        let write = shared.write.load(Ordering::Acquire);
        let start = shared
            .read
            .load(Ordering::Relaxed)
            .max(shared.floor.load(Ordering::Acquire))
            .max(write.saturating_sub(shared.max_stored()));
        let count = (write - start.min(write)).min(dest.len() as u64) as usize;
        if count == 0 {
            shared.read.store(start, Ordering::Release);
            return 0;
        }

        let capacity = shared.capacity();
        let offset = (start % capacity as u64) as usize;
        let first = count.min(capacity - offset);
        let (head, tail) = dest[..count].split_at_mut(first);

        for (out, slot) in head.iter_mut().zip(&shared.slots[offset..offset + first]) {
            *out = f32::from_bits(slot.load(Ordering::Relaxed));
        }
        for (out, slot) in tail.iter_mut().zip(&shared.slots[..count - first]) {
            *out = f32::from_bits(slot.load(Ordering::Relaxed));
        }

        // Anything the producer may have started overwriting while we copied
        // is stale; drop that prefix.
        fence(Ordering::Acquire);
        let claimed = shared.claim.load(Ordering::Relaxed);
        let valid_from = claimed.saturating_sub(capacity as u64);
        let clobbered = valid_from.saturating_sub(start).min(count as u64) as usize;
        if clobbered > 0 {
            dest.copy_within(clobbered..count, 0);
        }

        shared.read.store(start + count as u64, Ordering::Release);
        count - clobbered
    }

    pub fn available(&self) -> usize {
        self.shared.available()
    }

    pub fn clear(&self) {
        self.shared.clear();
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(from: usize, to: usize) -> Vec<f32> {
        (from..to).map(|i| i as f32).collect()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            ring_buffer(0),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn reads_back_writes_in_order() {
        let (mut tx, mut rx) = ring_buffer(16).unwrap();
        tx.write(&ramp(0, 5));
        tx.write(&ramp(5, 9));
        tx.write(&ramp(9, 15));
        assert_eq!(rx.available(), 15);

        let mut out = vec![0.0; 15];
        assert_eq!(rx.read(&mut out), 15);
        assert_eq!(out, ramp(0, 15));
        assert_eq!(rx.available(), 0);
    }

    #[test]
    fn wraps_around_the_backing_storage() {
        let (mut tx, mut rx) = ring_buffer(8).unwrap();
        let mut out = vec![0.0; 8];

        tx.write(&ramp(0, 6));
        assert_eq!(rx.read(&mut out[..6]), 6);

        // Next write straddles the end of the slots.
        tx.write(&ramp(6, 12));
        assert_eq!(rx.read(&mut out), 6);
        assert_eq!(&out[..6], ramp(6, 12).as_slice());
    }

    #[test]
    fn oversized_write_keeps_newest_samples() {
        let (mut tx, mut rx) = ring_buffer(8).unwrap();
        tx.write(&ramp(0, 20));
        assert_eq!(rx.available(), 7);

        let mut out = vec![0.0; 16];
        assert_eq!(rx.read(&mut out), 7);
        assert_eq!(&out[..7], ramp(13, 20).as_slice());
    }

    #[test]
    fn overflow_across_writes_drops_oldest() {
        let (mut tx, mut rx) = ring_buffer(8).unwrap();
        tx.write(&ramp(0, 5));
        tx.write(&ramp(5, 10));
        assert_eq!(rx.available(), 7);

        let mut out = vec![0.0; 8];
        assert_eq!(rx.read(&mut out), 7);
        assert_eq!(&out[..7], ramp(3, 10).as_slice());
    }

    #[test]
    fn partial_reads_advance_cursor() {
        let (mut tx, mut rx) = ring_buffer(32).unwrap();
        tx.write(&ramp(0, 10));

        let mut out = vec![0.0; 4];
        assert_eq!(rx.read(&mut out), 4);
        assert_eq!(out, ramp(0, 4));
        assert_eq!(rx.available(), 6);
        assert_eq!(rx.read(&mut out), 4);
        assert_eq!(out, ramp(4, 8));
    }

    #[test]
    fn clear_empties_from_either_side() {
        let (mut tx, mut rx) = ring_buffer(16).unwrap();
        tx.write(&ramp(0, 10));
        tx.clear();
        assert_eq!(tx.available(), 0);
        assert_eq!(rx.available(), 0);

        tx.write(&ramp(10, 13));
        rx.clear();
        assert_eq!(rx.available(), 0);

        let mut out = vec![0.0; 4];
        assert_eq!(rx.read(&mut out), 0);

        tx.write(&ramp(13, 15));
        assert_eq!(rx.read(&mut out), 2);
        assert_eq!(&out[..2], &[13.0, 14.0]);
    }

    #[test]
    fn producer_and_consumer_on_separate_threads() {
        let (mut tx, mut rx) = ring_buffer(1024).unwrap();
        let total = 50_000usize;

        let writer = std::thread::spawn(move || {
            for chunk in ramp(0, total).chunks(100) {
                tx.write(chunk);
            }
        });

        let mut last = -1.0f32;
        let mut buf = vec![0.0; 256];
        loop {
            let done = writer.is_finished();
            let n = rx.read(&mut buf);
            for &s in &buf[..n] {
                // Data may be lost but never reordered.
                assert!(s > last, "sample {} after {}", s, last);
                last = s;
            }
            if done && n == 0 {
                break;
            }
        }
        writer.join().unwrap();
        assert_eq!(last, (total - 1) as f32);
    }
}
