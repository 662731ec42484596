//! Lock-free single-producer single-consumer sample ring.
//!
//! One ring per output leg carries resampled samples from a player's file
//! worker to the realtime callback. Head and tail are monotonic counters
//! reduced modulo the capacity on access; the tail only ever moves on the
//! producer thread and the head only on the consumer thread, so a release
//! store on one side paired with an acquire load on the other is enough to
//! publish the copied samples.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct SampleRing {
    buf: Box<[UnsafeCell<f32>]>,
    /// Read counter, advanced only by the consumer.
    head: AtomicUsize,
    /// Write counter, advanced only by the producer.
    tail: AtomicUsize,
}

// The unsafe cells are only written through `write` (producer side) and only
// read through `read`/`peek` (consumer side), and the head/tail counters keep
// those ranges disjoint.
unsafe impl Send for SampleRing {}
unsafe impl Sync for SampleRing {}

impl SampleRing {
    /// Allocate a ring holding `capacity` samples. The backing store is
    /// locked into physical memory on unix so the realtime consumer never
    /// takes a page fault on it; failure to lock is logged and ignored.
    pub fn new(capacity: usize) -> Self {
        let buf: Box<[UnsafeCell<f32>]> =
            (0..capacity.max(1)).map(|_| UnsafeCell::new(0.0)).collect();
        #[cfg(unix)]
        {
            let bytes = buf.len() * std::mem::size_of::<f32>();
            let rc = unsafe { libc::mlock(buf.as_ptr().cast(), bytes) };
            if rc != 0 {
                tracing::debug!(bytes, "mlock failed; ring memory stays pageable");
            }
        }
        SampleRing {
            buf,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Samples ready for the consumer.
    pub fn available_to_read(&self) -> usize {
        self.tail.load(Ordering::Acquire) - self.head.load(Ordering::Acquire)
    }

    /// Free space on the producer side.
    pub fn available_to_write(&self) -> usize {
        self.buf.len() - self.available_to_read()
    }

    pub fn is_empty(&self) -> bool {
        self.available_to_read() == 0
    }

    /// Append up to `samples.len()` samples, returning how many fit.
    /// Producer side only.
    pub fn write(&self, samples: &[f32]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let free = self.buf.len() - (tail - self.head.load(Ordering::Acquire));
        let n = samples.len().min(free);
        self.copy_in(tail, &samples[..n]);
        self.tail.store(tail + n, Ordering::Release);
        n
    }

    /// Pop up to `out.len()` samples into `out`, returning how many were
    /// copied. Consumer side only.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let n = self.copy_out(head, out);
        self.head.store(head + n, Ordering::Release);
        n
    }

    /// Copy up to `out.len()` samples without consuming them.
    /// Consumer side only.
    pub fn peek(&self, out: &mut [f32]) -> usize {
        self.copy_out(self.head.load(Ordering::Relaxed), out)
    }

    /// Discard everything currently readable. Consumer side only: the head
    /// jumps to the tail observed here, which is always a position the
    /// producer has finished writing.
    pub fn reset(&self) {
        self.head
            .store(self.tail.load(Ordering::Acquire), Ordering::Release);
    }

    fn copy_in(&self, start: usize, samples: &[f32]) {
        let cap = self.buf.len();
        let idx = start % cap;
        let first = samples.len().min(cap - idx);
        for (i, &s) in samples[..first].iter().enumerate() {
            unsafe { *self.buf[idx + i].get() = s };
        }
        for (i, &s) in samples[first..].iter().enumerate() {
            unsafe { *self.buf[i].get() = s };
        }
    }

    fn copy_out(&self, start: usize, out: &mut [f32]) -> usize {
        let avail = self.tail.load(Ordering::Acquire) - start;
        let n = out.len().min(avail);
        let cap = self.buf.len();
        let idx = start % cap;
        let first = n.min(cap - idx);
        for (i, s) in out[..first].iter_mut().enumerate() {
            *s = unsafe { *self.buf[idx + i].get() };
        }
        for (i, s) in out[first..n].iter_mut().enumerate() {
            *s = unsafe { *self.buf[i].get() };
        }
        n
    }
}

#[cfg(unix)]
impl Drop for SampleRing {
    fn drop(&mut self) {
        let bytes = self.buf.len() * std::mem::size_of::<f32>();
        unsafe { libc::munlock(self.buf.as_ptr().cast(), bytes) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn write_then_read_round_trips() {
        let ring = SampleRing::new(8);
        assert_eq!(ring.write(&[1.0, 2.0, 3.0]), 3);
        assert_eq!(ring.available_to_read(), 3);
        let mut out = [0.0f32; 3];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(out, [1.0, 2.0, 3.0]);
        assert!(ring.is_empty());
    }

    #[test]
    fn wrap_around_preserves_order() {
        let ring = SampleRing::new(8);
        assert_eq!(ring.write(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]), 6);
        let mut out = [0.0f32; 4];
        assert_eq!(ring.read(&mut out), 4);
        // Crosses the physical end of the buffer.
        assert_eq!(ring.write(&[6.0, 7.0, 8.0, 9.0, 10.0]), 5);
        let mut rest = [0.0f32; 7];
        assert_eq!(ring.read(&mut rest), 7);
        assert_eq!(rest, [4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn write_stops_at_capacity() {
        let ring = SampleRing::new(4);
        assert_eq!(ring.write(&[1.0; 6]), 4);
        assert_eq!(ring.available_to_write(), 0);
        assert_eq!(ring.write(&[2.0]), 0);
        let mut out = [0.0f32; 2];
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(ring.write(&[2.0; 6]), 2);
    }

    #[test]
    fn peek_does_not_consume() {
        let ring = SampleRing::new(8);
        ring.write(&[1.0, 2.0]);
        let mut out = [0.0f32; 2];
        assert_eq!(ring.peek(&mut out), 2);
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(ring.available_to_read(), 2);
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(out, [1.0, 2.0]);
    }

    #[test]
    fn reset_discards_pending_samples() {
        let ring = SampleRing::new(8);
        ring.write(&[1.0; 5]);
        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.available_to_write(), 8);
        ring.write(&[9.0]);
        let mut out = [0.0f32];
        assert_eq!(ring.read(&mut out), 1);
        assert_eq!(out[0], 9.0);
    }

    #[test]
    fn two_threads_transfer_in_order() {
        let ring = Arc::new(SampleRing::new(64));
        let barrier = Arc::new(Barrier::new(2));
        const TOTAL: usize = 10_000;

        let producer = {
            let ring = Arc::clone(&ring);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut next = 0usize;
                while next < TOTAL {
                    let chunk: Vec<f32> = (next..(next + 17).min(TOTAL))
                        .map(|i| i as f32)
                        .collect();
                    let wrote = ring.write(&chunk);
                    next += wrote;
                    if wrote == 0 {
                        thread::yield_now();
                    }
                }
            })
        };

        barrier.wait();
        let mut seen = 0usize;
        let mut buf = [0.0f32; 23];
        while seen < TOTAL {
            let n = ring.read(&mut buf);
            for &s in &buf[..n] {
                assert_eq!(s, seen as f32);
                seen += 1;
            }
            if n == 0 {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
    }
}
