//! Bounded byte queues.
//!
//! Power-of-two rings with producer/consumer indexes. Writes and reads
//! are partial and never block; the usable capacity is one less than
//! the ring size. Each side can carry a notify hook, run outside the
//! ring lock: a virtual interrupt toward a guest consumer/producer, or
//! a driver callback for character devices.

use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::guest::Guest;
use crate::intr::vpic;

/// A queue notify target.
#[derive(Clone)]
pub enum Notify {
    /// Assert a vpic interrupt in a guest.
    Vint { guest: Weak<Guest>, irq: usize },
    /// Call into a driver (chardev kick).
    Hook(Arc<dyn Fn() + Send + Sync>),
}

impl Notify {
    fn fire(&self) {
        match self {
            Notify::Vint { guest, irq } => {
                if let Some(g) = guest.upgrade() {
                    vpic::assert_vint(&g, *irq);
                }
            }
            Notify::Hook(f) => f(),
        }
    }
}

struct Ring {
    buf: Vec<u8>,
    prod: usize,
    cons: usize,
}

pub struct Queue {
    ring: Mutex<Ring>,
    /// Fired after data is written (consumer side wakes).
    pub data_avail: Mutex<Option<Notify>>,
    /// Fired after data is read (producer side wakes).
    pub space_avail: Mutex<Option<Notify>>,
}

impl Queue {
    /// `size` must be a power of two.
    pub fn new(size: usize) -> Arc<Queue> {
        debug_assert!(size.is_power_of_two());
        Arc::new(Queue {
            ring: Mutex::new(Ring { buf: vec![0; size], prod: 0, cons: 0 }),
            data_avail: Mutex::new(None),
            space_avail: Mutex::new(None),
        })
    }

    pub fn size(&self) -> usize {
        self.ring.lock().buf.len()
    }

    /// Bytes waiting to be read.
    pub fn avail(&self) -> usize {
        let r = self.ring.lock();
        r.prod.wrapping_sub(r.cons) & (r.buf.len() - 1)
    }

    /// Bytes that can still be written.
    pub fn space(&self) -> usize {
        let r = self.ring.lock();
        r.buf.len() - 1 - (r.prod.wrapping_sub(r.cons) & (r.buf.len() - 1))
    }

    pub fn is_empty(&self) -> bool {
        self.avail() == 0
    }

    /// Write up to `buf.len()` bytes; returns the count actually
    /// written. Never blocks.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut r = self.ring.lock();
        let size = r.buf.len();
        let used = r.prod.wrapping_sub(r.cons) & (size - 1);
        let n = buf.len().min(size - 1 - used);

        for &b in &buf[..n] {
            let prod = r.prod;
            r.buf[prod & (size - 1)] = b;
            r.prod = prod.wrapping_add(1);
        }
        n
    }

    /// Read up to `buf.len()` bytes; with `peek` the consumer index is
    /// left in place.
    pub fn read(&self, buf: &mut [u8], peek: bool) -> usize {
        let mut r = self.ring.lock();
        let size = r.buf.len();
        let used = r.prod.wrapping_sub(r.cons) & (size - 1);
        let n = buf.len().min(used);

        for (i, slot) in buf[..n].iter_mut().enumerate() {
            *slot = r.buf[r.cons.wrapping_add(i) & (size - 1)];
        }
        if !peek {
            r.cons = r.cons.wrapping_add(n);
        }
        n
    }

    /// Run the consumer-side hook (after a successful write).
    pub fn notify_consumer(&self) {
        let hook = self.data_avail.lock().clone();
        if let Some(hook) = hook {
            hook.fire();
        }
    }

    /// Run the producer-side hook (after a successful read).
    pub fn notify_producer(&self) {
        let hook = self.space_avail.lock().clone();
        if let Some(hook) = hook {
            hook.fire();
        }
    }

    pub fn set_data_avail(&self, n: Option<Notify>) {
        *self.data_avail.lock() = n;
    }

    pub fn set_space_avail(&self, n: Option<Notify>) {
        *self.space_avail.lock() = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_capacity_is_size_minus_one() {
        let q = Queue::new(16);
        assert_eq!(q.space(), 15);
        assert_eq!(q.write(&[0xab; 20]), 15);
        assert_eq!(q.space(), 0);
        assert_eq!(q.avail(), 15);
    }

    #[test]
    fn test_partial_write_then_read() {
        let q = Queue::new(8);
        assert_eq!(q.write(b"abcdefghij"), 7);

        let mut buf = [0u8; 4];
        assert_eq!(q.read(&mut buf, false), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(q.avail(), 3);

        // freed space is writable again (wraparound)
        assert_eq!(q.write(b"wxyz"), 4);
        let mut rest = [0u8; 16];
        let n = q.read(&mut rest, false);
        assert_eq!(&rest[..n], b"efgwxyz");
    }

    #[test]
    fn test_peek_leaves_data() {
        let q = Queue::new(8);
        q.write(b"abc");
        let mut buf = [0u8; 3];
        assert_eq!(q.read(&mut buf, true), 3);
        assert_eq!(q.avail(), 3);
        assert_eq!(q.read(&mut buf, false), 3);
        assert_eq!(q.avail(), 0);
    }

    #[test]
    fn test_exact_fit_boundary() {
        // n bytes with exactly n free succeeds completely; n-1 free
        // writes n-1
        let q = Queue::new(16);
        q.write(&[0; 10]);
        let mut sink = [0u8; 10];
        q.read(&mut sink, false);

        q.write(&[0; 10]); // leaves 5 free
        assert_eq!(q.space(), 5);
        assert_eq!(q.write(b"hello"), 5);

        let q2 = Queue::new(16);
        q2.write(&[0; 11]);
        assert_eq!(q2.space(), 4);
        assert_eq!(q2.write(b"hello"), 4);
    }

    #[test]
    fn test_notify_hooks() {
        let q = Queue::new(8);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        q.set_data_avail(Some(Notify::Hook(Arc::new(move || {
            f.fetch_add(1, Ordering::Relaxed);
        }))));

        q.write(b"x");
        q.notify_consumer();
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        // producer side unset: no-op
        q.notify_producer();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }
}
