//! Bounded ring channel feeding the durability worker.
//!
//! A fixed-capacity circular buffer with one slot reserved for empty
//! detection. Senders block while the ring is full, the (single) receiver
//! blocks while it is empty; `try_recv` lets the worker drain a batch
//! without sleeping between messages.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::error::{Error, Result};

struct Ring<T> {
    buf: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

pub(crate) struct Channel<T> {
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be nonzero");
        Channel {
            ring: Mutex::new(Ring {
                buf: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Blocking send. Fails once the channel is closed.
    pub fn send(&self, value: T) -> Result<()> {
        let mut ring = self.ring.lock().map_err(|_| Error::WorkerGone)?;
        while ring.buf.len() == ring.capacity {
            if ring.closed {
                return Err(Error::WorkerGone);
            }
            ring = self.not_full.wait(ring).map_err(|_| Error::WorkerGone)?;
        }
        if ring.closed {
            return Err(Error::WorkerGone);
        }
        let was_empty = ring.buf.is_empty();
        ring.buf.push_back(value);
        if was_empty {
            self.not_empty.notify_one();
        }
        Ok(())
    }

    /// Blocking receive. Returns `None` once closed and drained.
    pub fn recv(&self) -> Option<T> {
        let mut ring = self.ring.lock().ok()?;
        loop {
            if let Some(v) = ring.buf.pop_front() {
                if ring.buf.len() + 1 == ring.capacity {
                    self.not_full.notify_all();
                }
                return Some(v);
            }
            if ring.closed {
                return None;
            }
            ring = self.not_empty.wait(ring).ok()?;
        }
    }

    /// Non-blocking receive for batch draining.
    pub fn try_recv(&self) -> Option<T> {
        let mut ring = self.ring.lock().ok()?;
        let v = ring.buf.pop_front();
        if v.is_some() && ring.buf.len() + 1 == ring.capacity {
            self.not_full.notify_all();
        }
        v
    }

    /// Close the channel; wakes every blocked sender and the receiver.
    pub fn close(&self) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.closed = true;
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn send_recv_in_order() {
        let ch = Channel::new(4);
        ch.send(1u32).unwrap();
        ch.send(2).unwrap();
        assert_eq!(ch.recv(), Some(1));
        assert_eq!(ch.try_recv(), Some(2));
        assert_eq!(ch.try_recv(), None);
    }

    #[test]
    fn full_channel_blocks_until_drained() {
        let ch = Arc::new(Channel::new(2));
        ch.send(10u32).unwrap();
        ch.send(11).unwrap();
        let tx = ch.clone();
        let h = std::thread::spawn(move || tx.send(12));
        // The sender can only finish after we make room.
        assert_eq!(ch.recv(), Some(10));
        h.join().unwrap().unwrap();
        assert_eq!(ch.recv(), Some(11));
        assert_eq!(ch.recv(), Some(12));
    }

    #[test]
    fn close_unblocks_receiver() {
        let ch = Arc::new(Channel::<u32>::new(1));
        let rx = ch.clone();
        let h = std::thread::spawn(move || rx.recv());
        ch.close();
        assert_eq!(h.join().unwrap(), None);
    }

    #[test]
    fn send_after_close_fails() {
        let ch = Channel::new(1);
        ch.close();
        assert!(matches!(ch.send(1u32), Err(Error::WorkerGone)));
    }
}
