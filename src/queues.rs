//! Ring stages (spec §4.4) — `SampleQueue`, `CompressedQueue`, `CommandQueue`.
//!
//! Grounded on the teacher's `rpc::channels` module: fixed-capacity,
//! `try_send`-drops-when-full, bounded shapes. The teacher backs these with
//! `embassy_sync::channel::Channel`, which requires a single-threaded async
//! executor; EcoWatt's nine tasks are real OS threads, so the same bounded
//! shape is rebuilt on `std::sync::{Mutex, Condvar}` over a fixed-capacity
//! `heapless::Deque`.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A fixed-capacity, multi-producer/multi-consumer queue with a
/// non-blocking `try_send` (drops on full, caller counts the drop as a
/// miss) and a blocking `recv` with optional timeout.
pub struct BoundedQueue<T, const N: usize> {
    inner: Mutex<heapless::Deque<T, N>>,
    cv: Condvar,
}

impl<T, const N: usize> BoundedQueue<T, N> {
    pub fn new() -> Self {
        Self { inner: Mutex::new(heapless::Deque::new()), cv: Condvar::new() }
    }

    /// Non-blocking send; returns the item back if the queue is full.
    pub fn try_send(&self, item: T) -> Result<(), T> {
        let mut guard = self.inner.lock().unwrap();
        match guard.push_back(item) {
            Ok(()) => {
                self.cv.notify_one();
                Ok(())
            }
            Err(item) => Err(item),
        }
    }

    /// Block until an item is available, with no timeout. This is the one
    /// intentionally unbounded wait in the system (spec §5: Compression's
    /// receive from `SampleQueue`, bounded in practice by producer rate).
    pub fn recv_blocking(&self) -> T {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(item) = guard.pop_front() {
                return item;
            }
            guard = self.cv.wait(guard).unwrap();
        }
    }

    /// Non-blocking drain of everything currently queued, in FIFO order.
    pub fn drain_all(&self) -> heapless::Vec<T, N> {
        let mut guard = self.inner.lock().unwrap();
        let mut out = heapless::Vec::new();
        while let Some(item) = guard.pop_front() {
            if out.push(item).is_err() {
                break;
            }
        }
        out
    }

    /// Non-blocking receive with a bounded timeout (0-timeout loop per
    /// spec §4.7's Uploader drain).
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut guard = self.inner.lock().unwrap();
                if let Some(item) = guard.pop_front() {
                    return Some(item);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, const N: usize> Default for BoundedQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Capacities chosen to hold a few cycles of backlog without unbounded
/// growth, matching the teacher's `CMD_CHANNEL`/`RESP_CHANNEL` sizing style.
pub const SAMPLE_QUEUE_CAPACITY: usize = 8;
pub const COMPRESSED_QUEUE_CAPACITY: usize = 16;
pub const COMMAND_QUEUE_CAPACITY: usize = 8;

use crate::compression::CompressedPacket;
use crate::sample::Sample;

pub type SampleQueue = BoundedQueue<Sample, SAMPLE_QUEUE_CAPACITY>;
pub type CompressedQueue = BoundedQueue<CompressedPacket, COMPRESSED_QUEUE_CAPACITY>;

/// Opaque queued command record (spec §4.4: "opaque command records").
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub id: heapless::String<32>,
    pub kind: CommandKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    SetPowerPercent(u8),
    SetPowerWatts(u32, u32), // (watts, rated_capacity_watts)
    ReadStats,
    ResetCounters,
}

pub type CommandQueue = BoundedQueue<CommandRecord, COMMAND_QUEUE_CAPACITY>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_send_drops_when_full() {
        let q: BoundedQueue<u32, 2> = BoundedQueue::new();
        assert!(q.try_send(1).is_ok());
        assert!(q.try_send(2).is_ok());
        assert_eq!(q.try_send(3), Err(3));
    }

    #[test]
    fn recv_blocking_returns_fifo_order() {
        let q: BoundedQueue<u32, 4> = BoundedQueue::new();
        q.try_send(1).unwrap();
        q.try_send(2).unwrap();
        assert_eq!(q.recv_blocking(), 1);
        assert_eq!(q.recv_blocking(), 2);
    }

    #[test]
    fn drain_all_empties_queue() {
        let q: BoundedQueue<u32, 4> = BoundedQueue::new();
        q.try_send(1).unwrap();
        q.try_send(2).unwrap();
        let drained = q.drain_all();
        assert_eq!(drained.as_slice(), &[1, 2]);
        assert!(q.is_empty());
    }

    #[test]
    fn recv_timeout_returns_none_when_empty() {
        let q: BoundedQueue<u32, 2> = BoundedQueue::new();
        assert_eq!(q.recv_timeout(std::time::Duration::from_millis(5)), None);
    }
}
