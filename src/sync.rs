//! Bounded-wait synchronization primitives (spec §5).
//!
//! The teacher's RPC layer runs inside a single-threaded async executor and
//! signals with `embassy_sync::channel::Channel` used as a unit-message
//! queue (`DISCONNECT_CHANNEL`). EcoWatt's nine tasks are real OS threads
//! (spec §9's "preserved as-is: OS-level preemptive tasks, not an async
//! runtime"), so the same bounded/coalesced/never-unbounded shape is
//! rebuilt here directly on `std::sync::{Mutex, Condvar}`.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A mutex with a bounded-wait acquire, standing in for priority-inheriting
/// mutexes (`net_mutex`, `nvs_mutex`, `pipeline_mutex`) on a host that has
/// no literal priority inheritance — the teacher's own `NvsAdapter`/RPC
/// locking accepts the same plain-OS-mutex stand-in.
pub struct TimedMutex<T> {
    inner: Mutex<T>,
}

/// Returned by `TimedMutex::lock` on timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout;

impl<T> TimedMutex<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    /// Attempt to acquire the lock, polling until `timeout` elapses.
    pub fn lock(&self, timeout: Duration) -> Result<std::sync::MutexGuard<'_, T>, LockTimeout> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(LockTimeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(std::sync::TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
            }
        }
    }
}

/// Binary semaphore — signaled by a single producer, coalesced (drained) by
/// a single consumer before it starts a cycle. Models `batch_ready`.
pub struct BinarySemaphore {
    state: Mutex<bool>,
    cv: Condvar,
}

impl BinarySemaphore {
    pub fn new() -> Self {
        Self { state: Mutex::new(false), cv: Condvar::new() }
    }

    pub fn signal(&self) {
        let mut signaled = self.state.lock().unwrap();
        *signaled = true;
        self.cv.notify_all();
    }

    /// Drain (coalesce) any pending signal; returns whether one was pending.
    pub fn drain(&self) -> bool {
        let mut signaled = self.state.lock().unwrap();
        let was = *signaled;
        *signaled = false;
        was
    }
}

impl Default for BinarySemaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Counting semaphore — capacity-bounded token store. Models `config_reload`:
/// the Uploader posts one token per consumer after a successful upload; each
/// consumer takes at most one token per cycle.
pub struct CountingSemaphore {
    count: Mutex<u32>,
    capacity: u32,
}

impl CountingSemaphore {
    pub fn new(capacity: u32) -> Self {
        Self { count: Mutex::new(0), capacity }
    }

    /// Post up to `n` tokens, saturating at `capacity`.
    pub fn post(&self, n: u32) {
        let mut count = self.count.lock().unwrap();
        *count = (*count + n).min(self.capacity);
    }

    /// Try to take one token. Returns `true` if one was available.
    pub fn try_take(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_mutex_acquires_when_free() {
        let m = TimedMutex::new(5);
        let guard = m.lock(Duration::from_millis(50)).unwrap();
        assert_eq!(*guard, 5);
    }

    #[test]
    fn binary_semaphore_coalesces_multiple_signals() {
        let sem = BinarySemaphore::new();
        sem.signal();
        sem.signal();
        sem.signal();
        assert!(sem.drain());
        assert!(!sem.drain());
    }

    #[test]
    fn counting_semaphore_respects_capacity() {
        let sem = CountingSemaphore::new(6);
        sem.post(10);
        let mut taken = 0;
        while sem.try_take() {
            taken += 1;
        }
        assert_eq!(taken, 6);
    }

    #[test]
    fn counting_semaphore_drains_one_token_at_a_time() {
        let sem = CountingSemaphore::new(6);
        sem.post(2);
        assert!(sem.try_take());
        assert!(sem.try_take());
        assert!(!sem.try_take());
    }
}
