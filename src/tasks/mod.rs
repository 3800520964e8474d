//! Periodic task bodies (spec §4.5-§4.11).
//!
//! Each module exposes a pure-ish `tick()` — or a handful of `tick`-shaped
//! functions for the state-machine tasks — plus a thin `run()` loop that
//! wires it to real timing, `SharedState`, and the I/O adapters. `tick()`
//! never sleeps and never spawns, so it can be driven directly from a unit
//! test without a real thread.
//!
//! Grounded on the teacher's `scheduler::Scheduler`: a fixed-period
//! dispatch loop that rebases its next-wake instant on a missed tick rather
//! than accelerating to catch up.

pub mod command_executor;
pub mod compression_task;
pub mod config_manager;
pub mod ota;
pub mod power_reporter;
pub mod sensor_poll;
pub mod uploader;
pub mod watchdog;

use std::time::{Duration, Instant};

/// Block until `*next`, then advance it by `period` (spec §4.5: "absolute-
/// time wait to next period boundary; skipped ticks don't accelerate the
/// next tick"). If the caller is already past `*next` — the previous tick
/// overran — rebase to `now + period` instead of returning immediately and
/// spinning through the backlog.
pub(crate) fn wait_for_next_tick(next: &mut Instant, period: Duration) {
    let now = Instant::now();
    if *next > now {
        std::thread::sleep(*next - now);
        *next += period;
    } else {
        *next = now + period;
    }
}

/// Milliseconds since the UNIX epoch, used as the `Sample` timestamp.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_next_tick_advances_by_period_when_on_time() {
        let mut next = Instant::now() + Duration::from_millis(5);
        let before = next;
        wait_for_next_tick(&mut next, Duration::from_millis(50));
        assert_eq!(next, before + Duration::from_millis(50));
    }

    #[test]
    fn wait_for_next_tick_rebases_instead_of_accelerating_when_late() {
        let mut next = Instant::now() - Duration::from_millis(500);
        wait_for_next_tick(&mut next, Duration::from_millis(50));
        assert!(next > Instant::now());
        assert!(next <= Instant::now() + Duration::from_millis(51));
    }
}
