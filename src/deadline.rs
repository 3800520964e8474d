//! Watchdog & deadline monitoring (spec §4.11). `DeadlineMonitor` tracks two
//! independently-counted classes of miss per task (network-related vs.
//! task-local) and exposes `should_restart()`; the watchdog task (see
//! `tasks::watchdog`) polls every monitor plus per-task last-run timestamps
//! and forces a reboot when a task has gone silent too long.
//!
//! Grounded on the teacher's `safety::SafetySupervisor`: a latched counter
//! evaluated every tick, set/cleared based on a condition, with clearing
//! handled separately from setting. Here "fault bit" becomes "miss count",
//! and `has_faults()` becomes `should_restart()`.

use std::time::{Duration, Instant};

/// Sustained task-local misses above this threshold trigger a reboot.
/// Network misses never count toward it (spec §4.11: "connectivity loss is
/// external").
pub const RESTART_MISS_THRESHOLD: u32 = 5;

/// A task that has not run at all for longer than this is presumed wedged,
/// regardless of its miss counters (spec §4.11's `MAX_TASK_IDLE_TIME_MS`).
/// Sensor-Poll's default period is 5s; six missed cycles gives a margin well
/// above transient scheduling jitter before forcing a reboot.
pub const MAX_TASK_IDLE_TIME_MS: u64 = 30_000;

/// Tracks network-related vs. task-local deadline misses for one task, plus
/// the wall-clock time it last ran at all (used for absolute staleness,
/// independent of whether that run hit its deadline).
#[derive(Debug, Default)]
pub struct DeadlineMonitor {
    network_misses: u32,
    task_local_misses: u32,
    lifetime_network_misses: u64,
    lifetime_task_local_misses: u64,
    last_run: Option<Instant>,
}

impl DeadlineMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self) {
        self.last_run = Some(Instant::now());
    }

    pub fn record_network_miss(&mut self) {
        self.touch();
        self.network_misses = self.network_misses.saturating_add(1);
        self.lifetime_network_misses += 1;
    }

    pub fn record_task_local_miss(&mut self) {
        self.touch();
        self.task_local_misses = self.task_local_misses.saturating_add(1);
        self.lifetime_task_local_misses += 1;
    }

    pub fn record_success(&mut self) {
        self.touch();
        self.task_local_misses = 0;
    }

    /// Time since this task last ran at all, or `None` if it has never run.
    pub fn idle_duration(&self) -> Option<Duration> {
        self.last_run.map(|t| Instant::now().saturating_duration_since(t))
    }

    /// Clear the network-related miss counter on a disconnected-to-connected
    /// transition, preserving lifetime counters (spec §4.11).
    pub fn clear_network_misses(&mut self) {
        self.network_misses = 0;
    }

    pub fn should_restart(&self) -> bool {
        self.task_local_misses >= RESTART_MISS_THRESHOLD
    }

    pub fn network_misses(&self) -> u32 {
        self.network_misses
    }

    pub fn task_local_misses(&self) -> u32 {
        self.task_local_misses
    }

    pub fn lifetime_network_misses(&self) -> u64 {
        self.lifetime_network_misses
    }

    pub fn lifetime_task_local_misses(&self) -> u64 {
        self.lifetime_task_local_misses
    }

    /// Snapshot of the current counters, independent of the monitor itself
    /// (used to assemble a `HealthReport` without holding the task's mutex
    /// for the report's lifetime).
    pub fn snapshot(&self) -> MissSnapshot {
        MissSnapshot {
            network_misses: self.network_misses,
            task_local_misses: self.task_local_misses,
            lifetime_network_misses: self.lifetime_network_misses,
            lifetime_task_local_misses: self.lifetime_task_local_misses,
        }
    }
}

/// Point-in-time read of a `DeadlineMonitor`'s counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MissSnapshot {
    pub network_misses: u32,
    pub task_local_misses: u32,
    pub lifetime_network_misses: u64,
    pub lifetime_task_local_misses: u64,
}

/// Health report (spec §4.11: "uptime, free heap, min-ever free heap,
/// per-task miss counters"). Built by the Watchdog task from its own
/// deadline monitors plus `diagnostics::free_heap_bytes()`/
/// `min_ever_free_heap_bytes()`.
pub struct HealthReport {
    pub uptime: Duration,
    pub free_heap_bytes: u32,
    pub min_ever_free_heap_bytes: u32,
    pub sensor_poll: MissSnapshot,
    pub upload: MissSnapshot,
    pub compression: MissSnapshot,
    pub config: MissSnapshot,
    pub command: MissSnapshot,
    pub power_report: MissSnapshot,
}

/// Soft-reset the device. On ESP-IDF this is a real hardware reset; on host
/// builds it panics rather than tearing down the test process silently,
/// matching the teacher's `rpc::ota::OtaManager::reboot` split.
#[cfg(target_os = "espidf")]
pub fn force_reboot() -> ! {
    log::error!("deadline monitor: forcing reboot");
    esp_idf_sys::esp_restart();
}

#[cfg(not(target_os = "espidf"))]
pub fn force_reboot() -> ! {
    panic!("deadline monitor: forced reboot (simulation — no real hardware reset)");
}
