//! Watchdog task (spec §4.11): the lowest-priority task in the roster. Only
//! Sensor-Poll's silence can force a reboot — either via its own
//! `DeadlineMonitor::should_restart()` or by going idle past
//! `MAX_TASK_IDLE_TIME_MS`. Upload/Compression staleness and every other
//! monitor's miss streak are logged as warnings only. Also clears
//! network-related misses on a disconnected→connected WiFi transition and
//! periodically logs a health report. Not a config-reload consumer — it runs
//! on its own fixed period, not anything in `EcoWattConfig`.
//!
//! Grounded on the teacher's `safety::SafetySupervisor` tick (evaluate every
//! monitored fault source, latch, clear independently of latching) and on
//! `diagnostics::log_health_report` for the report shape.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adapters::wifi::ConnectivityPort;
use crate::deadline::{self, HealthReport, MAX_TASK_IDLE_TIME_MS};
use crate::diagnostics;
use crate::task_manager::{SharedState, MUTEX_TIMEOUT};

/// Watchdog's own check period. Fixed — this task is deliberately outside
/// the config-reload fan-out (spec §4.7 names the other six consumers).
const CHECK_PERIOD: Duration = Duration::from_secs(5);
/// Emit a health report every this-many checks instead of every tick.
const HEALTH_REPORT_EVERY: u32 = 6;

/// One iteration: check every periodic task's monitor for a restart-worthy
/// miss streak, clear network misses on a reconnect edge, and log a health
/// report every `HEALTH_REPORT_EVERY` calls. Returns `true` if a restart was
/// warranted (tests drive the decision without invoking `force_reboot`).
pub fn tick<C: ConnectivityPort>(
    state: &SharedState,
    connectivity: &C,
    was_connected: &mut bool,
    boot_time: Instant,
    check_count: &mut u32,
) -> bool {
    let now_connected = connectivity.is_connected();
    if now_connected && !*was_connected {
        log::info!("watchdog: WiFi reconnected, clearing network-related miss counters");
        for monitor in [
            &state.sensor_poll_deadline,
            &state.upload_deadline,
            &state.compression_deadline,
            &state.config_deadline,
            &state.command_deadline,
            &state.power_report_deadline,
        ] {
            if let Ok(mut m) = monitor.lock() {
                m.clear_network_misses();
            }
        }
    }
    *was_connected = now_connected;

    *check_count += 1;
    if *check_count % HEALTH_REPORT_EVERY == 0 {
        let report = build_health_report(state, boot_time);
        diagnostics::log_health_report(&report);
    }

    if state.ota_in_progress() {
        // Tasks are deliberately parked on suspend_gate while OTA holds
        // net_mutex (spec §4.10) — a silent period here is expected, not a
        // fault, so skip the restart check this cycle.
        return false;
    }

    let (poll_period_ms, upload_period_ms) = state
        .config
        .lock(MUTEX_TIMEOUT)
        .map(|cfg| (cfg.poll_period_ms, cfg.upload_period_ms))
        .unwrap_or((5_000, 15_000));

    // Upload/Compression staleness is warning-only (spec §4.11): absent for
    // too long relative to their own period is suspicious but not, on its
    // own, reboot-worthy.
    if let Ok(monitor) = state.upload_deadline.lock() {
        if let Some(idle) = monitor.idle_duration() {
            if idle > Duration::from_millis(3 * u64::from(upload_period_ms)) {
                log::warn!("watchdog: upload has not run in {idle:?}, exceeding 3x its period");
            }
        }
    }
    if let Ok(monitor) = state.compression_deadline.lock() {
        if let Some(idle) = monitor.idle_duration() {
            if idle > Duration::from_millis(10 * u64::from(poll_period_ms)) {
                log::warn!("watchdog: compression has not run in {idle:?}, exceeding 10x the poll period");
            }
        }
    }

    // Sustained task-local miss streaks on anything but Sensor-Poll are
    // logged, not acted on — spec §4.11 only names Sensor-Poll's
    // `should_restart()` as reboot-worthy.
    for (name, monitor) in [
        ("upload", &state.upload_deadline),
        ("compression", &state.compression_deadline),
        ("config", &state.config_deadline),
        ("command", &state.command_deadline),
        ("power-report", &state.power_report_deadline),
    ] {
        if monitor.lock().map(|m| m.should_restart()).unwrap_or(false) {
            log::warn!("watchdog: {name} has a sustained task-local deadline miss streak");
        }
    }

    let sensor_poll_stalled = state
        .sensor_poll_deadline
        .lock()
        .ok()
        .and_then(|m| m.idle_duration())
        .is_some_and(|idle| idle > Duration::from_millis(MAX_TASK_IDLE_TIME_MS));

    let sensor_poll_restart =
        state.sensor_poll_deadline.lock().map(|m| m.should_restart()).unwrap_or(false);

    let should_restart = sensor_poll_stalled || sensor_poll_restart;

    if should_restart {
        log::error!("watchdog: sensor-poll stalled or sustained deadline misses, forcing reboot");
    }
    should_restart
}

fn build_health_report(state: &SharedState, boot_time: Instant) -> HealthReport {
    HealthReport {
        uptime: boot_time.elapsed(),
        free_heap_bytes: diagnostics::free_heap_bytes(),
        min_ever_free_heap_bytes: diagnostics::min_ever_free_heap_bytes(),
        sensor_poll: state.sensor_poll_deadline.lock().map(|m| m.snapshot()).unwrap_or_default(),
        upload: state.upload_deadline.lock().map(|m| m.snapshot()).unwrap_or_default(),
        compression: state.compression_deadline.lock().map(|m| m.snapshot()).unwrap_or_default(),
        config: state.config_deadline.lock().map(|m| m.snapshot()).unwrap_or_default(),
        command: state.command_deadline.lock().map(|m| m.snapshot()).unwrap_or_default(),
        power_report: state.power_report_deadline.lock().map(|m| m.snapshot()).unwrap_or_default(),
    }
}

/// Thin infinite-loop wrapper: the watchdog task is itself never subject to
/// the suspend gate (spec §9: it must keep running through an OTA to detect
/// a stuck OTA, and it is the thing that would notice the reboot never
/// happened).
pub fn run<C: ConnectivityPort>(state: Arc<SharedState>, connectivity: C) {
    let self_watchdog = crate::drivers::watchdog::Watchdog::new();
    let boot_time = Instant::now();
    let mut connectivity = connectivity;
    let mut was_connected = connectivity.is_connected();
    let mut check_count = 0u32;
    let mut next_wake = Instant::now() + CHECK_PERIOD;

    loop {
        super::wait_for_next_tick(&mut next_wake, CHECK_PERIOD);
        // Drives the reconnect backoff state machine (spec §4.11); `tick`
        // itself only reads connectivity state, it never advances it.
        connectivity.poll();
        if tick(&state, &connectivity, &mut was_connected, boot_time, &mut check_count) {
            deadline::force_reboot();
        }
        self_watchdog.feed();
    }
}
