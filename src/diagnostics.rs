//! Crash logging and health-report diagnostics (spec §4.11).
//!
//! Stores up to 4 crash entries in an NVS ring buffer under the "crash"
//! namespace. Each entry captures timestamp, reason, and program counter. A
//! panic hook writes the entry before the TWDT or panic handler resets the
//! device. Health reports (uptime, heap, per-task miss counters) are built
//! on-demand by the Watchdog task and logged at INFO.

use crate::adapters::nvs::StoragePort;
use crate::deadline::{HealthReport, MissSnapshot};
use serde::{Deserialize, Serialize};

const CRASH_RING_SLOTS: usize = 4;
const CRASH_NAMESPACE: &str = "crash";
const CRASH_INDEX_KEY: &str = "crash_idx";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashEntry {
    pub uptime_secs: u64,
    pub reason: heapless::String<64>,
    pub pc: u32,
}

impl CrashEntry {
    pub fn new(uptime_secs: u64, reason: &str, pc: u32) -> Self {
        let mut r = heapless::String::new();
        let _ = r.push_str(&reason[..reason.len().min(63)]);
        Self { uptime_secs, reason: r, pc }
    }
}

/// NVS-backed ring buffer for crash entries.
#[derive(Default)]
pub struct CrashLog {
    write_index: usize,
}

impl CrashLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self, nvs: &dyn StoragePort) {
        let mut buf = [0u8; 4];
        if let Ok(4) = nvs.read(CRASH_NAMESPACE, CRASH_INDEX_KEY, &mut buf) {
            self.write_index = u32::from_le_bytes(buf) as usize % CRASH_RING_SLOTS;
        }
    }

    pub fn write_entry(&mut self, nvs: &dyn StoragePort, entry: &CrashEntry) {
        let slot_key = Self::slot_key(self.write_index);
        if let Ok(bytes) = postcard::to_allocvec(entry) {
            let _ = nvs.write(CRASH_NAMESPACE, &slot_key, &bytes);
        }

        self.write_index = (self.write_index + 1) % CRASH_RING_SLOTS;
        let idx_bytes = (self.write_index as u32).to_le_bytes();
        let _ = nvs.write(CRASH_NAMESPACE, CRASH_INDEX_KEY, &idx_bytes);
    }

    pub fn read_all(&self, nvs: &dyn StoragePort) -> heapless::Vec<CrashEntry, 4> {
        let mut entries = heapless::Vec::new();
        for i in 0..CRASH_RING_SLOTS {
            let slot_key = Self::slot_key(i);
            let mut buf = [0u8; 256];
            if let Ok(len) = nvs.read(CRASH_NAMESPACE, &slot_key, &mut buf) {
                if let Ok(entry) = postcard::from_bytes::<CrashEntry>(&buf[..len]) {
                    let _ = entries.push(entry);
                }
            }
        }
        entries
    }

    pub fn clear(&mut self, nvs: &dyn StoragePort) {
        for i in 0..CRASH_RING_SLOTS {
            let _ = nvs.delete(CRASH_NAMESPACE, &Self::slot_key(i));
        }
        let _ = nvs.delete(CRASH_NAMESPACE, CRASH_INDEX_KEY);
        self.write_index = 0;
    }

    pub fn count(&self, nvs: &dyn StoragePort) -> usize {
        (0..CRASH_RING_SLOTS).filter(|i| nvs.exists(CRASH_NAMESPACE, &Self::slot_key(*i))).count()
    }

    fn slot_key(index: usize) -> heapless::String<16> {
        let mut s = heapless::String::new();
        let _ = core::fmt::Write::write_fmt(&mut s, format_args!("e{index}"));
        s
    }
}

/// Free heap reading, platform-gated the same way as the rest of the
/// adapters layer.
#[cfg(target_os = "espidf")]
pub fn free_heap_bytes() -> u32 {
    unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
}

#[cfg(not(target_os = "espidf"))]
pub fn free_heap_bytes() -> u32 {
    307_200
}

#[cfg(target_os = "espidf")]
pub fn min_ever_free_heap_bytes() -> u32 {
    unsafe { esp_idf_svc::sys::esp_get_minimum_free_heap_size() }
}

#[cfg(not(target_os = "espidf"))]
pub fn min_ever_free_heap_bytes() -> u32 {
    280_000
}

/// Render a `HealthReport` the way the watchdog logs it (spec §4.11:
/// "periodically emit a health report").
pub fn log_health_report(report: &HealthReport) {
    log::info!(
        "health: uptime={}s heap={}B (min {}B) sensor_poll[net={} local={}] \
         upload[net={} local={}] compression[net={} local={}] config[net={} local={}] \
         command[net={} local={}] power_report[net={} local={}]",
        report.uptime.as_secs(),
        report.free_heap_bytes,
        report.min_ever_free_heap_bytes,
        report.sensor_poll.network_misses,
        report.sensor_poll.task_local_misses,
        report.upload.network_misses,
        report.upload.task_local_misses,
        report.compression.network_misses,
        report.compression.task_local_misses,
        report.config.network_misses,
        report.config.task_local_misses,
        report.command.network_misses,
        report.command.task_local_misses,
        report.power_report.network_misses,
        report.power_report.task_local_misses,
    );
}

fn format_miss_snapshot(label: &str, snap: &MissSnapshot) -> heapless::String<96> {
    let mut s = heapless::String::new();
    let _ = core::fmt::write(
        &mut s,
        format_args!(
            "{label}: net_misses={} local_misses={}",
            snap.network_misses, snap.task_local_misses
        ),
    );
    s
}

/// Install a panic hook that persists crash info to NVS before the TWDT or
/// default panic handler resets the device.
pub fn install_panic_handler() {
    std::panic::set_hook(Box::new(|info| {
        let reason = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            *msg
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.as_str()
        } else {
            "unknown panic"
        };

        log::error!("PANIC: {reason}");

        #[cfg(target_os = "espidf")]
        {
            // SAFETY: esp_timer_get_time is a simple RTC counter read, safe
            // from panic context with no dynamic allocation.
            let uptime = (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64 / 1_000_000;
            let entry = CrashEntry::new(uptime, reason, 0);

            match crate::adapters::nvs::NvsAdapter::new() {
                Ok(nvs) => {
                    let mut crash_log = CrashLog::new();
                    crash_log.init(&nvs);
                    crash_log.write_entry(&nvs, &entry);
                }
                Err(_) => log::error!("panic handler: NVS unavailable, crash entry not persisted"),
            }
        }

        #[cfg(not(target_os = "espidf"))]
        log::error!("crash entry (simulation): {reason}");
    }));
}
