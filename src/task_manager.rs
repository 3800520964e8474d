//! Task Manager (spec §4.1): allocates every queue, mutex, and semaphore at
//! boot, then spawns the fixed nine-task roster pinned across two cores with
//! fixed priorities.
//!
//! Grounded on the teacher's `drivers::task_pin::spawn_on_core`, generalized
//! from one ad hoc thread (`rpc-io`) to the full roster, and on spec §9's
//! redesign note: "Replace [ambient globals] with a single owned
//! `TaskManager` value constructed at boot; tasks receive handles to exactly
//! the queues and primitives they need."

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::config::{EcoWattConfig, CONFIG_CONSUMER_COUNT};
use crate::deadline::DeadlineMonitor;
use crate::drivers::task_pin::{spawn_on_core, Core};
use crate::error::{Error, TaskManagerError};
use crate::queues::{CommandQueue, CompressedQueue, SampleQueue};
use crate::sync::{BinarySemaphore, CountingSemaphore, TimedMutex};

/// Bounded wait used for every mutex acquire in the system except the period
/// wait and `SampleQueue.receive` (spec §5: "every blocking wait except the
/// inter-tick period wait uses a bounded timeout").
pub const MUTEX_TIMEOUT: Duration = Duration::from_millis(200);

/// Fixed priority order, highest first (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskId {
    SensorPoll,
    Upload,
    Compression,
    Command,
    Config,
    PowerReport,
    Ota,
    Watchdog,
}

impl TaskId {
    /// FreeRTOS-style priority: higher value runs first when runnable.
    fn priority(self) -> u8 {
        match self {
            TaskId::SensorPoll => 9,
            TaskId::Upload => 8,
            TaskId::Compression => 7,
            TaskId::Command => 6,
            TaskId::Config => 5,
            TaskId::PowerReport => 4,
            TaskId::Ota => 3,
            TaskId::Watchdog => 2,
        }
    }

    /// CPU pinning (spec §4.1): Sensor-Poll/Compression/Watchdog -> CPU-A
    /// (`Core::App`), everything else -> CPU-B (`Core::Pro`).
    fn core(self) -> Core {
        match self {
            TaskId::SensorPoll | TaskId::Compression | TaskId::Watchdog => Core::App,
            TaskId::Upload | TaskId::Command | TaskId::Config | TaskId::PowerReport | TaskId::Ota => {
                Core::Pro
            }
        }
    }

    fn thread_name(self) -> &'static str {
        match self {
            TaskId::SensorPoll => "sensor-poll\0",
            TaskId::Upload => "uploader\0",
            TaskId::Compression => "compression\0",
            TaskId::Command => "command-exec\0",
            TaskId::Config => "config-mgr\0",
            TaskId::PowerReport => "power-report\0",
            TaskId::Ota => "ota-manager\0",
            TaskId::Watchdog => "watchdog\0",
        }
    }

    const STACK_KB: usize = 8;
}

/// Cooperative suspend point: every task checks `is_suspended` at the top of
/// its loop and parks on the condvar until `resume_all()` wakes it. There is
/// no preemptive cancellation (spec §9: "no first-class task cancellation").
#[derive(Default)]
pub struct SuspendGate {
    suspended: Mutex<bool>,
    cv: Condvar,
}

impl SuspendGate {
    pub fn suspend(&self) {
        *self.suspended.lock().unwrap() = true;
    }

    pub fn resume(&self) {
        *self.suspended.lock().unwrap() = false;
        self.cv.notify_all();
    }

    /// Block here if suspended; returns immediately otherwise.
    pub fn wait_if_suspended(&self) {
        let mut guard = self.suspended.lock().unwrap();
        while *guard {
            guard = self.cv.wait(guard).unwrap();
        }
    }

    pub fn is_suspended(&self) -> bool {
        *self.suspended.lock().unwrap()
    }
}

/// Everything a periodic task needs: its own deadline monitor plus shared
/// handles to the queues/mutexes/semaphores it touches. Cloning a `TaskIo`
/// clones `Arc`s only.
pub struct SharedState {
    pub config: TimedMutex<EcoWattConfig>,
    pub sample_queue: SampleQueue,
    pub compressed_queue: CompressedQueue,
    pub command_queue: CommandQueue,
    pub net_mutex: TimedMutex<()>,
    pub nvs_mutex: TimedMutex<()>,
    pub pipeline_mutex: TimedMutex<()>,
    pub batch_ready: BinarySemaphore,
    pub config_reload: CountingSemaphore,
    pub suspend_gate: SuspendGate,
    pub ota_in_progress: AtomicBool,
    /// Set by `update_upload_frequency`, consumed by `uploader::run` to
    /// apply and rebase its wait immediately instead of waiting out the
    /// stale period (spec §4.7 step 2).
    pub upload_period_changed: AtomicBool,
    pub sensor_poll_deadline: Mutex<DeadlineMonitor>,
    pub upload_deadline: Mutex<DeadlineMonitor>,
    pub compression_deadline: Mutex<DeadlineMonitor>,
    pub config_deadline: Mutex<DeadlineMonitor>,
    pub command_deadline: Mutex<DeadlineMonitor>,
    pub power_report_deadline: Mutex<DeadlineMonitor>,
}

impl SharedState {
    /// True while the OTA task holds `net_mutex` across a suspend/apply
    /// (spec §4.10). Other tasks park on `suspend_gate` instead of racing it.
    pub fn ota_in_progress(&self) -> bool {
        self.ota_in_progress.load(Ordering::Acquire)
    }

    pub fn set_ota_in_progress(&self, value: bool) {
        self.ota_in_progress.store(value, Ordering::Release);
    }

    /// Reads and clears the upload-period-changed flag in one step.
    pub fn take_upload_period_changed(&self) -> bool {
        self.upload_period_changed.swap(false, Ordering::AcqRel)
    }

    fn new(config: EcoWattConfig) -> Self {
        Self {
            config: TimedMutex::new(config),
            sample_queue: SampleQueue::new(),
            compressed_queue: CompressedQueue::new(),
            command_queue: CommandQueue::new(),
            net_mutex: TimedMutex::new(()),
            nvs_mutex: TimedMutex::new(()),
            pipeline_mutex: TimedMutex::new(()),
            batch_ready: BinarySemaphore::new(),
            config_reload: CountingSemaphore::new(CONFIG_CONSUMER_COUNT as u32),
            suspend_gate: SuspendGate::default(),
            ota_in_progress: AtomicBool::new(false),
            upload_period_changed: AtomicBool::new(false),
            sensor_poll_deadline: Mutex::new(DeadlineMonitor::new()),
            upload_deadline: Mutex::new(DeadlineMonitor::new()),
            compression_deadline: Mutex::new(DeadlineMonitor::new()),
            config_deadline: Mutex::new(DeadlineMonitor::new()),
            command_deadline: Mutex::new(DeadlineMonitor::new()),
            power_report_deadline: Mutex::new(DeadlineMonitor::new()),
        }
    }
}

/// Owns every shared primitive and the join handles of the nine spawned
/// tasks. Constructed once at boot via `init`; `start_all` spawns workers.
pub struct TaskManager {
    pub state: std::sync::Arc<SharedState>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl TaskManager {
    /// Allocate all primitives. Returns `TaskManagerError::PrimitiveAllocationFailed`
    /// only in principle — on `std` these allocations cannot fail short of an
    /// OOM abort, but the seam exists per spec §4.1 ("returns failure if any
    /// primitive cannot be allocated") so a future no_std backend can report it.
    pub fn init(config: EcoWattConfig) -> Result<Self, Error> {
        if config.validate().is_err() {
            return Err(TaskManagerError::PrimitiveAllocationFailed(
                "initial configuration failed validation",
            )
            .into());
        }
        Ok(Self { state: std::sync::Arc::new(SharedState::new(config)), handles: Vec::new() })
    }

    /// Spawn one task pinned to its assigned core, running `body` in a loop
    /// until the process exits (there is no task exit in this design).
    pub fn spawn_task(&mut self, id: TaskId, body: impl FnOnce() + Send + 'static) {
        let handle = spawn_on_core(id.core(), id.priority(), TaskId::STACK_KB, id.thread_name(), body);
        self.handles.push(handle);
    }

    /// Freeze every task at its next suspend point except OTA (spec §4.1,
    /// §4.10: the OTA task holds `net_mutex` across this call).
    pub fn suspend_all_except_ota(&self) {
        self.state.suspend_gate.suspend();
    }

    pub fn resume_all(&self) {
        self.state.suspend_gate.resume();
    }

    pub fn update_poll_frequency(&self, ms: u32) {
        if let Ok(mut cfg) = self.state.config.lock(MUTEX_TIMEOUT) {
            cfg.poll_period_ms = ms;
        }
    }

    pub fn update_upload_frequency(&self, ms: u32) {
        if let Ok(mut cfg) = self.state.config.lock(MUTEX_TIMEOUT) {
            cfg.upload_period_ms = ms;
        }
        self.state.upload_period_changed.store(true, Ordering::Release);
    }

    pub fn update_config_check_frequency(&self, ms: u32) {
        if let Ok(mut cfg) = self.state.config.lock(MUTEX_TIMEOUT) {
            cfg.config_check_period_ms = ms;
        }
    }

    pub fn update_command_check_frequency(&self, ms: u32) {
        if let Ok(mut cfg) = self.state.config.lock(MUTEX_TIMEOUT) {
            cfg.command_check_period_ms = ms;
        }
    }

    pub fn update_ota_check_frequency(&self, ms: u32) {
        if let Ok(mut cfg) = self.state.config.lock(MUTEX_TIMEOUT) {
            cfg.ota_check_period_ms = ms;
        }
    }

    pub fn update_power_report_frequency(&self, ms: u32) {
        if let Ok(mut cfg) = self.state.config.lock(MUTEX_TIMEOUT) {
            cfg.power_report_period_ms = ms;
        }
    }

    pub fn join_all(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_matches_spec_highest_first() {
        let order = [
            TaskId::SensorPoll,
            TaskId::Upload,
            TaskId::Compression,
            TaskId::Command,
            TaskId::Config,
            TaskId::PowerReport,
            TaskId::Ota,
            TaskId::Watchdog,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].priority() > pair[1].priority());
        }
    }

    #[test]
    fn sensor_poll_and_compression_and_watchdog_share_cpu_a() {
        assert_eq!(TaskId::SensorPoll.core(), Core::App);
        assert_eq!(TaskId::Compression.core(), Core::App);
        assert_eq!(TaskId::Watchdog.core(), Core::App);
        assert_eq!(TaskId::Upload.core(), Core::Pro);
    }

    #[test]
    fn init_rejects_invalid_config() {
        let mut cfg = EcoWattConfig::default();
        cfg.poll_period_ms = 0;
        assert!(TaskManager::init(cfg).is_err());
    }

    #[test]
    fn suspend_gate_blocks_until_resumed() {
        let gate = std::sync::Arc::new(SuspendGate::default());
        gate.suspend();
        let waiter_gate = gate.clone();
        let handle = std::thread::spawn(move || {
            waiter_gate.wait_if_suspended();
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        gate.resume();
        handle.join().unwrap();
    }

    #[test]
    fn update_upload_frequency_sets_and_drains_changed_flag() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        assert!(!tm.state.take_upload_period_changed());

        tm.update_upload_frequency(1_234);

        assert_eq!(tm.state.config.lock(MUTEX_TIMEOUT).unwrap().upload_period_ms, 1_234);
        assert!(tm.state.take_upload_period_changed());
        assert!(!tm.state.take_upload_period_changed(), "flag must clear after being taken");
    }

    #[test]
    fn remaining_frequency_setters_update_their_own_period_only() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();

        tm.update_config_check_frequency(1_001);
        tm.update_command_check_frequency(1_002);
        tm.update_ota_check_frequency(1_003);
        tm.update_power_report_frequency(1_004);

        let cfg = tm.state.config.lock(MUTEX_TIMEOUT).unwrap();
        assert_eq!(cfg.config_check_period_ms, 1_001);
        assert_eq!(cfg.command_check_period_ms, 1_002);
        assert_eq!(cfg.ota_check_period_ms, 1_003);
        assert_eq!(cfg.power_report_period_ms, 1_004);
    }

    #[test]
    fn config_reload_semaphore_matches_consumer_count() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        tm.state.config_reload.post(100);
        let mut taken = 0;
        while tm.state.config_reload.try_take() {
            taken += 1;
        }
        assert_eq!(taken, CONFIG_CONSUMER_COUNT as u32);
    }
}
