//! Sensor-Poll task (spec §4.5). Highest-priority task in the roster — the
//! sole producer into `SampleQueue` — so its tick body never blocks on a
//! full queue, only drops and counts a miss.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::acquisition;
use crate::drivers::watchdog::Watchdog;
use crate::protocol::{HttpTransport, Sleeper};
use crate::registers::{RegId, MAX_REGISTERS};
use crate::sample::Sample;
use crate::task_manager::{SharedState, MUTEX_TIMEOUT};

/// Deadline for one poll-and-enqueue cycle (spec §4.5).
const DEADLINE: Duration = Duration::from_secs(2);

/// One iteration of the Sensor-Poll loop. Returns `true` if a sample was
/// produced and handed to `SampleQueue` (enqueued or dropped — both count
/// as "produced" for test purposes; only acquisition failure returns
/// `false`).
pub fn tick<T: HttpTransport, S: Sleeper>(
    state: &SharedState,
    transport: &mut T,
    sleeper: &mut S,
    endpoint: &str,
    slave: u8,
    active_registers: &mut heapless::Vec<RegId, MAX_REGISTERS>,
    period_ms: &mut u32,
    next_wake: &mut Instant,
) -> bool {
    if state.config_reload.try_take() {
        if let Ok(cfg) = state.config.lock(MUTEX_TIMEOUT) {
            if cfg.poll_period_ms != *period_ms {
                *period_ms = cfg.poll_period_ms;
                *next_wake = Instant::now() + Duration::from_millis(u64::from(*period_ms));
                log::info!("sensor-poll: poll period changed to {}ms", period_ms);
            }
            if active_registers.len() != cfg.active_registers.len()
                || active_registers.iter().ne(cfg.active_registers.iter())
            {
                *active_registers = cfg.active_registers.clone();
                log::info!(
                    "sensor-poll: active register list changed ({} registers)",
                    active_registers.len()
                );
            }
        }
    }

    let start = Instant::now();
    let decoded = acquisition::read_request(transport, sleeper, endpoint, slave, active_registers);

    let produced = if decoded.count == active_registers.len() && decoded.count > 0 {
        let timestamp = super::now_millis();
        let sample = Sample::new(timestamp, active_registers, decoded.values());
        if state.sample_queue.try_send(sample).is_err() {
            log::warn!("sensor-poll: SampleQueue full, dropping sample");
            if let Ok(mut monitor) = state.sensor_poll_deadline.lock() {
                monitor.record_task_local_miss();
            }
        }
        true
    } else {
        log::warn!("sensor-poll: partial or failed acquisition, skipping this tick");
        false
    };

    let elapsed = start.elapsed();
    if let Ok(mut monitor) = state.sensor_poll_deadline.lock() {
        if elapsed > DEADLINE {
            log::warn!("sensor-poll: deadline miss ({elapsed:?})");
            monitor.record_task_local_miss();
        } else {
            monitor.record_success();
        }
    }

    produced
}

/// Thin infinite-loop wrapper around [`tick`]: waits for the next period
/// boundary, parks on the suspend gate, runs one tick, feeds the watchdog.
pub fn run<T: HttpTransport, S: Sleeper>(
    state: Arc<SharedState>,
    mut transport: T,
    mut sleeper: S,
    endpoint: heapless::String<64>,
    slave: u8,
) {
    let watchdog = Watchdog::new();
    let (mut active_registers, mut period_ms) = {
        let cfg = state.config.lock(MUTEX_TIMEOUT).expect("config lock at boot");
        (cfg.active_registers.clone(), cfg.poll_period_ms)
    };
    let mut next_wake = Instant::now() + Duration::from_millis(u64::from(period_ms));

    loop {
        state.suspend_gate.wait_if_suspended();
        super::wait_for_next_tick(&mut next_wake, Duration::from_millis(u64::from(period_ms)));
        tick(
            &state,
            &mut transport,
            &mut sleeper,
            endpoint.as_str(),
            slave,
            &mut active_registers,
            &mut period_ms,
            &mut next_wake,
        );
        watchdog.feed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcoWattConfig;
    use crate::protocol::crc16;
    use crate::task_manager::TaskManager;
    use heapless::Vec as HVec;

    struct NoopSleeper;
    impl Sleeper for NoopSleeper {
        fn sleep_ms(&mut self, _ms: u64) {}
    }

    struct FixedTransport {
        values: Vec<u16>,
    }

    impl HttpTransport for FixedTransport {
        type Error = &'static str;
        fn post_frame(
            &mut self,
            _endpoint: &str,
            _frame_hex: &str,
        ) -> Result<heapless::String<128>, Self::Error> {
            let byte_count = self.values.len() * 2;
            let mut buf: HVec<u8, { crate::protocol::frame::MAX_FRAME_BYTES }> = HVec::new();
            let _ = buf.push(0x01);
            let _ = buf.push(0x03);
            let _ = buf.push(byte_count as u8);
            for v in &self.values {
                let _ = buf.push((v >> 8) as u8);
                let _ = buf.push((v & 0xFF) as u8);
            }
            let crc = crc16::compute(&buf);
            let [lo, hi] = crc16::to_bytes(crc);
            let _ = buf.push(lo);
            let _ = buf.push(hi);
            let mut s = heapless::String::new();
            for b in &buf {
                let _ = core::fmt::write(&mut s, format_args!("{b:02x}"));
            }
            Ok(s)
        }
    }

    fn active_regs() -> HVec<RegId, MAX_REGISTERS> {
        let mut v = HVec::new();
        let _ = v.push(RegId::AcVoltage);
        let _ = v.push(RegId::AcCurrent);
        v
    }

    #[test]
    fn successful_read_enqueues_one_sample() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        let mut transport = FixedTransport { values: vec![2300, 0] };
        let mut sleeper = NoopSleeper;
        let mut regs = active_regs();
        let mut period_ms = 5_000;
        let mut next_wake = Instant::now();

        let produced = tick(
            &tm.state,
            &mut transport,
            &mut sleeper,
            "http://x",
            1,
            &mut regs,
            &mut period_ms,
            &mut next_wake,
        );

        assert!(produced);
        assert_eq!(tm.state.sample_queue.len(), 1);
    }

    #[test]
    fn full_queue_is_counted_as_a_task_local_miss_not_a_blocking_wait() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        let mut sleeper = NoopSleeper;
        let mut regs = active_regs();
        let mut period_ms = 5_000;
        let mut next_wake = Instant::now();

        for _ in 0..(crate::queues::SAMPLE_QUEUE_CAPACITY + 2) {
            let mut transport = FixedTransport { values: vec![1, 2] };
            tick(
                &tm.state,
                &mut transport,
                &mut sleeper,
                "http://x",
                1,
                &mut regs,
                &mut period_ms,
                &mut next_wake,
            );
        }

        assert_eq!(tm.state.sample_queue.len(), crate::queues::SAMPLE_QUEUE_CAPACITY);
        let misses = tm.state.sensor_poll_deadline.lock().unwrap().task_local_misses();
        assert!(misses >= 2);
    }

    #[test]
    fn config_reload_token_swaps_active_register_list() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        let mut new_cfg = EcoWattConfig::default();
        new_cfg.active_registers.clear();
        let _ = new_cfg.active_registers.push(RegId::FaultCode);
        *tm.state.config.lock(MUTEX_TIMEOUT).unwrap() = new_cfg;
        tm.state.config_reload.post(1);

        let mut transport = FixedTransport { values: vec![99] };
        let mut sleeper = NoopSleeper;
        let mut regs = active_regs();
        let mut period_ms = 5_000;
        let mut next_wake = Instant::now();

        tick(
            &tm.state,
            &mut transport,
            &mut sleeper,
            "http://x",
            1,
            &mut regs,
            &mut period_ms,
            &mut next_wake,
        );

        assert_eq!(regs.as_slice(), &[RegId::FaultCode]);
    }
}
