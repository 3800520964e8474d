//! Compression task (spec §4.6). Driven by `SampleQueue`'s blocking
//! receive rather than a period — the only intentionally unbounded wait in
//! the system (spec §5), bounded in practice by Sensor-Poll's rate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::compression::compress_smart;
use crate::drivers::watchdog::Watchdog;
use crate::sample::SampleBatch;
use crate::task_manager::{SharedState, MUTEX_TIMEOUT};

/// Deadline for the compress-and-enqueue step once a batch fills (spec §4.6).
const DEADLINE: Duration = Duration::from_secs(2);

/// One iteration: receive a sample, append to `batch`, and if `batch` just
/// filled, compress and hand it to `CompressedQueue`. `n` is `batch_size()`
/// recomputed whenever a config-reload token lands (spec §5: "config change
/// cannot take effect mid-batch — Compression rebuilds from zero").
pub fn tick(state: &SharedState, batch: &mut SampleBatch, n: &mut usize) {
    if state.config_reload.try_take() {
        if let Ok(cfg) = state.config.lock(MUTEX_TIMEOUT) {
            let new_n = cfg.batch_size().max(1);
            if new_n != *n {
                log::info!("compression: batch size changed {n} -> {new_n}");
                *n = new_n;
                *batch = SampleBatch::new(*n);
            }
        }
    }

    let sample = state.sample_queue.recv_blocking();

    if !batch.push(sample) {
        log::warn!("compression: register layout changed mid-batch, discarding batch");
        *batch = SampleBatch::new(*n);
        let _ = batch.push(sample);
    }

    if !batch.is_full() {
        return;
    }

    let start = Instant::now();
    match state.pipeline_mutex.lock(MUTEX_TIMEOUT) {
        Ok(_guard) => {
            let packet = compress_smart(batch);
            if state.compressed_queue.try_send(packet).is_err() {
                log::warn!("compression: CompressedQueue full, dropping packet");
            }
            state.batch_ready.signal();
        }
        Err(_) => {
            log::error!("compression: pipeline mutex acquire timed out, discarding batch");
        }
    }
    batch.reset();

    let elapsed = start.elapsed();
    if let Ok(mut monitor) = state.compression_deadline.lock() {
        if elapsed > DEADLINE {
            log::warn!("compression: deadline miss ({elapsed:?})");
            monitor.record_task_local_miss();
        } else {
            monitor.record_success();
        }
    }
}

pub fn run(state: Arc<SharedState>) {
    let watchdog = Watchdog::new();
    let mut n = {
        let cfg = state.config.lock(MUTEX_TIMEOUT).expect("config lock at boot");
        cfg.batch_size().max(1)
    };
    let mut batch = SampleBatch::new(n);

    loop {
        state.suspend_gate.wait_if_suspended();
        tick(&state, &mut batch, &mut n);
        watchdog.feed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcoWattConfig;
    use crate::registers::RegId;
    use crate::sample::Sample;
    use crate::task_manager::TaskManager;

    fn push_sample(tm: &TaskManager, ts: u64, value: u16) {
        let sample = Sample::new(ts, &[RegId::AcVoltage, RegId::AcCurrent], &[value, 0]);
        tm.state.sample_queue.try_send(sample).unwrap();
    }

    #[test]
    fn batch_fills_and_emits_one_compressed_packet() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        let mut n = 3;
        let mut batch = SampleBatch::new(n);

        for i in 0..3 {
            push_sample(&tm, 1000 + i, 100);
            tick(&tm.state, &mut batch, &mut n);
        }

        assert_eq!(tm.state.compressed_queue.len(), 1);
        assert!(batch.is_empty());
        assert!(tm.state.batch_ready.drain());
    }

    #[test]
    fn config_reload_rebuilds_batch_from_zero() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        let mut n = 3;
        let mut batch = SampleBatch::new(n);
        push_sample(&tm, 1, 1);
        tick(&tm.state, &mut batch, &mut n);
        assert_eq!(batch.len(), 1);

        let mut new_cfg = EcoWattConfig::default();
        new_cfg.upload_period_ms = 30_000;
        new_cfg.poll_period_ms = 5_000;
        *tm.state.config.lock(MUTEX_TIMEOUT).unwrap() = new_cfg;
        tm.state.config_reload.post(1);

        push_sample(&tm, 2, 2);
        tick(&tm.state, &mut batch, &mut n);

        assert_eq!(n, 6);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn pipeline_lock_timeout_discards_batch_without_panicking() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        let mut n = 2;
        let mut batch = SampleBatch::new(n);
        let guard = tm.state.pipeline_mutex.lock(Duration::from_millis(10)).unwrap();

        push_sample(&tm, 1, 1);
        tick(&tm.state, &mut batch, &mut n);
        push_sample(&tm, 2, 2);
        tick(&tm.state, &mut batch, &mut n);

        drop(guard);
        assert!(tm.state.compressed_queue.is_empty());
        assert!(batch.is_empty());
    }
}
