//! Config Manager task (spec §4.8). One of the six `config_reload`
//! consumers: takes its own token at the top of every cycle (to learn about
//! a period change itself) before checking the remote endpoint for a delta
//! to validate and persist. The Uploader is the sole producer of these
//! tokens (spec §4.7 step 6) — Config Manager never posts one.
//!
//! Grounded on `adapters::nvs::ConfigPort` for the validate-before-persist
//! discipline and on the teacher's `rpc` client for the poll-then-apply
//! shape.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adapters::http::HttpClient;
use crate::adapters::nvs::ConfigPort;
use crate::config::{EcoWattConfig, CONFIG_CONSUMER_COUNT};
use crate::drivers::watchdog::Watchdog;
use crate::task_manager::{SharedState, MUTEX_TIMEOUT};

const NET_MUTEX_TIMEOUT: Duration = Duration::from_secs(10);
const DEADLINE: Duration = Duration::from_secs(2);

fn configs_equal(a: &EcoWattConfig, b: &EcoWattConfig) -> bool {
    a.poll_period_ms == b.poll_period_ms
        && a.upload_period_ms == b.upload_period_ms
        && a.config_check_period_ms == b.config_check_period_ms
        && a.command_check_period_ms == b.command_check_period_ms
        && a.ota_check_period_ms == b.ota_check_period_ms
        && a.power_report_period_ms == b.power_report_period_ms
        && a.active_registers.len() == b.active_registers.len()
        && a.active_registers.iter().eq(b.active_registers.iter())
}

/// One iteration: take this task's own reload token, then fetch the remote
/// config under `net_mutex`, and if it differs from the in-process copy,
/// validate, persist, and swap it in. Returns `true` iff a change was
/// applied (used by tests; `run` ignores it).
pub fn tick<C: HttpClient, P: ConfigPort>(
    state: &SharedState,
    client: &C,
    config_port: &P,
    endpoint: &str,
) -> bool {
    let _ = state.config_reload.try_take();

    let start = Instant::now();
    let result: Result<bool, String> = (|| {
        let _guard =
            state.net_mutex.lock(NET_MUTEX_TIMEOUT).map_err(|_| "net_mutex timeout".to_string())?;
        let body = client.get(endpoint).map_err(|e| e.to_string())?;
        let remote: EcoWattConfig = serde_json::from_str(&body).map_err(|e| e.to_string())?;
        remote.validate().map_err(|e| e.to_string())?;

        let changed = {
            let current =
                state.config.lock(MUTEX_TIMEOUT).map_err(|_| "config lock timeout".to_string())?;
            !configs_equal(&current, &remote)
        };

        if changed {
            config_port.save(&remote).map_err(|e| e.to_string())?;
            let mut cfg =
                state.config.lock(MUTEX_TIMEOUT).map_err(|_| "config lock timeout".to_string())?;
            *cfg = remote;
        }

        Ok(changed)
    })();

    let elapsed = start.elapsed();
    match result {
        Ok(changed) => {
            if changed {
                log::info!("config-manager: applied new remote config");
            }
            if let Ok(mut monitor) = state.config_deadline.lock() {
                if elapsed > DEADLINE {
                    log::warn!("config-manager: deadline miss ({elapsed:?})");
                    monitor.record_task_local_miss();
                } else {
                    monitor.record_success();
                }
            }
            changed
        }
        Err(e) => {
            log::warn!("config-manager: check failed: {e}");
            if let Ok(mut monitor) = state.config_deadline.lock() {
                monitor.record_network_miss();
            }
            false
        }
    }
}

pub fn run<C: HttpClient, P: ConfigPort>(
    state: Arc<SharedState>,
    client: C,
    config_port: P,
    endpoint: heapless::String<64>,
) {
    let watchdog = Watchdog::new();
    let mut next_wake = {
        let cfg = state.config.lock(MUTEX_TIMEOUT).expect("config lock at boot");
        Instant::now() + Duration::from_millis(u64::from(cfg.config_check_period_ms))
    };

    loop {
        state.suspend_gate.wait_if_suspended();
        let period_ms =
            state.config.lock(MUTEX_TIMEOUT).map(|c| c.config_check_period_ms).unwrap_or(30_000);
        super::wait_for_next_tick(&mut next_wake, Duration::from_millis(u64::from(period_ms)));
        tick(&state, &client, &config_port, endpoint.as_str());
        watchdog.feed();
    }
}
