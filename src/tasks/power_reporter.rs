//! Power Reporter task (spec §4.?): periodically reads the energy/power
//! registers directly (independent of the batched sample pipeline) and POSTs
//! a small summary report. One of the six config-reload consumers.
//!
//! Grounded on `acquisition::read_request` for the register read and on
//! `tasks::uploader`'s POST-under-`net_mutex` shape for the report itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::acquisition;
use crate::adapters::http::HttpClient;
use crate::drivers::watchdog::Watchdog;
use crate::protocol::{HttpTransport, Sleeper};
use crate::registers::RegId;
use crate::task_manager::{SharedState, MUTEX_TIMEOUT};

const DEADLINE: Duration = Duration::from_secs(5);
const NET_MUTEX_TIMEOUT: Duration = Duration::from_secs(10);

fn report_registers() -> [RegId; 3] {
    [RegId::AcPowerWatts, RegId::EnergyTodayWh, RegId::EnergyTotalKwh]
}

fn build_body(timestamp: u64, values: &[u16]) -> String {
    serde_json::json!({
        "timestamp": timestamp,
        "ac_power_w": values.first().copied().unwrap_or(0),
        "energy_today_wh": values.get(1).copied().unwrap_or(0),
        "energy_total_kwh_x10": values.get(2).copied().unwrap_or(0),
    })
    .to_string()
}

/// One iteration: pick up a config-reload token (no reporter-specific state
/// to swap today, but the token must still be consumed per spec §4.7's
/// six-consumer contract), read the report registers, and POST the summary
/// under `net_mutex`.
pub fn tick<T: HttpTransport, S: Sleeper, C: HttpClient>(
    state: &SharedState,
    transport: &mut T,
    sleeper: &mut S,
    inverter_endpoint: &str,
    slave: u8,
    client: &C,
    report_endpoint: &str,
) {
    let _ = state.config_reload.try_take();

    let start = Instant::now();
    let regs = report_registers();
    let decoded = acquisition::read_request(transport, sleeper, inverter_endpoint, slave, &regs);
    if decoded.count != regs.len() {
        log::warn!("power-reporter: register read incomplete, skipping this cycle");
        if let Ok(mut monitor) = state.power_report_deadline.lock() {
            monitor.record_task_local_miss();
        }
        return;
    }

    let body = build_body(super::now_millis(), decoded.values());
    let result: Result<(), String> = (|| {
        let _guard = state
            .net_mutex
            .lock(NET_MUTEX_TIMEOUT)
            .map_err(|_| "net_mutex timeout".to_string())?;
        client.post_json(report_endpoint, &body).map_err(|e| e.to_string())?;
        Ok(())
    })();

    let elapsed = start.elapsed();
    match result {
        Ok(()) => {
            if let Ok(mut monitor) = state.power_report_deadline.lock() {
                if elapsed > DEADLINE {
                    monitor.record_task_local_miss();
                } else {
                    monitor.record_success();
                }
            }
        }
        Err(e) => {
            log::warn!("power-reporter: report POST failed: {e}");
            if let Ok(mut monitor) = state.power_report_deadline.lock() {
                monitor.record_network_miss();
            }
        }
    }
}

pub fn run<T: HttpTransport, S: Sleeper, C: HttpClient>(
    state: Arc<SharedState>,
    mut transport: T,
    mut sleeper: S,
    inverter_endpoint: heapless::String<64>,
    slave: u8,
    client: C,
    report_endpoint: heapless::String<64>,
) {
    let watchdog = Watchdog::new();
    let mut next_wake = {
        let cfg = state.config.lock(MUTEX_TIMEOUT).expect("config lock at boot");
        Instant::now() + Duration::from_millis(u64::from(cfg.power_report_period_ms))
    };

    loop {
        state.suspend_gate.wait_if_suspended();
        let period_ms =
            state.config.lock(MUTEX_TIMEOUT).map(|c| c.power_report_period_ms).unwrap_or(60_000);
        super::wait_for_next_tick(&mut next_wake, Duration::from_millis(u64::from(period_ms)));
        tick(
            &state,
            &mut transport,
            &mut sleeper,
            inverter_endpoint.as_str(),
            slave,
            &client,
            report_endpoint.as_str(),
        );
        watchdog.feed();
    }
}
