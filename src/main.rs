//! EcoWatt firmware entry point.
//!
//! Boot sequence (spec §4.1, §4.9): bring up the ESP-IDF runtime, mark the
//! running image valid, load configuration and provisioned secrets from
//! NVS, bring up WiFi, allocate every shared primitive via `TaskManager`,
//! and spawn the fixed eight-task roster pinned across both cores. There is
//! no supervisor loop after that — `join_all` parks the main thread forever,
//! matching the teacher's own "tasks never exit" design.

use anyhow::{anyhow, Result};
use log::{info, warn};

use ecowatt::adapters::http::{EspHttpClient, InverterTransport};
use ecowatt::adapters::nvs::{ConfigPort, NvsAdapter};
use ecowatt::adapters::wifi::{ConnectivityPort, WifiAdapter};
use ecowatt::config::EcoWattConfig;
use ecowatt::diagnostics;
use ecowatt::protocol::RealSleeper;
use ecowatt::task_manager::{TaskId, TaskManager};
use ecowatt::tasks::{
    command_executor, compression_task, config_manager, ota, power_reporter, sensor_poll,
    uploader, watchdog,
};

/// Modbus slave id the inverter answers on (spec §4.2). Fixed for this
/// product line; unlike periods and register lists it isn't part of the
/// remote-delta config surface.
const INVERTER_SLAVE_ID: u8 = 1;

fn endpoint(base: &str, path: &str) -> heapless::String<64> {
    let mut s: heapless::String<64> = heapless::String::new();
    if s.push_str(base).is_err() || s.push_str(path).is_err() {
        log::error!("endpoint '{base}{path}' exceeds buffer, falling back to base only");
        s.clear();
        let _ = s.push_str(base);
    }
    s
}

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("EcoWatt firmware v{}", env!("CARGO_PKG_VERSION"));

    // Cancels the bootloader's rollback countdown now that we've made it
    // this far into boot (spec §4.10).
    ota::check_rollback();
    diagnostics::install_panic_handler();

    let nvs = match NvsAdapter::new() {
        Ok(n) => n,
        Err(e) => {
            warn!("NVS init failed ({e}), running with defaults and no persistence");
            NvsAdapter::default()
        }
    };

    let config = match nvs.load() {
        Ok(cfg) => {
            info!("config loaded from NVS");
            cfg
        }
        Err(e) => {
            warn!("config load failed ({e}), using built-in defaults");
            EcoWattConfig::default()
        }
    };

    let (hmac_key, enc_key) = nvs.load_or_provision_security_keys();
    let (ssid, password) = nvs.load_wifi_credentials();
    let server_base = nvs.load_server_base_url();
    let inverter_base = nvs.load_inverter_base_url();

    let mut wifi = WifiAdapter::new();
    match wifi.set_credentials(ssid.as_str(), password.as_str()) {
        Ok(()) => {
            if let Err(e) = wifi.connect() {
                warn!("initial WiFi connect failed ({e}), watchdog will drive reconnect");
            }
        }
        Err(e) => warn!("WiFi credentials rejected ({e}), staying disconnected"),
    }

    let mut tm = TaskManager::init(config).map_err(|e| anyhow!("task manager init: {e}"))?;

    let config_endpoint = endpoint(server_base.as_str(), "/config");
    let command_poll_endpoint = endpoint(server_base.as_str(), "/commands/poll");
    let command_result_endpoint = endpoint(server_base.as_str(), "/commands/result");
    let upload_endpoint = endpoint(server_base.as_str(), "/telemetry");
    let power_report_endpoint = endpoint(server_base.as_str(), "/power-report");
    let ota_manifest_endpoint = endpoint(server_base.as_str(), "/ota/manifest");

    // ── Sensor-Poll ────────────────────────────────────────────
    {
        let state = tm.state.clone();
        let inverter_base = inverter_base.clone();
        tm.spawn_task(TaskId::SensorPoll, move || {
            let http_client = match EspHttpClient::new() {
                Ok(c) => c,
                Err(e) => {
                    log::error!("sensor-poll: HTTP client init failed ({e}), task cannot run");
                    return;
                }
            };
            let transport = InverterTransport { client: &http_client };
            sensor_poll::run(state, transport, RealSleeper, inverter_base, INVERTER_SLAVE_ID);
        });
    }

    // ── Compression ────────────────────────────────────────────
    {
        let state = tm.state.clone();
        tm.spawn_task(TaskId::Compression, move || {
            compression_task::run(state);
        });
    }

    // ── Uploader ───────────────────────────────────────────────
    {
        let state = tm.state.clone();
        let nvs = NvsAdapter::new().unwrap_or_default();
        tm.spawn_task(TaskId::Upload, move || {
            let http_client = match EspHttpClient::new() {
                Ok(c) => c,
                Err(e) => {
                    log::error!("uploader: HTTP client init failed ({e}), task cannot run");
                    return;
                }
            };
            uploader::run(state, http_client, nvs, upload_endpoint, hmac_key, Some(enc_key));
        });
    }

    // ── Command Executor ───────────────────────────────────────
    {
        let state = tm.state.clone();
        let inverter_base = inverter_base.clone();
        tm.spawn_task(TaskId::Command, move || {
            let inverter_client = match EspHttpClient::new() {
                Ok(c) => c,
                Err(e) => {
                    log::error!("command-executor: inverter HTTP client init failed ({e})");
                    return;
                }
            };
            let server_client = match EspHttpClient::new() {
                Ok(c) => c,
                Err(e) => {
                    log::error!("command-executor: server HTTP client init failed ({e})");
                    return;
                }
            };
            let transport = InverterTransport { client: &inverter_client };
            command_executor::run(
                state,
                transport,
                RealSleeper,
                server_client,
                inverter_base,
                INVERTER_SLAVE_ID,
                command_poll_endpoint,
                command_result_endpoint,
            );
        });
    }

    // ── Config Manager ─────────────────────────────────────────
    {
        let state = tm.state.clone();
        let nvs = NvsAdapter::new().unwrap_or_default();
        tm.spawn_task(TaskId::Config, move || {
            let http_client = match EspHttpClient::new() {
                Ok(c) => c,
                Err(e) => {
                    log::error!("config-manager: HTTP client init failed ({e}), task cannot run");
                    return;
                }
            };
            config_manager::run(state, http_client, nvs, config_endpoint);
        });
    }

    // ── Power Reporter ─────────────────────────────────────────
    {
        let state = tm.state.clone();
        tm.spawn_task(TaskId::PowerReport, move || {
            let inverter_client = match EspHttpClient::new() {
                Ok(c) => c,
                Err(e) => {
                    log::error!("power-reporter: inverter HTTP client init failed ({e})");
                    return;
                }
            };
            let server_client = match EspHttpClient::new() {
                Ok(c) => c,
                Err(e) => {
                    log::error!("power-reporter: server HTTP client init failed ({e})");
                    return;
                }
            };
            power_reporter::run(
                state,
                InverterTransport { client: &inverter_client },
                RealSleeper,
                inverter_base,
                INVERTER_SLAVE_ID,
                server_client,
                power_report_endpoint,
            );
        });
    }

    // ── OTA Manager ────────────────────────────────────────────
    {
        let state = tm.state.clone();
        let nvs = NvsAdapter::new().unwrap_or_default();
        tm.spawn_task(TaskId::Ota, move || {
            let http_client = match EspHttpClient::new() {
                Ok(c) => c,
                Err(e) => {
                    log::error!("ota: HTTP client init failed ({e}), task cannot run");
                    return;
                }
            };
            ota::run(state, http_client, ota_manifest_endpoint, nvs);
        });
    }

    // ── Watchdog ───────────────────────────────────────────────
    {
        let state = tm.state.clone();
        tm.spawn_task(TaskId::Watchdog, move || {
            watchdog::run(state, wifi);
        });
    }

    info!("all tasks spawned, parking main thread");
    tm.join_all();
    Ok(())
}
