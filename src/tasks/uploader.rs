//! Uploader task (spec §4.7). Coalesces whatever `CompressedQueue` has
//! accumulated since the last cycle into one secured HTTP POST, retrying
//! failed packets on the next cycle instead of dropping them immediately.
//!
//! Grounded on the teacher's `rpc` client for the POST-with-retry shape and
//! on `security::secure_payload` for the envelope itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;

use crate::adapters::http::HttpClient;
use crate::compression::CompressedPacket;
use crate::config::CONFIG_CONSUMER_COUNT;
use crate::drivers::watchdog::Watchdog;
use crate::security::nonce::NonceStore;
use crate::security::{secure_payload, ENC_KEY_LEN, HMAC_KEY_LEN};
use crate::task_manager::SharedState;

/// Bounded net_mutex wait for the upload cycle (spec §4.7).
const NET_MUTEX_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for the secure-and-post step once `net_mutex` is held.
const DEADLINE: Duration = Duration::from_secs(5);
/// Packets retained across failed cycles before the oldest is dropped.
const STAGING_CAPACITY: usize = 16;

fn packet_to_json(packet: &CompressedPacket) -> serde_json::Value {
    let data_b64 = base64::engine::general_purpose::STANDARD.encode(packet.data.as_slice());
    let registers: Vec<u8> =
        packet.registers[..packet.register_count].iter().map(|r| *r as u8).collect();
    serde_json::json!({
        "timestamp": packet.timestamp,
        "sample_count": packet.sample_count,
        "register_count": packet.register_count,
        "registers": registers,
        "method": packet.method.wire_tag(),
        "uncompressed_size": packet.uncompressed_size,
        "compressed_size": packet.compressed_size,
        "data": data_b64,
    })
}

fn build_body(staging: &[CompressedPacket]) -> String {
    let packets: Vec<serde_json::Value> = staging.iter().map(packet_to_json).collect();
    serde_json::json!({ "packets": packets }).to_string()
}

/// One iteration: drain whatever is queued into `staging`, and if non-empty,
/// secure and POST it under `net_mutex`. On success `staging` is cleared; on
/// any failure (lock timeout, network error, server rejection) it is kept
/// for the next cycle, bounded by `STAGING_CAPACITY`.
pub fn tick<C: HttpClient, N: NonceStore>(
    state: &SharedState,
    client: &C,
    nonce_store: &N,
    endpoint: &str,
    hmac_key: &[u8; HMAC_KEY_LEN],
    enc_key: Option<&[u8; ENC_KEY_LEN]>,
    staging: &mut Vec<CompressedPacket>,
) {
    // Upload is the sole producer of `config_reload` tokens (spec §4.7 step
    // 6): it posts one per consumer on a successful cycle below, it never
    // takes one itself.
    let _ = state.batch_ready.drain();
    for packet in state.compressed_queue.drain_all() {
        if staging.len() >= STAGING_CAPACITY {
            log::warn!("uploader: staging full, dropping oldest packet");
            staging.remove(0);
        }
        staging.push(packet);
    }

    if staging.is_empty() {
        return;
    }

    let guard = match state.net_mutex.lock(NET_MUTEX_TIMEOUT) {
        Ok(guard) => guard,
        Err(_) => {
            log::warn!("uploader: net_mutex acquire timed out, retrying next cycle");
            if let Ok(mut monitor) = state.upload_deadline.lock() {
                monitor.record_network_miss();
            }
            return;
        }
    };

    let start = Instant::now();
    let body = build_body(staging);
    let outcome = secure_payload(&body, nonce_store, hmac_key, enc_key)
        .map_err(|e| e.to_string())
        .and_then(|envelope| serde_json::to_string(&envelope).map_err(|e| e.to_string()))
        .and_then(|envelope_json| client.post_json(endpoint, &envelope_json).map_err(|e| e.to_string()));
    drop(guard);

    let elapsed = start.elapsed();
    match outcome {
        Ok(_resp) => {
            staging.clear();
            state.config_reload.post(CONFIG_CONSUMER_COUNT as u32);
            if let Ok(mut monitor) = state.upload_deadline.lock() {
                if elapsed > DEADLINE {
                    log::warn!("uploader: deadline miss ({elapsed:?})");
                    monitor.record_task_local_miss();
                } else {
                    monitor.record_success();
                }
            }
        }
        Err(e) => {
            log::warn!("uploader: upload cycle failed, keeping {} packet(s): {e}", staging.len());
            if elapsed > DEADLINE {
                if let Ok(mut monitor) = state.upload_deadline.lock() {
                    monitor.record_task_local_miss();
                }
            }
        }
    }
}

pub fn run<C: HttpClient, N: NonceStore>(
    state: Arc<SharedState>,
    client: C,
    nonce_store: N,
    endpoint: heapless::String<64>,
    hmac_key: [u8; HMAC_KEY_LEN],
    enc_key: Option<[u8; ENC_KEY_LEN]>,
) {
    let watchdog = Watchdog::new();
    let mut next_wake = {
        let cfg = state.config.lock(crate::task_manager::MUTEX_TIMEOUT).expect("config lock at boot");
        Instant::now() + Duration::from_millis(u64::from(cfg.upload_period_ms))
    };
    let mut staging = Vec::new();

    loop {
        state.suspend_gate.wait_if_suspended();
        let period_ms = state
            .config
            .lock(crate::task_manager::MUTEX_TIMEOUT)
            .map(|cfg| cfg.upload_period_ms)
            .unwrap_or(15_000);
        // Apply and rebase (spec §4.7 step 2): a frequency change takes
        // effect on the next wake immediately rather than waiting out
        // whatever `next_wake` was computed from the old period.
        if state.take_upload_period_changed() {
            next_wake = Instant::now() + Duration::from_millis(u64::from(period_ms));
        }
        super::wait_for_next_tick(&mut next_wake, Duration::from_millis(u64::from(period_ms)));
        tick(&state, &client, &nonce_store, endpoint.as_str(), &hmac_key, enc_key.as_ref(), &mut staging);
        watchdog.feed();
    }
}
