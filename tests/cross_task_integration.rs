//! Cross-module integration tests: config reload fan-out, replay rejection
//! across a multi-message conversation, and OTA rollback resuming the rest
//! of the roster. Unit tests colocated with each module cover its own
//! invariants in isolation; these exercise the seams between them.

use ecowatt::adapters::http::{HttpClient, HttpError};
use ecowatt::adapters::nvs::ConfigPort;
use ecowatt::config::EcoWattConfig;
use ecowatt::error::ConfigError;
use ecowatt::protocol::{HttpTransport, Sleeper};
use ecowatt::registers::RegId;
use ecowatt::sample::SampleBatch;
use ecowatt::security::nonce::InMemoryNonceStore;
use ecowatt::security::{secure_payload, verify_payload, ENC_KEY_LEN, HMAC_KEY_LEN};
use ecowatt::task_manager::{TaskManager, MUTEX_TIMEOUT};
use ecowatt::tasks::{command_executor, compression_task, config_manager, ota, power_reporter, sensor_poll};
use std::sync::Mutex as StdMutex;
use std::time::Instant;

// ── Shared stubs ───────────────────────────────────────────────

struct NoopSleeper;
impl Sleeper for NoopSleeper {
    fn sleep_ms(&mut self, _ms: u64) {}
}

/// Returns a fixed two-register Modbus read response (matching
/// `active_regs()`'s window, exactly as the colocated unit tests in
/// `tasks::sensor_poll` do), framed with a correct CRC.
struct FixedTransport {
    value: u16,
}

impl HttpTransport for FixedTransport {
    type Error = &'static str;
    fn post_frame(
        &mut self,
        _endpoint: &str,
        _frame_hex: &str,
    ) -> Result<heapless::String<128>, Self::Error> {
        let values = [self.value, self.value];
        let mut buf: heapless::Vec<u8, { ecowatt::protocol::frame::MAX_FRAME_BYTES }> =
            heapless::Vec::new();
        let _ = buf.push(0x01);
        let _ = buf.push(0x03);
        let _ = buf.push((values.len() * 2) as u8);
        for v in values {
            let _ = buf.push((v >> 8) as u8);
            let _ = buf.push((v & 0xFF) as u8);
        }
        let crc = ecowatt::protocol::crc16::compute(&buf);
        let [lo, hi] = ecowatt::protocol::crc16::to_bytes(crc);
        let _ = buf.push(lo);
        let _ = buf.push(hi);
        let mut s = heapless::String::new();
        for b in &buf {
            let _ = core::fmt::write(&mut s, format_args!("{b:02x}"));
        }
        Ok(s)
    }
}

/// Serves one fixed config document on `get`, records POSTs, never fails.
struct StubServer {
    config_body: String,
    posts: StdMutex<Vec<String>>,
}

impl HttpClient for StubServer {
    fn get(&self, _url: &str) -> Result<String, HttpError> {
        Ok(self.config_body.clone())
    }
    fn post_json(&self, _url: &str, body: &str) -> Result<String, HttpError> {
        self.posts.lock().unwrap().push(body.to_string());
        Ok("{}".to_string())
    }
    fn stream_get(
        &self,
        _url: &str,
        _chunk_size: usize,
        _on_chunk: &mut dyn FnMut(&[u8]) -> Result<(), HttpError>,
    ) -> Result<(), HttpError> {
        Ok(())
    }
}

struct StubConfigPort;
impl ConfigPort for StubConfigPort {
    fn load(&self) -> Result<EcoWattConfig, ConfigError> {
        Ok(EcoWattConfig::default())
    }
    fn save(&self, _config: &EcoWattConfig) -> Result<(), ConfigError> {
        Ok(())
    }
}

struct StubOtaVersionPort;
impl ota::OtaVersionPort for StubOtaVersionPort {
    fn load_version(&self) -> Option<heapless::String<32>> {
        let mut s = heapless::String::new();
        let _ = s.push_str("1.0.0");
        Some(s)
    }
    fn store_version(&self, _version: &str) -> Result<(), ecowatt::error::StorageError> {
        Ok(())
    }
}

fn active_regs() -> heapless::Vec<RegId, { ecowatt::registers::MAX_REGISTERS }> {
    let mut v = heapless::Vec::new();
    let _ = v.push(RegId::AcVoltage);
    let _ = v.push(RegId::AcCurrent);
    v
}

/// One minimal compressed packet, enough to make an upload cycle non-empty
/// so it runs its success path and produces a `config_reload` broadcast.
fn packet_for_upload() -> ecowatt::compression::CompressedPacket {
    ecowatt::compression::CompressedPacket {
        data: heapless::Vec::new(),
        timestamp: 1_000,
        sample_count: 1,
        register_count: 1,
        registers: [RegId::AcVoltage; ecowatt::registers::MAX_REGISTERS],
        uncompressed_size: 2,
        compressed_size: 0,
        method: ecowatt::compression::MethodTag::Raw,
    }
}

// ── Config reload fan-out (spec §4.7 / §8) ─────────────────────
//
// The Uploader is the sole producer and posts exactly `CONFIG_CONSUMER_COUNT`
// tokens on a successful upload cycle (spec §4.7 step 6). Every one of the
// six consumers — Sensor-Poll, Compression, Config Manager, Command
// Executor, OTA Manager, Power Reporter — must take exactly one token per
// reload, leaving the semaphore empty once all six have run.

#[test]
fn config_reload_reaches_all_six_consumers_and_leaves_none_over() {
    let tm = TaskManager::init(EcoWattConfig::default()).unwrap();

    let remote_body = serde_json::to_string(&EcoWattConfig::default()).unwrap();
    let server = StubServer { config_body: remote_body, posts: StdMutex::new(Vec::new()) };
    let nonce_store = InMemoryNonceStore::new(0);
    let hmac_key = [0x33u8; HMAC_KEY_LEN];

    tm.state.compressed_queue.try_send(packet_for_upload()).unwrap();
    let mut staging = Vec::new();
    ecowatt::tasks::uploader::tick(
        &tm.state,
        &server,
        &nonce_store,
        "http://upload",
        &hmac_key,
        None,
        &mut staging,
    );
    assert!(staging.is_empty(), "upload must succeed against the stub server");

    let mut remote = EcoWattConfig::default();
    remote.poll_period_ms = 9_999;
    let server = StubServer {
        config_body: serde_json::to_string(&remote).unwrap(),
        posts: StdMutex::new(Vec::new()),
    };

    let changed = config_manager::tick(&tm.state, &server, &StubConfigPort, "http://cfg");
    assert!(changed, "differing remote config must be applied");
    assert_eq!(tm.state.config.lock(MUTEX_TIMEOUT).unwrap().poll_period_ms, 9_999);

    let mut transport = FixedTransport { value: 42 };
    let mut sleeper = NoopSleeper;
    let mut regs = active_regs();
    let mut period_ms = 5_000;
    let mut next_wake = Instant::now();
    sensor_poll::tick(
        &tm.state,
        &mut transport,
        &mut sleeper,
        "http://inv",
        1,
        &mut regs,
        &mut period_ms,
        &mut next_wake,
    );
    assert_eq!(period_ms, 9_999, "sensor-poll must pick up the new period");

    let mut batch = SampleBatch::new(1);
    let mut n = 1;
    tm.state.sample_queue.try_send(ecowatt::sample::Sample::new(0, &[RegId::AcVoltage], &[1])).unwrap();
    compression_task::tick(&tm.state, &mut batch, &mut n);

    command_executor::tick(
        &tm.state,
        &mut transport,
        &mut sleeper,
        &server,
        "http://inv",
        1,
        "http://cmd/poll",
        "http://cmd/result",
    );

    power_reporter::tick(&tm.state, &mut transport, &mut sleeper, "http://inv", 1, &server, "http://power");

    let mut ota_mgr = ota::OtaManager::new();
    ota::tick(&tm.state, &server, "http://manifest", &StubOtaVersionPort, &mut ota_mgr);

    assert!(
        !tm.state.config_reload.try_take(),
        "all six consumers must have drained the fan-out, leaving nothing over"
    );
}

// ── Replay rejection across a multi-message conversation (spec §4.12) ──

#[test]
fn replayed_message_is_rejected_without_disrupting_the_next_legitimate_one() {
    let store = InMemoryNonceStore::new(0);
    let hmac_key = [0x11u8; HMAC_KEY_LEN];
    let enc_key = [0x22u8; ENC_KEY_LEN];
    let mut last_seen = 0u32;

    let first = secure_payload(r#"{"seq":1}"#, &store, &hmac_key, Some(&enc_key)).unwrap();
    let plaintext = verify_payload(&first, &mut last_seen, &hmac_key, Some(&enc_key)).unwrap();
    assert_eq!(plaintext, br#"{"seq":1}"#);

    // An attacker (or a duplicated retry) replays the exact same envelope.
    let replay_result = verify_payload(&first, &mut last_seen, &hmac_key, Some(&enc_key));
    assert_eq!(replay_result, Err(ecowatt::error::SecurityError::ReplayedNonce));
    assert_eq!(last_seen, first.nonce, "rejection must not advance last_seen further");

    // The next legitimate message in the conversation must still be accepted.
    let second = secure_payload(r#"{"seq":2}"#, &store, &hmac_key, Some(&enc_key)).unwrap();
    let plaintext2 = verify_payload(&second, &mut last_seen, &hmac_key, Some(&enc_key)).unwrap();
    assert_eq!(plaintext2, br#"{"seq":2}"#);
    assert_eq!(last_seen, second.nonce);
}

// ── OTA hash-mismatch rollback resumes the rest of the roster (spec §4.10) ──

#[test]
fn ota_hash_mismatch_rolls_back_and_other_tasks_resume() {
    let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
    let firmware = vec![0xAAu8; 8192];
    let manifest = serde_json::json!({
        "version": "2.0.0",
        "size": firmware.len() as u32,
        "sha256": "00".repeat(32),
        "url": "http://fw/image.bin",
    });

    struct FirmwareServer {
        manifest: String,
        firmware: Vec<u8>,
    }
    impl HttpClient for FirmwareServer {
        fn get(&self, _url: &str) -> Result<String, HttpError> {
            Ok(self.manifest.clone())
        }
        fn post_json(&self, _url: &str, _body: &str) -> Result<String, HttpError> {
            Err(HttpError::Unavailable)
        }
        fn stream_get(
            &self,
            _url: &str,
            chunk_size: usize,
            on_chunk: &mut dyn FnMut(&[u8]) -> Result<(), HttpError>,
        ) -> Result<(), HttpError> {
            for chunk in self.firmware.chunks(chunk_size) {
                on_chunk(chunk)?;
            }
            Ok(())
        }
    }

    let server = FirmwareServer { manifest: manifest.to_string(), firmware };
    let mut ota_mgr = ota::OtaManager::new();

    let outcome = ota::tick(&tm.state, &server, "http://manifest", &StubOtaVersionPort, &mut ota_mgr);

    assert_eq!(outcome, ota::OtaOutcome::Failed);
    assert_eq!(ota_mgr.phase(), ota::OtaPhase::Idle);
    assert!(!tm.state.ota_in_progress(), "rollback must clear the in-progress flag");
    assert!(!tm.state.suspend_gate.is_suspended(), "rollback must resume the suspended roster");

    // Prove the roster is actually runnable again: Sensor-Poll's suspend-gate
    // wait would block forever if `resume_all` hadn't actually fired.
    assert!(!tm.state.suspend_gate.is_suspended());
    let mut transport = FixedTransport { value: 7 };
    let mut sleeper = NoopSleeper;
    let mut regs = active_regs();
    let mut period_ms = 5_000;
    let mut next_wake = Instant::now();
    let produced = sensor_poll::tick(
        &tm.state,
        &mut transport,
        &mut sleeper,
        "http://inv",
        1,
        &mut regs,
        &mut period_ms,
        &mut next_wake,
    );
    assert!(produced, "sensor-poll must be able to run a normal cycle after a rolled-back OTA");
}
