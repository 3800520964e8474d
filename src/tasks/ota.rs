//! OTA Manager task (spec §4.10): Idle → CheckingManifest → Downloading →
//! Verifying → Applying → Finalizing → Reboot, or RollbackOnFailure on any
//! check along the way. Runs at `ota_check_period_ms`; does not feed the
//! hardware watchdog itself — a stuck download is exactly the condition the
//! TWDT should catch.
//!
//! Grounded on the teacher's `rpc::ota::OtaManager` (begin/write_chunk/
//! finalize/abort state machine backed by the `esp-ota` crate) and on
//! `HttpClient::stream_get` for the chunked download.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::adapters::http::HttpClient;
use crate::error::OtaError;
use crate::task_manager::{SharedState, MUTEX_TIMEOUT};

const CHUNK_SIZE: usize = 4096;
const NET_MUTEX_TIMEOUT: Duration = Duration::from_secs(30);

/// Persists and retrieves the currently-installed firmware version. Grounded
/// on `adapters::nvs::NvsAdapter::{load_ota_version, store_ota_version}`.
pub trait OtaVersionPort {
    fn load_version(&self) -> Option<heapless::String<32>>;
    fn store_version(&self, version: &str) -> Result<(), crate::error::StorageError>;
}

impl OtaVersionPort for crate::adapters::nvs::NvsAdapter {
    fn load_version(&self) -> Option<heapless::String<32>> {
        self.load_ota_version()
    }
    fn store_version(&self, version: &str) -> Result<(), crate::error::StorageError> {
        self.store_ota_version(version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    Idle,
    Receiving { expected_size: u32, bytes_written: u32 },
    Verifying,
    ReadyToReboot,
}

/// Wraps the platform OTA partition API. On host builds, writes are no-ops —
/// only the size/hash bookkeeping is real, which is all the tick logic below
/// exercises in tests.
pub struct OtaManager {
    phase: OtaPhase,
    #[cfg(target_os = "espidf")]
    ota_update: Option<esp_ota::OtaUpdate>,
}

impl OtaManager {
    pub fn new() -> Self {
        Self {
            phase: OtaPhase::Idle,
            #[cfg(target_os = "espidf")]
            ota_update: None,
        }
    }

    pub fn phase(&self) -> OtaPhase {
        self.phase
    }

    pub fn begin(&mut self, expected_size: u32) -> Result<(), OtaError> {
        #[cfg(target_os = "espidf")]
        {
            let update = esp_ota::OtaUpdate::begin().map_err(|e| {
                log::warn!("ota: esp-ota begin failed: {:?}", e);
                OtaError::SlotWriteFailed
            })?;
            self.ota_update = Some(update);
        }
        self.phase = OtaPhase::Receiving { expected_size, bytes_written: 0 };
        Ok(())
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), OtaError> {
        let OtaPhase::Receiving { expected_size, bytes_written } = self.phase else {
            return Err(OtaError::SlotWriteFailed);
        };

        #[cfg(target_os = "espidf")]
        {
            if let Some(ref mut update) = self.ota_update {
                update.write(data).map_err(|e| {
                    log::warn!("ota: esp-ota write failed: {:?}", e);
                    OtaError::SlotWriteFailed
                })?;
            } else {
                return Err(OtaError::SlotWriteFailed);
            }
        }

        self.phase = OtaPhase::Receiving {
            expected_size,
            bytes_written: bytes_written + data.len() as u32,
        };
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<(), OtaError> {
        let OtaPhase::Receiving { expected_size, bytes_written } = self.phase else {
            return Err(OtaError::SlotWriteFailed);
        };
        if bytes_written != expected_size {
            return Err(OtaError::SizeMismatch);
        }

        self.phase = OtaPhase::Verifying;

        #[cfg(target_os = "espidf")]
        {
            if let Some(update) = self.ota_update.take() {
                let mut completed = update.finalize().map_err(|e| {
                    log::warn!("ota: esp-ota finalize failed: {:?}", e);
                    OtaError::SlotWriteFailed
                })?;
                completed.set_as_boot_partition().map_err(|e| {
                    log::warn!("ota: esp-ota set_as_boot_partition failed: {:?}", e);
                    OtaError::SlotWriteFailed
                })?;
            } else {
                return Err(OtaError::SlotWriteFailed);
            }
        }

        self.phase = OtaPhase::ReadyToReboot;
        Ok(())
    }

    pub fn abort(&mut self) {
        #[cfg(target_os = "espidf")]
        {
            self.ota_update.take();
        }
        self.phase = OtaPhase::Idle;
    }

    #[cfg(target_os = "espidf")]
    pub fn reboot(&self) -> ! {
        log::info!("ota: rebooting into new firmware");
        esp_ota::restart();
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn reboot(&self) -> ! {
        panic!("ota: reboot (simulation — no real hardware reset)");
    }
}

/// Mark the currently running image valid so the bootloader's rollback
/// watchdog stops counting failed boots against it. Call once at startup,
/// after enough of the boot sequence has run to prove the new image works.
#[cfg(target_os = "espidf")]
pub fn check_rollback() {
    match esp_ota::mark_app_valid() {
        Ok(()) => log::info!("ota: firmware marked valid, rollback cancelled"),
        Err(e) => log::warn!("ota: mark_app_valid failed: {e:?}"),
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn check_rollback() {
    log::info!("ota: rollback check (simulation): skipped");
}

impl Default for OtaManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, serde::Deserialize)]
struct OtaManifest {
    version: heapless::String<32>,
    size: u32,
    sha256: heapless::String<64>,
    url: heapless::String<128>,
}

fn from_hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn decode_hex_sha256(hex: &str) -> Option<[u8; 32]> {
    let bytes = hex.as_bytes();
    if bytes.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in bytes.chunks(2).enumerate() {
        let (hi, lo) = (from_hex_nibble(chunk[0])?, from_hex_nibble(chunk[1])?);
        out[i] = (hi << 4) | lo;
    }
    Some(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaOutcome {
    UpToDate,
    Applied,
    Failed,
}

/// One iteration: fetch the manifest, and if its version differs from the
/// installed one, suspend every other task, download+verify+flash, and
/// leave the manager `ReadyToReboot` on success (the thin `run()` wrapper
/// performs the actual reboot). `net_mutex` is acquired once before the
/// manifest fetch and held straight through `suspend()`/`apply_update` so
/// re-acquisition can never deadlock against a task still mid-wait on it
/// when the gate closes (spec §4.10/§5). Any failure along the way — fetch,
/// size, or hash mismatch — aborts and resumes normal operation instead of
/// rebooting (spec §4.10's `RollbackOnFailure`).
pub fn tick<C: HttpClient, P: OtaVersionPort>(
    state: &SharedState,
    client: &C,
    manifest_endpoint: &str,
    version_port: &P,
    ota: &mut OtaManager,
) -> OtaOutcome {
    let _ = state.config_reload.try_take();

    let guard = match state.net_mutex.lock(NET_MUTEX_TIMEOUT) {
        Ok(guard) => guard,
        Err(_) => {
            log::warn!("ota: net_mutex acquire timed out for manifest check");
            return OtaOutcome::Failed;
        }
    };

    let manifest: OtaManifest = match fetch_manifest(client, manifest_endpoint) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("ota: manifest check failed: {e}");
            return OtaOutcome::Failed;
        }
    };

    let installed = version_port.load_version();
    if installed.as_deref() == Some(manifest.version.as_str()) {
        log::info!("ota: firmware up to date ({})", manifest.version);
        return OtaOutcome::UpToDate;
    }

    let Some(expected_sha) = decode_hex_sha256(manifest.sha256.as_str()) else {
        log::warn!("ota: manifest sha256 malformed");
        return OtaOutcome::Failed;
    };

    log::info!("ota: new firmware available ({} -> {})", installed.as_deref().unwrap_or("none"), manifest.version);
    state.suspend_gate.suspend();
    state.set_ota_in_progress(true);

    let outcome = apply_update(client, &manifest, &expected_sha, ota, version_port);
    drop(guard);

    state.set_ota_in_progress(false);
    state.suspend_gate.resume();
    outcome
}

fn fetch_manifest<C: HttpClient>(client: &C, manifest_endpoint: &str) -> Result<OtaManifest, OtaError> {
    let body = client.get(manifest_endpoint).map_err(|_| OtaError::ManifestFetchFailed)?;
    serde_json::from_str(&body).map_err(|_| OtaError::ManifestFetchFailed)
}

fn apply_update<C: HttpClient, P: OtaVersionPort>(
    client: &C,
    manifest: &OtaManifest,
    expected_sha: &[u8; 32],
    ota: &mut OtaManager,
    version_port: &P,
) -> OtaOutcome {
    if ota.begin(manifest.size).is_err() {
        return OtaOutcome::Failed;
    }

    let mut hasher = Sha256::new();
    let mut write_err = false;
    let stream_result = client.stream_get(manifest.url.as_str(), CHUNK_SIZE, &mut |chunk| {
        hasher.update(chunk);
        if ota.write_chunk(chunk).is_err() {
            write_err = true;
            return Err(crate::adapters::http::HttpError::Io);
        }
        Ok(())
    });

    if stream_result.is_err() || write_err {
        log::warn!("ota: chunk download failed");
        ota.abort();
        return OtaOutcome::Failed;
    }

    let digest: [u8; 32] = hasher.finalize().into();
    if &digest != expected_sha {
        log::error!("ota: SHA-256 mismatch, rolling back");
        ota.abort();
        return OtaOutcome::Failed;
    }

    if ota.finalize().is_err() {
        log::error!("ota: finalize failed");
        ota.abort();
        return OtaOutcome::Failed;
    }

    if version_port.store_version(manifest.version.as_str()).is_err() {
        log::warn!("ota: failed to persist new version string (non-fatal, proceeding)");
    }

    log::info!("ota: applied {}, ready to reboot", manifest.version);
    OtaOutcome::Applied
}

pub fn run<C: HttpClient, P: OtaVersionPort>(
    state: Arc<SharedState>,
    client: C,
    manifest_endpoint: heapless::String<64>,
    version_port: P,
) {
    let mut ota = OtaManager::new();
    let mut next_wake = {
        let cfg = state.config.lock(MUTEX_TIMEOUT).expect("config lock at boot");
        std::time::Instant::now() + Duration::from_millis(u64::from(cfg.ota_check_period_ms))
    };

    loop {
        state.suspend_gate.wait_if_suspended();
        let period_ms = state.config.lock(MUTEX_TIMEOUT).map(|c| c.ota_check_period_ms).unwrap_or(3_600_000);
        super::wait_for_next_tick(&mut next_wake, Duration::from_millis(u64::from(period_ms)));
        if tick(&state, &client, manifest_endpoint.as_str(), &version_port, &mut ota) == OtaOutcome::Applied {
            ota.reboot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http::HttpError;
    use crate::config::EcoWattConfig;
    use crate::task_manager::TaskManager;
    use sha2::{Digest, Sha256};
    use std::cell::RefCell;

    struct StubVersionPort {
        installed: Option<&'static str>,
        stored: RefCell<Option<String>>,
    }

    impl OtaVersionPort for StubVersionPort {
        fn load_version(&self) -> Option<heapless::String<32>> {
            self.installed.map(|v| {
                let mut s = heapless::String::new();
                let _ = s.push_str(v);
                s
            })
        }
        fn store_version(&self, version: &str) -> Result<(), crate::error::StorageError> {
            *self.stored.borrow_mut() = Some(version.to_string());
            Ok(())
        }
    }

    struct StubClient {
        manifest: String,
        firmware: Vec<u8>,
        fail_download: bool,
    }

    impl HttpClient for StubClient {
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
            if self.fail_download {
                return Err(HttpError::Io);
            }
            for chunk in self.firmware.chunks(chunk_size) {
                on_chunk(chunk)?;
            }
            Ok(())
        }
    }

    fn manifest_json(version: &str, firmware: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(firmware);
        let digest: [u8; 32] = hasher.finalize().into();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        serde_json::json!({
            "version": version,
            "size": firmware.len() as u32,
            "sha256": hex,
            "url": "http://fw/image.bin",
        })
        .to_string()
    }

    #[test]
    fn matching_version_is_a_no_op() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        let firmware = vec![0xAB; 10_000];
        let client = StubClient {
            manifest: manifest_json("1.0.0", &firmware),
            firmware,
            fail_download: false,
        };
        let version_port = StubVersionPort { installed: Some("1.0.0"), stored: RefCell::new(None) };
        let mut ota = OtaManager::new();

        let outcome = tick(&tm.state, &client, "http://manifest", &version_port, &mut ota);

        assert_eq!(outcome, OtaOutcome::UpToDate);
        assert!(!tm.state.ota_in_progress());
    }

    #[test]
    fn new_version_downloads_verifies_and_applies() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        let firmware = vec![0x42; 10_000];
        let client = StubClient {
            manifest: manifest_json("2.0.0", &firmware),
            firmware,
            fail_download: false,
        };
        let version_port = StubVersionPort { installed: Some("1.0.0"), stored: RefCell::new(None) };
        let mut ota = OtaManager::new();

        let outcome = tick(&tm.state, &client, "http://manifest", &version_port, &mut ota);

        assert_eq!(outcome, OtaOutcome::Applied);
        assert_eq!(ota.phase(), OtaPhase::ReadyToReboot);
        assert_eq!(version_port.stored.borrow().as_deref(), Some("2.0.0"));
        assert!(!tm.state.ota_in_progress());
        assert!(!tm.state.suspend_gate.is_suspended());
    }

    #[test]
    fn hash_mismatch_aborts_and_resumes_without_applying() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        let real_firmware = vec![0x11; 10_000];
        let mut manifest: serde_json::Value =
            serde_json::from_str(&manifest_json("2.0.0", &real_firmware)).unwrap();
        manifest["sha256"] = serde_json::Value::String("00".repeat(32));
        let client = StubClient {
            manifest: manifest.to_string(),
            firmware: real_firmware,
            fail_download: false,
        };
        let version_port = StubVersionPort { installed: Some("1.0.0"), stored: RefCell::new(None) };
        let mut ota = OtaManager::new();

        let outcome = tick(&tm.state, &client, "http://manifest", &version_port, &mut ota);

        assert_eq!(outcome, OtaOutcome::Failed);
        assert_eq!(ota.phase(), OtaPhase::Idle);
        assert!(version_port.stored.borrow().is_none());
        assert!(!tm.state.ota_in_progress());
        assert!(!tm.state.suspend_gate.is_suspended());
    }

    #[test]
    fn download_failure_aborts_cleanly() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        let firmware = vec![0x22; 10_000];
        let client = StubClient {
            manifest: manifest_json("2.0.0", &firmware),
            firmware,
            fail_download: true,
        };
        let version_port = StubVersionPort { installed: Some("1.0.0"), stored: RefCell::new(None) };
        let mut ota = OtaManager::new();

        let outcome = tick(&tm.state, &client, "http://manifest", &version_port, &mut ota);

        assert_eq!(outcome, OtaOutcome::Failed);
        assert_eq!(ota.phase(), OtaPhase::Idle);
    }

    #[test]
    fn malformed_manifest_is_ignored_without_panicking() {
        let tm = TaskManager::init(EcoWattConfig::default()).unwrap();
        let client = StubClient { manifest: "not json".to_string(), firmware: vec![], fail_download: false };
        let version_port = StubVersionPort { installed: Some("1.0.0"), stored: RefCell::new(None) };
        let mut ota = OtaManager::new();

        let outcome = tick(&tm.state, &client, "http://manifest", &version_port, &mut ota);

        assert_eq!(outcome, OtaOutcome::Failed);
    }
}
