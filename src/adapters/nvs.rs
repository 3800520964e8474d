//! NVS (Non-Volatile Storage) adapter.
//!
//! Implements [`StoragePort`] generically plus a [`ConfigPort`] for
//! `EcoWattConfig`, and backs `security::nonce::NonceStore` so the nonce
//! counter in spec §4.12 survives reboots. Namespaces/keys per spec §6:
//! `security:nonce`, `config:*`, `ota:version`.
//!
//! # Security
//!
//! - Config is validated (`EcoWattConfig::validate`) before every persist.
//! - On ESP32, the namespaces below live on the encrypted NVS partition when
//!   flash encryption + `CONFIG_NVS_ENCRYPTION` are enabled; no code change
//!   is required here either way.
//! - Atomic writes: ESP-IDF NVS commits are atomic per `nvs_commit()`.

use crate::config::EcoWattConfig;
use crate::error::{ConfigError, StorageError};
use crate::security::nonce::NonceStore;
use log::{info, warn};

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

const CONFIG_NAMESPACE: &str = "config";
const CONFIG_KEY: &str = "ecowatt";
const NONCE_NAMESPACE: &str = "security";
const NONCE_KEY: &str = "nonce";
const OTA_NAMESPACE: &str = "ota";
const OTA_VERSION_KEY: &str = "version";
const SECURITY_NAMESPACE: &str = "security";
const HMAC_KEY_KEY: &str = "hmac_key";
const ENC_KEY_KEY: &str = "enc_key";

#[allow(dead_code)]
const MAX_BLOB_SIZE: usize = 4000;

/// Generic namespaced key/value store, the seam every subsystem persists
/// through (config, nonce, OTA version).
pub trait StoragePort: Send + Sync {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;
    fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError>;
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

/// Config-specific load/save, validating before every persist.
pub trait ConfigPort: Send + Sync {
    fn load(&self) -> Result<EcoWattConfig, ConfigError>;
    fn save(&self, config: &EcoWattConfig) -> Result<(), ConfigError>;
}

pub struct NvsAdapter {
    #[cfg(not(target_os = "espidf"))]
    store: std::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl NvsAdapter {
    /// Create a new `NvsAdapter` and initialise NVS flash. On first boot or
    /// after a version mismatch the partition is erased and re-initialised.
    pub fn new() -> Result<Self, ConfigError> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: nvs_flash_init/erase run from the single main-task
            // context before any concurrent NVS access starts.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                warn!("NVS: erasing and re-initialising flash partition");
                let ret2 = unsafe { nvs_flash_erase() };
                if ret2 != ESP_OK {
                    return Err(ConfigError::IoError);
                }
                let ret3 = unsafe { nvs_flash_init() };
                if ret3 != ESP_OK {
                    return Err(ConfigError::IoError);
                }
            } else if ret != ESP_OK {
                return Err(ConfigError::IoError);
            }
            info!("NvsAdapter: ESP-IDF NVS initialised");
        }

        #[cfg(not(target_os = "espidf"))]
        info!("NvsAdapter: simulation backend");

        Ok(Self {
            #[cfg(not(target_os = "espidf"))]
            store: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{namespace}::{key}")
    }

    #[cfg(target_os = "espidf")]
    fn with_nvs_handle<F, T>(namespace: &str, write: bool, f: F) -> Result<T, i32>
    where
        F: FnOnce(nvs_handle_t) -> Result<T, i32>,
    {
        let mut ns_buf = [0u8; 16];
        let ns_bytes = namespace.as_bytes();
        let len = ns_bytes.len().min(15);
        ns_buf[..len].copy_from_slice(&ns_bytes[..len]);

        let mut handle: nvs_handle_t = 0;
        let mode =
            if write { nvs_open_mode_t_NVS_READWRITE } else { nvs_open_mode_t_NVS_READONLY };

        let ret = unsafe { nvs_open(ns_buf.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }

        let result = f(handle);
        unsafe {
            nvs_close(handle);
        }
        result
    }
}

impl StoragePort for NvsAdapter {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let composite = Self::composite_key(namespace, key);
            match self.store.lock().unwrap().get(&composite) {
                Some(data) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok(len)
                }
                None => Err(StorageError::NotFound),
            }
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, false, |handle| {
                let mut key_buf = [0u8; 16];
                let kb = key.as_bytes();
                let kl = kb.len().min(15);
                key_buf[..kl].copy_from_slice(&kb[..kl]);

                let mut size = buf.len();
                let ret = unsafe {
                    nvs_get_blob(handle, key_buf.as_ptr() as *const _, buf.as_mut_ptr() as *mut _, &mut size)
                };
                if ret == ESP_ERR_NVS_NOT_FOUND {
                    return Err(ESP_ERR_NVS_NOT_FOUND);
                }
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(size)
            });
            match result {
                Ok(size) => Ok(size),
                Err(e) if e == ESP_ERR_NVS_NOT_FOUND => Err(StorageError::NotFound),
                Err(_) => Err(StorageError::IoError),
            }
        }
    }

    fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let composite = Self::composite_key(namespace, key);
            self.store.lock().unwrap().insert(composite, data.to_vec());
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, true, |handle| {
                let mut key_buf = [0u8; 16];
                let kb = key.as_bytes();
                let kl = kb.len().min(15);
                key_buf[..kl].copy_from_slice(&kb[..kl]);

                let ret = unsafe {
                    nvs_set_blob(handle, key_buf.as_ptr() as *const _, data.as_ptr() as *const _, data.len())
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            result.map_err(|_| StorageError::IoError)
        }
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let composite = Self::composite_key(namespace, key);
            self.store.lock().unwrap().remove(&composite);
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, true, |handle| {
                let mut key_buf = [0u8; 16];
                let kb = key.as_bytes();
                let kl = kb.len().min(15);
                key_buf[..kl].copy_from_slice(&kb[..kl]);

                let ret = unsafe { nvs_erase_key(handle, key_buf.as_ptr() as *const _) };
                if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            result.map_err(|_| StorageError::IoError)
        }
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        #[cfg(not(target_os = "espidf"))]
        {
            let composite = Self::composite_key(namespace, key);
            self.store.lock().unwrap().contains_key(&composite)
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, false, |handle| {
                let mut key_buf = [0u8; 16];
                let kb = key.as_bytes();
                let kl = kb.len().min(15);
                key_buf[..kl].copy_from_slice(&kb[..kl]);
                let ret =
                    unsafe { nvs_find_key(handle, key_buf.as_ptr() as *const _, core::ptr::null_mut()) };
                Ok(ret == ESP_OK)
            });
            result.unwrap_or(false)
        }
    }
}

impl ConfigPort for NvsAdapter {
    fn load(&self) -> Result<EcoWattConfig, ConfigError> {
        let mut buf = [0u8; MAX_BLOB_SIZE];
        match self.read(CONFIG_NAMESPACE, CONFIG_KEY, &mut buf) {
            Ok(len) => {
                let cfg: EcoWattConfig =
                    postcard::from_bytes(&buf[..len]).map_err(|_| ConfigError::Corrupted)?;
                cfg.validate()?;
                info!("NvsAdapter: loaded config ({len} bytes)");
                Ok(cfg)
            }
            Err(StorageError::NotFound) => {
                info!("NvsAdapter: no stored config, using defaults");
                Ok(EcoWattConfig::default())
            }
            Err(_) => {
                warn!("NvsAdapter: config read error, using defaults");
                Ok(EcoWattConfig::default())
            }
        }
    }

    fn save(&self, config: &EcoWattConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let bytes = postcard::to_allocvec(config).map_err(|_| ConfigError::IoError)?;
        self.write(CONFIG_NAMESPACE, CONFIG_KEY, &bytes).map_err(|_| ConfigError::IoError)?;
        info!("NvsAdapter: config saved ({} bytes)", bytes.len());
        Ok(())
    }
}

/// OTA firmware version string, persisted under `ota:version` (spec §6).
impl NvsAdapter {
    pub fn load_ota_version(&self) -> Option<heapless::String<32>> {
        let mut buf = [0u8; 32];
        let len = self.read(OTA_NAMESPACE, OTA_VERSION_KEY, &mut buf).ok()?;
        let s = core::str::from_utf8(&buf[..len]).ok()?;
        let mut out = heapless::String::new();
        out.push_str(s).ok()?;
        Some(out)
    }

    pub fn store_ota_version(&self, version: &str) -> Result<(), StorageError> {
        self.write(OTA_NAMESPACE, OTA_VERSION_KEY, version.as_bytes())
    }
}

/// HMAC/encryption key provisioning (spec §4.12). Real deployments flash
/// these two blobs into the `security` namespace at manufacturing time,
/// alongside every other per-device secret (WiFi credentials, device id); on
/// first boot without them this falls back to a fixed development key and
/// logs loudly, rather than failing to start.
impl NvsAdapter {
    pub fn load_or_provision_security_keys(
        &self,
    ) -> (
        [u8; crate::security::HMAC_KEY_LEN],
        [u8; crate::security::ENC_KEY_LEN],
    ) {
        let hmac_key = self.load_fixed_key::<{ crate::security::HMAC_KEY_LEN }>(HMAC_KEY_KEY);
        let enc_key = self.load_fixed_key::<{ crate::security::ENC_KEY_LEN }>(ENC_KEY_KEY);
        (hmac_key, enc_key)
    }

    /// WiFi STA credentials and the upstream server's base URL, provisioned
    /// the same way as the security keys: read if present, otherwise fall
    /// back to a loudly-logged development default so a bench unit still
    /// boots far enough to be useful.
    pub fn load_wifi_credentials(&self) -> (heapless::String<32>, heapless::String<64>) {
        let ssid = self
            .load_provisioned_string::<32>("wifi", "ssid")
            .unwrap_or_else(|| Self::fallback_string("EcoWatt-Dev"));
        let password = self
            .load_provisioned_string::<64>("wifi", "password")
            .unwrap_or_else(|| Self::fallback_string("ecowatt-dev-pw"));
        (ssid, password)
    }

    pub fn load_server_base_url(&self) -> heapless::String<64> {
        self.load_provisioned_string::<64>("server", "base_url")
            .unwrap_or_else(|| Self::fallback_string("http://ecowatt-server.local:8080"))
    }

    pub fn load_inverter_base_url(&self) -> heapless::String<64> {
        self.load_provisioned_string::<64>("inverter", "base_url")
            .unwrap_or_else(|| Self::fallback_string("http://ecowatt-inverter.local/rpc"))
    }

    fn fallback_string<const N: usize>(default: &str) -> heapless::String<N> {
        warn!("NvsAdapter: using unprovisioned default '{default}'");
        let mut s = heapless::String::new();
        let _ = s.push_str(default);
        s
    }

    fn load_provisioned_string<const N: usize>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Option<heapless::String<N>> {
        let mut buf = [0u8; N];
        let len = self.read(namespace, key, &mut buf).ok()?;
        let text = core::str::from_utf8(&buf[..len]).ok()?;
        let mut out = heapless::String::new();
        out.push_str(text).ok()?;
        Some(out)
    }

    fn load_fixed_key<const N: usize>(&self, key: &str) -> [u8; N] {
        let mut buf = [0u8; N];
        match self.read(SECURITY_NAMESPACE, key, &mut buf) {
            Ok(n) if n == N => buf,
            _ => {
                warn!(
                    "NvsAdapter: no provisioned '{key}', using fixed development key \
                     (factory flashing must overwrite this before shipping)"
                );
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = (i as u8).wrapping_mul(31).wrapping_add(key.as_bytes()[0]);
                }
                let _ = self.write(SECURITY_NAMESPACE, key, &buf);
                buf
            }
        }
    }
}

impl NonceStore for NvsAdapter {
    fn fetch_and_increment(&self) -> Result<u32, crate::error::SecurityError> {
        // Single critical section across the whole read-modify-write so a
        // crash between fetch and persist cannot leave the counter stale in
        // a way that would ever reissue an already-used value (spec §4.12).
        static NONCE_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
        let _guard = NONCE_GUARD.lock().unwrap();

        let current = self.peek()?;
        let next = current.wrapping_add(1);
        self.write(NONCE_NAMESPACE, NONCE_KEY, &next.to_be_bytes())
            .map_err(|_| crate::error::SecurityError::NonceUnavailable)?;
        Ok(next)
    }

    fn peek(&self) -> Result<u32, crate::error::SecurityError> {
        let mut buf = [0u8; 4];
        match self.read(NONCE_NAMESPACE, NONCE_KEY, &mut buf) {
            Ok(4) => Ok(u32::from_be_bytes(buf)),
            Ok(_) | Err(StorageError::NotFound) => Ok(0),
            Err(_) => Err(crate::error::SecurityError::NonceUnavailable),
        }
    }
}

impl Default for NvsAdapter {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self {
            #[cfg(not(target_os = "espidf"))]
            store: std::sync::Mutex::new(HashMap::new()),
        })
    }
}
