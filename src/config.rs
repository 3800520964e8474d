//! System configuration parameters.
//!
//! All tunable parameters for the EcoWatt firmware. Values can be overridden
//! by the Config Manager's remote-delta pull; the in-process copy is only
//! ever mutated by that task and reloaded by consumers on a reload-semaphore
//! token (see `sync::CountingSemaphore` and `tasks::config_manager`).

use crate::error::ConfigError;
use crate::registers::{RegId, MAX_REGISTERS};
use crate::sample::MAX_BATCH_SAMPLES;
use serde::{Deserialize, Serialize};

/// Number of tasks that consume configuration and must take a reload token
/// after a successful upload (spec §4.7): Sensor-Poll, Compression, Config
/// Manager, Command Executor, OTA Manager, Power Reporter.
pub const CONFIG_CONSUMER_COUNT: usize = 6;

/// Core system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcoWattConfig {
    /// Sensor-Poll task period (ms).
    pub poll_period_ms: u32,
    /// Uploader task period (ms).
    pub upload_period_ms: u32,
    /// Config Manager task period (ms).
    pub config_check_period_ms: u32,
    /// Command Executor task period (ms).
    pub command_check_period_ms: u32,
    /// OTA Manager task period (ms).
    pub ota_check_period_ms: u32,
    /// Power Reporter task period (ms).
    pub power_report_period_ms: u32,
    /// Active register set, ordered (decoder-alignment-significant).
    pub active_registers: heapless::Vec<RegId, MAX_REGISTERS>,
}

/// Floor for every period field. Guards against a remote delta setting a
/// period to zero and spinning a task.
const MIN_PERIOD_MS: u32 = 100;

impl EcoWattConfig {
    /// `N = upload_period / poll_period`, the number of samples per batch.
    pub fn batch_size(&self) -> usize {
        (self.upload_period_ms / self.poll_period_ms.max(1)) as usize
    }

    /// Validate before persisting (Config Manager applies remote deltas to a
    /// scratch copy and calls this before committing to NVS — mirrors the
    /// teacher's `NvsAdapter::validate_config` range-check discipline).
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, period) in [
            ("poll_period_ms", self.poll_period_ms),
            ("upload_period_ms", self.upload_period_ms),
            ("config_check_period_ms", self.config_check_period_ms),
            ("command_check_period_ms", self.command_check_period_ms),
            ("ota_check_period_ms", self.ota_check_period_ms),
            ("power_report_period_ms", self.power_report_period_ms),
        ] {
            if period < MIN_PERIOD_MS {
                log::warn!("config: {name}={period}ms below floor {MIN_PERIOD_MS}ms");
                return Err(ConfigError::ValidationFailed("period below minimum"));
            }
        }
        if self.upload_period_ms < self.poll_period_ms {
            return Err(ConfigError::ValidationFailed("upload_period shorter than poll_period"));
        }
        if self.active_registers.is_empty() {
            return Err(ConfigError::ValidationFailed("active_registers empty"));
        }
        if self.batch_size() > MAX_BATCH_SAMPLES {
            return Err(ConfigError::ValidationFailed("batch_size exceeds MAX_BATCH_SAMPLES"));
        }
        Ok(())
    }
}

impl Default for EcoWattConfig {
    fn default() -> Self {
        let mut active_registers = heapless::Vec::new();
        for r in [
            RegId::AcVoltage,
            RegId::AcCurrent,
            RegId::AcPowerWatts,
            RegId::DcVoltage,
            RegId::DcCurrent,
            RegId::DcPowerWatts,
        ] {
            let _ = active_registers.push(r);
        }

        Self {
            poll_period_ms: 5_000,
            upload_period_ms: 15_000,
            config_check_period_ms: 30_000,
            command_check_period_ms: 10_000,
            ota_check_period_ms: 3_600_000,
            power_report_period_ms: 60_000,
            active_registers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_batch_size_is_three() {
        let cfg = EcoWattConfig::default();
        assert_eq!(cfg.batch_size(), 3);
    }

    #[test]
    fn default_active_registers_nonempty() {
        assert!(!EcoWattConfig::default().active_registers.is_empty());
    }

    #[test]
    fn default_config_validates() {
        assert!(EcoWattConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_period_is_rejected() {
        let mut cfg = EcoWattConfig::default();
        cfg.poll_period_ms = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ValidationFailed("period below minimum")));
    }

    #[test]
    fn empty_active_registers_is_rejected() {
        let mut cfg = EcoWattConfig::default();
        cfg.active_registers.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::ValidationFailed("active_registers empty")));
    }

    #[test]
    fn upload_shorter_than_poll_is_rejected() {
        let mut cfg = EcoWattConfig::default();
        cfg.upload_period_ms = 1_000;
        cfg.poll_period_ms = 5_000;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ValidationFailed("upload_period shorter than poll_period"))
        );
    }
}
