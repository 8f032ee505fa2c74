//! Pool Configuration
//!
//! Settings for the device pool manager:
//! - Tool binary locations (adb, fastboot)
//! - Placeholder slot counts (emulators, null devices)
//! - Polling and retry cadence
//! - Per-device timeout defaults

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Configuration for the device pool manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Path to the adb binary (resolved against PATH if bare)
    pub adb_path: String,
    /// Path to the fastboot binary (resolved against PATH if bare)
    pub fastboot_path: String,
    /// Number of emulator placeholder slots added at init
    pub num_emulators: u32,
    /// Number of null-device placeholder slots added at init
    pub num_null_devices: u32,
    /// Capture logcat in the background for allocated devices
    pub enable_logcat: bool,
    /// Interval between bridge device-list refreshes, in ms
    pub bridge_poll_interval_ms: u64,
    /// Interval between fastboot device polls, in ms
    pub fastboot_poll_interval_ms: u64,
    /// Attempts for `adb connect` before giving up
    pub adb_connect_attempts: u32,
    /// Wait between failed `adb connect` attempts, in ms
    pub adb_connect_wait_ms: u64,
    /// Per-device timeout defaults
    pub device: DeviceOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            fastboot_path: "fastboot".to_string(),
            num_emulators: 1,
            num_null_devices: 1,
            enable_logcat: true,
            bridge_poll_interval_ms: 1_000,
            fastboot_poll_interval_ms: 5_000,
            adb_connect_attempts: 3,
            adb_connect_wait_ms: 5_000,
            device: DeviceOptions::default(),
        }
    }
}

impl PoolConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        debug!("Loaded pool config from {:?}", path);
        Ok(config)
    }

    /// Resolve the adb and fastboot binaries against PATH.
    ///
    /// Bare names are replaced with absolute paths when found; missing
    /// tools are left as-is with a warning (fastboot support is probed
    /// separately at init).
    pub fn resolve_tools(&mut self) {
        match which::which(&self.adb_path) {
            Ok(path) => self.adb_path = path.display().to_string(),
            Err(_) => warn!("adb binary '{}' not found on PATH", self.adb_path),
        }
        match which::which(&self.fastboot_path) {
            Ok(path) => self.fastboot_path = path.display().to_string(),
            Err(_) => debug!("fastboot binary '{}' not found on PATH", self.fastboot_path),
        }
    }

    pub fn bridge_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bridge_poll_interval_ms)
    }

    pub fn fastboot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fastboot_poll_interval_ms)
    }

    pub fn adb_connect_wait(&self) -> Duration {
        Duration::from_millis(self.adb_connect_wait_ms)
    }
}

/// Per-device timeout and logcat defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Max time to wait for a device to come online, in ms
    pub online_timeout_ms: u64,
    /// Max time to wait for a device to be fully available, in ms
    pub available_timeout_ms: u64,
    /// Max time for adb-based recovery, in ms
    pub adb_recovery_timeout_ms: u64,
    /// Max bytes of logcat output retained per device
    pub max_logcat_data_size: u64,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            online_timeout_ms: 60 * 1000,
            available_timeout_ms: 6 * 60 * 1000,
            adb_recovery_timeout_ms: 60 * 1000,
            max_logcat_data_size: 20 * 1024 * 1024,
        }
    }
}

impl DeviceOptions {
    pub fn online_timeout(&self) -> Duration {
        Duration::from_millis(self.online_timeout_ms)
    }

    pub fn available_timeout(&self) -> Duration {
        Duration::from_millis(self.available_timeout_ms)
    }

    pub fn adb_recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.adb_recovery_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.num_emulators, 1);
        assert_eq!(config.num_null_devices, 1);
        assert!(config.enable_logcat);
        assert_eq!(config.adb_connect_attempts, 3);
        assert_eq!(config.device.online_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "adb_path = \"/opt/sdk/adb\"\nnum_emulators = 4\n\n[device]\nonline_timeout_ms = 5000"
        )
        .unwrap();

        let config = PoolConfig::from_file(file.path()).unwrap();
        assert_eq!(config.adb_path, "/opt/sdk/adb");
        assert_eq!(config.num_emulators, 4);
        // unspecified fields fall back to defaults
        assert_eq!(config.num_null_devices, 1);
        assert_eq!(config.device.online_timeout_ms, 5000);
        assert_eq!(config.device.max_logcat_data_size, 20 * 1024 * 1024);
    }
}
