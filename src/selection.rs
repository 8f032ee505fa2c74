//! Device Selection
//!
//! Stateless admission criteria over a device handle. All specified
//! criteria must hold for a handle to match.

use serde::{Deserialize, Serialize};

use crate::device::{DeviceHandle, DeviceKind};

/// Selection criteria for allocating a device.
///
/// The default value matches any device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSelection {
    /// Only these serials are eligible (empty = no restriction)
    pub serials: Vec<String>,
    /// These serials are never eligible
    pub exclude_serials: Vec<String>,
    /// Required product type
    pub product_type: Option<String>,
    /// Required product variant
    pub product_variant: Option<String>,
    /// Minimum battery level (inclusive)
    pub min_battery_level: Option<u32>,
    /// Maximum battery level (inclusive)
    pub max_battery_level: Option<u32>,
    /// Only emulators are eligible
    pub emulator_only: bool,
    /// Only non-emulators are eligible
    pub device_only: bool,
    /// Whether null-device placeholders are eligible
    pub null_device_allowed: bool,
    /// Whether placeholder handles are eligible
    pub stub_allowed: bool,
}

impl Default for DeviceSelection {
    fn default() -> Self {
        Self {
            serials: Vec::new(),
            exclude_serials: Vec::new(),
            product_type: None,
            product_variant: None,
            min_battery_level: None,
            max_battery_level: None,
            emulator_only: false,
            device_only: false,
            null_device_allowed: true,
            stub_allowed: true,
        }
    }
}

impl DeviceSelection {
    /// Criteria matching any device
    pub fn any() -> Self {
        Self::default()
    }

    /// Criteria matching a single serial
    pub fn for_serial(serial: &str) -> Self {
        let mut selection = Self::default();
        selection.serials.push(serial.to_string());
        selection
    }

    /// Criteria matching emulators only
    pub fn emulators() -> Self {
        Self {
            emulator_only: true,
            ..Default::default()
        }
    }

    /// Criteria matching physical devices only
    pub fn physical() -> Self {
        Self {
            device_only: true,
            ..Default::default()
        }
    }

    /// Whether `device` satisfies every specified criterion
    pub fn matches(&self, device: &DeviceHandle) -> bool {
        if !self.serials.is_empty() && !self.serials.contains(&device.serial) {
            return false;
        }
        if self.exclude_serials.contains(&device.serial) {
            return false;
        }
        if self.emulator_only && !device.is_emulator() {
            return false;
        }
        if self.device_only && device.is_emulator() {
            return false;
        }
        if !self.null_device_allowed && device.kind == DeviceKind::NullDevice {
            return false;
        }
        if !self.stub_allowed && device.is_stub() && device.kind != DeviceKind::NullDevice {
            return false;
        }
        if let Some(ref product) = self.product_type {
            if device.product.as_deref() != Some(product.as_str()) {
                return false;
            }
        }
        if let Some(ref variant) = self.product_variant {
            if device.product_variant.as_deref() != Some(variant.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_battery_level {
            match device.battery_level {
                Some(level) if level >= min => {}
                _ => return false,
            }
        }
        if let Some(max) = self.max_battery_level {
            match device.battery_level {
                Some(level) if level <= max => {}
                _ => return false,
            }
        }
        true
    }
}
