//! Device Types and State
//!
//! Handles for devices reported by the bridge, placeholder (stub)
//! handles used to reserve allocation slots, and the managed wrapper a
//! caller holds while a device is leased.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Child;
use tracing::{debug, warn};

use crate::config::DeviceOptions;
use crate::error::{PoolError, Result};
use crate::logcat::LogcatCapture;
use crate::monitor::DeviceStateMonitor;
use crate::runner::CommandRunner;

/// Port used when switching a device to adb-over-tcp
pub const ADB_TCP_PORT: u16 = 5555;

/// Device state as tracked by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Device is online and ready
    Online,
    /// Device is visible but not responding
    Offline,
    /// Device is in recovery mode
    Recovery,
    /// Device is in fastboot mode
    Fastboot,
    /// Device is not visible to the bridge
    NotAvailable,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Online => "online",
            DeviceState::Offline => "offline",
            DeviceState::Recovery => "recovery",
            DeviceState::Fastboot => "fastboot",
            DeviceState::NotAvailable => "not available",
        }
    }

    /// Parse the state column of `adb devices` output
    pub fn from_adb(state: &str) -> Self {
        match state {
            "device" => DeviceState::Online,
            "offline" | "unauthorized" => DeviceState::Offline,
            "recovery" => DeviceState::Recovery,
            "bootloader" | "fastboot" => DeviceState::Fastboot,
            _ => DeviceState::NotAvailable,
        }
    }
}

/// Device kind discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Physical device connected via USB/WiFi
    Physical,
    /// Running emulator instance
    Emulator,
    /// Placeholder reserving an allocation slot (emulator slot or
    /// pre-connect TCP device)
    Stub {
        /// Whether the slot stands in for an emulator
        emulator: bool,
    },
    /// Placeholder for runs that need no hardware at all
    NullDevice,
    /// Placeholder for a device currently in fastboot mode
    FastbootDevice,
}

/// A device identity as seen by the pool.
///
/// The serial is the stable key; it is unique across the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Device serial number
    pub serial: String,
    /// Reported state
    pub state: DeviceState,
    /// Kind discriminator
    pub kind: DeviceKind,
    /// Product type (e.g. "sdk_gphone64"), when known
    pub product: Option<String>,
    /// Product variant, when known
    pub product_variant: Option<String>,
    /// Battery level 0-100, when known
    pub battery_level: Option<u32>,
}

impl DeviceHandle {
    fn with_kind(serial: &str, state: DeviceState, kind: DeviceKind) -> Self {
        Self {
            serial: serial.to_string(),
            state,
            kind,
            product: None,
            product_variant: None,
            battery_level: None,
        }
    }

    /// A physical device reported by the bridge
    pub fn physical(serial: &str, state: DeviceState) -> Self {
        Self::with_kind(serial, state, DeviceKind::Physical)
    }

    /// A running emulator reported by the bridge
    pub fn emulator(serial: &str, state: DeviceState) -> Self {
        Self::with_kind(serial, state, DeviceKind::Emulator)
    }

    /// A slot-reservation placeholder
    pub fn stub(serial: &str, emulator: bool) -> Self {
        Self::with_kind(serial, DeviceState::NotAvailable, DeviceKind::Stub { emulator })
    }

    /// A no-hardware placeholder
    pub fn null_device(serial: &str) -> Self {
        Self::with_kind(serial, DeviceState::NotAvailable, DeviceKind::NullDevice)
    }

    /// A placeholder for a device enumerated in fastboot mode
    pub fn fastboot_device(serial: &str) -> Self {
        Self::with_kind(serial, DeviceState::Fastboot, DeviceKind::FastbootDevice)
    }

    /// Whether this handle represents (a slot for) an emulator
    pub fn is_emulator(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::Emulator | DeviceKind::Stub { emulator: true }
        )
    }

    /// Whether this handle is a placeholder rather than live hardware
    pub fn is_stub(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::Stub { .. } | DeviceKind::NullDevice | DeviceKind::FastbootDevice
        )
    }
}

/// Terminal state a caller reports when returning a leased device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeDeviceState {
    /// Device is fine; return it to the available pool
    Available,
    /// Device stopped responding mid-run; still returned to the pool
    Unresponsive,
    /// Device is unusable; drop it from the pool
    Unavailable,
    /// Remove the lease without touching the pool
    Ignore,
}

/// Recovery policy for a leased device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Wait for the device to come back online
    WaitForDevice,
    /// Refuse recovery immediately (installed by `terminate_hard`)
    Abort,
}

/// A leased device.
///
/// Owned by the allocating caller; ownership returns to the manager on
/// `free_device`. Wraps the underlying handle with the per-lease state:
/// recovery policy, logcat capture, and the emulator child process when
/// one was launched for this lease.
pub struct ManagedDevice {
    serial: String,
    handle: Mutex<DeviceHandle>,
    monitor: Arc<DeviceStateMonitor>,
    recovery: Mutex<RecoveryMode>,
    logcat: Mutex<Option<LogcatCapture>>,
    emulator_process: Mutex<Option<Child>>,
    fastboot_enabled: AtomicBool,
    runner: Arc<CommandRunner>,
    adb_path: String,
    options: DeviceOptions,
}

impl ManagedDevice {
    pub fn new(
        handle: DeviceHandle,
        monitor: Arc<DeviceStateMonitor>,
        runner: Arc<CommandRunner>,
        adb_path: String,
        options: DeviceOptions,
    ) -> Self {
        Self {
            serial: handle.serial.clone(),
            handle: Mutex::new(handle),
            monitor,
            recovery: Mutex::new(RecoveryMode::WaitForDevice),
            logcat: Mutex::new(None),
            emulator_process: Mutex::new(None),
            fastboot_enabled: AtomicBool::new(false),
            runner,
            adb_path,
            options,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Snapshot of the underlying handle
    pub fn handle(&self) -> DeviceHandle {
        self.handle.lock().clone()
    }

    /// Replace the underlying handle after a bridge refresh. The serial
    /// never changes; only the bridge-side identity does.
    pub fn set_handle(&self, handle: DeviceHandle) {
        debug_assert_eq!(handle.serial, self.serial);
        *self.handle.lock() = handle;
    }

    pub fn is_emulator(&self) -> bool {
        self.handle.lock().is_emulator()
    }

    pub fn is_stub(&self) -> bool {
        self.handle.lock().is_stub()
    }

    pub fn state(&self) -> DeviceState {
        self.monitor.state()
    }

    pub fn set_device_state(&self, state: DeviceState) {
        self.monitor.set_state(state);
    }

    pub fn set_fastboot_enabled(&self, enabled: bool) {
        self.fastboot_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn fastboot_enabled(&self) -> bool {
        self.fastboot_enabled.load(Ordering::SeqCst)
    }

    pub fn set_recovery(&self, mode: RecoveryMode) {
        *self.recovery.lock() = mode;
    }

    /// Attempt to bring the device back per the installed recovery
    /// policy.
    pub async fn recover_device(&self) -> Result<()> {
        let mode = *self.recovery.lock();
        match mode {
            RecoveryMode::Abort => Err(PoolError::DeviceNotAvailable(
                "aborted test session".to_string(),
            )),
            RecoveryMode::WaitForDevice => {
                if self
                    .monitor
                    .wait_for_device_online(self.options.adb_recovery_timeout())
                    .await
                {
                    Ok(())
                } else {
                    Err(PoolError::DeviceNotAvailable(format!(
                        "Could not recover device {}",
                        self.serial
                    )))
                }
            }
        }
    }

    /// Record the emulator child process backing this lease
    pub fn set_emulator_process(&self, child: Child) {
        *self.emulator_process.lock() = Some(child);
    }

    pub fn has_emulator_process(&self) -> bool {
        self.emulator_process.lock().is_some()
    }

    /// Destroy the emulator child process, if one was recorded.
    /// Returns whether a process was present.
    pub(crate) fn kill_emulator_process(&self) -> bool {
        if let Some(mut child) = self.emulator_process.lock().take() {
            let _ = child.start_kill();
            true
        } else {
            false
        }
    }

    /// Begin capturing logcat output in the background
    pub fn start_logcat(&self) {
        let mut slot = self.logcat.lock();
        if slot.is_some() {
            debug!("Logcat capture already running for {}", self.serial);
            return;
        }
        match LogcatCapture::start(&self.adb_path, &self.serial, self.options.max_logcat_data_size)
        {
            Ok(capture) => *slot = Some(capture),
            Err(e) => warn!("Failed to start logcat for {}: {}", self.serial, e),
        }
    }

    /// Stop the background logcat capture, if running
    pub fn stop_logcat(&self) {
        if let Some(capture) = self.logcat.lock().take() {
            capture.stop();
        }
    }

    /// Snapshot of the captured logcat output, if capturing
    pub fn logcat_contents(&self) -> Option<String> {
        self.logcat.lock().as_ref().map(|capture| capture.contents())
    }

    pub async fn wait_for_device_online(&self, timeout: Duration) -> bool {
        self.monitor.wait_for_device_online(timeout).await
    }

    pub async fn wait_for_device_available(&self, timeout: Duration) -> bool {
        self.monitor.wait_for_device_available(timeout).await
    }

    pub async fn wait_for_device_not_available(&self, timeout: Duration) -> bool {
        self.monitor.wait_for_device_not_available(timeout).await
    }

    async fn get_prop(&self, prop: &str) -> Result<String> {
        let result = self
            .runner
            .run_timed_cmd(
                Duration::from_secs(5),
                &[
                    self.adb_path.as_str(),
                    "-s",
                    self.serial.as_str(),
                    "shell",
                    "getprop",
                    prop,
                ],
            )
            .await;
        if result.status.is_success() {
            Ok(result.stdout.trim().to_string())
        } else {
            Err(PoolError::DeviceNotAvailable(format!(
                "getprop {} failed on {}: {}",
                prop, self.serial, result.status.as_str()
            )))
        }
    }

    /// Switch the device's adb connection to TCP. Returns the
    /// `ip:port` endpoint on success, `None` if the device has no
    /// usable IP address.
    pub async fn switch_to_adb_tcp(&self) -> Result<Option<String>> {
        let ip = self.get_prop("dhcp.wlan0.ipaddress").await?;
        if ip.is_empty() {
            warn!("Device {} has no wlan IP address", self.serial);
            return Ok(None);
        }
        let port = ADB_TCP_PORT.to_string();
        let result = self
            .runner
            .run_timed_cmd(
                self.options.adb_recovery_timeout(),
                &[
                    self.adb_path.as_str(),
                    "-s",
                    self.serial.as_str(),
                    "tcpip",
                    port.as_str(),
                ],
            )
            .await;
        if result.status.is_success() {
            Ok(Some(format!("{}:{}", ip, ADB_TCP_PORT)))
        } else {
            warn!(
                "Failed to switch {} to adb tcp: {}",
                self.serial, result.stderr
            );
            Ok(None)
        }
    }

    /// Switch the device's adb connection back to USB. Returns whether
    /// the command was accepted.
    pub async fn switch_to_adb_usb(&self) -> Result<bool> {
        let result = self
            .runner
            .run_timed_cmd(
                self.options.adb_recovery_timeout(),
                &[self.adb_path.as_str(), "-s", self.serial.as_str(), "usb"],
            )
            .await;
        Ok(result.status.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_managed(handle: DeviceHandle) -> ManagedDevice {
        let runner = Arc::new(CommandRunner::new());
        let monitor = Arc::new(DeviceStateMonitor::new(
            &handle.serial,
            handle.state,
            runner.clone(),
            "/bin/true".to_string(),
        ));
        ManagedDevice::new(
            handle,
            monitor,
            runner,
            "/bin/true".to_string(),
            DeviceOptions::default(),
        )
    }

    #[test]
    fn test_kind_flags() {
        assert!(DeviceHandle::emulator("emulator-5554", DeviceState::Online).is_emulator());
        assert!(DeviceHandle::stub("emulator-5554", true).is_emulator());
        assert!(!DeviceHandle::stub("10.0.0.5:5555", false).is_emulator());
        assert!(DeviceHandle::null_device("null-device-0").is_stub());
        assert!(DeviceHandle::fastboot_device("FB01").is_stub());
        assert!(!DeviceHandle::physical("A1B2", DeviceState::Online).is_stub());
    }

    #[test]
    fn test_state_parse() {
        assert_eq!(DeviceState::from_adb("device"), DeviceState::Online);
        assert_eq!(DeviceState::from_adb("offline"), DeviceState::Offline);
        assert_eq!(DeviceState::from_adb("recovery"), DeviceState::Recovery);
        assert_eq!(DeviceState::from_adb("bootloader"), DeviceState::Fastboot);
        assert_eq!(DeviceState::from_adb("garbage"), DeviceState::NotAvailable);
    }

    #[test]
    fn test_stub_state_defaults() {
        assert_eq!(
            DeviceHandle::stub("emulator-5554", true).state,
            DeviceState::NotAvailable
        );
        assert_eq!(
            DeviceHandle::fastboot_device("FB01").state,
            DeviceState::Fastboot
        );
    }

    #[tokio::test]
    async fn test_abort_recovery_raises() {
        let device = test_managed(DeviceHandle::physical("A1B2", DeviceState::Online));
        device.set_recovery(RecoveryMode::Abort);
        let err = device.recover_device().await.unwrap_err();
        assert!(matches!(err, PoolError::DeviceNotAvailable(_)));
    }

    #[tokio::test]
    async fn test_wait_recovery_succeeds_when_online() {
        let device = test_managed(DeviceHandle::physical("A1B2", DeviceState::Online));
        assert!(device.recover_device().await.is_ok());
    }

    #[tokio::test]
    async fn test_state_updates_through_monitor() {
        let device = test_managed(DeviceHandle::physical("A1B2", DeviceState::Online));
        assert_eq!(device.state(), DeviceState::Online);
        device.set_device_state(DeviceState::Fastboot);
        assert_eq!(device.state(), DeviceState::Fastboot);
    }
}
