//! Fastboot Monitor
//!
//! Background poller that enumerates devices in fastboot mode,
//! reclassifies allocated devices that enter or leave fastboot, and
//! notifies subscribers after each polling cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::{DeviceState, ManagedDevice};
use crate::runner::CommandRunner;

/// Max wait for a `fastboot devices` invocation to complete
pub(crate) const FASTBOOT_CMD_TIMEOUT: Duration = Duration::from_secs(60);

/// Subscriber notified after each fastboot polling cycle
pub trait FastbootListener: Send + Sync {
    fn state_updated(&self);
}

pub(crate) type FastbootListeners = Arc<Mutex<Vec<Arc<dyn FastbootListener>>>>;
pub(crate) type AllocatedDevices = Arc<Mutex<HashMap<String, Arc<ManagedDevice>>>>;

fn fastboot_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"([\w\d]+)\s+fastboot\s*").expect("static pattern"))
}

/// Serials named in `fastboot devices` output
pub(crate) fn parse_fastboot_devices(output: &str) -> HashSet<String> {
    fastboot_pattern()
        .captures_iter(output)
        .map(|captures| captures[1].to_string())
        .collect()
}

/// Periodic fastboot poller.
///
/// Skips the actual poll while there are no subscribers: running
/// `fastboot devices` concurrently with a real fastboot command can
/// wedge the latter.
pub(crate) struct FastbootMonitor {
    runner: Arc<CommandRunner>,
    fastboot_path: String,
    poll_interval: Duration,
    allocated: AllocatedDevices,
    listeners: FastbootListeners,
    shutdown: CancellationToken,
}

impl FastbootMonitor {
    pub(crate) fn new(
        runner: Arc<CommandRunner>,
        fastboot_path: String,
        poll_interval: Duration,
        allocated: AllocatedDevices,
        listeners: FastbootListeners,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runner,
            fastboot_path,
            poll_interval,
            allocated,
            listeners,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            self.tick().await;
        }
        debug!("fastboot monitor stopped");
    }

    /// One polling cycle
    pub(crate) async fn tick(&self) {
        if self.listeners.lock().is_empty() {
            return;
        }
        let result = self
            .runner
            .run_timed_cmd(
                FASTBOOT_CMD_TIMEOUT,
                &[self.fastboot_path.as_str(), "devices"],
            )
            .await;
        if !result.status.is_success() {
            warn!(
                "'fastboot devices' failed. Result: {}, stderr: {}",
                result.status.as_str(),
                result.stderr
            );
            return;
        }
        debug!("fastboot devices returned\n{}", result.stdout);
        let serials = parse_fastboot_devices(&result.stdout);

        for serial in &serials {
            let device = self.allocated.lock().get(serial).cloned();
            if let Some(device) = device {
                if device.state() != DeviceState::Fastboot {
                    device.set_device_state(DeviceState::Fastboot);
                }
            }
        }
        // devices no longer enumerated have left fastboot without
        // becoming visible to adb yet
        let allocated_snapshot: Vec<Arc<ManagedDevice>> =
            self.allocated.lock().values().cloned().collect();
        for device in allocated_snapshot {
            if device.state() == DeviceState::Fastboot && !serials.contains(device.serial()) {
                device.set_device_state(DeviceState::NotAvailable);
            }
        }

        let listeners_snapshot: Vec<Arc<dyn FastbootListener>> = self.listeners.lock().clone();
        for listener in listeners_snapshot {
            listener.state_updated();
        }
    }
}
