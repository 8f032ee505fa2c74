//! Device State Monitor
//!
//! Observes the reported state of a single device and answers
//! "wait until online / available / gone" questions with timeouts.
//! State transitions are driven externally, by bridge callbacks and the
//! fastboot monitor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::device::DeviceState;
use crate::runner::CommandRunner;

/// Timeout for a single adb shell responsiveness probe
const SHELL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Wait between failed shell probes
const SHELL_PROBE_POLL: Duration = Duration::from_secs(1);

/// Observer for a single device's state.
pub struct DeviceStateMonitor {
    serial: String,
    runner: Arc<CommandRunner>,
    adb_path: String,
    state_tx: watch::Sender<DeviceState>,
}

impl DeviceStateMonitor {
    pub fn new(
        serial: &str,
        initial_state: DeviceState,
        runner: Arc<CommandRunner>,
        adb_path: String,
    ) -> Self {
        let (state_tx, _) = watch::channel(initial_state);
        Self {
            serial: serial.to_string(),
            runner,
            adb_path,
            state_tx,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Current reported state
    pub fn state(&self) -> DeviceState {
        *self.state_tx.borrow()
    }

    /// Record a state update, waking any waiters
    pub fn set_state(&self, state: DeviceState) {
        debug!("Device {} state is now {}", self.serial, state.as_str());
        let _ = self.state_tx.send(state);
    }

    async fn wait_for_state<F>(&self, timeout: Duration, satisfied: F) -> bool
    where
        F: Fn(DeviceState) -> bool,
    {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, async move {
            loop {
                if satisfied(*rx.borrow_and_update()) {
                    return;
                }
                if rx.changed().await.is_err() {
                    // monitor dropped; no further transitions will come
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Wait until the device reports online
    pub async fn wait_for_device_online(&self, timeout: Duration) -> bool {
        self.wait_for_state(timeout, |state| state == DeviceState::Online)
            .await
    }

    /// Wait until the device is no longer visible
    pub async fn wait_for_device_not_available(&self, timeout: Duration) -> bool {
        self.wait_for_state(timeout, |state| state == DeviceState::NotAvailable)
            .await
    }

    /// Wait until an adb shell probe round-trips successfully.
    ///
    /// The probe command must exit zero within five seconds; probes are
    /// repeated until one succeeds or `timeout` elapses.
    pub async fn wait_for_device_shell(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let result = self
                .runner
                .run_timed_cmd_silently(
                    SHELL_PROBE_TIMEOUT,
                    &[
                        self.adb_path.as_str(),
                        "-s",
                        self.serial.as_str(),
                        "shell",
                        "ls",
                        "/system/bin",
                    ],
                )
                .await;
            if result.status.is_success() {
                return true;
            }
            debug!(
                "shell probe on {} returned {}, retrying",
                self.serial,
                result.status.as_str()
            );
            self.runner.sleep(SHELL_PROBE_POLL).await;
        }
        false
    }

    /// Wait until the device is online and its shell is responsive
    pub async fn wait_for_device_available(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        if !self.wait_for_device_online(timeout).await {
            return false;
        }
        let remaining = timeout.saturating_sub(start.elapsed());
        self.wait_for_device_shell(remaining).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_with_adb(adb: &str, initial: DeviceState) -> DeviceStateMonitor {
        DeviceStateMonitor::new(
            "A1B2",
            initial,
            Arc::new(CommandRunner::new()),
            adb.to_string(),
        )
    }

    #[tokio::test]
    async fn test_wait_for_online_already_online() {
        let monitor = monitor_with_adb("/bin/true", DeviceState::Online);
        assert!(
            monitor
                .wait_for_device_online(Duration::from_millis(100))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_online_observes_transition() {
        let monitor = Arc::new(monitor_with_adb("/bin/true", DeviceState::Offline));
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_for_device_online(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.set_state(DeviceState::Online);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_online_times_out() {
        let monitor = monitor_with_adb("/bin/true", DeviceState::Offline);
        assert!(
            !monitor
                .wait_for_device_online(Duration::from_millis(100))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_not_available() {
        let monitor = Arc::new(monitor_with_adb("/bin/true", DeviceState::Online));
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor
                    .wait_for_device_not_available(Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.set_state(DeviceState::NotAvailable);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_shell_probe_success() {
        let monitor = monitor_with_adb("/bin/true", DeviceState::Online);
        assert!(
            monitor
                .wait_for_device_shell(Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test]
    async fn test_shell_probe_unresponsive() {
        let monitor = monitor_with_adb("/bin/false", DeviceState::Online);
        assert!(
            !monitor
                .wait_for_device_shell(Duration::from_millis(200))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_available_combines_online_and_shell() {
        let monitor = Arc::new(monitor_with_adb("/bin/true", DeviceState::Offline));
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor
                    .wait_for_device_available(Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.set_state(DeviceState::Online);
        assert!(waiter.await.unwrap());
    }
}
