//! Debug Bridge
//!
//! Contract consumed by the device manager for device discovery, plus a
//! concrete implementation backed by the adb binary. The bridge owns
//! device enumeration; the manager reacts to the connect / change /
//! disconnect events it emits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::{DeviceHandle, DeviceState};
use crate::error::{PoolError, Result};
use crate::runner::CommandRunner;

/// Change-mask bit: the device's state changed
pub const CHANGE_STATE: u32 = 0x0001;

/// Device presence events emitted by a bridge
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A device became visible
    Connected(DeviceHandle),
    /// A visible device changed; `change_mask` says what
    Changed {
        device: DeviceHandle,
        change_mask: u32,
    },
    /// A device vanished
    Disconnected(DeviceHandle),
}

/// Listener registration handle
pub type ListenerId = u64;

/// Channel on which a listener receives bridge events
pub type BridgeEventSender = mpsc::UnboundedSender<BridgeEvent>;

/// External debug-bridge service that enumerates attached devices and
/// delivers presence events.
///
/// Listeners must be registered before `init` so no early events are
/// missed. All methods are non-blocking; implementations run their own
/// background work on the tokio runtime.
pub trait DebugBridge: Send + Sync {
    /// Start the bridge. Events begin flowing after this returns.
    fn init(&self, client_support: bool, adb_binary: &str) -> Result<()>;

    /// Stop the bridge and its background work.
    fn terminate(&self);

    /// Forcibly drop the bridge's connection to its backend.
    fn disconnect_bridge(&self);

    /// Snapshot of the devices currently visible to the bridge.
    fn devices(&self) -> Vec<DeviceHandle>;

    /// Register an event listener. Must be called before `init` to
    /// observe all devices.
    fn add_listener(&self, listener: BridgeEventSender) -> ListenerId;

    /// Remove a previously registered listener.
    fn remove_listener(&self, id: ListenerId);

    /// Adjust the timeout applied to bridge-level commands.
    fn set_command_timeout(&self, timeout: Duration);
}

type ListenerSet = Arc<Mutex<Vec<(ListenerId, BridgeEventSender)>>>;
type DeviceSnapshot = Arc<Mutex<HashMap<String, DeviceHandle>>>;

/// `DebugBridge` implementation backed by the adb binary.
///
/// Starts the adb server on `init` and converts periodic
/// `adb devices -l` snapshots into connect / change / disconnect
/// events.
pub struct AdbBridge {
    runner: Arc<CommandRunner>,
    poll_interval: Duration,
    command_timeout: Arc<Mutex<Duration>>,
    adb_path: Mutex<String>,
    snapshot: DeviceSnapshot,
    listeners: ListenerSet,
    next_listener_id: AtomicU64,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl AdbBridge {
    pub fn new(runner: Arc<CommandRunner>, poll_interval: Duration) -> Self {
        Self {
            runner,
            poll_interval,
            command_timeout: Arc::new(Mutex::new(Duration::from_secs(60))),
            adb_path: Mutex::new("adb".to_string()),
            snapshot: Arc::new(Mutex::new(HashMap::new())),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// One enumeration pass: list devices, diff against the previous
    /// snapshot, dispatch the resulting events.
    async fn refresh(
        runner: &CommandRunner,
        adb: &str,
        timeout: Duration,
        snapshot: &DeviceSnapshot,
        listeners: &ListenerSet,
    ) {
        let result = runner
            .run_timed_cmd_silently(timeout, &[adb, "devices", "-l"])
            .await;
        if !result.status.is_success() {
            warn!("'adb devices' failed: {}", result.status.as_str());
            return;
        }
        let current = parse_device_list(&result.stdout);
        let events = {
            let mut snapshot = snapshot.lock();
            let events = diff_snapshots(&snapshot, &current);
            *snapshot = current
                .into_iter()
                .map(|device| (device.serial.clone(), device))
                .collect();
            events
        };
        if !events.is_empty() {
            dispatch(listeners, events);
        }
    }
}

fn dispatch(listeners: &ListenerSet, events: Vec<BridgeEvent>) {
    let mut listeners = listeners.lock();
    for event in events {
        listeners.retain(|(_, sender)| sender.send(event.clone()).is_ok());
    }
}

impl DebugBridge for AdbBridge {
    fn init(&self, client_support: bool, adb_binary: &str) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::InvalidState(
                "bridge already initialized".to_string(),
            ));
        }
        debug!(
            "Initializing adb bridge (client support: {})",
            client_support
        );
        *self.adb_path.lock() = adb_binary.to_string();

        let runner = self.runner.clone();
        let adb = adb_binary.to_string();
        let poll_interval = self.poll_interval;
        let command_timeout = self.command_timeout.clone();
        let snapshot = self.snapshot.clone();
        let listeners = self.listeners.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let timeout = *command_timeout.lock();
            let _ = runner
                .run_timed_cmd_silently(timeout, &[adb.as_str(), "start-server"])
                .await;
            loop {
                let timeout = *command_timeout.lock();
                Self::refresh(&runner, &adb, timeout, &snapshot, &listeners).await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            debug!("adb bridge poller stopped");
        });
        Ok(())
    }

    fn terminate(&self) {
        self.shutdown.cancel();
    }

    fn disconnect_bridge(&self) {
        let runner = self.runner.clone();
        let adb = self.adb_path.lock().clone();
        let timeout = *self.command_timeout.lock();
        tokio::spawn(async move {
            let _ = runner
                .run_timed_cmd_silently(timeout, &[adb.as_str(), "kill-server"])
                .await;
        });
    }

    fn devices(&self) -> Vec<DeviceHandle> {
        self.snapshot.lock().values().cloned().collect()
    }

    fn add_listener(&self, listener: BridgeEventSender) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|(existing, _)| *existing != id);
    }

    fn set_command_timeout(&self, timeout: Duration) {
        *self.command_timeout.lock() = timeout;
    }
}

/// Parse `adb devices -l` output into device handles
pub(crate) fn parse_device_list(output: &str) -> Vec<DeviceHandle> {
    let mut devices = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices") || line.starts_with('*') {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let serial = parts[0];
        let state = DeviceState::from_adb(parts[1]);

        let mut device = if serial.starts_with("emulator-") {
            DeviceHandle::emulator(serial, state)
        } else {
            DeviceHandle::physical(serial, state)
        };
        for part in parts.iter().skip(2) {
            if let Some(value) = part.strip_prefix("product:") {
                device.product = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("device:") {
                device.product_variant = Some(value.to_string());
            }
        }
        devices.push(device);
    }
    devices
}

/// Events required to move the fleet picture from `old` to `current`
pub(crate) fn diff_snapshots(
    old: &HashMap<String, DeviceHandle>,
    current: &[DeviceHandle],
) -> Vec<BridgeEvent> {
    let mut events = Vec::new();
    for device in current {
        match old.get(&device.serial) {
            None => events.push(BridgeEvent::Connected(device.clone())),
            Some(previous) if previous.state != device.state => {
                events.push(BridgeEvent::Changed {
                    device: device.clone(),
                    change_mask: CHANGE_STATE,
                });
            }
            Some(_) => {}
        }
    }
    for (serial, device) in old {
        if !current.iter().any(|d| &d.serial == serial) {
            events.push(BridgeEvent::Disconnected(device.clone()));
        }
    }
    events
}
