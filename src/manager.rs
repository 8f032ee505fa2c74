//! Device Manager
//!
//! Central component of the pool: holds the available queue, the
//! allocated map and the in-flight responsiveness checks, reacts to
//! bridge events, and implements the lease API (`allocate_device`,
//! `free_device`, `force_allocate_device`, `launch_emulator`,
//! `connect_to_tcp_device`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{AdbBridge, BridgeEvent, DebugBridge, ListenerId, CHANGE_STATE};
use crate::config::PoolConfig;
use crate::device::{
    DeviceHandle, DeviceKind, DeviceState, FreeDeviceState, ManagedDevice, RecoveryMode,
};
use crate::emulator;
use crate::error::{PoolError, Result};
use crate::events::{EventBus, EventSubscription, PoolEvent};
use crate::fastboot::{
    parse_fastboot_devices, AllocatedDevices, FastbootListener, FastbootListeners,
    FastbootMonitor, FASTBOOT_CMD_TIMEOUT,
};
use crate::monitor::DeviceStateMonitor;
use crate::queue::ConditionQueue;
use crate::runner::CommandRunner;
use crate::selection::DeviceSelection;

/// Max wait for a new device's shell to become responsive before it is
/// declared unavailable for testing
const CHECK_WAIT_DEVICE_AVAIL: Duration = Duration::from_secs(30);
/// Cap on concurrently running admission probes
const MAX_CONCURRENT_DEVICE_CHECKS: usize = 8;
/// Timeout for the fastboot availability probe at init
const FASTBOOT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout applied to bridge-level commands
const BRIDGE_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait after spawning an emulator before checking it is still alive
const EMULATOR_START_WAIT: Duration = Duration::from_millis(500);
/// Max wait for a killed emulator to disappear
const EMULATOR_KILL_TIMEOUT: Duration = Duration::from_secs(20);

/// Where a device currently sits in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Allocated,
    Available,
    Unavailable,
}

enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready(Arc<PoolInner>),
}

/// Manages the fleet of devices available for testing.
///
/// `init` (or `init_with_bridge`) must be called exactly once before
/// any other operation.
pub struct DeviceManager {
    lifecycle: Mutex<Lifecycle>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
        }
    }

    fn inner(&self) -> Result<Arc<PoolInner>> {
        match &*self.lifecycle.lock() {
            Lifecycle::Ready(inner) => Ok(inner.clone()),
            _ => Err(PoolError::NotInitialized),
        }
    }

    /// Initialize the manager against an adb-backed bridge.
    pub async fn init(
        &self,
        config: PoolConfig,
        global_filter: Option<DeviceSelection>,
    ) -> Result<()> {
        let bridge_runner = Arc::new(CommandRunner::new());
        let bridge = Arc::new(AdbBridge::new(bridge_runner, config.bridge_poll_interval()));
        self.init_with_bridge(config, global_filter, bridge).await
    }

    /// Initialize the manager against the given bridge.
    ///
    /// The manager becomes observable as initialized only once every
    /// collaborator is fully wired; a second call fails with
    /// `AlreadyInitialized`.
    pub async fn init_with_bridge(
        &self,
        config: PoolConfig,
        global_filter: Option<DeviceSelection>,
        bridge: Arc<dyn DebugBridge>,
    ) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Uninitialized) {
                return Err(PoolError::AlreadyInitialized);
            }
            *lifecycle = Lifecycle::Initializing;
        }
        let result = build_pool(config, global_filter, bridge).await;
        let mut lifecycle = self.lifecycle.lock();
        match result {
            Ok(inner) => {
                *lifecycle = Lifecycle::Ready(inner);
                Ok(())
            }
            Err(e) => {
                *lifecycle = Lifecycle::Uninitialized;
                Err(e)
            }
        }
    }

    /// Lease any available device, waiting indefinitely.
    pub async fn allocate_device(&self) -> Result<Arc<ManagedDevice>> {
        let inner = self.inner()?;
        let selection = DeviceSelection::any();
        let handle = inner
            .available
            .take(&|handle: &DeviceHandle| selection.matches(handle))
            .await;
        Ok(inner.create_allocated_device(handle))
    }

    /// Lease any available device, waiting up to `timeout`.
    pub async fn allocate_device_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Arc<ManagedDevice>>> {
        self.allocate_device_matching(timeout, &DeviceSelection::any())
            .await
    }

    /// Lease a device satisfying `selection`, waiting up to `timeout`.
    pub async fn allocate_device_matching(
        &self,
        timeout: Duration,
        selection: &DeviceSelection,
    ) -> Result<Option<Arc<ManagedDevice>>> {
        let inner = self.inner()?;
        match inner
            .available
            .poll(timeout, &|handle: &DeviceHandle| selection.matches(handle))
            .await
        {
            Some(handle) => Ok(Some(inner.create_allocated_device(handle))),
            None => Ok(None),
        }
    }

    /// Lease the device with the given serial, synthesizing a stub if no
    /// such device is currently available. Returns `None` if the serial
    /// is already allocated.
    pub async fn force_allocate_device(&self, serial: &str) -> Result<Option<Arc<ManagedDevice>>> {
        let inner = self.inner()?;
        if inner.allocated.lock().contains_key(serial) {
            debug!("Device {} is already allocated", serial);
            return Ok(None);
        }
        // first try to allocate that device as normal
        let selection = DeviceSelection::for_serial(serial);
        let handle = inner
            .available
            .poll(Duration::from_millis(1), &|handle: &DeviceHandle| {
                selection.matches(handle)
            })
            .await
            .unwrap_or_else(|| DeviceHandle::stub(serial, false));
        Ok(Some(inner.create_allocated_device(handle)))
    }

    /// Return a leased device to the manager.
    pub async fn free_device(
        &self,
        device: &Arc<ManagedDevice>,
        state: FreeDeviceState,
    ) -> Result<()> {
        let inner = self.inner()?;
        let mut state = state;
        device.stop_logcat();
        let mut handle_to_return = device.handle();
        // don't kill an emulator this manager didn't launch
        if handle_to_return.is_emulator() && device.has_emulator_process() {
            match inner.kill_emulator(device).await {
                Ok(()) => {
                    // emulator killed: return a fresh slot reservation
                    handle_to_return = DeviceHandle::stub(device.serial(), true);
                    state = FreeDeviceState::Available;
                }
                Err(e) => {
                    error!("Failed to kill emulator {}: {}", device.serial(), e);
                    state = FreeDeviceState::Unavailable;
                }
            }
        }
        if inner.allocated.lock().remove(device.serial()).is_none() {
            error!(
                "free_device called with unallocated device {}",
                device.serial()
            );
        } else {
            match state {
                FreeDeviceState::Available | FreeDeviceState::Unresponsive => {
                    inner.add_available_device(handle_to_return);
                }
                FreeDeviceState::Unavailable => {
                    info!(
                        "Freed device {} is unavailable. Removing from use.",
                        device.serial()
                    );
                }
                FreeDeviceState::Ignore => {}
            }
        }
        inner.events.emit(PoolEvent::DeviceFreed {
            serial: device.serial().to_string(),
        });
        Ok(())
    }

    /// Launch an emulator into the slot reserved by `device`.
    ///
    /// The device must be an emulator slot in the `NotAvailable` state.
    /// The spawned process is recorded on the device and killed again
    /// when the device is freed.
    pub async fn launch_emulator(
        &self,
        device: &Arc<ManagedDevice>,
        boot_timeout: Duration,
        runner: &CommandRunner,
        emulator_args: &[&str],
    ) -> Result<()> {
        let inner = self.inner()?;
        if !device.is_emulator() {
            return Err(PoolError::InvalidState(format!(
                "Device {} is not an emulator",
                device.serial()
            )));
        }
        if device.state() != DeviceState::NotAvailable {
            return Err(PoolError::InvalidState(format!(
                "Emulator device {} is in state {}. Expected: {}",
                device.serial(),
                device.state().as_str(),
                DeviceState::NotAvailable.as_str()
            )));
        }
        let port = emulator::emulator_port(device.serial()).ok_or_else(|| {
            PoolError::InvalidSerial(format!(
                "Failed to determine emulator port for {}",
                device.serial()
            ))
        })?;
        let port_arg = port.to_string();
        let mut full_args: Vec<&str> = emulator_args.to_vec();
        full_args.push("-port");
        full_args.push(&port_arg);

        let mut child = runner.run_in_background(&full_args).map_err(|e| {
            PoolError::DeviceNotAvailable(format!("Failed to start emulator process: {}", e))
        })?;
        // give the process a moment to fail fast on bad arguments
        inner.runner.sleep(EMULATOR_START_WAIT).await;
        check_emulator_alive(&mut child).await?;
        device.set_emulator_process(child);
        device.start_logcat();

        if !device.wait_for_device_available(boot_timeout).await {
            return Err(PoolError::DeviceNotAvailable(format!(
                "Emulator {} did not become available within {:?}",
                device.serial(),
                boot_timeout
            )));
        }
        Ok(())
    }

    /// Shut down a launched emulator: console kill, then process
    /// destroy, then wait for the device to disappear.
    pub async fn kill_emulator(&self, device: &Arc<ManagedDevice>) -> Result<()> {
        let inner = self.inner()?;
        inner.kill_emulator(device).await
    }

    /// Attach a device over TCP and lease it.
    ///
    /// A stub is allocated up-front so the serial cannot be claimed by
    /// another caller while the connection is established. On any
    /// failure the stub is freed again and `None` is returned.
    pub async fn connect_to_tcp_device(
        &self,
        ip_and_port: &str,
    ) -> Result<Option<Arc<ManagedDevice>>> {
        let inner = self.inner()?;
        if inner.allocated.lock().contains_key(ip_and_port) {
            warn!(
                "Device with tcp serial {} is already allocated",
                ip_and_port
            );
            return Ok(None);
        }
        let device = inner.create_allocated_device(DeviceHandle::stub(ip_and_port, false));
        if inner.do_adb_connect(ip_and_port).await {
            device.set_recovery(RecoveryMode::WaitForDevice);
            if device
                .wait_for_device_online(inner.config.device.online_timeout())
                .await
            {
                return Ok(Some(device));
            }
            warn!("Device with tcp serial {} did not come online", ip_and_port);
        }
        self.free_device(&device, FreeDeviceState::Ignore).await?;
        Ok(None)
    }

    /// Switch a USB-attached device to adb-over-tcp and lease the
    /// resulting TCP device. On failure the USB side is recovered.
    pub async fn reconnect_device_to_tcp(
        &self,
        usb_device: &Arc<ManagedDevice>,
    ) -> Result<Option<Arc<ManagedDevice>>> {
        info!(
            "Reconnecting device {} to adb over tcpip",
            usb_device.serial()
        );
        self.inner()?;
        let ip_and_port = match usb_device.switch_to_adb_tcp().await? {
            Some(ip_and_port) => ip_and_port,
            None => return Ok(None),
        };
        debug!(
            "Device {} was switched to adb tcp on {}",
            usb_device.serial(),
            ip_and_port
        );
        let tcp_device = self.connect_to_tcp_device(&ip_and_port).await?;
        if tcp_device.is_none() {
            // could not connect; try to re-establish the usb connection
            usb_device.recover_device().await?;
        }
        Ok(tcp_device)
    }

    /// Switch a TCP-attached device back to USB and free it. Returns
    /// whether the switch was accepted.
    pub async fn disconnect_from_tcp_device(
        &self,
        tcp_device: &Arc<ManagedDevice>,
    ) -> Result<bool> {
        info!(
            "Disconnecting and freeing tcp device {}",
            tcp_device.serial()
        );
        self.inner()?;
        let result = match tcp_device.switch_to_adb_usb().await {
            Ok(switched) => switched,
            Err(e) => {
                warn!(
                    "Failed to switch device {} to usb mode: {}",
                    tcp_device.serial(),
                    e
                );
                false
            }
        };
        self.free_device(tcp_device, FreeDeviceState::Ignore).await?;
        Ok(result)
    }

    /// Run an adb command not targeted at a particular device, e.g.
    /// `adb connect`. Returns stdout on success.
    pub async fn execute_global_adb_command(&self, args: &[&str]) -> Result<Option<String>> {
        let inner = self.inner()?;
        Ok(inner.execute_global_adb_command(args).await)
    }

    /// Stop the manager: stop listening to the bridge, terminate it,
    /// stop the fastboot monitor and cancel in-flight admission
    /// probes. Idempotent.
    pub fn terminate(&self) -> Result<()> {
        let inner = self.inner()?;
        if !inner.terminated.swap(true, Ordering::SeqCst) {
            inner.bridge.remove_listener(inner.listener_id);
            inner.bridge.terminate();
            inner.shutdown.cancel();
            inner.admission_permits.close();
            inner.admission_tasks.lock().abort_all();
        }
        Ok(())
    }

    /// As `terminate`, additionally denying recovery on every allocated
    /// device and forcibly disconnecting the bridge.
    pub fn terminate_hard(&self) -> Result<()> {
        let inner = self.inner()?;
        if !inner.terminated.load(Ordering::SeqCst) {
            let devices: Vec<Arc<ManagedDevice>> =
                inner.allocated.lock().values().cloned().collect();
            for device in devices {
                device.set_recovery(RecoveryMode::Abort);
            }
            inner.bridge.disconnect_bridge();
            self.terminate()?;
        }
        Ok(())
    }

    /// Serials of currently leased devices
    pub fn allocated_devices(&self) -> Result<Vec<String>> {
        Ok(self.inner()?.allocated.lock().keys().cloned().collect())
    }

    /// Serials of devices ready to lease (placeholders excluded)
    pub fn available_devices(&self) -> Result<Vec<String>> {
        Ok(self
            .inner()?
            .available
            .get_copy()
            .into_iter()
            .filter(|device| !device.is_stub())
            .map(|device| device.serial)
            .collect())
    }

    /// Serials visible to the bridge but neither available nor leased
    pub fn unavailable_devices(&self) -> Result<Vec<String>> {
        let inner = self.inner()?;
        let available = self.available_devices()?;
        let allocated = self.allocated_devices()?;
        Ok(inner
            .bridge
            .devices()
            .into_iter()
            .filter(|device| {
                !available.contains(&device.serial) && !allocated.contains(&device.serial)
            })
            .map(|device| device.serial)
            .collect())
    }

    /// Snapshot of the fleet picture: leased devices first, then
    /// available devices, then devices the bridge sees but the pool
    /// cannot use. Placeholders are not listed.
    pub fn list_devices(&self) -> Result<Vec<(DeviceHandle, AllocationState)>> {
        let inner = self.inner()?;
        let mut rows = Vec::new();
        let mut visible: Vec<DeviceHandle> = inner
            .bridge
            .devices()
            .into_iter()
            .filter(|device| inner.global_filter.matches(device))
            .collect();

        let allocated: Vec<Arc<ManagedDevice>> = inner.allocated.lock().values().cloned().collect();
        for device in &allocated {
            visible.retain(|handle| handle.serial != device.serial());
            rows.push((device.handle(), AllocationState::Allocated));
        }
        for handle in inner.available.get_copy() {
            if handle.is_stub() {
                continue;
            }
            visible.retain(|visible_handle| visible_handle.serial != handle.serial);
            rows.push((handle, AllocationState::Available));
        }
        for handle in visible {
            rows.push((handle, AllocationState::Unavailable));
        }
        Ok(rows)
    }

    /// Subscribe to fleet change notifications
    pub fn subscribe(&self) -> Result<EventSubscription> {
        Ok(self.inner()?.events.subscribe())
    }

    /// Toggle background logcat capture for subsequently allocated
    /// devices
    pub fn set_enable_logcat(&self, enabled: bool) -> Result<()> {
        self.inner()?
            .enable_logcat
            .store(enabled, Ordering::SeqCst);
        Ok(())
    }

    /// Run responsiveness checks inline instead of on background tasks.
    /// Makes event handling deterministic for tests.
    pub fn set_synchronous_mode(&self, synchronous: bool) -> Result<()> {
        self.inner()?
            .synchronous_mode
            .store(synchronous, Ordering::SeqCst);
        Ok(())
    }

    /// Subscribe to fastboot polling cycles
    pub fn add_fastboot_listener(&self, listener: Arc<dyn FastbootListener>) -> Result<()> {
        let inner = self.inner()?;
        if !inner.fastboot_enabled {
            return Err(PoolError::FastbootNotEnabled);
        }
        inner.fastboot_listeners.lock().push(listener);
        Ok(())
    }

    /// Remove a fastboot subscriber
    pub fn remove_fastboot_listener(&self, listener: &Arc<dyn FastbootListener>) -> Result<()> {
        let inner = self.inner()?;
        if inner.fastboot_enabled {
            inner
                .fastboot_listeners
                .lock()
                .retain(|existing| !Arc::ptr_eq(existing, listener));
        }
        Ok(())
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

struct PoolInner {
    config: PoolConfig,
    runner: Arc<CommandRunner>,
    bridge: Arc<dyn DebugBridge>,
    listener_id: ListenerId,
    global_filter: DeviceSelection,
    allocated: AllocatedDevices,
    checking: Mutex<HashMap<String, Arc<DeviceStateMonitor>>>,
    available: ConditionQueue<DeviceHandle>,
    fastboot_enabled: bool,
    fastboot_listeners: FastbootListeners,
    shutdown: CancellationToken,
    admission_permits: Arc<Semaphore>,
    admission_tasks: Mutex<JoinSet<()>>,
    events: Arc<EventBus>,
    enable_logcat: AtomicBool,
    synchronous_mode: AtomicBool,
    terminated: AtomicBool,
}

/// Build and wire every collaborator. The caller publishes the result;
/// nothing here is observable through the manager until then.
async fn build_pool(
    mut config: PoolConfig,
    global_filter: Option<DeviceSelection>,
    bridge: Arc<dyn DebugBridge>,
) -> Result<Arc<PoolInner>> {
    config.resolve_tools();
    let runner = Arc::new(CommandRunner::new());
    let global_filter = global_filter.unwrap_or_default();
    let enable_logcat = config.enable_logcat;

    let allocated: AllocatedDevices = Arc::new(Mutex::new(HashMap::new()));
    let fastboot_listeners: FastbootListeners = Arc::new(Mutex::new(Vec::new()));
    let shutdown = CancellationToken::new();

    let fastboot_enabled = is_fastboot_available(&runner, &config.fastboot_path).await;
    if !fastboot_enabled {
        warn!("Fastboot is not available.");
    }

    bridge.set_command_timeout(BRIDGE_COMMAND_TIMEOUT);

    // register before initializing the bridge so no device event is lost
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let listener_id = bridge.add_listener(event_tx);

    let inner = Arc::new(PoolInner {
        config,
        runner,
        bridge,
        listener_id,
        global_filter,
        allocated,
        checking: Mutex::new(HashMap::new()),
        available: ConditionQueue::new(),
        fastboot_enabled,
        fastboot_listeners,
        shutdown,
        admission_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_DEVICE_CHECKS)),
        admission_tasks: Mutex::new(JoinSet::new()),
        events: Arc::new(EventBus::new()),
        enable_logcat: AtomicBool::new(enable_logcat),
        synchronous_mode: AtomicBool::new(false),
        terminated: AtomicBool::new(false),
    });

    if fastboot_enabled {
        let monitor = FastbootMonitor::new(
            inner.runner.clone(),
            inner.config.fastboot_path.clone(),
            inner.config.fastboot_poll_interval(),
            inner.allocated.clone(),
            inner.fastboot_listeners.clone(),
            inner.shutdown.clone(),
        );
        tokio::spawn(monitor.run());
        inner.add_fastboot_devices().await;
    }

    {
        let inner = inner.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if inner.terminated.load(Ordering::SeqCst) {
                    break;
                }
                inner.handle_bridge_event(event).await;
            }
            debug!("bridge event loop stopped");
        });
    }

    inner.bridge.init(false, &inner.config.adb_path)?;
    inner.add_emulators();
    inner.add_null_devices();
    Ok(inner)
}

/// `fastboot help` must either succeed or print its usage banner to
/// stderr (older fastboot versions exit non-zero on `help`).
async fn is_fastboot_available(runner: &CommandRunner, fastboot_path: &str) -> bool {
    let result = runner
        .run_timed_cmd_silently(FASTBOOT_PROBE_TIMEOUT, &[fastboot_path, "help"])
        .await;
    if result.status.is_success() {
        return true;
    }
    if result.stderr.contains("usage: fastboot") {
        warn!("You are running an older version of fastboot, please update it.");
        return true;
    }
    false
}

async fn check_emulator_alive(child: &mut Child) -> Result<()> {
    match child.try_wait() {
        Ok(None) => Ok(()),
        Ok(Some(status)) => {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(mut out) = child.stdout.take() {
                let _ = out.read_to_string(&mut stdout).await;
            }
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_string(&mut stderr).await;
            }
            error!(
                "Emulator process has died with exit value {:?}. stdout: '{}', stderr: '{}'",
                status.code(),
                stdout.trim(),
                stderr.trim()
            );
            Err(PoolError::DeviceNotAvailable(
                "Emulator process has died unexpectedly".to_string(),
            ))
        }
        Err(e) => Err(PoolError::DeviceNotAvailable(format!(
            "Failed to check emulator process: {}",
            e
        ))),
    }
}

fn is_valid_serial(serial: &str) -> bool {
    serial.len() > 1 && !serial.contains('?')
}

fn serial_matcher(serial: String) -> impl Fn(&DeviceHandle) -> bool {
    move |device: &DeviceHandle| device.serial == serial
}

impl PoolInner {
    fn new_state_monitor(&self, handle: &DeviceHandle) -> Arc<DeviceStateMonitor> {
        let initial = match handle.kind {
            DeviceKind::FastbootDevice => DeviceState::Fastboot,
            _ if handle.is_stub() => DeviceState::NotAvailable,
            _ => handle.state,
        };
        Arc::new(DeviceStateMonitor::new(
            &handle.serial,
            initial,
            self.runner.clone(),
            self.config.adb_path.clone(),
        ))
    }

    /// Enqueue a device, replacing any prior entry with the same serial.
    fn add_available_device(&self, device: DeviceHandle) {
        let serial = device.serial.clone();
        let displaced = self
            .available
            .add_unique(&serial_matcher(serial.clone()), device);
        if displaced.is_some() {
            debug!("Found existing entry in available pool for {}", serial);
        }
        self.events.emit(PoolEvent::FleetChanged);
    }

    /// Add slot reservations for the emulators this manager may launch
    fn add_emulators(&self) {
        let mut port = emulator::DEFAULT_CONSOLE_PORT;
        for _ in 0..self.config.num_emulators {
            self.add_available_device(DeviceHandle::stub(&emulator::emulator_serial(port), true));
            port += emulator::EMULATOR_PORT_STEP;
        }
    }

    /// Add placeholders for runs that need no hardware
    fn add_null_devices(&self) {
        for i in 0..self.config.num_null_devices {
            self.add_available_device(DeviceHandle::null_device(&format!("null-device-{}", i)));
        }
    }

    /// Enumerate devices already sitting in fastboot mode at init
    async fn add_fastboot_devices(&self) {
        let result = self
            .runner
            .run_timed_cmd(
                FASTBOOT_CMD_TIMEOUT,
                &[self.config.fastboot_path.as_str(), "devices"],
            )
            .await;
        if result.status.is_success() {
            for serial in parse_fastboot_devices(&result.stdout) {
                self.add_available_device(DeviceHandle::fastboot_device(&serial));
            }
        }
    }

    fn create_allocated_device(&self, handle: DeviceHandle) -> Arc<ManagedDevice> {
        let monitor = self.new_state_monitor(&handle);
        let device = Arc::new(ManagedDevice::new(
            handle.clone(),
            monitor,
            self.runner.clone(),
            self.config.adb_path.clone(),
            self.config.device.clone(),
        ));
        device.set_fastboot_enabled(self.fastboot_enabled);
        if self.enable_logcat.load(Ordering::SeqCst) && !handle.is_stub() {
            device.start_logcat();
        }
        self.allocated
            .lock()
            .insert(handle.serial.clone(), device.clone());
        debug!("Allocated device {}", handle.serial);
        self.events.emit(PoolEvent::DeviceAllocated {
            serial: handle.serial.clone(),
        });
        device
    }

    async fn kill_emulator(&self, device: &Arc<ManagedDevice>) -> Result<()> {
        match emulator::emulator_port(device.serial()) {
            Some(port) => {
                if emulator::console_kill(port).await.is_err() {
                    warn!(
                        "Could not reach emulator console for {}",
                        device.serial()
                    );
                }
            }
            None => warn!(
                "Could not determine console port for {}",
                device.serial()
            ),
        }
        // make sure the process is gone even if the console answered
        device.kill_emulator_process();
        if !device
            .wait_for_device_not_available(EMULATOR_KILL_TIMEOUT)
            .await
        {
            return Err(PoolError::DeviceNotAvailable(format!(
                "Failed to kill emulator {}",
                device.serial()
            )));
        }
        Ok(())
    }

    async fn execute_global_adb_command(&self, args: &[&str]) -> Option<String> {
        let mut argv = vec![self.config.adb_path.as_str()];
        argv.extend_from_slice(args);
        let result = self.runner.run_timed_cmd(FASTBOOT_CMD_TIMEOUT, &argv).await;
        if result.status.is_success() {
            return Some(result.stdout);
        }
        warn!("adb {} failed", args.first().unwrap_or(&""));
        None
    }

    /// `adb connect` with a fixed number of attempts; success means
    /// stdout begins with `connected to <ip:port>`.
    async fn do_adb_connect(&self, ip_and_port: &str) -> bool {
        let expected = format!("connected to {}", ip_and_port);
        for attempt in 1..=self.config.adb_connect_attempts {
            if let Some(output) = self
                .execute_global_adb_command(&["connect", ip_and_port])
                .await
            {
                if output.starts_with(&expected) {
                    return true;
                }
                warn!(
                    "Failed to connect to device on {}, attempt {} of {}. Response: {}.",
                    ip_and_port,
                    attempt,
                    self.config.adb_connect_attempts,
                    output.trim()
                );
            }
            self.runner.sleep(self.config.adb_connect_wait()).await;
        }
        false
    }

    async fn handle_bridge_event(self: &Arc<Self>, event: BridgeEvent) {
        match event {
            BridgeEvent::Connected(device) => self.device_connected(device).await,
            BridgeEvent::Changed {
                device,
                change_mask,
            } => self.device_changed(device, change_mask).await,
            BridgeEvent::Disconnected(device) => self.device_disconnected(device),
        }
    }

    async fn device_connected(self: &Arc<Self>, device: DeviceHandle) {
        debug!("Detected device connect {}", device.serial);
        let allocated = self.allocated.lock().get(&device.serial).cloned();
        if let Some(test_device) = allocated {
            // known serial: the bridge hands out a fresh identity, so
            // refresh the managed device's view of it
            debug!("Updating handle for device {}", device.serial);
            let state = device.state;
            test_device.set_handle(device);
            test_device.set_device_state(state);
        } else if is_valid_serial(&device.serial) && device.state == DeviceState::Online {
            self.check_and_add_available(device).await;
        } else {
            let monitor = self.checking.lock().get(&device.serial).cloned();
            if let Some(monitor) = monitor {
                monitor.set_state(device.state);
            }
        }
    }

    async fn device_changed(self: &Arc<Self>, device: DeviceHandle, change_mask: u32) {
        if change_mask & CHANGE_STATE == 0 {
            return;
        }
        let allocated = self.allocated.lock().get(&device.serial).cloned();
        if let Some(test_device) = allocated {
            test_device.set_device_state(device.state);
            return;
        }
        let monitor = self.checking.lock().get(&device.serial).cloned();
        if let Some(monitor) = monitor {
            monitor.set_state(device.state);
        } else if device.state == DeviceState::Online
            && !self
                .available
                .contains(&serial_matcher(device.serial.clone()))
        {
            self.check_and_add_available(device).await;
        }
    }

    fn device_disconnected(&self, device: DeviceHandle) {
        if self
            .available
            .take_if(&serial_matcher(device.serial.clone()))
            .is_some()
        {
            info!(
                "Removed disconnected device {} from available queue",
                device.serial
            );
        }
        let allocated = self.allocated.lock().get(&device.serial).cloned();
        if let Some(test_device) = allocated {
            test_device.set_device_state(DeviceState::NotAvailable);
        } else {
            let monitor = self.checking.lock().get(&device.serial).cloned();
            if let Some(monitor) = monitor {
                monitor.set_state(DeviceState::NotAvailable);
            }
        }
        self.events.emit(PoolEvent::FleetChanged);
    }

    /// Admission: probe a newly observed device for shell
    /// responsiveness and enqueue it when it answers. While the probe is
    /// in flight the serial sits in the checking set, which doubles as a
    /// do-not-re-admit gate.
    async fn check_and_add_available(self: &Arc<Self>, device: DeviceHandle) {
        let monitor = {
            let mut checking = self.checking.lock();
            if checking.contains_key(&device.serial) {
                debug!("Already checking new device {}, ignoring", device.serial);
                return;
            }
            if !self.global_filter.matches(&device) {
                debug!(
                    "New device {} doesn't match global filter, ignoring",
                    device.serial
                );
                return;
            }
            let monitor = self.new_state_monitor(&device);
            checking.insert(device.serial.clone(), monitor.clone());
            monitor
        };

        let inner = self.clone();
        let serial = device.serial.clone();
        let probe = async move {
            match inner.admission_permits.clone().acquire_owned().await {
                Ok(_permit) => {
                    debug!("checking new device {} responsiveness", serial);
                    let responsive = tokio::select! {
                        _ = inner.shutdown.cancelled() => None,
                        responsive =
                            monitor.wait_for_device_shell(CHECK_WAIT_DEVICE_AVAIL) =>
                        {
                            Some(responsive)
                        }
                    };
                    match responsive {
                        Some(true) => {
                            info!("Detected new device {}", serial);
                            inner.add_available_device(device);
                        }
                        Some(false) => debug!(
                            "Device {} is not responsive to adb shell command, \
                             skip adding to available pool",
                            serial
                        ),
                        None => debug!("admission check for {} cancelled", serial),
                    }
                }
                // semaphore closed: the manager is shutting down
                Err(_) => {}
            }
            inner.checking.lock().remove(&serial);
        };
        if self.synchronous_mode.load(Ordering::SeqCst) {
            probe.await;
        } else {
            let mut tasks = self.admission_tasks.lock();
            // reap finished probes so the set stays small
            while tasks.try_join_next().is_some() {}
            tasks.spawn(probe);
        }
    }
}
