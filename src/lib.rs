//! droidpool - Device Pool Manager
//!
//! A device-pool manager for Android-style test harnesses. Discovers
//! physical and virtual devices through a debug bridge, qualifies each
//! device with a shell responsiveness probe, and maintains an
//! allocation pool with mutually exclusive leases.
//!
//! ## Architecture
//!
//! - [`manager::DeviceManager`]: the central lease API (`allocate`,
//!   `free`, `force_allocate`, `launch_emulator`, `connect_to_tcp`)
//! - [`runner::CommandRunner`]: timed subprocess execution with retry
//!   policies and cancellation
//! - [`queue::ConditionQueue`]: FIFO queue with predicate-gated
//!   blocking removal, backing the available pool
//! - [`bridge::DebugBridge`]: device discovery contract, with an
//!   adb-backed implementation
//! - [`fastboot`]: background polling of fastboot-mode devices
//! - [`monitor::DeviceStateMonitor`]: per-device state observation and
//!   waits
//!
//! Bridge events flow into the manager, which admits responsive
//! devices into the available queue; callers lease devices out of the
//! queue and return them with a terminal state.

pub mod bridge;
pub mod config;
pub mod device;
pub mod emulator;
pub mod error;
pub mod events;
pub mod fastboot;
pub mod logcat;
pub mod manager;
pub mod monitor;
pub mod queue;
pub mod runner;
pub mod selection;

pub use bridge::{AdbBridge, BridgeEvent, DebugBridge, CHANGE_STATE};
pub use config::{DeviceOptions, PoolConfig};
pub use device::{
    DeviceHandle, DeviceKind, DeviceState, FreeDeviceState, ManagedDevice, RecoveryMode,
};
pub use error::{PoolError, Result};
pub use events::{EventSubscription, PoolEvent};
pub use fastboot::FastbootListener;
pub use manager::{AllocationState, DeviceManager};
pub use monitor::DeviceStateMonitor;
pub use queue::{ConditionQueue, Matcher};
pub use runner::{CommandResult, CommandRunner, CommandStatus, TimedRunnable};
pub use selection::DeviceSelection;
