//! # Voltage Modbus Sync - Master-side Register Mirror
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **Version:** 0.1.0
//! **License:** MIT
//!
//! Keeps a live, typed mirror of the registers of every slave on a shared
//! Modbus bus. Built on top of any master that can issue the eight standard
//! read/write functions.
//!
//! ## Features
//!
//! - **📦 Coalesced Polling**: registers are merged into contiguous ranges so
//!   each poll pass issues the fewest possible reads
//! - **🔢 Typed Values**: 1-4 words or 1-64 bits composed into a `u64`, in
//!   either word order
//! - **📝 Ordered Writes**: FIFO write queue drained by the poll loop, with the
//!   mirror updated as soon as a write succeeds
//! - **🔔 Change Events**: periodic change detection published on a broadcast
//!   channel, switchable per register with timed re-enable
//! - **🛡️ Failure Recovery**: transient bus errors back off and continue; a
//!   supervisor restarts the loop when the connection comes back
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_modbus_sync::{
//!     Device, Register, RegisterType, SimulatedMaster, SyncTransport, TransportConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> voltage_modbus_sync::ModbusResult<()> {
//!     let master = SimulatedMaster::new();
//!     let slave = master.add_slave(1)?;
//!     slave.set_input_register(0, 0x1234)?;
//!
//!     let transport = SyncTransport::new(master, TransportConfig::named("line-1"));
//!     transport.add_device(Device::with_registers(1, vec![
//!         Register::input(0, 2, false),
//!         Register::holding(100, 1, false),
//!     ]))?;
//!     transport.start().await?;
//!
//!     transport.write_value(1, RegisterType::HoldingRegister, 100, 42);
//!     tokio::time::sleep(std::time::Duration::from_millis(200)).await;
//!     println!("{:?}", transport.register_value(1, RegisterType::InputRegister, 0));
//!
//!     transport.stop().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Application   │◄───│  Change Events  │
//! └─────────────────┘    └─────────────────┘
//!          │ writes               ▲
//! ┌─────────────────┐    ┌─────────────────┐
//! │ Sync Supervisor │    │   Change Tick   │
//! └─────────────────┘    └─────────────────┘
//!          │                      │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Poll Loop     │───►│ Device Mirrors  │
//! │  (+ Write Queue)│    │ (caches, ranges)│
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Modbus Master  │
//! └─────────────────┘
//! ```

/// Core error types and result handling
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod error;

/// Function codes, slave ids and register tables
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod protocol;

/// Word and bit value composition
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod codec;

/// Address coalescing for batched reads
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod coalesce;

/// Logical register descriptors
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod register;

/// Per-slave register mirrors
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod device;

/// Master capability consumed by the poll loop
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod client;

/// Write commands and the write queue
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod command;

/// Change events and dispatch
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod events;

/// Poll loop and change tick over one master connection
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod transport;

/// Restart watchdog and graceful drain
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod supervisor;

/// Transport, supervisor and topology configuration
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod config;

/// Thread-safe register storage for simulated slaves
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod register_bank;

/// In-memory master for tests and demos
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod simulator;

/// Utility functions and performance monitoring
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod utils;

/// Logging system for the library
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod logging;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use protocol::{ModbusFunction, RegisterType, SlaveId};
pub use register::{Register, UNSET_VALUE};
pub use device::{Device, SharedDevice};
pub use client::ModbusMaster;
pub use command::{WriteCommand, WriteQueue};
pub use events::{spawn_dispatcher, ChangeKind, EventHandler, SyncEvent};
pub use transport::{CycleStats, SyncService, SyncTransport};
pub use supervisor::{SupervisorReport, SyncSupervisor};
#[cfg(feature = "prometheus")]
pub use supervisor::SupervisorMetrics;
pub use config::{DeviceConfig, RegisterConfig, SupervisorConfig, SyncConfig, TransportConfig};
pub use register_bank::{ModbusRegisterBank, RegisterBankStats};
pub use simulator::{RequestRecord, SimulatedMaster};
pub use utils::{PerformanceMetrics, OperationTimer};
pub use logging::{LogLevel, LogCallback, CallbackLogger};

/// Maximum number of coils that can be read/written in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers that can be read/written in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Pause after a failed bus call (200 milliseconds)
pub const DEFAULT_ERROR_BACKOFF_MS: u64 = 200;

/// Change detection period (40 milliseconds, 25 Hz)
pub const DEFAULT_CHANGE_INTERVAL_MS: u64 = 40;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Sync v{} - Modbus register mirror and write scheduler by Evan Liu", VERSION)
}
