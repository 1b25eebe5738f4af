//! Configuration for transports, supervisors and register topology
//!
//! Every struct deserializes from YAML or JSON; missing fields fall back to
//! the defaults below.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{RegisterType, SlaveId};
use crate::register::Register;
use crate::utils::validation;

/// Poll loop and change tick tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Name carried by every change event
    pub name: String,
    /// Pause after a failed bus call
    pub error_backoff_ms: u64,
    /// Change-detection period
    pub change_interval_ms: u64,
    /// Pause between poll passes; 0 only yields
    pub cycle_pause_ms: u64,
    /// Pause while no devices are configured
    pub idle_delay_ms: u64,
    /// How long `stop` waits for the poll loop to exit
    pub stop_timeout_ms: u64,
    /// Deadline for a single bus call
    pub request_timeout_ms: u64,
    /// Change event buffer per subscriber
    pub event_capacity: usize,
    /// Pending write limit; unbounded when absent
    pub write_queue_capacity: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: "bus".to_string(),
            error_backoff_ms: crate::DEFAULT_ERROR_BACKOFF_MS,
            change_interval_ms: crate::DEFAULT_CHANGE_INTERVAL_MS,
            cycle_pause_ms: 0,
            idle_delay_ms: 50,
            stop_timeout_ms: 500,
            request_timeout_ms: 1000,
            event_capacity: 1024,
            write_queue_capacity: None,
        }
    }
}

impl TransportConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn change_interval(&self) -> Duration {
        // tokio::time::interval panics on a zero period
        Duration::from_millis(self.change_interval_ms.max(1))
    }

    pub fn cycle_pause(&self) -> Duration {
        Duration::from_millis(self.cycle_pause_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

/// Watchdog and drain tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub watch_interval_ms: u64,
    pub restart_delay_ms: u64,
    pub auto_restart: bool,
    pub drain_timeout_ms: u64,
    /// Warn when no poll cycle completed for this long
    pub stall_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watch_interval_ms: 250,
            restart_delay_ms: 1000,
            auto_restart: true,
            drain_timeout_ms: 2000,
            stall_timeout_ms: 5000,
        }
    }
}

impl SupervisorConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// One register in the topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub address: u16,
    pub register_type: RegisterType,
    #[serde(default = "default_count")]
    pub count: u8,
    #[serde(default)]
    pub little_endian: bool,
    #[serde(default = "default_enabled")]
    pub enabled_change_event: bool,
}

fn default_count() -> u8 {
    1
}

fn default_enabled() -> bool {
    true
}

impl RegisterConfig {
    pub fn build(&self) -> Register {
        Register::new(self.address, self.register_type, self.count, self.little_endian)
            .with_change_events(self.enabled_change_event)
    }
}

/// One slave and its registers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub slave: SlaveId,
    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
}

impl DeviceConfig {
    /// Create the device described by this entry, registers in listed order
    pub fn build(&self) -> Device {
        Device::with_registers(
            self.slave,
            self.registers.iter().map(RegisterConfig::build).collect(),
        )
    }
}

/// Complete configuration of one synchronized bus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub transport: TransportConfig,
    pub supervisor: SupervisorConfig,
    pub devices: Vec<DeviceConfig>,
}

impl SyncConfig {
    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            Some("json") => Self::from_json_str(&text),
            _ => Err(ModbusError::configuration(format!(
                "Unsupported config file extension: {}",
                path.display()
            ))),
        }
    }

    /// Reject duplicate or out-of-range slave ids and a zero-sized write queue
    ///
    /// Register widths are not rejected here; they are clamped when the
    /// register is built.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.transport.write_queue_capacity == Some(0) {
            return Err(ModbusError::configuration("write_queue_capacity must be at least 1"));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            validation::validate_slave_id(device.slave)?;
            if !seen.insert(device.slave) {
                return Err(ModbusError::configuration(format!(
                    "Duplicate slave ID {} in device list",
                    device.slave
                )));
            }
            for register in &device.registers {
                let max = register.register_type.max_count();
                if register.count == 0 || register.count > max {
                    warn!(
                        "Slave {} {} @ {}: count {} will be clamped to 1-{}",
                        device.slave, register.register_type, register.address, register.count, max
                    );
                }
            }
        }
        Ok(())
    }

    /// Build every configured device
    pub fn build_devices(&self) -> Vec<Device> {
        self.devices.iter().map(DeviceConfig::build).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
transport:
  name: line-1
  error_backoff_ms: 150
devices:
  - slave: 1
    registers:
      - { address: 0, register_type: input_register, count: 2, little_endian: true }
      - { address: 10, register_type: coils_status }
  - slave: 2
    registers:
      - address: 100
        register_type: holding_register
        count: 9
        enabled_change_event: false
"#;

    #[test]
    fn test_yaml_topology() {
        let config = SyncConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.transport.name, "line-1");
        assert_eq!(config.transport.error_backoff(), Duration::from_millis(150));
        assert_eq!(config.transport.change_interval_ms, 40);
        assert_eq!(config.supervisor, SupervisorConfig::default());

        let devices = config.build_devices();
        assert_eq!(devices.len(), 2);
        let reg = devices[0].register(RegisterType::InputRegister, 0).unwrap();
        assert_eq!(reg.count(), 2);
        assert!(reg.little_endian());
        assert_eq!(devices[0].register(RegisterType::CoilsStatus, 10).unwrap().count(), 1);

        let clamped = devices[1].register(RegisterType::HoldingRegister, 100).unwrap();
        assert_eq!(clamped.count(), 4);
        assert!(!clamped.enabled_change_event());
    }

    #[test]
    fn test_json_defaults() {
        let config = SyncConfig::from_json_str(r#"{"devices":[{"slave":5}]}"#).unwrap();
        assert_eq!(config.transport, TransportConfig::default());
        assert!(config.devices[0].registers.is_empty());
    }

    #[test]
    fn test_validation_rejects_bad_slaves() {
        let dup = "devices:\n  - slave: 3\n  - slave: 3\n";
        assert!(matches!(
            SyncConfig::from_yaml_str(dup),
            Err(ModbusError::Configuration { .. })
        ));
        assert!(SyncConfig::from_yaml_str("devices:\n  - slave: 0\n").is_err());
        assert!(SyncConfig::from_yaml_str("devices:\n  - slave: 248\n").is_err());
    }

    #[test]
    fn test_request_timeout_and_queue_capacity() {
        let config = SyncConfig::from_yaml_str(
            "transport:\n  request_timeout_ms: 250\n  write_queue_capacity: 16\n",
        )
        .unwrap();
        assert_eq!(config.transport.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.transport.write_queue_capacity, Some(16));
        assert_eq!(TransportConfig::default().write_queue_capacity, None);

        let zero = "transport:\n  write_queue_capacity: 0\n";
        assert!(matches!(SyncConfig::from_yaml_str(zero), Err(ModbusError::Configuration { .. })));
    }

    #[test]
    fn test_parse_errors_are_configuration_errors() {
        let err = SyncConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));
    }

    #[test]
    fn test_from_file_extension() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("voltage_sync_{}.yaml", std::process::id()));
        std::fs::write(&path, YAML).unwrap();
        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.devices.len(), 2);
        std::fs::remove_file(&path).unwrap();

        assert!(SyncConfig::from_file(dir.join("missing.toml")).is_err());
    }
}
