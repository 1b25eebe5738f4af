/// In-memory slave register storage
///
/// Backs the [`SimulatedMaster`](crate::simulator::SimulatedMaster): one bank
/// per simulated slave, holding coils, discrete inputs, holding registers and
/// input registers. Unset addresses read as `false` / `0`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::RegisterType;

/// Thread-safe storage for the four Modbus tables of one slave
///
/// Cloning is cheap and shares the underlying tables, so a test can keep a
/// handle to the bank while the master that serves it is owned by a
/// transport.
#[derive(Debug, Clone, Default)]
pub struct ModbusRegisterBank {
    /// Coils (read/write) - 1 bit each
    coils: Arc<RwLock<HashMap<u16, bool>>>,
    /// Discrete inputs (read-only from the bus) - 1 bit each
    discrete_inputs: Arc<RwLock<HashMap<u16, bool>>>,
    /// Holding registers (read/write) - 16 bits each
    holding_registers: Arc<RwLock<HashMap<u16, u16>>>,
    /// Input registers (read-only from the bus) - 16 bits each
    input_registers: Arc<RwLock<HashMap<u16, u16>>>,
}

impl ModbusRegisterBank {
    /// Create a new register bank with empty data
    pub fn new() -> Self {
        Self::default()
    }

    fn bit_table(&self, register_type: RegisterType) -> ModbusResult<&Arc<RwLock<HashMap<u16, bool>>>> {
        match register_type {
            RegisterType::CoilsStatus => Ok(&self.coils),
            RegisterType::DiscreteInput => Ok(&self.discrete_inputs),
            other => Err(ModbusError::invalid_data(format!("{} is not a bit table", other))),
        }
    }

    fn word_table(&self, register_type: RegisterType) -> ModbusResult<&Arc<RwLock<HashMap<u16, u16>>>> {
        match register_type {
            RegisterType::HoldingRegister => Ok(&self.holding_registers),
            RegisterType::InputRegister => Ok(&self.input_registers),
            other => Err(ModbusError::invalid_data(format!("{} is not a word table", other))),
        }
    }

    /// Read `quantity` bits starting at `address`
    pub fn read_bits(&self, register_type: RegisterType, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let table = self.bit_table(register_type)?
            .read()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {} table", register_type)))?;
        Ok((0..quantity)
            .map(|i| table.get(&address.wrapping_add(i)).copied().unwrap_or(false))
            .collect())
    }

    /// Read `quantity` words starting at `address`
    pub fn read_words(&self, register_type: RegisterType, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let table = self.word_table(register_type)?
            .read()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {} table", register_type)))?;
        Ok((0..quantity)
            .map(|i| table.get(&address.wrapping_add(i)).copied().unwrap_or(0))
            .collect())
    }

    /// Store bits starting at `address`
    pub fn write_bits(&self, register_type: RegisterType, address: u16, values: &[bool]) -> ModbusResult<()> {
        let mut table = self.bit_table(register_type)?
            .write()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {} table", register_type)))?;
        for (i, &value) in values.iter().enumerate() {
            table.insert(address.wrapping_add(i as u16), value);
        }
        Ok(())
    }

    /// Store words starting at `address`
    pub fn write_words(&self, register_type: RegisterType, address: u16, values: &[u16]) -> ModbusResult<()> {
        let mut table = self.word_table(register_type)?
            .write()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {} table", register_type)))?;
        for (i, &value) in values.iter().enumerate() {
            table.insert(address.wrapping_add(i as u16), value);
        }
        Ok(())
    }

    /// Set a coil value (for simulation/testing)
    pub fn set_coil(&self, address: u16, value: bool) -> ModbusResult<()> {
        self.write_bits(RegisterType::CoilsStatus, address, &[value])
    }

    /// Set a discrete input value (for simulation/testing)
    pub fn set_discrete_input(&self, address: u16, value: bool) -> ModbusResult<()> {
        self.write_bits(RegisterType::DiscreteInput, address, &[value])
    }

    /// Set a holding register value (for simulation/testing)
    pub fn set_holding_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        self.write_words(RegisterType::HoldingRegister, address, &[value])
    }

    /// Set an input register value (for simulation/testing)
    pub fn set_input_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        self.write_words(RegisterType::InputRegister, address, &[value])
    }

    /// Get register bank statistics
    pub fn get_stats(&self) -> ModbusResult<RegisterBankStats> {
        let len_bits = |t: &Arc<RwLock<HashMap<u16, bool>>>| {
            t.read().map(|m| m.len()).map_err(|_| ModbusError::internal("Failed to lock bit table"))
        };
        let len_words = |t: &Arc<RwLock<HashMap<u16, u16>>>| {
            t.read().map(|m| m.len()).map_err(|_| ModbusError::internal("Failed to lock word table"))
        };
        Ok(RegisterBankStats {
            coils_count: len_bits(&self.coils)?,
            discrete_inputs_count: len_bits(&self.discrete_inputs)?,
            holding_registers_count: len_words(&self.holding_registers)?,
            input_registers_count: len_words(&self.input_registers)?,
        })
    }
}

/// Register bank statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBankStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
}
