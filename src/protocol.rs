/// Modbus protocol definitions used by the sync engine
///
/// The engine never frames PDUs itself; these types only name the four data
/// tables and the function codes the master capability is asked to perform.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit identifier of a slave on the bus
pub type SlaveId = u8;

/// Highest assignable unit id on a serial line
pub const MAX_SLAVE_ID: SlaveId = 247;

/// The eight function codes the sync engine asks a master to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Whether the function modifies the slave
    pub fn is_write(self) -> bool {
        (self as u8) > 0x04
    }

    /// Data table the function operates on
    pub fn table(self) -> RegisterType {
        use ModbusFunction::*;
        match self {
            ReadCoils | WriteSingleCoil | WriteMultipleCoils => RegisterType::CoilsStatus,
            ReadDiscreteInputs => RegisterType::DiscreteInput,
            ReadHoldingRegisters | WriteSingleRegister | WriteMultipleRegisters => RegisterType::HoldingRegister,
            ReadInputRegisters => RegisterType::InputRegister,
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = if self.is_write() { "write" } else { "read" };
        write!(f, "FC{:02X} {} {}", *self as u8, action, self.table())
    }
}

/// The four Modbus data tables a register can live in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    /// Single-bit, read-write
    CoilsStatus,
    /// Single-bit, read-only
    DiscreteInput,
    /// 16-bit, read-write
    HoldingRegister,
    /// 16-bit, read-only
    InputRegister,
}

impl RegisterType {
    /// All four tables, in function-code order
    pub const ALL: [RegisterType; 4] = [
        RegisterType::CoilsStatus,
        RegisterType::DiscreteInput,
        RegisterType::HoldingRegister,
        RegisterType::InputRegister,
    ];

    /// Bit tables (coils, discrete inputs) as opposed to 16-bit word tables
    pub fn is_bit(self) -> bool {
        matches!(self, RegisterType::CoilsStatus | RegisterType::DiscreteInput)
    }

    /// Tables the master may write to
    pub fn is_writable(self) -> bool {
        matches!(self, RegisterType::CoilsStatus | RegisterType::HoldingRegister)
    }

    /// Largest number of bus addresses one logical value may span
    pub fn max_count(self) -> u8 {
        if self.is_bit() {
            64
        } else {
            4
        }
    }

    /// Function code used to read this table
    pub fn read_function(self) -> ModbusFunction {
        match self {
            RegisterType::CoilsStatus => ModbusFunction::ReadCoils,
            RegisterType::DiscreteInput => ModbusFunction::ReadDiscreteInputs,
            RegisterType::HoldingRegister => ModbusFunction::ReadHoldingRegisters,
            RegisterType::InputRegister => ModbusFunction::ReadInputRegisters,
        }
    }

    /// Largest quantity a single read request may carry for this table
    pub fn max_read_quantity(self) -> u16 {
        if self.is_bit() {
            crate::MAX_COILS_PER_REQUEST
        } else {
            crate::MAX_REGISTERS_PER_REQUEST
        }
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterType::CoilsStatus => "coil",
            RegisterType::DiscreteInput => "discrete input",
            RegisterType::HoldingRegister => "holding register",
            RegisterType::InputRegister => "input register",
        };
        f.write_str(name)
    }
}
