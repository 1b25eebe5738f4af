/// Master capability consumed by the sync engine
///
/// The engine does not frame Modbus PDUs. It drives whatever implements
/// [`ModbusMaster`]: a TCP/RTU client, a gateway connection, or the in-memory
/// [`SimulatedMaster`](crate::simulator::SimulatedMaster). Only the transport's
/// poll loop ever calls into the master.

use async_trait::async_trait;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{RegisterType, SlaveId};

/// Trait defining the bus operations the poll loop needs
///
/// Implementations report a dead connection either by returning
/// `false` from [`is_connected`](Self::is_connected) or by failing a call with
/// [`ModbusError::ConnectionClosed`]; both stop the poll loop. Any other error
/// is treated as transient.
#[async_trait]
pub trait ModbusMaster: Send + Sync {
    /// Read coils (function code 0x01)
    async fn read_coils(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>>;

    /// Read discrete inputs (function code 0x02)
    async fn read_discrete_inputs(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>>;

    /// Read holding registers (function code 0x03)
    async fn read_holding_registers(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>>;

    /// Read input registers (function code 0x04)
    async fn read_input_registers(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>>;

    /// Write single coil (function code 0x05)
    async fn write_single_coil(&mut self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()>;

    /// Write single register (function code 0x06)
    async fn write_single_register(&mut self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()>;

    /// Write multiple coils (function code 0x0F)
    async fn write_multiple_coils(&mut self, slave_id: SlaveId, address: u16, values: &[bool]) -> ModbusResult<()>;

    /// Write multiple registers (function code 0x10)
    async fn write_multiple_registers(&mut self, slave_id: SlaveId, address: u16, values: &[u16]) -> ModbusResult<()>;

    /// Check if the connection is still usable
    fn is_connected(&self) -> bool;

    /// Close the connection
    async fn close(&mut self) -> ModbusResult<()>;

    /// Read a bit table by type
    async fn read_bits(&mut self, register_type: RegisterType, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        match register_type {
            RegisterType::CoilsStatus => self.read_coils(slave_id, address, quantity).await,
            RegisterType::DiscreteInput => self.read_discrete_inputs(slave_id, address, quantity).await,
            other => Err(ModbusError::invalid_data(format!("{} is not a bit table", other))),
        }
    }

    /// Read a word table by type
    async fn read_words(&mut self, register_type: RegisterType, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        match register_type {
            RegisterType::HoldingRegister => self.read_holding_registers(slave_id, address, quantity).await,
            RegisterType::InputRegister => self.read_input_registers(slave_id, address, quantity).await,
            other => Err(ModbusError::invalid_data(format!("{} is not a word table", other))),
        }
    }
}

#[async_trait]
impl<T: ModbusMaster + ?Sized> ModbusMaster for Box<T> {
    async fn read_coils(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        (**self).read_coils(slave_id, address, quantity).await
    }

    async fn read_discrete_inputs(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        (**self).read_discrete_inputs(slave_id, address, quantity).await
    }

    async fn read_holding_registers(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        (**self).read_holding_registers(slave_id, address, quantity).await
    }

    async fn read_input_registers(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        (**self).read_input_registers(slave_id, address, quantity).await
    }

    async fn write_single_coil(&mut self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()> {
        (**self).write_single_coil(slave_id, address, value).await
    }

    async fn write_single_register(&mut self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()> {
        (**self).write_single_register(slave_id, address, value).await
    }

    async fn write_multiple_coils(&mut self, slave_id: SlaveId, address: u16, values: &[bool]) -> ModbusResult<()> {
        (**self).write_multiple_coils(slave_id, address, values).await
    }

    async fn write_multiple_registers(&mut self, slave_id: SlaveId, address: u16, values: &[u16]) -> ModbusResult<()> {
        (**self).write_multiple_registers(slave_id, address, values).await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        (**self).close().await
    }
}
