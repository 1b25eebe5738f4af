//! In-memory master for tests and demos
//!
//! [`SimulatedMaster`] implements [`ModbusMaster`] over a set of per-slave
//! [`ModbusRegisterBank`]s. It records every request in a shared journal and
//! can inject transient failures or a permanent disconnect, which is enough to
//! exercise the poll loop without serial hardware or a TCP server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use async_trait::async_trait;
use log::debug;

use crate::client::ModbusMaster;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, RegisterType, SlaveId};
use crate::register_bank::ModbusRegisterBank;

/// One request seen by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: u16,
    pub quantity: u16,
}

/// Simulated bus with any number of slaves
///
/// Clones share all state, so one clone can be moved into a transport while
/// another is kept to drive inputs and inspect traffic.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMaster {
    banks: Arc<RwLock<HashMap<SlaveId, ModbusRegisterBank>>>,
    journal: Arc<Mutex<Vec<RequestRecord>>>,
    disconnected: Arc<AtomicBool>,
    pending_failures: Arc<AtomicU32>,
    latency: Duration,
}

impl SimulatedMaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every request by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Register bank for `slave_id`, created on first use
    pub fn add_slave(&self, slave_id: SlaveId) -> ModbusResult<ModbusRegisterBank> {
        let mut banks = self.banks
            .write()
            .map_err(|_| ModbusError::internal("Failed to lock simulated slaves"))?;
        Ok(banks.entry(slave_id).or_default().clone())
    }

    /// Existing register bank for `slave_id`
    pub fn bank(&self, slave_id: SlaveId) -> Option<ModbusRegisterBank> {
        self.banks.read().ok()?.get(&slave_id).cloned()
    }

    /// Requests seen so far, oldest first
    pub fn journal(&self) -> Vec<RequestRecord> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    pub fn clear_journal(&self) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.clear();
        }
    }

    /// Make the next `count` requests fail with an I/O error
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Drop the connection for good; every later call reports it closed
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Bring a disconnected bus back
    pub fn reconnect(&self) {
        self.disconnected.store(false, Ordering::SeqCst);
    }

    async fn begin(
        &self,
        slave_id: SlaveId,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<ModbusRegisterBank> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(ModbusError::connection_closed("simulated bus disconnected"));
        }

        if let Ok(mut journal) = self.journal.lock() {
            journal.push(RequestRecord { slave_id, function, address, quantity });
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let injected = self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            debug!("Simulated failure for slave {} {}", slave_id, function);
            return Err(ModbusError::io("injected failure"));
        }

        self.bank(slave_id)
            .ok_or_else(|| ModbusError::timeout(format!("slave {} did not respond", slave_id), 0))
    }
}

#[async_trait]
impl ModbusMaster for SimulatedMaster {
    async fn read_coils(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let bank = self.begin(slave_id, ModbusFunction::ReadCoils, address, quantity).await?;
        bank.read_bits(RegisterType::CoilsStatus, address, quantity)
    }

    async fn read_discrete_inputs(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let bank = self.begin(slave_id, ModbusFunction::ReadDiscreteInputs, address, quantity).await?;
        bank.read_bits(RegisterType::DiscreteInput, address, quantity)
    }

    async fn read_holding_registers(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let bank = self.begin(slave_id, ModbusFunction::ReadHoldingRegisters, address, quantity).await?;
        bank.read_words(RegisterType::HoldingRegister, address, quantity)
    }

    async fn read_input_registers(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let bank = self.begin(slave_id, ModbusFunction::ReadInputRegisters, address, quantity).await?;
        bank.read_words(RegisterType::InputRegister, address, quantity)
    }

    async fn write_single_coil(&mut self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()> {
        let bank = self.begin(slave_id, ModbusFunction::WriteSingleCoil, address, 1).await?;
        bank.set_coil(address, value)
    }

    async fn write_single_register(&mut self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()> {
        let bank = self.begin(slave_id, ModbusFunction::WriteSingleRegister, address, 1).await?;
        bank.set_holding_register(address, value)
    }

    async fn write_multiple_coils(&mut self, slave_id: SlaveId, address: u16, values: &[bool]) -> ModbusResult<()> {
        let bank = self.begin(slave_id, ModbusFunction::WriteMultipleCoils, address, values.len() as u16).await?;
        bank.write_bits(RegisterType::CoilsStatus, address, values)
    }

    async fn write_multiple_registers(&mut self, slave_id: SlaveId, address: u16, values: &[u16]) -> ModbusResult<()> {
        let bank = self.begin(slave_id, ModbusFunction::WriteMultipleRegisters, address, values.len() as u16).await?;
        bank.write_words(RegisterType::HoldingRegister, address, values)
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.disconnect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_and_journal() {
        let mut master = SimulatedMaster::new();
        let bank = master.add_slave(3).unwrap();
        bank.set_input_register(10, 0xAAAA).unwrap();

        let words = master.read_input_registers(3, 10, 2).await.unwrap();
        assert_eq!(words, vec![0xAAAA, 0]);

        let bits = master.read_bits(RegisterType::DiscreteInput, 3, 0, 3).await.unwrap();
        assert_eq!(bits, vec![false; 3]);

        let journal = master.journal();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].function, ModbusFunction::ReadInputRegisters);
        assert_eq!(journal[1].quantity, 3);
    }

    #[tokio::test]
    async fn test_unknown_slave_times_out() {
        let mut master = SimulatedMaster::new();
        let err = master.read_coils(9, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_failure_injection_and_disconnect() {
        let mut master = SimulatedMaster::new();
        master.add_slave(1).unwrap();
        master.fail_next(1);

        assert!(master.write_single_coil(1, 0, true).await.is_err());
        assert!(master.write_single_coil(1, 0, true).await.is_ok());
        assert_eq!(master.bank(1).unwrap().read_bits(RegisterType::CoilsStatus, 0, 1).unwrap(), vec![true]);

        let handle = master.clone();
        handle.disconnect();
        assert!(!master.is_connected());
        let err = master.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert!(err.is_fatal());

        handle.reconnect();
        assert!(master.read_holding_registers(1, 0, 1).await.is_ok());
    }
}
