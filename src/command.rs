/// Write commands and the ordered queue feeding them to the poll loop
///
/// Any thread may enqueue; only the transport's poll loop dequeues, one
/// command after each device's input pass. Commands run strictly in the order
/// they were enqueued. Callers get no result back: failures show up in the
/// logs and the transport's cycle statistics.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use log::warn;

use crate::protocol::{ModbusFunction, RegisterType, SlaveId};
use crate::utils::format::{bits_to_string, registers_to_hex};

/// A pending operation for the poll loop
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCommand {
    /// Function 0x05
    WriteSingleCoil { slave: SlaveId, address: u16, value: bool },
    /// Function 0x0F
    WriteMultipleCoils { slave: SlaveId, address: u16, values: Vec<bool> },
    /// Function 0x06
    WriteSingleRegister { slave: SlaveId, address: u16, value: u16 },
    /// Function 0x10
    WriteMultipleRegisters { slave: SlaveId, address: u16, values: Vec<u16> },
    /// Hold the poll loop (and therefore the whole bus) for `duration`
    Sleep { duration: Duration },
    /// Switch change events for one register (`address = Some`) or a whole
    /// table (`None`) in queue order with the surrounding writes
    ToggleEnableSync {
        slave: SlaveId,
        register_type: RegisterType,
        address: Option<u16>,
        enabled: bool,
    },
}

impl WriteCommand {
    /// Target slave, `None` for `Sleep`
    pub fn slave(&self) -> Option<SlaveId> {
        match self {
            WriteCommand::WriteSingleCoil { slave, .. }
            | WriteCommand::WriteMultipleCoils { slave, .. }
            | WriteCommand::WriteSingleRegister { slave, .. }
            | WriteCommand::WriteMultipleRegisters { slave, .. }
            | WriteCommand::ToggleEnableSync { slave, .. } => Some(*slave),
            WriteCommand::Sleep { .. } => None,
        }
    }

    /// Bus function this command issues, if any
    pub fn function(&self) -> Option<ModbusFunction> {
        match self {
            WriteCommand::WriteSingleCoil { .. } => Some(ModbusFunction::WriteSingleCoil),
            WriteCommand::WriteMultipleCoils { .. } => Some(ModbusFunction::WriteMultipleCoils),
            WriteCommand::WriteSingleRegister { .. } => Some(ModbusFunction::WriteSingleRegister),
            WriteCommand::WriteMultipleRegisters { .. } => Some(ModbusFunction::WriteMultipleRegisters),
            WriteCommand::Sleep { .. } | WriteCommand::ToggleEnableSync { .. } => None,
        }
    }
}

impl fmt::Display for WriteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteCommand::WriteSingleCoil { slave, address, value } => {
                write!(f, "slave {} coil {} <- {}", slave, address, value)
            }
            WriteCommand::WriteMultipleCoils { slave, address, values } => {
                write!(f, "slave {} coils {}..+{} <- {}", slave, address, values.len(), bits_to_string(values))
            }
            WriteCommand::WriteSingleRegister { slave, address, value } => {
                write!(f, "slave {} holding {} <- 0x{:04X}", slave, address, value)
            }
            WriteCommand::WriteMultipleRegisters { slave, address, values } => {
                write!(f, "slave {} holding {}..+{} <- [{}]", slave, address, values.len(), registers_to_hex(values))
            }
            WriteCommand::Sleep { duration } => write!(f, "sleep {:?}", duration),
            WriteCommand::ToggleEnableSync { slave, register_type, address, enabled } => {
                let target = address.map_or_else(|| "*".to_string(), |a| a.to_string());
                write!(f, "slave {} {} {} change events {}", slave, register_type, target,
                       if *enabled { "on" } else { "off" })
            }
        }
    }
}

/// Multi-producer, single-consumer FIFO of write commands
///
/// Unbounded by default; with a capacity, commands arriving while the queue
/// is full are dropped with a warning.
#[derive(Debug, Clone, Default)]
pub struct WriteQueue {
    inner: Arc<Mutex<VecDeque<WriteCommand>>>,
    capacity: Option<usize>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounded(capacity: usize) -> Self {
        Self {
            inner: Arc::default(),
            capacity: Some(capacity),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<WriteCommand>> {
        // a panicking producer cannot leave a VecDeque half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a command; returns false if it was dropped
    pub fn enqueue(&self, command: WriteCommand) -> bool {
        let mut queue = self.lock();
        if let Some(capacity) = self.capacity {
            if queue.len() >= capacity {
                warn!("Write queue full ({} pending), dropping: {}", capacity, command);
                return false;
            }
        }
        queue.push_back(command);
        true
    }

    /// Take the oldest command
    pub(crate) fn pop(&self) -> Option<WriteCommand> {
        self.lock().pop_front()
    }

    /// Discard everything pending; returns how many commands were dropped
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coil(address: u16) -> WriteCommand {
        WriteCommand::WriteSingleCoil { slave: 1, address, value: true }
    }

    #[test]
    fn test_fifo_order() {
        let queue = WriteQueue::new();
        for address in 0..5 {
            assert!(queue.enqueue(coil(address)));
        }
        assert_eq!(queue.len(), 5);
        for address in 0..5 {
            assert_eq!(queue.pop(), Some(coil(address)));
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_bounded_drops_overflow() {
        let queue = WriteQueue::bounded(2);
        assert!(queue.enqueue(coil(1)));
        assert!(queue.enqueue(coil(2)));
        assert!(!queue.enqueue(coil(3)));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_producers_on_other_threads() {
        let queue = WriteQueue::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        queue.enqueue(coil(t * 100 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.len(), 100);
    }

    #[test]
    fn test_command_metadata() {
        let sleep = WriteCommand::Sleep { duration: Duration::from_millis(5) };
        assert_eq!(sleep.slave(), None);
        assert_eq!(sleep.function(), None);

        let write = WriteCommand::WriteMultipleRegisters { slave: 4, address: 10, values: vec![1, 2] };
        assert_eq!(write.slave(), Some(4));
        assert_eq!(write.function(), Some(ModbusFunction::WriteMultipleRegisters));
        assert_eq!(write.to_string(), "slave 4 holding 10..+2 <- [0001 0002]");

        let coils = WriteCommand::WriteMultipleCoils { slave: 4, address: 0, values: vec![true, false, true] };
        assert_eq!(coils.to_string(), "slave 4 coils 0..+3 <- 101");
    }
}
