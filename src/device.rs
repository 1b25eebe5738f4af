/// Slave device mirror
///
/// A `Device` owns the raw per-address caches for the four Modbus tables of
/// one slave, the coalesced read ranges derived from them, and the logical
/// registers composed out of those caches.
///
/// The transport shares each device between its poll loop and its
/// change-detection tick as a [`SharedDevice`]; neither ever holds the lock
/// across bus I/O.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use log::debug;

use crate::codec;
use crate::coalesce::{coalesce, RangeTable};
use crate::protocol::{RegisterType, SlaveId};
use crate::register::Register;

/// Device handle shared by the poll loop and the change tick
pub type SharedDevice = Arc<Mutex<Device>>;

type LayoutKey = (RegisterType, u16, u8, bool);

/// One slave on the bus and its mirrored state
#[derive(Debug, Clone)]
pub struct Device {
    slave: SlaveId,
    registers: Vec<Register>,
    coils: BTreeMap<u16, bool>,
    discrete_inputs: BTreeMap<u16, bool>,
    holding_registers: BTreeMap<u16, u16>,
    input_registers: BTreeMap<u16, u16>,
    coil_ranges: RangeTable,
    discrete_input_ranges: RangeTable,
    holding_ranges: RangeTable,
    input_ranges: RangeTable,
    /// Register layout used by the last initialization
    layout: Option<Vec<LayoutKey>>,
    /// Every table has been read from the bus since the caches were seeded
    synced: bool,
}

impl Device {
    /// Create a device with no registers
    pub fn new(slave: SlaveId) -> Self {
        Self {
            slave,
            registers: Vec::new(),
            coils: BTreeMap::new(),
            discrete_inputs: BTreeMap::new(),
            holding_registers: BTreeMap::new(),
            input_registers: BTreeMap::new(),
            coil_ranges: RangeTable::new(),
            discrete_input_ranges: RangeTable::new(),
            holding_ranges: RangeTable::new(),
            input_ranges: RangeTable::new(),
            layout: None,
            synced: false,
        }
    }

    /// Create a device with an ordered register list
    pub fn with_registers(slave: SlaveId, registers: Vec<Register>) -> Self {
        let mut device = Self::new(slave);
        device.registers = registers;
        device
    }

    /// Append a register; takes effect at the next initialization
    pub fn add_register(&mut self, register: Register) {
        self.registers.push(register);
    }

    /// Wrap into the shared handle the transport expects
    pub fn into_shared(self) -> SharedDevice {
        Arc::new(Mutex::new(self))
    }

    pub fn slave(&self) -> SlaveId {
        self.slave
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    /// Find a register by table and start address
    pub fn register(&self, register_type: RegisterType, address: u16) -> Option<&Register> {
        self.registers
            .iter()
            .find(|r| r.register_type() == register_type && r.address() == address)
    }

    pub(crate) fn register_mut(&mut self, register_type: RegisterType, address: u16) -> Option<&mut Register> {
        self.registers
            .iter_mut()
            .find(|r| r.register_type() == register_type && r.address() == address)
    }

    /// True once `initialize` has run for the current register set
    pub fn is_initialized(&self) -> bool {
        self.layout.as_ref() == Some(&self.current_layout())
    }

    /// True once a full read of every table has landed after initialization
    ///
    /// Until then the caches hold zero placeholders and the change tick leaves
    /// the device alone.
    pub fn is_synced(&self) -> bool {
        self.synced && self.is_initialized()
    }

    /// Record that every table has been read since the last initialization
    pub(crate) fn mark_synced(&mut self) {
        self.synced = true;
    }

    /// Require a fresh full read before the device is considered synced again
    pub(crate) fn mark_stale(&mut self) {
        self.synced = false;
    }

    fn current_layout(&self) -> Vec<LayoutKey> {
        self.registers.iter().map(Register::layout_key).collect()
    }

    /// (Re-)initialize caches and coalesced tables from the register set
    ///
    /// Clears the four raw caches, seeds a zero entry for every address any
    /// register covers, recomputes the four coalesced tables and resets every
    /// register value. When the register set is unchanged since the previous
    /// call nothing is touched and `false` is returned.
    pub fn initialize(&mut self) -> bool {
        let layout = self.current_layout();
        if self.layout.as_ref() == Some(&layout) {
            debug!("Device {}: register set unchanged, keeping mirror", self.slave);
            return false;
        }

        self.coils.clear();
        self.discrete_inputs.clear();
        self.holding_registers.clear();
        self.input_registers.clear();

        for register in &self.registers {
            for address in register.addresses() {
                match register.register_type() {
                    RegisterType::CoilsStatus => { self.coils.insert(address, false); }
                    RegisterType::DiscreteInput => { self.discrete_inputs.insert(address, false); }
                    RegisterType::HoldingRegister => { self.holding_registers.insert(address, 0); }
                    RegisterType::InputRegister => { self.input_registers.insert(address, 0); }
                }
            }
        }

        self.coil_ranges = coalesce(self.coils.keys().copied());
        self.discrete_input_ranges = coalesce(self.discrete_inputs.keys().copied());
        self.holding_ranges = coalesce(self.holding_registers.keys().copied());
        self.input_ranges = coalesce(self.input_registers.keys().copied());

        for register in &mut self.registers {
            register.reset();
        }
        self.layout = Some(layout);
        self.synced = false;

        debug!(
            "Device {} initialized: {} registers, ranges coils={} discrete={} holding={} input={}",
            self.slave,
            self.registers.len(),
            self.coil_ranges.len(),
            self.discrete_input_ranges.len(),
            self.holding_ranges.len(),
            self.input_ranges.len()
        );
        true
    }

    /// Coalesced read ranges for one table
    pub fn ranges(&self, register_type: RegisterType) -> &RangeTable {
        match register_type {
            RegisterType::CoilsStatus => &self.coil_ranges,
            RegisterType::DiscreteInput => &self.discrete_input_ranges,
            RegisterType::HoldingRegister => &self.holding_ranges,
            RegisterType::InputRegister => &self.input_ranges,
        }
    }

    /// Raw coil cache
    pub fn coils(&self) -> &BTreeMap<u16, bool> {
        &self.coils
    }

    /// Raw discrete input cache
    pub fn discrete_inputs(&self) -> &BTreeMap<u16, bool> {
        &self.discrete_inputs
    }

    /// Raw holding register cache
    pub fn holding_registers(&self) -> &BTreeMap<u16, u16> {
        &self.holding_registers
    }

    /// Raw input register cache
    pub fn input_registers(&self) -> &BTreeMap<u16, u16> {
        &self.input_registers
    }

    fn bit_cache_mut(&mut self, register_type: RegisterType) -> Option<&mut BTreeMap<u16, bool>> {
        match register_type {
            RegisterType::CoilsStatus => Some(&mut self.coils),
            RegisterType::DiscreteInput => Some(&mut self.discrete_inputs),
            _ => None,
        }
    }

    fn word_cache_mut(&mut self, register_type: RegisterType) -> Option<&mut BTreeMap<u16, u16>> {
        match register_type {
            RegisterType::HoldingRegister => Some(&mut self.holding_registers),
            RegisterType::InputRegister => Some(&mut self.input_registers),
            _ => None,
        }
    }

    /// Cached bit at `address` in a bit table
    pub fn bit(&self, register_type: RegisterType, address: u16) -> Option<bool> {
        match register_type {
            RegisterType::CoilsStatus => self.coils.get(&address).copied(),
            RegisterType::DiscreteInput => self.discrete_inputs.get(&address).copied(),
            _ => None,
        }
    }

    /// Cached word at `address` in a word table
    pub fn word(&self, register_type: RegisterType, address: u16) -> Option<u16> {
        match register_type {
            RegisterType::HoldingRegister => self.holding_registers.get(&address).copied(),
            RegisterType::InputRegister => self.input_registers.get(&address).copied(),
            _ => None,
        }
    }

    /// Store bits read from (or written to) the bus starting at `start`
    ///
    /// Ignored for word tables. Values past address 65535 are dropped.
    pub fn merge_bits(&mut self, register_type: RegisterType, start: u16, values: &[bool]) {
        if let Some(cache) = self.bit_cache_mut(register_type) {
            for (offset, &value) in values.iter().enumerate() {
                if let Some(address) = start.checked_add(offset as u16) {
                    cache.insert(address, value);
                }
            }
        }
    }

    /// Store words read from (or written to) the bus starting at `start`
    ///
    /// Ignored for bit tables.
    pub fn merge_words(&mut self, register_type: RegisterType, start: u16, values: &[u16]) {
        if let Some(cache) = self.word_cache_mut(register_type) {
            for (offset, &value) in values.iter().enumerate() {
                if let Some(address) = start.checked_add(offset as u16) {
                    cache.insert(address, value);
                }
            }
        }
    }

    /// Compose a register's value from the current raw cache
    pub fn compose(&self, register: &Register) -> u64 {
        let (address, count, little_endian) = (register.address(), register.count(), register.little_endian());
        match register.register_type() {
            RegisterType::CoilsStatus => codec::compose_bits(&self.coils, address, count, little_endian),
            RegisterType::DiscreteInput => codec::compose_bits(&self.discrete_inputs, address, count, little_endian),
            RegisterType::HoldingRegister => codec::compose_registers(&self.holding_registers, address, count, little_endian),
            RegisterType::InputRegister => codec::compose_registers(&self.input_registers, address, count, little_endian),
        }
    }

    /// Recompose every register and collect the ones that changed
    ///
    /// Expired timed suppressions are lifted first. Changed registers are
    /// always updated; only those with change events enabled are returned.
    pub fn detect_changes(&mut self, now: Instant) -> Vec<Register> {
        let composed: Vec<u64> = self.registers.iter().map(|r| self.compose(r)).collect();

        let mut changed = Vec::new();
        for (register, value) in self.registers.iter_mut().zip(composed) {
            if register.expire_suppression(now) {
                debug!(
                    "Device {}: change events re-enabled for {} @ {}",
                    self.slave,
                    register.register_type(),
                    register.address()
                );
            }
            if register.apply(value) && register.enabled_change_event() {
                changed.push(register.clone());
            }
        }
        changed
    }

    /// Enable or disable change events on one register or a whole table
    ///
    /// `address == None` selects every register of `register_type`. A
    /// `reenable_at` deadline only applies when disabling. Returns the number
    /// of registers touched.
    pub fn set_change_events(
        &mut self,
        register_type: RegisterType,
        address: Option<u16>,
        enabled: bool,
        reenable_at: Option<Instant>,
    ) -> usize {
        let mut touched = 0;
        for register in self
            .registers
            .iter_mut()
            .filter(|r| r.register_type() == register_type)
            .filter(|r| address.map_or(true, |a| r.address() == a))
        {
            if enabled {
                register.set_change_events(true);
            } else {
                register.disable_until(reenable_at);
            }
            touched += 1;
        }
        touched
    }
}
