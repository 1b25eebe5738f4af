/// Logical register descriptor
///
/// A `Register` names one value on a slave: which table it lives in, where it
/// starts, how many consecutive addresses it spans and in which order those
/// addresses are combined. The latest and previous composed values are kept
/// alongside and are only written by the transport's poll and change-detection
/// cycles.

use std::time::Instant;
use log::warn;
use serde::Serialize;

use crate::protocol::RegisterType;

/// Sentinel for a value that has not been composed since the last reset
pub const UNSET_VALUE: u64 = u64::MAX;

/// One logical multi-word or multi-bit value on a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Register {
    address: u16,
    register_type: RegisterType,
    count: u8,
    little_endian: bool,
    enabled_change_event: bool,
    value: u64,
    last_value: u64,
    #[serde(skip)]
    reenable_at: Option<Instant>,
}

impl Register {
    /// Create a register descriptor
    ///
    /// `count` is clamped into `1..=register_type.max_count()`; a misconfigured
    /// width is logged, never rejected. Change events start enabled.
    pub fn new(address: u16, register_type: RegisterType, count: u8, little_endian: bool) -> Self {
        let max = register_type.max_count();
        let clamped = count.clamp(1, max);
        if clamped != count {
            warn!(
                "Register {} @ {}: count {} out of range 1-{}, clamped to {}",
                register_type, address, count, max, clamped
            );
        }

        Self {
            address,
            register_type,
            count: clamped,
            little_endian,
            enabled_change_event: true,
            value: UNSET_VALUE,
            last_value: UNSET_VALUE,
            reenable_at: None,
        }
    }

    /// Single coil
    pub fn coil(address: u16) -> Self {
        Self::new(address, RegisterType::CoilsStatus, 1, false)
    }

    /// Single discrete input
    pub fn discrete_input(address: u16) -> Self {
        Self::new(address, RegisterType::DiscreteInput, 1, false)
    }

    /// Holding register value spanning `count` words
    pub fn holding(address: u16, count: u8, little_endian: bool) -> Self {
        Self::new(address, RegisterType::HoldingRegister, count, little_endian)
    }

    /// Input register value spanning `count` words
    pub fn input(address: u16, count: u8, little_endian: bool) -> Self {
        Self::new(address, RegisterType::InputRegister, count, little_endian)
    }

    /// Builder-style toggle for change events
    pub fn with_change_events(mut self, enabled: bool) -> Self {
        self.enabled_change_event = enabled;
        self
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn register_type(&self) -> RegisterType {
        self.register_type
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    pub fn enabled_change_event(&self) -> bool {
        self.enabled_change_event
    }

    /// Latest composed value, [`UNSET_VALUE`] before the first change-detection pass
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Value before the latest change
    pub fn last_value(&self) -> u64 {
        self.last_value
    }

    /// True once a value has been composed since the last reset
    pub fn is_synchronized(&self) -> bool {
        self.value != UNSET_VALUE
    }

    /// Bus addresses covered by this register
    ///
    /// Addresses past 65535 are dropped.
    pub fn addresses(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.count as u16).filter_map(move |offset| self.address.checked_add(offset))
    }

    /// Identity used to tell whether a device's register set changed
    pub(crate) fn layout_key(&self) -> (RegisterType, u16, u8, bool) {
        (self.register_type, self.address, self.count, self.little_endian)
    }

    /// Enable or disable change events, cancelling any pending timed re-enable
    pub fn set_change_events(&mut self, enabled: bool) {
        self.enabled_change_event = enabled;
        self.reenable_at = None;
    }

    /// Disable change events until `deadline`, after which the change tick
    /// turns them back on
    pub(crate) fn disable_until(&mut self, deadline: Option<Instant>) {
        self.enabled_change_event = false;
        self.reenable_at = deadline;
    }

    /// Re-enable change events if the timed suppression has expired
    pub(crate) fn expire_suppression(&mut self, now: Instant) -> bool {
        match self.reenable_at {
            Some(deadline) if now >= deadline => {
                self.enabled_change_event = true;
                self.reenable_at = None;
                true
            }
            _ => false,
        }
    }

    /// Store a freshly composed value
    ///
    /// Returns true when the value differs from the stored one, in which case
    /// the previous value moves to `last_value`. A composed value equal to
    /// [`UNSET_VALUE`] (an all-ones 64-bit register) is indistinguishable from
    /// "never read" and never counts as a first change.
    pub(crate) fn apply(&mut self, composed: u64) -> bool {
        if composed == self.value {
            return false;
        }
        self.last_value = self.value;
        self.value = composed;
        true
    }

    /// Forget both values
    pub(crate) fn reset(&mut self) {
        self.value = UNSET_VALUE;
        self.last_value = UNSET_VALUE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_count_clamping() {
        assert_eq!(Register::holding(0, 0, false).count(), 1);
        assert_eq!(Register::holding(0, 9, false).count(), 4);
        assert_eq!(Register::input(0, 3, true).count(), 3);
        assert_eq!(Register::new(0, RegisterType::CoilsStatus, 64, true).count(), 64);
        assert_eq!(Register::new(0, RegisterType::DiscreteInput, 200, true).count(), 64);
    }

    #[test]
    fn test_initial_state() {
        let reg = Register::holding(40, 2, true);
        assert_eq!(reg.value(), UNSET_VALUE);
        assert_eq!(reg.last_value(), UNSET_VALUE);
        assert!(!reg.is_synchronized());
        assert!(reg.enabled_change_event());
        assert_eq!(reg.addresses().collect::<Vec<_>>(), vec![40, 41]);
    }

    #[test]
    fn test_addresses_stop_at_end_of_space() {
        let reg = Register::holding(u16::MAX, 4, false);
        assert_eq!(reg.addresses().collect::<Vec<_>>(), vec![u16::MAX]);
    }

    #[test]
    fn test_apply_shifts_previous_value() {
        let mut reg = Register::input(0, 1, false);
        assert!(reg.apply(5));
        assert_eq!(reg.last_value(), UNSET_VALUE);
        assert!(!reg.apply(5));
        assert!(reg.apply(7));
        assert_eq!(reg.value(), 7);
        assert_eq!(reg.last_value(), 5);

        reg.reset();
        assert!(!reg.is_synchronized());
    }

    #[test]
    fn test_all_ones_value_reads_as_unset() {
        let mut reg = Register::input(0, 4, false);
        assert!(!reg.apply(u64::MAX));
        assert!(!reg.is_synchronized());
        assert!(reg.apply(1));
        assert!(reg.apply(u64::MAX));
        assert_eq!(reg.last_value(), 1);
    }

    #[test]
    fn test_timed_suppression() {
        let mut reg = Register::coil(3);
        let now = Instant::now();
        reg.disable_until(Some(now + Duration::from_millis(100)));
        assert!(!reg.enabled_change_event());
        assert!(!reg.expire_suppression(now));
        assert!(reg.expire_suppression(now + Duration::from_millis(150)));
        assert!(reg.enabled_change_event());

        reg.disable_until(None);
        assert!(!reg.expire_suppression(now + Duration::from_secs(3600)));
        assert!(!reg.enabled_change_event());
    }
}
