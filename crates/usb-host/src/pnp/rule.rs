//! PnP match rules
//!
//! A rule carries device-level fields and four interface-level value lists.
//! Each list keeps a bitmask of the slots some interface of the device under
//! scan has satisfied; the masks live only for one device pass.

use common::{Error, Result};
use protocol::USB_PNP_INFO_MAX_INTERFACES;
use std::ops::BitOr;

/// Which rule fields take part in matching
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MatchFlags(u16);

impl MatchFlags {
    pub const VENDOR: Self = Self(0x0001);
    pub const PRODUCT: Self = Self(0x0002);
    pub const DEV_LOW: Self = Self(0x0004);
    pub const DEV_HIGH: Self = Self(0x0008);
    pub const DEV_CLASS: Self = Self(0x0010);
    pub const DEV_SUBCLASS: Self = Self(0x0020);
    pub const DEV_PROTOCOL: Self = Self(0x0040);
    pub const INT_CLASS: Self = Self(0x0080);
    pub const INT_SUBCLASS: Self = Self(0x0100);
    pub const INT_PROTOCOL: Self = Self(0x0200);
    pub const INT_NUMBER: Self = Self(0x0400);

    const NAMES: [(&'static str, MatchFlags); 11] = [
        ("vendor", Self::VENDOR),
        ("product", Self::PRODUCT),
        ("dev_low", Self::DEV_LOW),
        ("dev_high", Self::DEV_HIGH),
        ("dev_class", Self::DEV_CLASS),
        ("dev_subclass", Self::DEV_SUBCLASS),
        ("dev_protocol", Self::DEV_PROTOCOL),
        ("int_class", Self::INT_CLASS),
        ("int_subclass", Self::INT_SUBCLASS),
        ("int_protocol", Self::INT_PROTOCOL),
        ("int_number", Self::INT_NUMBER),
    ];

    const INTERFACE_MASK: u16 = 0x0780;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any interface-level field is flagged
    pub const fn has_interface_fields(self) -> bool {
        self.0 & Self::INTERFACE_MASK != 0
    }

    /// Parse config names such as `"vendor"` or `"int_class"`
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut flags = Self::empty();
        for name in names {
            let name = name.as_ref();
            let flag = Self::NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, f)| *f)
                .ok_or_else(|| Error::Config(format!("unknown match flag '{}'", name)))?;
            flags = flags | flag;
        }
        Ok(flags)
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, f)| self.contains(*f))
            .map(|(n, _)| *n)
            .collect()
    }
}

impl BitOr for MatchFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One interface-level value list with its per-pass mask
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceList {
    values: Vec<u8>,
    mask: u32,
}

impl InterfaceList {
    /// At most [`USB_PNP_INFO_MAX_INTERFACES`] values are kept
    pub fn new(mut values: Vec<u8>) -> Self {
        values.truncate(USB_PNP_INFO_MAX_INTERFACES);
        Self { values, mask: 0 }
    }

    pub fn values(&self) -> &[u8] {
        &self.values
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Mark the first slot holding `value`; false when no slot does
    pub(crate) fn mark(&mut self, value: u8) -> bool {
        match self.values.iter().position(|v| *v == value) {
            Some(slot) => {
                self.mask |= 1 << slot;
                true
            }
            None => false,
        }
    }

    /// Every slot has been satisfied in this pass
    pub(crate) fn complete(&self) -> bool {
        (0..self.values.len()).all(|slot| self.mask & (1 << slot) != 0)
    }

    pub(crate) fn learn(&mut self, value: u8) {
        if self.values.len() < USB_PNP_INFO_MAX_INTERFACES {
            self.values.push(value);
        }
    }

    /// Clear the mask; an unconstrained list also forgets learned values
    pub(crate) fn reset(&mut self, flagged: bool) {
        self.mask = 0;
        if !flagged {
            self.values.clear();
        }
    }
}

/// A driver match rule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub module_name: String,
    pub service_name: String,
    pub match_attr: String,
    pub flags: MatchFlags,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device_low: u16,
    pub bcd_device_high: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub interface_class: InterfaceList,
    pub interface_subclass: InterfaceList,
    pub interface_protocol: InterfaceList,
    pub interface_number: InterfaceList,
    /// Set once the rule matched in the current device pass
    pub pnp_match_flag: bool,
}

impl MatchRule {
    pub fn matched_in_pass(&self) -> bool {
        self.pnp_match_flag
    }

    /// Each interface list with its flag
    pub(crate) fn lists_mut(&mut self) -> [(MatchFlags, &mut InterfaceList); 4] {
        [
            (MatchFlags::INT_CLASS, &mut self.interface_class),
            (MatchFlags::INT_SUBCLASS, &mut self.interface_subclass),
            (MatchFlags::INT_PROTOCOL, &mut self.interface_protocol),
            (MatchFlags::INT_NUMBER, &mut self.interface_number),
        ]
    }

    /// Return the rule to its between-devices state
    pub fn reset_pass(&mut self) {
        let flags = self.flags;
        for (flag, list) in self.lists_mut() {
            list.reset(flags.contains(flag));
        }
        self.pnp_match_flag = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_names() {
        let flags = MatchFlags::from_names(&["vendor", "int_class"]).unwrap();
        assert_eq!(flags.bits(), 0x0081);
        assert!(flags.has_interface_fields());
        assert_eq!(flags.names(), vec!["vendor", "int_class"]);

        assert!(matches!(
            MatchFlags::from_names(&["vendor", "colour"]),
            Err(Error::Config(_))
        ));
        assert!(!MatchFlags::DEV_CLASS.has_interface_fields());
    }

    #[test]
    fn test_list_mark_out_of_order() {
        let mut list = InterfaceList::new(vec![0x02, 0x0A]);
        assert!(list.mark(0x0A));
        assert!(!list.complete());
        assert!(!list.mark(0x08));
        assert!(list.mark(0x02));
        assert!(list.complete());
        assert_eq!(list.mask(), 0b11);
    }

    #[test]
    fn test_duplicate_values_mark_first_slot() {
        let mut list = InterfaceList::new(vec![0x08, 0x08]);
        list.mark(0x08);
        list.mark(0x08);
        assert_eq!(list.mask(), 0b01);
        assert!(!list.complete());
    }

    #[test]
    fn test_reset_pass() {
        let mut rule = MatchRule {
            flags: MatchFlags::INT_CLASS,
            interface_class: InterfaceList::new(vec![0x03]),
            interface_number: InterfaceList::new(vec![0, 1]),
            ..Default::default()
        };
        rule.interface_class.mark(0x03);
        rule.pnp_match_flag = true;

        rule.reset_pass();
        assert_eq!(rule.interface_class.mask(), 0);
        assert_eq!(rule.interface_class.values(), &[0x03]);
        assert!(rule.interface_number.values().is_empty());
        assert!(!rule.matched_in_pass());
    }

    #[test]
    fn test_list_capacity() {
        let mut list = InterfaceList::new((0..40).collect());
        assert_eq!(list.values().len(), USB_PNP_INFO_MAX_INTERFACES);
        list.learn(99);
        assert_eq!(list.values().len(), USB_PNP_INFO_MAX_INTERFACES);
    }
}
