//! Device-to-rule matching
//!
//! A device pass visits every reported interface and offers it to every
//! rule. Interface-level lists accumulate across the pass, so a rule naming
//! classes `{0x02, 0x0A}` matches once both classes have been seen on the
//! same device, in any order. All per-pass state is reset when the pass ends.

use crate::pnp::rule::{MatchFlags, MatchRule};
use protocol::{
    DeviceDescriptor, DriverBinding, InterfaceSummary, PnpDeviceInfo, USB_CLASS_VENDOR_SPEC,
    USB_PNP_INFO_MAX_INTERFACES,
};
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct PnpMatcher {
    rules: Vec<MatchRule>,
}

impl PnpMatcher {
    /// Rules start in their between-devices state
    pub fn new(mut rules: Vec<MatchRule>) -> Self {
        for rule in &mut rules {
            rule.reset_pass();
        }
        Self { rules }
    }

    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    /// Run one device pass
    ///
    /// Returns a binding per (interface, rule) hit, in scan order. A rule
    /// hits at most once per pass.
    pub fn match_device(&mut self, info: &PnpDeviceInfo) -> Vec<DriverBinding> {
        let mut bindings = Vec::new();

        for iface in info.interfaces.iter().take(USB_PNP_INFO_MAX_INTERFACES) {
            for rule in &mut self.rules {
                if !match_device_fields(rule, &info.device) {
                    continue;
                }
                if match_interface(rule, &info.device, iface) {
                    info!(
                        "Rule {}/{} matched {} at interface {}",
                        rule.module_name, rule.service_name, info.address, iface.number
                    );
                    bindings.push(DriverBinding {
                        module_name: rule.module_name.clone(),
                        service_name: rule.service_name.clone(),
                        match_attr: rule.match_attr.clone(),
                        address: info.address,
                        interface_numbers: rule.interface_number.values().to_vec(),
                    });
                }
            }
        }

        for rule in &mut self.rules {
            rule.reset_pass();
        }
        debug!("{} binding(s) for {}", bindings.len(), info.address);
        bindings
    }
}

/// Device-level gate; bcd limits are an inclusive range
fn match_device_fields(rule: &MatchRule, device: &DeviceDescriptor) -> bool {
    let flags = rule.flags;
    if flags.contains(MatchFlags::VENDOR) && rule.vendor_id != device.vendor_id {
        return false;
    }
    if flags.contains(MatchFlags::PRODUCT) && rule.product_id != device.product_id {
        return false;
    }
    if flags.contains(MatchFlags::DEV_LOW) && rule.bcd_device_low > device.bcd_device {
        return false;
    }
    if flags.contains(MatchFlags::DEV_HIGH) && rule.bcd_device_high < device.bcd_device {
        return false;
    }
    if flags.contains(MatchFlags::DEV_CLASS) && rule.device_class != device.class {
        return false;
    }
    if flags.contains(MatchFlags::DEV_SUBCLASS) && rule.device_subclass != device.subclass {
        return false;
    }
    if flags.contains(MatchFlags::DEV_PROTOCOL) && rule.device_protocol != device.protocol {
        return false;
    }
    true
}

/// Offer one interface to one rule
fn match_interface(
    rule: &mut MatchRule,
    device: &DeviceDescriptor,
    iface: &InterfaceSummary,
) -> bool {
    let flags = rule.flags;

    // Interface-only rules never bind vendor-specific devices
    if device.class == USB_CLASS_VENDOR_SPEC
        && !flags.contains(MatchFlags::VENDOR)
        && flags.has_interface_fields()
    {
        return false;
    }

    let values = [iface.class, iface.subclass, iface.protocol, iface.number];

    let mut found = true;
    for ((flag, list), value) in rule.lists_mut().into_iter().zip(values) {
        if flags.contains(flag) && !list.mark(value) {
            found = false;
        }
    }

    let complete = rule
        .lists_mut()
        .into_iter()
        .all(|(flag, list)| !flags.contains(flag) || list.complete());

    if !rule.pnp_match_flag && found {
        for ((flag, list), value) in rule.lists_mut().into_iter().zip(values) {
            if !flags.contains(flag) {
                list.learn(value);
            }
        }
    }

    if !complete || rule.pnp_match_flag {
        return false;
    }
    rule.pnp_match_flag = true;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pnp::rule::InterfaceList;

    fn iface(number: u8, class: u8) -> InterfaceSummary {
        InterfaceSummary {
            number,
            class,
            subclass: 0,
            protocol: 0,
        }
    }

    #[test]
    fn test_bcd_range_is_inclusive() {
        let rule = MatchRule {
            flags: MatchFlags::DEV_LOW | MatchFlags::DEV_HIGH,
            bcd_device_low: 0x0100,
            bcd_device_high: 0x0200,
            ..Default::default()
        };
        let mut device = DeviceDescriptor::default();
        for (bcd, expected) in [(0x00FF, false), (0x0100, true), (0x0200, true), (0x0201, false)] {
            device.bcd_device = bcd;
            assert_eq!(match_device_fields(&rule, &device), expected, "bcd {:#06x}", bcd);
        }
    }

    #[test]
    fn test_one_shot_per_pass() {
        let mut rule = MatchRule {
            flags: MatchFlags::INT_CLASS,
            interface_class: InterfaceList::new(vec![0x08]),
            ..Default::default()
        };
        let device = DeviceDescriptor::default();
        assert!(match_interface(&mut rule, &device, &iface(0, 0x08)));
        assert!(!match_interface(&mut rule, &device, &iface(1, 0x08)));
        // learned numbers stop once the rule has matched
        assert_eq!(rule.interface_number.values(), &[0]);
    }

    #[test]
    fn test_empty_flagged_list_matches_anything() {
        let mut rule = MatchRule {
            flags: MatchFlags::INT_SUBCLASS,
            ..Default::default()
        };
        assert!(match_interface(
            &mut rule,
            &DeviceDescriptor::default(),
            &iface(0, 0x03)
        ));
    }
}
