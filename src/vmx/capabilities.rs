//! Cached VMX capability state, read once per run before any other
//! VMX-touching step.

use alloc::string::String;

use crate::msr::Msr;
use crate::{Result, VmxError};

use super::structs::VmxBasic;

/// One hardware-reported control mask pair. (SDM Vol. 3D, Appendix A.3-A.5)
///
/// `allowed0` names the bits that must be 1 in the corresponding VMCS control
/// field; `allowed1` names the bits that may be 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityPair {
    pub allowed0: u32,
    pub allowed1: u32,
}

impl CapabilityPair {
    /// Splits a capability MSR value: allowed0 in the low half, allowed1 in
    /// the high half.
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            allowed0: raw as u32,
            allowed1: (raw >> 32) as u32,
        }
    }

    /// The minimal control value the hardware accepts: every mandatory bit,
    /// no optional ones. On conformant hardware allowed0 is a subset of
    /// allowed1, so the intersection never drops a mandatory bit.
    pub const fn minimal(&self) -> u32 {
        self.allowed0 & self.allowed1
    }
}

/// Raw capability MSR values for one control group: the legacy register and,
/// when the processor reports flexible controls, the "true" variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCtls {
    pub legacy: u64,
    pub truev: Option<u64>,
}

impl RawCtls {
    /// The authoritative pair: the true variant when it exists.
    fn pair(&self) -> CapabilityPair {
        CapabilityPair::from_raw(self.truev.unwrap_or(self.legacy))
    }
}

/// The per-run capability cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxCapabilities {
    basic: VmxBasic,
    pub pinbased: CapabilityPair,
    pub procbased: CapabilityPair,
    pub exit: CapabilityPair,
    pub entry: CapabilityPair,
}

impl VmxCapabilities {
    /// Pure derivation from raw MSR values; reading and deriving are split so
    /// the derivation is testable and visibly idempotent.
    pub fn from_raw(
        basic: VmxBasic,
        pinbased: RawCtls,
        procbased: RawCtls,
        exit: RawCtls,
        entry: RawCtls,
    ) -> Self {
        Self {
            basic,
            pinbased: pinbased.pair(),
            procbased: procbased.pair(),
            exit: exit.pair(),
            entry: entry.pair(),
        }
    }

    /// Read the capability MSRs and derive the four control pairs.
    ///
    /// Read-only with respect to processor state; safe to call before any
    /// page has been acquired.
    pub fn read() -> Result<Self> {
        let basic = VmxBasic::read();
        if basic.region_size as usize != memory_addr::PAGE_SIZE_4K {
            return Err(VmxError::UnsupportedHardware(String::from(
                "VMX region size is not 4K",
            )));
        }
        if basic.mem_type != VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK {
            return Err(VmxError::UnsupportedHardware(String::from(
                "VMX memory type is not write-back",
            )));
        }
        if basic.is_32bit_address {
            return Err(VmxError::UnsupportedHardware(String::from(
                "32-bit VMX not supported",
            )));
        }

        let read_group = |legacy: Msr, truev: Msr| RawCtls {
            legacy: legacy.read(),
            truev: basic.has_true_ctls.then(|| truev.read()),
        };
        Ok(Self::from_raw(
            basic,
            read_group(Msr::IA32_VMX_PINBASED_CTLS, Msr::IA32_VMX_TRUE_PINBASED_CTLS),
            read_group(Msr::IA32_VMX_PROCBASED_CTLS, Msr::IA32_VMX_TRUE_PROCBASED_CTLS),
            read_group(Msr::IA32_VMX_EXIT_CTLS, Msr::IA32_VMX_TRUE_EXIT_CTLS),
            read_group(Msr::IA32_VMX_ENTRY_CTLS, Msr::IA32_VMX_TRUE_ENTRY_CTLS),
        ))
    }

    /// The 31-bit VMCS revision identifier stamped into every VMX region.
    pub fn revision_id(&self) -> u32 {
        self.basic.revision_id
    }

    /// Log the cached capability state.
    pub fn describe(&self) {
        info!("VMCS revision identifier: {:#x}", self.basic.revision_id);
        info!("true controls available: {}", self.basic.has_true_ctls);
        info!(
            "pin-based controls:  allowed0 {:#010x}, allowed1 {:#010x}",
            self.pinbased.allowed0, self.pinbased.allowed1
        );
        info!(
            "proc-based controls: allowed0 {:#010x}, allowed1 {:#010x}",
            self.procbased.allowed0, self.procbased.allowed1
        );
        info!(
            "VM-exit controls:    allowed0 {:#010x}, allowed1 {:#010x}",
            self.exit.allowed0, self.exit.allowed1
        );
        info!(
            "VM-entry controls:   allowed0 {:#010x}, allowed1 {:#010x}",
            self.entry.allowed0, self.entry.allowed1
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_basic() -> VmxBasic {
        VmxBasic::from_raw(0x00da_1000_0000_0004)
    }

    #[test]
    fn test_pair_splits_msr_halves() {
        let pair = CapabilityPair::from_raw(0x0000_00ff_0000_0016);
        assert_eq!(pair.allowed0, 0x16);
        assert_eq!(pair.allowed1, 0xff);
    }

    #[test]
    fn test_minimal_is_the_intersection() {
        let pair = CapabilityPair::from_raw(0xffff_00ff_0000_0016);
        assert_eq!(pair.minimal(), 0x16);

        // a (non-conformant) mandatory bit outside allowed1 is dropped;
        // the documented derivation keeps the AND regardless
        let odd = CapabilityPair {
            allowed0: 0x8001,
            allowed1: 0x0001,
        };
        assert_eq!(odd.minimal(), 0x0001);
    }

    #[test]
    fn test_true_variant_is_authoritative() {
        let group = RawCtls {
            legacy: 0x0000_00ff_0000_0016,
            truev: Some(0x0000_00fb_0000_0012),
        };
        let caps = VmxCapabilities::from_raw(sample_basic(), group, group, group, group);
        assert_eq!(caps.pinbased.allowed0, 0x12);
        assert_eq!(caps.pinbased.allowed1, 0xfb);
    }

    #[test]
    fn test_legacy_variant_without_true_ctls() {
        let group = RawCtls {
            legacy: 0x0000_00ff_0000_0016,
            truev: None,
        };
        let caps = VmxCapabilities::from_raw(sample_basic(), group, group, group, group);
        assert_eq!(caps.pinbased.allowed0, 0x16);
        assert_eq!(caps.pinbased.allowed1, 0xff);
    }

    #[test]
    fn test_derivation_is_idempotent() {
        let pin = RawCtls {
            legacy: 0x0000_00ff_0000_0016,
            truev: Some(0x0000_00fb_0000_0012),
        };
        let proc = RawCtls {
            legacy: 0xfff9_fffe_0401_e172,
            truev: None,
        };
        let exit = RawCtls {
            legacy: 0x007f_ffff_0003_6dff,
            truev: None,
        };
        let entry = RawCtls {
            legacy: 0x0000_ffff_0000_11ff,
            truev: None,
        };
        let a = VmxCapabilities::from_raw(sample_basic(), pin, proc, exit, entry);
        let b = VmxCapabilities::from_raw(sample_basic(), pin, proc, exit, entry);
        assert_eq!(a, b);
    }
}
