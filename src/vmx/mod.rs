mod capabilities;
mod definitions;
mod instructions;
pub(crate) mod monitor;
mod percpu;
mod structs;
mod vmcs;

use self::structs::{FeatureControl, FeatureControlFlags};
use crate::{Result, VmxError};

pub use self::capabilities::VmxCapabilities;
pub use self::definitions::VmxExitReason;
pub use self::vmcs::VmxInstructionError;

/// Return if the current platform supports virtualization extension.
pub fn has_hardware_support() -> bool {
    if let Some(feature) = raw_cpuid::CpuId::new().get_feature_info() {
        feature.has_vmx()
    } else {
        false
    }
}

/// Check that firmware has locked VMX on outside SMX.
///
/// Strictly read-only: an unlocked feature-control MSR is reported as
/// firmware-disabled rather than being locked here.
fn vmx_enabled_by_firmware() -> Result {
    let ctrl = FeatureControl::read();
    if !ctrl.contains(FeatureControlFlags::LOCKED)
        || !ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX)
    {
        return Err(VmxError::FirmwareDisabled);
    }
    Ok(())
}

/// Capability and firmware-enablement check. Safe to call anytime; touches no
/// processor state beyond CPUID and one MSR read.
pub fn is_vmx_usable() -> bool {
    if !has_hardware_support() {
        warn!("VMX is not supported by this CPU");
        return false;
    }
    if vmx_enabled_by_firmware().is_err() {
        warn!("VMX is disabled by firmware");
        return false;
    }
    info!("VMX is supported and enabled");
    true
}

/// Log the raw VMX capability MSR values and the derived control masks.
pub fn describe_vmx_capabilities() {
    if !is_vmx_usable() {
        return;
    }
    match VmxCapabilities::read() {
        Ok(caps) => caps.describe(),
        Err(err) => warn!("failed to read VMX capabilities: {err}"),
    }
}

fn as_err(err: x86::vmx::VmFail) -> VmxError {
    use x86::vmx::VmFail;
    match err {
        VmFail::VmFailValid => VmxError::VmInstructionFailed(alloc::string::String::from(
            vmcs::instruction_error().as_str(),
        )),
        VmFail::VmFailInvalid => {
            VmxError::VmInstructionFailed(alloc::string::String::from("no current VMCS"))
        }
    }
}
