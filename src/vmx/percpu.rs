use alloc::format;
use alloc::string::String;

use x86::bits64::vmx;
use x86_64::registers::control::{Cr0, Cr4, Cr4Flags};

use crate::msr::Msr;
use crate::{Hal, Result, VmxError};

use super::structs::VmxRegion;

/// The processor-global activation record: the CR4.VMXE transition and the
/// VMX-root on/off pairing for the current logical processor.
///
/// At most one instance is live at a time, enforced by ownership rather than
/// a lock: the monitor creates it after masking interrupts and consumes it
/// during teardown, which is the only path that unmasks. The record is only
/// meaningful inside that window.
pub struct VmxActivation {
    /// CR4.VMXE as it was before this activation, for exact restoration.
    prior_vmxe: bool,
    /// Whether the processor is in VMX root operation on our account.
    entered: bool,
}

impl VmxActivation {
    /// Validate CR0/CR4 against the VMX fixed-bit MSRs, snapshot CR4.VMXE
    /// and set it if clear.
    ///
    /// Interrupts must already be masked, and once this returns `Ok` the
    /// same logical processor must reach [`VmxActivation::turn_off`] before
    /// they are unmasked again. A hard failure in a later stage does not
    /// roll CR4 back here; that is the teardown's job.
    pub fn begin() -> Result<Self> {
        // Check control registers are in a VMX-friendly state.
        // (SDM Vol. 3D, Appendix A.7, A.8)
        macro_rules! cr_is_valid {
            ($value: expr, $crx: ident) => {{
                use Msr::*;
                let value = $value;
                paste::paste! {
                    let fixed0 = [<IA32_VMX_ $crx _FIXED0>].read();
                    let fixed1 = [<IA32_VMX_ $crx _FIXED1>].read();
                }
                (value & fixed0 == fixed0) && (value & !fixed1 == 0)
            }};
        }
        if !cr_is_valid!(Cr0::read_raw(), CR0) {
            return Err(VmxError::ActivationFailure(String::from(
                "host CR0 is not valid in VMX operation",
            )));
        }
        if !cr_is_valid!(Cr4::read_raw(), CR4) {
            return Err(VmxError::ActivationFailure(String::from(
                "host CR4 is not valid in VMX operation",
            )));
        }

        let cr4 = Cr4::read();
        let prior_vmxe = cr4.contains(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS);
        if !prior_vmxe {
            unsafe { Cr4::write(cr4 | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS) };
        }
        Ok(Self {
            prior_vmxe,
            entered: false,
        })
    }

    /// Execute VMXON against the region's physical address.
    ///
    /// Success and "already in VMX root operation" (logged, non-fatal) both
    /// mark the activation as entered so teardown pairs it with a VMXOFF; a
    /// hard failure (carry flag) is reported to the caller.
    pub fn turn_on<H: Hal>(&mut self, vmxon_region: &VmxRegion<H>) -> Result {
        use x86::vmx::VmFail;
        match unsafe { vmx::vmxon(vmxon_region.phys_addr() as u64) } {
            Ok(()) => {
                self.entered = true;
                info!("VMX is on");
                Ok(())
            }
            Err(VmFail::VmFailValid) => {
                warn!("VMXON: VMX is already on");
                self.entered = true;
                Ok(())
            }
            Err(VmFail::VmFailInvalid) => Err(VmxError::ActivationFailure(format!(
                "VMXON failed for region {:#x}",
                vmxon_region.phys_addr()
            ))),
        }
    }

    /// Execute VMXOFF if the activation entered VMX root operation, then
    /// restore CR4.VMXE to the snapshot taken by [`VmxActivation::begin`].
    ///
    /// VMXOFF failure is a teardown anomaly: logged, never escalated, so the
    /// restoration below it always runs. Consuming `self` makes the 1:1
    /// pairing with `begin` structural.
    pub fn turn_off(self) {
        if self.entered {
            if let Err(err) = unsafe { vmx::vmxoff() } {
                warn!("VMXOFF failed: {:?}", err);
            } else {
                info!("VMX is off");
            }
        }
        if !self.prior_vmxe {
            unsafe {
                Cr4::update(|cr4| cr4.remove(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS));
            }
        }
    }
}
