#![no_std]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

#[cfg(test)]
extern crate std;

use alloc::string::String;

pub(crate) mod frame;
pub(crate) mod msr;
pub(crate) mod segmentation;

#[cfg(test)]
pub(crate) mod test_utils;

cfg_if::cfg_if! {
    if #[cfg(feature = "vmx")] {
        mod vmx;
        use vmx as vender;
        pub use vmx::{VmxExitReason, VmxInstructionError};
        pub use vender::has_hardware_support;
        pub use vender::{describe_vmx_capabilities, is_vmx_usable};
        pub use vender::monitor::run_latency_measurement;
    }
}

/// A 4 KiB physical page address usable as a VMX region pointer.
pub type HostPhysAddr = usize;
/// A kernel virtual address mapping a [`HostPhysAddr`].
pub type HostVirtAddr = usize;

/// Hardware-abstraction hooks supplied by the embedding driver.
///
/// Pages handed out by [`Hal::alloc_frame`] must be pinned, 4 KiB-aligned
/// physical pages that stay mapped until [`Hal::dealloc_frame`]. Interrupt
/// masking must affect the current logical processor only.
pub trait Hal {
    /// Allocate one pinned physical page, or `None` when exhausted.
    fn alloc_frame() -> Option<HostPhysAddr>;
    /// Free a page previously returned by [`Hal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);
    /// Translate a frame's physical address to an accessible virtual address.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;
    /// Mask local interrupts, returning the previous interrupt state.
    fn irq_save() -> u64;
    /// Restore the interrupt state returned by [`Hal::irq_save`].
    fn irq_restore(flags: u64);
}

/// Errors reported by one measurement run.
///
/// Teardown anomalies (VMCLEAR/VMXOFF failures) are deliberately absent:
/// teardown always runs to completion and only logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmxError {
    /// The processor does not support VMX, or reports unusable VMX geometry.
    UnsupportedHardware(String),
    /// Firmware has not enabled VMX outside SMX, or left the lock bit clear.
    FirmwareDisabled,
    /// Page acquisition stopped early; `acquired` pages were obtained before
    /// the failing one and have already been released.
    ResourceExhaustion { acquired: usize },
    /// CR0/CR4 are not in a VMX-compatible state, or VMXON failed hard.
    ActivationFailure(String),
    /// VMPTRLD could not make the VMCS current.
    PointerLoadFailure(String),
    /// VMLAUNCH failed; carries the VM-instruction-error code.
    LaunchFailure(VmxInstructionError),
    /// A VMREAD/VMWRITE touched an unsupported field, or some other VMX
    /// instruction failed outside the launch path. A logic error, not a
    /// recoverable run condition.
    VmInstructionFailed(String),
}

impl core::fmt::Display for VmxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnsupportedHardware(why) => write!(f, "unsupported hardware: {why}"),
            Self::FirmwareDisabled => write!(f, "VMX is disabled by firmware"),
            Self::ResourceExhaustion { acquired } => {
                write!(f, "page allocation failed after {acquired} page(s)")
            }
            Self::ActivationFailure(why) => write!(f, "VMX activation failed: {why}"),
            Self::PointerLoadFailure(why) => write!(f, "VMPTRLD failed: {why}"),
            Self::LaunchFailure(err) => write!(f, "VMLAUNCH failed: {}", err.as_str()),
            Self::VmInstructionFailed(why) => write!(f, "VMX instruction failed: {why}"),
        }
    }
}

pub type Result<T = ()> = core::result::Result<T, VmxError>;
