//! The measurement run: probe → allocate → activate → load → build → launch
//! → handle exit → unwind.

use alloc::string::String;

use x86::dtables::{self, DescriptorTablePointer};
use x86::segmentation::SegmentSelector;
use x86::bits64::vmx;
use x86_64::registers::control::{Cr0, Cr3, Cr4};

use crate::msr::Msr;
use crate::segmentation::{SegmentAccessRights, canonical_address, system_descriptor_base};
use crate::{Hal, Result, VmxError};

use super::capabilities::VmxCapabilities;
use super::definitions::VmxExitReason;
use super::instructions;
use super::percpu::VmxActivation;
use super::structs::VmxPages;
use super::vmcs::{
    self, VmcsControl32, VmcsControl64, VmcsGuest16, VmcsGuest32, VmcsGuest64, VmcsGuestNW,
    VmcsHost16, VmcsHost32, VmcsHostNW,
};

/// How far a run has progressed. Teardown consults this to decide which
/// reversal steps apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Init,
    CapabilitiesCached,
    ResourcesAllocated,
    VmxOn,
    VmcsLoaded,
    VmcsBuilt,
    Launched,
    ExitHandled,
    Torndown,
}

/// The per-run monitor context: capability cache, page set, interrupt state
/// and activation record, exclusively owned for the duration of one run.
struct VmMonitor<H: Hal> {
    caps: Option<VmxCapabilities>,
    pages: Option<VmxPages<H>>,
    /// `Some` while local interrupts are masked on our account.
    irq_flags: Option<u64>,
    /// `Some` between `VmxActivation::begin` and teardown; undefined meaning
    /// outside that window.
    activation: Option<VmxActivation>,
    stage: Stage,
}

impl<H: Hal> VmMonitor<H> {
    fn new() -> Self {
        Self {
            caps: None,
            pages: None,
            irq_flags: None,
            activation: None,
            stage: Stage::Init,
        }
    }

    fn caps(&self) -> &VmxCapabilities {
        self.caps.as_ref().expect("capabilities not cached")
    }

    fn pages(&self) -> &VmxPages<H> {
        self.pages.as_ref().expect("pages not acquired")
    }

    /// The forward sequence. Any error falls back to [`VmMonitor::teardown`],
    /// which undoes exactly the stages that were reached.
    fn advance(&mut self) -> Result {
        self.cache_capabilities()?;
        self.acquire_pages()?;
        self.activate()?;
        self.load_vmcs()?;
        self.build_vmcs()?;
        self.launch()
    }

    fn cache_capabilities(&mut self) -> Result {
        self.caps = Some(VmxCapabilities::read()?);
        self.stage = Stage::CapabilitiesCached;
        Ok(())
    }

    fn acquire_pages(&mut self) -> Result {
        self.pages = Some(VmxPages::alloc(self.caps().revision_id())?);
        self.stage = Stage::ResourcesAllocated;
        Ok(())
    }

    /// Mask interrupts and enter VMX root operation. From here to the end of
    /// teardown the sequence must stay on this logical processor.
    fn activate(&mut self) -> Result {
        self.irq_flags = Some(H::irq_save());
        let mut activation = VmxActivation::begin()?;
        let result = activation.turn_on(&self.pages().vmxon_region);
        // Keep the record even on a hard VMXON failure: CR4 is already
        // modified and teardown owns its restoration.
        self.activation = Some(activation);
        result?;
        self.stage = Stage::VmxOn;
        Ok(())
    }

    fn load_vmcs(&mut self) -> Result {
        use x86::vmx::VmFail;
        let paddr = self.pages().vmcs.phys_addr() as u64;
        let as_load_err = |err| {
            VmxError::PointerLoadFailure(match err {
                VmFail::VmFailValid => String::from(vmcs::instruction_error().as_str()),
                VmFail::VmFailInvalid => String::from("invalid VMCS pointer"),
            })
        };
        // VMCLEAR first: VMLAUNCH demands a VMCS in the clear state.
        unsafe { vmx::vmclear(paddr) }.map_err(as_load_err)?;
        unsafe { vmx::vmptrld(paddr) }.map_err(as_load_err)?;
        self.stage = Stage::VmcsLoaded;
        Ok(())
    }

    /// Populate every mandatory VMCS field. Pure field writing: a failure
    /// here is a logic error, not a recoverable run condition.
    fn build_vmcs(&mut self) -> Result {
        self.setup_vmcs_guest()?;
        self.setup_vmcs_host()?;
        self.setup_vmcs_control()?;
        self.write_entry_points()?;
        self.stage = Stage::VmcsBuilt;
        Ok(())
    }

    /// Guest state is a faithful copy of the current host state, so the
    /// guest executes in the same flat 64-bit context it was entered from.
    fn setup_vmcs_guest(&self) -> Result {
        VmcsGuestNW::CR0.write(Cr0::read_raw() as usize)?;
        VmcsGuestNW::CR3.write(Cr3::read_raw().0.start_address().as_u64() as usize)?;
        VmcsGuestNW::CR4.write(Cr4::read_raw() as usize)?;

        macro_rules! mirror_guest_segment {
            ($seg: ident, $selector: expr, $base: expr) => {{
                paste::paste! {
                    let selector: SegmentSelector = $selector;
                    VmcsGuest16::[<$seg _SELECTOR>].write(selector.bits())?;
                    VmcsGuestNW::[<$seg _BASE>].write($base as usize)?;
                    if selector.bits() >> 2 == 0 {
                        // null selector: no descriptor to query
                        VmcsGuest32::[<$seg _LIMIT>].write(0)?;
                        VmcsGuest32::[<$seg _ACCESS_RIGHTS>]
                            .write(SegmentAccessRights::unusable().bits())?;
                    } else {
                        VmcsGuest32::[<$seg _LIMIT>].write(instructions::lsl(selector))?;
                        VmcsGuest32::[<$seg _ACCESS_RIGHTS>]
                            .write(SegmentAccessRights::from_lar(instructions::lar(selector)).bits())?;
                    }
                }
            }};
        }

        let (gdtp, idtp) = read_descriptor_tables();
        let tr = unsafe { x86::task::tr() };
        let ldtr = instructions::sldt();

        mirror_guest_segment!(ES, x86::segmentation::es(), 0u64);
        mirror_guest_segment!(CS, x86::segmentation::cs(), 0u64);
        mirror_guest_segment!(SS, x86::segmentation::ss(), 0u64);
        mirror_guest_segment!(DS, x86::segmentation::ds(), 0u64);
        mirror_guest_segment!(FS, x86::segmentation::fs(), Msr::IA32_FS_BASE.read());
        mirror_guest_segment!(GS, x86::segmentation::gs(), Msr::IA32_GS_BASE.read());
        mirror_guest_segment!(LDTR, ldtr, descriptor_table_base(ldtr, &gdtp));
        mirror_guest_segment!(TR, tr, descriptor_table_base(tr, &gdtp));

        VmcsGuestNW::GDTR_BASE.write(canonical_address(gdtp.base as u64) as usize)?;
        VmcsGuest32::GDTR_LIMIT.write(gdtp.limit as u32)?;
        VmcsGuestNW::IDTR_BASE.write(canonical_address(idtp.base as u64) as usize)?;
        VmcsGuest32::IDTR_LIMIT.write(idtp.limit as u32)?;

        VmcsGuestNW::RSP.write(instructions::read_rsp() as usize)?;
        VmcsGuestNW::RFLAGS.write(x86_64::registers::rflags::read_raw() as usize)?;

        VmcsGuest32::IA32_SYSENTER_CS.write(Msr::IA32_SYSENTER_CS.read() as u32)?;
        VmcsGuestNW::IA32_SYSENTER_ESP.write(Msr::IA32_SYSENTER_ESP.read() as usize)?;
        VmcsGuestNW::IA32_SYSENTER_EIP.write(Msr::IA32_SYSENTER_EIP.read() as usize)?;

        VmcsGuestNW::DR7.write(0x400)?;
        VmcsGuest64::IA32_DEBUGCTL.write(0)?;
        VmcsGuest32::ACTIVITY_STATE.write(0)?;
        VmcsGuest32::INTERRUPTIBILITY_STATE.write(0)?;
        VmcsGuestNW::PENDING_DBG_EXCEPTIONS.write(0)?;

        VmcsGuest64::LINK_PTR.write(u64::MAX)?; // SDM Vol. 3C, Section 24.4.2
        Ok(())
    }

    /// Host state receives the same live values, so the VM-exit returns to a
    /// context addressable by the same segment and table setup.
    fn setup_vmcs_host(&self) -> Result {
        VmcsHostNW::CR0.write(Cr0::read_raw() as usize)?;
        VmcsHostNW::CR3.write(Cr3::read_raw().0.start_address().as_u64() as usize)?;
        VmcsHostNW::CR4.write(Cr4::read_raw() as usize)?;

        VmcsHost16::ES_SELECTOR.write(x86::segmentation::es().bits())?;
        VmcsHost16::CS_SELECTOR.write(x86::segmentation::cs().bits())?;
        VmcsHost16::SS_SELECTOR.write(x86::segmentation::ss().bits())?;
        VmcsHost16::DS_SELECTOR.write(x86::segmentation::ds().bits())?;
        VmcsHost16::FS_SELECTOR.write(x86::segmentation::fs().bits())?;
        VmcsHost16::GS_SELECTOR.write(x86::segmentation::gs().bits())?;
        VmcsHostNW::FS_BASE.write(Msr::IA32_FS_BASE.read() as usize)?;
        VmcsHostNW::GS_BASE.write(Msr::IA32_GS_BASE.read() as usize)?;

        let (gdtp, idtp) = read_descriptor_tables();
        let tr = unsafe { x86::task::tr() };
        VmcsHost16::TR_SELECTOR.write(tr.bits())?;
        VmcsHostNW::TR_BASE.write(descriptor_table_base(tr, &gdtp) as usize)?;
        VmcsHostNW::GDTR_BASE.write(canonical_address(gdtp.base as u64) as usize)?;
        VmcsHostNW::IDTR_BASE.write(canonical_address(idtp.base as u64) as usize)?;

        VmcsHost32::IA32_SYSENTER_CS.write(Msr::IA32_SYSENTER_CS.read() as u32)?;
        VmcsHostNW::IA32_SYSENTER_ESP.write(Msr::IA32_SYSENTER_ESP.read() as usize)?;
        VmcsHostNW::IA32_SYSENTER_EIP.write(Msr::IA32_SYSENTER_EIP.read() as usize)?;

        // Host RSP is written by the entry stub immediately before VMLAUNCH;
        // host RIP by `write_entry_points`.
        Ok(())
    }

    /// Control fields come from the cached capability pairs: every bit the
    /// hardware mandates, none it disallows. The measurement itself needs no
    /// optional control except 64-bit host/guest address-space handling.
    fn setup_vmcs_control(&self) -> Result {
        use super::vmcs::controls::{EntryControls, ExitControls};
        let caps = self.caps();

        vmcs::set_control(VmcsControl32::PINBASED_EXEC_CONTROLS, caps.pinbased, 0)?;
        vmcs::set_control(
            VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
            caps.procbased,
            0,
        )?;
        // The host runs 64-bit; entering and leaving anything else is not
        // representable here.
        vmcs::set_control(
            VmcsControl32::VMEXIT_CONTROLS,
            caps.exit,
            ExitControls::HOST_ADDRESS_SPACE_SIZE.bits(),
        )?;
        vmcs::set_control(
            VmcsControl32::VMENTRY_CONTROLS,
            caps.entry,
            EntryControls::IA32E_MODE_GUEST.bits(),
        )?;

        // Trap every exception while measuring.
        VmcsControl32::EXCEPTION_BITMAP.write(u32::MAX)?;

        // No guest MSR switching, no CR3-target optimization.
        VmcsControl32::VMEXIT_MSR_STORE_COUNT.write(0)?;
        VmcsControl32::VMEXIT_MSR_LOAD_COUNT.write(0)?;
        VmcsControl32::VMENTRY_MSR_LOAD_COUNT.write(0)?;
        VmcsControl32::CR3_TARGET_COUNT.write(0)?;

        let pages = self.pages();
        let (bitmap_a, bitmap_b) = pages.io_bitmap.phys_addr();
        VmcsControl64::IO_BITMAP_A_ADDR.write(bitmap_a as u64)?;
        VmcsControl64::IO_BITMAP_B_ADDR.write(bitmap_b as u64)?;
        VmcsControl64::MSR_BITMAPS_ADDR.write(pages.msr_bitmap.phys_addr() as u64)?;
        Ok(())
    }

    /// Host-RIP is where the processor resumes on any VM-exit; guest-RIP is
    /// where execution begins after VM-entry. Both are fixed addresses
    /// computed once.
    fn write_entry_points(&self) -> Result {
        VmcsHostNW::RIP.write(instructions::vmlat_exit_landing as usize)?;
        VmcsGuestNW::RIP.write(instructions::vmlat_guest_entry as usize)?;
        Ok(())
    }

    /// VMLAUNCH, trap, and report. The guest's first instruction is
    /// unconditionally intercepted, so a VM-exit is guaranteed by
    /// construction and no timeout applies.
    fn launch(&mut self) -> Result {
        let start = instructions::rdtsc();
        let flags = unsafe { instructions::vmlat_entry_round_trip() };
        let end = instructions::rdtsc();

        if flags != 0 {
            return Err(VmxError::LaunchFailure(vmcs::instruction_error()));
        }
        self.stage = Stage::Launched;

        match VmxExitReason::try_from(vmcs::raw_exit_reason()?) {
            Ok(reason) => info!("VM-exit: {:?}", reason),
            Err(raw) => warn!("VM-exit: unrecognized reason {:#x}", raw),
        }
        self.stage = Stage::ExitHandled;

        info!(
            "VM-entry/VM-exit round trip: {} cycles",
            end.wrapping_sub(start)
        );
        Ok(())
    }

    /// The single unwinding routine, executed on every path out of a run.
    ///
    /// Strict reverse order, each step gated on whether its forward step was
    /// reached: VMCLEAR, VMXOFF with CR4 restoration, interrupt re-enable,
    /// page release. Failures here are logged and never escalated so the
    /// remaining steps always run.
    fn teardown(&mut self) {
        if self.stage >= Stage::VmcsLoaded {
            if let Some(pages) = self.pages.as_ref() {
                if unsafe { vmx::vmclear(pages.vmcs.phys_addr() as u64) }.is_err() {
                    warn!("VMCLEAR failed during teardown");
                }
            }
        }
        if let Some(activation) = self.activation.take() {
            activation.turn_off();
        }
        if let Some(flags) = self.irq_flags.take() {
            H::irq_restore(flags);
        }
        if let Some(pages) = self.pages.take() {
            drop(pages);
        }
        self.stage = Stage::Torndown;
    }
}

fn read_descriptor_tables() -> (DescriptorTablePointer<u64>, DescriptorTablePointer<u64>) {
    let mut gdtp = DescriptorTablePointer::<u64>::default();
    let mut idtp = DescriptorTablePointer::<u64>::default();
    unsafe {
        dtables::sgdt(&mut gdtp);
        dtables::sidt(&mut idtp);
    }
    (gdtp, idtp)
}

/// Base address of the system descriptor `selector` refers to in the GDT
/// (TSS and LDT descriptors span two table words in 64-bit mode).
fn descriptor_table_base(selector: SegmentSelector, gdt: &DescriptorTablePointer<u64>) -> u64 {
    let index = selector.index() as usize;
    let table_len = (gdt.limit as usize + 1) / core::mem::size_of::<u64>();
    if index + 1 >= table_len {
        return 0;
    }
    let table = unsafe { core::slice::from_raw_parts(gdt.base, table_len) };
    system_descriptor_base(table[index], table[index + 1])
}

/// Execute one measurement run on the current logical processor.
///
/// All outcomes are reported through the diagnostic log; the processor is
/// left in its pre-call VMX/CR4/interrupt state on every exit path. The
/// caller must keep the thread pinned to one logical processor for the whole
/// call and must not run concurrent measurements on it.
pub fn run_latency_measurement<H: Hal>() {
    if !super::is_vmx_usable() {
        return;
    }

    let mut monitor = VmMonitor::<H>::new();
    if let Err(err) = monitor.advance() {
        error!("measurement aborted at {:?}: {}", monitor.stage, err);
    }
    monitor.teardown();
}
