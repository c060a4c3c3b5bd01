//! VMX data structures: capability registers and the physical pages the
//! hardware consumes.

use bit_field::BitField;
use bitflags::bitflags;

use crate::frame::PhysFrame;
use crate::msr::Msr;
use crate::{Hal, HostPhysAddr, Result, VmxError};

/// The IA32_FEATURE_CONTROL MSR. (SDM Vol. 3C, Section 23.7)
pub struct FeatureControl;

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
        /// Lock bit: when set, further writes to this MSR fault.
        const LOCKED = 1 << 0;
        /// Enable VMX inside SMX operation.
        const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
        /// Enable VMX outside SMX operation.
        const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
    }
}

impl FeatureControl {
    /// Read the MSR.
    pub fn read() -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(Msr::IA32_FEATURE_CONTROL.read())
    }
}

/// The IA32_VMX_BASIC MSR. (SDM Vol. 3D, Appendix A.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxBasic {
    /// The 31-bit VMCS revision identifier used by the processor.
    pub revision_id: u32,
    /// The number of bytes that software should allocate for the VMXON
    /// region and any VMCS region.
    pub region_size: u16,
    /// The width of the physical addresses that may be used for the VMXON
    /// region, each VMCS, and data structures referenced by pointers in a
    /// VMCS (true for 32 bits).
    pub is_32bit_address: bool,
    /// The memory type that should be used for the VMCS, for data structures
    /// referenced by pointers in the VMCS.
    pub mem_type: u8,
    /// The processor reports information in the VM-exit
    /// instruction-information field on VM exits due to execution of the INS
    /// and OUTS instructions.
    pub io_exit_info: bool,
    /// Any VMX controls that default to 1 may be cleared to 0; the "true"
    /// capability MSRs exist and are authoritative.
    pub has_true_ctls: bool,
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    /// Read the MSR.
    pub fn read() -> Self {
        Self::from_raw(Msr::IA32_VMX_BASIC.read())
    }

    /// Pure decomposition of the raw MSR value.
    pub fn from_raw(msr: u64) -> Self {
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
            io_exit_info: msr.get_bit(54),
            has_true_ctls: msr.get_bit(55),
        }
    }
}

/// A 4 KiB page stamped with the VMCS revision identifier, usable as a VMXON
/// region or a VMCS.
#[derive(Debug)]
pub struct VmxRegion<H: Hal> {
    frame: PhysFrame<H>,
}

impl<H: Hal> VmxRegion<H> {
    pub fn new(revision_id: u32, shadow_indicator: bool) -> Result<Self> {
        let frame = PhysFrame::alloc_zero()?;
        unsafe {
            // Bits 30:0 hold the revision identifier; bit 31 marks a shadow
            // VMCS. (SDM Vol. 3C, Section 24.2)
            (frame.as_mut_ptr() as *mut u32)
                .write_volatile((revision_id & 0x7fff_ffff) | (shadow_indicator as u32) << 31);
        }
        Ok(Self { frame })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }
}

/// The pair of I/O bitmap pages: A covers ports 0x0-0x7fff, B covers
/// 0x8000-0xffff. Zero-filled, so no port access is intercepted through them.
///
/// B is declared first so drops release the later-acquired page first.
#[derive(Debug)]
pub struct IOBitmap<H: Hal> {
    io_bitmap_b: PhysFrame<H>,
    io_bitmap_a: PhysFrame<H>,
}

impl<H: Hal> IOBitmap<H> {
    pub fn passthrough_all() -> Result<Self> {
        let io_bitmap_a = PhysFrame::alloc_zero()?;
        let io_bitmap_b = PhysFrame::alloc_zero().map_err(|err| bump_acquired(err, 1))?;
        Ok(Self {
            io_bitmap_b,
            io_bitmap_a,
        })
    }

    pub fn phys_addr(&self) -> (HostPhysAddr, HostPhysAddr) {
        (
            self.io_bitmap_a.start_paddr(),
            self.io_bitmap_b.start_paddr(),
        )
    }
}

/// The MSR bitmap page. Zero-filled, so no MSR access is intercepted.
#[derive(Debug)]
pub struct MsrBitmap<H: Hal> {
    frame: PhysFrame<H>,
}

impl<H: Hal> MsrBitmap<H> {
    pub fn passthrough_all() -> Result<Self> {
        Ok(Self {
            frame: PhysFrame::alloc_zero()?,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }
}

fn bump_acquired(err: VmxError, base: usize) -> VmxError {
    match err {
        VmxError::ResourceExhaustion { acquired } => VmxError::ResourceExhaustion {
            acquired: base + acquired,
        },
        other => other,
    }
}

/// The five physical pages one measurement run consumes, acquired as an
/// all-or-nothing set.
///
/// Fields are declared in reverse acquisition order: struct drops run
/// top-down, so teardown releases the most recently acquired page first.
#[derive(Debug)]
pub struct VmxPages<H: Hal> {
    pub msr_bitmap: MsrBitmap<H>,
    pub io_bitmap: IOBitmap<H>,
    pub vmcs: VmxRegion<H>,
    pub vmxon_region: VmxRegion<H>,
}

impl<H: Hal> VmxPages<H> {
    /// Acquire the set in fixed order: VMXON region, VMCS, I/O bitmap A,
    /// I/O bitmap B, MSR bitmap.
    ///
    /// Stops at the first allocation failure; pages acquired up to that point
    /// are released (newest first) by drop unwinding, and the error reports
    /// how many there were.
    pub fn alloc(revision_id: u32) -> Result<Self> {
        let vmxon_region =
            VmxRegion::new(revision_id, false).map_err(|err| bump_acquired(err, 0))?;
        let vmcs = VmxRegion::new(revision_id, false).map_err(|err| bump_acquired(err, 1))?;
        let io_bitmap = IOBitmap::passthrough_all().map_err(|err| bump_acquired(err, 2))?;
        let msr_bitmap = MsrBitmap::passthrough_all().map_err(|err| bump_acquired(err, 4))?;
        Ok(Self {
            msr_bitmap,
            io_bitmap,
            vmcs,
            vmxon_region,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockHal;

    #[test]
    fn test_vmx_basic_decomposition() {
        let basic = VmxBasic::from_raw(0x00da_1000_0000_0004);
        assert_eq!(basic.revision_id, 4);
        assert_eq!(basic.region_size, 0x1000);
        assert!(!basic.is_32bit_address);
        assert_eq!(basic.mem_type, VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK);
        assert!(basic.io_exit_info);
        assert!(basic.has_true_ctls);
    }

    #[test]
    fn test_vmx_basic_revision_id_is_31_bits() {
        let basic = VmxBasic::from_raw(u64::MAX);
        assert_eq!(basic.revision_id, 0x7fff_ffff);
    }

    #[test]
    fn test_feature_control_flags() {
        let locked_and_enabled = FeatureControlFlags::from_bits_truncate(0b101);
        assert!(locked_and_enabled.contains(FeatureControlFlags::LOCKED));
        assert!(locked_and_enabled.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX));

        let unlocked = FeatureControlFlags::from_bits_truncate(0b100);
        assert!(!unlocked.contains(FeatureControlFlags::LOCKED));
    }

    #[test]
    fn test_vmx_region_is_revision_stamped() {
        let _g = crate::test_utils::serialize();
        MockHal::reset();
        let region = VmxRegion::<MockHal>::new(0x12, false).unwrap();
        let header =
            unsafe { (MockHal::phys_to_virt(region.phys_addr()) as *const u32).read_volatile() };
        assert_eq!(header, 0x12);
    }

    #[test]
    fn test_vmx_region_shadow_indicator() {
        let _g = crate::test_utils::serialize();
        MockHal::reset();
        let region = VmxRegion::<MockHal>::new(0x12, true).unwrap();
        let header =
            unsafe { (MockHal::phys_to_virt(region.phys_addr()) as *const u32).read_volatile() };
        assert_eq!(header, 0x12 | 1 << 31);
    }

    #[test]
    fn test_pages_acquire_all_five() {
        let _g = crate::test_utils::serialize();
        MockHal::reset();
        let pages = VmxPages::<MockHal>::alloc(1).unwrap();
        assert_eq!(MockHal::alloc_count(), 5);
        drop(pages);
        assert_eq!(MockHal::dealloc_count(), 5);
    }

    #[test]
    fn test_pages_partial_failure_on_third_page() {
        let _g = crate::test_utils::serialize();
        MockHal::reset();
        MockHal::fail_after(2);
        let err = VmxPages::<MockHal>::alloc(1).unwrap_err();
        assert_eq!(err, VmxError::ResourceExhaustion { acquired: 2 });
        // exactly the two acquired pages come back, and interrupts were
        // never touched
        assert_eq!(MockHal::dealloc_count(), 2);
        assert_eq!(MockHal::irq_save_count(), 0);
    }

    #[test]
    fn test_pages_partial_failure_on_fourth_page() {
        let _g = crate::test_utils::serialize();
        MockHal::reset();
        MockHal::fail_after(3);
        let err = VmxPages::<MockHal>::alloc(1).unwrap_err();
        assert_eq!(err, VmxError::ResourceExhaustion { acquired: 3 });
        assert_eq!(MockHal::dealloc_count(), 3);
    }

    #[test]
    fn test_pages_failure_on_first_page_releases_nothing() {
        let _g = crate::test_utils::serialize();
        MockHal::reset();
        MockHal::fail_after(0);
        let err = VmxPages::<MockHal>::alloc(1).unwrap_err();
        assert_eq!(err, VmxError::ResourceExhaustion { acquired: 0 });
        assert_eq!(MockHal::dealloc_count(), 0);
    }
}
