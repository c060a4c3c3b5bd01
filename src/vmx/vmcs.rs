//! Typed access to the current VMCS.
//!
//! The field encodings are the closed set defined by the processor
//! architecture (SDM Vol. 3D, Appendix B); each enum below covers one
//! width/class combination and gains `read`/`write` through the macros at
//! the bottom.

#![allow(non_camel_case_types, dead_code)]

use alloc::format;

use x86::bits64::vmx;

use super::as_err;
use super::capabilities::CapabilityPair;
use crate::{Result, VmxError};

pub mod controls {
    pub use x86::vmx::vmcs::control::{
        EntryControls, ExitControls, PinbasedControls, PrimaryControls,
    };
}

macro_rules! vmcs_read {
    ($field_enum: ident, $type: ty) => {
        impl $field_enum {
            pub fn read(self) -> Result<$type> {
                unsafe {
                    vmx::vmread(self as u32)
                        .map(|v| v as $type)
                        .map_err(as_err)
                }
            }
        }
    };
}

macro_rules! vmcs_write {
    ($field_enum: ident, $type: ty) => {
        impl $field_enum {
            pub fn write(self, value: $type) -> Result {
                unsafe { vmx::vmwrite(self as u32, value as u64).map_err(as_err) }
            }
        }
    };
}

/// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuest16 {
    ES_SELECTOR = 0x800,
    CS_SELECTOR = 0x802,
    SS_SELECTOR = 0x804,
    DS_SELECTOR = 0x806,
    FS_SELECTOR = 0x808,
    GS_SELECTOR = 0x80a,
    LDTR_SELECTOR = 0x80c,
    TR_SELECTOR = 0x80e,
}
vmcs_read!(VmcsGuest16, u16);
vmcs_write!(VmcsGuest16, u16);

/// 16-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.1.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHost16 {
    ES_SELECTOR = 0xc00,
    CS_SELECTOR = 0xc02,
    SS_SELECTOR = 0xc04,
    DS_SELECTOR = 0xc06,
    FS_SELECTOR = 0xc08,
    GS_SELECTOR = 0xc0a,
    TR_SELECTOR = 0xc0c,
}
vmcs_read!(VmcsHost16, u16);
vmcs_write!(VmcsHost16, u16);

/// 64-Bit Control Fields. (SDM Vol. 3D, Appendix B.2.1)
#[derive(Clone, Copy, Debug)]
pub enum VmcsControl64 {
    IO_BITMAP_A_ADDR = 0x2000,
    IO_BITMAP_B_ADDR = 0x2002,
    MSR_BITMAPS_ADDR = 0x2004,
    VMEXIT_MSR_STORE_ADDR = 0x2006,
    VMEXIT_MSR_LOAD_ADDR = 0x2008,
    VMENTRY_MSR_LOAD_ADDR = 0x200a,
    EXECUTIVE_VMCS_PTR = 0x200c,
    TSC_OFFSET = 0x2010,
}
vmcs_read!(VmcsControl64, u64);
vmcs_write!(VmcsControl64, u64);

/// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuest64 {
    LINK_PTR = 0x2800,
    IA32_DEBUGCTL = 0x2802,
    IA32_PAT = 0x2804,
    IA32_EFER = 0x2806,
}
vmcs_read!(VmcsGuest64, u64);
vmcs_write!(VmcsGuest64, u64);

/// 64-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.2.4)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHost64 {
    IA32_PAT = 0x2c00,
    IA32_EFER = 0x2c02,
    IA32_PERF_GLOBAL_CTRL = 0x2c04,
}
vmcs_read!(VmcsHost64, u64);
vmcs_write!(VmcsHost64, u64);

/// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
#[derive(Clone, Copy, Debug)]
pub enum VmcsControl32 {
    PINBASED_EXEC_CONTROLS = 0x4000,
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    PAGE_FAULT_ERR_CODE_MASK = 0x4006,
    PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
    CR3_TARGET_COUNT = 0x400a,
    VMEXIT_CONTROLS = 0x400c,
    VMEXIT_MSR_STORE_COUNT = 0x400e,
    VMEXIT_MSR_LOAD_COUNT = 0x4010,
    VMENTRY_CONTROLS = 0x4012,
    VMENTRY_MSR_LOAD_COUNT = 0x4014,
    VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
    VMENTRY_EXCEPTION_ERR_CODE = 0x4018,
    VMENTRY_INSTRUCTION_LEN = 0x401a,
    TPR_THRESHOLD = 0x401c,
}
vmcs_read!(VmcsControl32, u32);
vmcs_write!(VmcsControl32, u32);

/// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
#[derive(Clone, Copy, Debug)]
pub enum VmcsReadOnly32 {
    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    VMEXIT_INTERRUPTION_INFO = 0x4404,
    VMEXIT_INTERRUPTION_ERR_CODE = 0x4406,
    VMEXIT_INSTRUCTION_LEN = 0x440c,
    VMEXIT_INSTRUCTION_INFO = 0x440e,
}
vmcs_read!(VmcsReadOnly32, u32);

/// 32-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.3.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuest32 {
    ES_LIMIT = 0x4800,
    CS_LIMIT = 0x4802,
    SS_LIMIT = 0x4804,
    DS_LIMIT = 0x4806,
    FS_LIMIT = 0x4808,
    GS_LIMIT = 0x480a,
    LDTR_LIMIT = 0x480c,
    TR_LIMIT = 0x480e,
    GDTR_LIMIT = 0x4810,
    IDTR_LIMIT = 0x4812,
    ES_ACCESS_RIGHTS = 0x4814,
    CS_ACCESS_RIGHTS = 0x4816,
    SS_ACCESS_RIGHTS = 0x4818,
    DS_ACCESS_RIGHTS = 0x481a,
    FS_ACCESS_RIGHTS = 0x481c,
    GS_ACCESS_RIGHTS = 0x481e,
    LDTR_ACCESS_RIGHTS = 0x4820,
    TR_ACCESS_RIGHTS = 0x4822,
    INTERRUPTIBILITY_STATE = 0x4824,
    ACTIVITY_STATE = 0x4826,
    IA32_SYSENTER_CS = 0x482a,
}
vmcs_read!(VmcsGuest32, u32);
vmcs_write!(VmcsGuest32, u32);

/// 32-Bit Host-State Field. (SDM Vol. 3D, Appendix B.3.4)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHost32 {
    IA32_SYSENTER_CS = 0x4c00,
}
vmcs_read!(VmcsHost32, u32);
vmcs_write!(VmcsHost32, u32);

/// Natural-Width Control Fields. (SDM Vol. 3D, Appendix B.4.1)
#[derive(Clone, Copy, Debug)]
pub enum VmcsControlNW {
    CR0_GUEST_HOST_MASK = 0x6000,
    CR4_GUEST_HOST_MASK = 0x6002,
    CR0_READ_SHADOW = 0x6004,
    CR4_READ_SHADOW = 0x6006,
}
vmcs_read!(VmcsControlNW, usize);
vmcs_write!(VmcsControlNW, usize);

/// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
#[derive(Clone, Copy, Debug)]
pub enum VmcsReadOnlyNW {
    EXIT_QUALIFICATION = 0x6400,
    GUEST_LINEAR_ADDR = 0x640a,
}
vmcs_read!(VmcsReadOnlyNW, usize);

/// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuestNW {
    CR0 = 0x6800,
    CR3 = 0x6802,
    CR4 = 0x6804,
    ES_BASE = 0x6806,
    CS_BASE = 0x6808,
    SS_BASE = 0x680a,
    DS_BASE = 0x680c,
    FS_BASE = 0x680e,
    GS_BASE = 0x6810,
    LDTR_BASE = 0x6812,
    TR_BASE = 0x6814,
    GDTR_BASE = 0x6816,
    IDTR_BASE = 0x6818,
    DR7 = 0x681a,
    RSP = 0x681c,
    RIP = 0x681e,
    RFLAGS = 0x6820,
    PENDING_DBG_EXCEPTIONS = 0x6822,
    IA32_SYSENTER_ESP = 0x6824,
    IA32_SYSENTER_EIP = 0x6826,
}
vmcs_read!(VmcsGuestNW, usize);
vmcs_write!(VmcsGuestNW, usize);

/// Natural-Width Host-State Fields. (SDM Vol. 3D, Appendix B.4.4)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHostNW {
    CR0 = 0x6c00,
    CR3 = 0x6c02,
    CR4 = 0x6c04,
    FS_BASE = 0x6c06,
    GS_BASE = 0x6c08,
    TR_BASE = 0x6c0a,
    GDTR_BASE = 0x6c0c,
    IDTR_BASE = 0x6c0e,
    IA32_SYSENTER_ESP = 0x6c10,
    IA32_SYSENTER_EIP = 0x6c12,
    RSP = 0x6c14,
    RIP = 0x6c16,
}
vmcs_read!(VmcsHostNW, usize);
vmcs_write!(VmcsHostNW, usize);

/// A VM-instruction-error number read back from the current VMCS.
/// (SDM Vol. 3C, Section 30.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxInstructionError(u32);

impl VmxInstructionError {
    pub fn number(&self) -> u32 {
        self.0
    }

    pub fn as_str(&self) -> &'static str {
        match self.0 {
            0 => "OK",
            1 => "VMCALL executed in VMX root operation",
            2 => "VMCLEAR with invalid physical address",
            3 => "VMCLEAR with VMXON pointer",
            4 => "VMLAUNCH with non-clear VMCS",
            5 => "VMRESUME with non-launched VMCS",
            6 => "VMRESUME after VMXOFF",
            7 => "VM entry with invalid control field(s)",
            8 => "VM entry with invalid host-state field(s)",
            9 => "VMPTRLD with invalid physical address",
            10 => "VMPTRLD with VMXON pointer",
            11 => "VMPTRLD with incorrect VMCS revision identifier",
            12 => "VMREAD/VMWRITE from/to unsupported VMCS component",
            13 => "VMWRITE to read-only VMCS component",
            15 => "VMXON executed in VMX root operation",
            16 => "VM entry with invalid executive-VMCS pointer",
            17 => "VM entry with non-launched executive VMCS",
            18 => "VM entry with executive-VMCS pointer not VMXON pointer",
            19 => "VMCALL with non-clear VMCS",
            20 => "VMCALL with invalid VM-exit control fields",
            22 => "VMCALL with incorrect MSEG revision identifier",
            23 => "VMXOFF under dual-monitor treatment of SMIs and SMM",
            24 => "VMCALL with invalid SMM-monitor features",
            25 => "VM entry with invalid VM-execution control fields in executive VMCS",
            26 => "VM entry with events blocked by MOV SS",
            28 => "Invalid operand to INVEPT/INVVPID",
            _ => "[INVALID]",
        }
    }
}

impl From<u32> for VmxInstructionError {
    fn from(x: u32) -> Self {
        Self(x)
    }
}

/// The VM-instruction-error of the current VMCS, valid after an instruction
/// failed with VMfailValid. Reads the field directly: this is itself the
/// error path, so a failing VMREAD here degrades to code 0.
pub fn instruction_error() -> VmxInstructionError {
    let code = unsafe { vmx::vmread(VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32) }.unwrap_or(0);
    VmxInstructionError::from(code as u32)
}

/// The basic exit reason of the last VM-exit (low 16 bits of the exit-reason
/// field).
pub fn raw_exit_reason() -> Result<u32> {
    Ok(VmcsReadOnly32::EXIT_REASON.read()? & 0xffff)
}

/// Write a control field derived from its hardware capability pair.
///
/// The value written is the pair's minimal set (every mandatory bit) plus
/// `forced`, the bits the caller cannot run without; a forced bit the
/// hardware disallows is an error, never silently requested.
pub fn set_control(control: VmcsControl32, pair: CapabilityPair, forced: u32) -> Result {
    let disallowed = forced & !pair.allowed1;
    if disallowed != 0 {
        return Err(VmxError::VmInstructionFailed(format!(
            "cannot set bits {:#x} in {:?}",
            disallowed, control
        )));
    }
    control.write(pair.minimal() | forced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_error_table() {
        assert_eq!(VmxInstructionError::from(4).as_str(), "VMLAUNCH with non-clear VMCS");
        assert_eq!(
            VmxInstructionError::from(11).as_str(),
            "VMPTRLD with incorrect VMCS revision identifier"
        );
        assert_eq!(VmxInstructionError::from(14).as_str(), "[INVALID]");
        assert_eq!(VmxInstructionError::from(7).number(), 7);
    }
}
