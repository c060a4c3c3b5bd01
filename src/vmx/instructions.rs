//! Single-instruction wrappers the `x86` crate does not provide, and the
//! assembly stubs around VMLAUNCH.

use core::arch::{asm, global_asm};

use x86::segmentation::SegmentSelector;

/// LAR: load the access rights of `selector`. Raw descriptor layout; invalid
/// selectors set ZF=0 and leave the destination unreliable, so callers must
/// treat null selectors separately.
pub fn lar(selector: SegmentSelector) -> u32 {
    let attrs: u32;
    unsafe {
        asm!("lar {0:e}, {1:e}", out(reg) attrs, in(reg) selector.bits() as u32,
             options(nomem, nostack));
    }
    attrs
}

/// LSL: load the segment limit of `selector`.
pub fn lsl(selector: SegmentSelector) -> u32 {
    let limit: u32;
    unsafe {
        asm!("lsl {0:e}, {1:e}", out(reg) limit, in(reg) selector.bits() as u32,
             options(nomem, nostack));
    }
    limit
}

/// SLDT: the current LDTR selector.
pub fn sldt() -> SegmentSelector {
    let ldtr: u16;
    unsafe {
        asm!("sldt {0:x}", out(reg) ldtr, options(nomem, nostack, preserves_flags));
    }
    SegmentSelector::from_raw(ldtr)
}

/// RDTSC: the time-stamp counter. Not serializing; good enough for a
/// round-trip cycle count.
pub fn rdtsc() -> u64 {
    let hi: u32;
    let lo: u32;
    unsafe {
        asm!("rdtsc", out("edx") hi, out("eax") lo, options(nomem, nostack));
    }
    (hi as u64) << 32 | lo as u64
}

/// The current stack pointer.
pub fn read_rsp() -> u64 {
    let rsp: u64;
    unsafe {
        asm!("mov {}, rsp", out(reg) rsp, options(nomem, preserves_flags));
    }
    rsp
}

unsafe extern "C" {
    /// Performs the single VMLAUNCH round trip.
    ///
    /// Saves the callee-saved registers, records the resulting stack pointer
    /// in the host-RSP VMCS field and executes VMLAUNCH. Returns 0 once the
    /// VM-exit path has landed on [`vmlat_exit_landing`], or the RFLAGS value
    /// left behind by a VMLAUNCH that failed to enter the guest.
    ///
    /// Host-RIP must already point at [`vmlat_exit_landing`] and guest-RIP at
    /// [`vmlat_guest_entry`]; interrupts must be masked and the VMCS current.
    pub fn vmlat_entry_round_trip() -> u64;

    /// The VM-exit landing pad; its address is written to host-RIP.
    pub fn vmlat_exit_landing();

    /// The guest entry point; its address is written to guest-RIP. Executes
    /// exactly one instruction that is unconditionally intercepted.
    pub fn vmlat_guest_entry();
}

global_asm!(
    r#"
.global vmlat_entry_round_trip
.global vmlat_exit_landing
.global vmlat_guest_entry

vmlat_entry_round_trip:
    push    rbx
    push    rbp
    push    r12
    push    r13
    push    r14
    push    r15
    mov     rax, 0x6c14             // host-RSP field encoding
    vmwrite rax, rsp
    vmlaunch
    // VMLAUNCH only falls through on failure; hand RFLAGS to the caller.
    pushfq
    pop     rax
    jmp     2f

vmlat_exit_landing:
    // The VM-exit resumes here with the stack captured above.
    xor     eax, eax
2:
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbp
    pop     rbx
    ret

vmlat_guest_entry:
    cpuid                           // unconditionally intercepted
3:
    hlt
    jmp     3b
"#
);
