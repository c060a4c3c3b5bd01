//! Segment access rights and the pure descriptor-byte math behind the VMCS
//! state mirroring.

use bit_field::BitField;
use bitflags::bitflags;

bitflags! {
    /// Segment access rights in the VMCS layout. (SDM Vol. 3C, Table 24-2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentAccessRights: u32 {
        /// Accessed flag (type bit 0).
        const ACCESSED = 1 << 0;
        /// Readable (code) / writable (data) flag (type bit 1).
        const WRITABLE = 1 << 1;
        /// Conforming (code) / expand-down (data) flag (type bit 2).
        const CONFORMING = 1 << 2;
        /// Executable flag (type bit 3).
        const EXECUTABLE = 1 << 3;
        /// Descriptor type (0 = system, 1 = code or data).
        const CODE_DATA = 1 << 4;
        /// Present.
        const PRESENT = 1 << 7;
        /// Available for use by system software.
        const AVL = 1 << 12;
        /// 64-bit code segment.
        const LONG_MODE = 1 << 13;
        /// Default operation size (0 = 16-bit, 1 = 32-bit).
        const DB = 1 << 14;
        /// Granularity.
        const GRANULARITY = 1 << 15;
        /// Segment unusable (VMCS-only; not part of the descriptor).
        const UNUSABLE = 1 << 16;
    }
}

impl SegmentAccessRights {
    /// Converts a raw LAR result into the VMCS access-rights layout.
    ///
    /// LAR returns descriptor bits 32..63 with the attribute bytes in bits
    /// 8..23; the VMCS wants them shifted down with the reserved hole masked
    /// out. DPL (bits 5..7) is carried through even though it has no named
    /// flag here.
    pub fn from_lar(lar: u32) -> Self {
        Self::from_bits_retain((lar >> 8) & 0xf0ff)
    }

    /// Access rights for a selector that cannot be loaded.
    pub const fn unusable() -> Self {
        Self::UNUSABLE
    }
}

/// Sign-extends bit 47 of `addr` into the upper 16 bits.
///
/// Descriptor-table base registers report the low 48 bits; VMCS natural-width
/// address fields must hold the canonical form.
pub const fn canonical_address(addr: u64) -> u64 {
    (((addr << 16) as i64) >> 16) as u64
}

/// Extracts the base address of a 64-bit system descriptor (TSS or LDT) from
/// its two raw GDT words.
///
/// Layout: base bits 23:0 live in descriptor bits 39:16, base bits 31:24 in
/// bits 63:56, and base bits 63:32 in the low half of the following word.
/// Returns 0 for a non-present descriptor.
pub fn system_descriptor_base(low: u64, high: u64) -> u64 {
    if !low.get_bit(47) {
        return 0;
    }
    let base_low = low.get_bits(16..40) | low.get_bits(56..64) << 24;
    base_low | high.get_bits(0..32) << 32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_address_sign_extends_bit_47() {
        assert_eq!(canonical_address(0x0000_8000_0000_0000), 0xffff_8000_0000_0000);
        assert_eq!(canonical_address(0x0000_7fff_ffff_ffff), 0x0000_7fff_ffff_ffff);
        assert_eq!(canonical_address(0), 0);
    }

    #[test]
    fn test_canonical_address_is_idempotent() {
        let addr = canonical_address(0x0000_ffff_8765_4321);
        assert_eq!(canonical_address(addr), addr);
    }

    #[test]
    fn test_system_descriptor_base_spans_both_words() {
        // base = 0xffff_8000_1234_5678, present, type 0x9 (available TSS)
        let low = (0x345678u64 << 16) | (0x12u64 << 56) | (1 << 47) | (0x9 << 40);
        let high = 0xffff_8000u64;
        assert_eq!(system_descriptor_base(low, high), 0xffff_8000_1234_5678);
    }

    #[test]
    fn test_system_descriptor_base_ignores_high_word_garbage() {
        // bits 63:32 of the second word are reserved and must not leak in
        let low = (0xabcdefu64 << 16) | (1 << 47);
        let high = 0xdead_beef_0000_0001u64;
        assert_eq!(system_descriptor_base(low, high), 0x0000_0001_00ab_cdef);
    }

    #[test]
    fn test_system_descriptor_base_non_present_is_zero() {
        let low = 0x345678u64 << 16;
        assert_eq!(system_descriptor_base(low, 0xffff_8000), 0);
    }

    #[test]
    fn test_access_rights_from_lar_64bit_code() {
        // AR byte 0x9b (present, DPL 0, code, exec/read, accessed), L + G set
        let ar = SegmentAccessRights::from_lar(0x00a0_9b00);
        assert_eq!(ar.bits(), 0xa09b);
        assert!(ar.contains(SegmentAccessRights::PRESENT));
        assert!(ar.contains(SegmentAccessRights::LONG_MODE));
        assert!(ar.contains(SegmentAccessRights::GRANULARITY));
        assert!(!ar.contains(SegmentAccessRights::UNUSABLE));
    }

    #[test]
    fn test_access_rights_from_lar_masks_reserved_hole() {
        // limit bits 19:16 sit between the attribute bytes and must vanish
        let ar = SegmentAccessRights::from_lar(0x000f_9300);
        assert_eq!(ar.bits(), 0x0093);
    }

    #[test]
    fn test_unusable_rights_have_only_the_unusable_bit() {
        let ar = SegmentAccessRights::unusable();
        assert_eq!(ar.bits(), 1 << 16);
        assert!(!ar.contains(SegmentAccessRights::PRESENT));
    }
}
