//! Identity token layout shared by the descriptor allocator and every
//! lock-free stack in this workspace.
//!
//! A descriptor's `user_data` word is its pointer ORed with a rolling
//! integrity tag plus optional user option bits, all packed below the
//! descriptor alignment boundary — mirroring the original's
//! `ADD_ABA_TAG`/`REMOVE_ABA_TAG` macros and `RING_DESC_ALIGNMENT`.

/// Every descriptor and every ABA-tagged stack node is aligned to this
/// boundary so its low bits are free for tag/option packing.
pub const DESCRIPTOR_ALIGNMENT: usize = 512;

/// Low bits reserved for the rolling integrity tag (6 bits, matching
/// `RING_DESC_INTEGRITY_MASK`).
pub const INTEGRITY_MASK: u64 = 0x3f;

/// Remaining low bits below the alignment boundary, available for
/// user-visible option flags.
pub const OPTION_MASK: u64 = (DESCRIPTOR_ALIGNMENT as u64 - 1) ^ INTEGRITY_MASK;

/// Completion should not invoke the callback at all (cancel-and-forget).
pub const OPTION_IGNORE: u64 = (DESCRIPTOR_ALIGNMENT >> 1) as u64;
/// First user-defined option bit.
pub const OPTION_USER1: u64 = (DESCRIPTOR_ALIGNMENT >> 2) as u64;
/// Second user-defined option bit.
pub const OPTION_USER2: u64 = (DESCRIPTOR_ALIGNMENT >> 3) as u64;

const ADDRESS_MASK: u64 = !(DESCRIPTOR_ALIGNMENT as u64 - 1);

/// A descriptor pointer packed with its integrity tag and option bits.
///
/// Passed to the kernel as `user_data` and re-derived from each CQE to
/// validate that the completion belongs to the descriptor's current
/// generation before the callback is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct IdentityToken(u64);

impl IdentityToken {
    pub const NONE: Self = Self(0);

    /// Pack a descriptor address with an integrity tag and option bits.
    ///
    /// `address` must be aligned to [`DESCRIPTOR_ALIGNMENT`].
    pub fn new(address: usize, tag: u8, options: u64) -> Self {
        debug_assert_eq!(address & (DESCRIPTOR_ALIGNMENT - 1), 0, "descriptor address must be {}-byte aligned", DESCRIPTOR_ALIGNMENT);
        let tag = tag as u64 & INTEGRITY_MASK;
        let options = options & OPTION_MASK;
        Self(address as u64 | tag | options)
    }

    #[inline]
    pub fn address(self) -> usize {
        (self.0 & ADDRESS_MASK) as usize
    }

    #[inline]
    pub fn tag(self) -> u8 {
        (self.0 & INTEGRITY_MASK) as u8
    }

    #[inline]
    pub fn options(self) -> u64 {
        self.0 & OPTION_MASK
    }

    #[inline]
    pub fn has_option(self, bit: u64) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Next tag in the rolling sequence, wrapping within the 6-bit mask.
    #[inline]
    pub fn next_tag(tag: u8) -> u8 {
        ((tag as u64 + 1) & INTEGRITY_MASK) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_and_unpack_roundtrip() {
        let addr = 0x7f0000001000usize; // already 512-aligned for the test
        let token = IdentityToken::new(addr, 0x2a, OPTION_USER1);
        assert_eq!(token.address(), addr);
        assert_eq!(token.tag(), 0x2a);
        assert!(token.has_option(OPTION_USER1));
        assert!(!token.has_option(OPTION_USER2));
    }

    #[test]
    fn tag_wraps_at_six_bits() {
        assert_eq!(IdentityToken::next_tag(0x3f), 0);
        assert_eq!(IdentityToken::next_tag(0x3e), 0x3f);
    }

    #[test]
    fn option_and_integrity_masks_do_not_overlap() {
        assert_eq!(INTEGRITY_MASK & OPTION_MASK, 0);
        assert_eq!(INTEGRITY_MASK | OPTION_MASK, DESCRIPTOR_ALIGNMENT as u64 - 1);
    }
}
