// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC

//! Level-typed shadow table entries.
//!
//! A shadow entry has the same wire format at every level, but mixing
//! levels up is always a bug, so the level is part of the type. The
//! accessors are pure functions over the raw 64-bit value; semantic
//! legality (not also matching a sentinel encoding) is the caller's
//! responsibility.

use crate::address::PhysAddr;
use crate::types::{Mfn, PADDR_MASK, PAGE_MASK, PAGE_SHIFT};
use bitflags::bitflags;

/// Bits of an entry that hold the mapped frame's address.
pub const ADDR_MASK: u64 = PADDR_MASK & PAGE_MASK;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT   = 1 << 0;
        const WRITABLE  = 1 << 1;
        const USER      = 1 << 2;
        const PWT       = 1 << 3;
        const PCD       = 1 << 4;
        const ACCESSED  = 1 << 5;
        const DIRTY     = 1 << 6;
        const HUGE      = 1 << 7;
        const GLOBAL    = 1 << 8;
        const NX        = 1 << 63;
    }
}

/// One shadow pagetable entry at level `L` (1..=4).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct ShadowPte<const L: usize>(u64);

pub type ShadowL1e = ShadowPte<1>;
pub type ShadowL2e = ShadowPte<2>;
pub type ShadowL3e = ShadowPte<3>;
pub type ShadowL4e = ShadowPte<4>;

impl<const L: usize> ShadowPte<L> {
    /// The cleared entry: maps nothing, carries no flags.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Build an entry mapping `mfn` with the given flags. Never fails;
    /// frame bits beyond the physical address field are discarded.
    #[inline]
    pub fn from_mfn(mfn: Mfn, flags: PteFlags) -> Self {
        const { assert!(L >= 1 && L <= 4) }
        Self(((mfn.bits() << PAGE_SHIFT) & ADDR_MASK) | flags.bits())
    }

    #[inline]
    pub fn paddr(self) -> PhysAddr {
        PhysAddr::from(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn mfn(self) -> Mfn {
        Mfn::new((self.0 & ADDR_MASK) >> PAGE_SHIFT)
    }

    #[inline]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// A new entry with exactly the bits of `flags` cleared; the frame
    /// field is untouched.
    #[inline]
    pub fn remove_flags(self, flags: PteFlags) -> Self {
        Self(self.0 & !flags.bits())
    }

    /// A new entry with exactly the bits of `flags` toggled; the frame
    /// field is untouched.
    #[inline]
    pub fn flip_flags(self, flags: PteFlags) -> Self {
        Self(self.0 ^ flags.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mfn_flags_round_trip() {
        let flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::ACCESSED;
        let e = ShadowL1e::from_mfn(Mfn::new(0xabcde), flags);
        assert_eq!(e.mfn(), Mfn::new(0xabcde));
        assert_eq!(e.flags(), flags);
        assert_eq!(u64::from(e.paddr()), 0xabcde << PAGE_SHIFT);

        let top = ShadowL4e::from_mfn(Mfn::new(0xf_ffff_ffff), PteFlags::PRESENT | PteFlags::NX);
        assert_eq!(top.mfn(), Mfn::new(0xf_ffff_ffff));
        assert_eq!(top.flags(), PteFlags::PRESENT | PteFlags::NX);
    }

    #[test]
    fn empty_is_not_present() {
        assert!(!ShadowL1e::empty().present());
        assert_eq!(ShadowL1e::empty().raw(), 0);
    }

    #[test]
    fn remove_flags_clears_requested_bits() {
        let e = ShadowL2e::from_mfn(
            Mfn::new(0x1000),
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
        );
        let stripped = e.remove_flags(PteFlags::WRITABLE | PteFlags::DIRTY);
        assert!(!stripped.flags().intersects(PteFlags::WRITABLE | PteFlags::DIRTY));
        assert_eq!(stripped.mfn(), e.mfn());
        assert!(stripped.flags().contains(PteFlags::PRESENT | PteFlags::USER));
    }

    #[test]
    fn flip_flags_twice_is_identity() {
        let e = ShadowL1e::from_mfn(Mfn::new(0x42), PteFlags::PRESENT | PteFlags::USER);
        let flip = PteFlags::WRITABLE | PteFlags::USER;
        assert_eq!(e.flip_flags(flip).flip_flags(flip), e);
        assert_eq!(e.flip_flags(flip).mfn(), e.mfn());
    }

    #[test]
    fn frame_bits_beyond_paddr_field_discarded() {
        let e = ShadowL1e::from_mfn(Mfn::new(!0u64), PteFlags::PRESENT);
        assert_eq!(e.raw() & !ADDR_MASK & !1, 0);
    }
}
