// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC

//! Reserved-bit fast path for the fault handler.
//!
//! Two fault outcomes are frequent enough to special-case: the guest
//! entry is simply not present, or the target is emulated MMIO. Both are
//! recorded directly in the level-1 shadow entry as values with reserved
//! bits set, so the next fault on the same address is recognized at fault
//! entry without taking the paging lock or walking the guest tables.
//!
//! This only works if the processor is guaranteed not to use all
//! physical-address bits: the capability gate checks that reserved bits
//! exist and that we are not running under another hypervisor (which may
//! not deliver reserved-bit faults faithfully). Where the gate fails the
//! constructors degrade to the ordinary empty entry, which is correct but
//! takes the slow path.
//!
//! The MMIO encoding keeps the originating guest frame number in bits
//! 4..35 and the user/writable permission bits from the guest entry; bit
//! 3 is always zero to differentiate it from the not-present value, which
//! is all-ones.

use crate::platform::Platform;
use crate::shadow::entry::{ShadowL1e, ADDR_MASK, PteFlags};
use crate::types::{Gfn, PADDR_BITS};
use bitfield_struct::bitfield;

/// Any entry with all of these bits set cannot have been produced by a
/// legal mapping: the high bits sit inside the physical-address field,
/// beyond what the capability gate allows hardware to use.
const MAGIC_MASK: u64 = 0xffff_fff0_0000_0000 | PteFlags::PRESENT.bits();

const MMIO_MAGIC: u64 = MAGIC_MASK;
const MMIO_MAGIC_BIT: u64 = 1 << 3;
const MMIO_MAGIC_MASK: u64 = MMIO_MAGIC | MMIO_MAGIC_BIT;
const MMIO_GFN_MASK: u64 = !(MMIO_MAGIC_MASK | PteFlags::WRITABLE.bits() | PteFlags::USER.bits());

// The magic pattern must be unreachable through from_mfn, and the tag
// bit must sit above the permission bits it shares the entry with.
const _: () = assert!(MAGIC_MASK & ADDR_MASK != 0);
const _: () = assert!(MMIO_MAGIC_BIT > PteFlags::WRITABLE.bits());
const _: () = assert!(MMIO_MAGIC_BIT > PteFlags::USER.bits());
const _: () = assert!(MMIO_GFN_MASK == 0x0000_000f_ffff_fff0);

#[bitfield(u64)]
struct MmioEntry {
    present: bool,
    writable: bool,
    user: bool,
    /// Set only by the not-present encoding (all-ones); always clear for
    /// MMIO entries.
    not_present_tag: bool,
    #[bits(32)]
    gfn: u64,
    #[bits(28)]
    magic: u64,
}

/// All 28 reserved high bits set, to trigger reserved-bit faults.
const MAGIC_FIELD: u64 = (1 << 28) - 1;

/// Whether this processor leaves physical-address bits unused that we can
/// rely on to fault.
pub fn have_pte_rsvd_bits(platform: &dyn Platform) -> bool {
    platform.paddr_bits() < PADDR_BITS && !platform.has_hypervisor()
}

const fn not_present_raw() -> ShadowL1e {
    ShadowL1e::from_raw(!0u64)
}

/// Encode "guest entry not present". Falls back to the empty entry on
/// processors with no reserved physical-address bits.
pub fn not_present(platform: &dyn Platform) -> ShadowL1e {
    if have_pte_rsvd_bits(platform) {
        not_present_raw()
    } else {
        ShadowL1e::empty()
    }
}

pub fn is_not_present(e: ShadowL1e) -> bool {
    e.raw() == not_present_raw().raw()
}

/// Encode "emulated MMIO at `gfn`", preserving the user/writable bits of
/// the guest entry. Falls back to the empty entry when reserved bits are
/// unavailable, or when the encoded address would be unsafe to leave
/// armed on an L1TF-affected processor.
pub fn mmio(platform: &dyn Platform, gfn: Gfn, gflags: PteFlags) -> ShadowL1e {
    let e = MmioEntry::new()
        .with_present(true)
        .with_writable(gflags.contains(PteFlags::WRITABLE))
        .with_user(gflags.contains(PteFlags::USER))
        .with_gfn(gfn.bits() & 0xffff_ffff)
        .with_magic(MAGIC_FIELD);
    let e = ShadowL1e::from_raw(u64::from(e));

    if !have_pte_rsvd_bits(platform)
        || (platform.has_l1tf_bug() && !platform.l1tf_safe_paddr(e.paddr()))
    {
        return ShadowL1e::empty();
    }

    e
}

pub fn is_mmio(e: ShadowL1e) -> bool {
    (e.raw() & MMIO_MAGIC_MASK) == MMIO_MAGIC
}

/// True for both sentinel encodings, false for every legal mapping. Safe
/// to call on a concurrently updated entry: the whole value is read once.
pub fn is_magic(e: ShadowL1e) -> bool {
    (e.raw() & MAGIC_MASK) == MAGIC_MASK
}

/// The guest frame an MMIO sentinel was built from.
pub fn mmio_gfn(e: ShadowL1e) -> Gfn {
    Gfn::new(MmioEntry::from(e.raw()).gfn())
}

/// The guest permission bits an MMIO sentinel was built from.
pub fn mmio_flags(e: ShadowL1e) -> PteFlags {
    PteFlags::from_bits_truncate(e.raw()) & (PteFlags::WRITABLE | PteFlags::USER)
}
