// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC

//! Shadow entry installation.
//!
//! `shadow_set_l1e..l4e` are the only mutation entry points for shadow
//! tables above the allocation layer. Each replaces one slot with a new
//! value under the domain's paging lock, keeping reference counts and
//! frame typing consistent: a new present entry takes its references
//! before the slot is written, the old entry's references are dropped
//! after, so there is never a moment when a live slot is unaccounted.
//! The slot write itself is a single whole-value atomic store, which is
//! what makes the lock-free sentinel check at fault entry safe.
//!
//! Level 1 accounts against guest-owned pages through the domain's
//! ownership seam, steered by the guest-physical type of the target.
//! Levels 2 and up account against the shadow frames of the next lower
//! level; a frame that currently shadows something else is a type
//! conflict and refuses the install with the slot untouched.

use crate::domain::Domain;
use crate::error::ShadowError;
use crate::p2m::P2mType;
use crate::shadow::fastpath;
use crate::shadow::geometry::entries;
use crate::shadow::pool::{AllocError, FrameTable, ShadowType, FRAME_SLOTS};
use crate::shadow::{PteFlags, ShadowL1e, ShadowL2e, ShadowL3e, ShadowL4e, ShadowPte};
use crate::types::Mfn;
use bitflags::bitflags;

bitflags! {
    /// Outcome of a successful `shadow_set` operation. Empty means the
    /// slot already held the requested value.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ShadowSet: u32 {
        /// The slot value changed.
        const CHANGED = 1 << 0;
        /// TLB state derived from the old mapping must be invalidated
        /// by the caller.
        const FLUSH   = 1 << 1;
    }
}

/// Given the flags of two entries, are the new flags a strict increase
/// in rights over the old ones?
fn perms_strictly_increased(old: PteFlags, new: PteFlags) -> bool {
    const MASK: PteFlags = PteFlags::PRESENT
        .union(PteFlags::WRITABLE)
        .union(PteFlags::USER)
        .union(PteFlags::NX);
    // Flip the NX bit, since it's the only one that decreases rights;
    // so that the same bit figure works for all flags.
    let of = (old & MASK).bits() ^ PteFlags::NX.bits();
    let nf = (new & MASK).bits() ^ PteFlags::NX.bits();
    (of | (of ^ nf)) == nf
}

impl Domain {
    /// Allocate a zeroed shadow frame of the given type from the pool.
    /// Fails under memory pressure instead of blocking; the caller must
    /// fail the guest-visible operation gracefully.
    pub fn shadow_alloc(&self, ty: ShadowType) -> Result<Mfn, ShadowError> {
        let mut table = self.frames.lock();
        let index = table.alloc(ty)?;
        self.arena.page_by_index(index).clear();
        Ok(self.arena.mfn_of(index))
    }

    /// Back out a shadow frame that never got referenced from a parent.
    pub fn shadow_free(&self, smfn: Mfn) -> Result<(), ShadowError> {
        let mut table = self.frames.lock();
        let index = self
            .arena
            .index_of(smfn)
            .ok_or(AllocError::InvalidMfn(smfn))?;
        assert_eq!(table.ref_count(index), 0, "freeing a referenced shadow");
        self.destroy_frame(&mut table, index);
        Ok(())
    }

    /// Take a reference on a shadow frame from outside the tables, e.g.
    /// to pin the top-level shadow loaded into a vcpu's CR3.
    pub fn get_shadow_ref(&self, smfn: Mfn, expected: ShadowType) -> Result<(), ShadowError> {
        let mut table = self.frames.lock();
        let index = self
            .arena
            .index_of(smfn)
            .ok_or(AllocError::InvalidMfn(smfn))?;
        table.get_ref(index, &[expected])
    }

    /// Drop a reference taken with [`Self::get_shadow_ref`]. The frame
    /// is torn down and returned to the pool when this was the last one.
    pub fn put_shadow_ref(&self, smfn: Mfn) {
        let mut table = self.frames.lock();
        self.put_shadow_ref_locked(&mut table, smfn);
    }

    /// Lock-free read of one shadow entry, for the fault-entry fast
    /// path. A racing installer is harmless: the load observes either
    /// the entirely-old or entirely-new value.
    pub fn shadow_read<const L: usize>(&self, smfn: Mfn, index: usize) -> ShadowPte<L> {
        let page = self.arena.page(smfn).expect("entry read outside shadow pool");
        ShadowPte::from_raw(page.read(index))
    }

    /// Install `new` into slot `index` of the level-1 shadow `sl1mfn`.
    /// `new_type` is the guest-physical classification of the mapping
    /// target and decides the ownership accounting.
    ///
    /// On a type conflict or a refused page reference the slot is left
    /// unchanged. Level-1 rewrites never demand a flush: the shadow
    /// points at the same guest frame as the guest's own entry, so the
    /// guest is responsible for triggering one.
    pub fn shadow_set_l1e(
        &self,
        sl1mfn: Mfn,
        index: usize,
        new: ShadowL1e,
        new_type: P2mType,
    ) -> Result<ShadowSet, ShadowError> {
        assert!(index < entries(self.levels, 1));
        let table = self.frames.lock();
        let page = self
            .arena
            .page(sl1mfn)
            .ok_or(AllocError::InvalidMfn(sl1mfn))?;
        debug_assert!(table.shadow_type(self.arena.index_of(sl1mfn).unwrap()).is_leaf());

        let old = ShadowL1e::from_raw(page.read(index));
        if old == new {
            return Ok(ShadowSet::empty());
        }

        let mut new = new;
        if new.present() && !fastpath::is_magic(new) && self.refcounts_enabled() {
            // About to install a new reference.
            let flip = self.get_page_from_l1e(&table, new, new_type)?;
            if !flip.is_empty() {
                new = new.flip_flags(flip);
            }
        }

        page.write(index, new.raw());

        if old.present() && !fastpath::is_magic(old) {
            // We lost a reference to an old mfn.
            self.put_page_from_l1e(old);
        }
        Ok(ShadowSet::CHANGED)
    }

    /// Install `new` into slot `index` of the level-2 shadow `sl2mfn`.
    /// `next_page` locates the further frames of a multi-page level-1
    /// shadow chain; it must be side-effect-free with respect to
    /// reference counts.
    pub fn shadow_set_l2e(
        &self,
        sl2mfn: Mfn,
        index: usize,
        new: ShadowL2e,
        next_page: Option<&dyn Fn(Mfn) -> Mfn>,
    ) -> Result<ShadowSet, ShadowError> {
        self.set_table_entry(sl2mfn, index, new, &[ShadowType::L1, ShadowType::Fl1], next_page)
    }

    /// Install `new` into slot `index` of the level-3 shadow `sl3mfn`.
    pub fn shadow_set_l3e(
        &self,
        sl3mfn: Mfn,
        index: usize,
        new: ShadowL3e,
        next_page: Option<&dyn Fn(Mfn) -> Mfn>,
    ) -> Result<ShadowSet, ShadowError> {
        self.set_table_entry(sl3mfn, index, new, &[ShadowType::L2], next_page)
    }

    /// Install `new` into slot `index` of the level-4 shadow `sl4mfn`.
    pub fn shadow_set_l4e(
        &self,
        sl4mfn: Mfn,
        index: usize,
        new: ShadowL4e,
    ) -> Result<ShadowSet, ShadowError> {
        self.set_table_entry(sl4mfn, index, new, &[ShadowType::L3], None)
    }

    /// Notify the ownership system that a leaf mapping of a guest-owned
    /// page is going away. A no-op for paging modes that do not track
    /// use counts.
    pub fn put_page_from_l1e(&self, e: ShadowL1e) {
        if !self.refcounts_enabled() {
            return;
        }
        self.owner
            .put_page(e.mfn(), e.flags().contains(PteFlags::WRITABLE));
    }

    /// Classify and account a new leaf mapping. Returns flag bits the
    /// installed entry must have flipped (read-only targets lose their
    /// writable bit). Only called with refcounting active.
    fn get_page_from_l1e(
        &self,
        table: &FrameTable,
        e: ShadowL1e,
        new_type: P2mType,
    ) -> Result<PteFlags, ShadowError> {
        let mfn = e.mfn();

        // A frame serving as a shadow table must never be the target of
        // a leaf mapping, whatever the physical map claims it is.
        if let Some(index) = self.arena.index_of(mfn) {
            let ty = table.shadow_type(index);
            if ty != ShadowType::Free {
                log::error!("guest entry targets shadow frame {:#x} ({:?})", mfn, ty);
                return Err(ShadowError::TypeConflict(ty));
            }
        }

        match new_type {
            P2mType::Ram => {
                let writable = e.flags().contains(PteFlags::WRITABLE);
                if self.owner.get_page(mfn, writable) {
                    Ok(PteFlags::empty())
                } else {
                    Err(ShadowError::GetPage)
                }
            }
            P2mType::RamRo => {
                if self.owner.get_page(mfn, false) {
                    Ok(e.flags() & PteFlags::WRITABLE)
                } else {
                    Err(ShadowError::GetPage)
                }
            }
            // Passed-through MMIO is mapped without ownership
            // accounting; the frame is not guest RAM.
            P2mType::MmioDirect => Ok(PteFlags::empty()),
            P2mType::MmioDm | P2mType::Invalid => Err(ShadowError::GetPage),
        }
    }

    /// Shared implementation of the level-2..4 installers: account
    /// against shadow frames of the next lower level.
    fn set_table_entry<const L: usize>(
        &self,
        smfn: Mfn,
        index: usize,
        new: ShadowPte<L>,
        allowed: &[ShadowType],
        next_page: Option<&dyn Fn(Mfn) -> Mfn>,
    ) -> Result<ShadowSet, ShadowError> {
        const { assert!(L >= 2 && L <= 4) }
        assert!(L <= self.levels.count());
        assert!(index < entries(self.levels, L));

        let mut table = self.frames.lock();
        let page = self.arena.page(smfn).ok_or(AllocError::InvalidMfn(smfn))?;

        let old = ShadowPte::<L>::from_raw(page.read(index));
        if old == new {
            return Ok(ShadowSet::empty());
        }

        if new.present() {
            // About to install a new reference.
            let child = new.mfn();
            let child_index = self
                .arena
                .index_of(child)
                .ok_or(AllocError::InvalidMfn(child))?;
            table.get_ref(child_index, allowed)?;

            if let Some(next) = next_page {
                let chained = next(child);
                let result = self
                    .arena
                    .index_of(chained)
                    .ok_or(ShadowError::from(AllocError::InvalidMfn(chained)))
                    .and_then(|i| table.get_ref(i, allowed));
                if let Err(err) = result {
                    table.put_ref(child_index);
                    return Err(err);
                }
            }
        }

        page.write(index, new.raw());
        let mut flags = ShadowSet::CHANGED;

        if old.present() {
            // We lost a reference to an old mfn.
            let old_mfn = old.mfn();
            if old_mfn != new.mfn() || !perms_strictly_increased(old.flags(), new.flags()) {
                flags |= ShadowSet::FLUSH;
            }
            self.put_shadow_ref_locked(&mut table, old_mfn);
            if let Some(next) = next_page {
                self.put_shadow_ref_locked(&mut table, next(old_mfn));
            }
        }
        Ok(flags)
    }

    fn put_shadow_ref_locked(&self, table: &mut FrameTable, smfn: Mfn) {
        let index = self
            .arena
            .index_of(smfn)
            .expect("shadow reference drop on foreign frame");
        if table.put_ref(index) == 0 {
            self.destroy_frame(table, index);
        }
    }

    /// Tear down a shadow frame whose last reference is gone: release
    /// everything its live entries hold, then return it to the pool.
    fn destroy_frame(&self, table: &mut FrameTable, index: usize) {
        let ty = table.shadow_type(index);
        let page = self.arena.page_by_index(index);

        match ty {
            ShadowType::Free => panic!("tearing down a free frame"),
            ShadowType::L1 | ShadowType::Fl1 => {
                for i in 0..FRAME_SLOTS {
                    let e = ShadowL1e::from_raw(page.read(i));
                    if e.present() && !fastpath::is_magic(e) {
                        self.put_page_from_l1e(e);
                    }
                }
            }
            ShadowType::L2 | ShadowType::L3 | ShadowType::L4 => {
                for i in 0..FRAME_SLOTS {
                    let e = ShadowL2e::from_raw(page.read(i));
                    if e.present() {
                        self.put_shadow_ref_locked(table, e.mfn());
                    }
                }
            }
        }

        page.clear();
        table.free(index);
    }
}
