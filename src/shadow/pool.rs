// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC

//! The per-domain shadow frame pool.
//!
//! Shadow tables live in machine frames owned by the domain's pool: one
//! contiguous arena of page-sized frames, allocated when the domain is
//! created. Each frame carries a storage word recording what it currently
//! is: free (threaded on the free list) or a live shadow of some level,
//! with a count of the parent entries referencing it. A frame whose count
//! drops to zero is torn down and returned to the free list.
//!
//! All bookkeeping here mutates under the domain's paging lock; only the
//! entry slots themselves are atomics, so the fault-entry fast path can
//! read them without the lock.

use crate::error::ShadowError;
use crate::types::{Mfn, PAGE_SHIFT, PAGE_SIZE};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

extern crate alloc;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Number of entry slots in a shadow frame.
pub const FRAME_SLOTS: usize = PAGE_SIZE / core::mem::size_of::<u64>();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// No free shadow frame is left in the pool.
    OutOfMemory,
    /// The machine frame is not part of this domain's shadow pool.
    InvalidMfn(Mfn),
    /// The storage word carries an unknown frame type.
    InvalidFrameType,
}

impl From<AllocError> for ShadowError {
    fn from(err: AllocError) -> Self {
        Self::Alloc(err)
    }
}

/// What a pool frame currently shadows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ShadowType {
    Free = 0,
    /// A shadow of a guest level-1 table.
    L1 = 1,
    /// A level-1 shadow with no backing guest table, used when a guest
    /// superpage entry is split into 4k mappings.
    Fl1 = 2,
    L2 = 3,
    L3 = 4,
    L4 = 5,
}

impl ShadowType {
    /// Leaf shadows hold mappings of guest-owned pages rather than
    /// references to other shadow frames.
    pub fn is_leaf(self) -> bool {
        matches!(self, ShadowType::L1 | ShadowType::Fl1)
    }
}

impl TryFrom<u64> for ShadowType {
    type Error = AllocError;

    fn try_from(val: u64) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(ShadowType::Free),
            1 => Ok(ShadowType::L1),
            2 => Ok(ShadowType::Fl1),
            3 => Ok(ShadowType::L2),
            4 => Ok(ShadowType::L3),
            5 => Ok(ShadowType::L4),
            _ => Err(AllocError::InvalidFrameType),
        }
    }
}

/// Storage word of a pool frame, including encoding and decoding methods.
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
struct FrameStorageType(u64);

impl FrameStorageType {
    const TYPE_SHIFT: u64 = 4;
    const TYPE_MASK: u64 = (1u64 << Self::TYPE_SHIFT) - 1;
    const PAYLOAD_MASK: u64 = !Self::TYPE_MASK >> Self::TYPE_SHIFT;

    const fn new(t: ShadowType) -> Self {
        Self(t as u64)
    }

    fn encode_next(self, next_frame: usize) -> Self {
        Self(self.0 | ((next_frame as u64) & Self::PAYLOAD_MASK) << Self::TYPE_SHIFT)
    }

    fn encode_refcount(self, refcount: u64) -> Self {
        Self(self.0 | (refcount & Self::PAYLOAD_MASK) << Self::TYPE_SHIFT)
    }

    fn decode_next(&self) -> usize {
        (self.0 >> Self::TYPE_SHIFT) as usize
    }

    fn decode_refcount(&self) -> u64 {
        self.0 >> Self::TYPE_SHIFT
    }

    fn frame_type(&self) -> Result<ShadowType, AllocError> {
        ShadowType::try_from(self.0 & Self::TYPE_MASK)
    }
}

/// End-of-list marker for the free list.
const FREE_NIL: usize = FrameStorageType::PAYLOAD_MASK as usize;

/// A shadow frame's reference count saturates here.
pub(crate) const REF_COUNT_MAX: u64 = FrameStorageType::PAYLOAD_MASK;

/// Information about a free pool frame.
#[derive(Clone, Copy, Debug)]
struct FreeInfo {
    /// Index of the next free frame.
    next_frame: usize,
}

impl FreeInfo {
    fn encode(&self) -> FrameStorageType {
        FrameStorageType::new(ShadowType::Free).encode_next(self.next_frame)
    }

    fn decode(mem: FrameStorageType) -> Self {
        let next_frame = mem.decode_next();
        Self { next_frame }
    }
}

/// Information about a frame holding a live shadow table.
#[derive(Clone, Copy, Debug)]
struct ShadowInfo {
    ty: ShadowType,
    /// Number of parent-level entries pointing at this frame.
    ref_count: u64,
}

impl ShadowInfo {
    fn encode(&self) -> FrameStorageType {
        FrameStorageType::new(self.ty).encode_refcount(self.ref_count)
    }

    fn decode(mem: FrameStorageType, ty: ShadowType) -> Self {
        let ref_count = mem.decode_refcount();
        Self { ty, ref_count }
    }
}

/// Decoded state of one pool frame.
#[derive(Clone, Copy, Debug)]
enum FrameInfo {
    Free(FreeInfo),
    Shadow(ShadowInfo),
}

impl FrameInfo {
    fn to_mem(self) -> FrameStorageType {
        match self {
            Self::Free(fi) => fi.encode(),
            Self::Shadow(si) => si.encode(),
        }
    }

    fn from_mem(mem: FrameStorageType) -> Self {
        let Ok(frame_type) = mem.frame_type() else {
            panic!("Unknown frame type in {:?}", mem);
        };

        match frame_type {
            ShadowType::Free => Self::Free(FreeInfo::decode(mem)),
            ty => Self::Shadow(ShadowInfo::decode(mem, ty)),
        }
    }
}

/// Occupancy of the shadow pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolInfo {
    pub total_frames: usize,
    pub free_frames: usize,
}

/// One page worth of shadow entry slots. Slots are whole-value atomics:
/// an installed entry is either entirely old or entirely new to a
/// lock-free reader, never a torn mix.
#[repr(C, align(4096))]
pub(crate) struct ShadowPage {
    slots: [AtomicU64; FRAME_SLOTS],
}

impl ShadowPage {
    fn new() -> Self {
        Self {
            slots: [const { AtomicU64::new(0) }; FRAME_SLOTS],
        }
    }

    pub(crate) fn read(&self, index: usize) -> u64 {
        self.slots[index].load(Ordering::Acquire)
    }

    pub(crate) fn write(&self, index: usize, raw: u64) {
        self.slots[index].store(raw, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(0, Ordering::Release);
        }
    }
}

impl fmt::Debug for ShadowPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowPage").finish_non_exhaustive()
    }
}

const _: () = assert!(core::mem::size_of::<ShadowPage>() == PAGE_SIZE);

/// The contiguous arena backing all of a domain's shadow frames. Frames
/// are addressed by machine frame number; the arena translates between
/// an [`Mfn`] and its page by offset from the arena base.
#[derive(Debug)]
pub(crate) struct ShadowArena {
    pages: Box<[ShadowPage]>,
}

impl ShadowArena {
    pub(crate) fn new(frames: usize) -> Self {
        assert!(frames > 0, "empty shadow pool");
        let pages: Vec<ShadowPage> = (0..frames).map(|_| ShadowPage::new()).collect();
        Self {
            pages: pages.into_boxed_slice(),
        }
    }

    pub(crate) fn base_mfn(&self) -> Mfn {
        Mfn::new((self.pages.as_ptr() as usize >> PAGE_SHIFT) as u64)
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn index_of(&self, mfn: Mfn) -> Option<usize> {
        let idx = mfn.bits().checked_sub(self.base_mfn().bits())? as usize;
        (idx < self.pages.len()).then_some(idx)
    }

    pub(crate) fn mfn_of(&self, index: usize) -> Mfn {
        debug_assert!(index < self.pages.len());
        Mfn::new(self.base_mfn().bits() + index as u64)
    }

    pub(crate) fn page(&self, mfn: Mfn) -> Option<&ShadowPage> {
        self.index_of(mfn).map(|idx| &self.pages[idx])
    }

    pub(crate) fn page_by_index(&self, index: usize) -> &ShadowPage {
        &self.pages[index]
    }
}

/// Per-frame bookkeeping, guarded by the domain's paging lock.
#[derive(Debug)]
pub(crate) struct FrameTable {
    info: Box<[FrameStorageType]>,
    free_head: usize,
    free_frames: usize,
}

impl FrameTable {
    pub(crate) fn new(frames: usize) -> Self {
        let info: Vec<FrameStorageType> = (0..frames)
            .map(|i| {
                let next = if i + 1 < frames { i + 1 } else { FREE_NIL };
                FreeInfo { next_frame: next }.encode()
            })
            .collect();
        Self {
            info: info.into_boxed_slice(),
            free_head: if frames > 0 { 0 } else { FREE_NIL },
            free_frames: frames,
        }
    }

    fn frame_info(&self, index: usize) -> FrameInfo {
        FrameInfo::from_mem(self.info[index])
    }

    fn set_frame_info(&mut self, index: usize, fi: FrameInfo) {
        self.info[index] = fi.to_mem();
    }

    pub(crate) fn shadow_type(&self, index: usize) -> ShadowType {
        match self.frame_info(index) {
            FrameInfo::Free(_) => ShadowType::Free,
            FrameInfo::Shadow(si) => si.ty,
        }
    }

    pub(crate) fn ref_count(&self, index: usize) -> u64 {
        match self.frame_info(index) {
            FrameInfo::Free(_) => 0,
            FrameInfo::Shadow(si) => si.ref_count,
        }
    }

    /// Take a frame off the free list and tag it. The new shadow starts
    /// with no references; the caller installs the first one.
    pub(crate) fn alloc(&mut self, ty: ShadowType) -> Result<usize, AllocError> {
        debug_assert!(ty != ShadowType::Free);
        if self.free_head == FREE_NIL {
            return Err(AllocError::OutOfMemory);
        }
        let index = self.free_head;
        let FrameInfo::Free(fi) = self.frame_info(index) else {
            panic!("free list points at live frame {}", index);
        };
        self.free_head = fi.next_frame;
        self.free_frames -= 1;
        self.set_frame_info(index, FrameInfo::Shadow(ShadowInfo { ty, ref_count: 0 }));
        Ok(index)
    }

    /// Return a frame to the free list.
    pub(crate) fn free(&mut self, index: usize) {
        debug_assert_eq!(self.ref_count(index), 0);
        self.set_frame_info(
            index,
            FrameInfo::Free(FreeInfo {
                next_frame: self.free_head,
            }),
        );
        self.free_head = index;
        self.free_frames += 1;
    }

    /// Take a reference on a live shadow frame, verifying it currently
    /// shadows what the caller expects it to.
    pub(crate) fn get_ref(
        &mut self,
        index: usize,
        allowed: &[ShadowType],
    ) -> Result<(), ShadowError> {
        let FrameInfo::Shadow(si) = self.frame_info(index) else {
            return Err(ShadowError::TypeConflict(ShadowType::Free));
        };
        if !allowed.contains(&si.ty) {
            return Err(ShadowError::TypeConflict(si.ty));
        }
        if si.ref_count >= REF_COUNT_MAX {
            return Err(ShadowError::RefCountOverflow);
        }
        self.set_frame_info(
            index,
            FrameInfo::Shadow(ShadowInfo {
                ty: si.ty,
                ref_count: si.ref_count + 1,
            }),
        );
        Ok(())
    }

    /// Drop a reference and report the remaining count. The caller is
    /// responsible for tearing the frame down when it reaches zero.
    pub(crate) fn put_ref(&mut self, index: usize) -> u64 {
        let FrameInfo::Shadow(si) = self.frame_info(index) else {
            panic!("reference drop on free frame {}", index);
        };
        let ref_count = si
            .ref_count
            .checked_sub(1)
            .expect("shadow frame refcount underflow");
        self.set_frame_info(index, FrameInfo::Shadow(ShadowInfo { ty: si.ty, ref_count }));
        ref_count
    }

    pub(crate) fn pool_info(&self) -> PoolInfo {
        PoolInfo {
            total_frames: self.info.len(),
            free_frames: self.free_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_word_round_trips() {
        let free = FreeInfo { next_frame: 17 }.encode();
        assert_eq!(free.frame_type().unwrap(), ShadowType::Free);
        assert_eq!(FreeInfo::decode(free).next_frame, 17);

        let shadow = ShadowInfo {
            ty: ShadowType::L2,
            ref_count: 3,
        }
        .encode();
        assert_eq!(shadow.frame_type().unwrap(), ShadowType::L2);
        assert_eq!(ShadowInfo::decode(shadow, ShadowType::L2).ref_count, 3);
    }

    #[test]
    fn unknown_frame_type_rejected() {
        assert_eq!(ShadowType::try_from(9), Err(AllocError::InvalidFrameType));
    }

    #[test]
    fn alloc_free_cycle() {
        let mut table = FrameTable::new(4);
        assert_eq!(table.pool_info().free_frames, 4);

        let a = table.alloc(ShadowType::L1).unwrap();
        let b = table.alloc(ShadowType::L2).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.shadow_type(a), ShadowType::L1);
        assert_eq!(table.shadow_type(b), ShadowType::L2);
        assert_eq!(table.pool_info().free_frames, 2);

        table.free(a);
        assert_eq!(table.shadow_type(a), ShadowType::Free);
        assert_eq!(table.pool_info().free_frames, 3);
        // Most recently freed frame is reused first.
        assert_eq!(table.alloc(ShadowType::L3).unwrap(), a);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut table = FrameTable::new(2);
        table.alloc(ShadowType::L1).unwrap();
        let last = table.alloc(ShadowType::L1).unwrap();
        assert_eq!(table.alloc(ShadowType::L1), Err(AllocError::OutOfMemory));

        table.free(last);
        assert!(table.alloc(ShadowType::L1).is_ok());
    }

    #[test]
    fn ref_counting_and_type_checks() {
        let mut table = FrameTable::new(2);
        let idx = table.alloc(ShadowType::L1).unwrap();

        table.get_ref(idx, &[ShadowType::L1, ShadowType::Fl1]).unwrap();
        table.get_ref(idx, &[ShadowType::L1]).unwrap();
        assert_eq!(table.ref_count(idx), 2);

        assert_eq!(
            table.get_ref(idx, &[ShadowType::L2]),
            Err(ShadowError::TypeConflict(ShadowType::L1))
        );
        // The failed attempt must not have bumped the count.
        assert_eq!(table.ref_count(idx), 2);

        assert_eq!(table.put_ref(idx), 1);
        assert_eq!(table.put_ref(idx), 0);
    }

    #[test]
    fn arena_mfn_translation() {
        let arena = ShadowArena::new(3);
        let base = arena.base_mfn();
        assert_eq!(arena.index_of(base), Some(0));
        assert_eq!(arena.index_of(Mfn::new(base.bits() + 2)), Some(2));
        assert_eq!(arena.index_of(Mfn::new(base.bits() + 3)), None);
        assert_eq!(arena.mfn_of(1), Mfn::new(base.bits() + 1));

        let page = arena.page(base).unwrap();
        page.write(5, 0xdead);
        assert_eq!(arena.page_by_index(0).read(5), 0xdead);
        page.clear();
        assert_eq!(page.read(5), 0);
    }
}
