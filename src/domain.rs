// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC

//! Per-domain paging state.
//!
//! A [`Domain`] bundles what the shadow engine needs to know about one
//! guest: its paging mode, the depth of its tables, the shadow frame pool
//! behind the paging lock, and which vcpu is currently scheduled. Vcpu
//! scheduling itself, the guest-table walker and the fault handler are
//! external; they drive this state through the installation entry points
//! in [`crate::shadow::install`].

use crate::locking::SpinLock;
use crate::shadow::geometry::PagingLevels;
use crate::shadow::pool::{FrameTable, PoolInfo, ShadowArena};
use crate::types::Mfn;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

extern crate alloc;
use alloc::boxed::Box;

bitflags! {
    /// Paging-assistance mode of a domain.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PagingMode: u32 {
        /// Shadow paging is active for this domain.
        const ENABLED   = 1 << 0;
        /// Guest-page use counts are tracked through the ownership
        /// layer. Some modes disable this for performance.
        const REFCOUNTS = 1 << 1;
        /// Guest-physical addresses are translated by the hypervisor.
        const TRANSLATE = 1 << 2;
        /// Fully virtualized: the guest's tables are not reachable
        /// through the shadow's own recursive slot, so the linear
        /// mapping goes through the monitor table.
        const EXTERNAL  = 1 << 3;
    }
}

impl PagingMode {
    /// Mode of a fully virtualized guest.
    pub fn external() -> Self {
        Self::ENABLED | Self::REFCOUNTS | Self::TRANSLATE | Self::EXTERNAL
    }

    /// Mode of a paravirtualized guest managing its own guest-physical
    /// space.
    pub fn direct() -> Self {
        Self::ENABLED | Self::REFCOUNTS
    }
}

/// Identity of a virtual CPU within its domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct VcpuId(usize);

impl VcpuId {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub const fn bits(self) -> usize {
        self.0
    }
}

/// The reference-counting ownership system for guest-owned frames.
/// Consumed, never owned: the physical-memory layer implements it.
pub trait PageRefcount: fmt::Debug + Send + Sync {
    /// Take a use-count reference on `mfn`, with write intent when
    /// `writable`. Returns false when the frame cannot be used as a
    /// mapping target.
    fn get_page(&self, mfn: Mfn, writable: bool) -> bool;

    /// Drop a reference previously taken with the same write intent.
    fn put_page(&self, mfn: Mfn, writable: bool);
}

/// Ownership stub for domains whose paging mode does not track counts.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullRefcount;

impl PageRefcount for NullRefcount {
    fn get_page(&self, _mfn: Mfn, _writable: bool) -> bool {
        true
    }

    fn put_page(&self, _mfn: Mfn, _writable: bool) {}
}

/// Construction parameters for a domain's shadow state.
#[derive(Clone, Copy, Debug)]
pub struct DomainConfig {
    /// Depth of the guest's own pagetables (2, 3 or 4).
    pub guest_levels: usize,
    pub mode: PagingMode,
    /// Size of the shadow frame pool.
    pub pool_frames: usize,
}

/// No vcpu of this domain is scheduled.
const VCPU_NONE: usize = usize::MAX;

pub struct Domain {
    pub(crate) mode: PagingMode,
    pub(crate) levels: PagingLevels,
    pub(crate) owner: Box<dyn PageRefcount>,
    pub(crate) arena: ShadowArena,
    /// The per-domain paging lock. All shadow mutation serializes here.
    pub(crate) frames: SpinLock<FrameTable>,
    current: AtomicUsize,
}

impl Domain {
    pub fn new(config: DomainConfig, owner: Box<dyn PageRefcount>) -> Self {
        let levels = PagingLevels::from_guest_levels(config.guest_levels);
        let arena = ShadowArena::new(config.pool_frames);
        log::info!(
            "shadow pool: {} frames at mfn {:#x}, {:?} paging",
            config.pool_frames,
            arena.base_mfn(),
            levels
        );
        Self {
            mode: config.mode,
            levels,
            owner,
            frames: SpinLock::new(FrameTable::new(config.pool_frames)),
            arena,
            current: AtomicUsize::new(VCPU_NONE),
        }
    }

    pub fn paging_mode(&self) -> PagingMode {
        self.mode
    }

    pub fn paging_levels(&self) -> PagingLevels {
        self.levels
    }

    pub fn refcounts_enabled(&self) -> bool {
        self.mode.contains(PagingMode::REFCOUNTS)
    }

    pub fn is_external(&self) -> bool {
        self.mode.contains(PagingMode::EXTERNAL)
    }

    /// Record which vcpu now runs on the executing processor. Called by
    /// the scheduler on context switch.
    pub fn set_current_vcpu(&self, vcpu: Option<VcpuId>) {
        let val = match vcpu {
            Some(v) => v.bits(),
            None => VCPU_NONE,
        };
        self.current.store(val, Ordering::Release);
    }

    pub fn current_vcpu(&self) -> Option<VcpuId> {
        match self.current.load(Ordering::Acquire) {
            VCPU_NONE => None,
            id => Some(VcpuId::new(id)),
        }
    }

    pub fn pool_info(&self) -> PoolInfo {
        self.frames.lock().pool_info()
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("mode", &self.mode)
            .field("levels", &self.levels)
            .field("pool", &self.pool_info())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_domain(mode: PagingMode) -> Domain {
        Domain::new(
            DomainConfig {
                guest_levels: 4,
                mode,
                pool_frames: 4,
            },
            Box::new(NullRefcount),
        )
    }

    #[test]
    fn mode_queries() {
        let d = test_domain(PagingMode::external());
        assert!(d.refcounts_enabled());
        assert!(d.is_external());

        let d = test_domain(PagingMode::ENABLED);
        assert!(!d.refcounts_enabled());
        assert!(!d.is_external());
    }

    #[test]
    fn current_vcpu_tracking() {
        let d = test_domain(PagingMode::direct());
        assert_eq!(d.current_vcpu(), None);
        d.set_current_vcpu(Some(VcpuId::new(2)));
        assert_eq!(d.current_vcpu(), Some(VcpuId::new(2)));
        d.set_current_vcpu(None);
        assert_eq!(d.current_vcpu(), None);
    }

    #[test]
    fn pool_accounting_visible() {
        let d = test_domain(PagingMode::direct());
        let info = d.pool_info();
        assert_eq!(info.total_frames, 4);
        assert_eq!(info.free_frames, 4);
    }
}
