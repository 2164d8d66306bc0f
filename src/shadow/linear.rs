// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC

//! Access to the linear mapping of shadow page tables.
//!
//! Two reserved virtual-address windows, one top-level slot apart, let
//! the running vcpu address page tables without a physical-to-virtual
//! lookup: the monitor window maps the tables the processor is actually
//! walking, the shadow window maps the active shadow tables through the
//! recursive self-entry.
//!
//! Where to find each level: for guests sharing the hypervisor's own
//! recursive mapping, the shadow self-entry chains as many times as
//! needed. Fully virtualized guests have no self-entry in their shadow,
//! so the top levels chain through the monitor window and only the final
//! step goes through the shadow window.
//!
//! Every accessor is only meaningful for the vcpu currently scheduled on
//! the executing processor; use from anywhere else is a logic error and
//! asserts, it is not a runtime condition to recover from.

use crate::address::VirtAddr;
use crate::domain::{Domain, VcpuId};
use crate::shadow::geometry::{linear_offset, ENTRY_SIZE};

/// Base of the monitor table's own recursive mapping.
pub const LINEAR_PT_VIRT_START: VirtAddr = VirtAddr::new(0xffff_8100_0000_0000);

/// Base of the shadow recursive mapping.
pub const SH_LINEAR_PT_VIRT_START: VirtAddr = VirtAddr::new(0xffff_8180_0000_0000);

/// Chain a recursive window onto itself `level - 1` times: the level-N
/// table of a self-referential mapping sits at the window's own offset
/// within the level below.
fn recursive_table(window: VirtAddr, level: usize) -> VirtAddr {
    let mut table = window;
    for l in 1..level {
        table = table + linear_offset(l, window) * ENTRY_SIZE;
    }
    table
}

/// Virtual address of the linear mapping of the given shadow level for
/// the currently running vcpu.
///
/// # Panics
///
/// Panics when `vcpu` is not the domain's currently scheduled vcpu, or
/// when `level` is outside the domain's paging depth.
pub fn linear_table(d: &Domain, vcpu: VcpuId, level: usize) -> VirtAddr {
    assert!(
        d.current_vcpu() == Some(vcpu),
        "linear mapping access for vcpu {:?} while {:?} is scheduled",
        vcpu,
        d.current_vcpu()
    );
    assert!(level >= 1 && level <= d.paging_levels().count());

    if level == 1 {
        return SH_LINEAR_PT_VIRT_START;
    }

    // The first level always comes from the shadow window; everything
    // above it comes from whichever window the guest regime can chain.
    let window = if d.is_external() {
        LINEAR_PT_VIRT_START
    } else {
        SH_LINEAR_PT_VIRT_START
    };
    recursive_table(window, level - 1)
        + linear_offset(level - 1, SH_LINEAR_PT_VIRT_START) * ENTRY_SIZE
}
