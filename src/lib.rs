// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC

//! Shadow page-table engine for a type-1 hypervisor.
//!
//! For every guest virtual-memory domain this crate maintains a
//! hardware-walkable page-table hierarchy that mirrors the guest's own
//! tables but maps to real machine frames. The walker that validates guest
//! entries, the fault handler, and the physical-memory layer are external
//! collaborators; what lives here is the part they all share:
//!
//! * level geometry and level-typed entry accessors ([`shadow::geometry`],
//!   [`shadow::entry`]),
//! * the self-referential linear-mapping windows ([`shadow::linear`]),
//! * reserved-bit sentinel encodings that let the fault handler resolve
//!   guest-not-present and emulated-MMIO faults without taking the paging
//!   lock ([`shadow::fastpath`]),
//! * the shadow frame pool with type tags and reference counts
//!   ([`shadow::pool`]),
//! * and the `shadow_set_l1e..l4e` installation entry points
//!   ([`shadow::install`]).

#![cfg_attr(not(test), no_std)]

pub mod address;
pub mod domain;
pub mod error;
pub mod locking;
pub mod p2m;
pub mod platform;
pub mod shadow;
pub mod types;

pub use domain::{Domain, DomainConfig, PagingMode, VcpuId};
pub use error::ShadowError;
pub use types::{Gfn, Mfn};
