// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC

//! Guest-physical type classification.
//!
//! The physical-map layer resolves a [`Gfn`](crate::types::Gfn) to an
//! [`Mfn`](crate::types::Mfn) and a type tag. The walker passes that tag
//! down when it installs a level-1 shadow entry; the tag decides whether
//! the mapping takes an ownership reference, gets its writable bit
//! stripped, or must be encoded as a fast-path sentinel instead.

/// Type of a guest-physical frame as reported by the physical map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum P2mType {
    /// Ordinary guest RAM, read-write.
    Ram,
    /// Guest RAM the guest may only read.
    RamRo,
    /// Emulated MMIO, handled by the device-model relay.
    MmioDm,
    /// Passed-through hardware MMIO, mapped directly.
    MmioDirect,
    /// No valid backing.
    Invalid,
}

impl P2mType {
    /// RAM of any flavour: the mapping target is a guest-owned page and
    /// participates in ownership accounting.
    pub fn is_ram(self) -> bool {
        matches!(self, P2mType::Ram | P2mType::RamRo)
    }

    /// Emulated MMIO is never mapped; faults on it are resolved through
    /// the sentinel fast path.
    pub fn is_mmio(self) -> bool {
        matches!(self, P2mType::MmioDm)
    }

    pub fn is_readonly(self) -> bool {
        matches!(self, P2mType::RamRo)
    }
}
