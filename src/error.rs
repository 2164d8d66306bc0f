// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC

use crate::shadow::pool::{AllocError, ShadowType};

// As a general rule, functions private to a given module may use the
// leaf error types. Public functions should return a ShadowError
// containing a leaf error type, usually the one corresponding to
// that module. We always provide a way to convert a leaf error into
// a ShadowError via the From trait at the module level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShadowError {
    // Errors from the shadow frame pool
    Alloc(AllocError),
    // A frame is already shadowed as a different kind of table. This
    // never happens in a consistent guest state; callers must surface
    // it instead of retrying.
    TypeConflict(ShadowType),
    // A shadow frame's reference count would overflow
    RefCountOverflow,
    // The ownership layer refused a reference on a guest frame
    GetPage,
}
