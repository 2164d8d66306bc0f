// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC

pub mod spinlock;

pub use spinlock::{LockGuard, SpinLock};
