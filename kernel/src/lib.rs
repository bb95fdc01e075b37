// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orion kernel core.
//!
//! This is the architecture-neutral portion of the Orion microkernel: the
//! part that runs in privileged mode on every instruction set Orion
//! supports. Per-ISA register/MMU/interrupt-controller code, the bootloader
//! itself, device drivers, and userspace are all external collaborators
//! reached only through the [`hal`] trait and the [`orion_abi`] wire types.
//!
//! # Design principles
//!
//! - Separate compilation: this crate never branches on target ISA. Each ISA
//!   port registers a [`hal::HalOps`] table at boot; the `fake` table (built
//!   under `cfg(test)` or the `testing` feature, the latter so the
//!   `tests/` integration suite can reach it as an external crate) lets the
//!   whole crate run host-side under `cargo test`.
//! - No unbounded recursion or unwinding: every fallible operation returns
//!   `orion_abi::KResult<T>`. The only non-returning control flow is the
//!   [`panic`] path.
//! - Locks are short-held and ordered (see [`sched`] and [`ipc`] module
//!   docs); nothing suspends while holding one.

#![cfg_attr(not(any(test, feature = "testing")), no_std)]

extern crate alloc;

pub mod boot;
pub mod cap;
pub mod config;
pub mod handle;
pub mod hal;
pub mod heap;
pub mod ipc;
pub mod klog;
pub mod panic;
pub mod process;
pub mod sched;
pub mod spinlock;
pub mod syscall;

pub use orion_abi as abi;
