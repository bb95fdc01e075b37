// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Heap allocator backing the dynamic arenas used throughout this crate
//! (process table, capability table, handle tables, IPC port queues).
//!
//! Under `#[cfg(test)]` the host's allocator is used instead so the whole
//! crate is testable with `cargo test`; on a real target the HAL is
//! responsible for calling [`init`] once, early in boot, with a region of
//! physical memory it owns.

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initializes the global heap over `[start, start + size)`.
///
/// # Safety
///
/// The caller (kernel boot code) must guarantee this range is otherwise
/// unused physical memory mapped into the kernel's address space, and that
/// this is called at most once.
#[cfg(not(test))]
pub unsafe fn init(start: usize, size: usize) {
    ALLOCATOR.lock().init(start as *mut u8, size);
}

#[cfg(test)]
pub unsafe fn init(_start: usize, _size: usize) {
    // The host test allocator needs no initialization.
}
