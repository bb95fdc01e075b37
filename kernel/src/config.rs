// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-time constants.
//!
//! Spec §9 leaves several of these as implementer choices ("pick one
//! consistent constant and document it" / "treat them as named constants
//! fixed at build time"). The choices made here are recorded in DESIGN.md.

/// Upper bound on simultaneously-live processes. The source this spec was
/// distilled from declared two conflicting values (65536 and 1024) across
/// headers; we pick a single value sized for a general-purpose multi-core
/// host rather than an embedded deployment.
pub const MAX_PROCESSES: usize = 4096;

/// Handle-table slots per process (spec §4.4 "default bound specified by
/// config").
pub const HANDLES_PER_PROCESS: usize = 1024;

/// Nominal weight used as the numerator when converting a tick duration into
/// a virtual-runtime delta (spec §4.6 `tick`). This is the weight assigned to
/// priority 0 (see [`crate::sched::weight_for_priority`]).
pub const NOMINAL_WEIGHT: u64 = 1024;

/// Timer ticks a thread may run before `tick` requests a reschedule purely on
/// budget grounds (spec §9: "slice budget ... fixed at build time").
pub const SLICE_BUDGET_TICKS: u32 = 4;

/// How often (in ticks) a CPU considers load balancing (spec §4.6, §9).
pub const LOAD_BALANCE_INTERVAL_TICKS: u32 = 8;

/// A CPU only steals work from a peer once its load exceeds the
/// cross-CPU mean by more than this fraction (spec §4.6, §9).
pub const LOAD_BALANCE_THRESHOLD_PERCENT: u64 = 25;

/// Maximum CPUs the core will track runqueues for. Real CPU count, as
/// reported by the HAL, must not exceed this.
pub const MAX_CPUS: usize = 64;

/// Bounded depth of an IPC port's pending-message FIFO (spec §3 "IPC port").
pub const PORT_QUEUE_DEPTH: usize = 64;

/// Bounded depth of an IPC port's blocked-sender/receiver FIFOs.
pub const PORT_WAITER_DEPTH: usize = 64;

/// Maximum payload size for a single IPC message (spec §3, §4.7).
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Maximum capabilities transferable with a single message (spec §4.7).
pub const MAX_TRANSFERRED_CAPS: usize = 16;

/// Records held per klog ring buffer (spec §4.2).
pub const KLOG_RING_CAPACITY: usize = 1024;

/// Maximum length, in bytes, of one klog record's formatted message.
pub const KLOG_RECORD_BYTES: usize = 128;

/// Maximum number of independent klog category buffers, including the
/// default buffer.
pub const KLOG_MAX_BUFFERS: usize = 8;

/// Bounded in-memory fallback buffer for a core dump when no filesystem
/// collaborator is ready to accept one (spec §4.9).
pub const CORE_DUMP_FALLBACK_BYTES: usize = 4096;

/// Maximum frames walked when unwinding the frame-pointer chain during a
/// panic (spec §4.9).
pub const PANIC_MAX_STACK_FRAMES: usize = 32;
