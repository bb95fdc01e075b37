// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel logging ring buffer (spec §4.2, component C2).
//!
//! A lock-protected, multi-buffer ring of fixed-size log records with
//! levels and categories. Every other component in this crate calls into
//! `klog` for diagnostics, so this module has no dependency on anything
//! else in the crate besides [`crate::spinlock`] and [`crate::hal`] (for the
//! monotonic clock).

use alloc::vec::Vec;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::config::{KLOG_MAX_BUFFERS, KLOG_RECORD_BYTES, KLOG_RING_CAPACITY};
use crate::hal;
use crate::spinlock::SpinLock;

/// Severity of a log record. Lower numeric value is more severe, matching
/// the convention used for scheduler priority elsewhere in this crate.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

pub const DEFAULT_BUFFER: u8 = 0;

#[derive(Clone)]
pub struct Record {
    pub level: Level,
    pub category: u8,
    pub timestamp_ns: u64,
    pub len: u16,
    pub bytes: [u8; KLOG_RECORD_BYTES],
}

impl Record {
    fn empty() -> Self {
        Record {
            level: Level::Trace,
            category: 0,
            timestamp_ns: 0,
            len: 0,
            bytes: [0; KLOG_RECORD_BYTES],
        }
    }

    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

struct MessageWriter<'a> {
    dest: &'a mut [u8],
    written: usize,
}

impl<'a> Write for MessageWriter<'a> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = self.dest.len() - self.written;
        let n = s.len().min(remaining);
        self.dest[self.written..self.written + n]
            .copy_from_slice(&s.as_bytes()[..n]);
        self.written += n;
        Ok(())
    }
}

/// A single drop-oldest ring of [`Record`]s.
struct Ring {
    records: Vec<Record>,
    /// Index of the oldest unread record.
    head: usize,
    /// Index the next write lands at.
    tail: usize,
    count: usize,
    overflow: bool,
    threshold: Level,
}

impl Ring {
    fn new(threshold: Level) -> Self {
        Ring {
            records: alloc::vec![Record::empty(); KLOG_RING_CAPACITY],
            head: 0,
            tail: 0,
            count: 0,
            overflow: false,
            threshold,
        }
    }

    fn push(&mut self, record: Record) {
        self.records[self.tail] = record;
        self.tail = (self.tail + 1) % self.records.len();
        if self.count == self.records.len() {
            // Ring is full: drop the oldest entry by advancing head too.
            self.head = (self.head + 1) % self.records.len();
            self.overflow = true;
        } else {
            self.count += 1;
        }
    }

    fn read(&mut self, out: &mut [Record], max: usize) -> usize {
        let n = max.min(out.len()).min(self.count);
        for (i, slot) in out.iter_mut().take(n).enumerate() {
            *slot = self.records[(self.head + i) % self.records.len()].clone();
        }
        self.head = (self.head + n) % self.records.len();
        self.count -= n;
        n
    }
}

struct KlogState {
    buffers: [Option<Ring>; KLOG_MAX_BUFFERS],
}

static KLOG: SpinLock<Option<KlogState>> = SpinLock::new(None);
static DEFAULT_THRESHOLD: AtomicU8 = AtomicU8::new(Level::Info as u8);
static EMERGENCY_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

fn level_from_u8(raw: u8) -> Level {
    match raw {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    }
}

/// Initializes all buffers with the global default threshold. Idempotent:
/// calling again resets every buffer.
pub fn init() {
    let threshold = level_from_u8(DEFAULT_THRESHOLD.load(Ordering::Relaxed));
    let buffers: [Option<Ring>; KLOG_MAX_BUFFERS] =
        core::array::from_fn(|_| Some(Ring::new(threshold)));
    *KLOG.lock() = Some(KlogState { buffers });
}

/// Sets the level threshold applied to non-emergency writes on `buffer_id`.
/// Out-of-range buffer ids are silently ignored (local recovery, per §7:
/// "a single failed klog record is dropped, not surfaced").
pub fn set_threshold(buffer_id: u8, level: Level) {
    if let Some(state) = KLOG.lock().as_mut() {
        if let Some(Some(ring)) = state.buffers.get_mut(buffer_id as usize) {
            ring.threshold = level;
        }
    }
}

/// Appends a record to the buffer associated with `category`, or the
/// default buffer if `category` names none configured. If `level` is less
/// severe than the buffer's threshold, the call is a documented no-op that
/// still returns success (spec §4.2).
pub fn write(level: Level, category: u8, args: fmt::Arguments<'_>) {
    let mut guard = KLOG.lock();
    let Some(state) = guard.as_mut() else {
        return;
    };
    let buffer_id = if (category as usize) < KLOG_MAX_BUFFERS {
        category
    } else {
        DEFAULT_BUFFER
    };
    let Some(Some(ring)) = state.buffers.get_mut(buffer_id as usize) else {
        return;
    };
    if level > ring.threshold {
        return;
    }
    ring.push(format_record(level, buffer_id, args));
}

fn format_record(level: Level, category: u8, args: fmt::Arguments<'_>) -> Record {
    let mut record = Record::empty();
    record.level = level;
    record.category = category;
    record.timestamp_ns = (hal::get().timestamp_ns)();
    let mut writer = MessageWriter { dest: &mut record.bytes, written: 0 };
    let _ = fmt::write(&mut writer, args);
    record.len = writer.written as u16;
    record
}

/// Reads up to `max` records from `buffer_id` in FIFO order, advancing the
/// read cursor. Returns the number of records actually read.
pub fn read(buffer_id: u8, out: &mut [Record], max: usize) -> usize {
    let Some(state) = KLOG.lock().as_mut() else {
        return 0;
    };
    match state.buffers.get_mut(buffer_id as usize) {
        Some(Some(ring)) => ring.read(out, max),
        _ => 0,
    }
}

/// Whether `buffer_id` has dropped at least one record to overflow since
/// last cleared.
pub fn has_overflowed(buffer_id: u8) -> bool {
    KLOG
        .lock()
        .as_ref()
        .and_then(|s| s.buffers.get(buffer_id as usize))
        .and_then(|b| b.as_ref())
        .map(|r| r.overflow)
        .unwrap_or(false)
}

/// Whether [`emergency`] has been called at least once this boot. Used by
/// [`crate::panic`] to recognize a fault that occurred while already
/// unwinding a previous fault.
pub fn emergency_in_progress() -> bool {
    EMERGENCY_IN_PROGRESS.load(Ordering::SeqCst)
}

/// Bypasses level thresholds and writes synchronously to the default
/// buffer (and, best-effort, a platform console). Must make progress even
/// with other locks held: uses only `try_lock`, and if that fails, falls
/// back to an unsynchronized write directly into the default buffer's
/// backing storage. This is the one place in this crate that knowingly
/// accepts a data race in exchange for forward progress during a fault.
pub fn emergency(args: fmt::Arguments<'_>) {
    EMERGENCY_IN_PROGRESS.store(true, Ordering::SeqCst);

    if let Some(mut guard) = KLOG.try_lock() {
        if let Some(state) = guard.as_mut() {
            if let Some(Some(ring)) = state.buffers.get_mut(DEFAULT_BUFFER as usize) {
                ring.push(format_record(Level::Error, DEFAULT_BUFFER, args));
            }
        }
        return;
    }

    // Lock is held elsewhere (we may even be re-entering from within a
    // panic that itself holds it). Fall back to a best-effort unsynchronized
    // write so the message has a chance of surviving; see module docs.
    unsafe {
        if let Some(state) = KLOG.force_unsynchronized_mut() {
            if let Some(Some(ring)) = state.buffers.get_mut(DEFAULT_BUFFER as usize) {
                ring.push(format_record(Level::Error, DEFAULT_BUFFER, args));
            }
        }
    }
}

#[macro_export]
macro_rules! klog {
    ($cat:expr, $lvl:expr, $($arg:tt)*) => {
        $crate::klog::write($lvl, $cat, core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_emergency {
    ($($arg:tt)*) => {
        $crate::klog::emergency(core::format_args!($($arg)*))
    };
}

/// Clears the emergency-in-progress latch. Test-only: in production this
/// flag is one-way for the life of the boot, since once it's set the
/// kernel is already on its way to halting. `pub` under `testing` too so
/// the `tests/` integration suite (an ordinary external consumer of this
/// crate) can reset it between scenarios.
#[cfg(any(test, feature = "testing"))]
pub fn reset_emergency_for_test() {
    EMERGENCY_IN_PROGRESS.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal;

    fn setup() {
        hal::fake::install_once();
        init();
        reset_emergency_for_test();
    }

    #[test]
    fn write_then_read_round_trips() {
        setup();
        write(Level::Info, DEFAULT_BUFFER, format_args!("hello {}", 42));
        let mut out = [Record::empty(), Record::empty()];
        let n = read(DEFAULT_BUFFER, &mut out, 2);
        assert_eq!(n, 1);
        assert_eq!(out[0].message(), "hello 42");
    }

    #[test]
    fn below_threshold_is_dropped() {
        setup();
        set_threshold(DEFAULT_BUFFER, Level::Warn);
        write(Level::Debug, DEFAULT_BUFFER, format_args!("too quiet"));
        let mut out = [Record::empty()];
        assert_eq!(read(DEFAULT_BUFFER, &mut out, 1), 0);
    }

    #[test]
    fn overflow_drops_oldest_and_sets_flag() {
        setup();
        set_threshold(DEFAULT_BUFFER, Level::Trace);
        for i in 0..(KLOG_RING_CAPACITY + 10) {
            write(Level::Info, DEFAULT_BUFFER, format_args!("entry {i}"));
        }
        assert!(has_overflowed(DEFAULT_BUFFER));
        let mut out = [Record::empty()];
        let n = read(DEFAULT_BUFFER, &mut out, 1);
        assert_eq!(n, 1);
        // The oldest surviving entry should not be entry 0; it was dropped.
        assert_ne!(out[0].message(), "entry 0");
    }

    #[test]
    fn emergency_bypasses_threshold() {
        setup();
        set_threshold(DEFAULT_BUFFER, Level::Error);
        klog_emergency!("emergency {}", "path");
        let mut out = [Record::empty()];
        assert_eq!(read(DEFAULT_BUFFER, &mut out, 1), 1);
    }
}
