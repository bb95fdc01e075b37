// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Panic / diagnostics path (spec §4.9, component C10).
//!
//! This is the one place in the crate allowed to not return: once called,
//! control never comes back to the faulting code. Everything here is
//! written to make progress even when other locks in the kernel are stuck
//! held -- klog's emergency path, a try-acquire re-entry guard, and a
//! best-effort core dump are all designed around "the rest of the kernel
//! may already be broken."

use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::{CORE_DUMP_FALLBACK_BYTES, PANIC_MAX_STACK_FRAMES};
use crate::hal;
use crate::klog_emergency;
use crate::spinlock::SpinLock;

/// Registered by a filesystem collaborator once it is ready to accept
/// writes; `None` until then, in which case core dumps fall back to the
/// in-memory buffer (spec §4.9, §6 "Persisted state").
pub type CoreDumpSink = fn(path: &[u8], data: &[u8]) -> bool;

static CORE_DUMP_SINK: SpinLock<Option<CoreDumpSink>> = SpinLock::new(None);
static CORE_DUMP_BUFFER: SpinLock<CoreDumpBuffer> =
    SpinLock::new(CoreDumpBuffer { bytes: [0; CORE_DUMP_FALLBACK_BYTES], len: 0 });

struct CoreDumpBuffer {
    bytes: [u8; CORE_DUMP_FALLBACK_BYTES],
    len: usize,
}

/// Registers the collaborator `panic_now` will try first for persisting a
/// core dump. Call once, typically once the filesystem reports ready.
pub fn register_core_dump_sink(sink: CoreDumpSink) {
    *CORE_DUMP_SINK.lock() = Some(sink);
}

/// Snapshot of the panicking context, gathered by the `kpanic!` macro so
/// this module never needs to parse `core::panic::PanicInfo` itself (kept
/// separate so the same path serves both `kpanic!`-driven internal faults
/// and the `#[panic_handler]` below).
pub struct PanicContext<'a> {
    pub file: &'a str,
    pub line: u32,
    pub function: &'a str,
    pub message: core::fmt::Arguments<'a>,
}

static PANIC_LOCK: SpinLock<()> = SpinLock::new(());

/// The panic path itself (spec §4.9's numbered contract). Never returns.
pub fn panic_now(ctx: PanicContext<'_>) -> ! {
    (hal::get().disable_interrupts)();

    if crate::klog::emergency_in_progress() {
        // A second fault while the first is still being diagnosed: spec
        // §4.9 says proceed directly to halt, no further diagnostics.
        klog_emergency!("panic re-entry on CPU {}; halting immediately", current_cpu());
        halt_all_and_loop();
    }

    let guard = PANIC_LOCK.try_lock();

    emit_header(&ctx);
    dump_stack();
    save_core_dump(&ctx);

    drop(guard);
    halt_all_and_loop();
}

fn current_cpu() -> usize {
    (hal::get().current_cpu_id)()
}

fn emit_header(ctx: &PanicContext<'_>) {
    let now = (hal::get().timestamp_ns)();
    klog_emergency!(
        "PANIC at {}:{} in {} (cpu {}, t={}ns): {}",
        ctx.file,
        ctx.line,
        ctx.function,
        current_cpu(),
        now,
        ctx.message
    );
}

fn dump_stack() {
    let mut frames = [0usize; PANIC_MAX_STACK_FRAMES];
    // SAFETY: the panic path never returns normally, so a corrupted stack
    // discovered mid-walk cannot be observed by any other caller.
    let count = unsafe { (hal::get().stack_trace)(&mut frames) };
    for (i, frame) in frames.iter().take(count).enumerate() {
        klog_emergency!("  #{} {:#x}", i, frame);
    }
}

fn format_core_dump_path(buf: &mut [u8], ctx: &PanicContext<'_>) -> usize {
    use core::fmt::Write;
    struct Cursor<'a> {
        buf: &'a mut [u8],
        written: usize,
    }
    impl<'a> Write for Cursor<'a> {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let remaining = self.buf.len() - self.written;
            let n = s.len().min(remaining);
            self.buf[self.written..self.written + n].copy_from_slice(&s.as_bytes()[..n]);
            self.written += n;
            Ok(())
        }
    }
    let mut cursor = Cursor { buf, written: 0 };
    let now = (hal::get().timestamp_ns)();
    let _ = core::fmt::write(
        &mut cursor,
        format_args!("core.{}.{}.{}", now, ctx.file, ctx.line),
    );
    cursor.written
}

fn save_core_dump(ctx: &PanicContext<'_>) {
    let mut path_buf = [0u8; 128];
    let path_len = format_core_dump_path(&mut path_buf, ctx);
    let path = &path_buf[..path_len];

    // The dump payload itself is just the formatted header re-encoded; a
    // real dump would include register state, but that blob is opaque to
    // this crate (see `hal::RegisterContext`'s doc comment).
    let mut data = [0u8; CORE_DUMP_FALLBACK_BYTES];
    let mut writer = CoreDumpWriter { buf: &mut data, written: 0 };
    let _ = core::fmt::write(
        &mut writer,
        format_args!("{}:{} {}", ctx.file, ctx.line, ctx.message),
    );
    let written = writer.written;

    let sink = *CORE_DUMP_SINK.lock();
    let persisted = sink.map(|f| f(path, &data[..written])).unwrap_or(false);
    if !persisted {
        let mut buffer = CORE_DUMP_BUFFER.lock();
        let n = written.min(buffer.bytes.len());
        buffer.bytes[..n].copy_from_slice(&data[..n]);
        buffer.len = n;
    }
}

struct CoreDumpWriter<'a> {
    buf: &'a mut [u8],
    written: usize,
}

impl<'a> core::fmt::Write for CoreDumpWriter<'a> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let remaining = self.buf.len() - self.written;
        let n = s.len().min(remaining);
        self.buf[self.written..self.written + n].copy_from_slice(&s.as_bytes()[..n]);
        self.written += n;
        Ok(())
    }
}

/// Returns the in-memory core dump fallback buffer's current contents, for
/// tests and for any collaborator polling after the fact (the kernel
/// itself never reads this back).
pub fn core_dump_fallback(out: &mut [u8]) -> usize {
    let buffer = CORE_DUMP_BUFFER.lock();
    let n = buffer.len.min(out.len());
    out[..n].copy_from_slice(&buffer.bytes[..n]);
    n
}

fn halt_all_and_loop() -> ! {
    let n = (hal::get().cpu_count)();
    let this = current_cpu();
    for cpu in 0..n {
        if cpu != this {
            (hal::get().send_ipi)(cpu, hal::IpiKind::Halt);
        }
    }
    (hal::get().halt)()
}

#[macro_export]
macro_rules! kpanic {
    ($($arg:tt)*) => {
        $crate::panic::panic_now($crate::panic::PanicContext {
            file: core::file!(),
            line: core::line!(),
            function: core::module_path!(),
            message: core::format_args!($($arg)*),
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        hal::fake::install_once();
        crate::klog::init();
        crate::klog::reset_emergency_for_test();
    }

    #[test]
    fn core_dump_falls_back_to_memory_when_no_sink_registered() {
        setup();
        save_core_dump(&PanicContext {
            file: "test.rs",
            line: 42,
            function: "f",
            message: format_args!("boom"),
        });
        let mut out = [0u8; 64];
        let n = core_dump_fallback(&mut out);
        assert!(n > 0);
        assert!(core::str::from_utf8(&out[..n]).unwrap().contains("boom"));
    }

    #[test]
    fn core_dump_path_includes_file_and_line() {
        setup();
        let ctx = PanicContext {
            file: "weird.rs",
            line: 7,
            function: "f",
            message: format_args!("x"),
        };
        let mut buf = [0u8; 128];
        let n = format_core_dump_path(&mut buf, &ctx);
        let s = core::str::from_utf8(&buf[..n]).unwrap();
        assert!(s.starts_with("core."));
        assert!(s.contains("weird.rs"));
        assert!(s.contains('7'));
    }

    #[test]
    fn sink_is_preferred_over_fallback_buffer() {
        setup();
        static CALLED: AtomicBool = AtomicBool::new(false);
        fn sink(_path: &[u8], _data: &[u8]) -> bool {
            CALLED.store(true, Ordering::SeqCst);
            true
        }
        register_core_dump_sink(sink);
        save_core_dump(&PanicContext {
            file: "test.rs",
            line: 1,
            function: "f",
            message: format_args!("hi"),
        });
        assert!(CALLED.load(Ordering::SeqCst));
    }
}
