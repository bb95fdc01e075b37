//! Concrete panic-reentry scenario (scenario 6): a second fault while the
//! first is still being diagnosed must not deadlock, and must not attempt a
//! second round of diagnostics.
//!
//! The fake HAL's `halt()` is a real Rust `panic!`, since there is no actual
//! way to stop a host test process short of that; `std::panic::catch_unwind`
//! is used to observe each `panic_now` call without aborting the harness.

use std::panic::catch_unwind;

use orion_kernel::hal;
use orion_kernel::klog::{self, DEFAULT_BUFFER};
use orion_kernel::panic::{panic_now, PanicContext};

fn setup() {
    hal::fake::install_once();
    klog::init();
    klog::reset_emergency_for_test();
}

fn ctx(file: &'static str, line: u32, message: &'static str) -> PanicContext<'static> {
    PanicContext { file, line, function: "panic_scenarios", message: core::format_args!("{message}") }
}

#[test]
fn nested_panic_halts_immediately_without_a_second_diagnostic_pass() {
    setup();

    let first = catch_unwind(|| panic_now(ctx("a.rs", 1, "first fault")));
    assert!(first.is_err(), "first panic_now must reach halt() and unwind");
    assert!(klog::emergency_in_progress());

    let second = catch_unwind(|| panic_now(ctx("b.rs", 2, "second fault, still unwinding the first")));
    assert!(second.is_err(), "nested panic_now must also reach halt(), not hang");

    let mut records = vec![blank_record(); 16];
    let n = klog::read(DEFAULT_BUFFER, &mut records, records.len());
    let full_headers = records[..n].iter().filter(|r| r.message().contains("PANIC at")).count();
    let reentry_lines = records[..n]
        .iter()
        .filter(|r| r.message().contains("panic re-entry"))
        .count();

    assert_eq!(full_headers, 1, "only the first fault should run the full diagnostic path");
    assert_eq!(reentry_lines, 1, "the second fault should log exactly one re-entry notice");
}

#[test]
fn panics_outside_a_fault_still_update_the_emergency_latch_once() {
    setup();
    assert!(!klog::emergency_in_progress());
    let _ = catch_unwind(|| panic_now(ctx("c.rs", 3, "only fault")));
    assert!(klog::emergency_in_progress());
}

fn blank_record() -> klog::Record {
    klog::Record {
        level: klog::Level::Trace,
        category: 0,
        timestamp_ns: 0,
        len: 0,
        bytes: [0; orion_kernel::config::KLOG_RECORD_BYTES],
    }
}
