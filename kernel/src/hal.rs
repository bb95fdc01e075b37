// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The narrow interface the architecture-neutral core requires from each
//! ISA port (spec §6, §9 "Dynamic dispatch over per-ISA HAL").
//!
//! The core never branches on ISA. Instead, the chosen ISA module registers
//! a table of function pointers once during boot via [`register`]; every
//! other module calls through [`get`]. This is a vtable in spirit without
//! the lifetime/object-safety overhead of `dyn Trait`, and it is exactly
//! what lets [`fake`] install a host-testable HAL so the rest of this crate
//! can be exercised under `cargo test` without real hardware.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::spinlock::SpinLock;

/// Opaque handle to an address space created by the MMU collaborator.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct AddressSpaceId(pub u64);

/// Opaque, architecture-defined saved register state. The core never reads
/// or writes these bytes directly; they are only ever passed to
/// [`HalOps::context_init`] and [`HalOps::context_switch`].
#[derive(Copy, Clone)]
pub struct RegisterContext(pub [u8; 256]);

impl Default for RegisterContext {
    fn default() -> Self {
        RegisterContext([0u8; 256])
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum IpiKind {
    Reschedule,
    Halt,
}

bitflags::bitflags! {
    pub struct MapFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXEC    = 1 << 2;
        const USER    = 1 << 3;
    }
}

pub type IrqHandler = fn(irq: u32, data: usize);

/// Table of function pointers an ISA port registers at boot. Field order
/// follows spec §6's grouping (CPU, time, MMU, interrupts, context).
#[derive(Copy, Clone)]
pub struct HalOps {
    // CPU
    pub current_cpu_id: fn() -> usize,
    pub cpu_count: fn() -> usize,
    pub cpu_idle: fn(),
    pub send_ipi: fn(cpu: usize, kind: IpiKind),
    pub halt: fn() -> !,
    pub disable_interrupts: fn(),
    pub enable_interrupts: fn(),

    // Time
    pub timestamp_ns: fn() -> u64,
    pub boot_time_ns: fn() -> u64,
    pub timer_init: fn(hz: u32),
    pub timer_set_oneshot: fn(ticks: u64),

    // MMU
    pub address_space_create: fn() -> Option<AddressSpaceId>,
    pub address_space_destroy: fn(AddressSpaceId),
    pub map: fn(AddressSpaceId, va: usize, pa: usize, len: usize, flags: MapFlags) -> bool,
    pub unmap: fn(AddressSpaceId, va: usize, len: usize) -> bool,
    pub protect: fn(AddressSpaceId, va: usize, len: usize, flags: MapFlags) -> bool,
    pub translate: fn(AddressSpaceId, va: usize) -> Option<usize>,
    pub validate_user_range:
        fn(AddressSpaceId, va: usize, len: usize, write: bool) -> bool,

    // Interrupts
    pub irq_register: fn(n: u32, handler: IrqHandler, data: usize),
    pub irq_enable: fn(n: u32),
    pub irq_disable: fn(n: u32),
    pub irq_ack: fn(n: u32),

    // Context
    pub context_init:
        fn(ctx: &mut RegisterContext, entry: usize, stack_top: usize, arg: usize),
    /// # Safety
    /// Must only be called from the scheduler's context-switch path with
    /// `prev` and `next` both quiesced with respect to interrupts on this
    /// CPU.
    pub context_switch:
        unsafe fn(prev: &mut RegisterContext, next: &RegisterContext),

    // Diagnostics
    /// Walks the current call stack's frame-pointer chain, writing return
    /// addresses into `out` oldest-frame-last, and returns the number
    /// written. Used only from the panic path (spec §4.9); architecture-
    /// specific because the frame layout is.
    pub stack_trace: unsafe fn(out: &mut [usize]) -> usize,
}

static REGISTERED: AtomicBool = AtomicBool::new(false);
static HAL: SpinLock<Option<HalOps>> = SpinLock::new(None);

/// Registers the HAL for this boot. Must be called exactly once, before any
/// other kernel subsystem is initialized.
pub fn register(ops: HalOps) {
    if REGISTERED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        panic!("HAL already registered");
    }
    *HAL.lock() = Some(ops);
}

/// Returns the registered HAL table.
///
/// # Panics
/// Panics if no HAL has been registered yet; every kernel entry point runs
/// after boot registration, so this indicates a startup ordering bug.
pub fn get() -> HalOps {
    HAL.lock().as_ref().copied().expect("HAL not registered")
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    //! A single-CPU, in-process HAL used by this crate's own test suite and
    //! by the `tests/` integration suite (reached as `orion_kernel::hal::fake`
    //! under the `testing` feature, since an external integration test
    //! crate never sees this crate's own `cfg(test)`). Mirrors the role of a
    //! production kernel's host-simulator arch port: a real (if minimal)
    //! implementation, not a mock, so the rest of the kernel is exercised
    //! exactly as it would be on target.

    use super::*;
    use core::sync::atomic::AtomicU64;

    static CLOCK: AtomicU64 = AtomicU64::new(0);
    static NEXT_ADDRESS_SPACE: AtomicU64 = AtomicU64::new(1);

    fn current_cpu_id() -> usize {
        0
    }
    fn cpu_count() -> usize {
        1
    }
    fn cpu_idle() {}
    fn send_ipi(_cpu: usize, _kind: IpiKind) {}
    fn halt() -> ! {
        panic!("fake HAL halt()");
    }
    fn disable_interrupts() {}
    fn enable_interrupts() {}

    fn timestamp_ns() -> u64 {
        CLOCK.load(Ordering::Relaxed)
    }
    fn boot_time_ns() -> u64 {
        0
    }
    fn timer_init(_hz: u32) {}
    fn timer_set_oneshot(_ticks: u64) {}

    fn address_space_create() -> Option<AddressSpaceId> {
        Some(AddressSpaceId(NEXT_ADDRESS_SPACE.fetch_add(1, Ordering::Relaxed)))
    }
    fn address_space_destroy(_id: AddressSpaceId) {}
    fn map(
        _id: AddressSpaceId,
        _va: usize,
        _pa: usize,
        _len: usize,
        _flags: MapFlags,
    ) -> bool {
        true
    }
    fn unmap(_id: AddressSpaceId, _va: usize, _len: usize) -> bool {
        true
    }
    fn protect(
        _id: AddressSpaceId,
        _va: usize,
        _len: usize,
        _flags: MapFlags,
    ) -> bool {
        true
    }
    fn translate(_id: AddressSpaceId, va: usize) -> Option<usize> {
        Some(va)
    }
    fn validate_user_range(
        _id: AddressSpaceId,
        va: usize,
        _len: usize,
        _write: bool,
    ) -> bool {
        va != 0
    }

    fn irq_register(_n: u32, _handler: IrqHandler, _data: usize) {}
    fn irq_enable(_n: u32) {}
    fn irq_disable(_n: u32) {}
    fn irq_ack(_n: u32) {}

    fn context_init(
        ctx: &mut RegisterContext,
        entry: usize,
        stack_top: usize,
        arg: usize,
    ) {
        ctx.0[0..8].copy_from_slice(&(entry as u64).to_le_bytes());
        ctx.0[8..16].copy_from_slice(&(stack_top as u64).to_le_bytes());
        ctx.0[16..24].copy_from_slice(&(arg as u64).to_le_bytes());
    }

    unsafe fn context_switch(_prev: &mut RegisterContext, _next: &RegisterContext) {
        // A host test never actually jumps to user code; this just
        // documents that the scheduler invoked a switch.
    }

    unsafe fn stack_trace(_out: &mut [usize]) -> usize {
        0
    }

    pub fn ops() -> HalOps {
        HalOps {
            current_cpu_id,
            cpu_count,
            cpu_idle,
            send_ipi,
            halt,
            disable_interrupts,
            enable_interrupts,
            timestamp_ns,
            boot_time_ns,
            timer_init,
            timer_set_oneshot,
            address_space_create,
            address_space_destroy,
            map,
            unmap,
            protect,
            translate,
            validate_user_range,
            irq_register,
            irq_enable,
            irq_disable,
            irq_ack,
            context_init,
            context_switch,
            stack_trace,
        }
    }

    /// Advances the fake monotonic clock; used by scheduler tick tests to
    /// simulate the passage of time without a real timer IRQ.
    pub fn advance_clock_ns(delta: u64) {
        CLOCK.fetch_add(delta, Ordering::Relaxed);
    }

    /// Installs the fake HAL exactly once per test process. Safe to call
    /// from multiple tests; only the first call registers it.
    pub fn install_once() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            super::register(ops());
        });
    }
}
