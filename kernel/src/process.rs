// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process and thread lifecycle (spec §4.5, component C6).
//!
//! Processes and threads live in two global arenas keyed by their monotonic,
//! never-reused identifiers (spec §9: "Arena + stable identifiers ... not
//! raw pointers"). Unlike the capability table, no generation/epoch is
//! needed here: a `Pid`/`Tid` is never recycled, so the identifier alone is
//! always unambiguous.
//!
//! Destruction is two-phase (spec §4.5): the caller first detaches a thread
//! from its runqueue (via [`crate::sched::remove_from_rq`]) and calls
//! [`retire_thread`], which marks it terminated and schedules it for
//! reclamation once every CPU has observed a scheduler tick after that point
//! -- see [`quiescence`]. Only then does [`reap_quiesced_threads`] actually
//! free the descriptor.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use orion_abi::{Error, KResult, Pid, Tid};

use crate::config::MAX_PROCESSES;
use crate::hal::{self, RegisterContext};
use crate::handle::HandleTable;
use crate::spinlock::SpinLock;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Stopped,
    Zombie,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThreadState {
    New,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Terminated,
}

#[derive(Copy, Clone, Default, Debug)]
pub struct MemoryLayout {
    pub code_base: usize,
    pub code_size: usize,
    pub data_base: usize,
    pub data_size: usize,
    pub heap_base: usize,
    pub heap_size: usize,
    pub stack_base: usize,
    pub stack_size: usize,
}

pub struct Process {
    pub pid: Pid,
    pub state: ProcessState,
    pub address_space: hal::AddressSpaceId,
    pub threads: Vec<Tid>,
    pub handles: HandleTable,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub layout: MemoryLayout,
    pub argv: Vec<Vec<u8>>,
    pub envp: Vec<Vec<u8>>,
    pub pending_signals: u64,
    pub created_at_ns: u64,
    pub cpu_time_ns: u64,
    pub exit_code: Option<i32>,
}

/// Scheduler-facing fields are `pub(crate)` rather than hidden behind
/// accessors: [`crate::sched`] mutates them directly while holding the
/// thread table lock, the same way it would hold a runqueue lock, to avoid
/// a closure-per-field API for a hot path.
pub struct Thread {
    pub tid: Tid,
    pub process: Pid,
    pub state: ThreadState,
    pub context: RegisterContext,
    pub user_stack_top: usize,
    pub user_stack_size: usize,
    pub(crate) vruntime: u64,
    /// `pub` under `testing` too so the `tests/` integration suite can read
    /// accrued runtime directly rather than through a closure-per-field API.
    #[cfg(any(test, feature = "testing"))]
    pub actual_runtime_ns: u64,
    #[cfg(not(any(test, feature = "testing")))]
    pub(crate) actual_runtime_ns: u64,
    pub(crate) last_switch_time_ns: u64,
    pub priority: i8,
    pub(crate) weight: u64,
    pub(crate) affinity: u64,
    pub(crate) wake_deadline_ns: Option<u64>,
    pub(crate) assigned_cpu: Option<usize>,
}

/// Weight table mapping nice-equivalent priority to scheduling weight.
/// Higher priority (more negative) gets a higher weight and so accrues
/// virtual runtime more slowly; mirrors the shape of the completely-fair
/// weight table referenced by spec §4.6, anchored at [`crate::config::NOMINAL_WEIGHT`]
/// for priority 0 and scaling roughly 1.25x per step, matching the spec's
/// priority-dominance scenario (§8 scenario 2: a 10-step priority gap should
/// yield about a 4x weight ratio; 1.25^10 ≈ 9.3, so we use the classic CFS
/// ladder instead: about 1.15x per step, 1.15^10 ≈ 4.05).
pub fn weight_for_priority(priority: i8) -> u64 {
    use crate::config::NOMINAL_WEIGHT;
    let clamped = priority.clamp(-20, 19) as i32;
    // Fixed-point base of 1.15 scaled by 1024 to stay in integer arithmetic.
    const BASE_NUM: i64 = 1177; // 1.15 * 1024, rounded
    const BASE_DEN: i64 = 1024;
    let mut weight = NOMINAL_WEIGHT as i64;
    if clamped < 0 {
        for _ in 0..(-clamped) {
            weight = weight * BASE_NUM / BASE_DEN;
        }
    } else {
        for _ in 0..clamped {
            weight = weight * BASE_DEN / BASE_NUM;
        }
    }
    weight.max(1) as u64
}

struct ProcessTable {
    processes: BTreeMap<u64, Process>,
}

struct ThreadTable {
    threads: BTreeMap<u64, Thread>,
}

static PROCESSES: SpinLock<ProcessTable> =
    SpinLock::new(ProcessTable { processes: BTreeMap::new() });
static THREADS: SpinLock<ThreadTable> =
    SpinLock::new(ThreadTable { threads: BTreeMap::new() });

static NEXT_PID: AtomicU64 = AtomicU64::new(1);
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

impl ProcessTable {
    fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid.get())
    }
    fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(&pid.get())
    }
}

impl ThreadTable {
    fn get(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(&tid.get())
    }
    fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid.get())
    }
}

/// Creates a new process with no threads yet (state [`ProcessState::New`]).
/// The caller must follow with [`create_thread`] to admit a main thread.
pub fn create_process(
    parent: Option<Pid>,
    layout: MemoryLayout,
    argv: Vec<Vec<u8>>,
    envp: Vec<Vec<u8>>,
) -> KResult<Pid> {
    let mut table = PROCESSES.lock();
    if table.processes.len() >= MAX_PROCESSES {
        return Err(Error::NoSpace);
    }
    let address_space = (hal::get().address_space_create)().ok_or(Error::NoMemory)?;
    let raw = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    let pid = Pid::new(raw).ok_or(Error::Overflow)?;

    let process = Process {
        pid,
        state: ProcessState::New,
        address_space,
        threads: Vec::new(),
        handles: HandleTable::new(),
        parent,
        children: Vec::new(),
        layout,
        argv,
        envp,
        pending_signals: 0,
        created_at_ns: (hal::get().timestamp_ns)(),
        cpu_time_ns: 0,
        exit_code: None,
    };
    table.processes.insert(raw, process);

    if let Some(parent_pid) = parent {
        if let Some(parent_proc) = table.get_mut(parent_pid) {
            parent_proc.children.push(pid);
        }
    }
    Ok(pid)
}

/// Creates a thread in `pid`, initializing its register context so that
/// first dispatch resumes at `entry(arg)` with the stack pointer at
/// `stack_top`. The thread starts in [`ThreadState::Ready`] but is not
/// admitted to any runqueue; the caller must follow with
/// [`crate::sched::add_to_rq`].
pub fn create_thread(
    pid: Pid,
    entry: usize,
    stack_top: usize,
    stack_size: usize,
    arg: usize,
    priority: i8,
    affinity: u64,
) -> KResult<Tid> {
    if !(-20..=19).contains(&priority) {
        return Err(Error::InvalidArgument);
    }
    let stack_base = stack_top.checked_sub(stack_size).ok_or(Error::InvalidArgument)?;

    let address_space = PROCESSES
        .lock()
        .get(pid)
        .map(|p| p.address_space)
        .ok_or(Error::NotFound)?;
    // No physical frame allocator sits under this core yet, so the stack is
    // identity-mapped (va == pa); the architecture port is free to remap it
    // onto a real frame before the thread first runs.
    let mapped = (hal::get().map)(
        address_space,
        stack_base,
        stack_base,
        stack_size,
        hal::MapFlags::READ | hal::MapFlags::WRITE | hal::MapFlags::USER,
    );
    if !mapped {
        return Err(Error::NoMemory);
    }

    let mut context = RegisterContext::default();
    (hal::get().context_init)(&mut context, entry, stack_top, arg);

    let raw = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    let tid = Tid::new(raw).ok_or(Error::Overflow)?;
    let thread = Thread {
        tid,
        process: pid,
        state: ThreadState::Ready,
        context,
        user_stack_top: stack_top,
        user_stack_size: stack_size,
        vruntime: 0,
        actual_runtime_ns: 0,
        last_switch_time_ns: 0,
        priority,
        weight: weight_for_priority(priority),
        affinity,
        wake_deadline_ns: None,
        assigned_cpu: None,
    };

    let mut processes = PROCESSES.lock();
    let process = processes.get_mut(pid).ok_or(Error::NotFound)?;
    process.threads.push(tid);
    if process.state == ProcessState::New {
        process.state = ProcessState::Ready;
    }
    drop(processes);

    THREADS.lock().threads.insert(raw, thread);
    Ok(tid)
}

/// Runs `f` with shared access to `pid`'s process record.
pub fn with_process<R>(pid: Pid, f: impl FnOnce(&Process) -> R) -> KResult<R> {
    let table = PROCESSES.lock();
    table.get(pid).map(f).ok_or(Error::NotFound)
}

/// Runs `f` with exclusive access to `pid`'s process record.
pub fn with_process_mut<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> KResult<R> {
    let mut table = PROCESSES.lock();
    table.get_mut(pid).map(f).ok_or(Error::NotFound)
}

/// Runs `f` with shared access to `tid`'s thread record.
pub fn with_thread<R>(tid: Tid, f: impl FnOnce(&Thread) -> R) -> KResult<R> {
    let table = THREADS.lock();
    table.get(tid).map(f).ok_or(Error::NotFound)
}

/// Runs `f` with exclusive access to `tid`'s thread record.
pub fn with_thread_mut<R>(tid: Tid, f: impl FnOnce(&mut Thread) -> R) -> KResult<R> {
    let mut table = THREADS.lock();
    table.get_mut(tid).map(f).ok_or(Error::NotFound)
}

/// Phase one of thread destruction (spec §4.5). The caller must already
/// have removed `tid` from any runqueue. Marks it terminated and schedules
/// it for reclamation once [`quiescence`] confirms every CPU has ticked
/// since this call.
pub fn retire_thread(tid: Tid) -> KResult<()> {
    with_thread_mut(tid, |t| t.state = ThreadState::Terminated)?;
    let retire_epoch = quiescence::retire_epoch();
    PENDING_REAP.lock().push((tid, retire_epoch));
    Ok(())
}

static PENDING_REAP: SpinLock<Vec<(Tid, u64)>> = SpinLock::new(Vec::new());

/// Phase two: frees every retired thread's descriptor once quiescence has
/// been observed. Intended to be called periodically, e.g. from a tick
/// housekeeping path.
pub fn reap_quiesced_threads() {
    let mut pending = PENDING_REAP.lock();
    let mut remaining = Vec::new();
    for (tid, retire_epoch) in pending.drain(..) {
        if quiescence::all_cpus_passed(retire_epoch) {
            let process_id = THREADS.lock().get(tid).map(|t| t.process);
            THREADS.lock().threads.remove(&tid.get());
            if let Some(pid) = process_id {
                let _ = with_process_mut(pid, |p| {
                    p.threads.retain(|t| *t != tid);
                    if p.threads.is_empty() && p.state != ProcessState::Zombie {
                        p.state = ProcessState::Zombie;
                    }
                });
            }
        } else {
            remaining.push((tid, retire_epoch));
        }
    }
    *pending = remaining;
}

/// Epoch-based reclamation used to let phase-two thread teardown wait until
/// no CPU can still hold a stale pointer to the descriptor being freed
/// (spec §4.5: "once no CPU is still using the descriptor").
pub mod quiescence {
    use crate::config::MAX_CPUS;
    use crate::spinlock::SpinLock;

    struct State {
        epoch: u64,
        per_cpu: [u64; MAX_CPUS],
        cpu_count: usize,
    }

    static STATE: SpinLock<State> =
        SpinLock::new(State { epoch: 1, per_cpu: [0; MAX_CPUS], cpu_count: 1 });

    /// Sets the number of CPUs whose tick we must observe. Called once from
    /// `schedule_init`.
    pub fn init(cpu_count: usize) {
        STATE.lock().cpu_count = cpu_count.min(MAX_CPUS);
    }

    /// Called from the scheduler's tick handler for `cpu`, recording that
    /// this CPU has passed through a tick at the current epoch.
    pub fn observe_tick(cpu: usize) {
        let mut s = STATE.lock();
        let epoch = s.epoch;
        if let Some(slot) = s.per_cpu.get_mut(cpu) {
            *slot = epoch;
        }
    }

    /// Bumps the global epoch and returns the value a retiring thread must
    /// wait for every CPU to reach.
    pub fn retire_epoch() -> u64 {
        let mut s = STATE.lock();
        s.epoch += 1;
        s.epoch
    }

    /// Whether every tracked CPU has observed a tick at or after `epoch`.
    pub fn all_cpus_passed(epoch: u64) -> bool {
        let s = STATE.lock();
        s.per_cpu[..s.cpu_count].iter().all(|&e| e >= epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        crate::hal::fake::install_once();
    }

    fn layout() -> MemoryLayout {
        MemoryLayout {
            code_base: 0x1000,
            code_size: 0x1000,
            data_base: 0x2000,
            data_size: 0x1000,
            heap_base: 0x3000,
            heap_size: 0x1000,
            stack_base: 0x9000,
            stack_size: 0x1000,
        }
    }

    #[test]
    fn create_process_then_thread_admits_main_thread() {
        setup();
        let pid = create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
        let tid = create_thread(pid, 0x1000, 0xA000, 0x1000, 0, 0, u64::MAX).unwrap();
        with_process(pid, |p| {
            assert_eq!(p.threads, alloc::vec![tid]);
            assert_eq!(p.state, ProcessState::Ready);
        })
        .unwrap();
    }

    #[test]
    fn create_thread_rejects_out_of_range_priority() {
        setup();
        let pid = create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
        assert_eq!(
            create_thread(pid, 0x1000, 0xA000, 0x1000, 0, 20, 1),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            create_thread(pid, 0x1000, 0xA000, 0x1000, 0, -21, 1),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn weight_decreases_monotonically_with_priority() {
        let high = weight_for_priority(-5);
        let nominal = weight_for_priority(0);
        let low = weight_for_priority(5);
        assert!(high > nominal);
        assert!(nominal > low);
    }

    #[test]
    fn priority_dominance_ratio_is_about_four() {
        let hi = weight_for_priority(-5) as f64;
        let lo = weight_for_priority(5) as f64;
        let ratio = hi / lo;
        assert!(ratio > 3.5 && ratio < 4.6, "ratio was {ratio}");
    }

    #[test]
    fn retire_then_reap_frees_thread_after_quiescence() {
        setup();
        quiescence::init(2);
        let pid = create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
        let tid = create_thread(pid, 0x1000, 0xA000, 0x1000, 0, 0, u64::MAX).unwrap();

        retire_thread(tid).unwrap();
        reap_quiesced_threads();
        // Not quiesced yet: thread still resolvable.
        assert!(with_thread(tid, |_| ()).is_ok());

        quiescence::observe_tick(0);
        quiescence::observe_tick(1);
        reap_quiesced_threads();
        assert_eq!(with_thread(tid, |_| ()), Err(Error::NotFound));
        with_process(pid, |p| assert!(p.threads.is_empty())).unwrap();
    }
}
