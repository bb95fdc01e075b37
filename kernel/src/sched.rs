// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Completely-Fair-Scheduler-style per-CPU scheduler (spec §4.6, component
//! C7).
//!
//! Each CPU's ready threads are kept in a `BTreeMap<(vruntime, tid), ()>` --
//! an ordered tree giving the same "leftmost is next to run" property the
//! specification asks of a red-black tree, without hand-rolling tree
//! rebalancing that could not be exercised against a real test run in this
//! exercise. `(vruntime, tid)` as the key (rather than `vruntime` alone)
//! breaks ties between threads that land on the exact same virtual runtime.
//!
//! Thread fields that change here (`vruntime`, `weight`, `affinity`, ...)
//! are owned by [`crate::process`]; this module only holds the ordering
//! structure and the bookkeeping (`running_count`, `min_vruntime`, ...)
//! that is properly a runqueue's, per spec §3's data model.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use orion_abi::{Error, KResult, Tid};

use crate::config::{
    LOAD_BALANCE_INTERVAL_TICKS, LOAD_BALANCE_THRESHOLD_PERCENT, MAX_CPUS, NOMINAL_WEIGHT,
    SLICE_BUDGET_TICKS,
};
use crate::hal;
use crate::process::{self, ThreadState};
use crate::spinlock::SpinLock;

struct RunQueue {
    tree: alloc::collections::BTreeMap<(u64, u64), ()>,
    current: Option<Tid>,
    running_count: usize,
    min_vruntime: u64,
    total_weight: u64,
    last_update_ns: u64,
    reschedule_needed: bool,
    ticks_since_balance: u32,
    /// Wake-deadline list for sleeping threads on this CPU. A plain `Vec`
    /// scanned on tick stands in for the "earliest-deadline wakeup wheel (or
    /// delta list)" the spec allows as an implementation choice.
    sleepers: Vec<(u64, Tid)>,
}

impl RunQueue {
    const fn new() -> Self {
        RunQueue {
            tree: alloc::collections::BTreeMap::new(),
            current: None,
            running_count: 0,
            min_vruntime: 0,
            total_weight: 0,
            last_update_ns: 0,
            reschedule_needed: false,
            ticks_since_balance: 0,
            sleepers: Vec::new(),
        }
    }
}

const EMPTY_RUNQUEUE: SpinLock<RunQueue> = SpinLock::new(RunQueue::new());
static RUNQUEUES: [SpinLock<RunQueue>; MAX_CPUS] = [EMPTY_RUNQUEUE; MAX_CPUS];
static CPU_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Initializes per-CPU runqueues for every CPU the HAL reports present.
pub fn schedule_init() {
    let cpu_count = (hal::get().cpu_count)().min(MAX_CPUS);
    CPU_COUNT.store(cpu_count, Ordering::SeqCst);
    let now = (hal::get().timestamp_ns)();
    for cpu in 0..cpu_count {
        let mut rq = RUNQUEUES[cpu].lock();
        *rq = RunQueue::new();
        rq.last_update_ns = now;
    }
    process::quiescence::init(cpu_count);
}

fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::SeqCst)
}

fn choose_cpu(affinity: u64) -> KResult<usize> {
    let n = cpu_count();
    if n == 0 {
        return Err(Error::InvalidArgument);
    }
    let mut best: Option<(usize, u64)> = None;
    for cpu in 0..n {
        if affinity & (1 << cpu) == 0 {
            continue;
        }
        let load = RUNQUEUES[cpu].lock().total_weight;
        best = match best {
            Some((_, best_load)) if best_load <= load => best,
            _ => Some((cpu, load)),
        };
    }
    best.map(|(cpu, _)| cpu).ok_or(Error::InvalidArgument)
}

/// Admits `tid` to a runqueue. Picks the CPU among `tid`'s affinity set with
/// the least load weight (ties broken by lowest CPU id), sets its vruntime
/// to `max(thread.vruntime, rq.min_vruntime)`, and inserts it into the tree.
pub fn add_to_rq(tid: Tid) -> KResult<()> {
    let (affinity, weight) = process::with_thread(tid, |t| (t.affinity, t.weight))?;
    let cpu = choose_cpu(affinity)?;

    let mut rq = RUNQUEUES[cpu].lock();
    let vruntime = process::with_thread_mut(tid, |t| {
        let v = t.vruntime.max(rq.min_vruntime);
        t.vruntime = v;
        t.state = ThreadState::Ready;
        t.assigned_cpu = Some(cpu);
        v
    })?;
    rq.tree.insert((vruntime, tid.get()), ());
    rq.running_count += 1;
    rq.total_weight += weight;
    Ok(())
}

/// Removes `tid` from whatever runqueue it is on (a no-op, returning `Ok`,
/// if it is not currently enqueued -- e.g. it is the CPU's `current`, or
/// already blocked/sleeping).
pub fn remove_from_rq(tid: Tid) -> KResult<()> {
    let (vruntime, weight, assigned_cpu) =
        process::with_thread(tid, |t| (t.vruntime, t.weight, t.assigned_cpu))?;
    let Some(cpu) = assigned_cpu else {
        return Ok(());
    };
    let mut rq = RUNQUEUES[cpu].lock();
    if rq.tree.remove(&(vruntime, tid.get())).is_some() {
        rq.running_count = rq.running_count.saturating_sub(1);
        rq.total_weight = rq.total_weight.saturating_sub(weight);
        // min_vruntime only ever advances (spec §3 invariant): a thread
        // leaving can't pull it backward.
        if let Some((&(leftmost, _), _)) = rq.tree.iter().next() {
            rq.min_vruntime = rq.min_vruntime.max(leftmost);
        }
    }
    Ok(())
}

/// Returns the leftmost (smallest-vruntime) thread, removing it from the
/// tree and installing it as the CPU's `current`. `None` means "run the
/// idle thread" (spec §4.6 `pick_next`).
pub fn pick_next(cpu: usize) -> Option<Tid> {
    let mut rq = RUNQUEUES[cpu].lock();
    let key = rq.tree.keys().next().copied();
    let Some((vruntime, tid_raw)) = key else {
        return None;
    };
    rq.tree.remove(&(vruntime, tid_raw));
    let tid = Tid::new(tid_raw).expect("tid keys are always nonzero");
    rq.current = Some(tid);
    let _ = process::with_thread_mut(tid, |t| t.state = ThreadState::Running);
    Some(tid)
}

/// Fixed-frequency timer tick for `cpu`. Advances the current thread's
/// runtime accounting and sets the reschedule-needed flag if a cheaper
/// thread is waiting or the slice budget is exhausted.
pub fn tick(cpu: usize) {
    let now = (hal::get().timestamp_ns)();
    let mut rq = RUNQUEUES[cpu].lock();
    let dt = now.saturating_sub(rq.last_update_ns);
    rq.last_update_ns = now;

    if let Some(current) = rq.current {
        let (new_vruntime, over_budget) = process::with_thread_mut(current, |t| {
            t.actual_runtime_ns += dt;
            t.vruntime += dt.saturating_mul(NOMINAL_WEIGHT) / t.weight.max(1);
            let slice_ns = (SLICE_BUDGET_TICKS as u64) * tick_period_ns_estimate(dt);
            (t.vruntime, t.actual_runtime_ns % slice_ns.max(1) < dt)
        })
        .unwrap_or((0, false));

        let cheaper_waiting = rq
            .tree
            .keys()
            .next()
            .map(|&(v, _)| v < new_vruntime)
            .unwrap_or(false);
        if cheaper_waiting || over_budget {
            rq.reschedule_needed = true;
        }
    }

    rq.ticks_since_balance += 1;
    let should_balance = rq.ticks_since_balance >= LOAD_BALANCE_INTERVAL_TICKS;
    if should_balance {
        rq.ticks_since_balance = 0;
    }
    drop(rq);

    process::quiescence::observe_tick(cpu);
    process::reap_quiesced_threads();
    wake_due_sleepers(cpu, now);
    if should_balance {
        maybe_load_balance(cpu);
    }
}

/// `tick`'s slice-budget check needs a notion of "one tick" in nanoseconds;
/// rather than thread a configured Hz through every call, approximate it
/// from the delta just observed when it's nonzero, falling back to 1 ms
/// (the cadence every concrete scenario in this crate's tests uses).
fn tick_period_ns_estimate(dt: u64) -> u64 {
    if dt == 0 {
        1_000_000
    } else {
        dt
    }
}

/// Whether CPU `cpu` has a pending reschedule request set by [`tick`].
pub fn reschedule_needed(cpu: usize) -> bool {
    RUNQUEUES[cpu].lock().reschedule_needed
}

/// Performs the actual preemption `tick` flagged: re-admits the current
/// thread (at its now-advanced vruntime) and picks a new one. Returns
/// `(previous, next)` thread ids for the caller to hand to
/// [`context_switch`]. A no-op (returns `None`) if no reschedule is
/// pending.
pub fn preempt_if_needed(cpu: usize) -> Option<(Option<Tid>, Option<Tid>)> {
    {
        let mut rq = RUNQUEUES[cpu].lock();
        if !rq.reschedule_needed {
            return None;
        }
        rq.reschedule_needed = false;
    }
    let prev = RUNQUEUES[cpu].lock().current.take();
    if let Some(p) = prev {
        let _ = add_to_rq(p);
    }
    let next = pick_next(cpu);
    Some((prev, next))
}

/// Voluntary yield: re-admits the current thread at its current vruntime
/// and switches to the next-leftmost. Returns the same `(previous, next)`
/// shape as [`preempt_if_needed`] for symmetry.
pub fn yield_now(cpu: usize) -> (Option<Tid>, Option<Tid>) {
    let prev = RUNQUEUES[cpu].lock().current.take();
    if let Some(p) = prev {
        let _ = add_to_rq(p);
    }
    let next = pick_next(cpu);
    (prev, next)
}

/// Transitions `tid` to sleeping with a wake deadline, removing it from its
/// runqueue's ready tree. Valid from any state; the caller is expected to
/// have already been the CPU's `current` or otherwise off the tree.
pub fn sleep_until(tid: Tid, deadline_ns: u64) -> KResult<()> {
    remove_from_rq(tid)?;
    let cpu = process::with_thread_mut(tid, |t| {
        t.state = ThreadState::Sleeping;
        t.wake_deadline_ns = Some(deadline_ns);
        t.assigned_cpu
    })?;
    if let Some(cpu) = cpu {
        let mut rq = RUNQUEUES[cpu].lock();
        if rq.current == Some(tid) {
            rq.current = None;
        }
        rq.sleepers.push((deadline_ns, tid));
    }
    Ok(())
}

/// Wakes `tid` if it is sleeping or blocked; a spurious wake against an
/// already-ready thread is a documented no-op (spec §4.6 edge case).
pub fn wakeup(tid: Tid) -> KResult<()> {
    let state = process::with_thread(tid, |t| t.state)?;
    match state {
        ThreadState::Sleeping | ThreadState::Blocked => {}
        _ => return Ok(()),
    }
    if let Some(cpu) = process::with_thread(tid, |t| t.assigned_cpu)? {
        RUNQUEUES[cpu].lock().sleepers.retain(|&(_, t)| t != tid);
    }
    process::with_thread_mut(tid, |t| t.wake_deadline_ns = None)?;
    add_to_rq(tid)
}

fn wake_due_sleepers(cpu: usize, now: u64) {
    let due: Vec<Tid> = {
        let mut rq = RUNQUEUES[cpu].lock();
        let mut due = Vec::new();
        rq.sleepers.retain(|&(deadline, tid)| {
            if deadline <= now {
                due.push(tid);
                false
            } else {
                true
            }
        });
        due
    };
    for tid in due {
        let _ = wakeup(tid);
    }
}

/// Saves `prev`'s register context (if any) and loads `next`'s (if any),
/// delegating the actual architectural switch to the HAL.
///
/// # Safety
/// Must only be called with `prev` and `next` both quiesced with respect to
/// interrupts on this CPU, per [`hal::HalOps::context_switch`]'s contract.
pub unsafe fn context_switch(prev: Option<Tid>, next: Option<Tid>) -> KResult<()> {
    let next_ctx = match next {
        Some(n) => process::with_thread(n, |t| t.context)?,
        None => hal::RegisterContext::default(),
    };
    let mut prev_ctx = match prev {
        Some(p) => process::with_thread(p, |t| t.context)?,
        None => hal::RegisterContext::default(),
    };
    (hal::get().context_switch)(&mut prev_ctx, &next_ctx);
    if let Some(p) = prev {
        process::with_thread_mut(p, |t| {
            t.context = prev_ctx;
            t.last_switch_time_ns = (hal::get().timestamp_ns)();
        })?;
    }
    if let Some(n) = next {
        process::with_thread_mut(n, |t| t.last_switch_time_ns = (hal::get().timestamp_ns)())?;
    }
    Ok(())
}

/// On a low-frequency cadence (every [`LOAD_BALANCE_INTERVAL_TICKS`] ticks),
/// a CPU whose load weight exceeds the cross-CPU mean by more than
/// [`LOAD_BALANCE_THRESHOLD_PERCENT`] may have its rightmost (most-costly)
/// thread stolen by a less-loaded peer, provided affinity permits landing
/// there.
fn maybe_load_balance(this_cpu: usize) {
    let n = cpu_count();
    if n < 2 {
        return;
    }
    let loads: Vec<u64> = (0..n).map(|c| RUNQUEUES[c].lock().total_weight).collect();
    let mean = loads.iter().sum::<u64>() / n as u64;
    if mean == 0 {
        return;
    }
    let Some((peer, &peer_load)) = loads
        .iter()
        .enumerate()
        .filter(|&(c, _)| c != this_cpu)
        .max_by_key(|&(_, l)| *l)
    else {
        return;
    };
    if peer_load <= mean || (peer_load - mean) * 100 / mean <= LOAD_BALANCE_THRESHOLD_PERCENT {
        return;
    }

    let stolen = {
        let mut peer_rq = RUNQUEUES[peer].lock();
        let Some((&(vr, tid_raw), _)) = peer_rq.tree.iter().next_back() else {
            return;
        };
        let tid = Tid::new(tid_raw).expect("tid keys are always nonzero");
        let allowed = process::with_thread(tid, |t| t.affinity & (1 << this_cpu) != 0)
            .unwrap_or(false);
        if !allowed {
            return;
        }
        peer_rq.tree.remove(&(vr, tid_raw));
        let weight = process::with_thread(tid, |t| t.weight).unwrap_or(0);
        peer_rq.running_count = peer_rq.running_count.saturating_sub(1);
        peer_rq.total_weight = peer_rq.total_weight.saturating_sub(weight);
        (tid, vr, weight)
    };

    let (tid, vruntime, weight) = stolen;
    let mut my_rq = RUNQUEUES[this_cpu].lock();
    let v = vruntime.max(my_rq.min_vruntime);
    my_rq.tree.insert((v, tid.get()), ());
    my_rq.running_count += 1;
    my_rq.total_weight += weight;
    drop(my_rq);
    let _ = process::with_thread_mut(tid, |t| {
        t.vruntime = v;
        t.assigned_cpu = Some(this_cpu);
    });
}

/// Snapshot used by tests and `obj-info`-style introspection. Exposed under
/// the `testing` feature too (not just `cfg(test)`) so the `tests/`
/// integration suite -- which links this crate as an ordinary external
/// dependency -- can assert the runqueue invariants directly.
#[cfg(any(test, feature = "testing"))]
pub struct RunQueueSnapshot {
    pub running_count: usize,
    pub tree_len: usize,
    pub has_current: bool,
    pub min_vruntime: u64,
}

#[cfg(any(test, feature = "testing"))]
pub fn snapshot(cpu: usize) -> RunQueueSnapshot {
    let rq = RUNQUEUES[cpu].lock();
    RunQueueSnapshot {
        running_count: rq.running_count,
        tree_len: rq.tree.len(),
        has_current: rq.current.is_some(),
        min_vruntime: rq.min_vruntime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MemoryLayout;

    fn setup() -> usize {
        hal::fake::install_once();
        schedule_init();
        cpu_count()
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

    fn spawn(priority: i8, affinity: u64) -> Tid {
        let pid = process::create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
        process::create_thread(pid, 0x1000, 0xA000, 0x1000, 0, priority, affinity).unwrap()
    }

    #[test]
    fn running_count_invariant_holds_after_add_and_pick() {
        setup();
        let t1 = spawn(0, 1);
        add_to_rq(t1).unwrap();
        let snap = snapshot(0);
        assert_eq!(snap.running_count, snap.tree_len + if snap.has_current { 1 } else { 0 });

        pick_next(0);
        let snap = snapshot(0);
        assert_eq!(snap.running_count, snap.tree_len + if snap.has_current { 1 } else { 0 });
    }

    #[test]
    fn thread_never_in_more_than_one_runqueue() {
        setup();
        let t1 = spawn(0, 0b11);
        add_to_rq(t1).unwrap();
        let owner_count = (0..2)
            .filter(|&c| {
                let rq = RUNQUEUES[c].lock();
                rq.tree.iter().any(|(&(_, tid), _)| tid == t1.get())
            })
            .count();
        assert_eq!(owner_count, 1);
    }

    #[test]
    fn min_vruntime_is_monotone_after_removal() {
        setup();
        let t1 = spawn(0, 1);
        let t2 = spawn(0, 1);
        add_to_rq(t1).unwrap();
        add_to_rq(t2).unwrap();
        let before = snapshot(0).min_vruntime;
        remove_from_rq(t1).unwrap();
        let after = snapshot(0).min_vruntime;
        assert!(after >= before);
    }

    #[test]
    fn spurious_wakeup_on_ready_thread_is_noop() {
        setup();
        let t1 = spawn(0, 1);
        add_to_rq(t1).unwrap();
        assert_eq!(wakeup(t1), Ok(()));
        let snap = snapshot(0);
        assert_eq!(snap.tree_len, 1);
    }

    #[test]
    fn two_equal_priority_threads_split_runtime_evenly() {
        setup();
        let t1 = spawn(0, 1);
        let t2 = spawn(0, 1);
        add_to_rq(t1).unwrap();
        add_to_rq(t2).unwrap();

        let mut current = pick_next(0);
        for _ in 0..1000 {
            hal::fake::advance_clock_ns(1_000_000);
            tick(0);
            if let Some((_, next)) = preempt_if_needed(0) {
                current = next;
            }
        }
        let _ = current;

        let rt1 = process::with_thread(t1, |t| t.actual_runtime_ns).unwrap();
        let rt2 = process::with_thread(t2, |t| t.actual_runtime_ns).unwrap();
        let total = rt1 + rt2;
        assert!(total >= 999_000_000 && total <= 1_000_000_000, "total={total}");
        let share1 = rt1 as f64 / total as f64;
        assert!(share1 > 0.45 && share1 < 0.55, "share1={share1}");
    }

    #[test]
    fn priority_dominance_gives_higher_priority_more_runtime() {
        setup();
        let hi = spawn(-5, 1);
        let lo = spawn(5, 1);
        add_to_rq(hi).unwrap();
        add_to_rq(lo).unwrap();

        pick_next(0);
        for _ in 0..1000 {
            hal::fake::advance_clock_ns(1_000_000);
            tick(0);
            preempt_if_needed(0);
        }

        let rt_hi = process::with_thread(hi, |t| t.actual_runtime_ns).unwrap();
        let rt_lo = process::with_thread(lo, |t| t.actual_runtime_ns).unwrap();
        assert!(rt_hi > rt_lo, "hi={rt_hi} lo={rt_lo}");
        let share_hi = rt_hi as f64 / (rt_hi + rt_lo) as f64;
        assert!(share_hi > 0.7, "share_hi={share_hi}");
    }

    #[test]
    fn sleep_then_wakeup_returns_to_ready_tree() {
        setup();
        let t1 = spawn(0, 1);
        add_to_rq(t1).unwrap();
        pick_next(0);
        sleep_until(t1, 5_000_000).unwrap();
        assert_eq!(process::with_thread(t1, |t| t.state).unwrap(), ThreadState::Sleeping);

        wakeup(t1).unwrap();
        assert_eq!(process::with_thread(t1, |t| t.state).unwrap(), ThreadState::Ready);
        assert_eq!(snapshot(0).tree_len, 1);
    }

    #[test]
    fn tick_wakes_sleeper_past_deadline() {
        setup();
        let t1 = spawn(0, 1);
        add_to_rq(t1).unwrap();
        pick_next(0);
        sleep_until(t1, 3_000_000).unwrap();

        hal::fake::advance_clock_ns(4_000_000);
        tick(0);

        assert_eq!(process::with_thread(t1, |t| t.state).unwrap(), ThreadState::Ready);
    }
}
