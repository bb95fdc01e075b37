// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPC ports: bounded message queues with synchronous rendezvous, capability
//! transfer, and a lightweight notification path (spec §4.7, component C8).
//!
//! A port's three FIFOs (pending messages, blocked senders, blocked
//! receivers) are guarded by one lock per port, matching the lock-ordering
//! rule in spec §5 ("process-table < process < port < runqueue <
//! handle-table"). While that lock is held nothing here may suspend: the
//! blocking case instead records the waiter and returns, leaving the actual
//! suspension to [`crate::sched::sleep_until`], called after the port lock
//! is dropped.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use orion_abi::{CapId, CapRights, CapType, Error, HandleId, KResult, Pid, Tid};

use crate::cap;
use crate::config::{MAX_MESSAGE_BYTES, MAX_TRANSFERRED_CAPS, PORT_QUEUE_DEPTH, PORT_WAITER_DEPTH};
use crate::process;
use crate::sched;
use crate::spinlock::SpinLock;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MessageKind {
    Data,
    Capability,
    Page,
    Interrupt,
}

#[derive(Clone, Debug)]
pub struct PageRef {
    pub address_space: crate::hal::AddressSpaceId,
    pub va: usize,
    pub len: usize,
}

#[derive(Clone, Debug)]
pub struct Message {
    pub sender: Pid,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub caps: Vec<HandleId>,
    pub page: Option<PageRef>,
    pub timestamp_ns: u64,
}

struct BlockedSender {
    tid: Tid,
    message: Message,
    deadline_ns: Option<u64>,
}

struct BlockedReceiver {
    tid: Tid,
    capacity: usize,
    deadline_ns: Option<u64>,
}

/// Outcome returned to the thread that called one-shot, racing-free in its
/// own call: the completed transfer if rendezvous/queueing happened inline,
/// or a marker telling the caller it must suspend via [`crate::sched`] and
/// later retrieve the result with [`take_completion`].
#[derive(Debug)]
pub enum SendOutcome {
    Delivered,
    Queued,
    /// The caller must call `sched::sleep_until(tid, deadline)` and later
    /// poll [`take_completion`] once woken.
    Blocked { deadline_ns: Option<u64> },
}

#[derive(Debug)]
pub enum RecvOutcome {
    Delivered(Message),
    Blocked { deadline_ns: Option<u64> },
}

/// What a previously blocked sender or receiver eventually resolves to.
#[derive(Debug)]
pub enum Completion {
    SendDelivered,
    RecvDelivered(Message),
    TimedOut,
    PortDestroyed,
    /// A message arrived for a blocked receiver whose buffer was too small
    /// to hold it; the receiver is woken with the error rather than left
    /// parked, since leaving it parked would otherwise force the sender's
    /// message into `messages` alongside a still-blocked receiver, which
    /// the port's FIFO mutual-exclusion invariant forbids.
    Failed(Error),
}

struct Port {
    owner: Pid,
    messages: VecDeque<Message>,
    blocked_senders: VecDeque<BlockedSender>,
    blocked_receivers: VecDeque<BlockedReceiver>,
    notify_mask: u64,
    notify_waiters: VecDeque<(Tid, u64)>,
    destroyed: bool,
}

impl Port {
    fn new(owner: Pid) -> Self {
        Port {
            owner,
            messages: VecDeque::new(),
            blocked_senders: VecDeque::new(),
            blocked_receivers: VecDeque::new(),
            notify_mask: 0,
            notify_waiters: VecDeque::new(),
            destroyed: false,
        }
    }
}

struct Registry {
    ports: BTreeMap<u64, SpinLock<Port>>,
}

static REGISTRY: SpinLock<Registry> = SpinLock::new(Registry { ports: BTreeMap::new() });
static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);
static COMPLETIONS: SpinLock<BTreeMap<u64, Completion>> = SpinLock::new(BTreeMap::new());

fn store_completion(tid: Tid, completion: Completion) {
    COMPLETIONS.lock().insert(tid.get(), completion);
}

/// Retrieves and clears the completion recorded for `tid` once it has been
/// woken from a blocked send/receive. Returns `None` if nothing is ready
/// yet (spurious wake) or `tid` never blocked.
pub fn take_completion(tid: Tid) -> Option<Completion> {
    COMPLETIONS.lock().remove(&tid.get())
}

/// Creates a port owned by `owner`, returning the raw object id a
/// capability record can reference (spec §3: the port itself is addressed
/// only through a capability of type [`CapType::IpcPort`]).
pub fn create(owner: Pid) -> u64 {
    let raw = NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed);
    REGISTRY.lock().ports.insert(raw, SpinLock::new(Port::new(owner)));
    raw
}

/// Registers the [`cap::DestroyHook`] that tears a port down when its
/// capability record is destroyed. Call once during kernel bring-up.
pub fn install_destroy_hook() {
    cap::register_destroy_hook(CapType::IpcPort, destroy);
}

/// Tears a port down: any blocked sender or receiver is woken with
/// [`Completion::PortDestroyed`], and the port is removed from the
/// registry. Matches spec §4.7's `port-destroyed` terminal state.
fn destroy(port_id: u64) {
    let removed = REGISTRY.lock().ports.remove(&port_id);
    let Some(port_lock) = removed else { return };
    let mut port = port_lock.lock();
    port.destroyed = true;
    for waiter in port.blocked_senders.drain(..) {
        store_completion(waiter.tid, Completion::PortDestroyed);
        let _ = sched::wakeup(waiter.tid);
    }
    for waiter in port.blocked_receivers.drain(..) {
        store_completion(waiter.tid, Completion::PortDestroyed);
        let _ = sched::wakeup(waiter.tid);
    }
}

fn with_port<R>(port_id: u64, f: impl FnOnce(&mut Port) -> R) -> KResult<R> {
    let registry = REGISTRY.lock();
    let port_lock = registry.ports.get(&port_id).ok_or(Error::BadHandle)?;
    let mut port = port_lock.lock();
    Ok(f(&mut port))
}

/// Opens handles in `receiver`'s handle table for each capability named by
/// `caps` (the sender's own handle ids). Atomic: if any transfer fails, the
/// handles opened so far are closed before returning the error, per spec
/// §4.7 ("either all capabilities arrive or none").
fn transfer_caps(sender: Pid, receiver: Pid, caps: &[HandleId]) -> KResult<Vec<HandleId>> {
    if caps.len() > MAX_TRANSFERRED_CAPS {
        return Err(Error::InvalidArgument);
    }
    let mut opened = Vec::with_capacity(caps.len());
    for &handle in caps {
        let result = (|| -> KResult<HandleId> {
            let cap_id: CapId = process::with_process(sender, |p| {
                // The sender must hold GRANT on the capability it is handing
                // over; any expected type is acceptable here since the
                // receiver re-derives its own type check on next lookup.
                p.handles.lookup_any(handle, CapRights::GRANT)
            })??;
            process::with_process_mut(receiver, |p| p.handles.open(cap_id, CapRights::all()))?
        })();
        match result {
            Ok(new_handle) => opened.push(new_handle),
            Err(e) => {
                for h in opened.drain(..) {
                    let _ = process::with_process_mut(receiver, |p| p.handles.close(h));
                }
                return Err(e);
            }
        }
    }
    Ok(opened)
}

/// Synchronous send (spec §4.7 "Send"). `sender_tid` is the calling
/// thread, used only if it must block.
#[allow(clippy::too_many_arguments)]
pub fn send(
    port_id: u64,
    sender: Pid,
    sender_tid: Tid,
    kind: MessageKind,
    payload: &[u8],
    caps: &[HandleId],
    page: Option<PageRef>,
    nonblock: bool,
    timeout_ns: Option<u64>,
    now_ns: u64,
) -> KResult<SendOutcome> {
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(Error::InvalidArgument);
    }

    if caps.len() > MAX_TRANSFERRED_CAPS {
        return Err(Error::InvalidArgument);
    }
    // Capability handles travel as the sender's own ids until the message
    // actually reaches a receiver; `deliver_with_caps` swaps them for
    // freshly opened receiver-side handles at that point.
    let message = Message {
        sender,
        kind,
        payload: payload.to_vec(),
        caps: caps.to_vec(),
        page,
        timestamp_ns: now_ns,
    };

    enum Step {
        Rendezvous(BlockedReceiver),
        ReceiverTooSmall(BlockedReceiver),
        Queued,
        Blocked,
    }

    let step = with_port(port_id, |port| {
        if port.destroyed {
            return Err(Error::BadHandle);
        }
        if let Some(front) = port.blocked_receivers.front() {
            // A receiver is already parked, so the FIFOs' mutual-exclusion
            // invariant forbids queuing here too. If the waiting receiver's
            // buffer is too small for this message, fail the receiver with
            // `InvalidArgument` (mirroring the same-size check `receive`
            // itself makes) and wake it, rather than let a message sit in
            // `messages` alongside a parked receiver.
            let waiter = port.blocked_receivers.pop_front().unwrap();
            if message.payload.len() <= front.capacity {
                return Ok(Step::Rendezvous(waiter));
            }
            return Ok(Step::ReceiverTooSmall(waiter));
        }
        if port.messages.len() < PORT_QUEUE_DEPTH {
            port.messages.push_back(message.clone());
            return Ok(Step::Queued);
        }
        if nonblock {
            return Err(Error::WouldBlock);
        }
        let deadline_ns = timeout_ns.map(|t| now_ns + t);
        if port.blocked_senders.len() >= PORT_WAITER_DEPTH {
            return Err(Error::NoSpace);
        }
        port.blocked_senders.push_back(BlockedSender {
            tid: sender_tid,
            message: message.clone(),
            deadline_ns,
        });
        Ok(Step::Blocked)
    })??;

    match step {
        Step::Rendezvous(waiter) => {
            // Rendezvous: hand the message (with caps transferred into the
            // specific receiver) directly to the oldest blocked receiver.
            let delivered = deliver_with_caps(waiter.tid_process(), message)?;
            store_completion(waiter.tid, Completion::RecvDelivered(delivered));
            sched::wakeup(waiter.tid)?;
            Ok(SendOutcome::Delivered)
        }
        Step::ReceiverTooSmall(waiter) => {
            store_completion(waiter.tid, Completion::Failed(Error::InvalidArgument));
            sched::wakeup(waiter.tid)?;
            Err(Error::InvalidArgument)
        }
        Step::Queued => {
            // Queued without a transfer target yet; capabilities travel
            // with the message (as the sender's own handle ids) and are
            // opened against the eventual receiver at recv() time. Validate
            // the sender holds GRANT now so a bad cap id fails fast.
            for &h in caps {
                process::with_process(sender, |p| p.handles.lookup_any(h, CapRights::GRANT))??;
            }
            Ok(SendOutcome::Queued)
        }
        Step::Blocked => {
            let deadline_ns = timeout_ns.map(|t| now_ns + t);
            process::with_thread_mut(sender_tid, |t| t.state = process::ThreadState::Blocked)?;
            Ok(SendOutcome::Blocked { deadline_ns })
        }
    }
}

impl BlockedReceiver {
    /// Receivers block on a port, not on behalf of a specific process id at
    /// rendezvous time; the process owning the thread is what capability
    /// transfer actually needs, so this looks it up lazily.
    fn tid_process(&self) -> Pid {
        process::with_thread(self.tid, |t| t.process).unwrap_or_else(|_| {
            Pid::new(1).expect("pid 1 is a valid fallback for an unresolvable receiver")
        })
    }
}

/// Finalizes delivery of `message` to `receiver`: opens receiver-side
/// handles for every capability the sender attached (replacing
/// `message.caps`, which until now held the sender's own handle ids).
fn deliver_with_caps(receiver: Pid, mut message: Message) -> KResult<Message> {
    let opened = transfer_caps(message.sender, receiver, &message.caps)?;
    message.caps = opened;
    Ok(message)
}

/// Synchronous receive (spec §4.7 "Receive"). `capacity` is the size of the
/// caller's output buffer; if the pending message is larger the call fails
/// without consuming it.
pub fn receive(
    port_id: u64,
    receiver: Pid,
    receiver_tid: Tid,
    capacity: usize,
    nonblock: bool,
    timeout_ns: Option<u64>,
    now_ns: u64,
) -> KResult<RecvOutcome> {
    let outcome = with_port(port_id, |port| {
        if port.destroyed {
            return Err(Error::BadHandle);
        }
        if let Some(waiter) = port.blocked_senders.front() {
            if waiter.message.payload.len() > capacity {
                return Err(Error::InvalidArgument);
            }
            let waiter = port.blocked_senders.pop_front().unwrap();
            return Ok((Some(waiter), None));
        }
        if let Some(front) = port.messages.front() {
            if front.payload.len() > capacity {
                return Err(Error::InvalidArgument);
            }
            let message = port.messages.pop_front().unwrap();
            return Ok((None, Some(message)));
        }
        if nonblock {
            return Err(Error::WouldBlock);
        }
        let deadline_ns = timeout_ns.map(|t| now_ns + t);
        if port.blocked_receivers.len() >= PORT_WAITER_DEPTH {
            return Err(Error::NoSpace);
        }
        port.blocked_receivers.push_back(BlockedReceiver {
            tid: receiver_tid,
            capacity,
            deadline_ns,
        });
        Ok((None, None))
    })??;

    match outcome {
        (Some(sender_wait), None) => {
            let delivered = deliver_with_caps(receiver, sender_wait.message)?;
            store_completion(sender_wait.tid, Completion::SendDelivered);
            sched::wakeup(sender_wait.tid)?;
            Ok(RecvOutcome::Delivered(delivered))
        }
        (None, Some(message)) => {
            let delivered = deliver_with_caps(receiver, message)?;
            Ok(RecvOutcome::Delivered(delivered))
        }
        (None, None) => {
            let deadline_ns = timeout_ns.map(|t| now_ns + t);
            process::with_thread_mut(receiver_tid, |t| t.state = process::ThreadState::Blocked)?;
            Ok(RecvOutcome::Blocked { deadline_ns })
        }
        _ => unreachable!(),
    }
}

/// Scans every port's blocked-sender/-receiver FIFOs and times out any
/// whose deadline has passed `now_ns`. Intended to be driven periodically
/// (e.g. from the same housekeeping pass that calls
/// [`crate::process::reap_quiesced_threads`]).
pub fn expire_timeouts(now_ns: u64) {
    let registry = REGISTRY.lock();
    for port_lock in registry.ports.values() {
        let mut port = port_lock.lock();
        let mut expired = Vec::new();
        port.blocked_senders.retain(|w| match w.deadline_ns {
            Some(d) if d <= now_ns => {
                expired.push(w.tid);
                false
            }
            _ => true,
        });
        port.blocked_receivers.retain(|w| match w.deadline_ns {
            Some(d) if d <= now_ns => {
                expired.push(w.tid);
                false
            }
            _ => true,
        });
        drop(port);
        for tid in expired {
            store_completion(tid, Completion::TimedOut);
            let _ = sched::wakeup(tid);
        }
    }
}

/// OR-accumulates `bits` into the port's notification mask and wakes any
/// thread parked in [`wait_notification`] whose interest mask intersects.
/// Notifications never queue (spec §4.7): a bit set while no one is
/// waiting simply stays set until consumed.
pub fn notify(port_id: u64, bits: u64) -> KResult<()> {
    let woken = with_port(port_id, |port| {
        port.notify_mask |= bits;
        let mask = port.notify_mask;
        let mut woken = Vec::new();
        port.notify_waiters.retain(|&(tid, interest)| {
            if mask & interest != 0 {
                woken.push(tid);
                false
            } else {
                true
            }
        });
        woken
    })?;
    for tid in woken {
        let _ = sched::wakeup(tid);
    }
    Ok(())
}

/// Waits for any bit in `interest` to be set in the port's notification
/// mask, consuming (clearing) only the bits returned. Chosen resolution of
/// spec §9's open question on multi-event semantics: a waiter never
/// silently swallows bits another waiter's interest didn't cover.
pub fn wait_notification(port_id: u64, tid: Tid, interest: u64, now_ns: u64) -> KResult<u64> {
    with_port(port_id, |port| {
        let ready = port.notify_mask & interest;
        if ready != 0 {
            port.notify_mask &= !ready;
            Ok(ready)
        } else {
            port.notify_waiters.push_back((tid, interest));
            let _ = now_ns;
            Err(Error::WouldBlock)
        }
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MemoryLayout;

    fn setup() {
        crate::hal::fake::install_once();
    }

    fn layout() -> MemoryLayout {
        MemoryLayout::default()
    }

    fn spawn() -> (Pid, Tid) {
        let pid = process::create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
        let tid = process::create_thread(pid, 0x1000, 0xA000, 0x1000, 0, 0, u64::MAX).unwrap();
        (pid, tid)
    }

    #[test]
    fn rendezvous_delivers_directly_to_blocked_receiver() {
        setup();
        let (owner, _) = spawn();
        let port_id = create(owner);
        let (receiver_pid, receiver_tid) = spawn();
        let (sender_pid, sender_tid) = spawn();

        let r = receive(port_id, receiver_pid, receiver_tid, 64, false, None, 0).unwrap();
        assert!(matches!(r, RecvOutcome::Blocked { .. }));

        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let s = send(
            port_id, sender_pid, sender_tid, MessageKind::Data, &payload, &[], None, false, None, 0,
        )
        .unwrap();
        assert!(matches!(s, SendOutcome::Delivered));

        match take_completion(receiver_tid).unwrap() {
            Completion::RecvDelivered(msg) => {
                assert_eq!(msg.payload.as_slice(), &payload[..]);
                assert_eq!(msg.sender, sender_pid);
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn send_without_waiting_receiver_queues_then_recv_drains_it() {
        setup();
        let (owner, _) = spawn();
        let port_id = create(owner);
        let (sender_pid, sender_tid) = spawn();
        let (receiver_pid, receiver_tid) = spawn();

        let s = send(
            port_id,
            sender_pid,
            sender_tid,
            MessageKind::Data,
            b"hello",
            &[],
            None,
            false,
            None,
            0,
        )
        .unwrap();
        assert!(matches!(s, SendOutcome::Queued));

        let r = receive(port_id, receiver_pid, receiver_tid, 64, false, None, 0).unwrap();
        match r {
            RecvOutcome::Delivered(msg) => assert_eq!(msg.payload.as_slice(), b"hello"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn full_queue_with_nonblock_returns_would_block() {
        setup();
        let (owner, _) = spawn();
        let port_id = create(owner);
        let (sender_pid, sender_tid) = spawn();

        for _ in 0..PORT_QUEUE_DEPTH {
            send(
                port_id, sender_pid, sender_tid, MessageKind::Data, b"x", &[], None, false, None, 0,
            )
            .unwrap();
        }
        let result = send(
            port_id, sender_pid, sender_tid, MessageKind::Data, b"x", &[], None, true, None, 0,
        );
        assert_eq!(result.unwrap_err(), Error::WouldBlock);
    }

    #[test]
    fn blocking_sender_times_out_after_deadline() {
        setup();
        let (owner, _) = spawn();
        let port_id = create(owner);
        let (sender_pid, sender_tid) = spawn();

        for _ in 0..PORT_QUEUE_DEPTH {
            send(
                port_id, sender_pid, sender_tid, MessageKind::Data, b"x", &[], None, false, None, 0,
            )
            .unwrap();
        }
        let outcome = send(
            port_id,
            sender_pid,
            sender_tid,
            MessageKind::Data,
            b"late",
            &[],
            None,
            false,
            Some(10_000_000),
            0,
        )
        .unwrap();
        assert!(matches!(outcome, SendOutcome::Blocked { .. }));

        expire_timeouts(5_000_000);
        assert!(take_completion(sender_tid).is_none());

        expire_timeouts(10_000_000);
        assert!(matches!(take_completion(sender_tid), Some(Completion::TimedOut)));
    }

    #[test]
    fn port_destroy_wakes_blocked_receiver_as_port_destroyed() {
        setup();
        let (owner, _) = spawn();
        let port_id = create(owner);
        let (receiver_pid, receiver_tid) = spawn();

        receive(port_id, receiver_pid, receiver_tid, 64, false, None, 0).unwrap();
        destroy(port_id);
        assert!(matches!(take_completion(receiver_tid), Some(Completion::PortDestroyed)));
    }

    #[test]
    fn notification_bits_or_accumulate_and_are_consumed_once() {
        setup();
        let (owner, _) = spawn();
        let port_id = create(owner);
        let (_, tid) = spawn();

        notify(port_id, 0b001).unwrap();
        notify(port_id, 0b010).unwrap();
        let got = wait_notification(port_id, tid, 0b011, 0).unwrap();
        assert_eq!(got, 0b011);
        assert_eq!(
            wait_notification(port_id, tid, 0b011, 0).unwrap_err(),
            Error::WouldBlock
        );
    }
}
