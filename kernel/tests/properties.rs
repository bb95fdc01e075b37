//! Property-based tests for the invariants and laws listed as "testable
//! properties": runqueue accounting, handle reference counts, capability
//! revoke idempotence, and the IPC send/recv round trip.

use orion_abi::CapRights;
use orion_kernel::cap;
use orion_kernel::hal;
use orion_kernel::handle::HandleTable;
use orion_kernel::ipc::{self, Completion, MessageKind, RecvOutcome, SendOutcome};
use orion_kernel::process::{self, MemoryLayout};
use orion_kernel::sched;
use proptest::prelude::*;

fn setup_sched() {
    hal::fake::install_once();
    sched::schedule_init();
}

fn layout() -> MemoryLayout {
    MemoryLayout::default()
}

fn spawn_ready() -> orion_abi::Tid {
    let pid = process::create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
    process::create_thread(pid, 0x1000, 0xA000, 0x1000, 0, 0, u64::MAX).unwrap()
}

proptest! {
    /// For every runqueue at rest: `running_count == tree_size + (1 if
    /// current else 0)`, across arbitrary sequences of admit/pick/remove.
    #[test]
    fn runqueue_accounting_invariant_holds(ops in proptest::collection::vec(0u8..3, 1..40)) {
        setup_sched();
        let mut live = Vec::new();
        for op in ops {
            match op {
                0 => live.push(spawn_ready()),
                1 => {
                    if let Some(tid) = live.pop() {
                        let _ = sched::add_to_rq(tid);
                    }
                }
                _ => {
                    let _ = sched::pick_next(0);
                }
            }
        }
        let snap = sched::snapshot(0);
        prop_assert_eq!(
            snap.running_count,
            snap.tree_len + if snap.has_current { 1 } else { 0 }
        );
    }

    /// `cap_revoke` of an already-revoked capability returns ok (idempotence
    /// law), for arbitrary rights masks.
    #[test]
    fn revoke_is_idempotent_for_any_rights_mask(rights_bits in any::<u32>()) {
        let owner = orion_abi::Pid::new(1).unwrap();
        let rights = CapRights::from_bits_truncate(rights_bits) | CapRights::REVOKE;
        let id = cap::create(orion_abi::CapType::Memory, 1, rights, owner);
        prop_assert!(cap::revoke(id, owner, owner).is_ok());
        prop_assert_eq!(cap::revoke(id, owner, owner), Ok(()));
    }

    /// `handle_close` of an already-closed handle returns bad-handle
    /// (idempotence law, the asymmetric counterpart to `cap_revoke`).
    #[test]
    fn handle_close_of_already_closed_handle_is_bad_handle(rights_bits in any::<u32>()) {
        let owner = orion_abi::Pid::new(1).unwrap();
        let rights = CapRights::from_bits_truncate(rights_bits);
        let cap_id = cap::create(orion_abi::CapType::Memory, 2, rights, owner);
        let table = HandleTable::new();
        let handle = table.open(cap_id, rights).unwrap();
        prop_assert!(table.close(handle).is_ok());
        prop_assert_eq!(table.close(handle), Err(orion_abi::Error::BadHandle));
    }

    /// Round trip: `port_send(p, data)` followed by `port_recv(p, buf)`
    /// (sufficient buf) yields `buf == data` and the sender's pid, for
    /// arbitrary payloads up to a modest size.
    #[test]
    fn send_then_recv_round_trips_arbitrary_payloads(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
        hal::fake::install_once();
        let owner_pid = process::create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
        let port_id = ipc::create(owner_pid);
        let sender_pid = process::create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
        let sender_tid =
            process::create_thread(sender_pid, 0x1000, 0xA000, 0x1000, 0, 0, u64::MAX).unwrap();
        let receiver_pid = process::create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
        let receiver_tid =
            process::create_thread(receiver_pid, 0x1000, 0xA000, 0x1000, 0, 0, u64::MAX).unwrap();

        let sent = ipc::send(
            port_id,
            sender_pid,
            sender_tid,
            MessageKind::Data,
            &payload,
            &[],
            None,
            false,
            None,
            0,
        )
        .unwrap();

        let delivered = match sent {
            SendOutcome::Queued => {
                match ipc::receive(port_id, receiver_pid, receiver_tid, payload.len().max(1), false, None, 0)
                    .unwrap()
                {
                    RecvOutcome::Delivered(m) => m,
                    other => panic!("expected delivery, got {other:?}"),
                }
            }
            SendOutcome::Delivered => unreachable!("no receiver was blocked yet"),
            SendOutcome::Blocked { .. } => panic!("queue should never be full for one message"),
        };

        prop_assert_eq!(delivered.payload, payload);
        prop_assert_eq!(delivered.sender, sender_pid);
    }
}

#[test]
fn blocked_receiver_round_trip_law_also_holds() {
    hal::fake::install_once();
    let owner = process::create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
    let port_id = ipc::create(owner);
    let receiver_pid = process::create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
    let receiver_tid =
        process::create_thread(receiver_pid, 0x1000, 0xA000, 0x1000, 0, 0, u64::MAX).unwrap();
    let sender_pid = process::create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
    let sender_tid =
        process::create_thread(sender_pid, 0x1000, 0xA000, 0x1000, 0, 0, u64::MAX).unwrap();

    ipc::receive(port_id, receiver_pid, receiver_tid, 64, false, None, 0).unwrap();
    let data = b"round trip data".to_vec();
    ipc::send(
        port_id,
        sender_pid,
        sender_tid,
        MessageKind::Data,
        &data,
        &[],
        None,
        false,
        None,
        0,
    )
    .unwrap();

    match ipc::take_completion(receiver_tid).unwrap() {
        Completion::RecvDelivered(message) => {
            assert_eq!(message.payload, data);
            assert_eq!(message.sender, sender_pid);
        }
        other => panic!("expected a delivered completion, got {other:?}"),
    }
}
