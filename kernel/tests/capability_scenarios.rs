//! Concrete capability scenario (scenario 5): grant then revoke, observed
//! through the syscall surface rather than `cap`/`handle` directly, so the
//! lazy-clear contract on the granted process's own handle gets exercised
//! too.

use orion_abi::{CapRights, CapType};
use orion_kernel::cap;
use orion_kernel::hal;
use orion_kernel::process::{self, MemoryLayout};
use orion_kernel::syscall::{self, Caller};

fn setup() {
    hal::fake::install_once();
}

fn layout() -> MemoryLayout {
    MemoryLayout::default()
}

fn spawn() -> Caller {
    let pid = process::create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
    let tid = process::create_thread(pid, 0x1000, 0xA000, 0x1000, 0, 0, u64::MAX).unwrap();
    let address_space = process::with_process(pid, |p| p.address_space).unwrap();
    Caller { pid, tid, address_space }
}

#[test]
fn revoke_after_grant_turns_the_grantees_next_query_into_bad_handle() {
    setup();
    let p1 = spawn();
    let p2 = spawn();

    let cap_id = cap::create(
        CapType::Memory,
        1,
        CapRights::READ | CapRights::WRITE | CapRights::REVOKE | CapRights::GRANT,
        p1.pid,
    );
    let p1_handle =
        process::with_process(p1.pid, |p| p.handles.open(cap_id, CapRights::all())).unwrap().unwrap();
    let p2_handle =
        process::with_process(p2.pid, |p| p.handles.open(cap_id, CapRights::READ)).unwrap().unwrap();

    // CapQuery (47) on p2 succeeds before revoke.
    let mut query_args = [0u64; 6];
    query_args[0] = p2_handle.0 as u64;
    let before = syscall::dispatch(47, p2, query_args, 0).unwrap();
    assert_eq!(before, CapRights::READ.bits() as u64);

    // p1 revokes via CapRevoke (48) on its own handle.
    let mut revoke_args = [0u64; 6];
    revoke_args[0] = p1_handle.0 as u64;
    syscall::dispatch(48, p1, revoke_args, 0).unwrap();

    // p2's next query observes the epoch bump as bad-handle (lazy clear).
    let after = syscall::dispatch(47, p2, query_args, 0);
    assert_eq!(after, Err(orion_abi::Error::BadHandle));

    // Revoking twice is idempotent from p1's side too.
    assert!(syscall::dispatch(48, p1, revoke_args, 0).is_ok());
}
