// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! System-call dispatch (spec §4.8, component C9).
//!
//! Binds the numbered table of §6 to the subsystems above. The five-step
//! contract is fixed: range-check the number, copy in any user buffers
//! after validating them against the caller's address space, resolve
//! capability arguments through the caller's handle table, invoke the
//! handler, copy out results and translate errors to the §7 taxonomy. No
//! step is skipped even for a syscall this core does not implement -- an
//! out-of-scope number still range-checks cleanly and fails with a
//! taxonomy error rather than panicking.

use alloc::vec::Vec;

use orion_abi::{CapRights, CapType, Error, HandleId, KResult, Pid, Sysnum, Tid};

use crate::cap;
use crate::hal::{self, AddressSpaceId};
use crate::ipc::{self, MessageKind, SendOutcome, RecvOutcome};
use crate::process::{self, MemoryLayout};
use crate::sched;

/// Up to six register-width arguments, the common trap-frame shape on every
/// architecture this core targets (spec §6 doesn't mandate a count; six
/// mirrors the HAL's own `context_init(entry, stack_top, arg)` plus room for
/// growth without widening the trap frame).
pub type Args = [u64; 6];

/// Everything dispatch needs about the caller that the trap entry already
/// knows: which process and thread trapped in, and the address space to
/// validate user pointers against.
#[derive(Copy, Clone)]
pub struct Caller {
    pub pid: Pid,
    pub tid: Tid,
    pub address_space: AddressSpaceId,
}

/// Encodes a [`KResult<u64>`] the way a trap return value is encoded: the
/// low 32 bits of a negative return carry the error kind, mirroring the
/// syscall-return convention of `-errno` rather than an out-parameter,
/// since the trap frame has only one return register.
pub fn encode_result(result: KResult<u64>) -> i64 {
    match result {
        Ok(v) => v as i64,
        Err(e) => -(e.to_raw() as i64),
    }
}

/// Step 1-5 of the dispatch contract. `now_ns` is sampled once by the trap
/// entry (not re-read per syscall) so nested diagnostics see a consistent
/// timestamp.
pub fn dispatch(raw_num: u32, caller: Caller, args: Args, now_ns: u64) -> KResult<u64> {
    let sysnum = Sysnum::try_from(raw_num)?;
    match sysnum {
        Sysnum::Exit => sys_exit(caller, args[0] as i32),
        Sysnum::Yield => sys_yield(caller),
        Sysnum::ProcCreate => sys_proc_create(caller, args),
        Sysnum::ThreadCreate => sys_thread_create(caller, args),
        Sysnum::Wait => sys_wait(caller),
        Sysnum::Signal => sys_signal(caller, args),
        Sysnum::GetPid => Ok(caller.pid.get()),
        Sysnum::GetTid => Ok(caller.tid.get()),

        Sysnum::PortCreate => Ok(ipc::create(caller.pid)),
        Sysnum::PortSend => sys_port_send(caller, args, now_ns),
        Sysnum::PortRecv => sys_port_recv(caller, args, now_ns),
        Sysnum::PortShare => sys_port_share(caller, args),
        Sysnum::MsgForward => Err(Error::InvalidArgument),

        Sysnum::ClockGet => Ok(now_ns),
        Sysnum::NanoSleep => sys_nanosleep(caller, args, now_ns),

        Sysnum::ObjDup => sys_obj_dup(caller, args),
        Sysnum::ObjClose => sys_obj_close(caller, args),
        Sysnum::ObjInfo => sys_obj_info(caller, args),

        Sysnum::CapGrant => sys_cap_grant(caller, args),
        Sysnum::CapRevoke => sys_cap_revoke(caller, args),
        Sysnum::CapQuery => sys_cap_query(caller, args),

        // Memory (C3), I/O, sandboxing, audit and entropy are external
        // collaborators per spec §1 ("explicitly out of scope"); the
        // numbers are real and range-check, but no handler lives in this
        // core, so every one of them fails with `not-found` rather than
        // silently succeeding or panicking.
        Sysnum::VmMap
        | Sysnum::VmUnmap
        | Sysnum::VmProtect
        | Sysnum::ShmCreate
        | Sysnum::ShmAttach
        | Sysnum::ShmDetach
        | Sysnum::Madvise
        | Sysnum::TimerCreate
        | Sysnum::TimerStart
        | Sysnum::TimerStop
        | Sysnum::Open
        | Sysnum::IoSubmit
        | Sysnum::IoPoll
        | Sysnum::IoCancel
        | Sysnum::SandboxLoad
        | Sysnum::AuditEmit
        | Sysnum::Info
        | Sysnum::DbgTrace
        | Sysnum::Random => Err(Error::NotFound),
    }
}

/// Validates `[va, va+len)` against the caller's address space and reads it
/// into an owned buffer.
///
/// # Safety invariant
/// The copy itself is only reachable after `validate_user_range` has
/// confirmed the range is mapped, readable, and user-accessible; this
/// mirrors a production kernel's `copy_from_user`, which is also just a
/// validated `memcpy` once permissions are confirmed.
fn copy_in(as_id: AddressSpaceId, va: usize, len: usize) -> KResult<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if !(hal::get().validate_user_range)(as_id, va, len, false) {
        return Err(Error::InvalidArgument);
    }
    let mut buf = alloc::vec![0u8; len];
    // SAFETY: range validated immediately above for this exact (va, len).
    unsafe {
        core::ptr::copy_nonoverlapping(va as *const u8, buf.as_mut_ptr(), len);
    }
    Ok(buf)
}

/// Validates `[va, va+data.len())` for write access and copies `data` out.
fn copy_out(as_id: AddressSpaceId, va: usize, data: &[u8]) -> KResult<()> {
    if data.is_empty() {
        return Ok(());
    }
    if !(hal::get().validate_user_range)(as_id, va, data.len(), true) {
        return Err(Error::InvalidArgument);
    }
    // SAFETY: range validated immediately above for this exact (va, len).
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), va as *mut u8, data.len());
    }
    Ok(())
}

fn sys_exit(caller: Caller, exit_code: i32) -> KResult<u64> {
    sched::remove_from_rq(caller.tid).ok();
    process::retire_thread(caller.tid)?;
    process::with_process_mut(caller.pid, |p| p.exit_code = Some(exit_code))?;
    Ok(0)
}

fn sys_yield(caller: Caller) -> KResult<u64> {
    let cpu = process::with_thread(caller.tid, |t| t.assigned_cpu)?.unwrap_or(0);
    sched::yield_now(cpu);
    Ok(0)
}

/// `args`: [layout_va, layout_len, argv_va, argv_len, envp_va, envp_len].
/// Argument/environment blobs are copied in as opaque byte vectors and
/// split on NUL by the handler, mirroring the flat argv/envp blob a real
/// ELF loader hands the kernel.
fn sys_proc_create(caller: Caller, args: Args) -> KResult<u64> {
    let as_id = caller.address_space;
    let raw_layout = copy_in(as_id, args[0] as usize, args[1] as usize)?;
    let layout = decode_memory_layout(&raw_layout)?;
    let argv_blob = copy_in(as_id, args[2] as usize, args[3] as usize)?;
    let envp_blob = copy_in(as_id, args[4] as usize, args[5] as usize)?;
    let pid = process::create_process(
        Some(caller.pid),
        layout,
        split_nul(&argv_blob),
        split_nul(&envp_blob),
    )?;
    Ok(pid.get())
}

fn decode_memory_layout(raw: &[u8]) -> KResult<MemoryLayout> {
    const FIELD_COUNT: usize = 8;
    if raw.len() != FIELD_COUNT * 8 {
        return Err(Error::InvalidArgument);
    }
    let mut fields = [0usize; FIELD_COUNT];
    for (i, field) in fields.iter_mut().enumerate() {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw[i * 8..i * 8 + 8]);
        *field = u64::from_le_bytes(bytes) as usize;
    }
    Ok(MemoryLayout {
        code_base: fields[0],
        code_size: fields[1],
        data_base: fields[2],
        data_size: fields[3],
        heap_base: fields[4],
        heap_size: fields[5],
        stack_base: fields[6],
        stack_size: fields[7],
    })
}

fn split_nul(blob: &[u8]) -> Vec<Vec<u8>> {
    blob.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_vec())
        .collect()
}

/// `args`: [entry, stack_top, stack_size, arg, priority, affinity].
fn sys_thread_create(caller: Caller, args: Args) -> KResult<u64> {
    let priority = i8::try_from(args[4] as i64).map_err(|_| Error::InvalidArgument)?;
    let tid = process::create_thread(
        caller.pid,
        args[0] as usize,
        args[1] as usize,
        args[2] as usize,
        args[3] as usize,
        priority,
        args[5],
    )?;
    sched::add_to_rq(tid)?;
    Ok(tid.get())
}

fn sys_wait(caller: Caller) -> KResult<u64> {
    process::with_process(caller.pid, |p| {
        if p.children.is_empty() {
            Err(Error::NotFound)
        } else {
            Ok(p.children[0].get())
        }
    })?
}

/// `args`: [signal_bit].
fn sys_signal(caller: Caller, args: Args) -> KResult<u64> {
    let bit = 1u64.checked_shl(args[0] as u32).ok_or(Error::InvalidArgument)?;
    process::with_process_mut(caller.pid, |p| p.pending_signals |= bit)?;
    Ok(0)
}

/// `args`: [port_handle, payload_va, payload_len, caps_va, caps_count, flags].
/// `flags` bit 0 is nonblock; the timeout (nanoseconds, 0 = none) rides in
/// the unused high 32 bits since send takes no seventh register in this
/// trap-frame shape.
fn sys_port_send(caller: Caller, args: Args, now_ns: u64) -> KResult<u64> {
    let as_id = caller.address_space;
    let port_handle = HandleId(args[0] as u32);
    let port_id = resolve_port(caller.pid, port_handle, CapRights::WRITE)?;

    let payload = copy_in(as_id, args[1] as usize, args[2] as usize)?;
    let caps_raw = copy_in(as_id, args[3] as usize, (args[4] as usize) * 4)?;
    let caps = decode_handles(&caps_raw)?;

    let nonblock = args[5] & 1 != 0;
    let timeout_ns = if args[5] >> 32 != 0 { Some(args[5] >> 32) } else { None };

    let outcome = ipc::send(
        port_id,
        caller.pid,
        caller.tid,
        MessageKind::Data,
        &payload,
        &caps,
        None,
        nonblock,
        timeout_ns,
        now_ns,
    )?;
    match outcome {
        SendOutcome::Delivered | SendOutcome::Queued => Ok(0),
        SendOutcome::Blocked { deadline_ns } => {
            // The thread is already marked `Blocked` and parked on the
            // port's FIFO; sleep_until removes it from its runqueue so it
            // actually stops running rather than spinning back in with a
            // stale `WouldBlock`. The eventual completion (delivered or
            // failed) is collected from `ipc::take_completion` by whatever
            // resumes the thread after `wakeup`.
            sched::sleep_until(caller.tid, deadline_ns.unwrap_or(u64::MAX))?;
            Err(Error::WouldBlock)
        }
    }
}

/// `args`: [port_handle, buf_va, buf_len, caps_out_va, caps_out_max, flags].
/// On success the message payload (truncated to `buf_len`, which must be
/// large enough or the call fails without consuming -- spec §4.7) is
/// copied to `buf_va`, and transferred capability handles are copied to
/// `caps_out_va`.
fn sys_port_recv(caller: Caller, args: Args, now_ns: u64) -> KResult<u64> {
    let as_id = caller.address_space;
    let port_handle = HandleId(args[0] as u32);
    let port_id = resolve_port(caller.pid, port_handle, CapRights::READ)?;

    let capacity = args[2] as usize;
    let nonblock = args[5] & 1 != 0;
    let timeout_ns = if args[5] >> 32 != 0 { Some(args[5] >> 32) } else { None };

    let outcome = ipc::receive(
        port_id,
        caller.pid,
        caller.tid,
        capacity,
        nonblock,
        timeout_ns,
        now_ns,
    )?;
    match outcome {
        RecvOutcome::Delivered(message) => {
            copy_out(as_id, args[1] as usize, &message.payload)?;
            let caps_out_max = args[4] as usize;
            let n = message.caps.len().min(caps_out_max);
            let mut encoded = Vec::with_capacity(n * 4);
            for h in &message.caps[..n] {
                encoded.extend_from_slice(&h.0.to_le_bytes());
            }
            copy_out(as_id, args[3] as usize, &encoded)?;
            Ok(message.payload.len() as u64)
        }
        RecvOutcome::Blocked { deadline_ns } => {
            sched::sleep_until(caller.tid, deadline_ns.unwrap_or(u64::MAX))?;
            Err(Error::WouldBlock)
        }
    }
}

/// `args`: [port_handle, target_pid, rights].
fn sys_port_share(caller: Caller, args: Args) -> KResult<u64> {
    let port_handle = HandleId(args[0] as u32);
    let cap_id = process::with_process(caller.pid, |p| {
        p.handles.lookup(port_handle, CapType::IpcPort, CapRights::GRANT)
    })??;
    let target = Pid::new(args[1]).ok_or(Error::InvalidArgument)?;
    let rights = CapRights::from_bits_truncate(args[2] as u32);
    let handle = process::with_process(target, |p| p.handles.open(cap_id, rights))??;
    Ok(handle.0 as u64)
}

fn resolve_port(pid: Pid, handle: HandleId, required: CapRights) -> KResult<u64> {
    let cap_id = process::with_process(pid, |p| p.handles.lookup(handle, CapType::IpcPort, required))??;
    let (_, object_id, _, _) = cap::inspect(cap_id)?;
    Ok(object_id)
}

fn decode_handles(raw: &[u8]) -> KResult<Vec<HandleId>> {
    if raw.len() % 4 != 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(raw
        .chunks_exact(4)
        .map(|c| HandleId(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
        .collect())
}

/// `args`: [deadline_ns].
fn sys_nanosleep(caller: Caller, args: Args, now_ns: u64) -> KResult<u64> {
    let deadline = now_ns + args[0];
    sched::sleep_until(caller.tid, deadline)?;
    Ok(0)
}

/// `args`: [handle].
fn sys_obj_dup(caller: Caller, args: Args) -> KResult<u64> {
    let handle = HandleId(args[0] as u32);
    process::with_process(caller.pid, |p| p.handles.dup(handle))??;
    Ok(0)
}

/// `args`: [handle].
fn sys_obj_close(caller: Caller, args: Args) -> KResult<u64> {
    let handle = HandleId(args[0] as u32);
    process::with_process(caller.pid, |p| p.handles.close(handle))??;
    Ok(0)
}

/// `args`: [handle, out_va]. Writes a (type: u32, rights: u32) pair to
/// `out_va`.
fn sys_obj_info(caller: Caller, args: Args) -> KResult<u64> {
    let handle = HandleId(args[0] as u32);
    let cap_id = process::with_process(caller.pid, |p| p.handles.lookup_any(handle, CapRights::empty()))??;
    let (cap_type, _object_id, rights, _owner) = cap::inspect(cap_id)?;
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(cap_type_raw(cap_type)).to_le_bytes());
    out[4..8].copy_from_slice(&rights.bits().to_le_bytes());
    copy_out(caller.address_space, args[1] as usize, &out)?;
    Ok(0)
}

fn cap_type_raw(t: CapType) -> u32 {
    match t {
        CapType::Memory => 0,
        CapType::IpcPort => 1,
        CapType::Process => 2,
        CapType::Thread => 3,
        CapType::File => 4,
        CapType::Directory => 5,
        CapType::Device => 6,
        CapType::NetworkSocket => 7,
        CapType::Timer => 8,
        CapType::SecurityContext => 9,
        CapType::CryptoKey => 10,
        CapType::HardwareResource => 11,
    }
}

/// `args`: [handle, rights].
fn sys_cap_grant(caller: Caller, args: Args) -> KResult<u64> {
    let handle = HandleId(args[0] as u32);
    let cap_id = process::with_process(caller.pid, |p| p.handles.lookup_any(handle, CapRights::GRANT))??;
    let rights = CapRights::from_bits_truncate(args[1] as u32);
    let narrowed = cap::grant(cap_id, rights, caller.pid)?;
    Ok(narrowed.bits() as u64)
}

/// `args`: [handle].
fn sys_cap_revoke(caller: Caller, args: Args) -> KResult<u64> {
    let handle = HandleId(args[0] as u32);
    let cap_id = process::with_process(caller.pid, |p| p.handles.lookup_any(handle, CapRights::REVOKE))??;
    cap::revoke(cap_id, caller.pid, caller.pid)?;
    Ok(0)
}

/// `args`: [handle]. Returns the rights bitmap, or an error if the handle
/// is stale (lazily cleared per spec §4.4).
fn sys_cap_query(caller: Caller, args: Args) -> KResult<u64> {
    let handle = HandleId(args[0] as u32);
    if process::with_process(caller.pid, |p| p.handles.clear_if_stale(handle))? {
        return Err(Error::BadHandle);
    }
    let cap_id = process::with_process(caller.pid, |p| p.handles.lookup_any(handle, CapRights::empty()))??;
    let (_, _, rights, _) = cap::inspect(cap_id)?;
    Ok(rights.bits() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        hal::fake::install_once();
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

    fn spawn() -> Caller {
        let pid = process::create_process(None, layout(), Vec::new(), Vec::new()).unwrap();
        let tid = process::create_thread(pid, 0x1000, 0xA000, 0x1000, 0, 0, u64::MAX).unwrap();
        sched::add_to_rq(tid).unwrap();
        let address_space = process::with_process(pid, |p| p.address_space).unwrap();
        Caller { pid, tid, address_space }
    }

    #[test]
    fn unknown_syscall_number_is_invalid_argument() {
        setup();
        let caller = spawn();
        assert_eq!(
            dispatch(8, caller, [0; 6], 0),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            dispatch(60, caller, [0; 6], 0),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn out_of_scope_syscall_fails_with_not_found_not_panic() {
        setup();
        let caller = spawn();
        assert_eq!(dispatch(10, caller, [0; 6], 0), Err(Error::NotFound)); // VmMap
        assert_eq!(dispatch(52, caller, [0; 6], 0), Err(Error::NotFound)); // Random
    }

    #[test]
    fn getpid_gettid_echo_the_caller() {
        setup();
        let caller = spawn();
        assert_eq!(dispatch(6, caller, [0; 6], 0), Ok(caller.pid.get()));
        assert_eq!(dispatch(7, caller, [0; 6], 0), Ok(caller.tid.get()));
    }

    #[test]
    fn port_create_then_send_recv_round_trips_through_handles() {
        setup();
        let sender = spawn();
        let receiver = spawn();

        let port_id = dispatch(20, sender, [0; 6], 0).unwrap(); // PortCreate
        let cap_id = cap::create(CapType::IpcPort, port_id, CapRights::all(), sender.pid);
        let send_handle = process::with_process(sender.pid, |p| {
            p.handles.open(cap_id, CapRights::WRITE).unwrap()
        })
        .unwrap();
        let recv_handle = process::with_process(receiver.pid, |p| {
            p.handles.open(cap_id, CapRights::READ).unwrap()
        })
        .unwrap();

        let payload = b"hi".to_vec();
        let mut send_args = [0u64; 6];
        send_args[0] = send_handle.0 as u64;
        send_args[1] = payload.as_ptr() as u64;
        send_args[2] = payload.len() as u64;
        let r = dispatch(21, sender, send_args, 0); // PortSend
        assert!(r.is_ok());

        let mut recv_buf = [0u8; 8];
        let mut recv_args = [0u64; 6];
        recv_args[0] = recv_handle.0 as u64;
        recv_args[1] = recv_buf.as_mut_ptr() as u64;
        recv_args[2] = recv_buf.len() as u64;
        let n = dispatch(22, receiver, recv_args, 0).unwrap(); // PortRecv
        assert_eq!(n, 2);
        assert_eq!(&recv_buf[..2], b"hi");
    }

    #[test]
    fn obj_close_of_bad_handle_is_bad_handle_not_panic() {
        setup();
        let caller = spawn();
        let mut args = [0u64; 6];
        args[0] = 9999;
        assert_eq!(dispatch(42, caller, args, 0), Err(Error::BadHandle)); // ObjClose
    }

    #[test]
    fn cap_query_reports_revoked_handle_as_bad_handle() {
        setup();
        let caller = spawn();
        let cap_id = cap::create(CapType::Memory, 1, CapRights::READ, caller.pid);
        let handle =
            process::with_process(caller.pid, |p| p.handles.open(cap_id, CapRights::READ).unwrap())
                .unwrap();
        cap::destroy(cap_id).unwrap();
        let mut args = [0u64; 6];
        args[0] = handle.0 as u64;
        assert_eq!(dispatch(47, caller, args, 0), Err(Error::BadHandle)); // CapQuery
    }

    #[test]
    fn encode_result_maps_error_to_negative_raw_code() {
        assert_eq!(encode_result(Ok(7)), 7);
        assert_eq!(encode_result(Err(Error::BadHandle)), -(Error::BadHandle.to_raw() as i64));
    }
}
