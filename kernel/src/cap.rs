// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability table (spec §4.3, component C4).
//!
//! One arena slot per kernel object a capability names. A slot's epoch is
//! bumped on revoke and on destroy-then-reuse, so any [`orion_abi::CapId`]
//! computed before the bump mismatches on its next [`check`] -- this is the
//! whole revocation mechanism, not a side effect of one.
//!
//! Per-process narrowing (which rights a given process's *handle* presents)
//! lives in [`crate::handle`]; this module only tracks the ceiling rights an
//! object was created or granted with, and the single owning PID.

use alloc::vec::Vec;

use orion_abi::{CapId, CapRights, CapType, Error, KResult, Pid};

use crate::spinlock::SpinLock;

struct Record {
    cap_type: CapType,
    object_id: u64,
    rights: CapRights,
    owner: Pid,
}

struct Slot {
    record: Option<Record>,
    epoch: u32,
}

/// Type-specific teardown invoked by [`destroy`]. Registered once per
/// `CapType` during kernel bring-up, mirroring the HAL's boot-time
/// registration pattern (`port -> close port`, `memory -> unmap`, ...).
pub type DestroyHook = fn(object_id: u64);

const NUM_CAP_TYPES: usize = 12;

struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    hooks: [Option<DestroyHook>; NUM_CAP_TYPES],
}

impl Table {
    const fn new() -> Self {
        Table { slots: Vec::new(), free: Vec::new(), hooks: [None; NUM_CAP_TYPES] }
    }
}

static TABLE: SpinLock<Table> = SpinLock::new(Table::new());

fn type_index(t: CapType) -> usize {
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

/// Registers the teardown hook invoked by [`destroy`] for every capability
/// of type `cap_type`. Must be called at most once per type during bring-up.
pub fn register_destroy_hook(cap_type: CapType, hook: DestroyHook) {
    let mut table = TABLE.lock();
    let idx = type_index(cap_type);
    assert!(table.hooks[idx].is_none(), "destroy hook already registered for this type");
    table.hooks[idx] = Some(hook);
}

/// Allocates a capability record and returns the identifier naming it
/// (table index + current epoch of that slot).
pub fn create(cap_type: CapType, object_id: u64, rights: CapRights, owner: Pid) -> CapId {
    let mut table = TABLE.lock();
    let record = Record { cap_type, object_id, rights, owner };
    if let Some(index) = table.free.pop() {
        let slot = &mut table.slots[index as usize];
        slot.record = Some(record);
        CapId::new(index, slot.epoch)
    } else {
        let index = table.slots.len() as u32;
        table.slots.push(Slot { record: Some(record), epoch: 0 });
        CapId::new(index, 0)
    }
}

/// Returns whether `id` still names a live record at its claimed epoch,
/// with no rights or ownership check. Used by [`crate::handle`] to detect a
/// handle gone stale after revoke without needing a caller identity.
pub fn is_live(id: CapId) -> bool {
    let table = TABLE.lock();
    matches!(
        table.slots.get(id.index() as usize),
        Some(slot) if slot.epoch == id.epoch() && slot.record.is_some()
    )
}

/// Returns whether `id` is still live, at the epoch it claims, and its
/// record's rights still cover `required`. Called from
/// [`crate::handle::HandleTable::lookup`]/`lookup_any` on every access, so a
/// capability revoked after a handle was opened onto it is caught
/// immediately rather than only on the next `cap_query` (see
/// `clear_if_stale`, which handles the separate job of forgetting the local
/// handle slot once this starts returning `false`).
///
/// This does not re-derive ownership or delegation: a process only ever
/// holds a handle onto `id` because [`grant`] already authorized that
/// delegation once, when the handle was opened, so a live handle is itself
/// the proof of "owner or delegated holder." There is no standing list of
/// delegates to re-check against.
pub fn check(id: CapId, required: CapRights) -> bool {
    let table = TABLE.lock();
    match table.slots.get(id.index() as usize) {
        Some(slot) if slot.epoch == id.epoch() => match &slot.record {
            Some(record) => record.rights.contains(required),
            None => false,
        },
        _ => false,
    }
}

/// Validates that `caller` may grant `rights` on `id` onward to some target,
/// and returns the rights the target's handle should actually carry (the
/// intersection of the record's current rights and the requested `rights`).
/// Creating the target's handle itself is [`crate::handle::open`]'s job.
pub fn grant(id: CapId, rights: CapRights, caller: Pid) -> KResult<CapRights> {
    let table = TABLE.lock();
    let slot = table.slots.get(id.index() as usize).ok_or(Error::BadHandle)?;
    if slot.epoch != id.epoch() {
        return Err(Error::BadHandle);
    }
    let record = slot.record.as_ref().ok_or(Error::BadHandle)?;
    if !record.rights.contains(CapRights::GRANT) {
        return Err(Error::Permission);
    }
    if !record.rights.contains(CapRights::DELEGATABLE) && caller != record.owner {
        return Err(Error::Permission);
    }
    Ok(record.rights & rights)
}

/// Bumps `id`'s slot epoch, invalidating every outstanding identifier that
/// named the old epoch. `target` is accepted for audit/logging symmetry
/// with the operation as specified; clearing a specific process's handle
/// entry that referenced the old epoch is [`crate::handle`]'s
/// responsibility and happens lazily, on that handle's next [`check`]
/// failure, rather than by this call walking every process's handle table.
///
/// Idempotent: revoking an already-stale or already-destroyed identifier
/// returns `Ok(())`, matching `handle_close`'s idempotence contract for the
/// symmetric operation.
pub fn revoke(id: CapId, _target: Pid, caller: Pid) -> KResult<()> {
    let mut table = TABLE.lock();
    let Some(slot) = table.slots.get_mut(id.index() as usize) else {
        return Ok(());
    };
    if slot.epoch != id.epoch() {
        return Ok(());
    }
    let Some(record) = slot.record.as_ref() else {
        return Ok(());
    };
    if record.rights.contains(CapRights::IMMORTAL) {
        return Err(Error::Permission);
    }
    if !record.rights.contains(CapRights::REVOKE) || caller != record.owner {
        return Err(Error::Permission);
    }
    slot.epoch = slot.epoch.wrapping_add(1);
    Ok(())
}

/// Final teardown: drops the record and, if one was registered, runs the
/// type-specific cleanup hook. Bumps the epoch so a reused slot never
/// aliases a stale identifier.
pub fn destroy(id: CapId) -> KResult<()> {
    let (cap_type, object_id) = {
        let mut table = TABLE.lock();
        let Some(slot) = table.slots.get_mut(id.index() as usize) else {
            return Err(Error::BadHandle);
        };
        if slot.epoch != id.epoch() {
            return Err(Error::BadHandle);
        }
        let Some(record) = slot.record.take() else {
            return Err(Error::BadHandle);
        };
        slot.epoch = slot.epoch.wrapping_add(1);
        table.free.push(id.index());
        (record.cap_type, record.object_id)
    };

    let hook = TABLE.lock().hooks[type_index(cap_type)];
    if let Some(hook) = hook {
        hook(object_id);
    }
    Ok(())
}

/// Returns `(cap_type, object_id, rights, owner)` for a live, correctly
/// epoched identifier. Used by `handle::open` to snapshot a capability's
/// type when creating the first handle onto it.
pub fn inspect(id: CapId) -> KResult<(CapType, u64, CapRights, Pid)> {
    let table = TABLE.lock();
    let slot = table.slots.get(id.index() as usize).ok_or(Error::BadHandle)?;
    if slot.epoch != id.epoch() {
        return Err(Error::BadHandle);
    }
    let record = slot.record.as_ref().ok_or(Error::BadHandle)?;
    Ok((record.cap_type, record.object_id, record.rights, record.owner))
}
