// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-process handle table (spec §4.4, component C5).
//!
//! A handle is the only thing userspace ever names a kernel object by. Each
//! entry snapshots a narrowed rights view and a reference count separate
//! from the capability record it points at, so closing a handle is purely
//! process-local bookkeeping until the count reaches zero.

use alloc::vec::Vec;

use orion_abi::{CapId, CapRights, CapType, Error, HandleId, KResult, Pid};

use crate::cap;
use crate::config::HANDLES_PER_PROCESS;
use crate::spinlock::SpinLock;

struct Entry {
    cap_type: CapType,
    cap_id: CapId,
    rights: CapRights,
    ref_count: u32,
}

/// One process's fixed-size handle table.
pub struct HandleTable {
    slots: SpinLock<Vec<Option<Entry>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(HANDLES_PER_PROCESS);
        slots.resize_with(HANDLES_PER_PROCESS, || None);
        HandleTable { slots: SpinLock::new(slots) }
    }

    /// Finds a free slot, snapshots `rights` (already narrowed to whatever
    /// the caller is entitled to hand out) against `cap_id`, and returns the
    /// new handle. Fails with [`Error::NoSpace`] if the table is full.
    pub fn open(&self, cap_id: CapId, rights: CapRights) -> KResult<HandleId> {
        let (cap_type, _object_id, ceiling, _cap_owner) = cap::inspect(cap_id)?;
        let snapshot = ceiling & rights;

        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(Error::NoSpace)?;
        slots[index] = Some(Entry { cap_type, cap_id, rights: snapshot, ref_count: 1 });
        Ok(HandleId(index as u32))
    }

    /// Returns the capability identifier behind `handle` if it names a live
    /// entry of `expected_type`, and the handle presents every bit of
    /// `required`. This is the point where a process's own rights narrowing
    /// is enforced (against the handle's locally snapshotted rights) and
    /// where the underlying record's own liveness is reconfirmed (via
    /// [`cap::check`]), so a capability revoked out from under a still-open
    /// handle is caught here rather than only at the next `cap_query`.
    /// Everything downstream of this call may trust the `CapId` it
    /// receives.
    pub fn lookup(
        &self,
        handle: HandleId,
        expected_type: CapType,
        required: CapRights,
    ) -> KResult<CapId> {
        let cap_id = {
            let slots = self.slots.lock();
            let entry = slots
                .get(handle.0 as usize)
                .and_then(|s| s.as_ref())
                .ok_or(Error::BadHandle)?;
            if entry.cap_type != expected_type {
                return Err(Error::BadHandle);
            }
            if !entry.rights.contains(required) {
                return Err(Error::Permission);
            }
            entry.cap_id
        };
        if !cap::check(cap_id, required) {
            return Err(Error::BadHandle);
        }
        Ok(cap_id)
    }

    /// Like [`lookup`](Self::lookup) but does not constrain the entry's
    /// capability type. Used by IPC capability transfer (spec §4.7), where
    /// the sender names the handle it wants to hand over and the type
    /// travels with it rather than being known in advance by the caller.
    pub fn lookup_any(&self, handle: HandleId, required: CapRights) -> KResult<CapId> {
        let cap_id = {
            let slots = self.slots.lock();
            let entry = slots
                .get(handle.0 as usize)
                .and_then(|s| s.as_ref())
                .ok_or(Error::BadHandle)?;
            if !entry.rights.contains(required) {
                return Err(Error::Permission);
            }
            entry.cap_id
        };
        if !cap::check(cap_id, required) {
            return Err(Error::BadHandle);
        }
        Ok(cap_id)
    }

    /// Increments a handle's reference count (`obj-dup`, spec §6 objects
    /// group).
    pub fn dup(&self, handle: HandleId) -> KResult<()> {
        let mut slots = self.slots.lock();
        let entry = slots
            .get_mut(handle.0 as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::BadHandle)?;
        entry.ref_count = entry.ref_count.checked_add(1).ok_or(Error::Overflow)?;
        Ok(())
    }

    /// Closes `handle`. Decrements its reference count; at zero the slot is
    /// freed and the underlying capability is destroyed. Closing an
    /// already-closed handle returns [`Error::BadHandle`] (spec §8 law:
    /// "handle_close of already-closed handle returns bad-handle").
    pub fn close(&self, handle: HandleId) -> KResult<()> {
        let cap_id = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(handle.0 as usize).ok_or(Error::BadHandle)?;
            let entry = slot.as_mut().ok_or(Error::BadHandle)?;
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                return Ok(());
            }
            slot.take().unwrap().cap_id
        };
        cap::destroy(cap_id)
    }

    /// Used by `cap_revoke`'s lazy-clear contract: if the capability behind
    /// `handle` has gone stale (epoch bumped since this handle was opened),
    /// clears the slot locally and reports so.
    pub fn clear_if_stale(&self, handle: HandleId) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(handle.0 as usize) else {
            return false;
        };
        let stale = match slot {
            Some(entry) => !cap::is_live(entry.cap_id),
            None => false,
        };
        if stale {
            *slot = None;
        }
        stale
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
