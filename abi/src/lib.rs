// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orion ABI definitions, shared between the kernel core and anything that
//! calls into it (syscall trampolines, future userspace stubs, test
//! harnesses).
//!
//! Nothing in this crate is architecture-specific; HAL/ISA concerns live
//! entirely on the kernel side of the boundary this crate describes.

#![cfg_attr(not(test), no_std)]

use core::convert::TryFrom;
use core::num::NonZeroU64;

use serde::{Deserialize, Serialize};

pub mod boot;

/// Finite error taxonomy (spec §7). Every kernel-internal and syscall-facing
/// fallible operation returns one of these; there is no exception-like
/// unwind in the kernel's own control flow.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Error {
    InvalidArgument = 1,
    NoMemory = 2,
    NotFound = 3,
    AlreadyExists = 4,
    Busy = 5,
    WouldBlock = 6,
    TimedOut = 7,
    Permission = 8,
    BadHandle = 9,
    NoSpace = 10,
    Overflow = 11,
    NoData = 12,
    Aborted = 13,
}

impl Error {
    /// Numeric code returned across the syscall boundary. `0` is reserved for
    /// success and is never produced by this type; callers encode success as
    /// `Ok(_)` and map it to `0` themselves (see `syscall::encode_result`).
    pub fn to_raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::InvalidArgument,
            2 => Self::NoMemory,
            3 => Self::NotFound,
            4 => Self::AlreadyExists,
            5 => Self::Busy,
            6 => Self::WouldBlock,
            7 => Self::TimedOut,
            8 => Self::Permission,
            9 => Self::BadHandle,
            10 => Self::NoSpace,
            11 => Self::Overflow,
            12 => Self::NoData,
            13 => Self::Aborted,
            _ => return None,
        })
    }
}

pub type KResult<T> = Result<T, Error>;

/// Monotonic 64-bit process identifier. Never zero: zero is reserved to mean
/// "no process" in wire structures that need an absent-PID sentinel.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Pid(NonZeroU64);

impl Pid {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Pid)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Monotonic 64-bit thread identifier, process-independent (unlike a Linux
/// TID this does not double as a PID for the main thread).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Tid(NonZeroU64);

impl Tid {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Tid)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// A small per-process integer naming a handle-table slot (spec §3 "Handle").
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct HandleId(pub u32);

/// Opaque capability identifier exposed to userspace: table index in the low
/// bits, epoch/generation in the high bits, mirroring the index+generation
/// `TaskId` scheme used by production microkernels (so a recycled slot
/// referenced by a stale identifier is detectable rather than silently
/// aliased).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CapId(u64);

impl CapId {
    pub const INDEX_BITS: u32 = 32;
    const INDEX_MASK: u64 = (1u64 << Self::INDEX_BITS) - 1;

    pub fn new(index: u32, epoch: u32) -> Self {
        CapId((index as u64) | ((epoch as u64) << Self::INDEX_BITS))
    }

    pub fn index(self) -> u32 {
        (self.0 & Self::INDEX_MASK) as u32
    }

    pub fn epoch(self) -> u32 {
        (self.0 >> Self::INDEX_BITS) as u32
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        CapId(raw)
    }
}

/// Kind of object a capability refers to (spec §3 "Capability").
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum CapType {
    Memory,
    IpcPort,
    Process,
    Thread,
    File,
    Directory,
    Device,
    NetworkSocket,
    Timer,
    SecurityContext,
    CryptoKey,
    HardwareResource,
}

bitflags::bitflags! {
    /// Rights bitmap carried by a capability record and, narrowed, by each
    /// handle that derives from it (spec §3).
    pub struct CapRights: u32 {
        const READ        = 1 << 0;
        const WRITE       = 1 << 1;
        const EXECUTE     = 1 << 2;
        const GRANT        = 1 << 3;
        const REVOKE       = 1 << 4;
        const DELETE       = 1 << 5;
        const CREATE       = 1 << 6;
        const MODIFY       = 1 << 7;
        const TRAVERSE     = 1 << 8;
        const BIND         = 1 << 9;
        const LISTEN       = 1 << 10;
        const CONNECT      = 1 << 11;
        const DEBUG        = 1 << 12;
        const ADMIN        = 1 << 13;
        /// Cannot ever be revoked.
        const IMMORTAL     = 1 << 14;
        /// May be granted onward by a holder other than the original creator.
        const DELEGATABLE  = 1 << 15;
    }
}

bitflags::bitflags! {
    /// `vm-map` protection flags (spec §6).
    pub struct Prot: u32 {
        const READ  = 1;
        const WRITE = 2;
        const EXEC  = 4;
    }
}

bitflags::bitflags! {
    /// `vm-map` mapping flags (spec §6).
    pub struct Map: u32 {
        const PRIVATE   = 1;
        const SHARED    = 2;
        const FIXED     = 4;
        const ANONYMOUS = 8;
    }
}

/// Numbered syscall table (spec §6): 0-59, grouped by subsystem. Unassigned
/// numbers within a group's range are reserved for future growth and are
/// rejected by `TryFrom` exactly like an out-of-range number.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[repr(u32)]
pub enum Sysnum {
    // 0-9: process/thread
    Exit = 0,
    Yield = 1,
    ProcCreate = 2,
    ThreadCreate = 3,
    Wait = 4,
    Signal = 5,
    GetPid = 6,
    GetTid = 7,

    // 10-19: memory
    VmMap = 10,
    VmUnmap = 11,
    VmProtect = 12,
    ShmCreate = 13,
    ShmAttach = 14,
    ShmDetach = 15,
    Madvise = 16,

    // 20-29: IPC
    PortCreate = 20,
    PortSend = 21,
    PortRecv = 22,
    PortShare = 23,
    MsgForward = 24,

    // 30-34: time
    ClockGet = 30,
    TimerCreate = 31,
    TimerStart = 32,
    TimerStop = 33,
    NanoSleep = 34,

    // 35-39: I/O
    Open = 35,
    IoSubmit = 36,
    IoPoll = 37,
    IoCancel = 38,

    // 40-44: objects
    ObjInfo = 40,
    ObjDup = 41,
    ObjClose = 42,

    // 45-49: security
    CapGrant = 45,
    CapRevoke = 46,
    CapQuery = 47,
    SandboxLoad = 48,
    AuditEmit = 49,

    // 50-59: misc
    Info = 50,
    DbgTrace = 51,
    Random = 52,
}

impl TryFrom<u32> for Sysnum {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self, Error> {
        Ok(match raw {
            0 => Self::Exit,
            1 => Self::Yield,
            2 => Self::ProcCreate,
            3 => Self::ThreadCreate,
            4 => Self::Wait,
            5 => Self::Signal,
            6 => Self::GetPid,
            7 => Self::GetTid,
            10 => Self::VmMap,
            11 => Self::VmUnmap,
            12 => Self::VmProtect,
            13 => Self::ShmCreate,
            14 => Self::ShmAttach,
            15 => Self::ShmDetach,
            16 => Self::Madvise,
            20 => Self::PortCreate,
            21 => Self::PortSend,
            22 => Self::PortRecv,
            23 => Self::PortShare,
            24 => Self::MsgForward,
            30 => Self::ClockGet,
            31 => Self::TimerCreate,
            32 => Self::TimerStart,
            33 => Self::TimerStop,
            34 => Self::NanoSleep,
            35 => Self::Open,
            36 => Self::IoSubmit,
            37 => Self::IoPoll,
            38 => Self::IoCancel,
            40 => Self::ObjInfo,
            41 => Self::ObjDup,
            42 => Self::ObjClose,
            45 => Self::CapGrant,
            46 => Self::CapRevoke,
            47 => Self::CapQuery,
            48 => Self::SandboxLoad,
            49 => Self::AuditEmit,
            50 => Self::Info,
            51 => Self::DbgTrace,
            52 => Self::Random,
            _ => return Err(Error::InvalidArgument),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_id_roundtrips_index_and_epoch() {
        let id = CapId::new(1234, 7);
        assert_eq!(id.index(), 1234);
        assert_eq!(id.epoch(), 7);
    }

    #[test]
    fn error_raw_roundtrip() {
        for raw in 1u32..=13 {
            let e = Error::from_raw(raw).expect("known code");
            assert_eq!(e.to_raw(), raw);
        }
        assert!(Error::from_raw(0).is_none());
        assert!(Error::from_raw(14).is_none());
    }

    #[test]
    fn sysnum_rejects_reserved_slots() {
        assert!(Sysnum::try_from(8).is_err());
        assert!(Sysnum::try_from(60).is_err());
        assert_eq!(Sysnum::try_from(21), Ok(Sysnum::PortSend));
    }
}
