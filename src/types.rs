//! Core lock manager types: modes, lock types, policy data, flags and handles.

use crate::error::{DlmError, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock mode. Each mode is a single bit so mode sets can be expressed as masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum LockMode {
    /// Exclusive.
    Ex = 1,
    /// Protected write.
    Pw = 2,
    /// Protected read.
    Pr = 4,
    /// Concurrent write.
    Cw = 8,
    /// Concurrent read.
    Cr = 16,
    /// Null.
    Nl = 32,
    /// Group lock; shared by holders with the same group id.
    Group = 64,
}

impl LockMode {
    /// Every mode, strongest first.
    pub const ALL: [LockMode; 7] = [
        LockMode::Ex,
        LockMode::Pw,
        LockMode::Pr,
        LockMode::Cw,
        LockMode::Cr,
        LockMode::Nl,
        LockMode::Group,
    ];

    /// Parse a wire mode. Exactly one known bit must be set.
    pub fn from_bits(bits: u32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.bits() == bits)
            .ok_or_else(|| DlmError::InvalidArgument(format!("invalid lock mode {:#x}", bits)))
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    /// Mask of modes that may be granted alongside this one.
    pub fn compat_mask(self) -> u32 {
        use LockMode::*;
        match self {
            Ex => Nl.bits(),
            Pw => Nl.bits() | Cr.bits(),
            Pr => Nl.bits() | Cr.bits() | Pr.bits(),
            Cw => Nl.bits() | Cr.bits() | Cw.bits(),
            Cr => Nl.bits() | Cr.bits() | Cw.bits() | Pr.bits() | Pw.bits(),
            Nl => Ex.bits() | Pw.bits() | Pr.bits() | Cw.bits() | Cr.bits() | Nl.bits() | Group.bits(),
            Group => Group.bits() | Nl.bits(),
        }
    }

    pub fn is_compatible(self, other: LockMode) -> bool {
        self.compat_mask() & other.bits() != 0
    }

    /// Whether a reference in this mode counts as a writer.
    pub fn is_writer(self) -> bool {
        matches!(self, LockMode::Ex | LockMode::Pw | LockMode::Cw | LockMode::Group)
    }

    /// Build a mode mask for matching.
    pub fn mask(modes: &[LockMode]) -> u32 {
        modes.iter().fold(0, |acc, m| acc | m.bits())
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::Ex => "EX",
            LockMode::Pw => "PW",
            LockMode::Pr => "PR",
            LockMode::Cw => "CW",
            LockMode::Cr => "CR",
            LockMode::Nl => "NL",
            LockMode::Group => "GROUP",
        };
        f.write_str(s)
    }
}

/// Lock type; decides which policy data a lock carries and how conflicts are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    Plain,
    Extent,
    Flock,
    Ibits,
}

impl LockType {
    const WIRE_BASE: u32 = 10;

    /// Parse a wire lock type.
    pub fn from_wire(value: u32) -> Result<Self> {
        match value.checked_sub(Self::WIRE_BASE) {
            Some(0) => Ok(LockType::Plain),
            Some(1) => Ok(LockType::Extent),
            Some(2) => Ok(LockType::Flock),
            Some(3) => Ok(LockType::Ibits),
            _ => Err(DlmError::InvalidArgument(format!("invalid lock type {}", value))),
        }
    }

    pub fn wire(self) -> u32 {
        Self::WIRE_BASE
            + match self {
                LockType::Plain => 0,
                LockType::Extent => 1,
                LockType::Flock => 2,
                LockType::Ibits => 3,
            }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockType::Plain => "PLN",
            LockType::Extent => "EXT",
            LockType::Flock => "FLK",
            LockType::Ibits => "IBT",
        };
        f.write_str(s)
    }
}

/// Inclusive byte range of an extent lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
    /// Group id for GROUP mode locks.
    pub gid: u64,
}

impl Extent {
    /// The whole object.
    pub const WHOLE: Extent = Extent {
        start: 0,
        end: u64::MAX,
        gid: 0,
    };

    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end, gid: 0 }
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Bytes covered, saturating for whole-object extents.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// POSIX record lock range and owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flock {
    pub start: u64,
    pub end: u64,
    pub owner: u64,
    pub pid: u32,
}

/// Type-specific policy data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PolicyData {
    #[default]
    None,
    Extent(Extent),
    Ibits { bits: u64 },
    Flock(Flock),
}

impl PolicyData {
    /// Whether this policy data is valid for `lock_type`.
    pub fn fits(&self, lock_type: LockType) -> bool {
        matches!(
            (lock_type, self),
            (LockType::Plain, PolicyData::None)
                | (LockType::Extent, PolicyData::Extent(_))
                | (LockType::Ibits, PolicyData::Ibits { .. })
                | (LockType::Flock, PolicyData::Flock(_))
        )
    }

    pub fn extent(&self) -> Option<&Extent> {
        match self {
            PolicyData::Extent(e) => Some(e),
            _ => None,
        }
    }
}

/// Resource name; unique within a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ResourceId(pub [u64; 4]);

impl ResourceId {
    pub fn new(id: u64) -> Self {
        Self([id, 0, 0, 0])
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}:{:#x}:{:#x}:{:#x}]", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Opaque lock cookie. Zero never names a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LockHandle(pub u64);

impl LockHandle {
    pub const NONE: LockHandle = LockHandle(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

bitflags! {
    /// Lock state markers. The low bits travel on the wire in request and
    /// reply flag fields; the rest are local bookkeeping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LockFlags: u64 {
        /// Reply changed the lock's mode, resource or policy.
        const LOCK_CHANGED = 1 << 0;
        /// Blocked behind a granted lock.
        const BLOCK_GRANTED = 1 << 1;
        /// Blocked behind a conversion.
        const BLOCK_CONV = 1 << 2;
        /// Blocked behind an earlier waiter.
        const BLOCK_WAIT = 1 << 3;
        /// A blocking callback arrived; cancel when the last reference goes.
        const CBPENDING = 1 << 4;
        /// A blocking callback was queued for this lock.
        const AST_SENT = 1 << 5;
        /// The holder was asked to cancel.
        const CANCEL = 1 << 6;
        /// Enqueue is a replay after reconnect.
        const REPLAY = 1 << 7;
        /// Cancel without telling the peer.
        const LOCAL_ONLY = 1 << 8;
        /// Enqueue or completion failed.
        const FAILED = 1 << 9;
        /// Cancel in progress; never cleared.
        const CANCELING = 1 << 10;
        /// Lock taken by the server for itself.
        const LOCAL = 1 << 11;
        /// Unlinked from its resource and handle table.
        const DESTROYED = 1 << 12;
        /// Completion waits never time out.
        const NO_TIMEOUT = 1 << 13;
        /// Cancel immediately on a blocking callback instead of replying.
        const CANCEL_ON_BLOCK = 1 << 14;
        /// Cancel must be sent on its own, the server is waiting for it.
        const BL_AST = 1 << 15;
        /// Send cancels without waiting for the reply.
        const ASYNC = 1 << 16;
        /// Never park this lock in the unused cache.
        const NO_LRU = 1 << 17;

        /// Flags copied from a reply onto the client lock.
        const INHERIT_MASK = Self::CANCEL_ON_BLOCK.bits() | Self::NO_TIMEOUT.bits();
        /// Flags copied from a blocking callback onto the lock.
        const AST_MASK = Self::CANCEL_ON_BLOCK.bits();
        /// Any blocked state.
        const BLOCKED_MASK = Self::BLOCK_GRANTED.bits() | Self::BLOCK_CONV.bits() | Self::BLOCK_WAIT.bits();
    }
}

/// Snapshot of a lock as exchanged with peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDesc {
    pub resource: ResourceId,
    pub lock_type: LockType,
    pub req_mode: LockMode,
    pub granted_mode: Option<LockMode>,
    pub policy: PolicyData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_bits() {
        assert_eq!(LockMode::from_bits(1).unwrap(), LockMode::Ex);
        assert_eq!(LockMode::from_bits(64).unwrap(), LockMode::Group);
        assert!(LockMode::from_bits(0).is_err());
        assert!(LockMode::from_bits(3).is_err());
        assert!(LockMode::from_bits(128).is_err());
    }

    #[test]
    fn test_compat_matrix_is_symmetric() {
        for a in LockMode::ALL {
            for b in LockMode::ALL {
                assert_eq!(
                    a.is_compatible(b),
                    b.is_compatible(a),
                    "{} vs {} is not symmetric",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_compat_matrix() {
        use LockMode::*;
        assert!(!Ex.is_compatible(Ex));
        assert!(!Ex.is_compatible(Pr));
        assert!(Ex.is_compatible(Nl));
        assert!(Pr.is_compatible(Pr));
        assert!(!Pr.is_compatible(Pw));
        assert!(Pw.is_compatible(Cr));
        assert!(!Pw.is_compatible(Pw));
        assert!(Cw.is_compatible(Cw));
        assert!(!Cw.is_compatible(Pr));
        assert!(Group.is_compatible(Group));
        assert!(!Group.is_compatible(Pr));
    }

    #[test]
    fn test_lock_type_wire() {
        for t in [LockType::Plain, LockType::Extent, LockType::Flock, LockType::Ibits] {
            assert_eq!(LockType::from_wire(t.wire()).unwrap(), t);
        }
        assert!(LockType::from_wire(9).is_err());
        assert!(LockType::from_wire(14).is_err());
    }

    #[test]
    fn test_extent_overlap() {
        let a = Extent::new(0, 4095);
        assert!(a.overlaps(&Extent::new(4095, 8191)));
        assert!(!a.overlaps(&Extent::new(4096, 8191)));
        assert!(a.overlaps(&Extent::WHOLE));
        assert_eq!(Extent::WHOLE.len(), u64::MAX);
    }

    #[test]
    fn test_policy_fits_type() {
        assert!(PolicyData::None.fits(LockType::Plain));
        assert!(PolicyData::Ibits { bits: 1 }.fits(LockType::Ibits));
        assert!(!PolicyData::Ibits { bits: 1 }.fits(LockType::Plain));
        assert!(!PolicyData::None.fits(LockType::Extent));
    }
}
