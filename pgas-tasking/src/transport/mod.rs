//! Transport façade.
//!
//! The tasking core never touches remote memory itself: one-sided transfers,
//! completion tests, control messages and the phase all-reduce all go through
//! the [`Transport`] trait. [`InProcFabric`] is the in-process substrate used
//! by the default single-unit runtime and by multi-unit tests.
use crate::task::{AccessMode, Phase};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

pub mod fabric;
pub use fabric::{FabricBuilder, InProcFabric, InProcTransport};

/// Identifies a participant within a team.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct UnitId(pub u32);

impl UnitId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque handle for a group of units.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TeamId(pub u32);

/// The team containing every unit.
pub const TEAM_ALL: TeamId = TeamId(0);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == TEAM_ALL {
            f.write_str("TEAM_ALL")
        } else {
            self.0.fmt(f)
        }
    }
}

/// Kind of a collective reduction. Rounds of different kinds never pair up,
/// even when units enter them in a different order.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum CollectiveOp {
    PhaseResync,
    CancelBarrier,
}

impl CollectiveOp {
    pub(crate) const COUNT: usize = 2;

    pub(crate) fn index(self) -> usize {
        match self {
            CollectiveOp::PhaseResync => 0,
            CollectiveOp::CancelBarrier => 1,
        }
    }
}

/// Address of a byte range in the partitioned global address space.
///
/// The tasking core only uses it as an ordered key when matching
/// dependencies; it never dereferences it.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct GlobalRef {
    pub unit: UnitId,
    pub segment: u16,
    pub offset: u64,
}

impl GlobalRef {
    pub const fn new(unit: UnitId, segment: u16, offset: u64) -> Self {
        Self {
            unit,
            segment,
            offset,
        }
    }

    /// Returns a reference `bytes` further into the same segment.
    pub const fn add(self, bytes: u64) -> Self {
        Self {
            offset: self.offset + bytes,
            ..self
        }
    }
}

impl fmt::Display for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{:#x}", self.unit, self.segment, self.offset)
    }
}

/// Unit-local memory used as the source or destination of a transfer.
pub type LocalBuffer = Arc<Mutex<Vec<u8>>>;

/// One end of a one-sided transfer.
#[derive(Clone, Debug)]
pub enum Endpoint {
    Local(LocalBuffer),
    Global(GlobalRef),
}

impl Endpoint {
    pub fn local(buf: &LocalBuffer) -> Self {
        Endpoint::Local(Arc::clone(buf))
    }
}

impl From<GlobalRef> for Endpoint {
    fn from(gref: GlobalRef) -> Self {
        Endpoint::Global(gref)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOp {
    /// Copy from a global reference into a local buffer.
    Get,
    /// Copy from a local buffer to a global reference.
    Put,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleStatus {
    Pending,
    Complete,
    Failed,
}

impl HandleStatus {
    /// Folds the status of several handles: any failure dominates, then any
    /// pending handle.
    pub fn combine(self, other: HandleStatus) -> HandleStatus {
        match (self, other) {
            (HandleStatus::Failed, _) | (_, HandleStatus::Failed) => HandleStatus::Failed,
            (HandleStatus::Pending, _) | (_, HandleStatus::Pending) => HandleStatus::Pending,
            _ => HandleStatus::Complete,
        }
    }
}

const PENDING: u8 = 0;
const COMPLETE: u8 = 1;
const FAILED: u8 = 2;

/// Receipt for a non-blocking transfer. Clones observe the same completion.
#[derive(Clone, Debug)]
pub struct TransportHandle {
    status: Arc<AtomicU8>,
}

impl TransportHandle {
    /// A new handle in the pending state. Transports complete it later.
    pub fn pending() -> Self {
        Self {
            status: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    pub fn status(&self) -> HandleStatus {
        match self.status.load(Ordering::Acquire) {
            PENDING => HandleStatus::Pending,
            COMPLETE => HandleStatus::Complete,
            _ => HandleStatus::Failed,
        }
    }

    pub fn complete(&self) {
        let _ = self
            .status
            .compare_exchange(PENDING, COMPLETE, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn fail(&self) {
        let _ = self
            .status
            .compare_exchange(PENDING, FAILED, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_pending(&self) -> bool {
        self.status() == HandleStatus::Pending
    }
}

/// Handle lists rarely hold more than a few receipts.
pub type HandleList = SmallVec<[TransportHandle; 4]>;

/// Task identity as seen by other units. Only meaningful to the unit that
/// minted it.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct RemoteTaskId(pub u64);

/// Control messages exchanged between the tasking layers of two units.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskingMessage {
    /// `task` on the sender accesses `gref` (owned by the receiver).
    AnnounceDep {
        task: RemoteTaskId,
        gref: GlobalRef,
        mode: AccessMode,
        phase: Phase,
    },
    /// The receiver's `task` may run: all conflicting accesses on the sender
    /// that precede it have retired. `proxy` must be reported back once `task`
    /// retires.
    ReleaseDep {
        task: RemoteTaskId,
        proxy: RemoteTaskId,
    },
    /// The remote task represented by `proxy` on the receiver has retired.
    DepSatisfied { proxy: RemoteTaskId },
    /// The sender started a cooperative abort.
    Cancel,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unknown unit {0}")]
    UnknownUnit(UnitId),

    #[error("Unknown team {0}")]
    UnknownTeam(TeamId),

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(&'static str),

    #[error("Access out of bounds: {gref} (+{len} bytes)")]
    OutOfBounds { gref: GlobalRef, len: usize },

    #[error("Too many operations in flight")]
    Busy,

    #[error("Operation failed: {0}")]
    Failed(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Busy)
    }
}

/// The communication substrate consumed by the tasking core.
///
/// Implementations must be usable from every worker thread of the unit's
/// runtime at once.
pub trait Transport: Send + Sync + fmt::Debug {
    fn my_unit(&self) -> UnitId;

    fn team_size(&self, team: TeamId) -> Result<usize, TransportError>;

    fn team_members(&self, team: TeamId) -> Result<Vec<UnitId>, TransportError>;

    /// Starts a non-blocking one-sided transfer of `bytes` bytes.
    fn issue(
        &self,
        op: TransferOp,
        src: Endpoint,
        dst: Endpoint,
        bytes: usize,
    ) -> Result<TransportHandle, TransportError>;

    fn test(&self, handle: &TransportHandle) -> HandleStatus {
        handle.status()
    }

    fn testall(&self, handles: &[TransportHandle]) -> HandleStatus {
        handles
            .iter()
            .map(|h| self.test(h))
            .fold(HandleStatus::Complete, HandleStatus::combine)
    }

    /// Drives internal completion of issued operations.
    fn progress(&self);

    fn send(&self, to: UnitId, msg: TaskingMessage) -> Result<(), TransportError>;

    /// Reception callback: hands every queued incoming message to `on_message`.
    fn poll_messages(&self, on_message: &mut dyn FnMut(UnitId, TaskingMessage));

    /// Collective maximum over every unit of `team`. Blocks until all members
    /// have contributed to the same round of `op`. The n-th call of a unit
    /// for a given `op` joins the n-th round of that op.
    fn allreduce_max(
        &self,
        team: TeamId,
        op: CollectiveOp,
        value: u64,
    ) -> Result<u64, TransportError>;

    fn announce_remote_dep(
        &self,
        unit: UnitId,
        task: RemoteTaskId,
        gref: GlobalRef,
        mode: AccessMode,
        phase: Phase,
    ) -> Result<(), TransportError> {
        self.send(
            unit,
            TaskingMessage::AnnounceDep {
                task,
                gref,
                mode,
                phase,
            },
        )
    }

    fn notify_cancel(&self, unit: UnitId) -> Result<(), TransportError> {
        self.send(unit, TaskingMessage::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TransportHandle: Send, Sync, Clone);
    assert_impl_all!(TaskingMessage: Send, Sync);
    assert_impl_all!(GlobalRef: Send, Sync, Copy, Ord, std::hash::Hash);

    #[rstest]
    #[case::all_complete(HandleStatus::Complete, HandleStatus::Complete, HandleStatus::Complete)]
    #[case::one_pending(HandleStatus::Complete, HandleStatus::Pending, HandleStatus::Pending)]
    #[case::failure_wins(HandleStatus::Pending, HandleStatus::Failed, HandleStatus::Failed)]
    #[case::failure_first(HandleStatus::Failed, HandleStatus::Complete, HandleStatus::Failed)]
    fn test_status_combine(
        #[case] a: HandleStatus,
        #[case] b: HandleStatus,
        #[case] expected: HandleStatus,
    ) {
        assert_eq!(a.combine(b), expected);
    }

    #[test]
    fn test_handle_status_is_sticky() {
        let handle = TransportHandle::pending();
        let clone = handle.clone();
        assert!(clone.is_pending());

        handle.complete();
        assert_eq!(clone.status(), HandleStatus::Complete);

        // Completion is final.
        handle.fail();
        assert_eq!(clone.status(), HandleStatus::Complete);
    }

    #[test]
    fn test_global_ref_ordering() {
        let a = GlobalRef::new(UnitId(0), 1, 64);
        let b = a.add(8);
        assert!(a < b);
        assert_eq!(b.offset, 72);
        assert_eq!(a.to_string(), "0:1+0x40");
        assert_eq!(TEAM_ALL.to_string(), "TEAM_ALL");
    }
}
