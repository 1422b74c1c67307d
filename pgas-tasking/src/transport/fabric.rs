use crate::transport::{
    CollectiveOp, Endpoint, GlobalRef, HandleStatus, LocalBuffer, TEAM_ALL, TaskingMessage, TeamId, TransferOp,
    Transport, TransportError, TransportHandle, UnitId,
};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const DEFAULT_SEGMENTS: usize = 4;
const DEFAULT_SEGMENT_BYTES: usize = 64 * 1024;
const DEFAULT_COMPLETION_DELAY: u32 = 1;
const DEFAULT_MAX_INFLIGHT: usize = 4096;

#[derive(Debug, Clone)]
pub struct FabricBuilder {
    units: usize,
    segments: usize,
    segment_bytes: usize,
    completion_delay: u32,
    max_inflight: usize,
}

impl FabricBuilder {
    #[track_caller]
    pub fn new(units: usize) -> Self {
        assert!(units > 0, "a fabric needs at least one unit");
        Self {
            units,
            segments: DEFAULT_SEGMENTS,
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            completion_delay: DEFAULT_COMPLETION_DELAY,
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }

    /// Number of memory segments exposed by every unit.
    #[track_caller]
    pub fn segments(mut self, val: usize) -> Self {
        assert!(
            val > 0 && val <= u16::MAX as usize,
            "segments must be in 1..=65535"
        );
        self.segments = val;
        self
    }

    #[track_caller]
    pub fn segment_bytes(mut self, val: usize) -> Self {
        assert!(val > 0, "segment_bytes must be greater than 0");
        self.segment_bytes = val;
        self
    }

    /// Number of `progress` calls an issued operation stays pending before it
    /// is executed. `0` completes operations on the first `progress` call.
    pub fn completion_delay(mut self, ticks: u32) -> Self {
        self.completion_delay = ticks;
        self
    }

    /// Per-unit cap on pending operations before `issue` reports `Busy`.
    #[track_caller]
    pub fn max_inflight(mut self, val: usize) -> Self {
        assert!(val > 0, "max_inflight must be greater than 0");
        self.max_inflight = val;
        self
    }

    pub fn build(self) -> InProcFabric {
        let segments = (0..self.units)
            .map(|_| {
                (0..self.segments)
                    .map(|_| RwLock::new(vec![0u8; self.segment_bytes]))
                    .collect()
            })
            .collect();

        InProcFabric {
            shared: Arc::new(FabricShared {
                segments,
                mailboxes: (0..self.units).map(|_| SegQueue::new()).collect(),
                inflight: (0..self.units).map(|_| Mutex::new(VecDeque::new())).collect(),
                completion_delay: self.completion_delay,
                max_inflight: self.max_inflight,
                injected_failures: AtomicUsize::new(0),
                rounds: Mutex::new(HashMap::new()),
                sequences: (0..self.units)
                    .map(|_| Mutex::new([0; CollectiveOp::COUNT]))
                    .collect(),
                collective_done: Condvar::new(),
            }),
        }
    }
}

/// In-process PGAS substrate hosting a fixed number of units.
///
/// Each unit owns a set of byte segments and a mailbox. Transfers are executed
/// by the issuing unit's `progress` calls after a configurable delay, which
/// gives tests a window in which handles are genuinely pending.
#[derive(Clone)]
pub struct InProcFabric {
    shared: Arc<FabricShared>,
}

impl fmt::Debug for InProcFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcFabric")
            .field("units", &self.shared.num_units())
            .field("completion_delay", &self.shared.completion_delay)
            .finish()
    }
}

impl InProcFabric {
    pub fn builder(units: usize) -> FabricBuilder {
        FabricBuilder::new(units)
    }

    pub fn new(units: usize) -> Self {
        FabricBuilder::new(units).build()
    }

    /// Fabric used by a runtime built without an explicit transport.
    pub fn single() -> Self {
        FabricBuilder::new(1).build()
    }

    pub fn num_units(&self) -> usize {
        self.shared.num_units()
    }

    /// The transport endpoint of `unit`.
    pub fn transport(&self, unit: UnitId) -> Result<Arc<InProcTransport>, TransportError> {
        self.shared.check_unit(unit)?;
        Ok(Arc::new(InProcTransport {
            unit,
            shared: Arc::clone(&self.shared),
        }))
    }

    /// One transport per unit, in unit order.
    pub fn transports(&self) -> Vec<Arc<InProcTransport>> {
        (0..self.num_units() as u32)
            .map(|unit| {
                Arc::new(InProcTransport {
                    unit: UnitId(unit),
                    shared: Arc::clone(&self.shared),
                })
            })
            .collect()
    }

    /// Writes directly into a unit's segment, bypassing the transfer queue.
    pub fn write_bytes(&self, gref: GlobalRef, bytes: &[u8]) -> Result<(), TransportError> {
        let segment = self.shared.segment(gref, bytes.len())?;
        let start = gref.offset as usize;
        segment.write()[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_bytes(&self, gref: GlobalRef, len: usize) -> Result<Vec<u8>, TransportError> {
        let segment = self.shared.segment(gref, len)?;
        let start = gref.offset as usize;
        Ok(segment.read()[start..start + len].to_vec())
    }

    /// The next `n` issued operations complete with `Failed`.
    pub fn fail_next(&self, n: usize) {
        self.shared.injected_failures.store(n, Ordering::Release);
    }

    /// Number of operations issued by `unit` that are not yet executed.
    pub fn in_flight(&self, unit: UnitId) -> usize {
        self.shared
            .inflight
            .get(unit.index())
            .map_or(0, |q| q.lock().len())
    }
}

struct FabricShared {
    /// Indexed by `[unit][segment]`.
    segments: Box<[Box<[RwLock<Vec<u8>>]>]>,

    mailboxes: Box<[SegQueue<(UnitId, TaskingMessage)>]>,

    /// Operations issued by each unit, executed by that unit's `progress`.
    inflight: Box<[Mutex<VecDeque<InFlight>>]>,

    completion_delay: u32,

    max_inflight: usize,

    injected_failures: AtomicUsize,

    /// Open reduction rounds, keyed by kind and per-unit sequence number.
    rounds: Mutex<HashMap<(CollectiveOp, u64), Round>>,

    /// Rounds entered so far by each unit, per collective kind.
    sequences: Box<[Mutex<[u64; CollectiveOp::COUNT]>]>,

    collective_done: Condvar,
}

#[derive(Debug)]
struct Round {
    contributed: Vec<bool>,
    arrived: usize,
    acc: u64,
    result: Option<u64>,
    /// Contributors that have not picked up the result yet.
    readers: usize,
}

impl Round {
    fn new(units: usize) -> Self {
        Self {
            contributed: vec![false; units],
            arrived: 0,
            acc: 0,
            result: None,
            readers: units,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    op: TransferOp,
    remote: GlobalRef,
    local: LocalBuffer,
    bytes: usize,
    ticks_left: u32,
    fail: bool,
    handle: TransportHandle,
}

impl FabricShared {
    fn num_units(&self) -> usize {
        self.segments.len()
    }

    fn check_unit(&self, unit: UnitId) -> Result<(), TransportError> {
        if unit.index() < self.num_units() {
            Ok(())
        } else {
            Err(TransportError::UnknownUnit(unit))
        }
    }

    fn check_team(&self, team: TeamId) -> Result<(), TransportError> {
        if team == TEAM_ALL {
            Ok(())
        } else {
            Err(TransportError::UnknownTeam(team))
        }
    }

    fn segment(&self, gref: GlobalRef, len: usize) -> Result<&RwLock<Vec<u8>>, TransportError> {
        self.check_unit(gref.unit)?;
        let segment = self.segments[gref.unit.index()]
            .get(gref.segment as usize)
            .ok_or(TransportError::OutOfBounds { gref, len })?;

        let end = (gref.offset as usize).checked_add(len);
        match end {
            Some(end) if end <= segment.read().len() => Ok(segment),
            _ => Err(TransportError::OutOfBounds { gref, len }),
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn execute(&self, op: &InFlight) -> Result<(), TransportError> {
        let segment = self.segment(op.remote, op.bytes)?;
        let start = op.remote.offset as usize;
        let range = start..start + op.bytes;

        match op.op {
            TransferOp::Get => {
                let src = segment.read();
                let mut dst = op.local.lock();
                if dst.len() < op.bytes {
                    dst.resize(op.bytes, 0);
                }
                dst[..op.bytes].copy_from_slice(&src[range]);
            }
            TransferOp::Put => {
                let src = op.local.lock();
                if src.len() < op.bytes {
                    return Err(TransportError::InvalidTransfer(
                        "local buffer shorter than transfer",
                    ));
                }
                segment.write()[range].copy_from_slice(&src[..op.bytes]);
            }
        }

        Ok(())
    }
}

/// A unit's view of an [`InProcFabric`].
pub struct InProcTransport {
    unit: UnitId,
    shared: Arc<FabricShared>,
}

impl fmt::Debug for InProcTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcTransport")
            .field("unit", &self.unit)
            .field("units", &self.shared.num_units())
            .finish()
    }
}

impl Transport for InProcTransport {
    fn my_unit(&self) -> UnitId {
        self.unit
    }

    fn team_size(&self, team: TeamId) -> Result<usize, TransportError> {
        self.shared.check_team(team)?;
        Ok(self.shared.num_units())
    }

    fn team_members(&self, team: TeamId) -> Result<Vec<UnitId>, TransportError> {
        self.shared.check_team(team)?;
        Ok((0..self.shared.num_units() as u32).map(UnitId).collect())
    }

    fn issue(
        &self,
        op: TransferOp,
        src: Endpoint,
        dst: Endpoint,
        bytes: usize,
    ) -> Result<TransportHandle, TransportError> {
        let (remote, local) = match (op, src, dst) {
            (TransferOp::Get, Endpoint::Global(remote), Endpoint::Local(local)) => (remote, local),
            (TransferOp::Put, Endpoint::Local(local), Endpoint::Global(remote)) => (remote, local),
            (TransferOp::Get, ..) => {
                return Err(TransportError::InvalidTransfer(
                    "get must copy from a global reference into a local buffer",
                ));
            }
            (TransferOp::Put, ..) => {
                return Err(TransportError::InvalidTransfer(
                    "put must copy from a local buffer to a global reference",
                ));
            }
        };

        self.shared.segment(remote, bytes)?;
        if op == TransferOp::Put && local.lock().len() < bytes {
            return Err(TransportError::InvalidTransfer(
                "local buffer shorter than transfer",
            ));
        }

        let mut inflight = self.shared.inflight[self.unit.index()].lock();
        if inflight.len() >= self.shared.max_inflight {
            return Err(TransportError::Busy);
        }

        let handle = TransportHandle::pending();
        inflight.push_back(InFlight {
            op,
            remote,
            local,
            bytes,
            ticks_left: self.shared.completion_delay,
            fail: self.shared.take_injected_failure(),
            handle: handle.clone(),
        });

        Ok(handle)
    }

    fn test(&self, handle: &TransportHandle) -> HandleStatus {
        handle.status()
    }

    fn progress(&self) {
        // Several workers of the same unit progress concurrently; one of them
        // is enough.
        let Some(mut inflight) = self.shared.inflight[self.unit.index()].try_lock() else {
            return;
        };

        inflight.retain_mut(|op| {
            if op.ticks_left > 0 {
                op.ticks_left -= 1;
                return true;
            }

            if op.fail {
                op.handle.fail();
            } else if let Err(e) = self.shared.execute(op) {
                tracing::error!(unit = %self.unit, remote = %op.remote, "transfer failed: {e}");
                op.handle.fail();
            } else {
                op.handle.complete();
            }

            false
        });
    }

    fn send(&self, to: UnitId, msg: TaskingMessage) -> Result<(), TransportError> {
        self.shared.check_unit(to)?;
        self.shared.mailboxes[to.index()].push((self.unit, msg));
        Ok(())
    }

    fn poll_messages(&self, on_message: &mut dyn FnMut(UnitId, TaskingMessage)) {
        let mailbox = &self.shared.mailboxes[self.unit.index()];
        while let Some((from, msg)) = mailbox.pop() {
            on_message(from, msg);
        }
    }

    fn allreduce_max(
        &self,
        team: TeamId,
        op: CollectiveOp,
        value: u64,
    ) -> Result<u64, TransportError> {
        self.shared.check_team(team)?;

        let num_units = self.shared.num_units();
        let seq = {
            let mut seqs = self.shared.sequences[self.unit.index()].lock();
            let seq = seqs[op.index()];
            seqs[op.index()] += 1;
            seq
        };
        let key = (op, seq);

        let mut rounds = self.shared.rounds.lock();
        let round = rounds.entry(key).or_insert_with(|| Round::new(num_units));

        if std::mem::replace(&mut round.contributed[self.unit.index()], true) {
            return Err(TransportError::Failed(format!(
                "unit {} entered {op:?} round {seq} twice",
                self.unit
            )));
        }
        round.acc = round.acc.max(value);
        round.arrived += 1;

        if round.arrived == num_units {
            round.result = Some(round.acc);
            self.shared.collective_done.notify_all();
        }

        loop {
            let Some(round) = rounds.get_mut(&key) else {
                return Err(TransportError::Failed(format!("{op:?} round {seq} vanished")));
            };
            if let Some(result) = round.result {
                round.readers -= 1;
                if round.readers == 0 {
                    rounds.remove(&key);
                }
                return Ok(result);
            }
            self.shared.collective_done.wait(&mut rounds);
        }
    }
}
