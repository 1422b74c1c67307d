//! Phase counter and runnable watermark.
use crate::errors::TaskingError;
use crate::runtime::scheduler::Scheduler;
use crate::task::{Phase, TaskRef};
use crate::transport::{CollectiveOp, TeamId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
struct Gate {
    /// Highest phase allowed to run, `None` until the first release.
    watermark: Option<Phase>,

    /// Tasks whose dependencies resolved before their phase became runnable,
    /// in resolution order per phase.
    deferred: BTreeMap<Phase, Vec<TaskRef>>,
}

impl Gate {
    fn allows(&self, phase: Phase) -> bool {
        self.watermark.is_some_and(|w| phase <= w)
    }
}

#[derive(Debug)]
pub(crate) struct PhaseController {
    current: AtomicU64,

    gate: Mutex<Gate>,
}

impl PhaseController {
    pub(crate) fn new(gating: bool) -> Self {
        Self {
            current: AtomicU64::new(0),
            gate: Mutex::new(Gate {
                watermark: (!gating).then_some(Phase::MAX),
                deferred: BTreeMap::new(),
            }),
        }
    }

    pub(crate) fn current(&self) -> Phase {
        self.current.load(Ordering::Acquire)
    }

    /// Bumps the phase used by subsequent task creation. Returns the new phase.
    pub(crate) fn advance(&self) -> Phase {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn watermark(&self) -> Option<Phase> {
        self.gate.lock().watermark
    }

    /// Returns true if a task of `phase` may run now. Otherwise records it as
    /// deferred, unless it already is.
    pub(crate) fn admit(&self, task: TaskRef, phase: Phase, already_deferred: bool) -> bool {
        let mut gate = self.gate.lock();
        if gate.allows(phase) {
            return true;
        }

        if !already_deferred {
            gate.deferred.entry(phase).or_default().push(task);
        }
        false
    }

    /// Raises the watermark to `phase` and returns the tasks it released,
    /// lowest phase first. The watermark never moves backwards.
    pub(crate) fn set_runnable(&self, phase: Phase) -> Vec<TaskRef> {
        let mut gate = self.gate.lock();
        let watermark = gate.watermark.map_or(phase, |w| w.max(phase));
        gate.watermark = Some(watermark);

        let later = match watermark.checked_add(1) {
            Some(next) => gate.deferred.split_off(&next),
            None => BTreeMap::new(),
        };
        let released = std::mem::replace(&mut gate.deferred, later);

        released.into_values().flatten().collect()
    }

    /// Empties the deferred lists without releasing anything.
    pub(crate) fn take_all_deferred(&self) -> Vec<TaskRef> {
        let mut gate = self.gate.lock();
        std::mem::take(&mut gate.deferred)
            .into_values()
            .flatten()
            .collect()
    }

    /// Moves the current phase forward to `phase`, if it is behind.
    pub(crate) fn align(&self, phase: Phase) -> Phase {
        self.current.fetch_max(phase, Ordering::AcqRel).max(phase)
    }
}

impl Scheduler {
    pub(crate) fn phase_advance(&self) -> Phase {
        let phase = self.phases.advance();
        tracing::debug!(phase, "phase advanced");
        phase
    }

    pub(crate) fn phase_set_runnable(&self, phase: Phase) {
        let released = self.phases.set_runnable(phase);
        tracing::debug!(phase, released = released.len(), "runnable watermark raised");

        for task in released {
            self.release_deferred(task);
        }
    }

    /// Collective over `team`: announces pending remote dependencies, agrees on
    /// the maximum phase and links every announcement received so far.
    pub(crate) fn phase_resync(&self, team: TeamId) -> Result<Phase, TaskingError> {
        self.transport
            .team_size(team)
            .map_err(|_| TaskingError::InvalidTeam(team))?;

        let announced = self.flush_announcements()?;
        let local = self.phases.current();

        // Every unit sends its announcements before contributing, so once the
        // reduction completes all of them sit in our mailbox.
        let agreed = self
            .transport
            .allreduce_max(team, CollectiveOp::PhaseResync, local)?;
        let phase = self.phases.align(agreed);

        self.handle_messages_blocking();

        tracing::debug!(%team, local, phase, announced, "phase resynchronized");
        Ok(phase)
    }
}
