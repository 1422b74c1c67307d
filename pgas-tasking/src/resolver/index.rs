use crate::task::{AccessMode, Phase, TaskRef};
use crate::transport::{GlobalRef, UnitId};
use dashmap::DashMap;
use smallvec::SmallVec;

pub(crate) type TaskRefs = SmallVec<[TaskRef; 4]>;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
struct Location {
    segment: u16,
    offset: u64,
}

impl From<GlobalRef> for Location {
    fn from(gref: GlobalRef) -> Self {
        Self {
            segment: gref.segment,
            offset: gref.offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChainEntry {
    pub(crate) task: TaskRef,
    pub(crate) mode: AccessMode,
    pub(crate) phase: Phase,
}

/// Prior accesses to one location, ordered by phase and, within a phase, by
/// insertion.
#[derive(Debug, Default)]
pub(crate) struct LocationChain {
    entries: Vec<ChainEntry>,
}

impl LocationChain {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    /// Drops entries of tasks that have retired.
    pub(crate) fn prune(&mut self, is_retired: impl Fn(TaskRef) -> bool) {
        self.entries.retain(|e| !is_retired(e.task));
    }

    /// Where an access at `phase` goes. Local accesses follow every entry of
    /// the same phase, remote announcements precede them.
    pub(crate) fn position(&self, phase: Phase, before_same_phase: bool) -> usize {
        if before_same_phase {
            self.entries.partition_point(|e| e.phase < phase)
        } else {
            self.entries.partition_point(|e| e.phase <= phase)
        }
    }

    /// Entries in front of `pos`, at phase `<= limit`, that an access in `mode`
    /// must wait for.
    ///
    /// Scans backwards: a reader stops at the first writer, a writer collects
    /// every reader after that writer and the writer itself.
    pub(crate) fn predecessors(&self, mode: AccessMode, pos: usize, limit: Phase) -> TaskRefs {
        let mut preds = TaskRefs::new();

        for entry in self.entries[..pos].iter().rev() {
            if entry.phase > limit {
                continue;
            }

            if entry.mode.is_mutating() {
                preds.push(entry.task);
                break;
            }

            if mode.is_mutating() {
                preds.push(entry.task);
            }
        }

        preds
    }

    /// Entries from `pos` on that conflict with an access in `mode`.
    pub(crate) fn later_conflicts(&self, mode: AccessMode, pos: usize) -> TaskRefs {
        self.entries[pos..]
            .iter()
            .filter(|e| e.mode.conflicts_with(mode))
            .map(|e| e.task)
            .collect()
    }

    pub(crate) fn insert(&mut self, pos: usize, entry: ChainEntry) {
        self.entries.insert(pos, entry);
    }
}

/// Location chains, sharded by the unit owning the location.
#[derive(Debug)]
pub(crate) struct DependencyIndex {
    shards: Box<[DashMap<Location, LocationChain>]>,
}

impl DependencyIndex {
    pub(crate) fn new(num_units: usize) -> Self {
        Self {
            shards: (0..num_units).map(|_| DashMap::new()).collect(),
        }
    }

    fn shard(&self, unit: UnitId) -> &DashMap<Location, LocationChain> {
        // Units are validated against the team when a dependency is declared.
        &self.shards[unit.index() % self.shards.len()]
    }

    /// Runs `f` with exclusive access to the chain of `gref`.
    ///
    /// `f` may lock task descriptors. Descriptor locks are never held while
    /// entering a chain, which keeps the lock order acyclic.
    pub(crate) fn with_chain<F, R>(&self, gref: GlobalRef, f: F) -> R
    where
        F: FnOnce(&mut LocationChain) -> R,
    {
        let mut chain = self.shard(gref.unit).entry(gref.into()).or_default();
        f(&mut chain)
    }

    /// Prunes every chain and drops the empty ones.
    pub(crate) fn compact(&self, is_retired: impl Fn(TaskRef) -> bool) {
        for shard in self.shards.iter() {
            shard.retain(|_, chain| {
                chain.prune(&is_retired);
                !chain.is_empty()
            });
        }
    }

    /// Number of tracked locations.
    pub(crate) fn locations(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }
}
