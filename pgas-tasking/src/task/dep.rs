use crate::transport::GlobalRef;

/// Logical epoch used to order dependency matching across units.
pub type Phase = u64;

/// How a task accesses a global reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
    /// Producing access. Matched exactly like `Write`, including the
    /// write-after-read edges to earlier readers.
    Out,
    /// Reads a private copy of the data; matched like `Read`.
    CopyIn,
}

impl AccessMode {
    pub fn is_mutating(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite | AccessMode::Out)
    }

    /// Two accesses to the same location conflict unless both only read.
    pub fn conflicts_with(self, other: AccessMode) -> bool {
        self.is_mutating() || other.is_mutating()
    }
}

/// A declared data dependency of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub gref: GlobalRef,
    pub mode: AccessMode,
    /// Restricts matching to prior accesses at phases `<= phase`. Defaults to
    /// the phase of the declaring task.
    pub phase: Option<Phase>,
}

impl Dependency {
    pub const fn new(gref: GlobalRef, mode: AccessMode) -> Self {
        Self {
            gref,
            mode,
            phase: None,
        }
    }

    pub const fn read(gref: GlobalRef) -> Self {
        Self::new(gref, AccessMode::Read)
    }

    pub const fn write(gref: GlobalRef) -> Self {
        Self::new(gref, AccessMode::Write)
    }

    pub const fn read_write(gref: GlobalRef) -> Self {
        Self::new(gref, AccessMode::ReadWrite)
    }

    pub const fn out(gref: GlobalRef) -> Self {
        Self::new(gref, AccessMode::Out)
    }

    pub const fn copy_in(gref: GlobalRef) -> Self {
        Self::new(gref, AccessMode::CopyIn)
    }

    pub const fn in_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Phase limit used when matching this dependency for a task of `task_phase`.
    pub(crate) fn match_limit(&self, task_phase: Phase) -> Phase {
        self.phase.unwrap_or(task_phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UnitId;
    use rstest::rstest;

    #[rstest]
    #[case::read_read(AccessMode::Read, AccessMode::Read, false)]
    #[case::read_copyin(AccessMode::Read, AccessMode::CopyIn, false)]
    #[case::read_write(AccessMode::Read, AccessMode::Write, true)]
    #[case::write_read(AccessMode::Write, AccessMode::Read, true)]
    #[case::write_write(AccessMode::Write, AccessMode::Write, true)]
    #[case::out_read(AccessMode::Out, AccessMode::Read, true)]
    #[case::copyin_out(AccessMode::CopyIn, AccessMode::Out, true)]
    #[case::readwrite_copyin(AccessMode::ReadWrite, AccessMode::CopyIn, true)]
    fn test_conflict_matrix(#[case] a: AccessMode, #[case] b: AccessMode, #[case] conflict: bool) {
        assert_eq!(a.conflicts_with(b), conflict);
        assert_eq!(b.conflicts_with(a), conflict);
    }

    #[test]
    fn test_match_limit() {
        let gref = GlobalRef::new(UnitId(0), 0, 0);
        assert_eq!(Dependency::read(gref).match_limit(4), 4);
        assert_eq!(Dependency::read(gref).in_phase(2).match_limit(4), 2);
    }
}
