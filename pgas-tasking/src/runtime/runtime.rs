use crate::context;
use crate::errors::TaskingError;
use crate::runtime::builder::{Builder, RuntimeConfig};
use crate::runtime::scheduler::{Handle, RuntimeStats, Scheduler, TaskSummary};
use crate::task::{Dependency, Phase, TaskId};
use crate::transport::{TeamId, Transport, TransportHandle, UnitId};
use std::marker::PhantomData;
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

/// Process exit status reported by [`Runtime::fini`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    Normal,
    /// At least one cooperative cancellation happened.
    Cancelled,
    /// A runtime invariant was violated. The process exits with this code
    /// before `fini` can return it.
    InvariantFailure,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Normal => 0,
            ExitStatus::Cancelled => 3,
            ExitStatus::InvariantFailure => 70,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        // Codes are all in 0..=255.
        ExitCode::from(status.code() as u8)
    }
}

/// A tasking runtime for one unit.
///
/// The runtime is bound to the thread that built it: that thread is the root
/// of the task tree and takes part in scheduling while it waits. Tasks reach
/// the runtime through the free functions of this crate.
#[derive(Debug)]
pub struct Runtime {
    handle: Handle,

    finished: bool,

    _not_send: PhantomData<Rc<()>>,
}

impl Runtime {
    /// Starts a runtime configured from the environment.
    pub fn init() -> Result<Runtime, TaskingError> {
        Builder::new().try_build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn start(cfg: RuntimeConfig) -> Result<Runtime, TaskingError> {
        let handle = Scheduler::new(cfg)?.into_handle();

        context::init_root_context(handle.clone())?;

        if let Err(e) = handle.start() {
            context::clear_context();
            return Err(e.into());
        }

        tracing::debug!(
            unit = %handle.my_unit,
            team_size = handle.team_size(),
            workers = handle.cfg.worker_threads,
            pool_capacity = handle.cfg.pool_capacity,
            phase_gating = handle.cfg.phase_gating,
            "runtime started"
        );

        Ok(Runtime {
            handle,
            finished: false,
            _not_send: PhantomData,
        })
    }

    /// Creates a task running `body` once every dependency in `deps` is
    /// satisfied and its phase is runnable. Blocks while the task pool is
    /// full.
    pub fn create_task<F>(&self, body: F, deps: &[Dependency]) -> Result<TaskId, TaskingError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.handle.create_task(Box::new(body), deps)
    }

    /// Releases every phase up to the current one, resynchronizes with the
    /// team and runs tasks until all of them retired.
    pub fn task_complete(&self) -> Result<TaskSummary, TaskingError> {
        self.handle.drain(true)
    }

    /// Like [`Runtime::task_complete`] without the collective resync.
    pub fn task_complete_local(&self) -> Result<TaskSummary, TaskingError> {
        self.handle.drain(false)
    }

    pub fn wait_handle(&self, handles: &[TransportHandle]) -> Result<(), TaskingError> {
        self.handle.wait_handle(handles)
    }

    pub fn detach_handle(&self, handles: &[TransportHandle]) {
        self.handle.detach_handle(handles);
    }

    pub fn phase_advance(&self) -> Phase {
        self.handle.phase_advance()
    }

    pub fn phase_set_runnable(&self, phase: Phase) {
        self.handle.phase_set_runnable(phase);
    }

    pub fn phase_resync(&self, team: TeamId) -> Result<Phase, TaskingError> {
        self.handle.phase_resync(team)
    }

    pub fn current_phase(&self) -> Phase {
        self.handle.phases.current()
    }

    pub fn cancel_bcast(&self) {
        self.handle.cancel_bcast();
    }

    pub fn cancel_barrier(&self) -> Result<(), TaskingError> {
        self.handle.cancel_barrier()
    }

    pub fn should_abort(&self) -> bool {
        self.handle.cancel.should_abort()
    }

    pub fn my_unit(&self) -> UnitId {
        self.handle.my_unit
    }

    pub fn team_size(&self) -> usize {
        self.handle.team_size()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.handle.transport)
    }

    pub fn stats(&self) -> RuntimeStats {
        self.handle.stats()
    }

    /// Drains all tasks, stops the workers and releases every context.
    pub fn fini(mut self) -> ExitStatus {
        self.shutdown()
    }

    fn shutdown(&mut self) -> ExitStatus {
        if self.finished {
            return self.exit_status();
        }
        self.finished = true;

        if thread::panicking() {
            self.handle.begin_abort("runtime dropped while panicking");
        }

        match self.handle.drain(false) {
            Ok(summary) if summary.total() > 0 => {
                tracing::debug!(?summary, "tasks drained at fini");
            }
            Ok(_) => {}
            Err(e) => tracing::error!("failed to drain tasks at fini: {e}"),
        }

        self.handle.shared.begin_shutdown();
        if let Err(e) = self.handle.join_pool() {
            tracing::error!("error during runtime shutdown: {e:#}");
        }

        self.handle.contexts.clear();
        let contexts = self.handle.contexts.stats();
        if contexts.outstanding() > 0 {
            tracing::warn!(?contexts, "contexts still owned by tasks at fini");
        }

        context::clear_context();

        let status = self.exit_status();
        tracing::debug!(unit = %self.handle.my_unit, ?status, "runtime stopped");
        status
    }

    fn exit_status(&self) -> ExitStatus {
        if self.handle.cancel.ever_aborted() {
            ExitStatus::Cancelled
        } else {
            ExitStatus::Normal
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    assert_not_impl_any!(Runtime: Send, Sync);
    assert_impl_all!(ExitStatus: Send, Sync, Copy);

    #[rstest]
    #[case::normal(ExitStatus::Normal, 0)]
    #[case::cancelled(ExitStatus::Cancelled, 3)]
    #[case::invariant(ExitStatus::InvariantFailure, 70)]
    fn test_exit_codes(#[case] status: ExitStatus, #[case] code: i32) {
        assert_eq!(status.code(), code);
    }

    #[test]
    fn test_one_runtime_per_thread() -> anyhow::Result<()> {
        let rt = Runtime::builder().worker_threads(1).try_build()?;
        assert!(matches!(
            Runtime::builder().worker_threads(1).try_build(),
            Err(TaskingError::AlreadyActive)
        ));
        assert_eq!(rt.fini(), ExitStatus::Normal);

        // The slot is free again once the first runtime is gone.
        let rt = Runtime::builder().worker_threads(1).try_build()?;
        drop(rt);
        Ok(())
    }
}
