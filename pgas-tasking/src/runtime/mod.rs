// Public API
pub mod runtime;
pub use runtime::{ExitStatus, Runtime};

mod builder;
pub use builder::Builder;
pub(crate) use builder::RuntimeConfig;

mod api;
pub use api::{
    cancel_barrier, cancel_bcast, create_task, current_phase, detach_handle, my_unit,
    phase_advance, phase_resync, phase_set_runnable, should_abort, task_complete,
    task_complete_local, transport, wait_handle, yield_now,
};

pub(crate) mod affinity;
pub use affinity::AffinityPolicy;

// Exports
pub(crate) mod cancel;

pub(crate) mod phase;

pub(crate) mod pool;

pub(crate) mod scheduler;
pub use scheduler::{RuntimeStats, TaskSummary};

pub use crate::context::store::ContextStats;

pub(crate) mod shared;

mod ticker;

pub(crate) mod worker;
