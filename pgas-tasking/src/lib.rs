//! A dependency-driven tasking engine for PGAS programs.
//!
//! Tasks declare the global memory they access; the runtime orders them by
//! those accesses, across units when the memory lives elsewhere, and runs
//! them on a work-stealing pool. A task can suspend on outstanding transfers
//! without blocking its worker, and the whole team can be cancelled
//! cooperatively.
//!
//! ```no_run
//! use pgas_tasking::{Dependency, GlobalRef, Runtime, UnitId};
//!
//! fn main() -> Result<(), pgas_tasking::TaskingError> {
//!     let rt = Runtime::init()?;
//!     let loc = GlobalRef::new(UnitId(0), 0, 0);
//!
//!     for i in 0..4 {
//!         rt.create_task(move || {
//!             println!("step {i}");
//!             Ok(())
//!         }, &[Dependency::read_write(loc)])?;
//!     }
//!
//!     rt.task_complete()?;
//!     std::process::exit(rt.fini().code())
//! }
//! ```
#[doc(inline)]
pub use pgas_tasking_macros::test;

mod bridge;

mod context;

mod errors;
pub use errors::TaskingError;

mod resolver;

pub mod runtime;
pub use runtime::{
    AffinityPolicy, Builder, ContextStats, ExitStatus, Runtime, RuntimeStats, TaskSummary,
    cancel_barrier, cancel_bcast, create_task, current_phase, detach_handle, my_unit,
    phase_advance, phase_resync, phase_set_runnable, should_abort, task_complete,
    task_complete_local, transport, wait_handle, yield_now,
};

pub mod task;
pub use task::{AccessMode, Dependency, Phase, TaskId, TaskState, current_task_id};

pub mod transport;
pub use transport::{
    CollectiveOp, Endpoint, GlobalRef, HandleStatus, InProcFabric, LocalBuffer, TEAM_ALL, TeamId, TransferOp,
    Transport, TransportError, TransportHandle, UnitId,
};

#[cfg(test)]
mod test_utils;
