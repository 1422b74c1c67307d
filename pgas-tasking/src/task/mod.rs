//! Task descriptors and the fixed-capacity arena that owns them.
pub(crate) mod dep;
pub use dep::{AccessMode, Dependency, Phase};

pub(crate) mod descriptor;
pub(crate) use descriptor::{TaskBody, TaskInit, TaskKind, TaskRef};

pub mod id;
pub use id::{TaskId, current_task_id};

pub(crate) mod pool;
pub(crate) use pool::TaskPool;

pub(crate) mod state;
pub use state::TaskState;
