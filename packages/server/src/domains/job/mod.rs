//! Jobs: model, states and the transition rules.
//!
//! Only this module (and the reservation engine for reservation jobs)
//! may change job state. Handlers in dispatch/ call through the
//! methods here so the invariants hold at every step.

mod model;
mod state;

pub use model::{Job, JobHeader, NodeTask, JOB_ATTR_DEFS};
pub use state::{JobState, JobSubstate};

/// Largest jobid count accepted by one DeleteJobList request.
pub const DELETE_LIST_MAX: usize = 500;

/// Script chunks larger than this are split on the wire.
pub const SCRIPT_CHUNK: usize = 65536;
