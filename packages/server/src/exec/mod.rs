//! Execution fan-out: the server side of the MoM conversation.

pub mod is_proto;
pub mod mom;

pub use is_proto::{IsMsg, IM_PROTOCOL, IM_PROTOCOL_VER, IS_PROTOCOL, IS_PROTOCOL_VER};
pub use mom::{launch_job, run_is_listener, signal_job, VnodeAlloc};
