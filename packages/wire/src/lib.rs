//! DIS wire codec and transports for the batch protocol.
//!
//! This crate provides the three layers everything else speaks through:
//! - [`codec`] - the self-describing base-10 primitive encoding (DIS)
//! - [`chan`] - buffered, timeout-bounded channels over byte streams
//! - [`mesh`] - the multiplexed mesh transport (MT) with multicast

pub mod chan;
pub mod codec;
pub mod mesh;

pub use chan::{ChanError, DisChan, TimeoutClass};
pub use codec::{DisCursor, DisError};
pub use mesh::{MeshError, MeshHub, MeshMsg, PeerResult};
