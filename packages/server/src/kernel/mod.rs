//! Kernel infrastructure: the dependency hub, the object store and the
//! work-task timer.

pub mod server_kernel;
pub mod store;
pub mod work;

pub use server_kernel::ServerKernel;
pub use store::{Cursor, HotUpdate, ObjStore, SaveKind, StoreTx};
pub use work::{WorkKind, WorkQueue, WorkTask};
