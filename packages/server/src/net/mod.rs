//! Connection management and authentication.

pub mod auth;
pub mod conn;
pub mod context;

pub use conn::{authen, ConnOrigin, ConnTable, Connection};
pub use context::ClientContext;
