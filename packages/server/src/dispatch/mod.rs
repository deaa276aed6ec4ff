//! The request dispatcher.
//!
//! Decode the header, decode the typed body, authorize, hand to the
//! handler, queue the reply. Replies leave a connection in request
//! order; a deferred reply holds its slot in the queue rather than
//! being overtaken.

pub mod handlers;
pub mod reply;
pub mod request;
pub mod service;

pub use reply::{BatchReply, ReplyBody, StatusEntry};
pub use request::{BatchRequest, ReqBody, ReqHeader, ReqType};
pub use service::serve_connection;

/// Batch protocol framing constants.
pub const BATCH_PROT_TYPE: u64 = 2;
pub const BATCH_PROT_VER_OLD: u64 = 1;
pub const BATCH_PROT_VER: u64 = 2;

/// Longest user name the header accepts.
pub const MAX_USER_LEN: usize = 32;
