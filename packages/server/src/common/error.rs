//! The batch error enum.
//!
//! One closed set of errors crosses every layer boundary. Each error
//! belongs to a band that tells the caller what to do with it:
//! permanent errors must not be retried, transient errors should be
//! retried with backoff, internal errors are logged and the connection
//! is closed. Numeric codes live in the 15xxx space and ride in the
//! reply's `brp_code` field.

use thiserror::Error;
use wire::{ChanError, DisError};

/// Retry guidance band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorBand {
    Permanent,
    Transient,
    Internal,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BatchError {
    // ---- permanent ----
    #[error("protocol error")]
    Protocol,
    #[error("bad attribute {0}")]
    BadAttribute(String),
    #[error("unknown object {0}")]
    UnknownObject(String),
    #[error("unknown job {0}")]
    UnknownJob(String),
    #[error("unknown queue {0}")]
    UnknownQueue(String),
    #[error("unknown reservation {0}")]
    UnknownResv(String),
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("unknown scheduler {0}")]
    UnknownSched(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("duplicate id {0}")]
    DuplicateId(String),
    #[error("unknown resource {0}")]
    UnknownResource(String),
    #[error("request invalid for job state")]
    BadJobState,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u64),
    #[error("client is not authenticated")]
    NotAuthenticated,
    #[error("unknown request type {0}")]
    BadRequestType(u64),
    #[error("bad credential")]
    BadCredential,
    #[error("too many ids in delete list")]
    DeleteListTooLong,
    #[error("job not committed")]
    JobNotCommitted,
    #[error("request invalid for reservation state")]
    BadResvState,

    // ---- transient ----
    #[error("object store busy")]
    StoreBusy,
    #[error("object store deadlock")]
    Deadlock,
    #[error("node {0} temporarily down")]
    NodeDown(String),
    #[error("scheduler busy")]
    SchedBusy,
    #[error("mom {0} unreachable")]
    MomUnreachable(String),
    #[error("authentication service temporarily unavailable")]
    AuthBusy,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("operation interrupted")]
    Interrupted,

    // ---- internal ----
    #[error("out of memory")]
    OutOfMemory,
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

impl BatchError {
    pub fn band(&self) -> ErrorBand {
        use BatchError::*;
        match self {
            Protocol | BadAttribute(_) | UnknownObject(_) | UnknownJob(_) | UnknownQueue(_)
            | UnknownResv(_) | UnknownNode(_) | UnknownSched(_) | PermissionDenied
            | DuplicateId(_) | UnknownResource(_) | BadJobState | UnsupportedVersion(_)
            | NotAuthenticated | BadRequestType(_) | BadCredential | DeleteListTooLong
            | JobNotCommitted | BadResvState => ErrorBand::Permanent,
            StoreBusy | Deadlock | NodeDown(_) | SchedBusy | MomUnreachable(_) | AuthBusy
            | ConnectionClosed | Interrupted => ErrorBand::Transient,
            OutOfMemory | Invariant(_) | UnexpectedEof => ErrorBand::Internal,
        }
    }

    /// Numeric reply code carried in `brp_code`.
    pub fn code(&self) -> i64 {
        use BatchError::*;
        match self {
            Protocol => 15001,
            BadAttribute(_) => 15002,
            UnknownObject(_) => 15003,
            UnknownJob(_) => 15004,
            UnknownQueue(_) => 15005,
            UnknownResv(_) => 15006,
            PermissionDenied => 15007,
            DuplicateId(_) => 15008,
            UnknownResource(_) => 15009,
            BadJobState => 15010,
            UnsupportedVersion(_) => 15011,
            NotAuthenticated => 15012,
            BadRequestType(_) => 15013,
            BadCredential => 15014,
            DeleteListTooLong => 15015,
            JobNotCommitted => 15016,
            UnknownNode(_) => 15017,
            UnknownSched(_) => 15018,
            BadResvState => 15019,
            StoreBusy => 15040,
            Deadlock => 15041,
            NodeDown(_) => 15042,
            SchedBusy => 15043,
            MomUnreachable(_) => 15044,
            AuthBusy => 15045,
            ConnectionClosed => 15046,
            Interrupted => 15047,
            OutOfMemory => 15080,
            Invariant(_) => 15081,
            UnexpectedEof => 15082,
        }
    }
}

/// Store-layer mapping: sqlx errors become batch errors at the boundary.
impl From<sqlx::Error> for BatchError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                // 40P01 deadlock_detected, 55P03 lock_not_available
                match db.code().as_deref() {
                    Some("40P01") => BatchError::Deadlock,
                    Some("55P03") | Some("53300") => BatchError::StoreBusy,
                    _ => BatchError::Invariant(db.to_string()),
                }
            }
            sqlx::Error::PoolTimedOut => BatchError::StoreBusy,
            sqlx::Error::RowNotFound => BatchError::UnknownObject(String::new()),
            sqlx::Error::Io(_) => BatchError::StoreBusy,
            _ => BatchError::Invariant(e.to_string()),
        }
    }
}

impl From<DisError> for BatchError {
    fn from(e: DisError) -> Self {
        match e {
            DisError::Eod => BatchError::UnexpectedEof,
            DisError::Nomem => BatchError::OutOfMemory,
            _ => BatchError::Protocol,
        }
    }
}

impl From<ChanError> for BatchError {
    fn from(e: ChanError) -> Self {
        match e {
            ChanError::Dis(d) => d.into(),
            ChanError::Timeout => BatchError::Interrupted,
            ChanError::Interrupted => BatchError::Interrupted,
            ChanError::Closed => BatchError::ConnectionClosed,
            ChanError::Io(_) => BatchError::ConnectionClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert_eq!(BatchError::Protocol.band(), ErrorBand::Permanent);
        assert_eq!(BatchError::BadJobState.band(), ErrorBand::Permanent);
        assert_eq!(
            BatchError::DuplicateId("1.host".into()).band(),
            ErrorBand::Permanent
        );
    }

    #[test]
    fn transient_errors_ask_for_backoff() {
        assert_eq!(BatchError::StoreBusy.band(), ErrorBand::Transient);
        assert_eq!(
            BatchError::MomUnreachable("n0".into()).band(),
            ErrorBand::Transient
        );
    }

    #[test]
    fn internal_errors_close_the_stream() {
        assert_eq!(BatchError::UnexpectedEof.band(), ErrorBand::Internal);
    }

    #[test]
    fn codes_are_distinct() {
        let all = [
            BatchError::Protocol,
            BatchError::BadAttribute(String::new()),
            BatchError::UnknownObject(String::new()),
            BatchError::UnknownJob(String::new()),
            BatchError::PermissionDenied,
            BatchError::StoreBusy,
            BatchError::Deadlock,
            BatchError::OutOfMemory,
            BatchError::UnexpectedEof,
        ];
        let mut codes: Vec<i64> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn dis_eod_maps_to_unexpected_eof() {
        assert_eq!(
            BatchError::from(DisError::Eod),
            BatchError::UnexpectedEof
        );
    }
}
