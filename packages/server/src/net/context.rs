//! Per-client context.
//!
//! Every connection task owns one of these; errors from concurrent
//! operations on different connections never collide because the
//! context travels with the call chain instead of living in a global.
//! Connection error fields shuttle between the context and the table
//! slot at lock boundaries: restored on acquire, copied back on
//! release.
//!
//! A single-threaded daemon can enable daemon mode, which makes the
//! reentrant slot locks free by funneling every caller through one
//! owner token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use wire::TimeoutClass;

use super::conn::Connection;

static NEXT_TASK_TOKEN: AtomicU64 = AtomicU64::new(1);
static DAEMON_MODE: AtomicBool = AtomicBool::new(false);

/// Owner token shared by every caller in daemon mode.
const DAEMON_TOKEN: u64 = 0;

/// Switch the process to single-threaded accessors.
pub fn set_daemon_mode(enabled: bool) {
    DAEMON_MODE.store(enabled, Ordering::Relaxed);
}

pub fn daemon_mode() -> bool {
    DAEMON_MODE.load(Ordering::Relaxed)
}

#[derive(Debug)]
pub struct ClientContext {
    /// Owner token for reentrant slot locks.
    pub task_token: u64,
    pub errno: i64,
    pub errtxt: Option<String>,
    pub user: String,
    pub server_name: String,
    pub timeout: TimeoutClass,
    pub interrupt: CancellationToken,
    /// Per-open-connection error overrides, keyed by connection id.
    conn_errs: HashMap<u64, (i64, Option<String>)>,
}

impl ClientContext {
    pub fn new(server_name: &str) -> Self {
        let task_token = if daemon_mode() {
            DAEMON_TOKEN
        } else {
            NEXT_TASK_TOKEN.fetch_add(1, Ordering::Relaxed)
        };
        Self {
            task_token,
            errno: 0,
            errtxt: None,
            user: String::new(),
            server_name: server_name.to_string(),
            timeout: TimeoutClass::Short,
            interrupt: CancellationToken::new(),
            conn_errs: HashMap::new(),
        }
    }

    pub fn set_conn_err(&mut self, sock: u64, errno: i64, errtxt: Option<String>) {
        self.conn_errs.insert(sock, (errno, errtxt));
    }

    pub fn conn_err(&self, sock: u64) -> Option<&(i64, Option<String>)> {
        self.conn_errs.get(&sock)
    }

    pub fn clear_conn_err(&mut self, sock: u64) {
        self.conn_errs.remove(&sock);
    }

    /// Run against a connection slot under its reentrant lock: the
    /// slot's error state is restored into the context first and the
    /// context's state is copied back on release.
    pub fn with_conn<T>(
        &mut self,
        conn: &Connection,
        f: impl FnOnce(&mut ClientContext) -> T,
    ) -> T {
        let token = self.task_token;
        let sock = conn.sock;
        // restore on acquire
        let (errno, errtxt) = conn.last_err(token);
        self.errno = errno;
        self.errtxt = errtxt;
        let result = f(self);
        // copy back on release
        conn.set_err(token, self.errno, self.errtxt.clone());
        self.conn_errs
            .insert(sock, (self.errno, self.errtxt.clone()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::conn::ConnTable;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn contexts_get_distinct_tokens() {
        let a = ClientContext::new("host");
        let b = ClientContext::new("host");
        assert_ne!(a.task_token, b.task_token);
    }

    #[test]
    fn conn_err_state_shuttles_through_slot() {
        let table = ConnTable::new();
        let conn = table
            .add(IpAddr::V4(Ipv4Addr::LOCALHOST), 1023)
            .unwrap();
        let mut ctx = ClientContext::new("host");

        ctx.with_conn(&conn, |ctx| {
            ctx.errno = 15010;
            ctx.errtxt = Some("bad state".into());
        });
        // a different context sees the copied-back slot state
        let mut other = ClientContext::new("host");
        other.with_conn(&conn, |ctx| {
            assert_eq!(ctx.errno, 15010);
            assert_eq!(ctx.errtxt.as_deref(), Some("bad state"));
        });
    }

    #[test]
    fn per_connection_overrides_do_not_collide() {
        let mut ctx = ClientContext::new("host");
        ctx.set_conn_err(3, 15001, None);
        ctx.set_conn_err(4, 15007, Some("denied".into()));
        assert_eq!(ctx.conn_err(3).unwrap().0, 15001);
        assert_eq!(ctx.conn_err(4).unwrap().0, 15007);
        ctx.clear_conn_err(3);
        assert!(ctx.conn_err(3).is_none());
    }
}
