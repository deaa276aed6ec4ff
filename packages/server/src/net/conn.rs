//! The process-wide connection table.
//!
//! One slot per live connection, keyed by connection id. Each slot
//! carries the peer identity, the authen flag bits, the origin tag and
//! the last-error fields, behind a reentrant `{owner, depth}` lock so
//! a task may re-enter while it already holds the slot.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Flag bits for the connection's authen field.
pub mod authen {
    pub const AUTHENTICATED: u32 = 0x01;
    pub const FROM_PRIVIL: u32 = 0x02;
    pub const NOTIMEOUT: u32 = 0x04;
    pub const PREVENT_IP_SPOOFING: u32 = 0x20;
}

/// Hard cap on live connections.
pub const MAX_CONNECTIONS: usize = 5000;

/// Idle connections beyond this many seconds are swept unless
/// NOTIMEOUT is set.
pub const MAX_CONNECT_IDLE_SECS: i64 = 900;

/// Where a connection came from; scheduler channels are tagged so the
/// server can route pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnOrigin {
    #[default]
    Unknown,
    SchedPrimary,
    SchedSecondary,
    SchedAny,
}

/// A `{owner, depth}` reentrant lock. The owner is a task token, not a
/// thread id, since one task may hop threads between polls but never
/// holds the lock across an await.
pub struct ReentrantLock {
    state: Mutex<(Option<u64>, u32)>,
    cv: Condvar,
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self {
            state: Mutex::new((None, 0)),
            cv: Condvar::new(),
        }
    }
}

impl ReentrantLock {
    pub fn acquire(&self, owner: u64) {
        let mut st = self.state.lock().unwrap();
        loop {
            match st.0 {
                None => {
                    *st = (Some(owner), 1);
                    return;
                }
                Some(o) if o == owner => {
                    st.1 += 1;
                    return;
                }
                Some(_) => {
                    st = self.cv.wait(st).unwrap();
                }
            }
        }
    }

    pub fn release(&self, owner: u64) {
        let mut st = self.state.lock().unwrap();
        debug_assert_eq!(st.0, Some(owner), "release by non-owner");
        st.1 = st.1.saturating_sub(1);
        if st.1 == 0 {
            st.0 = None;
            self.cv.notify_one();
        }
    }

    pub fn depth(&self) -> u32 {
        self.state.lock().unwrap().1
    }
}

/// Mutable per-connection state, accessed under the slot lock.
#[derive(Debug)]
pub struct ConnState {
    pub errno: i64,
    pub errtxt: Option<String>,
    pub username: String,
    pub authen: u32,
    pub origin: ConnOrigin,
    pub peer_addr: IpAddr,
    pub peer_port: u16,
    pub last_active: DateTime<Utc>,
}

pub struct Connection {
    pub sock: u64,
    state: Mutex<ConnState>,
    lock: ReentrantLock,
    /// Cancelled when the connection is being torn down.
    pub closed: CancellationToken,
}

impl Connection {
    fn new(sock: u64, peer_addr: IpAddr, peer_port: u16) -> Self {
        Self {
            sock,
            state: Mutex::new(ConnState {
                errno: 0,
                errtxt: None,
                username: String::new(),
                authen: 0,
                origin: ConnOrigin::Unknown,
                peer_addr,
                peer_port,
                last_active: Utc::now(),
            }),
            lock: ReentrantLock::default(),
            closed: CancellationToken::new(),
        }
    }

    /// Run under the slot's reentrant lock. `owner` is the caller's
    /// task token; reentry from the same owner nests.
    pub fn with_state<T>(&self, owner: u64, f: impl FnOnce(&mut ConnState) -> T) -> T {
        self.lock.acquire(owner);
        let result = {
            let mut st = self.state.lock().unwrap();
            f(&mut st)
        };
        self.lock.release(owner);
        result
    }

    pub fn touch(&self, owner: u64) {
        self.with_state(owner, |st| st.last_active = Utc::now());
    }

    pub fn set_err(&self, owner: u64, errno: i64, errtxt: Option<String>) {
        self.with_state(owner, |st| {
            st.errno = errno;
            st.errtxt = errtxt;
        });
    }

    pub fn last_err(&self, owner: u64) -> (i64, Option<String>) {
        self.with_state(owner, |st| (st.errno, st.errtxt.clone()))
    }

    pub fn authen_set(&self, owner: u64, bits: u32) {
        self.with_state(owner, |st| st.authen |= bits);
    }

    pub fn authen_has(&self, owner: u64, bits: u32) -> bool {
        self.with_state(owner, |st| st.authen & bits == bits)
    }

    pub fn set_origin(&self, owner: u64, origin: ConnOrigin) {
        self.with_state(owner, |st| st.origin = origin);
    }

    pub fn origin(&self, owner: u64) -> ConnOrigin {
        self.with_state(owner, |st| st.origin)
    }

    pub fn set_username(&self, owner: u64, user: &str) {
        self.with_state(owner, |st| st.username = user.to_string());
    }

    pub fn peer(&self, owner: u64) -> (IpAddr, u16) {
        self.with_state(owner, |st| (st.peer_addr, st.peer_port))
    }

    /// Spoof-prevent: the peer address is pinned to its initial value.
    /// Returns false when the presented address no longer matches.
    pub fn check_pinned_addr(&self, owner: u64, addr: IpAddr) -> bool {
        self.with_state(owner, |st| {
            if st.authen & authen::PREVENT_IP_SPOOFING == 0 {
                return true;
            }
            st.peer_addr == addr
        })
    }
}

/// The table itself: a growable slot array keyed by connection id.
pub struct ConnTable {
    slots: Mutex<Vec<Option<std::sync::Arc<Connection>>>>,
    next_id: AtomicU64,
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Accept a new connection into the table.
    pub fn add(&self, peer_addr: IpAddr, peer_port: u16) -> Option<std::sync::Arc<Connection>> {
        let mut slots = self.slots.lock().unwrap();
        let live = slots.iter().filter(|s| s.is_some()).count();
        if live >= MAX_CONNECTIONS {
            return None;
        }
        let sock = self.next_id.fetch_add(1, Ordering::Relaxed);
        let idx = sock as usize;
        if idx >= slots.len() {
            slots.resize(idx + 10, None);
        }
        let conn = std::sync::Arc::new(Connection::new(sock, peer_addr, peer_port));
        slots[idx] = Some(conn.clone());
        Some(conn)
    }

    pub fn get(&self, sock: u64) -> Option<std::sync::Arc<Connection>> {
        self.slots.lock().unwrap().get(sock as usize)?.clone()
    }

    /// Drop the slot and signal the owning task to stop.
    pub fn remove(&self, sock: u64) -> Option<std::sync::Arc<Connection>> {
        let mut slots = self.slots.lock().unwrap();
        let conn = slots.get_mut(sock as usize)?.take();
        if let Some(c) = &conn {
            c.closed.cancel();
        }
        conn
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Close connections idle beyond the cap. NOTIMEOUT connections are
    /// exempt. Returns how many were swept.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let mut swept = 0;
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            let Some(conn) = slot else { continue };
            let (idle, exempt) = {
                let st = conn.state.lock().unwrap();
                (
                    (now - st.last_active).num_seconds(),
                    st.authen & authen::NOTIMEOUT != 0,
                )
            };
            if !exempt && idle > MAX_CONNECT_IDLE_SECS {
                debug!(sock = conn.sock, idle, "sweeping idle connection");
                conn.closed.cancel();
                *slot = None;
                swept += 1;
            }
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::net::Ipv4Addr;

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn add_get_remove_cycle() {
        let table = ConnTable::new();
        let conn = table.add(addr(), 1023).unwrap();
        assert_eq!(table.live_count(), 1);
        assert!(table.get(conn.sock).is_some());
        table.remove(conn.sock);
        assert_eq!(table.live_count(), 0);
        assert!(conn.closed.is_cancelled());
    }

    #[test]
    fn reentrant_lock_nests_for_same_owner() {
        let lock = ReentrantLock::default();
        lock.acquire(7);
        lock.acquire(7);
        assert_eq!(lock.depth(), 2);
        lock.release(7);
        assert_eq!(lock.depth(), 1);
        lock.release(7);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn error_fields_survive_round_trip() {
        let table = ConnTable::new();
        let conn = table.add(addr(), 1023).unwrap();
        conn.set_err(1, 15001, Some("protocol error".into()));
        assert_eq!(conn.last_err(1), (15001, Some("protocol error".into())));
    }

    #[test]
    fn idle_sweep_skips_notimeout() {
        let table = ConnTable::new();
        let a = table.add(addr(), 1023).unwrap();
        let b = table.add(addr(), 1024).unwrap();
        b.authen_set(1, authen::NOTIMEOUT);
        // age both past the cap
        for conn in [&a, &b] {
            conn.with_state(1, |st| {
                st.last_active = Utc::now() - TimeDelta::seconds(MAX_CONNECT_IDLE_SECS + 1)
            });
        }
        let swept = table.sweep_idle(Utc::now());
        assert_eq!(swept, 1);
        assert!(table.get(a.sock).is_none());
        assert!(table.get(b.sock).is_some());
    }

    #[test]
    fn pinned_addr_rejects_changed_peer() {
        let table = ConnTable::new();
        let conn = table.add(addr(), 1023).unwrap();
        conn.authen_set(1, authen::PREVENT_IP_SPOOFING);
        assert!(conn.check_pinned_addr(1, addr()));
        assert!(!conn.check_pinned_addr(1, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
    }
}
