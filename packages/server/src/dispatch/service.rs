//! The per-connection service loop.
//!
//! One task reads requests in arrival order and dispatches them; a
//! writer task drains the reply queue so replies leave in request
//! order even when a handler defers. Out-of-band pushes (deferred run
//! acks, scheduler commands) ride the same queue behind any earlier
//! replies.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use wire::{DisChan, TimeoutClass};

use super::handlers::{self, Outcome};
use super::reply::{write_reply, BatchReply};
use super::request::{read_request, write_request, BatchRequest};
use crate::common::BatchError;
use crate::domains::sched::{CycleClose, SchedCmd};
use crate::kernel::ServerKernel;
use crate::net::conn::{ConnOrigin, Connection};
use crate::net::context::ClientContext;

/// Reply code for a request answered later (AsyrunJob).
pub const REPLY_CODE_DEFERRED: i64 = 15048;

pub enum ReplySlot {
    Ready(BatchReply),
    /// Holds its place in the queue until the handler resolves it.
    Pending(oneshot::Receiver<BatchReply>),
}

pub enum WriteItem {
    Reply { prot_ver: u64, slot: ReplySlot },
    /// Server-initiated message, e.g. AsyrunJob_ack.
    Push(BatchRequest),
    /// Scheduler command byte on a registered sched channel.
    SchedCmd(SchedCmd),
}

pub type ReplySink = mpsc::Sender<WriteItem>;

/// Per-connection dispatcher state handed to every handler.
pub struct Session {
    pub kernel: Arc<ServerKernel>,
    pub conn: Arc<Connection>,
    pub ctx: ClientContext,
    pub sink: ReplySink,
    pub authenticated: bool,
    pub privileged: bool,
    /// External auth method awaiting its Cred round.
    pub pending_auth: Option<String>,
    pub user: String,
}

impl Session {
    pub fn origin(&self) -> ConnOrigin {
        self.conn.origin(self.ctx.task_token)
    }

    pub fn from_sched(&self) -> bool {
        matches!(
            self.origin(),
            ConnOrigin::SchedPrimary | ConnOrigin::SchedSecondary | ConnOrigin::SchedAny
        )
    }
}

/// Serve one accepted stream until it closes.
pub async fn serve_connection<S>(kernel: Arc<ServerKernel>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Some(conn) = kernel.conns.add(peer.ip(), peer.port()) else {
        warn!(%peer, "connection table full");
        return;
    };
    info!(sock = conn.sock, %peer, "connection accepted");

    let ctx = ClientContext::new(kernel.server_name());
    let (rhalf, whalf) = tokio::io::split(stream);
    let mut rchan = DisChan::with_interrupt(rhalf, ctx.interrupt.clone());
    rchan.set_timeout(TimeoutClass::None);
    let mut wchan = DisChan::new(whalf);

    let (sink, mut sink_rx) = mpsc::channel::<WriteItem>(64);

    // writer: strictly in queue order; a pending slot blocks later
    // replies until resolved
    let writer = tokio::spawn(async move {
        while let Some(item) = sink_rx.recv().await {
            let flush_needed = match item {
                WriteItem::Reply { prot_ver, slot } => {
                    let reply = match slot {
                        ReplySlot::Ready(r) => r,
                        ReplySlot::Pending(rx) => rx
                            .await
                            .unwrap_or_else(|_| BatchReply::error(&BatchError::ConnectionClosed)),
                    };
                    write_reply(&mut wchan, prot_ver, &reply);
                    true
                }
                WriteItem::Push(req) => {
                    write_request(&mut wchan, &req);
                    true
                }
                WriteItem::SchedCmd(cmd) => {
                    wchan.write_uint(cmd.to_wire());
                    true
                }
            };
            if flush_needed && wchan.flush().await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        kernel: kernel.clone(),
        conn: conn.clone(),
        ctx,
        sink: sink.clone(),
        authenticated: false,
        privileged: false,
        pending_auth: None,
        user: String::new(),
    };

    loop {
        let req = tokio::select! {
            _ = kernel.shutdown.cancelled() => break,
            _ = conn.closed.cancelled() => break,
            r = read_request(&mut rchan) => r,
        };
        let req = match req {
            Ok(req) => req,
            Err(BatchError::ConnectionClosed) => break,
            Err(e) => {
                // codec failure: error reply if we can, then close
                debug!(sock = conn.sock, error = %e, "request decode failed");
                let _ = sink
                    .send(WriteItem::Reply {
                        prot_ver: super::BATCH_PROT_VER,
                        slot: ReplySlot::Ready(BatchReply::error(&e)),
                    })
                    .await;
                break;
            }
        };
        conn.touch(session.ctx.task_token);
        let prot_ver = req.header.prot_ver;
        match handlers::dispatch(&mut session, req).await {
            Outcome::Reply(reply) => {
                record_reply_err(&session, &reply);
                if sink
                    .send(WriteItem::Reply {
                        prot_ver,
                        slot: ReplySlot::Ready(reply),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Outcome::Deferred(rx) => {
                if sink
                    .send(WriteItem::Reply {
                        prot_ver,
                        slot: ReplySlot::Pending(rx),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Outcome::Close(reply) => {
                let _ = sink
                    .send(WriteItem::Reply {
                        prot_ver,
                        slot: ReplySlot::Ready(reply),
                    })
                    .await;
                break;
            }
            Outcome::CloseSilent => break,
        }
    }

    // teardown: a scheduler connection cancels its cycle and
    // interrupts deferred replies
    if session.from_sched() {
        if let Some(sched) = kernel.sched_by_sock(conn.sock).await {
            let mut sched = sched.lock().await;
            if sched.primary_sock == Some(conn.sock) {
                sched.primary_sock = None;
            }
            if sched.secondary_sock == Some(conn.sock) {
                sched.secondary_sock = None;
            }
            sched.handle_deferred_cycle_close(CycleClose::Interrupted);
        }
    }
    // removing the slot cancels conn.closed, which stops any feeder
    // task still holding a sink clone; the writer drains once every
    // sender is gone
    kernel.conns.remove(conn.sock);
    drop(session);
    drop(sink);
    let _ = writer.await;
    info!(sock = conn.sock, "connection closed");
}

/// Record the request's outcome in the connection slot so later error
/// queries see it; per-connection overrides keep concurrent
/// connections from colliding.
fn record_reply_err(session: &Session, reply: &BatchReply) {
    let conn = &session.conn;
    let token = session.ctx.task_token;
    if reply.is_err() {
        let text = match &reply.body {
            super::reply::ReplyBody::Text { text, .. } => Some(text.clone()),
            _ => None,
        };
        conn.set_err(token, reply.code, text);
    } else {
        conn.set_err(token, 0, None);
    }
}
