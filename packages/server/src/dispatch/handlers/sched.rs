//! Scheduler protocol handlers.
//!
//! RegisterSched binds a scheduler object to its primary and secondary
//! channels; a feeder task pushes raised commands down the primary
//! channel one cycle at a time.

use std::time::Duration;

use tracing::{debug, info};

use crate::common::{BatchError, Result};
use crate::dispatch::reply::BatchReply;
use crate::dispatch::service::{Session, WriteItem};
use crate::domains::sched::{CycleClose, Scheduler};
use crate::kernel::SaveKind;
use crate::net::conn::ConnOrigin;

pub async fn register_sched(
    session: &mut Session,
    name: &str,
    secondary: bool,
) -> Result<BatchReply> {
    if !session.privileged {
        return Err(BatchError::PermissionDenied);
    }
    let kernel = &session.kernel;
    let sched_arc = match kernel.sched(name).await {
        Ok(s) => s,
        Err(_) => {
            let mut sched = Scheduler::new(name);
            kernel.store.save_sched(&mut sched, SaveKind::Insert).await?;
            kernel.add_sched(sched).await
        }
    };

    let origin = if secondary {
        ConnOrigin::SchedSecondary
    } else {
        ConnOrigin::SchedPrimary
    };
    session.conn.set_origin(session.ctx.task_token, origin);
    // sched channels sit idle between cycles; exempt them from the sweep
    session
        .conn
        .authen_set(session.ctx.task_token, crate::net::conn::authen::NOTIMEOUT);

    let mailbox = {
        let mut sched = sched_arc.lock().await;
        if secondary {
            sched.secondary_sock = Some(session.conn.sock);
            None
        } else {
            sched.primary_sock = Some(session.conn.sock);
            Some(sched.mailbox.clone())
        }
    };

    // the primary channel gets the command feeder
    if let Some(mailbox) = mailbox {
        let sink = session.sink.clone();
        let sched_arc = sched_arc.clone();
        let closed = session.conn.closed.clone();
        tokio::spawn(async move {
            loop {
                let cmd = tokio::select! {
                    _ = closed.cancelled() => break,
                    cmd = mailbox.recv() => cmd,
                };
                // one cycle in flight at a time; later commands wait
                loop {
                    {
                        let mut sched = sched_arc.lock().await;
                        if !sched.cycle_started {
                            sched.cycle_started = true;
                            break;
                        }
                    }
                    tokio::select! {
                        _ = closed.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
                debug!(?cmd, "scheduler command pushed");
                if sink.send(WriteItem::SchedCmd(cmd)).await.is_err() {
                    break;
                }
            }
        });
    }
    info!(sched = %name, secondary, sock = session.conn.sock, "scheduler registered");
    Ok(BatchReply::ok())
}

/// Cycle end from the scheduler. Pending deferred run replies resolve
/// as success (normal end) or interrupted.
pub async fn def_sch_reply(session: &Session, status: u64) -> Result<BatchReply> {
    let sched_arc = session
        .kernel
        .sched_by_sock(session.conn.sock)
        .await
        .ok_or_else(|| BatchError::UnknownSched(format!("sock {}", session.conn.sock)))?;
    let close = if status == 0 {
        CycleClose::Success
    } else {
        CycleClose::Interrupted
    };
    let mut sched = sched_arc.lock().await;
    sched.handle_deferred_cycle_close(close);
    let cycle_len = sched
        .attr_long("sched_cycle_length")
        .unwrap_or(crate::domains::sched::SCHED_CYCLE_LEN_DEFAULT);
    sched.next_cycle = Some(chrono::Utc::now() + chrono::TimeDelta::seconds(cycle_len));
    debug!(sched = %sched.name, ?close, "cycle closed");
    Ok(BatchReply::ok())
}
