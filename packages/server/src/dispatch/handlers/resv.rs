//! Reservation handlers and the engine's work-task entry points.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::common::{BatchError, Result};
use crate::dispatch::reply::BatchReply;
use crate::dispatch::service::Session;
use crate::domains::attr::{AttrValue, WireAttr};
use crate::domains::queue::{Queue, QueueKind};
use crate::domains::resv::{Resv, ResvState};
use crate::domains::sched::SchedCmd;
use crate::kernel::{SaveKind, ServerKernel, WorkKind};

fn ts(entries: &[WireAttr], name: &str) -> Option<i64> {
    entries
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.parse().ok())
}

/// Create the reservation and its queue with the same lifetime.
pub async fn submit_resv(
    session: &Session,
    user: &str,
    resvid: String,
    attrs: Vec<WireAttr>,
) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let start = ts(&attrs, "reserve_start")
        .ok_or_else(|| BatchError::BadAttribute("reserve_start".into()))?;
    let end = ts(&attrs, "reserve_end")
        .ok_or_else(|| BatchError::BadAttribute("reserve_end".into()))?;
    if end <= start {
        return Err(BatchError::BadAttribute("reserve_end before start".into()));
    }
    let start = DateTime::<Utc>::from_timestamp(start, 0)
        .ok_or_else(|| BatchError::BadAttribute("reserve_start".into()))?;
    let end = DateTime::<Utc>::from_timestamp(end, 0)
        .ok_or_else(|| BatchError::BadAttribute("reserve_end".into()))?;

    let resvid = if resvid.is_empty() {
        kernel.new_resvid().await?
    } else {
        resvid
    };
    let owner = format!("{user}@{}", kernel.server_name());
    let mut resv = Resv::new(resvid.clone(), &owner, start, end);
    resv.attrs.apply_all(&attrs, false)?;
    let i = resv.attrs.idx("queue").expect("queue def");
    resv.attrs.set_value(i, AttrValue::Str(resvid.clone()));

    // the reservation queue: stopped until the window opens
    let mut queue = Queue::new(resvid.clone(), QueueKind::Execution);
    queue.started = false;
    queue.resv_id = Some(resvid.clone());
    let qi = queue.attrs.idx("reservation").expect("reservation def");
    queue
        .attrs
        .set_value(qi, AttrValue::Str(resvid.clone()));

    // both rows or neither
    kernel
        .store
        .insert_resv_with_queue(&mut resv, &mut queue)
        .await?;

    kernel.add_resv(resv).await?;
    kernel.add_queue(queue).await?;
    kernel.raise_sched_cmd(SchedCmd::JobResv, false).await;
    info!(resvid = %resvid, "reservation submitted");
    Ok(BatchReply::jobid(resvid))
}

pub async fn confirm_resv(
    session: &Session,
    resvid: &str,
    exec_vnode: &str,
    start: i64,
) -> Result<BatchReply> {
    let kernel = &session.kernel;
    if !(session.privileged || session.from_sched()) {
        return Err(BatchError::PermissionDenied);
    }
    let resv_arc = kernel.resv(resvid).await?;
    let mut resv = resv_arc.lock().await;
    let start = DateTime::<Utc>::from_timestamp(start, 0)
        .ok_or_else(|| BatchError::BadAttribute("start".into()))?;
    resv.confirm(exec_vnode, start)?;
    kernel.store.save_resv(&mut resv, SaveKind::Full).await?;
    let at = resv.start;
    drop(resv);
    kernel
        .work
        .schedule(at, WorkKind::ResvStart(resvid.to_string()));
    info!(resvid = %resvid, "reservation confirmed");
    Ok(BatchReply::ok())
}

pub async fn modify_resv(
    session: &Session,
    resvid: &str,
    attrs: Vec<WireAttr>,
) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let resv_arc = kernel.resv(resvid).await?;
    let mut resv = resv_arc.lock().await;
    resv.attrs.apply_all(&attrs, false)?;
    if let Some(end) = ts(&attrs, "reserve_end") {
        resv.end = DateTime::<Utc>::from_timestamp(end, 0)
            .ok_or_else(|| BatchError::BadAttribute("reserve_end".into()))?;
    }
    kernel.store.save_resv(&mut resv, SaveKind::Full).await?;
    Ok(BatchReply::ok())
}

pub async fn begin_resv(session: &Session, resvid: &str) -> Result<BatchReply> {
    begin_reservation(&session.kernel, resvid).await?;
    Ok(BatchReply::ok())
}

/// Start-time work item: open the window, make the queue runnable,
/// and arm the occurrence-end task.
pub async fn begin_reservation(kernel: &Arc<ServerKernel>, resvid: &str) -> Result<()> {
    let resv_arc = kernel.resv(resvid).await?;
    let mut resv = resv_arc.lock().await;
    resv.begin()?;
    kernel.store.save_resv(&mut resv, SaveKind::Quick).await?;
    let end = resv.end;
    let occurrence = resv.occurrences_done.len() as u64 + 1;
    drop(resv);

    let queue_arc = kernel.queue(resvid).await?;
    {
        let mut queue = queue_arc.lock().await;
        queue.started = true;
        kernel.store.save_queue(&mut queue, SaveKind::Full).await?;
    }
    kernel
        .work
        .schedule(end, WorkKind::ResvOccurEnd(resvid.to_string(), occurrence));
    kernel.raise_sched_cmd(SchedCmd::JobResv, false).await;
    info!(resvid = %resvid, "reservation period open");
    Ok(())
}

/// Occurrence-end work item; idempotent per occurrence index.
pub async fn occurrence_end(kernel: &Arc<ServerKernel>, resvid: &str, k: u64) -> Result<bool> {
    let resv_arc = kernel.resv(resvid).await?;
    let mut resv = resv_arc.lock().await;
    if !resv.occurrence_end(k) {
        return Ok(false);
    }
    kernel.store.save_resv(&mut resv, SaveKind::Quick).await?;
    let finished = resv.state == ResvState::Finished;
    drop(resv);

    // stop the queue between occurrences, clean up entirely at the end
    if let Ok(queue_arc) = kernel.queue(resvid).await {
        let mut queue = queue_arc.lock().await;
        queue.started = false;
        let _ = kernel.store.save_queue(&mut queue, SaveKind::Full).await;
    }
    if finished {
        if let Err(e) = cascade_delete(kernel, resvid).await {
            warn!(resvid = %resvid, error = %e, "cleanup after final occurrence failed");
        }
    }
    info!(resvid = %resvid, occurrence = k, "occurrence ended");
    Ok(true)
}

pub async fn resv_occur_end(
    session: &Session,
    resvid: &str,
    occurrence: u64,
) -> Result<BatchReply> {
    occurrence_end(&session.kernel, resvid, occurrence).await?;
    Ok(BatchReply::ok())
}

/// Deletion cascades: jobs in the reservation queue are signalled then
/// purged, the queue goes away, then the reservation.
async fn cascade_delete(kernel: &Arc<ServerKernel>, resvid: &str) -> Result<()> {
    if let Ok(queue_arc) = kernel.queue(resvid).await {
        let members: Vec<String> = queue_arc.lock().await.jobs.clone();
        for jobid in members {
            if let Err(e) = super::job::force_purge(kernel, &jobid).await {
                warn!(jobid = %jobid, error = %e, "reservation job purge failed");
            }
        }
        kernel.store.delete_queue(resvid).await?;
        kernel.remove_queue(resvid).await;
    }
    kernel.store.delete_resv(resvid).await?;
    kernel.remove_resv(resvid).await;
    Ok(())
}

/// First delete returns ok; the second caller finds the reservation
/// unknown and no orphan queue behind it.
pub async fn delete_resv(session: &Session, resvid: &str) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let resv_arc = kernel.resv(resvid).await?;
    {
        let mut resv = resv_arc.lock().await;
        if !resv.delete() {
            return Err(BatchError::UnknownResv(resvid.to_string()));
        }
    }
    cascade_delete(kernel, resvid).await?;
    info!(resvid = %resvid, "reservation deleted");
    Ok(BatchReply::ok())
}

/// A reservation whose nodes were lost drops to Degraded until the
/// scheduler reconfirms it with a new placement.
pub async fn degrade_resv(kernel: &Arc<ServerKernel>, resvid: &str) -> Result<()> {
    let resv_arc = kernel.resv(resvid).await?;
    let mut resv = resv_arc.lock().await;
    resv.degrade();
    kernel.store.save_resv(&mut resv, SaveKind::Quick).await?;
    drop(resv);
    kernel.raise_sched_cmd(SchedCmd::JobResv, true).await;
    Ok(())
}
