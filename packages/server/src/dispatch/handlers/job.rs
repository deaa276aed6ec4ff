//! Job lifecycle handlers.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::common::{BatchError, ErrorBand, Result};
use crate::dispatch::reply::{BatchReply, ReplyBody};
use crate::dispatch::request::{encode_request, BatchRequest, ReqBody, ReqType};
use crate::dispatch::service::{Session, WriteItem, REPLY_CODE_DEFERRED};
use crate::domains::attr::{perm, AttrValue, WireAttr};
use crate::domains::job::{Job, JobState, JobSubstate, DELETE_LIST_MAX};
use crate::domains::sched::{DeferredRun, PreemptMethod, SchedCmd};
use crate::exec;
use crate::kernel::{SaveKind, ServerKernel, WorkKind};

use super::Outcome;

/// Default lifetime of a finished job's history record.
const HISTORY_DURATION_SECS: i64 = 14 * 24 * 3600;

fn check_attr_perms(job: &Job, entries: &[WireAttr], session: &Session) -> Result<()> {
    for e in entries {
        let Some(i) = job.attrs.idx(&e.name) else {
            continue;
        };
        let perms = job.attrs.defs()[i].perms;
        if perms & perm::READ_ONLY != 0 && !session.privileged {
            return Err(BatchError::PermissionDenied);
        }
        if perms & perm::MGR_ONLY != 0 && !session.privileged {
            return Err(BatchError::PermissionDenied);
        }
        if perms & perm::SCHED_SET != 0 && !(session.privileged || session.from_sched()) {
            return Err(BatchError::PermissionDenied);
        }
    }
    Ok(())
}

pub async fn queue_job(
    session: &mut Session,
    user: &str,
    jobid: String,
    dest: String,
    attrs: Vec<WireAttr>,
) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let queue_name = if dest.is_empty() {
        kernel.svr.lock().await.default_queue()
    } else {
        dest
    };
    // destination must exist before the job is accepted
    let queue_arc = kernel.queue(&queue_name).await?;
    {
        let q = queue_arc.lock().await;
        if !q.enabled {
            return Err(BatchError::BadJobState);
        }
    }
    let jobid = if jobid.is_empty() {
        kernel.new_jobid().await?
    } else {
        jobid
    };
    let owner = format!("{user}@{}", kernel.server_name());
    let mut job = Job::new(jobid.clone(), &owner, &queue_name, kernel.server_name());
    check_attr_perms(&job, &attrs, session)?;
    job.attrs.apply_all(&attrs, false)?;
    kernel.add_job(job).await?;
    debug!(jobid = %jobid, queue = %queue_name, "job staged");
    Ok(BatchReply::jobid(jobid))
}

pub async fn job_script(session: &Session, jobid: &str, chunk: Vec<u8>) -> Result<BatchReply> {
    let job = session.kernel.job(jobid).await?;
    let mut job = job.lock().await;
    match &mut job.script {
        Some(script) => script.extend_from_slice(&chunk),
        None => job.script = Some(chunk),
    }
    Ok(BatchReply::ok())
}

pub async fn rdy_to_commit(session: &Session, jobid: &str) -> Result<BatchReply> {
    // validation only; the job stays uncommitted
    let job = session.kernel.job(jobid).await?;
    let job = job.lock().await;
    if job.header.state != JobState::Transit && !job.committed {
        return Err(BatchError::BadJobState);
    }
    Ok(BatchReply::jobid(jobid))
}

pub async fn commit(session: &Session, jobid: &str) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let job_arc = kernel.job(jobid).await?;
    let mut job = job_arc.lock().await;
    if job.committed {
        // Commit after success is a no-op
        return Ok(BatchReply::jobid(jobid));
    }
    job.commit()?;
    let queue_arc = kernel.queue(&job.header.queue).await?;
    {
        let mut queue = queue_arc.lock().await;
        let rank = queue.admit(jobid)?;
        job.header.queue_rank = rank;
    }
    kernel.store.save_job(&mut job, SaveKind::Insert).await?;
    drop(job);
    kernel.raise_sched_cmd(SchedCmd::JobNew, false).await;
    info!(jobid = %jobid, "job committed");
    Ok(BatchReply::jobid(jobid))
}

/// Forced purge for reservation teardown: signal a running job's MoM,
/// then remove the job regardless of state.
pub async fn force_purge(kernel: &Arc<ServerKernel>, jobid: &str) -> Result<()> {
    if let Ok(job_arc) = kernel.job(jobid).await {
        let mom = {
            let job = job_arc.lock().await;
            if job.header.state == JobState::Running {
                job.header.mom_addr.clone()
            } else {
                None
            }
        };
        if let Some(mom) = mom {
            let _ = exec::signal_job(kernel, &mom, jobid, "SIGTERM").await;
        }
    }
    purge_job(kernel, jobid).await
}

/// Remove a job from its queue, the store, and the registry.
async fn purge_job(kernel: &Arc<ServerKernel>, jobid: &str) -> Result<()> {
    if let Ok(job_arc) = kernel.job(jobid).await {
        let queue_name = job_arc.lock().await.header.queue.clone();
        if let Ok(queue) = kernel.queue(&queue_name).await {
            queue.lock().await.evict(jobid);
        }
    }
    kernel.store.delete_job(jobid).await?;
    kernel.remove_job(jobid).await;
    Ok(())
}

async fn delete_one(kernel: &Arc<ServerKernel>, jobid: &str) -> Result<()> {
    let job_arc = kernel.committed_job(jobid).await?;
    let mut job = job_arc.lock().await;
    match job.header.state {
        JobState::Running => {
            // signal, then wait for the obit to drain
            let mom = job
                .header
                .mom_addr
                .clone()
                .ok_or_else(|| BatchError::Invariant(format!("{jobid} running without mom")))?;
            job.set_state(JobState::Exiting, JobSubstate::Abort)?;
            kernel.store.save_job(&mut job, SaveKind::Quick).await?;
            drop(job);
            let _ = exec::signal_job(kernel, &mom, jobid, "SIGTERM").await;
            Ok(())
        }
        JobState::Exiting => Ok(()),
        JobState::Queued
        | JobState::Held
        | JobState::Waiting
        | JobState::Finished
        | JobState::Moved => {
            drop(job);
            purge_job(kernel, jobid).await
        }
        _ => Err(BatchError::BadJobState),
    }
}

pub async fn delete_job(session: &Session, jobid: &str) -> Result<BatchReply> {
    delete_one(&session.kernel, jobid).await?;
    Ok(BatchReply::ok())
}

pub async fn delete_job_list(
    session: &Session,
    jobids: Vec<String>,
    resume_from: Option<String>,
) -> Result<BatchReply> {
    if jobids.len() > DELETE_LIST_MAX {
        return Err(BatchError::DeleteListTooLong);
    }
    let start = match &resume_from {
        Some(token) => jobids
            .iter()
            .position(|j| j == token)
            .map(|i| i + 1)
            .unwrap_or(0),
        None => 0,
    };
    let mut statuses = Vec::with_capacity(jobids.len());
    for jobid in &jobids[start..] {
        let code = match delete_one(&session.kernel, jobid).await {
            Ok(()) => 0,
            Err(e) => e.code(),
        };
        statuses.push((jobid.clone(), code));
    }
    Ok(BatchReply {
        code: 0,
        auxcode: 0,
        body: ReplyBody::DeleteList(statuses),
    })
}

pub async fn hold_job(session: &Session, jobid: &str, holds: &str) -> Result<BatchReply> {
    let job = session.kernel.committed_job(jobid).await?;
    let mut job = job.lock().await;
    job.hold(if holds.is_empty() { "u" } else { holds })?;
    session.kernel.store.save_job(&mut job, SaveKind::Quick).await?;
    Ok(BatchReply::ok())
}

pub async fn release_job(session: &Session, jobid: &str, holds: &str) -> Result<BatchReply> {
    let job = session.kernel.committed_job(jobid).await?;
    let mut job = job.lock().await;
    job.release(if holds.is_empty() { "u" } else { holds })?;
    session.kernel.store.save_job(&mut job, SaveKind::Quick).await?;
    Ok(BatchReply::ok())
}

pub async fn modify_job(
    session: &Session,
    jobid: &str,
    attrs: Vec<WireAttr>,
    asynchronous: bool,
) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let job_arc = kernel.committed_job(jobid).await?;
    let mut job = job_arc.lock().await;
    check_attr_perms(&job, &attrs, session)?;
    job.attrs.apply_all(&attrs, false)?;
    if asynchronous {
        // ack first, persist off the request path
        let kernel = kernel.clone();
        let job_arc = job_arc.clone();
        drop(job);
        tokio::spawn(async move {
            let mut job = job_arc.lock().await;
            if let Err(e) = kernel.store.save_job(&mut job, SaveKind::Full).await {
                warn!(error = %e, "async modify save failed");
            }
        });
    } else {
        kernel.store.save_job(&mut job, SaveKind::Full).await?;
    }
    Ok(BatchReply::ok())
}

pub async fn order_job(session: &Session, job1: &str, job2: &str) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let a = kernel.committed_job(job1).await?;
    let b = kernel.committed_job(job2).await?;
    let (qa, qb) = (
        a.lock().await.header.queue.clone(),
        b.lock().await.header.queue.clone(),
    );
    if qa == qb {
        let queue = kernel.queue(&qa).await?;
        queue.lock().await.swap(job1, job2)?;
        let mut ja = a.lock().await;
        let mut jb = b.lock().await;
        std::mem::swap(&mut ja.header.queue_rank, &mut jb.header.queue_rank);
        kernel.store.save_job(&mut ja, SaveKind::Quick).await?;
        kernel.store.save_job(&mut jb, SaveKind::Quick).await?;
    } else {
        // swap queue membership across queues
        let queue_a = kernel.queue(&qa).await?;
        let queue_b = kernel.queue(&qb).await?;
        {
            let mut ga = queue_a.lock().await;
            let mut gb = queue_b.lock().await;
            ga.evict(job1);
            gb.evict(job2);
            ga.admit(job2)?;
            gb.admit(job1)?;
        }
        let mut ja = a.lock().await;
        let mut jb = b.lock().await;
        ja.header.queue = qb.clone();
        jb.header.queue = qa.clone();
        ja.set_attr_str("queue", &qb)?;
        jb.set_attr_str("queue", &qa)?;
        kernel.store.save_job(&mut ja, SaveKind::Full).await?;
        kernel.store.save_job(&mut jb, SaveKind::Full).await?;
    }
    Ok(BatchReply::ok())
}

pub async fn move_job(session: &Session, jobid: &str, destination: &str) -> Result<BatchReply> {
    let kernel = &session.kernel;
    match destination.split_once('@') {
        None => {
            // local move: membership swap is atomic under both locks
            let job_arc = kernel.committed_job(jobid).await?;
            let mut job = job_arc.lock().await;
            if !matches!(
                job.header.state,
                JobState::Queued | JobState::Held | JobState::Waiting
            ) {
                return Err(BatchError::BadJobState);
            }
            let old = kernel.queue(&job.header.queue).await?;
            let new = kernel.queue(destination).await?;
            {
                let mut old_q = old.lock().await;
                let mut new_q = new.lock().await;
                if !new_q.enabled {
                    return Err(BatchError::BadJobState);
                }
                old_q.evict(jobid);
                let rank = new_q.admit(jobid)?;
                job.header.queue_rank = rank;
            }
            job.header.queue = destination.to_string();
            job.set_attr_str("queue", destination)?;
            kernel.store.save_job(&mut job, SaveKind::Full).await?;
            Ok(BatchReply::ok())
        }
        Some(_) => match remote_move(kernel, jobid, destination).await {
            Ok(()) => Ok(BatchReply::ok()),
            Err(e) if e.band() == ErrorBand::Transient => {
                // stays queued locally; the move retries
                kernel.work.schedule(
                    chrono::Utc::now() + chrono::TimeDelta::seconds(30),
                    WorkKind::MoveRetry {
                        jobid: jobid.to_string(),
                        destination: destination.to_string(),
                    },
                );
                Err(e)
            }
            Err(e) => Err(e),
        },
    }
}

/// Push the job to another server: QueueJob + JobScript + Commit over
/// the mesh, then mark it moved and drop the local row.
async fn remote_move(kernel: &Arc<ServerKernel>, jobid: &str, destination: &str) -> Result<()> {
    let (queue, host) = destination
        .split_once('@')
        .ok_or_else(|| BatchError::UnknownQueue(destination.to_string()))?;
    let job_arc = kernel.committed_job(jobid).await?;
    let (attrs, script, owner) = {
        let job = job_arc.lock().await;
        if !matches!(
            job.header.state,
            JobState::Queued | JobState::Held | JobState::Waiting
        ) {
            return Err(BatchError::BadJobState);
        }
        (
            job.attrs.encode_wire(),
            job.script.clone(),
            match job.attrs.get_by_name("Job_Owner") {
                Some(AttrValue::Str(o)) => o.clone(),
                _ => String::new(),
            },
        )
    };

    let send = |req: BatchRequest| {
        let kernel = kernel.clone();
        let host = host.to_string();
        async move {
            kernel
                .mesh
                .send_acked(&host, encode_request(&req))
                .await
                .map_err(|_| BatchError::MomUnreachable(host.clone()))
        }
    };

    send(BatchRequest::new(
        ReqType::QueueJob,
        &owner,
        ReqBody::QueueJob {
            jobid: jobid.to_string(),
            dest: queue.to_string(),
            attrs,
        },
    ))
    .await?;
    if let Some(script) = script {
        send(BatchRequest::new(
            ReqType::JobScript,
            &owner,
            ReqBody::JobScript {
                jobid: jobid.to_string(),
                chunk: script,
            },
        ))
        .await?;
    }
    send(BatchRequest::new(
        ReqType::Commit,
        &owner,
        ReqBody::Commit {
            jobid: jobid.to_string(),
        },
    ))
    .await?;

    // full success: local state becomes MOVED and the row goes away
    let mut job = job_arc.lock().await;
    let old_queue = job.header.queue.clone();
    job.moved()?;
    drop(job);
    if let Ok(q) = kernel.queue(&old_queue).await {
        q.lock().await.evict(jobid);
    }
    kernel.store.delete_job(jobid).await?;
    kernel
        .tracking
        .write()
        .await
        .insert(jobid.to_string(), (1, destination.to_string(), "M".into()));
    info!(jobid = %jobid, destination = %destination, "job moved");
    Ok(())
}

/// Work-task retry of a transiently failed remote move.
pub async fn retry_move(
    kernel: &Arc<ServerKernel>,
    jobid: &str,
    destination: &str,
) -> Result<()> {
    match remote_move(kernel, jobid, destination).await {
        Ok(()) => Ok(()),
        Err(e) if e.band() == ErrorBand::Transient => {
            kernel.work.schedule(
                chrono::Utc::now() + chrono::TimeDelta::seconds(30),
                WorkKind::MoveRetry {
                    jobid: jobid.to_string(),
                    destination: destination.to_string(),
                },
            );
            Ok(())
        }
        Err(e) => {
            warn!(jobid = %jobid, error = %e, "move retry failed permanently");
            Ok(())
        }
    }
}

/// The launch path shared by RunJob and AsyrunJob.
async fn do_run(kernel: &Arc<ServerKernel>, jobid: &str, exec_vnode: &str) -> Result<()> {
    let job_arc = kernel.committed_job(jobid).await?;
    let snapshot = {
        let job = job_arc.lock().await;
        if !matches!(job.header.state, JobState::Queued | JobState::Waiting) {
            return Err(BatchError::BadJobState);
        }
        job.clone()
    };
    let (mom, port) = exec::launch_job(kernel, &snapshot, exec_vnode).await?;
    let mut job = job_arc.lock().await;
    job.run(exec_vnode, &mom, port)?;
    job.tasks = exec::mom::parse_exec_vnode(exec_vnode)?
        .into_iter()
        .map(|a| crate::domains::job::NodeTask {
            vnode: a.vnode,
            resources: a.resources,
        })
        .collect();
    // the placement is new attribute data, so this save is full
    kernel.store.save_job(&mut job, SaveKind::Full).await?;
    Ok(())
}

pub async fn run_job(
    session: &mut Session,
    jobid: &str,
    exec_vnode: &str,
    asynchronous: bool,
) -> Outcome {
    if !(session.privileged || session.from_sched()) {
        return Outcome::Reply(BatchReply::error(&BatchError::PermissionDenied));
    }
    let kernel = session.kernel.clone();
    if asynchronous {
        // answer now; the final acknowledgment follows on this
        // connection once the MoM run completes
        let sink = session.sink.clone();
        let jobid = jobid.to_string();
        let exec_vnode = exec_vnode.to_string();
        tokio::spawn(async move {
            let code = match do_run(&kernel, &jobid, &exec_vnode).await {
                Ok(()) => 0,
                Err(e) => e.code(),
            };
            let ack = BatchRequest::new(
                ReqType::AsyrunJobAck,
                "server",
                ReqBody::AsyrunJobAck {
                    jobid: jobid.clone(),
                    code,
                },
            );
            let _ = sink.send(WriteItem::Push(ack)).await;
        });
        return Outcome::Reply(BatchReply {
            code: REPLY_CODE_DEFERRED,
            auxcode: 0,
            body: ReplyBody::Null,
        });
    }

    if session.from_sched() {
        if let Some(sched_arc) = kernel.sched_by_sock(session.conn.sock).await {
            // deferred: the reply holds its slot until the MoM answers
            // or the cycle closes
            let (reply_tx, reply_rx) = oneshot::channel();
            let (res_tx, res_rx) = oneshot::channel();
            sched_arc.lock().await.push_deferred(DeferredRun {
                jobid: jobid.to_string(),
                resolve: res_tx,
            });
            tokio::spawn(async move {
                let reply = match res_rx.await {
                    Ok(Ok(())) => BatchReply::ok(),
                    Ok(Err(e)) => BatchReply::error(&e),
                    Err(_) => BatchReply::error(&BatchError::ConnectionClosed),
                };
                let _ = reply_tx.send(reply);
            });
            let jobid = jobid.to_string();
            let exec_vnode = exec_vnode.to_string();
            let kernel2 = kernel.clone();
            let sched2 = sched_arc.clone();
            tokio::spawn(async move {
                let result = do_run(&kernel2, &jobid, &exec_vnode).await;
                if !sched2.lock().await.resolve_deferred(&jobid, result) {
                    debug!(jobid = %jobid, "deferred run resolved after cycle close");
                }
            });
            return Outcome::Deferred(reply_rx);
        }
    }

    Outcome::from_result(do_run(&kernel, jobid, exec_vnode).await.map(|_| BatchReply::ok()))
}

/// A peer server's deferred-run acknowledgment for a job we pushed.
pub async fn asyrun_ack(session: &Session, jobid: &str, code: i64) -> Result<BatchReply> {
    debug!(jobid = %jobid, code, "asynchronous run acknowledged");
    if code != 0 {
        if let Ok(job_arc) = session.kernel.job(jobid).await {
            let mut job = job_arc.lock().await;
            if job.header.state == JobState::Running {
                job.rerun()?;
                session
                    .kernel
                    .store
                    .save_job(&mut job, SaveKind::Quick)
                    .await?;
            }
        }
    }
    Ok(BatchReply::ok())
}

pub async fn signal_job(session: &Session, jobid: &str, signame: &str) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let job_arc = kernel.committed_job(jobid).await?;
    let mut job = job_arc.lock().await;
    if job.header.state != JobState::Running {
        return Err(BatchError::BadJobState);
    }
    let mom = job.header.mom_addr.clone();
    match signame {
        "STOP" | "suspend" => {
            job.suspend()?;
            kernel.store.save_job(&mut job, SaveKind::Quick).await?;
        }
        "CONT" | "resume" => {
            job.resume()?;
            kernel.store.save_job(&mut job, SaveKind::Quick).await?;
        }
        _ => {}
    }
    drop(job);
    if let Some(mom) = mom {
        exec::signal_job(kernel, &mom, jobid, signame).await?;
    }
    Ok(BatchReply::ok())
}

pub async fn rerun(session: &Session, jobid: &str) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let job_arc = kernel.committed_job(jobid).await?;
    let mut job = job_arc.lock().await;
    if !matches!(job.header.state, JobState::Running | JobState::Exiting) {
        return Err(BatchError::BadJobState);
    }
    let rerunable = !matches!(
        job.attrs.get_by_name("rerunable"),
        Some(AttrValue::Bool(false))
    );
    if !rerunable {
        return Err(BatchError::BadJobState);
    }
    let mom = job.header.mom_addr.clone();
    let exec_vnode = job.exec_vnode().map(str::to_string);
    job.rerun()?;
    kernel.store.save_job(&mut job, SaveKind::Full).await?;
    drop(job);
    if let Some(mom) = mom {
        let _ = exec::signal_job(kernel, &mom, jobid, "SIGKILL").await;
    }
    if let Some(ev) = exec_vnode {
        exec::mom::release_resources(kernel, jobid, &ev).await;
    }
    kernel.raise_sched_cmd(SchedCmd::JobNew, false).await;
    Ok(BatchReply::ok())
}

/// Obit intake shared by the JobObit request and the IS listener.
pub async fn handle_obit(
    kernel: &Arc<ServerKernel>,
    jobid: &str,
    exit_status: i32,
    usage: &[WireAttr],
) -> Result<()> {
    let job_arc = kernel.job(jobid).await?;
    let mut job = job_arc.lock().await;
    if matches!(
        job.header.state,
        JobState::Finished | JobState::Expired | JobState::Moved
    ) {
        return Ok(());
    }
    job.obit(exit_status)?;
    for entry in usage {
        let _ = job.attrs.apply(entry, false);
    }
    let exec_vnode = job.exec_vnode().map(str::to_string);
    kernel.store.save_job(&mut job, SaveKind::Quick).await?;

    // obit drained: finalize per the server's history policy
    let keep_history = kernel.svr.lock().await.job_history_enabled();
    job.finalize(keep_history)?;
    kernel.store.save_job(&mut job, SaveKind::Quick).await?;
    let queue_name = job.header.queue.clone();
    drop(job);

    if let Some(ev) = exec_vnode {
        exec::mom::release_resources(kernel, jobid, &ev).await;
    }
    if let Ok(queue) = kernel.queue(&queue_name).await {
        queue.lock().await.evict(jobid);
    }
    if keep_history {
        kernel.work.schedule(
            chrono::Utc::now() + chrono::TimeDelta::seconds(HISTORY_DURATION_SECS),
            WorkKind::JobHistoryExpire(jobid.to_string()),
        );
    } else {
        purge_job(kernel, jobid).await?;
    }
    kernel.raise_sched_cmd(SchedCmd::New, false).await;
    info!(jobid = %jobid, exit_status, "obit processed");
    Ok(())
}

pub async fn job_obit(
    session: &Session,
    jobid: &str,
    exit_status: i32,
    usage: Vec<WireAttr>,
) -> Result<BatchReply> {
    handle_obit(&session.kernel, jobid, exit_status, &usage).await?;
    Ok(BatchReply::ok())
}

/// Drop an expired history record.
pub async fn expire_history(kernel: &Arc<ServerKernel>, jobid: &str) -> Result<()> {
    if let Ok(job_arc) = kernel.job(jobid).await {
        if job_arc.lock().await.header.state == JobState::Finished {
            purge_job(kernel, jobid).await?;
        }
    }
    Ok(())
}

fn usage_pct(job: &Job) -> u32 {
    let used = job.attrs.get_by_name("resources_used").and_then(|v| {
        if let AttrValue::ResList(list) = v {
            list.iter().find_map(|(k, v)| {
                if k == "walltime" {
                    if let AttrValue::Duration(d) = v {
                        return Some(*d);
                    }
                }
                None
            })
        } else {
            None
        }
    });
    let requested = job.attrs.get_by_name("Resource_List").and_then(|v| {
        if let AttrValue::ResList(list) = v {
            list.iter().find_map(|(k, v)| {
                if k == "walltime" {
                    if let AttrValue::Duration(d) = v {
                        return Some(*d);
                    }
                }
                None
            })
        } else {
            None
        }
    });
    match (used, requested) {
        (Some(u), Some(r)) if r > 0 => ((u * 100) / r).clamp(0, 100) as u32,
        _ => 0,
    }
}

/// Try the scheduler's preempt methods in order; the first that
/// succeeds becomes the job's recorded method.
pub async fn preempt_jobs(session: &Session, jobids: Vec<String>) -> Result<BatchReply> {
    if !(session.privileged || session.from_sched()) {
        return Err(BatchError::PermissionDenied);
    }
    let kernel = &session.kernel;
    let ordering = match kernel.sched_by_sock(session.conn.sock).await {
        Some(sched) => sched.lock().await.preempt_order.clone(),
        None => vec![crate::domains::sched::PreemptOrdering::default()],
    };

    let mut results = Vec::with_capacity(jobids.len());
    for jobid in &jobids {
        let method = preempt_one(kernel, jobid, &ordering).await;
        results.push((jobid.clone(), method.map(PreemptMethod::letter).unwrap_or('?')));
    }
    Ok(BatchReply {
        code: 0,
        auxcode: 0,
        body: ReplyBody::PreemptJobs(results),
    })
}

async fn preempt_one(
    kernel: &Arc<ServerKernel>,
    jobid: &str,
    rows: &[crate::domains::sched::PreemptOrdering],
) -> Option<PreemptMethod> {
    let job_arc = kernel.job(jobid).await.ok()?;
    let pct = usage_pct(&*job_arc.lock().await);
    let row = crate::domains::sched::ordering_for(rows, pct);
    for method in &row.order {
        let ok = match method {
            PreemptMethod::Suspend => {
                let mut job = job_arc.lock().await;
                match job.suspend() {
                    Ok(()) => {
                        let mom = job.header.mom_addr.clone();
                        let save = kernel.store.save_job(&mut job, SaveKind::Quick).await;
                        drop(job);
                        if let Some(mom) = mom {
                            let _ = exec::signal_job(kernel, &mom, jobid, "STOP").await;
                        }
                        save.is_ok()
                    }
                    Err(_) => false,
                }
            }
            // no checkpoint substrate in the core
            PreemptMethod::Checkpoint => false,
            PreemptMethod::Requeue => {
                let mut job = job_arc.lock().await;
                let mom = job.header.mom_addr.clone();
                let exec_vnode = job.exec_vnode().map(str::to_string);
                match job.rerun() {
                    Ok(()) => {
                        let save = kernel.store.save_job(&mut job, SaveKind::Full).await;
                        drop(job);
                        if let Some(mom) = mom {
                            let _ = exec::signal_job(kernel, &mom, jobid, "SIGKILL").await;
                        }
                        if let Some(ev) = exec_vnode {
                            exec::mom::release_resources(kernel, jobid, &ev).await;
                        }
                        save.is_ok()
                    }
                    Err(_) => false,
                }
            }
            PreemptMethod::Delete => delete_one(kernel, jobid).await.is_ok(),
        };
        if ok {
            if let Ok(job_arc) = kernel.job(jobid).await {
                let mut job = job_arc.lock().await;
                let _ = job.attrs.apply(
                    &WireAttr::new("preempt_method", method.letter().to_string()),
                    false,
                );
            }
            return Some(*method);
        }
    }
    None
}
