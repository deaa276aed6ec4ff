//! Request handlers.
//!
//! `dispatch` authorizes and routes one decoded request. Handlers are
//! grouped by object: job lifecycle, status/select, reservations,
//! scheduler protocol, and the management/misc set.

pub mod job;
pub mod misc;
pub mod resv;
pub mod sched;
pub mod status;

use tokio::sync::oneshot;
use tracing::debug;

use super::reply::BatchReply;
use super::request::{BatchRequest, ReqBody, ReqType};
use super::service::Session;
use crate::common::BatchError;
use crate::net::auth::{self, AuthProgress};

pub enum Outcome {
    Reply(BatchReply),
    Deferred(oneshot::Receiver<BatchReply>),
    /// Send the reply, then close the stream (fatal errors).
    Close(BatchReply),
    CloseSilent,
}

impl Outcome {
    fn from_result(result: crate::common::Result<BatchReply>) -> Self {
        match result {
            Ok(reply) => Outcome::Reply(reply),
            Err(e) => Outcome::Reply(BatchReply::error(&e)),
        }
    }
}

/// Requests allowed before the handshake completes.
fn allowed_unauthenticated(t: ReqType) -> bool {
    matches!(
        t,
        ReqType::Connect | ReqType::Authenticate | ReqType::Cred | ReqType::Disconnect
    )
}

pub async fn dispatch(session: &mut Session, req: BatchRequest) -> Outcome {
    let req_type = req.header.req_type;
    debug!(sock = session.conn.sock, ?req_type, user = %req.header.user, "request");

    if !session.authenticated && !allowed_unauthenticated(req_type) {
        // auth failure is fatal: reply, then close the stream
        return Outcome::Close(BatchReply::error(&BatchError::NotAuthenticated));
    }
    if session.user.is_empty() {
        session.user = req.header.user.clone();
    }

    match req.body {
        ReqBody::Connect => Outcome::Reply(BatchReply::ok()),
        ReqBody::Disconnect => Outcome::CloseSilent,
        ReqBody::Authenticate {
            method,
            encrypt_method: _,
            client_port,
        } => handle_authenticate(session, &method, client_port),
        ReqBody::Cred { method, blob } => {
            handle_cred(session, &method, &req.header.user, &blob).await
        }

        ReqBody::QueueJob { jobid, dest, attrs } => Outcome::from_result(
            job::queue_job(session, &req.header.user, jobid, dest, attrs).await,
        ),
        ReqBody::JobScript { jobid, chunk } => {
            Outcome::from_result(job::job_script(session, &jobid, chunk).await)
        }
        ReqBody::RdyToCommit { jobid } => {
            Outcome::from_result(job::rdy_to_commit(session, &jobid).await)
        }
        ReqBody::Commit { jobid } => Outcome::from_result(job::commit(session, &jobid).await),
        ReqBody::DeleteJob { jobid } => {
            Outcome::from_result(job::delete_job(session, &jobid).await)
        }
        ReqBody::DeleteJobList {
            jobids,
            resume_from,
        } => Outcome::from_result(job::delete_job_list(session, jobids, resume_from).await),
        ReqBody::HoldJob { jobid, holds } => {
            Outcome::from_result(job::hold_job(session, &jobid, &holds).await)
        }
        ReqBody::ReleaseJob { jobid, holds } => {
            Outcome::from_result(job::release_job(session, &jobid, &holds).await)
        }
        ReqBody::ModifyJob { jobid, attrs } => {
            Outcome::from_result(job::modify_job(session, &jobid, attrs, false).await)
        }
        ReqBody::ModifyJobAsync { jobid, attrs } => {
            Outcome::from_result(job::modify_job(session, &jobid, attrs, true).await)
        }
        ReqBody::MoveJob {
            jobid,
            destination,
        } => Outcome::from_result(job::move_job(session, &jobid, &destination).await),
        ReqBody::OrderJob { job1, job2 } => {
            Outcome::from_result(job::order_job(session, &job1, &job2).await)
        }
        ReqBody::RunJob { jobid, exec_vnode } => {
            job::run_job(session, &jobid, &exec_vnode, false).await
        }
        ReqBody::AsyrunJob { jobid, exec_vnode } => {
            job::run_job(session, &jobid, &exec_vnode, true).await
        }
        ReqBody::AsyrunJobAck { jobid, code } => {
            Outcome::from_result(job::asyrun_ack(session, &jobid, code).await)
        }
        ReqBody::SignalJob { jobid, signame } => {
            Outcome::from_result(job::signal_job(session, &jobid, &signame).await)
        }
        ReqBody::Rerun { jobid } => Outcome::from_result(job::rerun(session, &jobid).await),
        ReqBody::JobObit {
            jobid,
            exit_status,
            resources_used,
        } => Outcome::from_result(
            job::job_obit(session, &jobid, exit_status as i32, resources_used).await,
        ),
        ReqBody::PreemptJobs { jobids } => {
            Outcome::from_result(job::preempt_jobs(session, jobids).await)
        }

        ReqBody::Status(body) => Outcome::from_result(status::status(session, req_type, body).await),
        ReqBody::SelectJobs { attrs } => Outcome::from_result(
            status::select_jobs(session, attrs, req_type == ReqType::SelStat).await,
        ),
        ReqBody::Rescq { resources } => {
            Outcome::from_result(status::resc_query(session, resources).await)
        }

        ReqBody::SubmitResv { resvid, attrs } => Outcome::from_result(
            resv::submit_resv(session, &req.header.user, resvid, attrs).await,
        ),
        ReqBody::ModifyResv { resvid, attrs } => {
            Outcome::from_result(resv::modify_resv(session, &resvid, attrs).await)
        }
        ReqBody::DeleteResv { resvid } => {
            Outcome::from_result(resv::delete_resv(session, &resvid).await)
        }
        ReqBody::ConfirmResv {
            resvid,
            exec_vnode,
            start,
        } => Outcome::from_result(resv::confirm_resv(session, &resvid, &exec_vnode, start).await),
        ReqBody::BeginResv { resvid } => {
            Outcome::from_result(resv::begin_resv(session, &resvid).await)
        }
        ReqBody::ResvOccurEnd { resvid, occurrence } => {
            Outcome::from_result(resv::resv_occur_end(session, &resvid, occurrence).await)
        }

        ReqBody::RegisterSched { name, secondary } => {
            Outcome::from_result(sched::register_sched(session, &name, secondary).await)
        }
        ReqBody::DefSchReply { cmd: _, status } => {
            Outcome::from_result(sched::def_sch_reply(session, status).await)
        }

        ReqBody::Manager {
            cmd,
            obj_type,
            obj_name,
            attrs,
        } => Outcome::from_result(misc::manager(session, cmd, obj_type, &obj_name, attrs).await),
        ReqBody::Shutdown { manner } => misc::shutdown(session, manner),
        ReqBody::LocateJob { jobid } => {
            Outcome::from_result(misc::locate_job(session, &jobid).await)
        }
        ReqBody::TrackJob {
            jobid,
            hopcount,
            location,
            state,
        } => Outcome::from_result(
            misc::track_job(session, &jobid, hopcount, location, state).await,
        ),
        ReqBody::RegisterDep {
            owner,
            parent,
            child,
            dep_type,
        } => Outcome::from_result(
            misc::register_dep(session, &owner, &parent, &child, dep_type).await,
        ),
        ReqBody::MessageJob { jobid, file, text } => {
            Outcome::from_result(misc::message_job(session, &jobid, file, &text).await)
        }
        ReqBody::PySpawn { jobid, argv, envp } => {
            Outcome::from_result(misc::py_spawn(session, &jobid, argv, envp).await)
        }
        ReqBody::RelnodesJob { jobid, node_list } => {
            Outcome::from_result(misc::relnodes_job(session, &jobid, &node_list).await)
        }
        ReqBody::CopyFiles { jobid, .. } => {
            Outcome::from_result(misc::stage_files(session, &jobid).await)
        }
        ReqBody::DelFiles { jobid, .. } => {
            Outcome::from_result(misc::stage_files(session, &jobid).await)
        }
        ReqBody::CopyHookFile {
            name,
            data,
            checksum,
        } => Outcome::from_result(misc::copy_hook_file(session, &name, data, &checksum).await),
        ReqBody::DelHookFile { name } => {
            Outcome::from_result(misc::del_hook_file(session, &name).await)
        }
        ReqBody::HookPeriodic { name } => {
            Outcome::from_result(misc::hook_periodic(session, &name).await)
        }
        ReqBody::FailOver { state } => Outcome::from_result(misc::fail_over(session, state).await),
        ReqBody::ModifyVnode { node, vnode, attrs } => {
            Outcome::from_result(misc::modify_vnode(session, &node, &vnode, attrs).await)
        }
    }
}

fn handle_authenticate(session: &mut Session, method: &str, client_port: u16) -> Outcome {
    let supported = session.kernel.config.supported_auth_methods.clone();
    match auth::start_handshake(
        &session.conn,
        session.ctx.task_token,
        &supported,
        method,
        client_port,
    ) {
        Ok(AuthProgress::Done(outcome)) => {
            session.authenticated = outcome.authenticated;
            session.privileged = outcome.privileged;
            Outcome::Reply(BatchReply::ok())
        }
        Ok(AuthProgress::NeedCred { method }) => {
            session.pending_auth = Some(method);
            Outcome::Reply(BatchReply::ok())
        }
        Err(e) => Outcome::Close(BatchReply::error(&e)),
    }
}

async fn handle_cred(session: &mut Session, method: &str, user: &str, blob: &[u8]) -> Outcome {
    let expected = match session.pending_auth.clone() {
        Some(m) => m,
        None => method.to_string(),
    };
    if method != expected {
        return Outcome::Close(BatchReply::error(&BatchError::BadCredential));
    }
    let service_principal = format!("pbs@{}", session.kernel.server_name());
    match auth::handle_cred(
        &session.conn,
        session.ctx.task_token,
        &session.kernel.cred_validators,
        method,
        user,
        blob,
        &service_principal,
    )
    .await
    {
        Ok(outcome) => {
            session.authenticated = outcome.authenticated;
            session.privileged = outcome.privileged;
            session.pending_auth = None;
            Outcome::Reply(BatchReply::ok())
        }
        Err(e) => Outcome::Close(BatchReply::error(&e)),
    }
}
