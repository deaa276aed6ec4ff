//! Management and miscellaneous handlers.

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::common::{BatchError, Result};
use crate::dispatch::handlers::Outcome;
use crate::dispatch::reply::{BatchReply, ReplyBody};
use crate::dispatch::service::Session;
use crate::domains::attr::WireAttr;
use crate::domains::node::Node;
use crate::domains::queue::{Queue, QueueKind};
use crate::domains::sched::Scheduler;
use crate::kernel::SaveKind;

/// Manager sub-commands.
mod mgr_cmd {
    pub const CREATE: u64 = 1;
    pub const DELETE: u64 = 2;
    pub const SET: u64 = 3;
    pub const UNSET: u64 = 4;
}

/// Manager object kinds.
mod mgr_obj {
    pub const SERVER: u64 = 1;
    pub const QUEUE: u64 = 2;
    pub const NODE: u64 = 3;
    pub const SCHED: u64 = 4;
}

async fn is_manager(session: &Session) -> bool {
    if session.privileged {
        return true;
    }
    session.kernel.svr.lock().await.is_manager(&session.user)
}

pub async fn manager(
    session: &Session,
    cmd: u64,
    obj_type: u64,
    obj_name: &str,
    attrs: Vec<WireAttr>,
) -> Result<BatchReply> {
    if !is_manager(session).await {
        return Err(BatchError::PermissionDenied);
    }
    let kernel = &session.kernel;
    match (cmd, obj_type) {
        (mgr_cmd::CREATE, mgr_obj::QUEUE) => {
            let kind = attrs
                .iter()
                .find(|a| a.name == "queue_type")
                .map(|a| QueueKind::parse(&a.value))
                .transpose()?
                .unwrap_or(QueueKind::Execution);
            let mut queue = Queue::new(obj_name, kind);
            queue.attrs.apply_all(&attrs, false)?;
            kernel.store.save_queue(&mut queue, SaveKind::Insert).await?;
            kernel.add_queue(queue).await?;
            info!(queue = %obj_name, "queue created");
        }
        (mgr_cmd::DELETE, mgr_obj::QUEUE) => {
            let queue_arc = kernel.queue(obj_name).await?;
            if !queue_arc.lock().await.jobs.is_empty() {
                return Err(BatchError::BadJobState);
            }
            kernel.store.delete_queue(obj_name).await?;
            kernel.remove_queue(obj_name).await;
            info!(queue = %obj_name, "queue deleted");
        }
        (mgr_cmd::SET, mgr_obj::QUEUE) => {
            let queue_arc = kernel.queue(obj_name).await?;
            let mut queue = queue_arc.lock().await;
            queue.attrs.apply_all(&attrs, false)?;
            for a in &attrs {
                match a.name.as_str() {
                    "enabled" => queue.enabled = a.value != "False" && a.value != "false",
                    "started" => queue.started = a.value != "False" && a.value != "false",
                    _ => {}
                }
            }
            kernel.store.save_queue(&mut queue, SaveKind::Full).await?;
        }
        (mgr_cmd::UNSET, mgr_obj::QUEUE) => {
            let queue_arc = kernel.queue(obj_name).await?;
            let mut queue = queue_arc.lock().await;
            for a in &attrs {
                if let Some(i) = queue.attrs.idx(&a.name) {
                    queue.attrs.unset(i);
                }
            }
            kernel.store.save_queue(&mut queue, SaveKind::Full).await?;
        }
        (mgr_cmd::SET, mgr_obj::SERVER) => {
            let mut svr = kernel.svr.lock().await;
            svr.attrs.apply_all(&attrs, false)?;
            kernel.store.save_svr(&mut svr, SaveKind::Full).await?;
        }
        (mgr_cmd::UNSET, mgr_obj::SERVER) => {
            let mut svr = kernel.svr.lock().await;
            for a in &attrs {
                if let Some(i) = svr.attrs.idx(&a.name) {
                    svr.attrs.unset(i);
                }
            }
            kernel.store.save_svr(&mut svr, SaveKind::Full).await?;
        }
        (mgr_cmd::CREATE, mgr_obj::NODE) => {
            let port = attrs
                .iter()
                .find(|a| a.name == "Port")
                .and_then(|a| a.value.parse().ok())
                .unwrap_or(kernel.config.mom_service_port);
            let index = kernel.nodes.read().await.len() as i64;
            let mut node = Node::new(obj_name, port, index);
            node.attrs.apply_all(&attrs, false)?;
            kernel.store.save_node(&mut node, SaveKind::Insert).await?;
            kernel.add_node(node).await?;
            info!(node = %obj_name, "node created");
        }
        (mgr_cmd::DELETE, mgr_obj::NODE) => {
            let node_arc = kernel.node(obj_name).await?;
            {
                let node = node_arc.lock().await;
                for vnode in &node.vnodes {
                    kernel.store.delete_node(&vnode.name).await?;
                }
            }
            kernel.nodes.write().await.remove(obj_name);
            info!(node = %obj_name, "node deleted");
        }
        (mgr_cmd::SET, mgr_obj::NODE) => {
            let node_arc = kernel.node(obj_name).await?;
            let mut node = node_arc.lock().await;
            let vnode = obj_name.to_string();
            node.modify_vnode(&vnode, &attrs)?;
            kernel.store.save_node(&mut node, SaveKind::Full).await?;
        }
        (mgr_cmd::CREATE, mgr_obj::SCHED) => {
            let mut sched = Scheduler::new(obj_name);
            for a in &attrs {
                sched.set_attr_str(&a.name, &a.value)?;
            }
            kernel.store.save_sched(&mut sched, SaveKind::Insert).await?;
            kernel.add_sched(sched).await;
            info!(sched = %obj_name, "scheduler created");
        }
        (mgr_cmd::SET, mgr_obj::SCHED) => {
            let sched_arc = kernel.sched(obj_name).await?;
            let mut sched = sched_arc.lock().await;
            for a in &attrs {
                sched.set_attr_str(&a.name, &a.value)?;
            }
            kernel.store.save_sched(&mut sched, SaveKind::Full).await?;
        }
        (mgr_cmd::DELETE, mgr_obj::SCHED) => {
            kernel.store.delete_sched(obj_name).await?;
            kernel.scheds.write().await.remove(obj_name);
        }
        _ => return Err(BatchError::BadRequestType(cmd)),
    }
    Ok(BatchReply::ok())
}

pub fn shutdown(session: &Session, manner: u64) -> Outcome {
    if !session.privileged {
        return Outcome::Reply(BatchReply::error(&BatchError::PermissionDenied));
    }
    info!(manner, "shutdown requested");
    session.kernel.shutdown.cancel();
    Outcome::Reply(BatchReply::ok())
}

pub async fn locate_job(session: &Session, jobid: &str) -> Result<BatchReply> {
    let kernel = &session.kernel;
    if kernel.job(jobid).await.is_ok() {
        return Ok(BatchReply {
            code: 0,
            auxcode: 0,
            body: ReplyBody::Locate(kernel.server_name().to_string()),
        });
    }
    if let Some((_, location, _)) = kernel.tracking.read().await.get(jobid) {
        return Ok(BatchReply {
            code: 0,
            auxcode: 0,
            body: ReplyBody::Locate(location.clone()),
        });
    }
    Err(BatchError::UnknownJob(jobid.to_string()))
}

pub async fn track_job(
    session: &Session,
    jobid: &str,
    hopcount: u64,
    location: String,
    state: String,
) -> Result<BatchReply> {
    let mut tracking = session.kernel.tracking.write().await;
    match tracking.get(jobid) {
        Some((hops, _, _)) if *hops >= hopcount => {}
        _ => {
            tracking.insert(jobid.to_string(), (hopcount, location, state));
        }
    }
    Ok(BatchReply::ok())
}

pub async fn register_dep(
    session: &Session,
    _owner: &str,
    parent: &str,
    child: &str,
    dep_type: u64,
) -> Result<BatchReply> {
    let job_arc = session.kernel.committed_job(parent).await?;
    let mut job = job_arc.lock().await;
    let dep = format!("{}:{child}", dep_name(dep_type));
    job.attrs.apply(
        &WireAttr {
            name: "depend".into(),
            resource: None,
            value: dep,
            flags: 0,
            op: crate::domains::attr::SetOp::Incr,
        },
        false,
    )?;
    session
        .kernel
        .store
        .save_job(&mut job, SaveKind::Full)
        .await?;
    Ok(BatchReply::ok())
}

fn dep_name(dep_type: u64) -> &'static str {
    match dep_type {
        0 => "after",
        1 => "afterok",
        2 => "afternotok",
        3 => "afterany",
        4 => "before",
        5 => "beforeok",
        6 => "beforenotok",
        _ => "beforeany",
    }
}

pub async fn message_job(
    session: &Session,
    jobid: &str,
    file: u64,
    text: &str,
) -> Result<BatchReply> {
    let job_arc = session.kernel.committed_job(jobid).await?;
    let mom = job_arc.lock().await.header.mom_addr.clone();
    let Some(mom) = mom else {
        return Err(BatchError::BadJobState);
    };
    debug!(jobid = %jobid, file, "message forwarded to mom");
    crate::exec::signal_job(&session.kernel, &mom, jobid, &format!("MSG:{text}")).await?;
    Ok(BatchReply::ok())
}

pub async fn py_spawn(
    session: &Session,
    jobid: &str,
    argv: Vec<String>,
    _envp: Vec<String>,
) -> Result<BatchReply> {
    let job_arc = session.kernel.committed_job(jobid).await?;
    let mom = job_arc.lock().await.header.mom_addr.clone();
    let Some(mom) = mom else {
        return Err(BatchError::BadJobState);
    };
    if argv.is_empty() {
        return Err(BatchError::BadAttribute("empty argv".into()));
    }
    crate::exec::signal_job(&session.kernel, &mom, jobid, &format!("SPAWN:{}", argv.join(" ")))
        .await?;
    Ok(BatchReply::ok())
}

/// Release named sister vnodes from a running job.
pub async fn relnodes_job(session: &Session, jobid: &str, node_list: &str) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let job_arc = kernel.committed_job(jobid).await?;
    let job = job_arc.lock().await;
    if job.header.state != crate::domains::job::JobState::Running {
        return Err(BatchError::BadJobState);
    }
    let exec_vnode = job
        .exec_vnode()
        .map(str::to_string)
        .ok_or(BatchError::BadJobState)?;
    drop(job);
    let targets: Vec<&str> = node_list.split('+').filter(|s| !s.is_empty()).collect();
    let allocs = crate::exec::mom::parse_exec_vnode(&exec_vnode)?;
    for alloc in &allocs {
        if targets.iter().any(|t| *t == alloc.vnode) {
            if let Ok(node) = kernel.node(alloc.host()).await {
                let mut node = node.lock().await;
                if let Some(vnode) = node.vnode_mut(&alloc.vnode) {
                    let _ = vnode.release(jobid, &alloc.resources);
                }
            }
        }
    }
    Ok(BatchReply::ok())
}

/// File staging rides an external substrate; the core validates the
/// job and acknowledges the transfer order.
pub async fn stage_files(session: &Session, jobid: &str) -> Result<BatchReply> {
    session.kernel.committed_job(jobid).await?;
    Ok(BatchReply::ok())
}

pub async fn copy_hook_file(
    session: &Session,
    name: &str,
    data: Vec<u8>,
    checksum: &str,
) -> Result<BatchReply> {
    if !session.privileged {
        return Err(BatchError::PermissionDenied);
    }
    let sum = hex::encode(Sha256::digest(&data));
    if !checksum.is_empty() && sum != checksum {
        return Err(BatchError::BadAttribute(format!("hook {name} checksum")));
    }
    session
        .kernel
        .hooks
        .write()
        .await
        .insert(name.to_string(), data);
    info!(hook = %name, "hook file stored");
    Ok(BatchReply::ok())
}

pub async fn del_hook_file(session: &Session, name: &str) -> Result<BatchReply> {
    if !session.privileged {
        return Err(BatchError::PermissionDenied);
    }
    session.kernel.hooks.write().await.remove(name);
    Ok(BatchReply::ok())
}

pub async fn hook_periodic(session: &Session, name: &str) -> Result<BatchReply> {
    if session.kernel.hooks.read().await.contains_key(name) {
        Ok(BatchReply::ok())
    } else {
        Err(BatchError::UnknownObject(format!("hook {name}")))
    }
}

pub async fn fail_over(session: &Session, state: u64) -> Result<BatchReply> {
    if !session.privileged {
        return Err(BatchError::PermissionDenied);
    }
    info!(state, "failover state change");
    Ok(BatchReply::ok())
}

pub async fn modify_vnode(
    session: &Session,
    node: &str,
    vnode: &str,
    attrs: Vec<WireAttr>,
) -> Result<BatchReply> {
    if !(session.privileged || session.from_sched()) {
        return Err(BatchError::PermissionDenied);
    }
    let kernel = &session.kernel;
    let node_arc = kernel.node(node).await?;
    let mut node = node_arc.lock().await;
    node.modify_vnode(vnode, &attrs)?;
    kernel.store.save_node(&mut node, SaveKind::Full).await?;
    Ok(BatchReply::ok())
}
