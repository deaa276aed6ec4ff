//! MoM sessions: job launch fan-out and the IS message loop.
//!
//! RunJob translates the scheduler's placement into sub-requests to
//! the primary MoM (QueueJob, JobScript, Commit, RunJob) plus IM
//! hellos to the sisters. A sister failure during launch aborts the
//! job back to the primary, which discards it.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wire::{DisChan, MeshMsg};

use super::is_proto::{IsMsg, IS_PROTOCOL, IS_PROTOCOL_VER};
use crate::common::{BatchError, Result};
use crate::dispatch::request::{encode_request, BatchRequest, ReqBody, ReqType};
use crate::domains::attr::{resource_type, AttrValue};
use crate::domains::job::Job;
use crate::domains::node::{vnode_state, Node};
use crate::kernel::ServerKernel;

/// One chunk of an exec_vnode expression.
#[derive(Debug, Clone, PartialEq)]
pub struct VnodeAlloc {
    pub vnode: String,
    pub resources: Vec<(String, AttrValue)>,
}

impl VnodeAlloc {
    /// The natural node a vnode belongs to: the part before any `[`.
    pub fn host(&self) -> &str {
        self.vnode.split('[').next().unwrap_or(&self.vnode)
    }
}

/// Parse `(n0:ncpus=1:mem=1gb)+(n1:ncpus=2)` into allocations.
pub fn parse_exec_vnode(expr: &str) -> Result<Vec<VnodeAlloc>> {
    let bad = || BatchError::BadAttribute(format!("exec_vnode {expr}"));
    let mut out = Vec::new();
    for chunk in expr.split('+') {
        let chunk = chunk.trim().trim_start_matches('(').trim_end_matches(')');
        if chunk.is_empty() {
            return Err(bad());
        }
        let mut parts = chunk.split(':');
        let vnode = parts.next().ok_or_else(bad)?.to_string();
        if vnode.is_empty() {
            return Err(bad());
        }
        let mut resources = Vec::new();
        for spec in parts {
            let (name, value) = spec.split_once('=').ok_or_else(bad)?;
            let v = resource_type(name).decode(value)?;
            resources.push((name.to_string(), v));
        }
        out.push(VnodeAlloc { vnode, resources });
    }
    Ok(out)
}

/// Frame an IS message: protocol, version, type, then the body the
/// closure stages.
pub fn encode_is_frame(msg: IsMsg, body: impl FnOnce(&mut DisChan<()>)) -> Bytes {
    let mut chan = DisChan::new(());
    chan.write_uint(IS_PROTOCOL);
    chan.write_uint(IS_PROTOCOL_VER);
    chan.write_uint(msg.to_wire());
    body(&mut chan);
    chan.write_buffer().freeze()
}

/// Frame a batch request for the mesh.
fn batch_payload(req: &BatchRequest) -> Bytes {
    encode_request(req)
}

const MOM_USER: &str = "pbs_mom";

/// Push a job to its placement. Returns the primary MoM's host and
/// port; the caller records them atomically with the state change.
pub async fn launch_job(
    kernel: &Arc<ServerKernel>,
    job: &Job,
    exec_vnode: &str,
) -> Result<(String, u16)> {
    let allocs = parse_exec_vnode(exec_vnode)?;
    let primary = allocs
        .first()
        .map(|a| a.host().to_string())
        .ok_or_else(|| BatchError::BadAttribute("empty exec_vnode".into()))?;
    let sisters: Vec<String> = allocs
        .iter()
        .skip(1)
        .map(|a| a.host().to_string())
        .filter(|h| *h != primary)
        .collect();

    if !kernel.mesh.is_up(&primary) {
        return Err(BatchError::MomUnreachable(primary));
    }

    let jobid = job.id().to_string();

    // stage the job on the primary: QueueJob, JobScript, Commit
    let queue_req = BatchRequest::new(
        ReqType::QueueJob,
        MOM_USER,
        ReqBody::QueueJob {
            jobid: jobid.clone(),
            dest: job.header.queue.clone(),
            attrs: job.attrs.encode_wire(),
        },
    );
    kernel
        .mesh
        .send_acked(&primary, batch_payload(&queue_req))
        .await
        .map_err(|_| BatchError::MomUnreachable(primary.clone()))?;

    if let Some(script) = &job.script {
        for chunk in script.chunks(crate::domains::job::SCRIPT_CHUNK) {
            let script_req = BatchRequest::new(
                ReqType::JobScript,
                MOM_USER,
                ReqBody::JobScript {
                    jobid: jobid.clone(),
                    chunk: chunk.to_vec(),
                },
            );
            kernel
                .mesh
                .send_acked(&primary, batch_payload(&script_req))
                .await
                .map_err(|_| BatchError::MomUnreachable(primary.clone()))?;
        }
    }

    let commit_req = BatchRequest::new(
        ReqType::Commit,
        MOM_USER,
        ReqBody::Commit {
            jobid: jobid.clone(),
        },
    );
    kernel
        .mesh
        .send_acked(&primary, batch_payload(&commit_req))
        .await
        .map_err(|_| BatchError::MomUnreachable(primary.clone()))?;

    // IM hellos to the sisters, all-or-each
    if !sisters.is_empty() {
        let hello = encode_is_frame(IsMsg::Cmd, |chan| {
            chan.write_string(&jobid);
            chan.write_string("join");
        });
        let results = kernel.mesh.multicast(&sisters, hello).await;
        if let Some(failed) = results.iter().find(|r| r.result.is_err()) {
            // abort to the primary, which emits an early obit
            let discard = encode_is_frame(IsMsg::DiscardJob, |chan| {
                chan.write_string(&jobid);
            });
            let _ = kernel.mesh.send(&primary, discard).await;
            return Err(BatchError::NodeDown(failed.peer.clone()));
        }
    }

    // the run order proper
    let run_req = BatchRequest::new(
        ReqType::RunJob,
        MOM_USER,
        ReqBody::RunJob {
            jobid: jobid.clone(),
            exec_vnode: exec_vnode.to_string(),
        },
    );
    kernel
        .mesh
        .send_acked(&primary, batch_payload(&run_req))
        .await
        .map_err(|_| BatchError::MomUnreachable(primary.clone()))?;

    // record assignment on the vnodes
    assign_resources(kernel, &jobid, &allocs).await?;

    let mom_port = match kernel.node(&primary).await {
        Ok(node) => node.lock().await.mom_port,
        Err(_) => kernel.config.mom_service_port,
    };
    info!(jobid = %jobid, primary = %primary, sisters = sisters.len(), "job launched");
    Ok((primary, mom_port))
}

async fn assign_resources(
    kernel: &Arc<ServerKernel>,
    jobid: &str,
    allocs: &[VnodeAlloc],
) -> Result<()> {
    for alloc in allocs {
        if let Ok(node) = kernel.node(alloc.host()).await {
            let mut node = node.lock().await;
            if let Some(vnode) = node.vnode_mut(&alloc.vnode) {
                vnode.assign(jobid, &alloc.resources)?;
            }
        }
    }
    Ok(())
}

/// Release a finished or requeued job's resources.
pub async fn release_resources(kernel: &Arc<ServerKernel>, jobid: &str, exec_vnode: &str) {
    let Ok(allocs) = parse_exec_vnode(exec_vnode) else {
        return;
    };
    for alloc in allocs {
        if let Ok(node) = kernel.node(alloc.host()).await {
            let mut node = node.lock().await;
            if let Some(vnode) = node.vnode_mut(&alloc.vnode) {
                let _ = vnode.release(jobid, &alloc.resources);
            }
        }
    }
}

/// Forward a signal to the job's MoM.
pub async fn signal_job(
    kernel: &Arc<ServerKernel>,
    mom: &str,
    jobid: &str,
    signame: &str,
) -> Result<()> {
    let req = BatchRequest::new(
        ReqType::SignalJob,
        MOM_USER,
        ReqBody::SignalJob {
            jobid: jobid.to_string(),
            signame: signame.to_string(),
        },
    );
    kernel
        .mesh
        .send_acked(mom, batch_payload(&req))
        .await
        .map_err(|_| BatchError::MomUnreachable(mom.to_string()))
}

/// The IS message loop: consumes mesh frames from every MoM.
pub async fn run_is_listener(kernel: Arc<ServerKernel>, mut rx: mpsc::Receiver<MeshMsg>) {
    loop {
        tokio::select! {
            _ = kernel.shutdown.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = handle_frame(&kernel, &msg).await {
                    warn!(peer = %msg.src, error = %e, "IS frame failed");
                }
            }
        }
    }
}

async fn handle_frame(kernel: &Arc<ServerKernel>, msg: &MeshMsg) -> Result<()> {
    let mut chan = DisChan::new(&msg.payload[..]);
    let proto = chan.read_uint().await?;
    if proto != IS_PROTOCOL {
        debug!(peer = %msg.src, proto, "non-IS mesh frame ignored");
        return Ok(());
    }
    let ver = chan.read_uint().await?;
    if ver != IS_PROTOCOL_VER {
        return Err(BatchError::UnsupportedVersion(ver));
    }
    let is_type = IsMsg::from_wire(chan.read_uint().await?)?;
    match is_type {
        IsMsg::Hellosvr => {
            // mom bootstraps its connection: name, port
            let name = chan.read_string().await?;
            let port = chan.read_uint().await? as u16;
            register_mom(kernel, &name, port).await?;
            let reply = encode_is_frame(IsMsg::Replyhello, |chan| {
                chan.write_string(kernel.server_name());
            });
            let _ = kernel.mesh.send(&msg.src, reply).await;
        }
        IsMsg::Update => {
            let updates = read_vnode_updates(&mut chan).await?;
            apply_vnode_updates(kernel, &msg.src, updates, true).await?;
        }
        IsMsg::Update2 | IsMsg::UpdateFromHook | IsMsg::UpdateFromHook2 => {
            let updates = read_vnode_updates(&mut chan).await?;
            apply_vnode_updates(kernel, &msg.src, updates, false).await?;
        }
        IsMsg::Rescused | IsMsg::RescusedFromHook => {
            let jobid = chan.read_string().await?;
            let attrs = crate::domains::attr::read_wireattrs(&mut chan).await?;
            let mut pairs = Vec::new();
            for a in &attrs {
                let resource = a.resource.as_deref().unwrap_or("");
                pairs.push(format!("resources_used.{resource}"));
                pairs.push(format!("3.{}", a.value));
            }
            kernel
                .store
                .commit_async(crate::kernel::HotUpdate {
                    jobid,
                    attributes: pairs,
                })
                .await?;
        }
        IsMsg::Jobobit => {
            let jobid = chan.read_string().await?;
            let exit_status = chan.read_int().await?;
            let usage = crate::domains::attr::read_wireattrs(&mut chan).await?;
            crate::dispatch::handlers::job::handle_obit(
                kernel,
                &jobid,
                exit_status as i32,
                &usage,
            )
            .await?;
            let reply = encode_is_frame(IsMsg::Obitreply, |chan| {
                chan.write_string(&jobid);
                chan.write_int(0);
            });
            let _ = kernel.mesh.send(&msg.src, reply).await;
        }
        IsMsg::DiscardDone => {
            let jobid = chan.read_string().await?;
            debug!(jobid = %jobid, peer = %msg.src, "discard complete");
        }
        IsMsg::HookChecksums => {
            let count = chan.read_uint().await?;
            for _ in 0..count {
                let _name = chan.read_string().await?;
                let _sum = chan.read_string().await?;
            }
            debug!(peer = %msg.src, count, "hook checksums received");
        }
        IsMsg::Shutdown | IsMsg::Idle | IsMsg::Registermom => {
            debug!(peer = %msg.src, ?is_type, "IS control frame");
        }
        other => {
            debug!(peer = %msg.src, ?other, "unhandled IS frame");
        }
    }
    Ok(())
}

struct VnodeUpdate {
    vnode: String,
    state: u32,
    resources_available: Vec<(String, AttrValue)>,
}

async fn read_vnode_updates<S: tokio::io::AsyncRead + Unpin>(
    chan: &mut DisChan<S>,
) -> Result<Vec<VnodeUpdate>> {
    let count = chan.read_uint().await?;
    let mut out = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let vnode = chan.read_string().await?;
        let state = chan.read_uint().await? as u32;
        let nres = chan.read_uint().await?;
        let mut resources_available = Vec::with_capacity(nres.min(64) as usize);
        for _ in 0..nres {
            let name = chan.read_string().await?;
            let value = chan.read_string().await?;
            resources_available.push((name.clone(), resource_type(&name).decode(&value)?));
        }
        out.push(VnodeUpdate {
            vnode,
            state,
            resources_available,
        });
    }
    Ok(out)
}

/// Apply a vnode table (full) or delta (partial) from a MoM. A vnode
/// reported down kills exclusive jobs and degrades the rest.
async fn apply_vnode_updates(
    kernel: &Arc<ServerKernel>,
    mom: &str,
    updates: Vec<VnodeUpdate>,
    full: bool,
) -> Result<()> {
    let node = kernel.node(mom).await?;
    let mut node = node.lock().await;
    if full {
        for vnode in &mut node.vnodes {
            vnode.state |= vnode_state::STALE;
        }
    }
    let mut lost_jobs: Vec<(String, bool)> = Vec::new();
    for u in updates {
        if node.vnode(&u.vnode).is_none() {
            node.vnodes
                .push(crate::domains::node::Vnode::new(u.vnode.clone()));
        }
        let vnode = node.vnode_mut(&u.vnode).expect("present");
        vnode.state = u.state;
        if !u.resources_available.is_empty() {
            vnode.resources_available = u.resources_available;
        }
        if u.state & vnode_state::DOWN != 0 {
            for jobid in &vnode.jobs {
                let exclusive = vnode.state & vnode_state::JOB_EXCLUSIVE != 0;
                lost_jobs.push((jobid.clone(), exclusive));
            }
        }
    }
    if full {
        for vnode in &mut node.vnodes {
            if vnode.state & vnode_state::STALE != 0 {
                // not in this update: the MoM no longer reports it
                vnode.state |= vnode_state::UNKNOWN;
            }
        }
    }
    kernel
        .store
        .save_node(&mut node, crate::kernel::SaveKind::Full)
        .await?;
    drop(node);

    for (jobid, exclusive) in lost_jobs {
        if exclusive {
            warn!(jobid = %jobid, mom = %mom, "exclusive vnode lost, killing job");
            let _ = crate::dispatch::handlers::job::handle_obit(kernel, &jobid, 271, &[]).await;
        } else {
            warn!(jobid = %jobid, mom = %mom, "vnode lost, job degraded");
            // a reservation job degrades its reservation too
            if let Ok(job_arc) = kernel.job(&jobid).await {
                let queue_name = job_arc.lock().await.header.queue.clone();
                if let Ok(queue_arc) = kernel.queue(&queue_name).await {
                    let resv_id = queue_arc.lock().await.resv_id.clone();
                    if let Some(resv_id) = resv_id {
                        let _ =
                            crate::dispatch::handlers::resv::degrade_resv(kernel, &resv_id).await;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn register_mom(kernel: &Arc<ServerKernel>, name: &str, port: u16) -> Result<()> {
    if kernel.node(name).await.is_err() {
        let index = kernel.nodes.read().await.len() as i64;
        let mut node = Node::new(name, port, index);
        kernel
            .store
            .save_node(&mut node, crate::kernel::SaveKind::Insert)
            .await?;
        kernel.add_node(node).await?;
        info!(mom = %name, port, "mom registered");
    }
    kernel
        .store
        .save_mominfo_time(name, chrono::Utc::now())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_vnode_parses_chunks() {
        let allocs = parse_exec_vnode("(n0:ncpus=1:mem=1gb)+(n1:ncpus=2)").unwrap();
        assert_eq!(allocs.len(), 2);
        assert_eq!(allocs[0].vnode, "n0");
        assert_eq!(
            allocs[0].resources,
            vec![
                ("ncpus".to_string(), AttrValue::Long(1)),
                ("mem".to_string(), AttrValue::Size(1 << 30)),
            ]
        );
        assert_eq!(allocs[1].host(), "n1");
    }

    #[test]
    fn vnode_host_strips_bracket_suffix() {
        let allocs = parse_exec_vnode("(host1[3]:ncpus=4)").unwrap();
        assert_eq!(allocs[0].vnode, "host1[3]");
        assert_eq!(allocs[0].host(), "host1");
    }

    #[test]
    fn empty_exec_vnode_is_rejected() {
        assert!(parse_exec_vnode("").is_err());
        assert!(parse_exec_vnode("()").is_err());
    }

    #[test]
    fn is_frame_carries_protocol_header() {
        let frame = encode_is_frame(IsMsg::Hellosvr, |chan| {
            chan.write_string("n0");
            chan.write_uint(15003);
        });
        // spot-check the leading protocol bytes: 4, then version 4
        assert!(frame.starts_with(b"1+41+4"));
    }
}
