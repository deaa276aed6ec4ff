//! Status and selection handlers. Hot paths: no object is mutated and
//! no lock is held across the reply encode.

use crate::common::{BatchError, Result};
use crate::dispatch::reply::{BatchReply, ReplyBody, StatusEntry};
use crate::dispatch::request::{ReqType, StatusBody};
use crate::dispatch::service::Session;
use crate::domains::attr::{AttrValue, SetOp, WireAttr};
use crate::domains::node::{vnode_states_string, vnode_state};

pub mod objtype {
    pub const JOB: u64 = 1;
    pub const QUEUE: u64 = 2;
    pub const SERVER: u64 = 3;
    pub const SCHED: u64 = 4;
    pub const NODE: u64 = 5;
    pub const RESV: u64 = 6;
    pub const RSC: u64 = 7;
    pub const HOOK: u64 = 8;
}

/// Keep only the attributes a caller asked for; an empty selection
/// means everything.
fn filter_attrs(attrs: Vec<WireAttr>, selection: &[WireAttr]) -> Vec<WireAttr> {
    if selection.is_empty() {
        return attrs;
    }
    attrs
        .into_iter()
        .filter(|a| selection.iter().any(|s| s.name == a.name))
        .collect()
}

pub async fn status(
    session: &Session,
    req_type: ReqType,
    body: StatusBody,
) -> Result<BatchReply> {
    let entries = match req_type {
        ReqType::StatusJob => status_jobs(session, &body).await?,
        ReqType::StatusQue => status_queues(session, &body).await?,
        ReqType::StatusSvr => status_server(session, &body).await?,
        ReqType::StatusSched => status_scheds(session, &body).await?,
        ReqType::StatusNode => status_nodes(session, &body).await?,
        ReqType::StatusResv => status_resvs(session, &body).await?,
        ReqType::StatusRsc => status_resources(session).await?,
        ReqType::StatusHook => status_hooks(session).await?,
        _ => return Err(BatchError::BadRequestType(req_type.to_wire())),
    };
    Ok(BatchReply {
        code: 0,
        auxcode: 0,
        body: ReplyBody::Status(entries),
    })
}

async fn status_jobs(session: &Session, body: &StatusBody) -> Result<Vec<StatusEntry>> {
    let kernel = &session.kernel;
    let mut out = Vec::new();
    if body.id.is_empty() {
        let jobs = kernel.jobs.read().await;
        let mut ids: Vec<&String> = jobs.keys().collect();
        ids.sort();
        for id in ids {
            let job = jobs[id].lock().await;
            if !job.committed {
                continue;
            }
            out.push(StatusEntry {
                obj_type: objtype::JOB,
                name: id.clone(),
                attrs: filter_attrs(job.attrs.encode_wire(), &body.attrs),
            });
        }
    } else {
        let job = kernel.committed_job(&body.id).await?;
        let job = job.lock().await;
        out.push(StatusEntry {
            obj_type: objtype::JOB,
            name: body.id.clone(),
            attrs: filter_attrs(job.attrs.encode_wire(), &body.attrs),
        });
    }
    Ok(out)
}

async fn status_queues(session: &Session, body: &StatusBody) -> Result<Vec<StatusEntry>> {
    let kernel = &session.kernel;
    let queues = kernel.queues.read().await;
    let mut out = Vec::new();
    for (name, q) in queues.iter() {
        if !body.id.is_empty() && name != &body.id {
            continue;
        }
        let q = q.lock().await;
        let mut attrs = q.attrs.encode_wire();
        attrs.push(WireAttr::new("queue_type", q.kind.as_str()));
        attrs.push(WireAttr::new("enabled", if q.enabled { "True" } else { "False" }));
        attrs.push(WireAttr::new("started", if q.started { "True" } else { "False" }));
        attrs.push(WireAttr::new("total_jobs", q.jobs.len().to_string()));
        out.push(StatusEntry {
            obj_type: objtype::QUEUE,
            name: name.clone(),
            attrs: filter_attrs(attrs, &body.attrs),
        });
    }
    if !body.id.is_empty() && out.is_empty() {
        return Err(BatchError::UnknownQueue(body.id.clone()));
    }
    Ok(out)
}

async fn status_server(session: &Session, body: &StatusBody) -> Result<Vec<StatusEntry>> {
    let kernel = &session.kernel;
    let svr = kernel.svr.lock().await;
    let mut attrs = svr.attrs.encode_wire();
    attrs.push(WireAttr::new(
        "total_jobs",
        kernel.jobs.read().await.len().to_string(),
    ));
    Ok(vec![StatusEntry {
        obj_type: objtype::SERVER,
        name: svr.name.clone(),
        attrs: filter_attrs(attrs, &body.attrs),
    }])
}

async fn status_scheds(session: &Session, body: &StatusBody) -> Result<Vec<StatusEntry>> {
    let scheds = session.kernel.scheds.read().await;
    let mut out = Vec::new();
    for (name, s) in scheds.iter() {
        if !body.id.is_empty() && name != &body.id {
            continue;
        }
        let s = s.lock().await;
        let mut attrs = s.attrs.encode_wire();
        attrs.push(WireAttr::new(
            "state",
            if s.cycle_started { "scheduling" } else { "idle" },
        ));
        out.push(StatusEntry {
            obj_type: objtype::SCHED,
            name: name.clone(),
            attrs: filter_attrs(attrs, &body.attrs),
        });
    }
    Ok(out)
}

async fn status_nodes(session: &Session, body: &StatusBody) -> Result<Vec<StatusEntry>> {
    let nodes = session.kernel.nodes.read().await;
    let mut out = Vec::new();
    for (name, node) in nodes.iter() {
        let node = node.lock().await;
        for vnode in &node.vnodes {
            if !body.id.is_empty() && vnode.name != body.id && name != &body.id {
                continue;
            }
            let mut attrs = vec![
                WireAttr::new("Mom", node.mom_host.clone()),
                WireAttr::new("Port", node.mom_port.to_string()),
                WireAttr::new("state", vnode_states_string(vnode.state)),
                WireAttr::new("sharing", vnode.sharing.as_str()),
            ];
            for (res, v) in &vnode.resources_available {
                attrs.push(WireAttr::with_resource("resources_available", res, v.encode()));
            }
            for (res, v) in &vnode.resources_assigned {
                attrs.push(WireAttr::with_resource("resources_assigned", res, v.encode()));
            }
            if !vnode.jobs.is_empty() {
                attrs.push(WireAttr::new("jobs", vnode.jobs.join(",")));
            }
            out.push(StatusEntry {
                obj_type: objtype::NODE,
                name: vnode.name.clone(),
                attrs: filter_attrs(attrs, &body.attrs),
            });
        }
    }
    if !body.id.is_empty() && out.is_empty() {
        return Err(BatchError::UnknownNode(body.id.clone()));
    }
    Ok(out)
}

async fn status_resvs(session: &Session, body: &StatusBody) -> Result<Vec<StatusEntry>> {
    let resvs = session.kernel.resvs.read().await;
    let mut out = Vec::new();
    for (id, r) in resvs.iter() {
        if !body.id.is_empty() && id != &body.id {
            continue;
        }
        let r = r.lock().await;
        out.push(StatusEntry {
            obj_type: objtype::RESV,
            name: id.clone(),
            attrs: filter_attrs(r.attrs.encode_wire(), &body.attrs),
        });
    }
    if !body.id.is_empty() && out.is_empty() {
        return Err(BatchError::UnknownResv(body.id.clone()));
    }
    Ok(out)
}

async fn status_resources(session: &Session) -> Result<Vec<StatusEntry>> {
    let nodes = session.kernel.nodes.read().await;
    let mut names: Vec<String> = Vec::new();
    for node in nodes.values() {
        let node = node.lock().await;
        for vnode in &node.vnodes {
            for (res, _) in &vnode.resources_available {
                if !names.contains(res) {
                    names.push(res.clone());
                }
            }
        }
    }
    Ok(names
        .into_iter()
        .map(|name| StatusEntry {
            obj_type: objtype::RSC,
            name,
            attrs: vec![WireAttr::new("flags", "h")],
        })
        .collect())
}

async fn status_hooks(session: &Session) -> Result<Vec<StatusEntry>> {
    let hooks = session.kernel.hooks.read().await;
    let mut out = Vec::new();
    for (name, data) in hooks.iter() {
        use sha2::{Digest, Sha256};
        let sum = hex::encode(Sha256::digest(data));
        out.push(StatusEntry {
            obj_type: objtype::HOOK,
            name: name.clone(),
            attrs: vec![
                WireAttr::new("checksum", sum),
                WireAttr::new("size", data.len().to_string()),
            ],
        });
    }
    Ok(out)
}

/// Evaluate selection criteria against every committed job. Entries
/// with ordering operators filter; plain entries mean equality.
pub async fn select_jobs(
    session: &Session,
    criteria: Vec<WireAttr>,
    with_status: bool,
) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let jobs = kernel.jobs.read().await;
    let mut ids: Vec<&String> = jobs.keys().collect();
    ids.sort();
    let mut selected = Vec::new();
    let mut entries = Vec::new();
    for id in ids {
        let job = jobs[id].lock().await;
        if !job.committed {
            continue;
        }
        let mut matched = true;
        for c in &criteria {
            let mut probe = c.clone();
            if probe.op == SetOp::Set {
                probe.op = SetOp::Eq;
            }
            let mut attrs = job.attrs.clone();
            match attrs.apply(&probe, false) {
                Ok(Some(true)) => {}
                Ok(Some(false)) | Err(_) => {
                    matched = false;
                    break;
                }
                Ok(None) => {}
            }
        }
        if matched {
            selected.push(id.clone());
            if with_status {
                entries.push(StatusEntry {
                    obj_type: objtype::JOB,
                    name: id.clone(),
                    attrs: job.attrs.encode_wire(),
                });
            }
        }
    }
    Ok(BatchReply {
        code: 0,
        auxcode: 0,
        body: if with_status {
            ReplyBody::Status(entries)
        } else {
            ReplyBody::Select(selected)
        },
    })
}

/// Resource query: availability totals per requested resource.
pub async fn resc_query(session: &Session, resources: Vec<String>) -> Result<BatchReply> {
    let kernel = &session.kernel;
    let nodes = kernel.nodes.read().await;
    let mut avail = Vec::new();
    let mut alloc = Vec::new();
    let mut resvd = Vec::new();
    let mut down = Vec::new();
    for spec in &resources {
        let name = spec.split('=').next().unwrap_or(spec);
        let mut a = 0i64;
        let mut al = 0i64;
        let mut dn = 0i64;
        for node in nodes.values() {
            let node = node.lock().await;
            for vnode in &node.vnodes {
                let total = vnode
                    .resources_available
                    .iter()
                    .find_map(|(k, v)| match (k == name, v) {
                        (true, AttrValue::Long(n)) => Some(*n),
                        _ => None,
                    })
                    .unwrap_or(0);
                if vnode.state & vnode_state::DOWN != 0 {
                    dn += total;
                } else {
                    a += total;
                }
                al += vnode
                    .resources_assigned
                    .iter()
                    .find_map(|(k, v)| match (k == name, v) {
                        (true, AttrValue::Long(n)) => Some(*n),
                        _ => None,
                    })
                    .unwrap_or(0);
            }
        }
        avail.push(a);
        alloc.push(al);
        resvd.push(0);
        down.push(dn);
    }
    Ok(BatchReply {
        code: 0,
        auxcode: 0,
        body: ReplyBody::RescQuery {
            avail,
            alloc,
            resvd,
            down,
        },
    })
}
