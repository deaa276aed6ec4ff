//! Batch requests: the typed union and its wire codec.
//!
//! A request is a header `(prot-type, prot-version, type, user)`, a
//! per-type body, and an optional extend blob. Decoding is a
//! table-driven switch on the header type code; an unknown code is a
//! typed error so the dispatcher can reply before closing.

use bytes::Bytes;
use tokio::io::AsyncRead;
use wire::DisChan;

use super::{BATCH_PROT_TYPE, BATCH_PROT_VER, BATCH_PROT_VER_OLD, MAX_USER_LEN};
use crate::common::{BatchError, Result};
use crate::domains::attr::{read_wireattrs, write_wireattrs, WireAttr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[rustfmt::skip]
pub enum ReqType {
    Connect = 0, Disconnect = 1, Authenticate = 2, Cred = 3,
    QueueJob = 4, JobScript = 5, RdyToCommit = 6, Commit = 7,
    DeleteJob = 8, DeleteJobList = 9, HoldJob = 10, ReleaseJob = 11,
    ModifyJob = 12, ModifyJobAsync = 13, MoveJob = 14, OrderJob = 15,
    RunJob = 16, AsyrunJob = 17, AsyrunJobAck = 18,
    SignalJob = 19, MessageJob = 20, PySpawn = 21, RelnodesJob = 22,
    LocateJob = 23, TrackJob = 24, Rerun = 25, RegisterDep = 26,
    StatusJob = 27, StatusQue = 28, StatusSvr = 29, StatusSched = 30,
    StatusNode = 31, StatusRsc = 32, StatusHook = 33, StatusResv = 34,
    SelectJobs = 35, SelStat = 36, Manager = 37, Shutdown = 38,
    Rescq = 39, ReserveResc = 40, ReleaseResc = 41,
    SubmitResv = 42, ModifyResv = 43, DeleteResv = 44, ConfirmResv = 45,
    BeginResv = 46, ResvOccurEnd = 47,
    CopyFiles = 48, DelFiles = 49, CopyFilesCred = 50, DelFilesCred = 51,
    CopyHookFile = 52, DelHookFile = 53, HookPeriodic = 54,
    JobObit = 55, FailOver = 56, PreemptJobs = 57, DefSchReply = 58,
    RegisterSched = 59, ModifyVnode = 60,
}

impl ReqType {
    pub fn to_wire(self) -> u64 {
        self as u64
    }

    pub fn from_wire(v: u64) -> Result<Self> {
        use ReqType::*;
        const TABLE: &[ReqType] = &[
            Connect, Disconnect, Authenticate, Cred, QueueJob, JobScript, RdyToCommit, Commit,
            DeleteJob, DeleteJobList, HoldJob, ReleaseJob, ModifyJob, ModifyJobAsync, MoveJob,
            OrderJob, RunJob, AsyrunJob, AsyrunJobAck, SignalJob, MessageJob, PySpawn,
            RelnodesJob, LocateJob, TrackJob, Rerun, RegisterDep, StatusJob, StatusQue,
            StatusSvr, StatusSched, StatusNode, StatusRsc, StatusHook, StatusResv, SelectJobs,
            SelStat, Manager, Shutdown, Rescq, ReserveResc, ReleaseResc, SubmitResv, ModifyResv,
            DeleteResv, ConfirmResv, BeginResv, ResvOccurEnd, CopyFiles, DelFiles,
            CopyFilesCred, DelFilesCred, CopyHookFile, DelHookFile, HookPeriodic, JobObit,
            FailOver, PreemptJobs, DefSchReply, RegisterSched, ModifyVnode,
        ];
        TABLE
            .get(v as usize)
            .copied()
            .ok_or(BatchError::BadRequestType(v))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReqHeader {
    pub prot_ver: u64,
    pub req_type: ReqType,
    pub user: String,
}

/// Shared body for the Status* family.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusBody {
    pub id: String,
    pub attrs: Vec<WireAttr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReqBody {
    Connect,
    Disconnect,
    Authenticate {
        method: String,
        encrypt_method: String,
        client_port: u16,
    },
    Cred {
        method: String,
        blob: Vec<u8>,
    },
    QueueJob {
        jobid: String,
        dest: String,
        attrs: Vec<WireAttr>,
    },
    JobScript {
        jobid: String,
        chunk: Vec<u8>,
    },
    RdyToCommit {
        jobid: String,
    },
    Commit {
        jobid: String,
    },
    DeleteJob {
        jobid: String,
    },
    DeleteJobList {
        jobids: Vec<String>,
        resume_from: Option<String>,
    },
    HoldJob {
        jobid: String,
        holds: String,
    },
    ReleaseJob {
        jobid: String,
        holds: String,
    },
    ModifyJob {
        jobid: String,
        attrs: Vec<WireAttr>,
    },
    ModifyJobAsync {
        jobid: String,
        attrs: Vec<WireAttr>,
    },
    MoveJob {
        jobid: String,
        destination: String,
    },
    OrderJob {
        job1: String,
        job2: String,
    },
    RunJob {
        jobid: String,
        exec_vnode: String,
    },
    AsyrunJob {
        jobid: String,
        exec_vnode: String,
    },
    AsyrunJobAck {
        jobid: String,
        code: i64,
    },
    SignalJob {
        jobid: String,
        signame: String,
    },
    MessageJob {
        jobid: String,
        file: u64,
        text: String,
    },
    PySpawn {
        jobid: String,
        argv: Vec<String>,
        envp: Vec<String>,
    },
    RelnodesJob {
        jobid: String,
        node_list: String,
    },
    LocateJob {
        jobid: String,
    },
    TrackJob {
        jobid: String,
        hopcount: u64,
        location: String,
        state: String,
    },
    Rerun {
        jobid: String,
    },
    RegisterDep {
        owner: String,
        parent: String,
        child: String,
        dep_type: u64,
    },
    Status(StatusBody),
    SelectJobs {
        attrs: Vec<WireAttr>,
    },
    Manager {
        cmd: u64,
        obj_type: u64,
        obj_name: String,
        attrs: Vec<WireAttr>,
    },
    Shutdown {
        manner: u64,
    },
    Rescq {
        resources: Vec<String>,
    },
    SubmitResv {
        resvid: String,
        attrs: Vec<WireAttr>,
    },
    ModifyResv {
        resvid: String,
        attrs: Vec<WireAttr>,
    },
    DeleteResv {
        resvid: String,
    },
    ConfirmResv {
        resvid: String,
        exec_vnode: String,
        start: i64,
    },
    BeginResv {
        resvid: String,
    },
    ResvOccurEnd {
        resvid: String,
        occurrence: u64,
    },
    CopyFiles {
        jobid: String,
        direction: u64,
        pairs: Vec<(String, String)>,
        cred: Option<Vec<u8>>,
    },
    DelFiles {
        jobid: String,
        files: Vec<String>,
        cred: Option<Vec<u8>>,
    },
    CopyHookFile {
        name: String,
        data: Vec<u8>,
        checksum: String,
    },
    DelHookFile {
        name: String,
    },
    HookPeriodic {
        name: String,
    },
    JobObit {
        jobid: String,
        exit_status: i64,
        resources_used: Vec<WireAttr>,
    },
    FailOver {
        state: u64,
    },
    PreemptJobs {
        jobids: Vec<String>,
    },
    DefSchReply {
        cmd: u64,
        status: u64,
    },
    RegisterSched {
        name: String,
        secondary: bool,
    },
    ModifyVnode {
        node: String,
        vnode: String,
        attrs: Vec<WireAttr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub header: ReqHeader,
    pub body: ReqBody,
    pub extend: Option<String>,
}

impl BatchRequest {
    pub fn new(req_type: ReqType, user: &str, body: ReqBody) -> Self {
        Self {
            header: ReqHeader {
                prot_ver: BATCH_PROT_VER,
                req_type,
                user: user.to_string(),
            },
            body,
            extend: None,
        }
    }
}

async fn read_string_list<S: AsyncRead + Unpin>(chan: &mut DisChan<S>) -> Result<Vec<String>> {
    let count = chan.read_uint().await?;
    let mut out = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        out.push(chan.read_string().await?);
    }
    Ok(out)
}

fn write_string_list<S>(chan: &mut DisChan<S>, list: &[String]) {
    chan.write_uint(list.len() as u64);
    for s in list {
        chan.write_string(s);
    }
}

/// Read one request off the channel: header, body, extend.
///
/// The wait for the first byte runs under the caller's idle timeout;
/// once a request has started, the per-message short timeout bounds
/// every further read.
pub async fn read_request<S: AsyncRead + Unpin>(chan: &mut DisChan<S>) -> Result<BatchRequest> {
    let prot_type = chan.read_uint().await?;
    let saved = chan.timeout();
    chan.set_timeout(wire::TimeoutClass::Short);
    let result = read_request_inner(chan, prot_type).await;
    chan.set_timeout(saved);
    result
}

async fn read_request_inner<S: AsyncRead + Unpin>(
    chan: &mut DisChan<S>,
    prot_type: u64,
) -> Result<BatchRequest> {
    if prot_type != BATCH_PROT_TYPE {
        return Err(BatchError::Protocol);
    }
    let prot_ver = chan.read_uint().await?;
    if prot_ver != BATCH_PROT_VER && prot_ver != BATCH_PROT_VER_OLD {
        return Err(BatchError::UnsupportedVersion(prot_ver));
    }
    let req_type = ReqType::from_wire(chan.read_uint().await?)?;
    let user = chan.read_string().await?;
    if user.len() > MAX_USER_LEN {
        return Err(BatchError::Protocol);
    }
    let body = read_body(chan, req_type).await?;
    let extend = match chan.read_uint().await? {
        0 => None,
        _ => Some(chan.read_string().await?),
    };
    Ok(BatchRequest {
        header: ReqHeader {
            prot_ver,
            req_type,
            user,
        },
        body,
        extend,
    })
}

async fn read_body<S: AsyncRead + Unpin>(
    chan: &mut DisChan<S>,
    req_type: ReqType,
) -> Result<ReqBody> {
    Ok(match req_type {
        ReqType::Connect => ReqBody::Connect,
        ReqType::Disconnect => ReqBody::Disconnect,
        ReqType::Authenticate => ReqBody::Authenticate {
            method: chan.read_string().await?,
            encrypt_method: chan.read_string().await?,
            client_port: chan.read_uint().await? as u16,
        },
        ReqType::Cred => ReqBody::Cred {
            method: chan.read_string().await?,
            blob: chan.read_bytes().await?,
        },
        ReqType::QueueJob => ReqBody::QueueJob {
            jobid: chan.read_string().await?,
            dest: chan.read_string().await?,
            attrs: read_wireattrs(chan).await?,
        },
        ReqType::JobScript => ReqBody::JobScript {
            jobid: chan.read_string().await?,
            chunk: chan.read_bytes().await?,
        },
        ReqType::RdyToCommit => ReqBody::RdyToCommit {
            jobid: chan.read_string().await?,
        },
        ReqType::Commit => ReqBody::Commit {
            jobid: chan.read_string().await?,
        },
        ReqType::DeleteJob => ReqBody::DeleteJob {
            jobid: chan.read_string().await?,
        },
        ReqType::DeleteJobList => {
            let jobids = read_string_list(chan).await?;
            let resume = chan.read_string().await?;
            ReqBody::DeleteJobList {
                jobids,
                resume_from: if resume.is_empty() { None } else { Some(resume) },
            }
        }
        ReqType::HoldJob => ReqBody::HoldJob {
            jobid: chan.read_string().await?,
            holds: chan.read_string().await?,
        },
        ReqType::ReleaseJob => ReqBody::ReleaseJob {
            jobid: chan.read_string().await?,
            holds: chan.read_string().await?,
        },
        ReqType::ModifyJob => ReqBody::ModifyJob {
            jobid: chan.read_string().await?,
            attrs: read_wireattrs(chan).await?,
        },
        ReqType::ModifyJobAsync => ReqBody::ModifyJobAsync {
            jobid: chan.read_string().await?,
            attrs: read_wireattrs(chan).await?,
        },
        ReqType::MoveJob => ReqBody::MoveJob {
            jobid: chan.read_string().await?,
            destination: chan.read_string().await?,
        },
        ReqType::OrderJob => ReqBody::OrderJob {
            job1: chan.read_string().await?,
            job2: chan.read_string().await?,
        },
        ReqType::RunJob => ReqBody::RunJob {
            jobid: chan.read_string().await?,
            exec_vnode: chan.read_string().await?,
        },
        ReqType::AsyrunJob => ReqBody::AsyrunJob {
            jobid: chan.read_string().await?,
            exec_vnode: chan.read_string().await?,
        },
        ReqType::AsyrunJobAck => ReqBody::AsyrunJobAck {
            jobid: chan.read_string().await?,
            code: chan.read_int().await?,
        },
        ReqType::SignalJob => ReqBody::SignalJob {
            jobid: chan.read_string().await?,
            signame: chan.read_string().await?,
        },
        ReqType::MessageJob => ReqBody::MessageJob {
            jobid: chan.read_string().await?,
            file: chan.read_uint().await?,
            text: chan.read_string().await?,
        },
        ReqType::PySpawn => ReqBody::PySpawn {
            jobid: chan.read_string().await?,
            argv: read_string_list(chan).await?,
            envp: read_string_list(chan).await?,
        },
        ReqType::RelnodesJob => ReqBody::RelnodesJob {
            jobid: chan.read_string().await?,
            node_list: chan.read_string().await?,
        },
        ReqType::LocateJob => ReqBody::LocateJob {
            jobid: chan.read_string().await?,
        },
        ReqType::TrackJob => ReqBody::TrackJob {
            jobid: chan.read_string().await?,
            hopcount: chan.read_uint().await?,
            location: chan.read_string().await?,
            state: chan.read_string().await?,
        },
        ReqType::Rerun => ReqBody::Rerun {
            jobid: chan.read_string().await?,
        },
        ReqType::RegisterDep => ReqBody::RegisterDep {
            owner: chan.read_string().await?,
            parent: chan.read_string().await?,
            child: chan.read_string().await?,
            dep_type: chan.read_uint().await?,
        },
        ReqType::StatusJob
        | ReqType::StatusQue
        | ReqType::StatusSvr
        | ReqType::StatusSched
        | ReqType::StatusNode
        | ReqType::StatusRsc
        | ReqType::StatusHook
        | ReqType::StatusResv => ReqBody::Status(StatusBody {
            id: chan.read_string().await?,
            attrs: read_wireattrs(chan).await?,
        }),
        ReqType::SelectJobs | ReqType::SelStat => ReqBody::SelectJobs {
            attrs: read_wireattrs(chan).await?,
        },
        ReqType::Manager => ReqBody::Manager {
            cmd: chan.read_uint().await?,
            obj_type: chan.read_uint().await?,
            obj_name: chan.read_string().await?,
            attrs: read_wireattrs(chan).await?,
        },
        ReqType::Shutdown => ReqBody::Shutdown {
            manner: chan.read_uint().await?,
        },
        ReqType::Rescq | ReqType::ReserveResc | ReqType::ReleaseResc => ReqBody::Rescq {
            resources: read_string_list(chan).await?,
        },
        ReqType::SubmitResv => ReqBody::SubmitResv {
            resvid: chan.read_string().await?,
            attrs: read_wireattrs(chan).await?,
        },
        ReqType::ModifyResv => ReqBody::ModifyResv {
            resvid: chan.read_string().await?,
            attrs: read_wireattrs(chan).await?,
        },
        ReqType::DeleteResv => ReqBody::DeleteResv {
            resvid: chan.read_string().await?,
        },
        ReqType::ConfirmResv => ReqBody::ConfirmResv {
            resvid: chan.read_string().await?,
            exec_vnode: chan.read_string().await?,
            start: chan.read_int().await?,
        },
        ReqType::BeginResv => ReqBody::BeginResv {
            resvid: chan.read_string().await?,
        },
        ReqType::ResvOccurEnd => ReqBody::ResvOccurEnd {
            resvid: chan.read_string().await?,
            occurrence: chan.read_uint().await?,
        },
        ReqType::CopyFiles | ReqType::CopyFilesCred => {
            let jobid = chan.read_string().await?;
            let direction = chan.read_uint().await?;
            let count = chan.read_uint().await?;
            let mut pairs = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                let from = chan.read_string().await?;
                let to = chan.read_string().await?;
                pairs.push((from, to));
            }
            let cred = if req_type == ReqType::CopyFilesCred {
                Some(chan.read_bytes().await?)
            } else {
                None
            };
            ReqBody::CopyFiles {
                jobid,
                direction,
                pairs,
                cred,
            }
        }
        ReqType::DelFiles | ReqType::DelFilesCred => {
            let jobid = chan.read_string().await?;
            let files = read_string_list(chan).await?;
            let cred = if req_type == ReqType::DelFilesCred {
                Some(chan.read_bytes().await?)
            } else {
                None
            };
            ReqBody::DelFiles { jobid, files, cred }
        }
        ReqType::CopyHookFile => ReqBody::CopyHookFile {
            name: chan.read_string().await?,
            data: chan.read_bytes().await?,
            checksum: chan.read_string().await?,
        },
        ReqType::DelHookFile => ReqBody::DelHookFile {
            name: chan.read_string().await?,
        },
        ReqType::HookPeriodic => ReqBody::HookPeriodic {
            name: chan.read_string().await?,
        },
        ReqType::JobObit => ReqBody::JobObit {
            jobid: chan.read_string().await?,
            exit_status: chan.read_int().await?,
            resources_used: read_wireattrs(chan).await?,
        },
        ReqType::FailOver => ReqBody::FailOver {
            state: chan.read_uint().await?,
        },
        ReqType::PreemptJobs => ReqBody::PreemptJobs {
            jobids: read_string_list(chan).await?,
        },
        ReqType::DefSchReply => ReqBody::DefSchReply {
            cmd: chan.read_uint().await?,
            status: chan.read_uint().await?,
        },
        ReqType::RegisterSched => ReqBody::RegisterSched {
            name: chan.read_string().await?,
            secondary: chan.read_uint().await? != 0,
        },
        ReqType::ModifyVnode => ReqBody::ModifyVnode {
            node: chan.read_string().await?,
            vnode: chan.read_string().await?,
            attrs: read_wireattrs(chan).await?,
        },
    })
}

/// Stage one request into the channel's write buffer. The caller
/// flushes (stream) or detaches the buffer (mesh payload).
pub fn write_request<S>(chan: &mut DisChan<S>, req: &BatchRequest) {
    chan.write_uint(BATCH_PROT_TYPE);
    chan.write_uint(req.header.prot_ver);
    chan.write_uint(req.header.req_type.to_wire());
    chan.write_string(&req.header.user);
    write_body(chan, &req.body);
    match &req.extend {
        Some(ext) => {
            chan.write_uint(1);
            chan.write_string(ext);
        }
        None => chan.write_uint(0),
    }
}

fn write_body<S>(chan: &mut DisChan<S>, body: &ReqBody) {
    match body {
        ReqBody::Connect | ReqBody::Disconnect => {}
        ReqBody::Authenticate {
            method,
            encrypt_method,
            client_port,
        } => {
            chan.write_string(method);
            chan.write_string(encrypt_method);
            chan.write_uint(u64::from(*client_port));
        }
        ReqBody::Cred { method, blob } => {
            chan.write_string(method);
            chan.write_bytes(blob);
        }
        ReqBody::QueueJob { jobid, dest, attrs } => {
            chan.write_string(jobid);
            chan.write_string(dest);
            write_wireattrs(chan, attrs);
        }
        ReqBody::JobScript { jobid, chunk } => {
            chan.write_string(jobid);
            chan.write_bytes(chunk);
        }
        ReqBody::RdyToCommit { jobid }
        | ReqBody::Commit { jobid }
        | ReqBody::DeleteJob { jobid }
        | ReqBody::LocateJob { jobid }
        | ReqBody::Rerun { jobid } => chan.write_string(jobid),
        ReqBody::DeleteJobList {
            jobids,
            resume_from,
        } => {
            write_string_list(chan, jobids);
            chan.write_string(resume_from.as_deref().unwrap_or(""));
        }
        ReqBody::HoldJob { jobid, holds } | ReqBody::ReleaseJob { jobid, holds } => {
            chan.write_string(jobid);
            chan.write_string(holds);
        }
        ReqBody::ModifyJob { jobid, attrs } | ReqBody::ModifyJobAsync { jobid, attrs } => {
            chan.write_string(jobid);
            write_wireattrs(chan, attrs);
        }
        ReqBody::MoveJob {
            jobid,
            destination,
        } => {
            chan.write_string(jobid);
            chan.write_string(destination);
        }
        ReqBody::OrderJob { job1, job2 } => {
            chan.write_string(job1);
            chan.write_string(job2);
        }
        ReqBody::RunJob { jobid, exec_vnode } | ReqBody::AsyrunJob { jobid, exec_vnode } => {
            chan.write_string(jobid);
            chan.write_string(exec_vnode);
        }
        ReqBody::AsyrunJobAck { jobid, code } => {
            chan.write_string(jobid);
            chan.write_int(*code);
        }
        ReqBody::SignalJob { jobid, signame } => {
            chan.write_string(jobid);
            chan.write_string(signame);
        }
        ReqBody::MessageJob { jobid, file, text } => {
            chan.write_string(jobid);
            chan.write_uint(*file);
            chan.write_string(text);
        }
        ReqBody::PySpawn { jobid, argv, envp } => {
            chan.write_string(jobid);
            write_string_list(chan, argv);
            write_string_list(chan, envp);
        }
        ReqBody::RelnodesJob { jobid, node_list } => {
            chan.write_string(jobid);
            chan.write_string(node_list);
        }
        ReqBody::TrackJob {
            jobid,
            hopcount,
            location,
            state,
        } => {
            chan.write_string(jobid);
            chan.write_uint(*hopcount);
            chan.write_string(location);
            chan.write_string(state);
        }
        ReqBody::RegisterDep {
            owner,
            parent,
            child,
            dep_type,
        } => {
            chan.write_string(owner);
            chan.write_string(parent);
            chan.write_string(child);
            chan.write_uint(*dep_type);
        }
        ReqBody::Status(body) => {
            chan.write_string(&body.id);
            write_wireattrs(chan, &body.attrs);
        }
        ReqBody::SelectJobs { attrs } => write_wireattrs(chan, attrs),
        ReqBody::Manager {
            cmd,
            obj_type,
            obj_name,
            attrs,
        } => {
            chan.write_uint(*cmd);
            chan.write_uint(*obj_type);
            chan.write_string(obj_name);
            write_wireattrs(chan, attrs);
        }
        ReqBody::Shutdown { manner } => chan.write_uint(*manner),
        ReqBody::Rescq { resources } => write_string_list(chan, resources),
        ReqBody::SubmitResv { resvid, attrs } | ReqBody::ModifyResv { resvid, attrs } => {
            chan.write_string(resvid);
            write_wireattrs(chan, attrs);
        }
        ReqBody::DeleteResv { resvid } | ReqBody::BeginResv { resvid } => {
            chan.write_string(resvid)
        }
        ReqBody::ConfirmResv {
            resvid,
            exec_vnode,
            start,
        } => {
            chan.write_string(resvid);
            chan.write_string(exec_vnode);
            chan.write_int(*start);
        }
        ReqBody::ResvOccurEnd { resvid, occurrence } => {
            chan.write_string(resvid);
            chan.write_uint(*occurrence);
        }
        ReqBody::CopyFiles {
            jobid,
            direction,
            pairs,
            cred,
        } => {
            chan.write_string(jobid);
            chan.write_uint(*direction);
            chan.write_uint(pairs.len() as u64);
            for (from, to) in pairs {
                chan.write_string(from);
                chan.write_string(to);
            }
            if let Some(cred) = cred {
                chan.write_bytes(cred);
            }
        }
        ReqBody::DelFiles { jobid, files, cred } => {
            chan.write_string(jobid);
            write_string_list(chan, files);
            if let Some(cred) = cred {
                chan.write_bytes(cred);
            }
        }
        ReqBody::CopyHookFile {
            name,
            data,
            checksum,
        } => {
            chan.write_string(name);
            chan.write_bytes(data);
            chan.write_string(checksum);
        }
        ReqBody::DelHookFile { name } | ReqBody::HookPeriodic { name } => {
            chan.write_string(name)
        }
        ReqBody::JobObit {
            jobid,
            exit_status,
            resources_used,
        } => {
            chan.write_string(jobid);
            chan.write_int(*exit_status);
            write_wireattrs(chan, resources_used);
        }
        ReqBody::FailOver { state } => chan.write_uint(*state),
        ReqBody::PreemptJobs { jobids } => write_string_list(chan, jobids),
        ReqBody::DefSchReply { cmd, status } => {
            chan.write_uint(*cmd);
            chan.write_uint(*status);
        }
        ReqBody::RegisterSched { name, secondary } => {
            chan.write_string(name);
            chan.write_uint(u64::from(*secondary));
        }
        ReqBody::ModifyVnode { node, vnode, attrs } => {
            chan.write_string(node);
            chan.write_string(vnode);
            write_wireattrs(chan, attrs);
        }
    }
}

/// Encode a request into a standalone payload (mesh transport).
pub fn encode_request(req: &BatchRequest) -> Bytes {
    let mut chan = DisChan::new(());
    write_request(&mut chan, req);
    chan.write_buffer().freeze()
}

/// Decode a request from a standalone payload.
pub async fn decode_request(payload: &[u8]) -> Result<BatchRequest> {
    let mut chan = DisChan::new(payload);
    read_request(&mut chan).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::attr::SetOp;

    async fn round_trip(req: BatchRequest) {
        let bytes = encode_request(&req);
        let got = decode_request(&bytes).await.unwrap();
        assert_eq!(got, req);
    }

    #[tokio::test]
    async fn queue_job_round_trips() {
        round_trip(BatchRequest::new(
            ReqType::QueueJob,
            "alice",
            ReqBody::QueueJob {
                jobid: String::new(),
                dest: "workq".into(),
                attrs: vec![
                    WireAttr::new("Job_Name", "j1"),
                    WireAttr::with_resource("Resource_List", "ncpus", "1"),
                    WireAttr::with_resource("Resource_List", "mem", "1gb"),
                    WireAttr {
                        name: "Hold_Types".into(),
                        resource: None,
                        value: "n".into(),
                        flags: 0,
                        op: SetOp::Set,
                    },
                ],
            },
        ))
        .await;
    }

    #[tokio::test]
    async fn job_script_carries_raw_bytes() {
        round_trip(BatchRequest::new(
            ReqType::JobScript,
            "alice",
            ReqBody::JobScript {
                jobid: "1.host".into(),
                chunk: b"#!/bin/sh\necho hi\n".to_vec(),
            },
        ))
        .await;
    }

    #[tokio::test]
    async fn delete_job_list_round_trips_resume_token() {
        round_trip(BatchRequest::new(
            ReqType::DeleteJobList,
            "ops",
            ReqBody::DeleteJobList {
                jobids: vec!["1.host".into(), "2.host".into()],
                resume_from: Some("2.host".into()),
            },
        ))
        .await;
    }

    #[tokio::test]
    async fn extend_blob_round_trips() {
        let mut req = BatchRequest::new(
            ReqType::DeleteJob,
            "alice",
            ReqBody::DeleteJob {
                jobid: "1.host".into(),
            },
        );
        req.extend = Some("force".into());
        round_trip(req).await;
    }

    #[tokio::test]
    async fn unknown_type_code_is_typed_error() {
        let mut chan = DisChan::new(());
        chan.write_uint(BATCH_PROT_TYPE);
        chan.write_uint(BATCH_PROT_VER);
        chan.write_uint(999);
        chan.write_string("alice");
        let bytes = chan.write_buffer();
        match decode_request(&bytes).await {
            Err(BatchError::BadRequestType(999)) => {}
            other => panic!("expected BadRequestType, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_prot_type_is_protocol_error() {
        let mut chan = DisChan::new(());
        chan.write_uint(7);
        let bytes = chan.write_buffer();
        assert!(matches!(
            decode_request(&bytes).await,
            Err(BatchError::Protocol)
        ));
    }

    #[tokio::test]
    async fn unsupported_version_is_typed() {
        let mut chan = DisChan::new(());
        chan.write_uint(BATCH_PROT_TYPE);
        chan.write_uint(9);
        let bytes = chan.write_buffer();
        assert!(matches!(
            decode_request(&bytes).await,
            Err(BatchError::UnsupportedVersion(9))
        ));
    }

    #[tokio::test]
    async fn obit_round_trips_with_usage() {
        round_trip(BatchRequest::new(
            ReqType::JobObit,
            "pbs_mom",
            ReqBody::JobObit {
                jobid: "1.host".into(),
                exit_status: 0,
                resources_used: vec![WireAttr::with_resource(
                    "resources_used",
                    "walltime",
                    "00:01:07",
                )],
            },
        ))
        .await;
    }
}
