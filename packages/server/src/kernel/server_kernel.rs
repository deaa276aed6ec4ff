// ServerKernel - the dependency hub every handler receives.
//
// Holds the config, the object store, the connection table, the mesh
// hub and the in-memory object registries. Objects are kept behind
// per-object async mutexes; handlers look objects up by id and never
// hold a reference across another object's lock except in the fixed
// job -> queue -> server order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;
use wire::MeshHub;

use super::store::{ObjStore, SaveKind};
use super::work::WorkQueue;
use crate::common::{BatchError, Result};
use crate::config::Config;
use crate::domains::job::Job;
use crate::domains::node::Node;
use crate::domains::queue::{Queue, QueueKind};
use crate::domains::resv::Resv;
use crate::domains::sched::{SchedCmd, Scheduler};
use crate::domains::svr::SvrObj;
use crate::net::auth::CredValidator;
use crate::net::conn::ConnTable;

pub struct ServerKernel {
    pub config: Config,
    pub store: ObjStore,
    pub conns: ConnTable,
    pub svr: Mutex<SvrObj>,
    pub jobs: RwLock<HashMap<String, Arc<Mutex<Job>>>>,
    pub queues: RwLock<BTreeMap<String, Arc<Mutex<Queue>>>>,
    pub nodes: RwLock<BTreeMap<String, Arc<Mutex<Node>>>>,
    pub resvs: RwLock<BTreeMap<String, Arc<Mutex<Resv>>>>,
    pub scheds: RwLock<HashMap<String, Arc<Mutex<Scheduler>>>>,
    pub mesh: MeshHub,
    pub work: WorkQueue,
    pub shutdown: CancellationToken,
    pub cred_validators: Vec<Arc<dyn CredValidator>>,
    /// Hook files pushed by CopyHookFile, name -> content.
    pub hooks: RwLock<HashMap<String, Vec<u8>>>,
    /// TrackJob routing records: jobid -> (hopcount, location, state).
    pub tracking: RwLock<HashMap<String, (u64, String, String)>>,
}

impl ServerKernel {
    pub fn new(config: Config, store: ObjStore, mesh: MeshHub, work: WorkQueue) -> Self {
        let server_name = config.server_name.clone();
        Self {
            config,
            store,
            conns: ConnTable::new(),
            svr: Mutex::new(SvrObj::new(server_name)),
            jobs: RwLock::new(HashMap::new()),
            queues: RwLock::new(BTreeMap::new()),
            nodes: RwLock::new(BTreeMap::new()),
            resvs: RwLock::new(BTreeMap::new()),
            scheds: RwLock::new(HashMap::new()),
            mesh,
            work,
            shutdown: CancellationToken::new(),
            cred_validators: Vec::new(),
            hooks: RwLock::new(HashMap::new()),
            tracking: RwLock::new(HashMap::new()),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    /// Mint the next jobid: `<seq>.<server>`.
    pub async fn new_jobid(&self) -> Result<String> {
        let seq = self.store.next_job_seq(self.server_name()).await?;
        Ok(format!("{seq}.{}", self.server_name()))
    }

    /// Mint the next reservation id: `R<seq>.<server>`.
    pub async fn new_resvid(&self) -> Result<String> {
        let seq = self.store.next_job_seq(self.server_name()).await?;
        Ok(format!("R{seq}.{}", self.server_name()))
    }

    // ---- object lookup ----------------------------------------------

    pub async fn job(&self, jobid: &str) -> Result<Arc<Mutex<Job>>> {
        self.jobs
            .read()
            .await
            .get(jobid)
            .cloned()
            .ok_or_else(|| BatchError::UnknownJob(jobid.to_string()))
    }

    /// Lookup honoring the commit gate: uncommitted jobs are invisible
    /// to every request except Commit/RdyToCommit/JobScript.
    pub async fn committed_job(&self, jobid: &str) -> Result<Arc<Mutex<Job>>> {
        let job = self.job(jobid).await?;
        if !job.lock().await.committed {
            return Err(BatchError::JobNotCommitted);
        }
        Ok(job)
    }

    pub async fn add_job(&self, job: Job) -> Result<Arc<Mutex<Job>>> {
        let id = job.id().to_string();
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&id) {
            return Err(BatchError::DuplicateId(id));
        }
        let slot = Arc::new(Mutex::new(job));
        jobs.insert(id, slot.clone());
        Ok(slot)
    }

    pub async fn remove_job(&self, jobid: &str) -> Option<Arc<Mutex<Job>>> {
        self.jobs.write().await.remove(jobid)
    }

    pub async fn queue(&self, name: &str) -> Result<Arc<Mutex<Queue>>> {
        self.queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BatchError::UnknownQueue(name.to_string()))
    }

    pub async fn add_queue(&self, queue: Queue) -> Result<Arc<Mutex<Queue>>> {
        let name = queue.name.clone();
        let mut queues = self.queues.write().await;
        if queues.contains_key(&name) {
            return Err(BatchError::DuplicateId(name));
        }
        let slot = Arc::new(Mutex::new(queue));
        queues.insert(name, slot.clone());
        Ok(slot)
    }

    pub async fn remove_queue(&self, name: &str) -> Option<Arc<Mutex<Queue>>> {
        self.queues.write().await.remove(name)
    }

    pub async fn node(&self, name: &str) -> Result<Arc<Mutex<Node>>> {
        self.nodes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BatchError::UnknownNode(name.to_string()))
    }

    pub async fn add_node(&self, node: Node) -> Result<Arc<Mutex<Node>>> {
        let name = node.name.clone();
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&name) {
            return Err(BatchError::DuplicateId(name));
        }
        let slot = Arc::new(Mutex::new(node));
        nodes.insert(name, slot.clone());
        Ok(slot)
    }

    pub async fn resv(&self, resvid: &str) -> Result<Arc<Mutex<Resv>>> {
        self.resvs
            .read()
            .await
            .get(resvid)
            .cloned()
            .ok_or_else(|| BatchError::UnknownResv(resvid.to_string()))
    }

    pub async fn add_resv(&self, resv: Resv) -> Result<Arc<Mutex<Resv>>> {
        let id = resv.resvid.clone();
        let mut resvs = self.resvs.write().await;
        if resvs.contains_key(&id) {
            return Err(BatchError::DuplicateId(id));
        }
        let slot = Arc::new(Mutex::new(resv));
        resvs.insert(id, slot.clone());
        Ok(slot)
    }

    pub async fn remove_resv(&self, resvid: &str) -> Option<Arc<Mutex<Resv>>> {
        self.resvs.write().await.remove(resvid)
    }

    pub async fn sched(&self, name: &str) -> Result<Arc<Mutex<Scheduler>>> {
        self.scheds
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BatchError::UnknownSched(name.to_string()))
    }

    pub async fn add_sched(&self, sched: Scheduler) -> Arc<Mutex<Scheduler>> {
        let name = sched.name.clone();
        let slot = Arc::new(Mutex::new(sched));
        self.scheds.write().await.insert(name, slot.clone());
        slot
    }

    /// Find the scheduler registered on a given socket and channel role.
    pub async fn sched_by_sock(&self, sock: u64) -> Option<Arc<Mutex<Scheduler>>> {
        for s in self.scheds.read().await.values() {
            let guard = s.lock().await;
            if guard.primary_sock == Some(sock) || guard.secondary_sock == Some(sock) {
                drop(guard);
                return Some(s.clone());
            }
        }
        None
    }

    /// Raise a scheduler command; same-command posts coalesce.
    pub async fn raise_sched_cmd(&self, cmd: SchedCmd, high_prio: bool) {
        for s in self.scheds.read().await.values() {
            s.lock().await.mailbox.post(cmd, high_prio);
        }
    }

    /// Rehydrate every persisted object after restart.
    pub async fn rehydrate(&self) -> Result<()> {
        if let Some(svr) = self.store.load_svr(self.server_name()).await? {
            *self.svr.lock().await = svr;
        } else {
            let mut svr = self.svr.lock().await;
            self.store.save_svr(&mut svr, SaveKind::Insert).await?;
        }

        let mut queues = self.queues.write().await;
        for q in self.store.find_queues().await? {
            queues.insert(q.name.clone(), Arc::new(Mutex::new(q)));
        }
        if queues.is_empty() {
            let mut workq = Queue::new("workq", QueueKind::Execution);
            self.store.save_queue(&mut workq, SaveKind::Insert).await?;
            queues.insert("workq".into(), Arc::new(Mutex::new(workq)));
        }
        drop(queues);

        let mut count = 0usize;
        let mut jobs = self.jobs.write().await;
        let queues = self.queues.read().await;
        for job in self.store.find_jobs().await? {
            if let Some(q) = queues.get(&job.header.queue) {
                let mut q = q.lock().await;
                let _ = q.admit(job.id());
                q.next_rank = q.next_rank.max(job.header.queue_rank + 1);
            }
            jobs.insert(job.id().to_string(), Arc::new(Mutex::new(job)));
            count += 1;
        }
        drop(queues);
        drop(jobs);

        let mut resvs = self.resvs.write().await;
        for r in self.store.find_resvs().await? {
            resvs.insert(r.resvid.clone(), Arc::new(Mutex::new(r)));
        }
        drop(resvs);

        let mut nodes = self.nodes.write().await;
        for n in self.store.find_nodes().await? {
            nodes.insert(n.name.clone(), Arc::new(Mutex::new(n)));
        }
        drop(nodes);

        let mut scheds = self.scheds.write().await;
        for name in self.store.load_scheds().await? {
            let sched = self.store.load_sched(&name).await?;
            scheds.insert(name, Arc::new(Mutex::new(sched)));
        }
        drop(scheds);

        info!(jobs = count, "state rehydrated from datastore");
        Ok(())
    }
}
