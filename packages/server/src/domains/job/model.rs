//! The job model: fixed header plus attribute array plus script.

use chrono::{DateTime, Utc};

use super::state::{check_pair, JobState, JobSubstate};
use crate::common::{BatchError, Result};
use crate::domains::attr::{perm, AttrArray, AttrDef, AttrType, AttrValue};

pub const JOB_ATTR_DEFS: &[AttrDef] = &[
    AttrDef::new("Job_Name", AttrType::Str, 0),
    AttrDef::new("Job_Owner", AttrType::Str, perm::READ_ONLY),
    AttrDef::new("job_state", AttrType::Char, perm::READ_ONLY),
    AttrDef::new("substate", AttrType::Long, perm::READ_ONLY),
    AttrDef::new("queue", AttrType::Str, perm::READ_ONLY),
    AttrDef::new("server", AttrType::Str, perm::READ_ONLY),
    AttrDef::new("ctime", AttrType::Long, perm::READ_ONLY),
    AttrDef::new("mtime", AttrType::Long, perm::READ_ONLY),
    AttrDef::new("qtime", AttrType::Long, perm::READ_ONLY),
    AttrDef::new("stime", AttrType::Long, perm::READ_ONLY),
    AttrDef::new("Priority", AttrType::Long, 0),
    AttrDef::new("Hold_Types", AttrType::Str, 0),
    AttrDef::new("rerunable", AttrType::Bool, 0),
    AttrDef::new("Resource_List", AttrType::ResList, 0),
    AttrDef::new("resources_used", AttrType::ResList, perm::SCHED_SET),
    AttrDef::new("exec_vnode", AttrType::Str, perm::SCHED_SET),
    AttrDef::new("exec_host", AttrType::Str, perm::SCHED_SET),
    AttrDef::new("exec_host2", AttrType::Str, perm::SCHED_SET | perm::HIDDEN),
    AttrDef::new("euser", AttrType::Str, perm::MGR_ONLY),
    AttrDef::new("egroup", AttrType::Str, perm::MGR_ONLY),
    AttrDef::new("depend", AttrType::StrArr, 0),
    AttrDef::new("exit_status", AttrType::Long, perm::READ_ONLY),
    AttrDef::new("run_count", AttrType::Long, 0),
    AttrDef::new("run_version", AttrType::Long, perm::HIDDEN),
    AttrDef::new("comment", AttrType::Str, 0),
    AttrDef::new("Variable_List", AttrType::StrArr, 0),
    AttrDef::new("Error_Path", AttrType::Str, 0),
    AttrDef::new("Output_Path", AttrType::Str, 0),
    AttrDef::new("Mail_Points", AttrType::Str, 0),
    AttrDef::new("project", AttrType::Str, 0),
    AttrDef::new("preempt_method", AttrType::Char, perm::SCHED_SET),
];

/// Fields with a fixed place outside the attribute array. These are
/// what a quick save writes.
#[derive(Debug, Clone)]
pub struct JobHeader {
    pub jobid: String,
    pub queue: String,
    /// Destination the job was originally submitted to.
    pub origin_dest: String,
    pub state: JobState,
    pub substate: JobSubstate,
    pub svrflags: u32,
    pub exec_uid: u32,
    pub exec_gid: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub exit_status: Option<i32>,
    pub mom_addr: Option<String>,
    pub mom_port: u16,
    pub queue_rank: i64,
    pub subjob_index: i64,
    pub rerun_count: i32,
}

/// One task placement on a vnode, filled in at run time.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTask {
    pub vnode: String,
    pub resources: Vec<(String, AttrValue)>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub header: JobHeader,
    pub attrs: AttrArray,
    pub script: Option<Vec<u8>>,
    pub tasks: Vec<NodeTask>,
    /// Commit gate: nothing else may reference the job before Commit.
    pub committed: bool,
    pub creation: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl Job {
    pub fn new(jobid: impl Into<String>, owner: &str, queue: &str, server: &str) -> Self {
        let jobid = jobid.into();
        let now = Utc::now();
        let mut attrs = AttrArray::new(JOB_ATTR_DEFS);
        let set = |attrs: &mut AttrArray, name: &str, v: AttrValue| {
            let i = attrs.idx(name).expect("definition table entry");
            attrs.set_value(i, v);
        };
        set(&mut attrs, "Job_Owner", AttrValue::Str(owner.to_string()));
        set(&mut attrs, "queue", AttrValue::Str(queue.to_string()));
        set(&mut attrs, "server", AttrValue::Str(server.to_string()));
        set(&mut attrs, "ctime", AttrValue::Long(now.timestamp()));
        set(&mut attrs, "qtime", AttrValue::Long(now.timestamp()));
        set(&mut attrs, "run_count", AttrValue::Long(0));
        let mut job = Self {
            header: JobHeader {
                jobid,
                queue: queue.to_string(),
                origin_dest: queue.to_string(),
                state: JobState::Transit,
                substate: JobSubstate::TransIn,
                svrflags: 0,
                exec_uid: 0,
                exec_gid: 0,
                start_time: None,
                exit_status: None,
                mom_addr: None,
                mom_port: 0,
                queue_rank: 0,
                subjob_index: -1,
                rerun_count: 0,
            },
            attrs,
            script: None,
            tasks: Vec::new(),
            committed: false,
            creation: now,
            modify_time: now,
        };
        job.mirror_state();
        job
    }

    pub fn id(&self) -> &str {
        &self.header.jobid
    }

    /// Mirror state/substate into the attribute array so observers see
    /// one consistent view.
    fn mirror_state(&mut self) {
        let i = self.attrs.idx("job_state").expect("job_state def");
        self.attrs
            .set_value(i, AttrValue::Char(self.header.state.letter()));
        let i = self.attrs.idx("substate").expect("substate def");
        self.attrs
            .set_value(i, AttrValue::Long(i64::from(self.header.substate.to_db())));
        let i = self.attrs.idx("mtime").expect("mtime def");
        self.attrs
            .set_value(i, AttrValue::Long(Utc::now().timestamp()));
    }

    /// The one place job state changes. Validates the pair and keeps
    /// the attribute mirror in step.
    pub fn set_state(&mut self, state: JobState, substate: JobSubstate) -> Result<()> {
        check_pair(state, substate)?;
        self.header.state = state;
        self.header.substate = substate;
        self.modify_time = Utc::now();
        self.mirror_state();
        Ok(())
    }

    pub fn exec_vnode(&self) -> Option<&str> {
        match self.attrs.get_by_name("exec_vnode") {
            Some(AttrValue::Str(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    pub fn set_attr_str(&mut self, name: &str, value: &str) -> Result<()> {
        let i = self
            .attrs
            .idx(name)
            .ok_or_else(|| BatchError::BadAttribute(name.to_string()))?;
        self.attrs.set_value(i, AttrValue::Str(value.to_string()));
        Ok(())
    }

    pub fn set_attr_long(&mut self, name: &str, value: i64) -> Result<()> {
        let i = self
            .attrs
            .idx(name)
            .ok_or_else(|| BatchError::BadAttribute(name.to_string()))?;
        self.attrs.set_value(i, AttrValue::Long(value));
        Ok(())
    }

    pub fn hold_types(&self) -> String {
        match self.attrs.get_by_name("Hold_Types") {
            Some(AttrValue::Str(s)) => s.clone(),
            _ => "n".to_string(),
        }
    }

    // ---- transitions -------------------------------------------------

    /// Submission complete: job becomes visible in its queue.
    pub fn commit(&mut self) -> Result<()> {
        if self.committed {
            // Commit after success is a no-op
            return Ok(());
        }
        if self.header.state != JobState::Transit {
            return Err(BatchError::BadJobState);
        }
        self.committed = true;
        if self.hold_types() != "n" && !self.hold_types().is_empty() {
            self.set_state(JobState::Held, JobSubstate::Held)
        } else {
            self.set_state(JobState::Queued, JobSubstate::Queued)
        }
    }

    pub fn hold(&mut self, hold_types: &str) -> Result<()> {
        let combined = merge_holds(&self.hold_types(), hold_types, true);
        self.set_attr_str("Hold_Types", &combined)?;
        match self.header.state {
            JobState::Queued | JobState::Waiting => {
                self.set_state(JobState::Held, JobSubstate::Held)
            }
            JobState::Held => Ok(()),
            // holds on running jobs latch and apply at requeue
            JobState::Running => Ok(()),
            _ => Err(BatchError::BadJobState),
        }
    }

    pub fn release(&mut self, hold_types: &str) -> Result<()> {
        let remaining = merge_holds(&self.hold_types(), hold_types, false);
        self.set_attr_str("Hold_Types", &remaining)?;
        if self.header.state == JobState::Held && remaining == "n" {
            self.set_state(JobState::Queued, JobSubstate::Queued)?;
        }
        Ok(())
    }

    /// Scheduler picked a placement; the mother-MoM address is recorded
    /// atomically with the transition.
    pub fn run(&mut self, exec_vnode: &str, mom_addr: &str, mom_port: u16) -> Result<()> {
        if !self.committed {
            return Err(BatchError::JobNotCommitted);
        }
        if !matches!(self.header.state, JobState::Queued | JobState::Waiting) {
            return Err(BatchError::BadJobState);
        }
        self.set_attr_str("exec_vnode", exec_vnode)?;
        self.set_attr_str("exec_host", &vnode_to_host(exec_vnode))?;
        self.header.mom_addr = Some(mom_addr.to_string());
        self.header.mom_port = mom_port;
        self.header.start_time = Some(Utc::now());
        let i = self.attrs.idx("stime").expect("stime def");
        self.attrs
            .set_value(i, AttrValue::Long(Utc::now().timestamp()));
        let runs = match self.attrs.get_by_name("run_count") {
            Some(AttrValue::Long(n)) => *n,
            _ => 0,
        };
        self.set_attr_long("run_count", runs + 1)?;
        self.set_state(JobState::Running, JobSubstate::Running)
    }

    pub fn suspend(&mut self) -> Result<()> {
        if self.header.state != JobState::Running {
            return Err(BatchError::BadJobState);
        }
        self.set_state(JobState::Running, JobSubstate::Suspended)
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.header.state != JobState::Running
            || !matches!(
                self.header.substate,
                JobSubstate::Suspended | JobSubstate::SchedSuspended
            )
        {
            return Err(BatchError::BadJobState);
        }
        self.set_state(JobState::Running, JobSubstate::Running)
    }

    /// MoM reported the session ended. A delete moves the job to
    /// Exiting first, so the obit is accepted from either state.
    pub fn obit(&mut self, exit_status: i32) -> Result<()> {
        if !matches!(self.header.state, JobState::Running | JobState::Exiting) {
            return Err(BatchError::BadJobState);
        }
        self.header.exit_status = Some(exit_status);
        self.set_attr_long("exit_status", i64::from(exit_status))?;
        self.set_state(JobState::Exiting, JobSubstate::Exiting)
    }

    /// Drain complete; the record either lingers as history or expires.
    pub fn finalize(&mut self, keep_history: bool) -> Result<()> {
        if self.header.state != JobState::Exiting {
            return Err(BatchError::BadJobState);
        }
        if self.header.exit_status.is_none() {
            return Err(BatchError::Invariant(format!(
                "{} exiting without exit status",
                self.header.jobid
            )));
        }
        if keep_history {
            self.set_state(JobState::Finished, JobSubstate::Finished)
        } else {
            self.set_state(JobState::Expired, JobSubstate::Expired)
        }
    }

    /// Requeue a running job: exit status is discarded, the rerun count
    /// moves up, the script is preserved.
    pub fn rerun(&mut self) -> Result<()> {
        if !matches!(self.header.state, JobState::Running | JobState::Exiting) {
            return Err(BatchError::BadJobState);
        }
        self.header.exit_status = None;
        let i = self.attrs.idx("exit_status").expect("exit_status def");
        self.attrs.unset(i);
        self.header.rerun_count += 1;
        self.header.mom_addr = None;
        self.header.mom_port = 0;
        self.header.start_time = None;
        let i = self.attrs.idx("exec_vnode").expect("exec_vnode def");
        self.attrs.unset(i);
        let i = self.attrs.idx("exec_host").expect("exec_host def");
        self.attrs.unset(i);
        let i = self.attrs.idx("resources_used").expect("resources_used def");
        self.attrs.unset(i);
        self.tasks.clear();
        self.set_state(JobState::Queued, JobSubstate::Queued)
    }

    /// The job left for another server.
    pub fn moved(&mut self) -> Result<()> {
        if !matches!(
            self.header.state,
            JobState::Queued | JobState::Held | JobState::Waiting
        ) {
            return Err(BatchError::BadJobState);
        }
        self.set_state(JobState::Moved, JobSubstate::Moved)
    }

    /// Invariants observers rely on; checked in debug paths and tests.
    pub fn check_invariants(&self) -> Result<()> {
        check_pair(self.header.state, self.header.substate)?;
        if self.header.state == JobState::Running
            && (self.exec_vnode().is_none() || self.header.mom_addr.is_none())
        {
            return Err(BatchError::Invariant(format!(
                "{} running without placement",
                self.header.jobid
            )));
        }
        if self.header.state == JobState::Finished && self.header.exit_status.is_none() {
            return Err(BatchError::Invariant(format!(
                "{} finished without exit status",
                self.header.jobid
            )));
        }
        Ok(())
    }
}

/// Merge or strip hold letters. "n" means no holds.
fn merge_holds(current: &str, change: &str, add: bool) -> String {
    let mut set: Vec<char> = current.chars().filter(|c| *c != 'n').collect();
    for c in change.chars().filter(|c| *c != 'n') {
        if add {
            if !set.contains(&c) {
                set.push(c);
            }
        } else {
            set.retain(|h| *h != c);
        }
    }
    if set.is_empty() {
        "n".to_string()
    } else {
        set.sort_unstable();
        set.into_iter().collect()
    }
}

/// Host projection of an exec_vnode expression:
/// `(n0:ncpus=1)+(n1:ncpus=2)` becomes `n0/0+n1/1`.
pub fn vnode_to_host(exec_vnode: &str) -> String {
    exec_vnode
        .split('+')
        .enumerate()
        .filter_map(|(i, chunk)| {
            let chunk = chunk.trim_start_matches('(').trim_end_matches(')');
            let host = chunk.split(':').next()?;
            if host.is_empty() {
                None
            } else {
                Some(format!("{host}/{i}"))
            }
        })
        .collect::<Vec<_>>()
        .join("+")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Job {
        let mut j = Job::new("1.host", "alice@host", "workq", "host");
        j.commit().unwrap();
        j
    }

    #[test]
    fn new_job_is_transit_until_commit() {
        let j = Job::new("1.host", "alice@host", "workq", "host");
        assert_eq!(j.header.state, JobState::Transit);
        assert!(!j.committed);
    }

    #[test]
    fn commit_moves_to_queued_and_is_idempotent() {
        let mut j = sample();
        assert_eq!(j.header.state, JobState::Queued);
        j.commit().unwrap();
        assert_eq!(j.header.state, JobState::Queued);
    }

    #[test]
    fn commit_honors_submitted_holds() {
        let mut j = Job::new("1.host", "alice@host", "workq", "host");
        j.set_attr_str("Hold_Types", "u").unwrap();
        j.commit().unwrap();
        assert_eq!(j.header.state, JobState::Held);
    }

    #[test]
    fn hold_release_round_trip() {
        let mut j = sample();
        j.hold("u").unwrap();
        assert_eq!(j.header.state, JobState::Held);
        j.release("u").unwrap();
        assert_eq!(j.header.state, JobState::Queued);
        assert_eq!(j.hold_types(), "n");
    }

    #[test]
    fn run_records_placement_atomically() {
        let mut j = sample();
        j.run("(n0:ncpus=1:mem=1gb)", "10.0.0.5", 15003).unwrap();
        assert_eq!(j.header.state, JobState::Running);
        assert_eq!(j.exec_vnode(), Some("(n0:ncpus=1:mem=1gb)"));
        assert_eq!(j.header.mom_addr.as_deref(), Some("10.0.0.5"));
        j.check_invariants().unwrap();
    }

    #[test]
    fn run_on_uncommitted_job_is_refused() {
        let mut j = Job::new("1.host", "alice@host", "workq", "host");
        assert!(matches!(
            j.run("(n0:ncpus=1)", "10.0.0.5", 15003),
            Err(BatchError::JobNotCommitted)
        ));
    }

    #[test]
    fn obit_then_finalize_reaches_finished() {
        let mut j = sample();
        j.run("(n0:ncpus=1)", "10.0.0.5", 15003).unwrap();
        j.obit(0).unwrap();
        assert_eq!(j.header.state, JobState::Exiting);
        j.finalize(true).unwrap();
        assert_eq!(j.header.state, JobState::Finished);
        assert_eq!(j.header.exit_status, Some(0));
        j.check_invariants().unwrap();
    }

    #[test]
    fn suspend_keeps_state_running() {
        let mut j = sample();
        j.run("(n0:ncpus=1)", "10.0.0.5", 15003).unwrap();
        j.suspend().unwrap();
        assert_eq!(j.header.state, JobState::Running);
        assert_eq!(j.header.substate, JobSubstate::Suspended);
        j.resume().unwrap();
        assert_eq!(j.header.substate, JobSubstate::Running);
    }

    #[test]
    fn rerun_discards_exit_and_bumps_count() {
        let mut j = sample();
        j.script = Some(b"#!/bin/sh\necho hi\n".to_vec());
        j.run("(n0:ncpus=1)", "10.0.0.5", 15003).unwrap();
        j.obit(1).unwrap();
        j.rerun().unwrap();
        assert_eq!(j.header.state, JobState::Queued);
        assert_eq!(j.header.exit_status, None);
        assert_eq!(j.header.rerun_count, 1);
        assert!(j.script.is_some());
        assert_eq!(j.exec_vnode(), None);
    }

    #[test]
    fn state_mirror_tracks_transitions() {
        let mut j = sample();
        j.run("(n0:ncpus=1)", "10.0.0.5", 15003).unwrap();
        assert_eq!(
            j.attrs.get_by_name("job_state"),
            Some(&AttrValue::Char('R'))
        );
        assert_eq!(
            j.attrs.get_by_name("substate"),
            Some(&AttrValue::Long(42))
        );
    }

    #[test]
    fn exec_host_is_projected_from_exec_vnode() {
        assert_eq!(vnode_to_host("(n0:ncpus=1)+(n1:ncpus=2)"), "n0/0+n1/1");
    }

    #[test]
    fn finalize_without_exit_status_violates_invariant() {
        let mut j = sample();
        j.run("(n0:ncpus=1)", "10.0.0.5", 15003).unwrap();
        // force the inconsistent shape directly
        j.set_state(JobState::Exiting, JobSubstate::Exiting).unwrap();
        assert!(j.finalize(true).is_err());
    }
}
