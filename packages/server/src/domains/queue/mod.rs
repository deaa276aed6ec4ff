//! Queues.
//!
//! A queue is either an execution target or a routing step. It owns an
//! ordered membership of jobs by queue rank; a job belongs to exactly
//! one queue on a server at a time and moves are atomic with respect to
//! that membership.

use chrono::{DateTime, Utc};

use crate::common::{BatchError, Result};
use crate::domains::attr::{AttrArray, AttrDef, AttrType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueKind {
    #[default]
    Execution,
    Route,
}

impl QueueKind {
    pub fn parse(text: &str) -> Result<Self> {
        match text.to_lowercase().as_str() {
            "execution" | "e" => Ok(QueueKind::Execution),
            "route" | "r" => Ok(QueueKind::Route),
            other => Err(BatchError::BadAttribute(format!("queue_type {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Execution => "Execution",
            QueueKind::Route => "Route",
        }
    }
}

pub const QUEUE_ATTR_DEFS: &[AttrDef] = &[
    AttrDef::new("queue_type", AttrType::Str, 0),
    AttrDef::new("enabled", AttrType::Bool, 0),
    AttrDef::new("started", AttrType::Bool, 0),
    AttrDef::new("Priority", AttrType::Long, 0),
    AttrDef::new("max_queued", AttrType::Long, 0),
    AttrDef::new("max_running", AttrType::Long, 0),
    AttrDef::new("resources_max", AttrType::ResList, 0),
    AttrDef::new("resources_min", AttrType::ResList, 0),
    AttrDef::new("resources_default", AttrType::ResList, 0),
    AttrDef::new("acl_users", AttrType::AclList, 0),
    AttrDef::new("acl_user_enable", AttrType::Bool, 0),
    AttrDef::new("route_destinations", AttrType::StrArr, 0),
    AttrDef::new("reservation", AttrType::Str, 0),
    AttrDef::new("total_jobs", AttrType::Long, 0),
];

#[derive(Debug, Clone)]
pub struct Queue {
    pub name: String,
    pub kind: QueueKind,
    pub enabled: bool,
    pub started: bool,
    /// Jobids in rank order.
    pub jobs: Vec<String>,
    /// Monotonic rank source for arriving jobs.
    pub next_rank: i64,
    /// Owning reservation, when this is a reservation queue.
    pub resv_id: Option<String>,
    pub attrs: AttrArray,
    pub creation: DateTime<Utc>,
}

impl Queue {
    pub fn new(name: impl Into<String>, kind: QueueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            started: matches!(kind, QueueKind::Execution),
            jobs: Vec::new(),
            next_rank: 1,
            resv_id: None,
            attrs: AttrArray::new(QUEUE_ATTR_DEFS),
            creation: Utc::now(),
        }
    }

    /// Admit a job, returning the rank it was given.
    pub fn admit(&mut self, jobid: &str) -> Result<i64> {
        if self.jobs.iter().any(|j| j == jobid) {
            return Err(BatchError::DuplicateId(jobid.to_string()));
        }
        self.jobs.push(jobid.to_string());
        let rank = self.next_rank;
        self.next_rank += 1;
        Ok(rank)
    }

    pub fn evict(&mut self, jobid: &str) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|j| j != jobid);
        self.jobs.len() != before
    }

    pub fn contains(&self, jobid: &str) -> bool {
        self.jobs.iter().any(|j| j == jobid)
    }

    /// Swap the rank positions of two member jobs (OrderJob).
    pub fn swap(&mut self, a: &str, b: &str) -> Result<()> {
        let ia = self
            .jobs
            .iter()
            .position(|j| j == a)
            .ok_or_else(|| BatchError::UnknownJob(a.to_string()))?;
        let ib = self
            .jobs
            .iter()
            .position(|j| j == b)
            .ok_or_else(|| BatchError::UnknownJob(b.to_string()))?;
        self.jobs.swap(ia, ib);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_assigns_increasing_ranks() {
        let mut q = Queue::new("workq", QueueKind::Execution);
        assert_eq!(q.admit("1.host").unwrap(), 1);
        assert_eq!(q.admit("2.host").unwrap(), 2);
        assert_eq!(q.jobs, vec!["1.host", "2.host"]);
    }

    #[test]
    fn double_admit_is_duplicate() {
        let mut q = Queue::new("workq", QueueKind::Execution);
        q.admit("1.host").unwrap();
        assert!(matches!(
            q.admit("1.host"),
            Err(BatchError::DuplicateId(_))
        ));
    }

    #[test]
    fn evict_reports_membership() {
        let mut q = Queue::new("workq", QueueKind::Execution);
        q.admit("1.host").unwrap();
        assert!(q.evict("1.host"));
        assert!(!q.evict("1.host"));
    }

    #[test]
    fn order_job_swaps_positions() {
        let mut q = Queue::new("workq", QueueKind::Execution);
        q.admit("1.host").unwrap();
        q.admit("2.host").unwrap();
        q.swap("1.host", "2.host").unwrap();
        assert_eq!(q.jobs, vec!["2.host", "1.host"]);
    }

    #[test]
    fn route_queues_start_stopped() {
        assert!(!Queue::new("r", QueueKind::Route).started);
        assert!(Queue::new("e", QueueKind::Execution).started);
    }
}
