//! Reservations.
//!
//! A reservation is a time-bounded booking with its own queue; the
//! queue's lifetime is the reservation's. Jobs submitted into the
//! reservation queue inherit that lifetime.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::common::{BatchError, Result};
use crate::domains::attr::{AttrArray, AttrDef, AttrType, AttrValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResvState {
    Unconfirmed,
    Confirmed,
    Wait,
    TimeToRun,
    Running,
    Finished,
    Deleted,
    Degraded,
}

impl ResvState {
    pub fn to_db(self) -> i16 {
        match self {
            ResvState::Unconfirmed => 0,
            ResvState::Confirmed => 1,
            ResvState::Wait => 2,
            ResvState::TimeToRun => 3,
            ResvState::Running => 4,
            ResvState::Finished => 5,
            ResvState::Deleted => 6,
            ResvState::Degraded => 7,
        }
    }

    pub fn from_db(v: i16) -> Result<Self> {
        Ok(match v {
            0 => ResvState::Unconfirmed,
            1 => ResvState::Confirmed,
            2 => ResvState::Wait,
            3 => ResvState::TimeToRun,
            4 => ResvState::Running,
            5 => ResvState::Finished,
            6 => ResvState::Deleted,
            7 => ResvState::Degraded,
            other => return Err(BatchError::Invariant(format!("resv state {other}"))),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResvState::Unconfirmed => "RESV_UNCONFIRMED",
            ResvState::Confirmed => "RESV_CONFIRMED",
            ResvState::Wait => "RESV_WAIT",
            ResvState::TimeToRun => "RESV_TIME_TO_RUN",
            ResvState::Running => "RESV_RUNNING",
            ResvState::Finished => "RESV_FINISHED",
            ResvState::Deleted => "RESV_DELETED",
            ResvState::Degraded => "RESV_DEGRADED",
        }
    }
}

pub const RESV_ATTR_DEFS: &[AttrDef] = &[
    AttrDef::new("Reserve_Name", AttrType::Str, 0),
    AttrDef::new("Reserve_Owner", AttrType::Str, 0),
    AttrDef::new("reserve_state", AttrType::Str, 0),
    AttrDef::new("reserve_start", AttrType::Long, 0),
    AttrDef::new("reserve_end", AttrType::Long, 0),
    AttrDef::new("reserve_duration", AttrType::Duration, 0),
    AttrDef::new("Resource_List", AttrType::ResList, 0),
    AttrDef::new("resv_nodes", AttrType::Str, 0),
    AttrDef::new("queue", AttrType::Str, 0),
    AttrDef::new("Authorized_Users", AttrType::AclList, 0),
    AttrDef::new("reserve_retry", AttrType::Long, 0),
    AttrDef::new("reserve_count", AttrType::Long, 0),
    AttrDef::new("reserve_index", AttrType::Long, 0),
];

#[derive(Debug, Clone)]
pub struct Resv {
    pub resvid: String,
    pub owner: String,
    /// Queue carrying the reservation's jobs; same name as the resvid.
    pub queue: String,
    pub state: ResvState,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub exec_vnode: Option<String>,
    pub attrs: AttrArray,
    /// Occurrence indexes already cleaned up; makes ResvOccurEnd
    /// idempotent.
    pub occurrences_done: HashSet<u64>,
    pub creation: DateTime<Utc>,
}

impl Resv {
    pub fn new(
        resvid: impl Into<String>,
        owner: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        let resvid = resvid.into();
        let mut attrs = AttrArray::new(RESV_ATTR_DEFS);
        let i = attrs.idx("Reserve_Owner").expect("owner def");
        attrs.set_value(i, AttrValue::Str(owner.to_string()));
        let i = attrs.idx("reserve_start").expect("start def");
        attrs.set_value(i, AttrValue::Long(start.timestamp()));
        let i = attrs.idx("reserve_end").expect("end def");
        attrs.set_value(i, AttrValue::Long(end.timestamp()));
        let mut resv = Self {
            queue: resvid.clone(),
            resvid,
            owner: owner.to_string(),
            state: ResvState::Unconfirmed,
            start,
            end,
            exec_vnode: None,
            attrs,
            occurrences_done: HashSet::new(),
            creation: Utc::now(),
        };
        resv.mirror_state();
        resv
    }

    fn mirror_state(&mut self) {
        let i = self.attrs.idx("reserve_state").expect("state def");
        self.attrs
            .set_value(i, AttrValue::Str(self.state.as_str().to_string()));
    }

    pub fn set_state(&mut self, state: ResvState) {
        self.state = state;
        self.mirror_state();
    }

    /// Scheduler confirmation: a placement and a start time.
    pub fn confirm(&mut self, exec_vnode: &str, start: DateTime<Utc>) -> Result<()> {
        if !matches!(self.state, ResvState::Unconfirmed | ResvState::Degraded) {
            return Err(BatchError::BadResvState);
        }
        self.exec_vnode = Some(exec_vnode.to_string());
        self.start = start;
        let i = self.attrs.idx("resv_nodes").expect("resv_nodes def");
        self.attrs
            .set_value(i, AttrValue::Str(exec_vnode.to_string()));
        let i = self.attrs.idx("reserve_start").expect("start def");
        self.attrs.set_value(i, AttrValue::Long(start.timestamp()));
        self.set_state(ResvState::Confirmed);
        Ok(())
    }

    /// Start time arrived: the reservation period is open.
    pub fn begin(&mut self) -> Result<()> {
        if !matches!(self.state, ResvState::Confirmed | ResvState::TimeToRun) {
            return Err(BatchError::BadResvState);
        }
        if self.exec_vnode.is_none() {
            return Err(BatchError::Invariant(format!(
                "{} began without placement",
                self.resvid
            )));
        }
        self.set_state(ResvState::Running);
        Ok(())
    }

    /// Occurrence `k` ended. Idempotent per occurrence index.
    pub fn occurrence_end(&mut self, k: u64) -> bool {
        if !self.occurrences_done.insert(k) {
            return false;
        }
        let count = match self.attrs.get_by_name("reserve_count") {
            Some(AttrValue::Long(n)) => *n,
            _ => 0,
        };
        let i = self.attrs.idx("reserve_index").expect("index def");
        self.attrs.set_value(i, AttrValue::Long(k as i64));
        if count > 0 && self.occurrences_done.len() as i64 >= count {
            self.set_state(ResvState::Finished);
        }
        true
    }

    pub fn degrade(&mut self) {
        if matches!(self.state, ResvState::Confirmed | ResvState::Running) {
            self.set_state(ResvState::Degraded);
        }
    }

    /// First delete reports true; the second caller learns the
    /// reservation is already gone.
    pub fn delete(&mut self) -> bool {
        if self.state == ResvState::Deleted {
            return false;
        }
        self.set_state(ResvState::Deleted);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn sample() -> Resv {
        let start = Utc::now() + TimeDelta::hours(1);
        Resv::new("R1.host", "alice@host", start, start + TimeDelta::hours(1))
    }

    #[test]
    fn submit_starts_unconfirmed() {
        let r = sample();
        assert_eq!(r.state, ResvState::Unconfirmed);
        assert_eq!(r.queue, "R1.host");
    }

    #[test]
    fn confirm_requires_unconfirmed() {
        let mut r = sample();
        r.confirm("(n0:ncpus=2)", r.start).unwrap();
        assert_eq!(r.state, ResvState::Confirmed);
        assert!(matches!(
            r.confirm("(n1:ncpus=2)", r.start),
            Err(BatchError::BadResvState)
        ));
    }

    #[test]
    fn begin_without_placement_is_invariant_violation() {
        let mut r = sample();
        r.set_state(ResvState::Confirmed);
        assert!(r.begin().is_err());
    }

    #[test]
    fn occurrence_end_is_idempotent() {
        let mut r = sample();
        r.confirm("(n0:ncpus=2)", r.start).unwrap();
        assert!(r.occurrence_end(3));
        assert!(!r.occurrence_end(3));
        assert!(r.occurrence_end(4));
    }

    #[test]
    fn double_delete_reports_gone() {
        let mut r = sample();
        assert!(r.delete());
        assert!(!r.delete());
    }

    #[test]
    fn state_mirror_follows_transitions() {
        let mut r = sample();
        r.confirm("(n0:ncpus=2)", r.start).unwrap();
        assert_eq!(
            r.attrs.get_by_name("reserve_state"),
            Some(&AttrValue::Str("RESV_CONFIRMED".into()))
        );
    }
}
