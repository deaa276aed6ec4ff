//! The server object: the singleton record other objects hang off.

use crate::domains::attr::{AttrArray, AttrDef, AttrType, AttrValue};

pub const SVR_ATTR_DEFS: &[AttrDef] = &[
    AttrDef::new("server_state", AttrType::Str, 0),
    AttrDef::new("scheduling", AttrType::Bool, 0),
    AttrDef::new("default_queue", AttrType::Str, 0),
    AttrDef::new("total_jobs", AttrType::Long, 0),
    AttrDef::new("managers", AttrType::AclList, 0),
    AttrDef::new("acl_hosts", AttrType::AclList, 0),
    AttrDef::new("acl_host_enable", AttrType::Bool, 0),
    AttrDef::new("job_history_enable", AttrType::Bool, 0),
    AttrDef::new("job_history_duration", AttrType::Duration, 0),
    AttrDef::new("node_fail_requeue", AttrType::Duration, 0),
    AttrDef::new("resources_default", AttrType::ResList, 0),
    AttrDef::new("resources_available", AttrType::ResList, 0),
    AttrDef::new("pbs_version", AttrType::Str, 0),
];

#[derive(Debug, Clone)]
pub struct SvrObj {
    pub name: String,
    pub attrs: AttrArray,
    pub next_job_seq: i64,
}

impl SvrObj {
    pub fn new(name: impl Into<String>) -> Self {
        let mut attrs = AttrArray::new(SVR_ATTR_DEFS);
        let i = attrs.idx("server_state").expect("state def");
        attrs.set_value(i, AttrValue::Str("Active".into()));
        let i = attrs.idx("scheduling").expect("scheduling def");
        attrs.set_value(i, AttrValue::Bool(true));
        let i = attrs.idx("default_queue").expect("default_queue def");
        attrs.set_value(i, AttrValue::Str("workq".into()));
        let i = attrs.idx("job_history_enable").expect("history def");
        attrs.set_value(i, AttrValue::Bool(true));
        Self {
            name: name.into(),
            attrs,
            next_job_seq: 1,
        }
    }

    pub fn job_history_enabled(&self) -> bool {
        matches!(
            self.attrs.get_by_name("job_history_enable"),
            Some(AttrValue::Bool(true))
        )
    }

    pub fn default_queue(&self) -> String {
        match self.attrs.get_by_name("default_queue") {
            Some(AttrValue::Str(q)) => q.clone(),
            _ => "workq".to_string(),
        }
    }

    pub fn is_manager(&self, user: &str) -> bool {
        match self.attrs.get_by_name("managers") {
            Some(AttrValue::AclList(list)) => list.iter().any(|m| m == user),
            _ => false,
        }
    }

    /// Take the next jobid number.
    pub fn next_seq(&mut self) -> i64 {
        let n = self.next_job_seq;
        self.next_job_seq += 1;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_server_is_active_with_workq() {
        let s = SvrObj::new("host");
        assert_eq!(s.default_queue(), "workq");
        assert!(s.job_history_enabled());
    }

    #[test]
    fn sequence_increments() {
        let mut s = SvrObj::new("host");
        assert_eq!(s.next_seq(), 1);
        assert_eq!(s.next_seq(), 2);
    }
}
