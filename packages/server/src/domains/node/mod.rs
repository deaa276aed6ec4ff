//! Nodes and vnodes.
//!
//! A node is the resource producer a MoM reports for; its vnodes are
//! the placement units the scheduler assigns. Vnode state is a bitset,
//! sharing is resolved against the requested placement through a fixed
//! table.

use chrono::{DateTime, Utc};

use crate::common::{BatchError, Result};
use crate::domains::attr::{AttrArray, AttrDef, AttrType, AttrValue, WireAttr};

/// Vnode state bits.
pub mod vnode_state {
    pub const FREE: u32 = 0;
    pub const JOB_BUSY: u32 = 0x001;
    pub const JOB_EXCLUSIVE: u32 = 0x002;
    pub const OFFLINE: u32 = 0x004;
    pub const DOWN: u32 = 0x008;
    pub const STALE: u32 = 0x010;
    pub const UNRESOLVABLE: u32 = 0x020;
    pub const MAINTENANCE: u32 = 0x040;
    pub const PROVISIONING: u32 = 0x080;
    pub const WAIT_PROVISIONING: u32 = 0x100;
    pub const SLEEP: u32 = 0x200;
    pub const UNKNOWN: u32 = 0x400;
}

/// Node-configured sharing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sharing {
    #[default]
    DefaultShared,
    DefaultExcl,
    DefaultExclhost,
    IgnoreExcl,
    ForceExclhost,
}

impl Sharing {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(match text {
            "default_shared" => Sharing::DefaultShared,
            "default_excl" => Sharing::DefaultExcl,
            "default_exclhost" => Sharing::DefaultExclhost,
            "ignore_excl" => Sharing::IgnoreExcl,
            "force_exclhost" => Sharing::ForceExclhost,
            other => return Err(BatchError::BadAttribute(format!("sharing {other}"))),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Sharing::DefaultShared => "default_shared",
            Sharing::DefaultExcl => "default_excl",
            Sharing::DefaultExclhost => "default_exclhost",
            Sharing::IgnoreExcl => "ignore_excl",
            Sharing::ForceExclhost => "force_exclhost",
        }
    }
}

/// Placement requested for a chunk. `Free` means the request named no
/// preference and the node default applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Share,
    Excl,
    ExclHost,
    Free,
}

/// What the job actually gets on the vnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveShare {
    Share,
    Excl,
    ExclHost,
}

/// The sharing resolution table: node sharing mode crossed with the
/// requested placement.
pub fn effective_sharing(sharing: Sharing, requested: Placement) -> EffectiveShare {
    match sharing {
        Sharing::DefaultShared => match requested {
            Placement::Free | Placement::Share => EffectiveShare::Share,
            Placement::Excl => EffectiveShare::Excl,
            Placement::ExclHost => EffectiveShare::ExclHost,
        },
        Sharing::DefaultExcl => match requested {
            Placement::Free | Placement::Share | Placement::Excl => EffectiveShare::Excl,
            Placement::ExclHost => EffectiveShare::ExclHost,
        },
        Sharing::DefaultExclhost | Sharing::ForceExclhost => EffectiveShare::ExclHost,
        Sharing::IgnoreExcl => EffectiveShare::Share,
    }
}

/// One placement unit inside a node.
#[derive(Debug, Clone)]
pub struct Vnode {
    pub name: String,
    pub state: u32,
    pub sharing: Sharing,
    pub resources_available: Vec<(String, AttrValue)>,
    pub resources_assigned: Vec<(String, AttrValue)>,
    pub jobs: Vec<String>,
}

impl Vnode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: vnode_state::FREE,
            sharing: Sharing::default(),
            resources_available: Vec::new(),
            resources_assigned: Vec::new(),
            jobs: Vec::new(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.state
            & (vnode_state::DOWN
                | vnode_state::OFFLINE
                | vnode_state::STALE
                | vnode_state::UNRESOLVABLE)
            == 0
    }

    /// Add assigned resources for a job, key-wise.
    pub fn assign(&mut self, jobid: &str, resources: &[(String, AttrValue)]) -> Result<()> {
        for (name, v) in resources {
            match self
                .resources_assigned
                .iter_mut()
                .find(|(k, _)| k == name)
            {
                Some((_, existing)) => {
                    existing.apply(v, crate::domains::attr::SetOp::Incr)?;
                }
                None => self.resources_assigned.push((name.clone(), v.clone())),
            }
        }
        if !self.jobs.iter().any(|j| j == jobid) {
            self.jobs.push(jobid.to_string());
        }
        self.state |= vnode_state::JOB_BUSY;
        Ok(())
    }

    /// Release a job's resources; the busy bit drops with the last job.
    pub fn release(&mut self, jobid: &str, resources: &[(String, AttrValue)]) -> Result<()> {
        for (name, v) in resources {
            if let Some((_, existing)) = self
                .resources_assigned
                .iter_mut()
                .find(|(k, _)| k == name)
            {
                existing.apply(v, crate::domains::attr::SetOp::Decr)?;
            }
        }
        self.jobs.retain(|j| j != jobid);
        if self.jobs.is_empty() {
            self.state &= !(vnode_state::JOB_BUSY | vnode_state::JOB_EXCLUSIVE);
        }
        Ok(())
    }
}

pub const NODE_ATTR_DEFS: &[AttrDef] = &[
    AttrDef::new("Mom", AttrType::Str, 0),
    AttrDef::new("Port", AttrType::Long, 0),
    AttrDef::new("state", AttrType::Str, 0),
    AttrDef::new("sharing", AttrType::Str, 0),
    AttrDef::new("resources_available", AttrType::ResList, 0),
    AttrDef::new("resources_assigned", AttrType::ResList, 0),
    AttrDef::new("comment", AttrType::Str, 0),
    AttrDef::new("resv_enable", AttrType::Bool, 0),
    AttrDef::new("no_multinode_jobs", AttrType::Bool, 0),
    AttrDef::new("queue", AttrType::Str, 0),
];

/// A MoM host with its vnode list.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub mom_host: String,
    pub mom_port: u16,
    pub index: i64,
    pub vnodes: Vec<Vnode>,
    pub attrs: AttrArray,
    pub creation: DateTime<Utc>,
}

impl Node {
    pub fn new(name: impl Into<String>, mom_port: u16, index: i64) -> Self {
        let name = name.into();
        Self {
            mom_host: name.clone(),
            name: name.clone(),
            mom_port,
            index,
            vnodes: vec![Vnode::new(name)],
            attrs: AttrArray::new(NODE_ATTR_DEFS),
            creation: Utc::now(),
        }
    }

    pub fn vnode(&self, name: &str) -> Option<&Vnode> {
        self.vnodes.iter().find(|v| v.name == name)
    }

    pub fn vnode_mut(&mut self, name: &str) -> Option<&mut Vnode> {
        self.vnodes.iter_mut().find(|v| v.name == name)
    }

    /// Apply a ModifyVnode attribute batch to one vnode.
    pub fn modify_vnode(&mut self, vnode: &str, entries: &[WireAttr]) -> Result<()> {
        let idx = self
            .vnodes
            .iter()
            .position(|vn| vn.name == vnode)
            .ok_or_else(|| BatchError::UnknownNode(vnode.to_string()))?;
        for e in entries {
            match e.name.as_str() {
                "state" => {
                    self.vnodes[idx].state = parse_vnode_states(&e.value)?;
                }
                "sharing" => {
                    self.vnodes[idx].sharing = Sharing::parse(&e.value)?;
                }
                "resources_available" => {
                    let resource = e
                        .resource
                        .as_deref()
                        .ok_or_else(|| BatchError::BadAttribute(e.name.clone()))?;
                    let ty = crate::domains::attr::resource_type(resource);
                    let value = ty.decode(&e.value)?;
                    match self.vnodes[idx]
                        .resources_available
                        .iter_mut()
                        .find(|(k, _)| k == resource)
                    {
                        Some((_, existing)) => *existing = value,
                        None => self.vnodes[idx]
                            .resources_available
                            .push((resource.to_string(), value)),
                    }
                }
                _ => self.attrs.apply(e, false).map(|_| ())?,
            }
        }
        Ok(())
    }
}

/// Parse a comma-separated vnode state list into the bitset.
pub fn parse_vnode_states(text: &str) -> Result<u32> {
    let mut bits = vnode_state::FREE;
    for word in text.split(',').map(str::trim).filter(|w| !w.is_empty()) {
        bits |= match word {
            "free" => vnode_state::FREE,
            "job-busy" => vnode_state::JOB_BUSY,
            "job-exclusive" => vnode_state::JOB_EXCLUSIVE,
            "offline" => vnode_state::OFFLINE,
            "down" => vnode_state::DOWN,
            "stale" => vnode_state::STALE,
            "unresolvable" => vnode_state::UNRESOLVABLE,
            "maintenance" => vnode_state::MAINTENANCE,
            "provisioning" => vnode_state::PROVISIONING,
            "wait-provisioning" => vnode_state::WAIT_PROVISIONING,
            "sleep" => vnode_state::SLEEP,
            "unknown" => vnode_state::UNKNOWN,
            other => return Err(BatchError::BadAttribute(format!("vnode state {other}"))),
        };
    }
    Ok(bits)
}

pub fn vnode_states_string(bits: u32) -> String {
    if bits == vnode_state::FREE {
        return "free".to_string();
    }
    let names = [
        (vnode_state::JOB_BUSY, "job-busy"),
        (vnode_state::JOB_EXCLUSIVE, "job-exclusive"),
        (vnode_state::OFFLINE, "offline"),
        (vnode_state::DOWN, "down"),
        (vnode_state::STALE, "stale"),
        (vnode_state::UNRESOLVABLE, "unresolvable"),
        (vnode_state::MAINTENANCE, "maintenance"),
        (vnode_state::PROVISIONING, "provisioning"),
        (vnode_state::WAIT_PROVISIONING, "wait-provisioning"),
        (vnode_state::SLEEP, "sleep"),
        (vnode_state::UNKNOWN, "unknown"),
    ];
    names
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, n)| *n)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharing_table_matches_every_cell() {
        use EffectiveShare as E;
        use Placement as P;
        use Sharing as S;
        let cases = [
            (S::DefaultShared, P::Free, E::Share),
            (S::DefaultShared, P::Share, E::Share),
            (S::DefaultShared, P::Excl, E::Excl),
            (S::DefaultShared, P::ExclHost, E::ExclHost),
            (S::DefaultExcl, P::Free, E::Excl),
            (S::DefaultExcl, P::Share, E::Excl),
            (S::DefaultExcl, P::Excl, E::Excl),
            (S::DefaultExcl, P::ExclHost, E::ExclHost),
            (S::DefaultExclhost, P::Free, E::ExclHost),
            (S::DefaultExclhost, P::Share, E::ExclHost),
            (S::DefaultExclhost, P::Excl, E::ExclHost),
            (S::DefaultExclhost, P::ExclHost, E::ExclHost),
            (S::ForceExclhost, P::Free, E::ExclHost),
            (S::ForceExclhost, P::Share, E::ExclHost),
            (S::ForceExclhost, P::Excl, E::ExclHost),
            (S::ForceExclhost, P::ExclHost, E::ExclHost),
            (S::IgnoreExcl, P::Free, E::Share),
            (S::IgnoreExcl, P::Share, E::Share),
            (S::IgnoreExcl, P::Excl, E::Share),
            (S::IgnoreExcl, P::ExclHost, E::Share),
        ];
        for (s, p, want) in cases {
            assert_eq!(effective_sharing(s, p), want, "{s:?} x {p:?}");
        }
    }

    #[test]
    fn vnode_state_bits_round_trip() {
        let bits = parse_vnode_states("offline,down").unwrap();
        assert_eq!(bits, vnode_state::OFFLINE | vnode_state::DOWN);
        assert_eq!(vnode_states_string(bits), "offline,down");
        assert_eq!(parse_vnode_states("free").unwrap(), vnode_state::FREE);
    }

    #[test]
    fn assign_release_tracks_busy_bit() {
        let mut v = Vnode::new("n0");
        let res = vec![("ncpus".to_string(), AttrValue::Long(2))];
        v.assign("1.host", &res).unwrap();
        assert!(v.state & vnode_state::JOB_BUSY != 0);
        assert_eq!(v.jobs, vec!["1.host"]);

        v.release("1.host", &res).unwrap();
        assert!(v.jobs.is_empty());
        assert_eq!(v.state & vnode_state::JOB_BUSY, 0);
        assert_eq!(
            v.resources_assigned[0].1,
            AttrValue::Long(0)
        );
    }

    #[test]
    fn unknown_sharing_mode_is_rejected() {
        assert!(Sharing::parse("sometimes_shared").is_err());
    }
}
