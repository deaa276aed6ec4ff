//! Attribute definitions and per-object attribute arrays.
//!
//! A definition table is registered per object type at startup; the
//! array index of each definition is part of the persisted format, so
//! table order is append-only.

use std::collections::HashMap;

use super::list::WireAttr;
use super::value::{resource_type, AttrType, AttrValue, SetOp};
use crate::common::{BatchError, Result};

/// Permission bits on a definition.
pub mod perm {
    pub const READ_ONLY: u32 = 0x01;
    pub const MGR_ONLY: u32 = 0x02;
    pub const SCHED_SET: u32 = 0x04;
    pub const HIDDEN: u32 = 0x08;
    pub const CVTSLT: u32 = 0x10;
}

/// State bits on an attribute instance.
pub mod atflag {
    /// The attribute holds a value.
    pub const SET: u32 = 0x01;
    /// Changed since last save; drives persistence.
    pub const MODIFY: u32 = 0x02;
}

#[derive(Debug, Clone, Copy)]
pub struct AttrDef {
    pub name: &'static str,
    pub ty: AttrType,
    pub perms: u32,
}

impl AttrDef {
    pub const fn new(name: &'static str, ty: AttrType, perms: u32) -> Self {
        Self { name, ty, perms }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub value: AttrValue,
    pub flags: u32,
}

/// The attribute array of one object: a slot per definition plus the
/// catch-all bucket for names no definition covers.
#[derive(Debug, Clone)]
pub struct AttrArray {
    defs: &'static [AttrDef],
    slots: Vec<Option<Attr>>,
    unknown: Vec<WireAttr>,
}

impl AttrArray {
    pub fn new(defs: &'static [AttrDef]) -> Self {
        Self {
            defs,
            slots: vec![None; defs.len()],
            unknown: Vec::new(),
        }
    }

    pub fn defs(&self) -> &'static [AttrDef] {
        self.defs
    }

    pub fn idx(&self, name: &str) -> Option<usize> {
        self.defs.iter().position(|d| d.name == name)
    }

    pub fn get(&self, i: usize) -> Option<&AttrValue> {
        self.slots.get(i)?.as_ref().map(|a| &a.value)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&AttrValue> {
        self.get(self.idx(name)?)
    }

    pub fn is_set(&self, i: usize) -> bool {
        self.slots.get(i).map_or(false, Option::is_some)
    }

    pub fn unknown(&self) -> &[WireAttr] {
        &self.unknown
    }

    /// Overwrite a slot, marking it set and dirty.
    pub fn set_value(&mut self, i: usize, value: AttrValue) {
        self.slots[i] = Some(Attr {
            value,
            flags: atflag::SET | atflag::MODIFY,
        });
    }

    pub fn unset(&mut self, i: usize) {
        self.slots[i] = None;
    }

    /// Apply one wire entry through the definition's set hook.
    ///
    /// Unknown names land in the catch-all bucket unless `strict` is
    /// set (persisted reads), where they are rejected. Ordering
    /// operators return the match result and leave the slot alone.
    pub fn apply(&mut self, entry: &WireAttr, strict: bool) -> Result<Option<bool>> {
        let Some(i) = self.idx(&entry.name) else {
            if strict {
                return Err(BatchError::BadAttribute(entry.name.clone()));
            }
            self.unknown.push(entry.clone());
            return Ok(None);
        };
        let def = &self.defs[i];
        match (&entry.resource, def.ty) {
            (Some(resource), AttrType::ResList) => {
                let rtype = resource_type(resource);
                let incoming = rtype.decode(&entry.value)?;
                let slot = self.slots[i].get_or_insert(Attr {
                    value: AttrValue::ResList(Vec::new()),
                    flags: atflag::SET,
                });
                let AttrValue::ResList(list) = &mut slot.value else {
                    return Err(BatchError::Invariant(format!(
                        "slot for {} is not a resource list",
                        def.name
                    )));
                };
                let result = match list.iter_mut().find(|(k, _)| k == resource) {
                    Some((_, existing)) => existing.apply(&incoming, entry.op)?,
                    None => {
                        match entry.op {
                            SetOp::Eq | SetOp::Ne | SetOp::Gt | SetOp::Ge | SetOp::Lt
                            | SetOp::Le => return Ok(Some(false)),
                            SetOp::Decr => {}
                            _ => list.push((resource.clone(), incoming)),
                        }
                        None
                    }
                };
                if result.is_none() {
                    slot.flags |= atflag::MODIFY;
                }
                Ok(result)
            }
            (Some(resource), _) => Err(BatchError::BadAttribute(format!(
                "{}.{resource} is not a resource list",
                entry.name
            ))),
            (None, ty) => {
                let incoming = ty.decode(&entry.value)?;
                match &mut self.slots[i] {
                    Some(attr) => {
                        let result = attr.value.apply(&incoming, entry.op)?;
                        if result.is_none() {
                            attr.flags |= atflag::MODIFY;
                        }
                        Ok(result)
                    }
                    slot @ None => {
                        match entry.op {
                            SetOp::Eq | SetOp::Ne | SetOp::Gt | SetOp::Ge | SetOp::Lt
                            | SetOp::Le => Ok(Some(false)),
                            _ => {
                                *slot = Some(Attr {
                                    value: incoming,
                                    flags: atflag::SET | atflag::MODIFY,
                                });
                                Ok(None)
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn apply_all(&mut self, entries: &[WireAttr], strict: bool) -> Result<()> {
        for e in entries {
            self.apply(e, strict)?;
        }
        Ok(())
    }

    /// Encode the set attributes to the flat wire list, in definition
    /// table order. Resource lists expand to one entry per resource.
    pub fn encode_wire(&self) -> Vec<WireAttr> {
        let mut out = Vec::new();
        for (i, def) in self.defs.iter().enumerate() {
            let Some(attr) = &self.slots[i] else { continue };
            if def.perms & perm::HIDDEN != 0 {
                continue;
            }
            match &attr.value {
                AttrValue::ResList(list) => {
                    for (resource, v) in list {
                        out.push(WireAttr {
                            name: def.name.to_string(),
                            resource: Some(resource.clone()),
                            value: v.encode(),
                            flags: attr.flags,
                            op: SetOp::Set,
                        });
                    }
                }
                v => out.push(WireAttr {
                    name: def.name.to_string(),
                    resource: None,
                    value: v.encode(),
                    flags: attr.flags,
                    op: SetOp::Set,
                }),
            }
        }
        out
    }

    /// Sparse store form: only dirty attributes, as alternating
    /// `name.resource` / `flags.value` pairs. The separating dot is
    /// always present even when a field is empty.
    pub fn to_sparse(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (i, def) in self.defs.iter().enumerate() {
            let Some(attr) = &self.slots[i] else { continue };
            if attr.flags & atflag::MODIFY == 0 {
                continue;
            }
            match &attr.value {
                AttrValue::ResList(list) => {
                    for (resource, v) in list {
                        out.push(format!("{}.{resource}", def.name));
                        out.push(format!("{}.{}", attr.flags, v.encode()));
                    }
                }
                v => {
                    out.push(format!("{}.", def.name));
                    out.push(format!("{}.{}", attr.flags, v.encode()));
                }
            }
        }
        out
    }

    /// All set attributes in sparse form, dirty or not (insert saves).
    pub fn to_sparse_full(&self) -> Vec<String> {
        let mut dirty = self.clone();
        for attr in dirty.slots.iter_mut().flatten() {
            attr.flags |= atflag::MODIFY;
        }
        dirty.to_sparse()
    }

    /// Rebuild from sparse pairs. Strict: the persisted image must only
    /// contain known definitions.
    pub fn from_sparse(&mut self, pairs: &[String], strict: bool) -> Result<()> {
        if pairs.len() % 2 != 0 {
            return Err(BatchError::Invariant("odd sparse attribute array".into()));
        }
        for kv in pairs.chunks_exact(2) {
            let (name, resource) = kv[0]
                .split_once('.')
                .ok_or_else(|| BatchError::Invariant(format!("sparse key {}", kv[0])))?;
            let (flags, value) = kv[1]
                .split_once('.')
                .ok_or_else(|| BatchError::Invariant(format!("sparse value {}", kv[1])))?;
            let flags: u32 = flags
                .parse()
                .map_err(|_| BatchError::Invariant(format!("sparse flags {}", kv[1])))?;
            let entry = WireAttr {
                name: name.to_string(),
                resource: if resource.is_empty() {
                    None
                } else {
                    Some(resource.to_string())
                },
                value: value.to_string(),
                flags,
                op: SetOp::Set,
            };
            self.apply(&entry, strict)?;
        }
        Ok(())
    }

    /// Clear every dirty bit after a successful save.
    pub fn mark_clean(&mut self) {
        for attr in self.slots.iter_mut().flatten() {
            attr.flags &= !atflag::MODIFY;
        }
    }

    pub fn any_dirty(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|a| a.flags & atflag::MODIFY != 0)
    }

    /// Lookup table from name to slot for hot status paths.
    pub fn index_map(&self) -> HashMap<&'static str, usize> {
        self.defs
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name, i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DEFS: &[AttrDef] = &[
        AttrDef::new("Job_Name", AttrType::Str, 0),
        AttrDef::new("Resource_List", AttrType::ResList, 0),
        AttrDef::new("Priority", AttrType::Long, 0),
        AttrDef::new("secret", AttrType::Str, perm::HIDDEN),
    ];

    fn array() -> AttrArray {
        AttrArray::new(TEST_DEFS)
    }

    #[test]
    fn apply_then_encode_round_trips() {
        let mut a = array();
        a.apply(&WireAttr::new("Job_Name", "j1"), false).unwrap();
        a.apply(&WireAttr::with_resource("Resource_List", "ncpus", "2"), false)
            .unwrap();
        a.apply(&WireAttr::with_resource("Resource_List", "mem", "1gb"), false)
            .unwrap();
        let wire = a.encode_wire();
        let names: Vec<_> = wire
            .iter()
            .map(|w| (w.name.as_str(), w.resource.as_deref()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("Job_Name", None),
                ("Resource_List", Some("ncpus")),
                ("Resource_List", Some("mem")),
            ]
        );
        assert_eq!(wire[2].value, "1gb");
    }

    #[test]
    fn unknown_names_land_in_catch_all_unless_strict() {
        let mut a = array();
        a.apply(&WireAttr::new("vendor_extension", "x"), false).unwrap();
        assert_eq!(a.unknown().len(), 1);

        let err = a.apply(&WireAttr::new("vendor_extension", "x"), true);
        assert!(matches!(err, Err(BatchError::BadAttribute(_))));
    }

    #[test]
    fn hidden_attributes_stay_off_the_wire() {
        let mut a = array();
        a.apply(&WireAttr::new("secret", "s"), false).unwrap();
        assert!(a.encode_wire().is_empty());
    }

    #[test]
    fn sparse_writes_only_dirty_slots() {
        let mut a = array();
        a.apply(&WireAttr::new("Job_Name", "j1"), false).unwrap();
        a.mark_clean();
        a.apply(&WireAttr::new("Priority", "7"), false).unwrap();
        let sparse = a.to_sparse();
        assert_eq!(sparse.len(), 2);
        assert_eq!(sparse[0], "Priority.");
        assert!(sparse[1].ends_with(".7"));
    }

    #[test]
    fn sparse_round_trips_through_load() {
        let mut a = array();
        a.apply(&WireAttr::new("Job_Name", "j1"), false).unwrap();
        a.apply(&WireAttr::with_resource("Resource_List", "mem", "2gb"), false)
            .unwrap();
        let sparse = a.to_sparse_full();

        let mut b = array();
        b.from_sparse(&sparse, true).unwrap();
        assert_eq!(b.get_by_name("Job_Name"), Some(&AttrValue::Str("j1".into())));
        assert_eq!(
            b.get_by_name("Resource_List"),
            Some(&AttrValue::ResList(vec![(
                "mem".into(),
                AttrValue::Size(2 << 30)
            )]))
        );
    }

    #[test]
    fn ordering_op_on_unset_slot_is_false_not_set() {
        let mut a = array();
        let entry = WireAttr {
            name: "Priority".into(),
            resource: None,
            value: "5".into(),
            flags: 0,
            op: SetOp::Eq,
        };
        assert_eq!(a.apply(&entry, false).unwrap(), Some(false));
        assert!(!a.is_set(a.idx("Priority").unwrap()));
    }
}
