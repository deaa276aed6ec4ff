//! Attribute value types and their decode/encode/compare behavior.

use std::cmp::Ordering;

use serde::Serialize;

use crate::common::{BatchError, Result};

/// Semantic type of an attribute, fixed by its definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Long,
    Bool,
    Char,
    Str,
    StrArr,
    Duration,
    Size,
    Float,
    ResList,
    AclList,
    Freq,
    EntityLimit,
}

/// Operator carried on each wire attribute entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SetOp {
    #[default]
    Set,
    Incr,
    Decr,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Merge,
}

impl SetOp {
    pub fn from_wire(v: u64) -> Result<Self> {
        Ok(match v {
            0 => SetOp::Set,
            1 => SetOp::Incr,
            2 => SetOp::Decr,
            3 => SetOp::Eq,
            4 => SetOp::Ne,
            5 => SetOp::Gt,
            6 => SetOp::Ge,
            7 => SetOp::Lt,
            8 => SetOp::Le,
            9 => SetOp::Merge,
            other => return Err(BatchError::BadAttribute(format!("op {other}"))),
        })
    }

    pub fn to_wire(self) -> u64 {
        match self {
            SetOp::Set => 0,
            SetOp::Incr => 1,
            SetOp::Decr => 2,
            SetOp::Eq => 3,
            SetOp::Ne => 4,
            SetOp::Gt => 5,
            SetOp::Ge => 6,
            SetOp::Lt => 7,
            SetOp::Le => 8,
            SetOp::Merge => 9,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Long(i64),
    Bool(bool),
    Char(char),
    Str(String),
    StrArr(Vec<String>),
    /// Seconds.
    Duration(i64),
    /// Bytes.
    Size(u64),
    Float(f64),
    /// Ordered mapping resource name -> typed value.
    ResList(Vec<(String, AttrValue)>),
    AclList(Vec<String>),
    /// Hertz.
    Freq(u64),
    /// Entity name -> limit.
    EntityLimit(Vec<(String, i64)>),
}

/// Wire type of a named resource inside a resource list. Unknown
/// resources decode as strings so forward compatibility holds.
pub fn resource_type(name: &str) -> AttrType {
    match name {
        "ncpus" | "mpiprocs" | "ompthreads" | "nodect" | "mem_per_task" => AttrType::Long,
        "mem" | "vmem" | "pmem" | "file" | "workdir_size" => AttrType::Size,
        "walltime" | "cput" | "pcput" | "min_walltime" | "max_walltime" => AttrType::Duration,
        "cpupercent" => AttrType::Float,
        "clockrate" => AttrType::Freq,
        _ => AttrType::Str,
    }
}

const SIZE_UNITS: [(&str, u64); 6] = [
    ("pb", 1 << 50),
    ("tb", 1 << 40),
    ("gb", 1 << 30),
    ("mb", 1 << 20),
    ("kb", 1 << 10),
    ("b", 1),
];

fn parse_size(text: &str) -> Result<u64> {
    let t = text.trim().to_lowercase();
    let bad = || BatchError::BadAttribute(format!("size {text}"));
    // word suffix: 8 bytes per word
    let (t, word) = match t.strip_suffix('w') {
        Some(rest) => (format!("{rest}b"), true),
        None => (t, false),
    };
    for (suffix, mult) in SIZE_UNITS {
        if let Some(num) = t.strip_suffix(suffix) {
            let n: u64 = num.trim().parse().map_err(|_| bad())?;
            let v = n.checked_mul(mult).ok_or_else(bad)?;
            return if word {
                v.checked_mul(8).ok_or_else(bad)
            } else {
                Ok(v)
            };
        }
    }
    t.parse().map_err(|_| bad())
}

fn encode_size(bytes: u64) -> String {
    for (suffix, mult) in SIZE_UNITS {
        if mult > 1 && bytes >= mult && bytes % mult == 0 {
            return format!("{}{}", bytes / mult, suffix);
        }
    }
    format!("{bytes}b")
}

fn parse_duration(text: &str) -> Result<i64> {
    let t = text.trim();
    let bad = || BatchError::BadAttribute(format!("duration {text}"));
    if t.contains(':') {
        let parts: Vec<&str> = t.split(':').collect();
        if parts.len() > 3 || parts.is_empty() {
            return Err(bad());
        }
        let mut secs: i64 = 0;
        for p in &parts {
            let v: i64 = p.parse().map_err(|_| bad())?;
            secs = secs * 60 + v;
        }
        Ok(secs)
    } else {
        t.parse().map_err(|_| bad())
    }
}

fn encode_duration(secs: i64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

fn parse_freq(text: &str) -> Result<u64> {
    let t = text.trim().to_lowercase();
    let bad = || BatchError::BadAttribute(format!("frequency {text}"));
    for (suffix, mult) in [("ghz", 1_000_000_000u64), ("mhz", 1_000_000), ("khz", 1_000), ("hz", 1)]
    {
        if let Some(num) = t.strip_suffix(suffix) {
            let n: f64 = num.trim().parse().map_err(|_| bad())?;
            return Ok((n * mult as f64) as u64);
        }
    }
    t.parse().map_err(|_| bad())
}

fn encode_freq(hz: u64) -> String {
    if hz >= 1_000_000 && hz % 1_000_000 == 0 {
        format!("{}mhz", hz / 1_000_000)
    } else {
        format!("{hz}hz")
    }
}

impl AttrType {
    /// The decode hook: wire text to typed value.
    pub fn decode(self, text: &str) -> Result<AttrValue> {
        let bad = || BatchError::BadAttribute(text.to_string());
        Ok(match self {
            AttrType::Long => AttrValue::Long(text.trim().parse().map_err(|_| bad())?),
            AttrType::Bool => match text.trim().to_lowercase().as_str() {
                "true" | "t" | "1" | "y" | "yes" => AttrValue::Bool(true),
                "false" | "f" | "0" | "n" | "no" => AttrValue::Bool(false),
                _ => return Err(bad()),
            },
            AttrType::Char => AttrValue::Char(text.chars().next().ok_or_else(bad)?),
            AttrType::Str => AttrValue::Str(text.to_string()),
            AttrType::StrArr => AttrValue::StrArr(
                text.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            AttrType::Duration => AttrValue::Duration(parse_duration(text)?),
            AttrType::Size => AttrValue::Size(parse_size(text)?),
            AttrType::Float => AttrValue::Float(text.trim().parse().map_err(|_| bad())?),
            AttrType::ResList => {
                // one wire entry per resource; a bare value is invalid
                return Err(BatchError::BadAttribute(format!(
                    "resource list requires a resource name: {text}"
                )));
            }
            AttrType::AclList => AttrValue::AclList(
                text.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            AttrType::Freq => AttrValue::Freq(parse_freq(text)?),
            AttrType::EntityLimit => {
                // "[u:alice=10],[g:devs=4]" style entries
                let mut out = Vec::new();
                for part in text.split(',') {
                    let part = part.trim().trim_start_matches('[').trim_end_matches(']');
                    if part.is_empty() {
                        continue;
                    }
                    let (ent, lim) = part.split_once('=').ok_or_else(bad)?;
                    out.push((ent.trim().to_string(), lim.trim().parse().map_err(|_| bad())?));
                }
                AttrValue::EntityLimit(out)
            }
        })
    }
}

impl AttrValue {
    pub fn type_of(&self) -> AttrType {
        match self {
            AttrValue::Long(_) => AttrType::Long,
            AttrValue::Bool(_) => AttrType::Bool,
            AttrValue::Char(_) => AttrType::Char,
            AttrValue::Str(_) => AttrType::Str,
            AttrValue::StrArr(_) => AttrType::StrArr,
            AttrValue::Duration(_) => AttrType::Duration,
            AttrValue::Size(_) => AttrType::Size,
            AttrValue::Float(_) => AttrType::Float,
            AttrValue::ResList(_) => AttrType::ResList,
            AttrValue::AclList(_) => AttrType::AclList,
            AttrValue::Freq(_) => AttrType::Freq,
            AttrValue::EntityLimit(_) => AttrType::EntityLimit,
        }
    }

    /// The encode hook: typed value back to canonical wire text.
    /// Resource lists encode per-resource; see `AttrArray::encode_wire`.
    pub fn encode(&self) -> String {
        match self {
            AttrValue::Long(v) => v.to_string(),
            AttrValue::Bool(v) => if *v { "True" } else { "False" }.to_string(),
            AttrValue::Char(c) => c.to_string(),
            AttrValue::Str(s) => s.clone(),
            AttrValue::StrArr(v) | AttrValue::AclList(v) => v.join(","),
            AttrValue::Duration(s) => encode_duration(*s),
            AttrValue::Size(b) => encode_size(*b),
            AttrValue::Float(f) => f.to_string(),
            AttrValue::ResList(list) => list
                .iter()
                .map(|(k, v)| format!("{k}={}", v.encode()))
                .collect::<Vec<_>>()
                .join(","),
            AttrValue::Freq(hz) => encode_freq(*hz),
            AttrValue::EntityLimit(list) => list
                .iter()
                .map(|(e, l)| format!("[{e}={l}]"))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// The compare hook. Values of different types never compare.
    pub fn compare(&self, other: &AttrValue) -> Option<Ordering> {
        match (self, other) {
            (AttrValue::Long(a), AttrValue::Long(b)) => Some(a.cmp(b)),
            (AttrValue::Bool(a), AttrValue::Bool(b)) => Some(a.cmp(b)),
            (AttrValue::Char(a), AttrValue::Char(b)) => Some(a.cmp(b)),
            (AttrValue::Str(a), AttrValue::Str(b)) => Some(a.cmp(b)),
            (AttrValue::Duration(a), AttrValue::Duration(b)) => Some(a.cmp(b)),
            (AttrValue::Size(a), AttrValue::Size(b)) => Some(a.cmp(b)),
            (AttrValue::Freq(a), AttrValue::Freq(b)) => Some(a.cmp(b)),
            (AttrValue::Float(a), AttrValue::Float(b)) => a.partial_cmp(b),
            (AttrValue::StrArr(a), AttrValue::StrArr(b)) => {
                if a == b {
                    Some(Ordering::Equal)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// The set hook: apply `incoming` to `self` under `op`. Ordering
    /// operators do not mutate; they return the match result.
    pub fn apply(&mut self, incoming: &AttrValue, op: SetOp) -> Result<Option<bool>> {
        use SetOp::*;
        match op {
            Set => {
                *self = incoming.clone();
                Ok(None)
            }
            Incr => {
                match (&mut *self, incoming) {
                    (AttrValue::Long(a), AttrValue::Long(b)) => *a += b,
                    (AttrValue::Duration(a), AttrValue::Duration(b)) => *a += b,
                    (AttrValue::Size(a), AttrValue::Size(b)) => *a = a.saturating_add(*b),
                    (AttrValue::Float(a), AttrValue::Float(b)) => *a += b,
                    // string lists: set union, preserving existing order
                    (AttrValue::StrArr(a), AttrValue::StrArr(b))
                    | (AttrValue::AclList(a), AttrValue::AclList(b)) => {
                        for item in b {
                            if !a.contains(item) {
                                a.push(item.clone());
                            }
                        }
                    }
                    (AttrValue::ResList(a), AttrValue::ResList(b)) => {
                        for (k, v) in b {
                            match a.iter_mut().find(|(name, _)| name == k) {
                                Some((_, existing)) => {
                                    existing.apply(v, Incr)?;
                                }
                                None => a.push((k.clone(), v.clone())),
                            }
                        }
                    }
                    _ => return Err(BatchError::BadAttribute("incompatible INCR".into())),
                }
                Ok(None)
            }
            Decr => {
                match (&mut *self, incoming) {
                    (AttrValue::Long(a), AttrValue::Long(b)) => *a -= b,
                    (AttrValue::Duration(a), AttrValue::Duration(b)) => *a -= b,
                    (AttrValue::Size(a), AttrValue::Size(b)) => *a = a.saturating_sub(*b),
                    (AttrValue::Float(a), AttrValue::Float(b)) => *a -= b,
                    // string lists: set difference
                    (AttrValue::StrArr(a), AttrValue::StrArr(b))
                    | (AttrValue::AclList(a), AttrValue::AclList(b)) => {
                        a.retain(|item| !b.contains(item));
                    }
                    _ => return Err(BatchError::BadAttribute("incompatible DECR".into())),
                }
                Ok(None)
            }
            Merge => {
                match (&mut *self, incoming) {
                    // resource lists: key-wise replacement
                    (AttrValue::ResList(a), AttrValue::ResList(b)) => {
                        for (k, v) in b {
                            match a.iter_mut().find(|(name, _)| name == k) {
                                Some((_, existing)) => *existing = v.clone(),
                                None => a.push((k.clone(), v.clone())),
                            }
                        }
                    }
                    (a, b) => *a = b.clone(),
                }
                Ok(None)
            }
            Eq | Ne | Gt | Ge | Lt | Le => {
                let ord = self
                    .compare(incoming)
                    .ok_or_else(|| BatchError::BadAttribute("incomparable values".into()))?;
                let matched = match op {
                    Eq => ord == Ordering::Equal,
                    Ne => ord != Ordering::Equal,
                    Gt => ord == Ordering::Greater,
                    Ge => ord != Ordering::Less,
                    Lt => ord == Ordering::Less,
                    Le => ord != Ordering::Greater,
                    _ => unreachable!(),
                };
                Ok(Some(matched))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_decode_uses_binary_units() {
        assert_eq!(
            AttrType::Size.decode("1gb").unwrap(),
            AttrValue::Size(1 << 30)
        );
        assert_eq!(
            AttrType::Size.decode("2kb").unwrap(),
            AttrValue::Size(2048)
        );
        assert_eq!(AttrType::Size.decode("512").unwrap(), AttrValue::Size(512));
    }

    #[test]
    fn size_encode_is_canonical() {
        assert_eq!(AttrValue::Size(1 << 30).encode(), "1gb");
        assert_eq!(AttrValue::Size(2048).encode(), "2kb");
        assert_eq!(AttrValue::Size(1500).encode(), "1500b");
    }

    #[test]
    fn size_decode_of_encode_round_trips() {
        for raw in ["1gb", "100mb", "3kb", "7b"] {
            let v = AttrType::Size.decode(raw).unwrap();
            assert_eq!(AttrType::Size.decode(&v.encode()).unwrap(), v);
        }
    }

    #[test]
    fn duration_accepts_clock_and_seconds() {
        assert_eq!(
            AttrType::Duration.decode("01:30:00").unwrap(),
            AttrValue::Duration(5400)
        );
        assert_eq!(
            AttrType::Duration.decode("90").unwrap(),
            AttrValue::Duration(90)
        );
        assert_eq!(AttrValue::Duration(5400).encode(), "01:30:00");
    }

    #[test]
    fn incr_on_string_list_is_set_union() {
        let mut v = AttrValue::StrArr(vec!["a".into(), "b".into()]);
        v.apply(&AttrValue::StrArr(vec!["b".into(), "c".into()]), SetOp::Incr)
            .unwrap();
        assert_eq!(v, AttrValue::StrArr(vec!["a".into(), "b".into(), "c".into()]));
    }

    #[test]
    fn decr_on_string_list_is_set_difference() {
        let mut v = AttrValue::StrArr(vec!["a".into(), "b".into(), "c".into()]);
        v.apply(&AttrValue::StrArr(vec!["b".into()]), SetOp::Decr)
            .unwrap();
        assert_eq!(v, AttrValue::StrArr(vec!["a".into(), "c".into()]));
    }

    #[test]
    fn merge_on_resource_list_replaces_keywise() {
        let mut v = AttrValue::ResList(vec![
            ("ncpus".into(), AttrValue::Long(1)),
            ("mem".into(), AttrValue::Size(1 << 30)),
        ]);
        v.apply(
            &AttrValue::ResList(vec![("ncpus".into(), AttrValue::Long(4))]),
            SetOp::Merge,
        )
        .unwrap();
        assert_eq!(
            v,
            AttrValue::ResList(vec![
                ("ncpus".into(), AttrValue::Long(4)),
                ("mem".into(), AttrValue::Size(1 << 30)),
            ])
        );
    }

    #[test]
    fn ordering_ops_return_bool_without_mutating() {
        let mut v = AttrValue::Long(5);
        assert_eq!(v.apply(&AttrValue::Long(3), SetOp::Gt).unwrap(), Some(true));
        assert_eq!(v.apply(&AttrValue::Long(5), SetOp::Eq).unwrap(), Some(true));
        assert_eq!(v.apply(&AttrValue::Long(9), SetOp::Ge).unwrap(), Some(false));
        assert_eq!(v, AttrValue::Long(5));
    }

    #[test]
    fn scalar_incr_arithmetic_combines() {
        let mut v = AttrValue::Long(10);
        v.apply(&AttrValue::Long(5), SetOp::Incr).unwrap();
        assert_eq!(v, AttrValue::Long(15));
        v.apply(&AttrValue::Long(3), SetOp::Decr).unwrap();
        assert_eq!(v, AttrValue::Long(12));
    }

    #[test]
    fn known_resources_have_typed_decode() {
        assert_eq!(resource_type("ncpus"), AttrType::Long);
        assert_eq!(resource_type("mem"), AttrType::Size);
        assert_eq!(resource_type("walltime"), AttrType::Duration);
        assert_eq!(resource_type("somevendor"), AttrType::Str);
    }
}
