//! Flat wire form of attribute lists.
//!
//! On the wire an attribute list is a count followed by entries of
//! `(name, resource, value, flags, op)`. The resource field is the
//! empty string when absent.

use bytes::BytesMut;
use serde::Serialize;
use tokio::io::AsyncRead;
use wire::codec::{self, DisError};
use wire::{ChanError, DisChan, DisCursor};

use super::value::SetOp;
use crate::common::{BatchError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireAttr {
    pub name: String,
    pub resource: Option<String>,
    pub value: String,
    pub flags: u32,
    pub op: SetOp,
}

impl WireAttr {
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            resource: None,
            value: value.into(),
            flags: 0,
            op: SetOp::Set,
        }
    }

    pub fn with_resource(name: &str, resource: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            resource: Some(resource.to_string()),
            value: value.into(),
            flags: 0,
            op: SetOp::Set,
        }
    }
}

pub fn put_wireattrs(buf: &mut BytesMut, attrs: &[WireAttr]) {
    codec::put_uint(buf, attrs.len() as u64);
    for a in attrs {
        codec::put_string(buf, &a.name);
        codec::put_string(buf, a.resource.as_deref().unwrap_or(""));
        codec::put_string(buf, &a.value);
        codec::put_uint(buf, u64::from(a.flags));
        codec::put_uint(buf, a.op.to_wire());
    }
}

pub fn take_wireattrs(cur: &mut DisCursor<'_>) -> Result<Vec<WireAttr>> {
    let count = cur.uint().map_err(BatchError::from)?;
    let mut out = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let name = cur.string().map_err(BatchError::from)?;
        let resource = cur.string().map_err(BatchError::from)?;
        let value = cur.string().map_err(BatchError::from)?;
        let flags = cur.uint().map_err(BatchError::from)?;
        let op = SetOp::from_wire(cur.uint().map_err(BatchError::from)?)?;
        out.push(WireAttr {
            name,
            resource: if resource.is_empty() {
                None
            } else {
                Some(resource)
            },
            value,
            flags: u32::try_from(flags).map_err(|_| BatchError::from(DisError::Overflow))?,
            op,
        });
    }
    Ok(out)
}

pub async fn read_wireattrs<S: AsyncRead + Unpin>(
    chan: &mut DisChan<S>,
) -> std::result::Result<Vec<WireAttr>, ChanError> {
    let count = chan.read_uint().await?;
    let mut out = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let name = chan.read_string().await?;
        let resource = chan.read_string().await?;
        let value = chan.read_string().await?;
        let flags = chan.read_uint().await? as u32;
        let op =
            SetOp::from_wire(chan.read_uint().await?).map_err(|_| ChanError::Dis(DisError::Protocol))?;
        out.push(WireAttr {
            name,
            resource: if resource.is_empty() {
                None
            } else {
                Some(resource)
            },
            value,
            flags,
            op,
        });
    }
    Ok(out)
}

pub fn write_wireattrs<S>(chan: &mut DisChan<S>, attrs: &[WireAttr]) {
    chan.write_uint(attrs.len() as u64);
    for a in attrs {
        chan.write_string(&a.name);
        chan.write_string(a.resource.as_deref().unwrap_or(""));
        chan.write_string(&a.value);
        chan.write_uint(u64::from(a.flags));
        chan.write_uint(a.op.to_wire());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_list_round_trips() {
        let attrs = vec![
            WireAttr::new("Job_Name", "j1"),
            WireAttr::with_resource("Resource_List", "ncpus", "1"),
            WireAttr {
                name: "Hold_Types".into(),
                resource: None,
                value: "n".into(),
                flags: 0,
                op: SetOp::Incr,
            },
        ];
        let mut buf = BytesMut::new();
        put_wireattrs(&mut buf, &attrs);
        let mut cur = DisCursor::new(&buf);
        let got = take_wireattrs(&mut cur).unwrap();
        assert_eq!(got, attrs);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn empty_resource_decodes_as_none() {
        let mut buf = BytesMut::new();
        put_wireattrs(&mut buf, &[WireAttr::new("queue", "workq")]);
        let got = take_wireattrs(&mut DisCursor::new(&buf)).unwrap();
        assert_eq!(got[0].resource, None);
    }
}
