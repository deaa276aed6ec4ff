//! Batch replies.
//!
//! A reply carries the numeric code, an auxiliary code, and one of the
//! tagged bodies. Encoding mirrors request framing and carries the
//! same protocol version the request arrived with.

use bytes::Bytes;
use tokio::io::AsyncRead;
use wire::DisChan;

use super::BATCH_PROT_TYPE;
use crate::common::{BatchError, Result};
use crate::domains::attr::{read_wireattrs, write_wireattrs, WireAttr};

/// Union discriminators on the wire.
const CHOICE_NULL: u64 = 1;
const CHOICE_JOBID: u64 = 2;
const CHOICE_SELECT: u64 = 5;
const CHOICE_STATUS: u64 = 6;
const CHOICE_TEXT: u64 = 7;
const CHOICE_LOCATE: u64 = 8;
const CHOICE_RESCQUERY: u64 = 9;
const CHOICE_PREEMPT: u64 = 10;
const CHOICE_DELETE: u64 = 11;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StatusEntry {
    pub obj_type: u64,
    pub name: String,
    pub attrs: Vec<WireAttr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    Null,
    JobId(String),
    Select(Vec<String>),
    Status(Vec<StatusEntry>),
    Text {
        text: String,
        cred: Option<Vec<u8>>,
    },
    Locate(String),
    RescQuery {
        avail: Vec<i64>,
        alloc: Vec<i64>,
        resvd: Vec<i64>,
        down: Vec<i64>,
    },
    PreemptJobs(Vec<(String, char)>),
    /// Per-job delete status for DeleteJobList.
    DeleteList(Vec<(String, i64)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReply {
    pub code: i64,
    pub auxcode: i64,
    pub body: ReplyBody,
}

impl BatchReply {
    pub fn ok() -> Self {
        Self {
            code: 0,
            auxcode: 0,
            body: ReplyBody::Null,
        }
    }

    pub fn jobid(id: impl Into<String>) -> Self {
        Self {
            code: 0,
            auxcode: 0,
            body: ReplyBody::JobId(id.into()),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            code: 0,
            auxcode: 0,
            body: ReplyBody::Text {
                text: text.into(),
                cred: None,
            },
        }
    }

    /// Error reply: the code is the error's numeric form and the text
    /// is its single-line message.
    pub fn error(err: &BatchError) -> Self {
        Self {
            code: err.code(),
            auxcode: 0,
            body: ReplyBody::Text {
                text: err.to_string(),
                cred: None,
            },
        }
    }

    pub fn is_err(&self) -> bool {
        self.code != 0
    }
}

fn body_choice(body: &ReplyBody) -> u64 {
    match body {
        ReplyBody::Null => CHOICE_NULL,
        ReplyBody::JobId(_) => CHOICE_JOBID,
        ReplyBody::Select(_) => CHOICE_SELECT,
        ReplyBody::Status(_) => CHOICE_STATUS,
        ReplyBody::Text { .. } => CHOICE_TEXT,
        ReplyBody::Locate(_) => CHOICE_LOCATE,
        ReplyBody::RescQuery { .. } => CHOICE_RESCQUERY,
        ReplyBody::PreemptJobs(_) => CHOICE_PREEMPT,
        ReplyBody::DeleteList(_) => CHOICE_DELETE,
    }
}

fn write_i64_list<S>(chan: &mut DisChan<S>, list: &[i64]) {
    chan.write_uint(list.len() as u64);
    for v in list {
        chan.write_int(*v);
    }
}

async fn read_i64_list<S: AsyncRead + Unpin>(chan: &mut DisChan<S>) -> Result<Vec<i64>> {
    let count = chan.read_uint().await?;
    let mut out = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        out.push(chan.read_int().await?);
    }
    Ok(out)
}

/// Stage one reply into the channel's write buffer.
pub fn write_reply<S>(chan: &mut DisChan<S>, prot_ver: u64, reply: &BatchReply) {
    chan.write_uint(BATCH_PROT_TYPE);
    chan.write_uint(prot_ver);
    chan.write_int(reply.code);
    chan.write_int(reply.auxcode);
    chan.write_uint(body_choice(&reply.body));
    match &reply.body {
        ReplyBody::Null => {}
        ReplyBody::JobId(id) | ReplyBody::Locate(id) => chan.write_string(id),
        ReplyBody::Select(ids) => {
            chan.write_uint(ids.len() as u64);
            for id in ids {
                chan.write_string(id);
            }
        }
        ReplyBody::Status(entries) => {
            chan.write_uint(entries.len() as u64);
            for e in entries {
                chan.write_uint(e.obj_type);
                chan.write_string(&e.name);
                write_wireattrs(chan, &e.attrs);
            }
        }
        ReplyBody::Text { text, cred } => {
            chan.write_string(text);
            match cred {
                Some(cred) => {
                    chan.write_uint(1);
                    chan.write_bytes(cred);
                }
                None => chan.write_uint(0),
            }
        }
        ReplyBody::RescQuery {
            avail,
            alloc,
            resvd,
            down,
        } => {
            write_i64_list(chan, avail);
            write_i64_list(chan, alloc);
            write_i64_list(chan, resvd);
            write_i64_list(chan, down);
        }
        ReplyBody::PreemptJobs(entries) => {
            chan.write_uint(entries.len() as u64);
            for (jobid, method) in entries {
                chan.write_string(jobid);
                chan.write_string(&method.to_string());
            }
        }
        ReplyBody::DeleteList(entries) => {
            chan.write_uint(entries.len() as u64);
            for (jobid, code) in entries {
                chan.write_string(jobid);
                chan.write_int(*code);
            }
        }
    }
}

/// Read one reply off the channel. Returns the protocol version it
/// carried alongside the reply.
pub async fn read_reply<S: AsyncRead + Unpin>(
    chan: &mut DisChan<S>,
) -> Result<(u64, BatchReply)> {
    let prot_type = chan.read_uint().await?;
    if prot_type != BATCH_PROT_TYPE {
        return Err(BatchError::Protocol);
    }
    let prot_ver = chan.read_uint().await?;
    let code = chan.read_int().await?;
    let auxcode = chan.read_int().await?;
    let choice = chan.read_uint().await?;
    let body = match choice {
        CHOICE_NULL => ReplyBody::Null,
        CHOICE_JOBID => ReplyBody::JobId(chan.read_string().await?),
        CHOICE_LOCATE => ReplyBody::Locate(chan.read_string().await?),
        CHOICE_SELECT => {
            let count = chan.read_uint().await?;
            let mut ids = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                ids.push(chan.read_string().await?);
            }
            ReplyBody::Select(ids)
        }
        CHOICE_STATUS => {
            let count = chan.read_uint().await?;
            let mut entries = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                entries.push(StatusEntry {
                    obj_type: chan.read_uint().await?,
                    name: chan.read_string().await?,
                    attrs: read_wireattrs(chan).await?,
                });
            }
            ReplyBody::Status(entries)
        }
        CHOICE_TEXT => {
            let text = chan.read_string().await?;
            let cred = match chan.read_uint().await? {
                0 => None,
                _ => Some(chan.read_bytes().await?),
            };
            ReplyBody::Text { text, cred }
        }
        CHOICE_RESCQUERY => ReplyBody::RescQuery {
            avail: read_i64_list(chan).await?,
            alloc: read_i64_list(chan).await?,
            resvd: read_i64_list(chan).await?,
            down: read_i64_list(chan).await?,
        },
        CHOICE_PREEMPT => {
            let count = chan.read_uint().await?;
            let mut entries = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                let jobid = chan.read_string().await?;
                let method = chan.read_string().await?;
                entries.push((jobid, method.chars().next().unwrap_or('?')));
            }
            ReplyBody::PreemptJobs(entries)
        }
        CHOICE_DELETE => {
            let count = chan.read_uint().await?;
            let mut entries = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                let jobid = chan.read_string().await?;
                let code = chan.read_int().await?;
                entries.push((jobid, code));
            }
            ReplyBody::DeleteList(entries)
        }
        _ => return Err(BatchError::Protocol),
    };
    Ok((prot_ver, BatchReply {
        code,
        auxcode,
        body,
    }))
}

/// Encode a reply into a standalone payload (mesh transport).
pub fn encode_reply(prot_ver: u64, reply: &BatchReply) -> Bytes {
    let mut chan = DisChan::new(());
    write_reply(&mut chan, prot_ver, reply);
    chan.write_buffer().freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::BATCH_PROT_VER;

    async fn round_trip(reply: BatchReply) {
        let bytes = encode_reply(BATCH_PROT_VER, &reply);
        let mut chan = DisChan::new(&bytes[..]);
        let (ver, got) = read_reply(&mut chan).await.unwrap();
        assert_eq!(ver, BATCH_PROT_VER);
        assert_eq!(got, reply);
    }

    #[tokio::test]
    async fn null_and_jobid_round_trip() {
        round_trip(BatchReply::ok()).await;
        round_trip(BatchReply::jobid("1.host")).await;
    }

    #[tokio::test]
    async fn status_reply_round_trips() {
        round_trip(BatchReply {
            code: 0,
            auxcode: 0,
            body: ReplyBody::Status(vec![StatusEntry {
                obj_type: 1,
                name: "1.host".into(),
                attrs: vec![WireAttr::new("job_state", "F")],
            }]),
        })
        .await;
    }

    #[tokio::test]
    async fn error_reply_carries_code_and_text() {
        let reply = BatchReply::error(&BatchError::NotAuthenticated);
        assert_eq!(reply.code, 15012);
        round_trip(reply).await;
    }

    #[tokio::test]
    async fn delete_list_reply_round_trips() {
        round_trip(BatchReply {
            code: 0,
            auxcode: 0,
            body: ReplyBody::DeleteList(vec![("1.host".into(), 0), ("2.host".into(), 15004)]),
        })
        .await;
    }

    #[tokio::test]
    async fn preempt_reply_round_trips() {
        round_trip(BatchReply {
            code: 0,
            auxcode: 0,
            body: ReplyBody::PreemptJobs(vec![("2.host".into(), 'S')]),
        })
        .await;
    }

    #[tokio::test]
    async fn rescquery_reply_round_trips() {
        round_trip(BatchReply {
            code: 0,
            auxcode: 0,
            body: ReplyBody::RescQuery {
                avail: vec![16],
                alloc: vec![4],
                resvd: vec![2],
                down: vec![0],
            },
        })
        .await;
    }
}
