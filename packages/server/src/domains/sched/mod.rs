//! Schedulers.
//!
//! A scheduler is an external decision-maker registered over the wire.
//! The server raises commands in a coalescing mailbox; the scheduler
//! runs a cycle, issues RunJob requests (possibly deferred), and closes
//! the cycle with DefSchReply or by dropping its secondary channel.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::sync::Notify;

use crate::common::{BatchError, Result};
use crate::domains::attr::{AttrArray, AttrDef, AttrType, AttrValue};

/// Max explicit preempt-ordering rows; one default row follows.
pub const PREEMPT_ORDER_MAX: usize = 20;

pub const SCHED_CYCLE_LEN_DEFAULT: i64 = 1200;

/// Command raised for a scheduler. Doubles as the wire value on the
/// scheduler command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedCmd {
    Null,
    New,
    Term,
    Time,
    JobNew,
    JobRun,
    JobResv,
    SchedFirst,
}

impl SchedCmd {
    pub fn to_wire(self) -> u64 {
        match self {
            SchedCmd::Null => 0,
            SchedCmd::New => 1,
            SchedCmd::Term => 2,
            SchedCmd::Time => 3,
            SchedCmd::JobNew => 4,
            SchedCmd::JobRun => 5,
            SchedCmd::JobResv => 6,
            SchedCmd::SchedFirst => 7,
        }
    }

    pub fn from_wire(v: u64) -> Result<Self> {
        Ok(match v {
            0 => SchedCmd::Null,
            1 => SchedCmd::New,
            2 => SchedCmd::Term,
            3 => SchedCmd::Time,
            4 => SchedCmd::JobNew,
            5 => SchedCmd::JobRun,
            6 => SchedCmd::JobResv,
            7 => SchedCmd::SchedFirst,
            other => return Err(BatchError::BadRequestType(other)),
        })
    }
}

/// Preemption methods, tried in row order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptMethod {
    Suspend,
    Checkpoint,
    Requeue,
    Delete,
}

impl PreemptMethod {
    pub fn letter(self) -> char {
        match self {
            PreemptMethod::Suspend => 'S',
            PreemptMethod::Checkpoint => 'C',
            PreemptMethod::Requeue => 'R',
            PreemptMethod::Delete => 'D',
        }
    }

    pub fn from_letter(c: char) -> Result<Self> {
        Ok(match c {
            'S' => PreemptMethod::Suspend,
            'C' => PreemptMethod::Checkpoint,
            'R' => PreemptMethod::Requeue,
            'D' => PreemptMethod::Delete,
            other => return Err(BatchError::BadAttribute(format!("preempt method {other}"))),
        })
    }
}

/// One row of the preempt-ordering table: the method order that applies
/// while the preemptee's walltime usage percentage lies in
/// `[low, high]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreemptOrdering {
    pub high: u32,
    pub low: u32,
    pub order: Vec<PreemptMethod>,
}

impl Default for PreemptOrdering {
    fn default() -> Self {
        Self {
            high: 100,
            low: 0,
            order: vec![
                PreemptMethod::Suspend,
                PreemptMethod::Checkpoint,
                PreemptMethod::Requeue,
            ],
        }
    }
}

/// Parse the textual preempt_order form: letter groups separated by
/// usage thresholds, e.g. `"SCR 80 SC 50 S"`. The first group covers
/// 100 down to the first threshold, the last group runs to zero.
pub fn parse_preempt_order(text: &str) -> Result<Vec<PreemptOrdering>> {
    let mut rows: Vec<PreemptOrdering> = Vec::new();
    let mut high: u32 = 100;
    let mut tokens = text.split_whitespace().peekable();
    while let Some(tok) = tokens.next() {
        let order = tok
            .chars()
            .map(PreemptMethod::from_letter)
            .collect::<Result<Vec<_>>>()?;
        if order.is_empty() {
            return Err(BatchError::BadAttribute(text.to_string()));
        }
        let low = match tokens.next() {
            Some(num) => num
                .parse::<u32>()
                .map_err(|_| BatchError::BadAttribute(text.to_string()))?,
            None => 0,
        };
        if low > high {
            return Err(BatchError::BadAttribute(text.to_string()));
        }
        rows.push(PreemptOrdering { high, low, order });
        if rows.len() > PREEMPT_ORDER_MAX {
            return Err(BatchError::BadAttribute("too many preempt rows".into()));
        }
        high = low.saturating_sub(1);
    }
    if rows.is_empty() {
        rows.push(PreemptOrdering::default());
    }
    Ok(rows)
}

/// Pick the ordering row for a usage percentage.
pub fn ordering_for(rows: &[PreemptOrdering], used_pct: u32) -> &PreemptOrdering {
    rows.iter()
        .find(|r| used_pct <= r.high && used_pct >= r.low)
        .unwrap_or(&rows[rows.len() - 1])
}

/// Coalescing command mailbox: posting a command already buffered at
/// the same priority is a no-op.
#[derive(Default)]
pub struct CmdMailbox {
    inner: Mutex<MailboxSlots>,
    notify: Notify,
}

#[derive(Default)]
struct MailboxSlots {
    cmd: Option<SchedCmd>,
    high: Option<SchedCmd>,
}

impl CmdMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, cmd: SchedCmd, high_prio: bool) {
        let mut slots = self.inner.lock().unwrap();
        let slot = if high_prio { &mut slots.high } else { &mut slots.cmd };
        if *slot == Some(cmd) {
            return;
        }
        *slot = Some(cmd);
        drop(slots);
        self.notify.notify_one();
    }

    /// Take the next command, high-priority slot first.
    pub fn take(&self) -> Option<SchedCmd> {
        let mut slots = self.inner.lock().unwrap();
        slots.high.take().or_else(|| slots.cmd.take())
    }

    pub async fn recv(&self) -> SchedCmd {
        loop {
            if let Some(cmd) = self.take() {
                return cmd;
            }
            self.notify.notified().await;
        }
    }
}

pub const SCHED_ATTR_DEFS: &[AttrDef] = &[
    AttrDef::new("sched_host", AttrType::Str, 0),
    AttrDef::new("partition", AttrType::Str, 0),
    AttrDef::new("sched_cycle_length", AttrType::Duration, 0),
    AttrDef::new("sched_priv", AttrType::Str, 0),
    AttrDef::new("sched_log", AttrType::Str, 0),
    AttrDef::new("scheduling", AttrType::Bool, 0),
    AttrDef::new("preempt_order", AttrType::Str, 0),
    AttrDef::new("preempt_queue_prio", AttrType::Long, 0),
    AttrDef::new("log_events", AttrType::Long, 0),
    AttrDef::new("state", AttrType::Str, 0),
];

/// Outcome handed to pending deferred replies at cycle close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleClose {
    Success,
    Interrupted,
}

/// A RunJob the server answered "deferred"; resolved when the MoM acks
/// or the cycle closes.
pub struct DeferredRun {
    pub jobid: String,
    pub resolve: oneshot::Sender<Result<()>>,
}

pub struct Scheduler {
    pub name: String,
    pub partition: Option<String>,
    pub primary_sock: Option<u64>,
    pub secondary_sock: Option<u64>,
    pub cycle_started: bool,
    pub next_cycle: Option<DateTime<Utc>>,
    pub preempt_order: Vec<PreemptOrdering>,
    pub attrs: AttrArray,
    pub deferred: Vec<DeferredRun>,
    /// Shared so the command feeder can wait without holding the
    /// scheduler lock.
    pub mailbox: Arc<CmdMailbox>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition: None,
            primary_sock: None,
            secondary_sock: None,
            cycle_started: false,
            next_cycle: Some(Utc::now()),
            preempt_order: vec![PreemptOrdering::default()],
            attrs: AttrArray::new(SCHED_ATTR_DEFS),
            deferred: Vec::new(),
            mailbox: Arc::new(CmdMailbox::new()),
        }
    }

    // typed accessors over the attribute array

    pub fn attr_str(&self, name: &str) -> Option<String> {
        match self.attrs.get_by_name(name)? {
            AttrValue::Str(s) => Some(s.clone()),
            v => Some(v.encode()),
        }
    }

    pub fn attr_long(&self, name: &str) -> Option<i64> {
        match self.attrs.get_by_name(name)? {
            AttrValue::Long(v) => Some(*v),
            AttrValue::Duration(v) => Some(*v),
            _ => None,
        }
    }

    pub fn set_attr_str(&mut self, name: &str, value: &str) -> Result<()> {
        let i = self
            .attrs
            .idx(name)
            .ok_or_else(|| BatchError::BadAttribute(name.to_string()))?;
        if name == "preempt_order" {
            self.preempt_order = parse_preempt_order(value)?;
        }
        self.attrs.set_value(i, AttrValue::Str(value.to_string()));
        Ok(())
    }

    /// Begin a cycle if none is running. Concurrent commands coalesce
    /// into the next cycle via the mailbox.
    pub fn start_cycle(&mut self) -> Result<()> {
        if self.cycle_started {
            return Err(BatchError::SchedBusy);
        }
        self.cycle_started = true;
        Ok(())
    }

    pub fn push_deferred(&mut self, run: DeferredRun) {
        self.deferred.push(run);
    }

    /// Resolve a single deferred RunJob by jobid (MoM acknowledged).
    pub fn resolve_deferred(&mut self, jobid: &str, result: Result<()>) -> bool {
        if let Some(pos) = self.deferred.iter().position(|d| d.jobid == jobid) {
            let d = self.deferred.swap_remove(pos);
            let _ = d.resolve.send(result);
            true
        } else {
            false
        }
    }

    /// Cycle end: any still-pending deferred replies are answered and
    /// the cycle flag drops.
    pub fn handle_deferred_cycle_close(&mut self, status: CycleClose) {
        for d in self.deferred.drain(..) {
            let result = match status {
                CycleClose::Success => Ok(()),
                CycleClose::Interrupted => Err(BatchError::Interrupted),
            };
            let _ = d.resolve.send(result);
        }
        self.cycle_started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preempt_order_text_parses_to_rows() {
        let rows = parse_preempt_order("SCR 80 SC 50 S").unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].high, 100);
        assert_eq!(rows[0].low, 80);
        assert_eq!(
            rows[0].order,
            vec![
                PreemptMethod::Suspend,
                PreemptMethod::Checkpoint,
                PreemptMethod::Requeue
            ]
        );
        assert_eq!(rows[2].high, 49);
        assert_eq!(rows[2].low, 0);
        assert_eq!(rows[2].order, vec![PreemptMethod::Suspend]);
    }

    #[test]
    fn ordering_row_is_picked_by_usage() {
        let rows = parse_preempt_order("SCR 80 SC 50 S").unwrap();
        assert_eq!(ordering_for(&rows, 90).low, 80);
        assert_eq!(ordering_for(&rows, 60).high, 79);
        assert_eq!(ordering_for(&rows, 10).order, vec![PreemptMethod::Suspend]);
    }

    #[test]
    fn empty_preempt_order_falls_back_to_default() {
        let rows = parse_preempt_order("").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], PreemptOrdering::default());
    }

    #[test]
    fn bad_preempt_letter_is_rejected() {
        assert!(parse_preempt_order("SXR 50 S").is_err());
    }

    #[test]
    fn mailbox_coalesces_same_command() {
        let mb = CmdMailbox::new();
        mb.post(SchedCmd::New, false);
        mb.post(SchedCmd::New, false);
        assert_eq!(mb.take(), Some(SchedCmd::New));
        assert_eq!(mb.take(), None);
    }

    #[test]
    fn mailbox_prefers_high_priority_slot() {
        let mb = CmdMailbox::new();
        mb.post(SchedCmd::New, false);
        mb.post(SchedCmd::Term, true);
        assert_eq!(mb.take(), Some(SchedCmd::Term));
        assert_eq!(mb.take(), Some(SchedCmd::New));
    }

    #[test]
    fn only_one_cycle_in_flight() {
        let mut s = Scheduler::new("default");
        s.start_cycle().unwrap();
        assert!(matches!(s.start_cycle(), Err(BatchError::SchedBusy)));
        s.handle_deferred_cycle_close(CycleClose::Success);
        s.start_cycle().unwrap();
    }

    #[tokio::test]
    async fn cycle_close_interrupts_pending_deferred() {
        let mut s = Scheduler::new("default");
        s.start_cycle().unwrap();
        let (tx, rx) = oneshot::channel();
        s.push_deferred(DeferredRun {
            jobid: "1.host".into(),
            resolve: tx,
        });
        s.handle_deferred_cycle_close(CycleClose::Interrupted);
        assert_eq!(rx.await.unwrap(), Err(BatchError::Interrupted));
        assert!(!s.cycle_started);
    }

    #[test]
    fn preempt_order_attr_reparses_table() {
        let mut s = Scheduler::new("default");
        s.set_attr_str("preempt_order", "SR 30 D").unwrap();
        assert_eq!(s.preempt_order.len(), 2);
        assert_eq!(s.preempt_order[1].order, vec![PreemptMethod::Delete]);
    }
}
