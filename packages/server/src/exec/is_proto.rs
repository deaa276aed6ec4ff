//! Inter-server (IS) and inter-mom (IM) protocol identifiers.
//!
//! Both ride the mesh transport. IM frames never reach this server
//! directly (the primary MoM speaks IM to its sisters); the server
//! speaks IS with every MoM.

use crate::common::{BatchError, Result};

pub const IM_PROTOCOL: u64 = 3;
pub const IM_PROTOCOL_VER: u64 = 6;
pub const IS_PROTOCOL: u64 = 4;
pub const IS_PROTOCOL_VER: u64 = 4;

/// IS message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[rustfmt::skip]
pub enum IsMsg {
    Null = 0, Cmd = 1, CmdReply = 2, ClusterAddrs = 3, Update = 4,
    Rescused = 5, Jobobit = 6, Obitreply = 7, Replyhello = 8,
    Shutdown = 9, Idle = 10, Registermom = 11, Update2 = 12,
    DiscardJob = 13, DiscardDone = 14, UpdateFromHook = 15,
    RescusedFromHook = 16, HookJobAction = 17, HookActionAck = 18,
    HookSchedulerRestartCycle = 19, HookChecksums = 20,
    UpdateFromHook2 = 21, Hellosvr = 22,
}

impl IsMsg {
    pub fn to_wire(self) -> u64 {
        self as u64
    }

    pub fn from_wire(v: u64) -> Result<Self> {
        use IsMsg::*;
        const TABLE: &[IsMsg] = &[
            Null, Cmd, CmdReply, ClusterAddrs, Update, Rescused, Jobobit, Obitreply,
            Replyhello, Shutdown, Idle, Registermom, Update2, DiscardJob, DiscardDone,
            UpdateFromHook, RescusedFromHook, HookJobAction, HookActionAck,
            HookSchedulerRestartCycle, HookChecksums, UpdateFromHook2, Hellosvr,
        ];
        TABLE
            .get(v as usize)
            .copied()
            .ok_or(BatchError::BadRequestType(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_codes_round_trip() {
        for v in 0..=22u64 {
            assert_eq!(IsMsg::from_wire(v).unwrap().to_wire(), v);
        }
        assert!(IsMsg::from_wire(23).is_err());
    }

    #[test]
    fn protocol_versions_are_pinned() {
        assert_eq!(IM_PROTOCOL_VER, 6);
        assert_eq!(IS_PROTOCOL_VER, 4);
    }
}
