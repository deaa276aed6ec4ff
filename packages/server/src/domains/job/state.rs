//! Job states and substates.

use crate::common::{BatchError, Result};

/// Top-level job state. The letter is the one-character form shown by
/// status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Transit,
    Queued,
    Held,
    Waiting,
    Running,
    Exiting,
    Expired,
    Begun,
    Moved,
    Finished,
}

impl JobState {
    pub fn letter(self) -> char {
        match self {
            JobState::Transit => 'T',
            JobState::Queued => 'Q',
            JobState::Held => 'H',
            JobState::Waiting => 'W',
            JobState::Running => 'R',
            JobState::Exiting => 'E',
            JobState::Expired => 'X',
            JobState::Begun => 'B',
            JobState::Moved => 'M',
            JobState::Finished => 'F',
        }
    }

    pub fn from_letter(c: char) -> Result<Self> {
        Ok(match c {
            'T' => JobState::Transit,
            'Q' => JobState::Queued,
            'H' => JobState::Held,
            'W' => JobState::Waiting,
            'R' => JobState::Running,
            'E' => JobState::Exiting,
            'X' => JobState::Expired,
            'B' => JobState::Begun,
            'M' => JobState::Moved,
            'F' => JobState::Finished,
            other => return Err(BatchError::BadAttribute(format!("job state {other}"))),
        })
    }

    /// Persisted numeric form; order is part of the stored format.
    pub fn to_db(self) -> i16 {
        match self {
            JobState::Transit => 0,
            JobState::Queued => 1,
            JobState::Held => 2,
            JobState::Waiting => 3,
            JobState::Running => 4,
            JobState::Exiting => 5,
            JobState::Expired => 6,
            JobState::Begun => 7,
            JobState::Moved => 8,
            JobState::Finished => 9,
        }
    }

    pub fn from_db(v: i16) -> Result<Self> {
        Ok(match v {
            0 => JobState::Transit,
            1 => JobState::Queued,
            2 => JobState::Held,
            3 => JobState::Waiting,
            4 => JobState::Running,
            5 => JobState::Exiting,
            6 => JobState::Expired,
            7 => JobState::Begun,
            8 => JobState::Moved,
            9 => JobState::Finished,
            other => return Err(BatchError::Invariant(format!("job state {other}"))),
        })
    }
}

/// Substates refine states; the numeric values are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSubstate {
    TransIn = 0,
    TransiCm = 1,
    Queued = 10,
    Held = 20,
    Waiting = 30,
    Prerun = 41,
    Running = 42,
    Suspended = 43,
    SchedSuspended = 45,
    Exiting = 50,
    StageOut = 51,
    Exited = 53,
    Abort = 54,
    Obit = 58,
    Rerun = 60,
    Begun = 70,
    Moved = 80,
    Expired = 91,
    Finished = 92,
}

impl JobSubstate {
    pub fn to_db(self) -> i16 {
        self as i16
    }

    pub fn from_db(v: i16) -> Result<Self> {
        use JobSubstate::*;
        Ok(match v {
            0 => TransIn,
            1 => TransiCm,
            10 => Queued,
            20 => Held,
            30 => Waiting,
            41 => Prerun,
            42 => Running,
            43 => Suspended,
            45 => SchedSuspended,
            50 => Exiting,
            51 => StageOut,
            53 => Exited,
            54 => Abort,
            58 => Obit,
            60 => Rerun,
            70 => Begun,
            80 => Moved,
            91 => Expired,
            92 => Finished,
            other => return Err(BatchError::Invariant(format!("substate {other}"))),
        })
    }

    /// The state a substate belongs to.
    pub fn state(self) -> JobState {
        use JobSubstate::*;
        match self {
            TransIn | TransiCm => JobState::Transit,
            Queued => JobState::Queued,
            Held => JobState::Held,
            Waiting => JobState::Waiting,
            Prerun | Running | Suspended | SchedSuspended => JobState::Running,
            Exiting | StageOut | Exited | Abort | Obit | Rerun => JobState::Exiting,
            Begun => JobState::Begun,
            Moved => JobState::Moved,
            Expired => JobState::Expired,
            Finished => JobState::Finished,
        }
    }
}

/// Validate a (state, substate) pair.
pub fn check_pair(state: JobState, substate: JobSubstate) -> Result<()> {
    if substate.state() == state {
        Ok(())
    } else {
        Err(BatchError::Invariant(format!(
            "substate {substate:?} outside state {state:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_round_trip() {
        for s in [
            JobState::Transit,
            JobState::Queued,
            JobState::Held,
            JobState::Waiting,
            JobState::Running,
            JobState::Exiting,
            JobState::Expired,
            JobState::Begun,
            JobState::Moved,
            JobState::Finished,
        ] {
            assert_eq!(JobState::from_letter(s.letter()).unwrap(), s);
            assert_eq!(JobState::from_db(s.to_db()).unwrap(), s);
        }
    }

    #[test]
    fn each_substate_maps_into_its_state() {
        assert_eq!(JobSubstate::Suspended.state(), JobState::Running);
        assert_eq!(JobSubstate::Obit.state(), JobState::Exiting);
        assert!(check_pair(JobState::Running, JobSubstate::Suspended).is_ok());
        assert!(check_pair(JobState::Queued, JobSubstate::Suspended).is_err());
    }

    #[test]
    fn substate_db_round_trip() {
        for v in [0i16, 10, 20, 42, 43, 50, 58, 92] {
            let s = JobSubstate::from_db(v).unwrap();
            assert_eq!(s.to_db(), v);
        }
    }
}
