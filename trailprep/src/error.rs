use std::fmt;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::TrajectoryID;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure names the operation, and the trajectory when there is one, so a caller can
/// isolate bad input without re-running everything.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{op}: malformed input{}: {reason}", Culprit(.traj_id))]
    Schema {
        op: &'static str,
        traj_id: Option<TrajectoryID>,
        reason: String,
    },
    #[error("{op}: column {column:?} collides with a reserved column")]
    Conflict { op: &'static str, column: String },
    #[error("{op}: unknown trajectory {traj_id}")]
    NotFound {
        op: &'static str,
        traj_id: TrajectoryID,
    },
    #[error("{op}: composite key violated in trajectory {traj_id}: {reason}")]
    Integrity {
        op: &'static str,
        traj_id: TrajectoryID,
        reason: String,
    },
    #[error("{op}: trajectory {traj_id} has {found} points, but at least {needed} are needed")]
    InsufficientData {
        op: &'static str,
        traj_id: TrajectoryID,
        needed: usize,
        found: usize,
    },
    #[error("{op}: zero time delta in trajectory {traj_id} at {time}")]
    Division {
        op: &'static str,
        traj_id: TrajectoryID,
        time: NaiveDateTime,
    },
    #[error("{op}: trajectory {traj_id} exceeded its time budget of {limit:?}")]
    Timeout {
        op: &'static str,
        traj_id: TrajectoryID,
        limit: std::time::Duration,
    },
    #[error("{op}: cancelled")]
    Cancelled { op: &'static str },
    #[error("{op}: partition function panicked on trajectory {traj_id}: {reason}")]
    Panicked {
        op: &'static str,
        traj_id: TrajectoryID,
        reason: String,
    },
    #[error("{op}: invalid configuration: {reason}")]
    InvalidConfig { op: &'static str, reason: String },
    #[error("{op}: {reason}")]
    Io { op: &'static str, reason: String },
}

impl Error {
    pub fn schema(
        op: &'static str,
        traj_id: Option<&TrajectoryID>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Schema {
            op,
            traj_id: traj_id.cloned(),
            reason: reason.into(),
        }
    }

    pub fn integrity(op: &'static str, traj_id: &TrajectoryID, reason: impl Into<String>) -> Self {
        Error::Integrity {
            op,
            traj_id: traj_id.clone(),
            reason: reason.into(),
        }
    }

    /// The trajectory this failure is about, if any
    pub fn traj_id(&self) -> Option<&TrajectoryID> {
        match self {
            Error::Schema { traj_id, .. } => traj_id.as_ref(),
            Error::NotFound { traj_id, .. }
            | Error::Integrity { traj_id, .. }
            | Error::InsufficientData { traj_id, .. }
            | Error::Division { traj_id, .. }
            | Error::Timeout { traj_id, .. }
            | Error::Panicked { traj_id, .. } => Some(traj_id),
            Error::Conflict { .. }
            | Error::Cancelled { .. }
            | Error::InvalidConfig { .. }
            | Error::Io { .. } => None,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Error::Schema { op, .. }
            | Error::Conflict { op, .. }
            | Error::NotFound { op, .. }
            | Error::Integrity { op, .. }
            | Error::InsufficientData { op, .. }
            | Error::Division { op, .. }
            | Error::Timeout { op, .. }
            | Error::Cancelled { op }
            | Error::Panicked { op, .. }
            | Error::InvalidConfig { op, .. }
            | Error::Io { op, .. } => op,
        }
    }
}

struct Culprit<'a>(&'a Option<TrajectoryID>);

impl fmt::Display for Culprit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, " in trajectory {id}"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_operation_and_trajectory() {
        let err = Error::schema("load_csv", Some(&TrajectoryID::from("bus-7")), "bad latitude");
        assert_eq!(
            err.to_string(),
            "load_csv: malformed input in trajectory bus-7: bad latitude"
        );
        assert_eq!(err.op(), "load_csv");
        assert_eq!(err.traj_id(), Some(&TrajectoryID::from("bus-7")));

        let err = Error::schema("load_csv", None, "missing column lat");
        assert_eq!(err.to_string(), "load_csv: malformed input: missing column lat");
        assert!(err.traj_id().is_none());
    }
}
