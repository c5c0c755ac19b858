//! Error types shared across the workspace.

use thiserror::Error;

use crate::group::GroupState;
use crate::ids::{GroupResultId, ParticipantId};

/// A membership change that would break a group's capacity rules.
///
/// Always raised before any state is mutated, so callers can recover.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CapacityError {
    /// The group no longer accepts members.
    #[error("group {group_id} is {state}, not open")]
    GroupNotOpen {
        /// The group.
        group_id: GroupResultId,
        /// Its current state.
        state: GroupState,
    },
    /// The active-member cap is reached.
    #[error("group {group_id} already has the maximum of {limit} active members")]
    ActiveLimitReached {
        /// The group.
        group_id: GroupResultId,
        /// The batch's `maxActiveMembers`.
        limit: u32,
    },
    /// The total-member cap is reached.
    #[error("group {group_id} already has the maximum of {limit} total members")]
    TotalLimitReached {
        /// The group.
        group_id: GroupResultId,
        /// The batch's `maxTotalMembers`.
        limit: u32,
    },
    /// The participant is already active in this group.
    #[error("participant {participant_id} is already a member of group {group_id}")]
    AlreadyMember {
        /// The group.
        group_id: GroupResultId,
        /// The participant.
        participant_id: ParticipantId,
    },
    /// The batch's limits contradict each other.
    #[error("invalid batch limits: {0}")]
    InvalidLimits(String),
}

/// An inbound frame that could not be understood.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("malformed group message: {0}")]
pub struct MalformedMessage(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_error_display() {
        let err = CapacityError::ActiveLimitReached {
            group_id: GroupResultId::from_raw("grp_1"),
            limit: 3,
        };
        assert_eq!(
            err.to_string(),
            "group grp_1 already has the maximum of 3 active members"
        );
    }

    #[test]
    fn not_open_display_names_state() {
        let err = CapacityError::GroupNotOpen {
            group_id: GroupResultId::from_raw("grp_1"),
            state: GroupState::Finished,
        };
        assert!(err.to_string().contains("FINISHED"));
    }

    #[test]
    fn malformed_display() {
        let err = MalformedMessage("not an object".into());
        assert_eq!(err.to_string(), "malformed group message: not an object");
    }
}
