//! Persisted group membership model and its capacity rules.
//!
//! A [`GroupResult`] is the durable record of one group: who is in it now
//! (`active_members`), who has left (`history_members`), the shared session
//! blob, and a lifecycle [`GroupState`]. Capacity comes from the owning
//! [`Batch`]; every mutation that could exceed it goes through
//! [`GroupResult::add_active_member`], which checks before touching state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CapacityError;
use crate::ids::{BatchId, GroupResultId, ParticipantId};

/// Lifecycle of a group.
///
/// `Open → Fixed`, `Open → Finished` and `Fixed → Finished` are the only
/// transitions; `Finished` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupState {
    /// Accepting new members.
    Open,
    /// Membership frozen by the participants; live channels stay up.
    Fixed,
    /// Closed for good.
    Finished,
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Fixed => write!(f, "FIXED"),
            Self::Finished => write!(f, "FINISHED"),
        }
    }
}

impl std::str::FromStr for GroupState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(Self::Open),
            "FIXED" => Ok(Self::Fixed),
            "FINISHED" => Ok(Self::Finished),
            other => Err(format!("unknown group state: {other}")),
        }
    }
}

/// Capacity configuration for all groups of one batch.
///
/// `None` limits are unlimited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// Batch identity.
    pub id: BatchId,
    /// Members a group needs before it is considered complete.
    pub min_active_members: u32,
    /// Upper bound on simultaneously active members.
    pub max_active_members: Option<u32>,
    /// Upper bound on active plus former members.
    pub max_total_members: Option<u32>,
    /// Worker types admitted to this batch. Empty admits all.
    #[serde(default)]
    pub allowed_worker_types: BTreeSet<String>,
}

impl Batch {
    /// A batch with no limits and no worker-type restriction.
    pub fn unlimited(id: BatchId) -> Self {
        Self {
            id,
            min_active_members: 2,
            max_active_members: None,
            max_total_members: None,
            allowed_worker_types: BTreeSet::new(),
        }
    }

    /// Check that the limits are mutually consistent.
    pub fn validate(&self) -> Result<(), CapacityError> {
        if let Some(max) = self.max_active_members {
            if self.min_active_members > max {
                return Err(CapacityError::InvalidLimits(format!(
                    "minActiveMembers {} exceeds maxActiveMembers {max}",
                    self.min_active_members
                )));
            }
        }
        if let (Some(active), Some(total)) = (self.max_active_members, self.max_total_members) {
            if active > total {
                return Err(CapacityError::InvalidLimits(format!(
                    "maxActiveMembers {active} exceeds maxTotalMembers {total}"
                )));
            }
        }
        Ok(())
    }

    /// Whether a participant of this worker type may join.
    pub fn allows_worker_type(&self, worker_type: &str) -> bool {
        self.allowed_worker_types.is_empty() || self.allowed_worker_types.contains(worker_type)
    }
}

/// The slice of a participant's study run this core needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Participant identity.
    pub id: ParticipantId,
    /// Worker type the participant runs as (e.g. `"Jatos"`, `"MTurk"`).
    pub worker_type: String,
    /// Whether the participant's study is a group study at all.
    pub group_study: bool,
}

impl Participant {
    /// A group-study participant.
    pub fn new(id: ParticipantId, worker_type: impl Into<String>) -> Self {
        Self {
            id,
            worker_type: worker_type.into(),
            group_study: true,
        }
    }
}

/// Persisted record of one group's membership and shared session state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResult {
    /// Group identity.
    pub id: GroupResultId,
    /// Batch whose capacity rules apply.
    pub batch_id: BatchId,
    /// Lifecycle state.
    pub state: GroupState,
    /// Current members, in join order.
    pub active_members: Vec<ParticipantId>,
    /// Former members, in leave order.
    pub history_members: Vec<ParticipantId>,
    /// Shared session blob. `None` once finished.
    pub session_data: Option<Value>,
    /// Incremented on every accepted session patch.
    pub session_version: u64,
    /// When the group was created.
    pub start_date: DateTime<Utc>,
    /// When the group finished.
    pub end_date: Option<DateTime<Utc>>,
}

impl GroupResult {
    /// A fresh open group with no members.
    pub fn new(batch_id: BatchId) -> Self {
        Self {
            id: GroupResultId::new(),
            batch_id,
            state: GroupState::Open,
            active_members: Vec::new(),
            history_members: Vec::new(),
            session_data: Some(Value::Object(serde_json::Map::new())),
            session_version: 1,
            start_date: Utc::now(),
            end_date: None,
        }
    }

    /// Number of active members.
    pub fn active_count(&self) -> usize {
        self.active_members.len()
    }

    /// Number of active plus former members.
    pub fn total_count(&self) -> usize {
        self.active_members.len() + self.history_members.len()
    }

    /// Whether `participant` is currently active in this group.
    pub fn is_active_member(&self, participant: &ParticipantId) -> bool {
        self.active_members.contains(participant)
    }

    /// Whether `participant` has left this group.
    pub fn is_history_member(&self, participant: &ParticipantId) -> bool {
        self.history_members.contains(participant)
    }

    /// Whether one more participant could be admitted under `batch`.
    pub fn has_room(&self, batch: &Batch) -> bool {
        self.state == GroupState::Open
            && !exceeds(batch.max_active_members, self.active_count() + 1)
            && !exceeds(batch.max_total_members, self.total_count() + 1)
    }

    /// Add `participant` to the active list.
    ///
    /// Rejected without mutation if the group is not open, the participant
    /// is already active, or a batch limit would be exceeded. A former
    /// member rejoining is moved out of the history list, so its total
    /// count does not grow.
    pub fn add_active_member(
        &mut self,
        participant: &ParticipantId,
        batch: &Batch,
    ) -> Result<(), CapacityError> {
        if self.state != GroupState::Open {
            return Err(CapacityError::GroupNotOpen {
                group_id: self.id.clone(),
                state: self.state,
            });
        }
        if self.is_active_member(participant) {
            return Err(CapacityError::AlreadyMember {
                group_id: self.id.clone(),
                participant_id: participant.clone(),
            });
        }
        if let Some(limit) = batch.max_active_members {
            if exceeds(Some(limit), self.active_count() + 1) {
                return Err(CapacityError::ActiveLimitReached {
                    group_id: self.id.clone(),
                    limit,
                });
            }
        }
        let rejoining = self.is_history_member(participant);
        let total_after = if rejoining {
            self.total_count()
        } else {
            self.total_count() + 1
        };
        if let Some(limit) = batch.max_total_members {
            if exceeds(Some(limit), total_after) {
                return Err(CapacityError::TotalLimitReached {
                    group_id: self.id.clone(),
                    limit,
                });
            }
        }
        if rejoining {
            self.history_members.retain(|p| p != participant);
        }
        self.active_members.push(participant.clone());
        Ok(())
    }

    /// Drop `participant` from the active list without recording it in the
    /// history. Returns `false` if it was not active.
    pub fn remove_active_member(&mut self, participant: &ParticipantId) -> bool {
        let before = self.active_members.len();
        self.active_members.retain(|p| p != participant);
        self.active_members.len() != before
    }

    /// Move `participant` from the active list to the history list.
    /// Returns `false` if it was not active.
    pub fn move_to_history(&mut self, participant: &ParticipantId) -> bool {
        if !self.remove_active_member(participant) {
            return false;
        }
        if !self.is_history_member(participant) {
            self.history_members.push(participant.clone());
        }
        true
    }

    /// Whether the history has reached the batch's total-member cap.
    pub fn history_exhausted(&self, batch: &Batch) -> bool {
        batch
            .max_total_members
            .is_some_and(|limit| self.history_members.len() == limit as usize)
    }

    /// Freeze membership. Only an open group can be fixed.
    pub fn fix(&mut self) -> bool {
        if self.state == GroupState::Open {
            self.state = GroupState::Fixed;
            true
        } else {
            false
        }
    }

    /// Finish the group: any remaining active members become history, the
    /// session blob is dropped and the end date is stamped. Idempotent.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        if self.state == GroupState::Finished {
            return;
        }
        let remaining = std::mem::take(&mut self.active_members);
        for participant in remaining {
            if !self.is_history_member(&participant) {
                self.history_members.push(participant);
            }
        }
        self.state = GroupState::Finished;
        self.session_data = None;
        self.end_date = Some(now);
    }
}

fn exceeds(limit: Option<u32>, count: usize) -> bool {
    limit.is_some_and(|limit| count > limit as usize)
}
