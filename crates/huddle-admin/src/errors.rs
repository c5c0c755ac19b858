//! Administration error types.

use huddle_core::{BatchId, CapacityError, GroupResultId, ParticipantId};
use huddle_store::StoreError;
use thiserror::Error;

/// Errors returned by [`GroupAdministration`](crate::GroupAdministration).
///
/// All of these are raised before anything is written, except
/// [`Store`](AdminError::Store), which rolls the transaction back.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A batch limit would be exceeded, or the limits are inconsistent.
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// The batch does not admit this participant's worker type.
    #[error("worker type {worker_type} of participant {participant_id} is not allowed in batch {batch_id}")]
    WorkerTypeNotAllowed {
        /// The participant.
        participant_id: ParticipantId,
        /// Its worker type.
        worker_type: String,
        /// The batch.
        batch_id: BatchId,
    },

    /// The participant's study is not a group study.
    #[error("participant {0} is not in a group study")]
    NotGroupStudy(ParticipantId),

    /// The participant is not active in any group.
    #[error("participant {0} is not in a group")]
    NotInGroup(ParticipantId),

    /// The participant is already active in a group of another batch.
    #[error("participant {participant_id} is already in group {group_id}")]
    AlreadyInGroup {
        /// The participant.
        participant_id: ParticipantId,
        /// Group it is active in.
        group_id: GroupResultId,
    },

    /// The participant's group belongs to a different batch than given.
    #[error("group {group_id} does not belong to batch {batch_id}")]
    BatchMismatch {
        /// The group.
        group_id: GroupResultId,
        /// The batch passed in.
        batch_id: BatchId,
    },
}

/// Result type for administration operations.
pub type Result<T> = std::result::Result<T, AdminError>;
