//! Dispatch error types.
//!
//! Routing problems (unknown recipient, malformed frame) are answered with
//! ERROR envelopes and never surface here. These errors only report that a
//! dispatcher's mailbox is gone.

use huddle_core::GroupResultId;
use thiserror::Error;

/// Errors returned by [`GroupDispatcher`](crate::GroupDispatcher) handles.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher task has exited and its mailbox is closed.
    #[error("dispatcher for group {group_id} has stopped")]
    Stopped {
        /// Group the dispatcher served.
        group_id: GroupResultId,
    },
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
