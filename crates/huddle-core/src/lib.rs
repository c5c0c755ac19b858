//! # huddle-core
//!
//! Shared vocabulary for group membership and live group messaging.
//!
//! - Branded ids for groups, participants, batches and connections
//! - [`GroupResult`] with the batch capacity rules enforced on every change
//! - Group channel protocol: action tags, delivery targets, envelopes and
//!   inbound frame classification
//! - Merge-patch application for shared group session data

#![deny(unsafe_code)]

pub mod errors;
pub mod group;
pub mod ids;
pub mod protocol;
pub mod session;

pub use errors::{CapacityError, MalformedMessage};
pub use group::{Batch, GroupResult, GroupState, Participant};
pub use ids::{BatchId, ChannelId, GroupResultId, ParticipantId};
pub use protocol::{
    ActionEnvelope, ActionRequest, DeliveryTarget, GroupAction, InboundMsg, RoutedEnvelope,
};
