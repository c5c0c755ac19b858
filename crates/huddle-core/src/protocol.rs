//! Group channel wire protocol.
//!
//! Every frame is a JSON object. Frames with an `action` field are protocol
//! envelopes ([`ActionEnvelope`] outbound, [`ActionRequest`] inbound); all
//! other frames are application payloads relayed verbatim, either to the
//! participant named in `recipient` or to everyone but the sender.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::MalformedMessage;
use crate::group::GroupState;
use crate::ids::{GroupResultId, ParticipantId};

/// Field that marks a frame as a protocol envelope.
pub const ACTION_FIELD: &str = "action";
/// Field that addresses a frame to a single participant.
pub const RECIPIENT_FIELD: &str = "recipient";

/// Protocol action tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupAction {
    /// A channel opened.
    Opened,
    /// A channel closed.
    Closed,
    /// A member joined the group.
    Joined,
    /// A member left the group.
    Left,
    /// Something went wrong handling the sender's frame.
    Error,
    /// Group session data changed.
    Session,
    /// The sender's session patch was accepted.
    SessionAck,
    /// The sender's session patch was rejected.
    SessionFail,
    /// The group was fixed.
    Fixed,
}

impl GroupAction {
    /// Wire name of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "OPENED",
            Self::Closed => "CLOSED",
            Self::Joined => "JOINED",
            Self::Left => "LEFT",
            Self::Error => "ERROR",
            Self::Session => "SESSION",
            Self::SessionAck => "SESSION_ACK",
            Self::SessionFail => "SESSION_FAIL",
            Self::Fixed => "FIXED",
        }
    }

    /// Parse a wire tag.
    pub fn parse(tag: &str) -> Option<Self> {
        serde_json::from_value(Value::String(tag.to_owned())).ok()
    }
}

impl std::fmt::Display for GroupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who receives an outbound frame, relative to the participant whose
/// frame or event produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryTarget {
    /// Only the originating participant.
    SenderOnly,
    /// Every registered channel except the originating participant's.
    AllButSender,
    /// Decided by the frame itself: its `recipient` if present, otherwise
    /// everyone but the sender.
    Unknown,
}

/// Outbound protocol envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEnvelope {
    /// Action tag.
    pub action: GroupAction,
    /// Group the envelope is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_result_id: Option<GroupResultId>,
    /// Group lifecycle state at the time of sending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_state: Option<GroupState>,
    /// Participant the event is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<ParticipantId>,
    /// Persisted active roster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<ParticipantId>>,
    /// Participants with a live channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<ParticipantId>>,
    /// Full session blob.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_session_data: Option<Value>,
    /// Session version the envelope reflects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_session_version: Option<u64>,
    /// Session patches to apply locally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_session_patches: Option<Value>,
    /// Echo of the client's correlation id for session actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_action_id: Option<Value>,
    /// Human-readable error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Single participant the envelope is addressed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ParticipantId>,
}

impl ActionEnvelope {
    /// An envelope with only the action tag set.
    pub fn new(action: GroupAction) -> Self {
        Self {
            action,
            group_result_id: None,
            group_state: None,
            member_id: None,
            members: None,
            channels: None,
            group_session_data: None,
            group_session_version: None,
            group_session_patches: None,
            session_action_id: None,
            error_msg: None,
            recipient: None,
        }
    }

    /// An ERROR envelope.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_msg: Some(message.into()),
            ..Self::new(GroupAction::Error)
        }
    }

    /// Serialize to the wire form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// An outbound envelope with its addressing.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutedEnvelope {
    /// The envelope.
    pub envelope: ActionEnvelope,
    /// Who gets it.
    pub target: DeliveryTarget,
}

impl RoutedEnvelope {
    /// Address to the sender only.
    pub fn sender_only(envelope: ActionEnvelope) -> Self {
        Self {
            envelope,
            target: DeliveryTarget::SenderOnly,
        }
    }

    /// Address to everyone but the sender.
    pub fn all_but_sender(envelope: ActionEnvelope) -> Self {
        Self {
            envelope,
            target: DeliveryTarget::AllButSender,
        }
    }

    /// Leave the addressing to the envelope's own `recipient`.
    pub fn unresolved(envelope: ActionEnvelope) -> Self {
        Self {
            envelope,
            target: DeliveryTarget::Unknown,
        }
    }
}

/// Inbound protocol envelope (a frame carrying `action`).
#[derive(Clone, Debug, PartialEq)]
pub struct ActionRequest {
    /// Raw action tag as sent.
    pub tag: String,
    /// The whole frame.
    pub body: Map<String, Value>,
}

impl ActionRequest {
    /// The tag, if it names a known action.
    pub fn action(&self) -> Option<GroupAction> {
        GroupAction::parse(&self.tag)
    }

    /// A field of the frame.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name).filter(|v| !v.is_null())
    }
}

/// An inbound frame, classified for routing.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMsg {
    /// Protocol envelope for the action handler.
    Action(ActionRequest),
    /// Payload for one named participant, relayed verbatim.
    Direct {
        /// Addressee.
        recipient: ParticipantId,
        /// Original frame text.
        raw: String,
    },
    /// Payload for everyone but the sender, relayed verbatim.
    Broadcast {
        /// Original frame text.
        raw: String,
    },
}

impl InboundMsg {
    /// Classify one inbound text frame.
    ///
    /// A frame must be a JSON object. `action` must be a string; `recipient`
    /// may be a string or a number, and `null` counts as absent.
    pub fn parse(raw: &str) -> Result<Self, MalformedMessage> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| MalformedMessage(format!("invalid JSON: {e}")))?;
        let Value::Object(body) = value else {
            return Err(MalformedMessage("frame is not a JSON object".into()));
        };

        let tag = match body.get(ACTION_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(tag)) => Some(tag.clone()),
            Some(other) => {
                return Err(MalformedMessage(format!("action must be a string, got {other}")));
            }
        };
        if let Some(tag) = tag {
            return Ok(Self::Action(ActionRequest { tag, body }));
        }

        let recipient = match body.get(RECIPIENT_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(ParticipantId::from_raw(id.clone())),
            Some(Value::Number(id)) => Some(ParticipantId::from_raw(id.to_string())),
            Some(other) => {
                return Err(MalformedMessage(format!(
                    "recipient must be a string or number, got {other}"
                )));
            }
        };

        Ok(match recipient {
            Some(recipient) => Self::Direct {
                recipient,
                raw: raw.to_owned(),
            },
            None => Self::Broadcast { raw: raw.to_owned() },
        })
    }
}
