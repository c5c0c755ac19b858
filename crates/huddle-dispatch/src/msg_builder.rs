//! Builds outbound protocol envelopes from persisted group state.

use huddle_core::{ActionEnvelope, GroupAction, GroupResultId, ParticipantId};
use huddle_store::GroupStore;
use tracing::warn;

/// Envelope factory for one store.
///
/// Presence envelopes carry the persisted active roster and group state,
/// read fresh for every event. A failed read is logged and leaves those
/// fields out; the event itself still goes out.
#[derive(Clone)]
pub struct GroupActionMsgBuilder {
    store: GroupStore,
}

impl GroupActionMsgBuilder {
    /// Builder reading from `store`.
    pub fn new(store: GroupStore) -> Self {
        Self { store }
    }

    /// A presence envelope (`OPENED`, `CLOSED`, `JOINED`, `LEFT`, `FIXED`)
    /// about `member` in `group_id`. `channels` lists the participants with
    /// a live channel in the sending dispatcher.
    pub fn build(
        &self,
        action: GroupAction,
        group_id: &GroupResultId,
        member: &ParticipantId,
        channels: Vec<ParticipantId>,
    ) -> ActionEnvelope {
        let mut envelope = ActionEnvelope {
            group_result_id: Some(group_id.clone()),
            member_id: Some(member.clone()),
            channels: Some(channels),
            ..ActionEnvelope::new(action)
        };

        match self.store.get_group(group_id) {
            Ok(Some(group)) => {
                envelope.group_state = Some(group.state);
                envelope.members = Some(group.active_members);
                if action == GroupAction::Opened {
                    envelope.group_session_data = group.session_data;
                    envelope.group_session_version = Some(group.session_version);
                }
            }
            Ok(None) => {
                warn!(group_id = %group_id, %action, "group not persisted, sending envelope without roster");
            }
            Err(e) => {
                warn!(group_id = %group_id, %action, error = %e, "failed to load group for envelope");
            }
        }
        envelope
    }

    /// An `ERROR` envelope for the sender.
    pub fn build_error(&self, group_id: &GroupResultId, message: impl Into<String>) -> ActionEnvelope {
        ActionEnvelope {
            group_result_id: Some(group_id.clone()),
            ..ActionEnvelope::error(message)
        }
    }

    /// The store envelopes are read from.
    pub fn store(&self) -> &GroupStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{Batch, BatchId, GroupResult, GroupState};
    use serde_json::json;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::from_raw(s)
    }

    fn seeded() -> (GroupActionMsgBuilder, GroupResult) {
        let store = GroupStore::open_in_memory().unwrap();
        let batch = Batch::unlimited(BatchId::from_raw("b"));
        let mut group = GroupResult::new(batch.id.clone());
        group.add_active_member(&pid("a"), &batch).unwrap();
        group.add_active_member(&pid("b"), &batch).unwrap();
        store.in_transaction(|dao| dao.insert(&group)).unwrap();
        (GroupActionMsgBuilder::new(store), group)
    }

    #[test]
    fn opened_carries_roster_and_session() {
        let (builder, group) = seeded();
        let envelope = builder.build(GroupAction::Opened, &group.id, &pid("a"), vec![pid("a")]);
        assert_eq!(envelope.action, GroupAction::Opened);
        assert_eq!(envelope.members, Some(vec![pid("a"), pid("b")]));
        assert_eq!(envelope.channels, Some(vec![pid("a")]));
        assert_eq!(envelope.group_state, Some(GroupState::Open));
        assert_eq!(envelope.group_session_data, Some(json!({})));
        assert_eq!(envelope.group_session_version, Some(1));
    }

    #[test]
    fn joined_omits_session() {
        let (builder, group) = seeded();
        let envelope = builder.build(GroupAction::Joined, &group.id, &pid("b"), vec![]);
        assert_eq!(envelope.member_id, Some(pid("b")));
        assert!(envelope.group_session_data.is_none());
        assert!(envelope.members.is_some());
    }

    #[test]
    fn unknown_group_still_builds() {
        let (builder, _) = seeded();
        let envelope = builder.build(
            GroupAction::Closed,
            &GroupResultId::from_raw("gone"),
            &pid("a"),
            vec![],
        );
        assert_eq!(envelope.action, GroupAction::Closed);
        assert!(envelope.members.is_none());
    }

    #[test]
    fn error_envelope() {
        let (builder, group) = seeded();
        let envelope = builder.build_error(&group.id, "recipient x is not connected");
        assert_eq!(envelope.action, GroupAction::Error);
        assert_eq!(envelope.error_msg.as_deref(), Some("recipient x is not connected"));
        assert_eq!(envelope.group_result_id, Some(group.id));
    }
}
