//! Application-level actions sent by clients.
//!
//! `SESSION` applies a versioned merge patch to the group's shared session
//! data. `FIXED` freezes group membership. Any other tag is answered with
//! an `ERROR` to the sender.

use huddle_core::session::apply_session_patches;
use huddle_core::{
    ActionEnvelope, ActionRequest, GroupAction, GroupResultId, GroupState, ParticipantId,
    RoutedEnvelope,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::msg_builder::GroupActionMsgBuilder;

const SESSION_ACTION_ID: &str = "sessionActionId";
const SESSION_VERSION: &str = "groupSessionVersion";
const SESSION_PATCHES: &str = "groupSessionPatches";

/// Handles inbound action frames for a dispatcher.
#[derive(Clone)]
pub struct GroupActionHandler {
    builder: GroupActionMsgBuilder,
}

impl GroupActionHandler {
    /// Handler persisting through `builder`'s store.
    pub fn new(builder: GroupActionMsgBuilder) -> Self {
        Self { builder }
    }

    /// Process one action frame from `sender` in `group_id`.
    ///
    /// `channels` lists the participants with a live channel in the calling
    /// dispatcher. Returns the envelopes to send, each addressed relative to
    /// the sender.
    pub fn handle_action_msg(
        &self,
        request: &ActionRequest,
        group_id: &GroupResultId,
        sender: &ParticipantId,
        channels: &[ParticipantId],
    ) -> Vec<RoutedEnvelope> {
        match request.action() {
            Some(GroupAction::Session) => self.handle_session(request, group_id, sender),
            Some(GroupAction::Fixed) => self.handle_fixed(group_id, sender, channels),
            Some(other) => vec![RoutedEnvelope::sender_only(self.builder.build_error(
                group_id,
                format!("action {other} cannot be sent by clients"),
            ))],
            None => vec![RoutedEnvelope::sender_only(
                self.builder
                    .build_error(group_id, format!("unknown action: {}", request.tag)),
            )],
        }
    }

    fn handle_session(
        &self,
        request: &ActionRequest,
        group_id: &GroupResultId,
        sender: &ParticipantId,
    ) -> Vec<RoutedEnvelope> {
        let action_id = request.field(SESSION_ACTION_ID).cloned();
        let fail = |reason: String| {
            debug!(group_id = %group_id, participant_id = %sender, %reason, "session patch rejected");
            vec![RoutedEnvelope::sender_only(ActionEnvelope {
                group_result_id: Some(group_id.clone()),
                session_action_id: action_id.clone(),
                error_msg: Some(reason),
                ..ActionEnvelope::new(GroupAction::SessionFail)
            })]
        };

        let Some(version) = request.field(SESSION_VERSION).and_then(Value::as_u64) else {
            return fail(format!("{SESSION_VERSION} must be a non-negative integer"));
        };
        let Some(patches) = request.field(SESSION_PATCHES) else {
            return fail(format!("{SESSION_PATCHES} is missing"));
        };

        let store = self.builder.store();
        let group = match store.get_group(group_id) {
            Ok(Some(group)) => group,
            Ok(None) => return fail("group does not exist".into()),
            Err(e) => {
                warn!(group_id = %group_id, error = %e, "failed to load group for session patch");
                return fail("group could not be loaded".into());
            }
        };
        if group.state == GroupState::Finished {
            return fail("group is finished".into());
        }
        if group.session_version != version {
            return fail(format!(
                "stale session version {version}, current is {}",
                group.session_version
            ));
        }

        let data = apply_session_patches(group.session_data, patches);
        let new_version = match store.update_session(group_id, version, &data) {
            Ok(Some(new_version)) => new_version,
            Ok(None) => return fail("session version changed concurrently".into()),
            Err(e) => {
                warn!(group_id = %group_id, error = %e, "failed to persist session patch");
                return fail("session could not be saved".into());
            }
        };

        debug!(group_id = %group_id, participant_id = %sender, new_version, "session patch applied");
        vec![
            RoutedEnvelope::all_but_sender(ActionEnvelope {
                group_result_id: Some(group_id.clone()),
                group_session_patches: Some(patches.clone()),
                group_session_version: Some(new_version),
                ..ActionEnvelope::new(GroupAction::Session)
            }),
            RoutedEnvelope::sender_only(ActionEnvelope {
                group_result_id: Some(group_id.clone()),
                group_session_version: Some(new_version),
                session_action_id: action_id,
                ..ActionEnvelope::new(GroupAction::SessionAck)
            }),
        ]
    }

    fn handle_fixed(
        &self,
        group_id: &GroupResultId,
        sender: &ParticipantId,
        channels: &[ParticipantId],
    ) -> Vec<RoutedEnvelope> {
        let fixed = match self.builder.store().fix_group(group_id) {
            Ok(Some(group)) => group.state == GroupState::Fixed,
            Ok(None) => false,
            Err(e) => {
                warn!(group_id = %group_id, error = %e, "failed to fix group");
                false
            }
        };
        if !fixed {
            return vec![RoutedEnvelope::sender_only(
                self.builder.build_error(group_id, "group cannot be fixed"),
            )];
        }

        let envelope = self
            .builder
            .build(GroupAction::Fixed, group_id, sender, channels.to_vec());
        vec![
            RoutedEnvelope::sender_only(envelope.clone()),
            RoutedEnvelope::all_but_sender(envelope),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{Batch, BatchId, DeliveryTarget, GroupResult, InboundMsg};
    use huddle_store::GroupStore;
    use serde_json::json;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::from_raw(s)
    }

    fn setup() -> (GroupActionHandler, GroupStore, GroupResultId) {
        let store = GroupStore::open_in_memory().unwrap();
        let batch = Batch::unlimited(BatchId::from_raw("b"));
        let mut group = GroupResult::new(batch.id.clone());
        group.add_active_member(&pid("a"), &batch).unwrap();
        store.in_transaction(|dao| dao.insert(&group)).unwrap();
        let handler = GroupActionHandler::new(GroupActionMsgBuilder::new(store.clone()));
        (handler, store, group.id)
    }

    fn request(raw: serde_json::Value) -> ActionRequest {
        match InboundMsg::parse(&raw.to_string()).unwrap() {
            InboundMsg::Action(request) => request,
            other => panic!("expected action frame, got {other:?}"),
        }
    }

    #[test]
    fn session_patch_accepted() {
        let (handler, store, group_id) = setup();
        let out = handler.handle_action_msg(
            &request(json!({
                "action": "SESSION",
                "sessionActionId": 7,
                "groupSessionVersion": 1,
                "groupSessionPatches": {"score": 3}
            })),
            &group_id,
            &pid("a"),
            &[pid("a")],
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].target, DeliveryTarget::AllButSender);
        assert_eq!(out[0].envelope.action, GroupAction::Session);
        assert_eq!(out[0].envelope.group_session_version, Some(2));
        assert_eq!(out[0].envelope.group_session_patches, Some(json!({"score": 3})));
        assert_eq!(out[1].target, DeliveryTarget::SenderOnly);
        assert_eq!(out[1].envelope.action, GroupAction::SessionAck);
        assert_eq!(out[1].envelope.session_action_id, Some(json!(7)));

        let group = store.get_group(&group_id).unwrap().unwrap();
        assert_eq!(group.session_data, Some(json!({"score": 3})));
        assert_eq!(group.session_version, 2);
    }

    #[test]
    fn stale_session_version_fails() {
        let (handler, store, group_id) = setup();
        let out = handler.handle_action_msg(
            &request(json!({
                "action": "SESSION",
                "sessionActionId": "x",
                "groupSessionVersion": 5,
                "groupSessionPatches": {"score": 3}
            })),
            &group_id,
            &pid("a"),
            &[],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, DeliveryTarget::SenderOnly);
        assert_eq!(out[0].envelope.action, GroupAction::SessionFail);
        assert_eq!(out[0].envelope.session_action_id, Some(json!("x")));
        assert_eq!(store.get_group(&group_id).unwrap().unwrap().session_version, 1);
    }

    #[test]
    fn session_without_patches_fails() {
        let (handler, _store, group_id) = setup();
        let out = handler.handle_action_msg(
            &request(json!({"action": "SESSION", "groupSessionVersion": 1})),
            &group_id,
            &pid("a"),
            &[],
        );
        assert_eq!(out[0].envelope.action, GroupAction::SessionFail);
    }

    #[test]
    fn fixed_goes_to_everyone() {
        let (handler, store, group_id) = setup();
        let out = handler.handle_action_msg(
            &request(json!({"action": "FIXED"})),
            &group_id,
            &pid("a"),
            &[pid("a")],
        );
        assert_eq!(out.len(), 2);
        let targets: Vec<_> = out.iter().map(|r| r.target).collect();
        assert_eq!(targets, vec![DeliveryTarget::SenderOnly, DeliveryTarget::AllButSender]);
        assert!(out.iter().all(|r| r.envelope.action == GroupAction::Fixed));
        assert_eq!(out[0].envelope.group_state, Some(GroupState::Fixed));
        assert_eq!(
            store.get_group(&group_id).unwrap().unwrap().state,
            GroupState::Fixed
        );
    }

    #[test]
    fn fixing_missing_group_is_an_error() {
        let (handler, _store, _) = setup();
        let out = handler.handle_action_msg(
            &request(json!({"action": "FIXED"})),
            &GroupResultId::from_raw("missing"),
            &pid("a"),
            &[],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].envelope.action, GroupAction::Error);
    }

    #[test]
    fn server_only_and_unknown_actions_rejected() {
        let (handler, _store, group_id) = setup();
        for raw in [json!({"action": "OPENED"}), json!({"action": "DANCE"})] {
            let out = handler.handle_action_msg(&request(raw), &group_id, &pid("a"), &[]);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].target, DeliveryTarget::SenderOnly);
            assert_eq!(out[0].envelope.action, GroupAction::Error);
        }
    }
}
