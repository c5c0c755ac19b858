//! Group membership changes.
//!
//! Every change runs in one store transaction. Live dispatchers hear about
//! it only after the commit, so a notification never announces a change
//! that was rolled back.

use chrono::Utc;
use huddle_core::{Batch, GroupResult, GroupResultId, GroupState, Participant, ParticipantId};
use huddle_dispatch::GroupDispatcherRegistry;
use huddle_store::{GroupResultDao, GroupStore};
use tracing::{debug, info, instrument, warn};

use crate::errors::{AdminError, Result};

/// Joins, leaves and reassignments for group-study participants.
///
/// Cloning is cheap; clones share the store and the dispatcher registry.
#[derive(Clone)]
pub struct GroupAdministration {
    store: GroupStore,
    dispatchers: GroupDispatcherRegistry,
}

impl GroupAdministration {
    /// Administration writing to `store` and notifying `dispatchers`.
    pub fn new(store: GroupStore, dispatchers: GroupDispatcherRegistry) -> Self {
        Self { store, dispatchers }
    }

    /// The store membership is persisted in.
    pub fn store(&self) -> &GroupStore {
        &self.store
    }

    /// The registry notified of membership changes.
    pub fn dispatchers(&self) -> &GroupDispatcherRegistry {
        &self.dispatchers
    }

    /// Put `participant` into a group of `batch`.
    ///
    /// Picks the earliest-created open group of the batch with room for
    /// one more member, or creates a new one. Joining again while already
    /// active in a group of the same batch returns that group unchanged.
    #[instrument(skip(self, participant, batch), fields(participant_id = %participant.id, batch_id = %batch.id))]
    pub fn join(&self, participant: &Participant, batch: &Batch) -> Result<GroupResult> {
        check_eligible(participant, batch)?;

        let (group, changed) = self.store.in_transaction(|dao| {
            if let Some(current) = dao.find_active_for(&participant.id)? {
                if current.batch_id != batch.id {
                    return Err(AdminError::AlreadyInGroup {
                        participant_id: participant.id.clone(),
                        group_id: current.id,
                    });
                }
                return Ok((current, false));
            }
            let group = admit(dao, &participant.id, batch)?;
            Ok((group, true))
        })?;

        if changed {
            info!(group_id = %group.id, active = group.active_count(), "participant joined");
            if let Some(dispatcher) = self.dispatchers.get(&group.id) {
                notify(dispatcher.joined(participant.id.clone()), &group.id, "joined");
            }
        } else {
            debug!(group_id = %group.id, "participant already in group");
        }
        Ok(group)
    }

    /// Take `participant` out of its group for good.
    ///
    /// The participant moves to the group's history. Once the history
    /// reaches the batch's total-member cap the group is finished. A
    /// participant that is not in a group study, or not in a group, is left
    /// alone and `None` comes back. Otherwise the group as stored
    /// afterwards is returned.
    #[instrument(skip(self, participant, batch), fields(participant_id = %participant.id, batch_id = %batch.id))]
    pub fn leave(&self, participant: &Participant, batch: &Batch) -> Result<Option<GroupResult>> {
        if !participant.group_study {
            return Ok(None);
        }

        let left = self.store.in_transaction(|dao| {
            let Some(mut group) = dao.find_active_for(&participant.id)? else {
                return Ok(None);
            };
            if group.batch_id != batch.id {
                return Err(AdminError::BatchMismatch {
                    group_id: group.id,
                    batch_id: batch.id.clone(),
                });
            }
            let _ = group.move_to_history(&participant.id);
            if group.history_exhausted(batch) {
                group.finish(Utc::now());
            }
            dao.update(&group)?;
            Ok(Some(group))
        })?;

        let Some(group) = left else {
            debug!("participant not in a group");
            return Ok(None);
        };
        info!(group_id = %group.id, state = %group.state, "participant left");

        if let Some(dispatcher) = self.dispatchers.get(&group.id) {
            notify(dispatcher.left(participant.id.clone()), &group.id, "left");
            notify(
                dispatcher.poison_channel(participant.id.clone()),
                &group.id,
                "poison channel",
            );
        }
        Ok(Some(group))
    }

    /// Move `participant` into another open group of `batch`.
    ///
    /// The target is the earliest-created open group of the batch, other
    /// than the current one, with room for one more member. Returns `false`
    /// and changes nothing if there is none. A live channel follows the
    /// participant into the target group's dispatcher. The participant must
    /// be eligible for `batch` and currently active in one of its groups.
    #[instrument(skip(self, participant, batch), fields(participant_id = %participant.id, batch_id = %batch.id))]
    pub async fn reassign(&self, participant: &Participant, batch: &Batch) -> Result<bool> {
        check_eligible(participant, batch)?;

        let moved = self.store.in_transaction(|dao| {
            let Some(mut current) = dao.find_active_for(&participant.id)? else {
                return Err(AdminError::NotInGroup(participant.id.clone()));
            };
            if current.batch_id != batch.id {
                return Err(AdminError::BatchMismatch {
                    group_id: current.id,
                    batch_id: batch.id.clone(),
                });
            }
            let Some(mut target) = first_with_room(dao, batch, Some(&current.id))? else {
                return Ok(None);
            };
            // The participant may be active in one group only, so the source
            // row has to drop it before the target row picks it up.
            let _ = current.remove_active_member(&participant.id);
            dao.update(&current)?;
            target.add_active_member(&participant.id, batch)?;
            dao.update(&target)?;
            Ok(Some((current, target)))
        })?;

        let Some((current, target)) = moved else {
            debug!("no other open group with room");
            return Ok(false);
        };
        info!(from = %current.id, to = %target.id, "participant reassigned");

        self.move_channel(&participant.id, &current.id, &target.id).await;
        Ok(true)
    }

    /// Close `participant_id`'s channel in `group_id`, if the group has a
    /// live dispatcher. Returns whether one was found.
    #[instrument(skip_all, fields(participant_id = %participant_id, group_id = %group_id))]
    pub fn close_group_channel(&self, participant_id: &ParticipantId, group_id: &GroupResultId) -> bool {
        let Some(dispatcher) = self.dispatchers.get(group_id) else {
            debug!("no dispatcher registered");
            return false;
        };
        notify(
            dispatcher.poison_channel(participant_id.clone()),
            group_id,
            "poison channel",
        );
        true
    }

    async fn move_channel(
        &self,
        participant_id: &ParticipantId,
        from: &GroupResultId,
        to: &GroupResultId,
    ) {
        let source = self.dispatchers.get(from);
        let has_channel = match &source {
            Some(source) => source.has_channel(participant_id).await.unwrap_or(false),
            None => false,
        };

        match source {
            Some(source) if has_channel => {
                let target = self.dispatchers.get_or_register(to);
                notify(
                    source.reassign_channel(participant_id.clone(), target),
                    from,
                    "reassign channel",
                );
            }
            source => {
                if let Some(source) = source {
                    notify(source.left(participant_id.clone()), from, "left");
                }
                if let Some(target) = self.dispatchers.get(to) {
                    notify(target.joined(participant_id.clone()), to, "joined");
                }
            }
        }
    }
}

/// Group-study participants of an allowed worker type, for a batch with
/// consistent limits.
fn check_eligible(participant: &Participant, batch: &Batch) -> Result<()> {
    if !participant.group_study {
        return Err(AdminError::NotGroupStudy(participant.id.clone()));
    }
    batch.validate()?;
    if !batch.allows_worker_type(&participant.worker_type) {
        return Err(AdminError::WorkerTypeNotAllowed {
            participant_id: participant.id.clone(),
            worker_type: participant.worker_type.clone(),
            batch_id: batch.id.clone(),
        });
    }
    Ok(())
}

/// Add `participant` to the first open group of `batch` with room,
/// creating a new group if none has room.
fn admit(dao: &dyn GroupResultDao, participant: &ParticipantId, batch: &Batch) -> Result<GroupResult> {
    if let Some(mut group) = first_with_room(dao, batch, None)? {
        group.add_active_member(participant, batch)?;
        dao.update(&group)?;
        return Ok(group);
    }
    let mut group = GroupResult::new(batch.id.clone());
    group.add_active_member(participant, batch)?;
    dao.insert(&group)?;
    debug!(group_id = %group.id, "created group");
    Ok(group)
}

fn first_with_room(
    dao: &dyn GroupResultDao,
    batch: &Batch,
    exclude: Option<&GroupResultId>,
) -> Result<Option<GroupResult>> {
    let open = dao.find_by_batch(&batch.id, Some(GroupState::Open))?;
    Ok(open
        .into_iter()
        .filter(|group| exclude != Some(&group.id))
        .find(|group| group.has_room(batch)))
}

fn notify(outcome: huddle_dispatch::Result<()>, group_id: &GroupResultId, what: &str) {
    if let Err(e) = outcome {
        warn!(group_id = %group_id, error = %e, "failed to notify dispatcher: {what}");
    }
}
