//! Process-wide directory of live group dispatchers.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use huddle_core::{GroupResultId, ParticipantId};
use huddle_store::GroupStore;
use tracing::{debug, info};

use crate::action_handler::GroupActionHandler;
use crate::dispatcher::GroupDispatcher;
use crate::msg_builder::GroupActionMsgBuilder;

struct RegistryInner {
    dispatchers: DashMap<GroupResultId, GroupDispatcher>,
    builder: GroupActionMsgBuilder,
    handler: GroupActionHandler,
}

/// One dispatcher per live group, created on first use.
///
/// Cloning is cheap; clones share the same map.
#[derive(Clone)]
pub struct GroupDispatcherRegistry {
    inner: Arc<RegistryInner>,
}

impl GroupDispatcherRegistry {
    /// Registry whose dispatchers build envelopes from `store`.
    pub fn new(store: GroupStore) -> Self {
        let builder = GroupActionMsgBuilder::new(store);
        let handler = GroupActionHandler::new(builder.clone());
        Self {
            inner: Arc::new(RegistryInner {
                dispatchers: DashMap::new(),
                builder,
                handler,
            }),
        }
    }

    /// The dispatcher of `group_id`, if one is live.
    pub fn get(&self, group_id: &GroupResultId) -> Option<GroupDispatcher> {
        self.inner
            .dispatchers
            .get(group_id)
            .map(|entry| entry.value().clone())
    }

    /// The dispatcher of `group_id`, spawning it if none is live.
    ///
    /// The map entry stays locked while the dispatcher is spawned, so
    /// concurrent callers for the same group all get the same instance.
    /// Must be called from within a tokio runtime.
    pub fn get_or_register(&self, group_id: &GroupResultId) -> GroupDispatcher {
        self.inner
            .dispatchers
            .entry(group_id.clone())
            .or_insert_with(|| {
                info!(group_id = %group_id, "spawning group dispatcher");
                GroupDispatcher::spawn(
                    group_id.clone(),
                    self.inner.builder.clone(),
                    self.inner.handler.clone(),
                    self.downgrade(),
                )
            })
            .value()
            .clone()
    }

    /// Forget the dispatcher of `group_id`. Idempotent.
    pub fn unregister(&self, group_id: &GroupResultId) -> bool {
        let removed = self.inner.dispatchers.remove(group_id).is_some();
        if removed {
            debug!(group_id = %group_id, "dispatcher unregistered");
        }
        removed
    }

    /// Whether any live dispatcher has a channel for `participant_id`.
    pub async fn has_channel(&self, participant_id: &ParticipantId) -> bool {
        let dispatchers: Vec<GroupDispatcher> = self
            .inner
            .dispatchers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for dispatcher in dispatchers {
            if dispatcher.has_channel(participant_id).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    /// Number of live dispatchers.
    pub fn len(&self) -> usize {
        self.inner.dispatchers.len()
    }

    /// Whether no dispatcher is live.
    pub fn is_empty(&self) -> bool {
        self.inner.dispatchers.is_empty()
    }

    /// Remove `dispatcher`'s entry, but only if the map still holds that
    /// same instance.
    pub(crate) fn unregister_instance(&self, dispatcher: &GroupDispatcher) -> bool {
        self.inner
            .dispatchers
            .remove_if(dispatcher.group_id(), |_, current| current.same_as(dispatcher))
            .is_some()
    }

    /// Put `dispatcher` back under its group unless another instance took
    /// the slot. Returns whichever instance owns the group afterwards.
    pub(crate) fn reinstate(&self, dispatcher: &GroupDispatcher) -> GroupDispatcher {
        self.inner
            .dispatchers
            .entry(dispatcher.group_id().clone())
            .or_insert_with(|| dispatcher.clone())
            .value()
            .clone()
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }
}

/// Non-owning reference from a dispatcher back to its registry.
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<GroupDispatcherRegistry> {
        self.0
            .upgrade()
            .map(|inner| GroupDispatcherRegistry { inner })
    }
}
