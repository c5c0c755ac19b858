//! Per-dispatcher map from participant to live channel.
//!
//! Owned by a single dispatcher task, so it carries no locking.

use std::collections::HashMap;
use std::sync::Arc;

use huddle_core::ParticipantId;

use crate::channel::GroupChannel;

/// Live channels of one group, keyed by participant.
#[derive(Debug, Default)]
pub struct GroupChannelRegistry {
    channels: HashMap<ParticipantId, Arc<GroupChannel>>,
}

impl GroupChannelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` under its participant. Returns the channel it
    /// replaced, if any.
    pub fn register(&mut self, channel: Arc<GroupChannel>) -> Option<Arc<GroupChannel>> {
        self.channels
            .insert(channel.participant_id().clone(), channel)
    }

    /// Remove the channel of `participant`.
    pub fn unregister(&mut self, participant: &ParticipantId) -> Option<Arc<GroupChannel>> {
        self.channels.remove(participant)
    }

    /// The channel of `participant`.
    pub fn get(&self, participant: &ParticipantId) -> Option<&Arc<GroupChannel>> {
        self.channels.get(participant)
    }

    /// Whether `participant` has a channel here.
    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.channels.contains_key(participant)
    }

    /// Participants with a channel, sorted.
    pub fn ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All channels except `participant`'s.
    pub fn others<'a>(
        &'a self,
        participant: &'a ParticipantId,
    ) -> impl Iterator<Item = &'a Arc<GroupChannel>> + 'a {
        self.channels
            .iter()
            .filter(move |(id, _)| *id != participant)
            .map(|(_, channel)| channel)
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel(pid: &str) -> Arc<GroupChannel> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(GroupChannel::new(ParticipantId::from_raw(pid), tx))
    }

    #[test]
    fn register_returns_previous_occupant() {
        let mut registry = GroupChannelRegistry::new();
        let first = channel("a");
        assert!(registry.register(first.clone()).is_none());
        let replaced = registry.register(channel("a")).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_returns_removed() {
        let mut registry = GroupChannelRegistry::new();
        let _ = registry.register(channel("a"));
        assert!(registry.unregister(&ParticipantId::from_raw("a")).is_some());
        assert!(registry.unregister(&ParticipantId::from_raw("a")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn others_excludes_sender() {
        let mut registry = GroupChannelRegistry::new();
        for pid in ["a", "b", "c"] {
            let _ = registry.register(channel(pid));
        }
        let sender = ParticipantId::from_raw("b");
        let mut others: Vec<_> = registry
            .others(&sender)
            .map(|c| c.participant_id().as_str().to_string())
            .collect();
        others.sort();
        assert_eq!(others, vec!["a", "c"]);
        assert_eq!(
            registry.ids(),
            vec![
                ParticipantId::from_raw("a"),
                ParticipantId::from_raw("b"),
                ParticipantId::from_raw("c")
            ]
        );
        assert_eq!(registry.len(), 3);
    }
}
