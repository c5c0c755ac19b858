//! `GroupDispatcher`: one actor per live group.
//!
//! The actor owns the group's [`GroupChannelRegistry`] and processes its
//! mailbox strictly in arrival order, so fan-out for one event never
//! interleaves with another event of the same group. [`GroupDispatcher`] is
//! the cloneable handle; every method enqueues a command and returns.
//!
//! Mailboxes are unbounded. `reassign_channel` enqueues into a second
//! dispatcher's mailbox from inside this actor, and a bounded mailbox could
//! make two dispatchers reassigning toward each other wait on one another.
//!
//! # Lifecycle
//!
//! A dispatcher whose registry becomes empty removes itself from the
//! [`GroupDispatcherRegistry`](crate::GroupDispatcherRegistry) and retires.
//! A retired dispatcher that still receives a channel (a caller that looked
//! it up just before it retired) re-enters the registry if its slot is still
//! free, or forwards the channel to whichever dispatcher now owns the group.
//! The task exits once no handle to it remains.

use std::sync::Arc;

use huddle_core::{
    ActionEnvelope, ChannelId, DeliveryTarget, GroupAction, GroupResultId, InboundMsg,
    ParticipantId, RoutedEnvelope,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::action_handler::GroupActionHandler;
use crate::channel::GroupChannel;
use crate::channel_registry::GroupChannelRegistry;
use crate::errors::{DispatchError, Result};
use crate::msg_builder::GroupActionMsgBuilder;
use crate::registry::WeakRegistry;

enum Command {
    RegisterChannel {
        channel: Arc<GroupChannel>,
    },
    UnregisterChannel {
        participant_id: ParticipantId,
        /// Only remove the entry if it is still this connection.
        channel_id: Option<ChannelId>,
    },
    PoisonChannel {
        participant_id: ParticipantId,
    },
    GroupMsg {
        raw: String,
        sender: ParticipantId,
        sender_channel: Arc<GroupChannel>,
    },
    Joined {
        participant_id: ParticipantId,
    },
    Left {
        participant_id: ParticipantId,
    },
    ReassignChannel {
        participant_id: ParticipantId,
        target: GroupDispatcher,
    },
    HasChannel {
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<bool>,
    },
    ChannelIds {
        respond_to: oneshot::Sender<Vec<ParticipantId>>,
    },
}

/// Handle to a group's dispatcher actor.
#[derive(Clone)]
pub struct GroupDispatcher {
    group_id: GroupResultId,
    sender: mpsc::UnboundedSender<Command>,
}

impl GroupDispatcher {
    /// Spawn the actor task for `group_id`. Requires a tokio runtime.
    pub(crate) fn spawn(
        group_id: GroupResultId,
        builder: GroupActionMsgBuilder,
        handler: GroupActionHandler,
        registry: WeakRegistry,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let actor = DispatcherActor {
            group_id: group_id.clone(),
            receiver,
            weak_self: sender.downgrade(),
            channels: GroupChannelRegistry::new(),
            builder,
            handler,
            registry,
            retired: false,
        };
        drop(tokio::spawn(actor.run()));
        Self { group_id, sender }
    }

    /// Group this dispatcher serves.
    pub fn group_id(&self) -> &GroupResultId {
        &self.group_id
    }

    /// Whether both handles address the same actor.
    pub fn same_as(&self, other: &GroupDispatcher) -> bool {
        self.sender.same_channel(&other.sender)
    }

    /// Whether the actor task has exited.
    pub fn is_stopped(&self) -> bool {
        self.sender.is_closed()
    }

    /// A handle that does not keep the actor alive.
    pub fn downgrade(&self) -> WeakGroupDispatcher {
        WeakGroupDispatcher {
            group_id: self.group_id.clone(),
            sender: self.sender.downgrade(),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender.send(command).map_err(|_| DispatchError::Stopped {
            group_id: self.group_id.clone(),
        })
    }

    /// Register `channel` for its participant. The new channel receives an
    /// `OPENED` with the full roster; every other channel receives an
    /// `OPENED` about the newcomer. An existing channel of the same
    /// participant is replaced and closed without a `CLOSED` broadcast.
    pub fn register_channel(&self, channel: Arc<GroupChannel>) -> Result<()> {
        self.send(Command::RegisterChannel { channel })
    }

    /// Remove `participant_id`'s channel. Remaining channels receive a
    /// `CLOSED`; an emptied dispatcher unregisters itself instead.
    pub fn unregister_channel(&self, participant_id: ParticipantId) -> Result<()> {
        self.send(Command::UnregisterChannel {
            participant_id,
            channel_id: None,
        })
    }

    /// Like [`unregister_channel`](Self::unregister_channel), but only if
    /// `channel` is still the one registered for its participant. Transports
    /// use this on disconnect so a replaced connection never removes its
    /// successor.
    pub fn detach_channel(&self, channel: &GroupChannel) -> Result<()> {
        self.send(Command::UnregisterChannel {
            participant_id: channel.participant_id().clone(),
            channel_id: Some(channel.id().clone()),
        })
    }

    /// Send `participant_id`'s channel a `CLOSED`, close it and unregister
    /// it. No-op if the participant has no channel here.
    pub fn poison_channel(&self, participant_id: ParticipantId) -> Result<()> {
        self.send(Command::PoisonChannel { participant_id })
    }

    /// Route one inbound text frame from `sender`.
    pub fn handle_group_msg(
        &self,
        raw: String,
        sender: ParticipantId,
        sender_channel: Arc<GroupChannel>,
    ) -> Result<()> {
        self.send(Command::GroupMsg {
            raw,
            sender,
            sender_channel,
        })
    }

    /// Tell connected peers that `participant_id` joined, if it has a
    /// channel here.
    pub fn joined(&self, participant_id: ParticipantId) -> Result<()> {
        self.send(Command::Joined { participant_id })
    }

    /// Tell connected peers that `participant_id` left, if it has a channel
    /// here.
    pub fn left(&self, participant_id: ParticipantId) -> Result<()> {
        self.send(Command::Left { participant_id })
    }

    /// Move `participant_id`'s live channel to `target` without closing the
    /// connection. This dispatcher's peers receive `LEFT`, the target's
    /// peers `OPENED` and `JOINED`.
    pub fn reassign_channel(&self, participant_id: ParticipantId, target: GroupDispatcher) -> Result<()> {
        self.send(Command::ReassignChannel {
            participant_id,
            target,
        })
    }

    /// Whether `participant_id` has a channel here.
    pub async fn has_channel(&self, participant_id: &ParticipantId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::HasChannel {
            participant_id: participant_id.clone(),
            respond_to: tx,
        })?;
        rx.await.map_err(|_| DispatchError::Stopped {
            group_id: self.group_id.clone(),
        })
    }

    /// Participants with a channel here, sorted.
    pub async fn channel_ids(&self) -> Result<Vec<ParticipantId>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ChannelIds { respond_to: tx })?;
        rx.await.map_err(|_| DispatchError::Stopped {
            group_id: self.group_id.clone(),
        })
    }
}

/// Non-owning handle to a group's dispatcher actor.
#[derive(Clone)]
pub struct WeakGroupDispatcher {
    group_id: GroupResultId,
    sender: mpsc::WeakUnboundedSender<Command>,
}

impl WeakGroupDispatcher {
    /// The dispatcher, if some strong handle still keeps it running.
    pub fn upgrade(&self) -> Option<GroupDispatcher> {
        self.sender.upgrade().map(|sender| GroupDispatcher {
            group_id: self.group_id.clone(),
            sender,
        })
    }
}

impl std::fmt::Debug for GroupDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupDispatcher")
            .field("group_id", &self.group_id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct DispatcherActor {
    group_id: GroupResultId,
    receiver: mpsc::UnboundedReceiver<Command>,
    weak_self: mpsc::WeakUnboundedSender<Command>,
    channels: GroupChannelRegistry,
    builder: GroupActionMsgBuilder,
    handler: GroupActionHandler,
    registry: WeakRegistry,
    /// Removed from the registry after emptying.
    retired: bool,
}

impl DispatcherActor {
    #[instrument(skip_all, name = "group_dispatcher", fields(group_id = %self.group_id))]
    async fn run(mut self) {
        debug!("dispatcher started");
        while let Some(command) = self.receiver.recv().await {
            self.handle(command);
        }
        debug!(retired = self.retired, "dispatcher stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RegisterChannel { channel } => self.register_channel(channel),
            Command::UnregisterChannel {
                participant_id,
                channel_id,
            } => self.unregister_channel(&participant_id, channel_id.as_ref()),
            Command::PoisonChannel { participant_id } => self.poison_channel(&participant_id),
            Command::GroupMsg {
                raw,
                sender,
                sender_channel,
            } => self.handle_group_msg(&raw, &sender, &sender_channel),
            Command::Joined { participant_id } => {
                if self.channels.contains(&participant_id) {
                    self.broadcast_presence(GroupAction::Joined, &participant_id);
                }
            }
            Command::Left { participant_id } => {
                if self.channels.contains(&participant_id) {
                    self.broadcast_presence(GroupAction::Left, &participant_id);
                }
            }
            Command::ReassignChannel {
                participant_id,
                target,
            } => self.reassign_channel(&participant_id, &target),
            Command::HasChannel {
                participant_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.channels.contains(&participant_id));
            }
            Command::ChannelIds { respond_to } => {
                let _ = respond_to.send(self.channels.ids());
            }
        }
    }

    fn handle_self(&self) -> Option<GroupDispatcher> {
        self.weak_self.upgrade().map(|sender| GroupDispatcher {
            group_id: self.group_id.clone(),
            sender,
        })
    }

    fn register_channel(&mut self, channel: Arc<GroupChannel>) {
        let Some(me) = self.handle_self() else {
            warn!(participant_id = %channel.participant_id(), "dispatcher has no owner, closing channel");
            channel.close();
            return;
        };

        if self.retired {
            let Some(registry) = self.registry.upgrade() else {
                channel.close();
                return;
            };
            let live = registry.reinstate(&me);
            if !live.same_as(&me) {
                debug!(participant_id = %channel.participant_id(), "forwarding channel to live dispatcher");
                if live.register_channel(channel.clone()).is_err() {
                    channel.close();
                }
                return;
            }
            debug!("retired dispatcher reinstated");
            self.retired = false;
        }

        let participant_id = channel.participant_id().clone();
        if let Some(previous) = self.channels.register(channel.clone()) {
            if !Arc::ptr_eq(&previous, &channel) {
                info!(participant_id = %participant_id, "channel replaced by reconnection");
                previous.set_dispatcher(None);
                previous.close();
            }
        }
        channel.set_dispatcher(Some(me));

        let envelope = self.presence(GroupAction::Opened, &participant_id);
        let Some(frame) = encode(&envelope) else {
            return;
        };
        let _ = channel.send(frame.clone());
        let recipients = self.send_to_others(&participant_id, &frame);
        info!(participant_id = %participant_id, recipients, channels = self.channels.len(), "channel registered");
    }

    fn unregister_channel(&mut self, participant_id: &ParticipantId, channel_id: Option<&ChannelId>) {
        let Some(current) = self.channels.get(participant_id) else {
            return;
        };
        if channel_id.is_some_and(|id| id != current.id()) {
            debug!(participant_id = %participant_id, "ignoring detach of replaced channel");
            return;
        }
        if let Some(removed) = self.channels.unregister(participant_id) {
            removed.set_dispatcher(None);
        }
        info!(participant_id = %participant_id, channels = self.channels.len(), "channel unregistered");

        if self.channels.is_empty() {
            self.retire();
        } else {
            self.broadcast_presence(GroupAction::Closed, participant_id);
        }
    }

    fn poison_channel(&mut self, participant_id: &ParticipantId) {
        let Some(channel) = self.channels.get(participant_id).cloned() else {
            return;
        };
        let envelope = self.presence(GroupAction::Closed, participant_id);
        if let Some(frame) = encode(&envelope) {
            let _ = channel.send(frame);
        }
        channel.close();
        self.unregister_channel(participant_id, None);
    }

    fn handle_group_msg(
        &self,
        raw: &str,
        sender: &ParticipantId,
        sender_channel: &Arc<GroupChannel>,
    ) {
        let registered_here = self
            .channels
            .get(sender)
            .is_some_and(|c| Arc::ptr_eq(c, sender_channel));
        if !registered_here {
            // Queued before a reassignment moved the channel away.
            let current = sender_channel.dispatcher();
            match (current, self.handle_self()) {
                (Some(current), Some(me)) if !current.same_as(&me) => {
                    debug!(participant_id = %sender, "forwarding frame to the channel's current dispatcher");
                    let _ = current.handle_group_msg(raw.to_owned(), sender.clone(), sender_channel.clone());
                }
                _ => debug!(participant_id = %sender, "dropping frame from unregistered channel"),
            }
            return;
        }

        match InboundMsg::parse(raw) {
            Err(e) => {
                debug!(participant_id = %sender, error = %e, "malformed frame");
                let envelope = self.builder.build_error(&self.group_id, e.to_string());
                self.route(RoutedEnvelope::sender_only(envelope), sender, sender_channel);
            }
            Ok(InboundMsg::Action(request)) => {
                debug!(participant_id = %sender, action = %request.tag, "action frame");
                let ids = self.channels.ids();
                for routed in self
                    .handler
                    .handle_action_msg(&request, &self.group_id, sender, &ids)
                {
                    self.route(routed, sender, sender_channel);
                }
            }
            Ok(InboundMsg::Direct { recipient, raw }) => {
                self.deliver(&Arc::new(raw), DeliveryTarget::Unknown, Some(&recipient), sender, sender_channel);
            }
            Ok(InboundMsg::Broadcast { raw }) => {
                self.deliver(&Arc::new(raw), DeliveryTarget::Unknown, None, sender, sender_channel);
            }
        }
    }

    fn reassign_channel(&mut self, participant_id: &ParticipantId, target: &GroupDispatcher) {
        if target.group_id() == &self.group_id {
            debug!(participant_id = %participant_id, "reassign target is this group, ignoring");
            return;
        }
        let Some(channel) = self.channels.get(participant_id).cloned() else {
            debug!(participant_id = %participant_id, "no channel to reassign");
            return;
        };

        // The target's mailbox gets the channel before it leaves this
        // registry, so anyone asking this dispatcher and then the target
        // always finds it in at least one of them. Frames the transport
        // routes through the back-reference from here on queue up behind
        // that registration.
        if let Err(e) = target.register_channel(channel.clone()) {
            warn!(participant_id = %participant_id, error = %e, "reassign target stopped, keeping channel");
            return;
        }
        channel.set_dispatcher(Some(target.clone()));
        let _ = self.channels.unregister(participant_id);
        self.broadcast_presence(GroupAction::Left, participant_id);
        let _ = target.joined(participant_id.clone());
        info!(
            participant_id = %participant_id,
            target_group_id = %target.group_id(),
            "channel reassigned"
        );

        if self.channels.is_empty() {
            self.retire();
        }
    }

    fn retire(&mut self) {
        self.retired = true;
        let removed = match (self.registry.upgrade(), self.handle_self()) {
            (Some(registry), Some(me)) => registry.unregister_instance(&me),
            _ => false,
        };
        info!(removed, "dispatcher empty, unregistered");
    }

    fn presence(&self, action: GroupAction, member: &ParticipantId) -> ActionEnvelope {
        self.builder
            .build(action, &self.group_id, member, self.channels.ids())
    }

    fn broadcast_presence(&self, action: GroupAction, member: &ParticipantId) {
        let envelope = self.presence(action, member);
        if let Some(frame) = encode(&envelope) {
            let recipients = self.send_to_others(member, &frame);
            debug!(participant_id = %member, %action, recipients, "presence broadcast");
        }
    }

    fn route(&self, routed: RoutedEnvelope, sender: &ParticipantId, sender_channel: &GroupChannel) {
        let Some(frame) = encode(&routed.envelope) else {
            return;
        };
        self.deliver(
            &frame,
            routed.target,
            routed.envelope.recipient.as_ref(),
            sender,
            sender_channel,
        );
    }

    /// Send `frame` to `target`. An `Unknown` target goes to `recipient`
    /// alone when one is named, else to everyone but the sender.
    fn deliver(
        &self,
        frame: &Arc<String>,
        target: DeliveryTarget,
        recipient: Option<&ParticipantId>,
        sender: &ParticipantId,
        sender_channel: &GroupChannel,
    ) {
        match (target, recipient) {
            (DeliveryTarget::SenderOnly, _) => {
                let _ = sender_channel.send(frame.clone());
            }
            (DeliveryTarget::AllButSender, _) | (DeliveryTarget::Unknown, None) => {
                let recipients = self.send_to_others(sender, frame);
                debug!(participant_id = %sender, recipients, "broadcast");
            }
            (DeliveryTarget::Unknown, Some(recipient)) => match self.channels.get(recipient) {
                Some(channel) => {
                    let _ = channel.send(frame.clone());
                }
                None => {
                    debug!(participant_id = %sender, recipient = %recipient, "direct message to unknown recipient");
                    let envelope = self
                        .builder
                        .build_error(&self.group_id, format!("recipient {recipient} is not connected"));
                    if let Some(error) = encode(&envelope) {
                        let _ = sender_channel.send(error);
                    }
                }
            },
        }
    }

    fn send_to_others(&self, sender: &ParticipantId, frame: &Arc<String>) -> usize {
        self.channels
            .others(sender)
            .filter(|channel| channel.send(frame.clone()))
            .count()
    }
}

fn encode(envelope: &ActionEnvelope) -> Option<Arc<String>> {
    match envelope.to_json() {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(action = %envelope.action, error = %e, "failed to serialize envelope");
            None
        }
    }
}
