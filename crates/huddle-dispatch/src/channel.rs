//! Live channel handle for one participant's duplex connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use huddle_core::{ChannelId, ParticipantId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::dispatcher::GroupDispatcher;

/// One participant's live connection, as seen by dispatchers.
///
/// Outbound frames go into a bounded queue drained by the transport's write
/// task. Sends never wait: a full or closed queue drops the frame and bumps
/// [`drop_count`](Self::drop_count). Closing cancels a token the transport
/// watches to tear down the physical connection.
pub struct GroupChannel {
    id: ChannelId,
    participant_id: ParticipantId,
    tx: mpsc::Sender<Arc<String>>,
    closed: CancellationToken,
    /// Dispatcher that currently owns this channel.
    dispatcher: Mutex<Option<GroupDispatcher>>,
    dropped_messages: AtomicU64,
}

impl GroupChannel {
    /// Create a channel for `participant_id` writing into `tx`.
    pub fn new(participant_id: ParticipantId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id: ChannelId::new(),
            participant_id,
            tx,
            closed: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Unique id of this connection.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Participant on the other end.
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Queue a frame for the remote peer.
    ///
    /// Returns `false` if the frame was dropped.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total frames dropped for this channel.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Ask the transport to close the physical connection.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// The dispatcher currently routing this channel's frames.
    pub fn dispatcher(&self) -> Option<GroupDispatcher> {
        self.dispatcher.lock().clone()
    }

    pub(crate) fn set_dispatcher(&self, dispatcher: Option<GroupDispatcher>) {
        *self.dispatcher.lock() = dispatcher;
    }
}

impl std::fmt::Debug for GroupChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupChannel")
            .field("id", &self.id)
            .field("participant_id", &self.participant_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_channel(buffer: usize) -> (GroupChannel, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(buffer);
        (GroupChannel::new(ParticipantId::from_raw("a"), tx), rx)
    }

    #[tokio::test]
    async fn send_delivers_frame() {
        let (channel, mut rx) = make_channel(4);
        assert!(channel.send(Arc::new("hello".into())));
        assert_eq!(&*rx.recv().await.unwrap(), "hello");
        assert_eq!(channel.drop_count(), 0);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (channel, _rx) = make_channel(1);
        assert!(channel.send(Arc::new("1".into())));
        assert!(!channel.send(Arc::new("2".into())));
        assert_eq!(channel.drop_count(), 1);
    }

    #[test]
    fn closed_receiver_drops() {
        let (channel, rx) = make_channel(4);
        drop(rx);
        assert!(!channel.send(Arc::new("x".into())));
        assert_eq!(channel.drop_count(), 1);
    }

    #[tokio::test]
    async fn close_cancels_and_blocks_sends() {
        let (channel, _rx) = make_channel(4);
        assert!(!channel.is_closed());
        channel.close();
        channel.closed().await;
        assert!(channel.is_closed());
        assert!(!channel.send(Arc::new("late".into())));
    }

    #[test]
    fn ids_are_unique_per_connection() {
        let (a, _ra) = make_channel(1);
        let (b, _rb) = make_channel(1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.participant_id(), b.participant_id());
        assert!(a.dispatcher().is_none());
    }
}
