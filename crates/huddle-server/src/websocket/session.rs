//! One group channel over one WebSocket, from upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use huddle_core::{GroupResultId, ParticipantId};
use huddle_dispatch::{GroupChannel, WeakGroupDispatcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::server::AppState;

/// How long the writer gets to flush and send its Close frame after the
/// reader is done.
const WRITER_GRACE: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocket, Message>;

/// Run a group channel session for an upgraded socket.
///
/// 1. Registers a new [`GroupChannel`] with the group's dispatcher
/// 2. Forwards every inbound text frame to the channel's current dispatcher
/// 3. Writes outbound envelopes verbatim; a poisoned channel gets a Close
///    frame once its queued envelopes are flushed
/// 4. Detaches the channel on disconnect
#[instrument(skip_all, fields(group_id = %group_id, participant_id = %participant_id))]
pub async fn run_channel_session(
    ws: WebSocket,
    group_id: GroupResultId,
    participant_id: ParticipantId,
    state: AppState,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::channel::<Arc<String>>(state.channel_buffer);
    let channel = Arc::new(GroupChannel::new(participant_id, tx));

    let opened_in = {
        let dispatcher = state.dispatchers.get_or_register(&group_id);
        if let Err(e) = dispatcher.register_channel(channel.clone()) {
            warn!(error = %e, "dispatcher stopped before the channel could register");
            return;
        }
        dispatcher.downgrade()
    };
    info!(channel_id = %channel.id(), "group channel opened");

    let writer = tokio::spawn(write_outbound(
        ws_tx,
        rx,
        channel.clone(),
        state.shutdown.token(),
    ));
    let shutdown = state.shutdown.token();

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    Message::Text(text) => forward(&channel, &opened_in, text.as_str().to_owned()),
                    Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => forward(&channel, &opened_in, text),
                        Err(_) => debug!(len = data.len(), "dropping non-UTF8 binary frame"),
                    },
                    Message::Close(_) => {
                        debug!("peer sent close frame");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            () = channel.closed() => break,
            () = shutdown.cancelled() => break,
        }
    }

    if let Some(dispatcher) = channel.dispatcher() {
        if let Err(e) = dispatcher.detach_channel(&channel) {
            debug!(error = %e, "dispatcher already stopped");
        }
    }
    channel.close();
    if tokio::time::timeout(WRITER_GRACE, writer).await.is_err() {
        debug!("writer did not finish in time");
    }
    info!(
        channel_id = %channel.id(),
        dropped = channel.drop_count(),
        "group channel closed"
    );
}

/// Hand one inbound frame to whichever dispatcher owns the channel now.
///
/// Until the opening dispatcher has processed the registration the
/// back-reference is still empty; frames sent that early go to the
/// opening dispatcher, whose mailbox already holds the registration.
/// Only a weak handle to it is kept, so once the channel has moved on the
/// opening dispatcher can stop.
fn forward(channel: &Arc<GroupChannel>, opened_in: &WeakGroupDispatcher, raw: String) {
    let Some(dispatcher) = channel.dispatcher().or_else(|| opened_in.upgrade()) else {
        debug!("dropping frame, no dispatcher owns the channel");
        return;
    };
    if let Err(e) = dispatcher.handle_group_msg(raw, channel.participant_id().clone(), channel.clone()) {
        warn!(error = %e, "dropping frame for stopped dispatcher");
    }
}

async fn write_outbound(
    mut ws_tx: WsSink,
    mut rx: mpsc::Receiver<Arc<String>>,
    channel: Arc<GroupChannel>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(Message::Text(frame.as_str().into())).await.is_err() {
                    return;
                }
            }
            () = channel.closed() => {
                while let Ok(frame) = rx.try_recv() {
                    if ws_tx.send(Message::Text(frame.as_str().into())).await.is_err() {
                        return;
                    }
                }
                send_close(&mut ws_tx, close_code::NORMAL, "group channel closed").await;
                return;
            }
            () = shutdown.cancelled() => {
                send_close(&mut ws_tx, close_code::AWAY, "server shutting down").await;
                return;
            }
        }
    }
}

async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if ws_tx.send(Message::Close(Some(frame))).await.is_err() {
        debug!("peer gone before close frame");
    }
}
