//! End-to-end tests with a real WebSocket client.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use huddle_core::{Batch, BatchId, GroupResult, Participant, ParticipantId};
use huddle_server::HuddleServer;
use huddle_settings::ServerSettings;
use huddle_store::GroupStore;
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn participant(id: &str) -> Participant {
    Participant::new(ParticipantId::from_raw(id), "Jatos")
}

/// Boot a server on a free port with `members` joined to one group.
async fn boot_server(members: &[&str]) -> (String, HuddleServer, GroupResult) {
    let config = ServerSettings {
        port: 0,
        ..ServerSettings::default()
    };
    let server = HuddleServer::new(config, GroupStore::open_in_memory().unwrap());
    let batch = Batch::unlimited(BatchId::from_raw("batch"));
    let mut group = None;
    for member in members {
        group = Some(server.admin().join(&participant(member), &batch).unwrap());
    }
    let (addr, _handle) = server.listen().await.unwrap();
    (format!("ws://{addr}"), server, group.unwrap())
}

fn channel_url(base: &str, group: &GroupResult, member: &str) -> String {
    format!("{base}/groups/{}/participants/{member}/channel", group.id)
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let frame = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read failed");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

/// Read until the server's Close frame, returning the text frames before it.
async fn until_close(ws: &mut WsStream) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close");
        match frame {
            Some(Ok(Message::Text(text))) => frames.push(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return frames,
            Some(Ok(_)) => {}
        }
    }
}

async fn send_json(ws: &mut WsStream, value: &Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn non_member_is_refused() {
    let (base, _server, group) = boot_server(&["a"]).await;
    match connect_async(channel_url(&base, &group, "intruder")).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), 403),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("non-member was upgraded"),
    }
}

#[tokio::test]
async fn members_exchange_messages() {
    let (base, server, group) = boot_server(&["a", "b"]).await;

    let mut a = connect(&channel_url(&base, &group, "a")).await;
    let opened = next_json(&mut a).await;
    assert_eq!(opened["action"], "OPENED");
    assert_eq!(opened["members"], json!(["a", "b"]));
    assert_eq!(opened["channels"], json!(["a"]));

    let mut b = connect(&channel_url(&base, &group, "b")).await;
    let to_b = next_json(&mut b).await;
    assert_eq!(to_b["action"], "OPENED");
    assert_eq!(to_b["channels"], json!(["a", "b"]));
    let to_a = next_json(&mut a).await;
    assert_eq!(to_a["action"], "OPENED");
    assert_eq!(to_a["memberId"], "b");

    // Broadcast arrives verbatim.
    send_json(&mut a, &json!({"move": "e4"})).await;
    assert_eq!(next_json(&mut b).await, json!({"move": "e4"}));

    // Direct message from b reaches a.
    send_json(&mut b, &json!({"recipient": "a", "text": "hi"})).await;
    assert_eq!(next_json(&mut a).await, json!({"recipient": "a", "text": "hi"}));

    // Unknown recipient comes back as an error.
    send_json(&mut a, &json!({"recipient": "zed", "text": "?"})).await;
    let error = next_json(&mut a).await;
    assert_eq!(error["action"], "ERROR");

    assert_eq!(server.dispatchers().len(), 1);
}

#[tokio::test]
async fn session_patch_reaches_peers() {
    let (base, _server, group) = boot_server(&["a", "b"]).await;
    let mut a = connect(&channel_url(&base, &group, "a")).await;
    let _ = next_json(&mut a).await;
    let mut b = connect(&channel_url(&base, &group, "b")).await;
    let _ = next_json(&mut b).await;
    let _ = next_json(&mut a).await;

    send_json(
        &mut a,
        &json!({
            "action": "SESSION",
            "sessionActionId": 1,
            "groupSessionVersion": 1,
            "groupSessionPatches": {"round": 2}
        }),
    )
    .await;

    let ack = next_json(&mut a).await;
    assert_eq!(ack["action"], "SESSION_ACK");
    assert_eq!(ack["sessionActionId"], 1);
    let patch = next_json(&mut b).await;
    assert_eq!(patch["action"], "SESSION");
    assert_eq!(patch["groupSessionPatches"], json!({"round": 2}));
    assert_eq!(patch["groupSessionVersion"], 2);
}

#[tokio::test]
async fn leave_closes_the_socket() {
    let (base, server, group) = boot_server(&["a", "b"]).await;
    let mut a = connect(&channel_url(&base, &group, "a")).await;
    let _ = next_json(&mut a).await;
    let mut b = connect(&channel_url(&base, &group, "b")).await;
    let _ = next_json(&mut b).await;
    let _ = next_json(&mut a).await;

    let batch = Batch::unlimited(BatchId::from_raw("batch"));
    let _ = server.admin().leave(&participant("b"), &batch).unwrap();

    let before_close = until_close(&mut b).await;
    assert_eq!(before_close.last().unwrap()["action"], "CLOSED");

    let left = next_json(&mut a).await;
    assert_eq!(left["action"], "LEFT");
    assert_eq!(left["memberId"], "b");
    let closed = next_json(&mut a).await;
    assert_eq!(closed["action"], "CLOSED");
    assert_eq!(closed["members"], json!(["a"]));
}

#[tokio::test]
async fn shutdown_closes_open_channels() {
    let (base, server, group) = boot_server(&["a"]).await;
    let mut a = connect(&channel_url(&base, &group, "a")).await;
    let _ = next_json(&mut a).await;

    server.shutdown().shutdown();
    let _ = until_close(&mut a).await;
}

#[tokio::test]
async fn graceful_shutdown_waits_for_sessions() {
    let (base, server, group) = boot_server(&["a", "b"]).await;
    let mut a = connect(&channel_url(&base, &group, "a")).await;
    let _ = next_json(&mut a).await;
    let mut b = connect(&channel_url(&base, &group, "b")).await;
    let _ = next_json(&mut b).await;

    server
        .shutdown()
        .graceful_shutdown(Some(Duration::from_secs(5)))
        .await;
    assert_eq!(server.shutdown().active_tasks(), 0);

    let _ = until_close(&mut a).await;
    let _ = until_close(&mut b).await;
}

#[tokio::test]
async fn reassigned_channel_releases_its_first_dispatcher() {
    let config = ServerSettings {
        port: 0,
        ..ServerSettings::default()
    };
    let server = HuddleServer::new(config, GroupStore::open_in_memory().unwrap());
    let pairs = Batch {
        max_active_members: Some(2),
        ..Batch::unlimited(BatchId::from_raw("pairs"))
    };
    let first = server.admin().join(&participant("a"), &pairs).unwrap();
    let _ = server.admin().join(&participant("b"), &pairs).unwrap();
    let second = server.admin().join(&participant("c"), &pairs).unwrap();
    assert_ne!(first.id, second.id);
    let (addr, _handle) = server.listen().await.unwrap();
    let base = format!("ws://{addr}");

    let mut a = connect(&channel_url(&base, &first, "a")).await;
    let _ = next_json(&mut a).await;
    let source = server.dispatchers().get(&first.id).unwrap().downgrade();

    assert!(server.admin().reassign(&participant("a"), &pairs).await.unwrap());
    let opened = next_json(&mut a).await;
    assert_eq!(opened["action"], "OPENED");
    assert_eq!(opened["groupResultId"], second.id.as_str());

    timeout(TIMEOUT, async {
        while source.upgrade().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first dispatcher is still referenced");
    assert!(server.dispatchers().get(&first.id).is_none());
}
