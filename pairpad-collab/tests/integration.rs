//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline in both wire modes.

use futures_util::{SinkExt, StreamExt};
use pairpad_collab::client::{SessionClient, SessionEvent};
use pairpad_collab::hub::{ConnectionState, RoomHub};
use pairpad_collab::protocol::{MessageType, PeerInfo, SyncMessage};
use pairpad_collab::server::{ServerConfig, SyncServer};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return the port and its hub.
async fn start_test_server() -> (u16, Arc<RoomHub>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hub = Arc::new(RoomHub::in_memory());
    let server = SyncServer::new(
        ServerConfig {
            bind_addr: format!("127.0.0.1:{port}"),
        },
        hub.clone(),
    );
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (port, hub)
}

async fn connect_text(port: u16, room: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws/{room}"))
        .await
        .unwrap();
    ws
}

/// Wait until the room has `n` open connections.
async fn wait_for_connections(hub: &RoomHub, room: &str, n: usize) {
    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(handle) = hub.room(room).await {
                if handle.connection_count().await == n {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connections did not settle");
}

/// Next text frame, or None if nothing arrives within `wait`.
async fn recv_text(ws: &mut Ws, wait: Duration) -> Option<String> {
    timeout(wait, async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                return Some(text.as_str().to_string());
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed")
}

/// Skip events until a remote edit arrives.
async fn next_remote_edit(rx: &mut tokio::sync::mpsc::Receiver<SessionEvent>) -> String {
    loop {
        if let SessionEvent::RemoteEdit { text, .. } = next_event(rx).await {
            return text;
        }
    }
}

#[tokio::test]
async fn test_text_fan_out_excludes_sender() {
    let (port, hub) = start_test_server().await;
    let mut a = connect_text(port, "fanout").await;
    let mut b = connect_text(port, "fanout").await;
    let mut c = connect_text(port, "fanout").await;
    wait_for_connections(&hub, "fanout", 3).await;

    a.send(Message::Text("x".into())).await.unwrap();

    assert_eq!(recv_text(&mut b, Duration::from_secs(2)).await.as_deref(), Some("x"));
    assert_eq!(recv_text(&mut c, Duration::from_secs(2)).await.as_deref(), Some("x"));
    assert_eq!(recv_text(&mut a, Duration::from_millis(300)).await, None);
    assert_eq!(recv_text(&mut b, Duration::from_millis(100)).await, None);
}

#[tokio::test]
async fn test_text_both_directions() {
    let (port, hub) = start_test_server().await;
    let mut a = connect_text(port, "test-room").await;
    let mut b = connect_text(port, "test-room").await;
    wait_for_connections(&hub, "test-room", 2).await;

    a.send(Message::Text("print('Hello')".into())).await.unwrap();
    assert_eq!(
        recv_text(&mut b, Duration::from_secs(2)).await.as_deref(),
        Some("print('Hello')")
    );

    b.send(Message::Text("New Line".into())).await.unwrap();
    assert_eq!(recv_text(&mut a, Duration::from_secs(2)).await.as_deref(), Some("New Line"));
}

#[tokio::test]
async fn test_joiner_gets_current_buffer() {
    let (port, hub) = start_test_server().await;
    let mut a = connect_text(port, "late").await;
    let mut b = connect_text(port, "late").await;
    wait_for_connections(&hub, "late", 2).await;

    a.send(Message::Text("state so far".into())).await.unwrap();
    recv_text(&mut b, Duration::from_secs(2)).await;

    let mut late = connect_text(port, "late").await;
    assert_eq!(
        recv_text(&mut late, Duration::from_secs(2)).await.as_deref(),
        Some("state so far")
    );
}

#[tokio::test]
async fn test_empty_room_sends_nothing_on_join() {
    let (port, _hub) = start_test_server().await;
    let mut a = connect_text(port, "quiet").await;
    assert_eq!(recv_text(&mut a, Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_order_preserved_for_receivers() {
    let (port, hub) = start_test_server().await;
    let mut a = connect_text(port, "order").await;
    let mut b = connect_text(port, "order").await;
    wait_for_connections(&hub, "order", 2).await;

    for i in 0..20 {
        a.send(Message::Text(format!("v{i}").into())).await.unwrap();
    }
    for i in 0..20 {
        let got = recv_text(&mut b, Duration::from_secs(2)).await;
        assert_eq!(got, Some(format!("v{i}")));
    }

    let snapshot = hub.room("order").await.unwrap().snapshot().await.unwrap();
    assert_eq!(&*snapshot.buffer, "v19");
    assert_eq!(snapshot.hub_seq, 20);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (port, hub) = start_test_server().await;
    let mut a = connect_text(port, "one").await;
    let mut b = connect_text(port, "two").await;
    wait_for_connections(&hub, "one", 1).await;
    wait_for_connections(&hub, "two", 1).await;

    a.send(Message::Text("private".into())).await.unwrap();
    assert_eq!(recv_text(&mut b, Duration::from_millis(300)).await, None);
}

#[tokio::test]
async fn test_session_clients_sync() {
    let (port, hub) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut alice = SessionClient::new(PeerInfo::new("Alice"), "pair", &url);
    let mut alice_rx = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    assert_eq!(next_event(&mut alice_rx).await, SessionEvent::Opened);
    assert_eq!(alice.connection_state().await, ConnectionState::Open);
    assert!(alice.is_connected());
    wait_for_connections(&hub, "pair", 1).await;

    let mut bob = SessionClient::new(PeerInfo::new("Bob"), "pair", &url);
    let mut bob_rx = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    assert_eq!(next_event(&mut bob_rx).await, SessionEvent::Opened);

    // Alice learns about Bob
    loop {
        if let SessionEvent::PeerJoined(presence) = next_event(&mut alice_rx).await {
            assert_eq!(presence.peer.name, "Bob");
            assert_eq!(presence.peer_count, 2);
            break;
        }
    }

    assert!(alice.local_edit("def main():").await.unwrap());
    assert_eq!(next_remote_edit(&mut bob_rx).await, "def main():");
    assert_eq!(bob.text().await, "def main():");

    // Applying a remote edit never rebroadcasts
    assert_eq!(bob.broadcasts_sent(), 0);
    assert_eq!(alice.broadcasts_sent(), 1);

    assert!(bob.local_edit("def main():\n    pass").await.unwrap());
    assert_eq!(next_remote_edit(&mut alice_rx).await, "def main():\n    pass");
}

#[tokio::test]
async fn test_sender_sees_no_echo() {
    let (port, _hub) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut alice = SessionClient::new(PeerInfo::new("Alice"), "echo", &url);
    let mut alice_rx = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();

    for i in 0..5 {
        alice.local_edit(&format!("line {i}")).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, alice_rx.recv()).await {
        assert!(
            !matches!(event, SessionEvent::RemoteEdit { .. }),
            "own edit came back: {event:?}"
        );
    }
    assert_eq!(alice.text().await, "line 4");
}

#[tokio::test]
async fn test_text_and_binary_clients_share_room() {
    let (port, hub) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut raw = connect_text(port, "mixed").await;
    let mut client = SessionClient::new(PeerInfo::new("Bin"), "mixed", &url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for_connections(&hub, "mixed", 2).await;

    raw.send(Message::Text("from text".into())).await.unwrap();
    assert_eq!(next_remote_edit(&mut rx).await, "from text");

    client.local_edit("from binary").await.unwrap();
    assert_eq!(
        recv_text(&mut raw, Duration::from_secs(2)).await.as_deref(),
        Some("from binary")
    );
}

#[tokio::test]
async fn test_binary_ping_pong() {
    let (port, _hub) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws/hb?wire=binary"))
        .await
        .unwrap();

    let info = PeerInfo::new("Pinger");
    let join = SyncMessage::join("hb", &info).encode().unwrap();
    ws.send(Message::Binary(join.into())).await.unwrap();
    let ping = SyncMessage::ping(info.peer_id).encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();

    let pong = timeout(Duration::from_secs(2), async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                let msg = SyncMessage::decode(&data).unwrap();
                if msg.msg_type == MessageType::Pong {
                    return Some(msg);
                }
            }
        }
        None
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(pong.origin, info.peer_id);
}

#[tokio::test]
async fn test_disconnect_leaves_room() {
    let (port, hub) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut a = SessionClient::new(PeerInfo::new("A"), "leave", &url);
    let mut b = SessionClient::new(PeerInfo::new("B"), "leave", &url);
    let mut b_rx = b.take_event_rx().unwrap();
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    wait_for_connections(&hub, "leave", 2).await;

    a.close().await;
    assert_eq!(a.connection_state().await, ConnectionState::Closed);
    assert!(!a.is_connected());
    wait_for_connections(&hub, "leave", 1).await;

    loop {
        if let SessionEvent::PeerLeft(presence) = next_event(&mut b_rx).await {
            assert_eq!(presence.peer.name, "A");
            assert_eq!(presence.peer_count, 1);
            break;
        }
    }
}

#[tokio::test]
async fn test_reset_connection_leaves_room_under_load() {
    let (port, hub) = start_test_server().await;

    // Linger zero: dropping the socket sends RST instead of FIN
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    #[allow(deprecated)]
    stream.set_linger(Some(Duration::ZERO)).unwrap();
    let (doomed, _) = tokio_tungstenite::client_async(format!("ws://127.0.0.1:{port}/ws/reset"), stream)
        .await
        .unwrap();
    let mut writer = connect_text(port, "reset").await;
    wait_for_connections(&hub, "reset", 2).await;

    drop(doomed);
    for i in 0..500 {
        writer.send(Message::Text(format!("edit {i}").into())).await.unwrap();
    }

    wait_for_connections(&hub, "reset", 1).await;
    assert_eq!(hub.stats().await.active_connections, 1);

    // The survivor is still served
    let mut reader = connect_text(port, "reset").await;
    wait_for_connections(&hub, "reset", 2).await;
    let mut last = None;
    while let Some(text) = recv_text(&mut reader, Duration::from_secs(2)).await {
        let done = text == "edit 499";
        last = Some(text);
        if done {
            break;
        }
    }
    assert_eq!(last.as_deref(), Some("edit 499"));
}

#[tokio::test]
async fn test_closed_client_edits_stay_local() {
    let (port, hub) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut a = SessionClient::new(PeerInfo::new("A"), "offline", &url);
    a.connect().await.unwrap();
    wait_for_connections(&hub, "offline", 1).await;
    a.close().await;

    assert!(!a.local_edit("typed while closed").await.unwrap());
    assert_eq!(a.broadcasts_sent(), 0);

    // Reconnect is a fresh instance that picks up the room's buffer
    let mut again = a.fresh();
    let mut rx = again.take_event_rx().unwrap();
    again.connect().await.unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Opened);
    assert!(again.local_edit("typed after reconnect").await.unwrap());
}

#[tokio::test]
async fn test_bad_path_is_closed() {
    let (port, _hub) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/nope"))
        .await
        .unwrap();
    let next = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
    assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
}
