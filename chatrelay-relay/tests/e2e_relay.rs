use std::time::Duration;

use chatrelay_core::{ImagePayload, Message, RelayEvent, decode_frame, encode_frame};
use chatrelay_relay::{AppState, RelayOptions, build_router};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, WsMessage>;
type WsRead = futures::stream::SplitStream<WsStream>;

struct TestClient {
    id: String,
    write: WsWrite,
    read: WsRead,
}

#[tokio::test]
async fn each_connection_gets_a_distinct_identity() {
    let (address, state, shutdown_tx) = start_relay(RelayOptions::default()).await;

    let client_a = connect_client(&address).await;
    let client_b = connect_client(&address).await;

    assert_eq!(client_a.id.len(), 20);
    assert_ne!(client_a.id, client_b.id);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.connection_count().await, 2);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn message_is_fanned_out_to_everyone_including_sender() {
    let (address, _state, shutdown_tx) = start_relay(RelayOptions::default()).await;

    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;

    let message = Message::new("hi", ImagePayload::None, client_a.id.clone()).expect("message");
    send_event(&mut client_a, &RelayEvent::Message(message.clone())).await;

    let received_b = recv_chat_message(&mut client_b, Duration::from_secs(2))
        .await
        .expect("client B receives message");
    assert_eq!(received_b, message);

    let echoed_a = recv_chat_message(&mut client_a, Duration::from_secs(2))
        .await
        .expect("client A receives its own echo");
    assert_eq!(echoed_a, message);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn echo_can_be_disabled() {
    let options = RelayOptions {
        echo_to_sender: false,
        ..RelayOptions::default()
    };
    let (address, _state, shutdown_tx) = start_relay(options).await;

    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;

    let message = Message::new("quiet", ImagePayload::None, client_a.id.clone()).expect("message");
    send_event(&mut client_a, &RelayEvent::Message(message.clone())).await;

    let received_b = recv_chat_message(&mut client_b, Duration::from_secs(2)).await;
    assert_eq!(received_b, Some(message));

    let echoed_a = recv_chat_message(&mut client_a, Duration::from_millis(400)).await;
    assert!(echoed_a.is_none(), "sender received its own message with echo disabled");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn messages_keep_sender_order() {
    let (address, _state, shutdown_tx) = start_relay(RelayOptions::default()).await;

    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;

    for text in ["one", "two", "three"] {
        let message = Message::new(text, ImagePayload::None, client_a.id.clone()).expect("message");
        send_event(&mut client_a, &RelayEvent::Message(message)).await;
    }

    let mut texts = Vec::new();
    for _ in 0..3 {
        let message = recv_chat_message(&mut client_b, Duration::from_secs(2))
            .await
            .expect("ordered message");
        texts.push(message.text().to_owned());
    }
    assert_eq!(texts, ["one", "two", "three"]);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn malformed_binary_frame_is_dropped_and_not_forwarded() {
    let (address, _state, shutdown_tx) = start_relay(RelayOptions::default()).await;

    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;

    client_a
        .write
        .send(WsMessage::Binary(vec![0xFF, 0x00, 0xAB, 0xCD].into()))
        .await
        .expect("send malformed frame");

    let received_b = recv_chat_message(&mut client_b, Duration::from_millis(500)).await;
    assert!(
        received_b.is_none(),
        "peer unexpectedly received forwarded data from malformed frame"
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn client_sent_connect_event_is_ignored() {
    let (address, _state, shutdown_tx) = start_relay(RelayOptions::default()).await;

    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;

    let spoofed = RelayEvent::Connect(chatrelay_core::ConnectInfo {
        id: "spoofed".to_owned(),
    });
    send_event(&mut client_a, &spoofed).await;

    let message = Message::new("after", ImagePayload::None, client_a.id.clone()).expect("message");
    send_event(&mut client_a, &RelayEvent::Message(message.clone())).await;

    let next = recv_next_event(&mut client_b, Duration::from_secs(2)).await;
    assert_eq!(next, Some(RelayEvent::Message(message)));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn burst_beyond_rate_limit_gets_an_error_notice() {
    let options = RelayOptions {
        burst_capacity: 1.0,
        refill_per_second: 0.0,
        ..RelayOptions::default()
    };
    let (address, _state, shutdown_tx) = start_relay(options).await;

    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;

    for text in ["first", "second"] {
        let message = Message::new(text, ImagePayload::None, client_a.id.clone()).expect("message");
        send_event(&mut client_a, &RelayEvent::Message(message)).await;
    }

    let first = recv_chat_message(&mut client_b, Duration::from_secs(2)).await;
    assert_eq!(first.map(|m| m.text().to_owned()), Some("first".to_owned()));
    let second = recv_chat_message(&mut client_b, Duration::from_millis(400)).await;
    assert!(second.is_none(), "rate-limited message was forwarded");

    let mut saw_notice = false;
    for _ in 0..4 {
        match recv_next_event(&mut client_a, Duration::from_secs(1)).await {
            Some(RelayEvent::Error(notice)) => {
                assert!(notice.message.contains("rate limit"));
                saw_notice = true;
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert!(saw_notice, "sender did not get a rate limit notice");

    let _ = shutdown_tx.send(());
}

async fn start_relay(options: RelayOptions) -> (String, AppState, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral relay socket");
    let address = listener.local_addr().expect("relay local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let state = AppState::with_options(options);
    let server =
        axum::serve(listener, build_router(state.clone())).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("ws://{}/ws", address), state, shutdown_tx)
}

async fn connect_client(ws_url: &str) -> TestClient {
    let (ws_stream, _) = connect_async(ws_url).await.expect("connect websocket");
    let (write, read) = ws_stream.split();
    let mut client = TestClient {
        id: String::new(),
        write,
        read,
    };

    match recv_next_event(&mut client, Duration::from_secs(2)).await {
        Some(RelayEvent::Connect(info)) => client.id = info.id,
        other => panic!("expected connect event first, got {other:?}"),
    }
    client
}

async fn send_event(client: &mut TestClient, event: &RelayEvent) {
    let frame = encode_frame(event).expect("encode event");
    client
        .write
        .send(WsMessage::Binary(frame.into()))
        .await
        .expect("send event");
}

async fn recv_chat_message(client: &mut TestClient, wait: Duration) -> Option<Message> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match recv_next_event(client, remaining).await {
            Some(RelayEvent::Message(message)) => return Some(message),
            Some(_) => continue,
            None => return None,
        }
    }
}

async fn recv_next_event(client: &mut TestClient, wait: Duration) -> Option<RelayEvent> {
    let next = timeout(wait, client.read.next()).await.ok()?;
    let ws_result = next?;
    let message = ws_result.ok()?;

    match message {
        WsMessage::Binary(bytes) => decode_frame(&bytes).ok(),
        _ => None,
    }
}
