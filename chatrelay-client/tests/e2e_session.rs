use std::time::Duration;

use chatrelay_client::{
    connection::{ConnectionManager, Endpoint, TransportConfig},
    image_pipeline::{ImagePipeline, RawImage},
    media::PathMediaSource,
    message_log::Side,
    session::{Notice, SendOutcome, SessionController, SessionState},
};
use chatrelay_relay::{AppState, RelayOptions, build_router};
use image::DynamicImage;
use tokio::{net::TcpListener, sync::oneshot, time::timeout};

type Session = SessionController<PathMediaSource>;

#[tokio::test]
async fn two_sessions_exchange_messages_and_echo_is_flagged() {
    let (endpoint, _state, shutdown_tx) = start_relay(RelayOptions::default()).await;
    let mut alice = mounted_session(&endpoint).await;
    let mut bob = mounted_session(&endpoint).await;
    pump_until(&mut alice, |s| s.state() == SessionState::Connected).await;
    pump_until(&mut bob, |s| s.state() == SessionState::Connected).await;
    assert_ne!(alice.identity(), bob.identity());

    let SendOutcome::Sent(sent) = alice.compose_and_send("hello", None).await.unwrap() else {
        panic!("text message must be sent");
    };
    assert_eq!(Some(sent.sender()), alice.identity());

    pump_until(&mut bob, |s| !s.snapshot().is_empty()).await;
    pump_until(&mut alice, |s| s.snapshot().len() == 2).await;

    let received = &bob.snapshot()[0];
    assert_eq!(received.text(), "hello");
    assert_eq!(Some(received.sender()), alice.identity());
    let (side, _) = bob.log().unwrap().view(bob.identity()).next().unwrap();
    assert_eq!(side, Side::Received);

    let alice_texts: Vec<_> = alice.snapshot().iter().map(|m| m.text()).collect();
    assert_eq!(alice_texts, ["hello", "hello"]);
    assert_eq!(alice.stats().likely_echoes, 1);
    assert_eq!(bob.stats().likely_echoes, 0);

    alice.unmount();
    bob.unmount();
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn image_message_arrives_resized() {
    let (endpoint, _state, shutdown_tx) = start_relay(RelayOptions::default()).await;
    let mut alice = mounted_session(&endpoint).await;
    let mut bob = mounted_session(&endpoint).await;
    pump_until(&mut alice, |s| s.state() == SessionState::Connected).await;
    pump_until(&mut bob, |s| s.state() == SessionState::Connected).await;

    let raw = RawImage::Pixels(DynamicImage::new_rgb8(1600, 900));
    alice.compose_and_send("", Some(raw)).await.unwrap();

    pump_until(&mut bob, |s| !s.snapshot().is_empty()).await;
    let message = &bob.snapshot()[0];
    assert_eq!(message.text(), "");
    let encoded = message.image().as_encoded().expect("image attached");
    assert!(encoded.to_data_uri().starts_with("data:image/jpeg;base64,"));
    let decoded = image::load_from_memory(encoded.data()).expect("valid jpeg");
    assert_eq!((decoded.width(), decoded.height()), (800, 450));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn acquire_twice_opens_a_single_relay_connection() {
    let (endpoint, state, shutdown_tx) = start_relay(RelayOptions::default()).await;
    let mut manager = ConnectionManager::new(TransportConfig::default());

    let first = manager.acquire(&endpoint);
    let second = manager.acquire(&endpoint);
    assert!(first.same_connection(&second));

    wait_for(|| first.is_connected()).await;
    for _ in 0..100 {
        if state.connection_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.connection_count().await, 1);

    manager.release();
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn reacquire_after_release_gets_new_identity() {
    let (endpoint, _state, shutdown_tx) = start_relay(RelayOptions::default()).await;
    let mut manager = ConnectionManager::new(TransportConfig::default());

    let first = manager.acquire(&endpoint);
    wait_for(|| first.identity().is_some()).await;
    let first_identity = first.identity();

    manager.release();
    assert!(first.is_released());
    assert_eq!(first.identity(), None);

    let second = manager.acquire(&endpoint);
    assert!(!first.same_connection(&second));
    wait_for(|| second.identity().is_some()).await;
    assert_ne!(second.identity(), first_identity);

    manager.release();
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn unreachable_relay_still_appends_locally() {
    let endpoint = Endpoint::parse("127.0.0.1:1").unwrap();
    let manager = ConnectionManager::new(TransportConfig {
        max_connect_attempts: 1,
        connect_timeout: Duration::from_millis(500),
        backoff_base: Duration::from_millis(10),
    });
    let mut session = Session::new(
        manager,
        endpoint,
        PathMediaSource::new(),
        ImagePipeline::default(),
    );
    session.mount().await.unwrap();

    let SendOutcome::Sent(message) = session.compose_and_send("hi", None).await.unwrap() else {
        panic!("text message must be sent");
    };
    assert_eq!(message.sender(), "");
    assert_eq!(session.snapshot().len(), 1);

    let notices = timeout(Duration::from_secs(10), async {
        loop {
            session.next_event().await.expect("inbox open");
            let notices = session.take_notices();
            if !notices.is_empty() {
                break notices;
            }
        }
    })
    .await
    .expect("connection failure reported");
    assert!(matches!(notices.as_slice(), [Notice::Connection(_)]));
    assert_eq!(session.snapshot().len(), 1);
}

async fn mounted_session(endpoint: &Endpoint) -> Session {
    let mut session = Session::new(
        ConnectionManager::new(TransportConfig::default()),
        endpoint.clone(),
        PathMediaSource::new(),
        ImagePipeline::default(),
    );
    session.mount().await.expect("mount session");
    session
}

async fn pump_until(session: &mut Session, mut done: impl FnMut(&Session) -> bool) {
    timeout(Duration::from_secs(10), async {
        while !done(session) {
            session.next_event().await.expect("inbox open");
        }
    })
    .await
    .expect("session reached expected state in time");
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

async fn start_relay(options: RelayOptions) -> (Endpoint, AppState, oneshot::Sender<()>) {
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

    let endpoint = Endpoint::parse(&address.to_string()).expect("relay endpoint");
    (endpoint, state, shutdown_tx)
}
