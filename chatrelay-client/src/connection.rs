//! Connection lifecycle to the relay.
//!
//! A [`ConnectionManager`] owns at most one live [`ConnectionHandle`]. The
//! handle is cheap to clone and is how the rest of the client subscribes to
//! relay events and emits messages. Everything network-facing runs on spawned
//! tokio tasks; failures surface through `on_disconnect` callbacks and never
//! through the caller of `acquire` or `send`.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chatrelay_core::{Message, RelayEvent, SessionId, decode_frame, encode_frame};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const DEFAULT_WS_PATH: &str = "/ws";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection dropped: {0}")]
    Dropped(String),
    #[error("relay closed the connection")]
    Closed,
    #[error("gave up after {attempts} connect attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Relay address, normalized to a WebSocket URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Accepts `host:port`, `http(s)://host:port` or `ws(s)://host:port/path`.
    /// A missing path becomes `/ws`.
    pub fn parse(raw: &str) -> Result<Self, ConnectionError> {
        let invalid = |reason: String| ConnectionError::InvalidEndpoint {
            endpoint: raw.to_owned(),
            reason,
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("endpoint is empty".to_owned()));
        }

        let candidate = if trimmed.contains("://") {
            trimmed.to_owned()
        } else {
            format!("ws://{trimmed}")
        };
        let mut url = Url::parse(&candidate).map_err(|err| invalid(err.to_string()))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|()| invalid(format!("cannot use scheme {scheme}")))?;

        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host".to_owned()));
        }
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(DEFAULT_WS_PATH);
        }

        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub max_connect_attempts: u32,
    pub connect_timeout: Duration,
    pub backoff_base: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 3,
            connect_timeout: Duration::from_secs(12),
            backoff_base: Duration::from_millis(200),
        }
    }
}

type ConnectCallback = Box<dyn FnMut(&str) + Send>;
type MessageCallback = Box<dyn FnMut(&Message) + Send>;
type DisconnectCallback = Box<dyn FnMut(&ConnectionError) + Send>;
type RelayErrorCallback = Box<dyn FnMut(&str) + Send>;

#[derive(Default)]
struct Callbacks {
    on_connect: Vec<ConnectCallback>,
    on_message: Vec<MessageCallback>,
    on_disconnect: Vec<DisconnectCallback>,
    on_relay_error: Vec<RelayErrorCallback>,
}

struct HandleShared {
    id: u64,
    endpoint: Endpoint,
    // Callbacks run while this lock is held; they must not register more.
    callbacks: Mutex<Callbacks>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    identity: Mutex<Option<SessionId>>,
    released: AtomicBool,
}

impl HandleShared {
    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn with_callbacks(&self, f: impl FnOnce(&mut Callbacks)) {
        if self.is_released() {
            return;
        }
        if let Ok(mut callbacks) = self.callbacks.lock() {
            f(&mut callbacks);
        }
    }

    fn go_live(&self, identity: &str, outbound: mpsc::UnboundedSender<Message>) {
        if let Ok(mut slot) = self.identity.lock() {
            *slot = Some(identity.to_owned());
        }
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = Some(outbound);
        }
        self.with_callbacks(|callbacks| {
            for callback in &mut callbacks.on_connect {
                callback(identity);
            }
        });
    }

    fn go_dark(&self) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = None;
        }
        if let Ok(mut slot) = self.identity.lock() {
            *slot = None;
        }
    }

    fn emit_message(&self, message: &Message) {
        self.with_callbacks(|callbacks| {
            for callback in &mut callbacks.on_message {
                callback(message);
            }
        });
    }

    fn emit_disconnect(&self, error: &ConnectionError) {
        self.with_callbacks(|callbacks| {
            for callback in &mut callbacks.on_disconnect {
                callback(error);
            }
        });
    }

    fn emit_relay_error(&self, message: &str) {
        self.with_callbacks(|callbacks| {
            for callback in &mut callbacks.on_relay_error {
                callback(message);
            }
        });
    }

    fn shutdown(&self) {
        self.released.store(true, Ordering::Release);
        self.go_dark();
        if let Ok(mut callbacks) = self.callbacks.lock() {
            *callbacks = Callbacks::default();
        }
    }
}

/// Shared reference to the relay connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<HandleShared>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.endpoint.as_str())
            .field("identity", &self.identity())
            .field("released", &self.is_released())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Identity assigned by the relay for the live socket, if any.
    pub fn identity(&self) -> Option<SessionId> {
        self.shared.identity.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .outbound
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn is_released(&self) -> bool {
        self.shared.is_released()
    }

    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Called once per successful (re)connect with the new identity.
    pub fn on_connect(&self, callback: impl FnMut(&str) + Send + 'static) {
        self.shared
            .with_callbacks(|callbacks| callbacks.on_connect.push(Box::new(callback)));
    }

    /// Called once per inbound message, in arrival order.
    pub fn on_message(&self, callback: impl FnMut(&Message) + Send + 'static) {
        self.shared
            .with_callbacks(|callbacks| callbacks.on_message.push(Box::new(callback)));
    }

    pub fn on_disconnect(&self, callback: impl FnMut(&ConnectionError) + Send + 'static) {
        self.shared
            .with_callbacks(|callbacks| callbacks.on_disconnect.push(Box::new(callback)));
    }

    pub fn on_relay_error(&self, callback: impl FnMut(&str) + Send + 'static) {
        self.shared
            .with_callbacks(|callbacks| callbacks.on_relay_error.push(Box::new(callback)));
    }

    /// Fire-and-forget. Without a live socket the message is dropped, not queued.
    pub fn send(&self, message: &Message) {
        if self.is_released() {
            debug!(connection = self.shared.id, "send on released connection ignored");
            return;
        }
        let outbound = self.shared.outbound.lock().ok().and_then(|slot| slot.clone());
        match outbound {
            Some(tx) => {
                if tx.send(message.clone()).is_err() {
                    warn!(connection = self.shared.id, "socket closed; outbound message lost");
                }
            }
            None => warn!(
                connection = self.shared.id,
                "relay not connected; outbound message dropped"
            ),
        }
    }
}

struct ActiveConnection {
    handle: ConnectionHandle,
    driver: JoinHandle<()>,
}

/// Owns the single relay connection of a chat screen.
pub struct ConnectionManager {
    config: TransportConfig,
    current: Option<ActiveConnection>,
    next_id: u64,
}

impl ConnectionManager {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            current: None,
            next_id: 0,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Returns the cached handle, or opens a new connection and caches it.
    ///
    /// Must be called from within a tokio runtime. Never blocks and never
    /// fails; connection problems arrive through `on_disconnect`.
    pub fn acquire(&mut self, endpoint: &Endpoint) -> ConnectionHandle {
        if let Some(active) = &self.current {
            if active.handle.endpoint() != endpoint {
                warn!(
                    current = %active.handle.endpoint(),
                    requested = %endpoint,
                    "connection already open; reusing it"
                );
            }
            return active.handle.clone();
        }

        self.next_id += 1;
        let shared = Arc::new(HandleShared {
            id: self.next_id,
            endpoint: endpoint.clone(),
            callbacks: Mutex::new(Callbacks::default()),
            outbound: Mutex::new(None),
            identity: Mutex::new(None),
            released: AtomicBool::new(false),
        });
        let driver = tokio::spawn(run_transport(shared.clone(), self.config.clone()));
        let handle = ConnectionHandle { shared };

        info!(connection = handle.id(), endpoint = %endpoint, "connection acquired");
        self.current = Some(ActiveConnection {
            handle: handle.clone(),
            driver,
        });
        handle
    }

    pub fn current(&self) -> Option<&ConnectionHandle> {
        self.current.as_ref().map(|active| &active.handle)
    }

    /// Closes the connection. The next `acquire` opens a fresh one.
    pub fn release(&mut self) {
        if let Some(active) = self.current.take() {
            active.handle.shared.shutdown();
            active.driver.abort();
            info!(connection = active.handle.id(), "connection released");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.release();
    }
}

async fn run_transport(shared: Arc<HandleShared>, config: TransportConfig) {
    loop {
        let ws_stream = match connect_with_retry(&shared.endpoint, &config).await {
            Ok(ws_stream) => ws_stream,
            Err(err) => {
                error!(connection = shared.id, "{err}");
                shared.emit_disconnect(&err);
                return;
            }
        };

        info!(connection = shared.id, endpoint = %shared.endpoint, "socket open");
        let reason = run_connection(&shared, ws_stream).await;
        if shared.is_released() {
            return;
        }

        warn!(connection = shared.id, "{reason}");
        shared.emit_disconnect(&reason);
        tokio::time::sleep(config.backoff_base).await;
    }
}

async fn connect_with_retry(
    endpoint: &Endpoint,
    config: &TransportConfig,
) -> Result<WsStream, ConnectionError> {
    let max_attempts = config.max_connect_attempts.max(1);
    let mut attempt: u32 = 1;
    loop {
        info!(attempt, max_attempts, endpoint = %endpoint, "connecting");

        let err = match timeout(config.connect_timeout, connect_async(endpoint.as_str())).await {
            Ok(Ok((ws_stream, _))) => return Ok(ws_stream),
            Ok(Err(err)) => ConnectionError::ConnectFailed(err.to_string()),
            Err(_) => ConnectionError::Timeout(config.connect_timeout),
        };
        warn!(attempt, endpoint = %endpoint, "{err}");
        if attempt >= max_attempts {
            return Err(ConnectionError::RetriesExhausted {
                attempts: attempt,
                last: err.to_string(),
            });
        }

        let factor = 1_u32 << (attempt - 1).min(16);
        tokio::time::sleep(config.backoff_base.saturating_mul(factor)).await;
        attempt += 1;
    }
}

/// Pumps one socket until it closes and returns why it closed.
async fn run_connection(shared: &Arc<HandleShared>, ws_stream: WsStream) -> ConnectionError {
    let (write_half, mut read_half) = ws_stream.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
    let send_task = tokio::spawn(network_send_task(write_half, outbound_rx));
    let mut pending_outbound = Some(outbound_tx);

    let reason = loop {
        let message = match read_half.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => break ConnectionError::Dropped(err.to_string()),
            None => break ConnectionError::Closed,
        };

        let data = match message {
            WsMessage::Binary(data) => data,
            WsMessage::Close(_) => break ConnectionError::Closed,
            _ => continue,
        };

        match decode_frame(&data) {
            Ok(RelayEvent::Connect(info)) => match pending_outbound.take() {
                Some(tx) => {
                    info!(connection = shared.id, identity = %info.id, "connected");
                    shared.go_live(&info.id, tx);
                }
                None => warn!(connection = shared.id, "duplicate connect event ignored"),
            },
            Ok(RelayEvent::Message(message)) => {
                debug!(
                    connection = shared.id,
                    sender = %message.sender(),
                    has_image = message.has_image(),
                    "message received"
                );
                shared.emit_message(&message);
            }
            Ok(RelayEvent::Error(notice)) => {
                warn!(connection = shared.id, "relay error: {}", notice.message);
                shared.emit_relay_error(&notice.message);
            }
            Err(err) => warn!(connection = shared.id, "decode frame failed: {err}"),
        }
    };

    shared.go_dark();
    send_task.abort();
    reason
}

async fn network_send_task(
    mut ws_write: futures::stream::SplitSink<WsStream, WsMessage>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        match encode_frame(&RelayEvent::Message(message)) {
            Ok(frame) => {
                if ws_write.send(WsMessage::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("failed to encode outgoing message: {}", err),
        }
    }
}
