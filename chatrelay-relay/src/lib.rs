use std::{collections::HashMap, sync::Arc, time::Duration, time::Instant};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message as WsMessage},
    response::IntoResponse,
    routing::get,
};
use chatrelay_core::{
    ConnectInfo, MAX_RELAY_FRAME_BYTES, Message, RelayEvent, RelayNotice, SessionId, decode_frame,
    encode_frame,
};
use futures::{SinkExt, StreamExt};
use rand::{Rng, distr::Alphanumeric};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};

const SESSION_ID_LEN: usize = 20;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Connection {
    tx: mpsc::UnboundedSender<WsMessage>,
}

#[derive(Debug, Default)]
struct RelayState {
    connections: HashMap<SessionId, Connection>,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// Deliver a message back to the connection that sent it.
    pub echo_to_sender: bool,
    pub burst_capacity: f64,
    pub refill_per_second: f64,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
            burst_capacity: 24.0,
            refill_per_second: 12.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
    options: RelayOptions,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(RelayOptions::default())
    }

    #[must_use]
    pub fn with_options(options: RelayOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
            options,
        }
    }

    pub fn options(&self) -> RelayOptions {
        self.options
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_RELAY_FRAME_BYTES)
        .max_frame_size(MAX_RELAY_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

fn new_session_id() -> SessionId {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

    // Pongs queued by the read half are only flushed when the write half
    // sends, so the write half pings on its own schedule.
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let session_id = new_session_id();
    let connect = RelayEvent::Connect(ConnectInfo {
        id: session_id.clone(),
    });
    let frame = encode_frame(&connect).map_err(|err| err.to_string())?;
    register_client(
        &state,
        &session_id,
        WsMessage::Binary(frame.into()),
        Connection {
            tx: outbound_tx.clone(),
        },
    )
    .await?;

    info!(session_id = %session_id, "client connected");

    let options = state.options();
    let mut rate_limiter = TokenBucket::new(options.burst_capacity, options.refill_per_second);

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!(session_id = %session_id, "websocket receive error: {}", err);
                break;
            }
        };

        match message {
            WsMessage::Binary(data) => {
                if data.len() > MAX_RELAY_FRAME_BYTES {
                    warn!(session_id = %session_id, "dropping oversized frame");
                    continue;
                }

                let event = match decode_frame(&data) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(session_id = %session_id, "failed to decode frame: {}", err);
                        continue;
                    }
                };

                match event {
                    RelayEvent::Message(chat_message) => {
                        if !rate_limiter.consume(1.0) {
                            warn!(session_id = %session_id, "rate limit exceeded");
                            send_notice(&outbound_tx, "rate limit exceeded, message dropped");
                            continue;
                        }

                        fan_out(&state, &session_id, chat_message).await;
                    }
                    RelayEvent::Connect(_) | RelayEvent::Error(_) => {
                        warn!(session_id = %session_id, "unexpected relay-side event from client");
                    }
                }
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Text(_) => {}
        }
    }

    unregister_client(&state, &session_id).await;
    send_task.abort();
    info!(session_id = %session_id, "client disconnected");
    Ok(())
}

/// Queues the connect frame and registers under one write lock, so every
/// fan-out the client can observe after its connect event reaches it.
async fn register_client(
    state: &AppState,
    session_id: &SessionId,
    connect_frame: WsMessage,
    connection: Connection,
) -> Result<(), String> {
    let mut relay = state.inner.write().await;
    connection
        .tx
        .send(connect_frame)
        .map_err(|_| "client went away before connect".to_owned())?;
    relay.connections.insert(session_id.clone(), connection);
    Ok(())
}

async fn unregister_client(state: &AppState, session_id: &SessionId) {
    let mut relay = state.inner.write().await;
    relay.connections.remove(session_id);
}

/// Forwards a chat message verbatim to every connection. The sender is
/// included unless echo is disabled.
async fn fan_out(state: &AppState, sender_session: &SessionId, message: Message) {
    let echo_to_sender = state.options.echo_to_sender;
    let recipients = {
        let relay = state.inner.read().await;
        relay
            .connections
            .iter()
            .filter(|(session_id, _)| echo_to_sender || *session_id != sender_session)
            .map(|(_, conn)| conn.tx.clone())
            .collect::<Vec<_>>()
    };

    let frame = match encode_frame(&RelayEvent::Message(message)) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to re-encode chat message: {}", err);
            return;
        }
    };

    debug!(
        sender = %sender_session,
        recipients = recipients.len(),
        bytes = frame.len(),
        "fanning out message"
    );
    for tx in recipients {
        let _ = tx.send(WsMessage::Binary(frame.clone().into()));
    }
}

fn send_notice(tx: &mpsc::UnboundedSender<WsMessage>, message: &str) {
    let notice = RelayEvent::Error(RelayNotice {
        message: message.to_owned(),
    });
    match encode_frame(&notice) {
        Ok(frame) => {
            let _ = tx.send(WsMessage::Binary(frame.into()));
        }
        Err(err) => error!("failed to serialize relay notice: {}", err),
    }
}
