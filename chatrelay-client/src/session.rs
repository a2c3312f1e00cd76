//! Chat screen session: ties the connection, message log, compose area and
//! image pipeline together.
//!
//! Connection callbacks never touch session state directly. They post into
//! the controller's inbox and the task that owns the [`SessionController`]
//! applies them through [`SessionController::next_event`] or
//! [`SessionController::process_pending`], so the log and identity are only
//! ever mutated from one place.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
};

use chatrelay_core::{EncodedImage, ImagePayload, Message, RelayEvent, encode_frame};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionError, ConnectionHandle, ConnectionManager, Endpoint},
    image_pipeline::{ImagePipeline, ImagePipelineError, RawImage},
    media::{MediaKind, MediaSource, Permission, PickOutcome},
    message_log::{MessageLog, Side},
};

const MAX_TRACKED_LOCAL_SENDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    /// Terminal: the screen was unmounted.
    Disconnected,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0} permission denied")]
    PermissionDenied(MediaKind),
    #[error("image pick cancelled")]
    PickCancelled,
    #[error(transparent)]
    ImagePipeline(#[from] ImagePipelineError),
    #[error("session already mounted")]
    AlreadyMounted,
    #[error("session has been torn down")]
    TornDown,
}

/// User-visible notices, drained by the front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    PermissionDenied(MediaKind),
    PickCancelled,
    ImagePipeline(String),
    Connection(String),
    Relay(String),
    Oversized(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::PermissionDenied(kind) => {
                write!(f, "permission to access the {kind} is required")
            }
            Notice::PickCancelled => write!(f, "you did not select any image"),
            Notice::ImagePipeline(reason) => write!(f, "could not prepare image: {reason}"),
            Notice::Connection(reason) => write!(f, "connection problem: {reason}"),
            Notice::Relay(reason) => write!(f, "relay: {reason}"),
            Notice::Oversized(reason) => write!(f, "message too large to send: {reason}"),
        }
    }
}

#[derive(Debug)]
enum SessionEvent {
    Connected {
        identity: String,
    },
    Inbound(Message),
    ConnectionLost(ConnectionError),
    RelayError(String),
    ImageReady {
        pick_id: u64,
        result: Result<EncodedImage, ImagePipelineError>,
    },
}

/// What applying one inbox event changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    StateChanged(SessionState),
    MessageAppended { index: usize, side: Side },
    ImageStaged,
    NoticeRaised,
    /// The event arrived too late or out of turn and was discarded.
    Dropped,
}

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent(Message),
    /// Blank text and no image: nothing was appended or sent.
    Rejected,
    /// Would not fit in one relay frame: nothing was appended or sent.
    TooLarge,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub local_appends: u64,
    pub inbound_appends: u64,
    pub dropped_events: u64,
    /// Inbound messages identical to one of our own optimistic appends.
    pub likely_echoes: u64,
}

pub struct SessionController<M> {
    endpoint: Endpoint,
    manager: ConnectionManager,
    handle: Option<ConnectionHandle>,
    media: M,
    pipeline: ImagePipeline,
    state: SessionState,
    identity: Option<String>,
    log: Option<MessageLog>,
    compose_text: String,
    staged_image: ImagePayload,
    pick_seq: u64,
    granted: HashSet<MediaKind>,
    denial_noticed: HashSet<MediaKind>,
    local_sends: VecDeque<String>,
    notices: Vec<Notice>,
    stats: SessionStats,
    inbox_tx: mpsc::UnboundedSender<SessionEvent>,
    inbox_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl<M: MediaSource> SessionController<M> {
    pub fn new(
        manager: ConnectionManager,
        endpoint: Endpoint,
        media: M,
        pipeline: ImagePipeline,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            endpoint,
            manager,
            handle: None,
            media,
            pipeline,
            state: SessionState::Idle,
            identity: None,
            log: Some(MessageLog::new()),
            compose_text: String::new(),
            staged_image: ImagePayload::None,
            pick_seq: 0,
            granted: HashSet::new(),
            denial_noticed: HashSet::new(),
            local_sends: VecDeque::new(),
            notices: Vec::new(),
            stats: SessionStats::default(),
            inbox_tx,
            inbox_rx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    pub fn log(&self) -> Option<&MessageLog> {
        self.log.as_ref()
    }

    /// Messages in display order; empty once the session is torn down.
    pub fn snapshot(&self) -> &[Message] {
        self.log
            .as_ref()
            .map(MessageLog::snapshot)
            .unwrap_or_default()
    }

    pub fn compose_text(&self) -> &str {
        &self.compose_text
    }

    pub fn set_compose_text(&mut self, text: impl Into<String>) {
        self.compose_text = text.into();
    }

    pub fn staged_image(&self) -> &ImagePayload {
        &self.staged_image
    }

    pub fn clear_staged_image(&mut self) {
        self.staged_image = ImagePayload::None;
    }

    pub fn media_mut(&mut self) -> &mut M {
        &mut self.media
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Screen entry: open the connection, subscribe to it, ask for media access.
    pub async fn mount(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Disconnected => return Err(SessionError::TornDown),
            SessionState::Connecting | SessionState::Connected => {
                return Err(SessionError::AlreadyMounted);
            }
        }

        self.state = SessionState::Connecting;
        let handle = self.manager.acquire(&self.endpoint);
        self.subscribe(&handle);
        info!(connection = handle.id(), endpoint = %self.endpoint, "session mounted");
        self.handle = Some(handle);

        if let Err(err) = self.ensure_permission(MediaKind::Gallery).await {
            debug!("continuing without gallery access: {err}");
        }
        Ok(())
    }

    fn subscribe(&self, handle: &ConnectionHandle) {
        let tx = self.inbox_tx.clone();
        handle.on_connect(move |identity| {
            let _ = tx.send(SessionEvent::Connected {
                identity: identity.to_owned(),
            });
        });

        let tx = self.inbox_tx.clone();
        handle.on_message(move |message| {
            let _ = tx.send(SessionEvent::Inbound(message.clone()));
        });

        let tx = self.inbox_tx.clone();
        handle.on_disconnect(move |error| {
            let _ = tx.send(SessionEvent::ConnectionLost(error.clone()));
        });

        let tx = self.inbox_tx.clone();
        handle.on_relay_error(move |message| {
            let _ = tx.send(SessionEvent::RelayError(message.to_owned()));
        });

        // The socket may have come up before the callbacks were in place.
        if let Some(identity) = handle.identity() {
            let _ = self.inbox_tx.send(SessionEvent::Connected { identity });
        }
    }

    /// Screen exit: release the connection and hand back the torn-down log.
    pub fn unmount(&mut self) -> Option<MessageLog> {
        if self.state == SessionState::Disconnected {
            return None;
        }

        self.state = SessionState::Disconnected;
        self.identity = None;
        self.handle = None;
        self.manager.release();
        self.compose_text.clear();
        self.staged_image = ImagePayload::None;

        info!(
            local_appends = self.stats.local_appends,
            inbound_appends = self.stats.inbound_appends,
            likely_echoes = self.stats.likely_echoes,
            "session unmounted"
        );
        self.log.take()
    }

    /// Waits for the next inbox event and applies it.
    pub async fn next_event(&mut self) -> Option<SessionUpdate> {
        let event = self.inbox_rx.recv().await?;
        Some(self.apply(event))
    }

    /// Applies every event already waiting in the inbox.
    pub fn process_pending(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Ok(event) = self.inbox_rx.try_recv() {
            updates.push(self.apply(event));
        }
        updates
    }

    fn apply(&mut self, event: SessionEvent) -> SessionUpdate {
        if self.state == SessionState::Disconnected {
            self.stats.dropped_events += 1;
            debug!(?event, "event after unmount dropped");
            return SessionUpdate::Dropped;
        }

        match event {
            SessionEvent::Connected { identity } => {
                if self.state == SessionState::Connected
                    && self.identity.as_deref() == Some(identity.as_str())
                {
                    return SessionUpdate::Dropped;
                }
                info!(identity = %identity, "session connected");
                self.identity = Some(identity);
                self.state = SessionState::Connected;
                SessionUpdate::StateChanged(SessionState::Connected)
            }
            SessionEvent::Inbound(message) => {
                if self.state != SessionState::Connected {
                    self.stats.dropped_events += 1;
                    debug!(state = ?self.state, "inbound message before connect dropped");
                    return SessionUpdate::Dropped;
                }
                self.append_inbound(message)
            }
            SessionEvent::ConnectionLost(error) => {
                warn!("session lost its connection: {error}");
                self.identity = None;
                self.notices.push(Notice::Connection(error.to_string()));
                if self.state == SessionState::Connected {
                    self.state = SessionState::Connecting;
                    SessionUpdate::StateChanged(SessionState::Connecting)
                } else {
                    SessionUpdate::NoticeRaised
                }
            }
            SessionEvent::RelayError(message) => {
                self.notices.push(Notice::Relay(message));
                SessionUpdate::NoticeRaised
            }
            SessionEvent::ImageReady { pick_id, result } => {
                if pick_id != self.pick_seq {
                    self.stats.dropped_events += 1;
                    debug!(pick_id, latest = self.pick_seq, "superseded image pick dropped");
                    return SessionUpdate::Dropped;
                }
                match result {
                    Ok(image) => {
                        self.staged_image = ImagePayload::Encoded(image);
                        SessionUpdate::ImageStaged
                    }
                    Err(err) => {
                        warn!("image pipeline failed: {err}");
                        self.notices.push(Notice::ImagePipeline(err.to_string()));
                        SessionUpdate::NoticeRaised
                    }
                }
            }
        }
    }

    fn append_inbound(&mut self, message: Message) -> SessionUpdate {
        let Some(log) = self.log.as_mut() else {
            self.stats.dropped_events += 1;
            return SessionUpdate::Dropped;
        };

        // Echoes are kept; they are only flagged.
        let fingerprint = message.fingerprint();
        if let Some(position) = self.local_sends.iter().position(|f| *f == fingerprint) {
            self.local_sends.remove(position);
            self.stats.likely_echoes += 1;
            warn!(
                sender = %message.sender(),
                "inbound message repeats a local send; it will be displayed twice"
            );
        }

        let side = Side::of(&message, self.identity.as_deref());
        let index = log.append(message);
        self.stats.inbound_appends += 1;
        SessionUpdate::MessageAppended { index, side }
    }

    async fn ensure_permission(&mut self, kind: MediaKind) -> Result<(), SessionError> {
        if self.granted.contains(&kind) {
            return Ok(());
        }
        match self.media.request_permission(kind).await {
            Permission::Granted => {
                self.granted.insert(kind);
                Ok(())
            }
            Permission::Denied => {
                if self.denial_noticed.insert(kind) {
                    warn!(%kind, "media permission denied");
                    self.notices.push(Notice::PermissionDenied(kind));
                }
                Err(SessionError::PermissionDenied(kind))
            }
        }
    }

    /// Picks or captures an image and starts transforming it in the
    /// background. The result is staged when its inbox event is applied.
    pub async fn pick_image(&mut self, kind: MediaKind) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.ensure_permission(kind).await?;

        let outcome = match kind {
            MediaKind::Gallery => self.media.pick_from_gallery().await,
            MediaKind::Camera => self.media.capture_from_camera().await,
        };
        let raw = match outcome {
            PickOutcome::Picked(raw) => raw,
            PickOutcome::Cancelled => {
                self.notices.push(Notice::PickCancelled);
                return Err(SessionError::PickCancelled);
            }
        };

        self.pick_seq += 1;
        let pick_id = self.pick_seq;
        let pipeline = self.pipeline.clone();
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = pipeline.transform(raw).await;
            let _ = tx.send(SessionEvent::ImageReady { pick_id, result });
        });
        debug!(pick_id, %kind, "image transform started");
        Ok(())
    }

    /// Sends `text` with an optional raw image that is transformed first.
    /// The compose area and any staged image are left as they are.
    pub async fn compose_and_send(
        &mut self,
        text: &str,
        raw_image: Option<RawImage>,
    ) -> Result<SendOutcome, SessionError> {
        self.ensure_live()?;

        let image = match raw_image {
            Some(raw) => match self.pipeline.transform(raw).await {
                Ok(image) => ImagePayload::Encoded(image),
                Err(err) => {
                    warn!("send aborted, image pipeline failed: {err}");
                    self.notices.push(Notice::ImagePipeline(err.to_string()));
                    return Err(err.into());
                }
            },
            None => ImagePayload::None,
        };

        Ok(self.dispatch(text.to_owned(), image))
    }

    /// Sends whatever is in the compose area and the staged image slot,
    /// clearing both once the message is out.
    pub fn send_composed(&mut self) -> Result<SendOutcome, SessionError> {
        self.ensure_live()?;
        let text = self.compose_text.clone();
        let image = self.staged_image.clone();
        let outcome = self.dispatch(text, image);
        if let SendOutcome::Sent(_) = outcome {
            self.compose_text.clear();
            self.staged_image = ImagePayload::None;
        }
        Ok(outcome)
    }

    fn dispatch(&mut self, text: String, image: ImagePayload) -> SendOutcome {
        let sender = self.identity.clone().unwrap_or_default();
        let message = match Message::new(text, image, sender) {
            Ok(message) => message,
            Err(err) => {
                debug!("nothing to send: {err}");
                return SendOutcome::Rejected;
            }
        };

        if let Err(err) = encode_frame(&RelayEvent::Message(message.clone())) {
            warn!("send aborted: {err}");
            self.notices.push(Notice::Oversized(err.to_string()));
            return SendOutcome::TooLarge;
        }

        let Some(log) = self.log.as_mut() else {
            return SendOutcome::Rejected;
        };
        log.append(message.clone());
        self.stats.local_appends += 1;

        if self.local_sends.len() == MAX_TRACKED_LOCAL_SENDS {
            self.local_sends.pop_front();
        }
        self.local_sends.push_back(message.fingerprint());

        match &self.handle {
            Some(handle) => handle.send(&message),
            None => debug!("no connection acquired; message kept local"),
        }
        SendOutcome::Sent(message)
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Disconnected {
            return Err(SessionError::TornDown);
        }
        Ok(())
    }
}
