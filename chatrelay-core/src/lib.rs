use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAX_RELAY_FRAME_BYTES: usize = 4 * 1024 * 1024;
/// Frame bytes held back for the header, JSON keys, text and sender.
pub const FRAME_ENVELOPE_RESERVE: usize = 64 * 1024;
/// Longest image data URI that still leaves room for the rest of a frame.
pub const MAX_IMAGE_DATA_URI_LEN: usize = MAX_RELAY_FRAME_BYTES - FRAME_ENVELOPE_RESERVE;
pub const MAX_MIME_LEN: usize = 128;
pub const MIME_IMAGE_JPEG: &str = "image/jpeg";
const DATA_URI_SCHEME: &str = "data:";
const DATA_URI_BASE64_MARKER: &str = ";base64,";

/// Relay-assigned identifier of one live connection.
pub type SessionId = String;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("message needs non-blank text or an attached image")]
    Unsendable,
    #[error("image MIME must be non-empty and <= 128 chars")]
    InvalidMime,
    #[error("invalid data URI: {0}")]
    InvalidDataUri(&'static str),
    #[error("invalid base64 image body: {0}")]
    InvalidBase64(String),
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("frame of {size} bytes exceeds {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
    #[error("unsupported event type {0}")]
    UnsupportedEventType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// An image carried inline with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    mime: String,
    data: Bytes,
}

impl EncodedImage {
    pub fn new(mime: impl Into<String>, data: impl Into<Bytes>) -> Result<Self, CoreError> {
        let mime = mime.into();
        validate_mime(&mime)?;
        Ok(Self {
            mime,
            data: data.into(),
        })
    }

    pub fn jpeg(data: impl Into<Bytes>) -> Self {
        Self {
            mime: MIME_IMAGE_JPEG.to_owned(),
            data: data.into(),
        }
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Renders `data:<mime>;base64,<body>`, usable both as a display source and
    /// as the wire payload.
    pub fn to_data_uri(&self) -> String {
        format!(
            "{DATA_URI_SCHEME}{}{DATA_URI_BASE64_MARKER}{}",
            self.mime,
            BASE64.encode(&self.data)
        )
    }

    /// Length of [`EncodedImage::to_data_uri`] without rendering it.
    pub fn data_uri_len(&self) -> usize {
        let body = base64::encoded_len(self.data.len(), true).unwrap_or(usize::MAX);
        (DATA_URI_SCHEME.len() + self.mime.len() + DATA_URI_BASE64_MARKER.len())
            .saturating_add(body)
    }

    pub fn from_data_uri(uri: &str) -> Result<Self, CoreError> {
        let rest = uri
            .strip_prefix(DATA_URI_SCHEME)
            .ok_or(CoreError::InvalidDataUri("missing data: scheme"))?;
        let (mime, body) = rest
            .split_once(DATA_URI_BASE64_MARKER)
            .ok_or(CoreError::InvalidDataUri("missing ;base64, marker"))?;
        validate_mime(mime)?;
        let data = BASE64
            .decode(body.trim())
            .map_err(|err| CoreError::InvalidBase64(err.to_string()))?;
        Ok(Self {
            mime: mime.to_owned(),
            data: Bytes::from(data),
        })
    }
}

fn validate_mime(mime: &str) -> Result<(), CoreError> {
    let trimmed = mime.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_MIME_LEN || trimmed.len() != mime.len() {
        return Err(CoreError::InvalidMime);
    }
    Ok(())
}

/// Attachment slot of a [`Message`]. On the wire this is `string | null`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Option<String>", into = "Option<String>")]
pub enum ImagePayload {
    #[default]
    None,
    Encoded(EncodedImage),
}

impl ImagePayload {
    pub fn is_present(&self) -> bool {
        matches!(self, ImagePayload::Encoded(_))
    }

    pub fn as_encoded(&self) -> Option<&EncodedImage> {
        match self {
            ImagePayload::Encoded(image) => Some(image),
            ImagePayload::None => None,
        }
    }
}

impl From<EncodedImage> for ImagePayload {
    fn from(image: EncodedImage) -> Self {
        ImagePayload::Encoded(image)
    }
}

impl From<Option<EncodedImage>> for ImagePayload {
    fn from(image: Option<EncodedImage>) -> Self {
        image.map_or(ImagePayload::None, ImagePayload::Encoded)
    }
}

impl TryFrom<Option<String>> for ImagePayload {
    type Error = CoreError;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        match value {
            Some(uri) => EncodedImage::from_data_uri(&uri).map(ImagePayload::Encoded),
            None => Ok(ImagePayload::None),
        }
    }
}

impl From<ImagePayload> for Option<String> {
    fn from(payload: ImagePayload) -> Self {
        payload.as_encoded().map(EncodedImage::to_data_uri)
    }
}

/// True when a message with this content may be constructed and sent.
pub fn is_sendable(text: &str, image: &ImagePayload) -> bool {
    !text.trim().is_empty() || image.is_present()
}

/// The unit exchanged with the relay and displayed in the log.
///
/// A `Message` always carries non-blank text or an image; both the constructor
/// and deserialization refuse anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MessageFields")]
pub struct Message {
    text: String,
    image: ImagePayload,
    sender: String,
}

#[derive(Deserialize)]
struct MessageFields {
    #[serde(default)]
    text: String,
    #[serde(default)]
    image: ImagePayload,
    #[serde(default)]
    sender: String,
}

impl TryFrom<MessageFields> for Message {
    type Error = CoreError;

    fn try_from(fields: MessageFields) -> Result<Self, Self::Error> {
        Message::new(fields.text, fields.image, fields.sender)
    }
}

impl Message {
    pub fn new(
        text: impl Into<String>,
        image: impl Into<ImagePayload>,
        sender: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let text = text.into();
        let image = image.into();
        if !is_sendable(&text, &image) {
            return Err(CoreError::Unsendable);
        }
        Ok(Self {
            text,
            image,
            sender: sender.into(),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn image(&self) -> &ImagePayload {
        &self.image
    }

    pub fn has_image(&self) -> bool {
        self.image.is_present()
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Content hash over sender, text and attachment, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sender.as_bytes());
        hasher.update([0]);
        hasher.update(self.text.as_bytes());
        hasher.update([0]);
        if let ImagePayload::Encoded(image) = &self.image {
            hasher.update(image.mime.as_bytes());
            hasher.update([0]);
            hasher.update(&image.data);
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectInfo {
    pub id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayNotice {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connect(ConnectInfo),
    Message(Message),
    Error(RelayNotice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Connect = 0,
    Message = 1,
    Error = 2,
}

pub fn encode_frame(event: &RelayEvent) -> Result<Vec<u8>, CoreError> {
    let (event_type, payload) = match event {
        RelayEvent::Connect(info) => (EventType::Connect, to_json(info)?),
        RelayEvent::Message(message) => (EventType::Message, to_json(message)?),
        RelayEvent::Error(notice) => (EventType::Error, to_json(notice)?),
    };

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    if frame_len + 4 > MAX_RELAY_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            size: frame_len + 4,
            max: MAX_RELAY_FRAME_BYTES,
        });
    }
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(event_type as u8);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<RelayEvent, CoreError> {
    if frame.len() < 5 {
        return Err(CoreError::InvalidFrameLength);
    }
    if frame.len() > MAX_RELAY_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            size: frame.len(),
            max: MAX_RELAY_FRAME_BYTES,
        });
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let event_type = cursor.get_u8();
    let payload = cursor;

    match event_type {
        x if x == EventType::Connect as u8 => Ok(RelayEvent::Connect(from_json(payload)?)),
        x if x == EventType::Message as u8 => Ok(RelayEvent::Message(from_json(payload)?)),
        x if x == EventType::Error as u8 => Ok(RelayEvent::Error(from_json(payload)?)),
        other => Err(CoreError::UnsupportedEventType(other)),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(value).map_err(|err| CoreError::Serialization(err.to_string()))
}

fn from_json<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, CoreError> {
    serde_json::from_slice(payload).map_err(|err| CoreError::Serialization(err.to_string()))
}
