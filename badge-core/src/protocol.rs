//! Badge link wire protocol: message types, ids and version.

use std::sync::atomic::{AtomicU8, Ordering};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current protocol version. First byte of every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Identifier multiplexing applications (games) over the one radio channel.
pub type AppId = u16;

/// Rolling message id. The id space is shared by every message kind.
pub type MessageId = u8;

/// One packet on air. `id` is the sender-assigned id, or for [`Message::Ack`]
/// the id being acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: MessageId,
    pub message: Message,
}

impl Frame {
    pub fn new(id: MessageId, message: Message) -> Self {
        Self { id, message }
    }

    /// Ack frames carry the id of the frame they acknowledge.
    pub fn ack(acked_id: MessageId) -> Self {
        Self {
            id: acked_id,
            message: Message::Ack { acked_id },
        }
    }
}

/// All protocol level message kinds. Encoding is bincode; see the wire module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence and display name.
    Beacon { name: String },
    /// Receipt of the frame with `acked_id`.
    Ack { acked_id: MessageId },
    /// Connection request (`accept` true) or the reply to one.
    OpenConnection { app_id: AppId, accept: bool },
    /// Session teardown for `app_id`.
    CloseConnection { app_id: AppId },
    /// Envelope carrying a payload for the connection bound to `app_id`.
    Application { app_id: AppId, payload: Payload },
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Beacon { .. } => "beacon",
            Message::Ack { .. } => "ack",
            Message::OpenConnection { .. } => "open",
            Message::CloseConnection { .. } => "close",
            Message::Application { .. } => "app",
        }
    }
}

/// Payloads exchanged between two connected applications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Liveness probe, answered by the connection stack itself.
    Ping { mark: u32, is_reply: bool },
    /// Application defined payload, see [`AppPayload`].
    App(AppMessage),
}

/// Application payload as carried on air: registered kind name plus its encoded body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMessage {
    pub kind: String,
    pub body: Vec<u8>,
}

/// A typed application payload. Implementors are registered by [`AppPayload::KIND`]
/// in a [`PayloadRegistry`](crate::registry::PayloadRegistry) so receivers accept them.
///
/// ```
/// use badge_core::{AppMessage, AppPayload};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct RpsChoice {
///     choice: u8,
/// }
///
/// impl AppPayload for RpsChoice {
///     const KIND: &'static str = "rps.choice";
/// }
///
/// let msg = AppMessage::encode(&RpsChoice { choice: 2 }).unwrap();
/// assert_eq!(msg.kind, "rps.choice");
/// assert_eq!(msg.decode::<RpsChoice>().unwrap(), RpsChoice { choice: 2 });
/// ```
pub trait AppPayload: Serialize + DeserializeOwned {
    const KIND: &'static str;
}

impl AppMessage {
    pub fn encode<T: AppPayload>(value: &T) -> Result<Self, bincode::Error> {
        Ok(Self {
            kind: T::KIND.to_string(),
            body: bincode::serialize(value)?,
        })
    }

    /// Decode the body as `T`. Fails if the kind differs or the body is malformed.
    pub fn decode<T: AppPayload>(&self) -> Result<T, PayloadError> {
        if self.kind != T::KIND {
            return Err(PayloadError::KindMismatch {
                expected: T::KIND,
                found: self.kind.clone(),
            });
        }
        bincode::deserialize(&self.body).map_err(PayloadError::Body)
    }

    pub fn is<T: AppPayload>(&self) -> bool {
        self.kind == T::KIND
    }
}

/// Error turning an [`AppMessage`] into a typed payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("payload body: {0}")]
    Body(#[from] bincode::Error),
}

/// Rolling id counter shared by everything that sends on one radio.
/// Starts at a random value so ids do not repeat across reboots.
#[derive(Debug)]
pub struct MessageIds {
    next: AtomicU8,
}

impl MessageIds {
    pub fn new() -> Self {
        Self::starting_at(rand::thread_rng().gen())
    }

    pub fn starting_at(first: MessageId) -> Self {
        Self {
            next: AtomicU8::new(first),
        }
    }

    /// Next id; wraps from 255 to 0.
    pub fn next_id(&self) -> MessageId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageIds {
    fn default() -> Self {
        Self::new()
    }
}
