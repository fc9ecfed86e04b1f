use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{SERVER_EVENT_SENDER, SERVER_EVENT_SESSION};
use crate::digest;
use crate::error::ProtocolError;
use crate::types::{ThreadId, ThreadKind};

/// Request method declared in an envelope header. Only `Message` is accepted
/// on the signal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestMethod {
    Message,
    Presence,
    Call,
}

/// Routing header of an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub method: Option<RequestMethod>,
    /// Sender identity (canonical full phone number)
    pub from: String,
    /// Sender device session
    pub from_session: String,
    pub from_username: String,
    pub from_first_name: String,
    pub from_last_name: String,
    /// Recipient identity for SOLO threads, thread id for GROUP threads
    pub to: String,
    /// When non-empty, only these recipient sessions are addressed
    pub to_sessions_whitelist: Vec<String>,
}

/// The verifiable wrapper around an encoded [`SignalMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    /// bincode-encoded [`SignalMessage`]
    pub content: Vec<u8>,
}

impl Envelope {
    pub fn new(header: EnvelopeHeader, message: &SignalMessage) -> Result<Self, ProtocolError> {
        Ok(Self {
            header,
            content: message.to_bytes()?,
        })
    }

    /// Envelope authored by the server itself.
    pub fn system(to: &str, message: &SignalMessage) -> Result<Self, ProtocolError> {
        let header = EnvelopeHeader {
            method: Some(RequestMethod::Message),
            from: SERVER_EVENT_SENDER.to_string(),
            from_session: SERVER_EVENT_SESSION.to_string(),
            to: to.to_string(),
            ..Default::default()
        };
        Self::new(header, message)
    }

    pub fn message(&self) -> Result<SignalMessage, ProtocolError> {
        SignalMessage::from_bytes(&self.content)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn to_base64(&self) -> Result<String, ProtocolError> {
        Ok(STANDARD.encode(self.to_bytes()?))
    }

    pub fn from_base64(s: &str) -> Result<Self, ProtocolError> {
        Self::from_bytes(&STANDARD.decode(s.trim())?)
    }
}

/// Reply to a submitted envelope. `content` carries the server timestamp as
/// 8 big-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeResponse {
    pub header: EnvelopeHeader,
    pub code: u16,
    pub content: Vec<u8>,
}

impl EnvelopeResponse {
    pub fn accepted(header: EnvelopeHeader, server_date: i64) -> Self {
        Self {
            header,
            code: 200,
            content: server_date.to_be_bytes().to_vec(),
        }
    }

    pub fn server_date(&self) -> Option<i64> {
        let bytes: [u8; 8] = self.content.as_slice().try_into().ok()?;
        Some(i64::from_be_bytes(bytes))
    }

    pub fn to_base64(&self) -> Result<String, ProtocolError> {
        Ok(STANDARD.encode(bincode::serialize(self)?))
    }

    pub fn from_base64(s: &str) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(&STANDARD.decode(s.trim())?)?)
    }
}

// ---------------------------------------------------------------------------
// Message kinds and push tiers
// ---------------------------------------------------------------------------

/// Closed set of message kinds. Declaration order is not significant; the
/// urgency order is [`MessageKind::BY_RANK`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Media,
    Typing,
    SeenState,
    Event,
    GroupNotification,
    Call,
}

impl MessageKind {
    /// All kinds, least urgent first.
    pub const BY_RANK: [MessageKind; 7] = [
        MessageKind::Typing,
        MessageKind::SeenState,
        MessageKind::Text,
        MessageKind::Media,
        MessageKind::Event,
        MessageKind::GroupNotification,
        MessageKind::Call,
    ];

    pub fn rank(&self) -> usize {
        Self::BY_RANK
            .iter()
            .position(|k| k == self)
            .unwrap_or(Self::BY_RANK.len())
    }

    /// Ephemeral kinds are relayed but never persisted.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, MessageKind::Typing)
    }

    /// Offline wake-up tier for this kind, `None` when no push is sent.
    pub fn push_tier(&self) -> Option<PushTier> {
        let rank = self.rank();
        if rank <= MessageKind::Typing.rank() {
            None
        } else if rank <= MessageKind::Event.rank() {
            Some(PushTier::Normal)
        } else {
            Some(PushTier::High)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PushTier {
    Normal,
    High,
}

impl PushTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushTier::Normal => "normal",
            PushTier::High => "high",
        }
    }
}

// ---------------------------------------------------------------------------
// Signal message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub thread_id: ThreadId,
    pub msg_id: String,
    pub thread_kind: ThreadKind,
    pub kind: MessageKind,
    /// Client-side creation time (ms)
    pub msg_date: i64,
    /// Server-assigned time (ms), zero until ingested
    pub server_date: i64,
    /// Hex BLAKE3 of `data`
    pub checksum: String,
    pub data: Vec<u8>,
    /// Users that have seen this message, filled on fetch
    pub seen_by: Vec<String>,
}

impl SignalMessage {
    /// Build a message with a checksum computed over `data`.
    pub fn new(
        thread_id: ThreadId,
        msg_id: impl Into<String>,
        thread_kind: ThreadKind,
        kind: MessageKind,
        msg_date: i64,
        data: Vec<u8>,
    ) -> Self {
        Self {
            thread_id,
            msg_id: msg_id.into(),
            thread_kind,
            kind,
            msg_date,
            server_date: 0,
            checksum: digest::payload_checksum(&data),
            data,
            seen_by: Vec::new(),
        }
    }

    pub fn checksum_valid(&self) -> bool {
        digest::checksum_matches(&self.data, &self.checksum)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

// ---------------------------------------------------------------------------
// Payload bodies the server reads or synthesizes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeenState {
    Delivered,
    Seen,
}

/// Body of a [`MessageKind::SeenState`] message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenStateBody {
    pub state: SeenState,
    pub msg_ids: Vec<String>,
}

/// Profile snapshot sent to contacts when a user changes their profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactProfile {
    pub phone_full: String,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub avatar: Option<String>,
}

/// Body of a [`MessageKind::Event`] message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemEvent {
    ContactUpdated(ContactProfile),
    MessagesDeleted {
        thread_id: ThreadId,
        msg_ids: Vec<String>,
        delete_for_all: bool,
    },
    ThreadCleared {
        thread_id: ThreadId,
        delete_for_all: bool,
    },
    ThreadDeleted {
        thread_id: ThreadId,
        delete_for_all: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupChange {
    Created,
    Renamed,
    Left,
    MembersAdded,
    MembersRemoved,
    AdminPromoted,
    AdminRevoked,
}

/// Body of a [`MessageKind::GroupNotification`] message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupNotification {
    pub change: GroupChange,
    pub thread_id: ThreadId,
    pub executor: String,
    pub target_members: Vec<String>,
    pub group_name: String,
    pub creator: Option<String>,
    pub participants: Vec<String>,
    pub last_modified: i64,
}

/// Encode a payload body for [`SignalMessage::data`].
pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::serialize(body)?)
}

pub fn decode_body<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    Ok(bincode::deserialize(data)?)
}
