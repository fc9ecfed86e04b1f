use thiserror::Error;

/// Reasons an envelope is refused before anything is persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Envelope method is not a message")]
    ProtocolMismatch,

    #[error("Envelope sender does not match the authenticated caller")]
    IdentityMismatch,

    #[error("Payload checksum does not match its content")]
    ChecksumMismatch,

    #[error("Sender is not a participant of thread {0}")]
    NotAMember(String),

    #[error("Embedded thread id {embedded} does not match computed id {computed}")]
    ThreadIdMismatch { embedded: String, computed: String },

    #[error("Group envelope addressed to {to} instead of thread {thread_id}")]
    RecipientMismatch { to: String, thread_id: String },

    #[error("Unknown thread: {0}")]
    UnknownThread(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(e: base64::DecodeError) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}
