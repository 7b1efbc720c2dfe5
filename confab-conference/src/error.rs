use thiserror::Error;

use crate::types::SessionId;

#[derive(Error, Debug)]
pub enum Error {
    /// Offer/answer could not be applied (malformed description, renegotiation race)
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("SDP semantics mismatch: local {local}, remote {remote}")]
    SemanticsMismatch { local: String, remote: String },

    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote side broke the session protocol (duplicate initiate, unauthorized sender)
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Caller misused the API
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Track {0} has been disposed")]
    TrackDisposed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No answer for session {0} within the timeout")]
    AnswerTimeout(SessionId),

    #[error("Session {0} has been terminated")]
    SessionTerminated(SessionId),

    #[error("Conference is not joined")]
    NotJoined,

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Errors that come from the offer/answer exchange itself
    #[must_use]
    pub const fn is_negotiation_failure(&self) -> bool {
        matches!(self, Self::Negotiation(_) | Self::SemanticsMismatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
