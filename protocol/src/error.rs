use thiserror::Error;

use crate::types::Status;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Every way an exchange can fail. Server-side variants are reported back as
/// a status plus reason; client-side variants are attached to the target's
/// envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Request could not be parsed into an envelope
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A field hash is missing or does not match its field
    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    /// Sender signature or nonce rejected by the identity collaborator
    #[error("unverified sender: {0}")]
    Unverified(String),

    #[error("blacklisted: {0}")]
    Blacklisted(String),

    /// Forward logic failed or panicked
    #[error("handler fault: {0}")]
    HandlerFault(String),

    #[error("timed out after {0:.3}s")]
    Timeout(f64),

    /// Receiver went away while a stream was still producing
    #[error("stream cancelled")]
    Cancelled,

    /// Connection-level failure before a complete response
    #[error("transport fault: {0}")]
    TransportFault(String),

    /// Envelope construction rejected by the payload's own rules
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl ProtocolError {
    pub fn status(&self) -> Status {
        match self {
            ProtocolError::MalformedInput(_)
            | ProtocolError::IntegrityMismatch(_)
            | ProtocolError::InvalidEnvelope(_) => Status::BadRequest,
            ProtocolError::Unverified(_) | ProtocolError::Blacklisted(_) => Status::Forbidden,
            ProtocolError::HandlerFault(_) => Status::ServerError,
            ProtocolError::Timeout(_) | ProtocolError::Cancelled => Status::Timeout,
            ProtocolError::TransportFault(_) => Status::Unavailable,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::MalformedInput(err.to_string())
    }
}

impl From<reqwest::Error> for ProtocolError {
    fn from(err: reqwest::Error) -> Self {
        ProtocolError::TransportFault(err.to_string())
    }
}
