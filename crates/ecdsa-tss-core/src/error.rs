//! Error types for threshold ECDSA protocol execution

use thiserror::Error;

use crate::PartyId;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving or routing a protocol run
#[derive(Debug, Error)]
pub enum Error {
    // ============ Configuration Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Party index outside `[1, n]`
    #[error("Invalid party ID: {0}")]
    InvalidPartyId(PartyId),

    /// Not enough parties to satisfy the threshold
    #[error("Threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// Invalid signing party combination
    #[error("Invalid signing party combination: {0}")]
    InvalidSigningParties(String),

    // ============ Transport Errors ============
    /// Envelope could not be decoded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Wire message exceeds the codec limit
    #[error("Message too large: {size} bytes (limit {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Envelope is well-formed but does not belong to this party or stage
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Transport channel is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    // ============ Protocol Errors ============
    /// Advancing the round machine failed; the run cannot continue
    #[error("Party {party} failed to proceed in round {round}: {source}")]
    ProceedFailed {
        party: PartyId,
        round: u16,
        #[source]
        source: Box<Error>,
    },

    /// Round machine used out of order
    #[error("Protocol state error: {0}")]
    ProtocolState(String),

    /// Message verification failed
    #[error("Message verification failed: {0}")]
    VerificationFailed(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Invalid signature
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    // ============ Runtime Errors ============
    /// Shutdown was requested before the run finished
    #[error("Cancelled")]
    Cancelled,

    /// Timeout waiting for a stage
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error only affects a single message
    ///
    /// Transport errors are logged and the message is dropped; every other
    /// error terminates the run that produced it.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage(_)
                | Error::MessageTooLarge { .. }
                | Error::UnexpectedMessage(_)
                | Error::ChannelClosed(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
