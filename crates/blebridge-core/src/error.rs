//! Error types for the secure device protocol
//!
//! Every variant here is a protocol-level failure: a frame that cannot be
//! trusted, a message that cannot be built, or an operation attempted in the
//! wrong handshake state. Transport failures live in `blebridge-ble`.

use thiserror::Error;

use crate::session::HandshakeState;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors produced while building, parsing or authenticating protocol messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("CRC16 mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { received: u16, computed: u16 },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown security flag: {0}")]
    UnknownSecurityFlag(u8),

    #[error("No key negotiated yet for security flag {0}")]
    KeyUnavailable(u8),

    #[error("Ciphertext could not be decrypted: {0}")]
    Decrypt(String),

    #[error("Unsupported protocol version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Session is not paired")]
    NotPaired,

    #[error("Invalid handshake state: expected {expected:?}, got {actual:?}")]
    InvalidHandshakeState {
        expected: HandshakeState,
        actual: HandshakeState,
    },

    #[error("Sequence counter exhausted")]
    SequenceExhausted,

    #[error("Invalid device credentials: {0}")]
    InvalidCredentials(String),

    #[error("Data point {id} value too large: {len} bytes")]
    ValueTooLarge { id: u8, len: usize },
}

impl ProtocolError {
    /// Shorthand for [`ProtocolError::Malformed`]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

/// Result type for protocol operations
pub type Result<T> = core::result::Result<T, ProtocolError>;
