//! Error types for the BLE gateway

use blebridge_core::ProtocolError;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Failure classification reported by a [`BleTransport`](crate::BleTransport)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// The adapter aborted the connection attempt locally; worth retrying
    #[error("Connection aborted by local adapter: {0}")]
    LocalAbort(String),

    /// The adapter does not know the address; a scan may surface it
    #[error("Device not found: {address}")]
    DeviceNotFound { address: String },

    #[error("Device not connected: {address}")]
    NotConnected { address: String },

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Transport error: {0}")]
    Other(String),
}

/// Errors surfaced by links, the pool and device adapters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(TransportFault),

    #[error("Device not found: {address}")]
    DeviceNotFound { address: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{operation} failed after {attempts} attempts")]
    ExhaustedRetries {
        operation: &'static str,
        attempts: u32,
    },

    #[error("Operation cancelled: link disconnected")]
    Cancelled,

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Whether a send loop may absorb this error and try again
    ///
    /// Only transport-level failures qualify. Exhausted retries and
    /// cancellation are terminal, protocol errors are handled where decoded.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::DeviceNotFound { .. })
    }
}

impl From<TransportFault> for GatewayError {
    fn from(fault: TransportFault) -> Self {
        match fault {
            TransportFault::DeviceNotFound { address } => Self::DeviceNotFound { address },
            other => Self::Transport(other),
        }
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
