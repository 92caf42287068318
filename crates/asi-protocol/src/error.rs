//! Protocol error types.

use thiserror::Error;

/// Errors that can occur when working with the ASI protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A completed command frame could not be decomposed.
    #[error("malformed command: {reason}")]
    MalformedCommand {
        /// What was wrong with the frame.
        reason: String,
    },

    /// The registry is full.
    #[error("signal registry full: capacity {capacity}")]
    CapacityExceeded {
        /// Configured capacity.
        capacity: usize,
    },

    /// A signal index past the end of the registry.
    #[error("signal index {index} out of range (count {count})")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Current signal count.
        count: usize,
    },

    /// A signal name that cannot be put on the wire.
    #[error("invalid signal name: {0:?}")]
    InvalidSignalName(String),

    /// No acknowledgement from a bus address after all probe attempts.
    #[error("bus address {address} did not acknowledge after {attempts} attempts")]
    BusProbeFailed {
        /// Probed address.
        address: u8,
        /// Attempts made.
        attempts: usize,
    },

    /// A subordinate never sent its end sentinel within the burst cap.
    #[error("bus address {address} polled {bursts} bursts without end sentinel")]
    BusPollExhausted {
        /// Polled address.
        address: u8,
        /// Bursts polled.
        bursts: usize,
    },

    /// A received telegram does not follow the published layout.
    #[error("invalid telegram: {0}")]
    InvalidTelegram(String),

    /// Unknown telegram kind byte.
    #[error("unknown telegram kind: 0x{0:02X}")]
    UnknownTelegramKind(u8),

    /// Unknown signal type tag.
    #[error("unknown signal type tag: 0x{0:02X}")]
    UnknownSignalType(u8),

    /// A data entry for an index not present in the last symbol list.
    #[error("data for unknown signal index {0}")]
    UnknownSignalIndex(u16),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedCommand {
            reason: reason.into(),
        }
    }
}

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
