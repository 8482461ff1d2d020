//! Error types for the pass-through driver

use crate::mmio::PlatformError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, PassthruError>;

/// Errors surfaced by the driver core
#[derive(Debug, thiserror::Error)]
pub enum PassthruError {
    /// The register space could not be mapped, or the mapping cannot hold the readers
    #[error("Register space unavailable: {0}")]
    Mapping(String),

    /// Per-reader storage could not be obtained
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// The interrupt line could not be requested
    #[error("Interrupt registration failed: {0}")]
    Interrupt(String),

    /// The operation was attempted while the slot reports no card
    #[error("No card present in reader {0}")]
    CardAbsent(u8),

    /// The operation requires an active session
    #[error("Reader {0} is not connected")]
    NotConnected(u8),

    /// Malformed control-surface input
    #[error("Decode error: {0}")]
    Decode(String),

    /// Command does not fit the transmit buffer
    #[error("Payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Length of the rejected payload
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// The reader's device has been detached; no register is reachable
    #[error("Reader {0} is detached")]
    Detached(u8),

    /// No reader with this index
    #[error("Reader not found: {0}")]
    ReaderNotFound(usize),

    /// The external registration mechanism rejected a reader
    #[error("Registration failed: {0}")]
    Registration(String),
}

impl PassthruError {
    /// Create a decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode(message.into())
    }

    /// Whether the caller may retry after correcting input or card state
    ///
    /// Mapping, allocation and interrupt failures abort attach and are not recoverable,
    /// and neither is any operation on a detached reader.
    pub const fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Mapping(_) | Self::Allocation(_) | Self::Interrupt(_) | Self::Detached(_)
        )
    }
}

impl From<PlatformError> for PassthruError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Map(msg) => Self::Mapping(msg),
            PlatformError::OutOfMemory { requested } => {
                Self::Allocation(format!("no DMA memory for {requested} bytes"))
            }
            PlatformError::Irq(msg) => Self::Interrupt(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_errors_map_to_fatal_variants() {
        let err: PassthruError = PlatformError::Map("no resource".into()).into();
        assert!(matches!(err, PassthruError::Mapping(_)));
        assert!(!err.is_recoverable());

        let err: PassthruError = PlatformError::OutOfMemory { requested: 33 }.into();
        assert!(matches!(err, PassthruError::Allocation(ref m) if m.contains("33")));
        assert!(!err.is_recoverable());

        assert!(!PassthruError::Detached(2).is_recoverable());
    }

    #[test]
    fn test_control_errors_are_recoverable() {
        assert!(PassthruError::CardAbsent(0).is_recoverable());
        assert!(PassthruError::NotConnected(1).is_recoverable());
        assert!(PassthruError::decode("bad token").is_recoverable());
        assert_eq!(
            PassthruError::NotConnected(1).to_string(),
            "Reader 1 is not connected"
        );
    }
}
