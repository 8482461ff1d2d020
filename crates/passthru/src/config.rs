//! Configuration options for the pass-through driver

use crate::regs::Protocols;

/// Longest short-form command accepted on the transmit path
pub const SHORT_APDU_MAX: usize = 264;
/// Longest extended-form command accepted on the transmit path
pub const EXTENDED_APDU_MAX: usize = 65_541;

/// Upper bound on command length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadLimit {
    /// Short APDUs only (default)
    #[default]
    Short,
    /// Extended-length APDUs
    Extended,
}

impl PayloadLimit {
    /// Maximum command length in bytes
    pub const fn max_command_len(self) -> usize {
        match self {
            Self::Short => SHORT_APDU_MAX,
            Self::Extended => EXTENDED_APDU_MAX,
        }
    }

    /// Default receive capacity: the largest response plus the status word
    pub const fn default_rx_capacity(self) -> usize {
        match self {
            Self::Short => 256 + 2,
            Self::Extended => 65_536 + 2,
        }
    }
}

/// Configuration options for a pass-through device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthruConfig {
    /// Physical base address handed to the mapping primitive
    pub base_address: u64,

    /// Protocols requested when connecting
    pub protocols: Protocols,

    /// Command length limit
    pub payload_limit: PayloadLimit,

    /// Size of each reader's response buffer
    pub rx_capacity: usize,
}

impl Default for PassthruConfig {
    fn default() -> Self {
        Self {
            base_address: 0,
            protocols: Protocols::ANY,
            payload_limit: PayloadLimit::Short,
            rx_capacity: PayloadLimit::Short.default_rx_capacity(),
        }
    }
}

impl PassthruConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the register base address
    pub const fn with_base_address(mut self, base_address: u64) -> Self {
        self.base_address = base_address;
        self
    }

    /// Set the preferred protocols
    pub const fn with_protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }

    /// Set the payload limit, resizing the response buffer to match
    pub const fn with_payload_limit(mut self, limit: PayloadLimit) -> Self {
        self.payload_limit = limit;
        self.rx_capacity = limit.default_rx_capacity();
        self
    }

    /// Set the response buffer size
    pub const fn with_rx_capacity(mut self, rx_capacity: usize) -> Self {
        self.rx_capacity = rx_capacity;
        self
    }

    /// Maximum command length in bytes
    pub const fn max_command_len(&self) -> usize {
        self.payload_limit.max_command_len()
    }
}
