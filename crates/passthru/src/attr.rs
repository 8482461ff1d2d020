//! Control surface handed to the external registration mechanism
//!
//! Each reader exposes three capabilities: a state read, a connect/disconnect write and a
//! transmit write. Inputs arrive as text, the way an attribute file would deliver them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{PassthruError, Result};
use crate::reader::{ConnectOutcome, DisconnectOutcome, ReaderController, ReaderSnapshot};
use crate::regs::Protocols;

/// Format bytes as space-separated uppercase hex pairs
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode space-separated hex pairs such as `"00 A4 04 00"`
///
/// Every token must be exactly two hex digits. Input holding more than `max_len` tokens
/// is rejected before anything is decoded, and tokenizing stops one token past the limit.
pub fn decode_hex_bytes(input: &str, max_len: usize) -> Result<Vec<u8>> {
    let tokens: Vec<&str> = input
        .split_whitespace()
        .take(max_len.saturating_add(1))
        .collect();
    if tokens.is_empty() {
        return Err(PassthruError::decode("no bytes given"));
    }
    if tokens.len() > max_len {
        return Err(PassthruError::PayloadTooLarge {
            len: tokens.len(),
            max: max_len,
        });
    }

    let mut bytes = Vec::with_capacity(tokens.len());
    for (position, token) in tokens.iter().enumerate() {
        if token.len() != 2 {
            return Err(PassthruError::decode(format!(
                "token {position} ({token:?}) is not a hex pair"
            )));
        }
        let mut byte = [0u8; 1];
        hex::decode_to_slice(token, &mut byte).map_err(|e| {
            PassthruError::decode(format!("token {position} ({token:?}): {e}"))
        })?;
        bytes.push(byte[0]);
    }
    Ok(bytes)
}

/// Parse a boolean-like trigger: a decimal, `0x` hex or `0` octal integer
///
/// Any non-zero value requests a connection, zero requests a disconnect.
pub fn parse_connect_flag(input: &str) -> Result<bool> {
    let text = input.trim();
    let parsed = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        u64::from_str_radix(&text[1..], 8)
    } else {
        text.parse::<u64>()
    };
    parsed
        .map(|value| value != 0)
        .map_err(|_| PassthruError::decode(format!("{text:?} is not an integer")))
}

/// Human-readable state report
///
/// One line per set status flag, then the session line, then the ATR when connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateReport(pub ReaderSnapshot);

impl fmt::Display for StateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = &self.0;
        write!(f, "{}", snapshot.status)?;
        if snapshot.connected {
            writeln!(f, "Connected")?;
        } else {
            writeln!(f, "Not connected")?;
        }
        if let Some(atr) = &snapshot.atr {
            writeln!(f, "ATR: {atr}")?;
        }
        Ok(())
    }
}

/// Result of a connect/disconnect write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
    /// Connect was requested
    Connect(ConnectOutcome),
    /// Disconnect was requested
    Disconnect(DisconnectOutcome),
}

/// Capabilities of one reader exposed to the registration mechanism
#[derive(Debug, Clone)]
pub struct ReaderAttributes {
    reader: Arc<ReaderController>,
    protocols: Protocols,
    max_command_len: usize,
    rx_capacity: usize,
}

impl ReaderAttributes {
    /// Expose `reader` with the given connect and transmit parameters
    pub const fn new(
        reader: Arc<ReaderController>,
        protocols: Protocols,
        max_command_len: usize,
        rx_capacity: usize,
    ) -> Self {
        Self {
            reader,
            protocols,
            max_command_len,
            rx_capacity,
        }
    }

    /// Index of the exposed reader
    pub fn index(&self) -> u8 {
        self.reader.index()
    }

    /// The underlying controller
    pub const fn reader(&self) -> &Arc<ReaderController> {
        &self.reader
    }

    /// Refresh the reader and render its state
    pub fn read_state(&self) -> String {
        StateReport(self.reader.poll()).to_string()
    }

    /// Connect on a non-zero value, disconnect on zero
    pub fn write_connect(&self, input: &str) -> Result<ConnectAction> {
        if parse_connect_flag(input)? {
            self.reader
                .connect(self.protocols)
                .map(ConnectAction::Connect)
        } else {
            self.reader.disconnect().map(ConnectAction::Disconnect)
        }
    }

    /// Decode hex input and send it to the card
    ///
    /// Malformed input fails before any register is touched.
    pub fn write_transmit(&self, input: &str) -> Result<Bytes> {
        let command = decode_hex_bytes(input, self.max_command_len)?;
        trace!(reader = self.index(), len = command.len(), "transmit attribute");
        self.reader.transmit(&command, self.rx_capacity)
    }
}

/// External registration mechanism
pub trait Registrar: Send + Sync + fmt::Debug {
    /// Publish a reader's capabilities
    fn register(&self, attrs: ReaderAttributes) -> Result<()>;

    /// Withdraw the capabilities of reader `index`
    fn deregister(&self, index: u8);
}

/// In-memory registrar keyed by reader index
#[derive(Debug, Default)]
pub struct AttributeTable {
    entries: Mutex<BTreeMap<u8, ReaderAttributes>>,
}

impl AttributeTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the attributes of reader `index`
    pub fn get(&self, index: u8) -> Result<ReaderAttributes> {
        self.entries
            .lock()
            .get(&index)
            .cloned()
            .ok_or(PassthruError::ReaderNotFound(index as usize))
    }

    /// Indices of all registered readers
    pub fn indices(&self) -> Vec<u8> {
        self.entries.lock().keys().copied().collect()
    }

    /// Number of registered readers
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no reader is registered
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Registrar for AttributeTable {
    fn register(&self, attrs: ReaderAttributes) -> Result<()> {
        let index = attrs.index();
        let mut entries = self.entries.lock();
        if entries.contains_key(&index) {
            return Err(PassthruError::Registration(format!(
                "reader {index} is already registered"
            )));
        }
        debug!(reader = index, "attributes registered");
        entries.insert(index, attrs);
        Ok(())
    }

    fn deregister(&self, index: u8) {
        if self.entries.lock().remove(&index).is_some() {
            debug!(reader = index, "attributes removed");
        }
    }
}
