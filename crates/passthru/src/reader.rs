//! Per-reader controller
//!
//! A [`ReaderController`] owns one reader's register window and the state derived from
//! it. Every operation takes the reader's lock for its whole register transaction, so a
//! control-surface call and an interrupt-driven refresh never interleave.

use std::fmt;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{PassthruError, Result};
use crate::event::StateChange;
use crate::mmio::{DmaBuffer, RegisterWindow};
use crate::regs::{
    Command, ControlWord, Disposition, MAX_ATR_LEN, Protocols, REG_READER_ATR_LEN,
    REG_READER_CONTROL, REG_READER_RX_ADDR, REG_READER_RX_SIZE, REG_READER_STATE,
    REG_READER_TX_ADDR, REG_READER_TX_SIZE, ReaderStatus, ShareMode,
};

/// Answer To Reset of a connected card
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Atr {
    bytes: [u8; MAX_ATR_LEN],
    len: usize,
}

impl Atr {
    /// An empty ATR
    pub const fn empty() -> Self {
        Self {
            bytes: [0; MAX_ATR_LEN],
            len: 0,
        }
    }

    /// Copy at most [`MAX_ATR_LEN`] bytes of `data`
    pub fn from_slice(data: &[u8]) -> Self {
        let mut atr = Self::empty();
        atr.len = data.len().min(MAX_ATR_LEN);
        atr.bytes[..atr.len].copy_from_slice(&data[..atr.len]);
        atr
    }

    /// ATR bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Number of ATR bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the ATR is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    const fn clear(&mut self) {
        self.len = 0;
    }
}

impl Default for Atr {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Atr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atr({})", hex::encode_upper(self.as_bytes()))
    }
}

impl fmt::Display for Atr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::attr::format_hex(self.as_bytes()))
    }
}

/// Result of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new session was opened
    Connected,
    /// A session was already open; nothing was written
    AlreadyConnected,
}

/// Result of a disconnect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The session was closed
    Disconnected,
    /// No session was open; nothing was written
    NotConnected,
}

/// Consistent copy of a reader's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSnapshot {
    /// Reader index
    pub index: u8,
    /// Last observed status word
    pub status: ReaderStatus,
    /// Whether a session is open
    pub connected: bool,
    /// ATR of the connected card
    pub atr: Option<Atr>,
}

/// Device-visible buffers owned by one reader
#[derive(Debug)]
pub struct ReaderBuffers {
    /// Target of the read-ATR command, at least [`MAX_ATR_LEN`] bytes
    pub atr: Box<dyn DmaBuffer>,
    /// Command buffer
    pub tx: Box<dyn DmaBuffer>,
    /// Response buffer
    pub rx: Box<dyn DmaBuffer>,
}

#[derive(Debug)]
struct ReaderState {
    window: Option<RegisterWindow>,
    status: ReaderStatus,
    connected: bool,
    atr: Atr,
    buffers: ReaderBuffers,
}

/// Controller for a single reader
pub struct ReaderController {
    index: u8,
    window_base: usize,
    state: Mutex<ReaderState>,
}

impl fmt::Debug for ReaderController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderController")
            .field("index", &self.index)
            .field("window_base", &format_args!("{:#x}", self.window_base))
            .finish_non_exhaustive()
    }
}

impl ReaderController {
    /// Create a controller over `window` and read its initial status
    pub fn new(index: u8, window: RegisterWindow, buffers: ReaderBuffers) -> Self {
        let window_base = window.base();
        let reader = Self {
            index,
            window_base,
            state: Mutex::new(ReaderState {
                window: Some(window),
                status: ReaderStatus::default(),
                connected: false,
                atr: Atr::empty(),
                buffers,
            }),
        };
        let change = reader.refresh_state();
        debug!(reader = index, status = ?change.current, "reader initialized");
        reader
    }

    /// Position of this reader in its device
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Offset of this reader's register block
    pub const fn window_base(&self) -> usize {
        self.window_base
    }

    /// Whether the register window is still reachable
    pub fn is_attached(&self) -> bool {
        self.state.lock().window.is_some()
    }

    /// Drop the register window and any session
    ///
    /// Waits for an in-flight transaction to finish. Every later operation fails with
    /// [`PassthruError::Detached`] without touching a register.
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        if state.window.take().is_some() {
            state.connected = false;
            state.atr.clear();
            debug!(reader = self.index, "register window released");
        }
    }

    /// Re-read the status word
    ///
    /// An open session is dropped when the card is no longer present.
    pub fn refresh_state(&self) -> StateChange {
        self.state.lock().refresh(self.index)
    }

    /// Open a shared session with the given protocol preference
    pub fn connect(&self, protocols: Protocols) -> Result<ConnectOutcome> {
        self.connect_with(protocols, ShareMode::Shared)
    }

    /// Open a session with an explicit share mode, then fetch the ATR
    pub fn connect_with(
        &self,
        protocols: Protocols,
        share_mode: ShareMode,
    ) -> Result<ConnectOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let window = state
            .window
            .as_ref()
            .ok_or(PassthruError::Detached(self.index))?;
        if state.connected {
            info!(reader = self.index, "already connected");
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        state.ensure_card(self.index)?;

        let word = ControlWord::connect(protocols, share_mode);
        window.write(REG_READER_CONTROL, word.bits());
        state.connected = true;
        state.atr = read_atr(window, &*state.buffers.atr, self.index);

        debug!(
            reader = self.index,
            ?protocols,
            %share_mode,
            atr = ?state.atr,
            "connected"
        );
        Ok(ConnectOutcome::Connected)
    }

    /// Close the session, resetting the card
    pub fn disconnect(&self) -> Result<DisconnectOutcome> {
        self.disconnect_with(Disposition::ResetCard)
    }

    /// Close the session with an explicit disposition
    pub fn disconnect_with(&self, disposition: Disposition) -> Result<DisconnectOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let window = state
            .window
            .as_ref()
            .ok_or(PassthruError::Detached(self.index))?;
        if !state.connected {
            debug!(reader = self.index, "disconnect without a session");
            return Ok(DisconnectOutcome::NotConnected);
        }
        state.ensure_card(self.index)?;

        window.write(REG_READER_CONTROL, ControlWord::disconnect(disposition).bits());
        state.connected = false;
        state.atr.clear();

        debug!(reader = self.index, %disposition, "disconnected");
        Ok(DisconnectOutcome::Disconnected)
    }

    /// Re-run the read-ATR transaction on the open session
    pub fn fetch_atr(&self) -> Result<Atr> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let window = state
            .window
            .as_ref()
            .ok_or(PassthruError::Detached(self.index))?;
        state.ensure_session(self.index)?;
        state.atr = read_atr(window, &*state.buffers.atr, self.index);
        Ok(state.atr)
    }

    /// Send `command` to the card and return at most `rx_capacity` response bytes
    ///
    /// `rx_capacity` is further bounded by the size of the reader's response buffer.
    #[instrument(
        level = "trace",
        skip(self, command),
        fields(reader = self.index, len = command.len())
    )]
    pub fn transmit(&self, command: &[u8], rx_capacity: usize) -> Result<Bytes> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let window = state
            .window
            .as_ref()
            .ok_or(PassthruError::Detached(self.index))?;
        state.ensure_session(self.index)?;

        let buffers = &mut state.buffers;
        let tx_capacity = buffers.tx.capacity();
        if command.len() > tx_capacity {
            return Err(PassthruError::PayloadTooLarge {
                len: command.len(),
                max: tx_capacity,
            });
        }
        let rx_capacity = rx_capacity.min(buffers.rx.capacity());

        trace!(command = %hex::encode(command), "transmitting");
        buffers.tx.write_from(command);

        window.write(REG_READER_TX_ADDR, buffers.tx.bus_address());
        window.write(REG_READER_TX_SIZE, command.len() as u32);
        window.write(REG_READER_RX_ADDR, buffers.rx.bus_address());
        window.write(REG_READER_RX_SIZE, rx_capacity as u32);
        window.write(REG_READER_CONTROL, ControlWord::new(Command::Transmit).bits());

        let reported = window.read(REG_READER_RX_SIZE) as usize;
        let len = reported.min(rx_capacity);
        if len < reported {
            warn!(
                reader = self.index,
                reported, rx_capacity, "response length exceeds capacity, clamping"
            );
        }

        let mut response = vec![0u8; len];
        let copied = buffers.rx.read_into(&mut response);
        response.truncate(copied);

        trace!(response = %hex::encode(&response), "received");
        Ok(Bytes::from(response))
    }

    /// Whether a session is open
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Last observed status word
    pub fn status(&self) -> ReaderStatus {
        self.state.lock().status
    }

    /// ATR of the connected card
    pub fn atr(&self) -> Option<Atr> {
        let state = self.state.lock();
        state.connected.then_some(state.atr)
    }

    /// Copy of the reader state taken under the lock
    pub fn snapshot(&self) -> ReaderSnapshot {
        self.state.lock().snapshot(self.index)
    }

    /// Refresh, then snapshot, as one transaction
    pub fn poll(&self) -> ReaderSnapshot {
        let mut state = self.state.lock();
        state.refresh(self.index);
        state.snapshot(self.index)
    }
}

impl ReaderState {
    fn snapshot(&self, index: u8) -> ReaderSnapshot {
        ReaderSnapshot {
            index,
            status: self.status,
            connected: self.connected,
            atr: self.connected.then_some(self.atr),
        }
    }

    fn refresh(&mut self, index: u8) -> StateChange {
        let previous = self.status;
        if let Some(window) = &self.window {
            self.status = ReaderStatus::from_bits(window.read(REG_READER_STATE));
        } else {
            trace!(reader = index, "refresh on a detached reader");
        }

        let session_lost = self.connected && !self.status.is_present();
        if session_lost {
            self.connected = false;
            self.atr.clear();
            debug!(reader = index, "card removed, session dropped");
        }

        if previous != self.status {
            trace!(reader = index, ?previous, current = ?self.status, "status changed");
        }

        StateChange {
            reader: index,
            previous,
            current: self.status,
            session_lost,
        }
    }

    fn ensure_card(&self, index: u8) -> Result<()> {
        if self.status.is_slot_empty() {
            return Err(PassthruError::CardAbsent(index));
        }
        Ok(())
    }

    fn ensure_session(&self, index: u8) -> Result<()> {
        if !self.connected {
            return Err(PassthruError::NotConnected(index));
        }
        self.ensure_card(index)
    }
}

fn read_atr(window: &RegisterWindow, buffer: &dyn DmaBuffer, index: u8) -> Atr {
    let reported = window.read(REG_READER_ATR_LEN) as usize;
    let len = reported.min(MAX_ATR_LEN).min(buffer.capacity());
    if len < reported {
        warn!(reader = index, reported, "ATR length out of range, clamping");
    }

    window.write(REG_READER_RX_ADDR, buffer.bus_address());
    window.write(REG_READER_RX_SIZE, len as u32);
    window.write(REG_READER_CONTROL, ControlWord::new(Command::ReadAtr).bits());

    let mut bytes = [0u8; MAX_ATR_LEN];
    let copied = buffer.read_into(&mut bytes[..len]);
    Atr::from_slice(&bytes[..copied])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::mock::{MockDma, MockMmio};
    use crate::regs::READER_BLOCK_SIZE;
    use std::sync::Arc;

    const BASE: usize = 0x08;

    fn reader_with(status: u32) -> (Arc<MockMmio>, ReaderController) {
        let mmio = Arc::new(MockMmio::new(BASE + READER_BLOCK_SIZE));
        mmio.set(BASE + REG_READER_STATE, status);
        let window = RegisterWindow::new(mmio.clone(), BASE);
        let buffers = ReaderBuffers {
            atr: Box::new(MockDma::new(0x1000, MAX_ATR_LEN)),
            tx: Box::new(MockDma::new(0x2000, 264)),
            rx: Box::new(MockDma::new(0x3000, 258)),
        };
        (mmio, ReaderController::new(0, window, buffers))
    }

    #[test]
    fn test_initial_refresh() {
        let (mmio, reader) = reader_with(ReaderStatus::PRESENT);
        assert!(reader.status().is_present());
        assert!(!reader.is_connected());
        assert!(mmio.writes().is_empty());
    }

    #[test]
    fn test_connect_writes_control_then_fetches_atr() {
        let (mmio, reader) = reader_with(ReaderStatus::PRESENT);
        mmio.set(BASE + REG_READER_ATR_LEN, 4);

        assert_eq!(reader.connect(Protocols::T1).unwrap(), ConnectOutcome::Connected);
        assert!(reader.is_connected());
        assert_eq!(reader.atr().map(|a| a.len()), Some(4));

        assert_eq!(
            mmio.writes(),
            vec![
                (BASE + REG_READER_CONTROL, 0x1022),
                (BASE + REG_READER_RX_ADDR, 0x1000),
                (BASE + REG_READER_RX_SIZE, 4),
                (BASE + REG_READER_CONTROL, 0x4000),
            ]
        );
    }

    #[test]
    fn test_connect_twice_is_noop() {
        let (mmio, reader) = reader_with(ReaderStatus::PRESENT);
        reader.connect(Protocols::T0).unwrap();
        let writes = mmio.writes().len();

        assert_eq!(
            reader.connect(Protocols::T0).unwrap(),
            ConnectOutcome::AlreadyConnected
        );
        assert_eq!(mmio.writes().len(), writes);
    }

    #[test]
    fn test_connect_without_card() {
        let (mmio, reader) = reader_with(ReaderStatus::EMPTY);
        assert!(matches!(
            reader.connect(Protocols::ANY),
            Err(PassthruError::CardAbsent(0))
        ));
        assert!(!reader.is_connected());
        assert!(mmio.writes().is_empty());
    }

    #[test]
    fn test_atr_length_is_clamped() {
        let (mmio, reader) = reader_with(ReaderStatus::PRESENT);
        mmio.set(BASE + REG_READER_ATR_LEN, 200);
        reader.connect(Protocols::ANY).unwrap();
        assert_eq!(reader.atr().unwrap().len(), MAX_ATR_LEN);
        assert!(mmio.writes().contains(&(BASE + REG_READER_RX_SIZE, MAX_ATR_LEN as u32)));
    }

    #[test]
    fn test_disconnect_resets_card() {
        let (mmio, reader) = reader_with(ReaderStatus::PRESENT);
        mmio.set(BASE + REG_READER_ATR_LEN, 2);
        reader.connect(Protocols::ANY).unwrap();
        mmio.clear_writes();

        assert_eq!(reader.disconnect().unwrap(), DisconnectOutcome::Disconnected);
        assert_eq!(mmio.writes(), vec![(BASE + REG_READER_CONTROL, 0x2100)]);
        assert!(!reader.is_connected());
        assert_eq!(reader.atr(), None);

        assert_eq!(reader.disconnect().unwrap(), DisconnectOutcome::NotConnected);
        assert_eq!(mmio.writes().len(), 1);
    }

    #[test]
    fn test_refresh_drops_session_on_removal() {
        let (mmio, reader) = reader_with(ReaderStatus::PRESENT);
        reader.connect(Protocols::ANY).unwrap();

        mmio.set(BASE + REG_READER_STATE, ReaderStatus::EMPTY);
        let change = reader.refresh_state();
        assert!(change.session_lost);
        assert!(!reader.is_connected());
        assert_eq!(reader.snapshot().atr, None);
    }

    #[test]
    fn test_transmit_requires_session() {
        let (mmio, reader) = reader_with(ReaderStatus::PRESENT);
        assert!(matches!(
            reader.transmit(&[0x00, 0xA4, 0x04, 0x00], 258),
            Err(PassthruError::NotConnected(0))
        ));
        assert!(mmio.writes().is_empty());
    }

    #[test]
    fn test_transmit_sequence_and_clamp() {
        let (mmio, reader) = reader_with(ReaderStatus::PRESENT);
        reader.connect(Protocols::ANY).unwrap();
        mmio.clear_writes();
        // hardware reports more than the caller asked for
        mmio.override_read(BASE + REG_READER_RX_SIZE, 100);

        let response = reader.transmit(&[0x00, 0xB0, 0x00, 0x00], 16).unwrap();
        assert_eq!(response.len(), 16);
        assert_eq!(
            mmio.writes(),
            vec![
                (BASE + REG_READER_TX_ADDR, 0x2000),
                (BASE + REG_READER_TX_SIZE, 4),
                (BASE + REG_READER_RX_ADDR, 0x3000),
                (BASE + REG_READER_RX_SIZE, 16),
                (BASE + REG_READER_CONTROL, 0x8000),
            ]
        );
    }

    #[test]
    fn test_transmit_rejects_oversized_command() {
        let (mmio, reader) = reader_with(ReaderStatus::PRESENT);
        reader.connect(Protocols::ANY).unwrap();
        mmio.clear_writes();

        let err = reader.transmit(&[0u8; 265], 258).unwrap_err();
        assert!(matches!(err, PassthruError::PayloadTooLarge { len: 265, max: 264 }));
        assert!(mmio.writes().is_empty());
    }

    #[test]
    fn test_release_drops_window_and_session() {
        let (mmio, reader) = reader_with(ReaderStatus::PRESENT);
        reader.connect(Protocols::ANY).unwrap();
        assert_eq!(Arc::strong_count(&mmio), 2);

        reader.release();
        mmio.clear_writes();

        assert_eq!(Arc::strong_count(&mmio), 1);
        assert!(!reader.is_attached());
        assert!(!reader.is_connected());
        assert!(matches!(
            reader.connect(Protocols::ANY),
            Err(PassthruError::Detached(0))
        ));
        assert!(matches!(
            reader.transmit(&[0x00], 258),
            Err(PassthruError::Detached(0))
        ));
        assert!(matches!(reader.fetch_atr(), Err(PassthruError::Detached(0))));
        assert!(matches!(reader.disconnect(), Err(PassthruError::Detached(0))));

        mmio.set(BASE + REG_READER_STATE, ReaderStatus::EMPTY);
        let change = reader.refresh_state();
        assert!(!change.is_change());
        assert!(mmio.writes().is_empty());
    }
}
