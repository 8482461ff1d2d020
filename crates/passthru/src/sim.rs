//! Software model of the pass-through hardware
//!
//! [`SimulatedPassthru`] implements [`Platform`] with a register file, a DMA arena and a
//! card model per slot. Control-word writes are executed immediately against the card
//! model, the way the real peer completes a command before the store returns. Every
//! register access is recorded so tests can assert on the exact transaction.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::mmio::{DmaBuffer, IrqHandler, IrqReturn, Mmio, Platform, PlatformError};
use crate::regs::{
    Command, ControlWord, Disposition, HEADER_SIZE, IrqStatus, Protocols, READER_BLOCK_SIZE,
    REG_IRQ_STATUS, REG_NUM_READERS, REG_READER_ATR_LEN, REG_READER_CONTROL, REG_READER_RX_ADDR,
    REG_READER_RX_SIZE, REG_READER_STATE, REG_READER_TX_ADDR, REG_READER_TX_SIZE, ReaderStatus,
    ShareMode, reader_block_offset,
};

/// Bus address of the first byte of simulated DMA memory
pub const SIM_DMA_BASE: u32 = 0x8000_0000;

/// Default amount of simulated DMA memory
pub const SIM_DMA_SIZE: usize = 1 << 20;

/// Computes a card's response to a command
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// A card that can be inserted into a simulated slot
pub struct SimCard {
    atr: Vec<u8>,
    responder: Responder,
}

impl SimCard {
    /// A card with the given ATR that answers every command with `90 00`
    pub fn new(atr: &[u8]) -> Self {
        Self {
            atr: atr.to_vec(),
            responder: Box::new(|_| vec![0x90, 0x00]),
        }
    }

    /// Replace the response function
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    /// The card's ATR
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }
}

impl fmt::Debug for SimCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCard")
            .field("atr", &hex::encode_upper(&self.atr))
            .finish_non_exhaustive()
    }
}

/// One recorded register access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterAccess {
    /// A load
    Read {
        /// Register offset
        offset: usize,
        /// Value returned
        value: u32,
    },
    /// A store
    Write {
        /// Register offset
        offset: usize,
        /// Value stored
        value: u32,
    },
}

#[derive(Debug, Default)]
struct Slot {
    card: Option<SimCard>,
    session: Option<ShareMode>,
    protocols: Protocols,
    unpowered: bool,
    forced_status: Option<u32>,
    last_control: Option<ControlWord>,
    tx_addr: u32,
    tx_size: u32,
    rx_addr: u32,
    rx_size: u32,
}

impl Slot {
    fn status(&self) -> u32 {
        if let Some(bits) = self.forced_status {
            return bits;
        }
        if self.card.is_none() {
            return ReaderStatus::EMPTY;
        }
        let mut bits = ReaderStatus::PRESENT;
        match self.session {
            Some(ShareMode::Shared) => bits |= ReaderStatus::INUSE,
            Some(ShareMode::Exclusive) => bits |= ReaderStatus::EXCLUSIVE,
            Some(ShareMode::Direct) | None => {}
        }
        if self.unpowered {
            bits |= ReaderStatus::UNPOWERED;
        }
        bits
    }
}

#[derive(Debug)]
struct Hardware {
    reported_count: u32,
    irq_status: u32,
    slots: Vec<Slot>,
    arena: Vec<u8>,
    arena_limit: usize,
    log: Vec<RegisterAccess>,
    map_failure: Option<String>,
    irq_failure: Option<String>,
    mapped: bool,
}

impl Hardware {
    fn mapping_len(&self) -> usize {
        reader_block_offset(self.slots.len())
    }

    fn arena_range(&self, addr: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = addr.checked_sub(SIM_DMA_BASE)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.arena.len()).then_some(start..end)
    }

    fn read_arena(&self, addr: u32, len: usize) -> Vec<u8> {
        match self.arena_range(addr, len) {
            Some(range) => self.arena[range].to_vec(),
            None => {
                warn!(addr, len, "simulated DMA read out of range");
                Vec::new()
            }
        }
    }

    fn write_arena(&mut self, addr: u32, data: &[u8]) {
        match self.arena_range(addr, data.len()) {
            Some(range) => self.arena[range].copy_from_slice(data),
            None => warn!(addr, len = data.len(), "simulated DMA write out of range"),
        }
    }

    fn locate(&self, offset: usize) -> Option<(usize, usize)> {
        let rel = offset.checked_sub(HEADER_SIZE)?;
        let slot = rel / READER_BLOCK_SIZE;
        (slot < self.slots.len()).then_some((slot, rel % READER_BLOCK_SIZE))
    }

    fn read32(&mut self, offset: usize) -> u32 {
        let value = match offset {
            REG_NUM_READERS => self.reported_count,
            REG_IRQ_STATUS => self.irq_status,
            _ => match self.locate(offset) {
                Some((index, reg)) => {
                    let slot = &self.slots[index];
                    match reg {
                        REG_READER_STATE => slot.status(),
                        REG_READER_RX_SIZE => slot.rx_size,
                        REG_READER_ATR_LEN => {
                            slot.card.as_ref().map_or(0, |card| card.atr.len() as u32)
                        }
                        _ => 0,
                    }
                }
                None => 0,
            },
        };
        self.log.push(RegisterAccess::Read { offset, value });
        value
    }

    fn write32(&mut self, offset: usize, value: u32) {
        self.log.push(RegisterAccess::Write { offset, value });
        if offset == REG_IRQ_STATUS {
            // write one to clear
            self.irq_status &= !value;
            return;
        }
        let Some((index, reg)) = self.locate(offset) else {
            warn!(offset, value, "store outside any reader block");
            return;
        };
        if reg == REG_READER_CONTROL {
            self.execute(index, ControlWord::from_bits(value));
            return;
        }
        let slot = &mut self.slots[index];
        match reg {
            REG_READER_TX_ADDR => slot.tx_addr = value,
            REG_READER_TX_SIZE => slot.tx_size = value,
            REG_READER_RX_ADDR => slot.rx_addr = value,
            REG_READER_RX_SIZE => slot.rx_size = value,
            _ => debug!(offset, value, "store to read-only register ignored"),
        }
    }

    fn execute(&mut self, index: usize, word: ControlWord) {
        self.slots[index].last_control = Some(word);
        let Some(command) = word.command() else {
            warn!(reader = index, word = word.bits(), "control word without a valid opcode");
            return;
        };
        debug!(reader = index, %command, "simulated command");

        match command {
            Command::Connect => {
                let slot = &mut self.slots[index];
                if slot.card.is_some() {
                    slot.session = Some(word.share_mode().unwrap_or(ShareMode::Shared));
                    slot.protocols = word.protocols();
                    slot.unpowered = false;
                }
            }
            Command::ReadAtr => {
                let slot = &mut self.slots[index];
                let atr = slot
                    .card
                    .as_ref()
                    .map(|card| card.atr.clone())
                    .unwrap_or_default();
                let len = atr.len().min(slot.rx_size as usize);
                slot.rx_size = len as u32;
                let addr = slot.rx_addr;
                self.write_arena(addr, &atr[..len]);
            }
            Command::Transmit => {
                let (tx_addr, tx_size, rx_addr, rx_capacity) = {
                    let slot = &self.slots[index];
                    (slot.tx_addr, slot.tx_size, slot.rx_addr, slot.rx_size)
                };
                let command = self.read_arena(tx_addr, tx_size as usize);
                let slot = &mut self.slots[index];
                let response = match (&mut slot.card, slot.session) {
                    (Some(card), Some(_)) => (card.responder)(&command),
                    _ => Vec::new(),
                };
                let len = response.len().min(rx_capacity as usize);
                slot.rx_size = len as u32;
                self.write_arena(rx_addr, &response[..len]);
            }
            Command::Disconnect => {
                let slot = &mut self.slots[index];
                slot.session = None;
                match word.disposition() {
                    Disposition::LeaveCard | Disposition::ResetCard => {}
                    Disposition::UnpowerCard => slot.unpowered = true,
                    Disposition::EjectCard => {
                        slot.card = None;
                        self.irq_status |= IrqStatus::STATE_CHANGE;
                    }
                }
            }
        }
    }
}

struct Shared {
    hw: Mutex<Hardware>,
    irq: Mutex<Option<IrqHandler>>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("hw", &self.hw)
            .field("irq_installed", &self.irq.lock().is_some())
            .finish()
    }
}

/// Simulated pass-through device
#[derive(Clone)]
pub struct SimulatedPassthru {
    shared: Arc<Shared>,
}

impl fmt::Debug for SimulatedPassthru {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hw = self.shared.hw.lock();
        f.debug_struct("SimulatedPassthru")
            .field("readers", &hw.slots.len())
            .field("irq_status", &hw.irq_status)
            .field("mapped", &hw.mapped)
            .finish_non_exhaustive()
    }
}

impl SimulatedPassthru {
    /// A device with `readers` empty slots
    pub fn new(readers: usize) -> Self {
        let hw = Hardware {
            reported_count: readers as u32,
            irq_status: 0,
            slots: (0..readers).map(|_| Slot::default()).collect(),
            arena: Vec::new(),
            arena_limit: SIM_DMA_SIZE,
            log: Vec::new(),
            map_failure: None,
            irq_failure: None,
            mapped: false,
        };
        Self {
            shared: Arc::new(Shared {
                hw: Mutex::new(hw),
                irq: Mutex::new(None),
            }),
        }
    }

    /// This device as a platform for [`crate::PassthruDevice::attach`]
    pub fn platform(&self) -> Arc<dyn Platform> {
        Arc::new(self.clone())
    }

    /// Insert `card` into slot `index` and raise the interrupt
    pub fn insert_card(&self, index: usize, card: SimCard) {
        {
            let mut hw = self.shared.hw.lock();
            let slot = &mut hw.slots[index];
            slot.card = Some(card);
            slot.session = None;
            slot.unpowered = false;
            hw.irq_status |= IrqStatus::STATE_CHANGE;
        }
        self.fire_irq();
    }

    /// Pull the card out of slot `index` and raise the interrupt
    pub fn remove_card(&self, index: usize) {
        {
            let mut hw = self.shared.hw.lock();
            let slot = &mut hw.slots[index];
            slot.card = None;
            slot.session = None;
            hw.irq_status |= IrqStatus::STATE_CHANGE;
        }
        self.fire_irq();
    }

    /// Invoke the installed interrupt handler if an interrupt is pending
    ///
    /// Must not be called while holding a reader lock.
    pub fn fire_irq(&self) -> Option<IrqReturn> {
        if self.shared.hw.lock().irq_status == 0 {
            return None;
        }
        let handler = self.shared.irq.lock().clone();
        handler.map(|handler| handler())
    }

    /// Report `bits` as the status word of slot `index`, or go back to the card model
    pub fn force_status(&self, index: usize, bits: Option<u32>) {
        self.shared.hw.lock().slots[index].forced_status = bits;
    }

    /// Report `count` in the reader count register without changing the slots
    pub fn set_reported_count(&self, count: u32) {
        self.shared.hw.lock().reported_count = count;
    }

    /// Make the next mappings fail
    pub fn fail_map<S: Into<String>>(&self, reason: S) {
        self.shared.hw.lock().map_failure = Some(reason.into());
    }

    /// Make interrupt requests fail
    pub fn fail_irq<S: Into<String>>(&self, reason: S) {
        self.shared.hw.lock().irq_failure = Some(reason.into());
    }

    /// Limit the DMA arena to `bytes`
    pub fn set_dma_limit(&self, bytes: usize) {
        self.shared.hw.lock().arena_limit = bytes;
    }

    /// Every register access since the last [`Self::clear_accesses`]
    pub fn accesses(&self) -> Vec<RegisterAccess> {
        self.shared.hw.lock().log.clone()
    }

    /// Register stores since the last [`Self::clear_accesses`]
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.shared
            .hw
            .lock()
            .log
            .iter()
            .filter_map(|access| match *access {
                RegisterAccess::Write { offset, value } => Some((offset, value)),
                RegisterAccess::Read { .. } => None,
            })
            .collect()
    }

    /// Forget recorded accesses
    pub fn clear_accesses(&self) {
        self.shared.hw.lock().log.clear();
    }

    /// Pending interrupt bits
    pub fn irq_status(&self) -> u32 {
        self.shared.hw.lock().irq_status
    }

    /// Whether a mapping is currently live
    pub fn is_mapped(&self) -> bool {
        self.shared.hw.lock().mapped
    }

    /// Whether an interrupt handler is installed
    pub fn irq_installed(&self) -> bool {
        self.shared.irq.lock().is_some()
    }

    /// Share mode of the open session in slot `index`
    pub fn session(&self, index: usize) -> Option<ShareMode> {
        self.shared.hw.lock().slots[index].session
    }

    /// Protocols requested by the last connect on slot `index`
    pub fn protocols(&self, index: usize) -> Protocols {
        self.shared.hw.lock().slots[index].protocols
    }

    /// Last control word written to slot `index`
    pub fn last_control(&self, index: usize) -> Option<ControlWord> {
        self.shared.hw.lock().slots[index].last_control
    }
}

impl Platform for SimulatedPassthru {
    fn map(&self, base: u64) -> Result<Arc<dyn Mmio>, PlatformError> {
        let mut hw = self.shared.hw.lock();
        if let Some(reason) = &hw.map_failure {
            return Err(PlatformError::Map(reason.clone()));
        }
        hw.mapped = true;
        debug!(base, len = hw.mapping_len(), "simulated register space mapped");
        Ok(Arc::new(SimMmio {
            shared: self.shared.clone(),
        }))
    }

    fn unmap(&self, mmio: Arc<dyn Mmio>) {
        drop(mmio);
        self.shared.hw.lock().mapped = false;
    }

    fn alloc_dma(&self, len: usize) -> Result<Box<dyn DmaBuffer>, PlatformError> {
        let mut hw = self.shared.hw.lock();
        let start = hw.arena.len();
        if start + len > hw.arena_limit {
            return Err(PlatformError::OutOfMemory { requested: len });
        }
        hw.arena.resize(start + len, 0);
        Ok(Box::new(SimDma {
            shared: self.shared.clone(),
            addr: SIM_DMA_BASE + start as u32,
            len,
        }))
    }

    fn request_irq(&self, handler: IrqHandler) -> Result<(), PlatformError> {
        if let Some(reason) = &self.shared.hw.lock().irq_failure {
            return Err(PlatformError::Irq(reason.clone()));
        }
        *self.shared.irq.lock() = Some(handler);
        Ok(())
    }

    fn free_irq(&self) {
        self.shared.irq.lock().take();
    }
}

#[derive(Debug)]
struct SimMmio {
    shared: Arc<Shared>,
}

impl Mmio for SimMmio {
    fn len(&self) -> usize {
        self.shared.hw.lock().mapping_len()
    }

    fn read32(&self, offset: usize) -> u32 {
        self.shared.hw.lock().read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.shared.hw.lock().write32(offset, value);
    }
}

#[derive(Debug)]
struct SimDma {
    shared: Arc<Shared>,
    addr: u32,
    len: usize,
}

impl DmaBuffer for SimDma {
    fn bus_address(&self) -> u32 {
        self.addr
    }

    fn capacity(&self) -> usize {
        self.len
    }

    fn read_into(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        let data = self.shared.hw.lock().read_arena(self.addr, n);
        out[..data.len()].copy_from_slice(&data);
        data.len()
    }

    fn write_from(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.len);
        self.shared.hw.lock().write_arena(self.addr, &data[..n]);
        n
    }
}
