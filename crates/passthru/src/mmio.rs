//! Boundary to the platform: register mapping, DMA memory and the interrupt line

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::regs::IrqStatus;

/// Errors reported by the platform primitives
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// The register space could not be mapped
    #[error("failed to map register space: {0}")]
    Map(String),

    /// No device-visible memory left
    #[error("out of DMA memory ({requested} bytes requested)")]
    OutOfMemory {
        /// Size of the failed request
        requested: usize,
    },

    /// The interrupt line could not be requested
    #[error("failed to request interrupt: {0}")]
    Irq(String),
}

/// A mapped register space
///
/// Accesses are aligned 32-bit loads and stores with bounded latency. They cannot fail
/// once the mapping exists.
pub trait Mmio: Send + Sync + fmt::Debug {
    /// Size of the mapping in bytes
    fn len(&self) -> usize;

    /// Whether the mapping is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the 32-bit register at `offset`
    fn read32(&self, offset: usize) -> u32;

    /// Store `value` into the 32-bit register at `offset`
    fn write32(&self, offset: usize, value: u32);
}

/// Memory the hardware peer reads commands from and writes responses into
pub trait DmaBuffer: Send + fmt::Debug {
    /// Address the hardware uses to reach this buffer
    fn bus_address(&self) -> u32;

    /// Capacity in bytes
    fn capacity(&self) -> usize;

    /// Copy the start of the buffer into `out`, returning the number of bytes copied
    fn read_into(&self, out: &mut [u8]) -> usize;

    /// Copy `data` to the start of the buffer, returning the number of bytes copied
    fn write_from(&mut self, data: &[u8]) -> usize;
}

/// What an interrupt handler reports back to the signal-delivery mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The device had a pending interrupt
    Handled,
    /// Nothing was pending
    None,
}

/// Handler invoked whenever the device asserts its interrupt line
pub type IrqHandler = Arc<dyn Fn() -> IrqReturn + Send + Sync>;

/// Platform services consumed by the device controller
pub trait Platform: Send + Sync + fmt::Debug {
    /// Map the register space at `base`
    fn map(&self, base: u64) -> Result<Arc<dyn Mmio>, PlatformError>;

    /// Release a mapping obtained from [`Platform::map`]
    fn unmap(&self, mmio: Arc<dyn Mmio>);

    /// Allocate `len` bytes of device-visible memory
    fn alloc_dma(&self, len: usize) -> Result<Box<dyn DmaBuffer>, PlatformError>;

    /// Install the interrupt handler
    fn request_irq(&self, handler: IrqHandler) -> Result<(), PlatformError>;

    /// Remove the interrupt handler
    fn free_irq(&self);
}

/// The global header of the register space
#[derive(Debug, Clone)]
pub struct GlobalRegisters {
    mmio: Arc<dyn Mmio>,
}

impl GlobalRegisters {
    /// View the header of `mmio`
    pub fn new(mmio: Arc<dyn Mmio>) -> Self {
        Self { mmio }
    }

    /// Number of readers behind this device
    pub fn reader_count(&self) -> u32 {
        self.mmio.read32(crate::regs::REG_NUM_READERS)
    }

    /// Pending interrupt bits
    pub fn irq_status(&self) -> IrqStatus {
        IrqStatus::from_bits(self.mmio.read32(crate::regs::REG_IRQ_STATUS))
    }

    /// Acknowledge the given interrupt bits
    pub fn ack_irq(&self, status: IrqStatus) {
        self.mmio.write32(crate::regs::REG_IRQ_STATUS, status.bits());
    }
}

/// One reader's block of registers
///
/// Windows are carved out at attach time and never overlap.
#[derive(Clone)]
pub struct RegisterWindow {
    mmio: Arc<dyn Mmio>,
    base: usize,
}

impl RegisterWindow {
    /// View `mmio` starting at `base`
    pub fn new(mmio: Arc<dyn Mmio>, base: usize) -> Self {
        Self { mmio, base }
    }

    /// Offset of this window in the register space
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Load a register relative to the window
    pub fn read(&self, offset: usize) -> u32 {
        let value = self.mmio.read32(self.base + offset);
        trace!(base = self.base, offset, value, "read");
        value
    }

    /// Store a register relative to the window
    pub fn write(&self, offset: usize, value: u32) {
        trace!(base = self.base, offset, value, "write");
        self.mmio.write32(self.base + offset, value);
    }
}

impl fmt::Debug for RegisterWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterWindow")
            .field("base", &format_args!("{:#x}", self.base))
            .finish()
    }
}
