//! Driver core for memory-mapped PC/SC pass-through readers
//!
//! A pass-through device exposes one or more smart-card readers through a shared block of
//! 32-bit registers. The host writes a control word to connect, read the ATR, transmit or
//! disconnect, and a peer that speaks the actual card protocol carries out the command.
//! Card insertion and removal are signalled through an interrupt.
//!
//! This crate implements the register protocol and the per-reader state machine on top
//! of a small [`Platform`] boundary (register mapping, DMA memory, interrupt line).
//!
//! # Features
//!
//! - `sim` (default): a software model of the hardware, see [`sim`]
//! - `pcsc`: conversions to and from the `pcsc` crate's flag types
//!
//! # Examples
//!
//! ```
//! # #[cfg(feature = "sim")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use nexum_pcsc_passthru::sim::{SimCard, SimulatedPassthru};
//! use nexum_pcsc_passthru::{PassthruConfig, PassthruDevice, Protocols};
//!
//! let hardware = SimulatedPassthru::new(1);
//! hardware.insert_card(0, SimCard::new(&[0x3B, 0x00]));
//!
//! let device = PassthruDevice::attach(hardware.platform(), PassthruConfig::default())?;
//! let reader = device.reader(0)?;
//! reader.connect(Protocols::ANY)?;
//!
//! let response = reader.transmit(&[0x00, 0xA4, 0x04, 0x00], 258)?;
//! assert_eq!(&response[..], &[0x90, 0x00]);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "sim"))]
//! # fn main() {}
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod attr;
mod config;
mod device;
mod error;
pub mod event;
mod irq;
mod mmio;
#[cfg(feature = "pcsc")]
mod pcsc_compat;
mod reader;
pub mod regs;
#[cfg(feature = "sim")]
pub mod sim;

pub use attr::{AttributeTable, ConnectAction, ReaderAttributes, Registrar, StateReport};
pub use config::{EXTENDED_APDU_MAX, PassthruConfig, PayloadLimit, SHORT_APDU_MAX};
pub use device::PassthruDevice;
pub use error::{PassthruError, Result};
pub use event::{ReaderEvent, StateChange};
pub use irq::InterruptRelay;
pub use mmio::{
    DmaBuffer, GlobalRegisters, IrqHandler, IrqReturn, Mmio, Platform, PlatformError,
    RegisterWindow,
};
pub use reader::{
    Atr, ConnectOutcome, DisconnectOutcome, ReaderBuffers, ReaderController, ReaderSnapshot,
};
pub use regs::{Command, ControlWord, Disposition, IrqStatus, Protocols, ReaderStatus, ShareMode};
