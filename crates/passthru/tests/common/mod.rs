//! Common test utilities

#![allow(dead_code)]

use std::sync::Arc;

use nexum_pcsc_passthru::sim::{SimCard, SimulatedPassthru};
use nexum_pcsc_passthru::{AttributeTable, PassthruConfig, PassthruDevice, Registrar};

/// ATR used by the test cards
pub const TEST_ATR: [u8; 2] = [0x3B, 0x00];

/// A card answering every command with `90 00`
pub fn test_card() -> SimCard {
    SimCard::new(&TEST_ATR)
}

/// A card echoing the command followed by `90 00`
pub fn echo_card() -> SimCard {
    SimCard::new(&TEST_ATR).with_responder(|command| [command, &[0x90, 0x00]].concat())
}

/// Attach to a simulated device with `readers` empty slots
pub fn attach(readers: usize) -> (SimulatedPassthru, PassthruDevice) {
    attach_with_config(readers, PassthruConfig::default())
}

/// Attach to a simulated device with `readers` empty slots and `config`
pub fn attach_with_config(
    readers: usize,
    config: PassthruConfig,
) -> (SimulatedPassthru, PassthruDevice) {
    let hardware = SimulatedPassthru::new(readers);
    let device = PassthruDevice::attach(hardware.platform(), config).expect("attach");
    (hardware, device)
}

/// Attach with an [`AttributeTable`] as registrar
pub fn attach_registered(
    readers: usize,
) -> (SimulatedPassthru, Arc<AttributeTable>, PassthruDevice) {
    let hardware = SimulatedPassthru::new(readers);
    let table = Arc::new(AttributeTable::new());
    let registrar: Arc<dyn Registrar> = table.clone();
    let device = PassthruDevice::attach_with_registrar(
        hardware.platform(),
        PassthruConfig::default(),
        Some(registrar),
    )
    .expect("attach");
    (hardware, table, device)
}
