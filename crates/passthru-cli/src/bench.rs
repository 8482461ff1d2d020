//! Simulated device with every reader registered in an attribute table

use std::sync::Arc;

use eyre::{WrapErr, eyre};
use nexum_pcsc_passthru::event::ReaderEventReceiver;
use nexum_pcsc_passthru::sim::{SimCard, SimulatedPassthru};
use nexum_pcsc_passthru::{
    AttributeTable, PassthruConfig, PassthruDevice, ReaderAttributes, Registrar,
};

/// A card to insert at startup
#[derive(Debug, Clone)]
pub(crate) struct CardSpec {
    pub(crate) slot: usize,
    pub(crate) atr: Vec<u8>,
}

/// Parse `SLOT=ATR`
pub(crate) fn parse_card_spec(input: &str) -> Result<CardSpec, String> {
    let (slot, atr) = input
        .split_once('=')
        .ok_or_else(|| format!("expected SLOT=ATR, got {input:?}"))?;
    let slot = slot
        .trim()
        .parse()
        .map_err(|e| format!("invalid slot {slot:?}: {e}"))?;
    let atr = hex::decode(atr.trim()).map_err(|e| format!("invalid ATR {atr:?}: {e}"))?;
    Ok(CardSpec { slot, atr })
}

pub(crate) struct Bench {
    hardware: SimulatedPassthru,
    table: Arc<AttributeTable>,
    device: PassthruDevice,
    echo: bool,
}

impl Bench {
    pub(crate) fn new(readers: usize, config: PassthruConfig, echo: bool) -> eyre::Result<Self> {
        let hardware = SimulatedPassthru::new(readers);
        let table = Arc::new(AttributeTable::new());
        let registrar: Arc<dyn Registrar> = table.clone();
        let device =
            PassthruDevice::attach_with_registrar(hardware.platform(), config, Some(registrar))
                .wrap_err("failed to attach to simulated device")?;
        Ok(Self {
            hardware,
            table,
            device,
            echo,
        })
    }

    pub(crate) const fn device(&self) -> &PassthruDevice {
        &self.device
    }

    pub(crate) const fn hardware(&self) -> &SimulatedPassthru {
        &self.hardware
    }

    pub(crate) fn subscribe(&self) -> ReaderEventReceiver {
        self.device.subscribe()
    }

    /// Attributes of reader `index`
    pub(crate) fn attrs(&self, index: u8) -> eyre::Result<ReaderAttributes> {
        self.table
            .get(index)
            .wrap_err_with(|| format!("reader {index} is not registered"))
    }

    fn check_slot(&self, slot: usize) -> eyre::Result<()> {
        if slot >= self.device.reader_count() {
            return Err(eyre!(
                "slot {slot} out of range, device has {} readers",
                self.device.reader_count()
            ));
        }
        Ok(())
    }

    pub(crate) fn insert(&self, slot: usize, atr: &[u8]) -> eyre::Result<()> {
        self.check_slot(slot)?;
        let card = SimCard::new(atr);
        let card = if self.echo {
            card.with_responder(|command| [command, &[0x90, 0x00]].concat())
        } else {
            card
        };
        self.hardware.insert_card(slot, card);
        Ok(())
    }

    pub(crate) fn remove(&self, slot: usize) -> eyre::Result<()> {
        self.check_slot(slot)?;
        self.hardware.remove_card(slot);
        Ok(())
    }
}
