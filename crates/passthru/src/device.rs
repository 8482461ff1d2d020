//! Device controller
//!
//! Owns the register mapping and the reader controllers carved out of it. Attach maps the
//! register space, discovers the readers, exposes them to the registrar and installs the
//! interrupt handler; detach undoes each step in reverse order.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::attr::{ReaderAttributes, Registrar};
use crate::config::PassthruConfig;
use crate::error::{PassthruError, Result};
use crate::event::{EventBus, ReaderEventReceiver, ReaderEventSender};
use crate::irq::InterruptRelay;
use crate::mmio::{GlobalRegisters, IrqReturn, Mmio, Platform, RegisterWindow};
use crate::reader::{ReaderBuffers, ReaderController};
use crate::regs::{MAX_ATR_LEN, reader_block_offset};

/// An attached pass-through device
#[derive(Debug)]
pub struct PassthruDevice {
    platform: Arc<dyn Platform>,
    config: PassthruConfig,
    mmio: Option<Arc<dyn Mmio>>,
    readers: Vec<Arc<ReaderController>>,
    registrar: Option<Arc<dyn Registrar>>,
    registered: Vec<bool>,
    relay: Arc<InterruptRelay>,
    events: Arc<EventBus>,
    irq_requested: bool,
}

impl PassthruDevice {
    /// Attach to the device described by `config`
    pub fn attach(platform: Arc<dyn Platform>, config: PassthruConfig) -> Result<Self> {
        Self::attach_with_registrar(platform, config, None)
    }

    /// Attach and publish every reader's capabilities through `registrar`
    ///
    /// A reader the registrar rejects stays usable through [`Self::reader`]; the failure
    /// is logged and attach carries on.
    #[instrument(level = "debug", skip_all, fields(base = config.base_address))]
    pub fn attach_with_registrar(
        platform: Arc<dyn Platform>,
        config: PassthruConfig,
        registrar: Option<Arc<dyn Registrar>>,
    ) -> Result<Self> {
        let mmio = platform.map(config.base_address)?;
        let global = GlobalRegisters::new(mmio.clone());

        let readers = match populate_readers(platform.as_ref(), &mmio, &global, &config) {
            Ok(readers) => readers,
            Err(err) => {
                drop(global);
                platform.unmap(mmio);
                return Err(err);
            }
        };

        let events = Arc::new(EventBus::new());
        let relay = Arc::new(InterruptRelay::new(global, readers.clone(), events.clone()));

        let mut device = Self {
            registered: vec![false; readers.len()],
            platform,
            config,
            mmio: Some(mmio),
            readers,
            registrar,
            relay,
            events,
            irq_requested: false,
        };

        device.register_readers();

        // on failure, dropping `device` unwinds registrations and the mapping
        device
            .platform
            .request_irq(device.relay.clone().into_handler())?;
        device.irq_requested = true;

        info!(readers = device.readers.len(), "pcsc passthru device attached");
        Ok(device)
    }

    fn register_readers(&mut self) {
        let Some(registrar) = self.registrar.clone() else {
            return;
        };
        for (reader, registered) in self.readers.iter().zip(self.registered.iter_mut()) {
            let attrs = ReaderAttributes::new(
                reader.clone(),
                self.config.protocols,
                self.config.max_command_len(),
                self.config.rx_capacity,
            );
            match registrar.register(attrs) {
                Ok(()) => *registered = true,
                Err(err) => warn!(reader = reader.index(), error = %err, "registration failed"),
            }
        }
    }

    /// Release the interrupt, withdraw every registration, drop the readers and unmap
    ///
    /// Reader handles obtained earlier stay valid but fail with
    /// [`PassthruError::Detached`] from then on.
    pub fn detach(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.irq_requested {
            self.platform.free_irq();
            self.irq_requested = false;
        }
        // a handler the platform already dispatched finishes before this returns
        self.relay.shutdown();

        if let Some(registrar) = &self.registrar {
            for (index, registered) in self.registered.iter_mut().enumerate() {
                if *registered {
                    registrar.deregister(index as u8);
                    *registered = false;
                }
            }
        }

        if let Some(mmio) = self.mmio.take() {
            for reader in self.readers.drain(..) {
                reader.release();
            }
            debug!(handles = Arc::strong_count(&mmio), "unmapping register space");
            self.platform.unmap(mmio);
            info!("pcsc passthru device detached");
        }
    }

    /// Number of readers discovered at attach
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// All readers in index order
    pub fn readers(&self) -> &[Arc<ReaderController>] {
        &self.readers
    }

    /// Reader at `index`
    pub fn reader(&self, index: usize) -> Result<&Arc<ReaderController>> {
        self.readers
            .get(index)
            .ok_or(PassthruError::ReaderNotFound(index))
    }

    /// Capabilities of reader `index`, as handed to the registrar
    pub fn attributes(&self, index: usize) -> Result<ReaderAttributes> {
        let reader = self.reader(index)?;
        Ok(ReaderAttributes::new(
            reader.clone(),
            self.config.protocols,
            self.config.max_command_len(),
            self.config.rx_capacity,
        ))
    }

    /// Configuration the device was attached with
    pub const fn config(&self) -> &PassthruConfig {
        &self.config
    }

    /// Receive every reader event from now on
    pub fn subscribe(&self) -> ReaderEventReceiver {
        self.events.subscribe_unbounded()
    }

    /// Deliver reader events to an existing channel
    pub fn subscribe_with(&self, sender: ReaderEventSender) {
        self.events.subscribe(sender);
    }

    /// Run the interrupt relay directly, for platforms that poll the line
    pub fn handle_interrupt(&self) -> IrqReturn {
        self.relay.on_signal()
    }
}

impl Drop for PassthruDevice {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn populate_readers(
    platform: &dyn Platform,
    mmio: &Arc<dyn Mmio>,
    global: &GlobalRegisters,
    config: &PassthruConfig,
) -> Result<Vec<Arc<ReaderController>>> {
    let count = global.reader_count();
    info!(count, "number of readers detected");

    let count = u8::try_from(count)
        .map_err(|_| PassthruError::Mapping(format!("implausible reader count {count}")))?;
    let count = usize::from(count);

    let required = reader_block_offset(count);
    if required > mmio.len() {
        return Err(PassthruError::Mapping(format!(
            "{count} readers need {required:#x} bytes, mapping holds {:#x}",
            mmio.len()
        )));
    }

    let mut readers = Vec::new();
    readers
        .try_reserve_exact(count)
        .map_err(|e| PassthruError::Allocation(e.to_string()))?;

    for index in 0..count {
        let buffers = ReaderBuffers {
            atr: platform.alloc_dma(MAX_ATR_LEN)?,
            tx: platform.alloc_dma(config.max_command_len())?,
            rx: platform.alloc_dma(config.rx_capacity)?,
        };
        let window = RegisterWindow::new(mmio.clone(), reader_block_offset(index));
        debug!(reader = index, base = window.base(), "creating reader");
        readers.push(Arc::new(ReaderController::new(index as u8, window, buffers)));
    }

    Ok(readers)
}
