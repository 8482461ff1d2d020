//! Interrupt relay
//!
//! The device raises its interrupt line when any reader's state changes. The relay reads
//! the global status, refreshes every reader one lock at a time, publishes the resulting
//! events and acknowledges the interrupt.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::event::EventBus;
use crate::mmio::{GlobalRegisters, IrqHandler, IrqReturn};
use crate::reader::ReaderController;

/// Fans an interrupt out to every reader of a device
#[derive(Debug)]
pub struct InterruptRelay {
    targets: Mutex<Option<Targets>>,
    events: Arc<EventBus>,
}

#[derive(Debug)]
struct Targets {
    global: GlobalRegisters,
    readers: Vec<Arc<ReaderController>>,
}

impl InterruptRelay {
    /// Create a relay over `readers`, in index order
    pub const fn new(
        global: GlobalRegisters,
        readers: Vec<Arc<ReaderController>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            targets: Mutex::new(Some(Targets { global, readers })),
            events,
        }
    }

    /// Handle one assertion of the interrupt line
    ///
    /// Each reader's lock is taken and released on its own, so a busy reader only delays
    /// the readers after it and never blocks them indefinitely. The observed status is
    /// always written back, even if a refresh panicked. A relay that has been shut down
    /// touches no register and reports the interrupt as not handled.
    #[instrument(level = "trace", skip(self))]
    pub fn on_signal(&self) -> IrqReturn {
        let targets = self.targets.lock();
        let Some(Targets { global, readers }) = targets.as_ref() else {
            trace!("interrupt after shutdown");
            return IrqReturn::None;
        };

        let status = global.irq_status();
        debug!(status = status.bits(), "pcsc irq");

        if status.state_changed() {
            for reader in readers {
                match catch_unwind(AssertUnwindSafe(|| reader.refresh_state())) {
                    Ok(change) => {
                        for event in change.events() {
                            trace!(?event, "publishing");
                            self.events.publish(event);
                        }
                    }
                    Err(_) => {
                        warn!(reader = reader.index(), "refresh panicked, continuing");
                    }
                }
            }
        } else if !status.is_pending() {
            trace!("spurious interrupt");
        }

        global.ack_irq(status);

        if status.is_pending() {
            IrqReturn::Handled
        } else {
            IrqReturn::None
        }
    }

    /// Drop the global registers and reader handles
    ///
    /// Waits for a handler already running on another thread to finish.
    pub(crate) fn shutdown(&self) {
        if self.targets.lock().take().is_some() {
            debug!("interrupt relay shut down");
        }
    }

    /// Whether the relay still forwards interrupts
    pub fn is_active(&self) -> bool {
        self.targets.lock().is_some()
    }

    /// Wrap the relay into a handler for [`crate::Platform::request_irq`]
    pub fn into_handler(self: Arc<Self>) -> IrqHandler {
        Arc::new(move || self.on_signal())
    }
}
