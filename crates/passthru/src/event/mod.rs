//! Reader events published from the interrupt path

pub mod channel;
pub use channel::*;

use crate::regs::ReaderStatus;

/// Events describing a reader's state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderEvent {
    /// A card appeared in the slot
    CardInserted {
        /// Reader index
        reader: u8,
    },
    /// The card left the slot
    CardRemoved {
        /// Reader index
        reader: u8,
    },
    /// An open session ended because the card was removed
    SessionLost {
        /// Reader index
        reader: u8,
    },
    /// Any other change of the status word
    StatusChanged {
        /// Reader index
        reader: u8,
        /// Previous status
        previous: ReaderStatus,
        /// New status
        current: ReaderStatus,
    },
}

impl ReaderEvent {
    /// Index of the reader the event concerns
    pub const fn reader(&self) -> u8 {
        match self {
            Self::CardInserted { reader }
            | Self::CardRemoved { reader }
            | Self::SessionLost { reader }
            | Self::StatusChanged { reader, .. } => *reader,
        }
    }
}

/// Outcome of a single status refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// Reader index
    pub reader: u8,
    /// Status before the refresh
    pub previous: ReaderStatus,
    /// Status after the refresh
    pub current: ReaderStatus,
    /// The refresh ended an open session
    pub session_lost: bool,
}

impl StateChange {
    /// Whether the status word changed at all
    pub fn is_change(&self) -> bool {
        self.previous != self.current || self.session_lost
    }

    /// Events implied by this change, most specific first
    pub fn events(&self) -> Vec<ReaderEvent> {
        let reader = self.reader;
        let mut events = Vec::new();

        match (self.previous.is_present(), self.current.is_present()) {
            (false, true) => events.push(ReaderEvent::CardInserted { reader }),
            (true, false) => events.push(ReaderEvent::CardRemoved { reader }),
            _ if self.previous != self.current => events.push(ReaderEvent::StatusChanged {
                reader,
                previous: self.previous,
                current: self.current,
            }),
            _ => {}
        }

        if self.session_lost {
            events.push(ReaderEvent::SessionLost { reader });
        }

        events
    }
}
