//! Conversions between register fields and the `pcsc` crate's types
//!
//! Status bits share pcsc-lite's layout and convert bit for bit. The protocol field swaps
//! the positions of T=15 and raw relative to pcsc-lite, and `pcsc` has no T=15 flag, so
//! protocols convert flag by flag.

use crate::regs::{Disposition, Protocols, ReaderStatus, ShareMode};

impl From<ReaderStatus> for pcsc::State {
    fn from(status: ReaderStatus) -> Self {
        Self::from_bits_truncate(status.bits().into())
    }
}

impl From<pcsc::State> for ReaderStatus {
    fn from(state: pcsc::State) -> Self {
        Self::from_bits(state.bits() as u32)
    }
}

impl From<Protocols> for pcsc::Protocols {
    fn from(protocols: Protocols) -> Self {
        let mut out = Self::empty();
        if protocols.contains(Protocols::T0) {
            out |= Self::T0;
        }
        if protocols.contains(Protocols::T1) {
            out |= Self::T1;
        }
        if protocols.contains(Protocols::RAW) {
            out |= Self::RAW;
        }
        out
    }
}

impl From<pcsc::Protocols> for Protocols {
    fn from(protocols: pcsc::Protocols) -> Self {
        let mut out = Self::NONE;
        if protocols.contains(pcsc::Protocols::T0) {
            out = out | Self::T0;
        }
        if protocols.contains(pcsc::Protocols::T1) {
            out = out | Self::T1;
        }
        if protocols.contains(pcsc::Protocols::RAW) {
            out = out | Self::RAW;
        }
        out
    }
}

impl From<ShareMode> for pcsc::ShareMode {
    fn from(mode: ShareMode) -> Self {
        match mode {
            ShareMode::Exclusive => Self::Exclusive,
            ShareMode::Shared => Self::Shared,
            ShareMode::Direct => Self::Direct,
        }
    }
}

impl From<pcsc::ShareMode> for ShareMode {
    fn from(mode: pcsc::ShareMode) -> Self {
        match mode {
            pcsc::ShareMode::Exclusive => Self::Exclusive,
            pcsc::ShareMode::Shared => Self::Shared,
            pcsc::ShareMode::Direct => Self::Direct,
        }
    }
}

impl From<Disposition> for pcsc::Disposition {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::LeaveCard => Self::LeaveCard,
            Disposition::ResetCard => Self::ResetCard,
            Disposition::UnpowerCard => Self::UnpowerCard,
            Disposition::EjectCard => Self::EjectCard,
        }
    }
}

impl From<pcsc::Disposition> for Disposition {
    fn from(disposition: pcsc::Disposition) -> Self {
        match disposition {
            pcsc::Disposition::LeaveCard => Self::LeaveCard,
            pcsc::Disposition::ResetCard => Self::ResetCard,
            pcsc::Disposition::UnpowerCard => Self::UnpowerCard,
            pcsc::Disposition::EjectCard => Self::EjectCard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits_match_pcsc_lite() {
        let status = ReaderStatus::from_bits(ReaderStatus::PRESENT | ReaderStatus::INUSE);
        let state = pcsc::State::from(status);
        assert!(state.contains(pcsc::State::PRESENT | pcsc::State::INUSE));
        assert_eq!(ReaderStatus::from(state), status);
    }

    #[test]
    fn test_protocols_convert_flag_by_flag() {
        let theirs = pcsc::Protocols::from(Protocols::T1 | Protocols::RAW | Protocols::T15);
        assert_eq!(theirs, pcsc::Protocols::T1 | pcsc::Protocols::RAW);
        assert_eq!(Protocols::from(pcsc::Protocols::T0), Protocols::T0);
    }

    #[test]
    fn test_enums() {
        assert!(matches!(
            pcsc::Disposition::from(Disposition::EjectCard),
            pcsc::Disposition::EjectCard
        ));
        assert_eq!(ShareMode::from(pcsc::ShareMode::Direct), ShareMode::Direct);
    }
}
