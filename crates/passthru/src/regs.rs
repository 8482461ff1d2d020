//! Register map of the pass-through device
//!
//! The register space starts with a small global header followed by one fixed-size block
//! per reader. Field values in the control and status words map directly onto pcsc-lite
//! constants, so a hardware peer backed by pcsc-lite can forward them untouched.
//!
//! Everything here is pure encode/decode; no register is touched.

use std::fmt;

use derive_more::Display;

/// Reader count, read-only
pub const REG_NUM_READERS: usize = 0x00;
/// Interrupt status, read to observe and written back to acknowledge
pub const REG_IRQ_STATUS: usize = 0x04;
/// Size of the global header preceding the first reader block
pub const HEADER_SIZE: usize = 0x08;

/// Control word, write-only
pub const REG_READER_CONTROL: usize = 0x00;
/// Status word, read-only
pub const REG_READER_STATE: usize = 0x04;
/// Bus address of the command buffer
pub const REG_READER_TX_ADDR: usize = 0x08;
/// Length of the command in the command buffer
pub const REG_READER_TX_SIZE: usize = 0x0c;
/// Bus address of the response buffer
pub const REG_READER_RX_ADDR: usize = 0x10;
/// Response buffer capacity; overwritten by the hardware with the actual length
pub const REG_READER_RX_SIZE: usize = 0x14;
/// Length of the ATR of the inserted card
pub const REG_READER_ATR_LEN: usize = 0x18;
/// Size of one reader block
pub const READER_BLOCK_SIZE: usize = 0x1c;

/// Longest ATR allowed by ISO/IEC 7816-3
pub const MAX_ATR_LEN: usize = 33;

/// Offset of reader `index`'s block from the start of the register space
pub const fn reader_block_offset(index: usize) -> usize {
    HEADER_SIZE + index * READER_BLOCK_SIZE
}

/// Global interrupt status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqStatus(u32);

impl IrqStatus {
    /// At least one reader changed state
    pub const STATE_CHANGE: u32 = 0x1;

    /// Wrap a raw register value
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw register value
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether the state-change bit is set
    pub const fn state_changed(self) -> bool {
        self.0 & Self::STATE_CHANGE != 0
    }

    /// Whether any bit is set
    pub const fn is_pending(self) -> bool {
        self.0 != 0
    }
}

/// Preferred protocol set, bits 0-3 of the control word
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Protocols(u32);

impl Protocols {
    /// No preference
    pub const NONE: Self = Self(0);
    /// T=0
    pub const T0: Self = Self(0x0001);
    /// T=1
    pub const T1: Self = Self(0x0002);
    /// T=15
    pub const T15: Self = Self(0x0004);
    /// Raw
    pub const RAW: Self = Self(0x0008);
    /// T=0 or T=1
    pub const ANY: Self = Self(0x0003);

    const MASK: u32 = 0x000f;

    /// Build from raw bits, dropping anything outside the protocol field
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::MASK)
    }

    /// Raw field bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every protocol in `other` is also in `self`
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both sets
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether the set is empty
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Protocols {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for Protocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "Protocols(NONE)");
        }
        let names = [
            (Self::T0, "T0"),
            (Self::T1, "T1"),
            (Self::T15, "T15"),
            (Self::RAW, "RAW"),
        ];
        let mut list = f.debug_set();
        for (proto, name) in names {
            if self.contains(proto) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

/// Share mode requested on connect, bits 4-5 of the control word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ShareMode {
    /// Exclusive access to the card
    #[display("exclusive")]
    Exclusive,
    /// Shared access to the card
    #[display("shared")]
    Shared,
    /// Direct connection to the reader
    #[display("direct")]
    Direct,
}

impl ShareMode {
    const SHIFT: u32 = 4;

    const fn field(self) -> u32 {
        let value = match self {
            Self::Exclusive => 1,
            Self::Shared => 2,
            Self::Direct => 3,
        };
        value << Self::SHIFT
    }
}

/// Action taken on the card at disconnect, bits 8-9 of the control word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Disposition {
    /// Leave the card as is
    #[display("leave")]
    LeaveCard,
    /// Warm-reset the card
    #[display("reset")]
    ResetCard,
    /// Power the card down
    #[display("unpower")]
    UnpowerCard,
    /// Eject the card
    #[display("eject")]
    EjectCard,
}

impl Disposition {
    const SHIFT: u32 = 8;

    const fn field(self) -> u32 {
        let value = match self {
            Self::LeaveCard => 0,
            Self::ResetCard => 1,
            Self::UnpowerCard => 2,
            Self::EjectCard => 3,
        };
        value << Self::SHIFT
    }
}

/// Reader command opcode, bits 12-15 of the control word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Command {
    /// Power up the card and open a session
    #[display("connect")]
    Connect,
    /// Close the session
    #[display("disconnect")]
    Disconnect,
    /// Copy the ATR into the response buffer
    #[display("read-atr")]
    ReadAtr,
    /// Exchange a command/response pair with the card
    #[display("transmit")]
    Transmit,
}

impl Command {
    /// Opcode bit for this command
    pub const fn opcode(self) -> u32 {
        match self {
            Self::Connect => 0x1000,
            Self::Disconnect => 0x2000,
            Self::ReadAtr => 0x4000,
            Self::Transmit => 0x8000,
        }
    }

    /// Decode an opcode field, `None` unless exactly one known opcode bit is set
    pub const fn from_opcode(bits: u32) -> Option<Self> {
        match bits & ControlWord::OPCODE_MASK {
            0x1000 => Some(Self::Connect),
            0x2000 => Some(Self::Disconnect),
            0x4000 => Some(Self::ReadAtr),
            0x8000 => Some(Self::Transmit),
            _ => None,
        }
    }
}

/// Encoded control word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlWord(u32);

impl ControlWord {
    const SHARE_MASK: u32 = 0x0030;
    const DISPOSITION_MASK: u32 = 0x0300;
    const OPCODE_MASK: u32 = 0xf000;

    /// Control word carrying only an opcode
    pub const fn new(command: Command) -> Self {
        Self(command.opcode())
    }

    /// `{connect, protocols, share mode}`
    pub const fn connect(protocols: Protocols, share_mode: ShareMode) -> Self {
        Self::new(Command::Connect)
            .with_protocols(protocols)
            .with_share_mode(share_mode)
    }

    /// `{disconnect, disposition}`
    pub const fn disconnect(disposition: Disposition) -> Self {
        Self::new(Command::Disconnect).with_disposition(disposition)
    }

    /// Replace the protocol field
    pub const fn with_protocols(self, protocols: Protocols) -> Self {
        Self((self.0 & !Protocols::MASK) | protocols.bits())
    }

    /// Replace the share mode field
    pub const fn with_share_mode(self, mode: ShareMode) -> Self {
        Self((self.0 & !Self::SHARE_MASK) | mode.field())
    }

    /// Replace the disposition field
    pub const fn with_disposition(self, disposition: Disposition) -> Self {
        Self((self.0 & !Self::DISPOSITION_MASK) | disposition.field())
    }

    /// Wrap a raw register value
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw register value
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Decoded opcode
    pub const fn command(self) -> Option<Command> {
        Command::from_opcode(self.0)
    }

    /// Decoded protocol field
    pub const fn protocols(self) -> Protocols {
        Protocols::from_bits_truncate(self.0)
    }

    /// Decoded share mode; `None` when the field is zero
    pub const fn share_mode(self) -> Option<ShareMode> {
        match (self.0 & Self::SHARE_MASK) >> ShareMode::SHIFT {
            1 => Some(ShareMode::Exclusive),
            2 => Some(ShareMode::Shared),
            3 => Some(ShareMode::Direct),
            _ => None,
        }
    }

    /// Decoded disposition
    pub const fn disposition(self) -> Disposition {
        match (self.0 & Self::DISPOSITION_MASK) >> Disposition::SHIFT {
            0 => Disposition::LeaveCard,
            1 => Disposition::ResetCard,
            2 => Disposition::UnpowerCard,
            _ => Disposition::EjectCard,
        }
    }
}

/// Decoded status word
///
/// Flags are independent bits. The hardware may report several at once and no
/// combination is rejected here.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReaderStatus(u32);

impl ReaderStatus {
    /// The reader should be ignored
    pub const IGNORE: u32 = 0x0001;
    /// State differs from what the peer last reported
    pub const CHANGED: u32 = 0x0002;
    /// The reader is unknown
    pub const UNKNOWN: u32 = 0x0004;
    /// Status unavailable
    pub const UNAVAILABLE: u32 = 0x0008;
    /// No card in the slot
    pub const EMPTY: u32 = 0x0010;
    /// Card in the slot
    pub const PRESENT: u32 = 0x0020;
    /// Card ATR matches a target
    pub const ATRMATCH: u32 = 0x0040;
    /// Card in use exclusively
    pub const EXCLUSIVE: u32 = 0x0080;
    /// Card in use in shared mode
    pub const INUSE: u32 = 0x0100;
    /// Card does not respond
    pub const MUTE: u32 = 0x0200;
    /// Card is not powered
    pub const UNPOWERED: u32 = 0x0400;

    const DESCRIPTIONS: [(u32, &'static str); 10] = [
        (Self::IGNORE, "Ignore this reader"),
        (Self::UNKNOWN, "Reader unknown"),
        (Self::UNAVAILABLE, "Status unavailable"),
        (Self::EMPTY, "Card removed"),
        (Self::PRESENT, "Card inserted"),
        (Self::ATRMATCH, "ATR matches card"),
        (Self::EXCLUSIVE, "Exclusive Mode"),
        (Self::INUSE, "Shared Mode"),
        (Self::MUTE, "Unresponsive card"),
        (Self::UNPOWERED, "Reader Unpowered"),
    ];

    /// Wrap a raw register value
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw register value
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `flags` is set
    pub const fn contains(self, flags: u32) -> bool {
        self.0 & flags == flags
    }

    /// Card inserted
    pub const fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }

    /// Slot reports no usable card: empty set, or present clear
    pub const fn is_slot_empty(self) -> bool {
        self.contains(Self::EMPTY) || !self.is_present()
    }

    /// Card held in exclusive mode
    pub const fn is_exclusive(self) -> bool {
        self.contains(Self::EXCLUSIVE)
    }

    /// Card held in shared mode
    pub const fn is_in_use(self) -> bool {
        self.contains(Self::INUSE)
    }

    /// Card is mute
    pub const fn is_mute(self) -> bool {
        self.contains(Self::MUTE)
    }

    /// Card is unpowered
    pub const fn is_unpowered(self) -> bool {
        self.contains(Self::UNPOWERED)
    }

    /// Human-readable description of every set flag, in register bit order
    pub fn descriptions(self) -> impl Iterator<Item = &'static str> {
        Self::DESCRIPTIONS
            .into_iter()
            .filter(move |(bit, _)| self.0 & bit != 0)
            .map(|(_, text)| text)
    }
}

impl fmt::Debug for ReaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReaderStatus({:#06x})", self.0)
    }
}

impl fmt::Display for ReaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.descriptions() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_block_offsets() {
        assert_eq!(reader_block_offset(0), 0x08);
        assert_eq!(reader_block_offset(1), 0x08 + 0x1c);
        assert_eq!(reader_block_offset(2), 0x08 + 2 * 0x1c);
    }

    #[test]
    fn test_connect_word_layout() {
        let word = ControlWord::connect(Protocols::T1, ShareMode::Shared);
        assert_eq!(word.bits(), 0x1000 | 0x0020 | 0x0002);
        assert_eq!(word.command(), Some(Command::Connect));
        assert_eq!(word.protocols(), Protocols::T1);
        assert_eq!(word.share_mode(), Some(ShareMode::Shared));
        assert_eq!(word.disposition(), Disposition::LeaveCard);
    }

    #[test]
    fn test_disconnect_word_layout() {
        let word = ControlWord::disconnect(Disposition::ResetCard);
        assert_eq!(word.bits(), 0x2100);

        assert_eq!(ControlWord::disconnect(Disposition::UnpowerCard).bits(), 0x2200);
        assert_eq!(ControlWord::disconnect(Disposition::EjectCard).bits(), 0x2300);
        assert_eq!(ControlWord::disconnect(Disposition::LeaveCard).bits(), 0x2000);
    }

    #[test]
    fn test_field_setters_replace_previous_value() {
        let word = ControlWord::connect(Protocols::ANY, ShareMode::Direct)
            .with_share_mode(ShareMode::Exclusive)
            .with_protocols(Protocols::RAW);
        assert_eq!(word.bits(), 0x1000 | 0x0010 | 0x0008);
    }

    #[test]
    fn test_opcodes() {
        assert_eq!(ControlWord::new(Command::ReadAtr).bits(), 0x4000);
        assert_eq!(ControlWord::new(Command::Transmit).bits(), 0x8000);
        assert_eq!(Command::from_opcode(0x3000), None);
        assert_eq!(Command::from_opcode(0), None);
    }

    #[test]
    fn test_status_flags_are_independent() {
        let status = ReaderStatus::from_bits(ReaderStatus::PRESENT | ReaderStatus::INUSE);
        assert!(status.is_present());
        assert!(status.is_in_use());
        assert!(!status.is_slot_empty());
        assert!(!status.is_exclusive());

        let lines: Vec<_> = status.descriptions().collect();
        assert_eq!(lines, vec!["Card inserted", "Shared Mode"]);
    }

    #[test]
    fn test_contradictory_status_is_still_decoded() {
        let status = ReaderStatus::from_bits(ReaderStatus::PRESENT | ReaderStatus::EMPTY);
        assert!(status.is_present());
        assert!(status.is_slot_empty());
        assert_eq!(status.to_string(), "Card removed\nCard inserted\n");
    }

    #[test]
    fn test_changed_bit_has_no_description() {
        let status = ReaderStatus::from_bits(ReaderStatus::CHANGED);
        assert_eq!(status.descriptions().count(), 0);
        assert!(status.is_slot_empty());
    }

    #[test]
    fn test_irq_status() {
        assert!(IrqStatus::from_bits(0x1).state_changed());
        assert!(!IrqStatus::from_bits(0x2).state_changed());
        assert!(IrqStatus::from_bits(0x2).is_pending());
        assert!(!IrqStatus::default().is_pending());
    }

    #[test]
    fn test_protocols_debug() {
        assert_eq!(format!("{:?}", Protocols::ANY), "{T0, T1}");
        assert_eq!(format!("{:?}", Protocols::NONE), "Protocols(NONE)");
        assert_eq!(Protocols::from_bits_truncate(0xff), Protocols(0x0f));
    }
}
