//! Network protocol control information (N_PCI) as it appears on the wire
//!
//! The first nibble of the N_PCI identifies the frame type:
//!
//! | Type | Layout                                   |
//! |------|------------------------------------------|
//! | SF   | `0L` or, escaped, `00 LL`                |
//! | FF   | `1H LL` or, escaped, `10 00 LL LL LL LL` |
//! | CF   | `2N`                                     |
//! | FC   | `3S BS ST`                               |
//!
//! These types know nothing about addressing. Callers slice off any leading address byte before
//! parsing, and write the address byte themselves before encoding.
use snafu::Snafu;

/// N_PCI type nibble of a single frame
pub const PCI_TYPE_SF: u8 = 0x00;
/// N_PCI type nibble of a first frame
pub const PCI_TYPE_FF: u8 = 0x10;
/// N_PCI type nibble of a consecutive frame
pub const PCI_TYPE_CF: u8 = 0x20;
/// N_PCI type nibble of a flow control frame
pub const PCI_TYPE_FC: u8 = 0x30;

/// Largest message length expressible in the 12-bit first frame length field
pub const FF_DL_12BIT_MAX: u32 = 4095;

/// Largest single frame payload in a classic CAN frame without an address byte
pub const SF_DL_CLASSIC_MAX: usize = 7;

/// N_PCI size of an unescaped single frame
pub const SF_PCI_SIZE: usize = 1;
/// N_PCI size of an escaped (CAN-FD) single frame
pub const SF_ESC_PCI_SIZE: usize = 2;
/// N_PCI size of a first frame with a 12-bit length
pub const FF_PCI_SIZE: usize = 2;
/// N_PCI size of a first frame with a 32-bit length
pub const FF_ESC_PCI_SIZE: usize = 6;
/// N_PCI size of a consecutive frame
pub const CF_PCI_SIZE: usize = 1;
/// N_PCI size of a flow control frame
pub const FC_PCI_SIZE: usize = 3;

/// The kind of frame identified by the N_PCI type nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameType {
    /// Single frame
    Single,
    /// First frame
    First,
    /// Consecutive frame
    Consecutive,
    /// Flow control frame
    FlowControl,
}

impl FrameType {
    /// Classify a frame by the first byte of its N_PCI
    pub fn from_pci_byte(byte: u8) -> Option<Self> {
        match byte & 0xF0 {
            PCI_TYPE_SF => Some(Self::Single),
            PCI_TYPE_FF => Some(Self::First),
            PCI_TYPE_CF => Some(Self::Consecutive),
            PCI_TYPE_FC => Some(Self::FlowControl),
            _ => None,
        }
    }
}

/// Flow status carried in a flow control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlowStatus {
    /// Continue to send
    ClearToSend,
    /// Wait for another flow control frame
    Wait,
    /// The receiver cannot take the message
    Overflow,
    /// A reserved status value; the sender must abort
    Reserved(u8),
}

impl FlowStatus {
    /// Decode the low nibble of the FC N_PCI byte
    pub fn from_nibble(value: u8) -> Self {
        match value & 0x0F {
            0 => Self::ClearToSend,
            1 => Self::Wait,
            2 => Self::Overflow,
            other => Self::Reserved(other),
        }
    }

    /// Encode as the low nibble of the FC N_PCI byte
    pub fn to_nibble(self) -> u8 {
        match self {
            Self::ClearToSend => 0,
            Self::Wait => 1,
            Self::Overflow => 2,
            Self::Reserved(value) => value & 0x0F,
        }
    }
}

/// A separation time (STmin) byte
///
/// 0x00..=0x7F are milliseconds and 0xF1..=0xF9 are multiples of 100us. Every other value is
/// reserved; a receiver treats reserved values as the longest valid time, 0x7F.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StMin(u8);

impl StMin {
    /// The longest separation time, 127ms
    pub const MAX: StMin = StMin(0x7F);

    /// Interpret a received STmin byte, normalizing reserved values to [`StMin::MAX`]
    pub const fn from_raw(raw: u8) -> Self {
        if Self::is_valid(raw) {
            StMin(raw)
        } else {
            Self::MAX
        }
    }

    /// Returns true if `raw` is not in a reserved range
    pub const fn is_valid(raw: u8) -> bool {
        matches!(raw, 0x00..=0x7F | 0xF1..=0xF9)
    }

    /// The encoded byte
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// The separation time in microseconds
    pub const fn as_micros(self) -> u32 {
        match self.0 {
            0xF1..=0xF9 => (self.0 - 0xF0) as u32 * 100,
            ms => ms as u32 * 1000,
        }
    }
}

/// Error decoding an N_PCI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum PciError {
    /// No bytes were available for the N_PCI
    Empty,
    /// The frame ended inside the N_PCI
    #[snafu(display("{kind:?} N_PCI truncated: {len} bytes available, {needed} needed"))]
    Truncated {
        /// The frame type being decoded
        kind: FrameType,
        /// Bytes available
        len: usize,
        /// Bytes required
        needed: usize,
    },
    /// The type nibble is not SF, FF, CF or FC
    #[snafu(display("Unknown N_PCI type byte 0x{pci:02x}"))]
    UnknownType {
        /// The offending byte
        pci: u8,
    },
    /// The output buffer is too small for the N_PCI
    #[snafu(display("Buffer of {len} bytes cannot hold a {needed} byte N_PCI"))]
    BufferTooSmall {
        /// Bytes available
        len: usize,
        /// Bytes required
        needed: usize,
    },
}

/// A decoded N_PCI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pci {
    /// Single frame carrying the whole message
    Single {
        /// Message length
        len: usize,
        /// True for the two byte CAN-FD form
        escape: bool,
    },
    /// First frame of a segmented message
    First {
        /// Total message length
        len: u32,
        /// True for the six byte form used above 4095 bytes
        escape: bool,
    },
    /// Consecutive frame
    Consecutive {
        /// Sequence number, 0..=15
        sn: u8,
    },
    /// Flow control frame
    FlowControl {
        /// The flow status
        status: FlowStatus,
        /// Block size, 0 for unlimited
        block_size: u8,
        /// Raw separation time byte
        st_min: u8,
    },
}

impl Pci {
    /// Build a single frame N_PCI, using the escaped form when `escape` is set
    pub fn single(len: usize, escape: bool) -> Self {
        Pci::Single { len, escape }
    }

    /// Build a first frame N_PCI, choosing the escaped form for lengths above 4095
    pub fn first(len: u32) -> Self {
        Pci::First {
            len,
            escape: len > FF_DL_12BIT_MAX,
        }
    }

    /// Build a consecutive frame N_PCI. The sequence number is taken modulo 16
    pub fn consecutive(sn: u8) -> Self {
        Pci::Consecutive { sn: sn & 0x0F }
    }

    /// Build a flow control N_PCI
    pub fn flow_control(status: FlowStatus, block_size: u8, st_min: u8) -> Self {
        Pci::FlowControl {
            status,
            block_size,
            st_min,
        }
    }

    /// Number of bytes the N_PCI occupies
    pub fn size(&self) -> usize {
        match self {
            Pci::Single { escape: false, .. } => SF_PCI_SIZE,
            Pci::Single { escape: true, .. } => SF_ESC_PCI_SIZE,
            Pci::First { escape: false, .. } => FF_PCI_SIZE,
            Pci::First { escape: true, .. } => FF_ESC_PCI_SIZE,
            Pci::Consecutive { .. } => CF_PCI_SIZE,
            Pci::FlowControl { .. } => FC_PCI_SIZE,
        }
    }

    /// Decode the N_PCI at the start of `data`
    ///
    /// Only the N_PCI layout is checked here. Whether a length is acceptable for the frame size
    /// and addressing in use is up to the caller.
    pub fn parse(data: &[u8]) -> Result<Self, PciError> {
        let first = *data.first().ok_or(PciError::Empty)?;
        let kind = FrameType::from_pci_byte(first).ok_or(PciError::UnknownType { pci: first })?;
        let need = |needed: usize| -> Result<(), PciError> {
            if data.len() < needed {
                TruncatedSnafu {
                    kind,
                    len: data.len(),
                    needed,
                }
                .fail()
            } else {
                Ok(())
            }
        };

        match kind {
            FrameType::Single => {
                let nibble = first & 0x0F;
                if nibble != 0 {
                    Ok(Pci::Single {
                        len: nibble as usize,
                        escape: false,
                    })
                } else {
                    need(SF_ESC_PCI_SIZE)?;
                    Ok(Pci::Single {
                        len: data[1] as usize,
                        escape: true,
                    })
                }
            }
            FrameType::First => {
                need(FF_PCI_SIZE)?;
                let len = (((first & 0x0F) as u32) << 8) | data[1] as u32;
                if len != 0 {
                    Ok(Pci::First { len, escape: false })
                } else {
                    need(FF_ESC_PCI_SIZE)?;
                    let len = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
                    Ok(Pci::First { len, escape: true })
                }
            }
            FrameType::Consecutive => Ok(Pci::Consecutive { sn: first & 0x0F }),
            FrameType::FlowControl => {
                need(FC_PCI_SIZE)?;
                Ok(Pci::FlowControl {
                    status: FlowStatus::from_nibble(first),
                    block_size: data[1],
                    st_min: data[2],
                })
            }
        }
    }

    /// Write the N_PCI to the start of `buf`, returning the number of bytes written
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, PciError> {
        let size = self.size();
        if buf.len() < size {
            return BufferTooSmallSnafu {
                len: buf.len(),
                needed: size,
            }
            .fail();
        }
        match *self {
            Pci::Single { len, escape: false } => {
                buf[0] = PCI_TYPE_SF | (len as u8 & 0x0F);
            }
            Pci::Single { len, escape: true } => {
                buf[0] = PCI_TYPE_SF;
                buf[1] = len as u8;
            }
            Pci::First { len, escape: false } => {
                buf[0] = PCI_TYPE_FF | ((len >> 8) as u8 & 0x0F);
                buf[1] = len as u8;
            }
            Pci::First { len, escape: true } => {
                buf[0] = PCI_TYPE_FF;
                buf[1] = 0;
                buf[2..6].copy_from_slice(&len.to_be_bytes());
            }
            Pci::Consecutive { sn } => {
                buf[0] = PCI_TYPE_CF | (sn & 0x0F);
            }
            Pci::FlowControl {
                status,
                block_size,
                st_min,
            } => {
                buf[0] = PCI_TYPE_FC | status.to_nibble();
                buf[1] = block_size;
                buf[2] = st_min;
            }
        }
        Ok(size)
    }
}
