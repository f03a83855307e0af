//! CAN identifiers and frames
//!
//! A [`CanFrame`] carries up to 64 data bytes so that the same type serves classic CAN and CAN-FD.
//! Only the lengths in [`FD_FRAME_LENGTHS`] can be put on an FD bus; [`fd_frame_length`] rounds a
//! payload up to the next of them.
use snafu::Snafu;

/// A CAN identifier, either 11-bit standard or 29-bit extended
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanId {
    /// A 29-bit identifier
    Extended(u32),
    /// An 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw identifier value
    pub const fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true for a 29-bit identifier
    pub const fn is_extended(&self) -> bool {
        match self {
            CanId::Extended(_) => true,
            CanId::Std(_) => false,
        }
    }
}

/// The data length of a classic CAN frame
pub const CLASSIC_FRAME_LENGTH: usize = 8;

/// The largest CAN-FD data length
pub const MAX_FRAME_LENGTH: usize = 64;

/// The data lengths a CAN-FD frame can take
pub const FD_FRAME_LENGTHS: [usize; 8] = [8, 12, 16, 20, 24, 32, 48, 64];

/// Returns true if `len` is one of the data lengths a CAN-FD frame can encode
pub fn is_fd_frame_length(len: usize) -> bool {
    FD_FRAME_LENGTHS.contains(&len)
}

/// Round `len` up to the next length that can be sent on a CAN-FD bus
///
/// Returns None if `len` exceeds [`MAX_FRAME_LENGTH`]. Lengths up to 8 are returned unchanged,
/// since a DLC of 0..=8 is exact.
pub fn fd_frame_length(len: usize) -> Option<usize> {
    if len <= CLASSIC_FRAME_LENGTH {
        return Some(len);
    }
    FD_FRAME_LENGTHS.iter().copied().find(|&l| l >= len)
}

/// Error building a [`CanFrame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// More data than a frame of the requested kind can carry
    #[snafu(display("Frame data length {len} exceeds the maximum of {max}"))]
    TooLong {
        /// The requested length
        len: usize,
        /// The maximum for the frame kind
        max: usize,
    },
    /// An FD frame with a length that is not a valid FD data length
    #[snafu(display("{len} is not a valid CAN-FD data length"))]
    InvalidFdLength {
        /// The requested length
        len: usize,
    },
}

/// A CAN or CAN-FD frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanFrame {
    id: CanId,
    fd: bool,
    len: u8,
    data: [u8; MAX_FRAME_LENGTH],
}

impl Default for CanFrame {
    fn default() -> Self {
        Self {
            id: CanId::Std(0),
            fd: false,
            len: 0,
            data: [0; MAX_FRAME_LENGTH],
        }
    }
}

impl CanFrame {
    /// Create a classic CAN frame carrying up to 8 bytes
    pub fn new(id: CanId, data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > CLASSIC_FRAME_LENGTH {
            return TooLongSnafu {
                len: data.len(),
                max: CLASSIC_FRAME_LENGTH,
            }
            .fail();
        }
        Ok(Self::from_parts(id, false, data))
    }

    /// Create a CAN-FD frame
    ///
    /// Lengths above 8 must be one of [`FD_FRAME_LENGTHS`].
    pub fn new_fd(id: CanId, data: &[u8]) -> Result<Self, FrameError> {
        let len = data.len();
        if len > MAX_FRAME_LENGTH {
            return TooLongSnafu {
                len,
                max: MAX_FRAME_LENGTH,
            }
            .fail();
        }
        if len > CLASSIC_FRAME_LENGTH && !is_fd_frame_length(len) {
            return InvalidFdLengthSnafu { len }.fail();
        }
        Ok(Self::from_parts(id, true, data))
    }

    fn from_parts(id: CanId, fd: bool, data: &[u8]) -> Self {
        let mut buf = [0u8; MAX_FRAME_LENGTH];
        buf[..data.len()].copy_from_slice(data);
        Self {
            id,
            fd,
            len: data.len() as u8,
            data: buf,
        }
    }

    /// The frame identifier
    pub fn id(&self) -> CanId {
        self.id
    }

    /// The frame payload
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// The payload length in bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true if the frame carries no data
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true for CAN-FD frames
    pub fn is_fd(&self) -> bool {
        self.fd
    }
}
