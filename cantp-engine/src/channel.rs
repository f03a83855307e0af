//! Per-channel protocol state
//!
//! A channel carries one reception or one transmission at a time. The [`ChannelState`] is shared
//! through an [`AtomicCell`](cantp_common::AtomicCell) so that other contexts can look at it
//! without locking, e.g. to find the channel waiting for a confirmation. Everything else about the
//! message in flight lives in the [`ChannelRecord`], which is only touched by the holder of the
//! channel lock.
use cantp_common::{messages::MAX_FRAME_LENGTH, PduId};

/// The frame kinds which carry upper layer data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataFrame {
    /// Single Frame
    Single,
    /// First Frame
    First,
    /// Consecutive Frame
    Consecutive,
}

/// The flow status of a flow control frame sent by a receiver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FcKind {
    /// Continue to send
    Cts,
    /// Wait
    Wait,
    /// Overflow
    Overflow,
}

/// Which side of a transfer a channel or N-SDU is on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Receive
    Rx,
    /// Transmit
    Tx,
}

/// Reception states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxState {
    /// Waiting for the upper layer to provide buffer for the data of the given frame
    BufferRequest(DataFrame),
    /// A flow control frame is ready but its identifier is busy with another confirmation
    PostponedFc(FcKind),
    /// A flow control frame is being handed to the CAN driver
    TransmitFc(FcKind),
    /// Waiting for the confirmation of a flow control frame
    ConfirmFc(FcKind),
    /// Waiting for the next consecutive frame
    ReceiveCf,
}

/// Transmission states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxState {
    /// Waiting for the upper layer to provide data for the given frame
    BufferRequest(DataFrame),
    /// The frame is ready but its identifier is busy with another confirmation
    Postponed(DataFrame),
    /// Waiting for the confirmation of the frame
    Confirm(DataFrame),
    /// Waiting for a flow control frame
    ReceiveFc,
    /// Waiting for the separation time before fetching the next consecutive frame
    WaitStMin,
    /// The next consecutive frame is staged, waiting for the separation time
    StagedCf,
}

/// The state of a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    /// Free for a new transfer
    #[default]
    Idle,
    /// Receiving
    Rx(RxState),
    /// Transmitting
    Tx(TxState),
}

impl ChannelState {
    /// Returns true if the channel waits for the CAN driver to confirm a frame
    pub fn awaits_confirmation(&self) -> bool {
        matches!(
            self,
            ChannelState::Rx(RxState::ConfirmFc(_)) | ChannelState::Tx(TxState::Confirm(_))
        )
    }

    /// Returns true if the channel holds a frame back because its identifier is busy
    pub fn is_postponed(&self) -> bool {
        matches!(
            self,
            ChannelState::Rx(RxState::PostponedFc(_)) | ChannelState::Tx(TxState::Postponed(_))
        )
    }

    /// The direction of the transfer, None when idle
    pub fn direction(&self) -> Option<Direction> {
        match self {
            ChannelState::Idle => None,
            ChannelState::Rx(_) => Some(Direction::Rx),
            ChannelState::Tx(_) => Some(Direction::Tx),
        }
    }
}

/// The N-SDU a channel is working for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct Owner {
    pub direction: Direction,
    pub pdu: PduId,
}

impl Owner {
    pub const fn rx(pdu: PduId) -> Self {
        Self {
            direction: Direction::Rx,
            pdu,
        }
    }

    pub const fn tx(pdu: PduId) -> Self {
        Self {
            direction: Direction::Tx,
            pdu,
        }
    }
}

/// Per-connection flags which live as long as the message
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ConnectionFlags {
    /// Add one tick to the next separation time
    pub st_min_round_up: bool,
    /// A flow control CTS arrived before the First Frame was confirmed
    pub fc_received: bool,
    /// The last consecutive frame of the reception is being processed
    pub last_frame: bool,
}

/// Everything the channel knows about the message in flight
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChannelRecord {
    pub pdu: PduId,
    pub total_length: u32,
    pub processed_length: u32,
    /// Upper layer buffer last reported available (Rx)
    pub actual_buffer_size: usize,
    pub block_size: u8,
    pub processed_block_frames: u8,
    pub sequence_number: u8,
    pub wait_frame_counter: u8,
    /// Main function ticks until the running timer expires
    pub ticks: u32,
    /// Main function ticks until the separation time is over (Tx)
    pub st_min_ticks: u32,
    /// Separation time in force for the next consecutive frame (Tx)
    pub st_min: u8,
    /// Normalized STmin from the last flow control CTS (Tx)
    pub last_fc_st_min: u8,
    /// Staging area: a complete frame (Tx), or received payload not yet accepted (Rx)
    pub frame: [u8; MAX_FRAME_LENGTH],
    pub frame_len: usize,
    /// Payload bytes in the staged frame, or in the staged Rx payload
    pub staged_len: usize,
    /// Data length of the First Frame, which every following CF must match (Rx)
    pub rx_frame_len: usize,
    /// Payload carried by the First Frame (Rx)
    pub ff_payload: u32,
    /// N_AI of the connection once the reception started
    pub address_lock: Option<u16>,
    /// Source address to send flow control to (NormalFixed Rx)
    pub peer_address: u8,
    pub flags: ConnectionFlags,
}

impl Default for ChannelRecord {
    fn default() -> Self {
        Self {
            pdu: 0,
            total_length: 0,
            processed_length: 0,
            actual_buffer_size: 0,
            block_size: 0,
            processed_block_frames: 0,
            sequence_number: 1,
            wait_frame_counter: 0,
            ticks: 0,
            st_min_ticks: 0,
            st_min: 0,
            last_fc_st_min: 0,
            frame: [0; MAX_FRAME_LENGTH],
            frame_len: 0,
            staged_len: 0,
            rx_frame_len: 0,
            ff_payload: 0,
            address_lock: None,
            peer_address: 0,
            flags: ConnectionFlags::default(),
        }
    }
}

impl ChannelRecord {
    /// Start a fresh message for `pdu`
    pub fn begin(&mut self, pdu: PduId, total_length: u32) {
        *self = Self {
            pdu,
            total_length,
            ..Self::default()
        };
    }

    /// Bytes still to be transferred
    pub fn remaining(&self) -> u32 {
        debug_assert!(self.processed_length <= self.total_length);
        self.total_length.saturating_sub(self.processed_length)
    }

    /// Advance the sequence number, wrapping from 15 to 0
    pub fn next_sequence_number(&mut self) {
        self.sequence_number = (self.sequence_number + 1) & 0x0F;
    }

    /// Count a consecutive frame against the block, returning true if the block is now complete
    pub fn count_block_frame(&mut self) -> bool {
        if self.block_size == 0 {
            return false;
        }
        self.processed_block_frames = self.processed_block_frames.saturating_add(1);
        self.processed_block_frames >= self.block_size
    }

    /// Returns true if the current block has been fully sent or received
    pub fn block_complete(&self) -> bool {
        self.block_size != 0 && self.processed_block_frames >= self.block_size
    }
}
