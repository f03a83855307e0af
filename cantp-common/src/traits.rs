//! Traits for the layers above and below the transport engine

use snafu::Snafu;

use crate::messages::CanFrame;

/// Identifies a configured N-SDU: its index in the Rx or Tx table
pub type PduId = u16;

/// Error returned by a [`CanDriver`] which could not accept a frame
#[derive(Debug, Clone, PartialEq, Eq, Copy, Snafu)]
#[snafu(display("CAN driver rejected frame with id {:x}", frame.id().raw()))]
pub struct CanSendError {
    /// The rejected frame
    pub frame: CanFrame,
}

/// The CAN driver below the transport engine
///
/// `transmit` only queues the frame. Completion is reported back by calling the engine's
/// `tx_confirmation` with the frame identifier, typically from the TX-complete interrupt.
pub trait CanDriver: Sync {
    /// Queue a frame for transmission
    fn transmit(&self, frame: &CanFrame) -> Result<(), CanSendError>;
}

/// Reasons an upper layer cannot supply or accept data right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[snafu(module)]
pub enum BufferError {
    /// No buffer or data available at the moment; try again later
    Busy,
    /// The request is refused
    NotOk,
    /// The message does not fit in any buffer the upper layer can provide
    Overflow,
}

/// Failure reasons reported to the upper layer when a message ends unsuccessfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TpError {
    /// Generic failure: buffer or data refused, lower layer rejection, N_Br/N_Cs expiry
    #[snafu(display("Transfer failed"))]
    NotOk,
    /// N_As or N_Ar expired waiting for a frame confirmation
    #[snafu(display("Timeout waiting for transmit confirmation"))]
    TimeoutA,
    /// N_Bs expired waiting for a flow control frame
    #[snafu(display("Timeout waiting for flow control"))]
    TimeoutBs,
    /// N_Cr expired waiting for a consecutive frame
    #[snafu(display("Timeout waiting for consecutive frame"))]
    TimeoutCr,
    /// A consecutive frame arrived with the wrong sequence number
    #[snafu(display("Wrong sequence number"))]
    WrongSn,
    /// A flow control frame carried a reserved flow status
    #[snafu(display("Invalid flow status"))]
    InvalidFs,
    /// A new reception replaced one in progress
    #[snafu(display("Unexpected PDU"))]
    UnexpectedPdu,
    /// The receiver sent more wait frames than allowed
    #[snafu(display("Wait frame limit exceeded"))]
    WftOverrun,
    /// The receiver reported an overflow
    #[snafu(display("Receiver has no buffer"))]
    NoBuffer,
    /// The transfer was canceled on request
    #[snafu(display("Canceled"))]
    Canceled,
}

/// The layer above the transport engine, e.g. a PDU router or diagnostic stack
///
/// All methods may be called from any context that drives the engine: receive and transmit
/// interrupts, the periodic main function, or application calls.
pub trait UpperLayer: Sync {
    /// A new reception of `total_length` bytes is starting
    ///
    /// Returns the buffer space available for the message.
    fn start_of_reception(&self, id: PduId, total_length: u32) -> Result<usize, BufferError>;

    /// Copy received payload into the upper layer buffer
    ///
    /// An empty `data` copies nothing and only asks how much buffer is available. Returns the
    /// buffer space remaining after the copy.
    fn copy_rx_data(&self, id: PduId, data: &[u8]) -> Result<usize, BufferError>;

    /// Reception of the message ended
    fn rx_indication(&self, id: PduId, result: Result<(), TpError>);

    /// Fill `buf` with the next payload bytes of the message being transmitted
    ///
    /// The whole slice must be filled, or [`BufferError::Busy`] returned if that much data is not
    /// yet available. Returns the number of bytes still available after the copy.
    fn copy_tx_data(&self, id: PduId, buf: &mut [u8]) -> Result<usize, BufferError>;

    /// Transmission of the message ended
    fn tx_confirmation(&self, id: PduId, result: Result<(), TpError>);
}
