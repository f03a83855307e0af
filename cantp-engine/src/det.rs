//! Development error reporting and API errors
use cantp_common::PduId;
use snafu::Snafu;

/// Reportable development errors, with the AUTOSAR CanTp error codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DetError {
    /// Invalid configuration
    ParamConfig = 0x01,
    /// Unsupported parameter identifier
    ParamId = 0x02,
    /// A deferred consecutive frame was replaced by a newer frame before it was processed
    OverwriteFrame = 0x04,
    /// API used before `init`
    Uninit = 0x20,
    /// Unknown transmit N-SDU
    InvalidTxId = 0x30,
    /// Unknown receive N-SDU
    InvalidRxId = 0x40,
    /// Transmit request with an invalid length
    InvalidTxLength = 0x70,
    /// Received frame with an invalid length
    InvalidRxLength = 0x80,
    /// Segmented transfer requested on a functional N-SDU
    InvalidTaType = 0x90,
    /// Operation not supported for the N-SDU
    OperNotSupported = 0xA0,
    /// Request for the wrong direction
    ParamDirection = 0xA1,
}

/// Identifies the API in which a development error was detected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ApiId {
    Transmit = 0x03,
    TxConfirmation = 0x40,
    RxIndication = 0x42,
    CancelTransmit = 0x08,
    CancelReceive = 0x09,
    ChangeParameter = 0x0A,
    ReadParameter = 0x0B,
    ChangeTxParameter = 0x0C,
    ResetTxParameter = 0x0D,
    SetNSa = 0x1E,
    GetNSa = 0x1F,
}

/// Error returned by a [`CanTp`](crate::CanTp) API
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanTpError {
    /// The engine has not been initialised
    #[snafu(display("CanTp is not initialised"))]
    Uninit,
    /// No transmit N-SDU with this id
    #[snafu(display("Invalid Tx N-SDU {id}"))]
    InvalidTxId {
        /// The requested id
        id: PduId,
    },
    /// No receive N-SDU with this id
    #[snafu(display("Invalid Rx N-SDU {id}"))]
    InvalidRxId {
        /// The requested id
        id: PduId,
    },
    /// A message length of zero
    #[snafu(display("Invalid length {length} for Tx N-SDU {id}"))]
    InvalidTxLength {
        /// The N-SDU
        id: PduId,
        /// The requested length
        length: u32,
    },
    /// A message too long for a single frame on a functional N-SDU
    #[snafu(display("Tx N-SDU {id} is functional and cannot send {length} bytes"))]
    InvalidTaType {
        /// The N-SDU
        id: PduId,
        /// The requested length
        length: u32,
    },
    /// The parameter cannot be changed on this N-SDU
    #[snafu(display("Unsupported parameter"))]
    ParamId,
    /// The value is not allowed for the parameter
    #[snafu(display("Invalid parameter value {value:#x}"))]
    ParamValue {
        /// The rejected value
        value: u8,
    },
    /// The N-SDU addressing format has no N_SA
    #[snafu(display("Operation not supported by the N-SDU addressing format"))]
    OperNotSupported,
    /// The id does not exist in the requested direction
    #[snafu(display("N-SDU {id} does not exist in the requested direction"))]
    ParamDirection {
        /// The requested id
        id: PduId,
    },
    /// The N-SDU is already transferring a message
    #[snafu(display("N-SDU {id} is busy"))]
    Busy {
        /// The N-SDU
        id: PduId,
    },
    /// Every channel is in use
    #[snafu(display("No free channel"))]
    NoChannel,
    /// There is no transfer to act on, or it cannot be interrupted now
    #[snafu(display("Request refused in the current state"))]
    Refused,
}

impl CanTpError {
    /// The development error to report for this error, if any
    ///
    /// Errors caused by the current state of the bus rather than by misuse of the API are not
    /// reported.
    pub fn det(&self) -> Option<DetError> {
        match self {
            CanTpError::Uninit => Some(DetError::Uninit),
            CanTpError::InvalidTxId { .. } => Some(DetError::InvalidTxId),
            CanTpError::InvalidRxId { .. } => Some(DetError::InvalidRxId),
            CanTpError::InvalidTxLength { .. } => Some(DetError::InvalidTxLength),
            CanTpError::InvalidTaType { .. } => Some(DetError::InvalidTaType),
            CanTpError::ParamId => Some(DetError::ParamId),
            CanTpError::ParamValue { .. } => Some(DetError::ParamConfig),
            CanTpError::OperNotSupported => Some(DetError::OperNotSupported),
            CanTpError::ParamDirection { .. } => Some(DetError::ParamDirection),
            CanTpError::Busy { .. } | CanTpError::NoChannel | CanTpError::Refused => None,
        }
    }
}
