//! Static configuration of the transport engine
//!
//! A [`CanTpConfig`] borrows one table of receive N-SDUs and one of transmit N-SDUs. An N-SDU is
//! identified by its index in its table, so the tables are usually declared as statics next to the
//! code that feeds the upper layer:
//!
//! ```
//! use cantp_engine::config::{AddressingFormat, CanTpConfig, RxNSduConfig, TxNSduConfig};
//! use cantp_engine::common::CanId;
//!
//! static RX: [RxNSduConfig; 1] = [RxNSduConfig {
//!     rx_id: CanId::std(0x7E0),
//!     fc_id: CanId::std(0x7E8),
//!     ..RxNSduConfig::DEFAULT
//! }];
//! static TX: [TxNSduConfig; 1] = [TxNSduConfig {
//!     tx_id: CanId::std(0x7E8),
//!     fc_id: CanId::std(0x7E0),
//!     addressing: AddressingFormat::Standard,
//!     ..TxNSduConfig::DEFAULT
//! }];
//! static CONFIG: CanTpConfig = CanTpConfig::new(&RX, &TX, 1000);
//! assert!(CONFIG.validate().is_ok());
//! ```
use cantp_common::{
    messages::{is_fd_frame_length, CanId, CLASSIC_FRAME_LENGTH, MAX_FRAME_LENGTH},
    pci::{SF_DL_CLASSIC_MAX, SF_ESC_PCI_SIZE, SF_PCI_SIZE},
};
use snafu::Snafu;

/// The maximum number of N-SDUs in each of the Rx and Tx tables
pub const MAX_NSDUS: usize = 32;

/// Base identifier of a physically addressed NormalFixed frame, `0x18DA_TA_SA`
pub const NORMAL_FIXED_PHYSICAL: u32 = 0x18DA_0000;
/// Base identifier of a functionally addressed NormalFixed frame, `0x18DB_TA_SA`
pub const NORMAL_FIXED_FUNCTIONAL: u32 = 0x18DB_0000;
const NORMAL_FIXED_MASK: u32 = 0x1FFF_0000;

/// How the N_AI of an N-SDU is mapped onto the CAN identifier and the first data byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressingFormat {
    /// The CAN identifier alone identifies the N-SDU
    Standard,
    /// The first data byte carries N_TA (data frames) or N_SA (flow control)
    Extended,
    /// The first data byte carries N_AE
    Mixed,
    /// N_TA and N_SA are encoded in a 29-bit identifier, `0x18DA_TA_SA` or `0x18DB_TA_SA`
    NormalFixed,
}

impl AddressingFormat {
    /// Number of address bytes in front of the N_PCI
    pub const fn pci_offset(self) -> usize {
        match self {
            AddressingFormat::Standard | AddressingFormat::NormalFixed => 0,
            AddressingFormat::Extended | AddressingFormat::Mixed => 1,
        }
    }

    /// Returns true if the format carries an N_SA which can be changed at runtime
    pub const fn has_n_sa(self) -> bool {
        matches!(
            self,
            AddressingFormat::Extended | AddressingFormat::NormalFixed
        )
    }
}

/// Physical (one to one) or functional (one to many) target addressing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaType {
    /// Point to point; segmented messages allowed
    Physical,
    /// Broadcast; only single frames are allowed
    Functional,
}

impl TaType {
    pub(crate) const fn normal_fixed_base(self) -> u32 {
        match self {
            TaType::Physical => NORMAL_FIXED_PHYSICAL,
            TaType::Functional => NORMAL_FIXED_FUNCTIONAL,
        }
    }
}

/// What happens to a reception in progress when a new Single or First Frame arrives for it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Duplex {
    /// The old reception is reported with [`TpError::NotOk`](crate::common::TpError::NotOk)
    Full,
    /// The old reception is reported with
    /// [`TpError::UnexpectedPdu`](crate::common::TpError::UnexpectedPdu)
    Half,
}

/// Configuration of one receive N-SDU
#[derive(Clone, Copy, Debug)]
pub struct RxNSduConfig {
    /// Identifier of the incoming data frames
    ///
    /// Ignored for [`AddressingFormat::NormalFixed`], where the identifier is derived from
    /// `n_ta` and `n_sa`.
    pub rx_id: CanId,
    /// Identifier of the flow control frames sent back to the peer
    ///
    /// Ignored for [`AddressingFormat::NormalFixed`].
    pub fc_id: CanId,
    /// Addressing format
    pub addressing: AddressingFormat,
    /// Target address type
    pub ta_type: TaType,
    /// Source address of the peer; carried in flow control frames for Extended addressing
    pub n_sa: u8,
    /// Our own address; expected in front of data frames for Extended addressing
    pub n_ta: u8,
    /// Address extension for Mixed addressing
    pub n_ae: u8,
    /// N_Ar: time for a flow control frame to be confirmed, in microseconds
    pub n_ar_us: u32,
    /// N_Br: time until the next flow control frame is sent, in microseconds
    pub n_br_us: u32,
    /// N_Cr: time until the next consecutive frame is received, in microseconds
    pub n_cr_us: u32,
    /// Block size sent in flow control frames; 0 for no limit
    pub block_size: u8,
    /// Separation time sent in flow control frames, raw STmin encoding
    pub st_min: u8,
    /// Maximum number of wait frames sent in a row
    pub wft_max: u8,
    /// Pad frames to the full length
    pub padding: bool,
    /// Largest data length of a frame; above 8 the N-SDU uses CAN-FD
    pub max_frame_length: usize,
    /// Handling of a new reception while one is in progress
    pub duplex: Duplex,
    /// Accept data frames from any source address (NormalFixed only)
    pub generic_connection: bool,
}

impl RxNSduConfig {
    /// A classic CAN, physically addressed N-SDU with 1 second timers
    pub const DEFAULT: RxNSduConfig = RxNSduConfig {
        rx_id: CanId::std(0),
        fc_id: CanId::std(0),
        addressing: AddressingFormat::Standard,
        ta_type: TaType::Physical,
        n_sa: 0,
        n_ta: 0,
        n_ae: 0,
        n_ar_us: 1_000_000,
        n_br_us: 100_000,
        n_cr_us: 1_000_000,
        block_size: 0,
        st_min: 0,
        wft_max: 0,
        padding: true,
        max_frame_length: CLASSIC_FRAME_LENGTH,
        duplex: Duplex::Full,
        generic_connection: false,
    };

    /// Returns true if frames of this N-SDU are sent as CAN-FD
    pub fn is_fd(&self) -> bool {
        self.max_frame_length > CLASSIC_FRAME_LENGTH
    }

    /// The largest payload a Single Frame can carry on this N-SDU
    pub fn max_sf_payload(&self) -> usize {
        max_sf_payload(self.addressing, self.max_frame_length)
    }
}

impl Default for RxNSduConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Configuration of one transmit N-SDU
#[derive(Clone, Copy, Debug)]
pub struct TxNSduConfig {
    /// Identifier of the outgoing data frames
    ///
    /// Ignored for [`AddressingFormat::NormalFixed`].
    pub tx_id: CanId,
    /// Identifier of the flow control frames received from the peer
    ///
    /// Ignored for [`AddressingFormat::NormalFixed`].
    pub fc_id: CanId,
    /// Addressing format
    pub addressing: AddressingFormat,
    /// Target address type
    pub ta_type: TaType,
    /// Our own address; expected in front of flow control frames for Extended addressing
    pub n_sa: u8,
    /// Address of the peer; sent in front of data frames for Extended addressing
    pub n_ta: u8,
    /// Address extension for Mixed addressing
    pub n_ae: u8,
    /// N_As: time for a data frame to be confirmed, in microseconds
    pub n_as_us: u32,
    /// N_Bs: time until a flow control frame is received, in microseconds
    pub n_bs_us: u32,
    /// N_Cs: time until the next consecutive frame is sent, in microseconds
    pub n_cs_us: u32,
    /// Pad frames to the full length
    pub padding: bool,
    /// Largest data length of a frame; above 8 the N-SDU uses CAN-FD
    pub max_frame_length: usize,
}

impl TxNSduConfig {
    /// A classic CAN, physically addressed N-SDU with 1 second timers
    pub const DEFAULT: TxNSduConfig = TxNSduConfig {
        tx_id: CanId::std(0),
        fc_id: CanId::std(0),
        addressing: AddressingFormat::Standard,
        ta_type: TaType::Physical,
        n_sa: 0,
        n_ta: 0,
        n_ae: 0,
        n_as_us: 1_000_000,
        n_bs_us: 1_000_000,
        n_cs_us: 100_000,
        padding: true,
        max_frame_length: CLASSIC_FRAME_LENGTH,
    };

    /// Returns true if frames of this N-SDU are sent as CAN-FD
    pub fn is_fd(&self) -> bool {
        self.max_frame_length > CLASSIC_FRAME_LENGTH
    }

    /// The largest payload a Single Frame can carry on this N-SDU
    pub fn max_sf_payload(&self) -> usize {
        max_sf_payload(self.addressing, self.max_frame_length)
    }
}

impl Default for TxNSduConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

pub(crate) fn max_sf_payload(addressing: AddressingFormat, max_frame_length: usize) -> usize {
    let offset = addressing.pci_offset();
    if max_frame_length > CLASSIC_FRAME_LENGTH {
        max_frame_length - offset - SF_ESC_PCI_SIZE
    } else {
        SF_DL_CLASSIC_MAX - offset
    }
}

/// Error in a [`CanTpConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The main function period is zero
    #[snafu(display("Main function period must be non-zero"))]
    ZeroPeriod,
    /// A table holds more than [`MAX_NSDUS`] entries
    #[snafu(display("{len} N-SDUs configured, at most {MAX_NSDUS} supported"))]
    TooManyNSdus {
        /// The table length
        len: usize,
    },
    /// An N-SDU has a maximum frame length which is not 8 or a CAN-FD length
    #[snafu(display("N-SDU {index} has invalid maximum frame length {len}"))]
    InvalidFrameLength {
        /// Index of the N-SDU in its table
        index: usize,
        /// The configured length
        len: usize,
    },
}

/// The complete engine configuration
#[derive(Clone, Copy, Debug)]
pub struct CanTpConfig<'a> {
    /// Receive N-SDUs; an Rx [`PduId`](crate::common::PduId) is an index into this table
    pub rx_nsdus: &'a [RxNSduConfig],
    /// Transmit N-SDUs; a Tx [`PduId`](crate::common::PduId) is an index into this table
    pub tx_nsdus: &'a [TxNSduConfig],
    /// Interval between calls to [`CanTp::main_function`](crate::CanTp::main_function)
    pub main_function_period_us: u32,
    /// Fill byte for classic frames when padding is enabled
    pub padding_byte: u8,
    /// Fill byte used to reach a valid CAN-FD length
    pub fd_padding_byte: u8,
}

impl<'a> CanTpConfig<'a> {
    /// Create a configuration with `0xCC` padding
    pub const fn new(
        rx_nsdus: &'a [RxNSduConfig],
        tx_nsdus: &'a [TxNSduConfig],
        main_function_period_us: u32,
    ) -> Self {
        Self {
            rx_nsdus,
            tx_nsdus,
            main_function_period_us,
            padding_byte: 0xCC,
            fd_padding_byte: 0xCC,
        }
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.main_function_period_us == 0 {
            return ZeroPeriodSnafu.fail();
        }
        for len in [self.rx_nsdus.len(), self.tx_nsdus.len()] {
            if len > MAX_NSDUS {
                return TooManyNSdusSnafu { len }.fail();
            }
        }
        let rx = self.rx_nsdus.iter().map(|c| c.max_frame_length);
        let tx = self.tx_nsdus.iter().map(|c| c.max_frame_length);
        for (index, len) in rx.enumerate().chain(tx.enumerate()) {
            if !valid_max_frame_length(len) {
                return InvalidFrameLengthSnafu { index, len }.fail();
            }
        }
        Ok(())
    }

    /// Convert a duration to main function ticks, rounding up, with a minimum of one tick
    pub fn ticks(&self, us: u32) -> u32 {
        us.div_ceil(self.main_function_period_us.max(1)).max(1)
    }
}

fn valid_max_frame_length(len: usize) -> bool {
    len == CLASSIC_FRAME_LENGTH || (len <= MAX_FRAME_LENGTH && is_fd_frame_length(len))
}

/// Payload bytes carried by a full Consecutive Frame
pub(crate) fn cf_payload(addressing: AddressingFormat, frame_length: usize) -> usize {
    frame_length.saturating_sub(addressing.pci_offset() + SF_PCI_SIZE)
}

/// The identifier of a NormalFixed frame from `sa` to `ta`
pub(crate) fn normal_fixed_id(ta_type: TaType, ta: u8, sa: u8) -> CanId {
    CanId::extended(ta_type.normal_fixed_base() | (ta as u32) << 8 | sa as u32)
}

/// Split a NormalFixed identifier into (TA type, TA, SA)
pub(crate) fn parse_normal_fixed_id(id: CanId) -> Option<(TaType, u8, u8)> {
    let CanId::Extended(raw) = id else {
        return None;
    };
    let ta_type = match raw & NORMAL_FIXED_MASK {
        NORMAL_FIXED_PHYSICAL => TaType::Physical,
        NORMAL_FIXED_FUNCTIONAL => TaType::Functional,
        _ => return None,
    };
    Some((ta_type, (raw >> 8) as u8, raw as u8))
}
