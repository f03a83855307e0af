//! Addressing, padding and length rules around the N_PCI
//!
//! The N_PCI itself is encoded by [`cantp_common::pci`]. This module knows where it sits in a
//! frame for each addressing format, which identifier and address byte belong to an N-SDU, and
//! which frame lengths are acceptable.
use cantp_common::{
    messages::{fd_frame_length, is_fd_frame_length, CanId, CLASSIC_FRAME_LENGTH, MAX_FRAME_LENGTH},
    pci::{FrameType, Pci, PciError, FC_PCI_SIZE},
    CanFrame, FrameError,
};

use crate::config::{
    normal_fixed_id, parse_normal_fixed_id, AddressingFormat, RxNSduConfig, TaType,
    TxNSduConfig,
};

/// The frame type of `frame`, read after the address byte if there is one
pub(crate) fn frame_type(frame: &CanFrame, addressing: AddressingFormat) -> Option<FrameType> {
    frame
        .data()
        .get(addressing.pci_offset())
        .and_then(|&b| FrameType::from_pci_byte(b))
}

/// The address information identifying the sender of `frame`
///
/// Used to keep a reception bound to the peer which started it.
pub(crate) fn n_ai(frame: &CanFrame, addressing: AddressingFormat) -> u16 {
    match addressing {
        AddressingFormat::Standard => 0,
        AddressingFormat::Extended | AddressingFormat::Mixed => {
            frame.data().first().copied().unwrap_or(0) as u16
        }
        AddressingFormat::NormalFixed => frame.id().raw() as u16,
    }
}

/// Check whether a received data frame (SF, FF or CF) belongs to an Rx N-SDU
///
/// `n_sa` is the runtime source address of the N-SDU.
pub(crate) fn matches_rx_data(cfg: &RxNSduConfig, n_sa: u8, frame: &CanFrame) -> bool {
    let first = frame.data().first().copied();
    match cfg.addressing {
        AddressingFormat::Standard => frame.id() == cfg.rx_id,
        AddressingFormat::Extended => frame.id() == cfg.rx_id && first == Some(cfg.n_ta),
        AddressingFormat::Mixed => frame.id() == cfg.rx_id && first == Some(cfg.n_ae),
        AddressingFormat::NormalFixed => match parse_normal_fixed_id(frame.id()) {
            Some((ta_type, ta, sa)) => {
                ta_type == cfg.ta_type
                    && ta == cfg.n_ta
                    && (sa == n_sa || cfg.generic_connection)
            }
            None => false,
        },
    }
}

/// Check whether a received flow control frame belongs to a Tx N-SDU
pub(crate) fn matches_fc(cfg: &TxNSduConfig, n_sa: u8, frame: &CanFrame) -> bool {
    let first = frame.data().first().copied();
    match cfg.addressing {
        AddressingFormat::Standard => frame.id() == cfg.fc_id,
        AddressingFormat::Extended => frame.id() == cfg.fc_id && first == Some(n_sa),
        AddressingFormat::Mixed => frame.id() == cfg.fc_id && first == Some(cfg.n_ae),
        AddressingFormat::NormalFixed => {
            frame.id() == normal_fixed_id(TaType::Physical, n_sa, cfg.n_ta)
        }
    }
}

/// Identifier and address byte of the data frames sent for a Tx N-SDU
pub(crate) fn tx_data_address(cfg: &TxNSduConfig, n_sa: u8) -> (CanId, Option<u8>) {
    match cfg.addressing {
        AddressingFormat::Standard => (cfg.tx_id, None),
        AddressingFormat::Extended => (cfg.tx_id, Some(cfg.n_ta)),
        AddressingFormat::Mixed => (cfg.tx_id, Some(cfg.n_ae)),
        AddressingFormat::NormalFixed => (normal_fixed_id(cfg.ta_type, cfg.n_ta, n_sa), None),
    }
}

/// Identifier and address byte of the flow control frames sent for an Rx N-SDU
///
/// `peer` is the source address of the data frames being acknowledged.
pub(crate) fn rx_fc_address(cfg: &RxNSduConfig, peer: u8) -> (CanId, Option<u8>) {
    match cfg.addressing {
        AddressingFormat::Standard => (cfg.fc_id, None),
        AddressingFormat::Extended => (cfg.fc_id, Some(peer)),
        AddressingFormat::Mixed => (cfg.fc_id, Some(cfg.n_ae)),
        AddressingFormat::NormalFixed => (normal_fixed_id(TaType::Physical, peer, cfg.n_ta), None),
    }
}

/// Receive rule for data frame lengths
///
/// With padding every classic frame must be 8 bytes. Frames above 8 bytes must always have a
/// CAN-FD length, and no frame may exceed the N-SDU maximum.
pub(crate) fn valid_data_length(len: usize, padding: bool, max_frame_length: usize) -> bool {
    if len > max_frame_length {
        false
    } else if len > CLASSIC_FRAME_LENGTH {
        is_fd_frame_length(len)
    } else {
        !padding || len == CLASSIC_FRAME_LENGTH
    }
}

/// Receive rule for flow control frame lengths
pub(crate) fn valid_fc_length(
    len: usize,
    addressing: AddressingFormat,
    padding: bool,
    max_frame_length: usize,
) -> bool {
    if padding {
        len == CLASSIC_FRAME_LENGTH || len == max_frame_length
    } else {
        len >= addressing.pci_offset() + FC_PCI_SIZE && len <= CLASSIC_FRAME_LENGTH
    }
}

/// Pad the first `len` bytes of `buf` out to a length that can be sent
///
/// Classic frames are padded to 8 bytes when `padding` is set. Frames above 8 bytes are always
/// rounded up to the next CAN-FD length. Returns the new length.
pub(crate) fn pad(
    buf: &mut [u8],
    len: usize,
    padding: bool,
    padding_byte: u8,
    fd_padding_byte: u8,
) -> usize {
    let (target, fill) = if len > CLASSIC_FRAME_LENGTH {
        (fd_frame_length(len).unwrap_or(len), fd_padding_byte)
    } else if padding {
        (CLASSIC_FRAME_LENGTH, padding_byte)
    } else {
        (len, padding_byte)
    };
    let target = target.min(buf.len());
    buf[len..target].fill(fill);
    target
}

/// Write the address byte, if any, and the N_PCI to the start of `buf`
///
/// Returns the offset at which the payload starts.
pub(crate) fn write_header(
    buf: &mut [u8; MAX_FRAME_LENGTH],
    address: Option<u8>,
    pci: Pci,
) -> Result<usize, PciError> {
    let offset = match address {
        Some(byte) => {
            buf[0] = byte;
            1
        }
        None => 0,
    };
    Ok(offset + pci.encode(&mut buf[offset..])?)
}

/// Wrap staged bytes into a frame of the right kind for the N-SDU
pub(crate) fn build_frame(id: CanId, fd: bool, data: &[u8]) -> Result<CanFrame, FrameError> {
    if fd {
        CanFrame::new_fd(id, data)
    } else {
        CanFrame::new(id, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: CanId, data: &[u8]) -> CanFrame {
        CanFrame::new(id, data).unwrap()
    }

    #[test]
    fn test_padding() {
        let mut buf = [0u8; 64];
        buf[..3].copy_from_slice(&[0x02, 0x10, 0x03]);
        assert_eq!(8, pad(&mut buf, 3, true, 0xAA, 0x55));
        assert_eq!([0x02, 0x10, 0x03, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA], buf[..8]);

        assert_eq!(3, pad(&mut buf, 3, false, 0xAA, 0x55));

        // FD frames round up regardless of the padding setting
        let mut buf = [0u8; 64];
        assert_eq!(12, pad(&mut buf, 10, false, 0xAA, 0x55));
        assert_eq!([0, 0, 0x55, 0x55], buf[8..12]);
        assert_eq!(0, buf[12]);
    }

    #[test]
    fn test_header_with_address_byte() {
        let mut buf = [0u8; MAX_FRAME_LENGTH];
        let n = write_header(&mut buf, Some(0x22), Pci::first(10)).unwrap();
        assert_eq!(3, n);
        assert_eq!([0x22, 0x10, 0x0A], buf[..3]);
        let n = write_header(&mut buf, None, Pci::consecutive(17)).unwrap();
        assert_eq!(1, n);
        assert_eq!(0x21, buf[0]);
    }

    #[test]
    fn test_data_length_rules() {
        assert!(valid_data_length(8, true, 8));
        assert!(!valid_data_length(5, true, 8));
        assert!(valid_data_length(5, false, 8));
        assert!(!valid_data_length(12, false, 8));
        assert!(valid_data_length(12, false, 64));
        assert!(!valid_data_length(13, false, 64));
        assert!(!valid_data_length(64, true, 32));
    }

    #[test]
    fn test_fc_length_rules() {
        assert!(valid_fc_length(3, AddressingFormat::Standard, false, 8));
        assert!(!valid_fc_length(3, AddressingFormat::Extended, false, 8));
        assert!(valid_fc_length(4, AddressingFormat::Extended, false, 8));
        assert!(!valid_fc_length(3, AddressingFormat::Standard, true, 8));
        assert!(valid_fc_length(8, AddressingFormat::Standard, true, 8));
        assert!(valid_fc_length(64, AddressingFormat::Standard, true, 64));
        assert!(!valid_fc_length(12, AddressingFormat::Standard, false, 64));
    }

    #[test]
    fn test_extended_addressing_match() {
        let cfg = RxNSduConfig {
            rx_id: CanId::std(0x600),
            addressing: AddressingFormat::Extended,
            n_ta: 0x22,
            ..RxNSduConfig::DEFAULT
        };
        assert!(matches_rx_data(&cfg, 0, &frame(CanId::std(0x600), &[0x22, 0x01, 0xAA])));
        assert!(!matches_rx_data(&cfg, 0, &frame(CanId::std(0x600), &[0x23, 0x01, 0xAA])));
        assert!(!matches_rx_data(&cfg, 0, &frame(CanId::std(0x601), &[0x22, 0x01, 0xAA])));
        assert_eq!(
            Some(FrameType::Single),
            frame_type(&frame(CanId::std(0x600), &[0x22, 0x01]), cfg.addressing)
        );
    }

    #[test]
    fn test_normal_fixed_match() {
        let cfg = RxNSduConfig {
            addressing: AddressingFormat::NormalFixed,
            n_ta: 0x10,
            n_sa: 0xF1,
            ..RxNSduConfig::DEFAULT
        };
        let from_tester = frame(CanId::extended(0x18DA_10F1), &[0x02, 0x3E, 0x00]);
        let from_other = frame(CanId::extended(0x18DA_10F2), &[0x02, 0x3E, 0x00]);
        let functional = frame(CanId::extended(0x18DB_10F1), &[0x02, 0x3E, 0x00]);
        assert!(matches_rx_data(&cfg, 0xF1, &from_tester));
        assert!(!matches_rx_data(&cfg, 0xF1, &from_other));
        assert!(!matches_rx_data(&cfg, 0xF1, &functional));

        let generic = RxNSduConfig {
            generic_connection: true,
            ..cfg
        };
        assert!(matches_rx_data(&generic, 0xF1, &from_other));
        assert_eq!(0x10F2, n_ai(&from_other, generic.addressing));
        assert_eq!(
            (CanId::extended(0x18DA_F210), None),
            rx_fc_address(&generic, 0xF2)
        );
    }

    #[test]
    fn test_normal_fixed_fc_match() {
        let cfg = TxNSduConfig {
            addressing: AddressingFormat::NormalFixed,
            n_ta: 0x10,
            ..TxNSduConfig::DEFAULT
        };
        assert_eq!(
            (CanId::extended(0x18DA_10F1), None),
            tx_data_address(&cfg, 0xF1)
        );
        assert!(matches_fc(
            &cfg,
            0xF1,
            &frame(CanId::extended(0x18DA_F110), &[0x30, 0, 0])
        ));
        assert!(!matches_fc(
            &cfg,
            0xF1,
            &frame(CanId::extended(0x18DA_10F1), &[0x30, 0, 0])
        ));
    }
}
