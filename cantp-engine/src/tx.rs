//! Transmission: data frames out, flow control in
use cantp_common::{
    messages::MAX_FRAME_LENGTH,
    pci::{FlowStatus, Pci, StMin, SF_DL_CLASSIC_MAX},
    BufferError, CanFrame, PduId, TpError,
};
use defmt_or_log::{debug, warn};

use crate::{
    cantp::{CanTp, ST_MIN_FROM_FC},
    channel::{ChannelState, DataFrame, RxState, TxState},
    codec::{build_frame, pad, tx_data_address, write_header},
    config::cf_payload,
    flow_control::st_min_ticks,
    lock::ChannelGuard,
};

/// Outcome of preparing the next data frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Staging {
    /// The frame is in the channel record, ready to go
    Ready,
    /// The upper layer has no data yet
    Busy,
    /// The transmission was stopped
    Failed,
}

impl<const CHANNELS: usize> CanTp<'_, CHANNELS> {
    /// Set up a claimed channel for a new message and send its first frame if the data is there
    pub(crate) fn start_transmission(&self, g: &mut ChannelGuard<'_>, pdu: PduId, length: u32) {
        let cfg = self.tx_cfg(pdu);
        let n_sa = self.tx_params[pdu as usize].n_sa.load();
        g.rec.begin(pdu, length);
        g.set_out_id(Some(tx_data_address(cfg, n_sa).0));
        let kind = if length as usize <= cfg.max_sf_payload() {
            DataFrame::Single
        } else {
            DataFrame::First
        };
        debug!("Transmitting {} bytes on N-SDU {} as {:?}", length, pdu, kind);
        g.rec.ticks = self.ticks(cfg.n_cs_us);
        g.set_state(ChannelState::Tx(TxState::BufferRequest(kind)));
        self.mark_busy();
        self.fill_and_send(g, kind);
    }

    /// Build the next data frame in the channel record, pulling its payload from the upper layer
    ///
    /// A frame already staged is kept as is.
    pub(crate) fn stage_frame(&self, g: &mut ChannelGuard<'_>, kind: DataFrame) -> Staging {
        if g.rec.staged_len > 0 {
            return Staging::Ready;
        }
        let pdu = g.rec.pdu;
        let cfg = self.tx_cfg(pdu);
        let (_, address) = tx_data_address(cfg, self.tx_params[pdu as usize].n_sa.load());
        let offset = cfg.addressing.pci_offset();
        let total = g.rec.total_length;
        let (pci, payload) = match kind {
            DataFrame::Single => (
                Pci::single(
                    total as usize,
                    cfg.is_fd() && total as usize > SF_DL_CLASSIC_MAX - offset,
                ),
                total as usize,
            ),
            DataFrame::First => {
                let pci = Pci::first(total);
                (pci, cfg.max_frame_length - offset - pci.size())
            }
            DataFrame::Consecutive => (
                Pci::consecutive(g.rec.sequence_number),
                (g.rec.remaining() as usize).min(cf_payload(cfg.addressing, cfg.max_frame_length)),
            ),
        };

        let mut buf = [0u8; MAX_FRAME_LENGTH];
        let Ok(header) = write_header(&mut buf, address, pci) else {
            self.stop(g, Some(Err(TpError::NotOk)));
            return Staging::Failed;
        };
        match self
            .upper
            .copy_tx_data(pdu, &mut buf[header..header + payload])
        {
            Ok(_) => (),
            Err(BufferError::Busy) => return Staging::Busy,
            Err(e) => {
                warn!("Upper layer refused data for N-SDU {}: {:?}", pdu, e);
                self.stop(g, Some(Err(TpError::NotOk)));
                return Staging::Failed;
            }
        }
        let len = pad(
            &mut buf,
            header + payload,
            cfg.padding,
            self.config.padding_byte,
            self.config.fd_padding_byte,
        );
        g.rec.frame = buf;
        g.rec.frame_len = len;
        g.rec.staged_len = payload;
        Staging::Ready
    }

    /// Stage the next frame and send it if the data was available
    pub(crate) fn fill_and_send(&self, g: &mut ChannelGuard<'_>, kind: DataFrame) {
        match self.stage_frame(g, kind) {
            Staging::Ready => self.send_staged(g, kind),
            Staging::Busy => debug!("No data for N-SDU {} yet", g.rec.pdu),
            Staging::Failed => (),
        }
    }

    /// Hand the staged frame to the CAN driver, or hold it back while its identifier is busy
    pub(crate) fn send_staged(&self, g: &mut ChannelGuard<'_>, kind: DataFrame) {
        let pdu = g.rec.pdu;
        let cfg = self.tx_cfg(pdu);
        let Some(id) = g.out_id() else {
            self.stop(g, Some(Err(TpError::NotOk)));
            return;
        };
        if !g.state().is_postponed() {
            g.rec.ticks = self.ticks(cfg.n_as_us);
        }
        let frame = match build_frame(id, cfg.is_fd(), &g.rec.frame[..g.rec.frame_len]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot build frame for N-SDU {}: {:?}", pdu, e);
                self.stop(g, Some(Err(TpError::NotOk)));
                return;
            }
        };
        // Set before transmitting, a driver may confirm from within transmit
        if !self.claim_id(g, id, ChannelState::Tx(TxState::Confirm(kind))) {
            g.set_state(ChannelState::Tx(TxState::Postponed(kind)));
            return;
        }
        g.rec.processed_length += g.rec.staged_len as u32;
        g.rec.staged_len = 0;
        if kind == DataFrame::Consecutive {
            g.rec.next_sequence_number();
            g.rec.count_block_frame();
        }
        if self.driver.transmit(&frame).is_err() {
            warn!("CAN driver rejected frame for N-SDU {}", pdu);
            self.stop(g, Some(Err(TpError::NotOk)));
        }
    }

    /// The CAN driver confirmed the frame the channel was waiting on
    pub(crate) fn on_tx_confirmation(&self, g: &mut ChannelGuard<'_>) {
        match g.state() {
            ChannelState::Tx(TxState::Confirm(DataFrame::Single)) => self.stop(g, Some(Ok(()))),
            ChannelState::Tx(TxState::Confirm(DataFrame::First)) => {
                let cfg = self.tx_cfg(g.rec.pdu);
                if core::mem::take(&mut g.rec.flags.fc_received) {
                    g.rec.ticks = self.ticks(cfg.n_cs_us);
                    g.set_state(ChannelState::Tx(TxState::BufferRequest(
                        DataFrame::Consecutive,
                    )));
                    self.fill_and_send(g, DataFrame::Consecutive);
                } else {
                    g.rec.ticks = self.ticks(cfg.n_bs_us);
                    g.set_state(ChannelState::Tx(TxState::ReceiveFc));
                }
            }
            ChannelState::Tx(TxState::Confirm(DataFrame::Consecutive)) => {
                self.consecutive_confirmed(g)
            }
            ChannelState::Rx(RxState::ConfirmFc(kind)) => {
                self.flow_control_confirmed(g, kind)
            }
            state => debug!("Ignoring confirmation in state {:?}", state),
        }
    }

    fn consecutive_confirmed(&self, g: &mut ChannelGuard<'_>) {
        let pdu = g.rec.pdu;
        let cfg = self.tx_cfg(pdu);
        if g.rec.remaining() == 0 {
            self.stop(g, Some(Ok(())));
            return;
        }
        if g.rec.block_complete() {
            g.rec.ticks = self.ticks(cfg.n_bs_us);
            g.set_state(ChannelState::Tx(TxState::ReceiveFc));
            return;
        }

        let st_min = match self.tx_params[pdu as usize].st_min.load() {
            ST_MIN_FROM_FC => g.rec.last_fc_st_min,
            value => value,
        };
        g.rec.st_min = st_min;
        g.rec.flags.fc_received = false;
        if st_min == 0 {
            g.rec.ticks = self.ticks(cfg.n_cs_us);
            g.set_state(ChannelState::Tx(TxState::BufferRequest(
                DataFrame::Consecutive,
            )));
            self.fill_and_send(g, DataFrame::Consecutive);
            return;
        }

        let round_up = core::mem::take(&mut g.rec.flags.st_min_round_up);
        g.rec.st_min_ticks = st_min_ticks(st_min, self.config.main_function_period_us, round_up);
        g.rec.ticks = self.ticks(cfg.n_cs_us) + g.rec.st_min_ticks;
        g.set_state(ChannelState::Tx(TxState::WaitStMin));
        // Fetch the payload now so the frame can go as soon as STmin is over
        if self.stage_frame(g, DataFrame::Consecutive) == Staging::Ready {
            g.set_state(ChannelState::Tx(TxState::StagedCf));
        }
    }

    /// A flow control frame arrived for the transmission on this channel
    pub(crate) fn receive_flow_control(&self, g: &mut ChannelGuard<'_>, frame: &CanFrame) {
        let pdu = g.rec.pdu;
        let cfg = self.tx_cfg(pdu);
        let state = g.state();
        let expected = match state {
            ChannelState::Tx(TxState::ReceiveFc)
            | ChannelState::Tx(TxState::Confirm(DataFrame::First)) => true,
            ChannelState::Tx(TxState::Confirm(DataFrame::Consecutive)) => {
                g.rec.block_complete() && g.rec.remaining() > 0
            }
            _ => false,
        };
        if !expected {
            debug!("Ignoring flow control in state {:?}", state);
            return;
        }
        let offset = cfg.addressing.pci_offset();
        let Some(Ok(Pci::FlowControl {
            status,
            block_size,
            st_min,
        })) = frame.data().get(offset..).map(Pci::parse)
        else {
            return;
        };

        match status {
            FlowStatus::ClearToSend => {
                let fc_st_min = StMin::from_raw(st_min).raw();
                g.rec.processed_block_frames = 0;
                g.rec.block_size = block_size;
                g.rec.last_fc_st_min = fc_st_min;
                g.rec.st_min = match self.tx_params[pdu as usize].st_min.load() {
                    ST_MIN_FROM_FC => fc_st_min,
                    value => value,
                };
                g.rec.flags.st_min_round_up = g.rec.st_min != 0;
                if state == ChannelState::Tx(TxState::ReceiveFc) {
                    g.rec.ticks = self.ticks(cfg.n_cs_us);
                    g.set_state(ChannelState::Tx(TxState::BufferRequest(
                        DataFrame::Consecutive,
                    )));
                    self.fill_and_send(g, DataFrame::Consecutive);
                } else {
                    // Sent as soon as the pending confirmation arrives
                    g.rec.flags.fc_received = true;
                }
            }
            FlowStatus::Wait => {
                if state == ChannelState::Tx(TxState::ReceiveFc) {
                    g.rec.ticks = self.ticks(cfg.n_bs_us);
                }
            }
            FlowStatus::Overflow => self.stop(g, Some(Err(TpError::NoBuffer))),
            FlowStatus::Reserved(value) => {
                warn!("Reserved flow status {} for N-SDU {}", value, pdu);
                self.stop(g, Some(Err(TpError::InvalidFs)));
            }
        }
    }
}
