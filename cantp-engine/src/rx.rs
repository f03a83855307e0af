//! Reception: Single, First and Consecutive Frames in, flow control out
use cantp_common::{
    messages::{is_fd_frame_length, CLASSIC_FRAME_LENGTH, MAX_FRAME_LENGTH},
    pci::{FlowStatus, FrameType, Pci, FF_DL_12BIT_MAX, SF_DL_CLASSIC_MAX},
    BufferError, CanFrame, TpError,
};
use defmt_or_log::{debug, warn};

use crate::{
    cantp::CanTp,
    channel::{ChannelState, DataFrame, FcKind, Owner, RxState},
    codec::{build_frame, pad, rx_fc_address, write_header},
    config::{cf_payload, max_sf_payload, AddressingFormat, Duplex, RxNSduConfig, TaType},
    det::{ApiId, DetError},
    flow_control::{buffer_request_ticks, calculate_block_size, verify_block_size, wait_action, WaitAction},
    lock::{ChannelGuard, PendingFrame},
};

/// The payload of a Single Frame, if the frame is well formed for the N-SDU
fn single_frame_payload<'f>(data: &'f [u8], cfg: &RxNSduConfig) -> Option<&'f [u8]> {
    let offset = cfg.addressing.pci_offset();
    let Ok(Pci::Single { len, escape }) = Pci::parse(data.get(offset..)?) else {
        return None;
    };
    let classic = data.len() <= 8;
    // Classic frames use the one byte form, longer frames the escape form
    if escape == classic || len == 0 {
        return None;
    }
    if escape && len <= SF_DL_CLASSIC_MAX - offset {
        return None;
    }
    let start = offset + if escape { 2 } else { 1 };
    data.get(start..start + len)
}

/// The length and payload of a First Frame, if the frame is well formed for the N-SDU
///
/// A classic First Frame is 8 bytes long. A CAN-FD N-SDU accepts any CAN-FD length from 8 up to
/// its maximum. The announced length must exceed what a Single Frame of the received length could
/// carry.
fn first_frame_payload<'f>(data: &'f [u8], cfg: &RxNSduConfig) -> Option<(u32, &'f [u8])> {
    let frame_len = data.len();
    let length_ok = if cfg.is_fd() {
        is_fd_frame_length(frame_len) && frame_len <= cfg.max_frame_length
    } else {
        frame_len == CLASSIC_FRAME_LENGTH
    };
    if !length_ok {
        return None;
    }
    let offset = cfg.addressing.pci_offset();
    let pci = Pci::parse(data.get(offset..)?).ok()?;
    let Pci::First { len, escape } = pci else {
        return None;
    };
    if len as usize <= max_sf_payload(cfg.addressing, frame_len)
        || (escape && len <= FF_DL_12BIT_MAX)
    {
        return None;
    }
    Some((len, data.get(offset + pci.size()..)?))
}

impl<const CHANNELS: usize> CanTp<'_, CHANNELS> {
    /// Run a received frame on the channel it was routed to
    pub(crate) fn on_frame(&self, g: &mut ChannelGuard<'_>, pending: &PendingFrame) {
        match pending.kind {
            FrameType::Single | FrameType::First => {
                match g.owner() {
                    Some(owner) if owner == pending.owner => (),
                    None => g.set_owner(Some(pending.owner)),
                    Some(_) => {
                        debug!("Dropping frame for a reassigned channel");
                        return;
                    }
                }
                let Some((total, payload)) = self.start_frame(pending) else {
                    return;
                };
                if let ChannelState::Rx(_) = g.state() {
                    if g.rec.address_lock.is_some_and(|n_ai| n_ai != pending.n_ai) {
                        debug!("Ignoring {:?} from another peer", pending.kind);
                        return;
                    }
                    self.abort_reception(g, pending.owner);
                }
                if g.state() != ChannelState::Idle {
                    return;
                }
                if pending.kind == FrameType::Single {
                    self.receive_single(g, pending, payload);
                } else {
                    self.receive_first(g, pending, total, payload);
                }
            }
            FrameType::Consecutive => {
                if g.owner() != Some(pending.owner) || !matches!(g.state(), ChannelState::Rx(_)) {
                    return;
                }
                if g.rec.address_lock.is_some_and(|n_ai| n_ai != pending.n_ai) {
                    debug!("Ignoring CF from another peer");
                    return;
                }
                self.receive_consecutive(g, &pending.frame);
            }
            FrameType::FlowControl => {
                if g.owner() != Some(pending.owner) || !matches!(g.state(), ChannelState::Tx(_)) {
                    return;
                }
                self.receive_flow_control(g, &pending.frame);
            }
        }
    }

    /// Stop a reception replaced by a new Single or First Frame
    fn abort_reception(&self, g: &mut ChannelGuard<'_>, owner: Owner) {
        let error = match self.rx_cfg(owner.pdu).duplex {
            Duplex::Full => TpError::NotOk,
            Duplex::Half => TpError::UnexpectedPdu,
        };
        self.stop(g, Some(Err(error)));
        g.set_owner(Some(owner));
    }

    /// Source address flow control frames go back to
    fn peer_address(&self, pdu: u16, cfg: &RxNSduConfig, frame: &CanFrame) -> u8 {
        if cfg.addressing == AddressingFormat::NormalFixed && cfg.generic_connection {
            frame.id().raw() as u8
        } else {
            self.rx_params[pdu as usize].n_sa.load()
        }
    }

    /// Validate a Single or First Frame, returning the message length and the payload it carries
    fn start_frame<'f>(&self, pending: &'f PendingFrame) -> Option<(u32, &'f [u8])> {
        let cfg = self.rx_cfg(pending.owner.pdu);
        let data = pending.frame.data();
        if pending.kind == FrameType::First && cfg.ta_type == TaType::Functional {
            self.report(ApiId::RxIndication, DetError::InvalidTaType);
            return None;
        }
        let start = match pending.kind {
            FrameType::Single => single_frame_payload(data, cfg)
                .filter(|_| self.rx_frame_length_ok(pending.owner.pdu, data.len()))
                .map(|payload| (payload.len() as u32, payload)),
            _ => first_frame_payload(data, cfg),
        };
        if start.is_none() {
            self.report(ApiId::RxIndication, DetError::InvalidRxLength);
        }
        start
    }

    fn receive_single(&self, g: &mut ChannelGuard<'_>, pending: &PendingFrame, payload: &[u8]) {
        let pdu = pending.owner.pdu;
        let cfg = self.rx_cfg(pdu);
        g.rec.begin(pdu, payload.len() as u32);
        g.rec.address_lock = Some(pending.n_ai);
        g.rec.peer_address = self.peer_address(pdu, cfg, &pending.frame);
        g.rec.ticks = self.ticks(cfg.n_br_us);
        g.set_state(ChannelState::Rx(RxState::BufferRequest(DataFrame::Single)));
        self.mark_busy();

        match self.upper.start_of_reception(pdu, payload.len() as u32) {
            Ok(size) => g.rec.actual_buffer_size = size,
            Err(BufferError::Busy) => g.rec.actual_buffer_size = 0,
            Err(e) => {
                debug!("Reception of N-SDU {} refused: {:?}", pdu, e);
                self.stop(g, None);
                return;
            }
        }
        g.rec.frame[..payload.len()].copy_from_slice(payload);
        g.rec.staged_len = payload.len();
        self.retry_single(g);
    }

    pub(crate) fn retry_single(&self, g: &mut ChannelGuard<'_>) {
        match self.deliver_staged(g) {
            Ok(()) => self.stop(g, Some(Ok(()))),
            Err(BufferError::Busy) => debug!("No buffer for N-SDU {} yet", g.rec.pdu),
            Err(_) => self.stop(g, Some(Err(TpError::NotOk))),
        }
    }

    fn receive_first(
        &self,
        g: &mut ChannelGuard<'_>,
        pending: &PendingFrame,
        total: u32,
        payload: &[u8],
    ) {
        let pdu = pending.owner.pdu;
        let cfg = self.rx_cfg(pdu);
        let n_br = self.ticks(cfg.n_br_us);
        let n_ar = self.ticks(cfg.n_ar_us);
        g.rec.begin(pdu, total);
        g.rec.address_lock = Some(pending.n_ai);
        g.rec.peer_address = self.peer_address(pdu, cfg, &pending.frame);
        g.rec.rx_frame_len = pending.frame.len();
        g.rec.ff_payload = payload.len() as u32;
        g.rec.block_size = self.rx_params[pdu as usize].block_size.load();
        g.rec.wait_frame_counter = cfg.wft_max;
        g.rec.ticks = buffer_request_ticks(n_br, n_ar, cfg.wft_max);
        g.set_out_id(Some(rx_fc_address(cfg, g.rec.peer_address).0));
        g.set_state(ChannelState::Rx(RxState::BufferRequest(DataFrame::First)));
        self.mark_busy();

        match self.upper.start_of_reception(pdu, total) {
            Ok(size) => g.rec.actual_buffer_size = size,
            Err(BufferError::Busy) => g.rec.actual_buffer_size = 0,
            Err(BufferError::Overflow) => {
                debug!("N-SDU {} cannot take {} bytes", pdu, total);
                self.send_flow_control(g, FcKind::Overflow);
                return;
            }
            Err(BufferError::NotOk) => {
                debug!("Reception of N-SDU {} refused", pdu);
                self.stop(g, None);
                return;
            }
        }
        g.rec.frame[..payload.len()].copy_from_slice(payload);
        g.rec.staged_len = payload.len();
        self.retry_first(g);
    }

    /// Deliver any staged First Frame data and announce the first block once there is room
    pub(crate) fn retry_first(&self, g: &mut ChannelGuard<'_>) {
        match self.deliver_staged(g) {
            Ok(()) => self.request_block(g),
            Err(BufferError::Busy) => self.check_wait(g),
            Err(_) => self.stop(g, Some(Err(TpError::NotOk))),
        }
    }

    /// Ask the upper layer for room for the next block
    pub(crate) fn retry_consecutive(&self, g: &mut ChannelGuard<'_>) {
        match self.copy_rx(g, &[]) {
            Ok(()) => self.request_block(g),
            Err(BufferError::Busy) => self.check_wait(g),
            Err(_) => self.stop(g, Some(Err(TpError::NotOk))),
        }
    }

    fn receive_consecutive(&self, g: &mut ChannelGuard<'_>, frame: &CanFrame) {
        let state = g.state();
        if !matches!(
            state,
            ChannelState::Rx(RxState::ReceiveCf) | ChannelState::Rx(RxState::ConfirmFc(FcKind::Cts))
        ) {
            debug!("Ignoring CF in state {:?}", state);
            return;
        }
        let pdu = g.rec.pdu;
        let cfg = self.rx_cfg(pdu);
        let data = frame.data();
        let offset = cfg.addressing.pci_offset();
        let Some(Ok(Pci::Consecutive { sn })) = data.get(offset..).map(Pci::parse) else {
            return;
        };
        if sn != g.rec.sequence_number {
            warn!(
                "N-SDU {}: expected SN {}, got {}",
                pdu, g.rec.sequence_number, sn
            );
            self.stop(g, Some(Err(TpError::WrongSn)));
            return;
        }

        let start = offset + 1;
        let cf_len = cf_payload(cfg.addressing, g.rec.rx_frame_len);
        let remaining = g.rec.remaining() as usize;
        if remaining <= cf_len {
            if data.len() < start + remaining || !self.rx_frame_length_ok(pdu, data.len()) {
                self.report(ApiId::RxIndication, DetError::InvalidRxLength);
                return;
            }
            g.rec.flags.last_frame = true;
            match self.copy_rx(g, &data[start..start + remaining]) {
                Ok(()) => {
                    g.rec.processed_length += remaining as u32;
                    self.stop(g, Some(Ok(())));
                }
                Err(_) => self.stop(g, Some(Err(TpError::NotOk))),
            }
            return;
        }

        if data.len() != g.rec.rx_frame_len {
            self.report(ApiId::RxIndication, DetError::InvalidRxLength);
            return;
        }
        if self.copy_rx(g, &data[start..start + cf_len]).is_err() {
            self.stop(g, Some(Err(TpError::NotOk)));
            return;
        }
        g.rec.processed_length += cf_len as u32;
        g.rec.next_sequence_number();

        if !g.rec.count_block_frame() {
            g.rec.ticks = self.ticks(cfg.n_cr_us);
            g.set_state(ChannelState::Rx(RxState::ReceiveCf));
            return;
        }
        g.rec.processed_block_frames = 0;
        if verify_block_size(
            g.rec.remaining(),
            g.rec.actual_buffer_size,
            cf_len,
            g.rec.block_size,
        ) {
            self.send_flow_control(g, FcKind::Cts);
        } else {
            g.rec.wait_frame_counter = cfg.wft_max;
            g.rec.ticks = buffer_request_ticks(
                self.ticks(cfg.n_br_us),
                self.ticks(cfg.n_ar_us),
                cfg.wft_max,
            );
            g.set_state(ChannelState::Rx(RxState::BufferRequest(
                DataFrame::Consecutive,
            )));
            self.check_wait(g);
        }
    }

    /// Copy received payload to the upper layer, asking for its free buffer first if needed
    ///
    /// An empty `data` only refreshes the known buffer size.
    fn copy_rx(&self, g: &mut ChannelGuard<'_>, data: &[u8]) -> Result<(), BufferError> {
        let pdu = g.rec.pdu;
        if data.is_empty() || g.rec.actual_buffer_size < data.len() {
            match self.upper.copy_rx_data(pdu, &[]) {
                Ok(size) => g.rec.actual_buffer_size = size,
                Err(e) => {
                    g.rec.actual_buffer_size = 0;
                    return Err(e);
                }
            }
        }
        if data.is_empty() {
            return Ok(());
        }
        if g.rec.actual_buffer_size < data.len() {
            return Err(BufferError::Busy);
        }
        match self.upper.copy_rx_data(pdu, data) {
            Ok(size) => {
                g.rec.actual_buffer_size = size;
                Ok(())
            }
            Err(e) => {
                g.rec.actual_buffer_size = 0;
                Err(e)
            }
        }
    }

    /// Hand payload staged by a Single or First Frame to the upper layer
    fn deliver_staged(&self, g: &mut ChannelGuard<'_>) -> Result<(), BufferError> {
        let staged = g.rec.frame;
        let len = g.rec.staged_len;
        self.copy_rx(g, &staged[..len])?;
        g.rec.processed_length += len as u32;
        g.rec.staged_len = 0;
        Ok(())
    }

    /// Send CTS with a block size the buffer can take, or keep waiting
    fn request_block(&self, g: &mut ChannelGuard<'_>) {
        let cfg = self.rx_cfg(g.rec.pdu);
        let configured = self.rx_params[g.rec.pdu as usize].block_size.load();
        match calculate_block_size(
            g.rec.remaining(),
            g.rec.actual_buffer_size,
            cf_payload(cfg.addressing, g.rec.rx_frame_len),
            configured,
        ) {
            Some(block_size) => {
                g.rec.block_size = block_size;
                g.rec.processed_block_frames = 0;
                self.send_flow_control(g, FcKind::Cts);
            }
            None => self.check_wait(g),
        }
    }

    /// Apply the wait policy to a reception short of buffer
    pub(crate) fn check_wait(&self, g: &mut ChannelGuard<'_>) {
        let cfg = self.rx_cfg(g.rec.pdu);
        match wait_action(
            g.rec.ticks,
            self.ticks(cfg.n_ar_us),
            g.rec.wait_frame_counter,
        ) {
            WaitAction::Continue => (),
            WaitAction::SendWait => self.send_flow_control(g, FcKind::Wait),
            WaitAction::Overrun => self.stop(g, Some(Err(TpError::WftOverrun))),
        }
    }

    /// Send a flow control frame, or hold it back while its identifier awaits a confirmation
    pub(crate) fn send_flow_control(&self, g: &mut ChannelGuard<'_>, kind: FcKind) {
        let pdu = g.rec.pdu;
        let cfg = self.rx_cfg(pdu);
        let silent = kind == FcKind::Overflow;
        let (id, address) = rx_fc_address(cfg, g.rec.peer_address);
        g.set_out_id(Some(id));
        if !g.state().is_postponed() {
            g.rec.ticks = self.ticks(cfg.n_ar_us);
        }
        g.set_state(ChannelState::Rx(RxState::TransmitFc(kind)));
        let pci = match kind {
            FcKind::Cts => Pci::flow_control(
                FlowStatus::ClearToSend,
                g.rec.block_size,
                self.rx_params[pdu as usize].st_min.load(),
            ),
            FcKind::Wait => Pci::flow_control(FlowStatus::Wait, 0, 0),
            FcKind::Overflow => Pci::flow_control(FlowStatus::Overflow, 0, 0),
        };
        let mut buf = [0u8; MAX_FRAME_LENGTH];
        let frame = write_header(&mut buf, address, pci)
            .ok()
            .map(|len| {
                pad(
                    &mut buf,
                    len,
                    cfg.padding,
                    self.config.padding_byte,
                    self.config.fd_padding_byte,
                )
            })
            .and_then(|len| {
                // Answer a classic sender with classic frames
                let fd = g.rec.rx_frame_len > CLASSIC_FRAME_LENGTH;
                build_frame(id, fd, &buf[..len]).ok()
            });
        let Some(frame) = frame else {
            self.stop(g, (!silent).then_some(Err(TpError::NotOk)));
            return;
        };

        if !self.claim_id(g, id, ChannelState::Rx(RxState::ConfirmFc(kind))) {
            g.set_state(ChannelState::Rx(RxState::PostponedFc(kind)));
            return;
        }
        if self.driver.transmit(&frame).is_err() {
            warn!("CAN driver rejected flow control for N-SDU {}", pdu);
            self.stop(g, (!silent).then_some(Err(TpError::NotOk)));
        }
    }

    /// The CAN driver confirmed a flow control frame
    pub(crate) fn flow_control_confirmed(&self, g: &mut ChannelGuard<'_>, kind: FcKind) {
        let cfg = self.rx_cfg(g.rec.pdu);
        match kind {
            FcKind::Cts => {
                g.rec.ticks = self.ticks(cfg.n_cr_us);
                g.set_state(ChannelState::Rx(RxState::ReceiveCf));
            }
            FcKind::Wait => {
                g.rec.wait_frame_counter = g.rec.wait_frame_counter.saturating_sub(1);
                g.rec.ticks = buffer_request_ticks(
                    self.ticks(cfg.n_br_us),
                    self.ticks(cfg.n_ar_us),
                    g.rec.wait_frame_counter,
                );
                let frame = if g.rec.processed_length > g.rec.ff_payload {
                    DataFrame::Consecutive
                } else {
                    DataFrame::First
                };
                g.set_state(ChannelState::Rx(RxState::BufferRequest(frame)));
            }
            FcKind::Overflow => self.stop(g, None),
        }
    }
}
