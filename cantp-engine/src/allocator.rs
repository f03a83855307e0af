//! Mapping frames and requests to N-SDUs and channels
use cantp_common::{pci::FrameType, CanFrame};

use crate::{
    cantp::CanTp,
    channel::Owner,
    codec::{frame_type, matches_fc, matches_rx_data, n_ai},
    lock::{ChannelGuard, PendingFrame},
};

/// Result of looking for a channel for an N-SDU
pub(crate) enum Allocation<'c> {
    /// A channel already works for the N-SDU
    Existing(usize),
    /// A free channel was locked and assigned to the N-SDU
    Claimed(ChannelGuard<'c>),
    /// All channels are in use
    Exhausted,
}

impl<const CHANNELS: usize> CanTp<'_, CHANNELS> {
    /// Find the N-SDU a received frame belongs to
    ///
    /// Flow control frames are matched against the Tx N-SDUs, everything else against the Rx
    /// N-SDUs, so a peer may use one identifier for both its requests and its flow control.
    pub(crate) fn lookup_frame(&self, frame: &CanFrame) -> Option<PendingFrame> {
        let rx = self.config.rx_nsdus.iter().zip(self.rx_params.iter());
        for (pdu, (cfg, params)) in rx.enumerate() {
            if !matches_rx_data(cfg, params.n_sa.load(), frame) {
                continue;
            }
            match frame_type(frame, cfg.addressing) {
                Some(kind @ (FrameType::Single | FrameType::First | FrameType::Consecutive)) => {
                    return Some(PendingFrame {
                        owner: Owner::rx(pdu as u16),
                        kind,
                        frame: *frame,
                        n_ai: n_ai(frame, cfg.addressing),
                    });
                }
                _ => continue,
            }
        }

        let tx = self.config.tx_nsdus.iter().zip(self.tx_params.iter());
        for (pdu, (cfg, params)) in tx.enumerate() {
            if matches_fc(cfg, params.n_sa.load(), frame)
                && frame_type(frame, cfg.addressing) == Some(FrameType::FlowControl)
            {
                return Some(PendingFrame {
                    owner: Owner::tx(pdu as u16),
                    kind: FrameType::FlowControl,
                    frame: *frame,
                    n_ai: n_ai(frame, cfg.addressing),
                });
            }
        }
        None
    }

    /// The index of the channel working for `owner`, if any
    pub(crate) fn find_channel(&self, owner: Owner) -> Option<usize> {
        self.channels
            .iter()
            .position(|c| c.owner() == Some(owner))
    }

    /// Find the channel working for `owner`, or claim a free one for it
    ///
    /// Runs in one critical section, so two contexts cannot claim channels for the same N-SDU.
    pub(crate) fn allocate(&self, owner: Owner) -> Allocation<'_> {
        critical_section::with(|_| {
            if let Some(idx) = self.find_channel(owner) {
                return Allocation::Existing(idx);
            }
            self.channels
                .iter()
                .find_map(|c| c.claim(owner))
                .map_or(Allocation::Exhausted, Allocation::Claimed)
        })
    }
}
