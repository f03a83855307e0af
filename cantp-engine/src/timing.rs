//! Main function ticks: protocol timers, separation time and retries
use cantp_common::TpError;

use crate::{
    cantp::CanTp,
    channel::{ChannelState, DataFrame, FcKind, RxState, TxState},
    lock::ChannelGuard,
    tx::Staging,
};

impl<const CHANNELS: usize> CanTp<'_, CHANNELS> {
    /// Advance the channel timers by `ticks` main function periods
    ///
    /// Zero ticks only retries pending work.
    pub(crate) fn on_tick(&self, g: &mut ChannelGuard<'_>, ticks: u32) {
        if ticks == 0 {
            self.poll(g);
            return;
        }
        for _ in 0..ticks {
            let state = g.state();
            if state == ChannelState::Idle {
                return;
            }
            if matches!(
                state,
                ChannelState::Tx(TxState::WaitStMin) | ChannelState::Tx(TxState::StagedCf)
            ) {
                g.rec.st_min_ticks = g.rec.st_min_ticks.saturating_sub(1);
            }
            if g.rec.ticks > 0 {
                g.rec.ticks -= 1;
                if g.rec.ticks == 0 {
                    self.on_timeout(g);
                    continue;
                }
            }
            self.poll(g);
        }
    }

    fn on_timeout(&self, g: &mut ChannelGuard<'_>) {
        let result = match g.state() {
            ChannelState::Idle => return,
            ChannelState::Rx(
                RxState::TransmitFc(FcKind::Overflow)
                | RxState::ConfirmFc(FcKind::Overflow)
                | RxState::PostponedFc(FcKind::Overflow),
            ) => None,
            ChannelState::Rx(
                RxState::TransmitFc(_) | RxState::ConfirmFc(_) | RxState::PostponedFc(_),
            ) => Some(Err(TpError::TimeoutA)),
            ChannelState::Rx(RxState::ReceiveCf) => Some(Err(TpError::TimeoutCr)),
            ChannelState::Rx(RxState::BufferRequest(DataFrame::Single)) => {
                Some(Err(TpError::NotOk))
            }
            ChannelState::Rx(RxState::BufferRequest(_)) => {
                self.check_wait(g);
                return;
            }
            ChannelState::Tx(TxState::Confirm(_) | TxState::Postponed(_)) => {
                Some(Err(TpError::TimeoutA))
            }
            ChannelState::Tx(TxState::ReceiveFc) => Some(Err(TpError::TimeoutBs)),
            ChannelState::Tx(
                TxState::BufferRequest(_) | TxState::WaitStMin | TxState::StagedCf,
            ) => Some(Err(TpError::NotOk)),
        };
        self.stop(g, result);
    }

    /// Retry whatever the channel is waiting on: buffer, data, a busy identifier or STmin
    fn poll(&self, g: &mut ChannelGuard<'_>) {
        match g.state() {
            ChannelState::Rx(RxState::BufferRequest(DataFrame::Single)) => self.retry_single(g),
            ChannelState::Rx(RxState::BufferRequest(DataFrame::First)) => self.retry_first(g),
            ChannelState::Rx(RxState::BufferRequest(DataFrame::Consecutive)) => {
                self.retry_consecutive(g)
            }
            ChannelState::Rx(RxState::PostponedFc(kind)) => self.send_flow_control(g, kind),
            ChannelState::Tx(TxState::BufferRequest(kind)) => self.fill_and_send(g, kind),
            ChannelState::Tx(TxState::Postponed(kind)) => self.send_staged(g, kind),
            ChannelState::Tx(TxState::WaitStMin) => {
                if g.rec.st_min_ticks == 0 {
                    g.set_state(ChannelState::Tx(TxState::BufferRequest(
                        DataFrame::Consecutive,
                    )));
                    self.fill_and_send(g, DataFrame::Consecutive);
                } else if self.stage_frame(g, DataFrame::Consecutive) == Staging::Ready {
                    g.set_state(ChannelState::Tx(TxState::StagedCf));
                }
            }
            ChannelState::Tx(TxState::StagedCf) if g.rec.st_min_ticks == 0 => {
                self.send_staged(g, DataFrame::Consecutive)
            }
            _ => (),
        }
    }
}
