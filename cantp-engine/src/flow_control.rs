//! Block size and separation time negotiation
use cantp_common::pci::StMin;

/// Choose the block size to announce in a flow control CTS
///
/// Returns None when the buffer cannot hold even one consecutive frame, in which case the receiver
/// has to wait.
pub(crate) fn calculate_block_size(
    remaining: u32,
    buffer: usize,
    cf_payload: usize,
    configured: u8,
) -> Option<u8> {
    if remaining as usize <= buffer {
        return Some(configured);
    }
    let frames = buffer / cf_payload.max(1);
    if frames == 0 {
        return None;
    }
    let frames = frames.min(u8::MAX as usize) as u8;
    if configured == 0 || frames < configured {
        Some(frames)
    } else {
        Some(configured)
    }
}

/// Returns true if the buffer is large enough to announce another block of `current` frames
pub(crate) fn verify_block_size(
    remaining: u32,
    buffer: usize,
    cf_payload: usize,
    current: u8,
) -> bool {
    if remaining as usize <= buffer {
        return true;
    }
    let frames = buffer / cf_payload.max(1);
    frames != 0 && frames >= current as usize
}

/// Convert a separation time to main function ticks
pub(crate) fn st_min_ticks(st_min: u8, period_us: u32, round_up: bool) -> u32 {
    let us = StMin::from_raw(st_min).as_micros();
    us.div_ceil(period_us.max(1)) + round_up as u32
}

/// What a receiver waiting for buffer should do on this tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitAction {
    /// Keep waiting
    Continue,
    /// Send a flow control WAIT to hold the sender off
    SendWait,
    /// No wait frames left and the time is up
    Overrun,
}

pub(crate) fn wait_action(ticks: u32, n_ar_ticks: u32, wait_frames_left: u8) -> WaitAction {
    if wait_frames_left > 0 {
        if ticks <= n_ar_ticks {
            WaitAction::SendWait
        } else {
            WaitAction::Continue
        }
    } else if ticks == 0 {
        WaitAction::Overrun
    } else {
        WaitAction::Continue
    }
}

/// Ticks allowed for a buffer request: N_Br, plus N_Ar if a wait frame may have to be sent
pub(crate) fn buffer_request_ticks(n_br_ticks: u32, n_ar_ticks: u32, wait_frames_left: u8) -> u32 {
    if wait_frames_left > 0 {
        n_br_ticks + n_ar_ticks
    } else {
        n_br_ticks
    }
}
